#![forbid(unsafe_code)]

//! The C back end: lowers an analyzed [`eyot_core::Program`] to a single
//! C99 translation unit, with the OpenCL C device unit embedded as a
//! string constant when the program requires the GPU.

mod emit;
pub mod names;
mod writer;

pub use emit::write_program;
pub use writer::Writer;
