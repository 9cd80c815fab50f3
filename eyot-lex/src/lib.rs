#![forbid(unsafe_code)]

//! Byte stream to token stream, with the statement-terminator insertion
//! that lets Eyot sources omit most semicolons.

mod lexer;
mod token;

pub use lexer::{tokenize, LexError};
pub use token::{Token, TokenKind};
