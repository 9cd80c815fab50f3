#![forbid(unsafe_code)]

//! Generated C symbol naming. The scheme keeps user symbols from
//! different modules apart while passing runtime and FFI names through
//! untouched.

use eyot_ast::{FunctionId, StructId};

/// Dashes are legal in module names but not in C identifiers.
fn escape_module_part(part: &str) -> String {
    part.replace('-', "_")
}

fn struct_namespace(sid: &StructId) -> String {
    let mut out = String::new();
    for (i, part) in sid.module.parts().iter().enumerate() {
        if i > 0 {
            out.push('_');
        }
        out.push_str(&escape_module_part(part));
    }
    out.push_str("__");
    out.push_str(&sid.name);
    out
}

/// Shared stem for everything derived from a function id. Builtin-module
/// names pass through; struct-bound functions are namespaced by their
/// struct, which carries the module.
fn function_core(fid: &FunctionId) -> String {
    if fid.struct_id.is_blank() {
        if fid.module.is_builtin() {
            fid.name.clone()
        } else {
            format!("{}___unbound___{}", fid.module.namespace(), fid.name)
        }
    } else {
        format!("{}___bound___{}", struct_namespace(&fid.struct_id), fid.name)
    }
}

pub fn function_id(fid: &FunctionId) -> String {
    format!("ey_function_{}", function_core(fid))
}

pub fn function_caller_id(fid: &FunctionId) -> String {
    format!("ey_function_caller_{}", function_core(fid))
}

pub fn central_function_caller() -> &'static str {
    "ey_functioncaller"
}

/// The enum constant naming a function in the shared id table.
pub fn function_enum_id(fid: &FunctionId) -> String {
    format!("k_ey_function_{}", function_core(fid))
}

pub fn struct_name(sid: &StructId) -> String {
    if sid.module.is_builtin() {
        sid.name.clone()
    } else {
        format!("ey_struct_{}", struct_namespace(sid))
    }
}

pub fn closure_arg_size() -> &'static str {
    "ey_generated_closure_arg_size"
}

pub fn function_enum_type() -> &'static str {
    "EyRuntimeFunctionList"
}

pub fn string_pool_utf32(i: usize) -> String {
    format!("ey_string_pool_raw_u32_{i}")
}

pub fn string_pool() -> &'static str {
    "ey_string_pool_raw"
}

pub fn string_pool_get() -> &'static str {
    "ey_runtime_string_get"
}

pub fn execution_context() -> &'static str {
    "ey_execution_context"
}

pub fn use_string_literal() -> &'static str {
    "ey_runtime_string_use_literal"
}

pub fn worker_function_type() -> &'static str {
    "EyWorkerFunction"
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyot_ast::ModuleId;

    #[test]
    fn free_functions_carry_their_module() {
        let fid = FunctionId::free(ModuleId::single("main"), "go");
        assert_eq!(function_id(&fid), "ey_function_main___unbound___go");
        assert_eq!(function_enum_id(&fid), "k_ey_function_main___unbound___go");
    }

    #[test]
    fn builtin_names_pass_through() {
        let fid = FunctionId::free(ModuleId::builtin(), "ey_vector_length");
        assert_eq!(function_id(&fid), "ey_function_ey_vector_length");
    }

    #[test]
    fn bound_functions_are_namespaced_by_struct() {
        let sid = StructId::new(ModuleId::single("geom"), "Point");
        let fid = FunctionId::method(ModuleId::single("geom"), sid, "area");
        assert_eq!(
            function_id(&fid),
            "ey_function_geom__Point___bound___area"
        );
    }

    #[test]
    fn dashes_in_module_names_are_escaped() {
        let sid = StructId::new(ModuleId::single("my-mod"), "S");
        assert_eq!(struct_name(&sid), "ey_struct_my_mod__S");
    }
}
