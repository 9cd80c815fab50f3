#![forbid(unsafe_code)]

use std::path::Path;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

use eyot_ast::{CFunction, FfiDefinitions, Type};

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(eyot::ffi))]
pub struct FfiError {
    pub message: String,
}

impl FfiError {
    fn new(message: impl Into<String>) -> FfiError {
        FfiError {
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawFfiFunction {
    name: String,
    arguments: Vec<String>,
    #[serde(rename = "Return")]
    ret: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawFfiFile {
    functions: Vec<RawFfiFunction>,
    linker_flags: Vec<String>,
}

/// Decode a type name from an FFI descriptor: the `Ey*` primitives, an
/// empty string for void, or `[T]` for a vector of `T`.
fn convert_ffi_type(name: &str) -> Result<Type, FfiError> {
    let name = name.trim();

    if name.len() >= 3 && name.starts_with('[') && name.ends_with(']') {
        let inner = convert_ffi_type(&name[1..name.len() - 1])
            .map_err(|e| FfiError::new(format!("Parsing error in vector: {e}")))?;
        return Ok(Type::vector(inner));
    }

    match name {
        "EyInteger" => Ok(Type::Integer),
        "EyBoolean" => Ok(Type::Boolean),
        "EyString" => Ok(Type::Str),
        "EyFloat32" => Ok(Type::float32()),
        "EyFloat64" => Ok(Type::float64()),
        "" => Ok(Type::Void),
        other => Err(FfiError::new(format!(
            "Do not recognise type in ffi declaration: '{other}'"
        ))),
    }
}

fn convert(raw: RawFfiFile) -> Result<FfiDefinitions, FfiError> {
    let mut ffi = FfiDefinitions {
        src: String::new(),
        functions: Vec::new(),
        linker_flags: raw.linker_flags,
    };

    for f in raw.functions {
        let return_type = convert_ffi_type(&f.ret)?;
        let mut argument_types = Vec::new();
        for arg in &f.arguments {
            argument_types.push(convert_ffi_type(arg)?);
        }

        ffi.functions.push(CFunction {
            name: f.name,
            return_type,
            argument_types,
        });
    }

    Ok(ffi)
}

/// Load the FFI descriptor that may sit alongside a source file: a
/// `.json` listing typed C functions and linker flags, and a `.c` of raw
/// source concatenated into the build. A missing descriptor is fine; a
/// malformed one is not.
pub fn ffi_beside(source_path: &Path) -> Result<Option<FfiDefinitions>, FfiError> {
    let json_path = source_path.with_extension("json");

    let blob = match std::fs::read_to_string(&json_path) {
        Ok(blob) => blob,
        Err(_) => return Ok(None),
    };

    let raw: RawFfiFile = serde_json::from_str(&blob).map_err(|e| {
        FfiError::new(format!(
            "Failed to read json at {}: {e}",
            json_path.display()
        ))
    })?;

    let mut converted = convert(raw).map_err(|e| {
        FfiError::new(format!(
            "Failed to unpack ffi json at {}: {e}",
            json_path.display()
        ))
    })?;

    let c_path = source_path.with_extension("c");
    converted.src = std::fs::read_to_string(&c_path).map_err(|_| {
        FfiError::new(format!(
            "No c file found for ffi json: {}",
            c_path.display()
        ))
    })?;

    Ok(Some(converted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_names_decode() {
        assert_eq!(convert_ffi_type("EyInteger").unwrap(), Type::Integer);
        assert_eq!(convert_ffi_type(" EyString ").unwrap(), Type::Str);
        assert_eq!(convert_ffi_type("").unwrap(), Type::Void);
        assert_eq!(
            convert_ffi_type("[EyInteger]").unwrap(),
            Type::vector(Type::Integer)
        );
    }

    #[test]
    fn unknown_names_error() {
        assert!(convert_ffi_type("EyComplex").is_err());
    }

    #[test]
    fn descriptor_fields_parse() {
        let raw: RawFfiFile = serde_json::from_str(
            r#"{
                "Functions": [
                    {"Name": "sin_wrapped", "Arguments": ["EyFloat64"], "Return": "EyFloat64"}
                ],
                "LinkerFlags": ["-lm"]
            }"#,
        )
        .unwrap();

        let ffi = convert(raw).unwrap();
        assert_eq!(ffi.functions.len(), 1);
        assert_eq!(ffi.functions[0].name, "sin_wrapped");
        assert_eq!(ffi.functions[0].return_type, Type::float64());
        assert_eq!(ffi.linker_flags, vec!["-lm"]);
    }
}
