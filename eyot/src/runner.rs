#![forbid(unsafe_code)]

//! Scratch build directory management and host C compiler invocation.
//! The generated translation unit, the fixed runtime file set and any
//! FFI sources are collected into one directory and handed to `$CC`.

use std::path::{Path, PathBuf};
use std::process::Command;

use eyot_core::Environment;

/// The runtime sources every build links; their presence under the
/// runtime root is part of the external ABI.
pub const RUNTIME_C_FILES: [&str; 9] = [
    "eyot-runtime-closures.c",
    "eyot-runtime-strings.c",
    "eyot-runtime-vectors.c",
    "eyot-runtime-entry-point.c",
    "eyot-runtime-cpu-worker.c",
    "eyot-runtime-cpu-pipeline.c",
    "eyot-runtime-pipes.c",
    "eyot-runtime-gc.c",
    "eyot-runtime-opencl.c",
];

pub const RUNTIME_H_FILES: [&str; 3] = [
    "eyot-runtime-cpu.h",
    "eyot-runtime-pipe.h",
    "eyot-runtime-common.h",
];

pub struct BuildOptions {
    pub show_log: bool,
    pub with_opencl: bool,
    pub max_args: usize,
    pub max_closure_size: usize,
    pub ffi_flags: Vec<String>,
}

fn debug_mode() -> bool {
    std::env::var("EyotDebug").map(|v| v == "y").unwrap_or(false)
}

/// Copy the runtime into `dir` and write the generated unit plus FFI
/// sources. Returns the list of C files to compile.
pub fn prepare_build_dir(
    dir: &Path,
    env: &Environment,
    generated_c: &str,
    ffi_sources: &[String],
) -> Result<Vec<String>, String> {
    let runtime_root = env.runtime_root();
    let mut files = Vec::new();

    for name in RUNTIME_C_FILES {
        let source = runtime_root.join(name);
        let contents = std::fs::read(&source)
            .map_err(|_| format!("Unable to find runtime source: {}", source.display()))?;
        std::fs::write(dir.join(name), contents)
            .map_err(|e| format!("Failed to write runtime source {name}: {e}"))?;
        files.push(name.to_string());
    }

    for name in RUNTIME_H_FILES {
        let source = runtime_root.join(name);
        let contents = std::fs::read(&source)
            .map_err(|_| format!("Unable to find runtime header: {}", source.display()))?;
        std::fs::write(dir.join(name), contents)
            .map_err(|e| format!("Failed to write runtime header {name}: {e}"))?;
    }

    std::fs::write(dir.join("eyot-main.c"), generated_c)
        .map_err(|e| format!("Failed to write eyot-main.c: {e}"))?;
    files.push("eyot-main.c".to_string());

    for (i, src) in ffi_sources.iter().enumerate() {
        let name = format!("eyot-ffi-{i}.c");
        std::fs::write(dir.join(&name), src)
            .map_err(|e| format!("Failed to write {name}: {e}"))?;
        files.push(name);
    }

    Ok(files)
}

fn host_compiler() -> String {
    match std::env::var("CC") {
        Ok(cc) if !cc.is_empty() => cc,
        _ => "gcc".to_string(),
    }
}

/// On macOS `gcc` resolves to clang, which wants a different silence
/// flag.
fn compiler_is_clang(cc: &str) -> bool {
    Command::new(cc)
        .arg("--version")
        .output()
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .to_lowercase()
                .contains("clang")
        })
        .unwrap_or(false)
}

fn opencl_args() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["-framework".to_string(), "OpenCL".to_string()]
    } else {
        vec!["-lOpenCL".to_string()]
    }
}

/// Invoke the host C compiler over the prepared directory. Returns the
/// build log on success; on failure the log rides in the error.
pub fn compile(
    dir: &Path,
    files: &[String],
    out_file: &Path,
    opts: &BuildOptions,
) -> Result<String, String> {
    let cc = host_compiler();

    let mut args: Vec<String> = vec!["-g3".to_string()];

    if debug_mode() {
        args.push("-fsanitize=address,undefined".to_string());
    }

    if !opts.show_log {
        if compiler_is_clang(&cc) {
            args.push("-Wno-everything".to_string());
        } else {
            args.push("-w".to_string());
        }
    }

    args.push("-std=c99".to_string());
    args.push("-o".to_string());
    args.push(out_file.display().to_string());

    if opts.with_opencl {
        args.push("-DEYOT_OPENCL_INCLUDED".to_string());
    }
    if opts.show_log {
        args.push("-DEYOT_SHOW_LOG".to_string());
    }

    args.push(format!("-DEYOT_RUNTIME_MAX_ARGS={}", opts.max_args));
    args.push(format!(
        "-DEYOT_RUNTIME_MAX_CLOSURE_SIZE={}",
        opts.max_closure_size
    ));

    for file in files {
        args.push(dir.join(file).display().to_string());
    }

    if opts.with_opencl {
        args.extend(opencl_args());
    }

    for flag in &opts.ffi_flags {
        args.push(flag.clone());
    }

    let output = Command::new(&cc)
        .args(&args)
        .output()
        .map_err(|e| format!("Failed to invoke {cc}: {e}"))?;

    let log = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if !output.status.success() {
        return Err(format!("CC error:\n{log}"));
    }

    if opts.show_log || log.contains("warning") {
        let indented = log.replace('\n', "\n  >  ");
        println!("Build output from C compiler:");
        println!("  >  {indented}");
        println!();
    }

    Ok(log)
}

/// Run the built binary, optionally under oclgrind for OpenCL testing.
pub fn run_binary(binary: &Path, use_oclgrind: bool) -> Result<(), String> {
    let mut command = if use_oclgrind {
        let mut c = Command::new("oclgrind");
        c.arg(binary);
        c
    } else {
        Command::new(binary)
    };

    let status = command
        .status()
        .map_err(|e| format!("Error running: {e}"))?;

    if !status.success() {
        return Err(format!("Error running: {status}"));
    }

    Ok(())
}

/// The persistent scratch directory used by `dump`.
pub fn dump_directory() -> PathBuf {
    std::env::temp_dir().join(format!("eyot-build-root-{}", std::process::id()))
}
