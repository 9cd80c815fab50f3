#![forbid(unsafe_code)]

//! The `eyot` command line driver: parse and analyze a program, emit C,
//! and optionally hand off to the host C compiler and run the result.

mod runner;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use eyot_ast::Errors;
use eyot_core::{Environment, Program};

#[derive(Parser)]
#[command(name = "eyot", version, about = "Compiler for the Eyot language")]
struct Cli {
    /// Show the compiler output (error or no error)
    #[arg(long)]
    showlog: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the program to an executable file
    Build { file: PathBuf },
    /// Build and run directly
    Run { file: PathBuf },
    /// Output the C code (one file)
    C { file: PathBuf },
    /// Prepare the file fully for compilation, but emit nothing
    Lint { file: PathBuf },
    /// Create the folder of runtime code as required to compile
    Dump { file: PathBuf },
    /// Print the environment
    Env,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut errors = Errors::new();

    drive(&cli, &mut errors);

    if errors.clean() {
        return ExitCode::SUCCESS;
    }

    if let Some(internal) = errors.internal_error() {
        eprintln!("internal error: {internal}");
    } else {
        print!("{}", errors.render());
    }

    ExitCode::FAILURE
}

fn drive(cli: &Cli, errors: &mut Errors) {
    let file = match &cli.command {
        Command::Build { file }
        | Command::Run { file }
        | Command::C { file }
        | Command::Lint { file }
        | Command::Dump { file } => file.clone(),
        Command::Env => {
            let env = match Environment::create(Path::new(".")) {
                Ok(env) => env,
                Err(e) => {
                    errors.log_internal(e);
                    return;
                }
            };
            println!("EyotRoot");
            for root in env.roots() {
                println!("  {}", root.display());
            }
            return;
        }
    };

    if file.extension().map(|e| e != "ey").unwrap_or(true) {
        errors.log_internal(format!("Bad extension: {}", file.display()));
        return;
    }

    let local_dir = file.parent().unwrap_or(Path::new(".")).to_path_buf();
    let env = match Environment::create(&local_dir) {
        Ok(env) => env,
        Err(e) => {
            errors.log_internal(e);
            return;
        }
    };

    let module_name = match file.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => stem.to_string(),
        None => {
            errors.log_internal(format!("Bad file name: {}", file.display()));
            return;
        }
    };

    let mut program = Program::new(env);
    program.parse_root(&module_name, errors);
    if !errors.clean() {
        return;
    }

    // The device unit inlines the common runtime header textually.
    let common_header = if program.gpu_required {
        let header_path = program.env.runtime_root().join("eyot-runtime-common.h");
        match std::fs::read_to_string(&header_path) {
            Ok(header) => header,
            Err(_) => {
                errors.log_internal(format!(
                    "Unable to read the common runtime header: {}",
                    header_path.display()
                ));
                return;
            }
        }
    } else {
        String::new()
    };

    let generated = eyot_backend_c::write_program(&program, &common_header);

    match &cli.command {
        Command::Lint { .. } | Command::Env => {}

        Command::C { .. } => {
            print!("{generated}");
        }

        Command::Dump { file: _ } => {
            let dir = runner::dump_directory();
            if let Err(e) = std::fs::create_dir_all(&dir) {
                errors.log_internal(format!("Failed to create build dir: {e}"));
                return;
            }

            let sources = program.ffi_sources();
            if let Err(e) = runner::prepare_build_dir(&dir, &program.env, &generated, &sources) {
                errors.log_internal(format!("Code preparation error: {e}"));
                return;
            }

            println!("{}", dir.display());
        }

        Command::Build { .. } | Command::Run { .. } => {
            let scratch = match tempfile::Builder::new().prefix("eyot-build-root-").tempdir() {
                Ok(dir) => dir,
                Err(e) => {
                    errors.log_internal(format!("Failed to create build dir: {e}"));
                    return;
                }
            };

            let sources = program.ffi_sources();
            let files = match runner::prepare_build_dir(
                scratch.path(),
                &program.env,
                &generated,
                &sources,
            ) {
                Ok(files) => files,
                Err(e) => {
                    errors.log_internal(format!("Code preparation error: {e}"));
                    return;
                }
            };

            let running = matches!(cli.command, Command::Run { .. });
            let out_file = if running {
                scratch.path().join("eyot-binary.exe")
            } else {
                PathBuf::from("./out.exe")
            };

            let opts = runner::BuildOptions {
                show_log: cli.showlog,
                with_opencl: program.gpu_required,
                max_args: program.functions.max_arg_count(),
                max_closure_size: program.max_closure_size,
                ffi_flags: program.ffi_flags(),
            };

            if let Err(e) = runner::compile(scratch.path(), &files, &out_file, &opts) {
                errors.log_internal(e);
                return;
            }

            if running {
                let use_oclgrind = std::env::var("EyotTestOclGrind")
                    .map(|v| v == "y")
                    .unwrap_or(false);
                if let Err(e) = runner::run_binary(&out_file, use_oclgrind) {
                    errors.log_internal(e);
                }
            }
        }
    }
}
