//! `sol [-n|--no-corelib] [-h|--help] SOURCE [SOURCE...] IMAGE`
//!
//! Compiles one or more sources (after the built-in core library, unless
//! disabled) into a single Arkam image. Exits 0 on success, 1 on any
//! compile error — no partial image is ever written.

use std::path::PathBuf;
use std::process::ExitCode;

use sol::Compiler;

fn usage() -> ! {
    eprintln!("Usage: sol [-n|--no-corelib] [-h|--help] SOURCE [SOURCE...] IMAGE");
    std::process::exit(1);
}

fn main() -> ExitCode {
    let mut no_corelib = false;
    let mut positional = Vec::new();

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => usage(),
            "-n" | "--no-corelib" => no_corelib = true,
            _ => positional.push(arg),
        }
    }

    if positional.len() < 2 {
        usage();
    }
    let image_path = PathBuf::from(positional.pop().expect("checked len >= 2"));
    let sources: Vec<PathBuf> = positional.into_iter().map(PathBuf::from).collect();

    let mut compiler = Compiler::new(vec![]);

    if !no_corelib {
        if let Err(e) = compiler.compile_corelib() {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    for source in &sources {
        if let Err(e) = compiler.compile_file(source) {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = compiler.finalize(&image_path) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
