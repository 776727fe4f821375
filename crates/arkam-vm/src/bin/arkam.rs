//! `arkam IMAGE` — load a compiled image and run it to completion.
//!
//! Exits with the cell the program popped at `HALT`, clamped to the host's
//! exit-code width (`std::process::exit` only honours the low byte on most
//! platforms, matching the reference `arkam` CLI's behaviour).

use std::process::ExitCode;

use arkam_vm::{StepStatus, Vm, VmOptions};

fn usage() -> ! {
    eprintln!("Usage: arkam IMAGE");
    std::process::exit(1);
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        usage();
    };
    if args.next().is_some() {
        usage();
    }

    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("arkam: failed to read {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new(VmOptions::default());
    vm.load_image(&data);

    let entry = match arkam_vm::entry_point(&vm) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("arkam: malformed image header: {e}");
            return ExitCode::FAILURE;
        }
    };
    vm.ip = entry;

    match vm.run() {
        StepStatus::Halt => {}
        StepStatus::Fault(e) => {
            eprintln!("arkam: fault: {e}");
            return ExitCode::FAILURE;
        }
        StepStatus::Continue => unreachable!("run() never returns Continue"),
    }

    let code = match vm.ds_pop() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("arkam: fault: {e}");
            return ExitCode::FAILURE;
        }
    };

    ExitCode::from((code & 0xFF) as u8)
}
