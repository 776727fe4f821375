//! Black-box scenarios and round-trip laws for the instruction set,
//! assembled as raw programs against the public API.

use arkam_vm::{Cell, Opcode, StepStatus, Vm, VmOptions};

fn vm() -> Vm {
    Vm::new(VmOptions {
        memory_cells: 256,
        ds_cells: 16,
        rs_cells: 16,
    })
}

fn assemble(vm: &mut Vm, cells: &[Cell]) -> Cell {
    let start = vm.ip.max(64);
    let mut addr = start;
    for &c in cells {
        vm.write_cell(addr, c).expect("program fits in heap");
        addr += arkam_vm::CELL_SIZE;
    }
    vm.ip = start;
    start
}

#[test]
fn lit_rpush_rpop_round_trip() {
    let mut vm = vm();
    assemble(
        &mut vm,
        &[
            Opcode::Lit.encode(),
            99,
            Opcode::Rpush.encode(),
            Opcode::Rpop.encode(),
            Opcode::Halt.encode(),
        ],
    );
    assert_eq!(vm.run(), StepStatus::Halt);
    assert_eq!(vm.ds_pop(), Ok(99));
    assert!(!vm.has_rs_items(1));
}

#[test]
fn swap_swap_is_identity() {
    let mut vm = vm();
    assemble(
        &mut vm,
        &[
            Opcode::Lit.encode(),
            1,
            Opcode::Lit.encode(),
            2,
            Opcode::Swap.encode(),
            Opcode::Swap.encode(),
            Opcode::Halt.encode(),
        ],
    );
    assert_eq!(vm.run(), StepStatus::Halt);
    assert_eq!(vm.ds_pop(), Ok(2));
    assert_eq!(vm.ds_pop(), Ok(1));
}

#[test]
fn not_not_is_identity() {
    let mut vm = vm();
    assemble(
        &mut vm,
        &[
            Opcode::Lit.encode(),
            1234,
            Opcode::Not.encode(),
            Opcode::Not.encode(),
            Opcode::Halt.encode(),
        ],
    );
    assert_eq!(vm.run(), StepStatus::Halt);
    assert_eq!(vm.ds_pop(), Ok(1234));
}

#[test]
fn dup_swap_equals_dup() {
    let mut a = vm();
    let mut b = vm();
    assemble(
        &mut a,
        &[
            Opcode::Lit.encode(),
            7,
            Opcode::Dup.encode(),
            Opcode::Swap.encode(),
            Opcode::Halt.encode(),
        ],
    );
    assemble(
        &mut b,
        &[Opcode::Lit.encode(), 7, Opcode::Dup.encode(), Opcode::Halt.encode()],
    );
    assert_eq!(a.run(), StepStatus::Halt);
    assert_eq!(b.run(), StepStatus::Halt);
    assert_eq!(a.ds_pop(), b.ds_pop());
    assert_eq!(a.ds_pop(), b.ds_pop());
}

#[test]
fn ds_bounds_are_symmetric() {
    let mut vm = Vm::new(VmOptions {
        memory_cells: 64,
        ds_cells: 1,
        rs_cells: 1,
    });
    assert!(vm.ds_push(1).is_ok());
    assert_eq!(vm.ds_push(2), Err(arkam_vm::VmError::DsOverflow));
    assert_eq!(vm.ds_pop(), Ok(1));
    assert_eq!(vm.ds_pop(), Err(arkam_vm::VmError::DsUnderflow));
}

#[test]
fn rs_bounds_are_symmetric() {
    let mut vm = Vm::new(VmOptions {
        memory_cells: 64,
        ds_cells: 1,
        rs_cells: 1,
    });
    assert!(vm.rs_push(1).is_ok());
    assert_eq!(vm.rs_push(2), Err(arkam_vm::VmError::RsOverflow));
    assert_eq!(vm.rs_pop(), Ok(1));
    assert_eq!(vm.rs_pop(), Err(arkam_vm::VmError::RsUnderflow));
}

#[test]
fn header_round_trip_after_load_image() {
    let mut vm = vm();
    // Build a minimal "image": header with entry = code_begin, here = end.
    let code_begin = arkam_vm::HEADER_CODE_BEGIN;
    let mut bytes = vec![0u8; (code_begin + 8) as usize];
    bytes[arkam_vm::HEADER_ENTRY as usize..][..4].copy_from_slice(&code_begin.to_le_bytes());
    let here = code_begin + 8;
    bytes[arkam_vm::HEADER_HERE as usize..][..4].copy_from_slice(&here.to_le_bytes());
    bytes[code_begin as usize..][..4].copy_from_slice(&Opcode::Halt.encode().to_le_bytes());

    vm.load_image(&bytes);
    assert_eq!(arkam_vm::entry_point(&vm), Ok(code_begin));
    assert_eq!(arkam_vm::here(&vm), Ok(here));
    vm.ip = code_begin;
    assert_eq!(vm.run(), StepStatus::Halt);
}
