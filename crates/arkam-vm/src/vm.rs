//! Memory layout, registers, and stack primitives.
//!
//! A `Vm` owns one contiguous byte buffer partitioned into heap, data
//! stack and return stack, in that order. Every address is a byte offset
//! into that buffer; address 0 is reserved and every load, store, jump
//! target and `ip` advance is bounds-checked before it touches memory.

use crate::cell::{Cell, CELL_SIZE};
use crate::device::{Device, DeviceId, SysDevice, DEVICES_COUNT};
use crate::error::VmError;

/// Construction-time sizing for a `Vm`.
///
/// `ds_cells`/`rs_cells` match the reference implementation's defaults
/// (512 cells each); `memory_cells` sizes the heap region ahead of the
/// stacks.
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    pub memory_cells: Cell,
    pub ds_cells: Cell,
    pub rs_cells: Cell,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            memory_cells: 500_000,
            ds_cells: 512,
            rs_cells: 512,
        }
    }
}

pub struct Vm {
    pub(crate) mem: Vec<u8>,
    pub(crate) ds_cells: Cell,
    pub(crate) rs_cells: Cell,
    pub(crate) ds_base: Cell,
    pub(crate) rs_base: Cell,
    pub(crate) total: Cell,

    pub ip: Cell,
    pub sp: Cell,
    pub rp: Cell,
    pub result: Cell,
    pub err: Cell,

    pub(crate) devices: [Option<Box<dyn Device>>; DEVICES_COUNT as usize],
}

impl Vm {
    #[must_use]
    pub fn new(opts: VmOptions) -> Self {
        let ds_base = opts.memory_cells * CELL_SIZE;
        let rs_base = ds_base + opts.ds_cells * CELL_SIZE;
        let total = rs_base + opts.rs_cells * CELL_SIZE;

        let devices: [Option<Box<dyn Device>>; DEVICES_COUNT as usize] =
            std::array::from_fn(|_| None);
        let mut vm = Self {
            mem: vec![0u8; total as usize],
            ds_cells: opts.ds_cells,
            rs_cells: opts.rs_cells,
            ds_base,
            rs_base,
            total,
            ip: 0,
            sp: rs_base - CELL_SIZE,
            rp: total - CELL_SIZE,
            result: 0,
            err: 0,
            devices,
        };
        vm.register_device(DeviceId::Sys, Box::new(SysDevice));
        vm
    }

    /// Register a handler at the given device's slot, replacing any
    /// previous one.
    pub fn register_device(&mut self, id: DeviceId, handler: Box<dyn Device>) {
        self.devices[id.slot()] = Some(handler);
    }

    #[must_use]
    pub fn total_bytes(&self) -> Cell {
        self.total
    }

    #[must_use]
    pub fn ds_base(&self) -> Cell {
        self.ds_base
    }

    #[must_use]
    pub fn rs_base(&self) -> Cell {
        self.rs_base
    }

    #[must_use]
    pub fn ds_cells(&self) -> Cell {
        self.ds_cells
    }

    #[must_use]
    pub fn rs_cells(&self) -> Cell {
        self.rs_cells
    }

    /// Copy `data` into memory starting at address 0, as `arkam` does when
    /// loading an image file. Memory beyond `data.len()` stays zero-filled.
    ///
    /// # Panics
    /// Panics if `data` does not fit in the VM's memory.
    pub fn load_image(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.mem.len(),
            "image ({} bytes) larger than VM memory ({} bytes)",
            data.len(),
            self.mem.len()
        );
        self.mem[..data.len()].copy_from_slice(data);
    }

    #[must_use]
    pub fn image_bytes(&self, len: Cell) -> &[u8] {
        &self.mem[..len as usize]
    }

    // ----- address validity -----------------------------------------

    /// `0 < addr < total_bytes`. Used for jump/call targets and for
    /// register-pointer writes (`SETSP`/`SETRP`), where the address is a
    /// pointer value rather than something about to be dereferenced as a
    /// specific width.
    #[must_use]
    pub fn valid_addr(&self, addr: Cell) -> bool {
        addr > 0 && addr < self.total
    }

    fn valid_cell_addr(&self, addr: Cell) -> bool {
        addr > 0 && addr <= self.total - CELL_SIZE
    }

    // ----- raw memory access ------------------------------------------

    pub fn read_cell(&self, addr: Cell) -> Result<Cell, VmError> {
        if !self.valid_cell_addr(addr) {
            return Err(VmError::InvalidAddr);
        }
        let i = addr as usize;
        let bytes: [u8; 4] = self.mem[i..i + 4]
            .try_into()
            .expect("slice of len 4 converts to [u8; 4]");
        Ok(Cell::from_le_bytes(bytes))
    }

    pub fn write_cell(&mut self, addr: Cell, value: Cell) -> Result<(), VmError> {
        if !self.valid_cell_addr(addr) {
            return Err(VmError::InvalidAddr);
        }
        let i = addr as usize;
        self.mem[i..i + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_byte(&self, addr: Cell) -> Result<u8, VmError> {
        if !self.valid_addr(addr) {
            return Err(VmError::InvalidAddr);
        }
        Ok(self.mem[addr as usize])
    }

    pub fn write_byte(&mut self, addr: Cell, value: u8) -> Result<(), VmError> {
        if !self.valid_addr(addr) {
            return Err(VmError::InvalidAddr);
        }
        self.mem[addr as usize] = value;
        Ok(())
    }

    // ----- data stack ---------------------------------------------------

    #[must_use]
    pub fn has_ds_items(&self, n: Cell) -> bool {
        self.sp + CELL_SIZE * n < self.rs_base
    }

    #[must_use]
    pub fn has_ds_space(&self, n: Cell) -> bool {
        self.sp - CELL_SIZE * (n - 1) >= self.ds_base
    }

    pub fn ds_push(&mut self, value: Cell) -> Result<(), VmError> {
        if !self.has_ds_space(1) {
            return Err(VmError::DsOverflow);
        }
        self.write_cell(self.sp, value)?;
        self.sp -= CELL_SIZE;
        Ok(())
    }

    pub fn ds_pop(&mut self) -> Result<Cell, VmError> {
        if !self.has_ds_items(1) {
            return Err(VmError::DsUnderflow);
        }
        let v = self.read_cell(self.sp + CELL_SIZE)?;
        self.sp += CELL_SIZE;
        Ok(v)
    }

    /// Read the `depth`-th item from the top without popping (`depth` 1 =
    /// top of stack). Used so compound instructions like `DUP`/`SWAP` can
    /// validate before mutating anything, keeping faults atomic.
    pub fn ds_peek(&self, depth: Cell) -> Result<Cell, VmError> {
        if !self.has_ds_items(depth) {
            return Err(VmError::DsUnderflow);
        }
        self.read_cell(self.sp + CELL_SIZE * depth)
    }

    // ----- return stack ---------------------------------------------------

    #[must_use]
    pub fn has_rs_items(&self, n: Cell) -> bool {
        self.rp + CELL_SIZE * n < self.total
    }

    #[must_use]
    pub fn has_rs_space(&self, n: Cell) -> bool {
        self.rp - CELL_SIZE * (n - 1) >= self.rs_base
    }

    pub fn rs_push(&mut self, value: Cell) -> Result<(), VmError> {
        if !self.has_rs_space(1) {
            return Err(VmError::RsOverflow);
        }
        self.write_cell(self.rp, value)?;
        self.rp -= CELL_SIZE;
        Ok(())
    }

    pub fn rs_pop(&mut self) -> Result<Cell, VmError> {
        if !self.has_rs_items(1) {
            return Err(VmError::RsUnderflow);
        }
        let v = self.read_cell(self.rp + CELL_SIZE)?;
        self.rp += CELL_SIZE;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_vm() -> Vm {
        Vm::new(VmOptions {
            memory_cells: 16,
            ds_cells: 2,
            rs_cells: 2,
        })
    }

    #[test]
    fn empty_stack_pointers_match_spec_convention() {
        let vm = tiny_vm();
        assert_eq!(vm.sp, vm.rs_base - CELL_SIZE);
        assert_eq!(vm.rp, vm.total - CELL_SIZE);
    }

    #[test]
    fn address_zero_is_never_valid() {
        let vm = tiny_vm();
        assert!(!vm.valid_addr(0));
        assert!(vm.read_cell(0).is_err());
    }

    #[test]
    fn ds_overflow_then_underflow_at_exact_capacity() {
        let mut vm = tiny_vm();
        vm.ds_push(1).unwrap();
        vm.ds_push(2).unwrap();
        assert_eq!(vm.ds_push(3), Err(VmError::DsOverflow));
        assert_eq!(vm.ds_pop().unwrap(), 2);
        assert_eq!(vm.ds_pop().unwrap(), 1);
        assert_eq!(vm.ds_pop(), Err(VmError::DsUnderflow));
    }

    #[test]
    fn rs_overflow_then_underflow_at_exact_capacity() {
        let mut vm = tiny_vm();
        vm.rs_push(1).unwrap();
        vm.rs_push(2).unwrap();
        assert_eq!(vm.rs_push(3), Err(VmError::RsOverflow));
        assert_eq!(vm.rs_pop().unwrap(), 2);
        assert_eq!(vm.rs_pop().unwrap(), 1);
        assert_eq!(vm.rs_pop(), Err(VmError::RsUnderflow));
    }

    #[test]
    fn failed_push_leaves_stack_pointer_untouched() {
        let mut vm = tiny_vm();
        vm.ds_push(1).unwrap();
        vm.ds_push(2).unwrap();
        let sp_before = vm.sp;
        assert!(vm.ds_push(3).is_err());
        assert_eq!(vm.sp, sp_before);
    }
}
