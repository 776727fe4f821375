//! The device I/O bus.
//!
//! Modeled on the single-method `Bus` trait this workspace's CPU crates use
//! to reach memory: a device is a handler registered into a fixed slot,
//! invoked by the `IO` primitive with the VM passed in so the handler can
//! pop its own operands and push its own results.

use crate::cell::Cell;
use crate::error::{StepStatus, VmError};
use crate::vm::Vm;

/// Number of device slots on the bus. Matches the reference implementation's
/// `ArkamDevice` enum exactly; out-of-scope devices (video, audio, mouse,
/// pad, file, datetime, socket, emu, app) are addressable slots that simply
/// have no handler registered unless the embedder provides one.
pub const DEVICES_COUNT: Cell = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeviceId {
    Sys = 0,
    Stdio = 1,
    Random = 2,
    Video = 3,
    Audio = 4,
    Key = 5,
    Mouse = 6,
    Pad = 7,
    File = 8,
    Datetime = 9,
    Socket = 10,
    Emu = 11,
    App = 12,
}

impl DeviceId {
    #[must_use]
    pub const fn slot(self) -> usize {
        self as usize
    }
}

/// A handler for one device slot.
///
/// `handle` is responsible for popping its own operands off the data stack
/// and pushing its own results; the `IO` primitive only does dispatch.
pub trait Device {
    fn handle(&mut self, vm: &mut Vm, op: Cell) -> StepStatus;
}

/// The always-registered device at slot 0.
///
/// Exposes VM geometry so a running program can size its own buffers
/// without compile-time knowledge of the embedder's memory layout.
#[derive(Debug, Default)]
pub struct SysDevice;

impl Device for SysDevice {
    fn handle(&mut self, vm: &mut Vm, op: Cell) -> StepStatus {
        let value = match op {
            0 => vm.total_bytes(),
            2 => vm.ds_cells(),
            3 => vm.ds_base(),
            4 => vm.rs_cells(),
            5 => vm.rs_base(),
            6 => crate::cell::CELL_SIZE,
            7 => crate::cell::MAX_INT,
            8 => crate::cell::MIN_INT,
            _ => return VmError::IoUnknownOp.into(),
        };
        match vm.ds_push(value) {
            Ok(()) => StepStatus::Continue,
            Err(e) => e.into(),
        }
    }
}
