//! The fundamental integer types of the Arkam ISA.

/// A signed 32-bit machine word. Also the address unit: every memory
/// location, stack pointer and jump target is a `Cell`.
pub type Cell = i32;

/// `Cell` reinterpreted as unsigned, used for logical shifts and for
/// bounds comparisons against memory size.
pub type UCell = u32;

/// A single byte, as read or written by `BGET`/`BSET`.
pub type Byte = u8;

/// `sizeof(Cell)` in bytes. Every address used by `GET`/`SET`/jump targets
/// advances or aligns in units of this size.
pub const CELL_SIZE: Cell = 4;

pub const MAX_INT: Cell = Cell::MAX;
pub const MIN_INT: Cell = Cell::MIN;
