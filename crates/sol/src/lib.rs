//! `sol`: a single-pass Forth-family compiler that emits Arkam VM images.
//!
//! Source text is tokenized, resolved against a hyper-static dictionary
//! forest, and compiled directly into a `Vm`'s memory used as scratch
//! space; [`Compiler::finalize`] then writes the finished header and
//! code bytes out to a file.

mod compiler;
mod dict;
mod error;
mod lexer;

pub use compiler::Compiler;
pub use error::CompileError;
