//! AArch64 backend.
//!
//! - [`registers`] — register identities and aliasing
//! - [`mir`] — the emitted instruction stream
//! - [`value`] — machine values (where an IR value lives)
//! - [`calling_convention`] — AAPCS64 classification
//! - [`codegen`] — the single-pass lowering driver

pub mod calling_convention;
pub mod codegen;
pub mod mir;
pub mod registers;
pub mod value;

pub use codegen::{generate, DebugOutput, DwarfOutput, FnResult};
pub use registers::Register;
pub use value::MachineValue;
