//! Petrel - a single-pass AArch64 code generation backend.
//!
//! Petrel lowers a function-level, typed, SSA-like IR into a linear
//! stream of AArch64 machine instructions in one walk over the body. The
//! same pass performs register allocation with spill-on-pressure, plans
//! the stack frame and back-patches the prologue, reconciles value
//! locations across control-flow joins, and emits debug-line records.
//!
//! # Primary Usage
//!
//! ```ignore
//! use petrel::aarch64::{generate, DebugOutput, FnResult};
//! use petrel::ir::Liveness;
//!
//! let mut liveness = Liveness::analyze(&ir);
//! let mut debug = DebugOutput::None;
//! match generate(&func, &ir, &mut liveness, &mut types, &mut link, target, &mut debug)? {
//!     FnResult::Mir(mir) => emit(mir),
//!     FnResult::Fail(err) => report(err),
//! }
//! ```
//!
//! # Architecture
//!
//! - [`aarch64`] - machine values, MIR, the AAPCS64 resolver, and the
//!   lowering driver
//! - [`core`] - shared infrastructure (register file, frame planner,
//!   errors)
//! - [`ir`] - the consumed IR and its liveness bits
//! - [`types`] - ABI size/alignment/layout queries
//! - [`link`] - the linker facade (ELF, Mach-O, COFF, Plan 9)
//! - [`target`] - operating-system selection

pub mod aarch64;
pub mod core;
pub mod ir;
pub mod link;
pub mod target;
pub mod types;

pub use aarch64::{generate, DebugOutput, DwarfOutput, FnResult, MachineValue, Register};
pub use core::{CodegenError, CodegenResult, ErrorMsg, SrcLoc};
pub use ir::{Function, Ir, Liveness};
pub use link::LinkFile;
pub use target::{Os, Target};
pub use types::TypePool;
