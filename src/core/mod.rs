//! Architecture-independent code generation infrastructure.
//!
//! # Key Components
//!
//! ## Register Allocation (`register_file`)
//! - Fixed-pool tracking with deterministic spill-victim selection
//! - Freeze tokens for temporary pins during multi-step lowerings
//!
//! ## Stack-Frame Planning (`frame`)
//! - Aligned slot allocation with high-water tracking
//! - Branch-local snapshot and rollback
//!
//! ## Errors (`error`)
//! - The three failure kinds of a function compilation

pub mod error;
pub mod frame;
pub mod register_file;

pub use error::{CodegenError, CodegenResult, ErrorMsg, SrcLoc};
pub use frame::{align_up, FrameAllocator, FrameState, StackSlot};
pub use register_file::{FreezeGuard, RegisterFile, RegisterFileState};
