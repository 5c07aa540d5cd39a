//! AArch64 Procedure Call Standard implementation.
//!
//! Classifies parameters and return values into AAPCS64 locations: the
//! next core register number (NCRN, x0–x7) and the next stacked argument
//! address (NSAA). The Apple variant differs in how stacked arguments are
//! packed and skips the even-register rounding for 16-byte-aligned
//! arguments. This mirrors the classification the rest of the backend
//! relies on: the caller materializes arguments into the returned
//! locations, the callee reads its parameters out of them.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use thiserror::Error;

use crate::aarch64::registers::{C_ABI_INT_PARAM_REGS, C_ABI_INT_RETURN_REG};
use crate::aarch64::value::MachineValue;
use crate::core::align_up;
use crate::target::Target;
use crate::types::{TypeIndex, TypePool, PTR_SIZE};

/// Classification failures; surfaced as structured codegen errors by the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CcError {
    #[error("TODO implement multi-register parameters")]
    MultiRegister,
    #[error("TODO implement split register/stack parameters")]
    SplitParameter,
    #[error("TODO implement return values larger than 8 bytes")]
    LargeReturn,
}

/// Resolved locations for one function signature at one site.
pub struct CallValues<'a> {
    pub args: BumpVec<'a, MachineValue>,
    pub return_value: MachineValue,
    /// Bytes of outgoing stack argument space, 16-byte aligned.
    pub stack_byte_count: u32,
}

impl<'a> CallValues<'a> {
    pub fn new_in(arena: &'a Bump) -> Self {
        Self {
            args: BumpVec::new_in(arena),
            return_value: MachineValue::None,
            stack_byte_count: 0,
        }
    }
}

/// Stateful AAPCS64 argument assigner.
#[derive(Debug)]
pub struct Aapcs64Assigner {
    target: Target,
    /// Next core register number.
    ncrn: usize,
    /// Next stacked argument address, relative to the outgoing argument
    /// area.
    nsaa: u32,
}

impl Aapcs64Assigner {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            ncrn: 0,
            nsaa: 0,
        }
    }

    /// Classify the next parameter.
    pub fn assign_param(
        &mut self,
        types: &TypePool,
        ty: TypeIndex,
    ) -> Result<MachineValue, CcError> {
        if !types.has_runtime_bits(ty) {
            return Ok(MachineValue::None);
        }
        let size = types.abi_size(ty);
        let align = types.abi_alignment(ty);

        if align == 16 && !self.target.is_darwin() {
            // Round NCRN up to the next even register.
            self.ncrn = (self.ncrn + 1) & !1;
        }

        let needed_regs = ((size + 7) / 8) as usize;
        if needed_regs <= 8usize.saturating_sub(self.ncrn) && self.ncrn < 8 {
            if size <= 8 {
                let reg = C_ABI_INT_PARAM_REGS[self.ncrn];
                self.ncrn += 1;
                return Ok(MachineValue::Register(reg));
            }
            return Err(CcError::MultiRegister);
        }
        if self.ncrn < 8 && self.nsaa == 0 {
            return Err(CcError::SplitParameter);
        }

        self.ncrn = 8;
        if !self.target.is_darwin() {
            if align == 8 {
                self.nsaa = align_up(self.nsaa, 8);
            } else {
                self.nsaa = align_up(self.nsaa, align);
            }
        }
        let offset = self.nsaa;
        self.nsaa += size;
        Ok(MachineValue::StackOffset(offset))
    }

    /// Classify the return value.
    pub fn assign_return(
        &mut self,
        types: &TypePool,
        ty: TypeIndex,
    ) -> Result<MachineValue, CcError> {
        if matches!(types.get(ty), crate::types::Type::NoReturn) {
            return Ok(MachineValue::Unreach);
        }
        if !types.has_runtime_bits(ty) {
            return Ok(MachineValue::None);
        }
        let size = types.abi_size(ty);
        if size <= PTR_SIZE {
            return Ok(MachineValue::Register(C_ABI_INT_RETURN_REG));
        }
        Err(CcError::LargeReturn)
    }

    /// Total outgoing stack space consumed by stacked arguments.
    pub fn stack_size(&self) -> u32 {
        align_up(self.nsaa, 16)
    }
}
