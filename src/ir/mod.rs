//! The typed, SSA-like intermediate representation consumed by the
//! backend.
//!
//! A function body is an ordered list of instruction indices; control-flow
//! instructions reference nested bodies of their own. Instructions are
//! identified by dense `u32` indices into one pool per function. Operands
//! reference either another instruction or an entry in a table of typed
//! constant values.
//!
//! The backend never builds this IR itself; the structures here exist so
//! that the code generator (and its tests) have a concrete contract to
//! compile against.

pub mod liveness;

pub use liveness::{BigTomb, CondBrDeaths, Liveness};

use smallvec::SmallVec;

use crate::core::SrcLoc;
use crate::types::TypeIndex;

/// Dense instruction handle within one function.
pub type InstIndex = u32;

/// Handle to a nested instruction list; body 0 is the main body.
pub type BodyIndex = u32;

/// Handle into the typed constant table.
pub type ValueIndex = u32;

/// Handle identifying a function in the surrounding module.
pub type FuncIndex = u32;

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// No operand in this slot.
    None,
    /// Result of another instruction.
    Inst(InstIndex),
    /// Entry in the constant table.
    Const(ValueIndex),
}

/// A compile-time value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer or boolean bits, stored two's-complement in 64 bits.
    Int(u64),
    Undef,
    /// A function defined in this module.
    Function(FuncIndex),
    /// A function resolved only at link time.
    ExternFn(String),
    /// Constant bytes placed in the output file by the linker.
    Bytes(Vec<u8>),
}

/// A value together with its type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub ty: TypeIndex,
    pub val: Value,
}

/// Comparison operator carried by `cmp_*` instructions and by the
/// condition-flags machine values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Lte,
    Eq,
    Gte,
    Gt,
    Neq,
}

impl CompareOp {
    /// The operator satisfied exactly when `self` is not.
    pub fn invert(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gte,
            CompareOp::Lte => CompareOp::Gt,
            CompareOp::Eq => CompareOp::Neq,
            CompareOp::Gte => CompareOp::Lt,
            CompareOp::Gt => CompareOp::Lte,
            CompareOp::Neq => CompareOp::Eq,
        }
    }
}

/// One register constraint of an `assembly` instruction, e.g. `={x0}` for
/// an output or `{x1}` for an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmConstraint {
    pub register_name: String,
}

/// Instruction payloads. One variant per opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum InstOp {
    /// The `index`-th parameter of the function.
    Arg { index: u32 },
    /// Allocate a stack slot; the instruction's type is a pointer to the
    /// slot's element type.
    Alloc,

    Add { lhs: Operand, rhs: Operand },
    Sub { lhs: Operand, rhs: Operand },
    Mul { lhs: Operand, rhs: Operand },
    BitAnd { lhs: Operand, rhs: Operand },
    BitOr { lhs: Operand, rhs: Operand },
    Xor { lhs: Operand, rhs: Operand },
    BoolAnd { lhs: Operand, rhs: Operand },
    BoolOr { lhs: Operand, rhs: Operand },
    PtrAdd { lhs: Operand, rhs: Operand },
    PtrSub { lhs: Operand, rhs: Operand },
    Not { operand: Operand },
    Cmp { op: CompareOp, lhs: Operand, rhs: Operand },

    Bitcast { operand: Operand },
    IntCast { operand: Operand },
    Trunc { operand: Operand },

    Load { ptr: Operand },
    Store { ptr: Operand, value: Operand },

    IsErr { operand: Operand },
    IsNonErr { operand: Operand },
    UnwrapErrUnionPayload { operand: Operand },
    UnwrapErrUnionErr { operand: Operand },
    WrapOptional { operand: Operand },
    OptionalPayload { operand: Operand },
    IsNull { operand: Operand },
    IsNonNull { operand: Operand },

    StructFieldPtr { operand: Operand, field: u32 },
    SlicePtr { operand: Operand },
    SliceLen { operand: Operand },

    Call { callee: Operand, args: Vec<Operand> },
    Ret { operand: Operand },
    RetLoad { ptr: Operand },

    Block { body: BodyIndex },
    Loop { body: BodyIndex },
    Br { block: InstIndex, operand: Operand },
    CondBr { cond: Operand, then_body: BodyIndex, else_body: BodyIndex },
    SwitchBr { operand: Operand },
    Unreach,

    Breakpoint,
    DbgStmt { line: u32, column: u32 },
    Assembly {
        source: String,
        outputs: Vec<AsmConstraint>,
        inputs: Vec<(AsmConstraint, Operand)>,
        is_volatile: bool,
    },
    Constant { value: ValueIndex },

    // Recognized but not lowered yet; these report a structured error.
    FAdd { lhs: Operand, rhs: Operand },
    AtomicRmw { ptr: Operand, operand: Operand },
    TagName { operand: Operand },
    ErrorName { operand: Operand },
    ArrayInit,
    UnionInit,
}

/// An instruction: its result type plus the tagged payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub ty: TypeIndex,
    pub op: InstOp,
}

/// One function's worth of IR.
#[derive(Debug, Default)]
pub struct Ir {
    pub insts: Vec<Inst>,
    pub bodies: Vec<Vec<InstIndex>>,
    pub values: Vec<TypedValue>,
}

impl Ir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_inst(&mut self, ty: TypeIndex, op: InstOp) -> InstIndex {
        let index = self.insts.len() as InstIndex;
        self.insts.push(Inst { ty, op });
        index
    }

    pub fn add_body(&mut self, insts: Vec<InstIndex>) -> BodyIndex {
        let index = self.bodies.len() as BodyIndex;
        self.bodies.push(insts);
        index
    }

    pub fn add_value(&mut self, value: TypedValue) -> ValueIndex {
        let index = self.values.len() as ValueIndex;
        self.values.push(value);
        index
    }

    pub fn inst(&self, index: InstIndex) -> &Inst {
        &self.insts[index as usize]
    }

    pub fn value(&self, index: ValueIndex) -> &TypedValue {
        &self.values[index as usize]
    }

    /// Body 0, the instruction list of the function itself.
    pub fn main_body(&self) -> &[InstIndex] {
        &self.bodies[0]
    }

    pub fn body(&self, index: BodyIndex) -> &[InstIndex] {
        &self.bodies[index as usize]
    }

    /// Result type of an instruction.
    pub fn ty_of_inst(&self, index: InstIndex) -> TypeIndex {
        self.inst(index).ty
    }

    /// Type of an operand, whichever table it references.
    pub fn ty_of(&self, operand: Operand) -> TypeIndex {
        match operand {
            Operand::None => crate::types::VOID,
            Operand::Inst(index) => self.ty_of_inst(index),
            Operand::Const(index) => self.value(index).ty,
        }
    }

    /// The operands of an instruction, in the fixed order shared by the
    /// liveness analysis and the lowerers.
    pub fn operands_of(&self, index: InstIndex) -> SmallVec<[Operand; 4]> {
        let mut out = SmallVec::new();
        match &self.inst(index).op {
            InstOp::Add { lhs, rhs }
            | InstOp::Sub { lhs, rhs }
            | InstOp::Mul { lhs, rhs }
            | InstOp::BitAnd { lhs, rhs }
            | InstOp::BitOr { lhs, rhs }
            | InstOp::Xor { lhs, rhs }
            | InstOp::BoolAnd { lhs, rhs }
            | InstOp::BoolOr { lhs, rhs }
            | InstOp::PtrAdd { lhs, rhs }
            | InstOp::PtrSub { lhs, rhs }
            | InstOp::FAdd { lhs, rhs }
            | InstOp::Cmp { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            InstOp::Not { operand }
            | InstOp::Bitcast { operand }
            | InstOp::IntCast { operand }
            | InstOp::Trunc { operand }
            | InstOp::IsErr { operand }
            | InstOp::IsNonErr { operand }
            | InstOp::UnwrapErrUnionPayload { operand }
            | InstOp::UnwrapErrUnionErr { operand }
            | InstOp::WrapOptional { operand }
            | InstOp::OptionalPayload { operand }
            | InstOp::IsNull { operand }
            | InstOp::IsNonNull { operand }
            | InstOp::StructFieldPtr { operand, .. }
            | InstOp::SlicePtr { operand }
            | InstOp::SliceLen { operand }
            | InstOp::Ret { operand }
            | InstOp::SwitchBr { operand }
            | InstOp::Br { operand, .. }
            | InstOp::TagName { operand }
            | InstOp::ErrorName { operand } => out.push(*operand),
            InstOp::Load { ptr } | InstOp::RetLoad { ptr } => out.push(*ptr),
            InstOp::Store { ptr, value } => {
                out.push(*ptr);
                out.push(*value);
            }
            InstOp::AtomicRmw { ptr, operand } => {
                out.push(*ptr);
                out.push(*operand);
            }
            InstOp::CondBr { cond, .. } => out.push(*cond),
            InstOp::Call { callee, args } => {
                out.push(*callee);
                out.extend(args.iter().copied());
            }
            InstOp::Assembly { inputs, .. } => {
                out.extend(inputs.iter().map(|(_, op)| *op));
            }
            InstOp::Arg { .. }
            | InstOp::Alloc
            | InstOp::Block { .. }
            | InstOp::Loop { .. }
            | InstOp::Unreach
            | InstOp::Breakpoint
            | InstOp::DbgStmt { .. }
            | InstOp::Constant { .. }
            | InstOp::ArrayInit
            | InstOp::UnionInit => {}
        }
        out
    }
}

/// Per-function metadata handed to `generate` alongside the body.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// The function's type; must be a `Type::Fn`.
    pub ty: TypeIndex,
    pub index: FuncIndex,
    /// Index of this function's atom in the output file; consumed by the
    /// Mach-O relocation pseudo-instructions.
    pub atom_index: u32,
    /// Location of the opening brace.
    pub src_loc: SrcLoc,
    /// Location of the closing brace.
    pub end_loc: SrcLoc,
    /// Whether safety checks apply; controls materialization of undefined
    /// values.
    pub safety: bool,
}
