//! Single-pass lowering of the IR to AArch64 machine instructions.
//!
//! One walk over the function body solves four problems at once: register
//! allocation with spill-on-pressure, stack-frame planning with deferred
//! prologue back-patching, reconciliation of value locations across
//! control-flow joins, and per-instruction operand-death bookkeeping.
//!
//! All state lives in one [`Context`] passed by mutable reference to every
//! helper. Spilling is a capability the register file requests from the
//! context: the allocator surfaces the victim, the context emits the move
//! and rewrites the location table. Prologue fields that are only known
//! after the body has been generated are emitted as `nop` placeholders and
//! patched in place at the end.

use std::collections::HashMap;

use bumpalo::Bump;
use smallvec::SmallVec;

use crate::aarch64::calling_convention::{Aapcs64Assigner, CallValues};
use crate::aarch64::mir::{self, Cond, Mir, MirIndex};
use crate::aarch64::registers::{Register, CALLEE_PRESERVED_REGS, FP, LR};
use crate::aarch64::value::MachineValue;
use crate::core::{
    align_up, CodegenError, CodegenResult, ErrorMsg, FrameAllocator, FreezeGuard, RegisterFile,
    SrcLoc,
};
use crate::ir::{
    AsmConstraint, CompareOp, Function, InstIndex, InstOp, Ir, Liveness, Operand, Value,
};
use crate::link::{LinkFile, SymbolLocation};
use crate::target::Target;
use crate::types::{CallConv, Signedness, Type, TypeIndex, TypePool, PTR_SIZE, USIZE};

/// Outcome of generating one function: either the finished instruction
/// stream or a structured compile error the caller reports and moves past.
#[derive(Debug)]
pub enum FnResult {
    Mir(Mir),
    Fail(ErrorMsg),
}

/// Debug-information sink. The DWARF variant interns the types referenced
/// by variable debug info into a relocation list that the DWARF writer
/// consumes later; for other debug formats every hook is a no-op.
#[derive(Debug)]
pub enum DebugOutput {
    Dwarf(DwarfOutput),
    None,
}

/// Deferred type relocations for DWARF output, interned per function.
#[derive(Debug, Default)]
pub struct DwarfOutput {
    pub type_relocs: Vec<TypeIndex>,
    interned: HashMap<TypeIndex, u32>,
}

impl DwarfOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_type(&mut self, ty: TypeIndex) -> u32 {
        if let Some(&index) = self.interned.get(&ty) {
            return index;
        }
        let index = self.type_relocs.len() as u32;
        self.type_relocs.push(ty);
        self.interned.insert(ty, index);
        index
    }
}

/// One layer of the value-location table. Layers stack up during
/// conditional branches; resolution searches top-down.
#[derive(Debug, Default)]
struct Branch {
    inst_table: HashMap<InstIndex, MachineValue>,
}

/// Per-`block` state: the location every `br` agrees to deliver the
/// result to, and the forward jumps waiting for the block's end.
#[derive(Debug)]
struct BlockData {
    /// `None` until the first `br` with a runtime operand decides.
    mv: MachineValue,
    relocs: Vec<MirIndex>,
}

/// Integer binary operations sharing one lowering skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOpTag {
    Add,
    Sub,
    Mul,
    BitAnd,
    BitOr,
    Xor,
    BoolAnd,
    BoolOr,
}

/// Everything the single pass owns while lowering one function.
struct Context<'a> {
    ir: &'a Ir,
    liveness: &'a mut Liveness,
    types: &'a mut TypePool,
    link: &'a mut LinkFile,
    target: Target,
    func: &'a Function,
    debug: &'a mut DebugOutput,

    mir: Mir,
    err_msg: Option<ErrorMsg>,
    /// Source location failures are attributed to; advanced by dbg_stmt.
    cur_src_loc: SrcLoc,

    /// Locations of this function's own parameters, in declaration order.
    args: CallValues<'a>,
    arg_index: usize,

    register_file: RegisterFile<Register>,
    frame: FrameAllocator,
    branch_stack: Vec<Branch>,
    blocks: HashMap<InstIndex, BlockData>,
    /// `b` instructions at early returns, patched to the epilogue.
    exitlude_jump_relocs: Vec<MirIndex>,
}

/// Generate machine code for one function. The instruction stream is
/// returned for the downstream emit stage; lowering failures come back as
/// [`FnResult::Fail`] and the caller resumes with the next function.
pub fn generate(
    func: &Function,
    ir: &Ir,
    liveness: &mut Liveness,
    types: &mut TypePool,
    link: &mut LinkFile,
    target: Target,
    debug: &mut DebugOutput,
) -> CodegenResult<FnResult> {
    let arena = Bump::new();
    let mut ctx = Context {
        ir,
        liveness,
        types,
        link,
        target,
        func,
        debug,
        mir: Mir::new(),
        err_msg: None,
        cur_src_loc: func.src_loc,
        args: CallValues::new_in(&arena),
        arg_index: 0,
        register_file: RegisterFile::new(&CALLEE_PRESERVED_REGS),
        frame: FrameAllocator::new(),
        branch_stack: vec![Branch::default()],
        blocks: HashMap::new(),
        exitlude_jump_relocs: Vec::new(),
    };

    let result = ctx.resolve_signature().and_then(|()| ctx.gen());
    match result {
        Ok(()) => Ok(FnResult::Mir(ctx.mir)),
        Err(CodegenError::CodegenFail) => Ok(FnResult::Fail(
            ctx.err_msg.take().expect("err_msg set on codegen failure"),
        )),
        Err(CodegenError::OutOfRegisters) => Ok(FnResult::Fail(ErrorMsg::new(
            func.src_loc,
            "ran out of registers during code generation (this is a bug in the compiler)"
                .to_string(),
        ))),
        Err(err @ CodegenError::OutOfMemory) => Err(err),
    }
}

impl<'a> Context<'a> {
    /// Record a structured failure. The first message sticks; the slot is
    /// asserted unset before being written.
    fn fail<T>(&mut self, msg: String) -> CodegenResult<T> {
        debug_assert!(self.err_msg.is_none(), "err_msg already set");
        if self.err_msg.is_none() {
            self.err_msg = Some(ErrorMsg::new(self.cur_src_loc, msg));
        }
        Err(CodegenError::CodegenFail)
    }

    /// Classify this function's own parameters and return value.
    fn resolve_signature(&mut self) -> CodegenResult<()> {
        let (params, ret_ty, cc) = {
            let (params, ret_ty, cc) = self.types.fn_info(self.func.ty);
            (
                SmallVec::<[TypeIndex; 8]>::from_slice(params),
                ret_ty,
                cc,
            )
        };
        if cc == CallConv::Naked {
            debug_assert!(params.is_empty(), "naked functions take no parameters");
            self.args.return_value = MachineValue::Unreach;
            return Ok(());
        }
        let mut assigner = Aapcs64Assigner::new(self.target);
        for &param in &params {
            match assigner.assign_param(&*self.types, param) {
                Ok(mv) => self.args.args.push(mv),
                Err(err) => return self.fail(err.to_string()),
            }
        }
        self.args.return_value = match assigner.assign_return(&*self.types, ret_ty) {
            Ok(mv) => mv,
            Err(err) => return self.fail(err.to_string()),
        };
        self.args.stack_byte_count = assigner.stack_size();
        Ok(())
    }

    /// Emit the whole function: prologue placeholders, the body, then the
    /// back-patched epilogue.
    fn gen(&mut self) -> CodegenResult<()> {
        let cc = self.types.fn_info(self.func.ty).2;
        let ir = self.ir;
        if cc != CallConv::Naked {
            // stp x29, x30, [sp, #-16]!
            self.mir.push(mir::Inst::StpPreIndex {
                rt: FP,
                rt2: LR,
                rn: Register::Sp,
                offset: -16,
            });
            let push_regs_index = self.mir.push(mir::Inst::Nop);
            self.mir.push(mir::Inst::MovToFromSp {
                rd: FP,
                rn: Register::Sp,
            });
            let sub_sp_index = self.mir.push(mir::Inst::Nop);
            self.mir.push(mir::Inst::DbgPrologueEnd);

            self.gen_body(ir.main_body())?;

            // Which callee-preserved registers were touched.
            let mut mask = 0u32;
            let mut saved_count = 0u32;
            for &reg in CALLEE_PRESERVED_REGS.iter() {
                if self.register_file.was_ever_allocated(reg) {
                    mask |= 1 << reg.id();
                    saved_count += 1;
                }
            }
            // fp/lr pair plus one slot per saved register, kept 16-byte
            // aligned so sp stays aligned.
            let saved_regs_space = align_up(16 + 8 * saved_count, 16);
            let stack_size = align_up(
                self.frame.max_end_stack + saved_regs_space,
                self.frame.stack_align,
            ) - saved_regs_space;
            if stack_size > 0xfff {
                return self.fail(format!("stack too large: {} bytes", stack_size));
            }
            self.mir.set(push_regs_index, mir::Inst::PushRegs { mask });
            self.mir.set(
                sub_sp_index,
                mir::Inst::SubImmediate {
                    rd: Register::Sp,
                    rn: Register::Sp,
                    imm12: stack_size as u16,
                },
            );

            self.mir.push(mir::Inst::DbgEpilogueBegin);

            // An exitlude jump that would land on the very next
            // instruction is elided.
            if let Some(&last) = self.exitlude_jump_relocs.last() {
                if last + 2 == self.mir.len() {
                    self.mir.remove(last);
                    self.exitlude_jump_relocs.pop();
                }
            }
            let epilogue = self.mir.len();
            for i in 0..self.exitlude_jump_relocs.len() {
                let reloc = self.exitlude_jump_relocs[i];
                self.mir.set(reloc, mir::Inst::B { target: epilogue });
            }

            self.mir.push(mir::Inst::AddImmediate {
                rd: Register::Sp,
                rn: Register::Sp,
                imm12: stack_size as u16,
            });
            self.mir.push(mir::Inst::PopRegs { mask });
            self.mir.push(mir::Inst::LdpPostIndex {
                rt: FP,
                rt2: LR,
                rn: Register::Sp,
                offset: 16,
            });
            self.mir.push(mir::Inst::Ret { rn: LR });
        } else {
            self.mir.push(mir::Inst::DbgPrologueEnd);
            self.gen_body(ir.main_body())?;
            self.mir.push(mir::Inst::DbgEpilogueBegin);
        }
        self.mir.push(mir::Inst::DbgLine {
            line: self.func.end_loc.line,
            column: self.func.end_loc.column,
        });
        Ok(())
    }

    fn gen_body(&mut self, body: &[InstIndex]) -> CodegenResult<()> {
        for &inst in body {
            // Death processing and result insertion must not reallocate
            // mid-flight.
            self.ensure_process_death_capacity(Liveness::BPI);
            self.lower_inst(inst)?;
            debug_assert!(!self.register_file.frozen_regs_exist());
        }
        Ok(())
    }

    fn lower_inst(&mut self, inst: InstIndex) -> CodegenResult<()> {
        let ir = self.ir;
        log::trace!("lowering %{}: {:?}", inst, std::mem::discriminant(&ir.inst(inst).op));
        match &ir.inst(inst).op {
            InstOp::Arg { .. } => self.air_arg(inst),
            InstOp::Alloc => self.air_alloc(inst),
            InstOp::Add { lhs, rhs } => self.air_bin_op(inst, BinOpTag::Add, *lhs, *rhs),
            InstOp::Sub { lhs, rhs } => self.air_bin_op(inst, BinOpTag::Sub, *lhs, *rhs),
            InstOp::Mul { lhs, rhs } => self.air_bin_op(inst, BinOpTag::Mul, *lhs, *rhs),
            InstOp::BitAnd { lhs, rhs } => self.air_bin_op(inst, BinOpTag::BitAnd, *lhs, *rhs),
            InstOp::BitOr { lhs, rhs } => self.air_bin_op(inst, BinOpTag::BitOr, *lhs, *rhs),
            InstOp::Xor { lhs, rhs } => self.air_bin_op(inst, BinOpTag::Xor, *lhs, *rhs),
            InstOp::BoolAnd { lhs, rhs } => self.air_bin_op(inst, BinOpTag::BoolAnd, *lhs, *rhs),
            InstOp::BoolOr { lhs, rhs } => self.air_bin_op(inst, BinOpTag::BoolOr, *lhs, *rhs),
            InstOp::PtrAdd { lhs, rhs } => self.air_ptr_arithmetic(inst, BinOpTag::Add, *lhs, *rhs),
            InstOp::PtrSub { lhs, rhs } => self.air_ptr_arithmetic(inst, BinOpTag::Sub, *lhs, *rhs),
            InstOp::Not { operand } => self.air_not(inst, *operand),
            InstOp::Cmp { op, lhs, rhs } => self.air_cmp(inst, *op, *lhs, *rhs),
            InstOp::Bitcast { operand } => self.air_bitcast(inst, *operand),
            InstOp::IntCast { operand } => self.air_int_cast(inst, *operand),
            InstOp::Trunc { operand } => self.air_trunc(inst, *operand),
            InstOp::Load { ptr } => self.air_load(inst, *ptr),
            InstOp::Store { ptr, value } => self.air_store(inst, *ptr, *value),
            InstOp::IsErr { operand } => self.air_is_err(inst, *operand, false),
            InstOp::IsNonErr { operand } => self.air_is_err(inst, *operand, true),
            InstOp::UnwrapErrUnionPayload { operand } => {
                self.air_unwrap_errunion_payload(inst, *operand)
            }
            InstOp::UnwrapErrUnionErr { operand } => self.air_unwrap_errunion_err(inst, *operand),
            InstOp::WrapOptional { operand } => self.air_wrap_optional(inst, *operand),
            InstOp::OptionalPayload { operand } => self.air_optional_payload(inst, *operand),
            InstOp::IsNull { operand } => self.air_is_null(inst, *operand, false),
            InstOp::IsNonNull { operand } => self.air_is_null(inst, *operand, true),
            InstOp::StructFieldPtr { operand, field } => {
                self.air_struct_field_ptr(inst, *operand, *field)
            }
            InstOp::SlicePtr { operand } => self.air_slice_field(inst, *operand, true),
            InstOp::SliceLen { operand } => self.air_slice_field(inst, *operand, false),
            InstOp::Call { callee, args } => self.air_call(inst, *callee, args),
            InstOp::Ret { operand } => self.air_ret(inst, *operand),
            InstOp::RetLoad { .. } => self.fail("TODO implement ret_load".to_string()),
            InstOp::Block { body } => self.air_block(inst, *body),
            InstOp::Loop { body } => self.air_loop(inst, *body),
            InstOp::Br { block, operand } => self.air_br(inst, *block, *operand),
            InstOp::CondBr {
                cond,
                then_body,
                else_body,
            } => self.air_cond_br(inst, *cond, *then_body, *else_body),
            InstOp::SwitchBr { operand } => {
                let _ = self.resolve_inst(*operand)?;
                self.fail("TODO implement switch_br".to_string())
            }
            InstOp::Unreach => {
                self.finish_air_bookkeeping();
                Ok(())
            }
            InstOp::Breakpoint => {
                self.mir.push(mir::Inst::Brk { imm16: 1 });
                self.finish_air_bookkeeping();
                Ok(())
            }
            InstOp::DbgStmt { line, column } => {
                self.cur_src_loc = SrcLoc::new(*line, *column);
                self.mir.push(mir::Inst::DbgLine {
                    line: *line,
                    column: *column,
                });
                self.finish_air_bookkeeping();
                Ok(())
            }
            InstOp::Assembly {
                source,
                outputs,
                inputs,
                is_volatile,
            } => self.air_assembly(inst, source, outputs, inputs, *is_volatile),
            InstOp::Constant { value } => self.air_constant(inst, *value),
            InstOp::FAdd { .. } => {
                self.fail("TODO implement floating-point arithmetic".to_string())
            }
            InstOp::AtomicRmw { .. } => self.fail("TODO implement atomic operations".to_string()),
            InstOp::TagName { .. } => self.fail("TODO implement tag name lookups".to_string()),
            InstOp::ErrorName { .. } => self.fail("TODO implement error name lookups".to_string()),
            InstOp::ArrayInit => self.fail("TODO implement array initialization".to_string()),
            InstOp::UnionInit => self.fail("TODO implement union initialization".to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Value-location table
    // ------------------------------------------------------------------

    /// Resolve an operand to its current machine value.
    fn resolve_inst(&mut self, operand: Operand) -> CodegenResult<MachineValue> {
        match operand {
            Operand::None => Ok(MachineValue::None),
            Operand::Const(value) => self.gen_typed_value(value),
            Operand::Inst(inst) => Ok(self.get_resolved_value(inst)),
        }
    }

    /// Top-down search of the branch stack.
    fn get_resolved_value(&self, inst: InstIndex) -> MachineValue {
        for branch in self.branch_stack.iter().rev() {
            if let Some(&mv) = branch.inst_table.get(&inst) {
                debug_assert!(
                    mv != MachineValue::Dead,
                    "%{} resolved after its death",
                    inst
                );
                return mv;
            }
        }
        unreachable!("no machine value recorded for %{}", inst)
    }

    /// Map a constant-table entry to a machine value. No code is emitted;
    /// the value is materialized by whichever mover consumes it.
    fn gen_typed_value(&mut self, value_index: u32) -> CodegenResult<MachineValue> {
        let ir = self.ir;
        let tv = ir.value(value_index);
        match &tv.val {
            Value::Undef => Ok(MachineValue::Undef),
            Value::Int(x) => {
                if self.types.abi_size(tv.ty) <= PTR_SIZE {
                    Ok(MachineValue::Immediate(*x))
                } else {
                    self.fail("TODO materialize constants larger than 8 bytes".to_string())
                }
            }
            Value::Function(func) => {
                Ok(symbol_location_mv(self.link.function_location(*func)))
            }
            Value::ExternFn(_) => {
                self.fail("TODO implement non-call references to extern functions".to_string())
            }
            Value::Bytes(_) => {
                Ok(symbol_location_mv(self.link.constant_location(value_index)))
            }
        }
    }

    fn ensure_process_death_capacity(&mut self, additional: usize) {
        let branch = self.branch_stack.last_mut().expect("branch stack empty");
        branch.inst_table.reserve(additional);
    }

    /// Mark a value dead and release its register.
    fn process_death(&mut self, inst: InstIndex) {
        let prev = self.get_resolved_value(inst);
        log::trace!("%{} dies holding {:?}", inst, prev);
        let branch = self.branch_stack.last_mut().expect("branch stack empty");
        branch.inst_table.insert(inst, MachineValue::Dead);
        if let MachineValue::Register(reg) = prev {
            if self.register_file.is_allocated(reg) {
                self.register_file.free(reg);
            }
        }
    }

    /// Finish an instruction: process operand deaths, record the result,
    /// and re-acquire a result register that death processing just freed.
    fn finish_air(&mut self, inst: InstIndex, result: MachineValue, operands: &[Operand]) {
        debug_assert!(operands.len() <= Liveness::BPI - 1);
        for (i, operand) in operands.iter().enumerate() {
            if let Operand::Inst(target) = operand {
                if self.liveness.operand_dies(inst, i) {
                    self.process_death(*target);
                }
            }
        }
        self.record_result(inst, result);
        self.finish_air_bookkeeping();
    }

    /// Variant of [`Self::finish_air`] for instructions with more
    /// operands than the inline tomb budget.
    fn finish_air_big(&mut self, inst: InstIndex, result: MachineValue) {
        let operands = self.ir.operands_of(inst);
        let mut tomb = self.liveness.big_tomb(inst);
        for operand in operands {
            let dies = tomb.feed();
            if !dies {
                continue;
            }
            if let Operand::Inst(target) = operand {
                self.process_death(target);
            }
        }
        self.record_result(inst, result);
        self.finish_air_bookkeeping();
    }

    fn record_result(&mut self, inst: InstIndex, result: MachineValue) {
        if self.liveness.is_unused(inst) {
            return;
        }
        log::debug!("%{} => {:?}", inst, result);
        let branch = self.branch_stack.last_mut().expect("branch stack empty");
        branch.inst_table.insert(inst, result);
        if let MachineValue::Register(reg) = result {
            // An operand may be the same machine value as the result
            // (bitcast and friends). If it died, its register was just
            // freed; take it back under the new owner.
            if self.register_file.is_free(reg) {
                self.register_file.get_assume_free(reg, Some(inst));
            }
        }
    }

    fn finish_air_bookkeeping(&self) {
        debug_assert!(!self.register_file.frozen_regs_exist());
    }

    /// Transfer a dying operand's storage to the current instruction.
    /// Clears the death bit so the generic finisher does not double-free.
    fn reuse_operand(
        &mut self,
        inst: InstIndex,
        operand: Operand,
        op_index: usize,
        mv: MachineValue,
    ) -> bool {
        if !self.liveness.operand_dies(inst, op_index) {
            return false;
        }
        let target = match operand {
            Operand::Inst(target) => target,
            _ => return false,
        };
        match mv {
            MachineValue::Register(reg) => {
                if self.register_file.is_allocated(reg) {
                    self.register_file.reassign(reg, Some(inst));
                }
                log::debug!("%{} reusing {} of %{}", inst, reg, target);
            }
            MachineValue::StackOffset(_) => {}
            _ => return false,
        }
        self.liveness.clear_operand_death(inst, op_index);
        // We are now responsible for the part of death processing that
        // does not free the storage.
        let branch = self.branch_stack.last_mut().expect("branch stack empty");
        branch.inst_table.insert(target, MachineValue::Dead);
        true
    }

    // ------------------------------------------------------------------
    // Register and stack allocation
    // ------------------------------------------------------------------

    /// Allocate a register, spilling a victim's value to the stack if the
    /// pool is exhausted.
    fn reg_alloc(&mut self, owner: Option<InstIndex>) -> CodegenResult<Register> {
        if let Some(reg) = self.register_file.try_alloc(owner) {
            return Ok(reg);
        }
        let (victim, victim_owner) = self
            .register_file
            .spill_victim()
            .ok_or(CodegenError::OutOfRegisters)?;
        self.spill_instruction(victim, victim_owner)?;
        self.register_file.reassign(victim, owner);
        Ok(victim)
    }

    /// Atomic multi-register allocation, spilling until enough registers
    /// are free.
    fn reg_alloc_many<const N: usize>(
        &mut self,
        owners: [Option<InstIndex>; N],
    ) -> CodegenResult<[Register; N]> {
        loop {
            if let Some(regs) = self.register_file.try_alloc_many(&owners) {
                let mut out = [Register::Xzr; N];
                out.copy_from_slice(&regs);
                return Ok(out);
            }
            let (victim, victim_owner) = self
                .register_file
                .spill_victim()
                .ok_or(CodegenError::OutOfRegisters)?;
            self.spill_instruction(victim, victim_owner)?;
            self.register_file.free(victim);
        }
    }

    /// Move a register-resident value to a fresh stack slot and point the
    /// location table at it. The register itself stays allocated; the
    /// caller hands it to its new owner.
    fn spill_instruction(&mut self, reg: Register, owner: InstIndex) -> CodegenResult<()> {
        log::debug!("spilling %{} out of {}", owner, reg);
        let stack_mv = self.alloc_reg_or_mem(owner, false)?;
        let reg_mv = self.get_resolved_value(owner);
        debug_assert_eq!(reg_mv, MachineValue::Register(reg));
        let branch = self.branch_stack.last_mut().expect("branch stack empty");
        branch.inst_table.insert(owner, stack_mv);
        let ty = self.ir.ty_of_inst(owner);
        let offset = match stack_mv {
            MachineValue::StackOffset(offset) => offset,
            _ => unreachable!("spill target must be a stack slot"),
        };
        self.gen_set_stack(ty, offset, reg_mv)
    }

    /// Pick storage for an instruction's result: a register when allowed
    /// and the type fits in one, otherwise a stack slot.
    fn alloc_reg_or_mem(&mut self, inst: InstIndex, reg_ok: bool) -> CodegenResult<MachineValue> {
        let ty = self.ir.ty_of_inst(inst);
        let size = self.types.abi_size(ty);
        let align = self.types.abi_alignment(ty);
        if reg_ok && size <= PTR_SIZE {
            if let Some(reg) = self.register_file.try_alloc(Some(inst)) {
                return Ok(MachineValue::Register(reg));
            }
        }
        let offset = self.frame.alloc_mem(Some(inst), size, align.max(1));
        Ok(MachineValue::StackOffset(offset))
    }

    /// Stack slot for an `alloc` instruction's element type.
    fn alloc_mem_ptr(&mut self, inst: InstIndex) -> u32 {
        let ptr_ty = self.ir.ty_of_inst(inst);
        let elem_ty = self.types.child_type(ptr_ty);
        let size = self.types.abi_size(elem_ty);
        let align = self.types.abi_alignment(elem_ty);
        self.frame.alloc_mem(Some(inst), size, align.max(1))
    }

    /// Materialize a value into an anonymous scratch register. The caller
    /// frees it once the last instruction reading it has been emitted.
    fn copy_to_tmp_register(
        &mut self,
        ty: TypeIndex,
        mv: MachineValue,
    ) -> CodegenResult<Register> {
        let reg = self.reg_alloc(None)?;
        self.gen_set_reg(ty, reg, mv)?;
        Ok(reg)
    }

    /// Materialize a value into a register owned by `inst`.
    fn copy_to_new_register(
        &mut self,
        inst: InstIndex,
        mv: MachineValue,
    ) -> CodegenResult<MachineValue> {
        let reg = self.reg_alloc(Some(inst))?;
        let ty = self.ir.ty_of_inst(inst);
        self.gen_set_reg(ty, reg, mv)?;
        Ok(MachineValue::Register(reg))
    }

    // ------------------------------------------------------------------
    // Value movers
    // ------------------------------------------------------------------

    /// Move `value` into `loc`, whatever shapes both have.
    fn set_reg_or_mem(
        &mut self,
        ty: TypeIndex,
        loc: MachineValue,
        value: MachineValue,
    ) -> CodegenResult<()> {
        match loc {
            MachineValue::None => Ok(()),
            MachineValue::Register(reg) => self.gen_set_reg(ty, reg, value),
            MachineValue::StackOffset(offset) => self.gen_set_stack(ty, offset, value),
            MachineValue::Memory(_) => {
                self.fail("TODO implement writes to memory destinations".to_string())
            }
            MachineValue::Unreach
            | MachineValue::Dead
            | MachineValue::Undef
            | MachineValue::Immediate(_)
            | MachineValue::PtrStackOffset(_)
            | MachineValue::EmbeddedInCode(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => {
                unreachable!("{:?} is not a move destination", loc)
            }
        }
    }

    /// Materialize any machine value into a register.
    fn gen_set_reg(
        &mut self,
        ty: TypeIndex,
        reg: Register,
        mv: MachineValue,
    ) -> CodegenResult<()> {
        let size = self.types.abi_size(ty);
        match mv {
            MachineValue::None | MachineValue::Unreach | MachineValue::Dead => {
                unreachable!("{:?} materialized into a register", mv)
            }
            MachineValue::Undef => {
                if !self.func.safety {
                    return Ok(());
                }
                // Recognizable garbage.
                self.gen_set_reg(ty, reg, MachineValue::Immediate(0xaaaa_aaaa_aaaa_aaaa))
            }
            MachineValue::Immediate(value) => {
                let rd = reg.alias(size.max(4));
                self.mir.push(mir::Inst::Movz {
                    rd,
                    imm16: (value & 0xffff) as u16,
                    hw: 0,
                });
                for hw in 1..4u8 {
                    let chunk = (value >> (16 * hw as u32)) & 0xffff;
                    if chunk != 0 {
                        self.mir.push(mir::Inst::Movk {
                            rd,
                            imm16: chunk as u16,
                            hw,
                        });
                    }
                }
                Ok(())
            }
            MachineValue::Register(src) => {
                if src.to_x() != reg.to_x() {
                    self.mir.push(mir::Inst::MovRegister {
                        rd: reg.alias(size.max(4)),
                        rn: src.alias(size.max(4)),
                    });
                }
                Ok(())
            }
            MachineValue::CompareFlagsSigned(op) | MachineValue::CompareFlagsUnsigned(op) => {
                let signedness = match mv {
                    MachineValue::CompareFlagsSigned(_) => Signedness::Signed,
                    _ => Signedness::Unsigned,
                };
                let cond = Cond::from_compare_op(op, signedness);
                // cset is csinc underneath; the encoding takes the
                // negated condition.
                self.mir.push(mir::Inst::Cset {
                    rd: reg.alias(size.max(1)),
                    cond: cond.invert(),
                });
                Ok(())
            }
            MachineValue::PtrStackOffset(offset) => {
                let elem_ty = self.types.child_type(ty);
                let adjusted = offset + self.types.abi_size(elem_ty);
                if adjusted > 0xfff {
                    return self.fail("TODO support stack offsets larger than 4095".to_string());
                }
                self.mir.push(mir::Inst::SubImmediate {
                    rd: reg.to_x(),
                    rn: FP,
                    imm12: adjusted as u16,
                });
                Ok(())
            }
            MachineValue::StackOffset(offset) => {
                if size > PTR_SIZE {
                    return self.fail(format!(
                        "TODO load {}-byte values into a register",
                        size
                    ));
                }
                let byte_offset = -((offset + size) as i32);
                self.gen_ldr_register(reg, FP, byte_offset, size)
            }
            MachineValue::Memory(addr) => {
                self.gen_set_reg(USIZE, reg, MachineValue::Immediate(addr))?;
                self.mir.push(mir::Inst::LdrImmediate {
                    rt: reg.to_x(),
                    rn: reg.to_x(),
                    offset: 0,
                });
                Ok(())
            }
            MachineValue::GotLoad(sym_index) => {
                self.mir.push(mir::Inst::LoadMemoryGot {
                    rt: reg.to_x(),
                    atom_index: self.func.atom_index,
                    sym_index,
                });
                Ok(())
            }
            MachineValue::DirectLoad(sym_index) => {
                self.mir.push(mir::Inst::LoadMemoryDirect {
                    rt: reg.to_x(),
                    atom_index: self.func.atom_index,
                    sym_index,
                });
                Ok(())
            }
            MachineValue::EmbeddedInCode(_) | MachineValue::PtrEmbeddedInCode(_) => {
                self.fail("TODO implement values embedded in code".to_string())
            }
        }
    }

    /// Materialize any machine value into a stack slot.
    fn gen_set_stack(
        &mut self,
        ty: TypeIndex,
        stack_offset: u32,
        mv: MachineValue,
    ) -> CodegenResult<()> {
        let size = self.types.abi_size(ty);
        match mv {
            MachineValue::None | MachineValue::Unreach | MachineValue::Dead => {
                unreachable!("{:?} materialized into a stack slot", mv)
            }
            MachineValue::Undef => {
                if !self.func.safety {
                    return Ok(());
                }
                match size {
                    1 => self.gen_set_stack(ty, stack_offset, MachineValue::Immediate(0xaa)),
                    2 => self.gen_set_stack(ty, stack_offset, MachineValue::Immediate(0xaaaa)),
                    4 => {
                        self.gen_set_stack(ty, stack_offset, MachineValue::Immediate(0xaaaa_aaaa))
                    }
                    8 => self.gen_set_stack(
                        ty,
                        stack_offset,
                        MachineValue::Immediate(0xaaaa_aaaa_aaaa_aaaa),
                    ),
                    _ => self.fail("TODO implement memset for undefined values".to_string()),
                }
            }
            MachineValue::Register(reg) => {
                let byte_offset = -((stack_offset + size) as i32);
                self.gen_str_register(reg, FP, byte_offset, size)
            }
            MachineValue::StackOffset(src_offset) => {
                if src_offset == stack_offset {
                    return Ok(());
                }
                if size <= PTR_SIZE {
                    let tmp = self.copy_to_tmp_register(ty, mv)?;
                    self.gen_set_stack(ty, stack_offset, MachineValue::Register(tmp))?;
                    self.register_file.free(tmp);
                    Ok(())
                } else {
                    self.gen_inline_memcpy(stack_offset, mv, size)
                }
            }
            MachineValue::Memory(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_) => {
                if size <= PTR_SIZE {
                    let tmp = self.copy_to_tmp_register(ty, mv)?;
                    self.gen_set_stack(ty, stack_offset, MachineValue::Register(tmp))?;
                    self.register_file.free(tmp);
                    Ok(())
                } else {
                    self.gen_inline_memcpy(stack_offset, mv, size)
                }
            }
            MachineValue::Immediate(_)
            | MachineValue::PtrStackOffset(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => {
                let tmp = self.copy_to_tmp_register(ty, mv)?;
                self.gen_set_stack(ty, stack_offset, MachineValue::Register(tmp))?;
                self.register_file.free(tmp);
                Ok(())
            }
            MachineValue::EmbeddedInCode(_) | MachineValue::PtrEmbeddedInCode(_) => {
                self.fail("TODO implement values embedded in code".to_string())
            }
        }
    }

    /// Sized load: `ldrb`/`ldrh`/`ldr` by ABI size.
    fn gen_ldr_register(
        &mut self,
        rt: Register,
        rn: Register,
        offset: i32,
        abi_size: u32,
    ) -> CodegenResult<()> {
        let inst = match abi_size {
            1 => mir::Inst::LdrbImmediate {
                rt: rt.to_w(),
                rn,
                offset,
            },
            2 => mir::Inst::LdrhImmediate {
                rt: rt.to_w(),
                rn,
                offset,
            },
            4 => mir::Inst::LdrImmediate {
                rt: rt.to_w(),
                rn,
                offset,
            },
            8 => mir::Inst::LdrImmediate {
                rt: rt.to_x(),
                rn,
                offset,
            },
            3 | 5 | 6 | 7 => {
                return self.fail(format!("TODO implement loads of ABI size {}", abi_size))
            }
            _ => unreachable!("oversized load must go through the inline memcpy"),
        };
        self.mir.push(inst);
        Ok(())
    }

    /// Sized store: `strb`/`strh`/`str` by ABI size.
    fn gen_str_register(
        &mut self,
        rt: Register,
        rn: Register,
        offset: i32,
        abi_size: u32,
    ) -> CodegenResult<()> {
        let inst = match abi_size {
            1 => mir::Inst::StrbImmediate {
                rt: rt.to_w(),
                rn,
                offset,
            },
            2 => mir::Inst::StrhImmediate {
                rt: rt.to_w(),
                rn,
                offset,
            },
            4 => mir::Inst::StrImmediate {
                rt: rt.to_w(),
                rn,
                offset,
            },
            8 => mir::Inst::StrImmediate {
                rt: rt.to_x(),
                rn,
                offset,
            },
            3 | 5 | 6 | 7 => {
                return self.fail(format!("TODO implement stores of ABI size {}", abi_size))
            }
            _ => unreachable!("oversized store must go through the inline memcpy"),
        };
        self.mir.push(inst);
        Ok(())
    }

    /// Byte-copy loop for moves wider than a register. Five scratch
    /// registers are taken atomically: source, destination, length,
    /// counter, and the byte in flight.
    fn gen_inline_memcpy(
        &mut self,
        dst_offset: u32,
        src: MachineValue,
        len: u32,
    ) -> CodegenResult<()> {
        let [src_reg, dst_reg, len_reg, count_reg, tmp_reg] =
            self.reg_alloc_many([None, None, None, None, None])?;

        match src {
            MachineValue::StackOffset(src_offset) => {
                let adjusted = src_offset + len;
                if adjusted > 0xfff {
                    return self.fail("TODO support stack offsets larger than 4095".to_string());
                }
                self.mir.push(mir::Inst::SubImmediate {
                    rd: src_reg,
                    rn: FP,
                    imm12: adjusted as u16,
                });
            }
            MachineValue::Memory(addr) => {
                self.gen_set_reg(USIZE, src_reg, MachineValue::Immediate(addr))?;
            }
            MachineValue::GotLoad(sym_index) => {
                self.mir.push(mir::Inst::LoadMemoryPtrGot {
                    rt: src_reg,
                    atom_index: self.func.atom_index,
                    sym_index,
                });
            }
            MachineValue::DirectLoad(sym_index) => {
                self.mir.push(mir::Inst::LoadMemoryPtrDirect {
                    rt: src_reg,
                    atom_index: self.func.atom_index,
                    sym_index,
                });
            }
            _ => unreachable!("memcpy source must be addressable"),
        }

        let dst_adjusted = dst_offset + len;
        if dst_adjusted > 0xfff {
            return self.fail("TODO support stack offsets larger than 4095".to_string());
        }
        self.mir.push(mir::Inst::SubImmediate {
            rd: dst_reg,
            rn: FP,
            imm12: dst_adjusted as u16,
        });
        self.gen_set_reg(USIZE, len_reg, MachineValue::Immediate(len as u64))?;
        self.mir.push(mir::Inst::Movz {
            rd: count_reg,
            imm16: 0,
            hw: 0,
        });

        // loop: cmp count, len; b.hs end
        let loop_start = self.mir.len();
        self.mir.push(mir::Inst::CmpShiftedRegister {
            rn: count_reg,
            rm: len_reg,
            shift: 0,
        });
        let exit_jump = self.mir.push(mir::Inst::BCond {
            cond: Cond::Hs,
            target: 0,
        });
        self.mir.push(mir::Inst::LdrbRegister {
            rt: tmp_reg.to_w(),
            rn: src_reg,
            rm: count_reg,
        });
        self.mir.push(mir::Inst::StrbRegister {
            rt: tmp_reg.to_w(),
            rn: dst_reg,
            rm: count_reg,
        });
        self.mir.push(mir::Inst::AddImmediate {
            rd: count_reg,
            rn: count_reg,
            imm12: 1,
        });
        self.mir.push(mir::Inst::B { target: loop_start });
        let end = self.mir.len();
        self.mir.set(
            exit_jump,
            mir::Inst::BCond {
                cond: Cond::Hs,
                target: end,
            },
        );

        for reg in [src_reg, dst_reg, len_reg, count_reg, tmp_reg] {
            self.register_file.free(reg);
        }
        Ok(())
    }

    /// Load through a pointer machine value into `dst`.
    fn load_value(
        &mut self,
        dst: MachineValue,
        ptr: MachineValue,
        ptr_ty: TypeIndex,
    ) -> CodegenResult<()> {
        let elem_ty = self.types.child_type(ptr_ty);
        let size = self.types.abi_size(elem_ty);
        match ptr {
            MachineValue::None | MachineValue::Unreach | MachineValue::Dead => {
                unreachable!("load through {:?}", ptr)
            }
            MachineValue::Undef => self.fail("TODO load through an undefined pointer".to_string()),
            MachineValue::Immediate(addr) => {
                self.set_reg_or_mem(elem_ty, dst, MachineValue::Memory(addr))
            }
            MachineValue::PtrStackOffset(offset) => {
                self.set_reg_or_mem(elem_ty, dst, MachineValue::StackOffset(offset))
            }
            MachineValue::Register(ptr_reg) => {
                let guard = self.register_file.freeze(&[ptr_reg]);
                let result = self.load_through_register(dst, ptr_reg, elem_ty, size);
                self.register_file.unfreeze(guard);
                result
            }
            MachineValue::StackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_) => {
                let addr_reg = self.copy_to_tmp_register(ptr_ty, ptr)?;
                let result = self.load_value(dst, MachineValue::Register(addr_reg), ptr_ty);
                self.register_file.free(addr_reg);
                result
            }
            MachineValue::EmbeddedInCode(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => {
                unreachable!("{:?} is not a pointer", ptr)
            }
        }
    }

    fn load_through_register(
        &mut self,
        dst: MachineValue,
        ptr_reg: Register,
        elem_ty: TypeIndex,
        size: u32,
    ) -> CodegenResult<()> {
        match dst {
            MachineValue::Register(dst_reg) => self.gen_ldr_register(dst_reg, ptr_reg, 0, size),
            MachineValue::StackOffset(offset) => {
                if size <= PTR_SIZE {
                    let tmp = self.reg_alloc(None)?;
                    self.gen_ldr_register(tmp, ptr_reg, 0, size)?;
                    self.gen_set_stack(elem_ty, offset, MachineValue::Register(tmp))?;
                    self.register_file.free(tmp);
                    Ok(())
                } else {
                    self.fail("TODO implement large loads through a register pointer".to_string())
                }
            }
            _ => unreachable!("{:?} is not a load destination", dst),
        }
    }

    /// Store a value through a pointer machine value.
    fn store_value(
        &mut self,
        ptr: MachineValue,
        value: MachineValue,
        ptr_ty: TypeIndex,
        value_ty: TypeIndex,
    ) -> CodegenResult<()> {
        let size = self.types.abi_size(value_ty);
        match ptr {
            MachineValue::None | MachineValue::Unreach | MachineValue::Dead => {
                unreachable!("store through {:?}", ptr)
            }
            MachineValue::Undef => {
                self.fail("TODO store through an undefined pointer".to_string())
            }
            MachineValue::PtrStackOffset(offset) => self.gen_set_stack(value_ty, offset, value),
            MachineValue::Immediate(_) => {
                let addr_reg = self.copy_to_tmp_register(ptr_ty, ptr)?;
                let result =
                    self.store_value(MachineValue::Register(addr_reg), value, ptr_ty, value_ty);
                self.register_file.free(addr_reg);
                result
            }
            MachineValue::Register(ptr_reg) => {
                if size > PTR_SIZE {
                    return self
                        .fail("TODO implement large stores through a register pointer".to_string());
                }
                let guard = self.register_file.freeze(&[ptr_reg]);
                let (value_reg, is_tmp) = match value {
                    MachineValue::Register(reg) => (reg, false),
                    _ => (self.copy_to_tmp_register(value_ty, value)?, true),
                };
                let result = self.gen_str_register(value_reg, ptr_reg, 0, size);
                if is_tmp {
                    self.register_file.free(value_reg);
                }
                self.register_file.unfreeze(guard);
                result
            }
            MachineValue::StackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_) => {
                let addr_reg = self.copy_to_tmp_register(ptr_ty, ptr)?;
                let result =
                    self.store_value(MachineValue::Register(addr_reg), value, ptr_ty, value_ty);
                self.register_file.free(addr_reg);
                result
            }
            MachineValue::EmbeddedInCode(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => {
                unreachable!("{:?} is not a pointer", ptr)
            }
        }
    }

    // ------------------------------------------------------------------
    // Lowerers
    // ------------------------------------------------------------------

    fn air_arg(&mut self, inst: InstIndex) -> CodegenResult<()> {
        let arg_mv = self.args.args[self.arg_index];
        self.arg_index += 1;
        let ty = self.ir.ty_of_inst(inst);
        let mv = match arg_mv {
            MachineValue::Register(reg) => {
                // Home the parameter to a stack slot so the argument
                // register is free for the rest of the body.
                let size = self.types.abi_size(ty);
                let align = self.types.abi_alignment(ty);
                let offset = self.frame.alloc_mem(Some(inst), size, align.max(1));
                self.gen_set_stack(ty, offset, MachineValue::Register(reg))?;
                MachineValue::StackOffset(offset)
            }
            MachineValue::StackOffset(_) => {
                return self.fail("TODO support stack-passed parameters".to_string())
            }
            MachineValue::None => MachineValue::None,
            _ => unreachable!("{:?} is not a parameter location", arg_mv),
        };
        if let DebugOutput::Dwarf(dwarf) = &mut self.debug {
            dwarf.intern_type(ty);
        }
        self.finish_air(inst, mv, &[]);
        Ok(())
    }

    fn air_alloc(&mut self, inst: InstIndex) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[]);
            return Ok(());
        }
        let offset = self.alloc_mem_ptr(inst);
        self.finish_air(inst, MachineValue::PtrStackOffset(offset), &[]);
        Ok(())
    }

    fn air_constant(&mut self, inst: InstIndex, value: u32) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[]);
            return Ok(());
        }
        let result = self.gen_typed_value(value)?;
        self.finish_air(inst, result, &[]);
        Ok(())
    }

    fn air_bin_op(
        &mut self,
        inst: InstIndex,
        tag: BinOpTag,
        lhs_op: Operand,
        rhs_op: Operand,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[lhs_op, rhs_op]);
            return Ok(());
        }
        let lhs = self.resolve_inst(lhs_op)?;
        let rhs = self.resolve_inst(rhs_op)?;
        let lhs_ty = self.ir.ty_of(lhs_op);
        let rhs_ty = self.ir.ty_of(rhs_op);
        let result = self.bin_op(Some(inst), tag, lhs_op, rhs_op, lhs, rhs, lhs_ty, rhs_ty)?;
        self.finish_air(inst, result, &[lhs_op, rhs_op]);
        Ok(())
    }

    fn air_ptr_arithmetic(
        &mut self,
        inst: InstIndex,
        tag: BinOpTag,
        lhs_op: Operand,
        rhs_op: Operand,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[lhs_op, rhs_op]);
            return Ok(());
        }
        let ptr_ty = self.ir.ty_of_inst(inst);
        let elem_ty = self.types.child_type(ptr_ty);
        let elem_size = self.types.abi_size(elem_ty);
        if elem_size != 1 {
            return self.fail(format!(
                "TODO implement pointer arithmetic with element size {}",
                elem_size
            ));
        }
        let lhs = self.resolve_inst(lhs_op)?;
        let rhs = self.resolve_inst(rhs_op)?;
        let lhs_ty = self.ir.ty_of(lhs_op);
        let rhs_ty = self.ir.ty_of(rhs_op);
        let result = self.bin_op(Some(inst), tag, lhs_op, rhs_op, lhs, rhs, lhs_ty, rhs_ty)?;
        self.finish_air(inst, result, &[lhs_op, rhs_op]);
        Ok(())
    }

    /// Form selection for integer binary operations.
    #[allow(clippy::too_many_arguments)]
    fn bin_op(
        &mut self,
        inst: Option<InstIndex>,
        tag: BinOpTag,
        lhs_op: Operand,
        rhs_op: Operand,
        lhs: MachineValue,
        rhs: MachineValue,
        lhs_ty: TypeIndex,
        rhs_ty: TypeIndex,
    ) -> CodegenResult<MachineValue> {
        match self.types.int_info(lhs_ty) {
            Some(info) if info.bits <= 64 => {}
            Some(_) => {
                return self
                    .fail("TODO implement arithmetic on integers wider than 64 bits".to_string())
            }
            None => {
                return self.fail(format!(
                    "TODO implement binary operations for {:?}",
                    self.types.get(lhs_ty)
                ))
            }
        }
        match tag {
            BinOpTag::Add | BinOpTag::Sub => {
                if let MachineValue::Immediate(imm) = rhs {
                    if imm <= 0xfff {
                        return self
                            .bin_op_immediate(inst, tag, lhs_op, 0, lhs, imm as u16, lhs_ty);
                    }
                }
                // Addition commutes; a small immediate on the left can
                // swap into the immediate form.
                if tag == BinOpTag::Add {
                    if let MachineValue::Immediate(imm) = lhs {
                        if imm <= 0xfff {
                            return self
                                .bin_op_immediate(inst, tag, rhs_op, 1, rhs, imm as u16, rhs_ty);
                        }
                    }
                }
                self.bin_op_register(inst, tag, lhs_op, rhs_op, lhs, rhs, lhs_ty, rhs_ty)
            }
            BinOpTag::Mul
            | BinOpTag::BitAnd
            | BinOpTag::BitOr
            | BinOpTag::Xor
            | BinOpTag::BoolAnd
            | BinOpTag::BoolOr => {
                self.bin_op_register(inst, tag, lhs_op, rhs_op, lhs, rhs, lhs_ty, rhs_ty)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn bin_op_register(
        &mut self,
        inst: Option<InstIndex>,
        tag: BinOpTag,
        lhs_op: Operand,
        rhs_op: Operand,
        lhs: MachineValue,
        rhs: MachineValue,
        lhs_ty: TypeIndex,
        rhs_ty: TypeIndex,
    ) -> CodegenResult<MachineValue> {
        let size = self.types.abi_size(lhs_ty);
        let mut guards: SmallVec<[FreezeGuard<Register>; 4]> = SmallVec::new();
        let mut temps: SmallVec<[Register; 2]> = SmallVec::new();
        if let MachineValue::Register(reg) = lhs {
            guards.push(self.register_file.freeze(&[reg]));
        }
        if let MachineValue::Register(reg) = rhs {
            guards.push(self.register_file.freeze(&[reg]));
        }
        let lhs_reg = match lhs {
            MachineValue::Register(reg) => reg,
            _ => {
                let reg = self.reg_alloc(None)?;
                guards.push(self.register_file.freeze(&[reg]));
                temps.push(reg);
                reg
            }
        };
        let rhs_reg = match rhs {
            MachineValue::Register(reg) => reg,
            _ => {
                let reg = self.reg_alloc(None)?;
                guards.push(self.register_file.freeze(&[reg]));
                temps.push(reg);
                reg
            }
        };
        let dest_reg = match inst {
            Some(inst) => {
                if lhs.is_register() && self.reuse_operand(inst, lhs_op, 0, lhs) {
                    lhs_reg
                } else if rhs.is_register() && self.reuse_operand(inst, rhs_op, 1, rhs) {
                    rhs_reg
                } else {
                    self.reg_alloc(Some(inst))?
                }
            }
            None => self.reg_alloc(None)?,
        };
        if !lhs.is_register() {
            self.gen_set_reg(lhs_ty, lhs_reg, lhs)?;
        }
        if !rhs.is_register() {
            self.gen_set_reg(rhs_ty, rhs_reg, rhs)?;
        }

        let rd = dest_reg.alias(size);
        let rn = lhs_reg.alias(size);
        let rm = rhs_reg.alias(size);
        let mir_inst = match tag {
            BinOpTag::Add => mir::Inst::AddShiftedRegister {
                rd,
                rn,
                rm,
                shift: 0,
            },
            BinOpTag::Sub => mir::Inst::SubShiftedRegister {
                rd,
                rn,
                rm,
                shift: 0,
            },
            BinOpTag::Mul => mir::Inst::Mul { rd, rn, rm },
            BinOpTag::BitAnd | BinOpTag::BoolAnd => mir::Inst::AndShiftedRegister {
                rd,
                rn,
                rm,
                shift: 0,
            },
            BinOpTag::BitOr | BinOpTag::BoolOr => mir::Inst::OrrShiftedRegister {
                rd,
                rn,
                rm,
                shift: 0,
            },
            BinOpTag::Xor => mir::Inst::EorShiftedRegister {
                rd,
                rn,
                rm,
                shift: 0,
            },
        };
        self.mir.push(mir_inst);

        for guard in guards {
            self.register_file.unfreeze(guard);
        }
        for reg in temps {
            if reg != dest_reg {
                self.register_file.free(reg);
            }
        }
        Ok(MachineValue::Register(dest_reg))
    }

    fn bin_op_immediate(
        &mut self,
        inst: Option<InstIndex>,
        tag: BinOpTag,
        lhs_op: Operand,
        lhs_index: usize,
        lhs: MachineValue,
        imm: u16,
        op_ty: TypeIndex,
    ) -> CodegenResult<MachineValue> {
        let size = self.types.abi_size(op_ty);
        let mut guards: SmallVec<[FreezeGuard<Register>; 2]> = SmallVec::new();
        let mut temps: SmallVec<[Register; 1]> = SmallVec::new();
        if let MachineValue::Register(reg) = lhs {
            guards.push(self.register_file.freeze(&[reg]));
        }
        let lhs_reg = match lhs {
            MachineValue::Register(reg) => reg,
            _ => {
                let reg = self.reg_alloc(None)?;
                guards.push(self.register_file.freeze(&[reg]));
                temps.push(reg);
                reg
            }
        };
        let dest_reg = match inst {
            Some(inst) if lhs.is_register() && self.reuse_operand(inst, lhs_op, lhs_index, lhs) => {
                lhs_reg
            }
            Some(inst) => self.reg_alloc(Some(inst))?,
            None => self.reg_alloc(None)?,
        };
        if !lhs.is_register() {
            self.gen_set_reg(op_ty, lhs_reg, lhs)?;
        }
        let rd = dest_reg.alias(size);
        let rn = lhs_reg.alias(size);
        let mir_inst = match tag {
            BinOpTag::Add => mir::Inst::AddImmediate { rd, rn, imm12: imm },
            BinOpTag::Sub => mir::Inst::SubImmediate { rd, rn, imm12: imm },
            _ => unreachable!("{:?} has no immediate form", tag),
        };
        self.mir.push(mir_inst);
        for guard in guards {
            self.register_file.unfreeze(guard);
        }
        for reg in temps {
            if reg != dest_reg {
                self.register_file.free(reg);
            }
        }
        Ok(MachineValue::Register(dest_reg))
    }

    fn air_cmp(
        &mut self,
        inst: InstIndex,
        op: CompareOp,
        lhs_op: Operand,
        rhs_op: Operand,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[lhs_op, rhs_op]);
            return Ok(());
        }
        let op_ty = self.ir.ty_of(lhs_op);
        let info = match self.types.int_info(op_ty) {
            Some(info) => info,
            None => {
                return self.fail(format!(
                    "TODO implement comparisons for {:?}",
                    self.types.get(op_ty)
                ))
            }
        };
        if info.bits > 64 {
            return self
                .fail("TODO implement comparisons for integers wider than 64 bits".to_string());
        }
        let lhs = self.resolve_inst(lhs_op)?;
        let rhs = self.resolve_inst(rhs_op)?;
        let size = self.types.abi_size(op_ty);

        let mut guards: SmallVec<[FreezeGuard<Register>; 4]> = SmallVec::new();
        let mut temps: SmallVec<[Register; 2]> = SmallVec::new();
        if let MachineValue::Register(reg) = lhs {
            guards.push(self.register_file.freeze(&[reg]));
        }
        if let MachineValue::Register(reg) = rhs {
            guards.push(self.register_file.freeze(&[reg]));
        }
        let lhs_reg = match lhs {
            MachineValue::Register(reg) => reg,
            _ => {
                let reg = self.reg_alloc(None)?;
                guards.push(self.register_file.freeze(&[reg]));
                temps.push(reg);
                self.gen_set_reg(op_ty, reg, lhs)?;
                reg
            }
        };
        match rhs {
            MachineValue::Immediate(imm) if imm <= 0xfff => {
                self.mir.push(mir::Inst::CmpImmediate {
                    rn: lhs_reg.alias(size),
                    imm12: imm as u16,
                });
            }
            _ => {
                let rhs_reg = match rhs {
                    MachineValue::Register(reg) => reg,
                    _ => {
                        let reg = self.reg_alloc(None)?;
                        guards.push(self.register_file.freeze(&[reg]));
                        temps.push(reg);
                        self.gen_set_reg(op_ty, reg, rhs)?;
                        reg
                    }
                };
                self.mir.push(mir::Inst::CmpShiftedRegister {
                    rn: lhs_reg.alias(size),
                    rm: rhs_reg.alias(size),
                    shift: 0,
                });
            }
        }
        for guard in guards {
            self.register_file.unfreeze(guard);
        }
        for reg in temps {
            self.register_file.free(reg);
        }

        let result = match info.signedness {
            Signedness::Signed => MachineValue::CompareFlagsSigned(op),
            Signedness::Unsigned => MachineValue::CompareFlagsUnsigned(op),
        };
        self.finish_air(inst, result, &[lhs_op, rhs_op]);
        Ok(())
    }

    fn air_not(&mut self, inst: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let mv = self.resolve_inst(operand_op)?;
        let op_ty = self.ir.ty_of(operand_op);
        let result = match mv {
            MachineValue::Dead | MachineValue::Unreach => unreachable!("not of {:?}", mv),
            // Inverting condition flags costs no code at all.
            MachineValue::CompareFlagsUnsigned(op) => {
                MachineValue::CompareFlagsUnsigned(op.invert())
            }
            MachineValue::CompareFlagsSigned(op) => MachineValue::CompareFlagsSigned(op.invert()),
            _ => {
                let is_bool = matches!(self.types.get(op_ty), Type::Bool);
                let within_64 = matches!(
                    self.types.int_info(op_ty),
                    Some(info) if info.bits <= 64
                );
                if !is_bool && !within_64 {
                    return self.fail(format!(
                        "TODO implement bitwise not for {:?}",
                        self.types.get(op_ty)
                    ));
                }
                let size = self.types.abi_size(op_ty);
                let mut guards: SmallVec<[FreezeGuard<Register>; 2]> = SmallVec::new();
                let mut temps: SmallVec<[Register; 1]> = SmallVec::new();
                if let MachineValue::Register(reg) = mv {
                    guards.push(self.register_file.freeze(&[reg]));
                }
                let src_reg = match mv {
                    MachineValue::Register(reg) => reg,
                    _ => {
                        let reg = self.reg_alloc(None)?;
                        guards.push(self.register_file.freeze(&[reg]));
                        temps.push(reg);
                        reg
                    }
                };
                let dest_reg = if mv.is_register() && self.reuse_operand(inst, operand_op, 0, mv) {
                    src_reg
                } else {
                    self.reg_alloc(Some(inst))?
                };
                if !mv.is_register() {
                    self.gen_set_reg(op_ty, src_reg, mv)?;
                }
                if is_bool {
                    self.mir.push(mir::Inst::EorImmediate {
                        rd: dest_reg.alias(size),
                        rn: src_reg.alias(size),
                        imm: 1,
                    });
                } else {
                    self.mir.push(mir::Inst::Mvn {
                        rd: dest_reg.alias(size),
                        rm: src_reg.alias(size),
                    });
                }
                for guard in guards {
                    self.register_file.unfreeze(guard);
                }
                for reg in temps {
                    if reg != dest_reg {
                        self.register_file.free(reg);
                    }
                }
                MachineValue::Register(dest_reg)
            }
        };
        self.finish_air(inst, result, &[operand_op]);
        Ok(())
    }

    /// Reuse the operand's storage for the result, or copy it out when
    /// the operand lives on.
    fn forward_operand(
        &mut self,
        inst: InstIndex,
        operand_op: Operand,
        mv: MachineValue,
    ) -> CodegenResult<MachineValue> {
        if self.reuse_operand(inst, operand_op, 0, mv) {
            return Ok(mv);
        }
        let ty = self.ir.ty_of_inst(inst);
        if !self.types.has_runtime_bits(ty) {
            return Ok(MachineValue::None);
        }
        let dst = self.alloc_reg_or_mem(inst, true)?;
        self.set_reg_or_mem(ty, dst, mv)?;
        Ok(dst)
    }

    fn air_bitcast(&mut self, inst: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let mv = self.resolve_inst(operand_op)?;
        let result = self.forward_operand(inst, operand_op, mv)?;
        self.finish_air(inst, result, &[operand_op]);
        Ok(())
    }

    fn air_trunc(&mut self, inst: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        match self.types.int_info(self.ir.ty_of(operand_op)) {
            Some(info) if info.bits <= 64 => {}
            _ => {
                return self
                    .fail("TODO implement trunc for integers wider than 64 bits".to_string())
            }
        }
        // Consumers address the narrow value through sized loads and
        // register aliases; no instruction is needed.
        let mv = self.resolve_inst(operand_op)?;
        let result = self.forward_operand(inst, operand_op, mv)?;
        self.finish_air(inst, result, &[operand_op]);
        Ok(())
    }

    fn air_int_cast(&mut self, inst: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let operand_info = match self.types.int_info(self.ir.ty_of(operand_op)) {
            Some(info) => info,
            None => return self.fail("TODO implement intCast for non-integers".to_string()),
        };
        let dest_info = match self.types.int_info(self.ir.ty_of_inst(inst)) {
            Some(info) => info,
            None => return self.fail("TODO implement intCast for non-integers".to_string()),
        };
        if operand_info.signedness != dest_info.signedness {
            return self
                .fail("TODO implement intCast between types of different signedness".to_string());
        }
        if operand_info.bits != dest_info.bits {
            return self
                .fail("TODO implement intCast between integers of different widths".to_string());
        }
        let mv = self.resolve_inst(operand_op)?;
        let result = self.forward_operand(inst, operand_op, mv)?;
        self.finish_air(inst, result, &[operand_op]);
        Ok(())
    }

    fn air_load(&mut self, inst: InstIndex, ptr_op: Operand) -> CodegenResult<()> {
        let elem_ty = self.ir.ty_of_inst(inst);
        if !self.types.has_runtime_bits(elem_ty) {
            self.finish_air(inst, MachineValue::None, &[ptr_op]);
            return Ok(());
        }
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[ptr_op]);
            return Ok(());
        }
        let ptr = self.resolve_inst(ptr_op)?;
        let ptr_ty = self.ir.ty_of(ptr_op);
        let dst = if self.reuse_operand(inst, ptr_op, 0, ptr) {
            // The storage that held the pointer now holds the value.
            ptr
        } else {
            self.alloc_reg_or_mem(inst, true)?
        };
        self.load_value(dst, ptr, ptr_ty)?;
        self.finish_air(inst, dst, &[ptr_op]);
        Ok(())
    }

    fn air_store(
        &mut self,
        inst: InstIndex,
        ptr_op: Operand,
        value_op: Operand,
    ) -> CodegenResult<()> {
        let value_ty = self.ir.ty_of(value_op);
        if self.types.has_runtime_bits(value_ty) {
            let ptr = self.resolve_inst(ptr_op)?;
            let value = self.resolve_inst(value_op)?;
            let ptr_ty = self.ir.ty_of(ptr_op);
            self.store_value(ptr, value, ptr_ty, value_ty)?;
        }
        self.finish_air(inst, MachineValue::Dead, &[ptr_op, value_op]);
        Ok(())
    }

    /// Compare an error-union's error code against zero; the result lives
    /// entirely in the condition flags.
    fn air_is_err(
        &mut self,
        inst: InstIndex,
        operand_op: Operand,
        negate: bool,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let eu_ty = self.ir.ty_of(operand_op);
        let payload_ty = self.types.error_union_payload(eu_ty);
        if self.types.has_runtime_bits(payload_ty) {
            return self
                .fail("TODO implement is_err for error unions with payloads".to_string());
        }
        let size = self.types.abi_size(eu_ty);
        let mv = self.resolve_inst(operand_op)?;
        let (reg, is_tmp) = match mv {
            MachineValue::Register(reg) => (reg, false),
            _ => (self.copy_to_tmp_register(eu_ty, mv)?, true),
        };
        self.mir.push(mir::Inst::CmpImmediate {
            rn: reg.alias(size),
            imm12: 0,
        });
        if is_tmp {
            self.register_file.free(reg);
        }
        let op = if negate { CompareOp::Lte } else { CompareOp::Gt };
        self.finish_air(inst, MachineValue::CompareFlagsUnsigned(op), &[operand_op]);
        Ok(())
    }

    fn air_unwrap_errunion_payload(
        &mut self,
        inst: InstIndex,
        operand_op: Operand,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let eu_ty = self.ir.ty_of(operand_op);
        let payload_ty = self.types.error_union_payload(eu_ty);
        if self.types.has_runtime_bits(payload_ty) {
            return self.fail(
                "TODO implement unwrap_errunion_payload for error unions with payloads"
                    .to_string(),
            );
        }
        self.finish_air(inst, MachineValue::None, &[operand_op]);
        Ok(())
    }

    fn air_unwrap_errunion_err(
        &mut self,
        inst: InstIndex,
        operand_op: Operand,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let eu_ty = self.ir.ty_of(operand_op);
        let payload_ty = self.types.error_union_payload(eu_ty);
        if self.types.has_runtime_bits(payload_ty) {
            return self.fail(
                "TODO implement unwrap_errunion_err for error unions with payloads".to_string(),
            );
        }
        // The whole value is the error code.
        let mv = self.resolve_inst(operand_op)?;
        let result = self.forward_operand(inst, operand_op, mv)?;
        self.finish_air(inst, result, &[operand_op]);
        Ok(())
    }

    fn air_wrap_optional(&mut self, inst: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let opt_ty = self.ir.ty_of_inst(inst);
        // An optional with a zero-sized payload is just a non-null tag.
        if self.types.abi_size(opt_ty) == 1 {
            self.finish_air(inst, MachineValue::Immediate(1), &[operand_op]);
            return Ok(());
        }
        self.fail(format!(
            "TODO implement wrap_optional for {:?}",
            self.types.get(opt_ty)
        ))
    }

    fn air_optional_payload(&mut self, inst: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let opt_ty = self.ir.ty_of(operand_op);
        let payload_ty = self.types.child_type(opt_ty);
        if !self.types.has_runtime_bits(payload_ty) {
            self.finish_air(inst, MachineValue::None, &[operand_op]);
            return Ok(());
        }
        if self.types.abi_size(opt_ty) == self.types.abi_size(payload_ty) {
            // Pointer-like optional: payload and optional share the bits.
            let mv = self.resolve_inst(operand_op)?;
            let result = self.forward_operand(inst, operand_op, mv)?;
            self.finish_air(inst, result, &[operand_op]);
            return Ok(());
        }
        self.fail("TODO implement optional_payload for tagged optionals".to_string())
    }

    fn air_is_null(
        &mut self,
        inst: InstIndex,
        operand_op: Operand,
        negate: bool,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let opt_ty = self.ir.ty_of(operand_op);
        let size = self.types.abi_size(opt_ty);
        if size > PTR_SIZE {
            return self.fail("TODO implement is_null for tagged optionals".to_string());
        }
        let mv = self.resolve_inst(operand_op)?;
        let (reg, is_tmp) = match mv {
            MachineValue::Register(reg) => (reg, false),
            _ => (self.copy_to_tmp_register(opt_ty, mv)?, true),
        };
        self.mir.push(mir::Inst::CmpImmediate {
            rn: reg.alias(size),
            imm12: 0,
        });
        if is_tmp {
            self.register_file.free(reg);
        }
        let op = if negate { CompareOp::Neq } else { CompareOp::Eq };
        self.finish_air(inst, MachineValue::CompareFlagsUnsigned(op), &[operand_op]);
        Ok(())
    }

    fn air_struct_field_ptr(
        &mut self,
        inst: InstIndex,
        operand_op: Operand,
        field: u32,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let ptr_ty = self.ir.ty_of(operand_op);
        let struct_ty = self.types.child_type(ptr_ty);
        let field_offset = self.types.struct_field_offset(struct_ty, field);
        let struct_size = self.types.abi_size(struct_ty);
        let field_ty = self.types.child_type(self.ir.ty_of_inst(inst));
        let field_size = self.types.abi_size(field_ty);
        let mv = self.resolve_inst(operand_op)?;
        let result = match mv {
            MachineValue::PtrStackOffset(offset) => {
                // Offsets address downward; the field moves the window up
                // by its own position within the struct.
                MachineValue::PtrStackOffset(offset + struct_size - field_offset - field_size)
            }
            MachineValue::Memory(addr) => MachineValue::Memory(addr + field_offset as u64),
            MachineValue::Register(_) | MachineValue::StackOffset(_) => {
                if field_offset > 0xfff {
                    return self
                        .fail("TODO implement field offsets larger than 4095".to_string());
                }
                let result = match self.forward_operand(inst, operand_op, mv)? {
                    MachineValue::Register(reg) => reg,
                    other => {
                        let reg = self.reg_alloc(Some(inst))?;
                        self.gen_set_reg(ptr_ty, reg, other)?;
                        reg
                    }
                };
                if field_offset > 0 {
                    self.mir.push(mir::Inst::AddImmediate {
                        rd: result.to_x(),
                        rn: result.to_x(),
                        imm12: field_offset as u16,
                    });
                }
                MachineValue::Register(result)
            }
            _ => {
                return self.fail(format!(
                    "TODO implement struct_field_ptr for {:?}",
                    mv
                ))
            }
        };
        self.finish_air(inst, result, &[operand_op]);
        Ok(())
    }

    /// Slices live as 16-byte stack aggregates; both fields are plain
    /// offset projections.
    fn air_slice_field(
        &mut self,
        inst: InstIndex,
        operand_op: Operand,
        is_ptr: bool,
    ) -> CodegenResult<()> {
        if self.liveness.is_unused(inst) {
            self.finish_air(inst, MachineValue::Dead, &[operand_op]);
            return Ok(());
        }
        let mv = self.resolve_inst(operand_op)?;
        let result = match mv {
            MachineValue::StackOffset(offset) => {
                if is_ptr {
                    MachineValue::StackOffset(offset + 8)
                } else {
                    MachineValue::StackOffset(offset)
                }
            }
            _ => {
                return self.fail(format!(
                    "TODO implement slice field access for {:?}",
                    mv
                ))
            }
        };
        self.finish_air(inst, result, &[operand_op]);
        Ok(())
    }

    fn air_ret(&mut self, inst: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        let mv = self.resolve_inst(operand_op)?;
        let ret_ty = self.types.fn_info(self.func.ty).1;
        if self.types.has_runtime_bits(ret_ty) {
            let ret_mv = self.args.return_value;
            self.set_reg_or_mem(ret_ty, ret_mv, mv)?;
        }
        // Jump to the shared epilogue; the target is patched once the
        // epilogue's position is known.
        let jump = self.mir.push(mir::Inst::B { target: 0 });
        self.exitlude_jump_relocs.push(jump);
        self.finish_air(inst, MachineValue::Dead, &[operand_op]);
        Ok(())
    }

    fn air_assembly(
        &mut self,
        inst: InstIndex,
        source: &str,
        outputs: &[AsmConstraint],
        inputs: &[(AsmConstraint, Operand)],
        is_volatile: bool,
    ) -> CodegenResult<()> {
        if !is_volatile && self.liveness.is_unused(inst) {
            self.finish_asm(inst, MachineValue::Dead, inputs);
            return Ok(());
        }
        for (constraint, operand) in inputs {
            let reg = match Register::from_name(&constraint.register_name) {
                Some(reg) => reg,
                None => {
                    return self.fail(format!(
                        "unrecognized register: '{}'",
                        constraint.register_name
                    ))
                }
            };
            let mv = self.resolve_inst(*operand)?;
            let ty = self.ir.ty_of(*operand);
            self.gen_set_reg(ty, reg, mv)?;
        }

        let trimmed = source.trim();
        if !trimmed.is_empty() {
            if let Some(rest) = trimmed.strip_prefix("svc") {
                let imm_text = match rest.trim().strip_prefix('#') {
                    Some(text) => text,
                    None => {
                        return self.fail(format!(
                            "unable to parse asm instruction '{}'",
                            trimmed
                        ))
                    }
                };
                let parsed = match imm_text.strip_prefix("0x") {
                    Some(hex) => u16::from_str_radix(hex, 16),
                    None => imm_text.parse::<u16>(),
                };
                let imm16 = match parsed {
                    Ok(value) => value,
                    Err(_) => {
                        return self.fail(format!(
                            "unable to parse asm instruction '{}'",
                            trimmed
                        ))
                    }
                };
                self.mir.push(mir::Inst::Svc { imm16 });
            } else {
                return self
                    .fail("TODO implement more kinds of inline assembly".to_string());
            }
        }

        let result = match outputs {
            [] => MachineValue::None,
            [constraint] => match Register::from_name(&constraint.register_name) {
                Some(reg) => MachineValue::Register(reg.to_x()),
                None => {
                    return self.fail(format!(
                        "unrecognized register: '{}'",
                        constraint.register_name
                    ))
                }
            },
            _ => {
                return self
                    .fail("TODO implement multiple inline assembly outputs".to_string())
            }
        };
        self.finish_asm(inst, result, inputs);
        Ok(())
    }

    fn finish_asm(
        &mut self,
        inst: InstIndex,
        result: MachineValue,
        inputs: &[(AsmConstraint, Operand)],
    ) {
        if inputs.len() <= Liveness::BPI - 1 {
            let operands: SmallVec<[Operand; 3]> =
                inputs.iter().map(|(_, operand)| *operand).collect();
            self.finish_air(inst, result, &operands);
        } else {
            self.finish_air_big(inst, result);
        }
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    /// Rewrite a branch placeholder with its final target.
    fn perform_reloc(&mut self, index: MirIndex, target: MirIndex) {
        let patched = match self.mir.get(index) {
            mir::Inst::B { .. } => mir::Inst::B { target },
            mir::Inst::BCond { cond, .. } => mir::Inst::BCond {
                cond: *cond,
                target,
            },
            mir::Inst::Cbz { rt, .. } => mir::Inst::Cbz { rt: *rt, target },
            other => unreachable!("relocating non-branch {:?}", other),
        };
        self.mir.set(index, patched);
    }

    fn air_cond_br(
        &mut self,
        inst: InstIndex,
        cond_op: Operand,
        then_body: u32,
        else_body: u32,
    ) -> CodegenResult<()> {
        let ir = self.ir;
        let cond = self.resolve_inst(cond_op)?;
        let cond_ty = ir.ty_of(cond_op);

        let reloc = match cond {
            MachineValue::CompareFlagsSigned(op) => {
                let c = Cond::from_compare_op(op, Signedness::Signed).invert();
                self.mir.push(mir::Inst::BCond { cond: c, target: 0 })
            }
            MachineValue::CompareFlagsUnsigned(op) => {
                // Jump to the else branch when the condition fails.
                let c = Cond::from_compare_op(op, Signedness::Unsigned).invert();
                self.mir.push(mir::Inst::BCond { cond: c, target: 0 })
            }
            _ => {
                let (reg, is_tmp) = match cond {
                    MachineValue::Register(reg) => (reg, false),
                    _ => (self.copy_to_tmp_register(cond_ty, cond)?, true),
                };
                let size = self.types.abi_size(cond_ty);
                let reloc = self.mir.push(mir::Inst::Cbz {
                    rt: reg.alias(size),
                    target: 0,
                });
                if is_tmp {
                    self.register_file.free(reg);
                }
                reloc
            }
        };

        // Capture the allocation state so the else branch starts from the
        // same world the then branch saw.
        let parent_reg_state = self.register_file.save_state();
        let parent_frame_state = self.frame.save_state();

        let deaths = self.liveness.get_cond_br(inst);
        let then_deaths: SmallVec<[InstIndex; 4]> = SmallVec::from_slice(deaths.then_deaths);
        let else_deaths: SmallVec<[InstIndex; 4]> = SmallVec::from_slice(deaths.else_deaths);

        self.branch_stack.push(Branch::default());
        self.ensure_process_death_capacity(then_deaths.len() + Liveness::BPI);
        for &death in &then_deaths {
            self.process_death(death);
        }
        self.gen_body(ir.body(then_body))?;
        let saved_then_branch = self.branch_stack.pop().expect("branch stack empty");

        self.register_file.restore_state(parent_reg_state);
        self.frame.restore_state(parent_frame_state);

        // The skip-to-else branch lands here.
        let else_start = self.mir.len();
        self.perform_reloc(reloc, else_start);

        self.branch_stack.push(Branch::default());
        self.ensure_process_death_capacity(else_deaths.len() + Liveness::BPI);
        for &death in &else_deaths {
            self.process_death(death);
        }
        self.gen_body(ir.body(else_body))?;

        self.join_branches(saved_then_branch)?;
        self.finish_air(inst, MachineValue::Unreach, &[cond_op]);
        Ok(())
    }

    /// Reconcile the two branch layers of a conditional so that every
    /// value live on the parent side has one location regardless of which
    /// path executed. The then branch is canonical; moves are emitted on
    /// the fall-through (else) path to make it conform.
    fn join_branches(&mut self, saved_then_branch: Branch) -> CodegenResult<()> {
        let else_branch = self.branch_stack.pop().expect("branch stack empty");
        let mut then_table = saved_then_branch.inst_table;

        let mut else_keys: Vec<InstIndex> = else_branch.inst_table.keys().copied().collect();
        else_keys.sort_unstable();
        for key in else_keys {
            let else_mv = else_branch.inst_table[&key];
            if let Some(then_mv) = then_table.remove(&key) {
                // Overridden in both branches.
                if else_mv == MachineValue::Dead || then_mv == MachineValue::Dead {
                    debug_assert_eq!(then_mv, MachineValue::Dead);
                    debug_assert_eq!(else_mv, MachineValue::Dead);
                    self.parent_branch_insert(key, MachineValue::Dead);
                    continue;
                }
                if else_mv != then_mv {
                    log::debug!("join: %{} {:?} => {:?}", key, else_mv, then_mv);
                    let ty = self.ir.ty_of_inst(key);
                    self.set_reg_or_mem(ty, then_mv, else_mv)?;
                }
                self.parent_branch_insert(key, then_mv);
            } else {
                // Overridden only in the else branch; relocate back to
                // the pre-branch location.
                if else_mv == MachineValue::Dead {
                    self.parent_branch_insert(key, MachineValue::Dead);
                    continue;
                }
                let parent_mv = self.get_resolved_value(key);
                if else_mv != parent_mv {
                    log::debug!("join: %{} {:?} => {:?}", key, else_mv, parent_mv);
                    let ty = self.ir.ty_of_inst(key);
                    self.set_reg_or_mem(ty, parent_mv, else_mv)?;
                }
            }
        }

        let mut then_keys: Vec<InstIndex> = then_table.keys().copied().collect();
        then_keys.sort_unstable();
        for key in then_keys {
            let then_mv = then_table[&key];
            // Overridden only in the then branch; the else path left the
            // parent state untouched, so adopt the then location and
            // bring the fall-through path to it.
            if then_mv == MachineValue::Dead {
                self.parent_branch_insert(key, MachineValue::Dead);
                continue;
            }
            let parent_mv = self.get_resolved_value(key);
            if then_mv != parent_mv {
                log::debug!("join: %{} {:?} => {:?}", key, parent_mv, then_mv);
                let ty = self.ir.ty_of_inst(key);
                self.set_reg_or_mem(ty, then_mv, parent_mv)?;
            }
            self.parent_branch_insert(key, then_mv);
        }
        Ok(())
    }

    fn parent_branch_insert(&mut self, inst: InstIndex, mv: MachineValue) {
        let branch = self.branch_stack.last_mut().expect("branch stack empty");
        branch.inst_table.insert(inst, mv);
    }

    fn air_block(&mut self, inst: InstIndex, body: u32) -> CodegenResult<()> {
        let ir = self.ir;
        self.blocks.insert(
            inst,
            BlockData {
                mv: MachineValue::None,
                relocs: Vec::new(),
            },
        );
        self.gen_body(ir.body(body))?;

        let mut data = self.blocks.remove(&inst).expect("block data missing");
        // The final break would jump to the very next instruction; drop
        // it.
        if let Some(&last) = data.relocs.last() {
            if last + 1 == self.mir.len() {
                self.mir.remove(last);
                data.relocs.pop();
            }
        }
        let target = self.mir.len();
        for &reloc in &data.relocs {
            self.perform_reloc(reloc, target);
        }
        self.finish_air(inst, data.mv, &[]);
        Ok(())
    }

    fn air_br(&mut self, inst: InstIndex, block: InstIndex, operand_op: Operand) -> CodegenResult<()> {
        let block_ty = self.ir.ty_of_inst(block);
        if self.types.has_runtime_bits(block_ty) {
            let operand_mv = self.resolve_inst(operand_op)?;
            let block_mv = self.blocks[&block].mv;
            if block_mv == MachineValue::None {
                // The first break decides where the block's result lives.
                let chosen = if operand_mv.is_mutable() {
                    operand_mv
                } else {
                    let new_mv = self.alloc_reg_or_mem(block, true)?;
                    self.set_reg_or_mem(block_ty, new_mv, operand_mv)?;
                    new_mv
                };
                self.blocks.get_mut(&block).expect("block data missing").mv = chosen;
            } else {
                self.set_reg_or_mem(block_ty, block_mv, operand_mv)?;
            }
        }
        let jump = self.mir.push(mir::Inst::B { target: 0 });
        self.blocks
            .get_mut(&block)
            .expect("block data missing")
            .relocs
            .push(jump);
        self.finish_air(inst, MachineValue::Dead, &[operand_op]);
        Ok(())
    }

    fn air_loop(&mut self, _inst: InstIndex, body: u32) -> CodegenResult<()> {
        let ir = self.ir;
        let start = self.mir.len();
        self.gen_body(ir.body(body))?;
        // Back edge; a loop only terminates through a break or noreturn
        // instruction in its body.
        self.mir.push(mir::Inst::B { target: start });
        self.finish_air_bookkeeping();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn air_call(
        &mut self,
        inst: InstIndex,
        callee_op: Operand,
        call_args: &[Operand],
    ) -> CodegenResult<()> {
        let ir = self.ir;
        let callee_ty = ir.ty_of(callee_op);
        let fn_ty = match self.types.get(callee_ty) {
            Type::Fn { .. } => callee_ty,
            Type::Pointer { elem } => *elem,
            _ => return self.fail("unable to call a non-function value".to_string()),
        };
        let (params, ret_ty, cc) = {
            let (params, ret_ty, cc) = self.types.fn_info(fn_ty);
            (
                SmallVec::<[TypeIndex; 8]>::from_slice(params),
                ret_ty,
                cc,
            )
        };
        if cc == CallConv::Naked {
            return self.fail("unable to call a naked function".to_string());
        }

        let mut assigner = Aapcs64Assigner::new(self.target);
        let mut arg_locations: SmallVec<[MachineValue; 8]> = SmallVec::new();
        for &param in &params {
            match assigner.assign_param(&*self.types, param) {
                Ok(mv) => arg_locations.push(mv),
                Err(err) => return self.fail(err.to_string()),
            }
        }
        let ret_location = match assigner.assign_return(&*self.types, ret_ty) {
            Ok(mv) => mv,
            Err(err) => return self.fail(err.to_string()),
        };

        // Materialize every argument into its AAPCS64 location. The
        // argument registers are outside the allocatable pool, so no live
        // value can be sitting in them.
        for (i, &arg_op) in call_args.iter().enumerate() {
            let target_mv = arg_locations[i];
            let arg_ty = ir.ty_of(arg_op);
            let arg_mv = self.resolve_inst(arg_op)?;
            match target_mv {
                MachineValue::None => continue,
                MachineValue::Register(reg) => self.gen_set_reg(arg_ty, reg, arg_mv)?,
                MachineValue::StackOffset(_) => {
                    return self
                        .fail("TODO implement calling with stack-passed arguments".to_string())
                }
                _ => unreachable!("{:?} is not an argument location", target_mv),
            }
        }

        // Load the callee address into the link register and call, or
        // hand the whole call to the linker for externs.
        let mut emitted_call = false;
        match callee_op {
            Operand::Const(value_index) => match &ir.value(value_index).val {
                Value::Function(func) => {
                    let location = symbol_location_mv(self.link.function_location(*func));
                    self.gen_set_reg(USIZE, LR, location)?;
                }
                Value::ExternFn(name) => match &mut self.link {
                    LinkFile::MachO(macho) => {
                        let sym_index = macho.extern_fn(name);
                        self.mir.push(mir::Inst::CallExtern {
                            atom_index: self.func.atom_index,
                            sym_index,
                        });
                        emitted_call = true;
                    }
                    _ => {
                        return self.fail(
                            "TODO implement extern function calls for this linker".to_string(),
                        )
                    }
                },
                _ => return self.fail("unable to call this value".to_string()),
            },
            _ => {
                let callee_mv = self.resolve_inst(callee_op)?;
                self.gen_set_reg(USIZE, LR, callee_mv)?;
            }
        }
        if !emitted_call {
            self.mir.push(mir::Inst::Blr { rn: LR });
        }

        // The return register is caller-saved; move the result into a
        // register that survives further calls.
        let result = match ret_location {
            MachineValue::Register(reg)
                if !CALLEE_PRESERVED_REGS.contains(&reg.to_x())
                    && !self.liveness.is_unused(inst) =>
            {
                self.copy_to_new_register(inst, ret_location)?
            }
            _ => ret_location,
        };

        if 1 + call_args.len() <= Liveness::BPI - 1 {
            let mut operands: SmallVec<[Operand; 3]> = SmallVec::new();
            operands.push(callee_op);
            operands.extend(call_args.iter().copied());
            self.finish_air(inst, result, &operands);
        } else {
            self.finish_air_big(inst, result);
        }
        Ok(())
    }
}

/// Map a linker answer onto a machine value.
fn symbol_location_mv(location: SymbolLocation) -> MachineValue {
    match location {
        SymbolLocation::Memory(addr) => MachineValue::Memory(addr),
        SymbolLocation::GotLoad(sym) => MachineValue::GotLoad(sym),
        SymbolLocation::DirectLoad(sym) => MachineValue::DirectLoad(sym),
    }
}
