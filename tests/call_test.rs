//! Call emission across linker flavors.

mod common;

use common::*;
use petrel::aarch64::mir::Inst;
use petrel::aarch64::Register;
use petrel::ir::{InstOp, Operand, TypedValue, Value};
use petrel::types::{self, CallConv, Signedness, Type};
use petrel::{Ir, TypePool};

/// `extern "C" fn puts(*const u8) c_int; puts(s)` on Mach-O: the
/// argument's address arrives through a GOT load straight into x0, the
/// call itself is a `call_extern` pseudo, and the result is copied out of
/// the caller-saved return register.
#[test]
fn test_extern_call_on_macho() {
    let mut types = TypePool::new();
    let u8_ty = types.int(Signedness::Unsigned, 8);
    let ptr_u8 = types.pointer(u8_ty);
    let c_int = types.int(Signedness::Signed, 32);
    let puts_ty = types.intern(Type::Fn {
        params: vec![ptr_u8],
        ret: c_int,
        cc: CallConv::C,
    });
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: c_int,
        cc: CallConv::C,
    });

    let mut ir = Ir::new();
    let s = ir.add_value(TypedValue {
        ty: ptr_u8,
        val: Value::Bytes(b"hello\0".to_vec()),
    });
    let puts = ir.add_value(TypedValue {
        ty: puts_ty,
        val: Value::ExternFn("puts".to_string()),
    });
    let call = ir.add_inst(
        c_int,
        InstOp::Call {
            callee: Operand::Const(puts),
            args: vec![Operand::Const(s)],
        },
    );
    let ret = ir.add_inst(
        types::NO_RETURN,
        InstOp::Ret {
            operand: Operand::Inst(call),
        },
    );
    ir.add_body(vec![call, ret]);

    let func = test_function("main", fn_ty);
    let mut link = macho_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, darwin()));

    assert!(mir.instructions.contains(&Inst::LoadMemoryGot {
        rt: Register::X0,
        atom_index: 0,
        sym_index: 0,
    }));
    assert!(mir.instructions.contains(&Inst::CallExtern {
        atom_index: 0,
        sym_index: 1,
    }));
    // The extern pseudo is the call; no indirect branch is emitted.
    assert!(!mir
        .instructions
        .iter()
        .any(|inst| matches!(inst, Inst::Blr { .. })));
    // Return value rescued into a callee-preserved register, then placed
    // for the return.
    assert!(mir.instructions.contains(&Inst::MovRegister {
        rd: Register::W19,
        rn: Register::W0,
    }));
    assert!(mir.instructions.contains(&Inst::MovRegister {
        rd: Register::W0,
        rn: Register::W19,
    }));
}

/// A module-local call on ELF: the callee address is a load from a known
/// GOT address followed by `blr x30`.
#[test]
fn test_local_call_on_elf() {
    let mut types = TypePool::new();
    let u64_ty = types.int(Signedness::Unsigned, 64);
    let callee_ty = types.intern(Type::Fn {
        params: vec![],
        ret: u64_ty,
        cc: CallConv::C,
    });
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: u64_ty,
        cc: CallConv::C,
    });

    let mut ir = Ir::new();
    let callee = ir.add_value(TypedValue {
        ty: callee_ty,
        val: Value::Function(1),
    });
    let call = ir.add_inst(
        u64_ty,
        InstOp::Call {
            callee: Operand::Const(callee),
            args: vec![],
        },
    );
    let ret = ir.add_inst(
        types::NO_RETURN,
        InstOp::Ret {
            operand: Operand::Inst(call),
        },
    );
    ir.add_body(vec![call, ret]);

    let func = test_function("caller", fn_ty);
    let mut link = elf_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, linux()));

    // GOT base 0x10000: movz + movk materialize the entry address, one
    // load fetches the callee address.
    assert!(mir.instructions.contains(&Inst::Movz {
        rd: Register::X30,
        imm16: 0,
        hw: 0,
    }));
    assert!(mir.instructions.contains(&Inst::Movk {
        rd: Register::X30,
        imm16: 1,
        hw: 1,
    }));
    assert!(mir.instructions.contains(&Inst::LdrImmediate {
        rt: Register::X30,
        rn: Register::X30,
        offset: 0,
    }));
    assert!(mir.instructions.contains(&Inst::Blr { rn: Register::X30 }));
}

/// A call with no arguments and a zero-bit return emits only the
/// callee-address materialization and the branch.
#[test]
fn test_void_call_is_minimal() {
    let mut types = TypePool::new();
    let callee_ty = types.intern(Type::Fn {
        params: vec![],
        ret: types::VOID,
        cc: CallConv::C,
    });
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: types::VOID,
        cc: CallConv::C,
    });

    let mut ir = Ir::new();
    let callee = ir.add_value(TypedValue {
        ty: callee_ty,
        val: Value::Function(1),
    });
    let call = ir.add_inst(
        types::VOID,
        InstOp::Call {
            callee: Operand::Const(callee),
            args: vec![],
        },
    );
    let ret = ir.add_inst(
        types::NO_RETURN,
        InstOp::Ret {
            operand: Operand::None,
        },
    );
    ir.add_body(vec![call, ret]);

    let func = test_function("fire", fn_ty);
    let mut link = elf_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, linux()));

    assert_eq!(
        body_of(&mir),
        vec![
            Inst::Movz {
                rd: Register::X30,
                imm16: 0,
                hw: 0,
            },
            Inst::Movk {
                rd: Register::X30,
                imm16: 1,
                hw: 1,
            },
            Inst::LdrImmediate {
                rt: Register::X30,
                rn: Register::X30,
                offset: 0,
            },
            Inst::Blr { rn: Register::X30 },
        ]
    );
}

/// Stack-passed call arguments are classified correctly but not lowered
/// yet.
#[test]
fn test_call_with_stack_args_fails() {
    let mut types = TypePool::new();
    let u64_ty = types.int(Signedness::Unsigned, 64);
    let params = vec![u64_ty; 9];
    let callee_ty = types.intern(Type::Fn {
        params,
        ret: u64_ty,
        cc: CallConv::C,
    });
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: u64_ty,
        cc: CallConv::C,
    });

    let mut ir = Ir::new();
    let callee = ir.add_value(TypedValue {
        ty: callee_ty,
        val: Value::Function(1),
    });
    let zero = ir.add_value(TypedValue {
        ty: u64_ty,
        val: Value::Int(0),
    });
    let call = ir.add_inst(
        u64_ty,
        InstOp::Call {
            callee: Operand::Const(callee),
            args: vec![Operand::Const(zero); 9],
        },
    );
    let ret = ir.add_inst(
        types::NO_RETURN,
        InstOp::Ret {
            operand: Operand::Inst(call),
        },
    );
    ir.add_body(vec![call, ret]);

    let func = test_function("wide", fn_ty);
    let mut link = elf_link();
    let err = expect_fail(run(&func, &ir, &mut types, &mut link, linux()));
    assert!(
        err.msg.contains("stack-passed arguments"),
        "got: {}",
        err.msg
    );
}
