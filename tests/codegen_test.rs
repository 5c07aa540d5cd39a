//! Whole-function shapes: prologue/epilogue framing, parameter homing,
//! frame sizing, and the structured not-yet-implemented errors.

mod common;

use common::*;
use petrel::aarch64::mir::Inst;
use petrel::aarch64::Register;
use petrel::ir::{InstOp, Operand};
use petrel::types::{self, CallConv, Signedness, Type};
use petrel::{Ir, TypePool};

/// `fn f(x: i32) i32 { return x; }` - the parameter is homed to a stack
/// slot on entry and loaded back into x0 at the return; the return's
/// exitlude jump is elided because it would land on the next
/// instruction.
#[test]
fn test_trivial_return_of_argument() {
    let mut types = TypePool::new();
    let i32_ty = types.int(Signedness::Signed, 32);
    let fn_ty = types.intern(Type::Fn {
        params: vec![i32_ty],
        ret: i32_ty,
        cc: CallConv::C,
    });
    let mut ir = Ir::new();
    let x = ir.add_inst(i32_ty, InstOp::Arg { index: 0 });
    let ret = ir.add_inst(
        types::NO_RETURN,
        InstOp::Ret {
            operand: Operand::Inst(x),
        },
    );
    ir.add_body(vec![x, ret]);

    let func = test_function("f", fn_ty);
    let mut link = elf_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, linux()));

    assert_eq!(
        mir.instructions,
        vec![
            Inst::StpPreIndex {
                rt: Register::X29,
                rt2: Register::X30,
                rn: Register::Sp,
                offset: -16,
            },
            Inst::PushRegs { mask: 0 },
            Inst::MovToFromSp {
                rd: Register::X29,
                rn: Register::Sp,
            },
            Inst::SubImmediate {
                rd: Register::Sp,
                rn: Register::Sp,
                imm12: 16,
            },
            Inst::DbgPrologueEnd,
            Inst::StrImmediate {
                rt: Register::W0,
                rn: Register::X29,
                offset: -4,
            },
            Inst::LdrImmediate {
                rt: Register::W0,
                rn: Register::X29,
                offset: -4,
            },
            Inst::DbgEpilogueBegin,
            Inst::AddImmediate {
                rd: Register::Sp,
                rn: Register::Sp,
                imm12: 16,
            },
            Inst::PopRegs { mask: 0 },
            Inst::LdpPostIndex {
                rt: Register::X29,
                rt2: Register::X30,
                rn: Register::Sp,
                offset: 16,
            },
            Inst::Ret { rn: Register::X30 },
            Inst::DbgLine {
                line: 10,
                column: 1,
            },
        ]
    );
}

/// A body that is only `unreach` produces the frame, the debug markers,
/// and nothing else.
#[test]
fn test_unreachable_only_body() {
    let mut types = TypePool::new();
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: types::VOID,
        cc: CallConv::C,
    });
    let mut ir = Ir::new();
    let unreach = ir.add_inst(types::NO_RETURN, InstOp::Unreach);
    ir.add_body(vec![unreach]);

    let func = test_function("empty", fn_ty);
    let mut link = elf_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, linux()));

    assert!(body_of(&mir).is_empty());
    assert!(mir
        .instructions
        .iter()
        .any(|inst| matches!(inst, Inst::DbgLine { line: 10, .. })));
    // No locals, no saved registers.
    assert!(mir.instructions.contains(&Inst::SubImmediate {
        rd: Register::Sp,
        rn: Register::Sp,
        imm12: 0,
    }));
    assert!(mir.instructions.contains(&Inst::PushRegs { mask: 0 }));
}

/// Naked functions get no frame at all.
#[test]
fn test_naked_function_has_no_frame() {
    let mut types = TypePool::new();
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: types::VOID,
        cc: CallConv::Naked,
    });
    let mut ir = Ir::new();
    let unreach = ir.add_inst(types::NO_RETURN, InstOp::Unreach);
    ir.add_body(vec![unreach]);

    let func = test_function("naked", fn_ty);
    let mut link = elf_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, linux()));

    assert_eq!(
        mir.instructions,
        vec![
            Inst::DbgPrologueEnd,
            Inst::DbgEpilogueBegin,
            Inst::DbgLine {
                line: 10,
                column: 1,
            },
        ]
    );
}

fn frame_test_ir(types: &mut TypePool, array_len: u32) -> (Ir, u32) {
    let u8_ty = types.int(Signedness::Unsigned, 8);
    let array_ty = types.intern(Type::Array {
        elem: u8_ty,
        len: array_len,
    });
    let ptr_ty = types.intern(Type::Pointer { elem: array_ty });
    let mut ir = Ir::new();
    let byte = ir.add_value(petrel::ir::TypedValue {
        ty: u8_ty,
        val: petrel::ir::Value::Int(7),
    });
    let slot = ir.add_inst(ptr_ty, InstOp::Alloc);
    let store = ir.add_inst(
        types::VOID,
        InstOp::Store {
            ptr: Operand::Inst(slot),
            value: Operand::Const(byte),
        },
    );
    let unreach = ir.add_inst(types::NO_RETURN, InstOp::Unreach);
    ir.add_body(vec![slot, store, unreach]);
    (ir, u8_ty)
}

/// A 4000-byte local fits the single `sub sp` encoding.
#[test]
fn test_frame_within_encoding_limit() {
    let mut types = TypePool::new();
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: types::VOID,
        cc: CallConv::C,
    });
    let (ir, _) = frame_test_ir(&mut types, 4000);
    let func = test_function("big_frame", fn_ty);
    let mut link = elf_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, linux()));
    assert!(mir.instructions.contains(&Inst::SubImmediate {
        rd: Register::Sp,
        rn: Register::Sp,
        imm12: 4000,
    }));
}

/// A frame past 2^12 - 1 bytes cannot be encoded in one `sub` and is a
/// structured failure.
#[test]
fn test_frame_too_large_fails() {
    let mut types = TypePool::new();
    let fn_ty = types.intern(Type::Fn {
        params: vec![],
        ret: types::VOID,
        cc: CallConv::C,
    });
    let (ir, _) = frame_test_ir(&mut types, 5000);
    let func = test_function("huge_frame", fn_ty);
    let mut link = elf_link();
    let err = expect_fail(run(&func, &ir, &mut types, &mut link, linux()));
    assert!(err.msg.starts_with("stack too large"), "got: {}", err.msg);
}

/// Unimplemented operations report structured errors instead of
/// panicking.
#[test]
fn test_not_yet_implemented_ops_fail_cleanly() {
    let cases: &[(fn(&mut TypePool, &mut Ir) -> Vec<u32>, &str)] = &[
        (
            |types, ir| {
                let u64_ty = types.int(Signedness::Unsigned, 64);
                let a = ir.add_inst(u64_ty, InstOp::Arg { index: 0 });
                let f = ir.add_inst(
                    u64_ty,
                    InstOp::FAdd {
                        lhs: Operand::Inst(a),
                        rhs: Operand::Inst(a),
                    },
                );
                let r = ir.add_inst(
                    types::NO_RETURN,
                    InstOp::Ret {
                        operand: Operand::Inst(f),
                    },
                );
                vec![a, f, r]
            },
            "TODO implement floating-point arithmetic",
        ),
        (
            |types, ir| {
                let u64_ty = types.int(Signedness::Unsigned, 64);
                let a = ir.add_inst(u64_ty, InstOp::Arg { index: 0 });
                let s = ir.add_inst(
                    types::NO_RETURN,
                    InstOp::SwitchBr {
                        operand: Operand::Inst(a),
                    },
                );
                vec![a, s]
            },
            "TODO implement switch_br",
        ),
        (
            |types, ir| {
                let u64_ty = types.int(Signedness::Unsigned, 64);
                let ptr_ty = types.intern(Type::Pointer { elem: u64_ty });
                let a = ir.add_inst(ptr_ty, InstOp::Arg { index: 0 });
                let r = ir.add_inst(
                    types::NO_RETURN,
                    InstOp::RetLoad {
                        ptr: Operand::Inst(a),
                    },
                );
                vec![a, r]
            },
            "TODO implement ret_load",
        ),
    ];

    for (build, expected) in cases {
        let mut types = TypePool::new();
        let u64_ty = types.int(Signedness::Unsigned, 64);
        let fn_ty = types.intern(Type::Fn {
            params: vec![u64_ty],
            ret: u64_ty,
            cc: CallConv::C,
        });
        let mut ir = Ir::new();
        let body = build(&mut types, &mut ir);
        ir.add_body(body);
        let func = test_function("nyi", fn_ty);
        let mut link = elf_link();
        let err = expect_fail(run(&func, &ir, &mut types, &mut link, linux()));
        assert!(
            err.msg.contains(expected),
            "expected '{}', got '{}'",
            expected,
            err.msg
        );
    }
}

/// A sign-changing int cast is refused.
#[test]
fn test_int_cast_refuses_sign_change() {
    let mut types = TypePool::new();
    let i64_ty = types.int(Signedness::Signed, 64);
    let u64_ty = types.int(Signedness::Unsigned, 64);
    let fn_ty = types.intern(Type::Fn {
        params: vec![i64_ty],
        ret: u64_ty,
        cc: CallConv::C,
    });
    let mut ir = Ir::new();
    let a = ir.add_inst(i64_ty, InstOp::Arg { index: 0 });
    let cast = ir.add_inst(
        u64_ty,
        InstOp::IntCast {
            operand: Operand::Inst(a),
        },
    );
    let r = ir.add_inst(
        types::NO_RETURN,
        InstOp::Ret {
            operand: Operand::Inst(cast),
        },
    );
    ir.add_body(vec![a, cast, r]);
    let func = test_function("cast", fn_ty);
    let mut link = elf_link();
    let err = expect_fail(run(&func, &ir, &mut types, &mut link, linux()));
    assert!(err.msg.contains("signedness"), "got: {}", err.msg);
}

/// An unknown register name in inline assembly is a structured error.
#[test]
fn test_asm_unknown_register() {
    let mut types = TypePool::new();
    let u64_ty = types.int(Signedness::Unsigned, 64);
    let fn_ty = types.intern(Type::Fn {
        params: vec![u64_ty],
        ret: types::VOID,
        cc: CallConv::C,
    });
    let mut ir = Ir::new();
    let a = ir.add_inst(u64_ty, InstOp::Arg { index: 0 });
    let asm = ir.add_inst(
        types::VOID,
        InstOp::Assembly {
            source: "svc #0".to_string(),
            outputs: vec![],
            inputs: vec![(
                petrel::ir::AsmConstraint {
                    register_name: "q7".to_string(),
                },
                Operand::Inst(a),
            )],
            is_volatile: true,
        },
    );
    let unreach = ir.add_inst(types::NO_RETURN, InstOp::Unreach);
    ir.add_body(vec![a, asm, unreach]);
    let func = test_function("asm", fn_ty);
    let mut link = elf_link();
    let err = expect_fail(run(&func, &ir, &mut types, &mut link, linux()));
    assert!(
        err.msg.contains("unrecognized register: 'q7'"),
        "got: {}",
        err.msg
    );
}

/// Volatile inline assembly lowers its inputs and emits the `svc`.
#[test]
fn test_asm_svc() {
    let mut types = TypePool::new();
    let u64_ty = types.int(Signedness::Unsigned, 64);
    let fn_ty = types.intern(Type::Fn {
        params: vec![u64_ty],
        ret: types::VOID,
        cc: CallConv::C,
    });
    let mut ir = Ir::new();
    let a = ir.add_inst(u64_ty, InstOp::Arg { index: 0 });
    let asm = ir.add_inst(
        types::VOID,
        InstOp::Assembly {
            source: "svc #0x80".to_string(),
            outputs: vec![],
            inputs: vec![(
                petrel::ir::AsmConstraint {
                    register_name: "x16".to_string(),
                },
                Operand::Inst(a),
            )],
            is_volatile: true,
        },
    );
    let unreach = ir.add_inst(types::NO_RETURN, InstOp::Unreach);
    ir.add_body(vec![a, asm, unreach]);
    let func = test_function("syscall", fn_ty);
    let mut link = elf_link();
    let mir = expect_mir(run(&func, &ir, &mut types, &mut link, linux()));
    assert!(mir.instructions.contains(&Inst::Svc { imm16: 0x80 }));
    // The input was loaded into x16 from the parameter's home slot.
    assert!(mir.instructions.contains(&Inst::LdrImmediate {
        rt: Register::X16,
        rn: Register::X29,
        offset: -8,
    }));
}
