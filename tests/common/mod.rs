#![allow(dead_code)]

//! Shared scaffolding for the integration tests: build a small IR
//! function, run code generation, and pick the result apart.

use petrel::aarch64::mir::{Inst, Mir};
use petrel::core::SrcLoc;
use petrel::ir::Function;
use petrel::link::{ElfFile, LinkFile, MachOFile};
use petrel::target::{Os, Target};
use petrel::types::TypeIndex;
use petrel::{generate, DebugOutput, ErrorMsg, FnResult, Ir, Liveness, TypePool};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn linux() -> Target {
    Target::new(Os::Linux)
}

pub fn darwin() -> Target {
    Target::new(Os::Macos)
}

pub fn elf_link() -> LinkFile {
    LinkFile::Elf(ElfFile::new(0x10000))
}

pub fn macho_link() -> LinkFile {
    LinkFile::MachO(MachOFile::new())
}

pub fn test_function(name: &str, ty: TypeIndex) -> Function {
    Function {
        name: name.to_string(),
        ty,
        index: 0,
        atom_index: 0,
        src_loc: SrcLoc::new(1, 1),
        end_loc: SrcLoc::new(10, 1),
        safety: true,
    }
}

/// Analyze liveness and generate code for one function.
pub fn run(
    func: &Function,
    ir: &Ir,
    types: &mut TypePool,
    link: &mut LinkFile,
    target: Target,
) -> FnResult {
    init_logging();
    let mut liveness = Liveness::analyze(ir);
    let mut debug = DebugOutput::None;
    generate(func, ir, &mut liveness, types, link, target, &mut debug)
        .expect("code generation must not error out of band")
}

pub fn expect_mir(result: FnResult) -> Mir {
    match result {
        FnResult::Mir(mir) => mir,
        FnResult::Fail(err) => panic!("expected MIR, got failure: {}", err),
    }
}

pub fn expect_fail(result: FnResult) -> ErrorMsg {
    match result {
        FnResult::Mir(mir) => panic!("expected failure, got {} instructions", mir.len()),
        FnResult::Fail(err) => err,
    }
}

/// Every branch target must have been patched to a real instruction
/// index; index 0 is always the prologue and never a legitimate target.
pub fn assert_branches_patched(mir: &Mir) {
    for (i, inst) in mir.instructions.iter().enumerate() {
        let target = match inst {
            Inst::B { target } => *target,
            Inst::BCond { target, .. } => *target,
            Inst::Cbz { target, .. } => *target,
            _ => continue,
        };
        assert!(
            target != 0 && target <= mir.len(),
            "instruction {} has unpatched target {}",
            i,
            target
        );
    }
}

/// The instructions strictly between `dbg_prologue_end` and
/// `dbg_epilogue_begin`, i.e. the lowered body.
pub fn body_of(mir: &Mir) -> Vec<Inst> {
    let start = mir
        .instructions
        .iter()
        .position(|inst| matches!(inst, Inst::DbgPrologueEnd))
        .expect("no prologue end marker");
    let end = mir
        .instructions
        .iter()
        .position(|inst| matches!(inst, Inst::DbgEpilogueBegin))
        .expect("no epilogue begin marker");
    mir.instructions[start + 1..end].to_vec()
}
