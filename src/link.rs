//! Linker services consumed during code generation.
//!
//! Code generation never writes object files itself; it only needs to
//! know how a callee or constant will be addressable once the linker has
//! done its work. ELF, COFF and Plan 9 hand out absolute GOT entry
//! addresses up front, so the backend can treat a symbol as a plain
//! memory load. Mach-O resolves addresses during linking, so the backend
//! emits relocation pseudo-instructions carrying symbol indices instead.

use std::collections::HashMap;

use crate::ir::{FuncIndex, ValueIndex};

/// Where a linker-resolved constant lives from the backend's point of
/// view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLocation {
    /// Absolute address, valid at run time.
    Memory(u64),
    /// Loaded through the global offset table; payload is a symbol index.
    GotLoad(u32),
    /// Loaded relative to the symbol itself; payload is a symbol index.
    DirectLoad(u32),
}

/// ELF: the GOT is laid out before code generation, entries are
/// addressable directly.
#[derive(Debug)]
pub struct ElfFile {
    pub got_base: u64,
    offset_table: HashMap<FuncIndex, u64>,
    data_table: HashMap<ValueIndex, u64>,
    next_index: u64,
}

impl ElfFile {
    pub fn new(got_base: u64) -> Self {
        Self {
            got_base,
            offset_table: HashMap::new(),
            data_table: HashMap::new(),
            next_index: 0,
        }
    }

    fn next_entry(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.got_base + index * 8
    }

    /// Address of the GOT entry holding the function's address.
    pub fn fn_got_addr(&mut self, func: FuncIndex) -> u64 {
        if let Some(&addr) = self.offset_table.get(&func) {
            return addr;
        }
        let addr = self.next_entry();
        self.offset_table.insert(func, addr);
        addr
    }

    /// Address of the GOT entry for a constant placed in the data
    /// section.
    pub fn data_got_addr(&mut self, value: ValueIndex) -> u64 {
        if let Some(&addr) = self.data_table.get(&value) {
            return addr;
        }
        let addr = self.next_entry();
        self.data_table.insert(value, addr);
        addr
    }
}

/// Mach-O: symbols are referenced by index and fixed up by relocations.
#[derive(Debug, Default)]
pub struct MachOFile {
    fn_symbols: HashMap<FuncIndex, u32>,
    data_symbols: HashMap<ValueIndex, u32>,
    /// String-table offsets of registered extern functions.
    extern_fns: HashMap<String, u32>,
    next_sym: u32,
    next_strx: u32,
}

impl MachOFile {
    pub fn new() -> Self {
        Self {
            next_strx: 1,
            ..Self::default()
        }
    }

    pub fn fn_sym_index(&mut self, func: FuncIndex) -> u32 {
        if let Some(&sym) = self.fn_symbols.get(&func) {
            return sym;
        }
        let sym = self.next_sym;
        self.next_sym += 1;
        self.fn_symbols.insert(func, sym);
        sym
    }

    pub fn data_sym_index(&mut self, value: ValueIndex) -> u32 {
        if let Some(&sym) = self.data_symbols.get(&value) {
            return sym;
        }
        let sym = self.next_sym;
        self.next_sym += 1;
        self.data_symbols.insert(value, sym);
        sym
    }

    /// Register an extern function and return its string-table offset.
    /// Writes are serialized by the caller; code generation itself runs
    /// one function at a time.
    pub fn extern_fn(&mut self, name: &str) -> u32 {
        if let Some(&strx) = self.extern_fns.get(name) {
            return strx;
        }
        let strx = self.next_strx;
        self.next_strx += name.len() as u32 + 1;
        self.extern_fns.insert(name.to_string(), strx);
        strx
    }
}

/// COFF: same addressing model as ELF for our purposes.
#[derive(Debug)]
pub struct CoffFile {
    inner: ElfFile,
}

impl CoffFile {
    pub fn new(got_base: u64) -> Self {
        Self {
            inner: ElfFile::new(got_base),
        }
    }

    pub fn fn_got_addr(&mut self, func: FuncIndex) -> u64 {
        self.inner.fn_got_addr(func)
    }

    pub fn data_got_addr(&mut self, value: ValueIndex) -> u64 {
        self.inner.data_got_addr(value)
    }
}

/// Plan 9: symbols live at fixed addresses in the flat binary.
#[derive(Debug)]
pub struct Plan9File {
    pub bases: u64,
    fn_addrs: HashMap<FuncIndex, u64>,
    data_addrs: HashMap<ValueIndex, u64>,
    next: u64,
}

impl Plan9File {
    pub fn new(bases: u64) -> Self {
        Self {
            bases,
            fn_addrs: HashMap::new(),
            data_addrs: HashMap::new(),
            next: 0,
        }
    }

    fn next_addr(&mut self) -> u64 {
        let addr = self.bases + self.next * 8;
        self.next += 1;
        addr
    }

    pub fn fn_addr(&mut self, func: FuncIndex) -> u64 {
        if let Some(&addr) = self.fn_addrs.get(&func) {
            return addr;
        }
        let addr = self.next_addr();
        self.fn_addrs.insert(func, addr);
        addr
    }

    pub fn data_addr(&mut self, value: ValueIndex) -> u64 {
        if let Some(&addr) = self.data_addrs.get(&value) {
            return addr;
        }
        let addr = self.next_addr();
        self.data_addrs.insert(value, addr);
        addr
    }
}

/// The active linker backend.
#[derive(Debug)]
pub enum LinkFile {
    Elf(ElfFile),
    MachO(MachOFile),
    Coff(CoffFile),
    Plan9(Plan9File),
}

impl LinkFile {
    /// Where the address of a module-local function can be found.
    pub fn function_location(&mut self, func: FuncIndex) -> SymbolLocation {
        match self {
            LinkFile::Elf(elf) => SymbolLocation::Memory(elf.fn_got_addr(func)),
            LinkFile::MachO(macho) => SymbolLocation::GotLoad(macho.fn_sym_index(func)),
            LinkFile::Coff(coff) => SymbolLocation::Memory(coff.fn_got_addr(func)),
            LinkFile::Plan9(plan9) => SymbolLocation::Memory(plan9.fn_addr(func)),
        }
    }

    /// Where a constant's bytes can be found.
    pub fn constant_location(&mut self, value: ValueIndex) -> SymbolLocation {
        match self {
            LinkFile::Elf(elf) => SymbolLocation::Memory(elf.data_got_addr(value)),
            LinkFile::MachO(macho) => SymbolLocation::GotLoad(macho.data_sym_index(value)),
            LinkFile::Coff(coff) => SymbolLocation::Memory(coff.data_got_addr(value)),
            LinkFile::Plan9(plan9) => SymbolLocation::Memory(plan9.data_addr(value)),
        }
    }
}
