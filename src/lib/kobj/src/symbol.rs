use elf::abi::{STB_GLOBAL, STB_LOCAL};

/// Symbol binding class, as far as namespacing cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    Other(u8),
}

impl From<u8> for Binding {
    fn from(value: u8) -> Self {
        match value {
            STB_LOCAL => Binding::Local,
            STB_GLOBAL => Binding::Global,
            other => Binding::Other(other),
        }
    }
}

/// The parts of a symbol the rewriter carries along but never looks at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SymbolPayload {
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
}

/// One entry of a symbol table. The name is an offset into the associated [crate::StringTable].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: u32,
    pub binding: Binding,
    pub payload: SymbolPayload,
}

impl SymbolEntry {
    pub fn new(name: u32, binding: Binding) -> Self {
        Self {
            name,
            binding,
            payload: SymbolPayload::default(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.binding == Binding::Global
    }
}

impl From<elf::symbol::Symbol> for SymbolEntry {
    fn from(value: elf::symbol::Symbol) -> Self {
        Self {
            name: value.st_name,
            binding: value.st_bind().into(),
            payload: SymbolPayload {
                shndx: value.st_shndx,
                value: value.st_value,
                size: value.st_size,
                info: (value.st_bind() << 4) | (value.st_symtype() & 0xf),
                other: value.st_vis(),
            },
        }
    }
}
