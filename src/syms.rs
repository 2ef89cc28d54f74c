use std::{
    borrow::{Borrow, Cow},
    io::BufRead,
};

use ahash::AHashMap;
use symbolic::{
    common::{Language, Name, NameMangling},
    demangle::{Demangle, DemangleOptions},
};

use crate::{elf::ElfObject, error::TraceError};

/// Maps a kernel text address to the name of the function containing it.
pub trait Resolver {
    fn function_name(&self, addr: u64) -> Option<Cow<'_, str>>;
}

/// Resolver used when neither kallsyms nor a vmlinux image was given.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl Resolver for NoSymbols {
    fn function_name(&self, _addr: u64) -> Option<Cow<'_, str>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    /// Zero when the source does not record sizes (kallsyms).
    pub size: u64,
}

impl Symbol {
    // from a /proc/kallsyms line
    fn parse_kallsyms(line: &str) -> Option<Self> {
        let mut components = line.split_whitespace();
        let address = u64::from_str_radix(components.next()?, 16).ok()?;
        let kind = components.next()?;
        if !matches!(kind, "t" | "T" | "w" | "W") {
            // not a text symbol
            return None;
        }
        let name = components.next()?.to_string();
        // Skip [module], the symbol name is what call sites are keyed by
        Some(Symbol {
            name,
            address,
            size: 0,
        })
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.address && (self.size == 0 || addr - self.address < self.size)
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    syms: Vec<Symbol>,
}

impl SymbolTable {
    pub fn from_symbols(mut syms: Vec<Symbol>) -> Self {
        // kptr_restrict hides every address as zero
        syms.retain(|sym| sym.address != 0);
        syms.sort_unstable_by(|a, b| a.address.cmp(&b.address).then(b.size.cmp(&a.size)));
        syms.dedup_by_key(|sym| sym.address);
        Self { syms }
    }

    pub fn from_kallsyms<R: BufRead>(reader: R) -> Result<Self, TraceError> {
        let mut syms = Vec::new();
        for line in reader.lines() {
            if let Some(sym) = Symbol::parse_kallsyms(&line?) {
                syms.push(sym);
            }
        }
        let table = Self::from_symbols(syms);
        if table.is_empty() {
            tracing::warn!("kallsyms contained no usable text symbols, is kptr_restrict set?");
        }
        Ok(table)
    }

    pub fn from_elf(data: &[u8]) -> Result<Self, TraceError> {
        let elf = ElfObject::parse(data)?;
        if !elf.has_symbols() {
            tracing::warn!("ELF image has no symbol table");
        }
        Ok(Self::from_symbols(elf.symbols().collect()))
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    pub fn lookup(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.syms.partition_point(|sym| sym.address <= addr);
        let sym = self.syms.get(idx.checked_sub(1)?)?;
        sym.contains(addr).then_some(sym)
    }
}

impl Resolver for SymbolTable {
    fn function_name(&self, addr: u64) -> Option<Cow<'_, str>> {
        self.lookup(addr).map(|sym| Cow::Borrowed(sym.name.as_str()))
    }
}

impl<R: Resolver + ?Sized> Resolver for &R {
    fn function_name(&self, addr: u64) -> Option<Cow<'_, str>> {
        (**self).function_name(addr)
    }
}

/// Demangles Rust-for-Linux symbols, C names pass through untouched.
pub fn print_name<S: Borrow<str>>(name: S) -> String {
    let name = name.borrow();
    if name.is_empty() {
        return String::from("??");
    }
    Name::new(name, NameMangling::Unknown, Language::Unknown)
        .try_demangle(DemangleOptions::name_only())
        .into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

impl FunctionId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hands out one canonical [`FunctionId`] per distinct function name, so
/// the statistics table compares small integers instead of strings.
#[derive(Debug, Default)]
pub struct Interner {
    ids: AHashMap<String, FunctionId>,
    names: Vec<String>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> FunctionId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = FunctionId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<FunctionId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: FunctionId) -> &str {
        &self.names[id.index()]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Name used for call sites no symbol covers.
pub fn unresolved_name(addr: u64) -> String {
    format!("{addr:#x}")
}
