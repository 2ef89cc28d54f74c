//! Function symbols out of an uncompressed `vmlinux` (or module `.ko`) image.

use std::fmt;

use goblin::elf::{header::ET_CORE, sym::Sym, Elf};
use goblin::strtab::Strtab;

use crate::error::TraceError;
use crate::syms::Symbol;

pub struct ElfObject<'data> {
    elf: Elf<'data>,
}

impl<'data> ElfObject<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self, TraceError> {
        let elf = Elf::parse(data)?;
        if elf.header.e_type == ET_CORE {
            return Err(TraceError::Elf(goblin::error::Error::Malformed(
                "core dumps carry no symbol table".to_string(),
            )));
        }
        Ok(ElfObject { elf })
    }

    pub fn has_symbols(&self) -> bool {
        !self.elf.syms.is_empty() || !self.elf.dynsyms.is_empty()
    }

    /// Defined function symbols, `.symtab` preferred over `.dynsym`.
    pub fn symbols(&self) -> ElfSymbolIterator<'data, '_> {
        if self.elf.syms.is_empty() {
            ElfSymbolIterator {
                syms: self.elf.dynsyms.iter().collect(),
                strtab: &self.elf.dynstrtab,
                index: 0,
            }
        } else {
            ElfSymbolIterator {
                syms: self.elf.syms.iter().collect(),
                strtab: &self.elf.strtab,
                index: 0,
            }
        }
    }
}

impl fmt::Debug for ElfObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfObject")
            .field("is_64", &self.elf.is_64)
            .field("symbols", &self.elf.syms.len())
            .field("dynamic_symbols", &self.elf.dynsyms.len())
            .finish()
    }
}

pub struct ElfSymbolIterator<'data, 'object> {
    syms: Vec<Sym>,
    strtab: &'object Strtab<'data>,
    index: usize,
}

impl<'data, 'object> Iterator for ElfSymbolIterator<'data, 'object> {
    type Item = Symbol;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(sym) = self.syms.get(self.index) {
            self.index += 1;

            if !sym.is_function() || sym.st_value == 0 {
                continue;
            }

            let name = match self.strtab.get_at(sym.st_name) {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };

            return Some(Symbol {
                name: name.to_string(),
                address: sym.st_value,
                size: sym.st_size,
            });
        }
        None
    }
}
