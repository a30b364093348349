//! Resolves every symbol defined or referenced across the input objects
//! into an address, following the ELF binding rules for locals, globals and
//! weak symbols.

use std::collections::HashMap;

use goblin::elf::{section_header::SHT_SYMTAB, section_header::SHT_STRTAB, Elf};

use crate::elf_collect::SectionKey;
use crate::error::{Error, Result};
use crate::externals::Externals;
use crate::word::Word;

const SHN_UNDEF: usize = 0;
const SHN_LORESERVE: usize = 0xff00;
const SHN_ABS: usize = 0xfff1;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;

#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub address: Word,
    pub size: u32,
    pub is_weak: bool,
}

/// Every symbol reachable by name, split the way the linker consults them:
/// first the defining object's locals, then the globals shared across all
/// objects, then the caller-supplied externs (held separately, see
/// [`crate::externals::Externals`]).
pub struct SymbolTables {
    pub locals: Vec<HashMap<String, Symbol>>,
    pub globals: HashMap<String, Symbol>,
    pub symbol_sizes: HashMap<Word, u32>,
}

/// Resolves a symbol's `st_shndx` to an address: `SHN_ABS` is a bare
/// absolute value, an ordinary index looks its section's base up in
/// `section_bases` (returning `Ok(None)` if that section was never
/// collected into the output, e.g. `.comment`/`.debug*`), and any other
/// reserved index (`SHN_COMMON`, `SHN_XINDEX`, ...) is rejected rather
/// than silently dropped.
fn resolve_symbol_address(
    name: &str,
    ei: usize,
    st_shndx: usize,
    st_value: u32,
    section_bases: &HashMap<SectionKey, Word>,
) -> Result<Option<Word>> {
    if st_shndx == SHN_ABS {
        return Ok(Some(Word::abs(st_value)));
    }
    if st_shndx >= SHN_LORESERVE {
        return Err(Error::InvalidData(format!(
            "symbol \"{name}\" has unsupported special section index {st_shndx:#x}"
        )));
    }
    Ok(section_bases.get(&(ei, st_shndx)).map(|base| *base + st_value))
}

pub fn build_symbol_tables(
    elves: &[Elf],
    section_bases: &HashMap<SectionKey, Word>,
) -> Result<SymbolTables> {
    let mut tables = SymbolTables {
        locals: vec![HashMap::new(); elves.len()],
        globals: HashMap::new(),
        symbol_sizes: HashMap::new(),
    };

    for (ei, elf) in elves.iter().enumerate() {
        let symtab_header = elf
            .section_headers
            .iter()
            .find(|sh| sh.sh_type == SHT_SYMTAB);
        let Some(symtab_header) = symtab_header else {
            continue;
        };

        if symtab_header.sh_entsize != 16 {
            return Err(Error::InvalidData(
                "invalid symbol table format (sh_entsize != 16)".into(),
            ));
        }
        let link = symtab_header.sh_link as usize;
        if link == 0 || link >= elf.section_headers.len() {
            return Err(Error::InvalidTableLinkage(
                "symbol table is not linked to a string table".into(),
            ));
        }
        if elf.section_headers[link].sh_type != SHT_STRTAB {
            return Err(Error::InvalidData(
                "string table does not have type SHT_STRTAB".into(),
            ));
        }

        for sym in elf.syms.iter() {
            let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
            if name.is_empty() || sym.st_shndx == SHN_UNDEF {
                continue;
            }

            let Some(address) = resolve_symbol_address(name, ei, sym.st_shndx, sym.st_value as u32, section_bases)?
            else {
                continue;
            };

            let bind = sym.st_info >> 4;
            let size = sym.st_size as u32;

            match bind {
                STB_LOCAL => {
                    if tables.locals[ei].contains_key(name) {
                        return Err(Error::InvalidData(format!(
                            "redefinition of local symbol {name}"
                        )));
                    }
                    tables.locals[ei].insert(
                        name.to_string(),
                        Symbol { address, size, is_weak: false },
                    );
                    tables.symbol_sizes.insert(address, size);
                }
                STB_GLOBAL => {
                    if let Some(existing) = tables.globals.get(name) {
                        if !existing.is_weak {
                            return Err(Error::InvalidData(format!(
                                "redefinition of global symbol {name}"
                            )));
                        }
                    }
                    tables.globals.insert(
                        name.to_string(),
                        Symbol { address, size, is_weak: false },
                    );
                    tables.symbol_sizes.insert(address, size);
                }
                STB_WEAK => {
                    if !tables.globals.contains_key(name) {
                        tables.globals.insert(
                            name.to_string(),
                            Symbol { address, size, is_weak: true },
                        );
                        tables.symbol_sizes.insert(address, size);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(tables)
}

impl SymbolTables {
    /// Looks a name up the way the linker does: first the referencing
    /// object's own local symbols, then the globals shared across every
    /// input object, then the caller-supplied externs.
    pub fn resolve(&self, elf_index: usize, name: &str, externals: &Externals) -> Result<Symbol> {
        if let Some(sym) = self.locals[elf_index].get(name) {
            return Ok(*sym);
        }
        if let Some(sym) = self.globals.get(name) {
            return Ok(*sym);
        }
        if let Some(address) = externals.get(name) {
            return Ok(Symbol { address, size: 0, is_weak: false });
        }
        Err(Error::InvalidData(format!("undefined symbol \"{name}\"")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_empty_tables() {
        let tables = build_symbol_tables(&[], &HashMap::new()).unwrap();
        assert!(tables.locals.is_empty());
        assert!(tables.globals.is_empty());
        assert!(tables.symbol_sizes.is_empty());
    }

    #[test]
    fn abs_shndx_yields_bare_absolute_address() {
        let address = resolve_symbol_address("foo", 0, SHN_ABS, 0x1234, &HashMap::new()).unwrap();
        assert_eq!(address, Some(Word::abs(0x1234u32)));
    }

    #[test]
    fn ordinary_shndx_looks_up_section_base() {
        let mut bases = HashMap::new();
        bases.insert((0, 3), Word::abs(0x8000_0000u32));
        let address = resolve_symbol_address("foo", 0, 3, 0x10, &bases).unwrap();
        assert_eq!(address, Some(Word::abs(0x8000_0010u32)));
    }

    #[test]
    fn uncollected_section_yields_no_address() {
        let address = resolve_symbol_address("foo", 0, 7, 0x10, &HashMap::new()).unwrap();
        assert_eq!(address, None);
    }

    #[test]
    fn reserved_shndx_is_rejected() {
        const SHN_COMMON: usize = 0xfff2;
        const SHN_XINDEX: usize = 0xffff;

        let err = resolve_symbol_address("foo", 0, SHN_COMMON, 0, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));

        let err = resolve_symbol_address("foo", 0, SHN_XINDEX, 0, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }
}
