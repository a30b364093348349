//! Processes every `SHT_RELA` relocation in the input objects into either a
//! Kamek hook relocation (consumed in place) or a deferred fixup that a
//! command will apply later.

use std::collections::HashMap;

use goblin::elf::section_header::SHT_REL;
use goblin::elf::Elf;

use crate::elf_collect::SectionKey;
use crate::error::{Error, Result};
use crate::externals::Externals;
use crate::symbols::SymbolTables;
use crate::word::Word;

pub const R_PPC_ADDR32: u32 = 1;
pub const R_PPC_ADDR16_LO: u32 = 4;
pub const R_PPC_ADDR16_HI: u32 = 5;
pub const R_PPC_ADDR16_HA: u32 = 6;
pub const R_PPC_REL24: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct RelocFixup {
    pub reloc_type: u32,
    pub source: Word,
    pub dest: Word,
}

pub struct RelocResult {
    pub fixups: Vec<RelocFixup>,
    pub kamek_relocs: HashMap<Word, Word>,
}

#[allow(clippy::too_many_arguments)]
pub fn process_relocations(
    elves: &[Elf],
    section_bases: &HashMap<SectionKey, Word>,
    symbols: &SymbolTables,
    externals: &Externals,
    kamek_start: Word,
    kamek_end: Word,
) -> Result<RelocResult> {
    let mut fixups = Vec::new();
    let mut kamek_relocs = HashMap::new();

    for (ei, elf) in elves.iter().enumerate() {
        if elf.section_headers.iter().any(|sh| sh.sh_type == SHT_REL) {
            return Err(Error::InvalidData(
                "SHT_REL sections (relocations without addends) are not supported".into(),
            ));
        }

        for (ri, reloc_section) in &elf.shdr_relocs {
            let rela_header = &elf.section_headers[*ri];
            if rela_header.sh_entsize != 0 && rela_header.sh_entsize != 12 {
                return Err(Error::InvalidData(
                    "invalid relocs format (sh_entsize != 12)".into(),
                ));
            }

            let affected_index = rela_header.sh_info as usize;
            if affected_index == 0 || affected_index >= elf.section_headers.len() {
                return Err(Error::InvalidData(
                    "rela table is not linked to a section".into(),
                ));
            }
            let link = rela_header.sh_link as usize;
            if link == 0 || link >= elf.section_headers.len() {
                return Err(Error::InvalidData(
                    "rela table is not linked to a symbol table".into(),
                ));
            }

            let Some(section_base) = section_bases.get(&(ei, affected_index)) else {
                continue;
            };

            for reloc in reloc_section.iter() {
                if reloc.r_sym == 0 {
                    return Err(Error::InvalidData("linking to undefined symbol".into()));
                }

                let sym = elf.syms.get(reloc.r_sym).ok_or_else(|| {
                    Error::InvalidData(format!("relocation refers to unknown symbol {}", reloc.r_sym))
                })?;
                let sym_name = elf.strtab.get_at(sym.st_name).unwrap_or("");

                let source = Word::abs((*section_base + reloc.r_offset as u32).value());
                let target = symbols.resolve(ei, sym_name, externals)?;
                let addend = reloc.r_addend.unwrap_or(0);
                let dest = target.address + addend;

                if try_consume_kamek_reloc(reloc.r_type, source, dest, kamek_start, kamek_end, &mut kamek_relocs)? {
                    continue;
                }

                fixups.push(RelocFixup { reloc_type: reloc.r_type, source, dest });
            }
        }
    }

    Ok(RelocResult { fixups, kamek_relocs })
}

fn try_consume_kamek_reloc(
    reloc_type: u32,
    source: Word,
    dest: Word,
    kamek_start: Word,
    kamek_end: Word,
    kamek_relocs: &mut HashMap<Word, Word>,
) -> Result<bool> {
    if source < kamek_start || source >= kamek_end {
        return Ok(false);
    }
    if reloc_type != R_PPC_ADDR32 {
        return Err(Error::InvalidOperation(
            "unsupported relocation type in the Kamek hook data section".into(),
        ));
    }
    kamek_relocs.insert(source, dest);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_kamek_range_is_left_as_a_fixup() {
        let mut relocs = HashMap::new();
        let consumed = try_consume_kamek_reloc(
            R_PPC_ADDR32,
            Word::abs(0x1000u32),
            Word::abs(0x2000u32),
            Word::abs(0x9000u32),
            Word::abs(0xA000u32),
            &mut relocs,
        )
        .unwrap();
        assert!(!consumed);
        assert!(relocs.is_empty());
    }

    #[test]
    fn inside_kamek_range_is_recorded() {
        let mut relocs = HashMap::new();
        let consumed = try_consume_kamek_reloc(
            R_PPC_ADDR32,
            Word::abs(0x9500u32),
            Word::abs(0x2000u32),
            Word::abs(0x9000u32),
            Word::abs(0xA000u32),
            &mut relocs,
        )
        .unwrap();
        assert!(consumed);
        assert_eq!(relocs.get(&Word::abs(0x9500u32)), Some(&Word::abs(0x2000u32)));
    }

    #[test]
    fn unsupported_reloc_type_inside_kamek_range_errors() {
        let mut relocs = HashMap::new();
        let err = try_consume_kamek_reloc(
            R_PPC_REL24,
            Word::abs(0x9500u32),
            Word::abs(0x2000u32),
            Word::abs(0x9000u32),
            Word::abs(0xA000u32),
            &mut relocs,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }
}
