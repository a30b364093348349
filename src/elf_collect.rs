//! Lays out every input object's sections into one flat memory image.
//!
//! Mirrors the layout a real linker script would produce for this game's
//! runtime: code-like sections first, `.bss` carved out but not populated,
//! then a private `.kamek` section the hook extractor consumes and strips
//! before anything reaches an output encoder.

use std::collections::HashMap;

use goblin::elf::{section_header::SHT_NOBITS, Elf};

use crate::error::Result;
use crate::word::{Kind, Word};

/// One `(elf index, section header index)` pair identifies an imported
/// section uniquely across every input object.
pub type SectionKey = (usize, usize);

pub struct SectionLayout {
    pub memory: Vec<u8>,
    pub section_bases: HashMap<SectionKey, Word>,
    pub output_start: Word,
    pub output_end: Word,
    pub bss_start: Word,
    pub bss_end: Word,
    pub kamek_start: Word,
    pub kamek_end: Word,
    pub synthetic_externs: Vec<(String, Word)>,
}

struct PrefixGroup {
    prefix: &'static str,
    align_end: u32,
    padding: u32,
}

const CODE_GROUPS: &[PrefixGroup] = &[
    PrefixGroup { prefix: ".init", align_end: 4, padding: 0 },
    PrefixGroup { prefix: ".fini", align_end: 4, padding: 0 },
    PrefixGroup { prefix: ".text", align_end: 4, padding: 0 },
    PrefixGroup { prefix: ".ctors", align_end: 32, padding: 4 },
    PrefixGroup { prefix: ".dtors", align_end: 32, padding: 4 },
    PrefixGroup { prefix: ".rodata", align_end: 32, padding: 0 },
    PrefixGroup { prefix: ".data", align_end: 32, padding: 0 },
];

const BSS_GROUP: PrefixGroup = PrefixGroup { prefix: ".bss", align_end: 32, padding: 0 };
const KAMEK_GROUP: PrefixGroup = PrefixGroup { prefix: ".kamek", align_end: 4, padding: 0 };

pub fn collect_sections(
    elves: &[Elf],
    buffers: &[Vec<u8>],
    base_address: Word,
) -> Result<SectionLayout> {
    let kind = base_address.kind();
    let mut cursor = base_address.value();
    let mut memory = Vec::new();
    let mut section_bases = HashMap::new();
    let mut synthetic_externs = Vec::new();

    let output_start = Word::new(cursor, kind);

    for group in CODE_GROUPS {
        import_group(group, elves, buffers, &mut cursor, kind, &mut memory, &mut section_bases, &mut synthetic_externs);
    }
    let output_end = Word::new(cursor, kind);

    let bss_start = Word::new(cursor, kind);
    import_group(&BSS_GROUP, elves, buffers, &mut cursor, kind, &mut memory, &mut section_bases, &mut synthetic_externs);
    let bss_end = Word::new(cursor, kind);

    let kamek_start = Word::new(cursor, kind);
    import_group(&KAMEK_GROUP, elves, buffers, &mut cursor, kind, &mut memory, &mut section_bases, &mut synthetic_externs);
    let kamek_end = Word::new(cursor, kind);

    Ok(SectionLayout {
        memory,
        section_bases,
        output_start,
        output_end,
        bss_start,
        bss_end,
        kamek_start,
        kamek_end,
        synthetic_externs,
    })
}

#[allow(clippy::too_many_arguments)]
fn import_group(
    group: &PrefixGroup,
    elves: &[Elf],
    buffers: &[Vec<u8>],
    cursor: &mut u32,
    kind: Kind,
    memory: &mut Vec<u8>,
    section_bases: &mut HashMap<SectionKey, Word>,
    synthetic_externs: &mut Vec<(String, Word)>,
) {
    let mut imported = false;
    let group_start = *cursor;

    for (ei, elf) in elves.iter().enumerate() {
        for (si, sh) in elf.section_headers.iter().enumerate() {
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
            if !name.starts_with(group.prefix) {
                continue;
            }

            section_bases.insert((ei, si), Word::new(*cursor, kind));

            let size = sh.sh_size as usize;
            if sh.sh_type == SHT_NOBITS {
                memory.resize(memory.len() + size, 0);
            } else {
                let start = sh.sh_offset as usize;
                memory.extend_from_slice(&buffers[ei][start..start + size]);
            }
            let padded = (size + 3) & !3;
            memory.resize(memory.len() + (padded - size), 0);
            *cursor += padded as u32;
            imported = true;
        }
    }

    if imported {
        let group_name = &group.prefix[1..];
        synthetic_externs.push((format!("_f_{group_name}"), Word::new(group_start, kind)));
        synthetic_externs.push((
            format!("_e_{group_name}"),
            Word::new(*cursor - group.padding, kind),
        ));
        *cursor += group.padding;
        if group.align_end > 0 && *cursor % group.align_end != 0 {
            let pad_len = group.align_end - (*cursor % group.align_end);
            memory.resize(memory.len() + pad_len as usize, 0);
            *cursor += pad_len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_zero_length_regions() {
        let layout = collect_sections(&[], &[], Word::abs(0x8000_0000u32)).unwrap();
        assert_eq!(layout.output_start, layout.output_end);
        assert_eq!(layout.bss_start, layout.bss_end);
        assert_eq!(layout.kamek_start, layout.kamek_end);
        assert!(layout.memory.is_empty());
        assert!(layout.synthetic_externs.is_empty());
    }
}
