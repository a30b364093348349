//! Orchestrates one version's link job end to end: collect sections,
//! resolve symbols, process relocations, extract hooks, and fold the
//! resulting commands into a packed binary.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use goblin::elf::Elf;

use crate::address_mapper::AddressMapper;
use crate::elf_collect::collect_sections;
use crate::error::{Error, Result};
use crate::externals::Externals;
use crate::hooks::extract_hooks;
use crate::kamek::KamekBinary;
use crate::reloc::process_relocations;
use crate::symbols::build_symbol_tables;
use crate::word::Word;

/// Drives a single static or dynamic link for one game version. Single-use:
/// calling `link_static`/`link_dynamic` a second time on the same instance
/// fails with `AlreadyLinked`.
pub struct Linker {
    mapper: AddressMapper,
    linked: bool,
}

impl Linker {
    pub fn new(mapper: AddressMapper) -> Self {
        Linker { mapper, linked: false }
    }

    pub fn link_static(
        &mut self,
        paths: &[PathBuf],
        externals: &Externals,
        base_addr: Option<u32>,
    ) -> Result<KamekBinary> {
        let base_value = self.mapper.remap(base_addr.unwrap_or(0x8000_0000));
        self.do_link(paths, externals, Word::abs(base_value))
    }

    pub fn link_dynamic(&mut self, paths: &[PathBuf], externals: &Externals) -> Result<KamekBinary> {
        self.do_link(paths, externals, Word::rel(0u32))
    }

    fn do_link(&mut self, paths: &[PathBuf], externals: &Externals, base_addr: Word) -> Result<KamekBinary> {
        if self.linked {
            return Err(Error::AlreadyLinked("this linker has already been linked".into()));
        }
        self.linked = true;

        log::info!("linking {} object(s) at base {base_addr}", paths.len());

        let mut seen_paths = std::collections::HashSet::new();
        for path in paths {
            if !seen_paths.insert(path) {
                return Err(Error::AlreadyExists(format!(
                    "{} is already part of this linker",
                    path.display()
                )));
            }
        }

        let mut sorted_paths = paths.to_vec();
        sorted_paths.sort_by(|a, b| human_cmp(a, b));

        let buffers: Vec<Vec<u8>> = sorted_paths
            .iter()
            .map(std::fs::read)
            .collect::<std::io::Result<_>>()?;
        let elves: Vec<Elf> = buffers
            .iter()
            .map(|bytes| Elf::parse(bytes))
            .collect::<std::result::Result<_, _>>()?;

        log::debug!("collecting sections from {} object(s)", elves.len());
        let layout = collect_sections(&elves, &buffers, base_addr)?;

        if !(layout.output_start <= layout.output_end
            && layout.output_end <= layout.bss_start
            && layout.bss_start <= layout.bss_end
            && layout.bss_end <= layout.kamek_start
            && layout.kamek_start <= layout.kamek_end)
        {
            return Err(Error::InvalidData(
                "section layout ordering invariant violated".into(),
            ));
        }

        log::debug!("building symbol tables");
        let tables = build_symbol_tables(&elves, &layout.section_bases)?;

        let mut externs = Externals::new();
        for (name, value) in externals.iter() {
            externs.insert(name, Word::abs(self.mapper.remap(value.value())));
        }
        for (name, addr) in &layout.synthetic_externs {
            externs.insert(name.clone(), *addr);
        }

        log::debug!("processing relocations");
        let reloc_result = process_relocations(
            &elves,
            &layout.section_bases,
            &tables,
            &externs,
            layout.kamek_start,
            layout.kamek_end,
        )?;
        log::debug!("{} deferred fixup(s)", reloc_result.fixups.len());

        log::debug!("extracting hooks");
        let hooks = extract_hooks(
            &elves,
            &tables,
            &layout.memory,
            base_addr,
            &reloc_result.kamek_relocs,
        )?;
        log::info!("found {} hook(s)", hooks.len());

        KamekBinary::build(&layout, &tables.symbol_sizes, reloc_result.fixups, &hooks, base_addr)
    }
}

/// "Human" alphanumeric ordering: runs of digits compare as integers rather
/// than lexicographically, so `obj2.o` sorts before `obj10.o`.
fn human_cmp(a: &Path, b: &Path) -> Ordering {
    let a = a.to_string_lossy();
    let b = b.to_string_lossy();

    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();

    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ac), Some(bc)) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let a_num = take_digits(&mut ai);
                    let b_num = take_digits(&mut bi);
                    match a_num.cmp(&b_num) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                } else {
                    match ac.cmp(bc) {
                        Ordering::Equal => {
                            ai.next();
                            bi.next();
                            continue;
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_digits(iter: &mut std::iter::Peekable<std::str::Chars>) -> u64 {
    let mut value: u64 = 0;
    while let Some(c) = iter.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        value = value * 10 + c.to_digit(10).unwrap() as u64;
        iter.next();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_sort_orders_numeric_runs_as_integers() {
        let mut paths = vec![PathBuf::from("obj10.o"), PathBuf::from("obj2.o"), PathBuf::from("obj1.o")];
        paths.sort_by(|a, b| human_cmp(a, b));
        assert_eq!(
            paths,
            vec![PathBuf::from("obj1.o"), PathBuf::from("obj2.o"), PathBuf::from("obj10.o")]
        );
    }

    #[test]
    fn duplicate_input_paths_are_rejected() {
        let mut linker = Linker::new(AddressMapper::new());
        let paths = vec![PathBuf::from("a.o"), PathBuf::from("a.o")];
        let err = linker.do_link(&paths, &Externals::new(), Word::abs(0x8000_0000u32)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn relinking_fails() {
        let mut linker = Linker::new(AddressMapper::new());
        linker.linked = true;
        let err = linker.do_link(&[], &Externals::new(), Word::abs(0x8000_0000u32)).unwrap_err();
        assert!(matches!(err, Error::AlreadyLinked(_)));
    }
}
