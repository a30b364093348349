//! Extracts `_kHook*` descriptors planted by the compiler/linker-macro layer
//! into the `.kamek` section, turning each one into the arguments a command
//! constructor expects.

use std::collections::HashMap;

use goblin::elf::Elf;
use scroll::{Pread, BE};

use crate::error::Result;
use crate::symbols::SymbolTables;
use crate::word::{Kind, Word};

/// The raw shape of one `_kHook*` record: an argument count, a small
/// integer naming which kind of hook it is, then that many 32-bit
/// arguments (each possibly itself the target of a relocation).
#[derive(Debug, Clone)]
pub struct HookDescriptor {
    pub hook_type: u32,
    pub args: Vec<Word>,
}

pub fn extract_hooks(
    elves: &[Elf],
    symbols: &SymbolTables,
    memory: &[u8],
    base_address: Word,
    kamek_relocs: &HashMap<Word, Word>,
) -> Result<Vec<HookDescriptor>> {
    let mut hooks = Vec::new();

    for ei in 0..elves.len() {
        let mut names: Vec<&str> = symbols.locals[ei]
            .keys()
            .filter(|name| name.starts_with("_kHook"))
            .map(|name| name.as_str())
            .collect();
        names.sort_unstable();

        for name in names {
            let cmd_addr = symbols.locals[ei][name].address;
            hooks.push(read_hook(cmd_addr, memory, base_address, kamek_relocs)?);
        }
    }

    Ok(hooks)
}

/// Reads one `_kHook*` record starting at `cmd_addr`, resolving each argument
/// slot against `kamek_relocs` before falling back to the raw word in
/// `memory`.
fn read_hook(
    cmd_addr: Word,
    memory: &[u8],
    base_address: Word,
    kamek_relocs: &HashMap<Word, Word>,
) -> Result<HookDescriptor> {
    let base_offset = (cmd_addr.value() - base_address.value()) as usize;

    let arg_count: u32 = memory.pread_with(base_offset, BE)?;
    let hook_type: u32 = memory.pread_with(base_offset + 4, BE)?;

    let mut args = Vec::with_capacity(arg_count as usize);
    for i in 0..arg_count {
        let arg_addr = cmd_addr + (8 + (i << 2));
        // kamek_relocs is always keyed absolute (reloc.rs forces the source's
        // kind), while arg_addr inherits cmd_addr's kind, which is relative in
        // a dynamic link. Re-tag before the lookup so the two agree.
        if let Some(dest) = kamek_relocs.get(&arg_addr.with_kind(Kind::Absolute)) {
            args.push(*dest);
        } else {
            let offset = (arg_addr.value() - base_address.value()) as usize;
            let raw: u32 = memory.pread_with(offset, BE)?;
            args.push(Word::val(raw));
        }
    }

    Ok(HookDescriptor { hook_type, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_no_hooks_from_empty_input() {
        let hooks = extract_hooks(&[], &SymbolTables {
            locals: vec![],
            globals: HashMap::new(),
            symbol_sizes: HashMap::new(),
        }, &[], Word::abs(0x8000_0000u32), &HashMap::new()).unwrap();
        assert!(hooks.is_empty());
    }

    #[test]
    fn relocated_arg_resolves_under_relative_cmd_addr() {
        // Dynamic link: cmd_addr (and so arg_addr) is Relative, but
        // kamek_relocs is always keyed Absolute (reloc.rs forces this).
        let base_address = Word::rel(0u32);
        let cmd_addr = Word::rel(0x10u32);

        let mut memory = vec![0u8; 0x20];
        memory[0x10..0x14].copy_from_slice(&1u32.to_be_bytes()); // arg_count
        memory[0x14..0x18].copy_from_slice(&7u32.to_be_bytes()); // hook_type
        // the raw arg slot is left zeroed; it must never be read, since the
        // relocation map should resolve the argument first.

        let arg_addr = cmd_addr + 8u32;
        assert!(arg_addr.is_relative());

        let mut kamek_relocs = HashMap::new();
        kamek_relocs.insert(arg_addr.with_kind(Kind::Absolute), Word::abs(0x8010_0000u32));

        let hook = read_hook(cmd_addr, &memory, base_address, &kamek_relocs).unwrap();

        assert_eq!(hook.hook_type, 7);
        assert_eq!(hook.args, vec![Word::abs(0x8010_0000u32)]);
    }

    #[test]
    fn unrelocated_arg_falls_back_to_raw_memory() {
        let base_address = Word::abs(0x8000_0000u32);
        let cmd_addr = Word::abs(0x8000_0010u32);

        let mut memory = vec![0u8; 0x20];
        memory[0x10..0x14].copy_from_slice(&1u32.to_be_bytes()); // arg_count
        memory[0x14..0x18].copy_from_slice(&3u32.to_be_bytes()); // hook_type
        memory[0x18..0x1c].copy_from_slice(&0x1234_5678u32.to_be_bytes());

        let hook = read_hook(cmd_addr, &memory, base_address, &HashMap::new()).unwrap();

        assert_eq!(hook.hook_type, 3);
        assert_eq!(hook.args, vec![Word::val(0x1234_5678u32)]);
    }
}
