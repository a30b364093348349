//! The packed patch module: a code image plus the commands that survive
//! static folding, serializable to the Kamek binary format, a Riivolution
//! XML fragment, Gecko codes, or applied straight onto a DOL.

use std::collections::{HashMap, HashSet};

use crate::commands::{dispatch_hook, Command, CodeImage, RelocCommand};
use crate::dol::DolFile;
use crate::elf_collect::SectionLayout;
use crate::error::{Error, Result};
use crate::hooks::HookDescriptor;
use crate::reloc::RelocFixup;
use crate::word::Word;

#[derive(Debug)]
pub struct KamekBinary {
    pub base_addr: Word,
    pub bss_size: u32,
    pub code: Vec<u8>,
    pub commands: Vec<Command>,
}

impl KamekBinary {
    /// Builds the command set from a linked section layout's fixups and
    /// hooks, then folds every command that can be applied statically
    /// straight into the code image, leaving only what must be deferred to
    /// the runtime loader (or a direct DOL patch).
    pub fn build(
        layout: &SectionLayout,
        symbol_sizes: &HashMap<Word, u32>,
        fixups: Vec<RelocFixup>,
        kamek_hooks: &[HookDescriptor],
        base_addr: Word,
    ) -> Result<KamekBinary> {
        let mut commands = Vec::new();
        let mut seen = HashSet::new();

        for fixup in fixups {
            let cmd = Command::Reloc(RelocCommand::new(fixup.source, fixup.dest, fixup.reloc_type));
            insert_unique(&mut commands, &mut seen, cmd)?;
        }
        for hook in kamek_hooks {
            let cmd = dispatch_hook(hook)?;
            insert_unique(&mut commands, &mut seen, cmd)?;
        }

        let code_size = (layout.output_end.value() - layout.output_start.value()) as usize;
        let start_off = (layout.output_start.value() - base_addr.value()) as usize;
        let mut code = layout.memory[start_off..start_off + code_size].to_vec();
        let bss_size = layout.bss_end.value() - layout.bss_start.value();

        let mut folded = Vec::with_capacity(commands.len());
        {
            let mut img = CodeImage { base_addr, code: &mut code, symbol_sizes };
            for mut cmd in commands {
                if !cmd.apply(&mut img)? {
                    folded.push(cmd);
                }
            }
        }

        Ok(KamekBinary { base_addr, bss_size, code, commands: folded })
    }

    /// The compact binary format a runtime loader consumes directly.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(b"Kamek\0\0\x01");
        out.extend_from_slice(&self.bss_size.to_be_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.code);

        for cmd in &self.commands {
            let addr = cmd.address();
            if addr.is_relative() {
                if addr.value() > 0x00FF_FFFF {
                    return Err(Error::InvalidCommand(format!(
                        "address {addr} is too high for a packed command"
                    )));
                }
                let header = (cmd.id() << 24) | addr.value();
                out.extend_from_slice(&header.to_be_bytes());
            } else {
                let header = (cmd.id() << 24) | 0x00FF_FFFE;
                out.extend_from_slice(&header.to_be_bytes());
                out.extend_from_slice(&addr.value().to_be_bytes());
            }
            cmd.write_arguments(&mut out)?;
        }

        Ok(out)
    }

    /// A self-contained Riivolution memory-patch fragment covering every
    /// surviving write command. Other command kinds have no XML
    /// representation and are silently omitted.
    pub fn pack_riivo(&self, patch_name: &str) -> Result<String> {
        let mut out = format!("<patch name='{patch_name}'>\n");
        for cmd in &self.commands {
            if let Command::Write(write) = cmd {
                out.push_str("  ");
                out.push_str(&write.pack_riivo()?);
                out.push('\n');
            }
        }
        out.push_str("</patch>\n");
        Ok(out)
    }

    /// One Gecko code line per supported write command.
    pub fn pack_gecko(&self) -> Result<String> {
        let mut out = String::new();
        for cmd in &self.commands {
            if let Command::Write(write) = cmd {
                if let Some((high, low)) = write.pack_gecko()? {
                    out.push_str(&format!("{high:08X} {low:08X}\n"));
                }
            }
        }
        Ok(out)
    }

    /// Appends the code image as a new text section and applies every
    /// surviving command directly against the DOL's bytes.
    pub fn apply_to_dol(&self, dol: &mut DolFile) -> Result<()> {
        if self.base_addr.is_relative() {
            return Err(Error::InvalidOperation(
                "cannot pack a dynamically linked binary into a DOL".into(),
            ));
        }
        dol.append_text_section(self.base_addr.value(), &self.code)?;
        for cmd in &self.commands {
            cmd.apply_to_dol(dol)?;
        }
        Ok(())
    }
}

fn insert_unique(commands: &mut Vec<Command>, seen: &mut HashSet<Word>, cmd: Command) -> Result<()> {
    if !seen.insert(cmd.address()) {
        return Err(Error::InvalidOperation(format!(
            "duplicate commands for address {:#x}",
            cmd.address().value()
        )));
    }
    commands.push(cmd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::WriteWidth;

    fn empty_layout(base: Word) -> SectionLayout {
        SectionLayout {
            memory: Vec::new(),
            section_bases: HashMap::new(),
            output_start: base,
            output_end: base,
            bss_start: base,
            bss_end: base,
            kamek_start: base,
            kamek_end: base,
            synthetic_externs: Vec::new(),
        }
    }

    #[test]
    fn build_with_no_fixups_or_hooks_yields_empty_code() {
        let base = Word::abs(0x8000_0000u32);
        let kbin = KamekBinary::build(&empty_layout(base), &HashMap::new(), Vec::new(), &[], base).unwrap();
        assert!(kbin.code.is_empty());
        assert!(kbin.commands.is_empty());
    }

    #[test]
    fn pack_starts_with_magic_and_sizes() {
        let base = Word::abs(0x8000_0000u32);
        let kbin = KamekBinary::build(&empty_layout(base), &HashMap::new(), Vec::new(), &[], base).unwrap();
        let packed = kbin.pack().unwrap();
        assert_eq!(&packed[0..8], b"Kamek\0\0\x01");
        assert_eq!(&packed[8..12], &0u32.to_be_bytes());
        assert_eq!(&packed[12..16], &0u32.to_be_bytes());
    }

    #[test]
    fn duplicate_fixup_addresses_are_rejected() {
        let base = Word::abs(0x8000_0000u32);
        let fixups = vec![
            RelocFixup { reloc_type: crate::reloc::R_PPC_ADDR32, source: Word::abs(4u32), dest: Word::abs(8u32) },
            RelocFixup { reloc_type: crate::reloc::R_PPC_ADDR32, source: Word::abs(4u32), dest: Word::abs(12u32) },
        ];
        assert!(KamekBinary::build(&empty_layout(base), &HashMap::new(), fixups, &[], base).is_err());
    }

    #[test]
    fn riivo_export_covers_only_write_commands() {
        let base = Word::abs(0x8000_0000u32);
        let mut kbin = KamekBinary::build(&empty_layout(base), &HashMap::new(), Vec::new(), &[], base).unwrap();
        kbin.commands.push(Command::Write(crate::commands::WriteCommand::new(
            Word::abs(0x8000_0004u32),
            Word::val(0x1234u32),
            WriteWidth::Value16,
            None,
        )));
        let xml = kbin.pack_riivo("test").unwrap();
        assert!(xml.contains("<patch name='test'>"));
        assert!(xml.contains("offset='0x80000004'"));
    }
}
