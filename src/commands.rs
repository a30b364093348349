//! The command set a linked module is ultimately expressed as: branches,
//! conditional and unconditional writes, and raw relocations. Every command
//! either resolves to a single in-place patch at link time ("applied") or
//! survives into the packed output for the runtime loader to apply later
//! ("deferred").

use crate::error::{Error, Result};
use crate::hooks::HookDescriptor;
use crate::reloc::{R_PPC_ADDR16_HA, R_PPC_ADDR16_HI, R_PPC_ADDR16_LO, R_PPC_ADDR32, R_PPC_REL24};
use crate::word::Word;

pub const ID_ADDR32: u32 = 1;
pub const ID_WRITE_POINTER: u32 = ID_ADDR32;
pub const ID_ADDR16_LO: u32 = 4;
pub const ID_ADDR16_HI: u32 = 5;
pub const ID_ADDR16_HA: u32 = 6;
pub const ID_REL24: u32 = 10;
pub const ID_WRITE32: u32 = 32;
pub const ID_WRITE16: u32 = 33;
pub const ID_WRITE8: u32 = 34;
pub const ID_COND_WRITE_POINTER: u32 = 35;
pub const ID_COND_WRITE32: u32 = 36;
pub const ID_COND_WRITE16: u32 = 37;
pub const ID_COND_WRITE8: u32 = 38;
pub const ID_BRANCH: u32 = 64;
pub const ID_BRANCH_LINK: u32 = 65;

/// A view of the statically-linked code image a command's `apply` can read
/// and patch in place.
pub struct CodeImage<'a> {
    pub base_addr: Word,
    pub code: &'a mut Vec<u8>,
    pub symbol_sizes: &'a std::collections::HashMap<Word, u32>,
}

impl<'a> CodeImage<'a> {
    pub fn contains(&self, addr: Word) -> bool {
        addr >= self.base_addr && addr < self.base_addr + self.code.len() as u32
    }

    fn offset(&self, addr: Word) -> usize {
        (addr.value() - self.base_addr.value()) as usize
    }

    pub fn read_u32(&self, addr: Word) -> Result<u32> {
        let off = self.offset(addr);
        let bytes: [u8; 4] = self.code[off..off + 4].try_into().unwrap();
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn write_u32(&mut self, addr: Word, value: u32) -> Result<()> {
        let off = self.offset(addr);
        self.code[off..off + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_u16(&mut self, addr: Word, value: u16) -> Result<()> {
        let off = self.offset(addr);
        self.code[off..off + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn symbol_size(&self, addr: Word) -> Result<u32> {
        self.symbol_sizes
            .get(&addr)
            .copied()
            .ok_or_else(|| Error::InvalidData(format!("no symbol size recorded for {addr}")))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchCommand {
    pub id: u32,
    pub source: Word,
    pub target: Word,
}

impl BranchCommand {
    pub fn new(source: Word, target: Word, link: bool) -> Self {
        BranchCommand {
            id: if link { ID_BRANCH_LINK } else { ID_BRANCH },
            source,
            target,
        }
    }

    fn is_equal_reloc_absolute(&self) -> bool {
        self.source.kind() == self.target.kind() && self.target.is_absolute()
    }

    fn generate_instruction(&self) -> u32 {
        let delta = self.target - self.source;
        let insn: u32 = if self.id == ID_BRANCH_LINK { 0x4800_0001 } else { 0x4800_0000 };
        insn | (delta.value() & 0x03FF_FFFC)
    }

    pub fn apply(&self, img: &mut CodeImage) -> Result<bool> {
        if self.is_equal_reloc_absolute() && img.contains(self.source) {
            let insn = self.generate_instruction();
            img.write_u32(self.source, insn)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn apply_to_dol(&self, dol: &mut crate::dol::DolFile) -> Result<()> {
        self.source.assert_absolute()?;
        self.target.assert_absolute()?;
        let insn = self.generate_instruction();
        dol.write_u32_at(self.source.value(), insn)
    }

    pub fn write_arguments(&self, out: &mut Vec<u8>) -> Result<()> {
        self.target.assert_not_ambiguous()?;
        out.extend_from_slice(&self.target.value().to_be_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PatchExitCommand {
    pub source: Word,
    pub target: Word,
    pub end_address: Word,
}

impl PatchExitCommand {
    pub fn new(source: Word, target: Word) -> Self {
        PatchExitCommand {
            source,
            target,
            end_address: Word::abs(0u32),
        }
    }

    fn is_equal_reloc_absolute(&self) -> bool {
        self.source.kind() == self.target.kind()
            && self.source.kind() == self.end_address.kind()
            && self.target.is_absolute()
    }

    /// Always generates a plain branch, never a branch-and-link, even
    /// though the packed id field is wide enough for either — this matches
    /// the instruction generator every exit patch in the wild actually
    /// produces.
    fn generate_instruction(&self) -> u32 {
        let delta = self.target - self.source;
        0x4800_0000u32 | (delta.value() & 0x03FF_FFFC)
    }

    pub fn apply(&mut self, img: &mut CodeImage) -> Result<bool> {
        let func_size = img.symbol_size(self.source)?;
        if func_size < 4 {
            return Err(Error::InvalidOperation("queried function is too small".into()));
        }
        let func_end = self.source + (func_size - 4);

        if img.read_u32(func_end)? != 0x4E80_0020 {
            return Err(Error::InvalidOperation("function does not end in blr".into()));
        }

        let mut instr_loc = self.source;
        while instr_loc < func_end {
            let insn = img.read_u32(instr_loc)?;
            if insn & 0xFC00_FFFF == 0x4C00_0020 {
                return Err(Error::InvalidOperation(
                    "function contains a return partway through".into(),
                ));
            }
            instr_loc = instr_loc + 4u32;
        }

        self.end_address = func_end;
        if self.is_equal_reloc_absolute() && img.contains(self.source) {
            let insn = self.generate_instruction();
            img.write_u32(self.end_address, insn)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn write_arguments(&self, out: &mut Vec<u8>) -> Result<()> {
        self.end_address.assert_not_ambiguous()?;
        self.target.assert_not_ambiguous()?;
        out.extend_from_slice(&self.end_address.value().to_be_bytes());
        out.extend_from_slice(&self.target.value().to_be_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteWidth {
    Pointer,
    Value32,
    Value16,
    Value8,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteCommand {
    pub id: u32,
    pub address: Word,
    pub value: Word,
    pub width: WriteWidth,
    pub original: Option<Word>,
}

impl WriteCommand {
    pub fn new(address: Word, value: Word, width: WriteWidth, original: Option<Word>) -> Self {
        let id = id_from_write_type(width, original.is_some());
        WriteCommand { id, address, value, width, original }
    }

    /// Writes always defer: an unconditional write patches a read-only
    /// segment or a live DOL at load time, never during static folding.
    pub fn apply(&self, _img: &mut CodeImage) -> Result<bool> {
        Ok(false)
    }

    pub fn write_arguments(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.width == WriteWidth::Pointer {
            self.value.assert_not_ambiguous()?;
        } else {
            self.value.assert_value()?;
        }
        out.extend_from_slice(&self.value.value().to_be_bytes());

        if let Some(original) = self.original {
            original.assert_not_relative()?;
            out.extend_from_slice(&original.value().to_be_bytes());
        }
        Ok(())
    }

    pub fn pack_riivo(&self) -> Result<String> {
        self.address.assert_absolute()?;
        if self.width == WriteWidth::Pointer {
            self.value.assert_absolute()?;
        } else {
            self.value.assert_value()?;
        }

        let digits = match self.width {
            WriteWidth::Value8 => 2,
            WriteWidth::Value16 => 4,
            WriteWidth::Value32 | WriteWidth::Pointer => 8,
        };

        if let Some(original) = self.original {
            original.assert_not_relative()?;
            Ok(format!(
                "<memory offset='0x{:08X}' value='{:0width$X}' original='{:0width$X}' />",
                self.address.value(),
                self.value.value(),
                original.value(),
                width = digits
            ))
        } else {
            Ok(format!(
                "<memory offset='0x{:08X}' value='{:0width$X}' />",
                self.address.value(),
                self.value.value(),
                width = digits
            ))
        }
    }

    /// `None` when this write can't be expressed as a Gecko code: a
    /// conditional write, a MEM2 (`>= 0x9000_0000`) address, or an 8-bit
    /// write (Gecko has no 8-bit memory-write opcode used here).
    pub fn pack_gecko(&self) -> Result<Option<(u32, u32)>> {
        self.address.assert_absolute()?;
        if self.width == WriteWidth::Pointer {
            self.value.assert_absolute()?;
        } else {
            self.value.assert_value()?;
        }

        if self.original.is_some() || self.address.value() >= 0x9000_0000 || self.width == WriteWidth::Value8 {
            return Ok(None);
        }

        let kind_mask: u32 = match self.width {
            WriteWidth::Value16 => 0x0200_0000,
            WriteWidth::Value32 | WriteWidth::Pointer => 0x0400_0000,
            WriteWidth::Value8 => unreachable!(),
        };
        let high = kind_mask | (self.address.value() & 0x01FF_FFFF);
        Ok(Some((high, self.value.value())))
    }

    pub fn apply_to_dol(&self, dol: &mut crate::dol::DolFile) -> Result<()> {
        self.address.assert_absolute()?;
        if self.width == WriteWidth::Pointer {
            self.value.assert_absolute()?;
        } else {
            self.value.assert_value()?;
        }

        if let Some(original) = self.original {
            let current = match self.width {
                WriteWidth::Value8 => dol.read_u8_at(self.address.value())? as u32,
                WriteWidth::Value16 => dol.read_u16_at(self.address.value())? as u32,
                WriteWidth::Value32 | WriteWidth::Pointer => dol.read_u32_at(self.address.value())?,
            };
            if current != original.value() {
                return Ok(());
            }
        }

        match self.width {
            WriteWidth::Value8 => dol.write_u8_at(self.address.value(), self.value.value() as u8)?,
            WriteWidth::Value16 => dol.write_u16_at(self.address.value(), self.value.value() as u16)?,
            WriteWidth::Value32 | WriteWidth::Pointer => {
                dol.write_u32_at(self.address.value(), self.value.value())?
            }
        }
        Ok(())
    }
}

fn id_from_write_type(width: WriteWidth, conditional: bool) -> u32 {
    match (width, conditional) {
        (WriteWidth::Pointer, true) => ID_COND_WRITE_POINTER,
        (WriteWidth::Value32, true) => ID_COND_WRITE32,
        (WriteWidth::Value16, true) => ID_COND_WRITE16,
        (WriteWidth::Value8, true) => ID_COND_WRITE8,
        (WriteWidth::Pointer, false) => ID_WRITE_POINTER,
        (WriteWidth::Value32, false) => ID_WRITE32,
        (WriteWidth::Value16, false) => ID_WRITE16,
        (WriteWidth::Value8, false) => ID_WRITE8,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelocCommand {
    pub id: u32,
    pub source: Word,
    pub target: Word,
}

impl RelocCommand {
    pub fn new(source: Word, target: Word, reloc_type: u32) -> Self {
        RelocCommand { id: reloc_type, source, target }
    }

    pub fn write_arguments(&self, out: &mut Vec<u8>) -> Result<()> {
        self.target.assert_not_ambiguous()?;
        out.extend_from_slice(&self.target.value().to_be_bytes());
        Ok(())
    }

    pub fn apply(&self, img: &mut CodeImage) -> Result<bool> {
        match self.id {
            R_PPC_REL24 => {
                if self.source.kind() == self.target.kind() && !self.target.is_value() {
                    let delta = self.target - self.source;
                    let insn = (delta.value() & 0x03FF_FFFC) | (img.read_u32(self.source)? & 0xFC00_0003);
                    img.write_u32(self.source, insn)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            R_PPC_ADDR32 => {
                if self.target.is_absolute() {
                    img.write_u32(self.source, self.target.value())?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            R_PPC_ADDR16_LO => {
                if self.target.is_absolute() {
                    img.write_u16(self.source, (self.target.value() & 0xFFFF) as u16)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            R_PPC_ADDR16_HI => {
                if self.target.is_absolute() {
                    img.write_u16(self.source, ((self.target.value() >> 16) & 0xFFFF) as u16)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            R_PPC_ADDR16_HA => {
                if self.target.is_absolute() {
                    img.write_u16(self.source, ha(self.target.value()))?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => Err(Error::NotImplemented("unrecognized relocation type".into())),
        }
    }

    pub fn apply_to_dol(&self, dol: &mut crate::dol::DolFile) -> Result<()> {
        self.source.assert_absolute()?;
        self.target.assert_absolute()?;

        match self.id {
            R_PPC_REL24 => {
                let delta = self.target - self.source;
                let insn = (delta.value() & 0x03FF_FFFC) | (dol.read_u32_at(self.source.value())? & 0xFC00_0003);
                dol.write_u32_at(self.source.value(), insn)
            }
            R_PPC_ADDR32 => dol.write_u32_at(self.source.value(), self.target.value()),
            // Writes a full word over what should be a 16-bit half, clobbering
            // the following two bytes. Inherited from the tool this preserves
            // interchangeable output with; not "fixed" here.
            R_PPC_ADDR16_LO => {
                log::warn!("Addr16Lo DOL patch at {:#x} overwrites 32 bits, not 16", self.source.value());
                dol.write_u32_at(self.source.value(), self.target.value() & 0xFFFF)
            }
            R_PPC_ADDR16_HI => {
                log::warn!("Addr16Hi DOL patch at {:#x} overwrites 32 bits, not 16", self.source.value());
                dol.write_u32_at(self.source.value(), (self.target.value() >> 16) & 0xFFFF)
            }
            R_PPC_ADDR16_HA => {
                log::warn!("Addr16Ha DOL patch at {:#x} overwrites 32 bits, not 16", self.source.value());
                dol.write_u32_at(self.source.value(), ha(self.target.value()) as u32)
            }
            _ => Err(Error::NotImplemented("unrecognized relocation type".into())),
        }
    }
}

fn ha(value: u32) -> u16 {
    let hi = (value >> 16) & 0xFFFF;
    if (hi & 0x8000) != 0 {
        ((hi + 1) & 0xFFFF) as u16
    } else {
        hi as u16
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Command {
    Branch(BranchCommand),
    PatchExit(PatchExitCommand),
    Write(WriteCommand),
    Reloc(RelocCommand),
}

impl Command {
    pub fn id(&self) -> u32 {
        match self {
            Command::Branch(c) => c.id,
            Command::PatchExit(_) => ID_BRANCH,
            Command::Write(c) => c.id,
            Command::Reloc(c) => c.id,
        }
    }

    pub fn address(&self) -> Word {
        match self {
            Command::Branch(c) => c.source,
            Command::PatchExit(c) => c.source,
            Command::Write(c) => c.address,
            Command::Reloc(c) => c.source,
        }
    }

    pub fn apply(&mut self, img: &mut CodeImage) -> Result<bool> {
        match self {
            Command::Branch(c) => c.apply(img),
            Command::PatchExit(c) => c.apply(img),
            Command::Write(c) => c.apply(img),
            Command::Reloc(c) => c.apply(img),
        }
    }

    pub fn write_arguments(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Command::Branch(c) => c.write_arguments(out),
            Command::PatchExit(c) => c.write_arguments(out),
            Command::Write(c) => c.write_arguments(out),
            Command::Reloc(c) => c.write_arguments(out),
        }
    }

    pub fn apply_to_dol(&self, dol: &mut crate::dol::DolFile) -> Result<()> {
        match self {
            Command::Branch(c) => c.apply_to_dol(dol),
            Command::PatchExit(_) => Err(Error::NotImplemented(
                "exit patches cannot be applied directly to a DOL".into(),
            )),
            Command::Write(c) => c.apply_to_dol(dol),
            Command::Reloc(c) => c.apply_to_dol(dol),
        }
    }
}

/// Turns one hook descriptor into the command(s) it represents.
///
/// Hook type numbering is this crate's own (the compiler-side macros that
/// plant `_kHook*` symbols agree on it); unknown values are rejected.
pub mod hook_kind {
    pub const BRANCH: u32 = 0;
    pub const BRANCH_LINK: u32 = 1;
    pub const PATCH_EXIT: u32 = 2;
    pub const WRITE_8: u32 = 3;
    pub const WRITE_16: u32 = 4;
    pub const WRITE_32: u32 = 5;
    pub const WRITE_POINTER: u32 = 6;
    pub const COND_WRITE_8: u32 = 7;
    pub const COND_WRITE_16: u32 = 8;
    pub const COND_WRITE_32: u32 = 9;
    pub const COND_WRITE_POINTER: u32 = 10;
}

pub fn dispatch_hook(desc: &HookDescriptor) -> Result<Command> {
    use hook_kind::*;

    let need = |n: usize| -> Result<()> {
        if desc.args.len() != n {
            Err(Error::InvalidData(format!(
                "hook type {} expects {n} arguments, got {}",
                desc.hook_type,
                desc.args.len()
            )))
        } else {
            Ok(())
        }
    };

    match desc.hook_type {
        BRANCH => {
            need(2)?;
            Ok(Command::Branch(BranchCommand::new(desc.args[0], desc.args[1], false)))
        }
        BRANCH_LINK => {
            need(2)?;
            Ok(Command::Branch(BranchCommand::new(desc.args[0], desc.args[1], true)))
        }
        PATCH_EXIT => {
            need(2)?;
            Ok(Command::PatchExit(PatchExitCommand::new(desc.args[0], desc.args[1])))
        }
        WRITE_8 => {
            need(2)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Value8, None)))
        }
        WRITE_16 => {
            need(2)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Value16, None)))
        }
        WRITE_32 => {
            need(2)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Value32, None)))
        }
        WRITE_POINTER => {
            need(2)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Pointer, None)))
        }
        COND_WRITE_8 => {
            need(3)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Value8, Some(desc.args[2]))))
        }
        COND_WRITE_16 => {
            need(3)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Value16, Some(desc.args[2]))))
        }
        COND_WRITE_32 => {
            need(3)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Value32, Some(desc.args[2]))))
        }
        COND_WRITE_POINTER => {
            need(3)?;
            Ok(Command::Write(WriteCommand::new(desc.args[0], desc.args[1], WriteWidth::Pointer, Some(desc.args[2]))))
        }
        other => Err(Error::InvalidOperation(format!("unknown hook type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_applies_in_range() {
        let mut code = vec![0u8; 16];
        let symbol_sizes = std::collections::HashMap::new();
        let base = Word::abs(0x8000_0000u32);
        let mut img = CodeImage { base_addr: base, code: &mut code, symbol_sizes: &symbol_sizes };

        let cmd = BranchCommand::new(Word::abs(0x8000_0000u32), Word::abs(0x8000_0010u32), false);
        assert!(cmd.apply(&mut img).unwrap());
        assert_eq!(img.read_u32(Word::abs(0x8000_0000u32)).unwrap() & 0xFC00_0003, 0x4800_0000);
    }

    #[test]
    fn branch_defers_across_kinds() {
        let mut code = vec![0u8; 16];
        let symbol_sizes = std::collections::HashMap::new();
        let base = Word::abs(0x8000_0000u32);
        let mut img = CodeImage { base_addr: base, code: &mut code, symbol_sizes: &symbol_sizes };

        let cmd = BranchCommand::new(Word::rel(0u32), Word::abs(0x8000_0010u32), false);
        assert!(!cmd.apply(&mut img).unwrap());
    }

    #[test]
    fn write_command_always_defers() {
        let mut code = vec![0u8; 4];
        let symbol_sizes = std::collections::HashMap::new();
        let mut img = CodeImage { base_addr: Word::abs(0u32), code: &mut code, symbol_sizes: &symbol_sizes };
        let cmd = WriteCommand::new(Word::abs(0u32), Word::val(5u32), WriteWidth::Value32, None);
        assert!(!cmd.apply(&mut img).unwrap());
    }

    #[test]
    fn gecko_skips_conditional_and_mem2_and_byte_writes() {
        let conditional = WriteCommand::new(Word::abs(4u32), Word::val(1u32), WriteWidth::Value32, Some(Word::val(0u32)));
        assert!(conditional.pack_gecko().unwrap().is_none());

        let mem2 = WriteCommand::new(Word::abs(0x9000_0004u32), Word::val(1u32), WriteWidth::Value32, None);
        assert!(mem2.pack_gecko().unwrap().is_none());

        let byte = WriteCommand::new(Word::abs(4u32), Word::val(1u32), WriteWidth::Value8, None);
        assert!(byte.pack_gecko().unwrap().is_none());

        let ok = WriteCommand::new(Word::abs(4u32), Word::val(1u32), WriteWidth::Value32, None);
        assert!(ok.pack_gecko().unwrap().is_some());
    }

    #[test]
    fn ha_rounds_up_on_sign_bit() {
        assert_eq!(ha(0x8000_8000), 0x8001);
        assert_eq!(ha(0x8000_7FFF), 0x8000);
    }

    #[test]
    fn hook_dispatch_rejects_unknown_type() {
        let desc = HookDescriptor { hook_type: 9999, args: vec![] };
        assert!(dispatch_hook(&desc).is_err());
    }
}
