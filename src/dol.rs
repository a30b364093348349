//! Reads and writes GameCube/Wii DOL executables: the container format a
//! statically-linked patch module can be appended to directly, bypassing
//! the Kamek binary's own runtime loader.

use scroll::{Pread, Pwrite, BE};

use crate::error::{Error, Result};

const HEADER_SIZE: usize = 0x100;
const TEXT_SECTION_COUNT: usize = 7;
const DATA_SECTION_COUNT: usize = 11;

#[derive(Debug, Clone, Copy, Default)]
struct SectionSlot {
    offset: u32,
    address: u32,
    size: u32,
}

/// An in-memory DOL image: the section table plus every declared section's
/// bytes, addressable the way the game's loader sees them (by loaded
/// address, not file offset).
#[derive(Debug, Clone)]
pub struct DolFile {
    text: [SectionSlot; TEXT_SECTION_COUNT],
    data: [SectionSlot; DATA_SECTION_COUNT],
    bss_address: u32,
    bss_size: u32,
    entry_point: u32,
    payload: Vec<u8>,
}

impl DolFile {
    pub fn parse(bytes: &[u8]) -> Result<DolFile> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidData("DOL file shorter than its header".into()));
        }

        let mut text = [SectionSlot::default(); TEXT_SECTION_COUNT];
        let mut data = [SectionSlot::default(); DATA_SECTION_COUNT];

        for (i, slot) in text.iter_mut().enumerate() {
            slot.offset = bytes.pread_with(i * 4, BE)?;
        }
        for (i, slot) in data.iter_mut().enumerate() {
            slot.offset = bytes.pread_with(0x1C + i * 4, BE)?;
        }
        for (i, slot) in text.iter_mut().enumerate() {
            slot.address = bytes.pread_with(0x48 + i * 4, BE)?;
        }
        for (i, slot) in data.iter_mut().enumerate() {
            slot.address = bytes.pread_with(0x64 + i * 4, BE)?;
        }
        for (i, slot) in text.iter_mut().enumerate() {
            slot.size = bytes.pread_with(0x90 + i * 4, BE)?;
        }
        for (i, slot) in data.iter_mut().enumerate() {
            slot.size = bytes.pread_with(0xAC + i * 4, BE)?;
        }

        let bss_address: u32 = bytes.pread_with(0xD8, BE)?;
        let bss_size: u32 = bytes.pread_with(0xDC, BE)?;
        let entry_point: u32 = bytes.pread_with(0xE0, BE)?;

        let mut file_end = HEADER_SIZE;
        for slot in text.iter().chain(data.iter()) {
            if slot.size > 0 {
                file_end = file_end.max(slot.offset as usize + slot.size as usize);
            }
        }

        let mut payload = vec![0u8; file_end - HEADER_SIZE];
        for slot in text.iter().chain(data.iter()) {
            if slot.size > 0 {
                let src_start = slot.offset as usize;
                let dst_start = src_start - HEADER_SIZE;
                let len = slot.size as usize;
                payload[dst_start..dst_start + len].copy_from_slice(&bytes[src_start..src_start + len]);
            }
        }

        Ok(DolFile { text, data, bss_address, bss_size, entry_point, payload })
    }

    pub fn bss_address(&self) -> u32 {
        self.bss_address
    }

    pub fn bss_size(&self) -> u32 {
        self.bss_size
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// Appends `data` as a new text section loaded at `address`. Fails if
    /// every text slot is already occupied.
    pub fn append_text_section(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let slot = self
            .text
            .iter_mut()
            .find(|s| s.size == 0)
            .ok_or_else(|| Error::InvalidOperation("DOL has no free text section slots".into()))?;

        let offset = HEADER_SIZE + self.payload.len();
        slot.offset = offset as u32;
        slot.address = address;
        slot.size = data.len() as u32;
        self.payload.extend_from_slice(data);
        Ok(())
    }

    fn slot_for_address(&self, address: u32) -> Option<&SectionSlot> {
        self.text
            .iter()
            .chain(self.data.iter())
            .find(|s| s.size > 0 && address >= s.address && address < s.address + s.size)
    }

    fn payload_offset(&self, address: u32) -> Result<usize> {
        let slot = self.slot_for_address(address).ok_or_else(|| {
            Error::InvalidOperation(format!("address {address:#x} is not inside any DOL section"))
        })?;
        Ok((slot.offset as usize - HEADER_SIZE) + (address - slot.address) as usize)
    }

    pub fn read_u8_at(&self, address: u32) -> Result<u8> {
        let off = self.payload_offset(address)?;
        Ok(self.payload.pread_with(off, BE)?)
    }

    pub fn read_u16_at(&self, address: u32) -> Result<u16> {
        let off = self.payload_offset(address)?;
        Ok(self.payload.pread_with(off, BE)?)
    }

    pub fn read_u32_at(&self, address: u32) -> Result<u32> {
        let off = self.payload_offset(address)?;
        Ok(self.payload.pread_with(off, BE)?)
    }

    pub fn write_u8_at(&mut self, address: u32, value: u8) -> Result<()> {
        let off = self.payload_offset(address)?;
        self.payload.pwrite_with(value, off, BE)?;
        Ok(())
    }

    pub fn write_u16_at(&mut self, address: u32, value: u16) -> Result<()> {
        let off = self.payload_offset(address)?;
        self.payload.pwrite_with(value, off, BE)?;
        Ok(())
    }

    pub fn write_u32_at(&mut self, address: u32, value: u32) -> Result<()> {
        let off = self.payload_offset(address)?;
        self.payload.pwrite_with(value, off, BE)?;
        Ok(())
    }

    pub fn save(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE + self.payload.len()];

        for (i, slot) in self.text.iter().enumerate() {
            out.pwrite_with(slot.offset, i * 4, BE).unwrap();
        }
        for (i, slot) in self.data.iter().enumerate() {
            out.pwrite_with(slot.offset, 0x1C + i * 4, BE).unwrap();
        }
        for (i, slot) in self.text.iter().enumerate() {
            out.pwrite_with(slot.address, 0x48 + i * 4, BE).unwrap();
        }
        for (i, slot) in self.data.iter().enumerate() {
            out.pwrite_with(slot.address, 0x64 + i * 4, BE).unwrap();
        }
        for (i, slot) in self.text.iter().enumerate() {
            out.pwrite_with(slot.size, 0x90 + i * 4, BE).unwrap();
        }
        for (i, slot) in self.data.iter().enumerate() {
            out.pwrite_with(slot.size, 0xAC + i * 4, BE).unwrap();
        }
        out.pwrite_with(self.bss_address, 0xD8, BE).unwrap();
        out.pwrite_with(self.bss_size, 0xDC, BE).unwrap();
        out.pwrite_with(self.entry_point, 0xE0, BE).unwrap();

        out[HEADER_SIZE..].copy_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_dol() -> DolFile {
        let bytes = vec![0u8; HEADER_SIZE];
        DolFile::parse(&bytes).unwrap()
    }

    #[test]
    fn append_then_read_back_round_trips() {
        let mut dol = empty_dol();
        dol.append_text_section(0x8000_1000, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(dol.read_u32_at(0x8000_1000).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn write_outside_any_section_is_invalid_operation() {
        let mut dol = empty_dol();
        assert!(dol.write_u32_at(0x8000_0000, 0).is_err());
    }

    #[test]
    fn save_then_reparse_round_trips() {
        let mut dol = empty_dol();
        dol.append_text_section(0x8000_2000, &[1, 2, 3, 4]).unwrap();
        let bytes = dol.save();
        let reparsed = DolFile::parse(&bytes).unwrap();
        assert_eq!(reparsed.read_u32_at(0x8000_2000).unwrap(), 0x0102_0304);
    }

    #[test]
    fn appending_past_all_seven_text_slots_fails() {
        let mut dol = empty_dol();
        for i in 0..7 {
            dol.append_text_section(0x8000_0000 + i * 0x10, &[0, 0, 0, 0]).unwrap();
        }
        assert!(dol.append_text_section(0x8010_0000, &[0, 0, 0, 0]).is_err());
    }
}
