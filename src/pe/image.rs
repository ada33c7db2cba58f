//! Raw PE32+ image buffer manipulation.
//!
//! `PeImage` owns a flat `Vec<u8>` and exposes the header fields needed by the
//! rest of the pipeline through direct offset arithmetic, mirroring how the
//! original tool reinterprets a mapped image through raw structure pointers
//! (`original_source/include/pe/image.hpp`). Rust has no safe equivalent of that
//! pointer cast, so every accessor here reads or writes an explicit byte range
//! instead. It is slower than a `#[repr(C)]` overlay, but it tolerates a
//! buffer whose header fields a protector has deliberately mangled, which a
//! typed overlay would refuse to parse at all.

use crate::consts::{data_directory, DOS_SIGNATURE, NT_SIGNATURE, OPTIONAL_HDR64_MAGIC};
use crate::error::DumperError;
use crate::pe::import_directory::ImportDirectory;
use crate::pe::section_table::{SectionTable, SECTION_HEADER_SIZE};

const E_LFANEW_OFFSET: usize = 0x3C;
const FILE_HEADER_SIZE: usize = 20;
const DATA_DIRECTORY_BASE: usize = 112;

pub struct PeImage {
    buffer: Vec<u8>,
    section_table: SectionTable,
    import_directory: ImportDirectory,
}

impl PeImage {
    /// Parses a buffer already captured from disk or from a live process's
    /// memory. Fails if the DOS/NT signatures don't check out or the image
    /// isn't PE32+.
    pub fn from_bytes(buffer: Vec<u8>) -> Result<Self, DumperError> {
        let mut image = Self {
            buffer,
            section_table: SectionTable::empty(),
            import_directory: ImportDirectory::empty(),
        };
        image.validate()?;
        image.refresh();
        Ok(image)
    }

    fn validate(&self) -> Result<(), DumperError> {
        if self.buffer.len() < 0x40 {
            return Err(DumperError::Malformed("buffer shorter than DOS header".into()));
        }
        let dos_sig = u16::from_le_bytes(self.buffer[0..2].try_into().unwrap());
        if dos_sig != DOS_SIGNATURE {
            return Err(DumperError::Malformed("missing MZ signature".into()));
        }
        let e_lfanew = self.e_lfanew();
        if e_lfanew + 4 + FILE_HEADER_SIZE + 2 > self.buffer.len() {
            return Err(DumperError::Malformed("e_lfanew out of bounds".into()));
        }
        let nt_sig = u32::from_le_bytes(
            self.buffer[e_lfanew..e_lfanew + 4].try_into().unwrap(),
        );
        if nt_sig != NT_SIGNATURE {
            return Err(DumperError::Malformed("missing PE signature".into()));
        }
        let magic = u16::from_le_bytes(
            self.buffer[self.optional_header_offset()..self.optional_header_offset() + 2]
                .try_into()
                .unwrap(),
        );
        if magic != OPTIONAL_HDR64_MAGIC {
            return Err(DumperError::Malformed(
                "only PE32+ (64-bit) images are supported".into(),
            ));
        }
        Ok(())
    }

    /// Re-derives the section table and import directory from the current
    /// buffer contents and recomputes the checksum. Call after any mutation.
    pub fn refresh(&mut self) {
        self.section_table = SectionTable::parse(self);
        self.section_table.write_back(&mut self.buffer);
        self.set_number_of_sections(self.section_table.count());
        self.import_directory = ImportDirectory::parse(self);
        self.write_checksum();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn section_table(&self) -> &SectionTable {
        &self.section_table
    }

    pub fn import_directory(&self) -> &ImportDirectory {
        &self.import_directory
    }

    pub fn import_directory_mut(&mut self) -> &mut ImportDirectory {
        &mut self.import_directory
    }

    // ---- header field access -------------------------------------------------

    fn e_lfanew(&self) -> usize {
        u32::from_le_bytes(self.buffer[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].try_into().unwrap())
            as usize
    }

    fn file_header_offset(&self) -> usize {
        self.e_lfanew() + 4
    }

    fn optional_header_offset(&self) -> usize {
        self.file_header_offset() + FILE_HEADER_SIZE
    }

    pub fn section_table_offset(&self) -> usize {
        self.optional_header_offset() + self.size_of_optional_header() as usize
    }

    fn size_of_optional_header(&self) -> u16 {
        let o = self.file_header_offset() + 16;
        u16::from_le_bytes(self.buffer[o..o + 2].try_into().unwrap())
    }

    pub fn number_of_sections(&self) -> u16 {
        let o = self.file_header_offset() + 2;
        u16::from_le_bytes(self.buffer[o..o + 2].try_into().unwrap())
    }

    pub fn set_number_of_sections(&mut self, count: u16) {
        let o = self.file_header_offset() + 2;
        self.buffer[o..o + 2].copy_from_slice(&count.to_le_bytes());
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.buffer[offset..offset + 2].try_into().unwrap())
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.buffer[offset..offset + 4].try_into().unwrap())
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.buffer[offset..offset + 8].try_into().unwrap())
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn image_base(&self) -> u64 {
        self.read_u64(self.optional_header_offset() + 24)
    }

    pub fn set_image_base(&mut self, value: u64) {
        let o = self.optional_header_offset() + 24;
        self.write_u64(o, value);
    }

    pub fn section_alignment(&self) -> u32 {
        self.read_u32(self.optional_header_offset() + 32)
    }

    pub fn file_alignment(&self) -> u32 {
        self.read_u32(self.optional_header_offset() + 36)
    }

    pub fn entry_point_rva(&self) -> u32 {
        self.read_u32(self.optional_header_offset() + 16)
    }

    pub fn set_entry_point_rva(&mut self, rva: u32) {
        let o = self.optional_header_offset() + 16;
        self.write_u32(o, rva);
    }

    pub fn size_of_image(&self) -> u32 {
        self.read_u32(self.optional_header_offset() + 56)
    }

    pub fn set_size_of_image(&mut self, value: u32) {
        let o = self.optional_header_offset() + 56;
        self.write_u32(o, value);
    }

    pub fn size_of_headers(&self) -> u32 {
        self.read_u32(self.optional_header_offset() + 60)
    }

    pub fn set_size_of_headers(&mut self, value: u32) {
        let o = self.optional_header_offset() + 60;
        self.write_u32(o, value);
    }

    pub fn size_of_code(&self) -> u32 {
        self.read_u32(self.optional_header_offset() + 4)
    }

    pub fn set_size_of_code(&mut self, value: u32) {
        let o = self.optional_header_offset() + 4;
        self.write_u32(o, value);
    }

    fn checksum_offset(&self) -> usize {
        self.optional_header_offset() + 64
    }

    pub fn checksum(&self) -> u32 {
        self.read_u32(self.checksum_offset())
    }

    pub fn number_of_rva_and_sizes(&self) -> u32 {
        self.read_u32(self.optional_header_offset() + 108)
    }

    pub fn data_directory(&self, index: usize) -> (u32, u32) {
        if index as u32 >= self.number_of_rva_and_sizes() {
            return (0, 0);
        }
        let o = self.optional_header_offset() + DATA_DIRECTORY_BASE + index * 8;
        (self.read_u32(o), self.read_u32(o + 4))
    }

    pub fn set_data_directory(&mut self, index: usize, rva: u32, size: u32) {
        let o = self.optional_header_offset() + DATA_DIRECTORY_BASE + index * 8;
        self.write_u32(o, rva);
        self.write_u32(o + 4, size);
    }

    pub fn import_directory_entry(&self) -> (u32, u32) {
        self.data_directory(data_directory::IMPORT)
    }

    pub fn iat_directory_entry(&self) -> (u32, u32) {
        self.data_directory(data_directory::IAT)
    }

    pub fn exception_directory_entry(&self) -> (u32, u32) {
        self.data_directory(data_directory::EXCEPTION)
    }

    pub fn base_relocation_directory_entry(&self) -> (u32, u32) {
        self.data_directory(data_directory::BASE_RELOCATION)
    }

    // ---- RVA <-> file offset --------------------------------------------------

    /// Maps a relative virtual address to a file offset by linearly scanning
    /// the section table, as the loader does.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize, DumperError> {
        for section in self.section_table.iter() {
            let start = section.virtual_address;
            let end = start + section.virtual_size.max(section.size_of_raw_data);
            if rva >= start && rva < end {
                return Ok((rva - start + section.pointer_to_raw_data) as usize);
            }
        }
        if (rva as usize) < self.section_table_offset() {
            return Ok(rva as usize);
        }
        Err(DumperError::Malformed(format!(
            "rva {rva:#x} does not fall within any section"
        )))
    }

    pub fn offset_to_rva(&self, offset: usize) -> Result<u32, DumperError> {
        for section in self.section_table.iter() {
            let start = section.pointer_to_raw_data as usize;
            let end = start + section.size_of_raw_data as usize;
            if offset >= start && offset < end {
                return Ok((offset - start) as u32 + section.virtual_address);
            }
        }
        if offset < self.section_table_offset() {
            return Ok(offset as u32);
        }
        Err(DumperError::Malformed(format!(
            "file offset {offset:#x} does not fall within any section"
        )))
    }

    pub fn read_rva_slice(&self, rva: u32, len: usize) -> Result<&[u8], DumperError> {
        let offset = self.rva_to_offset(rva)?;
        self.buffer
            .get(offset..offset + len)
            .ok_or_else(|| DumperError::Malformed(format!("rva {rva:#x} read out of bounds")))
    }

    pub fn read_rva_u64(&self, rva: u32) -> Result<u64, DumperError> {
        let offset = self.rva_to_offset(rva)?;
        if offset + 8 > self.buffer.len() {
            return Err(DumperError::Malformed(format!("rva {rva:#x} read out of bounds")));
        }
        Ok(self.read_u64(offset))
    }

    // ---- section mutation -------------------------------------------------

    /// Appends a new section carrying `data`, padded to a `FileAlignment`
    /// boundary, placed immediately after the current last section.
    ///
    /// Rejects the append if there isn't enough slack between the section
    /// header array and the first section's raw data to fit one more
    /// descriptor (SPEC_FULL §4.1, "Edge cases").
    pub fn append_section(
        &mut self,
        name: &str,
        characteristics: u32,
        data: &[u8],
    ) -> Result<(), DumperError> {
        let section_alignment = self.section_alignment();
        let file_alignment = self.file_alignment();
        if section_alignment == 0 || file_alignment == 0 {
            return Err(DumperError::AlignmentUnset);
        }

        let headroom_limit = self
            .section_table
            .first()
            .map(|s| s.pointer_to_raw_data as usize)
            .unwrap_or(self.section_table_offset());
        if self.section_table.end_offset() + 40 > headroom_limit {
            return Err(DumperError::Malformed(
                "no headroom left in the header region to append a section".into(),
            ));
        }

        let (new_va, new_ptr) = match self.section_table.last() {
            Some(last) => (
                align_up(last.virtual_address + last.virtual_size, section_alignment),
                align_up(last.pointer_to_raw_data + last.size_of_raw_data, file_alignment),
            ),
            None => (
                align_up(self.size_of_headers(), section_alignment),
                align_up(self.size_of_headers(), file_alignment),
            ),
        };

        let aligned_len = align_up(data.len() as u32, file_alignment);
        if self.buffer.len() < new_ptr as usize {
            self.buffer.resize(new_ptr as usize, 0);
        }
        let mut padded = data.to_vec();
        padded.resize(aligned_len as usize, 0);
        self.buffer.truncate(new_ptr as usize);
        self.buffer.extend_from_slice(&padded);

        let header = SectionTable::new_header(
            name,
            characteristics,
            new_va,
            new_ptr,
            data.len() as u32,
            aligned_len,
        );
        self.section_table.append(header);
        self.section_table.write_back(&mut self.buffer);
        self.set_number_of_sections(self.section_table.count());

        let new_size_of_image = align_up(new_va + aligned_len.max(data.len() as u32), section_alignment);
        self.set_size_of_image(new_size_of_image);
        let new_headers_size = self.size_of_headers() + 40;
        self.set_size_of_headers(new_headers_size);
        if characteristics & crate::consts::section_characteristics::CNT_CODE != 0 {
            self.set_size_of_code(self.size_of_code() + data.len() as u32);
        }

        self.refresh();
        Ok(())
    }

    /// Grows an existing section's raw and virtual size to cover `new_len`
    /// bytes of `data`, rewriting its payload in place. Used when the
    /// harvester discovers a section is larger live than on disk.
    pub fn extend_section(&mut self, index: usize, data: &[u8]) -> Result<(), DumperError> {
        let file_alignment = self.file_alignment().max(1);
        let header = *self
            .section_table
            .at(index as u16)
            .ok_or_else(|| DumperError::SectionNotFound(format!("index {index}")))?;

        let aligned_len = align_up(data.len() as u32, file_alignment);
        let start = header.pointer_to_raw_data as usize;
        let old_end = start + header.size_of_raw_data as usize;
        let new_end = start + aligned_len as usize;

        let mut padded = data.to_vec();
        padded.resize(aligned_len as usize, 0);

        if new_end >= old_end {
            if self.buffer.len() < start {
                self.buffer.resize(start, 0);
            }
            let tail = self.buffer.split_off(old_end.min(self.buffer.len()));
            self.buffer.truncate(start);
            self.buffer.extend_from_slice(&padded);
            self.buffer.extend_from_slice(&tail);
        } else {
            self.buffer[start..start + padded.len()].copy_from_slice(&padded);
        }

        let mut updated = header;
        updated.virtual_size = data.len() as u32;
        updated.size_of_raw_data = aligned_len;
        self.write_section_fields(index, updated);

        // Later sections' raw data physically shifted by the size delta.
        let shift = aligned_len as i64 - header.size_of_raw_data as i64;
        if shift != 0 {
            for i in (index + 1)..self.section_table.count() as usize {
                if let Some(mut later) = self.section_table.at(i as u16).copied() {
                    later.pointer_to_raw_data = (later.pointer_to_raw_data as i64 + shift) as u32;
                    self.write_section_fields(i, later);
                }
            }
        }

        self.refresh();
        Ok(())
    }

    fn write_section_fields(&mut self, index: usize, header: crate::pe::section_table::SectionHeader) {
        let offset = self.section_table_offset() + index * 40;
        self.buffer[offset + 8..offset + 12].copy_from_slice(&header.virtual_size.to_le_bytes());
        self.buffer[offset + 16..offset + 20].copy_from_slice(&header.size_of_raw_data.to_le_bytes());
        self.buffer[offset + 20..offset + 24].copy_from_slice(&header.pointer_to_raw_data.to_le_bytes());
    }

    pub fn remove_section(&mut self, index: usize) -> Result<(), DumperError> {
        if index as u16 >= self.section_table.count() {
            return Err(DumperError::SectionNotFound(format!("index {index}")));
        }
        let old_count = self.section_table.count() as usize;
        self.section_table.remove(index);
        self.section_table.write_back(&mut self.buffer);
        self.set_number_of_sections(self.section_table.count());
        let vacated = self.section_table.table_offset() + (old_count - 1) * SECTION_HEADER_SIZE;
        self.buffer[vacated..vacated + SECTION_HEADER_SIZE].fill(0);
        self.refresh();
        Ok(())
    }

    // ---- checksum --------------------------------------------------------

    /// Microsoft's PE checksum: a 16-bit wraparound sum over the whole buffer
    /// (excluding the `CheckSum` field itself, which is treated as zero),
    /// folded, with the file length added, then bitwise inverted.
    pub fn compute_checksum(&self) -> u32 {
        let checksum_field = self.checksum_offset();
        let len = self.buffer.len();
        let mut sum: u64 = 0;
        let mut i = 0;
        while i + 1 < len {
            let word = if i == checksum_field || i == checksum_field + 2 {
                0u64
            } else {
                u16::from_le_bytes([self.buffer[i], self.buffer[i + 1]]) as u64
            };
            sum += word;
            if sum > 0xFFFF {
                sum = (sum & 0xFFFF) + (sum >> 16);
            }
            i += 2;
        }
        if i < len {
            sum += (self.buffer[i] as u64) << 8;
            if sum > 0xFFFF {
                sum = (sum & 0xFFFF) + (sum >> 16);
            }
        }
        sum = (sum & 0xFFFF) + (sum >> 16);
        sum += len as u64;
        !(sum as u32)
    }

    pub fn write_checksum(&mut self) {
        let value = self.compute_checksum();
        let o = self.checksum_offset();
        self.write_u32(o, value);
    }

    // ---- rebase ------------------------------------------------------------

    /// Walks the base relocation directory and rewrites every fixup from
    /// `old_base` to `new_base`, then updates `ImageBase` itself.
    ///
    /// Applying `rebase(b, a)` after `rebase(a, b)` restores the original
    /// bytes exactly: each fixup is adjusted by a signed delta that cancels
    /// out under wrapping arithmetic (SPEC_FULL §8, invariant on rebase
    /// round-trips).
    pub fn rebase(&mut self, old_base: u64, new_base: u64) -> Result<(), DumperError> {
        let delta = new_base.wrapping_sub(old_base) as i64;
        let (reloc_rva, reloc_size) = self.base_relocation_directory_entry();
        if reloc_rva != 0 && reloc_size != 0 {
            let mut block_rva = reloc_rva;
            let end_rva = reloc_rva + reloc_size;
            while block_rva < end_rva {
                let block_offset = self.rva_to_offset(block_rva)?;
                if block_offset + 8 > self.buffer.len() {
                    break;
                }
                let page_rva = self.read_u32(block_offset);
                let block_size = self.read_u32(block_offset + 4);
                if block_size < 8 || page_rva == 0 {
                    break;
                }
                let entry_count = (block_size as usize - 8) / 2;
                let mut entry_idx = 0;
                while entry_idx < entry_count {
                    let entry_offset = block_offset + 8 + entry_idx * 2;
                    let entry = self.read_u16(entry_offset);
                    let reloc_type = entry >> 12;
                    let page_offset = (entry & 0x0FFF) as u32;
                    let target_rva = page_rva + page_offset;
                    self.apply_relocation(reloc_type, target_rva, delta)?;
                    entry_idx += 1;
                }
                block_rva += block_size;
            }
        }
        self.set_image_base(new_base);
        self.refresh();
        Ok(())
    }

    fn apply_relocation(&mut self, reloc_type: u16, target_rva: u32, delta: i64) -> Result<(), DumperError> {
        use crate::consts::relocation_type::*;
        match reloc_type {
            ABSOLUTE => {}
            HIGHLOW => {
                let offset = self.rva_to_offset(target_rva)?;
                let value = self.read_u32(offset);
                self.write_u32(offset, value.wrapping_add(delta as i32 as u32));
            }
            DIR64 => {
                let offset = self.rva_to_offset(target_rva)?;
                let value = self.read_u64(offset);
                self.write_u64(offset, value.wrapping_add(delta as u64));
            }
            HIGH => {
                let offset = self.rva_to_offset(target_rva)?;
                let value = self.read_u16(offset);
                let adjust = ((delta >> 16) & 0xFFFF) as u16;
                self.write_u16(offset, value.wrapping_add(adjust));
            }
            LOW => {
                let offset = self.rva_to_offset(target_rva)?;
                let value = self.read_u16(offset);
                let adjust = (delta & 0xFFFF) as u16;
                self.write_u16(offset, value.wrapping_add(adjust));
            }
            HIGHADJ => {
                // Rare in modern PE32+ images; the low 16 bits of the addend
                // live in the following relocation entry rather than at the
                // target. Best-effort: apply the high-word delta only.
                let offset = self.rva_to_offset(target_rva)?;
                let value = self.read_u16(offset);
                let adjust = ((delta >> 16) & 0xFFFF) as u16;
                self.write_u16(offset, value.wrapping_add(adjust));
            }
            _ => {}
        }
        Ok(())
    }

    // ---- export directory --------------------------------------------------

    /// Walks `IMAGE_EXPORT_DIRECTORY` and returns `(rva, name)` for every
    /// named export. Ordinal-only exports are skipped: the import resolver
    /// only ever matches imports by name (SPEC_FULL §4.5).
    pub fn exports(&self) -> Vec<(u32, String)> {
        let (dir_rva, dir_size) = self.data_directory(data_directory::EXPORT);
        if dir_rva == 0 || dir_size == 0 {
            return Vec::new();
        }
        let offset = match self.rva_to_offset(dir_rva) {
            Ok(o) => o,
            Err(_) => return Vec::new(),
        };
        let bytes = match self.buffer.get(offset..offset + 40) {
            Some(b) => b,
            None => return Vec::new(),
        };
        let number_of_names = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let address_of_functions = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
        let address_of_names = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
        let address_of_name_ordinals = u32::from_le_bytes(bytes[36..40].try_into().unwrap());

        let mut out = Vec::with_capacity(number_of_names as usize);
        for i in 0..number_of_names {
            let name_rva = match self.rva_to_offset(address_of_names + i * 4) {
                Ok(o) => self.read_u32(o),
                Err(_) => continue,
            };
            let ordinal = match self.rva_to_offset(address_of_name_ordinals + i * 2) {
                Ok(o) => self.read_u16(o),
                Err(_) => continue,
            };
            let func_rva = match self.rva_to_offset(address_of_functions + ordinal as u32 * 4) {
                Ok(o) => self.read_u32(o),
                Err(_) => continue,
            };
            if func_rva == 0 {
                continue;
            }
            if let Some(name) = read_c_string_at(self, name_rva) {
                out.push((func_rva, name));
            }
        }
        out
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), DumperError> {
        std::fs::write(path, &self.buffer).map_err(|source| DumperError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn read_c_string_at(image: &PeImage, rva: u32) -> Option<String> {
    let offset = image.rva_to_offset(rva).ok()?;
    let bytes = image.buffer.get(offset..)?;
    let end = bytes.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        value
    } else {
        ((value + alignment - 1) / alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::minimal_pe_buffer;

    #[test]
    fn rejects_non_pe_buffer() {
        let buffer = vec![0u8; 64];
        assert!(PeImage::from_bytes(buffer).is_err());
    }

    #[test]
    fn round_trip_preserves_bytes_except_checksum() {
        let buffer = minimal_pe_buffer(&[(".text", 0x6000_0020, 0x1000, 0x200, 0x400)]);
        let original = buffer.clone();
        let mut image = PeImage::from_bytes(buffer).unwrap();
        image.refresh();
        let checksum_offset = image.checksum_offset();
        let rebuilt = image.into_bytes();
        assert_eq!(rebuilt.len(), original.len());
        for i in 0..original.len() {
            if i >= checksum_offset && i < checksum_offset + 4 {
                continue;
            }
            assert_eq!(rebuilt[i], original[i], "byte {i} differs");
        }
    }

    #[test]
    fn rebase_round_trip_restores_bytes() {
        let mut buffer = minimal_pe_buffer(&[(".text", 0x6000_0020, 0x1000, 0x200, 0x400)]);
        crate::tests_support::set_data_directory(&mut buffer, data_directory::BASE_RELOCATION, 0, 0);
        let mut image = PeImage::from_bytes(buffer).unwrap();
        let before = image.as_slice().to_vec();
        image.rebase(image.image_base(), 0x2_0000_0000).unwrap();
        image.rebase(0x2_0000_0000, before_image_base(&before)).unwrap();
        let checksum_offset = image.checksum_offset();
        for i in 0..before.len() {
            if i >= checksum_offset && i < checksum_offset + 4 {
                continue;
            }
            assert_eq!(image.as_slice()[i], before[i], "byte {i} differs after rebase round trip");
        }
    }

    fn before_image_base(buffer: &[u8]) -> u64 {
        let nt_header_offset = u32::from_le_bytes(buffer[0x3C..0x40].try_into().unwrap()) as usize;
        let optional_header_offset = nt_header_offset + 4 + 20;
        u64::from_le_bytes(buffer[optional_header_offset + 24..optional_header_offset + 32].try_into().unwrap())
    }

    #[test]
    fn append_section_grows_image_and_table() {
        let buffer = minimal_pe_buffer(&[(".text", 0x6000_0020, 0x1000, 0x200, 0x400)]);
        let mut image = PeImage::from_bytes(buffer).unwrap();
        let before_count = image.section_table().count();
        image.append_section(".vulkan", 0x4000_0040, &[0xAAu8; 100]).unwrap();
        assert_eq!(image.section_table().count(), before_count + 1);
        let section = image.section_table().find(".vulkan").unwrap();
        assert_eq!(section.virtual_size, 100);
        assert_eq!(section.size_of_raw_data % image.file_alignment(), 0);
    }

    #[test]
    fn remove_section_zeroes_vacated_slot() {
        let buffer = minimal_pe_buffer(&[
            (".text", 0x6000_0020, 0x1000, 0x200, 0x400),
            (".rdata", 0x4000_0040, 0x2000, 0x200, 0x600),
        ]);
        let mut image = PeImage::from_bytes(buffer).unwrap();
        let table_offset = image.section_table_offset();
        let before_count = image.section_table().count() as usize;

        image.remove_section(before_count - 1).unwrap();

        assert_eq!(image.section_table().count() as usize, before_count - 1);
        let vacated = table_offset + (before_count - 1) * crate::pe::section_table::SECTION_HEADER_SIZE;
        assert!(image.as_slice()[vacated..vacated + crate::pe::section_table::SECTION_HEADER_SIZE]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn exports_reads_named_entries() {
        let mut buffer = minimal_pe_buffer(&[(".edata", 0x4000_0040, 0x1000, 0x200, 0x400)]);
        // IMAGE_EXPORT_DIRECTORY laid out right at the start of .edata's raw
        // data, followed by one AddressOfFunctions slot, one AddressOfNames
        // slot, one AddressOfNameOrdinals slot, and the name string itself.
        let dir_rva = 0x1000u32;
        let functions_rva = dir_rva + 40;
        let names_rva = functions_rva + 4;
        let ordinals_rva = names_rva + 4;
        let name_string_rva = ordinals_rva + 2;
        let export_func_rva = 0x1234u32;

        crate::tests_support::set_data_directory(&mut buffer, data_directory::EXPORT, dir_rva, 40);

        let base = 0x400usize; // pointer_to_raw_data of .edata
        buffer[base + 24..base + 28].copy_from_slice(&1u32.to_le_bytes()); // NumberOfNames
        buffer[base + 28..base + 32].copy_from_slice(&functions_rva.to_le_bytes());
        buffer[base + 32..base + 36].copy_from_slice(&names_rva.to_le_bytes());
        buffer[base + 36..base + 40].copy_from_slice(&ordinals_rva.to_le_bytes());

        let functions_off = base + 40;
        buffer[functions_off..functions_off + 4].copy_from_slice(&export_func_rva.to_le_bytes());
        let names_off = functions_off + 4;
        buffer[names_off..names_off + 4].copy_from_slice(&name_string_rva.to_le_bytes());
        let ordinals_off = names_off + 4;
        buffer[ordinals_off..ordinals_off + 2].copy_from_slice(&0u16.to_le_bytes());
        let name_off = ordinals_off + 2;
        buffer[name_off..name_off + 11].copy_from_slice(b"ExportFunc\0");

        let image = PeImage::from_bytes(buffer).unwrap();
        let exports = image.exports();
        assert_eq!(exports, vec![(export_func_rva, "ExportFunc".to_string())]);
    }

    #[test]
    fn rva_to_offset_and_back_roundtrip() {
        let buffer = minimal_pe_buffer(&[(".text", 0x6000_0020, 0x1000, 0x200, 0x400)]);
        let image = PeImage::from_bytes(buffer).unwrap();
        let offset = image.rva_to_offset(0x1010).unwrap();
        assert_eq!(offset, 0x400 + 0x10);
        let rva = image.offset_to_rva(offset).unwrap();
        assert_eq!(rva, 0x1010);
    }
}
