//! Synthetic PE64 fixtures shared by unit tests across the crate.

use crate::consts::{DOS_SIGNATURE, NT_SIGNATURE, OPTIONAL_HDR64_MAGIC};

const E_LFANEW: usize = 0x3C;
const FILE_HEADER_SIZE: usize = 20;
const OPTIONAL_HEADER_SIZE: usize = 0xF0; // 112 + 16 * 8, PE32+ with 16 data directories
const SECTION_HEADER_SIZE: usize = 40;
const NUM_DATA_DIRECTORIES: usize = 16;

/// Builds a minimal, structurally valid PE32+ image with the given sections.
///
/// Each tuple is `(name, characteristics, virtual_address, size_of_raw_data, pointer_to_raw_data)`.
/// `virtual_size` is set equal to `size_of_raw_data` for simplicity.
pub(crate) fn minimal_pe_buffer(sections: &[(&str, u32, u32, u32, u32)]) -> Vec<u8> {
    let nt_header_offset = 0x80;
    let file_header_offset = nt_header_offset + 4;
    let optional_header_offset = file_header_offset + FILE_HEADER_SIZE;
    let section_table_offset = optional_header_offset + OPTIONAL_HEADER_SIZE;

    let header_region_end = section_table_offset + sections.len() * SECTION_HEADER_SIZE;
    let last_section_end = sections
        .iter()
        .map(|(_, _, _, raw_size, ptr)| (*ptr + *raw_size) as usize)
        .max()
        .unwrap_or(header_region_end);

    let mut buffer = vec![0u8; header_region_end.max(last_section_end).max(0x400)];

    buffer[0..2].copy_from_slice(&DOS_SIGNATURE.to_le_bytes());
    buffer[E_LFANEW..E_LFANEW + 4].copy_from_slice(&(nt_header_offset as u32).to_le_bytes());
    buffer[nt_header_offset..nt_header_offset + 4].copy_from_slice(&NT_SIGNATURE.to_le_bytes());

    // File header
    buffer[file_header_offset..file_header_offset + 2].copy_from_slice(&0x8664u16.to_le_bytes());
    buffer[file_header_offset + 2..file_header_offset + 4]
        .copy_from_slice(&(sections.len() as u16).to_le_bytes());
    buffer[file_header_offset + 16..file_header_offset + 18]
        .copy_from_slice(&(OPTIONAL_HEADER_SIZE as u16).to_le_bytes());

    // Optional header
    buffer[optional_header_offset..optional_header_offset + 2]
        .copy_from_slice(&OPTIONAL_HDR64_MAGIC.to_le_bytes());
    buffer[optional_header_offset + 24..optional_header_offset + 32]
        .copy_from_slice(&0x1_4000_0000u64.to_le_bytes()); // ImageBase
    buffer[optional_header_offset + 32..optional_header_offset + 36]
        .copy_from_slice(&0x1000u32.to_le_bytes()); // SectionAlignment
    buffer[optional_header_offset + 36..optional_header_offset + 40]
        .copy_from_slice(&0x200u32.to_le_bytes()); // FileAlignment
    buffer[optional_header_offset + 56..optional_header_offset + 60]
        .copy_from_slice(&(last_section_end as u32).to_le_bytes()); // SizeOfImage
    buffer[optional_header_offset + 60..optional_header_offset + 64]
        .copy_from_slice(&(section_table_offset as u32).to_le_bytes()); // SizeOfHeaders
    buffer[optional_header_offset + 108..optional_header_offset + 112]
        .copy_from_slice(&(NUM_DATA_DIRECTORIES as u32).to_le_bytes());

    for (idx, (name, characteristics, va, raw_size, ptr)) in sections.iter().enumerate() {
        let offset = section_table_offset + idx * SECTION_HEADER_SIZE;
        let mut packed_name = [0u8; 8];
        for (slot, byte) in packed_name.iter_mut().zip(name.as_bytes()) {
            *slot = *byte;
        }
        buffer[offset..offset + 8].copy_from_slice(&packed_name);
        buffer[offset + 8..offset + 12].copy_from_slice(&raw_size.to_le_bytes());
        buffer[offset + 12..offset + 16].copy_from_slice(&va.to_le_bytes());
        buffer[offset + 16..offset + 20].copy_from_slice(&raw_size.to_le_bytes());
        buffer[offset + 20..offset + 24].copy_from_slice(&ptr.to_le_bytes());
        buffer[offset + 36..offset + 40].copy_from_slice(&characteristics.to_le_bytes());
    }

    buffer
}

/// Sets one of the 16 data directory entries (`index` per [`crate::consts::data_directory`]).
pub(crate) fn set_data_directory(buffer: &mut [u8], index: usize, virtual_address: u32, size: u32) {
    let nt_header_offset = 0x80;
    let file_header_offset = nt_header_offset + 4;
    let optional_header_offset = file_header_offset + FILE_HEADER_SIZE;
    let directory_offset = optional_header_offset + 112 + index * 8;
    buffer[directory_offset..directory_offset + 4].copy_from_slice(&virtual_address.to_le_bytes());
    buffer[directory_offset + 4..directory_offset + 8].copy_from_slice(&size.to_le_bytes());
}
