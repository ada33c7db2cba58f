//! Import table model and serializer.
//!
//! Grounded in `original_source/src/pe/import_directory.cpp`'s `recompile()`:
//! the on-disk layout it produces is IAT thunks first, then the descriptor
//! array, then the name/hint pool, each 8-byte aligned. The original keeps a
//! back-pointer to the owning image (`image* m_image`); per SPEC_FULL §9 that
//! self-reference doesn't survive translation to Rust, so `ImportDirectory`
//! here is a plain value carried alongside `PeImage` and every method that
//! needs the image takes it as an explicit argument.

use crate::consts::{data_directory, PTR_SIZE};
use crate::error::DumperError;
use crate::pe::image::PeImage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedFunction {
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    /// Resolved address (VA), filled in once the import resolver locates it.
    pub address: u64,
}

impl ImportedFunction {
    pub fn by_name(name: impl Into<String>, address: u64) -> Self {
        Self {
            name: Some(name.into()),
            ordinal: None,
            address,
        }
    }

    pub fn display_name(&self) -> String {
        match (&self.name, self.ordinal) {
            (Some(name), _) => name.clone(),
            (None, Some(ordinal)) => format!("#{ordinal}"),
            (None, None) => "<unknown>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedModule {
    pub name: String,
    pub functions: Vec<ImportedFunction>,
}

/// A reconstructed import table, independent of where (or whether) it lives
/// inside a particular `PeImage` buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportDirectory {
    pub modules: Vec<ImportedModule>,
}

const IMPORT_DESCRIPTOR_SIZE: usize = 20;
const VULKAN_SECTION_NAME: &str = ".vulkan";

impl ImportDirectory {
    pub fn empty() -> Self {
        Self { modules: Vec::new() }
    }

    /// Parses whatever import directory currently exists in `image`, if any.
    /// A missing or zero-sized directory yields an empty `ImportDirectory`
    /// rather than an error: harvested images frequently have none left
    /// (SPEC_FULL §4.4, "Edge cases").
    pub fn parse(image: &PeImage) -> Self {
        let (dir_rva, dir_size) = image.import_directory_entry();
        if dir_rva == 0 || dir_size == 0 {
            return Self::empty();
        }

        let mut modules = Vec::new();
        let mut descriptor_rva = dir_rva;
        loop {
            let offset = match image.rva_to_offset(descriptor_rva) {
                Ok(o) => o,
                Err(_) => break,
            };
            let bytes = match image.as_slice().get(offset..offset + IMPORT_DESCRIPTOR_SIZE) {
                Some(b) => b,
                None => break,
            };
            let original_first_thunk = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            let name_rva = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
            let first_thunk = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
            if original_first_thunk == 0 && name_rva == 0 && first_thunk == 0 {
                break;
            }

            let name = read_c_string(image, name_rva).unwrap_or_default();
            let thunk_rva = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };
            let functions = Self::parse_thunks(image, thunk_rva, first_thunk);
            modules.push(ImportedModule { name, functions });

            descriptor_rva += IMPORT_DESCRIPTOR_SIZE as u32;
        }

        Self { modules }
    }

    fn parse_thunks(image: &PeImage, ilt_rva: u32, iat_rva: u32) -> Vec<ImportedFunction> {
        let mut functions = Vec::new();
        let mut i = 0u32;
        loop {
            let thunk_rva = ilt_rva + i * PTR_SIZE as u32;
            let thunk = match image.read_rva_u64(thunk_rva) {
                Ok(v) => v,
                Err(_) => break,
            };
            if thunk == 0 {
                break;
            }
            let address = image
                .read_rva_u64(iat_rva + i * PTR_SIZE as u32)
                .unwrap_or(0);

            const ORDINAL_FLAG: u64 = 1 << 63;
            let function = if thunk & ORDINAL_FLAG != 0 {
                ImportedFunction {
                    name: None,
                    ordinal: Some((thunk & 0xFFFF) as u16),
                    address,
                }
            } else {
                let name = read_c_string(image, (thunk & 0x7FFF_FFFF) as u32 + 2).unwrap_or_default();
                ImportedFunction {
                    name: Some(name),
                    ordinal: None,
                    address,
                }
            };
            functions.push(function);
            i += 1;
        }
        functions
    }

    /// Idempotently records that `function` from `module` resolves to
    /// `address`. Calling this twice for the same (module, function) updates
    /// the address in place instead of duplicating the entry.
    pub fn add(&mut self, module: &str, function: &str, address: u64) {
        let module_entry = match self.modules.iter_mut().find(|m| m.name.eq_ignore_ascii_case(module)) {
            Some(m) => m,
            None => {
                self.modules.push(ImportedModule {
                    name: module.to_string(),
                    functions: Vec::new(),
                });
                self.modules.last_mut().unwrap()
            }
        };

        match module_entry
            .functions
            .iter_mut()
            .find(|f| f.name.as_deref() == Some(function))
        {
            Some(existing) => existing.address = address,
            None => module_entry
                .functions
                .push(ImportedFunction::by_name(function, address)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn function_count(&self) -> usize {
        self.modules.iter().map(|m| m.functions.len()).sum()
    }

    /// Serializes the full table into a new `.vulkan` section and rewrites
    /// the Import/IAT data directory entries to point at it.
    ///
    /// Layout (matches `import_directory.cpp`'s `recompile()`): the IAT
    /// (resolved addresses, one array per module, zero-terminated), then the
    /// ILT (name/ordinal thunks, same shape), then the descriptor array
    /// (zero-terminated), then the name/hint pool (DLL name strings and
    /// `IMAGE_IMPORT_BY_NAME` entries). Each block is 8-byte padded.
    ///
    /// The IAT carries the addresses actually harvested from the live
    /// process — this image is never going to be re-bound by the loader, so
    /// unlike a freshly linked PE the IAT is pre-resolved and the ILT exists
    /// purely so a disassembler can still show import names.
    pub fn recompile(&self, image: &mut PeImage) -> Result<(), DumperError> {
        if self.modules.is_empty() {
            return Ok(());
        }

        let section_alignment = image.section_alignment();
        let base_va = {
            let last = image
                .section_table()
                .last()
                .ok_or_else(|| DumperError::Malformed("image has no sections".into()))?;
            align_up(last.virtual_address + last.virtual_size, section_alignment)
        };

        // Name pool is built first so the ILT can reference it by RVA.
        let mut name_pool = Vec::new();
        let mut function_name_offsets: Vec<Vec<u32>> = Vec::with_capacity(self.modules.len());
        let mut module_name_offsets = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let mut offsets = Vec::with_capacity(module.functions.len());
            for function in &module.functions {
                if let Some(name) = &function.name {
                    offsets.push(name_pool.len() as u32);
                    name_pool.extend_from_slice(&0u16.to_le_bytes()); // Hint
                    name_pool.extend_from_slice(name.as_bytes());
                    name_pool.push(0);
                    pad_to(&mut name_pool, 2);
                } else {
                    offsets.push(u32::MAX); // sentinel: ordinal import, no name entry
                }
            }
            function_name_offsets.push(offsets);
            module_name_offsets.push(name_pool.len() as u32);
            name_pool.extend_from_slice(module.name.as_bytes());
            name_pool.push(0);
        }
        pad_to(&mut name_pool, 8);

        let mut iat_blob = Vec::new();
        let mut ilt_blob = Vec::new();
        let mut module_thunk_offsets = Vec::with_capacity(self.modules.len());
        const ORDINAL_FLAG: u64 = 1 << 63;
        for (module, name_offsets) in self.modules.iter().zip(function_name_offsets.iter()) {
            module_thunk_offsets.push(iat_blob.len() as u32);
            for (function, name_offset) in module.functions.iter().zip(name_offsets.iter()) {
                iat_blob.extend_from_slice(&function.address.to_le_bytes());
                let ilt_entry = match function.ordinal {
                    Some(ordinal) => ORDINAL_FLAG | ordinal as u64,
                    None => *name_offset as u64, // RVA within the name pool, filled in below
                };
                ilt_blob.extend_from_slice(&ilt_entry.to_le_bytes());
            }
            iat_blob.extend_from_slice(&0u64.to_le_bytes());
            ilt_blob.extend_from_slice(&0u64.to_le_bytes());
        }
        pad_to(&mut iat_blob, 8);
        pad_to(&mut ilt_blob, 8);

        let ilt_offset = iat_blob.len() as u32;
        let descriptors_offset = ilt_offset + ilt_blob.len() as u32;
        let descriptor_count = self.modules.len() + 1; // +1 zero terminator
        let descriptors_size = (descriptor_count * IMPORT_DESCRIPTOR_SIZE) as u32;
        let names_offset = descriptors_offset + descriptors_size;

        let mut blob = iat_blob;
        blob.extend_from_slice(&ilt_blob);
        for (idx, thunk_offset) in module_thunk_offsets.iter().enumerate() {
            let ilt_va = base_va + ilt_offset + thunk_offset;
            let iat_va = base_va + thunk_offset;
            let name_va = base_va + names_offset + module_name_offsets[idx];
            blob.extend_from_slice(&ilt_va.to_le_bytes()); // OriginalFirstThunk
            blob.extend_from_slice(&0u32.to_le_bytes()); // TimeDateStamp
            blob.extend_from_slice(&0u32.to_le_bytes()); // ForwarderChain
            blob.extend_from_slice(&name_va.to_le_bytes()); // Name
            blob.extend_from_slice(&iat_va.to_le_bytes()); // FirstThunk
        }
        blob.resize((descriptors_offset + descriptors_size) as usize, 0); // zero terminator descriptor
        // Name pool RVAs stored in the ILT above are relative to the name
        // pool's own start; rebase them onto the section now that its final
        // offset is known.
        for (idx, name_offsets) in function_name_offsets.iter().enumerate() {
            let entry_base = ilt_offset + module_thunk_offsets[idx];
            for (slot, name_offset) in name_offsets.iter().enumerate() {
                if *name_offset == u32::MAX {
                    continue;
                }
                let entry_offset = (entry_base + slot as u32 * PTR_SIZE as u32) as usize;
                let absolute = base_va + names_offset + name_offset;
                blob[entry_offset..entry_offset + 8].copy_from_slice(&absolute.to_le_bytes());
            }
        }
        blob.extend_from_slice(&name_pool);

        image.append_section(
            VULKAN_SECTION_NAME,
            crate::consts::section_characteristics::CNT_INITIALIZED_DATA
                | crate::consts::section_characteristics::MEM_READ,
            &blob,
        )?;

        let iat_size: u32 = self
            .modules
            .iter()
            .map(|m| (m.functions.len() as u32 + 1) * PTR_SIZE as u32)
            .sum();
        image.set_data_directory(
            data_directory::IMPORT,
            base_va + descriptors_offset,
            descriptors_size,
        );
        image.set_data_directory(data_directory::IAT, base_va, iat_size);
        Ok(())
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        value
    } else {
        ((value + alignment - 1) / alignment) * alignment
    }
}

fn pad_to(buffer: &mut Vec<u8>, alignment: usize) {
    let remainder = buffer.len() % alignment;
    if remainder != 0 {
        buffer.resize(buffer.len() + (alignment - remainder), 0);
    }
}

fn read_c_string(image: &PeImage, rva: u32) -> Option<String> {
    let offset = image.rva_to_offset(rva).ok()?;
    let bytes = image.as_slice().get(offset..)?;
    let end = bytes.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::minimal_pe_buffer;
    use crate::pe::image::PeImage;

    #[test]
    fn add_is_idempotent() {
        let mut dir = ImportDirectory::empty();
        dir.add("kernel32.dll", "GetProcAddress", 0x1000);
        dir.add("kernel32.dll", "GetProcAddress", 0x2000);
        assert_eq!(dir.function_count(), 1);
        assert_eq!(dir.modules[0].functions[0].address, 0x2000);
    }

    #[test]
    fn add_groups_by_module_case_insensitively() {
        let mut dir = ImportDirectory::empty();
        dir.add("KERNEL32.DLL", "GetProcAddress", 0x1000);
        dir.add("kernel32.dll", "VirtualAlloc", 0x2000);
        assert_eq!(dir.modules.len(), 1);
        assert_eq!(dir.modules[0].functions.len(), 2);
    }

    #[test]
    fn recompile_emits_vulkan_section() {
        let buffer = minimal_pe_buffer(&[(".text", 0x6000_0020, 0x1000, 0x200, 0x400)]);
        let mut image = PeImage::from_bytes(buffer).unwrap();
        let mut dir = ImportDirectory::empty();
        dir.add("kernel32.dll", "GetProcAddress", 0x1_4000_1234);
        dir.recompile(&mut image).unwrap();
        assert!(image.section_table().find(".vulkan").is_some());
        let (rva, size) = image.import_directory_entry();
        assert_ne!(rva, 0);
        assert!(size > 0);
    }
}
