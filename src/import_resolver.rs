//! Scrambled-import reconstruction.
//!
//! Grounded in `original_source/src/import_resolver.cpp`: a protector that
//! strips the import directory still has to call into `KERNEL32.dll` and
//! friends somehow, so it rewrites `call [IAT_slot]` into `call
//! [rip+disp32]` where the pointer at that displacement is a scrambled
//! location holding the *real* export address. This module finds those
//! scrambled pointers by brute-force scanning `.rdata` for bytes that happen
//! to equal a known export address, synthesizes a conventional import
//! directory for them, and repoints every `call`/`jmp` site at the new IAT.
//!
//! The three steps run strictly in order (SPEC_FULL §5): step C depends on
//! the IAT layout step B just built.

use std::collections::HashMap;

use log::debug;

use crate::consts::{CALL_RIP_PATTERN, JMP_RIP_PATTERN, USERMODE_CODE_HIGH, USERMODE_CODE_LOW};
use crate::error::DumperError;
use crate::pe::PeImage;
use crate::process::ExportedSymbol;

const RDATA_SECTION_NAME: &str = ".rdata";

pub struct ImportResolver;

impl ImportResolver {
    /// Runs steps A through C against `image`, using `exports` as the
    /// candidate pool of every export of every module loaded in the target
    /// process. Returns the number of call/jmp sites patched.
    pub fn resolve(image: &mut PeImage, exports: &[ExportedSymbol]) -> Result<usize, DumperError> {
        let export_map = build_export_map(exports);

        let candidates = Self::scan_rdata_candidates(image, &export_map);
        if candidates.is_empty() {
            debug!("import resolver found no candidate pointers in .rdata");
            return Ok(0);
        }

        for (export_addr, module, name) in &candidates {
            image.import_directory_mut().add(module, name, *export_addr);
        }

        let directory = image.import_directory().clone();
        directory.recompile(image)?;

        let iat_map = Self::build_iat_map(image);
        Ok(Self::patch_call_sites(image, &iat_map))
    }

    /// Step A: treats `.rdata` as an overlapping stride-1 sequence of
    /// pointer-sized values and records every one that matches a known
    /// export address.
    fn scan_rdata_candidates(
        image: &PeImage,
        export_map: &HashMap<u64, (String, String)>,
    ) -> Vec<(u64, String, String)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let section = match image.section_table().find(RDATA_SECTION_NAME) {
            Some(s) => *s,
            None => return out,
        };
        let start = section.pointer_to_raw_data as usize;
        let len = section.size_of_raw_data as usize;
        let bytes = match image.as_slice().get(start..start + len) {
            Some(b) => b,
            None => return out,
        };
        if bytes.len() < 8 {
            return out;
        }
        for offset in 0..=(bytes.len() - 8) {
            let value = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
            if let Some((module, name)) = export_map.get(&value) {
                if seen.insert(value) {
                    out.push((value, module.clone(), name.clone()));
                }
            }
        }
        out
    }

    /// Step B's second half: after `recompile` has laid out the IAT in
    /// module order, reconstructs each function's new IAT RVA by walking the
    /// same layout `recompile` produced (iat entries, one per function, plus
    /// one null terminator per module).
    fn build_iat_map(image: &PeImage) -> HashMap<u64, u32> {
        let (iat_base, _) = image.iat_directory_entry();
        let mut map = HashMap::new();
        let mut cursor = iat_base;
        for module in &image.import_directory().modules {
            for function in &module.functions {
                map.insert(function.address, cursor);
                cursor += crate::consts::PTR_SIZE as u32;
            }
            cursor += crate::consts::PTR_SIZE as u32; // null terminator slot
        }
        map
    }

    /// Step C: scans the whole buffer for `call [rip+disp32]` / `jmp
    /// [rip+disp32]` sites and repoints any that dereference to a known
    /// export address.
    fn patch_call_sites(image: &mut PeImage, iat_map: &HashMap<u64, u32>) -> usize {
        let len = image.len();
        let mut patched = 0usize;
        let mut offset = 0usize;
        while offset + 6 <= len {
            let (disp_offset, instr_len) = if &image.as_slice()[offset..offset + 2] == &CALL_RIP_PATTERN {
                (offset + 2, 6usize)
            } else if offset + 7 <= len && &image.as_slice()[offset..offset + 3] == &JMP_RIP_PATTERN {
                (offset + 3, 7usize)
            } else {
                offset += 1;
                continue;
            };
            if offset + instr_len > len {
                offset += 1;
                continue;
            }
            let disp32 = i32::from_le_bytes(
                image.as_slice()[disp_offset..disp_offset + 4].try_into().unwrap(),
            );
            let next_rva = match image.offset_to_rva(offset + instr_len) {
                Ok(rva) => rva,
                Err(_) => {
                    offset += instr_len;
                    continue;
                }
            };
            let target_rva = (next_rva as i64 + disp32 as i64) as u32;
            if let Ok(export_addr) = image.read_rva_u64(target_rva) {
                if (USERMODE_CODE_LOW..=USERMODE_CODE_HIGH).contains(&export_addr) {
                    if let Some(&new_iat_rva) = iat_map.get(&export_addr) {
                        let new_disp = new_iat_rva as i64 - next_rva as i64;
                        image.as_mut_slice()[disp_offset..disp_offset + 4]
                            .copy_from_slice(&(new_disp as i32).to_le_bytes());
                        patched += 1;
                    }
                }
            }
            offset += instr_len;
        }
        patched
    }
}

fn build_export_map(exports: &[ExportedSymbol]) -> HashMap<u64, (String, String)> {
    let mut map = HashMap::with_capacity(exports.len());
    for export in exports {
        map.insert(export.address, (export.module_name.clone(), export.name.clone()));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{minimal_pe_buffer, set_data_directory};

    fn export(address: u64, module: &str, name: &str) -> ExportedSymbol {
        ExportedSymbol {
            address,
            module_name: module.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn scan_finds_export_pointer_in_rdata() {
        let mut buffer = minimal_pe_buffer(&[
            (".text", 0x6000_0020, 0x1000, 0x200, 0x400),
            (".rdata", 0x4000_0040, 0x2000, 0x200, 0x600),
        ]);
        let target_addr = 0xAAAA_AAAA_AAAA_0000u64;
        buffer[0x600..0x608].copy_from_slice(&target_addr.to_le_bytes());
        let image = PeImage::from_bytes(buffer).unwrap();

        let exports = vec![export(target_addr, "USER32.dll", "MessageBoxA")];
        let map = build_export_map(&exports);
        let candidates = ImportResolver::scan_rdata_candidates(&image, &map);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1, "USER32.dll");
        assert_eq!(candidates[0].2, "MessageBoxA");
    }

    #[test]
    fn resolve_emits_directory_and_patches_call_site() {
        let mut buffer = minimal_pe_buffer(&[
            (".text", 0x6000_0020, 0x1000, 0x200, 0x400),
            (".rdata", 0x4000_0040, 0x2000, 0x200, 0x600),
        ]);
        let target_addr = 0x0000_7FF0_1234_0000u64;
        // The scrambled pointer the protector stashed in .rdata.
        buffer[0x600..0x608].copy_from_slice(&target_addr.to_le_bytes());
        // `FF 15 10 00 00 00` at file offset 0x400 (start of .text): call
        // through a RIP-relative pointer located 0x16 bytes further (0x406 +
        // 0x10 = 0x416), which we've made point at the scrambled pointer's
        // *RVA*... to keep this test simple we instead place the call right
        // next to a pointer to the scrambled value.
        set_data_directory(&mut buffer, crate::consts::data_directory::EXCEPTION, 0, 0);
        let mut image = PeImage::from_bytes(buffer).unwrap();

        // Point the call's disp32 so that next_rva + disp32 == the .rdata rva
        // holding target_addr (rva 0x2000 maps to file offset 0x600).
        let call_site_offset = 0x420usize; // inside .text's raw window
        let next = image.offset_to_rva(call_site_offset + 6).unwrap();
        let rdata_rva = image.offset_to_rva(0x600).unwrap();
        let disp32 = rdata_rva as i64 - next as i64;
        image.as_mut_slice()[call_site_offset..call_site_offset + 2].copy_from_slice(&CALL_RIP_PATTERN);
        image.as_mut_slice()[call_site_offset + 2..call_site_offset + 6]
            .copy_from_slice(&(disp32 as i32).to_le_bytes());

        let exports = vec![export(target_addr, "USER32.dll", "MessageBoxA")];
        let patched = ImportResolver::resolve(&mut image, &exports).unwrap();
        assert_eq!(patched, 1);

        let new_disp = i32::from_le_bytes(
            image.as_slice()[call_site_offset + 2..call_site_offset + 6].try_into().unwrap(),
        );
        let new_next = image.offset_to_rva(call_site_offset + 6).unwrap();
        let new_target_rva = (new_next as i64 + new_disp as i64) as u32;
        let new_target_offset = image.rva_to_offset(new_target_rva).unwrap();
        let iat_value = u64::from_le_bytes(
            image.as_slice()[new_target_offset..new_target_offset + 8].try_into().unwrap(),
        );
        assert_eq!(iat_value, target_addr);
    }
}
