//! Prunes `RUNTIME_FUNCTION` entries the x64 unwinder would choke on.
//!
//! Grounded in `original_source/src/exception_sanitizer.cpp`. A harvested
//! image routinely ends up with exception-directory entries pointing at
//! code or unwind info that was never captured (either it lived in a
//! section the harvester skipped, or the protector's own exception table was
//! already partially stripped). Leaving those in place crashes the runtime
//! the moment `RtlVirtualUnwind` walks them during the first SEH dispatch,
//! so each entry is validated and zeroed in place rather than removed — the
//! `EXCEPTION` directory's size is unchanged, and the loader happily walks
//! past a run of all-zero `RUNTIME_FUNCTION` entries.

use crate::error::DumperError;
use crate::pe::PeImage;

const RUNTIME_FUNCTION_SIZE: usize = 12;

pub struct ExceptionSanitizer;

impl ExceptionSanitizer {
    /// Zeroes every malformed entry in the exception directory, returning how
    /// many were zeroed.
    pub fn sanitize(image: &mut PeImage) -> Result<usize, DumperError> {
        let (dir_rva, dir_size) = image.exception_directory_entry();
        if dir_rva == 0 || dir_size == 0 {
            return Ok(0);
        }

        let count = dir_size as usize / RUNTIME_FUNCTION_SIZE;
        let mut zeroed = 0;
        for i in 0..count {
            let entry_rva = dir_rva + (i * RUNTIME_FUNCTION_SIZE) as u32;
            let offset = match image.rva_to_offset(entry_rva) {
                Ok(o) => o,
                Err(_) => continue,
            };
            let entry = match image.as_slice().get(offset..offset + RUNTIME_FUNCTION_SIZE) {
                Some(b) => b,
                None => continue,
            };
            let begin_rva = u32::from_le_bytes(entry[0..4].try_into().unwrap());
            let end_rva = u32::from_le_bytes(entry[4..8].try_into().unwrap());
            let unwind_rva = u32::from_le_bytes(entry[8..12].try_into().unwrap());

            if !Self::entry_is_valid(image, begin_rva, end_rva, unwind_rva) {
                image.as_mut_slice()[offset..offset + RUNTIME_FUNCTION_SIZE].fill(0);
                zeroed += 1;
            }
        }
        Ok(zeroed)
    }

    fn entry_is_valid(image: &PeImage, begin_rva: u32, end_rva: u32, unwind_rva: u32) -> bool {
        if Self::resolves_to_zero(image, begin_rva)
            || Self::resolves_to_zero(image, end_rva)
            || Self::resolves_to_zero(image, unwind_rva)
        {
            return false;
        }
        Self::unwind_version_is_one(image, unwind_rva)
    }

    fn resolves_to_zero(image: &PeImage, rva: u32) -> bool {
        match image.rva_to_offset(rva) {
            Ok(offset) => offset == 0,
            Err(_) => true,
        }
    }

    /// The low 3 bits of `UNWIND_INFO`'s first byte carry the version; every
    /// unwind-info blob this builder should trust is version 1.
    fn unwind_version_is_one(image: &PeImage, unwind_rva: u32) -> bool {
        match image.rva_to_offset(unwind_rva) {
            Ok(offset) => image
                .as_slice()
                .get(offset)
                .map(|&b| (b & 0x7) == 1)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
