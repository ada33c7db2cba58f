//! Captures a process's live memory into a [`PeImage`] buffer, section by
//! section.
//!
//! Grounded in `original_source/src/dumper.cpp`'s `resolve_sections()`: code
//! sections are read page by page because a protector commonly leaves pages
//! `PAGE_NOACCESS` until the first touch (lazy decryption) and then flips
//! them to executable once the page fault handler runs — re-polling every
//! page still `PAGE_NOACCESS` catches pages that unlock while the user
//! exercises the target. Unreadable code pages are filled with `NOP`
//! (`0x90`) rather than zero so a disassembler degrades gracefully instead
//! of decoding a wall of bogus `add [rax], al`. Data sections are read in
//! one bulk pass; `.reloc` is a known casualty of this approach (the loader
//! frequently discards it after applying fixups), so a disk copy of the
//! module is accepted as a fallback source for that one section
//! specifically.
//!
//! The code-section loop has no built-in timeout or attempt cap (SPEC_FULL
//! §4.3, §5): it spins until every page is captured or the cancellation
//! token fires, matching `dumper.cpp:144`'s
//! `while(!stop_requested && pages_read.size() <= total_pages)`.

use std::time::Duration;

use log::{debug, warn};

use crate::consts::{section_characteristics, PAGE_SIZE};
use crate::error::DumperError;
use crate::pe::PeImage;
use crate::process::{CancellationToken, Module, Process};

const RELOC_SECTION_NAME: &str = ".reloc";
const NOP_BYTE: u8 = 0x90;

pub struct Harvester {
    pub poll_interval: Duration,
}

impl Default for Harvester {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Harvester {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Captures every section of `module` into `image`'s buffer, in place.
    ///
    /// `disk_fallback`, if present, is a `PeImage` parsed from the on-disk
    /// copy of the same module, consulted only to refill `.reloc` when the
    /// live read comes back empty.
    pub fn harvest<P: Process, C: CancellationToken>(
        &self,
        process: &P,
        module: &P::Module,
        image: &mut PeImage,
        cancel: &C,
        disk_fallback: Option<&PeImage>,
    ) -> Result<(), DumperError> {
        let sections: Vec<_> = image.section_table().iter().copied().collect();
        for (index, section) in sections.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(DumperError::Cancelled);
            }

            let section_va = module.base_address() + section.virtual_address as u64;
            let len = section.virtual_size.max(section.size_of_raw_data) as usize;
            if len == 0 {
                continue;
            }

            let (captured, cancelled) = if section.is_code() {
                self.harvest_code_section(process, section_va, len, cancel)?
            } else {
                (self.harvest_data_section(process, section_va, len)?, false)
            };

            let captured = if section.name_matches(RELOC_SECTION_NAME) && is_all_zero(&captured) {
                match disk_fallback.and_then(|fallback| fallback.section_table().find(RELOC_SECTION_NAME).map(|s| (fallback, *s))) {
                    Some((fallback, disk_section)) => {
                        debug!("harvested .reloc was empty, falling back to disk copy");
                        read_disk_section(fallback, &disk_section, len)
                    }
                    None => {
                        warn!(".reloc harvested as all-zero and no disk fallback was provided");
                        captured
                    }
                }
            } else {
                captured
            };

            if captured.len() > section.size_of_raw_data as usize {
                image.extend_section(index, &captured)?;
            } else {
                let offset = section.pointer_to_raw_data as usize;
                let end = offset + captured.len();
                if image.len() < end {
                    return Err(DumperError::Malformed(format!(
                        "section {} raw data falls outside the image buffer",
                        section.name_str()
                    )));
                }
                image.as_mut_slice()[offset..end].copy_from_slice(&captured);
            }

            if cancelled {
                return Err(DumperError::Cancelled);
            }
        }
        image.refresh();
        Ok(())
    }

    /// Polls every page of a code section until all are captured or the
    /// caller cancels. A page still `PAGE_NOACCESS` is skipped this cycle and
    /// retried on the next one; a full cycle that captures nothing sleeps for
    /// `poll_interval` before trying again, so a permanently locked page parks
    /// the loop here until cancellation rather than spinning the CPU or
    /// giving up on the page. Returns the bytes captured so far (with NOP
    /// fill standing in for whatever is still uncaptured) alongside whether
    /// cancellation cut the capture short.
    fn harvest_code_section<P: Process, C: CancellationToken>(
        &self,
        process: &P,
        section_va: u64,
        len: usize,
        cancel: &C,
    ) -> Result<(Vec<u8>, bool), DumperError> {
        let mut out = vec![NOP_BYTE; len];
        let total_pages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
        let mut captured = vec![false; total_pages];
        let mut remaining = total_pages;

        while remaining > 0 {
            if cancel.is_cancelled() {
                return Ok((out, true));
            }
            let mut progressed = false;
            for page in 0..total_pages {
                if captured[page] {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Ok((out, true));
                }
                let page_offset = page * PAGE_SIZE;
                let page_va = section_va + page_offset as u64;
                let page_len = PAGE_SIZE.min(len - page_offset);

                if let Ok(Some(region)) = process.query_region(page_va) {
                    if region.is_no_access() || region.is_guard() {
                        debug!("page {page_va:#x} still inaccessible, will re-poll");
                        continue;
                    }
                }
                let mut page_buf = vec![0u8; page_len];
                let read = process.read_memory(page_va, &mut page_buf)?;
                if read > 0 {
                    out[page_offset..page_offset + page_len].copy_from_slice(&page_buf);
                    captured[page] = true;
                    remaining -= 1;
                    progressed = true;
                }
            }
            if remaining > 0 && !progressed {
                std::thread::sleep(self.poll_interval);
            }
        }
        Ok((out, false))
    }

    fn harvest_data_section<P: Process>(
        &self,
        process: &P,
        section_va: u64,
        len: usize,
    ) -> Result<Vec<u8>, DumperError> {
        let mut out = vec![0u8; len];
        let read = process.read_memory(section_va, &mut out)?;
        if read < len {
            debug!(
                "bulk read of data section at {section_va:#x} returned {read}/{len} bytes"
            );
        }
        Ok(out)
    }
}

fn is_all_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

fn read_disk_section(
    fallback: &PeImage,
    section: &crate::pe::SectionHeader,
    len: usize,
) -> Vec<u8> {
    let start = section.pointer_to_raw_data as usize;
    let available = fallback.as_slice().get(start..).map(|s| s.len()).unwrap_or(0);
    let to_copy = available.min(len);
    let mut out = vec![0u8; len];
    if to_copy > 0 {
        out[..to_copy].copy_from_slice(&fallback.as_slice()[start..start + to_copy]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{FakeModule, FakeProcess, FakeRegion, SharedCancellationToken};
    use crate::tests_support::minimal_pe_buffer;

    fn module_for(process: &FakeProcess) -> FakeModule {
        process.modules().unwrap().into_iter().next().unwrap()
    }

    #[test]
    fn fills_nop_for_permanently_inaccessible_code_page() {
        let buffer = minimal_pe_buffer(&[(".text", section_characteristics::CNT_CODE | section_characteristics::MEM_EXECUTE, 0x1000, 0x1000, 0x400)]);
        let mut image = PeImage::from_bytes(buffer).unwrap();

        let mut process = FakeProcess::new(42);
        process.add_module(FakeModule {
            base_address: 0x1_4000_0000,
            size: 0x3000,
            name: "target.exe".into(),
            path: None,
            ..Default::default()
        });
        process.add_region(FakeRegion {
            base_address: 0x1_4000_1000,
            size: 0x1000,
            no_access: true,
            guard: false,
            committed: true,
        });

        let module = module_for(&process);
        let harvester = Harvester::new(Duration::from_millis(1));
        let cancel = SharedCancellationToken::new();
        let cancel_trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            cancel_trigger.cancel();
        });
        let result = harvester.harvest(&process, &module, &mut image, &cancel, None);
        assert!(matches!(result, Err(DumperError::Cancelled)));

        let offset = image.section_table().find(".text").unwrap().pointer_to_raw_data as usize;
        assert!(image.as_slice()[offset..offset + 0x1000].iter().all(|&b| b == NOP_BYTE));
    }

    #[test]
    fn captures_readable_code_page() {
        let buffer = minimal_pe_buffer(&[(".text", section_characteristics::CNT_CODE | section_characteristics::MEM_EXECUTE, 0x1000, 0x1000, 0x400)]);
        let mut image = PeImage::from_bytes(buffer).unwrap();

        let mut process = FakeProcess::new(42);
        process.add_module(FakeModule {
            base_address: 0x1_4000_0000,
            size: 0x3000,
            name: "target.exe".into(),
            path: None,
            ..Default::default()
        });
        process.add_region(FakeRegion {
            base_address: 0x1_4000_1000,
            size: 0x1000,
            no_access: false,
            guard: false,
            committed: true,
        });
        process.write_memory(0x1_4000_1000, &[0xCCu8; 0x1000]);

        let module = module_for(&process);
        let harvester = Harvester::new(Duration::from_millis(1));
        let cancel = SharedCancellationToken::new();
        harvester.harvest(&process, &module, &mut image, &cancel, None).unwrap();

        let offset = image.section_table().find(".text").unwrap().pointer_to_raw_data as usize;
        assert!(image.as_slice()[offset..offset + 0x1000].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn cancellation_aborts_harvest() {
        let buffer = minimal_pe_buffer(&[(".text", section_characteristics::CNT_CODE, 0x1000, 0x1000, 0x400)]);
        let mut image = PeImage::from_bytes(buffer).unwrap();
        let mut process = FakeProcess::new(42);
        process.add_module(FakeModule {
            base_address: 0x1_4000_0000,
            size: 0x3000,
            name: "target.exe".into(),
            path: None,
            ..Default::default()
        });
        let module = module_for(&process);
        let harvester = Harvester::default();
        let cancel = SharedCancellationToken::new();
        cancel.cancel();
        let result = harvester.harvest(&process, &module, &mut image, &cancel, None);
        assert!(matches!(result, Err(DumperError::Cancelled)));
    }
}
