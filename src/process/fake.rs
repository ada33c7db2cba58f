//! In-memory process simulation used by tests (and usable from any OS, unlike
//! [`crate::process::live`]). Lets scenario tests (SPEC_FULL §8, S1-S6) drive
//! the harvester and import resolver without a real target process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::DumperError;
use crate::process::{CancellationToken, ExportedSymbol, Module, Process, Region};

#[derive(Debug, Clone)]
pub struct FakeRegion {
    pub base_address: u64,
    pub size: usize,
    pub no_access: bool,
    pub guard: bool,
    pub committed: bool,
}

impl Region for FakeRegion {
    fn base_address(&self) -> u64 {
        self.base_address
    }
    fn size(&self) -> usize {
        self.size
    }
    fn is_no_access(&self) -> bool {
        self.no_access
    }
    fn is_guard(&self) -> bool {
        self.guard
    }
    fn is_committed(&self) -> bool {
        self.committed
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeModule {
    pub base_address: u64,
    pub size: usize,
    pub name: String,
    pub path: Option<PathBuf>,
    /// Fixed export list for this module, injected directly by test setup
    /// rather than parsed from bytes.
    pub exports: Vec<ExportedSymbol>,
}

impl Module for FakeModule {
    fn base_address(&self) -> u64 {
        self.base_address
    }
    fn size(&self) -> usize {
        self.size
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
    fn exports(&self) -> Result<Vec<ExportedSymbol>, DumperError> {
        Ok(self.exports.clone())
    }
}

/// A simulated address space: a sparse map of base address -> page bytes,
/// plus a parallel map of base address -> region metadata (protection state).
///
/// Pages are keyed by their own base address and must all share one `page_size`;
/// `query_region`/`read_memory` look up by scanning for the region whose range
/// contains the requested address, same as the live backend would.
#[derive(Debug, Default)]
pub struct FakeProcess {
    pid: u32,
    modules: Vec<FakeModule>,
    regions: Vec<FakeRegion>,
    pages: BTreeMap<u64, Vec<u8>>,
    minidumps_written: std::cell::RefCell<Vec<PathBuf>>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }

    pub fn add_module(&mut self, module: FakeModule) {
        self.modules.push(module);
    }

    pub fn add_region(&mut self, region: FakeRegion) {
        self.regions.push(region);
    }

    /// Writes `data` into the simulated address space starting at `address`,
    /// overwriting any previously written bytes in that range.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) {
        self.pages.insert(address, data.to_vec());
    }

    /// Flips a previously added region's access protection, simulating a
    /// protector lazily decrypting a page once code touches it.
    pub fn unlock_region(&mut self, base_address: u64) {
        if let Some(region) = self.regions.iter_mut().find(|r| r.base_address == base_address) {
            region.no_access = false;
        }
    }

    pub fn minidumps_written(&self) -> Vec<PathBuf> {
        self.minidumps_written.borrow().clone()
    }
}

impl Process for FakeProcess {
    type Module = FakeModule;
    type Region = FakeRegion;

    fn pid(&self) -> u32 {
        self.pid
    }

    fn modules(&self) -> Result<Vec<Self::Module>, DumperError> {
        Ok(self.modules.clone())
    }

    fn find_module(&self, name: Option<&str>) -> Result<Self::Module, DumperError> {
        match name {
            Some(name) => self
                .modules
                .iter()
                .find(|m| m.name.eq_ignore_ascii_case(name))
                .cloned()
                .ok_or_else(|| DumperError::NotFound(name.to_string())),
            None => self
                .modules
                .first()
                .cloned()
                .ok_or_else(|| DumperError::NotFound("<main module>".to_string())),
        }
    }

    fn query_region(&self, address: u64) -> Result<Option<Self::Region>, DumperError> {
        Ok(self
            .regions
            .iter()
            .find(|r| address >= r.base_address && address < r.base_address + r.size as u64)
            .cloned())
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize, DumperError> {
        let region = self.query_region(address)?;
        if let Some(region) = &region {
            if region.no_access || !region.committed {
                return Ok(0);
            }
        }
        match self.pages.iter().find(|(&base, data)| {
            address >= base && address < base + data.len() as u64
        }) {
            Some((&base, data)) => {
                let start = (address - base) as usize;
                let available = data.len().saturating_sub(start);
                let to_copy = available.min(buf.len());
                buf[..to_copy].copy_from_slice(&data[start..start + to_copy]);
                if to_copy < buf.len() {
                    buf[to_copy..].fill(0);
                }
                Ok(to_copy)
            }
            None => {
                buf.fill(0);
                Ok(0)
            }
        }
    }

    fn write_minidump(&self, path: &Path) -> Result<(), DumperError> {
        self.minidumps_written.borrow_mut().push(path.to_path_buf());
        std::fs::write(path, b"FAKE_MINIDUMP").map_err(|source| DumperError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A `CancellationToken` backed by an `Arc<AtomicBool>`, shared between the
/// orchestrator and whatever arms it (a Ctrl-C handler, or a test).
#[derive(Clone, Debug, Default)]
pub struct SharedCancellationToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl SharedCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl CancellationToken for SharedCancellationToken {
    fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_memory_returns_zero_for_no_access_region() {
        let mut process = FakeProcess::new(1234);
        process.add_region(FakeRegion {
            base_address: 0x1000,
            size: 0x1000,
            no_access: true,
            guard: false,
            committed: true,
        });
        process.write_memory(0x1000, &[0xAAu8; 16]);
        let mut buf = [0u8; 16];
        let read = process.read_memory(0x1000, &mut buf).unwrap();
        assert_eq!(read, 0);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn unlock_region_makes_bytes_visible() {
        let mut process = FakeProcess::new(1234);
        process.add_region(FakeRegion {
            base_address: 0x1000,
            size: 0x1000,
            no_access: true,
            guard: false,
            committed: true,
        });
        process.write_memory(0x1000, &[0xAAu8; 16]);
        process.unlock_region(0x1000);
        let mut buf = [0u8; 16];
        let read = process.read_memory(0x1000, &mut buf).unwrap();
        assert_eq!(read, 16);
        assert_eq!(buf, [0xAAu8; 16]);
    }

    #[test]
    fn cancellation_token_observes_cancel() {
        let token = SharedCancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
