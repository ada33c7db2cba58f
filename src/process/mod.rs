//! Collaborator contracts between the reconstruction pipeline and "some
//! process we can read memory from". Grounded in `original_source/include/dumper.hpp`,
//! which hard-codes `syscalls.h`'s direct `NtReadVirtualMemory`/`NtQueryVirtualMemory`
//! calls throughout `dumper.cpp`. That works in C++ because the whole program
//! only ever targets a live Windows process. Rust's trait system lets the same
//! harvesting/import-resolution/exception-sanitizing logic run against either
//! a real OS process (behind `cfg(windows)`) or an in-memory fake used by
//! tests on any platform (SPEC_FULL §4.8).

#[cfg(windows)]
pub mod live;

pub mod fake;

use std::path::Path;

use crate::error::DumperError;

/// A contiguous range of a process's address space, as returned by a
/// `VirtualQueryEx`-style query.
pub trait Region {
    fn base_address(&self) -> u64;
    fn size(&self) -> usize;
    /// `PAGE_NOACCESS`: a protector typically starts every page this way and
    /// swaps it for real protection only once code actually touches it.
    fn is_no_access(&self) -> bool;
    fn is_guard(&self) -> bool;
    fn is_committed(&self) -> bool;
}

/// One loaded module (EXE or DLL) inside a process.
pub trait Module {
    fn base_address(&self) -> u64;
    fn size(&self) -> usize;
    fn name(&self) -> &str;
    fn path(&self) -> Option<&Path>;

    /// The module's exported functions, as absolute addresses. Used by the
    /// import resolver to match scrambled pointers found in `.rdata` against
    /// the export tables of every module loaded in the target process
    /// (SPEC_FULL §4.5, Step A).
    fn exports(&self) -> Result<Vec<ExportedSymbol>, DumperError>;
}

/// One entry of a module's export directory, resolved to an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedSymbol {
    pub address: u64,
    pub module_name: String,
    pub name: String,
}

/// A cooperatively cancellable token shared between the orchestrator and
/// whatever installs a Ctrl-C/Ctrl-Break handler.
pub trait CancellationToken: Clone + Send + Sync + 'static {
    fn is_cancelled(&self) -> bool;
}

/// The live or simulated process a dump is being harvested from.
pub trait Process {
    type Module: Module;
    type Region: Region;

    fn pid(&self) -> u32;

    /// Enumerates the process's loaded modules.
    fn modules(&self) -> Result<Vec<Self::Module>, DumperError>;

    /// Finds a loaded module by name (case-insensitive), defaulting to the
    /// process's main executable module when `name` is `None`.
    fn find_module(&self, name: Option<&str>) -> Result<Self::Module, DumperError>;

    /// Returns the memory region containing `address`, if any is mapped
    /// there.
    fn query_region(&self, address: u64) -> Result<Option<Self::Region>, DumperError>;

    /// Reads up to `buf.len()` bytes starting at `address`, returning the
    /// number of bytes actually read. Callers treat a short read the same as
    /// the original tool does: log and move on rather than abort the dump.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize, DumperError>;

    /// Writes a minidump of the process to `path` (`MiniDumpWriteDump` on
    /// Windows). Optional: not every backend supports it.
    fn write_minidump(&self, path: &Path) -> Result<(), DumperError>;
}
