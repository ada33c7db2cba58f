//! Reconstructs a loadable PE32+ image from the live memory of a protected
//! process: lazily-decrypted code pages are harvested page by page, a
//! stripped or obfuscated import table is rediscovered and rebuilt, and the
//! exception directory is pruned of entries the unwinder can't walk.
//!
//! The pipeline (see [`orchestrator::run`]) is: snapshot the module's mapped
//! header, harvest every section, optionally reconstruct imports, sanitize
//! exceptions, optionally rebase, optionally write a minidump, finalize.

pub mod consts;
pub mod error;
pub mod exception_sanitizer;
pub mod harvester;
pub mod import_resolver;
pub mod orchestrator;
pub mod pe;
pub mod process;

#[cfg(test)]
pub(crate) mod tests_support;

pub use error::DumperError;
pub use exception_sanitizer::ExceptionSanitizer;
pub use harvester::Harvester;
pub use import_resolver::ImportResolver;
pub use orchestrator::{DumpRequest, DumpState};
pub use pe::PeImage;
