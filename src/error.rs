//! Error taxonomy for the dumper pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while reconstructing a PE image from a live process.
///
/// Page-level read failures during harvesting are *not* represented here: the
/// harvester swallows those internally and retries on the next poll (see
/// [`crate::harvester`]). Only failures that abort the whole dump reach this type.
#[derive(Error, Debug)]
pub enum DumperError {
    #[error("process or module not found: {0}")]
    NotFound(String),

    #[error("access denied opening \"{0}\" (missing SeDebugPrivilege?)")]
    AccessDenied(String),

    #[error("malformed PE image: {0}")]
    Malformed(String),

    #[error("section alignment is unset (FileAlignment or SectionAlignment is zero)")]
    AlignmentUnset,

    #[error("section not found: {0}")]
    SectionNotFound(String),

    #[error("dump cancelled before completion")]
    Cancelled,

    #[error("failed to write output file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decryption factor must be in [0.0, 1.0], got {0}")]
    InvalidDecryptionFactor(f32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
