//! PE32+ structure parsing and rebuilding: the part of this crate that knows
//! nothing about processes, only about bytes.

pub mod image;
pub mod import_directory;
pub mod section_table;

pub use image::PeImage;
pub use import_directory::{ImportDirectory, ImportedFunction, ImportedModule};
pub use section_table::{SectionHeader, SectionTable};
