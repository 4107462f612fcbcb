//! Portable code: image format and entry-point catalog.

pub mod catalog;
pub mod image;

pub use catalog::{load, CodeUnit, EntryPoint, PortableCode};
pub use image::{ImageBuilder, ImageManifest, MethodDef, Op, RawType};
