//! On-disk image format
//!
//! # Layout
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic           = "NSI!" (4 ASCII bytes)
//!    4      4   format_version  = 1      (BE u32)
//!    8      4   header_length   byte length of the JSON header (BE u32)
//!   12      N   header          UTF-8 JSON object, see [`header::ImageHeader`]
//! 12+N    ...   payload         zlib-compressed tar stream
//! ```
//!
//! `header_length` must be at least 2 (the smallest JSON object) and at
//! most [`HEADER_MAX_BYTES`], so a corrupt length field can never drive a
//! huge allocation. The payload is a tar archive whose entries sit at the
//! archive root; its uncompressed SHA-256 is recorded in the header `hash`
//! field. The compression is the zlib container, not raw DEFLATE and not
//! gzip.

pub mod header;
mod read;
mod write;

pub use header::{ImageHeader, RuntimeSpec};
pub use read::{extract, open, Payload};
pub use write::write;

pub const MAGIC: &[u8; 4] = b"NSI!";
pub const FORMAT_VERSION: u32 = 1;
/// Magic + version + header length.
pub const PREFIX_LEN: usize = 12;
/// Upper bound on the declared header length.
pub const HEADER_MAX_BYTES: u32 = 10 * 1024 * 1024;
/// Extension used for image files produced by the builder.
pub const FILE_EXTENSION: &str = "nsi";
