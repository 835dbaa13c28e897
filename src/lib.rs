mod archive;
mod crypto;
mod decompress;
mod error;
mod header;
mod keyindex;
mod recordindex;

pub use crate::archive::{Archive, ArchiveBuilder, IndexTable, Meta, Mode, Payload};
pub use crate::decompress::{BlockType, LzoDecoder};
pub use crate::error::{Error, Result};
pub use crate::header::StylesheetEntry;
pub use crate::recordindex::IndexRecord;

#[cfg(feature = "lzo")]
pub use crate::decompress::RustLzo;
