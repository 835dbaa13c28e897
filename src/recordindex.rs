use std::io::{Read, Seek};

use crate::decompress::{decode_block, peek_block_type, BlockType, LzoDecoder};
use crate::error::{Error, Result};
use crate::header::Version;
use crate::keyindex::{BlockEntryInfo, KeyEntry};

/// Public output of the record indexer: everything [`crate::Archive::lookup`]
/// needs to locate and decode one key's payload.
#[derive(Debug, Clone)]
pub struct IndexRecord {
	pub file_pos: u64,
	pub compressed_size: usize,
	pub decompressed_size: usize,
	pub block_type: BlockType,
	pub record_start: u64,
	pub record_end: u64,
	pub intra_block_offset: u64,
	pub key_text: String,
}

/// Reads the record section's 4-counter header plus its `(compressed_size,
/// decompressed_size)` table. Returns `(infos, record_block_size, num_entries)`.
pub(crate) fn read_record_block_table<R: Read>(
	reader: &mut R,
	version: Version,
) -> Result<(Vec<BlockEntryInfo>, u64, u64)>
{
	let num_record_blocks = version.read_number(reader)?;
	let num_entries = version.read_number(reader)?;
	let record_block_info_size = version.read_number(reader)?;
	let record_block_size = version.read_number(reader)?;

	let width = version.number_width() as u64;
	if num_record_blocks * width * 2 != record_block_info_size {
		return Err(Error::CorruptArchive("record-block-info size mismatch"));
	}

	let mut infos = Vec::with_capacity(num_record_blocks as usize);
	for _ in 0..num_record_blocks {
		let compressed_size = version.read_number(reader)? as usize;
		let decompressed_size = version.read_number(reader)? as usize;
		infos.push(BlockEntryInfo { compressed_size, decompressed_size });
	}
	Ok((infos, record_block_size, num_entries))
}

/// Walks record blocks and the key list together (spec.md §4.4), producing
/// one [`IndexRecord`] per key. When `verify` is set each block is
/// decompressed and its Adler-32/size checked eagerly; otherwise only the
/// block type tag is inspected and the body is skipped over unread.
pub(crate) fn build_index<R: Read + Seek>(
	reader: &mut R,
	keys: &[KeyEntry],
	infos: &[BlockEntryInfo],
	record_block_size: u64,
	verify: bool,
	lzo: Option<&dyn LzoDecoder>,
) -> Result<Vec<IndexRecord>>
{
	let mut out = Vec::with_capacity(keys.len());
	let mut offset: u64 = 0;
	let mut i = 0usize;
	let mut compressed_total: u64 = 0;

	for info in infos {
		let file_pos = reader.stream_position()?;
		let mut body = vec![0u8; info.compressed_size];
		reader.read_exact(&mut body)?;
		if body.len() < 8 {
			return Err(Error::CorruptArchive("record block shorter than its own header"));
		}
		let block_type = peek_block_type(&body)?;
		if verify {
			decode_block(&body, info.compressed_size, info.decompressed_size, lzo)?;
		}

		while i < keys.len() {
			let entry = &keys[i];
			if entry.record_offset < offset {
				return Err(Error::CorruptArchive("key record_offset precedes current block"));
			}
			if entry.record_offset - offset >= info.decompressed_size as u64 {
				break;
			}
			let record_start = entry.record_offset;
			let record_end = if i + 1 < keys.len() {
				keys[i + 1].record_offset
			} else {
				offset + info.decompressed_size as u64
			};
			out.push(IndexRecord {
				file_pos,
				compressed_size: info.compressed_size,
				decompressed_size: info.decompressed_size,
				block_type,
				record_start,
				record_end,
				intra_block_offset: offset,
				key_text: entry.key_text.clone(),
			});
			i += 1;
		}

		offset += info.decompressed_size as u64;
		compressed_total += info.compressed_size as u64;
	}

	if compressed_total != record_block_size {
		return Err(Error::CorruptArchive("record block sizes do not sum to record_block_size"));
	}
	Ok(out)
}
