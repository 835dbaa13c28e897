use std::io::{Read, Seek, SeekFrom};

use byteorder::{ReadBytesExt, BE};
use encoding_rs::{Encoding, UTF_16LE};

use crate::crypto::{check_adler32, mdx_decrypt, salsa20_apply};
use crate::decompress::{decode_block, LzoDecoder};
use crate::error::{Error, Result};
use crate::header::Version;

#[derive(Debug, Clone)]
pub(crate) struct KeyEntry {
	pub(crate) record_offset: u64,
	pub(crate) key_text: String,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockEntryInfo {
	pub(crate) compressed_size: usize,
	pub(crate) decompressed_size: usize,
}

#[derive(Debug)]
pub(crate) struct KeySectionPrelude {
	pub(crate) num_key_blocks: u64,
	pub(crate) num_entries: u64,
	pub(crate) key_block_info_size: u64,
	pub(crate) key_block_size: u64,
}

/// Reads the 5-counter (v2) or 4-counter (v1) prelude, decrypting it first
/// if `Encrypted & 1` is set.
pub(crate) fn read_prelude<R: Read + Seek>(
	reader: &mut R,
	version: Version,
	encrypted: u8,
	passcode_key: Option<&[u8; 16]>,
) -> Result<KeySectionPrelude>
{
	let fields = if version == Version::V2 { 5 } else { 4 };
	let width = version.number_width();
	let mut block = vec![0u8; fields * width];
	reader.read_exact(&mut block)?;

	if encrypted & 1 != 0 {
		let key = passcode_key.ok_or(Error::PasscodeRequired)?;
		salsa20_apply(key, &mut block);
	}

	if version == Version::V2 {
		let checksum = reader.read_u32::<BE>()?;
		if encrypted & 1 != 0 {
			// a prelude checksum mismatch here almost always means the
			// supplied passcode decrypted it to garbage, not that the bytes
			// on disk are themselves corrupt.
			check_adler32(&block, checksum, "key section prelude")
				.map_err(|_| Error::DecryptionFailed("key section prelude checksum mismatch after decrypt"))?;
		} else {
			check_adler32(&block, checksum, "key section prelude")?;
		}
	}

	let mut offset = 0usize;
	let mut next = || {
		let v = version.read_number_from(&block[offset..]);
		offset += width;
		v
	};
	let num_key_blocks = next();
	let num_entries = next();
	if version == Version::V2 {
		let _key_block_info_decompressed_size = next();
	}
	let key_block_info_size = next();
	let key_block_size = next();

	Ok(KeySectionPrelude {
		num_key_blocks,
		num_entries,
		key_block_info_size,
		key_block_size,
	})
}

/// Unwraps a raw key-block-info blob (the `[02 00 00 00][adler32][zlib
/// body]` wrapper for v2, or plain bytes for v1) into the decoded record
/// stream [`decode_key_block_info`] expects. Shared by the primary read path
/// and the brute-force scanner, exactly as the reference reader's single
/// `_decode_key_block_info` routine handles both callers.
fn unwrap_key_block_info(raw: Vec<u8>, version: Version, encrypted: u8) -> Result<Vec<u8>>
{
	if version == Version::V1 {
		return Ok(raw);
	}

	if raw.len() < 8 || raw[0..4] != [2, 0, 0, 0] {
		return Err(Error::CorruptArchive("key-block-info missing v2 tag"));
	}
	let checksum = BE::read_u32(&raw[4..8]);

	let decrypted = if encrypted & 2 != 0 {
		mdx_decrypt(&raw)
	} else {
		raw
	};

	let mut info = Vec::new();
	compress::zlib::Decoder::new(&decrypted[8..])
		.read_to_end(&mut info)
		.map_err(|_| Error::CorruptArchive("key-block-info zlib inflate failed"))?;
	check_adler32(&info, checksum, "key-block-info")?;
	Ok(info)
}

/// Reads, decompresses and decrypts the key-block-info blob, returning it
/// ready for [`decode_key_block_info`].
pub(crate) fn read_key_block_info_blob<R: Read>(
	reader: &mut R,
	size: u64,
	version: Version,
	encrypted: u8,
) -> Result<Vec<u8>>
{
	let mut raw = vec![0u8; size as usize];
	reader.read_exact(&mut raw)?;
	unwrap_key_block_info(raw, version, encrypted)
}

/// Walks the decoded key-block-info records, per spec.md §4.3 steps 1-6.
pub(crate) fn decode_key_block_info(
	data: &[u8],
	version: Version,
	encoding: &'static Encoding,
) -> Result<(Vec<BlockEntryInfo>, u64)>
{
	let width = version.number_width();
	let byte_width = if version == Version::V2 { 2 } else { 1 };
	let term: usize = if version == Version::V2 { 1 } else { 0 };
	let unit: usize = if encoding == UTF_16LE { 2 } else { 1 };

	let mut infos = Vec::new();
	let mut total_entries: u64 = 0;
	let mut slice = data;

	let read_text_size = |slice: &[u8]| -> usize {
		if byte_width == 1 {
			slice[0] as usize
		} else {
			byteorder::BE::read_u16(slice) as usize
		}
	};

	while !slice.is_empty() {
		if slice.len() < width {
			return Err(Error::CorruptArchive("truncated key-block-info record"));
		}
		let entries_in_block = version.read_number_from(slice);
		slice = &slice[width..];

		if slice.len() < byte_width {
			return Err(Error::CorruptArchive("truncated key-block-info head text size"));
		}
		let head_size = read_text_size(slice);
		slice = &slice[byte_width..];
		let skip = (head_size + term) * unit;
		slice = slice.get(skip..).ok_or(Error::CorruptArchive("key-block-info head text overruns buffer"))?;

		if slice.len() < byte_width {
			return Err(Error::CorruptArchive("truncated key-block-info tail text size"));
		}
		let tail_size = read_text_size(slice);
		slice = &slice[byte_width..];
		let skip = (tail_size + term) * unit;
		slice = slice.get(skip..).ok_or(Error::CorruptArchive("key-block-info tail text overruns buffer"))?;

		if slice.len() < width * 2 {
			return Err(Error::CorruptArchive("truncated key-block-info sizes"));
		}
		let compressed_size = version.read_number_from(slice) as usize;
		slice = &slice[width..];
		let decompressed_size = version.read_number_from(slice) as usize;
		slice = &slice[width..];

		total_entries += entries_in_block;
		infos.push(BlockEntryInfo { compressed_size, decompressed_size });
	}

	Ok((infos, total_entries))
}

/// Decompresses every key block and splits each into `(record_offset, key_text)` pairs.
pub(crate) fn read_key_blocks<R: Read>(
	reader: &mut R,
	size: u64,
	version: Version,
	encoding: &'static Encoding,
	infos: &[BlockEntryInfo],
	lzo: Option<&dyn LzoDecoder>,
) -> Result<Vec<KeyEntry>>
{
	let mut data = vec![0u8; size as usize];
	reader.read_exact(&mut data)?;

	let mut entries = Vec::new();
	let mut slice = data.as_slice();
	for info in infos {
		if slice.len() < info.compressed_size {
			return Err(Error::CorruptArchive("key block shorter than declared compressed size"));
		}
		let decompressed = decode_block(slice, info.compressed_size, info.decompressed_size, lzo)?;
		slice = &slice[info.compressed_size..];
		split_key_block(&decompressed, version, encoding, &mut entries)?;
	}
	Ok(entries)
}

fn split_key_block(
	data: &[u8],
	version: Version,
	encoding: &'static Encoding,
	out: &mut Vec<KeyEntry>,
) -> Result<()>
{
	let width = version.number_width();
	let unit: usize = if encoding == UTF_16LE { 2 } else { 1 };

	let mut slice = data;
	while !slice.is_empty() {
		if slice.len() < width {
			return Err(Error::CorruptArchive("truncated key entry offset"));
		}
		let record_offset = version.read_number_from(slice);
		slice = &slice[width..];

		let mut idx = 0;
		loop {
			if idx + unit > slice.len() {
				return Err(Error::CorruptArchive("key entry missing NUL terminator"));
			}
			if slice[idx..idx + unit].iter().all(|b| *b == 0) {
				break;
			}
			idx += unit;
		}
		let (text, _, _) = encoding.decode(&slice[..idx]);
		let key_text = text.trim().to_string();
		slice = &slice[idx + unit..];

		out.push(KeyEntry { record_offset, key_text });
	}
	Ok(())
}

/// Recovery scan used when the prelude is unreadable (corrupt checksum,
/// failed decrypt, or an assertion elsewhere in the primary path).
///
/// Re-seeks to `key_section_offset`, skips the prelude, then scans forward
/// in 1 KiB chunks for the marker that opens the first key block. The
/// marker assumes the first key block is zlib-compressed for v2 archives
/// (LZO for v1) — the same assumption the reference reader's brute-force
/// scan makes; it is a best-effort recovery, not a general parser. The
/// recovered key-block-info blob still needs the v2 decrypt+inflate
/// pipeline applied, via [`unwrap_key_block_info`], before it can be walked
/// by [`decode_key_block_info`].
pub(crate) fn brute_force_recover<R: Read + Seek>(
	reader: &mut R,
	key_section_offset: u64,
	version: Version,
	encrypted: u8,
	encoding: &'static Encoding,
	lzo: Option<&dyn LzoDecoder>,
) -> Result<Vec<KeyEntry>>
{
	reader.seek(SeekFrom::Start(key_section_offset))?;
	// v2: 5 BE-u64 prelude fields + the prelude's own 4-byte Adler-32 checksum.
	// v1 has no checksum field, just the 4 BE-u32 prelude fields.
	let skip = if version == Version::V2 { 8 * 5 + 4 } else { 4 * 4 };
	let mut skipped = vec![0u8; skip];
	reader.read_exact(&mut skipped)?;

	let marker: [u8; 4] = if version == Version::V2 {
		[2, 0, 0, 0]
	} else {
		[1, 0, 0, 0]
	};

	let mut info_blob = vec![0u8; 8];
	reader.read_exact(&mut info_blob)?;
	if version == Version::V2 && info_blob[0..4] != marker {
		return Err(Error::CorruptArchive("brute force: key-block-info missing v2 tag"));
	}

	loop {
		let chunk_start = reader.stream_position()?;
		let mut chunk = [0u8; 1024];
		let n = reader.read(&mut chunk)?;
		if n == 0 {
			return Err(Error::CorruptArchive("brute force: key block marker not found"));
		}
		if let Some(idx) = find_marker(&chunk[..n], &marker) {
			info_blob.extend_from_slice(&chunk[..idx]);
			reader.seek(SeekFrom::Start(chunk_start + idx as u64))?;
			break;
		} else {
			info_blob.extend_from_slice(&chunk[..n]);
		}
	}

	let info_blob = unwrap_key_block_info(info_blob, version, encrypted)?;
	let (infos, recovered_entries) = decode_key_block_info(&info_blob, version, encoding)?;
	let _ = recovered_entries;
	let key_block_size: u64 = infos.iter().map(|i| i.compressed_size as u64).sum();

	let entries = read_key_blocks(reader, key_block_size, version, encoding, &infos, lzo)?;
	Ok(entries)
}

fn find_marker(haystack: &[u8], marker: &[u8; 4]) -> Option<usize>
{
	haystack.windows(4).position(|w| w == marker)
}
