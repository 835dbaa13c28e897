use std::io::Read;

use compress::zlib;

use crate::crypto::{check_adler32, fast_decrypt, key_block_info_key, read_be_u32, read_le_u32, salsa20_apply};
use crate::error::{Error, Result};

/// The 4-byte tag prefixing every compressed key/record block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
	Raw,
	Lzo,
	Zlib,
}

impl BlockType {
	fn from_tag(tag: u32) -> Result<Self>
	{
		match tag {
			0 => Ok(BlockType::Raw),
			1 => Ok(BlockType::Lzo),
			2 => Ok(BlockType::Zlib),
			other => Err(Error::UnknownBlockType(other)),
		}
	}
}

/// Injectable LZO1X decompressor, per the "no global codec singletons"
/// design note: the core never assumes LZO support is compiled in.
pub trait LzoDecoder: Send + Sync {
	fn decompress(&self, compressed: &[u8], decompressed_size: usize) -> Result<Vec<u8>>;
}

#[cfg(feature = "lzo")]
#[derive(Debug, Default)]
pub struct RustLzo;

#[cfg(feature = "lzo")]
impl LzoDecoder for RustLzo {
	fn decompress(&self, compressed: &[u8], decompressed_size: usize) -> Result<Vec<u8>>
	{
		let mut out = vec![0u8; decompressed_size];
		let (result, err) = rust_lzo::LZOContext::decompress_to_slice(compressed, &mut out);
		if err != rust_lzo::LZOError::OK {
			return Err(Error::CorruptArchive("lzo decompression failed"));
		}
		Ok(Vec::from(result))
	}
}

#[cfg(feature = "lzo")]
pub(crate) fn default_lzo_decoder() -> Option<Box<dyn LzoDecoder>>
{
	Some(Box::new(RustLzo))
}

#[cfg(not(feature = "lzo"))]
pub(crate) fn default_lzo_decoder() -> Option<Box<dyn LzoDecoder>>
{
	None
}

/// Reads the compress-method nibble out of a block's leading 4-byte tag
/// without decrypting or decompressing anything, for callers (the record
/// indexer) that only need the block type up front.
pub(crate) fn peek_block_type(slice: &[u8]) -> Result<BlockType>
{
	let enc = read_le_u32(&slice[0..4]);
	BlockType::from_tag(enc & 0xf)
}

fn zlib_inflate(data: &[u8]) -> Result<Vec<u8>>
{
	let mut out = Vec::new();
	zlib::Decoder::new(data)
		.read_to_end(&mut out)
		.map_err(|_| Error::CorruptArchive("zlib inflate failed"))?;
	Ok(out)
}

/// Decodes a single key/record block: `[u32 LE enc/compress tag][u32 BE adler32][body]`.
///
/// `slice` must start at the block's 4-byte type tag and contain at least
/// `compressed_size` bytes. Returns exactly `decompressed_size` bytes.
pub(crate) fn decode_block(
	slice: &[u8],
	compressed_size: usize,
	decompressed_size: usize,
	lzo: Option<&dyn LzoDecoder>,
) -> Result<Vec<u8>>
{
	let enc = read_le_u32(&slice[0..4]);
	let checksum_bytes = &slice[4..8];
	let checksum = read_be_u32(checksum_bytes);
	let encryption_method = (enc >> 4) & 0xf;
	let compress_method = enc & 0xf;

	let encrypted = &slice[8..compressed_size];
	let compressed: Vec<u8> = match encryption_method {
		0 => Vec::from(encrypted),
		1 => fast_decrypt(encrypted, &key_block_info_key(checksum_bytes)),
		2 => {
			let mut buf = Vec::from(encrypted);
			salsa20_apply(&key_block_info_key(checksum_bytes), &mut buf);
			buf
		}
		_ => return Err(Error::CorruptArchive("unknown block encryption method")),
	};

	let block_type = BlockType::from_tag(compress_method)?;
	let decompressed = match block_type {
		BlockType::Raw => compressed,
		BlockType::Zlib => zlib_inflate(&compressed)?,
		BlockType::Lzo => {
			let decoder = lzo.ok_or(Error::UnsupportedCompression)?;
			decoder.decompress(&compressed, decompressed_size)?
		}
	};

	check_adler32(&decompressed, checksum, "block")?;
	if decompressed.len() != decompressed_size {
		return Err(Error::CorruptArchive("decompressed block size mismatch"));
	}
	Ok(decompressed)
}
