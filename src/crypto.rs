use adler32::RollingAdler32;
use byteorder::{ByteOrder, BE, LE};
use ripemd::{Digest, Ripemd128};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa8;

use crate::error::{Error, Result};

/// RIPEMD-128 digest of arbitrary bytes.
pub(crate) fn ripemd128(data: &[u8]) -> [u8; 16]
{
	let mut md = Ripemd128::default();
	md.update(data);
	let mut key = [0u8; 16];
	key.copy_from_slice(md.finalize().as_slice());
	key
}

#[inline]
pub(crate) fn check_adler32(data: &[u8], checksum: u32, what: &'static str) -> Result<()>
{
	if RollingAdler32::from_buffer(data).hash() != checksum {
		return Err(Error::CorruptArchive(what));
	}
	Ok(())
}

#[inline]
fn rotate_nibbles(b: u8) -> u8
{
	(b >> 4) | (b << 4)
}

/// In-place byte permutation used to obfuscate key-block-info and as one of
/// the record/key block "encryption methods".
pub(crate) fn fast_decrypt(data: &[u8], key: &[u8]) -> Vec<u8>
{
	let mut buf = Vec::from(data);
	let mut previous: u8 = 0x36;
	for i in 0..buf.len() {
		let original = buf[i];
		let mut t = rotate_nibbles(original);
		t = t ^ previous ^ (i as u8) ^ key[i % key.len()];
		previous = original;
		buf[i] = t;
	}
	buf
}

/// `RIPEMD128(checksum_bytes || LE u32(0x3695))`, the key used to
/// `fast_decrypt` the key-block-info blob when `Encrypted & 2`.
pub(crate) fn key_block_info_key(checksum_bytes: &[u8]) -> [u8; 16]
{
	let mut v = Vec::from(checksum_bytes);
	v.extend_from_slice(&0x3695_u32.to_le_bytes());
	ripemd128(&v)
}

/// Applies the key-block-info obfuscation: `block[0:8] || fast_decrypt(block[8:], key)`.
pub(crate) fn mdx_decrypt(block: &[u8]) -> Vec<u8>
{
	let key = key_block_info_key(&block[4..8]);
	let mut out = Vec::with_capacity(block.len());
	out.extend_from_slice(&block[0..8]);
	out.extend(fast_decrypt(&block[8..], &key));
	out
}

/// Widens a RIPEMD-128 digest into the 32-byte key the `salsa20` crate
/// requires, by the standard Salsa20 128-bit-key convention of using the
/// same half twice.
fn widen_key(digest: &[u8; 16]) -> [u8; 32]
{
	let mut key = [0u8; 32];
	key[..16].copy_from_slice(digest);
	key[16..].copy_from_slice(digest);
	key
}

/// Salsa20/8 stream cipher (8 rounds, not the usual 20), encrypt == decrypt,
/// IV is always 8 zero bytes. `key` is a 16-byte RIPEMD-128 digest, widened
/// per [`widen_key`].
pub(crate) fn salsa20_apply(key: &[u8; 16], data: &mut [u8])
{
	let wide = widen_key(key);
	let mut cipher = Salsa8::new((&wide).into(), &[0u8; 8].into());
	cipher.apply_keystream(data);
}

/// Derives the Salsa20 key for the key-section prelude from a user-supplied
/// registration code and identity, per the archive's `RegisterBy` attribute.
pub(crate) fn derive_passcode_key(
	registration_code: &[u8],
	user_id: &[u8],
	register_by_email: bool,
) -> [u8; 16]
{
	let digest = if register_by_email {
		let utf16le: Vec<u8> = String::from_utf8_lossy(user_id)
			.encode_utf16()
			.flat_map(|u| u.to_le_bytes())
			.collect();
		ripemd128(&utf16le)
	} else {
		ripemd128(user_id)
	};
	let mut encrypt_key = vec![0u8; registration_code.len()];
	encrypt_key.copy_from_slice(registration_code);
	salsa20_apply(&digest, &mut encrypt_key);
	let mut key = [0u8; 16];
	let n = encrypt_key.len().min(16);
	key[..n].copy_from_slice(&encrypt_key[..n]);
	key
}

pub(crate) fn read_be_u32(data: &[u8]) -> u32
{
	BE::read_u32(data)
}

pub(crate) fn read_be_u64(data: &[u8]) -> u64
{
	BE::read_u64(data)
}

pub(crate) fn read_le_u32(data: &[u8]) -> u32
{
	LE::read_u32(data)
}
