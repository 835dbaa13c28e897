//! Fixture builder shared by the scenario tests. There is no MDict writer in
//! this crate (out of scope), so every test assembles archive bytes by hand,
//! independently re-deriving the same crypto/compression transforms the
//! reader applies, rather than calling into the crate's private modules.

use adler32::RollingAdler32;
use byteorder::{WriteBytesExt, BE};
use ripemd::{Digest, Ripemd128};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;

/// Routes the crate's `log::debug!`/`log::warn!` diagnostics (brute-force
/// fallback, malformed stylesheet, per-lookup failure) through the test
/// harness's output capture. Safe to call from every test; repeat calls
/// after the first are no-ops.
pub fn init_logging() {
	let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ver {
	V1,
	V2,
}

impl Ver {
	fn width(self) -> usize {
		match self {
			Ver::V1 => 4,
			Ver::V2 => 8,
		}
	}

	fn engine_version(self) -> &'static str {
		match self {
			Ver::V1 => "1.2",
			Ver::V2 => "2.0",
		}
	}

	fn write_number(self, out: &mut Vec<u8>, value: u64) {
		match self {
			Ver::V1 => out.extend_from_slice(&(value as u32).to_be_bytes()),
			Ver::V2 => out.extend_from_slice(&value.to_be_bytes()),
		}
	}
}

fn ripemd128(data: &[u8]) -> [u8; 16] {
	let mut md = Ripemd128::default();
	md.update(data);
	let mut key = [0u8; 16];
	key.copy_from_slice(md.finalize().as_slice());
	key
}

fn widen_key(digest: &[u8; 16]) -> [u8; 32] {
	let mut key = [0u8; 32];
	key[..16].copy_from_slice(digest);
	key[16..].copy_from_slice(digest);
	key
}

pub fn salsa20_apply(key: &[u8; 16], data: &mut [u8]) {
	let wide = widen_key(key);
	let mut cipher = Salsa20::new((&wide).into(), &[0u8; 8].into());
	cipher.apply_keystream(data);
}

fn rotate_nibbles(b: u8) -> u8 {
	(b >> 4) | (b << 4)
}

/// Inverse of the production `fast_decrypt`: turns plaintext into the bytes
/// that `fast_decrypt` (applied with the same key) will turn back into it.
/// `fast_decrypt` threads `previous` through the *ciphertext* byte at each
/// step, so encrypting must be sequential too.
pub fn fast_encrypt(data: &[u8], key: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len());
	let mut previous: u8 = 0x36;
	for (i, &p) in data.iter().enumerate() {
		let c = rotate_nibbles(p ^ previous ^ (i as u8) ^ key[i % key.len()]);
		out.push(c);
		previous = c;
	}
	out
}

/// `RIPEMD128(checksum_bytes || LE u32(0x3695))`, mirrors `crypto::key_block_info_key`.
pub fn key_block_info_key(checksum_bytes: &[u8]) -> [u8; 16] {
	let mut v = Vec::from(checksum_bytes);
	v.extend_from_slice(&0x3695_u32.to_le_bytes());
	ripemd128(&v)
}

/// Mirrors `crypto::derive_passcode_key` for `RegisterBy=EMail` archives.
pub fn derive_email_passcode_key(registration_code: &[u8], email: &str) -> [u8; 16] {
	let utf16le: Vec<u8> = email.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
	let digest = ripemd128(&utf16le);
	let mut encrypt_key = registration_code.to_vec();
	salsa20_apply(&digest, &mut encrypt_key);
	let mut key = [0u8; 16];
	let n = encrypt_key.len().min(16);
	key[..n].copy_from_slice(&encrypt_key[..n]);
	key
}

/// Zlib stream using a single DEFLATE "stored" block — avoids depending on
/// whatever encoder (if any) the `compress` crate exposes.
pub fn zlib_store(data: &[u8]) -> Vec<u8> {
	let mut out = vec![0x78, 0x01, 0x01];
	let len = data.len() as u16;
	out.extend_from_slice(&len.to_le_bytes());
	out.extend_from_slice(&(!len).to_le_bytes());
	out.extend_from_slice(data);
	out.extend_from_slice(&RollingAdler32::from_buffer(data).hash().to_be_bytes());
	out
}

/// Builds a raw/zlib/lzo-tagged block: `[u32 LE tag][u32 BE adler32][body]`.
/// `encryption_method` is the high nibble of the tag (0 = none).
pub fn tagged_block(payload: &[u8], compress: u8, encrypt_method: u8, encrypt_key: Option<&[u8]>) -> Vec<u8> {
	let body = match compress {
		2 => zlib_store(payload),
		_ => payload.to_vec(),
	};
	let checksum = RollingAdler32::from_buffer(payload).hash();
	let tag = ((encrypt_method as u32) << 4) | compress as u32;

	let encrypted_body = match encrypt_method {
		0 => body,
		1 => fast_encrypt(&body, encrypt_key.expect("fast-encrypt key")),
		2 => {
			let mut b = body;
			let key: [u8; 16] = encrypt_key.expect("salsa key").try_into().unwrap();
			salsa20_apply(&key, &mut b);
			b
		}
		_ => panic!("unsupported test encryption method"),
	};

	let mut out = Vec::new();
	out.extend_from_slice(&tag.to_le_bytes());
	out.extend_from_slice(&checksum.to_be_bytes());
	out.extend_from_slice(&encrypted_body);
	out
}

fn encode_key_text(text: &str, utf16: bool) -> Vec<u8> {
	if utf16 {
		text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
	} else {
		text.as_bytes().to_vec()
	}
}

fn key_terminator(utf16: bool) -> Vec<u8> {
	if utf16 {
		vec![0, 0]
	} else {
		vec![0]
	}
}

/// One key-block's decompressed body: `(offset, text, NUL)` repeated.
pub fn key_block_body(version: Ver, utf16: bool, entries: &[(u64, &str)]) -> Vec<u8> {
	let mut buf = Vec::new();
	for (offset, text) in entries {
		version.write_number(&mut buf, *offset);
		buf.extend_from_slice(&encode_key_text(text, utf16));
		buf.extend_from_slice(&key_terminator(utf16));
	}
	buf
}

/// One key-block-info plaintext record: `(entries_in_block, head, tail, compressed_size, decompressed_size)`.
fn key_block_info_record(version: Ver, utf16: bool, entries_in_block: u64, head: &str, tail: &str, compressed_size: u64, decompressed_size: u64) -> Vec<u8> {
	let mut buf = Vec::new();
	version.write_number(&mut buf, entries_in_block);

	let text_size_width = if version == Ver::V2 { 2 } else { 1 };
	let term: usize = if version == Ver::V2 { 1 } else { 0 };
	let unit: usize = if utf16 { 2 } else { 1 };

	let write_text = |buf: &mut Vec<u8>, s: &str| {
		// stored size is the character count alone; the decoder adds `term`
		// units itself when computing how far to skip past the terminator.
		let size = s.chars().count();
		if text_size_width == 1 {
			buf.push(size as u8);
		} else {
			buf.extend_from_slice(&(size as u16).to_be_bytes());
		}
		buf.extend_from_slice(&encode_key_text(s, utf16));
		buf.extend(std::iter::repeat(0u8).take(term * unit));
	};
	write_text(&mut buf, head);
	write_text(&mut buf, tail);

	version.write_number(&mut buf, compressed_size);
	version.write_number(&mut buf, decompressed_size);
	buf
}

pub struct KeyBlockSpec<'a> {
	pub entries: &'a [(u64, &'a str)],
	pub compress: u8,
}

pub struct ArchiveSpec<'a> {
	pub version: Ver,
	pub mdd: bool,
	pub encoding_attr: &'static str,
	pub encrypted: u8,
	pub register_by_email: bool,
	pub passcode_email: Option<&'a str>,
	pub passcode_registration_code: Option<&'a [u8]>,
	pub title: Option<&'a str>,
	pub key_blocks: Vec<KeyBlockSpec<'a>>,
	pub record_payload: Vec<u8>,
	pub record_compress: u8,
	pub corrupt_record_checksum: bool,
	pub corrupt_prelude_checksum: bool,
}

impl<'a> Default for ArchiveSpec<'a> {
	fn default() -> Self {
		ArchiveSpec {
			version: Ver::V2,
			mdd: false,
			encoding_attr: "UTF-8",
			encrypted: 0,
			register_by_email: true,
			passcode_email: None,
			passcode_registration_code: None,
			title: None,
			key_blocks: Vec::new(),
			record_payload: Vec::new(),
			record_compress: 0,
			corrupt_record_checksum: false,
			corrupt_prelude_checksum: false,
		}
	}
}

fn header_xml(spec: &ArchiveSpec) -> String {
	let root = if spec.mdd { "Library_Data" } else { "Dictionary" };
	let encrypted_attr = match spec.encrypted {
		0 => "No".to_string(),
		n => n.to_string(),
	};
	let register_by = if spec.register_by_email { "EMail" } else { "DeviceID" };
	let title = spec.title.unwrap_or("");
	format!(
		r#"<{root} GeneratedByEngineVersion="{ver}" Encrypted="{enc}" Encoding="{encoding}" RegisterBy="{regby}" Title="{title}" Description="d"/>"#,
		root = root,
		ver = spec.version.engine_version(),
		enc = encrypted_attr,
		encoding = spec.encoding_attr,
		regby = register_by,
		title = title,
	)
}

/// Assembles a complete `.mdx`/`.mdd` archive per `spec`, returning its bytes.
pub fn build_archive(spec: &ArchiveSpec) -> Vec<u8> {
	let utf16 = spec.mdd;
	let mut out = Vec::new();

	let xml = header_xml(spec);
	let mut utf16_header: Vec<u8> = xml.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
	utf16_header.extend_from_slice(&[0, 0]);
	let header_checksum = RollingAdler32::from_buffer(&utf16_header).hash();
	out.write_u32::<BE>(utf16_header.len() as u32).unwrap();
	out.extend_from_slice(&utf16_header);
	out.extend_from_slice(&header_checksum.to_le_bytes());

	// ---- key section ----
	let mut compressed_blocks = Vec::new();
	let mut info_plain = Vec::new();
	let mut total_entries: u64 = 0;

	for kb in &spec.key_blocks {
		let body = key_block_body(spec.version, utf16, kb.entries);
		let block = tagged_block(&body, kb.compress, 0, None);
		let head = kb.entries.first().unwrap().1;
		let tail = kb.entries.last().unwrap().1;
		info_plain.extend_from_slice(&key_block_info_record(
			spec.version,
			utf16,
			kb.entries.len() as u64,
			head,
			tail,
			block.len() as u64,
			body.len() as u64,
		));
		total_entries += kb.entries.len() as u64;
		compressed_blocks.push(block);
	}

	let key_block_info_checksum = RollingAdler32::from_buffer(&info_plain).hash();
	let info_compressed = zlib_store(&info_plain);

	let mut key_block_info_blob = Vec::new();
	if spec.version == Ver::V2 {
		key_block_info_blob.extend_from_slice(&[2, 0, 0, 0]);
		key_block_info_blob.extend_from_slice(&key_block_info_checksum.to_be_bytes());
		key_block_info_blob.extend_from_slice(&info_compressed);
	} else {
		key_block_info_blob = info_plain.clone();
	}

	if spec.encrypted & 2 != 0 {
		let key = key_block_info_key(&key_block_info_blob[4..8]);
		let mut scrambled = key_block_info_blob[0..8].to_vec();
		scrambled.extend(fast_encrypt(&key_block_info_blob[8..], &key));
		key_block_info_blob = scrambled;
	}

	let key_block_size: u64 = compressed_blocks.iter().map(|b| b.len() as u64).sum();

	let mut prelude = Vec::new();
	spec.version.write_number(&mut prelude, spec.key_blocks.len() as u64);
	spec.version.write_number(&mut prelude, total_entries);
	if spec.version == Ver::V2 {
		spec.version.write_number(&mut prelude, info_plain.len() as u64);
	}
	spec.version.write_number(&mut prelude, key_block_info_blob.len() as u64);
	spec.version.write_number(&mut prelude, key_block_size);

	let mut prelude_checksum = RollingAdler32::from_buffer(&prelude).hash();
	if spec.corrupt_prelude_checksum {
		prelude_checksum ^= 0xDEAD_BEEF;
	}

	let prelude_bytes = if spec.encrypted & 1 != 0 {
		let email = spec.passcode_email.expect("email required for encrypted&1 fixture");
		let reg_code = spec.passcode_registration_code.expect("registration code required");
		let key = derive_email_passcode_key(reg_code, email);
		let mut block = prelude.clone();
		salsa20_apply(&key, &mut block);
		block
	} else {
		prelude.clone()
	};

	out.extend_from_slice(&prelude_bytes);
	if spec.version == Ver::V2 {
		out.write_u32::<BE>(prelude_checksum).unwrap();
	}
	out.extend_from_slice(&key_block_info_blob);
	for block in &compressed_blocks {
		out.extend_from_slice(block);
	}

	// ---- record section ----
	let mut record_block = tagged_block(&spec.record_payload, spec.record_compress, 0, None);
	if spec.corrupt_record_checksum {
		let last = record_block.len() - 1;
		record_block[last] ^= 0xFF;
	}

	spec.version.write_number(&mut out, 1); // num_record_blocks
	spec.version.write_number(&mut out, total_entries);
	let width = spec.version.width() as u64;
	spec.version.write_number(&mut out, width * 2); // record_block_info_size
	spec.version.write_number(&mut out, record_block.len() as u64); // record_block_size
	spec.version.write_number(&mut out, record_block.len() as u64); // compressed_size
	spec.version.write_number(&mut out, spec.record_payload.len() as u64); // decompressed_size
	out.extend_from_slice(&record_block);

	out
}

pub fn write_temp(name: &str, bytes: &[u8]) -> std::path::PathBuf {
	let path = std::env::temp_dir().join(format!("mdict-scenarios-{}-{}", std::process::id(), name));
	std::fs::write(&path, bytes).unwrap();
	path
}
