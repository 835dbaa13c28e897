use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;

use crate::crypto::derive_passcode_key;
use crate::decompress::{decode_block, default_lzo_decoder, LzoDecoder};
use crate::error::{Error, Result};
use crate::header::{read_header, Header, StylesheetEntry};
use crate::keyindex::{
	brute_force_recover, decode_key_block_info, read_key_block_info_blob, read_key_blocks, read_prelude, KeyEntry,
};
use crate::recordindex::{build_index, read_record_block_table, IndexRecord};

type FileReader = BufReader<File>;

const DEFAULT_CACHE_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Mdx,
	Mdd,
}

impl Mode {
	fn from_path(path: &Path) -> Result<Self> {
		match path.extension().and_then(OsStr::to_str).map(str::to_ascii_lowercase).as_deref() {
			Some("mdd") => Ok(Mode::Mdd),
			Some("mdx") => Ok(Mode::Mdx),
			_ => Err(Error::CorruptHeader("archive path must end in .mdx or .mdd")),
		}
	}
}

/// A looked-up payload: `.mdx` keys decode as text, `.mdd` keys stay binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
	Text(String),
	Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Meta {
	pub encoding: String,
	pub stylesheet: Vec<StylesheetEntry>,
	pub title: Option<String>,
	pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexTable {
	pub records: Vec<IndexRecord>,
	pub meta: Meta,
}

/// Builds an [`Archive`], mirroring the teacher's `MDictBuilder` pattern.
pub struct ArchiveBuilder {
	path: PathBuf,
	encoding_override: Option<&'static Encoding>,
	passcode: Option<(Vec<u8>, Vec<u8>)>,
	verify_blocks: bool,
	lzo: Option<Box<dyn LzoDecoder>>,
	cache_capacity: usize,
}

impl ArchiveBuilder {
	pub fn new(path: impl AsRef<Path>) -> Self {
		ArchiveBuilder {
			path: path.as_ref().to_path_buf(),
			encoding_override: None,
			passcode: None,
			verify_blocks: true,
			lzo: default_lzo_decoder(),
			cache_capacity: DEFAULT_CACHE_CAP,
		}
	}

	/// Overrides the header's declared `Encoding` attribute.
	pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
		self.encoding_override = Some(encoding);
		self
	}

	/// Supplies `(registration_code, user_id)` for `Encrypted & 1` archives.
	pub fn passcode(mut self, registration_code: impl Into<Vec<u8>>, user_id: impl Into<Vec<u8>>) -> Self {
		self.passcode = Some((registration_code.into(), user_id.into()));
		self
	}

	/// Controls whether `index()` eagerly decompresses and checksums every
	/// record block (`true`, the default) or only inspects block-type tags.
	pub fn verify_blocks(mut self, verify: bool) -> Self {
		self.verify_blocks = verify;
		self
	}

	/// Overrides the injected LZO1X decompressor (see [`LzoDecoder`]).
	pub fn lzo_decoder(mut self, decoder: Box<dyn LzoDecoder>) -> Self {
		self.lzo = Some(decoder);
		self
	}

	/// Bounds the in-memory record-block memoization (spec.md §5: an
	/// implementation freedom, not a contract). Zero disables caching.
	pub fn cache_capacity(mut self, capacity: usize) -> Self {
		self.cache_capacity = capacity;
		self
	}

	pub fn open(self) -> Result<Archive> {
		open_archive(self)
	}
}

/// An opened MDict archive. Header, key index and record index are parsed
/// once and held immutably; the file handle itself is reopened per read.
pub struct Archive {
	mode: Mode,
	path: PathBuf,
	encoding: &'static Encoding,
	meta: Meta,
	keys: Vec<KeyEntry>,
	index: Vec<IndexRecord>,
	lzo: Option<Box<dyn LzoDecoder>>,
	cache: RecordCache,
}

struct RecordCache {
	entries: HashMap<u64, Vec<u8>>,
	order: VecDeque<u64>,
	capacity: usize,
}

impl RecordCache {
	fn new(capacity: usize) -> Self {
		RecordCache { entries: HashMap::new(), order: VecDeque::new(), capacity }
	}

	fn get(&self, file_pos: u64) -> Option<&Vec<u8>> {
		self.entries.get(&file_pos)
	}

	fn insert(&mut self, file_pos: u64, data: Vec<u8>) {
		if self.capacity == 0 {
			return;
		}
		if !self.entries.contains_key(&file_pos) {
			if self.order.len() >= self.capacity {
				if let Some(evicted) = self.order.pop_front() {
					self.entries.remove(&evicted);
				}
			}
			self.order.push_back(file_pos);
		}
		self.entries.insert(file_pos, data);
	}
}

fn open_reader(path: &Path) -> Result<FileReader> {
	Ok(BufReader::new(File::open(path)?))
}

struct KeySection {
	header: Header,
	keys: Vec<KeyEntry>,
	num_entries_from_prelude: Option<u64>,
}

fn read_key_section(
	reader: &mut FileReader,
	key_section_offset: u64,
	header: Header,
	passcode: &Option<(Vec<u8>, Vec<u8>)>,
	lzo: Option<&dyn LzoDecoder>,
) -> Result<KeySection> {
	let passcode_key = if header.encrypted & 1 != 0 {
		let (reg_code, user_id) = passcode.as_ref().ok_or(Error::PasscodeRequired)?;
		Some(derive_passcode_key(reg_code, user_id, header.register_by_email))
	} else {
		None
	};

	let prelude = read_prelude(reader, header.version, header.encrypted, passcode_key.as_ref());
	let primary = prelude.and_then(|prelude| {
		let info_blob = read_key_block_info_blob(reader, prelude.key_block_info_size, header.version, header.encrypted)?;
		let (infos, total_entries) = decode_key_block_info(&info_blob, header.version, header.encoding)?;
		if total_entries != prelude.num_entries {
			return Err(Error::CorruptArchive("key-block-info entry count disagrees with prelude"));
		}
		if infos.len() as u64 != prelude.num_key_blocks {
			return Err(Error::CorruptArchive("key-block-info block count disagrees with prelude"));
		}
		let keys = read_key_blocks(reader, prelude.key_block_size, header.version, header.encoding, &infos, lzo)?;
		Ok((keys, prelude.num_entries))
	});

	match primary {
		Ok((keys, num_entries)) => Ok(KeySection { header, keys, num_entries_from_prelude: Some(num_entries) }),
		Err(primary_err) => {
			log::debug!("primary key-section read failed ({primary_err}), attempting brute-force recovery");
			match brute_force_recover(reader, key_section_offset, header.version, header.encrypted, header.encoding, lzo) {
				Ok(keys) => {
					log::warn!("recovered {} keys via brute-force scan after: {primary_err}", keys.len());
					Ok(KeySection { header, keys, num_entries_from_prelude: None })
				}
				Err(_fallback_err) => Err(primary_err),
			}
		}
	}
}

fn open_archive(builder: ArchiveBuilder) -> Result<Archive> {
	let mode = Mode::from_path(&builder.path)?;
	let mut reader = open_reader(&builder.path)?;

	let force_utf16 = mode == Mode::Mdd;
	let mut header = read_header(&mut reader, force_utf16)?;
	if let Some(encoding) = builder.encoding_override {
		header.encoding = encoding;
	}
	let key_section_offset = reader.stream_position()?;

	let lzo_ref = builder.lzo.as_deref();
	let section = read_key_section(&mut reader, key_section_offset, header, &builder.passcode, lzo_ref)?;
	let header = section.header;

	let (record_infos, record_block_size, num_entries_in_record_section) =
		read_record_block_table(&mut reader, header.version)?;
	if let Some(expected) = section.num_entries_from_prelude {
		if num_entries_in_record_section != expected {
			return Err(Error::CorruptArchive("record section entry count disagrees with key section"));
		}
	}

	let index = build_index(
		&mut reader,
		&section.keys,
		&record_infos,
		record_block_size,
		builder.verify_blocks,
		lzo_ref,
	)?;

	let meta = Meta {
		encoding: header.encoding.name().to_string(),
		stylesheet: header.stylesheet.clone(),
		title: header.title.clone(),
		description: header.description.clone(),
	};

	Ok(Archive {
		mode,
		path: builder.path,
		encoding: header.encoding,
		meta,
		keys: section.keys,
		index,
		lzo: builder.lzo,
		cache: RecordCache::new(builder.cache_capacity),
	})
}

impl Archive {
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		ArchiveBuilder::new(path).open()
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	pub fn mode(&self) -> Mode {
		self.mode
	}

	pub fn keys(&self) -> impl Iterator<Item = &str> {
		self.keys.iter().map(|k| k.key_text.as_str())
	}

	pub fn index(&self) -> IndexTable {
		IndexTable { records: self.index.clone(), meta: self.meta.clone() }
	}

	/// Resolves `key` to every matching payload, in file order (duplicate
	/// keys are preserved, not deduplicated — spec.md §9 Open Question).
	pub fn lookup(&mut self, key: &str) -> Result<Vec<Payload>> {
		let matches: Vec<IndexRecord> = self
			.index
			.iter()
			.filter(|r| r.key_text == key)
			.cloned()
			.collect();

		let mut out = Vec::with_capacity(matches.len());
		for record in &matches {
			match self.fetch_payload(record) {
				Ok(payload) => out.push(payload),
				Err(err) => {
					log::warn!("lookup({key:?}) failed on block at {}: {err}", record.file_pos);
					return Err(err);
				}
			}
		}
		Ok(out)
	}

	fn fetch_payload(&mut self, record: &IndexRecord) -> Result<Payload> {
		let decompressed = self.fetch_block(record)?;
		let start = (record.record_start - record.intra_block_offset) as usize;
		let end = (record.record_end - record.intra_block_offset) as usize;
		if end > decompressed.len() || start > end {
			return Err(Error::CorruptArchive("record bounds outside decompressed block"));
		}
		let slice = &decompressed[start..end];
		match self.mode {
			Mode::Mdd => Ok(Payload::Bytes(slice.to_vec())),
			Mode::Mdx => {
				let (text, _, _) = self.encoding.decode(slice);
				Ok(Payload::Text(text.into_owned()))
			}
		}
	}

	fn fetch_block(&mut self, record: &IndexRecord) -> Result<Vec<u8>> {
		if let Some(cached) = self.cache.get(record.file_pos) {
			return Ok(cached.clone());
		}
		let mut reader = open_reader(&self.path)?;
		reader.seek(SeekFrom::Start(record.file_pos))?;
		let mut body = vec![0u8; record.compressed_size];
		reader.read_exact(&mut body)?;
		let decompressed = decode_block(&body, record.compressed_size, record.decompressed_size, self.lzo.as_deref())?;
		self.cache.insert(record.file_pos, decompressed.clone());
		Ok(decompressed)
	}

	/// For `.mdd` archives: reads a resource file adjacent to the archive
	/// rather than through the record stream, matching the teacher's
	/// `Mdx::get_resource` escape hatch for assets not embedded in the
	/// container. Callers translating URL paths must swap `/` for `\`.
	pub fn get_resource_file(&self, relative_path: &str) -> Result<Vec<u8>> {
		let cwd = self.path.parent().ok_or(Error::CorruptHeader("archive has no parent directory"))?;
		Ok(std::fs::read(cwd.join(relative_path.trim_start_matches('\\')))?)
	}
}
