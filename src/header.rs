use std::collections::HashMap;
use std::io::{Read, Seek};

use byteorder::{ReadBytesExt, BE, LE};
use encoding_rs::Encoding;
use regex::Regex;

use crate::crypto::check_adler32;
use crate::error::{Error, Result};

/// Selects counter width and key-block-info record shape; modeled as a
/// tagged variant rather than threading `version >= 2` checks everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Version {
	V1,
	V2,
}

impl Version {
	pub(crate) fn from_engine_version(version_str: &str) -> Result<Self>
	{
		let leading = version_str
			.trim()
			.chars()
			.next()
			.ok_or_else(|| Error::InvalidVersion(version_str.to_owned()))?;
		match leading {
			'1' => Ok(Version::V1),
			'2' => Ok(Version::V2),
			_ => Err(Error::UnsupportedVersion(version_str.to_owned())),
		}
	}

	#[inline]
	pub(crate) fn number_width(self) -> usize
	{
		match self {
			Version::V1 => 4,
			Version::V2 => 8,
		}
	}

	#[inline]
	pub(crate) fn read_number<R: Read>(self, reader: &mut R) -> Result<u64>
	{
		Ok(match self {
			Version::V1 => reader.read_u32::<BE>()? as u64,
			Version::V2 => reader.read_u64::<BE>()?,
		})
	}

	#[inline]
	pub(crate) fn read_number_from(self, data: &[u8]) -> u64
	{
		match self {
			Version::V1 => BE::read_u32(data) as u64,
			Version::V2 => BE::read_u64(data),
		}
	}
}

#[derive(Debug, Clone)]
pub struct StylesheetEntry {
	pub name: String,
	pub prefix: String,
	pub suffix: String,
}

#[derive(Debug)]
pub(crate) struct Header {
	pub(crate) version: Version,
	pub(crate) encrypted: u8,
	pub(crate) encoding: &'static Encoding,
	pub(crate) register_by_email: bool,
	pub(crate) title: Option<String>,
	pub(crate) description: Option<String>,
	pub(crate) stylesheet: Vec<StylesheetEntry>,
}

fn unescape(value: &str) -> String
{
	value
		.replace("&lt;", "<")
		.replace("&gt;", ">")
		.replace("&quot;", "\"")
		.replace("&amp;", "&")
}

fn parse_attributes(text: &str) -> HashMap<String, String>
{
	let re = Regex::new(r#"(?s)(\w+)="(.*?)""#).unwrap();
	let mut attrs = HashMap::new();
	for cap in re.captures_iter(text) {
		attrs.insert(cap[1].to_string(), unescape(&cap[2]));
	}
	attrs
}

/// Normalizes a declared `Encoding` attribute, per Design Notes §9: a fixed
/// lookup table, not runtime introspection.
fn normalize_encoding(label: &str) -> Result<&'static Encoding>
{
	let upper = label.trim().to_ascii_uppercase();
	let normalized = match upper.as_str() {
		"GBK" | "GB2312" => "GB18030",
		"" => "UTF-8",
		other => other,
	};
	Encoding::for_label(normalized.as_bytes()).ok_or_else(|| Error::InvalidEncoding(label.to_owned()))
}

fn parse_stylesheet(raw: &str) -> Vec<StylesheetEntry>
{
	let lines: Vec<&str> = raw.lines().collect();
	let mut entries = Vec::new();
	let mut triples = lines.chunks_exact(3);
	for triple in &mut triples {
		entries.push(StylesheetEntry {
			name: triple[0].to_string(),
			prefix: triple[1].to_string(),
			suffix: triple[2].to_string(),
		});
	}
	if !triples.remainder().is_empty() {
		log::warn!("malformed StyleSheet attribute: trailing lines do not form a complete triple, truncated");
	}
	entries
}

/// Reads and verifies the header block, returning the parsed attributes and
/// the reader position immediately after it (the key-section offset).
pub(crate) fn read_header<R: Read + Seek>(reader: &mut R, force_utf16: bool) -> Result<Header>
{
	let header_size = reader.read_u32::<BE>()?;
	let mut info_buf = vec![0u8; header_size as usize];
	reader.read_exact(&mut info_buf)?;
	let checksum = reader.read_u32::<LE>()?;
	check_adler32(&info_buf, checksum, "header")?;

	// last 2 bytes are a UTF-16LE NUL terminator, not part of the XML-ish text
	let text_bytes = if info_buf.len() >= 2 {
		&info_buf[..info_buf.len() - 2]
	} else {
		&info_buf[..]
	};
	let text = encoding_rs::UTF_16LE.decode(text_bytes).0;
	let attrs = parse_attributes(&text);

	let version_str = attrs.get("GeneratedByEngineVersion").ok_or(Error::NoVersion)?;
	let version = Version::from_engine_version(version_str)?;

	let encrypted = attrs
		.get("Encrypted")
		.map(|v| v.trim())
		.and_then(|v| match v {
			"" | "No" => Some(0u8),
			"Yes" => Some(1u8),
			other => other.parse().ok(),
		})
		.unwrap_or(0);

	let encoding = if force_utf16 {
		encoding_rs::UTF_16LE
	} else if let Some(label) = attrs.get("Encoding") {
		normalize_encoding(label)?
	} else {
		encoding_rs::UTF_8
	};

	let register_by_email = attrs
		.get("RegisterBy")
		.map(|v| v.trim() == "EMail")
		.unwrap_or(true);

	let stylesheet = attrs
		.get("StyleSheet")
		.map(|s| parse_stylesheet(s))
		.unwrap_or_default();

	Ok(Header {
		version,
		encrypted,
		encoding,
		register_by_email,
		title: attrs.get("Title").cloned(),
		description: attrs.get("Description").cloned(),
		stylesheet,
	})
}
