use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed reading archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt header: {0}")]
    CorruptHeader(&'static str),

    #[error("no GeneratedByEngineVersion attribute in header")]
    NoVersion,

    #[error("invalid GeneratedByEngineVersion value: {0}")]
    InvalidVersion(String),

    #[error("unsupported engine version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid encoding label: {0}")]
    InvalidEncoding(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(&'static str),

    #[error("unknown block type tag: {0}")]
    UnknownBlockType(u32),

    #[error("LZO-compressed block encountered but no LZO decompressor is available")]
    UnsupportedCompression,

    #[error("archive is encrypted and requires a passcode")]
    PasscodeRequired,

    #[error("decryption failed: {0}")]
    DecryptionFailed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
