//! Error types for iSyntax decoding.

use core::fmt;

/// The main error type for iSyntax operations.
#[derive(Debug)]
pub enum Error {
    /// Errors encountered while opening a file. The open fails; the
    /// process is unaffected.
    Open(OpenError),
    /// Errors related to decoding a single codeblock. These are recovered
    /// locally (the affected tile renders blank) and never cross the
    /// public API boundary.
    Decode(DecodeError),
    /// An argument passed to a public function is invalid.
    InvalidArgument(&'static str),
    /// An unrecoverable error the caller should not expect to handle.
    Fatal(&'static str),
}

/// Errors that make an iSyntax file unopenable.
#[derive(Debug)]
pub enum OpenError {
    /// The `0x04` end-of-header marker was not found within the file.
    HeaderTerminatorNotFound,
    /// The XML header is malformed.
    XmlMalformed(&'static str),
    /// A base64 payload failed to decode.
    Base64(&'static str),
    /// The block header table is inconsistent with its declared size.
    BlockTableInconsistent,
    /// The cluster header table is inconsistent (truncated record, bad
    /// template reference, or fewer than two cluster coordinates).
    ClusterTableInconsistent,
    /// The seektable tag was missing or carried an unexpected DICOM tag.
    SeektableInvalid,
    /// A codeblock's data range lies outside the file.
    CodeblockOutOfBounds,
    /// The file contains no whole-slide image.
    NoWsiImage,
    /// The block compression method is not one of the known versions.
    UnknownCompressor(i32),
    /// An underlying I/O error.
    Io(std::io::Error),
}

/// Errors produced while decompressing a single codeblock.
///
/// The Hulsken decoder zero-fills its output on any of these, so callers
/// treat the codeblock as an empty/background block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The codeblock header fields are nonsensical (for example a zero
    /// run counter wider than the bitstream allows).
    InvalidHeader,
    /// The serialized length declared by the codeblock header is larger
    /// than twice the coefficient buffer.
    SerializedLengthTooLarge,
    /// The Huffman table extends past the end of the compressed data.
    HuffmanTableOutOfBounds,
    /// A Huffman code in the message matched no symbol.
    UnknownSymbol,
    /// The bitplane layout disagrees with the channel bitmasks.
    BitplaneMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(e) => write!(f, "{e}"),
            Self::Decode(e) => write!(f, "{e}"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::Fatal(what) => write!(f, "fatal error: {what}"),
        }
    }
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderTerminatorNotFound => {
                write!(f, "end-of-header marker (0x04) not found")
            }
            Self::XmlMalformed(what) => write!(f, "malformed XML header: {what}"),
            Self::Base64(what) => write!(f, "base64 decoding failed: {what}"),
            Self::BlockTableInconsistent => write!(f, "block header table is inconsistent"),
            Self::ClusterTableInconsistent => write!(f, "cluster header table is inconsistent"),
            Self::SeektableInvalid => write!(f, "seektable is missing or invalid"),
            Self::CodeblockOutOfBounds => {
                write!(f, "codeblock data offset lies outside the file")
            }
            Self::NoWsiImage => write!(f, "file contains no whole-slide image"),
            Self::UnknownCompressor(v) => write!(f, "unknown block compression method {v}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid codeblock header"),
            Self::SerializedLengthTooLarge => write!(f, "serialized length too large"),
            Self::HuffmanTableOutOfBounds => {
                write!(f, "Huffman table extends out of bounds")
            }
            Self::UnknownSymbol => write!(f, "unknown symbol in Huffman message"),
            Self::BitplaneMismatch => {
                write!(f, "bitplane layout disagrees with the channel bitmasks")
            }
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for OpenError {}
impl std::error::Error for DecodeError {}

impl From<OpenError> for Error {
    fn from(e: OpenError) -> Self {
        Self::Open(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<std::io::Error> for OpenError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Open(OpenError::Io(e))
    }
}

/// Result type for iSyntax operations.
pub type Result<T> = core::result::Result<T, Error>;

macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

macro_rules! err {
    ($err:expr) => {
        Err($err.into())
    };
}

pub(crate) use bail;
pub(crate) use err;
