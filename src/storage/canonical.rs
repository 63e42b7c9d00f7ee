//! Canonical byte encoding of stored objects.
//!
//! Every object written to the store has exactly one byte representation, and
//! its content ID is the SHA-256 of that representation framed with a header:
//!
//! ```text
//! "<kind> <payload length>\0" <payload>
//! ```
//!
//! Types that live in the store implement [`Canonical`] explicitly; the field
//! order and separators are part of the type, not discovered at runtime.

use std::fmt;

use thiserror::Error;

/// the three kinds of stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blob" => Some(ObjectKind::Blob),
            "tree" => Some(ObjectKind::Tree),
            "commit" => Some(ObjectKind::Commit),
            _ => None,
        }
    }

    /// the frame header that precedes a payload of `len` bytes
    pub fn header(&self, len: u64) -> Vec<u8> {
        format!("{} {}\0", self.as_str(), len).into_bytes()
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// why a payload could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// A type with a single, deterministic byte encoding.
///
/// `decode(encode(x)) == x` must hold, and two equal values must encode to
/// identical bytes.
pub trait Canonical: Sized {
    /// the object kind written into the frame header
    const KIND: ObjectKind;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;
}

/// Split a framed object into its kind and payload, checking the declared length.
pub fn parse_frame(bytes: &[u8]) -> Result<(ObjectKind, &[u8]), DecodeError> {
    let nul = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| DecodeError::new("missing header terminator"))?;
    let header = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| DecodeError::new("header is not utf-8"))?;
    let (kind, len) = header
        .split_once(' ')
        .ok_or_else(|| DecodeError::new("malformed header"))?;
    let kind = ObjectKind::parse(kind)
        .ok_or_else(|| DecodeError::new(format!("unknown object kind '{}'", kind)))?;
    let len: usize = len
        .parse()
        .map_err(|_| DecodeError::new(format!("bad length '{}'", len)))?;

    let payload = &bytes[nul + 1..];
    if payload.len() != len {
        return Err(DecodeError::new(format!(
            "header declares {} bytes, found {}",
            len,
            payload.len()
        )));
    }
    Ok((kind, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame() {
        let mut framed = ObjectKind::Tree.header(3);
        framed.extend_from_slice(b"abc");
        let (kind, payload) = parse_frame(&framed).unwrap();
        assert_eq!(kind, ObjectKind::Tree);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_parse_frame_rejects_length_mismatch() {
        let mut framed = ObjectKind::Blob.header(10);
        framed.extend_from_slice(b"short");
        assert!(parse_frame(&framed).is_err());
    }

    #[test]
    fn test_parse_frame_rejects_unknown_kind() {
        assert!(parse_frame(b"tag 0\0").is_err());
        assert!(parse_frame(b"no terminator").is_err());
    }

    #[test]
    fn test_decode_error_message() {
        let err = parse_frame(b"blob 4\0ab").unwrap_err();
        assert_eq!(err.to_string(), "header declares 4 bytes, found 2");
        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());
    }
}
