//! Response body representation and the streaming accumulator.
//!
//! A rendered page body is either textual HTML or a raw byte sequence
//! (e.g. a pre-compressed or image response). The distinction matters for
//! storage: a cached byte payload must come back as bytes, not as a lossy
//! string. [`Chunk`] is the unit a handler writes; [`Body`] accumulates
//! chunks into one contiguous buffer while remembering which representation
//! was established.

use bytes::{Bytes, BytesMut};

/// One partial write of a response body.
///
/// # Examples
///
/// ```
/// use rendercache::http::Chunk;
///
/// assert!(Chunk::Text(String::new()).is_empty());
/// assert_eq!(Chunk::Text("<html>".into()).len(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// A textual chunk, concatenated as UTF-8 text.
    Text(String),
    /// A raw byte chunk, concatenated as a growing byte buffer.
    Bytes(Bytes),
}

impl Chunk {
    /// Returns the chunk length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Bytes(b) => b.len(),
        }
    }

    /// Returns `true` if the chunk carries no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the chunk contents as a byte slice, regardless of representation.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Bytes(b) => b,
        }
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

/// An accumulated response body.
///
/// The representation is all-or-nothing: the first non-empty chunk pushed
/// decides whether the body is text or binary. A later chunk of the other
/// representation is never converted mid-stream — [`push`](Self::push)
/// rejects it and reports the mismatch so the caller can stop treating the
/// accumulation as a faithful copy.
///
/// # Examples
///
/// ```
/// use rendercache::http::{Body, Chunk};
///
/// let mut body = Body::Empty;
/// body.push(&Chunk::Text("<html>".into()));
/// body.push(&Chunk::Text("</html>".into()));
/// assert_eq!(body.as_bytes(), b"<html></html>");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    /// No non-empty chunk has been written yet.
    #[default]
    Empty,
    /// Accumulated textual body.
    Text(String),
    /// Accumulated binary body.
    Binary(BytesMut),
}

impl Body {
    /// Appends a chunk, establishing the representation on the first
    /// non-empty one.
    ///
    /// Returns `false` when the chunk's representation conflicts with the
    /// established one; the chunk is not accumulated and the accumulation no
    /// longer mirrors what was written.
    pub fn push(&mut self, chunk: &Chunk) -> bool {
        if chunk.is_empty() {
            return true;
        }
        match (&mut *self, chunk) {
            (Self::Empty, Chunk::Text(s)) => *self = Self::Text(s.clone()),
            (Self::Empty, Chunk::Bytes(b)) => {
                let mut buf = BytesMut::with_capacity(b.len());
                buf.extend_from_slice(b);
                *self = Self::Binary(buf);
            }
            (Self::Text(acc), Chunk::Text(s)) => acc.push_str(s),
            (Self::Binary(acc), Chunk::Bytes(b)) => acc.extend_from_slice(b),
            (Self::Text(_), Chunk::Bytes(_)) | (Self::Binary(_), Chunk::Text(_)) => return false,
        }
        true
    }

    /// Returns the accumulated length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// Returns `true` if no non-empty chunk has been accumulated.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns the accumulated contents as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        if s.is_empty() { Self::Empty } else { Self::Text(s) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        if b.is_empty() {
            Self::Empty
        } else {
            Self::Binary(BytesMut::from(&b[..]))
        }
    }
}
