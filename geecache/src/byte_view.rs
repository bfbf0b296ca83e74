//! Immutable views over cached values.

use bytes::Bytes;

/// An immutable view over a cached byte sequence.
///
/// Cloning is cheap (reference counted); the underlying bytes are never
/// mutated, so views handed out by a cache stay valid regardless of what
/// happens to the entry afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteView(Bytes);

impl ByteView {
    /// Number of bytes in the view.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Copy the bytes out into an owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<Bytes> for ByteView {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(b: Vec<u8>) -> Self {
        Self(b.into())
    }
}

impl From<String> for ByteView {
    fn from(s: String) -> Self {
        Self(s.into_bytes().into())
    }
}

impl From<&str> for ByteView {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl std::fmt::Display for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}
