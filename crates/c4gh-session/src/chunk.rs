//! Owned byte buffers handed across the host boundary.

use zeroize::Zeroize;

use c4gh_core::{C4ghError, C4ghResult};

/// Move-only output buffer. Whoever holds it owns it; [`Chunk::free`]
/// consumes it. Contents are wiped when it is released either way, since a
/// chunk may carry plaintext or exported key bytes.
#[derive(Default, PartialEq, Eq)]
pub struct Chunk {
    buf: Vec<u8>,
}

impl Chunk {
    /// An empty chunk with room for `capacity` bytes. Reports
    /// [`C4ghError::Allocation`] instead of aborting when memory is short.
    pub fn with_capacity(capacity: usize) -> C4ghResult<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|e| C4ghError::Allocation(format!("{capacity} byte chunk: {e}")))?;
        Ok(Self { buf })
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Bytes actually produced into the buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn content(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Hand the bytes over without wiping them.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Release the chunk, wiping its contents.
    pub fn free(self) {}
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("len", &self.buf.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_tracks_content() {
        let mut chunk = Chunk::with_capacity(16).unwrap();
        assert_eq!(chunk.len(), 0);
        chunk.extend_from_slice(b"abc");
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.content(), b"abc");
    }

    #[test]
    fn test_impossible_capacity_is_allocation_error() {
        assert!(matches!(
            Chunk::with_capacity(usize::MAX),
            Err(C4ghError::Allocation(_))
        ));
    }

    #[test]
    fn test_into_vec_keeps_bytes() {
        let chunk = Chunk::from_vec(b"payload".to_vec());
        assert_eq!(chunk.into_vec(), b"payload");
    }

    #[test]
    fn test_debug_hides_content() {
        let chunk = Chunk::from_vec(b"secret".to_vec());
        assert_eq!(format!("{chunk:?}"), "Chunk { len: 6 }");
    }
}
