//! Per-segment ChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted segment format (binary):
//! ```text
//! [12 bytes: nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! Nonces come from a BLAKE3 key derived from the session key, applied to a
//! random per-stream id and the segment index. The nonce travels with the
//! segment, so any segment decrypts on its own once the key is known.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use c4gh_core::{C4ghError, C4ghResult};

use crate::keys::SessionKey;
use crate::{CIPHER_SEGMENT_SIZE, NONCE_SIZE, SEGMENT_OVERHEAD, SEGMENT_SIZE};

const NONCE_CONTEXT: &str = "c4gh 2024 segment nonce v1";

/// Random identifier keeping nonces unique across streams sharing one key
pub const STREAM_ID_SIZE: usize = 16;

/// Ciphertext length for a plaintext of `plain_len` bytes.
pub fn encrypted_len(plain_len: usize) -> usize {
    plain_len + SEGMENT_OVERHEAD
}

/// Sequential encryptor for one plaintext stream.
pub struct SegmentEncryptor<'k> {
    key: &'k SessionKey,
    cipher: ChaCha20Poly1305,
    nonce_key: [u8; 32],
    stream_id: [u8; STREAM_ID_SIZE],
    next_index: u64,
}

impl<'k> SegmentEncryptor<'k> {
    pub fn new(key: &'k SessionKey) -> Self {
        let mut stream_id = [0u8; STREAM_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut stream_id);
        Self {
            key,
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            nonce_key: blake3::derive_key(NONCE_CONTEXT, key.as_bytes()),
            stream_id,
            next_index: 0,
        }
    }

    pub fn key(&self) -> &SessionKey {
        self.key
    }

    /// Index the next call to [`encrypt`](Self::encrypt) will use.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Encrypt the next segment in stream order.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> C4ghResult<Vec<u8>> {
        let out = self.encrypt_at(self.next_index, plaintext)?;
        self.next_index += 1;
        Ok(out)
    }

    /// Encrypt the segment at `index` without moving the stream position.
    /// Used when a resumed upload re-sends one chunk.
    pub fn encrypt_at(&self, index: u64, plaintext: &[u8]) -> C4ghResult<Vec<u8>> {
        check_plaintext(plaintext)?;
        let nonce_bytes = self.nonce(index);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| C4ghError::Other(anyhow::anyhow!("segment encryption failed: {e}")))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        debug_assert_eq!(result.len(), encrypted_len(plaintext.len()));
        Ok(result)
    }

    fn nonce(&self, index: u64) -> [u8; NONCE_SIZE] {
        let mut hasher = blake3::Hasher::new_keyed(&self.nonce_key);
        hasher.update(&self.stream_id);
        hasher.update(&index.to_be_bytes());
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..NONCE_SIZE]);
        nonce
    }
}

impl Drop for SegmentEncryptor<'_> {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.nonce_key);
    }
}

/// Encrypt one standalone segment: `len(out) == len(plaintext) + 28`.
pub fn encrypt_segment(key: &SessionKey, plaintext: &[u8]) -> C4ghResult<Vec<u8>> {
    SegmentEncryptor::new(key).encrypt(plaintext)
}

/// Decrypt one segment. Any MAC mismatch is an [`C4ghError::Authentication`].
pub fn decrypt_segment(key: &SessionKey, encrypted: &[u8]) -> C4ghResult<Vec<u8>> {
    if encrypted.len() <= SEGMENT_OVERHEAD || encrypted.len() > CIPHER_SEGMENT_SIZE {
        return Err(C4ghError::Authentication(format!(
            "segment length {} outside {}..={}",
            encrypted.len(),
            SEGMENT_OVERHEAD + 1,
            CIPHER_SEGMENT_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| C4ghError::Authentication("invalid key or corrupted segment".into()))
}

fn check_plaintext(plaintext: &[u8]) -> C4ghResult<()> {
    if plaintext.is_empty() || plaintext.len() > SEGMENT_SIZE {
        return Err(C4ghError::InvalidInput(format!(
            "plaintext segment of {} bytes (must be 1..={SEGMENT_SIZE})",
            plaintext.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SessionKey::generate();
        let plaintext = b"hello, encrypted world!";

        let encrypted = encrypt_segment(&key, plaintext).unwrap();
        let decrypted = decrypt_segment(&key, &encrypted).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_full_segment_size() {
        let key = SessionKey::generate();
        let encrypted = encrypt_segment(&key, &vec![0x5Au8; SEGMENT_SIZE]).unwrap();
        assert_eq!(encrypted.len(), CIPHER_SEGMENT_SIZE);
    }

    #[test]
    fn test_empty_and_oversized_plaintext_rejected() {
        let key = SessionKey::generate();
        assert!(matches!(
            encrypt_segment(&key, b""),
            Err(C4ghError::InvalidInput(_))
        ));
        assert!(matches!(
            encrypt_segment(&key, &vec![0u8; SEGMENT_SIZE + 1]),
            Err(C4ghError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let key1 = SessionKey::generate();
        let key2 = SessionKey::generate();

        let encrypted = encrypt_segment(&key1, b"secret data").unwrap();
        let result = decrypt_segment(&key2, &encrypted);

        assert!(matches!(result, Err(C4ghError::Authentication(_))));
    }

    #[test]
    fn test_truncated_segment_is_authentication_error() {
        let key = SessionKey::generate();
        let result = decrypt_segment(&key, &[0u8; SEGMENT_OVERHEAD]);
        assert!(matches!(result, Err(C4ghError::Authentication(_))));
    }

    #[test]
    fn test_nonces_differ_per_index_and_stream() {
        let key = SessionKey::generate();
        let mut a = SegmentEncryptor::new(&key);
        let b = SegmentEncryptor::new(&key);

        let a0 = a.encrypt(b"same").unwrap();
        let a1 = a.encrypt(b"same").unwrap();
        let b0 = b.encrypt_at(0, b"same").unwrap();

        assert_ne!(a0[..NONCE_SIZE], a1[..NONCE_SIZE]);
        assert_ne!(a0[..NONCE_SIZE], b0[..NONCE_SIZE]);
        assert_eq!(a.next_index(), 2);
    }

    #[test]
    fn test_encrypt_at_is_repeatable() {
        let key = SessionKey::generate();
        let enc = SegmentEncryptor::new(&key);
        assert_eq!(enc.encrypt_at(3, b"chunk").unwrap(), enc.encrypt_at(3, b"chunk").unwrap());
        assert_eq!(enc.next_index(), 0);
    }

    #[test]
    fn test_segments_decrypt_out_of_order() {
        let key = SessionKey::generate();
        let mut enc = SegmentEncryptor::new(&key);
        let first = enc.encrypt(b"first").unwrap();
        let second = enc.encrypt(b"second").unwrap();

        assert_eq!(decrypt_segment(&key, &second).unwrap(), b"second");
        assert_eq!(decrypt_segment(&key, &first).unwrap(), b"first");
    }

    #[test]
    fn test_seventy_thousand_bytes_split_into_two_segments() {
        let key = SessionKey::generate();
        let data = vec![0x11u8; 70000];
        let mut enc = SegmentEncryptor::new(&key);
        let lens: Vec<usize> = data
            .chunks(SEGMENT_SIZE)
            .map(|c| enc.encrypt(c).unwrap().len())
            .collect();
        assert_eq!(lens, vec![65564, 5448]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_and_length_law(data in proptest::collection::vec(any::<u8>(), 1..=SEGMENT_SIZE)) {
            let key = SessionKey::from_bytes([9u8; 32]);
            let encrypted = encrypt_segment(&key, &data).unwrap();
            prop_assert_eq!(encrypted.len(), data.len() + SEGMENT_OVERHEAD);
            prop_assert_eq!(decrypt_segment(&key, &encrypted).unwrap(), data);
        }

        #[test]
        fn any_flipped_byte_fails_authentication(
            data in proptest::collection::vec(any::<u8>(), 1..=4096),
            pos in any::<proptest::sample::Index>(),
            bit in 0u8..8,
        ) {
            let key = SessionKey::from_bytes([3u8; 32]);
            let mut encrypted = encrypt_segment(&key, &data).unwrap();
            let i = pos.index(encrypted.len());
            encrypted[i] ^= 1 << bit;
            prop_assert!(matches!(
                decrypt_segment(&key, &encrypted),
                Err(C4ghError::Authentication(_))
            ));
        }
    }
}
