//! c4gh-crypto: Crypt4GH primitives for client-side encryption
//!
//! Stream layout: `header || segment*`
//!
//! ```text
//! Session Key (256-bit random, one per stream or folder operation)
//!   ├── Header packet per recipient: X25519(writer, recipient) → HKDF-SHA256 → ChaCha20-Poly1305(session key)
//!   └── Segment AEAD: ChaCha20-Poly1305 (key=session key, nonce=BLAKE3(stream_id || index)[..12])
//! Private key file: Argon2id(passphrase) → ChaCha20-Poly1305(secret key)
//! ```

pub mod header;
pub mod kdf;
pub mod keyfile;
pub mod keys;
pub mod segment;

pub use c4gh_core::{CIPHER_SEGMENT_SIZE, SEGMENT_OVERHEAD, SEGMENT_SIZE};
pub use header::{read_header, EditList, EditSelector, ParsedHeader};
pub use kdf::{derive_wrapping_key, KdfOptions, KdfParams, WrappingKey};
pub use keyfile::{encode_private_key, encode_public_key, parse_private_key, parse_public_key};
pub use keys::{KeyPair, PublicKeyBytes, SessionKey};
pub use segment::{decrypt_segment, encrypt_segment, encrypted_len, SegmentEncryptor};

/// Size of every key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 IETF nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
