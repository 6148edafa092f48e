pub mod config;
pub mod error;
pub mod upload;

pub use error::{status_of, C4ghError, C4ghResult, STATUS_OK};

/// Maximum plaintext bytes in one segment
pub const SEGMENT_SIZE: usize = 65536;

/// Per-segment expansion: 12-byte nonce + 16-byte Poly1305 tag
pub const SEGMENT_OVERHEAD: usize = 28;

/// Maximum ciphertext bytes in one segment
pub const CIPHER_SEGMENT_SIZE: usize = SEGMENT_SIZE + SEGMENT_OVERHEAD;
