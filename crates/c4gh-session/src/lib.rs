//! c4gh-session: encryption sessions and the orchestration around them
//!
//! An [`EncryptSession`] owns the key material for one operation. The upload
//! side walks a folder (or streams one file chunk by chunk) through the
//! segment codec; the download side opens a header and decrypts segments in
//! order. [`host`] exposes the same operations as plain functions over
//! move-only [`Chunk`] buffers and status codes.

pub mod chunk;
pub mod download;
pub mod fs;
pub mod host;
pub mod scanner;
pub mod session;
pub mod upload;
pub mod walk;

pub use chunk::Chunk;
pub use download::{decrypt_stream, DecryptStream};
pub use fs::{DescriptorBudget, FileSystem, OsFs};
pub use scanner::{scan, RecipientKeys};
pub use session::{EncryptSession, OpenMode};
pub use upload::{encrypt_stream, FolderEncryptor, FolderReport, ProgressFn, StreamStats, UploadStream};
