//! Thin layer for hosts that only see byte buffers and status codes.
//!
//! Sessions and chunks are move-only: every call that returns one hands
//! ownership to the caller, and [`free_chunk`] / [`close_session`] consume
//! them. Folder operations report a status code (`0` on success, the
//! negative [`C4ghError::status_code`] otherwise).

use base64::{engine::general_purpose::STANDARD, Engine};
use secrecy::SecretString;
use tracing::{info, warn};
use zeroize::Zeroizing;

use c4gh_core::config::C4ghConfig;
use c4gh_core::{status_of, C4ghError, C4ghResult};
use c4gh_crypto::{decrypt_segment, encrypt_segment, EditList, SessionKey};

use crate::chunk::Chunk;
use crate::fs::{DescriptorBudget, FileSystem, OsFs};
use crate::scanner;
use crate::session::{EncryptSession, OpenMode};
use crate::upload::FolderEncryptor;
use crate::walk::list_files;

/// Anything that can supply the key for one segment operation.
pub trait KeySource {
    fn segment_key(&self) -> C4ghResult<&SessionKey>;
}

impl KeySource for SessionKey {
    fn segment_key(&self) -> C4ghResult<&SessionKey> {
        Ok(self)
    }
}

impl KeySource for EncryptSession {
    fn segment_key(&self) -> C4ghResult<&SessionKey> {
        self.session_key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Public,
    Private,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Raw,
    Base64,
}

/// Open a session ready to encrypt: recipients scanned from the configured
/// directory and a fresh session key generated.
pub fn open_session(mode: OpenMode, config: &C4ghConfig) -> C4ghResult<EncryptSession> {
    let layout = &config.layout;
    let mut session = EncryptSession::open(mode, &layout.private_key_path())?;
    let budget = DescriptorBudget::new(config.crypto.max_open_descriptors);
    session.set_recipients(scanner::scan_with(&OsFs, &layout.recv_keys_path(), &budget)?);
    session.create_session_key()?;
    Ok(session)
}

/// Open a session for decryption. Its session key comes from
/// [`parse_header_chunk`].
pub fn open_decrypt_session(mode: OpenMode, config: &C4ghConfig) -> C4ghResult<EncryptSession> {
    EncryptSession::open(mode, &config.layout.private_key_path())
}

pub fn close_session(session: EncryptSession) {
    session.close();
}

/// Copy one key out of the session.
pub fn export_key(session: &EncryptSession, kind: KeyKind, encoding: KeyEncoding) -> C4ghResult<Chunk> {
    let raw = match kind {
        KeyKind::Public => Zeroizing::new(session.public_key().to_vec()),
        KeyKind::Private => Zeroizing::new(session.private_key().to_vec()),
        KeyKind::Session => Zeroizing::new(session.session_key()?.as_bytes().to_vec()),
    };
    Ok(match encoding {
        KeyEncoding::Raw => Chunk::from_vec(raw.to_vec()),
        KeyEncoding::Base64 => Chunk::from_vec(STANDARD.encode(&*raw).into_bytes()),
    })
}

pub fn build_header_chunk(session: &EncryptSession) -> C4ghResult<Chunk> {
    session.build_header().map(Chunk::from_vec)
}

/// Install the session key from `header` and return its edit list.
pub fn parse_header_chunk(session: &mut EncryptSession, header: &[u8]) -> C4ghResult<Option<EditList>> {
    session.open_header(header)
}

/// Encrypt the first `len` bytes of `plaintext` as one segment.
pub fn encrypt_chunk<K: KeySource + ?Sized>(source: &K, plaintext: &[u8], len: usize) -> C4ghResult<Chunk> {
    let input = prefix(plaintext, len)?;
    encrypt_segment(source.segment_key()?, input).map(Chunk::from_vec)
}

/// Decrypt the first `len` bytes of `ciphertext` as one segment.
pub fn decrypt_chunk<K: KeySource + ?Sized>(source: &K, ciphertext: &[u8], len: usize) -> C4ghResult<Chunk> {
    let input = prefix(ciphertext, len)?;
    decrypt_segment(source.segment_key()?, input).map(Chunk::from_vec)
}

fn prefix(buf: &[u8], len: usize) -> C4ghResult<&[u8]> {
    buf.get(..len).ok_or_else(|| {
        C4ghError::InvalidInput(format!("length {len} exceeds buffer of {} bytes", buf.len()))
    })
}

pub fn allocate_chunk(capacity: usize) -> C4ghResult<Chunk> {
    Chunk::with_capacity(capacity)
}

pub fn chunk_len(chunk: &Chunk) -> usize {
    chunk.len()
}

pub fn chunk_content(chunk: &Chunk) -> &[u8] {
    chunk.content()
}

pub fn free_chunk(chunk: Chunk) {
    chunk.free();
}

/// Encrypt the data folder in place with the passphrase-protected key.
pub fn encrypt_folder(passphrase: &str, config: &C4ghConfig) -> i32 {
    let mode = OpenMode::PassphraseUnlocked(SecretString::from(passphrase));
    status_of(&FolderEncryptor::new(config).run(mode))
}

/// Encrypt the data folder in place with a throwaway keypair.
pub fn encrypt_folder_ephemeral(config: &C4ghConfig) -> i32 {
    status_of(&FolderEncryptor::new(config).run(OpenMode::Ephemeral))
}

/// Close the session and delete every file under the keys directory.
pub fn clean_session(session: EncryptSession, config: &C4ghConfig) -> i32 {
    session.close();
    let result = wipe_key_material(&OsFs, config);
    if let Err(e) = &result {
        warn!(error = %e, "cleaning key material failed");
    }
    status_of(&result)
}

/// Delete every regular file under the keys directory, keeping the
/// directories themselves. Returns how many files were removed.
pub fn wipe_key_material(fs: &dyn FileSystem, config: &C4ghConfig) -> C4ghResult<usize> {
    let keys_dir = config.layout.keys_dir();
    if !keys_dir.exists() {
        return Ok(0);
    }
    let budget = DescriptorBudget::new(config.crypto.max_open_descriptors);
    let files = list_files(fs, &keys_dir, &budget)?;
    for file in &files {
        fs.remove_file(file)?;
    }
    info!(dir = %keys_dir.display(), removed = files.len(), "key material removed");
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use c4gh_core::config::LayoutConfig;
    use c4gh_crypto::KeyPair;

    fn config_in(dir: &std::path::Path) -> C4ghConfig {
        C4ghConfig {
            layout: LayoutConfig::rooted(dir),
            ..C4ghConfig::default()
        }
    }

    #[test]
    fn test_encrypt_decrypt_chunk_with_session_and_key() {
        let mut session = EncryptSession::with_keypair(KeyPair::generate());
        session.create_session_key().unwrap();

        let ct = encrypt_chunk(&session, b"hello world", 5).unwrap();
        assert_eq!(chunk_len(&ct), 5 + 28);

        let key = session.session_key().unwrap();
        let pt = decrypt_chunk(key, chunk_content(&ct), ct.len()).unwrap();
        assert_eq!(pt.content(), b"hello");
        free_chunk(pt);
    }

    #[test]
    fn test_len_beyond_buffer_is_invalid_input() {
        let key = SessionKey::generate();
        assert!(matches!(
            encrypt_chunk(&key, b"abc", 4),
            Err(C4ghError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_chunk_without_session_key_fails() {
        let session = EncryptSession::with_keypair(KeyPair::generate());
        assert!(encrypt_chunk(&session, b"abc", 3).is_err());
    }

    #[test]
    fn test_export_key_encodings() {
        let mut session = EncryptSession::with_keypair(KeyPair::generate());
        session.create_session_key().unwrap();

        let raw = export_key(&session, KeyKind::Session, KeyEncoding::Raw).unwrap();
        assert_eq!(raw.len(), 32);
        let text = export_key(&session, KeyKind::Session, KeyEncoding::Base64).unwrap();
        assert_eq!(STANDARD.decode(text.content()).unwrap(), raw.content());

        let public = export_key(&session, KeyKind::Public, KeyEncoding::Raw).unwrap();
        assert_eq!(public.content(), &session.public_key());
    }

    #[test]
    fn test_encrypt_folder_without_key_file_reports_key_load() {
        let dir = tempfile::tempdir().unwrap();
        let status = encrypt_folder("pw", &config_in(dir.path()));
        assert_eq!(status, C4ghError::KeyLoad(String::new()).status_code());
    }

    #[test]
    fn test_clean_session_removes_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::create_dir_all(config.layout.recv_keys_path()).unwrap();
        std::fs::write(config.layout.private_key_path(), b"key").unwrap();
        std::fs::write(config.layout.recv_keys_path().join("r.pub"), b"pub").unwrap();

        let session = EncryptSession::with_keypair(KeyPair::generate());
        assert_eq!(clean_session(session, &config), c4gh_core::STATUS_OK);
        assert!(!config.layout.private_key_path().exists());
        assert!(config.layout.recv_keys_path().exists());
        assert_eq!(std::fs::read_dir(config.layout.recv_keys_path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clean_session_without_keys_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let session = EncryptSession::with_keypair(KeyPair::generate());
        assert_eq!(clean_session(session, &config_in(dir.path())), 0);
    }
}
