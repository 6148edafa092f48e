//! The encryption session: all key material for one encrypt or decrypt
//! operation, owned by exactly one caller.
//!
//! Opening is a tagged choice between a passphrase-unlocked key file and a
//! fresh ephemeral keypair. The session key is set once, either generated
//! for encryption or unwrapped from a header for decryption. Dropping the
//! session (or calling [`EncryptSession::close`]) wipes everything.

use std::path::Path;

use secrecy::SecretString;
use tracing::{debug, info};
use zeroize::Zeroizing;

use c4gh_core::{C4ghError, C4ghResult};
use c4gh_crypto::header::{self, EditList};
use c4gh_crypto::{parse_private_key, KeyPair, PublicKeyBytes, SessionKey, KEY_SIZE};

use crate::scanner::RecipientKeys;

/// How the local keypair is obtained.
pub enum OpenMode {
    /// Decrypt the private key file with this passphrase.
    PassphraseUnlocked(SecretString),
    /// Generate a throwaway keypair for this session only.
    Ephemeral,
}

impl std::fmt::Debug for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenMode::PassphraseUnlocked(_) => f.write_str("PassphraseUnlocked([REDACTED])"),
            OpenMode::Ephemeral => f.write_str("Ephemeral"),
        }
    }
}

pub struct EncryptSession {
    keypair: KeyPair,
    session_key: Option<SessionKey>,
    recipients: Vec<PublicKeyBytes>,
    passphrase: Option<SecretString>,
}

impl EncryptSession {
    /// Open a session. `private_key` is only read in passphrase mode.
    ///
    /// Any failure to read or unlock the key file is a
    /// [`C4ghError::KeyLoad`]; no session exists afterwards.
    pub fn open(mode: OpenMode, private_key: &Path) -> C4ghResult<Self> {
        match mode {
            OpenMode::Ephemeral => {
                debug!("opening session with ephemeral keypair");
                Ok(Self::with_keypair(KeyPair::generate()))
            }
            OpenMode::PassphraseUnlocked(passphrase) => {
                let blob = Zeroizing::new(std::fs::read(private_key).map_err(|e| {
                    C4ghError::KeyLoad(format!("reading {}: {e}", private_key.display()))
                })?);
                let keypair = parse_private_key(&blob, Some(&passphrase))?;
                info!(key = %private_key.display(), "private key unlocked");
                let mut session = Self::with_keypair(keypair);
                session.passphrase = Some(passphrase);
                Ok(session)
            }
        }
    }

    /// Wrap a keypair the caller already holds.
    pub fn with_keypair(keypair: KeyPair) -> Self {
        Self {
            keypair,
            session_key: None,
            recipients: Vec::new(),
            passphrase: None,
        }
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.keypair.public_bytes()
    }

    pub fn private_key(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        self.keypair.secret_bytes()
    }

    /// Whether the session was unlocked with a passphrase.
    pub fn is_unlocked(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn set_recipients(&mut self, keys: RecipientKeys) {
        self.recipients = keys.into_keys();
    }

    pub fn add_recipient(&mut self, key: PublicKeyBytes) {
        self.recipients.push(key);
    }

    pub fn recipients(&self) -> &[PublicKeyBytes] {
        &self.recipients
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    /// Generate the random session key for encryption. Fails if a key is
    /// already set.
    pub fn create_session_key(&mut self) -> C4ghResult<&SessionKey> {
        if self.session_key.is_some() {
            return Err(C4ghError::InvalidInput("session key already set".into()));
        }
        Ok(self.session_key.insert(SessionKey::generate()))
    }

    /// Install the session key from a header addressed to the local keypair
    /// and return its edit list, if any.
    pub fn open_header(&mut self, header_bytes: &[u8]) -> C4ghResult<Option<EditList>> {
        if self.session_key.is_some() {
            return Err(C4ghError::InvalidInput("session key already set".into()));
        }
        let parsed = header::parse(header_bytes, &self.keypair)?;
        self.session_key = Some(parsed.session_key);
        Ok(parsed.edit_list)
    }

    pub fn session_key(&self) -> C4ghResult<&SessionKey> {
        self.session_key
            .as_ref()
            .ok_or_else(|| C4ghError::InvalidInput("no session key".into()))
    }

    /// Header wrapping the session key for every recipient.
    pub fn build_header(&self) -> C4ghResult<Vec<u8>> {
        self.build_header_with_edit_list(None)
    }

    pub fn build_header_with_edit_list(&self, edit_list: Option<&EditList>) -> C4ghResult<Vec<u8>> {
        header::build_with_edit_list(self.session_key()?, &self.keypair, &self.recipients, edit_list)
    }

    /// End the session, wiping the session key, recipient list, and passphrase.
    pub fn close(self) {}
}

impl Drop for EncryptSession {
    fn drop(&mut self) {
        // SessionKey and SecretString wipe themselves on drop
        self.session_key = None;
        self.passphrase = None;
        self.recipients.clear();
        debug!("session closed");
    }
}

impl std::fmt::Debug for EncryptSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptSession")
            .field("keypair", &self.keypair)
            .field("has_session_key", &self.session_key.is_some())
            .field("recipients", &self.recipients.len())
            .field("unlocked", &self.passphrase.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use c4gh_crypto::{encode_private_key, KdfParams};

    const FAST: KdfParams = KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    };

    fn write_locked_key(dir: &Path, passphrase: &str) -> (std::path::PathBuf, PublicKeyBytes) {
        let kp = KeyPair::generate();
        let armored =
            encode_private_key(&kp, Some(&SecretString::from(passphrase)), &FAST).unwrap();
        let path = dir.join("pk.key");
        std::fs::write(&path, armored).unwrap();
        (path, kp.public_bytes())
    }

    #[test]
    fn test_passphrase_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let (path, public) = write_locked_key(dir.path(), "hunter2");

        let session = EncryptSession::open(
            OpenMode::PassphraseUnlocked(SecretString::from("hunter2")),
            &path,
        )
        .unwrap();
        assert_eq!(session.public_key(), public);
        assert!(session.is_unlocked());
    }

    #[test]
    fn test_wrong_passphrase_is_key_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_locked_key(dir.path(), "right");

        let err = EncryptSession::open(
            OpenMode::PassphraseUnlocked(SecretString::from("wrong")),
            &path,
        )
        .unwrap_err();
        assert!(matches!(err, C4ghError::KeyLoad(_)));
    }

    #[test]
    fn test_missing_key_file_is_key_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EncryptSession::open(
            OpenMode::PassphraseUnlocked(SecretString::from("x")),
            &dir.path().join("absent.key"),
        )
        .unwrap_err();
        assert!(matches!(err, C4ghError::KeyLoad(_)));
    }

    #[test]
    fn test_ephemeral_ignores_key_path() {
        let session = EncryptSession::open(OpenMode::Ephemeral, Path::new("/nonexistent")).unwrap();
        assert!(!session.is_unlocked());
        assert!(session.session_key().is_err());
    }

    #[test]
    fn test_session_key_is_set_once() {
        let mut session = EncryptSession::with_keypair(KeyPair::generate());
        session.create_session_key().unwrap();
        assert!(matches!(
            session.create_session_key(),
            Err(C4ghError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_header_round_trip_between_sessions() {
        let reader = KeyPair::generate();
        let reader_pk = reader.public_bytes();

        let mut writer = EncryptSession::open(OpenMode::Ephemeral, Path::new("")).unwrap();
        writer.add_recipient(reader_pk);
        let key = *writer.create_session_key().unwrap().as_bytes();
        let header = writer.build_header().unwrap();

        let mut receiver = EncryptSession::with_keypair(reader);
        assert!(receiver.open_header(&header).unwrap().is_none());
        assert_eq!(receiver.session_key().unwrap().as_bytes(), &key);
    }

    #[test]
    fn test_header_without_recipients_fails() {
        let mut session = EncryptSession::with_keypair(KeyPair::generate());
        session.create_session_key().unwrap();
        assert!(matches!(
            session.build_header(),
            Err(C4ghError::NoRecipients)
        ));
    }

    #[test]
    fn test_set_recipients_replaces_list() {
        let mut session = EncryptSession::with_keypair(KeyPair::generate());
        session.add_recipient([1u8; KEY_SIZE]);
        session.set_recipients(RecipientKeys::from_keys(vec![[2u8; KEY_SIZE], [3u8; KEY_SIZE]]));
        assert_eq!(session.recipient_count(), 2);
        assert_eq!(session.recipients()[0], [2u8; KEY_SIZE]);
    }

    #[test]
    fn test_debug_is_redacted() {
        let mut session = EncryptSession::with_keypair(KeyPair::generate());
        session.create_session_key().unwrap();
        let dbg = format!("{session:?}");
        assert!(dbg.contains("has_session_key: true"));
        assert!(dbg.contains("REDACTED"));
    }
}
