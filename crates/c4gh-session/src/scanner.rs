//! Recipient key discovery under the `recv_keys` directory.

use std::io::Read;
use std::path::Path;

use tracing::{debug, info, warn};

use c4gh_core::{C4ghError, C4ghResult};
use c4gh_crypto::{parse_public_key, PublicKeyBytes, KEY_SIZE};

use crate::fs::{DescriptorBudget, FileSystem, OsFs};
use crate::walk::list_files;

/// Key files are a single armored line or two; anything larger is not a key.
const MAX_KEY_FILE_SIZE: u64 = 1024;

/// Ordered recipient public keys collected by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientKeys {
    keys: Vec<PublicKeyBytes>,
    skipped: usize,
}

impl RecipientKeys {
    pub fn from_keys(keys: Vec<PublicKeyBytes>) -> Self {
        Self { keys, skipped: 0 }
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[PublicKeyBytes] {
        &self.keys
    }

    pub fn into_keys(self) -> Vec<PublicKeyBytes> {
        self.keys
    }

    /// Files that were visited but did not hold a usable key.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// All keys concatenated, `count() * 32` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.keys.len() * KEY_SIZE);
        for key in &self.keys {
            out.extend_from_slice(key);
        }
        out
    }
}

/// Scan `path` on the host filesystem with the default descriptor ceiling.
pub fn scan(path: &Path) -> C4ghResult<RecipientKeys> {
    scan_with(&OsFs, path, &DescriptorBudget::default())
}

/// Collect a public key from every regular file under `path`.
///
/// Unreadable or malformed files are skipped with a warning. Only failing to
/// walk the directory itself is an error.
pub fn scan_with(
    fs: &dyn FileSystem,
    path: &Path,
    budget: &DescriptorBudget,
) -> C4ghResult<RecipientKeys> {
    let files = list_files(fs, path, budget)?;
    let mut keys = Vec::with_capacity(files.len());
    let mut skipped = 0;

    for file in &files {
        match read_key_file(fs, file, budget) {
            Ok(key) => {
                debug!(path = %file.display(), "recipient key loaded");
                keys.push(key);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(path = %file.display(), error = %e, "skipping recipient key file");
                skipped += 1;
            }
        }
    }

    info!(dir = %path.display(), recipients = keys.len(), skipped, "recipient keys scanned");
    Ok(RecipientKeys { keys, skipped })
}

fn read_key_file(
    fs: &dyn FileSystem,
    path: &Path,
    budget: &DescriptorBudget,
) -> C4ghResult<PublicKeyBytes> {
    let receiver_err = |e: std::io::Error| C4ghError::ReceiverKey(format!("{}: {e}", path.display()));

    let _slot = budget.acquire().map_err(receiver_err)?;
    let reader = fs.open_read(path).map_err(receiver_err)?;
    let mut blob = Vec::new();
    reader
        .take(MAX_KEY_FILE_SIZE + 1)
        .read_to_end(&mut blob)
        .map_err(receiver_err)?;
    if blob.len() as u64 > MAX_KEY_FILE_SIZE {
        return Err(C4ghError::ReceiverKey(format!(
            "{}: larger than {MAX_KEY_FILE_SIZE} bytes",
            path.display()
        )));
    }
    parse_public_key(&blob)
}
