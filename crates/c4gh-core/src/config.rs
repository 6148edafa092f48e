use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{C4ghError, C4ghResult};

/// Top-level configuration (loaded from c4gh.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct C4ghConfig {
    pub layout: LayoutConfig,
    pub crypto: CryptoConfig,
    pub logging: LoggingConfig,
}

impl C4ghConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> C4ghResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| C4ghError::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// Sandboxed filesystem layout. Relative paths resolve against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Root of the virtual filesystem (default: current directory)
    pub root: PathBuf,
    /// Directory holding all key material, wiped by `clean`
    pub keys_dir: PathBuf,
    /// Passphrase-protected private key file
    pub private_key: PathBuf,
    /// One recipient public key per file
    pub recv_keys_dir: PathBuf,
    /// Files to encrypt in place
    pub data_dir: PathBuf,
    /// Suffix appended to ciphertext outputs
    pub encrypted_suffix: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            keys_dir: PathBuf::from("keys"),
            private_key: PathBuf::from("keys/pk.key"),
            recv_keys_dir: PathBuf::from("keys/recv_keys"),
            data_dir: PathBuf::from("data"),
            encrypted_suffix: ".c4gh".into(),
        }
    }
}

impl LayoutConfig {
    /// Layout rooted at `root` with default relative paths.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join(&self.keys_dir)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.root.join(&self.private_key)
    }

    pub fn recv_keys_path(&self) -> PathBuf {
        self.root.join(&self.recv_keys_dir)
    }

    pub fn data_path(&self) -> PathBuf {
        self.root.join(&self.data_dir)
    }
}

/// Crypto and resource parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Ceiling on concurrently open file descriptors during a walk
    pub max_open_descriptors: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            max_open_descriptors: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}
