//! Passphrase protection for the private key file.
//!
//! The file stores the Argon2id costs and salt as its kdf options; the
//! derived [`WrappingKey`] seals the 32-byte X25519 secret as
//! `nonce(12) || ChaCha20-Poly1305(secret)`.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, Zeroizing};

use c4gh_core::config::CryptoConfig;
use c4gh_core::{C4ghError, C4ghResult};

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Salt length stored in the private key file
pub const SALT_SIZE: usize = 16;

/// Encoded kdf options: three big-endian u32 costs, then the salt
pub const KDF_OPTIONS_SIZE: usize = 12 + SALT_SIZE;

/// Sealed secret length: nonce, ciphertext and tag
pub const SEALED_SECRET_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// KiB of memory per derivation
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&CryptoConfig::default())
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// Costs plus salt, as written next to a sealed private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfOptions {
    pub params: KdfParams,
    pub salt: [u8; SALT_SIZE],
}

impl KdfOptions {
    /// Fresh random salt for a newly sealed key.
    pub fn generate(params: KdfParams) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { params, salt }
    }

    pub fn encode(&self) -> [u8; KDF_OPTIONS_SIZE] {
        let mut out = [0u8; KDF_OPTIONS_SIZE];
        out[0..4].copy_from_slice(&self.params.time_cost.to_be_bytes());
        out[4..8].copy_from_slice(&self.params.mem_cost_kib.to_be_bytes());
        out[8..12].copy_from_slice(&self.params.parallelism.to_be_bytes());
        out[12..].copy_from_slice(&self.salt);
        out
    }

    pub fn decode(options: &[u8]) -> C4ghResult<Self> {
        let options: &[u8; KDF_OPTIONS_SIZE] = options.try_into().map_err(|_| {
            C4ghError::KeyLoad(format!(
                "kdf options are {} bytes, expected {KDF_OPTIONS_SIZE}",
                options.len()
            ))
        })?;
        let word = |i: usize| {
            u32::from_be_bytes([options[i], options[i + 1], options[i + 2], options[i + 3]])
        };
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&options[12..]);
        Ok(Self {
            params: KdfParams {
                time_cost: word(0),
                mem_cost_kib: word(4),
                parallelism: word(8),
            },
            salt,
        })
    }

    pub fn derive(&self, passphrase: &SecretString) -> C4ghResult<WrappingKey> {
        derive_wrapping_key(passphrase, &self.salt, &self.params)
    }
}

/// Key sealing the private key file. Zeroized on drop.
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn seal_secret(&self, secret: &[u8; KEY_SIZE]) -> C4ghResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = ChaCha20Poly1305::new((&self.bytes).into())
            .encrypt(Nonce::from_slice(&nonce), secret.as_slice())
            .map_err(|e| C4ghError::KeyLoad(format!("sealing private key: {e}")))?;

        let mut out = Vec::with_capacity(SEALED_SECRET_SIZE);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// A wrong passphrase and a corrupted file look the same here.
    pub fn open_secret(&self, data: &[u8]) -> C4ghResult<Zeroizing<[u8; KEY_SIZE]>> {
        if data.len() != SEALED_SECRET_SIZE {
            return Err(C4ghError::KeyLoad(format!(
                "sealed private key is {} bytes, expected {SEALED_SECRET_SIZE}",
                data.len()
            )));
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        let plain = Zeroizing::new(
            ChaCha20Poly1305::new((&self.bytes).into())
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| C4ghError::KeyLoad("wrong passphrase or corrupted private key".into()))?,
        );
        let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
        secret.copy_from_slice(&plain);
        Ok(secret)
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WrappingKey([REDACTED])")
    }
}

/// Argon2id v1.3 over the passphrase. Unusable costs are a key load error,
/// since they can only come from a damaged key file or config.
pub fn derive_wrapping_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> C4ghResult<WrappingKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| C4ghError::KeyLoad(format!("unusable Argon2id costs: {e}")))?;

    let mut bytes = [0u8; KEY_SIZE];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut bytes)
        .map_err(|e| C4ghError::KeyLoad(format!("deriving wrapping key: {e}")))?;
    Ok(WrappingKey { bytes })
}
