//! Armored key files.
//!
//! Public keys are a base64 body of the 32 raw bytes between
//! `CRYPT4GH PUBLIC KEY` armor lines. Private keys carry a small
//! length-prefixed structure:
//!
//! ```text
//! "c4gh-v1" | str(kdfname) | [str(kdf options)] | str(ciphername) | str(data)
//! ```
//!
//! `str` is a u16 big-endian length followed by that many bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::SecretString;
use zeroize::Zeroizing;

use c4gh_core::{C4ghError, C4ghResult};

use crate::kdf::{KdfOptions, KdfParams};
use crate::keys::{is_low_order, KeyPair, PublicKeyBytes};
use crate::KEY_SIZE;

const PUBLIC_LABEL: &str = "CRYPT4GH PUBLIC KEY";
const PRIVATE_LABEL: &str = "CRYPT4GH PRIVATE KEY";
const ENCRYPTED_PRIVATE_LABEL: &str = "CRYPT4GH ENCRYPTED PRIVATE KEY";
const PRIVATE_MAGIC: &[u8] = b"c4gh-v1";
const KDF_ARGON2ID: &[u8] = b"argon2id";
const KDF_NONE: &[u8] = b"none";
const CIPHER_CHACHA20_POLY1305: &[u8] = b"chacha20_poly1305";
const CIPHER_NONE: &[u8] = b"none";

/// Encode a public key in armored form.
pub fn encode_public_key(public: &PublicKeyBytes) -> String {
    armor(PUBLIC_LABEL, public)
}

/// Parse a public key file: armored, or a bare base64 line.
pub fn parse_public_key(blob: &[u8]) -> C4ghResult<PublicKeyBytes> {
    let text = std::str::from_utf8(blob)
        .map_err(|_| C4ghError::ReceiverKey("public key is not text".into()))?;
    let body = match dearmor(text, PUBLIC_LABEL) {
        Some(body) => body,
        None => text.trim().to_string(),
    };
    let bytes = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| C4ghError::ReceiverKey(format!("public key base64: {e}")))?;
    let key: PublicKeyBytes = bytes.try_into().map_err(|v: Vec<u8>| {
        C4ghError::ReceiverKey(format!("public key has {} bytes, expected {KEY_SIZE}", v.len()))
    })?;
    if is_low_order(&key) {
        return Err(C4ghError::ReceiverKey("public key is a low-order point".into()));
    }
    Ok(key)
}

/// Encode a private key. With a passphrase the secret is sealed under an
/// Argon2id-derived key; without one it is stored in the clear.
pub fn encode_private_key(
    keypair: &KeyPair,
    passphrase: Option<&SecretString>,
    params: &KdfParams,
) -> C4ghResult<String> {
    let mut body = Zeroizing::new(Vec::new());
    body.extend_from_slice(PRIVATE_MAGIC);

    let label = match passphrase {
        Some(passphrase) => {
            let options = KdfOptions::generate(*params);
            let data = options
                .derive(passphrase)?
                .seal_secret(&keypair.secret_bytes())?;

            put_str(&mut body, KDF_ARGON2ID);
            put_str(&mut body, &options.encode());
            put_str(&mut body, CIPHER_CHACHA20_POLY1305);
            put_str(&mut body, &data);
            ENCRYPTED_PRIVATE_LABEL
        }
        None => {
            put_str(&mut body, KDF_NONE);
            put_str(&mut body, CIPHER_NONE);
            put_str(&mut body, keypair.secret_bytes().as_slice());
            PRIVATE_LABEL
        }
    };

    Ok(armor(label, &body))
}

/// Load a keypair from a private key file, unsealing it with `passphrase`.
/// Any failure, including a wrong passphrase, is a [`C4ghError::KeyLoad`].
pub fn parse_private_key(blob: &[u8], passphrase: Option<&SecretString>) -> C4ghResult<KeyPair> {
    let text = std::str::from_utf8(blob)
        .map_err(|_| C4ghError::KeyLoad("private key is not text".into()))?;
    let body = dearmor(text, ENCRYPTED_PRIVATE_LABEL)
        .or_else(|| dearmor(text, PRIVATE_LABEL))
        .ok_or_else(|| C4ghError::KeyLoad("no crypt4gh private key armor".into()))?;
    let raw = Zeroizing::new(
        STANDARD
            .decode(body.as_bytes())
            .map_err(|e| C4ghError::KeyLoad(format!("private key base64: {e}")))?,
    );

    let mut rest = raw
        .strip_prefix(PRIVATE_MAGIC)
        .ok_or_else(|| C4ghError::KeyLoad("bad private key magic".into()))?;

    let kdf = take_str(&mut rest)?;
    let options = if kdf == KDF_NONE {
        None
    } else if kdf == KDF_ARGON2ID {
        Some(KdfOptions::decode(take_str(&mut rest)?)?)
    } else {
        return Err(C4ghError::KeyLoad(format!(
            "unsupported kdf {}",
            String::from_utf8_lossy(kdf)
        )));
    };
    let cipher = take_str(&mut rest)?;
    let data = take_str(&mut rest)?;

    let secret = match (options, cipher) {
        (None, c) if c == CIPHER_NONE => {
            let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
            if data.len() != KEY_SIZE {
                return Err(C4ghError::KeyLoad("private key has wrong size".into()));
            }
            secret.copy_from_slice(data);
            secret
        }
        (Some(options), c) if c == CIPHER_CHACHA20_POLY1305 => {
            let passphrase = passphrase
                .ok_or_else(|| C4ghError::KeyLoad("private key is passphrase-protected".into()))?;
            options.derive(passphrase)?.open_secret(data)?
        }
        _ => {
            return Err(C4ghError::KeyLoad(format!(
                "unsupported cipher {}",
                String::from_utf8_lossy(cipher)
            )))
        }
    };

    Ok(KeyPair::from_secret_bytes(*secret))
}

fn put_str(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s);
}

fn take_str<'a>(rest: &mut &'a [u8]) -> C4ghResult<&'a [u8]> {
    if rest.len() < 2 {
        return Err(C4ghError::KeyLoad("private key truncated".into()));
    }
    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    if rest.len() < 2 + len {
        return Err(C4ghError::KeyLoad("private key truncated".into()));
    }
    let s = &rest[2..2 + len];
    *rest = &rest[2 + len..];
    Ok(s)
}

fn armor(label: &str, body: &[u8]) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        STANDARD.encode(body)
    )
}

/// Base64 body between armor lines for `label`, with line breaks removed.
fn dearmor(text: &str, label: &str) -> Option<String> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = text.find(&begin)? + begin.len();
    let stop = start + text[start..].find(&end)?;
    Some(text[start..stop].split_whitespace().collect())
}
