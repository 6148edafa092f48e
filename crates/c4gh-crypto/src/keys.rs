//! Key material: the per-stream session key and the X25519 keypair

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::KEY_SIZE;

/// A raw X25519 public key
pub type PublicKeyBytes = [u8; KEY_SIZE];

/// The symmetric key encrypting every segment of one stream.
///
/// Not `Clone`: exactly one owner holds it. Immutable once created and
/// zeroized on drop.
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Generate a fresh random session key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Take ownership of key bytes unwrapped from a header or supplied by the host.
    pub fn from_bytes(mut bytes: [u8; KEY_SIZE]) -> Self {
        let key = Self { bytes };
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// X25519 keypair. The secret half zeroizes itself on drop.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh (ephemeral) keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from its secret half.
    pub fn from_secret_bytes(mut secret_bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> PublicKeyBytes {
        self.public.to_bytes()
    }

    /// Copy of the secret key, wiped when the returned buffer drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 with a peer public key.
    pub(crate) fn diffie_hellman(&self, peer: &PublicKeyBytes) -> SharedSecret {
        self.secret.diffie_hellman(&PublicKey::from(*peer))
    }
}

/// True when `public` is a low-order point: every X25519 exchange with it
/// yields the all-zero secret, so no packet can ever be sealed for it.
pub(crate) fn is_low_order(public: &PublicKeyBytes) -> bool {
    !KeyPair::generate().diffie_hellman(public).was_contributory()
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_generation() {
        let k1 = SessionKey::generate();
        let k2 = SessionKey::generate();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::from_bytes([7u8; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains('7'));
    }

    #[test]
    fn test_keypair_from_secret_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(*kp.secret_bytes());
        assert_eq!(kp.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_diffie_hellman_agrees() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = a.diffie_hellman(&b.public_bytes());
        let ba = b.diffie_hellman(&a.public_bytes());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_low_order_points_are_detected() {
        let mut one = [0u8; KEY_SIZE];
        one[0] = 1;
        assert!(is_low_order(&[0u8; KEY_SIZE]));
        assert!(is_low_order(&one));
        assert!(!is_low_order(&KeyPair::generate().public_bytes()));
    }
}
