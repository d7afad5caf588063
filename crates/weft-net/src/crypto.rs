//! Per-peer authenticated encryption for the datagram path.
//!
//! Static-static X25519 Diffie-Hellman + XChaCha20-Poly1305 AEAD. Both
//! sides derive the same pairwise key from their long-term keys, so an
//! encrypted datagram carries only `nonce(24) ‖ ciphertext` — no per-packet
//! key material.

use std::fmt;

use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use weft_engine::PublicKey;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::NetError;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"weft-datagram-xchacha20poly1305-v1";

/// Nonce length prepended to each encrypted datagram.
pub const NONCE_LEN: usize = 24;

/// AEAD tag overhead per datagram.
pub const TAG_LEN: usize = 16;

/// A local X25519 secret key.
#[derive(Clone)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A keypair for datagram encryption.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

/// Generate a fresh X25519 keypair.
pub fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    KeyPair {
        public: PublicKey(public.to_bytes()),
        secret: SecretKey(secret.to_bytes()),
    }
}

/// 24 random bytes — safe to generate randomly with XChaCha20's extended nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Derive the pairwise AEAD key from a DH shared secret via HKDF-SHA256.
fn derive_key(shared: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

fn pairwise_cipher(peer_public: &PublicKey, local_secret: &SecretKey) -> XChaCha20Poly1305 {
    let secret = StaticSecret::from(local_secret.0);
    let public = X25519Public::from(peer_public.0);
    let shared = secret.diffie_hellman(&public);
    XChaCha20Poly1305::new(&derive_key(shared.as_bytes()).into())
}

/// Encrypt one datagram payload for `peer_public`.
pub fn seal(
    plaintext: &[u8],
    nonce: &[u8; NONCE_LEN],
    peer_public: &PublicKey,
    local_secret: &SecretKey,
) -> Result<Vec<u8>, NetError> {
    pairwise_cipher(peer_public, local_secret)
        .encrypt(&XNonce::from(*nonce), plaintext)
        .map_err(|e| NetError::Crypto {
            op: "seal",
            reason: format!("encryption failed: {e}"),
        })
}

/// Decrypt one datagram payload from `peer_public`.
///
/// Fails on any tampering or key mismatch.
pub fn open(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    peer_public: &PublicKey,
    local_secret: &SecretKey,
) -> Result<Vec<u8>, NetError> {
    pairwise_cipher(peer_public, local_secret)
        .decrypt(&XNonce::from(*nonce), ciphertext)
        .map_err(|_| NetError::Crypto {
            op: "open",
            reason: "authentication failed".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic keypair from a seed byte.
    fn keypair(seed: u8) -> KeyPair {
        let secret = StaticSecret::from([seed; 32]);
        let public = X25519Public::from(&secret);
        KeyPair {
            public: PublicKey(public.to_bytes()),
            secret: SecretKey(secret.to_bytes()),
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let a = keypair(1);
        let b = keypair(2);
        let nonce = [7u8; NONCE_LEN];

        let wire = seal(b"over the weft", &nonce, &b.public, &a.secret).unwrap();
        let back = open(&wire, &nonce, &a.public, &b.secret).unwrap();
        assert_eq!(back, b"over the weft");
    }

    #[test]
    fn dh_is_symmetric() {
        // Either side's (secret, peer-public) pair yields the same key.
        let a = keypair(3);
        let b = keypair(4);
        let nonce = [1u8; NONCE_LEN];

        let from_a = seal(b"x", &nonce, &b.public, &a.secret).unwrap();
        let from_b = seal(b"x", &nonce, &a.public, &b.secret).unwrap();
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn wrong_key_fails() {
        let a = keypair(5);
        let b = keypair(6);
        let c = keypair(7);
        let nonce = [2u8; NONCE_LEN];

        let wire = seal(b"secret", &nonce, &b.public, &a.secret).unwrap();
        assert!(open(&wire, &nonce, &a.public, &c.secret).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let a = keypair(8);
        let b = keypair(9);
        let nonce = [3u8; NONCE_LEN];

        let mut wire = seal(b"secret", &nonce, &b.public, &a.secret).unwrap();
        wire[0] ^= 0xFF;
        assert!(open(&wire, &nonce, &a.public, &b.secret).is_err());
    }

    #[test]
    fn wrong_nonce_fails() {
        let a = keypair(10);
        let b = keypair(11);

        let wire = seal(b"secret", &[4u8; NONCE_LEN], &b.public, &a.secret).unwrap();
        assert!(open(&wire, &[5u8; NONCE_LEN], &a.public, &b.secret).is_err());
    }

    #[test]
    fn ciphertext_overhead_is_tag_len() {
        let a = keypair(12);
        let b = keypair(13);
        let plaintext = b"sized payload";

        let wire = seal(plaintext, &[0u8; NONCE_LEN], &b.public, &a.secret).unwrap();
        assert_eq!(wire.len(), plaintext.len() + TAG_LEN);
    }

    #[test]
    fn generated_nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn generated_keypairs_differ() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_ne!(a.public, b.public);
    }
}
