//! Peer identity codec.
//!
//! A peer is addressed by a fixed-length hex string encoding its long-term
//! public key, a 4-byte anti-spam value and a 2-byte checksum. The anti-spam
//! value lets a peer invalidate a leaked identity string without rotating
//! the underlying key; the checksum catches transcription errors before the
//! string ever reaches the engine.

use std::fmt;
use std::str::FromStr;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};

use crate::error::IdentityError;

/// Length of a long-term public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of the anti-spam value in bytes.
pub const ANTI_SPAM_LEN: usize = 4;

/// Length of the trailing checksum in bytes.
pub const CHECKSUM_LEN: usize = 2;

/// Length of a canonical identity string in hex characters.
pub const ENDPOINT_STR_LEN: usize = (PUBLIC_KEY_LEN + ANTI_SPAM_LEN + CHECKSUM_LEN) * 2;

/// A peer's long-term public key.
///
/// Displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = HEXLOWER.encode(&self.0);
        write!(f, "PublicKey({}...)", &hex[..12])
    }
}

/// The 4-byte anti-spam value of an identity string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AntiSpam(pub [u8; ANTI_SPAM_LEN]);

impl fmt::Debug for AntiSpam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AntiSpam({})", HEXLOWER.encode(&self.0))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct Identity {
    public_key: PublicKey,
    anti_spam: AntiSpam,
}

/// A parsed peer identity — public key plus anti-spam value.
///
/// The default value is the *unset* endpoint: it carries no identity,
/// compares equal only to another unset endpoint, and cannot be produced by
/// [`Endpoint::from_str`]. For every set endpoint `e`,
/// `e.to_string().parse() == Ok(e)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint(Option<Identity>);

impl Endpoint {
    /// The endpoint with no underlying identity.
    pub const UNSET: Endpoint = Endpoint(None);

    /// Build an endpoint from its identity components. Infallible.
    pub fn from_key(public_key: PublicKey, anti_spam: AntiSpam) -> Self {
        Endpoint(Some(Identity {
            public_key,
            anti_spam,
        }))
    }

    /// Whether this endpoint carries an identity.
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// The public key, if set.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.0.as_ref().map(|id| &id.public_key)
    }

    /// The anti-spam value, if set.
    pub fn anti_spam(&self) -> Option<AntiSpam> {
        self.0.as_ref().map(|id| id.anti_spam)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => {
                let mut raw = [0u8; PUBLIC_KEY_LEN + ANTI_SPAM_LEN + CHECKSUM_LEN];
                raw[..PUBLIC_KEY_LEN].copy_from_slice(&id.public_key.0);
                raw[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + ANTI_SPAM_LEN].copy_from_slice(&id.anti_spam.0);
                let sum = checksum(&raw[..PUBLIC_KEY_LEN + ANTI_SPAM_LEN]);
                raw[PUBLIC_KEY_LEN + ANTI_SPAM_LEN..].copy_from_slice(&sum);
                f.write_str(&HEXLOWER.encode(&raw))
            }
            None => f.write_str("<unset>"),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => {
                let hex = self.to_string();
                write!(f, "Endpoint({}...)", &hex[..12])
            }
            None => f.write_str("Endpoint(<unset>)"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENDPOINT_STR_LEN {
            return Err(IdentityError::Length {
                expected: ENDPOINT_STR_LEN,
                got: s.len(),
            });
        }
        let raw = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| IdentityError::Hex)?;

        let (identity, sum) = raw.split_at(PUBLIC_KEY_LEN + ANTI_SPAM_LEN);
        if checksum(identity) != sum {
            return Err(IdentityError::Checksum);
        }

        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&identity[..PUBLIC_KEY_LEN]);
        let mut anti_spam = [0u8; ANTI_SPAM_LEN];
        anti_spam.copy_from_slice(&identity[PUBLIC_KEY_LEN..]);

        Ok(Endpoint::from_key(
            PublicKey(public_key),
            AntiSpam(anti_spam),
        ))
    }
}

impl serde::Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// XOR the identity bytes down to a 2-byte checksum.
fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut sum = [0u8; CHECKSUM_LEN];
    for (i, b) in bytes.iter().enumerate() {
        sum[i % CHECKSUM_LEN] ^= b;
    }
    sum
}
