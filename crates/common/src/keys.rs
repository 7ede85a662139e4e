//! WireGuard key management
//!
//! Keys are 32-byte Curve25519 values, carried as standard padded base64
//! (44 characters) in configuration files and on the wire. Public keys are
//! derived from private keys by X25519 base point multiplication.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a raw WireGuard key
pub const KEY_LEN: usize = 32;

/// A raw 32-byte WireGuard key (private or public)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a base64 encoded key
    pub fn from_base64(s: &str) -> Result<Self> {
        let raw = STANDARD.decode(s.trim())?;
        let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            Error::Validation(format!(
                "key must decode to {} bytes, got {}",
                KEY_LEN,
                raw.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Base64 encoding of the key
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short prefix of the base64 form, for log lines
    pub fn short(&self) -> String {
        self.to_base64().chars().take(8).collect()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Private keys share this type; never print the full value.
        write!(f, "Key({}..)", self.short())
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Key::from_base64(s)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Key::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Generate a new private key from the OS entropy source.
///
/// The scalar is clamped as Curve25519 requires, so the encoded key matches
/// what `wg genkey` produces.
pub fn generate_private_key() -> Result<Key> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Crypto(format!("entropy source failed: {}", e)))?;

    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;

    Ok(Key(bytes))
}

/// Derive the public key belonging to a private key
pub fn derive_public_key(private_key: &Key) -> Key {
    let secret = StaticSecret::from(private_key.0);
    let public = PublicKey::from(&secret);
    Key(*public.as_bytes())
}

/// A node's identity key pair
#[derive(Clone)]
pub struct KeyPair {
    private_key: Key,
    public_key: Key,
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Result<Self> {
        Ok(Self::from_private(generate_private_key()?))
    }

    /// Build a key pair from an existing private key
    pub fn from_private(private_key: Key) -> Self {
        let public_key = derive_public_key(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn private_key(&self) -> &Key {
        &self.private_key
    }

    pub fn public_key(&self) -> &Key {
        &self.public_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key.to_base64())
            .finish()
    }
}
