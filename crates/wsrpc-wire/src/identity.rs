//! Peer identities: static Ed25519 public keys.
//!
//! A [`PeerIdentity`] is what a connection learns about its remote side once
//! the handshake succeeds. It is also how server allow-lists and client
//! expected-key pins are written (hex in config files).

use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;

use crate::error::WireError;

/// The verified public key of a remote peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity([u8; PUBLIC_KEY_LENGTH]);

impl PeerIdentity {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            WireError::InvalidKey(format!(
                "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Decompress into a key usable for signature verification.
    pub fn verifying_key(&self) -> Result<VerifyingKey, WireError> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| WireError::InvalidKey(e.to_string()))
    }

    /// Constant-time equality, used when pinning an expected key.
    pub fn ct_eq(&self, other: &PeerIdentity) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl From<VerifyingKey> for PeerIdentity {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl From<&SigningKey> for PeerIdentity {
    fn from(key: &SigningKey) -> Self {
        Self(key.verifying_key().to_bytes())
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity({}…)", &self.to_hex()[..16])
    }
}

impl std::str::FromStr for PeerIdentity {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, WireError> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Generate a fresh Ed25519 signing key from the OS RNG.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Parse a hex-encoded 32-byte Ed25519 secret key.
pub fn signing_key_from_hex(s: &str) -> Result<SigningKey, WireError> {
    let bytes = hex::decode(s.trim())?;
    let arr: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        WireError::InvalidKey(format!(
            "expected {SECRET_KEY_LENGTH} secret key bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&arr))
}

/// Hex-encode a secret key for storage in a key file.
pub fn signing_key_to_hex(key: &SigningKey) -> String {
    hex::encode(key.to_bytes())
}
