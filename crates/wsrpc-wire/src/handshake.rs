//! Handshake messages and transcript signing.
//!
//! The handshake is a challenge-response exchange over static Ed25519 keys:
//!
//! ```text
//! client                                   server
//!   ClientHello { key_c, nonce_c }  ──────▶  allow-list check
//!                                 ◀──────  ServerHello { key_s, nonce_s, sig_s }
//!   pin check, verify sig_s
//!   ClientProof { sig_c }           ──────▶  verify sig_c
//!                                 ◀──────  Accept  (or Reject { reason })
//! ```
//!
//! Both signatures cover a [`Transcript`] binding the two fresh nonces and
//! both public keys, so a recorded signature is useless on another
//! connection. Messages travel as JSON inside binary WebSocket messages.

use ed25519_dalek::{Signature, Signer, SigningKey, SIGNATURE_LENGTH};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::WireError;
use crate::identity::PeerIdentity;

/// Current handshake protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

const TRANSCRIPT_DOMAIN: &[u8] = b"wsrpc-handshake-v1";

/// A fresh random challenge.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Draw a new nonce from the thread RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; NONCE_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

/// Which side of the handshake produced a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Self::Client => b"client",
            Self::Server => b"server",
        }
    }
}

/// Handshake messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    /// Client opens with its key and challenge.
    #[serde(rename = "client_hello")]
    ClientHello {
        version: u32,
        public_key: PeerIdentity,
        nonce: Nonce,
    },
    /// Server answers with its key, its challenge, and its transcript signature.
    #[serde(rename = "server_hello")]
    ServerHello {
        version: u32,
        public_key: PeerIdentity,
        nonce: Nonce,
        /// Hex Ed25519 signature over the server transcript.
        signature: String,
    },
    /// Client proves possession of its private key.
    #[serde(rename = "client_proof")]
    ClientProof {
        /// Hex Ed25519 signature over the client transcript.
        signature: String,
    },
    /// Server accepted the client; RPC traffic may flow.
    #[serde(rename = "accept")]
    Accept,
    /// Either side refused; the connection is about to close.
    #[serde(rename = "reject")]
    Reject { reason: String },
}

impl HandshakeMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientHello { .. } => "client_hello",
            Self::ServerHello { .. } => "server_hello",
            Self::ClientProof { .. } => "client_proof",
            Self::Accept => "accept",
            Self::Reject { .. } => "reject",
        }
    }
}

/// Reject a peer speaking another protocol version.
pub fn check_version(remote: u32) -> Result<(), WireError> {
    if remote != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote,
        });
    }
    Ok(())
}

/// The values both sides sign once both nonces are known.
#[derive(Debug, Clone, Copy)]
pub struct Transcript {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub client_key: PeerIdentity,
    pub server_key: PeerIdentity,
}

impl Transcript {
    /// SHA-256 over domain, role, both nonces and both keys.
    pub fn digest(&self, role: Role) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(TRANSCRIPT_DOMAIN);
        hasher.update(role.label());
        hasher.update(self.client_nonce.as_bytes());
        hasher.update(self.server_nonce.as_bytes());
        hasher.update(self.client_key.as_bytes());
        hasher.update(self.server_key.as_bytes());
        hasher.finalize().into()
    }

    /// Sign this transcript as `role`, returning a hex signature.
    pub fn sign(&self, role: Role, key: &SigningKey) -> String {
        let signature = key.sign(&self.digest(role));
        hex::encode(signature.to_bytes())
    }

    /// Verify a hex signature made by `role`'s key over this transcript.
    pub fn verify(&self, role: Role, signature_hex: &str) -> Result<(), WireError> {
        let signer = match role {
            Role::Client => self.client_key,
            Role::Server => self.server_key,
        };
        let bytes = hex::decode(signature_hex)?;
        let sig_bytes: [u8; SIGNATURE_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            WireError::InvalidSignature(format!(
                "expected {SIGNATURE_LENGTH} bytes, got {}",
                bytes.len()
            ))
        })?;
        let signature = Signature::from_bytes(&sig_bytes);
        signer
            .verifying_key()?
            .verify_strict(&self.digest(role), &signature)
            .map_err(|e| WireError::InvalidSignature(e.to_string()))
    }
}
