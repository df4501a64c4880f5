//! wsrpc wire format. Everything that crosses the socket.
//!
//! Pure data and crypto, no I/O. The `wsrpc` crate drives these types over a
//! WebSocket.
//!
//! ## Contents
//!
//! - **Frame**: binary RPC frames (request, response, error, ping, pong)
//! - **HandshakeMessage**: JSON messages of the challenge-response handshake
//! - **Transcript**: the bytes each side signs to prove key possession
//! - **PeerIdentity**: a verified Ed25519 public key

pub mod error;
pub mod frame;
pub mod handshake;
pub mod identity;

pub use error::WireError;
pub use ed25519_dalek::SigningKey;
pub use frame::{Frame, FrameKind, MAX_METHOD_LEN};
pub use handshake::{check_version, HandshakeMessage, Nonce, Role, Transcript, PROTOCOL_VERSION};
pub use identity::{generate_signing_key, signing_key_from_hex, signing_key_to_hex, PeerIdentity};
