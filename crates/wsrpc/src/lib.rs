//! RPC over WebSocket, authenticated by static Ed25519 keys.
//!
//! A [`Server`] accepts connections from clients whose public keys are on its
//! allow-list; a [`Client`] dials a server whose public key it pins. Once the
//! handshake completes, either side can call methods the other registered.
//! Calls are multiplexed over one connection by correlation id.
//!
//! ```text
//! Client::dial ─▶ auth::client_handshake ─▶ Connection ─┬─ read pump  ─▶ calls / dispatch
//!                                                        └─ write pump ◀─ outbound queue
//! ```

pub mod auth;
mod calls;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod echo;
pub mod error;
pub mod invoker;
pub mod server;
pub mod transport;

pub use async_trait::async_trait;
pub use client::Client;
pub use codec::{decode_payload, encode_payload};
pub use config::{ClientCredentials, ClientOptions, KeepaliveConfig, ServerCredentials, ServerOptions};
pub use context::{CallContext, CancelHandle, CancelToken};
pub use dispatch::{HandlerError, HandlerFn, HandlerFuture, MethodDesc, ServiceDesc, ServiceRegistrar, ServiceRegistry};
pub use error::{CloseReason, RpcError, RpcResult};
pub use invoker::{invoke, Invoker};
pub use server::Server;
pub use transport::{ConnState, Connection};
pub use wsrpc_wire::{generate_signing_key, signing_key_from_hex, PeerIdentity};
pub use wsrpc_wire as wire;
