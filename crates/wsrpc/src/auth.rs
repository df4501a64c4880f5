//! The async side of the handshake: drives [`HandshakeMessage`]s over a
//! freshly upgraded WebSocket before any RPC frame is exchanged.

use ed25519_dalek::SigningKey;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use wsrpc_wire::{check_version, HandshakeMessage, Nonce, PeerIdentity, Role, Transcript, PROTOCOL_VERSION};

use crate::error::RpcError;

fn auth_err(msg: impl Into<String>) -> RpcError {
    RpcError::Authentication(msg.into())
}

async fn send_msg<W>(ws: &mut W, msg: &HandshakeMessage) -> Result<(), RpcError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let bytes = msg
        .to_bytes()
        .map_err(|e| auth_err(format!("encode {}: {e}", msg.name())))?;
    ws.send(Message::Binary(bytes))
        .await
        .map_err(|e| auth_err(format!("send {}: {e}", msg.name())))
}

async fn recv_msg<W>(ws: &mut W) -> Result<HandshakeMessage, RpcError>
where
    W: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(bytes))) => {
                return HandshakeMessage::from_bytes(&bytes)
                    .map_err(|e| auth_err(format!("bad handshake message: {e}")));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(auth_err("connection closed during handshake"));
            }
            Some(Ok(_)) => return Err(auth_err("unexpected message type during handshake")),
            Some(Err(e)) => return Err(auth_err(format!("read failed: {e}"))),
        }
    }
}

async fn reject<W>(ws: &mut W, reason: &str)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let msg = HandshakeMessage::Reject {
        reason: reason.to_string(),
    };
    if let Err(e) = send_msg(ws, &msg).await {
        debug!(error = %e, "Could not deliver handshake rejection");
    }
}

/// Authenticate to a server whose key must equal `expected_server`.
/// Returns the server's identity.
pub async fn client_handshake<W>(
    ws: &mut W,
    signing_key: &SigningKey,
    expected_server: &PeerIdentity,
) -> Result<PeerIdentity, RpcError>
where
    W: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let client_key = PeerIdentity::from(signing_key);
    let client_nonce = Nonce::random();
    send_msg(
        ws,
        &HandshakeMessage::ClientHello {
            version: PROTOCOL_VERSION,
            public_key: client_key,
            nonce: client_nonce,
        },
    )
    .await?;

    let (server_key, server_nonce, server_sig) = match recv_msg(ws).await? {
        HandshakeMessage::ServerHello {
            version,
            public_key,
            nonce,
            signature,
        } => {
            check_version(version).map_err(|e| auth_err(e.to_string()))?;
            (public_key, nonce, signature)
        }
        HandshakeMessage::Reject { reason } => {
            return Err(auth_err(format!("server rejected: {reason}")));
        }
        other => {
            return Err(auth_err(format!("expected server_hello, got {}", other.name())));
        }
    };

    if !server_key.ct_eq(expected_server) {
        warn!(expected = %expected_server, got = %server_key, "Server key mismatch");
        reject(ws, "unexpected server key").await;
        return Err(auth_err("server public key does not match the pinned key"));
    }

    let transcript = Transcript {
        client_nonce,
        server_nonce,
        client_key,
        server_key,
    };
    if let Err(e) = transcript.verify(Role::Server, &server_sig) {
        reject(ws, "bad server signature").await;
        return Err(auth_err(format!("server signature: {e}")));
    }

    send_msg(
        ws,
        &HandshakeMessage::ClientProof {
            signature: transcript.sign(Role::Client, signing_key),
        },
    )
    .await?;

    match recv_msg(ws).await? {
        HandshakeMessage::Accept => {
            debug!(server = %server_key, "Handshake accepted");
            Ok(server_key)
        }
        HandshakeMessage::Reject { reason } => Err(auth_err(format!("server rejected: {reason}"))),
        other => Err(auth_err(format!("expected accept, got {}", other.name()))),
    }
}

/// Authenticate an inbound client, admitting only keys for which
/// `is_allowed` holds. Returns the client's identity.
pub async fn server_handshake<W, F>(
    ws: &mut W,
    signing_key: &SigningKey,
    is_allowed: F,
) -> Result<PeerIdentity, RpcError>
where
    W: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    F: Fn(&PeerIdentity) -> bool,
{
    let server_key = PeerIdentity::from(signing_key);

    let (client_key, client_nonce) = match recv_msg(ws).await? {
        HandshakeMessage::ClientHello {
            version,
            public_key,
            nonce,
        } => {
            if let Err(e) = check_version(version) {
                reject(ws, &e.to_string()).await;
                return Err(auth_err(e.to_string()));
            }
            (public_key, nonce)
        }
        other => {
            let reason = format!("expected client_hello, got {}", other.name());
            reject(ws, &reason).await;
            return Err(auth_err(reason));
        }
    };

    if !is_allowed(&client_key) {
        warn!(client = %client_key, "Client key not in allow-list");
        reject(ws, "client key not allowed").await;
        return Err(auth_err(format!("client {client_key} not allowed")));
    }

    let server_nonce = Nonce::random();
    let transcript = Transcript {
        client_nonce,
        server_nonce,
        client_key,
        server_key,
    };
    send_msg(
        ws,
        &HandshakeMessage::ServerHello {
            version: PROTOCOL_VERSION,
            public_key: server_key,
            nonce: server_nonce,
            signature: transcript.sign(Role::Server, signing_key),
        },
    )
    .await?;

    match recv_msg(ws).await? {
        HandshakeMessage::ClientProof { signature } => {
            if let Err(e) = transcript.verify(Role::Client, &signature) {
                reject(ws, "bad client signature").await;
                return Err(auth_err(format!("client signature: {e}")));
            }
        }
        HandshakeMessage::Reject { reason } => {
            return Err(auth_err(format!("client aborted: {reason}")));
        }
        other => {
            let reason = format!("expected client_proof, got {}", other.name());
            reject(ws, &reason).await;
            return Err(auth_err(reason));
        }
    }

    send_msg(ws, &HandshakeMessage::Accept).await?;
    debug!(client = %client_key, "Handshake accepted");
    Ok(client_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use wsrpc_wire::generate_signing_key;

    /// In-memory duplex standing in for a WebSocket.
    struct Duplex {
        tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    fn duplex_pair() -> (Duplex, Duplex) {
        let (a_tx, b_rx) = mpsc::unbounded();
        let (b_tx, a_rx) = mpsc::unbounded();
        (
            Duplex { tx: a_tx, rx: a_rx },
            Duplex { tx: b_tx, rx: b_rx },
        )
    }

    impl futures::Stream for Duplex {
        type Item = Result<Message, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.rx).poll_next(cx).map(|m| m.map(Ok))
        }
    }

    impl Sink<Message> for Duplex {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.tx
                .unbounded_send(item)
                .map_err(|_| WsError::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            self.tx.close_channel();
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_mutual_authentication() {
        let client_key = generate_signing_key();
        let server_key = generate_signing_key();
        let client_id = PeerIdentity::from(&client_key);
        let server_id = PeerIdentity::from(&server_key);
        let (mut c, mut s) = duplex_pair();

        let (client_res, server_res) = tokio::join!(
            client_handshake(&mut c, &client_key, &server_id),
            server_handshake(&mut s, &server_key, |k| *k == client_id),
        );
        assert_eq!(client_res.unwrap(), server_id);
        assert_eq!(server_res.unwrap(), client_id);
    }

    #[tokio::test]
    async fn test_client_not_allowed() {
        let client_key = generate_signing_key();
        let server_key = generate_signing_key();
        let server_id = PeerIdentity::from(&server_key);
        let (mut c, mut s) = duplex_pair();

        let (client_res, server_res) = tokio::join!(
            client_handshake(&mut c, &client_key, &server_id),
            server_handshake(&mut s, &server_key, |_| false),
        );
        assert!(matches!(client_res, Err(RpcError::Authentication(msg)) if msg.contains("not allowed")));
        assert!(matches!(server_res, Err(RpcError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_wrong_server_key_pinned() {
        let client_key = generate_signing_key();
        let server_key = generate_signing_key();
        let expected = PeerIdentity::from(&generate_signing_key());
        let (mut c, mut s) = duplex_pair();

        let (client_res, server_res) = tokio::join!(
            client_handshake(&mut c, &client_key, &expected),
            server_handshake(&mut s, &server_key, |_| true),
        );
        assert!(matches!(client_res, Err(RpcError::Authentication(msg)) if msg.contains("pinned")));
        assert!(matches!(server_res, Err(RpcError::Authentication(msg)) if msg.contains("aborted")));
    }

    #[tokio::test]
    async fn test_forged_server_hello() {
        // An impostor claims the expected server key but cannot sign with it.
        let client_key = generate_signing_key();
        let real_server = PeerIdentity::from(&generate_signing_key());
        let impostor = generate_signing_key();
        let (mut c, mut s) = duplex_pair();

        let impostor_side = async {
            let hello = recv_msg(&mut s).await.unwrap();
            let HandshakeMessage::ClientHello { public_key, nonce, .. } = hello else {
                panic!("expected client hello");
            };
            let server_nonce = Nonce::random();
            let transcript = Transcript {
                client_nonce: nonce,
                server_nonce,
                client_key: public_key,
                server_key: real_server,
            };
            send_msg(
                &mut s,
                &HandshakeMessage::ServerHello {
                    version: PROTOCOL_VERSION,
                    public_key: real_server,
                    nonce: server_nonce,
                    signature: transcript.sign(Role::Server, &impostor),
                },
            )
            .await
            .unwrap();
            recv_msg(&mut s).await
        };

        let (client_res, impostor_res) = tokio::join!(
            client_handshake(&mut c, &client_key, &real_server),
            impostor_side,
        );
        assert!(matches!(client_res, Err(RpcError::Authentication(msg)) if msg.contains("signature")));
        assert!(matches!(impostor_res, Ok(HandshakeMessage::Reject { .. })));
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let server_key = generate_signing_key();
        let (mut c, mut s) = duplex_pair();

        let client_side = async {
            send_msg(
                &mut c,
                &HandshakeMessage::ClientHello {
                    version: PROTOCOL_VERSION + 1,
                    public_key: PeerIdentity::from(&generate_signing_key()),
                    nonce: Nonce::random(),
                },
            )
            .await
            .unwrap();
            recv_msg(&mut c).await
        };
        let (client_res, server_res) =
            tokio::join!(client_side, server_handshake(&mut s, &server_key, |_| true));
        assert!(matches!(client_res, Ok(HandshakeMessage::Reject { .. })));
        assert!(matches!(server_res, Err(RpcError::Authentication(msg)) if msg.contains("version")));
    }

    #[tokio::test]
    async fn test_peer_hangup_during_handshake() {
        let (mut c, s) = duplex_pair();
        drop(s);
        let res = client_handshake(
            &mut c,
            &generate_signing_key(),
            &PeerIdentity::from(&generate_signing_key()),
        )
        .await;
        assert!(matches!(res, Err(RpcError::Authentication(_))));
    }
}
