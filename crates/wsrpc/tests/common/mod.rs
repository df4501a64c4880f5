//! Shared fixtures: a server on an ephemeral port plus a recording Echo service.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::net::TcpListener;
use wsrpc::echo::{register_echo_server, EchoRequest, EchoResponse, EchoServer};
use wsrpc::{
    async_trait, generate_signing_key, CallContext, Client, ClientCredentials, ClientOptions,
    HandlerError, PeerIdentity, Server, ServerCredentials, ServerOptions,
};

/// Echo implementation that remembers who called and how many calls finished.
#[derive(Default)]
pub struct RecordingEcho {
    pub completed: AtomicUsize,
    pub callers: Mutex<Vec<Option<PeerIdentity>>>,
}

impl RecordingEcho {
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn callers(&self) -> Vec<Option<PeerIdentity>> {
        self.callers.lock().unwrap().clone()
    }
}

#[async_trait]
impl EchoServer for RecordingEcho {
    async fn echo(&self, ctx: CallContext, request: EchoRequest) -> Result<EchoResponse, HandlerError> {
        self.callers.lock().unwrap().push(ctx.peer());
        if request.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(request.delay_ms)).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(EchoResponse { body: request.body })
    }
}

pub struct Fixture {
    pub server: Server,
    pub addr: SocketAddr,
    pub server_id: PeerIdentity,
    pub client_key: SigningKey,
    pub echo: Arc<RecordingEcho>,
}

impl Fixture {
    pub fn client_id(&self) -> PeerIdentity {
        PeerIdentity::from(&self.client_key)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::new(ClientCredentials::new(
            self.client_key.clone(),
            self.server_id,
        ))
    }

    pub async fn dial(&self) -> Client {
        Client::dial(&self.addr.to_string(), self.client_options())
            .await
            .expect("dial should succeed")
    }

    /// Wait until the server has registered a connection for `peer`.
    pub async fn wait_for_peer(&self, peer: PeerIdentity) {
        for _ in 0..200 {
            if self.server.connected_peers().contains(&peer) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server never registered {peer}");
    }
}

pub async fn start_server() -> Fixture {
    start_server_with(|opts| opts).await
}

/// Start a server admitting one freshly generated client key.
pub async fn start_server_with(configure: impl FnOnce(ServerOptions) -> ServerOptions) -> Fixture {
    let server_key = generate_signing_key();
    let client_key = generate_signing_key();
    let server_id = PeerIdentity::from(&server_key);
    let options = configure(ServerOptions::new(ServerCredentials::new(
        server_key,
        [PeerIdentity::from(&client_key)],
    )));

    let server = Server::new(options);
    let echo = Arc::new(RecordingEcho::default());
    register_echo_server(&server, echo.clone()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    Fixture {
        server,
        addr,
        server_id,
        client_key,
        echo,
    }
}

pub fn request(body: &str, delay_ms: u64) -> EchoRequest {
    EchoRequest {
        body: body.to_string(),
        delay_ms,
    }
}
