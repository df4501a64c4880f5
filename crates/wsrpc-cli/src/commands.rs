//! Subcommand implementations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use wsrpc::echo::{register_echo_server, EchoClient, EchoRequest, EchoService};
use wsrpc::{generate_signing_key, CallContext, Client, PeerIdentity, Server};

use crate::config::{
    parse_public_key, read_signing_key, write_signing_key, CliConfig, CliError,
};

pub fn keygen(config: &CliConfig, out: Option<PathBuf>, force: bool) -> Result<(), CliError> {
    let path = out.unwrap_or_else(|| config.key_file.clone());
    if path.exists() && !force {
        return Err(CliError::Key(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let key = generate_signing_key();
    write_signing_key(&path, &key)?;
    println!("Key written to {}", path.display());
    println!("Public key: {}", PeerIdentity::from(&key));
    Ok(())
}

pub fn pubkey(config: &CliConfig, key_file: Option<PathBuf>) -> Result<(), CliError> {
    let path = key_file.unwrap_or_else(|| config.key_file.clone());
    let key = read_signing_key(&path)?;
    println!("{}", PeerIdentity::from(&key));
    Ok(())
}

pub async fn serve(
    mut config: CliConfig,
    listen: Option<String>,
    key_file: Option<PathBuf>,
    allow: Vec<String>,
) -> Result<(), CliError> {
    if let Some(listen) = listen {
        config.listen = listen;
    }
    config.allowed_clients.extend(allow);
    let key = read_signing_key(&key_file.unwrap_or_else(|| config.key_file.clone()))?;

    let options = config.server_options(key)?;
    if options.credentials.allowed_clients.is_empty() {
        tracing::warn!("No allowed clients configured; every connection will be rejected");
    }
    let server = Server::new(options);
    register_echo_server(&server, Arc::new(EchoService))?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|source| CliError::Io {
            path: PathBuf::from(&config.listen),
            source,
        })?;
    println!("Serving on {}", config.listen);
    println!("Server public key: {}", server.public_key());

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            stopper.stop();
        }
    });
    server.serve(listener).await?;
    Ok(())
}

pub struct CallArgs {
    pub body: String,
    pub server: Option<String>,
    pub server_key: Option<String>,
    pub key_file: Option<PathBuf>,
    pub delay_ms: u64,
    pub timeout_ms: Option<u64>,
}

pub async fn call(config: CliConfig, args: CallArgs) -> Result<(), CliError> {
    let server_key_hex = args
        .server_key
        .or_else(|| config.server_public_key.clone())
        .ok_or(CliError::Missing(
            "server public key (pass --server-key or set server_public_key)",
        ))?;
    let server_key = parse_public_key(&server_key_hex)?;
    let key = read_signing_key(&args.key_file.unwrap_or_else(|| config.key_file.clone()))?;
    let addr = args.server.unwrap_or_else(|| config.server_url.clone());

    let client = Client::dial(&addr, config.client_options(key, server_key)?).await?;
    let mut ctx = CallContext::new();
    if let Some(ms) = args.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    let reply = EchoClient::new(client.clone())
        .echo(
            &ctx,
            &EchoRequest {
                body: args.body,
                delay_ms: args.delay_ms,
            },
        )
        .await?;
    println!("{}", reply.body);

    client.close();
    client.closed().await;
    Ok(())
}
