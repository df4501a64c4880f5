//! Clap CLI definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  wsrpc keygen --out server.key           Create a key pair, print the public key
  wsrpc serve --allow <client-pubkey>     Run the echo server
  wsrpc call --server-key <pubkey> hello  Call Echo on a server";

/// wsrpc: RPC over WebSocket with Ed25519 peer keys.
#[derive(Parser)]
#[command(name = "wsrpc", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.wsrpc/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a signing key and print its public key.
    Keygen {
        /// Where to write the hex secret key (default: key_file from config).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Overwrite an existing key file.
        #[arg(long)]
        force: bool,
    },
    /// Print the public key of a key file.
    Pubkey {
        /// Key file to read (default: key_file from config).
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
    /// Run an echo server until Ctrl+C.
    Serve {
        /// Listen address, e.g. 127.0.0.1:7400.
        #[arg(long)]
        listen: Option<String>,
        /// Server key file.
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Client public key (hex) to admit. Repeatable; adds to the config list.
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// Call Echo on a server and print the reply.
    Call {
        /// The text to echo.
        body: String,
        /// Server address: host:port or ws:// URL.
        #[arg(long)]
        server: Option<String>,
        /// Expected server public key (hex).
        #[arg(long)]
        server_key: Option<String>,
        /// Client key file.
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Ask the server to wait this long before answering.
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Give up after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}
