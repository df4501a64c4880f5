//! wsrpc CLI: generate keys, run an echo server, call it.

mod cli;
mod commands;
mod config;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::CallArgs;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Keygen { out, force } => commands::keygen(&config, out, force),
        Commands::Pubkey { key_file } => commands::pubkey(&config, key_file),
        Commands::Serve {
            listen,
            key_file,
            allow,
        } => run_async(commands::serve(config, listen, key_file, allow)),
        Commands::Call {
            body,
            server,
            server_key,
            key_file,
            delay_ms,
            timeout_ms,
        } => run_async(commands::call(
            config,
            CallArgs {
                body,
                server,
                server_key,
                key_file,
                delay_ms,
                timeout_ms,
            },
        )),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run_async<F>(fut: F) -> Result<(), config::CliError>
where
    F: std::future::Future<Output = Result<(), config::CliError>>,
{
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(fut),
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    }
}
