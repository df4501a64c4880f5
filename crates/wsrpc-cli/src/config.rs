//! CLI configuration file and key files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use wsrpc::wire::{signing_key_to_hex, SigningKey};
use wsrpc::{
    signing_key_from_hex, ClientCredentials, ClientOptions, KeepaliveConfig, PeerIdentity,
    RpcError, ServerCredentials, ServerOptions,
};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Key(String),
    #[error("{0}")]
    Missing(&'static str),
    #[error("invalid config: {0} must be greater than zero")]
    Zero(&'static str),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// `~/.wsrpc/config.toml` contents. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Address `serve` binds.
    pub listen: String,
    /// Address `call` dials: host:port or ws:// URL.
    pub server_url: String,
    /// Hex secret key file for this node.
    pub key_file: PathBuf,
    /// Expected server public key (hex) for `call`.
    pub server_public_key: Option<String>,
    /// Client public keys (hex) that `serve` admits.
    pub allowed_clients: Vec<String>,
    pub write_timeout_ms: u64,
    pub pong_wait_ms: u64,
    pub handshake_timeout_ms: u64,
    pub read_limit: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".to_string(),
            server_url: "ws://127.0.0.1:7400/".to_string(),
            key_file: wsrpc_home().join("key"),
            server_public_key: None,
            allowed_clients: Vec::new(),
            write_timeout_ms: wsrpc::config::DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            pong_wait_ms: wsrpc::config::DEFAULT_PONG_WAIT.as_millis() as u64,
            handshake_timeout_ms: wsrpc::config::DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            read_limit: wsrpc::config::DEFAULT_READ_LIMIT,
        }
    }
}

impl CliConfig {
    pub fn allowed_identities(&self) -> Result<Vec<PeerIdentity>, CliError> {
        self.allowed_clients
            .iter()
            .map(|hex| parse_public_key(hex))
            .collect()
    }

    pub fn server_options(&self, signing_key: SigningKey) -> Result<ServerOptions, CliError> {
        let limits = self.limits()?;
        let credentials = ServerCredentials::new(signing_key, self.allowed_identities()?);
        Ok(ServerOptions::new(credentials)
            .with_read_limit(limits.read_limit)
            .with_write_timeout(limits.write_timeout)
            .with_handshake_timeout(limits.handshake_timeout)
            .with_keepalive(KeepaliveConfig::new(limits.pong_wait)))
    }

    pub fn client_options(
        &self,
        signing_key: SigningKey,
        server_key: PeerIdentity,
    ) -> Result<ClientOptions, CliError> {
        let limits = self.limits()?;
        Ok(ClientOptions::new(ClientCredentials::new(signing_key, server_key))
            .with_read_limit(limits.read_limit)
            .with_write_timeout(limits.write_timeout)
            .with_handshake_timeout(limits.handshake_timeout)
            .with_keepalive(KeepaliveConfig::new(limits.pong_wait)))
    }

    /// A zero timeout or read limit would fail every connection immediately.
    fn limits(&self) -> Result<Limits, CliError> {
        fn millis(value: u64, field: &'static str) -> Result<Duration, CliError> {
            if value == 0 {
                return Err(CliError::Zero(field));
            }
            Ok(Duration::from_millis(value))
        }
        if self.read_limit == 0 {
            return Err(CliError::Zero("read_limit"));
        }
        Ok(Limits {
            write_timeout: millis(self.write_timeout_ms, "write_timeout_ms")?,
            pong_wait: millis(self.pong_wait_ms, "pong_wait_ms")?,
            handshake_timeout: millis(self.handshake_timeout_ms, "handshake_timeout_ms")?,
            read_limit: self.read_limit,
        })
    }
}

struct Limits {
    write_timeout: Duration,
    pong_wait: Duration,
    handshake_timeout: Duration,
    read_limit: usize,
}

/// Load the config file. A missing file yields defaults; an unreadable or
/// malformed one is an error.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig, CliError> {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return Ok(CliConfig::default());
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|source| CliError::Io {
        path: config_path.clone(),
        source,
    })?;
    let config = toml::from_str::<CliConfig>(&contents).map_err(|source| CliError::Parse {
        path: config_path.clone(),
        source,
    })?;
    info!(path = %config_path.display(), "Loaded configuration");
    Ok(config)
}

pub fn default_config_path() -> PathBuf {
    wsrpc_home().join("config.toml")
}

pub fn wsrpc_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".wsrpc")
}

pub fn parse_public_key(hex: &str) -> Result<PeerIdentity, CliError> {
    PeerIdentity::from_hex(hex).map_err(|e| CliError::Key(format!("public key {hex:?}: {e}")))
}

/// Read a hex secret key file.
pub fn read_signing_key(path: &Path) -> Result<SigningKey, CliError> {
    let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?);
    signing_key_from_hex(&contents)
        .map_err(|e| CliError::Key(format!("{}: {e}", path.display())))
}

/// Write a hex secret key file readable only by its owner.
pub fn write_signing_key(path: &Path, key: &SigningKey) -> Result<(), CliError> {
    let io_err = |source| CliError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let secret = Zeroizing::new(signing_key_to_hex(key));
    std::fs::write(path, secret.as_bytes()).map_err(io_err)?;
    restrict_file_permissions(path);
    Ok(())
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wsrpc::generate_signing_key;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.pong_wait_ms, 20_000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let allowed = PeerIdentity::from(&generate_signing_key());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen = \"0.0.0.0:9000\"\nallowed_clients = [\"{}\"]\npong_wait_ms = 5000",
            allowed.to_hex()
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.pong_wait_ms, 5000);
        assert_eq!(config.write_timeout_ms, 10_000);
        assert_eq!(config.allowed_identities().unwrap(), vec![allowed]);

        let opts = config.server_options(generate_signing_key()).unwrap();
        assert_eq!(opts.keepalive.ping_period(), Duration::from_millis(4500));
        assert!(opts.credentials.allowed_clients.contains(&allowed));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen = [not toml").unwrap();
        assert!(matches!(
            load_config(Some(file.path())),
            Err(CliError::Parse { .. })
        ));
    }

    #[test]
    fn test_bad_allowed_key_reported() {
        let config = CliConfig {
            allowed_clients: vec!["abcd".to_string()],
            ..CliConfig::default()
        };
        let err = config.server_options(generate_signing_key()).unwrap_err();
        assert!(matches!(err, CliError::Key(msg) if msg.contains("abcd")));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let server_id = PeerIdentity::from(&generate_signing_key());
        for field in ["pong_wait_ms", "write_timeout_ms", "handshake_timeout_ms", "read_limit"] {
            let mut config = CliConfig::default();
            match field {
                "pong_wait_ms" => config.pong_wait_ms = 0,
                "write_timeout_ms" => config.write_timeout_ms = 0,
                "handshake_timeout_ms" => config.handshake_timeout_ms = 0,
                _ => config.read_limit = 0,
            }
            let err = config.server_options(generate_signing_key()).unwrap_err();
            assert!(matches!(err, CliError::Zero(name) if name == field));
            let err = config
                .client_options(generate_signing_key(), server_id)
                .unwrap_err();
            assert!(matches!(err, CliError::Zero(name) if name == field));
        }
    }

    #[test]
    fn test_default_limits_accepted() {
        let config = CliConfig::default();
        let server_id = PeerIdentity::from(&generate_signing_key());
        let opts = config.client_options(generate_signing_key(), server_id).unwrap();
        assert_eq!(opts.write_timeout, Duration::from_secs(10));
        assert_eq!(opts.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.key");
        let key = generate_signing_key();
        write_signing_key(&path, &key).unwrap();

        let restored = read_signing_key(&path).unwrap();
        assert_eq!(PeerIdentity::from(&restored), PeerIdentity::from(&key));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_unreadable_key_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_signing_key(&dir.path().join("missing.key")),
            Err(CliError::Io { .. })
        ));
    }
}
