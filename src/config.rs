//! Loading the client configuration file.
use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::{connection::ReplyMode, error::*, transport::Address, Client};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Contents of `config.json`.
///
/// ```json
/// { "server_address": "127.0.0.1:9000", "timeout_ms": 5000, "reply_mode": "first_frame" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Destination of every exchange; see [`Address`] for the accepted forms.
    pub server_address: String,
    /// Deadline for a whole exchange. Absent means wait indefinitely.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub reply_mode: ReplyMode,
}

impl Config {
    /// Reads and parses a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| RpcError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| RpcError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.address().map_err(|e| RpcError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    pub fn address(&self) -> Result<Address> {
        self.server_address.parse()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Builds a [`Client`] with every setting from this configuration applied.
    pub fn client(&self) -> Result<Client> {
        let mut client = Client::new(self.address()?).with_reply_mode(self.reply_mode);
        if let Some(timeout) = self.timeout() {
            client = client.with_timeout(timeout);
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal() {
        let file = write_config(r#"{"server_address": "127.0.0.1:9000"}"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.address().unwrap(), Address::Tcp("127.0.0.1:9000".into()));
        assert_eq!(config.timeout(), None);
        assert_eq!(config.reply_mode, ReplyMode::FirstFrame);

        let client = config.client().unwrap();
        assert_eq!(client.address(), &Address::Tcp("127.0.0.1:9000".into()));
    }

    #[test]
    fn test_load_full() {
        let file = write_config(
            r#"{"server_address": "/tmp/socket_file", "timeout_ms": 1500, "reply_mode": "until_close"}"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.address().unwrap(), Address::Unix("/tmp/socket_file".into()));
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.reply_mode, ReplyMode::UntilClose);
    }

    #[test]
    fn test_load_errors() {
        let missing = Config::load("/nonexistent/dir/config.json");
        assert!(matches!(missing, Err(RpcError::Config { .. })));

        for text in [
            "not json",
            "{}",
            r#"{"server_address": ""}"#,
            r#"{"server_address": "127.0.0.1:9000", "reply_mode": "sometimes"}"#,
        ] {
            let file = write_config(text);
            assert!(
                matches!(Config::load(file.path()), Err(RpcError::Config { .. })),
                "expected config error for {}",
                text
            );
        }
    }
}
