use std::path::Path;

use config::{Config, Environment, File};

use super::{BrokerConfig, ClientConfig};
use crate::{CorvidError, Result};

const ENV_PREFIX: &str = "CORVID";

impl BrokerConfig {
    /// Defaults overridden by `CORVID_*` environment variables
    /// (nested fields use `__`, e.g. `CORVID_SECURITY__ENABLED`)
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(env_source())
            .build()
            .map_err(|e| CorvidError::Config(e.to_string()))?;

        settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| CorvidError::Config(e.to_string()))
    }

    /// Defaults overridden by a TOML/JSON/YAML file, then by the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(env_source())
            .build()
            .map_err(|e| CorvidError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| CorvidError::Config(e.to_string()))?;
        config.validate().map_err(CorvidError::Config)?;
        Ok(config)
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .map_err(|e| CorvidError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<ClientConfig>()
            .map_err(|e| CorvidError::Config(e.to_string()))?;
        config.validate().map_err(CorvidError::Config)?;
        Ok(config)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressFullPolicy;
    use std::io::Write;

    #[test]
    fn test_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
data_dir = "/var/lib/corvid"
connection_scan_period_ms = 2500

[default_address_settings]
max_size_bytes = 1048576
address_full_policy = "BLOCK"

[[acceptors]]
kind = "tcp"
host = "127.0.0.1"
port = 6100
"#
        )
        .unwrap();

        let config = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(config.data_dir, "/var/lib/corvid");
        assert_eq!(config.connection_scan_period_ms, 2500);
        assert_eq!(config.default_address_settings.max_size_bytes, 1_048_576);
        assert_eq!(
            config.default_address_settings.address_full_policy,
            AddressFullPolicy::Block
        );
        assert_eq!(config.acceptors[0].port, 6100);
        assert_eq!(config.max_connections, 1000);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = BrokerConfig::from_file("/nonexistent/corvid.toml").unwrap_err();
        assert!(matches!(err, CorvidError::Config(_)));
    }

    #[test]
    fn test_client_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(
            &path,
            r#"{"connector": {"kind": "invm", "server_id": 4}, "ack_batch_size": 4096}"#,
        )
        .unwrap();
        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.connector.server_id, 4);
        assert_eq!(config.ack_batch_size, 4096);
        assert!(config.block_on_durable_send);
    }
}
