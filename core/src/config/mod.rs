pub mod settings;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::remoting::transport::TransportKind;
use crate::security::CheckType;

/// Protocol version spoken by this build; sessions from other versions are refused
pub const PROTOCOL_VERSION: i32 = 1;

/// One acceptor or connector endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    /// Registry id for in-VM endpoints
    pub server_id: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            host: "0.0.0.0".to_string(),
            port: 5445,
            server_id: 0,
        }
    }
}

impl TransportConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: TransportKind::Tcp,
            host: host.into(),
            port,
            server_id: 0,
        }
    }

    pub fn in_vm(server_id: u32) -> Self {
        Self {
            kind: TransportKind::InVm,
            server_id,
            ..Self::default()
        }
    }

    pub fn describe(&self) -> String {
        match self.kind {
            TransportKind::Tcp => format!("tcp://{}:{}", self.host, self.port),
            TransportKind::InVm => format!("invm://{}", self.server_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AddressFullPolicy {
    #[default]
    Page,
    Block,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSettings {
    /// Memory limit of the address in bytes, -1 for unbounded
    pub max_size_bytes: i64,
    /// A page is closed once it reaches this size
    pub page_size_bytes: u64,
    pub address_full_policy: AddressFullPolicy,
    /// Producer credits are withheld while page files exceed this, 0 for no limit
    pub max_page_store_bytes: u64,
    pub page_cache_max_pages: usize,
    /// Paged messages a queue holds in memory before it stops depaging
    pub max_depaged_messages: usize,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: -1,
            page_size_bytes: 10 * 1024 * 1024,
            address_full_policy: AddressFullPolicy::Page,
            max_page_store_bytes: 0,
            page_cache_max_pages: 5,
            max_depaged_messages: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    pub roles: Vec<String>,
}

/// Permissions of a role on the addresses matching `pattern`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub pattern: String,
    pub role: String,
    pub permissions: Vec<CheckType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub users: Vec<UserConfig>,
    pub grants: Vec<RoleGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub data_dir: String,
    /// Journal to disk; otherwise state lives in memory only
    pub persistence_enabled: bool,
    pub journal_sync_writes: bool,
    pub acceptors: Vec<TransportConfig>,
    pub max_connections: usize,
    pub max_frame_size: usize,
    /// TTL applied when a client does not announce one
    pub connection_ttl_ms: i64,
    pub connection_scan_period_ms: u64,
    /// How long a session survives its connection, waiting to be reattached
    pub session_reattach_ttl_ms: u64,
    pub transaction_timeout_secs: i32,
    pub transaction_scan_period_ms: u64,
    /// Concurrent connection-failure callbacks
    pub failure_callback_workers: usize,
    pub duplicate_id_cache_size: usize,
    pub default_address_settings: AddressSettings,
    /// Overrides keyed by address pattern (`literal`, `prefix.#`, `#`)
    pub address_settings: HashMap<String, AddressSettings>,
    pub security: SecurityConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            persistence_enabled: true,
            journal_sync_writes: false,
            acceptors: vec![TransportConfig::default()],
            max_connections: 1000,
            max_frame_size: crate::protocol::codec::DEFAULT_MAX_FRAME_SIZE,
            connection_ttl_ms: 60_000,
            connection_scan_period_ms: 10_000,
            session_reattach_ttl_ms: 10_000,
            transaction_timeout_secs: 300,
            transaction_scan_period_ms: 1_000,
            failure_callback_workers: 8,
            duplicate_id_cache_size: 20_000,
            default_address_settings: AddressSettings::default(),
            address_settings: HashMap::new(),
            security: SecurityConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Broker reachable only through the in-VM transport, state in memory
    pub fn in_vm(server_id: u32) -> Self {
        Self {
            persistence_enabled: false,
            acceptors: vec![TransportConfig::in_vm(server_id)],
            ..Self::default()
        }
    }

    /// Replace the TCP acceptor endpoint, adding one if none is configured
    pub fn with_tcp_acceptor(mut self, host: &str, port: u16) -> Self {
        match self
            .acceptors
            .iter_mut()
            .find(|a| a.kind == TransportKind::Tcp)
        {
            Some(acceptor) => {
                acceptor.host = host.to_string();
                acceptor.port = port;
            }
            None => self.acceptors.push(TransportConfig::tcp(host, port)),
        }
        self
    }

    pub fn with_address_settings(mut self, pattern: &str, settings: AddressSettings) -> Self {
        self.address_settings.insert(pattern.to_string(), settings);
        self
    }

    pub fn paging_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("paging")
    }

    pub fn journal_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("journal")
    }

    /// Settings for `address`: an exact pattern wins, then the longest
    /// matching `prefix.#`, then `#`, then the defaults
    pub fn address_settings_for(&self, address: &str) -> AddressSettings {
        crate::security::best_match(self.address_settings.keys(), address)
            .and_then(|pattern| self.address_settings.get(pattern))
            .cloned()
            .unwrap_or_else(|| self.default_address_settings.clone())
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.acceptors.is_empty() {
            return Err("at least one acceptor must be configured".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.max_frame_size < 64 {
            return Err("max_frame_size must be >= 64".to_string());
        }
        if self.connection_scan_period_ms == 0 {
            return Err("connection_scan_period_ms must be > 0".to_string());
        }
        if self.transaction_scan_period_ms == 0 {
            return Err("transaction_scan_period_ms must be > 0".to_string());
        }
        if self.failure_callback_workers == 0 {
            return Err("failure_callback_workers must be > 0".to_string());
        }
        for (pattern, settings) in std::iter::once(("<default>", &self.default_address_settings))
            .chain(self.address_settings.iter().map(|(p, s)| (p.as_str(), s)))
        {
            if settings.page_size_bytes == 0 {
                return Err(format!("page_size_bytes must be > 0 for {pattern}"));
            }
            if settings.page_cache_max_pages == 0 {
                return Err(format!("page_cache_max_pages must be > 0 for {pattern}"));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for user in &self.security.users {
            if !seen.insert(&user.username) {
                return Err(format!("duplicate user {}", user.username));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connector: TransportConfig,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Announced to the server; the server fails the connection after this
    /// long without traffic
    pub connection_ttl_ms: i64,
    /// Ping interval, and how long the client waits for any traffic before
    /// declaring the connection dead
    pub client_failure_check_period_ms: u64,
    pub call_timeout_ms: u64,
    /// Reconnect attempts after a failure, -1 for unlimited
    pub reconnect_attempts: i32,
    pub retry_interval_ms: u64,
    /// Producer send window in bytes, -1 for unbounded
    pub producer_window_size: i32,
    /// Consumer buffer in bytes, -1 for unbounded
    pub consumer_window_size: i32,
    /// Acknowledged bytes buffered before an ack is sent, 0 to ack every message
    pub ack_batch_size: usize,
    pub block_on_durable_send: bool,
    pub block_on_non_durable_send: bool,
    pub block_on_acknowledge: bool,
    pub pre_acknowledge: bool,
    /// Packets per confirmation; -1 disables the replay buffer and reattach
    pub confirmation_batch_size: i32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connector: TransportConfig::tcp("127.0.0.1", 5445),
            username: None,
            password: None,
            connection_ttl_ms: 60_000,
            client_failure_check_period_ms: 30_000,
            call_timeout_ms: 30_000,
            reconnect_attempts: 0,
            retry_interval_ms: 2_000,
            producer_window_size: 64 * 1024,
            consumer_window_size: 1024 * 1024,
            ack_batch_size: 0,
            block_on_durable_send: true,
            block_on_non_durable_send: false,
            block_on_acknowledge: false,
            pre_acknowledge: false,
            confirmation_batch_size: 32,
        }
    }
}

impl ClientConfig {
    pub fn in_vm(server_id: u32) -> Self {
        Self {
            connector: TransportConfig::in_vm(server_id),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be > 0".to_string());
        }
        if self.client_failure_check_period_ms == 0 {
            return Err("client_failure_check_period_ms must be > 0".to_string());
        }
        if self.producer_window_size == 0 || self.producer_window_size < -1 {
            return Err("producer_window_size must be > 0 or -1".to_string());
        }
        if self.consumer_window_size == 0 || self.consumer_window_size < -1 {
            return Err("consumer_window_size must be > 0 or -1".to_string());
        }
        if self.confirmation_batch_size == 0 || self.confirmation_batch_size < -1 {
            return Err("confirmation_batch_size must be > 0 or -1".to_string());
        }
        if self.reconnect_attempts < -1 {
            return Err("reconnect_attempts must be >= -1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(BrokerConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
        assert!(BrokerConfig::in_vm(3).validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut broker = BrokerConfig::default();
        broker.acceptors.clear();
        assert!(broker.validate().is_err());

        let client = ClientConfig {
            producer_window_size: 0,
            ..ClientConfig::default()
        };
        assert!(client.validate().is_err());
    }

    #[test]
    fn test_address_settings_resolution() {
        let exact = AddressSettings {
            max_size_bytes: 1,
            ..AddressSettings::default()
        };
        let prefix = AddressSettings {
            max_size_bytes: 2,
            ..AddressSettings::default()
        };
        let any = AddressSettings {
            max_size_bytes: 3,
            ..AddressSettings::default()
        };
        let config = BrokerConfig::default()
            .with_address_settings("orders.eu", exact)
            .with_address_settings("orders.#", prefix)
            .with_address_settings("#", any);

        assert_eq!(config.address_settings_for("orders.eu").max_size_bytes, 1);
        assert_eq!(config.address_settings_for("orders.us").max_size_bytes, 2);
        assert_eq!(config.address_settings_for("billing").max_size_bytes, 3);

        let plain = BrokerConfig::default();
        assert_eq!(plain.address_settings_for("x").max_size_bytes, -1);
    }

    #[test]
    fn test_tcp_acceptor_override() {
        let config = BrokerConfig::default().with_tcp_acceptor("127.0.0.1", 6000);
        assert_eq!(config.acceptors.len(), 1);
        assert_eq!(config.acceptors[0].describe(), "tcp://127.0.0.1:6000");

        let config = BrokerConfig::in_vm(1).with_tcp_acceptor("127.0.0.1", 6001);
        assert_eq!(config.acceptors.len(), 2);
    }

    #[test]
    fn test_policy_serializes_uppercase() {
        let json = serde_json::to_string(&AddressFullPolicy::Block).unwrap();
        assert_eq!(json, "\"BLOCK\"");
    }
}
