//! Tunable parameters of a client context.
//!
//! Defaults follow the standard `EPICS_CA_*` environment variables where one
//! exists, so a [`ClientConfig::default()`] behaves like any other CA client
//! on the same network.

use std::{net::SocketAddr, time::Duration};

use crate::utils::{
    get_default_beacon_port, get_default_connection_timeout, get_default_max_array_bytes,
    get_default_max_search_interval, get_default_server_port, get_target_broadcast_ips,
};

/// Room for the largest metadata block (CTRL_DOUBLE) on top of the array bytes
const METADATA_ALLOWANCE: u32 = 128;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// UDP port servers listen for searches on
    pub search_port: u16,
    /// UDP port beacons are received on
    pub beacon_port: u16,
    /// Where search datagrams are sent
    pub search_addresses: Vec<SocketAddr>,
    /// Silence on a circuit for this long makes it suspect
    pub connection_timeout: Duration,
    /// First interval between search rounds, and the one returned to on reply
    pub min_search_period: Duration,
    /// Ceiling of the search backoff
    pub max_search_period: Duration,
    /// Largest array transfer accepted
    pub max_array_bytes: u32,
    /// A server whose beacons are absent for this many periods is presumed gone
    pub beacon_silence_multiplier: f64,
    /// Bytes that may queue for sending on one circuit before it is abandoned
    pub send_backlog_limit: usize,
    /// Upper size of a single search datagram
    pub max_datagram_size: usize,
    /// Consecutive messages found already buffered before asking the server
    /// to pause subscription updates
    pub flow_control_threshold: usize,
    /// Number of servers whose beacons are remembered
    pub beacon_table_capacity: usize,
    /// How long to wait for a server's VERSION before assuming its search reply
    pub handshake_timeout: Duration,
    pub client_name: String,
    pub host_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// The largest payload a circuit will accept from a server
    pub fn max_payload_size(&self) -> u32 {
        self.max_array_bytes.saturating_add(METADATA_ALLOWANCE)
    }
}

pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        let search_port = get_default_server_port();
        ClientConfigBuilder {
            config: ClientConfig {
                search_port,
                beacon_port: get_default_beacon_port(),
                search_addresses: get_target_broadcast_ips(search_port),
                connection_timeout: get_default_connection_timeout(),
                min_search_period: Duration::from_millis(32),
                max_search_period: get_default_max_search_interval(),
                max_array_bytes: get_default_max_array_bytes(),
                beacon_silence_multiplier: 3.25,
                send_backlog_limit: 4 * 1024 * 1024,
                max_datagram_size: 1024,
                flow_control_threshold: 10,
                beacon_table_capacity: 1024,
                handshake_timeout: Duration::from_secs(5),
                client_name: whoami::username(),
                host_name: whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string()),
            },
        }
    }
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        ClientConfigBuilder::default()
    }
    pub fn build(self) -> ClientConfig {
        self.config
    }
    pub fn search_port(mut self, port: u16) -> Self {
        self.config.search_port = port;
        self
    }
    pub fn beacon_port(mut self, port: u16) -> Self {
        self.config.beacon_port = port;
        self
    }
    pub fn search_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.config.search_addresses = addresses;
        self
    }
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }
    pub fn search_period(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_search_period = min;
        self.config.max_search_period = max.max(min);
        self
    }
    pub fn max_array_bytes(mut self, bytes: u32) -> Self {
        self.config.max_array_bytes = bytes;
        self
    }
    pub fn beacon_silence_multiplier(mut self, multiplier: f64) -> Self {
        self.config.beacon_silence_multiplier = multiplier;
        self
    }
    pub fn send_backlog_limit(mut self, bytes: usize) -> Self {
        self.config.send_backlog_limit = bytes;
        self
    }
    pub fn max_datagram_size(mut self, bytes: usize) -> Self {
        self.config.max_datagram_size = bytes;
        self
    }
    pub fn flow_control_threshold(mut self, messages: usize) -> Self {
        self.config.flow_control_threshold = messages;
        self
    }
    pub fn beacon_table_capacity(mut self, entries: usize) -> Self {
        self.config.beacon_table_capacity = entries.max(1);
        self
    }
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }
    pub fn host_name(mut self, name: impl Into<String>) -> Self {
        self.config.host_name = name.into();
        self
    }
}
