//! Proxy configuration types.

use serde::{Deserialize, Serialize};

/// Configuration for the Postgres wire protocol proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port to listen on for incoming Postgres connections.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Maximum number of concurrent client sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Client startup parameters copied into the upstream startup packet.
    /// `user` and `database` are never copied; they come from the upstream
    /// credentials.
    #[serde(default = "default_forward_startup_parameters")]
    pub forward_startup_parameters: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            max_connections: default_max_connections(),
            forward_startup_parameters: default_forward_startup_parameters(),
        }
    }
}

impl ProxyConfig {
    /// `host:port` string to bind to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5433
}

fn default_max_connections() -> u32 {
    100
}

fn default_forward_startup_parameters() -> Vec<String> {
    [
        "application_name",
        "client_encoding",
        "DateStyle",
        "TimeZone",
        "extra_float_digits",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
