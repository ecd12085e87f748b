use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::routing::MatchMode;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub plugins: PluginSourceConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    #[serde(default = "default_listener_host")]
    pub host: String,
    #[serde(default = "default_listener_port")]
    pub port: u16,
    #[serde(default = "default_reload_path")]
    pub reload_path: String,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

/// Where plugin binaries come from. Exactly one of `directory` or `entries`
/// is expected to be set.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSourceConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub entries: Vec<PluginEntry>,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    pub name: String,
    pub path: PathBuf,
    /// Mount point prepended to every route the plugin registers.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Constants a plugin must echo back in its handshake line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeConfig {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_cookie_key")]
    pub magic_cookie_key: String,
    #[serde(default = "default_cookie_value")]
    pub magic_cookie_value: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: MatchMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_listener_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listener_port() -> u16 {
    8080
}

fn default_reload_path() -> String {
    "/reload_plugins".to_string()
}

fn default_dispatch_timeout() -> u64 {
    30000
}

fn default_max_body_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_stop_timeout() -> u64 {
    3000
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_protocol_version() -> u32 {
    1
}

fn default_cookie_key() -> String {
    "OASIS_PLUGIN".to_string()
}

fn default_cookie_value() -> String {
    "hello".to_string()
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8081
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_listener_host(),
            port: default_listener_port(),
            reload_path: default_reload_path(),
            dispatch_timeout_ms: default_dispatch_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for PluginSourceConfig {
    fn default() -> Self {
        Self {
            directory: None,
            entries: Vec::new(),
            handshake_timeout_ms: default_handshake_timeout(),
            stop_timeout_ms: default_stop_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            magic_cookie_key: default_cookie_key(),
            magic_cookie_value: default_cookie_value(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

impl Config {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.listener.dispatch_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.plugins.handshake_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.plugins.stop_timeout_ms)
    }

    pub fn listener_addr(&self) -> String {
        format!("{}:{}", self.listener.host, self.listener.port)
    }

    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.admin.host, self.admin.port)
    }
}
