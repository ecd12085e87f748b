//! Shared helpers for tests that run the demo plugin binaries.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use oasis::config::{Config, PluginEntry};
use oasis::plugin::PluginSource;
use oasis::state::AppState;

pub const HELLO: &str = env!("CARGO_BIN_EXE_hello-plugin");
pub const ECHO: &str = env!("CARGO_BIN_EXE_echo-plugin");
pub const FAULTY: &str = env!("CARGO_BIN_EXE_faulty-plugin");

pub fn entry(name: &str, binary: &str) -> PluginEntry {
    PluginEntry {
        name: name.to_string(),
        path: PathBuf::from(binary),
        prefix: None,
        args: Vec::new(),
        env: HashMap::new(),
    }
}

pub fn echo_at(name: &str, prefix: &str) -> PluginEntry {
    PluginEntry {
        args: vec![prefix.to_string()],
        ..entry(name, ECHO)
    }
}

pub fn faulty(name: &str, mode: &str) -> PluginEntry {
    let mut entry = entry(name, FAULTY);
    entry.env.insert("FAULTY_MODE".to_string(), mode.to_string());
    entry
}

/// Config with timeouts short enough for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.listener.host = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.plugins.handshake_timeout_ms = 2000;
    config.plugins.stop_timeout_ms = 1000;
    config.listener.dispatch_timeout_ms = 5000;
    config
}

pub fn state_with_entries(entries: Vec<PluginEntry>) -> Arc<AppState> {
    let mut config = test_config();
    config.plugins.entries = entries;
    state_with_config(config)
}

/// State for a config whose plugins are listed in `plugins.entries`.
pub fn state_with_config(config: Config) -> Arc<AppState> {
    let entries = config.plugins.entries.clone();
    let (state, _rx) = AppState::with_source(config, PluginSource::Entries(entries));
    state
}

pub fn state_with_directory(dir: PathBuf) -> Arc<AppState> {
    let mut config = test_config();
    config.plugins.directory = Some(dir.clone());
    let (state, _rx) = AppState::with_source(config, PluginSource::Directory(dir));
    state
}

pub struct Reply {
    pub status: u16,
    pub body: String,
    pub headers: warp::http::HeaderMap,
}

pub async fn send(state: &Arc<AppState>, method: &str, path: &str, body: &str) -> Reply {
    let filter = oasis::proxy::routes(state.clone());
    let response = warp::test::request()
        .method(method)
        .path(path)
        .body(body.to_string())
        .reply(&filter)
        .await;
    Reply {
        status: response.status().as_u16(),
        body: String::from_utf8_lossy(response.body()).into_owned(),
        headers: response.headers().clone(),
    }
}

pub async fn get(state: &Arc<AppState>, path: &str) -> Reply {
    send(state, "GET", path, "").await
}
