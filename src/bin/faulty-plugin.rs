//! Demo plugin that misbehaves on purpose, selected by `FAULTY_MODE`:
//!
//! - `bad-version`: announces an unsupported protocol version
//! - `bad-cookie`: announces the wrong magic cookie
//! - `garbage`: prints something that is not a handshake line
//! - `silent`: never prints anything
//! - `exit`: exits before the handshake
//! - `unreachable`: announces an address that never accepts a connection
//! - `invalid-route`: completes the handshake but registers a relative pattern
//! - `slow`: serves `/` but takes a minute to answer
//! - `crash-on-dispatch` (default): serves `/` and dies on the first request

use std::time::Duration;

use oasis::config::HandshakeConfig;
use oasis::protocol::{HandshakeLine, SerializedResponse, TransportKind};
use oasis::sdk::{self, PluginRouter, ServeConfig};

const MODE_ENV: &str = "FAULTY_MODE";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    oasis::logging::init_plugin();

    let mode = std::env::var(MODE_ENV).unwrap_or_else(|_| "crash-on-dispatch".to_string());
    tracing::info!(%mode, "faulty plugin starting");

    let handshake = HandshakeConfig::default();
    match mode.as_str() {
        "bad-version" => {
            let mut line = HandshakeLine::new(&handshake, TransportKind::Tcp, "127.0.0.1:1".into());
            line.protocol_version = 99;
            println!("{line}");
            hang().await;
        }
        "bad-cookie" => {
            let mut line = HandshakeLine::new(&handshake, TransportKind::Tcp, "127.0.0.1:1".into());
            line.cookie_value = "not-the-cookie".into();
            println!("{line}");
            hang().await;
        }
        "garbage" => {
            println!("definitely not a handshake");
            hang().await;
        }
        "silent" => hang().await,
        "exit" => std::process::exit(1),
        "unreachable" => {
            // Non-routable, so connecting stalls instead of being refused.
            let line = HandshakeLine::new(&handshake, TransportKind::Tcp, "10.255.255.1:9".into());
            println!("{line}");
            hang().await;
        }
        "slow" => {
            let router = PluginRouter::new().prefix(None, "/", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                SerializedResponse::text(200, "too late")
            });
            sdk::serve(ServeConfig::from_env(), router).await?;
        }
        "invalid-route" => {
            let router = PluginRouter::new().prefix(None, "relative/path", |_| async {
                SerializedResponse::text(200, "unreachable")
            });
            sdk::serve(ServeConfig::from_env(), router).await?;
        }
        _ => {
            let router = PluginRouter::new().prefix(None, "/", |_| async { crash() });
            sdk::serve(ServeConfig::from_env(), router).await?;
        }
    }
    Ok(())
}

fn crash() -> SerializedResponse {
    tracing::error!("crashing on purpose");
    std::process::exit(3)
}

async fn hang() {
    tokio::time::sleep(Duration::from_secs(3600)).await;
}
