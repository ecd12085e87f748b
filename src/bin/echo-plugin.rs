//! Demo plugin that mirrors every request under one prefix.
//!
//! Usage: `echo-plugin [PREFIX]` (default `/`).

use oasis::protocol::{SerializedRequest, SerializedResponse};
use oasis::sdk::{self, PluginRouter, ServeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    oasis::logging::init_plugin();

    let prefix = std::env::args().nth(1).unwrap_or_else(|| "/".to_string());
    tracing::info!(%prefix, "echo plugin starting");

    let router = PluginRouter::new().prefix(None, &prefix, |request: SerializedRequest| async move {
        let mut response = SerializedResponse::new(200, request.body)
            .with_header("X-Echo", "1")
            .with_header("X-Forwarded-Url", request.url)
            .with_header("X-Forwarded-Method", request.method);
        if let Some(content_type) = request.headers.get("content-type") {
            response = response.with_header("content-type", content_type);
        }
        response
    });

    sdk::serve(ServeConfig::from_env(), router).await?;
    Ok(())
}
