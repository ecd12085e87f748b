//! Demo plugin with two exact routes.

use oasis::protocol::{SerializedRequest, SerializedResponse};
use oasis::sdk::{self, PluginRouter, ServeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    oasis::logging::init_plugin();

    let router = PluginRouter::new()
        .exact("GET", "/hello", |_| async {
            SerializedResponse::text(200, "Hello, world!")
        })
        .exact("POST", "/echo", |request: SerializedRequest| async move {
            SerializedResponse::text(
                200,
                format!("Received: {}", String::from_utf8_lossy(&request.body)),
            )
        });

    sdk::serve(ServeConfig::from_env(), router).await?;
    Ok(())
}
