use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::TransportError;
use crate::protocol::{HandshakeLine, RouteSpec, SerializedRequest, SerializedResponse, TransportKind};

pub mod channel;

pub use channel::{ChannelOptions, RpcChannel};

/// The two remote operations the host performs on a plugin.
///
/// Calls block until the plugin answers or the channel fails; there is no
/// internal retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginTransport: Send + Sync + 'static {
    async fn list_routes(&self) -> Result<Vec<RouteSpec>, TransportError>;

    async fn dispatch(
        &self,
        handler_id: &str,
        request: SerializedRequest,
    ) -> Result<SerializedResponse, TransportError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Opens the channel advertised by a plugin's handshake line.
///
/// A peer that never accepts fails with [`TransportError::Timeout`] once
/// `connect_timeout` elapses.
pub async fn connect(
    label: &str,
    handshake: &HandshakeLine,
    options: ChannelOptions,
    connect_timeout: Duration,
) -> Result<Arc<RpcChannel>, TransportError> {
    let refused = |e: std::io::Error| {
        TransportError::ConnectionFailed(format!("{}: {}", handshake.address, e))
    };
    match handshake.transport {
        TransportKind::Tcp => {
            let stream = timeout(connect_timeout, tokio::net::TcpStream::connect(&handshake.address))
                .await
                .map_err(|_| TransportError::Timeout(connect_timeout))?
                .map_err(refused)?;
            let _ = stream.set_nodelay(true);
            Ok(Arc::new(RpcChannel::new(label, stream, options)))
        }
        #[cfg(unix)]
        TransportKind::Unix => {
            let stream = timeout(connect_timeout, tokio::net::UnixStream::connect(&handshake.address))
                .await
                .map_err(|_| TransportError::Timeout(connect_timeout))?
                .map_err(refused)?;
            Ok(Arc::new(RpcChannel::new(label, stream, options)))
        }
        #[cfg(not(unix))]
        TransportKind::Unix => Err(TransportError::ConnectionFailed(
            "unix sockets are not supported on this platform".to_string(),
        )),
    }
}
