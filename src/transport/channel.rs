use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::PluginTransport;
use crate::error::TransportError;
use crate::protocol::wire::{self, RpcCall, RpcReply, RpcRequest, RpcResponse};
use crate::protocol::{RouteSpec, SerializedRequest, SerializedResponse};

type Pending = DashMap<u64, oneshot::Sender<Result<RpcReply, TransportError>>>;

/// An encoded request and the id of the call waiting for it.
type Outgoing = (u64, Bytes);

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub call_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

pub fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Multiplexed call/response link to one plugin process.
///
/// A single writer task owns the write half and a single reader task owns the
/// read half, so concurrent callers never interleave frames. Replies are
/// matched to callers by request id.
pub struct RpcChannel {
    label: String,
    writer_tx: mpsc::Sender<Outgoing>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
    max_frame_bytes: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcChannel {
    pub fn new<S>(label: impl Into<String>, stream: S, options: ChannelOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, codec(options.max_frame_bytes));
        let writer = FramedWrite::new(write_half, codec(options.max_frame_bytes));

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::channel::<Outgoing>(64);

        let writer_handle = tokio::spawn(writer_loop(
            label.clone(),
            writer,
            writer_rx,
            options.max_frame_bytes,
            pending.clone(),
            closed.clone(),
        ));
        let reader_handle = tokio::spawn(reader_loop(
            label.clone(),
            reader,
            pending.clone(),
            closed.clone(),
        ));

        Self {
            label,
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            call_timeout: options.call_timeout,
            max_frame_bytes: options.max_frame_bytes,
            tasks: vec![writer_handle, reader_handle],
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    async fn call(&self, call: RpcCall) -> Result<RpcReply, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = wire::encode(&RpcRequest { id, call })
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        if frame.len() > self.max_frame_bytes {
            tracing::warn!(
                plugin = %self.label,
                request_id = id,
                size = frame.len(),
                limit = self.max_frame_bytes,
                "Refusing oversized call"
            );
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: self.max_frame_bytes,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // Removes the entry if the caller gives up (timeout or dropped future).
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The reader flags `closed` before draining, so a late insert is caught here.
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        if self.writer_tx.send((id, frame)).await.is_err() {
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                tracing::warn!(
                    plugin = %self.label,
                    request_id = id,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Plugin call timed out"
                );
                Err(TransportError::Timeout(self.call_timeout))
            }
        }
    }
}

struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[async_trait]
impl PluginTransport for RpcChannel {
    async fn list_routes(&self) -> Result<Vec<RouteSpec>, TransportError> {
        match self.call(RpcCall::ListRoutes).await? {
            RpcReply::Routes { routes } => Ok(routes),
            other => Err(TransportError::Malformed(format!(
                "expected routes, got {other:?}"
            ))),
        }
    }

    async fn dispatch(
        &self,
        handler_id: &str,
        request: SerializedRequest,
    ) -> Result<SerializedResponse, TransportError> {
        let call = RpcCall::Dispatch {
            handler_id: handler_id.to_string(),
            request,
        };
        match self.call(call).await? {
            RpcReply::Response { response } => Ok(response),
            RpcReply::Routes { .. } => Err(TransportError::Malformed(
                "expected a response, got a route list".to_string(),
            )),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        fail_all(&self.pending, TransportError::Closed);
        tracing::debug!(plugin = %self.label, "Channel closed");
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn fail_all(pending: &Pending, error: TransportError) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

async fn writer_loop<W>(
    label: String,
    mut writer: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::Receiver<Outgoing>,
    max_frame_bytes: usize,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some((id, frame)) = rx.recv().await {
        let size = frame.len();
        if let Err(e) = writer.send(frame).await {
            // The codec refuses an oversized frame before buffering any of it.
            if e.kind() == io::ErrorKind::InvalidInput {
                tracing::warn!(plugin = %label, request_id = id, size, "Encoder rejected frame");
                if let Some((_, tx)) = pending.remove(&id) {
                    let _ = tx.send(Err(TransportError::FrameTooLarge {
                        size,
                        limit: max_frame_bytes,
                    }));
                }
                continue;
            }
            tracing::warn!(plugin = %label, error = %e, "Failed to write to plugin channel");
            closed.store(true, Ordering::SeqCst);
            fail_all(&pending, TransportError::Closed);
            return;
        }
    }
}

async fn reader_loop<R>(
    label: String,
    mut reader: FramedRead<R, LengthDelimitedCodec>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let failure = loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break TransportError::Malformed(e.to_string()),
            None => break TransportError::Closed,
        };

        let response: RpcResponse = match wire::decode(&frame) {
            Ok(response) => response,
            Err(e) => break TransportError::Malformed(e.to_string()),
        };

        let outcome = match (response.result, response.error) {
            (_, Some(message)) => Err(TransportError::Remote(message)),
            (Some(reply), None) => Ok(reply),
            (None, None) => Err(TransportError::Malformed(
                "reply carries neither result nor error".to_string(),
            )),
        };

        match pending.remove(&response.id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::debug!(plugin = %label, request_id = response.id, "Dropping reply for abandoned call");
            }
        }
    };

    tracing::debug!(plugin = %label, reason = %failure, "Plugin channel reader stopped");
    closed.store(true, Ordering::SeqCst);
    fail_all(&pending, failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::RpcRequest;
    use tokio::io::DuplexStream;

    /// Plays the plugin side of a duplex pipe with a scripted responder.
    fn plugin_side<F>(stream: DuplexStream, respond: F) -> JoinHandle<()>
    where
        F: Fn(RpcRequest) -> Option<RpcResponse> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = FramedRead::new(read_half, codec(1024 * 1024));
            let mut writer = FramedWrite::new(write_half, codec(1024 * 1024));
            while let Some(Ok(frame)) = reader.next().await {
                let request: RpcRequest = wire::decode(&frame).unwrap();
                if let Some(response) = respond(request) {
                    writer.send(wire::encode(&response).unwrap()).await.unwrap();
                }
            }
        })
    }

    fn options(timeout_ms: u64) -> ChannelOptions {
        ChannelOptions {
            call_timeout: Duration::from_millis(timeout_ms),
            max_frame_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_list_routes_and_dispatch() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        plugin_side(plugin, |request| {
            Some(match request.call {
                RpcCall::ListRoutes => RpcResponse::ok(
                    request.id,
                    RpcReply::Routes {
                        routes: vec![RouteSpec::exact("GET", "/hello", "hello")],
                    },
                ),
                RpcCall::Dispatch { request: req, .. } => RpcResponse::ok(
                    request.id,
                    RpcReply::Response {
                        response: SerializedResponse::new(200, req.body),
                    },
                ),
            })
        });

        let channel = RpcChannel::new("test", host, options(1000));
        let routes = channel.list_routes().await.unwrap();
        assert_eq!(routes, vec![RouteSpec::exact("GET", "/hello", "hello")]);

        let request = SerializedRequest {
            method: "POST".into(),
            url: "/".into(),
            body: b"ping".to_vec(),
            ..Default::default()
        };
        let response = channel.dispatch("hello", request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"ping");
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_matched_by_id() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        plugin_side(plugin, |request| match request.call {
            RpcCall::Dispatch { handler_id, .. } => Some(RpcResponse::ok(
                request.id,
                RpcReply::Response {
                    response: SerializedResponse::new(200, handler_id.into_bytes()),
                },
            )),
            RpcCall::ListRoutes => None,
        });

        let channel = Arc::new(RpcChannel::new("test", host, options(2000)));
        let calls = (0..32).map(|i| {
            let channel = channel.clone();
            tokio::spawn(async move {
                let handler = format!("handler-{i}");
                let response = channel
                    .dispatch(&handler, SerializedRequest::default())
                    .await
                    .unwrap();
                assert_eq!(response.body, handler.into_bytes());
            })
        });
        for call in futures::future::join_all(calls).await {
            call.unwrap();
        }
    }

    #[tokio::test]
    async fn test_remote_error_keeps_channel_open() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        plugin_side(plugin, |request| {
            Some(RpcResponse::err(request.id, "unknown handler"))
        });

        let channel = RpcChannel::new("test", host, options(1000));
        let result = channel.dispatch("missing", SerializedRequest::default()).await;
        assert_eq!(
            result,
            Err(TransportError::Remote("unknown handler".to_string()))
        );
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_dropped() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        plugin_side(plugin, |_| None);

        let channel = RpcChannel::new("test", host, options(50));
        let result = channel.dispatch("slow", SerializedRequest::default()).await;
        assert_eq!(
            result,
            Err(TransportError::Timeout(Duration::from_millis(50)))
        );
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_peer_exit_fails_pending_calls() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let channel = RpcChannel::new("test", host, options(5000));

        let responder = tokio::spawn(async move {
            let (read_half, _write_half) = tokio::io::split(plugin);
            let mut reader = FramedRead::new(read_half, codec(1024));
            // Receive one request, then vanish without answering.
            let _ = reader.next().await;
        });

        let result = channel.dispatch("any", SerializedRequest::default()).await;
        responder.await.unwrap();
        assert_eq!(result, Err(TransportError::Closed));
        assert!(channel.is_closed());

        let again = channel.list_routes().await;
        assert_eq!(again, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_oversized_call_is_refused_without_closing() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        plugin_side(plugin, |request| match request.call {
            RpcCall::Dispatch { request: req, .. } => Some(RpcResponse::ok(
                request.id,
                RpcReply::Response {
                    response: SerializedResponse::new(200, req.body),
                },
            )),
            RpcCall::ListRoutes => None,
        });

        let channel = RpcChannel::new(
            "test",
            host,
            ChannelOptions {
                call_timeout: Duration::from_secs(1),
                max_frame_bytes: 4096,
            },
        );
        let big = SerializedRequest {
            method: "POST".into(),
            url: "/".into(),
            body: vec![b'x'; 5000],
            ..Default::default()
        };
        let result = channel.dispatch("echo", big).await;
        assert!(matches!(
            result,
            Err(TransportError::FrameTooLarge { limit: 4096, .. })
        ));
        assert!(!channel.is_closed());
        assert_eq!(channel.in_flight(), 0);

        // Base64 keeps a 2 KiB body well under the limit.
        let small = SerializedRequest {
            body: vec![b'y'; 2048],
            ..Default::default()
        };
        let response = channel.dispatch("echo", small).await.unwrap();
        assert_eq!(response.body.len(), 2048);
    }

    #[tokio::test]
    async fn test_writer_fails_only_the_rejected_call() {
        let (host, mut plugin) = tokio::io::duplex(64 * 1024);
        let (_read_half, write_half) = tokio::io::split(host);
        let writer = FramedWrite::new(write_half, codec(16));
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Outgoing>(4);
        tokio::spawn(writer_loop(
            "test".to_string(),
            writer,
            rx,
            16,
            pending.clone(),
            closed.clone(),
        ));

        let (big_tx, big_rx) = oneshot::channel();
        pending.insert(1, big_tx);
        let (small_tx, _small_rx) = oneshot::channel();
        pending.insert(2, small_tx);

        tx.send((1, Bytes::from(vec![0u8; 32]))).await.unwrap();
        assert_eq!(
            big_rx.await.unwrap(),
            Err(TransportError::FrameTooLarge { size: 32, limit: 16 })
        );

        tx.send((2, Bytes::from_static(b"ok"))).await.unwrap();
        let mut reader = FramedRead::new(&mut plugin, codec(16));
        assert_eq!(reader.next().await.unwrap().unwrap().as_ref(), b"ok");
        assert!(!closed.load(Ordering::SeqCst));
        assert!(pending.contains_key(&2));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_malformed() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(plugin);
            let mut reader = FramedRead::new(read_half, codec(1024));
            let mut writer = FramedWrite::new(write_half, codec(1024));
            let _ = reader.next().await;
            writer.send(Bytes::from_static(b"not json")).await.unwrap();
            // Hold the pipe open so the failure is the decode, not EOF.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let channel = RpcChannel::new("test", host, options(1000));
        let result = channel.list_routes().await;
        assert!(matches!(result, Err(TransportError::Malformed(_))));
        assert!(channel.is_closed());
    }
}
