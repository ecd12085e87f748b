use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::field::Empty;
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

use crate::error::{HostError, TransportError};
use crate::protocol::{HeaderMultimap, SerializedRequest, SerializedResponse};
use crate::routing::RouteRegistry;
use crate::state::Metrics;

/// A front-listener request after its body was buffered.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMultimap,
    pub body: Vec<u8>,
}

/// Resolves inbound requests against the current registry snapshot and
/// forwards them to the owning plugin.
pub struct Dispatcher {
    registry: Arc<ArcSwap<RouteRegistry>>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ArcSwap<RouteRegistry>>, metrics: Arc<Metrics>, timeout: Duration) -> Self {
        Self {
            registry,
            metrics,
            timeout,
        }
    }

    /// Always produces a response: the plugin's, a 404 when nothing matched,
    /// or a 500 when the owner is unavailable.
    pub async fn dispatch(&self, inbound: InboundRequest) -> SerializedResponse {
        let span = tracing::info_span!(
            "dispatch",
            request_id = %Uuid::new_v4(),
            method = %inbound.method,
            path = %inbound.path,
            plugin = Empty,
            handler = Empty,
        );
        self.dispatch_inner(inbound).instrument(span).await
    }

    async fn dispatch_inner(&self, inbound: InboundRequest) -> SerializedResponse {
        // One snapshot for the whole request, even if a reload publishes meanwhile.
        let snapshot = self.registry.load_full();

        let Some(route) = snapshot.resolve(&inbound.method, &inbound.path) else {
            let miss = HostError::RouteNotFound {
                method: inbound.method,
                path: inbound.path,
            };
            debug!(generation = snapshot.generation(), "{}", miss);
            self.metrics.record_not_found();
            return SerializedResponse::text(404, "404 page not found\n");
        };

        let owner = route.entry.owner.clone();
        let span = tracing::Span::current();
        span.record("plugin", owner.name());
        span.record("handler", route.entry.handler_id.as_str());

        if !owner.is_ready() {
            debug!(status = %owner.status(), "Owner unavailable, failing fast");
            self.metrics.record_dispatch_failure();
            return unavailable(owner.name());
        }

        let url = match &inbound.query {
            Some(query) if !query.is_empty() => format!("{}?{}", route.forwarded_path, query),
            _ => route.forwarded_path.clone(),
        };
        let handler_id = route.entry.handler_id.clone();
        let request = SerializedRequest {
            method: inbound.method,
            url,
            headers: inbound.headers,
            body: inbound.body,
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, owner.transport().dispatch(&handler_id, request))
            .await
            .unwrap_or(Err(TransportError::Timeout(self.timeout)));
        self.metrics.record_dispatch(started.elapsed());

        match result {
            Ok(response) => {
                debug!(
                    status = response.status_code,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Plugin answered"
                );
                response
            }
            Err(e) if !e.is_channel_failure() => {
                warn!(error = %e, "Call failed, plugin stays available");
                self.metrics.record_dispatch_failure();
                rejected(&e)
            }
            Err(e) => {
                if owner.mark_failed() {
                    error!(error = %e, "Transport failure, plugin marked failed until the next reload");
                    self.metrics.record_plugin_failed();
                } else {
                    warn!(error = %e, "Transport failure");
                }
                self.metrics.record_dispatch_failure();
                unavailable(owner.name())
            }
        }
    }
}

/// Response for a failed call that leaves the channel healthy.
fn rejected(error: &TransportError) -> SerializedResponse {
    match error {
        TransportError::FrameTooLarge { .. } => SerializedResponse::text(413, "Payload Too Large\n"),
        TransportError::Remote(reason) => {
            SerializedResponse::text(500, format!("Internal Server Error: {reason}\n"))
        }
        other => SerializedResponse::text(500, format!("Internal Server Error: {other}\n")),
    }
}

fn unavailable(plugin: &str) -> SerializedResponse {
    SerializedResponse::text(
        500,
        format!("Internal Server Error: plugin '{plugin}' is unavailable\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginCandidate, PluginDescriptor, PluginStatus};
    use crate::protocol::RouteSpec;
    use crate::routing::MatchMode;
    use crate::transport::{MockPluginTransport, PluginTransport};

    fn descriptor(name: &str, routes: Vec<RouteSpec>, transport: MockPluginTransport) -> Arc<PluginDescriptor> {
        let descriptor = PluginDescriptor::new(
            PluginCandidate::from_path(format!("/plugins/{name}")),
            Arc::new(transport),
            None,
        );
        descriptor.admit(routes);
        Arc::new(descriptor)
    }

    fn dispatcher(plugins: Vec<Arc<PluginDescriptor>>) -> Dispatcher {
        let registry = RouteRegistry::build(1, MatchMode::Prefix, plugins);
        Dispatcher::new(
            Arc::new(ArcSwap::from_pointee(registry)),
            Arc::new(Metrics::new()),
            Duration::from_secs(1),
        )
    }

    fn get(path: &str) -> InboundRequest {
        InboundRequest {
            method: "GET".into(),
            path: path.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_hello_round_trip() {
        let mut transport = MockPluginTransport::new();
        transport
            .expect_dispatch()
            .withf(|handler, request| handler == "hello" && request.url == "/hello")
            .times(1)
            .returning(|_, _| Ok(SerializedResponse::text(200, "Hello, world!")));
        let dispatcher = dispatcher(vec![descriptor(
            "hello",
            vec![RouteSpec::exact("GET", "/hello", "hello")],
            transport,
        )]);

        let response = dispatcher.dispatch(get("/hello")).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"Hello, world!");

        let missing = dispatcher.dispatch(get("/missing")).await;
        assert_eq!(missing.status_code, 404);
    }

    #[tokio::test]
    async fn test_prefix_strip_and_query_and_headers() {
        let mut transport = MockPluginTransport::new();
        transport.expect_dispatch().returning(|_, request| {
            Ok(SerializedResponse::new(200, request.body.clone())
                .with_header("X-Echo", "1")
                .with_header("X-Forwarded-Url", request.url.clone())
                .with_header("X-Seen-Trace", request.headers.get("x-trace").unwrap_or("").to_string()))
        });
        let dispatcher = dispatcher(vec![descriptor(
            "echo",
            vec![RouteSpec::prefix(None, "/a/b", "echo")],
            transport,
        )]);

        let mut request = InboundRequest {
            method: "POST".into(),
            path: "/a/b/x/y".into(),
            query: Some("q=1&r=2".into()),
            body: b"payload".to_vec(),
            ..Default::default()
        };
        request.headers.append("X-Trace", "abc");

        let response = dispatcher.dispatch(request).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"payload");
        assert_eq!(response.headers.get("x-echo"), Some("1"));
        assert_eq!(response.headers.get("x-forwarded-url"), Some("/x/y?q=1&r=2"));
        assert_eq!(response.headers.get("x-seen-trace"), Some("abc"));
    }

    #[tokio::test]
    async fn test_transport_failure_marks_owner_failed_and_isolates_others() {
        let mut broken = MockPluginTransport::new();
        broken
            .expect_dispatch()
            .times(1)
            .returning(|_, _| Err(TransportError::Closed));
        let broken = descriptor("broken", vec![RouteSpec::prefix(None, "/broken", "b")], broken);

        let mut healthy = MockPluginTransport::new();
        healthy
            .expect_dispatch()
            .times(2)
            .returning(|_, _| Ok(SerializedResponse::text(200, "ok")));
        let healthy = descriptor("healthy", vec![RouteSpec::prefix(None, "/ok", "h")], healthy);

        let dispatcher = dispatcher(vec![broken.clone(), healthy]);

        assert_eq!(dispatcher.dispatch(get("/ok")).await.status_code, 200);
        assert_eq!(dispatcher.dispatch(get("/broken/x")).await.status_code, 500);
        assert_eq!(broken.status(), PluginStatus::Failed);

        // Fails fast without touching the transport again.
        assert_eq!(dispatcher.dispatch(get("/broken/y")).await.status_code, 500);
        assert_eq!(dispatcher.dispatch(get("/ok/z")).await.status_code, 200);
    }

    #[tokio::test]
    async fn test_remote_error_keeps_plugin_ready() {
        let mut transport = MockPluginTransport::new();
        transport
            .expect_dispatch()
            .times(2)
            .returning(|_, _| Err(TransportError::Remote("unknown handler".into())));
        let plugin = descriptor("p", vec![RouteSpec::prefix(None, "/", "p")], transport);
        let dispatcher = dispatcher(vec![plugin.clone()]);

        assert_eq!(dispatcher.dispatch(get("/a")).await.status_code, 500);
        assert_eq!(dispatcher.dispatch(get("/b")).await.status_code, 500);
        assert!(plugin.is_ready());
    }

    /// Answers only after `delay`, whatever the caller's own deadline.
    struct Sleepy {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl PluginTransport for Sleepy {
        async fn list_routes(&self) -> Result<Vec<RouteSpec>, TransportError> {
            Ok(Vec::new())
        }

        async fn dispatch(
            &self,
            _handler_id: &str,
            _request: SerializedRequest,
        ) -> Result<SerializedResponse, TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(SerializedResponse::text(200, "late"))
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_slow_plugin_times_out() {
        let descriptor = PluginDescriptor::new(
            PluginCandidate::from_path("/plugins/slow"),
            Arc::new(Sleepy {
                delay: Duration::from_secs(5),
            }),
            None,
        );
        descriptor.admit(vec![RouteSpec::prefix(None, "/", "s")]);
        let plugin = Arc::new(descriptor);
        let dispatcher = Dispatcher::new(
            Arc::new(ArcSwap::from_pointee(RouteRegistry::build(
                1,
                MatchMode::Prefix,
                vec![plugin.clone()],
            ))),
            Arc::new(Metrics::new()),
            Duration::from_millis(50),
        );

        let started = Instant::now();
        let response = dispatcher.dispatch(get("/x")).await;
        assert_eq!(response.status_code, 500);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(plugin.status(), PluginStatus::Failed);
    }

    #[tokio::test]
    async fn test_oversized_call_is_413_and_keeps_plugin_ready() {
        let mut transport = MockPluginTransport::new();
        transport
            .expect_dispatch()
            .times(1)
            .returning(|_, _| Err(TransportError::FrameTooLarge { size: 5000, limit: 4096 }));
        let plugin = descriptor("echo", vec![RouteSpec::prefix(None, "/", "e")], transport);
        let dispatcher = dispatcher(vec![plugin.clone()]);

        let response = dispatcher.dispatch(get("/big")).await;
        assert_eq!(response.status_code, 413);
        assert!(plugin.is_ready());
    }
}
