//! The front-facing HTTP listener.
//!
//! Every method and path is accepted. The reload path is answered here;
//! everything else goes through the [`Dispatcher`].

use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use warp::http::header::{HeaderMap, HeaderName, HeaderValue};
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Reply};

use crate::error::{ConfigError, HostError, Result};
use crate::protocol::{HeaderMultimap, SerializedResponse};
use crate::reload::ReloadReport;
use crate::state::AppState;

pub mod dispatcher;

pub use dispatcher::{Dispatcher, InboundRequest};

/// Connection-level headers that are never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

pub struct ProxyServer {
    state: Arc<AppState>,
}

impl ProxyServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Bind the listener. Failing to bind is fatal for the host.
    pub fn bind(self) -> Result<(SocketAddr, impl Future<Output = ()>)> {
        let addr_text = self.state.config.listener_addr();
        let addr: SocketAddr = addr_text.parse().map_err(|e| {
            HostError::Config(ConfigError::Parse(format!(
                "invalid listener address {addr_text}: {e}"
            )))
        })?;

        let state = self.state.clone();
        let (bound, server) = warp::serve(routes(self.state.clone()))
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = state.shutdown_tx.subscribe().recv().await;
            })
            .map_err(|e| HostError::Bind {
                addr: addr_text.clone(),
                reason: e.to_string(),
            })?;

        Ok((bound, server))
    }
}

/// Catch-all filter for the front listener.
pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let declared = declared_too_large(state.config.listener.max_body_bytes);
    let forwarded = warp::method()
        .and(warp::path::full())
        .and(
            warp::query::raw()
                .map(|query: String| Some(query))
                .or(warp::any().map(|| None::<String>))
                .unify(),
        )
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(warp::any().map(move || state.clone()))
        .and_then(handle_request);

    declared.or(forwarded).unify()
}

/// Answers 413 before the body is read when the declared length is already
/// over `max_body_bytes`. Chunked bodies are checked after buffering.
fn declared_too_large(
    max_body_bytes: u64,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::header::optional::<u64>("content-length").and_then(move |declared: Option<u64>| async move {
        match declared {
            Some(size) if size > max_body_bytes => {
                debug!(size, "Declared request body over limit");
                Ok(text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large\n"))
            }
            _ => Err(warp::reject()),
        }
    })
}

async fn handle_request(
    method: Method,
    path: FullPath,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    state: Arc<AppState>,
) -> std::result::Result<Response, warp::Rejection> {
    if path.as_str() == state.config.listener.reload_path {
        return Ok(handle_reload(method, &state).await);
    }

    if body.len() as u64 > state.config.listener.max_body_bytes {
        debug!(size = body.len(), "Request body over limit");
        return Ok(text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large\n"));
    }

    let inbound = InboundRequest {
        method: method.as_str().to_string(),
        path: path.as_str().to_string(),
        query,
        headers: to_multimap(&headers),
        body: body.to_vec(),
    };
    let response = state.dispatcher.dispatch(inbound).await;
    Ok(into_response(response))
}

async fn handle_reload(method: Method, state: &AppState) -> Response {
    if method != Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Invalid request method\n");
    }

    match state.reload.reload().await.and_then(ReloadReport::into_result) {
        Ok(_) => text_response(StatusCode::OK, "Plugins reloaded successfully\n"),
        Err(e) => {
            error!(error = %e, "Reload failed");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to reload plugins: {e}\n"),
            )
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub fn to_multimap(headers: &HeaderMap) -> HeaderMultimap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Copy a plugin response onto the wire. Headers that cannot be represented
/// are dropped; the content length is recomputed from the body.
pub fn into_response(response: SerializedResponse) -> Response {
    let status = match StatusCode::from_u16(response.status_code) {
        Ok(status) => status,
        Err(_) => {
            warn!(status = response.status_code, "Plugin answered with an invalid status");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n");
        }
    };

    let mut builder = warp::http::Response::builder().status(status);
    for (name, value) in response.headers.iter() {
        if is_hop_by_hop(name) || name == "content-length" {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!(header = name, "Dropping invalid response header"),
        }
    }

    builder
        .body(warp::hyper::Body::from(response.body))
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        })
}

fn text_response(status: StatusCode, body: &str) -> Response {
    warp::reply::with_status(body.to_string(), status).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::plugin::{PluginCandidate, PluginDescriptor, PluginSource};
    use crate::protocol::RouteSpec;
    use crate::routing::RouteRegistry;
    use crate::transport::MockPluginTransport;

    fn state_with(plugins: Vec<Arc<PluginDescriptor>>) -> Arc<AppState> {
        let dir = std::env::temp_dir().join("oasis-proxy-tests-no-such-dir");
        let (state, _rx) = AppState::with_source(Config::default(), PluginSource::Directory(dir));
        state
            .registry
            .store(Arc::new(RouteRegistry::build(1, state.config.routing.mode, plugins)));
        state
    }

    fn echo_plugin() -> Arc<PluginDescriptor> {
        let mut transport = MockPluginTransport::new();
        transport.expect_dispatch().returning(|_, request| {
            Ok(SerializedResponse::new(201, request.body.clone())
                .with_header("X-Echo", "1")
                .with_header("X-Forwarded-Url", request.url.clone())
                .with_header("Set-Cookie", "a=1")
                .with_header("Set-Cookie", "b=2")
                .with_header("Connection", "close")
                .with_header("Content-Length", "9999"))
        });
        let descriptor = PluginDescriptor::new(
            PluginCandidate::from_path("/plugins/echo"),
            Arc::new(transport),
            None,
        );
        descriptor.admit(vec![RouteSpec::prefix(None, "/echo", "echo")]);
        Arc::new(descriptor)
    }

    #[tokio::test]
    async fn test_forwards_request_and_copies_response() {
        let filter = routes(state_with(vec![echo_plugin()]));

        let response = warp::test::request()
            .method("PUT")
            .path("/echo/a/b?x=1")
            .header("X-Custom", "yes")
            .body("hello plugin")
            .reply(&filter)
            .await;

        assert_eq!(response.status(), 201);
        assert_eq!(response.body(), "hello plugin");
        assert_eq!(response.headers()["x-echo"], "1");
        assert_eq!(response.headers()["x-forwarded-url"], "/a/b?x=1");
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
        assert!(response.headers().get("connection").is_none());
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let filter = routes(state_with(vec![echo_plugin()]));
        let response = warp::test::request().path("/nothing").reply(&filter).await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_reload_path_rejects_other_methods() {
        let filter = routes(state_with(vec![]));
        let response = warp::test::request()
            .method("GET")
            .path("/reload_plugins")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 405);
    }

    #[tokio::test]
    async fn test_reload_failure_is_500() {
        // The configured directory does not exist, so enumeration fails.
        let filter = routes(state_with(vec![]));
        let response = warp::test::request()
            .method("POST")
            .path("/reload_plugins")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 500);
        assert!(String::from_utf8_lossy(response.body()).starts_with("Failed to reload plugins"));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let dir = std::env::temp_dir().join("oasis-proxy-tests-no-such-dir");
        let mut config = Config::default();
        config.listener.max_body_bytes = 4;
        let (state, _rx) = AppState::with_source(config, PluginSource::Directory(dir));
        let filter = routes(state);

        let response = warp::test::request()
            .method("POST")
            .path("/anything")
            .body("too large")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 413);
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_refused_unread() {
        let dir = std::env::temp_dir().join("oasis-proxy-tests-no-such-dir");
        let mut config = Config::default();
        config.listener.max_body_bytes = 1024;
        let (state, _rx) = AppState::with_source(config, PluginSource::Directory(dir));
        let filter = routes(state);

        // Only the header is over the limit; the body is never looked at.
        let response = warp::test::request()
            .method("POST")
            .path("/anything")
            .header("content-length", "1048576")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 413);

        let response = warp::test::request()
            .method("POST")
            .path("/anything")
            .body("small")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn test_invalid_plugin_status_becomes_500() {
        let response = into_response(SerializedResponse::new(1000, "x"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
