use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::protocol::{RouteKind, RouteSpec, SerializedRequest, SerializedResponse};

type Handler = Arc<dyn Fn(SerializedRequest) -> BoxFuture<'static, SerializedResponse> + Send + Sync>;

/// Route table of a plugin binary. Handler ids are derived from the method
/// and pattern, so the host never needs to know them in advance.
#[derive(Default, Clone)]
pub struct PluginRouter {
    routes: Vec<RouteSpec>,
    handlers: HashMap<String, Handler>,
}

impl PluginRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve exactly `pattern` for `method`.
    pub fn exact<F, Fut>(self, method: &str, pattern: &str, handler: F) -> Self
    where
        F: Fn(SerializedRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SerializedResponse> + Send + 'static,
    {
        self.add(Some(method), pattern, RouteKind::Exact, handler)
    }

    /// Serve `pattern` and everything below it. `None` accepts any method.
    pub fn prefix<F, Fut>(self, method: Option<&str>, pattern: &str, handler: F) -> Self
    where
        F: Fn(SerializedRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SerializedResponse> + Send + 'static,
    {
        self.add(method, pattern, RouteKind::Prefix, handler)
    }

    fn add<F, Fut>(mut self, method: Option<&str>, pattern: &str, kind: RouteKind, handler: F) -> Self
    where
        F: Fn(SerializedRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SerializedResponse> + Send + 'static,
    {
        let method = method.map(str::to_ascii_uppercase);
        let handler_id = format!("{} {}", method.as_deref().unwrap_or("ANY"), pattern);
        self.routes.push(RouteSpec {
            method,
            pattern: pattern.to_string(),
            kind,
            handler_id: handler_id.clone(),
        });
        self.handlers
            .insert(handler_id, Arc::new(move |request| handler(request).boxed()));
        self
    }

    pub fn routes(&self) -> Vec<RouteSpec> {
        self.routes.clone()
    }

    /// Run the handler registered under `handler_id`.
    pub async fn handle(
        &self,
        handler_id: &str,
        request: SerializedRequest,
    ) -> Result<SerializedResponse, String> {
        let handler = self
            .handlers
            .get(handler_id)
            .cloned()
            .ok_or_else(|| format!("unknown handler '{handler_id}'"))?;
        Ok(handler(request).await)
    }
}
