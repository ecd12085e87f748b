//! Messages exchanged with a plugin after the handshake.
//!
//! Every frame on the channel is a length-prefixed JSON document holding either
//! an [`RpcRequest`] (host to plugin) or an [`RpcResponse`] (plugin to host).
//! Requests carry an id so several calls can be in flight on one connection.
//! Bodies travel as standard base64 strings.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Case-insensitive header multimap. Names are stored lower-cased, each name
/// may carry several values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMultimap(BTreeMap<String, Vec<String>>);

impl HeaderMultimap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Iterates `(name, value)` pairs, one per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderMultimap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = HeaderMultimap::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value);
        }
        headers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRequest {
    pub method: String,
    /// Path relative to the plugin's mount point, plus the query string if any.
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMultimap,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl SerializedRequest {
    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(&self.url, |(path, _)| path)
    }

    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, query)| query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderMultimap,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl SerializedResponse {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            headers: HeaderMultimap::new(),
            body: body.into(),
        }
    }

    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        Self::new(status_code, body.into().into_bytes())
            .with_header("content-type", "text/plain; charset=utf-8")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Exact,
    Prefix,
}

/// A route as advertised by a plugin through `list_routes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// `None` accepts every method.
    #[serde(default)]
    pub method: Option<String>,
    pub pattern: String,
    pub kind: RouteKind,
    pub handler_id: String,
}

impl RouteSpec {
    pub fn exact(method: &str, pattern: &str, handler_id: &str) -> Self {
        Self {
            method: Some(method.to_ascii_uppercase()),
            pattern: pattern.to_string(),
            kind: RouteKind::Exact,
            handler_id: handler_id.to_string(),
        }
    }

    pub fn prefix(method: Option<&str>, pattern: &str, handler_id: &str) -> Self {
        Self {
            method: method.map(str::to_ascii_uppercase),
            pattern: pattern.to_string(),
            kind: RouteKind::Prefix,
            handler_id: handler_id.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.pattern.starts_with('/') {
            return Err("pattern must start with '/'".to_string());
        }
        if self.pattern.contains(['?', '#']) {
            return Err("pattern must not contain a query or fragment".to_string());
        }
        if self.handler_id.is_empty() {
            return Err("handler id is empty".to_string());
        }
        if let Some(method) = &self.method {
            let is_token = !method.is_empty()
                && method
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
            if !is_token {
                return Err(format!("'{method}' is not a valid HTTP method"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcCall {
    ListRoutes,
    Dispatch {
        handler_id: String,
        request: SerializedRequest,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcReply {
    Routes { routes: Vec<RouteSpec> },
    Response { response: SerializedResponse },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: u64, reply: RpcReply) -> Self {
        Self {
            id,
            result: Some(reply),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Upper bound of the encoded size of a body of `len` bytes.
pub fn encoded_body_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(Bytes::from)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(frame)
}
