//! Immutable route table built from one generation of admitted plugins.
//!
//! A registry is never mutated once published. Reloading builds a fresh one
//! and swaps the shared pointer, so a request always resolves against a
//! single consistent snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::plugin::PluginDescriptor;
use crate::protocol::{RouteKind, RouteSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Only a request path equal to a registered pattern matches.
    Exact,
    /// Exact-kind routes first, then the longest segment-aligned prefix.
    #[default]
    Prefix,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// `None` matches any method.
    pub method: Option<String>,
    /// Full pattern including the owner's mount prefix.
    pub pattern: String,
    pub kind: RouteKind,
    pub handler_id: String,
    /// Removed from the request path before it is forwarded.
    pub strip: Option<String>,
    pub owner: Arc<PluginDescriptor>,
}

impl RouteEntry {
    fn from_spec(spec: &RouteSpec, owner: &Arc<PluginDescriptor>) -> Self {
        let mount = owner.mount_prefix();
        let pattern = join_paths(mount, &spec.pattern);
        let strip = match spec.kind {
            RouteKind::Prefix => Some(pattern.clone()),
            RouteKind::Exact => mount.map(str::to_string),
        };
        Self {
            method: spec.method.as_ref().map(|m| m.to_ascii_uppercase()),
            pattern,
            kind: spec.kind,
            handler_id: spec.handler_id.clone(),
            strip,
            owner: owner.clone(),
        }
    }

    pub fn accepts(&self, method: &str) -> bool {
        self.method
            .as_deref()
            .map_or(true, |m| m.eq_ignore_ascii_case(method))
    }

    /// Path the owning plugin sees for `path`.
    pub fn forwarded_path(&self, path: &str) -> String {
        match &self.strip {
            Some(strip) => strip_path_prefix(path, strip),
            None => path.to_string(),
        }
    }
}

/// The selected entry and the path the plugin should see.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub entry: &'a RouteEntry,
    pub forwarded_path: String,
}

/// Serializable view of one entry, for the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteView {
    pub method: Option<String>,
    pub pattern: String,
    pub kind: RouteKind,
    pub handler_id: String,
    pub plugin: String,
}

pub struct RouteRegistry {
    generation: u64,
    mode: MatchMode,
    entries: Vec<RouteEntry>,
    /// Entries compared against the whole path, by pattern.
    exact: HashMap<String, Vec<usize>>,
    /// Prefix entries by pattern, walked from the longest path ancestor down.
    prefixes: HashMap<String, Vec<usize>>,
    plugins: Vec<Arc<PluginDescriptor>>,
}

impl RouteRegistry {
    pub fn empty(mode: MatchMode) -> Self {
        Self::build(0, mode, Vec::new())
    }

    /// Merge the routes of every `Ready` plugin. Registration order is the
    /// plugins sorted by name, then each plugin's own route order; a later
    /// registration of an identical `(method, pattern, kind)` is shadowed.
    pub fn build(generation: u64, mode: MatchMode, plugins: Vec<Arc<PluginDescriptor>>) -> Self {
        let mut plugins: Vec<_> = plugins.into_iter().filter(|p| p.is_ready()).collect();
        plugins.sort_by(|a, b| a.name().cmp(b.name()));

        let mut registry = Self {
            generation,
            mode,
            entries: Vec::new(),
            exact: HashMap::new(),
            prefixes: HashMap::new(),
            plugins: Vec::new(),
        };
        let mut seen: HashSet<(Option<String>, String, RouteKind)> = HashSet::new();

        for plugin in &plugins {
            for spec in plugin.routes() {
                let entry = RouteEntry::from_spec(spec, plugin);
                let key = (entry.method.clone(), entry.pattern.clone(), entry.kind);
                if !seen.insert(key) {
                    warn!(
                        plugin = %plugin.name(),
                        pattern = %entry.pattern,
                        method = entry.method.as_deref().unwrap_or("*"),
                        "Route shadowed by an earlier registration"
                    );
                    continue;
                }

                let index = registry.entries.len();
                let by_exact = mode == MatchMode::Exact || entry.kind == RouteKind::Exact;
                let table = if by_exact {
                    &mut registry.exact
                } else {
                    &mut registry.prefixes
                };
                table.entry(entry.pattern.clone()).or_default().push(index);
                registry.entries.push(entry);
            }
        }

        registry.plugins = plugins;
        debug!(
            generation,
            routes = registry.entries.len(),
            plugins = registry.plugins.len(),
            "Built route registry"
        );
        registry
    }

    /// Select at most one entry for `(method, path)`. `path` excludes the
    /// query string.
    pub fn resolve(&self, method: &str, path: &str) -> Option<RouteMatch<'_>> {
        if let Some(entry) = self.pick(self.exact.get(path), method) {
            return Some(RouteMatch {
                entry,
                forwarded_path: entry.forwarded_path(path),
            });
        }

        if self.mode == MatchMode::Exact {
            return None;
        }

        segment_prefixes(path)
            .find_map(|candidate| self.pick(self.prefixes.get(candidate), method))
            .map(|entry| RouteMatch {
                entry,
                forwarded_path: entry.forwarded_path(path),
            })
    }

    /// Method-specific beats any-method, then first registered wins.
    fn pick(&self, bucket: Option<&Vec<usize>>, method: &str) -> Option<&RouteEntry> {
        let bucket = bucket?;
        let mut fallback = None;
        for entry in bucket.iter().map(|&i| &self.entries[i]) {
            match &entry.method {
                Some(m) if m.eq_ignore_ascii_case(method) => return Some(entry),
                Some(_) => {}
                None if fallback.is_none() => fallback = Some(entry),
                None => {}
            }
        }
        fallback
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// The plugin generation this snapshot was built from.
    pub fn plugins(&self) -> &[Arc<PluginDescriptor>] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn views(&self) -> Vec<RouteView> {
        self.entries
            .iter()
            .map(|e| RouteView {
                method: e.method.clone(),
                pattern: e.pattern.clone(),
                kind: e.kind,
                handler_id: e.handler_id.clone(),
                plugin: e.owner.name().to_string(),
            })
            .collect()
    }
}

impl std::fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("generation", &self.generation)
            .field("mode", &self.mode)
            .field("routes", &self.entries.len())
            .finish()
    }
}

/// `path` followed by each of its segment-aligned ancestors, longest first:
/// `/a/b/c`, `/a/b`, `/a`, `/`.
fn segment_prefixes(path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = match current.rfind('/') {
            _ if current == "/" => None,
            Some(0) => Some("/"),
            Some(i) => Some(&current[..i]),
            None => None,
        };
        Some(current)
    })
}

fn strip_path_prefix(path: &str, prefix: &str) -> String {
    if prefix == "/" {
        return path.to_string();
    }
    match path.strip_prefix(prefix) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    }
}

/// Join a mount prefix and a route pattern without doubling or losing the
/// separator. Trailing slashes are dropped except for the root.
pub fn join_paths(mount: Option<&str>, pattern: &str) -> String {
    let pattern = pattern.trim_end_matches('/');
    let joined = match mount {
        Some(mount) => format!("{}{}", mount.trim_end_matches('/'), pattern),
        None => pattern.to_string(),
    };
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}
