//! Enumeration of plugin binaries, either from a directory scan or from the
//! explicit entry list in the configuration.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{PluginEntry, PluginSourceConfig};
use crate::error::{HostError, Result};

/// A binary the host could run, with everything that decides whether an
/// already running instance is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCandidate {
    pub name: String,
    pub path: PathBuf,
    pub mount_prefix: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Hex SHA-256 of the binary, `None` if it could not be read.
    pub fingerprint: Option<String>,
}

impl PluginCandidate {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            mount_prefix: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            fingerprint: None,
        }
    }

    pub fn from_entry(entry: &PluginEntry) -> Self {
        Self {
            name: entry.name.clone(),
            path: entry.path.clone(),
            mount_prefix: entry.prefix.as_deref().and_then(normalize_mount_prefix),
            args: entry.args.clone(),
            env: entry
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            fingerprint: None,
        }
    }

    pub fn with_mount_prefix(mut self, prefix: &str) -> Self {
        self.mount_prefix = normalize_mount_prefix(prefix);
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// `"/"` and `""` mean "no mount point"; trailing slashes are dropped.
pub fn normalize_mount_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

#[derive(Debug, Clone)]
pub enum PluginSource {
    Directory(PathBuf),
    Entries(Vec<PluginEntry>),
}

impl PluginSource {
    pub fn from_config(config: &PluginSourceConfig) -> Self {
        match &config.directory {
            Some(dir) => PluginSource::Directory(dir.clone()),
            None => PluginSource::Entries(config.entries.clone()),
        }
    }

    /// Lists the candidates in a stable order. A missing or unreadable
    /// directory is an error; a missing entry binary is not, it simply fails
    /// to launch later.
    pub async fn enumerate(&self) -> Result<Vec<PluginCandidate>> {
        let mut candidates = match self {
            PluginSource::Directory(dir) => scan_directory(dir).await?,
            PluginSource::Entries(entries) => entries.iter().map(PluginCandidate::from_entry).collect(),
        };

        for candidate in &mut candidates {
            candidate.fingerprint = fingerprint(&candidate.path).await;
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(candidates)
    }
}

async fn scan_directory(dir: &Path) -> Result<Vec<PluginCandidate>> {
    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| {
        HostError::Discovery(format!("cannot read plugin directory {}: {}", dir.display(), e))
    })?;

    let mut candidates = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }

        // Follows symlinks, so a linked binary counts as a regular file.
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable plugin candidate");
                continue;
            }
        };
        if !metadata.is_file() || !is_executable(&path, &metadata) {
            debug!(path = %path.display(), "Skipping non-executable file");
            continue;
        }

        candidates.push(PluginCandidate::from_path(path));
    }

    Ok(candidates)
}

#[cfg(unix)]
fn is_executable(_path: &Path, metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _metadata: &std::fs::Metadata) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

async fn fingerprint(path: &Path) -> Option<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path).ok()?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).ok()?;
        Some(format!("{:x}", hasher.finalize()))
    })
    .await
    .ok()
    .flatten()
}
