// Reference resolution — decides whether a logical image reference is a
// bundled asset or a cloud-hosted resource and produces one concrete target.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

/// A logical request for one image. Immutable once built; owned by the call
/// that issued it until it completes or is cancelled.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    /// Logical reference: a URL, a relative path, or an asset identifier.
    pub id: String,
    /// Whether bundled ("hybrid") assets may satisfy this request.
    pub hybrid_assets: bool,
    /// Base URL prepended to relative references.
    pub cloud_url: Option<String>,
    /// Custom headers sent with the network fetch. Keys are normalized to
    /// lowercase; duplicate keys are last-write-wins.
    pub headers: BTreeMap<String, String>,
    /// Surface resolution decisions as debug events. Never affects the
    /// resolved target.
    pub log_resolution: bool,
}

impl ImageRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hybrid_assets: false,
            cloud_url: None,
            headers: BTreeMap::new(),
            log_resolution: false,
        }
    }

    pub fn hybrid_assets(mut self, enabled: bool) -> Self {
        self.hybrid_assets = enabled;
        self
    }

    pub fn cloud_url(mut self, base: impl Into<String>) -> Self {
        self.cloud_url = Some(base.into());
        self
    }

    pub fn header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn log_resolution(mut self, enabled: bool) -> Self {
        self.log_resolution = enabled;
        self
    }
}

/// One concrete fetch target derived from an [`ImageRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// An image bundled with the application, addressed by its path relative
    /// to the asset root.
    LocalAsset { identifier: String },
    /// A cloud-hosted image to fetch over HTTP.
    RemoteResource {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl ResolvedTarget {
    pub fn cache_key(&self) -> CacheKey {
        match self {
            Self::LocalAsset { identifier } => CacheKey::derive(identifier),
            Self::RemoteResource { url, .. } => CacheKey::derive(url),
        }
    }
}

/// Stable identifier for a cached artifact, derived from the resolved
/// target. Two requests with the same key refer to the same artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    fn derive(input: &str) -> Self {
        let digest = Sha256::digest(input.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// The set of image identifiers bundled with the application, plus the
/// directory they were packaged under.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    root: PathBuf,
    identifiers: HashSet<String>,
}

impl AssetCatalog {
    pub fn new(root: impl Into<PathBuf>, identifiers: impl IntoIterator<Item = String>) -> Self {
        Self {
            root: root.into(),
            identifiers: identifiers.into_iter().collect(),
        }
    }

    /// Build a catalog by listing the files under `root` (recursively),
    /// registering each relative path as an identifier.
    pub fn scan(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        let mut identifiers = HashSet::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&root) {
                    identifiers.insert(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(Self { root, identifiers })
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.identifiers.contains(identifier)
    }

    /// Filesystem path of a bundled asset.
    pub fn local_path(&self, identifier: &str) -> PathBuf {
        self.root.join(identifier)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Resolve a request into one concrete target. Pure and total: malformed
/// input degrades to a best-effort remote interpretation, never an error.
pub fn resolve(catalog: &AssetCatalog, request: &ImageRequest) -> ResolvedTarget {
    if request.hybrid_assets {
        let identifier = asset_identifier(&request.id, request.cloud_url.as_deref());
        if catalog.contains(&identifier) {
            return ResolvedTarget::LocalAsset { identifier };
        }
    }

    ResolvedTarget::RemoteResource {
        url: effective_url(&request.id, request.cloud_url.as_deref()),
        headers: request.headers.clone(),
    }
}

/// Derive the bundled-asset identifier a reference would map to: strip the
/// cloud base prefix, drop a `?alt=media`-style delivery suffix, and decode
/// percent-encoded path separators.
fn asset_identifier(reference: &str, cloud_url: Option<&str>) -> String {
    let mut path = reference;
    if let Some(base) = cloud_url {
        if let Some(rest) = path.strip_prefix(base) {
            path = rest;
        }
    }
    let path = path.split("?alt=media").next().unwrap_or(path);
    let path = path.replace("%2F", "/").replace("%2f", "/");
    path.trim_start_matches('/').to_string()
}

/// Produce the URL a remote fetch should hit. Absolute references pass
/// through untouched; relative references join onto the cloud base with
/// exactly one separating slash.
fn effective_url(reference: &str, cloud_url: Option<&str>) -> String {
    if Url::parse(reference).is_ok() {
        return reference.to_string();
    }
    match cloud_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), reference.trim_start_matches('/')),
        // No scheme and no base to join onto: pass the reference through
        // as-is and let the fetch fail with a permanent error.
        None => reference.to_string(),
    }
}
