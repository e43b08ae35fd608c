//! Template source loading
//!
//! The [`Loader`] resolves mold paths through the [`Registry`] and
//! obtains source text either from the resident set (sources the host
//! already holds, no I/O) or from a [`SourceFetcher`]. It keeps no cache
//! of fetched sources and does not deduplicate requests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::config::{DEFAULT_WRAPPER_NAME, REQ_TMPL_NAME};
use crate::error::NunjaError;
use crate::registry::Registry;

/// Source of the built-in wrapper mold
pub const DEFAULT_WRAPPER_SOURCE: &str =
    include_str!("../molds/_core_/_default_wrapper_/template.jinja");

/// Raw template text as delivered by the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub source: Arc<str>,
    /// Resolved resource path
    pub path: String,
    /// Served from the resident set, without I/O
    pub resident: bool,
}

/// Async transport for template sources
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, path: &str) -> Result<String, NunjaError>;
}

/// Reads sources from the filesystem, optionally below a root directory
#[derive(Debug, Clone, Default)]
pub struct FsFetcher {
    root: Option<PathBuf>,
}

impl FsFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl SourceFetcher for FsFetcher {
    fn name(&self) -> &str {
        "fs"
    }

    async fn fetch(&self, path: &str) -> Result<String, NunjaError> {
        let full = self.full_path(path);
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| NunjaError::Fetch {
                path: path.to_string(),
                details: e.to_string(),
            })
    }
}

/// In-memory sources keyed by resource path
///
/// Counts every fetch and can add artificial latency, which makes
/// load de-duplication observable in tests.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    sources: DashMap<String, Arc<str>>,
    fetches: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, path: impl Into<String>, source: impl Into<Arc<str>>) {
        self.sources.insert(path.into(), source.into());
    }

    pub fn remove(&self, path: &str) {
        self.sources.remove(path);
    }

    /// Number of fetches issued so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for MemoryFetcher {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, path: &str) -> Result<String, NunjaError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sources
            .get(path)
            .map(|s| s.to_string())
            .ok_or_else(|| NunjaError::Fetch {
                path: path.to_string(),
                details: "no such source".to_string(),
            })
    }
}

/// Resolves mold paths and hands out their sources
#[derive(Clone)]
pub struct Loader {
    registry: Arc<Registry>,
    fetcher: Arc<dyn SourceFetcher>,
    /// Sources already held by the host, keyed by resolved path
    resident: Arc<DashMap<String, Arc<str>>>,
}

impl Loader {
    /// New loader; the built-in wrapper template is resident from the start
    pub fn new(registry: Arc<Registry>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        let loader = Self {
            registry,
            fetcher,
            resident: Arc::new(DashMap::new()),
        };
        loader.preload_builtin_wrapper(REQ_TMPL_NAME);
        loader
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn fetcher(&self) -> &Arc<dyn SourceFetcher> {
        &self.fetcher
    }

    /// Make a source resident under its resolved resource path
    pub fn preload(&self, path: impl Into<String>, source: impl Into<Arc<str>>) {
        self.resident.insert(path.into(), source.into());
    }

    /// Resolve `mold_path` and make the source resident under that path
    pub fn preload_mold_path(
        &self,
        mold_path: &str,
        source: impl Into<Arc<str>>,
    ) -> Result<String, NunjaError> {
        let path = self.registry.lookup_path(mold_path)?;
        self.preload(path.clone(), source);
        Ok(path)
    }

    /// Resident copy of the built-in wrapper under the given template name
    pub(crate) fn preload_builtin_wrapper(&self, required_template_name: &str) {
        if let Ok(path) = self
            .registry
            .lookup_path(&format!("{DEFAULT_WRAPPER_NAME}/{required_template_name}"))
        {
            self.resident
                .entry(path)
                .or_insert_with(|| Arc::from(DEFAULT_WRAPPER_SOURCE));
        }
    }

    pub fn is_resident(&self, mold_path: &str) -> bool {
        self.registry
            .lookup_path(mold_path)
            .map(|path| self.resident.contains_key(&path))
            .unwrap_or(false)
    }

    /// Synchronous mode: resident sources only, never any I/O
    pub fn get_source(&self, mold_path: &str) -> Result<TemplateSource, NunjaError> {
        let path = self.registry.lookup_path(mold_path)?;
        let source = self
            .resident
            .get(&path)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| NunjaError::NotResident { path: path.clone() })?;
        Ok(TemplateSource {
            source,
            path,
            resident: true,
        })
    }

    /// Asynchronous mode: resident sources first, then the fetcher
    #[instrument(skip(self), fields(fetcher = self.fetcher.name()))]
    pub async fn fetch_source(&self, mold_path: &str) -> Result<TemplateSource, NunjaError> {
        let path = self.registry.lookup_path(mold_path)?;
        if let Some(source) = self.resident.get(&path).map(|s| Arc::clone(s.value())) {
            debug!(%path, "resident source");
            return Ok(TemplateSource {
                source,
                path,
                resident: true,
            });
        }

        let text = self.fetcher.fetch(&path).await?;
        debug!(%path, len = text.len(), "fetched source");
        Ok(TemplateSource {
            source: Arc::from(text),
            path,
            resident: false,
        })
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("registry", &self.registry.name())
            .field("fetcher", &self.fetcher.name())
            .field("resident", &self.resident.len())
            .finish()
    }
}
