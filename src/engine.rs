//! Mold engine
//!
//! Coordinates scanning, lazy template loading, the compiled-template
//! cache and behavior binding.
//!
//! ## Cache
//!
//! One entry per mold id, moving `Unrequested → Loading → Compiled`:
//! - the first request inserts `Loading` and spawns a single fetch+compile
//! - requests arriving while `Loading` join the pending waiters
//! - completion drains every waiter with the same result
//! - `Compiled` is terminal; a failed load removes the entry so the next
//!   request starts a fresh fetch
//!
//! The fetch+compile runs in its own task, so dropping a waiting future
//! never abandons a load other callers depend on.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use minijinja::Value;
use once_cell::sync::OnceCell;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::behavior::BehaviorRegistry;
use crate::config::{EngineConfig, MARKER_ATTRIBUTE};
use crate::dom::{Element, WithAttr};
use crate::error::NunjaError;
use crate::event_log::{EventKind, EventLog};
use crate::loader::{Loader, TemplateSource};
use crate::registry::parse_mold_id;
use crate::template::{
    data_context, marker_attribute, CompiledTemplate, NUNJA_DATA_KEY, TEMPLATE_KEY,
    WRAPPER_TAG_KEY,
};

pub type LoadResult = Result<Arc<CompiledTemplate>, NunjaError>;

enum MoldState {
    Loading(Vec<oneshot::Sender<LoadResult>>),
    Compiled(Arc<CompiledTemplate>),
}

/// Cache state of one mold id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoldStatus {
    Unrequested,
    Loading,
    Compiled,
}

/// Result of binding one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// The behavior's `init` ran for this element
    Initialized { mold_id: String },
    /// An earlier bind already claimed the element
    AlreadyBound { mold_id: String },
    /// Template compiled but no behavior is registered for the mold
    Inert { mold_id: String },
}

impl BindOutcome {
    pub fn mold_id(&self) -> &str {
        match self {
            Self::Initialized { mold_id }
            | Self::AlreadyBound { mold_id }
            | Self::Inert { mold_id } => mold_id,
        }
    }
}

enum Request {
    Ready(Arc<CompiledTemplate>),
    Pending(oneshot::Receiver<LoadResult>),
}

/// Handles of the bind tasks started by [`Engine::scan_and_bind`], in
/// document order
pub struct BindBatch {
    handles: Vec<JoinHandle<Result<BindOutcome, NunjaError>>>,
}

impl BindBatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every bind; results keep document order
    pub async fn join(self) -> Vec<Result<BindOutcome, NunjaError>> {
        join_all(self.handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(NunjaError::Bind {
                        details: e.to_string(),
                    })
                })
            })
            .collect()
    }
}

struct EngineInner {
    config: EngineConfig,
    loader: Loader,
    behaviors: BehaviorRegistry,
    cache: DashMap<String, MoldState>,
    wrapper: OnceCell<Arc<CompiledTemplate>>,
    events: EventLog,
}

/// Mold engine handle; clones share the same cache
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine. A resident wrapper mold (the built-in one always
    /// is) compiles right away; any other wrapper starts loading in the
    /// background, which needs a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        loader: Loader,
        behaviors: BehaviorRegistry,
    ) -> Result<Self, NunjaError> {
        config.validate()?;
        if config.uses_builtin_wrapper() {
            loader.preload_builtin_wrapper(&config.required_template_name);
        }

        let events = EventLog::with_capacity(config.event_log_capacity);
        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                loader,
                behaviors,
                cache: DashMap::new(),
                wrapper: OnceCell::new(),
                events,
            }),
        };

        let wrapper_id = engine.inner.config.wrapper_mold_id.clone();
        if engine.inner.loader.is_resident(&engine.template_name(&wrapper_id)) {
            let tmpl = engine.load_template_sync(&wrapper_id)?;
            let _ = engine.inner.wrapper.set(tmpl);
            return Ok(engine);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(NunjaError::Config(format!(
                "wrapper mold '{wrapper_id}' is not resident and no Tokio runtime is running to fetch it"
            )));
        }

        let slot = Arc::downgrade(&engine.inner);
        engine.load_template_then(&wrapper_id, move |result| match result {
            Ok(tmpl) => {
                if let Some(inner) = slot.upgrade() {
                    let _ = inner.wrapper.set(tmpl);
                }
            }
            Err(e) => warn!(error = %e, "wrapper mold failed to load"),
        });

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn loader(&self) -> &Loader {
        &self.inner.loader
    }

    pub fn behaviors(&self) -> &BehaviorRegistry {
        &self.inner.behaviors
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    /// Wait until the wrapper mold is compiled
    pub async fn ready(&self) -> Result<(), NunjaError> {
        if self.inner.wrapper.get().is_some() {
            return Ok(());
        }
        let tmpl = self.load_template(&self.inner.config.wrapper_mold_id).await?;
        let _ = self.inner.wrapper.set(tmpl);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.wrapper().is_ok()
    }

    pub fn status(&self, mold_id: &str) -> MoldStatus {
        match self.inner.cache.get(mold_id).as_deref() {
            None => MoldStatus::Unrequested,
            Some(MoldState::Loading(_)) => MoldStatus::Loading,
            Some(MoldState::Compiled(_)) => MoldStatus::Compiled,
        }
    }

    /// Compiled template for `mold_id`, if the cache holds one
    pub fn cached(&self, mold_id: &str) -> Option<Arc<CompiledTemplate>> {
        match self.inner.cache.get(mold_id).as_deref() {
            Some(MoldState::Compiled(tmpl)) => Some(Arc::clone(tmpl)),
            _ => None,
        }
    }

    /// Elements under `root` carrying the binding marker, in document order
    pub fn scan(&self, root: &Element) -> WithAttr {
        root.select_with_attr(MARKER_ATTRIBUTE)
    }

    /// Ensure a compiled template exists for `mold_id` and return it
    #[instrument(skip(self))]
    pub async fn load_template(&self, mold_id: &str) -> LoadResult {
        match self.request(mold_id)? {
            Request::Ready(tmpl) => Ok(tmpl),
            Request::Pending(rx) => rx.await.map_err(|_| NunjaError::LoadAborted {
                mold_id: mold_id.to_string(),
            })?,
        }
    }

    /// Callback form of [`Engine::load_template`]. A cached template (or
    /// a malformed id) invokes `on_compiled` before this returns; otherwise
    /// it runs on a spawned task once the load settles.
    pub fn load_template_then<F>(&self, mold_id: &str, on_compiled: F)
    where
        F: FnOnce(LoadResult) + Send + 'static,
    {
        match self.request(mold_id) {
            Err(e) => on_compiled(Err(e)),
            Ok(Request::Ready(tmpl)) => on_compiled(Ok(tmpl)),
            Ok(Request::Pending(rx)) => {
                let mold_id = mold_id.to_string();
                tokio::spawn(async move {
                    let result = rx
                        .await
                        .unwrap_or_else(|_| Err(NunjaError::LoadAborted { mold_id }));
                    on_compiled(result);
                });
            }
        }
    }

    /// Compile from resident sources only, without any I/O. Shares the
    /// cache with the async path and drains its waiters.
    pub fn load_template_sync(&self, mold_id: &str) -> LoadResult {
        parse_mold_id(mold_id)?;
        if let Some(tmpl) = self.cached(mold_id) {
            return Ok(tmpl);
        }
        let name = self.template_name(mold_id);
        let source = self.inner.loader.get_source(&name)?;
        let tmpl = self.compile(mold_id, &name, &source)?;
        Ok(self.settle_compiled(mold_id, tmpl))
    }

    /// Read the element's marker and start loading its template
    pub fn load_element(&self, element: &Element) -> Result<String, NunjaError> {
        let mold_id = marker_of(element)?;
        self.load_template_then(&mold_id, |_| {});
        Ok(mold_id)
    }

    /// Spawn [`Engine::bind_element`] for `element`
    pub fn init_element(&self, element: &Element) -> JoinHandle<Result<BindOutcome, NunjaError>> {
        let engine = self.clone();
        let element = element.clone();
        tokio::spawn(async move { engine.bind_element(&element).await })
    }

    /// Load the element's mold and hand the element to its behavior.
    /// The first bind of an element wins; later binds are no-ops.
    #[instrument(skip(self, element), fields(tag = %element.tag_name()))]
    pub async fn bind_element(&self, element: &Element) -> Result<BindOutcome, NunjaError> {
        let mold_id = marker_of(element)?;
        self.load_template(&mold_id).await?;

        let Some(behavior) = self.inner.behaviors.for_mold(&mold_id) else {
            debug!(%mold_id, "no behavior registered");
            return Ok(BindOutcome::Inert { mold_id });
        };

        if !element.claim_binding() {
            debug!(%mold_id, "element already bound");
            self.inner.events.emit(EventKind::BindSkipped {
                mold_id: mold_id.as_str().into(),
                tag: element.tag_name(),
            });
            return Ok(BindOutcome::AlreadyBound { mold_id });
        }

        behavior.init(element, self);
        self.inner.events.emit(EventKind::ElementBound {
            mold_id: mold_id.as_str().into(),
            tag: element.tag_name(),
        });
        Ok(BindOutcome::Initialized { mold_id })
    }

    /// Bind every marked element under `root`. Binds run independently;
    /// completion order is not document order.
    pub fn scan_and_bind(&self, root: &Element) -> BindBatch {
        let handles = self
            .scan(root)
            .map(|element| self.init_element(&element))
            .collect();
        BindBatch { handles }
    }

    /// Render a cached template. Never triggers a load.
    pub fn render(&self, mold_id: &str, data: &JsonValue) -> Result<String, NunjaError> {
        let tmpl = self.cached(mold_id).ok_or_else(|| NunjaError::NotLoaded {
            mold_id: mold_id.to_string(),
        })?;
        let mut ctx = data_context(mold_id, data)?;
        ctx.insert(
            NUNJA_DATA_KEY.to_string(),
            Value::from_safe_string(marker_attribute(mold_id)),
        );
        tmpl.render(Value::from(ctx))
    }

    /// Render `mold_id` and enclose it in the wrapper mold's container
    pub fn execute(&self, mold_id: &str, data: &JsonValue) -> Result<String, NunjaError> {
        let wrapper = self.wrapper()?;
        let inner = self.render(mold_id, data)?;

        let mut ctx: BTreeMap<String, Value> = data_context(mold_id, data)?;
        ctx.insert(
            NUNJA_DATA_KEY.to_string(),
            Value::from_safe_string(marker_attribute(mold_id)),
        );
        ctx.insert(TEMPLATE_KEY.to_string(), Value::from_safe_string(inner));
        ctx.insert(
            WRAPPER_TAG_KEY.to_string(),
            Value::from(self.inner.config.wrapper_tag.clone()),
        );
        wrapper.render(Value::from(ctx))
    }

    /// Re-render the element's content from its own mold
    pub fn populate(&self, element: &Element, data: &JsonValue) -> Result<(), NunjaError> {
        let mold_id = marker_of(element)?;
        let markup = self.render(&mold_id, data)?;
        element.set_inner_html(&markup);
        Ok(())
    }

    fn wrapper(&self) -> Result<Arc<CompiledTemplate>, NunjaError> {
        if let Some(tmpl) = self.inner.wrapper.get() {
            return Ok(Arc::clone(tmpl));
        }
        let wrapper_id = &self.inner.config.wrapper_mold_id;
        match self.cached(wrapper_id) {
            Some(tmpl) => {
                let _ = self.inner.wrapper.set(Arc::clone(&tmpl));
                Ok(tmpl)
            }
            None => Err(NunjaError::NotReady {
                wrapper_mold_id: wrapper_id.clone(),
            }),
        }
    }

    fn template_name(&self, mold_id: &str) -> String {
        format!("{mold_id}/{}", self.inner.config.required_template_name)
    }

    fn request(&self, mold_id: &str) -> Result<Request, NunjaError> {
        parse_mold_id(mold_id)?;

        let (tx, rx) = oneshot::channel();
        let start = match self.inner.cache.entry(mold_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                MoldState::Compiled(tmpl) => return Ok(Request::Ready(Arc::clone(tmpl))),
                MoldState::Loading(waiters) => {
                    waiters.push(tx);
                    false
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(MoldState::Loading(vec![tx]));
                true
            }
        };

        if start {
            self.inner.events.emit(EventKind::LoadStarted {
                mold_id: mold_id.into(),
            });
            self.spawn_load(mold_id);
        } else {
            debug!(mold_id, "joining in-flight load");
            self.inner.events.emit(EventKind::LoadJoined {
                mold_id: mold_id.into(),
            });
        }
        Ok(Request::Pending(rx))
    }

    fn spawn_load(&self, mold_id: &str) {
        let engine = self.clone();
        let mold_id = mold_id.to_string();
        tokio::spawn(async move {
            match engine.fetch_and_compile(&mold_id).await {
                Ok(tmpl) => {
                    engine.settle_compiled(&mold_id, tmpl);
                }
                Err(e) => engine.settle_failed(&mold_id, e),
            }
        });
    }

    async fn fetch_and_compile(&self, mold_id: &str) -> Result<CompiledTemplate, NunjaError> {
        let name = self.template_name(mold_id);
        let source = self.inner.loader.fetch_source(&name).await?;
        self.inner.events.emit(EventKind::SourceFetched {
            mold_id: mold_id.into(),
            path: source.path.clone(),
            len: source.source.len(),
            resident: source.resident,
        });
        self.compile(mold_id, &name, &source)
    }

    fn compile(
        &self,
        mold_id: &str,
        name: &str,
        source: &TemplateSource,
    ) -> Result<CompiledTemplate, NunjaError> {
        let tmpl = CompiledTemplate::compile_with_loader(name, &source.source, &self.inner.loader)?;
        self.inner.events.emit(EventKind::TemplateCompiled {
            mold_id: mold_id.into(),
        });
        Ok(tmpl)
    }

    /// Insert a compiled template (first write wins) and wake the waiters.
    /// Returns the template the cache holds afterwards.
    fn settle_compiled(&self, mold_id: &str, tmpl: CompiledTemplate) -> Arc<CompiledTemplate> {
        let tmpl = Arc::new(tmpl);
        let (winner, waiters) = match self.inner.cache.entry(mold_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                MoldState::Compiled(existing) => (Arc::clone(existing), Vec::new()),
                state @ MoldState::Loading(_) => {
                    let previous = std::mem::replace(state, MoldState::Compiled(Arc::clone(&tmpl)));
                    let waiters = match previous {
                        MoldState::Loading(waiters) => waiters,
                        MoldState::Compiled(_) => Vec::new(),
                    };
                    (tmpl, waiters)
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(MoldState::Compiled(Arc::clone(&tmpl)));
                (tmpl, Vec::new())
            }
        };

        debug!(mold_id, waiters = waiters.len(), "template compiled");
        for tx in waiters {
            let _ = tx.send(Ok(Arc::clone(&winner)));
        }
        winner
    }

    /// Drop the in-flight entry and hand the error to every waiter
    fn settle_failed(&self, mold_id: &str, error: NunjaError) {
        warn!(mold_id, error = %error, "template load failed");
        self.inner.events.emit(EventKind::LoadFailed {
            mold_id: mold_id.into(),
            error: error.to_string(),
        });

        let removed = self
            .inner
            .cache
            .remove_if(mold_id, |_, state| matches!(state, MoldState::Loading(_)));
        if let Some((_, MoldState::Loading(waiters))) = removed {
            for tx in waiters {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("cached", &self.inner.cache.len())
            .field("ready", &self.inner.wrapper.get().is_some())
            .finish()
    }
}

fn marker_of(element: &Element) -> Result<String, NunjaError> {
    element
        .attr(MARKER_ATTRIBUTE)
        .ok_or_else(|| NunjaError::MissingMarker {
            tag: element.tag_name(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryFetcher;
    use crate::registry::Registry;
    use serde_json::json;

    fn engine_with(fetcher: Arc<MemoryFetcher>) -> Engine {
        let mut registry = Registry::new("test");
        registry.register_mold("molds/basic", Some("t/basic")).unwrap();
        let loader = Loader::new(Arc::new(registry), fetcher);
        Engine::new(EngineConfig::default(), loader, BehaviorRegistry::new()).unwrap()
    }

    #[tokio::test]
    async fn status_moves_to_compiled() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert("molds/basic/template.jinja", "<b>{{ v }}</b>");
        let engine = engine_with(fetcher);

        assert_eq!(engine.status("t/basic"), MoldStatus::Unrequested);
        let pending = engine.load_template("t/basic");
        let tmpl = pending.await.unwrap();
        assert_eq!(tmpl.name(), "t/basic/template.jinja");
        assert_eq!(engine.status("t/basic"), MoldStatus::Compiled);
    }

    #[tokio::test]
    async fn callback_runs_synchronously_when_cached() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert("molds/basic/template.jinja", "<b></b>");
        let engine = engine_with(fetcher);
        engine.load_template("t/basic").await.unwrap();

        let hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        engine.load_template_then("t/basic", move |result| {
            assert!(result.is_ok());
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(hit.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn malformed_id_fails_before_caching() {
        let engine = engine_with(Arc::new(MemoryFetcher::new()));
        let err = engine.load_template("not-a-mold").await.unwrap_err();
        assert!(matches!(err, NunjaError::Resolution { .. }));
        assert_eq!(engine.status("not-a-mold"), MoldStatus::Unrequested);
    }

    #[tokio::test]
    async fn sync_load_uses_resident_source() {
        let engine = engine_with(Arc::new(MemoryFetcher::new()));
        assert!(matches!(
            engine.load_template_sync("t/basic"),
            Err(NunjaError::NotResident { .. })
        ));

        engine
            .loader()
            .preload_mold_path("t/basic/template.jinja", "<i>{{ v }}</i>")
            .unwrap();
        engine.load_template_sync("t/basic").unwrap();
        assert_eq!(
            engine.render("t/basic", &json!({"v": "ok"})).unwrap(),
            "<i>ok</i>"
        );
    }

    #[tokio::test]
    async fn render_injects_marker() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert("molds/basic/template.jinja", "<p {{ _nunja_data_ }}></p>");
        let engine = engine_with(fetcher);
        engine.load_template("t/basic").await.unwrap();
        assert_eq!(
            engine.render("t/basic", &JsonValue::Null).unwrap(),
            "<p data-nunja=\"t/basic\"></p>"
        );
    }

    #[tokio::test]
    async fn reserved_keys_override_caller_data() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert("molds/basic/template.jinja", "{{ _nunja_data_ }}");
        let engine = engine_with(fetcher);
        engine.load_template("t/basic").await.unwrap();
        let out = engine
            .render("t/basic", &json!({"_nunja_data_": "<evil>"}))
            .unwrap();
        assert_eq!(out, "data-nunja=\"t/basic\"");
    }

    #[tokio::test]
    async fn ready_compiles_builtin_wrapper() {
        let engine = engine_with(Arc::new(MemoryFetcher::new()));
        engine.ready().await.unwrap();
        assert!(engine.is_ready());
        assert_eq!(
            engine.status(crate::config::DEFAULT_WRAPPER_NAME),
            MoldStatus::Compiled
        );
    }

    #[test]
    fn builtin_wrapper_needs_no_runtime() {
        let engine = engine_with(Arc::new(MemoryFetcher::new()));
        assert!(engine.is_ready());

        engine
            .loader()
            .preload_mold_path("t/basic/template.jinja", "<b>{{ v }}</b>")
            .unwrap();
        engine.load_template_sync("t/basic").unwrap();
        assert_eq!(
            engine.execute("t/basic", &json!({"v": "x"})).unwrap(),
            "<div data-nunja=\"t/basic\">\n<b>x</b>\n</div>"
        );
    }

    fn wrap_loader() -> Loader {
        let mut registry = Registry::new("test");
        registry.register_mold("molds/wrap", Some("w/wrap")).unwrap();
        Loader::new(Arc::new(registry), Arc::new(MemoryFetcher::new()))
    }

    #[test]
    fn fetched_wrapper_without_runtime_is_an_error() {
        let err = Engine::new(
            EngineConfig::default().with_wrapper_mold("w/wrap"),
            wrap_loader(),
            BehaviorRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, NunjaError::Config(_)));
    }

    #[test]
    fn resident_wrapper_compile_error_fails_construction() {
        let loader = wrap_loader();
        loader
            .preload_mold_path("w/wrap/template.jinja", "{% if %}")
            .unwrap();
        let err = Engine::new(
            EngineConfig::default().with_wrapper_mold("w/wrap"),
            loader,
            BehaviorRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, NunjaError::Compile { .. }));
    }
}
