//! Engine integration tests
//!
//! - template loading: idempotence, single-flight, retry after failure
//! - render / execute: marker injection, escaping, wrapper
//! - synchronous loading from resident sources

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nunja::{
    BehaviorRegistry, Engine, EngineConfig, EventKind, Loader, MemoryFetcher, MoldStatus,
    NunjaError, Registry,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::oneshot;

// ============================================================================
// TEST HELPERS
// ============================================================================

fn registry() -> Registry {
    let mut registry = Registry::new("engine-tests");
    registry.register_mold("molds/msg", Some("t/msg")).unwrap();
    registry.register_mold("molds/list", Some("t/list")).unwrap();
    registry.register_mold("molds/slow", Some("w/slow")).unwrap();
    registry
}

fn fetcher() -> MemoryFetcher {
    let fetcher = MemoryFetcher::new();
    fetcher.insert("molds/msg/template.jinja", "<p>{{ msg }}</p>");
    fetcher
}

fn engine(fetcher: Arc<MemoryFetcher>) -> Engine {
    engine_with_config(fetcher, EngineConfig::default())
}

fn engine_with_config(fetcher: Arc<MemoryFetcher>, config: EngineConfig) -> Engine {
    let loader = Loader::new(Arc::new(registry()), fetcher);
    Engine::new(config, loader, BehaviorRegistry::new()).unwrap()
}

// ============================================================================
// LOADING
// ============================================================================

#[tokio::test]
async fn test_load_is_idempotent() {
    let fetcher = Arc::new(fetcher());
    let engine = engine(Arc::clone(&fetcher));

    let first = engine.load_template("t/msg").await.unwrap();
    let second = engine.load_template("t/msg").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fetcher.fetch_count(), 1);
    assert_eq!(
        engine
            .events()
            .count(|k| matches!(k, EventKind::TemplateCompiled { mold_id } if &**mold_id == "t/msg")),
        1
    );
}

#[tokio::test]
async fn test_concurrent_loads_share_one_fetch() {
    let fetcher = Arc::new(fetcher().with_delay(Duration::from_millis(50)));
    let engine = engine(Arc::clone(&fetcher));

    let loads = (0..10).map(|_| engine.load_template("t/msg"));
    let results: Vec<_> = join_all(loads).await;

    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert_eq!(fetcher.fetch_count(), 1);

    let events = engine.events();
    assert_eq!(
        events.count(|k| matches!(k, EventKind::LoadStarted { mold_id } if &**mold_id == "t/msg")),
        1
    );
    assert_eq!(
        events.count(|k| matches!(k, EventKind::LoadJoined { mold_id } if &**mold_id == "t/msg")),
        9
    );
}

#[tokio::test]
async fn test_status_reports_loading_while_fetching() {
    let fetcher = Arc::new(fetcher().with_delay(Duration::from_millis(30)));
    let engine = engine(fetcher);

    let (tx, rx) = oneshot::channel();
    engine.load_template_then("t/msg", move |result| {
        let _ = tx.send(result);
    });
    assert_eq!(engine.status("t/msg"), MoldStatus::Loading);

    rx.await.unwrap().unwrap();
    assert_eq!(engine.status("t/msg"), MoldStatus::Compiled);
}

#[tokio::test]
async fn test_failed_load_is_not_cached() {
    let fetcher = Arc::new(MemoryFetcher::new());
    let engine = engine(Arc::clone(&fetcher));

    let err = engine.load_template("t/msg").await.unwrap_err();
    assert!(matches!(err, NunjaError::Fetch { .. }));
    assert_eq!(engine.status("t/msg"), MoldStatus::Unrequested);

    fetcher.insert("molds/msg/template.jinja", "<p>{{ msg }}</p>");
    engine.load_template("t/msg").await.unwrap();
    assert_eq!(fetcher.fetch_count(), 2);
    assert_eq!(
        engine
            .events()
            .count(|k| matches!(k, EventKind::LoadFailed { .. })),
        1
    );
}

#[tokio::test]
async fn test_failure_reaches_every_waiter() {
    let fetcher = Arc::new(MemoryFetcher::new().with_delay(Duration::from_millis(20)));
    let engine = engine(Arc::clone(&fetcher));

    let results = join_all((0..3).map(|_| engine.load_template("t/msg"))).await;
    for result in results {
        assert!(matches!(result, Err(NunjaError::Fetch { .. })));
    }
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_callback_receives_load_failure() {
    let fetcher = Arc::new(MemoryFetcher::new().with_delay(Duration::from_millis(10)));
    let engine = engine(Arc::clone(&fetcher));

    let (tx, rx) = oneshot::channel();
    engine.load_template_then("t/msg", move |result| {
        let _ = tx.send(result);
    });

    let result = rx.await.unwrap();
    assert!(matches!(result, Err(NunjaError::Fetch { .. })));
    assert_eq!(engine.status("t/msg"), MoldStatus::Unrequested);
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_callback_runs_immediately_for_malformed_id() {
    let engine = engine(Arc::new(fetcher()));

    let (tx, mut rx) = oneshot::channel();
    engine.load_template_then("no-prefix", move |result| {
        let _ = tx.send(result);
    });

    let result = rx.try_recv().unwrap();
    assert!(matches!(result, Err(NunjaError::Resolution { .. })));
}

#[tokio::test]
async fn test_resident_source_skips_fetcher() {
    let fetcher = Arc::new(fetcher());
    let engine = engine(Arc::clone(&fetcher));
    engine
        .loader()
        .preload_mold_path("t/msg/template.jinja", "<p>resident {{ msg }}</p>")
        .unwrap();

    engine.load_template("t/msg").await.unwrap();
    assert_eq!(fetcher.fetch_count(), 0);
    assert_eq!(
        engine.events().count(|k| matches!(
            k,
            EventKind::SourceFetched { mold_id, resident: true, .. } if &**mold_id == "t/msg"
        )),
        1
    );
}

#[tokio::test]
async fn test_compile_error_is_reported() {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert("molds/msg/template.jinja", "{% for x in %}");
    let engine = engine(fetcher);

    let err = engine.load_template("t/msg").await.unwrap_err();
    assert!(matches!(err, NunjaError::Compile { .. }));
}

#[tokio::test]
async fn test_unknown_mold_is_a_resolution_error() {
    let engine = engine(Arc::new(fetcher()));
    let err = engine.load_template("nope/missing").await.unwrap_err();
    assert!(matches!(err, NunjaError::Resolution { .. }));
}

#[tokio::test]
async fn test_include_resolves_resident_sources() {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(
        "molds/list/template.jinja",
        "<ul>{% for item in items %}{% include \"t/list/row.jinja\" %}{% endfor %}</ul>",
    );
    let engine = engine(fetcher);
    engine
        .loader()
        .preload_mold_path("t/list/row.jinja", "<li>{{ item }}</li>")
        .unwrap();

    engine.load_template("t/list").await.unwrap();
    let out = engine
        .render("t/list", &json!({"items": ["a", "b"]}))
        .unwrap();
    assert_eq!(out, "<ul><li>a</li><li>b</li></ul>");
}

// ============================================================================
// SYNCHRONOUS LOADING
// ============================================================================

#[tokio::test]
async fn test_sync_load_requires_resident_source() {
    let fetcher = Arc::new(fetcher());
    let engine = engine(Arc::clone(&fetcher));

    let err = engine.load_template_sync("t/msg").unwrap_err();
    assert!(matches!(err, NunjaError::NotResident { .. }));
    assert_eq!(fetcher.fetch_count(), 0);
}

#[tokio::test]
async fn test_sync_load_settles_pending_waiters() {
    let fetcher = Arc::new(MemoryFetcher::new().with_delay(Duration::from_millis(80)));
    fetcher.insert("molds/msg/template.jinja", "fetched");
    let engine = engine(Arc::clone(&fetcher));

    let (tx, rx) = oneshot::channel();
    engine.load_template_then("t/msg", move |result| {
        let _ = tx.send(result);
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    engine
        .loader()
        .preload_mold_path("t/msg/template.jinja", "resident")
        .unwrap();
    let sync = engine.load_template_sync("t/msg").unwrap();
    let waited = rx.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&sync, &waited));

    // The fetch still in flight loses to the template already cached.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(engine.render("t/msg", &json!({})).unwrap(), "resident");
    assert_eq!(fetcher.fetch_count(), 1);
}

// ============================================================================
// RENDER / EXECUTE
// ============================================================================

#[tokio::test]
async fn test_render_requires_load() {
    let fetcher = Arc::new(fetcher());
    let engine = engine(Arc::clone(&fetcher));

    let err = engine.render("t/msg", &json!({"msg": "hi"})).unwrap_err();
    assert_eq!(
        err,
        NunjaError::NotLoaded {
            mold_id: "t/msg".to_string()
        }
    );
    assert_eq!(engine.status("t/msg"), MoldStatus::Unrequested);
    assert_eq!(fetcher.fetch_count(), 0);
}

#[tokio::test]
async fn test_render_escapes_values() {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(
        "molds/msg/template.jinja",
        "<p>{{ msg }}</p><p>{{ msg|safe }}</p>",
    );
    let engine = engine(fetcher);
    engine.load_template("t/msg").await.unwrap();

    let out = engine.render("t/msg", &json!({"msg": "a < b & c"})).unwrap();
    assert_eq!(out, "<p>a &lt; b &amp; c</p><p>a < b & c</p>");
}

#[tokio::test]
async fn test_render_rejects_non_object_data() {
    let engine = engine(Arc::new(fetcher()));
    engine.load_template("t/msg").await.unwrap();

    let err = engine.render("t/msg", &json!(["x"])).unwrap_err();
    assert!(matches!(err, NunjaError::InvalidData { ref found, .. } if found == "array"));
}

#[tokio::test]
async fn test_execute_wraps_render() {
    let engine = engine(Arc::new(fetcher()));
    engine.ready().await.unwrap();
    engine.load_template("t/msg").await.unwrap();

    let data = json!({"msg": "hi"});
    let inner = engine.render("t/msg", &data).unwrap();
    let out = engine.execute("t/msg", &data).unwrap();
    assert_eq!(inner, "<p>hi</p>");
    assert_eq!(out, "<div data-nunja=\"t/msg\">\n<p>hi</p>\n</div>");
}

#[tokio::test]
async fn test_execute_uses_configured_wrapper_tag() {
    let engine = engine_with_config(
        Arc::new(fetcher()),
        EngineConfig::default().with_wrapper_tag("section"),
    );
    engine.ready().await.unwrap();
    engine.load_template("t/msg").await.unwrap();

    let out = engine.execute("t/msg", &json!({"msg": "hi"})).unwrap();
    assert_eq!(out, "<section data-nunja=\"t/msg\">\n<p>hi</p>\n</section>");
}

#[tokio::test]
async fn test_execute_requires_target_template() {
    let engine = engine(Arc::new(fetcher()));
    engine.ready().await.unwrap();

    let err = engine.execute("t/msg", &json!({})).unwrap_err();
    assert!(matches!(err, NunjaError::NotLoaded { .. }));
}

#[tokio::test]
async fn test_execute_before_custom_wrapper_is_ready() {
    let fetcher = Arc::new(fetcher().with_delay(Duration::from_millis(40)));
    fetcher.insert(
        "molds/slow/template.jinja",
        "<{{ _wrapper_tag_ }} class=\"w\" {{ _nunja_data_ }}>{{ _template_ }}</{{ _wrapper_tag_ }}>",
    );
    let engine = engine_with_config(
        Arc::clone(&fetcher),
        EngineConfig::default().with_wrapper_mold("w/slow"),
    );

    let err = engine.execute("t/msg", &json!({})).unwrap_err();
    assert_eq!(
        err,
        NunjaError::NotReady {
            wrapper_mold_id: "w/slow".to_string()
        }
    );

    engine.ready().await.unwrap();
    assert!(engine.is_ready());
    engine.load_template("t/msg").await.unwrap();
    let out = engine.execute("t/msg", &json!({"msg": "hi"})).unwrap();
    assert_eq!(out, "<div class=\"w\" data-nunja=\"t/msg\"><p>hi</p></div>");
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let loader = Loader::new(Arc::new(registry()), Arc::new(fetcher()));
    let err = Engine::new(
        EngineConfig::default().with_wrapper_tag("not a tag"),
        loader,
        BehaviorRegistry::new(),
    )
    .unwrap_err();
    assert!(matches!(err, NunjaError::Config(_)));
}
