//! nunja - progressive-enhancement mold binding engine
//!
//! Scans a document for `data-nunja` markers, lazily loads and compiles
//! each mold's template, and hands marked elements to their behaviors.

pub mod behavior;
pub mod config;
pub mod dom;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod loader;
pub mod registry;
pub mod template;

pub use behavior::{Behavior, BehaviorRegistry};
pub use config::EngineConfig;
pub use dom::{Document, Element};
pub use engine::{BindBatch, BindOutcome, Engine, LoadResult, MoldStatus};
pub use error::{FixSuggestion, NunjaError};
pub use event_log::{Event, EventKind, EventLog};
pub use loader::{FsFetcher, Loader, MemoryFetcher, SourceFetcher, TemplateSource};
pub use registry::Registry;
pub use template::CompiledTemplate;
