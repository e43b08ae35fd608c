//! Error types with fix suggestions
//!
//! Every variant is `Clone`: a single failed load is delivered to every
//! caller waiting on the same mold.

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NunjaError {
    // ─────────────────────────────────────────────────────────────
    // Cache state errors (NUNJA-010 to NUNJA-012)
    // ─────────────────────────────────────────────────────────────
    #[error("NUNJA-010: Template for mold '{mold_id}' is not loaded")]
    NotLoaded { mold_id: String },

    #[error("NUNJA-011: Wrapper mold '{wrapper_mold_id}' is not compiled yet")]
    NotReady { wrapper_mold_id: String },

    #[error("NUNJA-012: Load of mold '{mold_id}' was aborted before completion")]
    LoadAborted { mold_id: String },

    // ─────────────────────────────────────────────────────────────
    // Registry errors (NUNJA-020 to NUNJA-021)
    // ─────────────────────────────────────────────────────────────
    #[error("NUNJA-020: Cannot resolve '{mold_id}': {reason}")]
    Resolution { mold_id: String, reason: String },

    #[error("NUNJA-021: Mold '{mold_id}' is already registered")]
    DuplicateMold { mold_id: String },

    // ─────────────────────────────────────────────────────────────
    // Source errors (NUNJA-030 to NUNJA-031)
    // ─────────────────────────────────────────────────────────────
    #[error("NUNJA-030: Failed to fetch '{path}': {details}")]
    Fetch { path: String, details: String },

    #[error("NUNJA-031: Source '{path}' is not resident")]
    NotResident { path: String },

    // ─────────────────────────────────────────────────────────────
    // Template errors (NUNJA-040 to NUNJA-042)
    // ─────────────────────────────────────────────────────────────
    #[error("NUNJA-040: Template '{name}' failed to compile: {details}")]
    Compile { name: String, details: String },

    #[error("NUNJA-041: Template '{name}' failed to render: {details}")]
    Render { name: String, details: String },

    #[error("NUNJA-042: Data for mold '{mold_id}' must be an object, got {found}")]
    InvalidData { mold_id: String, found: String },

    // ─────────────────────────────────────────────────────────────
    // DOM and binding errors (NUNJA-050 to NUNJA-052)
    // ─────────────────────────────────────────────────────────────
    #[error("NUNJA-050: <{tag}> element has no data-nunja marker")]
    MissingMarker { tag: String },

    #[error("NUNJA-051: <{tag}> element is detached from the document")]
    Detached { tag: String },

    #[error("NUNJA-052: Binding task failed: {details}")]
    Bind { details: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration errors (NUNJA-060 to NUNJA-061)
    // ─────────────────────────────────────────────────────────────
    #[error("NUNJA-060: Invalid configuration: {0}")]
    Config(String),

    #[error("NUNJA-061: IO error on '{path}': {details}")]
    Io { path: String, details: String },
}

impl NunjaError {
    /// Build an `Io` error for the given path
    pub fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        NunjaError::Io {
            path: path.into(),
            details: err.to_string(),
        }
    }

    pub fn resolution(mold_id: impl Into<String>, reason: impl Into<String>) -> Self {
        NunjaError::Resolution {
            mold_id: mold_id.into(),
            reason: reason.into(),
        }
    }
}

impl FixSuggestion for NunjaError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            NunjaError::NotLoaded { .. } => {
                Some("Await Engine::load_template (or bind the element) before rendering")
            }
            NunjaError::NotReady { .. } => Some("Await Engine::ready() before calling execute"),
            NunjaError::LoadAborted { .. } => Some("Request the template again"),
            NunjaError::Resolution { .. } => {
                Some("Use a registered mold id of the form prefix/name")
            }
            NunjaError::DuplicateMold { .. } => Some("Pick a unique mold id for each location"),
            NunjaError::Fetch { .. } => Some("Check that the template file exists and is readable"),
            NunjaError::NotResident { .. } => {
                Some("Preload the source with Loader::preload or use the async loader")
            }
            NunjaError::Compile { .. } => Some("Check the template syntax"),
            NunjaError::Render { .. } => Some("Check the data passed to the template"),
            NunjaError::InvalidData { .. } => Some("Pass a JSON object (or null) as template data"),
            NunjaError::MissingMarker { .. } => Some("Add a data-nunja=\"prefix/name\" attribute"),
            NunjaError::Detached { .. } => Some("Only attached elements can be replaced"),
            NunjaError::Bind { .. } => Some("Check the behavior's init for panics"),
            NunjaError::Config(_) => Some("Check the engine configuration values"),
            NunjaError::Io { .. } => Some("Check file path and permissions"),
        }
    }
}
