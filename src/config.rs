//! Engine configuration
//!
//! Supplied values are merged over the defaults; every field is optional
//! in YAML.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::NunjaError;
use crate::event_log::DEFAULT_EVENT_CAPACITY;

/// Filename every mold must provide
pub const REQ_TMPL_NAME: &str = "template.jinja";
/// Extension of template files inside a mold
pub const TMPL_FN_EXT: &str = ".jinja";
/// Engine-level mold used by `execute`
pub const DEFAULT_WRAPPER_NAME: &str = "_core_/_default_wrapper_";
/// Container tag used by the wrapper mold
pub const DEFAULT_WRAPPER_TAG: &str = "div";
/// Attribute that links an element to its mold
pub const MARKER_ATTRIBUTE: &str = "data-nunja";
/// Suffix of a mold's behavior entry point (`<moldId>/index`)
pub const ENTRY_POINT_SUFFIX: &str = "index";

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub required_template_name: String,
    pub wrapper_mold_id: String,
    pub wrapper_tag: String,
    /// Newest engine events kept in the event log
    pub event_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            required_template_name: REQ_TMPL_NAME.to_string(),
            wrapper_mold_id: DEFAULT_WRAPPER_NAME.to_string(),
            wrapper_tag: DEFAULT_WRAPPER_TAG.to_string(),
            event_log_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn with_wrapper_tag(mut self, tag: impl Into<String>) -> Self {
        self.wrapper_tag = tag.into();
        self
    }

    pub fn with_wrapper_mold(mut self, mold_id: impl Into<String>) -> Self {
        self.wrapper_mold_id = mold_id.into();
        self
    }

    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    pub fn with_required_template_name(mut self, name: impl Into<String>) -> Self {
        self.required_template_name = name.into();
        self
    }

    /// Parse YAML, filling missing fields with defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, NunjaError> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| NunjaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NunjaError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| NunjaError::io(path.display().to_string(), &e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), NunjaError> {
        if !TAG_RE.is_match(&self.wrapper_tag) {
            return Err(NunjaError::Config(format!(
                "wrapper_tag '{}' is not a valid tag name",
                self.wrapper_tag
            )));
        }
        let name = &self.required_template_name;
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(NunjaError::Config(format!(
                "required_template_name '{name}' must be a plain filename"
            )));
        }
        if self.event_log_capacity == 0 {
            return Err(NunjaError::Config(
                "event_log_capacity must be at least 1".to_string(),
            ));
        }
        crate::registry::parse_mold_id(&self.wrapper_mold_id)?;
        Ok(())
    }

    /// Whether the built-in wrapper template can serve this config
    pub fn uses_builtin_wrapper(&self) -> bool {
        self.wrapper_mold_id == DEFAULT_WRAPPER_NAME
    }
}
