//! Compiled templates backed by minijinja
//!
//! - HTML autoescaping is forced on for every template regardless of name
//! - `{% include %}` resolves other mold paths through the loader's
//!   resident sources
//! - Compiled templates are immutable and shared behind `Arc`

use std::collections::BTreeMap;

use minijinja::{AutoEscape, Environment, Error, ErrorKind, Value};
use serde_json::Value as JsonValue;

use crate::config::MARKER_ATTRIBUTE;
use crate::dom::escape_attribute;
use crate::error::NunjaError;
use crate::loader::Loader;

/// Injected into every render: the marker attribute string for the mold
pub const NUNJA_DATA_KEY: &str = "_nunja_data_";
/// Injected by `execute`: the inner rendered markup
pub const TEMPLATE_KEY: &str = "_template_";
/// Injected by `execute`: the container tag name
pub const WRAPPER_TAG_KEY: &str = "_wrapper_tag_";

/// Render-ready form of a template source
pub struct CompiledTemplate {
    name: String,
    env: Environment<'static>,
}

fn base_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::Html);
    env
}

impl CompiledTemplate {
    /// Compile a standalone template (includes are not resolvable)
    pub fn compile(name: &str, source: &str) -> Result<Self, NunjaError> {
        Self::build(base_env(), name, source)
    }

    /// Compile a template whose includes resolve through `loader`
    pub fn compile_with_loader(
        name: &str,
        source: &str,
        loader: &Loader,
    ) -> Result<Self, NunjaError> {
        let mut env = base_env();
        let loader = loader.clone();
        env.set_loader(move |include| match loader.get_source(include) {
            Ok(found) => Ok(Some(found.source.to_string())),
            Err(NunjaError::NotResident { .. } | NunjaError::Resolution { .. }) => Ok(None),
            Err(e) => Err(Error::new(ErrorKind::InvalidOperation, e.to_string())),
        });
        Self::build(env, name, source)
    }

    fn build(mut env: Environment<'static>, name: &str, source: &str) -> Result<Self, NunjaError> {
        env.add_template_owned(name.to_string(), source.to_string())
            .map_err(|e| NunjaError::Compile {
                name: name.to_string(),
                details: e.to_string(),
            })?;
        Ok(Self {
            name: name.to_string(),
            env,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, ctx: Value) -> Result<String, NunjaError> {
        let render_err = |e: Error| NunjaError::Render {
            name: self.name.clone(),
            details: e.to_string(),
        };
        self.env
            .get_template(&self.name)
            .map_err(render_err)?
            .render(ctx)
            .map_err(render_err)
    }
}

impl std::fmt::Debug for CompiledTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTemplate")
            .field("name", &self.name)
            .finish()
    }
}

/// `data-nunja="<mold_id>"`, attribute-escaped
pub fn marker_attribute(mold_id: &str) -> String {
    format!("{}=\"{}\"", MARKER_ATTRIBUTE, escape_attribute(mold_id))
}

/// Turn a JSON data record into template variables. `null` is an empty record.
pub(crate) fn data_context(
    mold_id: &str,
    data: &JsonValue,
) -> Result<BTreeMap<String, Value>, NunjaError> {
    match data {
        JsonValue::Null => Ok(BTreeMap::new()),
        JsonValue::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_serialize(v)))
            .collect()),
        other => Err(NunjaError::InvalidData {
            mold_id: mold_id.to_string(),
            found: json_kind(other).to_string(),
        }),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
