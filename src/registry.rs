//! Mold registry
//!
//! Maps mold identifiers (`prefix/name`) to the location of their bundle.
//! Lookups are pure string transforms; only `register_directory` and the
//! template export touch the filesystem.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{DEFAULT_WRAPPER_NAME, TMPL_FN_EXT};
use crate::error::NunjaError;

static MOLD_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]+)/([A-Za-z0-9_.\-]+)$").expect("valid regex")
});

/// Split a mold id into `(prefix, basename)`
pub fn parse_mold_id(mold_id: &str) -> Result<(&str, &str), NunjaError> {
    let caps = MOLD_ID_RE
        .captures(mold_id)
        .ok_or_else(|| NunjaError::resolution(mold_id, "expected the form prefix/name"))?;
    let (Some(prefix), Some(basename)) = (caps.get(1), caps.get(2)) else {
        return Err(NunjaError::resolution(mold_id, "expected the form prefix/name"));
    };
    for part in [prefix.as_str(), basename.as_str()] {
        if part == "." || part == ".." {
            return Err(NunjaError::resolution(mold_id, "relative segments are not allowed"));
        }
    }
    Ok((prefix.as_str(), basename.as_str()))
}

fn join_location(base: &str, pieces: &[&str]) -> String {
    let mut path = base.trim_end_matches('/').to_string();
    for piece in pieces {
        path.push('/');
        path.push_str(piece);
    }
    path
}

fn basename(location: &str) -> Option<&str> {
    location
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct Registry {
    name: String,
    default_prefix: String,
    /// mold_id → bundle location
    molds: BTreeMap<String, String>,
    /// prefix → directory holding one mold per subdirectory
    prefixes: BTreeMap<String, String>,
}

impl Registry {
    /// Registry holding only the built-in wrapper mold
    pub fn new(name: impl Into<String>) -> Self {
        let mut molds = BTreeMap::new();
        molds.insert(
            DEFAULT_WRAPPER_NAME.to_string(),
            DEFAULT_WRAPPER_NAME.to_string(),
        );
        Self {
            name: name.into(),
            default_prefix: "_".to_string(),
            molds,
            prefixes: BTreeMap::new(),
        }
    }

    pub fn with_default_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.default_prefix = prefix.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Explicitly registered molds, sorted by id
    pub fn molds(&self) -> impl Iterator<Item = (&str, &str)> {
        self.molds.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Register a bundle location. Without an id the mold is named
    /// `<default_prefix>/<basename of location>`.
    pub fn register_mold(
        &mut self,
        location: &str,
        mold_id: Option<&str>,
    ) -> Result<String, NunjaError> {
        let base = basename(location)
            .ok_or_else(|| NunjaError::resolution(location, "location has no basename"))?;
        let mold_id = match mold_id {
            Some(id) => id.to_string(),
            None => format!("{}/{}", self.default_prefix, base),
        };

        if self.molds.contains_key(&mold_id) {
            return Err(NunjaError::DuplicateMold { mold_id });
        }

        let (_, mold_basename) = parse_mold_id(&mold_id)?;
        if mold_basename != base {
            return Err(NunjaError::resolution(
                &mold_id,
                format!("name does not match location basename '{base}'"),
            ));
        }

        self.molds.insert(mold_id.clone(), location.to_string());
        Ok(mold_id)
    }

    /// Lazy entry point: any `prefix/name` resolves to `dir/name`
    pub fn register_prefix(&mut self, prefix: &str, dir: &str) -> Result<(), NunjaError> {
        parse_mold_id(&format!("{prefix}/entry"))?;
        self.prefixes.insert(prefix.to_string(), dir.to_string());
        Ok(())
    }

    /// Register every immediate subdirectory of `dir` that carries the
    /// required template as `prefix/<subdir>`. Returns how many were added.
    pub fn register_directory(
        &mut self,
        dir: &Path,
        prefix: &str,
        required_template_name: &str,
    ) -> Result<usize, NunjaError> {
        if !dir.is_dir() {
            return Err(NunjaError::Io {
                path: dir.display().to_string(),
                details: "not a directory".to_string(),
            });
        }

        let mut count = 0;
        let entries = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir());

        for entry in entries {
            let target = entry.path();
            let name = entry.file_name().to_string_lossy();
            if !target.join(required_template_name).is_file() {
                debug!(path = %target.display(), "missing required {}", required_template_name);
                continue;
            }

            let mold_id = format!("{prefix}/{name}");
            let location = target.to_string_lossy();
            match self.register_mold(&location, Some(&mold_id)) {
                Ok(_) => count += 1,
                Err(NunjaError::DuplicateMold { .. }) => {
                    warn!(%mold_id, registry = %self.name, "already registered");
                }
                Err(e) => warn!(%mold_id, error = %e, "skipping mold"),
            }
        }

        info!(
            count,
            prefix,
            dir = %dir.display(),
            "registered molds"
        );
        Ok(count)
    }

    /// Location of a mold's bundle
    pub fn mold_id_to_path(&self, mold_id: &str) -> Result<String, NunjaError> {
        if let Some(location) = self.molds.get(mold_id) {
            return Ok(location.clone());
        }

        let (prefix, basename) = parse_mold_id(mold_id)?;
        match self.prefixes.get(prefix) {
            Some(dir) => Ok(join_location(dir, &[basename])),
            None => Err(NunjaError::resolution(mold_id, "mold is not registered")),
        }
    }

    /// Resolve `prefix/name[/sub/path]` to a resource path.
    pub fn lookup_path(&self, mold_path: &str) -> Result<String, NunjaError> {
        let fragments: Vec<&str> = mold_path.split('/').collect();
        if fragments.len() < 2 {
            return Err(NunjaError::resolution(mold_path, "expected the form prefix/name"));
        }

        let mut subpath = Vec::new();
        for piece in &fragments[2..] {
            if piece.contains('\\') || *piece == ".." {
                return Err(NunjaError::resolution(mold_path, "path escapes its mold"));
            }
            if !piece.is_empty() && *piece != "." {
                subpath.push(*piece);
            }
        }

        let mold_id = format!("{}/{}", fragments[0], fragments[1]);
        let base = self.mold_id_to_path(&mold_id)?;
        Ok(join_location(&base, &subpath))
    }

    /// Path of the required template of a mold
    pub fn template_path(
        &self,
        mold_id: &str,
        required_template_name: &str,
    ) -> Result<String, NunjaError> {
        parse_mold_id(mold_id)?;
        self.lookup_path(&format!("{mold_id}/{required_template_name}"))
    }

    /// Molds backed by a real location; the built-in wrapper has none
    fn located_molds(&self) -> impl Iterator<Item = (&String, &String)> {
        self.molds
            .iter()
            .filter(|(id, _)| id.as_str() != DEFAULT_WRAPPER_NAME)
    }

    /// `{"paths": {mold_id: location}}` for client-side loader config
    pub fn export_paths(&self) -> Value {
        let paths: BTreeMap<&String, &String> = self.located_molds().collect();
        json!({ "paths": paths })
    }

    /// `{"template_map": {mold_id: [relative template paths]}}`
    pub fn export_template_paths(&self) -> Value {
        let map: BTreeMap<&str, Vec<String>> = self
            .located_molds()
            .map(|(id, location)| (id.as_str(), template_files(Path::new(location))))
            .collect();
        json!({ "template_map": map })
    }
}

fn template_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(TMPL_FN_EXT))
        .filter_map(|e| {
            e.path().strip_prefix(root).ok().map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
        })
        .collect();
    files.sort();
    files
}
