//! Run-configuration database reader.
//!
//! The experiment configuration lives in a hierarchical key-value store (the
//! online ODB, or a snapshot saved alongside the run). The core only needs
//! read access; this reader is backed by a JSON document and resolves
//! `/`-separated paths such as `/dragon/coinc/variables/window`. A missing
//! path or a type mismatch reads as [`None`] and the caller's default
//! applies.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Read-only view of the run-configuration database.
#[derive(Debug, Clone, Default)]
pub struct Db {
    root: Value,
}

impl Db {
    /// Empty database; every read misses and wired defaults apply.
    #[must_use]
    pub fn empty() -> Self {
        Self { root: Value::Null }
    }

    /// Loads a JSON snapshot from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("error reading database snapshot at {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Parses a JSON snapshot held in memory.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(Self {
            root: serde_json::from_str(text).context("error parsing database snapshot")?,
        })
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.get(segment)?;
        }
        Some(node)
    }

    /// Reads a single value.
    #[must_use]
    pub fn read_value<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        serde_json::from_value(self.lookup(path)?.clone()).ok()
    }

    /// Reads up to `len` elements of an array.
    #[must_use]
    pub fn read_array<T: DeserializeOwned>(&self, path: &str, len: usize) -> Option<Vec<T>> {
        let items = self.lookup(path)?.as_array()?;
        let mut out = Vec::with_capacity(len.min(items.len()));
        for item in items.iter().take(len) {
            out.push(serde_json::from_value(item.clone()).ok()?);
        }
        Some(out)
    }
}
