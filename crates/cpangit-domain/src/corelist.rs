//! Core-perl module baseline.
//!
//! The resolver skips modules a configured perl already ships. The engine
//! carries no baseline data of its own; the host injects tables (typically
//! generated from Module::CoreList) and `corelist_perl_version` selects one.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Tables of `perl version -> module -> shipped version`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct CoreList {
    tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl CoreList {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse corelist tables")
    }

    pub fn insert(&mut self, perl_version: &str, module: &str, version: &str) {
        self.tables
            .entry(perl_version.to_string())
            .or_default()
            .insert(module.to_string(), version.to_string());
    }

    /// The version of `module` shipped with `perl_version`, if any.
    #[must_use]
    pub fn provides(&self, perl_version: &str, module: &str) -> Option<&str> {
        self.tables
            .get(perl_version)?
            .get(module)
            .map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
