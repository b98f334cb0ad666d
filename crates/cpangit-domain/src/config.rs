//! Per-branch configuration and per-dist metadata documents.
//!
//! Both live as JSON blobs inside the branch tree. Writes go through the
//! canonical encoder (sorted keys, pretty-printed) so byte-identical content
//! always yields byte-identical blobs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version::{combine, VersionReq};

/// Seconds before a mirror considers its package index stale.
pub const DEFAULT_PACKAGE_DETAILS_MAX_AGE: u64 = 86_400;

/// Branch configuration stored at `cpan_ingit.json`. Unknown keys are
/// ignored on read and not round-tripped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_import_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corelist_perl_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autofetch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_details_max_age: Option<u64>,
}

impl BranchConfig {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse branch config")
    }

    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self).context("failed to encode branch config")?;
        sort_json_value(&mut value);
        let mut bytes =
            serde_json::to_vec_pretty(&value).context("failed to encode branch config")?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Autofetch defaults on for branches with an upstream.
    #[must_use]
    pub fn autofetch_enabled(&self) -> bool {
        self.autofetch.unwrap_or(self.upstream_url.is_some())
    }

    #[must_use]
    pub fn package_details_max_age(&self) -> u64 {
        self.package_details_max_age
            .unwrap_or(DEFAULT_PACKAGE_DETAILS_MAX_AGE)
    }
}

/// Prereqs extracted from a distribution, stored next to it as
/// `<dist>.meta`. Absence of the document means "prereqs unknown".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistMeta {
    #[serde(default)]
    pub prereqs: Prereqs,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prereqs {
    #[serde(default, skip_serializing_if = "PhaseReqs::is_empty")]
    pub configure: PhaseReqs,
    #[serde(default, skip_serializing_if = "PhaseReqs::is_empty")]
    pub runtime: PhaseReqs,
    #[serde(default, skip_serializing_if = "PhaseReqs::is_empty")]
    pub test: PhaseReqs,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReqs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requires: BTreeMap<String, String>,
}

impl PhaseReqs {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requires.is_empty()
    }
}

impl DistMeta {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse dist metadata")
    }

    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self).context("failed to encode dist metadata")?;
        sort_json_value(&mut value);
        let mut bytes =
            serde_json::to_vec_pretty(&value).context("failed to encode dist metadata")?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Union of the `requires` mappings across the configure, runtime, and
    /// test phases. A module required by several phases gets its
    /// requirements combined.
    pub fn merged_requires(&self) -> Result<BTreeMap<String, VersionReq>> {
        let mut merged: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for phase in [
            &self.prereqs.configure,
            &self.prereqs.runtime,
            &self.prereqs.test,
        ] {
            for (module, spec) in &phase.requires {
                merged.entry(module.clone()).or_default().push(spec);
            }
        }
        let mut out = BTreeMap::new();
        for (module, specs) in merged {
            let req = combine(specs.iter().copied())
                .with_context(|| format!("conflicting prereqs for {module}"))?;
            out.insert(module, req);
        }
        Ok(out)
    }
}

/// Recursively sort object keys so encoding is deterministic.
pub fn sort_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, entry) in entries.iter_mut() {
                sort_json_value(entry);
            }
            map.extend(entries);
        }
        Value::Array(items) => {
            for item in items {
                sort_json_value(item);
            }
        }
        _ => {}
    }
}
