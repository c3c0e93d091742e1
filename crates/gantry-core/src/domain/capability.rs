//! Capability facts: what the prober observed about the host.
//!
//! A [`CapabilityFacts`] store is assembled once from probe results and is
//! immutable afterwards. Share it with `Arc` and read it from any task.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known capability names used by the built-in checks and template.
pub const LANGUAGE_RUNTIME: &str = "language-runtime";
pub const CONTAINER_ENGINE: &str = "container-engine";
pub const PACKAGE_INDEX: &str = "package-index";

/// A single observation about the host environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityFact {
    /// Capability name (e.g. "container-engine").
    pub name: String,

    /// Whether any detection strategy succeeded.
    pub present: bool,

    /// Detected version, when the winning strategy reports one.
    pub version: Option<String>,

    /// Free-form detail: the path found, the strategy that won, or why
    /// detection failed.
    pub detail: Option<String>,
}

impl CapabilityFact {
    pub fn present(name: impl Into<String>, version: Option<String>, detail: Option<String>) -> Self {
        Self {
            name: name.into(),
            present: true,
            version,
            detail,
        }
    }

    pub fn absent(name: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            name: name.into(),
            present: false,
            version: None,
            detail,
        }
    }
}

/// Read-only mapping from capability name to fact.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityFacts {
    facts: BTreeMap<String, CapabilityFact>,
}

impl CapabilityFacts {
    /// Build the store. A later fact with the same name replaces an earlier one.
    pub fn from_facts<I>(facts: I) -> Self
    where
        I: IntoIterator<Item = CapabilityFact>,
    {
        Self {
            facts: facts.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityFact> {
        self.facts.get(name)
    }

    /// True only when the capability was probed and found. Unknown names
    /// count as absent.
    pub fn is_present(&self, name: &str) -> bool {
        self.facts.get(name).map(|f| f.present).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityFact> {
        self.facts.values()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}
