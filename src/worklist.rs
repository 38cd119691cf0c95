//! Work items and the per-stage worklist persisted between runs.
//!
//! A [`Worklist`] is a JSON object `{ id: payload }`. Ids name the physical
//! artifact (a source path, or a UUID bound to one source file) so that the
//! ledger of an earlier run can be matched against a regenerated list.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// One unit of work: a stable id plus a payload the core never inspects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem<P> {
    pub id: String,
    pub payload: P,
}

/// Every id of one stage run mapped to its job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Worklist<P> {
    items: BTreeMap<String, P>,
}

impl<P> Default for Worklist<P> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<P> FromIterator<(String, P)> for Worklist<P> {
    fn from_iter<I: IntoIterator<Item = (String, P)>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<P> Worklist<P> {
    /// Adds an item. A repeated id replaces the earlier payload.
    pub fn insert(&mut self, id: impl Into<String>, payload: P) {
        self.items.insert(id.into(), payload);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&P> {
        self.items.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// The resume filter: drops every id already certified by the ledger.
    pub fn without_completed(self, completed: &HashSet<String>) -> Self {
        Self {
            items: self
                .items
                .into_iter()
                .filter(|(id, _)| !completed.contains(id))
                .collect(),
        }
    }

    /// Consumes the list in id order.
    pub fn into_items(self) -> impl Iterator<Item = WorkItem<P>> {
        self.items
            .into_iter()
            .map(|(id, payload)| WorkItem { id, payload })
    }
}

impl<P: Serialize + DeserializeOwned> Worklist<P> {
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        if !path.is_file() {
            return Err(BatchError::MissingInput(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes through a sibling temp file and a rename, so a crash never leaves
    /// a half-written worklist behind.
    pub fn save(&self, path: &Path) -> Result<(), BatchError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads the persisted list, or runs `generate` and persists its result
    /// when none exists yet. Regeneration is skipped on later runs so ids stay stable.
    pub fn load_or_generate<F>(path: &Path, generate: F) -> anyhow::Result<Self>
    where
        F: FnOnce() -> anyhow::Result<Self>,
    {
        if path.is_file() {
            let list = Self::load(path)?;
            tracing::info!(path = %path.display(), items = list.len(), "loaded worklist");
            return Ok(list);
        }

        tracing::info!(path = %path.display(), "worklist not found, generating");
        let list = generate()?;
        list.save(path)?;
        tracing::info!(items = list.len(), "wrote worklist");
        Ok(list)
    }
}
