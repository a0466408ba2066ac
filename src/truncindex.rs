//! Prefix index over IDs.
//!
//! Lets users refer to images and containers by any unique prefix of their
//! ID, typically the 12-character short form.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::sync::RwLock;

/// Set of IDs searchable by prefix.
#[derive(Debug, Default)]
pub struct TruncIndex {
    ids: RwLock<BTreeSet<String>>,
}

impl TruncIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from existing IDs.
    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Result<Self> {
        let index = Self::new();
        for id in ids {
            index.add(&id)?;
        }
        Ok(index)
    }

    /// Adds an ID. Empty IDs and IDs with whitespace are rejected.
    pub fn add(&self, id: &str) -> Result<()> {
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(Error::InvalidContainerId {
                id: id.to_string(),
                reason: "illegal character in ID".to_string(),
            });
        }
        let mut ids = self
            .ids
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        if !ids.insert(id.to_string()) {
            return Err(Error::InvalidContainerId {
                id: id.to_string(),
                reason: "ID already indexed".to_string(),
            });
        }
        Ok(())
    }

    /// Removes an ID. Returns false if it was not indexed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut ids = self
            .ids
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(ids.remove(id))
    }

    /// Resolves a prefix to the single ID it identifies.
    ///
    /// Returns `Ok(None)` when nothing matches and
    /// [`Error::AmbiguousPrefix`] when more than one ID does.
    pub fn get(&self, prefix: &str) -> Result<Option<String>> {
        if prefix.is_empty() {
            return Ok(None);
        }
        let ids = self
            .ids
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;

        let mut matches = ids
            .range(prefix.to_string()..)
            .take_while(|id| id.starts_with(prefix));
        let first = matches.next().cloned();
        if matches.next().is_some() {
            return Err(Error::AmbiguousPrefix(prefix.to_string()));
        }
        Ok(first)
    }

    /// Snapshot of every indexed ID, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.ids
            .read()
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ids.read().map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_prefix_resolves() {
        let index = TruncIndex::from_ids(["abcdef".to_string(), "abd123".to_string()]).unwrap();
        assert_eq!(index.get("abc").unwrap(), Some("abcdef".to_string()));
        assert_eq!(index.get("abd123").unwrap(), Some("abd123".to_string()));
        assert_eq!(index.get("x").unwrap(), None);
    }

    #[test]
    fn test_ambiguous_prefix() {
        let index = TruncIndex::from_ids(["abcdef".to_string(), "abd123".to_string()]).unwrap();
        assert!(matches!(index.get("ab"), Err(Error::AmbiguousPrefix(_))));
    }

    #[test]
    fn test_add_rejects_bad_ids() {
        let index = TruncIndex::new();
        assert!(index.add("").is_err());
        assert!(index.add("has space").is_err());
        index.add("abc").unwrap();
        assert!(index.add("abc").is_err());
    }

    #[test]
    fn test_delete() {
        let index = TruncIndex::new();
        index.add("abc").unwrap();
        assert!(index.delete("abc").unwrap());
        assert!(!index.delete("abc").unwrap());
        assert_eq!(index.get("a").unwrap(), None);
    }
}
