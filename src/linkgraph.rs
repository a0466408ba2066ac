//! # Link Graph
//!
//! Persistent name graph for containers, stored with redb.
//!
//! Every container has a top-level path (its name, e.g. `/web`). A link
//! from `web` to `db` under the alias `database` is the child path
//! `/web/database` pointing at the `db` container's ID:
//!
//! ```text
//! /web            → 3f1c…   (container name)
//! /web/database   → 9a0e…   (link from web to db)
//! /db             → 9a0e…   (container name)
//! ```
//!
//! Paths are unique, which makes the graph the source of truth for name
//! uniqueness: [`LinkGraph::set`] inserts inside a single write
//! transaction and fails with [`Error::NonUniqueName`] if the path is taken.

use crate::error::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use tracing::debug;

/// Table mapping full paths to container IDs.
const EDGES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("edges");

fn db_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::LinkGraph(format!("{}: {}", context, e))
}

/// Splits `/web/db` into (`/web`, `db`).
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

fn is_below(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Name graph over container IDs.
pub struct LinkGraph {
    db: Database,
}

impl std::fmt::Debug for LinkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkGraph").finish_non_exhaustive()
    }
}

impl LinkGraph {
    /// Opens (or creates) the graph at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err("failed to open link graph"))?;

        let txn = db.begin_write().map_err(db_err("failed to begin write"))?;
        txn.open_table(EDGES_TABLE)
            .map_err(db_err("failed to create edges table"))?;
        txn.commit().map_err(db_err("failed to commit"))?;

        debug!("opened link graph at {}", path.display());
        Ok(Self { db })
    }

    /// Maps `path` to `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::NonUniqueName`] if `path` is already taken
    /// - [`Error::LinkGraph`] if the parent path does not exist
    pub fn set(&self, path: &str, id: &str) -> Result<()> {
        if !path.starts_with('/') || path.len() < 2 {
            return Err(Error::LinkGraph(format!("invalid path '{}'", path)));
        }
        let (parent, _) = split_path(path);

        let txn = self.db.begin_write().map_err(db_err("failed to begin write"))?;
        {
            let mut table = txn
                .open_table(EDGES_TABLE)
                .map_err(db_err("failed to open edges table"))?;
            if table.get(path).map_err(db_err("failed to read edge"))?.is_some() {
                return Err(Error::NonUniqueName(path.to_string()));
            }
            if parent != "/" && table.get(parent).map_err(db_err("failed to read edge"))?.is_none() {
                return Err(Error::LinkGraph(format!(
                    "cannot create {}: parent {} does not exist",
                    path, parent
                )));
            }
            table
                .insert(path, id)
                .map_err(db_err("failed to insert edge"))?;
        }
        txn.commit().map_err(db_err("failed to commit"))?;
        Ok(())
    }

    /// ID at `path`, if any.
    pub fn get(&self, path: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read().map_err(db_err("failed to begin read"))?;
        let table = txn
            .open_table(EDGES_TABLE)
            .map_err(db_err("failed to open edges table"))?;
        Ok(table
            .get(path)
            .map_err(db_err("failed to read edge"))?
            .map(|v| v.value().to_string()))
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path)?.is_some())
    }

    /// Every `(path, id)` pair, sorted by path.
    pub fn paths(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read().map_err(db_err("failed to begin read"))?;
        let table = txn
            .open_table(EDGES_TABLE)
            .map_err(db_err("failed to open edges table"))?;
        let mut paths = Vec::new();
        for entry in table.iter().map_err(db_err("failed to iterate edges"))? {
            let (path, id) = entry.map_err(db_err("failed to read edge"))?;
            paths.push((path.value().to_string(), id.value().to_string()));
        }
        Ok(paths)
    }

    /// Removes paths (and everything below them) selected by `select`.
    fn remove_where(&self, select: impl Fn(&str, &str) -> bool) -> Result<usize> {
        let doomed: Vec<String> = self
            .paths()?
            .into_iter()
            .filter(|(path, id)| select(path, id))
            .map(|(path, _)| path)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let all = self.paths()?;
        let txn = self.db.begin_write().map_err(db_err("failed to begin write"))?;
        let mut removed = 0;
        {
            let mut table = txn
                .open_table(EDGES_TABLE)
                .map_err(db_err("failed to open edges table"))?;
            for (path, _) in &all {
                if doomed.iter().any(|d| d == path || is_below(path, d)) {
                    table
                        .remove(path.as_str())
                        .map_err(db_err("failed to remove edge"))?;
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(db_err("failed to commit"))?;
        Ok(removed)
    }

    /// Removes `path` and the links below it.
    pub fn delete(&self, path: &str) -> Result<()> {
        if self.remove_where(|p, _| p == path)? == 0 {
            return Err(Error::LinkGraph(format!("{} does not exist", path)));
        }
        Ok(())
    }

    /// Removes every path pointing at `id`. Returns how many went.
    pub fn purge(&self, id: &str) -> Result<usize> {
        self.remove_where(|_, target| target == id)
    }

    /// Direct children of `path` as `(path, id)`.
    pub fn children(&self, path: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .paths()?
            .into_iter()
            .filter(|(p, _)| is_below(p, path) && split_path(p).0 == path)
            .collect())
    }

    /// Paths of the entities linking to the entity at `path`.
    pub fn parents(&self, path: &str) -> Result<Vec<String>> {
        let Some(id) = self.get(path)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .ref_paths(&id)?
            .into_iter()
            .map(|p| split_path(&p).0.to_string())
            .filter(|parent| parent != "/")
            .collect())
    }

    /// Every path pointing at `id`.
    pub fn ref_paths(&self, id: &str) -> Result<Vec<String>> {
        Ok(self
            .paths()?
            .into_iter()
            .filter(|(_, target)| target == id)
            .map(|(path, _)| path)
            .collect())
    }
}
