//! Storage layer for cdxstore.
//!
//! A `DataStore` owns one sled database under a data directory and hands out
//! per-collection `Index` handles. Logical column families map to sled
//! trees: `{name}` holds captures, `{name}.alias` alias redirects, and
//! `{name}.access.rules` / `{name}.access.policies` the access-control
//! tables. Collections are created lazily on first ingest or explicit
//! create and enumerated from the tree namespace on startup.

mod access;
mod filter;
mod index;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::info;

pub use access::{AccessControl, AccessFilter, AccessPolicy, AccessRule, DateRange, Period};
pub use filter::{CaptureFilter, FilterChain};
pub use index::{Batch, Index, Query};

use cdxstore_core::ParseError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed record: {source}")]
    Malformed {
        line: String,
        #[source]
        source: ParseError,
    },
    #[error("no such collection: {0}")]
    UnknownCollection(String),
    #[error("no such policy id: {0}")]
    UnknownPolicy(u64),
    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),
    #[error("storage error: {0}")]
    Store(String),
    #[error("access oracle unavailable: {0}")]
    OracleUnavailable(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Store(err.to_string())
    }
}

impl From<cdxstore_core::CodecError> for StoreError {
    fn from(err: cdxstore_core::CodecError) -> Self {
        StoreError::Store(err.to_string())
    }
}

/// Owner of the database handle and of all per-collection indexes.
///
/// The optional capture filter is fixed at construction and applied to
/// every query result of every index by the serving layer.
pub struct DataStore {
    db: sled::Db,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    filter: Option<Arc<dyn CaptureFilter>>,
    closed: AtomicBool,
}

impl DataStore {
    /// Open (creating if absent) the database directory and enumerate the
    /// collections already present.
    pub fn open(path: impl AsRef<Path>, filter: Option<Arc<dyn CaptureFilter>>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self {
            db,
            indexes: RwLock::new(HashMap::new()),
            filter,
            closed: AtomicBool::new(false),
        };
        for name in store.stored_collection_names() {
            store.index_or_create(&name)?;
        }
        info!(
            path = %path.as_ref().display(),
            collections = store.collections().len(),
            "data store opened"
        );
        Ok(store)
    }

    fn stored_collection_names(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|raw| String::from_utf8(raw.to_vec()).ok())
            .filter(|name| !name.starts_with("__") && !name.contains('.'))
            .collect()
    }

    /// Look up a collection, `None` if it does not exist.
    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes
            .read()
            .expect("index map lock")
            .get(name)
            .cloned()
    }

    /// Look up a collection, creating it on first use.
    pub fn index_or_create(&self, name: &str) -> Result<Arc<Index>> {
        if let Some(index) = self.index(name) {
            return Ok(index);
        }
        // Dots are reserved for the alias/access tree suffixes.
        if name.is_empty() || name.contains('.') || name.contains('/') {
            return Err(StoreError::InvalidCollectionName(name.to_string()));
        }
        let mut indexes = self.indexes.write().expect("index map lock");
        if let Some(index) = indexes.get(name) {
            return Ok(index.clone());
        }
        let index = Arc::new(Index::open(&self.db, name)?);
        indexes.insert(name.to_string(), index.clone());
        info!(collection = name, "collection opened");
        Ok(index)
    }

    /// Names of all known collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .indexes
            .read()
            .expect("index map lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The process-level capture filter, if one was configured.
    pub fn filter(&self) -> Option<Arc<dyn CaptureFilter>> {
        self.filter.clone()
    }

    /// Flush outstanding writes and mark the store closed. Idempotent;
    /// handles are released when the store is dropped.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush()?;
        info!("data store closed");
        Ok(())
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn collections_are_created_lazily_and_listed() {
        let tmp = TempDir::new().unwrap();
        let store = DataStore::open(tmp.path(), None).unwrap();
        assert!(store.collections().is_empty());
        assert!(store.index("web").is_none());

        store.index_or_create("web").unwrap();
        store.index_or_create("news").unwrap();
        assert_eq!(store.collections(), vec!["news", "web"]);
        assert!(store.index("web").is_some());
    }

    #[test]
    fn collections_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = DataStore::open(tmp.path(), None).unwrap();
            store.index_or_create("web").unwrap();
            store.close().unwrap();
        }
        let store = DataStore::open(tmp.path(), None).unwrap();
        assert_eq!(store.collections(), vec!["web"]);
    }

    #[test]
    fn reserved_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = DataStore::open(tmp.path(), None).unwrap();
        for name in ["", "web.alias", "a/b"] {
            assert!(matches!(
                store.index_or_create(name),
                Err(StoreError::InvalidCollectionName(_))
            ));
        }
    }

    #[test]
    fn close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = DataStore::open(tmp.path(), None).unwrap();
        store.close().unwrap();
        store.close().unwrap();
    }
}
