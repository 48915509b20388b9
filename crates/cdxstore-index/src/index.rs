//! Per-collection capture index: streaming query, alias resolution and
//! atomic batched ingestion.

use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::debug;

use cdxstore_core::{decode_row, encode_key, encode_value, query_prefix, Capture};

use crate::access::AccessControl;
use crate::{Result, StoreError};

/// A named, isolated capture index backed by three sled trees.
pub struct Index {
    name: String,
    captures: sled::Tree,
    aliases: sled::Tree,
    access: Arc<AccessControl>,
    db: sled::Db,
}

impl Index {
    pub(crate) fn open(db: &sled::Db, name: &str) -> Result<Self> {
        let captures = db.open_tree(name.as_bytes())?;
        let aliases = db.open_tree(format!("{name}.alias").as_bytes())?;
        let access = Arc::new(AccessControl::open(db, name)?);
        Ok(Self {
            name: name.to_string(),
            captures,
            aliases,
            access,
            db: db.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collection's access-control store.
    pub fn access(&self) -> Arc<AccessControl> {
        self.access.clone()
    }

    /// All captures of `urlkey` in ascending `(timestamp, file, offset)`
    /// order. Aliases are resolved with exactly one hop before the scan.
    ///
    /// The returned iterator is lazy; dropping it early releases the
    /// underlying cursor.
    pub fn query(&self, urlkey: &str) -> Result<Query> {
        let effective = self.resolve_alias(urlkey)?;
        debug!(collection = %self.name, urlkey, effective = %effective, "query");
        Ok(Query {
            iter: self.captures.scan_prefix(query_prefix(&effective)),
        })
    }

    /// Resolve `urlkey` through the alias table. One hop only: the target
    /// of an alias is never itself re-resolved, which keeps lookups O(1)
    /// and makes cyclic alias data harmless. A self-loop counts as no
    /// alias.
    pub fn resolve_alias(&self, urlkey: &str) -> Result<String> {
        match self.aliases.get(urlkey.as_bytes())? {
            Some(target) => {
                let target = String::from_utf8(target.to_vec())
                    .map_err(|e| StoreError::Store(format!("alias target is not utf-8: {e}")))?;
                if target == urlkey {
                    Ok(urlkey.to_string())
                } else {
                    Ok(target)
                }
            }
            None => Ok(urlkey.to_string()),
        }
    }

    /// Stage a new atomic batch of writes against this collection.
    pub fn begin_update(&self) -> Batch {
        Batch {
            captures: self.captures.clone(),
            aliases: self.aliases.clone(),
            db: self.db.clone(),
            capture_writes: sled::Batch::default(),
            alias_writes: sled::Batch::default(),
            staged: 0,
        }
    }

    /// Best-effort record count for the collection details page.
    pub fn estimated_record_count(&self) -> usize {
        self.captures.len()
    }
}

/// Lazy query cursor. Finite, not restartable.
pub struct Query {
    iter: sled::Iter,
}

impl Iterator for Query {
    type Item = Result<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.iter.next()? {
            Ok((key, value)) => Some(decode_row(&key, &value).map_err(StoreError::from)),
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// In-memory staging area for one ingestion request.
///
/// Writes are invisible until `commit`, which applies captures and aliases
/// in one transaction and flushes before returning. Dropping a batch
/// without committing discards everything it staged.
pub struct Batch {
    captures: sled::Tree,
    aliases: sled::Tree,
    db: sled::Db,
    capture_writes: sled::Batch,
    alias_writes: sled::Batch,
    staged: usize,
}

impl Batch {
    /// Stage one capture. Re-staging the same primary key overwrites the
    /// earlier record.
    pub fn put_capture(&mut self, capture: &Capture) -> Result<()> {
        let key = encode_key(capture);
        let value = encode_value(capture)?;
        self.capture_writes.insert(key, value);
        self.staged += 1;
        Ok(())
    }

    /// Stage one alias redirect.
    pub fn put_alias(&mut self, alias_surt: &str, target_surt: &str) {
        self.alias_writes
            .insert(alias_surt.as_bytes(), target_surt.as_bytes());
        self.staged += 1;
    }

    /// Number of records staged so far.
    pub fn staged(&self) -> usize {
        self.staged
    }

    /// Atomically apply every staged write; durable before returning.
    /// Returns the number of records written.
    pub fn commit(self) -> Result<usize> {
        (&self.captures, &self.aliases)
            .transaction(|(captures, aliases)| {
                captures.apply_batch(&self.capture_writes)?;
                aliases.apply_batch(&self.alias_writes)?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|err| match err {
                TransactionError::Abort(()) => StoreError::Store("batch aborted".to_string()),
                TransactionError::Storage(e) => e.into(),
            })?;
        self.db.flush()?;
        Ok(self.staged)
    }
}
