//! Prepared statement cache keyed by exact SQL text.
//!
//! The compiled statements themselves live in rusqlite's per-connection LRU
//! ([`Connection::prepare_cached`]); this cache hands out a stable identity
//! per SQL string so callers can tell whether a statement was reused. No
//! normalization is applied: `"SELECT 1"` and `"select 1"` are different
//! keys.
//!
//! Both maps hold at most `capacity` entries. When a new SQL string would
//! exceed it, the least recently used identity is dropped, matching what
//! rusqlite's LRU does with the compiled statement.
//!
//! The cache is only touched while the store lock is held, so it needs no
//! lock of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;
use tracing::debug;

/// Identity of a cached prepared statement.
#[derive(Debug)]
pub struct PreparedStatement {
    id: u64,
    sql: String,
    parameter_count: usize,
    column_names: Vec<String>,
    hits: AtomicU64,
}

impl PreparedStatement {
    /// Identifier unique for the lifetime of the cache. A statement
    /// recreated after [`StatementCache::release`] gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of `?` placeholders.
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Result column names; empty for statements that return no rows.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Times this entry was returned from the cache instead of prepared.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Capacity used by [`StatementCache::new`].
pub(crate) const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Entry {
    statement: Arc<PreparedStatement>,
    last_used: u64,
}

/// Map from SQL text to its live prepared statement.
#[derive(Debug)]
pub struct StatementCache {
    entries: HashMap<String, Entry>,
    capacity: usize,
    next_id: u64,
    clock: u64,
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl StatementCache {
    /// Creates an empty cache holding up to [`DEFAULT_CAPACITY`] statements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache holding up to `capacity` statements (at least
    /// one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            next_id: 0,
            clock: 0,
        }
    }

    /// Returns the cached statement for `sql`, preparing it on first use.
    ///
    /// # Errors
    ///
    /// Returns the engine error if `sql` does not compile. Nothing is
    /// inserted in that case.
    pub fn get_or_create(
        &mut self,
        conn: &Connection,
        sql: &str,
    ) -> rusqlite::Result<Arc<PreparedStatement>> {
        self.clock += 1;
        if let Some(entry) = self.entries.get_mut(sql) {
            entry.last_used = self.clock;
            entry.statement.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&entry.statement));
        }

        let stmt = conn.prepare_cached(sql)?;
        let entry = Arc::new(PreparedStatement {
            id: self.next_id,
            sql: sql.to_string(),
            parameter_count: stmt.parameter_count(),
            column_names: stmt.column_names().into_iter().map(String::from).collect(),
            hits: AtomicU64::new(0),
        });
        drop(stmt);

        self.next_id += 1;
        if self.entries.len() >= self.capacity {
            self.evict_least_recent();
        }
        self.entries.insert(
            sql.to_string(),
            Entry {
                statement: Arc::clone(&entry),
                last_used: self.clock,
            },
        );
        debug!(id = entry.id, sql, "prepared statement cached");
        Ok(entry)
    }

    /// Returns the cached statement for `sql` without preparing it.
    pub fn get(&self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.entries.get(sql).map(|e| Arc::clone(&e.statement))
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(sql, _)| sql.clone());
        if let Some(sql) = oldest {
            self.entries.remove(&sql);
            debug!(sql = %sql, "prepared statement evicted");
        }
    }

    /// Finalizes and removes the entry for `sql`. Unknown keys are a no-op.
    ///
    /// Returns `true` if an entry was removed. rusqlite cannot evict a single
    /// compiled statement, so every idle compiled statement is finalized;
    /// the others are recompiled lazily on their next use.
    pub fn release(&mut self, conn: &Connection, sql: &str) -> bool {
        if self.entries.remove(sql).is_none() {
            return false;
        }
        conn.flush_prepared_statement_cache();
        debug!(sql, "prepared statement released");
        true
    }

    /// Finalizes and removes every entry.
    pub fn clear(&mut self, conn: &Connection) {
        let count = self.entries.len();
        self.entries.clear();
        conn.flush_prepared_statement_cache();
        if count > 0 {
            debug!(count, "statement cache cleared");
        }
    }

    /// Number of cached statements.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
