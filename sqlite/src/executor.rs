//! Statement execution against the open connection.
//!
//! A [`QueryExecutor`] borrows the connection, the statement cache and the
//! query counters for the duration of one locked operation. Every public
//! entry point counts exactly one query, whether it succeeds or fails.
//!
//! While a write block is set, the row-returning entry points refuse any
//! statement that is not read-only, so a write cannot slip through as a
//! query.

use std::sync::Arc;

use rusqlite::types::ToSql;
use rusqlite::{Connection, Rows, Statement};
use tracing::warn;

use crate::cache::{PreparedStatement, StatementCache};
use crate::error::{Result, StoreError};
use crate::stats::QueryStats;
use crate::value::{Param, Record, RowView};

/// Runs statements on one connection, reusing cached prepared statements.
pub struct QueryExecutor<'a> {
    conn: &'a Connection,
    cache: &'a mut StatementCache,
    stats: &'a QueryStats,
    write_block: Option<&'a str>,
}

impl<'a> QueryExecutor<'a> {
    /// Wraps a connection, its statement cache and the counters to update.
    pub fn new(conn: &'a Connection, cache: &'a mut StatementCache, stats: &'a QueryStats) -> Self {
        Self {
            conn,
            cache,
            stats,
            write_block: None,
        }
    }

    /// Refuses writing statements on the query paths with `report`.
    pub fn with_write_block(mut self, report: Option<&'a str>) -> Self {
        self.write_block = report;
        self
    }

    /// The underlying connection.
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// Runs one or more statements with no parameters and no result rows.
    ///
    /// Used for DDL, pragmas and unconditional writes. Multi-statement text
    /// is accepted and is not cached.
    pub fn execute(&mut self, sql: &str) -> Result<()> {
        let result = self.conn.execute_batch(sql).map_err(StoreError::from);
        self.counted(sql, result)
    }

    /// Runs one statement with typed positional parameters.
    ///
    /// Placeholders without a matching parameter bind as NULL; extra
    /// parameters are an error.
    pub fn execute_params(&mut self, sql: &str, params: &[Param]) -> Result<()> {
        let result = self.step_once(sql, params).map_err(StoreError::from);
        self.counted(sql, result)
    }

    /// Runs one statement with every parameter bound as text.
    ///
    /// Integers and reals pass through text; column affinity decides what
    /// is stored. Kept for callers that depend on that coercion, new code
    /// should use [`execute_params`](Self::execute_params).
    pub fn execute_text<S: AsRef<str>>(&mut self, sql: &str, params: &[S]) -> Result<()> {
        let result = self
            .step_once(sql, params.iter().map(|p| -> &str { p.as_ref() }))
            .map_err(StoreError::from);
        self.counted(sql, result)
    }

    /// Streams result rows into `f` until it returns `false` or rows run out.
    ///
    /// Stopping early is not a failure. Returns the number of rows handed to
    /// `f`.
    pub fn for_each_row<F>(&mut self, sql: &str, f: F) -> Result<usize>
    where
        F: FnMut(&RowView<'_, '_>) -> bool,
    {
        self.refuse_writes(sql)?;
        let result = self.visit_rows(sql, f).map_err(StoreError::from);
        self.counted(sql, result)
    }

    /// Runs a query and hands `f` an iterator over its rows.
    ///
    /// `f` may stop pulling rows at any point. An engine error while
    /// stepping ends the iterator and is returned instead of `f`'s result.
    pub fn query_with<R, F>(&mut self, sql: &str, params: &[Param], f: F) -> Result<R>
    where
        F: FnOnce(&mut RowIter<'_>) -> R,
    {
        self.refuse_writes(sql)?;
        let result = self.run_query(sql, params, f).map_err(StoreError::from);
        self.counted(sql, result)
    }

    /// Runs a query and collects every row.
    pub fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Record>> {
        self.query_with(sql, params, |rows| rows.collect())
    }

    /// Returns the cached statement for `sql`, preparing it on first use.
    ///
    /// Preparing alone is not counted as a query.
    pub fn prepare(&mut self, sql: &str) -> Result<Arc<PreparedStatement>> {
        Ok(self.cache.get_or_create(self.conn, sql)?)
    }

    /// Counts `result` as one query and logs failures.
    pub(crate) fn counted<T>(&self, sql: &str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.stats.record_success(),
            Err(e) => {
                self.stats.record_failure();
                warn!(code = e.code(), error = %e, sql, "query failed");
            }
        }
        result
    }

    /// Fails with the integrity report if a block is set and `sql` writes.
    ///
    /// Not counted. Text that does not compile passes through so the
    /// counted path reports the engine error.
    fn refuse_writes(&self, sql: &str) -> Result<()> {
        let Some(report) = self.write_block else {
            return Ok(());
        };
        match self.conn.prepare_cached(sql) {
            Ok(stmt) if !stmt.readonly() => {
                warn!(sql, "write refused: integrity check failed");
                Err(StoreError::Integrity(report.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn cached_statement(&mut self, sql: &str) -> rusqlite::Result<rusqlite::CachedStatement<'a>> {
        self.cache.get_or_create(self.conn, sql)?;
        self.conn.prepare_cached(sql)
    }

    fn step_once<P: ToSql>(
        &mut self,
        sql: &str,
        params: impl IntoIterator<Item = P>,
    ) -> rusqlite::Result<()> {
        let mut stmt = self.cached_statement(sql)?;
        bind(&mut stmt, params)?;
        let mut rows = stmt.raw_query();
        rows.next()?;
        Ok(())
    }

    fn visit_rows<F>(&mut self, sql: &str, mut f: F) -> rusqlite::Result<usize>
    where
        F: FnMut(&RowView<'_, '_>) -> bool,
    {
        let mut stmt = self.cached_statement(sql)?;
        let mut rows = stmt.raw_query();
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            visited += 1;
            if !f(&RowView::new(row)) {
                break;
            }
        }
        Ok(visited)
    }

    fn run_query<R, F>(&mut self, sql: &str, params: &[Param], f: F) -> rusqlite::Result<R>
    where
        F: FnOnce(&mut RowIter<'_>) -> R,
    {
        let mut stmt = self.cached_statement(sql)?;
        bind(&mut stmt, params)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let mut rows = RowIter {
            rows: stmt.raw_query(),
            columns,
            error: None,
        };
        let out = f(&mut rows);
        match rows.error.take() {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

fn bind<P: ToSql>(stmt: &mut Statement<'_>, params: impl IntoIterator<Item = P>) -> rusqlite::Result<()> {
    for (idx, param) in params.into_iter().enumerate() {
        stmt.raw_bind_parameter(idx + 1, param)?;
    }
    Ok(())
}

/// Finite iterator over the rows of one query.
///
/// Yields owned [`Record`]s, so rows may outlive the iteration. Dropping the
/// iterator early resets the statement; remaining rows are never read.
pub struct RowIter<'stmt> {
    rows: Rows<'stmt>,
    columns: Arc<[String]>,
    error: Option<rusqlite::Error>,
}

impl RowIter<'_> {
    /// Column names of the result set.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for RowIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.error.is_some() {
            return None;
        }
        let columns = &self.columns;
        let step = self
            .rows
            .next()
            .and_then(|row| row.map(|row| Record::from_row(row, columns)).transpose());
        match step {
            Ok(record) => record,
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, weight REAL);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_execute_counts_success_and_failure() {
        let conn = setup();
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        exec.execute("INSERT INTO items (name) VALUES ('a')").unwrap();
        assert!(exec.execute("INSERT INTO missing VALUES (1)").is_err());

        assert_eq!(stats.total(), 2);
        assert_eq!(stats.failed(), 1);
    }

    #[test]
    fn test_execute_params_binds_types() {
        let conn = setup();
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        exec.execute_params(
            "INSERT INTO items (id, name, weight) VALUES (?, ?, ?)",
            params![7_i64, "anvil", 12.5],
        )
        .unwrap();

        let kinds: (String, String) = conn
            .query_row("SELECT typeof(id), typeof(weight) FROM items", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(kinds, ("integer".to_string(), "real".to_string()));
    }

    #[test]
    fn test_execute_text_coerces_through_affinity() {
        let conn = setup();
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        exec.execute_text(
            "INSERT INTO items (id, name, weight) VALUES (?, ?, ?)",
            &["3", "feather", "0.1"],
        )
        .unwrap();

        let (id, weight): (i64, f64) = conn
            .query_row("SELECT id, weight FROM items", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(id, 3);
        assert_eq!(weight, 0.1);
    }

    #[test]
    fn test_unbound_placeholder_is_null_and_extra_param_fails() {
        let conn = setup();
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        exec.execute_params("INSERT INTO items (name, weight) VALUES (?, ?)", params!["a"])
            .unwrap();
        assert!(
            exec.execute_params("INSERT INTO items (name) VALUES (?)", params!["a", "b"])
                .is_err()
        );

        let weight: Option<f64> = conn
            .query_row("SELECT weight FROM items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(weight, None);
        assert_eq!(stats.failed(), 1);
    }

    #[test]
    fn test_for_each_row_stops_early_without_failure() {
        let conn = setup();
        for i in 0..10 {
            conn.execute("INSERT INTO items (name) VALUES (?1)", [format!("n{i}")])
                .unwrap();
        }
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        let mut seen = Vec::new();
        let visited = exec
            .for_each_row("SELECT id FROM items ORDER BY id", |row| {
                seen.push(row.integer(0).unwrap());
                false
            })
            .unwrap();

        assert_eq!(visited, 1);
        assert_eq!(seen, vec![1]);
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.failed(), 0);
    }

    #[test]
    fn test_query_with_take() {
        let conn = setup();
        for i in 0..5 {
            conn.execute("INSERT INTO items (name) VALUES (?1)", [format!("n{i}")])
                .unwrap();
        }
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        let names: Vec<String> = exec
            .query_with("SELECT name FROM items ORDER BY id", params![], |rows| {
                rows.take(2)
                    .filter_map(|r| r.text(0).map(String::from))
                    .collect()
            })
            .unwrap();
        assert_eq!(names, vec!["n0", "n1"]);

        // The statement is reusable after an early stop.
        let all = exec.query("SELECT name FROM items ORDER BY id", params![]).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(cache_len(&mut exec), 1);
    }

    fn cache_len(exec: &mut QueryExecutor<'_>) -> usize {
        exec.cache.len()
    }

    #[test]
    fn test_query_prepare_failure_counts() {
        let conn = setup();
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        assert!(exec.query("SELECT nope FROM items", params![]).is_err());
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.failed(), 1);
    }

    #[test]
    fn test_write_block_refuses_writes_on_query_paths() {
        let conn = setup();
        conn.execute_batch("INSERT INTO items (name) VALUES ('a')").unwrap();
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec =
            QueryExecutor::new(&conn, &mut cache, &stats).with_write_block(Some("bad page"));

        let err = exec.query("DELETE FROM items", params![]).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(ref r) if r == "bad page"));
        assert!(
            exec.for_each_row("INSERT INTO items (name) VALUES ('b')", |_| true)
                .is_err()
        );
        assert!(
            exec.query_with("UPDATE items SET name = 'z'", params![], |rows| rows.count())
                .is_err()
        );
        assert_eq!(stats.total(), 0);

        let rows = exec.query("SELECT name FROM items", params![]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text(0), Some("a"));
        // Bad SQL still reaches the counted path.
        assert!(exec.query("SELEC nope", params![]).is_err());
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.failed(), 1);
    }

    #[test]
    fn test_query_with_binds_params() {
        let conn = setup();
        conn.execute_batch("INSERT INTO items (name, weight) VALUES ('a', 1.0), ('b', 2.0), ('c', 3.0)")
            .unwrap();
        let mut cache = StatementCache::new();
        let stats = QueryStats::new();
        let mut exec = QueryExecutor::new(&conn, &mut cache, &stats);

        let heavy = exec
            .query("SELECT name FROM items WHERE weight >= ? ORDER BY name", params![2.0])
            .unwrap();
        let names: Vec<&str> = heavy.iter().filter_map(|r| r.text(0)).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(heavy[0].columns(), &["name"]);
    }
}
