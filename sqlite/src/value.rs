//! Parameter and row value types.

use std::sync::Arc;

use rusqlite::Row;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};

/// A value bound positionally to a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// SQL NULL.
    Null,
    /// Binary blob.
    Blob(Vec<u8>),
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<&[u8]> for Param {
    fn from(v: &[u8]) -> Self {
        Self::Blob(v.to_vec())
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Self::Integer(v) => ValueRef::Integer(*v),
            Self::Real(v) => ValueRef::Real(*v),
            Self::Text(v) => ValueRef::Text(v.as_bytes()),
            Self::Null => ValueRef::Null,
            Self::Blob(v) => ValueRef::Blob(v),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

/// Builds a `&[Param]` from heterogeneous values.
///
/// Usage: `params![42_i64, "title", None::<i64>]`
#[macro_export]
macro_rules! params {
    () => {{
        let empty: &[$crate::Param] = &[];
        empty
    }};
    ($($val:expr),+ $(,)?) => {
        &[$($crate::Param::from($val)),+][..]
    };
}

/// Read-only view of the current row, valid only inside a row callback.
pub struct RowView<'a, 'stmt> {
    row: &'a Row<'stmt>,
}

impl<'a, 'stmt> RowView<'a, 'stmt> {
    pub(crate) fn new(row: &'a Row<'stmt>) -> Self {
        Self { row }
    }

    /// Number of columns in the result set.
    pub fn column_count(&self) -> usize {
        self.row.as_ref().column_count()
    }

    /// Name of column `idx`.
    pub fn column_name(&self, idx: usize) -> Option<&str> {
        self.row.as_ref().column_name(idx).ok()
    }

    /// Returns `true` if column `idx` is NULL or out of range.
    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.row.get_ref(idx), Ok(ValueRef::Null) | Err(_))
    }

    /// Column `idx` as an integer, coercing reals and numeric text.
    pub fn integer(&self, idx: usize) -> Option<i64> {
        match self.row.get_ref(idx).ok()? {
            ValueRef::Integer(v) => Some(v),
            ValueRef::Real(v) => Some(v as i64),
            ValueRef::Text(v) => std::str::from_utf8(v).ok()?.trim().parse().ok(),
            ValueRef::Null | ValueRef::Blob(_) => None,
        }
    }

    /// Column `idx` as a float, coercing integers and numeric text.
    pub fn real(&self, idx: usize) -> Option<f64> {
        match self.row.get_ref(idx).ok()? {
            ValueRef::Integer(v) => Some(v as f64),
            ValueRef::Real(v) => Some(v),
            ValueRef::Text(v) => std::str::from_utf8(v).ok()?.trim().parse().ok(),
            ValueRef::Null | ValueRef::Blob(_) => None,
        }
    }

    /// Column `idx` rendered as text. NULL yields `None`.
    pub fn text(&self, idx: usize) -> Option<String> {
        match self.row.get_ref(idx).ok()? {
            ValueRef::Integer(v) => Some(v.to_string()),
            ValueRef::Real(v) => Some(v.to_string()),
            ValueRef::Text(v) | ValueRef::Blob(v) => Some(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Null => None,
        }
    }

    /// Column `idx` as an owned value.
    pub fn value(&self, idx: usize) -> Option<Value> {
        self.row.get_ref(idx).ok().map(Value::from)
    }
}

/// An owned result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    pub(crate) fn from_row(row: &Row<'_>, columns: &Arc<[String]>) -> rusqlite::Result<Self> {
        let values = (0..columns.len())
            .map(|idx| row.get_ref(idx).map(Value::from))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self {
            columns: Arc::clone(columns),
            values,
        })
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` for a zero-column row.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names, shared by every row of the same query.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw value of column `idx`.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Raw value of the column called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    /// Column `idx` as an integer. Reals are truncated.
    pub fn integer(&self, idx: usize) -> Option<i64> {
        match self.get(idx)? {
            Value::Integer(v) => Some(*v),
            Value::Real(v) => Some(*v as i64),
            Value::Text(v) => v.trim().parse().ok(),
            Value::Null | Value::Blob(_) => None,
        }
    }

    /// Column `idx` as a float.
    pub fn real(&self, idx: usize) -> Option<f64> {
        match self.get(idx)? {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            Value::Text(v) => v.trim().parse().ok(),
            Value::Null | Value::Blob(_) => None,
        }
    }

    /// Column `idx` as text, if it holds text.
    pub fn text(&self, idx: usize) -> Option<&str> {
        match self.get(idx)? {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns `true` if column `idx` is NULL or out of range.
    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.get(idx), Some(Value::Null) | None)
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_param_conversions() {
        assert_eq!(Param::from(7_i64), Param::Integer(7));
        assert_eq!(Param::from(true), Param::Integer(1));
        assert_eq!(Param::from(0.5), Param::Real(0.5));
        assert_eq!(Param::from("x"), Param::Text("x".to_string()));
        assert_eq!(Param::from(None::<i64>), Param::Null);
        assert_eq!(Param::from(Some(3_i64)), Param::Integer(3));
        assert_eq!(Param::from(&[1_u8, 2][..]), Param::Blob(vec![1, 2]));
    }

    #[test]
    fn test_params_macro() {
        let params = crate::params![1_i64, "two", 3.0, None::<String>];
        assert_eq!(params.len(), 4);
        assert_eq!(params[3], Param::Null);
        assert!(crate::params![].is_empty());
    }

    #[test]
    fn test_params_bind_by_type() {
        let conn = Connection::open_in_memory().unwrap();
        let params = crate::params![42_i64, 1.5, "text", None::<i64>, vec![0_u8, 1]];
        let types: Vec<String> = conn
            .query_row(
                "SELECT typeof(?1), typeof(?2), typeof(?3), typeof(?4), typeof(?5)",
                rusqlite::params_from_iter(params.iter()),
                |row| (0..5).map(|i| row.get(i)).collect(),
            )
            .unwrap();
        assert_eq!(types, vec!["integer", "real", "text", "null", "blob"]);
    }

    #[test]
    fn test_record_accessors() {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn
            .prepare("SELECT 5 AS n, 2.5 AS r, 'hi' AS t, NULL AS z")
            .unwrap();
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let record = stmt
            .query_row([], |row| Record::from_row(row, &columns))
            .unwrap();

        assert_eq!(record.len(), 4);
        assert_eq!(record.columns(), &["n", "r", "t", "z"]);
        assert_eq!(record.integer(0), Some(5));
        assert_eq!(record.real(1), Some(2.5));
        assert_eq!(record.integer(1), Some(2));
        assert_eq!(record.text(2), Some("hi"));
        assert!(record.is_null(3));
        assert!(record.is_null(99));
        assert_eq!(record.get_by_name("t"), Some(&Value::Text("hi".to_string())));
    }

    #[test]
    fn test_row_view_coercions() {
        let conn = Connection::open_in_memory().unwrap();
        conn.query_row("SELECT '12', 3, NULL", [], |row| {
            let view = RowView::new(row);
            assert_eq!(view.column_count(), 3);
            assert_eq!(view.integer(0), Some(12));
            assert_eq!(view.text(1).as_deref(), Some("3"));
            assert_eq!(view.real(1), Some(3.0));
            assert!(view.is_null(2));
            assert_eq!(view.text(2), None);
            assert!(view.is_null(7));
            Ok(())
        })
        .unwrap();
    }
}
