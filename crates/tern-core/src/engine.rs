//! Locked DuckDB execution handle and dynamic result conversion.
//!
//! The engine forbids concurrent use of one connection from multiple
//! threads, so every handle wraps its connection in a mutex and every
//! operation holds that lock for the statement's full duration.

use std::sync::Arc;

use duckdb::types::{TimeUnit, Value};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// PostgreSQL result types the wire layer knows how to describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Bytea,
    Date,
    Time,
    Timestamp,
    Json,
    Oid,
}

impl PgType {
    /// Wire-protocol type OID.
    pub fn oid(self) -> i32 {
        match self {
            PgType::Bool => 16,
            PgType::Bytea => 17,
            PgType::Int8 => 20,
            PgType::Int2 => 21,
            PgType::Int4 => 23,
            PgType::Text => 25,
            PgType::Oid => 26,
            PgType::Json => 114,
            PgType::Float4 => 700,
            PgType::Float8 => 701,
            PgType::Date => 1082,
            PgType::Time => 1083,
            PgType::Timestamp => 1114,
            PgType::Numeric => 1700,
        }
    }

    /// Fixed byte width, or -1 for variable-length types.
    pub fn len(self) -> i16 {
        match self {
            PgType::Bool => 1,
            PgType::Int2 => 2,
            PgType::Int4 | PgType::Date | PgType::Float4 | PgType::Oid => 4,
            PgType::Int8 | PgType::Float8 | PgType::Time | PgType::Timestamp => 8,
            PgType::Text | PgType::Bytea | PgType::Json | PgType::Numeric => -1,
        }
    }

    pub fn from_oid(oid: i32) -> PgType {
        match oid {
            16 => PgType::Bool,
            17 => PgType::Bytea,
            20 => PgType::Int8,
            21 => PgType::Int2,
            23 => PgType::Int4,
            26 => PgType::Oid,
            114 | 3802 => PgType::Json,
            700 => PgType::Float4,
            701 => PgType::Float8,
            1082 => PgType::Date,
            1083 => PgType::Time,
            1114 | 1184 => PgType::Timestamp,
            1700 => PgType::Numeric,
            _ => PgType::Text,
        }
    }
}

/// One result column: name plus the type the wire layer will declare.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub pg_type: PgType,
}

impl Column {
    pub fn text(name: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            pg_type: PgType::Text,
        }
    }

    pub fn new(name: impl Into<String>, pg_type: PgType) -> Column {
        Column {
            name: name.into(),
            pg_type,
        }
    }
}

/// A fully materialized query result in text format.
///
/// `None` cells encode SQL NULL; everything else is the Postgres text
/// rendering of the value (booleans as `t`/`f`).
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rows_affected: usize,
    pub tag: Option<String>,
}

impl QueryOutput {
    pub fn empty(columns: Vec<Column>) -> QueryOutput {
        QueryOutput {
            columns,
            rows: Vec::new(),
            rows_affected: 0,
            tag: None,
        }
    }

    pub fn single(column: Column, value: &str) -> QueryOutput {
        QueryOutput {
            columns: vec![column],
            rows: vec![vec![Some(value.to_string())]],
            rows_affected: 0,
            tag: None,
        }
    }

    pub fn command(tag: &str) -> QueryOutput {
        QueryOutput {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: 0,
            tag: Some(tag.to_string()),
        }
    }

    /// The CommandComplete tag for this result.
    pub fn command_tag(&self) -> String {
        match &self.tag {
            Some(t) => t.clone(),
            None => format!("SELECT {}", self.rows.len()),
        }
    }
}

/// A session's handle to the backing engine.
///
/// Cloning shares the same underlying connection and lock; sibling
/// connections to a shared store hold distinct handles cloned from the
/// store root instead.
#[derive(Clone)]
pub struct EngineHandle {
    conn: Arc<Mutex<duckdb::Connection>>,
    database: String,
}

/// Statement verbs that return rows and must go through the query path.
fn returns_rows(sql: &str) -> bool {
    let verb = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        verb.as_str(),
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "DESCRIBE" | "PRAGMA" | "FROM" | "EXPLAIN"
            | "SUMMARIZE" | "CALL"
    )
}

/// CommandComplete tag for a non-row-returning statement.
fn command_tag_for(sql: &str, affected: usize) -> String {
    let verb = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match verb.as_str() {
        "INSERT" => format!("INSERT 0 {affected}"),
        "UPDATE" => format!("UPDATE {affected}"),
        "DELETE" => format!("DELETE {affected}"),
        "BEGIN" => "BEGIN".to_string(),
        "COMMIT" | "END" => "COMMIT".to_string(),
        "ROLLBACK" | "ABORT" => "ROLLBACK".to_string(),
        "" => "OK".to_string(),
        other => {
            // CREATE TABLE / DROP VIEW / ATTACH / SET ... echo the verb pair
            let second = sql
                .trim_start()
                .split_whitespace()
                .nth(1)
                .map(|w| w.to_ascii_uppercase())
                .unwrap_or_default();
            match other {
                "CREATE" | "DROP" | "ALTER" if !second.is_empty() => {
                    format!("{other} {second}")
                }
                _ => other.to_string(),
            }
        }
    }
}

fn value_to_pg_type(v: &Value) -> Option<PgType> {
    match v {
        Value::Null => None,
        Value::Boolean(_) => Some(PgType::Bool),
        Value::TinyInt(_) | Value::SmallInt(_) | Value::UTinyInt(_) => Some(PgType::Int2),
        Value::Int(_) | Value::USmallInt(_) => Some(PgType::Int4),
        Value::BigInt(_) | Value::UInt(_) => Some(PgType::Int8),
        Value::HugeInt(_) | Value::UBigInt(_) | Value::Decimal(_) => Some(PgType::Numeric),
        Value::Float(_) => Some(PgType::Float4),
        Value::Double(_) => Some(PgType::Float8),
        Value::Timestamp(_, _) => Some(PgType::Timestamp),
        Value::Date32(_) => Some(PgType::Date),
        Value::Time64(_, _) => Some(PgType::Time),
        Value::Blob(_) => Some(PgType::Bytea),
        _ => Some(PgType::Text),
    }
}

fn micros_of(unit: &TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

/// Postgres text rendering of an engine value. `None` is SQL NULL.
pub fn value_to_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::Boolean(b) => Some(if *b { "t" } else { "f" }.to_string()),
        Value::TinyInt(i) => Some(i.to_string()),
        Value::SmallInt(i) => Some(i.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::BigInt(i) => Some(i.to_string()),
        Value::HugeInt(i) => Some(i.to_string()),
        Value::UTinyInt(i) => Some(i.to_string()),
        Value::USmallInt(i) => Some(i.to_string()),
        Value::UInt(i) => Some(i.to_string()),
        Value::UBigInt(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(f) => Some(f.to_string()),
        Value::Decimal(d) => Some(d.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Enum(s) => Some(s.clone()),
        Value::Blob(b) => Some(format!("\\x{}", hex::encode(b))),
        Value::Date32(days) => {
            let base = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
            let date = base + chrono::Duration::days(*days as i64);
            Some(date.format("%Y-%m-%d").to_string())
        }
        Value::Time64(unit, v) => {
            let micros = micros_of(unit, *v);
            let secs = micros / 1_000_000;
            let sub = micros % 1_000_000;
            let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
            if sub == 0 {
                Some(format!("{h:02}:{m:02}:{s:02}"))
            } else {
                Some(format!("{h:02}:{m:02}:{s:02}.{sub:06}"))
            }
        }
        Value::Timestamp(unit, v) => {
            let micros = micros_of(unit, *v);
            chrono::DateTime::from_timestamp_micros(micros)
                .map(|dt| dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string())
        }
        Value::Interval {
            months,
            days,
            nanos,
        } => Some(format!(
            "{} mons {} days {} secs",
            months,
            days,
            nanos / 1_000_000_000
        )),
        other => Some(format!("{other:?}")),
    }
}

impl EngineHandle {
    pub fn new(conn: duckdb::Connection, database: &str) -> EngineHandle {
        EngineHandle {
            conn: Arc::new(Mutex::new(conn)),
            database: database.to_string(),
        }
    }

    /// Name of the store this handle routes to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Run a statement with positional parameters, materializing the
    /// result in text format.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryOutput> {
        let conn = self.conn.lock().await;
        run_statement(&conn, sql, params)
    }

    /// Run a multi-statement batch (DDL, metadata installs). No results.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql).map_err(Error::from)
    }

    /// Probe the column shape of a query without fetching rows.
    pub async fn describe(&self, sql: &str) -> Result<Vec<Column>> {
        let probe = format!(
            "SELECT * FROM ({}) AS __tern_describe LIMIT 0",
            sql.trim_end().trim_end_matches(';')
        );
        let out = self.execute(&probe, &[]).await?;
        Ok(out.columns)
    }

    /// Clone the underlying connection into an independent handle bound
    /// to the same store. Fails if the store itself has died.
    pub async fn try_clone(&self) -> Result<EngineHandle> {
        let conn = self.conn.lock().await;
        let cloned = conn.try_clone()?;
        Ok(EngineHandle::new(cloned, &self.database))
    }
}

/// Execute one statement on a locked connection.
///
/// Row-returning statements go through the query path so the column
/// shape is captured even for zero-row results; everything else uses
/// `execute` for the affected-row count.
pub(crate) fn run_statement(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[Value],
) -> Result<QueryOutput> {
    if returns_rows(sql) {
        let mut stmt = conn.prepare(sql)?;
        let mut raw: Vec<Vec<Value>> = Vec::new();
        {
            let mut rows = stmt.query(duckdb::params_from_iter(params.iter()))?;
            while let Some(row) = rows.next()? {
                let stref: &duckdb::Statement<'_> = row.as_ref();
                let n = stref.column_count();
                let mut cells = Vec::with_capacity(n);
                for i in 0..n {
                    cells.push(row.get::<_, Value>(i)?);
                }
                raw.push(cells);
            }
        }
        let names = stmt.column_names();
        let mut columns: Vec<Column> = names.iter().map(|n| Column::text(n.to_string())).collect();
        for row in &raw {
            for (i, cell) in row.iter().enumerate() {
                if i < columns.len() && columns[i].pg_type == PgType::Text {
                    if let Some(t) = value_to_pg_type(cell) {
                        columns[i].pg_type = t;
                    }
                }
            }
        }
        let rows: Vec<Vec<Option<String>>> = raw
            .iter()
            .map(|r| r.iter().map(value_to_text).collect())
            .collect();
        Ok(QueryOutput {
            columns,
            rows,
            rows_affected: 0,
            tag: None,
        })
    } else {
        let affected = conn.execute(sql, duckdb::params_from_iter(params.iter()))?;
        Ok(QueryOutput {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: affected,
            tag: Some(command_tag_for(sql, affected)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> EngineHandle {
        EngineHandle::new(duckdb::Connection::open_in_memory().unwrap(), "memory")
    }

    #[tokio::test]
    async fn test_select_one() {
        let h = handle();
        let out = h.execute("SELECT 1 AS x", &[]).await.unwrap();
        assert_eq!(out.columns.len(), 1);
        assert_eq!(out.columns[0].name, "x");
        assert_eq!(out.rows, vec![vec![Some("1".to_string())]]);
        assert_eq!(out.command_tag(), "SELECT 1");
    }

    #[tokio::test]
    async fn test_types_inferred() {
        let h = handle();
        let out = h
            .execute("SELECT true AS b, 1::BIGINT AS i, 1.5::DOUBLE AS f, 'x' AS s", &[])
            .await
            .unwrap();
        assert_eq!(out.columns[0].pg_type, PgType::Bool);
        assert_eq!(out.columns[1].pg_type, PgType::Int8);
        assert_eq!(out.columns[2].pg_type, PgType::Float8);
        assert_eq!(out.columns[3].pg_type, PgType::Text);
        assert_eq!(out.rows[0][0].as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_null_cells() {
        let h = handle();
        let out = h.execute("SELECT NULL AS n", &[]).await.unwrap();
        assert_eq!(out.rows[0][0], None);
    }

    #[tokio::test]
    async fn test_dml_tags() {
        let h = handle();
        h.execute_batch("CREATE TABLE t (a INTEGER)").await.unwrap();
        let out = h
            .execute("INSERT INTO t VALUES (1), (2)", &[])
            .await
            .unwrap();
        assert_eq!(out.command_tag(), "INSERT 0 2");
        let out = h.execute("UPDATE t SET a = 3", &[]).await.unwrap();
        assert_eq!(out.command_tag(), "UPDATE 2");
        let out = h.execute("DELETE FROM t", &[]).await.unwrap();
        assert_eq!(out.command_tag(), "DELETE 2");
    }

    #[tokio::test]
    async fn test_positional_params() {
        let h = handle();
        let out = h
            .execute(
                "SELECT $1::INTEGER + 1 AS n",
                &[Value::Int(41)],
            )
            .await
            .unwrap();
        assert_eq!(out.rows[0][0].as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_describe_zero_rows() {
        let h = handle();
        let cols = h.describe("SELECT 1 AS a, 'x' AS b").await.unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "a");
        assert_eq!(cols[1].name, "b");
    }

    #[tokio::test]
    async fn test_try_clone_shares_store() {
        let h = handle();
        h.execute_batch("CREATE TABLE shared (v INTEGER); INSERT INTO shared VALUES (7)")
            .await
            .unwrap();
        let h2 = h.try_clone().await.unwrap();
        let out = h2.execute("SELECT v FROM shared", &[]).await.unwrap();
        assert_eq!(out.rows[0][0].as_deref(), Some("7"));
    }
}
