//! Auto-materialization: persist interesting query results into a
//! durable schema so slow or non-deterministic work survives a crash
//! ("query insurance"), discoverable later via `SHOW RESULTS`.

use duckdb::types::Value;
use sha2::{Digest, Sha256};

use crate::engine::{Column, EngineHandle, QueryOutput};
use crate::error::Result;

/// Schema holding materialized result tables.
const RESULT_SCHEMA: &str = "tern_saved";

/// Fixed column shape of `SHOW RESULTS`.
pub fn show_results_shape() -> Vec<Column> {
    vec![
        Column::text("id"),
        Column::text("table_name"),
        Column::text("fingerprint"),
        Column::new("row_count", crate::engine::PgType::Int8),
        Column::new("column_count", crate::engine::PgType::Int8),
        Column::text("created_at"),
    ]
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn fingerprint(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.trim().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Persist a result set if it qualifies: non-empty, under the row
/// ceiling, and with at least one column. Returns the result id.
///
/// Callers treat failures as non-fatal; the client-visible result is
/// never dropped because insurance could not be written.
pub async fn maybe_materialize(
    engine: &EngineHandle,
    sql: &str,
    output: &QueryOutput,
    row_ceiling: usize,
) -> Result<Option<String>> {
    if output.columns.is_empty() || output.rows.is_empty() || output.rows.len() > row_ceiling {
        return Ok(None);
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    let short = &id[..12];
    let table = format!("r_{short}");
    let qualified = format!("{}.{}", quote_ident(RESULT_SCHEMA), quote_ident(&table));

    let col_defs: Vec<String> = output
        .columns
        .iter()
        .map(|c| format!("{} VARCHAR", quote_ident(&c.name)))
        .collect();
    engine
        .execute_batch(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}; CREATE TABLE {qualified} ({})",
            quote_ident(RESULT_SCHEMA),
            col_defs.join(", ")
        ))
        .await?;

    let placeholders: Vec<String> = (1..=output.columns.len())
        .map(|i| format!("${i}"))
        .collect();
    let insert = format!("INSERT INTO {qualified} VALUES ({})", placeholders.join(", "));
    for row in &output.rows {
        let params: Vec<Value> = row
            .iter()
            .map(|cell| match cell {
                Some(v) => Value::Text(v.clone()),
                None => Value::Null,
            })
            .collect();
        engine.execute(&insert, &params).await?;
    }

    let now = chrono::Utc::now().to_rfc3339();
    engine
        .execute(
            "INSERT INTO tern_results (id, source_sql, fingerprint, row_count, column_count, table_name, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                Value::Text(short.to_string()),
                Value::Text(sql.to_string()),
                Value::Text(fingerprint(sql)),
                Value::BigInt(output.rows.len() as i64),
                Value::BigInt(output.columns.len() as i64),
                Value::Text(table.clone()),
                Value::Text(now),
            ],
        )
        .await?;
    tracing::debug!(id = %short, table = %table, rows = output.rows.len(), "materialized result");
    Ok(Some(short.to_string()))
}

/// `SHOW RESULTS` listing in its fixed shape.
pub async fn show_results(engine: &EngineHandle) -> Result<QueryOutput> {
    let out = engine
        .execute(
            "SELECT id, table_name, fingerprint, row_count, column_count, created_at \
             FROM tern_results ORDER BY created_at DESC",
            &[],
        )
        .await?;
    Ok(QueryOutput {
        columns: show_results_shape(),
        rows: out.rows,
        rows_affected: 0,
        tag: None,
    })
}

/// Persist an already-computed result under a client-chosen table name.
/// Used when the query cannot be re-run inside the engine (cascade
/// calls were evaluated out-of-band).
pub async fn save_output_as(
    engine: &EngineHandle,
    name: &str,
    output: &QueryOutput,
) -> Result<()> {
    let col_defs: Vec<String> = output
        .columns
        .iter()
        .map(|c| format!("{} VARCHAR", quote_ident(&c.name)))
        .collect();
    if col_defs.is_empty() {
        return Ok(());
    }
    let qualified = quote_ident(name);
    engine
        .execute_batch(&format!(
            "DROP TABLE IF EXISTS {qualified}; CREATE TABLE {qualified} ({})",
            col_defs.join(", ")
        ))
        .await?;
    let placeholders: Vec<String> = (1..=output.columns.len())
        .map(|i| format!("${i}"))
        .collect();
    let insert = format!("INSERT INTO {qualified} VALUES ({})", placeholders.join(", "));
    for row in &output.rows {
        let params: Vec<Value> = row
            .iter()
            .map(|cell| match cell {
                Some(v) => Value::Text(v.clone()),
                None => Value::Null,
            })
            .collect();
        engine.execute(&insert, &params).await?;
    }
    Ok(())
}

/// Apply a `save_as` hint: persist the query's result under a
/// client-chosen table name.
pub async fn save_as(engine: &EngineHandle, name: &str, sql: &str) -> Result<()> {
    let clean = sql.trim_end().trim_end_matches(';');
    let ddl = format!(
        "CREATE OR REPLACE TABLE {} AS {clean}",
        quote_ident(name)
    );
    engine.execute(&ddl, &[]).await?;
    Ok(())
}

/// Extract and strip a `/*+ save_as(name) */` hint from the query text.
pub fn extract_save_as_hint(sql: &str) -> (String, Option<String>) {
    static HINT: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"(?i)/\*\+\s*save_as\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)\s*\*/").unwrap()
    });
    match HINT.captures(sql) {
        Some(caps) => {
            let name = caps[1].to_string();
            let cleaned = HINT.replace(sql, "").to_string();
            (cleaned, Some(name))
        }
        None => (sql.to_string(), None),
    }
}
