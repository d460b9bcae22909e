//! External source attachment: persistence, replay, lazy attach, and
//! the derived catalog-exposure views.

use std::collections::HashSet;

use duckdb::types::Value;

use crate::engine::EngineHandle;
use crate::error::Result;

/// Source names DuckDB always reports that are not client attachments.
const INTERNAL_SOURCES: &[&str] = &["system", "temp", "memory"];

const METADATA_DDL: &str = "
CREATE TABLE IF NOT EXISTS tern_attachments (
    alias VARCHAR PRIMARY KEY,
    path VARCHAR NOT NULL,
    attached_at VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS tern_results (
    id VARCHAR PRIMARY KEY,
    source_sql VARCHAR NOT NULL,
    fingerprint VARCHAR NOT NULL,
    row_count BIGINT NOT NULL,
    column_count BIGINT NOT NULL,
    table_name VARCHAR NOT NULL,
    created_at VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS tern_jobs (
    id VARCHAR PRIMARY KEY,
    query VARCHAR NOT NULL,
    state VARCHAR NOT NULL,
    error VARCHAR,
    analysis VARCHAR,
    started_at VARCHAR NOT NULL,
    finished_at VARCHAR
);
";

/// Install the metadata tables a session depends on.
pub async fn install_metadata(engine: &EngineHandle) -> Result<()> {
    engine.execute_batch(METADATA_DDL).await
}

/// Record a replayable attachment.
pub async fn record(engine: &EngineHandle, alias: &str, path: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    engine
        .execute(
            "INSERT OR REPLACE INTO tern_attachments (alias, path, attached_at) VALUES ($1, $2, $3)",
            &[
                Value::Text(alias.to_string()),
                Value::Text(path.to_string()),
                Value::Text(now),
            ],
        )
        .await?;
    Ok(())
}

pub async fn remove(engine: &EngineHandle, alias: &str) -> Result<()> {
    engine
        .execute(
            "DELETE FROM tern_attachments WHERE alias = $1",
            &[Value::Text(alias.to_string())],
        )
        .await?;
    Ok(())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Re-issue recorded attachments so a reconnecting client sees the same
/// sources as before a restart. Rows whose replay fails (source gone)
/// are deleted rather than retried forever. Returns the aliases that
/// are attached afterwards.
pub async fn replay(engine: &EngineHandle) -> Vec<String> {
    let recorded = match engine
        .execute("SELECT alias, path FROM tern_attachments", &[])
        .await
    {
        Ok(out) => out.rows,
        Err(e) => {
            tracing::warn!(error = %e, "could not read attachment metadata");
            return Vec::new();
        }
    };

    let already: HashSet<String> = attached_sources(engine).await.into_iter().collect();
    let mut attached = Vec::new();
    for row in recorded {
        let (Some(alias), Some(path)) = (row[0].clone(), row[1].clone()) else {
            continue;
        };
        if already.contains(&alias) {
            attached.push(alias);
            continue;
        }
        let sql = format!(
            "ATTACH {} AS {}",
            quote_literal(&path),
            quote_ident(&alias)
        );
        match engine.execute(&sql, &[]).await {
            Ok(_) => {
                tracing::debug!(alias = %alias, path = %path, "replayed attachment");
                attached.push(alias);
            }
            Err(e) => {
                tracing::warn!(alias = %alias, path = %path, error = %e, "attachment replay failed, dropping record");
                let _ = remove(engine, &alias).await;
            }
        }
    }
    attached
}

/// Currently attached non-internal source names.
pub async fn attached_sources(engine: &EngineHandle) -> Vec<String> {
    let out = match engine
        .execute(
            "SELECT database_name FROM duckdb_databases() WHERE NOT internal",
            &[],
        )
        .await
    {
        Ok(out) => out,
        Err(_) => return Vec::new(),
    };
    out.rows
        .into_iter()
        .filter_map(|r| r.into_iter().next().flatten())
        .filter(|name| {
            !INTERNAL_SOURCES.contains(&name.as_str()) && name != engine.database()
        })
        .collect()
}

/// Attach any recorded-but-not-yet-attached source whose alias appears
/// in the query text. Failures are non-fatal; the query will fail
/// naturally if the reference truly cannot resolve.
pub async fn lazy_attach(engine: &EngineHandle, masked_sql: &str) {
    let recorded = match engine
        .execute("SELECT alias, path FROM tern_attachments", &[])
        .await
    {
        Ok(out) => out.rows,
        Err(_) => return,
    };
    if recorded.is_empty() {
        return;
    }
    let attached: HashSet<String> = attached_sources(engine).await.into_iter().collect();
    let lower = masked_sql.to_ascii_lowercase();
    for row in recorded {
        let (Some(alias), Some(path)) = (row[0].clone(), row[1].clone()) else {
            continue;
        };
        if attached.contains(&alias) {
            continue;
        }
        if crate::shim::scanner::find_word(&lower, &alias.to_ascii_lowercase(), 0).is_none() {
            continue;
        }
        let sql = format!("ATTACH {} AS {}", quote_literal(&path), quote_ident(&alias));
        if let Err(e) = engine.execute(&sql, &[]).await {
            tracing::debug!(alias = %alias, error = %e, "lazy attach failed");
        }
    }
}

/// Rebuild the `<source>__<schema>` exposure views so Postgres clients
/// can browse attached data as ordinary schemas. Cheap to skip when the
/// attached-source set has not changed.
pub async fn refresh_exposure_views(
    engine: &EngineHandle,
    known: &mut HashSet<String>,
) -> Result<()> {
    let current: HashSet<String> = attached_sources(engine).await.into_iter().collect();
    if current == *known {
        return Ok(());
    }

    // Drop exposure schemas for sources no longer attached.
    let existing = engine
        .execute(
            "SELECT schema_name FROM duckdb_schemas() \
             WHERE database_name = current_database() AND schema_name LIKE '%\\_\\_%' ESCAPE '\\'",
            &[],
        )
        .await?;
    for row in existing.rows {
        let Some(schema) = row.into_iter().next().flatten() else {
            continue;
        };
        let source = schema.split("__").next().unwrap_or("");
        if !current.contains(source) {
            let drop = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(&schema));
            if let Err(e) = engine.execute(&drop, &[]).await {
                tracing::warn!(schema = %schema, error = %e, "could not drop stale exposure schema");
            }
        }
    }

    // Expose every relation of every attached source.
    for source in &current {
        let relations = engine
            .execute(
                "SELECT schema_name, table_name FROM duckdb_tables() WHERE database_name = $1 \
                 UNION ALL \
                 SELECT schema_name, view_name FROM duckdb_views() WHERE database_name = $1 AND NOT internal",
                &[Value::Text(source.clone())],
            )
            .await?;
        for row in relations.rows {
            let (Some(schema), Some(table)) = (row[0].clone(), row[1].clone()) else {
                continue;
            };
            let exposed = format!("{source}__{schema}");
            let ddl = format!(
                "CREATE SCHEMA IF NOT EXISTS {exposed_q}; \
                 CREATE OR REPLACE VIEW {exposed_q}.{table_q} AS SELECT * FROM {src_q}.{schema_q}.{table_q}",
                exposed_q = quote_ident(&exposed),
                table_q = quote_ident(&table),
                src_q = quote_ident(source),
                schema_q = quote_ident(&schema),
            );
            if let Err(e) = engine.execute_batch(&ddl).await {
                tracing::warn!(source = %source, table = %table, error = %e, "could not expose relation");
            }
        }
    }

    *known = current;
    Ok(())
}
