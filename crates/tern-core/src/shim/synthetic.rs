//! Bespoke synthetic handlers for catalog query shapes too specific for
//! the generic rewrite pipeline: session identity functions, role/user
//! listings, timezone listings, and one client's object-browser UNION.

use std::sync::LazyLock;

use regex::Regex;

use crate::engine::{Column, EngineHandle, PgType, QueryOutput};
use crate::error::Result;

use super::registry;
use super::rewrite::ShimContext;
use super::{infer_select_columns, mentions_table};

static CURRENT_DATABASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+(?:pg_catalog\.)?current_database\s*\(\s*\)\s*;?\s*$").unwrap()
});

static CURRENT_SCHEMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+(?:pg_catalog\.)?current_schema(?:\s*\(\s*\))?\s*;?\s*$")
        .unwrap()
});

static CURRENT_SCHEMAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+(?:pg_catalog\.)?current_schemas\s*\(\s*(true|false)?\s*\)\s*;?\s*$")
        .unwrap()
});

static SESSION_USER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+(?:session_user|current_user|user)\s*;?\s*$").unwrap()
});

static VERSION_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+(?:pg_catalog\.)?version\s*\(\s*\)\s*;?\s*$").unwrap()
});

/// Version string reported by `SELECT version()`.
pub const VERSION_BANNER: &str = "PostgreSQL 16.3 (tern)";

/// Try to answer a catalog query without ever reaching the rewrite
/// pipeline. Returns `None` when no bespoke shape matches.
pub async fn try_answer(
    sql: &str,
    masked: &str,
    ctx: &ShimContext,
    engine: &EngineHandle,
) -> Option<Result<QueryOutput>> {
    if CURRENT_DATABASE.is_match(sql) {
        return Some(Ok(QueryOutput::single(
            Column::text("current_database"),
            &ctx.database,
        )));
    }
    if CURRENT_SCHEMA.is_match(sql) {
        return Some(Ok(QueryOutput::single(
            Column::text("current_schema"),
            "main",
        )));
    }
    if CURRENT_SCHEMAS.is_match(sql) {
        // Listings must always include the two implicit schemas.
        return Some(Ok(QueryOutput::single(
            Column::text("current_schemas"),
            "{main,pg_catalog}",
        )));
    }
    if SESSION_USER.is_match(sql) {
        return Some(Ok(QueryOutput::single(
            Column::text("current_user"),
            &ctx.user,
        )));
    }
    if VERSION_FN.is_match(sql) {
        return Some(Ok(QueryOutput::single(
            Column::text("version"),
            VERSION_BANNER,
        )));
    }
    if mentions_table(masked, "pg_roles") {
        return Some(Ok(role_listing(sql, masked, ctx, "pg_roles")));
    }
    if mentions_table(masked, "pg_user") || mentions_table(masked, "pg_shadow") {
        return Some(Ok(role_listing(sql, masked, ctx, "pg_user")));
    }
    if mentions_table(masked, "pg_timezone_names") {
        return Some(Ok(timezone_listing(sql, masked)));
    }
    if is_object_browser_union(masked) {
        return Some(object_browser(sql, masked, engine).await);
    }
    None
}

/// One synthesized row describing the session user as the only role.
/// pg_roles uses libpq's `t`/`f` booleans; pg_user keeps the
/// `true`/`false` spelling JDBC drivers expect.
fn role_listing(sql: &str, masked: &str, ctx: &ShimContext, table: &str) -> QueryOutput {
    let columns = infer_select_columns(sql, masked, &registry::default_columns(table));
    let truthy = if table == "pg_roles" { "t" } else { "true" };
    let falsy = if table == "pg_roles" { "f" } else { "false" };
    let row: Vec<Option<String>> = columns
        .iter()
        .map(|c| match c.name.as_str() {
            "rolname" | "usename" => Some(ctx.user.clone()),
            "oid" | "usesysid" => Some("10".to_string()),
            "rolconnlimit" => Some("-1".to_string()),
            "rolvaliduntil" | "valuntil" | "passwd" | "rolconfig" | "useconfig" => None,
            name if name.starts_with("rol") || name.starts_with("use") => {
                // Superuser-ish defaults; everything is permitted here.
                let granted = matches!(
                    name,
                    "rolsuper" | "rolinherit" | "rolcreaterole" | "rolcreatedb" | "rolcanlogin"
                        | "usesuper" | "usecreatedb"
                );
                Some(if granted { truthy } else { falsy }.to_string())
            }
            _ => None,
        })
        .collect();
    QueryOutput {
        columns,
        rows: vec![row],
        rows_affected: 0,
        tag: None,
    }
}

fn timezone_listing(sql: &str, masked: &str) -> QueryOutput {
    let columns = infer_select_columns(
        sql,
        masked,
        &registry::default_columns("pg_timezone_names"),
    );
    let zones = [
        ("UTC", "UTC", "00:00:00", "f"),
        ("GMT", "GMT", "00:00:00", "f"),
        ("localtime", "LMT", "00:00:00", "f"),
    ];
    let rows = zones
        .iter()
        .map(|(name, abbrev, offset, dst)| {
            columns
                .iter()
                .map(|c| match c.name.as_str() {
                    "name" => Some(name.to_string()),
                    "abbrev" => Some(abbrev.to_string()),
                    "utc_offset" => Some(offset.to_string()),
                    "is_dst" => Some(dst.to_string()),
                    _ => None,
                })
                .collect()
        })
        .collect();
    QueryOutput {
        columns,
        rows,
        rows_affected: 0,
        tag: None,
    }
}

/// The object-browser query one client issues: a multi-branch UNION over
/// pg_class filtered by relkind. The engine mishandles the UNION as
/// written, so the answer is assembled from the three real backing
/// sources and unioned in-process.
fn is_object_browser_union(masked: &str) -> bool {
    let upper = masked.to_ascii_uppercase();
    upper.contains("UNION") && upper.contains("PG_CLASS") && upper.contains("RELKIND")
}

async fn object_browser(
    sql: &str,
    masked: &str,
    engine: &EngineHandle,
) -> Result<QueryOutput> {
    let default = vec![
        Column::new("oid", PgType::Int8),
        Column::text("relname"),
        Column::text("nspname"),
        Column::text("relkind"),
    ];
    // Column shape comes from the first UNION branch's SELECT list.
    let columns = infer_select_columns(sql, masked, &default);

    let tables = engine
        .execute(
            "SELECT schema_name, table_name FROM duckdb_tables() WHERE NOT internal",
            &[],
        )
        .await?;
    let views = engine
        .execute(
            "SELECT schema_name, view_name FROM duckdb_views() WHERE NOT internal",
            &[],
        )
        .await?;
    let indexes = engine
        .execute(
            "SELECT schema_name, index_name FROM duckdb_indexes()",
            &[],
        )
        .await?;

    let mut rows: Vec<Vec<Option<String>>> = Vec::new();
    let mut oid = 16384i64;
    for (source, kind) in [(&tables, "r"), (&views, "v"), (&indexes, "i")] {
        for raw in &source.rows {
            let schema = raw.first().cloned().flatten().unwrap_or_default();
            let name = raw.get(1).cloned().flatten().unwrap_or_default();
            let row = columns
                .iter()
                .map(|c| match c.name.as_str() {
                    "oid" | "objid" => Some(oid.to_string()),
                    "relname" | "name" | "table_name" | "objname" => Some(name.clone()),
                    "nspname" | "schemaname" | "table_schema" | "schema_name" => {
                        Some(schema.clone())
                    }
                    "relkind" | "kind" | "type" => Some(kind.to_string()),
                    "relnamespace" => Some("2200".to_string()),
                    _ => None,
                })
                .collect();
            rows.push(row);
            oid += 1;
        }
    }

    Ok(QueryOutput {
        columns,
        rows,
        rows_affected: 0,
        tag: None,
    })
}
