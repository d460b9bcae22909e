//! Extended Query Protocol state: prepared statements and portals.
//!
//! Statements go `Parsed → (bound by portals) → Closed`; portals go
//! `Bound → Described (optional) → Executed → Closed`. The described
//! column count recorded here is what lets Execute detect and repair a
//! column-shape mismatch before any DataRow goes out.

use std::collections::HashMap;
use std::sync::LazyLock;

use duckdb::types::Value;

use tern_core::dispatch;
use tern_core::engine::Column;
use tern_core::error::{Error, Result};
use tern_core::shim::{self, scanner, ShimContext};
use tern_core::Session;

use crate::codec::{self, BindMessage};

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    /// Backend-executable text (rewritten up front for catalog queries).
    pub sql: String,
    /// Pre-rewrite text, kept for classification and telemetry.
    pub original: String,
    pub param_oids: Vec<i32>,
}

impl PreparedStatement {
    /// Number of parameters Bind must supply: the declared OID count,
    /// or the highest `$n` placeholder when none were declared.
    pub fn expected_params(&self) -> usize {
        if !self.param_oids.is_empty() {
            return self.param_oids.len();
        }
        static PLACEHOLDER: LazyLock<regex::Regex> =
            LazyLock::new(|| regex::Regex::new(r"\$(\d+)").unwrap());
        let masked = scanner::mask_sql(&self.original);
        PLACEHOLDER
            .captures_iter(&masked)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct Portal {
    pub name: String,
    pub sql: String,
    pub original: String,
    pub params: Vec<Value>,
    pub result_formats: Vec<i16>,
    /// Column count promised by Describe, once a RowDescription went out.
    pub described_columns: Option<usize>,
}

#[derive(Default)]
pub struct PortalRegistry {
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
}

impl PortalRegistry {
    pub fn new() -> PortalRegistry {
        PortalRegistry::default()
    }

    /// Parse: store (overwriting any statement of the same name, per
    /// protocol semantics). The rewrite pipeline runs up front so
    /// Describe/Execute work on backend-executable text.
    pub fn parse(
        &mut self,
        name: String,
        query: String,
        param_oids: Vec<i32>,
        ctx: &ShimContext,
    ) {
        let sql = if shim::is_catalog_query(&query) {
            shim::rewrite::apply_pipeline(&query, ctx)
        } else {
            query.clone()
        };
        self.statements.insert(
            name.clone(),
            PreparedStatement {
                name,
                sql,
                original: query,
                param_oids,
            },
        );
    }

    /// Bind: decode parameters against the statement's declared OIDs
    /// and store the portal.
    pub fn bind(&mut self, message: BindMessage) -> Result<()> {
        let statement = self
            .statements
            .get(&message.statement)
            .ok_or_else(|| Error::UnknownStatement(message.statement.clone()))?;

        let expected = statement.expected_params();
        if message.params.len() != expected {
            return Err(Error::Bind(format!(
                "bind supplies {} parameters but statement requires {expected}",
                message.params.len()
            )));
        }

        let mut params = Vec::with_capacity(message.params.len());
        for (i, raw) in message.params.iter().enumerate() {
            let type_oid = statement.param_oids.get(i).copied().unwrap_or(0);
            let format = per_item_format(&message.param_formats, i);
            let value = codec::decode_parameter(raw.as_deref(), type_oid, format)
                .map_err(Error::Bind)?;
            params.push(value);
        }

        self.portals.insert(
            message.portal.clone(),
            Portal {
                name: message.portal,
                sql: statement.sql.clone(),
                original: statement.original.clone(),
                params,
                result_formats: message.result_formats,
                described_columns: None,
            },
        );
        Ok(())
    }

    pub fn statement(&self, name: &str) -> Result<&PreparedStatement> {
        self.statements
            .get(name)
            .ok_or_else(|| Error::UnknownStatement(name.to_string()))
    }

    pub fn portal(&self, name: &str) -> Result<&Portal> {
        self.portals
            .get(name)
            .ok_or_else(|| Error::UnknownPortal(name.to_string()))
    }

    pub fn record_described(&mut self, name: &str, columns: usize) {
        if let Some(portal) = self.portals.get_mut(name) {
            portal.described_columns = Some(columns);
        }
    }

    /// Close is idempotent at the wire level: closing an unknown name
    /// still answers CloseComplete.
    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    pub fn clear(&mut self) {
        self.statements.clear();
        self.portals.clear();
    }
}

/// Bind format codes: none means all-text, one applies to every
/// parameter, otherwise one per parameter.
fn per_item_format(formats: &[i16], index: usize) -> i16 {
    match formats.len() {
        0 => 0,
        1 => formats[0],
        _ => formats.get(index).copied().unwrap_or(0),
    }
}

/// Column shape a portal's Describe should promise, or `None` for
/// NoData. Non-SELECT commands get NoData; directives get their fixed
/// shapes; ordinary SELECTs are probed against the engine with a
/// zero-row wrapper, falling back to SELECT-list inference, then NoData
/// rather than partial protocol garbage.
pub async fn describe_portal_columns(
    session: &Session,
    portal: &Portal,
) -> Option<Vec<Column>> {
    if dispatch::classify::is_resultless_command(&portal.original) {
        return None;
    }
    if let Some(shape) = dispatch::directive_shape(&portal.original) {
        return if shape.is_empty() { None } else { Some(shape) };
    }
    // DML/DDL produce no result columns; don't let SELECT-list
    // inference find the SELECT inside an INSERT ... SELECT.
    let verb = portal
        .original
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    if !matches!(
        verb.as_str(),
        "SELECT" | "WITH" | "VALUES" | "TABLE" | "FROM" | "EXPLAIN" | "PRAGMA" | "DESCRIBE"
            | "SUMMARIZE"
    ) {
        return None;
    }

    // Probe with parameters stubbed to NULL; this never executes the
    // query's rows thanks to the LIMIT 0 wrapper inside describe().
    let probe_sql = stub_placeholders(&portal.sql);
    match session.engine.describe(&probe_sql).await {
        Ok(columns) if !columns.is_empty() => Some(columns),
        _ => {
            let masked = scanner::mask_sql(&portal.original);
            let inferred = shim::infer_select_columns(&portal.original, &masked, &[]);
            if inferred.is_empty() {
                None
            } else {
                Some(inferred)
            }
        }
    }
}

/// Replace `$n` placeholders with NULL for schema probing.
fn stub_placeholders(sql: &str) -> String {
    static PLACEHOLDER: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"\$\d+").unwrap());
    let masked = scanner::mask_sql(sql);
    let mut edits = Vec::new();
    for m in PLACEHOLDER.find_iter(&masked) {
        edits.push(scanner::Edit {
            start: m.start(),
            end: m.end(),
            text: "NULL".to_string(),
        });
    }
    scanner::apply_edits(sql, edits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(name: &str, sql: &str, oids: Vec<i32>) -> PortalRegistry {
        let mut registry = PortalRegistry::new();
        registry.parse(name.to_string(), sql.to_string(), oids, &ShimContext::default());
        registry
    }

    fn bind_message(statement: &str, params: Vec<Option<Vec<u8>>>) -> BindMessage {
        BindMessage {
            portal: String::new(),
            statement: statement.to_string(),
            param_formats: vec![],
            params,
            result_formats: vec![],
        }
    }

    #[test]
    fn test_parse_overwrites_same_name() {
        let mut registry = registry_with("s", "SELECT 1", vec![]);
        registry.parse(
            "s".to_string(),
            "SELECT 2".to_string(),
            vec![],
            &ShimContext::default(),
        );
        assert_eq!(registry.statement("s").unwrap().sql, "SELECT 2");
    }

    #[test]
    fn test_parse_rewrites_catalog_queries_up_front() {
        let registry = registry_with("s", "SELECT 'x'::regclass, relname FROM pg_class", vec![]);
        let statement = registry.statement("s").unwrap();
        assert!(!statement.sql.contains("::regclass"));
        assert!(statement.original.contains("::regclass"));
    }

    #[test]
    fn test_ordinary_sql_left_alone() {
        let registry = registry_with("s", "SELECT xmin FROM my_app_table", vec![]);
        assert_eq!(registry.statement("s").unwrap().sql, "SELECT xmin FROM my_app_table");
    }

    #[test]
    fn test_expected_params_from_placeholders() {
        let registry = registry_with("s", "SELECT $1::int + $2::int", vec![]);
        assert_eq!(registry.statement("s").unwrap().expected_params(), 2);
    }

    #[test]
    fn test_bind_unknown_statement() {
        let mut registry = PortalRegistry::new();
        assert!(matches!(
            registry.bind(bind_message("ghost", vec![])),
            Err(Error::UnknownStatement(_))
        ));
    }

    #[test]
    fn test_bind_param_count_mismatch() {
        let mut registry = registry_with("s", "SELECT $1::int", vec![23]);
        assert!(matches!(
            registry.bind(bind_message("s", vec![])),
            Err(Error::Bind(_))
        ));
    }

    #[test]
    fn test_bind_decodes_params() {
        let mut registry = registry_with("s", "SELECT $1::int", vec![23]);
        registry
            .bind(bind_message("s", vec![Some(b"42".to_vec())]))
            .unwrap();
        let portal = registry.portal("").unwrap();
        assert_eq!(portal.params, vec![Value::Int(42)]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut registry = PortalRegistry::new();
        registry.close_statement("never_existed");
        registry.close_portal("never_existed");
    }

    #[test]
    fn test_record_described() {
        let mut registry = registry_with("s", "SELECT 1 AS x", vec![]);
        registry.bind(bind_message("s", vec![])).unwrap();
        registry.record_described("", 1);
        assert_eq!(registry.portal("").unwrap().described_columns, Some(1));
    }

    #[test]
    fn test_stub_placeholders() {
        assert_eq!(
            stub_placeholders("SELECT $1, '$2', $2"),
            "SELECT NULL, '$2', NULL"
        );
    }
}
