//! Reactive-subscription registry (`... WATCH` DDL).
//!
//! A watch is a named stored query a client can trigger on demand. Each
//! WATCH command answers with a fixed, command-specific column shape so
//! extended-protocol Describe and Execute always agree.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::RwLock;

use crate::engine::{Column, EngineHandle, PgType, QueryOutput};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct WatchDef {
    pub name: String,
    pub query: String,
    pub enabled: bool,
    pub created_at: String,
    pub last_run: Option<String>,
    pub last_rows: Option<usize>,
}

#[derive(Default)]
pub struct WatchRegistry {
    watches: RwLock<HashMap<String, WatchDef>>,
}

static CREATE_WATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+WATCH\s+([A-Za-z_][A-Za-z0-9_]*)\s+AS\s+(.+?)\s*;?\s*$")
        .unwrap()
});

static DROP_WATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*DROP\s+WATCH\s+([A-Za-z_][A-Za-z0-9_]*)\s*;?\s*$").unwrap()
});

static SHOW_WATCHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+WATCHES\s*;?\s*$").unwrap());

static DESCRIBE_WATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*DESCRIBE\s+WATCH\s+([A-Za-z_][A-Za-z0-9_]*)\s*;?\s*$").unwrap()
});

static TRIGGER_WATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*TRIGGER\s+WATCH\s+([A-Za-z_][A-Za-z0-9_]*)\s*;?\s*$").unwrap()
});

static ALTER_WATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*ALTER\s+WATCH\s+([A-Za-z_][A-Za-z0-9_]*)\s+(ENABLE|DISABLE)\s*;?\s*$")
        .unwrap()
});

/// Whether the statement is WATCH DDL at all.
pub fn is_watch_command(sql: &str) -> bool {
    static ANY: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^\s*(CREATE|DROP|SHOW|DESCRIBE|TRIGGER|ALTER)\s+WATCH(ES)?\b").unwrap()
    });
    ANY.is_match(sql)
}

fn show_shape() -> Vec<Column> {
    vec![
        Column::text("name"),
        Column::text("query"),
        Column::new("enabled", PgType::Bool),
        Column::text("created_at"),
        Column::text("last_run"),
        Column::new("last_rows", PgType::Int8),
    ]
}

fn describe_watch_shape() -> Vec<Column> {
    vec![Column::text("property"), Column::text("value")]
}

fn trigger_shape() -> Vec<Column> {
    vec![
        Column::text("name"),
        Column::new("rows", PgType::Int8),
        Column::text("triggered_at"),
    ]
}

/// Fixed column shape a WATCH command will answer with, for Describe.
pub fn describe_shape(sql: &str) -> Option<Vec<Column>> {
    if SHOW_WATCHES.is_match(sql) {
        Some(show_shape())
    } else if DESCRIBE_WATCH.is_match(sql) {
        Some(describe_watch_shape())
    } else if TRIGGER_WATCH.is_match(sql) {
        Some(trigger_shape())
    } else if is_watch_command(sql) {
        Some(Vec::new()) // DDL-only commands produce no rows
    } else {
        None
    }
}

impl WatchRegistry {
    pub fn new() -> WatchRegistry {
        WatchRegistry::default()
    }

    pub async fn handle(&self, engine: &EngineHandle, sql: &str) -> Result<QueryOutput> {
        if let Some(caps) = CREATE_WATCH.captures(sql) {
            return self.create(&caps[1], &caps[2]).await;
        }
        if let Some(caps) = DROP_WATCH.captures(sql) {
            return self.drop(&caps[1]).await;
        }
        if SHOW_WATCHES.is_match(sql) {
            return Ok(self.listing().await);
        }
        if let Some(caps) = DESCRIBE_WATCH.captures(sql) {
            return self.describe(&caps[1]).await;
        }
        if let Some(caps) = TRIGGER_WATCH.captures(sql) {
            return self.trigger(engine, &caps[1]).await;
        }
        if let Some(caps) = ALTER_WATCH.captures(sql) {
            return self
                .set_enabled(&caps[1], caps[2].eq_ignore_ascii_case("ENABLE"))
                .await;
        }
        Err(Error::Directive(format!("unrecognized WATCH command: {sql}")))
    }

    async fn create(&self, name: &str, query: &str) -> Result<QueryOutput> {
        let mut watches = self.watches.write().await;
        watches.insert(
            name.to_string(),
            WatchDef {
                name: name.to_string(),
                query: query.to_string(),
                enabled: true,
                created_at: chrono::Utc::now().to_rfc3339(),
                last_run: None,
                last_rows: None,
            },
        );
        tracing::info!(watch = %name, "watch created");
        Ok(QueryOutput::command("CREATE WATCH"))
    }

    async fn drop(&self, name: &str) -> Result<QueryOutput> {
        let mut watches = self.watches.write().await;
        watches
            .remove(name)
            .ok_or_else(|| Error::Directive(format!("unknown watch: {name}")))?;
        Ok(QueryOutput::command("DROP WATCH"))
    }

    async fn listing(&self) -> QueryOutput {
        let watches = self.watches.read().await;
        let mut defs: Vec<&WatchDef> = watches.values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        let rows = defs
            .iter()
            .map(|w| {
                vec![
                    Some(w.name.clone()),
                    Some(w.query.clone()),
                    Some(if w.enabled { "t" } else { "f" }.to_string()),
                    Some(w.created_at.clone()),
                    w.last_run.clone(),
                    w.last_rows.map(|r| r.to_string()),
                ]
            })
            .collect();
        QueryOutput {
            columns: show_shape(),
            rows,
            rows_affected: 0,
            tag: None,
        }
    }

    async fn describe(&self, name: &str) -> Result<QueryOutput> {
        let watches = self.watches.read().await;
        let watch = watches
            .get(name)
            .ok_or_else(|| Error::Directive(format!("unknown watch: {name}")))?;
        let rows = vec![
            vec![Some("name".to_string()), Some(watch.name.clone())],
            vec![Some("query".to_string()), Some(watch.query.clone())],
            vec![
                Some("enabled".to_string()),
                Some(watch.enabled.to_string()),
            ],
            vec![Some("created_at".to_string()), Some(watch.created_at.clone())],
            vec![Some("last_run".to_string()), watch.last_run.clone()],
        ];
        Ok(QueryOutput {
            columns: describe_watch_shape(),
            rows,
            rows_affected: 0,
            tag: None,
        })
    }

    async fn trigger(&self, engine: &EngineHandle, name: &str) -> Result<QueryOutput> {
        let query = {
            let watches = self.watches.read().await;
            let watch = watches
                .get(name)
                .ok_or_else(|| Error::Directive(format!("unknown watch: {name}")))?;
            if !watch.enabled {
                return Err(Error::Directive(format!("watch is disabled: {name}")));
            }
            watch.query.clone()
        };
        let output = engine.execute(&query, &[]).await?;
        let triggered_at = chrono::Utc::now().to_rfc3339();
        {
            let mut watches = self.watches.write().await;
            if let Some(watch) = watches.get_mut(name) {
                watch.last_run = Some(triggered_at.clone());
                watch.last_rows = Some(output.rows.len());
            }
        }
        Ok(QueryOutput {
            columns: trigger_shape(),
            rows: vec![vec![
                Some(name.to_string()),
                Some(output.rows.len().to_string()),
                Some(triggered_at),
            ]],
            rows_affected: 0,
            tag: None,
        })
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<QueryOutput> {
        let mut watches = self.watches.write().await;
        let watch = watches
            .get_mut(name)
            .ok_or_else(|| Error::Directive(format!("unknown watch: {name}")))?;
        watch.enabled = enabled;
        Ok(QueryOutput::command("ALTER WATCH"))
    }
}
