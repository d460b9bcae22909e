//! Query dispatch: the per-query decision tree.
//!
//! One call per Simple-Query message or per extended-protocol Execute.
//! Classification is an ordered first-match-wins table; handlers route
//! to the session store, the job registry, the watch registry, the
//! catalog shim, or straight to the engine. Telemetry wraps every
//! cascade-using query; materialization, exposure refresh, and
//! telemetry failures never affect the client-visible result.

pub mod classify;
pub mod show;

use std::sync::Arc;
use std::time::Instant;

use std::sync::LazyLock;

use regex::Regex;

use crate::attach;
use crate::cascade::{value_to_cell, CascadeExecutor};
use crate::engine::{Column, PgType, QueryOutput};
use crate::error::{Error, Result};
use crate::jobs::{self, JobRegistry};
use crate::materialize;
use crate::session::{self, Session, SessionStore};
use crate::shim::{self, scanner};
use crate::telemetry::{new_correlation_id, QueryEvent, QueryPhase, QueryTelemetry};
use crate::watch::{self, WatchRegistry};

pub use self::classify::{classify, QueryClass};

/// Result of dispatching one query.
#[derive(Debug)]
pub enum Dispatched {
    /// Whitespace-only query: the wire layer sends EmptyQueryResponse.
    Empty,
    Output(QueryOutput),
}

static BACKGROUND_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*BACKGROUND\s+(.+?)\s*;?\s*$").unwrap());

static ANALYZE_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*ANALYZE\s+'((?:[^']|'')*)'\s+(.+?)\s*;?\s*$").unwrap()
});

static ATTACH_STMT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*ATTACH\s+(?:DATABASE\s+)?'([^']+)'(?:\s+AS\s+"?([A-Za-z_][A-Za-z0-9_]*)"?)?"#)
        .unwrap()
});

static DETACH_STMT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*DETACH\s+(?:DATABASE\s+)?"?([A-Za-z_][A-Za-z0-9_]*)"?"#).unwrap()
});

static SHOW_RESULTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+RESULTS\s*;?\s*$").unwrap());

static SHOW_JOBS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+JOBS\s*;?\s*$").unwrap());

static SHOW_JOB_ANALYSIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SHOW\s+JOB\s+ANALYSIS\s+'([^']+)'\s*;?\s*$").unwrap()
});

static SHOW_JOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+JOB\s+'([^']+)'\s*;?\s*$").unwrap());

static ASK_CALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bask\s*\(").unwrap());

static TRAILING_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*(?:AS\s+)?"?([A-Za-z_][A-Za-z0-9_]*)"?\s*$"#).unwrap()
});

pub struct Dispatcher {
    store: Arc<SessionStore>,
    pub jobs: Arc<JobRegistry>,
    pub watches: Arc<WatchRegistry>,
    cascade: Arc<dyn CascadeExecutor>,
    telemetry: Arc<dyn QueryTelemetry>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        cascade: Arc<dyn CascadeExecutor>,
        telemetry: Arc<dyn QueryTelemetry>,
    ) -> Dispatcher {
        Dispatcher {
            store,
            jobs: Arc::new(JobRegistry::default()),
            watches: Arc::new(WatchRegistry::new()),
            cascade,
            telemetry,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Dispatch one query for a session.
    pub async fn dispatch(&self, session: &mut Session, sql: &str) -> Result<Dispatched> {
        session.queries += 1;
        match classify(sql) {
            QueryClass::Empty => Ok(Dispatched::Empty),
            QueryClass::SetReset => Ok(Dispatched::Output(self.run_set(session, sql).await)),
            QueryClass::Show => self.run_show(session, sql).await.map(Dispatched::Output),
            QueryClass::Background => {
                self.run_background(session, sql).await.map(Dispatched::Output)
            }
            QueryClass::Analyze => self.run_analyze(session, sql).await.map(Dispatched::Output),
            QueryClass::Watch => self
                .watches
                .handle(&session.engine, sql)
                .await
                .map(Dispatched::Output),
            QueryClass::Transaction => self
                .run_transaction(session, sql)
                .await
                .map(Dispatched::Output),
            QueryClass::Attach => self.run_attach(session, sql).await.map(Dispatched::Output),
            QueryClass::Catalog => shim::execute(&session.engine, &session.shim_context(), sql)
                .await
                .map(Dispatched::Output),
            QueryClass::Passthrough => self
                .run_passthrough(session, sql)
                .await
                .map(Dispatched::Output),
        }
    }

    /// SET/RESET: try the engine, silently succeed when it has no such
    /// setting. Many Postgres session settings have no equivalent and
    /// must not error.
    async fn run_set(&self, session: &Session, sql: &str) -> QueryOutput {
        let verb = if sql.trim_start().to_ascii_uppercase().starts_with("RESET") {
            "RESET"
        } else {
            "SET"
        };
        match session.engine.execute(sql, &[]).await {
            Ok(out) => out,
            Err(e) => {
                tracing::debug!(error = %e, "SET/RESET not supported by engine, swallowing");
                QueryOutput::command(verb)
            }
        }
    }

    async fn run_show(&self, session: &mut Session, sql: &str) -> Result<QueryOutput> {
        if SHOW_RESULTS.is_match(sql) {
            return materialize::show_results(&session.engine).await;
        }
        if SHOW_JOBS.is_match(sql) {
            return Ok(self.jobs.listing().await);
        }
        if let Some(caps) = SHOW_JOB_ANALYSIS.captures(sql) {
            return self.jobs.analysis(&caps[1]).await;
        }
        if let Some(caps) = SHOW_JOB.captures(sql) {
            return self.jobs.status(&caps[1]).await;
        }

        let name = show::setting_name(sql);
        if name.eq_ignore_ascii_case("application_name") {
            let value = session.application.clone();
            return Ok(QueryOutput::single(Column::text("application_name"), &value));
        }
        if let Some((column, value)) = show::known_setting(&name) {
            return Ok(QueryOutput::single(Column::text(column), value));
        }
        // Unknown setting: try the engine's native SHOW, else an empty
        // one-column result rather than an error.
        match session.engine.execute(sql, &[]).await {
            Ok(out) => Ok(out),
            Err(_) => {
                let column = if name.is_empty() { "setting".to_string() } else { name };
                Ok(QueryOutput::empty(vec![Column::text(column)]))
            }
        }
    }

    async fn run_background(&self, session: &Session, sql: &str) -> Result<QueryOutput> {
        let caps = BACKGROUND_DIRECTIVE
            .captures(sql)
            .ok_or_else(|| Error::Directive("BACKGROUND requires a query".to_string()))?;
        let query = caps[1].to_string();
        let handle = self.store.background_handle(session).await?;
        let id = self.jobs.submit(handle, query).await;
        Ok(QueryOutput {
            columns: jobs::submit_shape(),
            rows: vec![vec![Some(id)]],
            rows_affected: 0,
            tag: None,
        })
    }

    async fn run_analyze(&self, session: &Session, sql: &str) -> Result<QueryOutput> {
        let caps = ANALYZE_DIRECTIVE
            .captures(sql)
            .ok_or_else(|| Error::Directive("ANALYZE requires a prompt and a query".to_string()))?;
        let prompt = caps[1].replace("''", "'");
        let query = caps[2].to_string();
        let handle = self.store.background_handle(session).await?;
        let id = self
            .jobs
            .submit_analysis(
                handle,
                Arc::clone(&self.cascade),
                prompt,
                query,
                self.store.config().analyze_sample_rows,
            )
            .await;
        Ok(QueryOutput {
            columns: jobs::submit_shape(),
            rows: vec![vec![Some(id)]],
            rows_affected: 0,
            tag: None,
        })
    }

    async fn run_transaction(&self, session: &mut Session, sql: &str) -> Result<QueryOutput> {
        let verb = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let tag = match verb.as_str() {
            "BEGIN" | "START" => session::begin(session).await?,
            "COMMIT" | "END" => session::commit(session).await?,
            "ROLLBACK" | "ABORT" => session::rollback(session).await?,
            other => return Err(Error::Directive(format!("unexpected transaction verb: {other}"))),
        };
        Ok(QueryOutput::command(&tag))
    }

    async fn run_attach(&self, session: &mut Session, sql: &str) -> Result<QueryOutput> {
        let output = session.engine.execute(sql, &[]).await?;

        if let Some(caps) = ATTACH_STMT.captures(sql) {
            let path = caps[1].to_string();
            let alias = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| {
                    std::path::Path::new(&path)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.clone())
                });
            if let Err(e) = attach::record(&session.engine, &alias, &path).await {
                tracing::warn!(alias = %alias, error = %e, "could not persist attachment");
            }
        } else if let Some(caps) = DETACH_STMT.captures(sql) {
            let alias = caps[1].to_string();
            if let Err(e) = attach::remove(&session.engine, &alias).await {
                tracing::warn!(alias = %alias, error = %e, "could not remove attachment record");
            }
        }

        // Exposure refresh is cheap to skip when nothing changed and
        // must never fail the ATTACH itself.
        if let Err(e) =
            attach::refresh_exposure_views(&session.engine, &mut session.known_sources).await
        {
            tracing::warn!(error = %e, "exposure view refresh failed");
        }
        Ok(output)
    }

    async fn run_passthrough(&self, session: &mut Session, sql: &str) -> Result<QueryOutput> {
        let masked = scanner::mask_sql(sql);
        attach::lazy_attach(&session.engine, &masked).await;

        let (clean, save_hint) = materialize::extract_save_as_hint(sql);
        let masked = scanner::mask_sql(&clean);
        let asks = find_ask_calls(&clean, &masked);
        let interesting = !asks.is_empty() || ASK_CALL.is_match(&masked);

        let correlation_id = new_correlation_id();
        if interesting {
            self.telemetry.record(&QueryEvent {
                correlation_id: correlation_id.clone(),
                session: session.id.clone(),
                query: clean.clone(),
                phase: QueryPhase::Started,
            });
        }
        let started = Instant::now();

        let result = if asks.is_empty() {
            session.engine.execute(&clean, &[]).await
        } else {
            self.run_with_cascade(session, &clean, &asks).await
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                if interesting {
                    self.telemetry.record(&QueryEvent {
                        correlation_id,
                        session: session.id.clone(),
                        query: clean.clone(),
                        phase: QueryPhase::Completed {
                            rows: output.rows.len(),
                            duration_ms,
                        },
                    });
                    let ceiling = self.store.config().materialize_row_ceiling;
                    if let Err(e) =
                        materialize::maybe_materialize(&session.engine, &clean, &output, ceiling)
                            .await
                    {
                        tracing::warn!(error = %e, "auto-materialization failed");
                    }
                }
                if let Some(name) = save_hint {
                    let saved = if asks.is_empty() {
                        materialize::save_as(&session.engine, &name, &clean).await
                    } else {
                        materialize::save_output_as(&session.engine, &name, &output).await
                    };
                    if let Err(e) = saved {
                        tracing::warn!(table = %name, error = %e, "save_as hint failed");
                    }
                }
                Ok(output)
            }
            Err(e) => {
                if interesting {
                    self.telemetry.record(&QueryEvent {
                        correlation_id,
                        session: session.id.clone(),
                        query: clean,
                        phase: QueryPhase::Failed {
                            error: e.to_string(),
                            duration_ms,
                        },
                    });
                }
                Err(e)
            }
        }
    }

    /// Execute a query whose SELECT list carries `ask('<cascade>', …)`
    /// items: each call is rewritten to a JSON packing of its arguments,
    /// the query runs against the engine, and each packed cell is mapped
    /// through the cascade executor row by row.
    async fn run_with_cascade(
        &self,
        session: &Session,
        sql: &str,
        asks: &[AskCall],
    ) -> Result<QueryOutput> {
        let mut edits = Vec::new();
        for ask in asks {
            let packed = if ask.args.trim().is_empty() {
                "to_json([])".to_string()
            } else {
                format!("to_json([{}])", ask.args)
            };
            edits.push(scanner::Edit {
                start: ask.span.0,
                end: ask.span.1,
                text: format!(" {} AS \"{}\"", packed, ask.output_name),
            });
        }
        let rewritten = scanner::apply_edits(sql, edits);
        let mut output = session.engine.execute(&rewritten, &[]).await?;

        for ask in asks {
            let idx = ask.index;
            if idx >= output.columns.len() {
                return Err(Error::Cascade(
                    "cascade call column mismatch after rewrite".to_string(),
                ));
            }
            output.columns[idx] = Column::new(&ask.output_name, PgType::Text);
            for row in &mut output.rows {
                let input = row[idx]
                    .as_deref()
                    .and_then(|cell| serde_json::from_str(cell).ok())
                    .unwrap_or(serde_json::Value::Null);
                let value = self.cascade.invoke(&ask.cascade, input).await?;
                row[idx] = value_to_cell(&value);
            }
        }
        Ok(output)
    }
}

/// One `ask(...)` call found as a top-level SELECT-list item.
#[derive(Debug, Clone)]
struct AskCall {
    /// Byte span of the whole item in the query text.
    span: (usize, usize),
    /// Item position == output column index.
    index: usize,
    cascade: String,
    /// Remaining argument text after the cascade name, verbatim.
    args: String,
    output_name: String,
}

/// Find top-level `ask('<cascade>', args…)` SELECT items. Calls nested
/// inside larger expressions are left for the engine to reject; the
/// black-box boundary stays intact.
fn find_ask_calls(sql: &str, masked: &str) -> Vec<AskCall> {
    let Some(span) = scanner::select_list_span(masked) else {
        return Vec::new();
    };
    let parts = scanner::split_top_level(masked, span, b',');
    let mut calls = Vec::new();
    static ASK_ITEM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^\s*ask\s*\(").unwrap());
    for (index, (start, end)) in parts.into_iter().enumerate() {
        let item = &sql[start..end];
        let item_masked = &masked[start..end];
        let Some(m) = ASK_ITEM.find(item_masked) else {
            continue;
        };
        let open = m.end() - 1;
        let Some(close) = scanner::matching_paren(item_masked, open) else {
            continue;
        };
        let inner = &item[open + 1..close];
        // First argument is the quoted cascade name.
        static NAME: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"(?s)^\s*'([^']*)'\s*(?:,\s*(.*))?$").unwrap());
        let Some(caps) = NAME.captures(inner) else {
            continue;
        };
        let cascade = caps[1].to_string();
        let args = caps.get(2).map(|a| a.as_str().to_string()).unwrap_or_default();
        let tail = &item[close + 1..];
        let output_name = TRAILING_ALIAS
            .captures(tail)
            .map(|c| c[1].to_string())
            .filter(|_| !tail.trim().is_empty())
            .unwrap_or_else(|| "ask".to_string());
        calls.push(AskCall {
            span: (start, end),
            index,
            cascade,
            args,
            output_name,
        });
    }
    calls
}

/// Fixed column shape a directive will answer with, for extended-
/// protocol Describe. `None` means the statement is ordinary SQL and
/// must be probed instead.
pub fn directive_shape(sql: &str) -> Option<Vec<Column>> {
    if let Some(shape) = watch::describe_shape(sql) {
        return Some(shape);
    }
    match classify(sql) {
        QueryClass::Show => {
            if SHOW_RESULTS.is_match(sql) {
                Some(materialize::show_results_shape())
            } else if SHOW_JOB_ANALYSIS.is_match(sql) {
                Some(jobs::analysis_shape())
            } else if SHOW_JOBS.is_match(sql) || SHOW_JOB.is_match(sql) {
                Some(jobs::jobs_shape())
            } else {
                let name = show::setting_name(sql);
                let column = show::known_setting(&name)
                    .map(|(c, _)| c.to_string())
                    .unwrap_or(name);
                let column = if column.is_empty() { "setting".to_string() } else { column };
                Some(vec![Column::text(column)])
            }
        }
        QueryClass::Background | QueryClass::Analyze => Some(jobs::submit_shape()),
        QueryClass::Empty
        | QueryClass::SetReset
        | QueryClass::Transaction
        | QueryClass::Attach => Some(Vec::new()),
        _ => None,
    }
}
