//! Background job execution.
//!
//! Directive-triggered work (`BACKGROUND`, `ANALYZE`) runs on its own
//! worker with its own engine handle against the same store; the
//! originating connection gets a job id immediately and polls via
//! `SHOW JOBS` / `SHOW JOB '<id>'`. Each job keeps a persisted record
//! with state transitions `running → completed | error`.

use std::collections::HashMap;
use std::sync::Arc;

use duckdb::types::Value;
use tokio::sync::{RwLock, Semaphore};

use crate::cascade::{format_result_for_prompt, CascadeExecutor};
use crate::engine::{Column, EngineHandle, PgType, QueryOutput};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Completed,
    Error,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub query: String,
    pub state: JobState,
    pub error: Option<String>,
    pub analysis: Option<String>,
    pub rows: Option<usize>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Fixed column shape of `SHOW JOBS` and `SHOW JOB '<id>'`.
pub fn jobs_shape() -> Vec<Column> {
    vec![
        Column::text("job_id"),
        Column::text("state"),
        Column::new("rows", PgType::Int8),
        Column::text("error"),
        Column::text("started_at"),
        Column::text("finished_at"),
    ]
}

/// Fixed single-column shape returned when a job is submitted.
pub fn submit_shape() -> Vec<Column> {
    vec![Column::text("job_id")]
}

/// Fixed shape of `SHOW JOB ANALYSIS '<id>'`.
pub fn analysis_shape() -> Vec<Column> {
    vec![Column::text("job_id"), Column::text("analysis")]
}

pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
    workers: Arc<Semaphore>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        JobRegistry::new(4)
    }
}

impl JobRegistry {
    pub fn new(max_workers: usize) -> JobRegistry {
        JobRegistry {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(max_workers)),
        }
    }

    async fn insert_running(&self, engine: &EngineHandle, query: &str) -> JobRecord {
        let record = JobRecord {
            id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            query: query.to_string(),
            state: JobState::Running,
            error: None,
            analysis: None,
            rows: None,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
        };
        self.jobs
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        persist_start(engine, &record).await;
        record
    }

    async fn finish(
        &self,
        engine: &EngineHandle,
        id: &str,
        result: std::result::Result<(usize, Option<String>), String>,
    ) {
        let finished_at = chrono::Utc::now().to_rfc3339();
        let updated = {
            let jobs = self.jobs.read().await;
            let Some(record) = jobs.get(id) else {
                return;
            };
            let mut record = record.clone();
            record.finished_at = Some(finished_at);
            match result {
                Ok((rows, analysis)) => {
                    record.state = JobState::Completed;
                    record.rows = Some(rows);
                    record.analysis = analysis;
                }
                Err(error) => {
                    record.state = JobState::Error;
                    record.error = Some(error);
                }
            }
            record
        };
        // Persist first so a poller that sees the terminal state also
        // finds the durable record.
        persist_finish(engine, &updated).await;
        self.jobs
            .write()
            .await
            .insert(updated.id.clone(), updated);
    }

    /// Submit `BACKGROUND <query>`: fire-and-forget execution on a
    /// worker slot. Never blocks the caller.
    pub async fn submit(self: &Arc<Self>, engine: EngineHandle, query: String) -> String {
        let record = self.insert_running(&engine, &query).await;
        let id = record.id.clone();
        let registry = Arc::clone(self);
        let job_id = id.clone();
        tokio::spawn(async move {
            let _permit = registry.workers.acquire().await;
            let outcome = match engine.execute(&query, &[]).await {
                Ok(out) => Ok((out.rows.len().max(out.rows_affected), None)),
                Err(e) => Err(e.to_string()),
            };
            if let Err(ref e) = outcome {
                tracing::warn!(job = %job_id, error = %e, "background job failed");
            }
            registry.finish(&engine, &job_id, outcome).await;
        });
        id
    }

    /// Submit `ANALYZE '<prompt>' <query>`: run the query, format the
    /// result compactly, and hand prompt + data to the cascade; the
    /// free-text analysis is kept on the job record.
    pub async fn submit_analysis(
        self: &Arc<Self>,
        engine: EngineHandle,
        cascade: Arc<dyn CascadeExecutor>,
        prompt: String,
        query: String,
        sample_rows: usize,
    ) -> String {
        let record = self.insert_running(&engine, &query).await;
        let id = record.id.clone();
        let registry = Arc::clone(self);
        let job_id = id.clone();
        tokio::spawn(async move {
            let _permit = registry.workers.acquire().await;
            let outcome = analysis_task(&engine, cascade, &prompt, &query, sample_rows).await;
            registry
                .finish(&engine, &job_id, outcome.map_err(|e| e.to_string()))
                .await;
        });
        id
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(id).cloned()
    }

    /// `SHOW JOBS` listing, newest first.
    pub async fn listing(&self) -> QueryOutput {
        let jobs = self.jobs.read().await;
        let mut records: Vec<&JobRecord> = jobs.values().collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let rows = records.iter().map(|r| job_row(r)).collect();
        QueryOutput {
            columns: jobs_shape(),
            rows,
            rows_affected: 0,
            tag: None,
        }
    }

    /// `SHOW JOB '<id>'` single-row status.
    pub async fn status(&self, id: &str) -> Result<QueryOutput> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| Error::Job(format!("unknown job: {id}")))?;
        Ok(QueryOutput {
            columns: jobs_shape(),
            rows: vec![job_row(&record)],
            rows_affected: 0,
            tag: None,
        })
    }

    /// `SHOW JOB ANALYSIS '<id>'`.
    pub async fn analysis(&self, id: &str) -> Result<QueryOutput> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| Error::Job(format!("unknown job: {id}")))?;
        Ok(QueryOutput {
            columns: analysis_shape(),
            rows: vec![vec![Some(record.id.clone()), record.analysis.clone()]],
            rows_affected: 0,
            tag: None,
        })
    }
}

async fn analysis_task(
    engine: &EngineHandle,
    cascade: Arc<dyn CascadeExecutor>,
    prompt: &str,
    query: &str,
    sample_rows: usize,
) -> Result<(usize, Option<String>)> {
    let output = engine.execute(query, &[]).await?;
    let formatted = format_result_for_prompt(&output, sample_rows);
    let input = serde_json::json!({
        "prompt": prompt,
        "data": formatted,
    });
    let analysis = cascade.invoke("analyze", input).await?;
    let text = crate::cascade::value_to_cell(&analysis);
    Ok((output.rows.len(), text))
}

fn job_row(record: &JobRecord) -> Vec<Option<String>> {
    vec![
        Some(record.id.clone()),
        Some(record.state.as_str().to_string()),
        record.rows.map(|r| r.to_string()),
        record.error.clone(),
        Some(record.started_at.clone()),
        record.finished_at.clone(),
    ]
}

async fn persist_start(engine: &EngineHandle, record: &JobRecord) {
    let result = engine
        .execute(
            "INSERT OR REPLACE INTO tern_jobs (id, query, state, started_at) VALUES ($1, $2, $3, $4)",
            &[
                Value::Text(record.id.clone()),
                Value::Text(record.query.clone()),
                Value::Text(record.state.as_str().to_string()),
                Value::Text(record.started_at.clone()),
            ],
        )
        .await;
    if let Err(e) = result {
        tracing::debug!(job = %record.id, error = %e, "could not persist job start");
    }
}

async fn persist_finish(engine: &EngineHandle, record: &JobRecord) {
    let result = engine
        .execute(
            "UPDATE tern_jobs SET state = $1, error = $2, analysis = $3, finished_at = $4 WHERE id = $5",
            &[
                Value::Text(record.state.as_str().to_string()),
                record
                    .error
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                record
                    .analysis
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                record
                    .finished_at
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
                Value::Text(record.id.clone()),
            ],
        )
        .await;
    if let Err(e) = result {
        tracing::debug!(job = %record.id, error = %e, "could not persist job completion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach;
    use crate::cascade::StaticCascade;
    use std::time::Duration;

    async fn engine() -> EngineHandle {
        let e = EngineHandle::new(duckdb::Connection::open_in_memory().unwrap(), "memory");
        attach::install_metadata(&e).await.unwrap();
        e
    }

    async fn wait_done(registry: &Arc<JobRegistry>, id: &str) -> JobRecord {
        for _ in 0..200 {
            if let Some(r) = registry.get(id).await {
                if r.state != JobState::Running {
                    return r;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test]
    async fn test_background_job_completes() {
        let registry = Arc::new(JobRegistry::new(2));
        let e = engine().await;
        e.execute_batch("CREATE TABLE jt (x INTEGER); INSERT INTO jt VALUES (1), (2)")
            .await
            .unwrap();
        let id = registry
            .submit(e.try_clone().await.unwrap(), "SELECT * FROM jt".to_string())
            .await;
        let record = wait_done(&registry, &id).await;
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.rows, Some(2));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_job_records_error() {
        let registry = Arc::new(JobRegistry::new(2));
        let e = engine().await;
        let id = registry
            .submit(e.try_clone().await.unwrap(), "SELECT * FROM missing_table".to_string())
            .await;
        let record = wait_done(&registry, &id).await;
        assert_eq!(record.state, JobState::Error);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_analysis_job_invokes_cascade() {
        let registry = Arc::new(JobRegistry::new(2));
        let e = engine().await;
        let cascade = Arc::new(StaticCascade {
            reply: "insight".to_string(),
        });
        let id = registry
            .submit_analysis(
                e.try_clone().await.unwrap(),
                cascade,
                "what stands out?".to_string(),
                "SELECT 42 AS answer".to_string(),
                10,
            )
            .await;
        let record = wait_done(&registry, &id).await;
        assert_eq!(record.state, JobState::Completed);
        assert!(record.analysis.as_deref().unwrap().starts_with("insight:"));

        let out = registry.analysis(&id).await.unwrap();
        assert_eq!(out.columns.len(), 2);
        assert!(out.rows[0][1].is_some());
    }

    #[tokio::test]
    async fn test_listing_and_status_shapes_match() {
        let registry = Arc::new(JobRegistry::new(2));
        let e = engine().await;
        let id = registry
            .submit(e.try_clone().await.unwrap(), "SELECT 1".to_string())
            .await;
        wait_done(&registry, &id).await;

        let listing = registry.listing().await;
        let status = registry.status(&id).await.unwrap();
        assert_eq!(listing.columns.len(), status.columns.len());
        assert_eq!(listing.rows[0].len(), listing.columns.len());
    }

    #[tokio::test]
    async fn test_unknown_job_errors() {
        let registry = Arc::new(JobRegistry::new(1));
        assert!(registry.status("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_job_record_persisted() {
        let registry = Arc::new(JobRegistry::new(2));
        let e = engine().await;
        let id = registry
            .submit(e.try_clone().await.unwrap(), "SELECT 1".to_string())
            .await;
        wait_done(&registry, &id).await;

        let out = e
            .execute(
                "SELECT state FROM tern_jobs WHERE id = $1",
                &[Value::Text(id)],
            )
            .await
            .unwrap();
        assert_eq!(out.rows[0][0].as_deref(), Some("completed"));
    }
}
