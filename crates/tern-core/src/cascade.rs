//! The LLM cascade seam.
//!
//! A cascade is a named, externally hosted model pipeline: given
//! row-shaped JSON it returns a JSON result, possibly slowly and
//! non-deterministically. Everything behind the trait is a black box to
//! this crate.

use async_trait::async_trait;

use crate::engine::QueryOutput;
use crate::error::{Error, Result};

#[async_trait]
pub trait CascadeExecutor: Send + Sync {
    /// Invoke `cascade` with a row-shaped JSON input.
    async fn invoke(&self, cascade: &str, input: serde_json::Value) -> Result<serde_json::Value>;
}

/// HTTP-hosted cascade endpoint.
pub struct HttpCascade {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCascade {
    pub fn new(endpoint: String) -> HttpCascade {
        HttpCascade {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl CascadeExecutor for HttpCascade {
    async fn invoke(&self, cascade: &str, input: serde_json::Value) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "cascade": cascade,
            "input": input,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Cascade(e.to_string()))?;
        let value: serde_json::Value = response.json().await?;
        // Endpoints wrap the result in an "output" field; tolerate bare
        // payloads too.
        Ok(value.get("output").cloned().unwrap_or(value))
    }
}

/// Always fails; used when no endpoint is configured so cascade calls
/// surface a clear error instead of hanging.
pub struct NoopCascade;

#[async_trait]
impl CascadeExecutor for NoopCascade {
    async fn invoke(&self, cascade: &str, _input: serde_json::Value) -> Result<serde_json::Value> {
        Err(Error::Cascade(format!(
            "no cascade endpoint configured (requested '{cascade}')"
        )))
    }
}

/// Test double returning a fixed template with the input spliced in.
pub struct StaticCascade {
    pub reply: String,
}

#[async_trait]
impl CascadeExecutor for StaticCascade {
    async fn invoke(&self, _cascade: &str, input: serde_json::Value) -> Result<serde_json::Value> {
        Ok(serde_json::json!(format!("{}:{}", self.reply, input)))
    }
}

/// Render a cascade result as a result-cell string.
pub fn value_to_cell(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Compact pipe-separated rendering of a result set for an analysis
/// prompt: header row, then up to `max_rows` data rows.
pub fn format_result_for_prompt(output: &QueryOutput, max_rows: usize) -> String {
    let mut text = String::new();
    let header: Vec<&str> = output.columns.iter().map(|c| c.name.as_str()).collect();
    text.push_str(&header.join(" | "));
    text.push('\n');
    for row in output.rows.iter().take(max_rows) {
        let cells: Vec<&str> = row
            .iter()
            .map(|c| c.as_deref().unwrap_or("NULL"))
            .collect();
        text.push_str(&cells.join(" | "));
        text.push('\n');
    }
    if output.rows.len() > max_rows {
        text.push_str(&format!("... ({} rows total)\n", output.rows.len()));
    }
    text
}
