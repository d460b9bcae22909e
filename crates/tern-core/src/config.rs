use std::path::PathBuf;

/// Server-wide configuration shared by sessions and the dispatcher.
#[derive(Debug, Clone)]
pub struct TernConfig {
    /// Directory holding named persistent stores (`<name>.duckdb`).
    pub data_dir: PathBuf,
    /// Database names routed to a private in-memory engine.
    pub ephemeral_names: Vec<String>,
    /// Row-count ceiling above which results are not auto-materialized.
    pub materialize_row_ceiling: usize,
    /// Maximum rows of data included in an ANALYZE prompt.
    pub analyze_sample_rows: usize,
    /// HTTP endpoint of the cascade executor, if any.
    pub cascade_endpoint: Option<String>,
}

impl Default for TernConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            ephemeral_names: vec![
                "memory".to_string(),
                "default".to_string(),
                String::new(),
            ],
            materialize_row_ceiling: 10_000,
            analyze_sample_rows: 100,
            cascade_endpoint: None,
        }
    }
}

impl TernConfig {
    pub fn is_ephemeral(&self, database: &str) -> bool {
        self.ephemeral_names.iter().any(|n| n == database)
    }
}
