use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("engine error: {0}")]
    Engine(String),

    #[error("unknown statement: {0}")]
    UnknownStatement(String),

    #[error("unknown portal: {0}")]
    UnknownPortal(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    #[error("directive error: {0}")]
    Directive(String),

    #[error("cascade error: {0}")]
    Cascade(String),

    #[error("job error: {0}")]
    Job(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<duckdb::Error> for Error {
    fn from(e: duckdb::Error) -> Self {
        Error::Engine(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Cascade(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
