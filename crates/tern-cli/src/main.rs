use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tern_core::cascade::{CascadeExecutor, HttpCascade, NoopCascade};
use tern_core::telemetry::LogTelemetry;
use tern_core::{Dispatcher, SessionStore, TernConfig};
use tern_pgwire::PgWireConfig;

#[derive(Parser)]
#[command(name = "tern", about = "PostgreSQL-compatible server over an embedded DuckDB engine")]
struct Cli {
    /// TCP address the pgwire server binds to
    #[arg(long, default_value = "0.0.0.0:5433", env = "TERN_BIND_ADDR")]
    bind_addr: String,

    /// Directory holding named persistent stores
    #[arg(long, default_value = ".", env = "TERN_DATA_DIR")]
    data_dir: PathBuf,

    /// Maximum concurrent client connections
    #[arg(long, default_value = "100", env = "TERN_MAX_CONNECTIONS")]
    max_connections: usize,

    /// HTTP endpoint of the cascade (LLM) executor
    #[arg(long, env = "TERN_CASCADE_ENDPOINT")]
    cascade_endpoint: Option<String>,

    /// Row ceiling above which results are not auto-materialized
    #[arg(long, default_value = "10000", env = "TERN_MATERIALIZE_CEILING")]
    materialize_ceiling: usize,

    /// Rows of data included in an ANALYZE prompt
    #[arg(long, default_value = "100", env = "TERN_ANALYZE_SAMPLE_ROWS")]
    analyze_sample_rows: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tern=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = TernConfig {
        data_dir: cli.data_dir.clone(),
        materialize_row_ceiling: cli.materialize_ceiling,
        analyze_sample_rows: cli.analyze_sample_rows,
        cascade_endpoint: cli.cascade_endpoint.clone(),
        ..TernConfig::default()
    };

    let cascade: Arc<dyn CascadeExecutor> = match &cli.cascade_endpoint {
        Some(endpoint) => {
            tracing::info!("cascade executor at {endpoint}");
            Arc::new(HttpCascade::new(endpoint.clone()))
        }
        None => {
            tracing::warn!("no cascade endpoint configured; ask()/ANALYZE will error");
            Arc::new(NoopCascade)
        }
    };

    let store = Arc::new(SessionStore::new(config));
    let dispatcher = Arc::new(Dispatcher::new(store, cascade, Arc::new(LogTelemetry)));

    let pgwire = PgWireConfig {
        bind_addr: cli.bind_addr,
        max_connections: cli.max_connections,
    };
    tern_pgwire::start_server(dispatcher, pgwire).await?;
    Ok(())
}
