//! Session routing and transaction state.
//!
//! Each client connection owns one [`Session`]: an engine handle, the
//! transaction status surfaced in ReadyForQuery, and the bookkeeping the
//! dispatcher needs. Ephemeral database names get a private in-memory
//! engine; named databases share a root connection held in a
//! process-wide registry, each session cloning its own handle from it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use rand::Rng;
use tokio::sync::RwLock;

use crate::attach;
use crate::config::TernConfig;
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::shim::ShimContext;

/// Transaction status byte carried by every ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Errored,
}

impl TransactionStatus {
    pub fn byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Errored => b'E',
        }
    }
}

/// Per-connection state.
pub struct Session {
    pub id: String,
    pub database: String,
    pub user: String,
    pub application: String,
    pub engine: EngineHandle,
    pub status: TransactionStatus,
    pub queries: u64,
    /// Attached-source names observed at the last exposure refresh.
    pub known_sources: HashSet<String>,
    pub ephemeral: bool,
}

impl Session {
    pub fn shim_context(&self) -> ShimContext {
        ShimContext {
            database: self.database.clone(),
            user: self.user.clone(),
        }
    }
}

/// Process-wide store registry.
pub struct SessionStore {
    config: TernConfig,
    roots: RwLock<HashMap<String, EngineHandle>>,
}

fn sanitize(database: &str) -> String {
    database
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn session_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| {
            let idx = rng.gen_range(0..36);
            char::from_digit(idx, 36).unwrap()
        })
        .collect()
}

impl SessionStore {
    pub fn new(config: TernConfig) -> SessionStore {
        SessionStore {
            config,
            roots: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TernConfig {
        &self.config
    }

    /// Open a session for a startup-message database/user pair.
    pub async fn open(
        &self,
        database: &str,
        user: &str,
        application: &str,
    ) -> Result<Session> {
        let name = sanitize(database);
        let ephemeral = self.config.is_ephemeral(&name);

        let engine = if ephemeral {
            let conn = duckdb::Connection::open_in_memory()?;
            EngineHandle::new(conn, &name)
        } else {
            self.clone_from_root(&name).await?
        };

        attach::install_metadata(&engine).await?;
        let replayed = attach::replay(&engine).await;

        let display = if name.is_empty() { "memory".to_string() } else { name };
        let session = Session {
            id: format!("{}-{}", display, session_suffix()),
            database: display,
            user: if user.is_empty() { "tern".to_string() } else { user.to_string() },
            application: application.to_string(),
            engine,
            status: TransactionStatus::Idle,
            queries: 0,
            known_sources: replayed.into_iter().collect(),
            ephemeral,
        };
        tracing::info!(
            session = %session.id,
            database = %session.database,
            user = %session.user,
            application = %session.application,
            "session opened"
        );
        Ok(session)
    }

    /// Clone a handle from the shared root for `name`, opening (or
    /// reopening, if the cached root has died) the store as needed.
    async fn clone_from_root(&self, name: &str) -> Result<EngineHandle> {
        {
            let roots = self.roots.read().await;
            if let Some(root) = roots.get(name) {
                match root.try_clone().await {
                    Ok(handle) => return Ok(handle),
                    Err(e) => {
                        tracing::warn!(database = %name, error = %e, "cached store handle is dead, evicting");
                    }
                }
            }
        }
        let mut roots = self.roots.write().await;
        // Evict a dead root before reopening.
        roots.remove(name);
        let path = self.store_path(name);
        let conn = duckdb::Connection::open(&path)
            .map_err(|e| Error::UnknownDatabase(format!("{name}: {e}")))?;
        let root = EngineHandle::new(conn, name);
        let handle = root.try_clone().await?;
        roots.insert(name.to_string(), root);
        Ok(handle)
    }

    fn store_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(format!("{name}.duckdb"))
    }

    /// Open an independent handle against the same store a session is
    /// routed to, for background work.
    pub async fn background_handle(&self, session: &Session) -> Result<EngineHandle> {
        if session.ephemeral {
            // In-memory stores have no path to reopen; share the
            // instance via clone.
            session.engine.try_clone().await
        } else {
            self.clone_from_root(&session.database).await
        }
    }
}

/// `BEGIN` and synonyms. Starting a transaction while already inside
/// one commits the previous one first; no nested transactions.
pub async fn begin(session: &mut Session) -> Result<String> {
    match session.status {
        TransactionStatus::InTransaction => {
            session.engine.execute("COMMIT", &[]).await.ok();
        }
        TransactionStatus::Errored => {
            session.engine.execute("ROLLBACK", &[]).await.ok();
        }
        TransactionStatus::Idle => {}
    }
    session.engine.execute("BEGIN TRANSACTION", &[]).await?;
    session.status = TransactionStatus::InTransaction;
    Ok("BEGIN".to_string())
}

/// `COMMIT` and synonyms. Committing an errored transaction rolls back
/// instead, matching the server it impersonates.
pub async fn commit(session: &mut Session) -> Result<String> {
    let tag = match session.status {
        TransactionStatus::Errored => {
            session.engine.execute("ROLLBACK", &[]).await.ok();
            "ROLLBACK"
        }
        TransactionStatus::InTransaction => {
            session.engine.execute("COMMIT", &[]).await?;
            "COMMIT"
        }
        // Committing outside a transaction is not an error.
        TransactionStatus::Idle => "COMMIT",
    };
    session.status = TransactionStatus::Idle;
    Ok(tag.to_string())
}

/// `ROLLBACK` and synonyms; "no transaction active" counts as success.
pub async fn rollback(session: &mut Session) -> Result<String> {
    if session.status != TransactionStatus::Idle {
        session.engine.execute("ROLLBACK", &[]).await.ok();
    }
    session.status = TransactionStatus::Idle;
    Ok("ROLLBACK".to_string())
}
