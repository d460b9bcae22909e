//! Core of Tern: an embedded DuckDB analytics engine dressed up as a
//! PostgreSQL server.
//!
//! This crate owns everything between the wire protocol and the engine:
//!
//! - [`engine`]: locked execution handles and dynamic result conversion
//! - [`session`]: database routing, shared-store registry, transactions
//! - [`shim`]: the catalog compatibility layer for Postgres
//!   introspection queries
//! - [`dispatch`]: the per-query decision tree (directives, transaction
//!   control, catalog interception, passthrough)
//! - [`jobs`]: background execution with persisted job records
//! - [`attach`] / [`materialize`]: replayable attachments, exposure
//!   views, and result insurance
//! - [`cascade`] / [`telemetry`] / [`watch`]: the external collaborator
//!   seams
//!
//! The wire protocol itself lives in `tern-pgwire`.

pub mod attach;
pub mod cascade;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod materialize;
pub mod session;
pub mod shim;
pub mod telemetry;
pub mod watch;

pub use config::TernConfig;
pub use dispatch::{Dispatched, Dispatcher};
pub use engine::{Column, EngineHandle, PgType, QueryOutput};
pub use error::{Error, Result};
pub use session::{Session, SessionStore, TransactionStatus};
