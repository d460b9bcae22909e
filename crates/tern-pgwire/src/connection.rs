//! Per-connection lifecycle: SSL probe, startup, the message loop, and
//! cleanup.
//!
//! Messages are dispatched strictly by their type byte. Extended-
//! protocol errors withhold ReadyForQuery until the client's Sync;
//! Simple Query always ends with ReadyForQuery carrying the session's
//! transaction status.

use std::sync::Arc;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use tern_core::attach;
use tern_core::dispatch::{Dispatched, Dispatcher};
use tern_core::error::Error;
use tern_core::session::TransactionStatus;
use tern_core::shim::{self, scanner};
use tern_core::Session;

use crate::codec::{self, Startup};
use crate::portal::{self, PortalRegistry};
use crate::protocol;

/// SQLSTATE for a dispatch error.
fn sqlstate_for(error: &Error) -> &'static str {
    match error {
        Error::UnknownStatement(_) => protocol::SQLSTATE_INVALID_STATEMENT,
        Error::UnknownPortal(_) => protocol::SQLSTATE_INVALID_CURSOR,
        Error::Bind(_) => protocol::SQLSTATE_PROTOCOL_VIOLATION,
        _ => protocol::SQLSTATE_INTERNAL_ERROR,
    }
}

/// Handle one client connection end to end.
pub async fn handle_connection(
    mut stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<()> {
    // SSL probe(s) first: answer 'N' and re-read the startup frame.
    let params = loop {
        match codec::read_startup(&mut stream).await? {
            Startup::SslProbe => stream.write_all(b"N").await?,
            Startup::Cancel | Startup::Eof => return Ok(()),
            Startup::Params(params) => break params,
        }
    };

    // Different client libraries spell the startup keys differently.
    let database = lookup_param(&params, &["database", "dbname"]).unwrap_or_default();
    let user = lookup_param(&params, &["user", "username"]).unwrap_or_default();
    let application = lookup_param(
        &params,
        &["application_name", "app_name", "fallback_application_name"],
    )
    .unwrap_or_default();

    let mut session = match dispatcher.store().open(&database, &user, &application).await {
        Ok(session) => session,
        Err(e) => {
            let frames = [codec::error_response(
                protocol::SQLSTATE_INTERNAL_ERROR,
                &format!("could not open database \"{database}\": {e}"),
                None,
            )];
            codec::send(&mut stream, &frames).await?;
            return Ok(());
        }
    };

    let greeting = [
        codec::authentication_ok(),
        codec::parameter_status("server_version", "16.3"),
        codec::parameter_status("server_encoding", "UTF8"),
        codec::parameter_status("client_encoding", "UTF8"),
        codec::parameter_status("application_name", &session.application),
        codec::parameter_status("DateStyle", "ISO, MDY"),
        codec::parameter_status("integer_datetimes", "on"),
        codec::parameter_status("standard_conforming_strings", "on"),
        codec::parameter_status("TimeZone", "UTC"),
        codec::parameter_status("is_superuser", "on"),
        codec::backend_key_data(std::process::id() as i32, rand::thread_rng().r#gen::<i32>()),
        codec::ready_for_query(session.status.byte()),
    ];
    codec::send(&mut stream, &greeting).await?;

    let mut portals = PortalRegistry::new();
    // Set after an extended-protocol error; further extended messages
    // are discarded until the client's Sync.
    let mut extended_error = false;

    while let Some((msg_type, payload)) = codec::read_message(&mut stream).await? {
        match msg_type {
            protocol::MSG_QUERY => {
                let sql = String::from_utf8_lossy(&payload)
                    .trim_end_matches('\0')
                    .to_string();
                simple_query(&mut stream, &dispatcher, &mut session, &sql).await?;
            }
            protocol::MSG_TERMINATE => break,
            protocol::MSG_SYNC => {
                extended_error = false;
                codec::send(&mut stream, &[codec::ready_for_query(session.status.byte())])
                    .await?;
            }
            protocol::MSG_FLUSH => stream.flush().await?,
            protocol::MSG_PARSE
            | protocol::MSG_BIND
            | protocol::MSG_DESCRIBE
            | protocol::MSG_EXECUTE
            | protocol::MSG_CLOSE
                if extended_error => {}
            protocol::MSG_PARSE => {
                if let Err(e) = handle_parse(&mut stream, &mut portals, &session, &payload).await? {
                    extended_error =
                        report_extended_error(&mut stream, &mut session, e).await?;
                }
            }
            protocol::MSG_BIND => {
                if let Err(e) = handle_bind(&mut stream, &mut portals, &payload).await? {
                    extended_error =
                        report_extended_error(&mut stream, &mut session, e).await?;
                }
            }
            protocol::MSG_DESCRIBE => {
                if let Err(e) =
                    handle_describe(&mut stream, &mut portals, &session, &payload).await?
                {
                    extended_error =
                        report_extended_error(&mut stream, &mut session, e).await?;
                }
            }
            protocol::MSG_EXECUTE => {
                if let Err(e) =
                    handle_execute(&mut stream, &dispatcher, &mut portals, &mut session, &payload)
                        .await?
                {
                    extended_error =
                        report_extended_error(&mut stream, &mut session, e).await?;
                }
            }
            protocol::MSG_CLOSE => {
                let (kind, name) = codec::parse_target(&payload);
                match kind {
                    b'S' => portals.close_statement(&name),
                    _ => portals.close_portal(&name),
                }
                codec::send(&mut stream, &[codec::close_complete()]).await?;
            }
            protocol::MSG_PASSWORD => {
                // Authentication accepts any credentials; a stray
                // password message is harmless.
            }
            other => {
                let frames = [
                    codec::error_response(
                        protocol::SQLSTATE_PROTOCOL_VIOLATION,
                        &format!("unsupported message type: {}", other as char),
                        None,
                    ),
                    codec::ready_for_query(session.status.byte()),
                ];
                codec::send(&mut stream, &frames).await?;
            }
        }
    }

    // Best-effort rollback; "no transaction active" is success, and the
    // shared store root stays open for sibling connections.
    if session.status != TransactionStatus::Idle {
        let _ = session.engine.execute("ROLLBACK", &[]).await;
    }
    tracing::debug!(session = %session.id, queries = session.queries, "connection closed");
    Ok(())
}

fn lookup_param(
    params: &std::collections::HashMap<String, String>,
    keys: &[&str],
) -> Option<String> {
    keys.iter()
        .find_map(|k| params.get(*k))
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Send an ErrorResponse for an extended-protocol failure and flip the
/// transaction status. ReadyForQuery is withheld until Sync.
async fn report_extended_error(
    stream: &mut TcpStream,
    session: &mut Session,
    error: Error,
) -> std::io::Result<bool> {
    if session.status == TransactionStatus::InTransaction {
        session.status = TransactionStatus::Errored;
    }
    let frames = [codec::error_response(
        sqlstate_for(&error),
        &error.to_string(),
        None,
    )];
    codec::send(stream, &frames).await?;
    Ok(true)
}

async fn simple_query(
    stream: &mut TcpStream,
    dispatcher: &Dispatcher,
    session: &mut Session,
    sql: &str,
) -> std::io::Result<()> {
    tracing::debug!(session = %session.id, query = %sql.chars().take(120).collect::<String>(), "simple query");
    match dispatcher.dispatch(session, sql).await {
        Ok(Dispatched::Empty) => {
            codec::send(stream, &[codec::empty_query_response()]).await?;
        }
        Ok(Dispatched::Output(output)) => {
            let mut frames = Vec::with_capacity(output.rows.len() + 2);
            if !output.columns.is_empty() {
                frames.push(codec::row_description(&output.columns));
                for row in &output.rows {
                    frames.push(codec::data_row(row));
                }
            }
            frames.push(codec::command_complete(&output.command_tag()));
            codec::send(stream, &frames).await?;
        }
        Err(e) => {
            if session.status == TransactionStatus::InTransaction {
                session.status = TransactionStatus::Errored;
            }
            // Simple-query errors carry the debug chain in the detail
            // field; extended-protocol ones stay terse.
            let frames = [codec::error_response(
                sqlstate_for(&e),
                &e.to_string(),
                Some(&format!("{e:?}")),
            )];
            codec::send(stream, &frames).await?;
        }
    }
    codec::send(stream, &[codec::ready_for_query(session.status.byte())]).await
}

/// Wire errors abort the connection (outer `Result`); protocol errors
/// are reported to the client and wait for Sync (inner `Result`).
type Handled = std::io::Result<Result<(), Error>>;

async fn handle_parse(
    stream: &mut TcpStream,
    portals: &mut PortalRegistry,
    session: &Session,
    payload: &[u8],
) -> Handled {
    let Some((name, query, oids)) = codec::parse_parse(payload) else {
        return Ok(Err(Error::Internal("malformed Parse message".to_string())));
    };
    tracing::debug!(statement = %name, query = %query.chars().take(120).collect::<String>(), "parse");
    portals.parse(name, query, oids, &session.shim_context());
    codec::send(stream, &[codec::parse_complete()]).await?;
    Ok(Ok(()))
}

async fn handle_bind(
    stream: &mut TcpStream,
    portals: &mut PortalRegistry,
    payload: &[u8],
) -> Handled {
    let Some(message) = codec::parse_bind(payload) else {
        return Ok(Err(Error::Internal("malformed Bind message".to_string())));
    };
    if let Err(e) = portals.bind(message) {
        return Ok(Err(e));
    }
    codec::send(stream, &[codec::bind_complete()]).await?;
    Ok(Ok(()))
}

async fn handle_describe(
    stream: &mut TcpStream,
    portals: &mut PortalRegistry,
    session: &Session,
    payload: &[u8],
) -> Handled {
    let (kind, name) = codec::parse_target(payload);
    if kind == b'S' {
        let statement = match portals.statement(&name) {
            Ok(s) => s,
            Err(e) => return Ok(Err(e)),
        };
        // Column shape is unknown without executing; this server never
        // speculatively executes for a statement Describe.
        let mut oids = statement.param_oids.clone();
        oids.resize(statement.expected_params(), 0);
        let frames = [codec::parameter_description(&oids), codec::no_data()];
        codec::send(stream, &frames).await?;
        return Ok(Ok(()));
    }

    let portal = match portals.portal(&name) {
        Ok(p) => p.clone(),
        Err(e) => return Ok(Err(e)),
    };
    match portal::describe_portal_columns(session, &portal).await {
        Some(columns) => {
            portals.record_described(&name, columns.len());
            codec::send(stream, &[codec::row_description(&columns)]).await?;
        }
        None => {
            codec::send(stream, &[codec::no_data()]).await?;
        }
    }
    Ok(Ok(()))
}

async fn handle_execute(
    stream: &mut TcpStream,
    dispatcher: &Dispatcher,
    portals: &mut PortalRegistry,
    session: &mut Session,
    payload: &[u8],
) -> Handled {
    let (name, max_rows) = codec::parse_execute(payload);
    let portal = match portals.portal(&name) {
        Ok(p) => p.clone(),
        Err(e) => return Ok(Err(e)),
    };
    tracing::debug!(portal = %name, max_rows, "execute");

    let dispatched = match execute_portal(dispatcher, session, &portal).await {
        Ok(d) => d,
        Err(e) => {
            if session.status == TransactionStatus::InTransaction {
                session.status = TransactionStatus::Errored;
            }
            return Ok(Err(e));
        }
    };

    let mut output = match dispatched {
        Dispatched::Empty => {
            codec::send(stream, &[codec::empty_query_response()]).await?;
            return Ok(Ok(()));
        }
        Dispatched::Output(output) => output,
    };

    if max_rows > 0 && output.rows.len() > max_rows as usize {
        // No cursor model: truncate, and a re-Execute replays.
        output.rows.truncate(max_rows as usize);
    }

    let mut frames = Vec::with_capacity(output.rows.len() + 2);
    match portal.described_columns {
        // Describe promised this exact shape; do not resend.
        Some(n) if n == output.columns.len() => {}
        // Mismatch with the described count: resend a corrected
        // RowDescription before any DataRow, never silently diverge.
        Some(n) => {
            tracing::warn!(
                portal = %name,
                described = n,
                actual = output.columns.len(),
                "column count changed between Describe and Execute, resending RowDescription"
            );
            frames.push(codec::row_description(&output.columns));
        }
        None => {
            if !output.columns.is_empty() {
                frames.push(codec::row_description(&output.columns));
            }
        }
    }
    for row in &output.rows {
        frames.push(codec::data_row(row));
    }
    frames.push(codec::command_complete(&output.command_tag()));
    codec::send(stream, &frames).await?;
    Ok(Ok(()))
}

/// Run a portal. Parameterless portals go through the full dispatcher
/// (directives, catalog shim, telemetry); parameterized ones execute
/// their pre-rewritten text directly, with the shim's empty-shape
/// fallback for catalog shapes.
async fn execute_portal(
    dispatcher: &Dispatcher,
    session: &mut Session,
    portal: &portal::Portal,
) -> Result<Dispatched, Error> {
    if portal.params.is_empty() {
        return dispatcher.dispatch(session, &portal.original).await;
    }
    session.queries += 1;
    let masked = scanner::mask_sql(&portal.sql);
    attach::lazy_attach(&session.engine, &masked).await;
    match session.engine.execute(&portal.sql, &portal.params).await {
        Ok(output) => Ok(Dispatched::Output(output)),
        Err(e) if shim::is_catalog_query(&portal.original) => {
            tracing::debug!(error = %e, "parameterized catalog query failed, returning empty shape");
            Ok(Dispatched::Output(shim::empty_shape(&portal.original)))
        }
        Err(e) => Err(e),
    }
}
