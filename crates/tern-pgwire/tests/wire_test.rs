//! Wire-level integration tests: a real TCP client speaking protocol
//! 3.0 byte-for-byte against a running server task.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tern_core::cascade::StaticCascade;
use tern_core::telemetry::NoopTelemetry;
use tern_core::{Dispatcher, SessionStore, TernConfig};
use tern_pgwire::{codec, connection, protocol};

async fn start_test_server(data_dir: &std::path::Path) -> u16 {
    let store = Arc::new(SessionStore::new(TernConfig {
        data_dir: data_dir.to_path_buf(),
        ..TernConfig::default()
    }));
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        Arc::new(StaticCascade {
            reply: "ok".to_string(),
        }),
        Arc::new(NoopTelemetry),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let _ = connection::handle_connection(stream, dispatcher).await;
            });
        }
    });
    port
}

fn startup_frame(database: &str, user: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&protocol::PROTOCOL_VERSION_3_0.to_be_bytes());
    payload.extend_from_slice(b"user\0");
    payload.extend_from_slice(user.as_bytes());
    payload.push(0);
    payload.extend_from_slice(b"database\0");
    payload.extend_from_slice(database.as_bytes());
    payload.push(0);
    payload.push(0);
    let mut frame = Vec::new();
    frame.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Collect backend messages until (and including) ReadyForQuery.
async fn read_until_ready(stream: &mut TcpStream) -> Vec<(u8, Vec<u8>)> {
    let mut messages = Vec::new();
    loop {
        let (msg_type, payload) = codec::read_message(stream)
            .await
            .unwrap()
            .expect("server closed unexpectedly");
        let done = msg_type == protocol::MSG_READY_FOR_QUERY;
        messages.push((msg_type, payload));
        if done {
            return messages;
        }
    }
}

async fn connect(port: u16, database: &str) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(&startup_frame(database, "tester"))
        .await
        .unwrap();
    let greeting = read_until_ready(&mut stream).await;
    assert_eq!(greeting[0].0, protocol::MSG_AUTH_REQUEST);
    stream
}

async fn send_simple_query(stream: &mut TcpStream, sql: &str) {
    let mut payload = sql.as_bytes().to_vec();
    payload.push(0);
    stream
        .write_all(&codec::build_message(protocol::MSG_QUERY, &payload))
        .await
        .unwrap();
}

fn ready_status(messages: &[(u8, Vec<u8>)]) -> u8 {
    let (_, payload) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_READY_FOR_QUERY)
        .expect("no ReadyForQuery");
    payload[0]
}

fn row_description_columns(payload: &[u8]) -> Vec<String> {
    let count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut names = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        let end = payload[offset..].iter().position(|&b| b == 0).unwrap() + offset;
        names.push(String::from_utf8_lossy(&payload[offset..end]).into_owned());
        offset = end + 1 + 18; // NUL + fixed per-column trailer
    }
    names
}

fn data_row_cells(payload: &[u8]) -> Vec<Option<String>> {
    let count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut cells = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        let len = i32::from_be_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ]);
        offset += 4;
        if len < 0 {
            cells.push(None);
        } else {
            let len = len as usize;
            cells.push(Some(
                String::from_utf8_lossy(&payload[offset..offset + len]).into_owned(),
            ));
            offset += len;
        }
    }
    cells
}

#[tokio::test]
async fn test_ssl_probe_gets_single_n() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let mut frame = Vec::new();
    frame.extend_from_slice(&8i32.to_be_bytes());
    frame.extend_from_slice(&protocol::SSL_REQUEST_CODE.to_be_bytes());
    stream.write_all(&frame).await.unwrap();

    // Exactly one 'N' before any other server bytes.
    let byte = stream.read_u8().await.unwrap();
    assert_eq!(byte, b'N');

    // The real startup then proceeds normally.
    stream
        .write_all(&startup_frame("default", "tester"))
        .await
        .unwrap();
    let greeting = read_until_ready(&mut stream).await;
    assert_eq!(greeting[0].0, protocol::MSG_AUTH_REQUEST);
    assert_eq!(greeting[0].1, 0i32.to_be_bytes());
    assert_eq!(ready_status(&greeting), b'I');
}

#[tokio::test]
async fn test_scenario_a_select_one_ephemeral() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    send_simple_query(&mut stream, "SELECT 1 AS x").await;
    let messages = read_until_ready(&mut stream).await;

    let (_, desc) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_ROW_DESCRIPTION)
        .expect("no RowDescription");
    assert_eq!(row_description_columns(desc), vec!["x"]);

    let (_, row) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_DATA_ROW)
        .expect("no DataRow");
    assert_eq!(data_row_cells(row), vec![Some("1".to_string())]);

    let (_, complete) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_COMMAND_COMPLETE)
        .expect("no CommandComplete");
    assert_eq!(&complete[..], b"SELECT 1\0");

    assert_eq!(ready_status(&messages), b'I');
}

#[tokio::test]
async fn test_scenario_c_extended_parameter_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    // Parse: one int4 parameter.
    let mut parse = Vec::new();
    parse.extend_from_slice(b"\0SELECT $1::int AS n\0");
    parse.extend_from_slice(&1i16.to_be_bytes());
    parse.extend_from_slice(&(protocol::oid::INT4).to_be_bytes());
    stream
        .write_all(&codec::build_message(protocol::MSG_PARSE, &parse))
        .await
        .unwrap();

    // Bind: text-format "42".
    let mut bind = Vec::new();
    bind.extend_from_slice(b"\0\0"); // unnamed portal, unnamed statement
    bind.extend_from_slice(&0i16.to_be_bytes()); // no format codes (text)
    bind.extend_from_slice(&1i16.to_be_bytes());
    bind.extend_from_slice(&2i32.to_be_bytes());
    bind.extend_from_slice(b"42");
    bind.extend_from_slice(&0i16.to_be_bytes()); // no result formats
    stream
        .write_all(&codec::build_message(protocol::MSG_BIND, &bind))
        .await
        .unwrap();

    // Describe the portal, Execute, Sync.
    stream
        .write_all(&codec::build_message(protocol::MSG_DESCRIBE, b"P\0"))
        .await
        .unwrap();
    let mut execute = b"\0".to_vec();
    execute.extend_from_slice(&0i32.to_be_bytes());
    stream
        .write_all(&codec::build_message(protocol::MSG_EXECUTE, &execute))
        .await
        .unwrap();
    stream
        .write_all(&codec::build_message(protocol::MSG_SYNC, &[]))
        .await
        .unwrap();

    let messages = read_until_ready(&mut stream).await;
    let types: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
    assert!(types.contains(&protocol::MSG_PARSE_COMPLETE));
    assert!(types.contains(&protocol::MSG_BIND_COMPLETE));

    // Exactly one RowDescription (from Describe; Execute must not
    // resend a matching shape).
    let descriptions: Vec<&(u8, Vec<u8>)> = messages
        .iter()
        .filter(|(t, _)| *t == protocol::MSG_ROW_DESCRIPTION)
        .collect();
    assert_eq!(descriptions.len(), 1);
    let columns = row_description_columns(&descriptions[0].1);
    assert_eq!(columns, vec!["n"]);

    // DataRow cell count equals the described column count.
    let (_, row) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_DATA_ROW)
        .expect("no DataRow");
    let cells = data_row_cells(row);
    assert_eq!(cells.len(), columns.len());
    assert_eq!(cells, vec![Some("42".to_string())]);

    assert_eq!(ready_status(&messages), b'I');
}

#[tokio::test]
async fn test_scenario_d_transaction_status_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    send_simple_query(&mut stream, "BEGIN").await;
    let messages = read_until_ready(&mut stream).await;
    assert_eq!(ready_status(&messages), b'T');

    // Status stays T while the transaction is healthy.
    send_simple_query(&mut stream, "SELECT 1").await;
    let messages = read_until_ready(&mut stream).await;
    assert_eq!(ready_status(&messages), b'T');

    // A failing statement flips to E.
    send_simple_query(&mut stream, "SELECT * FROM table_that_is_not_there").await;
    let messages = read_until_ready(&mut stream).await;
    assert!(messages
        .iter()
        .any(|(t, _)| *t == protocol::MSG_ERROR_RESPONSE));
    assert_eq!(ready_status(&messages), b'E');

    // Rollback returns to I.
    send_simple_query(&mut stream, "ROLLBACK").await;
    let messages = read_until_ready(&mut stream).await;
    assert_eq!(ready_status(&messages), b'I');
}

#[tokio::test]
async fn test_empty_query_response() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    send_simple_query(&mut stream, "   ").await;
    let messages = read_until_ready(&mut stream).await;
    assert!(messages.iter().any(|(t, _)| *t == protocol::MSG_EMPTY_QUERY));
}

#[tokio::test]
async fn test_missing_catalog_table_shape() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    send_simple_query(&mut stream, "SELECT oid, locktype FROM pg_locks").await;
    let messages = read_until_ready(&mut stream).await;

    // Never an execution error: zero rows with exactly the asked-for
    // columns.
    assert!(!messages
        .iter()
        .any(|(t, _)| *t == protocol::MSG_ERROR_RESPONSE));
    let (_, desc) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_ROW_DESCRIPTION)
        .expect("no RowDescription");
    assert_eq!(row_description_columns(desc), vec!["oid", "locktype"]);
    assert!(!messages.iter().any(|(t, _)| *t == protocol::MSG_DATA_ROW));
}

#[tokio::test]
async fn test_extended_error_waits_for_sync() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    // Bind against a statement that was never parsed.
    let mut bind = Vec::new();
    bind.extend_from_slice(b"\0ghost\0");
    bind.extend_from_slice(&0i16.to_be_bytes());
    bind.extend_from_slice(&0i16.to_be_bytes());
    bind.extend_from_slice(&0i16.to_be_bytes());
    stream
        .write_all(&codec::build_message(protocol::MSG_BIND, &bind))
        .await
        .unwrap();
    // This Execute must be discarded, not answered.
    let mut execute = b"\0".to_vec();
    execute.extend_from_slice(&0i32.to_be_bytes());
    stream
        .write_all(&codec::build_message(protocol::MSG_EXECUTE, &execute))
        .await
        .unwrap();
    stream
        .write_all(&codec::build_message(protocol::MSG_SYNC, &[]))
        .await
        .unwrap();

    let messages = read_until_ready(&mut stream).await;
    let types: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
    assert_eq!(types[0], protocol::MSG_ERROR_RESPONSE);
    // Only the error then ReadyForQuery: nothing for the Execute.
    assert_eq!(types.last(), Some(&protocol::MSG_READY_FOR_QUERY));
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == protocol::MSG_ERROR_RESPONSE)
            .count(),
        1
    );

    // The connection is still usable afterwards.
    send_simple_query(&mut stream, "SELECT 1 AS ok").await;
    let messages = read_until_ready(&mut stream).await;
    assert!(messages
        .iter()
        .any(|(t, _)| *t == protocol::MSG_DATA_ROW));
}

#[tokio::test]
async fn test_unknown_message_type_keeps_connection() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    stream
        .write_all(&codec::build_message(b'W', b"junk"))
        .await
        .unwrap();
    let messages = read_until_ready(&mut stream).await;
    assert!(messages
        .iter()
        .any(|(t, _)| *t == protocol::MSG_ERROR_RESPONSE));

    send_simple_query(&mut stream, "SELECT 2 AS still_here").await;
    let messages = read_until_ready(&mut stream).await;
    let (_, row) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_DATA_ROW)
        .unwrap();
    assert_eq!(data_row_cells(row), vec![Some("2".to_string())]);
}

#[tokio::test]
async fn test_show_roundtrip_and_close_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    send_simple_query(&mut stream, "SHOW server_version").await;
    let messages = read_until_ready(&mut stream).await;
    let (_, row) = messages
        .iter()
        .find(|(t, _)| *t == protocol::MSG_DATA_ROW)
        .unwrap();
    assert_eq!(data_row_cells(row), vec![Some("16.3".to_string())]);

    // Closing an unknown portal still answers CloseComplete.
    stream
        .write_all(&codec::build_message(protocol::MSG_CLOSE, b"P\0never\0"))
        .await
        .unwrap();
    let (msg_type, _) = codec::read_message(&mut stream).await.unwrap().unwrap();
    assert_eq!(msg_type, protocol::MSG_CLOSE_COMPLETE);
}

#[tokio::test]
async fn test_terminate_closes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    stream
        .write_all(&codec::build_message(protocol::MSG_TERMINATE, &[]))
        .await
        .unwrap();
    // Server closes without a response.
    assert!(codec::read_message(&mut stream).await.unwrap().is_none());
}

#[tokio::test]
async fn test_max_rows_truncates_execute() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_test_server(dir.path()).await;
    let mut stream = connect(port, "default").await;

    send_simple_query(&mut stream, "CREATE TABLE many (v INTEGER)").await;
    read_until_ready(&mut stream).await;
    send_simple_query(&mut stream, "INSERT INTO many SELECT * FROM range(10)").await;
    read_until_ready(&mut stream).await;

    let mut parse = Vec::new();
    parse.extend_from_slice(b"\0SELECT v FROM many ORDER BY v\0");
    parse.extend_from_slice(&0i16.to_be_bytes());
    stream
        .write_all(&codec::build_message(protocol::MSG_PARSE, &parse))
        .await
        .unwrap();
    let mut bind = Vec::new();
    bind.extend_from_slice(b"\0\0");
    bind.extend_from_slice(&0i16.to_be_bytes());
    bind.extend_from_slice(&0i16.to_be_bytes());
    bind.extend_from_slice(&0i16.to_be_bytes());
    stream
        .write_all(&codec::build_message(protocol::MSG_BIND, &bind))
        .await
        .unwrap();
    let mut execute = b"\0".to_vec();
    execute.extend_from_slice(&3i32.to_be_bytes());
    stream
        .write_all(&codec::build_message(protocol::MSG_EXECUTE, &execute))
        .await
        .unwrap();
    stream
        .write_all(&codec::build_message(protocol::MSG_SYNC, &[]))
        .await
        .unwrap();

    let messages = read_until_ready(&mut stream).await;
    let data_rows = messages
        .iter()
        .filter(|(t, _)| *t == protocol::MSG_DATA_ROW)
        .count();
    assert_eq!(data_rows, 3);
}
