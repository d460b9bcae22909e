//! PostgreSQL wire protocol constants (protocol version 3.0).
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

/// Protocol version 3.0, encoded as (major << 16) | minor.
pub const PROTOCOL_VERSION_3_0: i32 = 196608;

/// Sent in place of a StartupMessage to request SSL.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Sent on a separate connection to cancel a running query.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// Frontend message types (client -> server)
pub const MSG_QUERY: u8 = b'Q';
pub const MSG_TERMINATE: u8 = b'X';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_BIND: u8 = b'B';
pub const MSG_DESCRIBE: u8 = b'D';
pub const MSG_EXECUTE: u8 = b'E';
pub const MSG_CLOSE: u8 = b'C';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_FLUSH: u8 = b'H';
pub const MSG_PASSWORD: u8 = b'p';

// Backend message types (server -> client)
pub const MSG_AUTH_REQUEST: u8 = b'R';
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';
pub const MSG_PARAMETER_STATUS: u8 = b'S';
pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_ROW_DESCRIPTION: u8 = b'T';
pub const MSG_DATA_ROW: u8 = b'D';
pub const MSG_COMMAND_COMPLETE: u8 = b'C';
pub const MSG_EMPTY_QUERY: u8 = b'I';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_NOTICE_RESPONSE: u8 = b'N';
pub const MSG_PARSE_COMPLETE: u8 = b'1';
pub const MSG_BIND_COMPLETE: u8 = b'2';
pub const MSG_CLOSE_COMPLETE: u8 = b'3';
pub const MSG_NO_DATA: u8 = b'n';
pub const MSG_PARAMETER_DESCRIPTION: u8 = b't';

// SQLSTATE codes for proxy-generated errors
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";
pub const SQLSTATE_INVALID_CURSOR: &str = "34000";
pub const SQLSTATE_INVALID_STATEMENT: &str = "26000";

/// Largest frame body the server will accept.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Largest startup payload (per the real server's sanity bound).
pub const MAX_STARTUP_LEN: usize = 10240;

/// Parameter type OIDs used when decoding Bind values.
pub mod oid {
    pub const BOOL: i32 = 16;
    pub const INT8: i32 = 20;
    pub const INT2: i32 = 21;
    pub const INT4: i32 = 23;
    pub const TEXT: i32 = 25;
    pub const FLOAT4: i32 = 700;
    pub const FLOAT8: i32 = 701;
    pub const VARCHAR: i32 = 1043;
}
