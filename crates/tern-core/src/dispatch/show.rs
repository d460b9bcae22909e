//! `SHOW <setting>` answers.
//!
//! Postgres clients probe a handful of settings right after connecting;
//! these get hand-built single-row answers. Unknown settings fall back
//! to the engine's native SHOW, then to an empty one-column result.

/// Hand-built values for settings the engine has no equivalent of.
/// The column is named after the setting, as the real server does.
pub fn known_setting(name: &str) -> Option<(&'static str, &'static str)> {
    match name.to_ascii_lowercase().as_str() {
        "search_path" => Some(("search_path", "main")),
        "timezone" | "time zone" => Some(("TimeZone", "UTC")),
        "server_version" => Some(("server_version", "16.3")),
        "server_encoding" => Some(("server_encoding", "UTF8")),
        "client_encoding" => Some(("client_encoding", "UTF8")),
        "transaction_isolation" | "transaction isolation level" => {
            Some(("transaction_isolation", "read committed"))
        }
        "standard_conforming_strings" => Some(("standard_conforming_strings", "on")),
        "integer_datetimes" => Some(("integer_datetimes", "on")),
        "datestyle" => Some(("DateStyle", "ISO, MDY")),
        "is_superuser" => Some(("is_superuser", "on")),
        "max_identifier_length" => Some(("max_identifier_length", "63")),
        _ => None,
    }
}

/// The setting name a `SHOW` statement asks for.
pub fn setting_name(sql: &str) -> String {
    sql.trim()
        .trim_end_matches(';')
        .trim()
        .strip_prefix("SHOW")
        .or_else(|| sql.trim().trim_end_matches(';').trim().strip_prefix("show"))
        .or_else(|| sql.trim().trim_end_matches(';').trim().strip_prefix("Show"))
        .unwrap_or("")
        .trim()
        .to_string()
}
