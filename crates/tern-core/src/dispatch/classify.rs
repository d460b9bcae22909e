//! Query classification: an ordered list of predicate/class pairs,
//! first match wins. Each predicate is independently testable; the
//! order is part of the contract.

use std::sync::LazyLock;

use regex::Regex;

use crate::shim;
use crate::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Empty,
    SetReset,
    Show,
    Background,
    Analyze,
    Watch,
    Transaction,
    Attach,
    Catalog,
    Passthrough,
}

static SET_RESET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(SET|RESET)\b").unwrap());

static SHOW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\b").unwrap());

static BACKGROUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*BACKGROUND\b").unwrap());

// Only `ANALYZE '<prompt>' ...` is a directive; bare ANALYZE belongs to
// the engine.
static ANALYZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ANALYZE\s+'").unwrap());

static TRANSACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(BEGIN|COMMIT|END|ROLLBACK|ABORT|START\s+TRANSACTION)\b").unwrap()
});

static ATTACH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(ATTACH|DETACH)\b").unwrap());

type Predicate = fn(&str) -> bool;

/// The decision table. `SHOW WATCHES` belongs to the watch registry,
/// so the SHOW predicate explicitly declines it.
static CLASSIFIERS: &[(QueryClass, Predicate)] = &[
    (QueryClass::Empty, |sql| {
        sql.trim().trim_end_matches(';').trim().is_empty()
    }),
    (QueryClass::SetReset, |sql| SET_RESET.is_match(sql)),
    (QueryClass::Show, |sql| {
        SHOW.is_match(sql) && !watch::is_watch_command(sql)
    }),
    (QueryClass::Background, |sql| BACKGROUND.is_match(sql)),
    (QueryClass::Analyze, |sql| ANALYZE.is_match(sql)),
    (QueryClass::Watch, watch::is_watch_command),
    (QueryClass::Transaction, |sql| TRANSACTION.is_match(sql)),
    (QueryClass::Attach, |sql| ATTACH.is_match(sql)),
    (QueryClass::Catalog, shim::is_catalog_query),
];

pub fn classify(sql: &str) -> QueryClass {
    for (class, predicate) in CLASSIFIERS {
        if predicate(sql) {
            return *class;
        }
    }
    QueryClass::Passthrough
}

/// Statement verbs that can never produce a result set, for Describe.
pub fn is_resultless_command(sql: &str) -> bool {
    static RESULTLESS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)^\s*(SET|RESET|BEGIN|COMMIT|END|ROLLBACK|ABORT|START\s+TRANSACTION|DISCARD|DEALLOCATE|CLOSE|LISTEN|UNLISTEN|NOTIFY)\b",
        )
        .unwrap()
    });
    RESULTLESS.is_match(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_first() {
        assert_eq!(classify(""), QueryClass::Empty);
        assert_eq!(classify("   ;  "), QueryClass::Empty);
    }

    #[test]
    fn test_set_reset() {
        assert_eq!(classify("SET search_path TO main"), QueryClass::SetReset);
        assert_eq!(classify("reset all"), QueryClass::SetReset);
    }

    #[test]
    fn test_show_vs_watch() {
        assert_eq!(classify("SHOW server_version"), QueryClass::Show);
        assert_eq!(classify("SHOW RESULTS"), QueryClass::Show);
        assert_eq!(classify("SHOW WATCHES"), QueryClass::Watch);
    }

    #[test]
    fn test_background_and_analyze() {
        assert_eq!(
            classify("BACKGROUND SELECT * FROM big"),
            QueryClass::Background
        );
        assert_eq!(
            classify("ANALYZE 'what changed?' SELECT * FROM metrics"),
            QueryClass::Analyze
        );
        // Bare ANALYZE is engine maintenance, not a directive.
        assert_eq!(classify("ANALYZE"), QueryClass::Passthrough);
    }

    #[test]
    fn test_transactions() {
        for sql in ["BEGIN", "begin work", "COMMIT", "END", "ROLLBACK", "ABORT", "START TRANSACTION"] {
            assert_eq!(classify(sql), QueryClass::Transaction, "{sql}");
        }
    }

    #[test]
    fn test_attach_detach() {
        assert_eq!(classify("ATTACH 'x.duckdb' AS x"), QueryClass::Attach);
        assert_eq!(classify("DETACH x"), QueryClass::Attach);
    }

    #[test]
    fn test_catalog_and_passthrough() {
        assert_eq!(
            classify("SELECT * FROM pg_catalog.pg_class"),
            QueryClass::Catalog
        );
        assert_eq!(classify("SELECT * FROM users"), QueryClass::Passthrough);
    }

    #[test]
    fn test_first_match_wins() {
        // A catalog-shaped SHOW is still a SHOW.
        assert_eq!(classify("SHOW pg_catalog.something"), QueryClass::Show);
    }

    #[test]
    fn test_resultless_commands() {
        assert!(is_resultless_command("BEGIN"));
        assert!(is_resultless_command("SET x = 1"));
        assert!(is_resultless_command("DEALLOCATE foo"));
        assert!(!is_resultless_command("SELECT 1"));
        assert!(!is_resultless_command("SHOW timezone"));
    }
}
