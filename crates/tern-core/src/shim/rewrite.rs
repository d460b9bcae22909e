//! The catalog rewrite pipeline.
//!
//! Seven ordered passes turn Postgres-flavored introspection SQL into
//! something the engine can run. Every pass matches against the masked
//! text from [`scanner`], so string literals and comments are never
//! touched, and every pass is idempotent: running the pipeline twice
//! yields the same text as running it once.

use std::sync::LazyLock;

use regex::Regex;

use super::registry;
use super::scanner::{
    apply_edits, find_word, mask_sql, matching_paren, select_list_span, word_at, Edit,
};

/// Session facts the rewrites need.
#[derive(Debug, Clone)]
pub struct ShimContext {
    /// Logical catalog name of the session's database.
    pub database: String,
    /// User name reported at startup.
    pub user: String,
}

impl Default for ShimContext {
    fn default() -> Self {
        ShimContext {
            database: "memory".to_string(),
            user: "tern".to_string(),
        }
    }
}

static QUALIFIED_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bpg_catalog\.([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap()
});

static LEFT_JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bLEFT\s+(?:OUTER\s+)?JOIN\s+(?:pg_catalog\.)?([A-Za-z_][A-Za-z0-9_]*)(\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?\s+ON\b",
    )
    .unwrap()
});

static REG_CAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)::\s*(?:regclass|regprocedure|regproc|regtype|regnamespace|regoper|regoperator|regconfig|regdictionary|oid)\b",
    )
    .unwrap()
});

static INFORMATION_SCHEMA_VIEW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\binformation_schema\.([A-Za-z_]+)\b").unwrap());

/// Apply the full pipeline in its fixed order.
pub fn apply_pipeline(sql: &str, ctx: &ShimContext) -> String {
    let mut out = strip_function_qualification(sql);
    out = rewrite_constant_columns(&out);
    out = strip_missing_left_joins(&out);
    out = replace_decompiler_functions(&out);
    out = replace_inherits_subqueries(&out);
    out = restrict_information_schema(&out, ctx);
    out = strip_reg_casts(&out);
    out
}

/// Pass 1: `pg_catalog.foo(` → `foo(`.
pub fn strip_function_qualification(sql: &str) -> String {
    let masked = mask_sql(sql);
    let mut edits = Vec::new();
    for caps in QUALIFIED_FUNCTION.captures_iter(&masked) {
        let whole = caps.get(0).unwrap();
        let name = caps.get(1).unwrap();
        edits.push(Edit {
            start: whole.start(),
            end: name.start(),
            text: String::new(),
        });
    }
    apply_edits(sql, edits)
}

/// True when the word ending right before `pos` (skipping spaces) is `AS`.
fn preceded_by_as(masked: &str, pos: usize) -> bool {
    let bytes = masked.as_bytes();
    let mut i = pos;
    while i > 0 && bytes[i - 1].is_ascii_whitespace() {
        i -= 1;
    }
    i >= 2 && masked[..i].to_ascii_uppercase().ends_with("AS")
        && (i == 2 || !super::scanner::is_word_byte(bytes[i - 3]))
}

/// Replace a column token with a constant, aliasing it back to its own
/// name when it stands in the SELECT list.
fn constant_column_edits(
    masked: &str,
    column: &str,
    literal: &str,
    edits: &mut Vec<Edit>,
) {
    let pattern = Regex::new(&format!(
        r"(?i)\b(?:[A-Za-z_][A-Za-z0-9_]*\.)?({column})\b"
    ))
    .unwrap();
    let select_span = select_list_span(masked);
    for caps in pattern.captures_iter(masked) {
        let whole = caps.get(0).unwrap();
        // Already-rewritten alias (`0 AS xmin`) or qualified-something we
        // produced earlier: leave alone for idempotence.
        if preceded_by_as(masked, whole.start()) {
            continue;
        }
        let in_select = select_span
            .map(|(s, e)| whole.start() >= s && whole.end() <= e)
            .unwrap_or(false);
        let text = if in_select {
            format!("{literal} AS {column}")
        } else {
            literal.to_string()
        };
        edits.push(Edit {
            start: whole.start(),
            end: whole.end(),
            text,
        });
    }
}

/// Pass 2: pseudo system columns and known-missing catalog columns
/// become constants of the right type.
pub fn rewrite_constant_columns(sql: &str) -> String {
    let masked = mask_sql(sql);
    let lowered = masked.to_ascii_lowercase();
    let mut edits = Vec::new();

    for (column, literal) in registry::SYSTEM_COLUMNS {
        if lowered.contains(column) {
            constant_column_edits(&masked, column, literal, &mut edits);
        }
    }
    for (table, column, literal) in registry::MISSING_COLUMNS {
        // Only fire when the owning table is actually in play.
        if lowered.contains(table) && lowered.contains(column) {
            constant_column_edits(&masked, column, literal, &mut edits);
        }
    }
    apply_edits(sql, edits)
}

/// Keywords that terminate a join's ON-condition at paren depth zero.
const JOIN_TERMINATORS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "WINDOW", "UNION", "INTERSECT", "EXCEPT",
    "LEFT", "RIGHT", "INNER", "FULL", "CROSS", "JOIN",
];

/// End of the ON-condition that starts at `from` (just past `ON`).
fn on_condition_end(masked: &str, from: usize) -> usize {
    let bytes = masked.as_bytes();
    let mut depth = 0i32;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                if depth == 0 {
                    return i;
                }
                depth -= 1;
            }
            b';' if depth == 0 => return i,
            _ if depth == 0 => {
                for kw in JOIN_TERMINATORS {
                    if word_at(masked, i, kw) {
                        return i;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    bytes.len()
}

/// Pass 3: drop `LEFT JOIN <missing catalog table> alias ON (...)`
/// clauses, turning the alias's column references into NULL. The rest of
/// the query, including a trailing WHERE across any number of lines, is
/// left intact.
pub fn strip_missing_left_joins(sql: &str) -> String {
    let mut out = sql.to_string();
    // One join per iteration; offsets shift after each splice.
    for _ in 0..32 {
        let masked = mask_sql(&out);
        let Some(caps) = LEFT_JOIN
            .captures_iter(&masked)
            .find(|c| registry::is_missing_table(&c[1]))
        else {
            break;
        };
        let whole = caps.get(0).unwrap();
        let table = caps.get(1).unwrap().as_str().to_string();
        let alias = caps
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| table.clone());
        let cond_end = on_condition_end(&masked, whole.end());

        let mut edits = vec![Edit {
            start: whole.start(),
            end: cond_end,
            text: String::new(),
        }];

        // alias.column → NULL (aliased back in the SELECT list).
        let refs = Regex::new(&format!(
            r"(?i)\b{}\.([A-Za-z_][A-Za-z0-9_]*)\b",
            regex::escape(&alias)
        ))
        .unwrap();
        let select_span = select_list_span(&masked);
        for rcaps in refs.captures_iter(&masked) {
            let m = rcaps.get(0).unwrap();
            if m.start() >= whole.start() && m.end() <= cond_end {
                continue; // inside the join being removed
            }
            let in_select = select_span
                .map(|(s, e)| m.start() >= s && m.end() <= e)
                .unwrap_or(false);
            let text = if in_select && !super::scanner::word_at(&masked, m.start(), "NULL") {
                format!("NULL AS {}", &rcaps[1])
            } else {
                "NULL".to_string()
            };
            edits.push(Edit {
                start: m.start(),
                end: m.end(),
                text,
            });
        }
        out = apply_edits(&out, edits);
    }
    out
}

/// Pass 4: decompiler functions (`pg_get_expr` and friends) have no
/// engine equivalent and no meaningful substitute; each call collapses
/// to a typed NULL.
pub fn replace_decompiler_functions(sql: &str) -> String {
    let mut out = sql.to_string();
    for _ in 0..64 {
        let masked = mask_sql(&out);
        let mut replaced = false;
        for name in registry::DECOMPILER_FUNCTIONS {
            let pat = Regex::new(&format!(r"(?i)\b{name}\s*\(")).unwrap();
            if let Some(m) = pat.find(&masked) {
                let open = m.end() - 1;
                let close = match matching_paren(&masked, open) {
                    Some(c) => c,
                    None => m.end(),
                };
                out = apply_edits(
                    &out,
                    vec![Edit {
                        start: m.start(),
                        end: close + 1,
                        text: "CAST(NULL AS VARCHAR)".to_string(),
                    }],
                );
                replaced = true;
                break;
            }
        }
        if !replaced {
            break;
        }
    }
    out
}

/// Innermost parenthesized span containing `pos` whose first token is
/// SELECT, i.e. the enclosing subquery.
fn enclosing_subquery(masked: &str, pos: usize) -> Option<(usize, usize)> {
    let bytes = masked.as_bytes();
    let mut stack: Vec<usize> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => stack.push(i),
            b')' => {
                if let Some(open) = stack.pop() {
                    if open < pos && i > pos {
                        spans.push((open, i));
                    }
                }
            }
            _ => {}
        }
    }
    // Innermost first.
    spans.sort_by_key(|(open, close)| close - open);
    spans.into_iter().find(|(open, _)| {
        let mut j = open + 1;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        word_at(masked, j, "SELECT")
    })
}

/// Pass 5: correlated subqueries against `pg_inherits` become an
/// always-empty subquery in IN/EXISTS position and a scalar NULL when
/// projected. Context comes from the ~30 characters before the opening
/// paren.
pub fn replace_inherits_subqueries(sql: &str) -> String {
    let mut out = sql.to_string();
    for _ in 0..16 {
        let masked = mask_sql(&out);
        let Some(pos) = find_word(&masked.to_ascii_lowercase(), "pg_inherits", 0) else {
            break;
        };
        let Some((open, close)) = enclosing_subquery(&masked, pos) else {
            break; // primary FROM; the short-circuit path owns this case
        };
        let lead_start = open.saturating_sub(30);
        let lead = masked[lead_start..open].to_ascii_uppercase();
        let is_membership = lead
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .rev()
            .find(|w| !w.is_empty())
            .map(|w| w == "IN" || w == "EXISTS" || w == "ANY" || w == "ALL")
            .unwrap_or(false);
        let text = if is_membership {
            "(SELECT NULL WHERE 1=0)".to_string()
        } else {
            "(NULL)".to_string()
        };
        out = apply_edits(
            &out,
            vec![Edit {
                start: open,
                end: close + 1,
                text,
            }],
        );
    }
    out
}

/// Pass 6: pin information_schema views to the session's catalog so
/// attached external catalogs do not leak into listings.
pub fn restrict_information_schema(sql: &str, ctx: &ShimContext) -> String {
    let masked = mask_sql(sql);
    let Some(caps) = INFORMATION_SCHEMA_VIEW.captures(&masked) else {
        return sql.to_string();
    };
    let view = caps[1].to_ascii_lowercase();
    let column = if view == "schemata" {
        "catalog_name"
    } else {
        "table_catalog"
    };
    let predicate = format!("{} = '{}'", column, ctx.database);
    if sql.contains(&predicate) {
        return sql.to_string(); // already pinned
    }

    let upper = masked.to_ascii_uppercase();
    if let Some(where_pos) = top_level_keyword(&masked, &upper, "WHERE", caps.get(0).unwrap().end())
    {
        let insert_at = where_pos + "WHERE".len();
        let tail_end = ["GROUP", "ORDER", "LIMIT", "HAVING", "UNION"]
            .iter()
            .filter_map(|kw| top_level_keyword(&masked, &upper, kw, insert_at))
            .min()
            .unwrap_or_else(|| sql.trim_end().trim_end_matches(';').len());
        let mut out = sql.to_string();
        out.insert(tail_end, ')');
        out.insert_str(insert_at, &format!(" {predicate} AND ("));
        out
    } else {
        let tail_end = ["GROUP", "ORDER", "LIMIT", "HAVING", "UNION"]
            .iter()
            .filter_map(|kw| top_level_keyword(&masked, &upper, kw, caps.get(0).unwrap().end()))
            .min()
            .unwrap_or_else(|| sql.trim_end().trim_end_matches(';').len());
        let mut out = sql.to_string();
        out.insert_str(tail_end, &format!(" WHERE {predicate} "));
        out
    }
}

/// First depth-zero occurrence of `kw` at or after `from`.
fn top_level_keyword(masked: &str, upper: &str, kw: &str, from: usize) -> Option<usize> {
    let bytes = masked.as_bytes();
    let mut depth = 0i32;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 && word_at(upper, i, kw) => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Pass 7: strip `::regclass` / `::regproc` / `::regtype` / `::oid`
/// suffixes the engine cannot parse.
pub fn strip_reg_casts(sql: &str) -> String {
    let masked = mask_sql(sql);
    let mut edits = Vec::new();
    for m in REG_CAST.find_iter(&masked) {
        edits.push(Edit {
            start: m.start(),
            end: m.end(),
            text: String::new(),
        });
    }
    apply_edits(sql, edits)
}
