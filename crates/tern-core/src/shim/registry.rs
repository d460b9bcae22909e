//! Static registry of Postgres catalog relations the engine does not
//! provide, with the column shape clients expect from each.
//!
//! One table shared by detection, join stripping, and result synthesis.
//! Fixed per engine version; loaded once, never mutated.

use crate::engine::{Column, PgType};
use crate::engine::PgType::*;

pub struct MissingTable {
    pub name: &'static str,
    pub columns: &'static [(&'static str, PgType)],
}

/// Catalog relations DuckDB's pg_catalog emulation lacks entirely.
pub static MISSING_TABLES: &[MissingTable] = &[
    MissingTable {
        name: "pg_locks",
        columns: &[
            ("locktype", Text),
            ("database", Oid),
            ("relation", Oid),
            ("page", Int4),
            ("tuple", Int2),
            ("virtualxid", Text),
            ("transactionid", Oid),
            ("virtualtransaction", Text),
            ("pid", Int4),
            ("mode", Text),
            ("granted", Bool),
            ("fastpath", Bool),
        ],
    },
    MissingTable {
        name: "pg_stat_activity",
        columns: &[
            ("datid", Oid),
            ("datname", Text),
            ("pid", Int4),
            ("usesysid", Oid),
            ("usename", Text),
            ("application_name", Text),
            ("client_addr", Text),
            ("client_port", Int4),
            ("backend_start", Timestamp),
            ("query_start", Timestamp),
            ("state", Text),
            ("query", Text),
        ],
    },
    MissingTable {
        name: "pg_roles",
        columns: &[
            ("oid", Oid),
            ("rolname", Text),
            ("rolsuper", Bool),
            ("rolinherit", Bool),
            ("rolcreaterole", Bool),
            ("rolcreatedb", Bool),
            ("rolcanlogin", Bool),
            ("rolreplication", Bool),
            ("rolconnlimit", Int4),
            ("rolvaliduntil", Timestamp),
            ("rolbypassrls", Bool),
            ("rolconfig", Text),
        ],
    },
    MissingTable {
        name: "pg_user",
        columns: &[
            ("usename", Text),
            ("usesysid", Oid),
            ("usecreatedb", Bool),
            ("usesuper", Bool),
            ("userepl", Bool),
            ("usebypassrls", Bool),
            ("passwd", Text),
            ("valuntil", Timestamp),
            ("useconfig", Text),
        ],
    },
    MissingTable {
        name: "pg_shadow",
        columns: &[
            ("usename", Text),
            ("usesysid", Oid),
            ("usecreatedb", Bool),
            ("usesuper", Bool),
            ("passwd", Text),
            ("valuntil", Timestamp),
        ],
    },
    MissingTable {
        name: "pg_auth_members",
        columns: &[
            ("roleid", Oid),
            ("member", Oid),
            ("grantor", Oid),
            ("admin_option", Bool),
        ],
    },
    MissingTable {
        name: "pg_inherits",
        columns: &[
            ("inhrelid", Oid),
            ("inhparent", Oid),
            ("inhseqno", Int4),
            ("inhdetachpending", Bool),
        ],
    },
    MissingTable {
        name: "pg_am",
        columns: &[
            ("oid", Oid),
            ("amname", Text),
            ("amhandler", Text),
            ("amtype", Text),
        ],
    },
    MissingTable {
        name: "pg_amop",
        columns: &[
            ("oid", Oid),
            ("amopfamily", Oid),
            ("amoplefttype", Oid),
            ("amoprighttype", Oid),
            ("amopstrategy", Int2),
            ("amopopr", Oid),
        ],
    },
    MissingTable {
        name: "pg_opclass",
        columns: &[
            ("oid", Oid),
            ("opcmethod", Oid),
            ("opcname", Text),
            ("opcnamespace", Oid),
            ("opcdefault", Bool),
        ],
    },
    MissingTable {
        name: "pg_rewrite",
        columns: &[
            ("oid", Oid),
            ("rulename", Text),
            ("ev_class", Oid),
            ("ev_type", Text),
            ("ev_enabled", Text),
            ("is_instead", Bool),
        ],
    },
    MissingTable {
        name: "pg_trigger",
        columns: &[
            ("oid", Oid),
            ("tgrelid", Oid),
            ("tgname", Text),
            ("tgfoid", Oid),
            ("tgtype", Int2),
            ("tgenabled", Text),
            ("tgisinternal", Bool),
        ],
    },
    MissingTable {
        name: "pg_event_trigger",
        columns: &[
            ("oid", Oid),
            ("evtname", Text),
            ("evtevent", Text),
            ("evtowner", Oid),
            ("evtenabled", Text),
        ],
    },
    MissingTable {
        name: "pg_policy",
        columns: &[
            ("oid", Oid),
            ("polname", Text),
            ("polrelid", Oid),
            ("polcmd", Text),
            ("polpermissive", Bool),
        ],
    },
    MissingTable {
        name: "pg_policies",
        columns: &[
            ("schemaname", Text),
            ("tablename", Text),
            ("policyname", Text),
            ("permissive", Text),
            ("roles", Text),
            ("cmd", Text),
            ("qual", Text),
            ("with_check", Text),
        ],
    },
    MissingTable {
        name: "pg_publication",
        columns: &[
            ("oid", Oid),
            ("pubname", Text),
            ("pubowner", Oid),
            ("puballtables", Bool),
            ("pubinsert", Bool),
            ("pubupdate", Bool),
            ("pubdelete", Bool),
        ],
    },
    MissingTable {
        name: "pg_publication_rel",
        columns: &[("oid", Oid), ("prpubid", Oid), ("prrelid", Oid)],
    },
    MissingTable {
        name: "pg_subscription",
        columns: &[
            ("oid", Oid),
            ("subname", Text),
            ("subowner", Oid),
            ("subenabled", Bool),
            ("subconninfo", Text),
        ],
    },
    MissingTable {
        name: "pg_replication_slots",
        columns: &[
            ("slot_name", Text),
            ("plugin", Text),
            ("slot_type", Text),
            ("datoid", Oid),
            ("active", Bool),
        ],
    },
    MissingTable {
        name: "pg_matviews",
        columns: &[
            ("schemaname", Text),
            ("matviewname", Text),
            ("matviewowner", Text),
            ("tablespace", Text),
            ("hasindexes", Bool),
            ("ispopulated", Bool),
            ("definition", Text),
        ],
    },
    MissingTable {
        name: "pg_extension",
        columns: &[
            ("oid", Oid),
            ("extname", Text),
            ("extowner", Oid),
            ("extnamespace", Oid),
            ("extrelocatable", Bool),
            ("extversion", Text),
        ],
    },
    MissingTable {
        name: "pg_foreign_server",
        columns: &[
            ("oid", Oid),
            ("srvname", Text),
            ("srvowner", Oid),
            ("srvfdw", Oid),
            ("srvtype", Text),
            ("srvversion", Text),
            ("srvoptions", Text),
        ],
    },
    MissingTable {
        name: "pg_foreign_data_wrapper",
        columns: &[
            ("oid", Oid),
            ("fdwname", Text),
            ("fdwowner", Oid),
            ("fdwhandler", Oid),
            ("fdwvalidator", Oid),
        ],
    },
    MissingTable {
        name: "pg_foreign_table",
        columns: &[("ftrelid", Oid), ("ftserver", Oid), ("ftoptions", Text)],
    },
    MissingTable {
        name: "pg_collation",
        columns: &[
            ("oid", Oid),
            ("collname", Text),
            ("collnamespace", Oid),
            ("collowner", Oid),
            ("collprovider", Text),
            ("collencoding", Int4),
        ],
    },
    MissingTable {
        name: "pg_conversion",
        columns: &[("oid", Oid), ("conname", Text), ("connamespace", Oid)],
    },
    MissingTable {
        name: "pg_language",
        columns: &[
            ("oid", Oid),
            ("lanname", Text),
            ("lanowner", Oid),
            ("lanispl", Bool),
            ("lanpltrusted", Bool),
        ],
    },
    MissingTable {
        name: "pg_largeobject",
        columns: &[("loid", Oid), ("pageno", Int4), ("data", Bytea)],
    },
    MissingTable {
        name: "pg_partitioned_table",
        columns: &[
            ("partrelid", Oid),
            ("partstrat", Text),
            ("partnatts", Int2),
        ],
    },
    MissingTable {
        name: "pg_statistic",
        columns: &[
            ("starelid", Oid),
            ("staattnum", Int2),
            ("stainherit", Bool),
        ],
    },
    MissingTable {
        name: "pg_statistic_ext",
        columns: &[
            ("oid", Oid),
            ("stxrelid", Oid),
            ("stxname", Text),
            ("stxnamespace", Oid),
        ],
    },
    MissingTable {
        name: "pg_stat_user_tables",
        columns: &[
            ("relid", Oid),
            ("schemaname", Text),
            ("relname", Text),
            ("seq_scan", Int8),
            ("seq_tup_read", Int8),
            ("n_tup_ins", Int8),
            ("n_tup_upd", Int8),
            ("n_tup_del", Int8),
            ("n_live_tup", Int8),
            ("n_dead_tup", Int8),
        ],
    },
    MissingTable {
        name: "pg_stat_all_tables",
        columns: &[
            ("relid", Oid),
            ("schemaname", Text),
            ("relname", Text),
            ("seq_scan", Int8),
            ("seq_tup_read", Int8),
        ],
    },
    MissingTable {
        name: "pg_stat_user_indexes",
        columns: &[
            ("relid", Oid),
            ("indexrelid", Oid),
            ("schemaname", Text),
            ("relname", Text),
            ("indexrelname", Text),
            ("idx_scan", Int8),
        ],
    },
    MissingTable {
        name: "pg_statio_user_tables",
        columns: &[
            ("relid", Oid),
            ("schemaname", Text),
            ("relname", Text),
            ("heap_blks_read", Int8),
            ("heap_blks_hit", Int8),
        ],
    },
    MissingTable {
        name: "pg_stat_database",
        columns: &[
            ("datid", Oid),
            ("datname", Text),
            ("numbackends", Int4),
            ("xact_commit", Int8),
            ("xact_rollback", Int8),
        ],
    },
    MissingTable {
        name: "pg_stat_gssapi",
        columns: &[
            ("pid", Int4),
            ("gss_authenticated", Bool),
            ("principal", Text),
            ("encrypted", Bool),
        ],
    },
    MissingTable {
        name: "pg_stat_ssl",
        columns: &[
            ("pid", Int4),
            ("ssl", Bool),
            ("version", Text),
            ("cipher", Text),
            ("bits", Int4),
        ],
    },
    MissingTable {
        name: "pg_stat_replication",
        columns: &[
            ("pid", Int4),
            ("usesysid", Oid),
            ("usename", Text),
            ("application_name", Text),
            ("state", Text),
        ],
    },
    MissingTable {
        name: "pg_cursors",
        columns: &[
            ("name", Text),
            ("statement", Text),
            ("is_holdable", Bool),
            ("is_binary", Bool),
            ("is_scrollable", Bool),
            ("creation_time", Timestamp),
        ],
    },
    MissingTable {
        name: "pg_prepared_xacts",
        columns: &[
            ("transaction", Oid),
            ("gid", Text),
            ("prepared", Timestamp),
            ("owner", Text),
            ("database", Text),
        ],
    },
    MissingTable {
        name: "pg_timezone_names",
        columns: &[("name", Text), ("abbrev", Text), ("utc_offset", Text), ("is_dst", Bool)],
    },
    MissingTable {
        name: "pg_timezone_abbrevs",
        columns: &[("abbrev", Text), ("utc_offset", Text), ("is_dst", Bool)],
    },
    MissingTable {
        name: "pg_shdescription",
        columns: &[("objoid", Oid), ("classoid", Oid), ("description", Text)],
    },
    MissingTable {
        name: "pg_seclabel",
        columns: &[
            ("objoid", Oid),
            ("classoid", Oid),
            ("objsubid", Int4),
            ("provider", Text),
            ("label", Text),
        ],
    },
    MissingTable {
        name: "pg_db_role_setting",
        columns: &[("setdatabase", Oid), ("setrole", Oid), ("setconfig", Text)],
    },
    MissingTable {
        name: "pg_tablespace",
        columns: &[
            ("oid", Oid),
            ("spcname", Text),
            ("spcowner", Oid),
            ("spcacl", Text),
            ("spcoptions", Text),
        ],
    },
];

/// Columns absent from the engine's partial pg_catalog views, with the
/// constant literal each rewrites to. The owning table must appear in
/// the query for the rewrite to fire.
pub static MISSING_COLUMNS: &[(&str, &str, &str)] = &[
    // (owning table, column, literal)
    ("pg_class", "relhasoids", "false"),
    ("pg_class", "relhasrules", "false"),
    ("pg_class", "relrowsecurity", "false"),
    ("pg_class", "relforcerowsecurity", "false"),
    ("pg_class", "relispartition", "false"),
    ("pg_class", "relreplident", "'d'"),
    ("pg_class", "reltablespace", "0"),
    ("pg_class", "relpersistence", "'p'"),
    ("pg_class", "relpages", "0"),
    ("pg_class", "reltuples", "-1"),
    ("pg_class", "relallvisible", "0"),
    ("pg_class", "relacl", "NULL"),
    ("pg_class", "reloptions", "NULL"),
    ("pg_class", "relpartbound", "NULL"),
    ("pg_namespace", "nspacl", "NULL"),
    ("pg_attribute", "attacl", "NULL"),
    ("pg_attribute", "attfdwoptions", "NULL"),
    ("pg_attribute", "attmissingval", "NULL"),
    ("pg_attribute", "attidentity", "''"),
    ("pg_attribute", "attgenerated", "''"),
    ("pg_proc", "proacl", "NULL"),
    ("pg_proc", "prosupport", "0"),
    ("pg_proc", "prokind", "'f'"),
    ("pg_database", "datacl", "NULL"),
    ("pg_database", "datistemplate", "false"),
    ("pg_database", "datallowconn", "true"),
    ("pg_database", "datconnlimit", "-1"),
    ("pg_type", "typacl", "NULL"),
    ("pg_type", "typdefault", "NULL"),
];

/// Pseudo system columns every Postgres table implicitly carries, with
/// the constant each rewrites to.
pub static SYSTEM_COLUMNS: &[(&str, &str)] = &[
    ("xmin", "0"),
    ("xmax", "0"),
    ("cmin", "0"),
    ("cmax", "0"),
    ("ctid", "'(0,0)'"),
    ("tableoid", "0"),
];

/// Postgres-only decompiler functions with no engine equivalent; each
/// call collapses to a typed NULL.
pub static DECOMPILER_FUNCTIONS: &[&str] = &[
    "pg_get_expr",
    "pg_get_ruledef",
    "pg_get_triggerdef",
    "pg_get_partkeydef",
    "pg_get_statisticsobjdef_columns",
    "pg_get_function_sqlbody",
];

pub fn lookup(table: &str) -> Option<&'static MissingTable> {
    let bare = table
        .strip_prefix("pg_catalog.")
        .unwrap_or(table)
        .trim_matches('"');
    MISSING_TABLES.iter().find(|t| t.name == bare)
}

pub fn is_missing_table(table: &str) -> bool {
    lookup(table).is_some()
}

pub fn default_columns(table: &str) -> Vec<Column> {
    lookup(table)
        .map(|t| {
            t.columns
                .iter()
                .map(|(n, ty)| Column::new(*n, *ty))
                .collect()
        })
        .unwrap_or_else(|| vec![Column::text("result")])
}
