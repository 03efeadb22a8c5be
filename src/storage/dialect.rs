//! SQL dialect capabilities.
//!
//! Every statement issued against the revision table is generated once from
//! a shared template and then adapted through a [`Dialect`]: placeholder
//! syntax, schema DDL, the insert-returning-id strategy, which driver errors
//! are worth retrying, and whether writers must be serialized in-process.

use std::fmt;

/// How a dialect reports the id of a freshly inserted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    /// `INSERT ... RETURNING id` in a single round trip.
    Returning,
    /// Plain insert followed by the driver-reported last insert id.
    LastInsertId,
}

/// Placeholder style used by a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` for every parameter.
    Question,
    /// `$1`, `$2`, ... numbered parameters.
    Numbered,
}

/// Engine-specific behavior of the revisioned store.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Short engine name used in logs.
    fn name(&self) -> &'static str;

    /// Placeholder syntax.
    fn placeholder(&self) -> Placeholder;

    /// Idempotent schema statements, executed in order at startup.
    fn schema(&self) -> &'static [&'static str];

    /// How new record ids are obtained.
    fn insert_strategy(&self) -> InsertStrategy;

    /// Suffix appended to `LIKE ?` so that `\` escapes wildcards.
    fn like_escape(&self) -> &'static str {
        ""
    }

    /// Whether writers must be serialized by the driver.
    fn serialize_writes(&self) -> bool {
        false
    }

    /// Query returning the on-disk size of the revision table in bytes.
    fn size_query(&self) -> &'static str;

    /// Compaction DELETE. Binds the target revision twice.
    fn compact_statement(&self) -> &'static str {
        COMPACT_SQL
    }

    /// Whether a failed write may succeed if retried.
    fn is_retryable(&self, err: &sqlx::Error) -> bool;

    /// Rewrite `?` placeholders into this dialect's syntax.
    fn rewrite(&self, sql: &str) -> String {
        match self.placeholder() {
            Placeholder::Question => sql.to_string(),
            Placeholder::Numbered => number_placeholders(sql),
        }
    }
}

/// Deletes every record below the target that is superseded by a newer
/// record at or below the target, and every gap filler below the target.
/// The newest record of each key at the target revision survives,
/// tombstones included.
const COMPACT_SQL: &str = "DELETE FROM kine WHERE id < ? AND name != 'compact_rev_key' \
     AND ((name LIKE 'gap-%' AND deleted != 0 AND prev_revision = 0) \
     OR id < (SELECT MAX(k2.id) FROM kine AS k2 WHERE k2.name = kine.name AND k2.id <= ?))";

/// MySQL rejects a subquery on the table being deleted from unless it is
/// materialized through a derived table.
const MYSQL_COMPACT_SQL: &str = "DELETE FROM kine WHERE id IN (SELECT id FROM (\
     SELECT kv.id FROM kine AS kv WHERE kv.id < ? AND kv.name != 'compact_rev_key' \
     AND ((kv.name LIKE 'gap-%' AND kv.deleted != 0 AND kv.prev_revision = 0) \
     OR kv.id < (SELECT MAX(k2.id) FROM kine AS k2 WHERE k2.name = kv.name AND k2.id <= ?))\
     ) AS superseded)";

fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut in_literal = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

fn database_message(err: &sqlx::Error) -> Option<(String, String)> {
    match err {
        sqlx::Error::Database(db) => Some((
            db.code().map(|c| c.into_owned()).unwrap_or_default(),
            db.message().to_string(),
        )),
        _ => None,
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_)
    )
}

/// Embedded SQLite.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

const SQLITE_SCHEMA: &[&str] = &[
    "PRAGMA journal_mode=WAL",
    "CREATE TABLE IF NOT EXISTS kine (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        create_revision INTEGER NOT NULL DEFAULT 0,
        prev_revision INTEGER NOT NULL DEFAULT 0,
        lease INTEGER NOT NULL DEFAULT 0,
        value BLOB,
        old_value BLOB
    )",
    "CREATE INDEX IF NOT EXISTS kine_name_index ON kine (name)",
    "CREATE INDEX IF NOT EXISTS kine_name_id_index ON kine (name, id)",
    "CREATE INDEX IF NOT EXISTS kine_id_deleted_index ON kine (id, deleted)",
    "CREATE INDEX IF NOT EXISTS kine_prev_revision_index ON kine (prev_revision)",
    "CREATE UNIQUE INDEX IF NOT EXISTS kine_name_prev_revision_uindex ON kine (name, prev_revision)",
];

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::Question
    }

    fn schema(&self) -> &'static [&'static str] {
        SQLITE_SCHEMA
    }

    fn insert_strategy(&self) -> InsertStrategy {
        InsertStrategy::Returning
    }

    fn like_escape(&self) -> &'static str {
        " ESCAPE '\\'"
    }

    fn serialize_writes(&self) -> bool {
        true
    }

    fn size_query(&self) -> &'static str {
        "SELECT (SELECT page_count FROM pragma_page_count()) * (SELECT page_size FROM pragma_page_size())"
    }

    fn is_retryable(&self, err: &sqlx::Error) -> bool {
        if is_connection_error(err) {
            return true;
        }
        match database_message(err) {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), plus their extended codes.
            Some((code, message)) => {
                let primary = code.parse::<i64>().map(|c| c & 0xff).unwrap_or(-1);
                primary == 5
                    || primary == 6
                    || message.contains("database is locked")
                    || message.contains("busy")
            }
            None => false,
        }
    }
}

/// PostgreSQL.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kine (
        id BIGSERIAL PRIMARY KEY,
        name TEXT COLLATE \"C\" NOT NULL,
        created BIGINT NOT NULL DEFAULT 0,
        deleted BIGINT NOT NULL DEFAULT 0,
        create_revision BIGINT NOT NULL DEFAULT 0,
        prev_revision BIGINT NOT NULL DEFAULT 0,
        lease BIGINT NOT NULL DEFAULT 0,
        value BYTEA,
        old_value BYTEA
    )",
    "CREATE INDEX IF NOT EXISTS kine_name_index ON kine (name)",
    "CREATE INDEX IF NOT EXISTS kine_name_id_index ON kine (name, id)",
    "CREATE INDEX IF NOT EXISTS kine_id_deleted_index ON kine (id, deleted)",
    "CREATE INDEX IF NOT EXISTS kine_prev_revision_index ON kine (prev_revision)",
    "CREATE UNIQUE INDEX IF NOT EXISTS kine_name_prev_revision_uindex ON kine (name, prev_revision)",
];

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::Numbered
    }

    fn schema(&self) -> &'static [&'static str] {
        POSTGRES_SCHEMA
    }

    fn insert_strategy(&self) -> InsertStrategy {
        InsertStrategy::Returning
    }

    fn size_query(&self) -> &'static str {
        "SELECT pg_total_relation_size('kine')"
    }

    fn is_retryable(&self, err: &sqlx::Error) -> bool {
        if is_connection_error(err) {
            return true;
        }
        // serialization_failure, deadlock_detected
        matches!(
            database_message(err),
            Some((code, _)) if code == "40001" || code == "40P01"
        )
    }
}

/// MySQL and MariaDB.
#[derive(Debug, Default, Clone, Copy)]
pub struct MysqlDialect;

const MYSQL_SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS kine (
        id BIGINT NOT NULL AUTO_INCREMENT,
        name VARCHAR(630) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
        created BIGINT NOT NULL DEFAULT 0,
        deleted BIGINT NOT NULL DEFAULT 0,
        create_revision BIGINT NOT NULL DEFAULT 0,
        prev_revision BIGINT NOT NULL DEFAULT 0,
        lease BIGINT NOT NULL DEFAULT 0,
        value MEDIUMBLOB,
        old_value MEDIUMBLOB,
        PRIMARY KEY (id),
        INDEX kine_name_index (name),
        INDEX kine_name_id_index (name, id),
        INDEX kine_id_deleted_index (id, deleted),
        INDEX kine_prev_revision_index (prev_revision),
        UNIQUE INDEX kine_name_prev_revision_uindex (name, prev_revision)
    )"];

impl Dialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::Question
    }

    fn schema(&self) -> &'static [&'static str] {
        MYSQL_SCHEMA
    }

    fn insert_strategy(&self) -> InsertStrategy {
        InsertStrategy::LastInsertId
    }

    fn size_query(&self) -> &'static str {
        "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) \
         FROM information_schema.TABLES WHERE table_schema = DATABASE() AND table_name = 'kine'"
    }

    fn compact_statement(&self) -> &'static str {
        MYSQL_COMPACT_SQL
    }

    fn is_retryable(&self, err: &sqlx::Error) -> bool {
        if is_connection_error(err) {
            return true;
        }
        match database_message(err) {
            Some((code, message)) => {
                code == "40001"
                    || message.contains("Deadlock found")
                    || message.contains("Lock wait timeout exceeded")
            }
            None => false,
        }
    }
}
