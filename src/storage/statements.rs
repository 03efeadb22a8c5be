//! SQL text for the revision table.
//!
//! Fixed statements are rendered once per dialect when the driver is built.
//! List and count queries vary with their optional bounds, so they are
//! assembled per call from [`ListSpec`].

use super::dialect::{Dialect, InsertStrategy};

/// Name of the sentinel row tracking the compaction revision.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Prefix of filler rows written over revision gaps.
pub const GAP_KEY_PREFIX: &str = "gap-";

pub(crate) const COLUMNS: &str = "kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, \
     kv.prev_revision, kv.lease, kv.value, kv.old_value";

/// Optional clauses of a grouped (latest-per-key) listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListSpec {
    /// Resume strictly after a key.
    pub after_key: bool,
    /// Pin the read at a revision (`id <= ?`).
    pub at_revision: bool,
    /// Return tombstones as well as live records.
    pub include_deleted: bool,
    /// Apply `LIMIT ?`.
    pub limited: bool,
}

/// Rendered statements for one dialect.
#[derive(Debug, Clone)]
pub struct Statements {
    pub current_revision: String,
    pub compact_revision: String,
    pub get_latest: String,
    pub get_latest_at: String,
    pub after: String,
    pub after_limited: String,
    pub insert: String,
    pub fill: String,
    pub delete_revision: String,
    pub update_compact: String,
    pub insert_compact: String,
    pub sentinel_rows: String,
    pub compact: String,
    pub size: String,
    like_escape: &'static str,
}

impl Statements {
    /// Render every fixed statement for the given dialect.
    pub fn new(dialect: &dyn Dialect) -> Self {
        let like_escape = dialect.like_escape();
        let q = |sql: &str| dialect.rewrite(sql);

        let insert_base = "INSERT INTO kine(name, created, deleted, create_revision, prev_revision, \
             lease, value, old_value) VALUES(?, ?, ?, ?, ?, ?, ?, ?)";
        let insert = match dialect.insert_strategy() {
            InsertStrategy::Returning => format!("{insert_base} RETURNING id"),
            InsertStrategy::LastInsertId => insert_base.to_string(),
        };

        let after = format!(
            "SELECT {COLUMNS} FROM kine AS kv WHERE kv.name LIKE ?{like_escape} AND kv.id > ? \
             ORDER BY kv.id ASC"
        );

        Self {
            current_revision: q("SELECT COALESCE(MAX(kv.id), 0) FROM kine AS kv"),
            compact_revision: q(&format!(
                "SELECT kv.prev_revision FROM kine AS kv WHERE kv.name = '{COMPACT_REV_KEY}' \
                 ORDER BY kv.prev_revision DESC LIMIT 1"
            )),
            get_latest: q(&format!(
                "SELECT {COLUMNS} FROM kine AS kv WHERE kv.name = ? ORDER BY kv.id DESC LIMIT 1"
            )),
            get_latest_at: q(&format!(
                "SELECT {COLUMNS} FROM kine AS kv WHERE kv.name = ? AND kv.id <= ? \
                 ORDER BY kv.id DESC LIMIT 1"
            )),
            after_limited: q(&format!("{after} LIMIT ?")),
            after: q(&after),
            insert: q(&insert),
            fill: q("INSERT INTO kine(id, name, created, deleted, create_revision, prev_revision, \
                 lease, value, old_value) VALUES(?, ?, 0, 1, 0, 0, 0, NULL, NULL)"),
            delete_revision: q("DELETE FROM kine WHERE id = ?"),
            update_compact: q(&format!(
                "UPDATE kine SET prev_revision = ? WHERE name = '{COMPACT_REV_KEY}' \
                 AND prev_revision < ?"
            )),
            insert_compact: q(&format!(
                "INSERT INTO kine(name, created, deleted, create_revision, prev_revision, lease, \
                 value, old_value) VALUES('{COMPACT_REV_KEY}', 0, 0, 0, ?, 0, NULL, NULL)"
            )),
            sentinel_rows: q(&format!(
                "SELECT kv.id, kv.prev_revision FROM kine AS kv WHERE kv.name = '{COMPACT_REV_KEY}' \
                 ORDER BY kv.prev_revision DESC, kv.id DESC"
            )),
            compact: q(dialect.compact_statement()),
            size: q(dialect.size_query()),
            like_escape,
        }
    }

    /// Latest record per key under a prefix.
    ///
    /// Binds, in order: the LIKE pattern, the resume key (if `after_key`),
    /// the revision (if `at_revision`), the limit (if `limited`).
    pub fn list(&self, dialect: &dyn Dialect, spec: ListSpec) -> String {
        let mut sql = format!(
            "SELECT {COLUMNS} FROM kine AS kv JOIN ({}) AS maxkv ON maxkv.id = kv.id \
             WHERE kv.name != '{COMPACT_REV_KEY}'",
            self.latest_ids(spec)
        );
        if !spec.include_deleted {
            sql.push_str(" AND kv.deleted = 0");
        }
        sql.push_str(" ORDER BY kv.name ASC");
        if spec.limited {
            sql.push_str(" LIMIT ?");
        }
        dialect.rewrite(&sql)
    }

    /// Number of live keys under a prefix.
    ///
    /// Binds the LIKE pattern, then the revision if `at_revision`.
    pub fn count(&self, dialect: &dyn Dialect, at_revision: bool) -> String {
        let spec = ListSpec {
            at_revision,
            ..ListSpec::default()
        };
        let sql = format!(
            "SELECT COUNT(kv.id) FROM kine AS kv JOIN ({}) AS maxkv ON maxkv.id = kv.id \
             WHERE kv.name != '{COMPACT_REV_KEY}' AND kv.deleted = 0",
            self.latest_ids(spec)
        );
        dialect.rewrite(&sql)
    }

    fn latest_ids(&self, spec: ListSpec) -> String {
        let mut sql = format!(
            "SELECT MAX(mkv.id) AS id FROM kine AS mkv WHERE mkv.name LIKE ?{}",
            self.like_escape
        );
        if spec.after_key {
            sql.push_str(" AND mkv.name > ?");
        }
        if spec.at_revision {
            sql.push_str(" AND mkv.id <= ?");
        }
        sql.push_str(" GROUP BY mkv.name");
        sql
    }
}

/// LIKE pattern matching every name that starts with `prefix`.
pub fn prefix_pattern(prefix: &str) -> String {
    let mut out = escape_like(prefix);
    out.push('%');
    out
}

/// Escape LIKE wildcards with a backslash.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 1);
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Collapse runs of whitespace for trace logging.
pub fn strip_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dialect::{MysqlDialect, PostgresDialect, SqliteDialect};

    #[test]
    fn test_like_escaping() {
        assert_eq!(prefix_pattern("/registry/"), "/registry/%");
        assert_eq!(prefix_pattern("/a_b%"), "/a\\_b\\%%");
        assert_eq!(prefix_pattern(""), "%");
    }

    #[test]
    fn test_insert_strategy() {
        let sqlite = Statements::new(&SqliteDialect);
        assert!(sqlite.insert.ends_with("RETURNING id"));

        let mysql = Statements::new(&MysqlDialect);
        assert!(!mysql.insert.contains("RETURNING"));
    }

    #[test]
    fn test_list_clauses() {
        let dialect = PostgresDialect;
        let stmts = Statements::new(&dialect);
        let sql = stmts.list(
            &dialect,
            ListSpec {
                after_key: true,
                at_revision: true,
                include_deleted: false,
                limited: true,
            },
        );
        assert!(sql.contains("mkv.name LIKE $1"));
        assert!(sql.contains("mkv.name > $2"));
        assert!(sql.contains("mkv.id <= $3"));
        assert!(sql.ends_with("LIMIT $4"));
        assert!(sql.contains("kv.deleted = 0"));

        let sql = stmts.list(&dialect, ListSpec::default());
        assert!(!sql.contains("LIMIT"));
        assert!(!sql.contains("$2"));
    }

    #[test]
    fn test_sqlite_like_escape_clause() {
        let dialect = SqliteDialect;
        let stmts = Statements::new(&dialect);
        assert!(stmts.after.contains("LIKE ? ESCAPE '\\'"));
        assert!(stmts.count(&dialect, false).contains("ESCAPE"));
    }

    #[test]
    fn test_strip_whitespace() {
        assert_eq!(strip_whitespace("SELECT  1\n   FROM kine"), "SELECT 1 FROM kine");
    }
}
