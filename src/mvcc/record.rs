//! Revision records.

use crate::storage::statements::{COMPACT_REV_KEY, GAP_KEY_PREFIX};
use sqlx::any::AnyRow;
use sqlx::Row;

/// One immutable version of a key.
///
/// `id` is the global revision that produced this version. The newest
/// record of a name is that key's current state; a tombstone marks it
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub id: i64,
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Option<Vec<u8>>,
    pub old_value: Option<Vec<u8>>,
}

impl Record {
    /// Decode a row selected with the standard column list.
    pub(crate) fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let id: i64 = row.try_get(0)?;
        let created = row.try_get::<i64, _>(2)? != 0;
        let mut create_revision: i64 = row.try_get(4)?;
        // Creating records store 0 and take their own id.
        if created {
            create_revision = id;
        }
        Ok(Self {
            id,
            name: row.try_get(1)?,
            created,
            deleted: row.try_get::<i64, _>(3)? != 0,
            create_revision,
            prev_revision: row.try_get(5)?,
            lease: row.try_get(6)?,
            value: row.try_get(7)?,
            old_value: row.try_get(8)?,
        })
    }

    /// Whether this is the compaction sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.name == COMPACT_REV_KEY
    }

    /// Whether this row was written by the poller to plug a revision gap.
    pub fn is_gap_fill(&self) -> bool {
        self.deleted && self.prev_revision == 0 && self.name.starts_with(GAP_KEY_PREFIX)
    }

    /// Whether this record is a real key version visible to clients.
    pub fn is_visible(&self) -> bool {
        !self.is_sentinel() && !self.is_gap_fill()
    }

    /// etcd version reported to clients.
    ///
    /// Versions are not tracked per lineage; live keys report 1 and
    /// tombstones 0, which is what existence checks rely on.
    pub fn version(&self) -> i64 {
        if self.deleted {
            0
        } else {
            1
        }
    }

    /// The value this change replaced, if recorded.
    pub fn previous_value(&self) -> Option<&[u8]> {
        self.old_value.as_deref()
    }
}

/// Result of a compare-guarded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// New revision on success; current revision otherwise.
    pub revision: i64,
    /// Record replaced by the write, or the current record when the
    /// compare failed.
    pub record: Option<Record>,
    /// Whether the compare held and the write was applied.
    pub matched: bool,
}
