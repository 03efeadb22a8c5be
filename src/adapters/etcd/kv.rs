//! etcd KV operations: Range, Put, DeleteRange and Compact.
//!
//! Txn lives in [`super::txn`]. Range without a `range_end` is a point get;
//! with one it is a prefix list, where the prefix is derived from
//! `range_end` the way Kubernetes builds its prefix ranges.

use super::grpc::SharedState;
use super::proto;
use crate::core::error::{StrataError, StrataResult};
use crate::mvcc::Record;

/// Attempts a direct Put makes when racing other writers.
const PUT_ATTEMPTS: usize = 16;

/// Convert a record to its wire form.
pub(crate) fn key_value(record: &Record) -> proto::KeyValue {
    proto::KeyValue {
        key: record.name.as_bytes().to_vec(),
        create_revision: record.create_revision,
        mod_revision: record.id,
        version: record.version(),
        value: record.value.clone().unwrap_or_default(),
        lease: record.lease,
    }
}

/// The value a change replaced, as a key-value at the prior revision.
pub(crate) fn previous_key_value(record: &Record) -> Option<proto::KeyValue> {
    let value = record.previous_value()?;
    Some(proto::KeyValue {
        key: record.name.as_bytes().to_vec(),
        create_revision: record.create_revision,
        mod_revision: record.prev_revision,
        version: 1,
        value: value.to_vec(),
        lease: record.lease,
    })
}

/// Keys are stored as text.
pub(crate) fn key_str(key: &[u8]) -> StrataResult<&str> {
    std::str::from_utf8(key).map_err(|_| StrataError::invalid("key is not valid UTF-8"))
}

/// Where a listing starts within its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListStart {
    /// From the first key of the prefix.
    First,
    /// Strictly after this key (continuation of a previous page).
    After(String),
    /// At this key, inclusive.
    At(String),
}

/// Prefix and start position for a ranged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListRange {
    pub prefix: String,
    pub start: ListStart,
}

impl ListRange {
    /// Derive the listing from etcd's `key`/`range_end`.
    ///
    /// The prefix is `range_end` with its last byte decremented, always
    /// ending in `/`; `[0]` lists the whole keyspace. A `key` carrying the
    /// trailing `\0` that clients append for the next page resumes strictly
    /// after the key it extends.
    pub(crate) fn from_request(key: &[u8], range_end: &[u8]) -> StrataResult<Self> {
        let prefix = match range_end.split_last() {
            None => return Err(StrataError::invalid("invalid range end length of 0")),
            Some((0, [])) => String::new(),
            Some((&last, head)) => {
                let mut bytes = head.to_vec();
                bytes.push(last.wrapping_sub(1));
                let mut prefix = String::from_utf8(bytes)
                    .map_err(|_| StrataError::invalid("range end is not valid UTF-8"))?;
                if !prefix.ends_with('/') {
                    prefix.push('/');
                }
                prefix
            }
        };

        let continuation = key.last() == Some(&0);
        let trimmed = key_str(key)?.trim_end_matches('\0');
        let start = if trimmed.is_empty() || trimmed == prefix {
            ListStart::First
        } else if continuation {
            ListStart::After(trimmed.to_string())
        } else {
            ListStart::At(trimmed.to_string())
        };
        Ok(Self { prefix, start })
    }
}

/// Handlers for the KV service.
#[derive(Debug, Clone)]
pub struct KvService {
    state: SharedState,
}

impl KvService {
    /// Create a new KV service.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &SharedState {
        &self.state
    }

    /// Handle Range.
    pub async fn range(&self, req: proto::RangeRequest) -> StrataResult<proto::RangeResponse> {
        if req.range_end.is_empty() {
            self.get(req).await
        } else {
            self.list(req).await
        }
    }

    async fn get(&self, req: proto::RangeRequest) -> StrataResult<proto::RangeResponse> {
        let key = key_str(&req.key)?;
        let (revision, record) = self.state.backend.get(key, req.revision).await?;
        tracing::trace!(key, revision = req.revision, found = record.is_some(), "get");

        let mut kvs: Vec<proto::KeyValue> = record.iter().map(key_value).collect();
        let count = kvs.len() as i64;
        if req.count_only {
            kvs.clear();
        } else if req.keys_only {
            kvs.iter_mut().for_each(|kv| kv.value.clear());
        }
        Ok(proto::RangeResponse {
            header: Some(self.state.header(revision)),
            kvs,
            more: false,
            count,
        })
    }

    async fn list(&self, req: proto::RangeRequest) -> StrataResult<proto::RangeResponse> {
        let range = ListRange::from_request(&req.key, &req.range_end)?;
        let backend = &self.state.backend;

        if req.count_only {
            let (revision, count) = backend.count(&range.prefix, req.revision).await?;
            tracing::trace!(prefix = %range.prefix, revision, count, "count");
            return Ok(proto::RangeResponse {
                header: Some(self.state.header(revision)),
                kvs: Vec::new(),
                more: false,
                count,
            });
        }

        // One extra row tells us whether there is another page.
        let fetch = if req.limit > 0 { req.limit + 1 } else { 0 };
        let (mut revision, mut records) = self.fetch(&range, fetch, req.revision).await?;
        tracing::trace!(
            prefix = %range.prefix,
            start = ?range.start,
            limit = req.limit,
            revision = req.revision,
            rows = records.len(),
            "list"
        );

        let mut count = records.len() as i64;
        let more = req.limit > 0 && count > req.limit;
        if more {
            records.truncate(req.limit as usize);
            let at = if req.revision > 0 { req.revision } else { revision };
            let (current, total) = backend.count(&range.prefix, at).await?;
            revision = current;
            count = total;
        }

        let kvs = records
            .iter()
            .map(|record| {
                let mut kv = key_value(record);
                if req.keys_only {
                    kv.value.clear();
                }
                kv
            })
            .collect();

        Ok(proto::RangeResponse {
            header: Some(self.state.header(revision)),
            kvs,
            more,
            count,
        })
    }

    /// Fetch up to `limit` live records (0 = all) from `range`.
    async fn fetch(
        &self,
        range: &ListRange,
        limit: i64,
        revision: i64,
    ) -> StrataResult<(i64, Vec<Record>)> {
        let backend = &self.state.backend;
        match &range.start {
            ListStart::First => backend.list(&range.prefix, "", limit, revision, false).await,
            ListStart::After(key) => backend.list(&range.prefix, key, limit, revision, false).await,
            ListStart::At(key) => {
                let (_, first) = backend.get(key, revision).await?;
                let mut records: Vec<Record> = first.into_iter().collect();
                // `limit` is never 1 here, so a positive limit leaves room.
                let remaining = if limit > 0 {
                    limit - records.len() as i64
                } else {
                    0
                };
                let (current, rest) = backend
                    .list(&range.prefix, key, remaining, revision, false)
                    .await?;
                records.extend(rest);
                Ok((current, records))
            }
        }
    }

    /// Handle Put: create the key if absent, otherwise replace it.
    pub async fn put(&self, req: proto::PutRequest) -> StrataResult<proto::PutResponse> {
        let key = key_str(&req.key)?;
        let backend = &self.state.backend;

        for _ in 0..PUT_ATTEMPTS {
            let (_, current) = backend.get(key, 0).await?;
            let outcome = match &current {
                None => {
                    if req.ignore_value || req.ignore_lease {
                        return Err(StrataError::invalid("etcdserver: key not found"));
                    }
                    match backend.create(key, &req.value, req.lease).await {
                        Ok(revision) => {
                            return Ok(proto::PutResponse {
                                header: Some(self.state.header(revision)),
                                prev_kv: None,
                            })
                        }
                        Err(StrataError::KeyExists) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Some(record) => {
                    let value = if req.ignore_value {
                        record.value.as_deref().unwrap_or_default()
                    } else {
                        req.value.as_slice()
                    };
                    let lease = if req.ignore_lease { record.lease } else { req.lease };
                    backend.update(key, value, record.id, lease).await?
                }
            };

            if outcome.matched {
                return Ok(proto::PutResponse {
                    header: Some(self.state.header(outcome.revision)),
                    prev_kv: if req.prev_kv {
                        outcome.record.as_ref().map(key_value)
                    } else {
                        None
                    },
                });
            }
            tracing::debug!(key, "put lost a race, retrying");
        }
        Err(StrataError::internal(format!(
            "put of {key} kept conflicting with concurrent writers"
        )))
    }

    /// Handle DeleteRange. Only single keys are supported.
    pub async fn delete_range(
        &self,
        req: proto::DeleteRangeRequest,
    ) -> StrataResult<proto::DeleteRangeResponse> {
        if !req.range_end.is_empty() {
            return Err(StrataError::unsupported("ranged delete"));
        }
        let key = key_str(&req.key)?;
        let outcome = self.state.backend.delete(key, 0).await?;

        let (deleted, prev_kvs) = match (&outcome.record, outcome.matched) {
            (Some(record), true) if req.prev_kv => (1, vec![key_value(record)]),
            (_, true) => (1, Vec::new()),
            (_, false) => (0, Vec::new()),
        };
        Ok(proto::DeleteRangeResponse {
            header: Some(self.state.header(outcome.revision)),
            deleted,
            prev_kvs,
        })
    }

    /// Handle Compact. Compaction is owned by the background compactor;
    /// the request is acknowledged without touching storage.
    pub async fn compact(
        &self,
        req: proto::CompactionRequest,
    ) -> StrataResult<proto::CompactionResponse> {
        let revision = self.state.backend.current_revision().await?;
        tracing::debug!(requested = req.revision, revision, "compact request acknowledged");
        Ok(proto::CompactionResponse {
            header: Some(self.state.header(revision)),
        })
    }
}
