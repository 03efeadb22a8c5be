//! Watch key selection and event filters.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Event kinds a watch does not want delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventFilters: u32 {
        /// Filter out PUT events.
        const NOPUT = 0b0000_0001;
        /// Filter out DELETE events.
        const NODELETE = 0b0000_0010;
    }
}

impl Default for EventFilters {
    fn default() -> Self {
        Self::empty()
    }
}

impl EventFilters {
    /// Whether an event for a record with this deleted flag passes.
    pub fn allows(&self, deleted: bool) -> bool {
        if deleted {
            !self.contains(Self::NODELETE)
        } else {
            !self.contains(Self::NOPUT)
        }
    }
}

/// The keys a watch is interested in, in etcd `key`/`range_end` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    key: Vec<u8>,
    range_end: Vec<u8>,
}

impl KeyFilter {
    /// Build from an etcd key and range end.
    ///
    /// An empty `range_end` selects `key` alone; `[0]` selects every key at
    /// or after `key`; anything else the half-open range `[key, range_end)`.
    pub fn new(key: impl Into<Vec<u8>>, range_end: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: range_end.into(),
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        let end = prefix_end(prefix.as_bytes());
        Self::new(prefix.as_bytes(), end)
    }

    /// Exactly one key.
    pub fn exact(key: &str) -> Self {
        Self::new(key.as_bytes(), Vec::new())
    }

    /// Whether `name` is selected.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.as_bytes();
        if self.range_end.is_empty() {
            name == self.key.as_slice()
        } else if self.range_end == [0] {
            name >= self.key.as_slice()
        } else {
            name >= self.key.as_slice() && name < self.range_end.as_slice()
        }
    }

    /// A name prefix covering every selected key, for the catch-up query.
    /// Results still need [`KeyFilter::matches`].
    pub fn sql_prefix(&self) -> String {
        let bytes: &[u8] = if self.range_end.is_empty() {
            &self.key
        } else if self.range_end == [0] {
            &[]
        } else if self.range_end == prefix_end(&self.key) {
            &self.key
        } else {
            let common = self
                .key
                .iter()
                .zip(self.range_end.iter())
                .take_while(|(a, b)| a == b)
                .count();
            &self.key[..common]
        };
        utf8_prefix(bytes).to_string()
    }
}

/// Smallest key greater than every key with this prefix, or `[0]` when no
/// such key exists (etcd's "to the end of the keyspace").
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// Longest prefix of `bytes` that is valid UTF-8.
fn utf8_prefix(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(s) => s,
        // valid_up_to() marks a char boundary, so this cannot fail.
        Err(err) => std::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_key() {
        let filter = KeyFilter::exact("/a");
        assert!(filter.matches("/a"));
        assert!(!filter.matches("/ab"));
        assert_eq!(filter.sql_prefix(), "/a");
    }

    #[test]
    fn test_prefix() {
        let filter = KeyFilter::prefix("/registry/pods/");
        assert!(filter.matches("/registry/pods/default/web"));
        assert!(!filter.matches("/registry/podsx"));
        assert!(!filter.matches("/registry/services/x"));
        assert_eq!(filter.sql_prefix(), "/registry/pods/");

        // The same range spelled out by a client narrows the same way.
        let spelled = KeyFilter::new("/registry/pods/", "/registry/pods0");
        assert_eq!(spelled.sql_prefix(), "/registry/pods/");
    }

    #[test]
    fn test_from_key_to_end() {
        let filter = KeyFilter::new("/m", vec![0]);
        assert!(filter.matches("/z"));
        assert!(!filter.matches("/a"));
        assert_eq!(filter.sql_prefix(), "");
    }

    #[test]
    fn test_range() {
        let filter = KeyFilter::new("/a/b", "/a/d");
        assert!(filter.matches("/a/c"));
        assert!(!filter.matches("/a/d"));
        assert_eq!(filter.sql_prefix(), "/a/");
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"/a/"), b"/a0".to_vec());
        assert_eq!(prefix_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_end(b""), vec![0]);
    }

    #[test]
    fn test_event_filters() {
        let filters = EventFilters::NOPUT;
        assert!(!filters.allows(false));
        assert!(filters.allows(true));
        assert!(EventFilters::default().allows(false));
    }
}
