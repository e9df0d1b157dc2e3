//! Coordination path layout and node-name encoding.
//!
//! # Path Layout
//!
//! Every consumer triple `(topic, partition, name)` owns one subtree:
//!
//! ```text
//! /<namespace>/consumer/<topic>/<partition>/<name>/offset   committed offset, decimal text
//! /<namespace>/consumer/<topic>/<partition>/<name>/leader   parent of election candidates
//! ```
//!
//! # Candidate Nodes
//!
//! Election candidates are created as `<leader>/<election-id>_` in
//! ephemeral-sequential mode; the store appends a zero-padded sequence, so a
//! live node looks like `3f9a..c1_0000000042`.

use crate::constants::CANDIDATE_SEPARATOR;

/// Coordination paths of one `(topic, partition, name)` consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerPaths {
    base: String,
}

impl ConsumerPaths {
    /// Build the paths for a consumer triple under `namespace`.
    pub fn new(namespace: &str, topic: &str, partition: i32, name: &str) -> Self {
        let namespace = namespace.trim_matches('/');
        Self {
            base: format!("/{namespace}/consumer/{topic}/{partition}/{name}"),
        }
    }

    /// Root of this consumer's subtree.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Path holding the committed offset.
    pub fn offset(&self) -> String {
        join(&self.base, "offset")
    }

    /// Parent path of the election candidates.
    pub fn leader(&self) -> String {
        join(&self.base, "leader")
    }
}

/// Join a parent path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a path (`/` for top-level nodes, `None` for the root).
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last component of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Name prefix of all candidates created by election `id`.
pub fn candidate_prefix(id: &str) -> String {
    format!("{id}{CANDIDATE_SEPARATOR}")
}

/// Sequence number of a candidate node name.
///
/// Accepts bare names and full paths.
pub fn sequence_number(node: &str) -> Option<u64> {
    let name = node_name(node);
    let (_, suffix) = name.rsplit_once(CANDIDATE_SEPARATOR)?;
    suffix.parse().ok()
}

/// Encode a committed offset for storage.
pub fn encode_offset(offset: i64) -> String {
    offset.to_string()
}

/// Decode a stored offset.
///
/// Empty (or whitespace-only) data means "never committed".
pub fn decode_offset(data: &[u8]) -> Result<Option<i64>, String> {
    let text = String::from_utf8_lossy(data);
    let text = text.trim();

    if text.is_empty() {
        return Ok(None);
    }

    text.parse::<i64>().map(Some).map_err(|_| text.to_string())
}

/// Check that a path is absolute and has no empty components.
pub fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_paths() {
        let paths = ConsumerPaths::new("kafka_sync", "products", 3, "indexer");

        assert_eq!(paths.base(), "/kafka_sync/consumer/products/3/indexer");
        assert_eq!(paths.offset(), "/kafka_sync/consumer/products/3/indexer/offset");
        assert_eq!(paths.leader(), "/kafka_sync/consumer/products/3/indexer/leader");
    }

    #[test]
    fn test_namespace_slashes_are_trimmed() {
        let paths = ConsumerPaths::new("/app/", "t", 0, "n");
        assert_eq!(paths.base(), "/app/consumer/t/0/n");
    }

    #[test]
    fn test_distinct_triples_get_distinct_paths() {
        let a = ConsumerPaths::new("ns", "t", 0, "n");
        let b = ConsumerPaths::new("ns", "t", 1, "n");
        let c = ConsumerPaths::new("ns", "t", 0, "m");

        assert_ne!(a.offset(), b.offset());
        assert_ne!(a.leader(), c.leader());
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");

        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
    }

    #[test]
    fn test_sequence_number() {
        assert_eq!(sequence_number("abc_0000000042"), Some(42));
        assert_eq!(sequence_number("/x/leader/abc_0000000007"), Some(7));
        assert_eq!(sequence_number("a_b_0000000003"), Some(3));
        assert_eq!(sequence_number("no-separator"), None);
        assert_eq!(sequence_number("abc_"), None);
    }

    #[test]
    fn test_candidate_prefix() {
        assert_eq!(candidate_prefix("deadbeef"), "deadbeef_");
        assert!("deadbeef_0000000001".starts_with(&candidate_prefix("deadbeef")));
    }

    #[test]
    fn test_decode_offset() {
        assert_eq!(decode_offset(b"42"), Ok(Some(42)));
        assert_eq!(decode_offset(b" 7\n"), Ok(Some(7)));
        assert_eq!(decode_offset(b""), Ok(None));
        assert_eq!(decode_offset(b"   "), Ok(None));
        assert_eq!(decode_offset(b"abc"), Err("abc".to_string()));
        assert_eq!(encode_offset(1234), "1234");
    }

    #[test]
    fn test_is_valid_path() {
        assert!(is_valid_path("/"));
        assert!(is_valid_path("/a/b"));
        assert!(!is_valid_path("a/b"));
        assert!(!is_valid_path("/a/"));
        assert!(!is_valid_path("/a//b"));
    }
}
