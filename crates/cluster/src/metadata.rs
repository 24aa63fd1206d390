use std::collections::BTreeMap;

use models::simple_match;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub num_shards: u32,
}

/// A data stream and the backing indices it currently consists of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStream {
    pub name: String,
    pub indices: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub name: String,
    #[serde(default)]
    pub readonly: bool,
}

/// The cluster-level metadata the snapshot engine consults: live indices,
/// data streams, and registered repositories.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub indices: BTreeMap<String, IndexMetadata>,
    pub data_streams: BTreeMap<String, DataStream>,
    pub repositories: BTreeMap<String, RepositoryMetadata>,
}

impl Metadata {
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryMetadata> {
        self.repositories.get(name)
    }

    /// Expands request patterns into concrete index names plus selected
    /// data streams. Globs match live indices and data streams; a concrete
    /// name is passed through even when the index no longer exists, so the
    /// admission path can record it as missing rather than silently
    /// dropping it. Data-stream matches contribute their backing indices.
    pub fn resolve_indices<S: AsRef<str>>(&self, patterns: &[S]) -> (Vec<String>, Vec<String>) {
        let mut indices = Vec::new();
        let mut streams = Vec::new();

        let mut push_index = |name: &str, indices: &mut Vec<String>| {
            if !indices.iter().any(|i| i == name) {
                indices.push(name.to_string());
            }
        };

        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !pattern.contains('*') {
                if let Some(stream) = self.data_streams.get(pattern) {
                    streams.push(stream.name.clone());
                    for backing in &stream.indices {
                        push_index(backing, &mut indices);
                    }
                } else {
                    push_index(pattern, &mut indices);
                }
                continue;
            }
            for name in self.indices.keys() {
                if simple_match(pattern, name) {
                    push_index(name, &mut indices);
                }
            }
            for stream in self.data_streams.values() {
                if simple_match(pattern, &stream.name) {
                    streams.push(stream.name.clone());
                    for backing in &stream.indices {
                        push_index(backing, &mut indices);
                    }
                }
            }
        }
        streams.sort();
        streams.dedup();
        (indices, streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Metadata {
        let mut m = Metadata::default();
        for (name, shards) in [("logs-1", 2), ("logs-2", 1), ("metrics", 3)] {
            m.indices.insert(
                name.to_string(),
                IndexMetadata {
                    name: name.to_string(),
                    num_shards: shards,
                },
            );
        }
        m.data_streams.insert(
            "events".to_string(),
            DataStream {
                name: "events".to_string(),
                indices: vec!["logs-1".to_string(), "logs-2".to_string()],
            },
        );
        m
    }

    #[test]
    fn resolves_globs_and_streams() {
        let m = metadata();

        let (indices, streams) = m.resolve_indices(&["logs-*"]);
        assert_eq!(indices, vec!["logs-1", "logs-2"]);
        assert!(streams.is_empty());

        let (indices, streams) = m.resolve_indices(&["events"]);
        assert_eq!(indices, vec!["logs-1", "logs-2"]);
        assert_eq!(streams, vec!["events"]);

        // Concrete missing names pass through for the admission path to
        // mark missing.
        let (indices, _) = m.resolve_indices(&["gone"]);
        assert_eq!(indices, vec!["gone"]);
    }
}
