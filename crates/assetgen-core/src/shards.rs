//! Sharded safetensors indexes
//!
//! Large components ship as `<name>.safetensors.index.json` plus shards. The
//! index maps every tensor to its shard; only the set of shards matters here.

use crate::error::{ResolveError, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Shard files named by an index, deduplicated, sorted and resolved next to it
pub fn read_shard_index(index: &Path) -> Result<Vec<PathBuf>> {
    let content =
        std::fs::read_to_string(index).map_err(|source| ResolveError::ShardIndexUnreadable {
            path: index.to_path_buf(),
            source,
        })?;
    let parsed: ShardIndex =
        serde_json::from_str(&content).map_err(|source| ResolveError::InvalidShardIndex {
            path: index.to_path_buf(),
            source,
        })?;

    let dir = index.parent().unwrap_or_else(|| Path::new(""));
    let shards: BTreeSet<&String> = parsed.weight_map.values().collect();
    Ok(shards.into_iter().map(|s| dir.join(s)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shards_deduplicated_and_sorted() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("model.safetensors.index.json");
        std::fs::write(
            &index,
            r#"{"metadata": {"total_size": 4}, "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.norm.weight": "model-00001-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        assert_eq!(
            read_shard_index(&index).unwrap(),
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_missing_weight_map() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("model.safetensors.index.json");
        std::fs::write(&index, r#"{"metadata": {}}"#).unwrap();

        assert!(matches!(
            read_shard_index(&index),
            Err(ResolveError::InvalidShardIndex { .. })
        ));
    }

    #[test]
    fn test_missing_index_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            read_shard_index(&dir.path().join("absent.index.json")),
            Err(ResolveError::ShardIndexUnreadable { .. })
        ));
    }
}
