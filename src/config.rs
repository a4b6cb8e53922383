//! Options for opening a core and running a replicator.

use serde::{Deserialize, Serialize};

use crate::{
    prelude::*,
    verifier::{KeyPair, Manifest},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreOptions {
    /// Initialize an empty core when the storage holds none.
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
    /// Discard whatever the storage holds.
    #[serde(default)]
    pub overwrite: bool,
    /// Mutations between oplog flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// Oplog size in bytes that forces a flush.
    #[serde(default = "default_max_oplog_size")]
    pub max_oplog_size: u64,
    /// Nodes kept by the private cache, when no shared cache is given.
    #[serde(default = "default_tree_cache_size")]
    pub tree_cache_size: usize,
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
    /// Defaults to a single-signer manifest of `key_pair`.
    #[serde(default)]
    pub manifest: Option<Manifest>,
    /// Opens a replica of a known core. Its manifest arrives with the first
    /// upgrade.
    #[serde(default)]
    pub key: Option<Hash>,
    /// Fork transitions remembered in the header.
    #[serde(default = "default_fork_hint_limit")]
    pub fork_hint_limit: usize,
}

fn default_true() -> bool {
    true
}
fn default_flush_interval() -> u64 {
    4
}
fn default_max_oplog_size() -> u64 {
    8 * 1024 * 1024
}
fn default_tree_cache_size() -> usize {
    128
}
fn default_fork_hint_limit() -> usize {
    16
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: default_true(),
            overwrite: false,
            flush_interval: default_flush_interval(),
            max_oplog_size: default_max_oplog_size(),
            tree_cache_size: default_tree_cache_size(),
            key_pair: None,
            manifest: None,
            key: None,
            fork_hint_limit: default_fork_hint_limit(),
        }
    }
}

impl CoreOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn with_key(mut self, key: Hash) -> Self {
        self.key = Some(key);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorOptions {
    /// Requests in flight per peer.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Ticks a request may stay unanswered before it is reassigned.
    #[serde(default = "default_request_timeout_ticks")]
    pub request_timeout_ticks: u32,
    /// Ask peers for upgrades even when nothing is waiting on one.
    #[serde(default = "default_true")]
    pub eager_upgrade: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_max_inflight() -> usize {
    16
}
fn default_request_timeout_ticks() -> u32 {
    10
}
fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            request_timeout_ticks: default_request_timeout_ticks(),
            eager_upgrade: default_true(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl ReplicatorOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(CoreOptions::from_json("{}").unwrap(), CoreOptions::default());
        assert_eq!(
            ReplicatorOptions::from_json("{}").unwrap(),
            ReplicatorOptions::default()
        );
    }

    #[test]
    fn test_partial_json() {
        let options = CoreOptions::from_json(r#"{"flush_interval": 1, "overwrite": true}"#).unwrap();

        assert_eq!(options.flush_interval, 1);
        assert!(options.overwrite);
        assert_eq!(options.max_oplog_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_key_pair_from_json() {
        let seed = [3u8; 32];
        let json = serde_json::json!({ "key_pair": seed }).to_string();

        let options = CoreOptions::from_json(&json).unwrap();
        assert_eq!(options.key_pair, Some(KeyPair::from_seed(&seed)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ReplicatorOptions::from_json(r#"{"max_inflight": "many"}"#),
            Err(Error::FailedDeserialization(_))
        ));
    }
}
