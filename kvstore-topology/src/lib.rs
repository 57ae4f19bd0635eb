// Immutable shard topology: which shards exist, at what address, and which
// one of them is "us". Built once at startup from the sharding config file
// and never mutated again, so it can be shared across threads without any
// synchronization once constructed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kvstore_base::{err, Error, Result};

/// A single configured shard: a stable index, a human name used only to
/// identify "the local one" at boot, and a dial address.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Shard {
    pub idx: usize,
    pub name: String,
    pub address: String,
}

/// The sharding config as it appears on disk: the shard list plus the two
/// cluster-wide knobs that govern replication. See `ShardingConfig::validate`
/// for the invariants a valid config must satisfy.
#[derive(Clone, Debug, Deserialize)]
pub struct ShardingConfig {
    pub shards: Vec<Shard>,
    pub replication_factor: usize,
    pub consistency_level: usize,
}

impl ShardingConfig {
    pub fn from_toml_str(text: &str) -> Result<ShardingConfig> {
        let cfg: ShardingConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.replication_factor < 1 {
            return Err(err("replication_factor must be >= 1"));
        }
        if self.consistency_level < 1 {
            return Err(err("consistency_level must be >= 1"));
        }
        if self.replication_factor > self.shards.len() {
            return Err(err(format!(
                "replication_factor {} exceeds configured shard count {}",
                self.replication_factor,
                self.shards.len()
            )));
        }
        if self.consistency_level > self.replication_factor {
            return Err(err(format!(
                "consistency_level {} exceeds replication_factor {}",
                self.consistency_level, self.replication_factor
            )));
        }
        Ok(())
    }
}

/// Dense index -> address map, plus which index is the local shard.
/// Read-only after construction; `Clone` is cheap enough (a `BTreeMap` of
/// small strings) that components that want their own handle can just
/// clone it rather than share an `Arc`, though most will wrap it in one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    count: usize,
    current_index: usize,
    addresses: BTreeMap<usize, String>,
    names: BTreeMap<usize, String>,
}

impl Topology {
    /// Builds a topology from a shard list and the local shard's name.
    /// Fails if any index is duplicated, if the indices are not a dense
    /// `[0, count)` range, or if `local_name` does not match any shard.
    pub fn new(shards: &[Shard], local_name: &str) -> Result<Topology> {
        let count = shards.len();
        let mut addresses = BTreeMap::new();
        let mut names = BTreeMap::new();
        let mut current_index = None;

        for shard in shards {
            if addresses.insert(shard.idx, shard.address.clone()).is_some() {
                return Err(err(format!("duplicate shard index: {}", shard.idx)));
            }
            names.insert(shard.idx, shard.name.clone());
            if shard.name == local_name {
                current_index = Some(shard.idx);
            }
        }

        for i in 0..count {
            if !addresses.contains_key(&i) {
                return Err(err(format!("shard index {} is not present", i)));
            }
        }

        let current_index =
            current_index.ok_or_else(|| err(format!("local shard {:?} was not found", local_name)))?;

        Ok(Topology {
            count,
            current_index,
            addresses,
            names,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn address(&self, index: usize) -> Option<&str> {
        self.addresses.get(&index).map(String::as_str)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(&index).map(String::as_str)
    }

    pub fn is_local(&self, index: usize) -> bool {
        index == self.current_index
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.addresses.keys().copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn shard(idx: usize, name: &str) -> Shard {
        Shard {
            idx,
            name: name.to_string(),
            address: format!("localhost:{}", 8080 + idx),
        }
    }

    #[test]
    fn dense_range_succeeds() {
        let shards = vec![shard(0, "Orhei"), shard(1, "Chisinau")];
        let topo = Topology::new(&shards, "Chisinau").unwrap();
        assert_eq!(topo.count(), 2);
        assert_eq!(topo.current_index(), 1);
        assert_eq!(topo.address(0), Some("localhost:8080"));
    }

    #[test]
    fn duplicate_index_fails() {
        let shards = vec![shard(0, "Orhei"), shard(0, "Chisinau")];
        assert!(Topology::new(&shards, "Orhei").is_err());
    }

    #[test]
    fn sparse_range_fails() {
        let shards = vec![shard(0, "Orhei"), shard(2, "Chisinau")];
        assert!(Topology::new(&shards, "Orhei").is_err());
    }

    #[test]
    fn unknown_local_name_fails() {
        let shards = vec![shard(0, "Orhei"), shard(1, "Chisinau")];
        assert!(Topology::new(&shards, "Balti").is_err());
    }

    #[test]
    fn config_rejects_w_greater_than_r() {
        let text = r#"
            replication_factor = 1
            consistency_level  = 2
            [[shards]]
              idx = 0
              name = "Orhei"
              address = "localhost:8080"
        "#;
        assert!(ShardingConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn config_rejects_r_greater_than_count() {
        let text = r#"
            replication_factor = 3
            consistency_level  = 1
            [[shards]]
              idx = 0
              name = "Orhei"
              address = "localhost:8080"
        "#;
        assert!(ShardingConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn config_accepts_valid_shape() {
        let text = r#"
            replication_factor = 2
            consistency_level  = 1
            [[shards]]
              idx = 0
              name = "Orhei"
              address = "localhost:8080"
            [[shards]]
              idx = 1
              name = "Chisinau"
              address = "localhost:8081"
        "#;
        let cfg = ShardingConfig::from_toml_str(text).unwrap();
        assert_eq!(cfg.shards.len(), 2);
    }
}
