// A bounded-load consistent hash ring over the configured shards.
//
// Built once at construction from the shard list and never mutated: every
// partition's owner chain (primary, then replication order) is precomputed,
// so `index_of` and `closest` are plain lookups afterward and can never fail
// once the ring exists (`closest` can still fail if asked for more replicas
// than there are shards).
//
// The ring parameters (partition count, virtual replicas per member, load
// factor) are fixed, matching the values the original `buraksezer/consistent`
// config used: P=71, V=20, L=1.25. We use `rapidhash` in place of xxhash64 —
// both are 64-bit non-cryptographic hashes; see DESIGN.md.

use kvstore_base::{err, Result};
use kvstore_topology::Shard;

const PARTITION_COUNT: usize = 71;
const VIRTUAL_REPLICAS: usize = 20;
const LOAD_FACTOR: f64 = 1.25;

fn hash_bytes(bytes: &[u8]) -> u64 {
    rapidhash::rapidhash(bytes)
}

struct RingPoint {
    position: u64,
    member: usize, // shard index
}

/// Consistent hash ring answering "which shards replicate key K, in
/// preference order?". Immutable and `Send + Sync` after construction.
pub struct Locator {
    member_count: usize,
    // owners[partition] is the full preference order (length == member_count)
    // for all keys that hash into that partition.
    owners: Vec<Vec<usize>>,
}

impl Locator {
    /// Builds the ring from the configured shard list. The shard set must be
    /// non-empty; an empty configuration is a configuration error, not a
    /// locator error, so callers are expected to have already validated that
    /// via `ShardingConfig`.
    pub fn new(shards: &[Shard]) -> Locator {
        let mut members: Vec<&Shard> = shards.iter().collect();
        members.sort_by_key(|s| s.idx);
        let member_count = members.len();

        let mut ring: Vec<RingPoint> = Vec::with_capacity(member_count * VIRTUAL_REPLICAS * PARTITION_COUNT);
        for shard in &members {
            for i in 0..(VIRTUAL_REPLICAS * PARTITION_COUNT) {
                let label = format!("{}-{}", shard.name, i);
                ring.push(RingPoint {
                    position: hash_bytes(label.as_bytes()),
                    member: shard.idx,
                });
            }
        }
        // Tie-break on member index keeps placement deterministic when two
        // virtual points land on the same position.
        ring.sort_by(|a, b| a.position.cmp(&b.position).then(a.member.cmp(&b.member)));

        let max_load = ((PARTITION_COUNT as f64 / member_count as f64) * LOAD_FACTOR).ceil() as usize;
        let max_load = max_load.max(1);

        let mut loads = vec![0usize; member_count];
        let mut owners = Vec::with_capacity(PARTITION_COUNT);

        for partition in 0..PARTITION_COUNT {
            let partition_hash = hash_bytes(&(partition as u64).to_be_bytes());
            let start = ring.partition_point(|p| p.position < partition_hash) % ring.len();

            let mut chain = Vec::with_capacity(member_count);
            let mut chosen = vec![false; member_count];

            // Two passes over the ring starting at `start`: one respecting
            // the load bound (so no member is handed more than its fair
            // share of partitions), one relaxed fallback that just picks
            // the next unchosen member if the bound can't be satisfied
            // without skipping every remaining member.
            for pass_respects_load in [true, false] {
                if chain.len() == member_count {
                    break;
                }
                for step in 0..ring.len() {
                    if chain.len() == member_count {
                        break;
                    }
                    let point = &ring[(start + step) % ring.len()];
                    let idx = point.member;
                    if chosen[idx] {
                        continue;
                    }
                    if pass_respects_load && loads[idx] >= max_load {
                        continue;
                    }
                    chosen[idx] = true;
                    loads[idx] += 1;
                    chain.push(idx);
                }
            }

            owners.push(chain);
        }

        Locator { member_count, owners }
    }

    fn partition_for(&self, key: &[u8]) -> usize {
        (hash_bytes(key) % PARTITION_COUNT as u64) as usize
    }

    /// Number of configured shards the ring was built from.
    pub fn member_count(&self) -> usize {
        self.member_count
    }

    /// The primary replica for `key`. Never fails once the ring is built.
    pub fn index_of(&self, key: &[u8]) -> usize {
        let partition = self.partition_for(key);
        self.owners[partition][0]
    }

    /// The primary plus the next `n - 1` replicas in preference order.
    /// Fails with an error if `n` exceeds the number of configured shards.
    pub fn closest(&self, key: &[u8], n: usize) -> Result<Vec<usize>> {
        if n > self.member_count {
            return Err(err(format!(
                "requested {} replicas but only {} shards are configured",
                n, self.member_count
            )));
        }
        let partition = self.partition_for(key);
        Ok(self.owners[partition][..n].to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn shards(n: usize) -> Vec<Shard> {
        (0..n)
            .map(|i| Shard {
                idx: i,
                name: format!("shard-{i}"),
                address: format!("localhost:{}", 8080 + i),
            })
            .collect()
    }

    #[test]
    fn closest_first_matches_index_of() {
        let locator = Locator::new(&shards(5));
        for key in ["a", "bb", "ccc", "distributed", "key-1234"] {
            let closest = locator.closest(key.as_bytes(), 3).unwrap();
            assert_eq!(closest[0], locator.index_of(key.as_bytes()));
        }
    }

    #[test]
    fn deterministic_across_fresh_constructions() {
        let a = Locator::new(&shards(4));
        let b = Locator::new(&shards(4));
        for key in ["apple", "banana", "cherry"] {
            assert_eq!(
                a.closest(key.as_bytes(), 4).unwrap(),
                b.closest(key.as_bytes(), 4).unwrap()
            );
        }
    }

    #[test]
    fn closest_rejects_n_over_member_count() {
        let locator = Locator::new(&shards(2));
        assert!(locator.closest(b"x", 3).is_err());
    }

    #[test]
    fn closest_returns_distinct_shards() {
        let locator = Locator::new(&shards(6));
        let chain = locator.closest(b"some-key", 6).unwrap();
        let mut sorted = chain.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), chain.len());
    }

    #[test]
    fn load_is_roughly_balanced() {
        // With 71 partitions spread over a small member count, no member
        // should end up the primary for wildly more than its fair share.
        let locator = Locator::new(&shards(3));
        let mut primary_counts = vec![0usize; 3];
        for partition in 0..PARTITION_COUNT {
            primary_counts[locator.owners[partition][0]] += 1;
        }
        let max_load = ((PARTITION_COUNT as f64 / 3.0) * LOAD_FACTOR).ceil() as usize;
        for count in primary_counts {
            assert!(count <= max_load, "count {count} exceeds max_load {max_load}");
        }
    }
}
