//! Deterministic routing of bucket keys to writer instances.
//!
//! The same computation is used on the sending side (to physically route a record to a writer
//! instance) and on the receiving side (so each writer instance can locally decide, from its own
//! index and the parallelism, which buckets it is responsible for); no extra coordination is
//! needed to agree on ownership.

use serde::{Deserialize, Serialize};

/// A deterministic, stable identifier for a disjoint shard of a table's data:
/// (partition value, bucket id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub partition: String,
    pub bucket: u32,
}

impl BucketKey {
    pub fn new(partition: impl Into<String>, bucket: u32) -> Self {
        Self {
            partition: partition.into(),
            bucket,
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition, self.bucket)
    }
}

/// FNV-1a over arbitrary bytes. The routing hash must be identical across processes and restarts,
/// so we cannot use a randomly keyed hasher here.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps bucket keys to writer-instance indices for a fixed parallelism.
///
/// Pure, total, and deterministic: identical bucket key implies identical owning instance for a
/// fixed `num_channels`. Distribution is roughly uniform across instances.
#[derive(Debug, Clone, Copy)]
pub struct ChannelComputer {
    num_channels: usize,
}

impl ChannelComputer {
    pub fn new(num_channels: usize) -> Self {
        assert!(num_channels > 0, "num_channels must be positive");
        Self { num_channels }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// The writer-instance index in `[0, num_channels)` that owns `key`.
    pub fn channel(&self, key: &BucketKey) -> usize {
        let mut bytes = key.partition.as_bytes().to_vec();
        bytes.extend_from_slice(&key.bucket.to_be_bytes());
        (stable_hash(&bytes) % self.num_channels as u64) as usize
    }

    /// Whether the instance at `index` owns `key` under this parallelism.
    pub fn owns(&self, index: usize, key: &BucketKey) -> bool {
        self.channel(key) == index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<BucketKey> {
        let mut keys = Vec::new();
        for partition in ["2024-01-01", "2024-01-02", "", "p=b/7"] {
            for bucket in 0..64 {
                keys.push(BucketKey::new(partition, bucket));
            }
        }
        keys
    }

    #[test]
    fn channel_is_deterministic() {
        let computer = ChannelComputer::new(4);
        for key in keys() {
            let first = computer.channel(&key);
            for _ in 0..10 {
                assert_eq!(computer.channel(&key), first);
            }
            assert!(first < 4);
        }
    }

    #[test]
    fn channels_partition_the_bucket_space() {
        // For any parallelism, the per-instance ownership sets partition the bucket space
        // exactly: every key is owned by one and only one instance.
        for parallelism in [1, 2, 3, 7, 16] {
            let computer = ChannelComputer::new(parallelism);
            for key in keys() {
                let owners: Vec<_> = (0..parallelism)
                    .filter(|index| computer.owns(*index, &key))
                    .collect();
                assert_eq!(owners.len(), 1, "key {key} owners under p={parallelism}");
                assert_eq!(owners[0], computer.channel(&key));
            }
        }
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let parallelism = 4;
        let computer = ChannelComputer::new(parallelism);
        let mut counts = vec![0usize; parallelism];
        let keys = keys();
        for key in &keys {
            counts[computer.channel(key)] += 1;
        }
        let expected = keys.len() / parallelism;
        for count in counts {
            // No instance should be starved or overloaded beyond 2x.
            assert!(count > expected / 2 && count < expected * 2, "count {count}");
        }
    }

    #[test]
    fn stable_hash_has_fixed_values() {
        // Pinned values: routing must not drift between releases, or bucket ownership would
        // silently reshuffle across a job restart.
        assert_eq!(stable_hash(b""), 0xcbf29ce484222325);
        assert_eq!(stable_hash(b"a"), 0xaf63dc4c8601ec8c);
    }
}
