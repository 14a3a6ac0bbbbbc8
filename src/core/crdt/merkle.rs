// src/core/crdt/merkle.rs

//! Bucketed Merkle tree used by the anti-entropy sync protocol. Each key
//! hashes to one of a fixed number of buckets; a bucket's hash is the XOR of
//! its per-key record hashes, so updates are incremental in O(1).

use crc::{CRC_32_ISO_HDLC, Crc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub const MERKLE_BUCKETS: usize = 256;

const BUCKET_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Returns the bucket index for a key.
pub fn bucket_for_key(key: &str) -> u32 {
    BUCKET_CRC.checksum(key.as_bytes()) % MERKLE_BUCKETS as u32
}

fn record_hash(key: &str, serialized: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0]);
    hasher.update(serialized);
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("sha256 digest is 32 bytes"))
}

/// One tree per map. The XOR construction makes insert and remove symmetric:
/// updating a key XORs out its previous hash and XORs in the new one.
#[derive(Debug)]
pub struct MerkleTree {
    buckets: Mutex<[u64; MERKLE_BUCKETS]>,
    key_hashes: DashMap<String, u64>,
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleTree {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new([0; MERKLE_BUCKETS]),
            key_hashes: DashMap::new(),
        }
    }

    /// Records the current serialized form of `key`'s record.
    pub fn update(&self, key: &str, serialized: &[u8]) {
        let new_hash = record_hash(key, serialized);
        let bucket = bucket_for_key(key) as usize;
        let old_hash = self.key_hashes.insert(key.to_string(), new_hash);
        let mut buckets = self.buckets.lock();
        if let Some(old) = old_hash {
            buckets[bucket] ^= old;
        }
        buckets[bucket] ^= new_hash;
    }

    /// Removes `key` from the tree (after a tombstone prune).
    pub fn remove(&self, key: &str) {
        if let Some((_, old)) = self.key_hashes.remove(key) {
            let bucket = bucket_for_key(key) as usize;
            self.buckets.lock()[bucket] ^= old;
        }
    }

    /// The root hash over all buckets, hex encoded.
    pub fn root(&self) -> String {
        let buckets = self.buckets.lock();
        let mut hasher = Sha256::new();
        for hash in buckets.iter() {
            hasher.update(hash.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// The raw hash of a single bucket.
    pub fn bucket(&self, index: u32) -> u64 {
        self.buckets.lock()[index as usize % MERKLE_BUCKETS]
    }

    /// All non-empty buckets as `(index, hash)` pairs.
    pub fn buckets(&self) -> Vec<(u32, u64)> {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .enumerate()
            .filter(|(_, h)| **h != 0)
            .map(|(i, h)| (i as u32, *h))
            .collect()
    }

    /// Keys currently hashed into `bucket`.
    pub fn keys_in_bucket(&self, bucket: u32) -> Vec<String> {
        self.key_hashes
            .iter()
            .filter(|e| bucket_for_key(e.key()) == bucket)
            .map(|e| e.key().clone())
            .collect()
    }
}

