use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use parking_lot::RwLock;

use super::Bucket;
use crate::object::IdHash;

pub const DEFAULT_REPLICAS: u32 = 20;

/// Consistent-hash bucket selector with weighted virtual nodes.
///
/// Each bucket contributes `replicas × weight` ring positions keyed by
/// `"<i>|<w>|<bucket_id>"`. Selection walks clockwise from the object
/// hash to the first distinct bucket that is accepting. The ring is
/// rebuilt rarely; readers clone a snapshot.
pub struct Selector {
    replicas: u32,
    ring: RwLock<Arc<Ring>>,
}

struct Ring {
    /// (position, bucket index), sorted by position.
    positions: Vec<(u64, usize)>,
    buckets: Vec<Arc<dyn Bucket>>,
}

impl Selector {
    pub fn new(buckets: Vec<Arc<dyn Bucket>>) -> Self {
        Self::with_replicas(buckets, DEFAULT_REPLICAS)
    }

    pub fn with_replicas(buckets: Vec<Arc<dyn Bucket>>, replicas: u32) -> Self {
        let replicas = replicas.max(1);
        let ring = Arc::new(build_ring(&buckets, replicas));
        Self {
            replicas,
            ring: RwLock::new(ring),
        }
    }

    /// Atomic swap of the ring; cheap for readers, infrequent for the
    /// writer.
    pub fn rebuild(&self, buckets: Vec<Arc<dyn Bucket>>) {
        let ring = Arc::new(build_ring(&buckets, self.replicas));
        *self.ring.write() = ring;
    }

    pub fn select(&self, hash: &IdHash) -> Option<Arc<dyn Bucket>> {
        let ring = self.ring.read().clone();
        if ring.positions.is_empty() {
            return None;
        }

        let key = hash_bytes(hash);
        let start = match ring.positions.binary_search_by(|(pos, _)| pos.cmp(&key)) {
            Ok(i) => i,
            Err(i) if i == ring.positions.len() => 0,
            Err(i) => i,
        };

        // walk distinct buckets clockwise until one accepts
        let mut seen = Vec::with_capacity(ring.buckets.len());
        for step in 0..ring.positions.len() {
            let (_, bucket_idx) = ring.positions[(start + step) % ring.positions.len()];
            if seen.contains(&bucket_idx) {
                continue;
            }
            seen.push(bucket_idx);
            let bucket = &ring.buckets[bucket_idx];
            if bucket.accepting() {
                return Some(bucket.clone());
            }
            if seen.len() == ring.buckets.len() {
                break;
            }
        }
        None
    }

    pub fn buckets(&self) -> Vec<Arc<dyn Bucket>> {
        self.ring.read().buckets.clone()
    }
}

fn build_ring(buckets: &[Arc<dyn Bucket>], replicas: u32) -> Ring {
    let mut positions = Vec::new();
    for (bucket_idx, bucket) in buckets.iter().enumerate() {
        let weight = bucket.weight().clamp(1, 1000);
        for i in 0..replicas {
            for w in 0..weight {
                let vkey = format!("{i}|{w}|{}", bucket.id());
                positions.push((hash_bytes(vkey.as_bytes()), bucket_idx));
            }
        }
    }
    positions.sort_unstable();
    Ring {
        positions,
        buckets: buckets.to_vec(),
    }
}

fn hash_bytes(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}
