use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use tokio::sync::mpsc;

/// A key/value pair pushed out of the cache by bounds management.
#[derive(Debug, Clone)]
pub struct Eviction<K, V> {
    pub key: K,
    pub value: V,
}

struct Entry<V> {
    value: V,
    freq: u64,
    seq: u64,
}

/// LFU cache with frequency buckets.
///
/// Entries enter at frequency 1; `get`/`set` on an existing key advance
/// the entry to the next frequency bucket. When `len` exceeds
/// `upper_bound` the cache evicts from the lowest frequency bucket,
/// oldest entry first, down to `lower_bound`. Evictions are offered to
/// the sink with `try_send`; a full receiver drops the notification.
///
/// The structure is not internally synchronized; buckets guard it with
/// their own mutex.
pub struct LfuCache<K, V> {
    upper_bound: usize,
    lower_bound: usize,
    entries: HashMap<K, Entry<V>>,
    freqs: BTreeMap<u64, BTreeMap<u64, K>>,
    seq: u64,
    eviction: Option<mpsc::Sender<Eviction<K, V>>>,
}

impl<K, V> LfuCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            upper_bound: capacity,
            lower_bound: capacity,
            entries: HashMap::new(),
            freqs: BTreeMap::new(),
            seq: 0,
            eviction: None,
        }
    }

    pub fn set_eviction_sink(&mut self, sink: mpsc::Sender<Eviction<K, V>>) {
        self.eviction = Some(sink);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the value and advances the entry's frequency.
    pub fn get(&mut self, key: &K) -> Option<V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.increment(key);
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Returns the value without touching the frequency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn frequency(&self, key: &K) -> u64 {
        self.entries.get(key).map(|e| e.freq).unwrap_or(0)
    }

    pub fn set(&mut self, key: K, value: V) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            self.increment(&key);
            return;
        }

        self.seq += 1;
        let seq = self.seq;
        self.entries.insert(key.clone(), Entry { value, freq: 1, seq });
        self.freqs.entry(1).or_default().insert(seq, key);

        if self.upper_bound > 0 && self.entries.len() > self.upper_bound {
            let excess = self.entries.len() - self.lower_bound.min(self.upper_bound);
            self.evict(excess);
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.detach(entry.freq, entry.seq);
        true
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Top `k` keys, highest frequency first; ties resolve newest
    /// promoted first.
    pub fn top_k(&self, k: usize) -> Vec<K> {
        let mut out = Vec::with_capacity(k);
        for bucket in self.freqs.values().rev() {
            for key in bucket.values().rev() {
                out.push(key.clone());
                if out.len() == k {
                    return out;
                }
            }
        }
        out
    }

    /// Evicts up to `count` entries from the lowest frequencies.
    pub fn evict(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some(&freq) = self.freqs.keys().next() else {
                break;
            };
            let victim = {
                let bucket = self.freqs.get_mut(&freq).expect("bucket present");
                let seq = bucket.keys().next().copied();
                let key = seq.and_then(|seq| bucket.remove(&seq));
                if bucket.is_empty() {
                    self.freqs.remove(&freq);
                }
                key
            };
            let Some(key) = victim else { continue };
            if let Some(entry) = self.entries.remove(&key) {
                if let Some(sink) = &self.eviction {
                    let _ = sink.try_send(Eviction {
                        key,
                        value: entry.value,
                    });
                }
                evicted += 1;
            }
        }
        evicted
    }

    fn increment(&mut self, key: &K) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let old_freq = entry.freq;
        let old_seq = entry.seq;
        self.seq += 1;
        entry.freq += 1;
        entry.seq = self.seq;
        let (freq, seq) = (entry.freq, entry.seq);
        self.detach(old_freq, old_seq);
        self.freqs.entry(freq).or_default().insert(seq, key.clone());
    }

    fn detach(&mut self, freq: u64, seq: u64) {
        if let Some(bucket) = self.freqs.get_mut(&freq) {
            bucket.remove(&seq);
            if bucket.is_empty() {
                self.freqs.remove(&freq);
            }
        }
    }
}
