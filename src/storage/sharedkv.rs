use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rocksdb::{DB, IteratorMode, Options};

/// Process-wide small-value store backing the inverted directory
/// index, per-host counters, and persistent purge marks.
///
/// Counters are 4-byte big-endian; `decr` saturates at zero.
pub trait SharedKv: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn incr(&self, key: &[u8], delta: u32) -> Result<u32>;
    fn decr(&self, key: &[u8], delta: u32) -> Result<u32>;
    fn drop_prefix(&self, prefix: &[u8]) -> Result<()>;
    fn iterate_prefix(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool)
        -> Result<()>;
    fn close(&self) {}
}

fn counter_of(raw: Option<Vec<u8>>) -> u32 {
    match raw {
        Some(bytes) if bytes.len() >= 4 => {
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        }
        _ => 0,
    }
}

/// Memory-backed shared KV; WAL-free by construction.
#[derive(Default)]
pub struct MemSharedKv {
    rows: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemSharedKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedKv for MemSharedKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.rows.lock().get(key).cloned()
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.rows.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.rows.lock().remove(key);
        Ok(())
    }

    fn incr(&self, key: &[u8], delta: u32) -> Result<u32> {
        let mut rows = self.rows.lock();
        let next = counter_of(rows.get(key).cloned()).saturating_add(delta);
        rows.insert(key.to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    fn decr(&self, key: &[u8], delta: u32) -> Result<u32> {
        let mut rows = self.rows.lock();
        let next = counter_of(rows.get(key).cloned()).saturating_sub(delta);
        rows.insert(key.to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    fn drop_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut rows = self.rows.lock();
        rows.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = {
            let rows = self.rows.lock();
            rows.range(prefix.to_vec()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in snapshot {
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }
}

/// Disk-backed shared KV for deployments that must survive restarts
/// (directory purge marks rely on this).
pub struct StoreSharedKv {
    db: DB,
}

impl StoreSharedKv {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)
            .with_context(|| format!("opening shared kv at {}", path.display()))?;
        Ok(Self { db })
    }
}

impl SharedKv for StoreSharedKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(key).ok().flatten()
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value).context("shared kv put")
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key).context("shared kv delete")
    }

    fn incr(&self, key: &[u8], delta: u32) -> Result<u32> {
        let next = counter_of(self.get(key)).saturating_add(delta);
        self.set(key, &next.to_be_bytes())?;
        Ok(next)
    }

    fn decr(&self, key: &[u8], delta: u32) -> Result<u32> {
        let next = counter_of(self.get(key)).saturating_sub(delta);
        self.set(key, &next.to_be_bytes())?;
        Ok(next)
    }

    fn drop_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut doomed = Vec::new();
        self.iterate_prefix(prefix, &mut |key, _| {
            doomed.push(key.to_vec());
            true
        })?;
        for key in doomed {
            self.db.delete(&key).context("shared kv delete")?;
        }
        Ok(())
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let mode = IteratorMode::From(prefix, rocksdb::Direction::Forward);
        for row in self.db.iterator(mode) {
            let (key, value) = row.context("shared kv iterate")?;
            if !key.starts_with(prefix) {
                break;
            }
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn close(&self) {
        let _ = self.db.flush();
    }
}
