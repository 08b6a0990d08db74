use std::collections::BTreeMap;

use anyhow::Result;
use parking_lot::Mutex;

use super::{codec, IndexDb};
use crate::object::Metadata;

/// Ordered in-memory index driver; the storage behind the in-memory
/// bucket and the default for unit tests.
#[derive(Default)]
pub struct MemoryIndex {
    rows: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexDb for MemoryIndex {
    fn get(&self, hash: &[u8]) -> Result<Option<Metadata>> {
        match self.rows.lock().get(hash) {
            Some(raw) => Ok(Some(codec::decode(raw)?)),
            None => Ok(None),
        }
    }

    fn set(&self, hash: &[u8], meta: &Metadata) -> Result<()> {
        let raw = codec::encode(meta)?;
        self.rows.lock().insert(hash.to_vec(), raw);
        Ok(())
    }

    fn delete(&self, hash: &[u8]) -> Result<()> {
        self.rows.lock().remove(hash);
        Ok(())
    }

    fn exists(&self, hash: &[u8]) -> bool {
        self.rows.lock().contains_key(hash)
    }

    fn iterate(
        &self,
        prefix: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], Metadata) -> bool,
    ) -> Result<()> {
        // Snapshot under the lock so the callback can write back into
        // the index without deadlocking.
        let rows: Vec<(Vec<u8>, Vec<u8>)> = {
            let guard = self.rows.lock();
            guard
                .iter()
                .filter(|(key, _)| prefix.is_none_or(|p| key.starts_with(p)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, raw) in rows {
            let meta = codec::decode(&raw)?;
            if !f(&key, meta) {
                break;
            }
        }
        Ok(())
    }
}
