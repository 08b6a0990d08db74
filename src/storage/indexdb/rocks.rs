use std::path::Path;

use anyhow::{Context, Result};
use rocksdb::{DB, IteratorMode, Options};

use super::{codec, IndexDb};
use crate::object::Metadata;

/// LSM index driver over RocksDB; the durable reference engine.
pub struct RocksIndex {
    db: DB,
}

impl RocksIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)
            .with_context(|| format!("opening index db at {}", path.display()))?;
        Ok(Self { db })
    }
}

impl IndexDb for RocksIndex {
    fn get(&self, hash: &[u8]) -> Result<Option<Metadata>> {
        match self.db.get(hash).context("index get")? {
            Some(raw) => Ok(Some(codec::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn set(&self, hash: &[u8], meta: &Metadata) -> Result<()> {
        let raw = codec::encode(meta)?;
        self.db.put(hash, raw).context("index put")
    }

    fn delete(&self, hash: &[u8]) -> Result<()> {
        self.db.delete(hash).context("index delete")
    }

    fn exists(&self, hash: &[u8]) -> bool {
        matches!(self.db.get(hash), Ok(Some(_)))
    }

    fn iterate(
        &self,
        prefix: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], Metadata) -> bool,
    ) -> Result<()> {
        let mode = match prefix {
            Some(p) => IteratorMode::From(p, rocksdb::Direction::Forward),
            None => IteratorMode::Start,
        };
        for row in self.db.iterator(mode) {
            let (key, raw) = row.context("index iterate")?;
            if let Some(p) = prefix
                && !key.starts_with(p)
            {
                break;
            }
            let meta = codec::decode(&raw)?;
            if !f(&key, meta) {
                break;
            }
        }
        Ok(())
    }

    fn close(&self) {
        // handles drop with the struct; flush what the memtable holds
        let _ = self.db.flush();
    }
}
