mod memory;
mod rocks;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::object::Metadata;

pub use memory::MemoryIndex;
pub use rocks::RocksIndex;

/// Per-bucket metadata index: a persistent ordered map from the raw
/// 20-byte object hash to a serialized [`Metadata`] row.
///
/// Implementations must be safe for concurrent readers and serialize
/// writers; the LSM driver is the reference.
pub trait IndexDb: Send + Sync {
    fn get(&self, hash: &[u8]) -> Result<Option<Metadata>>;
    fn set(&self, hash: &[u8], meta: &Metadata) -> Result<()>;
    fn delete(&self, hash: &[u8]) -> Result<()>;
    fn exists(&self, hash: &[u8]) -> bool;
    /// Yields rows in key order, optionally restricted to a prefix;
    /// the callback returns false to stop.
    fn iterate(
        &self,
        prefix: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], Metadata) -> bool,
    ) -> Result<()>;
    fn close(&self) {}
}

/// Opens an index driver by name. `rocks` is the durable default;
/// `memory` backs the in-memory bucket and tests.
pub fn create(db_type: &str, path: &Path) -> Result<Arc<dyn IndexDb>> {
    match db_type {
        "" | "rocks" => Ok(Arc::new(RocksIndex::open(path)?)),
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        other => bail!("unknown index db type {other:?}"),
    }
}

pub(super) mod codec {
    use anyhow::{Context, Result};

    use crate::object::Metadata;

    pub fn encode(meta: &Metadata) -> Result<Vec<u8>> {
        serde_json::to_vec(meta).context("encoding metadata row")
    }

    pub fn decode(raw: &[u8]) -> Result<Metadata> {
        serde_json::from_slice(raw).context("decoding metadata row")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectId;

    fn sample(path: &str) -> Metadata {
        let id = ObjectId::new(path);
        let mut md = Metadata::new(&id, 200, 1024, 512, 1_700_000_000);
        md.chunks.set(0);
        md
    }

    #[test]
    fn memory_driver_roundtrips() {
        let db = MemoryIndex::new();
        let md = sample("http://example.com/a");
        let hash = md.id().hash();

        assert!(db.get(&hash).unwrap().is_none());
        db.set(&hash, &md).unwrap();
        assert!(db.exists(&hash));

        let back = db.get(&hash).unwrap().unwrap();
        assert_eq!(back.path, md.path);
        assert_eq!(back.chunks, md.chunks);

        db.delete(&hash).unwrap();
        assert!(!db.exists(&hash));
        // idempotent
        db.delete(&hash).unwrap();
    }

    #[test]
    fn memory_driver_iterates_in_key_order() {
        let db = MemoryIndex::new();
        let mds: Vec<Metadata> = (0..8)
            .map(|i| sample(&format!("http://example.com/{i}")))
            .collect();
        for md in &mds {
            db.set(&md.id().hash(), md).unwrap();
        }

        let mut keys = Vec::new();
        db.iterate(None, &mut |key, _| {
            keys.push(key.to_vec());
            true
        })
        .unwrap();
        assert_eq!(keys.len(), 8);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        // early stop
        let mut seen = 0;
        db.iterate(None, &mut |_, _| {
            seen += 1;
            seen < 3
        })
        .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn rocks_driver_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksIndex::open(dir.path()).unwrap();
        let md = sample("http://example.com/rocks");
        let hash = md.id().hash();

        db.set(&hash, &md).unwrap();
        assert!(db.exists(&hash));
        let back = db.get(&hash).unwrap().unwrap();
        assert_eq!(back.size, md.size);

        let mut count = 0;
        db.iterate(None, &mut |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 1);

        db.delete(&hash).unwrap();
        assert!(db.get(&hash).unwrap().is_none());
    }

    #[test]
    fn unknown_driver_is_rejected() {
        assert!(create("bolt", Path::new("/tmp/x")).is_err());
    }
}
