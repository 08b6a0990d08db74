use http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::{Bitmap, ObjectId};

/// Metadata flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u32);

impl Flags {
    pub const CACHE: Flags = Flags(1);
    /// Root entry of a vary family; carries `virtual_keys`, no chunks.
    pub const VARY_INDEX: Flags = Flags(1 << 1);
    /// Variant child; its id was formed with a non-empty variant key.
    pub const VARY_CACHE: Flags = Flags(1 << 2);
    /// Object size was unknown at fetch time (no Content-Length).
    pub const CHUNKED_CACHE: Flags = Flags(1 << 3);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Per-object record stored in the chunk index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub path: String,
    pub ext: String,
    pub code: u16,
    pub size: u64,
    pub block_size: u64,
    pub chunks: Bitmap,
    /// Reserved range accounting; carried but not maintained.
    pub parts: Bitmap,
    #[serde(with = "header_codec")]
    pub headers: HeaderMap,
    pub resp_unix: i64,
    pub last_ref_unix: i64,
    pub expires_at: i64,
    pub refs: u64,
    pub flags: Flags,
    pub virtual_keys: Vec<String>,
}

impl Metadata {
    pub fn new(id: &ObjectId, code: u16, size: u64, block_size: u64, now: i64) -> Self {
        Self {
            path: id.path().to_string(),
            ext: id.ext().to_string(),
            code,
            size,
            block_size,
            chunks: Bitmap::new(),
            parts: Bitmap::new(),
            headers: HeaderMap::new(),
            resp_unix: now,
            last_ref_unix: now,
            expires_at: 0,
            refs: 0,
            flags: Flags::CACHE,
            virtual_keys: Vec::new(),
        }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::with_variant(self.path.clone(), self.ext.clone())
    }

    pub fn is_vary_index(&self) -> bool {
        self.flags.contains(Flags::VARY_INDEX)
    }

    pub fn is_vary_cache(&self) -> bool {
        self.flags.contains(Flags::VARY_CACHE)
    }

    pub fn is_chunked(&self) -> bool {
        self.flags.contains(Flags::CHUNKED_CACHE)
    }

    /// Number of chunks a complete object occupies.
    pub fn end_chunk(&self) -> u32 {
        if self.block_size == 0 || self.size == 0 {
            return 0;
        }
        self.size.div_ceil(self.block_size) as u32
    }

    /// True iff the size is known and every chunk is present.
    pub fn has_complete(&self) -> bool {
        self.size > 0 && self.chunks.count() == self.end_chunk() as usize
    }

    pub fn has_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// HeaderMap rows persist as name/value string pairs; values that are
/// not valid UTF-8 were never stored in the first place.
mod header_codec {
    use http::header::{HeaderName, HeaderValue};
    use http::HeaderMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(headers: &HeaderMap, ser: S) -> Result<S::Ok, S::Error> {
        let mut items: Vec<(&str, &str)> = Vec::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if let Ok(value) = value.to_str() {
                items.push((name.as_str(), value));
            }
        }
        items.serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<HeaderMap, D::Error> {
        let items = Vec::<(String, String)>::deserialize(de)?;
        let mut map = HeaderMap::with_capacity(items.len());
        for (name, value) in items {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(&value),
            ) {
                map.append(name, value);
            }
        }
        Ok(map)
    }
}
