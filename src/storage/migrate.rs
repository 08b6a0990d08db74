use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::CacheError;
use crate::object::ObjectId;

use super::{Bucket, Tier};

/// Tier above `tier` in promotion order, if any.
pub fn promote_target(tier: Tier) -> Option<Tier> {
    match tier {
        Tier::Cold => Some(Tier::Warm),
        Tier::Warm => Some(Tier::Hot),
        Tier::Hot | Tier::InMemory => None,
    }
}

/// Tier below `tier` in demotion order; `None` means the object falls
/// off the end and is discarded.
pub fn demote_target(tier: Tier) -> Option<Tier> {
    match tier {
        Tier::Hot => Some(Tier::Warm),
        Tier::Warm => Some(Tier::Cold),
        Tier::Cold | Tier::InMemory => None,
    }
}

/// Moves one object between buckets: every present chunk is copied,
/// metadata lands in the destination, then the source copy is
/// discarded. Idempotent: an already-populated destination is success.
pub async fn copy_object(
    id: &ObjectId,
    src: &dyn Bucket,
    dest: &dyn Bucket,
) -> Result<(), CacheError> {
    if dest.exists(&id.hash()) {
        debug!(key = %id.key(), dest = %dest.id(), "migration target already populated");
        return Ok(());
    }

    let Some(meta) = src.lookup(id).await? else {
        return Err(CacheError::NotFound);
    };

    let mut buf = vec![0u8; 64 * 1024];
    for index in meta.chunks.iter() {
        let (mut reader, _) = src.read_chunk(id, index).await?;
        let (mut sink, _) = dest.write_chunk(id, index).await?;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await?;
        }
        sink.commit().await?;
    }

    dest.store(&meta).await?;
    src.discard_with_metadata(&meta).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_tier_order() {
        assert_eq!(promote_target(Tier::Cold), Some(Tier::Warm));
        assert_eq!(promote_target(Tier::Warm), Some(Tier::Hot));
        assert_eq!(promote_target(Tier::Hot), None);
        assert_eq!(demote_target(Tier::Hot), Some(Tier::Warm));
        assert_eq!(demote_target(Tier::Warm), Some(Tier::Cold));
        assert_eq!(demote_target(Tier::Cold), None);
    }
}
