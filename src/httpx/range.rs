use crate::error::CacheError;

/// A single inclusive byte range from a request `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end position, already clipped to the object size.
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` response value for this range.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Parses a request `Range` header against a known object size.
///
/// An absent header means the whole object. A multi-range header
/// contributes only its first range (multi-range composition is a
/// separate layer). Ranges that cannot be satisfied for `size` return
/// `InvalidRange`, which the pipeline maps to 416.
pub fn single_range(header: Option<&str>, size: u64) -> Result<ByteRange, CacheError> {
    let header = match header {
        Some(value) if !value.is_empty() => value,
        _ => {
            if size == 0 {
                return Ok(ByteRange { start: 0, end: 0 });
            }
            return Ok(ByteRange {
                start: 0,
                end: size - 1,
            });
        }
    };

    let raw = header
        .strip_prefix("bytes=")
        .ok_or(CacheError::InvalidRange)?;
    let first = raw.split(',').next().ok_or(CacheError::InvalidRange)?.trim();

    // suffix-range "-N": the last N bytes
    if let Some(suffix) = first.strip_prefix('-') {
        let n: u64 = suffix.parse().map_err(|_| CacheError::InvalidRange)?;
        if n == 0 || size == 0 {
            return Err(CacheError::InvalidRange);
        }
        let n = n.min(size);
        return Ok(ByteRange {
            start: size - n,
            end: size - 1,
        });
    }

    let dash = first.find('-').ok_or(CacheError::InvalidRange)?;
    let start: u64 = first[..dash].parse().map_err(|_| CacheError::InvalidRange)?;
    let end_str = &first[dash + 1..];

    if size > 0 && start >= size {
        return Err(CacheError::InvalidRange);
    }

    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        let end: u64 = end_str.parse().map_err(|_| CacheError::InvalidRange)?;
        if end < start {
            return Err(CacheError::InvalidRange);
        }
        if size > 0 { end.min(size - 1) } else { end }
    };

    Ok(ByteRange { start, end })
}

/// Parsed `Content-Range` response header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// Total object size; 0 when the origin reported `*`.
    pub total: u64,
    pub unsatisfied: bool,
}

/// Derives the object's range facts from an upstream response.
///
/// A 206 carries `Content-Range`; a plain 200 only has
/// `Content-Length`. Returns `None` when neither is usable, which
/// marks the object as chunked-unknown.
pub fn parse_content_range(headers: &http::HeaderMap) -> Option<ContentRange> {
    if let Some(value) = headers.get(http::header::CONTENT_RANGE) {
        let value = value.to_str().ok()?;
        return parse_content_range_value(value);
    }

    let length = headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()?;
    Some(ContentRange {
        start: 0,
        end: length.saturating_sub(1),
        total: length,
        unsatisfied: false,
    })
}

fn parse_content_range_value(value: &str) -> Option<ContentRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes")?.trim_start();

    if let Some(size) = rest.strip_prefix("*/") {
        let total = size.trim().parse().ok()?;
        return Some(ContentRange {
            total,
            unsatisfied: true,
            ..Default::default()
        });
    }

    let (range, size) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = if size.trim() == "*" {
        0
    } else {
        let total: u64 = size.trim().parse().ok()?;
        if end >= total {
            return None;
        }
        total
    };
    Some(ContentRange {
        start,
        end,
        total,
        unsatisfied: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn absent_header_covers_whole_object() {
        let rng = single_range(None, 100).unwrap();
        assert_eq!((rng.start, rng.end), (0, 99));
        assert_eq!(rng.length(), 100);
    }

    #[test]
    fn explicit_full_range_equals_no_range() {
        let full = single_range(Some("bytes=0-99"), 100).unwrap();
        let none = single_range(None, 100).unwrap();
        assert_eq!(full, none);
    }

    #[test]
    fn open_ended_and_clipped_ranges() {
        assert_eq!(
            single_range(Some("bytes=50-"), 100).unwrap(),
            ByteRange { start: 50, end: 99 }
        );
        assert_eq!(
            single_range(Some("bytes=50-5000"), 100).unwrap(),
            ByteRange { start: 50, end: 99 }
        );
        // last byte
        assert_eq!(
            single_range(Some("bytes=99-"), 100).unwrap(),
            ByteRange { start: 99, end: 99 }
        );
    }

    #[test]
    fn suffix_range_takes_tail() {
        assert_eq!(
            single_range(Some("bytes=-10"), 100).unwrap(),
            ByteRange { start: 90, end: 99 }
        );
    }

    #[test]
    fn past_eof_and_garbage_are_invalid() {
        assert!(single_range(Some("bytes=100-"), 100).is_err());
        assert!(single_range(Some("bytes=5-2"), 100).is_err());
        assert!(single_range(Some("chars=0-1"), 100).is_err());
        assert!(single_range(Some("bytes=abc-1"), 100).is_err());
    }

    #[test]
    fn multi_range_takes_first() {
        assert_eq!(
            single_range(Some("bytes=0-9, 20-29"), 100).unwrap(),
            ByteRange { start: 0, end: 9 }
        );
    }

    #[test]
    fn content_range_from_206() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_RANGE,
            "bytes 1048576-2097151/2097152".parse().unwrap(),
        );
        let cr = parse_content_range(&headers).unwrap();
        assert_eq!(cr.start, 1048576);
        assert_eq!(cr.total, 2097152);
        assert!(!cr.unsatisfied);
    }

    #[test]
    fn content_range_falls_back_to_length() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, "1000".parse().unwrap());
        let cr = parse_content_range(&headers).unwrap();
        assert_eq!((cr.start, cr.end, cr.total), (0, 999, 1000));
    }

    #[test]
    fn chunked_response_has_no_range_facts() {
        let headers = HeaderMap::new();
        assert!(parse_content_range(&headers).is_none());
    }

    #[test]
    fn unsatisfied_marker_parses() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_RANGE,
            "bytes */1000".parse().unwrap(),
        );
        let cr = parse_content_range(&headers).unwrap();
        assert!(cr.unsatisfied);
        assert_eq!(cr.total, 1000);
    }
}
