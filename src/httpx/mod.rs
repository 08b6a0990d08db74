pub mod range;
pub mod vary;

use http::header::HeaderName;
use http::HeaderMap;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Response header carrying the cache outcome.
pub const CACHE_STATUS_KEY: &str = "x-cache";
/// Truthy request header enabling prefetch mode.
pub const PREFETCH_KEY: &str = "x-prefetch";
/// Internal override for the computed cache lifetime, in seconds.
pub const CACHE_TIME_KEY: &str = "x-cachetime";

/// Internal upstream-control headers; never accepted from untrusted
/// clients and never persisted.
pub const INTERNAL_STORE_URL: &str = "i-x-store-url";
pub const INTERNAL_FILL_RANGE_PERCENT: &str = "i-x-fp";
pub const INTERNAL_CACHE_ERR_CODE: &str = "i-x-ct-code";

pub const FLAG_ON: &str = "1";

/// Headers stripped from persisted metadata: everything in the
/// `X-Protocol` family plus the status header itself.
const STRIP_HEADERS: &[&str] = &[
    "x-protocol",
    "x-protocol-cache",
    "x-protocol-request-id",
    CACHE_STATUS_KEY,
];

const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    for name in connection_named {
        if let Ok(name) = HeaderName::try_from(name.as_str()) {
            headers.remove(name);
        }
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Removes headers that must never reach the index or the client copy
/// of cached metadata.
pub fn strip_internal_headers(headers: &mut HeaderMap) {
    for name in STRIP_HEADERS {
        headers.remove(*name);
    }
    headers.remove(INTERNAL_STORE_URL);
    headers.remove(INTERNAL_FILL_RANGE_PERCENT);
    headers.remove(INTERNAL_CACHE_ERR_CODE);
}

/// Replaces `dst`'s view of `src`: every name in `src` overwrites the
/// destination values wholesale.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    let mut last: Option<HeaderName> = None;
    for (name, value) in src.iter() {
        if last.as_ref() != Some(name) {
            dst.remove(name);
            last = Some(name.clone());
        }
        dst.append(name.clone(), value.clone());
    }
}

pub fn has_condition_header(headers: &HeaderMap) -> bool {
    headers.contains_key(http::header::ETAG)
        || headers.contains_key(http::header::LAST_MODIFIED)
}

/// Computed cache lifetime of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTime {
    pub ttl_secs: i64,
    pub cacheable: bool,
}

/// Derives the cache lifetime from response headers.
///
/// `Cache-Control: no-store`/`no-cache`/`private` defeat caching.
/// Otherwise the larger of `max-age`/`s-maxage` wins; absent both, a
/// parseable `Expires` relative to `now` is used; absent all, the
/// response is not cacheable. The internal `X-CacheTime` header (seconds)
/// overrides everything when present.
pub fn parse_cache_time(headers: &HeaderMap, now: OffsetDateTime) -> CacheTime {
    if let Some(value) = headers.get(CACHE_TIME_KEY)
        && let Some(secs) = value.to_str().ok().and_then(|v| v.parse::<i64>().ok())
    {
        return CacheTime {
            ttl_secs: secs,
            cacheable: secs > 0,
        };
    }

    let mut max_age: Option<i64> = None;
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else { continue };
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-store" || directive == "no-cache" || directive == "private" {
                return CacheTime {
                    ttl_secs: 0,
                    cacheable: false,
                };
            }
            for key in ["max-age", "s-maxage"] {
                if let Some(raw) = directive.strip_prefix(&format!("{key}="))
                    && let Ok(secs) = raw.trim().parse::<i64>()
                {
                    max_age = Some(max_age.map_or(secs, |prev: i64| prev.max(secs)));
                }
            }
        }
    }

    if let Some(secs) = max_age {
        return CacheTime {
            ttl_secs: secs,
            cacheable: secs > 0,
        };
    }

    if let Some(expires) = headers.get(http::header::EXPIRES)
        && let Some(at) = expires.to_str().ok().and_then(parse_http_date)
    {
        let ttl = at.unix_timestamp() - now.unix_timestamp();
        return CacheTime {
            ttl_secs: ttl,
            cacheable: ttl > 0,
        };
    }

    CacheTime {
        ttl_secs: 0,
        cacheable: false,
    }
}

const IMF_FIXDATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Formats a unix timestamp as an IMF-fixdate HTTP date.
pub fn format_http_date(unix: i64) -> String {
    let at = OffsetDateTime::from_unix_timestamp(unix)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    at.format(&IMF_FIXDATE)
        .unwrap_or_else(|_| String::from("Thu, 01 Jan 1970 00:00:00 GMT"))
}

/// Parses an IMF-fixdate HTTP date (the format origins emit today).
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), &IMF_FIXDATE)
        .ok()
        .map(|dt| dt.assume_utc())
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
