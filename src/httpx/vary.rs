use http::HeaderMap;

/// Sentinel used for request headers named by Vary but absent from the
/// request, so "no header" still yields a stable variant key.
pub const VARY_EMPTY_IDENTITY: &str = "tr_identity";

/// Canonicalizes `Vary` header values into a sorted, de-duplicated list
/// of header names. Comma-separated values are split, whitespace
/// trimmed, empty entries dropped.
pub fn clean<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut keys: Vec<String> = values
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(|key| key.trim().to_ascii_lowercase())
        .filter(|key| !key.is_empty())
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Canonical vary names carried by a header map's `Vary` values.
pub fn clean_from(headers: &HeaderMap) -> Vec<String> {
    clean(
        headers
            .get_all(http::header::VARY)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    )
}

/// Builds the variant key `k1=v1&k2=v2&...` for a request.
///
/// Keys are the canonical vary list sorted alphabetically; each value
/// is the request's values for that header, individually sorted and
/// joined by comma. Missing headers use [`VARY_EMPTY_IDENTITY`].
/// Returns an empty string for an empty vary list.
pub fn vary_data(vary_keys: &[String], req_headers: &HeaderMap) -> String {
    if vary_keys.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    for key in vary_keys {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&sorted_values(req_headers, key));
    }
    out
}

fn sorted_values(headers: &HeaderMap, name: &str) -> String {
    let mut values: Vec<String> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    if values.is_empty() {
        return VARY_EMPTY_IDENTITY.to_string();
    }
    values.sort();
    values.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn clean_sorts_and_dedups() {
        let keys = clean(["Accept-Encoding, User-Agent", " accept-encoding ", ""]);
        assert_eq!(keys, vec!["accept-encoding", "user-agent"]);
    }

    #[test]
    fn vary_data_is_stable_across_value_order() {
        let keys = clean(["Accept-Encoding"]);
        let mut a = HeaderMap::new();
        a.insert("accept-encoding", "gzip, br".parse().unwrap());
        let mut b = HeaderMap::new();
        b.insert("accept-encoding", "br,gzip".parse().unwrap());
        assert_eq!(vary_data(&keys, &a), vary_data(&keys, &b));
        assert_eq!(vary_data(&keys, &a), "accept-encoding=br,gzip");
    }

    #[test]
    fn missing_header_uses_identity_sentinel() {
        let keys = clean(["Accept-Encoding", "X-Client"]);
        let headers = HeaderMap::new();
        assert_eq!(
            vary_data(&keys, &headers),
            "accept-encoding=tr_identity&x-client=tr_identity"
        );
    }

    #[test]
    fn empty_vary_list_gives_empty_key() {
        assert_eq!(vary_data(&[], &HeaderMap::new()), "");
    }
}
