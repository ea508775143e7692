//! Sentinel client construction.

use crate::error::{CacheError, CacheResult};

const ROLE_PARAM: &str = "is_master";

/// Split a service URL into its primary (`is_master=1`) and replica
/// (`is_master=0`) forms. Other query parameters are kept.
pub fn sentinel_urls(url: &str) -> CacheResult<(String, String)> {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, query),
        None => (url, ""),
    };
    if base.is_empty() || !base.contains("://") {
        return Err(CacheError::Config(format!("invalid sentinel service URL '{}'", url)));
    }
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(ROLE_PARAM))
        .collect();

    let with_role = |role: &str| {
        let mut url = format!("{}?", base);
        for pair in &kept {
            url.push_str(pair);
            url.push('&');
        }
        url.push_str(&format!("{}={}", ROLE_PARAM, role));
        url
    };
    Ok((with_role("1"), with_role("0")))
}
