use sha2::{Digest, Sha256};
use url::Url;

/// Length of the hex-encoded resource id.
const ID_LEN: usize = 16;

/// Strips the signed-expiry suffix from an attachment URL. The platform
/// appends `?ex=<hex>&is=<hex>&hm=<sig>` when signing; everything from the
/// last `?ex=` on changes with each refresh and must not feed the id.
pub fn canonical_url(url: &str) -> &str {
    match url.rfind("?ex=") {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Stable resource id: truncated SHA-256 over poster identity, creation
/// instant, and the canonical attachment URL. Re-fetching the same logical
/// attachment with a refreshed signature yields the same id.
pub fn resource_id(poster: &str, posted_at: f64, attachment_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(poster.as_bytes());
    hasher.update(posted_at.to_string().as_bytes());
    hasher.update(canonical_url(attachment_url).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..ID_LEN].to_string()
}

/// Extracts the expiry instant encoded in the URL's `ex` query parameter as
/// a hexadecimal epoch value. Returns `None` when the parameter is absent or
/// malformed; callers decide whether that is worth a log line.
pub fn decode_expiry(url: &str) -> Option<i64> {
    let parsed = Url::parse(url).ok()?;
    let value = parsed
        .query_pairs()
        .find(|(key, _)| key == "ex")
        .map(|(_, value)| value.into_owned())?;
    i64::from_str_radix(&value, 16).ok()
}
