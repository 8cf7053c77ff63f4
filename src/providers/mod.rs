//! Concrete `ProviderVTable` implementations.
//!
//! Each module supplies one provider's URL/JSON shims plus an
//! `AuthConfig`/`ProviderRegistration` pair; the engine in `request.rs` and
//! `provider.rs` drives all of them identically. Per spec.md section 1's
//! out-of-scope list, exact per-provider URL/JSON shapes beyond the pattern
//! they follow are not load-bearing — what matters is that each module
//! demonstrates a distinct point in the adapter's design space (OAuth2 vs.
//! credential login, offset/limit vs. cursor pagination, byte-transferring
//! vs. URL-resolving verbs).

pub mod animezone;
pub mod box_provider;
pub mod google_drive;
pub mod mega;

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

/// Best-effort RFC3339 timestamp parse, matching the teacher's tolerant
/// `util::parse_time` equivalents — a malformed or absent timestamp yields
/// `None` rather than failing the whole response.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.with_timezone(&Utc))
}

/// SHA-1 digest of `bytes`, hex-encoded. Used by the Box provider's upload
/// path for the `Content-MD5` integrity header Box's API accepts on
/// simple uploads.
pub(crate) fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Escapes a filename for embedding in a `Content-Disposition` header
/// value, mirroring `util::Url::escapeHeader` in the original.
pub(crate) fn escape_header_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
