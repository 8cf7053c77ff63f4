//! Uniform error type returned by every request in this crate.

use thiserror::Error;

/// Negative sentinel codes mirrored from the provider network, distinct from
/// HTTP status codes (which are always positive and carried verbatim).
const CODE_FAILURE: i32 = -1;
const CODE_ABORTED: i32 = -2;
const CODE_INVALID_CREDENTIALS: i32 = -3;
const CODE_BAD: i32 = -4;
const CODE_NOT_FOUND: i32 = -5;
const CODE_PARSE_FAILURE: i32 = -6;
const CODE_TRANSPORT: i32 = -7;

/// The single error type surfaced by `Request<T>` completions and provider
/// hooks.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The underlying transport could not complete the exchange at all
    /// (DNS, connect, TLS, I/O) — no HTTP status was ever received.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response carrying a non-2xx HTTP status code, not otherwise
    /// recognized as one of the named variants below.
    #[error("http status {0}: {1}")]
    HttpStatus(u16, String),

    /// A response body could not be parsed into the expected shape.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    /// Authorization failed and no retry/refresh could recover it.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The request was cancelled before completion.
    #[error("aborted")]
    Aborted,

    /// The targeted remote item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was malformed in a way the caller must fix; never
    /// retried.
    #[error("bad request: {0}")]
    Bad(String),

    /// Catch-all for provider-reported failures that don't fit a more
    /// specific variant.
    #[error("failure: {0}")]
    Failure(String),
}

impl Error {
    /// Numeric `{code, description}` pair matching the original library's
    /// error surface: HTTP statuses pass through as-is, everything else maps
    /// to a negative sentinel.
    pub fn code(&self) -> i32 {
        match self {
            Error::HttpStatus(status, _) => i32::from(*status),
            Error::Transport(_) => CODE_TRANSPORT,
            Error::ParseFailure(_) => CODE_PARSE_FAILURE,
            Error::InvalidCredentials(_) => CODE_INVALID_CREDENTIALS,
            Error::Aborted => CODE_ABORTED,
            Error::NotFound(_) => CODE_NOT_FOUND,
            Error::Bad(_) => CODE_BAD,
            Error::Failure(_) => CODE_FAILURE,
        }
    }

    /// Whether retrying the same request (after reauthorization, if
    /// applicable) has any chance of succeeding.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::HttpStatus(status, _) => {
                matches!(*status, 429 | 500 | 502 | 503 | 504) || *status == 401
            }
            Error::Transport(_) => true,
            Error::Aborted
            | Error::ParseFailure(_)
            | Error::InvalidCredentials(_)
            | Error::NotFound(_)
            | Error::Bad(_)
            | Error::Failure(_) => false,
        }
    }

    /// `is_client_error && code != 404`, the exact predicate the Box
    /// provider uses to decide whether a failing response should trigger a
    /// token reauthorization-and-replay rather than a straight failure.
    pub fn should_reauthorize(&self) -> bool {
        matches!(self, Error::HttpStatus(status, _) if (400..500).contains(status) && *status != 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_code_passes_through() {
        assert_eq!(Error::HttpStatus(404, "x".into()).code(), 404);
        assert_eq!(Error::HttpStatus(500, "x".into()).code(), 500);
    }

    #[test]
    fn named_variants_use_negative_sentinels() {
        assert_eq!(Error::Aborted.code(), CODE_ABORTED);
        assert_eq!(Error::Bad("x".into()).code(), CODE_BAD);
        assert_eq!(Error::NotFound("x".into()).code(), CODE_NOT_FOUND);
    }

    #[test]
    fn reauthorize_excludes_404() {
        assert!(!Error::HttpStatus(404, "x".into()).should_reauthorize());
        assert!(Error::HttpStatus(401, "x".into()).should_reauthorize());
        assert!(Error::HttpStatus(403, "x".into()).should_reauthorize());
        assert!(!Error::HttpStatus(500, "x".into()).should_reauthorize());
    }
}
