//! Domain errors that callers branch on. Plumbing errors stay `anyhow`.

use thiserror::Error;

/// Failure reported by a remote source client.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network trouble, 5xx, undecodable body. Retry next interval from the
    /// same baseline.
    #[error("transient source failure: {0}")]
    Transient(String),

    /// Credentials were rejected. The adapter drops its cached credentials so
    /// the next run re-authenticates.
    #[error("source rejected credentials: {0}")]
    Auth(String),
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                SourceError::Auth(err.to_string())
            }
            _ => SourceError::Transient(err.to_string()),
        }
    }
}

/// Errors surfaced by the page cache to the admin UI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no cached page for {0}")]
    NotCached(String),
}
