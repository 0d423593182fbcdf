//! Source adapters.
//!
//! Every remote source falls into one of two shapes: a feed of things that
//! happened (posts, likes, scrobbles, watched films) or a game library with
//! playtime counters and achievements. The adapters own the poll cycle; the
//! client traits are the only part that knows about a particular API.

pub mod feed;
pub mod game;
pub mod http;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SourceError;
use crate::snapshot::{Credentials, Snapshot, SnapshotStore};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub use feed::{FeedAdapter, FeedClient, FeedEntry};
pub use game::{GameAdapter, GameClient, GameState, RemoteGame};
pub use http::HttpSourceClient;

/// Credential lifecycle shared by every client.
pub trait Authenticator: Send + Sync + 'static {
    /// `false` for sources that need no token (public feeds, api-key auth).
    fn requires_auth(&self) -> bool {
        false
    }

    /// Exchange `current` (possibly absent or expired) for fresh credentials.
    fn refresh_credentials(
        &self,
        _current: Option<&Credentials>,
    ) -> impl Future<Output = Result<Credentials, SourceError>> + Send {
        async { Err(SourceError::Auth("source has no credential flow".into())) }
    }
}

/// Make sure `snapshot` holds usable credentials before a poll. Fresh tokens
/// are persisted right away so a crash mid-poll does not lose them.
pub(crate) async fn ensure_credentials<A, T>(
    name: &str,
    client: &A,
    snapshot: &mut Snapshot<T>,
    store: &SnapshotStore,
    now: DateTime<Utc>,
) -> Result<(), SourceError>
where
    A: Authenticator,
    T: Serialize,
{
    if !client.requires_auth() {
        return Ok(());
    }
    if let Some(credentials) = &snapshot.auth_state {
        if !credentials.is_expired(now) {
            return Ok(());
        }
    }

    let fresh = client
        .refresh_credentials(snapshot.auth_state.as_ref())
        .await?;
    log_info!("[{name}] credentials refreshed, valid until {}", fresh.expires_at);
    snapshot.auth_state = Some(fresh);
    store.save(snapshot);
    Ok(())
}

/// Apply the source error policy and turn the error into the poll's result.
///
/// Auth failures drop the cached credentials (persisted immediately) so the
/// next run re-authenticates. Transient failures leave the snapshot alone.
pub(crate) fn source_failure<T: Serialize>(
    name: &str,
    err: SourceError,
    snapshot: &mut Snapshot<T>,
    store: &SnapshotStore,
) -> anyhow::Error {
    if err.is_auth() {
        log_warn!("[{name}] credentials rejected, clearing them: {err}");
        snapshot.clear_credentials();
        store.save(snapshot);
    }
    anyhow::Error::new(err).context(format!("{name} poll aborted"))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct TokenSource {
        refreshes: AtomicUsize,
        reject: bool,
    }

    impl Authenticator for TokenSource {
        fn requires_auth(&self) -> bool {
            true
        }

        async fn refresh_credentials(
            &self,
            _current: Option<&Credentials>,
        ) -> Result<Credentials, SourceError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(SourceError::Auth("refresh token revoked".into()));
            }
            Ok(valid_for_an_hour(now()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn expired_credentials_are_refreshed_and_saved() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("src.json"));
        let client = TokenSource {
            refreshes: AtomicUsize::new(0),
            reject: false,
        };
        let mut snapshot: Snapshot<String> = Snapshot::default();
        snapshot.auth_state = Some(credentials("old", now() + Duration::seconds(30)));

        ensure_credentials("src", &client, &mut snapshot, &store, now())
            .await
            .unwrap();

        assert_eq!(client.refreshes.load(Ordering::SeqCst), 1);
        let saved: Snapshot<String> = store.load();
        assert_eq!(saved.auth_state.unwrap().access_token, "live");
    }

    #[tokio::test]
    async fn valid_credentials_are_reused() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("src.json"));
        let client = TokenSource {
            refreshes: AtomicUsize::new(0),
            reject: false,
        };
        let mut snapshot: Snapshot<String> = Snapshot::default();
        snapshot.auth_state = Some(valid_for_an_hour(now()));

        ensure_credentials("src", &client, &mut snapshot, &store, now())
            .await
            .unwrap();
        assert_eq!(client.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_clears_credentials() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("src.json"));
        let client = TokenSource {
            refreshes: AtomicUsize::new(0),
            reject: true,
        };
        let mut snapshot = Snapshot::with_items(vec!["kept".to_string()]);
        snapshot.auth_state = Some(credentials("old", now() - Duration::hours(1)));

        let err = ensure_credentials("src", &client, &mut snapshot, &store, now())
            .await
            .unwrap_err();
        source_failure("src", err, &mut snapshot, &store);

        let saved: Snapshot<String> = store.load();
        assert!(saved.auth_state.is_none());
        assert_eq!(saved.items, vec!["kept".to_string()]);
    }
}
