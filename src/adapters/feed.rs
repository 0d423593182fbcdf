use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapters::{ensure_credentials, source_failure, Authenticator};
use crate::db::{Database, FeedItemRecord};
use crate::error::SourceError;
use crate::scheduler::PollJob;
use crate::snapshot::{Credentials, Snapshot, SnapshotStore};
use crate::sync::{always_new, DeltaDetector, NativeOrder};
use crate::utils::serde_helpers::string_or_number;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// One post, like, scrobble or watched film as the source reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn entry_key(entry: &FeedEntry) -> Option<String> {
    let id = entry.id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn entry_time(entry: &FeedEntry) -> Option<DateTime<Utc>> {
    entry.occurred_at
}

pub trait FeedClient: Authenticator {
    fn fetch_items(
        &self,
        credentials: Option<&Credentials>,
    ) -> impl Future<Output = Result<Vec<FeedEntry>, SourceError>> + Send;
}

pub struct FeedAdapter<C> {
    name: String,
    client: C,
    db: Database,
    store: SnapshotStore,
    snapshot: Snapshot<FeedEntry>,
    detector: DeltaDetector<FeedEntry, String>,
}

impl<C: FeedClient> FeedAdapter<C> {
    /// Loads the snapshot from `store`; a missing file means first poll.
    pub fn new(
        name: impl Into<String>,
        client: C,
        db: Database,
        store: SnapshotStore,
        native_order: NativeOrder,
    ) -> Self {
        let snapshot = store.load();
        Self {
            name: name.into(),
            client,
            db,
            store,
            snapshot,
            detector: DeltaDetector::new(entry_key, always_new::<FeedEntry>)
                .ordered_by(entry_time)
                .native_order(native_order),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> &Snapshot<FeedEntry> {
        &self.snapshot
    }

    /// One poll cycle. Returns how many new entries were stored.
    pub async fn poll(&mut self) -> Result<usize> {
        self.poll_at(Utc::now()).await
    }

    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> Result<usize> {
        if let Err(err) =
            ensure_credentials(&self.name, &self.client, &mut self.snapshot, &self.store, now).await
        {
            return Err(source_failure(&self.name, err, &mut self.snapshot, &self.store));
        }

        let current = match self.client.fetch_items(self.snapshot.auth_state.as_ref()).await {
            Ok(items) => items,
            Err(err) => {
                return Err(source_failure(&self.name, err, &mut self.snapshot, &self.store))
            }
        };

        let fresh = self.detector.detect_new(&self.snapshot.items, &current);
        if self.snapshot.items.is_empty() {
            log_info!(
                "[{}] first poll, seeding baseline with {} entries",
                self.name,
                current.len()
            );
        }

        // Oldest first, all before the snapshot moves.
        let mut stored = 0;
        for entry in &fresh {
            if self.db.insert_feed_item(&self.to_record(entry, now)).await?.is_some() {
                stored += 1;
            }
        }

        self.snapshot.items = self.detector.baseline(&current);
        self.store.save(&self.snapshot);

        if stored > 0 {
            log_info!("[{}] stored {stored} new entries", self.name);
        } else {
            log_debug!("[{}] nothing new", self.name);
        }
        Ok(stored)
    }

    fn to_record(&self, entry: &FeedEntry, now: DateTime<Utc>) -> FeedItemRecord {
        FeedItemRecord {
            id: None,
            source: self.name.clone(),
            external_key: entry.id.trim().to_string(),
            title: entry.title.clone(),
            url: entry.url.clone(),
            payload: entry.payload.clone(),
            occurred_at: entry.occurred_at.unwrap_or(now),
            created_at: now,
        }
    }
}

impl<C: FeedClient> PollJob for FeedAdapter<C> {
    async fn run(&mut self) -> Result<()> {
        self.poll().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::valid_for_an_hour;
    use chrono::{Duration, TimeZone};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays one scripted response per fetch.
    #[derive(Default)]
    struct ScriptedFeed {
        responses: Mutex<VecDeque<Result<Vec<FeedEntry>, SourceError>>>,
        requires_auth: bool,
        saw_token: AtomicBool,
    }

    impl ScriptedFeed {
        fn push(&self, response: Result<Vec<FeedEntry>, SourceError>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    impl Authenticator for ScriptedFeed {
        fn requires_auth(&self) -> bool {
            self.requires_auth
        }

        async fn refresh_credentials(
            &self,
            _current: Option<&Credentials>,
        ) -> Result<Credentials, SourceError> {
            Ok(valid_for_an_hour(now()))
        }
    }

    impl FeedClient for ScriptedFeed {
        async fn fetch_items(
            &self,
            credentials: Option<&Credentials>,
        ) -> Result<Vec<FeedEntry>, SourceError> {
            if credentials.is_some() {
                self.saw_token.store(true, Ordering::SeqCst);
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, 21, 0, 0).unwrap()
    }

    fn entry(id: &str, minutes_ago: i64) -> FeedEntry {
        FeedEntry {
            id: id.to_string(),
            title: format!("post {id}"),
            url: None,
            occurred_at: Some(now() - Duration::minutes(minutes_ago)),
            payload: serde_json::Value::Null,
        }
    }

    fn adapter(dir: &TempDir, client: ScriptedFeed) -> FeedAdapter<ScriptedFeed> {
        FeedAdapter::new(
            "mastodon",
            client,
            Database::open_in_memory().unwrap(),
            SnapshotStore::new(dir.path().join("mastodon.json")),
            NativeOrder::NewestFirst,
        )
    }

    #[tokio::test]
    async fn first_poll_only_seeds_baseline() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedFeed::default();
        client.push(Ok(vec![entry("2", 5), entry("1", 10)]));
        let mut adapter = adapter(&dir, client);

        assert_eq!(adapter.poll_at(now()).await.unwrap(), 0);
        assert!(adapter.db.list_feed_items("mastodon").await.unwrap().is_empty());

        let saved: Snapshot<FeedEntry> = adapter.store.load();
        assert_eq!(saved.items.len(), 2);
    }

    #[tokio::test]
    async fn new_entries_are_stored_oldest_first_and_repoll_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedFeed::default();
        client.push(Ok(vec![entry("1", 60)]));
        client.push(Ok(vec![entry("3", 1), entry("2", 2), entry("1", 60)]));
        client.push(Ok(vec![entry("3", 1), entry("2", 2), entry("1", 60)]));
        let mut adapter = adapter(&dir, client);

        adapter.poll_at(now()).await.unwrap();
        assert_eq!(adapter.poll_at(now()).await.unwrap(), 2);
        assert_eq!(adapter.poll_at(now()).await.unwrap(), 0);

        let stored = adapter.db.list_feed_items("mastodon").await.unwrap();
        let keys: Vec<_> = stored.iter().map(|item| item.external_key.as_str()).collect();
        assert_eq!(keys, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn transient_failure_leaves_snapshot_untouched() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedFeed::default();
        client.push(Ok(vec![entry("1", 60)]));
        client.push(Err(SourceError::Transient("502 bad gateway".into())));
        client.push(Ok(vec![entry("2", 1), entry("1", 60)]));
        let mut adapter = adapter(&dir, client);

        adapter.poll_at(now()).await.unwrap();
        assert!(adapter.poll_at(now()).await.is_err());
        assert_eq!(adapter.snapshot().items.len(), 1);

        assert_eq!(adapter.poll_at(now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn auth_failure_clears_credentials_and_keeps_items() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedFeed {
            requires_auth: true,
            ..ScriptedFeed::default()
        };
        client.push(Ok(vec![entry("1", 60)]));
        client.push(Err(SourceError::Auth("401 unauthorized".into())));
        let mut adapter = adapter(&dir, client);

        adapter.poll_at(now()).await.unwrap();
        assert!(adapter.client.saw_token.load(Ordering::SeqCst));
        assert!(adapter.snapshot().auth_state.is_some());

        assert!(adapter.poll_at(now()).await.is_err());
        let saved: Snapshot<FeedEntry> = adapter.store.load();
        assert!(saved.auth_state.is_none());
        assert_eq!(saved.items.len(), 1);
    }

    #[tokio::test]
    async fn entries_without_id_are_skipped() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedFeed::default();
        client.push(Ok(vec![entry("1", 60)]));
        client.push(Ok(vec![entry("", 1), entry("2", 2), entry("1", 60)]));
        let mut adapter = adapter(&dir, client);

        adapter.poll_at(now()).await.unwrap();
        assert_eq!(adapter.poll_at(now()).await.unwrap(), 1);
        assert_eq!(adapter.snapshot().items.len(), 2);
    }
}
