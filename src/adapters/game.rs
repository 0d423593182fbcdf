//! Game library adapter: playtime counters become merged play sessions, and
//! achievement flags that flip to earned become achievement rows attached to
//! the session they were earned in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::adapters::{ensure_credentials, source_failure, Authenticator};
use crate::db::{AchievementRecord, Database};
use crate::error::SourceError;
use crate::scheduler::PollJob;
use crate::snapshot::{AchievementMetadata, Credentials, Snapshot, SnapshotStore};
use crate::sync::{AchievementReconciler, MetadataResolver, RemoteAchievement, SessionMerger};
use crate::utils::serde_helpers::string_or_number;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteGame {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub playtime_forever_mins: u64,
    #[serde(default = "default_true")]
    pub has_achievements: bool,
}

/// Last-synced view of one game, as kept in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub id: String,
    pub name: String,
    pub playtime_forever_mins: u64,
    #[serde(default)]
    pub achievements: Vec<RemoteAchievement>,
}

pub trait GameClient: Authenticator {
    fn fetch_games(
        &self,
        credentials: Option<&Credentials>,
    ) -> impl Future<Output = Result<Vec<RemoteGame>, SourceError>> + Send;

    /// Flag-only achievement list for one game.
    fn fetch_achievements(
        &self,
        credentials: Option<&Credentials>,
        game_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteAchievement>, SourceError>> + Send;

    fn fetch_achievement_metadata(
        &self,
        credentials: Option<&Credentials>,
        game_id: &str,
        api_names: &[String],
    ) -> impl Future<Output = Result<HashMap<String, AchievementMetadata>, SourceError>> + Send;
}

/// Binds a client to the credentials of the current poll.
struct ClientMetadata<'a, C> {
    client: &'a C,
    credentials: Option<&'a Credentials>,
}

impl<C: GameClient> MetadataResolver for ClientMetadata<'_, C> {
    async fn resolve(
        &self,
        scope: &str,
        api_names: &[String],
    ) -> Result<HashMap<String, AchievementMetadata>, SourceError> {
        self.client
            .fetch_achievement_metadata(self.credentials, scope, api_names)
            .await
    }
}

/// What one poll found for one game, before anything is written.
struct Observation {
    game: RemoteGame,
    played_mins: u64,
    achievements: Option<Vec<RemoteAchievement>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GamePollSummary {
    pub sessions_touched: usize,
    pub achievements_stored: usize,
}

pub struct GameAdapter<C> {
    name: String,
    client: C,
    db: Database,
    store: SnapshotStore,
    snapshot: Snapshot<GameState>,
    sessions: SessionMerger,
    reconciler: AchievementReconciler,
}

impl<C: GameClient> GameAdapter<C> {
    pub fn new(
        name: impl Into<String>,
        client: C,
        db: Database,
        store: SnapshotStore,
        poll_interval: Duration,
    ) -> Self {
        let name = name.into();
        let snapshot = store.load();
        Self {
            sessions: SessionMerger::new(db.clone(), name.clone(), poll_interval),
            name,
            client,
            db,
            store,
            snapshot,
            reconciler: AchievementReconciler::new(),
        }
    }

    pub fn with_device_id(mut self, device_id: Option<String>) -> Self {
        self.sessions = self.sessions.with_device_id(device_id);
        self
    }

    pub fn snapshot(&self) -> &Snapshot<GameState> {
        &self.snapshot
    }

    pub async fn poll(&mut self) -> Result<GamePollSummary> {
        self.poll_at(Utc::now()).await
    }

    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> Result<GamePollSummary> {
        if let Err(err) =
            ensure_credentials(&self.name, &self.client, &mut self.snapshot, &self.store, now).await
        {
            return Err(source_failure(&self.name, err, &mut self.snapshot, &self.store));
        }
        let credentials = self.snapshot.auth_state.clone();

        let observations = match self.observe(credentials.as_ref()).await {
            Ok(observations) => observations,
            Err(err) => {
                return Err(source_failure(&self.name, err, &mut self.snapshot, &self.store))
            }
        };

        let mut known: BTreeMap<String, GameState> = self
            .snapshot
            .items
            .iter()
            .map(|state| (state.id.clone(), state.clone()))
            .collect();
        if known.is_empty() {
            log_info!(
                "[{}] first poll, seeding baseline with {} games",
                self.name,
                observations.len()
            );
        }

        let mut metadata = self.snapshot.metadata.clone();
        let resolver = ClientMetadata {
            client: &self.client,
            credentials: credentials.as_ref(),
        };
        let mut summary = GamePollSummary::default();

        for observation in observations {
            let Observation {
                game,
                played_mins,
                achievements,
            } = observation;
            let prior = known.get(&game.id);

            let session = if played_mins > 0 {
                summary.sessions_touched += 1;
                Some(self.sessions.merge_or_create(&game.name, played_mins, now).await?)
            } else {
                None
            };

            let achievements = match (achievements, prior) {
                (Some(current), Some(prior)) => {
                    let unlocked = self
                        .reconciler
                        .reconcile(&game.id, &prior.achievements, &current, &mut metadata, &resolver)
                        .await;
                    for unlock in unlocked {
                        let record = AchievementRecord {
                            id: None,
                            parent_session_id: session.as_ref().map(|s| s.id.clone()),
                            source: self.name.clone(),
                            external_key: unlock.external_key,
                            name: unlock.name,
                            description: unlock.description,
                            unlocked_at: unlock.unlocked_at.unwrap_or(now),
                        };
                        if self.db.insert_achievement(&record).await?.is_some() {
                            log_info!("[{}] achievement unlocked in {}: {}", self.name, game.name, record.name);
                            summary.achievements_stored += 1;
                        }
                    }
                    self.reconciler.baseline(&current)
                }
                // First sight of this game: its list only seeds the baseline.
                (Some(current), None) => self.reconciler.baseline(&current),
                (None, Some(prior)) => prior.achievements.clone(),
                (None, None) => Vec::new(),
            };

            known.insert(
                game.id.clone(),
                GameState {
                    id: game.id,
                    name: game.name,
                    playtime_forever_mins: game.playtime_forever_mins,
                    achievements,
                },
            );
        }

        // Games missing from this response keep their baseline.
        self.snapshot.items = known.into_values().collect();
        self.snapshot.metadata = metadata;
        self.store.save(&self.snapshot);

        log_debug!(
            "[{}] {} sessions touched, {} achievements stored",
            self.name,
            summary.sessions_touched,
            summary.achievements_stored
        );
        Ok(summary)
    }

    /// Every remote read of the cycle. Nothing is written until this succeeds,
    /// so a failure halfway leaves the store and snapshot as they were.
    async fn observe(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<Observation>, SourceError> {
        let games = self.client.fetch_games(credentials).await?;
        let known: HashMap<&str, &GameState> = self
            .snapshot
            .items
            .iter()
            .map(|state| (state.id.as_str(), state))
            .collect();

        let mut seen = HashSet::new();
        let mut observations = Vec::with_capacity(games.len());
        for (index, mut game) in games.into_iter().enumerate() {
            game.id = game.id.trim().to_string();
            if game.id.is_empty() {
                log_warn!("[{}] skipping game #{index} without id", self.name);
                continue;
            }
            // First occurrence wins; a repeat would count the same playtime twice.
            if !seen.insert(game.id.clone()) {
                log_warn!("[{}] skipping duplicate game {}", self.name, game.id);
                continue;
            }
            if game.name.trim().is_empty() {
                game.name = game.id.clone();
            }

            let prior = known.get(game.id.as_str()).copied();
            let played_mins = prior
                .map(|state| game.playtime_forever_mins.saturating_sub(state.playtime_forever_mins))
                .unwrap_or(0);

            // Achievements only move while playing; unseen games need a baseline.
            let achievements = if game.has_achievements && (prior.is_none() || played_mins > 0) {
                Some(self.client.fetch_achievements(credentials, &game.id).await?)
            } else {
                None
            };

            observations.push(Observation {
                game,
                played_mins,
                achievements,
            });
        }
        Ok(observations)
    }
}

impl<C: GameClient> PollJob for GameAdapter<C> {
    async fn run(&mut self) -> Result<()> {
        self.poll().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeLibrary {
        games: Mutex<Vec<RemoteGame>>,
        achievements: Mutex<HashMap<String, Vec<RemoteAchievement>>>,
        fail_achievements: AtomicBool,
        metadata_calls: AtomicUsize,
    }

    impl FakeLibrary {
        fn set_game(&self, id: &str, name: &str, playtime: u64) {
            let mut games = self.games.lock().unwrap();
            games.retain(|game| game.id != id);
            games.push(RemoteGame {
                id: id.into(),
                name: name.into(),
                playtime_forever_mins: playtime,
                has_achievements: true,
            });
        }

        fn set_achievements(&self, id: &str, flags: &[(&str, bool)]) {
            let list = flags
                .iter()
                .map(|(api_name, achieved)| RemoteAchievement {
                    api_name: api_name.to_string(),
                    achieved: *achieved,
                    unlock_time: None,
                })
                .collect();
            self.achievements.lock().unwrap().insert(id.into(), list);
        }
    }

    impl Authenticator for FakeLibrary {}

    impl GameClient for FakeLibrary {
        async fn fetch_games(
            &self,
            _credentials: Option<&Credentials>,
        ) -> Result<Vec<RemoteGame>, SourceError> {
            Ok(self.games.lock().unwrap().clone())
        }

        async fn fetch_achievements(
            &self,
            _credentials: Option<&Credentials>,
            game_id: &str,
        ) -> Result<Vec<RemoteAchievement>, SourceError> {
            if self.fail_achievements.load(Ordering::SeqCst) {
                return Err(SourceError::Transient("timeout".into()));
            }
            Ok(self
                .achievements
                .lock()
                .unwrap()
                .get(game_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_achievement_metadata(
            &self,
            _credentials: Option<&Credentials>,
            _game_id: &str,
            api_names: &[String],
        ) -> Result<HashMap<String, AchievementMetadata>, SourceError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            Ok(api_names
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        AchievementMetadata {
                            name: format!("Title {name}"),
                            description: String::new(),
                        },
                    )
                })
                .collect())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap()
    }

    fn adapter(dir: &TempDir) -> GameAdapter<FakeLibrary> {
        GameAdapter::new(
            "steam",
            FakeLibrary::default(),
            Database::open_in_memory().unwrap(),
            SnapshotStore::new(dir.path().join("steam.json")),
            Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn first_poll_records_nothing() {
        let dir = TempDir::new().unwrap();
        let mut adapter = adapter(&dir);
        adapter.client.set_game("440", "Game A", 1_000);
        adapter.client.set_achievements("440", &[("WIN", true), ("LOSE", false)]);

        let summary = adapter.poll_at(t0()).await.unwrap();

        assert_eq!(summary, GamePollSummary::default());
        assert!(adapter.db.list_activities("steam").await.unwrap().is_empty());
        let saved: Snapshot<GameState> = adapter.store.load();
        assert_eq!(saved.items[0].playtime_forever_mins, 1_000);
        assert_eq!(saved.items[0].achievements.len(), 2);
    }

    #[tokio::test]
    async fn playtime_and_unlock_land_in_the_same_session() {
        let dir = TempDir::new().unwrap();
        let mut adapter = adapter(&dir);
        adapter.client.set_game("440", "Game A", 1_000);
        adapter.client.set_achievements("440", &[("WIN", false)]);
        adapter.poll_at(t0()).await.unwrap();

        adapter.client.set_game("440", "Game A", 1_005);
        adapter.client.set_achievements("440", &[("WIN", true)]);
        let summary = adapter.poll_at(t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(summary.sessions_touched, 1);
        assert_eq!(summary.achievements_stored, 1);

        let sessions = adapter.db.list_activities("steam").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].subject_key, "Game A");
        assert_eq!(sessions[0].accumulated_duration_mins, 5);

        let unlocks = adapter.db.list_achievements("steam").await.unwrap();
        assert_eq!(unlocks[0].external_key, "440:WIN");
        assert_eq!(unlocks[0].name, "Title WIN");
        assert_eq!(unlocks[0].parent_session_id.as_deref(), Some(sessions[0].id.as_str()));
        assert!(adapter.snapshot().metadata.contains_key("440:WIN"));
    }

    #[tokio::test]
    async fn continuous_play_extends_one_session() {
        let dir = TempDir::new().unwrap();
        let mut adapter = adapter(&dir);
        adapter.client.set_game("440", "Game A", 100);
        adapter.poll_at(t0()).await.unwrap();

        adapter.client.set_game("440", "Game A", 105);
        adapter.poll_at(t0() + Duration::minutes(5)).await.unwrap();
        adapter.client.set_game("440", "Game A", 110);
        adapter.poll_at(t0() + Duration::minutes(10)).await.unwrap();

        let sessions = adapter.db.list_activities("steam").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].accumulated_duration_mins, 10);
    }

    #[tokio::test]
    async fn idle_games_skip_the_achievement_fetch() {
        let dir = TempDir::new().unwrap();
        let mut adapter = adapter(&dir);
        adapter.client.set_game("440", "Game A", 100);
        adapter.poll_at(t0()).await.unwrap();

        adapter.client.fail_achievements.store(true, Ordering::SeqCst);
        let summary = adapter.poll_at(t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(summary, GamePollSummary::default());
    }

    #[tokio::test]
    async fn failed_fetch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut adapter = adapter(&dir);
        adapter.client.set_game("440", "Game A", 100);
        adapter.poll_at(t0()).await.unwrap();

        adapter.client.set_game("440", "Game A", 130);
        adapter.client.fail_achievements.store(true, Ordering::SeqCst);
        assert!(adapter.poll_at(t0() + Duration::minutes(5)).await.is_err());

        assert!(adapter.db.list_activities("steam").await.unwrap().is_empty());
        assert_eq!(adapter.snapshot().items[0].playtime_forever_mins, 100);

        adapter.client.fail_achievements.store(false, Ordering::SeqCst);
        let summary = adapter.poll_at(t0() + Duration::minutes(10)).await.unwrap();
        assert_eq!(summary.sessions_touched, 1);
    }

    #[tokio::test]
    async fn games_missing_from_response_keep_their_baseline() {
        let dir = TempDir::new().unwrap();
        let mut adapter = adapter(&dir);
        adapter.client.set_game("440", "Game A", 100);
        adapter.client.set_game("620", "Game B", 50);
        adapter.poll_at(t0()).await.unwrap();

        adapter.client.games.lock().unwrap().retain(|game| game.id == "620");
        adapter.poll_at(t0() + Duration::minutes(5)).await.unwrap();

        adapter.client.set_game("440", "Game A", 103);
        let summary = adapter.poll_at(t0() + Duration::minutes(10)).await.unwrap();
        assert_eq!(summary.sessions_touched, 1);
        let sessions = adapter.db.list_activities("steam").await.unwrap();
        assert_eq!(sessions[0].accumulated_duration_mins, 3);
    }

    #[tokio::test]
    async fn repeated_game_in_one_response_counts_once() {
        let dir = TempDir::new().unwrap();
        let mut adapter = adapter(&dir);
        adapter.client.set_game("440", "Game A", 100);
        adapter.poll_at(t0()).await.unwrap();

        adapter.client.set_game("440", "Game A", 105);
        let repeat = adapter.client.games.lock().unwrap()[0].clone();
        adapter.client.games.lock().unwrap().push(repeat);
        let summary = adapter.poll_at(t0() + Duration::minutes(5)).await.unwrap();

        assert_eq!(summary.sessions_touched, 1);
        let sessions = adapter.db.list_activities("steam").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].accumulated_duration_mins, 5);
        assert_eq!(adapter.snapshot().items.len(), 1);
    }
}
