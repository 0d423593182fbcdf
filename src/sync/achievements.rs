//! Two-tier achievement detection.
//!
//! The cheap tier diffs the `achieved` flags of a game's achievement list. The
//! expensive tier (names and descriptions) is fetched only for keys that just
//! flipped and were never resolved before, then cached in the snapshot. Large
//! achievement lists therefore cost one flag fetch per poll.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::snapshot::AchievementMetadata;
use crate::sync::delta::{became_true, DeltaDetector, Flagged, NativeOrder};
use crate::utils::serde_helpers::{bool_or_int, string_or_number};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// One entry of a game's achievement list as the source reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAchievement {
    #[serde(default, deserialize_with = "string_or_number")]
    pub api_name: String,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub achieved: bool,
    #[serde(default)]
    pub unlock_time: Option<DateTime<Utc>>,
}

impl Flagged for RemoteAchievement {
    fn is_flagged(&self) -> bool {
        self.achieved
    }
}

fn achievement_key(item: &RemoteAchievement) -> Option<String> {
    let name = item.api_name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn unlock_time(item: &RemoteAchievement) -> Option<DateTime<Utc>> {
    item.unlock_time
}

/// Key of an achievement within its source: `"<game>:<api name>"`.
pub fn scoped_key(scope: &str, api_name: &str) -> String {
    format!("{scope}:{api_name}")
}

/// Second remote call: display metadata for specific achievements.
pub trait MetadataResolver {
    fn resolve(
        &self,
        scope: &str,
        api_names: &[String],
    ) -> impl Future<Output = Result<HashMap<String, AchievementMetadata>, SourceError>> + Send;
}

/// A freshly earned achievement with whatever metadata could be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewlyUnlocked {
    pub external_key: String,
    pub api_name: String,
    pub name: String,
    pub description: String,
    pub unlocked_at: Option<DateTime<Utc>>,
}

pub struct AchievementReconciler {
    detector: DeltaDetector<RemoteAchievement, String>,
}

impl Default for AchievementReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl AchievementReconciler {
    pub fn new() -> Self {
        Self {
            detector: DeltaDetector::new(achievement_key, became_true::<RemoteAchievement>)
                .ordered_by(unlock_time)
                .native_order(NativeOrder::OldestFirst),
        }
    }

    /// Flag-only tier: achievements whose `achieved` flipped to true.
    pub fn newly_unlocked(
        &self,
        previous: &[RemoteAchievement],
        current: &[RemoteAchievement],
    ) -> Vec<RemoteAchievement> {
        self.detector.detect_new(previous, current)
    }

    pub fn baseline(&self, current: &[RemoteAchievement]) -> Vec<RemoteAchievement> {
        self.detector.baseline(current)
    }

    /// Both tiers. `cache` is keyed by [`scoped_key`] and gains every resolved
    /// entry. A failed resolve still yields the unlocks, named after their key
    /// with an empty description.
    pub async fn reconcile<R: MetadataResolver>(
        &self,
        scope: &str,
        previous: &[RemoteAchievement],
        current: &[RemoteAchievement],
        cache: &mut BTreeMap<String, AchievementMetadata>,
        resolver: &R,
    ) -> Vec<NewlyUnlocked> {
        let unlocked = self.newly_unlocked(previous, current);
        if unlocked.is_empty() {
            return Vec::new();
        }

        let missing: Vec<String> = unlocked
            .iter()
            .filter(|item| !cache.contains_key(&scoped_key(scope, &item.api_name)))
            .map(|item| item.api_name.clone())
            .collect();

        if !missing.is_empty() {
            log_debug!("[{scope}] resolving metadata for {} achievements", missing.len());
            match resolver.resolve(scope, &missing).await {
                Ok(resolved) => {
                    for (api_name, metadata) in resolved {
                        cache.insert(scoped_key(scope, &api_name), metadata);
                    }
                }
                Err(err) => {
                    log_warn!("[{scope}] achievement metadata unavailable, recording bare unlocks: {err}");
                }
            }
        }

        unlocked
            .into_iter()
            .map(|item| {
                let external_key = scoped_key(scope, &item.api_name);
                let metadata = cache.get(&external_key).cloned().unwrap_or_default();
                let name = if metadata.name.is_empty() {
                    item.api_name.clone()
                } else {
                    metadata.name
                };
                NewlyUnlocked {
                    external_key,
                    api_name: item.api_name,
                    name,
                    description: metadata.description,
                    unlocked_at: item.unlock_time,
                }
            })
            .collect()
    }
}
