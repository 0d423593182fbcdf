use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AchievementRecord {
    /// `None` until inserted.
    pub id: Option<i64>,
    /// Play session the unlock happened in. Legacy rows have none.
    pub parent_session_id: Option<String>,
    pub source: String,
    /// Unique within `source`, e.g. `"440:TF_PLAY_GAME_EVERYCLASS"`.
    pub external_key: String,
    pub name: String,
    pub description: String,
    pub unlocked_at: DateTime<Utc>,
}
