use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A discrete fact from a feed-like source: a post, a liked video, a
/// scrobbled track, a watched film.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedItemRecord {
    pub id: Option<i64>,
    pub source: String,
    pub external_key: String,
    pub title: String,
    pub url: Option<String>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
