//! Mergeable records of continuous activity: play sessions, sleep cycles,
//! time-tracking blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    pub source: String,
    pub subject_key: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set by an explicit stop; a stopped record is never extended.
    pub stopped_at: Option<DateTime<Utc>>,
    pub accumulated_duration_mins: u64,
    pub device_id: Option<String>,
}

impl ActivityRecord {
    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }
}
