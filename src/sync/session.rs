//! Merge continuous activity into sessions instead of duplicating rows.
//!
//! Each poll reports "N minutes of X happened since last time". If the newest
//! record for X was touched recently enough, the minutes are added to it;
//! otherwise a new, disjoint session starts. The window is the poll interval
//! plus the observed duration plus one minute of slack, so a week-long gap is
//! never folded into one giant session.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::{ActivityRecord, Database};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Extra continuation window on top of interval and observed duration.
const CONTINUATION_SLACK_MINS: u64 = 1;

/// A year of play in one poll is a broken counter, not a session.
const MAX_OBSERVED_MINS: u64 = 60 * 24 * 365;

fn minutes(mins: u64) -> Duration {
    Duration::minutes(mins.min(MAX_OBSERVED_MINS) as i64)
}

pub fn continuation_slack() -> Duration {
    minutes(CONTINUATION_SLACK_MINS)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Create,
    Extend { id: String },
}

/// Oldest `updated_at` that still counts as a continuation.
pub fn stale_cutoff(
    now: DateTime<Utc>,
    poll_interval: Duration,
    observed_mins: u64,
) -> DateTime<Utc> {
    now - poll_interval - minutes(observed_mins) - continuation_slack()
}

/// Still running: not stopped and touched within one poll interval plus slack.
/// Anything older ended at its own `updated_at`.
pub fn is_open(record: &ActivityRecord, poll_interval: Duration, now: DateTime<Utc>) -> bool {
    !record.is_stopped() && record.updated_at >= stale_cutoff(now, poll_interval, 0)
}

pub fn decide(
    existing: Option<&ActivityRecord>,
    observed_mins: u64,
    poll_interval: Duration,
    now: DateTime<Utc>,
) -> MergeDecision {
    match existing {
        Some(record)
            if !record.is_stopped()
                && record.updated_at >= stale_cutoff(now, poll_interval, observed_mins) =>
        {
            MergeDecision::Extend {
                id: record.id.clone(),
            }
        }
        _ => MergeDecision::Create,
    }
}

/// Whole minutes in `millis`, floored. Short, frequent polls under-count;
/// stored data already follows this rounding.
pub fn floor_minutes(millis: i64) -> u64 {
    u64::try_from(millis.max(0) / 60_000).unwrap_or(0)
}

/// Session bookkeeping for one source against the store.
#[derive(Clone)]
pub struct SessionMerger {
    db: Database,
    source: String,
    poll_interval: Duration,
    device_id: Option<String>,
}

impl SessionMerger {
    pub fn new(db: Database, source: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            db,
            source: source.into(),
            poll_interval,
            device_id: None,
        }
    }

    pub fn with_device_id(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub async fn merge_or_create(
        &self,
        subject_key: &str,
        observed_mins: u64,
        now: DateTime<Utc>,
    ) -> Result<ActivityRecord> {
        let observed_mins = observed_mins.min(MAX_OBSERVED_MINS);
        let existing = self
            .db
            .select_most_recent_by_subject(&self.source, subject_key)
            .await?;

        match decide(existing.as_ref(), observed_mins, self.poll_interval, now) {
            MergeDecision::Extend { id } => {
                log_debug!(
                    "[{}] extending session {id} for {subject_key} by {observed_mins}m",
                    self.source
                );
                self.db.extend_activity(&id, observed_mins, now).await
            }
            MergeDecision::Create => {
                let started_at = now - minutes(observed_mins);
                let record = ActivityRecord {
                    id: Uuid::new_v4().to_string(),
                    source: self.source.clone(),
                    subject_key: subject_key.to_string(),
                    started_at,
                    updated_at: now,
                    stopped_at: None,
                    accumulated_duration_mins: observed_mins,
                    device_id: self.device_id.clone(),
                };
                self.db.insert_activity(&record).await?;
                log_info!(
                    "[{}] new session {} for {subject_key} ({observed_mins}m)",
                    self.source,
                    record.id
                );
                Ok(record)
            }
        }
    }

    /// Force-close the open record for `subject_key`. Returns the closed record,
    /// or `None` when nothing was open. A stale record is left as it is.
    pub async fn stop(
        &self,
        subject_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ActivityRecord>> {
        let Some(mut record) = self
            .db
            .select_most_recent_by_subject(&self.source, subject_key)
            .await?
        else {
            return Ok(None);
        };
        if !is_open(&record, self.poll_interval, now) {
            return Ok(None);
        }

        self.db.stop_activity(&record.id, now).await?;
        record.stopped_at = Some(now);
        record.updated_at = now;
        Ok(Some(record))
    }

    /// Time-tracking category switch: every other open record of this source
    /// is stopped, then `subject_key` is merged or started.
    pub async fn switch_to(
        &self,
        subject_key: &str,
        observed_mins: u64,
        now: DateTime<Utc>,
    ) -> Result<ActivityRecord> {
        for open in self.db.list_unstopped_activities(&self.source).await? {
            if open.subject_key != subject_key && is_open(&open, self.poll_interval, now) {
                self.db.stop_activity(&open.id, now).await?;
            }
        }
        self.merge_or_create(subject_key, observed_mins, now).await
    }
}
