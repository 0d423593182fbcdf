use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, to_i64, to_u64},
    models::ActivityRecord,
};

const ACTIVITY_COLUMNS: &str = "id, source, subject_key, started_at, updated_at, stopped_at, \
     accumulated_duration_mins, device_id";

fn row_to_activity(row: &Row) -> Result<ActivityRecord> {
    let started_at: String = row.get("started_at")?;
    let updated_at: String = row.get("updated_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let duration: i64 = row.get("accumulated_duration_mins")?;

    Ok(ActivityRecord {
        id: row.get("id")?,
        source: row.get("source")?,
        subject_key: row.get("subject_key")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
        stopped_at: parse_optional_datetime(stopped_at, "stopped_at")?,
        accumulated_duration_mins: to_u64(duration, "accumulated_duration_mins")?,
        device_id: row.get("device_id")?,
    })
}

impl Database {
    pub async fn insert_activity(&self, activity: &ActivityRecord) -> Result<String> {
        let record = activity.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO activities (id, source, subject_key, started_at, updated_at, stopped_at, accumulated_duration_mins, device_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.source,
                    record.subject_key,
                    format_datetime(&record.started_at),
                    format_datetime(&record.updated_at),
                    record.stopped_at.as_ref().map(format_datetime),
                    to_i64(record.accumulated_duration_mins)?,
                    record.device_id,
                ],
            )?;
            Ok(record.id)
        })
        .await
    }

    /// Newest record for a subject, open or not.
    pub async fn select_most_recent_by_subject(
        &self,
        source: &str,
        subject_key: &str,
    ) -> Result<Option<ActivityRecord>> {
        let source = source.to_string();
        let subject_key = subject_key.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTIVITY_COLUMNS}
                 FROM activities
                 WHERE source = ?1 AND subject_key = ?2
                 ORDER BY updated_at DESC, rowid DESC
                 LIMIT 1"
            ))?;

            let mut rows = stmt.query(params![source, subject_key])?;
            let activity = match rows.next()? {
                Some(row) => Some(row_to_activity(row)?),
                None => None,
            };
            Ok(activity)
        })
        .await
    }

    /// Add observed minutes to a record and bump `updated_at`.
    pub async fn extend_activity(
        &self,
        activity_id: &str,
        additional_mins: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<ActivityRecord> {
        let activity_id = activity_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE activities
                 SET accumulated_duration_mins = accumulated_duration_mins + ?1,
                     updated_at = ?2
                 WHERE id = ?3 AND stopped_at IS NULL",
                params![
                    to_i64(additional_mins)?,
                    format_datetime(&updated_at),
                    activity_id,
                ],
            )?;

            if rows_affected == 0 {
                return Err(anyhow!("open activity {activity_id} not found"));
            }

            let activity = conn.query_row(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"),
                params![activity_id],
                |row| Ok(row_to_activity(row)),
            )??;
            Ok(activity)
        })
        .await
    }

    pub async fn stop_activity(&self, activity_id: &str, stopped_at: DateTime<Utc>) -> Result<()> {
        let activity_id = activity_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE activities
                 SET stopped_at = ?1,
                     updated_at = ?1
                 WHERE id = ?2 AND stopped_at IS NULL",
                params![format_datetime(&stopped_at), activity_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Records of a source that have not been explicitly stopped.
    pub async fn list_unstopped_activities(&self, source: &str) -> Result<Vec<ActivityRecord>> {
        let source = source.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTIVITY_COLUMNS}
                 FROM activities
                 WHERE source = ?1 AND stopped_at IS NULL
                 ORDER BY updated_at DESC"
            ))?;

            let mut rows = stmt.query(params![source])?;
            let mut activities = Vec::new();
            while let Some(row) = rows.next()? {
                activities.push(row_to_activity(row)?);
            }
            Ok(activities)
        })
        .await
    }

    pub async fn list_activities(&self, source: &str) -> Result<Vec<ActivityRecord>> {
        let source = source.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTIVITY_COLUMNS}
                 FROM activities
                 WHERE source = ?1
                 ORDER BY started_at ASC, rowid ASC"
            ))?;

            let mut rows = stmt.query(params![source])?;
            let mut activities = Vec::new();
            while let Some(row) = rows.next()? {
                activities.push(row_to_activity(row)?);
            }
            Ok(activities)
        })
        .await
    }
}
