use anyhow::Result;
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime},
    models::AchievementRecord,
};

fn row_to_achievement(row: &Row) -> Result<AchievementRecord> {
    let unlocked_at: String = row.get("unlocked_at")?;

    Ok(AchievementRecord {
        id: row.get("id")?,
        parent_session_id: row.get("parent_session_id")?,
        source: row.get("source")?,
        external_key: row.get("external_key")?,
        name: row.get("name")?,
        description: row.get("description")?,
        unlocked_at: parse_datetime(&unlocked_at, "unlocked_at")?,
    })
}

impl Database {
    /// Insert an unlock. Returns `None` when `(source, external_key)` is
    /// already stored, which makes re-detection after a crash a no-op.
    pub async fn insert_achievement(&self, achievement: &AchievementRecord) -> Result<Option<i64>> {
        let record = achievement.clone();
        self.execute(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO achievements (parent_session_id, source, external_key, name, description, unlocked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.parent_session_id,
                    record.source,
                    record.external_key,
                    record.name,
                    record.description,
                    format_datetime(&record.unlocked_at),
                ],
            )?;

            if inserted == 0 {
                return Ok(None);
            }
            Ok(Some(conn.last_insert_rowid()))
        })
        .await
    }

    pub async fn list_achievements(&self, source: &str) -> Result<Vec<AchievementRecord>> {
        let source = source.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_session_id, source, external_key, name, description, unlocked_at
                 FROM achievements
                 WHERE source = ?1
                 ORDER BY unlocked_at ASC, id ASC",
            )?;

            let mut rows = stmt.query(params![source])?;
            let mut achievements = Vec::new();
            while let Some(row) = rows.next()? {
                achievements.push(row_to_achievement(row)?);
            }
            Ok(achievements)
        })
        .await
    }
}
