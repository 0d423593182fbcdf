use anyhow::{Context, Result};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_payload},
    models::FeedItemRecord,
};

fn row_to_feed_item(row: &Row) -> Result<FeedItemRecord> {
    let payload: String = row.get("payload")?;
    let occurred_at: String = row.get("occurred_at")?;
    let created_at: String = row.get("created_at")?;

    Ok(FeedItemRecord {
        id: row.get("id")?,
        source: row.get("source")?,
        external_key: row.get("external_key")?,
        title: row.get("title")?,
        url: row.get("url")?,
        payload: parse_payload(&payload),
        occurred_at: parse_datetime(&occurred_at, "occurred_at")?,
        created_at: parse_datetime(&created_at, "created_at")?,
    })
}

impl Database {
    /// Insert a feed item. Returns `None` when it is already stored.
    pub async fn insert_feed_item(&self, item: &FeedItemRecord) -> Result<Option<i64>> {
        let record = item.clone();
        self.execute(move |conn| {
            let payload =
                serde_json::to_string(&record.payload).context("failed to encode payload")?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO feed_items (source, external_key, title, url, payload, occurred_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.source,
                    record.external_key,
                    record.title,
                    record.url,
                    payload,
                    format_datetime(&record.occurred_at),
                    format_datetime(&record.created_at),
                ],
            )?;

            if inserted == 0 {
                return Ok(None);
            }
            Ok(Some(conn.last_insert_rowid()))
        })
        .await
    }

    /// Items of a source in insertion (chronological) order.
    pub async fn list_feed_items(&self, source: &str) -> Result<Vec<FeedItemRecord>> {
        let source = source.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source, external_key, title, url, payload, occurred_at, created_at
                 FROM feed_items
                 WHERE source = ?1
                 ORDER BY id ASC",
            )?;

            let mut rows = stmt.query(params![source])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_feed_item(row)?);
            }
            Ok(items)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn item(key: &str, minute: u32) -> FeedItemRecord {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 9, minute, 0).unwrap();
        FeedItemRecord {
            id: None,
            source: "letterboxd".into(),
            external_key: key.into(),
            title: format!("film {key}"),
            url: Some(format!("https://example.com/{key}")),
            payload: json!({ "rating": 4 }),
            occurred_at: at,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn inserted_items_keep_order_and_payload() {
        let db = Database::open_in_memory().unwrap();
        db.insert_feed_item(&item("a", 1)).await.unwrap();
        db.insert_feed_item(&item("b", 2)).await.unwrap();

        let stored = db.list_feed_items("letterboxd").await.unwrap();
        let keys: Vec<_> = stored.iter().map(|i| i.external_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(stored[0].payload, json!({ "rating": 4 }));
    }

    #[tokio::test]
    async fn reinserting_same_key_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_feed_item(&item("a", 1)).await.unwrap().is_some());
        assert!(db.insert_feed_item(&item("a", 1)).await.unwrap().is_none());
    }
}
