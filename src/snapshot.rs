//! Per-adapter snapshot persistence.
//!
//! Each adapter keeps the last-synchronized view of its remote collection in a
//! small JSON file:
//!
//! ```json
//! {
//!   "items": [ ... ],
//!   "authState": { "accessToken": "...", "refreshToken": "...", "expiresAt": "..." },
//!   "metadata": { "440:ACH_WIN": { "name": "...", "description": "..." } }
//! }
//! ```
//!
//! Loading never fails. A missing, empty, or corrupt file yields an empty
//! snapshot, which the delta detector treats as a first poll. Saving goes
//! through a temp file plus rename so the next load never sees half a file.
//! Save failures are logged and swallowed: a lost snapshot only causes
//! re-detection on the next poll, which the store's unique keys absorb.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= now
    }
}

/// Display metadata for an achievement, resolved lazily and cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AchievementMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: DeserializeOwned"))]
pub struct Snapshot<T> {
    #[serde(default)]
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_state: Option<Credentials>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, AchievementMetadata>,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            auth_state: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl<T> Snapshot<T> {
    pub fn with_items(items: Vec<T>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    /// Drop credentials known to be dead so the next run re-authenticates.
    pub fn clear_credentials(&mut self) {
        self.auth_state = None;
    }
}

/// File location for one adapter's snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load<T: DeserializeOwned>(&self) -> Snapshot<T> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log_debug!("no snapshot at {}, starting empty", self.path.display());
                return Snapshot::default();
            }
            Err(err) => {
                log_warn!(
                    "failed to read snapshot {} ({err}), starting empty",
                    self.path.display()
                );
                return Snapshot::default();
            }
        };

        if content.trim().is_empty() {
            log_warn!("empty snapshot file {}, starting empty", self.path.display());
            return Snapshot::default();
        }

        match serde_json::from_str(&content) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log_warn!(
                    "failed to parse snapshot {} ({err}), starting empty",
                    self.path.display()
                );
                Snapshot::default()
            }
        }
    }

    /// Write-through save. Never fails the caller.
    pub fn save<T: Serialize>(&self, snapshot: &Snapshot<T>) {
        if let Err(err) = self.try_save(snapshot) {
            log::error!("failed to save snapshot {}: {err:#}", self.path.display());
        }
    }

    pub fn try_save<T: Serialize>(&self, snapshot: &Snapshot<T>) -> Result<()> {
        let content =
            serde_json::to_string_pretty(snapshot).context("failed to serialize snapshot")?;

        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("failed to create snapshot directory {}", parent.display()))?;

        let mut temp_file = NamedTempFile::new_in(&parent)
            .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
        temp_file
            .write_all(content.as_bytes())
            .context("failed to write temp snapshot")?;
        temp_file.flush().context("failed to flush temp snapshot")?;
        temp_file
            .persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        Ok(())
    }
}
