//! Feature-table snapshot and static fallback hot list
//!
//! A snapshot directory holds `items.json`, `interactions.json`, optionally
//! `users.json`, and optionally `epoch.json`. Without `epoch.json` the epoch id
//! is derived from the data files' content so any change produces a new epoch.

use crate::error::{EngineError, Result};
use crate::models::{InteractionRow, ItemId, ItemRecord, ScoredItems, UserRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const ITEMS_FILE: &str = "items.json";
pub const USERS_FILE: &str = "users.json";
pub const INTERACTIONS_FILE: &str = "interactions.json";
pub const EPOCH_FILE: &str = "epoch.json";

const EPOCH_ID_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub epoch_id: String,
    pub items: Vec<ItemRecord>,
    /// `None` when the snapshot carries no user table
    pub users: Option<Vec<UserRecord>>,
    pub interactions: Vec<InteractionRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EpochFile {
    epoch_id: String,
}

pub fn load_snapshot(dir: &Path) -> Result<Snapshot> {
    let items: Vec<ItemRecord> = read_required(dir, ITEMS_FILE)?;
    if items.is_empty() {
        return Err(EngineError::Dataset(format!(
            "{} has no items",
            dir.join(ITEMS_FILE).display()
        )));
    }

    let users_path = dir.join(USERS_FILE);
    let users: Option<Vec<UserRecord>> = if users_path.exists() {
        Some(serde_json::from_slice(&fs::read(&users_path)?)?)
    } else {
        None
    };

    let interactions: Vec<InteractionRow> = read_required(dir, INTERACTIONS_FILE)?;
    let epoch_id = compute_epoch_id(dir)?;

    info!(
        epoch_id = %epoch_id,
        items = items.len(),
        users = users.as_ref().map(|u| u.len()),
        interactions = interactions.len(),
        "Snapshot loaded"
    );

    Ok(Snapshot {
        epoch_id,
        items,
        users,
        interactions,
    })
}

fn read_required<T: serde::de::DeserializeOwned>(dir: &Path, file: &str) -> Result<T> {
    let path = dir.join(file);
    if !path.exists() {
        return Err(EngineError::Dataset(format!("missing {}", path.display())));
    }
    Ok(serde_json::from_slice(&fs::read(&path)?)?)
}

/// `epoch.json` when present, otherwise the first 16 hex chars of SHA-256 over
/// the data files
pub fn compute_epoch_id(dir: &Path) -> Result<String> {
    let epoch_path = dir.join(EPOCH_FILE);
    if epoch_path.exists() {
        let epoch: EpochFile = serde_json::from_slice(&fs::read(&epoch_path)?)?;
        return Ok(epoch.epoch_id);
    }

    let mut hasher = Sha256::new();
    for file in [ITEMS_FILE, USERS_FILE, INTERACTIONS_FILE] {
        let path = dir.join(file);
        if path.exists() {
            hasher.update(file.as_bytes());
            hasher.update(fs::read(&path)?);
        }
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(EPOCH_ID_LEN);
    debug!(epoch_id = %id, "Epoch id derived from snapshot content");
    Ok(id)
}

/// Write a snapshot directory; `epoch_id` of `None` leaves the id content-derived
pub fn write_snapshot(
    dir: &Path,
    items: &[ItemRecord],
    users: Option<&[UserRecord]>,
    interactions: &[InteractionRow],
    epoch_id: Option<&str>,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(ITEMS_FILE), serde_json::to_vec_pretty(items)?)?;
    if let Some(users) = users {
        fs::write(dir.join(USERS_FILE), serde_json::to_vec_pretty(users)?)?;
    }
    fs::write(dir.join(INTERACTIONS_FILE), serde_json::to_vec_pretty(interactions)?)?;
    match epoch_id {
        Some(id) => fs::write(
            dir.join(EPOCH_FILE),
            serde_json::to_vec(&EpochFile {
                epoch_id: id.to_string(),
            })?,
        )?,
        None => {
            let epoch_path = dir.join(EPOCH_FILE);
            if epoch_path.exists() {
                fs::remove_file(epoch_path)?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackItem {
    pub item_id: ItemId,
    pub score: f64,
}

/// Last-known-good hot list served in degraded mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackHotList {
    pub generated_at: DateTime<Utc>,
    pub items: Vec<FallbackItem>,
}

impl FallbackHotList {
    pub fn from_scored(items: ScoredItems) -> Self {
        Self {
            generated_at: Utc::now(),
            items: items
                .into_iter()
                .map(|(item_id, score)| FallbackItem { item_id, score })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn load_fallback(path: &Path) -> Result<FallbackHotList> {
    let list: FallbackHotList = serde_json::from_slice(&fs::read(path)?)?;
    info!(
        path = %path.display(),
        items = list.items.len(),
        generated_at = %list.generated_at,
        "Fallback hot list loaded"
    );
    Ok(list)
}

/// Write via a temporary file and rename so readers never see a partial file
pub fn write_fallback(path: &Path, list: &FallbackHotList) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(list)?)?;
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), items = list.items.len(), "Fallback hot list written");
    Ok(())
}
