//! The local per-remote reference database.
//!
//! Tracks which packs have already been ingested and what each device's
//! branches pointed at as of the newest ingested pack. Persisted as a
//! single JSON document next to the repository; updates go through a
//! `.temp` sibling so a crash mid-write never loses the previous state.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefDb {
    /// device -> (branch -> commit)
    pub device_branches: BTreeMap<String, BTreeMap<String, String>>,
    /// bucket paths already downloaded and unpacked, in ingestion order
    pub merged_packs: Vec<String>,
}

impl RefDb {
    pub fn cache_path(git_dir: &Path, remote: &str, temp: bool) -> PathBuf {
        let temp_infix = if temp { ".temp" } else { "" };
        git_dir.join(format!("nightmarket-{remote}-cache{temp_infix}.json"))
    }

    /// Load the database, falling back to the `.temp` sibling in case we
    /// crashed halfway through the last update. `Ok(None)` means neither
    /// file exists and the caller should start fresh.
    pub async fn load(git_dir: &Path, remote: &str) -> Result<Option<RefDb>> {
        let data = match tokio::fs::read(Self::cache_path(git_dir, remote, false)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                match tokio::fs::read(Self::cache_path(git_dir, remote, true)).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e).context("while loading refdb"),
                }
            }
            Err(e) => return Err(e).context("while loading refdb"),
        };
        let db = serde_json::from_slice(&data).context("while parsing refdb")?;
        Ok(Some(db))
    }

    /// Persist atomically: write the `.temp` sibling, fsync it, then
    /// rename it over the canonical name.
    pub async fn save(&self, git_dir: &Path, remote: &str) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        let temp_path = Self::cache_path(git_dir, remote, true);
        let canonical_path = Self::cache_path(git_dir, remote, false);

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        match tokio::fs::remove_file(&canonical_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("while replacing refdb"),
        }
        tokio::fs::rename(&temp_path, &canonical_path).await?;
        Ok(())
    }
}
