//! Persistence of fetched listings

use crate::fetch::worker::FetchOutcome;
use crate::Result;
use anyhow::Context;
use anyhow::bail;
use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Durable write of a task's payload, keyed by location
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Persist `outcome` under `key`. Outcomes without a payload are skipped.
    async fn persist(&self, key: &str, outcome: &FetchOutcome) -> Result<()>;
}

/// Writes `<key>.json` for JSON payloads and `<key>.txt` for raw text.
///
/// Keys are sanitised into file names; a key whose file name is already
/// taken by a different key is refused instead of overwriting it.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    /// File stem to the key that owns it
    claimed: Mutex<HashMap<String, String>>,
}

impl FileSink {
    /// Sink writing directly into `dir`, created if missing
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self {
            dir,
            claimed: Mutex::new(HashMap::new()),
        })
    }

    /// Sink writing into a fresh `<base>/<YYYYmmdd_HHMMSS>` directory
    pub fn timestamped(base: impl AsRef<Path>) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let sink = Self::new(base.as_ref().join(stamp))?;
        info!(dir = %sink.dir.display(), "writing results");
        Ok(sink)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str, extension: &str) -> Result<PathBuf> {
        let stem = file_stem(key);
        {
            let mut claimed = self.claimed.lock();
            let owner = claimed
                .entry(stem.clone())
                .or_insert_with(|| key.to_string());
            if owner.as_str() != key {
                bail!("key {key:?} maps to the same file as {owner:?}");
            }
        }
        Ok(self.dir.join(format!("{stem}.{extension}")))
    }
}

fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl PersistenceSink for FileSink {
    async fn persist(&self, key: &str, outcome: &FetchOutcome) -> Result<()> {
        let (path, content) = match outcome {
            FetchOutcome::Success(payload) => {
                (self.path_for(key, "json")?, serde_json::to_string_pretty(payload)?)
            }
            FetchOutcome::RawFallback(text) => (self.path_for(key, "txt")?, text.clone()),
            FetchOutcome::Failed { .. } => return Ok(()),
        };

        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(key, path = %path.display(), "saved result");
        Ok(())
    }
}
