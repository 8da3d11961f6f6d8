use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use harvester_core::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DurableFlags {
    #[serde(default)]
    resume_pending: bool,
    #[serde(default)]
    updated_at_ms: i64,
}

/// The durable tier of refresh state: one flag in one JSON file. Everything
/// else about a run is in-memory and dies with it. The flag is set right
/// before a refresh-motivated navigation and cleared by whoever observes it,
/// so at most one resume is ever pending.
#[derive(Debug, Clone)]
pub struct FlagStore {
    path: PathBuf,
}

impl FlagStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn resume_pending(&self) -> bool {
        self.load().resume_pending
    }

    pub fn set_resume_pending(&self) -> Result<()> {
        self.save(DurableFlags {
            resume_pending: true,
            updated_at_ms: Utc::now().timestamp_millis(),
        })
    }

    /// Read-and-clear. Returns whether a resume was pending.
    pub fn take_resume_pending(&self) -> Result<bool> {
        let flags = self.load();
        if flags.resume_pending {
            self.save(DurableFlags {
                resume_pending: false,
                updated_at_ms: Utc::now().timestamp_millis(),
            })?;
        }
        Ok(flags.resume_pending)
    }

    fn load(&self) -> DurableFlags {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                debug!(error = %e, path = %self.path.display(), "unreadable flag file, treating as unset");
                DurableFlags::default()
            }),
            Err(_) => DurableFlags::default(),
        }
    }

    fn save(&self, flags: DurableFlags) -> Result<()> {
        let content = serde_json::to_string_pretty(&flags)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)
            .map_err(|e| Error::Storage(format!("write {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}
