// src/storage/state.rs
use crate::types::PositionState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    position: Option<PositionState>,
}

/// Result of reading the state file, keeping "no file" apart from "unreadable file".
#[derive(Debug, Clone, PartialEq)]
pub enum StateLoad {
    Ok(Option<PositionState>),
    Missing,
    Corrupt(String),
}

impl StateLoad {
    /// Anything ambiguous resolves to flat.
    pub fn into_position(self) -> Option<PositionState> {
        match self {
            StateLoad::Ok(pos) => pos,
            StateLoad::Missing | StateLoad::Corrupt(_) => None,
        }
    }
}

/// JSON file holding the single position. Assumes one bot process per file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_atomic(&self, data: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    /// Never fails: I/O problems are logged and the in-memory state stays authoritative.
    pub async fn save(&self, position: Option<&PositionState>) {
        let state = StateFile {
            position: position.cloned(),
        };
        let data = match serde_json::to_string_pretty(&state) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to serialize bot state: {}", e);
                return;
            }
        };
        match self.write_atomic(&data).await {
            Ok(()) => info!("💾 State saved | path={} open={}", self.path.display(), position.is_some()),
            Err(e) => error!("Failed to save bot state to {}: {}", self.path.display(), e),
        }
    }

    pub async fn load_outcome(&self) -> StateLoad {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StateLoad::Missing,
            Err(e) => return StateLoad::Corrupt(format!("read failed: {}", e)),
        };
        match serde_json::from_str::<StateFile>(&data) {
            Ok(state) => StateLoad::Ok(state.position),
            Err(e) => StateLoad::Corrupt(e.to_string()),
        }
    }

    /// Missing, unparsable or incomplete file -> None.
    pub async fn load(&self) -> Option<PositionState> {
        match self.load_outcome().await {
            StateLoad::Corrupt(reason) => {
                warn!(
                    "State file invalid -> FLAT | path={} reason={}",
                    self.path.display(),
                    reason
                );
                None
            }
            other => other.into_position(),
        }
    }
}
