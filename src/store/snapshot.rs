//! JSON snapshot persistence for the in-memory task store.
//!
//! Rows in leased states are restored untouched; the next dispatcher
//! reclaim sweep returns them to `Pending` once their deadline lapses.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::core::error::{OrchestratorError, Result};
use crate::store::memory::MemoryTaskStore;
use crate::store::model::{CrawlTask, Host};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub hosts: Vec<Host>,
    pub tasks: Vec<CrawlTask>,
    pub saved_at: DateTime<Utc>,
}

impl MemoryTaskStore {
    /// Serialize hosts and tasks to a JSON checkpoint file.
    pub async fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = {
            let inner = self.inner.read().await;
            StoreSnapshot {
                hosts: inner.hosts.values().cloned().collect(),
                tasks: inner.tasks.values().cloned().collect(),
                saved_at: Utc::now(),
            }
        };

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("snapshot encode: {}", e)))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestratorError::StoreUnavailable(format!("snapshot dir: {}", e)))?;
        }
        fs::write(path.as_ref(), json)
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("snapshot write: {}", e)))?;
        Ok(())
    }

    /// Replace in-memory state with a checkpoint's contents and rebuild
    /// the live-fingerprint index from non-terminal rows.
    pub async fn load_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("snapshot read: {}", e)))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("snapshot decode: {}", e)))?;

        let mut inner = self.inner.write().await;
        inner.hosts = snapshot.hosts.into_iter().map(|h| (h.id.clone(), h)).collect();
        inner.tasks = snapshot
            .tasks
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let mut live_fp = HashMap::new();
        for task in inner.tasks.values() {
            if !task.status.is_terminal() {
                let key = (task.host_id.clone(), task.url_fp.clone());
                if let Some(prev) = live_fp.insert(key, task.id.clone()) {
                    warn!(
                        task_id = %task.id,
                        displaced = %prev,
                        "duplicate live fingerprint in snapshot"
                    );
                }
            }
        }
        inner.live_fp = live_fp;

        info!(
            hosts = inner.hosts.len(),
            tasks = inner.tasks.len(),
            "task store restored from checkpoint"
        );
        Ok(())
    }

    /// Spawn a periodic checkpoint loop.
    pub fn start_checkpointing(
        store: Arc<MemoryTaskStore>,
        path: impl Into<PathBuf>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let checkpoint_path = path.into();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                match store.save_state(&checkpoint_path).await {
                    Ok(()) => debug!(path = %checkpoint_path.display(), "store checkpoint saved"),
                    Err(e) => error!(error = %e, "failed to save store checkpoint"),
                }
            }
        })
    }
}
