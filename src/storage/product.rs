//! Product records and the JSONL sink used by the parser worker.
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::error::{OrchestratorError, Result};
use crate::core::traits::ProductSink;
use crate::core::types::{HostId, ParserTag, TaskId};

/// One extracted product, as emitted by a parser handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub task_id: TaskId,
    pub host_id: HostId,
    pub url: String,
    pub parser_tag: ParserTag,
    pub fields: serde_json::Value,
    pub parsed_at: DateTime<Utc>,
}

/// Append-only JSON Lines product sink.
pub struct JsonlProductSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlProductSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OrchestratorError::StoreUnavailable(format!("product dir: {}", e)))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl ProductSink for JsonlProductSink {
    async fn write(&self, record: &ProductRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("product encode: {}", e)))?;
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("product open: {}", e)))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("product write: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("product flush: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("products.jsonl");
        let sink = JsonlProductSink::new(&path).unwrap();

        for i in 0..3 {
            let record = ProductRecord {
                task_id: TaskId::generate(),
                host_id: HostId::generate(),
                url: format!("https://a.example/p/{}", i),
                parser_tag: ParserTag::new("generic"),
                fields: serde_json::json!({ "index": i }),
                parsed_at: Utc::now(),
            };
            sink.write(&record).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        let parsed: ProductRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.fields["index"], 0);
    }
}
