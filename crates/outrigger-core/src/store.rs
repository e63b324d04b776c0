//! Last-connection persistence
//!
//! A deliberately small store: the single most recent connection record,
//! written as one JSON document. It exists so an app restart can offer to
//! re-establish the previous tunnel; the record is written only once a
//! connection is fully up and cleared whenever the tunnel goes down, so a
//! restart never auto-resumes a dead connection.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{AppError, Result};

/// Persisted record of the active connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub config: ServerConfig,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            connected_at: Utc::now(),
        }
    }
}

/// Boundary to the last-connection store
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn save(&self, record: &ConnectionRecord) -> Result<()>;
    /// Errors when no record is stored
    async fn load(&self) -> Result<ConnectionRecord>;
    async fn clear(&self) -> Result<()>;
    fn has_connection(&self) -> bool;
}

/// Whole-file JSON store in the platform data directory
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the default platform location
    pub fn at_default_path() -> Self {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("outrigger");
        path.push("connection.json");
        Self { path }
    }
}

#[async_trait]
impl ConnectionStore for JsonFileStore {
    async fn save(&self, record: &ConnectionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Storage(format!("create store directory: {e}")))?;
        }
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| AppError::Storage(format!("serialize record: {e}")))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| AppError::Storage(format!("write record: {e}")))
    }

    async fn load(&self) -> Result<ConnectionRecord> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| AppError::Storage(format!("read record: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Storage(format!("deserialize record: {e}")))
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("clear record: {e}"))),
        }
    }

    fn has_connection(&self) -> bool {
        self.path.exists()
    }
}
