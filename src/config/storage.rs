//! Saved connection storage
//!
//! Persists non-secret connection metadata as versioned JSON.
//! Location: ~/.cloudfm/connections.json (%APPDATA%\CloudFM on Windows)

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use super::types::{AuthKind, ConnectionConfig, ConnectionId, CONFIG_VERSION};
use crate::error::{Error, Result};

/// One saved connection. Deliberately has no secret field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedConnection {
    pub id: ConnectionId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthKind,
    pub saved_at: DateTime<Utc>,
}

impl SavedConnection {
    pub fn new(id: ConnectionId, config: &ConnectionConfig, auth: AuthKind) -> Self {
        Self {
            id,
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            auth,
            saved_at: Utc::now(),
        }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new(&self.name, &self.host, self.port, &self.username)
    }
}

/// On-disk layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsFile {
    pub version: u32,
    #[serde(default)]
    pub connections: Vec<SavedConnection>,
}

impl Default for ConnectionsFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connections: Vec::new(),
        }
    }
}

/// Get the CloudFM configuration directory
pub fn config_dir() -> Result<PathBuf> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("CloudFM"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".cloudfm"))
        .ok_or_else(|| Error::Storage("failed to determine config directory".into()))
}

fn storage_err(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{}: {}", path.display(), err))
}

/// Reads and writes the saved-connections file
pub struct ConnectionStore {
    path: PathBuf,
}

impl ConnectionStore {
    /// Store at the default location
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: config_dir()?.join("connections.json"),
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file. A missing file yields an empty list; a corrupt file is
    /// backed up and replaced by an empty list.
    pub async fn load(&self) -> Result<ConnectionsFile> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ConnectionsFile::default())
            }
            Err(e) => return Err(storage_err(&self.path, e)),
        };

        match serde_json::from_str::<ConnectionsFile>(&contents) {
            Ok(file) if file.version > CONFIG_VERSION => Err(Error::Storage(format!(
                "config version {} is newer than supported {}",
                file.version, CONFIG_VERSION
            ))),
            Ok(file) => Ok(file),
            Err(e) => {
                warn!("Saved connections file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => {
                        warn!("Corrupted file backed up to {:?}, starting empty", backup_path)
                    }
                    Err(backup_err) => {
                        error!("Failed to back up corrupted file: {}", backup_err)
                    }
                }
                Ok(ConnectionsFile::default())
            }
        }
    }

    /// Write via temp file + rename
    pub async fn save(&self, file: &ConnectionsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err(parent, e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(file).map_err(|e| storage_err(&self.path, e))?;

        let mut out = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage_err(&temp_path, e))?;
        out.write_all(json.as_bytes())
            .await
            .map_err(|e| storage_err(&temp_path, e))?;
        out.sync_all().await.map_err(|e| storage_err(&temp_path, e))?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| storage_err(&self.path, e))
    }

    pub async fn list(&self) -> Result<Vec<SavedConnection>> {
        Ok(self.load().await?.connections)
    }

    /// Insert or replace by id
    pub async fn upsert(&self, saved: SavedConnection) -> Result<()> {
        let mut file = self.load().await?;
        match file.connections.iter_mut().find(|c| c.id == saved.id) {
            Some(existing) => *existing = saved,
            None => file.connections.push(saved),
        }
        self.save(&file).await
    }

    /// Update the display name. Returns false when the id is not saved.
    pub async fn rename(&self, id: &ConnectionId, name: &str) -> Result<bool> {
        let mut file = self.load().await?;
        let Some(existing) = file.connections.iter_mut().find(|c| &c.id == id) else {
            return Ok(false);
        };
        existing.name = name.to_string();
        self.save(&file).await?;
        Ok(true)
    }

    pub async fn remove(&self, id: &ConnectionId) -> Result<bool> {
        let mut file = self.load().await?;
        let before = file.connections.len();
        file.connections.retain(|c| &c.id != id);
        if file.connections.len() == before {
            return Ok(false);
        }
        self.save(&file).await?;
        Ok(true)
    }

    async fn backup(&self) -> Result<PathBuf> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::copy(&self.path, &backup_path)
            .await
            .map_err(|e| storage_err(&backup_path, e))?;
        Ok(backup_path)
    }
}
