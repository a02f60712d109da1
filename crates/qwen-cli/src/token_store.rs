use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use qwen_client::TokenLease;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STORE_DIR: &str = ".qwen-client";
const TOKEN_FILE: &str = "tokens.json";

/// The token lease persisted between CLI runs.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.qwen-client/tokens.json`, or under the temp dir without a home.
    pub fn default_location() -> Self {
        Self::new(data_dir().join(TOKEN_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file means no stored lease.
    pub async fn load(&self) -> Option<TokenLease> {
        let content = fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(lease) => Some(lease),
            Err(e) => {
                warn!("Ignoring unreadable token file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, lease: &TokenLease) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(lease).context("Failed to serialize token lease")?;

        // Owner-only from creation; an existing file is tightened before any
        // token bytes reach it.
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await
                .with_context(|| format!("Failed to restrict {}", self.path.display()))?;
        }

        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        debug!("Saved token lease to {}", self.path.display());
        Ok(())
    }

    /// Persist `lease`, or remove the file when there is none.
    pub async fn sync(&self, lease: Option<&TokenLease>) -> Result<()> {
        match lease {
            Some(lease) => self.save(lease).await,
            None => self.delete().await,
        }
    }

    pub async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", self.path.display())),
        }
    }
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(STORE_DIR)
}
