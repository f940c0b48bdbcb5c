// File storage for session documents

use anyhow::{Context, Result};
use protocol::{Document, SessionKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// Stored session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub room_code: SessionKey,
    pub game_state: Document,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// File store keeping one JSON file per session
pub struct FileStore {
    root_dir: PathBuf,
}

impl FileStore {
    // Create a new file store
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();

        // Create root directory if it doesn't exist
        fs::create_dir_all(&root_dir)
            .await
            .context("Failed to create file store directory")?;

        Ok(FileStore { root_dir })
    }

    // Get path for a session; keys are validated before they get here
    fn session_path(&self, session: &SessionKey) -> PathBuf {
        self.root_dir.join(format!("{}.json", session.as_str()))
    }

    // Save session document to disk
    pub async fn save_session(&self, session: &SessionKey, document: &Document) -> Result<()> {
        let path = self.session_path(session);
        let stored = StoredSession {
            room_code: session.clone(),
            game_state: document.clone(),
            updated_at: chrono::Utc::now(),
        };

        let json = serde_json::to_string_pretty(&stored).context("Failed to serialize session")?;

        // Write to a temporary file of our own first, then rename (atomic operation)
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&temp_path)
            .await
            .context("Failed to create temp file")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write session")?;

        file.sync_all().await.context("Failed to sync file")?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e).context("Failed to rename temp file");
        }

        tracing::debug!("Saved session {}", session);
        Ok(())
    }

    // Load session from disk, None if it was never saved
    pub async fn load_session(&self, session: &SessionKey) -> Result<Option<StoredSession>> {
        let path = self.session_path(session);
        if !self.session_exists(session).await {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .await
            .context("Failed to read session file")?;

        let stored: StoredSession =
            serde_json::from_str(&contents).context("Failed to deserialize session")?;

        tracing::debug!("Loaded session {}", session);
        Ok(Some(stored))
    }

    // Check if session exists
    pub async fn session_exists(&self, session: &SessionKey) -> bool {
        fs::metadata(self.session_path(session)).await.is_ok()
    }

    // List all stored sessions
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root_dir)
            .await
            .context("Failed to read directory")?;

        let mut sessions = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    sessions.push(stem.to_string());
                }
            }
        }

        Ok(sessions)
    }
}
