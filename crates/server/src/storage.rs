// Durable storage backend for session documents

use crate::database::Database;
use crate::file_store::FileStore;
use anyhow::Result;
use protocol::{Document, SessionKey};

/// Where session documents live: a SQL database when one is configured,
/// otherwise JSON files on disk
pub enum Storage {
    Database(Database),
    Files(FileStore),
}

impl Storage {
    pub async fn select(&self, session: &SessionKey) -> Result<Option<Document>> {
        match self {
            Storage::Database(db) => match db.get_session(session).await? {
                Some(record) => {
                    if let Ok(at) = record.updated_at_parsed() {
                        tracing::debug!("Loaded {} last written at {}", session, at);
                    }
                    Ok(Some(record.document()?))
                }
                None => Ok(None),
            },
            Storage::Files(files) => Ok(files
                .load_session(session)
                .await?
                .map(|stored| stored.game_state)),
        }
    }

    pub async fn upsert(&self, session: &SessionKey, document: &Document) -> Result<()> {
        match self {
            Storage::Database(db) => db.upsert_session(session, document).await,
            Storage::Files(files) => files.save_session(session, document).await,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Storage::Database(_) => "database",
            Storage::Files(_) => "file store",
        }
    }
}
