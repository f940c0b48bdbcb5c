// Database storage for session documents

use anyhow::{Context, Result};
use protocol::{Document, SessionKey};
use sqlx::AnyPool;

// Database manager for the sessions table
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    // Create a new database connection
    pub async fn new(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPool::connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Database { pool };
        db.init().await?;

        Ok(db)
    }

    // Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                room_code VARCHAR(64) PRIMARY KEY,
                game_state TEXT NOT NULL,
                updated_at VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create sessions table")?;

        tracing::info!("Database initialized successfully");
        Ok(())
    }

    // Get the stored document for a session
    pub async fn get_session(&self, session: &SessionKey) -> Result<Option<SessionRecord>> {
        let result = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT room_code, game_state, updated_at
            FROM sessions
            WHERE room_code = ?
            "#,
        )
        .bind(session.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get session")?;

        Ok(result)
    }

    // Insert or overwrite the whole document for a session
    pub async fn upsert_session(&self, session: &SessionKey, document: &Document) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let game_state = serde_json::to_string(document).context("Failed to serialize document")?;

        // REPLACE INTO is understood by both MySQL and SQLite
        sqlx::query(
            r#"
            REPLACE INTO sessions (room_code, game_state, updated_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(session.as_str())
        .bind(&game_state)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to upsert session")?;

        tracing::debug!("Stored session {} in database", session);
        Ok(())
    }
}

// Session database record
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub room_code: String,
    pub game_state: String,
    pub updated_at: String,
}

impl SessionRecord {
    // Parse the stored document
    pub fn document(&self) -> Result<Document> {
        serde_json::from_str(&self.game_state).context("Failed to deserialize game state")
    }

    // Parse updated_at as DateTime
    pub fn updated_at_parsed(&self) -> Result<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.updated_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .context("Failed to parse updated_at")
    }
}
