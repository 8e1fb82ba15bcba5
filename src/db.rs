use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::types::{
    ChatSession, Citation, GenerationParameters, PalaverError, Result, Role, StoredMessage,
};

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(PalaverError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(PalaverError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(PalaverError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    tracing::info!("Database initialized at {}", path_str);
    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    let pragmas = [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA busy_timeout = 5000",
        "PRAGMA foreign_keys = ON",
    ];

    for pragma in pragmas {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(PalaverError::Database(e).into());
        }
    }
    Ok(())
}

/// Session and message persistence. Explicitly constructed and handed to the
/// request handlers so the core stays testable against a throwaway database.
#[derive(Clone)]
pub struct ChatStore {
    pool: DbPool,
}

impl ChatStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn create_session(&self, name: &str, assistant_id: &str) -> Result<ChatSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO chat_sessions (id, name, assistant_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(assistant_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(ChatSession {
            id,
            name: name.to_string(),
            assistant_id: assistant_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub async fn session(&self, id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(session_from_row))
    }

    pub async fn sessions(&self) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query("SELECT * FROM chat_sessions ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(session_from_row).collect())
    }

    pub async fn rename_session(&self, id: &str, name: &str) -> Result<()> {
        sqlx::query("UPDATE chat_sessions SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_session(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        // Messages are removed explicitly rather than relying on the cascade:
        // pooled sqlite connections do not all carry the foreign_keys pragma.
        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Appends one turn and bumps the session's `updated_at`. Citations and
    /// parameters are stored as JSON text columns.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        reasoning: Option<&str>,
        citations: Option<&[Citation]>,
        parameters: Option<&GenerationParameters>,
    ) -> Result<StoredMessage> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let citations_json = match citations {
            Some(c) if !c.is_empty() => Some(serde_json::to_string(c)?),
            _ => None,
        };
        let parameters_json = match parameters {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO chat_messages \
             (id, session_id, role, content, reasoning, citations, parameters, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(reasoning)
        .bind(&citations_json)
        .bind(&parameters_json)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.touch_session(session_id).await?;

        Ok(StoredMessage {
            id,
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            reasoning: reasoning.map(|r| r.to_string()),
            citations: citations.filter(|c| !c.is_empty()).map(|c| c.to_vec()),
            parameters: parameters.cloned(),
            created_at: now,
        })
    }

    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE session_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(message_from_row).collect())
    }

    pub async fn session_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM chat_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    pub async fn message_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM chat_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        name: row.get("name"),
        assistant_id: row.get("assistant_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> StoredMessage {
    let role_raw: String = row.get("role");
    let role = match Role::parse(&role_raw) {
        Some(r) => r,
        None => {
            tracing::warn!("Unknown role '{}' in chat_messages; treating as user", role_raw);
            Role::User
        }
    };

    let citations = row
        .get::<Option<String>, _>("citations")
        .and_then(|raw| match serde_json::from_str(&raw) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("Dropping undecodable citations column: {}", e);
                None
            }
        });

    let parameters = row
        .get::<Option<String>, _>("parameters")
        .and_then(|raw| match serde_json::from_str(&raw) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!("Dropping undecodable parameters column: {}", e);
                None
            }
        });

    StoredMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role,
        content: row.get("content"),
        reasoning: row.get("reasoning"),
        citations,
        parameters,
        created_at: row.get("created_at"),
    }
}
