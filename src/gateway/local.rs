use crate::{
    bus::{AuthChange, EventBus},
    chat::{Like, MessageKind, MessageRecord, RoomRecord, FULL_FETCH_LIMIT},
    entity::{Session, FALLBACK_DISPLAY_NAME},
    error::{GatewayError, Result},
    gateway::Gateway,
};
use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::{
    path::Path,
    str::FromStr,
    sync::atomic::{AtomicI64, Ordering},
};
use tokio::{
    sync::{broadcast, RwLock},
    task,
};
use tracing::{debug, info};
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;

/// Self-contained backend on a SQLite file. Implements the whole gateway
/// contract so the client can run without a hosted service.
///
/// Timestamps are stored as microseconds since the epoch and handed out
/// strictly increasing, so watermark fetches never skip a row.
pub struct LocalGateway {
    pool: SqlitePool,
    session: RwLock<Option<String>>,
    last_micros: AtomicI64,
    bus: EventBus,
}

impl LocalGateway {
    /// Open (or create) the database file and its schema.
    pub async fn open(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let gateway = Self::with_pool(pool);
        gateway.init().await?;
        info!("Local backend ready at {}", db_path.display());
        Ok(gateway)
    }

    /// Private in-memory database, gone when the gateway is dropped.
    pub async fn in_memory() -> anyhow::Result<Self> {
        // A single connection, otherwise every connection gets its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        let gateway = Self::with_pool(pool);
        gateway.init().await?;
        Ok(gateway)
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            session: RwLock::new(None),
            last_micros: AtomicI64::new(0),
            bus: EventBus::new(),
        }
    }

    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_profiles (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_rooms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS room_members (
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'text',
                parent_message_id TEXT,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_messages_room_created ON messages(room_id, created_at);

            CREATE TABLE IF NOT EXISTS message_likes (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        let last: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(ts) FROM (
                SELECT MAX(created_at) AS ts FROM messages
                UNION ALL SELECT MAX(created_at) FROM chat_rooms
                UNION ALL SELECT MAX(created_at) FROM accounts
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to read latest timestamp")?;
        self.last_micros.store(last.unwrap_or(0), Ordering::SeqCst);

        Ok(())
    }

    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let prev = match self
            .last_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        now.max(prev + 1)
    }

    async fn require_user(&self) -> Result<String> {
        self.session.read().await.clone().ok_or(GatewayError::Unauthenticated)
    }

    async fn sign_in(&self, user_id: &str) {
        *self.session.write().await = Some(user_id.to_string());
        self.bus.publish(AuthChange::SignedIn);
    }

    async fn room_exists(&self, room_id: &str) -> Result<bool> {
        let found = sqlx::query("SELECT 1 FROM chat_rooms WHERE id = ?")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn load_session(&self, user_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.email, a.created_at, p.display_name
            FROM accounts a
            LEFT JOIN user_profiles p ON p.id = a.id
            WHERE a.id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| session_from_row(&row)).transpose()
    }
}

/// Argon2id PHC string with a fresh random salt. Runs off the async workers.
async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes()).map_err(credentials_error)?;
    task::spawn_blocking(move || -> Result<String> {
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(credentials_error)
    })
    .await
    .map_err(credentials_error)?
}

async fn verify_password(password: &str, stored: String) -> Result<bool> {
    let password = password.to_string();
    task::spawn_blocking(move || -> Result<bool> {
        let hash = PasswordHash::new(&stored).map_err(credentials_error)?;
        Ok(Argon2::default().verify_password(password.as_bytes(), &hash).is_ok())
    })
    .await
    .map_err(credentials_error)?
}

fn credentials_error(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Credentials(err.to_string())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn time_from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    let display_name: Option<String> = row.try_get("display_name")?;
    Ok(Session {
        user_id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: display_name.unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string()),
        created_at: time_from_micros(row.try_get("created_at")?),
    })
}

fn room_from_row(row: &SqliteRow) -> Result<RoomRecord> {
    let last_message_at: Option<i64> = row.try_get("last_message_at")?;
    Ok(RoomRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_by: row.try_get("created_by")?,
        created_at: time_from_micros(row.try_get("created_at")?),
        member_count: row.try_get("member_count")?,
        last_message_at: last_message_at.map(time_from_micros),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let kind: String = row.try_get("type")?;
    let deleted_at: Option<i64> = row.try_get("deleted_at")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        user_id: row.try_get("user_id")?,
        content: row.try_get("content")?,
        kind: kind.parse().unwrap_or_default(),
        parent_message_id: row.try_get("parent_message_id")?,
        created_at: time_from_micros(row.try_get("created_at")?),
        deleted_at: deleted_at.map(time_from_micros),
    })
}

#[async_trait]
impl Gateway for LocalGateway {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Session> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.email, a.password_hash, a.created_at, p.display_name
            FROM accounts a
            LEFT JOIN user_profiles p ON p.id = a.id
            WHERE a.email = ?
            "#,
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        let invalid = || GatewayError::Auth("Invalid login credentials".to_string());
        let row = row.ok_or_else(invalid)?;

        let stored: String = row.try_get("password_hash")?;
        if !verify_password(password, stored).await? {
            return Err(invalid());
        }

        let session = session_from_row(&row)?;
        self.sign_in(&session.user_id).await;
        debug!("Signed in {}", session);
        Ok(session)
    }

    async fn create_account(&self, email: &str, password: &str, display_name: &str) -> Result<Session> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(GatewayError::Auth(format!(
                "Password should be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let email = normalize_email(email);
        let user_id = Uuid::new_v4().to_string();
        let password_hash = hash_password(password).await?;
        let created_at = self.next_timestamp();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO accounts (id, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&user_id)
        .bind(&email)
        .bind(&password_hash)
        .bind(created_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            let err = GatewayError::from(err);
            return Err(if err.is_duplicate() {
                GatewayError::Auth("User already registered".to_string())
            } else {
                err
            });
        }

        sqlx::query("INSERT INTO user_profiles (id, display_name, created_at) VALUES (?, ?, ?)")
            .bind(&user_id)
            .bind(display_name)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.sign_in(&user_id).await;
        Ok(Session::new(user_id, email, display_name, time_from_micros(created_at)))
    }

    async fn end_session(&self) -> Result<()> {
        let previous = self.session.write().await.take();
        if previous.is_some() {
            self.bus.publish(AuthChange::SignedOut);
        }
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>> {
        let user_id = self.session.read().await.clone();
        match user_id {
            Some(user_id) => self.load_session(&user_id).await,
            None => Ok(None),
        }
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.name, r.description, r.created_by, r.created_at,
                (SELECT COUNT(*) FROM room_members m WHERE m.room_id = r.id) AS member_count,
                (SELECT MAX(g.created_at) FROM messages g WHERE g.room_id = r.id) AS last_message_at
            FROM chat_rooms r
            ORDER BY r.created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(room_from_row).collect()
    }

    async fn create_room(&self, name: &str, description: Option<&str>) -> Result<RoomRecord> {
        let user_id = self.require_user().await?;
        let room_id = Uuid::new_v4().to_string();
        let created_at = self.next_timestamp();

        // Room and creator membership land together or not at all.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chat_rooms (id, name, description, created_by, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&room_id)
        .bind(name)
        .bind(description)
        .bind(&user_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(&room_id)
            .bind(&user_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(RoomRecord {
            id: room_id,
            name: name.to_string(),
            description: description.map(str::to_string),
            created_by: user_id,
            created_at: time_from_micros(created_at),
            member_count: 1,
            last_message_at: None,
        })
    }

    async fn add_membership(&self, room_id: &str) -> Result<()> {
        let user_id = self.require_user().await?;
        if !self.room_exists(room_id).await? {
            return Err(GatewayError::NotFound(format!("room {}", room_id)));
        }

        let inserted = sqlx::query("INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(room_id)
            .bind(&user_id)
            .bind(self.next_timestamp())
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = GatewayError::from(err);
                if err.is_duplicate() {
                    Err(GatewayError::Duplicate(format!("already a member of {}", room_id)))
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn remove_membership(&self, room_id: &str) -> Result<()> {
        let user_id = self.require_user().await?;
        sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
            .bind(room_id)
            .bind(&user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_messages(&self, room_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<MessageRecord>> {
        let rows = match since {
            Some(since) => {
                sqlx::query(
                    r#"
                    SELECT id, room_id, user_id, content, type, parent_message_id, created_at, deleted_at
                    FROM messages
                    WHERE room_id = ? AND created_at > ?
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(room_id)
                .bind(since.timestamp_micros())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                let mut rows = sqlx::query(
                    r#"
                    SELECT id, room_id, user_id, content, type, parent_message_id, created_at, deleted_at
                    FROM messages
                    WHERE room_id = ?
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(room_id)
                .bind(FULL_FETCH_LIMIT as i64)
                .fetch_all(&self.pool)
                .await?;
                // Newest first from the query, callers want chronological order
                rows.reverse();
                rows
            }
        };

        rows.iter().map(message_from_row).collect()
    }

    async fn create_message(
        &self,
        room_id: &str,
        content: &str,
        kind: MessageKind,
        parent_id: Option<&str>,
    ) -> Result<MessageRecord> {
        let user_id = self.require_user().await?;
        if !self.room_exists(room_id).await? {
            return Err(GatewayError::NotFound(format!("room {}", room_id)));
        }

        let id = Uuid::new_v4().to_string();
        let created_at = self.next_timestamp();

        sqlx::query(
            r#"
            INSERT INTO messages (id, room_id, user_id, content, type, parent_message_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(room_id)
        .bind(&user_id)
        .bind(content)
        .bind(kind.as_str())
        .bind(parent_id)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(MessageRecord {
            id,
            room_id: room_id.to_string(),
            user_id,
            content: content.to_string(),
            kind,
            parent_message_id: parent_id.map(str::to_string),
            created_at: time_from_micros(created_at),
            deleted_at: None,
        })
    }

    async fn soft_delete_message(&self, message_id: &str) -> Result<()> {
        let user_id = self.require_user().await?;

        let author: Option<String> = sqlx::query_scalar("SELECT user_id FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        match author {
            None => Err(GatewayError::NotFound(format!("message {}", message_id))),
            Some(author) if author != user_id => Err(GatewayError::Rejected {
                status: 403,
                message: "Only the author can delete a message".to_string(),
            }),
            Some(_) => {
                sqlx::query("UPDATE messages SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
                    .bind(self.next_timestamp())
                    .bind(message_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        }
    }

    async fn list_likes(&self, message_ids: &[String]) -> Result<Vec<Like>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "SELECT message_id, user_id, created_at FROM message_likes WHERE message_id IN ({}) ORDER BY created_at ASC",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for id in message_ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(Like {
                    message_id: row.try_get("message_id")?,
                    user_id: row.try_get("user_id")?,
                    created_at: time_from_micros(row.try_get("created_at")?),
                })
            })
            .collect()
    }

    async fn add_like(&self, message_id: &str, user_id: &str) -> Result<()> {
        self.require_user().await?;

        let inserted = sqlx::query("INSERT INTO message_likes (message_id, user_id, created_at) VALUES (?, ?, ?)")
            .bind(message_id)
            .bind(user_id)
            .bind(self.next_timestamp())
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = GatewayError::from(err);
                if err.is_duplicate() {
                    Err(GatewayError::Duplicate(format!("like on {}", message_id)))
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn remove_like(&self, message_id: &str, user_id: &str) -> Result<()> {
        self.require_user().await?;
        sqlx::query("DELETE FROM message_likes WHERE message_id = ? AND user_id = ?")
            .bind(message_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.bus.subscribe()
    }
}
