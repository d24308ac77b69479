use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::RoomAddress;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("room name already taken: {0}")]
    NameTaken(String),

    #[error("address already used by another room: {0}")]
    AddressTaken(RoomAddress),

    #[error("invalid stored data: {0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Credentials and room registry, shared by the master and every room
/// process. Rooms never talk to each other except through this.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_password(&self, username: &str) -> Result<Option<String>, StoreError>;

    async fn put_user(&self, username: &str, password: &str) -> Result<(), StoreError>;

    /// Registered room names in registration order.
    async fn list_rooms(&self) -> Result<Vec<String>, StoreError>;

    async fn room_exists(&self, name: &str) -> Result<bool, StoreError>;

    async fn get_room_address(&self, name: &str) -> Result<Option<RoomAddress>, StoreError>;

    /// Fails with `NameTaken` or `AddressTaken` instead of overwriting.
    async fn put_room(&self, name: &str, addr: &RoomAddress) -> Result<(), StoreError>;
}

/// Open a store from a `--database` value: `memory` or a SQLite URL.
pub async fn open(url: &str) -> Result<Arc<dyn Store>, StoreError> {
    if url == "memory" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(SqliteStore::connect(url).await?))
    }
}

// ── In-memory store ─────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, String>,
    rooms: Vec<(String, RoomAddress)>,
}

/// Process-local store. Only meaningful when rooms run in-process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_password(&self, username: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.users.get(username).cloned())
    }

    async fn put_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.users.contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }
        inner
            .users
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rooms.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn room_exists(&self, name: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rooms.iter().any(|(n, _)| n == name))
    }

    async fn get_room_address(&self, name: &str) -> Result<Option<RoomAddress>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, addr)| addr.clone()))
    }

    async fn put_room(&self, name: &str, addr: &RoomAddress) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.rooms.iter().any(|(n, _)| n == name) {
            return Err(StoreError::NameTaken(name.to_string()));
        }
        if inner.rooms.iter().any(|(_, a)| a == addr) {
            return Err(StoreError::AddressTaken(addr.clone()));
        }
        inner.rooms.push((name.to_string(), addr.clone()));
        Ok(())
    }
}

// ── SQLite-backed store ─────────────────────────────────────────────

/// SQLite-backed store. Safe to share one database file between the master
/// and its room processes.
pub struct SqliteStore {
    pool: sqlx::SqlitePool,
}

impl SqliteStore {
    /// Connect and create the tables if they don't exist.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::init(&pool).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &sqlx::SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rooms (
                name TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                UNIQUE (host, port)
            )"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Some(db.message().to_string()),
        _ => None,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_password(&self, username: &str) -> Result<Option<String>, StoreError> {
        let password = sqlx::query_scalar::<_, String>("SELECT password FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(password)
    }

    async fn put_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (username, password) VALUES (?, ?)")
            .bind(username)
            .bind(password)
            .execute(&self.pool)
            .await
            .map_err(|e| match is_unique_violation(&e) {
                Some(_) => StoreError::UserExists(username.to_string()),
                None => e.into(),
            })?;
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM rooms ORDER BY rowid ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn room_exists(&self, name: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, String>("SELECT name FROM rooms WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn get_room_address(&self, name: &str) -> Result<Option<RoomAddress>, StoreError> {
        let row = sqlx::query_as::<_, (String, i64)>("SELECT host, port FROM rooms WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((host, port)) => {
                let port = u16::try_from(port)
                    .map_err(|_| StoreError::Invalid(format!("room {name} has port {port}")))?;
                Ok(Some(RoomAddress::new(host, port)))
            }
            None => Ok(None),
        }
    }

    async fn put_room(&self, name: &str, addr: &RoomAddress) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO rooms (name, host, port) VALUES (?, ?, ?)")
            .bind(name)
            .bind(&addr.host)
            .bind(i64::from(addr.port))
            .execute(&self.pool)
            .await
            .map_err(|e| match is_unique_violation(&e) {
                Some(msg) if msg.contains("rooms.name") => StoreError::NameTaken(name.to_string()),
                Some(_) => StoreError::AddressTaken(addr.clone()),
                None => e.into(),
            })?;
        Ok(())
    }
}
