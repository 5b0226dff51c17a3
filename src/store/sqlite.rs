use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Store, StoreResult};
use crate::challenge::{Challenge, Provider};
use crate::errors::StoreError;
use crate::profile::Profile;

const PROFILES: &str = "profiles";
const CHALLENGES: &str = "challenges";

/// Async-safe handle to the state database.
///
/// All access runs on tokio's blocking pool so SQLite I/O never stalls the
/// chat consumer or the console.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StateDb>>,
}

impl DbHandle {
    pub fn new(db: StateDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&StateDb) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")
        .map_err(StoreError::Database)?
    }
}

/// SQLite database holding one JSON document per profile and challenge.
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))
            .map_err(StoreError::Database)?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS challenges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    /// Reserve a row, build the record with its id and store it.
    fn insert<T, F>(&self, table: &str, build: F) -> StoreResult<T>
    where
        T: Serialize,
        F: FnOnce(i64) -> T,
    {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!("INSERT INTO {table} (data) VALUES ('{{}}')"),
            [],
        )?;
        let id = tx.last_insert_rowid();
        let record = build(id);
        tx.execute(
            &format!("UPDATE {table} SET data = ?1 WHERE id = ?2"),
            params![encode(&record)?, id],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn get<T: DeserializeOwned>(&self, table: &str, id: i64) -> StoreResult<Option<T>> {
        let data: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT data FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| decode(&d)).transpose()
    }

    /// Returns false when no row has this id.
    fn update<T: Serialize>(&self, table: &str, id: i64, record: &T) -> StoreResult<bool> {
        let changed = self.conn.execute(
            &format!("UPDATE {table} SET data = ?1, updated_at = datetime('now') WHERE id = ?2"),
            params![encode(record)?, id],
        )?;
        Ok(changed > 0)
    }

    fn list<T: DeserializeOwned>(&self, table: &str) -> StoreResult<Vec<T>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT data FROM {table} ORDER BY id"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(decode(&row?)?);
        }
        Ok(records)
    }

    pub fn create_profile(
        &self,
        channel: &str,
        bot: Option<&str>,
        client_id: Option<String>,
    ) -> StoreResult<Profile> {
        self.insert(PROFILES, |id| Profile::new(id, channel, bot, client_id))
    }

    pub fn get_profile(&self, id: i64) -> StoreResult<Option<Profile>> {
        self.get(PROFILES, id)
    }

    pub fn update_profile(&self, profile: &Profile) -> StoreResult<()> {
        if self.update(PROFILES, profile.id, profile)? {
            Ok(())
        } else {
            Err(StoreError::ProfileNotFound { id: profile.id })
        }
    }

    pub fn list_profiles(&self) -> StoreResult<Vec<Profile>> {
        self.list(PROFILES)
    }

    pub fn create_challenge(&self, provider: Provider, name: &str) -> StoreResult<Challenge> {
        self.insert(CHALLENGES, |id| Challenge::new(id, provider, name))
    }

    pub fn get_challenge(&self, id: i64) -> StoreResult<Option<Challenge>> {
        self.get(CHALLENGES, id)
    }

    pub fn update_challenge(&self, challenge: &Challenge) -> StoreResult<()> {
        if self.update(CHALLENGES, challenge.id, challenge)? {
            Ok(())
        } else {
            Err(StoreError::ChallengeNotFound { id: challenge.id })
        }
    }

    pub fn list_challenges(&self) -> StoreResult<Vec<Challenge>> {
        self.list(CHALLENGES)
    }
}

fn encode<T: Serialize>(record: &T) -> StoreResult<String> {
    serde_json::to_string(record)
        .context("Failed to serialize record")
        .map_err(StoreError::Database)
}

fn decode<T: DeserializeOwned>(data: &str) -> StoreResult<T> {
    serde_json::from_str(data)
        .context("Failed to deserialize record")
        .map_err(StoreError::Database)
}

/// [`Store`] backed by a SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self {
            db: DbHandle::new(StateDb::new(path)?),
        })
    }

    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self {
            db: DbHandle::new(StateDb::new_in_memory()?),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_profile(
        &self,
        channel: &str,
        bot: Option<&str>,
        client_id: Option<String>,
    ) -> StoreResult<Profile> {
        let channel = channel.to_string();
        let bot = bot.map(str::to_string);
        self.db
            .call(move |db| db.create_profile(&channel, bot.as_deref(), client_id))
            .await
    }

    async fn load_profile(&self, id: i64) -> StoreResult<Profile> {
        self.db
            .call(move |db| db.get_profile(id))
            .await?
            .ok_or(StoreError::ProfileNotFound { id })
    }

    async fn save_profile(&self, profile: &Profile) -> StoreResult<()> {
        let profile = profile.clone();
        self.db.call(move |db| db.update_profile(&profile)).await
    }

    async fn list_profiles(&self) -> StoreResult<Vec<Profile>> {
        self.db.call(|db| db.list_profiles()).await
    }

    async fn create_challenge(&self, provider: Provider, name: &str) -> StoreResult<Challenge> {
        let name = name.to_string();
        self.db
            .call(move |db| db.create_challenge(provider, &name))
            .await
    }

    async fn load_challenge(&self, id: i64) -> StoreResult<Challenge> {
        self.db
            .call(move |db| db.get_challenge(id))
            .await?
            .ok_or(StoreError::ChallengeNotFound { id })
    }

    async fn save_challenge(&self, challenge: &Challenge) -> StoreResult<()> {
        let challenge = challenge.clone();
        self.db.call(move |db| db.update_challenge(&challenge)).await
    }

    async fn list_challenges(&self) -> StoreResult<Vec<Challenge>> {
        self.db.call(|db| db.list_challenges()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_and_run_migrations() -> StoreResult<()> {
        let db = StateDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('profiles', 'challenges')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2, "Expected 2 tables to exist");
        Ok(())
    }

    #[test]
    fn test_create_profile_assigns_ids() -> StoreResult<()> {
        let db = StateDb::new_in_memory()?;
        let first = db.create_profile("streamer", Some("bot"), None)?;
        let second = db.create_profile("other", None, None)?;
        assert!(first.id > 0);
        assert_ne!(first.id, second.id);

        let fetched = db.get_profile(first.id)?.expect("profile should exist");
        assert_eq!(fetched.channel, "streamer");
        assert_eq!(fetched.bot.as_deref(), Some("bot"));
        Ok(())
    }

    #[test]
    fn test_update_missing_challenge_is_not_found() -> StoreResult<()> {
        let db = StateDb::new_in_memory()?;
        let ghost = Challenge::new(99, Provider::VirtualBox, "ghost");
        assert!(matches!(
            db.update_challenge(&ghost),
            Err(StoreError::ChallengeNotFound { id: 99 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_roundtrips_challenge_progress() {
        let store = SqliteStore::in_memory().unwrap();
        let mut challenge = store
            .create_challenge(Provider::VirtualBox, "box")
            .await
            .unwrap();
        challenge
            .create_flag("FLAG{a}", 1, 10, None, None)
            .unwrap();
        challenge.validate_submission("alice", "FLAG{a}");
        store.save_challenge(&challenge).await.unwrap();

        let loaded = store.load_challenge(challenge.id).await.unwrap();
        assert_eq!(loaded.level(), 1);
        assert_eq!(loaded.points_for("alice"), 10);
        assert_eq!(store.list_challenges().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_missing_ids() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(matches!(
            store.load_profile(5).await,
            Err(StoreError::ProfileNotFound { id: 5 })
        ));
        assert!(matches!(
            store.load_challenge(6).await,
            Err(StoreError::ChallengeNotFound { id: 6 })
        ));
    }

    #[tokio::test]
    async fn test_store_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let mut profile = store.create_profile("streamer", None, None).await.unwrap();
            profile.discord = Some("https://discord.gg/example".into());
            store.save_profile(&profile).await.unwrap();
            profile.id
        };

        let store = SqliteStore::open(&path).unwrap();
        let profile = store.load_profile(id).await.unwrap();
        assert_eq!(profile.discord.as_deref(), Some("https://discord.gg/example"));
        assert_eq!(store.list_profiles().await.unwrap().len(), 1);
    }
}
