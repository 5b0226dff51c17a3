//! Persistence for profiles and challenges.
//!
//! The session only talks to [`Store`]. [`SqliteStore`] is the shipped
//! implementation; tests use it with an in-memory database.

mod sqlite;

use async_trait::async_trait;

use crate::challenge::{Challenge, Provider};
use crate::errors::StoreError;
use crate::profile::Profile;

pub use sqlite::{DbHandle, SqliteStore, StateDb};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Abstraction over profile/challenge persistence.
/// Real implementation: `SqliteStore`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_profile(
        &self,
        channel: &str,
        bot: Option<&str>,
        client_id: Option<String>,
    ) -> StoreResult<Profile>;

    async fn load_profile(&self, id: i64) -> StoreResult<Profile>;

    async fn save_profile(&self, profile: &Profile) -> StoreResult<()>;

    async fn list_profiles(&self) -> StoreResult<Vec<Profile>>;

    async fn create_challenge(&self, provider: Provider, name: &str) -> StoreResult<Challenge>;

    async fn load_challenge(&self, id: i64) -> StoreResult<Challenge>;

    async fn save_challenge(&self, challenge: &Challenge) -> StoreResult<()>;

    async fn list_challenges(&self) -> StoreResult<Vec<Challenge>>;
}
