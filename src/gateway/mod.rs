//! Chat platform connection.
//!
//! A [`ChatGateway`] sends messages out and pushes inbound [`ChatEvent`]s to
//! an mpsc channel consumed by the session.

pub mod client;
pub mod irc;
pub mod recording;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::GatewayError;
use crate::profile::Profile;

pub use client::{IrcConfig, IrcGateway, irc_factory};
pub use recording::{Outbound, RecordingGateway};

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Author of a chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub name: String,
    pub is_moderator: bool,
}

impl ChatUser {
    pub fn new(name: &str, is_moderator: bool) -> Self {
        Self {
            name: name.to_lowercase(),
            is_moderator,
        }
    }
}

/// Something that happened on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A prefixed chat line, e.g. `!type ls -la`
    Command { user: ChatUser, text: String },
    /// A private message to the bot
    Whisper { user: String, body: String },
    RewardRedeemed {
        user: String,
        reward: String,
        cost: i64,
    },
    Cheer { user: String, bits: u64 },
    Subscription {
        user: String,
        months: u32,
        gift: bool,
    },
    ModerationAction {
        moderator: String,
        action: String,
        args: Vec<String>,
    },
}

/// Abstraction over a chat platform connection.
/// Real implementation: `IrcGateway`. Test double: `RecordingGateway`.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn connect(&mut self) -> GatewayResult<()>;

    async fn disconnect(&mut self) -> GatewayResult<()>;

    fn is_connected(&self) -> bool;

    async fn send_message(&self, text: &str) -> GatewayResult<()>;

    async fn send_direct_message(&self, user: &str, text: &str) -> GatewayResult<()>;
}

/// Builds a gateway for a profile, wired to the session's event channel.
pub type GatewayFactory =
    Box<dyn Fn(&Profile, mpsc::Sender<ChatEvent>) -> Box<dyn ChatGateway> + Send + Sync>;
