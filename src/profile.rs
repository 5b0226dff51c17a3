use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::access::UserDirectory;

/// Chat platform credentials. Never interpreted here, only handed to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub irc_token: Option<String>,
}

impl Credentials {
    /// Fill the fields this set lacks from `fallback`.
    pub fn or(&self, fallback: &Credentials) -> Credentials {
        Credentials {
            client_id: self.client_id.clone().or_else(|| fallback.client_id.clone()),
            api_token: self.api_token.clone().or_else(|| fallback.api_token.clone()),
            irc_token: self.irc_token.clone().or_else(|| fallback.irc_token.clone()),
        }
    }
}

/// A chat channel the orchestrator runs on, with its users and selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
    #[serde(default)]
    pub superusers: BTreeSet<String>,
    #[serde(default)]
    pub users: UserDirectory,
    #[serde(default)]
    pub credentials: Credentials,
    /// Currently selected challenge id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<String>,
}

impl Profile {
    pub fn new(id: i64, channel: &str, bot: Option<&str>, client_id: Option<String>) -> Self {
        let channel = channel.to_lowercase();
        let bot = bot.map(str::to_lowercase).filter(|b| *b != channel);

        let mut superusers = BTreeSet::from([channel.clone()]);
        if let Some(bot) = &bot {
            superusers.insert(bot.clone());
        }

        Self {
            id,
            channel,
            bot,
            superusers,
            users: UserDirectory::default(),
            credentials: Credentials {
                client_id,
                ..Default::default()
            },
            challenge: None,
            discord: None,
        }
    }

    /// Nick used on the chat connection: the bot if set, else the channel owner.
    pub fn nick(&self) -> &str {
        self.bot.as_deref().unwrap_or(&self.channel)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bot {
            Some(bot) => write!(f, "{} on {}", bot, self.channel),
            None => f.write_str(&self.channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_fallback_keeps_own_values() {
        let own = Credentials {
            client_id: Some("own".into()),
            ..Default::default()
        };
        let env = Credentials {
            client_id: Some("env".into()),
            api_token: Some("api".into()),
            irc_token: None,
        };
        let merged = own.or(&env);
        assert_eq!(merged.client_id.as_deref(), Some("own"));
        assert_eq!(merged.api_token.as_deref(), Some("api"));
        assert!(merged.irc_token.is_none());
    }

    #[test]
    fn superusers_include_channel_and_distinct_bot() {
        let p = Profile::new(1, "Streamer", Some("HelperBot"), None);
        assert!(p.superusers.contains("streamer"));
        assert!(p.superusers.contains("helperbot"));
        assert_eq!(p.to_string(), "helperbot on streamer");
        assert_eq!(p.nick(), "helperbot");
    }

    #[test]
    fn bot_equal_to_channel_is_ignored() {
        let p = Profile::new(2, "streamer", Some("streamer"), Some("cid".into()));
        assert_eq!(p.bot, None);
        assert_eq!(p.superusers.len(), 1);
        assert_eq!(p.to_string(), "streamer");
        assert_eq!(p.credentials.client_id.as_deref(), Some("cid"));
    }

    #[test]
    fn profile_roundtrips_through_json() {
        let mut p = Profile::new(3, "streamer", None, None);
        p.users.allow(&["viewer"]);
        p.challenge = Some(7);
        let json = serde_json::to_string(&p).unwrap();
        let back: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.challenge, Some(7));
        assert!(back.users.get("viewer").is_some());
    }
}
