//! Chat event dispatch.
//!
//! Turns a [`ChatEvent`] into zero or more [`Reply`]s. Every collaborator
//! call goes through the public [`Session`] API, so each one takes the
//! session lock on its own and none is held across a reply.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Session, process_event};
use crate::challenge::SubmissionOutcome;
use crate::errors::{ResourceError, SessionError};
use crate::gateway::{ChatEvent, ChatUser};

/// Chat replies are cut to this many characters.
const MAX_REPLY_CHARS: usize = 500;

const NO_CHALLENGE_RUNNING: &str = "There is no challenge running at the moment, please stand by..";
const RESTARTING: &str = "Instance is not running, attempting to restart it...";
const GENERIC_FAILURE: &str = "Something went wrong, please try again later";

const HELP: &str = "Info and rules are listed in the panels below the stream | \
'!type your text' to type text | \
'!execute your command' to execute commands (enter at end of line) | \
'!press keys' to send special key commands | \
'!release' to release stuck modifier keys";

const MOD_HELP: &str = "'!hotseat [username] [seconds]' | \
'!allow username(s)' | \
'!deny username(s)' | \
'!remove username(s)' | \
'!stop [halt] [restore]' stop, forcefully halt or restore the VM | \
'!snap' snapshot the current VM state | \
'!delay [ms] [seconds]' override keypress delay | \
'!hint' reveal the next hint";

const RULES: &str = " | Be respectful of others | No destructive behaviour | \
All rules can be found in the panels below the stream";

/// Something to send back to chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Channel(String),
    Direct { user: String, text: String },
}

impl Reply {
    fn channel(text: impl Into<String>) -> Self {
        Self::Channel(text.into())
    }
}

/// Consume gateway events until the channel closes.
pub fn spawn_event_loop(
    session: Arc<Session>,
    mut events: mpsc::Receiver<ChatEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            process_event(&session, event).await;
        }
        debug!("chat event channel closed");
    })
}

fn truncate(text: String) -> String {
    match text.char_indices().nth(MAX_REPLY_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

/// Human readable duration for hotseat announcements.
fn describe_duration(secs: u64) -> String {
    match secs {
        60 => "minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "second".to_string(),
        s => format!("{s} seconds"),
    }
}

/// A parsed chat command: lowercased name, raw remainder, split arguments.
struct Invocation<'a> {
    name: String,
    rest: &'a str,
    args: Vec<&'a str>,
}

impl<'a> Invocation<'a> {
    fn parse(text: &'a str, prefix: &str) -> Option<Self> {
        let body = text.strip_prefix(prefix)?;
        let (name, rest) = match body.split_once(' ') {
            Some((name, rest)) => (name, rest),
            None => (body, ""),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_lowercase(),
            rest,
            args: rest.split_whitespace().collect(),
        })
    }
}

impl Session {
    /// React to one chat event.
    pub async fn handle_event(&self, event: ChatEvent) -> Vec<Reply> {
        match event {
            ChatEvent::Command { user, text } => self.handle_command(&user, &text).await,
            ChatEvent::Whisper { user, body } => self.handle_whisper(&user, &body).await,
            ChatEvent::RewardRedeemed { user, reward, cost } => {
                self.handle_reward(&user, &reward, cost).await
            }
            ChatEvent::Cheer { user, bits } => {
                info!(%user, bits, "cheer");
                Vec::new()
            }
            ChatEvent::Subscription { user, months, gift } => {
                info!(%user, months, gift, "subscription");
                if gift {
                    return Vec::new();
                }
                let text = if months <= 1 {
                    format!("{user} is a new subscriber. Thank you!")
                } else {
                    format!("{user} has been subscribed for a total of {months} months. Thank you!")
                };
                vec![Reply::Channel(text)]
            }
            ChatEvent::ModerationAction {
                moderator,
                action,
                args,
            } => {
                info!(%moderator, %action, ?args, "moderation action");
                Vec::new()
            }
        }
    }

    async fn handle_command(&self, user: &ChatUser, text: &str) -> Vec<Reply> {
        let Some(cmd) = Invocation::parse(text, &self.settings.command_prefix) else {
            return Vec::new();
        };
        debug!(user = %user.name, command = %cmd.name, "chat command");

        match cmd.name.as_str() {
            "help" => vec![self.help(user, &cmd.args)],
            "objective" | "obj" | "what" => {
                vec![Reply::Channel(self.current_objective().await + RULES)]
            }
            "source" | "github" | "gh" => match &self.settings.source_url {
                Some(url) => vec![Reply::Channel(format!(
                    "The source for this bot is here: {url}"
                ))],
                None => Vec::new(),
            },
            "discord" => match self.profile().await.and_then(|p| p.discord) {
                Some(link) if !link.is_empty() => vec![Reply::Channel(format!(
                    "Discord server for these challenges: {link}"
                ))],
                _ => Vec::new(),
            },
            "type" | "t" => {
                if cmd.args.is_empty() {
                    return Vec::new();
                }
                self.interact(user, async {
                    self.type_text(cmd.rest).await?;
                    Ok::<_, SessionError>(vec![Reply::Channel(truncate(format!(
                        "Typed: '{}'",
                        cmd.rest
                    )))])
                })
                .await
            }
            "execute" | "e" => {
                self.interact(user, async {
                    if cmd.args.is_empty() {
                        let pressed = self.send_keys(&["enter"]).await?;
                        return Ok(vec![Reply::Channel(format!(
                            "Pressed: '{}'",
                            pressed.join(" ")
                        ))]);
                    }
                    self.type_text(cmd.rest).await?;
                    self.send_keys(&["enter"]).await?;
                    Ok::<_, SessionError>(vec![Reply::Channel(truncate(format!(
                        "Executed: '{}'",
                        cmd.rest
                    )))])
                })
                .await
            }
            "press" | "p" => {
                self.interact(user, async {
                    if !cmd.args.is_empty() {
                        let pressed = self.send_keys(&cmd.args).await?;
                        if !pressed.is_empty() {
                            return Ok(vec![Reply::Channel(format!(
                                "Pressed: '{}'",
                                pressed.join(" ")
                            ))]);
                        }
                    }
                    Ok::<_, SessionError>(vec![Reply::Channel(format!(
                        "Special keys: {}",
                        self.special_keys().await?
                    ))])
                })
                .await
            }
            "release" => self.release(user).await,
            "hotseat" | "hs" => self.hotseat_command(user, &cmd.args).await,
            "allow" | "deny" | "remove" => self.user_list_command(user, &cmd).await,
            "stop" => self.stop_command(user, &cmd.args).await,
            "snap" => {
                if !user.is_moderator {
                    return Vec::new();
                }
                match self.snapshot_challenge(&user.name).await {
                    Ok(()) => vec![Reply::channel("Snapshot created!")],
                    Err(
                        SessionError::NoChallengeSelected | SessionError::ResourceNotInitialized,
                    ) => vec![Reply::channel("No system to take snapshot of")],
                    Err(SessionError::Resource(ResourceError::NotRunning)) => {
                        vec![Reply::channel("Instance is not running, start it before taking a snapshot")]
                    }
                    Err(e) => failure("snapshot", e),
                }
            }
            "delay" => self.delay_command(user, &cmd.args).await,
            "hint" => {
                if !user.is_moderator {
                    return Vec::new();
                }
                match self.reveal_hint().await {
                    Ok(text) => vec![Reply::Channel(text)],
                    Err(e) => failure("hint", e),
                }
            }
            _ => Vec::new(),
        }
    }

    fn help(&self, user: &ChatUser, args: &[&str]) -> Reply {
        if user.is_moderator && args.contains(&"mod") {
            return Reply::channel(MOD_HELP);
        }
        if user.is_moderator {
            return Reply::Channel(format!("{HELP} | '!help mod' for moderator commands"));
        }
        Reply::channel(HELP)
    }

    /// Run an input command for `user` if the access rules allow it.
    async fn interact<F>(&self, user: &ChatUser, action: F) -> Vec<Reply>
    where
        F: Future<Output = Result<Vec<Reply>, SessionError>>,
    {
        match self.authorize(user).await {
            Ok(auth) if auth.allowed => {}
            Ok(auth) => return auth.message.map(Reply::Channel).into_iter().collect(),
            Err(e) => return failure("authorize", e),
        }

        match action.await {
            Ok(replies) => replies,
            Err(SessionError::NoChallengeSelected | SessionError::ResourceNotInitialized) => {
                vec![Reply::channel(NO_CHALLENGE_RUNNING)]
            }
            Err(SessionError::Resource(ResourceError::NotRunning)) => {
                if let Err(e) = self.start_challenge(false).await {
                    error!(error = %e, "failed to restart machine");
                }
                vec![Reply::channel(RESTARTING)]
            }
            Err(e) => failure("input", e),
        }
    }

    async fn release(&self, user: &ChatUser) -> Vec<Reply> {
        match self.authorize(user).await {
            Ok(auth) if auth.allowed => {}
            Ok(auth) => return auth.message.map(Reply::Channel).into_iter().collect(),
            Err(e) => return failure("authorize", e),
        }
        match self.release_keys().await {
            Ok(()) => vec![Reply::channel("Released all modifier keys")],
            Err(
                SessionError::NoChallengeSelected
                | SessionError::ResourceNotInitialized
                | SessionError::Resource(ResourceError::NotRunning),
            ) => vec![Reply::channel(NO_CHALLENGE_RUNNING)],
            Err(e) => failure("release", e),
        }
    }

    async fn hotseat_command(&self, user: &ChatUser, args: &[&str]) -> Vec<Reply> {
        if user.is_moderator {
            let seconds = args.get(1).and_then(|s| s.parse().ok());
            self.set_hotseat(args.first().copied(), seconds).await;
        }
        let text = match self.hotseat().await {
            Some(holder) => format!(
                "{holder} is in the hotseat, and is the only one that can interact with the machine"
            ),
            None => "Hotseat is empty, anyone with the permission can interact".to_string(),
        };
        vec![Reply::Channel(text)]
    }

    async fn user_list_command(&self, user: &ChatUser, cmd: &Invocation<'_>) -> Vec<Reply> {
        if !user.is_moderator {
            return Vec::new();
        }
        let (result, failure_text) = match cmd.name.as_str() {
            "allow" => (self.allow_users(&cmd.args).await, "Could not add users to list"),
            "deny" => (self.deny_users(&cmd.args).await, "Could not add users to list"),
            _ => (self.reset_users(&cmd.args).await, "Could not reset users"),
        };
        match result {
            Ok(()) => Vec::new(),
            Err(SessionError::NoProfileSelected) => vec![Reply::channel(failure_text)],
            Err(e) => failure("users", e),
        }
    }

    async fn stop_command(&self, user: &ChatUser, args: &[&str]) -> Vec<Reply> {
        if !user.is_moderator {
            return Vec::new();
        }
        let not_running = |e: &SessionError| {
            matches!(
                e,
                SessionError::NoChallengeSelected | SessionError::ResourceNotInitialized
            )
        };
        match args.first().copied() {
            Some("restore") => match self.restore_challenge().await {
                Ok(()) => vec![Reply::channel("Most recent snapshot has been restored")],
                Err(e) if not_running(&e) => vec![Reply::channel("Could not restore snapshot")],
                Err(e) => failure("restore", e),
            },
            Some("halt") => match self.stop_challenge(false).await {
                Ok(()) => vec![Reply::channel("System is now in 'powered off' state")],
                Err(e) if not_running(&e) => vec![Reply::channel("System is not running")],
                Err(e) => failure("halt", e),
            },
            Some(_) => Vec::new(),
            None => match self.stop_challenge(true).await {
                Ok(()) => vec![Reply::channel("System is now in 'saved' state")],
                Err(e) if not_running(&e) => vec![Reply::channel("System is not running")],
                Err(e) => failure("stop", e),
            },
        }
    }

    async fn delay_command(&self, user: &ChatUser, args: &[&str]) -> Vec<Reply> {
        if !user.is_moderator {
            return Vec::new();
        }
        let result = if args.is_empty() {
            self.press_delay()
                .await
                .map(|delay| format!("Press delay is {delay}ms"))
        } else {
            let parsed: Result<Vec<u64>, _> = args.iter().take(2).map(|a| a.parse()).collect();
            let Ok(values) = parsed else {
                return vec![Reply::channel(
                    "Please provide integer values for delay and expiry",
                )];
            };
            let (delay, expiry) = (values[0], values.get(1).copied());
            self.set_press_delay(delay, expiry).await.map(|()| match expiry {
                Some(secs) => format!("Press delay is now {delay}ms for the next {secs} seconds"),
                None => format!("Press delay is now {delay}ms"),
            })
        };
        match result {
            Ok(text) => vec![Reply::Channel(text)],
            Err(SessionError::NoChallengeSelected | SessionError::ResourceNotInitialized) => {
                vec![Reply::channel(NO_CHALLENGE_RUNNING)]
            }
            Err(e) => failure("delay", e),
        }
    }

    async fn handle_whisper(&self, user: &str, body: &str) -> Vec<Reply> {
        info!(%user, "flag submission");
        let text = match self.capture_flag(user, body).await {
            Ok(SubmissionOutcome::NotFound) => "Flag not recognized",
            Ok(SubmissionOutcome::Captured { .. }) => "Flag has been captured!",
            Ok(SubmissionOutcome::AlreadyCaptured { .. }) => "Flag was already captured",
            Err(SessionError::NoProfileSelected | SessionError::NoChallengeSelected) => {
                NO_CHALLENGE_RUNNING
            }
            Err(e) => {
                error!(error = %e, "flag submission failed");
                GENERIC_FAILURE
            }
        };
        vec![Reply::Direct {
            user: user.to_string(),
            text: text.to_string(),
        }]
    }

    async fn handle_reward(&self, user: &str, reward: &str, cost: i64) -> Vec<Reply> {
        info!(%user, %reward, cost, "reward redeemed");
        let hotseat_reward = self.settings.hotseat_reward.to_lowercase();
        if !hotseat_reward.is_empty() && reward.to_lowercase().contains(&hotseat_reward) {
            if self.hotseat().await.is_some() {
                return vec![Reply::channel(
                    "Sorry! Hotseat is not available at the moment..",
                )];
            }
            let secs = match u64::try_from(cost) {
                Ok(secs) if secs > 0 => secs,
                _ => self.settings.hotseat_reward_secs,
            };
            self.set_hotseat(Some(user), Some(secs)).await;
            return vec![Reply::Channel(format!(
                "{user} is now in the hotseat, and has exclusive control for the next {}",
                describe_duration(secs)
            ))];
        }
        if reward == self.settings.hint_reward {
            return match self.reveal_hint().await {
                Ok(text) => vec![Reply::Channel(text)],
                Err(e) => failure("hint", e),
            };
        }
        debug!(%reward, "unhandled reward");
        Vec::new()
    }
}

fn failure(operation: &str, e: SessionError) -> Vec<Reply> {
    error!(operation, error = %e, kind = ?e.kind(), "chat command failed");
    vec![Reply::channel(GENERIC_FAILURE)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_parse() {
        let cmd = Invocation::parse("!Type  ls -la", "!").unwrap();
        assert_eq!(cmd.name, "type");
        assert_eq!(cmd.rest, " ls -la");
        assert_eq!(cmd.args, vec!["ls", "-la"]);

        let cmd = Invocation::parse("!help", "!").unwrap();
        assert_eq!(cmd.name, "help");
        assert!(cmd.args.is_empty());

        assert!(Invocation::parse("hello", "!").is_none());
        assert!(Invocation::parse("! type", "!").is_none());
    }

    #[test]
    fn test_truncate_counts_chars() {
        let long = "é".repeat(600);
        assert_eq!(truncate(long).chars().count(), MAX_REPLY_CHARS);
        assert_eq!(truncate("short".into()), "short");
    }

    #[test]
    fn test_describe_duration() {
        assert_eq!(describe_duration(300), "5 minutes");
        assert_eq!(describe_duration(60), "minute");
        assert_eq!(describe_duration(45), "45 seconds");
    }
}
