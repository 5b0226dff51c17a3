//! IRC line parsing (IRCv3 tags) and mapping to [`ChatEvent`]s.

use std::collections::HashMap;

use super::{ChatEvent, ChatUser};

/// One parsed IRC protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcMessage {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse `[@tags] [:prefix] COMMAND [params] [:trailing]`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let mut msg = IrcMessage::default();

        if let Some(stripped) = rest.strip_prefix('@') {
            let (tags, tail) = stripped.split_once(' ')?;
            msg.tags = parse_tags(tags);
            rest = tail.trim_start();
        }

        if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, tail) = stripped.split_once(' ')?;
            msg.prefix = Some(prefix.to_string());
            rest = tail.trim_start();
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }
        msg.command = command.to_uppercase();

        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                msg.params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    if !param.is_empty() {
                        msg.params.push(param.to_string());
                    }
                    rest = tail;
                }
                None => {
                    msg.params.push(rest.to_string());
                    break;
                }
            }
        }
        Some(msg)
    }

    /// Nick part of `nick!user@host`.
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    fn is_moderator(&self) -> bool {
        if self.tag("mod") == Some("1") {
            return true;
        }
        self.tag("badges").is_some_and(|badges| {
            badges
                .split(',')
                .any(|b| b.starts_with("broadcaster/") || b.starts_with("moderator/"))
        })
    }

    fn tag_number<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.tag(key)?.parse().ok()
    }
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter(|t| !t.is_empty())
        .map(|tag| match tag.split_once('=') {
            Some((k, v)) => (k.to_string(), unescape_tag(v)),
            None => (tag.to_string(), String::new()),
        })
        .collect()
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(':') => out.push(';'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Map a protocol line to an event. `own_nick` filters the bot's own lines.
pub fn to_event(msg: &IrcMessage, command_prefix: &str, own_nick: &str) -> Option<ChatEvent> {
    match msg.command.as_str() {
        "PRIVMSG" => privmsg_event(msg, command_prefix, own_nick),
        "WHISPER" => {
            let user = msg.nick()?.to_lowercase();
            if user.eq_ignore_ascii_case(own_nick) {
                return None;
            }
            Some(ChatEvent::Whisper {
                user,
                body: msg.trailing()?.to_string(),
            })
        }
        "USERNOTICE" => usernotice_event(msg),
        "CLEARCHAT" => {
            let channel = msg.params.first()?.trim_start_matches('#').to_string();
            let target = msg.params.get(1)?.clone();
            let (action, mut args) = match msg.tag("ban-duration") {
                Some(secs) => ("timeout", vec![target, secs.to_string()]),
                None => ("ban", vec![target]),
            };
            if let Some(reason) = msg.tag("ban-reason") {
                args.push(reason.to_string());
            }
            Some(ChatEvent::ModerationAction {
                moderator: channel,
                action: action.to_string(),
                args,
            })
        }
        _ => None,
    }
}

fn privmsg_event(msg: &IrcMessage, command_prefix: &str, own_nick: &str) -> Option<ChatEvent> {
    let login = msg.nick()?.to_lowercase();
    if login.eq_ignore_ascii_case(own_nick) {
        return None;
    }
    let text = msg.trailing()?;
    let display = msg.tag("display-name").unwrap_or(login.as_str()).to_string();

    if let Some(bits) = msg.tag_number::<u64>("bits") {
        return Some(ChatEvent::Cheer {
            user: display,
            bits,
        });
    }
    if let Some(reward) = msg.tag("custom-reward-id") {
        return Some(ChatEvent::RewardRedeemed {
            user: display,
            reward: reward.to_string(),
            cost: 0,
        });
    }
    if text.starts_with(command_prefix) {
        return Some(ChatEvent::Command {
            user: ChatUser::new(&login, msg.is_moderator()),
            text: text.to_string(),
        });
    }
    None
}

fn usernotice_event(msg: &IrcMessage) -> Option<ChatEvent> {
    let display = msg
        .tag("display-name")
        .or_else(|| msg.tag("login"))?
        .to_string();
    match msg.tag("msg-id")? {
        "sub" | "resub" => Some(ChatEvent::Subscription {
            user: display,
            months: msg.tag_number("msg-param-cumulative-months").unwrap_or(1),
            gift: false,
        }),
        "subgift" | "anonsubgift" => Some(ChatEvent::Subscription {
            user: msg
                .tag("msg-param-recipient-display-name")
                .or_else(|| msg.tag("msg-param-recipient-user-name"))?
                .to_string(),
            months: msg.tag_number("msg-param-months").unwrap_or(1),
            gift: true,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        let msg = IrcMessage::parse("PING :tmi.twitch.tv").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["tmi.twitch.tv"]);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn test_parse_tags_prefix_and_trailing() {
        let line = "@badges=moderator/1;display-name=Alice;mod=1 :alice!alice@alice.tmi.twitch.tv PRIVMSG #chan :!type ls -la\r\n";
        let msg = IrcMessage::parse(line).unwrap();
        assert_eq!(msg.tag("display-name"), Some("Alice"));
        assert_eq!(msg.nick(), Some("alice"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "!type ls -la"]);
    }

    #[test]
    fn test_tag_unescaping() {
        let msg = IrcMessage::parse("@system-msg=5\\sgift\\ssubs\\:\\\\ok :tmi USERNOTICE #c").unwrap();
        assert_eq!(msg.tag("system-msg"), Some("5 gift subs;\\ok"));
    }

    #[test]
    fn test_command_event_carries_moderator_flag() {
        let line = "@badges=broadcaster/1 :streamer!streamer@x PRIVMSG #streamer :!stop halt";
        let event = to_event(&IrcMessage::parse(line).unwrap(), "!", "bot").unwrap();
        assert_eq!(
            event,
            ChatEvent::Command {
                user: ChatUser::new("streamer", true),
                text: "!stop halt".into()
            }
        );
    }

    #[test]
    fn test_plain_chat_and_own_lines_are_ignored() {
        let plain = IrcMessage::parse(":viewer!viewer@x PRIVMSG #c :hello there").unwrap();
        assert!(to_event(&plain, "!", "bot").is_none());
        let own = IrcMessage::parse(":bot!bot@x PRIVMSG #c :!help").unwrap();
        assert!(to_event(&own, "!", "bot").is_none());
    }

    #[test]
    fn test_whisper_event() {
        let line = "@display-name=Eve :eve!eve@x WHISPER bot :FLAG{secret}";
        let event = to_event(&IrcMessage::parse(line).unwrap(), "!", "bot").unwrap();
        assert_eq!(
            event,
            ChatEvent::Whisper {
                user: "eve".into(),
                body: "FLAG{secret}".into()
            }
        );
    }

    #[test]
    fn test_cheer_and_reward_events() {
        let cheer = "@bits=100;display-name=Bob :bob!bob@x PRIVMSG #c :cheer100 nice";
        assert_eq!(
            to_event(&IrcMessage::parse(cheer).unwrap(), "!", "bot"),
            Some(ChatEvent::Cheer {
                user: "Bob".into(),
                bits: 100
            })
        );

        let reward = "@custom-reward-id=hotseat;display-name=Bob :bob!bob@x PRIVMSG #c :me please";
        assert_eq!(
            to_event(&IrcMessage::parse(reward).unwrap(), "!", "bot"),
            Some(ChatEvent::RewardRedeemed {
                user: "Bob".into(),
                reward: "hotseat".into(),
                cost: 0
            })
        );
    }

    #[test]
    fn test_subscription_events() {
        let resub = "@msg-id=resub;display-name=Carol;msg-param-cumulative-months=7 :tmi USERNOTICE #c :great stream";
        assert_eq!(
            to_event(&IrcMessage::parse(resub).unwrap(), "!", "bot"),
            Some(ChatEvent::Subscription {
                user: "Carol".into(),
                months: 7,
                gift: false
            })
        );

        let gift = "@msg-id=subgift;display-name=Carol;msg-param-recipient-display-name=Dan;msg-param-months=1 :tmi USERNOTICE #c";
        assert_eq!(
            to_event(&IrcMessage::parse(gift).unwrap(), "!", "bot"),
            Some(ChatEvent::Subscription {
                user: "Dan".into(),
                months: 1,
                gift: true
            })
        );

        let raid = "@msg-id=raid;display-name=Carol :tmi USERNOTICE #c";
        assert!(to_event(&IrcMessage::parse(raid).unwrap(), "!", "bot").is_none());
    }

    #[test]
    fn test_clearchat_is_moderation() {
        let line = "@ban-duration=600 :tmi CLEARCHAT #chan :spammer";
        assert_eq!(
            to_event(&IrcMessage::parse(line).unwrap(), "!", "bot"),
            Some(ChatEvent::ModerationAction {
                moderator: "chan".into(),
                action: "timeout".into(),
                args: vec!["spammer".into(), "600".into()]
            })
        );
    }
}
