//! Operator console.
//!
//! A line-oriented command interface over [`Session`]. [`execute`] handles
//! one line and is what the tests drive; [`run_console`] wires it to an
//! async reader and writer.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::challenge::Provider;
use crate::errors::{ErrorKind, SessionResult};
use crate::session::Session;

pub const PROMPT: &str = "> ";

const HELP: &str = "Commands:
    help - This help text
    profile (create <channel> [bot]|load <id>|list|save|discord [link])
    challenge (create <machine>|select <id>|list)
    flag (add <level> <points> <text>|del <text>|list|points <user>)
    hint (add <level> <cost> <text>|up <level> <id>|down <level> <id>|del <level> <id>|list|reveal)
    objective (add <level> <text>|del <level>|list|set <text>|reset|show)
    hotseat [user [seconds]|clear] - Show or set the hotseat
    allow|deny|reset <user>... - Set interaction policy
    chat (init|connect|disconnect|status) - Chat interaction
    vm (start|stop|halt|snapshot|restore|delay [ms [seconds]]|keys <key>...|type <text>|release)
    status - Show information about the current state
    quit - Release everything and quit";

/// What the console should do after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(String),
    Quit(String),
}

impl Outcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Continue(text) | Self::Quit(text) => text,
        }
    }
}

/// Malformed input, answered with a usage line.
struct Usage(&'static str);

type Parsed<T> = std::result::Result<T, Usage>;

fn number<T: std::str::FromStr>(arg: Option<&&str>, usage: &'static str) -> Parsed<T> {
    arg.and_then(|a| a.parse().ok()).ok_or(Usage(usage))
}

/// Remainder of `line` after skipping `words` whitespace-separated words.
fn tail(line: &str, words: usize) -> &str {
    let mut rest = line.trim_start();
    for _ in 0..words {
        rest = match rest.split_once(char::is_whitespace) {
            Some((_, r)) => r.trim_start(),
            None => "",
        };
    }
    rest.trim_end()
}

fn lines<T: ToString>(items: &[T], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn or_none(text: String, empty: &str) -> String {
    if text.is_empty() { empty.to_string() } else { text }
}

/// Handle one console line.
pub async fn execute(session: &Arc<Session>, line: &str) -> Outcome {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = args.first() else {
        return Outcome::Continue(String::new());
    };
    debug!(%command, "console command");

    if matches!(command, "quit" | "exit") {
        let text = match session.cleanup(false).await {
            Ok(()) => "Quitting. Everything has been saved.".to_string(),
            Err(e) => {
                warn!(error = %e, "cleanup failed");
                format!("Quitting. Cleanup failed: {e}")
            }
        };
        return Outcome::Quit(text);
    }

    let result = match command {
        "help" => Ok(Ok(HELP.to_string())),
        "status" => Ok(Ok(session.status().await)),
        "profile" => profile(session, &args).await,
        "challenge" => challenge(session, &args).await,
        "flag" => flag(session, line, &args).await,
        "hint" => hint(session, line, &args).await,
        "objective" => objective(session, line, &args).await,
        "hotseat" => hotseat(session, &args).await,
        "allow" | "deny" | "reset" => users(session, command, &args[1..]).await,
        "chat" => chat(session, &args).await,
        "vm" => vm(session, line, &args).await,
        _ => Ok(Ok(format!("Unknown command '{command}', type 'help'"))),
    };

    Outcome::Continue(match result {
        Ok(Ok(text)) => text,
        Ok(Err(Usage(usage))) => format!("Usage: {usage}"),
        Err(e) if e.kind() == ErrorKind::Failure => {
            warn!(error = %e, "console command failed");
            format!("Failed: {e}")
        }
        Err(e) => e.to_string(),
    })
}

type Response = SessionResult<Parsed<String>>;

async fn profile(session: &Arc<Session>, args: &[&str]) -> Response {
    const USAGE: &str = "profile (create <channel> [bot]|load <id>|list|save|discord [link])";
    match args.get(1).copied() {
        Some("create") => {
            let Some(channel) = args.get(2) else {
                return Ok(Err(Usage(USAGE)));
            };
            let profile = session
                .create_profile(channel, args.get(3).copied(), None, true)
                .await?;
            Ok(Ok(format!("Created and loaded profile {}: '{}'", profile.id, profile)))
        }
        Some("load") => {
            let id = match number(args.get(2), USAGE) {
                Ok(id) => id,
                Err(usage) => return Ok(Err(usage)),
            };
            let profile = session.load_profile(id, false).await?;
            Ok(Ok(format!("Loaded profile '{profile}'")))
        }
        Some("list") => {
            let profiles = session.list_profiles().await?;
            let rows: Vec<String> = profiles
                .iter()
                .map(|p| format!("{}\t{}", p.id, p))
                .collect();
            Ok(Ok(lines(&rows, "No profiles")))
        }
        Some("save") => {
            session.save_profile().await?;
            Ok(Ok("Profile saved".to_string()))
        }
        Some("discord") => {
            let link = args.get(2).map(|l| l.to_string());
            let text = match &link {
                Some(l) => format!("Discord link set to {l}"),
                None => "Discord link cleared".to_string(),
            };
            session.set_discord(link).await?;
            Ok(Ok(text))
        }
        _ => Ok(Err(Usage(USAGE))),
    }
}

async fn challenge(session: &Arc<Session>, args: &[&str]) -> Response {
    const USAGE: &str = "challenge (create <machine>|select <id>|list)";
    match args.get(1).copied() {
        Some("create") => {
            let Some(name) = args.get(2) else {
                return Ok(Err(Usage(USAGE)));
            };
            let select = session.profile().await.is_some();
            let challenge = session
                .create_challenge(Provider::VirtualBox, name, select)
                .await?;
            let verb = if select { "Created and selected" } else { "Created" };
            Ok(Ok(format!("{verb} challenge {}: '{}'", challenge.id, challenge)))
        }
        Some("select") => {
            let id = match number(args.get(2), USAGE) {
                Ok(id) => id,
                Err(usage) => return Ok(Err(usage)),
            };
            let challenge = session.select_challenge(id).await?;
            Ok(Ok(format!(
                "Selected challenge '{}'\n{}",
                challenge,
                session.challenge_status().await
            )))
        }
        Some("list") => {
            let challenges = session.list_challenges().await?;
            let rows: Vec<String> = challenges
                .iter()
                .map(|c| format!("{}\t{}", c.id, c))
                .collect();
            Ok(Ok(lines(&rows, "No challenges")))
        }
        _ => Ok(Err(Usage(USAGE))),
    }
}

async fn flag(session: &Arc<Session>, line: &str, args: &[&str]) -> Response {
    const USAGE: &str = "flag (add <level> <points> <text>|del <text>|list|points <user>)";
    match args.get(1).copied() {
        Some("add") => {
            let (level, points) = match (number(args.get(2), USAGE), number(args.get(3), USAGE)) {
                (Ok(level), Ok(points)) => (level, points),
                _ => return Ok(Err(Usage(USAGE))),
            };
            let text = tail(line, 4);
            if text.is_empty() {
                return Ok(Err(Usage(USAGE)));
            }
            session.create_flag(text, level, points, None, None).await?;
            Ok(Ok(format!("Added flag '{text}'")))
        }
        Some("del") => {
            let text = tail(line, 2);
            if text.is_empty() {
                return Ok(Err(Usage(USAGE)));
            }
            session.delete_flag(text).await?;
            Ok(Ok(format!("Deleted flag '{text}'")))
        }
        Some("list") => Ok(Ok(or_none(session.list_flags().await?, "No flags"))),
        Some("points") => {
            let Some(user) = args.get(2) else {
                return Ok(Err(Usage(USAGE)));
            };
            let points = session.points_for(&user.to_lowercase()).await?;
            Ok(Ok(format!("{user} has {points} points")))
        }
        _ => Ok(Err(Usage(USAGE))),
    }
}

async fn hint(session: &Arc<Session>, line: &str, args: &[&str]) -> Response {
    const USAGE: &str =
        "hint (add <level> <cost> <text>|up <level> <id>|down <level> <id>|del <level> <id>|list|reveal)";
    let position = || -> Parsed<(u32, usize)> {
        Ok((number(args.get(2), USAGE)?, number(args.get(3), USAGE)?))
    };
    match args.get(1).copied() {
        Some("add") => {
            let (level, cost) = match (number(args.get(2), USAGE), number(args.get(3), USAGE)) {
                (Ok(level), Ok(cost)) => (level, cost),
                _ => return Ok(Err(Usage(USAGE))),
            };
            let text = tail(line, 4);
            if text.is_empty() {
                return Ok(Err(Usage(USAGE)));
            }
            let order = session.create_hint(text, level, cost).await?;
            Ok(Ok(format!("Added hint {order} on level {level}")))
        }
        Some(op @ ("up" | "down" | "del")) => {
            let (level, order) = match position() {
                Ok(p) => p,
                Err(usage) => return Ok(Err(usage)),
            };
            match op {
                "up" => session.move_hint_up(level, order).await?,
                "down" => session.move_hint_down(level, order).await?,
                _ => session.delete_hint(level, order).await?,
            }
            Ok(Ok(or_none(session.list_hints().await?, "No hints")))
        }
        Some("list") => Ok(Ok(or_none(session.list_hints().await?, "No hints"))),
        Some("reveal") => Ok(Ok(session.reveal_hint().await?)),
        _ => Ok(Err(Usage(USAGE))),
    }
}

async fn objective(session: &Arc<Session>, line: &str, args: &[&str]) -> Response {
    const USAGE: &str = "objective (add <level> <text>|del <level>|list|set <text>|reset|show)";
    match args.get(1).copied() {
        Some("add") => {
            let level = match number(args.get(2), USAGE) {
                Ok(level) => level,
                Err(usage) => return Ok(Err(usage)),
            };
            let text = tail(line, 3);
            if text.is_empty() {
                return Ok(Err(Usage(USAGE)));
            }
            session.create_objective(text, level).await?;
            Ok(Ok(format!("Objective set for level {level}")))
        }
        Some("del") => {
            let level = match number(args.get(2), USAGE) {
                Ok(level) => level,
                Err(usage) => return Ok(Err(usage)),
            };
            session.delete_objective(level).await?;
            Ok(Ok(format!("Objective for level {level} deleted")))
        }
        Some("list") => Ok(Ok(or_none(
            session.list_objectives().await?,
            "No objectives",
        ))),
        Some("set") => {
            let text = tail(line, 2);
            if text.is_empty() {
                return Ok(Err(Usage(USAGE)));
            }
            session.set_objective(text).await?;
            Ok(Ok(format!("Objective is now '{text}'")))
        }
        Some("reset") => {
            session.reset_objective().await?;
            Ok(Ok(format!(
                "Objective is now '{}'",
                session.current_objective().await
            )))
        }
        Some("show") => Ok(Ok(session.current_objective().await)),
        _ => Ok(Err(Usage(USAGE))),
    }
}

async fn hotseat(session: &Arc<Session>, args: &[&str]) -> Response {
    const USAGE: &str = "hotseat [user [seconds]|clear]";
    match args.get(1).copied() {
        None => {}
        Some("clear") => session.set_hotseat(None, None).await,
        Some(user) => {
            let seconds = match args.get(2) {
                Some(_) => match number(args.get(2), USAGE) {
                    Ok(secs) => Some(secs),
                    Err(usage) => return Ok(Err(usage)),
                },
                None => None,
            };
            session.set_hotseat(Some(user), seconds).await;
        }
    }
    Ok(Ok(match session.hotseat().await {
        Some(holder) => format!("{holder} is in the hotseat"),
        None => "Hotseat is empty".to_string(),
    }))
}

async fn users(session: &Arc<Session>, command: &str, names: &[&str]) -> Response {
    if names.is_empty() {
        return Ok(Err(Usage("allow|deny|reset <user>...")));
    }
    match command {
        "allow" => session.allow_users(names).await?,
        "deny" => session.deny_users(names).await?,
        _ => session.reset_users(names).await?,
    }
    Ok(Ok(format!("Updated {} user(s)", names.len())))
}

async fn chat(session: &Arc<Session>, args: &[&str]) -> Response {
    const USAGE: &str = "chat (init|connect|disconnect|status)";
    match args.get(1).copied() {
        Some("init") => session.init_gateway().await?,
        Some("connect") => session.connect_gateway().await?,
        Some("disconnect") => session.disconnect_gateway().await?,
        Some("status") => {}
        _ => return Ok(Err(Usage(USAGE))),
    }
    Ok(Ok(session.gateway_status().await))
}

async fn vm(session: &Arc<Session>, line: &str, args: &[&str]) -> Response {
    const USAGE: &str =
        "vm (start|stop|halt|snapshot|restore|delay [ms [seconds]]|keys <key>...|type <text>|release)";
    let text = match args.get(1).copied() {
        Some("start") => {
            session.start_challenge(false).await?;
            session.challenge_status().await
        }
        Some("stop") => {
            session.stop_challenge(true).await?;
            "State has been saved successfully!".to_string()
        }
        Some("halt") => {
            session.stop_challenge(false).await?;
            "Machine has been shut down".to_string()
        }
        Some("snapshot") => {
            session.snapshot_challenge("Interactive mode").await?;
            "Snapshot taken".to_string()
        }
        Some("restore") => {
            session.restore_challenge().await?;
            "Most recent snapshot has been restored".to_string()
        }
        Some("delay") => match (args.get(2), args.get(3)) {
            (None, _) => format!("Press delay is {}ms", session.press_delay().await?),
            (Some(_), secs) => {
                let ms = match number(args.get(2), USAGE) {
                    Ok(ms) => ms,
                    Err(usage) => return Ok(Err(usage)),
                };
                let seconds = match secs {
                    Some(_) => match number(args.get(3), USAGE) {
                        Ok(s) => Some(s),
                        Err(usage) => return Ok(Err(usage)),
                    },
                    None => None,
                };
                session.set_press_delay(ms, seconds).await?;
                format!("Press delay is now {ms}ms")
            }
        },
        Some("keys") if args.len() > 2 => {
            let pressed = session.send_keys(&args[2..]).await?;
            if pressed.is_empty() {
                format!("Special keys: {}", session.special_keys().await?)
            } else {
                format!("Pressed: '{}'", pressed.join(" "))
            }
        }
        Some("type") if !tail(line, 2).is_empty() => {
            session.type_text(tail(line, 2)).await?;
            "Typed".to_string()
        }
        Some("release") => {
            session.release_keys().await?;
            "Released all modifier keys".to_string()
        }
        _ => return Ok(Err(Usage(USAGE))),
    };
    Ok(Ok(text))
}

/// Read commands from `input` until `quit` or end of input.
pub async fn run_console<R, W>(session: Arc<Session>, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = input.lines();
    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let outcome = match reader.next_line().await? {
            Some(line) => execute(&session, &line).await,
            None => execute(&session, "quit").await,
        };
        if !outcome.text().is_empty() {
            output.write_all(outcome.text().as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        if let Outcome::Quit(_) = outcome {
            output.flush().await?;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChatGateway, RecordingGateway};
    use crate::profile::Profile;
    use crate::resource::SimulatedDriver;
    use crate::session::SessionSettings;
    use crate::store::SqliteStore;

    fn session() -> Arc<Session> {
        let driver = Arc::new(SimulatedDriver::with_machines(&["box"]));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        Arc::new(Session::new(
            store,
            driver,
            Box::new(|_: &Profile, _| -> Box<dyn ChatGateway> {
                Box::new(RecordingGateway::new())
            }),
            SessionSettings::default(),
        ))
    }

    async fn run(session: &Arc<Session>, line: &str) -> String {
        execute(session, line).await.text().to_string()
    }

    #[test]
    fn test_tail_skips_words() {
        assert_eq!(tail("flag add 1 10 FLAG{a b}", 4), "FLAG{a b}");
        assert_eq!(tail("  objective set   Get root  ", 2), "Get root");
        assert_eq!(tail("flag del", 2), "");
    }

    #[tokio::test]
    async fn test_profile_and_challenge_flow() {
        let s = session();
        assert_eq!(run(&s, "status").await, "Profile has not been loaded");
        assert_eq!(
            run(&s, "profile create Streamer").await,
            "Created and loaded profile 1: 'streamer'"
        );
        assert_eq!(
            run(&s, "challenge create box").await,
            "Created and selected challenge 1: 'box on virtualbox'"
        );
        assert!(run(&s, "status").await.contains("Challenge 'box' is not running"));
        assert_eq!(run(&s, "profile list").await, "1\tstreamer");
        assert_eq!(run(&s, "challenge list").await, "1\tbox on virtualbox");
    }

    #[tokio::test]
    async fn test_usage_and_errors() {
        let s = session();
        assert_eq!(
            run(&s, "profile load abc").await,
            "Usage: profile (create <channel> [bot]|load <id>|list|save|discord [link])"
        );
        assert_eq!(run(&s, "profile load 5").await, "Profile 5 not found");
        assert_eq!(run(&s, "flag list").await, "No challenge has been loaded");
        assert!(run(&s, "bogus").await.starts_with("Unknown command"));
        assert_eq!(run(&s, "").await, "");
    }

    #[tokio::test]
    async fn test_challenge_editing() {
        let s = session();
        run(&s, "profile create streamer").await;
        run(&s, "challenge create box").await;

        assert_eq!(
            run(&s, "flag add 1 10 FLAG{first one}").await,
            "Added flag 'FLAG{first one}'"
        );
        assert_eq!(
            run(&s, "flag add 1 10 FLAG{first one}").await,
            "Flag 'FLAG{first one}' already exists"
        );
        assert!(run(&s, "flag list").await.contains("FLAG{first one}"));

        assert_eq!(run(&s, "hint add 0 0 look around").await, "Added hint 0 on level 0");
        run(&s, "hint add 0 5 check cron").await;
        let listing = run(&s, "hint up 0 1").await;
        assert!(listing.find("check cron").unwrap() < listing.find("look around").unwrap());
        assert_eq!(
            run(&s, "hint up 0 0").await,
            "Hint 0 on level 0 can not be moved up"
        );
        assert_eq!(run(&s, "hint reveal").await, "check cron");

        assert_eq!(
            run(&s, "objective add 0 Get a foothold").await,
            "Objective set for level 0"
        );
        assert_eq!(run(&s, "objective show").await, "Get a foothold");
        run(&s, "objective set Wait for it").await;
        assert_eq!(run(&s, "objective show").await, "Wait for it");
        assert_eq!(
            run(&s, "objective reset").await,
            "Objective is now 'Get a foothold'"
        );
    }

    #[tokio::test]
    async fn test_vm_and_access_commands() {
        let s = session();
        run(&s, "profile create streamer").await;
        run(&s, "challenge create box").await;

        assert_eq!(run(&s, "vm start").await, "Challenge 'box' is running");
        assert_eq!(run(&s, "vm keys ctrl c").await, "Pressed: 'CTRL c'");
        assert_eq!(run(&s, "vm delay 40 10").await, "Press delay is now 40ms");
        assert_eq!(run(&s, "vm delay").await, "Press delay is 40ms");
        assert_eq!(run(&s, "vm snapshot").await, "Snapshot taken");
        assert_eq!(run(&s, "vm halt").await, "Machine has been shut down");
        assert_eq!(run(&s, "vm type ls").await, "Machine is not running");

        assert_eq!(run(&s, "hotseat alice 60").await, "alice is in the hotseat");
        assert_eq!(run(&s, "hotseat clear").await, "Hotseat is empty");
        assert_eq!(run(&s, "deny @Troll bob").await, "Updated 2 user(s)");
        assert!(run(&s, "allow").await.starts_with("Usage:"));
    }

    #[tokio::test]
    async fn test_chat_commands() {
        let s = session();
        assert_eq!(run(&s, "chat init").await, "No profile has been loaded");
        run(&s, "profile create streamer").await;
        assert_eq!(run(&s, "chat status").await, "Chatbot is not initialized");
        assert_eq!(run(&s, "chat init").await, "Chatbot is initialized");
        assert_eq!(
            run(&s, "chat connect").await,
            "Chatbot is initialized and connected"
        );
        assert_eq!(run(&s, "chat disconnect").await, "Chatbot is initialized");
    }

    #[tokio::test]
    async fn test_run_console_until_eof() {
        let s = session();
        let input = b"profile create streamer\nstatus\n" as &[u8];
        let mut output = Vec::new();
        run_console(s.clone(), input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Created and loaded profile"));
        assert!(text.contains("Profile: 'streamer'"));
        assert!(text.contains("Quitting"));
        assert_eq!(s.status().await, "Profile has not been loaded");
    }
}
