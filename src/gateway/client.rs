use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use super::irc::{IrcMessage, to_event};
use super::{ChatEvent, ChatGateway, GatewayFactory, GatewayResult};
use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::profile::Profile;

/// Longest line accepted from the server.
const MAX_LINE_LENGTH: usize = 8 * 1024;

type LineSink = SplitSink<Framed<TcpStream, LinesCodec>, String>;
type LineStream = SplitStream<Framed<TcpStream, LinesCodec>>;

/// Connection settings for one channel.
#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub host: String,
    pub port: u16,
    pub nick: String,
    /// OAuth token, with or without the `oauth:` prefix
    pub token: Option<String>,
    pub channel: String,
    pub command_prefix: String,
    pub disconnect_timeout: Duration,
}

impl IrcConfig {
    /// Connection settings for `profile` on the configured server.
    pub fn for_profile(profile: &Profile, gateway: &GatewayConfig) -> Self {
        Self {
            host: gateway.host.clone(),
            port: gateway.port,
            nick: profile.nick().to_string(),
            token: profile.credentials.irc_token.clone(),
            channel: profile.channel.clone(),
            command_prefix: gateway.prefix.clone(),
            disconnect_timeout: Duration::from_secs(gateway.disconnect_timeout_secs),
        }
    }
}

/// Factory building an [`IrcGateway`] per profile.
pub fn irc_factory(gateway: GatewayConfig) -> GatewayFactory {
    Box::new(move |profile: &Profile, events| -> Box<dyn ChatGateway> {
        Box::new(IrcGateway::new(
            IrcConfig::for_profile(profile, &gateway),
            events,
        ))
    })
}

/// Line-based IRC client running as its own tokio task.
pub struct IrcGateway {
    config: IrcConfig,
    events: mpsc::Sender<ChatEvent>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl IrcGateway {
    pub fn new(config: IrcConfig, events: mpsc::Sender<ChatEvent>) -> Self {
        Self {
            config,
            events,
            outbound: None,
            shutdown_tx: None,
            task: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn queue(&self, line: String) -> GatewayResult<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(GatewayError::NotConnected)?;
        outbound.send(line).map_err(|_| GatewayError::NotConnected)
    }

    fn login_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(token) = &self.config.token {
            let token = if token.starts_with("oauth:") {
                token.clone()
            } else {
                format!("oauth:{token}")
            };
            lines.push(format!("PASS {token}"));
        }
        lines.push(format!("NICK {}", self.config.nick));
        lines.push("CAP REQ :twitch.tv/tags twitch.tv/commands".to_string());
        lines.push(format!("JOIN #{}", self.config.channel));
        lines
    }
}

#[async_trait]
impl ChatGateway for IrcGateway {
    async fn connect(&mut self) -> GatewayResult<()> {
        if self.is_connected() {
            return Err(GatewayError::AlreadyConnected);
        }

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (mut sink, lines) = framed.split();

        for line in self.login_lines() {
            sink.send(line)
                .await
                .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.outbound = Some(out_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.connected.store(true, Ordering::SeqCst);

        let session = LineSession {
            channel: self.config.channel.clone(),
            nick: self.config.nick.clone(),
            prefix: self.config.command_prefix.clone(),
            events: self.events.clone(),
            connected: self.connected.clone(),
        };
        self.task = Some(tokio::spawn(session.run(sink, lines, out_rx, shutdown_rx)));

        info!(
            host = %self.config.host,
            channel = %self.config.channel,
            "connected to chat"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> GatewayResult<()> {
        let Some(mut task) = self.task.take() else {
            return Err(GatewayError::NotConnected);
        };
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.outbound = None;

        if tokio::time::timeout(self.config.disconnect_timeout, &mut task)
            .await
            .is_err()
        {
            warn!("chat task did not stop in time, aborting it");
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(channel = %self.config.channel, "disconnected from chat");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_message(&self, text: &str) -> GatewayResult<()> {
        self.queue(format!("PRIVMSG #{} :{}", self.config.channel, text))
    }

    async fn send_direct_message(&self, user: &str, text: &str) -> GatewayResult<()> {
        self.queue(format!(
            "PRIVMSG #{} :/w {} {}",
            self.config.channel, user, text
        ))
    }
}

/// State owned by the spawned connection task.
struct LineSession {
    channel: String,
    nick: String,
    prefix: String,
    events: mpsc::Sender<ChatEvent>,
    connected: Arc<AtomicBool>,
}

impl LineSession {
    async fn run(
        self,
        mut sink: LineSink,
        mut lines: LineStream,
        mut outbound: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = sink.send(format!("PART #{}", self.channel)).await;
                    break;
                }

                Some(line) = outbound.recv() => {
                    if sink.send(line).await.is_err() {
                        break;
                    }
                }

                frame = lines.next() => {
                    match frame {
                        Some(Ok(line)) => {
                            if !self.handle_line(&line, &mut sink).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "chat connection error");
                            break;
                        }
                        None => {
                            info!("chat server closed the connection");
                            break;
                        }
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = sink.close().await;
    }

    /// Returns false when the connection should end.
    async fn handle_line(&self, line: &str, sink: &mut LineSink) -> bool {
        let Some(msg) = IrcMessage::parse(line) else {
            return true;
        };
        match msg.command.as_str() {
            "PING" => {
                let payload = msg.trailing().unwrap_or("tmi.twitch.tv");
                return sink.send(format!("PONG :{payload}")).await.is_ok();
            }
            "RECONNECT" => {
                warn!("chat server requested reconnect");
                return false;
            }
            _ => {}
        }
        match to_event(&msg, &self.prefix, &self.nick) {
            Some(event) => {
                debug!(?event, "chat event");
                // Consumer gone means the session is shutting down
                self.events.send(event).await.is_ok()
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn config(port: u16) -> IrcConfig {
        IrcConfig {
            host: "127.0.0.1".into(),
            port,
            nick: "bot".into(),
            token: Some("secret".into()),
            channel: "streamer".into(),
            command_prefix: "!".into(),
            disconnect_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_config_for_profile() {
        let mut profile = Profile::new(1, "Streamer", Some("CrowdBot"), None);
        profile.credentials.irc_token = Some("tok".into());
        let gateway = GatewayConfig {
            prefix: "?".into(),
            ..Default::default()
        };
        let config = IrcConfig::for_profile(&profile, &gateway);
        assert_eq!(config.nick, "crowdbot");
        assert_eq!(config.channel, "streamer");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.command_prefix, "?");
        assert_eq!(config.port, 6667);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (tx, _rx) = mpsc::channel(4);
        let gateway = IrcGateway::new(config(1), tx);
        assert!(matches!(
            gateway.send_message("hi").await,
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let mut gateway = IrcGateway::new(config(1), tx);
        assert!(matches!(
            gateway.disconnect().await,
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_roundtrip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read).lines();

            let mut received = Vec::new();
            for _ in 0..4 {
                received.push(reader.next_line().await.unwrap().unwrap());
            }
            write
                .write_all(b"PING :tmi.twitch.tv\r\n")
                .await
                .unwrap();
            write
                .write_all(b"@mod=0 :viewer!viewer@x PRIVMSG #streamer :!objective\r\n")
                .await
                .unwrap();
            received.push(reader.next_line().await.unwrap().unwrap());
            received.push(reader.next_line().await.unwrap().unwrap());
            received
        });

        let (tx, mut rx) = mpsc::channel(4);
        let mut gateway = IrcGateway::new(config(port), tx);
        gateway.connect().await.unwrap();
        assert!(gateway.is_connected());
        assert!(matches!(
            gateway.connect().await,
            Err(GatewayError::AlreadyConnected)
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ChatEvent::Command {
                user: super::super::ChatUser::new("viewer", false),
                text: "!objective".into()
            }
        );
        gateway.send_message("hello").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received[0], "PASS oauth:secret");
        assert_eq!(received[1], "NICK bot");
        assert_eq!(received[3], "JOIN #streamer");
        assert_eq!(received[4], "PONG :tmi.twitch.tv");
        assert_eq!(received[5], "PRIVMSG #streamer :hello");

        gateway.disconnect().await.unwrap();
        assert!(!gateway.is_connected());
    }
}
