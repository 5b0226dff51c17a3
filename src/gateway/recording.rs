use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ChatGateway, GatewayResult};
use crate::errors::GatewayError;

/// A message the session tried to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Channel(String),
    Direct { user: String, text: String },
}

/// Gateway that keeps everything it is asked to send.
#[derive(Debug, Clone, Default)]
pub struct RecordingGateway {
    connected: bool,
    sent: Arc<Mutex<Vec<Outbound>>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared log of sent messages; stays valid after the gateway is boxed.
    pub fn log(&self) -> Arc<Mutex<Vec<Outbound>>> {
        self.sent.clone()
    }

    fn push(&self, message: Outbound) -> GatewayResult<()> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatGateway for RecordingGateway {
    async fn connect(&mut self) -> GatewayResult<()> {
        if self.connected {
            return Err(GatewayError::AlreadyConnected);
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> GatewayResult<()> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send_message(&self, text: &str) -> GatewayResult<()> {
        self.push(Outbound::Channel(text.to_string()))
    }

    async fn send_direct_message(&self, user: &str, text: &str) -> GatewayResult<()> {
        self.push(Outbound::Direct {
            user: user.to_string(),
            text: text.to_string(),
        })
    }
}
