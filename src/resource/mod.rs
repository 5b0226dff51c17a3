//! Lifecycle of the challenge machine.
//!
//! [`RemoteResource`] enforces the run-state rules and bounds every driver
//! call with a timeout. The physical work is done by a [`MachineDriver`].

pub mod keys;
pub mod simulated;
pub mod vboxmanage;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::access::expiry_after;
use crate::errors::ResourceError;
pub use keys::{KeyChord, parse_keys, sanitize_text, special_keys};
pub use simulated::SimulatedDriver;
pub use vboxmanage::VBoxManageDriver;

type Result<T> = std::result::Result<T, ResourceError>;

/// Observable state of the selected challenge's machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    Stopped,
    Running,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Stopped => "stopped",
            Self::Running => "running",
        };
        f.write_str(s)
    }
}

/// Abstraction over a virtualization backend.
/// Real implementation: `VBoxManageDriver`. Test double: `SimulatedDriver`.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    /// Whether a machine with this name exists.
    async fn locate(&self, name: &str) -> anyhow::Result<bool>;

    async fn is_running(&self, name: &str) -> anyhow::Result<bool>;

    async fn launch(&self, name: &str) -> anyhow::Result<()>;

    async fn save_state(&self, name: &str) -> anyhow::Result<()>;

    async fn power_down(&self, name: &str) -> anyhow::Result<()>;

    async fn take_snapshot(&self, name: &str, snapshot: &str, description: &str)
    -> anyhow::Result<()>;

    /// Revert to the current snapshot.
    async fn restore_snapshot(&self, name: &str) -> anyhow::Result<()>;

    async fn put_text(&self, name: &str, text: &str, press_delay_ms: u64) -> anyhow::Result<()>;

    async fn put_keys(&self, name: &str, chord: &KeyChord) -> anyhow::Result<()>;

    /// Release every modifier that may be stuck down.
    async fn release_keys(&self, name: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct DelayOverride {
    ms: u64,
    expires_at: Option<DateTime<Utc>>,
}

/// Handle to one machine, created when a challenge is initialized.
pub struct RemoteResource {
    name: String,
    driver: Arc<dyn MachineDriver>,
    timeout: Duration,
    default_delay_ms: u64,
    delay: Option<DelayOverride>,
}

impl RemoteResource {
    /// Bind to the machine called `name`. Fails with `NotFound` when the
    /// driver does not know it.
    pub async fn initialize(
        driver: Arc<dyn MachineDriver>,
        name: &str,
        timeout: Duration,
        default_delay_ms: u64,
    ) -> Result<Self> {
        let resource = Self {
            name: name.to_string(),
            driver,
            timeout,
            default_delay_ms,
            delay: None,
        };
        let found = resource
            .bounded("locate", resource.driver.locate(&resource.name))
            .await?;
        if !found {
            return Err(ResourceError::NotFound {
                name: name.to_string(),
            });
        }
        info!(machine = %resource.name, "machine initialized");
        Ok(resource)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ResourceError::Driver(e)),
            Err(_) => Err(ResourceError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub async fn is_running(&self) -> Result<bool> {
        self.bounded("is_running", self.driver.is_running(&self.name))
            .await
    }

    pub async fn run_state(&self) -> Result<RunState> {
        Ok(if self.is_running().await? {
            RunState::Running
        } else {
            RunState::Stopped
        })
    }

    async fn require_running(&self) -> Result<()> {
        if self.is_running().await? {
            Ok(())
        } else {
            Err(ResourceError::NotRunning)
        }
    }

    async fn require_stopped(&self) -> Result<()> {
        if self.is_running().await? {
            Err(ResourceError::AlreadyRunning)
        } else {
            Ok(())
        }
    }

    pub async fn launch(&self) -> Result<()> {
        self.require_stopped().await?;
        self.bounded("launch", self.driver.launch(&self.name)).await?;
        info!(machine = %self.name, "machine launched");
        Ok(())
    }

    /// Stop the machine, saving its state or powering it off.
    pub async fn shut_down(&self, save: bool) -> Result<()> {
        self.require_running().await?;
        if save {
            self.bounded("save_state", self.driver.save_state(&self.name))
                .await?;
        } else {
            self.bounded("power_down", self.driver.power_down(&self.name))
                .await?;
        }
        info!(machine = %self.name, save, "machine stopped");
        Ok(())
    }

    /// Revert to the current snapshot. Only allowed while stopped.
    pub async fn restore(&self) -> Result<()> {
        self.require_stopped().await?;
        self.bounded("restore_snapshot", self.driver.restore_snapshot(&self.name))
            .await?;
        info!(machine = %self.name, "snapshot restored");
        Ok(())
    }

    /// Take a snapshot of the running machine, attributed to `username`.
    pub async fn snapshot(&self, username: &str) -> Result<()> {
        self.require_running().await?;
        let snapshot = Utc::now().timestamp().to_string();
        let description = format!("Taken by {username}");
        self.bounded(
            "take_snapshot",
            self.driver
                .take_snapshot(&self.name, &snapshot, &description),
        )
        .await?;
        info!(machine = %self.name, %snapshot, %username, "snapshot taken");
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.require_running().await?;
        let text = sanitize_text(text);
        let delay = self.press_delay();
        debug!(%text, delay, "typing");
        self.bounded("put_text", self.driver.put_text(&self.name, &text, delay))
            .await
    }

    /// Press a chord. Returns the names actually sent, empty if none parsed.
    pub async fn send_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<String>> {
        self.require_running().await?;
        let chord = parse_keys(keys);
        if chord.is_empty() {
            debug!("no keys to press");
            return Ok(Vec::new());
        }
        self.bounded("put_keys", self.driver.put_keys(&self.name, &chord))
            .await?;
        debug!(hold = ?chord.hold, press = ?chord.press, "keys sent");
        Ok(chord.names())
    }

    pub async fn release_modifiers(&self) -> Result<()> {
        self.require_running().await?;
        self.bounded("release_keys", self.driver.release_keys(&self.name))
            .await
    }

    pub fn special_keys(&self) -> String {
        special_keys()
    }

    pub fn press_delay(&self) -> u64 {
        self.press_delay_at(Utc::now())
    }

    /// Active press delay in ms. An expired override reads as the default.
    pub fn press_delay_at(&self, now: DateTime<Utc>) -> u64 {
        match self.delay {
            Some(DelayOverride { ms, expires_at }) if expires_at.is_none_or(|e| e > now) => ms,
            _ => self.default_delay_ms,
        }
    }

    pub fn set_press_delay(&mut self, ms: u64, seconds: Option<u64>) {
        self.set_press_delay_at(ms, seconds, Utc::now());
    }

    pub fn set_press_delay_at(&mut self, ms: u64, seconds: Option<u64>, now: DateTime<Utc>) {
        let expires_at = seconds
            .filter(|s| *s > 0)
            .and_then(|s| expiry_after(now, s));
        self.delay = Some(DelayOverride { ms, expires_at });
        info!(ms, ?seconds, "press delay changed");
    }

    /// Save the machine if it is running. Used before dropping the handle.
    pub async fn cleanup(&self) -> Result<()> {
        match self.shut_down(true).await {
            Ok(()) | Err(ResourceError::NotRunning) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Display for RemoteResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on VirtualBox", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn resource(driver: &Arc<SimulatedDriver>) -> RemoteResource {
        RemoteResource::initialize(driver.clone(), "box", Duration::from_secs(5), 25)
            .await
            .unwrap()
    }

    fn driver() -> Arc<SimulatedDriver> {
        Arc::new(SimulatedDriver::with_machines(&["box"]))
    }

    #[tokio::test]
    async fn test_unknown_machine_is_not_found() {
        let driver = driver();
        let err = RemoteResource::initialize(driver, "ghost", Duration::from_secs(5), 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ResourceError::NotFound { name } if name == "ghost"));
    }

    #[tokio::test]
    async fn test_launch_once_then_already_running() {
        let driver = driver();
        let r = resource(&driver).await;
        assert_eq!(r.run_state().await.unwrap(), RunState::Stopped);
        r.launch().await.unwrap();
        assert_eq!(r.run_state().await.unwrap(), RunState::Running);
        assert!(matches!(
            r.launch().await,
            Err(ResourceError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_input_requires_running() {
        let driver = driver();
        let r = resource(&driver).await;
        assert!(matches!(
            r.send_keys(&["enter"]).await,
            Err(ResourceError::NotRunning)
        ));
        assert!(matches!(
            r.type_text("ls").await,
            Err(ResourceError::NotRunning)
        ));
        assert!(matches!(
            r.release_modifiers().await,
            Err(ResourceError::NotRunning)
        ));
        assert!(matches!(
            r.shut_down(true).await,
            Err(ResourceError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_shut_down_paths() {
        let driver = driver();
        let r = resource(&driver).await;
        r.launch().await.unwrap();
        r.shut_down(true).await.unwrap();
        assert_eq!(driver.machine("box").unwrap().saves, 1);

        r.launch().await.unwrap();
        r.shut_down(false).await.unwrap();
        assert_eq!(driver.machine("box").unwrap().power_downs, 1);
        assert_eq!(r.run_state().await.unwrap(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_restore_rejected_while_running() {
        let driver = driver();
        let r = resource(&driver).await;
        r.launch().await.unwrap();
        assert!(matches!(
            r.restore().await,
            Err(ResourceError::AlreadyRunning)
        ));
        r.shut_down(false).await.unwrap();
        r.restore().await.unwrap();
        assert_eq!(driver.machine("box").unwrap().restores, 1);
    }

    #[tokio::test]
    async fn test_send_keys_reports_names() {
        let driver = driver();
        let r = resource(&driver).await;
        r.launch().await.unwrap();
        let sent = r.send_keys(&["ctrl", "c"]).await.unwrap();
        assert_eq!(sent, vec!["CTRL", "c"]);
        assert!(r.send_keys(&["nonsense"]).await.unwrap().is_empty());
        assert_eq!(driver.machine("box").unwrap().chords.len(), 1);
    }

    #[tokio::test]
    async fn test_type_text_is_sanitized_and_uses_delay() {
        let driver = driver();
        let r = resource(&driver).await;
        r.launch().await.unwrap();
        r.type_text("echo 5€").await.unwrap();
        let machine = driver.machine("box").unwrap();
        assert_eq!(machine.typed, vec![("echo 5".to_string(), 25)]);
    }

    #[tokio::test]
    async fn test_snapshot_records_author() {
        let driver = driver();
        let r = resource(&driver).await;
        assert!(matches!(
            r.snapshot("mod").await,
            Err(ResourceError::NotRunning)
        ));
        assert!(driver.machine("box").unwrap().snapshots.is_empty());

        r.launch().await.unwrap();
        r.snapshot("mod").await.unwrap();
        let machine = driver.machine("box").unwrap();
        assert_eq!(machine.snapshots.len(), 1);
        assert_eq!(machine.snapshots[0].1, "Taken by mod");
    }

    #[tokio::test]
    async fn test_press_delay_override_expires() {
        let driver = driver();
        let mut r = resource(&driver).await;
        let now = Utc::now();
        assert_eq!(r.press_delay_at(now), 25);

        r.set_press_delay_at(200, Some(10), now);
        assert_eq!(r.press_delay_at(now + chrono::Duration::seconds(9)), 200);
        assert_eq!(r.press_delay_at(now + chrono::Duration::seconds(10)), 25);

        r.set_press_delay_at(300, None, now);
        assert_eq!(r.press_delay_at(now + chrono::Duration::days(1)), 300);
    }

    #[tokio::test]
    async fn test_huge_press_delay_duration_does_not_expire() {
        let driver = driver();
        let mut r = resource(&driver).await;
        r.set_press_delay(5, Some(10_000_000_000_000));
        assert_eq!(r.press_delay(), 5);
        r.set_press_delay(7, Some(u64::MAX));
        assert_eq!(r.press_delay_at(Utc::now() + chrono::Duration::days(365)), 7);
    }

    #[tokio::test]
    async fn test_slow_driver_times_out() {
        let driver = Arc::new(
            SimulatedDriver::with_machines(&["box"]).with_latency(Duration::from_millis(200)),
        );
        let err = RemoteResource::initialize(driver, "box", Duration::from_millis(20), 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ResourceError::Timeout {
                operation: "locate",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cleanup_saves_running_machine() {
        let driver = driver();
        let r = resource(&driver).await;
        r.cleanup().await.unwrap();
        r.launch().await.unwrap();
        r.cleanup().await.unwrap();
        assert_eq!(driver.machine("box").unwrap().saves, 1);
    }
}
