use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use super::{KeyChord, MachineDriver};

/// Recorded state of one simulated machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimMachine {
    pub running: bool,
    pub launches: u32,
    pub saves: u32,
    pub power_downs: u32,
    pub restores: u32,
    /// (snapshot name, description)
    pub snapshots: Vec<(String, String)>,
    /// (text, press delay in ms)
    pub typed: Vec<(String, u64)>,
    pub chords: Vec<KeyChord>,
    pub releases: u32,
}

/// In-process machine backend for dry runs and tests.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    machines: Mutex<HashMap<String, SimMachine>>,
    latency: Option<Duration>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machines(names: &[&str]) -> Self {
        let machines = names
            .iter()
            .map(|n| (n.to_string(), SimMachine::default()))
            .collect();
        Self {
            machines: Mutex::new(machines),
            latency: None,
        }
    }

    /// Delay every call, to exercise timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Register a machine so `locate` finds it.
    pub fn add_machine(&self, name: &str) {
        if let Ok(mut machines) = self.machines.lock() {
            machines.entry(name.to_string()).or_default();
        }
    }

    pub fn machine(&self, name: &str) -> Option<SimMachine> {
        self.machines.lock().ok()?.get(name).cloned()
    }

    async fn with_machine<R>(&self, name: &str, f: impl FnOnce(&mut SimMachine) -> Result<R>) -> Result<R> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut machines = self
            .machines
            .lock()
            .map_err(|_| anyhow!("simulated machine table poisoned"))?;
        let machine = machines
            .get_mut(name)
            .ok_or_else(|| anyhow!("no simulated machine named '{}'", name))?;
        f(machine)
    }
}

#[async_trait]
impl MachineDriver for SimulatedDriver {
    async fn locate(&self, name: &str) -> Result<bool> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let machines = self
            .machines
            .lock()
            .map_err(|_| anyhow!("simulated machine table poisoned"))?;
        Ok(machines.contains_key(name))
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        self.with_machine(name, |m| Ok(m.running)).await
    }

    async fn launch(&self, name: &str) -> Result<()> {
        self.with_machine(name, |m| {
            m.running = true;
            m.launches += 1;
            Ok(())
        })
        .await
    }

    async fn save_state(&self, name: &str) -> Result<()> {
        self.with_machine(name, |m| {
            m.running = false;
            m.saves += 1;
            Ok(())
        })
        .await
    }

    async fn power_down(&self, name: &str) -> Result<()> {
        self.with_machine(name, |m| {
            m.running = false;
            m.power_downs += 1;
            Ok(())
        })
        .await
    }

    async fn take_snapshot(&self, name: &str, snapshot: &str, description: &str) -> Result<()> {
        self.with_machine(name, |m| {
            m.snapshots
                .push((snapshot.to_string(), description.to_string()));
            Ok(())
        })
        .await
    }

    async fn restore_snapshot(&self, name: &str) -> Result<()> {
        self.with_machine(name, |m| {
            if m.running {
                bail!("machine is locked by a running session");
            }
            m.restores += 1;
            Ok(())
        })
        .await
    }

    async fn put_text(&self, name: &str, text: &str, press_delay_ms: u64) -> Result<()> {
        self.with_machine(name, |m| {
            m.typed.push((text.to_string(), press_delay_ms));
            Ok(())
        })
        .await
    }

    async fn put_keys(&self, name: &str, chord: &KeyChord) -> Result<()> {
        self.with_machine(name, |m| {
            m.chords.push(chord.clone());
            Ok(())
        })
        .await
    }

    async fn release_keys(&self, name: &str) -> Result<()> {
        self.with_machine(name, |m| {
            m.releases += 1;
            Ok(())
        })
        .await
    }
}
