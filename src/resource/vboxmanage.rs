use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::keys::{Key, MODIFIERS};
use super::{KeyChord, MachineDriver};

const NOT_FOUND_MARKER: &str = "Could not find a registered machine";

/// Drives VirtualBox through the `VBoxManage` command line tool.
#[derive(Debug, Clone)]
pub struct VBoxManageDriver {
    program: String,
}

impl VBoxManageDriver {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(program = %self.program, ?args, "running VBoxManage");
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.program))
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn showvminfo(&self, name: &str) -> Result<String> {
        self.run(&["showvminfo", name, "--machinereadable"]).await
    }

    async fn put_scancodes(&self, name: &str, codes: &[u8]) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }
        let hex: Vec<String> = codes.iter().map(|c| format!("{c:02x}")).collect();
        let mut args = vec!["controlvm", name, "keyboardputscancode"];
        args.extend(hex.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }
}

/// Extract `VMState` from `showvminfo --machinereadable` output.
pub fn parse_vm_state(info: &str) -> Option<&str> {
    info.lines()
        .find_map(|line| line.strip_prefix("VMState="))
        .map(|v| v.trim().trim_matches('"'))
}

#[async_trait]
impl MachineDriver for VBoxManageDriver {
    async fn locate(&self, name: &str) -> Result<bool> {
        let output = self
            .output(&["showvminfo", name, "--machinereadable"])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(NOT_FOUND_MARKER) {
            return Ok(false);
        }
        bail!("showvminfo {} failed: {}", name, stderr.trim())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let info = self.showvminfo(name).await?;
        Ok(parse_vm_state(&info) == Some("running"))
    }

    async fn launch(&self, name: &str) -> Result<()> {
        self.run(&["startvm", name, "--type", "gui"]).await?;
        Ok(())
    }

    async fn save_state(&self, name: &str) -> Result<()> {
        self.run(&["controlvm", name, "savestate"]).await?;
        Ok(())
    }

    async fn power_down(&self, name: &str) -> Result<()> {
        self.run(&["controlvm", name, "poweroff"]).await?;
        Ok(())
    }

    async fn take_snapshot(&self, name: &str, snapshot: &str, description: &str) -> Result<()> {
        self.run(&[
            "snapshot",
            name,
            "take",
            snapshot,
            "--description",
            description,
            "--live",
        ])
        .await?;
        Ok(())
    }

    async fn restore_snapshot(&self, name: &str) -> Result<()> {
        self.run(&["snapshot", name, "restorecurrent"]).await?;
        Ok(())
    }

    async fn put_text(&self, name: &str, text: &str, press_delay_ms: u64) -> Result<()> {
        if press_delay_ms == 0 {
            self.run(&["controlvm", name, "keyboardputstring", text])
                .await?;
            return Ok(());
        }
        // keyboardputstring has no pacing, so send one character at a time
        let mut buf = [0u8; 4];
        for c in text.chars() {
            let s: &str = c.encode_utf8(&mut buf);
            self.run(&["controlvm", name, "keyboardputstring", s])
                .await?;
            tokio::time::sleep(Duration::from_millis(press_delay_ms)).await;
        }
        Ok(())
    }

    async fn put_keys(&self, name: &str, chord: &KeyChord) -> Result<()> {
        self.put_scancodes(name, &chord.scancodes()).await
    }

    async fn release_keys(&self, name: &str) -> Result<()> {
        let codes: Vec<u8> = MODIFIERS
            .iter()
            .filter_map(|m| Key::lookup(m))
            .flat_map(|k| k.break_codes())
            .collect();
        self.put_scancodes(name, &codes).await
    }
}
