//! Configuration for crowdbox.
//!
//! Settings are read from `crowdbox.toml` in the configuration directory
//! (`$XDG_CONFIG_HOME/crowdbox` by default) and layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [defaults]
//! default_profile = 1
//! default_objective = "Find the first flag"
//! max_freebies = 0
//! press_delay_ms = 0
//!
//! [resource]
//! driver = "vboxmanage"
//! vboxmanage_cmd = "VBoxManage"
//! operation_timeout_secs = 120
//!
//! [gateway]
//! host = "irc.chat.twitch.tv"
//! port = 6667
//! prefix = "!"
//! disconnect_timeout_secs = 5
//! hotseat_reward = "hotseat"
//! hotseat_reward_secs = 300
//! hint_reward = "Hints"
//!
//! [store]
//! path = "state.db"
//!
//! [logging]
//! file = "crowdbox.log"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::profile::Credentials;

pub const CONFIG_FILE: &str = "crowdbox.toml";

/// Machine backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    VBoxManage,
    /// In-process machines, for trying things out without VirtualBox
    Simulated,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::VBoxManage => write!(f, "vboxmanage"),
            DriverKind::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vboxmanage" => Ok(DriverKind::VBoxManage),
            "simulated" => Ok(DriverKind::Simulated),
            _ => anyhow::bail!(
                "Invalid driver '{}'. Valid values: vboxmanage, simulated",
                s
            ),
        }
    }
}

/// Session-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Profile loaded on startup
    #[serde(default)]
    pub default_profile: Option<i64>,
    /// Objective shown when the challenge has none for its level
    #[serde(default)]
    pub default_objective: Option<String>,
    /// Interactions granted to users without an explicit policy (0 = unlimited)
    #[serde(default)]
    pub max_freebies: u32,
    /// Delay between typed characters
    #[serde(default)]
    pub press_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default = "default_vboxmanage_cmd")]
    pub vboxmanage_cmd: String,
    /// Upper bound for any single machine operation
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

fn default_vboxmanage_cmd() -> String {
    "VBoxManage".to_string()
}

fn default_operation_timeout_secs() -> u64 {
    120
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            vboxmanage_cmd: default_vboxmanage_cmd(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Chat command prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_disconnect_timeout_secs")]
    pub disconnect_timeout_secs: u64,
    /// Reward name (or id) granting the hotseat
    #[serde(default = "default_hotseat_reward")]
    pub hotseat_reward: String,
    /// Hotseat duration when the redemption carries no cost
    #[serde(default = "default_hotseat_reward_secs")]
    pub hotseat_reward_secs: u64,
    /// Reward name (or id) revealing the next hint
    #[serde(default = "default_hint_reward")]
    pub hint_reward: String,
    /// Link answered to `!source`
    #[serde(default)]
    pub source_url: Option<String>,
}

fn default_host() -> String {
    "irc.chat.twitch.tv".to_string()
}

fn default_port() -> u16 {
    6667
}

fn default_prefix() -> String {
    "!".to_string()
}

fn default_disconnect_timeout_secs() -> u64 {
    5
}

fn default_hotseat_reward() -> String {
    "hotseat".to_string()
}

fn default_hotseat_reward_secs() -> u64 {
    300
}

fn default_hint_reward() -> String {
    "Hints".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            prefix: default_prefix(),
            disconnect_timeout_secs: default_disconnect_timeout_secs(),
            hotseat_reward: default_hotseat_reward(),
            hotseat_reward_secs: default_hotseat_reward_secs(),
            hint_reward: default_hint_reward(),
            source_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file, relative to the configuration directory
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("state.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log file, relative to the configuration directory. Logs go to stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Root `crowdbox.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrowdboxToml {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub resource: ResourceConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CrowdboxToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crowdbox.toml")
    }

    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize crowdbox.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Check for values that parse but will not work. Returns warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.resource.operation_timeout_secs == 0 {
            warnings.push(
                "operation_timeout_secs is 0: every machine operation will time out".to_string(),
            );
        }
        if self.gateway.prefix.is_empty() {
            warnings.push("gateway prefix is empty: every chat line is a command".to_string());
        }
        if self.gateway.port == 0 {
            warnings.push("gateway port is 0".to_string());
        }
        if self.gateway.hotseat_reward_secs == 0 {
            warnings.push(
                "hotseat_reward_secs is 0: redeemed hotseats never expire".to_string(),
            );
        }
        if let Some(objective) = &self.defaults.default_objective
            && objective.trim().is_empty()
        {
            warnings.push("default_objective is blank".to_string());
        }

        warnings
    }
}

/// Resolved configuration: file, then environment, then CLI flags.
#[derive(Debug, Clone)]
pub struct CrowdboxConfig {
    pub config_dir: PathBuf,
    pub toml: CrowdboxToml,
    /// CLI override for the machine backend
    pub cli_driver: Option<DriverKind>,
    /// CLI override for the startup profile
    pub cli_profile: Option<i64>,
}

impl CrowdboxConfig {
    /// Load from `config_dir`, or the platform default when `None`.
    pub fn new(config_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => default_config_dir()?,
        };
        let toml = CrowdboxToml::load_or_default(&config_dir)?;
        Ok(Self {
            config_dir,
            toml,
            cli_driver: None,
            cli_profile: None,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn store_path(&self) -> PathBuf {
        self.config_dir.join(&self.toml.store.path)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.toml
            .logging
            .file
            .as_ref()
            .map(|f| self.config_dir.join(f))
    }

    pub fn driver(&self) -> DriverKind {
        self.cli_driver.unwrap_or(self.toml.resource.driver)
    }

    pub fn default_profile(&self) -> Option<i64> {
        self.cli_profile
            .or_else(|| env_parse("CROWDBOX_DEFAULT_PROFILE"))
            .or(self.toml.defaults.default_profile)
    }

    pub fn max_freebies(&self) -> u32 {
        env_parse("CROWDBOX_MAX_FREEBIES").unwrap_or(self.toml.defaults.max_freebies)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.resource.operation_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.gateway.disconnect_timeout_secs)
    }

    /// Credentials from the environment, used to fill gaps in a profile.
    pub fn env_credentials(&self) -> Credentials {
        Credentials {
            client_id: std::env::var("CROWDBOX_CLIENT_ID").ok(),
            api_token: std::env::var("CROWDBOX_API_TOKEN").ok(),
            irc_token: std::env::var("CROWDBOX_IRC_TOKEN").ok(),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// `$XDG_CONFIG_HOME/crowdbox` (or the platform equivalent).
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("crowdbox"))
        .context("Could not determine the configuration directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let toml = CrowdboxToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.gateway.host, "irc.chat.twitch.tv");
        assert_eq!(toml.gateway.port, 6667);
        assert_eq!(toml.gateway.prefix, "!");
        assert_eq!(toml.resource.operation_timeout_secs, 120);
        assert_eq!(toml.resource.driver, DriverKind::VBoxManage);
        assert_eq!(toml.store.path, PathBuf::from("state.db"));
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let content = r#"
[defaults]
max_freebies = 3
default_objective = "Get a shell"

[resource]
driver = "simulated"

[gateway]
hint_reward = "Clue"
"#;
        let toml = CrowdboxToml::parse(content).unwrap();
        assert_eq!(toml.defaults.max_freebies, 3);
        assert_eq!(toml.defaults.default_objective.as_deref(), Some("Get a shell"));
        assert_eq!(toml.resource.driver, DriverKind::Simulated);
        assert_eq!(toml.resource.vboxmanage_cmd, "VBoxManage");
        assert_eq!(toml.gateway.hint_reward, "Clue");
        assert_eq!(toml.gateway.hotseat_reward, "hotseat");
    }

    #[test]
    fn test_invalid_driver_is_an_error() {
        let content = "[resource]\ndriver = \"vmware\"\n";
        assert!(CrowdboxToml::parse(content).is_err());
        assert!("VMware".parse::<DriverKind>().is_err());
        assert_eq!(
            "Simulated".parse::<DriverKind>().unwrap(),
            DriverKind::Simulated
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let mut toml = CrowdboxToml::default();
        toml.defaults.default_profile = Some(4);
        toml.logging.file = Some(PathBuf::from("crowdbox.log"));
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let config = CrowdboxConfig::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.toml.defaults.default_profile, Some(4));
        assert_eq!(config.log_path(), Some(dir.path().join("crowdbox.log")));
        assert_eq!(config.store_path(), dir.path().join("state.db"));
    }

    #[test]
    fn test_validate_warnings() {
        let content = r#"
[defaults]
default_objective = "  "

[resource]
operation_timeout_secs = 0

[gateway]
prefix = ""
"#;
        let warnings = CrowdboxToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("operation_timeout_secs")));
    }

    #[test]
    fn test_env_overrides_file_and_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[defaults]\ndefault_profile = 1\nmax_freebies = 2\n",
        )
        .unwrap();
        let mut config = CrowdboxConfig::new(Some(dir.path().to_path_buf())).unwrap();

        unsafe { std::env::remove_var("CROWDBOX_DEFAULT_PROFILE") };
        unsafe { std::env::remove_var("CROWDBOX_MAX_FREEBIES") };
        assert_eq!(config.default_profile(), Some(1));
        assert_eq!(config.max_freebies(), 2);

        unsafe { std::env::set_var("CROWDBOX_DEFAULT_PROFILE", "7") };
        unsafe { std::env::set_var("CROWDBOX_MAX_FREEBIES", "9") };
        assert_eq!(config.default_profile(), Some(7));
        assert_eq!(config.max_freebies(), 9);

        config.cli_profile = Some(3);
        assert_eq!(config.default_profile(), Some(3));

        unsafe { std::env::remove_var("CROWDBOX_DEFAULT_PROFILE") };
        unsafe { std::env::remove_var("CROWDBOX_MAX_FREEBIES") };
    }

    #[test]
    fn test_cli_driver_override() {
        let dir = tempdir().unwrap();
        let mut config = CrowdboxConfig::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.driver(), DriverKind::VBoxManage);
        config.cli_driver = Some(DriverKind::Simulated);
        assert_eq!(config.driver(), DriverKind::Simulated);
    }
}
