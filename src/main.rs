use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crowdbox::config::{CrowdboxConfig, DriverKind};
use crowdbox::observability::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "crowdbox")]
#[command(version, about = "Chat-controlled challenge machine orchestrator")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, global = true, env = "CROWDBOX_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Machine backend: vboxmanage or simulated. Overrides crowdbox.toml.
    #[arg(long, global = true)]
    pub driver: Option<DriverKind>,

    /// Profile to load on startup. Overrides crowdbox.toml.
    #[arg(long, global = true)]
    pub profile: Option<i64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the operator console with the chat event loop
    Run,
    /// Manage stored profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Manage stored challenges
    Challenge {
        #[command(subcommand)]
        command: ChallengeCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show the state of the startup profile and its challenge
    Status,
}

#[derive(Subcommand, Clone)]
pub enum ProfileCommands {
    /// Create a profile for a chat channel
    Create {
        /// Channel to join
        channel: String,
        /// Bot account, when different from the channel owner
        #[arg(long)]
        bot: Option<String>,
        /// Application client id
        #[arg(long)]
        client_id: Option<String>,
    },
    /// List stored profiles
    List,
}

#[derive(Subcommand, Clone)]
pub enum ChallengeCommands {
    /// Create a challenge backed by a VirtualBox machine
    Create {
        /// Name of the machine
        machine: String,
    },
    /// List stored challenges
    List,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default crowdbox.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = CrowdboxConfig::new(cli.config_dir.clone())?;
    config.cli_driver = cli.driver;
    config.cli_profile = cli.profile;

    let _log_guard = init_logging(cli.verbose, config.log_path().as_deref());

    match &cli.command {
        Commands::Run => cmd::cmd_run(&config).await?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Profile { command } => cmd::cmd_profile(&config, command.clone()).await?,
        Commands::Challenge { command } => cmd::cmd_challenge(&config, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
