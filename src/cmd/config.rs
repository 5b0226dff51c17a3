//! Configuration view and validation commands: `crowdbox config`.

use anyhow::{Context, Result};

use crowdbox::config::{CrowdboxConfig, CrowdboxToml};

use super::super::ConfigCommands;

fn print_toml(toml: &CrowdboxToml) -> Result<()> {
    let rendered = toml::to_string_pretty(toml).context("Failed to render configuration")?;
    for line in rendered.lines() {
        println!("  {line}");
    }
    Ok(())
}

pub fn cmd_config(config: &CrowdboxConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("crowdbox configuration").bold());
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No crowdbox.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print_toml(&config.toml)?;
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  driver = \"{}\"", config.driver());
            match config.default_profile() {
                Some(id) => println!("  default_profile = {id}"),
                None => println!("  default_profile = (none)"),
            }
            println!("  max_freebies = {}", config.max_freebies());
            println!("  store = \"{}\"", config.store_path().display());
            if let Some(log) = config.log_path() {
                println!("  log_file = \"{}\"", log.display());
            }
            println!();
            if !config_path.exists() {
                println!("Run 'crowdbox config init' to create a crowdbox.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No crowdbox.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = CrowdboxToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("crowdbox.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.config_dir).with_context(|| {
                format!(
                    "Failed to create config directory: {}",
                    config.config_dir.display()
                )
            })?;
            CrowdboxToml::default().save(&config_path)?;

            println!("Created crowdbox.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [defaults] default_profile, default_objective, max_freebies");
            println!("  - [resource] driver, vboxmanage_cmd, operation_timeout_secs");
            println!("  - [gateway] host, port, prefix, reward names");
            println!();
        }
    }

    Ok(())
}
