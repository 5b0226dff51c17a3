//! Stored record commands: `crowdbox profile` and `crowdbox challenge`.

use anyhow::Result;

use crowdbox::challenge::Provider;
use crowdbox::config::CrowdboxConfig;
use crowdbox::store::Store;

use super::super::{ChallengeCommands, ProfileCommands};
use super::run::open_store;

pub async fn cmd_profile(config: &CrowdboxConfig, command: ProfileCommands) -> Result<()> {
    let store = open_store(config)?;

    match command {
        ProfileCommands::Create {
            channel,
            bot,
            client_id,
        } => {
            let client_id = client_id.or_else(|| config.env_credentials().client_id);
            let profile = store
                .create_profile(&channel, bot.as_deref(), client_id)
                .await?;
            println!(
                "{} profile {}: '{}'",
                console::style("Created").green().bold(),
                profile.id,
                profile
            );
        }
        ProfileCommands::List => {
            let profiles = store.list_profiles().await?;
            if profiles.is_empty() {
                println!("No profiles. Create one with 'crowdbox profile create <channel>'.");
                return Ok(());
            }
            println!("{:<6} {:<30} Challenge", "ID", "Profile");
            println!("{:<6} {:<30} ---------", "------", "-------");
            for profile in profiles {
                let challenge = profile
                    .challenge
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<6} {:<30} {}", profile.id, profile.to_string(), challenge);
            }
        }
    }

    Ok(())
}

pub async fn cmd_challenge(config: &CrowdboxConfig, command: ChallengeCommands) -> Result<()> {
    let store = open_store(config)?;

    match command {
        ChallengeCommands::Create { machine } => {
            let challenge = store
                .create_challenge(Provider::VirtualBox, &machine)
                .await?;
            println!(
                "{} challenge {}: '{}'",
                console::style("Created").green().bold(),
                challenge.id,
                challenge
            );
        }
        ChallengeCommands::List => {
            let challenges = store.list_challenges().await?;
            if challenges.is_empty() {
                println!("No challenges. Create one with 'crowdbox challenge create <machine>'.");
                return Ok(());
            }
            println!("{:<6} {:<30} {:<6} Flags", "ID", "Challenge", "Level");
            println!("{:<6} {:<30} {:<6} -----", "------", "---------", "-----");
            for challenge in challenges {
                let flags = challenge.flags();
                let captured = flags.iter().filter(|f| f.is_captured()).count();
                println!(
                    "{:<6} {:<30} {:<6} {}/{}",
                    challenge.id,
                    challenge.to_string(),
                    challenge.level(),
                    captured,
                    flags.len()
                );
            }
        }
    }

    Ok(())
}
