//! Interactive session commands: `crowdbox run` and `crowdbox status`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crowdbox::config::{CrowdboxConfig, DriverKind};
use crowdbox::gateway::irc_factory;
use crowdbox::resource::{MachineDriver, SimulatedDriver, VBoxManageDriver};
use crowdbox::session::{Session, SessionSettings};
use crowdbox::store::{SqliteStore, Store};

/// Open the state database, creating the configuration directory if needed.
pub fn open_store(config: &CrowdboxConfig) -> Result<Arc<SqliteStore>> {
    std::fs::create_dir_all(&config.config_dir).with_context(|| {
        format!(
            "Failed to create config directory: {}",
            config.config_dir.display()
        )
    })?;
    let path = config.store_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open state database: {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn build_driver(
    config: &CrowdboxConfig,
    store: &SqliteStore,
) -> Result<Arc<dyn MachineDriver>> {
    Ok(match config.driver() {
        DriverKind::VBoxManage => Arc::new(VBoxManageDriver::new(
            &config.toml.resource.vboxmanage_cmd,
        )),
        DriverKind::Simulated => {
            // Every stored challenge gets a machine so dry runs behave like the real thing
            let driver = SimulatedDriver::new();
            for challenge in store.list_challenges().await? {
                driver.add_machine(&challenge.name);
            }
            Arc::new(driver)
        }
    })
}

/// Build a session and load the startup profile, if any.
async fn build_session(config: &CrowdboxConfig) -> Result<Arc<Session>> {
    let store = open_store(config)?;
    let driver = build_driver(config, &store).await?;
    let session = Arc::new(Session::new(
        store,
        driver,
        irc_factory(config.toml.gateway.clone()),
        SessionSettings::from(config),
    ));

    if let Some(id) = config.default_profile() {
        match session.load_profile(id, false).await {
            Ok(profile) => info!(profile = %profile, "startup profile loaded"),
            Err(e) => warn!(id, error = %e, "could not load startup profile"),
        }
    }
    Ok(session)
}

pub async fn cmd_run(config: &CrowdboxConfig) -> Result<()> {
    for warning in config.validate() {
        println!("{} {}", console::style("Warning:").yellow().bold(), warning);
    }

    let session = build_session(config).await?;
    println!(
        "{}",
        console::style("crowdbox interactive console").bold().cyan()
    );
    println!("Type 'help' for commands.");
    if session.profile().await.is_some() {
        println!();
        println!("Loaded default:");
        println!("{}", session.status().await);
    }
    println!();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    crowdbox::console::run_console(session, stdin, tokio::io::stdout()).await
}

pub async fn cmd_status(config: &CrowdboxConfig) -> Result<()> {
    let session = build_session(config).await?;
    println!();
    println!("{}", session.status().await);
    println!();
    // Dropped without cleanup: a running machine keeps running
    Ok(())
}
