//! The session orchestrator.
//!
//! One [`Session`] owns the active profile, the selected challenge, its
//! machine handle, the access controller and the chat gateway. All of it
//! sits behind a single async mutex; the operator console and the chat
//! event consumer both go through the methods here.

pub mod commands;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::access::{AccessController, Authorization};
use crate::challenge::{Challenge, NO_OBJECTIVE, Provider, SubmissionOutcome};
use crate::config::CrowdboxConfig;
use crate::errors::{ResourceError, SessionError, SessionResult, StoreError};
use crate::gateway::{ChatEvent, ChatGateway, ChatUser, GatewayFactory};
use crate::profile::{Credentials, Profile};
use crate::resource::{MachineDriver, RemoteResource, RunState};
use crate::store::Store;

pub use commands::Reply;

/// Sentinel answered when no hint can be revealed.
pub const NO_HINTS: &str = "No hints available at this time";

/// Capacity of the inbound chat event channel.
const EVENT_BUFFER: usize = 256;

/// Knobs the session needs from the configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_objective: Option<String>,
    pub max_freebies: u32,
    pub press_delay_ms: u64,
    pub operation_timeout: Duration,
    pub command_prefix: String,
    pub hotseat_reward: String,
    pub hotseat_reward_secs: u64,
    pub hint_reward: String,
    pub source_url: Option<String>,
    /// Fills credentials a profile does not carry itself, at gateway build time
    pub env_credentials: Credentials,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_objective: None,
            max_freebies: 0,
            press_delay_ms: 0,
            operation_timeout: Duration::from_secs(120),
            command_prefix: "!".to_string(),
            hotseat_reward: "hotseat".to_string(),
            hotseat_reward_secs: 300,
            hint_reward: "Hints".to_string(),
            source_url: None,
            env_credentials: Credentials::default(),
        }
    }
}

impl From<&CrowdboxConfig> for SessionSettings {
    fn from(config: &CrowdboxConfig) -> Self {
        let toml = &config.toml;
        Self {
            default_objective: toml.defaults.default_objective.clone(),
            max_freebies: config.max_freebies(),
            press_delay_ms: toml.defaults.press_delay_ms,
            operation_timeout: config.operation_timeout(),
            command_prefix: toml.gateway.prefix.clone(),
            hotseat_reward: toml.gateway.hotseat_reward.clone(),
            hotseat_reward_secs: toml.gateway.hotseat_reward_secs,
            hint_reward: toml.gateway.hint_reward.clone(),
            source_url: toml.gateway.source_url.clone(),
            env_credentials: config.env_credentials(),
        }
    }
}

#[derive(Default)]
struct SessionState {
    profile: Option<Profile>,
    challenge: Option<Challenge>,
    resource: Option<RemoteResource>,
    access: AccessController,
    gateway: Option<Box<dyn ChatGateway>>,
    consumer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn profile(&self) -> SessionResult<&Profile> {
        self.profile.as_ref().ok_or(SessionError::NoProfileSelected)
    }

    fn profile_mut(&mut self) -> SessionResult<&mut Profile> {
        self.profile.as_mut().ok_or(SessionError::NoProfileSelected)
    }

    fn challenge(&self) -> SessionResult<&Challenge> {
        self.challenge
            .as_ref()
            .ok_or(SessionError::NoChallengeSelected)
    }

    fn challenge_mut(&mut self) -> SessionResult<&mut Challenge> {
        self.challenge
            .as_mut()
            .ok_or(SessionError::NoChallengeSelected)
    }

    fn resource(&self) -> SessionResult<&RemoteResource> {
        self.challenge()?;
        self.resource
            .as_ref()
            .ok_or(SessionError::ResourceNotInitialized)
    }

    fn resource_mut(&mut self) -> SessionResult<&mut RemoteResource> {
        self.challenge()?;
        self.resource
            .as_mut()
            .ok_or(SessionError::ResourceNotInitialized)
    }
}

pub struct Session {
    store: Arc<dyn Store>,
    driver: Arc<dyn MachineDriver>,
    gateway_factory: GatewayFactory,
    settings: SessionSettings,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn MachineDriver>,
        gateway_factory: GatewayFactory,
        settings: SessionSettings,
    ) -> Self {
        let state = SessionState {
            access: AccessController::new(settings.max_freebies),
            ..Default::default()
        };
        Self {
            store,
            driver,
            gateway_factory,
            settings,
            state: Mutex::new(state),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    // ── Profiles ────────────────────────────────────────────────────────

    pub async fn create_profile(
        &self,
        channel: &str,
        bot: Option<&str>,
        client_id: Option<String>,
        select: bool,
    ) -> SessionResult<Profile> {
        let client_id = client_id.or_else(|| self.settings.env_credentials.client_id.clone());
        let profile = self.store.create_profile(channel, bot, client_id).await?;
        info!(id = profile.id, profile = %profile, "profile created");
        if select {
            return self.load_profile(profile.id, false).await;
        }
        Ok(profile)
    }

    /// Make `id` the active profile, releasing whatever was active before.
    pub async fn load_profile(&self, id: i64, discard: bool) -> SessionResult<Profile> {
        let mut st = self.state.lock().await;
        if st.profile.is_some() {
            self.cleanup_locked(&mut st, discard).await?;
        }

        let profile = self.store.load_profile(id).await?;
        let selected = profile.challenge;
        st.profile = Some(profile);

        if let Some(challenge_id) = selected {
            match self.load_challenge_locked(&mut st, challenge_id).await {
                Ok(()) => {}
                Err(SessionError::Store(StoreError::ChallengeNotFound { .. })) => {
                    warn!(challenge_id, "selected challenge no longer exists");
                    st.profile_mut()?.challenge = None;
                }
                Err(e) => return Err(e),
            }
        }

        let profile = st.profile()?.clone();
        info!(profile = %profile, "profile loaded");
        Ok(profile)
    }

    pub async fn save_profile(&self) -> SessionResult<()> {
        let st = self.state.lock().await;
        self.store.save_profile(st.profile()?).await?;
        Ok(())
    }

    pub async fn profile(&self) -> Option<Profile> {
        self.state.lock().await.profile.clone()
    }

    pub async fn list_profiles(&self) -> SessionResult<Vec<Profile>> {
        Ok(self.store.list_profiles().await?)
    }

    pub async fn set_discord(&self, link: Option<String>) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        st.profile_mut()?.discord = link;
        self.store.save_profile(st.profile()?).await?;
        Ok(())
    }

    // ── Challenges ──────────────────────────────────────────────────────

    pub async fn create_challenge(
        &self,
        provider: Provider,
        name: &str,
        select: bool,
    ) -> SessionResult<Challenge> {
        if select && self.state.lock().await.profile.is_none() {
            return Err(SessionError::NoProfileSelected);
        }
        let challenge = self.store.create_challenge(provider, name).await?;
        info!(id = challenge.id, challenge = %challenge, "challenge created");
        if select {
            return self.select_challenge(challenge.id).await;
        }
        Ok(challenge)
    }

    /// Load `id`, remember it on the active profile and persist the profile.
    pub async fn select_challenge(&self, id: i64) -> SessionResult<Challenge> {
        let mut st = self.state.lock().await;
        st.profile()?;
        self.load_challenge_locked(&mut st, id).await?;
        st.profile_mut()?.challenge = Some(id);
        self.store.save_profile(st.profile()?).await?;

        let challenge = st.challenge()?.clone();
        info!(profile = %st.profile()?, challenge = %challenge, "challenge selected");
        Ok(challenge)
    }

    pub async fn list_challenges(&self) -> SessionResult<Vec<Challenge>> {
        Ok(self.store.list_challenges().await?)
    }

    pub async fn challenge(&self) -> Option<Challenge> {
        self.state.lock().await.challenge.clone()
    }

    async fn load_challenge_locked(&self, st: &mut SessionState, id: i64) -> SessionResult<()> {
        let challenge = self.store.load_challenge(id).await?;
        st.challenge = Some(challenge);
        self.initialize_resource_locked(st).await
    }

    pub async fn save_challenge(&self) -> SessionResult<()> {
        let st = self.state.lock().await;
        self.store.save_challenge(st.challenge()?).await?;
        Ok(())
    }

    /// Apply `f` to the selected challenge and persist it.
    async fn mutate_challenge<R>(
        &self,
        f: impl FnOnce(&mut Challenge) -> SessionResult<R>,
    ) -> SessionResult<R> {
        let mut st = self.state.lock().await;
        let result = f(st.challenge_mut()?)?;
        self.store.save_challenge(st.challenge()?).await?;
        Ok(result)
    }

    async fn read_challenge<R>(&self, f: impl FnOnce(&Challenge) -> R) -> SessionResult<R> {
        let st = self.state.lock().await;
        Ok(f(st.challenge()?))
    }

    pub async fn create_flag(
        &self,
        text: &str,
        level: u32,
        points: i64,
        location: Option<String>,
        description: Option<String>,
    ) -> SessionResult<()> {
        self.mutate_challenge(|c| {
            c.create_flag(text, level, points, location, description)?;
            Ok(())
        })
        .await
    }

    pub async fn delete_flag(&self, text: &str) -> SessionResult<()> {
        self.mutate_challenge(|c| {
            c.delete_flag(text)?;
            Ok(())
        })
        .await
    }

    pub async fn list_flags(&self) -> SessionResult<String> {
        self.read_challenge(|c| {
            c.flags()
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .await
    }

    pub async fn points_for(&self, username: &str) -> SessionResult<i64> {
        self.read_challenge(|c| c.points_for(username)).await
    }

    /// Check a submission. Validation and marking happen under the session
    /// lock, so two racing submissions can not both capture a flag.
    pub async fn capture_flag(&self, username: &str, text: &str) -> SessionResult<SubmissionOutcome> {
        let mut st = self.state.lock().await;
        let outcome = st.challenge_mut()?.validate_submission(username, text);
        if let SubmissionOutcome::Captured { flag, points } = &outcome {
            info!(%username, %flag, points, "flag captured");
            self.store.save_challenge(st.challenge()?).await?;
        }
        Ok(outcome)
    }

    pub async fn create_hint(&self, text: &str, level: u32, cost: i64) -> SessionResult<usize> {
        self.mutate_challenge(|c| Ok(c.create_hint(text, level, cost)?))
            .await
    }

    pub async fn move_hint_up(&self, level: u32, order: usize) -> SessionResult<()> {
        self.mutate_challenge(|c| Ok(c.move_hint_up(level, order)?))
            .await
    }

    pub async fn move_hint_down(&self, level: u32, order: usize) -> SessionResult<()> {
        self.mutate_challenge(|c| Ok(c.move_hint_down(level, order)?))
            .await
    }

    pub async fn delete_hint(&self, level: u32, order: usize) -> SessionResult<()> {
        self.mutate_challenge(|c| {
            c.delete_hint(level, order)?;
            Ok(())
        })
        .await
    }

    pub async fn list_hints(&self) -> SessionResult<String> {
        self.read_challenge(|c| {
            c.all_hints()
                .map(|h| format!("Level: {}\t{}", h.level, h))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .await
    }

    /// Reveal the next hint of the current level, or [`NO_HINTS`].
    pub async fn reveal_hint(&self) -> SessionResult<String> {
        let mut st = self.state.lock().await;
        let Some(challenge) = st.challenge.as_mut() else {
            return Ok(NO_HINTS.to_string());
        };
        match challenge.reveal_next_hint() {
            Some(text) => {
                self.store.save_challenge(st.challenge()?).await?;
                Ok(text)
            }
            None => Ok(NO_HINTS.to_string()),
        }
    }

    pub async fn create_objective(&self, text: &str, level: u32) -> SessionResult<()> {
        self.mutate_challenge(|c| Ok(c.create_objective(text, level)?))
            .await
    }

    pub async fn delete_objective(&self, level: u32) -> SessionResult<()> {
        self.mutate_challenge(|c| {
            c.delete_objective(level)?;
            Ok(())
        })
        .await
    }

    pub async fn list_objectives(&self) -> SessionResult<String> {
        self.read_challenge(|c| {
            c.objectives()
                .map(|o| o.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .await
    }

    pub async fn set_objective(&self, text: &str) -> SessionResult<()> {
        self.mutate_challenge(|c| {
            c.set_objective_override(text);
            Ok(())
        })
        .await
    }

    pub async fn reset_objective(&self) -> SessionResult<()> {
        self.mutate_challenge(|c| {
            c.reset_objective();
            Ok(())
        })
        .await
    }

    /// Objective shown to the audience; works without a challenge too.
    pub async fn current_objective(&self) -> String {
        let default = self.settings.default_objective.as_deref();
        match &self.state.lock().await.challenge {
            Some(challenge) => challenge.current_objective(default),
            None => default
                .filter(|d| !d.is_empty())
                .unwrap_or(NO_OBJECTIVE)
                .to_string(),
        }
    }

    // ── Machine ─────────────────────────────────────────────────────────

    /// Rebind the machine for the selected challenge. A machine the driver
    /// can not find leaves the challenge uninitialized instead of failing.
    pub async fn initialize_resource(&self) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        self.initialize_resource_locked(&mut st).await
    }

    async fn initialize_resource_locked(&self, st: &mut SessionState) -> SessionResult<()> {
        if let Some(resource) = st.resource.take()
            && let Err(e) = resource.cleanup().await
        {
            warn!(machine = %resource.name(), error = %e, "failed to release machine");
        }

        let name = st.challenge()?.name.clone();
        match RemoteResource::initialize(
            self.driver.clone(),
            &name,
            self.settings.operation_timeout,
            self.settings.press_delay_ms,
        )
        .await
        {
            Ok(resource) => {
                st.resource = Some(resource);
                Ok(())
            }
            Err(ResourceError::NotFound { name }) => {
                error!(
                    machine = %name,
                    "challenge is not configured correctly, machine not found"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn run_state(&self) -> SessionResult<RunState> {
        let st = self.state.lock().await;
        match &st.resource {
            Some(resource) => Ok(resource.run_state().await?),
            None => Ok(RunState::Uninitialized),
        }
    }

    /// Launch the machine, optionally reverting to the current snapshot first.
    /// Already running is not an error, unless a restore was asked for.
    pub async fn start_challenge(&self, restore: bool) -> SessionResult<()> {
        let st = self.state.lock().await;
        let resource = st.resource()?;
        if restore {
            resource.restore().await?;
        }
        launch_idempotent(resource).await
    }

    /// Stop the machine. Not running is not an error.
    pub async fn stop_challenge(&self, save: bool) -> SessionResult<()> {
        let st = self.state.lock().await;
        shut_down_idempotent(st.resource()?, save).await
    }

    /// Power off, revert to the current snapshot and launch again, all under
    /// one lock so no other command can start the machine in between.
    pub async fn restore_challenge(&self) -> SessionResult<()> {
        let st = self.state.lock().await;
        let resource = st.resource()?;
        shut_down_idempotent(resource, false).await?;
        resource.restore().await?;
        launch_idempotent(resource).await
    }

    pub async fn snapshot_challenge(&self, username: &str) -> SessionResult<()> {
        let st = self.state.lock().await;
        st.resource()?.snapshot(username).await?;
        Ok(())
    }

    pub async fn send_keys<S: AsRef<str> + Sync>(&self, keys: &[S]) -> SessionResult<Vec<String>> {
        let st = self.state.lock().await;
        Ok(st.resource()?.send_keys(keys).await?)
    }

    pub async fn type_text(&self, text: &str) -> SessionResult<()> {
        let st = self.state.lock().await;
        st.resource()?.type_text(text).await?;
        Ok(())
    }

    pub async fn release_keys(&self) -> SessionResult<()> {
        let st = self.state.lock().await;
        st.resource()?.release_modifiers().await?;
        Ok(())
    }

    pub async fn special_keys(&self) -> SessionResult<String> {
        let st = self.state.lock().await;
        Ok(st.resource()?.special_keys())
    }

    pub async fn press_delay(&self) -> SessionResult<u64> {
        let st = self.state.lock().await;
        Ok(st.resource()?.press_delay())
    }

    pub async fn set_press_delay(&self, ms: u64, seconds: Option<u64>) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        st.resource_mut()?.set_press_delay(ms, seconds);
        Ok(())
    }

    // ── Access ──────────────────────────────────────────────────────────

    pub async fn set_hotseat(&self, username: Option<&str>, seconds: Option<u64>) {
        self.state.lock().await.access.set_hotseat(username, seconds);
    }

    pub async fn hotseat(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .access
            .hotseat()
            .map(|h| h.holder.clone())
    }

    pub async fn authorize(&self, user: &ChatUser) -> SessionResult<Authorization> {
        let mut st = self.state.lock().await;
        let SessionState {
            profile, access, ..
        } = &mut *st;
        let profile = profile.as_mut().ok_or(SessionError::NoProfileSelected)?;
        Ok(access.authorize(
            &mut profile.users,
            &profile.superusers,
            &user.name,
            user.is_moderator,
        ))
    }

    pub async fn allow_users<S: AsRef<str> + Sync>(&self, names: &[S]) -> SessionResult<()> {
        self.update_users(|p| p.users.allow(names)).await
    }

    pub async fn deny_users<S: AsRef<str> + Sync>(&self, names: &[S]) -> SessionResult<()> {
        self.update_users(|p| p.users.deny(names)).await
    }

    pub async fn reset_users<S: AsRef<str> + Sync>(&self, names: &[S]) -> SessionResult<()> {
        self.update_users(|p| p.users.reset(names)).await
    }

    async fn update_users(&self, f: impl FnOnce(&mut Profile)) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        f(st.profile_mut()?);
        self.store.save_profile(st.profile()?).await?;
        Ok(())
    }

    // ── Chat gateway ────────────────────────────────────────────────────

    /// Build the gateway for the active profile and start consuming its events.
    pub async fn init_gateway(self: &Arc<Self>) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        if st.gateway.is_some() {
            return Err(SessionError::GatewayAlreadyInitialized);
        }
        // Environment credentials only live in the gateway, never in the stored profile
        let mut profile = st.profile()?.clone();
        profile.credentials = profile.credentials.or(&self.settings.env_credentials);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let gateway = (self.gateway_factory)(&profile, tx);
        st.gateway = Some(gateway);
        st.consumer = Some(commands::spawn_event_loop(self.clone(), rx));
        info!("chat gateway initialized");
        Ok(())
    }

    pub async fn connect_gateway(&self) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        let gateway = st
            .gateway
            .as_mut()
            .ok_or(SessionError::GatewayNotInitialized)?;
        gateway.connect().await?;
        Ok(())
    }

    pub async fn disconnect_gateway(&self) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        let gateway = st
            .gateway
            .as_mut()
            .ok_or(SessionError::GatewayNotInitialized)?;
        gateway.disconnect().await?;
        Ok(())
    }

    pub async fn gateway_status(&self) -> String {
        gateway_status(&*self.state.lock().await)
    }

    /// Send replies produced by the command dispatcher.
    pub async fn deliver(&self, replies: Vec<Reply>) {
        if replies.is_empty() {
            return;
        }
        let st = self.state.lock().await;
        let Some(gateway) = st.gateway.as_ref() else {
            warn!(count = replies.len(), "dropping replies, no chat gateway");
            return;
        };
        for reply in replies {
            let result = match &reply {
                Reply::Channel(text) => gateway.send_message(text).await,
                Reply::Direct { user, text } => gateway.send_direct_message(user, text).await,
            };
            if let Err(e) = result {
                warn!(error = %e, ?reply, "failed to send reply");
            }
        }
    }

    async fn teardown_gateway_locked(&self, st: &mut SessionState) {
        if let Some(mut gateway) = st.gateway.take()
            && gateway.is_connected()
            && let Err(e) = gateway.disconnect().await
        {
            warn!(error = %e, "failed to disconnect chat gateway");
        }
        if let Some(consumer) = st.consumer.take() {
            consumer.abort();
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Release everything: machine, challenge, gateway, profile. Persists
    /// the challenge and profile unless `discard` is set.
    pub async fn cleanup(&self, discard: bool) -> SessionResult<()> {
        let mut st = self.state.lock().await;
        self.cleanup_locked(&mut st, discard).await
    }

    async fn cleanup_locked(&self, st: &mut SessionState, discard: bool) -> SessionResult<()> {
        let mut first_error: Option<SessionError> = None;

        if let Some(resource) = st.resource.take()
            && let Err(e) = resource.cleanup().await
        {
            warn!(machine = %resource.name(), error = %e, "failed to release machine");
            first_error.get_or_insert(e.into());
        }

        if let Some(challenge) = st.challenge.take()
            && !discard
            && let Err(e) = self.store.save_challenge(&challenge).await
        {
            error!(error = %e, "failed to save challenge");
            first_error.get_or_insert(e.into());
        }

        if let Some(profile) = st.profile.take() {
            self.teardown_gateway_locked(st).await;
            if !discard
                && let Err(e) = self.store.save_profile(&profile).await
            {
                error!(error = %e, "failed to save profile");
                first_error.get_or_insert(e.into());
            }
            info!(profile = %profile, discard, "profile released");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Multi-line status for the operator.
    pub async fn status(&self) -> String {
        let st = self.state.lock().await;
        let Some(profile) = &st.profile else {
            return "Profile has not been loaded".to_string();
        };
        format!(
            "Profile: '{}'\n{}\n{}",
            profile,
            challenge_status(&st).await,
            gateway_status(&st)
        )
    }

    pub async fn challenge_status(&self) -> String {
        challenge_status(&*self.state.lock().await).await
    }
}

async fn launch_idempotent(resource: &RemoteResource) -> SessionResult<()> {
    match resource.launch().await {
        Ok(()) | Err(ResourceError::AlreadyRunning) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn shut_down_idempotent(resource: &RemoteResource, save: bool) -> SessionResult<()> {
    match resource.shut_down(save).await {
        Ok(()) | Err(ResourceError::NotRunning) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn challenge_status(st: &SessionState) -> String {
    if st.profile.as_ref().and_then(|p| p.challenge).is_none() {
        return "No challenge selected".to_string();
    }
    let Some(challenge) = &st.challenge else {
        return "Challenge not loaded".to_string();
    };
    let Some(resource) = &st.resource else {
        return format!("Challenge '{}' not initialized", challenge.name);
    };
    match resource.is_running().await {
        Ok(true) => format!("Challenge '{}' is running", challenge.name),
        Ok(false) => format!("Challenge '{}' is not running", challenge.name),
        Err(e) => format!("Challenge '{}' state unknown: {}", challenge.name, e),
    }
}

fn gateway_status(st: &SessionState) -> String {
    match &st.gateway {
        None => "Chatbot is not initialized".to_string(),
        Some(g) if g.is_connected() => "Chatbot is initialized and connected".to_string(),
        Some(_) => "Chatbot is initialized".to_string(),
    }
}

/// Feed one event through the dispatcher and send the replies.
pub async fn process_event(session: &Session, event: ChatEvent) {
    let replies = session.handle_event(event).await;
    session.deliver(replies).await;
}
