//! Who may drive the machine.
//!
//! Users live on the active profile in a [`UserDirectory`]; the
//! [`AccessController`] owns the process-lifetime pieces (hotseat and the
//! freebie cap) and combines both into an [`Authorization`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-user override of the default interaction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interact {
    Allowed,
    Denied,
    #[default]
    Unset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub interact: Interact,
    #[serde(default)]
    pub interaction_count: u32,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub is_moderator: bool,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            interact: Interact::Unset,
            interaction_count: 0,
            is_superuser: false,
            is_moderator: false,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.is_superuser || self.is_moderator
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_superuser {
            write!(f, "Superuser: {}", self.name)
        } else if self.is_moderator {
            write!(f, "Moderator: {}", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Users known to a profile, keyed by lowercased name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserDirectory {
    users: BTreeMap<String, User>,
}

impl UserDirectory {
    pub fn get(&self, name: &str) -> Option<&User> {
        self.users.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    fn entry(&mut self, name: &str) -> &mut User {
        let key = name.to_lowercase();
        self.users
            .entry(key.clone())
            .or_insert_with(|| User::new(&key))
    }

    pub fn allow<S: AsRef<str>>(&mut self, names: &[S]) {
        self.set_interact(names, Interact::Allowed);
    }

    pub fn deny<S: AsRef<str>>(&mut self, names: &[S]) {
        self.set_interact(names, Interact::Denied);
    }

    pub fn reset<S: AsRef<str>>(&mut self, names: &[S]) {
        self.set_interact(names, Interact::Unset);
    }

    fn set_interact<S: AsRef<str>>(&mut self, names: &[S], interact: Interact) {
        for name in names {
            let name = name.as_ref().trim_start_matches('@');
            if name.is_empty() {
                continue;
            }
            self.entry(name).interact = interact;
        }
        debug!(count = names.len(), ?interact, "updated interaction policy");
    }
}

/// `now + secs`, or `None` when that is past what a timestamp can hold.
/// Such a duration never runs out, so it reads as no expiry.
pub(crate) fn expiry_after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = i64::try_from(secs).ok().and_then(Duration::try_seconds)?;
    now.checked_add_signed(delta)
}

/// Exclusive control granted to one user, optionally until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hotseat {
    pub holder: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Hotseat {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry < now)
    }
}

/// Outcome of an authorization check. Denials may be silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub allowed: bool,
    pub message: Option<String>,
}

impl Authorization {
    fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    fn deny(message: Option<String>) -> Self {
        Self {
            allowed: false,
            message,
        }
    }
}

#[derive(Debug, Default)]
pub struct AccessController {
    /// Interactions granted to users without an explicit policy. 0 = unlimited.
    max_freebies: u32,
    hotseat: Option<Hotseat>,
}

impl AccessController {
    pub fn new(max_freebies: u32) -> Self {
        Self {
            max_freebies,
            hotseat: None,
        }
    }

    pub fn max_freebies(&self) -> u32 {
        self.max_freebies
    }

    pub fn set_max_freebies(&mut self, max_freebies: u32) {
        self.max_freebies = max_freebies;
    }

    pub fn set_hotseat(&mut self, username: Option<&str>, seconds: Option<u64>) {
        self.set_hotseat_at(username, seconds, Utc::now());
    }

    /// Grant the hotseat to `username`, or clear it with `None`.
    pub fn set_hotseat_at(
        &mut self,
        username: Option<&str>,
        seconds: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let holder = username
            .map(|name| name.trim_start_matches('@'))
            .filter(|name| !name.is_empty());

        self.hotseat = holder.map(|holder| Hotseat {
            holder: holder.to_string(),
            expires_at: seconds.and_then(|secs| expiry_after(now, secs)),
        });

        match (&self.hotseat, seconds) {
            (Some(h), Some(secs)) => debug!(holder = %h.holder, secs, "hotseat awarded"),
            (Some(h), None) => debug!(holder = %h.holder, "hotseat awarded"),
            (None, _) => debug!("hotseat cleared"),
        }
    }

    pub fn hotseat(&mut self) -> Option<&Hotseat> {
        self.hotseat_at(Utc::now())
    }

    /// Current holder. An expired hotseat is cleared here.
    pub fn hotseat_at(&mut self, now: DateTime<Utc>) -> Option<&Hotseat> {
        if self.hotseat.as_ref().is_some_and(|h| h.expired_at(now)) {
            debug!("hotseat expired, clearing it");
            self.hotseat = None;
        }
        self.hotseat.as_ref()
    }

    pub fn authorize(
        &mut self,
        users: &mut UserDirectory,
        superusers: &BTreeSet<String>,
        username: &str,
        is_moderator: bool,
    ) -> Authorization {
        self.authorize_at(users, superusers, username, is_moderator, Utc::now())
    }

    /// Decide whether `username` may send input to the machine.
    ///
    /// Unknown users are added to `users`. Counting against the freebie cap
    /// happens here, so call this once per command.
    pub fn authorize_at(
        &mut self,
        users: &mut UserDirectory,
        superusers: &BTreeSet<String>,
        username: &str,
        is_moderator: bool,
        now: DateTime<Utc>,
    ) -> Authorization {
        let max_freebies = self.max_freebies;
        let hotseat = self.hotseat_at(now).map(|h| h.holder.clone());

        let user = users.entry(username);
        user.is_superuser = superusers.contains(&user.name);
        user.is_moderator = is_moderator;

        if user.is_privileged() {
            return Authorization::allow();
        }

        if let Some(holder) = hotseat.filter(|h| !h.eq_ignore_ascii_case(&user.name)) {
            return Authorization::deny(Some(format!(
                "Can't interact while {holder} is in the hotseat!"
            )));
        }

        match user.interact {
            Interact::Denied => Authorization::deny(None),
            Interact::Allowed => Authorization::allow(),
            Interact::Unset if max_freebies == 0 => Authorization::allow(),
            Interact::Unset if user.interaction_count < max_freebies => {
                user.interaction_count += 1;
                Authorization::allow()
            }
            Interact::Unset => Authorization::deny(Some(format!(
                "{}: Please follow the channel to continue interacting!",
                user.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superusers() -> BTreeSet<String> {
        BTreeSet::from(["owner".to_string()])
    }

    #[test]
    fn test_unknown_users_are_created_lazily() {
        let mut ac = AccessController::new(0);
        let mut users = UserDirectory::default();
        let auth = ac.authorize(&mut users, &superusers(), "Newbie", false);
        assert!(auth.allowed);
        let user = users.get("newbie").unwrap();
        assert_eq!(user.interact, Interact::Unset);
        assert!(!user.is_superuser);
    }

    #[test]
    fn test_freebie_cap_allows_exactly_n() {
        let mut ac = AccessController::new(2);
        let mut users = UserDirectory::default();
        let su = superusers();

        assert!(ac.authorize(&mut users, &su, "viewer", false).allowed);
        assert!(ac.authorize(&mut users, &su, "viewer", false).allowed);
        let third = ac.authorize(&mut users, &su, "viewer", false);
        assert!(!third.allowed);
        assert_eq!(
            third.message.as_deref(),
            Some("viewer: Please follow the channel to continue interacting!")
        );
        assert_eq!(users.get("viewer").unwrap().interaction_count, 2);
    }

    #[test]
    fn test_privileged_users_bypass_cap_and_hotseat() {
        let mut ac = AccessController::new(1);
        let mut users = UserDirectory::default();
        let su = superusers();
        ac.set_hotseat(Some("bob"), None);

        for _ in 0..5 {
            assert!(ac.authorize(&mut users, &su, "mod", true).allowed);
            assert!(ac.authorize(&mut users, &su, "owner", false).allowed);
        }
        assert!(users.get("owner").unwrap().is_superuser);
        assert!(users.get("mod").unwrap().is_moderator);
    }

    #[test]
    fn test_hotseat_excludes_everyone_else() {
        let mut ac = AccessController::new(0);
        let mut users = UserDirectory::default();
        let su = superusers();
        ac.set_hotseat(Some("@Bob"), None);

        let denied = ac.authorize(&mut users, &su, "alice", false);
        assert!(!denied.allowed);
        assert_eq!(
            denied.message.as_deref(),
            Some("Can't interact while Bob is in the hotseat!")
        );
        assert!(ac.authorize(&mut users, &su, "bob", false).allowed);
    }

    #[test]
    fn test_hotseat_holder_still_subject_to_deny() {
        let mut ac = AccessController::new(0);
        let mut users = UserDirectory::default();
        users.deny(&["bob"]);
        ac.set_hotseat(Some("bob"), None);
        let auth = ac.authorize(&mut users, &superusers(), "bob", false);
        assert!(!auth.allowed);
        assert!(auth.message.is_none());
    }

    #[test]
    fn test_hotseat_expires_on_read() {
        let mut ac = AccessController::new(0);
        let mut users = UserDirectory::default();
        let now = Utc::now();
        ac.set_hotseat_at(Some("bob"), Some(5), now);

        assert_eq!(ac.hotseat_at(now).unwrap().holder, "bob");
        assert_eq!(
            ac.hotseat_at(now + Duration::seconds(5)).unwrap().holder,
            "bob"
        );
        assert!(ac.hotseat_at(now + Duration::seconds(6)).is_none());

        let auth = ac.authorize_at(
            &mut users,
            &superusers(),
            "alice",
            false,
            now + Duration::seconds(6),
        );
        assert!(auth.allowed);
        assert!(auth.message.is_none());
    }

    #[test]
    fn test_huge_hotseat_duration_never_expires() {
        let mut ac = AccessController::new(0);
        ac.set_hotseat(Some("bob"), Some(10_000_000_000_000));
        let hotseat = ac.hotseat().unwrap();
        assert_eq!(hotseat.holder, "bob");
        assert!(hotseat.expires_at.is_none());

        ac.set_hotseat(Some("bob"), Some(u64::MAX));
        assert!(ac.hotseat().unwrap().expires_at.is_none());
    }

    #[test]
    fn test_clearing_hotseat() {
        let mut ac = AccessController::new(0);
        ac.set_hotseat(Some("bob"), Some(60));
        ac.set_hotseat(None, None);
        assert!(ac.hotseat().is_none());
    }

    #[test]
    fn test_policy_batches_lowercase_and_create() {
        let mut ac = AccessController::new(1);
        let mut users = UserDirectory::default();
        let su = superusers();

        users.allow(&["Alice", "@Carol"]);
        users.deny(&["DAVE"]);
        assert_eq!(users.get("alice").unwrap().interact, Interact::Allowed);
        assert_eq!(users.get("carol").unwrap().interact, Interact::Allowed);
        assert_eq!(users.get("dave").unwrap().interact, Interact::Denied);

        for _ in 0..3 {
            assert!(ac.authorize(&mut users, &su, "alice", false).allowed);
        }
        let denied = ac.authorize(&mut users, &su, "dave", false);
        assert!(!denied.allowed);
        assert!(denied.message.is_none());

        users.reset(&["dave"]);
        assert_eq!(users.get("dave").unwrap().interact, Interact::Unset);
        assert!(ac.authorize(&mut users, &su, "dave", false).allowed);
    }

    #[test]
    fn test_user_display() {
        let mut user = User::new("Eve");
        assert_eq!(user.to_string(), "eve");
        user.is_moderator = true;
        assert_eq!(user.to_string(), "Moderator: eve");
        user.is_superuser = true;
        assert_eq!(user.to_string(), "Superuser: eve");
    }

    #[test]
    fn test_directory_serializes_as_map() {
        let mut users = UserDirectory::default();
        users.allow(&["alice"]);
        let json = serde_json::to_value(&users).unwrap();
        assert_eq!(json["alice"]["interact"], "allowed");
        let back: UserDirectory = serde_json::from_value(json).unwrap();
        assert_eq!(back, users);
    }
}
