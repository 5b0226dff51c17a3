use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ChallengeError;

/// Virtualization product a challenge machine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    VirtualBox,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtualBox => "virtualbox",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ChallengeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "virtualbox" => Ok(Self::VirtualBox),
            _ => Err(ChallengeError::UnknownProvider(s.to_string())),
        }
    }
}

/// A secret string hidden inside the challenge machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    pub text: String,
    /// Level this flag unlocks when captured
    pub unlock_level: u32,
    pub points: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    captured_by: Option<String>,
    #[serde(default)]
    captured_at: Option<DateTime<Utc>>,
}

impl Flag {
    pub fn new(text: &str, unlock_level: u32, points: i64) -> Self {
        Self {
            text: text.to_string(),
            unlock_level,
            points,
            location: None,
            description: None,
            captured_by: None,
            captured_at: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn is_captured(&self) -> bool {
        self.captured_by.is_some()
    }

    pub fn captured_by(&self) -> Option<&str> {
        self.captured_by.as_deref()
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at
    }

    /// Mark the flag as captured. Returns `false` and leaves the flag
    /// untouched if someone already holds it.
    pub fn capture(&mut self, username: &str, at: DateTime<Utc>) -> bool {
        if self.is_captured() {
            return false;
        }
        self.captured_by = Some(username.to_string());
        self.captured_at = Some(at);
        true
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flag: {:<60} Level: {}\tPoints value: {}",
            self.text, self.unlock_level, self.points
        )?;
        match &self.captured_by {
            Some(user) => write!(f, "  \tCaptured by: {}", user),
            None => write!(f, "  \tNot captured"),
        }
    }
}

/// A clue scoped to one level, revealed in `order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hint {
    pub text: String,
    pub level: u32,
    pub cost: i64,
    pub order: usize,
    #[serde(default)]
    revealed: bool,
}

impl Hint {
    pub fn new(text: &str, level: u32, cost: i64) -> Self {
        Self {
            text: text.to_string(),
            level,
            cost,
            order: 0,
            revealed: false,
        }
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    pub(crate) fn reveal(&mut self) {
        self.revealed = true;
    }
}

impl PartialEq for Hint {
    fn eq(&self, other: &Self) -> bool {
        self.level == other.level && self.text == other.text
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID: {}\tCost: {}\tRevealed: {}\tHint: {}",
            self.order, self.cost, self.revealed, self.text
        )
    }
}

/// Goal text shown to the audience while a level is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub text: String,
    pub level: u32,
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Level: {}\tObjective: {}", self.level, self.text)
    }
}

/// Result of checking free text for a flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Captured { flag: String, points: i64 },
    AlreadyCaptured { flag: String },
    NotFound,
}

impl SubmissionOutcome {
    pub fn is_captured(&self) -> bool {
        matches!(self, Self::Captured { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("VirtualBox".parse::<Provider>().unwrap(), Provider::VirtualBox);
        assert!(matches!(
            "vmware".parse::<Provider>(),
            Err(ChallengeError::UnknownProvider(p)) if p == "vmware"
        ));
    }

    #[test]
    fn flag_capture_is_write_once() {
        let mut flag = Flag::new("FLAG{one}", 1, 10);
        assert!(!flag.is_captured());
        assert!(flag.capture("alice", Utc::now()));
        assert!(!flag.capture("bob", Utc::now()));
        assert_eq!(flag.captured_by(), Some("alice"));
        assert!(flag.captured_at().is_some());
    }

    #[test]
    fn flag_display_shows_capture_state() {
        let mut flag = Flag::new("FLAG{two}", 2, 5);
        assert!(flag.to_string().contains("Not captured"));
        flag.capture("carol", Utc::now());
        assert!(flag.to_string().contains("Captured by: carol"));
    }

    #[test]
    fn hints_compare_by_text_within_level() {
        let a = Hint::new("look in /tmp", 1, 0);
        let mut b = Hint::new("look in /tmp", 1, 50);
        b.order = 3;
        let c = Hint::new("look in /tmp", 2, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn flag_serde_keeps_capture() {
        let mut flag = Flag::new("FLAG{x}", 0, 1).with_location(Some("/root".into()));
        flag.capture("dave", Utc::now());
        let json = serde_json::to_string(&flag).unwrap();
        let back: Flag = serde_json::from_str(&json).unwrap();
        assert_eq!(back.captured_by(), Some("dave"));
        assert_eq!(back.location.as_deref(), Some("/root"));
    }
}
