//! Challenge progression: flags unlock levels, levels select hints and
//! objectives.
//!
//! The level counter only moves forward and only through flag captures.
//! Hints are kept per level in a dense `order` sequence which is rebuilt
//! after every structural change.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{Flag, Hint, Objective, Provider, SubmissionOutcome};
use crate::errors::ChallengeError;

/// Shown when no override, level objective or configured default exists.
pub const NO_OBJECTIVE: &str = "There is no objective set at the moment";

type Result<T> = std::result::Result<T, ChallengeError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: i64,
    pub provider: Provider,
    /// Name of the machine backing this challenge
    pub name: String,
    #[serde(default)]
    level: u32,
    /// Flags in creation order
    #[serde(default)]
    flags: Vec<Flag>,
    #[serde(default)]
    hints: BTreeMap<u32, Vec<Hint>>,
    #[serde(default)]
    objectives: BTreeMap<u32, Objective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    objective_override: Option<String>,
}

impl Challenge {
    pub fn new(id: i64, provider: Provider, name: &str) -> Self {
        Self {
            id,
            provider,
            name: name.to_string(),
            level: 0,
            flags: Vec::new(),
            hints: BTreeMap::new(),
            objectives: BTreeMap::new(),
            objective_override: None,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    // ── Flags ───────────────────────────────────────────────────────────

    pub fn create_flag(
        &mut self,
        text: &str,
        unlock_level: u32,
        points: i64,
        location: Option<String>,
        description: Option<String>,
    ) -> Result<&Flag> {
        if self.flag(text).is_some() {
            return Err(ChallengeError::DuplicateFlag {
                text: text.to_string(),
            });
        }
        self.flags.push(
            Flag::new(text, unlock_level, points)
                .with_location(location)
                .with_description(description),
        );
        Ok(&self.flags[self.flags.len() - 1])
    }

    /// Remove a flag. Captured flags may be removed too; their points stop
    /// counting towards [`Challenge::points_for`].
    pub fn delete_flag(&mut self, text: &str) -> Result<Flag> {
        let idx = self
            .flags
            .iter()
            .position(|f| f.text == text)
            .ok_or_else(|| ChallengeError::FlagNotFound {
                text: text.to_string(),
            })?;
        Ok(self.flags.remove(idx))
    }

    pub fn flag(&self, text: &str) -> Option<&Flag> {
        self.flags.iter().find(|f| f.text == text)
    }

    /// Flags in scan order: ascending unlock level, then creation order.
    pub fn flags(&self) -> Vec<&Flag> {
        let mut flags: Vec<&Flag> = self.flags.iter().collect();
        // sort_by_key is stable, so creation order breaks ties
        flags.sort_by_key(|f| f.unlock_level);
        flags
    }

    pub fn validate_submission(&mut self, username: &str, free_text: &str) -> SubmissionOutcome {
        self.validate_submission_at(username, free_text, Utc::now())
    }

    /// Check `free_text` for a flag and capture the first match.
    ///
    /// Only the first flag (in [`Challenge::flags`] order) whose text occurs
    /// in `free_text` is evaluated, so one submission captures at most one
    /// flag.
    pub fn validate_submission_at(
        &mut self,
        username: &str,
        free_text: &str,
        now: DateTime<Utc>,
    ) -> SubmissionOutcome {
        let matched = self
            .scan_order()
            .into_iter()
            .find(|&idx| free_text.contains(self.flags[idx].text.as_str()));

        let Some(idx) = matched else {
            return SubmissionOutcome::NotFound;
        };

        let flag = &mut self.flags[idx];
        if !flag.capture(username, now) {
            return SubmissionOutcome::AlreadyCaptured {
                flag: flag.text.clone(),
            };
        }

        let outcome = SubmissionOutcome::Captured {
            flag: flag.text.clone(),
            points: flag.points,
        };
        let unlock_level = flag.unlock_level;
        if unlock_level > self.level {
            self.advance_to(unlock_level);
        }
        outcome
    }

    /// Total points of flags currently captured by `username`.
    pub fn points_for(&self, username: &str) -> i64 {
        self.flags
            .iter()
            .filter(|f| f.captured_by() == Some(username))
            .map(|f| f.points)
            .sum()
    }

    fn scan_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.flags.len()).collect();
        order.sort_by_key(|&idx| self.flags[idx].unlock_level);
        order
    }

    fn advance_to(&mut self, level: u32) {
        self.level = level;
        // A new level brings its own objective
        self.objective_override = None;
    }

    // ── Hints ───────────────────────────────────────────────────────────

    /// Append a hint to `level`. Returns its order within the level.
    pub fn create_hint(&mut self, text: &str, level: u32, cost: i64) -> Result<usize> {
        let hint = Hint::new(text, level, cost);
        let hints = self.hints.entry(level).or_default();
        if hints.contains(&hint) {
            return Err(ChallengeError::DuplicateHint { level });
        }
        hints.push(hint);
        let order = hints.len() - 1;
        self.renumber(level);
        Ok(order)
    }

    pub fn hints(&self, level: u32) -> &[Hint] {
        self.hints.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All hints grouped by ascending level.
    pub fn all_hints(&self) -> impl Iterator<Item = &Hint> {
        self.hints.values().flatten()
    }

    pub fn move_hint_up(&mut self, level: u32, order: usize) -> Result<()> {
        let hints = self.level_hints_mut(level, order)?;
        if order == 0 {
            return Err(ChallengeError::HintMovement {
                level,
                order,
                direction: "up",
            });
        }
        hints.swap(order - 1, order);
        self.renumber(level);
        Ok(())
    }

    pub fn move_hint_down(&mut self, level: u32, order: usize) -> Result<()> {
        let hints = self.level_hints_mut(level, order)?;
        if order + 1 >= hints.len() {
            return Err(ChallengeError::HintMovement {
                level,
                order,
                direction: "down",
            });
        }
        hints.swap(order, order + 1);
        self.renumber(level);
        Ok(())
    }

    pub fn delete_hint(&mut self, level: u32, order: usize) -> Result<Hint> {
        let hints = self.level_hints_mut(level, order)?;
        let removed = hints.remove(order);
        if hints.is_empty() {
            self.hints.remove(&level);
        } else {
            self.renumber(level);
        }
        Ok(removed)
    }

    /// Reveal the lowest-order unrevealed hint of the current level.
    pub fn reveal_next_hint(&mut self) -> Option<String> {
        let hints = self.hints.get_mut(&self.level)?;
        let hint = hints.iter_mut().find(|h| !h.is_revealed())?;
        hint.reveal();
        Some(hint.text.clone())
    }

    fn level_hints_mut(&mut self, level: u32, order: usize) -> Result<&mut Vec<Hint>> {
        match self.hints.get_mut(&level) {
            Some(hints) if order < hints.len() => Ok(hints),
            _ => Err(ChallengeError::HintNotFound { level, order }),
        }
    }

    fn renumber(&mut self, level: u32) {
        if let Some(hints) = self.hints.get_mut(&level) {
            for (idx, hint) in hints.iter_mut().enumerate() {
                hint.order = idx;
            }
        }
    }

    // ── Objectives ──────────────────────────────────────────────────────

    pub fn create_objective(&mut self, text: &str, level: u32) -> Result<()> {
        if self.objectives.contains_key(&level) {
            return Err(ChallengeError::ObjectiveAlreadyExists { level });
        }
        self.objectives.insert(
            level,
            Objective {
                text: text.to_string(),
                level,
            },
        );
        Ok(())
    }

    pub fn delete_objective(&mut self, level: u32) -> Result<Objective> {
        self.objectives
            .remove(&level)
            .ok_or(ChallengeError::ObjectiveNotFound { level })
    }

    pub fn objectives(&self) -> impl Iterator<Item = &Objective> {
        self.objectives.values()
    }

    pub fn objective_override(&self) -> Option<&str> {
        self.objective_override.as_deref()
    }

    pub fn set_objective_override(&mut self, text: &str) {
        self.objective_override = Some(text.to_string());
    }

    pub fn reset_objective(&mut self) {
        self.objective_override = None;
    }

    /// Resolve the objective shown to the audience.
    ///
    /// Precedence: override, then the objective of the highest configured
    /// level not above the current one, then `default`, then [`NO_OBJECTIVE`].
    pub fn current_objective(&self, default: Option<&str>) -> String {
        if let Some(text) = &self.objective_override {
            return text.clone();
        }
        if let Some((_, objective)) = self.objectives.range(..=self.level).next_back() {
            return objective.text.clone();
        }
        default
            .filter(|d| !d.is_empty())
            .unwrap_or(NO_OBJECTIVE)
            .to_string()
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.name, self.provider)
    }
}
