//! Challenge progression engine.

pub mod engine;
pub mod models;

pub use engine::{Challenge, NO_OBJECTIVE};
pub use models::{Flag, Hint, Objective, Provider, SubmissionOutcome};
