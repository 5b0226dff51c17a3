//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled         |
//! |-----------|--------------------------|
//! | `run`     | `Run`, `Status`          |
//! | `records` | `Profile`, `Challenge`   |
//! | `config`  | `Config`                 |

pub mod config;
pub mod records;
pub mod run;

pub use config::cmd_config;
pub use records::{cmd_challenge, cmd_profile};
pub use run::{cmd_run, cmd_status};
