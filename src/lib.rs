//! crowdbox: a chat-controlled challenge machine orchestrator.
//!
//! Viewers drive a virtual machine through chat commands, capture flags by
//! whisper and unlock hints and objectives level by level. The operator
//! manages profiles, challenges and the machine from a console.

pub mod access;
pub mod challenge;
pub mod config;
pub mod console;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod profile;
pub mod resource;
pub mod session;
pub mod store;
