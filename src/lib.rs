//! Reflog chat — streaming consumer for the multi-agent deliberation backend.

pub mod chat;
pub mod config;
pub mod error;
pub mod safety;
