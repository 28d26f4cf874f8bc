//! Deskhand - a chat agent wired into a live DAW session.
//!
//! Library exposing core modules for testing and reuse.

pub mod agent;
pub mod channel;
pub mod events;
pub mod indexer;
pub mod mixer;
pub mod observer;
pub mod sessions;
pub mod telemetry;
pub mod web;
