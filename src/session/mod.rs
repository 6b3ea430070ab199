//! # Voice Sessions
//!
//! A voice session pairs one client connection with one streaming
//! transcriber at a time and runs the conversation loop:
//!
//! ```text
//! audio ─▶ transcriber ─▶ sentence end ─▶ chat model ─▶ synthesizer ─▶ audio
//! ```
//!
//! ## Components
//! - [`SessionRegistry`]: owns all sessions and the engines they share
//! - [`Session`]: per-session state (persona, engine handles, activity)
//! - [`KeepAliveScheduler`]: silence frames for idle transcribers
//! - `reaper`: ends sessions idle past the timeout
//! - `connection`: ordered handling of one client's frames

pub mod connection;
pub mod context;
pub mod keepalive;
pub mod reaper;
pub mod registry;
pub mod synthesis;
pub mod transcription;

pub use connection::{Connection, InboundFrame};
pub use context::Session;
pub use keepalive::KeepAliveScheduler;
pub use reaper::spawn_reaper;
pub use registry::{RegistrySnapshot, SessionRegistry};
