//! # Audio Handling
//!
//! Inbound audio for a voice session arrives either as binary websocket
//! frames or as base64 `audio_chunk` messages that may be split into indexed
//! fragments.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz by default (configurable)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono by default
//! - **Encoding**: Little-endian signed integers

pub mod chunks; // Fragment reassembly for audio_chunk messages
pub mod processor; // Frame gating, keep-alive frames, PCM level helpers
