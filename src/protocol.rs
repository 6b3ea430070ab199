//! # Voice Session Wire Protocol
//!
//! Every text frame on the voice websocket is a JSON envelope with a `type`
//! discriminator and a flat set of optional camelCase fields:
//!
//! ```json
//! {"type": "audio_chunk", "sessionId": "s1", "data": "<base64>", "chunkId": "c7",
//!  "chunkIndex": 0, "totalChunks": 3, "timestamp": 1735689600000}
//! ```
//!
//! Inbound envelopes are decoded once, at the edge, into the closed
//! [`InboundMessage`] enum. Outbound messages are built as [`Outbound`] values
//! and encoded back into the same envelope shape. Binary frames carry raw PCM
//! in both directions and bypass this module.
//!
//! ## Inbound Types
//! `start_session`, `end_session`, `audio_chunk`, `process_text`, `ping`,
//! `start_transcriber`, `change_character`, `stop_tts`
//!
//! ## Outbound Types
//! `status`, `error`, `transcription_result`, `ai_response`, `audio_synthesis`, `pong`

use crate::error::{VoiceError, VoiceResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::error;

/// The JSON shape shared by all text frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

/// Fragment metadata carried by a chunked `audio_chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub index: u32,
    pub total: u32,
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Blank ids are normalised to `None` so the registry can pick defaults.
    StartSession {
        session_id: Option<String>,
        character: Option<String>,
    },
    EndSession,
    AudioChunk {
        data: String,
        chunk: Option<ChunkMeta>,
    },
    ProcessText {
        text: String,
    },
    Ping,
    StartTranscriber,
    ChangeCharacter {
        character: String,
    },
    StopTts,
}

/// Decode a text frame.
///
/// The size guard runs before any parsing, so an oversized payload is
/// rejected even when it is not valid JSON.
pub fn decode_text(payload: &str, max_chars: usize) -> VoiceResult<InboundMessage> {
    let len = payload.chars().count();
    if len > max_chars {
        return Err(VoiceError::MessageTooLarge { len, limit: max_chars });
    }

    let envelope: Envelope = serde_json::from_str(payload)
        .map_err(|e| VoiceError::Protocol(format!("invalid JSON envelope: {}", e)))?;
    InboundMessage::try_from(envelope)
}

impl TryFrom<Envelope> for InboundMessage {
    type Error = VoiceError;

    fn try_from(envelope: Envelope) -> VoiceResult<Self> {
        let kind = envelope
            .kind
            .as_deref()
            .ok_or_else(|| VoiceError::Protocol("missing message type".to_string()))?;

        let message = match kind {
            "start_session" => InboundMessage::StartSession {
                session_id: non_blank(envelope.session_id),
                character: non_blank(envelope.character),
            },
            "end_session" => InboundMessage::EndSession,
            "audio_chunk" => InboundMessage::AudioChunk {
                chunk: chunk_meta(&envelope)?,
                data: envelope.data.unwrap_or_default(),
            },
            "process_text" => InboundMessage::ProcessText {
                text: envelope.data.unwrap_or_default(),
            },
            "ping" => InboundMessage::Ping,
            "start_transcriber" => InboundMessage::StartTranscriber,
            "change_character" => InboundMessage::ChangeCharacter {
                character: envelope.character.unwrap_or_default(),
            },
            "stop_tts" => InboundMessage::StopTts,
            other => {
                return Err(VoiceError::Protocol(format!("unknown message type: {}", other)));
            }
        };
        Ok(message)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Chunk metadata is all-or-nothing: either the message is unchunked or it
/// carries id, index and total together.
fn chunk_meta(envelope: &Envelope) -> VoiceResult<Option<ChunkMeta>> {
    match (&envelope.chunk_id, envelope.chunk_index, envelope.total_chunks) {
        (None, None, None) => Ok(None),
        (Some(chunk_id), Some(index), Some(total)) => Ok(Some(ChunkMeta {
            chunk_id: chunk_id.clone(),
            index,
            total,
        })),
        _ => Err(VoiceError::Protocol(
            "chunked audio requires chunkId, chunkIndex and totalChunks".to_string(),
        )),
    }
}

/// A message the server sends to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Status {
        session_id: Option<String>,
        status: String,
    },
    Error {
        session_id: Option<String>,
        error: String,
    },
    Transcription {
        session_id: String,
        text: String,
        is_final: bool,
    },
    AiResponse {
        session_id: String,
        text: String,
        is_streaming: bool,
    },
    /// Aggregated synthesized audio, base64 encoded.
    AudioSynthesis {
        session_id: String,
        audio: String,
        is_complete: bool,
    },
    Pong {
        session_id: Option<String>,
    },
}

impl Outbound {
    pub fn status(session_id: &str, status: impl Into<String>) -> Self {
        Outbound::Status {
            session_id: Some(session_id.to_string()),
            status: status.into(),
        }
    }

    pub fn error(session_id: Option<&str>, error: impl Into<String>) -> Self {
        Outbound::Error {
            session_id: session_id.map(str::to_string),
            error: error.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Status { .. } => "status",
            Outbound::Error { .. } => "error",
            Outbound::Transcription { .. } => "transcription_result",
            Outbound::AiResponse { .. } => "ai_response",
            Outbound::AudioSynthesis { .. } => "audio_synthesis",
            Outbound::Pong { .. } => "pong",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut envelope = Envelope {
            kind: Some(self.kind().to_string()),
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            ..Envelope::default()
        };

        match self {
            Outbound::Status { session_id, status } => {
                envelope.session_id = session_id.clone();
                envelope.status = Some(status.clone());
            }
            Outbound::Error { session_id, error } => {
                envelope.session_id = session_id.clone();
                envelope.error = Some(error.clone());
            }
            Outbound::Transcription { session_id, text, is_final } => {
                envelope.session_id = Some(session_id.clone());
                envelope.data = Some(text.clone());
                envelope.is_final = Some(*is_final);
            }
            Outbound::AiResponse { session_id, text, is_streaming } => {
                envelope.session_id = Some(session_id.clone());
                envelope.data = Some(text.clone());
                envelope.is_streaming = Some(*is_streaming);
            }
            Outbound::AudioSynthesis { session_id, audio, is_complete } => {
                envelope.session_id = Some(session_id.clone());
                envelope.data = Some(audio.clone());
                envelope.is_complete = Some(*is_complete);
            }
            Outbound::Pong { session_id } => {
                envelope.session_id = session_id.clone();
            }
        }
        envelope
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(&self.to_envelope()).unwrap_or_else(|e| {
            error!(kind = self.kind(), error = %e, "Failed to encode outbound message");
            r#"{"type":"error","error":"failed to encode message"}"#.to_string()
        })
    }
}

/// A frame queued for the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
}

impl From<Outbound> for ClientFrame {
    fn from(message: Outbound) -> Self {
        ClientFrame::Text(message.encode())
    }
}
