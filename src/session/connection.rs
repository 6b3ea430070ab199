//! Per-connection message loop.
//!
//! The websocket actor hands every client frame to [`SessionRegistry::serve_connection`]
//! over a channel, and the loop handles them strictly in arrival order. A
//! connection binds to at most one live session at a time. Errors are sent
//! back as `error` envelopes and never close the connection; when the
//! transport goes away the bound session is ended.
//!
//! The binding is to the session object, not its id: once the bound session
//! is ended or reaped, a later session that reuses the id belongs to whoever
//! created it and is invisible to this connection.

use super::context::Session;
use super::registry::SessionRegistry;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{decode_text, ClientFrame, InboundMessage, Outbound};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A frame received from the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
}

/// Transport-side state of one client connection.
pub struct Connection {
    session_id: Option<String>,
    session: Weak<Session>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

impl Connection {
    pub fn new(outbound: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self {
            session_id: None,
            session: Weak::new(),
            outbound,
        }
    }

    fn bind(&mut self, session: &Arc<Session>) {
        self.session_id = Some(session.id().to_string());
        self.session = Arc::downgrade(session);
    }

    fn unbind(&mut self) {
        self.session_id = None;
        self.session = Weak::new();
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn send(&self, message: Outbound) {
        let _ = self.outbound.send(message.into());
    }
}

impl SessionRegistry {
    /// Drive one client connection until its inbound channel closes.
    pub async fn serve_connection(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
        outbound: mpsc::UnboundedSender<ClientFrame>,
    ) {
        let mut connection = Connection::new(outbound);
        connection.send(Outbound::Status {
            session_id: None,
            status: "connected, send start_session to begin".to_string(),
        });

        while let Some(frame) = inbound.recv().await {
            let result = match frame {
                InboundFrame::Text(payload) => self.handle_text(&mut connection, &payload).await,
                InboundFrame::Binary(audio) => self.handle_binary(&connection, audio).await,
            };

            if let Err(e) = result {
                warn!(session_id = ?connection.session_id(), error = %e, "Rejected client message");
                connection.send(Outbound::error(connection.session_id(), e.to_string()));
            }
        }

        match self.bound_session(&connection) {
            Ok(session) => {
                info!(session_id = %session.id(), "Connection closed, ending session");
                self.end_exact_session(&session).await;
            }
            Err(_) => debug!("Connection closed without a live session"),
        }
    }

    pub async fn handle_text(self: &Arc<Self>, connection: &mut Connection, payload: &str) -> VoiceResult<()> {
        let message = decode_text(payload, self.config.max_text_message_chars)?;
        self.dispatch(connection, message).await
    }

    /// Binary frames are raw PCM for the bound session.
    pub async fn handle_binary(&self, connection: &Connection, audio: Bytes) -> VoiceResult<()> {
        let session = self.bound_session(connection)?;
        session.touch();
        self.feed_audio(&session, audio).await
    }

    pub async fn dispatch(self: &Arc<Self>, connection: &mut Connection, message: InboundMessage) -> VoiceResult<()> {
        match message {
            InboundMessage::StartSession { session_id, character } => {
                if let Ok(existing) = self.bound_session(connection) {
                    return Err(VoiceError::SessionExists(existing.id().to_string()));
                }
                let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                let persona_id = character.unwrap_or_else(|| self.personas.default_id().to_string());

                let session = self
                    .create_session(&session_id, connection.outbound.clone(), &persona_id)
                    .await?;
                connection.bind(&session);
                Ok(())
            }
            InboundMessage::Ping => {
                if let Ok(session) = self.bound_session(connection) {
                    session.touch();
                }
                connection.send(Outbound::Pong {
                    session_id: connection.session_id.clone(),
                });
                Ok(())
            }
            InboundMessage::EndSession => {
                let session = self.bound_session(connection)?;
                self.end_exact_session(&session).await;
                connection.unbind();
                Ok(())
            }
            InboundMessage::AudioChunk { data, chunk } => {
                let session = self.bound_session(connection)?;
                session.touch();
                self.accept_audio_chunk(&session, &data, chunk).await
            }
            InboundMessage::ProcessText { text } => {
                let session = self.bound_session(connection)?;
                session.touch();
                self.process_text(&session, &text).await
            }
            InboundMessage::StartTranscriber => {
                let session = self.bound_session(connection)?;
                session.touch();
                self.restart_transcription(&session).await
            }
            InboundMessage::ChangeCharacter { character } => {
                let session = self.bound_session(connection)?;
                session.touch();
                self.change_persona(&session, &character)
            }
            InboundMessage::StopTts => {
                let session = self.bound_session(connection)?;
                session.touch();
                self.cancel_synthesis(&session).await;
                Ok(())
            }
        }
    }

    /// The connection's own session, if it is still the live one.
    fn bound_session(&self, connection: &Connection) -> VoiceResult<Arc<Session>> {
        connection
            .session
            .upgrade()
            .filter(|session| self.is_current(session))
            .ok_or(VoiceError::SessionNotActive)
    }
}
