//! # Voice WebSocket Handler
//!
//! Clients connect to `/ws/voice` and exchange two kinds of frames:
//! - **Text**: JSON envelopes (see [`crate::protocol`])
//! - **Binary**: raw 16-bit PCM audio, client → server for recognition and
//!   server → client for synthesized speech
//!
//! ## Actor Model:
//! Each connection is an actix actor that only does transport work. Frames
//! are handed to the session registry's connection loop over a channel, and
//! everything the loop wants to send comes back through a second channel
//! that the actor consumes as a stream. Fragmented websocket messages are
//! reassembled here before they are handed on.
//!
//! ## Heartbeat:
//! The server pings every 30 seconds and drops connections that have not
//! answered within 60 seconds.

use crate::protocol::ClientFrame;
use crate::session::{InboundFrame, SessionRegistry};
use crate::state::AppState;
use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentKind {
    Text,
    Binary,
}

/// Accumulates a fragmented websocket message.
#[derive(Debug)]
struct FragmentBuffer {
    kind: FragmentKind,
    data: BytesMut,
}

pub struct VoiceWebSocket {
    registry: Arc<SessionRegistry>,
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,
    fragments: Option<FragmentBuffer>,
    max_message_bytes: usize,
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(registry: Arc<SessionRegistry>, max_message_bytes: usize) -> Self {
        Self {
            registry,
            inbound: None,
            fragments: None,
            max_message_bytes,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .inbound
            .as_ref()
            .map(|inbound| inbound.send(frame).is_ok())
            .unwrap_or(false);
        if !delivered {
            warn!("Connection loop is gone, closing websocket");
            ctx.stop();
        }
    }

    fn handle_continuation(&mut self, item: Item, ctx: &mut ws::WebsocketContext<Self>) {
        match self.accept_fragment(item) {
            Ok(Some(frame)) => self.forward(frame, ctx),
            Ok(None) => {}
            Err(code) => {
                ctx.close(Some(code.into()));
                ctx.stop();
            }
        }
    }

    /// Feed one continuation item. Returns the reassembled frame once the
    /// final fragment arrives, or the close code to end the connection with.
    fn accept_fragment(&mut self, item: Item) -> Result<Option<InboundFrame>, ws::CloseCode> {
        match item {
            Item::FirstText(data) => self.begin_fragments(FragmentKind::Text, data),
            Item::FirstBinary(data) => self.begin_fragments(FragmentKind::Binary, data),
            Item::Continue(data) => self.append_fragment(&data)?,
            Item::Last(data) => {
                self.append_fragment(&data)?;
                let Some(buffer) = self.fragments.take() else {
                    warn!("Final fragment without a started message");
                    return Ok(None);
                };
                let bytes = buffer.data.freeze();
                debug!(bytes = bytes.len(), kind = ?buffer.kind, "Reassembled fragmented message");
                let frame = match buffer.kind {
                    FragmentKind::Text => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => InboundFrame::Text(text),
                        Err(e) => {
                            warn!(error = %e, "Fragmented text message is not valid UTF-8");
                            return Err(ws::CloseCode::Invalid);
                        }
                    },
                    FragmentKind::Binary => InboundFrame::Binary(bytes),
                };
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn begin_fragments(&mut self, kind: FragmentKind, data: Bytes) {
        if self.fragments.is_some() {
            warn!("New fragmented message started before the previous one finished");
        }
        let mut buffer = BytesMut::with_capacity(data.len());
        buffer.extend_from_slice(&data);
        self.fragments = Some(FragmentBuffer { kind, data: buffer });
    }

    fn append_fragment(&mut self, data: &[u8]) -> Result<(), ws::CloseCode> {
        let Some(buffer) = self.fragments.as_mut() else {
            warn!("Continuation fragment without a started message");
            return Ok(());
        };
        if buffer.data.len() + data.len() > self.max_message_bytes {
            warn!(limit = self.max_message_bytes, "Fragmented message exceeds size limit, closing");
            self.fragments = None;
            return Err(ws::CloseCode::Size);
        }
        buffer.data.extend_from_slice(data);
        Ok(())
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Voice websocket connected");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.inbound = Some(inbound_tx);
        ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));
        tokio::spawn(self.registry.clone().serve_connection(inbound_rx, outbound_tx));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Websocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Dropping the inbound sender ends the connection loop, which ends the
    /// bound session.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Voice websocket disconnected");
        self.inbound = None;
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(InboundFrame::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward(InboundFrame::Binary(data), ctx);
            }
            Ok(ws::Message::Continuation(item)) => {
                self.handle_continuation(item, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Websocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Frames produced by the connection loop.
impl StreamHandler<ClientFrame> for VoiceWebSocket {
    fn handle(&mut self, frame: ClientFrame, ctx: &mut Self::Context) {
        match frame {
            ClientFrame::Text(text) => ctx.text(text),
            ClientFrame::Binary(audio) => ctx.binary(audio),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Connection loop finished, closing websocket");
        ctx.stop();
    }
}

/// Upgrade an HTTP request to a voice websocket.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New voice websocket request from: {:?}", req.connection_info().peer_addr());

    let max_frame_bytes = app_state.get_config().server.max_frame_bytes;
    let actor = VoiceWebSocket::new(app_state.registry.clone(), max_frame_bytes);

    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engines::testing::Fakes;
    use crate::persona::PersonaStore;

    fn actor(limit: usize) -> VoiceWebSocket {
        let fakes = Fakes::new();
        let app = AppConfig::default();
        let registry = Arc::new(SessionRegistry::new(
            app.session.clone(),
            app.audio_format(),
            16_000,
            fakes.engine_set(),
            Arc::new(PersonaStore::with_builtin("default")),
        ));
        VoiceWebSocket::new(registry, limit)
    }

    #[test]
    fn test_fragment_buffer_accumulates() {
        let mut socket = actor(16);
        socket.begin_fragments(FragmentKind::Binary, Bytes::from_static(b"abc"));
        assert!(socket.append_fragment(b"def").is_ok());
        let buffer = socket.fragments.as_ref().unwrap();
        assert_eq!(&buffer.data[..], b"abcdef");
        assert_eq!(buffer.kind, FragmentKind::Binary);
    }

    #[test]
    fn test_fragment_buffer_enforces_limit() {
        let mut socket = actor(8);
        socket.begin_fragments(FragmentKind::Text, Bytes::from_static(b"12345"));
        assert!(socket.append_fragment(b"678").is_ok());
        assert_eq!(socket.append_fragment(b"9"), Err(ws::CloseCode::Size));
        assert!(socket.fragments.is_none());
    }

    #[test]
    fn test_continuation_items_reassemble_text() {
        let mut socket = actor(64);
        assert_eq!(socket.accept_fragment(Item::FirstText(Bytes::from_static(b"{\"type\":"))), Ok(None));
        assert_eq!(socket.accept_fragment(Item::Continue(Bytes::from_static(b"\"pi"))), Ok(None));
        let frame = socket.accept_fragment(Item::Last(Bytes::from_static(b"ng\"}"))).unwrap();
        assert_eq!(frame, Some(InboundFrame::Text(r#"{"type":"ping"}"#.to_string())));
        assert!(socket.fragments.is_none());
    }

    #[test]
    fn test_continuation_items_reassemble_binary() {
        let mut socket = actor(64);
        socket.accept_fragment(Item::FirstBinary(Bytes::from_static(&[1, 2]))).unwrap();
        let frame = socket.accept_fragment(Item::Last(Bytes::from_static(&[3]))).unwrap();
        assert_eq!(frame, Some(InboundFrame::Binary(Bytes::from_static(&[1, 2, 3]))));
    }

    #[test]
    fn test_continuation_rejects_invalid_utf8_and_oversize() {
        let mut socket = actor(64);
        socket.accept_fragment(Item::FirstText(Bytes::from_static(&[0xff]))).unwrap();
        assert_eq!(
            socket.accept_fragment(Item::Last(Bytes::from_static(&[0xfe]))),
            Err(ws::CloseCode::Invalid)
        );

        let mut socket = actor(4);
        socket.accept_fragment(Item::FirstBinary(Bytes::from_static(b"abc"))).unwrap();
        assert_eq!(
            socket.accept_fragment(Item::Continue(Bytes::from_static(b"de"))),
            Err(ws::CloseCode::Size)
        );
    }

    #[test]
    fn test_new_message_replaces_unfinished_fragments() {
        let mut socket = actor(64);
        socket.begin_fragments(FragmentKind::Text, Bytes::from_static(b"stale"));
        socket.begin_fragments(FragmentKind::Binary, Bytes::from_static(b"fresh"));
        let buffer = socket.fragments.as_ref().unwrap();
        assert_eq!(&buffer.data[..], b"fresh");
        assert_eq!(buffer.kind, FragmentKind::Binary);
    }
}
