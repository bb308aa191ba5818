// Wire boundary to the messaging provider's persistent bidirectional channel.
// Inbound frames and outbound commands are closed tagged unions; anything the
// provider sends that does not parse is logged and dropped, never fatal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_stream::wrappers::LinesStream;

use crate::models::{Contact, Message, MessageStatus};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Typing indicator state as understood by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingState {
    Composing,
    Paused,
}

/// Tagged events delivered by the transport channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    Contacts {
        contacts: Vec<Contact>,
    },
    Message {
        message: Message,
    },
    MessagesLoaded {
        contact_id: String,
        messages: Vec<Message>,
        #[serde(default)]
        next_cursor: Option<i64>,
    },
    Status {
        id: String,
        status: MessageStatus,
    },
    Reaction {
        message_id: String,
        from: String,
        emoji: String,
    },
    IdUpdate {
        old_id: String,
        new_id: String,
    },
    ContactUpdate {
        id: String,
        #[serde(default)]
        custom_name: Option<String>,
    },
    Typing {
        contact_id: String,
        state: TypingState,
    },
    CallCreated {
        call_id: String,
    },
    CallIncoming {
        call_id: String,
        from: String,
        #[serde(default)]
        caller_name: Option<String>,
        sdp: String,
    },
    CallAnswered {
        call_id: String,
        sdp: String,
    },
    CallEnded {
        #[serde(default)]
        call_id: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Tagged commands accepted by the transport channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    GetMessages {
        contact_id: String,
        limit: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_timestamp: Option<i64>,
    },
    SendMessage {
        to: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        /// Provisional id assigned locally; the provider reports its
        /// canonical id later through an id_update event.
        local_id: String,
    },
    SendTemplate {
        to: String,
        template_name: String,
        language: String,
        local_id: String,
    },
    SendInteractive {
        to: String,
        payload: serde_json::Value,
        local_id: String,
    },
    Typing {
        to: String,
        state: TypingState,
    },
    Read {
        message_id: String,
    },
    Reaction {
        to: String,
        message_id: String,
        emoji: String,
    },
    UpdateContact {
        contact_id: String,
        name: String,
    },
    ToggleFavorite {
        contact_id: String,
    },
    CallStart {
        to: String,
        sdp: String,
    },
    CallAccept {
        call_id: String,
        sdp: String,
    },
    CallReject {
        call_id: String,
    },
    CallTerminate {
        call_id: String,
    },
}

/// Parse one inbound frame. Callers log and drop the frame on error; a
/// malformed event must never take the engine down.
pub fn parse_event(raw: &str) -> Result<TransportEvent> {
    serde_json::from_str(raw).with_context(|| format!("unparseable transport frame: {:.200}", raw))
}

/// Outbound half of the transport channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, command: Command) -> Result<(), TransportError>;
}

/// JSON-lines transport over an arbitrary writer, used by the headless
/// binary to talk to a gateway process: one command per line out, one event
/// per line in (see [`spawn_event_reader`]).
pub struct LineTransport {
    writer: TokioMutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl LineTransport {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        LineTransport {
            writer: TokioMutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn send(&self, command: Command) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(&command)?;
        line.push('\n');
        debug!("Sending command: {}", line.trim_end());
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Read newline-delimited events from `reader` in a background task,
/// forwarding every frame that parses. Malformed frames are logged and
/// dropped. The returned channel closes when the reader is exhausted.
pub fn spawn_event_reader<R>(reader: R) -> mpsc::Receiver<TransportEvent>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Error reading transport stream: {}", e);
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_event(line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!("Event receiver dropped; stopping transport reader");
                        break;
                    }
                }
                Err(e) => warn!("Dropping malformed inbound event: {:#}", e),
            }
        }
        debug!("Transport stream ended");
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    #[test]
    fn parses_message_event() {
        let raw = r#"{
            "type": "message",
            "message": {
                "id": "wamid.A1",
                "from": "123",
                "to": "me",
                "kind": "text",
                "content": "hello",
                "timestamp": 100,
                "status": "delivered",
                "direction": "incoming"
            }
        }"#;
        match parse_event(raw).unwrap() {
            TransportEvent::Message { message } => {
                assert_eq!(message.id, "wamid.A1");
                assert_eq!(message.direction, Direction::Incoming);
                assert_eq!(message.status, MessageStatus::Delivered);
            }
            other => panic!("Expected message event, got {:?}", other),
        }
    }

    #[test]
    fn parses_id_update_and_status_events() {
        let remap = parse_event(r#"{"type":"id_update","old_id":"tmp_1","new_id":"wamid.XYZ"}"#)
            .unwrap();
        assert!(matches!(remap, TransportEvent::IdUpdate { ref old_id, ref new_id }
            if old_id == "tmp_1" && new_id == "wamid.XYZ"));

        let status = parse_event(r#"{"type":"status","id":"wamid.XYZ","status":"read"}"#).unwrap();
        assert!(matches!(status, TransportEvent::Status { status: MessageStatus::Read, .. }));
    }

    #[test]
    fn unknown_message_kind_maps_to_unknown() {
        let raw = r#"{
            "type": "message",
            "message": {
                "id": "m1", "from": "123", "to": "me",
                "kind": "hologram",
                "content": "", "timestamp": 1, "direction": "incoming"
            }
        }"#;
        match parse_event(raw).unwrap() {
            TransportEvent::Message { message } => {
                assert_eq!(message.kind, crate::models::MessageKind::Unknown);
            }
            other => panic!("Expected message event, got {:?}", other),
        }
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(parse_event("{not json").is_err());
        assert!(parse_event(r#"{"type":"no_such_event"}"#).is_err());
    }

    #[test]
    fn command_encoding_carries_snake_case_tags() {
        let cmd = Command::GetMessages {
            contact_id: "123".to_string(),
            limit: 50,
            before_timestamp: None,
        };
        let encoded = serde_json::to_value(&cmd).unwrap();
        assert_eq!(encoded["type"], "get_messages");
        assert_eq!(encoded["limit"], 50);
        assert!(encoded.get("before_timestamp").is_none());

        let call = Command::CallAccept {
            call_id: "c1".to_string(),
            sdp: "v=0".to_string(),
        };
        let encoded = serde_json::to_value(&call).unwrap();
        assert_eq!(encoded["type"], "call_accept");
    }
}
