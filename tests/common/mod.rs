// Common test utilities for integration tests
// This module contains shared code for all integration tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};

use anyhow::Result;
use async_trait::async_trait;
use log::LevelFilter;

use parley::call::{MediaConnectionState, MediaSession, MediaStack};
use parley::models::{Direction, Message, MessageKind, MessageStatus};
use parley::sync::SyncClient;
use parley::transport::{Command, Transport, TransportError};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Transport double that records every command it is handed.
#[derive(Default)]
pub struct MockTransport {
    pub sent: Mutex<Vec<Command>>,
    pub fail_next: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport::default())
    }

    pub fn sent_commands(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_command(&self) -> Option<Command> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn fail_next_send(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, command: Command) -> Result<(), TransportError> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }
}

/// Scripted behavior for the mock media stack.
#[derive(Default)]
pub struct MediaScript {
    /// Reject audio acquisition (no microphone).
    pub fail_acquire: bool,
    /// Never complete ICE gathering, forcing the bounded wait to time out.
    pub ice_never_completes: bool,
    /// Connection state the session reports after the remote description is
    /// applied.
    pub connected_after_answer: bool,
}

pub struct MockMediaStack {
    script: MediaScript,
    /// Shared with every session this stack opens.
    pub sessions: Mutex<Vec<Arc<SessionProbe>>>,
}

/// Observable state of one opened session, shared with the test body.
#[derive(Default)]
pub struct SessionProbe {
    pub closed: Mutex<u32>,
    pub audio_enabled: Mutex<bool>,
    pub remote_sdp: Mutex<Option<String>>,
    pub state: Mutex<Option<MediaConnectionState>>,
}

impl MockMediaStack {
    pub fn new(script: MediaScript) -> Arc<Self> {
        Arc::new(MockMediaStack {
            script,
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn probe(&self, index: usize) -> Arc<SessionProbe> {
        self.sessions.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl MediaStack for MockMediaStack {
    async fn open_session(&self) -> Result<Box<dyn MediaSession>> {
        if self.script.fail_acquire {
            return Err(anyhow::anyhow!("microphone unavailable"));
        }
        let probe = Arc::new(SessionProbe::default());
        *probe.audio_enabled.lock().unwrap() = true;
        self.sessions.lock().unwrap().push(probe.clone());
        Ok(Box::new(MockMediaSession {
            probe,
            ice_never_completes: self.script.ice_never_completes,
            connected_after_answer: self.script.connected_after_answer,
            answer_applied: false,
        }))
    }
}

pub struct MockMediaSession {
    probe: Arc<SessionProbe>,
    ice_never_completes: bool,
    connected_after_answer: bool,
    answer_applied: bool,
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn create_offer(&mut self) -> Result<String> {
        Ok("v=0 offer".to_string())
    }

    async fn create_answer(&mut self) -> Result<String> {
        Ok("v=0 answer".to_string())
    }

    async fn set_remote_description(&mut self, sdp: &str) -> Result<()> {
        *self.probe.remote_sdp.lock().unwrap() = Some(sdp.to_string());
        self.answer_applied = true;
        Ok(())
    }

    async fn ice_gathering_complete(&mut self) {
        if self.ice_never_completes {
            // Pend forever; the machine's bounded wait must cut this short.
            std::future::pending::<()>().await;
        }
    }

    fn local_description(&self) -> Option<String> {
        Some("v=0 local-with-candidates".to_string())
    }

    fn connection_state(&self) -> MediaConnectionState {
        let state = if self.answer_applied && self.connected_after_answer {
            MediaConnectionState::Connected
        } else {
            MediaConnectionState::Connecting
        };
        *self.probe.state.lock().unwrap() = Some(state);
        state
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        *self.probe.audio_enabled.lock().unwrap() = enabled;
    }

    async fn close(&mut self) {
        *self.probe.closed.lock().unwrap() += 1;
    }
}

/// A sync client wired to mock transport and media, for integration tests.
pub fn setup_test_client() -> (SyncClient, Arc<MockTransport>, Arc<MockMediaStack>) {
    setup_logging();
    let transport = MockTransport::new();
    let media = MockMediaStack::new(MediaScript::default());
    let client = SyncClient::new("me", transport.clone(), media.clone());
    (client, transport, media)
}

/// Build an incoming message from `from` to us.
pub fn incoming(id: &str, from: &str, timestamp: i64, content: &str) -> Message {
    Message {
        id: id.to_string(),
        from: from.to_string(),
        to: "me".to_string(),
        kind: MessageKind::Text,
        content: content.to_string(),
        timestamp,
        status: MessageStatus::Delivered,
        direction: Direction::Incoming,
        reactions: Default::default(),
        context: None,
    }
}

/// Build an outgoing message from us to `to`.
pub fn outgoing(id: &str, to: &str, timestamp: i64, content: &str) -> Message {
    Message {
        id: id.to_string(),
        from: "me".to_string(),
        to: to.to_string(),
        kind: MessageKind::Text,
        content: content.to_string(),
        timestamp,
        status: MessageStatus::Sent,
        direction: Direction::Outgoing,
        reactions: Default::default(),
        context: None,
    }
}

/// Generate a full history page (page-size messages) ending at `newest_ts`,
/// one second apart.
pub fn full_page(contact: &str, newest_ts: i64, size: usize) -> Vec<Message> {
    (0..size)
        .map(|i| {
            let ts = newest_ts - i as i64;
            incoming(&format!("hist_{}_{}", contact, ts), contact, ts, "archived")
        })
        .collect()
}

/// Collector handler capturing published bus events.
pub type Captured<T> = Arc<Mutex<VecDeque<T>>>;

pub fn capture<T>() -> Captured<T> {
    Arc::new(Mutex::new(VecDeque::new()))
}
