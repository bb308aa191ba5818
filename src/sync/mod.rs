// Synchronization engine entry point. The SyncClient owns the store, the
// event bus, the pagination state, and the call machine; it ingests tagged
// transport events one at a time and runs every mutation to completion
// before the next, so no two mutations ever interleave.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Notify};

use crate::call::{CallMachine, CallState, MediaStack};
use crate::events::{EventBus, UiEvent};
use crate::models::{
    provisional_id, Contact, ContactPatch, Direction, Message, MessageKind, MessageStatus,
};
use crate::transport::{Command, Transport, TransportEvent, TypingState};

pub mod history;
pub mod reconcile;
pub mod store;

pub use history::{HistoryState, HISTORY_PAGE_SIZE};
pub use reconcile::{CorrelationOutcome, RemapCandidate, CORRELATION_TOLERANCE_SECS};
pub use store::{IngestOutcome, SyncStore};

pub struct SyncClient {
    /// Our own party identifier with the provider.
    self_id: String,
    store: SyncStore,
    bus: EventBus,
    history: HistoryState,
    call: CallMachine,
    transport: Arc<dyn Transport>,
    /// Contact whose thread the UI currently displays. Thread updates are
    /// only published for this contact.
    active_contact: Option<String>,
}

impl SyncClient {
    pub fn new(
        self_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaStack>,
    ) -> Self {
        SyncClient {
            self_id: self_id.into(),
            store: SyncStore::new(),
            bus: EventBus::new(),
            history: HistoryState::default(),
            call: CallMachine::new(media, transport.clone()),
            transport,
            active_contact: None,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn call(&self) -> &CallMachine {
        &self.call
    }

    pub fn active_contact(&self) -> Option<&str> {
        self.active_contact.as_deref()
    }

    /// Switch the displayed thread. Publishes the newly active thread so
    /// the UI can render it immediately.
    pub fn set_active_contact(&mut self, contact_id: Option<String>) {
        self.active_contact = contact_id;
        if let Some(contact_id) = self.active_contact.clone() {
            self.publish_thread(&contact_id);
        }
    }

    /// Process every inbound transport event until the channel closes or
    /// shutdown is signaled.
    pub async fn run(&mut self, mut events: mpsc::Receiver<TransportEvent>, shutdown: Arc<Notify>) {
        info!("Sync engine event loop starting");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    info!("Shutdown signaled; exiting event loop");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Transport event channel closed; exiting event loop");
                        break;
                    }
                }
            }
        }
        if self.call.state() != CallState::Idle {
            if let Err(e) = self.call.end_call().await {
                warn!("Failed to end call during shutdown: {:#}", e);
            }
        }
    }

    /// Apply one inbound event. Every arm degrades to log-and-drop on a
    /// referential miss; nothing here is fatal.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Contacts { contacts } => {
                self.store.upsert_contacts(contacts);
                self.publish_contacts();
            }
            TransportEvent::Message { message } => {
                let outcome = self.store.ingest_message(message);
                if outcome.contact_created {
                    debug!("Message created new contact {}", outcome.contact_id);
                }
                self.publish_contacts();
                self.publish_thread_if_active(&outcome.contact_id);
            }
            TransportEvent::MessagesLoaded {
                contact_id,
                messages,
                next_cursor,
            } => {
                self.on_messages_loaded(&contact_id, messages, next_cursor);
                self.publish_thread_if_active(&contact_id);
            }
            TransportEvent::Status { id, status } => {
                if let Some(contact_id) = self.store.apply_status(&id, status) {
                    self.publish_thread_if_active(&contact_id);
                }
            }
            TransportEvent::Reaction {
                message_id,
                from,
                emoji,
            } => {
                if let Some(contact_id) = self.store.apply_reaction(&message_id, &from, &emoji) {
                    self.publish_thread_if_active(&contact_id);
                }
            }
            TransportEvent::IdUpdate { old_id, new_id } => {
                for contact_id in self.store.remap_id(&old_id, &new_id) {
                    self.publish_thread_if_active(&contact_id);
                }
            }
            TransportEvent::ContactUpdate { id, custom_name } => {
                let patch = ContactPatch {
                    custom_name,
                    ..ContactPatch::default()
                };
                let contact = self.store.patch_contact(&id, patch);
                self.publish_contact(contact);
            }
            TransportEvent::Typing { contact_id, state } => {
                self.bus.publish(&UiEvent::TypingChanged {
                    contact_id,
                    composing: state == TypingState::Composing,
                });
            }
            TransportEvent::CallCreated { call_id } => {
                self.call.attach_call_id(&call_id);
                self.publish_call();
            }
            TransportEvent::CallIncoming {
                call_id,
                from,
                caller_name,
                sdp,
            } => {
                let caller_name = caller_name.unwrap_or_else(|| {
                    self.store
                        .contact(&from)
                        .map(|c| c.display_name().to_string())
                        .unwrap_or_else(|| from.clone())
                });
                if let Err(e) = self
                    .call
                    .on_incoming_call(&call_id, &from, Some(&caller_name), &sdp)
                    .await
                {
                    warn!("Failed to handle incoming call {}: {:#}", call_id, e);
                }
                self.publish_call();
            }
            TransportEvent::CallAnswered { call_id, sdp } => {
                if let Err(e) = self.call.on_remote_answer(&call_id, &sdp).await {
                    warn!("Failed to apply call answer {}: {:#}", call_id, e);
                }
                self.publish_call();
            }
            TransportEvent::CallEnded { call_id } => {
                debug!("Remote ended call {:?}", call_id);
                self.call.on_remote_ended(call_id.as_deref()).await;
                self.publish_call();
            }
            TransportEvent::Error { message } => {
                error!("Transport reported error: {}", message);
                self.bus.publish(&UiEvent::TransportError { message });
            }
        }
    }

    // ---- outbound operations -------------------------------------------

    /// Send a freeform text message. Permitted only while the recipient's
    /// messaging window is open; outside it the provider only accepts
    /// template sends. The message is recorded optimistically under a
    /// provisional id and the canonical id arrives later as an id_update.
    pub async fn send_text(
        &mut self,
        to: &str,
        body: &str,
        context: Option<String>,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let window_open = self
            .store
            .contact(to)
            .map(|c| c.is_window_open(now))
            .unwrap_or(false);
        if !window_open {
            return Err(anyhow!(
                "messaging window for {} is closed; only template messages can be sent",
                to
            ));
        }

        let local_id = provisional_id();
        self.record_outgoing(Message {
            id: local_id.clone(),
            from: self.self_id.clone(),
            to: to.to_string(),
            kind: MessageKind::Text,
            content: body.to_string(),
            timestamp: now,
            status: MessageStatus::Sending,
            direction: Direction::Outgoing,
            reactions: Default::default(),
            context: context.clone(),
        });

        self.dispatch_send(
            &local_id,
            Command::SendMessage {
                to: to.to_string(),
                body: body.to_string(),
                context,
                local_id: local_id.clone(),
            },
        )
        .await?;
        Ok(local_id)
    }

    /// Send a template message. Templates are exempt from the messaging
    /// window.
    pub async fn send_template(
        &mut self,
        to: &str,
        template_name: &str,
        language: &str,
    ) -> Result<String> {
        let local_id = provisional_id();
        self.record_outgoing(Message {
            id: local_id.clone(),
            from: self.self_id.clone(),
            to: to.to_string(),
            kind: MessageKind::Template,
            content: template_name.to_string(),
            timestamp: Utc::now().timestamp(),
            status: MessageStatus::Sending,
            direction: Direction::Outgoing,
            reactions: Default::default(),
            context: None,
        });

        self.dispatch_send(
            &local_id,
            Command::SendTemplate {
                to: to.to_string(),
                template_name: template_name.to_string(),
                language: language.to_string(),
                local_id: local_id.clone(),
            },
        )
        .await?;
        Ok(local_id)
    }

    /// Send an interactive message (buttons, lists). Window-gated like any
    /// other freeform send.
    pub async fn send_interactive(
        &mut self,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let window_open = self
            .store
            .contact(to)
            .map(|c| c.is_window_open(now))
            .unwrap_or(false);
        if !window_open {
            return Err(anyhow!(
                "messaging window for {} is closed; only template messages can be sent",
                to
            ));
        }

        let local_id = provisional_id();
        self.record_outgoing(Message {
            id: local_id.clone(),
            from: self.self_id.clone(),
            to: to.to_string(),
            kind: MessageKind::Interactive,
            content: payload.to_string(),
            timestamp: now,
            status: MessageStatus::Sending,
            direction: Direction::Outgoing,
            reactions: Default::default(),
            context: None,
        });

        self.dispatch_send(
            &local_id,
            Command::SendInteractive {
                to: to.to_string(),
                payload,
                local_id: local_id.clone(),
            },
        )
        .await?;
        Ok(local_id)
    }

    /// React to a message (empty emoji retracts our reaction).
    pub async fn send_reaction(&mut self, to: &str, message_id: &str, emoji: &str) -> Result<()> {
        let self_id = self.self_id.clone();
        if let Some(contact_id) = self.store.apply_reaction(message_id, &self_id, emoji) {
            self.publish_thread_if_active(&contact_id);
        }
        self.transport
            .send(Command::Reaction {
                to: to.to_string(),
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            })
            .await
            .context("failed to send reaction")
    }

    /// Signal to the provider that we read a message.
    pub async fn mark_read(&mut self, message_id: &str) -> Result<()> {
        self.transport
            .send(Command::Read {
                message_id: message_id.to_string(),
            })
            .await
            .context("failed to send read signal")
    }

    /// Fire a typing indicator.
    pub async fn send_typing(&mut self, to: &str, state: TypingState) -> Result<()> {
        self.transport
            .send(Command::Typing {
                to: to.to_string(),
                state,
            })
            .await
            .context("failed to send typing state")
    }

    /// Assign a user-chosen name to a contact.
    pub async fn set_custom_name(&mut self, contact_id: &str, name: &str) -> Result<()> {
        let patch = ContactPatch {
            custom_name: Some(name.to_string()),
            ..ContactPatch::default()
        };
        let contact = self.store.patch_contact(contact_id, patch);
        self.publish_contact(contact);
        self.transport
            .send(Command::UpdateContact {
                contact_id: contact_id.to_string(),
                name: name.to_string(),
            })
            .await
            .context("failed to send contact update")
    }

    /// Flip a contact's favorite flag.
    pub async fn toggle_favorite(&mut self, contact_id: &str) -> Result<bool> {
        let favorite = self.store.toggle_favorite(contact_id);
        if let Some(contact) = self.store.contact(contact_id).cloned() {
            self.publish_contact(contact);
        }
        self.transport
            .send(Command::ToggleFavorite {
                contact_id: contact_id.to_string(),
            })
            .await
            .context("failed to send favorite toggle")?;
        Ok(favorite)
    }

    // ---- call facade ----------------------------------------------------

    pub async fn start_call(&mut self, contact_id: &str) -> Result<()> {
        let name = self
            .store
            .contact(contact_id)
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| contact_id.to_string());
        let result = self.call.start_call(contact_id, &name).await;
        self.publish_call();
        result
    }

    pub async fn accept_call(&mut self) -> Result<()> {
        let result = self.call.accept_call().await;
        self.publish_call();
        result
    }

    pub async fn reject_call(&mut self) -> Result<()> {
        let result = self.call.reject_call().await;
        self.publish_call();
        result
    }

    pub async fn end_call(&mut self) -> Result<()> {
        let result = self.call.end_call().await;
        self.publish_call();
        result
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.call.set_muted(muted);
    }

    /// The media stack reported that audio is flowing. Completes the caller
    /// side of call setup.
    pub fn media_connected(&mut self) {
        self.call.on_media_connected();
        self.publish_call();
    }

    // ---- identity repair ------------------------------------------------

    /// Apply a canonical-id remap and publish the threads it touched. The
    /// hot path calls this from the id_update event; the repair path calls
    /// it after choosing a [`CorrelationOutcome::Match`].
    pub fn remap_id(&mut self, old_id: &str, new_id: &str) {
        for contact_id in self.store.remap_id(old_id, new_id) {
            self.publish_thread_if_active(&contact_id);
        }
    }

    /// Best-effort correlation of a confirmation record to a still-
    /// provisional outbound message. Returns candidates only; nothing is
    /// applied here.
    pub fn correlate_provisional(
        &self,
        to: &str,
        content: &str,
        confirmation_ts: i64,
    ) -> CorrelationOutcome {
        self.store.correlate_provisional(to, content, confirmation_ts)
    }

    // ---- internals ------------------------------------------------------

    /// Record an optimistic outgoing message and publish the affected views.
    fn record_outgoing(&mut self, message: Message) {
        let outcome = self.store.ingest_message(message);
        self.publish_contacts();
        self.publish_thread_if_active(&outcome.contact_id);
    }

    /// Hand a send command to the transport; on failure the optimistic
    /// record is marked failed instead of being rolled back.
    async fn dispatch_send(&mut self, local_id: &str, command: Command) -> Result<()> {
        if let Err(e) = self.transport.send(command).await {
            error!("Send of {} failed: {}", local_id, e);
            if let Some(contact_id) = self.store.apply_status(local_id, MessageStatus::Failed) {
                self.publish_thread_if_active(&contact_id);
            }
            return Err(e).context("failed to send message");
        }
        Ok(())
    }

    fn publish_contacts(&mut self) {
        self.bus
            .publish(&UiEvent::ContactsUpdated(self.store.contact_list()));
    }

    fn publish_contact(&mut self, contact: Contact) {
        self.bus.publish(&UiEvent::ContactUpdated(contact));
        self.publish_contacts();
    }

    fn publish_thread_if_active(&mut self, contact_id: &str) {
        if self.active_contact.as_deref() == Some(contact_id) {
            self.publish_thread(contact_id);
        }
    }

    fn publish_thread(&mut self, contact_id: &str) {
        self.bus.publish(&UiEvent::ThreadUpdated {
            contact_id: contact_id.to_string(),
            messages: self.store.thread(contact_id).to_vec(),
        });
    }

    fn publish_call(&mut self) {
        self.bus.publish(&UiEvent::CallChanged {
            state: self.call.state(),
            session: self.call.session().cloned(),
        });
    }
}
