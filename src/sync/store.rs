// Authoritative in-memory snapshot of contacts and per-contact message
// threads. Every write is read-old, merge, replace: no handler ever observes
// a partially updated collection. All lookups are advisory; a miss is logged
// and the event dropped, since inbound events are untrusted and arrive out
// of order.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::models::{Contact, ContactPatch, Direction, Message};

/// Outcome of ingesting a single live message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Contact whose thread the message belongs to.
    pub contact_id: String,
    /// False when a message with the same id was already present (the
    /// duplicate was silently dropped).
    pub inserted: bool,
    /// True when the contact record did not exist and a stub was created.
    pub contact_created: bool,
}

/// Single source of truth for contacts and message lists. Constructed per
/// client (and per test); there is no ambient global store.
#[derive(Default)]
pub struct SyncStore {
    contacts: HashMap<String, Contact>,
    threads: HashMap<String, Vec<Message>>,
}

impl SyncStore {
    pub fn new() -> Self {
        SyncStore::default()
    }

    /// Contact list ordered for display: most recent activity first,
    /// contacts without any message last.
    pub fn contact_list(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.contacts.values().cloned().collect();
        contacts.sort_by_key(|c| {
            std::cmp::Reverse(c.last_message.as_ref().map(|m| m.timestamp).unwrap_or(i64::MIN))
        });
        contacts
    }

    pub fn contact(&self, id: &str) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    /// The message thread for a contact, ascending by timestamp. Empty when
    /// the contact is unknown.
    pub fn thread(&self, contact_id: &str) -> &[Message] {
        self.threads.get(contact_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Find a message by id across every thread. Status, reaction, and
    /// id-remap confirmations may reference any thread, not just the active
    /// one.
    pub fn find_message(&self, id: &str) -> Option<(&str, &Message)> {
        for (contact_id, thread) in &self.threads {
            if let Some(msg) = thread.iter().find(|m| m.id == id) {
                return Some((contact_id.as_str(), msg));
            }
        }
        None
    }

    /// Replace-or-insert each contact by id. Locally derived fields
    /// (last_message, window anchor) survive a provider push that omits
    /// them.
    pub fn upsert_contacts(&mut self, list: Vec<Contact>) {
        for mut contact in list {
            if let Some(existing) = self.contacts.get(&contact.id) {
                if contact.last_message.is_none() {
                    contact.last_message = existing.last_message.clone();
                }
                if contact.last_user_msg_timestamp.is_none() {
                    contact.last_user_msg_timestamp = existing.last_user_msg_timestamp;
                }
                if contact.custom_name.is_none() {
                    contact.custom_name = existing.custom_name.clone();
                }
            }
            self.contacts.insert(contact.id.clone(), contact);
        }
        info!("Contact list now holds {} contacts", self.contacts.len());
    }

    /// Merge a partial update into a contact, creating a stub first when the
    /// id is unknown. Returns the updated record.
    pub fn patch_contact(&mut self, id: &str, patch: ContactPatch) -> Contact {
        let contact = self.ensure_contact(id);
        if let Some(name) = patch.name {
            contact.name = name;
        }
        if let Some(pushed) = patch.pushed_name {
            contact.pushed_name = Some(pushed);
        }
        if let Some(custom) = patch.custom_name {
            contact.custom_name = Some(custom);
        }
        if let Some(favorite) = patch.is_favorite {
            contact.is_favorite = favorite;
        }
        contact.clone()
    }

    /// Flip a contact's favorite flag, creating a stub when unknown.
    /// Returns the new value.
    pub fn toggle_favorite(&mut self, id: &str) -> bool {
        let contact = self.ensure_contact(id);
        contact.is_favorite = !contact.is_favorite;
        contact.is_favorite
    }

    /// Ingest one live message (local send or inbound delivery).
    ///
    /// The counterpart contact's last_message pointer is refreshed
    /// unconditionally; the messaging-window anchor advances only for
    /// incoming messages. A message whose id is already present in the
    /// thread is dropped, making ingestion idempotent.
    pub fn ingest_message(&mut self, msg: Message) -> IngestOutcome {
        let contact_id = msg.counterpart().to_string();
        let contact_created = !self.contacts.contains_key(&contact_id);
        let contact = self.ensure_contact(&contact_id);

        contact.last_message = Some(msg.clone());
        if msg.direction == Direction::Incoming {
            let anchor = contact.last_user_msg_timestamp.unwrap_or(i64::MIN);
            contact.last_user_msg_timestamp = Some(anchor.max(msg.timestamp));
        }

        let thread = self.threads.entry(contact_id.clone()).or_default();
        let inserted = if thread.iter().any(|m| m.id == msg.id) {
            debug!("Dropping duplicate message {} for {}", msg.id, contact_id);
            false
        } else {
            thread.push(msg);
            thread.sort_by_key(|m| m.timestamp);
            true
        };

        IngestOutcome {
            contact_id,
            inserted,
            contact_created,
        }
    }

    /// Merge a page of archived history into a contact's thread. Duplicate
    /// ids resolve last-write-wins in favor of the page; the merged thread
    /// is re-sorted ascending by timestamp.
    pub fn ingest_history_page(&mut self, contact_id: &str, page: Vec<Message>) {
        self.ensure_contact(contact_id);
        let thread = self.threads.entry(contact_id.to_string()).or_default();
        for msg in page {
            match thread.iter_mut().find(|m| m.id == msg.id) {
                Some(existing) => *existing = msg,
                None => thread.push(msg),
            }
        }
        thread.sort_by_key(|m| m.timestamp);
        debug!(
            "Thread for {} holds {} messages after history merge",
            contact_id,
            thread.len()
        );
        let newest = thread.last().cloned();
        if let Some(contact) = self.contacts.get_mut(contact_id) {
            contact.last_message = newest;
        }
    }

    /// Drop all messages held for a contact (used before reloading history
    /// from the newest page). The denormalized last_message pointer goes
    /// with them; it must never reference a message the store no longer
    /// holds.
    pub fn clear_thread(&mut self, contact_id: &str) {
        if let Some(thread) = self.threads.get_mut(contact_id) {
            thread.clear();
        }
        if let Some(contact) = self.contacts.get_mut(contact_id) {
            contact.last_message = None;
        }
    }

    /// Apply a delivery-status confirmation to whichever thread holds the
    /// message. Returns the owning contact id when the status changed.
    pub fn apply_status(&mut self, id: &str, status: crate::models::MessageStatus) -> Option<String> {
        for (contact_id, thread) in self.threads.iter_mut() {
            if let Some(msg) = thread.iter_mut().find(|m| m.id == id) {
                let changed = msg.apply_status(status);
                if !changed {
                    debug!("Ignoring non-advancing status {:?} for message {}", status, id);
                    return None;
                }
                let updated = msg.clone();
                info!("Message {} status is now {:?}", id, status);
                Self::refresh_last_message(self.contacts.get_mut(contact_id), &updated);
                return Some(contact_id.clone());
            }
        }
        warn!("Status update for unknown message {}; dropping", id);
        None
    }

    /// Apply a reaction event to whichever thread holds the message.
    /// Returns the owning contact id when anything changed.
    pub fn apply_reaction(&mut self, message_id: &str, from: &str, emoji: &str) -> Option<String> {
        for (contact_id, thread) in self.threads.iter_mut() {
            if let Some(msg) = thread.iter_mut().find(|m| m.id == message_id) {
                if !msg.apply_reaction(from, emoji) {
                    return None;
                }
                let updated = msg.clone();
                Self::refresh_last_message(self.contacts.get_mut(contact_id), &updated);
                return Some(contact_id.clone());
            }
        }
        warn!("Reaction for unknown message {}; dropping", message_id);
        None
    }

    /// Keep the denormalized last_message pointer in sync when the message
    /// it denormalizes was mutated in place.
    fn refresh_last_message(contact: Option<&mut Contact>, updated: &Message) {
        if let Some(contact) = contact {
            if contact
                .last_message
                .as_ref()
                .map(|m| m.id == updated.id)
                .unwrap_or(false)
            {
                contact.last_message = Some(updated.clone());
            }
        }
    }

    pub(crate) fn ensure_contact(&mut self, id: &str) -> &mut Contact {
        self.contacts
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("Creating stub contact for unknown id {}", id);
                Contact::stub(id)
            })
    }

    pub(crate) fn threads_mut(&mut self) -> &mut HashMap<String, Vec<Message>> {
        &mut self.threads
    }

    pub(crate) fn contacts_mut(&mut self) -> &mut HashMap<String, Contact> {
        &mut self.contacts
    }
}
