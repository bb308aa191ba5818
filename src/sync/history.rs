// Backward, cursor-based message-history loading. One load in flight per
// contact at a time; concurrent backward loads for the same contact would
// race on the cursor and duplicate pages. Loads for different contacts are
// independent.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use log::{debug, info};

use crate::models::Message;
use crate::transport::Command;

use super::SyncClient;

/// Fixed page size for history requests.
pub const HISTORY_PAGE_SIZE: usize = 50;

/// Per-contact pagination bookkeeping, owned by the client.
#[derive(Debug, Default)]
pub struct HistoryState {
    /// Oldest-known timestamp per contact, used as the backward cursor.
    cursors: HashMap<String, i64>,
    /// Contacts whose history is fully loaded.
    exhausted: HashSet<String>,
    /// Contacts with a request currently in flight.
    in_flight: HashSet<String>,
}

impl HistoryState {
    pub fn has_more(&self, contact_id: &str) -> bool {
        !self.exhausted.contains(contact_id)
    }

    pub fn is_loading(&self, contact_id: &str) -> bool {
        self.in_flight.contains(contact_id)
    }

    pub fn cursor(&self, contact_id: &str) -> Option<i64> {
        self.cursors.get(contact_id).copied()
    }
}

impl SyncClient {
    /// Reload a contact's thread from the newest page: clears local
    /// messages and cursor state and requests the most recent
    /// [`HISTORY_PAGE_SIZE`] messages.
    pub async fn load_initial(&mut self, contact_id: &str) -> Result<()> {
        if self.history.in_flight.contains(contact_id) {
            return Err(anyhow!("history load already in flight for {}", contact_id));
        }
        self.store.clear_thread(contact_id);
        self.history.cursors.remove(contact_id);
        self.history.exhausted.remove(contact_id);
        self.history.in_flight.insert(contact_id.to_string());

        info!("Requesting newest history page for {}", contact_id);
        let result = self
            .transport
            .send(Command::GetMessages {
                contact_id: contact_id.to_string(),
                limit: HISTORY_PAGE_SIZE,
                before_timestamp: None,
            })
            .await
            .context("failed to request message history");
        if result.is_err() {
            self.history.in_flight.remove(contact_id);
        }
        result
    }

    /// Request the next page of older messages. Requires a held cursor and
    /// no load already in flight for this contact.
    pub async fn load_more(&mut self, contact_id: &str) -> Result<()> {
        if self.history.in_flight.contains(contact_id) {
            return Err(anyhow!("history load already in flight for {}", contact_id));
        }
        if !self.history.has_more(contact_id) {
            return Err(anyhow!("no further history for {}", contact_id));
        }
        let cursor = self
            .history
            .cursor(contact_id)
            .ok_or_else(|| anyhow!("no history cursor held for {}; load the initial page first", contact_id))?;
        self.history.in_flight.insert(contact_id.to_string());

        info!("Requesting history for {} before {}", contact_id, cursor);
        let result = self
            .transport
            .send(Command::GetMessages {
                contact_id: contact_id.to_string(),
                limit: HISTORY_PAGE_SIZE,
                before_timestamp: Some(cursor),
            })
            .await
            .context("failed to request message history");
        if result.is_err() {
            self.history.in_flight.remove(contact_id);
        }
        result
    }

    pub fn history(&self) -> &HistoryState {
        &self.history
    }

    /// Merge an arrived history page and advance the cursor. The next
    /// cursor is the provider-supplied one when present, otherwise the
    /// oldest timestamp in the page; a page short of the requested size
    /// signals exhaustion.
    pub(crate) fn on_messages_loaded(
        &mut self,
        contact_id: &str,
        page: Vec<Message>,
        next_cursor: Option<i64>,
    ) {
        self.history.in_flight.remove(contact_id);

        let short_page = page.len() < HISTORY_PAGE_SIZE;
        let oldest = page.iter().map(|m| m.timestamp).min();
        debug!(
            "History page for {}: {} message(s), next_cursor {:?}",
            contact_id,
            page.len(),
            next_cursor
        );
        self.store.ingest_history_page(contact_id, page);

        if short_page && next_cursor.is_none() {
            self.history.cursors.remove(contact_id);
            self.history.exhausted.insert(contact_id.to_string());
            info!("History for {} fully loaded", contact_id);
        } else if let Some(cursor) = next_cursor.or(oldest) {
            self.history.cursors.insert(contact_id.to_string(), cursor);
        }
    }
}
