// Identity reconciliation: outbound messages are recorded under a locally
// assigned provisional id, and the provider's canonical id arrives later as
// a separate correlation event. The direct remap path rewrites ids and
// reply back-references in place; the heuristic path is an off-hot-path
// repair helper that only ever proposes candidates.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::models::{is_provisional, Direction, Message};

use super::store::SyncStore;

/// Maximum clock skew tolerated between a locally recorded send and the
/// provider's confirmation record when correlating heuristically.
pub const CORRELATION_TOLERANCE_SECS: i64 = 5;

/// One outbound message that could correspond to a confirmation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapCandidate {
    pub message_id: String,
    pub timestamp: i64,
    /// Absolute distance from the confirmation timestamp, in seconds.
    pub delta_secs: i64,
}

/// Result of the best-effort correlation heuristic. Never auto-applied: the
/// caller decides whether a Match is trustworthy enough to feed to
/// [`SyncStore::remap_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// Exactly one candidate inside the tolerance window.
    Match(RemapCandidate),
    /// Two or more viable candidates; left unresolved rather than guessed.
    Ambiguous(Vec<RemapCandidate>),
    /// Nothing matched inside the tolerance window.
    NoCandidates,
}

impl SyncStore {
    /// Rewrite every occurrence of a provisional message id to the
    /// provider-assigned canonical id, including reply back-references, so
    /// quote links survive the rename. Idempotent; never merges two
    /// otherwise-distinct messages. Returns the contact ids whose threads
    /// changed.
    pub fn remap_id(&mut self, old_id: &str, new_id: &str) -> Vec<String> {
        if old_id == new_id {
            return Vec::new();
        }

        let mut changed = Vec::new();
        let mut renamed_threads = HashSet::new();
        for (contact_id, thread) in self.threads_mut().iter_mut() {
            let mut thread_changed = false;
            let new_already_present = thread.iter().any(|m| m.id == new_id);

            for msg in thread.iter_mut() {
                if msg.id == old_id {
                    if new_already_present {
                        // Both ids exist in the same thread; renaming would
                        // collapse two distinct messages into one key.
                        warn!(
                            "Thread {} already holds {}; leaving {} unrenamed",
                            contact_id, new_id, old_id
                        );
                    } else {
                        msg.id = new_id.to_string();
                        renamed_threads.insert(contact_id.clone());
                        thread_changed = true;
                    }
                }
                if msg.context.as_deref() == Some(old_id) {
                    msg.context = Some(new_id.to_string());
                    thread_changed = true;
                }
            }

            if thread_changed {
                changed.push(contact_id.clone());
            }
        }

        // The denormalized last_message pointer may hold the stale id too.
        // Renamed only where the thread rename went through; a refused swap
        // must not leave the pointer claiming the canonical id.
        for (contact_id, contact) in self.contacts_mut().iter_mut() {
            if let Some(last) = contact.last_message.as_mut() {
                if last.id == old_id && renamed_threads.contains(contact_id) {
                    last.id = new_id.to_string();
                }
                if last.context.as_deref() == Some(old_id) {
                    last.context = Some(new_id.to_string());
                }
            }
        }

        if changed.is_empty() {
            debug!("Remap {} -> {} touched nothing (already applied?)", old_id, new_id);
        } else {
            info!("Remapped {} -> {} across {} thread(s)", old_id, new_id, changed.len());
        }
        changed
    }

    /// Best-effort correlation of a send confirmation to an outbound message
    /// that still carries a provisional id. Candidates share the recipient
    /// and literal content; the closest timestamp wins, only inside a fixed
    /// tolerance. Inherently ambiguous when identical messages were sent to
    /// the same recipient within the window, so every outcome is logged with
    /// its candidate set and nothing is applied here.
    pub fn correlate_provisional(
        &self,
        to: &str,
        content: &str,
        confirmation_ts: i64,
    ) -> CorrelationOutcome {
        let mut candidates: Vec<RemapCandidate> = self
            .thread(to)
            .iter()
            .filter(|m| {
                m.direction == Direction::Outgoing
                    && is_provisional(&m.id)
                    && m.content == content
            })
            .map(|m: &Message| RemapCandidate {
                message_id: m.id.clone(),
                timestamp: m.timestamp,
                delta_secs: (m.timestamp - confirmation_ts).abs(),
            })
            .filter(|c| c.delta_secs < CORRELATION_TOLERANCE_SECS)
            .collect();
        candidates.sort_by_key(|c| c.delta_secs);

        match candidates.len() {
            0 => {
                info!(
                    "No provisional outbound message to {} matches confirmation at {}",
                    to, confirmation_ts
                );
                CorrelationOutcome::NoCandidates
            }
            1 => {
                let candidate = candidates.remove(0);
                info!(
                    "Correlated confirmation at {} to {} (delta {}s)",
                    confirmation_ts, candidate.message_id, candidate.delta_secs
                );
                CorrelationOutcome::Match(candidate)
            }
            n => {
                warn!(
                    "Ambiguous confirmation at {} for {}: {} candidates {:?}; leaving unresolved",
                    confirmation_ts, to, n, candidates
                );
                CorrelationOutcome::Ambiguous(candidates)
            }
        }
    }
}
