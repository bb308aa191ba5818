// Seam to the local real-time media stack. The signaling machine never
// touches an audio device or peer connection directly; it drives these
// traits, which makes the bounded ICE wait a testable contract instead of a
// callback race.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::warn;

/// Connection state reported by the underlying media transport. The call
/// only counts as active once audio is flowing, not merely once the answer
/// was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A live peer media session holding the local audio track.
#[async_trait]
pub trait MediaSession: Send {
    /// Create the local session offer.
    async fn create_offer(&mut self) -> Result<String>;

    /// Create the local answer to a previously applied remote offer.
    async fn create_answer(&mut self) -> Result<String>;

    /// Apply the remote session description (offer or answer).
    async fn set_remote_description(&mut self, sdp: &str) -> Result<()>;

    /// Resolves once ICE candidate gathering has completed. May pend
    /// forever; callers bound it with a timeout.
    async fn ice_gathering_complete(&mut self);

    /// Local description including every candidate gathered so far.
    fn local_description(&self) -> Option<String>;

    fn connection_state(&self) -> MediaConnectionState;

    /// Enable or disable the local audio track set. Harmless in any state.
    fn set_audio_enabled(&mut self, enabled: bool);

    /// Release the session. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Factory seam: acquiring the microphone and opening a peer session.
/// Acquisition failure surfaces as a rejected call operation.
#[async_trait]
pub trait MediaStack: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn MediaSession>>;
}

/// Default bound on ICE candidate gathering.
pub const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for ICE gathering to complete, bounded by `timeout`. Gathering is
/// best-effort: on timeout the call proceeds with whatever candidates were
/// collected, which is degraded behavior rather than an error.
pub async fn gather_candidates(session: &mut dyn MediaSession, timeout: Duration) {
    if tokio::time::timeout(timeout, session.ice_gathering_complete())
        .await
        .is_err()
    {
        warn!(
            "ICE gathering incomplete after {:?}; proceeding with partial candidate set",
            timeout
        );
    }
}

/// Media stack for environments without an audio device (the headless
/// binary). Every acquisition is rejected.
pub struct UnsupportedMediaStack;

#[async_trait]
impl MediaStack for UnsupportedMediaStack {
    async fn open_session(&self) -> Result<Box<dyn MediaSession>> {
        Err(anyhow::anyhow!("no audio device available in this environment"))
    }
}
