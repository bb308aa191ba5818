// Call signaling state machine: negotiates a peer-to-peer audio session
// (offer/answer/ICE) against the transport channel and the local media
// stack. One session at a time; teardown from any state is idempotent and
// always releases the media device.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};

use crate::models::Direction;
use crate::transport::{Command, Transport};

pub mod media;

pub use media::{
    gather_candidates, MediaConnectionState, MediaSession, MediaStack, UnsupportedMediaStack,
    ICE_GATHERING_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Active,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    /// Assigned by the remote side; may arrive after the session was created
    /// locally, so acceptance of the answer never requires it.
    pub call_id: Option<String>,
    pub peer: String,
    pub peer_name: String,
    pub direction: Direction,
    pub remote_sdp: Option<String>,
}

pub struct CallMachine {
    state: CallState,
    session: Option<CallSession>,
    media: Option<Box<dyn MediaSession>>,
    stack: Arc<dyn MediaStack>,
    transport: Arc<dyn Transport>,
    ice_timeout: Duration,
    answer_applied: bool,
    muted: bool,
}

impl CallMachine {
    pub fn new(stack: Arc<dyn MediaStack>, transport: Arc<dyn Transport>) -> Self {
        CallMachine {
            state: CallState::Idle,
            session: None,
            media: None,
            stack,
            transport,
            ice_timeout: ICE_GATHERING_TIMEOUT,
            answer_applied: false,
            muted: false,
        }
    }

    /// Override the ICE gathering bound (primarily for tests).
    pub fn with_ice_timeout(mut self, timeout: Duration) -> Self {
        self.ice_timeout = timeout;
        self
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Start an outgoing call: acquire audio, create and gather the local
    /// offer (bounded wait), send it, and move to Outgoing. No call id is
    /// held yet; the provider assigns one asynchronously.
    pub async fn start_call(&mut self, contact_id: &str, contact_name: &str) -> Result<()> {
        if self.state != CallState::Idle {
            return Err(anyhow!("a call is already in progress"));
        }

        let mut media = self
            .stack
            .open_session()
            .await
            .context("could not acquire local audio")?;

        let offer = match media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                media.close().await;
                return Err(e).context("failed to create call offer");
            }
        };
        gather_candidates(media.as_mut(), self.ice_timeout).await;
        let sdp = media.local_description().unwrap_or(offer);

        self.media = Some(media);
        self.session = Some(CallSession {
            call_id: None,
            peer: contact_id.to_string(),
            peer_name: contact_name.to_string(),
            direction: Direction::Outgoing,
            remote_sdp: None,
        });
        self.state = CallState::Outgoing;
        info!("Outgoing call to {}; offer sent, awaiting answer", contact_id);

        if let Err(e) = self
            .transport
            .send(Command::CallStart {
                to: contact_id.to_string(),
                sdp,
            })
            .await
        {
            self.teardown().await;
            return Err(e).context("failed to send call offer");
        }
        Ok(())
    }

    /// The provider confirmed the call and assigned its id. Tolerated at any
    /// point after the local session exists (the confirmation races the
    /// offer transmission).
    pub fn attach_call_id(&mut self, call_id: &str) {
        match self.session.as_mut() {
            Some(session) => match &session.call_id {
                None => {
                    debug!("Attached call id {} to current session", call_id);
                    session.call_id = Some(call_id.to_string());
                }
                Some(held) if held == call_id => {}
                Some(held) => {
                    warn!("Ignoring call id {} (session already holds {})", call_id, held)
                }
            },
            None => warn!("Call id {} arrived with no session; dropping", call_id),
        }
    }

    /// An incoming call rang. Only accepted from Idle; while another session
    /// is live the new call is answered with a busy reject.
    pub async fn on_incoming_call(
        &mut self,
        call_id: &str,
        from: &str,
        caller_name: Option<&str>,
        remote_sdp: &str,
    ) -> Result<()> {
        if self.state != CallState::Idle {
            warn!(
                "Incoming call {} from {} while {:?}; rejecting busy",
                call_id, from, self.state
            );
            self.transport
                .send(Command::CallReject {
                    call_id: call_id.to_string(),
                })
                .await
                .context("failed to send busy reject")?;
            return Ok(());
        }

        self.session = Some(CallSession {
            call_id: Some(call_id.to_string()),
            peer: from.to_string(),
            peer_name: caller_name.unwrap_or(from).to_string(),
            direction: Direction::Incoming,
            remote_sdp: Some(remote_sdp.to_string()),
        });
        self.state = CallState::Incoming;
        info!("Incoming call {} from {}", call_id, from);
        Ok(())
    }

    /// Answer the ringing call: acquire audio, apply the remote offer,
    /// create and gather the local answer (bounded wait), send it, and move
    /// to Active.
    pub async fn accept_call(&mut self) -> Result<()> {
        if self.state != CallState::Incoming {
            return Err(anyhow!("no incoming call to accept"));
        }
        let (call_id, remote_sdp) = {
            let session = self.session.as_ref().ok_or_else(|| anyhow!("no call session"))?;
            let call_id = session
                .call_id
                .clone()
                .ok_or_else(|| anyhow!("incoming call has no call id"))?;
            let remote_sdp = session
                .remote_sdp
                .clone()
                .ok_or_else(|| anyhow!("incoming call has no remote offer"))?;
            (call_id, remote_sdp)
        };

        let mut media = match self.stack.open_session().await {
            Ok(media) => media,
            Err(e) => {
                // Cannot take the call without a microphone; tell the remote
                // side and reset.
                let _ = self
                    .transport
                    .send(Command::CallReject {
                        call_id: call_id.clone(),
                    })
                    .await;
                self.teardown().await;
                return Err(e).context("could not acquire local audio");
            }
        };

        let answer = async {
            media.set_remote_description(&remote_sdp).await?;
            media.create_answer().await
        }
        .await;
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                media.close().await;
                self.teardown().await;
                return Err(e).context("failed to create call answer");
            }
        };
        gather_candidates(media.as_mut(), self.ice_timeout).await;
        let sdp = media.local_description().unwrap_or(answer);

        self.media = Some(media);
        self.state = CallState::Active;
        info!("Accepted call {}; answer sent", call_id);

        if let Err(e) = self
            .transport
            .send(Command::CallAccept { call_id, sdp })
            .await
        {
            self.teardown().await;
            return Err(e).context("failed to send call answer");
        }
        Ok(())
    }

    /// The remote side answered our offer. Accepted only while Outgoing, and
    /// only when the event's call id matches the held one or none is held
    /// yet (the id confirmation may still be in flight). Applying the answer
    /// starts negotiation; Active is reached once the media transport
    /// reports connected.
    pub async fn on_remote_answer(&mut self, call_id: &str, sdp: &str) -> Result<()> {
        if self.state != CallState::Outgoing {
            warn!(
                "Ignoring call answer {} while {:?}; only an outgoing call can be answered",
                call_id, self.state
            );
            return Ok(());
        }
        let session = self.session.as_mut().ok_or_else(|| anyhow!("no call session"))?;
        match &session.call_id {
            Some(held) if held != call_id => {
                warn!("Answer call id {} does not match held {}; ignoring", call_id, held);
                return Ok(());
            }
            Some(_) => {}
            None => session.call_id = Some(call_id.to_string()),
        }
        session.remote_sdp = Some(sdp.to_string());

        let media = self.media.as_mut().ok_or_else(|| anyhow!("no media session"))?;
        media
            .set_remote_description(sdp)
            .await
            .context("failed to apply remote answer")?;
        self.answer_applied = true;
        debug!("Remote answer applied for call {}; negotiating", call_id);

        if media.connection_state() == MediaConnectionState::Connected {
            self.state = CallState::Active;
            info!("Call {} is active", call_id);
        }
        Ok(())
    }

    /// The media transport reported a connected state. Completes the caller
    /// path once the answer has been applied.
    pub fn on_media_connected(&mut self) {
        if self.state == CallState::Outgoing && self.answer_applied {
            info!("Media connected; call is active");
            self.state = CallState::Active;
        }
    }

    /// Decline the ringing call and reset.
    pub async fn reject_call(&mut self) -> Result<()> {
        if self.state == CallState::Idle {
            return Ok(());
        }
        let call_id = self.session.as_ref().and_then(|s| s.call_id.clone());
        if let Some(call_id) = call_id {
            self.transport
                .send(Command::CallReject { call_id })
                .await
                .context("failed to send call reject")?;
        }
        self.teardown().await;
        Ok(())
    }

    /// Hang up from any non-idle state, notifying the remote side.
    pub async fn end_call(&mut self) -> Result<()> {
        if self.state == CallState::Idle {
            return Ok(());
        }
        let call_id = self.session.as_ref().and_then(|s| s.call_id.clone());
        self.teardown().await;
        if let Some(call_id) = call_id {
            self.transport
                .send(Command::CallTerminate { call_id })
                .await
                .context("failed to send call end")?;
        } else {
            debug!("Ending call that never received a call id; nothing to notify");
        }
        Ok(())
    }

    /// The remote side hung up. Same cleanup as `end_call` but without
    /// notifying the transport. An end event carrying a call id that does
    /// not match the held session (an echo for a call we already rejected,
    /// for example) leaves the live session alone.
    pub async fn on_remote_ended(&mut self, call_id: Option<&str>) {
        if self.state == CallState::Idle {
            debug!("Remote end event with no call in progress; ignoring");
            return;
        }
        let held = self.session.as_ref().and_then(|s| s.call_id.as_deref());
        if let (Some(ended), Some(held)) = (call_id, held) {
            if ended != held {
                debug!(
                    "Remote end for call {} does not match held {}; ignoring",
                    ended, held
                );
                return;
            }
        }
        info!("Remote side ended the call");
        self.teardown().await;
    }

    /// Mute toggles the local audio track set. Orthogonal to the state
    /// machine; disabling the track outside Active is harmless.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(media) = self.media.as_mut() {
            media.set_audio_enabled(!muted);
        }
    }

    /// Release the media device and session and return to Idle. Safe to
    /// invoke from any state, any number of times.
    async fn teardown(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.set_audio_enabled(false);
            media.close().await;
        }
        self.session = None;
        self.answer_applied = false;
        self.muted = false;
        self.state = CallState::Idle;
    }
}
