use std::{collections::HashSet, sync::Arc};

use media_session::{
    LocalMediaStream, PeerConnection, PeerConnectionState, PeerEvent,
};
use shared::{
    domain::UserId,
    protocol::{CallSignal, ClientRequest, IceCandidateInit, SessionDescription},
};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{ChatClient, ClientEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    /// Outbound offer sent, waiting for an answer.
    Offering { peer: UserId },
    /// Inbound offer stored, waiting for accept/decline or the ring timeout.
    Ringing { caller: UserId },
    Connected { peer: UserId },
}

impl CallPhase {
    pub fn peer(&self) -> Option<&UserId> {
        match self {
            CallPhase::Idle => None,
            CallPhase::Offering { peer } | CallPhase::Connected { peer } => Some(peer),
            CallPhase::Ringing { caller } => Some(caller),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    HungUp,
    Declined,
    Missed,
    TransportFailed,
}

#[derive(Debug, Error)]
pub enum CallSetupError {
    #[error("a call with {0} is already in progress")]
    Busy(UserId),
    #[error("failed to access camera/microphone: {0}")]
    Media(#[from] media_session::MediaAcquisitionError),
    #[error("no incoming call to answer")]
    NoPendingOffer,
    #[error("signaling transport failure: {0}")]
    Signaling(String),
    #[error("peer connection failure: {0}")]
    PeerConnection(String),
}

/// Per-call state. The peer connection and the local media stream are owned
/// here exclusively and handed back for release on every exit path.
pub(crate) struct CallState {
    pub(crate) phase: CallPhase,
    /// Re-entrancy guard: one outbound call attempt at a time, held across
    /// the suspension points of call setup.
    pub(crate) dialing: bool,
    /// Bumped on every transition that invalidates previously spawned
    /// timer/monitor tasks.
    pub(crate) generation: u64,
    pub(crate) connection: Option<Arc<dyn PeerConnection>>,
    pub(crate) local_media: Option<Arc<dyn LocalMediaStream>>,
    pub(crate) pending_offer: Option<SessionDescription>,
    /// Candidates received before the remote description was set, in
    /// arrival order.
    pub(crate) queued_candidates: Vec<IceCandidateInit>,
    /// Candidate strings already queued or applied; replays are dropped.
    pub(crate) handled_candidates: HashSet<String>,
    pub(crate) remote_description_set: bool,
    pub(crate) ring_timer: Option<JoinHandle<()>>,
    pub(crate) monitor: Option<JoinHandle<()>>,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            dialing: false,
            generation: 0,
            connection: None,
            local_media: None,
            pending_offer: None,
            queued_candidates: Vec::new(),
            handled_candidates: HashSet::new(),
            remote_description_set: false,
            ring_timer: None,
            monitor: None,
        }
    }
}

pub(crate) struct CallResources {
    connection: Option<Arc<dyn PeerConnection>>,
    local_media: Option<Arc<dyn LocalMediaStream>>,
}

impl CallState {
    /// Clear every piece of per-call state and hand back the owned resources
    /// for release. Safe to run from any phase.
    fn teardown(&mut self) -> CallResources {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.pending_offer = None;
        self.queued_candidates.clear();
        self.handled_candidates.clear();
        self.remote_description_set = false;
        self.dialing = false;
        self.phase = CallPhase::Idle;
        self.generation = self.generation.wrapping_add(1);
        CallResources {
            connection: self.connection.take(),
            local_media: self.local_media.take(),
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self.phase, CallPhase::Idle)
            && !self.dialing
            && self.connection.is_none()
            && self.pending_offer.is_none()
    }
}

async fn release(resources: CallResources) {
    // Camera/microphone release happens synchronously with the end action,
    // before the connection close suspends.
    if let Some(media) = resources.local_media {
        media.stop();
    }
    if let Some(connection) = resources.connection {
        connection.close().await;
    }
}

impl ChatClient {
    /// Place an outbound call. Media is acquired before any peer connection
    /// exists, so an acquisition failure leaves nothing to clean up.
    pub async fn start_call(self: &Arc<Self>, peer: UserId) -> Result<(), CallSetupError> {
        {
            let mut call = self.call.lock().await;
            if let Some(current) = call.phase.peer() {
                return Err(CallSetupError::Busy(current.clone()));
            }
            if call.dialing {
                // A second invocation while the first is still setting up
                // must not produce a second offer.
                debug!(peer = %peer, "start_call ignored; dial already in progress");
                return Ok(());
            }
            call.dialing = true;
        }

        let media = match self.media.acquire_camera_mic().await {
            Ok(media) => media,
            Err(err) => {
                self.call.lock().await.dialing = false;
                self.emit(ClientEvent::Error(format!(
                    "camera/microphone unavailable: {err}"
                )));
                return Err(CallSetupError::Media(err));
            }
        };

        let connection = match self.ensure_peer_connection().await {
            Ok(connection) => connection,
            Err(err) => return self.abort_dial(media, None, err).await,
        };
        let connection_events = connection.subscribe_events();

        if let Err(err) = connection.attach_local_stream(Arc::clone(&media)).await {
            let err = CallSetupError::PeerConnection(err.to_string());
            return self.abort_dial(media, Some(connection), err).await;
        }

        if let Err(err) = self
            .channel
            .send(ClientRequest::CallJoin {
                with_user_id: peer.clone(),
            })
            .await
        {
            let err = CallSetupError::Signaling(err.to_string());
            return self.abort_dial(media, Some(connection), err).await;
        }

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                let err = CallSetupError::PeerConnection(err.to_string());
                return self.abort_dial(media, Some(connection), err).await;
            }
        };
        if let Err(err) = self
            .channel
            .send(ClientRequest::CallSignal {
                with_user_id: peer.clone(),
                data: CallSignal::Offer(offer).into(),
            })
            .await
        {
            let err = CallSetupError::Signaling(err.to_string());
            return self.abort_dial(media, Some(connection), err).await;
        }

        let generation = {
            let mut call = self.call.lock().await;
            if !call.dialing {
                // end_call raced the dial; drop everything built so far.
                drop(call);
                media.stop();
                connection.close().await;
                return Ok(());
            }
            call.dialing = false;
            call.phase = CallPhase::Offering { peer: peer.clone() };
            call.connection = Some(Arc::clone(&connection));
            call.local_media = Some(Arc::clone(&media));
            call.remote_description_set = false;
            call.generation = call.generation.wrapping_add(1);
            call.generation
        };
        let monitor = self.spawn_connection_monitor(peer.clone(), connection_events, generation);
        self.call.lock().await.monitor = Some(monitor);

        info!(peer = %peer, "offer sent; waiting for answer");
        self.emit(ClientEvent::LocalStreamAttached {
            peer: peer.clone(),
            handle: media.handle(),
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Offering { peer },
        });
        Ok(())
    }

    async fn abort_dial(
        &self,
        media: Arc<dyn LocalMediaStream>,
        connection: Option<Arc<dyn PeerConnection>>,
        err: CallSetupError,
    ) -> Result<(), CallSetupError> {
        media.stop();
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.call.lock().await.dialing = false;
        self.emit(ClientEvent::Error(err.to_string()));
        Err(err)
    }

    /// Accept the pending inbound offer. Order matters: remote description
    /// first, then media, then the answer, then the queued-candidate drain.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallSetupError> {
        let (caller, offer) = {
            let mut call = self.call.lock().await;
            let caller = match &call.phase {
                CallPhase::Ringing { caller } => caller.clone(),
                _ => return Err(CallSetupError::NoPendingOffer),
            };
            let offer = call
                .pending_offer
                .take()
                .ok_or(CallSetupError::NoPendingOffer)?;
            (caller, offer)
        };

        if let Err(err) = self
            .channel
            .send(ClientRequest::CallJoin {
                with_user_id: caller.clone(),
            })
            .await
        {
            return self
                .fail_accept(CallSetupError::Signaling(err.to_string()))
                .await;
        }

        let connection = match self.ensure_peer_connection().await {
            Ok(connection) => connection,
            Err(err) => return self.fail_accept(err).await,
        };
        let connection_events = connection.subscribe_events();

        if let Err(err) = connection.set_remote_description(offer).await {
            return self
                .fail_accept(CallSetupError::PeerConnection(err.to_string()))
                .await;
        }
        {
            let mut call = self.call.lock().await;
            call.connection = Some(Arc::clone(&connection));
            call.remote_description_set = true;
        }

        let media = match self.media.acquire_camera_mic().await {
            Ok(media) => media,
            Err(err) => {
                // Returns the callee to Idle; the stored offer is already
                // discarded and the ring timer dies with the teardown.
                return self.fail_accept(CallSetupError::Media(err)).await;
            }
        };

        if let Err(err) = connection.attach_local_stream(Arc::clone(&media)).await {
            media.stop();
            return self
                .fail_accept(CallSetupError::PeerConnection(err.to_string()))
                .await;
        }

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                media.stop();
                return self
                    .fail_accept(CallSetupError::PeerConnection(err.to_string()))
                    .await;
            }
        };
        if let Err(err) = self
            .channel
            .send(ClientRequest::CallSignal {
                with_user_id: caller.clone(),
                data: CallSignal::Answer(answer).into(),
            })
            .await
        {
            media.stop();
            return self
                .fail_accept(CallSetupError::Signaling(err.to_string()))
                .await;
        }

        let (generation, queued) = {
            let mut call = self.call.lock().await;
            if let Some(timer) = call.ring_timer.take() {
                timer.abort();
            }
            call.local_media = Some(Arc::clone(&media));
            call.phase = CallPhase::Connected {
                peer: caller.clone(),
            };
            (call.generation, std::mem::take(&mut call.queued_candidates))
        };
        self.drain_candidates(&connection, queued).await;
        let monitor = self.spawn_connection_monitor(caller.clone(), connection_events, generation);
        self.call.lock().await.monitor = Some(monitor);

        info!(caller = %caller, "call accepted");
        self.emit(ClientEvent::LocalStreamAttached {
            peer: caller.clone(),
            handle: media.handle(),
        });
        self.emit(ClientEvent::CallConnected {
            peer: caller.clone(),
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Connected { peer: caller },
        });
        Ok(())
    }

    async fn fail_accept(&self, err: CallSetupError) -> Result<(), CallSetupError> {
        let resources = { self.call.lock().await.teardown() };
        release(resources).await;
        self.emit(ClientEvent::Error(err.to_string()));
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Idle,
        });
        Err(err)
    }

    /// Decline the pending inbound offer. A no-op outside `Ringing`.
    pub async fn decline_call(&self) -> anyhow::Result<()> {
        let (caller, resources) = {
            let mut call = self.call.lock().await;
            let caller = match &call.phase {
                CallPhase::Ringing { caller } => caller.clone(),
                _ => return Ok(()),
            };
            (caller, call.teardown())
        };
        release(resources).await;
        if let Err(err) = self
            .channel
            .send(ClientRequest::CallEnd {
                with_user_id: caller.clone(),
            })
            .await
        {
            debug!(caller = %caller, %err, "decline signal failed");
        }
        info!(caller = %caller, "incoming call declined");
        self.emit(ClientEvent::CallEnded {
            peer: caller,
            reason: CallEndReason::Declined,
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Idle,
        });
        Ok(())
    }

    /// The sole cancellation primitive. Safe in every state; in `Idle` it is
    /// a no-op with no side effects.
    pub async fn end_call(&self) -> anyhow::Result<()> {
        let (peer, resources) = {
            let mut call = self.call.lock().await;
            if call.is_idle() {
                return Ok(());
            }
            (call.phase.peer().cloned(), call.teardown())
        };
        release(resources).await;
        if let Some(peer) = peer {
            if let Err(err) = self
                .channel
                .send(ClientRequest::CallEnd {
                    with_user_id: peer.clone(),
                })
                .await
            {
                debug!(peer = %peer, %err, "call-end signal failed");
            }
            self.emit(ClientEvent::CallEnded {
                peer,
                reason: CallEndReason::HungUp,
            });
        }
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Idle,
        });
        Ok(())
    }

    pub(crate) async fn on_call_signal(self: &Arc<Self>, from: UserId, signal: CallSignal) {
        match signal {
            CallSignal::Offer(offer) => self.on_incoming_offer(from, offer).await,
            CallSignal::Answer(answer) => self.on_incoming_answer(from, answer).await,
            CallSignal::Candidate(candidate) => self.on_incoming_candidate(from, candidate).await,
        }
    }

    async fn on_incoming_offer(self: &Arc<Self>, caller: UserId, offer: SessionDescription) {
        {
            let mut call = self.call.lock().await;
            if !call.is_idle() {
                // Busy with another call or mid-dial; an expected race, not
                // an error. No auto-answer either way.
                debug!(caller = %caller, "ignoring offer while call state is busy");
                return;
            }
            call.pending_offer = Some(offer);
            call.phase = CallPhase::Ringing {
                caller: caller.clone(),
            };
            call.generation = call.generation.wrapping_add(1);
            let generation = call.generation;
            let client = Arc::clone(self);
            let from = caller.clone();
            let ring_timeout = self.config.ring_timeout;
            call.ring_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(ring_timeout).await;
                client.on_ring_timeout(from, generation).await;
            }));
        }
        info!(caller = %caller, "incoming call ringing");
        self.emit(ClientEvent::IncomingCall {
            from: caller.clone(),
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Ringing { caller },
        });
    }

    async fn on_incoming_answer(&self, from: UserId, answer: SessionDescription) {
        let connection = {
            let call = self.call.lock().await;
            match (&call.phase, &call.connection) {
                (CallPhase::Offering { peer }, Some(connection)) if *peer == from => {
                    Arc::clone(connection)
                }
                _ => {
                    debug!(from = %from, "ignoring answer without a matching outbound call");
                    return;
                }
            }
        };

        if let Err(err) = connection.set_remote_description(answer).await {
            warn!(from = %from, %err, "failed to apply answer; ending call");
            let resources = { self.call.lock().await.teardown() };
            release(resources).await;
            self.emit(ClientEvent::CallEnded {
                peer: from,
                reason: CallEndReason::TransportFailed,
            });
            self.emit(ClientEvent::CallStateChanged {
                phase: CallPhase::Idle,
            });
            return;
        }

        let queued = {
            let mut call = self.call.lock().await;
            call.remote_description_set = true;
            call.phase = CallPhase::Connected { peer: from.clone() };
            std::mem::take(&mut call.queued_candidates)
        };
        self.drain_candidates(&connection, queued).await;

        info!(peer = %from, "call connected");
        self.emit(ClientEvent::CallConnected { peer: from.clone() });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Connected { peer: from },
        });
    }

    async fn on_incoming_candidate(&self, from: UserId, candidate: IceCandidateInit) {
        let connection = {
            let mut call = self.call.lock().await;
            let in_call = call.phase.peer().is_some_and(|peer| *peer == from);
            if !in_call {
                // Candidate for a call that already ended; expected race.
                debug!(from = %from, "ignoring candidate without an active call");
                return;
            }
            if !call.handled_candidates.insert(candidate.candidate.clone()) {
                debug!(from = %from, "ignoring replayed candidate");
                return;
            }
            if !call.remote_description_set {
                // Applying before the remote description exists is invalid
                // on the transport; hold it until the drain.
                call.queued_candidates.push(candidate);
                return;
            }
            call.connection.clone()
        };
        if let Some(connection) = connection {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                debug!(from = %from, %err, "late candidate rejected");
            }
        }
    }

    /// Apply queued candidates in their original arrival order.
    async fn drain_candidates(
        &self,
        connection: &Arc<dyn PeerConnection>,
        queued: Vec<IceCandidateInit>,
    ) {
        for candidate in queued {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                debug!(%err, "queued candidate rejected");
            }
        }
    }

    async fn on_ring_timeout(&self, caller: UserId, generation: u64) {
        let resources = {
            let mut call = self.call.lock().await;
            if call.generation != generation
                || !matches!(call.phase, CallPhase::Ringing { .. })
                || call.pending_offer.is_none()
            {
                return;
            }
            // This handler runs on the ring-timer task itself; detach the
            // handle so the teardown does not abort its own cleanup.
            drop(call.ring_timer.take());
            call.teardown()
        };
        release(resources).await;

        info!(caller = %caller, "incoming call not answered; recording missed call");
        self.record_missed_call(&caller, false).await;
        // Tell the caller so both timelines converge even though each side
        // detects the miss independently.
        if let Err(err) = self
            .channel
            .send(ClientRequest::CallMissed {
                with_user_id: caller.clone(),
            })
            .await
        {
            debug!(caller = %caller, %err, "missed-call signal failed");
        }
        self.emit(ClientEvent::CallEnded {
            peer: caller,
            reason: CallEndReason::Missed,
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Idle,
        });
    }

    pub(crate) async fn on_remote_call_end(&self, from: UserId) {
        let resources = {
            let mut call = self.call.lock().await;
            if !call.phase.peer().is_some_and(|peer| *peer == from) {
                debug!(from = %from, "ignoring call-end without a matching call");
                return;
            }
            call.teardown()
        };
        release(resources).await;
        info!(peer = %from, "call ended by remote peer");
        self.emit(ClientEvent::CallEnded {
            peer: from,
            reason: CallEndReason::HungUp,
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Idle,
        });
    }

    pub(crate) async fn on_call_missed(&self, from: UserId) {
        let resources = {
            let mut call = self.call.lock().await;
            let outbound = matches!(&call.phase, CallPhase::Offering { peer } if *peer == from);
            if !outbound {
                debug!(from = %from, "ignoring missed-call signal without an outbound call");
                return;
            }
            call.teardown()
        };
        release(resources).await;
        info!(peer = %from, "outbound call went unanswered");
        self.record_missed_call(&from, true).await;
        self.emit(ClientEvent::CallEnded {
            peer: from,
            reason: CallEndReason::Missed,
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Idle,
        });
    }

    async fn on_connection_terminal(&self, peer: UserId, generation: u64) {
        let resources = {
            let mut call = self.call.lock().await;
            if call.generation != generation || call.is_idle() {
                return;
            }
            // Runs on the monitor task; detach the handle so the teardown
            // does not abort its own cleanup.
            drop(call.monitor.take());
            call.teardown()
        };
        release(resources).await;
        // Implicit end from the local side; not auto-retried.
        self.emit(ClientEvent::CallEnded {
            peer,
            reason: CallEndReason::TransportFailed,
        });
        self.emit(ClientEvent::CallStateChanged {
            phase: CallPhase::Idle,
        });
    }

    /// Reuse the held connection only while it is still usable; a closed or
    /// failed leftover from a previous call is discarded and replaced with a
    /// fresh one.
    async fn ensure_peer_connection(
        &self,
    ) -> Result<Arc<dyn PeerConnection>, CallSetupError> {
        let existing = { self.call.lock().await.connection.clone() };
        if let Some(connection) = existing {
            let state = connection.connection_state();
            if !matches!(
                state,
                PeerConnectionState::Failed | PeerConnectionState::Closed
            ) {
                return Ok(connection);
            }
            debug!(?state, "discarding stale peer connection");
            self.call.lock().await.connection = None;
        }
        self.peer_connections
            .create_connection()
            .await
            .map_err(|err| CallSetupError::PeerConnection(err.to_string()))
    }

    fn spawn_connection_monitor(
        self: &Arc<Self>,
        peer: UserId,
        mut events: broadcast::Receiver<PeerEvent>,
        generation: u64,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if client.call.lock().await.generation != generation {
                    break;
                }
                match event {
                    PeerEvent::RemoteStream(handle) => {
                        client.emit(ClientEvent::RemoteStreamAttached {
                            peer: peer.clone(),
                            handle,
                        });
                    }
                    PeerEvent::LocalCandidate(candidate) => {
                        let data = CallSignal::Candidate(candidate).into();
                        if let Err(err) = client
                            .channel
                            .send(ClientRequest::CallSignal {
                                with_user_id: peer.clone(),
                                data,
                            })
                            .await
                        {
                            debug!(peer = %peer, %err, "candidate forward failed");
                        }
                    }
                    PeerEvent::StateChanged(state) if state.is_terminal() => {
                        warn!(peer = %peer, ?state, "peer connection reached terminal state");
                        client.on_connection_terminal(peer.clone(), generation).await;
                        break;
                    }
                    PeerEvent::StateChanged(state) => {
                        debug!(peer = %peer, ?state, "peer connection state changed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
