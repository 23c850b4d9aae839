use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use media_session::{MediaSource, MediaStreamHandle, PeerConnectionFactory};
use shared::{
    domain::{ConversationId, MediaType, MessageId, PresenceRecord, UserId},
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod call;
pub mod presence;
pub mod store;
pub mod transport;

use call::{CallEndReason, CallPhase, CallState};
use presence::{Presence, PresenceTracker};
use store::ConversationStore;
use transport::{ChannelNotice, RealtimeChannel};

/// Behavioral knobs. The timeouts are configuration, not protocol: nothing
/// in the signaling depends on their exact values.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long an incoming call rings before it is recorded as missed.
    pub ring_timeout: Duration,
    /// Quiet period after the last keystroke before typing=false is sent.
    pub typing_quiet_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            typing_quiet_window: Duration::from_millis(1500),
        }
    }
}

/// Identity of one timeline row. Local keys belong to optimistic rows and
/// synthetic entries; they never enter the durable id space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Local(Uuid),
    Durable(MessageId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryBody {
    Text(String),
    Media { url: String, media_type: MediaType },
    /// Synthetic row recording a call nobody answered.
    MissedCall,
}

/// One row of the client-visible message list for a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub key: EntryKey,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub body: EntryBody,
    pub created_at: DateTime<Utc>,
    pub seen_at: Option<DateTime<Utc>>,
    /// True while the row is optimistic and its durable echo is pending.
    pub pending: bool,
}

impl TimelineEntry {
    fn from_payload(message: &MessagePayload) -> Self {
        let body = match (&message.text, &message.media_url) {
            (_, Some(url)) => EntryBody::Media {
                url: url.clone(),
                media_type: message.media_type.unwrap_or(MediaType::File),
            },
            (Some(text), None) => EntryBody::Text(text.clone()),
            (None, None) => EntryBody::Text(String::new()),
        };
        Self {
            key: EntryKey::Durable(message.message_id.clone()),
            from_user_id: message.from_user_id.clone(),
            to_user_id: message.to_user_id.clone(),
            body,
            created_at: message.created_at,
            seen_at: message.seen_at,
            pending: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// History finished loading for the peer (possibly degraded to live-only).
    ConversationLoaded { peer: UserId },
    TimelineUpdated { peer: UserId },
    /// First contact from a user not yet in the visible peer list.
    PeerDiscovered { peer: UserId },
    PresenceChanged { presence: PresenceRecord },
    TypingChanged { peer: UserId, typing: bool },
    SeenUpdated { peer: UserId },
    IncomingCall { from: UserId },
    CallStateChanged { phase: CallPhase },
    CallConnected { peer: UserId },
    CallEnded { peer: UserId, reason: CallEndReason },
    LocalStreamAttached { peer: UserId, handle: MediaStreamHandle },
    RemoteStreamAttached { peer: UserId, handle: MediaStreamHandle },
    ChannelOnline,
    ChannelOffline,
    Error(String),
}

#[derive(Debug, Clone)]
enum OutgoingBody {
    Text(String),
    Media { url: String, media_type: MediaType },
}

impl OutgoingBody {
    fn into_entry_body(self) -> EntryBody {
        match self {
            Self::Text(text) => EntryBody::Text(text),
            Self::Media { url, media_type } => EntryBody::Media { url, media_type },
        }
    }

    fn wire_fields(&self) -> (Option<String>, Option<String>, Option<MediaType>) {
        match self {
            Self::Text(text) => (Some(text.clone()), None, None),
            Self::Media { url, media_type } => (None, Some(url.clone()), Some(*media_type)),
        }
    }
}

#[derive(Default)]
struct SessionState {
    active_peer: Option<UserId>,
    peers: Vec<UserId>,
    timelines: HashMap<UserId, Vec<TimelineEntry>>,
    conversations: HashMap<UserId, ConversationId>,
    /// Every message id ever rendered; duplicate deliveries collapse here.
    seen_ids: HashSet<MessageId>,
    /// Peers with a history fetch in flight; live events buffer until done.
    loading: HashSet<UserId>,
    live_buffer: HashMap<UserId, Vec<MessagePayload>>,
    typing_peers: HashMap<UserId, bool>,
    typing_burst: bool,
    typing_timer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn discover_peer(&mut self, peer: &UserId) -> bool {
        if self.peers.contains(peer) {
            false
        } else {
            self.peers.push(peer.clone());
            true
        }
    }

    /// Dedupe-append a live message. Returns whether the timeline changed.
    fn append_message(&mut self, peer: &UserId, message: &MessagePayload) -> bool {
        if self.seen_ids.contains(&message.message_id) {
            return false;
        }
        self.seen_ids.insert(message.message_id.clone());
        self.timelines
            .entry(peer.clone())
            .or_default()
            .push(TimelineEntry::from_payload(message));
        true
    }
}

/// Client-side core for one authenticated session: owns the active
/// conversation, per-peer timelines, presence, typing state and the call
/// signaling state machine. All collaborators are injected capabilities.
pub struct ChatClient {
    pub(crate) self_id: UserId,
    pub(crate) config: ClientConfig,
    pub(crate) channel: Arc<dyn RealtimeChannel>,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) media: Arc<dyn MediaSource>,
    pub(crate) peer_connections: Arc<dyn PeerConnectionFactory>,
    pub(crate) presence: PresenceTracker,
    state: Mutex<SessionState>,
    pub(crate) call: Mutex<CallState>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(
        self_id: UserId,
        config: ClientConfig,
        channel: Arc<dyn RealtimeChannel>,
        store: Arc<dyn ConversationStore>,
        media: Arc<dyn MediaSource>,
        peer_connections: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            self_id,
            config,
            channel,
            store,
            media,
            peer_connections,
            presence: PresenceTracker::default(),
            state: Mutex::new(SessionState::default()),
            call: Mutex::new(CallState::default()),
            events,
            pump: Mutex::new(None),
        })
    }

    /// Start consuming channel notices. Separate from construction so the
    /// caller can subscribe to client events before the first notice lands.
    pub async fn start(self: &Arc<Self>) {
        let mut notices = self.channel.subscribe();
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match notices.recv().await {
                    Ok(notice) => client.handle_notice(notice).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "channel notices lagged; id tracking absorbs replays");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Tear the session down: stop the pump, end any call, dispose the
    /// channel. The channel object must not be reused afterwards.
    pub async fn sign_out(&self) {
        if let Some(task) = self.pump.lock().await.take() {
            task.abort();
        }
        if let Err(err) = self.end_call().await {
            debug!(%err, "end_call during sign-out failed");
        }
        if let Err(err) = self.channel.disconnect().await {
            debug!(%err, "channel disconnect during sign-out failed");
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn handle_notice(self: &Arc<Self>, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Event(event) => self.handle_server_event(event).await,
            ChannelNotice::Online => {
                let active = { self.state.lock().await.active_peer.clone() };
                if let Some(peer) = active {
                    info!(peer = %peer, "channel online; re-joining active conversation");
                    if let Err(err) = self
                        .channel
                        .send(ClientRequest::JoinConversation { with_user_id: peer })
                        .await
                    {
                        warn!(%err, "re-join after reconnect failed");
                    }
                }
                self.emit(ClientEvent::ChannelOnline);
            }
            ChannelNotice::Offline => {
                debug!("channel offline; local state is kept");
                self.emit(ClientEvent::ChannelOffline);
            }
        }
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Presence {
                user_id,
                online,
                last_seen,
            } => {
                let record = PresenceRecord {
                    user_id,
                    online,
                    last_seen,
                };
                if self.presence.observe(record.clone()) {
                    self.emit(ClientEvent::PresenceChanged { presence: record });
                }
            }
            ServerEvent::Typing {
                from_user_id,
                typing,
            } => {
                self.state
                    .lock()
                    .await
                    .typing_peers
                    .insert(from_user_id.clone(), typing);
                self.emit(ClientEvent::TypingChanged {
                    peer: from_user_id,
                    typing,
                });
            }
            ServerEvent::MessageReceived { message } => self.handle_live_message(message).await,
            ServerEvent::ConversationSeen {
                conversation_id,
                by_user_id,
                seen_at,
            } => {
                self.apply_seen(conversation_id, by_user_id, seen_at).await;
            }
            ServerEvent::CallSignal { from_user_id, data } => match data.classify() {
                Ok(signal) => self.on_call_signal(from_user_id, signal).await,
                Err(err) => {
                    debug!(from = %from_user_id, %err, "ignoring unclassifiable call signal");
                }
            },
            ServerEvent::CallPeerJoined { with_user_id } => {
                debug!(peer = %with_user_id, "peer joined the call room");
            }
            ServerEvent::CallEnded { from_user_id } => self.on_remote_call_end(from_user_id).await,
            ServerEvent::CallMissed { from_user_id } => self.on_call_missed(from_user_id).await,
            ServerEvent::Error(error) => {
                warn!(%error, "server reported error");
                self.emit(ClientEvent::Error(error.to_string()));
            }
        }
    }

    async fn handle_live_message(&self, message: MessagePayload) {
        if message.from_user_id == self.self_id {
            // Echo of our own optimistic send; the REST append reconciles it.
            debug!(message_id = %message.message_id, "discarding own echo");
            return;
        }

        let peer = message.from_user_id.clone();
        let (discovered, appended) = {
            let mut state = self.state.lock().await;
            let discovered = state.discover_peer(&peer);
            state
                .conversations
                .insert(peer.clone(), message.conversation_id.clone());

            if state.loading.contains(&peer) {
                // History fetch in flight; merge once it lands instead of
                // racing the authoritative baseline.
                state
                    .live_buffer
                    .entry(peer.clone())
                    .or_default()
                    .push(message);
                (discovered, false)
            } else {
                let appended = state.append_message(&peer, &message);
                (discovered, appended)
            }
        };

        if discovered {
            self.emit(ClientEvent::PeerDiscovered { peer: peer.clone() });
        }
        if appended {
            self.emit(ClientEvent::TimelineUpdated { peer });
        }
    }

    async fn apply_seen(
        &self,
        conversation_id: ConversationId,
        by_user_id: UserId,
        seen_at: DateTime<Utc>,
    ) {
        let updated = {
            let mut state = self.state.lock().await;
            let Some(timeline) = state.timelines.get_mut(&by_user_id) else {
                debug!(conversation = %conversation_id, "seen update for unknown peer");
                return;
            };
            let mut updated = false;
            for entry in timeline.iter_mut() {
                if entry.from_user_id == self.self_id
                    && entry.seen_at.is_none()
                    && entry.body != EntryBody::MissedCall
                {
                    entry.seen_at = Some(seen_at);
                    updated = true;
                }
            }
            updated
        };
        if updated {
            self.emit(ClientEvent::SeenUpdated { peer: by_user_id });
        }
    }

    /// Switch the active conversation. History loads first and replaces the
    /// local list wholesale, then the realtime room is joined; live events
    /// arriving mid-fetch are buffered and merged, never dropped.
    pub async fn select_peer(&self, peer: UserId) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.active_peer = Some(peer.clone());
            state.discover_peer(&peer);
            state.loading.insert(peer.clone());
        }

        let history = self.store.fetch_history(&self.self_id, &peer).await;

        let (load_error, conversation_id) = {
            let mut state = self.state.lock().await;
            let mut load_error = None;
            match history {
                Ok(history) => {
                    let mut entries = Vec::with_capacity(history.messages.len());
                    for message in &history.messages {
                        state.seen_ids.insert(message.message_id.clone());
                        entries.push(TimelineEntry::from_payload(message));
                    }
                    state.timelines.insert(peer.clone(), entries);
                    state
                        .conversations
                        .insert(peer.clone(), history.conversation_id);
                }
                Err(err) => {
                    // Degrade to a live-only view; the room join below still
                    // happens and the current list stays as the baseline.
                    load_error = Some(err);
                }
            }
            let buffered = state.live_buffer.remove(&peer).unwrap_or_default();
            for message in &buffered {
                state.append_message(&peer, message);
            }
            state.loading.remove(&peer);
            (load_error, state.conversations.get(&peer).cloned())
        };

        self.emit(ClientEvent::ConversationLoaded { peer: peer.clone() });
        self.emit(ClientEvent::TimelineUpdated { peer: peer.clone() });
        if let Some(err) = &load_error {
            warn!(peer = %peer, error = %err, "history load failed; showing live-only view");
            self.emit(ClientEvent::Error(format!(
                "failed to load history for {peer}: {err}"
            )));
        }

        if let Err(err) = self
            .channel
            .send(ClientRequest::JoinConversation {
                with_user_id: peer.clone(),
            })
            .await
        {
            warn!(peer = %peer, %err, "conversation join failed; retried on reconnect");
        }

        // Seen receipts are advisory and fire-and-forget.
        if let Some(conversation_id) = conversation_id {
            if let Err(err) = self
                .channel
                .send(ClientRequest::MarkSeen { conversation_id })
                .await
            {
                debug!(peer = %peer, %err, "mark-seen emit failed");
            }
        }

        // Point-in-time presence snapshot for the selected peer.
        match self.store.fetch_presence(&peer).await {
            Ok(record) => {
                if self.presence.observe(record.clone()) {
                    self.emit(ClientEvent::PresenceChanged { presence: record });
                }
            }
            Err(err) => debug!(peer = %peer, %err, "presence snapshot unavailable"),
        }

        match load_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_outgoing(OutgoingBody::Text(text.to_string()))
            .await
    }

    pub async fn send_media(&self, media_url: &str, media_type: MediaType) -> Result<()> {
        self.send_outgoing(OutgoingBody::Media {
            url: media_url.to_string(),
            media_type,
        })
        .await
    }

    pub async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        self.store.upload_media(bytes, mime_type).await
    }

    async fn send_outgoing(&self, body: OutgoingBody) -> Result<()> {
        let peer = { self.state.lock().await.active_peer.clone() }
            .ok_or_else(|| anyhow!("no active conversation"))?;
        let conversation_id = {
            let mut state = self.state.lock().await;
            let self_id = self.self_id.clone();
            state
                .conversations
                .entry(peer.clone())
                .or_insert_with(|| ConversationId::for_pair(&self_id, &peer))
                .clone()
        };

        let temp_id = Uuid::new_v4();
        let created_at = Utc::now();
        let entry = TimelineEntry {
            key: EntryKey::Local(temp_id),
            from_user_id: self.self_id.clone(),
            to_user_id: peer.clone(),
            body: body.clone().into_entry_body(),
            created_at,
            seen_at: None,
            pending: true,
        };
        {
            let mut state = self.state.lock().await;
            state.timelines.entry(peer.clone()).or_default().push(entry);
        }
        self.emit(ClientEvent::TimelineUpdated { peer: peer.clone() });

        // Dual write: the channel gives the peer's open session low-latency
        // delivery, the REST append is the durable record. Either leg may
        // lag; the timeline converges on the durable record below.
        let (text, media_url, media_type) = body.wire_fields();
        let wire = MessagePayload {
            message_id: MessageId::new(temp_id.to_string()),
            conversation_id,
            from_user_id: self.self_id.clone(),
            to_user_id: peer.clone(),
            text,
            media_url,
            media_type,
            created_at,
            seen_at: None,
        };
        if let Err(err) = self
            .channel
            .send(ClientRequest::SendMessage { message: wire })
            .await
        {
            warn!(peer = %peer, %err, "live fan-out failed; message still persists via the store");
        }

        let appended = match body {
            OutgoingBody::Text(text) => self.store.append_text(&self.self_id, &peer, &text).await,
            OutgoingBody::Media { url, media_type } => {
                self.store
                    .append_media(&self.self_id, &peer, &url, media_type)
                    .await
            }
        };
        match appended {
            Ok(durable) => {
                self.reconcile_optimistic(&peer, temp_id, durable).await;
                Ok(())
            }
            Err(err) => {
                self.emit(ClientEvent::Error(format!(
                    "message not persisted yet: {err}"
                )));
                Err(err)
            }
        }
    }

    /// Swap the optimistic row for its durable record; exactly one entry for
    /// the logical message survives, keyed by the durable id.
    async fn reconcile_optimistic(&self, peer: &UserId, temp_id: Uuid, durable: MessagePayload) {
        {
            let mut state = self.state.lock().await;
            state.seen_ids.insert(durable.message_id.clone());
            let durable_key = EntryKey::Durable(durable.message_id.clone());
            let timeline = state.timelines.entry(peer.clone()).or_default();
            if let Some(slot) = timeline
                .iter_mut()
                .find(|entry| entry.key == EntryKey::Local(temp_id))
            {
                *slot = TimelineEntry::from_payload(&durable);
            } else if !timeline.iter().any(|entry| entry.key == durable_key) {
                // A wholesale history replace raced the append; plain append.
                timeline.push(TimelineEntry::from_payload(&durable));
            }
        }
        self.emit(ClientEvent::TimelineUpdated { peer: peer.clone() });
    }

    /// Leading-edge typing indicator with a trailing quiet-window stop. The
    /// sender owns expiry; receivers trust the explicit false.
    pub async fn on_draft_change(self: &Arc<Self>, draft: &str) {
        let peer = { self.state.lock().await.active_peer.clone() };
        let Some(peer) = peer else { return };

        if draft.is_empty() {
            let was_typing = {
                let mut state = self.state.lock().await;
                if let Some(timer) = state.typing_timer.take() {
                    timer.abort();
                }
                std::mem::take(&mut state.typing_burst)
            };
            if was_typing {
                self.send_typing(&peer, false).await;
            }
            return;
        }

        let start_of_burst = {
            let mut state = self.state.lock().await;
            if let Some(timer) = state.typing_timer.take() {
                timer.abort();
            }
            let start = !state.typing_burst;
            state.typing_burst = true;
            let client = Arc::clone(self);
            let quiet = self.config.typing_quiet_window;
            let target = peer.clone();
            state.typing_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(quiet).await;
                client.on_typing_quiet(target).await;
            }));
            start
        };
        if start_of_burst {
            self.send_typing(&peer, true).await;
        }
    }

    async fn on_typing_quiet(&self, peer: UserId) {
        let was_typing = {
            let mut state = self.state.lock().await;
            state.typing_timer = None;
            std::mem::take(&mut state.typing_burst)
        };
        if was_typing {
            self.send_typing(&peer, false).await;
        }
    }

    async fn send_typing(&self, peer: &UserId, typing: bool) {
        if let Err(err) = self
            .channel
            .send(ClientRequest::Typing {
                to_user_id: peer.clone(),
                typing,
            })
            .await
        {
            debug!(peer = %peer, %err, "typing emit failed");
        }
    }

    /// Synthetic timeline row for a call that nobody answered. Both sides
    /// record one independently: the callee on ring timeout, the caller on
    /// receiving the missed-call signal.
    pub(crate) async fn record_missed_call(&self, peer: &UserId, outgoing: bool) {
        let (from, to) = if outgoing {
            (self.self_id.clone(), peer.clone())
        } else {
            (peer.clone(), self.self_id.clone())
        };
        let entry = TimelineEntry {
            key: EntryKey::Local(Uuid::new_v4()),
            from_user_id: from,
            to_user_id: to,
            body: EntryBody::MissedCall,
            created_at: Utc::now(),
            seen_at: None,
            pending: false,
        };
        let discovered = {
            let mut state = self.state.lock().await;
            let discovered = state.discover_peer(peer);
            state.timelines.entry(peer.clone()).or_default().push(entry);
            discovered
        };
        if discovered {
            self.emit(ClientEvent::PeerDiscovered { peer: peer.clone() });
        }
        self.emit(ClientEvent::TimelineUpdated { peer: peer.clone() });
    }

    pub async fn timeline(&self, peer: &UserId) -> Vec<TimelineEntry> {
        self.state
            .lock()
            .await
            .timelines
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn peers(&self) -> Vec<UserId> {
        self.state.lock().await.peers.clone()
    }

    pub async fn active_peer(&self) -> Option<UserId> {
        self.state.lock().await.active_peer.clone()
    }

    pub async fn peer_typing(&self, peer: &UserId) -> bool {
        self.state
            .lock()
            .await
            .typing_peers
            .get(peer)
            .copied()
            .unwrap_or(false)
    }

    pub fn presence_of(&self, peer: &UserId) -> Presence {
        self.presence.get(peer)
    }

    pub async fn call_phase(&self) -> CallPhase {
        self.call.lock().await.phase.clone()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
