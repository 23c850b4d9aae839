use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use shared::protocol::{IceCandidateInit, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStreamKind {
    Local,
    Remote,
}

/// Opaque handle the UI layer resolves to a render surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamHandle {
    pub stream_id: String,
    pub kind: MediaStreamKind,
}

#[derive(Debug, Error)]
pub enum MediaAcquisitionError {
    #[error("camera or microphone permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// A live camera+microphone capture. `stop` must release the devices
/// immediately, not on drop.
pub trait LocalMediaStream: Send + Sync {
    fn handle(&self) -> MediaStreamHandle;
    fn stop(&self);
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_camera_mic(&self)
        -> Result<Arc<dyn LocalMediaStream>, MediaAcquisitionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the connection can no longer carry media.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A remote track became available for rendering.
    RemoteStream(MediaStreamHandle),
    StateChanged(PeerConnectionState),
    /// Locally gathered candidate to forward to the remote peer.
    LocalCandidate(IceCandidateInit),
}

/// One peer connection, exclusively owned by the call coordinator.
///
/// `create_offer` and `create_answer` also install the produced description
/// as the local description. Adding a candidate before a remote description
/// has been set is an error on the underlying transport; callers are expected
/// to queue until then.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_local_stream(&self, stream: Arc<dyn LocalMediaStream>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> anyhow::Result<()>;
    fn connection_state(&self) -> PeerConnectionState;
    async fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> anyhow::Result<Arc<dyn PeerConnection>>;
}
