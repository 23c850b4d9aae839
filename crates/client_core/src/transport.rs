use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

const RECONNECT_MIN_BACKOFF: Duration = Duration::from_millis(250);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// What channel subscribers see: wire events plus transport transitions.
#[derive(Debug, Clone)]
pub enum ChannelNotice {
    Event(ServerEvent),
    /// Transport (re)established; conversation rooms must be re-joined.
    Online,
    /// Transport dropped; local state is kept while a reconnect runs.
    Offline,
}

/// The bidirectional per-session event pipe. Constructed once per
/// authenticated session and injected, never ambient, so tests can
/// substitute a double.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn send(&self, request: ClientRequest) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<ChannelNotice>;
    async fn disconnect(&self) -> Result<()>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketChannel {
    notices: broadcast::Sender<ChannelNotice>,
    outbound: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketChannel {
    pub async fn connect(server_url: &str, user_id: &UserId) -> Result<Arc<Self>> {
        let ws_url = websocket_url(server_url, user_id)?;
        let (socket, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;

        let (notices, _) = broadcast::channel(256);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(run_socket(
            ws_url,
            socket,
            outbound_rx,
            notices.clone(),
            Arc::clone(&closed),
        ));

        Ok(Arc::new(Self {
            notices,
            outbound,
            closed,
            pump: Mutex::new(Some(pump)),
        }))
    }
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    async fn send(&self, request: ClientRequest) -> Result<()> {
        let text = serde_json::to_string(&request).context("failed to encode frame")?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| anyhow!("channel is disconnected"))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        let _ = self.notices.send(ChannelNotice::Offline);
        Ok(())
    }
}

fn websocket_url(server_url: &str, user_id: &UserId) -> Result<String> {
    let mut url = Url::parse(server_url).context("invalid server url")?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("server url must be http(s), got {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to derive websocket scheme"))?;
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", user_id.as_str());
    Ok(url.to_string())
}

async fn run_socket(
    ws_url: String,
    mut socket: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    notices: broadcast::Sender<ChannelNotice>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let _ = notices.send(ChannelNotice::Online);

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = socket.send(frame).await {
                            warn!(%err, "websocket send failed");
                            break;
                        }
                    }
                    // The channel handle was dropped; nothing left to pump.
                    None => return,
                },
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                let _ = notices.send(ChannelNotice::Event(event));
                            }
                            Err(err) => warn!(%err, "invalid server event"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "websocket receive failed");
                        break;
                    }
                },
            }
        }

        let _ = notices.send(ChannelNotice::Offline);
        if closed.load(Ordering::SeqCst) {
            return;
        }

        let mut backoff = RECONNECT_MIN_BACKOFF;
        socket = loop {
            tokio::time::sleep(backoff).await;
            if closed.load(Ordering::SeqCst) {
                return;
            }
            match connect_async(&ws_url).await {
                Ok((socket, _)) => break socket,
                Err(err) => {
                    debug!(%err, ?backoff, "websocket reconnect failed");
                    backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ws_url_from_http_base() {
        let url = websocket_url("http://127.0.0.1:9000", &UserId::new("u-1")).expect("url");
        assert_eq!(url, "ws://127.0.0.1:9000/ws?user_id=u-1");
    }

    #[test]
    fn derives_wss_url_from_https_base() {
        let url = websocket_url("https://relay.example.org", &UserId::new("u-2")).expect("url");
        assert_eq!(url, "wss://relay.example.org/ws?user_id=u-2");
    }

    #[test]
    fn rejects_non_http_base() {
        assert!(websocket_url("ftp://relay.example.org", &UserId::new("u-3")).is_err());
    }
}
