use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{ConversationId, PresenceRecord, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

mod config;

use config::load_settings;

type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// In-memory fan-out state. Message durability belongs to the external
/// conversation store; this relay only routes live frames and tracks
/// presence, so frames addressed to absent users are dropped.
#[derive(Default)]
struct Relay {
    peers: RwLock<HashMap<UserId, Outbox>>,
    presence: RwLock<HashMap<UserId, PresenceRecord>>,
    rooms: RwLock<HashMap<ConversationId, HashSet<UserId>>>,
}

impl Relay {
    async fn deliver(&self, user_id: &UserId, event: ServerEvent) {
        let peers = self.peers.read().await;
        match peers.get(user_id) {
            Some(outbox) => {
                if outbox.send(event).is_err() {
                    debug!(user = %user_id, "outbox closed mid-delivery");
                }
            }
            None => debug!(user = %user_id, "dropping frame for offline user"),
        }
    }

    async fn broadcast(&self, event: ServerEvent) {
        for outbox in self.peers.read().await.values() {
            let _ = outbox.send(event.clone());
        }
    }

    async fn set_presence(&self, user_id: UserId, online: bool) {
        let record = PresenceRecord {
            user_id: user_id.clone(),
            online,
            last_seen: Utc::now(),
        };
        self.presence
            .write()
            .await
            .insert(user_id, record.clone());
        self.broadcast(ServerEvent::Presence {
            user_id: record.user_id,
            online: record.online,
            last_seen: record.last_seen,
        })
        .await;
    }

    async fn route(&self, from: &UserId, request: ClientRequest) {
        match request {
            ClientRequest::JoinConversation { with_user_id } => {
                let conversation_id = ConversationId::for_pair(from, &with_user_id);
                self.rooms
                    .write()
                    .await
                    .entry(conversation_id)
                    .or_default()
                    .insert(from.clone());
            }
            ClientRequest::Typing { to_user_id, typing } => {
                self.deliver(
                    &to_user_id,
                    ServerEvent::Typing {
                        from_user_id: from.clone(),
                        typing,
                    },
                )
                .await;
            }
            ClientRequest::SendMessage { message } => {
                if message.from_user_id != *from {
                    warn!(user = %from, claimed = %message.from_user_id, "rejecting spoofed sender");
                    self.deliver(
                        from,
                        ServerEvent::Error(ApiError::new(
                            ErrorCode::Validation,
                            "message sender does not match the connection",
                        )),
                    )
                    .await;
                    return;
                }
                // Fan out to both members; the sender echo is intentional,
                // clients discard their own.
                let event = ServerEvent::MessageReceived {
                    message: message.clone(),
                };
                self.deliver(&message.to_user_id, event.clone()).await;
                self.deliver(&message.from_user_id, event).await;
            }
            ClientRequest::MarkSeen { conversation_id } => {
                let members = self
                    .rooms
                    .read()
                    .await
                    .get(&conversation_id)
                    .cloned()
                    .unwrap_or_default();
                let event = ServerEvent::ConversationSeen {
                    conversation_id,
                    by_user_id: from.clone(),
                    seen_at: Utc::now(),
                };
                for member in members {
                    if member != *from {
                        self.deliver(&member, event.clone()).await;
                    }
                }
            }
            ClientRequest::CallJoin { with_user_id } => {
                self.deliver(
                    &with_user_id,
                    ServerEvent::CallPeerJoined {
                        with_user_id: from.clone(),
                    },
                )
                .await;
            }
            ClientRequest::CallSignal { with_user_id, data } => {
                self.deliver(
                    &with_user_id,
                    ServerEvent::CallSignal {
                        from_user_id: from.clone(),
                        data,
                    },
                )
                .await;
            }
            ClientRequest::CallEnd { with_user_id } => {
                self.deliver(
                    &with_user_id,
                    ServerEvent::CallEnded {
                        from_user_id: from.clone(),
                    },
                )
                .await;
            }
            ClientRequest::CallMissed { with_user_id } => {
                self.deliver(
                    &with_user_id,
                    ServerEvent::CallMissed {
                        from_user_id: from.clone(),
                    },
                )
                .await;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let relay = Arc::new(Relay::default());
    let app = build_router(relay);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/presence/:user_id", get(get_presence))
        .route("/ws", get(ws_handler))
        .with_state(relay)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_presence(
    State(relay): State<Arc<Relay>>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceRecord>, (StatusCode, Json<ApiError>)> {
    let user_id = UserId::new(user_id);
    relay
        .presence
        .read()
        .await
        .get(&user_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, "user never seen")),
            )
        })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<Relay>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let user_id = q.user_id.trim().to_string();
    if user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, "user_id is required")),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| ws_connection(relay, socket, UserId::new(user_id)))
        .into_response()
}

async fn ws_connection(relay: Arc<Relay>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel();

    relay
        .peers
        .write()
        .await
        .insert(user_id.clone(), outbox.clone());
    relay.set_presence(user_id.clone(), true).await;
    info!(user = %user_id, "connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => relay.route(&user_id, request).await,
            Err(err) => {
                debug!(user = %user_id, %err, "dropping malformed frame");
                relay
                    .deliver(
                        &user_id,
                        ServerEvent::Error(ApiError::new(
                            ErrorCode::Validation,
                            "malformed frame",
                        )),
                    )
                    .await;
            }
        }
    }

    send_task.abort();
    {
        // A reconnect may already have replaced this registration.
        let mut peers = relay.peers.write().await;
        if peers
            .get(&user_id)
            .is_some_and(|current| current.same_channel(&outbox))
        {
            peers.remove(&user_id);
        } else {
            info!(user = %user_id, "stale connection closed after reconnect");
            return;
        }
    }
    relay.set_presence(user_id.clone(), false).await;
    info!(user = %user_id, "disconnected");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use futures::{SinkExt, StreamExt};
    use shared::protocol::{CallSignal, MessagePayload, SdpKind, SessionDescription};
    use tokio_tungstenite::tungstenite;
    use tower::ServiceExt;

    use super::*;

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_relay() -> (String, Arc<Relay>) {
        let relay = Arc::new(Relay::default());
        let app = build_router(Arc::clone(&relay));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("127.0.0.1:{}", addr.port()), relay)
    }

    async fn connect(host: &str, user: &str) -> WsClient {
        let (socket, _) = tokio_tungstenite::connect_async(format!(
            "ws://{host}/ws?user_id={user}"
        ))
        .await
        .expect("ws connect");
        socket
    }

    async fn send_frame(socket: &mut WsClient, frame: &ClientRequest) {
        let text = serde_json::to_string(frame).expect("encode frame");
        socket
            .send(tungstenite::Message::Text(text))
            .await
            .expect("send frame");
    }

    async fn wait_for<F>(socket: &mut WsClient, mut predicate: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for event")
                .expect("socket closed")
                .expect("socket error");
            if let tungstenite::Message::Text(text) = frame {
                let event: ServerEvent = serde_json::from_str(&text).expect("decode event");
                if predicate(&event) {
                    return event;
                }
            }
        }
    }

    /// Every connection receives its own online broadcast right after the
    /// relay registers its outbox; seeing it proves registration completed.
    async fn wait_until_registered(socket: &mut WsClient, user: &str) {
        wait_for(socket, |event| {
            matches!(
                event,
                ServerEvent::Presence { user_id, online: true, .. }
                    if user_id.as_str() == user
            )
        })
        .await;
    }

    fn text_message(id: &str, from: &str, to: &str, text: &str) -> MessagePayload {
        let from = UserId::new(from);
        let to = UserId::new(to);
        MessagePayload {
            message_id: shared::domain::MessageId::new(id),
            conversation_id: ConversationId::for_pair(&from, &to),
            from_user_id: from,
            to_user_id: to,
            text: Some(text.to_string()),
            media_url: None,
            media_type: None,
            created_at: Utc::now(),
            seen_at: None,
        }
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = build_router(Arc::new(Relay::default()));
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn presence_for_unseen_user_is_not_found() {
        let app = build_router(Arc::new(Relay::default()));
        let response = app
            .oneshot(
                Request::get("/presence/ghost")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_upgrade_requires_a_user_id() {
        let (host, _relay) = spawn_relay().await;
        let result =
            tokio_tungstenite::connect_async(format!("ws://{host}/ws?user_id=%20")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connecting_broadcasts_online_presence() {
        let (host, _relay) = spawn_relay().await;
        let mut alice = connect(&host, "alice").await;
        let _bob = connect(&host, "bob").await;

        let event = wait_for(&mut alice, |event| {
            matches!(
                event,
                ServerEvent::Presence { user_id, online: true, .. }
                    if user_id.as_str() == "bob"
            )
        })
        .await;
        assert!(matches!(event, ServerEvent::Presence { .. }));
    }

    #[tokio::test]
    async fn messages_fan_out_to_both_members_including_the_sender_echo() {
        let (host, _relay) = spawn_relay().await;
        let mut alice = connect(&host, "alice").await;
        let mut bob = connect(&host, "bob").await;
        wait_until_registered(&mut bob, "bob").await;

        send_frame(
            &mut alice,
            &ClientRequest::JoinConversation {
                with_user_id: UserId::new("bob"),
            },
        )
        .await;
        send_frame(
            &mut alice,
            &ClientRequest::SendMessage {
                message: text_message("m1", "alice", "bob", "hello"),
            },
        )
        .await;

        let delivered = wait_for(&mut bob, |event| {
            matches!(event, ServerEvent::MessageReceived { .. })
        })
        .await;
        let ServerEvent::MessageReceived { message } = delivered else {
            unreachable!();
        };
        assert_eq!(message.text.as_deref(), Some("hello"));

        let echo = wait_for(&mut alice, |event| {
            matches!(event, ServerEvent::MessageReceived { .. })
        })
        .await;
        let ServerEvent::MessageReceived { message } = echo else {
            unreachable!();
        };
        assert_eq!(message.from_user_id.as_str(), "alice");
    }

    #[tokio::test]
    async fn spoofed_sender_is_rejected_with_a_validation_error() {
        let (host, _relay) = spawn_relay().await;
        let mut alice = connect(&host, "alice").await;
        let mut bob = connect(&host, "bob").await;
        wait_until_registered(&mut bob, "bob").await;

        send_frame(
            &mut alice,
            &ClientRequest::SendMessage {
                message: text_message("m1", "mallory", "bob", "hi"),
            },
        )
        .await;

        let error = wait_for(&mut alice, |event| {
            matches!(event, ServerEvent::Error(_))
        })
        .await;
        let ServerEvent::Error(error) = error else {
            unreachable!();
        };
        assert_eq!(error.code, ErrorCode::Validation);

        // Bob must not see the spoofed message; typing afterwards proves the
        // stream carried nothing in between.
        send_frame(
            &mut alice,
            &ClientRequest::Typing {
                to_user_id: UserId::new("bob"),
                typing: true,
            },
        )
        .await;
        let next = wait_for(&mut bob, |event| {
            matches!(
                event,
                ServerEvent::MessageReceived { .. } | ServerEvent::Typing { .. }
            )
        })
        .await;
        assert!(matches!(next, ServerEvent::Typing { typing: true, .. }));
    }

    #[tokio::test]
    async fn call_signals_are_forwarded_to_the_addressed_peer() {
        let (host, _relay) = spawn_relay().await;
        let mut alice = connect(&host, "alice").await;
        let mut bob = connect(&host, "bob").await;
        wait_until_registered(&mut bob, "bob").await;

        send_frame(
            &mut alice,
            &ClientRequest::CallJoin {
                with_user_id: UserId::new("bob"),
            },
        )
        .await;
        send_frame(
            &mut alice,
            &ClientRequest::CallSignal {
                with_user_id: UserId::new("bob"),
                data: CallSignal::Offer(SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".to_string(),
                })
                .into(),
            },
        )
        .await;

        let joined = wait_for(&mut bob, |event| {
            matches!(event, ServerEvent::CallPeerJoined { .. })
        })
        .await;
        assert!(matches!(
            joined,
            ServerEvent::CallPeerJoined { with_user_id } if with_user_id.as_str() == "alice"
        ));

        let signal = wait_for(&mut bob, |event| {
            matches!(event, ServerEvent::CallSignal { .. })
        })
        .await;
        let ServerEvent::CallSignal { from_user_id, data } = signal else {
            unreachable!();
        };
        assert_eq!(from_user_id.as_str(), "alice");
        assert!(matches!(
            data.classify(),
            Ok(CallSignal::Offer(description)) if description.sdp == "v=0"
        ));
    }

    #[tokio::test]
    async fn mark_seen_reaches_the_other_room_member_only() {
        let (host, _relay) = spawn_relay().await;
        let mut alice = connect(&host, "alice").await;
        let mut bob = connect(&host, "bob").await;
        wait_until_registered(&mut bob, "bob").await;

        let conversation_id =
            ConversationId::for_pair(&UserId::new("alice"), &UserId::new("bob"));
        send_frame(
            &mut alice,
            &ClientRequest::JoinConversation {
                with_user_id: UserId::new("bob"),
            },
        )
        .await;
        // Frames on one socket are processed in order, so the delivered
        // message proves Alice's join reached the room first.
        send_frame(
            &mut alice,
            &ClientRequest::SendMessage {
                message: text_message("m1", "alice", "bob", "are you there?"),
            },
        )
        .await;
        wait_for(&mut bob, |event| {
            matches!(event, ServerEvent::MessageReceived { .. })
        })
        .await;

        // Bob opens the conversation; Alice learns her messages were seen.
        send_frame(
            &mut bob,
            &ClientRequest::MarkSeen {
                conversation_id: conversation_id.clone(),
            },
        )
        .await;

        let seen = wait_for(&mut alice, |event| {
            matches!(event, ServerEvent::ConversationSeen { .. })
        })
        .await;
        let ServerEvent::ConversationSeen {
            conversation_id: seen_conversation,
            by_user_id,
            ..
        } = seen
        else {
            unreachable!();
        };
        assert_eq!(seen_conversation, conversation_id);
        assert_eq!(by_user_id.as_str(), "bob");
    }

    #[tokio::test]
    async fn disconnect_broadcasts_offline_presence_with_last_seen() {
        let (host, relay) = spawn_relay().await;
        let mut bob = connect(&host, "bob").await;
        let alice = connect(&host, "alice").await;

        wait_for(&mut bob, |event| {
            matches!(
                event,
                ServerEvent::Presence { user_id, online: true, .. }
                    if user_id.as_str() == "alice"
            )
        })
        .await;

        drop(alice);

        wait_for(&mut bob, |event| {
            matches!(
                event,
                ServerEvent::Presence { user_id, online: false, .. }
                    if user_id.as_str() == "alice"
            )
        })
        .await;

        let presence = relay.presence.read().await;
        let record = presence.get(&UserId::new("alice")).expect("record");
        assert!(!record.online);
    }
}
