use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    domain::{ConversationId, MediaType, MessageId, UserId},
    error::ApiError,
};

/// One durable (or in-flight) chat message as it travels on the wire and in
/// REST bodies. Exactly one of `text` / `media_url` is expected to be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
}

/// History fetch response from the durable conversation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub conversation_id: ConversationId,
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Loose wire shape of a call signal: descriptions and candidates share one
/// event family and are told apart by which field is present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallSignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidateInit>,
}

/// Tagged form of a call signal. Internal logic switches on this, never on
/// field presence in the wire payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidateInit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignalClassifyError {
    #[error("call signal carries neither sdp nor candidate")]
    Empty,
    #[error("call signal carries both sdp and candidate")]
    Ambiguous,
}

impl CallSignalPayload {
    /// Translate the duck-typed wire payload into its tagged form. Done once
    /// at the channel boundary.
    pub fn classify(self) -> Result<CallSignal, SignalClassifyError> {
        match (self.sdp, self.candidate) {
            (Some(_), Some(_)) => Err(SignalClassifyError::Ambiguous),
            (None, None) => Err(SignalClassifyError::Empty),
            (Some(description), None) => Ok(match description.kind {
                SdpKind::Offer => CallSignal::Offer(description),
                SdpKind::Answer => CallSignal::Answer(description),
            }),
            (None, Some(candidate)) => Ok(CallSignal::Candidate(candidate)),
        }
    }
}

impl From<CallSignal> for CallSignalPayload {
    fn from(signal: CallSignal) -> Self {
        match signal {
            CallSignal::Offer(description) | CallSignal::Answer(description) => Self {
                sdp: Some(description),
                candidate: None,
            },
            CallSignal::Candidate(candidate) => Self {
                sdp: None,
                candidate: Some(candidate),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation {
        with_user_id: UserId,
    },
    Typing {
        to_user_id: UserId,
        typing: bool,
    },
    SendMessage {
        message: MessagePayload,
    },
    MarkSeen {
        conversation_id: ConversationId,
    },
    CallJoin {
        with_user_id: UserId,
    },
    CallSignal {
        with_user_id: UserId,
        data: CallSignalPayload,
    },
    CallEnd {
        with_user_id: UserId,
    },
    CallMissed {
        with_user_id: UserId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Presence {
        user_id: UserId,
        online: bool,
        last_seen: DateTime<Utc>,
    },
    Typing {
        from_user_id: UserId,
        typing: bool,
    },
    MessageReceived {
        message: MessagePayload,
    },
    ConversationSeen {
        conversation_id: ConversationId,
        by_user_id: UserId,
        seen_at: DateTime<Utc>,
    },
    CallSignal {
        from_user_id: UserId,
        data: CallSignalPayload,
    },
    CallPeerJoined {
        with_user_id: UserId,
    },
    CallEnded {
        from_user_id: UserId,
    },
    CallMissed {
        from_user_id: UserId,
    },
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 offer".to_string(),
        }
    }

    #[test]
    fn classifies_offer_and_answer_by_sdp_kind() {
        let classified = CallSignalPayload {
            sdp: Some(offer()),
            candidate: None,
        }
        .classify()
        .expect("offer");
        assert_eq!(classified, CallSignal::Offer(offer()));

        let answer = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 answer".to_string(),
        };
        let classified = CallSignalPayload {
            sdp: Some(answer.clone()),
            candidate: None,
        }
        .classify()
        .expect("answer");
        assert_eq!(classified, CallSignal::Answer(answer));
    }

    #[test]
    fn classifies_candidate_only_payload() {
        let candidate = IceCandidateInit {
            candidate: "candidate:0 1 UDP 1 192.0.2.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let classified = CallSignalPayload {
            sdp: None,
            candidate: Some(candidate.clone()),
        }
        .classify()
        .expect("candidate");
        assert_eq!(classified, CallSignal::Candidate(candidate));
    }

    #[test]
    fn rejects_empty_and_ambiguous_payloads() {
        assert_eq!(
            CallSignalPayload::default().classify(),
            Err(SignalClassifyError::Empty)
        );
        let ambiguous = CallSignalPayload {
            sdp: Some(offer()),
            candidate: Some(IceCandidateInit {
                candidate: "candidate:0".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            }),
        };
        assert_eq!(ambiguous.classify(), Err(SignalClassifyError::Ambiguous));
    }

    #[test]
    fn wire_round_trip_preserves_signal_tag() {
        let payload: CallSignalPayload = CallSignal::Offer(offer()).into();
        let encoded = serde_json::to_string(&payload).expect("encode");
        assert!(encoded.contains("\"kind\":\"offer\""));
        assert!(!encoded.contains("candidate"));
        let decoded: CallSignalPayload = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.classify(), Ok(CallSignal::Offer(offer())));
    }

    #[test]
    fn requests_serialize_with_snake_case_tags() {
        let frame = ClientRequest::MarkSeen {
            conversation_id: ConversationId::new("a:b"),
        };
        let encoded = serde_json::to_string(&frame).expect("encode");
        assert!(encoded.contains("\"type\":\"mark_seen\""));

        let frame = ClientRequest::JoinConversation {
            with_user_id: UserId::new("u-2"),
        };
        let encoded = serde_json::to_string(&frame).expect("encode");
        assert!(encoded.contains("\"type\":\"join_conversation\""));
        assert!(encoded.contains("\"with_user_id\":\"u-2\""));
    }
}
