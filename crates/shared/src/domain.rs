use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ConversationId);

impl ConversationId {
    /// Order-independent conversation id for an unordered pair of users:
    /// the two ids are sorted before joining, so `for_pair(a, b)` and
    /// `for_pair(b, a)` always name the same conversation.
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        Self(format!("{}:{}", first.0, second.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    File,
}

/// Last known online/offline state for a user. Updated only by channel
/// events, last write wins, held in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_is_order_independent() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        assert_eq!(
            ConversationId::for_pair(&alice, &bob),
            ConversationId::for_pair(&bob, &alice)
        );
    }

    #[test]
    fn conversation_id_sorts_its_members() {
        let first = UserId::new("b-user");
        let second = UserId::new("a-user");
        assert_eq!(
            ConversationId::for_pair(&first, &second).as_str(),
            "a-user:b-user"
        );
    }
}
