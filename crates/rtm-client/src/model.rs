//! Directory entities mirrored from the server.
//!
//! Unknown fields are ignored and missing optional fields default, so the
//! shapes tolerate protocol additions. `cached_at` is local bookkeeping and
//! never travels over the wire.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Identifier of a user.
pub type UserId = String;

/// Identifier of a channel, private group or direct-message channel.
pub type ChannelId = String;

/// Common behaviour of cached directory entries.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    /// Server-assigned identifier.
    fn id(&self) -> &str;

    /// Human-readable name, if the kind has one.
    fn name(&self) -> Option<&str> {
        None
    }

    /// When this copy entered the cache.
    fn cached_at(&self) -> Option<SystemTime>;

    fn set_cached_at(&mut self, at: Option<SystemTime>);
}

/// Entities that carry a member list in snapshots.
pub trait HasMembers {
    fn member_ids(&self) -> Option<&[UserId]>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub real_name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub image_72: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub real_name: Option<String>,
    pub deleted: bool,
    pub is_bot: bool,
    pub is_admin: bool,
    pub tz: Option<String>,
    pub presence: Option<String>,
    pub profile: UserProfile,
    #[serde(skip)]
    pub cached_at: Option<SystemTime>,
}

/// Topic or purpose of a conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topic {
    pub value: String,
    pub creator: String,
    pub last_set: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub created: i64,
    pub creator: Option<UserId>,
    pub is_archived: bool,
    pub is_general: bool,
    pub is_member: bool,
    pub members: Option<Vec<UserId>>,
    pub topic: Option<Topic>,
    pub purpose: Option<Topic>,
    #[serde(skip)]
    pub cached_at: Option<SystemTime>,
}

/// A private channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: ChannelId,
    pub name: String,
    pub created: i64,
    pub creator: Option<UserId>,
    pub is_archived: bool,
    pub members: Option<Vec<UserId>>,
    pub topic: Option<Topic>,
    pub purpose: Option<Topic>,
    #[serde(skip)]
    pub cached_at: Option<SystemTime>,
}

/// A one-to-one conversation with a user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectMessage {
    pub id: ChannelId,
    pub user: UserId,
    pub created: i64,
    pub is_open: bool,
    #[serde(skip)]
    pub cached_at: Option<SystemTime>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamInfo {
    pub id: String,
    pub name: String,
    pub domain: String,
}

/// The identity the session is authenticated as.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfInfo {
    pub id: UserId,
    pub name: String,
}

macro_rules! impl_entity {
    ($ty:ty, named) => {
        impl Entity for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn name(&self) -> Option<&str> {
                Some(&self.name)
            }

            fn cached_at(&self) -> Option<SystemTime> {
                self.cached_at
            }

            fn set_cached_at(&mut self, at: Option<SystemTime>) {
                self.cached_at = at;
            }
        }
    };
    ($ty:ty) => {
        impl Entity for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn cached_at(&self) -> Option<SystemTime> {
                self.cached_at
            }

            fn set_cached_at(&mut self, at: Option<SystemTime>) {
                self.cached_at = at;
            }
        }
    };
}

impl_entity!(User, named);
impl_entity!(Channel, named);
impl_entity!(Group, named);
impl_entity!(DirectMessage);

impl HasMembers for Channel {
    fn member_ids(&self) -> Option<&[UserId]> {
        self.members.as_deref()
    }
}

impl HasMembers for Group {
    fn member_ids(&self) -> Option<&[UserId]> {
        self.members.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_tolerates_missing_and_unknown_fields() {
        let channel: Channel = serde_json::from_str(
            r#"{"id":"C1","name":"general","is_general":true,"unread_count":3}"#,
        )
        .expect("decode");
        assert_eq!(channel.id, "C1");
        assert!(channel.is_general);
        assert!(channel.members.is_none());
        assert!(channel.cached_at.is_none());
    }

    #[test]
    fn test_cached_at_is_not_serialized() {
        let user = User {
            id: "U1".into(),
            name: "ada".into(),
            cached_at: Some(SystemTime::now()),
            ..Default::default()
        };
        let json = serde_json::to_value(&user).expect("encode");
        assert!(json.get("cached_at").is_none());
        assert_eq!(Entity::name(&user), Some("ada"));
    }

    #[test]
    fn test_members_accessor() {
        let group = Group {
            id: "G1".into(),
            members: Some(vec!["U1".into(), "U2".into()]),
            ..Default::default()
        };
        assert_eq!(group.member_ids().map(<[_]>::len), Some(2));
        assert_eq!(DirectMessage::default().name(), None);
    }
}
