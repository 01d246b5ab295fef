//! Keeps the state cache and membership map in step with the server.
//!
//! Snapshots seed both stores; afterwards the read pump feeds every event
//! through [`StateTracker::apply`] before fan-out, so the stores change in
//! network arrival order.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::{
    cache::StateCache,
    error::RtmResult,
    event::{Event, MESSAGE},
    handshake::Snapshot,
    membership::MembershipHandle,
    model::{Channel, ChannelId, DirectMessage, Group, User, UserId},
};

/// Rename payloads carry a partial conversation object.
#[derive(Debug, Deserialize)]
struct Renamed {
    id: ChannelId,
    name: String,
}

/// Directory-changing events, decoded from the raw payload.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DirectoryEvent {
    UserChange {
        user: User,
    },
    TeamJoin {
        user: User,
    },
    TeamRename {
        name: String,
    },
    ChannelCreated {
        channel: Channel,
    },
    ChannelJoined {
        channel: Channel,
    },
    ChannelLeft {
        channel: ChannelId,
    },
    ChannelRename {
        channel: Renamed,
    },
    ChannelArchive {
        channel: ChannelId,
    },
    ChannelUnarchive {
        channel: ChannelId,
    },
    GroupJoined {
        channel: Group,
    },
    GroupLeft {
        channel: ChannelId,
    },
    GroupRename {
        channel: Renamed,
    },
    GroupArchive {
        channel: ChannelId,
    },
    GroupUnarchive {
        channel: ChannelId,
    },
    ImCreated {
        #[serde(default)]
        user: UserId,
        channel: DirectMessage,
    },
    MemberJoinedChannel {
        user: UserId,
        channel: ChannelId,
    },
    MemberLeftChannel {
        user: UserId,
        channel: ChannelId,
    },
}

const DIRECTORY_EVENTS: &[&str] = &[
    "user_change",
    "team_join",
    "team_rename",
    "channel_created",
    "channel_joined",
    "channel_left",
    "channel_rename",
    "channel_archive",
    "channel_unarchive",
    "group_joined",
    "group_left",
    "group_rename",
    "group_archive",
    "group_unarchive",
    "im_created",
    "member_joined_channel",
    "member_left_channel",
];

pub struct StateTracker {
    cache: Arc<StateCache>,
    members: MembershipHandle,
}

impl StateTracker {
    pub fn new(cache: Arc<StateCache>, members: MembershipHandle) -> Self {
        Self { cache, members }
    }

    /// Load a handshake snapshot.
    ///
    /// Entries are replaced by id and entries the snapshot omits are kept.
    /// The membership map is rebuilt from the snapshot's member lists in one
    /// step.
    pub async fn seed(&self, snapshot: &Snapshot) -> RtmResult<()> {
        let users = self.cache.users().replace_many(snapshot.users.iter().cloned());
        let channels = self
            .cache
            .channels()
            .replace_many(snapshot.channels.iter().cloned());
        let groups = self
            .cache
            .groups()
            .replace_many(snapshot.groups.iter().cloned());
        let ims = self
            .cache
            .direct_messages()
            .replace_many(snapshot.ims.iter().cloned());
        self.cache.set_team(snapshot.team.clone());
        self.cache.set_self_info(snapshot.self_info.clone());

        let mut entries = Vec::with_capacity(snapshot.channels.len() + snapshot.groups.len());
        entries.extend(
            snapshot
                .channels
                .iter()
                .filter_map(|c| c.members.clone().map(|m| (c.id.clone(), m))),
        );
        entries.extend(
            snapshot
                .groups
                .iter()
                .filter_map(|g| g.members.clone().map(|m| (g.id.clone(), m))),
        );
        let tracked = entries.len();
        self.members.rebuild(entries).await?;

        debug!(users, channels, groups, ims, tracked, "Seeded directory from snapshot");
        Ok(())
    }

    /// Apply one inbound event. Events that change nothing are ignored.
    pub async fn apply(&self, event: &Event) -> RtmResult<()> {
        if event.is(MESSAGE) {
            return self.apply_message(event).await;
        }
        if !DIRECTORY_EVENTS.contains(&event.kind()) {
            return Ok(());
        }

        match event.decode::<DirectoryEvent>()? {
            DirectoryEvent::UserChange { user } | DirectoryEvent::TeamJoin { user } => {
                self.cache.users().replace(user);
            }
            DirectoryEvent::TeamRename { name } => self.cache.rename_team(&name),
            DirectoryEvent::ChannelCreated { channel } => {
                self.cache.channels().replace(channel);
            }
            DirectoryEvent::ChannelJoined { mut channel } => {
                channel.is_member = true;
                if let Some(members) = channel.members.clone() {
                    self.members.replace_members(&channel.id, members).await?;
                }
                self.cache.channels().replace(channel);
            }
            DirectoryEvent::ChannelLeft { channel } => {
                self.cache.channels().update(&channel, |c| c.is_member = false);
                self.leave_self(&channel).await?;
            }
            DirectoryEvent::ChannelRename { channel } => {
                self.cache
                    .channels()
                    .update(&channel.id, |c| c.name = channel.name.clone());
            }
            DirectoryEvent::ChannelArchive { channel } => {
                self.cache.channels().update(&channel, |c| c.is_archived = true);
            }
            DirectoryEvent::ChannelUnarchive { channel } => {
                self.cache
                    .channels()
                    .update(&channel, |c| c.is_archived = false);
            }
            DirectoryEvent::GroupJoined { channel } => {
                if let Some(members) = channel.members.clone() {
                    self.members.replace_members(&channel.id, members).await?;
                }
                self.cache.groups().replace(channel);
            }
            DirectoryEvent::GroupLeft { channel } => {
                self.cache.groups().remove(&channel);
                self.leave_self(&channel).await?;
            }
            DirectoryEvent::GroupRename { channel } => {
                self.cache
                    .groups()
                    .update(&channel.id, |g| g.name = channel.name.clone());
            }
            DirectoryEvent::GroupArchive { channel } => {
                self.cache.groups().update(&channel, |g| g.is_archived = true);
            }
            DirectoryEvent::GroupUnarchive { channel } => {
                self.cache.groups().update(&channel, |g| g.is_archived = false);
            }
            DirectoryEvent::ImCreated { user, mut channel } => {
                if channel.user.is_empty() {
                    channel.user = user;
                }
                self.cache.direct_messages().replace(channel);
            }
            DirectoryEvent::MemberJoinedChannel { user, channel } => {
                self.members.apply_join(&user, &channel).await?;
            }
            DirectoryEvent::MemberLeftChannel { user, channel } => {
                self.members.apply_leave(&user, &channel).await?;
            }
        }
        Ok(())
    }

    async fn apply_message(&self, event: &Event) -> RtmResult<()> {
        let (Some(user), Some(channel)) = (event.user(), event.channel()) else {
            return Ok(());
        };
        match event.subtype() {
            Some("channel_join" | "group_join") => self.members.apply_join(user, channel).await,
            Some("channel_leave" | "group_leave") => self.members.apply_leave(user, channel).await,
            _ => Ok(()),
        }
    }

    async fn leave_self(&self, channel: &str) -> RtmResult<()> {
        match self.cache.self_info() {
            Some(me) => self.members.apply_leave(&me.id, channel).await,
            None => Ok(()),
        }
    }
}
