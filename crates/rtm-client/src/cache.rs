//! In-memory mirror of the server directory.
//!
//! Each collection is an `Arc<Vec<T>>` behind a `parking_lot::RwLock`.
//! Readers clone the `Arc` under the shared lock and get a point-in-time
//! snapshot; writers take the exclusive lock only for the search and
//! copy-on-write mutation. A snapshot held by a caller never changes.

use std::{sync::Arc, time::SystemTime};

use parking_lot::RwLock;

use crate::model::{Channel, DirectMessage, Entity, Group, SelfInfo, TeamInfo, User};

/// Outcome of [`Collection::replace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replaced {
    /// No entry had this id; the entity was appended.
    Inserted,
    /// An entry with this id had different content and was overwritten.
    Updated,
    /// An identical entry was already present. Nothing changed.
    Unchanged,
}

/// One kind of directory entity.
pub struct Collection<T: Entity> {
    items: RwLock<Arc<Vec<T>>>,
}

impl<T: Entity> Collection<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the entry with the same id, or append.
    pub fn replace(&self, entity: T) -> Replaced {
        let now = SystemTime::now();
        let mut items = self.items.write();
        replace_in(Arc::make_mut(&mut items), entity, now)
    }

    /// Batched [`replace`](Self::replace). Entries not mentioned are kept.
    ///
    /// Returns how many entries were inserted or updated.
    pub fn replace_many(&self, entities: impl IntoIterator<Item = T>) -> usize {
        let now = SystemTime::now();
        let mut items = self.items.write();
        let items = Arc::make_mut(&mut items);
        entities
            .into_iter()
            .map(|entity| replace_in(items, entity, now))
            .filter(|outcome| *outcome != Replaced::Unchanged)
            .count()
    }

    /// Apply `f` to the entry with `id` and store the result.
    ///
    /// Returns `false` when no entry has that id.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut T)) -> bool {
        let now = SystemTime::now();
        let mut items = self.items.write();
        let Some(mut entity) = items.iter().find(|item| item.id() == id).cloned() else {
            return false;
        };
        f(&mut entity);
        replace_in(Arc::make_mut(&mut items), entity, now);
        true
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        let mut items = self.items.write();
        let index = items.iter().position(|item| item.id() == id)?;
        Some(Arc::make_mut(&mut items).remove(index))
    }

    /// Point-in-time view of the whole collection.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.items.read())
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items.read().iter().find(|item| item.id() == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<T> {
        self.items
            .read()
            .iter()
            .find(|item| item.name() == Some(name))
            .cloned()
    }

    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.items.read().iter().find(|item| predicate(item)).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn replace_in<T: Entity>(items: &mut Vec<T>, mut entity: T, now: SystemTime) -> Replaced {
    match items.iter_mut().find(|item| item.id() == entity.id()) {
        Some(existing) => {
            entity.set_cached_at(existing.cached_at());
            if *existing == entity {
                return Replaced::Unchanged;
            }
            entity.set_cached_at(Some(now));
            *existing = entity;
            Replaced::Updated
        }
        None => {
            entity.set_cached_at(Some(now));
            items.push(entity);
            Replaced::Inserted
        }
    }
}

/// The full directory mirror.
#[derive(Default)]
pub struct StateCache {
    users: Collection<User>,
    channels: Collection<Channel>,
    groups: Collection<Group>,
    direct_messages: Collection<DirectMessage>,
    team: RwLock<Option<TeamInfo>>,
    self_info: RwLock<Option<SelfInfo>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn users(&self) -> &Collection<User> {
        &self.users
    }

    pub fn channels(&self) -> &Collection<Channel> {
        &self.channels
    }

    pub fn groups(&self) -> &Collection<Group> {
        &self.groups
    }

    pub fn direct_messages(&self) -> &Collection<DirectMessage> {
        &self.direct_messages
    }

    /// The open direct-message channel with `user`, if any.
    pub fn direct_message_for_user(&self, user: &str) -> Option<DirectMessage> {
        self.direct_messages.find(|dm| dm.user == user)
    }

    pub fn team(&self) -> Option<TeamInfo> {
        self.team.read().clone()
    }

    pub fn set_team(&self, team: TeamInfo) {
        *self.team.write() = Some(team);
    }

    /// Rename the team. No-op before the first snapshot.
    pub fn rename_team(&self, name: &str) {
        if let Some(team) = self.team.write().as_mut() {
            team.name = name.to_string();
        }
    }

    /// The identity this session is authenticated as.
    pub fn self_info(&self) -> Option<SelfInfo> {
        self.self_info.read().clone()
    }

    pub fn set_self_info(&self, info: SelfInfo) {
        *self.self_info.write() = Some(info);
    }
}
