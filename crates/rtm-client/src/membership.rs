//! Channel membership owned by a single worker task.
//!
//! The map is never shared. Every read and write is a closure sent over one
//! queue and run by the worker against the map in submission order, so a
//! query issued from a dispatched handler can never observe a half-applied
//! rebuild and no caller ever holds a lock on the map.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
    error::{RtmError, RtmResult},
    model::{ChannelId, Entity, HasMembers, UserId},
};

/// Channel id to member ids. Absence of a channel means "not known",
/// which is distinct from an empty member set.
pub type MembershipMap = HashMap<ChannelId, HashSet<UserId>>;

type Job = Box<dyn FnOnce(&mut MembershipMap) + Send>;

/// The worker side. Runs until every [`MembershipHandle`] is dropped.
pub struct MembershipActor {
    jobs: mpsc::Receiver<Job>,
    members: MembershipMap,
}

impl MembershipActor {
    /// Spawn the worker on the current runtime and return its handle.
    pub fn spawn(queue_capacity: usize) -> MembershipHandle {
        let (tx, jobs) = mpsc::channel(queue_capacity);
        let actor = Self {
            jobs,
            members: MembershipMap::new(),
        };
        tokio::spawn(actor.run());
        MembershipHandle { tx }
    }

    async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            job(&mut self.members);
        }
        debug!(
            channels = self.members.len(),
            "All membership handles dropped; stopping actor"
        );
    }
}

/// Message-passing access to the membership map. Cheap to clone.
#[derive(Clone)]
pub struct MembershipHandle {
    tx: mpsc::Sender<Job>,
}

impl MembershipHandle {
    /// Run `f` against the map on the worker and return its result.
    pub async fn with<R, F>(&self, f: F) -> RtmResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut MembershipMap) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(move |members| {
            let _ = reply_tx.send(f(members));
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| RtmError::internal("Membership reply dropped"))
    }

    /// Enqueue a mutation without waiting for it to run.
    async fn submit<F>(&self, f: F) -> RtmResult<()>
    where
        F: FnOnce(&mut MembershipMap) + Send + 'static,
    {
        self.tx
            .send(Box::new(f))
            .await
            .map_err(|_| RtmError::connection_closed(Some("Membership actor stopped".into())))
    }

    /// For each channel, whether `user` is a member. Unknown channels map to `false`.
    pub async fn users_in_channels(
        &self,
        user: &str,
        channels: &[&str],
    ) -> RtmResult<HashMap<ChannelId, bool>> {
        let user = user.to_string();
        let channels: Vec<ChannelId> = channels.iter().map(|c| c.to_string()).collect();
        self.with(move |members| {
            channels
                .into_iter()
                .map(|channel| {
                    let present = members
                        .get(&channel)
                        .is_some_and(|set| set.contains(&user));
                    (channel, present)
                })
                .collect()
        })
        .await
    }

    /// Number of members, or `None` for a channel the actor was never told about.
    pub async fn member_count(&self, channel: &str) -> RtmResult<Option<usize>> {
        let channel = channel.to_string();
        self.with(move |members| members.get(&channel).map(HashSet::len))
            .await
    }

    /// Sorted member ids, or `None` for an unknown channel.
    pub async fn member_list(&self, channel: &str) -> RtmResult<Option<Vec<UserId>>> {
        let channel = channel.to_string();
        self.with(move |members| {
            members.get(&channel).map(|set| {
                let mut list: Vec<UserId> = set.iter().cloned().collect();
                list.sort();
                list
            })
        })
        .await
    }

    pub async fn apply_join(&self, user: &str, channel: &str) -> RtmResult<()> {
        let (user, channel) = (user.to_string(), channel.to_string());
        self.submit(move |members| {
            members.entry(channel).or_default().insert(user);
        })
        .await
    }

    pub async fn apply_leave(&self, user: &str, channel: &str) -> RtmResult<()> {
        let (user, channel) = (user.to_string(), channel.to_string());
        self.submit(move |members| {
            members.entry(channel).or_default().remove(&user);
        })
        .await
    }

    /// Overwrite one channel's member set.
    pub async fn replace_members(&self, channel: &str, users: Vec<UserId>) -> RtmResult<()> {
        let channel = channel.to_string();
        self.submit(move |members| {
            members.insert(channel, users.into_iter().collect());
        })
        .await
    }

    /// Replace the whole map with the member lists of `channels`.
    ///
    /// Entries without a member list are left out, keeping them unknown.
    pub async fn rebuild_from<'a, T>(
        &self,
        channels: impl IntoIterator<Item = &'a T>,
    ) -> RtmResult<()>
    where
        T: HasMembers + Entity + 'a,
    {
        let entries = channels
            .into_iter()
            .filter_map(|channel| {
                channel
                    .member_ids()
                    .map(|ids| (channel.id().to_string(), ids.to_vec()))
            })
            .collect();
        self.rebuild(entries).await
    }

    /// Replace the whole map in one step.
    pub async fn rebuild(&self, entries: Vec<(ChannelId, Vec<UserId>)>) -> RtmResult<()> {
        self.submit(move |members| {
            *members = entries
                .into_iter()
                .map(|(channel, users)| (channel, users.into_iter().collect()))
                .collect();
        })
        .await
    }

    /// Copy of the current map.
    pub async fn snapshot(&self) -> RtmResult<MembershipMap> {
        self.with(|members| members.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::model::Channel;

    fn channel(id: &str, members: &[&str]) -> Channel {
        Channel {
            id: id.into(),
            members: Some(members.iter().map(|m| m.to_string()).collect()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rebuild_then_query() {
        let handle = MembershipActor::spawn(16);
        handle
            .rebuild_from(&[channel("C1", &["U1", "U2"])])
            .await
            .expect("rebuild");

        assert_eq!(handle.member_count("C1").await.expect("count"), Some(2));
        let present = handle.users_in_channels("U1", &["C1"]).await.expect("query");
        assert_eq!(present, HashMap::from([("C1".to_string(), true)]));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_distinct_from_empty() {
        let handle = MembershipActor::spawn(16);
        handle.apply_join("U1", "C1").await.expect("join");
        handle.apply_leave("U1", "C1").await.expect("leave");

        assert_eq!(handle.member_count("C1").await.expect("count"), Some(0));
        assert_eq!(handle.member_count("C2").await.expect("count"), None);
        assert_eq!(handle.member_list("C2").await.expect("list"), None);
        let present = handle
            .users_in_channels("U1", &["C1", "C2"])
            .await
            .expect("query");
        assert_eq!(present.get("C1"), Some(&false));
        assert_eq!(present.get("C2"), Some(&false));
    }

    #[tokio::test]
    async fn test_rebuild_skips_channels_without_member_lists() {
        let handle = MembershipActor::spawn(16);
        let mut unknown = channel("C2", &[]);
        unknown.members = None;
        handle
            .rebuild_from(&[channel("C1", &["U2", "U1"]), unknown])
            .await
            .expect("rebuild");

        assert_eq!(
            handle.member_list("C1").await.expect("list"),
            Some(vec!["U1".to_string(), "U2".to_string()])
        );
        assert_eq!(handle.member_count("C2").await.expect("count"), None);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Join(String, String),
        Leave(String, String),
        Rebuild(Vec<(String, Vec<String>)>),
    }

    fn apply_sequentially(ops: &[Op]) -> MembershipMap {
        let mut model = MembershipMap::new();
        for op in ops {
            match op {
                Op::Join(u, c) => {
                    model.entry(c.clone()).or_default().insert(u.clone());
                }
                Op::Leave(u, c) => {
                    model.entry(c.clone()).or_default().remove(u);
                }
                Op::Rebuild(entries) => {
                    model = entries
                        .iter()
                        .map(|(c, us)| (c.clone(), us.iter().cloned().collect()))
                        .collect();
                }
            }
        }
        model
    }

    fn random_ops(rng: &mut StdRng, len: usize) -> Vec<Op> {
        let user = |rng: &mut StdRng| format!("U{}", rng.random_range(0..5));
        let chan = |rng: &mut StdRng| format!("C{}", rng.random_range(0..4));
        (0..len)
            .map(|_| match rng.random_range(0..10) {
                0 => {
                    let entries = (0..rng.random_range(0..3))
                        .map(|_| {
                            let c = chan(rng);
                            let us = (0..rng.random_range(0..4)).map(|_| user(rng)).collect();
                            (c, us)
                        })
                        .collect();
                    Op::Rebuild(entries)
                }
                1..=5 => Op::Join(user(rng), chan(rng)),
                _ => Op::Leave(user(rng), chan(rng)),
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_ops_match_sequential_application() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..20 {
            let ops = random_ops(&mut rng, 200);
            let handle = MembershipActor::spawn(8);

            // Concurrent readers hammer the actor while the writer submits.
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        for _ in 0..50 {
                            let _ = handle.member_count("C1").await;
                            let _ = handle.users_in_channels("U1", &["C0", "C2"]).await;
                        }
                    })
                })
                .collect();

            for op in &ops {
                match op.clone() {
                    Op::Join(u, c) => handle.apply_join(&u, &c).await.expect("join"),
                    Op::Leave(u, c) => handle.apply_leave(&u, &c).await.expect("leave"),
                    Op::Rebuild(entries) => handle.rebuild(entries).await.expect("rebuild"),
                }
            }

            for reader in readers {
                reader.await.expect("reader panicked");
            }

            assert_eq!(
                handle.snapshot().await.expect("snapshot"),
                apply_sequentially(&ops)
            );
        }
    }

    #[tokio::test]
    async fn test_rebuild_is_atomic_for_readers() {
        let handle = MembershipActor::spawn(8);
        let big: Vec<String> = (0..100).map(|i| format!("U{i}")).collect();

        let writer = {
            let handle = handle.clone();
            let big = big.clone();
            tokio::spawn(async move {
                for round in 0..50 {
                    let members = if round % 2 == 0 { big.clone() } else { Vec::new() };
                    handle
                        .rebuild(vec![("C1".to_string(), members)])
                        .await
                        .expect("rebuild");
                }
            })
        };

        for _ in 0..200 {
            let count = handle.member_count("C1").await.expect("count");
            assert!(matches!(count, None | Some(0) | Some(100)), "torn read: {count:?}");
        }
        writer.await.expect("writer panicked");
    }
}
