//! The session handle feature modules hold.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    cache::StateCache,
    config::RtmConfig,
    connection::{ConnectionEpoch, ConnectionManager, ConnectionState, SessionObserver},
    dispatch::{Dispatcher, EventHandler, HandlerFilter, HandlerId},
    error::{RtmError, RtmResult},
    event::{Event, MESSAGE, Reply, TYPING},
    handshake::{Dialer, HttpDialer, Snapshot},
    membership::{MembershipActor, MembershipHandle},
    model::{Channel, ChannelId, DirectMessage, Group, SelfInfo, TeamInfo, User, UserId},
    pending::PendingRequestStore,
    pump::{self, IdleTimer, PumpContext},
    tracker::StateTracker,
    types::{RequestId, RequestIdGenerator},
};

/// Envelope fields stripped from the echo of a sent message.
const ENVELOPE_FIELDS: &[&str] = &["id", "reply_to", "ok"];

/// Rebuild a sent payload as an inbound event from `self_id`.
fn merge_echo(
    mut fields: Map<String, Value>,
    reply: &Reply,
    self_id: Option<&str>,
) -> Map<String, Value> {
    for (key, value) in reply.fields() {
        fields.insert(key.clone(), value.clone());
    }
    for key in ENVELOPE_FIELDS {
        fields.remove(*key);
    }
    if let Some(id) = self_id {
        fields.insert("user".into(), Value::from(id));
    }
    fields
}

/// Seeds the stores and announces `hello` on every (re)connect.
struct SessionHooks {
    tracker: Arc<StateTracker>,
    dispatcher: Arc<Dispatcher>,
    reseed_on_reconnect: bool,
}

#[async_trait]
impl SessionObserver for SessionHooks {
    async fn on_connected(
        &self,
        snapshot: Snapshot,
        hello: Event,
        epoch: ConnectionEpoch,
        initial: bool,
    ) {
        if initial || self.reseed_on_reconnect {
            if let Err(err) = self.tracker.seed(&snapshot).await {
                warn!(epoch = epoch.0, error = %err, "Failed to seed directory");
            }
        } else {
            debug!(epoch = epoch.0, "Keeping directory from previous snapshot");
        }
        self.dispatcher.dispatch(Arc::new(hello));
    }
}

struct Inner {
    config: Arc<RtmConfig>,
    ids: Arc<RequestIdGenerator>,
    pending: Arc<PendingRequestStore>,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<StateCache>,
    members: MembershipHandle,
    conn: Arc<ConnectionManager>,
    outbound: mpsc::Sender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn stop(&self, reason: &str) {
        self.conn.close();
        self.pending.clear_with_error(reason);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop("client dropped");
    }
}

/// A live session. Cheap to clone; the session ends when the last clone is
/// dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct RtmClient {
    inner: Arc<Inner>,
}

impl RtmClient {
    /// Perform the handshake over HTTP and start the session.
    pub async fn connect(config: RtmConfig) -> RtmResult<Self> {
        config.validate().map_err(RtmError::config)?;
        let dialer = Arc::new(HttpDialer::new(&config)?);
        Self::connect_with(config, dialer, Arc::new(Dispatcher::new())).await
    }

    /// Start a session over a custom dialer.
    ///
    /// Handlers already registered on `dispatcher` see the first `hello`.
    pub async fn connect_with(
        config: RtmConfig,
        dialer: Arc<dyn Dialer>,
        dispatcher: Arc<Dispatcher>,
    ) -> RtmResult<Self> {
        config.validate().map_err(RtmError::config)?;
        let config = Arc::new(config);

        let cache = Arc::new(StateCache::new());
        let members = MembershipActor::spawn(config.membership_queue_capacity);
        let tracker = Arc::new(StateTracker::new(Arc::clone(&cache), members.clone()));
        let hooks = Arc::new(SessionHooks {
            tracker: Arc::clone(&tracker),
            dispatcher: Arc::clone(&dispatcher),
            reseed_on_reconnect: config.reseed_on_reconnect,
        });
        let conn = ConnectionManager::connect(Arc::clone(&config), dialer, hooks).await?;

        let ids = Arc::new(RequestIdGenerator::new());
        let pending = Arc::new(PendingRequestStore::new(config.max_pending_requests));
        let (outbound, outbound_rx) = mpsc::channel(config.send_queue_capacity);
        let tasks = pump::spawn(
            PumpContext {
                conn: Arc::clone(&conn),
                pending: Arc::clone(&pending),
                dispatcher: Arc::clone(&dispatcher),
                tracker,
                ids: Arc::clone(&ids),
                idle: Arc::new(IdleTimer::new()),
                outbound: outbound.clone(),
                read_deadline: config.read_deadline(),
                keepalive_interval: config.keepalive_interval,
                write_timeout: config.write_timeout,
            },
            outbound_rx,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                ids,
                pending,
                dispatcher,
                cache,
                members,
                conn,
                outbound,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send a request and wait for its correlated reply.
    ///
    /// `payload` must be a JSON object; its `id` is assigned here. A rejected
    /// request yields [`RtmError::Reply`] and a missing reply yields
    /// [`RtmError::RequestTimeout`]. On success an echo of the payload is
    /// dispatched as if the server had sent it.
    pub async fn send_raw(&self, payload: Value) -> RtmResult<Reply> {
        let Value::Object(fields) = payload else {
            return Err(RtmError::decode("outbound payload must be a JSON object"));
        };
        let (reply, _echo) = self.send_with_reply(fields).await?;
        Ok(reply)
    }

    /// Post `text` to `channel`. Returns the echo event of the delivered message.
    pub async fn send_message(&self, channel: &str, text: &str) -> RtmResult<Event> {
        let mut fields = Map::new();
        fields.insert("type".into(), Value::from(MESSAGE));
        fields.insert("channel".into(), Value::from(channel));
        fields.insert("text".into(), Value::from(text));
        let (_reply, echo) = self.send_with_reply(fields).await?;
        echo.ok_or_else(|| RtmError::internal("sent message produced no echo"))
    }

    /// Queue a frame without waiting for a reply. Returns the assigned id.
    pub async fn send_unacked(&self, payload: Value) -> RtmResult<RequestId> {
        let Value::Object(mut fields) = payload else {
            return Err(RtmError::decode("outbound payload must be a JSON object"));
        };
        let id = self.inner.ids.next_id();
        fields.insert("id".into(), Value::from(id.get()));
        self.enqueue(&fields).await?;
        Ok(id)
    }

    /// Show the typing indicator in `channel`.
    pub async fn send_typing(&self, channel: &str) -> RtmResult<()> {
        let mut fields = Map::new();
        fields.insert("type".into(), Value::from(TYPING));
        fields.insert("channel".into(), Value::from(channel));
        self.send_unacked(Value::Object(fields)).await.map(|_| ())
    }

    async fn send_with_reply(
        &self,
        mut fields: Map<String, Value>,
    ) -> RtmResult<(Reply, Option<Event>)> {
        let inner = &self.inner;
        if !inner.pending.has_capacity() {
            return Err(RtmError::capacity_exceeded(format!(
                "{} requests awaiting replies",
                inner.pending.len()
            )));
        }
        let id = inner.ids.next_id();
        fields.insert("id".into(), Value::from(id.get()));

        let Some(reply_rx) = inner.pending.add(id) else {
            return Err(RtmError::capacity_exceeded(format!(
                "{} requests awaiting replies",
                inner.pending.len()
            )));
        };
        let deadline = Instant::now() + inner.config.request_timeout;

        let outcome = timeout_at(deadline, async {
            self.enqueue(&fields).await?;
            reply_rx
                .await
                .map_err(|_| RtmError::connection_closed(Some("reply channel dropped".into())))?
        })
        .await;

        let reply = match outcome {
            Ok(Ok(reply)) => reply.into_result()?,
            Ok(Err(err)) => {
                inner.pending.remove(&id);
                return Err(err);
            }
            Err(_) => {
                inner.pending.remove(&id);
                debug!(request_id = %id, "Request timed out");
                return Err(RtmError::request_timeout(
                    inner.config.request_timeout,
                    id.to_string(),
                ));
            }
        };

        let self_id = inner.cache.self_info().map(|me| me.id);
        let echo = match Event::from_fields(merge_echo(fields, &reply, self_id.as_deref())) {
            Ok(echo) => {
                inner.dispatcher.dispatch(Arc::new(echo.clone()));
                Some(echo)
            }
            Err(err) => {
                debug!(request_id = %id, error = %err, "Sent payload has no event shape; not echoed");
                None
            }
        };
        Ok((reply, echo))
    }

    async fn enqueue(&self, fields: &Map<String, Value>) -> RtmResult<()> {
        let frame = Message::text(serde_json::to_string(fields)?);
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| RtmError::connection_closed(Some("outbound queue closed".into())))
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Register `handler` for events matching `filter`, tagged with `owner`.
    pub fn register_handler<H>(&self, owner: &str, filter: HandlerFilter, handler: H) -> HandlerId
    where
        H: EventHandler,
    {
        self.inner.dispatcher.register(owner, filter, handler)
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.unregister(id)
    }

    /// Remove every handler registered by `owner`.
    pub fn unregister_all(&self, owner: &str) -> usize {
        self.inner.dispatcher.unregister_all(owner)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    // ========================================================================
    // Directory queries
    // ========================================================================

    pub fn user(&self, id: &str) -> Option<User> {
        self.inner.cache.users().get(id)
    }

    pub fn user_by_name(&self, name: &str) -> Option<User> {
        self.inner.cache.users().find_by_name(name)
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.inner.cache.channels().get(id)
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Channel> {
        self.inner.cache.channels().find_by_name(name)
    }

    pub fn group(&self, id: &str) -> Option<Group> {
        self.inner.cache.groups().get(id)
    }

    pub fn group_by_name(&self, name: &str) -> Option<Group> {
        self.inner.cache.groups().find_by_name(name)
    }

    pub fn direct_message(&self, id: &str) -> Option<DirectMessage> {
        self.inner.cache.direct_messages().get(id)
    }

    pub fn direct_message_for_user(&self, user: &str) -> Option<DirectMessage> {
        self.inner.cache.direct_message_for_user(user)
    }

    /// Point-in-time view of every cached user.
    pub fn users(&self) -> Arc<Vec<User>> {
        self.inner.cache.users().snapshot()
    }

    pub fn channels(&self) -> Arc<Vec<Channel>> {
        self.inner.cache.channels().snapshot()
    }

    pub fn groups(&self) -> Arc<Vec<Group>> {
        self.inner.cache.groups().snapshot()
    }

    pub fn direct_messages(&self) -> Arc<Vec<DirectMessage>> {
        self.inner.cache.direct_messages().snapshot()
    }

    pub fn team(&self) -> Option<TeamInfo> {
        self.inner.cache.team()
    }

    /// The identity this session is authenticated as.
    pub fn self_info(&self) -> Option<SelfInfo> {
        self.inner.cache.self_info()
    }

    // ========================================================================
    // Membership queries
    // ========================================================================

    /// For each channel, whether `user` is a member.
    pub async fn users_in_channels(
        &self,
        user: &str,
        channels: &[&str],
    ) -> RtmResult<HashMap<ChannelId, bool>> {
        self.inner.members.users_in_channels(user, channels).await
    }

    /// Member count, or `None` when the channel's membership is unknown.
    pub async fn member_count(&self, channel: &str) -> RtmResult<Option<usize>> {
        self.inner.members.member_count(channel).await
    }

    pub async fn member_list(&self, channel: &str) -> RtmResult<Option<Vec<UserId>>> {
        self.inner.members.member_list(channel).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        self.inner.conn.state()
    }

    pub fn epoch(&self) -> ConnectionEpoch {
        self.inner.conn.epoch()
    }

    /// Dial attempts made after the initial connect.
    pub fn redial_count(&self) -> u64 {
        self.inner.conn.redial_count()
    }

    /// Requests currently awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Wait until the session has closed, either by shutdown or after a
    /// fatal redial failure.
    pub async fn closed(&self) {
        self.inner
            .conn
            .wait_for_state(|s| *s == ConnectionState::Closed)
            .await;
    }

    /// Close the transport, fail pending requests and stop every task.
    pub async fn shutdown(&self) {
        self.inner.conn.shutdown().await;
        self.inner.stop("client shut down");
        info!("Client shut down");
    }
}
