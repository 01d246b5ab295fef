//! Connection manager.
//!
//! Owns the current transport link and replaces it when it fails. The link
//! lives in a watched slot: pumps wait on the slot while it is empty, and
//! the first task to report a failure for the current epoch becomes the
//! only one that redials. Everyone else waits for the new link.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, watch},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::RtmConfig,
    error::RtmResult,
    event::Event,
    handshake::{BoxReader, Dialed, Dialer, FrameSink, Snapshot, expect_hello},
    reconnect::Backoff,
};

/// Generation of the transport link. Incremented on every successful dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionEpoch(pub u64);

/// Connection state machine states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// A link is installed and traffic flows.
    Ready,
    /// The link failed and a redial is in progress.
    Reconnecting {
        /// Dial attempts made so far for this outage.
        attempt: u32,
    },
    /// Shut down, or gave up after a fatal error.
    Closed,
}

/// One live transport. Only the read pump takes `reader`; only the write
/// pump and shutdown take `writer`.
pub struct Link {
    pub(crate) epoch: ConnectionEpoch,
    pub(crate) reader: Mutex<BoxReader>,
    pub(crate) writer: Mutex<Box<dyn FrameSink>>,
}

impl Link {
    pub fn epoch(&self) -> ConnectionEpoch {
        self.epoch
    }
}

/// Told about every successful (re)dial before its link is published.
#[async_trait]
pub trait SessionObserver: Send + Sync + 'static {
    async fn on_connected(
        &self,
        snapshot: Snapshot,
        hello: Event,
        epoch: ConnectionEpoch,
        initial: bool,
    );
}

struct Slot {
    link: Option<Arc<Link>>,
    epoch: ConnectionEpoch,
    dialing: bool,
    closed: bool,
    state: ConnectionState,
}

pub struct ConnectionManager {
    config: Arc<RtmConfig>,
    dialer: Arc<dyn Dialer>,
    observer: Arc<dyn SessionObserver>,
    slot: watch::Sender<Slot>,
    redials: AtomicU64,
}

impl ConnectionManager {
    /// Dial once and install the first link.
    ///
    /// Any failure, transient or fatal, is returned to the caller.
    pub async fn connect(
        config: Arc<RtmConfig>,
        dialer: Arc<dyn Dialer>,
        observer: Arc<dyn SessionObserver>,
    ) -> RtmResult<Arc<Self>> {
        let epoch = ConnectionEpoch(1);
        let (link, snapshot, hello) = establish(dialer.as_ref(), &config, epoch).await?;
        observer.on_connected(snapshot, hello, epoch, true).await;
        info!(epoch = epoch.0, "Connected");

        let (slot, _) = watch::channel(Slot {
            link: Some(link),
            epoch,
            dialing: false,
            closed: false,
            state: ConnectionState::Ready,
        });
        Ok(Arc::new(Self {
            config,
            dialer,
            observer,
            slot,
            redials: AtomicU64::new(0),
        }))
    }

    /// Wait for a usable link. Returns `None` once the manager is closed.
    pub async fn current(&self) -> Option<Arc<Link>> {
        let mut rx = self.slot.subscribe();
        let slot = rx.wait_for(|s| s.closed || s.link.is_some()).await.ok()?;
        if slot.closed {
            return None;
        }
        slot.link.clone()
    }

    /// The installed link, without waiting.
    pub fn try_current(&self) -> Option<Arc<Link>> {
        self.slot.borrow().link.clone()
    }

    /// Report that the link of `failed` broke.
    ///
    /// The first report for the current epoch clears the slot and redials on
    /// the calling task; the call returns once a new link is installed or the
    /// manager closes. Reports for an older epoch, or while a redial is
    /// already running, return immediately and callers go back to
    /// [`current`](Self::current).
    pub async fn reconnect(&self, failed: ConnectionEpoch) {
        let mut lead = false;
        let mut stale = None;
        self.slot.send_if_modified(|slot| {
            if slot.closed || slot.dialing || slot.epoch != failed {
                return false;
            }
            stale = slot.link.take();
            slot.dialing = true;
            slot.state = ConnectionState::Reconnecting { attempt: 0 };
            lead = true;
            true
        });

        if let Some(link) = stale {
            tokio::spawn(async move { send_close(&link).await });
        }
        if lead {
            self.redial(failed).await;
        } else {
            debug!(epoch = failed.0, "Reconnect already handled");
        }
    }

    async fn redial(&self, failed: ConnectionEpoch) {
        let backoff = Backoff::from_config(&self.config);
        let epoch = ConnectionEpoch(failed.0 + 1);
        let mut attempt: u32 = 0;

        loop {
            if self.is_closed() {
                return;
            }
            self.slot.send_modify(|slot| {
                if !slot.closed {
                    slot.state = ConnectionState::Reconnecting {
                        attempt: attempt + 1,
                    };
                }
            });
            self.redials.fetch_add(1, Ordering::Relaxed);

            match establish(self.dialer.as_ref(), &self.config, epoch).await {
                Ok((link, snapshot, hello)) => {
                    self.observer
                        .on_connected(snapshot, hello, epoch, false)
                        .await;
                    let installed = self.slot.send_if_modified(|slot| {
                        if slot.closed {
                            return false;
                        }
                        slot.link = Some(link);
                        slot.epoch = epoch;
                        slot.dialing = false;
                        slot.state = ConnectionState::Ready;
                        true
                    });
                    if installed {
                        info!(epoch = epoch.0, attempt = attempt + 1, "Reconnected");
                    }
                    return;
                }
                Err(err) if err.is_fatal() => {
                    error!(epoch = epoch.0, error = %err, "Fatal handshake failure; closing session");
                    self.close();
                    return;
                }
                Err(err) => {
                    if let Some(max) = self.config.reconnect_max_attempts
                        && attempt + 1 >= max
                    {
                        error!(attempt = attempt + 1, error = %err, "Reconnect attempts exhausted; closing session");
                        self.close();
                        return;
                    }

                    let delay = backoff.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Reconnect failed; retrying"
                    );
                    attempt = attempt.saturating_add(1);
                    sleep(delay).await;
                }
            }
        }
    }

    /// Mark the manager closed and wake every waiter. Returns the link that
    /// was installed, if any.
    pub fn close(&self) -> Option<Arc<Link>> {
        let mut taken = None;
        self.slot.send_if_modified(|slot| {
            if slot.closed {
                return false;
            }
            taken = slot.link.take();
            slot.closed = true;
            slot.dialing = false;
            slot.state = ConnectionState::Closed;
            true
        });
        taken
    }

    /// Close and send a close frame on the installed link.
    pub async fn shutdown(&self) {
        let Some(link) = self.close() else {
            info!("Connection closed while disconnected");
            return;
        };
        send_close(&link).await;
        info!(epoch = link.epoch.0, "Connection closed");
    }

    /// Resolves once `epoch` stops being the installed link: a redial took
    /// it down, a newer link replaced it, or the manager closed.
    pub async fn superseded(&self, epoch: ConnectionEpoch) {
        let mut rx = self.slot.subscribe();
        let _ = rx
            .wait_for(|s| s.closed || s.epoch != epoch || s.link.is_none())
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.slot.borrow().closed
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.borrow().state.clone()
    }

    /// Epoch of the most recently installed link.
    pub fn epoch(&self) -> ConnectionEpoch {
        self.slot.borrow().epoch
    }

    /// Dial attempts made after the initial connect.
    pub fn redial_count(&self) -> u64 {
        self.redials.load(Ordering::Relaxed)
    }

    /// Wait until the state satisfies `f`. Returns `None` if the manager was dropped.
    pub async fn wait_for_state(
        &self,
        mut f: impl FnMut(&ConnectionState) -> bool,
    ) -> Option<ConnectionState> {
        let mut rx = self.slot.subscribe();
        let slot = rx.wait_for(|s| f(&s.state)).await.ok()?;
        Some(slot.state.clone())
    }
}

/// Send a close frame on `link`, giving up after a short grace period.
async fn send_close(link: &Link) {
    let grace = Duration::from_secs(1);
    let epoch = link.epoch.0;
    match timeout(grace, async { link.writer.lock().await.close().await }).await {
        Ok(Ok(())) => debug!(epoch, "Sent close frame"),
        Ok(Err(err)) => debug!(epoch, error = %err, "Close frame failed"),
        Err(_) => debug!(epoch, "Close frame timed out"),
    }
}

/// Dial, validate version markers and wait for `hello`.
async fn establish(
    dialer: &dyn Dialer,
    config: &RtmConfig,
    epoch: ConnectionEpoch,
) -> RtmResult<(Arc<Link>, Snapshot, Event)> {
    let Dialed {
        snapshot,
        transport,
    } = dialer.dial().await?;
    snapshot.check_versions(config)?;

    let mut reader = transport.reader;
    let hello = expect_hello(&mut reader, config.connect_timeout).await?;

    let link = Arc::new(Link {
        epoch,
        reader: Mutex::new(reader),
        writer: Mutex::new(transport.writer),
    });
    Ok((link, snapshot, hello))
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::atomic::AtomicUsize};

    use futures::{StreamExt, channel::mpsc};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::{error::RtmError, handshake::Transport};

    type Peer = (mpsc::UnboundedSender<Message>, mpsc::UnboundedReceiver<Message>);

    /// Scripted dial outcomes; each successful dial opens with `hello`.
    struct ScriptedDialer {
        outcomes: parking_lot::Mutex<VecDeque<RtmResult<()>>>,
        peers: parking_lot::Mutex<Vec<Peer>>,
        dials: AtomicUsize,
    }

    impl ScriptedDialer {
        fn new(outcomes: Vec<RtmResult<()>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: parking_lot::Mutex::new(outcomes.into()),
                peers: parking_lot::Mutex::new(Vec::new()),
                dials: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self) -> RtmResult<Dialed> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(()));
            outcome?;

            let (in_tx, in_rx) = mpsc::unbounded::<Message>();
            let (out_tx, out_rx) = mpsc::unbounded::<Message>();
            in_tx
                .unbounded_send(Message::text(r#"{"type":"hello"}"#))
                .expect("reader alive");
            self.peers.lock().push((in_tx, out_rx));
            Ok(Dialed {
                snapshot: Snapshot {
                    ok: true,
                    ..Default::default()
                },
                transport: Transport::new(in_rx.map(Ok::<_, std::convert::Infallible>), out_tx),
            })
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SessionObserver for CountingObserver {
        async fn on_connected(&self, _: Snapshot, hello: Event, _: ConnectionEpoch, _: bool) {
            assert!(hello.is("hello"));
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> Arc<RtmConfig> {
        Arc::new(
            RtmConfig::new("xoxb-test")
                .reconnect_initial_delay(Duration::from_millis(10))
                .reconnect_max_delay(Duration::from_millis(100))
                .reconnect_jitter(0.0),
        )
    }

    #[tokio::test]
    async fn test_concurrent_reconnect_dials_once() {
        let dialer = ScriptedDialer::new(Vec::new());
        let observer = Arc::new(CountingObserver::default());
        let manager = ConnectionManager::connect(config(), dialer.clone(), observer.clone())
            .await
            .expect("connect");
        let failed = manager.epoch();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.reconnect(failed).await;
                    manager.current().await.map(|link| link.epoch())
                })
            })
            .collect();

        for task in tasks {
            let epoch = task.await.expect("task");
            assert_eq!(epoch, Some(ConnectionEpoch(2)));
        }
        assert_eq!(manager.redial_count(), 1);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(observer.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_redial_supersedes_and_closes_old_link() {
        let dialer = ScriptedDialer::new(Vec::new());
        let manager =
            ConnectionManager::connect(config(), dialer.clone(), Arc::new(CountingObserver::default()))
                .await
                .expect("connect");

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.superseded(ConnectionEpoch(1)).await })
        };
        manager.reconnect(ConnectionEpoch(1)).await;
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("reader of the old link woken")
            .expect("task");

        let (_old_in, mut old_out) = dialer.peers.lock().remove(0);
        let end = timeout(Duration::from_secs(1), old_out.next())
            .await
            .expect("old writer closed in time");
        assert_eq!(end, None);

        assert!(
            timeout(Duration::from_millis(20), manager.superseded(ConnectionEpoch(2)))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_stale_epoch_report_is_ignored() {
        let dialer = ScriptedDialer::new(Vec::new());
        let manager =
            ConnectionManager::connect(config(), dialer.clone(), Arc::new(CountingObserver::default()))
                .await
                .expect("connect");

        manager.reconnect(ConnectionEpoch(1)).await;
        manager.reconnect(ConnectionEpoch(1)).await;

        assert_eq!(manager.epoch(), ConnectionEpoch(2));
        assert_eq!(manager.redial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_then_recover() {
        let dialer = ScriptedDialer::new(vec![
            Ok(()),
            Err(RtmError::websocket("refused")),
            Err(RtmError::websocket("refused")),
        ]);
        let manager =
            ConnectionManager::connect(config(), dialer.clone(), Arc::new(CountingObserver::default()))
                .await
                .expect("connect");

        manager.reconnect(manager.epoch()).await;

        assert_eq!(manager.redial_count(), 3);
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert!(manager.try_current().is_some());
    }

    #[tokio::test]
    async fn test_fatal_redial_closes_manager() {
        let dialer = ScriptedDialer::new(vec![Ok(()), Err(RtmError::handshake("invalid_auth"))]);
        let manager =
            ConnectionManager::connect(config(), dialer, Arc::new(CountingObserver::default()))
                .await
                .expect("connect");

        manager.reconnect(manager.epoch()).await;

        assert!(manager.is_closed());
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_initial_failure_is_returned() {
        let dialer = ScriptedDialer::new(vec![Err(RtmError::websocket("refused"))]);
        let result =
            ConnectionManager::connect(config(), dialer, Arc::new(CountingObserver::default())).await;
        assert!(matches!(result, Err(RtmError::WebSocket { .. })));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let dialer = ScriptedDialer::new(vec![Ok(()), Err(RtmError::websocket("down"))]);
        let manager = ConnectionManager::connect(
            Arc::new(
                RtmConfig::new("xoxb-test")
                    .reconnect_initial_delay(Duration::from_secs(3600))
                    .reconnect_max_delay(Duration::from_secs(3600))
                    .reconnect_jitter(0.0),
            ),
            dialer,
            Arc::new(CountingObserver::default()),
        )
        .await
        .expect("connect");

        let leader = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.reconnect(ConnectionEpoch(1)).await })
        };
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .wait_for_state(|s| {
                        matches!(
                            s,
                            ConnectionState::Reconnecting { .. } | ConnectionState::Closed
                        )
                    })
                    .await;
                manager.current().await.is_none()
            })
        };

        manager
            .wait_for_state(|s| matches!(s, ConnectionState::Reconnecting { attempt: 1 }))
            .await;
        manager.shutdown().await;

        assert!(waiter.await.expect("waiter"));
        leader.abort();
    }
}
