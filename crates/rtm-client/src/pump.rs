//! Session tasks: read pump, write pump and keepalive timer.
//!
//! The read pump is the only reader of the transport and the write pump
//! the only writer. Both park on the connection manager while no link is
//! installed and report failures to it; neither ever exits on a transport
//! error.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::{
    connection::{ConnectionManager, Link},
    dispatch::Dispatcher,
    event::{Inbound, decode_frame},
    pending::PendingRequestStore,
    tracker::StateTracker,
    types::RequestIdGenerator,
};

/// Time of the last successful read, or of the last keepalive.
pub struct IdleTimer {
    last: watch::Sender<Instant>,
}

impl IdleTimer {
    pub fn new() -> Self {
        let (last, _) = watch::channel(Instant::now());
        Self { last }
    }

    pub fn touch(&self) {
        self.last.send_replace(Instant::now());
    }

    pub fn last(&self) -> Instant {
        *self.last.borrow()
    }
}

impl Default for IdleTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the session tasks share.
#[derive(Clone)]
pub struct PumpContext {
    pub conn: Arc<ConnectionManager>,
    pub pending: Arc<PendingRequestStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<StateTracker>,
    pub ids: Arc<RequestIdGenerator>,
    pub idle: Arc<IdleTimer>,
    pub outbound: mpsc::Sender<Message>,
    pub read_deadline: Duration,
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
}

/// Start the three session tasks.
pub fn spawn(ctx: PumpContext, outbound_rx: mpsc::Receiver<Message>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(read_pump(ctx.clone())),
        tokio::spawn(write_pump(
            Arc::clone(&ctx.conn),
            outbound_rx,
            ctx.write_timeout,
        )),
        tokio::spawn(keepalive(ctx)),
    ]
}

enum ReadOutcome {
    Frame(Message),
    /// The link is unusable and should be replaced.
    Failed,
    /// Another task already replaced the link, or the session closed.
    Superseded,
}

async fn read_pump(ctx: PumpContext) {
    while let Some(link) = ctx.conn.current().await {
        let frame = match read_frame(&ctx, &link).await {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::Failed => {
                ctx.conn.reconnect(link.epoch()).await;
                continue;
            }
            ReadOutcome::Superseded => continue,
        };

        match decode_frame(frame) {
            Ok(inbound) => {
                ctx.idle.touch();
                route(&ctx, inbound).await;
            }
            Err(err) => {
                warn!(epoch = link.epoch().0, error = %err, "Undecodable frame; reconnecting");
                ctx.conn.reconnect(link.epoch()).await;
            }
        }
    }
    // No link will come back to answer what is still waiting.
    ctx.pending.clear_with_error("session closed");
    debug!("Read pump stopped");
}

/// Next frame from `link`. Gives up on the link as soon as the manager
/// moves past its epoch, even if the socket itself is still open.
async fn read_frame(ctx: &PumpContext, link: &Link) -> ReadOutcome {
    let epoch = link.epoch().0;
    let mut reader = link.reader.lock().await;
    tokio::select! {
        biased;
        () = ctx.conn.superseded(link.epoch()) => {
            debug!(epoch, "Link superseded; moving reads to the current link");
            ReadOutcome::Superseded
        }
        outcome = timeout(ctx.read_deadline, reader.next()) => match outcome {
            Ok(Some(Ok(frame))) => ReadOutcome::Frame(frame),
            Ok(Some(Err(err))) => {
                warn!(epoch, error = %err, "Read failed; reconnecting");
                ReadOutcome::Failed
            }
            Ok(None) => {
                warn!(epoch, "Transport ended; reconnecting");
                ReadOutcome::Failed
            }
            Err(_) => {
                warn!(
                    epoch,
                    silent_ms = ctx.read_deadline.as_millis() as u64,
                    "Peer silent past read deadline; reconnecting"
                );
                ReadOutcome::Failed
            }
        },
    }
}

async fn route(ctx: &PumpContext, inbound: Inbound) {
    match inbound {
        Inbound::Reply(reply) => {
            let id = reply.reply_to();
            if !ctx.pending.resolve(&id, Ok(reply)) {
                debug!(request_id = %id, "Dropping reply with no waiter");
            }
        }
        Inbound::Ping(data) => {
            // Never block reads behind a full send queue.
            if let Err(err) = ctx.outbound.try_send(Message::Pong(data)) {
                debug!(error = %err, "Pong dropped");
            }
        }
        Inbound::Event(event) => {
            if let Err(err) = ctx.tracker.apply(&event).await {
                warn!(event_type = %event.kind(), error = %err, "Failed to apply directory event");
            }
            debug!(event_type = %event.kind(), "Dispatching event");
            ctx.dispatcher.dispatch(Arc::new(event));
        }
    }
}

async fn write_pump(
    conn: Arc<ConnectionManager>,
    mut outbound: mpsc::Receiver<Message>,
    write_timeout: Duration,
) {
    while let Some(frame) = outbound.recv().await {
        // A dequeued frame is retried on every new link until it is written.
        loop {
            let Some(link) = conn.current().await else {
                debug!("Write pump stopped");
                return;
            };
            let write = async { link.writer.lock().await.send_frame(frame.clone()).await };
            match timeout(write_timeout, write).await {
                Ok(Ok(())) => break,
                Ok(Err(err)) => {
                    warn!(epoch = link.epoch().0, error = %err, "Write failed; reconnecting");
                    conn.reconnect(link.epoch()).await;
                }
                Err(_) => {
                    warn!(
                        epoch = link.epoch().0,
                        timeout_ms = write_timeout.as_millis() as u64,
                        "Write stalled; reconnecting"
                    );
                    conn.reconnect(link.epoch()).await;
                }
            }
        }
    }
    debug!("Outbound queue closed; write pump stopped");
}

async fn keepalive(ctx: PumpContext) {
    loop {
        let due = ctx.idle.last() + ctx.keepalive_interval;
        sleep_until(due).await;
        if ctx.conn.is_closed() {
            debug!("Keepalive stopped");
            return;
        }
        // Traffic arrived while sleeping.
        if ctx.idle.last() + ctx.keepalive_interval > Instant::now() {
            continue;
        }

        if ctx.conn.try_current().is_some() {
            let id = ctx.ids.next_id();
            let ping = json!({ "id": id.get(), "type": "ping" }).to_string();
            debug!(request_id = %id, "Sending keepalive ping");
            if ctx.outbound.send(Message::text(ping)).await.is_err() {
                debug!("Outbound queue closed; keepalive stopped");
                return;
            }
        }
        ctx.idle.touch();
    }
}
