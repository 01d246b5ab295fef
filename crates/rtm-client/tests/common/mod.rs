//! In-memory server side for integration tests.
//!
//! Each dial creates a fresh pair of unbounded channels standing in for a
//! socket and hands the server half to the test through a queue.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, channel::mpsc as chan};
use parking_lot::Mutex;
use rtm_client::{
    Channel, Dialed, Dialer, Dispatcher, Group, RtmClient, RtmConfig, RtmError, RtmResult,
    SelfInfo, Snapshot, TeamInfo, Transport, User,
};
use serde_json::Value;
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::tungstenite::Message;

/// Server half of one in-memory socket.
pub struct ServerLink {
    pub to_client: chan::UnboundedSender<Message>,
    pub from_client: chan::UnboundedReceiver<Message>,
}

impl ServerLink {
    pub fn send_json(&self, value: Value) {
        self.to_client
            .unbounded_send(Message::text(value.to_string()))
            .expect("client reader alive");
    }

    /// Next text frame from the client, parsed. Control frames are skipped.
    pub async fn next_json(&mut self) -> Value {
        loop {
            let frame = timeout(Duration::from_secs(600), self.from_client.next())
                .await
                .expect("client frame in time")
                .expect("client writer alive");
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).expect("client sent JSON");
            }
        }
    }

    /// Read the next request and answer it with `ok` plus `extra` fields.
    pub async fn reply_ok(&mut self, extra: Value) -> Value {
        let request = self.next_json().await;
        let mut reply = serde_json::json!({"ok": true, "reply_to": request["id"]});
        if let (Some(reply), Value::Object(extra)) = (reply.as_object_mut(), extra) {
            reply.extend(extra);
        }
        self.send_json(reply);
        request
    }
}

/// Dialer whose snapshot, failures and first frame are scripted by the test.
pub struct FakeDialer {
    pub snapshot: Mutex<Snapshot>,
    pub failures: Mutex<VecDeque<RtmError>>,
    pub first_frame: Mutex<Message>,
    pub dials: AtomicUsize,
    links: mpsc::UnboundedSender<ServerLink>,
}

impl FakeDialer {
    pub fn new(snapshot: Snapshot) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            failures: Mutex::new(VecDeque::new()),
            first_frame: Mutex::new(Message::text(r#"{"type":"hello"}"#)),
            dials: AtomicUsize::new(0),
            links,
        });
        (dialer, rx)
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self) -> RtmResult<Dialed> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let (to_client, client_rx) = chan::unbounded::<Message>();
        let (client_tx, from_client) = chan::unbounded::<Message>();
        to_client
            .unbounded_send(self.first_frame.lock().clone())
            .expect("fresh channel");
        let _ = self.links.send(ServerLink {
            to_client,
            from_client,
        });

        Ok(Dialed {
            snapshot: self.snapshot.lock().clone(),
            transport: Transport::new(client_rx.map(Ok::<_, Infallible>), client_tx),
        })
    }
}

/// Snapshot of a small team: the bot `U0`, two humans, `C1` with two members.
pub fn team_snapshot() -> Snapshot {
    Snapshot {
        ok: true,
        self_info: SelfInfo {
            id: "U0".into(),
            name: "bot".into(),
        },
        team: TeamInfo {
            id: "T1".into(),
            name: "acme".into(),
            domain: "acme".into(),
        },
        users: vec![
            User {
                id: "U1".into(),
                name: "ada".into(),
                ..Default::default()
            },
            User {
                id: "U2".into(),
                name: "grace".into(),
                ..Default::default()
            },
        ],
        channels: vec![Channel {
            id: "C1".into(),
            name: "general".into(),
            is_member: true,
            members: Some(vec!["U1".into(), "U2".into()]),
            ..Default::default()
        }],
        groups: vec![Group {
            id: "G1".into(),
            name: "ops".into(),
            members: Some(vec!["U0".into(), "U1".into()]),
            ..Default::default()
        }],
        cache_version: Some(rtm_client::config::EXPECTED_CACHE_VERSION.into()),
        cache_ts_version: Some(rtm_client::config::EXPECTED_CACHE_TS_VERSION.into()),
        ..Default::default()
    }
}

pub fn test_config() -> RtmConfig {
    RtmConfig::new("xoxb-test")
        .reconnect_initial_delay(Duration::from_millis(10))
        .reconnect_max_delay(Duration::from_millis(50))
        .reconnect_jitter(0.0)
}

pub struct Session {
    pub client: RtmClient,
    pub dialer: Arc<FakeDialer>,
    pub link: ServerLink,
    pub links: mpsc::UnboundedReceiver<ServerLink>,
}

impl Session {
    /// Drop the current server half so the client sees its socket die.
    pub fn sever(&mut self) {
        let (to_client, _) = chan::unbounded();
        let (_, from_client) = chan::unbounded();
        drop(std::mem::replace(
            &mut self.link,
            ServerLink {
                to_client,
                from_client,
            },
        ));
    }

    /// Wait for the client to redial and return the new server half.
    pub async fn next_link(&mut self) -> ServerLink {
        timeout(Duration::from_secs(600), self.links.recv())
            .await
            .expect("redial in time")
            .expect("dialer alive")
    }
}

pub async fn connect(config: RtmConfig, dispatcher: Arc<Dispatcher>) -> Session {
    let (dialer, mut links) = FakeDialer::new(team_snapshot());
    let client = RtmClient::connect_with(config, dialer.clone(), dispatcher)
        .await
        .expect("connect");
    let link = links.recv().await.expect("first link");
    Session {
        client,
        dialer,
        link,
        links,
    }
}
