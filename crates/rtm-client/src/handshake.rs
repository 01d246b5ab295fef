//! Handshake call and transport plumbing.
//!
//! A session starts with an out-of-band HTTP call that returns the socket
//! URL together with a full directory snapshot. The socket is then opened
//! and its first frame must be `hello`.

use std::{fmt::Display, pin::Pin, time::Duration};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::{
    config::RtmConfig,
    error::{RtmError, RtmResult},
    event::{Event, HELLO, Inbound, decode_frame},
    model::{Channel, DirectMessage, Group, SelfInfo, TeamInfo, User},
};

/// Inbound half of a transport.
pub type BoxReader = Pin<Box<dyn Stream<Item = RtmResult<Message>> + Send>>;

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, message: Message) -> RtmResult<()>;

    async fn close(&mut self) -> RtmResult<()>;
}

/// Adapts any frame [`Sink`] into a [`FrameSink`].
pub struct SinkWriter<S> {
    inner: S,
}

impl<S> SinkWriter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> FrameSink for SinkWriter<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    async fn send_frame(&mut self, message: Message) -> RtmResult<()> {
        self.inner
            .send(message)
            .await
            .map_err(|e| RtmError::websocket(e.to_string()))
    }

    async fn close(&mut self) -> RtmResult<()> {
        self.inner
            .close()
            .await
            .map_err(|e| RtmError::websocket(e.to_string()))
    }
}

/// An open bidirectional frame transport.
pub struct Transport {
    pub reader: BoxReader,
    pub writer: Box<dyn FrameSink>,
}

impl Transport {
    /// Wrap a split socket, or any pair of frame stream and frame sink.
    pub fn new<R, W, E>(reader: R, writer: W) -> Self
    where
        R: Stream<Item = Result<Message, E>> + Send + 'static,
        E: Display + 'static,
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let reader = reader.map(|item| item.map_err(|e| RtmError::websocket(e.to_string())));
        Self {
            reader: Box::pin(reader),
            writer: Box::new(SinkWriter::new(writer)),
        }
    }
}

/// Response of the handshake call.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub ok: bool,
    pub error: Option<String>,
    /// Socket endpoint for this session.
    pub url: Option<String>,
    #[serde(rename = "self")]
    pub self_info: SelfInfo,
    pub team: TeamInfo,
    pub users: Vec<User>,
    pub channels: Vec<Channel>,
    pub groups: Vec<Group>,
    pub ims: Vec<DirectMessage>,
    pub cache_version: Option<String>,
    pub cache_ts_version: Option<String>,
}

impl Snapshot {
    /// Reject protocol revisions this client was not built against.
    ///
    /// A marker the server omits is not checked.
    pub fn check_versions(&self, config: &RtmConfig) -> RtmResult<()> {
        check_marker(
            "cache_version",
            &config.expected_cache_version,
            self.cache_version.as_deref(),
        )?;
        check_marker(
            "cache_ts_version",
            &config.expected_cache_ts_version,
            self.cache_ts_version.as_deref(),
        )
    }
}

fn check_marker(marker: &'static str, expected: &str, actual: Option<&str>) -> RtmResult<()> {
    match actual {
        Some(actual) if actual != expected => Err(RtmError::VersionMismatch {
            marker,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Result of one successful dial: the snapshot and the opened socket.
pub struct Dialed {
    pub snapshot: Snapshot,
    pub transport: Transport,
}

/// Performs the handshake call and opens the socket.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> RtmResult<Dialed>;
}

/// Dials over HTTPS and a real WebSocket.
pub struct HttpDialer {
    client: reqwest::Client,
    start_url: String,
    token: String,
    connect_timeout: Duration,
}

impl HttpDialer {
    pub fn new(config: &RtmConfig) -> RtmResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            start_url: format!("{}/rtm.start", config.api_url.trim_end_matches('/')),
            token: config.token.clone(),
            connect_timeout: config.connect_timeout,
        })
    }

    async fn fetch_snapshot(&self) -> RtmResult<Snapshot> {
        let snapshot: Snapshot = self
            .client
            .post(&self.start_url)
            .form(&[("token", self.token.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !snapshot.ok {
            let reason = snapshot.error.as_deref().unwrap_or("unknown error");
            return Err(RtmError::handshake(format!("rtm.start rejected: {reason}")));
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self) -> RtmResult<Dialed> {
        let snapshot = self.fetch_snapshot().await?;
        let url = snapshot
            .url
            .clone()
            .ok_or_else(|| RtmError::handshake("rtm.start response has no socket url"))?;

        debug!(url = %url, "Opening socket");
        let (socket, _response) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                RtmError::websocket(format!(
                    "Socket open timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        let (writer, reader) = socket.split();
        Ok(Dialed {
            snapshot,
            transport: Transport::new(reader, writer),
        })
    }
}

/// Wait for the first frame and require it to be `hello`.
///
/// A read error is transient. A closed socket, a silent socket or any other
/// first frame is a handshake failure.
pub async fn expect_hello(reader: &mut BoxReader, wait: Duration) -> RtmResult<Event> {
    let frame = match timeout(wait, reader.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(err))) => return Err(err),
        Ok(None) => return Err(RtmError::handshake("socket closed before hello")),
        Err(_) => return Err(RtmError::handshake(format!("no hello within {wait:?}"))),
    };

    match decode_frame(frame) {
        Ok(Inbound::Event(event)) if event.is(HELLO) => Ok(event),
        Ok(Inbound::Event(event)) => Err(RtmError::handshake(format!(
            "expected hello, got {}",
            event.kind()
        ))),
        Ok(_) => Err(RtmError::handshake("expected hello, got a non-event frame")),
        Err(err) => Err(RtmError::handshake(format!("undecodable first frame: {err}"))),
    }
}
