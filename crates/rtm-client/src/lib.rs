//! # rtm-client
//!
//! Long-lived client for an event-driven real-time messaging session over
//! WebSocket.
//!
//! - **Directory mirror**: users, channels, private groups and direct
//!   messages, seeded from the handshake snapshot and kept current from
//!   live events
//! - **Membership actor**: per-channel member sets owned by one worker task
//! - **Transparent reconnection**: single-flight redial with exponential
//!   backoff; pending requests survive it
//! - **Request/reply correlation**: every request gets a fresh id and waits
//!   for its `reply_to` with a deadline
//! - **Fan-out**: handlers filtered by event type and subtype, each run as
//!   an isolated task
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  frames  ┌────────────┐  reply_to  ┌─────────────────────┐
//! │  Read Pump  │────────▶│  decode    │──────────▶│ PendingRequestStore │
//! └──────┬──────┘          └─────┬──────┘            └─────────────────────┘
//!        │                       │ events
//!        │                       ▼
//!        │              ┌────────────────┐   ┌────────────┐
//!        │              │  StateTracker  │──▶│ Membership │
//!        │              └───────┬────────┘   │   Actor    │
//!        │                      ▼            └────────────┘
//!        │              ┌────────────────┐
//!        │              │   Dispatcher   │──▶ handler tasks
//!        │              └────────────────┘
//!        ▼
//! ┌───────────────────┐     ┌─────────────┐
//! │ ConnectionManager │◀────│ Write Pump  │◀── send queue ◀── RtmClient
//! └───────────────────┘     └─────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rtm_client::{HandlerFilter, RtmClient, RtmConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RtmClient::connect(RtmConfig::new("xoxb-token")).await?;
//!
//!     let sender = client.clone();
//!     client.register_handler(
//!         "greeter",
//!         HandlerFilter::event("message").subtypes(["channel_join"]),
//!         move |event: Arc<rtm_client::Event>| {
//!             let sender = sender.clone();
//!             async move {
//!                 if let Some(channel) = event.channel() {
//!                     sender.send_message(channel, "welcome!").await?;
//!                 }
//!                 Ok(())
//!             }
//!         },
//!     );
//!
//!     client.closed().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handshake;
pub mod membership;
pub mod model;
pub mod pending;
pub mod pump;
pub mod tracker;
pub mod types;

mod reconnect;

pub use client::RtmClient;
pub use config::RtmConfig;
pub use connection::{ConnectionEpoch, ConnectionState};
pub use dispatch::{Dispatcher, EventHandler, HandlerError, HandlerFilter, HandlerId, WILDCARD};
pub use error::{RtmError, RtmResult};
pub use event::{Event, Reply, ReplyErrorBody};
pub use handshake::{Dialed, Dialer, HttpDialer, Snapshot, Transport};
pub use model::{Channel, DirectMessage, Group, SelfInfo, TeamInfo, User};
pub use types::RequestId;
