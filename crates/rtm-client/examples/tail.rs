//! Tail a workspace: log every event the session receives.
//!
//! ```text
//! RTM_TOKEN=xoxb-... cargo run --example tail
//! ```

use std::sync::Arc;

use rtm_client::{Event, HandlerError, HandlerFilter, RtmClient, RtmConfig, RtmResult};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> RtmResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("RTM_TOKEN")
        .map_err(|_| rtm_client::RtmError::config("RTM_TOKEN is not set"))?;
    let client = RtmClient::connect(RtmConfig::new(token)).await?;

    if let (Some(me), Some(team)) = (client.self_info(), client.team()) {
        info!(
            user = %me.name,
            team = %team.name,
            channels = client.channels().len(),
            users = client.users().len(),
            "Session ready"
        );
    }

    client.register_handler("tail", HandlerFilter::any(), |event: Arc<Event>| async move {
        info!(
            event_type = %event.kind(),
            subtype = event.subtype().unwrap_or("-"),
            channel = event.channel().unwrap_or("-"),
            user = event.user().unwrap_or("-"),
            text = event.text().unwrap_or(""),
            "Event"
        );
        Ok::<(), HandlerError>(())
    });

    tokio::select! {
        _ = client.closed() => info!("Session closed by the server"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; shutting down");
            client.shutdown().await;
        }
    }
    Ok(())
}
