//! GroupLink coordinator entry point.
//!
//! Loads the configuration, registers this device as the coordinator of the
//! configured group, and logs session events until Ctrl-C.
//!
//! ```text
//! grouplink-coordinator [CONFIG_PATH]
//! ```
//!
//! Without `CONFIG_PATH` the platform config file is used; a missing file
//! means defaults.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use grouplink_coordinator::CoordinatorSession;
use grouplink_core::adhoc::static_lan::StaticLanTransport;
use grouplink_core::config::{load_config, load_config_from};
use grouplink_core::SessionEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => load_config_from(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => load_config().context("loading platform config")?,
    };

    // Level from the config file; `RUST_LOG` overrides it.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    let local = config.local_device();
    info!(device = %local, "GroupLink coordinator starting");

    let transport = Arc::new(StaticLanTransport::new(
        local,
        config.discovery.coordinator_address,
        config.group.name.clone(),
    ));
    let group_name = config.group.name.clone();
    let properties = config.group.properties.clone();
    let (session, mut events) = CoordinatorSession::open(transport, config);

    let bound = session
        .register_as_coordinator(&group_name, properties)
        .await
        .context("registering as coordinator")?;
    info!(%bound, group = %group_name, "accepting members.  Press Ctrl-C to exit.");

    // ── Event pump ────────────────────────────────────────────────────────────
    let pump = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::MemberJoined(device) => info!(%device, "member joined"),
                SessionEvent::MemberLeft(device) => info!(%device, "member left"),
                SessionEvent::DataReceived { from, payload } => {
                    info!(%from, "{}", String::from_utf8_lossy(&payload))
                }
                SessionEvent::GroupReady { endpoint } => info!(%endpoint, "group ready"),
                SessionEvent::Error { message } => error!("{message}"),
                other => warn!(?other, "unexpected event for a coordinator"),
            }
        }
    });

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown signal received");

    session.disconnect().await;
    pump.abort();
    info!("GroupLink coordinator stopped");
    Ok(())
}
