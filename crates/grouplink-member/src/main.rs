//! GroupLink member entry point.
//!
//! Discovers a coordinator, joins its group, and forwards every stdin line
//! to the whole group as `Data`.  Exits on Ctrl-C or end of input.
//!
//! ```text
//! grouplink-member [CONFIG_PATH]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use grouplink_core::adhoc::static_lan::StaticLanTransport;
use grouplink_core::config::{load_config, load_config_from};
use grouplink_core::session::DiscoveryEvent;
use grouplink_core::{SessionEvent, Target};
use grouplink_member::MemberSession;

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
    info!(device = %local, "GroupLink member starting");

    let transport = Arc::new(StaticLanTransport::new(
        local,
        config.discovery.coordinator_address,
        config.group.name.clone(),
    ));
    let discovery_timeout = config.discovery.timeout();
    let (session, mut events) = MemberSession::open(transport, config);

    // ── Discovery ─────────────────────────────────────────────────────────────
    let mut discovery = session
        .discover_coordinators(discovery_timeout)
        .await
        .context("starting discovery")?;
    let mut chosen = None;
    while let Some(event) = discovery.recv().await {
        match event {
            DiscoveryEvent::Found(descriptor) => {
                chosen = Some(descriptor);
                break;
            }
            DiscoveryEvent::Finished(_) => break,
        }
    }
    let Some(descriptor) = chosen else {
        bail!("no coordinator found within {discovery_timeout:?}");
    };
    info!(coordinator = %descriptor.device_id, group = %descriptor.group_name, "coordinator found");

    session.connect(descriptor).await.context("joining group")?;

    // ── Event pump ────────────────────────────────────────────────────────────
    let pump = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected { coordinator } => {
                    info!(%coordinator, "connected.  Type a line to send it to the group.")
                }
                SessionEvent::RegistrySynced { devices } => {
                    info!(members = devices.len(), "registry synced")
                }
                SessionEvent::MemberJoined(device) => info!(%device, "member joined"),
                SessionEvent::MemberLeft(device) => info!(%device, "member left"),
                SessionEvent::DataReceived { from, payload } => {
                    info!(%from, "{}", String::from_utf8_lossy(&payload))
                }
                SessionEvent::CoordinatorLost => warn!("coordinator lost"),
                SessionEvent::Error { message } => error!("{message}"),
                SessionEvent::GroupReady { .. } => {}
            }
        }
    });

    // ── Stdin forwarding until EOF or Ctrl-C ──────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = session.send_data(Target::Broadcast, line.into_bytes()).await {
                        warn!("line not sent: {e}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("reading stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    session.disconnect().await;
    pump.abort();
    info!("GroupLink member stopped");
    Ok(())
}
