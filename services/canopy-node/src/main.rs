use anyhow::{bail, Context};
use canopy_core::{logging, NodeConfig, SharedGatewayConfig, SystemClock};
use canopy_mesh::{MeshEvent, MeshNode, Outbound};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.validate().context("invalid node configuration")?;

    logging::init_with(config.log_format, &config.log_level);
    info!(
        node_id = config.node_id,
        is_bridge = config.is_bridge,
        gateway = config.gateway.enabled,
        "canopy-node starting"
    );

    let mut node = MeshNode::new(config.clone(), SystemClock::new())?;
    node.subscribe(|event| match event {
        MeshEvent::RelayRequested(request) => warn!(
            message_id = request.message_id,
            destination = %request.destination,
            "Relay requested but no HTTP client is attached"
        ),
        other => info!(event = ?other, "Mesh event"),
    });

    if config.is_bridge {
        if let Ok(since_epoch) = SystemTime::now().duration_since(UNIX_EPOCH) {
            node.set_unix_time(since_epoch.as_secs());
        }
    }

    let (uplink_tx, mut uplink_rx) = mpsc::channel::<bool>(4);
    if config.gateway.enabled && config.router_rssi == 0 {
        warn!(
            node_id = config.node_id,
            "router_rssi is not configured; this node cannot win bridge or gateway elections"
        );
    }
    if config.gateway.enabled {
        tokio::spawn(probe_uplink(config.gateway.clone(), uplink_tx));
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                node.tick();
                for frame in node.drain_outbox() {
                    log_frame(&frame);
                }
            }
            Some(connected) = uplink_rx.recv() => {
                node.set_uplink(connected, config.router_rssi);
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    node.disable_send_to_internet();
    info!(node_id = node.node_id(), "canopy-node stopped");
    Ok(())
}

/// Periodically TCP-connect to the configured check host.
async fn probe_uplink(gateway: SharedGatewayConfig, results: mpsc::Sender<bool>) {
    let address = format!("{}:{}", gateway.internet_check_host, gateway.internet_check_port);
    let timeout = Duration::from_millis(gateway.internet_check_timeout);
    let mut interval = tokio::time::interval(Duration::from_millis(gateway.internet_check_interval));

    loop {
        interval.tick().await;
        let connected = matches!(
            tokio::time::timeout(timeout, TcpStream::connect(&address)).await,
            Ok(Ok(_))
        );
        debug!(%address, connected, "Internet check");
        if results.send(connected).await.is_err() {
            return;
        }
    }
}

fn log_frame(frame: &Outbound) {
    let encoded = match frame.message().encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(error = %e, "Failed to encode outbound frame");
            return;
        }
    };
    match frame {
        Outbound::Single { next_hop, .. } => debug!(next_hop, frame = %encoded, "Outbound frame"),
        Outbound::Broadcast { except, .. } => debug!(?except, frame = %encoded, "Outbound broadcast"),
    }
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}
