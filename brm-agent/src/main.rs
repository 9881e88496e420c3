mod logging;
mod platform;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use brm::config::BrmConfig;
use brm::manager::{BorderRoutingManager, RunningPreconditions};
use brm::platform::Platform as _;

use crate::platform::{AgentPlatform, FileSettingsStore, LoggingNetworkData};

fn config_path() -> PathBuf {
    PathBuf::from(std::env::var("BRM_CONFIG_PATH").unwrap_or_else(|_| "/etc/brm.json".to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    info!("brm-agent starting...");

    let path = config_path();
    let mut config = if path.exists() {
        BrmConfig::load_from_file(&path).with_context(|| format!("failed to load config from {}", path.display()))?
    } else {
        info!(path = %path.display(), "no config file found, using defaults");
        BrmConfig::default()
    };

    if !config.infra_interface.is_empty() {
        config.infra_if_index = platform::if_nametoindex(&config.infra_interface)
            .with_context(|| format!("resolving infra interface {}", config.infra_interface))?;
    }
    info!(interface = config.infra_interface, if_index = config.infra_if_index, nat64 = config.nat64_enabled, "config loaded");

    let socket = std::sync::Arc::new(platform::open_icmp6_socket(&config.infra_interface).context("opening raw ICMPv6 socket")?);
    let mut io_platform = AgentPlatform::new(socket.clone());
    let mut network_data = LoggingNetworkData;
    let mut settings = FileSettingsStore::new(platform::default_state_dir()).context("opening settings store")?;

    let mut mgr = BorderRoutingManager::new(config);

    let now = io_platform.now_ms();
    mgr.set_enabled(true, now, &mut io_platform, &mut network_data, &mut settings);
    mgr.set_preconditions(
        RunningPreconditions {
            infra_if_running: true,
            thread_attached: true,
            has_router_eligible_role: true,
        },
        now,
        &mut io_platform,
        &mut network_data,
        &mut settings,
    );

    info!("entering event loop");
    let mut recv_buf = vec![0u8; 1500];

    loop {
        let now = io_platform.now_ms();
        let deadline = mgr.next_deadline_ms(now);
        let wait = Duration::from_millis(deadline.saturating_sub(now).min(60_000));

        tokio::select! {
            result = socket.recv_from(&mut recv_buf) => {
                match result {
                    Ok((len, src)) => {
                        let source = match src.ip() {
                            std::net::IpAddr::V6(v6) => v6,
                            std::net::IpAddr::V4(_) => continue,
                        };
                        let now = io_platform.now_ms();
                        mgr.handle_received_packet(source, &recv_buf[..len], now, &mut io_platform, &mut network_data);
                    }
                    Err(e) => warn!(error = %e, "ICMPv6 receive failed"),
                }
            }
            _ = tokio::time::sleep(wait) => {
                let now = io_platform.now_ms();
                mgr.on_timer_fire(now, &mut io_platform, &mut network_data);
            }
        }
    }
}
