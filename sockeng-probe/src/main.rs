mod commands;
mod config;
mod logging;

use sockeng::telemetry::{self, MetricsHandle};
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let (config, command) = config::load_config()?;
    logging::init_logging(&config.logging)?;

    info!("Configuration loaded successfully");

    let metrics = if config.telemetry.enable_metrics {
        telemetry::start_metrics_collector().unwrap_or_else(|_| {
            warn!("Metrics collector already running, counters disabled");
            MetricsHandle::disabled()
        })
    } else {
        MetricsHandle::disabled()
    };

    let outcome = commands::run(&config, command);

    let snapshot = metrics.shutdown();
    if config.telemetry.print_summary {
        info!(
            connect_attempts = snapshot.connect_attempts,
            connections_established = snapshot.connections_established,
            connections_failed = snapshot.connections_failed,
            bytes_read = snapshot.bytes_read,
            bytes_written = snapshot.bytes_written,
            datagrams_sent = snapshot.datagrams_sent,
            datagrams_received = snapshot.datagrams_received,
            socket_errors = snapshot.socket_errors,
            "Probe finished"
        );
    }

    outcome
}
