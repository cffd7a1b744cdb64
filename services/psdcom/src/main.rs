//! Platform Screen Door Communication Service (`psdcom`)
//!
//! Loads the configuration, builds the driver registry, starts one session
//! per device and runs until Ctrl+C or SIGTERM. SIGHUP reloads the
//! configuration file without restarting unchanged sessions.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use common::shutdown::{wait_for_shutdown, ReloadSignal};
use tracing::{error, info, warn};

use psdcom::core::bootstrap::{self, Args};
use psdcom::core::sink::relay;
use psdcom::{ChannelSink, CommunicationSupervisor, TracingSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    let config = bootstrap::load_configuration(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let _log_guard =
        bootstrap::initialize_logging(&args, &config).context("initializing logging")?;
    if !args.no_color {
        common::service_bootstrap::print_startup_banner(&service_info);
    }

    let findings = bootstrap::report_findings(&config);
    if args.validate {
        let registry = bootstrap::build_registry(&config);
        info!(
            "Validation completed: {} finding(s), {} protocol(s) available",
            findings,
            registry.protocols().len()
        );
        return Ok(());
    }

    let registry = Arc::new(bootstrap::build_registry(&config));
    let (sink, events) = ChannelSink::new(config.engine.event_buffer);
    let relay_task = tokio::spawn(relay(events, TracingSink));
    let supervisor = CommunicationSupervisor::new(
        registry,
        Arc::new(sink),
        config.engine.session_settings(),
    );

    let report = supervisor.start_all(&config.devices, &config.points).await;
    info!(
        "Engine started: {} session(s), {} point(s)",
        report.started.len(),
        report.build.indexed
    );

    let mut reload = ReloadSignal::new();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = reload.recv() => {
                info!("Reload requested, reading {}", args.config.display());
                match bootstrap::load_configuration(&args.config) {
                    Ok(next) => {
                        bootstrap::report_findings(&next);
                        if next.engine != config.engine {
                            warn!("Engine settings changed; they apply after a restart");
                        }
                        supervisor.reload_configs(&next.devices, &next.points).await;
                    },
                    Err(e) => error!("Reload failed, keeping current configuration: {}", e),
                }
            }
        }
    }

    supervisor.shutdown().await;
    drop(supervisor);
    match relay_task.await {
        Ok(count) => info!("Service stopped, {} event(s) published", count),
        Err(e) => error!("Event relay task failed: {}", e),
    }
    Ok(())
}
