//! hydrofeed controller daemon
//!
//! Connects to every configured plant node, samples the local flow meters,
//! runs the mixing regulator and drives one feeding sequence across all
//! nodes.
//!
//! # Usage
//!
//! ```bash
//! # Feed every configured plant once
//! hydrofeedd feed
//!
//! # Use another settings file and give the nodes longer to report in
//! hydrofeedd --settings /etc/hydrofeed/settings.json feed --settle-secs 15
//!
//! # Validate the settings file and print the effective values
//! hydrofeedd check
//!
//! # Enable debug logging
//! RUST_LOG=hydrod=debug hydrofeedd feed
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Stop the feeding run, switch every actuator off, exit

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hydrod::actuator::{HttpActuatorClient, RetryPolicy, RetryingClient};
use hydrod::config::DEFAULT_SETTINGS_PATH;
use hydrod::events::{EventBus, EventSink, JsonlEventLog, TracingNotifier};
use hydrod::flow::{start_pin_sampler, FlowMeters};
use hydrod::hw::{build_pump, GpioRelayBoard, GpioReservoirSensor};
use hydrod::registry::{spawn_links, LinkConfig, NodeRegistry};
use hydrod::resolve::{Resolver, SystemResolver};
use hydrod::{
    FeedingSequencer, MixingConfig, MixingRegulator, Rig, SequencerConfig, SequencerContext,
    Settings,
};

/// hydrofeed controller - drain/fill feeding across plant nodes
#[derive(Parser, Debug)]
#[command(name = "hydrofeedd", version, about)]
struct Args {
    /// Settings file
    #[arg(long, env = "HYDRO_SETTINGS", default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one feeding sequence across all configured plants
    Feed {
        /// Seconds to wait for node status streams before starting
        #[arg(long, default_value_t = 5)]
        settle_secs: u64,
    },
    /// Validate the settings file and print the effective settings
    Check,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Feed { settle_secs: 5 });

    match command {
        Command::Feed { settle_secs } => run_feed(args.settings, Duration::from_secs(settle_secs)),
        Command::Check => {
            let settings = Settings::load(&args.settings)
                .with_context(|| format!("Invalid settings in {}", args.settings.display()))?;
            let rendered =
                serde_json::to_string_pretty(&settings).context("Failed to render settings")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_feed(settings_path: PathBuf, settle: Duration) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hydrod=info".parse()?)
                .add_directive("hydro_core=info".parse()?)
                .add_directive("hydro_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "hydrofeed controller starting"
    );

    let settings = Settings::load(&settings_path)
        .with_context(|| format!("Invalid settings in {}", settings_path.display()))?;
    let cancel_token = CancellationToken::new();

    let rig = build_rig(&settings)?;

    for meter in [&rig.meters.fresh, &rig.meters.feed, &rig.meters.drain] {
        let pin = settings.flow_pins.pin_for(meter.role());
        start_pin_sampler(Arc::clone(meter), pin, cancel_token.clone());
    }

    let link_config = LinkConfig {
        status_port: settings.node_ports.status,
        ..LinkConfig::default()
    };
    let _links = spawn_links(
        &settings.additional_plants,
        &link_config,
        &rig.registry,
        &rig.resolver,
        &cancel_token,
    );
    info!(plants = settings.additional_plants.len(), "Node links started");

    let ctx = Arc::new(SequencerContext::new(cancel_token.clone()));
    let regulator = MixingRegulator::new(
        Arc::clone(&ctx),
        rig.clone(),
        MixingConfig::from_settings(&settings),
    );
    let regulator_handle = tokio::spawn(regulator.run(cancel_token.clone()));

    let events = rig.events.clone();
    let sequencer = Arc::new(FeedingSequencer::new(
        Arc::clone(&ctx),
        rig,
        SequencerConfig::from_settings(&settings),
    ));

    let signal_sequencer = Arc::clone(&sequencer);
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        let summary = signal_sequencer.stop().await;
        info!(%summary, "Actuators switched off");
        shutdown_token.cancel();
    });

    tokio::select! {
        _ = cancel_token.cancelled() => {}
        _ = tokio::time::sleep(settle) => {}
    }

    let outcome = if cancel_token.is_cancelled() {
        warn!("Shut down before the feeding sequence started");
        Ok(())
    } else {
        match sequencer.run().await {
            Ok(summary) => {
                info!(%summary, "Feeding sequence finished");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Feeding sequence did not run");
                Err(e.into())
            }
        }
    };

    cancel_token.cancel();
    if let Err(e) = regulator_handle.await {
        warn!(error = %e, "Mixing regulator task failed");
    }
    events.flush().await;

    info!("hydrofeed controller stopped");
    outcome
}

fn build_rig(settings: &Settings) -> Result<Rig> {
    let policy = RetryPolicy::from(&settings.retry);
    let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver::new(settings.system_name.clone()));

    let http = RetryingClient::new(policy).context("Failed to build HTTP client")?;
    let actuator = HttpActuatorClient::new(http, Arc::clone(&resolver), &settings.node_ports);

    let meters =
        FlowMeters::new(&settings.calibration_factors).context("Invalid calibration factors")?;
    let relays = GpioRelayBoard::open(&settings.relay_pins).context("Failed to open relay board")?;
    let pump = build_pump(settings.feed_pump.as_ref(), policy).context("Failed to set up feed pump")?;
    let reservoir = GpioReservoirSensor::open(settings.feed_level_pin)
        .context("Failed to open reservoir level switch")?;

    let event_log: Arc<dyn EventSink> = Arc::new(JsonlEventLog::new(settings.event_log_dir()));
    let events = EventBus::new(Some(event_log));

    Ok(Rig {
        registry: Arc::new(NodeRegistry::with_nodes(settings.additional_plants.iter().cloned())),
        actuator: Arc::new(actuator),
        meters,
        relays: Arc::new(relays),
        pump,
        reservoir: Arc::new(reservoir),
        resolver,
        events,
        notifier: Arc::new(TracingNotifier),
    })
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
