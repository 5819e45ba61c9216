//! Nutrient mixing during fill.
//!
//! The regulator runs beside the sequencer for the whole process lifetime
//! and never talks to it directly: every tick it reads the published
//! [`SequencerState`](hydro_core::SequencerState) and reacts to what it sees.
//! While a node is in `Fill` it runs the feed pump and the fresh/feed
//! relays until the feed meter has delivered the node's nutrient share,
//! then leaves only the fresh relay running. The fill monitor decides when
//! the reservoir is full.
//!
//! [`MixingRunState`] records what the regulator did for the current node
//! and phase so each component is switched on once and off once.

use std::sync::Arc;
use std::time::Duration;

use hydro_core::{FeedingPhase, NodeAddress};
use hydro_protocol::FeedbackStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RelayPorts, Settings};
use crate::context::SequencerContext;
use crate::rig::Rig;

/// Nutrient share of a fill: `system_volume / (ratio + 1)`.
///
/// A ratio of zero (or less) means fresh water only.
pub fn target_feed_volume(system_volume: f64, nutrient_ratio: f64) -> f64 {
    if nutrient_ratio <= 0.0 {
        return 0.0;
    }
    system_volume / (nutrient_ratio + 1.0)
}

/// The subset of [`Settings`] the regulator acts on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixingConfig {
    pub use_feed: bool,
    /// Fresh:feed ratio, `ratio : 1`.
    pub nutrient_ratio: f64,
    pub relay_ports: RelayPorts,
    pub poll: Duration,
}

impl MixingConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            use_feed: settings.use_feed,
            nutrient_ratio: settings.nutrient_concentration,
            relay_ports: settings.relay_ports,
            poll: settings.timing.mixing_poll(),
        }
    }
}

/// What the regulator has done for the observed node and phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixingRunState {
    pub node: Option<NodeAddress>,
    pub phase: FeedingPhase,
    /// Components were switched on for this node and phase.
    pub started: bool,
    /// Everything was switched off after `started`.
    pub components_off: bool,
    /// Mixing is done (or given up) for this node and phase.
    pub completed_for_this_phase: bool,
    pub target_feed_volume: Option<f64>,
    /// Pump and feed relay are on.
    pub feed_running: bool,
    /// Feed meter volume when the pump was started.
    feed_baseline: f64,
}

impl MixingRunState {
    fn observing(node: Option<NodeAddress>, phase: FeedingPhase) -> Self {
        Self {
            node,
            phase,
            ..Self::default()
        }
    }

    fn owns_components(&self) -> bool {
        self.started && !self.components_off
    }
}

pub struct MixingRegulator {
    ctx: Arc<SequencerContext>,
    rig: Rig,
    config: MixingConfig,
    state: MixingRunState,
}

impl MixingRegulator {
    pub fn new(ctx: Arc<SequencerContext>, rig: Rig, config: MixingConfig) -> Self {
        Self {
            ctx,
            rig,
            config,
            state: MixingRunState::default(),
        }
    }

    pub fn state(&self) -> &MixingRunState {
        &self.state
    }

    /// Ticks every `config.poll` until `shutdown` fires, then switches
    /// everything it owns off.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(poll_ms = self.config.poll.as_millis() as u64, "Mixing regulator started");
        loop {
            self.tick().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll) => {}
            }
        }
        if self.state.owns_components() {
            self.all_off().await;
        }
        info!("Mixing regulator stopped");
    }

    /// One observation of the sequencer state.
    pub async fn tick(&mut self) {
        let seq = self.ctx.state();

        if seq.current_node != self.state.node || seq.phase != self.state.phase {
            if self.state.owns_components() {
                self.all_off().await;
            }
            debug!(node = ?seq.current_node, phase = %seq.phase, "Mixing observes new phase");
            self.state = MixingRunState::observing(seq.current_node.clone(), seq.phase);
        }

        let mixing_wanted = seq.active
            && !seq.stop_requested
            && seq.phase == FeedingPhase::Fill
            && self.config.use_feed;
        let Some(node) = seq.current_node.filter(|_| mixing_wanted) else {
            if self.state.owns_components() {
                self.all_off().await;
            }
            return;
        };

        if !self.state.started && !self.state.completed_for_this_phase {
            self.start(&node).await;
        } else if self.state.feed_running {
            self.check_feed_target(&node).await;
        }
    }

    async fn start(&mut self, node: &NodeAddress) {
        let Some(plant) = self.rig.registry.snapshot(node) else {
            warn!(node = %node, "Mixing skipped, node not in registry");
            self.state.completed_for_this_phase = true;
            return;
        };
        let name = plant.display_name().to_string();
        let target = target_feed_volume(plant.settings.system_volume, self.config.nutrient_ratio);
        self.state.target_feed_volume = Some(target);

        if target <= 0.0 {
            self.rig.events.feedback(
                format!("Using only fresh water for {name} (target {:.2})", plant.settings.system_volume),
                FeedbackStatus::Info,
                Some(node),
            );
            if self.relay(self.config.relay_ports.fresh_water, true).await {
                self.state.started = true;
            } else {
                self.give_up(node, "fresh water relay did not switch on").await;
            }
            self.state.completed_for_this_phase = true;
            return;
        }

        self.rig.events.feedback(
            format!(
                "Mixing for {name}: {target:.2} nutrient of {:.2} total (ratio {}:1)",
                plant.settings.system_volume, self.config.nutrient_ratio
            ),
            FeedbackStatus::Info,
            Some(node),
        );

        if let Err(e) = self.rig.pump.turn_on().await {
            warn!(node = %node, error = %e, "Feed pump did not start");
            self.give_up(node, "feed pump did not start").await;
            return;
        }
        if !self.relay(self.config.relay_ports.fresh_water, true).await {
            self.pump_off().await;
            self.give_up(node, "fresh water relay did not switch on").await;
            return;
        }
        if !self.relay(self.config.relay_ports.feed_water, true).await {
            self.relay(self.config.relay_ports.fresh_water, false).await;
            self.pump_off().await;
            self.give_up(node, "feed water relay did not switch on").await;
            return;
        }

        self.state.started = true;
        self.state.feed_running = true;
        self.state.feed_baseline = self.rig.meters.feed.total_volume().unwrap_or(0.0);
        info!(node = %node, target, "Mixing started");
    }

    async fn check_feed_target(&mut self, node: &NodeAddress) {
        let target = self.state.target_feed_volume.unwrap_or(0.0);
        let delivered =
            self.rig.meters.feed.total_volume().unwrap_or(0.0) - self.state.feed_baseline;
        if delivered < target {
            return;
        }
        self.pump_off().await;
        self.relay(self.config.relay_ports.feed_water, false).await;
        self.state.feed_running = false;
        self.state.completed_for_this_phase = true;
        self.rig.events.feedback(
            format!("Nutrient target reached ({delivered:.2} of {target:.2}), feed stopped"),
            FeedbackStatus::Info,
            Some(node),
        );
    }

    /// Mixing failed to start; nothing is retried until the phase changes.
    async fn give_up(&mut self, node: &NodeAddress, what: &str) {
        self.state.completed_for_this_phase = true;
        let message = format!("Mixing aborted for {node}: {what}");
        self.rig
            .events
            .feedback(message.clone(), FeedbackStatus::Error, Some(node));
        self.rig.notifier.notify(&message).await;
    }

    async fn all_off(&mut self) {
        self.pump_off().await;
        self.relay(self.config.relay_ports.feed_water, false).await;
        self.relay(self.config.relay_ports.fresh_water, false).await;
        self.state.components_off = true;
        self.state.feed_running = false;
        debug!(node = ?self.state.node, "Mixing components off");
    }

    async fn pump_off(&self) {
        if let Err(e) = self.rig.pump.turn_off().await {
            warn!(error = %e, "Feed pump did not stop");
        }
    }

    async fn relay(&self, port: u8, on: bool) -> bool {
        match self.rig.relays.set(port, on).await {
            Ok(()) => true,
            Err(e) => {
                warn!(port, on, error = %e, "Relay switch failed");
                false
            }
        }
    }
}
