//! The feeding sequencer.
//!
//! Walks the configured nodes strictly one after another. For each node it
//! drives a drain phase and then a fill phase, each owned by a monitor task
//! that is raced against the run's cancellation token:
//!
//! ```text
//!   Idle ──start()──► Running{drain → fill} per node ──► Completed
//!                          │
//!                          └──stop() / reservoir empty──► Stopped
//! ```
//!
//! A node that cannot be fed is skipped or failed and the run moves on.
//! Only an operator stop, a process shutdown or an empty nutrient reservoir
//! end the run early.
//!
//! # Actuator ownership
//!
//! Node valves belong to the monitor of the current phase. The local pump and
//! feed/fresh relays belong to the mixing regulator during `Fill`; the
//! sequencer only touches them from [`FeedingSequencer::stop`].

use std::future::Future;
use std::sync::Arc;

use hydro_core::{FeedingPhase, NodeAddress, PlantNode, ReservoirLevel, ValveRef};
use hydro_protocol::{FeedbackStatus, FeedingEvent, NodeCommand};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DrainFlowSettings, RelayPorts, Settings, TimingSettings};
use crate::context::SequencerContext;
use crate::monitor::{switch_off, DrainMonitor, FillMonitor};
use crate::rig::Rig;

mod summary;

pub use summary::{NodeResult, RunEnd, RunProgress, RunSummary, StopSummary};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequencerError {
    #[error("a feeding sequence is already running")]
    AlreadyRunning,

    #[error("no plants configured")]
    NoNodesConfigured,

    #[error("feeding run task failed: {0}")]
    TaskFailed(String),
}

/// The subset of [`Settings`] the sequencer acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerConfig {
    /// Nodes in feeding order.
    pub nodes: Vec<NodeAddress>,
    pub use_feed: bool,
    pub relay_ports: RelayPorts,
    pub drain: DrainFlowSettings,
    pub timing: TimingSettings,
}

impl SequencerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            nodes: settings.additional_plants.clone(),
            use_feed: settings.use_feed,
            relay_ports: settings.relay_ports,
            drain: settings.drain_flow_settings,
            timing: settings.timing,
        }
    }
}

/// How a supervised monitor ended.
enum Supervised<T> {
    Finished(T),
    Stopped,
    Crashed,
}

/// Releases the run slot even if the run task unwinds.
struct RunSlot<'a>(&'a SequencerContext);

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.0.end_run();
    }
}

pub struct FeedingSequencer {
    ctx: Arc<SequencerContext>,
    rig: Rig,
    config: SequencerConfig,
}

impl FeedingSequencer {
    pub fn new(ctx: Arc<SequencerContext>, rig: Rig, config: SequencerConfig) -> Self {
        Self { ctx, rig, config }
    }

    pub fn context(&self) -> &Arc<SequencerContext> {
        &self.ctx
    }

    /// Starts a run in the background.
    ///
    /// # Errors
    ///
    /// `NoNodesConfigured` with an empty plant list, `AlreadyRunning` while a
    /// previous run has not exited.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<RunSummary>, SequencerError> {
        if self.config.nodes.is_empty() {
            return Err(SequencerError::NoNodesConfigured);
        }
        let token = self.ctx.begin_run(&self.config.nodes)?;
        self.rig
            .events
            .emit(FeedingEvent::FeedingSequenceState { active: true });
        self.rig.events.feedback(
            format!(
                "Feeding sequence started for {} plant(s)",
                self.config.nodes.len()
            ),
            FeedbackStatus::Info,
            None,
        );

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run_nodes(token).await }))
    }

    /// Starts a run and waits for its summary.
    pub async fn run(self: &Arc<Self>) -> Result<RunSummary, SequencerError> {
        self.start()?
            .await
            .map_err(|e| SequencerError::TaskFailed(e.to_string()))
    }

    async fn run_nodes(&self, token: CancellationToken) -> RunSummary {
        let _slot = RunSlot(&self.ctx);
        let started = Instant::now();
        let mut end = RunEnd::Completed;

        for node in &self.config.nodes {
            if token.is_cancelled() || self.ctx.stop_requested() {
                end = RunEnd::Stopped;
                break;
            }

            let result = self.feed_node(node, &token).await;
            self.ctx.record(node, &result);
            if result == NodeResult::Stopped {
                end = RunEnd::Stopped;
                break;
            }

            if self.config.use_feed && self.reservoir_empty().await {
                let message = "Nutrient reservoir is empty, stopping feeding sequence";
                self.rig
                    .events
                    .feedback(message, FeedbackStatus::Error, None);
                self.rig.notifier.notify(message).await;
                self.stop().await;
                end = RunEnd::ReservoirEmpty;
                break;
            }
        }

        if end == RunEnd::Completed && !self.ctx.stop_requested() {
            self.ctx.finish();
            self.rig
                .events
                .emit(FeedingEvent::FeedingSequenceState { active: false });
        }

        let summary = RunSummary {
            end,
            progress: self.ctx.progress(),
            elapsed: started.elapsed(),
        };
        let status = match end {
            RunEnd::Completed => FeedbackStatus::Success,
            RunEnd::Stopped => FeedbackStatus::Warning,
            RunEnd::ReservoirEmpty => FeedbackStatus::Error,
        };
        self.rig.events.feedback(summary.to_string(), status, None);
        summary
    }

    async fn reservoir_empty(&self) -> bool {
        match self.rig.reservoir.level().await {
            Ok(level) => level == ReservoirLevel::Empty,
            Err(e) => {
                warn!(error = %e, "Reservoir level unreadable, continuing");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // One node
    // ------------------------------------------------------------------------

    /// Checks whether `node` can be fed and returns its valves.
    async fn preflight(&self, node: &NodeAddress) -> Result<(PlantNode, ValveRef, ValveRef), String> {
        let plant = self
            .rig
            .registry
            .snapshot(node)
            .ok_or_else(|| "not registered".to_string())?;
        if !plant.online {
            return Err("offline".to_string());
        }
        if !plant.settings.allow_remote_feeding {
            return Err("remote feeding not allowed".to_string());
        }
        if let Err(e) = self.rig.resolver.resolve(node).await {
            return Err(format!("unresolvable: {e}"));
        }
        let drain = plant
            .drain_valve()
            .ok_or_else(|| "no drain valve reported".to_string())?;
        let fill = plant
            .fill_valve()
            .ok_or_else(|| "no fill valve reported".to_string())?;
        Ok((plant, drain, fill))
    }

    async fn feed_node(&self, node: &NodeAddress, token: &CancellationToken) -> NodeResult {
        let (plant, drain_valve, fill_valve) = match self.preflight(node).await {
            Ok(ready) => ready,
            Err(reason) => {
                self.rig.events.feedback(
                    format!("Skipping {node}: {reason}"),
                    FeedbackStatus::Warning,
                    Some(node),
                );
                return NodeResult::Skipped(reason);
            }
        };
        let name = plant.display_name().to_string();

        let previous = self.rig.meters.reset_all();
        debug!(node = %node, previous = %previous, "Flow meters reset");

        if let Err(e) = self.rig.actuator.set_feeding_status(node, true).await {
            self.rig.events.feedback(
                format!("Skipping {name}: could not mark feeding in progress ({e})"),
                FeedbackStatus::Warning,
                Some(node),
            );
            self.clear_feeding_status(node).await;
            return NodeResult::Skipped("feeding status update failed".to_string());
        }
        if let Err(e) = self.rig.registry.send_command(node, NodeCommand::StartFeeding) {
            debug!(node = %node, error = %e, "start_feeding not delivered");
        }
        self.rig.events.feedback(
            format!("Feeding {name}: draining"),
            FeedbackStatus::Info,
            Some(node),
        );

        // Drain
        if self.ctx.enter(FeedingPhase::Drain, node).is_err() {
            self.clear_feeding_status(node).await;
            return NodeResult::Stopped;
        }
        let drain = DrainMonitor::new(
            &self.rig,
            node.clone(),
            drain_valve.clone(),
            self.config.drain,
            self.config.timing,
            token.clone(),
        );
        let outcome = match self.supervise(drain.run(), token, &drain_valve).await {
            Supervised::Finished(outcome) => outcome,
            Supervised::Stopped => return self.node_stopped(node).await,
            Supervised::Crashed => {
                return self.node_failed(node, &name, "drain monitor crashed".to_string()).await
            }
        };
        if !outcome.success {
            if token.is_cancelled() {
                return self.node_stopped(node).await;
            }
            return self
                .node_failed(node, &name, format!("drain: {}", outcome.reason))
                .await;
        }
        if outcome.is_fail_open() {
            self.rig.events.feedback(
                format!("Drain for {name} ended on {}, continuing", outcome.reason),
                FeedbackStatus::Warning,
                Some(node),
            );
        }

        // Fill
        if self.ctx.enter(FeedingPhase::Fill, node).is_err() {
            return self.node_stopped(node).await;
        }
        self.rig.events.feedback(
            format!("Feeding {name}: filling"),
            FeedbackStatus::Info,
            Some(node),
        );
        let fill = FillMonitor::new(
            &self.rig,
            node.clone(),
            fill_valve.clone(),
            self.config.timing,
            token.clone(),
        );
        let outcome = match self.supervise(fill.run(), token, &fill_valve).await {
            Supervised::Finished(outcome) => outcome,
            Supervised::Stopped => return self.node_stopped(node).await,
            Supervised::Crashed => {
                return self.node_failed(node, &name, "fill monitor crashed".to_string()).await
            }
        };
        if !outcome.success {
            if token.is_cancelled() {
                return self.node_stopped(node).await;
            }
            return self
                .node_failed(node, &name, format!("fill: {}", outcome.reason))
                .await;
        }

        let totals = self.rig.meters.totals();
        info!(node = %node, totals = %totals, "Node fed");
        self.rig.events.feedback(
            format!("Feeding completed for {name} ({totals})"),
            FeedbackStatus::Success,
            Some(node),
        );
        self.clear_feeding_status(node).await;
        self.ctx.idle();
        NodeResult::Completed
    }

    /// Runs a monitor as its own task and races it against `token`.
    ///
    /// On cancellation the monitor gets `stop_grace` to close its valve;
    /// after that it is aborted and the valve is closed from here.
    async fn supervise<F, T>(&self, monitor: F, token: &CancellationToken, valve: &ValveRef) -> Supervised<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut handle = tokio::spawn(monitor);
        tokio::select! {
            biased;
            joined = &mut handle => {
                return match joined {
                    Ok(outcome) => Supervised::Finished(outcome),
                    Err(e) => {
                        error!(valve = %valve, error = %e, "Monitor task failed");
                        switch_off(&self.rig.actuator, valve).await;
                        Supervised::Crashed
                    }
                };
            }
            _ = token.cancelled() => {}
        }

        match tokio::time::timeout(self.config.timing.stop_grace(), &mut handle).await {
            Ok(Ok(_)) => debug!(valve = %valve, "Monitor wound down after stop"),
            Ok(Err(e)) => {
                warn!(valve = %valve, error = %e, "Monitor task failed during stop");
                switch_off(&self.rig.actuator, valve).await;
            }
            Err(_) => {
                handle.abort();
                warn!(valve = %valve, "Monitor did not wind down, aborted");
                switch_off(&self.rig.actuator, valve).await;
            }
        }
        Supervised::Stopped
    }

    async fn node_failed(&self, node: &NodeAddress, name: &str, reason: String) -> NodeResult {
        let message = format!("Feeding failed for {name}: {reason}");
        self.rig
            .events
            .feedback(message.clone(), FeedbackStatus::Error, Some(node));
        self.rig.notifier.notify(&message).await;
        self.clear_feeding_status(node).await;
        self.ctx.idle();
        NodeResult::Failed(reason)
    }

    async fn node_stopped(&self, node: &NodeAddress) -> NodeResult {
        info!(node = %node, "Node interrupted by stop");
        self.clear_feeding_status(node).await;
        NodeResult::Stopped
    }

    async fn clear_feeding_status(&self, node: &NodeAddress) {
        if let Err(e) = self.rig.actuator.set_feeding_status(node, false).await {
            warn!(node = %node, error = %e, "Could not clear feeding status");
        }
    }

    // ------------------------------------------------------------------------
    // Global stop
    // ------------------------------------------------------------------------

    /// Stops the current run, if any, and switches every actuator the
    /// controller knows about off. Safe to call at any time and repeatedly.
    pub async fn stop(&self) -> StopSummary {
        let current = self.ctx.state().current_node;
        let was_active = self.ctx.request_stop();

        if let Err(e) = self.rig.pump.turn_off().await {
            warn!(error = %e, "Feed pump did not stop");
        }
        for port in [
            self.config.relay_ports.feed_water,
            self.config.relay_ports.fresh_water,
        ] {
            if let Err(e) = self.rig.relays.set(port, false).await {
                warn!(port, error = %e, "Relay did not switch off");
            }
        }

        let notified = self.rig.registry.broadcast_command(NodeCommand::StopFeeding);
        debug!(notified, "stop_feeding broadcast");

        for plant in self.rig.registry.snapshots() {
            let is_current = current.as_ref() == Some(&plant.address);
            for valve in [plant.fill_valve(), plant.drain_valve()].into_iter().flatten() {
                if is_current || plant.relay_state(&valve.label).is_on() {
                    switch_off(&self.rig.actuator, &valve).await;
                }
            }
        }

        let mut progress = self.ctx.progress();
        if let Some(node) = current {
            if progress.remaining.contains(&node) {
                progress.record(&node, &NodeResult::Stopped);
            }
        }
        let summary = StopSummary {
            was_active,
            progress,
        };
        if was_active {
            self.rig
                .events
                .emit(FeedingEvent::FeedingSequenceState { active: false });
            self.rig
                .events
                .feedback(summary.to_string(), FeedbackStatus::Warning, None);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{set_switches, TestRig, DRAIN_VALVE, FILL_VALVE};
    use std::time::Duration;

    /// Virtual time a stopped run gets to unwind.
    const UNWIND: Duration = Duration::from_secs(10);

    const A: &str = "10.0.0.11";
    const B: &str = "10.0.0.12";

    fn config(nodes: &[&str]) -> SequencerConfig {
        SequencerConfig {
            nodes: nodes.iter().map(|n| NodeAddress::new(*n)).collect(),
            use_feed: true,
            relay_ports: RelayPorts::default(),
            drain: DrainFlowSettings {
                activation_flow_rate: 0.1,
                min_flow_rate: 0.05,
                activation_delay: 1.0,
                min_flow_check_delay: 3.0,
                max_drain_time: 5.0,
            },
            timing: TimingSettings {
                sensor_wait_attempts: 1,
                sensor_wait_timeout_secs: 5.0,
                valve_off_confirm_timeout_secs: 2.0,
                ..TimingSettings::default()
            },
        }
    }

    fn sequencer(t: &TestRig, nodes: &[&str]) -> Arc<FeedingSequencer> {
        let ctx = Arc::new(SequencerContext::new(CancellationToken::new()));
        Arc::new(FeedingSequencer::new(ctx, t.rig.clone(), config(nodes)))
    }

    #[tokio::test]
    async fn test_refuses_without_nodes() {
        let t = TestRig::new(&[]);
        let seq = sequencer(&t, &[]);
        assert_eq!(seq.start().err(), Some(SequencerError::NoNodesConfigured));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_second_start() {
        let t = TestRig::new(&[A]);
        let seq = sequencer(&t, &[A]);
        let handle = seq.start().unwrap();
        assert_eq!(seq.start().err(), Some(SequencerError::AlreadyRunning));
        seq.stop().await;
        tokio::time::timeout(UNWIND, handle).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_unfeedable_nodes() {
        let t = TestRig::new(&[A, B]);
        t.rig.registry.mark_offline(&NodeAddress::new(A)).unwrap();
        t.resolver.make_unresolvable(&NodeAddress::new(B));
        let seq = sequencer(&t, &[A, B, "10.0.0.99"]);

        let summary = seq.run().await.unwrap();
        assert_eq!(summary.end, RunEnd::Completed);
        let skipped: Vec<&str> = summary
            .progress
            .skipped
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(skipped, vec![A, B, "10.0.0.99"]);
        assert!(t.actuator.commands().is_empty());
        assert!(!seq.context().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeding_status_failure_skips_node() {
        let t = TestRig::new(&[A]);
        t.actuator.fail_feeding_status(&NodeAddress::new(A));
        let seq = sequencer(&t, &[A]);

        let summary = seq.run().await.unwrap();
        assert_eq!(summary.progress.skipped.len(), 1);
        assert!(t.actuator.commands().is_empty());
        assert_eq!(
            t.actuator.feeding_status_calls(),
            vec![(NodeAddress::new(A), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_failure_moves_to_next_node() {
        let t = TestRig::new(&[A, B]);
        t.actuator.fail_valve_on(&NodeAddress::new(A), DRAIN_VALVE);
        t.rig.meters.drain.ingest(120);
        let seq = sequencer(&t, &[A, B]);

        let summary = seq.run().await.unwrap();
        // B drains on the timeout, then its full switch never fires.
        assert_eq!(
            summary.progress.failed,
            vec![
                (NodeAddress::new(A), "drain: valve_on_failed".to_string()),
                (NodeAddress::new(B), "fill: sensor_timeout".to_string()),
            ]
        );
        assert_eq!(t.notifier.messages().len(), 2);
        assert!(t.actuator.open_valves().is_empty());
        assert!(t
            .actuator
            .commands()
            .iter()
            .any(|c| c.node.as_str() == B && c.valve == FILL_VALVE && c.on));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_drain() {
        let t = TestRig::new(&[A, B]);
        t.rig.meters.drain.ingest(120);
        let seq = sequencer(&t, &[A, B]);
        let mut events = t.rig.events.subscribe();

        let handle = seq.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let stop = seq.stop().await;
        assert!(stop.was_active);
        assert_eq!(stop.progress.stopped, vec![NodeAddress::new(A)]);
        assert_eq!(stop.progress.remaining, vec![NodeAddress::new(B)]);

        let summary = tokio::time::timeout(UNWIND, handle).await.unwrap().unwrap();
        assert_eq!(summary.end, RunEnd::Stopped);
        assert!(t.actuator.open_valves().is_empty());
        assert!(!t
            .actuator
            .commands()
            .iter()
            .any(|c| c.node.as_str() == B));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FeedingEvent::FeedingSequenceState { active } = event {
                states.push(active);
            }
        }
        assert_eq!(states, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_still_switches_off() {
        let t = TestRig::new(&[A]);
        let seq = sequencer(&t, &[A]);
        crate::testing::set_relay(
            &t.rig.registry,
            &NodeAddress::new(A),
            "valve1",
            hydro_core::RelayState::On,
        );

        let stop = seq.stop().await;
        assert!(!stop.was_active);
        assert!(t
            .actuator
            .commands()
            .iter()
            .any(|c| c.node.as_str() == A && c.valve == FILL_VALVE && !c.on));
        assert!(!t.pump.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_completes() {
        let t = TestRig::new(&[A]);
        let registry = Arc::clone(&t.rig.registry);
        let meter = Arc::clone(&t.rig.meters.drain);
        tokio::spawn(async move {
            let node = NodeAddress::new(A);
            meter.ingest(120);
            tokio::time::sleep(Duration::from_secs(3)).await;
            set_switches(&registry, &node, false, true);
            tokio::time::sleep(Duration::from_secs(3)).await;
            set_switches(&registry, &node, true, false);
        });
        let seq = sequencer(&t, &[A]);

        let summary = seq.run().await.unwrap();
        assert_eq!(summary.end, RunEnd::Completed);
        assert_eq!(summary.progress.completed, vec![NodeAddress::new(A)]);
        assert!(t.actuator.open_valves().is_empty());
        assert_eq!(
            t.actuator.feeding_status_calls(),
            vec![(NodeAddress::new(A), true), (NodeAddress::new(A), false)]
        );
    }
}
