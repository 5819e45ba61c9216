use std::sync::Arc;

use hydro_core::{DrainOutcome, DrainReason, NodeAddress, ValveRef};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{pause, read_switch, switch_off, Switch};
use crate::actuator::NodeActuator;
use crate::config::{DrainFlowSettings, TimingSettings};
use crate::flow::FlowMeter;
use crate::registry::NodeRegistry;
use crate::rig::Rig;

/// Drives one drain phase.
///
/// Completion races the empty switch against the flow heuristics and the
/// absolute cap:
///
/// | condition                                   | outcome                     |
/// |---------------------------------------------|-----------------------------|
/// | valve refuses to open                       | fail `valve_on_failed`      |
/// | no flow reading after activation delay      | switch within grace, else fail `no_flow` |
/// | rate below activation threshold             | ok `no_activation_flow`     |
/// | run cancelled                               | fail `interrupted`          |
/// | empty switch goes untriggered → triggered   | ok `sensor_triggered`       |
/// | elapsed ≥ `max_drain_time`                  | ok `timeout`                |
/// | rate < `min_flow_rate` for `min_flow_check_delay` | ok `low_flow`         |
pub struct DrainMonitor {
    node: NodeAddress,
    valve: ValveRef,
    flow: DrainFlowSettings,
    timing: TimingSettings,
    actuator: Arc<dyn NodeActuator>,
    registry: Arc<NodeRegistry>,
    meter: Arc<FlowMeter>,
    cancel: CancellationToken,
}

impl DrainMonitor {
    pub fn new(
        rig: &Rig,
        node: NodeAddress,
        valve: ValveRef,
        flow: DrainFlowSettings,
        timing: TimingSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node,
            valve,
            flow,
            timing,
            actuator: Arc::clone(&rig.actuator),
            registry: Arc::clone(&rig.registry),
            meter: Arc::clone(&rig.meters.drain),
            cancel,
        }
    }

    pub async fn run(self) -> DrainOutcome {
        let outcome = self.drive().await;
        switch_off(&self.actuator, &self.valve).await;
        info!(
            node = %self.node,
            success = outcome.success,
            reason = %outcome.reason,
            "Drain finished"
        );
        outcome
    }

    async fn drive(&self) -> DrainOutcome {
        if let Err(e) = self
            .actuator
            .set_valve(&self.valve.address, self.valve.id, true)
            .await
        {
            warn!(node = %self.node, valve = %self.valve, error = %e, "Drain valve did not open");
            return DrainOutcome::failed(DrainReason::ValveOnFailed);
        }
        let started = Instant::now();
        let initial_empty = self.empty_switch();
        debug!(node = %self.node, ?initial_empty, "Drain valve open");

        if !pause(&self.cancel, self.flow.activation_delay()).await {
            return DrainOutcome::failed(DrainReason::Interrupted);
        }

        match self.meter.latest_rate() {
            None => return self.await_switch_without_flow().await,
            Some(rate) if rate < self.flow.activation_flow_rate => {
                warn!(
                    node = %self.node,
                    rate,
                    threshold = self.flow.activation_flow_rate,
                    "No activation flow, treating reservoir as empty"
                );
                return DrainOutcome::completed(DrainReason::NoActivationFlow);
            }
            Some(rate) => debug!(node = %self.node, rate, "Drain flow established"),
        }

        // The switch must be seen untriggered before a triggered reading counts.
        let mut seen_untriggered = initial_empty != Some(true);
        let mut low_since: Option<Instant> = None;
        let max_drain_time = self.flow.max_drain_time();
        let low_window = self.flow.min_flow_check_delay();

        loop {
            if self.cancel.is_cancelled() {
                return DrainOutcome::failed(DrainReason::Interrupted);
            }

            match self.empty_switch() {
                Some(true) if seen_untriggered => {
                    return DrainOutcome::completed(DrainReason::SensorTriggered);
                }
                Some(false) => seen_untriggered = true,
                _ => {}
            }

            if started.elapsed() >= max_drain_time {
                warn!(node = %self.node, "Drain hit max drain time");
                return DrainOutcome::completed(DrainReason::Timeout);
            }

            let now = Instant::now();
            match self.meter.latest_rate() {
                Some(rate) if rate >= self.flow.min_flow_rate => low_since = None,
                rate => {
                    let since = *low_since.get_or_insert(now);
                    if now.duration_since(since) >= low_window {
                        warn!(node = %self.node, ?rate, "Drain flow stayed low");
                        return DrainOutcome::completed(DrainReason::LowFlow);
                    }
                }
            }

            if !pause(&self.cancel, self.timing.monitor_poll()).await {
                return DrainOutcome::failed(DrainReason::Interrupted);
            }
        }
    }

    /// No reading at all: the empty switch may simply not have propagated yet.
    async fn await_switch_without_flow(&self) -> DrainOutcome {
        let deadline = Instant::now() + self.timing.empty_sensor_grace();
        loop {
            if self.empty_switch() == Some(true) {
                return DrainOutcome::completed(DrainReason::SensorTriggered);
            }
            if Instant::now() >= deadline {
                warn!(node = %self.node, "No drain flow reading and empty switch not triggered");
                return DrainOutcome::failed(DrainReason::NoFlow);
            }
            if !pause(&self.cancel, self.timing.monitor_poll()).await {
                return DrainOutcome::failed(DrainReason::Interrupted);
            }
        }
    }

    fn empty_switch(&self) -> Option<bool> {
        read_switch(&self.registry, &self.node, Switch::Empty)
    }
}
