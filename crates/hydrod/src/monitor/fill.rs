use std::sync::Arc;

use hydro_core::{FillOutcome, FillReason, NodeAddress, RelayState, ValveRef};
use hydro_protocol::FeedingEvent;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{pause, read_switch, switch_off, Switch};
use crate::actuator::NodeActuator;
use crate::config::TimingSettings;
use crate::events::EventBus;
use crate::registry::NodeRegistry;
use crate::rig::Rig;

enum Wait {
    Triggered,
    TimedOut,
    Cancelled,
}

/// Drives one fill phase.
///
/// Waits for the full switch to go from untriggered to triggered, in up to
/// `sensor_wait_attempts` windows of `sensor_wait_timeout`. After the switch
/// fires the node is expected to close its own fill valve; if the relay does
/// not report off within `valve_off_confirm_timeout`, or a stop arrives
/// first, it is switched off from here.
pub struct FillMonitor {
    node: NodeAddress,
    valve: ValveRef,
    timing: TimingSettings,
    actuator: Arc<dyn NodeActuator>,
    registry: Arc<NodeRegistry>,
    events: EventBus,
    cancel: CancellationToken,
}

impl FillMonitor {
    pub fn new(
        rig: &Rig,
        node: NodeAddress,
        valve: ValveRef,
        timing: TimingSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node,
            valve,
            timing,
            actuator: Arc::clone(&rig.actuator),
            registry: Arc::clone(&rig.registry),
            events: rig.events.clone(),
            cancel,
        }
    }

    pub async fn run(self) -> FillOutcome {
        if let Err(e) = self
            .actuator
            .set_valve(&self.valve.address, self.valve.id, true)
            .await
        {
            warn!(node = %self.node, valve = %self.valve, error = %e, "Fill valve did not open");
            switch_off(&self.actuator, &self.valve).await;
            return FillOutcome::failed(FillReason::ValveOnFailed);
        }
        debug!(node = %self.node, valve = %self.valve, "Fill valve open");

        let outcome = match self.wait_for_full().await {
            Wait::Triggered => {
                self.events.emit(FeedingEvent::FillComplete {
                    plant_ip: self.node.clone(),
                });
                self.confirm_valve_off().await;
                FillOutcome::completed(FillReason::SensorTriggered)
            }
            Wait::TimedOut => {
                switch_off(&self.actuator, &self.valve).await;
                FillOutcome::failed(FillReason::SensorTimeout)
            }
            Wait::Cancelled => {
                switch_off(&self.actuator, &self.valve).await;
                FillOutcome::failed(FillReason::Interrupted)
            }
        };
        info!(
            node = %self.node,
            success = outcome.success,
            reason = %outcome.reason,
            "Fill finished"
        );
        outcome
    }

    async fn wait_for_full(&self) -> Wait {
        let attempts = self.timing.sensor_wait_attempts.max(1);
        let mut last = self.full_switch();
        for attempt in 1..=attempts {
            let deadline = Instant::now() + self.timing.sensor_wait_timeout();
            loop {
                if self.cancel.is_cancelled() {
                    return Wait::Cancelled;
                }
                let current = self.full_switch();
                if last == Some(false) && current == Some(true) {
                    debug!(node = %self.node, attempt, "Full switch triggered");
                    return Wait::Triggered;
                }
                if current.is_some() {
                    last = current;
                }
                if Instant::now() >= deadline {
                    break;
                }
                if !pause(&self.cancel, self.timing.monitor_poll()).await {
                    return Wait::Cancelled;
                }
            }
            if attempt < attempts {
                warn!(node = %self.node, attempt, attempts, "Full switch wait timed out, retrying");
                if !pause(&self.cancel, self.timing.sensor_wait_backoff()).await {
                    return Wait::Cancelled;
                }
            }
        }
        warn!(node = %self.node, attempts, "Full switch never triggered");
        Wait::TimedOut
    }

    async fn confirm_valve_off(&self) {
        let deadline = Instant::now() + self.timing.valve_off_confirm_timeout();
        loop {
            let state = self
                .registry
                .snapshot(&self.node)
                .map(|n| n.relay_state(&self.valve.label))
                .unwrap_or_default();
            if state == RelayState::Off {
                debug!(node = %self.node, "Node closed its fill valve");
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            if !pause(&self.cancel, self.timing.monitor_poll()).await {
                debug!(node = %self.node, "Stop during valve-off confirmation");
                break;
            }
        }
        warn!(
            node = %self.node,
            valve = %self.valve,
            "Fill valve not reported off, switching it off"
        );
        switch_off(&self.actuator, &self.valve).await;
    }

    fn full_switch(&self) -> Option<bool> {
        read_switch(&self.registry, &self.node, Switch::Full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{set_relay, set_switches, TestRig, FILL_VALVE};
    use std::time::Duration;

    const NODE: &str = "10.0.0.3";

    fn timing(attempts: u32, timeout_secs: f64) -> TimingSettings {
        TimingSettings {
            sensor_wait_attempts: attempts,
            sensor_wait_timeout_secs: timeout_secs,
            sensor_wait_backoff_secs: 1.0,
            valve_off_confirm_timeout_secs: 3.0,
            ..TimingSettings::default()
        }
    }

    fn monitor(t: &TestRig, timing: TimingSettings, cancel: CancellationToken) -> FillMonitor {
        let node = NodeAddress::new(NODE);
        let valve = t.rig.registry.snapshot(&node).unwrap().fill_valve().unwrap();
        FillMonitor::new(&t.rig, node, valve, timing, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_switch_completes_and_node_closes_valve() {
        let t = TestRig::new(&[NODE]);
        let mut events = t.rig.events.subscribe();
        let registry = Arc::clone(&t.rig.registry);
        tokio::spawn(async move {
            let node = NodeAddress::new(NODE);
            tokio::time::sleep(Duration::from_secs(3)).await;
            set_switches(&registry, &node, true, false);
            tokio::time::sleep(Duration::from_millis(500)).await;
            set_relay(&registry, &node, "valve1", RelayState::Off);
        });

        let outcome = monitor(&t, timing(3, 30.0), CancellationToken::new()).run().await;
        assert_eq!(outcome, FillOutcome::completed(FillReason::SensorTriggered));
        assert_eq!(
            events.try_recv().unwrap(),
            FeedingEvent::FillComplete {
                plant_ip: NodeAddress::new(NODE)
            }
        );
        // The node closed it; no forced off from the controller.
        let offs = t
            .actuator
            .commands()
            .into_iter()
            .filter(|c| !c.on)
            .count();
        assert_eq!(offs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_forced_off_when_not_confirmed() {
        let t = TestRig::new(&[NODE]);
        let registry = Arc::clone(&t.rig.registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            set_switches(&registry, &NodeAddress::new(NODE), true, false);
        });

        let started = Instant::now();
        let outcome = monitor(&t, timing(3, 30.0), CancellationToken::new()).run().await;
        assert!(outcome.success);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(!t.actuator.valve_is_on(&NodeAddress::new(NODE), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_already_triggered_does_not_count() {
        let t = TestRig::new(&[NODE]);
        set_switches(&t.rig.registry, &NodeAddress::new(NODE), true, false);

        let outcome = monitor(&t, timing(1, 5.0), CancellationToken::new()).run().await;
        assert_eq!(outcome, FillOutcome::failed(FillReason::SensorTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_times_out() {
        let t = TestRig::new(&[NODE]);

        let started = Instant::now();
        let outcome = monitor(&t, timing(3, 5.0), CancellationToken::new()).run().await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, FillOutcome::failed(FillReason::SensorTimeout));
        // Three windows plus two backoffs.
        assert!(elapsed >= Duration::from_secs(17), "took {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(20), "took {elapsed:?}");
        assert!(!t.actuator.valve_is_on(&NodeAddress::new(NODE), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_in_second_attempt() {
        let t = TestRig::new(&[NODE]);
        let registry = Arc::clone(&t.rig.registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(8)).await;
            set_switches(&registry, &NodeAddress::new(NODE), true, false);
        });

        let outcome = monitor(&t, timing(3, 5.0), CancellationToken::new()).run().await;
        assert_eq!(outcome, FillOutcome::completed(FillReason::SensorTriggered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts() {
        let t = TestRig::new(&[NODE]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            trigger.cancel();
        });

        let outcome = monitor(&t, timing(3, 30.0), cancel).run().await;
        assert_eq!(outcome, FillOutcome::failed(FillReason::Interrupted));
        assert!(!t.actuator.valve_is_on(&NodeAddress::new(NODE), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_on_failure() {
        let t = TestRig::new(&[NODE]);
        t.actuator.fail_valve_on(&NodeAddress::new(NODE), 1);

        let outcome = monitor(&t, timing(3, 30.0), CancellationToken::new()).run().await;
        assert_eq!(outcome, FillOutcome::failed(FillReason::ValveOnFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_valve_off_confirmation_forces_valve_off() {
        let t = TestRig::new(&[NODE]);
        let cancel = CancellationToken::new();
        let registry = Arc::clone(&t.rig.registry);
        let stop = cancel.clone();
        tokio::spawn(async move {
            let node = NodeAddress::new(NODE);
            tokio::time::sleep(Duration::from_secs(2)).await;
            set_switches(&registry, &node, true, false);
            tokio::time::sleep(Duration::from_secs(2)).await;
            stop.cancel();
        });

        // The node never reports the valve off.
        let timing = TimingSettings {
            valve_off_confirm_timeout_secs: 60.0,
            ..timing(1, 30.0)
        };
        let started = Instant::now();
        let outcome = monitor(&t, timing, cancel).run().await;

        assert_eq!(outcome, FillOutcome::completed(FillReason::SensorTriggered));
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(6), "returned after {elapsed:?}");
        assert!(!t.actuator.valve_is_on(&NodeAddress::new(NODE), FILL_VALVE));
    }
}
