//! In-memory doubles for the controller's collaborators.
//!
//! Used by the unit tests in this crate and by the integration tests under
//! `tests/`. The doubles record what they were asked to do, keyed on tokio's
//! clock so paused-time tests can reason about ordering and durations.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hydro_core::{
    NodeAddress, NodeSettings, NodeStatusPatch, RelayState, ReservoirLevel, ValveInfo,
    ValveRelay, WaterLevelSensor,
};
use tokio::time::Instant;

use crate::actuator::{ActuatorError, FailureKind, NodeActuator};
use crate::events::{EventBus, Notifier};
use crate::flow::FlowMeters;
use crate::hw::{HwError, PumpDriver, RelayBoard, ReservoirSensor};
use crate::registry::NodeRegistry;
use crate::resolve::{ResolveError, ResolvedHost, Resolver};
use crate::rig::Rig;

/// Relay id of the fill valve on every node built by [`TestRig`].
pub const FILL_VALVE: u32 = 1;
/// Relay id of the drain valve on every node built by [`TestRig`].
pub const DRAIN_VALVE: u32 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn scripted_failure(node: &NodeAddress, operation: String) -> ActuatorError {
    ActuatorError::Call {
        node: node.clone(),
        operation,
        kind: FailureKind::Transport("scripted failure".to_string()),
    }
}

// ============================================================================
// Node status helpers
// ============================================================================

/// A status push for an online node that allows remote feeding, with
/// untriggered level switches and both valves reported off.
pub fn node_patch(fill_valve: u32, drain_valve: u32) -> NodeStatusPatch {
    let mut water_level = BTreeMap::new();
    water_level.insert("sensor1".to_string(), sensor("Full", false));
    water_level.insert("sensor2".to_string(), sensor("Empty", false));

    let mut valve_relays = BTreeMap::new();
    for id in [fill_valve, drain_valve] {
        valve_relays.insert(
            format!("valve{id}"),
            ValveRelay {
                status: RelayState::Off,
            },
        );
    }

    NodeStatusPatch {
        water_level: Some(water_level),
        valve_info: Some(ValveInfo {
            fill_valve: Some(fill_valve),
            drain_valve: Some(drain_valve),
            valve_relays,
            ..ValveInfo::default()
        }),
        settings: Some(NodeSettings {
            allow_remote_feeding: true,
            ..NodeSettings::default()
        }),
    }
}

fn sensor(label: &str, triggered: bool) -> WaterLevelSensor {
    WaterLevelSensor {
        label: label.to_string(),
        triggered,
    }
}

/// Pushes new level switch readings for `node`.
pub fn set_switches(registry: &NodeRegistry, node: &NodeAddress, full: bool, empty: bool) {
    let mut water_level = BTreeMap::new();
    water_level.insert("sensor1".to_string(), sensor("Full", full));
    water_level.insert("sensor2".to_string(), sensor("Empty", empty));
    let _ = registry.apply_status(
        node,
        NodeStatusPatch {
            water_level: Some(water_level),
            ..NodeStatusPatch::default()
        },
    );
}

/// Pushes a relay state for one valve label of `node`.
pub fn set_relay(registry: &NodeRegistry, node: &NodeAddress, label: &str, state: RelayState) {
    let Some(snapshot) = registry.snapshot(node) else {
        return;
    };
    let mut valve_info = snapshot.valve_info;
    valve_info
        .valve_relays
        .insert(label.to_string(), ValveRelay { status: state });
    let _ = registry.apply_status(
        node,
        NodeStatusPatch {
            valve_info: Some(valve_info),
            ..NodeStatusPatch::default()
        },
    );
}

/// Updates the settings a node reports about itself.
pub fn set_node_settings(registry: &NodeRegistry, node: &NodeAddress, settings: NodeSettings) {
    let _ = registry.apply_status(
        node,
        NodeStatusPatch {
            settings: Some(settings),
            ..NodeStatusPatch::default()
        },
    );
}

// ============================================================================
// Actuator
// ============================================================================

/// One successful valve command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValveCommand {
    pub at: Instant,
    pub node: NodeAddress,
    pub valve: u32,
    pub on: bool,
}

#[derive(Default)]
struct ActuatorLog {
    commands: Vec<ValveCommand>,
    valves: BTreeMap<(NodeAddress, u32), bool>,
    feeding_status: Vec<(NodeAddress, bool)>,
    fail_on: BTreeSet<(NodeAddress, u32)>,
    fail_status: BTreeSet<NodeAddress>,
}

/// Actuator that records commands instead of sending them.
///
/// With a registry attached, every switched valve is also reported back as
/// the node would: the matching `valve_relays` entry flips on or off.
#[derive(Default)]
pub struct RecordingActuator {
    registry: Option<Arc<NodeRegistry>>,
    log: Mutex<ActuatorLog>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reflecting(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry: Some(registry),
            log: Mutex::default(),
        }
    }

    /// Makes every attempt to open `valve` on `node` fail.
    pub fn fail_valve_on(&self, node: &NodeAddress, valve: u32) {
        lock(&self.log).fail_on.insert((node.clone(), valve));
    }

    /// Makes feeding-status updates to `node` fail.
    pub fn fail_feeding_status(&self, node: &NodeAddress) {
        lock(&self.log).fail_status.insert(node.clone());
    }

    pub fn commands(&self) -> Vec<ValveCommand> {
        lock(&self.log).commands.clone()
    }

    pub fn valve_is_on(&self, node: &NodeAddress, valve: u32) -> bool {
        lock(&self.log)
            .valves
            .get(&(node.clone(), valve))
            .copied()
            .unwrap_or(false)
    }

    /// Valves currently open, as `(node, relay id)`.
    pub fn open_valves(&self) -> Vec<(NodeAddress, u32)> {
        lock(&self.log)
            .valves
            .iter()
            .filter(|(_, on)| **on)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn feeding_status_calls(&self) -> Vec<(NodeAddress, bool)> {
        lock(&self.log).feeding_status.clone()
    }

    fn reflect(&self, node: &NodeAddress, valve: u32, on: bool) {
        let Some(registry) = &self.registry else {
            return;
        };
        let state = if on { RelayState::On } else { RelayState::Off };
        for plant in registry.snapshots() {
            for valve_ref in [plant.fill_valve(), plant.drain_valve()].into_iter().flatten() {
                if valve_ref.id == valve && &valve_ref.address == node {
                    set_relay(registry, &plant.address, &valve_ref.label, state);
                }
            }
        }
    }
}

#[async_trait]
impl NodeActuator for RecordingActuator {
    async fn set_valve(
        &self,
        node: &NodeAddress,
        valve_id: u32,
        on: bool,
    ) -> Result<(), ActuatorError> {
        {
            let mut log = lock(&self.log);
            if on && log.fail_on.contains(&(node.clone(), valve_id)) {
                return Err(scripted_failure(node, format!("valve {valve_id} on")));
            }
            log.commands.push(ValveCommand {
                at: Instant::now(),
                node: node.clone(),
                valve: valve_id,
                on,
            });
            log.valves.insert((node.clone(), valve_id), on);
        }
        self.reflect(node, valve_id, on);
        Ok(())
    }

    async fn valve_status(
        &self,
        node: &NodeAddress,
        valve_id: u32,
    ) -> Result<RelayState, ActuatorError> {
        let log = lock(&self.log);
        Ok(match log.valves.get(&(node.clone(), valve_id)) {
            Some(true) => RelayState::On,
            Some(false) => RelayState::Off,
            None => RelayState::Unknown,
        })
    }

    async fn set_feeding_status(
        &self,
        node: &NodeAddress,
        in_progress: bool,
    ) -> Result<(), ActuatorError> {
        let mut log = lock(&self.log);
        if in_progress && log.fail_status.contains(node) {
            return Err(scripted_failure(node, "feeding status".to_string()));
        }
        log.feeding_status.push((node.clone(), in_progress));
        Ok(())
    }
}

// ============================================================================
// Local hardware
// ============================================================================

#[derive(Default)]
struct RelayLog {
    state: BTreeMap<u8, bool>,
    history: Vec<(Instant, u8, bool)>,
    failing: BTreeSet<u8>,
}

/// Relay board that keeps its state in memory.
#[derive(Default)]
pub struct RecordingRelayBoard {
    log: Mutex<RelayLog>,
}

impl RecordingRelayBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes switching `port` on fail.
    pub fn fail_port(&self, port: u8) {
        lock(&self.log).failing.insert(port);
    }

    pub fn is_port_on(&self, port: u8) -> bool {
        lock(&self.log).state.get(&port).copied().unwrap_or(false)
    }

    pub fn history(&self) -> Vec<(Instant, u8, bool)> {
        lock(&self.log).history.clone()
    }
}

#[async_trait]
impl RelayBoard for RecordingRelayBoard {
    async fn set(&self, port: u8, on: bool) -> Result<(), HwError> {
        let mut log = lock(&self.log);
        if on && log.failing.contains(&port) {
            return Err(HwError::UnknownRelay(port));
        }
        log.state.insert(port, on);
        log.history.push((Instant::now(), port, on));
        Ok(())
    }

    async fn is_on(&self, port: u8) -> Result<bool, HwError> {
        Ok(lock(&self.log).state.get(&port).copied().unwrap_or(false))
    }
}

#[derive(Default)]
struct PumpLog {
    running: bool,
    history: Vec<(Instant, bool)>,
    fail_on: bool,
}

/// Pump that keeps its state in memory.
#[derive(Default)]
pub struct RecordingPump {
    log: Mutex<PumpLog>,
}

impl RecordingPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_turn_on(&self) {
        lock(&self.log).fail_on = true;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.log).running
    }

    pub fn history(&self) -> Vec<(Instant, bool)> {
        lock(&self.log).history.clone()
    }
}

#[async_trait]
impl PumpDriver for RecordingPump {
    async fn turn_on(&self) -> Result<(), HwError> {
        let mut log = lock(&self.log);
        if log.fail_on {
            return Err(HwError::PumpNotConfigured);
        }
        log.running = true;
        log.history.push((Instant::now(), true));
        Ok(())
    }

    async fn turn_off(&self) -> Result<(), HwError> {
        let mut log = lock(&self.log);
        log.running = false;
        log.history.push((Instant::now(), false));
        Ok(())
    }

    async fn status(&self) -> Result<bool, HwError> {
        Ok(lock(&self.log).running)
    }
}

/// Reservoir switch whose level is set by the test.
pub struct ScriptedReservoir {
    level: Mutex<ReservoirLevel>,
}

impl Default for ScriptedReservoir {
    fn default() -> Self {
        Self::new(ReservoirLevel::Full)
    }
}

impl ScriptedReservoir {
    pub fn new(level: ReservoirLevel) -> Self {
        Self {
            level: Mutex::new(level),
        }
    }

    pub fn set(&self, level: ReservoirLevel) {
        *lock(&self.level) = level;
    }
}

#[async_trait]
impl ReservoirSensor for ScriptedReservoir {
    async fn level(&self) -> Result<ReservoirLevel, HwError> {
        Ok(*lock(&self.level))
    }
}

// ============================================================================
// Resolution and notification
// ============================================================================

/// Resolves every address to loopback unless told otherwise.
#[derive(Default)]
pub struct StaticResolver {
    unresolvable: Mutex<BTreeSet<NodeAddress>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_unresolvable(&self, node: &NodeAddress) {
        lock(&self.unresolvable).insert(node.clone());
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, address: &NodeAddress) -> Result<ResolvedHost, ResolveError> {
        if lock(&self.unresolvable).contains(address) {
            return Err(ResolveError::NotFound(address.to_string()));
        }
        Ok(ResolvedHost::Remote(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }
}

/// Collects operator notifications.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        lock(&self.messages).push(message.to_string());
    }
}

// ============================================================================
// Rig
// ============================================================================

/// A [`Rig`] wired to in-memory doubles, with typed handles to each double.
pub struct TestRig {
    pub rig: Rig,
    pub actuator: Arc<RecordingActuator>,
    pub relays: Arc<RecordingRelayBoard>,
    pub pump: Arc<RecordingPump>,
    pub reservoir: Arc<ScriptedReservoir>,
    pub resolver: Arc<StaticResolver>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestRig {
    /// Registers `nodes` online, each with [`FILL_VALVE`] and [`DRAIN_VALVE`]
    /// as reported by [`node_patch`].
    pub fn new(nodes: &[&str]) -> Self {
        let registry = Arc::new(NodeRegistry::with_nodes(nodes.iter().copied()));
        for node in nodes {
            let _ = registry.apply_status(&NodeAddress::new(*node), node_patch(FILL_VALVE, DRAIN_VALVE));
        }

        let actuator = Arc::new(RecordingActuator::reflecting(Arc::clone(&registry)));
        let relays = Arc::new(RecordingRelayBoard::new());
        let pump = Arc::new(RecordingPump::new());
        let reservoir = Arc::new(ScriptedReservoir::default());
        let resolver = Arc::new(StaticResolver::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let rig = Rig {
            registry,
            actuator: actuator.clone(),
            meters: FlowMeters::default(),
            relays: relays.clone(),
            pump: pump.clone(),
            reservoir: reservoir.clone(),
            resolver: resolver.clone(),
            events: EventBus::default(),
            notifier: notifier.clone(),
        };

        Self {
            rig,
            actuator,
            relays,
            pump,
            reservoir,
            resolver,
            notifier,
        }
    }
}
