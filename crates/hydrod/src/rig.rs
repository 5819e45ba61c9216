//! The collaborators a feeding run drives, bundled for cloning into tasks.

use std::sync::Arc;

use crate::actuator::NodeActuator;
use crate::events::{EventBus, Notifier};
use crate::flow::FlowMeters;
use crate::hw::{PumpDriver, RelayBoard, ReservoirSensor};
use crate::registry::NodeRegistry;
use crate::resolve::Resolver;

#[derive(Clone)]
pub struct Rig {
    pub registry: Arc<NodeRegistry>,
    pub actuator: Arc<dyn NodeActuator>,
    pub meters: FlowMeters,
    pub relays: Arc<dyn RelayBoard>,
    pub pump: Arc<dyn PumpDriver>,
    pub reservoir: Arc<dyn ReservoirSensor>,
    pub resolver: Arc<dyn Resolver>,
    pub events: EventBus,
    pub notifier: Arc<dyn Notifier>,
}
