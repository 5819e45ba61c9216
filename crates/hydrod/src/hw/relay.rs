//! Local relay board driving the fresh-water and feed-water valves.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use super::{open_output, DigitalOutput, HwError};

/// Relay ports on the controller's own board.
///
/// Switching a relay is idempotent; callers may turn an already-off relay
/// off again.
#[async_trait]
pub trait RelayBoard: Send + Sync {
    async fn set(&self, port: u8, on: bool) -> Result<(), HwError>;

    async fn is_on(&self, port: u8) -> Result<bool, HwError>;
}

/// Relay board wired straight to GPIO outputs, one pin per port.
pub struct GpioRelayBoard {
    outputs: BTreeMap<u8, Box<dyn DigitalOutput>>,
}

impl GpioRelayBoard {
    pub fn new(outputs: BTreeMap<u8, Box<dyn DigitalOutput>>) -> Self {
        Self { outputs }
    }

    /// Claims every pin in `relay_pins` as a low output.
    pub fn open(relay_pins: &BTreeMap<u8, u32>) -> Result<Self, HwError> {
        let mut outputs: BTreeMap<u8, Box<dyn DigitalOutput>> = BTreeMap::new();
        for (&port, &pin) in relay_pins {
            outputs.insert(port, open_output(pin)?);
        }
        Ok(Self::new(outputs))
    }

    fn output(&self, port: u8) -> Result<&dyn DigitalOutput, HwError> {
        self.outputs
            .get(&port)
            .map(|o| o.as_ref())
            .ok_or(HwError::UnknownRelay(port))
    }
}

#[async_trait]
impl RelayBoard for GpioRelayBoard {
    async fn set(&self, port: u8, on: bool) -> Result<(), HwError> {
        self.output(port)?.write(on)?;
        debug!(port, on, "Relay switched");
        Ok(())
    }

    async fn is_on(&self, port: u8) -> Result<bool, HwError> {
        self.output(port)?.read_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Latch(Arc<AtomicBool>);

    impl DigitalOutput for Latch {
        fn write(&self, high: bool) -> Result<(), HwError> {
            self.0.store(high, Ordering::SeqCst);
            Ok(())
        }

        fn read_back(&self) -> Result<bool, HwError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_set_routes_to_port_pin() {
        let fresh = Arc::new(AtomicBool::new(false));
        let mut outputs: BTreeMap<u8, Box<dyn DigitalOutput>> = BTreeMap::new();
        outputs.insert(2, Box::new(Latch(Arc::clone(&fresh))));
        let board = GpioRelayBoard::new(outputs);

        board.set(2, true).await.unwrap();
        assert!(fresh.load(Ordering::SeqCst));
        assert!(board.is_on(2).await.unwrap());

        board.set(2, false).await.unwrap();
        board.set(2, false).await.unwrap();
        assert!(!board.is_on(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_port() {
        let board = GpioRelayBoard::new(BTreeMap::new());
        assert!(matches!(board.set(9, true).await, Err(HwError::UnknownRelay(9))));
    }
}
