//! Nutrient reservoir float switch.

use async_trait::async_trait;
use hydro_core::ReservoirLevel;

use super::{open_input, DigitalInput, HwError};

#[async_trait]
pub trait ReservoirSensor: Send + Sync {
    async fn level(&self) -> Result<ReservoirLevel, HwError>;
}

/// Float switch on a pulled-up input; the line reads low once the
/// reservoir has run dry.
pub struct GpioReservoirSensor {
    input: Box<dyn DigitalInput>,
}

impl GpioReservoirSensor {
    pub fn new(input: Box<dyn DigitalInput>) -> Self {
        Self { input }
    }

    pub fn open(pin: u32) -> Result<Self, HwError> {
        Ok(Self::new(open_input(pin)?))
    }
}

#[async_trait]
impl ReservoirSensor for GpioReservoirSensor {
    async fn level(&self) -> Result<ReservoirLevel, HwError> {
        if self.input.read()? {
            Ok(ReservoirLevel::Full)
        } else {
            Ok(ReservoirLevel::Empty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(bool);

    impl DigitalInput for Fixed {
        fn read(&self) -> Result<bool, HwError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_low_reads_empty() {
        let sensor = GpioReservoirSensor::new(Box::new(Fixed(false)));
        assert_eq!(sensor.level().await.unwrap(), ReservoirLevel::Empty);

        let sensor = GpioReservoirSensor::new(Box::new(Fixed(true)));
        assert_eq!(sensor.level().await.unwrap(), ReservoirLevel::Full);
    }
}
