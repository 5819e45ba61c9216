//! GPIO lines through `rppal` (BCM numbering).
//!
//! Inputs are always claimed with the internal pull-up enabled: the flow
//! meters and the reservoir float switch pull the line low. Outputs start
//! low so a relay or pump never energises on claim.
//!
//! Without the `hardware` feature (or off Linux) every claim fails with
//! [`HwError::Unavailable`], which leaves meters at `None` and makes the
//! relay board and pump unusable.

use tracing::debug;

use super::{DigitalInput, DigitalOutput, HwError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    InputPullUp,
    OutputLow,
}

/// A validated request for one GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRequest {
    pub bcm: u8,
    pub mode: PinMode,
}

impl PinRequest {
    /// An input with the pull-up enabled.
    pub fn input(pin: u32) -> Result<Self, HwError> {
        Ok(Self {
            bcm: bcm(pin)?,
            mode: PinMode::InputPullUp,
        })
    }

    /// An output driven low on claim.
    pub fn output(pin: u32) -> Result<Self, HwError> {
        Ok(Self {
            bcm: bcm(pin)?,
            mode: PinMode::OutputLow,
        })
    }
}

fn bcm(pin: u32) -> Result<u8, HwError> {
    u8::try_from(pin).map_err(|_| HwError::InvalidPin(pin))
}

/// Claims `pin` as a pulled-up input.
pub fn open_input(pin: u32) -> Result<Box<dyn DigitalInput>, HwError> {
    let request = PinRequest::input(pin)?;
    let input = claim_input(request)?;
    debug!(pin, mode = ?request.mode, "GPIO claimed");
    Ok(input)
}

/// Claims `pin` as an output driven low.
pub fn open_output(pin: u32) -> Result<Box<dyn DigitalOutput>, HwError> {
    let request = PinRequest::output(pin)?;
    let output = claim_output(request)?;
    debug!(pin, mode = ?request.mode, "GPIO claimed");
    Ok(output)
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
use rpi::{claim_input, claim_output};

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn claim_input(request: PinRequest) -> Result<Box<dyn DigitalInput>, HwError> {
    Err(HwError::Unavailable(u32::from(request.bcm)))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn claim_output(request: PinRequest) -> Result<Box<dyn DigitalOutput>, HwError> {
    Err(HwError::Unavailable(u32::from(request.bcm)))
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
mod rpi {
    use std::sync::{Mutex, MutexGuard};

    use rppal::gpio::{Gpio, InputPin, OutputPin, Pin};

    use super::{PinMode, PinRequest};
    use crate::hw::{DigitalInput, DigitalOutput, HwError};

    fn lock<T>(line: &Mutex<T>) -> MutexGuard<'_, T> {
        line.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pin(request: PinRequest) -> Result<Pin, HwError> {
        Gpio::new()
            .and_then(|gpio| gpio.get(request.bcm))
            .map_err(|e| HwError::Setup {
                pin: u32::from(request.bcm),
                reason: e.to_string(),
            })
    }

    fn wrong_mode(request: PinRequest) -> HwError {
        HwError::Setup {
            pin: u32::from(request.bcm),
            reason: format!("cannot claim as {:?}", request.mode),
        }
    }

    struct RpiInput(Mutex<InputPin>);

    impl DigitalInput for RpiInput {
        fn read(&self) -> Result<bool, HwError> {
            Ok(lock(&self.0).is_high())
        }
    }

    struct RpiOutput(Mutex<OutputPin>);

    impl DigitalOutput for RpiOutput {
        fn write(&self, high: bool) -> Result<(), HwError> {
            let mut line = lock(&self.0);
            if high {
                line.set_high();
            } else {
                line.set_low();
            }
            Ok(())
        }

        fn read_back(&self) -> Result<bool, HwError> {
            Ok(lock(&self.0).is_set_high())
        }
    }

    pub(super) fn claim_input(request: PinRequest) -> Result<Box<dyn DigitalInput>, HwError> {
        if request.mode != PinMode::InputPullUp {
            return Err(wrong_mode(request));
        }
        let line = pin(request)?.into_input_pullup();
        Ok(Box::new(RpiInput(Mutex::new(line))))
    }

    pub(super) fn claim_output(request: PinRequest) -> Result<Box<dyn DigitalOutput>, HwError> {
        if request.mode != PinMode::OutputLow {
            return Err(wrong_mode(request));
        }
        let line = pin(request)?.into_output_low();
        Ok(Box::new(RpiOutput(Mutex::new(line))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_are_pulled_up_and_outputs_start_low() {
        assert_eq!(
            PinRequest::input(4).unwrap(),
            PinRequest {
                bcm: 4,
                mode: PinMode::InputPullUp
            }
        );
        assert_eq!(PinRequest::output(17).unwrap().mode, PinMode::OutputLow);
    }

    #[test]
    fn test_rejects_pin_outside_bcm_range() {
        assert!(matches!(PinRequest::input(300), Err(HwError::InvalidPin(300))));
        assert!(matches!(open_output(256), Err(HwError::InvalidPin(256))));
    }

    #[cfg(not(all(feature = "hardware", target_os = "linux")))]
    #[test]
    fn test_claims_fail_without_hardware_support() {
        assert!(matches!(open_input(18), Err(HwError::Unavailable(18))));
        assert!(matches!(open_output(5), Err(HwError::Unavailable(5))));
    }
}
