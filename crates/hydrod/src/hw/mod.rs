//! Local hardware: GPIO pins, the mixing relay board, the nutrient pump and
//! the nutrient reservoir float switch.
//!
//! Everything here is reached through small traits so the sequencer and the
//! mixing regulator never touch a pin directly. Pin I/O is synchronous and
//! cheap (one register access through `rppal`); the pulse sampler is the
//! only caller that polls in a tight loop, and it does so on a blocking
//! thread.
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()` or indexing in
//! production code. Every pin failure surfaces as `HwError`.

use thiserror::Error;

mod gpio;
mod pump;
mod relay;
mod reservoir;

pub use gpio::{open_input, open_output, PinMode, PinRequest};
pub use pump::{build_pump, DisabledPump, GpioPump, PumpDriver, SmartPlugPump};
pub use relay::{GpioRelayBoard, RelayBoard};
pub use reservoir::{GpioReservoirSensor, ReservoirSensor};

/// Errors raised by local hardware.
#[derive(Debug, Error)]
pub enum HwError {
    #[error("failed to set up GPIO {pin}: {reason}")]
    Setup { pin: u32, reason: String },

    #[error("GPIO {0} is outside the BCM range")]
    InvalidPin(u32),

    #[error("GPIO {0} unavailable: built without hardware support")]
    Unavailable(u32),

    #[error("relay port {0} has no pin assigned")]
    UnknownRelay(u8),

    #[error("feed pump is not configured")]
    PumpNotConfigured,

    #[error("smart plug {host} call failed: {reason}")]
    SmartPlug { host: String, reason: String },
}

/// A readable digital line.
pub trait DigitalInput: Send + Sync {
    /// Current level, `true` for high.
    fn read(&self) -> Result<bool, HwError>;
}

/// A writable digital line that can report what it was last driven to.
pub trait DigitalOutput: Send + Sync {
    fn write(&self, high: bool) -> Result<(), HwError>;

    fn read_back(&self) -> Result<bool, HwError>;
}

impl<T: DigitalInput + ?Sized> DigitalInput for Box<T> {
    fn read(&self) -> Result<bool, HwError> {
        (**self).read()
    }
}
