//! Pulse flow meters.
//!
//! Each meter turns a pulse train into an instantaneous rate (volume units
//! per minute) and a cumulative volume. A sampler task per meter counts
//! rising edges over one-second windows on a blocking thread and feeds the
//! count into the meter with [`FlowMeter::ingest`]; readers take the meter's
//! lock only long enough to copy a number out.
//!
//! Volume is monotonic between resets. A read error never ends the sampler;
//! a pin that cannot be set up leaves the meter reporting `None` forever.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hydro_core::{FlowRole, FlowTotals};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::CalibrationFactors;
use crate::hw::{open_input, DigitalInput, HwError};

/// Length of one sampling window.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Edge polling granularity inside a window.
pub const EDGE_POLL: Duration = Duration::from_millis(1);

/// Pause before the next window after a read error.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq)]
pub enum FlowError {
    #[error("calibration factor must be a positive number, got {0}")]
    InvalidCalibration(f64),
}

// ============================================================================
// Meter
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct FlowReading {
    calibration_factor: f64,
    latest_rate: Option<f64>,
    volume: Option<f64>,
}

/// One calibrated flow meter.
#[derive(Debug)]
pub struct FlowMeter {
    role: FlowRole,
    reading: Mutex<FlowReading>,
}

impl FlowMeter {
    /// # Errors
    ///
    /// `calibration_factor` is not a positive finite number.
    pub fn new(role: FlowRole, calibration_factor: f64) -> Result<Self, FlowError> {
        check_factor(calibration_factor)?;
        Ok(Self::unchecked(role, calibration_factor))
    }

    fn unchecked(role: FlowRole, calibration_factor: f64) -> Self {
        Self {
            role,
            reading: Mutex::new(FlowReading {
                calibration_factor,
                latest_rate: None,
                volume: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowReading> {
        self.reading
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn role(&self) -> FlowRole {
        self.role
    }

    /// Records the pulses counted over one window and returns the rate.
    pub fn ingest(&self, pulses: u32) -> f64 {
        let mut reading = self.lock();
        let rate = f64::from(pulses) / reading.calibration_factor;
        reading.latest_rate = Some(rate);
        reading.volume = Some(reading.volume.unwrap_or(0.0) + rate / 60.0);
        trace!(meter = self.role.as_str(), pulses, rate, "Flow window");
        rate
    }

    /// Rate of the last completed window, units per minute.
    pub fn latest_rate(&self) -> Option<f64> {
        self.lock().latest_rate
    }

    /// Volume accumulated since the last reset.
    pub fn total_volume(&self) -> Option<f64> {
        self.lock().volume
    }

    /// Zeroes the volume and returns the previous total. The calibration
    /// factor and latest rate are kept.
    pub fn reset(&self) -> f64 {
        let mut reading = self.lock();
        let previous = reading.volume.unwrap_or(0.0);
        reading.volume = Some(0.0);
        drop(reading);
        debug!(meter = self.role.as_str(), previous, "Flow volume reset");
        previous
    }

    pub fn calibration_factor(&self) -> f64 {
        self.lock().calibration_factor
    }

    /// # Errors
    ///
    /// `factor` is not a positive finite number; the current factor is kept.
    pub fn set_calibration_factor(&self, factor: f64) -> Result<(), FlowError> {
        check_factor(factor)?;
        self.lock().calibration_factor = factor;
        info!(meter = self.role.as_str(), factor, "Calibration factor updated");
        Ok(())
    }
}

fn check_factor(factor: f64) -> Result<(), FlowError> {
    if factor.is_finite() && factor > 0.0 {
        Ok(())
    } else {
        Err(FlowError::InvalidCalibration(factor))
    }
}

// ============================================================================
// Meter bundle
// ============================================================================

/// The fresh, feed and drain meters.
#[derive(Debug, Clone)]
pub struct FlowMeters {
    pub fresh: Arc<FlowMeter>,
    pub feed: Arc<FlowMeter>,
    pub drain: Arc<FlowMeter>,
}

impl Default for FlowMeters {
    /// Meters at the stock calibration factor.
    fn default() -> Self {
        let factors = CalibrationFactors::default();
        Self {
            fresh: Arc::new(FlowMeter::unchecked(FlowRole::Fresh, factors.fresh)),
            feed: Arc::new(FlowMeter::unchecked(FlowRole::Feed, factors.feed)),
            drain: Arc::new(FlowMeter::unchecked(FlowRole::Drain, factors.drain)),
        }
    }
}

impl FlowMeters {
    pub fn new(factors: &CalibrationFactors) -> Result<Self, FlowError> {
        Ok(Self {
            fresh: Arc::new(FlowMeter::new(FlowRole::Fresh, factors.fresh)?),
            feed: Arc::new(FlowMeter::new(FlowRole::Feed, factors.feed)?),
            drain: Arc::new(FlowMeter::new(FlowRole::Drain, factors.drain)?),
        })
    }

    pub fn get(&self, role: FlowRole) -> &Arc<FlowMeter> {
        match role {
            FlowRole::Fresh => &self.fresh,
            FlowRole::Feed => &self.feed,
            FlowRole::Drain => &self.drain,
        }
    }

    /// Pushes new calibration factors into all three meters.
    ///
    /// Validates all three before touching any.
    pub fn apply_calibration(&self, factors: &CalibrationFactors) -> Result<(), FlowError> {
        check_factor(factors.fresh)?;
        check_factor(factors.feed)?;
        check_factor(factors.drain)?;
        self.fresh.set_calibration_factor(factors.fresh)?;
        self.feed.set_calibration_factor(factors.feed)?;
        self.drain.set_calibration_factor(factors.drain)
    }

    /// Resets all meters and returns the totals they held.
    pub fn reset_all(&self) -> FlowTotals {
        FlowTotals {
            fresh: Some(self.fresh.reset()),
            feed: Some(self.feed.reset()),
            drain: Some(self.drain.reset()),
        }
    }

    pub fn totals(&self) -> FlowTotals {
        FlowTotals {
            fresh: self.fresh.total_volume(),
            feed: self.feed.total_volume(),
            drain: self.drain.total_volume(),
        }
    }
}

// ============================================================================
// Pulse sampling
// ============================================================================

/// Something that can count pulses over a window. Blocking.
pub trait PulseSource: Send + 'static {
    fn count_pulses(&mut self, window: Duration) -> Result<u32, HwError>;
}

/// Counts rising edges by polling a digital input.
pub struct EdgeCounter<I> {
    input: I,
    poll: Duration,
}

impl<I: DigitalInput> EdgeCounter<I> {
    pub fn new(input: I) -> Self {
        Self {
            input,
            poll: EDGE_POLL,
        }
    }
}

impl EdgeCounter<Box<dyn DigitalInput>> {
    /// Claims `pin` as a pulled-up input and wraps it.
    pub fn open(pin: u32) -> Result<Self, HwError> {
        Ok(Self::new(open_input(pin)?))
    }
}

impl<I: DigitalInput + 'static> PulseSource for EdgeCounter<I> {
    fn count_pulses(&mut self, window: Duration) -> Result<u32, HwError> {
        let started = Instant::now();
        let mut last = self.input.read()?;
        let mut pulses = 0u32;
        while started.elapsed() < window {
            let level = self.input.read()?;
            if level && !last {
                pulses = pulses.saturating_add(1);
            }
            last = level;
            std::thread::sleep(self.poll);
        }
        Ok(pulses)
    }
}

/// Runs `source` into `meter` until `cancel` fires.
pub fn spawn_sampler<S: PulseSource>(
    meter: Arc<FlowMeter>,
    source: S,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let role = meter.role().as_str();
        info!(meter = role, "Flow sampler starting");
        let mut source = Some(source);

        loop {
            let Some(mut current) = source.take() else {
                break;
            };
            let window = tokio::task::spawn_blocking(move || {
                let result = current.count_pulses(SAMPLE_WINDOW);
                (current, result)
            });

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                joined = window => joined,
            };

            match joined {
                Ok((returned, Ok(pulses))) => {
                    source = Some(returned);
                    meter.ingest(pulses);
                }
                Ok((returned, Err(e))) => {
                    source = Some(returned);
                    warn!(meter = role, error = %e, "Flow read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    error!(meter = role, error = %e, "Flow sampling thread died");
                    break;
                }
            }
        }

        info!(meter = role, "Flow sampler stopped");
    })
}

/// Opens a meter's pin and starts its sampler.
///
/// A setup failure is logged and leaves the meter without a sampler.
pub fn start_pin_sampler(
    meter: Arc<FlowMeter>,
    pin: u32,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    match EdgeCounter::open(pin) {
        Ok(counter) => Some(spawn_sampler(meter, counter, cancel)),
        Err(e) => {
            error!(meter = meter.role().as_str(), pin, error = %e, "Flow meter unavailable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn meter(factor: f64) -> FlowMeter {
        FlowMeter::new(FlowRole::Drain, factor).unwrap()
    }

    #[test]
    fn test_no_reading_before_first_window() {
        let m = meter(28.390575);
        assert_eq!(m.latest_rate(), None);
        assert_eq!(m.total_volume(), None);
    }

    #[test]
    fn test_ingest_computes_rate_and_volume() {
        let m = meter(2.0);
        assert!((m.ingest(120) - 60.0).abs() < 1e-9);
        assert_eq!(m.latest_rate(), Some(60.0));
        assert!((m.total_volume().unwrap() - 1.0).abs() < 1e-9);

        m.ingest(0);
        assert_eq!(m.latest_rate(), Some(0.0));
        assert!((m.total_volume().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_volume_is_monotonic_between_resets() {
        let m = meter(28.390575);
        let mut previous = 0.0;
        for pulses in [0, 5, 80, 0, 300, 1, 0, 42] {
            m.ingest(pulses);
            let volume = m.total_volume().unwrap();
            assert!(volume >= previous, "{volume} < {previous}");
            previous = volume;
        }
    }

    #[test]
    fn test_reset_zeroes_volume_keeps_factor() {
        let m = meter(3.0);
        m.ingest(180);
        let previous = m.reset();
        assert!((previous - 1.0).abs() < 1e-9);
        assert_eq!(m.total_volume(), Some(0.0));
        assert!((m.calibration_factor() - 3.0).abs() < f64::EPSILON);
        assert_eq!(m.latest_rate(), Some(60.0));
    }

    #[test]
    fn test_rejects_bad_calibration() {
        let m = meter(3.0);
        assert_eq!(
            m.set_calibration_factor(0.0),
            Err(FlowError::InvalidCalibration(0.0))
        );
        assert!(m.set_calibration_factor(-1.0).is_err());
        assert!(m.set_calibration_factor(f64::NAN).is_err());
        assert!((m.calibration_factor() - 3.0).abs() < f64::EPSILON);
        assert!(FlowMeter::new(FlowRole::Feed, 0.0).is_err());
    }

    #[test]
    fn test_bundle_reset_and_totals() {
        let meters = FlowMeters::new(&CalibrationFactors {
            fresh: 1.0,
            feed: 1.0,
            drain: 1.0,
        })
        .unwrap();
        meters.feed.ingest(60);
        let totals = meters.totals();
        assert_eq!(totals.fresh, None);
        assert_eq!(totals.feed, Some(1.0));

        let before = meters.reset_all();
        assert_eq!(before.feed, Some(1.0));
        assert_eq!(meters.totals().drain, Some(0.0));
    }

    #[test]
    fn test_apply_calibration_is_all_or_nothing() {
        let meters = FlowMeters::new(&CalibrationFactors::default()).unwrap();
        let bad = CalibrationFactors {
            fresh: 5.0,
            feed: 5.0,
            drain: 0.0,
        };
        assert!(meters.apply_calibration(&bad).is_err());
        assert!((meters.fresh.calibration_factor() - 5.0).abs() > 1.0);
    }

    struct Scripted(std::sync::Mutex<VecDeque<bool>>);

    impl DigitalInput for Scripted {
        fn read(&self) -> Result<bool, HwError> {
            let mut levels = self.0.lock().unwrap();
            Ok(levels.pop_front().unwrap_or(false))
        }
    }

    #[test]
    fn test_edge_counter_counts_rising_edges() {
        let levels = [false, true, true, false, true, false, false, true];
        let mut counter = EdgeCounter {
            input: Scripted(std::sync::Mutex::new(levels.into_iter().collect())),
            poll: Duration::from_micros(10),
        };
        let pulses = counter.count_pulses(Duration::from_millis(50)).unwrap();
        assert_eq!(pulses, 3);
    }

    struct Counts {
        script: VecDeque<Result<u32, ()>>,
    }

    impl PulseSource for Counts {
        fn count_pulses(&mut self, _window: Duration) -> Result<u32, HwError> {
            std::thread::sleep(Duration::from_millis(1));
            match self.script.pop_front() {
                Some(Ok(n)) => Ok(n),
                Some(Err(())) => Err(HwError::Setup {
                    pin: 24,
                    reason: "line busy".to_string(),
                }),
                None => Ok(0),
            }
        }
    }

    #[tokio::test]
    async fn test_sampler_survives_read_errors() {
        let meter = Arc::new(FlowMeter::new(FlowRole::Drain, 1.0).unwrap());
        let cancel = CancellationToken::new();
        let source = Counts {
            script: [Ok(60), Err(()), Ok(120)].into_iter().collect(),
        };
        let handle = spawn_sampler(Arc::clone(&meter), source, cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while meter.total_volume().unwrap_or(0.0) < 3.0 - 1e-9 {
            assert!(tokio::time::Instant::now() < deadline, "sampler stalled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
        assert!((meter.total_volume().unwrap() - 3.0).abs() < 1e-9);
    }
}
