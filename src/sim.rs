//! Simulated four-wire fan, to run without hardware

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    fan::{Duty, FanModel, PulseHandle, PwmDriver, Rpm},
    tach::MicrosClock,
};

/// Simulated PWM resolution
const MAX_DUTY: Duty = 255;

/// Sleep while the simulated fan is stopped
const IDLE_PERIOD: Duration = Duration::from_millis(10);

/// PWM input of the simulated fan
pub(crate) struct SimulatedFan {
    /// Last applied duty value
    duty: Arc<AtomicU16>,
}

impl SimulatedFan {
    /// Create a stopped fan
    pub(crate) fn new() -> Self {
        Self {
            duty: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Duty value seen by the tachometer side
    pub(crate) fn shaft(&self) -> Arc<AtomicU16> {
        Arc::clone(&self.duty)
    }
}

impl fmt::Display for SimulatedFan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sim")
    }
}

impl PwmDriver for SimulatedFan {
    fn max_duty(&self) -> Duty {
        MAX_DUTY
    }

    fn apply(&mut self, duty: Duty) -> anyhow::Result<()> {
        anyhow::ensure!(duty <= MAX_DUTY, "Duty {duty} out of range");
        self.duty.store(duty, Ordering::Relaxed);
        Ok(())
    }
}

/// Speed of a fan following its model linearly between its bounds, stopped below `min_pwm`
fn speed_at(model: &FanModel, duty: Duty) -> Rpm {
    let prct = u64::from(duty) * 100 / u64::from(MAX_DUTY);
    let (min_pwm, max_pwm) = (u64::from(model.min_pwm), u64::from(model.max_pwm));
    if prct < min_pwm || max_pwm <= min_pwm {
        return 0;
    }
    let prct = prct.min(max_pwm);
    let span = u64::from(model.max_rpm.saturating_sub(model.min_rpm));
    let rpm = u64::from(model.min_rpm) + span * (prct - min_pwm) / (max_pwm - min_pwm);
    Rpm::try_from(rpm).unwrap_or(Rpm::MAX)
}

/// Time between two tachometer pulses at a given speed
fn pulse_period(rpm: Rpm) -> Option<Duration> {
    (rpm > 0).then(|| Duration::from_secs(60) / rpm.saturating_mul(2))
}

/// Tachometer output of the simulated fan
pub(crate) struct SimulatedTachometer {
    /// Exit request for the thread
    stop: Arc<AtomicBool>,
    /// Pulse generator thread
    thread: Option<thread::JoinHandle<()>>,
}

impl SimulatedTachometer {
    /// Start emitting pulses for the fan turning at the speed its duty implies, after being
    /// stuck for `stall`
    pub(crate) fn spawn(
        shaft: Arc<AtomicU16>,
        model: FanModel,
        stall: Duration,
        pulses: PulseHandle,
    ) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("sim-tachometer".to_owned())
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    let clock = MicrosClock::new();
                    let start = Instant::now();
                    let mut stalled = !stall.is_zero();
                    while !stop.load(Ordering::Relaxed) {
                        if stalled && start.elapsed() >= stall {
                            log::info!("Simulated fan is free to move");
                            stalled = false;
                        }
                        let rpm = if stalled {
                            0
                        } else {
                            speed_at(&model, shaft.load(Ordering::Relaxed))
                        };
                        match pulse_period(rpm) {
                            Some(period) => {
                                thread::sleep(period);
                                pulses.on_pulse(clock.micros());
                            }
                            None => thread::sleep(IDLE_PERIOD),
                        }
                    }
                }
            })?;
        if !stall.is_zero() {
            log::info!(
                "Simulated fan stuck for {}",
                humantime::format_duration(stall)
            );
        }
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for SimulatedTachometer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.thread.take().is_some_and(|t| t.join().is_err()) {
            log::error!("Simulated tachometer thread panicked");
        }
    }
}
