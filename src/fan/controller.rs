//! Tachometer measurement and spin-up control loop

use std::{
    mem,
    num::NonZeroU32,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{FanModel, FanSettings, ModelError, Percentage, PwmDriver, Rpm, duty};

/// Tachometer pulses per fan revolution.
/// See "4-Wire Pulse Width Modulation (PWM) Controlled Fans", Intel Corporation, revision 1.3
pub(crate) const PULSES_PER_REVOLUTION: u64 = 2;

/// Milliseconds in a minute
const MS_PER_MINUTE: u64 = 60_000;

/// Set point before any explicit request
const DEFAULT_PWM: Percentage = 100;

/// Microsecond timestamp, wrapping around at `u32::MAX`
pub(crate) type Micros = u32;

/// Update error
#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub(crate) enum UpdateError {
    /// No time elapsed since previous update, speed can not be computed
    #[error("Measurement period is empty")]
    ZeroDuration,
}

/// Pulses counted during the current measurement period
#[derive(Debug, Default)]
struct PulseWindow {
    /// Accepted pulse count
    count: u32,
    /// Timestamp of the last rejected pulse
    last: Micros,
    /// Debounce time constant
    tau: Micros,
}

impl PulseWindow {
    /// Count a pulse unless it is too close to the last rejected one
    fn record(&mut self, now: Micros) {
        if now.wrapping_sub(self.last) >= self.tau {
            self.count = self.count.wrapping_add(1);
        } else {
            self.last = now;
        }
    }

    /// Start a new measurement period, and return pulses counted in the previous one
    fn drain(&mut self) -> u32 {
        self.last = 0;
        mem::take(&mut self.count)
    }
}

/// Convert a duration into the pulse timestamp domain
fn to_micros(dur: Duration) -> Micros {
    Micros::try_from(dur.as_micros()).unwrap_or(Micros::MAX)
}

/// Handle held by a pulse source to notify a controller
#[derive(Clone, Debug)]
pub(crate) struct PulseHandle(Arc<Mutex<PulseWindow>>);

impl PulseHandle {
    /// Create handle for a new empty window
    fn new(tau: Duration) -> Self {
        Self(Arc::new(Mutex::new(PulseWindow {
            tau: to_micros(tau),
            ..PulseWindow::default()
        })))
    }

    /// Enter critical section
    fn lock(&self) -> MutexGuard<'_, PulseWindow> {
        // The window only holds integers, it is always consistent
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Notify a tachometer pulse at `now`
    pub(crate) fn on_pulse(&self, now: Micros) {
        self.lock().record(now);
    }
}

/// Compute speed from pulses counted over a period
fn rpm(pulses: u32, elapsed_ms: NonZeroU32) -> Rpm {
    let rpm =
        u64::from(pulses) * MS_PER_MINUTE / (PULSES_PER_REVOLUTION * u64::from(elapsed_ms.get()));
    Rpm::try_from(rpm).unwrap_or(Rpm::MAX)
}

/// Four-wire fan driver
pub(crate) struct FanController<D> {
    /// Connection settings
    settings: FanSettings,
    /// Active fan model
    model: FanModel,
    /// PWM output
    driver: D,
    /// State shared with the pulse source
    pulses: PulseHandle,
    /// Duty cycle set point
    pwm: Percentage,
    /// Last measured speed
    rpm: Rpm,
    /// Remaining spin-up time in ms, spin-up is active when positive
    spinup_remaining: i64,
}

impl<D: PwmDriver> FanController<D> {
    /// Build a new controller
    pub(crate) fn new(
        settings: FanSettings,
        model: FanModel,
        driver: D,
    ) -> Result<Self, ModelError> {
        model.check()?;
        let pulses = PulseHandle::new(settings.tau());
        let pwm = model.clamp_pwm(DEFAULT_PWM);
        Ok(Self {
            settings,
            model,
            driver,
            pulses,
            pwm,
            rpm: 0,
            spinup_remaining: 0,
        })
    }

    /// Get a handle for a pulse source to notify this controller
    pub(crate) fn pulse_handle(&self) -> PulseHandle {
        self.pulses.clone()
    }

    /// Notify a tachometer pulse at `now`
    #[cfg_attr(not(test), expect(dead_code))]
    pub(crate) fn on_pulse(&self, now: Micros) {
        self.pulses.on_pulse(now);
    }

    /// Pulses counted since last update
    pub(crate) fn pending_pulses(&self) -> u32 {
        self.pulses.lock().count
    }

    /// Clear measurements, for example after the tachometer was reconnected
    pub(crate) fn reset(&mut self) {
        self.pulses.lock().drain();
        self.spinup_remaining = 0;
        self.rpm = 0;
    }

    /// Measure speed from pulses counted during the last `elapsed_ms`, handle stalls, and apply
    /// output duty cycle
    pub(crate) fn update(&mut self, elapsed_ms: u32) -> Result<(), UpdateError> {
        let elapsed_ms = NonZeroU32::new(elapsed_ms).ok_or(UpdateError::ZeroDuration)?;

        let pulses = self.pulses.lock().drain();
        self.rpm = rpm(pulses, elapsed_ms);
        log::trace!(
            "Fan {}: {pulses} pulses in {elapsed_ms}ms, {} rpm",
            self.driver,
            self.rpm
        );

        // Spindown detection
        let was_blocked = self.is_blocked();
        if !was_blocked && (self.rpm <= self.model.min_rpm) && (self.pwm >= self.model.min_pwm) {
            self.spinup_remaining =
                i64::try_from(self.model.spinup.as_millis()).unwrap_or(i64::MAX);
            if self.is_blocked() {
                log::info!(
                    "Fan {} stalled at {} rpm, spinning up for {}",
                    self.driver,
                    self.rpm,
                    humantime::format_duration(self.model.spinup)
                );
            }
        }

        // Spin-up
        let target = if self.is_blocked() && (self.rpm < self.model.min_rpm) {
            self.spinup_remaining = self
                .spinup_remaining
                .saturating_sub(i64::from(elapsed_ms.get()));
            if !self.is_blocked() {
                log::warn!(
                    "Fan {} spin-up time elapsed, still at {} rpm",
                    self.driver,
                    self.rpm
                );
            }
            self.model.max_pwm
        } else {
            if self.is_blocked() {
                log::info!("Fan {} started at {} rpm", self.driver, self.rpm);
                self.spinup_remaining = 0;
            }
            self.pwm
        };

        self.apply(target);
        Ok(())
    }

    /// Write duty cycle to output
    fn apply(&mut self, pwm: Percentage) {
        let val = duty(pwm, self.driver.max_duty());
        log::trace!("Fan {} output set to {pwm}% ({val})", self.driver);
        if let Err(err) = self.driver.apply(val) {
            log::warn!("Failed to set fan {} output to {val}: {err:#}", self.driver);
        }
    }

    /// Last measured speed
    pub(crate) fn rpm(&self) -> Rpm {
        self.rpm
    }

    /// Duty cycle set point
    pub(crate) fn pwm(&self) -> Percentage {
        self.pwm
    }

    /// Update duty cycle set point, clamped to the model bounds
    pub(crate) fn set_pwm(&mut self, pwm: Percentage) -> &mut Self {
        self.pwm = self.model.clamp_pwm(pwm);
        if self.pwm != pwm {
            log::debug!(
                "Fan {} set point {pwm}% clamped to {}%",
                self.driver,
                self.pwm
            );
        }
        self
    }

    /// Update duty cycle set point from a target speed, using the model reference curve
    pub(crate) fn set_rpm(&mut self, rpm: Rpm) -> &mut Self {
        let pwm = self.model.lookup(rpm);
        log::debug!("Fan {} target {rpm} rpm needs {pwm}%", self.driver);
        self.set_pwm(pwm)
    }

    /// Is spin-up overriding the set point?
    pub(crate) fn is_blocked(&self) -> bool {
        self.spinup_remaining > 0
    }

    /// Active fan model
    pub(crate) fn model(&self) -> &FanModel {
        &self.model
    }

    /// Replace fan model, if it is valid, otherwise keep the current one
    #[cfg_attr(not(test), expect(dead_code))]
    pub(crate) fn set_model(&mut self, model: FanModel) -> &mut Self {
        if let Err(err) = self.try_set_model(model) {
            log::warn!("Fan {} model unchanged: {err}", self.driver);
        }
        self
    }

    /// Replace fan model, or fail if it is invalid
    pub(crate) fn try_set_model(&mut self, model: FanModel) -> Result<&mut Self, ModelError> {
        model.check()?;
        log::info!("Fan {} model set to {model}", self.driver);
        self.model = model;
        self.pwm = self.model.clamp_pwm(self.pwm);
        Ok(self)
    }

    /// Connection settings
    pub(crate) fn settings(&self) -> &FanSettings {
        &self.settings
    }

    /// Debounce time constant
    pub(crate) fn debounce_time(&self) -> Duration {
        self.settings.tau()
    }

    /// Update debounce time constant
    #[cfg_attr(not(test), expect(dead_code))]
    pub(crate) fn set_debounce_time(&mut self, tau: Duration) -> &mut Self {
        self.settings.set_tau(tau);
        self.pulses.lock().tau = to_micros(tau);
        self
    }

    /// PWM output
    pub(crate) fn driver(&self) -> &D {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::tests::RecordingPwm;

    /// Controller with the model from the spin-up scenario
    fn controller() -> FanController<RecordingPwm> {
        FanController::new(
            FanSettings::default(),
            FanModel::new(20, 100, 400, 2000, Duration::from_secs(6)),
            RecordingPwm::new(),
        )
        .unwrap()
    }

    /// Feed `count` pulses evenly spaced by `period` microseconds
    fn feed(ctrl: &FanController<RecordingPwm>, count: u32, period: Micros) {
        for i in 1..=count {
            ctrl.on_pulse(i * period);
        }
    }

    #[test]
    fn compute_rpm() {
        let ms = |v| NonZeroU32::new(v).unwrap();
        assert_eq!(rpm(0, ms(1000)), 0);
        assert_eq!(rpm(10, ms(1000)), 300);
        assert_eq!(rpm(66, ms(1000)), 1980);
        assert_eq!(rpm(7, ms(333)), 630);
        assert_eq!(rpm(1, ms(u32::MAX)), 0);
        assert_eq!(rpm(u32::MAX, ms(1)), Rpm::MAX);
        assert_eq!(rpm(u32::MAX, ms(60_000)), 2_147_483_647);
    }

    #[test]
    fn update_computes_rpm() {
        let mut ctrl = controller();
        feed(&ctrl, 40, 20_000);
        assert_eq!(ctrl.pending_pulses(), 40);
        ctrl.update(1000).unwrap();
        assert_eq!(ctrl.rpm(), 1200);
        assert_eq!(ctrl.pending_pulses(), 0);

        feed(&ctrl, 7, 20_000);
        ctrl.update(333).unwrap();
        assert_eq!(ctrl.rpm(), 630);
    }

    #[test]
    fn update_zero_duration() {
        let mut ctrl = controller();
        feed(&ctrl, 40, 20_000);
        assert_eq!(ctrl.update(0), Err(UpdateError::ZeroDuration));
        assert_eq!(ctrl.pending_pulses(), 40);
        assert_eq!(ctrl.rpm(), 0);
        assert!(!ctrl.is_blocked());
        assert!(ctrl.driver().applied.is_empty());
    }

    #[test]
    fn set_pwm_clamps() {
        let mut ctrl = FanController::new(
            FanSettings::default(),
            FanModel::new(20, 80, 400, 2000, Duration::ZERO),
            RecordingPwm::new(),
        )
        .unwrap();
        assert_eq!(ctrl.pwm(), 80);
        for (req, expected) in [
            (0, 20),
            (19, 20),
            (20, 20),
            (55, 55),
            (80, 80),
            (81, 80),
            (255, 80),
        ] {
            assert_eq!(ctrl.set_pwm(req).pwm(), expected);
        }
    }

    #[test]
    fn debounce() {
        let ctrl = controller();

        ctrl.on_pulse(3_000);
        assert_eq!(ctrl.pending_pulses(), 0);
        assert_eq!(last_of(&ctrl), 3_000);

        ctrl.on_pulse(8_000);
        assert_eq!(ctrl.pending_pulses(), 0);
        assert_eq!(last_of(&ctrl), 8_000);

        // 12ms after the first rejected pulse, but only 7ms after the baseline
        ctrl.on_pulse(15_000);
        assert_eq!(ctrl.pending_pulses(), 0);
        assert_eq!(last_of(&ctrl), 15_000);

        ctrl.on_pulse(25_000);
        assert_eq!(ctrl.pending_pulses(), 1);
        assert_eq!(last_of(&ctrl), 15_000);

        // accepted pulses do not move the baseline
        ctrl.on_pulse(25_500);
        assert_eq!(ctrl.pending_pulses(), 2);
        assert_eq!(last_of(&ctrl), 15_000);
    }

    #[test]
    fn debounce_wraps() {
        let ctrl = controller();
        ctrl.pulses.lock().last = u32::MAX - 1_000;

        ctrl.on_pulse(2_000);
        assert_eq!(ctrl.pending_pulses(), 0);
        assert_eq!(last_of(&ctrl), 2_000);

        ctrl.pulses.lock().last = u32::MAX - 1_000;
        ctrl.on_pulse(9_500);
        assert_eq!(ctrl.pending_pulses(), 1);
    }

    /// Debounce baseline
    fn last_of(ctrl: &FanController<RecordingPwm>) -> Micros {
        ctrl.pulses.lock().last
    }

    #[test]
    fn update_resets_debounce_baseline() {
        let mut ctrl = controller();
        ctrl.on_pulse(5_000);
        assert_eq!(last_of(&ctrl), 5_000);
        ctrl.update(1000).unwrap();
        assert_eq!(last_of(&ctrl), 0);
    }

    #[test]
    fn set_debounce_time() {
        let mut ctrl = controller();
        assert_eq!(ctrl.debounce_time(), Duration::from_millis(10));
        ctrl.on_pulse(5_000);
        assert_eq!(ctrl.pending_pulses(), 0);

        ctrl.set_debounce_time(Duration::from_millis(1));
        assert_eq!(ctrl.settings().tau(), Duration::from_millis(1));
        ctrl.on_pulse(6_000);
        assert_eq!(ctrl.pending_pulses(), 1);
    }

    #[test]
    fn spinup_scenario() {
        let mut ctrl = controller();
        assert_eq!(ctrl.pwm(), 100);
        feed(&ctrl, 10, 50_000);
        ctrl.update(1000).unwrap();

        assert_eq!(ctrl.rpm(), 300);
        assert!(ctrl.is_blocked());
        assert_eq!(ctrl.pwm(), 100);
        assert_eq!(ctrl.driver().applied, vec![255]);
    }

    #[test]
    fn spinup_keeps_set_point() {
        let mut ctrl = controller();
        ctrl.set_pwm(50);
        feed(&ctrl, 10, 50_000);
        ctrl.update(1000).unwrap();

        assert_eq!(ctrl.rpm(), 300);
        assert!(ctrl.is_blocked());
        assert_eq!(ctrl.pwm(), 50);
        assert_eq!(ctrl.driver().last(), Some(255));
    }

    #[test]
    fn spinup_exhausts() {
        let mut ctrl = controller();
        for _ in 0..5 {
            ctrl.update(1000).unwrap();
            assert!(ctrl.is_blocked());
        }
        ctrl.update(1000).unwrap();
        assert!(!ctrl.is_blocked());
        assert_eq!(ctrl.driver().applied, vec![255; 6]);
        assert_eq!(ctrl.pwm(), 100);

        // fan still stalled, try again
        ctrl.update(1000).unwrap();
        assert!(ctrl.is_blocked());
    }

    #[test]
    fn spinup_countdown_goes_negative() {
        let mut ctrl = controller();
        ctrl.set_pwm(30);
        ctrl.update(4000).unwrap();
        assert!(ctrl.is_blocked());
        ctrl.update(4000).unwrap();
        assert!(!ctrl.is_blocked());
        assert_eq!(ctrl.spinup_remaining, -2000);
        assert_eq!(ctrl.driver().applied, vec![255, 255]);
    }

    #[test]
    fn spinup_ends_when_fan_moves() {
        let mut ctrl = controller();
        ctrl.set_pwm(50);
        ctrl.update(1000).unwrap();
        assert!(ctrl.is_blocked());

        // 900 rpm
        feed(&ctrl, 30, 20_000);
        ctrl.update(1000).unwrap();
        assert_eq!(ctrl.rpm(), 900);
        assert!(!ctrl.is_blocked());
        assert_eq!(ctrl.driver().applied, vec![255, 127]);
    }

    #[test]
    fn spinup_disabled() {
        let mut ctrl = FanController::new(
            FanSettings::default(),
            FanModel::default(),
            RecordingPwm::new(),
        )
        .unwrap();
        ctrl.set_pwm(20);
        ctrl.update(1000).unwrap();
        assert!(!ctrl.is_blocked());
        assert_eq!(ctrl.driver().last(), Some(51));
    }

    #[test]
    fn spinup_at_min_rpm() {
        let mut ctrl = controller();
        ctrl.set_pwm(20);
        // 400 rpm
        feed(&ctrl, 40, 20_000);
        ctrl.update(3000).unwrap();
        assert_eq!(ctrl.rpm(), 400);
        assert!(!ctrl.is_blocked());
        assert_eq!(ctrl.driver().last(), Some(51));
    }

    #[test]
    fn driver_failure_is_not_propagated() {
        let mut ctrl = controller();
        ctrl.driver.broken = true;
        feed(&ctrl, 40, 20_000);
        ctrl.update(1000).unwrap();
        assert_eq!(ctrl.rpm(), 1200);
        assert!(ctrl.driver().applied.is_empty());
    }

    #[test]
    fn driver_resolution() {
        let mut ctrl = FanController::new(
            FanSettings::default(),
            FanModel::default(),
            RecordingPwm::with_max(1000),
        )
        .unwrap();
        ctrl.set_pwm(42);
        feed(&ctrl, 40, 20_000);
        ctrl.update(1000).unwrap();
        assert_eq!(ctrl.driver().last(), Some(420));
    }

    #[test]
    fn set_model() {
        let mut ctrl = controller();
        let model = ctrl.model().clone();

        ctrl.set_model(FanModel::new(50, 40, 400, 2000, Duration::ZERO));
        assert_eq!(ctrl.model(), &model);
        assert_eq!(
            ctrl.try_set_model(FanModel::new(20, 100, 500, 500, Duration::ZERO))
                .err(),
            Some(ModelError::RpmRange { min: 500, max: 500 })
        );
        assert_eq!(ctrl.model(), &model);

        let new_model = FanModel::new(30, 70, 300, 1500, Duration::ZERO);
        ctrl.set_model(new_model.clone());
        assert_eq!(ctrl.model(), &new_model);
        assert_eq!(ctrl.pwm(), 70);
    }

    #[test]
    fn new_rejects_invalid_model() {
        assert!(
            FanController::new(
                FanSettings::default(),
                FanModel::new(50, 40, 400, 2000, Duration::ZERO),
                RecordingPwm::new(),
            )
            .is_err()
        );
    }

    #[test]
    fn set_rpm() {
        let mut ctrl = controller();
        ctrl.set_pwm(50).set_rpm(1000);
        assert_eq!(ctrl.pwm(), 100);

        let model = FanModel::new(10, 100, 220, 1820, Duration::ZERO)
            .with_ref_curve(vec![220, 450, 720, 930, 1110, 1290, 1440, 1580, 1700, 1820])
            .unwrap();
        ctrl.set_model(model).set_rpm(1000);
        assert_eq!(ctrl.pwm(), 50);
    }

    #[test]
    fn reset() {
        let mut ctrl = controller();
        ctrl.set_pwm(60);
        feed(&ctrl, 10, 50_000);
        ctrl.update(1000).unwrap();
        assert_eq!(ctrl.rpm(), 300);
        assert!(ctrl.is_blocked());

        ctrl.on_pulse(5);
        feed(&ctrl, 3, 20_000);
        assert_eq!(ctrl.pending_pulses(), 3);
        assert_eq!(last_of(&ctrl), 5);

        ctrl.reset();
        assert_eq!(ctrl.rpm(), 0);
        assert!(!ctrl.is_blocked());
        assert_eq!(ctrl.pending_pulses(), 0);
        assert_eq!(last_of(&ctrl), 0);
        assert_eq!(ctrl.pwm(), 60);
    }

    #[test]
    fn concurrent_pulses() {
        const THREADS: u32 = 4;
        const PULSES: u32 = 10_000;

        let mut ctrl = controller();
        ctrl.set_debounce_time(Duration::ZERO);
        let sources: Vec<_> = (0..THREADS)
            .map(|_| {
                let handle = ctrl.pulse_handle();
                thread::spawn(move || {
                    for i in 0..PULSES {
                        handle.on_pulse(i);
                    }
                })
            })
            .collect();

        // with a 30s period, speed is the pulse count
        let mut total = 0;
        while !sources.iter().all(thread::JoinHandle::is_finished) {
            ctrl.update(30_000).unwrap();
            total += ctrl.rpm();
        }
        for source in sources {
            source.join().unwrap();
        }
        ctrl.update(30_000).unwrap();
        total += ctrl.rpm();

        assert_eq!(total, THREADS * PULSES);
    }
}
