//! Fan model: safe operating envelope and speed calibration

use std::{fmt, time::Duration};

use super::{Percentage, Rpm};

/// Maximum number of speed reference points
pub(crate) const REF_CURVE_LEN: usize = 10;

/// Invalid fan model
#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub(crate) enum ModelError {
    /// PWM bounds are not ordered, or above 100%
    #[error("Invalid PWM range {min}-{max}%")]
    PwmRange {
        /// Minimum duty cycle
        min: Percentage,
        /// Maximum duty cycle
        max: Percentage,
    },
    /// RPM bounds are not ordered
    #[error("Invalid RPM range {min}-{max}")]
    RpmRange {
        /// Speed at minimum duty cycle
        min: Rpm,
        /// Speed at maximum duty cycle
        max: Rpm,
    },
    /// Too many reference points
    #[error("Reference curve has {0} points, at most {REF_CURVE_LEN} are supported")]
    CurveTooLong(usize),
    /// A reference point is slower than the previous one
    #[error("Reference curve decreases at point {0}")]
    CurveNotOrdered(usize),
}

/// Properties of a fan model, used to keep it in its safe operating range
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct FanModel {
    /// Minimum specified duty cycle
    pub min_pwm: Percentage,
    /// Maximum sensible duty cycle
    pub max_pwm: Percentage,
    /// Specified speed at `min_pwm`
    pub min_rpm: Rpm,
    /// Specified speed at `max_pwm`
    pub max_rpm: Rpm,
    /// Minimum full speed duration to start a stalled fan
    pub spinup: Duration,
    /// Speed reference points, evenly spaced over the duty cycle range
    ref_curve: Vec<Rpm>,
}

impl Default for FanModel {
    fn default() -> Self {
        Self::new(20, 100, 400, 2000, Duration::ZERO)
    }
}

impl fmt::Display for FanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}% {}-{}rpm",
            self.min_pwm, self.max_pwm, self.min_rpm, self.max_rpm
        )?;
        if !self.spinup.is_zero() {
            write!(f, " spinup {}", humantime::format_duration(self.spinup))?;
        }
        Ok(())
    }
}

impl FanModel {
    /// Build a model without reference curve
    pub(crate) fn new(
        min_pwm: Percentage,
        max_pwm: Percentage,
        min_rpm: Rpm,
        max_rpm: Rpm,
        spinup: Duration,
    ) -> Self {
        Self {
            min_pwm,
            max_pwm,
            min_rpm,
            max_rpm,
            spinup,
            ref_curve: Vec::new(),
        }
    }

    /// Set speed reference points.
    ///
    /// Point `i` of a `n` points curve is the speed measured at `(i + 1) * 100 / n` percent duty
    /// cycle, so a full curve has a point for each 10% step.
    pub(crate) fn with_ref_curve(mut self, points: Vec<Rpm>) -> Result<Self, ModelError> {
        if points.len() > REF_CURVE_LEN {
            return Err(ModelError::CurveTooLong(points.len()));
        }
        if let Some(i) = points
            .iter()
            .zip(points.iter().skip(1))
            .position(|(prev, cur)| cur < prev)
        {
            return Err(ModelError::CurveNotOrdered(i + 1));
        }
        self.ref_curve = points;
        Ok(self)
    }

    /// Speed reference points
    #[cfg_attr(not(test), expect(dead_code))]
    pub(crate) fn ref_curve(&self) -> &[Rpm] {
        &self.ref_curve
    }

    /// Check bounds
    pub(crate) fn check(&self) -> Result<(), ModelError> {
        if self.min_pwm >= self.max_pwm || self.max_pwm > 100 {
            return Err(ModelError::PwmRange {
                min: self.min_pwm,
                max: self.max_pwm,
            });
        }
        if self.min_rpm >= self.max_rpm {
            return Err(ModelError::RpmRange {
                min: self.min_rpm,
                max: self.max_rpm,
            });
        }
        Ok(())
    }

    /// Are bounds safe to operate the fan with?
    #[cfg_attr(not(test), expect(dead_code))]
    pub(crate) fn validate(&self) -> bool {
        self.check().is_ok()
    }

    /// Bring a duty cycle into `[min_pwm; max_pwm]`
    pub(crate) fn clamp_pwm(&self, pwm: Percentage) -> Percentage {
        pwm.min(self.max_pwm).max(self.min_pwm)
    }

    /// Duty cycle needed to reach a target speed.
    ///
    /// Picks the first reference point at or above the target, without interpolating between
    /// points. Without reference curve, or if the target is out of reach, this falls back to
    /// `max_pwm`.
    pub(crate) fn lookup(&self, target: Rpm) -> Percentage {
        let len = self.ref_curve.len();
        self.ref_curve
            .iter()
            .position(|rpm| *rpm >= target)
            .and_then(|i| Percentage::try_from((i + 1) * 100 / len).ok())
            .map_or(self.max_pwm, |pwm| self.clamp_pwm(pwm))
    }
}
