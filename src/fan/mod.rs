//! Four-wire fan control

mod cmd_fan;
mod controller;
mod model;
mod settings;

use std::fmt;

pub(crate) use cmd_fan::CommandPwm;
pub(crate) use controller::{FanController, Micros, PulseHandle};
pub(crate) use model::{FanModel, ModelError};
pub(crate) use settings::{Edge, FanSettings};

/// Duty cycle as a percentage
pub(crate) type Percentage = u8;

/// Fan speed in revolutions per minute
pub(crate) type Rpm = u32;

/// Duty cycle value in a PWM driver native domain
pub(crate) type Duty = u16;

/// PWM output a fan is connected to
pub(crate) trait PwmDriver: fmt::Display {
    /// Duty value matching a 100% duty cycle
    fn max_duty(&self) -> Duty;

    /// Set output duty value, in `[0; max_duty()]`
    fn apply(&mut self, duty: Duty) -> anyhow::Result<()>;
}

impl<D> PwmDriver for Box<D>
where
    D: PwmDriver + ?Sized,
{
    fn max_duty(&self) -> Duty {
        (**self).max_duty()
    }

    fn apply(&mut self, duty: Duty) -> anyhow::Result<()> {
        (**self).apply(duty)
    }
}

/// Scale a percentage into a driver domain where `max` is 100%
pub(crate) fn duty(percent: Percentage, max: Duty) -> Duty {
    let val = u32::from(percent.min(100)) * u32::from(max) / 100;
    Duty::try_from(val).unwrap_or(max)
}
