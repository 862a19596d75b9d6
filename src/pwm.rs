//! Hwmon sysfs PWM output

// See https://docs.kernel.org/hwmon/sysfs-interface.html

use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use backon::{BlockingRetryable as _, ExponentialBuilder};

use crate::{
    fan::{Duty, PwmDriver},
    sysfs::{attr_index, device_name, ensure_sysfs_file, read_value, write_value},
};

/// PWM sysfs value
pub(crate) type Value = u8;

/// Hwmon PWM output
pub(crate) struct Pwm {
    /// `pwmX` sysfs filepath
    val: PathBuf,
    /// `pwmX_enable` sysfs filepath, some drivers do not have one
    mode: Option<PathBuf>,
    /// Kernel device name
    device: String,
    /// Index among device outputs
    num: usize,
}

/// PWM control modes, `pwmX_enable` values
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ControlMode {
    /// No control, fan at full speed
    Off = 0,
    /// Value set from userspace
    Software = 1,
    /// Automatic control by the driver or firmware
    Hardware = 2,
}

/// Pwm state, saved to be restored on exit
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct State {
    /// PWM value
    pub value: Value,
    /// PWM control mode
    pub mode: Option<ControlMode>,
}

impl Pwm {
    /// Open a PWM output
    pub(crate) fn new(path: &Path) -> anyhow::Result<Self> {
        // At boot the driver may not have created the files yet
        let val = (|| ensure_sysfs_file(path))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(10))
                    .with_factor(1.5)
                    .with_max_delay(Duration::from_secs(1))
                    .with_max_times(16),
            )
            .sleep(thread::sleep)
            .when(|e| {
                e.downcast_ref::<io::Error>()
                    .is_some_and(|ioe| ioe.kind() == ErrorKind::NotFound)
            })
            .notify(|_e, d| log::warn!("{path:?} does not exist, retrying in {d:?}"))
            .call()?;

        let num = attr_index(&val)?;
        let mode = ensure_sysfs_file(&val.with_file_name(format!("pwm{num}_enable"))).ok();
        if mode.is_none() {
            log::debug!("{val:?} has no control mode");
        }
        let device = device_name(&val)?;
        Ok(Self {
            val,
            mode,
            device,
            num,
        })
    }

    /// Set PWM value
    pub(crate) fn set(&self, val: Value) -> anyhow::Result<()> {
        log::trace!("Set PWM {self} to {val}");
        write_value(&self.val, val)
    }

    /// Get PWM value
    pub(crate) fn get(&self) -> anyhow::Result<Value> {
        read_value(&self.val)
    }

    /// Get PWM control mode
    pub(crate) fn get_mode(&self) -> anyhow::Result<Option<ControlMode>> {
        self.mode
            .as_ref()
            .map(|p| {
                let v: u8 = read_value(p)?;
                ControlMode::from_repr(v).ok_or_else(|| anyhow::anyhow!("Unexpected mode: {v}"))
            })
            .transpose()
    }

    /// Set PWM control mode
    pub(crate) fn set_mode(&self, mode: ControlMode) -> anyhow::Result<()> {
        let path = self
            .mode
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("PWM {self} has no control mode"))?;
        write_value(path, mode as u8)
    }

    /// Get current state
    pub(crate) fn get_state(&self) -> anyhow::Result<State> {
        Ok(State {
            value: self.get()?,
            mode: self.get_mode()?,
        })
    }

    /// Set state
    pub(crate) fn set_state(&self, state: &State) -> anyhow::Result<()> {
        self.set(state.value)?;
        if let Some(mode) = state.mode {
            self.set_mode(mode)?;
        }
        Ok(())
    }
}

impl fmt::Display for Pwm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.num)
    }
}

impl PwmDriver for Pwm {
    fn max_duty(&self) -> Duty {
        Duty::from(Value::MAX)
    }

    fn apply(&mut self, duty: Duty) -> anyhow::Result<()> {
        if let Some(prev_mode) = self.get_mode()? {
            let new_mode = ControlMode::Software;
            if prev_mode != new_mode {
                self.set_mode(new_mode)?;
                log::info!("PWM {self} mode set from {prev_mode} to {new_mode}");
            }
        }
        self.set(Value::try_from(duty)?)
    }
}
