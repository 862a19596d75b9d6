//! Exit hook to leave the fan in a safe state

use crate::pwm::{self, ControlMode, Pwm};

/// Set PWM state when dropped
pub(crate) struct ExitHook {
    /// Output to set
    pwm: Pwm,
    /// State to set on exit
    state: pwm::State,
}

impl ExitHook {
    /// Build hook to restore current state on drop, or run the fan at full speed
    pub(crate) fn new(pwm: Pwm, restore: bool) -> anyhow::Result<Self> {
        let state = if restore {
            pwm.get_state()?
        } else {
            pwm::State {
                value: pwm::Value::MAX,
                mode: pwm.get_mode()?.map(|_| ControlMode::Software),
            }
        };
        log::debug!("PWM {pwm} will be set to {state:?} on exit");
        Ok(Self { pwm, state })
    }
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        if let Err(err) = self.pwm.set_state(&self.state) {
            log::error!("Failed to set PWM {} exit state: {err:#}", self.pwm);
        }
    }
}
