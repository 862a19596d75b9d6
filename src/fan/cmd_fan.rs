//! External command PWM output

use std::{
    ffi::{OsStr, OsString},
    fmt,
    process::{Command, ExitStatus, Stdio},
};

use anyhow::Context as _;

use super::{Duty, PwmDriver};

/// Output resolution passed to the command
const MAX_DUTY: Duty = 1000;

/// PWM output set by running an external command with the duty value, in per mille, as argument
pub(crate) struct CommandPwm {
    /// Command path
    cmd: OsString,
    /// Last value successfully set
    last: Option<Duty>,
}

impl CommandPwm {
    /// Build a new command output
    pub(crate) fn new(cmd: &OsStr) -> Self {
        Self {
            cmd: cmd.to_owned(),
            last: None,
        }
    }

    /// Run command once and wait for its exit status
    fn run(&self, duty: Duty) -> anyhow::Result<ExitStatus> {
        Command::new(&self.cmd)
            .arg(duty.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to run fan command {self}"))
    }
}

impl fmt::Display for CommandPwm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cmd.to_string_lossy())
    }
}

impl PwmDriver for CommandPwm {
    fn max_duty(&self) -> Duty {
        MAX_DUTY
    }

    fn apply(&mut self, duty: Duty) -> anyhow::Result<()> {
        // Called on every update, only spawn on change
        if self.last == Some(duty) {
            return Ok(());
        }
        log::debug!("Running {} {duty}", self.cmd.display());
        let status = self.run(duty)?;
        anyhow::ensure!(status.success(), "Fan command {self} exited with {status}");
        self.last = Some(duty);
        Ok(())
    }
}
