//! Command line interface

use std::{ffi::OsString, path::PathBuf};

use clap::{Parser, Subcommand};

use crate::fan::{Edge, FanModel, ModelError, Percentage, Rpm};

/// Parse percentage integer value
fn percentage(s: &str) -> Result<Percentage, String> {
    clap_num::number_range(s, 0, 100)
}

/// Fourwirefan command line arguments
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Args {
    /// Level of logging output (TRACE, DEBUG, INFO, WARN, ERROR).
    #[arg(short, default_value_t = log::Level::Info)]
    pub verbosity: log::Level,

    /// Main action
    #[command(subcommand)]
    pub command: Command,
}

/// Fan model characteristics
#[derive(clap::Args, Clone, Debug)]
pub(crate) struct ModelArgs {
    /// Minimum duty cycle percentage the fan is specified for.
    #[arg(long, default_value_t = 20, value_parser = percentage)]
    pub min_pwm: Percentage,

    /// Maximum duty cycle percentage to run the fan at.
    #[arg(long, default_value_t = 100, value_parser = percentage)]
    pub max_pwm: Percentage,

    /// Fan speed in RPM at minimum duty cycle. Slower speeds are considered a stall.
    #[arg(long, default_value_t = 400)]
    pub min_rpm: Rpm,

    /// Fan speed in RPM at maximum duty cycle.
    #[arg(long, default_value_t = 2000)]
    pub max_rpm: Rpm,

    /// Minimum time to run a stalled fan at full speed, ie. '6s'. '0s' disables spin-up.
    #[arg(long, default_value = "0s")]
    pub spinup: humantime::Duration,

    /// Fan speeds in RPM measured at evenly spaced duty cycles, used to convert a target speed
    /// into a duty cycle (ie. '220,450,720,930,1110,1290,1440,1580,1700,1820' for 10%, 20%, ...
    /// 100%).
    #[arg(long, value_delimiter = ',')]
    pub ref_curve: Vec<Rpm>,
}

impl ModelArgs {
    /// Build and check fan model
    pub(crate) fn to_model(&self) -> Result<FanModel, ModelError> {
        let model = FanModel::new(
            self.min_pwm,
            self.max_pwm,
            self.min_rpm,
            self.max_rpm,
            self.spinup.into(),
        )
        .with_ref_curve(self.ref_curve.clone())?;
        model.check()?;
        Ok(model)
    }
}

/// Control loop settings
#[derive(clap::Args, Clone, Debug)]
pub(crate) struct ControlArgs {
    /// Fan model
    #[command(flatten)]
    pub model: ModelArgs,

    /// Minimum time between two tachometer pulses, closer pulses are considered noise.
    #[arg(long, default_value = "10ms")]
    pub tau: humantime::Duration,

    /// Interval to measure fan speed and update its duty cycle, ie. '1s', '500ms'.
    #[arg(short, long, default_value = "1s")]
    pub interval: humantime::Duration,

    /// Duty cycle percentage to run the fan at. Clamped to the model range.
    #[arg(short, long, default_value_t = 100, value_parser = percentage)]
    pub speed: Percentage,

    /// Target fan speed in RPM, converted to a duty cycle with the model reference curve.
    /// Without reference curve, the fan runs at the model maximum duty cycle.
    #[arg(short, long, conflicts_with = "speed")]
    pub rpm: Option<Rpm>,
}

/// Main command
#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Drive a fan from a GPIO tachometer input
    Run {
        /// PWM filepath (ie. `/sys/class/hwmon/hwmonX/pwmY`).
        #[arg(short, long, required_unless_present = "fan_cmd", conflicts_with = "fan_cmd")]
        pwm: Option<PathBuf>,

        /// Command to set the fan duty cycle with, instead of a PWM filepath.
        /// It is called with the duty cycle in per mille as its only argument.
        #[arg(short, long)]
        fan_cmd: Option<OsString>,

        /// GPIO value filepath the fan tachometer is connected to
        /// (ie. `/sys/class/gpio/gpioN/value`).
        #[arg(short, long)]
        tach_gpio: PathBuf,

        /// Tachometer signal edge to count.
        #[arg(long, value_enum, default_value_t = Edge::Falling)]
        edge: Edge,

        /// The tachometer line has an external pull-up resistor.
        #[arg(long)]
        external_pull_up: bool,

        /// Control loop
        #[command(flatten)]
        control: ControlArgs,

        /// Restore fan settings on exit, otherwise the fan is run at full speed on exit.
        #[arg(long)]
        restore_fan_settings: bool,
    },

    /// Drive a simulated fan
    Simulate {
        /// Control loop
        #[command(flatten)]
        control: ControlArgs,

        /// Time the simulated fan stays stuck at startup, ie. '10s'.
        #[arg(long, default_value = "0s")]
        stall: humantime::Duration,

        /// Increase duty cycle by 1% after each update, rolling over to the minimum.
        #[arg(long)]
        sweep: bool,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn verify() {
        Args::command().debug_assert();
    }

    #[test]
    fn parse_run() {
        let args = Args::try_parse_from([
            "fourwirefan",
            "run",
            "-p",
            "/sys/class/hwmon/hwmon2/pwm1",
            "-t",
            "/sys/class/gpio/gpio17/value",
            "--edge",
            "rising",
            "--spinup",
            "6s",
            "-i",
            "500ms",
        ])
        .unwrap();
        let Command::Run {
            pwm,
            fan_cmd,
            edge,
            control,
            restore_fan_settings,
            ..
        } = args.command
        else {
            panic!("Unexpected command");
        };
        assert_eq!(pwm, Some(PathBuf::from("/sys/class/hwmon/hwmon2/pwm1")));
        assert_eq!(fan_cmd, None);
        assert_eq!(edge, Edge::Rising);
        assert!(!restore_fan_settings);
        assert_eq!(Duration::from(control.interval), Duration::from_millis(500));
        assert_eq!(Duration::from(control.tau), Duration::from_millis(10));
        assert_eq!(control.speed, 100);
        assert_eq!(
            control.model.to_model().unwrap(),
            FanModel::new(20, 100, 400, 2000, Duration::from_secs(6))
        );
    }

    #[test]
    fn run_needs_one_output() {
        assert!(
            Args::try_parse_from(["fourwirefan", "run", "-t", "/sys/class/gpio/gpio17/value"])
                .is_err()
        );
        assert!(
            Args::try_parse_from([
                "fourwirefan",
                "run",
                "-p",
                "/sys/class/hwmon/hwmon2/pwm1",
                "-f",
                "/usr/bin/fan_set",
                "-t",
                "/sys/class/gpio/gpio17/value"
            ])
            .is_err()
        );
        assert!(
            Args::try_parse_from([
                "fourwirefan",
                "run",
                "-f",
                "/usr/bin/fan_set",
                "-t",
                "/sys/class/gpio/gpio17/value"
            ])
            .is_ok()
        );
    }

    #[test]
    fn parse_simulate() {
        let args = Args::try_parse_from([
            "fourwirefan",
            "simulate",
            "--min-pwm",
            "10",
            "--min-rpm",
            "220",
            "--max-rpm",
            "1820",
            "--ref-curve",
            "220,450,720,930,1110,1290,1440,1580,1700,1820",
            "-r",
            "1000",
            "--sweep",
        ])
        .unwrap();
        let Command::Simulate {
            control,
            stall,
            sweep,
        } = args.command
        else {
            panic!("Unexpected command");
        };
        assert!(sweep);
        assert_eq!(Duration::from(stall), Duration::ZERO);
        assert_eq!(control.rpm, Some(1000));
        let model = control.model.to_model().unwrap();
        assert_eq!(model.ref_curve().len(), 10);
        assert_eq!(model.lookup(1000), 50);
    }

    #[test]
    fn invalid_model() {
        let args = Args::try_parse_from([
            "fourwirefan",
            "simulate",
            "--min-pwm",
            "50",
            "--max-pwm",
            "40",
        ])
        .unwrap();
        let Command::Simulate { control, .. } = args.command else {
            panic!("Unexpected command");
        };
        assert_eq!(
            control.model.to_model(),
            Err(ModelError::PwmRange { min: 50, max: 40 })
        );

        assert!(Args::try_parse_from(["fourwirefan", "simulate", "--max-pwm", "101"]).is_err());
        assert!(
            Args::try_parse_from(["fourwirefan", "simulate", "-s", "50", "-r", "1000"]).is_err()
        );
    }
}
