//! Drive a four-wire fan, measuring its speed from tachometer pulses

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use anyhow::Context as _;
use clap::Parser as _;
use exit::ExitHook;
use fan::{FanController, FanModel, FanSettings, PwmDriver};

mod cl;
mod exit;
mod fan;
mod pwm;
mod sim;
mod sysfs;
mod tach;

use crate::{
    fan::{CommandPwm, Edge},
    sim::{SimulatedFan, SimulatedTachometer},
    tach::GpioTachometer,
};

/// Interruptible sleep
fn sleep(dur: Duration, exit_rx: &mpsc::Receiver<()>) {
    let _ = exit_rx.recv_timeout(dur);
}

/// Next set point when sweeping through the model duty cycle range
fn sweep_step<D: PwmDriver>(ctrl: &FanController<D>) -> fan::Percentage {
    let model = ctrl.model();
    if ctrl.pwm() >= model.max_pwm {
        model.min_pwm
    } else {
        ctrl.pwm() + 1
    }
}

/// Build controller for a fan, and apply model and set point
fn setup_controller<D: PwmDriver>(
    driver: D,
    settings: FanSettings,
    control: &cl::ControlArgs,
) -> anyhow::Result<FanController<D>> {
    let model = control.model.to_model().context("Invalid fan model")?;
    let mut ctrl = FanController::new(settings, FanModel::default(), driver)?;
    ctrl.try_set_model(model)?;
    if let Some(rpm) = control.rpm {
        ctrl.set_rpm(rpm);
    } else {
        ctrl.set_pwm(control.speed);
    }
    Ok(ctrl)
}

/// Measure speed and drive fan at each interval, until exit is requested
fn control_loop<D: PwmDriver>(
    ctrl: &mut FanController<D>,
    control: &cl::ControlArgs,
    sweep: bool,
    exit_requested: &AtomicBool,
    exit_rx: &mpsc::Receiver<()>,
) {
    log::info!(
        "Fan {} set point: {}% (model {}, debounce {})",
        ctrl.driver(),
        ctrl.pwm(),
        ctrl.model(),
        humantime::format_duration(ctrl.debounce_time())
    );

    // Pulses counted while setting up are not part of the first window
    ctrl.reset();
    let interval: Duration = control.interval.into();
    let mut last_update = Instant::now();

    while !exit_requested.load(Ordering::SeqCst) {
        let to_wait = interval.saturating_sub(last_update.elapsed());
        log::trace!("Will sleep at most {to_wait:?}");
        sleep(to_wait, exit_rx);
        if exit_requested.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        let elapsed_ms =
            u32::try_from(now.duration_since(last_update).as_millis()).unwrap_or(u32::MAX);
        match ctrl.update(elapsed_ms) {
            Ok(()) => {
                last_update = now;
                log::info!(
                    "Fan {}: {} RPM, set point {}%{}",
                    ctrl.driver(),
                    ctrl.rpm(),
                    ctrl.pwm(),
                    if ctrl.is_blocked() {
                        " (spinning up)"
                    } else {
                        ""
                    }
                );
            }
            Err(err) => log::debug!(
                "Update skipped: {err}, {} pulses pending",
                ctrl.pending_pulses()
            ),
        }

        if sweep {
            let next = sweep_step(ctrl);
            ctrl.set_pwm(next);
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Parse cl args
    let args = cl::Args::parse();

    // Init logger
    simple_logger::init_with_level(args.verbosity).context("Failed to init logger")?;

    // Signal handling
    let exit_requested = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = mpsc::channel::<()>();
    {
        let exit_requested = Arc::clone(&exit_requested);
        ctrlc::set_handler(move || {
            exit_requested.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(());
        })
        .context("Failed to setup SIGINT handler")?;
    }

    match args.command {
        cl::Command::Run {
            pwm,
            fan_cmd,
            tach_gpio,
            edge,
            external_pull_up,
            control,
            restore_fan_settings,
        } => {
            let settings = FanSettings::new(edge, !external_pull_up, control.tau.into());

            // Registered before the fan is first driven, dropped last
            let _exit_hook = pwm
                .as_ref()
                .map(|p| {
                    pwm::Pwm::new(p)
                        .and_then(|output| ExitHook::new(output, restore_fan_settings))
                })
                .transpose()
                .context("Failed to setup PWM for exit hook")?;

            let driver: Box<dyn PwmDriver> = match (&pwm, &fan_cmd) {
                (Some(p), _) => Box::new(pwm::Pwm::new(p).context("Failed to setup PWM")?),
                (None, Some(c)) => Box::new(CommandPwm::new(c)),
                (None, None) => anyhow::bail!("No PWM output or fan command"),
            };
            let mut ctrl = setup_controller(driver, settings, &control)?;
            let _tach = GpioTachometer::spawn(&tach_gpio, ctrl.settings(), ctrl.pulse_handle())
                .with_context(|| format!("Failed to setup tachometer {tach_gpio:?}"))?;

            control_loop(&mut ctrl, &control, false, &exit_requested, &exit_rx);
        }
        cl::Command::Simulate {
            control,
            stall,
            sweep,
        } => {
            let settings = FanSettings::new(Edge::Falling, false, control.tau.into());

            let fan = SimulatedFan::new();
            let shaft = fan.shaft();
            let mut ctrl = setup_controller(fan, settings, &control)?;
            let _tach = SimulatedTachometer::spawn(
                shaft,
                ctrl.model().clone(),
                stall.into(),
                ctrl.pulse_handle(),
            )
            .context("Failed to setup simulated tachometer")?;

            control_loop(&mut ctrl, &control, sweep, &exit_requested, &exit_rx);
        }
    }

    log::info!("Exiting");
    Ok(())
}
