//! Tachometer pulse source from a sysfs GPIO

// See https://docs.kernel.org/admin-guide/gpio/sysfs.html

use std::{
    fmt,
    fs::File,
    io::{Read as _, Seek as _, SeekFrom},
    os::fd::AsFd as _,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::Context as _;
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
};

use crate::{
    fan::{Edge, FanSettings, Micros, PulseHandle},
    sysfs::{attr_index, ensure_sysfs_file, write_value},
};

/// Maximum time to wait for an edge before checking for exit, in ms
const POLL_TIMEOUT_MS: u16 = 200;

/// Monotonic microsecond clock, wrapping like embedded timer counters
#[derive(Copy, Clone, Debug)]
pub(crate) struct MicrosClock {
    /// Clock origin
    start: Instant,
}

impl MicrosClock {
    /// Start a new clock at 0
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Microseconds elapsed since clock start, modulo 2^32
    pub(crate) fn micros(&self) -> Micros {
        wrap_micros(self.start.elapsed().as_micros())
    }
}

/// Truncate a timestamp to the wrapping pulse time domain
#[expect(clippy::cast_possible_truncation)]
fn wrap_micros(us: u128) -> Micros {
    us as Micros
}

/// Set the GPIO edge generating interrupts
fn configure_edge(value_path: &Path, edge: Edge) -> anyhow::Result<()> {
    let edge_path = ensure_sysfs_file(&value_path.with_file_name("edge"))?;
    write_value(&edge_path, edge)
}

/// Tachometer connected to a GPIO, counting edges in a background thread
pub(crate) struct GpioTachometer {
    /// GPIO `value` attribute path
    path: PathBuf,
    /// Exit request for the thread
    stop: Arc<AtomicBool>,
    /// Edge wait thread
    thread: Option<thread::JoinHandle<()>>,
}

impl fmt::Display for GpioTachometer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match attr_index(self.path.parent().unwrap_or(&self.path)) {
            Ok(num) => write!(f, "gpio{num}"),
            Err(_) => write!(f, "{:?}", self.path),
        }
    }
}

impl GpioTachometer {
    /// Configure GPIO and start notifying pulses
    pub(crate) fn spawn(
        value_path: &Path,
        settings: &FanSettings,
        pulses: PulseHandle,
    ) -> anyhow::Result<Self> {
        let path = ensure_sysfs_file(value_path)?;
        configure_edge(&path, settings.edge)
            .with_context(|| format!("Failed to set {path:?} edge to {}", settings.edge))?;
        if settings.pull_up {
            log::warn!(
                "Pull-up can not be set from sysfs, it must be configured by the device tree or an external resistor"
            );
        }
        let file = File::open(&path).with_context(|| format!("Failed to open {path:?}"))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("tachometer".to_owned())
            .spawn({
                let stop = Arc::clone(&stop);
                let path = path.clone();
                move || {
                    if let Err(err) = wait_edges(file, &pulses, &stop) {
                        log::error!("Tachometer {path:?} failed: {err:#}");
                    }
                }
            })?;

        let tach = Self {
            path,
            stop,
            thread: Some(thread),
        };
        log::info!("Tachometer {tach} counting {} edges", settings.edge);
        Ok(tach)
    }
}

/// Wait for the next GPIO interrupt, at most `POLL_TIMEOUT_MS`
fn poll_edge(file: &File) -> anyhow::Result<bool> {
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLPRI)];
    match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(fds
            .iter()
            .any(|fd| fd.revents().is_some_and(|r| r.contains(PollFlags::POLLPRI)))),
        Err(err) => Err(err.into()),
    }
}

/// Notify a pulse for an interrupt at `now`, and read the value again to arm the next one
fn handle_edge(
    file: &mut File,
    buf: &mut Vec<u8>,
    pulses: &PulseHandle,
    now: Micros,
) -> anyhow::Result<()> {
    pulses.on_pulse(now);
    file.seek(SeekFrom::Start(0))?;
    buf.clear();
    file.read_to_end(buf)?;
    Ok(())
}

/// Notify a pulse for each GPIO interrupt until stopped
fn wait_edges(mut file: File, pulses: &PulseHandle, stop: &AtomicBool) -> anyhow::Result<()> {
    let clock = MicrosClock::new();
    let mut buf = Vec::with_capacity(4);

    // Value must be read once before the next change can be polled
    file.read_to_end(&mut buf)?;

    while !stop.load(Ordering::Relaxed) {
        if poll_edge(&file)? {
            handle_edge(&mut file, &mut buf, pulses, clock.micros())?;
        }
    }
    Ok(())
}

impl Drop for GpioTachometer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.thread.take().is_some_and(|t| t.join().is_err()) {
            log::error!("Tachometer {self} thread panicked");
        }
    }
}
