//! Fan connection settings

use std::time::Duration;

/// Tachometer signal edge a pulse is counted on
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Edge {
    /// Low to high transition
    Rising,
    /// High to low transition, fans pull the tachometer line low
    #[default]
    Falling,
}

/// How a fan is electrically connected
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct FanSettings {
    /// Tachometer edge polarity
    pub edge: Edge,
    /// Pull-up the tachometer input
    pub pull_up: bool,
    /// Debounce time constant
    tau: Duration,
}

impl Default for FanSettings {
    fn default() -> Self {
        Self::new(Edge::default(), true, Duration::from_millis(10))
    }
}

impl FanSettings {
    /// Build new settings
    pub(crate) fn new(edge: Edge, pull_up: bool, tau: Duration) -> Self {
        Self { edge, pull_up, tau }
    }

    /// Minimum time between two counted pulses
    pub(crate) fn tau(&self) -> Duration {
        self.tau
    }

    /// Update debounce time constant
    pub(crate) fn set_tau(&mut self, tau: Duration) {
        self.tau = tau;
    }
}
