//! Process supervisor query
//!
//! Answers "is this module's service running right now" for modules that
//! declare the `has-service` capability.

use tracing::{debug, warn};

use crate::runner::{CommandRunner, CommandSpec};

/// Live state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    /// The supervisor could not be asked
    Unknown,
}

impl ServiceState {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

pub trait ServiceProbe {
    fn state(&self, unit: &str) -> ServiceState;
}

/// `systemctl is-active --quiet <unit>`
#[derive(Debug, Clone)]
pub struct SystemctlProbe<R> {
    runner: R,
}

impl<R: CommandRunner> SystemctlProbe<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> ServiceProbe for SystemctlProbe<R> {
    fn state(&self, unit: &str) -> ServiceState {
        let spec = CommandSpec::new("systemctl").args(["is-active", "--quiet", unit]);
        match self.runner.run(&spec) {
            Ok(out) if out.success => ServiceState::Running,
            Ok(out) => {
                debug!("{} is not active (exit {:?})", unit, out.exit_code);
                ServiceState::Stopped
            }
            Err(e) => {
                warn!("Could not query service {}: {:#}", unit, e);
                ServiceState::Unknown
            }
        }
    }
}
