//! Child process lifecycle and operator interrupts
//!
//! Every external command runs in its own process group so that a terminal
//! Ctrl+C reaches only this process, and so that a whole tree (a module's
//! `setup.sh` plus whatever it spawned) can be signalled at once.
//!
//! Interrupt handling is two-stage:
//!
//! 1. First SIGINT/SIGTERM/SIGHUP sets the [`CancellationToken`]. The module
//!    action currently running is allowed to finish; the orchestrator stops
//!    before the next one.
//! 2. A second signal terminates every registered child group (SIGTERM, grace
//!    period, SIGKILL) and exits with `128 + signal`.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL on forced shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// PIDs (and process group ids) of running children
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Run `f` against the global registry, tolerating a poisoned lock
    pub fn with_global<R>(f: impl FnOnce(&mut ChildRegistry) -> R) -> R {
        let registry = Self::global();
        let mut guard = match registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Child registry lock poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process group {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// SIGTERM every tracked group, wait up to `grace_period`, then SIGKILL
    /// the survivors. Runs at most once per registry.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        let pids: Vec<u32> = self.pids.drain().collect();
        info!("Terminating {} running command(s)", pids.len());

        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
            warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
            signal_group_or_process(pid, Signal::SIGKILL);
        }
    }
}

/// Kill a single child's process group immediately (timeouts)
pub fn kill_group(pgid: u32) {
    signal_group_or_process(pgid, Signal::SIGKILL);
}

fn signal_group_or_process(pid: u32, sig: Signal) {
    let raw = match i32::try_from(pid) {
        Ok(raw) => raw,
        Err(_) => {
            error!("PID {} out of range, cannot signal", pid);
            return;
        }
    };
    // Negative pid addresses the whole group
    if let Err(e) = signal::kill(Pid::from_raw(-raw), sig) {
        debug!("{} to group {} failed ({}), signalling the process", sig, pid, e);
        if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
            debug!("{} to process {} failed: {}", sig, pid, e);
        }
    }
}

/// Alive and not a zombie
fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if signal::kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The state field follows the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| !matches!(state, "Z" | "X")),
        Err(_) => true,
    }
}

/// Shared "stop before the next module" flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Terminates every registered child when dropped
#[derive(Debug, Default)]
pub struct ProcessGuard;

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        ChildRegistry::with_global(|r| r.terminate_all(SHUTDOWN_GRACE));
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling. Call once at startup.
pub fn install_signal_handlers(token: CancellationToken) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            let name = Signal::try_from(sig)
                .map(|s| s.as_str())
                .unwrap_or("UNKNOWN");

            if !token.is_cancelled() {
                warn!(
                    "Received {}; finishing the current module, then stopping (repeat to abort)",
                    name
                );
                token.cancel();
                continue;
            }

            warn!("Received {} again; aborting running commands", name);
            ChildRegistry::with_global(|r| r.terminate_all(SHUTDOWN_GRACE));
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Spawn a command as the leader of its own process group
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between
        // fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                // Die with the orchestrator rather than outlive it
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn reaped_within(child: &mut std::process::Child, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_tracks_pids() {
        let mut registry = ChildRegistry::default();
        registry.register(10);
        registry.register(20);
        registry.register(10);
        assert_eq!(registry.count(), 2);
        registry.unregister(10);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_new_process_group_leader() {
        let mut child = Command::new("sleep")
            .arg("30")
            .in_new_process_group()
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(pid))).unwrap();
        assert_eq!(pgid.as_raw(), pid);

        kill_group(child.id());
        assert!(reaped_within(&mut child, Duration::from_secs(2)));
    }

    #[test]
    fn test_kill_group_reaches_grandchildren() {
        let mut child = Command::new("bash")
            .args(["-c", "sleep 30 & wait"])
            .in_new_process_group()
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        kill_group(child.id());
        assert!(reaped_within(&mut child, Duration::from_secs(2)));
    }

    #[test]
    fn test_terminate_all_runs_once() {
        let mut child = Command::new("sleep")
            .arg("30")
            .in_new_process_group()
            .spawn()
            .unwrap();

        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        registry.terminate_all(Duration::from_millis(500));
        assert!(reaped_within(&mut child, Duration::from_secs(2)));
        assert_eq!(registry.count(), 0);

        // Second call is a no-op even with new registrations
        registry.register(999_999);
        registry.terminate_all(Duration::from_millis(10));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_dead_pid_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }
}
