//! External command execution
//!
//! All module actions and package-manager calls go through a
//! [`CommandRunner`]. The system implementation:
//!
//! - spawns each command in its own process group and registers it with the
//!   global [`ChildRegistry`] while it runs
//! - captures stdout and stderr line by line, echoing them at `debug`
//! - enforces an optional timeout by killing the process group
//! - in dry-run mode, skips commands flagged as mutating and reports a
//!   synthetic success

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::discovery::DiscoveredModule;
use crate::process_guard::{kill_group, ChildRegistry, CommandProcessGroup};
use crate::types::ModuleAction;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for output pipes after the child has exited. A daemon
/// that inherited the pipes would otherwise hold them open forever.
const PIPE_DRAIN: Duration = Duration::from_secs(2);

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Changes host state; skipped in dry-run mode
    pub mutates: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            timeout: None,
            mutates: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutates = true;
        self
    }

    /// Program and arguments joined for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub duration: Duration,
    /// Not executed because of dry-run mode
    pub dry_run: bool,
}

impl CommandOutput {
    /// Successful exit with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    /// Non-zero exit
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            success: false,
            ..Self::default()
        }
    }

    /// Stand-in for a command skipped by dry-run mode
    pub fn skipped(spec: &CommandSpec) -> Self {
        Self {
            stdout: format!("[DRY RUN] Skipped: {}\n", spec.command_line()),
            exit_code: Some(0),
            success: true,
            dry_run: true,
            ..Self::default()
        }
    }

    /// One-line description of why the command failed
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return format!("timed out after {}s", self.duration.as_secs());
        }
        let status = match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        match last_line(&self.stderr).or_else(|| last_line(&self.stdout)) {
            Some(line) => format!("{}: {}", status, line),
            None => status,
        }
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

/// Executes external commands
pub trait CommandRunner {
    /// `Err` only when the command could not be started or waited on; a
    /// non-zero exit is a successful `run` with `success == false`.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(spec)
    }
}

impl<T: CommandRunner + ?Sized> CommandRunner for Box<T> {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(spec)
    }
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    dry_run: bool,
}

impl SystemRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.command_line();
        if self.dry_run && spec.mutates {
            info!("[DRY RUN] Skipped: {}", line);
            return Ok(CommandOutput::skipped(spec));
        }

        debug!("Running: {} env={:?} cwd={:?}", line, spec.env, spec.cwd);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", line))?;
        let pid = child.id();
        ChildRegistry::with_global(|r| r.register(pid));

        let stdout = child.stdout.take().map(|s| spawn_reader(s, pid, "stdout"));
        let stderr = child.stderr.take().map(|s| spawn_reader(s, pid, "stderr"));

        let mut timed_out = false;
        let waited = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            if spec.timeout.is_some_and(|t| start.elapsed() >= t) {
                warn!("{} exceeded its timeout, killing process group {}", line, pid);
                timed_out = true;
                kill_group(pid);
                break child.wait();
            }
            thread::sleep(POLL_INTERVAL);
        };
        ChildRegistry::with_global(|r| r.unregister(pid));
        let status = waited.with_context(|| format!("Failed waiting for: {}", line))?;

        let output = CommandOutput {
            stdout: stdout.map(|rx| drain(rx, pid)).unwrap_or_default(),
            stderr: stderr.map(|rx| drain(rx, pid)).unwrap_or_default(),
            exit_code: status.code(),
            success: status.success() && !timed_out,
            timed_out,
            duration: start.elapsed(),
            dry_run: false,
        };

        if output.success {
            debug!("{} succeeded in {:?}", line, output.duration);
        } else {
            debug!("{} failed: {}", line, output.failure_reason());
        }
        Ok(output)
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    pid: u32,
    stream: &'static str,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut captured = String::new();
        for line in BufReader::new(pipe).lines().map_while(Result::ok) {
            debug!("[{} {}] {}", pid, stream, line);
            captured.push_str(&line);
            captured.push('\n');
        }
        let _ = tx.send(captured);
    });
    rx
}

fn drain(rx: mpsc::Receiver<String>, pid: u32) -> String {
    rx.recv_timeout(PIPE_DRAIN).unwrap_or_else(|_| {
        debug!("Output of {} still held open by a descendant; not waiting", pid);
        String::new()
    })
}

/// Runs a module's own install/uninstall/status entry point
pub trait ModuleRunner {
    fn run_action(&self, module: &DiscoveredModule, action: ModuleAction) -> Result<CommandOutput>;
}

/// Environment variables passed to module entry points
pub const ENV_MODULE_PATH: &str = "MODHOST_MODULE";
pub const ENV_MODULE_ACTION: &str = "MODHOST_ACTION";
pub const ENV_MODULE_CONFIG_DIR: &str = "MODHOST_MODULE_CONFIG_DIR";

/// Invokes `<entry_point> <action>` inside the module directory
#[derive(Debug, Clone)]
pub struct EntryPointRunner<R> {
    runner: R,
    timeout: Duration,
    config_root: PathBuf,
}

impl<R: CommandRunner> EntryPointRunner<R> {
    pub fn new(runner: R, timeout: Duration, config_root: impl AsRef<Path>) -> Self {
        Self {
            runner,
            timeout,
            config_root: config_root.as_ref().to_path_buf(),
        }
    }

    pub fn spec_for(&self, module: &DiscoveredModule, action: ModuleAction) -> CommandSpec {
        let config_dir = self
            .config_root
            .join(module.path.category())
            .join(module.path.name());
        let mut spec = CommandSpec::new(module.entry_point.to_string_lossy())
            .arg(action.to_string())
            .env(ENV_MODULE_PATH, module.path.to_string())
            .env(ENV_MODULE_ACTION, action.to_string())
            .env(ENV_MODULE_CONFIG_DIR, config_dir.to_string_lossy())
            .current_dir(&module.directory)
            .timeout(self.timeout);
        if action.mutates_host() {
            spec = spec.mutating();
        }
        spec
    }
}

impl<R: CommandRunner> ModuleRunner for EntryPointRunner<R> {
    fn run_action(&self, module: &DiscoveredModule, action: ModuleAction) -> Result<CommandOutput> {
        info!("Running {} {}", module.path, action);
        self.runner
            .run(&self.spec_for(module, action))
            .with_context(|| format!("{} action of {}", action, module.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[test]
    fn test_captures_stdout_and_exit_code() {
        let out = SystemRunner::new(false).run(&sh("echo hello; echo oops >&2; exit 3")).unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success);
        assert!(!out.timed_out);
        assert_eq!(out.failure_reason(), "exit code 3: oops");
    }

    #[test]
    fn test_env_and_cwd_are_applied() {
        let dir = TempDir::new().unwrap();
        let spec = sh("echo \"$GREETING\"; pwd")
            .env("GREETING", "hi")
            .current_dir(dir.path());
        let out = SystemRunner::new(false).run(&spec).unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(out.stdout, format!("hi\n{}\n", canonical.display()));
    }

    #[test]
    fn test_timeout_kills_command() {
        let spec = sh("sleep 30").timeout(Duration::from_millis(200));
        let out = SystemRunner::new(false).run(&spec).unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
        assert!(out.duration < Duration::from_secs(10));
        assert!(out.failure_reason().starts_with("timed out"));
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let result =
            SystemRunner::new(false).run(&CommandSpec::new("/nonexistent/modhost-test-binary"));
        assert!(result.is_err());
    }

    #[test]
    fn test_dry_run_skips_mutating_commands_only() {
        let runner = SystemRunner::new(true);
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("touched");

        let spec = CommandSpec::new("touch")
            .arg(marker.to_string_lossy())
            .mutating();
        let out = runner.run(&spec).unwrap();
        assert!(out.dry_run);
        assert!(out.success);
        assert!(out.stdout.starts_with("[DRY RUN] Skipped: touch"));
        assert!(!marker.exists());

        let out = runner.run(&sh("echo query")).unwrap();
        assert!(!out.dry_run);
        assert_eq!(out.stdout, "query\n");
    }

    #[test]
    fn test_entry_point_runner_invokes_script_with_action() {
        let dir = TempDir::new().unwrap();
        let module_dir = dir.path().join("iot").join("broker");
        std::fs::create_dir_all(&module_dir).unwrap();
        let script = module_dir.join("setup.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"$1 $MODHOST_MODULE $MODHOST_MODULE_CONFIG_DIR\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let module = DiscoveredModule {
            path: "iot/broker".parse().unwrap(),
            directory: module_dir.clone(),
            entry_point: script,
            manifest: None,
            warnings: Vec::new(),
        };
        let runner = EntryPointRunner::new(
            SystemRunner::new(false),
            Duration::from_secs(10),
            "/etc/modhost",
        );

        let out = runner.run_action(&module, ModuleAction::Status).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "status iot/broker /etc/modhost/iot/broker\n");

        assert!(runner.spec_for(&module, ModuleAction::Install).mutates);
        assert!(!runner.spec_for(&module, ModuleAction::Status).mutates);
    }
}
