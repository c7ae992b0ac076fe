//! Operation results
//!
//! Per-module outcomes plus a final success/failure line. Rendering goes to
//! stdout; logs go to stderr.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use strum::Display;

use crate::services::ServiceState;
use crate::types::{ModulePath, ModuleStatus};

/// Exit status for a fully successful operation
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status when a module failed or the operation was refused
pub const EXIT_FAILURE: i32 = 1;
/// Exit status for usage and configuration errors
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Install,
    Uninstall,
    Purge,
}

/// Where a module failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The module's own action failed or timed out
    Action,
    /// The action succeeded but recording it did not
    Registry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { status: ModuleStatus },
    /// Record and files erased
    Purged,
    Failed { kind: FailureKind, reason: String },
    NotAttempted { reason: String },
    SkippedAlreadySatisfied,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } | Self::Purged => "✓",
            Self::Failed { .. } => "✗",
            Self::NotAttempted { .. } => "-",
            Self::SkippedAlreadySatisfied => "=",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { status } => write!(f, "{}", status),
            Self::Purged => f.write_str("purged"),
            Self::Failed {
                kind: FailureKind::Action,
                reason,
            } => write!(f, "failed: {}", reason),
            Self::Failed {
                kind: FailureKind::Registry,
                reason,
            } => write!(f, "registry write failed: {}", reason),
            Self::NotAttempted { reason } => write!(f, "not attempted: {}", reason),
            Self::SkippedAlreadySatisfied => f.write_str("skipped (already satisfied)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReport {
    pub path: ModulePath,
    pub outcome: Outcome,
}

/// Result of install, uninstall, or purge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub operation: Operation,
    pub dry_run: bool,
    pub modules: Vec<ModuleReport>,
    pub warnings: Vec<String>,
    /// Whole operation refused before any irreversible step
    pub refusal: Option<String>,
    /// Stopped early by an operator interrupt
    pub cancelled: bool,
    /// Post-run cleanup problems (purge file/package removal)
    pub cleanup_errors: Vec<String>,
}

impl OperationReport {
    pub fn new(operation: Operation, dry_run: bool) -> Self {
        Self {
            operation,
            dry_run,
            modules: Vec::new(),
            warnings: Vec::new(),
            refusal: None,
            cancelled: false,
            cleanup_errors: Vec::new(),
        }
    }

    pub fn refused(mut self, reason: impl Into<String>) -> Self {
        self.refusal = Some(reason.into());
        self
    }

    pub fn record(&mut self, path: ModulePath, outcome: Outcome) {
        self.modules.push(ModuleReport { path, outcome });
    }

    pub fn outcome(&self, path: &ModulePath) -> Option<&Outcome> {
        self.modules
            .iter()
            .find(|m| &m.path == path)
            .map(|m| &m.outcome)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ModuleReport> {
        self.modules.iter().filter(|m| m.outcome.is_failure())
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.modules.iter().filter(|m| pred(&m.outcome)).count()
    }

    pub fn is_success(&self) -> bool {
        self.refusal.is_none()
            && !self.cancelled
            && self.cleanup_errors.is_empty()
            && self.failed().next().is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }
}

fn path_width<'a>(paths: impl Iterator<Item = &'a ModulePath>) -> usize {
    paths.map(|p| p.to_string().len()).max().unwrap_or(0).max(6)
}

impl fmt::Display for OperationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.dry_run { "[DRY RUN] " } else { "" };

        if let Some(reason) = &self.refusal {
            writeln!(f, "{}✗ {} refused: {}", prefix, self.operation, reason)?;
            return Ok(());
        }

        let width = path_width(self.modules.iter().map(|m| &m.path));
        for m in &self.modules {
            writeln!(
                f,
                "  {} {:<width$}  {}",
                m.outcome.symbol(),
                m.path.to_string(),
                m.outcome,
                width = width
            )?;
        }
        for w in &self.warnings {
            writeln!(f, "  ! {}", w)?;
        }
        for e in &self.cleanup_errors {
            writeln!(f, "  ✗ cleanup: {}", e)?;
        }

        let done = self.count(|o| matches!(o, Outcome::Succeeded { .. } | Outcome::Purged));
        let failed = self.count(Outcome::is_failure);
        let skipped = self.count(|o| matches!(o, Outcome::SkippedAlreadySatisfied));
        let not_attempted = self.count(|o| matches!(o, Outcome::NotAttempted { .. }));
        let summary = format!(
            "{} succeeded, {} failed, {} skipped, {} not attempted",
            done, failed, skipped, not_attempted
        );

        if self.is_success() {
            writeln!(f, "{}✓ {} complete: {}", prefix, self.operation, summary)
        } else if self.cancelled {
            writeln!(f, "{}✗ {} interrupted: {}", prefix, self.operation, summary)
        } else {
            writeln!(f, "{}✗ {} failed: {}", prefix, self.operation, summary)
        }
    }
}

/// One line of `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub path: ModulePath,
    /// Source present under the modules root
    pub discovered: bool,
    pub status: Option<ModuleStatus>,
    pub version: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Declared service and its live state
    pub service: Option<(String, ServiceState)>,
    /// Result of the module's own `status` action (`--live`)
    pub live: Option<Result<(), String>>,
}

impl StatusRow {
    /// `removed` and `failed` count as not installed
    pub fn is_installed(&self) -> bool {
        self.status.is_some_and(ModuleStatus::is_installed)
    }

    fn state_label(&self) -> String {
        match self.status {
            None => "not installed".to_string(),
            Some(ModuleStatus::Removed) => "not installed (removed)".to_string(),
            Some(status) => status.to_string(),
        }
    }
}

/// Read-only merged view of registry and live state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusReport {
    pub rows: Vec<StatusRow>,
    pub refusal: Option<String>,
}

impl StatusReport {
    pub fn row(&self, path: &ModulePath) -> Option<&StatusRow> {
        self.rows.iter().find(|r| &r.path == path)
    }

    /// Non-zero when refused or a live status action failed
    pub fn exit_code(&self) -> i32 {
        let live_failed = self
            .rows
            .iter()
            .any(|r| matches!(r.live, Some(Err(_))));
        if self.refusal.is_some() || live_failed {
            EXIT_FAILURE
        } else {
            EXIT_SUCCESS
        }
    }
}

fn short_time(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.refusal {
            return writeln!(f, "✗ status refused: {}", reason);
        }
        if self.rows.is_empty() {
            return writeln!(f, "No modules found");
        }

        let width = path_width(self.rows.iter().map(|r| &r.path));
        writeln!(
            f,
            "  {:<width$}  {:<24}  {:<10}  {:<20}  {}",
            "MODULE",
            "STATE",
            "VERSION",
            "INSTALLED",
            "SERVICE",
            width = width
        )?;
        for row in &self.rows {
            let mut state = row.state_label();
            if !row.discovered {
                state.push_str(" *");
            }
            let service = match &row.service {
                Some((unit, live)) => format!("{} ({})", unit, live),
                None => "-".to_string(),
            };
            write!(
                f,
                "  {:<width$}  {:<24}  {:<10}  {:<20}  {}",
                row.path.to_string(),
                state,
                row.version.as_deref().unwrap_or("-"),
                short_time(&row.installed_at),
                service,
                width = width
            )?;
            match &row.live {
                Some(Ok(())) => writeln!(f, "  ✓ status ok")?,
                Some(Err(reason)) => writeln!(f, "  ✗ status: {}", reason)?,
                None => writeln!(f)?,
            }
        }
        if self.rows.iter().any(|r| !r.discovered) {
            writeln!(f, "  * source no longer present under the modules root")?;
        }
        let installed = self.rows.iter().filter(|r| r.is_installed()).count();
        writeln!(f, "{} of {} module(s) installed", installed, self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ModulePath {
        s.parse().unwrap()
    }

    #[test]
    fn test_all_succeeded_exits_zero() {
        let mut report = OperationReport::new(Operation::Install, false);
        report.record(p("iot/broker"), Outcome::Succeeded { status: ModuleStatus::Installed });
        report.record(p("iot/mqtt"), Outcome::SkippedAlreadySatisfied);
        assert_eq!(report.exit_code(), EXIT_SUCCESS);

        let text = report.to_string();
        assert!(text.contains("✓ iot/broker"));
        assert!(text.contains("skipped (already satisfied)"));
        assert!(text.ends_with(
            "✓ install complete: 1 succeeded, 0 failed, 1 skipped, 0 not attempted\n"
        ));
    }

    #[test]
    fn test_one_failure_exits_nonzero() {
        let mut report = OperationReport::new(Operation::Install, false);
        report.record(p("iot/broker"), Outcome::Succeeded { status: ModuleStatus::Active });
        report.record(
            p("sensors/temp"),
            Outcome::Failed {
                kind: FailureKind::Action,
                reason: "exit code 1".into(),
            },
        );
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert_eq!(report.failed().count(), 1);
        assert!(report.to_string().contains("✗ sensors/temp"));
    }

    #[test]
    fn test_registry_failure_is_labelled_distinctly() {
        let outcome = Outcome::Failed {
            kind: FailureKind::Registry,
            reason: "disk full".into(),
        };
        assert_eq!(outcome.to_string(), "registry write failed: disk full");
    }

    #[test]
    fn test_refusal_and_dry_run_prefix() {
        let report =
            OperationReport::new(Operation::Purge, true).refused("confirmation token not given");
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert_eq!(
            report.to_string(),
            "[DRY RUN] ✗ purge refused: confirmation token not given\n"
        );
    }

    #[test]
    fn test_cancelled_is_not_success() {
        let mut report = OperationReport::new(Operation::Uninstall, false);
        report.cancelled = true;
        report.record(p("iot/a"), Outcome::NotAttempted { reason: "interrupted".into() });
        assert!(!report.is_success());
        assert!(report.to_string().contains("uninstall interrupted"));
    }

    #[test]
    fn test_status_removed_reads_as_not_installed() {
        let row = StatusRow {
            path: p("iot/a"),
            discovered: true,
            status: Some(ModuleStatus::Removed),
            version: Some("1.0.0".into()),
            installed_at: None,
            updated_at: None,
            service: None,
            live: None,
        };
        assert!(!row.is_installed());
        let report = StatusReport {
            rows: vec![row],
            refusal: None,
        };
        let text = report.to_string();
        assert!(text.contains("not installed (removed)"));
        assert!(text.ends_with("0 of 1 module(s) installed\n"));
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
    }
}
