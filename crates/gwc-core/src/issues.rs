use crate::connectivity::ConnectivityState;
use crate::wire::{CronJob, RunStatus, Snapshot};
use chrono::{TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const FAILING_JOB_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::Warning => 1,
            Severity::Info => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub detail: String,
    #[serde(default)]
    pub remediation: Option<String>,
}

impl Issue {
    fn new(
        id: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        detail: impl Into<String>,
        remediation: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            title: title.into(),
            detail: detail.into(),
            remediation: remediation.map(str::to_string),
        }
    }
}

fn missing_target_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(missing|no|unknown|unresolved)\s+(delivery\s+)?(target|recipient|destination)|delivery target",
        )
        .expect("valid missing-target pattern")
    })
}

pub fn is_missing_delivery_target(message: &str) -> bool {
    missing_target_pattern().is_match(message)
}

/// Derives the actionable findings for one snapshot.
///
/// Pure: the same snapshot and verdict always yield the same issues in the
/// same order. Each job contributes at most one issue (the first rule that
/// matches), and the result is stably sorted by severity.
pub fn derive_issues(snapshot: &Snapshot, verdict: ConnectivityState) -> Vec<Issue> {
    let mut issues = Vec::new();

    if verdict != ConnectivityState::Online {
        issues.push(Issue::new(
            "gateway-offline",
            Severity::Critical,
            "Gateway offline",
            match verdict {
                ConnectivityState::Loading => "Waiting for the gateway to respond.".to_string(),
                _ => "The gateway is not reachable; live data may be stale.".to_string(),
            },
            Some("/settings/gateway"),
        ));
    }

    for job in &snapshot.cron {
        if let Some(issue) = job_issue(job) {
            issues.push(issue);
        }
    }

    if snapshot.connected_channels() == 0 {
        issues.push(Issue::new(
            "no-channels",
            Severity::Warning,
            "No channels connected",
            "Connect a messaging channel so agents can be reached.",
            Some("/channels"),
        ));
    }

    if snapshot.cron.is_empty() {
        issues.push(Issue::new(
            "no-cron-jobs",
            Severity::Info,
            "No scheduled jobs",
            "Nothing is scheduled to run on this gateway.",
            Some("/cron"),
        ));
    }

    issues.sort_by_key(|issue| issue.severity.rank());
    issues
}

fn job_issue(job: &CronJob) -> Option<Issue> {
    let state = &job.state;
    let name = job.display_name();

    if state.consecutive_errors >= FAILING_JOB_THRESHOLD {
        return Some(Issue::new(
            format!("cron-failing:{}", job.id),
            Severity::Critical,
            format!("Job \"{name}\" is failing repeatedly"),
            format!(
                "{} consecutive failures{}",
                state.consecutive_errors,
                last_error_suffix(state.last_error.as_deref(), state.last_run_at_ms)
            ),
            Some("/cron"),
        ));
    }

    if let Some(error) = state.last_error.as_deref() {
        if is_missing_delivery_target(error) {
            return Some(Issue::new(
                format!("cron-missing-target:{}", job.id),
                Severity::Warning,
                format!("Job \"{name}\" has no delivery target"),
                error.to_string(),
                Some("/cron"),
            ));
        }
    }

    if state.last_status == Some(RunStatus::Error) {
        return Some(Issue::new(
            format!("cron-error:{}", job.id),
            Severity::Warning,
            format!("Job \"{name}\" failed on its last run"),
            format!(
                "Last run failed{}",
                last_error_suffix(state.last_error.as_deref(), state.last_run_at_ms)
            ),
            Some("/cron"),
        ));
    }

    None
}

fn last_error_suffix(error: Option<&str>, at_ms: Option<i64>) -> String {
    let at = at_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|dt| format!(" at {}", dt.format("%Y-%m-%d %H:%M UTC")))
        .unwrap_or_default();
    match error {
        Some(error) if !error.trim().is_empty() => format!("{at}: {}", error.trim()),
        _ => at,
    }
}
