use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;

pub const MAX_LOG_LINES: usize = 100;

/// One aggregated read of the gateway's live state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub gateway: GatewayStatus,
    #[serde(default)]
    pub cron: Vec<CronJob>,
    #[serde(default)]
    pub runs: Vec<JobRun>,
    #[serde(default)]
    pub agents: AgentCounters,
    #[serde(default)]
    pub channels: Vec<ChannelState>,
    #[serde(default, deserialize_with = "deserialize_log_ring")]
    pub logs: VecDeque<String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Snapshot {
    pub fn connected_channels(&self) -> usize {
        self.channels.iter().filter(|channel| channel.connected).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub state: CronJobState,
}

impl CronJob {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_status: Option<RunStatus>,
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub next_run_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Skipped => "skipped",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    #[serde(deserialize_with = "deserialize_id")]
    pub job_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at_ms: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCounters {
    #[serde(default)]
    pub agents: u32,
    #[serde(default)]
    pub sessions: u32,
    #[serde(default)]
    pub active_sessions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    pub id: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub account: Option<String>,
}

/// One machine-resource reading pushed over the metric stream.
///
/// `timestamp` is required; frames without it fail to decode and are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricFrame {
    pub timestamp: i64,
    #[serde(default)]
    pub cpu: CpuReading,
    #[serde(default)]
    pub memory: UsageReading,
    #[serde(default)]
    pub disk: UsageReading,
    #[serde(default)]
    pub processes: ProcessCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuReading {
    #[serde(default)]
    pub usage_percent: f64,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub load_avg: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReading {
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
}

impl UsageReading {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCounts {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub running: u32,
}

/// Messages on the pairing push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PairingEvent {
    Qr {
        data: String,
    },
    Log {
        #[serde(default)]
        data: String,
    },
    Done {
        #[serde(default)]
        data: Option<String>,
    },
    Error {
        #[serde(default)]
        data: Option<String>,
    },
    Ping {
        #[serde(default)]
        data: Option<String>,
    },
}

/// Inbound contact awaiting human approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub channel: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub code: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingContacts {
    #[serde(default)]
    pub dm: Vec<PairingRequest>,
}

/// Request bodies for the gateway's action endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum GatewayAction {
    TestKey { provider: String, token: String },
    ListModels { provider: String, token: String },
    Add { channel: String, token: String },
    ApproveDm { channel: String, code: String },
    ListPending,
}

impl GatewayAction {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayAction::TestKey { .. } => "test-key",
            GatewayAction::ListModels { .. } => "list-models",
            GatewayAction::Add { .. } => "add",
            GatewayAction::ApproveDm { .. } => "approve-dm",
            GatewayAction::ListPending => "list-pending",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn into_result(self, fallback: &str) -> Result<(), String> {
        if self.ok {
            Ok(())
        } else {
            Err(self.error.unwrap_or_else(|| fallback.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelListResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

fn default_true() -> bool {
    true
}

/// Keep only the newest `MAX_LOG_LINES` entries of the remote log ring.
fn deserialize_log_ring<'de, D>(deserializer: D) -> Result<VecDeque<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let lines: Vec<Value> = Vec::deserialize(deserializer)?;
    let skip = lines.len().saturating_sub(MAX_LOG_LINES);
    Ok(lines
        .into_iter()
        .skip(skip)
        .map(|line| match line {
            Value::String(text) => text,
            other => other.to_string(),
        })
        .collect())
}

/// Deserialize an id that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}
