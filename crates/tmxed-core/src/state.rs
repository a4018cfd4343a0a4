use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::commands::CommandSpec;
use crate::commands::StatusFamily;
use crate::config::Config;

/// Operation-specific arguments or response fields, kept as raw JSON.
pub type Payload = serde_json::Map<String, serde_json::Value>;

pub type OperationOutcome = Result<Payload, JobError>;

/// Outcome tag carried by every engine response. Unrecognized strings are kept
/// verbatim so a bad poll can be reported instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusCode {
    Success,
    Loading,
    Processing,
    Saving,
    Completed,
    Error,
    Expired,
    Unknown(String),
}

impl StatusCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "Success",
            Self::Loading => "Loading",
            Self::Processing => "Processing",
            Self::Saving => "Saving",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Expired => "Expired",
            Self::Unknown(other) => other.as_str(),
        }
    }
}

impl From<String> for StatusCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Success" => Self::Success,
            "Loading" => Self::Loading,
            "Processing" => Self::Processing,
            "Saving" => Self::Saving,
            "Completed" => Self::Completed,
            "Error" => Self::Error,
            "Expired" => Self::Expired,
            _ => Self::Unknown(value),
        }
    }
}

impl From<StatusCode> for String {
    fn from(value: StatusCode) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded engine response: `{"status": ..., "reason": ..., <fields>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub data: Payload,
}

impl StatusSnapshot {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            data: Payload::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn reason_or(&self, fallback: &str) -> String {
        self.reason
            .as_deref()
            .filter(|reason| !reason.trim().is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

/// A request for the engine. Immutable once handed to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCommand {
    pub name: String,
    pub payload: Payload,
}

impl EngineCommand {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Payload::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    LocalRejection,
    Transport,
    Engine,
    Expired,
    ProtocolViolation,
}

impl ErrorClass {
    pub fn label(self) -> &'static str {
        match self {
            Self::LocalRejection => "local-rejection",
            Self::Transport => "transport",
            Self::Engine => "engine",
            Self::Expired => "expired",
            Self::ProtocolViolation => "protocol-violation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("another operation is already running")]
    Busy,
    #[error("no document is open")]
    NoDocument,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("waiting for a decision about unsaved changes")]
    GatePending,
    #[error("a location must be chosen before saving a new document")]
    NeedsIdentity,
    #[error("cancelled")]
    Cancelled,
    #[error("engine unreachable: {0}")]
    Transport(String),
    #[error("{reason}")]
    Engine { reason: String },
    #[error("{reason}")]
    Expired { reason: String },
    #[error("protocol violation: unexpected status {status}")]
    ProtocolViolation { status: String },
    #[error("timeout")]
    Timeout,
}

impl JobError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Busy
            | Self::NoDocument
            | Self::UnknownCommand(_)
            | Self::InvalidArguments(_)
            | Self::GatePending
            | Self::NeedsIdentity
            | Self::Cancelled => ErrorClass::LocalRejection,
            Self::Transport(_) => ErrorClass::Transport,
            Self::Engine { .. } | Self::Timeout => ErrorClass::Engine,
            Self::Expired { .. } => ErrorClass::Expired,
            Self::ProtocolViolation { .. } => ErrorClass::ProtocolViolation,
        }
    }

    pub(crate) fn from_terminal(snapshot: &StatusSnapshot) -> Self {
        match snapshot.status {
            StatusCode::Error => Self::Engine {
                reason: snapshot.reason_or("engine error"),
            },
            StatusCode::Expired => Self::Expired {
                reason: snapshot.reason_or("session expired"),
            },
            _ => Self::ProtocolViolation {
                status: snapshot.status.to_string(),
            },
        }
    }
}

/// The client's view of the single open document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub current_file: Option<PathBuf>,
    pub dirty: bool,
    pub needs_identity: bool,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.current_file.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    AwaitingAck,
    Polling,
}

/// A long-running command between dispatch and its terminal outcome.
#[derive(Debug, Clone)]
pub struct Operation {
    pub op_id: u64,
    pub spec: &'static CommandSpec,
    pub command: EngineCommand,
    pub family: StatusFamily,
    pub poll_command: &'static str,
    pub interval: Duration,
    pub phase: OperationPhase,
    pub polls: u32,
}

#[derive(Debug, Clone)]
pub struct PendingImmediate {
    pub spec: &'static CommandSpec,
    pub command: EngineCommand,
    /// Gated action to resume once this command succeeds.
    pub then: Option<GateAction>,
}

/// Document actions that have to pass the unsaved-changes gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    Close { op_id: u64 },
    Create { op_id: u64, payload: Payload },
    Open { op_id: u64, path: PathBuf },
    Quit { op_id: u64 },
}

impl GateAction {
    pub fn op_id(&self) -> u64 {
        match self {
            Self::Close { op_id }
            | Self::Create { op_id, .. }
            | Self::Open { op_id, .. }
            | Self::Quit { op_id } => *op_id,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Close { .. } => crate::commands::CLOSE_FILE,
            Self::Create { .. } => crate::commands::CREATE_FILE,
            Self::Open { .. } => crate::commands::OPEN_FILE,
            Self::Quit { .. } => crate::commands::STOP,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Close { .. } => "close",
            Self::Create { .. } => "new document",
            Self::Open { .. } => "open",
            Self::Quit { .. } => "quit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateChoice {
    Discard,
    Cancel,
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    AwaitingChoice,
    AwaitingLocation,
    AwaitingSave { save_op_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGate {
    pub action: GateAction,
    pub phase: GatePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Dispatched,
    Rejected,
    Completed,
    Failed,
    Gate,
}

impl ActivityKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Gate => "gate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub op_id: u64,
    pub command: String,
    pub kind: ActivityKind,
    pub message: String,
}

impl ActivityEntry {
    pub fn new(
        op_id: u64,
        command: impl Into<String>,
        kind: ActivityKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            ts: Utc::now(),
            op_id,
            command: command.into(),
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityLog {
    cap: usize,
    next_seq: u64,
    buf: VecDeque<ActivityEntry>,
}

impl ActivityLog {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            next_seq: 1,
            buf: VecDeque::with_capacity(cap),
        }
    }

    pub fn append(&mut self, mut entry: ActivityEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;

        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(entry);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.next_seq = 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Everything the job controller owns: the session, at most one long-running
/// operation, in-flight immediate requests and a pending document gate.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub session: Session,
    pub operation: Option<Operation>,
    pub immediates: BTreeMap<u64, PendingImmediate>,
    pub gate: Option<PendingGate>,
    pub status_text: Option<String>,
    pub busy_depth: u32,
    pub poll_interval: Duration,
    pub activity: ActivityLog,
    next_op_id: u64,
}

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl Default for ControllerState {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, 500)
    }
}

impl ControllerState {
    pub fn new(poll_interval: Duration, activity_capacity: usize) -> Self {
        Self {
            session: Session::default(),
            operation: None,
            immediates: BTreeMap::new(),
            gate: None,
            status_text: None,
            busy_depth: 0,
            poll_interval,
            activity: ActivityLog::new(activity_capacity),
            next_op_id: 1,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.polling.interval(), config.activity.capacity)
    }

    pub fn allocate_op_id(&mut self) -> u64 {
        let op_id = self.next_op_id;
        self.next_op_id = self.next_op_id.saturating_add(1);
        op_id
    }

    pub fn is_busy(&self) -> bool {
        self.busy_depth > 0
    }

    pub fn has_active_operation(&self) -> bool {
        self.operation.is_some()
    }

    pub fn awaiting_gate_choice(&self) -> bool {
        matches!(
            self.gate,
            Some(PendingGate {
                phase: GatePhase::AwaitingChoice,
                ..
            })
        )
    }
}
