use std::path::PathBuf;

use super::state::GateChoice;
use super::state::Payload;
use super::state::StatusSnapshot;

#[derive(Debug, Clone)]
pub enum ControllerAction {
    User(UserAction),
    Engine(EngineEvent),
}

/// Requests coming from the presentation layer. Each one carries the op id
/// under which its final command will be reported.
#[derive(Debug, Clone)]
pub enum UserAction {
    Dispatch {
        op_id: u64,
        name: String,
        payload: Payload,
    },
    RequestSave {
        op_id: u64,
        path: Option<PathBuf>,
    },
    RequestClose {
        op_id: u64,
    },
    RequestCreate {
        op_id: u64,
        payload: Payload,
    },
    RequestOpen {
        op_id: u64,
        path: PathBuf,
    },
    RequestQuit {
        op_id: u64,
    },
    ResolveGate(GateChoice),
}

/// Results of channel round trips and timers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Response {
        op_id: u64,
        snapshot: StatusSnapshot,
    },
    TransportFailed {
        op_id: u64,
        message: String,
    },
    TimedOut {
        op_id: u64,
    },
}

impl EngineEvent {
    pub fn op_id(&self) -> u64 {
        match self {
            Self::Response { op_id, .. }
            | Self::TransportFailed { op_id, .. }
            | Self::TimedOut { op_id } => *op_id,
        }
    }
}
