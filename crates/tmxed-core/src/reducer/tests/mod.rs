use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;

pub(super) use super::reduce;
pub(super) use super::JobEffect;
pub(super) use super::Notification;
pub(super) use crate::actions::ControllerAction;
pub(super) use crate::actions::EngineEvent;
pub(super) use crate::actions::UserAction;
pub(super) use crate::state::ActivityKind;
pub(super) use crate::state::ActivityLog;
pub(super) use crate::state::ControllerState;
pub(super) use crate::state::EngineCommand;
pub(super) use crate::state::ErrorClass;
pub(super) use crate::state::GateChoice;
pub(super) use crate::state::GatePhase;
pub(super) use crate::state::JobError;
pub(super) use crate::state::OperationOutcome;
pub(super) use crate::state::Payload;
pub(super) use crate::state::StatusCode;
pub(super) use crate::state::StatusSnapshot;


fn state() -> ControllerState {
    ControllerState::new(Duration::from_millis(500), 50)
}

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

fn user(state: &mut ControllerState, action: UserAction) -> Vec<JobEffect> {
    reduce(state, ControllerAction::User(action))
}

fn dispatch(
    state: &mut ControllerState,
    name: &str,
    args: serde_json::Value,
) -> (u64, Vec<JobEffect>) {
    let op_id = state.allocate_op_id();
    let effects = user(
        state,
        UserAction::Dispatch {
            op_id,
            name: name.to_string(),
            payload: payload(args),
        },
    );
    (op_id, effects)
}

fn respond(state: &mut ControllerState, op_id: u64, snapshot: StatusSnapshot) -> Vec<JobEffect> {
    reduce(
        state,
        ControllerAction::Engine(EngineEvent::Response { op_id, snapshot }),
    )
}

fn status(code: StatusCode) -> StatusSnapshot {
    StatusSnapshot::new(code)
}

fn notifications(effects: &[JobEffect]) -> Vec<Notification> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            JobEffect::Notify(notification) => Some(notification.clone()),
            _ => None,
        })
        .collect()
}

fn sends(effects: &[JobEffect]) -> Vec<(u64, String)> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            JobEffect::Send { op_id, command } => Some((*op_id, command.name.clone())),
            _ => None,
        })
        .collect()
}

fn polls(effects: &[JobEffect]) -> Vec<EngineCommand> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            JobEffect::SchedulePoll { command, .. } => Some(command.clone()),
            _ => None,
        })
        .collect()
}

fn terminals(effects: &[JobEffect]) -> Vec<(u64, OperationOutcome)> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            JobEffect::Terminal { op_id, outcome } => Some((*op_id, outcome.clone())),
            _ => None,
        })
        .collect()
}

fn count(effects: &[JobEffect], wanted: &Notification) -> usize {
    notifications(effects)
        .iter()
        .filter(|notification| *notification == wanted)
        .count()
}

/// Drives openFile through ack and one Completed poll.
fn open_document(state: &mut ControllerState, file: &str) {
    let (op_id, effects) = dispatch(state, "openFile", serde_json::json!({ "file": file }));
    assert_eq!(sends(&effects), vec![(op_id, "openFile".to_string())]);
    respond(state, op_id, status(StatusCode::Loading));
    let effects = respond(state, op_id, status(StatusCode::Completed));
    assert!(matches!(terminals(&effects).as_slice(), [(id, Ok(_))] if *id == op_id));
    assert_eq!(state.session.current_file, Some(PathBuf::from(file)));
}

/// Runs an immediate command to a Success reply and returns the effects of
/// both steps.
fn run_immediate(
    state: &mut ControllerState,
    name: &str,
    args: serde_json::Value,
) -> Vec<JobEffect> {
    let (op_id, mut effects) = dispatch(state, name, args);
    effects.extend(respond(state, op_id, status(StatusCode::Success)));
    effects
}

fn assert_idle(state: &ControllerState) {
    assert!(state.operation.is_none());
    assert!(state.immediates.is_empty());
    assert!(!state.is_busy());
    assert_eq!(state.status_text, None);
}
