use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use super::actions::ControllerAction;
use super::actions::EngineEvent;
use super::actions::UserAction;
use super::commands::validate_arguments;
use super::commands::CommandRegistry;
use super::commands::CommandSpec;
use super::commands::SessionEffect;
use super::commands::CLOSE_FILE;
use super::commands::CREATE_FILE;
use super::commands::OPEN_FILE;
use super::commands::SAVE_FILE;
use super::commands::STOP;
use super::state::ActivityEntry;
use super::state::ActivityKind;
use super::state::ControllerState;
use super::state::EngineCommand;
use super::state::ErrorClass;
use super::state::GateAction;
use super::state::GateChoice;
use super::state::GatePhase;
use super::state::JobError;
use super::state::Operation;
use super::state::OperationOutcome;
use super::state::OperationPhase;
use super::state::Payload;
use super::state::PendingGate;
use super::state::PendingImmediate;
use super::state::StatusCode;
use super::state::StatusSnapshot;

/// Presentation-facing side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BusyStart,
    BusyEnd,
    StatusText(String),
    StatusCleared,
    OperationResult {
        op_id: u64,
        command: String,
        outcome: OperationOutcome,
    },
    DirtyChanged(bool),
    DocumentChanged(Option<PathBuf>),
    ShowError {
        class: ErrorClass,
        message: String,
    },
    ShowWarning(String),
    ChooseSaveLocation,
    ConfirmDiscard {
        action: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEffect {
    /// One channel round trip whose result comes back as `EngineEvent::Response`
    /// (or `TransportFailed`) for the same op id.
    Send {
        op_id: u64,
        command: EngineCommand,
    },
    /// Wait `interval`, then send `command` for the active operation.
    SchedulePoll {
        op_id: u64,
        command: EngineCommand,
        interval: Duration,
    },
    Notify(Notification),
    /// Emitted exactly once per op id.
    Terminal {
        op_id: u64,
        outcome: OperationOutcome,
    },
}

pub fn reduce(state: &mut ControllerState, action: ControllerAction) -> Vec<JobEffect> {
    let mut effects = Vec::new();
    match action {
        ControllerAction::User(user) => reduce_user(state, user, &mut effects),
        ControllerAction::Engine(event) => reduce_engine(state, event, &mut effects),
    }
    effects
}

fn reduce_user(state: &mut ControllerState, action: UserAction, effects: &mut Vec<JobEffect>) {
    match action {
        UserAction::Dispatch {
            op_id,
            name,
            payload,
        } => dispatch(state, op_id, name, payload, effects),
        UserAction::RequestSave { op_id, path } => request_save(state, op_id, path, effects),
        UserAction::RequestClose { op_id } => begin_gate(state, GateAction::Close { op_id }, effects),
        UserAction::RequestCreate { op_id, payload } => {
            begin_gate(state, GateAction::Create { op_id, payload }, effects)
        }
        UserAction::RequestOpen { op_id, path } => {
            begin_gate(state, GateAction::Open { op_id, path }, effects)
        }
        UserAction::RequestQuit { op_id } => begin_gate(state, GateAction::Quit { op_id }, effects),
        UserAction::ResolveGate(choice) => resolve_gate(state, choice, effects),
    }
}

fn dispatch(
    state: &mut ControllerState,
    op_id: u64,
    name: String,
    payload: Payload,
    effects: &mut Vec<JobEffect>,
) {
    // Document lifecycle commands always go through their gates.
    match name.as_str() {
        OPEN_FILE => {
            let path = payload
                .get("file")
                .and_then(serde_json::Value::as_str)
                .map(PathBuf::from)
                .unwrap_or_default();
            return begin_gate(state, GateAction::Open { op_id, path }, effects);
        }
        SAVE_FILE => {
            let path = payload
                .get("file")
                .and_then(serde_json::Value::as_str)
                .map(PathBuf::from);
            return request_save(state, op_id, path, effects);
        }
        CLOSE_FILE => return begin_gate(state, GateAction::Close { op_id }, effects),
        CREATE_FILE => return begin_gate(state, GateAction::Create { op_id, payload }, effects),
        STOP => return begin_gate(state, GateAction::Quit { op_id }, effects),
        _ => {}
    }

    if state.awaiting_gate_choice() {
        return reject(state, op_id, &name, JobError::GatePending, effects);
    }
    let Some(spec) = CommandRegistry::get(&name) else {
        let err = JobError::UnknownCommand(name.clone());
        return reject(state, op_id, &name, err, effects);
    };
    start_command(state, op_id, spec, payload, None, effects);
}

fn request_save(
    state: &mut ControllerState,
    op_id: u64,
    path: Option<PathBuf>,
    effects: &mut Vec<JobEffect>,
) {
    if state.awaiting_gate_choice() {
        return reject(state, op_id, SAVE_FILE, JobError::GatePending, effects);
    }
    if !state.session.is_open() {
        return reject(state, op_id, SAVE_FILE, JobError::NoDocument, effects);
    }

    let Some(path) = path.or_else(|| {
        if state.session.needs_identity {
            None
        } else {
            state.session.current_file.clone()
        }
    }) else {
        // A brand-new document has no location yet; ask for one instead.
        effects.push(JobEffect::Notify(Notification::ChooseSaveLocation));
        record(state, op_id, SAVE_FILE, ActivityKind::Rejected, "location required");
        return finish_local(op_id, SAVE_FILE, Err(JobError::NeedsIdentity), effects);
    };

    let spec = CommandRegistry::builtin(SAVE_FILE);
    if start_command(state, op_id, spec, file_payload(&path), None, effects) {
        if let Some(gate) = state.gate.as_mut() {
            if gate.phase == GatePhase::AwaitingLocation {
                gate.phase = GatePhase::AwaitingSave { save_op_id: op_id };
            }
        }
    }
}

fn begin_gate(state: &mut ControllerState, action: GateAction, effects: &mut Vec<JobEffect>) {
    let op_id = action.op_id();
    let command = action.command_name();
    if state.gate.is_some() {
        return reject(state, op_id, command, JobError::GatePending, effects);
    }
    if state.has_active_operation() {
        return reject(state, op_id, command, JobError::Busy, effects);
    }
    // Bad arguments must not close the current document on the way.
    let spec = CommandRegistry::builtin(command);
    if let Err(message) = validate_arguments(spec, &gate_payload(&action)) {
        return reject(state, op_id, command, JobError::InvalidArguments(message), effects);
    }
    if state.session.dirty {
        effects.push(JobEffect::Notify(Notification::ConfirmDiscard {
            action: action.label(),
        }));
        record(state, op_id, command, ActivityKind::Gate, "unsaved changes");
        state.gate = Some(PendingGate {
            action,
            phase: GatePhase::AwaitingChoice,
        });
        return;
    }
    proceed(state, action, effects);
}

/// Runs a gated action whose unsaved-changes check has passed. An open
/// document is closed first and the action resumes from the close result.
fn proceed(state: &mut ControllerState, action: GateAction, effects: &mut Vec<JobEffect>) {
    if state.session.is_open() && !matches!(action, GateAction::Close { .. }) {
        let close_op_id = state.allocate_op_id();
        let spec = CommandRegistry::builtin(CLOSE_FILE);
        if !start_command(state, close_op_id, spec, Payload::new(), Some(action.clone()), effects) {
            finish_local(
                action.op_id(),
                action.command_name(),
                Err(JobError::Cancelled),
                effects,
            );
        }
        return;
    }

    let spec = CommandRegistry::builtin(action.command_name());
    let payload = gate_payload(&action);
    start_command(state, action.op_id(), spec, payload, None, effects);
}

fn gate_payload(action: &GateAction) -> Payload {
    match action {
        GateAction::Create { payload, .. } => payload.clone(),
        GateAction::Open { path, .. } => file_payload(path),
        GateAction::Close { .. } | GateAction::Quit { .. } => Payload::new(),
    }
}

fn resolve_gate(state: &mut ControllerState, choice: GateChoice, effects: &mut Vec<JobEffect>) {
    let Some(gate) = state.gate.take() else {
        tracing::debug!(?choice, "no pending gate to resolve");
        return;
    };
    let op_id = gate.action.op_id();
    let command = gate.action.command_name();

    match (gate.phase, choice) {
        (_, GateChoice::Cancel) => {
            record(state, op_id, command, ActivityKind::Gate, "cancelled");
            finish_local(op_id, command, Err(JobError::Cancelled), effects);
        }
        (GatePhase::AwaitingChoice | GatePhase::AwaitingLocation, GateChoice::Discard) => {
            record(state, op_id, command, ActivityKind::Gate, "changes discarded");
            proceed(state, gate.action, effects);
        }
        (GatePhase::AwaitingChoice, GateChoice::Save) => {
            if state.session.needs_identity {
                effects.push(JobEffect::Notify(Notification::ChooseSaveLocation));
                state.gate = Some(PendingGate {
                    action: gate.action,
                    phase: GatePhase::AwaitingLocation,
                });
                return;
            }
            let save_op_id = state.allocate_op_id();
            let spec = CommandRegistry::builtin(SAVE_FILE);
            let payload = state
                .session
                .current_file
                .as_deref()
                .map(file_payload)
                .unwrap_or_default();
            if start_command(state, save_op_id, spec, payload, None, effects) {
                record(state, op_id, command, ActivityKind::Gate, "saving first");
                state.gate = Some(PendingGate {
                    action: gate.action,
                    phase: GatePhase::AwaitingSave { save_op_id },
                });
            } else {
                finish_local(op_id, command, Err(JobError::Cancelled), effects);
            }
        }
        (phase, _) => {
            state.gate = Some(PendingGate {
                action: gate.action,
                phase,
            });
        }
    }
}

/// Checks local preconditions and, when they hold, emits the first round trip.
/// Returns false when the command was rejected without touching the channel.
fn start_command(
    state: &mut ControllerState,
    op_id: u64,
    spec: &'static CommandSpec,
    payload: Payload,
    then: Option<GateAction>,
    effects: &mut Vec<JobEffect>,
) -> bool {
    if spec.requires_document && !state.session.is_open() {
        reject(state, op_id, spec.name, JobError::NoDocument, effects);
        return false;
    }
    if let Err(message) = validate_arguments(spec, &payload) {
        reject(state, op_id, spec.name, JobError::InvalidArguments(message), effects);
        return false;
    }
    if spec.is_long_running() && state.has_active_operation() {
        reject(state, op_id, spec.name, JobError::Busy, effects);
        return false;
    }
    // A save must not clear an edit the engine applied around it.
    if edits_race_save(state, spec) {
        reject(state, op_id, spec.name, JobError::Busy, effects);
        return false;
    }

    let command = EngineCommand::new(spec.name, payload);
    busy_start(state, effects);
    match spec.poll() {
        Some(poll) => {
            state.operation = Some(Operation {
                op_id,
                spec,
                command: command.clone(),
                family: poll.family,
                poll_command: poll.command,
                interval: state.poll_interval,
                phase: OperationPhase::AwaitingAck,
                polls: 0,
            });
            set_status(state, format!("{}...", spec.title), effects);
        }
        None => {
            state.immediates.insert(
                op_id,
                PendingImmediate {
                    spec,
                    command: command.clone(),
                    then,
                },
            );
        }
    }
    record(state, op_id, spec.name, ActivityKind::Dispatched, spec.title);
    effects.push(JobEffect::Send { op_id, command });
    true
}

fn edits_race_save(state: &ControllerState, spec: &CommandSpec) -> bool {
    let saving = |candidate: &CommandSpec| candidate.session_effect == SessionEffect::Save;
    if saving(spec) {
        return state.immediates.values().any(|pending| pending.spec.mutating);
    }
    spec.mutating
        && state
            .operation
            .as_ref()
            .is_some_and(|operation| saving(operation.spec))
}

fn reduce_engine(state: &mut ControllerState, event: EngineEvent, effects: &mut Vec<JobEffect>) {
    let op_id = event.op_id();
    if state
        .operation
        .as_ref()
        .is_some_and(|operation| operation.op_id == op_id)
    {
        return reduce_operation(state, event, effects);
    }
    if let Some(pending) = state.immediates.remove(&op_id) {
        let outcome = match event {
            EngineEvent::Response { snapshot, .. } if snapshot.status == StatusCode::Success => {
                Ok(snapshot.data)
            }
            EngineEvent::Response { snapshot, .. } => Err(JobError::from_terminal(&snapshot)),
            EngineEvent::TransportFailed { message, .. } => Err(JobError::Transport(message)),
            EngineEvent::TimedOut { .. } => Err(JobError::Timeout),
        };
        return finish_immediate(state, op_id, pending, outcome, effects);
    }
    tracing::debug!(op_id, "ignoring event for an operation that already ended");
}

fn reduce_operation(state: &mut ControllerState, event: EngineEvent, effects: &mut Vec<JobEffect>) {
    let snapshot = match event {
        EngineEvent::Response { snapshot, .. } => snapshot,
        EngineEvent::TransportFailed { message, .. } => {
            return finish_operation(state, Err(JobError::Transport(message)), effects);
        }
        EngineEvent::TimedOut { .. } => {
            return finish_operation(state, Err(JobError::Timeout), effects);
        }
    };
    let Some(operation) = state.operation.as_mut() else {
        return;
    };

    let keep_polling = match operation.phase {
        OperationPhase::AwaitingAck => {
            // The first reply is never Completed in this protocol.
            snapshot.status == StatusCode::Success || operation.family.accepts(&snapshot.status)
        }
        OperationPhase::Polling => {
            operation.polls = operation.polls.saturating_add(1);
            snapshot.status == StatusCode::Success || operation.family.accepts(&snapshot.status)
        }
    };

    if keep_polling {
        operation.phase = OperationPhase::Polling;
        let op_id = operation.op_id;
        let interval = operation.interval;
        let poll = EngineCommand::bare(operation.poll_command);
        if snapshot.status != StatusCode::Success {
            update_progress(state, &snapshot, effects);
        }
        effects.push(JobEffect::SchedulePoll {
            op_id,
            command: poll,
            interval,
        });
        return;
    }

    let outcome = match (operation.phase, &snapshot.status) {
        (OperationPhase::Polling, StatusCode::Completed) => Ok(snapshot.data),
        (_, StatusCode::Error | StatusCode::Expired) => Err(JobError::from_terminal(&snapshot)),
        (_, status) => {
            tracing::warn!(
                command = operation.spec.name,
                %status,
                "unexpected status, failing closed"
            );
            Err(JobError::ProtocolViolation {
                status: status.to_string(),
            })
        }
    };
    finish_operation(state, outcome, effects);
}

fn update_progress(
    state: &mut ControllerState,
    snapshot: &StatusSnapshot,
    effects: &mut Vec<JobEffect>,
) {
    let Some(operation) = state.operation.as_ref() else {
        return;
    };
    let Some(poll) = operation.spec.poll() else {
        return;
    };
    let text = match snapshot.data.get(poll.progress_key) {
        Some(serde_json::Value::Number(count)) => format!("{} {count} units", poll.progress_key),
        _ => format!("{}...", operation.spec.title),
    };
    set_status(state, text, effects);
}

fn finish_operation(
    state: &mut ControllerState,
    outcome: OperationOutcome,
    effects: &mut Vec<JobEffect>,
) {
    let Some(operation) = state.operation.take() else {
        return;
    };
    clear_status(state, effects);
    busy_end(state, effects);
    apply_outcome(state, operation.op_id, operation.spec, &operation.command, &outcome, effects);

    let resumes = match &state.gate {
        Some(PendingGate {
            phase: GatePhase::AwaitingSave { save_op_id },
            ..
        }) => *save_op_id == operation.op_id,
        _ => false,
    };
    let follow_up = if resumes {
        state.gate.take().map(|gate| gate.action)
    } else {
        None
    };
    finish_local(operation.op_id, operation.spec.name, outcome.clone(), effects);
    if let Some(action) = follow_up {
        continue_with(state, action, outcome, effects);
    }
}

fn finish_immediate(
    state: &mut ControllerState,
    op_id: u64,
    pending: PendingImmediate,
    outcome: OperationOutcome,
    effects: &mut Vec<JobEffect>,
) {
    busy_end(state, effects);
    apply_outcome(state, op_id, pending.spec, &pending.command, &outcome, effects);
    finish_local(op_id, pending.spec.name, outcome.clone(), effects);
    if let Some(action) = pending.then {
        continue_with(state, action, outcome, effects);
    }
}

fn continue_with(
    state: &mut ControllerState,
    action: GateAction,
    outcome: OperationOutcome,
    effects: &mut Vec<JobEffect>,
) {
    match outcome {
        Ok(_) => proceed(state, action, effects),
        Err(err) => {
            let op_id = action.op_id();
            let command = action.command_name();
            record(state, op_id, command, ActivityKind::Failed, err.to_string());
            finish_local(op_id, command, Err(err), effects);
        }
    }
}

/// Session mutation, error surfacing and bookkeeping shared by both kinds.
fn apply_outcome(
    state: &mut ControllerState,
    op_id: u64,
    spec: &'static CommandSpec,
    command: &EngineCommand,
    outcome: &OperationOutcome,
    effects: &mut Vec<JobEffect>,
) {
    match outcome {
        Ok(data) => {
            apply_session_effect(state, spec, command, data, effects);
            if spec.mutating {
                set_dirty(state, true, effects);
            }
            record(state, op_id, spec.name, ActivityKind::Completed, spec.title);
        }
        Err(err) => {
            effects.push(JobEffect::Notify(Notification::ShowError {
                class: err.class(),
                message: err.to_string(),
            }));
            record(state, op_id, spec.name, ActivityKind::Failed, err.to_string());
        }
    }
}

fn apply_session_effect(
    state: &mut ControllerState,
    spec: &CommandSpec,
    command: &EngineCommand,
    data: &Payload,
    effects: &mut Vec<JobEffect>,
) {
    let file_arg = |payload: &Payload| {
        payload
            .get("file")
            .and_then(serde_json::Value::as_str)
            .map(PathBuf::from)
    };
    match spec.session_effect {
        SessionEffect::None => {}
        SessionEffect::Open => {
            set_dirty(state, false, effects);
            state.session.needs_identity = false;
            set_document(state, file_arg(&command.payload), effects);
        }
        SessionEffect::Save => {
            set_dirty(state, false, effects);
            state.session.needs_identity = false;
            if let Some(path) = file_arg(&command.payload) {
                set_document(state, Some(path), effects);
            }
        }
        SessionEffect::Create => {
            let path = file_arg(data)
                .or_else(|| file_arg(&command.payload))
                .unwrap_or_else(|| PathBuf::from("Untitled.tmx"));
            set_dirty(state, false, effects);
            state.session.needs_identity = true;
            set_document(state, Some(path), effects);
        }
        SessionEffect::Close => {
            set_dirty(state, false, effects);
            state.session.needs_identity = false;
            set_document(state, None, effects);
        }
    }
}

fn file_payload(path: &Path) -> Payload {
    let mut payload = Payload::new();
    payload.insert(
        "file".to_string(),
        serde_json::Value::String(path.to_string_lossy().into_owned()),
    );
    payload
}

fn set_document(state: &mut ControllerState, path: Option<PathBuf>, effects: &mut Vec<JobEffect>) {
    if state.session.current_file != path {
        state.session.current_file = path.clone();
        effects.push(JobEffect::Notify(Notification::DocumentChanged(path)));
    }
}

fn set_dirty(state: &mut ControllerState, dirty: bool, effects: &mut Vec<JobEffect>) {
    if state.session.dirty != dirty {
        state.session.dirty = dirty;
        effects.push(JobEffect::Notify(Notification::DirtyChanged(dirty)));
    }
}

fn set_status(state: &mut ControllerState, text: String, effects: &mut Vec<JobEffect>) {
    if state.status_text.as_deref() != Some(text.as_str()) {
        state.status_text = Some(text.clone());
        effects.push(JobEffect::Notify(Notification::StatusText(text)));
    }
}

fn clear_status(state: &mut ControllerState, effects: &mut Vec<JobEffect>) {
    state.status_text = None;
    effects.push(JobEffect::Notify(Notification::StatusCleared));
}

fn busy_start(state: &mut ControllerState, effects: &mut Vec<JobEffect>) {
    state.busy_depth += 1;
    if state.busy_depth == 1 {
        effects.push(JobEffect::Notify(Notification::BusyStart));
    }
}

fn busy_end(state: &mut ControllerState, effects: &mut Vec<JobEffect>) {
    if state.busy_depth == 0 {
        return;
    }
    state.busy_depth -= 1;
    if state.busy_depth == 0 {
        effects.push(JobEffect::Notify(Notification::BusyEnd));
    }
}

fn reject(
    state: &mut ControllerState,
    op_id: u64,
    command: &str,
    err: JobError,
    effects: &mut Vec<JobEffect>,
) {
    tracing::debug!(op_id, command, %err, "rejected locally");
    effects.push(JobEffect::Notify(Notification::ShowWarning(err.to_string())));
    record(state, op_id, command, ActivityKind::Rejected, err.to_string());
    finish_local(op_id, command, Err(err), effects);
}

fn finish_local(op_id: u64, command: &str, outcome: OperationOutcome, effects: &mut Vec<JobEffect>) {
    effects.push(JobEffect::Notify(Notification::OperationResult {
        op_id,
        command: command.to_string(),
        outcome: outcome.clone(),
    }));
    effects.push(JobEffect::Terminal { op_id, outcome });
}

fn record(
    state: &mut ControllerState,
    op_id: u64,
    command: &str,
    kind: ActivityKind,
    message: impl Into<String>,
) {
    state
        .activity
        .append(ActivityEntry::new(op_id, command, kind, message));
}

#[cfg(test)]
mod tests;
