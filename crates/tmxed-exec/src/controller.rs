use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tmxed_core::reduce;
use tmxed_core::ActivityEntry;
use tmxed_core::Config;
use tmxed_core::ControllerAction;
use tmxed_core::ControllerState;
use tmxed_core::EngineCommand;
use tmxed_core::EngineEvent;
use tmxed_core::GateChoice;
use tmxed_core::JobEffect;
use tmxed_core::JobError;
use tmxed_core::Notification;
use tmxed_core::OperationOutcome;
use tmxed_core::Payload;
use tmxed_core::Session;
use tmxed_core::UserAction;

use crate::channel::Channel;

/// Drives the protocol reducer against a live [`Channel`].
///
/// Every user call reduces synchronously under one lock and interprets the
/// resulting effects before releasing it, so notifications keep reducer order.
/// Channel round trips and poll timers run as spawned tasks that feed their
/// results back through the same path; calls must come from inside a tokio
/// runtime.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn Channel>,
    core: Mutex<Core>,
    notifications: mpsc::UnboundedSender<Notification>,
    max_duration: Option<Duration>,
}

struct Core {
    state: ControllerState,
    waiters: HashMap<u64, oneshot::Sender<OperationOutcome>>,
    poll_started: HashMap<u64, Instant>,
}

/// Resolves with the terminal outcome of one request. Dropping it does not
/// cancel the engine work; the operation still runs to completion.
#[derive(Debug)]
pub struct OperationHandle {
    op_id: u64,
    rx: oneshot::Receiver<OperationOutcome>,
}

impl OperationHandle {
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub async fn outcome(self) -> OperationOutcome {
        self.rx.await.unwrap_or(Err(JobError::Cancelled))
    }
}

impl JobController {
    pub fn new(
        channel: Arc<dyn Channel>,
        config: &Config,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            channel,
            core: Mutex::new(Core {
                state: ControllerState::from_config(config),
                waiters: HashMap::new(),
                poll_started: HashMap::new(),
            }),
            notifications: tx,
            max_duration: config.polling.max_duration(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn dispatch(&self, name: &str, payload: Payload) -> OperationHandle {
        let name = name.to_string();
        self.submit(|op_id| UserAction::Dispatch {
            op_id,
            name,
            payload,
        })
    }

    pub async fn run(&self, name: &str, payload: Payload) -> OperationOutcome {
        self.dispatch(name, payload).outcome().await
    }

    /// Saves the open document, to `path` when given ("save as").
    pub fn save(&self, path: Option<PathBuf>) -> OperationHandle {
        self.submit(|op_id| UserAction::RequestSave { op_id, path })
    }

    pub fn open(&self, path: PathBuf) -> OperationHandle {
        self.submit(|op_id| UserAction::RequestOpen { op_id, path })
    }

    pub fn create(&self, payload: Payload) -> OperationHandle {
        self.submit(|op_id| UserAction::RequestCreate { op_id, payload })
    }

    pub fn close(&self) -> OperationHandle {
        self.submit(|op_id| UserAction::RequestClose { op_id })
    }

    pub fn quit(&self) -> OperationHandle {
        self.submit(|op_id| UserAction::RequestQuit { op_id })
    }

    pub fn resolve_gate(&self, choice: GateChoice) {
        self.step(ControllerAction::User(UserAction::ResolveGate(choice)));
    }

    pub fn session(&self) -> Session {
        self.lock().state.session.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().state.is_busy()
    }

    pub fn has_pending_gate(&self) -> bool {
        self.lock().state.gate.is_some()
    }

    pub fn awaiting_gate_choice(&self) -> bool {
        self.lock().state.awaiting_gate_choice()
    }

    pub fn status_text(&self) -> Option<String> {
        self.lock().state.status_text.clone()
    }

    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.lock().state.activity.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, build: impl FnOnce(u64) -> UserAction) -> OperationHandle {
        let mut core = self.lock();
        let op_id = core.state.allocate_op_id();
        let (tx, rx) = oneshot::channel();
        core.waiters.insert(op_id, tx);
        let effects = reduce(&mut core.state, ControllerAction::User(build(op_id)));
        self.apply(&mut core, effects);
        OperationHandle { op_id, rx }
    }

    fn step(&self, action: ControllerAction) {
        let mut core = self.lock();
        let effects = reduce(&mut core.state, action);
        self.apply(&mut core, effects);
    }

    fn apply(&self, core: &mut Core, effects: Vec<JobEffect>) {
        for effect in effects {
            match effect {
                JobEffect::Send { op_id, command } => self.spawn_round_trip(op_id, command),
                JobEffect::SchedulePoll {
                    op_id,
                    command,
                    interval,
                } => {
                    let started = *core.poll_started.entry(op_id).or_insert_with(Instant::now);
                    let deadline = self.inner.max_duration.map(|max| started + max);
                    self.spawn_poll(op_id, command, interval, deadline);
                }
                JobEffect::Notify(notification) => {
                    // A dropped receiver only means nobody is rendering.
                    let _ = self.inner.notifications.send(notification);
                }
                JobEffect::Terminal { op_id, outcome } => {
                    core.poll_started.remove(&op_id);
                    match &outcome {
                        Ok(_) => tracing::info!(op_id, "operation completed"),
                        Err(err) => tracing::info!(op_id, %err, "operation failed"),
                    }
                    if let Some(waiter) = core.waiters.remove(&op_id) {
                        let _ = waiter.send(outcome);
                    }
                }
            }
        }
    }

    fn spawn_round_trip(&self, op_id: u64, command: EngineCommand) {
        let controller = self.clone();
        tokio::spawn(async move {
            let event = controller.round_trip(op_id, &command).await;
            controller.step(ControllerAction::Engine(event));
        });
    }

    fn spawn_poll(
        &self,
        op_id: u64,
        command: EngineCommand,
        interval: Duration,
        deadline: Option<Instant>,
    ) {
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            let event = if expired {
                tracing::warn!(op_id, poll = %command.name, "operation exceeded its time limit");
                EngineEvent::TimedOut { op_id }
            } else {
                controller.round_trip(op_id, &command).await
            };
            controller.step(ControllerAction::Engine(event));
        });
    }

    async fn round_trip(&self, op_id: u64, command: &EngineCommand) -> EngineEvent {
        match self.inner.channel.send(command).await {
            Ok(snapshot) => EngineEvent::Response { op_id, snapshot },
            Err(err) => {
                tracing::warn!(op_id, command = %command.name, %err, "channel failure");
                EngineEvent::TransportFailed {
                    op_id,
                    message: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tmxed_core::ErrorClass;
    use tmxed_core::StatusCode;
    use tmxed_core::StatusSnapshot;

    use super::*;
    use crate::testing::ScriptedChannel;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected a JSON object, got {other}"),
        }
    }

    fn controller(
        channel: &Arc<ScriptedChannel>,
    ) -> (JobController, mpsc::UnboundedReceiver<Notification>) {
        JobController::new(channel.clone(), &Config::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            out.push(notification);
        }
        out
    }

    fn loading(count: u64) -> StatusSnapshot {
        StatusSnapshot::new(StatusCode::Loading).with_field("Loaded", count)
    }

    async fn open_document(controller: &JobController, channel: &ScriptedChannel, file: &str) {
        channel
            .status("openFile", StatusCode::Loading)
            .status("loadingProgress", StatusCode::Completed);
        let outcome = controller.open(PathBuf::from(file)).outcome().await;
        assert!(outcome.is_ok(), "{outcome:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn open_file_runs_to_completion() {
        let channel = Arc::new(ScriptedChannel::new());
        channel
            .status("openFile", StatusCode::Loading)
            .reply("loadingProgress", loading(0))
            .reply("loadingProgress", loading(50))
            .reply("loadingProgress", loading(120))
            .reply(
                "loadingProgress",
                StatusSnapshot::new(StatusCode::Completed).with_field("count", 120),
            );
        let (controller, mut rx) = controller(&channel);

        let outcome = controller
            .run("openFile", payload(json!({"file": "sample.tmx"})))
            .await
            .expect("open succeeds");
        assert_eq!(outcome.get("count"), Some(&json!(120)));

        let session = controller.session();
        assert_eq!(session.current_file, Some(PathBuf::from("sample.tmx")));
        assert!(!session.dirty);
        assert!(!controller.is_busy());

        let notifications = drain(&mut rx);
        let busy_ends = notifications
            .iter()
            .filter(|n| **n == Notification::BusyEnd)
            .count();
        assert_eq!(busy_ends, 1);
        assert!(notifications.contains(&Notification::StatusText("Loaded 120 units".to_string())));
        assert_eq!(
            channel.calls(),
            vec![
                "openFile",
                "loadingProgress",
                "loadingProgress",
                "loadingProgress",
                "loadingProgress",
            ]
        );
        assert_eq!(
            channel
                .last_call("openFile")
                .and_then(|command| command.payload.get("file").cloned()),
            Some(json!("sample.tmx"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn split_during_open_is_busy_without_channel_call() {
        let channel = Arc::new(ScriptedChannel::new());
        channel
            .status("openFile", StatusCode::Loading)
            .reply("loadingProgress", loading(10))
            .reply("loadingProgress", loading(20))
            .status("loadingProgress", StatusCode::Completed);
        let (controller, _rx) = controller(&channel);

        let open = controller.dispatch("openFile", payload(json!({"file": "sample.tmx"})));
        let split = controller
            .run("splitFile", payload(json!({"file": "sample.tmx", "parts": 3})))
            .await;
        assert_eq!(split, Err(JobError::Busy));

        assert!(open.outcome().await.is_ok());
        assert_eq!(channel.call_count("splitFile"), 0);
        assert_eq!(
            controller.session().current_file,
            Some(PathBuf::from("sample.tmx"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_on_save_keeps_dirty() {
        let channel = Arc::new(ScriptedChannel::new());
        let (controller, mut rx) = controller(&channel);
        open_document(&controller, &channel, "memory.tmx").await;
        channel.status("deleteUnits", StatusCode::Success);
        controller
            .run("deleteUnits", payload(json!({"selected": ["tu3"]})))
            .await
            .expect("delete succeeds");
        assert!(controller.session().dirty);

        channel.refuse("saveFile");
        let err = controller
            .save(None)
            .outcome()
            .await
            .expect_err("save fails");
        assert_eq!(err.class(), ErrorClass::Transport);
        assert!(controller.session().dirty);
        assert_eq!(channel.call_count("savingProgress"), 0);
        assert!(!controller.is_busy());
        assert!(drain(&mut rx).iter().any(|n| matches!(
            n,
            Notification::ShowError {
                class: ErrorClass::Transport,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn new_document_save_requests_a_location() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.reply(
            "createFile",
            StatusSnapshot::new(StatusCode::Success).with_field("file", "/tmp/Untitled.tmx"),
        );
        let (controller, mut rx) = controller(&channel);

        controller
            .create(payload(json!({"srcLang": "en-US", "tgtLang": "es"})))
            .outcome()
            .await
            .expect("created");
        assert!(controller.session().needs_identity);
        drain(&mut rx);

        let outcome = controller.save(None).outcome().await;
        assert_eq!(outcome, Err(JobError::NeedsIdentity));
        assert_eq!(channel.call_count("saveFile"), 0);
        assert!(drain(&mut rx).contains(&Notification::ChooseSaveLocation));
    }

    #[tokio::test(start_paused = true)]
    async fn replace_text_error_surfaces_engine_reason() {
        let channel = Arc::new(ScriptedChannel::new());
        let (controller, mut rx) = controller(&channel);
        open_document(&controller, &channel, "memory.tmx").await;
        let before = controller.session();
        drain(&mut rx);

        channel
            .status("replaceText", StatusCode::Processing)
            .status("processingProgress", StatusCode::Processing)
            .reply(
                "processingProgress",
                StatusSnapshot::new(StatusCode::Error).with_reason("pattern invalid"),
            );
        let outcome = controller
            .run(
                "replaceText",
                payload(json!({"search": "[", "replace": "", "regExp": true})),
            )
            .await;
        assert_eq!(
            outcome,
            Err(JobError::Engine {
                reason: "pattern invalid".to_string()
            })
        );
        assert_eq!(controller.session(), before);
        assert!(!controller.is_busy());
        assert_eq!(controller.status_text(), None);

        let notifications = drain(&mut rx);
        assert!(notifications.contains(&Notification::ShowError {
            class: ErrorClass::Engine,
            message: "pattern invalid".to_string(),
        }));
        assert!(notifications.contains(&Notification::BusyEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_engine_times_out() {
        let channel = Arc::new(ScriptedChannel::new());
        channel
            .status("validateFile", StatusCode::Processing)
            .status("validatingProgress", StatusCode::Processing);
        let mut config = Config::default();
        config.polling.max_duration_secs = 2;
        let (controller, _rx) = JobController::new(channel.clone(), &config);

        let outcome = controller
            .run("validateFile", payload(json!({"file": "big.tmx"})))
            .await;
        assert_eq!(outcome, Err(JobError::Timeout));
        assert_eq!(channel.call_count("validatingProgress"), 3);
        assert!(!controller.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_still_applies_session_effects() {
        let channel = Arc::new(ScriptedChannel::new());
        channel
            .status("openFile", StatusCode::Loading)
            .status("loadingProgress", StatusCode::Completed);
        let (controller, mut rx) = controller(&channel);

        drop(controller.dispatch("openFile", payload(json!({"file": "late.tmx"}))));
        loop {
            match rx.recv().await {
                Some(Notification::OperationResult { .. }) => break,
                Some(_) => {}
                None => panic!("notification stream closed"),
            }
        }
        assert_eq!(
            controller.session().current_file,
            Some(PathBuf::from("late.tmx"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn save_then_close_through_the_gate() {
        let channel = Arc::new(ScriptedChannel::new());
        let (controller, mut rx) = controller(&channel);
        open_document(&controller, &channel, "memory.tmx").await;
        channel.status("setNotes", StatusCode::Success);
        controller
            .run("setNotes", payload(json!({"id": "tu1", "notes": ["checked"]})))
            .await
            .expect("notes saved");
        drain(&mut rx);

        let close = controller.close();
        assert_eq!(
            drain(&mut rx),
            vec![Notification::ConfirmDiscard { action: "close" }]
        );
        assert!(controller.awaiting_gate_choice());

        channel
            .status("saveFile", StatusCode::Saving)
            .status("savingProgress", StatusCode::Completed)
            .status("closeFile", StatusCode::Success);
        controller.resolve_gate(GateChoice::Save);

        assert!(close.outcome().await.is_ok());
        assert_eq!(controller.session(), Session::default());
        assert!(!controller.has_pending_gate());
        assert_eq!(
            channel.calls()[3..],
            ["saveFile", "savingProgress", "closeFile"]
        );
        assert_eq!(
            channel
                .last_call("saveFile")
                .and_then(|command| command.payload.get("file").cloned()),
            Some(json!("memory.tmx"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quit_closes_the_document_before_stopping() {
        let channel = Arc::new(ScriptedChannel::new());
        let (controller, _rx) = controller(&channel);
        open_document(&controller, &channel, "memory.tmx").await;
        channel
            .status("closeFile", StatusCode::Success)
            .status("stop", StatusCode::Success);

        assert!(controller.quit().outcome().await.is_ok());
        assert_eq!(channel.calls()[2..], ["closeFile", "stop"]);
        assert_eq!(controller.session(), Session::default());
        assert!(!controller.is_busy());
    }
}
