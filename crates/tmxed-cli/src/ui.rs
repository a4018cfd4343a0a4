use std::fmt::Display;

use crossterm::style::Stylize;
use tmxed_core::ActivityEntry;
use tmxed_core::Notification;
use tmxed_core::OperationOutcome;
use tmxed_core::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub stream: Stream,
    pub text: String,
}

impl Line {
    fn out(text: impl Display) -> Self {
        Self {
            stream: Stream::Stdout,
            text: text.to_string(),
        }
    }

    fn err(text: impl Display) -> Self {
        Self {
            stream: Stream::Stderr,
            text: text.to_string(),
        }
    }
}

pub fn render(notification: &Notification, verbose: bool) -> Option<Line> {
    match notification {
        Notification::BusyStart if verbose => Some(Line::out("busy".dim())),
        Notification::BusyEnd if verbose => Some(Line::out("idle".dim())),
        Notification::BusyStart | Notification::BusyEnd | Notification::StatusCleared => None,
        Notification::StatusText(text) => Some(Line::out(format!("  {text}").dim())),
        Notification::OperationResult {
            command, outcome, ..
        } => render_result(command, outcome, verbose),
        Notification::DirtyChanged(true) => Some(Line::out("document has unsaved changes".yellow())),
        Notification::DirtyChanged(false) => verbose.then(|| Line::out("document is clean".dim())),
        Notification::DocumentChanged(Some(path)) => {
            Some(Line::out(format!("document: {}", path.display()).bold()))
        }
        Notification::DocumentChanged(None) => verbose.then(|| Line::out("document closed".dim())),
        Notification::ShowError { class, message } => Some(Line::err(format!(
            "{} {message}",
            format!("error[{}]:", class.label()).red().bold()
        ))),
        Notification::ShowWarning(message) => {
            Some(Line::err(format!("{} {message}", "warning:".yellow().bold())))
        }
        Notification::ChooseSaveLocation => Some(Line::err(format!(
            "{} this document has no location yet, pass --save-as <path>",
            "warning:".yellow().bold()
        ))),
        Notification::ConfirmDiscard { action } => Some(Line::err(format!(
            "{} unsaved changes will be discarded by {action}",
            "warning:".yellow().bold()
        ))),
    }
}

fn render_result(command: &str, outcome: &OperationOutcome, verbose: bool) -> Option<Line> {
    match outcome {
        Ok(_) => Some(Line::out(format!("{} {command}", "done".green().bold()))),
        // Failures already surfaced through ShowError / ShowWarning.
        Err(err) if verbose => Some(Line::err(format!("{} {command}: {err}", "failed".red()))),
        Err(_) => None,
    }
}

pub fn emit(notification: &Notification, verbose: bool) {
    if let Some(line) = render(notification, verbose) {
        match line.stream {
            Stream::Stdout => println!("{}", line.text),
            Stream::Stderr => eprintln!("{}", line.text),
        }
    }
}

/// Prints the data of a successful command, if it returned any.
pub fn print_result(command: &str, data: &Payload) {
    if data.is_empty() {
        return;
    }
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{json}"),
        Err(err) => tracing::warn!(command, %err, "cannot render result"),
    }
}

pub fn format_activity(entry: &ActivityEntry) -> String {
    format!(
        "{:>4} {} {:<10} #{:<4} {} {}",
        entry.seq,
        entry.ts.format("%H:%M:%S%.3f"),
        entry.kind.label(),
        entry.op_id,
        entry.command,
        entry.message
    )
}

pub fn print_activity(entries: &[ActivityEntry]) {
    if entries.is_empty() {
        return;
    }
    eprintln!("{}", "activity:".bold());
    for entry in entries {
        eprintln!("{}", format_activity(entry));
    }
}
