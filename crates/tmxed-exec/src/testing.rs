use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use tmxed_core::EngineCommand;
use tmxed_core::StatusCode;
use tmxed_core::StatusSnapshot;

use crate::channel::Channel;
use crate::error::ChannelError;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Snapshot(StatusSnapshot),
    Refused,
}

/// In-memory engine: replies are queued per command name and the last reply
/// of a queue repeats forever.
#[derive(Debug, Default)]
pub(crate) struct ScriptedChannel {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<EngineCommand>>,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(&self, command: &str, snapshot: StatusSnapshot) -> &Self {
        self.push(command, Reply::Snapshot(snapshot))
    }

    pub(crate) fn status(&self, command: &str, status: StatusCode) -> &Self {
        self.reply(command, StatusSnapshot::new(status))
    }

    pub(crate) fn refuse(&self, command: &str) -> &Self {
        self.push(command, Reply::Refused)
    }

    fn push(&self, command: &str, reply: Reply) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|command| command.name.clone())
            .collect()
    }

    pub(crate) fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|call| *call == name).count()
    }

    pub(crate) fn last_call(&self, name: &str) -> Option<EngineCommand> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|command| command.name == name)
            .cloned()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn send(&self, command: &EngineCommand) -> Result<StatusSnapshot, ChannelError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());

        let reply = {
            let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = replies.get_mut(&command.name);
            match queue {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match reply {
            Some(Reply::Snapshot(snapshot)) => Ok(snapshot),
            Some(Reply::Refused) => Err(ChannelError::Connect {
                endpoint: "scripted".to_string(),
                message: "connection refused".to_string(),
            }),
            None => Err(ChannelError::Decode(format!(
                "no scripted reply for {}",
                command.name
            ))),
        }
    }
}
