use serde::Deserialize;
use serde::Serialize;
use tmxed_core::EngineCommand;
use tmxed_core::Payload;
use tmxed_core::StatusSnapshot;

use crate::error::ChannelError;

/// Wire shape of a request: `{"command": <name>, ...args}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineRequest {
    pub command: String,
    #[serde(flatten)]
    pub args: Payload,
}

impl EngineRequest {
    pub fn from_command(command: &EngineCommand) -> Self {
        let mut args = command.payload.clone();
        // The command name always wins over a stray argument of the same key.
        if args.remove("command").is_some() {
            tracing::warn!(command = %command.name, "dropping 'command' key from arguments");
        }
        Self {
            command: command.name.clone(),
            args,
        }
    }
}

pub fn encode_request(command: &EngineCommand) -> Result<String, ChannelError> {
    serde_json::to_string(&EngineRequest::from_command(command))
        .map_err(|err| ChannelError::Encode(err.to_string()))
}

pub fn decode_response(body: &str) -> Result<StatusSnapshot, ChannelError> {
    serde_json::from_str(body).map_err(|err| {
        let excerpt: String = body.chars().take(200).collect();
        ChannelError::Decode(format!("{err}; body: {excerpt}"))
    })
}

/// Fields of a `systemInfo` reply the launcher and CLI care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub version: Option<String>,
    pub build: Option<String>,
}

impl SystemInfo {
    pub fn from_payload(payload: &Payload) -> Self {
        serde_json::from_value(serde_json::Value::Object(payload.clone())).unwrap_or_default()
    }
}
