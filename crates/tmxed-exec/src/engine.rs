use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tmxed_core::EngineCommand;
use tmxed_core::LaunchConfig;
use tmxed_core::StatusCode;
use tmxed_core::SYSTEM_INFO;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::contracts::SystemInfo;
use crate::error::EngineError;

const READY_RETRY: Duration = Duration::from_millis(250);

/// A locally spawned engine. The child is killed when this is dropped.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    info: SystemInfo,
}

impl EngineProcess {
    pub async fn launch(
        launch: &LaunchConfig,
        channel: &dyn Channel,
        startup_timeout: Duration,
    ) -> Result<Self, EngineError> {
        tracing::info!(program = %launch.program, "starting engine");
        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: PathBuf::from(&launch.program),
                source,
            })?;

        let deadline = Instant::now() + startup_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(EngineError::Exited { status });
            }
            let last_error = match probe(channel).await {
                Ok(info) => {
                    tracing::info!(version = ?info.version, "engine ready");
                    return Ok(Self { child, info });
                }
                Err(err) => err,
            };
            if Instant::now() + READY_RETRY > deadline {
                return Err(EngineError::NotReady {
                    timeout: startup_timeout,
                    last_error,
                });
            }
            tokio::time::sleep(READY_RETRY).await;
        }
    }

    pub fn info(&self) -> &SystemInfo {
        &self.info
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kills the engine if it is still running and reaps it.
    pub async fn shutdown(mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => tracing::debug!(%status, "engine already exited"),
            _ => {
                if let Err(err) = self.child.kill().await {
                    tracing::warn!(%err, "failed to stop engine");
                }
            }
        }
    }
}

/// Polls `systemInfo` until the engine answers `Success` or `timeout` passes.
pub async fn wait_until_ready(
    channel: &dyn Channel,
    timeout: Duration,
) -> Result<SystemInfo, EngineError> {
    let deadline = Instant::now() + timeout;
    loop {
        let last_error = match probe(channel).await {
            Ok(info) => return Ok(info),
            Err(err) => err,
        };
        if Instant::now() + READY_RETRY > deadline {
            return Err(EngineError::NotReady {
                timeout,
                last_error,
            });
        }
        tracing::trace!(%last_error, "engine not ready, retrying");
        tokio::time::sleep(READY_RETRY).await;
    }
}

async fn probe(channel: &dyn Channel) -> Result<SystemInfo, String> {
    let snapshot = channel
        .send(&EngineCommand::bare(SYSTEM_INFO))
        .await
        .map_err(|err| err.to_string())?;
    match &snapshot.status {
        StatusCode::Success => Ok(SystemInfo::from_payload(&snapshot.data)),
        status => Err(snapshot.reason_or(&format!("systemInfo answered {status}"))),
    }
}
