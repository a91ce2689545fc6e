//! Host-CLI backend driver.
//!
//! Spawns the configured assistant CLI once per turn with:
//! - `kill_on_drop(true)` so a cancelled turn never leaves an orphan.
//! - `env_clear()` plus an allowlist so the bridge credential never leaks
//!   into the child.
//! - the prompt as the final argument and `--resume <id>` when the previous
//!   turn reported a conversation id.
//!
//! Stdout is read as NDJSON (see [`super::reader`]); permission decisions
//! are written back to stdin as one JSON line each.

use std::process::Stdio;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::BackendCodec;
use super::reader::{parse_line, BackendLine};
use super::{Backend, BackendEvent, BackendOutput, BackendProbe, BackendRequest, BoxFuture};
use crate::config::BackendConfig;
use crate::models::permission::PermissionDecision;
use crate::{AppError, Result};

/// Environment variables inherited by the backend process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "RUST_LOG",
    "ANTHROPIC_API_KEY",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Backend that runs the host CLI as a child process per turn.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    config: BackendConfig,
}

impl ProcessBackend {
    /// Create a driver for the given backend settings.
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.host_cli);
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run_turn(
        &self,
        request: BackendRequest,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<BackendOutput> {
        let mut cmd = self.command();
        cmd.args(&self.config.host_cli_args);
        if let Some(ref resume) = request.resume_id {
            cmd.arg("--resume").arg(resume);
        }
        cmd.arg(&request.prompt);
        cmd.env("COMPANION_SESSION_ID", &request.session_id);
        cmd.env("COMPANION_OUTPUT_FORMAT", request.format.as_str());
        if let Some(ref dir) = request.working_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Backend(format!("failed to spawn backend: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Backend("backend stdout not captured".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Backend("backend stdin not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let session_id = request.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session_id, line, "backend stderr");
                }
            });
        }

        let mut reader = FramedRead::new(stdout, BackendCodec::new());
        let mut writer = FramedWrite::new(stdin, BackendCodec::new());
        let mut streamed = String::new();
        let mut result: Option<BackendOutput> = None;
        let mut reported_error: Option<String> = None;

        loop {
            let item = tokio::select! {
                biased;
                () = request.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(AppError::Backend("turn cancelled".into()));
                }
                item = reader.next() => item,
            };

            let line = match item {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(AppError::Backend(msg))) => {
                    warn!(session_id = %request.session_id, error = %msg, "backend framing error, skipping");
                    continue;
                }
                Some(Err(err)) => {
                    warn!(session_id = %request.session_id, %err, "backend stdout failed");
                    break;
                }
            };

            match parse_line(&line) {
                Ok(Some(BackendLine::Partial(text))) => {
                    streamed.push_str(&text);
                    if events.send(BackendEvent::Partial(text)).await.is_err() {
                        let _ = child.kill().await;
                        return Err(AppError::Backend("turn abandoned".into()));
                    }
                }
                Ok(Some(BackendLine::Permission(prompt))) => {
                    let decision = ask_permission(&events, prompt, &request).await;
                    write_decision(&mut writer, &decision).await?;
                    if decision == PermissionDecision::Abort {
                        let _ = child.kill().await;
                        return Err(AppError::Backend(
                            "turn aborted: permission declined".into(),
                        ));
                    }
                }
                Ok(Some(BackendLine::Result {
                    result: content,
                    backend_session_id,
                })) => {
                    result = Some(BackendOutput {
                        content,
                        backend_session_id,
                    });
                }
                Ok(Some(BackendLine::Error(message))) => reported_error = Some(message),
                Ok(None) => {}
                Err(err) => {
                    warn!(session_id = %request.session_id, %err, "skipping malformed backend line");
                }
            }
        }

        drop(writer);
        let status = tokio::select! {
            () = request.cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(AppError::Backend("turn cancelled".into()));
            }
            status = child.wait() => status?,
        };

        if let Some(output) = result {
            return Ok(output);
        }
        if let Some(message) = reported_error {
            return Err(AppError::Backend(message));
        }
        if status.success() {
            return Ok(BackendOutput {
                content: streamed,
                backend_session_id: None,
            });
        }
        Err(AppError::Backend(format!("backend exited with {status}")))
    }
}

impl Backend for ProcessBackend {
    fn execute(
        &self,
        request: BackendRequest,
        events: mpsc::Sender<BackendEvent>,
    ) -> BoxFuture<'_, Result<BackendOutput>> {
        let span = info_span!("backend_turn", session_id = %request.session_id);
        Box::pin(self.run_turn(request, events).instrument(span))
    }

    fn probe(&self) -> BoxFuture<'_, BackendProbe> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.args(&self.config.version_args);
            cmd.stdin(Stdio::null()).stderr(Stdio::null());
            let timeout = Duration::from_secs(self.config.probe_timeout_seconds);

            match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(Ok(output)) if output.status.success() => {
                    let version = String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .next()
                        .map(|line| line.trim().to_owned())
                        .filter(|line| !line.is_empty());
                    BackendProbe {
                        available: true,
                        version,
                    }
                }
                Ok(Ok(output)) => {
                    warn!(status = %output.status, "backend probe exited unsuccessfully");
                    BackendProbe::default()
                }
                Ok(Err(err)) => {
                    warn!(%err, host_cli = %self.config.host_cli, "backend probe failed to run");
                    BackendProbe::default()
                }
                Err(_elapsed) => {
                    warn!(timeout_seconds = self.config.probe_timeout_seconds, "backend probe timed out");
                    BackendProbe::default()
                }
            }
        })
    }
}

async fn ask_permission(
    events: &mpsc::Sender<BackendEvent>,
    prompt: String,
    request: &BackendRequest,
) -> PermissionDecision {
    let (reply, decision) = oneshot::channel();
    if events
        .send(BackendEvent::PermissionRequired { prompt, reply })
        .await
        .is_err()
    {
        return PermissionDecision::Abort;
    }
    tokio::select! {
        () = request.cancel.cancelled() => PermissionDecision::Abort,
        decision = decision => decision.unwrap_or(PermissionDecision::Abort),
    }
}

async fn write_decision(
    writer: &mut FramedWrite<ChildStdin, BackendCodec>,
    decision: &PermissionDecision,
) -> Result<()> {
    let line = serde_json::json!({
        "type": "permission_response",
        "decision": decision.label(),
        "response": decision.response_text(),
    })
    .to_string();
    info!(decision = decision.label(), "delivering permission decision to backend");
    writer
        .send(line)
        .await
        .map_err(|err| AppError::Backend(format!("failed to write permission decision: {err}")))
}
