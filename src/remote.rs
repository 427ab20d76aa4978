//! Remote inference collaborator.
//!
//! Hosted models are reached through installed CLI tools (`claude`,
//! `gemini`) by subprocess execution. Every call carries a timeout; a call
//! that outlives it is killed and reported as a retryable failure. Clients
//! never retry on their own: they classify the failure and the orchestrator
//! decides.

use crate::adapter::{LoadedRuntime, ModelHub};
use crate::config::Decoding;
use crate::error::ResolutionError;
use crate::model::{BackendKind, ModelSpec, DEFAULT_REVISION};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a remote call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailureKind {
    RateLimited,
    Timeout,
    ServerError,
    InvalidRequest,
    ModelDeprecated,
}

impl RemoteFailureKind {
    /// Rate limits, timeouts and transient server errors may succeed later
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::ServerError)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::InvalidRequest => "invalid_request",
            Self::ModelDeprecated => "model_deprecated",
        }
    }
}

impl std::fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified remote failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteFailureKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<RemoteError> for crate::error::BackendError {
    fn from(err: RemoteError) -> Self {
        Self::Remote {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// One generation request
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub prompt: &'a str,
    pub max_new_tokens: usize,
    pub decoding: Decoding,
    pub stop_sequences: &'a [String],
    pub seed: u64,
}

/// Hosted inference endpoint
pub trait RemoteClient: Send + Sync {
    fn name(&self) -> &str;

    /// Generate a completion, giving up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns a classified `RemoteError`.
    fn complete(
        &self,
        request: &CompletionRequest<'_>,
        timeout: Duration,
    ) -> Result<String, RemoteError>;
}

/// How to invoke a CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliCommand {
    pub name: String,
    pub command: String,
    /// Argument template with a `{prompt}` placeholder
    pub args_template: String,
}

impl CliCommand {
    #[must_use]
    pub fn claude() -> Self {
        Self {
            name: "claude".to_string(),
            command: "claude".to_string(),
            args_template: "--print \"{prompt}\"".to_string(),
        }
    }

    #[must_use]
    pub fn gemini() -> Self {
        Self {
            name: "gemini".to_string(),
            command: "gemini".to_string(),
            args_template: "\"{prompt}\"".to_string(),
        }
    }

    /// Preset for a model identifier
    #[must_use]
    pub fn preset(id: &str) -> Option<Self> {
        match id {
            "claude" => Some(Self::claude()),
            "gemini" => Some(Self::gemini()),
            _ => None,
        }
    }
}

/// Remote client backed by a CLI tool. Decoding settings other than the
/// prompt are left to the tool.
#[derive(Debug, Clone)]
pub struct CliRemoteClient {
    command: CliCommand,
}

impl CliRemoteClient {
    #[must_use]
    pub const fn new(command: CliCommand) -> Self {
        Self { command }
    }

    /// Check if the CLI tool is installed
    #[must_use]
    pub fn is_available(&self) -> bool {
        Command::new("which")
            .arg(&self.command.command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    /// Command-line arguments for `prompt`
    ///
    /// The template is split first and the prompt substituted per argument,
    /// so it reaches the tool verbatim.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the template has unbalanced quotes.
    pub fn command_args(&self, prompt: &str) -> Result<Vec<String>, RemoteError> {
        let args = shell_words::split(&self.command.args_template)
            .map_err(|e| RemoteError::new(RemoteFailureKind::InvalidRequest, e.to_string()))?;
        #[allow(clippy::literal_string_with_formatting_args)]
        let args = args
            .into_iter()
            .map(|arg| arg.replace("{prompt}", prompt))
            .collect();
        Ok(args)
    }

    fn spawn(&self, prompt: &str) -> Result<Child, RemoteError> {
        let args = self.command_args(prompt)?;

        Command::new(&self.command.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RemoteError::new(
                    RemoteFailureKind::InvalidRequest,
                    format!("failed to start {}: {e}", self.command.command),
                )
            })
    }
}

/// Drain a pipe on a helper thread so a chatty child cannot block on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buf).ok();
        }
        buf
    })
}

impl RemoteClient for CliRemoteClient {
    fn name(&self) -> &str {
        &self.command.name
    }

    fn complete(
        &self,
        request: &CompletionRequest<'_>,
        timeout: Duration,
    ) -> Result<String, RemoteError> {
        let mut child = self.spawn(request.prompt)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    child.kill().ok();
                    child.wait().ok();
                    return Err(RemoteError::new(
                        RemoteFailureKind::Timeout,
                        format!("no response within {timeout:?}"),
                    ));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(e) => {
                    return Err(RemoteError::new(RemoteFailureKind::ServerError, e.to_string()))
                }
            }
        };

        let response = stdout.join().unwrap_or_default();
        let diagnostics = stderr.join().unwrap_or_default();

        if status.success() {
            Ok(response.trim_end().to_string())
        } else {
            let message = if diagnostics.trim().is_empty() {
                format!("{} exited with {status}", self.command.command)
            } else {
                diagnostics.trim().to_string()
            };
            Err(RemoteError::new(classify_message(&message), message))
        }
    }
}

/// Classify a remote error message
#[must_use]
pub fn classify_message(message: &str) -> RemoteFailureKind {
    let text = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["rate limit", "rate_limit", "429", "too many requests", "quota"]) {
        RemoteFailureKind::RateLimited
    } else if has(&["timeout", "timed out", "deadline exceeded"]) {
        RemoteFailureKind::Timeout
    } else if has(&["deprecated", "decommissioned", "model not found", "no such model"]) {
        RemoteFailureKind::ModelDeprecated
    } else if has(&["500", "502", "503", "504", "overloaded", "unavailable", "internal server"]) {
        RemoteFailureKind::ServerError
    } else {
        RemoteFailureKind::InvalidRequest
    }
}

/// Model hub resolving remote model identifiers to CLI clients
#[derive(Debug, Clone, Default)]
pub struct CliModelHub;

impl ModelHub for CliModelHub {
    fn load(&self, spec: &ModelSpec) -> Result<LoadedRuntime, ResolutionError> {
        if spec.backend != BackendKind::Remote {
            return Err(ResolutionError::BackendMismatch {
                model: spec.id.clone(),
                declared: spec.backend,
                actual: "remote".to_string(),
            });
        }
        let command =
            CliCommand::preset(&spec.id).ok_or_else(|| ResolutionError::ModelNotFound(spec.id.clone()))?;
        if spec.revision != DEFAULT_REVISION {
            return Err(ResolutionError::RevisionNotFound {
                model: spec.id.clone(),
                revision: spec.revision.clone(),
            });
        }

        let client = CliRemoteClient::new(command);
        if !client.is_available() {
            return Err(ResolutionError::ModelNotFound(format!(
                "{} (CLI not installed)",
                spec.id
            )));
        }
        Ok(LoadedRuntime::Remote(Arc::new(client)))
    }
}
