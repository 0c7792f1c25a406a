// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by machinetest.

use crate::case::Phase;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{any::Any, error, fmt, time::Duration};
use thiserror::Error;

/// A command executed on the remote machine failed.
///
/// Produced by [`RemoteMachine`](crate::remote::RemoteMachine) implementations.
#[derive(Clone, Debug, Error)]
pub struct RemoteCommandError {
    command: String,
    kind: RemoteCommandErrorKind,
}

#[derive(Clone, Debug)]
enum RemoteCommandErrorKind {
    Exited { status: Option<i32>, stderr: String },
    Interrupted,
    Unreachable { message: String },
}

impl RemoteCommandError {
    /// Creates a new error for a command that exited unsuccessfully.
    ///
    /// `status` is `None` if the command was terminated by a signal on the remote end.
    pub fn exited(
        command: impl Into<String>,
        status: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            kind: RemoteCommandErrorKind::Exited {
                status,
                stderr: stderr.into(),
            },
        }
    }

    /// Creates a new error for a command that was aborted because its deadline was cancelled.
    pub fn interrupted(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            kind: RemoteCommandErrorKind::Interrupted,
        }
    }

    /// Creates a new error for a command that could not be sent because the session is down.
    pub fn unreachable(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            kind: RemoteCommandErrorKind::Unreachable {
                message: message.into(),
            },
        }
    }

    /// The command that was executed.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The exit status of the command, if it ran to completion.
    pub fn exit_status(&self) -> Option<i32> {
        match &self.kind {
            RemoteCommandErrorKind::Exited { status, .. } => *status,
            RemoteCommandErrorKind::Interrupted | RemoteCommandErrorKind::Unreachable { .. } => {
                None
            }
        }
    }

    /// Standard error produced by the command, if any was captured.
    pub fn stderr(&self) -> &str {
        match &self.kind {
            RemoteCommandErrorKind::Exited { stderr, .. } => stderr,
            RemoteCommandErrorKind::Interrupted | RemoteCommandErrorKind::Unreachable { .. } => "",
        }
    }

    /// Returns true if the command was interrupted by a cancelled deadline.
    pub fn is_interrupted(&self) -> bool {
        matches!(self.kind, RemoteCommandErrorKind::Interrupted)
    }
}

impl fmt::Display for RemoteCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RemoteCommandErrorKind::Exited { status, stderr } => {
                match status {
                    Some(status) => write!(
                        f,
                        "remote command `{}` exited with status {status}",
                        self.command
                    )?,
                    None => write!(
                        f,
                        "remote command `{}` was terminated by a signal",
                        self.command
                    )?,
                }
                let stderr = stderr.trim_end();
                if !stderr.is_empty() {
                    write!(f, ":\n{stderr}")?;
                }
                Ok(())
            }
            RemoteCommandErrorKind::Interrupted => {
                write!(f, "remote command `{}` was interrupted", self.command)
            }
            RemoteCommandErrorKind::Unreachable { message } => write!(
                f,
                "remote command `{}` could not be sent: {message}",
                self.command
            ),
        }
    }
}

/// A [`wait_for`](crate::wait::Wait::until) probe never returned a truthy value.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ConditionTimeout {
    message: String,
    tries: usize,
}

impl ConditionTimeout {
    /// The message used when the caller did not supply one.
    pub const DEFAULT_MESSAGE: &'static str = "Condition did not become true.";

    pub(crate) fn new(message: Option<&str>, tries: usize) -> Self {
        Self {
            message: message.unwrap_or(Self::DEFAULT_MESSAGE).to_owned(),
            tries,
        }
    }

    /// The message describing the condition.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The number of times the probe was called.
    pub fn tries(&self) -> usize {
        self.tries
    }
}

/// An error returned by [`Wait::until`](crate::wait::Wait::until).
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// Every attempt returned a falsy value.
    #[error(transparent)]
    Timeout(#[from] ConditionTimeout),

    /// The final attempt failed with this error.
    #[error(transparent)]
    Probe(E),
}

/// A [`Timeout`](crate::timeout::Timeout) guard expired before the guarded operation completed.
#[derive(Clone, Debug, Error)]
#[error("{message} (after {})", humantime::format_duration(*.after))]
pub struct OperationTimeout {
    message: String,
    after: Duration,
}

impl OperationTimeout {
    pub(crate) fn new(message: impl Into<String>, after: Duration) -> Self {
        Self {
            message: message.into(),
            after,
        }
    }

    /// The message attached to the guard.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The configured duration of the guard that expired.
    pub fn after(&self) -> Duration {
        self.after
    }
}

/// The remote machine never became reachable while a test was being set up.
#[derive(Debug, Error)]
#[error("machine `{label}` at {address} did not become reachable")]
pub struct ConnectivityError {
    label: String,
    address: String,
    #[source]
    source: WaitError<RemoteCommandError>,
}

impl ConnectivityError {
    pub(crate) fn new(
        label: impl Into<String>,
        address: impl Into<String>,
        source: WaitError<RemoteCommandError>,
    ) -> Self {
        Self {
            label: label.into(),
            address: address.into(),
            source,
        }
    }

    /// The label of the machine.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// An unexpected journal message survived the allow-list scan.
#[derive(Clone, Debug, Error)]
#[error("FAIL: Test completed, but found unexpected journal messages:\n{first}")]
pub struct JournalAnomaly {
    first: String,
    unmatched_count: usize,
}

impl JournalAnomaly {
    pub(crate) fn new(first: impl Into<String>, unmatched_count: usize) -> Self {
        Self {
            first: first.into(),
            unmatched_count,
        }
    }

    /// The first record that matched no allow-list pattern.
    pub fn first(&self) -> &str {
        &self.first
    }

    /// The total number of unmatched records found by the scan.
    pub fn unmatched_count(&self) -> usize {
        self.unmatched_count
    }
}

/// A pattern could not be added to an [`AllowList`](crate::journal::AllowList).
#[derive(Clone, Debug, Error)]
#[error("invalid journal allow-list pattern `{pattern}`")]
pub struct AllowListPatternError {
    pattern: String,
    #[source]
    error: regex::Error,
}

impl AllowListPatternError {
    pub(crate) fn new(pattern: impl Into<String>, error: regex::Error) -> Self {
        Self {
            pattern: pattern.into(),
            error,
        }
    }

    /// The pattern that failed to compile.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// A registered cleanup action failed.
///
/// These errors are recorded against the test but never stop the remaining cleanup actions from
/// running.
#[derive(Debug, Error)]
#[error("cleanup action `{description}` failed")]
pub struct CleanupActionError {
    description: String,
    #[source]
    source: Box<TestError>,
}

impl CleanupActionError {
    pub(crate) fn new(description: impl Into<String>, source: TestError) -> Self {
        Self {
            description: description.into(),
            source: Box::new(source),
        }
    }

    /// The description of the action that failed.
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// An error that occurred while exporting logs or crash dumps from the remote machine.
#[derive(Debug, Error)]
#[error("failed to {action} `{path}`")]
pub struct ArtifactError {
    action: &'static str,
    path: Utf8PathBuf,
    #[source]
    error: std::io::Error,
}

impl ArtifactError {
    pub(crate) fn new(
        action: &'static str,
        path: impl Into<Utf8PathBuf>,
        error: std::io::Error,
    ) -> Self {
        Self {
            action,
            path: path.into(),
            error,
        }
    }
}

/// An error recorded against a phase of a test.
///
/// Test bodies return this error. Most variants are produced by the harness itself; test authors
/// typically construct [`TestError::failed`] and [`TestError::skip`], and use `?` on remote calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestError {
    /// A remote command failed.
    #[error(transparent)]
    Remote(#[from] RemoteCommandError),

    /// A bounded wait was exhausted.
    #[error(transparent)]
    ConditionTimeout(#[from] ConditionTimeout),

    /// A timeout guard expired.
    #[error(transparent)]
    OperationTimeout(#[from] OperationTimeout),

    /// The remote machine never became reachable.
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    /// The journal contained unexpected messages.
    #[error(transparent)]
    JournalAnomaly(#[from] JournalAnomaly),

    /// A cleanup action failed.
    #[error(transparent)]
    Cleanup(#[from] CleanupActionError),

    /// Exporting an artifact failed.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// An allow-list pattern was invalid.
    #[error(transparent)]
    AllowListPattern(#[from] AllowListPatternError),

    /// The test body reported a failure.
    #[error("{message}")]
    Failed {
        /// The failure message.
        message: String,
    },

    /// The test asked to be skipped.
    #[error("skipped: {reason}")]
    Skipped {
        /// Why the test was skipped.
        reason: String,
    },

    /// Harness or test code panicked.
    #[error("panicked: {message}")]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },

    /// The run was interrupted by a signal while this test was running.
    #[error("interrupted by {event}")]
    Interrupted {
        /// The signal that was received.
        event: &'static str,
    },
}

impl TestError {
    /// Creates a failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates a skip request with the given reason.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Converts a caught panic payload into an error.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "(non-string panic payload)".to_owned()
        };
        Self::Panicked { message }
    }

    /// Returns the skip reason if this is a skip request.
    pub fn skip_reason(&self) -> Option<&str> {
        match self {
            Self::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    /// Returns true if this error means the test was not merely broken, but found a regression.
    ///
    /// Failures in the test body and journal anomalies count; infrastructure problems (an
    /// unreachable machine, a failing cleanup action, an interrupt) do not.
    pub fn is_failure_in(&self, phase: Phase) -> bool {
        match (phase, self) {
            (_, Self::Interrupted { .. }) => false,
            (Phase::Body, _) => true,
            (Phase::Teardown, Self::JournalAnomaly(_)) => true,
            _ => false,
        }
    }
}

impl<E: Into<TestError>> From<WaitError<E>> for TestError {
    fn from(error: WaitError<E>) -> Self {
        match error {
            WaitError::Timeout(timeout) => timeout.into(),
            WaitError::Probe(error) => error.into(),
        }
    }
}

/// An error that occurred while loading harness configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Option<Utf8PathBuf>,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: Option<Utf8PathBuf>, err: ConfigError) -> Self {
        Self { config_file, err }
    }
}

impl fmt::Display for ConfigParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.config_file {
            Some(config_file) => {
                write!(f, "failed to parse machinetest config at `{config_file}`")
            }
            None => write!(f, "failed to parse machinetest config"),
        }
    }
}

/// An error occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurred while building a [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),

    /// A configured journal allow-list pattern was invalid.
    #[error("error compiling the journal allow-list")]
    AllowListPattern(#[from] AllowListPatternError),
}

/// Displays an error along with its chain of sources, one per line.
pub(crate) struct DisplayErrorChain<E> {
    error: E,
}

impl<E: error::Error> DisplayErrorChain<E> {
    pub(crate) fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut source = self.error.source();
        while let Some(error) = source {
            write!(f, "\n  caused by: {error}")?;
            source = error.source();
        }

        Ok(())
    }
}
