// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The contract between the harness and the driver for the machine under test.
//!
//! machinetest does not know how to talk to a machine. Establishing a remote-shell session,
//! copying files and reading the machine's structured log are the job of a driver that implements
//! [`RemoteMachine`]. The harness only orchestrates those calls.

use crate::{errors::RemoteCommandError, timeout::Deadline};
use camino::Utf8Path;
use std::{fmt, future::Future};

/// An opaque position in the remote machine's structured log.
///
/// Obtained from [`RemoteMachine::current_log_cursor`] and passed back to
/// [`RemoteMachine::read_log_records`] to read only records written after that point.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LogCursor(String);

impl LogCursor {
    /// Creates a new cursor from the driver's representation.
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// Returns the driver's representation of the cursor.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selects records from the remote machine's structured log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogQuery {
    /// Only return records emitted by these syslog identifiers.
    pub identifiers: Vec<String>,

    /// Only return records at this priority or more severe (syslog numbering, 0 is most severe).
    pub priority: u8,

    /// Only return records written after this cursor. If `None`, the whole log is read.
    pub cursor: Option<LogCursor>,
}

/// Options for [`RemoteMachine::write_file`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteFileOptions {
    /// Append to an existing file instead of replacing it.
    pub append: bool,

    /// The owner to set, as a `chown` argument (for example `admin:nogroup`).
    pub owner: Option<String>,

    /// The permissions to set, as a `chmod` argument (for example `0600`).
    pub perm: Option<String>,
}

/// A session with a machine under test.
///
/// Each test exclusively owns one session for its entire duration. Every method that talks to
/// the machine receives a [`Deadline`]; implementations should abandon the call and return
/// [`RemoteCommandError::interrupted`] once the deadline has expired.
pub trait RemoteMachine {
    /// A short human-readable name for the machine, used in artifact file names.
    fn label(&self) -> &str;

    /// The address the session connects to, used in diagnostics.
    fn address(&self) -> &str;

    /// Returns true if the remote-shell session is currently usable.
    fn is_reachable(&self) -> bool;

    /// Runs a shell command on the machine and returns its standard output.
    ///
    /// Returns an error if the command exits with a non-zero status.
    fn execute(
        &mut self,
        command: &str,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<String, RemoteCommandError>>;

    /// Returns the current end of the structured log.
    fn current_log_cursor(
        &mut self,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<LogCursor, RemoteCommandError>>;

    /// Reads message lines from the structured log.
    fn read_log_records(
        &mut self,
        query: &LogQuery,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<String>, RemoteCommandError>>;

    /// Reads security audit records whose type code starts with `code_prefix`.
    fn read_security_audit_records(
        &mut self,
        code_prefix: &str,
        cursor: Option<&LogCursor>,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<String>, RemoteCommandError>>;

    /// Copies a directory from the machine to a local path.
    fn download_directory(
        &mut self,
        remote_path: &str,
        local_path: &Utf8Path,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<(), RemoteCommandError>>;

    /// Writes a file on the machine.
    fn write_file(
        &mut self,
        path: &str,
        content: &str,
        options: &WriteFileOptions,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<(), RemoteCommandError>>;

    /// Aborts whatever command is currently in flight and disconnects the session.
    ///
    /// Called when a [`Timeout`](crate::timeout::Timeout) guard expires or the run is interrupted.
    fn interrupt_current_operation(&mut self);

    /// Returns a description of how to reach the machine interactively.
    ///
    /// Printed when a failed test pauses for inspection.
    fn diagnose(&self) -> String {
        format!("machine `{}` is reachable at {}\n", self.label(), self.address())
    }
}
