// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-test cleanup stack.
//!
//! Helpers that change the machine register an action that undoes the change and hand back a
//! [`CleanupHandle`]. At the end of the test, [`CleanupStack::unwind`] runs every action that was
//! not released early, most recent first. A failing, panicking, hung or interrupted action is
//! recorded and the unwind carries on.

use crate::{
    errors::{CleanupActionError, DisplayErrorChain, TestError},
    remote::RemoteMachine,
    signal::SignalHandler,
    timeout::{Deadline, Timeout},
};
use debug_ignore::DebugIgnore;
use futures::FutureExt;
use std::{fmt, panic::AssertUnwindSafe, time::Duration};
use tracing::{debug, warn};

/// Something to do when a test finishes.
#[derive(Debug)]
pub enum CleanupAction {
    /// Run shell commands on the machine, in order.
    ///
    /// Every command is attempted even if an earlier one fails; the first failure is reported.
    Execute {
        /// A human-readable description, used in error messages.
        description: String,

        /// The commands to run.
        commands: Vec<String>,
    },

    /// Run a closure on the local side.
    Local {
        /// A human-readable description, used in error messages.
        description: String,

        /// The closure to run.
        action: DebugIgnore<Box<dyn FnOnce() -> Result<(), TestError>>>,
    },
}

impl CleanupAction {
    /// An action running a single remote command, described by the command itself.
    pub fn execute(command: impl Into<String>) -> Self {
        let command = command.into();
        Self::Execute {
            description: command.clone(),
            commands: vec![command],
        }
    }

    /// An action running several remote commands.
    pub fn execute_all(description: impl Into<String>, commands: Vec<String>) -> Self {
        Self::Execute {
            description: description.into(),
            commands,
        }
    }

    /// An action running a local closure.
    pub fn local<F>(description: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Result<(), TestError> + 'static,
    {
        Self::Local {
            description: description.into(),
            action: DebugIgnore(Box::new(action)),
        }
    }

    /// The description of this action.
    pub fn description(&self) -> &str {
        match self {
            Self::Execute { description, .. } | Self::Local { description, .. } => description,
        }
    }

    /// Runs this action.
    pub async fn run<M>(
        self,
        machine: &mut M,
        deadline: &Deadline,
    ) -> Result<(), CleanupActionError>
    where
        M: RemoteMachine,
    {
        match self {
            Self::Execute {
                description,
                commands,
            } => {
                let mut first_error = None;
                for command in &commands {
                    if let Err(error) = machine.execute(command, deadline).await {
                        debug!("cleanup command failed: {error}");
                        first_error.get_or_insert(error);
                    }
                }
                match first_error {
                    Some(error) => Err(CleanupActionError::new(description, error.into())),
                    None => Ok(()),
                }
            }
            Self::Local {
                description,
                action,
            } => (action.0)().map_err(|error| CleanupActionError::new(description, error)),
        }
    }

    /// Runs this action for at most `limit`, until a signal arrives, or until it panics.
    ///
    /// On a signal, the action's deadline is cancelled and the machine's current operation is
    /// interrupted.
    pub(crate) async fn run_guarded<M>(
        self,
        machine: &mut M,
        parent: &Deadline,
        limit: Duration,
        signals: &mut SignalHandler,
    ) -> Result<(), CleanupActionError>
    where
        M: RemoteMachine,
    {
        let description = self.description().to_owned();
        let timeout =
            Timeout::new(limit).with_message(format!("cleanup action `{description}` timed out"));
        let deadline = parent.derive();

        let outcome = {
            let fut = AssertUnwindSafe(timeout.run(
                &mut *machine,
                &deadline,
                async move |machine: &mut M, deadline: &Deadline| -> Result<(), TestError> {
                    Ok(self.run(machine, deadline).await?)
                },
            ))
            .catch_unwind();
            tokio::select! {
                res = fut => Ok(res),
                event = signals.recv() => Err(event),
            }
        };

        let error = match outcome {
            Ok(Ok(Ok(()))) => return Ok(()),
            Ok(Ok(Err(TestError::Cleanup(error)))) => return Err(error),
            Ok(Ok(Err(error))) => error,
            Ok(Err(payload)) => TestError::from_panic(payload.as_ref()),
            Err(event) => {
                deadline.cancel();
                machine.interrupt_current_operation();
                TestError::Interrupted {
                    event: event.name(),
                }
            }
        };
        Err(CleanupActionError::new(description, error))
    }
}

/// Identifies an action registered on a [`CleanupStack`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CleanupHandle(u64);

impl fmt::Display for CleanupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup #{}", self.0)
    }
}

/// A LIFO stack of cleanup actions.
#[derive(Debug, Default)]
pub struct CleanupStack {
    entries: Vec<(CleanupHandle, CleanupAction)>,
    next_id: u64,
}

impl CleanupStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action, to be run before every action registered earlier.
    pub fn push(&mut self, action: CleanupAction) -> CleanupHandle {
        let handle = CleanupHandle(self.next_id);
        self.next_id += 1;
        self.entries.push((handle, action));
        handle
    }

    /// Removes an action without running it. Returns `None` if it already ran or was removed.
    pub fn take(&mut self, handle: CleanupHandle) -> Option<CleanupAction> {
        let index = self.entries.iter().position(|(h, _)| *h == handle)?;
        Some(self.entries.remove(index).1)
    }

    /// The number of actions still registered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The descriptions of the registered actions, in the order they would run.
    pub fn pending(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .iter()
            .rev()
            .map(|(_, action)| action.description())
    }

    /// Runs every registered action, most recently registered first, leaving the stack empty.
    ///
    /// Each action runs exactly once and gets at most `limit`. A signal interrupts only the action
    /// running when it arrives. Failures are logged and returned in the order they occurred.
    pub(crate) async fn unwind<M>(
        &mut self,
        machine: &mut M,
        deadline: &Deadline,
        limit: Duration,
        signals: &mut SignalHandler,
    ) -> Vec<CleanupActionError>
    where
        M: RemoteMachine,
    {
        let mut errors = Vec::new();
        while let Some((handle, action)) = self.entries.pop() {
            debug!("running {handle}: {}", action.description());
            if let Err(error) = action.run_guarded(machine, deadline, limit, signals).await {
                warn!("{}", DisplayErrorChain::new(&error));
                errors.push(error);
            }
        }
        errors
    }
}
