// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interrupt handling for a test run.
//!
//! A signal received during any phase of a test ends that phase with [`TestError::Interrupted`].
//! During cleanup, it interrupts only the running action. The test's cleanup stack still unwinds,
//! and the remaining tests are not started.
//!
//! [`TestError::Interrupted`]: crate::errors::TestError::Interrupted

use crate::errors::SignalHandlerSetupError;
use futures::FutureExt;

/// The kind of signal handling to set up for a test run.
///
/// A `SignalHandlerKind` can be passed into
/// [`TestRunner::build`](crate::runner::TestRunner::build).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// Capture interrupt and termination signals.
    Standard,

    /// Ignore signals. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SignalHandler {
    signals: Option<imp::Signals>,
    received: Option<InterruptEvent>,
    #[cfg(test)]
    scripted: std::collections::VecDeque<(std::time::Duration, InterruptEvent)>,
}

impl SignalHandler {
    #[cfg(any(unix, windows))]
    fn new() -> Result<Self, SignalHandlerSetupError> {
        let signals = imp::Signals::new()?;
        Ok(Self {
            signals: Some(signals),
            received: None,
            #[cfg(test)]
            scripted: Default::default(),
        })
    }

    pub(crate) fn noop() -> Self {
        Self {
            signals: None,
            received: None,
            #[cfg(test)]
            scripted: Default::default(),
        }
    }

    /// A handler that delivers `event` once a wait for a signal has lasted `after`.
    #[cfg(test)]
    pub(crate) fn scripted(after: std::time::Duration, event: InterruptEvent) -> Self {
        let mut handler = Self::noop();
        handler.scripted.push_back((after, event));
        handler
    }

    /// The first signal received so far, picking up one that arrived while nothing was waiting.
    ///
    /// Must be called from within the runtime.
    pub(crate) fn poll_received(&mut self) -> Option<InterruptEvent> {
        if self.received.is_none() {
            let _ = self.recv().now_or_never();
        }
        self.received
    }

    /// Waits for a signal. Pends forever if signals are not being handled.
    pub(crate) async fn recv(&mut self) -> InterruptEvent {
        #[cfg(test)]
        if let Some((after, event)) = self.scripted.front().copied() {
            if !after.is_zero() {
                tokio::time::sleep(after).await;
            }
            self.scripted.pop_front();
            self.received.get_or_insert(event);
            return event;
        }

        let event = match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => None,
        };
        match event {
            Some(event) => {
                self.received.get_or_insert(event);
                event
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: SignalWithDone,
        sighup: SignalWithDone,
        sigterm: SignalWithDone,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self {
                sigint: SignalWithDone::new(SignalKind::interrupt())?,
                sighup: SignalWithDone::new(SignalKind::hangup())?,
                sigterm: SignalWithDone::new(SignalKind::terminate())?,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<InterruptEvent> {
            loop {
                tokio::select! {
                    recv = self.sigint.signal.recv(), if !self.sigint.done => {
                        match recv {
                            Some(()) => break Some(InterruptEvent::Interrupt),
                            None => self.sigint.done = true,
                        }
                    }
                    recv = self.sighup.signal.recv(), if !self.sighup.done => {
                        match recv {
                            Some(()) => break Some(InterruptEvent::Hangup),
                            None => self.sighup.done = true,
                        }
                    }
                    recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                        match recv {
                            Some(()) => break Some(InterruptEvent::Term),
                            None => self.sigterm.done = true,
                        }
                    }
                    else => {
                        break None
                    }
                }
            }
        }
    }

    #[derive(Debug)]
    struct SignalWithDone {
        signal: Signal,
        done: bool,
    }

    impl SignalWithDone {
        fn new(kind: SignalKind) -> std::io::Result<Self> {
            Ok(Self {
                signal: signal(kind)?,
                done: false,
            })
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
        ctrl_c_done: bool,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self {
                ctrl_c: ctrl_c()?,
                ctrl_c_done: false,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<InterruptEvent> {
            if self.ctrl_c_done {
                return None;
            }

            match self.ctrl_c.recv().await {
                Some(()) => Some(InterruptEvent::Interrupt),
                None => {
                    self.ctrl_c_done = true;
                    None
                }
            }
        }
    }
}

/// A signal that should stop the run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InterruptEvent {
    /// SIGHUP.
    #[cfg(unix)]
    Hangup,

    /// SIGTERM.
    #[cfg(unix)]
    Term,

    /// SIGINT, or Ctrl-C on Windows.
    Interrupt,
}

impl InterruptEvent {
    /// The name of the signal.
    pub fn name(self) -> &'static str {
        match self {
            #[cfg(unix)]
            Self::Hangup => "SIGHUP",
            #[cfg(unix)]
            Self::Term => "SIGTERM",
            Self::Interrupt => "SIGINT",
        }
    }
}
