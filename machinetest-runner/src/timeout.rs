// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded-time execution of operations against a remote machine.
//!
//! A [`Deadline`] is passed into every blocking remote call. Remote machine implementations are
//! expected to abort in-flight work once [`Deadline::is_expired`] becomes true, typically by
//! selecting on [`Deadline::expired`].
//!
//! A [`Timeout`] guard derives a child deadline from its parent and races the guarded operation
//! against it. When the guard expires, the guarded future is dropped, the child deadline is
//! cancelled, the remote machine is told to interrupt its current operation, and an
//! [`OperationTimeout`] is returned to the caller.
//!
//! Guards nest: a child deadline can never expire later than its parent. An inner guard whose own
//! duration would outlive the enclosing deadline does not arm a timer of its own, so the outer
//! guard is the one that fires and interrupts the machine.

use crate::{
    errors::{OperationTimeout, TestError},
    remote::RemoteMachine,
};
use std::{
    borrow::Cow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

/// A point in time after which remote operations should be abandoned.
///
/// Cloning a deadline shares its cancellation state.
#[derive(Clone, Debug)]
pub struct Deadline {
    expires_at: Option<Instant>,
    token: Arc<CancelToken>,
}

#[derive(Debug, Default)]
struct CancelToken {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_cancelled())
    }
}

impl Deadline {
    /// A deadline that never expires unless cancelled.
    pub fn none() -> Self {
        Self {
            expires_at: None,
            token: Arc::new(CancelToken::default()),
        }
    }

    /// A deadline that expires `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + duration),
            token: Arc::new(CancelToken::default()),
        }
    }

    /// Derives a deadline that expires `duration` from now, or when `self` expires, whichever
    /// comes first.
    ///
    /// Cancelling `self` also cancels the child; cancelling the child leaves `self` untouched.
    pub fn child(&self, duration: Duration) -> Self {
        let own = Instant::now() + duration;
        let expires_at = match self.expires_at {
            Some(parent) => Some(parent.min(own)),
            None => Some(own),
        };
        Self {
            expires_at,
            token: Arc::new(CancelToken {
                cancelled: AtomicBool::new(false),
                parent: Some(self.token.clone()),
            }),
        }
    }

    /// Derives a deadline with the same expiry time that can be cancelled on its own.
    pub fn derive(&self) -> Self {
        Self {
            expires_at: self.expires_at,
            token: Arc::new(CancelToken {
                cancelled: AtomicBool::new(false),
                parent: Some(self.token.clone()),
            }),
        }
    }

    /// The instant at which this deadline expires, if any.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// The time remaining until this deadline expires, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }

    /// Marks this deadline, and every deadline derived from it, as cancelled.
    pub fn cancel(&self) {
        self.token.cancelled.store(true, Ordering::Release);
    }

    /// Returns true if this deadline or one of its ancestors was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns true if this deadline was cancelled or its expiry time has passed.
    pub fn is_expired(&self) -> bool {
        self.is_cancelled()
            || self
                .expires_at
                .is_some_and(|expires_at| Instant::now() >= expires_at)
    }

    /// Completes once the expiry time is reached. Never completes for [`Deadline::none`].
    ///
    /// Cancellation does not wake this future; it is observed through [`Self::is_expired`].
    pub async fn expired(&self) {
        match self.expires_at {
            Some(expires_at) => tokio::time::sleep_until(expires_at).await,
            None => std::future::pending().await,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// A scoped time limit around an operation.
#[derive(Clone, Debug)]
pub struct Timeout {
    duration: Duration,
    message: Cow<'static, str>,
}

impl Timeout {
    /// The message used when none is supplied.
    pub const DEFAULT_MESSAGE: &'static str = "Timeout";

    /// Creates a new guard with the given duration.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            message: Cow::Borrowed(Self::DEFAULT_MESSAGE),
        }
    }

    /// Creates a new guard lasting the given number of whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Sets the message carried by the [`OperationTimeout`] produced on expiry.
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = message.into();
        self
    }

    /// The duration of this guard.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Runs `body` against `machine` under this guard.
    ///
    /// On expiry the machine's in-flight operation is interrupted exactly once.
    pub async fn run<M, R, F>(
        self,
        machine: &mut M,
        parent: &Deadline,
        body: F,
    ) -> Result<R, TestError>
    where
        M: RemoteMachine,
        F: AsyncFnOnce(&mut M, &Deadline) -> Result<R, TestError>,
    {
        self.run_with(machine, parent, body, |machine| {
            machine.interrupt_current_operation()
        })
        .await
    }

    /// Runs `body` against an arbitrary target under this guard, calling `on_expiry` with the
    /// target if the guard expires.
    pub async fn run_with<T, R, F, X>(
        self,
        target: &mut T,
        parent: &Deadline,
        body: F,
        on_expiry: X,
    ) -> Result<R, TestError>
    where
        T: ?Sized,
        F: AsyncFnOnce(&mut T, &Deadline) -> Result<R, TestError>,
        X: FnOnce(&mut T),
    {
        let deadline = parent.child(self.duration);
        // If the enclosing deadline is at least as tight as ours, leave expiry to the enclosing
        // guard.
        let armed = match parent.expires_at() {
            Some(parent_expires_at) => deadline.expires_at() < Some(parent_expires_at),
            None => true,
        };

        let outcome = {
            let fut = body(&mut *target, &deadline);
            if armed {
                tokio::select! {
                    biased;
                    res = fut => Some(res),
                    () = deadline.expired() => None,
                }
            } else {
                debug!(
                    "timeout of {:?} is inert: enclosing deadline expires first",
                    self.duration
                );
                Some(fut.await)
            }
        };

        match outcome {
            Some(res) => res,
            None => {
                deadline.cancel();
                on_expiry(target);
                Err(OperationTimeout::new(self.message, self.duration).into())
            }
        }
    }
}
