// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Polling a probe until the machine reaches some state.
//!
//! Use [`Wait`] whenever a test needs to wait for a remote state change ("the service started",
//! "the file appeared") instead of writing a retry loop at the call site.

use crate::errors::{ConditionTimeout, WaitError};
use std::{borrow::Cow, time::Duration};
use tracing::debug;

/// A value that a probe can return, where some values count as "not yet".
pub trait Truthy {
    /// The value handed back to the caller once the probe succeeds.
    type Value;

    /// Returns `Some` if this value means the condition holds.
    fn into_truthy(self) -> Option<Self::Value>;
}

impl Truthy for bool {
    type Value = bool;

    fn into_truthy(self) -> Option<bool> {
        self.then_some(true)
    }
}

impl<T> Truthy for Option<T> {
    type Value = T;

    fn into_truthy(self) -> Option<T> {
        self
    }
}

impl Truthy for String {
    type Value = String;

    fn into_truthy(self) -> Option<String> {
        (!self.is_empty()).then_some(self)
    }
}

impl<T> Truthy for Vec<T> {
    type Value = Vec<T>;

    fn into_truthy(self) -> Option<Vec<T>> {
        (!self.is_empty()).then_some(self)
    }
}

/// A try/delay budget for polling a probe.
#[derive(Clone, Debug)]
pub struct Wait {
    delay: Duration,
    tries: usize,
    message: Option<Cow<'static, str>>,
}

impl Default for Wait {
    fn default() -> Self {
        Self {
            delay: Self::DEFAULT_DELAY,
            tries: Self::DEFAULT_TRIES,
            message: None,
        }
    }
}

impl Wait {
    /// The default delay between attempts.
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

    /// The default number of attempts.
    pub const DEFAULT_TRIES: usize = 60;

    /// Creates a new budget with the default delay and number of attempts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the maximum number of times the probe is called.
    pub fn tries(mut self, tries: usize) -> Self {
        self.tries = tries;
        self
    }

    /// Sets the message reported if the condition never holds.
    pub fn message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Calls `probe` until it returns a truthy value, and returns that value.
    ///
    /// Errors returned by the probe are swallowed and retried, except on the final attempt, where
    /// the error is returned as [`WaitError::Probe`]. If every attempt returns a falsy value,
    /// [`WaitError::Timeout`] is returned.
    ///
    /// The delay is slept between attempts, not after the final one.
    pub async fn until<P, E, F>(&self, mut probe: F) -> Result<P::Value, WaitError<E>>
    where
        P: Truthy,
        E: std::fmt::Display,
        F: AsyncFnMut() -> Result<P, E>,
    {
        for attempt in 1..=self.tries {
            match probe().await {
                Ok(value) => {
                    if let Some(value) = value.into_truthy() {
                        return Ok(value);
                    }
                }
                Err(error) if attempt == self.tries => return Err(WaitError::Probe(error)),
                Err(error) => {
                    debug!("attempt {attempt}/{} failed: {error}", self.tries);
                }
            }

            if attempt < self.tries {
                tokio::time::sleep(self.delay).await;
            }
        }

        Err(ConditionTimeout::new(self.message.as_deref(), self.tries).into())
    }
}

/// Calls `probe` with the default budget of 60 attempts, one second apart.
///
/// See [`Wait::until`].
pub async fn wait_for<P, E, F>(probe: F) -> Result<P::Value, WaitError<E>>
where
    P: Truthy,
    E: std::fmt::Display,
    F: AsyncFnMut() -> Result<P, E>,
{
    Wait::new().until(probe).await
}
