// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checking the machine's journal for unexpected messages.
//!
//! After a test passes, every journal record written since the test started is compared against an
//! [`AllowList`] of regular expressions. A record is expected only if some pattern matches the
//! *entire* record; a pattern that matches a substring does not count, so that a real problem can't
//! hide inside an otherwise expected line.
//!
//! [`scan`] is a pure function: it copies the allow-list into a local working set, which it may
//! extend while scanning, and returns that working set as part of the [`ScanOutcome`].

use crate::errors::{AllowListPatternError, JournalAnomaly};
use regex::Regex;
use std::{fmt, sync::LazyLock};
use tracing::warn;

/// The environment variable holding extra comma-separated allow-list patterns.
pub const ALLOW_MESSAGES_ENV: &str = "TEST_ALLOW_JOURNAL_MESSAGES";

/// The record written when the crash handler could not symbolize a core dump.
pub const STACK_TRACE_FAILURE: &str = "Failed to generate stack trace: (null)";

/// The pattern added to the working set once [`STACK_TRACE_FAILURE`] has been seen.
pub const CORE_DUMPED_PATTERN: &str = "Process .* of user .* dumped core.*";

/// Messages that are always expected.
pub static DEFAULT_ALLOWED_MESSAGES: &[&str] = &[
    // Reboots are fine.
    "-- Reboot --",
    // ssh may drop messages while closing a connection.
    "10.*: dropping message while waiting for child to exit",
    // SELinux policy loads and enforcement toggles.
    "(audit: )?type=1403 audit.*",
    "(audit: )?type=1404 audit.*",
    // Core dump retrieval is not entirely reliable.
    "Failed to send coredump datagram:.*",
    // Seeking to a cursor from before a journal rotation.
    "Failed to seek to cursor: Invalid argument",
];

/// Messages logged by clients that don't know the machine's host key yet.
pub static HOSTKEY_MESSAGES: &[&str] = &[
    ".*: .* host key for server is not known: .*",
    ".*: refusing to connect to unknown host: .*",
    ".*: failed to retrieve resource: hostkey-unknown",
];

/// Messages logged by clients whose connection dropped because a service restarted.
pub static RESTART_MESSAGES: &[&str] = &[
    ".*Connection reset by peer.*",
    "connection unexpectedly closed by peer",
    "peer did not close io when expected",
    "request timed out, closing",
    ".*: failed to retrieve resource: terminated",
];

static CORE_DUMPED: LazyLock<AllowPattern> = LazyLock::new(|| {
    AllowPattern::new(CORE_DUMPED_PATTERN).expect("core dump pattern is a valid regex")
});

static BUILTIN: LazyLock<AllowList> = LazyLock::new(|| {
    AllowList::from_patterns(DEFAULT_ALLOWED_MESSAGES.iter().copied())
        .expect("builtin allow-list patterns are valid regexes")
});

/// A regular expression that must match an entire journal record.
#[derive(Clone)]
pub struct AllowPattern {
    source: String,
    regex: Regex,
}

impl AllowPattern {
    /// Compiles a new pattern.
    pub fn new(pattern: &str) -> Result<Self, AllowListPatternError> {
        // The whole record must match, not just a prefix of it.
        let regex = Regex::new(&format!(r"\A(?:{pattern})\z"))
            .map_err(|error| AllowListPatternError::new(pattern, error))?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if this pattern matches all of `record`.
    pub fn matches(&self, record: &str) -> bool {
        self.regex.is_match(record)
    }
}

impl fmt::Debug for AllowPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AllowPattern").field(&self.source).finish()
    }
}

/// An ordered list of patterns describing expected journal records.
///
/// Patterns are tried in order and the first match wins.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    patterns: Vec<AllowPattern>,
}

impl AllowList {
    /// Creates an empty allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the built-in allow-list, [`DEFAULT_ALLOWED_MESSAGES`].
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Returns the process-wide default allow-list: the built-in patterns, then any patterns from
    /// the [`ALLOW_MESSAGES_ENV`] environment variable, then `extra`.
    pub fn process_defaults<I, S>(extra: I) -> Result<Self, AllowListPatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::builtin();
        if let Ok(env) = std::env::var(ALLOW_MESSAGES_ENV) {
            list.extend(split_env_patterns(&env))?;
        }
        list.extend(extra)?;
        Ok(list)
    }

    /// Compiles a list of patterns.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, AllowListPatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        list.extend(patterns)?;
        Ok(list)
    }

    /// Appends a pattern to the end of the list.
    pub fn push(&mut self, pattern: &str) -> Result<(), AllowListPatternError> {
        self.patterns.push(AllowPattern::new(pattern)?);
        Ok(())
    }

    /// Appends several patterns to the end of the list.
    ///
    /// If any pattern is invalid, the patterns before it have already been added.
    pub fn extend<I, S>(&mut self, patterns: I) -> Result<(), AllowListPatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.push(pattern.as_ref())?;
        }
        Ok(())
    }

    /// Returns the first pattern matching all of `record`, if any.
    pub fn first_match(&self, record: &str) -> Option<&AllowPattern> {
        self.patterns.iter().find(|pattern| pattern.matches(record))
    }

    /// Iterates over the patterns in order.
    pub fn iter(&self) -> impl Iterator<Item = &AllowPattern> + '_ {
        self.patterns.iter()
    }

    /// The number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if there are no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn push_compiled(&mut self, pattern: AllowPattern) {
        self.patterns.push(pattern);
    }
}

fn split_env_patterns(env: &str) -> impl Iterator<Item = &str> {
    env.split(',').filter(|pattern| !pattern.is_empty())
}

/// The result of [`scan`].
#[derive(Clone, Debug)]
pub struct ScanOutcome {
    unmatched: Vec<String>,
    allow_list: AllowList,
}

impl ScanOutcome {
    /// Returns true if every record was expected.
    pub fn is_ok(&self) -> bool {
        self.unmatched.is_empty()
    }

    /// The first record that matched no pattern.
    pub fn first_unmatched(&self) -> Option<&str> {
        self.unmatched.first().map(String::as_str)
    }

    /// Every record that matched no pattern, in journal order.
    pub fn unmatched(&self) -> &[String] {
        &self.unmatched
    }

    /// The allow-list as it stood at the end of the scan, including any patterns added while
    /// scanning.
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Converts this outcome into an error if any record was unexpected.
    pub fn into_result(self) -> Result<(), JournalAnomaly> {
        match self.unmatched.first() {
            None => Ok(()),
            Some(first) => Err(JournalAnomaly::new(first.clone(), self.unmatched.len())),
        }
    }
}

/// Classifies each record as expected or unexpected.
///
/// Records are trimmed and empty records are ignored. A record exactly equal to
/// [`STACK_TRACE_FAILURE`] is expected, and from then on core dump notices are expected too:
/// without a stack trace there is nothing more to learn from them.
///
/// Scanning does not stop at the first unexpected record, so that all of them can be reported.
pub fn scan<I, S>(records: I, allow_list: &AllowList) -> ScanOutcome
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut working = allow_list.clone();
    let mut core_dumps_allowed = false;
    let mut unmatched = Vec::new();

    for record in records {
        let record = record.as_ref().trim();
        if record.is_empty() {
            continue;
        }

        if record == STACK_TRACE_FAILURE {
            if !core_dumps_allowed {
                working.push_compiled(CORE_DUMPED.clone());
                core_dumps_allowed = true;
            }
            continue;
        }

        if working.first_match(record).is_none() {
            warn!(target: "machinetest_runner::journal", "unexpected journal message: {record}");
            unmatched.push(record.to_owned());
        }
    }

    ScanOutcome {
        unmatched,
        allow_list: working,
    }
}
