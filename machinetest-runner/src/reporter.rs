// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints out test results.
//!
//! The output is line oriented, with every harness line starting with `#`:
//!
//! ```text
//! # ----------------------------------------------------------------------
//! # check-login.TestLogin.testBasic
//! # Result check-login.TestLogin.testBasic succeeded
//! # 1 TEST PASSED [12s on buildhost]
//! ```

use crate::{
    case::{CaseOutcome, CaseStatus, TestName},
    errors::DisplayErrorChain,
    helpers::plural,
    runner::RunStats,
};
use itertools::Itertools;
use owo_colors::{OwoColorize, Style};
use std::{
    io::{self, Write},
    time::Duration,
};

const SEPARATOR: &str =
    "# ----------------------------------------------------------------------";

/// An event reported while running tests.
#[derive(Debug)]
pub enum TestEvent<'a> {
    /// A test is about to run.
    TestStarted {
        /// The name of the test.
        name: &'a str,
    },

    /// A test finished running.
    TestFinished {
        /// The outcome of the test.
        outcome: &'a CaseOutcome,
    },

    /// Every test finished running, or the run was interrupted.
    RunFinished {
        /// Statistics for the run.
        run_stats: &'a RunStats,

        /// The skipped tests and why they were skipped.
        skipped: &'a [(TestName, String)],

        /// How long the run took.
        elapsed: Duration,

        /// The host the run happened on.
        hostname: &'a str,
    },
}

/// Writes test events to a stream.
#[derive(Debug)]
pub struct TestReporter<W> {
    writer: W,
    styles: Styles,
}

impl<W: Write> TestReporter<W> {
    /// Creates a new reporter writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            styles: Styles::default(),
        }
    }

    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Consumes the reporter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Reports an event.
    pub fn report_event(&mut self, event: TestEvent<'_>) -> io::Result<()> {
        let writer = &mut self.writer;
        match event {
            TestEvent::TestStarted { name } => {
                writeln!(writer, "{SEPARATOR}")?;
                writeln!(writer, "# {name}")?;
            }
            TestEvent::TestFinished { outcome } => {
                for (_, error) in outcome.errors() {
                    writeln!(writer, "{}", DisplayErrorChain::new(error))?;
                }
                write!(writer, "# Result {} ", outcome.name())?;
                match outcome.status() {
                    CaseStatus::Passed => {
                        writeln!(writer, "{}", "succeeded".style(self.styles.pass))?;
                    }
                    CaseStatus::Skipped { reason } => {
                        writeln!(writer, "{} {reason}", "skipped:".style(self.styles.skip))?;
                    }
                    CaseStatus::Failed | CaseStatus::Errored => {
                        writeln!(writer, "{}", "failed".style(self.styles.fail))?;
                    }
                }
            }
            TestEvent::RunFinished {
                run_stats,
                skipped,
                elapsed,
                hostname,
            } => {
                let details = format!("[{}s on {hostname}]", elapsed.as_secs());
                let failures = run_stats.failure_count();
                if run_stats.is_all_skipped() {
                    let list = skipped
                        .iter()
                        .map(|(name, reason)| format!("{name} {reason}"))
                        .join(", ");
                    writeln!(writer, "# {} {list}", "SKIP".style(self.styles.skip))?;
                } else if failures > 0 {
                    writeln!(
                        writer,
                        "# {} {} {details}",
                        failures.style(self.styles.count),
                        format!("{} FAILED", plural::tests_upper_str(failures))
                            .style(self.styles.fail),
                    )?;
                } else {
                    let count = run_stats.finished_count;
                    writeln!(
                        writer,
                        "# {} {} {details}",
                        count.style(self.styles.count),
                        format!("{} PASSED", plural::tests_upper_str(count))
                            .style(self.styles.pass),
                    )?;
                }
            }
        }
        writer.flush()
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
    }
}
