// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a suite of tests, one at a time.
//!
//! The main structure in this module is [`TestRunner`].

use crate::{
    case::{CaseOutcome, CaseStatus, MachineTest, Phase, TestName, run_case},
    config::{HarnessConfig, MachineConfig},
    errors::{TestError, TestRunnerBuildError},
    helpers::{plural, short_hostname},
    journal::AllowList,
    output::{Color, OutputContext},
    remote::RemoteMachine,
    reporter::{TestEvent, TestReporter},
    signal::{SignalHandler, SignalHandlerKind},
    time::stopwatch,
};
use futures::FutureExt;
use machinetest_metadata::MachineTestExitCode;
use std::{fmt, io, panic::AssertUnwindSafe, sync::Arc, time::Instant};
use tokio::runtime::Runtime;
use tracing::{info, warn};

/// A possibly nested collection of tests.
pub enum TestSuite<M: RemoteMachine> {
    /// A single test.
    Test(Box<dyn MachineTest<M>>),

    /// A group of tests, run in order.
    Group(Vec<TestSuite<M>>),
}

impl<M: RemoteMachine> TestSuite<M> {
    /// Creates a suite consisting of a single test.
    pub fn test(test: impl MachineTest<M> + 'static) -> Self {
        Self::Test(Box::new(test))
    }

    /// Creates a group out of suites.
    pub fn group(suites: impl IntoIterator<Item = TestSuite<M>>) -> Self {
        Self::Group(suites.into_iter().collect())
    }

    /// Returns every test in the suite, depth first, in order.
    pub fn flatten(&self) -> Vec<&dyn MachineTest<M>> {
        let mut tests = Vec::new();
        self.flatten_into(&mut tests);
        tests
    }

    fn flatten_into<'a>(&'a self, tests: &mut Vec<&'a dyn MachineTest<M>>) {
        match self {
            Self::Test(test) => tests.push(test.as_ref()),
            Self::Group(suites) => {
                for suite in suites {
                    suite.flatten_into(tests);
                }
            }
        }
    }
}

impl<M: RemoteMachine> fmt::Debug for TestSuite<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test(test) => f.debug_tuple("Test").field(&test.name()).finish(),
            Self::Group(suites) => f.debug_tuple("Group").field(suites).finish(),
        }
    }
}

/// Runs tests one at a time against freshly created machine sessions.
#[derive(Debug)]
pub struct TestRunner {
    config: Arc<HarnessConfig>,
    allow_list: AllowList,
    color: Color,
    signal_handler: SignalHandler,
    runtime: Runtime,
}

impl TestRunner {
    /// Creates a new runner.
    ///
    /// This installs the global log subscriber at the configured verbosity, compiles the
    /// process-wide journal allow-list and sets up signal handling.
    pub fn build(
        config: HarnessConfig,
        color: Color,
        handler_kind: SignalHandlerKind,
    ) -> Result<Self, TestRunnerBuildError> {
        OutputContext {
            verbosity: config.effective_verbosity(),
            color,
        }
        .init_logging();

        let allow_list = AllowList::process_defaults(&config.journal.allowed_messages)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // This must be called from within the guard.
        let signal_handler = handler_kind.build()?;

        Ok(Self {
            config: Arc::new(config),
            allow_list,
            color,
            signal_handler,
            runtime,
        })
    }

    /// The configuration the runner was built with.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The process-wide allow-list each test starts from.
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Returns the names of the tests in `suite`, in the order they would run.
    pub fn list<M: RemoteMachine>(suite: &TestSuite<M>) -> Vec<&str> {
        suite.flatten().into_iter().map(|test| test.name()).collect()
    }

    /// Runs every test in `suite`, reporting to standard output.
    ///
    /// `new_machine` is called once per test to open that test's session.
    pub fn execute<M, F>(self, suite: &TestSuite<M>, new_machine: F) -> io::Result<RunStats>
    where
        M: RemoteMachine,
        F: FnMut(&MachineConfig) -> M,
    {
        let mut reporter = TestReporter::new(io::stdout().lock());
        if self.color.should_colorize(supports_color::Stream::Stdout) {
            reporter.colorize();
        }
        self.execute_with_reporter(suite, new_machine, &mut reporter)
    }

    /// Runs every test in `suite`, reporting to `reporter`.
    pub fn execute_with_reporter<M, F, W>(
        mut self,
        suite: &TestSuite<M>,
        mut new_machine: F,
        reporter: &mut TestReporter<W>,
    ) -> io::Result<RunStats>
    where
        M: RemoteMachine,
        F: FnMut(&MachineConfig) -> M,
        W: io::Write,
    {
        let stopwatch = stopwatch();
        let tests = suite.flatten();
        let mut run_stats = RunStats {
            initial_run_count: tests.len(),
            ..RunStats::default()
        };
        let mut skipped = Vec::new();

        for test in tests {
            let received = {
                let _guard = self.runtime.enter();
                self.signal_handler.poll_received()
            };
            if let Some(event) = received {
                warn!(
                    "interrupted by {}, not running {} remaining tests",
                    event.name(),
                    run_stats.initial_run_count - run_stats.finished_count,
                );
                break;
            }

            reporter.report_event(TestEvent::TestStarted { name: test.name() })?;
            let machine = new_machine(&self.config.machine);
            let started = Instant::now();
            let res = self.runtime.block_on(
                AssertUnwindSafe(run_case(
                    test,
                    machine,
                    self.config.clone(),
                    self.allow_list.clone(),
                    &mut self.signal_handler,
                ))
                .catch_unwind(),
            );
            // Panics outside a guarded phase are charged to cleanup.
            let outcome = res.unwrap_or_else(|payload| {
                let error = TestError::from_panic(payload.as_ref());
                warn!("{}: {error}", test.name());
                CaseOutcome::new(
                    TestName::new(test.name()),
                    vec![(Phase::Cleanup, error)],
                    None,
                    started.elapsed(),
                )
            });
            run_stats.on_test_finished(&outcome);
            if let CaseStatus::Skipped { reason } = outcome.status() {
                skipped.push((outcome.name().clone(), reason));
            }
            reporter.report_event(TestEvent::TestFinished { outcome: &outcome })?;
        }

        let snapshot = stopwatch.snapshot();
        info!(
            "{run_stats} (started at {}, finished at {})",
            snapshot.start_time.format("%H:%M:%S"),
            snapshot.end_time().format("%H:%M:%S"),
        );
        reporter.report_event(TestEvent::RunFinished {
            run_stats: &run_stats,
            skipped: &skipped,
            elapsed: snapshot.duration,
            hostname: &short_hostname(),
        })?;

        Ok(run_stats)
    }
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The total number of tests that were expected to be run at the beginning.
    ///
    /// If the run is interrupted, this will be more than `finished_count` at the end.
    pub initial_run_count: usize,

    /// The total number of tests that finished running.
    pub finished_count: usize,

    /// The number of tests that passed.
    pub passed: usize,

    /// The number of tests that failed.
    pub failed: usize,

    /// The number of tests that could not run properly.
    pub errored: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,
}

impl RunStats {
    /// Records the outcome of a finished test.
    pub fn on_test_finished(&mut self, outcome: &CaseOutcome) {
        self.finished_count += 1;
        match outcome.status() {
            CaseStatus::Passed => self.passed += 1,
            CaseStatus::Failed => self.failed += 1,
            CaseStatus::Errored => self.errored += 1,
            CaseStatus::Skipped { .. } => self.skipped += 1,
        }
    }

    /// The number of tests that did not succeed, not counting skips.
    pub fn failure_count(&self) -> usize {
        self.failed + self.errored
    }

    /// Returns true if every finished test was skipped, including when no tests ran.
    pub fn is_all_skipped(&self) -> bool {
        self.skipped == self.finished_count
    }

    /// The process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        MachineTestExitCode::for_counts(self.finished_count, self.skipped, self.failure_count())
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} run: {} passed, {} failed, {} errored, {} skipped",
            self.finished_count,
            plural::tests_str(self.finished_count),
            self.passed,
            self.failed,
            self.errored,
            self.skipped,
        )
    }
}
