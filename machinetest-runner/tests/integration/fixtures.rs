// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use futures::future::LocalBoxFuture;
use machinetest_runner::{
    case::{TestContext, TestFn},
    config::HarnessConfig,
    errors::{RemoteCommandError, TestError},
    output::Color,
    remote::{LogCursor, LogQuery, RemoteMachine, WriteFileOptions},
    reporter::TestReporter,
    runner::{RunStats, TestRunner, TestSuite},
    signal::SignalHandlerKind,
    timeout::Deadline,
};
use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

pub(crate) const MACHINE_LABEL: &str = "fake";

/// Sent by a test body to block until interrupted.
pub(crate) const HANG: &str = "sleep infinity";

/// The command registered by setup to remove the remote scratch directory.
pub(crate) const REMOVE_REMOTE_TMPDIR: &str = "if [ -d /var/lib/machinetest ]; then findmnt --list \
     --noheadings --output TARGET | grep ^/var/lib/machinetest | xargs -r umount && rm -r \
     /var/lib/machinetest; fi";

pub(crate) const REMOVE_COREDUMPS: &str = "rm -rf /var/lib/systemd/coredump";

pub(crate) fn start_marker(name: &str) -> String {
    format!("logger -p user.info 'MACHINETEST: start {name}'")
}

pub(crate) fn end_marker(name: &str) -> String {
    format!("logger -p user.info 'MACHINETEST: end {name}'")
}

#[derive(Debug)]
struct FakeState {
    reachable: bool,
    commands: Vec<String>,
    failing: Vec<String>,
    outputs: HashMap<String, String>,
    journal: Vec<String>,
    audit: Vec<String>,
    queries: Vec<LogQuery>,
    interrupts: usize,
    sessions: usize,
}

/// A scripted machine. Clones share their state, so a test can inspect what the harness did to
/// the machine after the run.
#[derive(Clone, Debug)]
pub(crate) struct FakeMachine {
    state: Rc<RefCell<FakeState>>,
}

impl FakeMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(FakeState {
                reachable: true,
                commands: Vec::new(),
                failing: Vec::new(),
                outputs: HashMap::new(),
                journal: Vec::new(),
                audit: Vec::new(),
                queries: Vec::new(),
                interrupts: 0,
                sessions: 0,
            })),
        }
    }

    pub(crate) fn unreachable(self) -> Self {
        self.state.borrow_mut().reachable = false;
        self
    }

    /// Makes `command` exit with status 1.
    pub(crate) fn failing(self, command: &str) -> Self {
        self.state.borrow_mut().failing.push(command.to_owned());
        self
    }

    pub(crate) fn output(self, command: &str, output: &str) -> Self {
        self.state
            .borrow_mut()
            .outputs
            .insert(command.to_owned(), output.to_owned());
        self
    }

    pub(crate) fn journal(self, records: &[&str]) -> Self {
        self.state
            .borrow_mut()
            .journal
            .extend(records.iter().map(|record| (*record).to_owned()));
        self
    }

    pub(crate) fn audit(self, records: &[&str]) -> Self {
        self.state
            .borrow_mut()
            .audit
            .extend(records.iter().map(|record| (*record).to_owned()));
        self
    }

    /// Opens a new session sharing this machine's state.
    pub(crate) fn session(&self) -> Self {
        self.state.borrow_mut().sessions += 1;
        self.clone()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    /// The commands executed between the first `from` and the next `to`, exclusive.
    pub(crate) fn commands_between(&self, from: &str, to: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .skip_while(|command| command != from)
            .skip(1)
            .take_while(|command| command != to)
            .collect()
    }

    pub(crate) fn queries(&self) -> Vec<LogQuery> {
        self.state.borrow().queries.clone()
    }

    pub(crate) fn interrupts(&self) -> usize {
        self.state.borrow().interrupts
    }

    pub(crate) fn sessions(&self) -> usize {
        self.state.borrow().sessions
    }
}

impl RemoteMachine for FakeMachine {
    fn label(&self) -> &str {
        MACHINE_LABEL
    }

    fn address(&self) -> &str {
        "192.0.2.1"
    }

    fn is_reachable(&self) -> bool {
        self.state.borrow().reachable
    }

    async fn execute(
        &mut self,
        command: &str,
        _deadline: &Deadline,
    ) -> Result<String, RemoteCommandError> {
        let output = {
            let mut state = self.state.borrow_mut();
            state.commands.push(command.to_owned());
            if !state.reachable {
                return Err(RemoteCommandError::unreachable(command, "no route to host"));
            }
            if state.failing.iter().any(|failing| failing == command) {
                return Err(RemoteCommandError::exited(command, Some(1), "scripted failure"));
            }
            state.outputs.get(command).cloned().unwrap_or_default()
        };

        if command == HANG {
            std::future::pending::<()>().await;
        }
        Ok(output)
    }

    async fn current_log_cursor(
        &mut self,
        _deadline: &Deadline,
    ) -> Result<LogCursor, RemoteCommandError> {
        Ok(LogCursor::new("s=1;i=2a"))
    }

    async fn read_log_records(
        &mut self,
        query: &LogQuery,
        _deadline: &Deadline,
    ) -> Result<Vec<String>, RemoteCommandError> {
        let mut state = self.state.borrow_mut();
        state.queries.push(query.clone());
        Ok(state.journal.clone())
    }

    async fn read_security_audit_records(
        &mut self,
        _code_prefix: &str,
        _cursor: Option<&LogCursor>,
        _deadline: &Deadline,
    ) -> Result<Vec<String>, RemoteCommandError> {
        Ok(self.state.borrow().audit.clone())
    }

    async fn download_directory(
        &mut self,
        _remote_path: &str,
        _local_path: &Utf8Path,
        _deadline: &Deadline,
    ) -> Result<(), RemoteCommandError> {
        Ok(())
    }

    async fn write_file(
        &mut self,
        path: &str,
        _content: &str,
        _options: &WriteFileOptions,
        _deadline: &Deadline,
    ) -> Result<(), RemoteCommandError> {
        self.state.borrow_mut().commands.push(format!("write {path}"));
        Ok(())
    }

    fn interrupt_current_operation(&mut self) {
        self.state.borrow_mut().interrupts += 1;
    }
}

/// The default configuration with a short connect budget.
pub(crate) fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::default_config().expect("default config is valid");
    config.connect.tries = 3;
    config.connect.delay = Duration::from_millis(5);
    config
}

pub(crate) fn test_fn<F>(name: &str, body: F) -> TestSuite<FakeMachine>
where
    F: for<'a> Fn(
            &'a mut TestContext<FakeMachine>,
        ) -> LocalBoxFuture<'a, Result<(), TestError>>
        + 'static,
{
    TestSuite::test(TestFn::new(name, body))
}

/// Runs `suite`, opening every session on `machine`, and returns the stats and the report.
pub(crate) fn run_suite(
    config: HarnessConfig,
    suite: &TestSuite<FakeMachine>,
    machine: &FakeMachine,
) -> (RunStats, String) {
    let runner = TestRunner::build(config, Color::Never, SignalHandlerKind::Noop)
        .expect("runner is built");
    let mut reporter = TestReporter::new(Vec::new());
    let stats = runner
        .execute_with_reporter(suite, |_| machine.session(), &mut reporter)
        .expect("writing to a Vec succeeds");
    let report = String::from_utf8(reporter.into_inner()).expect("report is UTF-8");
    (stats, report)
}

/// The report without the final summary line, which depends on the host and timing.
pub(crate) fn report_body(report: &str) -> &str {
    let trimmed = report.trim_end_matches('\n');
    match trimmed.rfind('\n') {
        Some(index) => &report[..=index],
        None => "",
    }
}

/// The final summary line of a report.
pub(crate) fn summary_line(report: &str) -> &str {
    report.lines().last().unwrap_or_default()
}
