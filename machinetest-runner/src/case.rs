// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The lifecycle of a single test against a machine.
//!
//! Every test goes through the same states:
//!
//! ```text
//! created -> connecting -> ready -> running-setup -> running-body -> running-teardown -> finished
//! ```
//!
//! A failure in any state skips ahead to teardown, and every path ends in `finished`, where the
//! cleanup stack is unwound and the local temporary directory is removed.
//!
//! Test bodies receive a [`TestContext`], which wraps the machine and offers helpers that change
//! the machine in ways that are undone when the test finishes.

use crate::{
    artifacts::{self, ArtifactNames, FAIL_TAG},
    cleanup::{CleanupAction, CleanupHandle, CleanupStack},
    config::HarnessConfig,
    errors::{
        ArtifactError, ConnectivityError, DisplayErrorChain, RemoteCommandError, TestError,
        WaitError,
    },
    journal::{self, AllowList, HOSTKEY_MESSAGES, RESTART_MESSAGES},
    output::NO_HEADING_TARGET,
    remote::{LogCursor, LogQuery, RemoteMachine, WriteFileOptions},
    signal::SignalHandler,
    timeout::{Deadline, Timeout},
    wait::Wait,
};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use futures::{FutureExt, future::LocalBoxFuture};
use shell_words::quote;
use std::{
    any::Any,
    fmt,
    io::Write,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Where the machine keeps crash dumps.
pub const COREDUMP_DIR: &str = "/var/lib/systemd/coredump";

const BUSY_CPU_COMMAND: &str = "ps --no-headers -eo pcpu,pid,args | sort -k 1 -n -r | head -n1";
const BUSY_CPU_THRESHOLD: f64 = 20.0;
const BACKUP_SUFFIX: &str = "machinetest";

/// A phase of a test, against which errors are recorded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    /// Waiting for the machine to become reachable.
    Connect,

    /// Preparing the machine for the test.
    Setup,

    /// The test body.
    Body,

    /// Checking the journal after the body.
    Teardown,

    /// Unwinding the cleanup stack.
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Setup => "setup",
            Self::Body => "body",
            Self::Teardown => "teardown",
            Self::Cleanup => "cleanup",
        })
    }
}

/// The state of a test's lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleState {
    /// The context exists but nothing has happened yet.
    Created,

    /// Waiting for the machine.
    Connecting,

    /// The machine is reachable.
    Ready,

    /// Capturing the journal cursor and registering standard cleanups.
    RunningSetup,

    /// Running the test body.
    RunningBody,

    /// Checking the journal.
    RunningTeardown,

    /// Cleanup has been unwound.
    Finished,
}

/// The qualified name of a test, such as `check-login.TestLogin.testBasic`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TestName(String);

impl TestName {
    /// Creates a new name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The qualified name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name used for artifacts: the first component is dropped and the remaining dots are
    /// replaced with dashes.
    pub fn label(&self) -> String {
        let rest = match self.0.split_once('.') {
            Some((_, rest)) => rest,
            None => &self.0,
        };
        rest.replace('.', "-")
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A test that runs against a machine of type `M`.
pub trait MachineTest<M: RemoteMachine> {
    /// The qualified name of the test.
    fn name(&self) -> &str;

    /// How long the body may take. If `None`, the configured default applies.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// If true, crash dumps on the machine are not treated as a problem.
    fn allow_core_dumps(&self) -> bool {
        false
    }

    /// Runs the test body.
    fn run<'a>(&'a self, cx: &'a mut TestContext<M>) -> LocalBoxFuture<'a, Result<(), TestError>>;
}

/// A [`MachineTest`] defined by a closure.
pub struct TestFn<F> {
    name: String,
    timeout: Option<Duration>,
    allow_core_dumps: bool,
    body: F,
}

impl<F> TestFn<F> {
    /// Creates a new test. The body is typically written as
    /// `|cx| async move { ... }.boxed_local()`.
    pub fn new<M>(name: impl Into<String>, body: F) -> Self
    where
        M: RemoteMachine,
        F: for<'a> Fn(&'a mut TestContext<M>) -> LocalBoxFuture<'a, Result<(), TestError>>,
    {
        Self {
            name: name.into(),
            timeout: None,
            allow_core_dumps: false,
            body,
        }
    }

    /// Sets the time limit for the body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allows crash dumps during this test.
    pub fn with_core_dumps_allowed(mut self) -> Self {
        self.allow_core_dumps = true;
        self
    }
}

impl<F> fmt::Debug for TestFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestFn")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("allow_core_dumps", &self.allow_core_dumps)
            .finish_non_exhaustive()
    }
}

impl<M, F> MachineTest<M> for TestFn<F>
where
    M: RemoteMachine,
    F: for<'a> Fn(&'a mut TestContext<M>) -> LocalBoxFuture<'a, Result<(), TestError>>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn allow_core_dumps(&self) -> bool {
        self.allow_core_dumps
    }

    fn run<'a>(&'a self, cx: &'a mut TestContext<M>) -> LocalBoxFuture<'a, Result<(), TestError>> {
        (self.body)(cx)
    }
}

/// Everything a test body can reach: the machine, the configuration and the cleanup stack.
pub struct TestContext<M> {
    name: TestName,
    machine: M,
    config: Arc<HarnessConfig>,
    cleanup: CleanupStack,
    allow_list: AllowList,
    allow_core_dumps: bool,
    journal_start: Option<LogCursor>,
    local_tmpdir: Option<Utf8TempDir>,
    deadline: Deadline,
    state: LifecycleState,
}

impl<M: RemoteMachine> TestContext<M> {
    fn new(
        name: TestName,
        machine: M,
        config: Arc<HarnessConfig>,
        allow_list: AllowList,
        allow_core_dumps: bool,
    ) -> Self {
        Self {
            name,
            machine,
            config,
            cleanup: CleanupStack::new(),
            allow_list,
            allow_core_dumps,
            journal_start: None,
            local_tmpdir: None,
            deadline: Deadline::none(),
            state: LifecycleState::Created,
        }
    }

    /// The qualified name of the running test.
    pub fn name(&self) -> &TestName {
        &self.name
    }

    /// The machine under test.
    pub fn machine(&mut self) -> &mut M {
        &mut self.machine
    }

    /// The harness configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The deadline of the current phase. Pass this to direct calls on [`Self::machine`].
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// A local scratch directory, removed when the test finishes.
    pub fn local_tmpdir(&self) -> Option<&Utf8Path> {
        self.local_tmpdir.as_ref().map(Utf8TempDir::path)
    }

    /// The scratch directory on the machine. It is not created automatically, but it is removed
    /// when the test finishes.
    pub fn remote_tmpdir(&self) -> &str {
        &self.config.remote_tmpdir
    }

    /// The test-scoped allow-list.
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// The journal position at the start of the test.
    pub fn journal_start(&self) -> Option<&LogCursor> {
        self.journal_start.as_ref()
    }

    /// Runs a command on the machine under the current deadline.
    pub async fn execute(&mut self, command: &str) -> Result<String, TestError> {
        debug!("executing: {command}");
        Ok(self.machine.execute(command, &self.deadline).await?)
    }

    /// Registers an action to run when the test finishes.
    pub fn add_cleanup(&mut self, action: CleanupAction) -> CleanupHandle {
        self.cleanup.push(action)
    }

    /// Runs a registered cleanup action now, instead of when the test finishes.
    ///
    /// Does nothing if the action already ran.
    pub async fn release(&mut self, handle: CleanupHandle) -> Result<(), TestError> {
        match self.cleanup.take(handle) {
            Some(action) => Ok(action
                .run_guarded(
                    &mut self.machine,
                    &self.deadline,
                    self.config.cleanup_timeout,
                    &mut SignalHandler::noop(),
                )
                .await?),
            None => Ok(()),
        }
    }

    /// Treats journal messages matching any of `patterns` in full as expected, for this test only.
    pub fn allow_journal_messages<I, S>(&mut self, patterns: I) -> Result<(), TestError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.allow_list.extend(patterns)?)
    }

    /// Allows the messages logged by clients that don't know the machine's host key.
    pub fn allow_hostkey_messages(&mut self) -> Result<(), TestError> {
        self.allow_journal_messages(HOSTKEY_MESSAGES.iter().copied())
    }

    /// Allows the messages logged by clients whose connection was dropped by a restart.
    pub fn allow_restart_journal_messages(&mut self) -> Result<(), TestError> {
        self.allow_journal_messages(RESTART_MESSAGES.iter().copied())
    }

    /// Sets whether crash dumps are expected for the rest of this test.
    pub fn set_allow_core_dumps(&mut self, allow: bool) {
        self.allow_core_dumps = allow;
    }

    /// Checks the journal for unexpected messages written since the test started.
    ///
    /// This runs automatically after a successful body, but tests can call it earlier, for
    /// example right before a reboot. On failure, the journal and any crash dumps are exported.
    pub async fn check_journal_messages(&mut self) -> Result<(), TestError> {
        let settings = &self.config.journal;
        let mut identifiers = vec!["kernel".to_owned()];
        if !self.allow_core_dumps {
            identifiers.push("systemd-coredump".to_owned());
        }
        let query = LogQuery {
            identifiers,
            priority: settings.priority,
            cursor: self.journal_start.clone(),
        };

        let mut records = self.machine.read_log_records(&query, &self.deadline).await?;
        if settings.scan_audit {
            records.extend(
                self.machine
                    .read_security_audit_records(
                        &settings.audit_code_prefix,
                        self.journal_start.as_ref(),
                        &self.deadline,
                    )
                    .await?,
            );
        }

        let outcome = journal::scan(&records, &self.allow_list);
        if let Err(anomaly) = outcome.into_result() {
            self.export_failure_artifacts().await;
            return Err(anomaly.into());
        }
        Ok(())
    }

    /// Exports the whole journal, compressed, and returns where it was written.
    ///
    /// Returns `None` if the machine is unreachable.
    pub async fn copy_journal(&mut self, tag: &str) -> Result<Option<Utf8PathBuf>, TestError> {
        if !self.machine.is_reachable() {
            return Ok(None);
        }
        let path = Utf8PathBuf::from(self.artifact_names(tag).journal());
        let journal = self.execute("journalctl").await?;
        artifacts::write_compressed(&path, journal.as_bytes())?;
        info!(target: NO_HEADING_TARGET, "journal extracted to {path}");
        Ok(Some(artifacts::attach(
            &path,
            self.config.attachments_dir.as_deref(),
        )?))
    }

    /// Downloads crash dumps, and returns where they were written.
    ///
    /// Returns `None` if crash dumps are allowed, the machine is unreachable, or there were none.
    pub async fn copy_cores(&mut self, tag: &str) -> Result<Option<Utf8PathBuf>, TestError> {
        if self.allow_core_dumps || !self.machine.is_reachable() {
            return Ok(None);
        }
        let dest = Utf8PathBuf::from(self.artifact_names(tag).cores());
        // Dumps from an earlier attempt at the same test are stale.
        if dest.exists() {
            std::fs::remove_dir_all(&dest)
                .map_err(|error| ArtifactError::new("remove", &dest, error))?;
        }
        std::fs::create_dir_all(&dest).map_err(|error| ArtifactError::new("create", &dest, error))?;
        self.machine
            .download_directory(COREDUMP_DIR, &dest, &self.deadline)
            .await?;

        if artifacts::remove_if_empty(&dest)? {
            return Ok(None);
        }
        warn!(target: NO_HEADING_TARGET, "core dumps downloaded to {dest}");
        Ok(Some(artifacts::attach(
            &dest,
            self.config.attachments_dir.as_deref(),
        )?))
    }

    /// Waits for the busiest process on the machine to drop below 20% CPU usage.
    ///
    /// Gives up quietly after a minute: a busy machine is no reason to fail a test.
    pub async fn settle_cpu(&mut self) -> Result<(), TestError> {
        let wait = Wait::new().tries(20).delay(Duration::from_secs(3));
        let res = wait
            .until(async || -> Result<bool, TestError> {
                let busiest = self.execute(BUSY_CPU_COMMAND).await?;
                Ok(parse_cpu_usage(&busiest)? < BUSY_CPU_THRESHOLD)
            })
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(WaitError::Timeout(_)) => {
                debug!("CPU did not settle, carrying on");
                Ok(())
            }
            Err(WaitError::Probe(error)) => Err(error),
        }
    }

    /// Edits a file on the machine with a sed expression, restoring it when the test finishes.
    ///
    /// `apply_change_action` runs after the edit and again after restoring.
    pub async fn sed_file(
        &mut self,
        expr: &str,
        path: &str,
        apply_change_action: Option<&str>,
    ) -> Result<CleanupHandle, TestError> {
        let path_q = quote(path);
        self.execute(&format!(
            "sed -i.{BACKUP_SUFFIX} {} {path_q}",
            quote(expr)
        ))
        .await?;
        if let Some(action) = apply_change_action {
            self.execute(action).await?;
        }

        let backup = format!("{path}.{BACKUP_SUFFIX}");
        let mut commands = vec![format!("mv {} {path_q}", quote(&backup))];
        commands.extend(apply_change_action.map(str::to_owned));
        Ok(self.add_cleanup(CleanupAction::execute_all(
            format!("restore {path}"),
            commands,
        )))
    }

    /// Backs up a directory and restores it when the test finishes.
    ///
    /// By default, a copy is bind-mounted over the directory so the original content is never
    /// touched. This does not survive a reboot; with `reboot_safe`, the directory is copied and
    /// moved back instead. If the directory does not exist, it is removed again at the end.
    pub async fn restore_dir(
        &mut self,
        path: &str,
        post_restore_action: Option<&str>,
        reboot_safe: bool,
    ) -> Result<CleanupHandle, TestError> {
        let path_q = quote(path);
        if !self.remote_exists(path).await? {
            return Ok(self.add_cleanup(CleanupAction::execute(format!("rm -rf {path_q}"))));
        }

        let backup = self.backup_path(path);
        let backup_q = quote(&backup);
        self.execute(&format!(
            "mkdir -p {} && cp -a {path_q}/ {backup_q}/",
            quote(self.remote_tmpdir())
        ))
        .await?;

        let restore = if reboot_safe {
            format!("rm -rf {path_q} && mv {backup_q} {path_q}")
        } else {
            self.execute(&format!("mount -o bind {backup_q} {path_q}"))
                .await?;
            format!("umount -lf {path_q}")
        };

        let mut commands = vec![restore];
        commands.extend(post_restore_action.map(str::to_owned));
        Ok(self.add_cleanup(CleanupAction::execute_all(
            format!("restore {path}"),
            commands,
        )))
    }

    /// Backs up a file and moves it back when the test finishes.
    ///
    /// Works for files that are replaced wholesale. If the file does not exist, it is removed
    /// again at the end.
    pub async fn restore_file(
        &mut self,
        path: &str,
        post_restore_action: Option<&str>,
    ) -> Result<CleanupHandle, TestError> {
        let path_q = quote(path);
        if !self.remote_exists(path).await? {
            return Ok(self.add_cleanup(CleanupAction::execute(format!("rm -rf {path_q}"))));
        }

        let backup = self.backup_path(path);
        let backup_q = quote(&backup);
        self.execute(&format!(
            "mkdir -p {} && cp -a {path_q} {backup_q}",
            quote(self.remote_tmpdir())
        ))
        .await?;

        let mut commands = vec![format!("mv {backup_q} {path_q}")];
        commands.extend(post_restore_action.map(str::to_owned));
        Ok(self.add_cleanup(CleanupAction::execute_all(
            format!("restore {path}"),
            commands,
        )))
    }

    /// Writes a file on the machine and removes it when the test finishes.
    pub async fn write_file(
        &mut self,
        path: &str,
        content: &str,
        options: &WriteFileOptions,
    ) -> Result<CleanupHandle, TestError> {
        self.machine
            .write_file(path, content, options, &self.deadline)
            .await?;
        Ok(self.add_cleanup(CleanupAction::execute(format!("rm -f {}", quote(path)))))
    }

    fn backup_path(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.remote_tmpdir().trim_end_matches('/'),
            path.replace('/', "_")
        )
    }

    async fn remote_exists(&mut self, path: &str) -> Result<bool, TestError> {
        let out = self
            .execute(&format!("if test -e {}; then echo yes; fi", quote(path)))
            .await?;
        Ok(!out.trim().is_empty())
    }

    fn artifact_names(&self, tag: &str) -> ArtifactNames {
        ArtifactNames::new(&self.name.label(), self.machine.label(), tag)
    }

    async fn export_failure_artifacts(&mut self) {
        if let Err(error) = self.copy_journal(FAIL_TAG).await {
            warn!("failed to export journal: {}", DisplayErrorChain::new(&error));
        }
        if let Err(error) = self.copy_cores(FAIL_TAG).await {
            warn!("failed to download core dumps: {}", DisplayErrorChain::new(&error));
        }
    }

    fn transition(&mut self, state: LifecycleState) {
        debug!("{}: {:?} -> {:?}", self.name, self.state, state);
        self.state = state;
    }

    async fn connect(&mut self) -> Result<(), TestError> {
        let wait = self.config.connect.to_wait();
        let res = wait
            .until(async || -> Result<bool, RemoteCommandError> {
                self.machine.execute("true", &self.deadline).await?;
                Ok(self.machine.is_reachable())
            })
            .await;
        res.map(|_| ()).map_err(|error| {
            ConnectivityError::new(self.machine.label(), self.machine.address(), error).into()
        })
    }

    async fn setup(&mut self) -> Result<(), TestError> {
        let tmpdir = camino_tempfile::Builder::new()
            .prefix("machinetest-")
            .tempdir()
            .map_err(|error| ArtifactError::new("create", "local temporary directory", error))?;
        self.local_tmpdir = Some(tmpdir);

        self.journal_start = Some(self.machine.current_log_cursor(&self.deadline).await?);
        self.execute(&self.marker("start")).await?;

        self.add_cleanup(CleanupAction::execute(self.marker("end")));
        // Crash dumps are exported per test; don't blame the next test for them.
        self.add_cleanup(CleanupAction::execute(format!("rm -rf {COREDUMP_DIR}")));
        let remote_tmpdir = quote(self.remote_tmpdir()).into_owned();
        self.add_cleanup(CleanupAction::execute_all(
            format!("remove {remote_tmpdir}"),
            vec![format!(
                "if [ -d {remote_tmpdir} ]; then findmnt --list --noheadings --output TARGET \
                 | grep ^{remote_tmpdir} | xargs -r umount && rm -r {remote_tmpdir}; fi"
            )],
        ));
        Ok(())
    }

    fn marker(&self, event: &str) -> String {
        format!(
            "logger -p user.info {}",
            quote(&format!("MACHINETEST: {event} {}", self.name))
        )
    }

    async fn sit(&mut self) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}Press RET to continue...", self.machine.diagnose());
        drop(stderr);
        let mut line = String::new();
        let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
    }

    async fn finish(mut self, signals: &mut SignalHandler) -> Vec<TestError> {
        self.transition(LifecycleState::Finished);
        self.deadline = Deadline::none();
        let mut errors: Vec<TestError> = self
            .cleanup
            .unwind(
                &mut self.machine,
                &self.deadline,
                self.config.cleanup_timeout,
                signals,
            )
            .await
            .into_iter()
            .map(TestError::from)
            .collect();

        if let Some(tmpdir) = self.local_tmpdir.take() {
            let path = tmpdir.path().to_owned();
            if let Err(error) = tmpdir.close() {
                errors.push(ArtifactError::new("remove", path, error).into());
            }
        }
        errors
    }
}

fn parse_cpu_usage(ps_line: &str) -> Result<f64, TestError> {
    ps_line
        .split_whitespace()
        .next()
        .and_then(|pcpu| pcpu.parse().ok())
        .ok_or_else(|| TestError::failed(format!("unexpected ps output: {ps_line:?}")))
}

/// How a test ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CaseStatus {
    /// No phase recorded an error.
    Passed,

    /// The body failed or the journal had unexpected messages.
    Failed,

    /// The test could not run properly: the machine was unreachable, setup or cleanup failed, or
    /// the run was interrupted.
    Errored,

    /// The test asked to be skipped and nothing else went wrong.
    Skipped {
        /// Why the test was skipped.
        reason: String,
    },
}

/// The record of one test's run.
#[derive(Debug)]
pub struct CaseOutcome {
    name: TestName,
    errors: Vec<(Phase, TestError)>,
    skip_reason: Option<String>,
    time_taken: Duration,
}

impl CaseOutcome {
    pub(crate) fn new(
        name: TestName,
        errors: Vec<(Phase, TestError)>,
        skip_reason: Option<String>,
        time_taken: Duration,
    ) -> Self {
        Self {
            name,
            errors,
            skip_reason,
            time_taken,
        }
    }

    /// The name of the test.
    pub fn name(&self) -> &TestName {
        &self.name
    }

    /// Every error recorded, with the phase it was recorded against, in order.
    pub fn errors(&self) -> &[(Phase, TestError)] {
        &self.errors
    }

    /// Returns true if no phase recorded an error.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// How long the test took.
    pub fn time_taken(&self) -> Duration {
        self.time_taken
    }

    /// Classifies this outcome.
    pub fn status(&self) -> CaseStatus {
        if self
            .errors
            .iter()
            .any(|(phase, error)| error.is_failure_in(*phase))
        {
            CaseStatus::Failed
        } else if !self.errors.is_empty() {
            CaseStatus::Errored
        } else if let Some(reason) = &self.skip_reason {
            CaseStatus::Skipped {
                reason: reason.clone(),
            }
        } else {
            CaseStatus::Passed
        }
    }
}

enum PhaseOutcome<R> {
    Finished(Result<Result<R, TestError>, Box<dyn Any + Send>>),
    Interrupted(crate::signal::InterruptEvent),
}

/// Runs one test through its whole lifecycle on `machine`.
pub(crate) async fn run_case<M: RemoteMachine>(
    test: &dyn MachineTest<M>,
    machine: M,
    config: Arc<HarnessConfig>,
    allow_list: AllowList,
    signals: &mut SignalHandler,
) -> CaseOutcome {
    let start = Instant::now();
    let name = TestName::new(test.name());
    let mut cx = TestContext::new(
        name.clone(),
        machine,
        config,
        allow_list,
        test.allow_core_dumps(),
    );
    let mut errors = Vec::new();
    let mut skip_reason = None;

    cx.transition(LifecycleState::Connecting);
    if let Err(error) = run_phase(&mut cx, signals, async |cx| cx.connect().await).await {
        errors.push((Phase::Connect, error));
    } else {
        cx.transition(LifecycleState::Ready);
        cx.transition(LifecycleState::RunningSetup);
        if let Err(error) = run_phase(&mut cx, signals, async |cx| cx.setup().await).await {
            errors.push((Phase::Setup, error));
        } else {
            cx.transition(LifecycleState::RunningBody);
            match run_body(test, &mut cx, signals).await {
                Ok(()) => {}
                Err(TestError::Skipped { reason }) => skip_reason = Some(reason),
                Err(error) => errors.push((Phase::Body, error)),
            }
        }
    }

    cx.transition(LifecycleState::RunningTeardown);
    // A test that already failed is not blamed for the messages its failure likely caused, and
    // an unreachable machine can't be checked.
    if errors.is_empty() && cx.machine.is_reachable() {
        let res = run_phase(&mut cx, signals, async |cx| {
            cx.check_journal_messages().await
        })
        .await;
        if let Err(error) = res {
            errors.push((Phase::Teardown, error));
        }
    }

    if !errors.is_empty() && cx.config.sit_on_failure {
        let res = run_phase(&mut cx, signals, async |cx| -> Result<(), TestError> {
            cx.sit().await;
            Ok(())
        })
        .await;
        if let Err(error) = res {
            errors.push((Phase::Teardown, error));
        }
    }

    errors.extend(
        cx.finish(signals)
            .await
            .into_iter()
            .map(|error| (Phase::Cleanup, error)),
    );

    for (phase, error) in &errors {
        debug!("{name}: {phase} error: {error}");
    }

    CaseOutcome::new(name, errors, skip_reason, start.elapsed())
}

/// Runs one phase of a test until it finishes, panics or a signal arrives.
///
/// On a signal, the phase's deadline is cancelled and the machine's current operation is
/// interrupted.
async fn run_phase<M, R, F>(
    cx: &mut TestContext<M>,
    signals: &mut SignalHandler,
    phase: F,
) -> Result<R, TestError>
where
    M: RemoteMachine,
    F: AsyncFnOnce(&mut TestContext<M>) -> Result<R, TestError>,
{
    let parent = cx.deadline.clone();
    cx.deadline = parent.derive();

    let outcome = {
        let fut = AssertUnwindSafe(phase(&mut *cx)).catch_unwind();
        tokio::select! {
            res = fut => PhaseOutcome::Finished(res),
            event = signals.recv() => PhaseOutcome::Interrupted(event),
        }
    };
    let deadline = std::mem::replace(&mut cx.deadline, parent);

    match outcome {
        PhaseOutcome::Finished(Ok(res)) => res,
        PhaseOutcome::Finished(Err(payload)) => Err(TestError::from_panic(payload.as_ref())),
        PhaseOutcome::Interrupted(event) => {
            warn!("{}: interrupted by {} while {:?}", cx.name, event.name(), cx.state);
            deadline.cancel();
            cx.machine.interrupt_current_operation();
            Err(TestError::Interrupted {
                event: event.name(),
            })
        }
    }
}

async fn run_body<M: RemoteMachine>(
    test: &dyn MachineTest<M>,
    cx: &mut TestContext<M>,
    signals: &mut SignalHandler,
) -> Result<(), TestError> {
    let timeout = Timeout::new(test.timeout().unwrap_or(cx.config.test_timeout))
        .with_message(format!("test {} timed out", cx.name));

    run_phase(cx, signals, async move |cx: &mut TestContext<M>| {
        let parent = cx.deadline.clone();
        timeout
            .run_with(
                cx,
                &parent,
                async |cx: &mut TestContext<M>, deadline: &Deadline| {
                    cx.deadline = deadline.clone();
                    test.run(cx).await
                },
                |cx| cx.machine.interrupt_current_operation(),
            )
            .await
    })
    .await
}
