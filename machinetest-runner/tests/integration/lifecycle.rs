// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The lifecycle of individual tests: setup, cleanup, journal checks and timeouts.

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use futures::FutureExt;
use indoc::indoc;
use machinetest_runner::{
    case::{TestContext, TestFn},
    cleanup::CleanupAction,
    config::HarnessConfig,
    errors::TestError,
    journal::STACK_TRACE_FAILURE,
    remote::{LogCursor, LogQuery, RemoteMachine, WriteFileOptions},
    runner::TestSuite,
    timeout::{Deadline, Timeout},
};
use pretty_assertions::assert_eq;
use std::time::Duration;

const CORE_DUMPED: &str = "Process 1234 (bash) of user 0 dumped core.";

/// A config whose failure artifacts are moved into a temporary directory.
fn attaching_config() -> (HarnessConfig, Utf8TempDir) {
    let attachments = Utf8TempDir::new().expect("created temp dir");
    let mut config = test_config();
    config.attachments_dir = Some(attachments.path().to_owned());
    (config, attachments)
}

#[test]
fn passing_test() {
    let name = "basic.TestLogin.testBasic";
    let machine = FakeMachine::new();
    let suite = test_fn(name, |cx| {
        async move {
            cx.execute("systemctl start cockpit.socket")
                .await
                .map(drop)
        }
        .boxed_local()
    });

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.passed, 1);
    assert_eq!(stats.exit_code(), 0);
    assert_eq!(
        machine.commands(),
        [
            "true".to_owned(),
            start_marker(name),
            "systemctl start cockpit.socket".to_owned(),
            REMOVE_REMOTE_TMPDIR.to_owned(),
            REMOVE_COREDUMPS.to_owned(),
            end_marker(name),
        ]
    );
    assert_eq!(
        machine.queries(),
        [LogQuery {
            identifiers: vec!["kernel".to_owned(), "systemd-coredump".to_owned()],
            priority: 5,
            cursor: Some(LogCursor::new("s=1;i=2a")),
        }],
        "journal is read from the start of the test"
    );
    assert_eq!(
        report_body(&report),
        indoc! {"
            # ----------------------------------------------------------------------
            # basic.TestLogin.testBasic
            # Result basic.TestLogin.testBasic succeeded
        "}
    );
    assert!(
        summary_line(&report).starts_with("# 1 TEST PASSED ["),
        "summary: {report}"
    );
}

#[test]
fn cleanup_unwinds_in_reverse_even_when_an_action_fails() {
    let name = "cleanup.TestOrder.testReverse";
    let machine = FakeMachine::new().failing("cleanup-2");
    let suite = test_fn(name, |cx| {
        for step in 1..=3 {
            cx.add_cleanup(CleanupAction::execute(format!("cleanup-{step}")));
        }
        async { Ok(()) }.boxed_local()
    });

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(
        machine.commands_between(&start_marker(name), &end_marker(name)),
        [
            "cleanup-3",
            "cleanup-2",
            "cleanup-1",
            REMOVE_REMOTE_TMPDIR,
            REMOVE_COREDUMPS,
        ],
        "every action runs once, newest first"
    );
    assert_eq!(stats.errored, 1, "a failed cleanup is an error, not a test failure");
    assert_eq!(stats.exit_code(), 1);
    assert!(
        report.contains("cleanup action `cleanup-2` failed"),
        "report: {report}"
    );
}

#[test]
fn panicking_cleanup_action_does_not_stop_the_unwind() {
    let name = "cleanup.TestPanic.testLocalPanic";
    let machine = FakeMachine::new();
    let suite = TestSuite::group([
        test_fn(name, |cx| {
            cx.add_cleanup(CleanupAction::execute("cleanup-1"));
            cx.add_cleanup(CleanupAction::local("explode", || panic!("cleanup exploded")));
            async { Ok(()) }.boxed_local()
        }),
        test_fn("cleanup.TestPanic.testNext", |_| async { Ok(()) }.boxed_local()),
    ]);

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(
        machine.commands_between(&start_marker(name), &end_marker(name)),
        ["cleanup-1", REMOVE_REMOTE_TMPDIR, REMOVE_COREDUMPS],
        "the actions registered before the panicking one still ran"
    );
    assert_eq!((stats.errored, stats.passed), (1, 1), "the run carried on");
    assert_eq!(stats.exit_code(), 1);
    assert!(
        report.contains(
            "cleanup action `explode` failed\n  caused by: panicked: cleanup exploded\n"
        ),
        "report: {report}"
    );
    assert!(summary_line(&report).starts_with("# 1 TEST FAILED ["));
}

async fn failing_body(cx: &mut TestContext<FakeMachine>) -> Result<(), TestError> {
    cx.execute("touch /etc/motd").await?;
    Err(TestError::failed("motd was not updated"))
}

#[test]
fn failed_body_still_cleans_up_and_skips_the_journal() {
    let name = "motd.TestMotd.testUpdate";
    let machine = FakeMachine::new().journal(&["kernel: segfault at 0"]);
    let suite = test_fn(name, |cx| failing_body(cx).boxed_local());

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.exit_code(), 1);
    assert_eq!(
        machine.commands_between("touch /etc/motd", &end_marker(name)),
        [REMOVE_REMOTE_TMPDIR, REMOVE_COREDUMPS]
    );
    assert!(
        machine.queries().is_empty(),
        "a failed test is not blamed for journal messages"
    );
    assert_eq!(
        report_body(&report),
        indoc! {"
            # ----------------------------------------------------------------------
            # motd.TestMotd.testUpdate
            motd was not updated
            # Result motd.TestMotd.testUpdate failed
        "}
    );
    assert!(summary_line(&report).starts_with("# 1 TEST FAILED ["));
}

#[test]
fn core_dump_is_expected_only_after_failed_stack_trace() {
    let machine = FakeMachine::new().journal(&[STACK_TRACE_FAILURE, CORE_DUMPED]);
    let suite = test_fn("cores.TestCore.testAfterTrace", |_| {
        async { Ok(()) }.boxed_local()
    });
    let (stats, _) = run_suite(test_config(), &suite, &machine);
    assert_eq!(stats.passed, 1);

    let (config, _attachments) = attaching_config();
    let machine = FakeMachine::new().journal(&[CORE_DUMPED, STACK_TRACE_FAILURE]);
    let suite = test_fn("cores.TestCore.testBeforeTrace", |_| {
        async { Ok(()) }.boxed_local()
    });
    let (stats, report) = run_suite(config.clone(), &suite, &machine);

    assert_eq!(stats.failed, 1);
    assert!(
        report.contains(&format!(
            "FAIL: Test completed, but found unexpected journal messages:\n{CORE_DUMPED}\n"
        )),
        "report: {report}"
    );
    assert!(machine.commands().contains(&"journalctl".to_owned()));
    let attachments_dir = config.attachments_dir.expect("attachments dir is set");
    assert!(
        attachments_dir
            .join("TestCore-testBeforeTrace-fake-FAIL.log.zst")
            .is_file(),
        "journal was exported and attached"
    );
    assert!(
        !attachments_dir
            .join("TestCore-testBeforeTrace-fake-FAIL.core")
            .exists(),
        "no core dumps were downloaded"
    );
}

#[test]
fn allowed_messages_are_scoped_to_one_test() {
    let (config, _attachments) = attaching_config();
    let machine = FakeMachine::new().journal(&["custom-daemon: noisy but harmless"]);
    let suite = TestSuite::group([
        test_fn("scope.TestScope.testAllows", |cx| {
            let res = cx.allow_journal_messages(["custom-daemon: .*"]);
            async move { res }.boxed_local()
        }),
        test_fn("scope.TestScope.testDoesNotAllow", |_| {
            async { Ok(()) }.boxed_local()
        }),
    ]);

    let (stats, report) = run_suite(config, &suite, &machine);

    assert_eq!((stats.passed, stats.failed), (1, 1));
    assert!(report.contains("# Result scope.TestScope.testAllows succeeded"));
    assert!(report.contains("# Result scope.TestScope.testDoesNotAllow failed"));
}

#[test]
fn allowed_core_dumps_are_not_read() {
    let machine = FakeMachine::new();
    let suite = TestSuite::test(
        TestFn::new("cores.TestCore.testAllowed", |_: &mut TestContext<FakeMachine>| {
            async { Ok(()) }.boxed_local()
        })
        .with_core_dumps_allowed(),
    );

    let (stats, _) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.passed, 1);
    let queries = machine.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].identifiers, ["kernel"]);
}

#[test]
fn audit_records_are_checked_unless_disabled() {
    const DENIAL: &str = "type=1400 audit(1700000000.123:42): avc:  denied  { read } for pid=1";

    let (config, _attachments) = attaching_config();
    let machine = FakeMachine::new().audit(&[DENIAL, "type=1403 audit(1.0:1): policy loaded"]);
    let suite = test_fn("audit.TestAudit.testDenial", |_| async { Ok(()) }.boxed_local());
    let (stats, report) = run_suite(config, &suite, &machine);
    assert_eq!(stats.failed, 1);
    assert!(report.contains(DENIAL), "report: {report}");

    let mut config = test_config();
    config.journal.scan_audit = false;
    let machine = FakeMachine::new().audit(&[DENIAL]);
    let suite = test_fn("audit.TestAudit.testIgnored", |_| async { Ok(()) }.boxed_local());
    let (stats, _) = run_suite(config, &suite, &machine);
    assert_eq!(stats.passed, 1);
}

#[test]
fn body_timeout_interrupts_the_machine_once() {
    let name = "timeout.TestHang.testHang";
    let machine = FakeMachine::new();
    let suite = TestSuite::test(
        TestFn::new(name, |cx: &mut TestContext<FakeMachine>| {
            async move { cx.execute(HANG).await.map(drop) }.boxed_local()
        })
        .with_timeout(Duration::from_millis(50)),
    );

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.failed, 1);
    assert_eq!(machine.interrupts(), 1);
    assert!(
        report.contains("test timeout.TestHang.testHang timed out (after 50ms)"),
        "report: {report}"
    );
    assert_eq!(
        machine.commands_between(HANG, &end_marker(name)),
        [REMOVE_REMOTE_TMPDIR, REMOVE_COREDUMPS],
        "cleanup runs after the timeout"
    );
    assert!(machine.queries().is_empty(), "a timed-out body is not scanned");
}

async fn nested_timeouts_body(cx: &mut TestContext<FakeMachine>) -> Result<(), TestError> {
    let deadline = cx.deadline().clone();
    Timeout::new(Duration::from_millis(50))
        .with_message("outer")
        .run(
            cx.machine(),
            &deadline,
            async |machine: &mut FakeMachine, deadline: &Deadline| -> Result<(), TestError> {
                Timeout::from_secs(30)
                    .with_message("inner")
                    .run(
                        machine,
                        deadline,
                        async |machine: &mut FakeMachine,
                               deadline: &Deadline|
                               -> Result<(), TestError> {
                            machine.execute(HANG, deadline).await?;
                            Ok(())
                        },
                    )
                    .await
            },
        )
        .await
}

#[test]
fn inner_timeout_cannot_extend_outer_one() {
    let machine = FakeMachine::new();
    let suite = test_fn("timeout.TestNested.testNested", |cx| {
        nested_timeouts_body(cx).boxed_local()
    });

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.failed, 1);
    assert_eq!(machine.interrupts(), 1);
    assert!(report.contains("\nouter (after 50ms)\n"), "report: {report}");
    assert!(!report.contains("inner"), "report: {report}");
}

async fn release_body(cx: &mut TestContext<FakeMachine>) -> Result<(), TestError> {
    let handle = cx.add_cleanup(CleanupAction::execute("systemctl stop sshd"));
    cx.release(handle).await?;
    cx.execute("systemctl start sshd").await?;
    // Releasing again does nothing.
    cx.release(handle).await
}

#[test]
fn released_cleanup_runs_once() {
    let name = "release.TestRelease.testEarly";
    let machine = FakeMachine::new();
    let suite = test_fn(name, |cx| release_body(cx).boxed_local());

    let (stats, _) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.passed, 1);
    assert_eq!(
        machine.commands_between(&start_marker(name), &end_marker(name)),
        [
            "systemctl stop sshd",
            "systemctl start sshd",
            REMOVE_REMOTE_TMPDIR,
            REMOVE_COREDUMPS,
        ]
    );
}

async fn edit_body(cx: &mut TestContext<FakeMachine>) -> Result<(), TestError> {
    cx.sed_file(
        "s/^#Port 22/Port 2222/",
        "/etc/ssh/sshd_config",
        Some("systemctl restart sshd"),
    )
    .await?;
    cx.restore_file("/etc/motd", None).await?;
    cx.restore_dir("/srv/data", None, false).await?;
    cx.write_file(
        "/etc/issue.d/test.issue",
        "hello",
        &WriteFileOptions::default(),
    )
    .await?;
    Ok(())
}

#[test]
fn machine_changes_are_undone() {
    let name = "edit.TestEdit.testRestore";
    let machine = FakeMachine::new().output("if test -e /etc/motd; then echo yes; fi", "yes\n");
    let suite = test_fn(name, |cx| edit_body(cx).boxed_local());

    let (stats, _) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.passed, 1);
    assert_eq!(
        machine.commands_between(&start_marker(name), &end_marker(name)),
        [
            "sed -i.machinetest 's/^#Port 22/Port 2222/' /etc/ssh/sshd_config",
            "systemctl restart sshd",
            "if test -e /etc/motd; then echo yes; fi",
            "mkdir -p /var/lib/machinetest && cp -a /etc/motd /var/lib/machinetest/_etc_motd",
            "if test -e /srv/data; then echo yes; fi",
            "write /etc/issue.d/test.issue",
            // Cleanup starts here.
            "rm -f /etc/issue.d/test.issue",
            "rm -rf /srv/data",
            "mv /var/lib/machinetest/_etc_motd /etc/motd",
            "mv /etc/ssh/sshd_config.machinetest /etc/ssh/sshd_config",
            "systemctl restart sshd",
            REMOVE_REMOTE_TMPDIR,
            REMOVE_COREDUMPS,
        ]
    );
}

async fn restore_body(cx: &mut TestContext<FakeMachine>) -> Result<(), TestError> {
    cx.restore_dir("/etc/ssh", Some("systemctl restart sshd"), false)
        .await?;
    cx.restore_dir("/var/lib/app", Some("systemctl restart app"), true)
        .await?;
    cx.restore_file("/etc/motd", Some("systemctl reload motd"))
        .await?;
    Ok(())
}

#[test]
fn existing_paths_are_backed_up_and_restored() {
    let name = "edit.TestEdit.testRestoreExisting";
    let machine = FakeMachine::new()
        .output("if test -e /etc/ssh; then echo yes; fi", "yes\n")
        .output("if test -e /var/lib/app; then echo yes; fi", "yes\n")
        .output("if test -e /etc/motd; then echo yes; fi", "yes\n");
    let suite = test_fn(name, |cx| restore_body(cx).boxed_local());

    let (stats, _) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.passed, 1);
    assert_eq!(
        machine.commands_between(&start_marker(name), &end_marker(name)),
        [
            "if test -e /etc/ssh; then echo yes; fi",
            "mkdir -p /var/lib/machinetest && cp -a /etc/ssh/ /var/lib/machinetest/_etc_ssh/",
            "mount -o bind /var/lib/machinetest/_etc_ssh /etc/ssh",
            "if test -e /var/lib/app; then echo yes; fi",
            "mkdir -p /var/lib/machinetest && cp -a /var/lib/app/ /var/lib/machinetest/_var_lib_app/",
            "if test -e /etc/motd; then echo yes; fi",
            "mkdir -p /var/lib/machinetest && cp -a /etc/motd /var/lib/machinetest/_etc_motd",
            // Cleanup starts here; each restore is followed by its action.
            "mv /var/lib/machinetest/_etc_motd /etc/motd",
            "systemctl reload motd",
            "rm -rf /var/lib/app && mv /var/lib/machinetest/_var_lib_app /var/lib/app",
            "systemctl restart app",
            "umount -lf /etc/ssh",
            "systemctl restart sshd",
            REMOVE_REMOTE_TMPDIR,
            REMOVE_COREDUMPS,
        ]
    );
}

#[test]
fn unreachable_machine_is_an_error() {
    let machine = FakeMachine::new().unreachable();
    let suite = test_fn("connect.TestConnect.testDown", |cx| {
        async move { cx.execute("body ran").await.map(drop) }.boxed_local()
    });

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.errored, 1);
    assert_eq!(stats.exit_code(), 1);
    assert_eq!(
        machine.commands(),
        ["true", "true", "true"],
        "only the connect probe ran"
    );
    assert!(
        report.contains("machine `fake` at 192.0.2.1 did not become reachable"),
        "report: {report}"
    );
}

async fn panicking_body(_: &mut TestContext<FakeMachine>) -> Result<(), TestError> {
    panic!("kaboom")
}

#[test]
fn panicking_body_fails_and_cleans_up() {
    let name = "panic.TestPanic.testPanic";
    let machine = FakeMachine::new();
    let suite = test_fn(name, |cx| panicking_body(cx).boxed_local());

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.failed, 1);
    assert!(report.contains("panicked: kaboom"), "report: {report}");
    assert!(machine.commands().contains(&end_marker(name)));
}
