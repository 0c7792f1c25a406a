// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running whole suites: aggregation, exit codes and listing.

use crate::fixtures::*;
use futures::FutureExt;
use machinetest_metadata::MachineTestExitCode;
use machinetest_runner::{
    errors::TestError,
    runner::{TestRunner, TestSuite},
};
use pretty_assertions::assert_eq;

fn passing(name: &str) -> TestSuite<FakeMachine> {
    test_fn(name, |_| async { Ok(()) }.boxed_local())
}

fn failing(name: &str) -> TestSuite<FakeMachine> {
    test_fn(name, |_| {
        async { Err(TestError::failed("assertion failed")) }.boxed_local()
    })
}

fn skipping(name: &str, reason: &'static str) -> TestSuite<FakeMachine> {
    test_fn(name, move |_| async move { Err(TestError::skip(reason)) }.boxed_local())
}

#[test]
fn all_passed_exits_zero() {
    let machine = FakeMachine::new();
    let suite = TestSuite::group([passing("a.T.one"), skipping("a.T.two", "no tpm")]);

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!((stats.passed, stats.skipped), (1, 1));
    assert_eq!(stats.exit_code(), MachineTestExitCode::OK);
    assert!(report.contains("# Result a.T.two skipped: no tpm\n"));
    assert!(
        summary_line(&report).starts_with("# 2 TESTS PASSED ["),
        "report: {report}"
    );
}

#[test]
fn any_failure_exits_one() {
    let machine = FakeMachine::new();
    let suite = TestSuite::group([
        passing("b.T.one"),
        failing("b.T.two"),
        skipping("b.T.three", "no network"),
        passing("b.T.four"),
    ]);

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.initial_run_count, 4);
    assert_eq!(stats.finished_count, 4, "a failure does not stop the run");
    assert_eq!((stats.passed, stats.failed, stats.skipped), (2, 1, 1));
    assert_eq!(stats.exit_code(), MachineTestExitCode::TEST_RUN_FAILED);
    assert!(
        summary_line(&report).starts_with("# 1 TEST FAILED ["),
        "report: {report}"
    );
}

#[test]
fn all_skipped_exits_77() {
    let machine = FakeMachine::new();
    let suite = TestSuite::group([
        skipping("c.T.one", "no tpm"),
        skipping("c.T.two", "no network"),
    ]);

    let (stats, report) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.exit_code(), MachineTestExitCode::ALL_SKIPPED);
    assert_eq!(
        summary_line(&report),
        "# SKIP c.T.one no tpm, c.T.two no network"
    );
    assert_eq!(
        machine.queries().len(),
        2,
        "skipped tests still have their journal checked"
    );
}

#[test]
fn failing_skip_is_not_a_skip() {
    let (stats, _) = run_suite(
        test_config(),
        &skipping("d.T.one", "no tpm"),
        &FakeMachine::new().failing(&end_marker("d.T.one")),
    );

    assert_eq!((stats.errored, stats.skipped), (1, 0));
    assert_eq!(stats.exit_code(), MachineTestExitCode::TEST_RUN_FAILED);
}

#[test]
fn each_test_gets_its_own_session() {
    let machine = FakeMachine::new();
    let suite = TestSuite::group([
        passing("e.T.one"),
        TestSuite::group([passing("e.T.two"), passing("e.T.three")]),
    ]);

    let (stats, _) = run_suite(test_config(), &suite, &machine);

    assert_eq!(stats.passed, 3);
    assert_eq!(machine.sessions(), 3);
}

#[test]
fn list_flattens_in_run_order() {
    let suite = TestSuite::group([
        passing("f.A.one"),
        TestSuite::group([
            passing("f.B.two"),
            TestSuite::group([]),
            passing("f.B.three"),
        ]),
        passing("f.A.four"),
    ]);

    assert_eq!(
        TestRunner::list(&suite),
        ["f.A.one", "f.B.two", "f.B.three", "f.A.four"]
    );
}

#[test]
fn empty_suite_counts_as_skipped() {
    let (stats, _) = run_suite(test_config(), &TestSuite::group([]), &FakeMachine::new());
    assert_eq!(stats.finished_count, 0);
    assert_eq!(stats.exit_code(), MachineTestExitCode::ALL_SKIPPED);
}
