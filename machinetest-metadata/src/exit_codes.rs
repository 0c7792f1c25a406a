// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for machinetest runs.
///
/// The values follow the automake test-driver convention so that harness binaries can be wired
/// into existing CI directly: `0` for success, `1` for failure, and `77` for "skipped".
pub enum MachineTestExitCode {}

impl MachineTestExitCode {
    /// Every test that ran passed.
    pub const OK: i32 = 0;

    /// One or more tests failed or errored.
    pub const TEST_RUN_FAILED: i32 = 1;

    /// Every selected test was skipped.
    pub const ALL_SKIPPED: i32 = 77;

    /// Returns the exit code for a run with the given counts.
    ///
    /// A run where every test was skipped takes precedence over failures, since no test produced
    /// a result. This includes a run with no tests at all.
    pub fn for_counts(total: usize, skipped: usize, failed: usize) -> i32 {
        if skipped == total {
            Self::ALL_SKIPPED
        } else if failed > 0 {
            Self::TEST_RUN_FAILED
        } else {
            Self::OK
        }
    }
}
