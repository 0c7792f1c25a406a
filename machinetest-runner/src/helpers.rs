// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for machinetest-runner.

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "TEST" if `count` is 1, otherwise "TESTS".
    pub fn tests_upper_str(count: usize) -> &'static str {
        if count == 1 { "TEST" } else { "TESTS" }
    }

    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }
}

/// Returns the local hostname up to the first dot.
pub(crate) fn short_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            let name = name.to_string_lossy();
            if let Some(short) = name.split('.').next().filter(|short| !short.is_empty()) {
                return short.to_owned();
            }
        }
    }
    "localhost".to_owned()
}
