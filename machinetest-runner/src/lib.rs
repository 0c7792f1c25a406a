// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for machinetest, a harness for integration tests that run against a live
//! machine reached over a remote-shell session.
//!
//! Each test gets a deterministic lifecycle: the harness connects to the machine, runs the test
//! body under a timeout, scans the machine's journal for unexpected messages, and unwinds every
//! registered cleanup action in reverse order, whatever happened before. The
//! [`TestRunner`](runner::TestRunner) runs tests one at a time and turns their outcomes into a
//! report and a process exit code.
//!
//! Talking to the machine is left to a driver implementing [`RemoteMachine`](remote::RemoteMachine).

pub mod artifacts;
pub mod case;
pub mod cleanup;
pub mod config;
pub mod errors;
mod helpers;
pub mod journal;
pub mod output;
pub mod remote;
pub mod reporter;
pub mod runner;
pub mod signal;
mod time;
pub mod timeout;
pub mod wait;
