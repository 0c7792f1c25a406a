// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable metadata for machinetest runs.
//!
//! Scripts and CI systems that drive a machinetest binary can use the constants here to interpret
//! its exit status without depending on the full runner.

mod exit_codes;

pub use exit_codes::*;
