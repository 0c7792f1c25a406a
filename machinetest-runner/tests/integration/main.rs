// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: whole suites run against a scripted machine.

mod fixtures;
mod lifecycle;
mod runner;
