// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Harness configuration.
//!
//! Configuration is layered, lowest priority first:
//!
//! 1. the built-in defaults, [`HarnessConfig::DEFAULT_CONFIG`];
//! 2. an optional TOML file;
//! 3. environment variables prefixed with `MACHINETEST_`, with `__` separating nested keys (for
//!    example `MACHINETEST_MACHINE__ADDRESS`).
//!
//! A few unprefixed environment variables understood by older harnesses are applied on top by
//! [`HarnessConfig::apply_legacy_env`].

use crate::{errors::ConfigParseError, output::Verbosity, wait::Wait};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::time::Duration;

/// The environment variable naming a directory to move exported artifacts to.
pub const ATTACHMENTS_ENV: &str = "TEST_ATTACHMENTS";

/// If this environment variable is set, security audit records are not checked.
pub const AUDIT_NO_SELINUX_ENV: &str = "TEST_AUDIT_NO_SELINUX";

/// Overall harness configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HarnessConfig {
    /// How much to log.
    pub verbosity: Verbosity,

    /// Pause before cleanup when a test fails.
    #[serde(alias = "sit_on_failure")]
    pub sit_on_failure: bool,

    /// Where to move exported artifacts.
    #[serde(default, alias = "attachments_dir")]
    pub attachments_dir: Option<Utf8PathBuf>,

    /// How long a single test body may take, unless the test sets its own limit.
    #[serde(with = "humantime_serde", alias = "test_timeout")]
    pub test_timeout: Duration,

    /// How long each cleanup action may take.
    #[serde(with = "humantime_serde", alias = "cleanup_timeout")]
    pub cleanup_timeout: Duration,

    /// The scratch directory on the machine.
    #[serde(alias = "remote_tmpdir")]
    pub remote_tmpdir: String,

    /// How to reach the machine.
    pub machine: MachineConfig,

    /// How long to wait for the machine to become reachable.
    pub connect: ConnectConfig,

    /// How to check the journal.
    pub journal: JournalConfig,
}

/// Connection parameters for the machine under test, handed to the machine driver.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MachineConfig {
    /// The address of the machine.
    #[serde(default)]
    pub address: Option<String>,

    /// The user to log in as.
    pub user: String,

    /// The remote-shell port.
    pub port: u16,

    /// The private key to authenticate with.
    #[serde(default, alias = "identity_file")]
    pub identity_file: Option<Utf8PathBuf>,
}

/// The connect-phase retry budget.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectConfig {
    /// How many times to check reachability.
    pub tries: usize,

    /// The delay between checks.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl ConnectConfig {
    /// Returns the corresponding wait budget.
    pub fn to_wait(self) -> Wait {
        Wait::new()
            .tries(self.tries)
            .delay(self.delay)
            .message("machine did not become reachable")
    }
}

/// Journal checking options.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct JournalConfig {
    /// Extra allowed message patterns for every test.
    #[serde(default, alias = "allowed_messages")]
    pub allowed_messages: Vec<String>,

    /// The least severe priority checked.
    pub priority: u8,

    /// The type code prefix of checked security audit records.
    #[serde(alias = "audit_code_prefix")]
    pub audit_code_prefix: String,

    /// Whether to check security audit records at all.
    #[serde(alias = "scan_audit")]
    pub scan_audit: bool,
}

impl HarnessConfig {
    /// The built-in default configuration.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The prefix for environment variables.
    pub const ENV_PREFIX: &'static str = "MACHINETEST";

    /// Returns the built-in default configuration.
    pub fn default_config() -> Result<Self, ConfigParseError> {
        Self::build(Self::make_default_config(), None)
    }

    /// Loads configuration from the defaults, an optional file and the process environment.
    pub fn from_sources(config_file: Option<&Utf8Path>) -> Result<Self, ConfigParseError> {
        let mut config = Self::from_sources_impl(config_file, None)?;
        config.apply_legacy_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_sources_impl(
        config_file: Option<&Utf8Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigParseError> {
        let mut builder = Self::make_default_config();
        if let Some(config_file) = config_file {
            builder = builder.add_source(File::new(config_file.as_str(), FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix(Self::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );
        Self::build(builder, config_file)
    }

    /// Applies the unprefixed environment variables, [`ATTACHMENTS_ENV`] and
    /// [`AUDIT_NO_SELINUX_ENV`], looked up through `lookup`.
    pub fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ATTACHMENTS_ENV).filter(|dir| !dir.is_empty()) {
            self.attachments_dir = Some(dir.into());
        }
        if lookup(AUDIT_NO_SELINUX_ENV).is_some() {
            self.journal.scan_audit = false;
        }
    }

    /// The verbosity actually used: sitting on failure implies verbose output.
    pub fn effective_verbosity(&self) -> Verbosity {
        if self.sit_on_failure {
            Verbosity::Verbose
        } else {
            self.verbosity
        }
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build(
        builder: ConfigBuilder<DefaultState>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new(config_file.map(Utf8Path::to_owned), err))
    }
}
