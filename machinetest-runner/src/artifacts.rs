// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logs and crash dumps exported from failing tests.
//!
//! Artifacts are written to the current directory, named after the test, the machine and a status
//! tag, and then optionally moved into an attachments directory.

use crate::errors::ArtifactError;
use camino::{Utf8Path, Utf8PathBuf};
use std::{fs, io};
use tracing::{debug, info};

/// The status tag for artifacts exported because a test failed.
pub const FAIL_TAG: &str = "FAIL";

/// Computes artifact file names for one test on one machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactNames {
    stem: String,
}

impl ArtifactNames {
    /// Creates a new set of names.
    pub fn new(test_label: &str, machine_label: &str, tag: &str) -> Self {
        Self {
            stem: format!("{test_label}-{machine_label}-{tag}"),
        }
    }

    /// The file name of the compressed journal export.
    pub fn journal(&self) -> String {
        format!("{}.log.zst", self.stem)
    }

    /// The directory name for downloaded crash dumps.
    pub fn cores(&self) -> String {
        format!("{}.core", self.stem)
    }
}

/// Writes `content` to `path`, compressed with zstd.
pub fn write_compressed(path: &Utf8Path, content: &[u8]) -> Result<(), ArtifactError> {
    let file = fs::File::create(path).map_err(|error| ArtifactError::new("create", path, error))?;
    zstd::stream::copy_encode(content, file, zstd::DEFAULT_COMPRESSION_LEVEL)
        .map_err(|error| ArtifactError::new("compress", path, error))
}

/// Removes `dir` if it is empty. Returns true if it was removed.
pub fn remove_if_empty(dir: &Utf8Path) -> Result<bool, ArtifactError> {
    let mut entries = dir
        .read_dir_utf8()
        .map_err(|error| ArtifactError::new("read", dir, error))?;
    if entries.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(dir).map_err(|error| ArtifactError::new("remove", dir, error))?;
    Ok(true)
}

/// Moves an artifact into `attachments_dir`, if there is one, and returns where it ended up.
///
/// An artifact is left in place if the attachments directory already has an entry of the same
/// name.
pub fn attach(
    artifact: &Utf8Path,
    attachments_dir: Option<&Utf8Path>,
) -> Result<Utf8PathBuf, ArtifactError> {
    let Some(attachments_dir) = attachments_dir else {
        info!("wrote {artifact}");
        return Ok(artifact.to_owned());
    };
    let Some(file_name) = artifact.file_name() else {
        return Ok(artifact.to_owned());
    };

    let dest = attachments_dir.join(file_name);
    if dest.exists() {
        debug!("not attaching {artifact}: {dest} already exists");
        return Ok(artifact.to_owned());
    }

    fs::create_dir_all(attachments_dir)
        .map_err(|error| ArtifactError::new("create", attachments_dir, error))?;
    move_path(artifact, &dest).map_err(|error| ArtifactError::new("move", artifact, error))?;
    info!("attached {dest}");
    Ok(dest)
}

fn move_path(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Attachments often live on another filesystem.
        Err(error) if error.kind() == io::ErrorKind::CrossesDevices => {
            copy_recursive(from, to)?;
            if from.is_dir() {
                fs::remove_dir_all(from)
            } else {
                fs::remove_file(from)
            }
        }
        Err(error) => Err(error),
    }
}

fn copy_recursive(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    if !from.is_dir() {
        return fs::copy(from, to).map(|_| ());
    }
    fs::create_dir(to)?;
    for entry in from.read_dir_utf8()? {
        let entry = entry?;
        copy_recursive(entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}
