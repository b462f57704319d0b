use std::fs::DirBuilder;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Output};

use thiserror::Error;

use crate::prelude::*;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to start [{command}]: {err}")]
    Start { command: String, err: std::io::Error },

    #[error("[{command}] failed with {status}: {stderr}")]
    Failure {
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
}

pub fn command_to_string(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

// Runs the command to completion, a non-zero exit status is an error.
pub fn execute(command: &mut Command) -> Result<Output, ExecError> {
    let output = command.output().map_err(|err| ExecError::Start {
        command: command_to_string(command),
        err,
    })?;
    if !output.status.success() {
        return Err(ExecError::Failure {
            command: command_to_string(command),
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

/// Writes through a dot-prefixed sibling and renames it over `path`, so a
/// reader never observes a half-written file.
pub fn write_atomic(path: &Path, content: &str) -> Void {
    let file_name = path
        .file_name()
        .and_then(|it| it.to_str())
        .ok_or(anyhow!("file name should exists"))?;
    let dir = path.parent().ok_or(anyhow!("parent should not be none"))?;
    DirBuilder::new().recursive(true).mode(0o755).create(dir)?;
    let tmp_file_path = dir.join(format!(".{}", file_name));
    let mut tmp_file = std::fs::File::create(&tmp_file_path)?;
    tmp_file.write_all(content.as_bytes())?;
    tmp_file.sync_all()?;
    std::fs::rename(tmp_file_path, path)?;
    Ok(())
}

/// Removes a file or a directory tree; a missing path is not an error.
pub fn force_delete(path: &Path) -> Void {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Void {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .with_context(|| format!("creating {}", path.display()))
}
