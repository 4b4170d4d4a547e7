#![forbid(unsafe_code)]

//! Checks run once before the archiver starts.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::StartupError;

/// Name of the file written into the archive root to prove it is writable.
pub const PROBE_FILE: &str = ".ytarchiver";

/// Refuses to start as root: everything the archiver writes would end up
/// owned by root inside the archive.
pub fn ensure_not_root(process: &str) -> Result<()> {
    refuse_root(Uid::effective(), process)
}

fn refuse_root(uid: Uid, process: &str) -> Result<()> {
    if !uid.is_root() {
        return Ok(());
    }
    bail!("{process} must not be run as root; start it as the user that owns the archive")
}

pub fn check_api_key(api_key: &str) -> Result<(), StartupError> {
    if api_key.trim().is_empty() {
        return Err(StartupError::ApiKey);
    }
    Ok(())
}

/// Runs `<program> --version` so a missing or broken downloader is reported
/// at startup instead of once per video.
pub fn check_downloader(program: &Path) -> Result<(), StartupError> {
    let status = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    let reason = match status {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => format!("installed but `--version` returned {status}"),
        Err(err) => format!("not installed or not executable: {err}"),
    };
    Err(StartupError::Downloader {
        program: program.display().to_string(),
        reason,
    })
}

/// Creates the archive root if needed and proves it is writable by leaving a
/// probe file behind.
pub fn check_download_directory(root: &Path) -> Result<(), StartupError> {
    let probe = root.join(PROBE_FILE);
    fs::create_dir_all(root)
        .and_then(|()| fs::write(&probe, b"ytarchiver\n"))
        .map_err(|source| StartupError::DownloadDir {
            path: root.to_path_buf(),
            source,
        })
}
