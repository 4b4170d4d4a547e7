#![forbid(unsafe_code)]

//! Wrapper around the external downloader (yt-dlp or a compatible fork).
//!
//! The tool is a black box: a zero exit status means the video landed on
//! disk, anything else is a failure worth retrying.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::config::{ArchiverConfig, RetryPolicy};
use crate::error::DownloadError;

pub const WATCH_URL: &str = "https://youtube.com/watch?v=";

/// Container yt-dlp merges separate audio/video streams into.
const MERGE_FORMAT: &str = "mp4";

/// Longest stderr excerpt carried in an error.
const STDERR_TAIL_LIMIT: usize = 400;

/// One video to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub video_id: String,
    pub channel_id: String,
    /// yt-dlp output template, `<root>/<channel>/<video>.%(ext)s`.
    pub output: PathBuf,
}

impl Job {
    pub fn new(root: &Path, channel_id: &str, video_id: &str) -> Self {
        Self {
            video_id: video_id.to_owned(),
            channel_id: channel_id.to_owned(),
            output: root.join(channel_id).join(format!("{video_id}.%(ext)s")),
        }
    }
}

/// Executes jobs on behalf of the worker pool.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, job: &Job) -> Result<(), DownloadError>;
}

pub fn watch_url(video_id: &str) -> String {
    format!("{WATCH_URL}{video_id}")
}

/// Downloads a single video with the configured retry policy.
pub fn download(config: &ArchiverConfig, video_id: &str, output: &Path) -> Result<(), DownloadError> {
    Downloader::from_config(config).download(video_id, output)
}

#[derive(Debug, Clone)]
pub struct Downloader {
    program: PathBuf,
    retry: RetryPolicy,
    write_info_json: bool,
}

impl Downloader {
    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self {
            program: config.downloader.clone(),
            retry: config.retry,
            write_info_json: config.dump_video_info,
        }
    }

    pub fn download(&self, video_id: &str, output: &Path) -> Result<(), DownloadError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(video_id, output) {
                Ok(()) => {
                    debug!(video_id, attempt, "download finished");
                    return Ok(());
                }
                Err(err) if self.retry.allows_retry_after(attempt) => {
                    warn!(video_id, attempt, "download failed, retrying: {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn command(&self, video_id: &str, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-o")
            .arg(output)
            .arg("--merge-output-format")
            .arg(MERGE_FORMAT);
        if self.write_info_json {
            command.arg("--write-info-json");
        }
        command.arg(watch_url(video_id));
        command
    }

    fn attempt(&self, video_id: &str, output: &Path) -> Result<(), DownloadError> {
        let program = self.program.display().to_string();
        let result = self
            .command(video_id, output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| DownloadError::Spawn {
                program: program.clone(),
                source,
            })?;

        if result.status.success() {
            return Ok(());
        }

        Err(DownloadError::Exit {
            program,
            status: result.status.to_string(),
            stderr: stderr_tail(&result.stderr),
        })
    }
}

impl Fetcher for Downloader {
    fn fetch(&self, job: &Job) -> Result<(), DownloadError> {
        self.download(&job.video_id, &job.output)
    }
}

/// Keeps the last meaningful line the tool printed, which is where yt-dlp
/// puts its `ERROR:` summary.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or_default();
    if line.chars().count() > STDERR_TAIL_LIMIT {
        line.chars().take(STDERR_TAIL_LIMIT).collect()
    } else {
        line.to_owned()
    }
}
