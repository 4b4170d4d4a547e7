#![forbid(unsafe_code)]

//! Error taxonomy for the archiving engine.
//!
//! Startup errors are fatal. Everything raised during a run is collected into
//! an [`ArchiveError`], grouped per channel, so callers can tell a single
//! failed video apart from a channel that never ran.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the remote metadata API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{operation}: http status {status}: {message}")]
    Http {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("{operation}: transport: {message}")]
    Transport { operation: String, message: String },

    #[error("{operation}: decoding response: {message}")]
    Decode { operation: String, message: String },

    #[error("channel {identity} not found")]
    NotFound { identity: String },

    #[error("channel {identity} matched {matches} channels")]
    Ambiguous { identity: String, matches: usize },
}

/// Configuration problems with a channel's identifying fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no identifying information for channel")]
    Unidentified,

    #[error("ambiguous channel identity: set only one of id, handle or username (got {0})")]
    Ambiguous(String),
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Outcome of the last attempt when a download gives up.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("starting {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed with {status}{}", stderr_suffix(.stderr))]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("cancelled before the download started")]
    Cancelled,

    #[error("download worker panicked: {0}")]
    Panicked(String),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// A download failure tied to the video it belongs to.
#[derive(Debug, Error)]
#[error("archive video {video_id}: {source}")]
pub struct VideoError {
    pub video_id: String,
    #[source]
    pub source: DownloadError,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("download pool is closed")]
    Closed,

    #[error("archive run cancelled")]
    Cancelled,
}

/// Why walking a channel's uploads stopped early.
#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("uploads of {channel_id} (page {page}): {source}")]
    Api {
        channel_id: String,
        page: usize,
        #[source]
        source: ApiError,
    },

    #[error("uploads of {channel_id}: no results returned")]
    EmptyFeed { channel_id: String },

    #[error("uploads of {channel_id}: halted at {video_id}: {source}")]
    Halted {
        channel_id: String,
        video_id: String,
        #[source]
        source: PoolError,
    },
}

/// One entry in a channel's error list.
#[derive(Debug, Error)]
pub enum ChannelFailure {
    #[error("channel not in cache")]
    CacheMiss,

    #[error(transparent)]
    Enumerate(#[from] EnumerateError),

    #[error("writing channel info {}: {source}", .path.display())]
    ChannelInfo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Video(#[from] VideoError),
}

/// Every failure recorded while archiving a single channel.
#[derive(Debug)]
pub struct ChannelErrors {
    channel: String,
    failures: Vec<ChannelFailure>,
}

impl ChannelErrors {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, failure: impl Into<ChannelFailure>) {
        self.failures.push(failure.into());
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn failures(&self) -> &[ChannelFailure] {
        &self.failures
    }

    /// IDs of the videos whose download failed in this run.
    pub fn failed_videos(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().filter_map(|failure| match failure {
            ChannelFailure::Video(err) => Some(err.video_id.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for ChannelErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "\tchannel {}: {} archiving errors:",
            self.channel,
            self.failures.len()
        )?;
        for failure in &self.failures {
            writeln!(f, "\t\t- {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ChannelErrors {}

/// Returned by [`crate::Archiver::archive`] when any channel recorded a
/// failure. Archiving never stops at the first error, so this holds the
/// complete picture of the run.
#[derive(Debug, Default)]
pub struct ArchiveError {
    channels: Vec<ChannelErrors>,
}

impl ArchiveError {
    pub fn push(&mut self, errors: ChannelErrors) {
        self.channels.push(errors);
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[ChannelErrors] {
        &self.channels
    }

    pub fn channel(&self, channel: &str) -> Option<&ChannelErrors> {
        self.channels.iter().find(|errors| errors.channel == channel)
    }
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "archiver: {} channel errors during archiving:",
            self.channels.len()
        )?;
        for channel in &self.channels {
            write!(f, "{channel}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ArchiveError {}

/// Conditions that keep the archiver from starting at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("empty API key")]
    ApiKey,

    #[error("downloader {program}: {reason}")]
    Downloader { program: String, reason: String },

    #[error("bad download directory {}: {source}", .path.display())]
    DownloadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("build channel cache for {identity}: {source}")]
    CacheBuild {
        identity: String,
        #[source]
        source: ApiError,
    },
}
