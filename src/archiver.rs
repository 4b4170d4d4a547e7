#![forbid(unsafe_code)]

//! The archiving engine.
//!
//! An [`Archiver`] owns the channel cache for the whole process. Each call to
//! [`Archiver::archive`] walks the configured channels one after another,
//! feeding every new, selected and published video to a fresh download pool.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChannelIdentity, VideoApi};
use crate::channel::CachedChannel;
use crate::config::ArchiverConfig;
use crate::download::{Fetcher, Job};
use crate::error::{
    ArchiveError, ChannelErrors, ChannelFailure, EnumerateError, StartupError,
};
use crate::pool::DownloadPool;
use crate::reconcile::reconcile_channel;
use crate::selector::{Selector, select_all};

/// A configured channel and the selectors scoped to it.
#[derive(Debug)]
pub struct ChannelTarget {
    pub identity: ChannelIdentity,
    pub selectors: Vec<Selector>,
}

impl ChannelTarget {
    pub fn new(identity: ChannelIdentity) -> Self {
        Self {
            identity,
            selectors: Vec::new(),
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selectors.push(selector);
        self
    }
}

pub struct Archiver<A: VideoApi> {
    config: ArchiverConfig,
    api: A,
    targets: Vec<ChannelTarget>,
    selectors: Vec<Selector>,
    cache: HashMap<ChannelIdentity, CachedChannel>,
    fetcher: Arc<dyn Fetcher>,
    shutdown: CancellationToken,
}

impl<A: VideoApi> Archiver<A> {
    /// Resolves every configured channel, then seeds the seen-sets from what
    /// is already on disk. Any channel that cannot be resolved is fatal.
    pub fn new(
        config: ArchiverConfig,
        api: A,
        targets: Vec<ChannelTarget>,
        selectors: Vec<Selector>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, StartupError> {
        let mut cache = HashMap::with_capacity(targets.len());
        for target in &targets {
            if cache.contains_key(&target.identity) {
                continue;
            }
            let channel = CachedChannel::resolve(&api, &target.identity).map_err(|source| {
                StartupError::CacheBuild {
                    identity: target.identity.to_string(),
                    source,
                }
            })?;
            info!(
                identity = %target.identity,
                channel = %channel.id,
                name = %channel.name,
                "resolved channel"
            );
            cache.insert(target.identity.clone(), channel);
        }

        let mut archiver = Self::with_cache(config, api, targets, selectors, fetcher, cache);
        archiver.reconcile();
        Ok(archiver)
    }

    fn with_cache(
        config: ArchiverConfig,
        api: A,
        targets: Vec<ChannelTarget>,
        selectors: Vec<Selector>,
        fetcher: Arc<dyn Fetcher>,
        cache: HashMap<ChannelIdentity, CachedChannel>,
    ) -> Self {
        Self {
            config,
            api,
            targets,
            selectors,
            cache,
            fetcher,
            shutdown: CancellationToken::new(),
        }
    }

    fn reconcile(&mut self) {
        for channel in self.cache.values_mut() {
            reconcile_channel(&self.config.root, channel);
        }
    }

    /// Cancelling this token stops every run in progress after the downloads
    /// already running finish. A cancelled archiver stays cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn channel(&self, identity: &ChannelIdentity) -> Option<&CachedChannel> {
        self.cache.get(identity)
    }

    /// Runs one archiving pass over every configured channel.
    ///
    /// Failures never stop the pass; they are collected per channel and
    /// returned together.
    pub fn archive(&mut self) -> Result<(), ArchiveError> {
        let Self {
            config,
            api,
            targets,
            selectors,
            cache,
            fetcher,
            shutdown,
        } = self;
        let run = ChannelRun {
            config,
            api: &*api,
            fetcher,
            shutdown,
        };

        let mut report = ArchiveError::default();
        for target in targets.iter_mut() {
            let mut errors = ChannelErrors::new(target.identity.to_string());
            match cache.get_mut(&target.identity) {
                Some(channel) => {
                    run.archive_channel(channel, &mut target.selectors, selectors, &mut errors)
                }
                None => {
                    warn!(identity = %target.identity, "channel missing from cache");
                    errors.push(ChannelFailure::CacheMiss);
                }
            }
            if !errors.is_empty() {
                report.push(errors);
            }
        }

        if report.is_empty() {
            Ok(())
        } else {
            Err(report)
        }
    }
}

struct ChannelRun<'a> {
    config: &'a ArchiverConfig,
    api: &'a dyn VideoApi,
    fetcher: &'a Arc<dyn Fetcher>,
    shutdown: &'a CancellationToken,
}

impl ChannelRun<'_> {
    fn archive_channel(
        &self,
        channel: &mut CachedChannel,
        channel_selectors: &mut [Selector],
        global_selectors: &mut [Selector],
        errors: &mut ChannelErrors,
    ) {
        info!(channel = %channel.id, name = %channel, "archiving channel");
        let mut pool = DownloadPool::new(
            self.config.max_parallel,
            self.shutdown.child_token(),
            Arc::clone(self.fetcher),
        );

        if self.config.dump_channel_info
            && let Err(failure) = write_channel_info(&self.config.root, channel)
        {
            warn!(channel = %channel.id, "{failure}");
            errors.push(failure);
        }

        let root = self.config.root.as_path();
        let api = self.api;
        let mut submitted = 0usize;
        let walked = channel.enumerate(api, |channel, video| {
            if channel.has_seen(&video.id) {
                return Ok(());
            }
            let selected = select_all(
                channel_selectors.iter_mut().chain(global_selectors.iter_mut()),
                video,
                api,
            );
            if !selected {
                debug!(channel = %channel.id, video_id = %video.id, "not selected");
                return Ok(());
            }

            pool.submit(Job::new(root, &channel.id, &video.id))
                .map_err(|source| EnumerateError::Halted {
                    channel_id: channel.id.clone(),
                    video_id: video.id.clone(),
                    source,
                })?;
            channel.mark_seen(video.id.clone());
            submitted += 1;
            Ok(())
        });
        match walked {
            // A finished walk covered the history even if nothing was selected.
            Ok(()) => channel.mark_history_known(),
            Err(err) => {
                warn!(channel = %channel.id, "enumeration stopped: {err}");
                errors.push(err);
            }
        }

        pool.close();
        let failures = pool.wait();
        info!(
            channel = %channel.id,
            submitted,
            failed = failures.len(),
            "channel run finished"
        );
        for failure in failures {
            channel.unmark_seen(&failure.video_id);
            errors.push(failure);
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelInfoFile<'a> {
    id: &'a str,
    name: &'a str,
    uploads_id: &'a str,
    updated_at: DateTime<Utc>,
}

fn write_channel_info(root: &Path, channel: &CachedChannel) -> Result<PathBuf, ChannelFailure> {
    let dir = root.join(&channel.id);
    let path = dir.join("channel.json");
    let info = ChannelInfoFile {
        id: &channel.id,
        name: &channel.name,
        uploads_id: &channel.uploads_id,
        updated_at: Utc::now(),
    };
    let result = fs::create_dir_all(&dir).and_then(|()| {
        let body = serde_json::to_vec_pretty(&info).map_err(io::Error::from)?;
        fs::write(&path, body)
    });
    match result {
        Ok(()) => Ok(path),
        Err(source) => Err(ChannelFailure::ChannelInfo { path, source }),
    }
}
