#![forbid(unsafe_code)]

//! Channel cache entries and uploads enumeration.

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::api::{ChannelIdentity, Video, VideoApi};
use crate::error::{ApiError, EnumerateError};

/// Channel details cached for the lifetime of the process. Resolved once to
/// preserve API quota.
#[derive(Debug, Clone)]
pub struct CachedChannel {
    pub id: String,
    pub name: String,
    pub uploads_id: String,
    /// Video IDs archived or in flight. `None` means the channel's history is
    /// unknown and every page must be walked; once set it is never cleared.
    pub seen: Option<HashSet<String>>,
}

impl CachedChannel {
    pub fn resolve(api: &dyn VideoApi, identity: &ChannelIdentity) -> Result<Self, ApiError> {
        let info = api.resolve_channel(identity)?;
        Ok(Self {
            id: info.id,
            name: info.name,
            uploads_id: info.uploads_id,
            seen: None,
        })
    }

    pub fn has_seen(&self, video_id: &str) -> bool {
        self.seen
            .as_ref()
            .is_some_and(|seen| seen.contains(video_id))
    }

    /// Records a video as archived, switching the channel to incremental mode.
    pub fn mark_seen(&mut self, video_id: impl Into<String>) {
        self.seen
            .get_or_insert_with(HashSet::new)
            .insert(video_id.into());
    }

    /// Switches the channel to incremental mode without recording a video.
    /// Once any page has been looked at there is no need to walk the whole
    /// history again, even if nothing was selected.
    pub fn mark_history_known(&mut self) {
        self.seen.get_or_insert_with(HashSet::new);
    }

    /// Forgets a video so the next run picks it up again.
    pub fn unmark_seen(&mut self, video_id: &str) {
        if let Some(seen) = self.seen.as_mut() {
            seen.remove(video_id);
        }
    }

    /// Visits every published upload of the channel in feed order.
    ///
    /// With no history every page is requested; otherwise only the newest page
    /// is checked, as anything older was seen by an earlier run. Upcoming and
    /// live videos are skipped without reaching `visit`, so they are looked at
    /// again next time. The first error from `visit` stops the walk.
    pub fn enumerate<F>(&mut self, api: &dyn VideoApi, mut visit: F) -> Result<(), EnumerateError>
    where
        F: FnMut(&mut CachedChannel, &Video) -> Result<(), EnumerateError>,
    {
        let full_history = self.seen.is_none();
        let mut page_token: Option<String> = None;
        let mut page = 0usize;

        loop {
            page += 1;
            let response = api
                .playlist_page(&self.uploads_id, page_token.as_deref())
                .map_err(|source| EnumerateError::Api {
                    channel_id: self.id.clone(),
                    page,
                    source,
                })?;

            if response.items.is_empty() {
                if page == 1 {
                    return Err(EnumerateError::EmptyFeed {
                        channel_id: self.id.clone(),
                    });
                }
                return Ok(());
            }

            let ids: Vec<String> = response.items.iter().map(|item| item.id.clone()).collect();
            let statuses = api
                .live_status(&ids)
                .map_err(|source| EnumerateError::Api {
                    channel_id: self.id.clone(),
                    page,
                    source,
                })?;

            for video in &response.items {
                if let Some(status) = statuses.get(&video.id)
                    && !status.is_published()
                {
                    debug!(channel = %self.id, video_id = %video.id, ?status, "skipping unpublished video");
                    continue;
                }
                visit(self, video)?;
            }

            match response.next_page_token {
                Some(token) if full_history => page_token = Some(token),
                _ => return Ok(()),
            }
        }
    }
}

impl fmt::Display for CachedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
