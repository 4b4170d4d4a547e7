#![forbid(unsafe_code)]

//! Per-video selection criteria.
//!
//! Every configured selector must agree before a video is archived. Channel
//! scoped selectors run first, then the global ones; an empty list selects
//! everything.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::{Video, VideoApi};
use crate::error::{ApiError, SelectorError};

/// Age after which a playlist's membership is fetched again.
pub const PLAYLIST_STALE_AFTER: TimeDelta = TimeDelta::hours(24);

/// Video field a [`RegexSelector`] matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegexField {
    Title,
    Description,
}

#[derive(Debug)]
pub enum Selector {
    Regex(RegexSelector),
    Playlist(PlaylistSelector),
    Ids(IdSelector),
}

impl Selector {
    pub fn regex(field: RegexField, pattern: &str) -> Result<Self, SelectorError> {
        RegexSelector::new(field, pattern).map(Self::Regex)
    }

    pub fn playlist(playlist_id: impl Into<String>) -> Self {
        Self::Playlist(PlaylistSelector::new(playlist_id))
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Ids(IdSelector::new(ids))
    }

    /// Reports whether this criterion accepts the video. Only the playlist
    /// variant talks to the API.
    pub fn should_select(&mut self, video: &Video, api: &dyn VideoApi) -> bool {
        match self {
            Self::Regex(selector) => selector.should_select(video),
            Self::Playlist(selector) => selector.should_select_at(video, api, Utc::now()),
            Self::Ids(selector) => selector.should_select(video),
        }
    }
}

/// Runs every selector in order and stops at the first rejection.
pub fn select_all<'a>(
    selectors: impl IntoIterator<Item = &'a mut Selector>,
    video: &Video,
    api: &dyn VideoApi,
) -> bool {
    selectors
        .into_iter()
        .all(|selector| selector.should_select(video, api))
}

#[derive(Debug)]
pub struct RegexSelector {
    field: RegexField,
    pattern: Regex,
}

impl RegexSelector {
    pub fn new(field: RegexField, pattern: &str) -> Result<Self, SelectorError> {
        let compiled = Regex::new(pattern).map_err(|source| SelectorError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            field,
            pattern: compiled,
        })
    }

    pub fn should_select(&self, video: &Video) -> bool {
        let haystack = match self.field {
            RegexField::Title => &video.title,
            RegexField::Description => &video.description,
        };
        self.pattern.is_match(haystack)
    }
}

/// Selects videos that belong to a playlist. The membership list is fetched
/// lazily and kept for [`PLAYLIST_STALE_AFTER`] to spare API quota.
#[derive(Debug)]
pub struct PlaylistSelector {
    playlist_id: String,
    members: HashSet<String>,
    loaded_at: Option<DateTime<Utc>>,
}

impl PlaylistSelector {
    pub fn new(playlist_id: impl Into<String>) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            members: HashSet::new(),
            loaded_at: None,
        }
    }

    fn needs_load(&self, now: DateTime<Utc>) -> bool {
        match self.loaded_at {
            None => true,
            Some(loaded_at) => now - loaded_at > PLAYLIST_STALE_AFTER,
        }
    }

    /// Same as [`Selector::should_select`] with an explicit clock.
    pub fn should_select_at(
        &mut self,
        video: &Video,
        api: &dyn VideoApi,
        now: DateTime<Utc>,
    ) -> bool {
        if self.needs_load(now) {
            match fetch_members(api, &self.playlist_id) {
                Ok(members) => {
                    debug!(
                        playlist = %self.playlist_id,
                        count = members.len(),
                        "loaded playlist membership"
                    );
                    self.members = members;
                    self.loaded_at = Some(now);
                }
                Err(err) => {
                    warn!(
                        playlist = %self.playlist_id,
                        video_id = %video.id,
                        "could not load playlist, skipping video: {err}"
                    );
                    return false;
                }
            }
        }

        self.members.contains(&video.id)
    }
}

fn fetch_members(api: &dyn VideoApi, playlist_id: &str) -> Result<HashSet<String>, ApiError> {
    let mut members = HashSet::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = api.playlist_page(playlist_id, page_token.as_deref())?;
        members.extend(page.items.into_iter().map(|item| item.id));
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(members),
        }
    }
}

/// Allow-list of explicit video IDs.
#[derive(Debug)]
pub struct IdSelector {
    ids: HashSet<String>,
}

impl IdSelector {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn should_select(&self, video: &Video) -> bool {
        self.ids.contains(&video.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{FakeApi, video};

    #[test]
    fn regex_matches_chosen_field() {
        let api = FakeApi::new();
        let mut by_title = Selector::regex(RegexField::Title, r"(?i)^devlog #\d+").unwrap();
        let mut by_description = Selector::regex(RegexField::Description, "Devlog").unwrap();

        let devlog = video("v1", "UC1", "Devlog #12: shaders");
        let other = video("v2", "UC1", "Livestream VOD");

        assert!(by_title.should_select(&devlog, &api));
        assert!(!by_title.should_select(&other, &api));
        assert!(by_description.should_select(&devlog, &api));
        assert!(!by_description.should_select(&other, &api));
    }

    #[test]
    fn regex_rejects_invalid_pattern() {
        let err = Selector::regex(RegexField::Title, "(unclosed").unwrap_err();
        assert!(matches!(err, SelectorError::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn id_selector_is_exact_match() {
        let api = FakeApi::new();
        let mut selector = Selector::ids(["A"]);
        assert!(selector.should_select(&video("A", "UC1", "a"), &api));
        assert!(!selector.should_select(&video("B", "UC1", "b"), &api));
        assert!(!selector.should_select(&video("AA", "UC1", "aa"), &api));
    }

    #[test]
    fn playlist_loads_all_pages_once_within_ttl() {
        let api = FakeApi::new().with_playlist(
            "PL1",
            vec![
                vec![video("a", "UC1", "a"), video("b", "UC1", "b")],
                vec![video("c", "UC1", "c")],
            ],
        );
        let mut selector = PlaylistSelector::new("PL1");
        let start = Utc::now();

        assert!(selector.should_select_at(&video("c", "UC1", "c"), &api, start));
        assert!(selector.should_select_at(&video("a", "UC1", "a"), &api, start));
        assert!(!selector.should_select_at(
            &video("z", "UC1", "z"),
            &api,
            start + TimeDelta::hours(1)
        ));
        assert_eq!(api.pages_requested("PL1"), 2);

        selector.should_select_at(&video("a", "UC1", "a"), &api, start + TimeDelta::hours(25));
        assert_eq!(api.pages_requested("PL1"), 4);
    }

    #[test]
    fn playlist_fetch_failure_rejects_and_retries_later() {
        let api = FakeApi::new().with_playlist("PL1", vec![vec![video("a", "UC1", "a")]]);
        api.fail_playlist("PL1");
        let mut selector = PlaylistSelector::new("PL1");
        let now = Utc::now();

        assert!(!selector.should_select_at(&video("a", "UC1", "a"), &api, now));

        api.heal_playlist("PL1");
        assert!(selector.should_select_at(&video("a", "UC1", "a"), &api, now));
    }

    #[test]
    fn select_all_requires_every_selector() {
        let api = FakeApi::new();
        let mut selectors = vec![
            Selector::ids(["A", "B"]),
            Selector::regex(RegexField::Title, "keep").unwrap(),
        ];

        assert!(select_all(&mut selectors, &video("A", "UC1", "keep me"), &api));
        assert!(!select_all(&mut selectors, &video("B", "UC1", "drop me"), &api));
        assert!(!select_all(&mut selectors, &video("C", "UC1", "keep me"), &api));
        assert!(select_all(
            &mut Vec::<Selector>::new(),
            &video("C", "UC1", "anything"),
            &api
        ));
    }
}
