#![forbid(unsafe_code)]

//! Remote metadata API used by the archiver.
//!
//! [`VideoApi`] is the seam between the engine and YouTube. The production
//! implementation, [`YouTubeClient`], talks to the public Data API v3 with an
//! API key; every call costs quota, so callers batch wherever they can.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{ApiError, IdentityError};

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// Largest page the API hands out for list calls.
pub const MAX_PAGE_SIZE: u32 = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The single, least ambiguous way a configured channel is looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelIdentity {
    Id(String),
    Handle(String),
    Username(String),
}

impl ChannelIdentity {
    /// Builds an identity from the optional config fields. Exactly one of them
    /// must be set; blank strings count as unset.
    pub fn from_parts(
        id: Option<&str>,
        handle: Option<&str>,
        username: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let set = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };
        let mut candidates: Vec<Self> = [
            set(id).map(Self::Id),
            set(handle).map(Self::Handle),
            set(username).map(Self::Username),
        ]
        .into_iter()
        .flatten()
        .collect();

        if candidates.len() > 1 {
            return Err(IdentityError::Ambiguous(
                candidates
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }
        candidates.pop().ok_or(IdentityError::Unidentified)
    }

    fn query(&self) -> (&'static str, &str) {
        match self {
            Self::Id(id) => ("id", id),
            Self::Handle(handle) => ("forHandle", handle),
            Self::Username(username) => ("forUsername", username),
        }
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Handle(handle) if handle.starts_with('@') => write!(f, "{handle}"),
            Self::Handle(handle) => write!(f, "@{handle}"),
            Self::Username(username) => write!(f, "user/{username}"),
        }
    }
}

/// Channel details worth caching for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub uploads_id: String,
}

/// One entry of a playlist feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlaylistPage {
    pub items: Vec<Video>,
    pub next_page_token: Option<String>,
}

/// Broadcast state of a video. Only `None` and `Completed` are archivable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    None,
    Upcoming,
    Live,
    Completed,
    #[serde(other)]
    Unknown,
}

impl LiveStatus {
    pub fn is_published(self) -> bool {
        matches!(self, Self::None | Self::Completed)
    }
}

pub trait VideoApi {
    fn resolve_channel(&self, identity: &ChannelIdentity) -> Result<ChannelInfo, ApiError>;

    /// Fetches one page of a playlist. `page_token` is `None` for the first
    /// page.
    fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiError>;

    /// Looks up the broadcast state of up to [`MAX_PAGE_SIZE`] videos in one
    /// call. IDs the API does not know about are absent from the result.
    fn live_status(&self, video_ids: &[String]) -> Result<HashMap<String, LiveStatus>, ApiError>;
}

/// Blocking client for the YouTube Data API v3.
pub struct YouTubeClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
}

impl YouTubeClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, YOUTUBE_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn get<T: DeserializeOwned>(
        &self,
        operation: &str,
        resource: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let url = format!("{}/{resource}", self.base_url);
        let mut request = self.agent.get(&url).query("key", &self.api_key);
        for (key, value) in params {
            request = request.query(key, value);
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                return Err(ApiError::Http {
                    operation: operation.to_owned(),
                    status,
                    message: error_message(response),
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(ApiError::Transport {
                    operation: operation.to_owned(),
                    message: transport.to_string(),
                });
            }
        };

        response.into_json::<T>().map_err(|err| ApiError::Decode {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
    }
}

/// Pulls the human readable message out of a Google API error body, falling
/// back to the HTTP status text.
fn error_message(response: ureq::Response) -> String {
    let fallback = response.status_text().to_owned();
    match response.into_json::<ErrorEnvelope>() {
        Ok(envelope) => envelope.error.message,
        Err(_) => fallback,
    }
}

impl VideoApi for YouTubeClient {
    fn resolve_channel(&self, identity: &ChannelIdentity) -> Result<ChannelInfo, ApiError> {
        let (key, value) = identity.query();
        let response: ChannelListResponse = self.get(
            &format!("list channel {identity}"),
            "channels",
            &[("part", "id,snippet,contentDetails"), (key, value)],
        )?;

        let mut items = response.items;
        if items.len() > 1 {
            return Err(ApiError::Ambiguous {
                identity: identity.to_string(),
                matches: items.len(),
            });
        }
        let item = items.pop().ok_or_else(|| ApiError::NotFound {
            identity: identity.to_string(),
        })?;

        Ok(ChannelInfo {
            id: item.id,
            name: item.snippet.title,
            uploads_id: item.content_details.related_playlists.uploads,
        })
    }

    fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiError> {
        let max_results = MAX_PAGE_SIZE.to_string();
        let mut params = vec![
            ("part", "snippet,contentDetails"),
            ("playlistId", playlist_id),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response: PlaylistItemListResponse = self.get(
            &format!("list playlist {playlist_id}"),
            "playlistItems",
            &params,
        )?;

        let items = response
            .items
            .into_iter()
            .filter_map(|item| {
                let video_id = item.content_details?.video_id;
                let snippet = item.snippet.unwrap_or_default();
                Some(Video {
                    id: video_id,
                    channel_id: snippet.channel_id,
                    title: snippet.title,
                    description: snippet.description,
                })
            })
            .collect();

        Ok(PlaylistPage {
            items,
            next_page_token: response.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    fn live_status(&self, video_ids: &[String]) -> Result<HashMap<String, LiveStatus>, ApiError> {
        if video_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids = video_ids.join(",");
        let response: VideoListResponse = self.get(
            "check upcoming",
            "videos",
            &[("part", "snippet"), ("id", ids.as_str())],
        )?;

        Ok(response
            .items
            .into_iter()
            .map(|item| (item.id, item.snippet.live_broadcast_content))
            .collect())
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResource {
    id: String,
    snippet: ChannelSnippet,
    content_details: ChannelContentDetails,
}

#[derive(Deserialize)]
struct ChannelSnippet {
    title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    related_playlists: RelatedPlaylists,
}

#[derive(Deserialize)]
struct RelatedPlaylists {
    uploads: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemListResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: Option<PlaylistItemSnippet>,
    content_details: Option<PlaylistItemContentDetails>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PlaylistItemSnippet {
    channel_id: String,
    title: String,
    description: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemContentDetails {
    video_id: String,
}

#[derive(Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoResource>,
}

#[derive(Deserialize)]
struct VideoResource {
    id: String,
    snippet: VideoSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    live_broadcast_content: LiveStatus,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_single_field() {
        let identity = ChannelIdentity::from_parts(None, Some("GoogleDevelopers"), None).unwrap();
        assert_eq!(identity, ChannelIdentity::Handle("GoogleDevelopers".into()));
        assert_eq!(identity.to_string(), "@GoogleDevelopers");
    }

    #[test]
    fn identity_rejects_missing_and_ambiguous_fields() {
        assert_eq!(
            ChannelIdentity::from_parts(None, Some("  "), None),
            Err(IdentityError::Unidentified)
        );
        let err = ChannelIdentity::from_parts(Some("UC1"), Some("handle"), None).unwrap_err();
        assert_eq!(err, IdentityError::Ambiguous("UC1, @handle".into()));
    }

    #[test]
    fn identity_query_matches_api_parameters() {
        assert_eq!(ChannelIdentity::Id("UC1".into()).query(), ("id", "UC1"));
        assert_eq!(
            ChannelIdentity::Handle("@dev".into()).query(),
            ("forHandle", "@dev")
        );
        assert_eq!(
            ChannelIdentity::Username("legacy".into()).query(),
            ("forUsername", "legacy")
        );
    }

    #[test]
    fn live_status_parses_api_values() {
        let parsed: VideoListResponse = serde_json::from_str(
            r#"{"items":[
                {"id":"a","snippet":{"liveBroadcastContent":"none"}},
                {"id":"b","snippet":{"liveBroadcastContent":"upcoming"}},
                {"id":"c","snippet":{"liveBroadcastContent":"live"}},
                {"id":"d","snippet":{"liveBroadcastContent":"something-new"}}
            ]}"#,
        )
        .unwrap();
        let statuses: Vec<_> = parsed
            .items
            .iter()
            .map(|item| item.snippet.live_broadcast_content)
            .collect();
        assert_eq!(
            statuses,
            vec![
                LiveStatus::None,
                LiveStatus::Upcoming,
                LiveStatus::Live,
                LiveStatus::Unknown
            ]
        );
        assert!(LiveStatus::Completed.is_published());
        assert!(!LiveStatus::Unknown.is_published());
    }

    #[test]
    fn playlist_response_tolerates_missing_fields() {
        let parsed: PlaylistItemListResponse = serde_json::from_str(
            r#"{"nextPageToken":"CDIQAA","items":[
                {"snippet":{"title":"Hello","channelId":"UC1"},"contentDetails":{"videoId":"v1"}},
                {"snippet":{"title":"Broken"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.next_page_token.as_deref(), Some("CDIQAA"));
        assert!(parsed.items[1].content_details.is_none());
        let snippet = parsed.items[0].snippet.as_ref().unwrap();
        assert_eq!(snippet.description, "");
    }

    #[test]
    fn channel_response_reads_uploads_playlist() {
        let parsed: ChannelListResponse = serde_json::from_str(
            r#"{"items":[{"id":"UC1","snippet":{"title":"Dev"},
                "contentDetails":{"relatedPlaylists":{"uploads":"UU1"}}}]}"#,
        )
        .unwrap();
        let item = &parsed.items[0];
        assert_eq!(item.content_details.related_playlists.uploads, "UU1");

        let empty: ChannelListResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty());
    }
}
