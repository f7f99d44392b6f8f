//! Catalog browsing
//!
//! Read-only views over the podcast API: podcast metadata, episode
//! listings, search and the account's subscription state. Episode
//! listings are paginated server-side; [`Catalog::list_episodes`] walks
//! the pages and returns the full list.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::EpisodeId;

/// Podcast metadata as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Podcast {
    /// Numeric podcast id
    pub id: u64,
    /// Display title
    pub title: Option<String>,
    /// URL slug used in catalog endpoints
    pub slug: Option<String>,
    /// Long-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Author or network name
    #[serde(default)]
    pub author_full_name: Option<String>,
    /// Whether the podcast requires a paid subscription
    #[serde(default)]
    pub is_premium: Option<bool>,
    /// Artwork URL
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Episode record as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    /// Numeric episode id
    pub id: EpisodeId,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
    /// Title of the podcast the episode belongs to
    #[serde(default)]
    pub podcast_title: Option<String>,
    /// Long-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Publication timestamp, in the API's own formatting
    #[serde(default)]
    pub date_added: Option<String>,
    /// Playback length, in the API's own formatting
    #[serde(default)]
    pub length: Option<String>,
    /// Media or playlist URL used for downloading
    #[serde(default)]
    pub stream_url: Option<String>,
    /// Alternate streaming URL some episodes carry instead
    #[serde(default)]
    pub smooth_streaming_url: Option<String>,
}

/// Subscription package on the account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Numeric state code
    #[serde(default)]
    pub subscription_state: Option<i32>,
    /// Numeric plan type
    #[serde(default)]
    pub subscription_type: Option<i32>,
    /// Plan name
    #[serde(default)]
    pub subscription_plan: Option<serde_json::Value>,
    /// Start of the current period
    #[serde(default)]
    pub start_date: Option<String>,
    /// End of the current period
    #[serde(default)]
    pub expiration_date: Option<String>,
}

/// Read-only catalog client
#[derive(Debug, Clone)]
pub struct Catalog {
    transport: Transport,
    page_size: u32,
}

impl Catalog {
    /// Create a catalog client; `page_size` controls episode list paging
    pub fn new(transport: Transport, page_size: u32) -> Self {
        Self {
            transport,
            page_size,
        }
    }

    /// Fetch a podcast by slug
    pub async fn get_podcast(&self, slug: &str) -> Result<Podcast> {
        let url = format!("{}/podcast/slug/{slug}", self.transport.api_base_url());
        self.transport.get_json(&url).await
    }

    /// Fetch a single episode record
    pub async fn get_episode(&self, episode_id: EpisodeId) -> Result<Episode> {
        let url = format!("{}/episode/{episode_id}", self.transport.api_base_url());
        self.transport.get_json(&url).await
    }

    /// List every episode of a podcast, oldest first.
    ///
    /// Walks the server-side pages until a short page signals the end.
    pub async fn list_episodes(&self, slug: &str) -> Result<Vec<Episode>> {
        let base = format!("{}/episode/slug/{slug}", self.transport.api_base_url());
        let mut episodes = Vec::new();
        let mut page = 0u32;

        loop {
            let url = self.paged_url(&base, page)?;
            let batch: Vec<Episode> = self.transport.get_json(url.as_str()).await?;
            let batch_len = batch.len();
            episodes.extend(batch);

            if batch_len < self.page_size as usize {
                break;
            }
            page += 1;
        }

        tracing::debug!(slug, episodes = episodes.len(), pages = page + 1, "Listed episodes");
        Ok(episodes)
    }

    /// Search podcasts by text
    pub async fn search(&self, text: &str) -> Result<Vec<Podcast>> {
        let mut url = Url::parse(&format!("{}/podcast/search", self.transport.api_base_url()))
            .map_err(|e| Error::NotFound(format!("bad search URL: {e}")))?;
        url.query_pairs_mut().append_pair("searchText", text);
        self.transport.get_json(url.as_str()).await
    }

    /// Podcasts the account follows
    pub async fn get_user_podcasts(&self) -> Result<Vec<Podcast>> {
        let url = format!("{}/podcast/userpodcasts", self.transport.api_base_url());
        self.transport.get_json(&url).await
    }

    /// Subscription packages on the account
    pub async fn get_subscriptions(&self) -> Result<Vec<Subscription>> {
        let url = format!("{}/subscription", self.transport.api_base_url());
        self.transport.get_json(&url).await
    }

    fn paged_url(&self, base: &str, page: u32) -> Result<Url> {
        let mut url =
            Url::parse(base).map_err(|e| Error::NotFound(format!("bad catalog URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("pageSize", &self.page_size.to_string())
            .append_pair("page", &page.to_string())
            .append_pair("getByOldest", "true");
        Ok(url)
    }
}
