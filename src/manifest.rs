//! Manifest resolution
//!
//! Turns an episode id into a validated [`StreamManifest`]. Resolution
//! walks the episode record's stream URL: an HLS playlist is followed
//! through its master/media levels down to the segment list, while a
//! direct media file becomes a single-segment manifest.
//!
//! Validation happens here, before any segment is fetched, so a broken
//! manifest fails fast without network cost.

use reqwest::StatusCode;
use url::Url;

use crate::catalog::Episode;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{ByteRange, EpisodeId, SegmentDescriptor, StreamManifest};

/// Resolves episode ids to segment manifests
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    transport: Transport,
}

impl ManifestResolver {
    /// Create a resolver over the given transport
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Resolve and validate the manifest for an episode
    pub async fn resolve(&self, episode_id: EpisodeId) -> Result<StreamManifest> {
        let episode = self.fetch_episode(episode_id).await?;

        let stream_url = episode
            .stream_url
            .or(episode.smooth_streaming_url)
            .ok_or_else(|| Error::ManifestUnavailable {
                episode_id,
                reason: "episode record carries no stream URL".to_string(),
            })?;

        let stream_url = Url::parse(&stream_url).map_err(|e| {
            Error::MalformedManifest(format!("episode {episode_id} stream URL is invalid: {e}"))
        })?;

        let manifest = if is_playlist_url(&stream_url) {
            self.resolve_hls(episode_id, &stream_url).await?
        } else {
            self.resolve_direct(episode_id, &stream_url).await?
        };

        manifest.validate()?;
        tracing::debug!(
            %episode_id,
            segments = manifest.len(),
            "Resolved episode manifest"
        );
        Ok(manifest)
    }

    async fn fetch_episode(&self, episode_id: EpisodeId) -> Result<Episode> {
        let url = format!("{}/episode/{episode_id}", self.transport.api_base_url());
        let response = self.transport.get(&url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::ManifestUnavailable {
                episode_id,
                reason: "episode does not exist".to_string(),
            }),
            StatusCode::FORBIDDEN | StatusCode::PAYMENT_REQUIRED => {
                Err(Error::ManifestUnavailable {
                    episode_id,
                    reason: "access denied, subscription may be required".to_string(),
                })
            }
            _ => {
                let episode = response.error_for_status()?.json().await?;
                Ok(episode)
            }
        }
    }

    /// Follow an HLS playlist chain down to its segment list
    async fn resolve_hls(&self, episode_id: EpisodeId, url: &Url) -> Result<StreamManifest> {
        let master = self.fetch_playlist(episode_id, url).await?;

        let (media_url, media_text) = if is_media_playlist(&master) {
            (url.clone(), master)
        } else {
            let variant = first_variant_uri(&master).ok_or_else(|| {
                Error::MalformedManifest(format!(
                    "episode {episode_id} master playlist lists no variants"
                ))
            })?;
            let media_url = url.join(&variant).map_err(|e| {
                Error::MalformedManifest(format!(
                    "episode {episode_id} variant URI is invalid: {e}"
                ))
            })?;
            let media_text = self.fetch_playlist(episode_id, &media_url).await?;
            (media_url, media_text)
        };

        let segments = parse_media_playlist(&media_text, &media_url)?;
        Ok(StreamManifest {
            episode_id,
            segments,
        })
    }

    /// A plain media file becomes a single-segment manifest.
    ///
    /// The HEAD probe both confirms the URL is reachable and records the
    /// expected size so staging can detect truncated files.
    async fn resolve_direct(&self, episode_id: EpisodeId, url: &Url) -> Result<StreamManifest> {
        let response = self.transport.head(url.as_str()).await?;
        if !response.status().is_success() {
            return Err(Error::ManifestUnavailable {
                episode_id,
                reason: format!("stream URL not reachable ({})", response.status()),
            });
        }

        let expected_size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        Ok(StreamManifest {
            episode_id,
            segments: vec![SegmentDescriptor {
                index: 0,
                url: url.to_string(),
                byte_range: None,
                expected_size,
            }],
        })
    }

    async fn fetch_playlist(&self, episode_id: EpisodeId, url: &Url) -> Result<String> {
        let response = self.transport.get(url.as_str()).await?;
        if !response.status().is_success() {
            return Err(Error::ManifestUnavailable {
                episode_id,
                reason: format!("playlist {url} not reachable ({})", response.status()),
            });
        }
        let text = response.text().await?;
        if !text.trim_start().starts_with("#EXTM3U") {
            return Err(Error::MalformedManifest(format!(
                "episode {episode_id} playlist at {url} is not an m3u8 document"
            )));
        }
        Ok(text)
    }
}

fn is_playlist_url(url: &Url) -> bool {
    url.path().ends_with(".m3u8") || url.path().ends_with(".m3u")
}

fn is_media_playlist(text: &str) -> bool {
    text.lines().any(|line| line.starts_with("#EXTINF"))
}

/// First variant URI in a master playlist, if any
fn first_variant_uri(text: &str) -> Option<String> {
    let mut saw_stream_inf = false;
    for line in text.lines().map(str::trim) {
        if line.starts_with("#EXT-X-STREAM-INF") {
            saw_stream_inf = true;
        } else if saw_stream_inf && !line.is_empty() && !line.starts_with('#') {
            return Some(line.to_string());
        }
    }
    // tolerate masters that list bare playlist URIs without STREAM-INF tags
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && line.ends_with(".m3u8"))
        .map(|line| line.to_string())
}

/// Parse the segment list of a media playlist.
///
/// Segment URIs follow their `#EXTINF` tag; an optional `#EXT-X-BYTERANGE`
/// between the two scopes the segment to a byte range of a shared file.
/// A byterange without an explicit offset continues where the previous
/// range ended, per the HLS spec.
fn parse_media_playlist(text: &str, base: &Url) -> Result<Vec<SegmentDescriptor>> {
    let mut segments = Vec::new();
    let mut pending_extinf = false;
    let mut pending_range: Option<ByteRange> = None;
    let mut next_offset: u64 = 0;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(tag_body) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            let range = parse_byterange(tag_body, next_offset).ok_or_else(|| {
                Error::MalformedManifest(format!("bad byterange tag: {line}"))
            })?;
            next_offset = range.offset + range.length;
            pending_range = Some(range);
        } else if line.starts_with("#EXTINF") {
            pending_extinf = true;
        } else if line.starts_with('#') {
            continue;
        } else if pending_extinf {
            let url = base.join(line).map_err(|e| {
                Error::MalformedManifest(format!("segment URI {line} is invalid: {e}"))
            })?;
            let range = pending_range.take();
            segments.push(SegmentDescriptor {
                index: segments.len(),
                url: url.to_string(),
                byte_range: range,
                expected_size: range.map(|r| r.length),
            });
            pending_extinf = false;
        }
    }

    Ok(segments)
}

/// Parse `<length>[@<offset>]`; a missing offset continues at `continuation`
fn parse_byterange(body: &str, continuation: u64) -> Option<ByteRange> {
    let mut parts = body.splitn(2, '@');
    let length = parts.next()?.trim().parse::<u64>().ok()?;
    // a zero-length range has no addressable bytes and would produce an
    // inverted Range header
    if length == 0 {
        return None;
    }
    let offset = match parts.next() {
        Some(raw) => raw.trim().parse::<u64>().ok()?,
        None => continuation,
    };
    Some(ByteRange { offset, length })
}
