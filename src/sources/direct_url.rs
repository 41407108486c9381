use async_trait::async_trait;
use serenity::model::id::UserId;
use url::Url;

use super::SourceResolver;
use crate::{
    audio::track::{SourceKind, StreamHandle, Track},
    error::{MusicError, Result},
};

const AUDIO_EXTENSIONS: [&str; 8] = ["mp3", "wav", "ogg", "flac", "m4a", "opus", "aac", "webm"];

/// Enlaces HTTP(S) a archivos de audio; la URL misma es el stream
#[derive(Debug, Default)]
pub struct DirectUrlClient;

impl DirectUrlClient {
    pub fn new() -> Self {
        Self
    }

    fn audio_url(query: &str) -> Option<Url> {
        let url = Url::parse(query.trim()).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }

        let extension = url.path().rsplit('.').next()?.to_lowercase();
        AUDIO_EXTENSIONS.contains(&extension.as_str()).then_some(url)
    }

    /// Último segmento del path, sin extensión
    fn title_from(url: &Url) -> String {
        let segment = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default();
        let decoded = urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());

        let title = decoded
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or(decoded);

        if title.is_empty() {
            url.host_str().unwrap_or("audio").to_string()
        } else {
            title
        }
    }
}

#[async_trait]
impl SourceResolver for DirectUrlClient {
    fn kind(&self) -> SourceKind {
        SourceKind::DirectUrl
    }

    fn is_valid_url(&self, query: &str) -> bool {
        Self::audio_url(query).is_some()
    }

    async fn resolve_candidates(&self, query: &str, requested_by: UserId) -> Result<Vec<Track>> {
        let url = Self::audio_url(query).ok_or_else(|| MusicError::TrackNotFound(query.to_string()))?;
        let title = Self::title_from(&url);
        Ok(vec![Track::new(title, url.as_str(), SourceKind::DirectUrl, requested_by)])
    }

    async fn acquire_stream(&self, track: &Track) -> Result<StreamHandle> {
        Ok(StreamHandle::new(track.url.clone()))
    }
}
