//! Spotify Web API client (client-credentials flow).
//!
//! Spotify only hands out metadata. Tracks resolved here keep their Spotify
//! URL and artist so they can later be streamed by searching the search
//! catalog with `"{artist} - {title}"`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serenity::model::id::UserId;
use std::{
    sync::LazyLock,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use super::SourceResolver;
use crate::{
    audio::track::{SourceKind, StreamHandle, Track},
    error::{MusicError, Result},
};

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";

// Renovar el token un poco antes de que expire
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

static SPOTIFY_LINK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(track|playlist|album)[/:]([A-Za-z0-9]+)").ok());

#[derive(Debug, Clone, PartialEq, Eq)]
enum SpotifyLink {
    Track(String),
    Playlist(String),
    Album(String),
}

impl SpotifyLink {
    fn parse(url: &str) -> Option<Self> {
        let captures = SPOTIFY_LINK.as_ref()?.captures(url)?;
        let id = captures.get(2)?.as_str().to_string();
        match captures.get(1)?.as_str() {
            "track" => Some(SpotifyLink::Track(id)),
            "playlist" => Some(SpotifyLink::Playlist(id)),
            "album" => Some(SpotifyLink::Album(id)),
            _ => None,
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    external_urls: ExternalUrls,
    album: Option<SpotifyAlbum>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    #[serde(default)]
    images: Vec<SpotifyImage>,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<SpotifyTrack>,
}

impl SpotifyTrack {
    fn into_track(self, requested_by: UserId) -> Track {
        let url = self.external_urls.spotify.unwrap_or_default();
        let mut track = Track::new(self.name, url, SourceKind::Spotify, requested_by)
            .with_duration(Duration::from_millis(self.duration_ms));

        if let Some(artist) = self.artists.into_iter().next() {
            track = track.with_artist(artist.name);
        }
        if let Some(image) = self.album.and_then(|album| album.images.into_iter().next()) {
            track = track.with_thumbnail(image.url);
        }
        track
    }
}

pub struct SpotifyClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
    max_tracks: usize,
}

impl SpotifyClient {
    pub fn new(http: reqwest::Client, client_id: String, client_secret: String, max_tracks: usize) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            token: Mutex::new(None),
            max_tracks,
        }
    }

    async fn access_token(&self) -> Result<String> {
        let cached = self
            .token
            .lock()
            .as_ref()
            .filter(|token| token.expires_at > Instant::now() + TOKEN_MARGIN)
            .map(|token| token.value.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        debug!("🔑 Solicitando token de Spotify");
        let credentials = STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        let response = self
            .http
            .post(TOKEN_URL)
            .header(header::AUTHORIZATION, format!("Basic {}", credentials))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            warn!("❌ Spotify rechazó las credenciales: {}", response.status());
            return Err(MusicError::CatalogUnavailable(format!(
                "Spotify auth: {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await.map_err(unavailable)?;
        *self.token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(unavailable),
            StatusCode::NOT_FOUND => Err(MusicError::TrackNotFound(url.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(MusicError::CatalogUnavailable("Spotify rate limit".into()))
            }
            status => Err(MusicError::CatalogUnavailable(format!("Spotify: {}", status))),
        }
    }

    /// Recorre la paginación hasta `max_tracks`
    async fn collect_pages<T: DeserializeOwned>(
        &self,
        first_page: String,
        mut extract: impl FnMut(T) -> Option<SpotifyTrack>,
        requested_by: UserId,
    ) -> Result<Vec<Track>> {
        let mut tracks = Vec::new();
        let mut next = Some(first_page);

        while let Some(url) = next.take() {
            let page: Page<T> = self.get(&url).await?;
            tracks.extend(
                page.items
                    .into_iter()
                    .filter_map(&mut extract)
                    .map(|track| track.into_track(requested_by)),
            );
            if tracks.len() >= self.max_tracks {
                tracks.truncate(self.max_tracks);
                break;
            }
            next = page.next;
        }

        Ok(tracks)
    }
}

fn unavailable(e: reqwest::Error) -> MusicError {
    MusicError::CatalogUnavailable(e.to_string())
}

#[async_trait]
impl SourceResolver for SpotifyClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Spotify
    }

    fn is_valid_url(&self, query: &str) -> bool {
        query.contains("open.spotify.com") || query.starts_with("spotify:")
    }

    fn provides_streams(&self) -> bool {
        false
    }

    async fn resolve_candidates(&self, query: &str, requested_by: UserId) -> Result<Vec<Track>> {
        let link = SpotifyLink::parse(query).ok_or_else(|| MusicError::TrackNotFound(query.to_string()))?;

        let tracks = match link {
            SpotifyLink::Track(id) => {
                let track: SpotifyTrack = self.get(&format!("{}/tracks/{}", API_URL, id)).await?;
                vec![track.into_track(requested_by)]
            }
            SpotifyLink::Playlist(id) => {
                let first = format!("{}/playlists/{}/tracks?limit=100", API_URL, id);
                self.collect_pages(first, |item: PlaylistItem| item.track, requested_by)
                    .await?
            }
            SpotifyLink::Album(id) => {
                let first = format!("{}/albums/{}/tracks?limit=50", API_URL, id);
                self.collect_pages(first, |track: SpotifyTrack| Some(track), requested_by)
                    .await?
            }
        };

        info!("🎧 Spotify: {} canciones obtenidas", tracks.len());
        Ok(tracks)
    }

    async fn acquire_stream(&self, track: &Track) -> Result<StreamHandle> {
        Err(MusicError::CatalogUnavailable(format!(
            "Spotify no ofrece audio para {}",
            track.title
        )))
    }
}
