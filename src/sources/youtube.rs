use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serenity::model::id::UserId;
use std::{sync::LazyLock, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::SourceResolver;
use crate::{
    audio::track::{SourceKind, StreamHandle, Track},
    error::{MusicError, Result},
};

/// Resultados pedidos a `ytsearchN:`
const SEARCH_RESULTS: usize = 5;

static YOUTUBE_URL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.|m\.)?(youtube\.com/(watch\?v=|embed/|v/|shorts/|playlist\?list=)|youtu\.be/|music\.youtube\.com/)").ok()
});

/// Cliente para interactuar con YouTube vía yt-dlp
pub struct YouTubeClient {
    // Limitar procesos concurrentes para evitar rate limiting
    rate_limiter: Semaphore,
    playlist_limit: usize,
}

/// Información extraída de yt-dlp (`--dump-json`, una línea por entrada)
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    is_live: Option<bool>,
}

impl YtDlpInfo {
    fn into_track(self, requested_by: UserId) -> Track {
        let url = self
            .webpage_url
            .or(self.url.filter(|url| url.starts_with("http")))
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", self.id));

        let mut track = Track::new(
            self.title.unwrap_or_else(|| self.id.clone()),
            url,
            SourceKind::YouTube,
            requested_by,
        );

        if let Some(artist) = self.uploader.or(self.channel) {
            track = track.with_artist(artist);
        }
        // Los directos no tienen duración útil
        if let Some(duration) = self.duration.filter(|_| !self.is_live.unwrap_or(false)) {
            track = track.with_duration(Duration::from_secs_f64(duration.max(0.0)));
        }
        if let Some(thumbnail) = self.thumbnail {
            track = track.with_thumbnail(thumbnail);
        }
        track
    }
}

impl YouTubeClient {
    pub fn new(playlist_limit: usize) -> Self {
        Self {
            rate_limiter: Semaphore::new(3),
            playlist_limit,
        }
    }

    /// Verifica si una URL es válida para YouTube
    pub fn is_youtube_url(url: &str) -> bool {
        YOUTUBE_URL
            .as_ref()
            .map(|regex| regex.is_match(url))
            .unwrap_or(false)
    }

    /// URL de playlist pura (no un video dentro de una playlist)
    pub fn is_playlist_url(url: &str) -> bool {
        url.contains("list=") && !url.contains("watch?v=") && !url.contains("youtu.be/")
    }

    async fn run_ytdlp(&self, args: &[&str]) -> Result<String> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| MusicError::CatalogUnavailable(e.to_string()))?;

        let output = Command::new("yt-dlp")
            .args(args)
            .output()
            .await
            .map_err(|e| MusicError::CatalogUnavailable(format!("Error al ejecutar yt-dlp: {}", e)))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            let error = error.lines().last().unwrap_or("sin detalles").trim().to_string();
            warn!("❌ yt-dlp error: {}", error);
            return Err(MusicError::CatalogUnavailable(format!("yt-dlp: {}", error)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Busca videos en YouTube
    pub async fn search(&self, query: &str, limit: usize, requested_by: UserId) -> Result<Vec<Track>> {
        info!("🔍 Buscando en YouTube: {}", query);

        let search_query = format!("ytsearch{}:{}", limit, query);
        let stdout = self
            .run_ytdlp(&[
                "--no-playlist",
                "--dump-json",
                "--flat-playlist",
                "--skip-download",
                "--no-warnings",
                &search_query,
            ])
            .await?;

        Ok(parse_entries(&stdout, requested_by))
    }

    /// Obtiene información de una URL específica
    pub async fn video(&self, url: &str, requested_by: UserId) -> Result<Vec<Track>> {
        debug!("📊 Obteniendo info de: {}", url);

        let stdout = self
            .run_ytdlp(&["--no-playlist", "--dump-json", "--no-warnings", url])
            .await?;

        Ok(parse_entries(&stdout, requested_by))
    }

    /// Obtiene las entradas de una playlist, sin resolver cada video
    pub async fn playlist(&self, url: &str, requested_by: UserId) -> Result<Vec<Track>> {
        info!("📋 Obteniendo playlist: {}", url);

        let limit = self.playlist_limit.to_string();
        let stdout = self
            .run_ytdlp(&[
                "--flat-playlist",
                "--dump-json",
                "--playlist-end",
                &limit,
                "--no-warnings",
                url,
            ])
            .await?;

        let tracks = parse_entries(&stdout, requested_by);
        info!("📋 Playlist con {} videos", tracks.len());
        Ok(tracks)
    }
}

/// Una entrada JSON por línea; las líneas ilegibles se descartan
fn parse_entries(stdout: &str, requested_by: UserId) -> Vec<Track> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<YtDlpInfo>(line) {
            Ok(info) => Some(info.into_track(requested_by)),
            Err(e) => {
                debug!("Línea de yt-dlp ignorada: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl SourceResolver for YouTubeClient {
    fn kind(&self) -> SourceKind {
        SourceKind::YouTube
    }

    fn is_valid_url(&self, query: &str) -> bool {
        Self::is_youtube_url(query)
    }

    async fn resolve_candidates(&self, query: &str, requested_by: UserId) -> Result<Vec<Track>> {
        if !Self::is_youtube_url(query) {
            return self.search(query, SEARCH_RESULTS, requested_by).await;
        }
        if Self::is_playlist_url(query) {
            return self.playlist(query, requested_by).await;
        }
        self.video(query, requested_by).await
    }

    /// Obtiene la URL de streaming de audio
    async fn acquire_stream(&self, track: &Track) -> Result<StreamHandle> {
        debug!("🎵 Obteniendo URL de stream para: {}", track.url);

        let stdout = self
            .run_ytdlp(&[
                "--no-playlist",
                "-f",
                "bestaudio/best",
                "--get-url",
                "--no-warnings",
                &track.url,
            ])
            .await?;

        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(StreamHandle::new)
            .ok_or_else(|| MusicError::CatalogUnavailable("No se pudo obtener URL de stream".into()))
    }
}
