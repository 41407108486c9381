use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{fmt, time::Duration};

/// Catálogo del que proviene un track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    YouTube,
    Spotify,
    #[serde(rename = "direct")]
    DirectUrl,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::YouTube => "youtube",
            SourceKind::Spotify => "spotify",
            SourceKind::DirectUrl => "direct",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of playable audio.
///
/// Only metadata lives here. The playable stream is obtained separately as a
/// [`StreamHandle`] right before the track starts, because catalog stream URLs
/// expire after a few hours.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub title: String,
    pub url: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    pub source: SourceKind,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        source: SourceKind,
        requested_by: UserId,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            artist: None,
            duration: None,
            thumbnail: None,
            source,
            requested_by,
            added_at: Utc::now(),
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    /// Texto de búsqueda para catálogos que solo dan metadata
    pub fn search_query(&self) -> String {
        match &self.artist {
            Some(artist) => format!("{} - {}", artist, self.title),
            None => self.title.clone(),
        }
    }

    /// Duración en formato MM:SS (o H:MM:SS)
    pub fn duration_formatted(&self) -> String {
        match self.duration {
            Some(duration) => format_duration(duration),
            None => "??:??".to_string(),
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.title, self.duration_formatted())
    }
}

/// Playable stream acquired for exactly one playback attempt.
///
/// Dropping it releases the attempt; it is never stored back on the [`Track`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    url: String,
}

impl StreamHandle {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
