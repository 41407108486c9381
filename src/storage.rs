use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, UserId};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::audio::track::{SourceKind, Track};
use crate::error::Result;

/// Track guardado en una playlist (solo metadata, sin stream)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub title: String,
    pub url: String,
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl PlaylistEntry {
    pub fn from_track(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            url: track.url.clone(),
            source: track.source,
            artist: track.artist.clone(),
            duration_secs: track.duration.map(|d| d.as_secs()),
        }
    }

    /// Vuelve a ser un track; el stream se obtiene al reproducirlo
    pub fn into_track(self, requested_by: UserId) -> Track {
        let mut track = Track::new(self.title, self.url, self.source, requested_by);
        track.artist = self.artist;
        track.duration = self.duration_secs.map(Duration::from_secs);
        track
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,
    pub created_by: u64,
    pub created_at: DateTime<Utc>,
    pub tracks: Vec<PlaylistEntry>,
}

impl Playlist {
    pub fn new(name: impl Into<String>, created_by: UserId, tracks: Vec<PlaylistEntry>) -> Self {
        Self {
            name: name.into(),
            created_by: created_by.get(),
            created_at: Utc::now(),
            tracks,
        }
    }

    /// Suma de las duraciones conocidas
    pub fn total_duration(&self) -> Duration {
        self.tracks
            .iter()
            .filter_map(|t| t.duration_secs)
            .map(Duration::from_secs)
            .sum()
    }
}

/// Persistent named playlists, scoped per guild.
///
/// Names are case-insensitive. Saving under an existing name overwrites it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn save(&self, guild_id: GuildId, playlist: Playlist) -> Result<()>;

    async fn load(&self, guild_id: GuildId, name: &str) -> Result<Option<Playlist>>;

    async fn list(&self, guild_id: GuildId) -> Result<Vec<String>>;

    /// `false` si no existía
    async fn delete(&self, guild_id: GuildId, name: &str) -> Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GuildPlaylists {
    playlists: BTreeMap<String, Playlist>,
}

/// Manager de playlists basado en archivos JSON (`guild_{id}.json`)
///
/// Each guild file is rewritten whole, so writers of the same guild are
/// serialized by a per-guild lock held across read-modify-write.
pub struct JsonPlaylistStore {
    playlists_dir: PathBuf,
    guild_locks: DashMap<GuildId, Arc<Mutex<()>>>,
    write_seq: AtomicU64,
}

impl JsonPlaylistStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let playlists_dir = data_dir.join("playlists");
        fs::create_dir_all(&playlists_dir).await?;

        info!("📁 Playlists almacenadas en: {}", playlists_dir.display());
        Ok(Self {
            playlists_dir,
            guild_locks: DashMap::new(),
            write_seq: AtomicU64::new(0),
        })
    }

    fn guild_lock(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        self.guild_locks.entry(guild_id).or_default().clone()
    }

    fn guild_file(&self, guild_id: GuildId) -> PathBuf {
        self.playlists_dir.join(format!("guild_{}.json", guild_id))
    }

    async fn read_guild(&self, guild_id: GuildId) -> Result<GuildPlaylists> {
        let path = self.guild_file(guild_id);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GuildPlaylists::default()),
            Err(e) => {
                warn!("⚠️ No se pudo leer {}: {}", path.display(), e);
                Err(e.into())
            }
        }
    }

    async fn write_guild(&self, guild_id: GuildId, data: &GuildPlaylists) -> Result<()> {
        let path = self.guild_file(guild_id);
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.tmp", seq));

        let content = serde_json::to_string_pretty(data)?;
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("💾 Playlists guardadas para guild {}", guild_id);
        Ok(())
    }
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[async_trait]
impl PlaylistStore for JsonPlaylistStore {
    async fn save(&self, guild_id: GuildId, playlist: Playlist) -> Result<()> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let mut data = self.read_guild(guild_id).await?;
        data.playlists.insert(key(&playlist.name), playlist);
        self.write_guild(guild_id, &data).await
    }

    async fn load(&self, guild_id: GuildId, name: &str) -> Result<Option<Playlist>> {
        let mut data = self.read_guild(guild_id).await?;
        Ok(data.playlists.remove(&key(name)))
    }

    async fn list(&self, guild_id: GuildId) -> Result<Vec<String>> {
        let data = self.read_guild(guild_id).await?;
        Ok(data.playlists.into_values().map(|p| p.name).collect())
    }

    async fn delete(&self, guild_id: GuildId, name: &str) -> Result<bool> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let mut data = self.read_guild(guild_id).await?;
        if data.playlists.remove(&key(name)).is_none() {
            return Ok(false);
        }
        self.write_guild(guild_id, &data).await?;
        Ok(true)
    }
}
