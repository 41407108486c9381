//! Entry point for the command layer.
//!
//! [`AudioPlayer`] turns guild-addressed requests into session operations:
//! it resolves queries eagerly (so "not found" errors reach the caller right
//! away), looks up or creates the guild's session, and bridges playlists
//! between the store and the session queue.

use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    audio::{
        registry::GuildSessionRegistry,
        session::{LoopMode, QueueSnapshot, SessionHandle},
        track::Track,
    },
    error::{MusicError, Result},
    sources::ResolverSet,
    storage::{Playlist, PlaylistEntry, PlaylistStore},
};

/// Resultado de encolar un track
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub track: Track,
    /// Posición en la cola al momento de agregarlo (desde 1)
    pub position: usize,
}

pub struct AudioPlayer {
    registry: Arc<GuildSessionRegistry>,
    resolvers: Arc<ResolverSet>,
    playlists: Arc<dyn PlaylistStore>,
    max_playlist_size: usize,
}

impl AudioPlayer {
    pub fn new(
        registry: Arc<GuildSessionRegistry>,
        resolvers: Arc<ResolverSet>,
        playlists: Arc<dyn PlaylistStore>,
        max_playlist_size: usize,
    ) -> Self {
        Self {
            registry,
            resolvers,
            playlists,
            max_playlist_size,
        }
    }

    pub fn registry(&self) -> &Arc<GuildSessionRegistry> {
        &self.registry
    }

    /// Conecta al canal de voz del usuario (`None` si no está en ninguno)
    pub async fn connect(&self, guild_id: GuildId, channel_id: Option<ChannelId>) -> Result<()> {
        let channel_id = channel_id.ok_or(MusicError::NotInVoiceChannel)?;
        self.registry.get_or_create(guild_id).connect(channel_id).await
    }

    /// Resuelve la consulta y encola el primer resultado
    pub async fn enqueue(&self, guild_id: GuildId, query: &str, requested_by: UserId) -> Result<Enqueued> {
        let track = self
            .resolvers
            .resolve(query, requested_by)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MusicError::TrackNotFound(query.to_string()))?;

        let position = self
            .registry
            .get_or_create(guild_id)
            .enqueue(track.clone())
            .await?;

        Ok(Enqueued { track, position })
    }

    /// Encola todos los resultados (playlists y álbumes), hasta `max_playlist_size`
    pub async fn enqueue_all(&self, guild_id: GuildId, query: &str, requested_by: UserId) -> Result<usize> {
        let mut tracks = self.resolvers.resolve(query, requested_by).await?;
        if tracks.len() > self.max_playlist_size {
            debug!(
                "✂️ Colección recortada de {} a {} canciones",
                tracks.len(),
                self.max_playlist_size
            );
            tracks.truncate(self.max_playlist_size);
        }

        self.registry.get_or_create(guild_id).enqueue_many(tracks).await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<()> {
        self.session(guild_id)?.pause().await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<()> {
        self.session(guild_id)?.resume().await
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<Track> {
        self.session(guild_id)?.skip().await
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<()> {
        self.session(guild_id)?.stop().await
    }

    pub async fn disconnect(&self, guild_id: GuildId) -> Result<()> {
        self.session(guild_id)?.disconnect().await
    }

    /// Volumen en porcentaje (0-100); devuelve el porcentaje aplicado
    pub async fn set_volume(&self, guild_id: GuildId, percent: f32) -> Result<f32> {
        if percent.is_nan() {
            return Err(MusicError::InvalidVolume(percent.to_string()));
        }
        let applied = self.session(guild_id)?.set_volume(percent / 100.0).await?;
        Ok(applied * 100.0)
    }

    pub async fn get_queue_snapshot(&self, guild_id: GuildId) -> Result<QueueSnapshot> {
        self.session(guild_id)?.snapshot().await
    }

    pub async fn get_now_playing(&self, guild_id: GuildId) -> Result<Option<Track>> {
        self.session(guild_id)?.now_playing().await
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> Result<LoopMode> {
        self.session(guild_id)?.set_loop_mode(mode).await
    }

    pub async fn cycle_loop_mode(&self, guild_id: GuildId) -> Result<LoopMode> {
        self.session(guild_id)?.cycle_loop_mode().await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> Result<()> {
        self.session(guild_id)?.shuffle().await
    }

    pub async fn remove(&self, guild_id: GuildId, position: usize) -> Result<Track> {
        self.session(guild_id)?.remove(position).await
    }

    pub async fn move_track(&self, guild_id: GuildId, from: usize, to: usize) -> Result<()> {
        self.session(guild_id)?.move_track(from, to).await
    }

    pub async fn clear_queue(&self, guild_id: GuildId) -> Result<usize> {
        self.session(guild_id)?.clear_queue().await
    }

    /// Guarda el track actual y la cola como playlist; devuelve cuántos tracks guardó
    pub async fn save_playlist(&self, guild_id: GuildId, name: &str, created_by: UserId) -> Result<usize> {
        let snapshot = self.session(guild_id)?.snapshot().await?;
        let entries: Vec<PlaylistEntry> = snapshot
            .current
            .iter()
            .chain(snapshot.tracks.iter())
            .map(PlaylistEntry::from_track)
            .collect();

        if entries.is_empty() {
            return Err(MusicError::QueueEmpty);
        }

        let saved = entries.len();
        self.playlists
            .save(guild_id, Playlist::new(name.trim(), created_by, entries))
            .await?;

        info!("💾 Playlist '{}' guardada con {} canciones", name.trim(), saved);
        Ok(saved)
    }

    /// Contenido de una playlist guardada, sin tocar la sesión
    pub async fn playlist_info(&self, guild_id: GuildId, name: &str) -> Result<Playlist> {
        self.playlists
            .load(guild_id, name)
            .await?
            .ok_or_else(|| MusicError::PlaylistNotFound(name.to_string()))
    }

    /// Guarda una colección (playlist o álbum) como playlist sin reproducirla.
    ///
    /// Only metadata is stored; streams are acquired when the playlist is
    /// loaded and played.
    pub async fn import_playlist(
        &self,
        guild_id: GuildId,
        url: &str,
        name: &str,
        created_by: UserId,
    ) -> Result<usize> {
        let mut tracks = self.resolvers.resolve(url, created_by).await?;
        tracks.truncate(self.max_playlist_size);

        let entries: Vec<PlaylistEntry> = tracks.iter().map(PlaylistEntry::from_track).collect();
        let imported = entries.len();
        self.playlists
            .save(guild_id, Playlist::new(name.trim(), created_by, entries))
            .await?;

        info!("📥 Playlist '{}' importada con {} canciones", name.trim(), imported);
        Ok(imported)
    }

    /// Encola una playlist guardada; los streams se obtienen al reproducir
    pub async fn load_playlist(&self, guild_id: GuildId, name: &str, requested_by: UserId) -> Result<usize> {
        let playlist = self.playlist_info(guild_id, name).await?;

        let tracks: Vec<Track> = playlist
            .tracks
            .into_iter()
            .map(|entry| entry.into_track(requested_by))
            .collect();

        let added = self.registry.get_or_create(guild_id).enqueue_many(tracks).await?;
        info!("📂 Playlist '{}' cargada: {} canciones", playlist.name, added);
        Ok(added)
    }

    pub async fn list_playlists(&self, guild_id: GuildId) -> Result<Vec<String>> {
        self.playlists.list(guild_id).await
    }

    pub async fn delete_playlist(&self, guild_id: GuildId, name: &str) -> Result<()> {
        if !self.playlists.delete(guild_id, name).await? {
            return Err(MusicError::PlaylistNotFound(name.to_string()));
        }
        info!("🗑️ Playlist '{}' eliminada", name);
        Ok(())
    }

    /// Cambio de participantes reales en el canal del bot
    pub fn participants_changed(&self, guild_id: GuildId, real: usize) {
        if let Some(session) = self.registry.get(guild_id) {
            session.participants_changed(real);
        }
    }

    /// El bot fue sacado del canal de voz desde fuera
    pub fn connection_lost(&self, guild_id: GuildId, reason: &str) {
        if let Some(session) = self.registry.get(guild_id) {
            session.connection_lost(reason);
        }
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    fn session(&self, guild_id: GuildId) -> Result<SessionHandle> {
        self.registry
            .get(guild_id)
            .ok_or(MusicError::NoSession(guild_id))
    }
}
