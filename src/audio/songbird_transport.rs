//! [`Transport`] implementation over songbird.
//!
//! Streams are fetched with songbird's `HttpRequest` input, so anything a
//! resolver hands out as a [`StreamHandle`] must be a plain HTTP(S) URL.

use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::{ControlError, JoinError},
    events::CoreEvent,
    input::HttpRequest,
    tracks::{Track as SongbirdTrack, TrackHandle},
    Call, Event, Songbird, TrackEvent,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        track::StreamHandle,
        transport::{CompletionNotifier, Transport, TransportHandle, TransportListener},
    },
    bot::events::{DisconnectNotifier, TrackEndNotifier, TrackErrorNotifier},
    error::{MusicError, Result},
};

pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, http: reqwest::Client) -> Self {
        Self {
            manager,
            http,
            tracks: DashMap::new(),
        }
    }

    fn call(&self, guild_id: GuildId) -> Result<Arc<Mutex<Call>>> {
        self.manager
            .get(guild_id)
            .ok_or_else(|| MusicError::StreamFailed("no hay llamada de voz activa".into()))
    }

    fn track(&self, guild_id: GuildId) -> Result<TrackHandle> {
        self.tracks
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MusicError::StreamFailed("no hay track activo".into()))
    }
}

fn control_error(e: ControlError) -> MusicError {
    MusicError::StreamFailed(e.to_string())
}

/// Engancha los avisos de fin/error del track a su intento de reproducción
fn watch_track(track: &TrackHandle, completion: CompletionNotifier) -> Result<()> {
    let registered = track
        .add_event(
            Event::Track(TrackEvent::End),
            TrackEndNotifier::new(completion.clone()),
        )
        .and_then(|_| {
            track.add_event(
                Event::Track(TrackEvent::Error),
                TrackErrorNotifier::new(completion.clone()),
            )
        });

    match registered {
        Ok(()) => Ok(()),
        // Terminó antes de poder registrar el handler
        Err(ControlError::Finished) => {
            completion.finished();
            Ok(())
        }
        Err(e) => Err(control_error(e)),
    }
}

#[async_trait]
impl Transport for SongbirdTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        listener: TransportListener,
    ) -> Result<TransportHandle> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| MusicError::ConnectFailed(e.to_string()))?;

        {
            let mut call = call.lock().await;
            call.remove_all_global_events();
            call.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectNotifier::new(guild_id, listener),
            );
            if let Err(e) = call.deafen(true).await {
                debug!("No se pudo ensordecer al bot: {}", e);
            }
        }

        info!("✅ Llamada de voz lista en guild {}", guild_id);
        Ok(TransportHandle::new(guild_id, channel_id))
    }

    async fn play_stream(
        &self,
        handle: &TransportHandle,
        stream: &StreamHandle,
        volume: f32,
        completion: CompletionNotifier,
    ) -> Result<()> {
        let call = self.call(handle.guild_id())?;
        let input = HttpRequest::new(self.http.clone(), stream.url().to_string());

        let track = {
            let mut call = call.lock().await;
            call.play_only(SongbirdTrack::from(input).volume(volume))
        };
        watch_track(&track, completion)?;

        self.tracks.insert(handle.guild_id(), track);
        Ok(())
    }

    async fn pause(&self, handle: &TransportHandle) -> Result<()> {
        self.track(handle.guild_id())?.pause().map_err(control_error)
    }

    async fn resume(&self, handle: &TransportHandle) -> Result<()> {
        self.track(handle.guild_id())?.play().map_err(control_error)
    }

    async fn stop(&self, handle: &TransportHandle) -> Result<()> {
        if let Some((_, track)) = self.tracks.remove(&handle.guild_id()) {
            match track.stop() {
                Ok(()) | Err(ControlError::Finished) => {}
                Err(e) => return Err(control_error(e)),
            }
        }
        Ok(())
    }

    async fn set_volume(&self, handle: &TransportHandle, volume: f32) -> Result<()> {
        self.track(handle.guild_id())?
            .set_volume(volume)
            .map_err(control_error)
    }

    async fn disconnect(&self, handle: &TransportHandle) -> Result<()> {
        self.tracks.remove(&handle.guild_id());

        match self.manager.remove(handle.guild_id()).await {
            Ok(()) | Err(JoinError::NoCall) => {
                info!("👋 Desconectado del canal de voz en guild {}", handle.guild_id());
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ Error al salir del canal: {}", e);
                Err(MusicError::ConnectFailed(e.to_string()))
            }
        }
    }
}
