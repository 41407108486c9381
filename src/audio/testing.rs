//! In-memory transport and resolver used by the core's tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    audio::{
        events::PlaybackEvent,
        track::{SourceKind, StreamHandle, Track},
        transport::{CompletionNotifier, Transport, TransportHandle, TransportListener},
    },
    error::{MusicError, Result},
    sources::SourceResolver,
};

pub(crate) fn track(name: &str) -> Track {
    Track::new(
        name,
        format!("https://example.com/{name}.mp3"),
        SourceKind::DirectUrl,
        UserId::new(1),
    )
}

pub(crate) async fn next_event(events: &flume::Receiver<PlaybackEvent>) -> PlaybackEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv_async())
        .await
        .expect("no llegó ningún evento")
        .expect("bus de eventos cerrado")
}

#[derive(Default)]
pub(crate) struct MockTransport {
    connect_delay: Duration,
    fail_connect: bool,
    connects: Mutex<HashMap<GuildId, usize>>,
    disconnects: AtomicUsize,
    pauses: AtomicUsize,
    stops: AtomicUsize,
    played: Mutex<Vec<String>>,
    volumes: Mutex<HashMap<GuildId, f32>>,
    completions: Mutex<HashMap<GuildId, CompletionNotifier>>,
    listeners: Mutex<HashMap<GuildId, TransportListener>>,
    fail_play: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub(crate) fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub(crate) fn fail_next_play(&self) {
        self.fail_play.store(true, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self, guild_id: GuildId) -> usize {
        self.connects.lock().get(&guild_id).copied().unwrap_or(0)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }

    pub(crate) fn last_volume(&self, guild_id: GuildId) -> Option<f32> {
        self.volumes.lock().get(&guild_id).copied()
    }

    pub(crate) fn completion(&self, guild_id: GuildId) -> Option<CompletionNotifier> {
        self.completions.lock().get(&guild_id).cloned()
    }

    /// Termina el track que suena en la guild
    pub(crate) fn finish(&self, guild_id: GuildId) {
        if let Some(completion) = self.completion(guild_id) {
            completion.finished();
        }
    }

    pub(crate) fn fail(&self, guild_id: GuildId, reason: &str) {
        if let Some(completion) = self.completion(guild_id) {
            completion.failed(reason);
        }
    }

    pub(crate) fn drop_connection(&self, guild_id: GuildId, reason: &str) {
        if let Some(listener) = self.listeners.lock().get(&guild_id) {
            listener.connection_lost(reason);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        listener: TransportListener,
    ) -> Result<TransportHandle> {
        *self.connects.lock().entry(guild_id).or_default() += 1;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.fail_connect {
            return Err(MusicError::ConnectFailed("sin permisos".into()));
        }
        self.listeners.lock().insert(guild_id, listener);
        Ok(TransportHandle::new(guild_id, channel_id))
    }

    async fn play_stream(
        &self,
        handle: &TransportHandle,
        stream: &StreamHandle,
        volume: f32,
        completion: CompletionNotifier,
    ) -> Result<()> {
        if self.fail_play.swap(false, Ordering::SeqCst) {
            return Err(MusicError::StreamFailed("driver caído".into()));
        }
        self.played.lock().push(stream.url().to_string());
        self.volumes.lock().insert(handle.guild_id(), volume);
        self.completions.lock().insert(handle.guild_id(), completion);
        Ok(())
    }

    async fn pause(&self, _handle: &TransportHandle) -> Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, _handle: &TransportHandle) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _handle: &TransportHandle) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_volume(&self, handle: &TransportHandle, volume: f32) -> Result<()> {
        self.volumes.lock().insert(handle.guild_id(), volume);
        Ok(())
    }

    async fn disconnect(&self, handle: &TransportHandle) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().remove(&handle.guild_id());
        Ok(())
    }
}

/// Resolver that fabricates tracks from the query text.
///
/// Queries containing `missing` resolve to nothing, `unavailable` makes the
/// catalog fail, and `playlist` yields three tracks. Tracks whose url contains
/// `broken` cannot be streamed.
pub(crate) struct MockResolver {
    kind: SourceKind,
    marker: &'static str,
    streams: bool,
    acquire_delay: Duration,
    searches: Mutex<Vec<String>>,
    acquired: Mutex<Vec<String>>,
}

impl MockResolver {
    pub(crate) fn new(kind: SourceKind, marker: &'static str) -> Self {
        Self {
            kind,
            marker,
            streams: true,
            acquire_delay: Duration::ZERO,
            searches: Mutex::new(Vec::new()),
            acquired: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn metadata_only(mut self) -> Self {
        self.streams = false;
        self
    }

    /// Cada `acquire_stream` tarda `delay` antes de responder
    pub(crate) fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    pub(crate) fn searches(&self) -> Vec<String> {
        self.searches.lock().clone()
    }

    pub(crate) fn acquired(&self) -> Vec<String> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl SourceResolver for MockResolver {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn is_valid_url(&self, query: &str) -> bool {
        query.contains(self.marker)
    }

    fn provides_streams(&self) -> bool {
        self.streams
    }

    async fn resolve_candidates(&self, query: &str, requested_by: UserId) -> Result<Vec<Track>> {
        self.searches.lock().push(query.to_string());

        if query.contains("missing") {
            return Ok(Vec::new());
        }
        if query.contains("unavailable") {
            return Err(MusicError::CatalogUnavailable("503".into()));
        }

        let (title, url) = if query.contains("://") {
            let title = query.rsplit('/').next().unwrap_or(query).to_string();
            (title, query.to_string())
        } else {
            (query.to_string(), format!("mock://{}/{}", self.kind, query.replace(' ', "-")))
        };

        let count = if query.contains("playlist") { 3 } else { 1 };
        Ok((1..=count)
            .map(|n| {
                let (title, url) = if count == 1 {
                    (title.clone(), url.clone())
                } else {
                    (format!("{title} #{n}"), format!("{url}#{n}"))
                };
                Track::new(title, url, self.kind, requested_by).with_duration(Duration::from_secs(180))
            })
            .collect())
    }

    async fn acquire_stream(&self, track: &Track) -> Result<StreamHandle> {
        if !self.acquire_delay.is_zero() {
            tokio::time::sleep(self.acquire_delay).await;
        }
        if track.url.contains("broken") {
            return Err(MusicError::CatalogUnavailable("stream no disponible".into()));
        }
        self.acquired.lock().push(track.url.clone());
        Ok(StreamHandle::new(format!("stream://{}", track.url)))
    }
}
