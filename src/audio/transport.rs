//! Voice transport seam.
//!
//! The core never speaks the voice protocol itself. A [`Transport`] owns the
//! connection and the audio pipeline; the session only tells it what to play
//! and learns about completions through a [`TransportListener`], which turns
//! every callback into a message for the session's own task.

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{audio::track::StreamHandle, error::Result};

/// Conexión de voz activa de una guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    guild_id: GuildId,
    channel_id: ChannelId,
}

impl TransportHandle {
    pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            channel_id,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }
}

/// Señales que el transporte envía a la tarea de la sesión
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Finished { playback_id: u64 },
    Failed { playback_id: u64, reason: String },
    ConnectionLost { reason: String },
    Participants { real: usize },
}

/// Handed to the transport at connect time; outlives individual tracks.
#[derive(Debug, Clone)]
pub struct TransportListener {
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportListener {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TransportSignal>) -> Self {
        Self { tx }
    }

    /// Notificador para un intento de reproducción concreto
    pub fn completion(&self, playback_id: u64) -> CompletionNotifier {
        CompletionNotifier {
            playback_id,
            listener: self.clone(),
        }
    }

    pub fn connection_lost(&self, reason: impl Into<String>) {
        self.send(TransportSignal::ConnectionLost {
            reason: reason.into(),
        });
    }

    pub fn participants_changed(&self, real: usize) {
        self.send(TransportSignal::Participants { real });
    }

    fn send(&self, signal: TransportSignal) {
        // La sesión ya terminó: nada que avisar
        if self.tx.send(signal).is_err() {
            debug!("Señal de transporte ignorada, sesión cerrada");
        }
    }
}

/// Completion callback for one playback attempt.
///
/// Safe to fire from any thread and any number of times; the session ignores
/// signals whose `playback_id` is no longer current.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    playback_id: u64,
    listener: TransportListener,
}

impl CompletionNotifier {
    pub fn playback_id(&self) -> u64 {
        self.playback_id
    }

    pub fn finished(&self) {
        self.listener.send(TransportSignal::Finished {
            playback_id: self.playback_id,
        });
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.listener.send(TransportSignal::Failed {
            playback_id: self.playback_id,
            reason: reason.into(),
        });
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Se une al canal; `listener` recibe caídas de conexión
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        listener: TransportListener,
    ) -> Result<TransportHandle>;

    /// Empieza a reproducir `stream`, reemplazando lo que sonaba
    async fn play_stream(
        &self,
        handle: &TransportHandle,
        stream: &StreamHandle,
        volume: f32,
        completion: CompletionNotifier,
    ) -> Result<()>;

    async fn pause(&self, handle: &TransportHandle) -> Result<()>;

    async fn resume(&self, handle: &TransportHandle) -> Result<()>;

    async fn stop(&self, handle: &TransportHandle) -> Result<()>;

    async fn set_volume(&self, handle: &TransportHandle, volume: f32) -> Result<()>;

    async fn disconnect(&self, handle: &TransportHandle) -> Result<()>;
}
