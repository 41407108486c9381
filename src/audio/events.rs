//! Events the core emits towards the presentation layer.
//!
//! Sessions publish on an unbounded [`flume`] channel so a slow or missing
//! consumer can never block a session task.

use serenity::model::id::GuildId;
use std::fmt;
use tracing::debug;

use crate::audio::track::Track;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    TrackStarted {
        guild_id: GuildId,
        track: Track,
    },
    TrackFailed {
        guild_id: GuildId,
        track: Track,
        reason: String,
    },
    QueueEmpty {
        guild_id: GuildId,
    },
    SessionTerminated {
        guild_id: GuildId,
        reason: TerminationReason,
    },
}

impl PlaybackEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            PlaybackEvent::TrackStarted { guild_id, .. }
            | PlaybackEvent::TrackFailed { guild_id, .. }
            | PlaybackEvent::QueueEmpty { guild_id }
            | PlaybackEvent::SessionTerminated { guild_id, .. } => *guild_id,
        }
    }
}

/// Por qué terminó una sesión
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// `disconnect()` explícito
    Requested,
    /// Sin actividad durante el timeout de inactividad
    IdleTimeout,
    /// El canal se quedó sin participantes reales
    ChannelEmpty,
    /// El bot fue expulsado o la conexión de voz se cayó
    ConnectionLost(String),
    /// No se pudo conectar al canal
    ConnectFailed(String),
    /// Falló el transporte durante la reproducción
    TransportFailure(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Requested => write!(f, "desconexión solicitada"),
            TerminationReason::IdleTimeout => write!(f, "inactividad"),
            TerminationReason::ChannelEmpty => write!(f, "canal vacío"),
            TerminationReason::ConnectionLost(why) => write!(f, "conexión perdida: {}", why),
            TerminationReason::ConnectFailed(why) => write!(f, "conexión fallida: {}", why),
            TerminationReason::TransportFailure(why) => write!(f, "fallo de transporte: {}", why),
        }
    }
}

/// Sender side of the event bus, cloned into every session.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: flume::Sender<PlaybackEvent>,
}

impl EventBus {
    pub fn new() -> (Self, flume::Receiver<PlaybackEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: PlaybackEvent) {
        if let Err(flume::SendError(event)) = self.tx.send(event) {
            debug!("📭 Evento descartado, nadie escucha: {:?}", event);
        }
    }
}
