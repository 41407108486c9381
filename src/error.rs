//! Error taxonomy for the playback core.
//!
//! Every fallible operation of the core returns [`MusicError`]. Callers that
//! only need to decide how to react (tell the user, retry, log) should match on
//! [`MusicError::kind`] instead of on individual variants.

use serenity::model::id::{ChannelId, GuildId};
use thiserror::Error;

use crate::audio::session::SessionState;
use crate::audio::track::SourceKind;

pub type Result<T, E = MusicError> = std::result::Result<T, E>;

/// Broad category of a [`MusicError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong (bad volume, unknown position, ...).
    UserInput,
    /// The request is valid but not in the current session state.
    State,
    /// A catalog could not turn a query or track into something playable.
    Resolution,
    /// The voice connection failed to connect or broke while streaming.
    Transport,
    /// The playlist store is unavailable or returned garbage.
    Persistence,
}

#[derive(Error, Debug)]
pub enum MusicError {
    // Entrada del usuario
    #[error("Debes estar en un canal de voz para usar este comando")]
    NotInVoiceChannel,
    #[error("Volumen inválido: {0}")]
    InvalidVolume(String),
    #[error("La cola está llena (máximo {0} canciones)")]
    QueueFull(usize),
    #[error("No hay ninguna canción en la posición {0}")]
    InvalidPosition(usize),
    #[error("Playlist '{0}' no encontrada")]
    PlaylistNotFound(String),

    // Estado
    #[error("No se puede {operation} en estado {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Ya conectado al canal {0}")]
    AlreadyConnected(ChannelId),
    #[error("No hay sesión activa para la guild {0}")]
    NoSession(GuildId),
    #[error("La sesión ha terminado")]
    SessionClosed,
    #[error("La cola está vacía")]
    QueueEmpty,

    // Resolución
    #[error("No se encontraron resultados para: {0}")]
    TrackNotFound(String),
    #[error("No hay resolver registrado para {0}")]
    NoResolver(SourceKind),
    #[error("Catálogo no disponible: {0}")]
    CatalogUnavailable(String),
    #[error("Tiempo agotado obteniendo el stream de: {0}")]
    StreamTimeout(String),

    // Transporte
    #[error("Error al conectar al canal de voz: {0}")]
    ConnectFailed(String),
    #[error("Tiempo agotado conectando al canal de voz")]
    ConnectTimeout,
    #[error("Error en el stream de audio: {0}")]
    StreamFailed(String),

    // Persistencia
    #[error("Error de almacenamiento: {0}")]
    StorageIo(#[from] std::io::Error),
    #[error("Formato de almacenamiento inválido: {0}")]
    StorageFormat(#[from] serde_json::Error),
}

impl MusicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MusicError::NotInVoiceChannel
            | MusicError::InvalidVolume(_)
            | MusicError::QueueFull(_)
            | MusicError::InvalidPosition(_)
            | MusicError::PlaylistNotFound(_) => ErrorKind::UserInput,
            MusicError::InvalidState { .. }
            | MusicError::AlreadyConnected(_)
            | MusicError::NoSession(_)
            | MusicError::SessionClosed
            | MusicError::QueueEmpty => ErrorKind::State,
            MusicError::TrackNotFound(_)
            | MusicError::NoResolver(_)
            | MusicError::CatalogUnavailable(_)
            | MusicError::StreamTimeout(_) => ErrorKind::Resolution,
            MusicError::ConnectFailed(_)
            | MusicError::ConnectTimeout
            | MusicError::StreamFailed(_) => ErrorKind::Transport,
            MusicError::StorageIo(_) | MusicError::StorageFormat(_) => ErrorKind::Persistence,
        }
    }

    /// Whether repeating the same request later could succeed.
    ///
    /// Input and state errors never are; the core itself never retries
    /// anything, this is a hint for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MusicError::CatalogUnavailable(_)
                | MusicError::StreamTimeout(_)
                | MusicError::ConnectTimeout
                | MusicError::StorageIo(_)
        )
    }

    pub(crate) fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        MusicError::InvalidState { operation, state }
    }
}
