use serenity::{async_trait, model::id::GuildId};
use songbird::{Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler};
use tracing::{debug, error, warn};

use crate::audio::transport::{CompletionNotifier, TransportListener};

/// Handler para el fin de un track: avisa a la sesión dueña
pub struct TrackEndNotifier {
    completion: CompletionNotifier,
}

impl TrackEndNotifier {
    pub fn new(completion: CompletionNotifier) -> Self {
        Self { completion }
    }
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        debug!("🏁 Fin de track (intento {})", self.completion.playback_id());
        self.completion.finished();
        None
    }
}

/// Handler para errores de tracks
pub struct TrackErrorNotifier {
    completion: CompletionNotifier,
}

impl TrackErrorNotifier {
    pub fn new(completion: CompletionNotifier) -> Self {
        Self { completion }
    }
}

#[async_trait]
impl VoiceEventHandler for TrackErrorNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        let reason = match ctx {
            EventContext::Track(track_list) => track_list
                .first()
                .map(|(state, _handle)| format!("{:?}", state.playing))
                .unwrap_or_else(|| "error desconocido".to_string()),
            _ => "error desconocido".to_string(),
        };

        error!("❌ Error en track (intento {}): {}", self.completion.playback_id(), reason);
        self.completion.failed(reason);
        None
    }
}

/// Handler para caídas del driver de voz
pub struct DisconnectNotifier {
    guild_id: GuildId,
    listener: TransportListener,
}

impl DisconnectNotifier {
    pub fn new(guild_id: GuildId, listener: TransportListener) -> Self {
        Self { guild_id, listener }
    }
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        if let EventContext::DriverDisconnect(data) = ctx {
            let reason = match &data.reason {
                Some(reason) => format!("{:?}", reason),
                None => format!("{:?}", &data.kind),
            };
            warn!("🔌 Driver de voz desconectado en guild {}: {}", self.guild_id, reason);
            self.listener.connection_lost(reason);
        }

        None
    }
}
