//! Gateway glue.
//!
//! [`OpenMusicBot`] implements serenity's [`EventHandler`] and only forwards
//! voice-state changes into the playback core: how many real (non-bot) users
//! share the bot's channel, and whether the bot itself was removed from it.
//! Chat commands live elsewhere and talk to [`AudioPlayer`] directly.

use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Ready, UserId, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, info};

pub mod events;

use crate::audio::player::AudioPlayer;

pub struct OpenMusicBot {
    player: Arc<AudioPlayer>,
}

impl OpenMusicBot {
    pub fn new(player: Arc<AudioPlayer>) -> Self {
        Self { player }
    }

    /// Canal del bot y participantes reales en él, leído de la caché
    fn bot_channel_participants(ctx: &Context, guild_id: GuildId) -> Option<(ChannelId, usize)> {
        let bot_id = ctx.cache.current_user().id;
        let guild = ctx.cache.guild(guild_id)?;
        let bot_channel = guild.voice_states.get(&bot_id)?.channel_id?;

        let members = guild.voice_states.values().map(|state| {
            let is_bot = state
                .member
                .as_ref()
                .map(|member| member.user.bot)
                .or_else(|| ctx.cache.user(state.user_id).map(|user| user.bot))
                .unwrap_or(false);
            (state.channel_id, state.user_id, is_bot)
        });

        Some((bot_channel, real_participants(bot_channel, bot_id, members)))
    }
}

/// Usuarios no-bot conectados a `channel`
fn real_participants(
    channel: ChannelId,
    bot_id: UserId,
    members: impl IntoIterator<Item = (Option<ChannelId>, UserId, bool)>,
) -> usize {
    members
        .into_iter()
        .filter(|(channel_id, user_id, is_bot)| {
            *channel_id == Some(channel) && *user_id != bot_id && !is_bot
        })
        .count()
}

#[async_trait]
impl EventHandler for OpenMusicBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("✅ {} conectado en {} servidores", ready.user.name, ready.guilds.len());
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        // Detectar si el bot fue desconectado desde fuera
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id == current_user_id {
            let was_connected = old.as_ref().and_then(|state| state.channel_id).is_some();
            if was_connected && new.channel_id.is_none() {
                info!("🔌 Bot desconectado en guild {}", guild_id);
                self.player.connection_lost(guild_id, "el bot fue sacado del canal de voz");
                return;
            }
        }

        if let Some((channel_id, real)) = Self::bot_channel_participants(&ctx, guild_id) {
            debug!("👥 Canal {} en guild {}: {} usuarios", channel_id, guild_id, real);
            self.player.participants_changed(guild_id, real);
        }
    }
}
