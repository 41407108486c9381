//! Guild → session map.
//!
//! Holds at most one live [`SessionHandle`] per guild. Creation goes through
//! the `DashMap` entry API so two concurrent callers for the same guild always
//! end up with the same session. When a session terminates, a small reaper
//! task evicts it, so the next request for that guild starts from scratch.

use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::GuildId;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        events::EventBus,
        session::{PlaybackSession, SessionHandle, SessionSettings},
        transport::Transport,
    },
    sources::ResolverSet,
};

pub struct GuildSessionRegistry {
    sessions: Arc<DashMap<GuildId, SessionHandle>>,
    resolvers: Arc<ResolverSet>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    settings: SessionSettings,
    next_id: AtomicU64,
}

impl GuildSessionRegistry {
    pub fn new(
        resolvers: Arc<ResolverSet>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            resolvers,
            transport,
            events,
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Devuelve la sesión viva de la guild o crea una nueva
    pub fn get_or_create(&self, guild_id: GuildId) -> SessionHandle {
        let (session, created) = match self.sessions.entry(guild_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_terminated() {
                    let session = self.spawn_session(guild_id);
                    entry.insert(session.clone());
                    (session, true)
                } else {
                    (entry.get().clone(), false)
                }
            }
            Entry::Vacant(entry) => {
                let session = self.spawn_session(guild_id);
                entry.insert(session.clone());
                (session, true)
            }
        };

        // Fuera del lock del shard
        if created {
            self.spawn_reaper(&session);
        }
        session
    }

    /// Sesión viva de la guild, si existe
    pub fn get(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.sessions
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_terminated())
    }

    pub fn remove(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.sessions.remove(&guild_id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Desconecta todas las sesiones (apagado del bot)
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        info!("🛑 Cerrando {} sesiones", sessions.len());
        for session in sessions {
            if let Err(e) = session.disconnect().await {
                warn!("⚠️ Error cerrando sesión de {}: {}", session.guild_id(), e);
            }
        }
        self.sessions.clear();
    }

    fn spawn_session(&self, guild_id: GuildId) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("🆕 Nueva sesión {} para guild {}", id, guild_id);
        PlaybackSession::spawn(
            id,
            guild_id,
            self.settings.clone(),
            self.resolvers.clone(),
            self.transport.clone(),
            self.events.clone(),
        )
    }

    fn spawn_reaper(&self, session: &SessionHandle) {
        let sessions = Arc::clone(&self.sessions);
        let session = session.clone();
        tokio::spawn(async move {
            session.terminated().await;
            // Solo si nadie la reemplazó ya
            if sessions
                .remove_if(&session.guild_id(), |_, current| current.id() == session.id())
                .is_some()
            {
                debug!("🧹 Sesión {} retirada del registro", session.id());
            }
        });
    }
}
