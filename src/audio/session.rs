//! Per-guild playback state machine.
//!
//! A [`PlaybackSession`] runs as one tokio task that owns every piece of the
//! guild's playback state: queue, current track, volume, loop mode, voice
//! connection and idle timers. Everything else talks to it through a cloneable
//! [`SessionHandle`], which turns each operation into a message answered over
//! a `oneshot`. Transport callbacks arrive on a second channel into the same
//! task, so no two operations on one session ever interleave.
//!
//! Connecting and stream acquisition are the slow steps. They run as in-flight
//! futures polled by the same `select!` loop, so `skip`, `stop` and friends are
//! still served while they are pending; dropping the future cancels them.

use futures::future::BoxFuture;
use serenity::model::id::{ChannelId, GuildId};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    audio::{
        events::{EventBus, PlaybackEvent, TerminationReason},
        idle::{IdleMonitor, IdleReason},
        queue::TrackQueue,
        track::{StreamHandle, Track},
        transport::{Transport, TransportHandle, TransportListener, TransportSignal},
    },
    error::{MusicError, Result},
    sources::ResolverSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Creada, sin conexión de voz
    Idle,
    Connecting,
    /// Conectada, reproduciendo o sin nada que reproducir
    Connected,
    Paused,
    /// Obteniendo el stream del track actual
    Buffering,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "inactiva",
            SessionState::Connecting => "conectando",
            SessionState::Connected => "conectada",
            SessionState::Paused => "pausada",
            SessionState::Buffering => "cargando",
            SessionState::Terminated => "terminada",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl LoopMode {
    /// Off → Track → Queue → Off
    pub fn next(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Track,
            LoopMode::Track => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Off,
        }
    }
}

/// Knobs a session is created with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub idle_timeout: Duration,
    pub alone_timeout: Duration,
    pub connect_timeout: Duration,
    pub stream_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_volume: 0.5,
            max_queue_size: 100,
            idle_timeout: Duration::from_secs(300),
            alone_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(30),
        }
    }
}

/// Copia del estado de la sesión, segura de leer fuera de la tarea
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub state: SessionState,
    pub current: Option<Track>,
    pub tracks: Vec<Track>,
    pub loop_mode: LoopMode,
    pub volume: f32,
    pub total_duration: Duration,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Connect { channel_id: ChannelId, reply: Reply<()> },
    Enqueue { track: Track, reply: Reply<usize> },
    EnqueueMany { tracks: Vec<Track>, reply: Reply<usize> },
    Pause(Reply<()>),
    Resume(Reply<()>),
    Skip(Reply<Track>),
    Stop(Reply<()>),
    Disconnect(Reply<()>),
    SetVolume { volume: f32, reply: Reply<f32> },
    SetLoopMode { mode: Option<LoopMode>, reply: Reply<LoopMode> },
    Shuffle(Reply<()>),
    Remove { position: usize, reply: Reply<Track> },
    Move { from: usize, to: usize, reply: Reply<()> },
    ClearQueue(Reply<usize>),
    Snapshot(Reply<QueueSnapshot>),
}

/// Cheap, cloneable reference to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    guild_id: GuildId,
    commands: mpsc::UnboundedSender<Command>,
    listener: TransportListener,
    state: watch::Receiver<SessionState>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Connect { .. } => "Connect",
            Command::Enqueue { .. } => "Enqueue",
            Command::EnqueueMany { .. } => "EnqueueMany",
            Command::Pause(_) => "Pause",
            Command::Resume(_) => "Resume",
            Command::Skip(_) => "Skip",
            Command::Stop(_) => "Stop",
            Command::Disconnect(_) => "Disconnect",
            Command::SetVolume { .. } => "SetVolume",
            Command::SetLoopMode { .. } => "SetLoopMode",
            Command::Shuffle(_) => "Shuffle",
            Command::Remove { .. } => "Remove",
            Command::Move { .. } => "Move",
            Command::ClearQueue(_) => "ClearQueue",
            Command::Snapshot(_) => "Snapshot",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    /// Identificador único de esta instancia (no de la guild)
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    /// Espera hasta que la sesión llegue a `target` (o termine)
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut state = self.state.clone();
        let reached = match state
            .wait_for(|s| *s == target || *s == SessionState::Terminated)
            .await
        {
            Ok(reached) => *reached,
            Err(_) => SessionState::Terminated,
        };
        reached
    }

    pub async fn terminated(&self) {
        self.wait_for_state(SessionState::Terminated).await;
    }

    pub async fn connect(&self, channel_id: ChannelId) -> Result<()> {
        self.request(|reply| Command::Connect { channel_id, reply }).await
    }

    /// Encola un track y devuelve su posición en la cola (desde 1)
    pub async fn enqueue(&self, track: Track) -> Result<usize> {
        self.request(|reply| Command::Enqueue { track, reply }).await
    }

    /// Encola varios tracks, los que no quepan se descartan
    pub async fn enqueue_many(&self, tracks: Vec<Track>) -> Result<usize> {
        self.request(|reply| Command::EnqueueMany { tracks, reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    /// Salta el track actual y devuelve el track saltado
    pub async fn skip(&self) -> Result<Track> {
        self.request(Command::Skip).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Ajusta el volumen (0.0 - 1.0) y devuelve el valor aplicado
    pub async fn set_volume(&self, volume: f32) -> Result<f32> {
        self.request(|reply| Command::SetVolume { volume, reply }).await
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<LoopMode> {
        self.request(|reply| Command::SetLoopMode {
            mode: Some(mode),
            reply,
        })
        .await
    }

    pub async fn cycle_loop_mode(&self) -> Result<LoopMode> {
        self.request(|reply| Command::SetLoopMode { mode: None, reply })
            .await
    }

    pub async fn shuffle(&self) -> Result<()> {
        self.request(Command::Shuffle).await
    }

    pub async fn remove(&self, position: usize) -> Result<Track> {
        self.request(|reply| Command::Remove { position, reply }).await
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Result<()> {
        self.request(|reply| Command::Move { from, to, reply }).await
    }

    /// Vacía la cola sin tocar el track actual
    pub async fn clear_queue(&self) -> Result<usize> {
        self.request(Command::ClearQueue).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn now_playing(&self) -> Result<Option<Track>> {
        Ok(self.snapshot().await?.current)
    }

    /// Participantes reales (no bots) en el canal de voz de la sesión
    pub fn participants_changed(&self, real: usize) {
        self.listener.participants_changed(real);
    }

    /// El bot salió del canal sin que lo pidiéramos
    pub fn connection_lost(&self, reason: impl Into<String>) {
        self.listener.connection_lost(reason);
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| MusicError::SessionClosed)?;
        response.await.map_err(|_| MusicError::SessionClosed)?
    }
}

pub struct PlaybackSession {
    guild_id: GuildId,
    settings: SessionSettings,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    queue: TrackQueue,
    current: Option<Track>,
    stream: Option<StreamHandle>,
    playback_id: u64,
    volume: f32,
    loop_mode: LoopMode,
    idle: IdleMonitor,
    channel_id: Option<ChannelId>,
    connection: Option<TransportHandle>,
    transport: Arc<dyn Transport>,
    resolvers: Arc<ResolverSet>,
    listener: TransportListener,
    events: EventBus,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<TransportSignal>,
    connecting: Option<BoxFuture<'static, Result<TransportHandle>>>,
    connect_waiters: Vec<Reply<()>>,
    buffering: Option<BoxFuture<'static, (u64, Result<StreamHandle>)>>,
}

impl PlaybackSession {
    /// Arranca la tarea de la sesión y devuelve su handle
    pub fn spawn(
        id: u64,
        guild_id: GuildId,
        settings: SessionSettings,
        resolvers: Arc<ResolverSet>,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> SessionHandle {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let listener = TransportListener::new(signal_tx);

        let session = Self {
            guild_id,
            state: SessionState::Idle,
            state_tx,
            queue: TrackQueue::new(settings.max_queue_size),
            current: None,
            stream: None,
            playback_id: 0,
            volume: settings.default_volume.clamp(0.0, 1.0),
            loop_mode: LoopMode::Off,
            idle: IdleMonitor::new(settings.idle_timeout, settings.alone_timeout),
            channel_id: None,
            connection: None,
            transport,
            resolvers,
            listener: listener.clone(),
            events,
            commands,
            signals,
            connecting: None,
            connect_waiters: Vec::new(),
            buffering: None,
            settings,
        };

        tokio::spawn(
            session
                .run()
                .instrument(info_span!("session", guild_id = %guild_id, id)),
        );

        SessionHandle {
            id,
            guild_id,
            commands: command_tx,
            listener,
            state,
        }
    }

    async fn run(mut self) {
        debug!("🎛️ Sesión iniciada");

        while self.state != SessionState::Terminated {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.teardown(TerminationReason::Requested).await,
                },
                Some(signal) = self.signals.recv() => self.handle_signal(signal).await,
                result = drive(&mut self.connecting) => self.on_connected(result).await,
                (playback_id, result) = drive(&mut self.buffering) => {
                    self.on_stream(playback_id, result).await
                }
                reason = self.idle.expired() => self.on_idle(reason).await,
            }
        }

        debug!("🎛️ Tarea de sesión finalizada");
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("📨 Comando: {:?} (estado {})", command, self.state);

        match command {
            Command::Connect { channel_id, reply } => self.connect(channel_id, reply),
            Command::Enqueue { track, reply } => {
                let result = self.queue.add(track);
                if result.is_ok() {
                    self.idle.touch();
                    self.advance();
                }
                let _ = reply.send(result);
            }
            Command::EnqueueMany { tracks, reply } => {
                let added = self.queue.add_many(tracks);
                if added > 0 {
                    self.idle.touch();
                    self.advance();
                }
                let _ = reply.send(Ok(added));
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause().await);
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
            Command::Skip(reply) => {
                let _ = reply.send(self.skip().await);
            }
            Command::Stop(reply) => {
                self.queue.clear();
                self.discard_current().await;
                info!("⏹️ Reproducción detenida");
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect(reply) => {
                self.teardown(TerminationReason::Requested).await;
                let _ = reply.send(Ok(()));
            }
            Command::SetVolume { volume, reply } => {
                let _ = reply.send(self.set_volume(volume).await);
            }
            Command::SetLoopMode { mode, reply } => {
                self.loop_mode = mode.unwrap_or_else(|| self.loop_mode.next());
                match self.loop_mode {
                    LoopMode::Off => info!("➡️ Repetición desactivada"),
                    LoopMode::Track => info!("🔂 Repetir canción activado"),
                    LoopMode::Queue => info!("🔁 Repetir cola activado"),
                }
                let _ = reply.send(Ok(self.loop_mode));
            }
            Command::Shuffle(reply) => {
                self.queue.shuffle();
                let _ = reply.send(Ok(()));
            }
            Command::Remove { position, reply } => {
                let _ = reply.send(self.queue.remove_at(position));
            }
            Command::Move { from, to, reply } => {
                let _ = reply.send(self.queue.move_track(from, to));
            }
            Command::ClearQueue(reply) => {
                let removed = self.queue.len();
                self.queue.clear();
                let _ = reply.send(Ok(removed));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    fn connect(&mut self, channel_id: ChannelId, reply: Reply<()>) {
        match self.state {
            SessionState::Idle => {
                info!("🔗 Conectando al canal {}", channel_id);
                self.channel_id = Some(channel_id);
                self.connect_waiters.push(reply);
                self.set_state(SessionState::Connecting);

                let transport = self.transport.clone();
                let listener = self.listener.clone();
                let guild_id = self.guild_id;
                let timeout = self.settings.connect_timeout;
                self.connecting = Some(Box::pin(async move {
                    match tokio::time::timeout(timeout, transport.connect(guild_id, channel_id, listener)).await {
                        Ok(result) => result,
                        Err(_) => Err(MusicError::ConnectTimeout),
                    }
                }));
            }
            // Un solo intento en vuelo: los demás esperan su resultado
            SessionState::Connecting if self.channel_id == Some(channel_id) => {
                self.connect_waiters.push(reply);
            }
            SessionState::Terminated => {
                let _ = reply.send(Err(MusicError::SessionClosed));
            }
            _ if self.channel_id == Some(channel_id) => {
                let _ = reply.send(Ok(()));
            }
            _ => {
                let current = self.channel_id.unwrap_or(channel_id);
                let _ = reply.send(Err(MusicError::AlreadyConnected(current)));
            }
        }
    }

    async fn on_connected(&mut self, result: Result<TransportHandle>) {
        match result {
            Ok(connection) => {
                info!("🔊 Conectado al canal de voz {}", connection.channel_id());
                self.connection = Some(connection);
                self.set_state(SessionState::Connected);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.idle.touch();
                self.advance();
            }
            Err(e) => {
                error!("❌ Error al conectar al canal de voz: {}", e);
                let reason = e.to_string();
                let mut waiters = self.connect_waiters.drain(..);
                if let Some(first) = waiters.next() {
                    let _ = first.send(Err(e));
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(MusicError::ConnectFailed(reason.clone())));
                }
                self.teardown(TerminationReason::ConnectFailed(reason)).await;
            }
        }
    }

    /// Si no suena nada y hay cola, empieza a cargar el siguiente track
    fn advance(&mut self) {
        if self.state != SessionState::Connected || self.current.is_some() {
            return;
        }
        let Some(track) = self.queue.next() else {
            return;
        };

        self.playback_id += 1;
        let playback_id = self.playback_id;
        info!("⏳ Cargando: {}", track.title);

        let resolvers = self.resolvers.clone();
        let timeout = self.settings.stream_timeout;
        let pending = track.clone();
        self.buffering = Some(Box::pin(async move {
            let result = match tokio::time::timeout(timeout, resolvers.acquire_stream(&pending)).await {
                Ok(result) => result,
                Err(_) => Err(MusicError::StreamTimeout(pending.title.clone())),
            };
            (playback_id, result)
        }));

        self.current = Some(track);
        self.set_state(SessionState::Buffering);
    }

    async fn on_stream(&mut self, playback_id: u64, result: Result<StreamHandle>) {
        if playback_id != self.playback_id {
            debug!("Stream obsoleto descartado ({})", playback_id);
            return;
        }

        match result {
            Ok(stream) => {
                let Some(connection) = self.connection.clone() else {
                    return;
                };
                let completion = self.listener.completion(playback_id);
                match self
                    .transport
                    .play_stream(&connection, &stream, self.volume, completion)
                    .await
                {
                    Ok(()) => {
                        self.stream = Some(stream);
                        self.set_state(SessionState::Connected);
                        self.idle.touch();
                        if let Some(track) = self.current.clone() {
                            info!("🎵 Reproduciendo: {}", track.title);
                            self.emit(|guild_id| PlaybackEvent::TrackStarted { guild_id, track });
                        }
                    }
                    Err(e) => {
                        error!("❌ El transporte no pudo reproducir: {}", e);
                        self.teardown(TerminationReason::TransportFailure(e.to_string()))
                            .await;
                    }
                }
            }
            Err(e) => {
                self.set_state(SessionState::Connected);
                if let Some(track) = self.current.take() {
                    warn!("⏭️ No se pudo obtener el stream de {}: {}", track.title, e);
                    let reason = e.to_string();
                    self.emit(|guild_id| PlaybackEvent::TrackFailed {
                        guild_id,
                        track,
                        reason,
                    });
                }
                self.playback_drained();
            }
        }
    }

    async fn handle_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Finished { playback_id } => {
                if playback_id != self.playback_id || self.stream.is_none() {
                    debug!("Fin de track obsoleto ignorado ({})", playback_id);
                    return;
                }
                self.stream = None;
                if let Some(track) = self.current.take() {
                    debug!("🏁 Track terminado: {}", track.title);
                    match self.loop_mode {
                        LoopMode::Off => {}
                        LoopMode::Track => self.queue.push_front(track),
                        LoopMode::Queue => self.queue.push_back(track),
                    }
                }
                self.set_state(SessionState::Connected);
                self.idle.touch();
                self.playback_drained();
            }
            TransportSignal::Failed {
                playback_id,
                reason,
            } => {
                if playback_id != self.playback_id || self.stream.is_none() {
                    debug!("Error de track obsoleto ignorado ({})", playback_id);
                    return;
                }
                // Songbird reports a dead HTTP input (e.g. an expired stream URL)
                // as a track error too, so it ends the session like any other
                // active-stream failure.
                error!("❌ Error de transporte durante la reproducción: {}", reason);
                self.teardown(TerminationReason::TransportFailure(reason)).await;
            }
            TransportSignal::ConnectionLost { reason } => {
                warn!("🔌 Conexión de voz perdida: {}", reason);
                self.teardown(TerminationReason::ConnectionLost(reason)).await;
            }
            TransportSignal::Participants { real } => {
                debug!("👥 Participantes reales en el canal: {}", real);
                self.idle.participants(real);
            }
        }
    }

    async fn pause(&mut self) -> Result<()> {
        if self.state != SessionState::Connected || self.stream.is_none() {
            return Err(MusicError::invalid_state("pausar", self.state));
        }
        if let Some(connection) = &self.connection {
            self.transport.pause(connection).await?;
        }
        self.set_state(SessionState::Paused);
        info!("⏸️ Reproducción pausada");
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if self.state != SessionState::Paused {
            return Err(MusicError::invalid_state("reanudar", self.state));
        }
        if let Some(connection) = &self.connection {
            self.transport.resume(connection).await?;
        }
        self.set_state(SessionState::Connected);
        self.idle.touch();
        info!("▶️ Reproducción reanudada");
        Ok(())
    }

    async fn skip(&mut self) -> Result<Track> {
        if self.current.is_none() {
            return Err(MusicError::invalid_state("saltar", self.state));
        }
        let skipped = self.discard_current().await;
        self.idle.touch();
        self.playback_drained();

        let skipped = skipped.ok_or_else(|| MusicError::invalid_state("saltar", self.state))?;
        info!("⏭️ Saltado: {}", skipped.title);
        Ok(skipped)
    }

    /// Cancela la carga o reproducción en curso y suelta el track actual,
    /// sin aplicar el modo loop
    async fn discard_current(&mut self) -> Option<Track> {
        self.buffering = None;
        self.playback_id += 1;

        if self.stream.take().is_some() {
            if let Some(connection) = &self.connection {
                if let Err(e) = self.transport.stop(connection).await {
                    warn!("⚠️ Error al detener el track: {}", e);
                }
            }
        }

        if matches!(self.state, SessionState::Buffering | SessionState::Paused) {
            self.set_state(SessionState::Connected);
        }
        self.current.take()
    }

    async fn set_volume(&mut self, volume: f32) -> Result<f32> {
        if volume.is_nan() {
            return Err(MusicError::InvalidVolume(volume.to_string()));
        }
        self.volume = volume.clamp(0.0, 1.0);

        if self.stream.is_some() {
            if let Some(connection) = &self.connection {
                if let Err(e) = self.transport.set_volume(connection, self.volume).await {
                    warn!("⚠️ No se pudo aplicar el volumen: {}", e);
                }
            }
        }

        info!("🔊 Volumen ajustado a {}%", (self.volume * 100.0).round() as u8);
        Ok(self.volume)
    }

    async fn on_idle(&mut self, reason: IdleReason) {
        match reason {
            IdleReason::Alone => {
                info!("🚪 Canal sin participantes, desconectando");
                self.teardown(TerminationReason::ChannelEmpty).await;
            }
            IdleReason::Inactivity => {
                let nothing_to_do = self.current.is_none() && self.queue.is_empty();
                if nothing_to_do || self.state == SessionState::Idle {
                    info!("💤 Desconexión por inactividad");
                    self.teardown(TerminationReason::IdleTimeout).await;
                } else {
                    self.idle.touch();
                }
            }
        }
    }

    fn playback_drained(&mut self) {
        self.advance();
        if self.current.is_none() && self.state == SessionState::Connected {
            info!("📭 Cola vacía, no hay siguiente track");
            self.emit(|guild_id| PlaybackEvent::QueueEmpty { guild_id });
        }
    }

    async fn teardown(&mut self, reason: TerminationReason) {
        if self.state == SessionState::Terminated {
            return;
        }

        let was_connecting = self.connecting.take().is_some();
        self.buffering = None;
        self.stream = None;

        let connection = self.connection.take().or_else(|| {
            // Un join cancelado a medias puede haber dejado la llamada abierta
            was_connecting
                .then_some(self.channel_id)
                .flatten()
                .map(|channel_id| TransportHandle::new(self.guild_id, channel_id))
        });
        if let Some(connection) = connection {
            if let Err(e) = self.transport.disconnect(&connection).await {
                warn!("⚠️ Error al desconectar: {}", e);
            }
        }

        self.queue.clear();
        self.current = None;
        self.idle.cancel();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(MusicError::SessionClosed));
        }

        self.set_state(SessionState::Terminated);
        info!("👋 Sesión terminada: {}", reason);
        self.emit(|guild_id| PlaybackEvent::SessionTerminated { guild_id, reason });
    }

    fn snapshot(&self) -> QueueSnapshot {
        let current_duration = self
            .current
            .as_ref()
            .and_then(|track| track.duration)
            .unwrap_or_default();

        QueueSnapshot {
            state: self.state,
            current: self.current.clone(),
            tracks: self.queue.list(),
            loop_mode: self.loop_mode,
            volume: self.volume,
            total_duration: self.queue.total_duration() + current_duration,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("🔀 {} → {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, build: impl FnOnce(GuildId) -> PlaybackEvent) {
        self.events.emit(build(self.guild_id));
    }
}

/// Polls an optional in-flight future; pending forever when the slot is empty.
async fn drive<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot.as_mut() {
        Some(future) => {
            let output = future.await;
            *slot = None;
            output
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        testing::{next_event, track, MockResolver, MockTransport},
        track::SourceKind,
    };
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(42);
    const CHANNEL: ChannelId = ChannelId::new(7);

    struct Harness {
        session: SessionHandle,
        transport: Arc<MockTransport>,
        resolver: Arc<MockResolver>,
        events: flume::Receiver<PlaybackEvent>,
    }

    fn harness_full(settings: SessionSettings, transport: MockTransport, resolver: MockResolver) -> Harness {
        let transport = Arc::new(transport);
        let resolver = Arc::new(resolver);
        let resolvers = Arc::new(ResolverSet::new(SourceKind::DirectUrl).with(resolver.clone()));
        let (bus, events) = EventBus::new();
        let session = PlaybackSession::spawn(1, GUILD, settings, resolvers, transport.clone(), bus);
        Harness {
            session,
            transport,
            resolver,
            events,
        }
    }

    fn harness_with(settings: SessionSettings, transport: MockTransport) -> Harness {
        harness_full(settings, transport, MockResolver::new(SourceKind::DirectUrl, "https://"))
    }

    /// Sesión conectada cuyo resolver tarda `delay` en entregar cada stream
    async fn connected_slow(settings: SessionSettings, delay: Duration) -> Harness {
        let resolver = MockResolver::new(SourceKind::DirectUrl, "https://").with_acquire_delay(delay);
        let h = harness_full(settings, MockTransport::new(), resolver);
        h.session.connect(CHANNEL).await.unwrap();
        h
    }

    fn harness() -> Harness {
        harness_with(SessionSettings::default(), MockTransport::new())
    }

    async fn connected() -> Harness {
        let h = harness();
        h.session.connect(CHANNEL).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
        h
    }

    fn titles(tracks: &[Track]) -> Vec<String> {
        tracks.iter().map(|t| t.title.clone()).collect()
    }

    async fn expect_started(h: &Harness, title: &str) {
        match next_event(&h.events).await {
            PlaybackEvent::TrackStarted { track, .. } => assert_eq!(track.title, title),
            other => panic!("se esperaba TrackStarted({title}), llegó {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enqueue_before_connect_plays_after_connect() {
        let h = harness();
        assert_eq!(h.session.enqueue(track("a")).await.unwrap(), 1);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.transport.played().is_empty());

        h.session.connect(CHANNEL).await.unwrap();
        expect_started(&h, "a").await;
        assert_eq!(h.transport.played(), vec!["stream://https://example.com/a.mp3"]);
        assert_eq!(h.transport.last_volume(GUILD), Some(0.5));
    }

    #[tokio::test]
    async fn test_skip_moves_to_next_track() {
        let h = connected().await;
        for name in ["a", "b", "c"] {
            h.session.enqueue(track(name)).await.unwrap();
        }
        expect_started(&h, "a").await;

        let skipped = h.session.skip().await.unwrap();
        assert_eq!(skipped.title, "a");

        let snapshot = h.session.snapshot().await.unwrap();
        assert_eq!(snapshot.current.map(|t| t.title), Some("b".to_string()));
        assert_eq!(titles(&snapshot.tracks), vec!["c"]);
        assert_eq!(h.transport.stops(), 1);

        expect_started(&h, "b").await;
    }

    #[tokio::test]
    async fn test_skip_with_nothing_playing_is_a_state_error() {
        let h = connected().await;
        let err = h.session.skip().await.unwrap_err();
        assert!(matches!(err, MusicError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_stale_completion_after_skip_is_ignored() {
        let h = connected().await;
        h.session.enqueue(track("a")).await.unwrap();
        h.session.enqueue(track("b")).await.unwrap();
        expect_started(&h, "a").await;

        let old = h.transport.completion(GUILD).unwrap();
        h.session.skip().await.unwrap();
        expect_started(&h, "b").await;

        old.finished();
        let now = h.session.now_playing().await.unwrap();
        assert_eq!(now.map(|t| t.title), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_stop_clears_everything_but_stays_connected() {
        let h = connected().await;
        for name in ["a", "b", "c"] {
            h.session.enqueue(track(name)).await.unwrap();
        }
        expect_started(&h, "a").await;

        h.session.stop().await.unwrap();

        let snapshot = h.session.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);
        assert!(snapshot.current.is_none());
        assert!(snapshot.tracks.is_empty());
        assert_eq!(h.transport.disconnects(), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume_validate_state() {
        let h = connected().await;
        assert!(matches!(
            h.session.pause().await,
            Err(MusicError::InvalidState { state: SessionState::Connected, .. })
        ));

        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        h.session.pause().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Paused);
        assert!(h.session.pause().await.is_err());

        h.session.resume().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(h.session.resume().await.is_err());
        assert_eq!(h.transport.pauses(), 1);
    }

    #[tokio::test]
    async fn test_volume_is_clamped_and_applied() {
        let h = connected().await;
        assert_eq!(h.session.set_volume(1.5).await.unwrap(), 1.0);
        assert_eq!(h.session.set_volume(-0.2).await.unwrap(), 0.0);
        assert!(matches!(
            h.session.set_volume(f32::NAN).await,
            Err(MusicError::InvalidVolume(_))
        ));

        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;
        assert_eq!(h.transport.last_volume(GUILD), Some(0.0));

        h.session.set_volume(0.8).await.unwrap();
        assert_eq!(h.transport.last_volume(GUILD), Some(0.8));
    }

    #[tokio::test]
    async fn test_loop_track_requeues_at_head() {
        let h = connected().await;
        h.session.set_loop_mode(LoopMode::Track).await.unwrap();
        h.session.enqueue(track("a")).await.unwrap();
        h.session.enqueue(track("b")).await.unwrap();

        for _ in 0..3 {
            expect_started(&h, "a").await;
            let snapshot = h.session.snapshot().await.unwrap();
            assert_eq!(titles(&snapshot.tracks), vec!["b"]);
            h.transport.finish(GUILD);
        }
        expect_started(&h, "a").await;

        h.session.set_loop_mode(LoopMode::Off).await.unwrap();
        h.transport.finish(GUILD);
        expect_started(&h, "b").await;
    }

    #[tokio::test]
    async fn test_loop_queue_appends_finished_track() {
        let h = connected().await;
        assert_eq!(h.session.cycle_loop_mode().await.unwrap(), LoopMode::Track);
        assert_eq!(h.session.cycle_loop_mode().await.unwrap(), LoopMode::Queue);
        h.session.enqueue(track("a")).await.unwrap();
        h.session.enqueue(track("b")).await.unwrap();

        expect_started(&h, "a").await;
        h.transport.finish(GUILD);
        expect_started(&h, "b").await;

        let snapshot = h.session.snapshot().await.unwrap();
        assert_eq!(titles(&snapshot.tracks), vec!["a"]);
    }

    #[tokio::test]
    async fn test_skip_ignores_loop_mode() {
        let h = connected().await;
        h.session.set_loop_mode(LoopMode::Track).await.unwrap();
        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        h.session.skip().await.unwrap();

        let snapshot = h.session.snapshot().await.unwrap();
        assert!(snapshot.current.is_none());
        assert!(snapshot.tracks.is_empty());
        assert_eq!(next_event(&h.events).await, PlaybackEvent::QueueEmpty { guild_id: GUILD });
    }

    #[tokio::test]
    async fn test_resolution_failure_skips_with_one_event() {
        let h = connected().await;
        h.session.enqueue(track("a")).await.unwrap();
        h.session.enqueue(track("broken")).await.unwrap();
        h.session.enqueue(track("c")).await.unwrap();

        expect_started(&h, "a").await;
        h.transport.finish(GUILD);

        match next_event(&h.events).await {
            PlaybackEvent::TrackFailed { track, .. } => assert_eq!(track.title, "broken"),
            other => panic!("se esperaba TrackFailed, llegó {other:?}"),
        }
        expect_started(&h, "c").await;
        h.transport.finish(GUILD);
        assert_eq!(next_event(&h.events).await, PlaybackEvent::QueueEmpty { guild_id: GUILD });

        assert!(h.events.try_recv().is_err());
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_while_buffering_is_a_state_error() {
        let h = connected_slow(SessionSettings::default(), Duration::from_secs(2)).await;
        h.session.enqueue(track("a")).await.unwrap();
        assert_eq!(h.session.wait_for_state(SessionState::Buffering).await, SessionState::Buffering);

        assert!(matches!(
            h.session.pause().await,
            Err(MusicError::InvalidState { state: SessionState::Buffering, .. })
        ));
        assert_eq!(h.transport.pauses(), 0);

        expect_started(&h, "a").await;
        h.session.pause().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_while_buffering_drops_pending_stream() {
        let h = connected_slow(SessionSettings::default(), Duration::from_secs(2)).await;
        h.session.enqueue(track("a")).await.unwrap();
        h.session.enqueue(track("b")).await.unwrap();
        h.session.wait_for_state(SessionState::Buffering).await;

        let skipped = h.session.skip().await.unwrap();
        assert_eq!(skipped.title, "a");
        assert_eq!(h.transport.stops(), 0);

        expect_started(&h, "b").await;
        assert_eq!(h.resolver.acquired(), vec!["https://example.com/b.mp3"]);
        assert_eq!(h.transport.played(), vec!["stream://https://example.com/b.mp3"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let now = h.session.now_playing().await.unwrap();
        assert_eq!(now.map(|t| t.title), Some("b".to_string()));
        assert_eq!(h.transport.played().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_buffering_plays_nothing() {
        let h = connected_slow(SessionSettings::default(), Duration::from_secs(2)).await;
        h.session.enqueue(track("a")).await.unwrap();
        h.session.enqueue(track("b")).await.unwrap();
        h.session.wait_for_state(SessionState::Buffering).await;

        h.session.stop().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = h.session.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);
        assert!(snapshot.current.is_none());
        assert!(snapshot.tracks.is_empty());
        assert!(h.resolver.acquired().is_empty());
        assert!(h.transport.played().is_empty());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout_fails_track_once_and_advances() {
        let settings = SessionSettings {
            stream_timeout: Duration::from_secs(10),
            ..SessionSettings::default()
        };
        let h = connected_slow(settings, Duration::from_secs(60)).await;
        h.session.enqueue(track("a")).await.unwrap();
        h.session.enqueue(track("b")).await.unwrap();

        for name in ["a", "b"] {
            match h.events.recv_async().await.unwrap() {
                PlaybackEvent::TrackFailed { track, reason, .. } => {
                    assert_eq!(track.title, name);
                    assert!(reason.contains("Tiempo agotado"), "{reason}");
                }
                other => panic!("se esperaba TrackFailed({name}), llegó {other:?}"),
            }
        }
        assert_eq!(h.events.recv_async().await.unwrap(), PlaybackEvent::QueueEmpty { guild_id: GUILD });
        assert!(h.events.try_recv().is_err());

        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(h.resolver.acquired().is_empty());
        assert!(h.transport.played().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_terminates_session() {
        let h = connected().await;
        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        h.transport.fail(GUILD, "decoder exploded");

        match next_event(&h.events).await {
            PlaybackEvent::SessionTerminated { reason, .. } => {
                assert_eq!(reason, TerminationReason::TransportFailure("decoder exploded".into()))
            }
            other => panic!("se esperaba SessionTerminated, llegó {other:?}"),
        }
        h.session.terminated().await;
        assert_eq!(h.transport.disconnects(), 1);
        assert!(matches!(h.session.pause().await, Err(MusicError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_play_start_failure_terminates_session() {
        let h = connected().await;
        h.transport.fail_next_play();
        h.session.enqueue(track("a")).await.unwrap();

        h.session.terminated().await;
        assert!(matches!(
            next_event(&h.events).await,
            PlaybackEvent::SessionTerminated {
                reason: TerminationReason::TransportFailure(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_transport_error() {
        let h = harness_with(SessionSettings::default(), MockTransport::new().failing_connect());
        let err = h.session.connect(CHANNEL).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);

        h.session.terminated().await;
        assert!(matches!(
            next_event(&h.events).await,
            PlaybackEvent::SessionTerminated {
                reason: TerminationReason::ConnectFailed(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let settings = SessionSettings {
            connect_timeout: Duration::from_secs(10),
            ..SessionSettings::default()
        };
        let h = harness_with(settings, MockTransport::new().with_connect_delay(Duration::from_secs(60)));

        let err = h.session.connect(CHANNEL).await.unwrap_err();
        assert!(matches!(err, MusicError::ConnectTimeout));
        h.session.terminated().await;
        assert_eq!(h.transport.connects(GUILD), 1);
    }

    #[tokio::test]
    async fn test_connect_to_other_channel_while_connected() {
        let h = connected().await;
        h.session.connect(CHANNEL).await.unwrap();
        let err = h.session.connect(ChannelId::new(8)).await.unwrap_err();
        assert!(matches!(err, MusicError::AlreadyConnected(c) if c == CHANNEL));
        assert_eq!(h.transport.connects(GUILD), 1);
    }

    #[tokio::test]
    async fn test_disconnect_terminates() {
        let h = connected().await;
        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        h.session.disconnect().await.unwrap();

        assert_eq!(h.session.state(), SessionState::Terminated);
        assert_eq!(h.transport.disconnects(), 1);
        assert_eq!(
            next_event(&h.events).await,
            PlaybackEvent::SessionTerminated {
                guild_id: GUILD,
                reason: TerminationReason::Requested
            }
        );
        assert!(matches!(h.session.snapshot().await, Err(MusicError::SessionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_disconnects_empty_session() {
        let h = connected().await;

        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(h.session.state(), SessionState::Terminated);
        assert_eq!(
            next_event(&h.events).await,
            PlaybackEvent::SessionTerminated {
                guild_id: GUILD,
                reason: TerminationReason::IdleTimeout
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_resets_idle_timer() {
        let h = connected().await;

        tokio::time::sleep(Duration::from_secs(200)).await;
        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        tokio::time::sleep(Duration::from_secs(50)).await;
        h.transport.finish(GUILD);
        assert_eq!(next_event(&h.events).await, PlaybackEvent::QueueEmpty { guild_id: GUILD });

        // 400s desde la conexión, pero solo 150s desde la última actividad
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(h.session.state(), SessionState::Connected);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(h.session.state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_session_is_not_idle() {
        let h = connected().await;
        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_channel_disconnects_after_alone_timeout() {
        let h = connected().await;
        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        h.session.participants_changed(0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.session.state(), SessionState::Connected);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.session.state(), SessionState::Terminated);
        assert_eq!(
            next_event(&h.events).await,
            PlaybackEvent::SessionTerminated {
                guild_id: GUILD,
                reason: TerminationReason::ChannelEmpty
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_rejoining_cancels_alone_timeout() {
        let h = connected().await;
        h.session.enqueue(track("a")).await.unwrap();
        expect_started(&h, "a").await;

        h.session.participants_changed(0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.session.participants_changed(1);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_connection_lost_terminates() {
        let h = connected().await;
        h.transport.drop_connection(GUILD, "kicked");

        h.session.terminated().await;
        assert_eq!(
            next_event(&h.events).await,
            PlaybackEvent::SessionTerminated {
                guild_id: GUILD,
                reason: TerminationReason::ConnectionLost("kicked".into())
            }
        );
    }

    #[tokio::test]
    async fn test_queue_editing_through_session() {
        let h = harness();
        for name in ["a", "b", "c", "d"] {
            h.session.enqueue(track(name)).await.unwrap();
        }

        assert_eq!(h.session.remove(2).await.unwrap().title, "b");
        h.session.move_track(3, 1).await.unwrap();
        let snapshot = h.session.snapshot().await.unwrap();
        assert_eq!(titles(&snapshot.tracks), vec!["d", "a", "c"]);

        assert!(matches!(h.session.remove(9).await, Err(MusicError::InvalidPosition(9))));
        assert_eq!(h.session.clear_queue().await.unwrap(), 3);
    }
}
