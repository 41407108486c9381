use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use open_music_core::{
    audio::{
        events::{EventBus, PlaybackEvent},
        player::AudioPlayer,
        registry::GuildSessionRegistry,
        songbird_transport::SongbirdTransport,
        track::SourceKind,
    },
    bot::OpenMusicBot,
    config::Config,
    sources::{DirectUrlClient, ResolverSet, SpotifyClient, YouTubeClient},
    storage::JsonPlaylistStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_core=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    // Fuentes de música
    let mut resolvers = ResolverSet::new(SourceKind::YouTube);
    resolvers.register(Arc::new(YouTubeClient::new(config.max_playlist_size)));
    resolvers.register(Arc::new(DirectUrlClient::new()));
    match config.spotify_credentials() {
        Some((client_id, client_secret)) => resolvers.register(Arc::new(SpotifyClient::new(
            http.clone(),
            client_id,
            client_secret,
            config.max_playlist_size,
        ))),
        None => warn!("⚠️ Credenciales de Spotify no configuradas, Spotify desactivado"),
    }
    let resolvers = Arc::new(resolvers);

    // Inicializar almacenamiento JSON
    let playlists = Arc::new(JsonPlaylistStore::new(config.data_dir.clone()).await?);

    let songbird = Songbird::serenity();
    let transport = Arc::new(SongbirdTransport::new(songbird.clone(), http));

    let (events, event_rx) = EventBus::new();
    tokio::spawn(log_events(event_rx));

    let registry = Arc::new(GuildSessionRegistry::new(
        resolvers.clone(),
        transport,
        events,
        config.session_settings(),
    ));
    let player = Arc::new(AudioPlayer::new(
        registry,
        resolvers,
        playlists,
        config.max_playlist_size,
    ));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(OpenMusicBot::new(player.clone()))
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        player.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

/// Registra los eventos de reproducción; la presentación queda fuera del core
async fn log_events(events: flume::Receiver<PlaybackEvent>) {
    while let Ok(event) = events.recv_async().await {
        match event {
            PlaybackEvent::TrackStarted { guild_id, track } => {
                info!("▶️ [{}] {}", guild_id, track)
            }
            PlaybackEvent::TrackFailed { guild_id, track, reason } => {
                warn!("⏭️ [{}] {} falló: {}", guild_id, track.title, reason)
            }
            PlaybackEvent::QueueEmpty { guild_id } => info!("📭 [{}] Cola terminada", guild_id),
            PlaybackEvent::SessionTerminated { guild_id, reason } => {
                info!("👋 [{}] Sesión terminada: {}", guild_id, reason)
            }
        }
    }
}

async fn health_check() -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    if yt_dlp.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes: yt-dlp");
    }
}
