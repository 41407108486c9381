use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::session::SessionSettings;

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Audio
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,

    // Timeouts
    pub idle_timeout: Duration,
    pub alone_timeout: Duration,
    pub connect_timeout: Duration,
    pub stream_timeout: Duration,

    // Paths
    pub data_dir: PathBuf,

    // APIs (Opcionales)
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("No se pudo crear {}", config.data_dir.display()))?;

        Ok(config)
    }

    /// Construye la configuración a partir de una función de búsqueda de variables
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?,

            default_volume: parse_or(var("DEFAULT_VOLUME"), defaults.default_volume, "DEFAULT_VOLUME")?,
            max_queue_size: parse_or(var("MAX_QUEUE_SIZE"), defaults.max_queue_size, "MAX_QUEUE_SIZE")?,
            max_playlist_size: parse_or(var("MAX_PLAYLIST_SIZE"), defaults.max_playlist_size, "MAX_PLAYLIST_SIZE")?,

            idle_timeout: duration_or(var("INACTIVITY_TIMEOUT"), defaults.idle_timeout, "INACTIVITY_TIMEOUT")?,
            alone_timeout: duration_or(var("ALONE_TIMEOUT"), defaults.alone_timeout, "ALONE_TIMEOUT")?,
            connect_timeout: duration_or(var("CONNECTION_TIMEOUT"), defaults.connect_timeout, "CONNECTION_TIMEOUT")?,
            stream_timeout: duration_or(var("STREAM_TIMEOUT"), defaults.stream_timeout, "STREAM_TIMEOUT")?,

            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),

            spotify_client_id: var("SPOTIFY_CLIENT_ID"),
            spotify_client_secret: var("SPOTIFY_CLIENT_SECRET"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// - Volume must be between 0.0 and 1.0
    /// - Queue and playlist limits must be greater than 0
    /// - Timeouts must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 1.0, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        for (name, timeout) in [
            ("INACTIVITY_TIMEOUT", self.idle_timeout),
            ("ALONE_TIMEOUT", self.alone_timeout),
            ("CONNECTION_TIMEOUT", self.connect_timeout),
            ("STREAM_TIMEOUT", self.stream_timeout),
        ] {
            if timeout.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        Ok(())
    }

    /// Credenciales de Spotify, solo si están ambas
    pub fn spotify_credentials(&self) -> Option<(String, String)> {
        match (&self.spotify_client_id, &self.spotify_client_secret) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            _ => None,
        }
    }

    /// Parámetros que usa cada sesión de reproducción
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            default_volume: self.default_volume,
            max_queue_size: self.max_queue_size,
            idle_timeout: self.idle_timeout,
            alone_timeout: self.alone_timeout,
            connect_timeout: self.connect_timeout,
            stream_timeout: self.stream_timeout,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token and Spotify secrets.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Audio: {}% vol, {} queue, {} playlist\n  \
            Timeouts: idle {}, alone {}, connect {}, stream {}\n  \
            Data: {}\n  \
            Spotify: {}",
            (self.default_volume * 100.0).round() as u32,
            self.max_queue_size,
            self.max_playlist_size,
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.alone_timeout),
            humantime::format_duration(self.connect_timeout),
            humantime::format_duration(self.stream_timeout),
            self.data_dir.display(),
            if self.spotify_credentials().is_some() { "enabled" } else { "disabled" },
        )
    }
}

fn parse_or<T>(value: Option<String>, default: T, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} inválido: {}", name, value)),
        None => Ok(default),
    }
}

/// Duraciones en formato humantime (`5m`, `90s`)
fn duration_or(value: Option<String>, default: Duration, name: &str) -> Result<Duration> {
    match value {
        Some(value) => humantime::parse_duration(value.trim())
            .with_context(|| format!("{} inválido: {}", name, value)),
        None => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let session = SessionSettings::default();
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),

            default_volume: session.default_volume,
            max_queue_size: session.max_queue_size,
            max_playlist_size: 50,

            idle_timeout: session.idle_timeout,
            alone_timeout: session.alone_timeout,
            connect_timeout: session.connect_timeout,
            stream_timeout: session.stream_timeout,

            data_dir: "./data".into(),

            spotify_client_id: None,
            spotify_client_secret: None,
        }
    }
}
