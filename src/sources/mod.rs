pub mod direct_url;
pub mod spotify;
pub mod youtube;

use async_trait::async_trait;
use serenity::model::id::UserId;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    audio::track::{SourceKind, StreamHandle, Track},
    error::{MusicError, Result},
};

pub use direct_url::DirectUrlClient;
pub use spotify::SpotifyClient;
pub use youtube::YouTubeClient;

/// Trait común para todas las fuentes de música
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Catálogo que atiende este resolver
    fn kind(&self) -> SourceKind;

    /// Verifica si la consulta es una URL de esta fuente
    fn is_valid_url(&self, query: &str) -> bool;

    /// `false` para catálogos que solo entregan metadata
    fn provides_streams(&self) -> bool {
        true
    }

    /// Resuelve una URL o texto en uno o más tracks candidatos
    async fn resolve_candidates(&self, query: &str, requested_by: UserId) -> Result<Vec<Track>>;

    /// Obtiene el stream reproducible, justo antes de reproducir
    async fn acquire_stream(&self, track: &Track) -> Result<StreamHandle>;
}

/// Providers registered at startup, selected by [`SourceKind`].
///
/// Free text (anything no provider claims as its URL) goes to the search
/// catalog. Tracks from metadata-only catalogs are streamed by searching the
/// search catalog with the track's metadata.
#[derive(Clone)]
pub struct ResolverSet {
    providers: Vec<Arc<dyn SourceResolver>>,
    search_kind: SourceKind,
}

impl ResolverSet {
    pub fn new(search_kind: SourceKind) -> Self {
        Self {
            providers: Vec::new(),
            search_kind,
        }
    }

    /// Registra un provider; reemplaza al anterior del mismo tipo
    pub fn register(&mut self, resolver: Arc<dyn SourceResolver>) {
        let kind = resolver.kind();
        self.providers.retain(|existing| existing.kind() != kind);
        info!("🔌 Fuente registrada: {}", kind);
        self.providers.push(resolver);
    }

    pub fn with(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.register(resolver);
        self
    }

    pub fn provider(&self, kind: SourceKind) -> Result<&Arc<dyn SourceResolver>> {
        self.providers
            .iter()
            .find(|provider| provider.kind() == kind)
            .ok_or(MusicError::NoResolver(kind))
    }

    /// Detecta el catálogo de una consulta
    pub fn detect(&self, query: &str) -> SourceKind {
        self.providers
            .iter()
            .find(|provider| provider.is_valid_url(query))
            .map(|provider| provider.kind())
            .unwrap_or(self.search_kind)
    }

    /// Resuelve la consulta en su catálogo; nunca devuelve una lista vacía
    pub async fn resolve(&self, query: &str, requested_by: UserId) -> Result<Vec<Track>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MusicError::TrackNotFound(String::new()));
        }

        let kind = self.detect(query);
        debug!("🔍 Resolviendo '{}' con {}", query, kind);

        let tracks = self
            .provider(kind)?
            .resolve_candidates(query, requested_by)
            .await?;

        if tracks.is_empty() {
            return Err(MusicError::TrackNotFound(query.to_string()));
        }
        Ok(tracks)
    }

    /// Obtiene el stream de un track según su catálogo declarado
    pub async fn acquire_stream(&self, track: &Track) -> Result<StreamHandle> {
        let provider = self.provider(track.source)?;
        if provider.provides_streams() {
            return provider.acquire_stream(track).await;
        }

        // Catálogo solo-metadata: buscar el mismo tema en el catálogo de búsqueda
        let query = track.search_query();
        let search = self.provider(self.search_kind)?;
        info!("🔁 Buscando '{}' en {} para reproducir desde {}", query, self.search_kind, track.source);

        let candidate = search
            .resolve_candidates(&query, track.requested_by)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                warn!("❌ Sin equivalente en {} para: {}", self.search_kind, query);
                MusicError::TrackNotFound(query.clone())
            })?;

        search.acquire_stream(&candidate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::MockResolver;
    use pretty_assertions::assert_eq;

    fn resolvers() -> (ResolverSet, Arc<MockResolver>, Arc<MockResolver>) {
        let youtube = Arc::new(MockResolver::new(SourceKind::YouTube, "youtube.com"));
        let spotify = Arc::new(MockResolver::new(SourceKind::Spotify, "open.spotify.com").metadata_only());
        let set = ResolverSet::new(SourceKind::YouTube)
            .with(youtube.clone())
            .with(spotify.clone());
        (set, youtube, spotify)
    }

    #[test]
    fn test_detect_routes_urls_and_text() {
        let (set, _, _) = resolvers();
        assert_eq!(set.detect("https://open.spotify.com/track/abc"), SourceKind::Spotify);
        assert_eq!(set.detect("https://www.youtube.com/watch?v=x"), SourceKind::YouTube);
        assert_eq!(set.detect("never gonna give you up"), SourceKind::YouTube);
    }

    #[tokio::test]
    async fn test_resolve_empty_query_is_not_found() {
        let (set, _, _) = resolvers();
        let err = set.resolve("   ", UserId::new(1)).await.unwrap_err();
        assert!(matches!(err, MusicError::TrackNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let set = ResolverSet::new(SourceKind::YouTube);
        let err = set.resolve("anything", UserId::new(1)).await.unwrap_err();
        assert!(matches!(err, MusicError::NoResolver(SourceKind::YouTube)));
    }

    #[tokio::test]
    async fn test_metadata_only_tracks_stream_through_search_catalog() {
        let (set, youtube, spotify) = resolvers();

        let track = set
            .resolve("https://open.spotify.com/track/abc", UserId::new(1))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(track.source, SourceKind::Spotify);

        let stream = set.acquire_stream(&track).await.unwrap();

        assert_eq!(spotify.acquired(), Vec::<String>::new());
        assert_eq!(youtube.searches(), vec![track.search_query()]);
        assert_eq!(youtube.acquired().len(), 1);
        assert!(stream.url().starts_with("stream://"));
    }
}
