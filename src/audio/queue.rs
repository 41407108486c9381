use rand::seq::SliceRandom;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::{
    audio::track::Track,
    error::{MusicError, Result},
};

/// Cola de tracks pendientes de una guild.
///
/// El track en reproducción no vive aquí: lo guarda la sesión. La cola no
/// tiene lock propio, solo la toca la tarea de su sesión.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Track>,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un track al final y devuelve su posición (desde 1)
    pub fn add(&mut self, track: Track) -> Result<usize> {
        if self.items.len() >= self.max_size {
            return Err(MusicError::QueueFull(self.max_size));
        }

        info!("➕ Agregado a la cola: {}", track.title);
        self.items.push_back(track);
        Ok(self.items.len())
    }

    /// Agrega varios tracks mientras haya espacio, devuelve cuántos entraron
    pub fn add_many(&mut self, tracks: impl IntoIterator<Item = Track>) -> usize {
        let available = self.max_size.saturating_sub(self.items.len());
        let before = self.items.len();
        self.items.extend(tracks.into_iter().take(available));

        let added = self.items.len() - before;
        info!("➕ Agregadas {} canciones a la cola", added);
        added
    }

    // Reencolados por modo loop: no cuentan contra el límite
    pub(crate) fn push_front(&mut self, track: Track) {
        self.items.push_front(track);
    }

    pub(crate) fn push_back(&mut self, track: Track) {
        self.items.push_back(track);
    }

    /// Saca el siguiente track (FIFO)
    pub fn next(&mut self) -> Option<Track> {
        let next = self.items.pop_front();
        if let Some(ref track) = next {
            debug!("➡️ Siguiente en cola: {}", track.title);
        }
        next
    }

    pub fn peek(&self) -> Option<&Track> {
        self.items.front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        info!("🗑️ Cola limpiada");
    }

    /// Mezcla todos los tracks pendientes
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
        info!("🔀 Cola mezclada");
    }

    /// Elimina el track en `position` (desde 1)
    pub fn remove_at(&mut self, position: usize) -> Result<Track> {
        let index = self.index_of(position)?;
        let removed = self
            .items
            .remove(index)
            .ok_or(MusicError::InvalidPosition(position))?;
        debug!("❌ Track eliminado en posición {}", position);
        Ok(removed)
    }

    /// Mueve un track de `from` a `to` (ambas desde 1)
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if from_index != to_index {
            let track = self
                .items
                .remove(from_index)
                .ok_or(MusicError::InvalidPosition(from))?;
            self.items.insert(to_index, track);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Copia ordenada de la cola
    pub fn list(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().filter_map(|track| track.duration).sum()
    }

    fn index_of(&self, position: usize) -> Result<usize> {
        if position == 0 || position > self.items.len() {
            return Err(MusicError::InvalidPosition(position));
        }
        Ok(position - 1)
    }
}
