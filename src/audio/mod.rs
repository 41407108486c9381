//! # Audio Module
//!
//! Per-guild playback orchestration.
//!
//! ## Architecture
//!
//! ### [`registry`] - Guild Session Registry
//! - At most one live session per guild, created atomically on demand
//! - Terminated sessions are evicted automatically
//!
//! ### [`session`] - Playback Session
//! - One tokio task per guild owning queue, current track, volume and loop mode
//! - Operations are messages; transport callbacks arrive as signals
//! - Idle and empty-channel auto-disconnect via [`idle`]
//!
//! ### [`queue`] - Queue Management
//! - Ordered pending tracks with shuffle, remove and move
//!
//! ### [`transport`] - Voice Transport
//! - Seam between the core and the voice SDK; [`songbird_transport`] is the
//!   production implementation
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let player = AudioPlayer::new(registry, resolvers, playlists, 50);
//!
//! player.connect(guild_id, Some(channel_id)).await?;
//! let enqueued = player.enqueue(guild_id, "never gonna give you up", user_id).await?;
//! player.skip(guild_id).await?;
//! ```

pub mod events;
pub mod idle;
pub mod player;
pub mod queue;
pub mod registry;
pub mod session;
pub mod songbird_transport;
pub mod track;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
