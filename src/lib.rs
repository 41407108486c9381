//! # Open Music Core
//!
//! Playback core for a multi-guild Discord music bot: one isolated playback
//! session per guild, lazily resolved streams from YouTube, Spotify and direct
//! URLs, and a songbird-backed voice transport.

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;

pub use error::{ErrorKind, MusicError, Result};
