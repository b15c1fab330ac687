//! # Cadence Core
//!
//! Playback synchronization engine: seek scheduling, audio/video readiness,
//! audio fill with drift correction, cache-underrun pausing and a worker
//! pool, driven one tick at a time by [`engine::PlaybackEngine`].

// ============================================================================
// Configuration / Plumbing
// ============================================================================
pub mod options;
pub mod events;
pub mod control;
pub mod time;

// ============================================================================
// Collaborator Interfaces
// ============================================================================
pub mod demuxer;
pub mod decode;
pub mod audio;
pub mod audio_buffer;
pub mod video;

// ============================================================================
// Synchronization
// ============================================================================
pub mod sync;
pub mod audio_sync;
pub mod pts_history;
pub mod seek;
pub mod cache;

// ============================================================================
// Loop Driver
// ============================================================================
pub mod engine;
pub mod thread_pool;

// ============================================================================
// Simulation
// ============================================================================
pub mod sim;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
