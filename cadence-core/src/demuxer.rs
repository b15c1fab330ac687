//! Demuxer collaborator interface.
//!
//! Container parsing lives outside the engine; it only needs to seek a
//! demuxer and look at its buffering state.

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Style hints for a demuxer-level seek
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SeekFlags: u32 {
        /// Target is a timestamp, not an offset from the current position
        const ABSOLUTE = 1 << 0;
        /// Target is a fraction of the file
        const FACTOR = 1 << 1;
        /// Land on a keyframe at or before the target
        const BACKWARD = 1 << 2;
        /// Land on a keyframe at or after the target
        const FORWARD = 1 << 3;
        /// The player will decode up to the exact target
        const HR = 1 << 4;
    }
}

/// What the demuxer's reader reports once per tick
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ReaderState {
    /// Nothing left to read ahead (fully buffered or at EOF)
    pub idle: bool,
    /// A decoder asked for a packet that was not there
    pub underrun: bool,
    /// Seconds of packets buffered ahead of the read position
    pub buffered_duration: f64,
    /// Buffered timestamp range, if known
    pub time_range: Option<(f64, f64)>,
}

pub trait Demuxer: Send {
    fn seekable(&self) -> bool;

    /// Whether `RELATIVE` targets can be passed through as-is
    fn supports_relative_seek(&self) -> bool {
        false
    }

    /// True if timestamps may jump backwards inside the file
    fn ts_resets_possible(&self) -> bool {
        false
    }

    fn seek(&mut self, target: f64, flags: SeekFlags);

    fn reader_state(&self) -> ReaderState;

    /// Start timestamp of the file
    fn start_time(&self) -> f64 {
        0.0
    }

    /// Duration in seconds, if known
    fn duration(&self) -> Option<f64>;

    /// Pts of the packet last handed to a decoder
    fn current_pts(&self) -> Option<f64>;
}

/// Separately opened file (external audio/subtitles) played alongside the
/// main demuxer
pub struct ExternalTrack {
    pub name: String,
    pub demuxer: Box<dyn Demuxer>,
    /// Timestamp offset of this file relative to the main timeline
    pub offset: f64,
}

impl ExternalTrack {
    pub fn new(name: impl Into<String>, demuxer: Box<dyn Demuxer>, offset: f64) -> Self {
        Self {
            name: name.into(),
            demuxer,
            offset,
        }
    }

    /// Seek to the position matching `main_pts` on the main timeline
    pub fn seek_to_main(&mut self, main_pts: f64) {
        let target = main_pts - self.offset;
        tracing::debug!("seeking external track {} to {:.3}", self.name, target);
        self.demuxer.seek(target, SeekFlags::ABSOLUTE);
    }
}
