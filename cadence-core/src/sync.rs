//! Stream Readiness
//!
//! Tracks where audio and video are on their way from a seek or reinit to
//! active output, and owns the single point where both switch to PLAYING:
//!
//! ```text
//! SYNCING -> FILLING -> READY -> PLAYING -> DRAINING -> EOF
//!                                       \-> EOF
//! ```
//!
//! Neither stream leaves READY until both have reached it.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamKind {
    Audio,
    Video,
}

/// Per-stream progress. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum StreamStatus {
    /// Discarding data until the sync point is reached
    Syncing,
    /// Buffering, nothing is output yet
    Filling,
    /// Enough buffered to start; waiting for the other stream
    Ready,
    Playing,
    /// Decoder hit end of input, the sink still holds data
    Draining,
    /// Done, or the stream does not exist
    Eof,
}

/// What one restart check did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartReport {
    pub video_started: bool,
    pub audio_started: bool,
    /// A seek arrived while the previous one finished; run it now instead
    /// of letting audio play
    pub seek_now: bool,
    /// First start since the last reset
    pub restart_completed: bool,
    /// First start since the current item was loaded
    pub now_playing: bool,
}

#[derive(Debug, Clone)]
pub struct Readiness {
    audio: StreamStatus,
    video: StreamStatus,
    restart_complete: bool,
    now_playing_sent: bool,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            audio: StreamStatus::Eof,
            video: StreamStatus::Eof,
            restart_complete: false,
            now_playing_sent: false,
        }
    }

    /// A new item was loaded; the next restart announces it
    pub fn load_item(&mut self) {
        self.now_playing_sent = false;
    }

    /// Re-arm both streams. Absent streams count as finished.
    pub fn reset(&mut self, has_audio: bool, has_video: bool) {
        self.audio = if has_audio { StreamStatus::Syncing } else { StreamStatus::Eof };
        self.video = if has_video { StreamStatus::Syncing } else { StreamStatus::Eof };
        self.restart_complete = false;
    }

    pub fn status(&self, kind: StreamKind) -> StreamStatus {
        match kind {
            StreamKind::Audio => self.audio,
            StreamKind::Video => self.video,
        }
    }

    pub fn audio(&self) -> StreamStatus {
        self.audio
    }

    pub fn video(&self) -> StreamStatus {
        self.video
    }

    /// Move a stream along. PLAYING is only entered by [`Self::check_restart`].
    pub fn set(&mut self, kind: StreamKind, status: StreamStatus) {
        debug_assert!(status != StreamStatus::Playing, "PLAYING is set by the restart check");
        let slot = match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        };
        if *slot != status {
            tracing::trace!("{:?} status {:?} -> {:?}", kind, *slot, status);
            *slot = status;
        }
    }

    /// Both streams are at least READY
    pub fn gate_open(&self) -> bool {
        self.audio >= StreamStatus::Ready && self.video >= StreamStatus::Ready
    }

    pub fn restart_complete(&self) -> bool {
        self.restart_complete
    }

    /// Let READY streams start once the gate is open. `seek_pending` holds
    /// audio back when another seek is already queued. `None` when nothing
    /// changed.
    pub fn check_restart(&mut self, seek_pending: bool) -> Option<RestartReport> {
        if !self.gate_open() {
            return None;
        }
        let mut report = RestartReport::default();

        if self.video == StreamStatus::Ready {
            self.video = StreamStatus::Playing;
            report.video_started = true;
            tracing::debug!("starting video playback");
        }

        if self.audio == StreamStatus::Ready {
            if seek_pending && self.video == StreamStatus::Playing {
                report.seek_now = true;
                return Some(report);
            }
            self.audio = StreamStatus::Playing;
            report.audio_started = true;
            tracing::debug!("starting audio playback");
        }

        if !self.restart_complete {
            self.restart_complete = true;
            report.restart_completed = true;
            if !self.now_playing_sent {
                self.now_playing_sent = true;
                report.now_playing = true;
            }
        }
        (report != RestartReport::default()).then_some(report)
    }
}

// ============================================================================
// Tests
// ============================================================================
