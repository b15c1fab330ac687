//! # Video Chain
//!
//! Takes decoded frames from a [`VideoSource`] and decides which ones reach
//! the screen:
//!
//! ```text
//! ┌──────────┐  poll   ┌─────────────────────────┐  present  ┌─────────┐
//! │ Decoder  │ ──────► │ SYNCING: drop < target  │ ────────► │ Display │
//! │ (source) │         │ FILLING: wait prefill   │           └─────────┘
//! └──────────┘         │ PLAYING: show when due  │
//!                      └─────────────────────────┘
//! ```
//!
//! Every frame that passes through is recorded in the pts history so that
//! backstep can find its predecessor.

use crate::pts_history::PtsHistory;
use crate::seek::HrSeekState;
use crate::sync::StreamStatus;

/// Frames this close before the exact-seek target still count as reached
pub const HRSEEK_TOLERANCE: f64 = 0.005;

/// State of the decoder queue head
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VideoPoll {
    Frame(f64),
    /// Nothing decoded yet
    Wait,
    Eof,
}

/// Decoded-frame queue fed by a video decoder
pub trait VideoSource: Send {
    /// Oldest decoded frame, without taking it
    fn poll(&mut self) -> VideoPoll;

    /// The frame after the oldest one
    fn peek_second(&mut self) -> VideoPoll;

    /// Frames decoded ahead
    fn queued(&self) -> usize;

    /// Throw away the oldest frame
    fn discard(&mut self);

    /// Hand the oldest frame to the display
    fn present(&mut self);

    /// Drop decoder state after a seek
    fn reset(&mut self);
}

// ============================================================================
// Chain
// ============================================================================

/// Result of a presentation attempt
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Presented {
    /// Pts of the frame put on screen this tick
    pub shown: Option<f64>,
    /// Seconds until the next frame is due
    pub wait: Option<f64>,
    pub eof: bool,
}

pub struct VideoChain {
    source: Box<dyn VideoSource>,
    /// First frame after the sync point; audio syncs to it
    next_pts: Option<f64>,
    /// Last frame put on screen. Survives seeks.
    last_shown: Option<f64>,
    shown: u64,
    dropped: u64,
}

impl VideoChain {
    pub fn new(source: Box<dyn VideoSource>) -> Self {
        Self {
            source,
            next_pts: None,
            last_shown: None,
            shown: 0,
            dropped: 0,
        }
    }

    pub fn next_pts(&self) -> Option<f64> {
        self.next_pts
    }

    pub fn last_shown(&self) -> Option<f64> {
        self.last_shown
    }

    pub fn frames_shown(&self) -> u64 {
        self.shown
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped
    }

    pub fn reset(&mut self) {
        self.source.reset();
        self.next_pts = None;
    }

    /// Advance a stream that is SYNCING or FILLING; returns the new status
    pub fn sync(
        &mut self,
        mut status: StreamStatus,
        hrseek: &HrSeekState,
        history: &mut PtsHistory,
        prefill: usize,
    ) -> StreamStatus {
        while status == StreamStatus::Syncing {
            let pts = match self.source.poll() {
                VideoPoll::Wait => return status,
                VideoPoll::Eof => {
                    tracing::debug!("video EOF while syncing");
                    return StreamStatus::Eof;
                }
                VideoPoll::Frame(pts) => pts,
            };
            let framedrop = hrseek.active && hrseek.framedrop;

            if hrseek.active && pts < hrseek.pts - HRSEEK_TOLERANCE {
                // Seeking past the end: keep the last frame
                let keep = hrseek.last_frame && self.source.peek_second() == VideoPoll::Eof;
                if !keep {
                    history.add(Some(pts), framedrop);
                    self.source.discard();
                    self.dropped += 1;
                    continue;
                }
            }

            history.add(Some(pts), framedrop);
            self.next_pts = Some(pts);
            status = StreamStatus::Filling;
            tracing::trace!("video synced at {:.3}", pts);
        }

        if status == StreamStatus::Filling {
            let enough = self.source.queued() >= prefill.max(1);
            if enough || self.source.peek_second() == VideoPoll::Eof {
                status = StreamStatus::Ready;
            }
        }
        status
    }

    /// Show the head frame once `clock` reaches it, or right away when
    /// `force` is set (frame step, first frame while paused)
    pub fn present_due(
        &mut self,
        clock: Option<f64>,
        force: bool,
        history: &mut PtsHistory,
    ) -> Presented {
        let mut out = Presented::default();
        let pts = match self.source.poll() {
            VideoPoll::Wait => return out,
            VideoPoll::Eof => {
                out.eof = true;
                return out;
            }
            VideoPoll::Frame(pts) => pts,
        };

        let due = force || clock.map_or(true, |c| pts <= c);
        if !due {
            out.wait = clock.map(|c| pts - c);
            return out;
        }

        self.source.present();
        if self.next_pts != Some(pts) {
            history.add(Some(pts), false);
        }
        self.next_pts = None;
        self.last_shown = Some(pts);
        self.shown += 1;
        out.shown = Some(pts);

        out.wait = match self.source.poll() {
            VideoPoll::Frame(next) => Some(clock.map_or(0.0, |c| (next - c).max(0.0))),
            VideoPoll::Wait => None,
            VideoPoll::Eof => {
                out.eof = true;
                None
            }
        };
        out
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimVideo;

    fn frames(n: usize, fps: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 / fps).collect()
    }

    fn exact(pts: f64) -> HrSeekState {
        HrSeekState {
            active: true,
            pts,
            framedrop: false,
            last_frame: false,
        }
    }

    #[test]
    fn test_sync_without_hrseek_takes_first_frame() {
        let mut chain = VideoChain::new(Box::new(SimVideo::from_pts(&frames(10, 10.0))));
        let mut history = PtsHistory::new();
        let status = chain.sync(StreamStatus::Syncing, &HrSeekState::default(), &mut history, 1);
        assert_eq!(status, StreamStatus::Ready);
        assert_eq!(chain.next_pts(), Some(0.0));
        assert_eq!(chain.frames_dropped(), 0);
    }

    #[test]
    fn test_hrseek_drops_until_target() {
        let mut chain = VideoChain::new(Box::new(SimVideo::from_pts(&frames(20, 10.0))));
        let mut history = PtsHistory::new();
        let status = chain.sync(StreamStatus::Syncing, &exact(1.0), &mut history, 1);
        assert_eq!(status, StreamStatus::Ready);
        assert_eq!(chain.next_pts(), Some(1.0));
        assert_eq!(chain.frames_dropped(), 10);
        // Continuity kept: the frame before the target is known
        assert_eq!(history.find_previous(1.0), Some(0.9));
    }

    #[test]
    fn test_tolerance_near_target() {
        let mut chain = VideoChain::new(Box::new(SimVideo::from_pts(&[0.996, 1.04])));
        let mut history = PtsHistory::new();
        chain.sync(StreamStatus::Syncing, &exact(1.0), &mut history, 1);
        assert_eq!(chain.next_pts(), Some(0.996));
    }

    #[test]
    fn test_seek_past_end_keeps_last_frame() {
        let mut chain = VideoChain::new(Box::new(SimVideo::from_pts(&frames(5, 10.0))));
        let mut history = PtsHistory::new();
        let hrseek = HrSeekState {
            last_frame: true,
            ..exact(10.0)
        };
        let status = chain.sync(StreamStatus::Syncing, &hrseek, &mut history, 1);
        assert_eq!(status, StreamStatus::Ready);
        assert_eq!(chain.next_pts(), Some(0.4));

        let mut chain = VideoChain::new(Box::new(SimVideo::from_pts(&frames(5, 10.0))));
        let status = chain.sync(StreamStatus::Syncing, &exact(10.0), &mut history, 1);
        assert_eq!(status, StreamStatus::Eof);
    }

    #[test]
    fn test_waits_for_prefill() {
        let mut chain = VideoChain::new(Box::new(SimVideo::from_pts(&frames(10, 10.0))));
        let mut history = PtsHistory::new();
        let status = chain.sync(StreamStatus::Syncing, &HrSeekState::default(), &mut history, 8);
        // The simulated decoder runs four frames ahead
        assert_eq!(status, StreamStatus::Filling);
    }

    #[test]
    fn test_present_follows_clock() {
        let video = SimVideo::from_pts(&frames(3, 10.0));
        let log = video.presented_log();
        let mut chain = VideoChain::new(Box::new(video));
        let mut history = PtsHistory::new();
        chain.sync(StreamStatus::Syncing, &HrSeekState::default(), &mut history, 1);

        let p = chain.present_due(Some(0.0), false, &mut history);
        assert_eq!(p.shown, Some(0.0));
        assert!((p.wait.unwrap() - 0.1).abs() < 1e-9);

        let p = chain.present_due(Some(0.05), false, &mut history);
        assert_eq!(p.shown, None);
        assert!((p.wait.unwrap() - 0.05).abs() < 1e-9);

        // Frame step ignores the clock
        assert_eq!(chain.present_due(Some(0.05), true, &mut history).shown, Some(0.1));

        let p = chain.present_due(Some(0.2), false, &mut history);
        assert_eq!(p.shown, Some(0.2));
        assert!(p.eof);
        assert_eq!(*log.lock(), vec![0.0, 0.1, 0.2]);
        assert_eq!(chain.last_shown(), Some(0.2));
        assert_eq!(history.find_previous(0.2), Some(0.1));
    }

    #[test]
    fn test_last_shown_survives_reset() {
        let mut chain = VideoChain::new(Box::new(SimVideo::from_pts(&frames(3, 10.0))));
        let mut history = PtsHistory::new();
        chain.present_due(None, false, &mut history);
        chain.reset();
        assert_eq!(chain.last_shown(), Some(0.0));
        assert_eq!(chain.next_pts(), None);
    }
}
