//! # Seek Scheduler
//!
//! Seeks are never executed where they are requested. `queue_seek` only
//! merges the request into one pending slot; the playback loop runs it
//! with `execute_queued_seek` on its next tick:
//!
//! - relative requests add up, absolute and factor requests replace
//! - non-immediate seeks are held back while the previous seek has not shown
//!   a frame yet, so key repeat does not turn into a seek storm
//! - frame-exact ("hr") seeks land the demuxer a little before the target and
//!   let the stream sync logic drop everything up to it
//!
//! Backward frame stepping is driven from here as well (`handle_backstep`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::demuxer::{Demuxer, ExternalTrack, SeekFlags};
use crate::options::{HrSeekMode, PlaybackOptions};
use crate::pts_history::PtsHistory;
use crate::sync::StreamStatus;

#[derive(Debug, Error, PartialEq)]
pub enum SeekError {
    #[error("No file loaded")]
    NoDemuxer,
    #[error("Cannot seek in this stream")]
    NotSeekable,
    #[error("Backstep failed")]
    BackstepFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekKind {
    #[default]
    None,
    /// Seconds from the current position
    Relative,
    /// Timestamp in seconds
    Absolute,
    /// Fraction of the file, 0.0..=1.0
    Factor,
}

/// Ordered: merging keeps the highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekPrecision {
    /// Decided by the `hr_seek` option
    #[default]
    Default,
    Keyframe,
    Exact,
    /// Exact, with a larger demuxer safety offset
    VeryExact,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SeekRequest {
    pub kind: SeekKind,
    pub amount: f64,
    pub precision: SeekPrecision,
    pub immediate: bool,
}

impl SeekRequest {
    pub fn absolute(amount: f64, precision: SeekPrecision) -> Self {
        Self {
            kind: SeekKind::Absolute,
            amount,
            precision,
            immediate: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.kind != SeekKind::None
    }
}

/// Frame-exact positioning after a seek
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HrSeekState {
    pub active: bool,
    /// Frames and samples before this are dropped
    pub pts: f64,
    /// Decoders may skip frames while catching up
    pub framedrop: bool,
    /// Target is at or past the end: keep the last frame instead of
    /// dropping everything
    pub last_frame: bool,
}

/// Backward frame step progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackstepState {
    #[default]
    Idle,
    /// Look for the previous frame in the pts history
    Pending { start_gen: u64 },
    /// An index-building seek is running; retry every tick until the
    /// history covers the current frame
    AwaitingIndex { start_gen: u64 },
}

/// What a seek needs from the rest of the player
pub struct SeekEnv<'a> {
    pub opts: &'a PlaybackOptions,
    pub demuxer: Option<&'a mut Box<dyn Demuxer>>,
    pub externals: &'a mut [ExternalTrack],
    pub history: &'a mut PtsHistory,
    /// Current playback position, if known
    pub current_time: Option<f64>,
    pub now: f64,
}

/// Result of an executed seek. The caller resets playback state and
/// output buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekOutcome {
    /// Target timestamp when it is known up front
    pub target: Option<f64>,
    pub hr_seek: bool,
}

#[derive(Debug, Default)]
pub struct SeekScheduler {
    pending: SeekRequest,
    /// When the last seek ran. `None` is "long ago", which disables the
    /// debounce.
    start_timestamp: Option<f64>,
    hrseek: HrSeekState,
    backstep: BackstepState,
    last_seek_pts: Option<f64>,
}

impl SeekScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &SeekRequest {
        &self.pending
    }

    pub fn hrseek(&self) -> &HrSeekState {
        &self.hrseek
    }

    pub fn hrseek_mut(&mut self) -> &mut HrSeekState {
        &mut self.hrseek
    }

    /// Stop frame-exact dropping (target frame reached)
    pub fn end_hrseek(&mut self) {
        self.hrseek.active = false;
    }

    pub fn backstep(&self) -> BackstepState {
        self.backstep
    }

    pub fn last_seek_pts(&self) -> Option<f64> {
        self.last_seek_pts
    }

    /// Force the next queued seek to run on the next tick
    pub fn make_immediate(&mut self) {
        self.pending.immediate = true;
    }

    /// Merge a request into the pending slot. No I/O happens here.
    pub fn queue_seek(
        &mut self,
        kind: SeekKind,
        amount: f64,
        precision: SeekPrecision,
        immediate: bool,
    ) {
        let pending = &mut self.pending;
        match kind {
            SeekKind::Relative => {
                pending.immediate |= immediate;
                if pending.kind == SeekKind::Factor {
                    return;
                }
                pending.amount += amount;
                pending.precision = pending.precision.max(precision);
                if pending.kind == SeekKind::None {
                    pending.precision = precision;
                }
                if pending.kind == SeekKind::Absolute {
                    return;
                }
                if pending.amount == 0.0 {
                    *pending = SeekRequest::default();
                    return;
                }
                pending.kind = SeekKind::Relative;
            }
            SeekKind::Absolute | SeekKind::Factor => {
                *pending = SeekRequest {
                    kind,
                    amount,
                    precision,
                    immediate,
                };
            }
            SeekKind::None => {
                *pending = SeekRequest::default();
            }
        }
    }

    /// Run the pending seek unless it is debounced. Returns `None` when
    /// nothing ran.
    pub fn execute_queued_seek(
        &mut self,
        env: &mut SeekEnv<'_>,
        video_status: StreamStatus,
    ) -> Option<Result<SeekOutcome, SeekError>> {
        if !self.pending.is_pending() {
            return None;
        }

        // A coarse seek cancels a running exact one right away
        if self.hrseek.active && self.pending.precision == SeekPrecision::Keyframe {
            self.start_timestamp = None;
        }

        if !self.pending.immediate && video_status < StreamStatus::Playing {
            if let Some(start) = self.start_timestamp {
                if env.now - start < env.opts.seek_debounce {
                    tracing::trace!("seek deferred");
                    return None;
                }
            }
        }

        let request = std::mem::take(&mut self.pending);
        Some(self.mp_seek(request, env))
    }

    /// Perform a seek now
    pub fn mp_seek(
        &mut self,
        request: SeekRequest,
        env: &mut SeekEnv<'_>,
    ) -> Result<SeekOutcome, SeekError> {
        let opts = env.opts;
        let demuxer = env.demuxer.as_mut().ok_or(SeekError::NoDemuxer)?;
        if !demuxer.seekable() {
            tracing::warn!("Cannot seek in this stream");
            return Err(SeekError::NotSeekable);
        }
        if request.kind == SeekKind::None {
            return Ok(SeekOutcome {
                target: None,
                hr_seek: false,
            });
        }

        let very_exact = request.precision == SeekPrecision::VeryExact;
        let mut hr_seek = opts.correct_pts
            && request.precision != SeekPrecision::Keyframe
            && ((opts.hr_seek == HrSeekMode::Absolute
                && request.kind == SeekKind::Absolute
                && request.precision == SeekPrecision::Default)
                || (opts.hr_seek == HrSeekMode::Always)
                || request.precision >= SeekPrecision::Exact);
        let offset = opts.hr_seek_offset(very_exact);

        let mut kind = request.kind;
        let mut amount = request.amount;
        let mut direction = 0.0;

        if kind == SeekKind::Factor && !demuxer.ts_resets_possible() {
            if let Some(len) = demuxer.duration() {
                amount = amount * len + demuxer.start_time();
                kind = SeekKind::Absolute;
            }
        }

        if kind == SeekKind::Relative && (!demuxer.supports_relative_seek() || hr_seek) {
            let current = env.current_time.unwrap_or_else(|| demuxer.start_time());
            direction = amount.signum();
            amount += current;
            kind = SeekKind::Absolute;
        } else if kind == SeekKind::Relative {
            direction = amount.signum();
        }
        hr_seek &= kind == SeekKind::Absolute;

        let mut flags = match kind {
            SeekKind::Absolute => SeekFlags::ABSOLUTE,
            SeekKind::Factor => SeekFlags::FACTOR,
            _ => SeekFlags::empty(),
        };
        if hr_seek || direction < 0.0 {
            flags |= SeekFlags::BACKWARD;
        } else if direction > 0.0 {
            flags |= SeekFlags::FORWARD;
        }
        if hr_seek {
            flags |= SeekFlags::HR;
        }

        let demux_target = if hr_seek { amount - offset } else { amount };
        tracing::info!(
            "Seeking to {:.3} ({:?}, {:?}{})",
            amount,
            kind,
            request.precision,
            if hr_seek { ", exact" } else { "" }
        );
        demuxer.seek(demux_target, flags);

        if !env.externals.is_empty() {
            let main_pos = if kind == SeekKind::Absolute && hr_seek {
                Some(demux_target)
            } else {
                demuxer.current_pts()
            };
            if let Some(main_pos) = main_pos {
                for track in env.externals.iter_mut() {
                    track.seek_to_main(main_pos);
                }
            }
        }

        let duration = demuxer.duration();
        env.history.mark_discontinuity();

        let target = (kind == SeekKind::Absolute).then_some(amount);
        self.last_seek_pts = target;
        self.hrseek = if hr_seek {
            HrSeekState {
                active: true,
                pts: amount,
                framedrop: !very_exact,
                last_frame: duration.is_some_and(|d| amount >= d),
            }
        } else {
            HrSeekState::default()
        };
        self.start_timestamp = Some(env.now);

        Ok(SeekOutcome { target, hr_seek })
    }

    /// Start a backward frame step unless one is running already
    pub fn arm_backstep(&mut self, generation: u64) -> bool {
        if self.backstep == BackstepState::Idle && !self.hrseek.active {
            self.backstep = BackstepState::Pending {
                start_gen: generation,
            };
            true
        } else {
            false
        }
    }

    /// Advance a pending backward step. `current` is the pts of the frame
    /// on screen. May run an index-building seek, whose outcome is
    /// returned for the caller to apply.
    pub fn handle_backstep(
        &mut self,
        env: &mut SeekEnv<'_>,
        current: Option<f64>,
    ) -> Result<Option<SeekOutcome>, SeekError> {
        let (start_gen, awaiting) = match self.backstep {
            BackstepState::Idle => return Ok(None),
            BackstepState::Pending { start_gen } => (start_gen, false),
            BackstepState::AwaitingIndex { start_gen } => (start_gen, true),
        };
        self.backstep = BackstepState::Idle;
        let Some(current) = current else {
            tracing::debug!("backstep dropped, no frame on screen");
            return Ok(None);
        };

        if let Some(prev) = env.history.find_previous(current) {
            tracing::debug!("backstep to {:.3}", prev);
            self.queue_seek(SeekKind::Absolute, prev, SeekPrecision::VeryExact, false);
            return Ok(None);
        }

        let indexed_past = env.history.last_frame().is_some_and(|last| last >= current);
        let index_done = awaiting && !self.hrseek.active;
        if (indexed_past && start_gen != env.history.generation()) || index_done {
            tracing::error!("Backstep failed");
            self.queue_seek(SeekKind::Absolute, current, SeekPrecision::VeryExact, false);
            return Err(SeekError::BackstepFailed);
        }

        if self.hrseek.active {
            self.backstep = if awaiting {
                BackstepState::AwaitingIndex { start_gen }
            } else {
                BackstepState::Pending { start_gen }
            };
            return Ok(None);
        }

        tracing::debug!("Start backstep indexing");
        let outcome = self.mp_seek(
            SeekRequest::absolute(current - 1.0, SeekPrecision::Default),
            env,
        )?;
        // Stay in hr-seek mode past the current frame so the history
        // covers it; the frame before it ends the step.
        if self.hrseek.active {
            self.hrseek.pts = current + 10.0;
            self.hrseek.framedrop = false;
            self.backstep = BackstepState::AwaitingIndex { start_gen };
        }
        Ok(Some(outcome))
    }

    /// Forget seek bookkeeping for a newly loaded item
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDemuxer;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type SeekLog = Arc<Mutex<Vec<(f64, SeekFlags)>>>;

    struct Fixture {
        opts: PlaybackOptions,
        demuxer: Option<Box<dyn Demuxer>>,
        externals: Vec<ExternalTrack>,
        history: PtsHistory,
        log: SeekLog,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_demuxer(SimDemuxer::new(100.0))
        }

        fn with_demuxer(demuxer: SimDemuxer) -> Self {
            let log = demuxer.seek_log();
            Self {
                opts: PlaybackOptions::default(),
                demuxer: Some(Box::new(demuxer)),
                externals: Vec::new(),
                history: PtsHistory::new(),
                log,
            }
        }

        fn env(&mut self, current_time: Option<f64>, now: f64) -> SeekEnv<'_> {
            SeekEnv {
                opts: &self.opts,
                demuxer: self.demuxer.as_mut(),
                externals: &mut self.externals,
                history: &mut self.history,
                current_time,
                now,
            }
        }

        fn seeks(&self) -> Vec<(f64, SeekFlags)> {
            self.log.lock().clone()
        }
    }

    #[test]
    fn test_relative_seeks_coalesce() {
        let mut s = SeekScheduler::new();
        s.queue_seek(SeekKind::Relative, 5.0, SeekPrecision::Keyframe, false);
        s.queue_seek(SeekKind::Relative, 3.0, SeekPrecision::Exact, false);
        s.queue_seek(SeekKind::Relative, -1.0, SeekPrecision::Default, true);

        let p = s.pending();
        assert_eq!(p.kind, SeekKind::Relative);
        assert_eq!(p.amount, 7.0);
        assert_eq!(p.precision, SeekPrecision::Exact);
        assert!(p.immediate);
    }

    #[test]
    fn test_absolute_supersedes_relative() {
        let mut s = SeekScheduler::new();
        s.queue_seek(SeekKind::Relative, 10.0, SeekPrecision::VeryExact, true);
        s.queue_seek(SeekKind::Absolute, 42.0, SeekPrecision::Keyframe, false);
        assert_eq!(
            *s.pending(),
            SeekRequest {
                kind: SeekKind::Absolute,
                amount: 42.0,
                precision: SeekPrecision::Keyframe,
                immediate: false,
            }
        );
    }

    #[test]
    fn test_relative_onto_absolute_and_factor() {
        let mut s = SeekScheduler::new();
        s.queue_seek(SeekKind::Absolute, 20.0, SeekPrecision::Default, false);
        s.queue_seek(SeekKind::Relative, 5.0, SeekPrecision::Exact, false);
        assert_eq!(s.pending().kind, SeekKind::Absolute);
        assert_eq!(s.pending().amount, 25.0);
        assert_eq!(s.pending().precision, SeekPrecision::Exact);

        s.queue_seek(SeekKind::Factor, 0.5, SeekPrecision::Default, false);
        s.queue_seek(SeekKind::Relative, 5.0, SeekPrecision::Default, true);
        assert_eq!(s.pending().kind, SeekKind::Factor);
        assert_eq!(s.pending().amount, 0.5);
        assert!(s.pending().immediate);
    }

    #[test]
    fn test_relative_cancelling_out_clears() {
        let mut s = SeekScheduler::new();
        s.queue_seek(SeekKind::Relative, 5.0, SeekPrecision::Default, false);
        s.queue_seek(SeekKind::Relative, -5.0, SeekPrecision::Default, false);
        assert!(!s.pending().is_pending());
    }

    #[test]
    fn test_absolute_default_is_exact() {
        let mut f = Fixture::new();
        let mut s = SeekScheduler::new();
        s.queue_seek(SeekKind::Absolute, 30.0, SeekPrecision::Default, false);

        let out = s
            .execute_queued_seek(&mut f.env(Some(0.0), 0.0), StreamStatus::Playing)
            .unwrap()
            .unwrap();
        assert!(out.hr_seek);
        assert_eq!(out.target, Some(30.0));
        assert!(s.hrseek().active);
        assert_eq!(s.hrseek().pts, 30.0);
        assert!(s.hrseek().framedrop);
        assert!(!s.pending().is_pending());

        let seeks = f.seeks();
        assert_eq!(seeks.len(), 1);
        assert_eq!(seeks[0].0, 30.0);
        assert_eq!(
            seeks[0].1,
            SeekFlags::ABSOLUTE | SeekFlags::BACKWARD | SeekFlags::HR
        );
    }

    #[test]
    fn test_relative_keyframe_seek() {
        let mut f = Fixture::new();
        let mut s = SeekScheduler::new();
        s.queue_seek(SeekKind::Relative, -10.0, SeekPrecision::Keyframe, false);

        let out = s
            .execute_queued_seek(&mut f.env(Some(50.0), 0.0), StreamStatus::Playing)
            .unwrap()
            .unwrap();
        assert!(!out.hr_seek);
        assert_eq!(out.target, Some(40.0));
        assert!(!s.hrseek().active);
        assert_eq!(f.seeks()[0], (40.0, SeekFlags::ABSOLUTE | SeekFlags::BACKWARD));
    }

    #[test]
    fn test_native_relative_seek() {
        let mut f = Fixture::with_demuxer(SimDemuxer::new(100.0).with_relative_seek());
        let mut s = SeekScheduler::new();
        s.queue_seek(SeekKind::Relative, 10.0, SeekPrecision::Default, false);

        let out = s
            .execute_queued_seek(&mut f.env(Some(50.0), 0.0), StreamStatus::Playing)
            .unwrap()
            .unwrap();
        assert_eq!(out.target, None);
        assert_eq!(f.seeks()[0], (10.0, SeekFlags::FORWARD));
    }

    #[test]
    fn test_very_exact_offset_and_factor() {
        let mut f = Fixture::new();
        f.opts.hr_seek_demuxer_offset = 0.1;
        let mut s = SeekScheduler::new();

        s.mp_seek(
            SeekRequest::absolute(10.0, SeekPrecision::VeryExact),
            &mut f.env(None, 0.0),
        )
        .unwrap();
        assert_eq!(f.seeks()[0].0, 9.5);
        assert!(!s.hrseek().framedrop);

        s.mp_seek(
            SeekRequest {
                kind: SeekKind::Factor,
                amount: 0.25,
                precision: SeekPrecision::Exact,
                immediate: false,
            },
            &mut f.env(None, 0.0),
        )
        .unwrap();
        let (target, flags) = f.seeks()[1];
        assert!((target - 24.9).abs() < 1e-9);
        assert!(flags.contains(SeekFlags::ABSOLUTE | SeekFlags::HR));
    }

    #[test]
    fn test_never_mode_needs_explicit_precision() {
        let mut f = Fixture::new();
        f.opts.hr_seek = HrSeekMode::Never;
        let mut s = SeekScheduler::new();

        let out = s
            .mp_seek(SeekRequest::absolute(10.0, SeekPrecision::Default), &mut f.env(None, 0.0))
            .unwrap();
        assert!(!out.hr_seek);

        let out = s
            .mp_seek(SeekRequest::absolute(10.0, SeekPrecision::Exact), &mut f.env(None, 0.0))
            .unwrap();
        assert!(out.hr_seek);
    }

    #[test]
    fn test_unseekable_fails_without_mutation() {
        let mut f = Fixture::with_demuxer(SimDemuxer::new(100.0).unseekable());
        let mut s = SeekScheduler::new();
        let gen = f.history.generation();

        let err = s
            .mp_seek(SeekRequest::absolute(10.0, SeekPrecision::Default), &mut f.env(None, 0.0))
            .unwrap_err();
        assert_eq!(err, SeekError::NotSeekable);
        assert!(f.seeks().is_empty());
        assert_eq!(f.history.generation(), gen);
        assert!(!s.hrseek().active);

        f.demuxer = None;
        let err = s
            .mp_seek(SeekRequest::absolute(10.0, SeekPrecision::Default), &mut f.env(None, 0.0))
            .unwrap_err();
        assert_eq!(err, SeekError::NoDemuxer);
    }

    #[test]
    fn test_debounce_holds_repeated_seeks() {
        let mut f = Fixture::new();
        let mut s = SeekScheduler::new();

        s.queue_seek(SeekKind::Relative, 5.0, SeekPrecision::Default, false);
        assert!(s.execute_queued_seek(&mut f.env(Some(0.0), 10.0), StreamStatus::Playing).is_some());

        // No frame shown yet since that seek
        s.queue_seek(SeekKind::Relative, 5.0, SeekPrecision::Default, false);
        assert!(s.execute_queued_seek(&mut f.env(Some(5.0), 10.1), StreamStatus::Syncing).is_none());
        assert!(s.pending().is_pending());

        assert!(s.execute_queued_seek(&mut f.env(Some(5.0), 10.4), StreamStatus::Syncing).is_some());
        assert_eq!(f.seeks().len(), 2);
    }

    #[test]
    fn test_immediate_and_keyframe_skip_debounce() {
        let mut f = Fixture::new();
        let mut s = SeekScheduler::new();

        s.queue_seek(SeekKind::Absolute, 5.0, SeekPrecision::Default, false);
        s.execute_queued_seek(&mut f.env(None, 1.0), StreamStatus::Playing);

        s.queue_seek(SeekKind::Absolute, 8.0, SeekPrecision::Default, true);
        assert!(s.execute_queued_seek(&mut f.env(None, 1.05), StreamStatus::Syncing).is_some());

        // hr-seek running; a keyframe seek cancels it without waiting
        assert!(s.hrseek().active);
        s.queue_seek(SeekKind::Absolute, 60.0, SeekPrecision::Keyframe, false);
        assert!(s.execute_queued_seek(&mut f.env(None, 1.1), StreamStatus::Syncing).is_some());
        assert!(!s.hrseek().active);
        assert_eq!(f.seeks().len(), 3);
    }

    #[test]
    fn test_external_tracks_follow() {
        let mut f = Fixture::new();
        let ext = SimDemuxer::new(100.0);
        let ext_log = ext.seek_log();
        f.externals.push(ExternalTrack::new("dub", Box::new(ext), 1.5));

        let mut s = SeekScheduler::new();
        s.mp_seek(SeekRequest::absolute(20.0, SeekPrecision::Default), &mut f.env(None, 0.0))
            .unwrap();
        assert_eq!(ext_log.lock()[0], (18.5, SeekFlags::ABSOLUTE));
    }

    #[test]
    fn test_last_frame_flag() {
        let mut f = Fixture::new();
        let mut s = SeekScheduler::new();
        s.mp_seek(SeekRequest::absolute(100.0, SeekPrecision::Exact), &mut f.env(None, 0.0))
            .unwrap();
        assert!(s.hrseek().last_frame);
    }

    #[test]
    fn test_backstep_uses_history() {
        let mut f = Fixture::new();
        for pts in [4.0, 4.04, 4.08] {
            f.history.add(Some(pts), false);
        }
        let mut s = SeekScheduler::new();
        assert!(s.arm_backstep(f.history.generation()));

        let out = s.handle_backstep(&mut f.env(None, 0.0), Some(4.08)).unwrap();
        assert!(out.is_none());
        assert_eq!(s.pending().kind, SeekKind::Absolute);
        assert_eq!(s.pending().amount, 4.04);
        assert_eq!(s.pending().precision, SeekPrecision::VeryExact);
        assert_eq!(s.backstep(), BackstepState::Idle);
    }

    #[test]
    fn test_backstep_without_frame_on_screen() {
        let mut f = Fixture::new();
        let mut s = SeekScheduler::new();
        assert!(s.arm_backstep(f.history.generation()));

        let out = s.handle_backstep(&mut f.env(Some(3.0), 0.0), None).unwrap();
        assert!(out.is_none());
        assert_eq!(s.backstep(), BackstepState::Idle);
        assert!(!s.pending().is_pending());
        assert!(f.seeks().is_empty());
    }

    #[test]
    fn test_backstep_builds_index_then_finds_frame() {
        let mut f = Fixture::new();
        f.history.add(Some(10.0), false);
        let mut s = SeekScheduler::new();
        s.arm_backstep(f.history.generation());

        let out = s.handle_backstep(&mut f.env(None, 0.0), Some(10.0)).unwrap();
        assert_eq!(out.map(|o| o.target), Some(Some(9.0)));
        assert!(s.hrseek().active);
        assert_eq!(s.hrseek().pts, 20.0);
        assert!(!s.hrseek().framedrop);
        assert!(matches!(s.backstep(), BackstepState::AwaitingIndex { .. }));

        // Still decoding towards the current frame
        f.history.add(Some(9.0), false);
        assert!(s.handle_backstep(&mut f.env(None, 0.1), Some(10.0)).unwrap().is_none());
        assert!(matches!(s.backstep(), BackstepState::AwaitingIndex { .. }));

        f.history.add(Some(9.96), false);
        f.history.add(Some(10.0), false);
        s.handle_backstep(&mut f.env(None, 0.2), Some(10.0)).unwrap();
        assert_eq!(s.pending().amount, 9.96);
        assert_eq!(s.backstep(), BackstepState::Idle);
    }

    #[test]
    fn test_backstep_fails_after_index_attempt() {
        let mut f = Fixture::new();
        f.history.add(Some(10.0), false);
        let mut s = SeekScheduler::new();
        s.arm_backstep(f.history.generation());
        s.handle_backstep(&mut f.env(None, 0.0), Some(10.0)).unwrap();

        // The index seek only produced frames at or after the current one,
        // each breaking continuity
        f.history.add(Some(10.0), true);
        f.history.add(Some(10.5), false);
        let err = s.handle_backstep(&mut f.env(None, 0.1), Some(10.0)).unwrap_err();
        assert_eq!(err, SeekError::BackstepFailed);
        assert_eq!(s.pending().amount, 10.0);
        assert_eq!(s.backstep(), BackstepState::Idle);
    }

    #[test]
    fn test_backstep_not_armed_during_hrseek() {
        let mut f = Fixture::new();
        let mut s = SeekScheduler::new();
        s.mp_seek(SeekRequest::absolute(5.0, SeekPrecision::Exact), &mut f.env(None, 0.0))
            .unwrap();
        assert!(!s.arm_backstep(f.history.generation()));
    }
}
