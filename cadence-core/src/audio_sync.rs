//! # Audio Fill and Drift Correction
//!
//! Runs once per tick and moves decoded audio into the sink:
//!
//! 1. reopen the sink after a device change
//! 2. (re)build the decoder -> sink chain when the format is unknown
//! 3. size the write from free sink space and any pending resync
//! 4. display-sync drop/duplicate corrections
//! 5. decode up to the target size
//! 6. after a seek, skip or pad audio so it starts at the sync point
//! 7. hold in READY until video is ready too, then write to the sink
//!
//! Timestamps are `Option<f64>` seconds; `None` is "unknown" and stops any
//! arithmetic that would depend on it.

use crate::audio::{AudioFormat, AudioSink, PlayFlags, SinkError};
use crate::audio_buffer::AudioBuffer;
use crate::decode::{AudioDecoder, DecodeError, DecodeStatus};
use crate::options::{PlaybackOptions, VideoSyncMode};
use crate::sync::{Readiness, StreamKind, StreamStatus};

/// Minimum frames read ahead while looking for a forward sync point
const SYNC_READ_AHEAD: usize = 2500;

/// Where audio has to start after a seek or reinit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncTarget {
    /// Not known yet (video still syncing)
    Wait,
    Pts(f64),
    /// Play from wherever the decoder is
    Disabled,
}

/// Per-tick inputs owned by the engine
pub struct FillContext<'a> {
    pub opts: &'a PlaybackOptions,
    pub readiness: &'a mut Readiness,
    pub sync_target: SyncTarget,
    pub paused: bool,
    /// Stop output at this pts
    pub end_pts: Option<f64>,
    /// Audio minus video position, corrected by display-sync drops
    pub av_difference: &'a mut f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Nothing to do until the decoder or the other stream moves
    Idle,
    /// Made progress; run again without sleeping
    Retry,
    /// Chain rebuilt for a new format
    Reconfigured,
    /// Resync finished: frames skipped (positive) or silence prepended
    /// (negative)
    Resynced(i64),
    /// Frames accepted by the sink
    Played(usize),
    /// Too many decode errors; the track is gone
    Failed,
}

enum SyncDecision {
    Wait,
    Skip(i64),
    Abandon,
    Disabled,
}

/// Frames to drop (positive) or pad (negative) so that audio written at
/// `written_pts` lines up with `sync_pts`. `None` when the distance is not
/// plausible.
pub fn resync_frames(
    written_pts: f64,
    sync_pts: f64,
    format: &AudioFormat,
    speed: f64,
    abandon_threshold: f64,
) -> Option<i64> {
    let diff = sync_pts - written_pts;
    if !diff.is_finite() || diff.abs() > abandon_threshold {
        return None;
    }
    let frames = (diff * f64::from(format.sample_rate) / speed) as i64;
    Some(format.align_signed(frames))
}

pub struct AudioChain {
    decoder: Box<dyn AudioDecoder>,
    sink: Box<dyn AudioSink>,
    buffer: AudioBuffer,
    /// Negotiated format; `None` until the chain is built
    format: Option<AudioFormat>,
    /// Passthrough was refused and the chain fell back to PCM
    passthrough_failed: bool,
    decode_errors: u32,
    /// Display-sync budget; corrections only while below 1.0
    drop_throttle: f64,
    /// Seconds written to the sink, for statistics
    played_seconds: f64,
}

impl AudioChain {
    pub fn new(decoder: Box<dyn AudioDecoder>, sink: Box<dyn AudioSink>) -> Self {
        Self {
            decoder,
            sink,
            buffer: AudioBuffer::new(2),
            format: None,
            passthrough_failed: false,
            decode_errors: 0,
            drop_throttle: 0.0,
            played_seconds: 0.0,
        }
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.frames()
    }

    pub fn played_seconds(&self) -> f64 {
        self.played_seconds
    }

    pub fn sink_delay(&self) -> f64 {
        self.sink.delay()
    }

    /// Pts right after the last frame written to the sink
    pub fn written_pts(&self, speed: f64) -> Option<f64> {
        let format = self.format?;
        let rate = f64::from(format.sample_rate);
        let pts = self.decoder.pts()?;
        let decoded_end = pts + self.decoder.pts_offset() as f64 / rate;
        let buffered = self.buffer.seconds(format.sample_rate) + self.decoder.filter_delay();
        Some(decoded_end - buffered * speed)
    }

    /// Pts currently audible
    pub fn playing_pts(&self, speed: f64) -> Option<f64> {
        Some(self.written_pts(speed)? - self.sink.delay() * speed)
    }

    /// Drop everything queued (seek)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.decoder.reset();
        self.sink.reset();
        self.drop_throttle = 0.0;
        self.decode_errors = 0;
    }

    pub fn pause(&mut self) {
        self.sink.pause();
    }

    pub fn resume(&mut self) {
        self.sink.resume();
    }

    /// Shut the device down, letting queued audio finish first if asked
    pub fn close(&mut self, drain: bool) {
        if drain {
            self.sink.drain();
        }
        self.sink.close();
        self.format = None;
    }

    pub fn fill(&mut self, ctx: FillContext<'_>) -> FillOutcome {
        let opts = ctx.opts;

        if self.sink.take_reload_request() {
            tracing::info!("Audio device changed, reopening");
            self.sink.reset();
            self.sink.close();
            self.format = None;
            if self.passthrough_failed {
                self.passthrough_failed = false;
                self.decoder.set_passthrough(true);
            }
        }

        let format = match self.format {
            Some(format) => format,
            None => return self.reinit(opts, ctx.readiness),
        };

        if ctx.readiness.audio() == StreamStatus::Eof {
            return FillOutcome::Idle;
        }

        let speed = opts.playback_speed;
        let play_rate = f64::from(format.sample_rate) / speed;
        let mut playsize = self.sink.space();

        // Resync point, only looked at right after a reset
        let mut skip: i64 = 0;
        let mut sync_known = true;
        if ctx.readiness.audio() == StreamStatus::Syncing {
            match self.sync_decision(ctx.sync_target, opts, &format) {
                SyncDecision::Wait => sync_known = false,
                SyncDecision::Skip(n) => skip = n,
                SyncDecision::Abandon => {
                    tracing::warn!("Failed audio resync");
                    ctx.readiness.set(StreamKind::Audio, StreamStatus::Filling);
                }
                SyncDecision::Disabled => {
                    ctx.readiness.set(StreamKind::Audio, StreamStatus::Filling);
                }
            }
        }
        if skip > 0 {
            playsize = (skip as usize + 1).min(playsize.max(SYNC_READ_AHEAD));
        } else if skip < 0 {
            playsize = (playsize as i64 + skip).max(1) as usize;
        }

        // Display-sync correction
        let mut skip_duplicate: i64 = 0;
        if opts.video_sync == VideoSyncMode::DisplayAudioDrop
            && ctx.readiness.audio() == StreamStatus::Playing
            && ctx.av_difference.abs() >= opts.sync_audio_drop_size
            && self.drop_throttle < 1.0
        {
            let n = format
                .align_signed((opts.sync_audio_drop_size * play_rate).round() as i64)
                .max(format.align.max(1) as i64);
            // Audio ahead: duplicate to hold it back; behind: drop
            skip_duplicate = if *ctx.av_difference >= 0.0 { -n } else { n };
            playsize = playsize.max(n as usize);
            self.drop_throttle += (n as f64 / play_rate) / opts.drop_limit().max(f64::EPSILON);
        }

        let mut status = DecodeStatus::Ok;
        if playsize > self.buffer.frames() {
            match self.decoder.decode(&mut self.buffer, playsize) {
                Ok(DecodeStatus::Wait) => return FillOutcome::Idle,
                Ok(DecodeStatus::NewFormat) => {
                    tracing::info!("Audio format changed, rebuilding chain");
                    if !opts.gapless_audio {
                        self.sink.drain();
                        self.sink.close();
                    }
                    self.format = None;
                    return FillOutcome::Retry;
                }
                Ok(s) => {
                    self.decode_errors = 0;
                    status = s;
                }
                Err(e) => return self.decode_failed(e, opts),
            }
        }

        // New data after end of input (e.g. looping): start over
        if status == DecodeStatus::Ok
            && ctx.readiness.audio() >= StreamStatus::Draining
            && !self.buffer.is_empty()
        {
            ctx.readiness.set(StreamKind::Audio, StreamStatus::Syncing);
            return FillOutcome::Retry;
        }

        if ctx.readiness.audio() == StreamStatus::Syncing {
            if !sync_known {
                return FillOutcome::Retry;
            }
            let mut end_sync = false;
            if skip >= 0 {
                let max = self.buffer.frames();
                self.buffer.skip((skip as usize).min(max));
                end_sync = (skip as usize) < max;
            } else {
                let pad = skip.unsigned_abs() as usize;
                if pad > playsize {
                    tracing::warn!("Audio starts {:.3}s late, dropping it", pad as f64 / play_rate);
                    self.sink.reset();
                    ctx.readiness.set(StreamKind::Audio, StreamStatus::Draining);
                    return FillOutcome::Idle;
                }
                self.buffer.prepend_silence(pad);
                end_sync = true;
            }

            if end_sync {
                tracing::debug!("audio resync: {} frames", skip);
                ctx.readiness.set(StreamKind::Audio, StreamStatus::Filling);
                return FillOutcome::Resynced(skip);
            }
            if status != DecodeStatus::Ok && self.buffer.is_empty() {
                ctx.readiness.set(StreamKind::Audio, StreamStatus::Eof);
                return FillOutcome::Idle;
            }
            return FillOutcome::Retry;
        }

        if ctx.readiness.audio() == StreamStatus::Filling {
            if self.buffer.frames() >= playsize || status != DecodeStatus::Ok {
                ctx.readiness.set(StreamKind::Audio, StreamStatus::Ready);
            }
            return FillOutcome::Idle;
        }
        if ctx.readiness.audio() == StreamStatus::Ready {
            // Held until the restart check lets both streams go
            return FillOutcome::Idle;
        }

        if skip_duplicate != 0 {
            let max = self.buffer.frames() as i64;
            let n = skip_duplicate.clamp(-max, max);
            *ctx.av_difference += n as f64 / play_rate;
            if n > 0 {
                self.buffer.skip(n as usize);
                tracing::trace!("dropped {} audio frames", n);
            } else if n < 0 {
                self.buffer.duplicate(n.unsigned_abs() as usize);
                tracing::trace!("duplicated {} audio frames", -n);
            }
        }

        let mut audio_eof = status == DecodeStatus::Eof;
        let mut partial_fill = false;

        if let (Some(end), Some(written)) = (ctx.end_pts, self.written_pts(speed)) {
            let frames = (end - written - opts.audio_delay) * play_rate;
            if playsize as f64 > frames {
                playsize = format.align_down(frames.max(0.0) as usize);
                audio_eof = true;
                partial_fill = true;
            }
        }

        if playsize > self.buffer.frames() {
            playsize = self.buffer.frames();
            partial_fill = true;
        }
        audio_eof &= partial_fill;

        let mut flags = PlayFlags::empty();
        if audio_eof && !opts.gapless_audio {
            flags |= PlayFlags::FINAL_CHUNK;
        }
        if ctx.paused {
            playsize = 0;
        }

        let mut frames = playsize;
        if audio_eof || frames >= format.align {
            frames = format.align_down(frames);
        }
        let played = if frames > 0 {
            let samples = self.buffer.peek(frames);
            self.sink.play(samples, flags).min(frames)
        } else {
            0
        };
        self.buffer.skip(played);
        self.played_seconds += played as f64 / f64::from(format.sample_rate);
        self.drop_throttle = (self.drop_throttle - played as f64 / play_rate).max(0.0);

        if audio_eof && playsize == 0 {
            ctx.readiness.set(StreamKind::Audio, StreamStatus::Draining);
            // Gapless: the device keeps playing into the next file
            if self.sink.eof_reached() || opts.gapless_audio {
                ctx.readiness.set(StreamKind::Audio, StreamStatus::Eof);
                tracing::debug!("audio EOF reached");
            }
        }

        FillOutcome::Played(played)
    }

    fn sync_decision(
        &self,
        target: SyncTarget,
        opts: &PlaybackOptions,
        format: &AudioFormat,
    ) -> SyncDecision {
        let sync_pts = match target {
            SyncTarget::Wait => return SyncDecision::Wait,
            SyncTarget::Disabled => return SyncDecision::Disabled,
            SyncTarget::Pts(pts) => pts,
        };
        let written = match self.written_pts(opts.playback_speed) {
            Some(pts) => pts,
            // Nothing decoded yet
            None if self.buffer.is_empty() => return SyncDecision::Wait,
            None => return SyncDecision::Abandon,
        };
        match resync_frames(
            written,
            sync_pts,
            format,
            opts.playback_speed,
            opts.resync_abandon_threshold,
        ) {
            Some(frames) => SyncDecision::Skip(frames),
            None => SyncDecision::Abandon,
        }
    }

    fn reinit(&mut self, opts: &PlaybackOptions, readiness: &mut Readiness) -> FillOutcome {
        let probed = match self.decoder.probe() {
            Ok(Some(format)) => format,
            Ok(None) => return FillOutcome::Idle,
            Err(e) => return self.decode_failed(e, opts),
        };

        let reuse = opts.gapless_audio && self.sink.format() == Some(probed);
        let format = if reuse {
            probed
        } else {
            self.sink.close();
            match self.sink.open(&probed) {
                Ok(format) => format,
                Err(SinkError::PassthroughRejected) if probed.passthrough => {
                    tracing::warn!("Passthrough rejected by the device, decoding to PCM");
                    self.passthrough_failed = true;
                    self.decoder.set_passthrough(false);
                    return FillOutcome::Retry;
                }
                Err(e) => {
                    tracing::error!("Could not open audio output: {}", e);
                    return FillOutcome::Failed;
                }
            }
        };

        if self.buffer.channels() != format.channels {
            self.buffer.reconfigure(format.channels);
        }
        tracing::info!(
            "Audio: {} Hz, {} ch{}",
            format.sample_rate,
            format.channels,
            if format.passthrough { " (passthrough)" } else { "" }
        );
        self.format = Some(format);
        self.decode_errors = 0;
        readiness.set(StreamKind::Audio, StreamStatus::Syncing);
        FillOutcome::Reconfigured
    }

    fn decode_failed(&mut self, err: DecodeError, opts: &PlaybackOptions) -> FillOutcome {
        self.decode_errors += 1;
        if self.decode_errors >= opts.decode_error_budget {
            tracing::error!(
                "Audio track failed after {} decode errors: {}",
                self.decode_errors,
                err
            );
            return FillOutcome::Failed;
        }
        tracing::warn!("Audio decode error: {}", err);
        FillOutcome::Retry
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAudioDecoder, SimSink, SimSinkHandle};

    const RATE: u32 = 48000;

    fn chain(decoder: SimAudioDecoder, space: usize) -> (AudioChain, SimSinkHandle) {
        let sink = SimSink::new(space);
        let handle = sink.handle();
        (AudioChain::new(Box::new(decoder), Box::new(sink)), handle)
    }

    fn blocks(pts: &[f64]) -> SimAudioDecoder {
        SimAudioDecoder::from_blocks(AudioFormat::pcm(RATE, 2), RATE as usize, pts)
    }

    struct Tick {
        opts: PlaybackOptions,
        readiness: Readiness,
        target: SyncTarget,
        paused: bool,
        end_pts: Option<f64>,
        av_difference: f64,
    }

    impl Tick {
        fn new(target: SyncTarget) -> Self {
            let mut readiness = Readiness::new();
            readiness.reset(true, false);
            Self {
                opts: PlaybackOptions::default(),
                readiness,
                target,
                paused: false,
                end_pts: None,
                av_difference: 0.0,
            }
        }

        fn fill(&mut self, chain: &mut AudioChain) -> FillOutcome {
            chain.fill(FillContext {
                opts: &self.opts,
                readiness: &mut self.readiness,
                sync_target: self.target,
                paused: self.paused,
                end_pts: self.end_pts,
                av_difference: &mut self.av_difference,
            })
        }

        /// Fill until audio waits at READY, then let it play
        fn start(&mut self, chain: &mut AudioChain) {
            for _ in 0..10 {
                self.fill(chain);
                if self.readiness.audio() == StreamStatus::Ready {
                    break;
                }
            }
            assert_eq!(self.readiness.audio(), StreamStatus::Ready);
            self.readiness.check_restart(false).unwrap();
            assert_eq!(self.readiness.audio(), StreamStatus::Playing);
        }
    }

    #[test]
    fn test_resync_sign_and_magnitude() {
        let fmt = AudioFormat::pcm(RATE, 2);
        // Written audio behind the target: drop forward
        assert_eq!(resync_frames(0.0, 0.5, &fmt, 1.0, 3600.0), Some(24000));
        // Written audio past the target: pad with silence
        assert_eq!(resync_frames(1.25, 1.0, &fmt, 1.0, 3600.0), Some(-12000));
        // Speed scales the distance
        assert_eq!(resync_frames(0.0, 1.0, &fmt, 2.0, 3600.0), Some(24000));

        let aligned = AudioFormat { align: 1536, ..fmt };
        let n = resync_frames(0.0, 0.5, &aligned, 1.0, 3600.0).unwrap();
        assert_eq!(n % 1536, 0);
        assert!(24000 - n < 1536 && n <= 24000);
    }

    #[test]
    fn test_resync_abandon() {
        let fmt = AudioFormat::pcm(RATE, 2);
        assert_eq!(resync_frames(0.0, 3601.0, &fmt, 1.0, 3600.0), None);
        assert_eq!(resync_frames(f64::NAN, 1.0, &fmt, 1.0, 3600.0), None);
    }

    #[test]
    fn test_seek_scenario_skips_half_a_second() {
        let (mut chain, _sink) = chain(blocks(&[0.0, 1.0, 2.0]), 4800);
        let mut tick = Tick::new(SyncTarget::Pts(0.5));

        assert_eq!(tick.fill(&mut chain), FillOutcome::Reconfigured);
        assert_eq!(tick.readiness.audio(), StreamStatus::Syncing);

        // Nothing decoded yet: read first, sync next tick
        assert_eq!(tick.fill(&mut chain), FillOutcome::Retry);
        assert_eq!(tick.readiness.audio(), StreamStatus::Syncing);
        assert_eq!(chain.written_pts(1.0), Some(0.0));

        assert_eq!(tick.fill(&mut chain), FillOutcome::Resynced(24000));
        assert_eq!(tick.readiness.audio(), StreamStatus::Filling);
        assert_eq!(chain.buffered_frames(), 24000);
        assert_eq!(chain.written_pts(1.0), Some(0.5));
    }

    #[test]
    fn test_late_audio_gets_silence() {
        let (mut chain, _sink) = chain(blocks(&[2.0, 3.0]), 48000);
        let mut tick = Tick::new(SyncTarget::Pts(1.9));
        tick.fill(&mut chain);
        tick.fill(&mut chain);

        assert_eq!(tick.fill(&mut chain), FillOutcome::Resynced(-4800));
        assert_eq!(chain.buffered_frames(), 48000 + 4800);
        assert!((chain.written_pts(1.0).unwrap() - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_unplausible_target_abandons_resync() {
        let (mut chain, _sink) = chain(blocks(&[0.0, 1.0]), 4800);
        let mut tick = Tick::new(SyncTarget::Pts(7200.0));
        tick.fill(&mut chain);
        tick.fill(&mut chain);
        tick.fill(&mut chain);
        assert_eq!(tick.readiness.audio(), StreamStatus::Ready);
        assert_eq!(chain.written_pts(1.0), Some(0.0));
    }

    #[test]
    fn test_waits_for_video_target() {
        let (mut chain, _sink) = chain(blocks(&[0.0, 1.0]), 4800);
        let mut tick = Tick::new(SyncTarget::Wait);
        tick.fill(&mut chain);
        for _ in 0..3 {
            tick.fill(&mut chain);
            assert_eq!(tick.readiness.audio(), StreamStatus::Syncing);
        }
        tick.target = SyncTarget::Pts(0.25);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Resynced(12000));
    }

    #[test]
    fn test_plays_after_restart_only() {
        let (mut chain, sink) = chain(blocks(&[0.0, 1.0, 2.0]), 4800);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.start(&mut chain);
        assert_eq!(sink.queued(), 0);

        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(4800));
        assert_eq!(sink.queued(), 4800);
        assert!(chain.playing_pts(1.0).unwrap().abs() < 1e-9);
        assert!((chain.written_pts(1.0).unwrap() - 0.1).abs() < 1e-9);

        // Full sink: nothing more goes in
        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(0));
        sink.consume(2400);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(2400));
    }

    #[test]
    fn test_paused_writes_nothing() {
        let (mut chain, sink) = chain(blocks(&[0.0, 1.0]), 4800);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.start(&mut chain);
        tick.paused = true;
        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(0));
        assert_eq!(sink.queued(), 0);
    }

    #[test]
    fn test_drains_to_eof() {
        let (mut chain, sink) = chain(blocks(&[0.0]), 96000);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.start(&mut chain);

        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(48000));
        assert_eq!(sink.final_chunks(), 1);
        assert_eq!(tick.readiness.audio(), StreamStatus::Playing);

        tick.fill(&mut chain);
        assert_eq!(tick.readiness.audio(), StreamStatus::Draining);

        sink.consume(48000);
        tick.fill(&mut chain);
        assert_eq!(tick.readiness.audio(), StreamStatus::Eof);
    }

    #[test]
    fn test_gapless_skips_physical_drain() {
        let (mut chain, sink) = chain(blocks(&[0.0]), 96000);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.opts.gapless_audio = true;
        tick.start(&mut chain);
        tick.fill(&mut chain);
        assert_eq!(sink.final_chunks(), 0);
        tick.fill(&mut chain);
        assert_eq!(tick.readiness.audio(), StreamStatus::Eof);
        assert!(sink.queued() > 0);
    }

    #[test]
    fn test_end_pts_truncates() {
        let (mut chain, sink) = chain(blocks(&[0.0, 1.0]), 96000);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.end_pts = Some(0.75);
        tick.start(&mut chain);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(36000));
        assert_eq!(sink.final_chunks(), 1);
        tick.fill(&mut chain);
        assert_eq!(tick.readiness.audio(), StreamStatus::Draining);
    }

    #[test]
    fn test_display_sync_drop_and_duplicate() {
        let (mut chain, _sink) = chain(blocks(&[0.0, 1.0, 2.0]), 960);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.opts.video_sync = VideoSyncMode::DisplayAudioDrop;
        tick.start(&mut chain);
        let before = chain.buffered_frames();

        // Audio behind video: drop one granule (20 ms)
        tick.av_difference = -0.05;
        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(960));
        assert_eq!(before - chain.buffered_frames(), 960 + 960);
        assert!((tick.av_difference - (-0.03)).abs() < 1e-9);

        // Budget used up: no further corrections until enough was played
        tick.av_difference = 0.05;
        let before = chain.buffered_frames();
        tick.fill(&mut chain);
        assert_eq!(before - chain.buffered_frames(), 0);
        assert_eq!(tick.av_difference, 0.05);
    }

    #[test]
    fn test_duplicate_when_audio_ahead() {
        let (mut chain, _sink) = chain(blocks(&[0.0, 1.0, 2.0]), 960);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.opts.video_sync = VideoSyncMode::DisplayAudioDrop;
        tick.start(&mut chain);
        let before = chain.buffered_frames();

        tick.av_difference = 0.05;
        tick.fill(&mut chain);
        // 960 duplicated, 960 played
        assert_eq!(chain.buffered_frames(), before);
        assert!((tick.av_difference - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_decode_error_budget() {
        let decoder = blocks(&[0.0]).with_errors(3);
        let (mut chain, _sink) = chain(decoder, 4800);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.opts.decode_error_budget = 3;
        assert_eq!(tick.fill(&mut chain), FillOutcome::Reconfigured);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Retry);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Retry);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Failed);
    }

    #[test]
    fn test_probe_wait_defers() {
        let decoder = blocks(&[0.0]).with_probe_waits(2);
        let (mut chain, _sink) = chain(decoder, 4800);
        let mut tick = Tick::new(SyncTarget::Disabled);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Idle);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Idle);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Reconfigured);
        assert_eq!(chain.format(), Some(AudioFormat::pcm(RATE, 2)));
    }

    #[test]
    fn test_passthrough_fallback_and_retry_on_reload() {
        let spdif = AudioFormat {
            passthrough: true,
            ..AudioFormat::pcm(RATE, 2)
        };
        let decoder = blocks(&[0.0, 1.0]).with_passthrough(spdif);
        let sink = SimSink::new(4800).rejecting_passthrough();
        let handle = sink.handle();
        let mut chain = AudioChain::new(Box::new(decoder), Box::new(sink));
        let mut tick = Tick::new(SyncTarget::Disabled);

        assert_eq!(tick.fill(&mut chain), FillOutcome::Retry);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Reconfigured);
        assert!(!chain.format().unwrap().passthrough);

        // Device changed: passthrough gets another chance
        handle.accept_passthrough();
        handle.request_reload();
        assert_eq!(tick.fill(&mut chain), FillOutcome::Reconfigured);
        assert!(chain.format().unwrap().passthrough);
    }

    #[test]
    fn test_new_format_rebuilds_chain() {
        let decoder = blocks(&[0.0, 1.0]).with_format_change(1, AudioFormat::pcm(44100, 6));
        let (mut chain, sink) = chain(decoder, 48000);
        let mut tick = Tick::new(SyncTarget::Disabled);
        tick.start(&mut chain);

        assert_eq!(tick.fill(&mut chain), FillOutcome::Played(48000));
        sink.consume(48000);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Retry);
        assert_eq!(chain.format(), None);
        assert_eq!(tick.fill(&mut chain), FillOutcome::Reconfigured);
        assert_eq!(chain.format(), Some(AudioFormat::pcm(44100, 6)));
        assert_eq!(sink.opens(), 2);
        assert_eq!(tick.readiness.audio(), StreamStatus::Syncing);
    }
}
