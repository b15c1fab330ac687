//! # Simulated Media
//!
//! Stand-ins for the demuxer, decoders and the audio device. The demuxer
//! owns a timeline; decoders created from it restart at the demuxer
//! position after every seek, the way real decoders follow their packet
//! source. The sink drains in real time against any [`TimeSource`].
//!
//! Used by the tests and by the headless player.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::audio::{AudioFormat, AudioSink, PlayFlags, SinkError};
use crate::audio_buffer::AudioBuffer;
use crate::decode::{AudioDecoder, DecodeError, DecodeStatus};
use crate::demuxer::{Demuxer, ReaderState, SeekFlags};
use crate::time::TimeSource;
use crate::video::{VideoPoll, VideoSource};

/// Keyframe spacing of the simulated stream (seconds)
pub const KEYFRAME_INTERVAL: f64 = 1.0;

/// Frames the simulated video decoder runs ahead
const DECODE_AHEAD: usize = 4;

pub type SeekLog = Arc<Mutex<Vec<(f64, SeekFlags)>>>;

#[derive(Debug)]
struct Timeline {
    position: f64,
    /// Bumped by every seek
    generation: u64,
}

/// A decoder's view of the demuxer timeline
struct Link {
    timeline: Arc<Mutex<Timeline>>,
    seen: Option<u64>,
    duration: f64,
}

impl Link {
    /// New start position when the demuxer moved since the last call
    fn restart(&mut self) -> Option<f64> {
        let timeline = self.timeline.lock();
        if self.seen == Some(timeline.generation) {
            return None;
        }
        self.seen = Some(timeline.generation);
        Some(timeline.position)
    }
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct SimDemuxer {
    duration: f64,
    seekable: bool,
    relative: bool,
    timeline: Arc<Mutex<Timeline>>,
    seeks: SeekLog,
    reader: Arc<Mutex<ReaderState>>,
}

impl SimDemuxer {
    /// A fully cached stream of `duration` seconds
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            seekable: true,
            relative: false,
            timeline: Arc::new(Mutex::new(Timeline {
                position: 0.0,
                generation: 0,
            })),
            seeks: Arc::new(Mutex::new(Vec::new())),
            reader: Arc::new(Mutex::new(ReaderState {
                idle: true,
                underrun: false,
                buffered_duration: duration,
                time_range: Some((0.0, duration)),
            })),
        }
    }

    pub fn with_relative_seek(mut self) -> Self {
        self.relative = true;
        self
    }

    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// Every seek request as `(target, flags)`
    pub fn seek_log(&self) -> SeekLog {
        self.seeks.clone()
    }

    /// Reader state reported to the cache controller; writable to simulate
    /// network stalls
    pub fn reader_handle(&self) -> Arc<Mutex<ReaderState>> {
        self.reader.clone()
    }

    /// Audio decoder reading this stream in blocks of `block_frames`
    pub fn audio_decoder(&self, format: AudioFormat, block_frames: usize) -> SimAudioDecoder {
        let mut decoder = SimAudioDecoder::from_blocks(format, block_frames, &[]);
        decoder.link = Some(self.link());
        decoder
    }

    /// Video decoder for this stream at `fps`
    pub fn video_source(&self, fps: f64) -> SimVideo {
        SimVideo {
            fps,
            frames: VecDeque::new(),
            link: Some(self.link()),
            presented: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn link(&self) -> Link {
        Link {
            timeline: self.timeline.clone(),
            seen: None,
            duration: self.duration,
        }
    }
}

impl Demuxer for SimDemuxer {
    fn seekable(&self) -> bool {
        self.seekable
    }

    fn supports_relative_seek(&self) -> bool {
        self.relative
    }

    fn seek(&mut self, target: f64, flags: SeekFlags) {
        self.seeks.lock().push((target, flags));

        let mut timeline = self.timeline.lock();
        let pos = if flags.contains(SeekFlags::FACTOR) {
            target * self.duration
        } else if flags.contains(SeekFlags::ABSOLUTE) {
            target
        } else {
            timeline.position + target
        };
        let keyframe = if flags.contains(SeekFlags::FORWARD) {
            (pos / KEYFRAME_INTERVAL).ceil()
        } else {
            (pos / KEYFRAME_INTERVAL).floor()
        } * KEYFRAME_INTERVAL;
        timeline.position = keyframe.clamp(0.0, self.duration);
        timeline.generation += 1;
    }

    fn reader_state(&self) -> ReaderState {
        *self.reader.lock()
    }

    fn duration(&self) -> Option<f64> {
        Some(self.duration)
    }

    fn current_pts(&self) -> Option<f64> {
        Some(self.timeline.lock().position)
    }
}

// ============================================================================
// Audio decoder
// ============================================================================

pub struct SimAudioDecoder {
    format: AudioFormat,
    block_frames: usize,
    /// Pts of the blocks still to decode
    blocks: VecDeque<f64>,
    link: Option<Link>,
    pts: Option<f64>,
    pts_offset: usize,
    decoded: usize,
    probe_waits: usize,
    errors: usize,
    format_change: Option<(usize, AudioFormat)>,
    passthrough: Option<AudioFormat>,
    passthrough_enabled: bool,
}

impl SimAudioDecoder {
    /// Decoder producing one block of `block_frames` per listed pts
    pub fn from_blocks(format: AudioFormat, block_frames: usize, pts: &[f64]) -> Self {
        Self {
            format,
            block_frames,
            blocks: pts.iter().copied().collect(),
            link: None,
            pts: None,
            pts_offset: 0,
            decoded: 0,
            probe_waits: 0,
            errors: 0,
            format_change: None,
            passthrough: None,
            passthrough_enabled: false,
        }
    }

    /// Fail the next `n` decode calls
    pub fn with_errors(mut self, n: usize) -> Self {
        self.errors = n;
        self
    }

    /// Report "no data yet" from the first `n` probes
    pub fn with_probe_waits(mut self, n: usize) -> Self {
        self.probe_waits = n;
        self
    }

    /// Offer compressed output in `format` while passthrough is enabled
    pub fn with_passthrough(mut self, format: AudioFormat) -> Self {
        self.passthrough = Some(format);
        self.passthrough_enabled = true;
        self
    }

    /// Switch to `format` before decoding block number `block`
    pub fn with_format_change(mut self, block: usize, format: AudioFormat) -> Self {
        self.format_change = Some((block, format));
        self
    }

    fn output_format(&self) -> AudioFormat {
        match self.passthrough {
            Some(format) if self.passthrough_enabled => format,
            _ => self.format,
        }
    }

    fn follow_demuxer(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(start) = link.restart() else {
            return;
        };
        let block_secs = self.block_frames as f64 / f64::from(self.format.sample_rate);
        let first = (start / block_secs).floor() as usize;
        let duration = link.duration;
        self.blocks = (first..)
            .map(|i| i as f64 * block_secs)
            .take_while(|pts| *pts < duration)
            .collect();
        self.pts = None;
        self.pts_offset = 0;
    }
}

impl AudioDecoder for SimAudioDecoder {
    fn probe(&mut self) -> Result<Option<AudioFormat>, DecodeError> {
        if self.probe_waits > 0 {
            self.probe_waits -= 1;
            return Ok(None);
        }
        Ok(Some(self.output_format()))
    }

    fn decode(
        &mut self,
        out: &mut AudioBuffer,
        min_frames: usize,
    ) -> Result<DecodeStatus, DecodeError> {
        self.follow_demuxer();
        if self.errors > 0 {
            self.errors -= 1;
            return Err(DecodeError::DecodeFailed("corrupt packet".into()));
        }

        while out.frames() < min_frames {
            if let Some((at, format)) = self.format_change {
                if self.decoded == at {
                    self.format = format;
                    self.format_change = None;
                    return Ok(DecodeStatus::NewFormat);
                }
            }
            let Some(pts) = self.blocks.pop_front() else {
                return Ok(DecodeStatus::Eof);
            };
            let samples = vec![0.25; self.block_frames * out.channels()];
            out.push(&samples);
            self.pts = Some(pts);
            self.pts_offset = self.block_frames;
            self.decoded += 1;
        }
        Ok(DecodeStatus::Ok)
    }

    fn reset(&mut self) {
        self.pts = None;
        self.pts_offset = 0;
    }

    fn pts(&self) -> Option<f64> {
        self.pts
    }

    fn pts_offset(&self) -> usize {
        self.pts_offset
    }

    fn set_passthrough(&mut self, enabled: bool) {
        self.passthrough_enabled = enabled;
    }
}

// ============================================================================
// Audio sink
// ============================================================================

#[derive(Debug, Default)]
struct SinkState {
    format: Option<AudioFormat>,
    capacity: usize,
    queued: usize,
    written: usize,
    paused: bool,
    resets: usize,
    opens: usize,
    final_chunks: usize,
    reload: bool,
    reject_passthrough: bool,
    /// Clock reading at the last drain step
    last_update: Option<f64>,
    /// Fractional frames not yet drained
    carry: f64,
}

/// Device with a fixed-size queue
pub struct SimSink {
    state: Arc<Mutex<SinkState>>,
    clock: Option<Arc<dyn TimeSource>>,
}

/// Test-side view of a [`SimSink`]
#[derive(Clone)]
pub struct SimSinkHandle {
    state: Arc<Mutex<SinkState>>,
}

impl SimSink {
    /// Sink holding up to `capacity` frames that only drains through
    /// [`SimSinkHandle::consume`]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                capacity,
                ..Default::default()
            })),
            clock: None,
        }
    }

    /// Drain in real time against `clock`
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn rejecting_passthrough(self) -> Self {
        self.state.lock().reject_passthrough = true;
        self
    }

    pub fn handle(&self) -> SimSinkHandle {
        SimSinkHandle {
            state: self.state.clone(),
        }
    }

    /// Lock the state after draining whatever played since the last call
    fn advance(&self) -> parking_lot::MutexGuard<'_, SinkState> {
        let mut state = self.state.lock();
        let Some(clock) = &self.clock else {
            return state;
        };
        let now = clock.now();
        if let (Some(last), Some(format)) = (state.last_update, state.format) {
            if !state.paused {
                let frames = (now - last) * f64::from(format.sample_rate) + state.carry;
                let whole = frames.floor();
                state.carry = frames - whole;
                state.queued = state.queued.saturating_sub(whole as usize);
            }
        }
        state.last_update = Some(now);
        state
    }
}

impl AudioSink for SimSink {
    fn open(&mut self, format: &AudioFormat) -> Result<AudioFormat, SinkError> {
        let mut state = self.state.lock();
        if format.passthrough && state.reject_passthrough {
            return Err(SinkError::PassthroughRejected);
        }
        state.format = Some(*format);
        state.queued = 0;
        state.opens += 1;
        state.last_update = None;
        state.carry = 0.0;
        Ok(*format)
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.format = None;
        state.queued = 0;
    }

    fn format(&self) -> Option<AudioFormat> {
        self.state.lock().format
    }

    fn space(&self) -> usize {
        let state = self.advance();
        state.capacity.saturating_sub(state.queued)
    }

    fn delay(&self) -> f64 {
        let state = self.advance();
        match state.format {
            Some(format) => state.queued as f64 / f64::from(format.sample_rate),
            None => 0.0,
        }
    }

    fn play(&mut self, samples: &[f32], flags: PlayFlags) -> usize {
        let mut state = self.advance();
        let Some(format) = state.format else {
            return 0;
        };
        let frames = samples.len() / format.channels.max(1);
        let accepted = frames.min(state.capacity.saturating_sub(state.queued));
        state.queued += accepted;
        state.written += accepted;
        if flags.contains(PlayFlags::FINAL_CHUNK) && accepted == frames {
            state.final_chunks += 1;
        }
        accepted
    }

    fn reset(&mut self) {
        let mut state = self.state.lock();
        state.queued = 0;
        state.resets += 1;
    }

    fn drain(&mut self) {
        self.state.lock().queued = 0;
    }

    fn pause(&mut self) {
        self.advance().paused = true;
    }

    fn resume(&mut self) {
        self.advance().paused = false;
    }

    fn take_reload_request(&mut self) -> bool {
        std::mem::take(&mut self.state.lock().reload)
    }

    fn eof_reached(&self) -> bool {
        self.advance().queued == 0
    }
}

impl SimSinkHandle {
    /// Pretend the device played `frames`
    pub fn consume(&self, frames: usize) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(frames);
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued
    }

    /// Frames accepted since creation
    pub fn written(&self) -> usize {
        self.state.lock().written
    }

    pub fn final_chunks(&self) -> usize {
        self.state.lock().final_chunks
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Simulate a device change
    pub fn request_reload(&self) {
        self.state.lock().reload = true;
    }

    pub fn accept_passthrough(&self) {
        self.state.lock().reject_passthrough = false;
    }
}

// ============================================================================
// Video
// ============================================================================

pub struct SimVideo {
    fps: f64,
    frames: VecDeque<f64>,
    link: Option<Link>,
    presented: Arc<Mutex<Vec<f64>>>,
}

impl SimVideo {
    /// Fixed list of frames, unaffected by seeks
    pub fn from_pts(pts: &[f64]) -> Self {
        Self {
            fps: 0.0,
            frames: pts.iter().copied().collect(),
            link: None,
            presented: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pts of every frame put on screen
    pub fn presented_log(&self) -> Arc<Mutex<Vec<f64>>> {
        self.presented.clone()
    }

    fn follow_demuxer(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(start) = link.restart() else {
            return;
        };
        let first = (start * self.fps - 1e-9).ceil().max(0.0) as usize;
        let fps = self.fps;
        let duration = link.duration;
        self.frames = (first..)
            .map(|i| i as f64 / fps)
            .take_while(|pts| *pts < duration)
            .collect();
    }
}

impl VideoSource for SimVideo {
    fn poll(&mut self) -> VideoPoll {
        self.follow_demuxer();
        match self.frames.front() {
            Some(pts) => VideoPoll::Frame(*pts),
            None => VideoPoll::Eof,
        }
    }

    fn peek_second(&mut self) -> VideoPoll {
        self.follow_demuxer();
        match self.frames.get(1) {
            Some(pts) => VideoPoll::Frame(*pts),
            None => VideoPoll::Eof,
        }
    }

    fn queued(&self) -> usize {
        self.frames.len().min(DECODE_AHEAD)
    }

    fn discard(&mut self) {
        self.frames.pop_front();
    }

    fn present(&mut self) {
        if let Some(pts) = self.frames.pop_front() {
            self.presented.lock().push(pts);
        }
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    #[test]
    fn test_seek_snaps_to_keyframes() {
        let mut demuxer = SimDemuxer::new(60.0);
        demuxer.seek(12.7, SeekFlags::ABSOLUTE | SeekFlags::BACKWARD);
        assert_eq!(demuxer.current_pts(), Some(12.0));
        demuxer.seek(2.2, SeekFlags::FORWARD);
        assert_eq!(demuxer.current_pts(), Some(15.0));
        demuxer.seek(0.5, SeekFlags::FACTOR);
        assert_eq!(demuxer.current_pts(), Some(30.0));
        demuxer.seek(500.0, SeekFlags::ABSOLUTE);
        assert_eq!(demuxer.current_pts(), Some(60.0));
        assert_eq!(demuxer.seek_log().lock().len(), 4);
    }

    #[test]
    fn test_decoders_follow_seeks() {
        let mut demuxer = SimDemuxer::new(10.0);
        let mut audio = demuxer.audio_decoder(AudioFormat::pcm(48000, 2), 4800);
        let mut video = demuxer.video_source(25.0);
        let mut buf = AudioBuffer::new(2);

        assert_eq!(audio.decode(&mut buf, 1).unwrap(), DecodeStatus::Ok);
        assert_eq!(audio.pts(), Some(0.0));
        assert_eq!(video.poll(), VideoPoll::Frame(0.0));

        demuxer.seek(4.5, SeekFlags::ABSOLUTE | SeekFlags::BACKWARD);
        buf.clear();
        audio.decode(&mut buf, 1).unwrap();
        assert_eq!(audio.pts(), Some(4.0));
        assert_eq!(video.poll(), VideoPoll::Frame(4.0));
    }

    #[test]
    fn test_sink_drains_with_clock() {
        let clock = ManualClock::new();
        let mut sink = SimSink::new(48000).with_clock(Arc::new(clock.clone()));
        sink.open(&AudioFormat::pcm(48000, 2)).unwrap();
        assert_eq!(sink.play(&vec![0.0; 2 * 24000], PlayFlags::empty()), 24000);
        assert!((sink.delay() - 0.5).abs() < 1e-9);

        clock.advance(0.25);
        assert!((sink.delay() - 0.25).abs() < 1e-9);

        sink.pause();
        clock.advance(1.0);
        assert_eq!(sink.space(), 36000);
        sink.resume();
        clock.advance(1.0);
        assert!(sink.eof_reached());
    }
}
