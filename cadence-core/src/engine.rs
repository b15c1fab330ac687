//! # Playback Engine
//!
//! One tick of the playback loop:
//!
//! ```text
//! cache check -> audio fill -> video sync/present -> restart check
//!     -> position update -> idle tick -> end of file -> backstep -> seek
//! ```
//!
//! Every step may shorten the sleep until the next tick. The loop is single
//! threaded; other threads reach it only through the [`ControlHandle`].

use std::sync::Arc;
use std::time::Duration;

use crate::audio::AudioSink;
use crate::audio_sync::{AudioChain, FillContext, FillOutcome, SyncTarget};
use crate::cache::CacheController;
use crate::control::{Command, ControlHandle};
use crate::decode::AudioDecoder;
use crate::demuxer::{Demuxer, ExternalTrack};
use crate::events::{Event, EventBus, EventKind, SubscriptionId};
use crate::options::{PlaybackOptions, VideoSyncMode};
use crate::pts_history::PtsHistory;
use crate::seek::{
    BackstepState, SeekEnv, SeekKind, SeekOutcome, SeekPrecision, SeekScheduler,
};
use crate::sync::{Readiness, StreamKind, StreamStatus};
use crate::time::TimeSource;
use crate::video::{VideoChain, VideoSource};

/// Shortest sleep while audio is being fed
const MIN_AUDIO_WAKEUP: f64 = 0.005;

/// Collaborators making up one loaded item
pub struct MediaSources {
    pub demuxer: Box<dyn Demuxer>,
    pub audio: Option<(Box<dyn AudioDecoder>, Box<dyn AudioSink>)>,
    pub video: Option<Box<dyn VideoSource>>,
    pub externals: Vec<ExternalTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfFile,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    /// Seconds the loop may sleep before the next tick
    pub sleep: f64,
    pub stop: Option<StopReason>,
}

/// Counters for the loaded item
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackStats {
    pub frames_shown: u64,
    pub frames_dropped: u64,
    /// Seconds of audio handed to the device
    pub audio_played: f64,
}

pub struct PlaybackEngine {
    opts: Arc<PlaybackOptions>,
    clock: Arc<dyn TimeSource>,
    events: EventBus,
    control: ControlHandle,

    demuxer: Option<Box<dyn Demuxer>>,
    externals: Vec<ExternalTrack>,
    audio: Option<AudioChain>,
    video: Option<VideoChain>,

    readiness: Readiness,
    seek: SeekScheduler,
    history: PtsHistory,
    cache: CacheController,

    user_paused: bool,
    /// `user_paused || paused_for_cache`
    paused: bool,
    step_frames: u32,
    /// Show the first frame after a restart even while paused
    show_first_frame: bool,
    /// Wall clock anchor (pts, time) when audio does not drive video
    clock_base: Option<(f64, f64)>,
    playback_pts: Option<f64>,
    /// Audio minus video position
    av_difference: f64,
    last_idle_tick: f64,
    eof_handled: bool,
    sleeptime: f64,
    stop: Option<StopReason>,
}

impl PlaybackEngine {
    pub fn new(opts: Arc<PlaybackOptions>, clock: Arc<dyn TimeSource>) -> Self {
        let cache = CacheController::new(&opts);
        Self {
            opts,
            clock,
            events: EventBus::new(),
            control: ControlHandle::new(),
            demuxer: None,
            externals: Vec::new(),
            audio: None,
            video: None,
            readiness: Readiness::new(),
            seek: SeekScheduler::new(),
            history: PtsHistory::new(),
            cache,
            user_paused: false,
            paused: false,
            step_frames: 0,
            show_first_frame: false,
            clock_base: None,
            playback_pts: None,
            av_difference: 0.0,
            last_idle_tick: f64::NEG_INFINITY,
            eof_handled: false,
            sleeptime: 0.0,
            stop: None,
        }
    }

    // ========================================================================
    // Setup
    // ========================================================================

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn subscribe<F>(&mut self, kinds: &[EventKind], observer: F) -> SubscriptionId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.events.subscribe(kinds, observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn options(&self) -> &Arc<PlaybackOptions> {
        &self.opts
    }

    /// Swap the options snapshot. Takes effect on the next tick.
    pub fn set_options(&mut self, opts: Arc<PlaybackOptions>) {
        tracing::debug!("options replaced");
        self.opts = opts;
    }

    pub fn load(&mut self, sources: MediaSources) {
        self.unload();
        tracing::info!(
            "Loading item (audio: {}, video: {}, external tracks: {})",
            sources.audio.is_some(),
            sources.video.is_some(),
            sources.externals.len()
        );
        self.demuxer = Some(sources.demuxer);
        self.externals = sources.externals;
        self.audio = sources
            .audio
            .map(|(decoder, sink)| AudioChain::new(decoder, sink));
        self.video = sources.video.map(VideoChain::new);

        self.seek.reset();
        self.history = PtsHistory::new();
        self.stop = None;
        self.readiness.load_item();
        self.reset_playback_state();
        self.control.wakeup();
    }

    /// Close the current item
    pub fn unload(&mut self) {
        if let Some(audio) = self.audio.as_mut() {
            audio.close(!self.opts.gapless_audio);
        }
        self.audio = None;
        self.video = None;
        self.demuxer = None;
        self.externals.clear();
        self.cache.clear();
        self.readiness.reset(false, false);
    }

    /// Re-arm both streams (seek, load)
    pub fn reset_playback_state(&mut self) {
        self.readiness
            .reset(self.audio.is_some(), self.video.is_some());
        if let Some(video) = self.video.as_mut() {
            video.reset();
        }
        self.playback_pts = None;
        self.av_difference = 0.0;
        self.show_first_frame = false;
        self.clock_base = None;
        self.eof_handled = false;
    }

    // ========================================================================
    // Loop
    // ========================================================================

    /// Run until playback stops, sleeping between ticks
    pub fn run(&mut self) -> StopReason {
        loop {
            for cmd in self.control.drain() {
                self.dispatch(cmd);
            }
            let report = self.run_tick();
            if let Some(reason) = report.stop {
                return reason;
            }
            let timeout = Duration::from_secs_f64(report.sleep.max(0.0));
            for cmd in self.control.wait(timeout) {
                self.dispatch(cmd);
            }
        }
    }

    pub fn run_tick(&mut self) -> TickReport {
        self.sleeptime = self.opts.max_wakeup_period;
        if self.stop.is_none() && self.demuxer.is_some() {
            self.update_cache();
            self.fill_audio();
            self.write_video();
            self.check_restart();
            self.update_playback_time();
            self.idle_tick();
            self.handle_eof();
            self.handle_backstep();
            self.execute_seek();
        }
        TickReport {
            sleep: self.sleeptime,
            stop: self.stop,
        }
    }

    pub fn dispatch(&mut self, cmd: Command) {
        tracing::debug!("command {:?}", cmd);
        match cmd {
            Command::Seek {
                kind,
                amount,
                precision,
                immediate,
            } => self.queue_seek(kind, amount, precision, immediate),
            Command::Pause => self.pause(),
            Command::Unpause => self.unpause(),
            Command::TogglePause => self.toggle_pause(),
            Command::FrameStep(n) => self.frame_step(n),
            Command::SetSpeed(speed) => self.set_speed(speed),
            Command::Stop => self.stop = Some(StopReason::Quit),
        }
    }

    fn set_timeout(&mut self, secs: f64) {
        self.sleeptime = self.sleeptime.min(secs.max(0.0));
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    // ========================================================================
    // Controls
    // ========================================================================

    pub fn queue_seek(
        &mut self,
        kind: SeekKind,
        amount: f64,
        precision: SeekPrecision,
        immediate: bool,
    ) {
        self.seek.queue_seek(kind, amount, precision, immediate);
        self.control.wakeup();
    }

    pub fn pause(&mut self) {
        self.set_pause(true);
    }

    pub fn unpause(&mut self) {
        self.set_pause(false);
    }

    pub fn toggle_pause(&mut self) {
        self.set_pause(!self.user_paused);
    }

    /// Step `n` frames forward, or one frame back when `n` is negative
    pub fn frame_step(&mut self, n: i32) {
        if n > 0 {
            self.step_frames += n.unsigned_abs();
            self.set_pause(false);
        } else if n < 0 {
            if !self.seek.arm_backstep(self.history.generation()) {
                tracing::debug!("backstep ignored, seek in progress");
            }
            self.set_pause(true);
        }
        self.control.wakeup();
    }

    pub fn set_speed(&mut self, speed: f64) {
        if !(speed > 0.0) {
            tracing::warn!("Ignoring invalid speed {}", speed);
            return;
        }
        self.rebase_clock();
        Arc::make_mut(&mut self.opts).playback_speed = speed;
        tracing::info!("Speed {:.2}x", speed);
    }

    fn set_pause(&mut self, pause: bool) {
        let changed = self.user_paused != pause;
        self.user_paused = pause;
        self.update_pause();
        if changed {
            self.events
                .emit(if pause { Event::Pause } else { Event::Unpause });
        }
    }

    fn update_pause(&mut self) {
        let paused = self.user_paused || self.cache.paused_for_cache();
        if paused == self.paused {
            return;
        }
        if !paused {
            self.rebase_clock();
        }
        self.paused = paused;
        if let Some(audio) = self.audio.as_mut() {
            if paused {
                audio.pause();
            } else {
                audio.resume();
            }
        }
        tracing::debug!("internal pause {}", paused);
        self.set_timeout(0.0);
    }

    /// Restart the wall clock from the current position
    fn rebase_clock(&mut self) {
        if let Some(pts) = self.playback_pts {
            self.clock_base = Some((pts, self.now()));
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn user_paused(&self) -> bool {
        self.user_paused
    }

    pub fn paused_for_cache(&self) -> bool {
        self.cache.paused_for_cache()
    }

    pub fn status(&self, kind: StreamKind) -> StreamStatus {
        self.readiness.status(kind)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    pub fn last_av_difference(&self) -> f64 {
        self.av_difference
    }

    pub fn stats(&self) -> PlaybackStats {
        let (frames_shown, frames_dropped) = self
            .video
            .as_ref()
            .map_or((0, 0), |v| (v.frames_shown(), v.frames_dropped()));
        PlaybackStats {
            frames_shown,
            frames_dropped,
            audio_played: self.audio.as_ref().map_or(0.0, |a| a.played_seconds()),
        }
    }

    /// Position on the media timeline
    pub fn current_time(&self) -> Option<f64> {
        self.playback_pts.or(self.seek.last_seek_pts())
    }

    /// Position relative to the start of the file
    pub fn playback_time(&self) -> Option<f64> {
        let start = self.demuxer.as_ref()?.start_time();
        Some(self.current_time()? - start)
    }

    pub fn time_length(&self) -> Option<f64> {
        self.demuxer.as_ref()?.duration()
    }

    /// 0.0..=1.0
    pub fn position_ratio(&self) -> Option<f64> {
        let len = self.time_length()?;
        if len <= 0.0 {
            return None;
        }
        Some((self.playback_time()? / len).clamp(0.0, 1.0))
    }

    // ========================================================================
    // Tick steps
    // ========================================================================

    fn update_cache(&mut self) {
        let Some(demuxer) = self.demuxer.as_ref() else {
            return;
        };
        let state = demuxer.reader_state();
        let observed = self.events.is_registered(EventKind::CacheUpdate);
        let now = self.now();
        let tick = self.cache.update(&state, &self.opts, now, observed);

        if tick.transition.is_some() {
            self.update_pause();
        }
        if let Some(sleep) = tick.sleep {
            self.set_timeout(sleep);
        }
        if let Some(status) = tick.notify {
            self.events.emit(Event::CacheUpdate(status));
        }
    }

    fn audio_sync_target(&self) -> SyncTarget {
        if !self.opts.initial_audio_sync {
            return SyncTarget::Disabled;
        }
        if let Some(video) = self.video.as_ref() {
            let status = self.readiness.video();
            if status != StreamStatus::Eof {
                if status < StreamStatus::Ready {
                    return SyncTarget::Wait;
                }
                return match video.next_pts() {
                    Some(pts) => SyncTarget::Pts(pts - self.opts.audio_delay),
                    None => SyncTarget::Disabled,
                };
            }
        }
        let hrseek = self.seek.hrseek();
        if hrseek.active {
            SyncTarget::Pts(hrseek.pts)
        } else {
            SyncTarget::Disabled
        }
    }

    fn fill_audio(&mut self) {
        if self.audio.is_none() {
            return;
        }
        let sync_target = self.audio_sync_target();
        let Some(chain) = self.audio.as_mut() else {
            return;
        };
        let outcome = chain.fill(FillContext {
            opts: &self.opts,
            readiness: &mut self.readiness,
            sync_target,
            paused: self.paused,
            end_pts: self.opts.play_end,
            av_difference: &mut self.av_difference,
        });
        let delay = chain.sink_delay();

        match outcome {
            FillOutcome::Idle => {}
            FillOutcome::Retry => self.set_timeout(0.0),
            FillOutcome::Reconfigured => {
                self.events.emit(Event::AudioReconfig);
                self.set_timeout(0.0);
            }
            FillOutcome::Resynced(frames) => {
                tracing::debug!("audio resynced ({} frames)", frames);
                self.set_timeout(0.0);
            }
            FillOutcome::Played(_) => {}
            FillOutcome::Failed => {
                tracing::error!("Audio track failed, continuing without audio");
                if let Some(mut chain) = self.audio.take() {
                    chain.close(false);
                }
                self.readiness.set(StreamKind::Audio, StreamStatus::Eof);
                self.events.emit(Event::TrackFailed(StreamKind::Audio));
                self.set_timeout(0.0);
                return;
            }
        }

        let status = self.readiness.audio();
        if !self.paused && (status == StreamStatus::Playing || status == StreamStatus::Draining) {
            self.set_timeout((delay / 2.0).max(MIN_AUDIO_WAKEUP));
        }
    }

    /// Audio position as heard, shifted by the audio delay
    fn audio_position(&self) -> Option<f64> {
        let pts = self.audio.as_ref()?.playing_pts(self.opts.playback_speed)?;
        Some(pts + self.opts.audio_delay)
    }

    /// Clock video is presented against. Display-sync always runs video on
    /// the wall clock and corrects audio instead.
    fn video_clock(&mut self) -> Option<f64> {
        let speed = self.opts.playback_speed;
        let audio_clocked = self.opts.video_sync == VideoSyncMode::Audio
            && matches!(
                self.readiness.audio(),
                StreamStatus::Playing | StreamStatus::Draining
            );
        if audio_clocked {
            if let Some(pts) = self.audio_position() {
                self.clock_base = Some((pts, self.now()));
                return Some(pts);
            }
        }
        let now = self.now();
        self.clock_base
            .map(|(pts, base)| pts + (now - base) * speed)
    }

    fn write_video(&mut self) {
        if self.video.is_none() {
            return;
        }
        let status = self.readiness.video();
        match status {
            StreamStatus::Syncing | StreamStatus::Filling => {
                let prefill = self.opts.video_prefill_frames;
                let Some(video) = self.video.as_mut() else {
                    return;
                };
                let new = video.sync(status, self.seek.hrseek(), &mut self.history, prefill);
                if new != status {
                    self.readiness.set(StreamKind::Video, new);
                    self.set_timeout(0.0);
                }
            }
            StreamStatus::Playing => {
                let force = self.step_frames > 0 || self.show_first_frame;
                if self.paused && !force {
                    return;
                }
                let clock = self.video_clock();
                let Some(video) = self.video.as_mut() else {
                    return;
                };
                let presented = video.present_due(clock, force, &mut self.history);

                if let Some(pts) = presented.shown {
                    self.show_first_frame = false;
                    self.playback_pts = Some(pts);
                    if self.readiness.audio() == StreamStatus::Playing {
                        let audio = match self.opts.video_sync {
                            VideoSyncMode::Audio => clock,
                            VideoSyncMode::DisplayAudioDrop => self.audio_position(),
                        };
                        if let Some(audio) = audio {
                            self.av_difference = audio - pts;
                        }
                    }
                    if self.step_frames > 0 {
                        self.step_frames -= 1;
                        if self.step_frames == 0 {
                            self.set_pause(true);
                        }
                    }
                    self.events.emit(Event::Tick);
                }
                if presented.eof {
                    tracing::debug!("video EOF");
                    self.readiness.set(StreamKind::Video, StreamStatus::Eof);
                    self.set_timeout(0.0);
                }
                if let Some(wait) = presented.wait {
                    self.set_timeout(wait / self.opts.playback_speed);
                }
            }
            _ => {}
        }
    }

    fn check_restart(&mut self) {
        let seek_pending = self.seek.pending().is_pending();
        let Some(report) = self.readiness.check_restart(seek_pending) else {
            return;
        };
        if report.seek_now {
            tracing::debug!("running queued seek before audio starts");
            self.seek.make_immediate();
            return;
        }
        if report.video_started {
            let now = self.now();
            let start = self
                .video
                .as_ref()
                .and_then(|v| v.next_pts())
                .or(self.seek.last_seek_pts());
            self.clock_base = start.map(|pts| (pts, now));
            self.show_first_frame = true;
        }
        if report.restart_completed {
            self.seek.end_hrseek();
            tracing::info!(
                "Playback restarted at {}",
                self.clock_base
                    .map_or_else(|| "?".to_string(), |(pts, _)| format!("{:.3}", pts))
            );
            self.events.emit(Event::PlaybackRestart);
        }
        if report.now_playing {
            self.events.emit(Event::NowPlaying);
        }
        self.set_timeout(0.0);
    }

    fn update_playback_time(&mut self) {
        let speed = self.opts.playback_speed;
        if self.video.is_some() && self.readiness.video() >= StreamStatus::Playing {
            // Until the first frame after a restart is up, last_shown is
            // still the frame from before the seek
            if !self.show_first_frame {
                if let Some(pts) = self.video.as_ref().and_then(|v| v.last_shown()) {
                    self.playback_pts = Some(pts);
                }
            }
        } else if self.readiness.audio() >= StreamStatus::Playing {
            if let Some(pts) = self.audio.as_ref().and_then(|a| a.playing_pts(speed)) {
                self.playback_pts = Some(pts);
            }
        }
    }

    fn idle_tick(&mut self) {
        if !(self.paused || self.readiness.video() == StreamStatus::Eof) {
            return;
        }
        let now = self.now();
        let interval = self.opts.idle_tick_interval;
        let elapsed = now - self.last_idle_tick;
        if elapsed >= interval {
            self.last_idle_tick = now;
            self.events.emit(Event::Tick);
            self.set_timeout(interval);
        } else {
            self.set_timeout(interval - elapsed);
        }
    }

    fn handle_eof(&mut self) {
        if self.readiness.audio() != StreamStatus::Eof
            || self.readiness.video() != StreamStatus::Eof
            || self.seek.pending().is_pending()
        {
            return;
        }

        if self.opts.loop_file {
            let start = self.demuxer.as_ref().map_or(0.0, |d| d.start_time());
            tracing::info!("Looping to {:.3}", start);
            self.seek
                .queue_seek(SeekKind::Absolute, start, SeekPrecision::Default, true);
            return;
        }

        if self.opts.keep_open {
            if !self.eof_handled {
                self.eof_handled = true;
                tracing::info!("End of file, keeping the last frame");
                self.set_pause(true);
            }
            return;
        }

        tracing::info!("End of file");
        self.stop = Some(StopReason::EndOfFile);
        self.events.emit(Event::EndFile);
    }

    fn handle_backstep(&mut self) {
        if self.seek.backstep() == BackstepState::Idle {
            return;
        }
        let current = self.video.as_ref().and_then(|v| v.last_shown());
        let now = self.now();
        let current_time = self.current_time();
        let result = {
            let mut env = SeekEnv {
                opts: &self.opts,
                demuxer: self.demuxer.as_mut(),
                externals: &mut self.externals,
                history: &mut self.history,
                current_time,
                now,
            };
            self.seek.handle_backstep(&mut env, current)
        };
        match result {
            Ok(Some(outcome)) => self.apply_seek(outcome),
            Ok(None) => {}
            Err(e) => tracing::warn!("{}", e),
        }
    }

    fn execute_seek(&mut self) {
        let video_status = self.readiness.video();
        let now = self.now();
        let current_time = self.current_time();
        let result = {
            let mut env = SeekEnv {
                opts: &self.opts,
                demuxer: self.demuxer.as_mut(),
                externals: &mut self.externals,
                history: &mut self.history,
                current_time,
                now,
            };
            self.seek.execute_queued_seek(&mut env, video_status)
        };
        match result {
            None => {
                if self.seek.pending().is_pending() {
                    // Debounced; look again shortly
                    self.set_timeout(self.opts.seek_debounce / 4.0);
                }
            }
            Some(Ok(outcome)) => self.apply_seek(outcome),
            Some(Err(e)) => tracing::warn!("Seek failed: {}", e),
        }
    }

    fn apply_seek(&mut self, outcome: SeekOutcome) {
        if let Some(audio) = self.audio.as_mut() {
            audio.reset();
        }
        self.reset_playback_state();
        self.events.emit(Event::Seek);
        self.events.emit(Event::Tick);
        tracing::debug!("seek applied, target {:?}", outcome.target);
        self.set_timeout(0.0);
    }
}

// ============================================================================
// Tests
// ============================================================================
