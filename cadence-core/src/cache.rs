//! # Cache-Underrun Pause
//!
//! Pauses playback when the demuxer runs dry and resumes once enough is
//! buffered again. The amount to wait for adapts across episodes: a wait
//! that ran longer than estimated grows the estimate, a short one shrinks
//! it. The user's own pause flag is kept by the engine and never touched
//! here.

use crate::demuxer::ReaderState;
use crate::events::CacheStatus;
use crate::options::PlaybackOptions;

/// Poll interval while paused for cache
const PAUSED_POLL_INTERVAL: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheTransition {
    Enter,
    Leave {
        /// Seconds spent paused
        waited: f64,
    },
}

/// Result of one controller tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheTick {
    pub transition: Option<CacheTransition>,
    /// A cache update notification is due
    pub notify: Option<CacheStatus>,
    /// Longest the loop may sleep for the controller
    pub sleep: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CacheController {
    paused_for_cache: bool,
    /// When the current pause started
    cache_stop_time: f64,
    /// Seconds of buffered data to wait for
    wait: f64,
    /// Next periodic notification; `None` while nothing is scheduled
    next_update: Option<f64>,
    buffering_percent: u8,
}

impl CacheController {
    pub fn new(opts: &PlaybackOptions) -> Self {
        Self {
            paused_for_cache: false,
            cache_stop_time: 0.0,
            wait: opts.cache_initial_wait.clamp(opts.cache_wait_min, opts.cache_wait_max),
            next_update: None,
            buffering_percent: 100,
        }
    }

    pub fn paused_for_cache(&self) -> bool {
        self.paused_for_cache
    }

    pub fn wait_estimate(&self) -> f64 {
        self.wait
    }

    pub fn buffering_percent(&self) -> u8 {
        self.buffering_percent
    }

    /// Leave the cache pause without adapting the estimate (file closed)
    pub fn clear(&mut self) {
        self.paused_for_cache = false;
        self.next_update = None;
        self.buffering_percent = 100;
    }

    /// Evaluate the reader state. `observed` is true when somebody listens
    /// for cache updates.
    pub fn update(
        &mut self,
        state: &ReaderState,
        opts: &PlaybackOptions,
        now: f64,
        observed: bool,
    ) -> CacheTick {
        let mut tick = CacheTick::default();
        let mut force_update = false;

        if self.paused_for_cache {
            if !opts.cache_pause || state.idle || state.buffered_duration >= self.wait {
                let waited = now - self.cache_stop_time;
                self.adapt(waited, opts);
                self.paused_for_cache = false;
                tracing::info!(
                    "Cache ready after {:.2}s, next wait {:.2}s",
                    waited,
                    self.wait
                );
                tick.transition = Some(CacheTransition::Leave { waited });
                force_update = true;
            }
        } else if opts.cache_pause && state.underrun {
            self.paused_for_cache = true;
            self.cache_stop_time = now;
            tracing::info!("Cache underrun, pausing for {:.2}s of data", self.wait);
            tick.transition = Some(CacheTransition::Enter);
            force_update = true;
        }

        let mut percent = 100;
        if self.paused_for_cache {
            percent = (100.0 * (state.buffered_duration / self.wait).clamp(0.0, 0.99)) as u8;
            tick.sleep = Some(PAUSED_POLL_INTERVAL);
        }
        // Progress rides on the periodic updates
        self.buffering_percent = percent;

        let busy = !state.idle || observed;
        if busy || self.next_update.is_some() {
            if self.next_update.map_or(true, |t| t <= now) {
                self.next_update = busy.then_some(now + opts.cache_update_interval);
                force_update = true;
            }
            if let Some(next) = self.next_update {
                let until = (next - now).max(0.0);
                tick.sleep = Some(tick.sleep.map_or(until, |s: f64| s.min(until)));
            }
        }

        if force_update {
            tick.notify = Some(CacheStatus {
                idle: state.idle,
                underrun: state.underrun,
                buffered_duration: state.buffered_duration,
                paused_for_cache: self.paused_for_cache,
                buffering_percent: self.buffering_percent,
            });
        }
        tick
    }

    fn adapt(&mut self, waited: f64, opts: &PlaybackOptions) {
        if waited > self.wait {
            self.wait *= opts.cache_wait_grow + opts.cache_wait_adjust;
        } else {
            self.wait /= opts.cache_wait_grow - opts.cache_wait_adjust;
        }
        self.wait = self.wait.clamp(opts.cache_wait_min, opts.cache_wait_max);
    }
}

// ============================================================================
// Tests
// ============================================================================
