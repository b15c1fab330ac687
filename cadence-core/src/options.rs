//! Playback Options
//!
//! One immutable snapshot per tick. The engine holds it behind an `Arc` and
//! only swaps it between ticks.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Failed to read options: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse options: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid option {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// When a seek without explicit precision becomes frame-exact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HrSeekMode {
    /// Only absolute seeks are exact
    #[default]
    Absolute,
    /// Every seek is exact unless it asks for keyframes
    Always,
    /// Only seeks that explicitly ask for it are exact
    Never,
}

/// Which clock drives presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSyncMode {
    /// Video follows the audio clock
    #[default]
    Audio,
    /// Video follows the display; audio is corrected by dropping or
    /// duplicating samples
    DisplayAudioDrop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    // ------------------------------------------------------------------
    // Seeking
    // ------------------------------------------------------------------
    pub correct_pts: bool,
    pub hr_seek: HrSeekMode,
    /// Seconds subtracted from the demuxer target of exact seeks
    pub hr_seek_demuxer_offset: f64,
    /// Lower bound for the offset of very exact seeks
    pub very_exact_min_offset: f64,
    /// Hold back non-immediate seeks this long until a frame was shown
    pub seek_debounce: f64,

    // ------------------------------------------------------------------
    // Audio
    // ------------------------------------------------------------------
    pub initial_audio_sync: bool,
    /// Seconds audio is shifted against video
    pub audio_delay: f64,
    pub playback_speed: f64,
    pub gapless_audio: bool,
    pub video_sync: VideoSyncMode,
    /// Granularity of display-sync drop/duplicate corrections (seconds)
    pub sync_audio_drop_size: f64,
    /// Percent
    pub sync_max_audio_change: f64,
    /// Percent
    pub sync_max_video_change: f64,
    /// Larger divergences abandon the resync (seconds)
    pub resync_abandon_threshold: f64,
    pub decode_error_budget: u32,

    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------
    pub cache_pause: bool,
    pub cache_initial_wait: f64,
    pub cache_wait_min: f64,
    pub cache_wait_max: f64,
    pub cache_wait_grow: f64,
    pub cache_wait_adjust: f64,
    pub cache_update_interval: f64,

    // ------------------------------------------------------------------
    // Loop driver
    // ------------------------------------------------------------------
    pub loop_file: bool,
    pub keep_open: bool,
    /// Stop playback at this pts
    pub play_end: Option<f64>,
    pub video_prefill_frames: usize,
    pub idle_tick_interval: f64,
    pub max_wakeup_period: f64,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            correct_pts: true,
            hr_seek: HrSeekMode::Absolute,
            hr_seek_demuxer_offset: 0.0,
            very_exact_min_offset: 0.5,
            seek_debounce: 0.3,

            initial_audio_sync: true,
            audio_delay: 0.0,
            playback_speed: 1.0,
            gapless_audio: false,
            video_sync: VideoSyncMode::Audio,
            sync_audio_drop_size: 0.020,
            sync_max_audio_change: 0.125,
            sync_max_video_change: 1.0,
            resync_abandon_threshold: 3600.0,
            decode_error_budget: 50,

            cache_pause: true,
            cache_initial_wait: 2.0,
            cache_wait_min: 1.0,
            cache_wait_max: 10.0,
            cache_wait_grow: 1.5,
            cache_wait_adjust: 0.1,
            cache_update_interval: 0.25,

            loop_file: false,
            keep_open: false,
            play_end: None,
            video_prefill_frames: 1,
            idle_tick_interval: 0.5,
            max_wakeup_period: 100.0,
        }
    }
}

impl PlaybackOptions {
    /// Load options from a JSON file. Missing keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, OptionsError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, OptionsError> {
        let opts: Self = serde_json::from_str(content)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if !(self.playback_speed > 0.0) {
            return Err(OptionsError::Invalid {
                name: "playback_speed",
                reason: format!("must be positive, got {}", self.playback_speed),
            });
        }
        if !(self.cache_wait_min > 0.0) || self.cache_wait_min > self.cache_wait_max {
            return Err(OptionsError::Invalid {
                name: "cache_wait_min",
                reason: format!(
                    "need 0 < min <= max, got [{}, {}]",
                    self.cache_wait_min, self.cache_wait_max
                ),
            });
        }
        if self.cache_wait_grow - self.cache_wait_adjust <= 1.0 {
            return Err(OptionsError::Invalid {
                name: "cache_wait_grow",
                reason: "shrink factor (grow - adjust) must stay above 1".into(),
            });
        }
        if !(self.resync_abandon_threshold > 0.0) {
            return Err(OptionsError::Invalid {
                name: "resync_abandon_threshold",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Fraction of played audio that display-sync may drop or duplicate
    pub fn drop_limit(&self) -> f64 {
        (self.sync_max_audio_change + self.sync_max_video_change) / 100.0
    }

    /// Offset applied to the demuxer target of an exact seek
    pub fn hr_seek_offset(&self, very_exact: bool) -> f64 {
        if very_exact {
            self.hr_seek_demuxer_offset.max(self.very_exact_min_offset)
        } else {
            self.hr_seek_demuxer_offset
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts = PlaybackOptions::from_json(r#"{ "audio_delay": 0.2, "hr_seek": "always" }"#)
            .unwrap();
        assert_eq!(opts.audio_delay, 0.2);
        assert_eq!(opts.hr_seek, HrSeekMode::Always);
        assert_eq!(opts.cache_wait_max, 10.0);
        assert_eq!(opts.decode_error_budget, 50);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "video_sync": "display_audio_drop", "loop_file": true }}"#).unwrap();

        let opts = PlaybackOptions::load(file.path()).unwrap();
        assert_eq!(opts.video_sync, VideoSyncMode::DisplayAudioDrop);
        assert!(opts.loop_file);
    }

    #[test]
    fn test_rejects_bad_speed() {
        let err = PlaybackOptions::from_json(r#"{ "playback_speed": 0.0 }"#).unwrap_err();
        assert!(matches!(err, OptionsError::Invalid { name: "playback_speed", .. }));
    }

    #[test]
    fn test_very_exact_offset_floor() {
        let opts = PlaybackOptions::default();
        assert_eq!(opts.hr_seek_offset(false), 0.0);
        assert_eq!(opts.hr_seek_offset(true), 0.5);

        let opts = PlaybackOptions {
            hr_seek_demuxer_offset: 0.8,
            ..Default::default()
        };
        assert_eq!(opts.hr_seek_offset(true), 0.8);
    }
}
