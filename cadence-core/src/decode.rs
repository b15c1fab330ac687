//! # Audio Decode
//!
//! Decoder interface consumed by the fill loop. Decoders append interleaved
//! `f32` frames to the output buffer and report where the decoded audio sits
//! on the timeline:
//!
//! - `pts()` is the timestamp of the last block the decoder started from
//! - `pts_offset()` is the number of frames decoded since that timestamp
//!
//! so the end of decoded audio is `pts + pts_offset / rate`.
//!
//! With the `audio` feature, [`SymphoniaSource`] opens a local file and
//! yields a matching demuxer/decoder pair.

use thiserror::Error;

use crate::audio::AudioFormat;
use crate::audio_buffer::AudioBuffer;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Failed to open input: {0}")]
    Open(String),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-error decoder results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The requested amount was decoded
    Ok,
    /// No packet available yet; try again next tick
    Wait,
    /// End of input
    Eof,
    /// Output format changed; nothing after the change was appended
    NewFormat,
}

pub trait AudioDecoder: Send {
    /// Format of the next decoded block, `None` while no data has arrived
    fn probe(&mut self) -> Result<Option<AudioFormat>, DecodeError>;

    /// Decode until `out` holds at least `min_frames` frames or something
    /// interrupts decoding
    fn decode(&mut self, out: &mut AudioBuffer, min_frames: usize)
        -> Result<DecodeStatus, DecodeError>;

    /// Drop decoder state after a seek
    fn reset(&mut self);

    fn pts(&self) -> Option<f64>;

    fn pts_offset(&self) -> usize;

    /// Seconds of audio held inside the filter chain
    fn filter_delay(&self) -> f64 {
        0.0
    }

    /// Request compressed passthrough output (when the codec allows it)
    fn set_passthrough(&mut self, _enabled: bool) {}
}

// ============================================================================
// Symphonia
// ============================================================================

#[cfg(feature = "audio")]
pub use symphonia_source::{SymphoniaDecoder, SymphoniaDemuxer, SymphoniaSource};

#[cfg(feature = "audio")]
mod symphonia_source {
    use super::*;

    use parking_lot::Mutex;
    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;

    use symphonia::core::audio::{SampleBuffer, SignalSpec};
    use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;
    use symphonia::core::units::{Time, TimeBase};

    use crate::demuxer::{Demuxer, ReaderState, SeekFlags};

    struct Shared {
        reader: Box<dyn FormatReader>,
        track_id: u32,
        time_base: Option<TimeBase>,
        /// Pts of the last packet read
        last_pts: Option<f64>,
        eof: bool,
    }

    impl Shared {
        fn ts_to_secs(&self, ts: u64) -> Option<f64> {
            self.time_base.map(|tb| {
                let t = tb.calc_time(ts);
                t.seconds as f64 + t.frac
            })
        }
    }

    /// A local file opened with symphonia
    pub struct SymphoniaSource;

    impl SymphoniaSource {
        pub fn open<P: AsRef<Path>>(
            path: P,
        ) -> Result<(SymphoniaDemuxer, SymphoniaDecoder), DecodeError> {
            let path = path.as_ref();
            let file = File::open(path)?;
            let mss = MediaSourceStream::new(Box::new(file), Default::default());

            let mut hint = Hint::new();
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }

            let probed = symphonia::default::get_probe()
                .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
                .map_err(|e| DecodeError::Open(e.to_string()))?;
            let reader = probed.format;

            let track = reader
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
                .ok_or_else(|| DecodeError::Open("no audio track".into()))?;

            let decoder = symphonia::default::get_codecs()
                .make(&track.codec_params, &DecoderOptions::default())
                .map_err(|e| DecodeError::UnsupportedCodec(e.to_string()))?;

            let time_base = track.codec_params.time_base;
            let start = track.codec_params.start_ts;
            let duration = match (time_base, track.codec_params.n_frames) {
                (Some(tb), Some(n)) => {
                    let t = tb.calc_time(start + n);
                    Some(t.seconds as f64 + t.frac)
                }
                _ => None,
            };

            let shared = Arc::new(Mutex::new(Shared {
                track_id: track.id,
                time_base,
                reader,
                last_pts: None,
                eof: false,
            }));

            tracing::info!("Opened {} (duration {:?})", path.display(), duration);

            Ok((
                SymphoniaDemuxer {
                    shared: shared.clone(),
                    duration,
                },
                SymphoniaDecoder {
                    shared,
                    decoder,
                    spec: None,
                    pending: None,
                    pts: None,
                    pts_offset: 0,
                },
            ))
        }
    }

    pub struct SymphoniaDemuxer {
        shared: Arc<Mutex<Shared>>,
        duration: Option<f64>,
    }

    impl Demuxer for SymphoniaDemuxer {
        fn seekable(&self) -> bool {
            true
        }

        fn seek(&mut self, target: f64, flags: SeekFlags) {
            let mut shared = self.shared.lock();
            let mode = if flags.contains(SeekFlags::HR) {
                SeekMode::Accurate
            } else {
                SeekMode::Coarse
            };
            let track_id = shared.track_id;
            let to = SeekTo::Time {
                time: Time::from(target.max(0.0)),
                track_id: Some(track_id),
            };
            match shared.reader.seek(mode, to) {
                Ok(seeked) => {
                    let pts = shared.ts_to_secs(seeked.actual_ts);
                    shared.last_pts = pts;
                    shared.eof = false;
                }
                Err(e) => tracing::warn!("Seek to {:.3} failed: {}", target, e),
            }
        }

        fn reader_state(&self) -> ReaderState {
            let shared = self.shared.lock();
            let remaining = match (self.duration, shared.last_pts) {
                (Some(d), Some(p)) => (d - p).max(0.0),
                _ => 0.0,
            };
            // Local files are always fully available
            ReaderState {
                idle: true,
                underrun: false,
                buffered_duration: remaining,
                time_range: shared.last_pts.zip(self.duration),
            }
        }

        fn duration(&self) -> Option<f64> {
            self.duration
        }

        fn current_pts(&self) -> Option<f64> {
            self.shared.lock().last_pts
        }
    }

    pub struct SymphoniaDecoder {
        shared: Arc<Mutex<Shared>>,
        decoder: Box<dyn Decoder>,
        spec: Option<SignalSpec>,
        /// Block decoded past a format change, kept for after the reinit
        pending: Option<(SignalSpec, Option<f64>, Vec<f32>)>,
        pts: Option<f64>,
        pts_offset: usize,
    }

    impl SymphoniaDecoder {
        fn format_of(spec: &SignalSpec) -> AudioFormat {
            AudioFormat::pcm(spec.rate, spec.channels.count())
        }

        fn append(&mut self, out: &mut AudioBuffer, pts: Option<f64>, samples: &[f32]) {
            let frames = samples.len() / out.channels();
            match pts {
                Some(pts) => {
                    self.pts = Some(pts);
                    self.pts_offset = frames;
                }
                None => self.pts_offset += frames,
            }
            out.push(samples);
        }

        /// Read and decode one packet of our track
        fn next_block(&mut self) -> Result<Option<(SignalSpec, Option<f64>, Vec<f32>)>, DecodeError> {
            let mut shared = self.shared.lock();
            loop {
                let packet = match shared.reader.next_packet() {
                    Ok(p) => p,
                    Err(SymphoniaError::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        shared.eof = true;
                        return Ok(None);
                    }
                    Err(SymphoniaError::ResetRequired) => {
                        self.decoder.reset();
                        continue;
                    }
                    Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
                };
                if packet.track_id() != shared.track_id {
                    continue;
                }
                let pts = shared.ts_to_secs(packet.ts());
                shared.last_pts = pts;

                let decoded = self
                    .decoder
                    .decode(&packet)
                    .map_err(|e| DecodeError::DecodeFailed(e.to_string()))?;
                let spec = *decoded.spec();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                return Ok(Some((spec, pts, buf.samples().to_vec())));
            }
        }
    }

    impl AudioDecoder for SymphoniaDecoder {
        fn probe(&mut self) -> Result<Option<AudioFormat>, DecodeError> {
            if let Some((spec, _, _)) = &self.pending {
                self.spec = Some(*spec);
                return Ok(Some(Self::format_of(spec)));
            }
            if let Some(spec) = &self.spec {
                return Ok(Some(Self::format_of(spec)));
            }
            match self.next_block()? {
                Some(block) => {
                    self.spec = Some(block.0);
                    let fmt = Self::format_of(&block.0);
                    self.pending = Some(block);
                    Ok(Some(fmt))
                }
                None => Ok(None),
            }
        }

        fn decode(
            &mut self,
            out: &mut AudioBuffer,
            min_frames: usize,
        ) -> Result<DecodeStatus, DecodeError> {
            while out.frames() < min_frames {
                let (spec, pts, samples) = match self.pending.take() {
                    Some(block) => block,
                    None => match self.next_block()? {
                        Some(block) => block,
                        None => return Ok(DecodeStatus::Eof),
                    },
                };
                if self.spec != Some(spec) {
                    self.pending = Some((spec, pts, samples));
                    return Ok(DecodeStatus::NewFormat);
                }
                self.append(out, pts, &samples);
            }
            Ok(DecodeStatus::Ok)
        }

        fn reset(&mut self) {
            self.decoder.reset();
            self.pending = None;
            self.pts = None;
            self.pts_offset = 0;
        }

        fn pts(&self) -> Option<f64> {
            self.pts
        }

        fn pts_offset(&self) -> usize {
            self.pts_offset
        }
    }
}
