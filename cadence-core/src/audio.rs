//! Audio Output
//!
//! The sink interface the fill loop writes to, plus a cpal device sink
//! (feature `audio`).

use bitflags::bitflags;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Types
// ============================================================================

/// Sample format negotiated between decoder and sink. Samples are always
/// interleaved `f32`; passthrough carries compressed frames packed into
/// the same layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: usize,
    /// Compressed audio sent untouched to the device
    pub passthrough: bool,
    /// Frame counts written to the sink must be a multiple of this
    pub align: usize,
}

impl AudioFormat {
    pub fn pcm(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            passthrough: false,
            align: 1,
        }
    }

    /// Round `frames` down to the alignment granularity
    pub fn align_down(&self, frames: usize) -> usize {
        let align = self.align.max(1);
        frames / align * align
    }

    /// Round a signed count towards zero to the alignment granularity
    pub fn align_signed(&self, frames: i64) -> i64 {
        let align = self.align.max(1) as i64;
        frames / align * align
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlayFlags: u32 {
        /// No more data follows; the sink may flush a partial period
        const FINAL_CHUNK = 1 << 0;
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Passthrough not supported by the output device")]
    PassthroughRejected,
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("No output device")]
    NoDevice,
    #[error("Audio device error: {0}")]
    Device(String),
}

pub trait AudioSink: Send {
    /// Open the device for `format`. Returns the format actually in use.
    fn open(&mut self, format: &AudioFormat) -> Result<AudioFormat, SinkError>;

    /// Tear the device down, dropping queued data
    fn close(&mut self);

    /// Current format, `None` while closed
    fn format(&self) -> Option<AudioFormat>;

    /// Frames that can be written without blocking
    fn space(&self) -> usize;

    /// Seconds until a frame written now becomes audible
    fn delay(&self) -> f64;

    /// Queue interleaved samples; returns accepted frames
    fn play(&mut self, samples: &[f32], flags: PlayFlags) -> usize;

    /// Drop queued data
    fn reset(&mut self);

    /// Block until queued data is audible
    fn drain(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    /// The device changed and the sink should be reopened. Reading clears it.
    fn take_reload_request(&mut self) -> bool {
        false
    }

    /// Everything queued has been played
    fn eof_reached(&self) -> bool;
}

// ============================================================================
// cpal Sink
// ============================================================================

#[cfg(feature = "audio")]
pub use device::CpalSink;

#[cfg(feature = "audio")]
mod device {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use ringbuf::traits::{Consumer, Observer, Producer, Split};
    use ringbuf::{HeapCons, HeapProd, HeapRb};

    /// Seconds of audio the ring holds
    const RING_SECONDS: f64 = 0.5;
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

    enum StreamCtl {
        Play,
        Pause,
        Close,
    }

    /// Default output device fed through a lock-free ring.
    ///
    /// `cpal::Stream` is not `Send`, so it lives on a small control thread
    /// and is driven through a channel.
    pub struct CpalSink {
        producer: Option<HeapProd<f32>>,
        format: Option<AudioFormat>,
        control: Option<mpsc::Sender<StreamCtl>>,
        thread: Option<thread::JoinHandle<()>>,
        flush: Arc<AtomicBool>,
        device_lost: Arc<AtomicBool>,
    }

    impl Default for CpalSink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CpalSink {
        pub fn new() -> Self {
            Self {
                producer: None,
                format: None,
                control: None,
                thread: None,
                flush: Arc::new(AtomicBool::new(false)),
                device_lost: Arc::new(AtomicBool::new(false)),
            }
        }

        fn send(&self, ctl: StreamCtl) {
            if let Some(tx) = &self.control {
                let _ = tx.send(ctl);
            }
        }
    }

    fn build_stream(
        format: AudioFormat,
        mut consumer: HeapCons<f32>,
        flush: Arc<AtomicBool>,
        device_lost: Arc<AtomicBool>,
    ) -> Result<cpal::Stream, SinkError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(SinkError::NoDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| SinkError::Device(e.to_string()))?;
        if supported.sample_format() != SampleFormat::F32 {
            return Err(SinkError::UnsupportedFormat(format!(
                "{:?} output",
                supported.sample_format()
            )));
        }

        let config = StreamConfig {
            channels: format.channels as u16,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_fn = move |err| {
            tracing::warn!("Audio stream error: {}", err);
            device_lost.store(true, Ordering::SeqCst);
        };

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if flush.swap(false, Ordering::SeqCst) {
                        consumer.clear();
                    }
                    let n = consumer.pop_slice(data);
                    data[n..].fill(0.0);
                },
                err_fn,
                None,
            )
            .map_err(|e| SinkError::Device(e.to_string()))
    }

    impl AudioSink for CpalSink {
        fn open(&mut self, format: &AudioFormat) -> Result<AudioFormat, SinkError> {
            if format.passthrough {
                return Err(SinkError::PassthroughRejected);
            }
            self.close();

            let capacity =
                (f64::from(format.sample_rate) * RING_SECONDS) as usize * format.channels;
            let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();

            let (ctl_tx, ctl_rx) = mpsc::channel();
            let (ready_tx, ready_rx) = mpsc::channel();
            let fmt = *format;
            let flush = self.flush.clone();
            let device_lost = self.device_lost.clone();

            let handle = thread::Builder::new()
                .name("cadence-audio".into())
                .spawn(move || {
                    let stream = match build_stream(fmt, consumer, flush, device_lost) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    while let Ok(ctl) = ctl_rx.recv() {
                        let res = match ctl {
                            StreamCtl::Play => stream.play().map_err(|e| e.to_string()),
                            StreamCtl::Pause => stream.pause().map_err(|e| e.to_string()),
                            StreamCtl::Close => break,
                        };
                        if let Err(e) = res {
                            tracing::warn!("Audio stream control failed: {}", e);
                        }
                    }
                })
                .map_err(|e| SinkError::Device(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = handle.join();
                    return Err(e);
                }
                Err(_) => {
                    let _ = handle.join();
                    return Err(SinkError::Device("audio thread exited".into()));
                }
            }

            self.producer = Some(producer);
            self.control = Some(ctl_tx);
            self.thread = Some(handle);
            self.format = Some(*format);
            self.send(StreamCtl::Play);
            tracing::info!(
                "Audio output opened: {} Hz, {} ch",
                format.sample_rate,
                format.channels
            );
            Ok(*format)
        }

        fn close(&mut self) {
            self.send(StreamCtl::Close);
            self.control = None;
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            self.producer = None;
            self.format = None;
        }

        fn format(&self) -> Option<AudioFormat> {
            self.format
        }

        fn space(&self) -> usize {
            match (&self.producer, &self.format) {
                (Some(p), Some(f)) => p.vacant_len() / f.channels,
                _ => 0,
            }
        }

        fn delay(&self) -> f64 {
            match (&self.producer, &self.format) {
                (Some(p), Some(f)) => {
                    (p.occupied_len() / f.channels) as f64 / f64::from(f.sample_rate)
                }
                _ => 0.0,
            }
        }

        fn play(&mut self, samples: &[f32], _flags: PlayFlags) -> usize {
            let (Some(producer), Some(format)) = (&mut self.producer, &self.format) else {
                return 0;
            };
            let room = producer.vacant_len() / format.channels * format.channels;
            let len = samples.len().min(room);
            producer.push_slice(&samples[..len]) / format.channels
        }

        fn reset(&mut self) {
            self.flush.store(true, Ordering::SeqCst);
        }

        fn drain(&mut self) {
            let start = Instant::now();
            while !self.eof_reached() && start.elapsed() < DRAIN_TIMEOUT {
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn pause(&mut self) {
            self.send(StreamCtl::Pause);
        }

        fn resume(&mut self) {
            self.send(StreamCtl::Play);
        }

        fn take_reload_request(&mut self) -> bool {
            self.device_lost.swap(false, Ordering::SeqCst)
        }

        fn eof_reached(&self) -> bool {
            self.producer.as_ref().map_or(true, |p| p.is_empty())
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.close();
        }
    }
}
