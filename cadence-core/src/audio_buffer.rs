//! # Audio Output Buffer
//!
//! Decoded, not yet played audio in sink format (interleaved `f32`).
//! All counts are in frames (one sample per channel).
//!
//! Storage is a `Vec` with a moving read offset so that reads are always
//! contiguous and skipping is free; the consumed prefix is reclaimed lazily.

#[derive(Debug, Clone)]
pub struct AudioBuffer {
    channels: usize,
    data: Vec<f32>,
    /// Index of the first unread sample in `data`
    start: usize,
}

impl AudioBuffer {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            data: Vec::new(),
            start: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Switch channel layout, dropping buffered data
    pub fn reconfigure(&mut self, channels: usize) {
        self.channels = channels.max(1);
        self.clear();
    }

    pub fn frames(&self) -> usize {
        (self.data.len() - self.start) / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn seconds(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(sample_rate)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    /// Append interleaved samples. A trailing partial frame is ignored.
    pub fn push(&mut self, samples: &[f32]) {
        let whole = samples.len() - samples.len() % self.channels;
        self.data.extend_from_slice(&samples[..whole]);
    }

    pub fn push_silence(&mut self, frames: usize) {
        self.data
            .resize(self.data.len() + frames * self.channels, 0.0);
    }

    /// Drop up to `frames` from the front; returns how many were dropped
    pub fn skip(&mut self, frames: usize) -> usize {
        let n = frames.min(self.frames());
        self.start += n * self.channels;
        self.compact();
        n
    }

    /// Insert `frames` of silence before the buffered data
    pub fn prepend_silence(&mut self, frames: usize) {
        let len = frames * self.channels;
        if self.start >= len {
            self.start -= len;
            self.data[self.start..self.start + len].fill(0.0);
        } else {
            let mut data = Vec::with_capacity(len + self.data.len() - self.start);
            data.resize(len, 0.0);
            data.extend_from_slice(&self.data[self.start..]);
            self.data = data;
            self.start = 0;
        }
    }

    /// Repeat the first `frames` buffered frames (bounded by what is
    /// buffered); returns how many were duplicated
    pub fn duplicate(&mut self, frames: usize) -> usize {
        let n = frames.min(self.frames());
        if n == 0 {
            return 0;
        }
        self.prepend_silence(n);
        let len = n * self.channels;
        let (head, tail) = self.data[self.start..].split_at_mut(len);
        head.copy_from_slice(&tail[..len]);
        n
    }

    /// Borrow up to `frames` frames from the front without consuming them
    pub fn peek(&self, frames: usize) -> &[f32] {
        let n = frames.min(self.frames());
        &self.data[self.start..self.start + n * self.channels]
    }

    fn compact(&mut self) {
        if self.start == self.data.len() {
            self.clear();
        } else if self.start > 0 && self.start * 2 > self.data.len() {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, channels: usize) -> Vec<f32> {
        (0..frames * channels).map(|i| i as f32).collect()
    }

    #[test]
    fn test_push_and_frames() {
        let mut buf = AudioBuffer::new(2);
        buf.push(&ramp(10, 2));
        buf.push(&[1.0, 2.0, 3.0]); // one whole frame, one stray sample
        assert_eq!(buf.frames(), 11);
        assert_eq!(buf.seconds(11), 1.0);
    }

    #[test]
    fn test_skip_bounded() {
        let mut buf = AudioBuffer::new(2);
        buf.push(&ramp(4, 2));
        assert_eq!(buf.skip(1), 1);
        assert_eq!(buf.peek(1), &[2.0, 3.0]);
        assert_eq!(buf.skip(10), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_prepend_silence_reuses_skipped_space() {
        let mut buf = AudioBuffer::new(1);
        buf.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        buf.skip(2);
        buf.prepend_silence(1);
        assert_eq!(buf.peek(10), &[0.0, 3.0, 4.0, 5.0, 6.0]);

        buf.prepend_silence(3);
        assert_eq!(buf.frames(), 8);
        assert_eq!(buf.peek(5), &[0.0, 0.0, 0.0, 0.0, 3.0]);
    }

    #[test]
    fn test_duplicate_repeats_head() {
        let mut buf = AudioBuffer::new(2);
        buf.push(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        assert_eq!(buf.duplicate(2), 2);
        assert_eq!(
            buf.peek(5),
            &[1.0, -1.0, 2.0, -2.0, 1.0, -1.0, 2.0, -2.0, 3.0, -3.0]
        );
        assert_eq!(buf.duplicate(100), 5);
        assert_eq!(buf.frames(), 10);
    }

    #[test]
    fn test_reconfigure_clears() {
        let mut buf = AudioBuffer::new(2);
        buf.push(&ramp(8, 2));
        buf.reconfigure(6);
        assert_eq!(buf.channels(), 6);
        assert!(buf.is_empty());
    }
}
