//! Recently decoded video pts, tagged with the seek generation they were
//! decoded in. Backstep uses it to find the frame before the current one
//! without re-reading the file.

use std::collections::VecDeque;

pub const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    pts: f64,
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct PtsHistory {
    /// Newest first
    entries: VecDeque<Entry>,
    /// Bumped on every seek and every discontinuity
    generation: u64,
}

impl Default for PtsHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl PtsHistory {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_HISTORY),
            generation: 1,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new generation; older entries stay for reference but never
    /// pair with newer ones.
    pub fn mark_discontinuity(&mut self) {
        self.generation += 1;
    }

    /// Record a decoded frame. Unknown pts, or frames decoded while the
    /// decoder may skip frames, break continuity instead.
    pub fn add(&mut self, pts: Option<f64>, framedrop: bool) {
        let pts = match pts {
            Some(pts) if !framedrop => pts,
            _ => {
                self.mark_discontinuity();
                return;
            }
        };
        if self.entries.front().map(|e| e.pts) == Some(pts) {
            return;
        }
        if self.entries.len() == MAX_HISTORY {
            self.entries.pop_back();
        }
        self.entries.push_front(Entry {
            pts,
            generation: self.generation,
        });
    }

    /// Pts of the frame decoded right before `pts`, if both were decoded
    /// contiguously.
    pub fn find_previous(&self, pts: f64) -> Option<f64> {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .find(|(cur, prev)| cur.pts == pts && cur.generation == prev.generation)
            .map(|(_, prev)| prev.pts)
    }

    /// Newest pts, if it belongs to the current generation
    pub fn last_frame(&self) -> Option<f64> {
        self.entries
            .front()
            .filter(|e| e.generation == self.generation)
            .map(|e| e.pts)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
