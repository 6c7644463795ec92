//! Region Utilities
//!
//! Screen-space rectangles exchanged with the backend, and the ignore list
//! that suppresses expected protocol errors from self-issued requests
//! (e.g. destroying a region for a window that is being destroyed by the
//! server at the same time).

use std::collections::VecDeque;

/// Screen-space rectangle, the unit of damage exchanged with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && py >= self.y
            && px < self.x + self.width as i32
            && py < self.y + self.height as i32
    }

    /// Smallest rectangle covering both `self` and `other`.
    pub fn union(&self, other: &Rect) -> Rect {
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = (self.x + self.width as i32).max(other.x + other.width as i32);
        let y1 = (self.y + self.height as i32).max(other.y + other.height as i32);
        Rect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32)
    }
}

/// Sequence numbers of outstanding self-issued requests whose protocol
/// errors are expected and must not be reported.
///
/// X11 errors carry only the low 16 bits of the request sequence, so the
/// comparison is wrap-aware. Entries are discarded once an error with a
/// newer sequence has been seen; an entry equal to the incoming sequence is
/// kept so that multiple errors from the same request all match.
#[derive(Debug, Default)]
pub struct IgnoreList {
    seqs: VecDeque<u16>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the sequence number of a request that may legitimately fail.
    pub fn record(&mut self, sequence: u64) {
        self.seqs.push_back(sequence as u16);
    }

    /// Whether an error carrying `sequence` came from a recorded request.
    pub fn should_ignore(&mut self, sequence: u16) -> bool {
        while let Some(&front) = self.seqs.front() {
            if front == sequence {
                return true;
            }
            // Entries strictly older than the error can no longer match.
            if sequence.wrapping_sub(front) < 0x8000 {
                self.seqs.pop_front();
            } else {
                return false;
            }
        }
        false
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
}
