use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1000;

/// Bounded FIFO of decoded frames. Oldest frames are evicted first.
#[derive(Debug)]
pub struct HistoryBuffer {
    frames: VecDeque<Arc<Frame>>,
    capacity: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Appends `frame`, returning the evicted frame if the buffer was full.
    pub fn push(&mut self, frame: Arc<Frame>) -> Option<Arc<Frame>> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.frames.back().cloned()
    }

    /// Up to `limit` most recent frames, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<Frame>> {
        let skip = self.frames.len().saturating_sub(limit);
        self.frames.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Frame>> {
        self.frames.iter()
    }

    /// Empties the buffer and returns how many frames it held.
    pub fn clear(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn heap_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.heap_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Acquisition;

    fn frame(seq: u64) -> Arc<Frame> {
        let mut f = Frame::new(
            vec![-90.0; 4],
            Acquisition {
                center_frequency: 1.0e6,
                sample_rate: 1.0e5,
            },
        );
        f.seq = seq;
        Arc::new(f)
    }

    #[test]
    fn keeps_only_the_most_recent_frames_in_order() {
        let mut buf = HistoryBuffer::new(1000);
        for seq in 1..=1500 {
            buf.push(frame(seq));
        }
        assert_eq!(buf.len(), 1000);
        let seqs: Vec<u64> = buf.iter().map(|f| f.seq).collect();
        let expected: Vec<u64> = (501..=1500).collect();
        assert_eq!(seqs, expected);
        assert_eq!(buf.latest().map(|f| f.seq), Some(1500));
    }

    #[test]
    fn push_reports_evicted_frame() {
        let mut buf = HistoryBuffer::new(2);
        assert!(buf.push(frame(1)).is_none());
        assert!(buf.push(frame(2)).is_none());
        assert_eq!(buf.push(frame(3)).map(|f| f.seq), Some(1));
    }

    #[test]
    fn recent_returns_tail_oldest_first() {
        let mut buf = HistoryBuffer::new(10);
        for seq in 1..=5 {
            buf.push(frame(seq));
        }
        let seqs: Vec<u64> = buf.recent(3).iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(buf.recent(100).len(), 5);
    }

    #[test]
    fn clear_empties_and_reports_previous_size() {
        let mut buf = HistoryBuffer::new(10);
        buf.push(frame(1));
        buf.push(frame(2));
        assert_eq!(buf.clear(), 2);
        assert!(buf.is_empty());
        assert!(buf.latest().is_none());
    }
}
