use std::collections::VecDeque;

/// Mean over the most recent `len` samples.
///
/// Unlike a zero-primed filter, the mean only covers samples actually inserted,
/// so a fresh window does not read low.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    buf: VecDeque<f64>,
    sum: f64,
    len: usize,
}

impl MovingAverage {
    pub fn new(len: usize) -> Self {
        let len = len.max(1);
        Self {
            buf: VecDeque::with_capacity(len),
            sum: 0.0,
            len,
        }
    }

    pub fn insert(&mut self, v: f64) -> f64 {
        if self.buf.len() == self.len {
            self.sum -= self.buf.pop_front().unwrap_or(0.0);
        }
        self.buf.push_back(v);
        self.sum += v;
        self.get()
    }

    pub fn get(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        self.sum / self.buf.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_only_the_window() {
        let mut ma = MovingAverage::new(3);
        assert_eq!(ma.get(), 0.0);
        ma.insert(3.0);
        assert_eq!(ma.get(), 3.0);
        ma.insert(6.0);
        ma.insert(9.0);
        assert_eq!(ma.get(), 6.0);
        ma.insert(12.0);
        assert_eq!(ma.get(), 9.0);
    }
}
