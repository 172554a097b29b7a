use std::collections::VecDeque;

/// Sliding sum over the last `capacity` frame contributions.
///
/// `count()` never exceeds the capacity; once full, each push retires the
/// oldest contribution first.
pub struct RunningWindow {
    contributions: VecDeque<Vec<Vec<f64>>>, // frame -> channel -> samples
    sum: Vec<Vec<f64>>,
    capacity: usize,
    retired_since_rebuild: usize,
}

impl RunningWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            contributions: VecDeque::with_capacity(capacity),
            sum: Vec::new(),
            capacity,
            retired_since_rebuild: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.contributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    pub fn sum(&self) -> &[Vec<f64>] {
        &self.sum
    }

    pub fn clear(&mut self) {
        self.contributions.clear();
        self.sum.clear();
        self.retired_since_rebuild = 0;
    }

    /// Shrinking retires the oldest contributions right away.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.contributions.len() > self.capacity {
            self.retire_oldest();
        }
    }

    pub fn push(&mut self, traces: &[Vec<f64>]) {
        if self.contributions.len() == self.capacity {
            self.retire_oldest();
        }
        if self.sum.is_empty() {
            self.sum = traces.iter().map(|c| vec![0.0; c.len()]).collect();
        }
        for (acc, channel) in self.sum.iter_mut().zip(traces) {
            for (a, v) in acc.iter_mut().zip(channel) {
                *a += v;
            }
        }
        self.contributions.push_back(traces.to_vec());
    }

    pub fn mean(&self) -> Vec<Vec<f64>> {
        let n = self.count().max(1) as f64;
        self.sum
            .iter()
            .map(|channel| channel.iter().map(|v| v / n).collect())
            .collect()
    }

    fn retire_oldest(&mut self) {
        let Some(oldest) = self.contributions.pop_front() else {
            return;
        };
        if self.contributions.is_empty() {
            self.sum.clear();
            self.retired_since_rebuild = 0;
            return;
        }
        for (acc, channel) in self.sum.iter_mut().zip(&oldest) {
            for (a, v) in acc.iter_mut().zip(channel) {
                *a -= v;
            }
        }
        // Re-sum once per full turn of the window so subtraction error stays bounded.
        self.retired_since_rebuild += 1;
        if self.retired_since_rebuild >= self.capacity {
            self.rebuild_sum();
        }
    }

    fn rebuild_sum(&mut self) {
        for acc in self.sum.iter_mut() {
            acc.fill(0.0);
        }
        for contribution in &self.contributions {
            for (acc, channel) in self.sum.iter_mut().zip(contribution) {
                for (a, v) in acc.iter_mut().zip(channel) {
                    *a += v;
                }
            }
        }
        self.retired_since_rebuild = 0;
    }
}
