//! Sliding-window event counter backed by a fixed ring of time buckets
//!
//! Used for log velocity: every handled line is added, and the number of
//! lines over the last N milliseconds is read back with bounded memory no
//! matter how long the service runs.

/// Upper bound on the number of buckets ("bags") per counter
pub const MAX_BAG_COUNT: usize = 1000;

/// Rate counter over a sliding time window.
///
/// The window is split into at most [`MAX_BAG_COUNT`] bags of equal width.
/// Adding an event increments the current bag; time passing rotates the ring
/// and zeroes the bags that fell out of the window.
#[derive(Debug, Clone)]
pub struct HistoricCount {
    duration_ms: u64,
    bag_duration_ms: u64,
    bags: Vec<u64>,
    last_bag_index: usize,
    start_time: u64,
}

impl HistoricCount {
    /// Create a counter spanning `duration_ms` with buckets of
    /// `resolution_ms`, starting at `now_ms`
    pub fn new(duration_ms: u64, resolution_ms: u64, now_ms: u64) -> Self {
        let duration_ms = duration_ms.max(1);
        let resolution_ms = resolution_ms.max(1);
        let bag_count = ((duration_ms / resolution_ms) as usize).clamp(1, MAX_BAG_COUNT);
        let mut count = Self {
            duration_ms,
            bag_duration_ms: duration_ms / bag_count as u64,
            bags: vec![0; bag_count],
            last_bag_index: 0,
            start_time: 0,
        };
        count.reset(now_ms);
        count
    }

    /// Total window covered by this counter
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Width of a single bag
    pub fn resolution_ms(&self) -> u64 {
        self.bag_duration_ms
    }

    /// Drop all counts and restart the window at `now_ms`
    pub fn reset(&mut self, now_ms: u64) {
        self.bags.iter_mut().for_each(|bag| *bag = 0);
        self.last_bag_index = self.bags.len() - 1;
        self.start_time = now_ms;
    }

    /// Count `amount` events at `now_ms`
    pub fn add(&mut self, amount: u64, now_ms: u64) {
        self.remove_old_bags(now_ms);
        self.bags[self.last_bag_index] = self.bags[self.last_bag_index].saturating_add(amount);
    }

    /// Number of events over the full window
    pub fn get(&mut self, now_ms: u64) -> u64 {
        self.get_within(self.duration_ms, now_ms)
    }

    /// Number of events over the last `window_ms`; zero for windows shorter
    /// than one bag
    pub fn get_within(&mut self, window_ms: u64, now_ms: u64) -> u64 {
        self.remove_old_bags(now_ms);
        if window_ms < self.bag_duration_ms {
            return 0;
        }

        let mut left_ms = window_ms;
        let mut index = self.last_bag_index;
        let mut count = 0u64;
        for _ in 0..self.bags.len() {
            if left_ms == 0 {
                break;
            }
            count = count.saturating_add(self.bags[index]);
            left_ms = left_ms.saturating_sub(self.bag_duration_ms);
            index = if index == 0 { self.bags.len() - 1 } else { index - 1 };
        }
        count
    }

    fn remove_old_bags(&mut self, now_ms: u64) {
        let age = now_ms.saturating_sub(self.start_time);
        let bags_needed = age / self.bag_duration_ms;
        if bags_needed == 0 {
            return;
        }
        let rest = age - bags_needed * self.bag_duration_ms;
        let len = self.bags.len();
        for _ in 0..bags_needed.min(len as u64) {
            self.last_bag_index = (self.last_bag_index + 1) % len;
            self.bags[self.last_bag_index] = 0;
        }
        if bags_needed > len as u64 {
            // whole ring was cleared; keep the bag phase consistent
            let skipped = ((bags_needed - len as u64) % len as u64) as usize;
            self.last_bag_index = (self.last_bag_index + skipped) % len;
        }
        self.start_time = now_ms - rest;
    }
}
