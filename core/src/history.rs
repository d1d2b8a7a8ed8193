//! Timeline of service states
//!
//! The history is a ring of rows, one per resolution interval. Each row has
//! one entry per service holding the states that service went through while
//! the row was current, recording changes only. A row of `"OWS,R"` means the
//! first service went from OFF through WAITING to STARTING while the second
//! stayed RUNNING.

use crate::clock::SharedClock;
use schema::ServiceState;
use std::collections::{BTreeMap, VecDeque};

/// Time covered by the history
pub const HISTORY_DURATION_MS: u64 = 24 * 60 * 60 * 1_000;

/// Width of one history row
pub const HISTORY_RESOLUTION_MS: u64 = 5 * 60 * 1_000;

/// One resolution interval of the timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    /// Start of the interval in epoch milliseconds
    pub time: u64,
    /// Per service, the distinct consecutive states seen in the interval
    pub items: Vec<Vec<ServiceState>>,
}

impl HistoryRow {
    fn new(time: u64, states: &[ServiceState]) -> Self {
        Self {
            time,
            items: states.iter().map(|s| vec![*s]).collect(),
        }
    }

    /// Comma-separated state letters, one group per service
    pub fn letters(&self) -> String {
        self.items
            .iter()
            .map(|states| states.iter().map(ServiceState::letter).collect::<String>())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Bounded timeline of the states of all services
#[derive(Debug)]
pub struct ServicesStateHistory {
    clock: SharedClock,
    resolution_ms: u64,
    max_rows: usize,
    rows: VecDeque<HistoryRow>,
}

impl ServicesStateHistory {
    /// History with the default 24 hour window and 5 minute rows
    pub fn new(clock: SharedClock) -> Self {
        Self::with_window(clock, HISTORY_DURATION_MS, HISTORY_RESOLUTION_MS)
    }

    /// History keeping `duration_ms` worth of rows of `resolution_ms` each
    pub fn with_window(clock: SharedClock, duration_ms: u64, resolution_ms: u64) -> Self {
        let resolution_ms = resolution_ms.max(1);
        Self {
            clock,
            resolution_ms,
            max_rows: ((duration_ms / resolution_ms) as usize).max(1),
            rows: VecDeque::new(),
        }
    }

    /// Rows, oldest first
    pub fn rows(&self) -> impl Iterator<Item = &HistoryRow> {
        self.rows.iter()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no row was recorded yet
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Record the current states, given in service order.
    ///
    /// Opens a new row when the current one is older than the resolution;
    /// otherwise appends each state that differs from the last one recorded
    /// for that service.
    pub fn update(&mut self, states: &[ServiceState]) {
        let now = self.clock.now_ms();
        let needs_row = match self.rows.back() {
            None => true,
            Some(row) => now.saturating_sub(row.time) > self.resolution_ms,
        };
        if needs_row {
            self.rows.push_back(HistoryRow::new(now, states));
            while self.rows.len() > self.max_rows {
                self.rows.pop_front();
            }
            return;
        }

        let Some(row) = self.rows.back_mut() else {
            return;
        };
        if row.items.len() < states.len() {
            row.items.resize_with(states.len(), Vec::new);
        }
        for (item, state) in row.items.iter_mut().zip(states) {
            if item.last() != Some(state) {
                item.push(*state);
            }
        }
    }

    /// Remap all rows after the service list changed.
    ///
    /// `old_to_new[i]` is the new index of the service that had index `i`, or
    /// `None` when it was removed. Entries of added services start empty.
    pub fn services_were_updated(&mut self, old_to_new: &[Option<usize>], new_len: usize) {
        for row in &mut self.rows {
            let mut items = vec![Vec::new(); new_len];
            for (old_index, old_states) in row.items.drain(..).enumerate() {
                if let Some(Some(new_index)) = old_to_new.get(old_index) {
                    if let Some(slot) = items.get_mut(*new_index) {
                        *slot = old_states;
                    }
                }
            }
            row.items = items;
        }
    }

    /// Row start time to row letters
    pub fn as_time_to_string(&self) -> BTreeMap<u64, String> {
        self.rows.iter().map(|r| (r.time, r.letters())).collect()
    }

    /// The most recent row as `(time, letters)`
    pub fn last_row_string(&self) -> Option<(u64, String)> {
        self.rows.back().map(|r| (r.time, r.letters()))
    }
}
