use std::collections::VecDeque;

use crate::types::{MAX_HISTORY, StepRecord};

/// The agent's short-term memory: the last few steps, oldest first.
#[derive(Debug, Clone)]
pub struct StepHistory {
    records: VecDeque<StepRecord>,
    capacity: usize,
}

impl Default for StepHistory {
    fn default() -> Self {
        Self::with_capacity(MAX_HISTORY)
    }
}

impl StepHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append, evicting the oldest record once over capacity.
    pub fn push(&mut self, record: StepRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn last(&self) -> Option<&StepRecord> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn to_vec(&self) -> Vec<StepRecord> {
        self.records.iter().cloned().collect()
    }

    /// One line per step, for the prompt.
    pub fn render(&self) -> String {
        if self.records.is_empty() {
            return "No previous actions.".to_string();
        }
        self.records
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
