use std::sync::atomic::{AtomicU64, Ordering};

use crate::tuning::TunedOp;

const MAX_MODES: usize = 5;

/// Launch and mode-selection counters for one engine.
#[derive(Default)]
pub struct ReduceTelemetry {
    launches: AtomicU64,
    vector_reductions: AtomicU64,
    softmax_calls: AtomicU64,
    temporaries: AtomicU64,
    selections: [[AtomicU64; MAX_MODES]; 4],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub launches: u64,
    pub vector_reductions: u64,
    pub softmax_calls: u64,
    pub temporaries: u64,
    /// `(operation, mode, count)` for every mode selected at least once.
    pub selections: Vec<(&'static str, u8, u64)>,
}

impl ReduceTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_launches(&self, count: u64) {
        if count > 0 {
            self.launches.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_vector(&self) {
        self.vector_reductions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_softmax(&self) {
        self.softmax_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_temporary(&self) {
        self.temporaries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_selection(&self, op: TunedOp, mode: u8) {
        if let Some(slot) = self.selections[op.slot()].get(mode as usize) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn selections(&self, op: TunedOp, mode: u8) -> u64 {
        self.selections[op.slot()]
            .get(mode as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.launches.store(0, Ordering::Relaxed);
        self.vector_reductions.store(0, Ordering::Relaxed);
        self.softmax_calls.store(0, Ordering::Relaxed);
        self.temporaries.store(0, Ordering::Relaxed);
        for per_op in &self.selections {
            for slot in per_op {
                slot.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut selections = Vec::new();
        for op in TunedOp::ALL {
            for mode in op.modes() {
                let count = self.selections(op, mode);
                if count > 0 {
                    selections.push((op.name(), mode, count));
                }
            }
        }
        TelemetrySnapshot {
            launches: self.launches.load(Ordering::Relaxed),
            vector_reductions: self.vector_reductions.load(Ordering::Relaxed),
            softmax_calls: self.softmax_calls.load(Ordering::Relaxed),
            temporaries: self.temporaries.load(Ordering::Relaxed),
            selections,
        }
    }
}
