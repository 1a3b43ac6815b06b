use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::bucket::bucket;
use super::table::{CostTable, TableStore};
use super::TunedOp;
use crate::device::Event;
use crate::error::{ReduceError, Result};
use crate::ops::ReductionEngine;

/// Problem dimensions a tuned operation exposes to the cost model.
pub trait TunedArgs {
    /// Table key dimensions before bucketing: `(rows, cols)` or `(rows, cols, classes)`.
    fn dims(&self) -> SmallVec<[u64; 3]>;
    /// Length of the reduced axis, used by the single-group preference.
    fn reduced_len(&self) -> u64;
}

/// One implementation mode of a tuned operation.
pub trait Strategy<A>: Send + Sync {
    fn mode(&self) -> u8;
    /// Whether this mode can run `args` on the engine's device at all.
    fn supports(&self, engine: &ReductionEngine, args: &A) -> bool;
    fn execute(&self, engine: &ReductionEngine, args: &A, wait: &[Event]) -> Result<Event>;
}

/// Lowest finite cost wins; ties keep the earlier entry. All-infinite yields `default`.
pub fn select_mode(costs: &[(u8, f64)], default: u8) -> u8 {
    let mut best: Option<(u8, f64)> = None;
    for &(mode, cost) in costs {
        if !cost.is_finite() {
            continue;
        }
        match best {
            Some((_, b)) if cost >= b => {}
            _ => best = Some((mode, cost)),
        }
    }
    best.map(|(mode, _)| mode).unwrap_or(default)
}

/// Lazily loaded cost tables, one per `(operation, mode)`.
pub struct CostModel {
    store: TableStore,
    tables: Mutex<HashMap<(TunedOp, u8), Option<Arc<CostTable>>>>,
}

impl CostModel {
    pub fn new(store: TableStore) -> Self {
        Self {
            store,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn table(&self, op: TunedOp, mode: u8) -> Option<Arc<CostTable>> {
        let mut tables = self.tables.lock().ok()?;
        if let Some(cached) = tables.get(&(op, mode)) {
            return cached.clone();
        }
        let loaded = match self.store.load(op.name(), mode) {
            Ok(table) => table.map(Arc::new),
            Err(err) => {
                log::warn!("cost table {op}/mode{mode} unreadable: {err}");
                None
            }
        };
        tables.insert((op, mode), loaded.clone());
        loaded
    }

    /// Install a table in memory without touching the store.
    pub fn install(&self, op: TunedOp, mode: u8, table: CostTable) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.insert((op, mode), Some(Arc::new(table)));
        }
    }

    /// Forget loaded tables so the next lookup re-reads the store.
    pub fn invalidate(&self) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.clear();
        }
    }

    /// Predicted seconds; a missing entry or a stored `0` is `+inf`.
    pub fn cost(&self, op: TunedOp, mode: u8, dims: &[u64]) -> f64 {
        let key: SmallVec<[u32; 3]> = dims.iter().map(|&d| bucket(d)).collect();
        match self.table(op, mode).and_then(|t| t.get(&key)) {
            Some(seconds) if seconds > 0.0 && seconds.is_finite() => seconds,
            _ => f64::INFINITY,
        }
    }

    /// Pick a mode among those `supports` admits.
    ///
    /// Falls back to mode 0, or the lowest supported mode, when no candidate has a
    /// finite cost. For axis reductions a winning mode 2 yields to mode 1 whenever
    /// the reduced axis fits one work-group and mode 1 has been measured.
    pub fn choose(
        &self,
        op: TunedOp,
        dims: &[u64],
        reduced_len: u64,
        workgroup: u32,
        supports: impl Fn(u8) -> bool,
    ) -> Option<u8> {
        let candidates: SmallVec<[(u8, f64); 5]> = op
            .modes()
            .filter(|&m| supports(m))
            .map(|m| (m, self.cost(op, m, dims)))
            .collect();
        let default = candidates.first()?.0;
        let mut mode = select_mode(&candidates, default);
        if mode == 2
            && op.prefers_single_group()
            && reduced_len <= workgroup as u64
            && candidates
                .iter()
                .any(|&(m, c)| m == 1 && c.is_finite())
        {
            log::trace!("{op}: len {reduced_len} fits one group, preferring mode 1 over mode 2");
            mode = 1;
        }
        log::trace!("{op}: dims {dims:?} costs {candidates:?} -> mode {mode}");
        Some(mode)
    }
}

/// Ordered strategy table for one tuned operation.
pub struct Dispatcher<A> {
    op: TunedOp,
    strategies: Vec<Box<dyn Strategy<A>>>,
}

impl<A: TunedArgs> Dispatcher<A> {
    pub fn new(op: TunedOp, mut strategies: Vec<Box<dyn Strategy<A>>>) -> Self {
        strategies.sort_by_key(|s| s.mode());
        Self { op, strategies }
    }

    pub fn op(&self) -> TunedOp {
        self.op
    }

    pub fn modes(&self) -> impl Iterator<Item = u8> + '_ {
        self.strategies.iter().map(|s| s.mode())
    }

    fn strategy(&self, mode: u8) -> Option<&dyn Strategy<A>> {
        self.strategies
            .iter()
            .find(|s| s.mode() == mode)
            .map(|s| s.as_ref())
    }

    /// Mode the dispatching entry point would run for `args`.
    pub fn select(&self, engine: &ReductionEngine, args: &A) -> Result<u8> {
        if let Some(&forced) = engine.options().forced_modes.get(self.op.name()) {
            log::trace!("{}: mode {forced} forced by configuration", self.op);
            return Ok(forced);
        }
        let supports = |mode: u8| {
            self.strategy(mode)
                .map(|s| s.supports(engine, args))
                .unwrap_or(false)
        };
        engine
            .cost_model()
            .choose(
                self.op,
                &args.dims(),
                args.reduced_len(),
                engine.workgroup(),
                supports,
            )
            .ok_or_else(|| ReduceError::ModeUnavailable {
                op: self.op.name(),
                mode: 0,
                reason: "no implementation mode supports these arguments".into(),
            })
    }

    pub fn run(&self, engine: &ReductionEngine, args: &A, wait: &[Event]) -> Result<Event> {
        let mode = self.select(engine, args)?;
        self.run_mode(engine, args, mode, wait)
    }

    /// Run one specific mode. No fallback to other modes on failure.
    pub fn run_mode(
        &self,
        engine: &ReductionEngine,
        args: &A,
        mode: u8,
        wait: &[Event],
    ) -> Result<Event> {
        let strategy = self
            .strategy(mode)
            .ok_or_else(|| ReduceError::ModeUnavailable {
                op: self.op.name(),
                mode,
                reason: format!("modes are {:?}", self.op.modes()),
            })?;
        if !strategy.supports(engine, args) {
            return Err(ReduceError::ModeUnavailable {
                op: self.op.name(),
                mode,
                reason: "not supported for these arguments on this device".into(),
            });
        }
        engine.telemetry().record_selection(self.op, mode);
        strategy.execute(engine, args, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_costs_fall_back_to_default() {
        let inf = f64::INFINITY;
        assert_eq!(select_mode(&[(0, inf), (1, inf)], 0), 0);
        assert_eq!(select_mode(&[(0, 3.0), (1, 1.0), (2, 1.0)], 0), 1);
        assert_eq!(select_mode(&[], 3), 3);
    }

    #[test]
    fn single_group_preference_needs_a_measured_mode_one() {
        let model = CostModel::new(TableStore::packaged_only("test"));
        let mut fast2 = CostTable::empty(2);
        fast2.insert(&[8, 64], 1e-6);
        let mut slow1 = CostTable::empty(2);
        slow1.insert(&[8, 64], 1e-3);
        model.install(TunedOp::ReduceSum, 2, fast2.clone());
        assert_eq!(
            model.choose(TunedOp::ReduceSum, &[8, 64], 64, 256, |_| true),
            Some(2)
        );
        model.install(TunedOp::ReduceSum, 1, slow1);
        assert_eq!(
            model.choose(TunedOp::ReduceSum, &[8, 64], 64, 256, |_| true),
            Some(1)
        );
        assert_eq!(
            model.choose(TunedOp::ReduceSum, &[8, 64], 64, 32, |_| true),
            Some(2)
        );
    }

    #[test]
    fn unsupported_modes_are_never_chosen() {
        let model = CostModel::new(TableStore::packaged_only("test"));
        let mut t = CostTable::empty(3);
        t.insert(&[8, 8, 8], 1e-6);
        model.install(TunedOp::ScatterAdd, 4, t);
        assert_eq!(
            model.choose(TunedOp::ScatterAdd, &[5, 5, 5], 5, 64, |m| m != 4),
            Some(0)
        );
        assert_eq!(
            model.choose(TunedOp::ScatterAdd, &[5, 5, 5], 5, 64, |m| m >= 3),
            Some(4)
        );
        assert_eq!(
            model.choose(TunedOp::ScatterAdd, &[5, 5, 5], 5, 64, |m| m == 3),
            Some(3)
        );
    }
}
