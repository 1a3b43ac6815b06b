use smallvec::{smallvec, SmallVec};

use super::{check_dtype, check_len, element_count, log2, ReductionEngine};
use crate::device::{BufferHandle, Event, KernelParams};
use crate::dtype::DType;
use crate::error::Result;
use crate::kernel::launch::{dispatch_size, flat_grid};
use crate::kernel::{IndexMath, KernelIr, ScatterIr, ScatterMode};
use crate::tuning::{Dispatcher, Strategy, TunedArgs, TunedOp};

/// `accumulator[indices[i], :] += addend[i, :]` for `i` in `0..n`, rows of width `k`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScatterArgs {
    pub n: usize,
    pub k: usize,
    pub classes: usize,
    /// `u32` destination row per source row; rows `>= classes` are skipped.
    pub indices: BufferHandle,
    pub addend: BufferHandle,
    pub accumulator: BufferHandle,
    /// Caller guarantees every index is `< classes`, enabling the unchecked mode.
    pub indices_validated: bool,
}

impl ScatterArgs {
    pub fn new(
        n: usize,
        k: usize,
        classes: usize,
        indices: BufferHandle,
        addend: BufferHandle,
        accumulator: BufferHandle,
    ) -> Self {
        Self {
            n,
            k,
            classes,
            indices,
            addend,
            accumulator,
            indices_validated: false,
        }
    }

    pub fn validated(mut self, validated: bool) -> Self {
        self.indices_validated = validated;
        self
    }
}

impl TunedArgs for ScatterArgs {
    fn dims(&self) -> SmallVec<[u64; 3]> {
        smallvec![self.n as u64, self.k as u64, self.classes as u64]
    }

    fn reduced_len(&self) -> u64 {
        self.n as u64
    }
}

struct ScatterStrategy(ScatterMode);

impl Strategy<ScatterArgs> for ScatterStrategy {
    fn mode(&self) -> u8 {
        self.0.mode()
    }

    fn supports(&self, _engine: &ReductionEngine, args: &ScatterArgs) -> bool {
        if self.0.atomic() && args.accumulator.dtype == DType::F64 {
            return false;
        }
        self.0.checked() || args.indices_validated
    }

    fn execute(
        &self,
        engine: &ReductionEngine,
        args: &ScatterArgs,
        wait: &[Event],
    ) -> Result<Event> {
        engine.scatter_plan(self.0, args, wait)
    }
}

pub(super) fn dispatcher() -> Dispatcher<ScatterArgs> {
    let strategies = ScatterMode::ALL
        .iter()
        .map(|&mode| Box::new(ScatterStrategy(mode)) as Box<dyn Strategy<ScatterArgs>>)
        .collect();
    Dispatcher::new(TunedOp::ScatterAdd, strategies)
}

impl ReductionEngine {
    pub fn scatter_add(&self, args: &ScatterArgs, wait: &[Event]) -> Result<Event> {
        self.validate_scatter(args)?;
        self.scatter_add.run(self, args, wait)
    }

    pub fn scatter_add_with_mode(
        &self,
        args: &ScatterArgs,
        mode: ScatterMode,
        wait: &[Event],
    ) -> Result<Event> {
        self.validate_scatter(args)?;
        self.scatter_add.run_mode(self, args, mode.mode(), wait)
    }

    fn validate_scatter(&self, args: &ScatterArgs) -> Result<()> {
        let op = TunedOp::ScatterAdd.name();
        let dtype = args.accumulator.dtype;
        self.check_numeric(op, dtype)?;
        check_dtype(op, dtype, &args.addend)?;
        check_dtype(op, DType::U32, &args.indices)?;
        let addend = element_count(op, &[args.n, args.k])?;
        let acc = element_count(op, &[args.classes, args.k])?;
        check_len(op, "indices", &args.indices, args.n)?;
        check_len(op, "addend", &args.addend, addend as usize)?;
        check_len(op, "accumulator", &args.accumulator, acc as usize)?;
        Ok(())
    }

    fn scatter_plan(&self, mode: ScatterMode, args: &ScatterArgs, wait: &[Event]) -> Result<Event> {
        let wg = self.workgroup();
        let (n, k, classes) = (args.n as u32, args.k as u32, args.classes as u32);
        let mut params = KernelParams {
            len: n,
            inner: k,
            classes,
            ..Default::default()
        };
        let per_lane = |rows: u32, params: &mut KernelParams| {
            let math = IndexMath::for_dims(&[k as usize], self.caps().division_defect);
            let grid = match math {
                IndexMath::Grid => [dispatch_size(k, wg), rows, 1],
                _ => {
                    let (grid, grid_x) = flat_grid(rows * k, wg, self.caps().max_groups());
                    params.total = rows * k;
                    params.grid_x = grid_x;
                    params.shift = log2(k);
                    grid
                }
            };
            (math, grid)
        };
        let (index_math, grid) = match mode {
            ScatterMode::AtomicElement | ScatterMode::AtomicUnchecked => per_lane(n, &mut params),
            ScatterMode::ClassSerial => per_lane(classes, &mut params),
            ScatterMode::ClassTree => (IndexMath::Grid, [k, classes, 1]),
            ScatterMode::RowAtomic => (IndexMath::Grid, [n, 1, 1]),
        };
        let ir = KernelIr::Scatter(ScatterIr {
            mode,
            dtype: args.accumulator.dtype,
            workgroup: wg,
            index_math,
        });
        self.launch(
            ir,
            grid,
            &[args.indices, args.addend, args.accumulator],
            params,
            wait,
        )
    }
}
