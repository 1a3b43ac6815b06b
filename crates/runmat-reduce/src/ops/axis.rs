//! Reductions along the middle axis of a logical `(outer, len, inner)` shape.
//!
//! Element `(o, j, i)` lives at `(o * len + j) * inner + i`; output `(o, i)` at
//! `o * inner + i`.

use smallvec::{smallvec, SmallVec};

use super::{after, check_dtype, check_len, element_count, log2, ReductionEngine};
use crate::device::{BufferHandle, Event, KernelParams};
use crate::dtype::DType;
use crate::error::{ReduceError, Result};
use crate::kernel::launch::{dispatch_size, flat_grid};
use crate::kernel::{IndexMath, Inject, KernelIr, LaneLoad, ReduceIr};
use crate::tuning::{Dispatcher, Strategy, TunedArgs, TunedOp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisArgs {
    pub src: BufferHandle,
    /// Reduced values, or `u32` positions along the axis for arg-reductions.
    pub dst: BufferHandle,
    pub outer: usize,
    pub len: usize,
    pub inner: usize,
}

impl AxisArgs {
    pub fn new(
        src: BufferHandle,
        dst: BufferHandle,
        outer: usize,
        len: usize,
        inner: usize,
    ) -> Self {
        Self {
            src,
            dst,
            outer,
            len,
            inner,
        }
    }

    /// Reduce every column of a row-major `rows x cols` matrix down to one value per row.
    pub fn rows(src: BufferHandle, dst: BufferHandle, rows: usize, cols: usize) -> Self {
        Self::new(src, dst, rows, cols, 1)
    }

    fn outputs(&self) -> usize {
        self.outer.saturating_mul(self.inner)
    }
}

impl TunedArgs for AxisArgs {
    fn dims(&self) -> SmallVec<[u64; 3]> {
        smallvec![self.outputs() as u64, self.len as u64]
    }

    fn reduced_len(&self) -> u64 {
        self.len as u64
    }
}

/// Axis-reduction implementation modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AxisMode {
    /// One lane folds one output sequentially.
    Serial = 0,
    /// One group per output; lanes stride over the axis, then a tree.
    GroupStrided = 1,
    /// Rounds of one-element-per-lane trees until one value per output remains.
    Segmented = 2,
    /// Grid-stride partials into a temporary, then one finishing group per output.
    TwoPhase = 3,
}

impl AxisMode {
    pub const ALL: [AxisMode; 4] = [
        AxisMode::Serial,
        AxisMode::GroupStrided,
        AxisMode::Segmented,
        AxisMode::TwoPhase,
    ];

    pub fn from_mode(mode: u8) -> Option<Self> {
        Self::ALL.get(mode as usize).copied()
    }

    pub fn mode(self) -> u8 {
        self as u8
    }
}

struct AxisStrategy {
    inject: Inject,
    mode: AxisMode,
}

impl Strategy<AxisArgs> for AxisStrategy {
    fn mode(&self) -> u8 {
        self.mode.mode()
    }

    fn supports(&self, _engine: &ReductionEngine, _args: &AxisArgs) -> bool {
        true
    }

    fn execute(&self, engine: &ReductionEngine, args: &AxisArgs, wait: &[Event]) -> Result<Event> {
        let out = if self.inject.indexed() {
            Output::indices(args.dst)
        } else {
            Output::values(args.dst)
        };
        let shape = Shape::of(args)?;
        engine.reduce_plan(
            self.inject,
            args.src.dtype,
            shape,
            self.mode,
            args.src,
            out,
            wait,
        )
    }
}

pub(super) fn dispatcher(op: TunedOp) -> Dispatcher<AxisArgs> {
    let inject = match op {
        TunedOp::ReduceMax => Inject::Max,
        TunedOp::ReduceArgMax => Inject::ArgMax,
        _ => Inject::Sum,
    };
    let strategies = AxisMode::ALL
        .iter()
        .map(|&mode| Box::new(AxisStrategy { inject, mode }) as Box<dyn Strategy<AxisArgs>>)
        .collect();
    Dispatcher::new(op, strategies)
}

/// 32-bit view of an axis shape.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Shape {
    pub outer: u32,
    pub len: u32,
    pub inner: u32,
}

impl Shape {
    fn of(args: &AxisArgs) -> Result<Self> {
        element_count("reduce", &[args.outer, args.len, args.inner])?;
        Ok(Self {
            outer: args.outer as u32,
            len: args.len as u32,
            inner: args.inner as u32,
        })
    }

    pub(crate) fn vector(len: u32) -> Self {
        Self {
            outer: 1,
            len,
            inner: 1,
        }
    }

    fn rows(&self) -> u32 {
        self.outer * self.inner
    }
}

/// Where the final round of a reduction writes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Output {
    values: Option<BufferHandle>,
    indices: Option<BufferHandle>,
}

impl Output {
    pub(crate) fn values(buffer: BufferHandle) -> Self {
        Self {
            values: Some(buffer),
            indices: None,
        }
    }

    pub(crate) fn indices(buffer: BufferHandle) -> Self {
        Self {
            values: None,
            indices: Some(buffer),
        }
    }
}

/// What a round reads: values, plus carried indices after the first round.
#[derive(Clone, Copy, Debug)]
struct Input {
    values: BufferHandle,
    indices: Option<BufferHandle>,
}

fn params(len: u32, inner: u32, outer: u32, segments: u32) -> KernelParams {
    KernelParams {
        len,
        inner,
        outer,
        segments,
        ..Default::default()
    }
}

fn missing(what: &str) -> ReduceError {
    ReduceError::device(format!("reduction round is missing its {what} buffer"))
}

impl ReductionEngine {
    pub fn reduce_sum(&self, args: &AxisArgs, wait: &[Event]) -> Result<Event> {
        self.validate_axis(TunedOp::ReduceSum, args)?;
        self.reduce_sum.run(self, args, wait)
    }

    pub fn reduce_max(&self, args: &AxisArgs, wait: &[Event]) -> Result<Event> {
        self.validate_axis(TunedOp::ReduceMax, args)?;
        self.reduce_max.run(self, args, wait)
    }

    /// Position of the maximum along the axis; ties resolve to the lowest position
    /// and NaN counts as the maximum.
    pub fn reduce_arg_max(&self, args: &AxisArgs, wait: &[Event]) -> Result<Event> {
        self.validate_axis(TunedOp::ReduceArgMax, args)?;
        self.reduce_arg_max.run(self, args, wait)
    }

    pub fn reduce_sum_with_mode(
        &self,
        args: &AxisArgs,
        mode: AxisMode,
        wait: &[Event],
    ) -> Result<Event> {
        self.validate_axis(TunedOp::ReduceSum, args)?;
        self.reduce_sum.run_mode(self, args, mode.mode(), wait)
    }

    pub fn reduce_max_with_mode(
        &self,
        args: &AxisArgs,
        mode: AxisMode,
        wait: &[Event],
    ) -> Result<Event> {
        self.validate_axis(TunedOp::ReduceMax, args)?;
        self.reduce_max.run_mode(self, args, mode.mode(), wait)
    }

    pub fn reduce_arg_max_with_mode(
        &self,
        args: &AxisArgs,
        mode: AxisMode,
        wait: &[Event],
    ) -> Result<Event> {
        self.validate_axis(TunedOp::ReduceArgMax, args)?;
        self.reduce_arg_max.run_mode(self, args, mode.mode(), wait)
    }

    /// Dispatching or pinned entry for any axis-reduction operation.
    pub fn reduce_axis(
        &self,
        op: TunedOp,
        args: &AxisArgs,
        mode: Option<u8>,
        wait: &[Event],
    ) -> Result<Event> {
        let dispatcher = self.axis_dispatcher(op)?;
        self.validate_axis(op, args)?;
        match mode {
            Some(mode) => dispatcher.run_mode(self, args, mode, wait),
            None => dispatcher.run(self, args, wait),
        }
    }

    fn validate_axis(&self, op: TunedOp, args: &AxisArgs) -> Result<()> {
        let name = op.name();
        let dtype = args.src.dtype;
        self.check_numeric(name, dtype)?;
        if op == TunedOp::ReduceArgMax {
            check_dtype(name, DType::U32, &args.dst)?;
        } else {
            check_dtype(name, dtype, &args.dst)?;
        }
        if args.len == 0 {
            return Err(ReduceError::invalid_shape(name, "reduced axis is empty"));
        }
        let total = element_count(name, &[args.outer, args.len, args.inner])?;
        check_len(name, "source", &args.src, total as usize)?;
        check_len(name, "destination", &args.dst, args.outputs())?;
        Ok(())
    }

    /// Enqueue one reduction plan. `out` receives values for plain reductions and
    /// indices for arg-reductions.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reduce_plan(
        &self,
        inject: Inject,
        dtype: DType,
        shape: Shape,
        mode: AxisMode,
        src: BufferHandle,
        out: Output,
        wait: &[Event],
    ) -> Result<Event> {
        if shape.rows() == 0 {
            return self.device().marker(wait);
        }
        let input = Input {
            values: src,
            indices: None,
        };
        match mode {
            AxisMode::Serial => self.serial(inject, dtype, shape, input, out, wait),
            AxisMode::GroupStrided => {
                let ir = ReduceIr::tree(inject, dtype, LaneLoad::Strided, self.workgroup())
                    .finishing(true);
                let p = params(shape.len, shape.inner, shape.outer, 1);
                self.round(ir, input, out, [1, shape.inner, shape.outer], p, wait)
            }
            AxisMode::Segmented => self.segmented(inject, dtype, shape, input, out, wait),
            AxisMode::TwoPhase => self.two_phase(inject, dtype, shape, input, out, wait),
        }
    }

    fn round(
        &self,
        ir: ReduceIr,
        input: Input,
        out: Output,
        grid: [u32; 3],
        params: KernelParams,
        wait: &[Event],
    ) -> Result<Event> {
        let mut buffers: SmallVec<[BufferHandle; 6]> = smallvec![input.values];
        if ir.carry_index {
            buffers.push(input.indices.ok_or_else(|| missing("carried index"))?);
        }
        if ir.write_values {
            buffers.push(out.values.ok_or_else(|| missing("value output"))?);
        }
        if ir.writes_index() {
            buffers.push(out.indices.ok_or_else(|| missing("index output"))?);
        }
        self.launch(KernelIr::Reduce(ir), grid, &buffers, params, wait)
    }

    fn serial(
        &self,
        inject: Inject,
        dtype: DType,
        shape: Shape,
        input: Input,
        out: Output,
        wait: &[Event],
    ) -> Result<Event> {
        let wg = self.workgroup();
        let math = IndexMath::for_dims(&[shape.inner as usize], self.caps().division_defect);
        let ir = ReduceIr::serial(inject, dtype, wg, math).finishing(true);
        let mut p = params(shape.len, shape.inner, shape.outer, 1);
        let grid = match math {
            IndexMath::Grid => [dispatch_size(shape.inner, wg), shape.outer, 1],
            _ => {
                let (grid, grid_x) = flat_grid(shape.rows(), wg, self.caps().max_groups());
                p.total = shape.rows();
                p.grid_x = grid_x;
                p.shift = log2(shape.inner);
                grid
            }
        };
        self.round(ir, input, out, grid, p, wait)
    }

    /// Allocate the value (and index) buffers an intermediate round writes.
    fn scratch(
        &self,
        inject: Inject,
        dtype: DType,
        len: u32,
        temps: &mut Vec<BufferHandle>,
    ) -> Result<Output> {
        let values = self.temporary(len as usize, dtype)?;
        temps.push(values);
        let indices = if inject.indexed() {
            let indices = self.temporary(len as usize, DType::U32)?;
            temps.push(indices);
            Some(indices)
        } else {
            None
        };
        Ok(Output {
            values: Some(values),
            indices,
        })
    }

    fn segmented(
        &self,
        inject: Inject,
        dtype: DType,
        shape: Shape,
        mut input: Input,
        out: Output,
        wait: &[Event],
    ) -> Result<Event> {
        let wg = self.workgroup();
        let rows = shape.rows();
        let mut temps = Vec::new();
        let mut len = shape.len;
        let mut previous: Option<Event> = None;
        let rounds = (|| -> Result<Event> {
            loop {
                let first = previous.is_none();
                let segments = len.div_ceil(wg);
                let last = segments == 1;
                let ir = ReduceIr::tree(inject, dtype, LaneLoad::One, wg)
                    .carrying(!first)
                    .finishing(last);
                let (grid, p) = if first {
                    (
                        [segments, shape.inner, shape.outer],
                        params(len, shape.inner, shape.outer, segments),
                    )
                } else {
                    ([segments, 1, rows], params(len, 1, rows, segments))
                };
                let target = if last {
                    out
                } else {
                    self.scratch(inject, dtype, rows * segments, &mut temps)?
                };
                let event = self.round(ir, input, target, grid, p, &after(previous, wait))?;
                if last {
                    break Ok(event);
                }
                input = Input {
                    values: target.values.ok_or_else(|| missing("scratch value"))?,
                    indices: target.indices,
                };
                len = segments;
                previous = Some(event);
            }
        })();
        self.settle(&temps, rounds)
    }

    fn two_phase(
        &self,
        inject: Inject,
        dtype: DType,
        shape: Shape,
        input: Input,
        out: Output,
        wait: &[Event],
    ) -> Result<Event> {
        let wg = self.workgroup();
        let rows = shape.rows();
        let partials = shape.len.div_ceil(wg).min(2 * wg);
        let first = [partials, shape.inner, shape.outer];
        let p = params(shape.len, shape.inner, shape.outer, partials);
        if partials == 1 {
            let ir = ReduceIr::grid_stride(inject, dtype, wg).finishing(true);
            return self.round(ir, input, out, first, p, wait);
        }
        let mut temps = Vec::new();
        let phases = (|| -> Result<Event> {
            let scratch = self.scratch(inject, dtype, rows * partials, &mut temps)?;
            let phase1 = self.round(
                ReduceIr::grid_stride(inject, dtype, wg),
                input,
                scratch,
                first,
                p,
                wait,
            )?;
            let carried = Input {
                values: scratch.values.ok_or_else(|| missing("partial value"))?,
                indices: scratch.indices,
            };
            let ir = ReduceIr::tree(inject, dtype, LaneLoad::Two, wg)
                .carrying(true)
                .finishing(true);
            self.round(
                ir,
                carried,
                out,
                [1, 1, rows],
                params(partials, 1, rows, 1),
                &[phase1],
            )
        })();
        self.settle(&temps, phases)
    }
}
