use super::axis::AxisArgs;
use super::{check_dtype, check_len, element_count, log2, ReductionEngine};
use crate::device::{BufferHandle, Event, KernelParams};
use crate::error::{ReduceError, Result};
use crate::kernel::launch::{dispatch_size, flat_grid};
use crate::kernel::{BroadcastIr, BroadcastOp, IndexMath, KernelIr};

impl ReductionEngine {
    /// Softmax along the middle axis of `(outer, len, inner)`.
    ///
    /// Runs as max, `exp(x - max)` into `dst`, sum of `dst`, and `dst / sum`, each
    /// step waiting on the previous one. The max and sum steps go through the
    /// dispatched axis reductions.
    pub fn softmax(
        &self,
        src: &BufferHandle,
        dst: &BufferHandle,
        outer: usize,
        len: usize,
        inner: usize,
        wait: &[Event],
    ) -> Result<Event> {
        let op = "softmax";
        self.check_float(op, src.dtype)?;
        check_dtype(op, src.dtype, dst)?;
        if len == 0 {
            return Err(ReduceError::invalid_shape(op, "softmax axis is empty"));
        }
        let total = element_count(op, &[outer, len, inner])?;
        check_len(op, "source", src, total as usize)?;
        check_len(op, "destination", dst, total as usize)?;
        let rows = outer * inner;
        if rows == 0 {
            return self.device().marker(wait);
        }
        self.telemetry().record_softmax();

        let stat_max = self.temporary(rows, src.dtype)?;
        let stat_sum = match self.temporary(rows, src.dtype) {
            Ok(buffer) => buffer,
            Err(err) => return self.settle(&[stat_max], Err(err)),
        };
        let temps = [stat_max, stat_sum];
        let steps = (|| -> Result<Event> {
            let max = self.reduce_max(&AxisArgs::new(*src, stat_max, outer, len, inner), wait)?;
            let shifted = self.broadcast(
                BroadcastOp::ExpSub,
                &[*src, stat_max, *dst],
                outer,
                len,
                inner,
                &[max],
            )?;
            let sums = AxisArgs::new(*dst, stat_sum, outer, len, inner);
            let sum = self.reduce_sum(&sums, &[shifted])?;
            self.broadcast(
                BroadcastOp::Div,
                &[stat_sum, *dst],
                outer,
                len,
                inner,
                &[sum],
            )
        })();
        self.settle(&temps, steps)
    }

    fn broadcast(
        &self,
        op: BroadcastOp,
        buffers: &[BufferHandle],
        outer: usize,
        len: usize,
        inner: usize,
        wait: &[Event],
    ) -> Result<Event> {
        let wg = self.workgroup();
        let dtype = buffers
            .last()
            .map(|b| b.dtype)
            .ok_or_else(|| ReduceError::device("broadcast without buffers"))?;
        let (outer, len, inner) = (outer as u32, len as u32, inner as u32);
        let index_math = IndexMath::for_dims(
            &[inner as usize, len as usize],
            self.caps().division_defect,
        );
        let mut params = KernelParams {
            len,
            inner,
            outer,
            ..Default::default()
        };
        let grid = match index_math {
            IndexMath::Grid => [dispatch_size(inner, wg), len, outer],
            _ => {
                let total = outer * len * inner;
                let (grid, grid_x) = flat_grid(total, wg, self.caps().max_groups());
                params.total = total;
                params.grid_x = grid_x;
                params.shift = log2(inner);
                params.shift_outer = log2(len);
                grid
            }
        };
        let ir = KernelIr::Broadcast(BroadcastIr {
            op,
            dtype,
            workgroup: wg,
            index_math,
        });
        self.launch(ir, grid, buffers, params, wait)
    }
}
