use super::axis::{Output, Shape};
use super::{check_dtype, check_len, element_count, ReductionEngine};
use crate::device::{BufferHandle, Event};
use crate::dtype::DType;
use crate::error::{ReduceError, Result};
use crate::kernel::{Inject, Topology};
use crate::ops::AxisMode;

impl ReductionEngine {
    /// `dst[0] = sum(src)`.
    pub fn sum(&self, src: &BufferHandle, dst: &BufferHandle, wait: &[Event]) -> Result<Event> {
        self.reduce_vector(Inject::Sum, None, src, dst, wait)
    }

    /// `dst_index[0]` = position of the first minimum of `src`.
    pub fn imin(
        &self,
        src: &BufferHandle,
        dst_index: &BufferHandle,
        wait: &[Event],
    ) -> Result<Event> {
        self.reduce_vector(Inject::ArgMin, None, src, dst_index, wait)
    }

    /// `dst_index[0]` = position of the first maximum of `src`.
    pub fn imax(
        &self,
        src: &BufferHandle,
        dst_index: &BufferHandle,
        wait: &[Event],
    ) -> Result<Event> {
        self.reduce_vector(Inject::ArgMax, None, src, dst_index, wait)
    }

    /// Reduce a whole vector to one element. `topology` defaults to the size-based choice.
    ///
    /// Indexed injects write a `u32` position into `dst`; the others write a value of
    /// the source dtype.
    pub fn reduce_vector(
        &self,
        inject: Inject,
        topology: Option<Topology>,
        src: &BufferHandle,
        dst: &BufferHandle,
        wait: &[Event],
    ) -> Result<Event> {
        let op = "reduce_vector";
        self.check_numeric(op, src.dtype)?;
        if src.len == 0 {
            return Err(ReduceError::invalid_shape(op, "cannot reduce an empty vector"));
        }
        let len = element_count(op, &[src.len])?;
        let out = if inject.indexed() {
            check_dtype(op, DType::U32, dst)?;
            Output::indices(*dst)
        } else {
            check_dtype(op, src.dtype, dst)?;
            Output::values(*dst)
        };
        check_len(op, "destination", dst, 1)?;

        let wg = self.workgroup();
        let topology = topology.unwrap_or_else(|| Topology::for_len(src.len, wg));
        let mode = match topology {
            Topology::Single if len > wg => {
                return Err(ReduceError::invalid_shape(
                    op,
                    format!(
                        "{} holds at most {wg} elements, got {len}",
                        topology.name(inject)
                    ),
                ));
            }
            Topology::Single | Topology::Segmented => AxisMode::Segmented,
            Topology::TwoPhaseLarge => AxisMode::TwoPhase,
        };
        log::trace!(
            "{op}: {inject} over {len} elements as {}",
            topology.name(inject)
        );
        self.telemetry().record_vector();
        self.reduce_plan(inject, src.dtype, Shape::vector(len), mode, *src, out, wait)
    }
}
