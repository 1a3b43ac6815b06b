//! Operation builders: validate, pick a plan, and enqueue generated kernels.

pub mod axis;
pub mod scatter;
pub mod softmax;
pub mod vector;

pub use axis::{AxisArgs, AxisMode};
pub use scatter::ScatterArgs;

use log::info;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::caps::DeviceCaps;
use crate::config::ReduceOptions;
use crate::device::{BufferHandle, Event, KernelDevice, KernelParams, Launch};
use crate::dtype::DType;
use crate::error::{ReduceError, Result};
use crate::kernel::launch::split_grid;
use crate::kernel::{KernelCache, KernelIr};
use crate::telemetry::ReduceTelemetry;
use crate::tuning::{CostModel, Dispatcher, TableStore, TunedOp};

/// Process-scoped reduction engine bound to one device.
///
/// Owns the capability snapshot, the kernel cache, the lazily loaded cost tables,
/// and one strategy table per tuned operation.
pub struct ReductionEngine {
    device: Arc<dyn KernelDevice>,
    options: ReduceOptions,
    caps: DeviceCaps,
    kernels: KernelCache,
    costs: CostModel,
    telemetry: ReduceTelemetry,
    reduce_sum: Dispatcher<AxisArgs>,
    reduce_max: Dispatcher<AxisArgs>,
    reduce_arg_max: Dispatcher<AxisArgs>,
    scatter_add: Dispatcher<ScatterArgs>,
}

impl ReductionEngine {
    pub fn new(device: Arc<dyn KernelDevice>, options: ReduceOptions) -> Result<Self> {
        let caps = DeviceCaps::probe(device.as_ref(), &options)?;
        let store = TableStore::from_options(&options, &device.device_tag());
        info!(
            "reduction engine ready on '{}' (wg {}, cost tables for '{}')",
            caps.limits.name,
            caps.workgroup,
            store.device_tag()
        );
        Ok(Self {
            kernels: KernelCache::new(options.dump_dir.clone()),
            costs: CostModel::new(store),
            telemetry: ReduceTelemetry::new(),
            reduce_sum: axis::dispatcher(TunedOp::ReduceSum),
            reduce_max: axis::dispatcher(TunedOp::ReduceMax),
            reduce_arg_max: axis::dispatcher(TunedOp::ReduceArgMax),
            scatter_add: scatter::dispatcher(),
            device,
            options,
            caps,
        })
    }

    pub fn from_env(device: Arc<dyn KernelDevice>) -> Result<Self> {
        Self::new(device, ReduceOptions::from_env())
    }

    /// Replace the cost model, e.g. with tables installed in memory.
    pub fn with_cost_model(mut self, costs: CostModel) -> Self {
        self.costs = costs;
        self
    }

    pub fn device(&self) -> &Arc<dyn KernelDevice> {
        &self.device
    }

    pub fn options(&self) -> &ReduceOptions {
        &self.options
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn workgroup(&self) -> u32 {
        self.caps.workgroup
    }

    pub fn telemetry(&self) -> &ReduceTelemetry {
        &self.telemetry
    }

    pub fn kernel_cache(&self) -> &KernelCache {
        &self.kernels
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.costs
    }

    /// Mode the dispatching entry point would pick for an axis reduction.
    pub fn select_axis_mode(&self, op: TunedOp, args: &AxisArgs) -> Result<u8> {
        self.axis_dispatcher(op)?.select(self, args)
    }

    pub fn select_scatter_mode(&self, args: &ScatterArgs) -> Result<u8> {
        self.scatter_add.select(self, args)
    }

    fn axis_dispatcher(&self, op: TunedOp) -> Result<&Dispatcher<AxisArgs>> {
        match op {
            TunedOp::ReduceSum => Ok(&self.reduce_sum),
            TunedOp::ReduceMax => Ok(&self.reduce_max),
            TunedOp::ReduceArgMax => Ok(&self.reduce_arg_max),
            TunedOp::ScatterAdd => Err(ReduceError::invalid_shape(
                op.name(),
                "not an axis reduction",
            )),
        }
    }

    /// Enqueue `ir` over `grid`, split into launches that respect the per-dimension
    /// group limit. Every launch waits on `wait`; the returned event covers all of them.
    pub(crate) fn launch(
        &self,
        ir: KernelIr,
        grid: [u32; 3],
        buffers: &[BufferHandle],
        params: KernelParams,
        wait: &[Event],
    ) -> Result<Event> {
        let chunks = split_grid(grid, self.caps.max_groups());
        if chunks.is_empty() {
            return self.device.marker(wait);
        }
        let kernel = self
            .kernels
            .get_or_build(self.device.as_ref(), &self.caps, &ir)?;
        let mut events: SmallVec<[Event; 4]> = SmallVec::new();
        for chunk in &chunks {
            let launch = Launch {
                grid: chunk.grid,
                buffers: SmallVec::from_slice(buffers),
                params: KernelParams {
                    x_base: chunk.base[0],
                    y_base: chunk.base[1],
                    z_base: chunk.base[2],
                    ..params
                },
            };
            events.push(self.device.enqueue(&kernel, launch, wait)?);
        }
        self.telemetry.record_launches(events.len() as u64);
        match events.as_slice() {
            [single] => Ok(*single),
            all => self.device.marker(all),
        }
    }

    pub(crate) fn temporary(&self, len: usize, dtype: DType) -> Result<BufferHandle> {
        let buffer = self.device.allocate(len, dtype)?;
        self.telemetry.record_temporary();
        Ok(buffer)
    }

    pub(crate) fn release_after(&self, buffers: &[BufferHandle], event: Event) -> Result<()> {
        for &buffer in buffers {
            self.device.release_after(buffer, event)?;
        }
        Ok(())
    }

    /// Release `temps` once `outcome` completes, or behind a marker if the plan failed part-way.
    pub(crate) fn settle(&self, temps: &[BufferHandle], outcome: Result<Event>) -> Result<Event> {
        match outcome {
            Ok(done) => {
                self.release_after(temps, done)?;
                Ok(done)
            }
            Err(err) => {
                if !temps.is_empty() {
                    let drained = self.device.marker(&[])?;
                    self.release_after(temps, drained)?;
                }
                Err(err)
            }
        }
    }

    pub(crate) fn check_numeric(&self, op: &'static str, dtype: DType) -> Result<()> {
        if !dtype.is_numeric() {
            return Err(ReduceError::UnsupportedDType { op, dtype });
        }
        if dtype == DType::F64 && !self.caps.supports_f64() {
            return Err(ReduceError::Fp64Unsupported { op });
        }
        Ok(())
    }

    pub(crate) fn check_float(&self, op: &'static str, dtype: DType) -> Result<()> {
        if !dtype.is_float() {
            return Err(ReduceError::UnsupportedDType { op, dtype });
        }
        self.check_numeric(op, dtype)
    }
}

pub(crate) fn check_dtype(op: &'static str, expected: DType, buffer: &BufferHandle) -> Result<()> {
    if buffer.dtype != expected {
        return Err(ReduceError::DTypeMismatch {
            op,
            expected,
            got: buffer.dtype,
        });
    }
    Ok(())
}

pub(crate) fn check_len(
    op: &'static str,
    what: &str,
    buffer: &BufferHandle,
    expected: usize,
) -> Result<()> {
    if buffer.len != expected {
        return Err(ReduceError::invalid_shape(
            op,
            format!(
                "{what} holds {} elements, shape needs {expected}",
                buffer.len
            ),
        ));
    }
    Ok(())
}

/// Element count of a shape, refusing anything the 32-bit kernel indexing cannot address.
pub(crate) fn element_count(op: &'static str, dims: &[usize]) -> Result<u32> {
    let total = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .and_then(|n| u32::try_from(n).ok());
    total.ok_or_else(|| {
        ReduceError::invalid_shape(op, format!("shape {dims:?} exceeds 32-bit indexing"))
    })
}

/// Shift amount for a power-of-two extent; zero otherwise.
pub(crate) fn log2(extent: u32) -> u32 {
    if extent.is_power_of_two() {
        extent.trailing_zeros()
    } else {
        0
    }
}

/// Wait list for the next step of a chain: the previous step, or the caller's list.
pub(crate) fn after(previous: Option<Event>, wait: &[Event]) -> SmallVec<[Event; 4]> {
    match previous {
        Some(event) => SmallVec::from_slice(&[event]),
        None => SmallVec::from_slice(wait),
    }
}
