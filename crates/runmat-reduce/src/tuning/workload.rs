use smallvec::SmallVec;
use std::time::{Duration, Instant};

use super::calibrate::Workload;
use super::TunedOp;
use crate::device::BufferHandle;
use crate::dtype::{DType, HostData};
use crate::error::{ReduceError, Result};
use crate::kernel::ScatterMode;
use crate::ops::{AxisArgs, ReductionEngine, ScatterArgs};

/// Times real launches of one tuned operation on an engine's device.
///
/// Scratch buffers are allocated and filled once per grid point and reused across
/// the warm-up and timed runs of that point.
pub struct DeviceWorkload<'e> {
    engine: &'e ReductionEngine,
    op: TunedOp,
    dtype: DType,
    scratch: Option<Scratch>,
}

struct Scratch {
    dims: SmallVec<[u32; 3]>,
    buffers: SmallVec<[BufferHandle; 3]>,
}

impl<'e> DeviceWorkload<'e> {
    pub fn new(engine: &'e ReductionEngine, op: TunedOp, dtype: DType) -> Result<Self> {
        if !dtype.is_numeric() {
            return Err(ReduceError::UnsupportedDType {
                op: op.name(),
                dtype,
            });
        }
        Ok(Self {
            engine,
            op,
            dtype,
            scratch: None,
        })
    }

    fn prepare(&mut self, dims: &[u32]) -> Result<&[BufferHandle]> {
        let reuse = matches!(&self.scratch, Some(s) if s.dims.as_slice() == dims);
        if !reuse {
            self.release()?;
            let buffers = self.allocate(dims)?;
            self.scratch = Some(Scratch {
                dims: SmallVec::from_slice(dims),
                buffers,
            });
        }
        Ok(self
            .scratch
            .as_ref()
            .map(|s| s.buffers.as_slice())
            .unwrap_or_default())
    }

    fn allocate(&self, dims: &[u32]) -> Result<SmallVec<[BufferHandle; 3]>> {
        let dim = |k: usize| dims.get(k).copied().unwrap_or(1) as usize;
        let layout: SmallVec<[(usize, DType, Fill); 3]> = match self.op {
            TunedOp::ScatterAdd => {
                let (n, k, classes) = (dim(0), dim(1), dim(2));
                SmallVec::from_slice(&[
                    (n, DType::U32, Fill::Classes(classes)),
                    (n * k, self.dtype, Fill::Ramp),
                    (classes * k, self.dtype, Fill::Zero),
                ])
            }
            TunedOp::ReduceArgMax => SmallVec::from_slice(&[
                (dim(0) * dim(1), self.dtype, Fill::Ramp),
                (dim(0), DType::U32, Fill::Zero),
            ]),
            TunedOp::ReduceSum | TunedOp::ReduceMax => SmallVec::from_slice(&[
                (dim(0) * dim(1), self.dtype, Fill::Ramp),
                (dim(0), self.dtype, Fill::Zero),
            ]),
        };
        let device = self.engine.device();
        let limit = self.engine.caps().limits.max_buffer_bytes;
        let mut buffers = SmallVec::new();
        for (len, dtype, fill) in layout {
            let bytes = (len as u64).saturating_mul(dtype.size_in_bytes() as u64);
            let allocated = if bytes > limit {
                Err(ReduceError::OutOfResources {
                    context: format!("{} scratch at {dims:?}", self.op),
                    detail: format!("{bytes} bytes exceeds the {limit} byte buffer limit"),
                })
            } else {
                device.allocate(len, dtype)
            };
            let filled = allocated.and_then(|buffer| {
                buffers.push(buffer);
                device.write(&buffer, &fill.data(dtype, len))
            });
            if let Err(err) = filled {
                if let Ok(ready) = device.marker(&[]) {
                    for buffer in buffers {
                        if let Err(release) = device.release_after(buffer, ready) {
                            log::warn!("scratch buffer {} not released: {release}", buffer.id);
                        }
                    }
                }
                return Err(err);
            }
        }
        Ok(buffers)
    }

    /// Free the current scratch buffers.
    pub fn release(&mut self) -> Result<()> {
        if let Some(scratch) = self.scratch.take() {
            let device = self.engine.device();
            let ready = device.marker(&[])?;
            for buffer in scratch.buffers {
                device.release_after(buffer, ready)?;
            }
        }
        Ok(())
    }
}

impl Drop for DeviceWorkload<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::warn!("releasing calibration scratch failed: {err}");
        }
    }
}

impl Workload for DeviceWorkload<'_> {
    fn op(&self) -> TunedOp {
        self.op
    }

    fn run_once(&mut self, mode: u8, dims: &[u32]) -> Result<Duration> {
        let engine = self.engine;
        let op = self.op;
        let buffers: SmallVec<[BufferHandle; 3]> = SmallVec::from_slice(self.prepare(dims)?);
        let dim = |k: usize| dims.get(k).copied().unwrap_or(1) as usize;
        let device = engine.device();
        device.finish()?;
        let start = Instant::now();
        let done = match (op, buffers.as_slice()) {
            (TunedOp::ScatterAdd, [indices, addend, acc]) => {
                let mode = ScatterMode::from_mode(mode).ok_or_else(|| ReduceError::ModeUnavailable {
                    op: op.name(),
                    mode,
                    reason: "no such scatter mode".into(),
                })?;
                let args = ScatterArgs::new(dim(0), dim(1), dim(2), *indices, *addend, *acc)
                    .validated(true);
                engine.scatter_add_with_mode(&args, mode, &[])?
            }
            (_, [src, dst]) => {
                let args = AxisArgs::rows(*src, *dst, dim(0), dim(1));
                engine.reduce_axis(op, &args, Some(mode), &[])?
            }
            _ => {
                return Err(ReduceError::device(
                    "calibration scratch does not match the operation",
                ))
            }
        };
        device.wait(&[done])?;
        Ok(start.elapsed())
    }
}

#[derive(Clone, Copy)]
enum Fill {
    Zero,
    /// Small repeating values so sums stay finite.
    Ramp,
    /// Row indices spread evenly over `classes`.
    Classes(usize),
}

impl Fill {
    fn data(self, dtype: DType, len: usize) -> HostData {
        let value = |i: usize| match self {
            Fill::Zero => 0.0,
            Fill::Ramp => (i % 17) as f64,
            Fill::Classes(classes) => (i % classes.max(1)) as f64,
        };
        match dtype {
            DType::F32 => HostData::F32((0..len).map(|i| value(i) as f32).collect()),
            DType::F64 => HostData::F64((0..len).map(value).collect()),
            DType::I32 => HostData::I32((0..len).map(|i| value(i) as i32).collect()),
            DType::U32 => HostData::U32((0..len).map(|i| value(i) as u32).collect()),
            DType::Bool => HostData::Bool((0..len).map(|i| value(i) != 0.0).collect()),
        }
    }
}
