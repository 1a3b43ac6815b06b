//! RunMat Reduce: adaptive accelerator reductions
//!
//! Goals:
//! - Generate hierarchical reduction kernels (single-group, segmented, two-phase) from a typed IR.
//! - Offer several equivalent modes per operation and pick one from calibrated cost tables.
//! - Keep device specifics behind the [`KernelDevice`] trait (in-process host executor, wgpu).

pub mod backend;
pub mod caps;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod ops;
pub mod telemetry;
pub mod tuning;

pub use backend::{HostDevice, HostDeviceConfig};
#[cfg(feature = "wgpu")]
pub use backend::wgpu::WgpuDevice;
pub use caps::DeviceCaps;
pub use config::{CalibrationConfig, ReduceOptions};
pub use device::{BufferHandle, DeviceLimits, Event, KernelDevice};
pub use dtype::{DType, HostData, Scalar};
pub use error::{ReduceError, Result};
pub use kernel::{Inject, ScatterMode, Topology};
pub use ops::{AxisArgs, AxisMode, ReductionEngine, ScatterArgs};
pub use telemetry::{ReduceTelemetry, TelemetrySnapshot};
pub use tuning::{Calibrator, CostModel, CostTable, TableStore, TunedOp};
