//! Device collaborators consumed by the engine: capability probe, kernel
//! compilation, buffer allocation, and the command queue.

use crate::dtype::{DType, HostData};
use crate::error::Result;
use crate::kernel::KernelSource;
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

/// Raw limits reported by the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub name: String,
    pub max_work_item_sizes: [u32; 3],
    pub max_invocations: u32,
    pub local_memory_bytes: u32,
    pub max_workgroups_per_dim: u32,
    pub max_buffer_bytes: u64,
    pub supports_f64: bool,
}

/// Opaque handle to a device buffer. The caller owns the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub id: u64,
    pub dtype: DType,
    pub len: usize,
}

/// Completion handle for enqueued device work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Event(pub u64);

/// Compiled program object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// A kernel instance created from a compiled program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Kernel {
    pub id: u64,
    pub name: String,
    pub program: KernelHandle,
}

/// Uniform block shared by every generated kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelParams {
    pub len: u32,
    pub inner: u32,
    pub outer: u32,
    pub segments: u32,
    pub total: u32,
    pub grid_x: u32,
    pub shift: u32,
    pub shift_outer: u32,
    pub classes: u32,
    pub x_base: u32,
    pub y_base: u32,
    pub z_base: u32,
}

/// One dispatch: group counts per dimension, buffers in binding order, uniforms.
#[derive(Clone, Debug)]
pub struct Launch {
    pub grid: [u32; 3],
    pub buffers: SmallVec<[BufferHandle; 6]>,
    pub params: KernelParams,
}

pub trait KernelDevice: Send + Sync {
    fn limits(&self) -> DeviceLimits;

    /// Compile generated source. Failures carry the compiler log in `ReduceError::Build`.
    fn compile(&self, source: &KernelSource) -> Result<KernelHandle>;
    fn create_kernel(&self, program: &KernelHandle, name: &str) -> Result<Kernel>;

    fn allocate(&self, len: usize, dtype: DType) -> Result<BufferHandle>;
    fn write(&self, buffer: &BufferHandle, data: &HostData) -> Result<()>;
    /// Blocking read; drains all work queued before it.
    fn read(&self, buffer: &BufferHandle) -> Result<HostData>;
    /// Free `buffer` once `event` has completed.
    fn release_after(&self, buffer: BufferHandle, event: Event) -> Result<()>;

    /// Non-blocking enqueue; the launch starts after every event in `wait`.
    fn enqueue(&self, kernel: &Kernel, launch: Launch, wait: &[Event]) -> Result<Event>;
    /// Event that completes once every event in `wait` has completed.
    fn marker(&self, wait: &[Event]) -> Result<Event>;
    fn wait(&self, events: &[Event]) -> Result<()>;
    fn finish(&self) -> Result<()>;

    /// Stable tag used to key persisted cost tables.
    fn device_tag(&self) -> String {
        sanitize_tag(&self.limits().name)
    }
}

pub(crate) fn sanitize_tag(name: &str) -> String {
    let tag: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let tag = tag.trim_matches('-').to_string();
    if tag.is_empty() {
        "unknown-device".to_string()
    } else {
        tag
    }
}
