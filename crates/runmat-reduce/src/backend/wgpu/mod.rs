//! wgpu implementation of [`KernelDevice`].
//!
//! Submissions execute in queue order, so an event is the ordinal of its
//! submission and a wait list only needs to name already-issued events.

pub mod bindings;
pub mod dispatch;
pub mod pipelines;

use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use wgpu::util::DeviceExt;

use crate::device::{
    BufferHandle, DeviceLimits, Event, Kernel, KernelDevice, KernelHandle, Launch,
};
use crate::dtype::{DType, HostData};
use crate::error::{ReduceError, Result};
use crate::kernel::KernelSource;
use pipelines::Program;

#[derive(Clone, Debug)]
pub struct WgpuDeviceOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    /// Request `SHADER_F64` when the adapter offers it.
    pub enable_f64: bool,
}

impl Default for WgpuDeviceOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            enable_f64: true,
        }
    }
}

struct DeviceBuffer {
    buffer: wgpu::Buffer,
    handle: BufferHandle,
}

#[derive(Default)]
struct WgpuState {
    buffers: HashMap<u64, DeviceBuffer>,
    programs: HashMap<u64, Arc<Program>>,
    kernels: HashMap<u64, Arc<Program>>,
    deferred: Vec<(u64, Event)>,
    issued: u64,
    completed: u64,
}

pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: DeviceLimits,
    state: Mutex<WgpuState>,
    next_id: AtomicU64,
}

impl WgpuDevice {
    pub fn new(options: WgpuDeviceOptions) -> Result<Self> {
        pollster::block_on(Self::new_async(options))
    }

    pub async fn new_async(options: WgpuDeviceOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                force_fallback_adapter: options.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| ReduceError::device("wgpu: no compatible adapter found"))?;
        let info = adapter.get_info();
        let supports_f64 =
            options.enable_f64 && adapter.features().contains(wgpu::Features::SHADER_F64);
        if options.enable_f64 && !supports_f64 {
            warn!(
                "adapter '{}' lacks SHADER_F64; f64 reductions will be rejected",
                info.name
            );
        }
        let required_features = if supports_f64 {
            wgpu::Features::SHADER_F64
        } else {
            wgpu::Features::empty()
        };
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("RunMat Reduce Device"),
                    required_features,
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| ReduceError::device(format!("wgpu: request_device failed: {e}")))?;
        let raw = device.limits();
        let limits = DeviceLimits {
            name: info.name.clone(),
            max_work_item_sizes: [
                raw.max_compute_workgroup_size_x,
                raw.max_compute_workgroup_size_y,
                raw.max_compute_workgroup_size_z,
            ],
            max_invocations: raw.max_compute_invocations_per_workgroup,
            local_memory_bytes: raw.max_compute_workgroup_storage_size,
            max_workgroups_per_dim: raw.max_compute_workgroups_per_dimension,
            max_buffer_bytes: (raw.max_storage_buffer_binding_size as u64).min(raw.max_buffer_size),
            supports_f64,
        };
        info!(
            "wgpu adapter '{}' ({:?}) ready: wg_limits={:?} invocations={} shared={}B f64={}",
            info.name,
            info.backend,
            limits.max_work_item_sizes,
            limits.max_invocations,
            limits.local_memory_bytes,
            supports_f64
        );
        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            limits,
            state: Mutex::new(WgpuState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, WgpuState>> {
        self.state
            .lock()
            .map_err(|_| ReduceError::device("wgpu device state lock poisoned"))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_events(state: &WgpuState, wait: &[Event]) -> Result<()> {
        match wait.iter().find(|e| e.0 == 0 || e.0 > state.issued) {
            Some(bad) => Err(ReduceError::device(format!("unknown event {}", bad.0))),
            None => Ok(()),
        }
    }

    /// Block until the queue is idle and free buffers whose release event has passed.
    fn drain(&self) -> Result<()> {
        let target = self.lock()?.issued;
        self.device.poll(wgpu::Maintain::Wait);
        let mut state = self.lock()?;
        state.completed = state.completed.max(target);
        let completed = state.completed;
        let deferred = std::mem::take(&mut state.deferred);
        let (ready, pending): (Vec<_>, Vec<_>) =
            deferred.into_iter().partition(|(_, e)| e.0 <= completed);
        state.deferred = pending;
        for (id, _) in ready {
            if let Some(buf) = state.buffers.remove(&id) {
                buf.buffer.destroy();
            }
        }
        Ok(())
    }

    fn issue(&self, state: &mut WgpuState) -> Event {
        state.issued += 1;
        Event(state.issued)
    }
}

impl KernelDevice for WgpuDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn compile(&self, source: &KernelSource) -> Result<KernelHandle> {
        let program = pipelines::compile(&self.device, source)?;
        let id = self.next_id();
        self.lock()?.programs.insert(id, Arc::new(program));
        Ok(KernelHandle(id))
    }

    fn create_kernel(&self, program: &KernelHandle, name: &str) -> Result<Kernel> {
        let mut state = self.lock()?;
        let compiled = state
            .programs
            .get(&program.0)
            .cloned()
            .ok_or_else(|| ReduceError::device(format!("unknown program {}", program.0)))?;
        if compiled.name != name {
            return Err(ReduceError::device(format!(
                "program {} defines '{}', not '{name}'",
                program.0, compiled.name
            )));
        }
        let id = self.next_id();
        state.kernels.insert(id, compiled);
        Ok(Kernel {
            id,
            name: name.to_string(),
            program: *program,
        })
    }

    fn allocate(&self, len: usize, dtype: DType) -> Result<BufferHandle> {
        let bytes = (len.max(1) * dtype.size_in_bytes()) as u64;
        if bytes > self.limits.max_buffer_bytes {
            return Err(ReduceError::OutOfResources {
                context: format!("allocate {len} x {dtype}"),
                detail: format!("{bytes} bytes exceeds {}", self.limits.max_buffer_bytes),
            });
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("runmat-reduce-buffer"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ReduceError::OutOfResources {
                context: format!("allocate {len} x {dtype}"),
                detail: err.to_string(),
            });
        }
        let handle = BufferHandle {
            id: self.next_id(),
            dtype,
            len,
        };
        self.lock()?
            .buffers
            .insert(handle.id, DeviceBuffer { buffer, handle });
        Ok(handle)
    }

    fn write(&self, buffer: &BufferHandle, data: &HostData) -> Result<()> {
        if data.dtype() != buffer.dtype || data.len() != buffer.len {
            return Err(ReduceError::device(format!(
                "write of {} x {} into buffer of {} x {}",
                data.len(),
                data.dtype(),
                buffer.len,
                buffer.dtype
            )));
        }
        let state = self.lock()?;
        let target = state
            .buffers
            .get(&buffer.id)
            .ok_or_else(|| ReduceError::device(format!("buffer {} is not live", buffer.id)))?;
        if !data.is_empty() {
            self.queue.write_buffer(&target.buffer, 0, &data.to_bytes());
        }
        Ok(())
    }

    fn read(&self, buffer: &BufferHandle) -> Result<HostData> {
        let bytes = (buffer.len * buffer.dtype.size_in_bytes()) as u64;
        if bytes == 0 {
            return Ok(HostData::zeros(buffer.dtype, 0));
        }
        let raw = {
            let state = self.lock()?;
            let source = state
                .buffers
                .get(&buffer.id)
                .ok_or_else(|| ReduceError::device(format!("buffer {} is not live", buffer.id)))?;
            dispatch::readback(&self.device, &self.queue, &source.buffer, bytes)?
        };
        self.drain()?;
        Ok(HostData::from_bytes(buffer.dtype, &raw, buffer.len))
    }

    fn release_after(&self, buffer: BufferHandle, event: Event) -> Result<()> {
        let mut state = self.lock()?;
        Self::check_events(&state, &[event])?;
        if event.0 <= state.completed {
            if let Some(buf) = state.buffers.remove(&buffer.id) {
                buf.buffer.destroy();
            }
        } else {
            state.deferred.push((buffer.id, event));
        }
        Ok(())
    }

    fn enqueue(&self, kernel: &Kernel, launch: Launch, wait: &[Event]) -> Result<Event> {
        let mut state = self.lock()?;
        Self::check_events(&state, wait)?;
        let program = state
            .kernels
            .get(&kernel.id)
            .cloned()
            .ok_or_else(|| ReduceError::device(format!("unknown kernel {}", kernel.name)))?;
        if launch.buffers.len() != program.slots {
            return Err(ReduceError::device(format!(
                "kernel '{}' binds {} buffers, launch supplied {}",
                kernel.name,
                program.slots,
                launch.buffers.len()
            )));
        }
        let max = self.limits.max_workgroups_per_dim;
        if launch.grid.iter().any(|&g| g > max) {
            return Err(ReduceError::OutOfResources {
                context: format!("launch of '{}'", kernel.name),
                detail: format!("grid {:?} exceeds {max} groups per dimension", launch.grid),
            });
        }
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("runmat-reduce-params"),
                contents: bytemuck::bytes_of(&launch.params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let mut entries = Vec::with_capacity(launch.buffers.len() + 1);
        for (i, handle) in launch.buffers.iter().enumerate() {
            let bound = state
                .buffers
                .get(&handle.id)
                .ok_or_else(|| ReduceError::device(format!("buffer {} is not live", handle.id)))?;
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: bound.buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: launch.buffers.len() as u32,
            resource: params.as_entire_binding(),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&kernel.name),
            layout: &program.layout,
            entries: &entries,
        });
        dispatch::dispatch(
            &self.device,
            &self.queue,
            &program.pipeline,
            &bind_group,
            &kernel.name,
            launch.grid,
        );
        Ok(self.issue(&mut state))
    }

    fn marker(&self, wait: &[Event]) -> Result<Event> {
        let mut state = self.lock()?;
        Self::check_events(&state, wait)?;
        Ok(self.issue(&mut state))
    }

    fn wait(&self, events: &[Event]) -> Result<()> {
        {
            let state = self.lock()?;
            Self::check_events(&state, events)?;
            if events.iter().all(|e| e.0 <= state.completed) {
                return Ok(());
            }
        }
        self.drain()
    }

    fn finish(&self) -> Result<()> {
        self.drain()
    }

    fn device_tag(&self) -> String {
        format!("wgpu-{}", crate::device::sanitize_tag(&self.limits.name))
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("limits", &self.limits)
            .finish()
    }
}
