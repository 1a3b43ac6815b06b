//! In-process device that executes the kernel IR on the calling thread.
//!
//! Work is queued FIFO and only runs when something drains the queue (`wait`,
//! `read`, `write`, `finish`), so tests observe real enqueue/complete ordering.

mod exec;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::device::{
    BufferHandle, DeviceLimits, Event, Kernel, KernelDevice, KernelHandle, Launch,
};
use crate::dtype::{DType, HostData};
use crate::error::{ReduceError, Result};
use crate::kernel::{KernelIr, KernelSource};
use exec::Exec;

#[derive(Clone, Debug)]
pub struct HostDeviceConfig {
    pub limits: DeviceLimits,
    /// Total bytes of live buffers before allocation reports out-of-resources.
    pub memory_limit: Option<u64>,
    /// Route non-power-of-two integer division through `f32`, like a defective driver.
    pub simulate_division_defect: bool,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            limits: DeviceLimits {
                name: "runmat-host".to_string(),
                max_work_item_sizes: [1024, 1024, 64],
                max_invocations: 1024,
                local_memory_bytes: 32 * 1024,
                max_workgroups_per_dim: 65_535,
                max_buffer_bytes: 1 << 30,
                supports_f64: true,
            },
            memory_limit: None,
            simulate_division_defect: false,
        }
    }
}

/// One recorded launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRecord {
    pub kernel: String,
    pub grid: [u32; 3],
    pub wait: Vec<Event>,
    pub event: Event,
}

enum Command {
    Launch {
        event: u64,
        kernel: u64,
        launch: Launch,
    },
    Marker {
        event: u64,
    },
    Release {
        buffer: u64,
    },
}

struct HostKernel {
    name: String,
    ir: KernelIr,
    bindings: usize,
    dtypes: Vec<DType>,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    issued: u64,
    completed: u64,
    buffers: HashMap<u64, HostData>,
    buffer_bytes: HashMap<u64, u64>,
    allocated: u64,
    programs: HashMap<u64, KernelSource>,
    kernels: HashMap<u64, HostKernel>,
    queue: VecDeque<Command>,
    launches: Vec<LaunchRecord>,
    failing_builds: Vec<(String, String)>,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_event(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    fn check_wait(&self, wait: &[Event]) -> Result<()> {
        for ev in wait {
            if ev.0 == 0 || ev.0 > self.issued {
                return Err(ReduceError::device(format!("unknown event {}", ev.0)));
            }
        }
        Ok(())
    }

    fn release(&mut self, buffer: u64) {
        self.buffers.remove(&buffer);
        if let Some(bytes) = self.buffer_bytes.remove(&buffer) {
            self.allocated = self.allocated.saturating_sub(bytes);
        }
    }

    fn drain(&mut self, division_defect: bool) -> Result<()> {
        while let Some(cmd) = self.queue.pop_front() {
            match cmd {
                Command::Launch {
                    event,
                    kernel,
                    launch,
                } => {
                    let Some(k) = self.kernels.get(&kernel) else {
                        self.fail_pending();
                        return Err(ReduceError::device(format!("kernel {kernel} was destroyed")));
                    };
                    let ir = k.ir;
                    let name = k.name.clone();
                    let mut exec = Exec {
                        buffers: &mut self.buffers,
                        name: &name,
                        division_defect,
                    };
                    if let Err(err) = exec.run(&ir, &launch) {
                        self.fail_pending();
                        return Err(err);
                    }
                    self.completed = event;
                }
                Command::Marker { event } => self.completed = event,
                Command::Release { buffer } => self.release(buffer),
            }
        }
        Ok(())
    }

    /// A faulted queue completes everything still pending; buffers queued for release are freed.
    fn fail_pending(&mut self) {
        while let Some(cmd) = self.queue.pop_front() {
            if let Command::Release { buffer } = cmd {
                self.release(buffer);
            }
        }
        self.completed = self.issued;
    }
}

pub struct HostDevice {
    config: HostDeviceConfig,
    state: Mutex<HostState>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_config(HostDeviceConfig::default())
    }

    pub fn with_config(config: HostDeviceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HostState::default()),
        }
    }

    /// Shrink the per-group lane limits, e.g. to exercise multi-round reductions on small inputs.
    pub fn with_max_workgroup(mut self, lanes: u32) -> Self {
        let limits = &mut self.config.limits;
        limits.max_work_item_sizes[0] = lanes;
        limits.max_invocations = lanes;
        self
    }

    pub fn with_max_groups_per_dim(mut self, groups: u32) -> Self {
        self.config.limits.max_workgroups_per_dim = groups;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.config.memory_limit = Some(bytes);
        self
    }

    pub fn with_division_defect(mut self, defect: bool) -> Self {
        self.config.simulate_division_defect = defect;
        self
    }

    pub fn without_f64(mut self) -> Self {
        self.config.limits.supports_f64 = false;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.config.limits.name = name.to_string();
        self
    }

    /// Make compilation of kernels whose name contains `pattern` fail with `log`.
    pub fn fail_builds_matching(&self, pattern: &str, log: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .failing_builds
                .push((pattern.to_string(), log.to_string()));
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| ReduceError::device("host device state poisoned"))
    }

    fn drain(&self, state: &mut HostState) -> Result<()> {
        state.drain(self.config.simulate_division_defect)
    }

    /// Allocate and fill a buffer.
    pub fn upload(&self, data: &HostData) -> Result<BufferHandle> {
        let handle = self.allocate(data.len(), data.dtype())?;
        self.write(&handle, data)?;
        Ok(handle)
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state
            .lock()
            .map(|s| s.launches.clone())
            .unwrap_or_default()
    }

    pub fn clear_launches(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.launches.clear();
        }
    }

    /// Commands enqueued but not yet executed.
    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().map(|s| s.buffers.len()).unwrap_or(0)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().map(|s| s.allocated).unwrap_or(0)
    }

    pub fn is_complete(&self, event: Event) -> bool {
        self.state
            .lock()
            .map(|s| s.completed >= event.0)
            .unwrap_or(false)
    }
}

impl KernelDevice for HostDevice {
    fn limits(&self) -> DeviceLimits {
        self.config.limits.clone()
    }

    fn compile(&self, source: &KernelSource) -> Result<KernelHandle> {
        let mut state = self.lock()?;
        if let Some((_, log)) = state
            .failing_builds
            .iter()
            .find(|(pattern, _)| source.name.contains(pattern.as_str()))
        {
            return Err(ReduceError::Build {
                name: source.name.clone(),
                log: log.clone(),
            });
        }
        if source.wgsl.trim().is_empty() {
            return Err(ReduceError::Build {
                name: source.name.clone(),
                log: "empty module".to_string(),
            });
        }
        let id = state.next_id();
        state.programs.insert(id, source.clone());
        Ok(KernelHandle(id))
    }

    fn create_kernel(&self, program: &KernelHandle, name: &str) -> Result<Kernel> {
        let mut state = self.lock()?;
        let source = state
            .programs
            .get(&program.0)
            .ok_or_else(|| ReduceError::device(format!("unknown program {}", program.0)))?;
        if source.name != name {
            return Err(ReduceError::device(format!(
                "program {} has no entry named '{name}'",
                program.0
            )));
        }
        let kernel = HostKernel {
            name: source.name.clone(),
            ir: source.ir,
            bindings: source.bindings.len(),
            dtypes: source.bindings.iter().map(|b| b.dtype).collect(),
        };
        let id = state.next_id();
        state.kernels.insert(id, kernel);
        Ok(Kernel {
            id,
            name: name.to_string(),
            program: *program,
        })
    }

    fn allocate(&self, len: usize, dtype: DType) -> Result<BufferHandle> {
        let mut state = self.lock()?;
        let bytes = (len as u64).saturating_mul(dtype.size_in_bytes() as u64);
        if bytes > self.config.limits.max_buffer_bytes {
            return Err(ReduceError::OutOfResources {
                context: "allocate".into(),
                detail: format!(
                    "{bytes} bytes exceeds the {} byte buffer limit",
                    self.config.limits.max_buffer_bytes
                ),
            });
        }
        if let Some(limit) = self.config.memory_limit {
            if state.allocated.saturating_add(bytes) > limit {
                return Err(ReduceError::OutOfResources {
                    context: "allocate".into(),
                    detail: format!(
                        "{bytes} bytes requested with {} of {limit} in use",
                        state.allocated
                    ),
                });
            }
        }
        let id = state.next_id();
        state.buffers.insert(id, HostData::zeros(dtype, len));
        state.buffer_bytes.insert(id, bytes);
        state.allocated += bytes;
        Ok(BufferHandle { id, dtype, len })
    }

    fn write(&self, buffer: &BufferHandle, data: &HostData) -> Result<()> {
        let mut state = self.lock()?;
        self.drain(&mut state)?;
        let slot = state
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| ReduceError::device(format!("buffer {} is not live", buffer.id)))?;
        if slot.dtype() != data.dtype() || slot.len() != data.len() {
            return Err(ReduceError::device(format!(
                "write of {} x {} into buffer {} of {} x {}",
                data.len(),
                data.dtype(),
                buffer.id,
                slot.len(),
                slot.dtype()
            )));
        }
        *slot = data.clone();
        Ok(())
    }

    fn read(&self, buffer: &BufferHandle) -> Result<HostData> {
        let mut state = self.lock()?;
        self.drain(&mut state)?;
        state
            .buffers
            .get(&buffer.id)
            .cloned()
            .ok_or_else(|| ReduceError::device(format!("buffer {} is not live", buffer.id)))
    }

    fn release_after(&self, buffer: BufferHandle, event: Event) -> Result<()> {
        let mut state = self.lock()?;
        state.check_wait(&[event])?;
        if state.completed >= event.0 && state.queue.is_empty() {
            state.release(buffer.id);
        } else {
            state.queue.push_back(Command::Release { buffer: buffer.id });
        }
        Ok(())
    }

    fn enqueue(&self, kernel: &Kernel, launch: Launch, wait: &[Event]) -> Result<Event> {
        let mut state = self.lock()?;
        state.check_wait(wait)?;
        let k = state
            .kernels
            .get(&kernel.id)
            .ok_or_else(|| ReduceError::device(format!("unknown kernel '{}'", kernel.name)))?;
        if launch.buffers.len() != k.bindings {
            return Err(ReduceError::device(format!(
                "kernel '{}' binds {} buffers, launch supplied {}",
                k.name,
                k.bindings,
                launch.buffers.len()
            )));
        }
        for (slot, (buffer, dtype)) in launch.buffers.iter().zip(&k.dtypes).enumerate() {
            if !state.buffers.contains_key(&buffer.id) {
                return Err(ReduceError::device(format!(
                    "kernel '{}' binding {slot}: buffer {} is not live",
                    k.name, buffer.id
                )));
            }
            if buffer.dtype != *dtype {
                return Err(ReduceError::device(format!(
                    "kernel '{}' binding {slot}: expected {dtype}, got {}",
                    k.name, buffer.dtype
                )));
            }
        }
        let max = self.config.limits.max_workgroups_per_dim;
        if launch.grid.iter().any(|&g| g > max) {
            return Err(ReduceError::device(format!(
                "kernel '{}': grid {:?} exceeds {max} groups per dimension",
                k.name, launch.grid
            )));
        }
        let name = k.name.clone();
        let event = state.next_event();
        state.launches.push(LaunchRecord {
            kernel: name,
            grid: launch.grid,
            wait: wait.to_vec(),
            event: Event(event),
        });
        state.queue.push_back(Command::Launch {
            event,
            kernel: kernel.id,
            launch,
        });
        Ok(Event(event))
    }

    fn marker(&self, wait: &[Event]) -> Result<Event> {
        let mut state = self.lock()?;
        state.check_wait(wait)?;
        let event = state.next_event();
        state.queue.push_back(Command::Marker { event });
        Ok(Event(event))
    }

    fn wait(&self, events: &[Event]) -> Result<()> {
        let mut state = self.lock()?;
        state.check_wait(events)?;
        self.drain(&mut state)
    }

    fn finish(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.drain(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_respects_memory_limit() {
        let dev = HostDevice::new().with_memory_limit(64);
        let a = dev.allocate(8, DType::F32).unwrap();
        assert!(matches!(
            dev.allocate(16, DType::F32),
            Err(ReduceError::OutOfResources { .. })
        ));
        dev.release_after(a, dev.marker(&[]).unwrap()).unwrap();
        dev.finish().unwrap();
        assert!(dev.allocate(16, DType::F32).is_ok());
    }

    #[test]
    fn unknown_events_are_rejected() {
        let dev = HostDevice::new();
        assert!(dev.marker(&[Event(42)]).is_err());
    }

    #[test]
    fn write_checks_shape() {
        let dev = HostDevice::new();
        let buf = dev.allocate(3, DType::I32).unwrap();
        assert!(dev.write(&buf, &HostData::I32(vec![1, 2])).is_err());
        dev.write(&buf, &HostData::I32(vec![1, 2, 3])).unwrap();
        assert_eq!(dev.read(&buf).unwrap(), HostData::I32(vec![1, 2, 3]));
    }
}
