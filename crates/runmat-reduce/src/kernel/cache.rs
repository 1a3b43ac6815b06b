use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::ir::{BindingSlot, KernelIr};
use super::{generate, KernelSource};
use crate::caps::DeviceCaps;
use crate::device::{Kernel, KernelDevice};
use crate::error::{ReduceError, Result};

#[derive(Default)]
struct CacheState {
    sources: HashMap<u64, Arc<KernelSource>>,
    kernels: HashMap<u64, Kernel>,
}

/// Process-scoped memo of generated sources and compiled kernels, keyed by IR hash.
///
/// Lookups, generation, and compilation all happen under one lock, so each kernel
/// object is built and installed once.
pub struct KernelCache {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    dump_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct KernelMeta<'a> {
    name: &'a str,
    key: String,
    workgroup: u32,
    bindings: &'a [BindingSlot],
    ir: &'a KernelIr,
}

impl KernelCache {
    pub fn new(dump_dir: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dump_dir,
        }
    }

    pub fn get_or_build(
        &self,
        device: &dyn KernelDevice,
        caps: &DeviceCaps,
        ir: &KernelIr,
    ) -> Result<Kernel> {
        let key = ir.structural_hash();
        let mut state = self
            .state
            .lock()
            .map_err(|_| ReduceError::device("kernel cache lock poisoned"))?;
        if let Some(kernel) = state.kernels.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(kernel.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let source = match state.sources.get(&key) {
            Some(src) => Arc::clone(src),
            None => {
                let src = Arc::new(generate(ir, caps)?);
                if let Some(dir) = &self.dump_dir {
                    dump_source(dir, &src);
                }
                state.sources.insert(key, Arc::clone(&src));
                src
            }
        };
        log::debug!("compiling kernel {} (key {key:016x})", source.name);
        let program = device.compile(&source)?;
        let kernel = device.create_kernel(&program, &source.name)?;
        state.kernels.insert(key, kernel.clone());
        Ok(kernel)
    }

    /// Generated source for `ir`, if it has been generated.
    pub fn source(&self, ir: &KernelIr) -> Option<Arc<KernelSource>> {
        let state = self.state.lock().ok()?;
        state.sources.get(&ir.structural_hash()).cloned()
    }

    pub fn sources(&self) -> Vec<Arc<KernelSource>> {
        self.state
            .lock()
            .map(|s| s.sources.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.kernels.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)`
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

fn dump_source(dir: &Path, source: &KernelSource) {
    if let Err(err) = std::fs::create_dir_all(dir) {
        log::warn!("kernel dump: cannot create {}: {err}", dir.display());
        return;
    }
    let stem = format!("{:016x}", source.key);
    let wgsl = dir.join(format!("{stem}.wgsl"));
    if let Err(err) = std::fs::write(&wgsl, source.wgsl.as_bytes()) {
        log::warn!("kernel dump: cannot write {}: {err}", wgsl.display());
    }
    let meta = KernelMeta {
        name: &source.name,
        key: stem.clone(),
        workgroup: source.workgroup,
        bindings: &source.bindings,
        ir: &source.ir,
    };
    let path = dir.join(format!("{stem}.json"));
    match serde_json::to_vec_pretty(&meta) {
        Ok(json) => {
            if let Err(err) = std::fs::write(&path, json) {
                log::warn!("kernel dump: cannot write {}: {err}", path.display());
            }
        }
        Err(err) => log::warn!("kernel dump: cannot encode {}: {err}", source.name),
    }
}
