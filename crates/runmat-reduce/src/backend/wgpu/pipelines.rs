use std::borrow::Cow;

use super::bindings::build_layout;
use crate::error::{ReduceError, Result};
use crate::kernel::KernelSource;

pub struct Program {
    pub name: String,
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
    pub slots: usize,
}

pub fn create_shader_module(device: &wgpu::Device, label: &str, wgsl: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(wgsl)),
    })
}

/// Build a compute pipeline inside a validation scope so compiler diagnostics come back
/// as `ReduceError::Build` instead of reaching the uncaptured-error handler.
pub fn compile(device: &wgpu::Device, source: &KernelSource) -> Result<Program> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = create_shader_module(device, &source.name, &source.wgsl);
    let layout = build_layout(device, &format!("{}-bgl", source.name), &source.bindings);
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{}-pl", source.name)),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&source.name),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: "main",
    });
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(ReduceError::Build {
            name: source.name.clone(),
            log: err.to_string(),
        });
    }
    Ok(Program {
        name: source.name.clone(),
        pipeline,
        layout,
        slots: source.bindings.len(),
    })
}
