use wgpu::{BindGroupLayoutEntry, BindingType, BufferBindingType, ShaderStages};

use crate::kernel::{Access, BindingSlot};

pub fn storage_read_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub fn storage_read_write_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub fn uniform_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Layout entries for a generated kernel: storage slots in order, then the uniform block.
pub fn layout_entries(slots: &[BindingSlot]) -> Vec<BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(slots.len() + 1);
    for (i, slot) in slots.iter().enumerate() {
        entries.push(match slot.access {
            Access::Read => storage_read_entry(i as u32),
            Access::ReadWrite | Access::Atomic => storage_read_write_entry(i as u32),
        });
    }
    entries.push(uniform_entry(slots.len() as u32));
    entries
}

pub fn build_layout(
    device: &wgpu::Device,
    label: &str,
    slots: &[BindingSlot],
) -> wgpu::BindGroupLayout {
    let entries = layout_entries(slots);
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    })
}
