use crate::error::{ReduceError, Result};

pub fn submit(queue: &wgpu::Queue, enc: wgpu::CommandEncoder) -> wgpu::SubmissionIndex {
    queue.submit(Some(enc.finish()))
}

pub fn dispatch(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    label: &str,
    grid: [u32; 3],
) -> wgpu::SubmissionIndex {
    let mut enc = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some(label),
    });
    {
        let mut pass = enc.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(grid[0], grid[1], grid[2]);
    }
    submit(queue, enc)
}

/// Copy `size` bytes of `src` into a staging buffer and map it back to the host.
pub fn readback(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    size: u64,
) -> Result<Vec<u8>> {
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("runmat-reduce-readback"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut enc = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("runmat-reduce-readback-enc"),
    });
    enc.copy_buffer_to_buffer(src, 0, &staging, 0, size);
    submit(queue, enc);
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        // The receiver is gone only if the readback already bailed out.
        let _ = tx.send(res);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| ReduceError::device("readback: map_async callback dropped"))?
        .map_err(|e| ReduceError::device(format!("readback: {e}")))?;
    let data = slice.get_mapped_range();
    let out = data.to_vec();
    drop(data);
    staging.unmap();
    Ok(out)
}
