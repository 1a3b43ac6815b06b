/// Group counts needed to cover `elements` with `tile` per group.
pub fn dispatch_size(elements: u32, tile: u32) -> u32 {
    if elements == 0 {
        0
    } else {
        elements.div_ceil(tile).max(1)
    }
}

/// Launch grid for a flat lane id: x is capped at the per-dimension limit and wraps into y.
/// Returns the grid and the x extent kernels use to rebuild the flat id.
pub fn flat_grid(lanes: u32, workgroup: u32, max_per_dim: u32) -> ([u32; 3], u32) {
    let groups = dispatch_size(lanes, workgroup);
    if groups == 0 {
        return ([0, 0, 0], 0);
    }
    let gx = groups.min(max_per_dim.max(1));
    let gy = groups.div_ceil(gx);
    ([gx, gy, 1], gx)
}

/// One device launch covering part of a logical grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridChunk {
    pub grid: [u32; 3],
    pub base: [u32; 3],
}

/// Split a logical grid into launches whose every dimension fits `max_per_dim`.
pub fn split_grid(grid: [u32; 3], max_per_dim: u32) -> Vec<GridChunk> {
    if grid.iter().any(|&d| d == 0) {
        return Vec::new();
    }
    let max = max_per_dim.max(1);
    let ranges = |extent: u32| {
        (0..extent.div_ceil(max)).map(move |k| {
            let start = k * max;
            (start, (extent - start).min(max))
        })
    };
    let mut chunks = Vec::new();
    for (z0, nz) in ranges(grid[2]) {
        for (y0, ny) in ranges(grid[1]) {
            for (x0, nx) in ranges(grid[0]) {
                chunks.push(GridChunk {
                    grid: [nx, ny, nz],
                    base: [x0, y0, z0],
                });
            }
        }
    }
    chunks
}
