use log::info;
use smallvec::smallvec;

use crate::config::ReduceOptions;
use crate::device::{DeviceLimits, KernelDevice, KernelParams, Launch};
use crate::dtype::{DType, HostData};
use crate::error::{ReduceError, Result};
use crate::kernel::launch::dispatch_size;
use crate::kernel::{generate, KernelIr};

/// Worst-case local memory per lane: an 8-byte value tile plus a 4-byte index tile.
pub const TILE_BYTES_PER_LANE: u32 = 12;

/// Dividend/divisor pairs with large dividends and non-power-of-two divisors.
pub const DIV_PROBE_CASES: [(u32, u32); 8] = [
    (16_777_221, 3),
    (4_294_967_295, 3),
    (1_000_000_007, 10),
    (123_456_789, 1_000),
    (2_147_483_648, 65_535),
    (99_999_999, 7),
    (0, 5),
    (7, 7),
];

/// Immutable per-device snapshot taken when the engine is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    pub limits: DeviceLimits,
    /// Effective lanes per work-group (a power of two).
    pub workgroup: u32,
    pub division_defect: bool,
}

impl DeviceCaps {
    pub fn probe(device: &dyn KernelDevice, options: &ReduceOptions) -> Result<Self> {
        let limits = device.limits();
        let workgroup = effective_workgroup(options.workgroup_size, &limits)?;
        let mut caps = Self {
            limits,
            workgroup,
            division_defect: false,
        };
        caps.division_defect = match options.division_defect {
            Some(forced) => {
                info!("division defect flag forced to {forced}");
                forced
            }
            None => probe_division(device, &caps)?,
        };
        info!(
            "reduction device '{}': wg={} max_groups={} local_mem={} f64={} division_defect={}",
            caps.limits.name,
            caps.workgroup,
            caps.limits.max_workgroups_per_dim,
            caps.limits.local_memory_bytes,
            caps.limits.supports_f64,
            caps.division_defect
        );
        Ok(caps)
    }

    pub fn max_groups(&self) -> u32 {
        self.limits.max_workgroups_per_dim.max(1)
    }

    pub fn supports_f64(&self) -> bool {
        self.limits.supports_f64
    }
}

/// Largest power of two within the request and every per-group device limit.
pub fn effective_workgroup(requested: u32, limits: &DeviceLimits) -> Result<u32> {
    let cap = requested
        .min(limits.max_work_item_sizes[0])
        .min(limits.max_invocations)
        .min(limits.local_memory_bytes / TILE_BYTES_PER_LANE);
    if cap < 2 {
        return Err(ReduceError::device(format!(
            "device '{}' cannot host a reduction work-group (limit {cap})",
            limits.name
        )));
    }
    Ok(1 << (31 - cap.leading_zeros()))
}

/// Run the known-answer division kernel and compare against host arithmetic.
fn probe_division(device: &dyn KernelDevice, caps: &DeviceCaps) -> Result<bool> {
    let ir = KernelIr::DivProbe {
        workgroup: caps.workgroup,
    };
    let source = generate(&ir, caps)?;
    let program = device.compile(&source)?;
    let kernel = device.create_kernel(&program, &source.name)?;

    let n = DIV_PROBE_CASES.len();
    let dividends: Vec<u32> = DIV_PROBE_CASES.iter().map(|&(a, _)| a).collect();
    let divisors: Vec<u32> = DIV_PROBE_CASES.iter().map(|&(_, b)| b).collect();
    let a = device.allocate(n, DType::U32)?;
    let b = device.allocate(n, DType::U32)?;
    let q = device.allocate(n, DType::U32)?;
    let r = device.allocate(n, DType::U32)?;
    device.write(&a, &HostData::U32(dividends.clone()))?;
    device.write(&b, &HostData::U32(divisors.clone()))?;
    let launch = Launch {
        grid: [dispatch_size(n as u32, caps.workgroup), 1, 1],
        buffers: smallvec![a, b, q, r],
        params: KernelParams {
            len: n as u32,
            total: n as u32,
            ..Default::default()
        },
    };
    let done = device.enqueue(&kernel, launch, &[])?;
    device.wait(&[done])?;
    let quotients = device.read(&q)?;
    let remainders = device.read(&r)?;
    for buffer in [a, b, q, r] {
        device.release_after(buffer, done)?;
    }

    let (Some(quotients), Some(remainders)) = (quotients.as_u32(), remainders.as_u32()) else {
        return Err(ReduceError::device("division probe returned non-u32 data"));
    };
    let mut defect = false;
    for (k, (&x, &y)) in dividends.iter().zip(&divisors).enumerate() {
        if quotients[k] != x / y || remainders[k] != x % y {
            log::debug!(
                "division probe mismatch: {x} / {y} gave ({}, {}), expected ({}, {})",
                quotients[k],
                remainders[k],
                x / y,
                x % y
            );
            defect = true;
        }
    }
    if defect {
        info!(
            "device '{}' miscomputes integer division; kernels will use division-free indexing",
            caps.limits.name
        );
    }
    Ok(defect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_x: u32, invocations: u32, local: u32) -> DeviceLimits {
        DeviceLimits {
            name: "test".into(),
            max_work_item_sizes: [max_x, max_x, 64],
            max_invocations: invocations,
            local_memory_bytes: local,
            max_workgroups_per_dim: 65_535,
            max_buffer_bytes: 1 << 30,
            supports_f64: false,
        }
    }

    #[test]
    fn workgroup_is_clamped_to_a_power_of_two() {
        assert_eq!(
            effective_workgroup(256, &limits(1024, 1024, 32 * 1024)).unwrap(),
            256
        );
        assert_eq!(
            effective_workgroup(256, &limits(1024, 192, 32 * 1024)).unwrap(),
            128
        );
        // 1000 bytes / 12 = 83 lanes
        assert_eq!(
            effective_workgroup(256, &limits(1024, 1024, 1000)).unwrap(),
            64
        );
        assert!(effective_workgroup(256, &limits(1, 1, 1024)).is_err());
    }
}
