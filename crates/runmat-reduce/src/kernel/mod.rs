//! Reduction template generator: a typed kernel IR lowered to WGSL.

pub mod cache;
pub mod inject;
pub mod ir;
pub mod launch;
pub mod wgsl;

pub use cache::KernelCache;
pub use inject::{Inject, Topology};
pub use ir::{
    Access, BindingSlot, BroadcastIr, BroadcastOp, IndexMath, KernelIr, LaneLoad, ReduceIr,
    ReduceStage, ScatterIr, ScatterMode,
};

use crate::caps::DeviceCaps;
use crate::dtype::DType;
use crate::error::{ReduceError, Result};

/// Generated program handed to the compilation service.
#[derive(Clone, Debug)]
pub struct KernelSource {
    pub name: String,
    pub key: u64,
    pub ir: KernelIr,
    pub workgroup: u32,
    pub bindings: Vec<BindingSlot>,
    pub wgsl: String,
}

/// Lower `ir` for a device. Refuses integer division on devices with the division defect.
pub fn generate(ir: &KernelIr, caps: &DeviceCaps) -> Result<KernelSource> {
    let name = ir.name();
    let divides = ir.index_math() == IndexMath::Divide;
    if divides && caps.division_defect && !matches!(ir, KernelIr::DivProbe { .. }) {
        return Err(ReduceError::Codegen {
            kernel: name,
            reason: "integer division requested on a device with the division defect".into(),
        });
    }
    let wg = ir.workgroup();
    if !wg.is_power_of_two() || wg > caps.workgroup {
        return Err(ReduceError::Codegen {
            kernel: name,
            reason: format!(
                "work-group size {wg} must be a power of two no larger than {}",
                caps.workgroup
            ),
        });
    }
    let dtype = match ir {
        KernelIr::Reduce(r) => Some(r.dtype),
        KernelIr::Scatter(s) => Some(s.dtype),
        KernelIr::Broadcast(b) => Some(b.dtype),
        KernelIr::DivProbe { .. } => None,
    };
    if let Some(dtype) = dtype {
        if !dtype.is_numeric() {
            return Err(ReduceError::Codegen {
                kernel: name,
                reason: format!("no template for dtype {dtype}"),
            });
        }
    }
    match ir {
        // WGSL has no 64-bit atomics.
        KernelIr::Scatter(s) if s.mode.atomic() && s.dtype == DType::F64 => {
            return Err(ReduceError::UnsupportedDType {
                op: "scatter_add",
                dtype: s.dtype,
            });
        }
        KernelIr::Broadcast(b) if !b.dtype.is_float() => {
            return Err(ReduceError::UnsupportedDType {
                op: "softmax",
                dtype: b.dtype,
            });
        }
        _ => {}
    }
    let source = wgsl::emit(ir);
    log::debug!("generated kernel {name} ({} bytes)", source.len());
    Ok(KernelSource {
        key: ir.structural_hash(),
        workgroup: wg,
        bindings: ir.bindings(),
        ir: *ir,
        name,
        wgsl: source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceLimits;

    fn caps(division_defect: bool) -> DeviceCaps {
        DeviceCaps {
            limits: DeviceLimits {
                name: "codegen".into(),
                max_work_item_sizes: [256, 256, 64],
                max_invocations: 256,
                local_memory_bytes: 32 * 1024,
                max_workgroups_per_dim: 65_535,
                max_buffer_bytes: 1 << 30,
                supports_f64: true,
            },
            workgroup: 256,
            division_defect,
        }
    }

    fn scatter(mode: ScatterMode, dtype: DType) -> KernelIr {
        KernelIr::Scatter(ScatterIr {
            mode,
            dtype,
            workgroup: 64,
            index_math: IndexMath::Grid,
        })
    }

    #[test]
    fn f64_atomic_scatter_is_rejected() {
        for mode in ScatterMode::ALL {
            let result = generate(&scatter(mode, DType::F64), &caps(false));
            if mode.atomic() {
                let err = result.expect_err("atomic f64 scatter");
                assert!(err.is_configuration(), "{mode:?}: {err}");
            } else {
                assert!(result.is_ok(), "{mode:?}");
            }
        }
        assert!(generate(&scatter(ScatterMode::RowAtomic, DType::F32), &caps(false)).is_ok());
    }

    #[test]
    fn integer_broadcast_is_rejected() {
        let ir = KernelIr::Broadcast(BroadcastIr {
            op: BroadcastOp::ExpSub,
            dtype: DType::I32,
            workgroup: 64,
            index_math: IndexMath::Grid,
        });
        assert!(matches!(
            generate(&ir, &caps(false)),
            Err(ReduceError::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn division_is_refused_on_defect_devices() {
        let ir = KernelIr::Reduce(ReduceIr::serial(Inject::Sum, DType::U32, 64, IndexMath::Divide));
        assert!(generate(&ir, &caps(false)).is_ok());
        assert!(matches!(generate(&ir, &caps(true)), Err(ReduceError::Codegen { .. })));
        assert!(generate(&KernelIr::DivProbe { workgroup: 64 }, &caps(true)).is_ok());
    }
}
