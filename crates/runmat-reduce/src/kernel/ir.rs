use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::inject::Inject;
use crate::dtype::DType;

/// Bump when generated layouts or uniform fields change.
pub const KERNEL_IR_VERSION: u32 = 1;

/// How each lane of a tree stage fills its tile slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneLoad {
    /// One element per lane: segment `s` covers `[s*G, s*G + G)`.
    One,
    /// Two elements per lane: segment `s` covers `[s*2G, s*2G + 2G)`.
    Two,
    /// A single group walks the whole row with stride `G`.
    Strided,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceStage {
    /// One lane folds one output row sequentially.
    Serial,
    /// Groups load a segment and reduce it with a halving tree.
    Tree(LaneLoad),
    /// `segments` groups per row consume it with a grid-stride loop, then a tree.
    GridStride,
}

/// How a kernel recovers logical coordinates from its launch indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexMath {
    /// Flat lane id split with integer `/` and `%`.
    Divide,
    /// Flat lane id split with shifts and masks; divisors are powers of two.
    Shift,
    /// Coordinates come straight from a multi-dimensional launch grid.
    Grid,
}

impl IndexMath {
    /// Pick the split for a flat lane id over `dims` (innermost first).
    pub fn for_dims(dims: &[usize], division_defect: bool) -> Self {
        if dims.iter().all(|d| d.is_power_of_two()) {
            IndexMath::Shift
        } else if division_defect {
            IndexMath::Grid
        } else {
            IndexMath::Divide
        }
    }

    fn tag(self) -> &'static str {
        match self {
            IndexMath::Divide => "div",
            IndexMath::Shift => "shift",
            IndexMath::Grid => "grid",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceIr {
    pub inject: Inject,
    pub dtype: DType,
    pub stage: ReduceStage,
    /// Read indices from a carried index buffer instead of using element positions.
    pub carry_index: bool,
    /// Write reduced values; the final round of an arg-reduction writes indices only.
    pub write_values: bool,
    pub workgroup: u32,
    pub index_math: IndexMath,
}

impl ReduceIr {
    pub fn tree(inject: Inject, dtype: DType, load: LaneLoad, workgroup: u32) -> Self {
        Self {
            inject,
            dtype,
            stage: ReduceStage::Tree(load),
            carry_index: false,
            write_values: true,
            workgroup,
            index_math: IndexMath::Grid,
        }
    }

    pub fn grid_stride(inject: Inject, dtype: DType, workgroup: u32) -> Self {
        Self {
            stage: ReduceStage::GridStride,
            ..Self::tree(inject, dtype, LaneLoad::One, workgroup)
        }
    }

    pub fn serial(inject: Inject, dtype: DType, workgroup: u32, index_math: IndexMath) -> Self {
        Self {
            stage: ReduceStage::Serial,
            index_math,
            ..Self::tree(inject, dtype, LaneLoad::One, workgroup)
        }
    }

    pub fn carrying(mut self, carry_index: bool) -> Self {
        self.carry_index = carry_index && self.inject.indexed();
        self
    }

    /// Final-round output shape: arg-reductions emit indices only.
    pub fn finishing(mut self, last: bool) -> Self {
        self.write_values = !(last && self.inject.indexed());
        self
    }

    pub fn writes_index(&self) -> bool {
        self.inject.indexed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScatterMode {
    /// One lane per addend element, bounds-checked atomic add.
    AtomicElement,
    /// One lane per destination element, scanning every source row.
    ClassSerial,
    /// One group per destination element, strided scan plus tree.
    ClassTree,
    /// One group per source row, lanes stride across the row with atomics.
    RowAtomic,
    /// Like `AtomicElement` without the bounds check.
    AtomicUnchecked,
}

impl ScatterMode {
    pub const ALL: [ScatterMode; 5] = [
        ScatterMode::AtomicElement,
        ScatterMode::ClassSerial,
        ScatterMode::ClassTree,
        ScatterMode::RowAtomic,
        ScatterMode::AtomicUnchecked,
    ];

    pub fn from_mode(mode: u8) -> Option<Self> {
        Self::ALL.get(mode as usize).copied()
    }

    pub fn mode(self) -> u8 {
        self as u8
    }

    pub fn atomic(self) -> bool {
        matches!(
            self,
            ScatterMode::AtomicElement | ScatterMode::RowAtomic | ScatterMode::AtomicUnchecked
        )
    }

    pub fn checked(self) -> bool {
        !matches!(self, ScatterMode::AtomicUnchecked)
    }

    fn tag(self) -> &'static str {
        match self {
            ScatterMode::AtomicElement => "atomic_elem",
            ScatterMode::ClassSerial => "class_serial",
            ScatterMode::ClassTree => "class_tree",
            ScatterMode::RowAtomic => "row_atomic",
            ScatterMode::AtomicUnchecked => "atomic_unchecked",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScatterIr {
    pub mode: ScatterMode,
    pub dtype: DType,
    pub workgroup: u32,
    pub index_math: IndexMath,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastOp {
    /// `dst = exp(src - stat[row])`
    ExpSub,
    /// `dst = dst / stat[row]`
    Div,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastIr {
    pub op: BroadcastOp,
    pub dtype: DType,
    pub workgroup: u32,
    pub index_math: IndexMath,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelIr {
    Reduce(ReduceIr),
    Scatter(ScatterIr),
    Broadcast(BroadcastIr),
    /// Integer division self-test; the only kernel allowed to divide on every device.
    DivProbe { workgroup: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Access {
    Read,
    ReadWrite,
    Atomic,
}

/// One storage binding in declaration order. The uniform block always follows the last slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BindingSlot {
    pub name: &'static str,
    pub access: Access,
    pub dtype: DType,
}

impl BindingSlot {
    const fn new(name: &'static str, access: Access, dtype: DType) -> Self {
        Self { name, access, dtype }
    }
}

impl KernelIr {
    pub fn workgroup(&self) -> u32 {
        match self {
            KernelIr::Reduce(r) => r.workgroup,
            KernelIr::Scatter(s) => s.workgroup,
            KernelIr::Broadcast(b) => b.workgroup,
            KernelIr::DivProbe { workgroup } => *workgroup,
        }
    }

    pub fn index_math(&self) -> IndexMath {
        match self {
            KernelIr::Reduce(r) => r.index_math,
            KernelIr::Scatter(s) => s.index_math,
            KernelIr::Broadcast(b) => b.index_math,
            KernelIr::DivProbe { .. } => IndexMath::Divide,
        }
    }

    pub fn bindings(&self) -> Vec<BindingSlot> {
        match self {
            KernelIr::Reduce(r) => {
                let mut slots = vec![BindingSlot::new("src", Access::Read, r.dtype)];
                if r.carry_index {
                    slots.push(BindingSlot::new("src_idx", Access::Read, DType::U32));
                }
                if r.write_values {
                    slots.push(BindingSlot::new("dst", Access::ReadWrite, r.dtype));
                }
                if r.writes_index() {
                    slots.push(BindingSlot::new("dst_idx", Access::ReadWrite, DType::U32));
                }
                slots
            }
            KernelIr::Scatter(s) => {
                let acc = if s.mode.atomic() {
                    Access::Atomic
                } else {
                    Access::ReadWrite
                };
                vec![
                    BindingSlot::new("indices", Access::Read, DType::U32),
                    BindingSlot::new("addend", Access::Read, s.dtype),
                    BindingSlot::new("acc", acc, s.dtype),
                ]
            }
            KernelIr::Broadcast(b) => match b.op {
                BroadcastOp::ExpSub => vec![
                    BindingSlot::new("src", Access::Read, b.dtype),
                    BindingSlot::new("stat", Access::Read, b.dtype),
                    BindingSlot::new("dst", Access::ReadWrite, b.dtype),
                ],
                BroadcastOp::Div => vec![
                    BindingSlot::new("stat", Access::Read, b.dtype),
                    BindingSlot::new("dst", Access::ReadWrite, b.dtype),
                ],
            },
            KernelIr::DivProbe { .. } => vec![
                BindingSlot::new("dividend", Access::Read, DType::U32),
                BindingSlot::new("divisor", Access::Read, DType::U32),
                BindingSlot::new("quotient", Access::ReadWrite, DType::U32),
                BindingSlot::new("remainder", Access::ReadWrite, DType::U32),
            ],
        }
    }

    /// Deterministic kernel name: operation, dtype, shape of the template, variant flags.
    pub fn name(&self) -> String {
        match self {
            KernelIr::Reduce(r) => {
                let stage = match r.stage {
                    ReduceStage::Serial => format!("serial_{}", r.index_math.tag()),
                    ReduceStage::Tree(LaneLoad::One) => "tree1".to_string(),
                    ReduceStage::Tree(LaneLoad::Two) => "tree2".to_string(),
                    ReduceStage::Tree(LaneLoad::Strided) => "tree_strided".to_string(),
                    ReduceStage::GridStride => "grid_stride".to_string(),
                };
                let mut name = format!(
                    "reduce_{}_{}_{}_wg{}",
                    r.inject, r.dtype, stage, r.workgroup
                );
                if r.carry_index {
                    name.push_str("_ci");
                }
                if !r.write_values {
                    name.push_str("_idx_only");
                }
                name
            }
            KernelIr::Scatter(s) => format!(
                "scatter_add_{}_{}_{}_wg{}",
                s.dtype,
                s.mode.tag(),
                s.index_math.tag(),
                s.workgroup
            ),
            KernelIr::Broadcast(b) => {
                let op = match b.op {
                    BroadcastOp::ExpSub => "exp_sub",
                    BroadcastOp::Div => "div",
                };
                format!(
                    "broadcast_{op}_{}_{}_wg{}",
                    b.dtype,
                    b.index_math.tag(),
                    b.workgroup
                )
            }
            KernelIr::DivProbe { workgroup } => format!("div_probe_wg{workgroup}"),
        }
    }

    /// Structural hash used as the kernel cache key.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        KERNEL_IR_VERSION.hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_final_round_binds_index_output_only() {
        let ir = ReduceIr::tree(Inject::ArgMax, DType::F32, LaneLoad::One, 64)
            .carrying(true)
            .finishing(true);
        let names: Vec<_> = KernelIr::Reduce(ir)
            .bindings()
            .iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, ["src", "src_idx", "dst_idx"]);
    }

    #[test]
    fn carry_is_ignored_for_value_reductions() {
        let ir = ReduceIr::tree(Inject::Sum, DType::F32, LaneLoad::One, 64).carrying(true);
        assert!(!ir.carry_index);
    }

    #[test]
    fn names_and_hashes_distinguish_variants() {
        let a = KernelIr::Reduce(ReduceIr::tree(Inject::Max, DType::F32, LaneLoad::One, 64));
        let b = KernelIr::Reduce(ReduceIr::tree(Inject::Max, DType::F32, LaneLoad::Two, 64));
        assert_ne!(a.name(), b.name());
        assert_ne!(a.structural_hash(), b.structural_hash());
        let again = KernelIr::Reduce(ReduceIr::tree(Inject::Max, DType::F32, LaneLoad::One, 64));
        assert_eq!(a.structural_hash(), again.structural_hash());
    }

    #[test]
    fn index_math_prefers_shifts_then_grid_on_defect() {
        assert_eq!(IndexMath::for_dims(&[8, 64], true), IndexMath::Shift);
        assert_eq!(IndexMath::for_dims(&[6], false), IndexMath::Divide);
        assert_eq!(IndexMath::for_dims(&[6], true), IndexMath::Grid);
    }
}
