//! Cost model, mode dispatch, and offline calibration.

pub mod bucket;
pub mod calibrate;
pub mod dispatch;
pub mod table;
pub mod workload;

pub use bucket::bucket;
pub use calibrate::{CalibrationReport, Calibrator, Workload};
pub use dispatch::{select_mode, CostModel, Dispatcher, Strategy, TunedArgs};
pub use table::{CostTable, TableStore};
pub use workload::DeviceWorkload;

use std::fmt;

/// Operations with more than one implementation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TunedOp {
    ScatterAdd,
    ReduceSum,
    ReduceMax,
    ReduceArgMax,
}

impl TunedOp {
    pub const ALL: [TunedOp; 4] = [
        TunedOp::ScatterAdd,
        TunedOp::ReduceSum,
        TunedOp::ReduceMax,
        TunedOp::ReduceArgMax,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TunedOp::ScatterAdd => "scatter_add",
            TunedOp::ReduceSum => "reduce_sum",
            TunedOp::ReduceMax => "reduce_max",
            TunedOp::ReduceArgMax => "reduce_arg_max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn modes(self) -> std::ops::Range<u8> {
        match self {
            TunedOp::ScatterAdd => 0..5,
            _ => 0..4,
        }
    }

    /// Number of table key dimensions: `(rows, cols, classes)` or `(rows, cols)`.
    pub fn arity(self) -> usize {
        match self {
            TunedOp::ScatterAdd => 3,
            _ => 2,
        }
    }

    /// Axis reductions prefer the one-group kernel when the reduced length fits a group.
    pub fn prefers_single_group(self) -> bool {
        !matches!(self, TunedOp::ScatterAdd)
    }

    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TunedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
