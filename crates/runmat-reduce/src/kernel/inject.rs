use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dtype::{DType, Element, Scalar};

/// Combining operator injected into a reduction template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inject {
    Sum,
    Max,
    Min,
    ArgMax,
    ArgMin,
}

impl Inject {
    pub fn name(self) -> &'static str {
        match self {
            Inject::Sum => "sum",
            Inject::Max => "max",
            Inject::Min => "min",
            Inject::ArgMax => "argmax",
            Inject::ArgMin => "argmin",
        }
    }

    /// Index-tracking reductions carry a parallel `u32` index through every step.
    pub fn indexed(self) -> bool {
        matches!(self, Inject::ArgMax | Inject::ArgMin)
    }

    /// True for max-oriented comparisons.
    pub fn is_max(self) -> bool {
        matches!(self, Inject::Max | Inject::ArgMax)
    }

    /// Identity element: 0 for sum, the type minimum for max, the type maximum for min.
    pub fn identity<T: Element>(self) -> T {
        match self {
            Inject::Sum => T::zero(),
            Inject::Max | Inject::ArgMax => T::lowest(),
            Inject::Min | Inject::ArgMin => T::highest(),
        }
    }

    pub fn identity_scalar(self, dtype: DType) -> Option<Scalar> {
        Some(match dtype {
            DType::F32 => self.identity::<f32>().to_scalar(),
            DType::F64 => self.identity::<f64>().to_scalar(),
            DType::I32 => self.identity::<i32>().to_scalar(),
            DType::U32 => self.identity::<u32>().to_scalar(),
            DType::Bool => return None,
        })
    }

    /// Value combine for non-indexed reductions. NaN is dominant for max and min.
    pub fn combine<T: Element>(self, a: T, b: T) -> T {
        match self {
            Inject::Sum => a.add(b),
            Inject::Max | Inject::ArgMax => {
                if a.is_nan() {
                    a
                } else if b.is_nan() || b > a {
                    b
                } else {
                    a
                }
            }
            Inject::Min | Inject::ArgMin => {
                if a.is_nan() {
                    a
                } else if b.is_nan() || b < a {
                    b
                } else {
                    a
                }
            }
        }
    }

    /// Whether the right-hand candidate `(bv, bi)` replaces the held `(av, ai)`.
    ///
    /// NaN dominates; among NaNs and among equal values the lower index wins.
    pub fn take_rhs<T: Element>(self, av: T, ai: u32, bv: T, bi: u32) -> bool {
        if av.is_nan() {
            return bv.is_nan() && bi < ai;
        }
        if bv.is_nan() {
            return true;
        }
        let better = if self.is_max() { bv > av } else { bv < av };
        better || (bv == av && bi < ai)
    }
}

impl fmt::Display for Inject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whole-vector reduction topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    Single,
    Segmented,
    TwoPhaseLarge,
}

impl Topology {
    /// Size-based choice: one group, a multi-round tree, or grid-stride plus a finishing pass.
    pub fn for_len(len: usize, workgroup: u32) -> Self {
        let g = workgroup as usize;
        if len <= g {
            Topology::Single
        } else if len <= g.saturating_mul(g) {
            Topology::Segmented
        } else {
            Topology::TwoPhaseLarge
        }
    }

    pub fn name(self, inject: Inject) -> &'static str {
        match (self, inject.indexed()) {
            (Topology::Single, false) => "Single",
            (Topology::Segmented, false) => "Segmented",
            (Topology::TwoPhaseLarge, false) => "TwoPhaseLarge",
            (Topology::Single, true) => "IndexedSingle",
            (Topology::Segmented, true) => "IndexedSegmented",
            (Topology::TwoPhaseLarge, true) => "IndexedTwoPhase",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_combine_propagates_nan_from_either_side() {
        assert!(Inject::Max.combine(f32::NAN, 1.0).is_nan());
        assert!(Inject::Max.combine(1.0, f32::NAN).is_nan());
        assert_eq!(Inject::Max.combine(1.0f32, 3.0), 3.0);
        assert_eq!(Inject::Min.combine(-2i32, 5), -2);
    }

    #[test]
    fn arg_ties_keep_lower_index() {
        assert!(!Inject::ArgMax.take_rhs(4.0f32, 1, 4.0, 7));
        assert!(Inject::ArgMax.take_rhs(4.0f32, 7, 4.0, 1));
        assert!(Inject::ArgMin.take_rhs(4.0f64, 7, 3.0, 9));
        assert!(Inject::ArgMax.take_rhs(4.0f32, 2, f32::NAN, 9));
        assert!(!Inject::ArgMax.take_rhs(f32::NAN, 2, f32::NAN, 9));
    }

    #[test]
    fn padding_never_beats_a_real_element() {
        let pad: f32 = Inject::ArgMax.identity();
        assert!(Inject::ArgMax.take_rhs(pad, u32::MAX, f32::NEG_INFINITY, 3));
        assert!(!Inject::ArgMax.take_rhs(f32::NEG_INFINITY, 3, pad, u32::MAX));
    }

    #[test]
    fn topology_follows_group_capacity() {
        assert_eq!(Topology::for_len(32, 32), Topology::Single);
        assert_eq!(Topology::for_len(33, 32), Topology::Segmented);
        assert_eq!(Topology::for_len(1025, 32), Topology::TwoPhaseLarge);
        assert_eq!(Topology::Segmented.name(Inject::ArgMin), "IndexedSegmented");
    }
}
