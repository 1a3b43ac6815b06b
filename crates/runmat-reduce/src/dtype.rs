use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
    U32,
    Bool,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F64 => 8,
            DType::F32 | DType::I32 | DType::U32 | DType::Bool => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Numeric element types the reduction kernels accept.
    pub fn is_numeric(self) -> bool {
        !matches!(self, DType::Bool)
    }

    pub fn wgsl(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::U32 | DType::Bool => "u32",
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A single typed value, resolved once at the API boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    F32(f32),
    F64(f64),
    I32(i32),
    U32(u32),
}

impl Scalar {
    pub fn dtype(self) -> DType {
        match self {
            Scalar::F32(_) => DType::F32,
            Scalar::F64(_) => DType::F64,
            Scalar::I32(_) => DType::I32,
            Scalar::U32(_) => DType::U32,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
            Scalar::I32(v) => v as f64,
            Scalar::U32(v) => v as f64,
        }
    }
}

/// Host-side copy of a buffer's contents.
#[derive(Clone, Debug, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    Bool(Vec<bool>),
}

impl HostData {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => HostData::F32(vec![0.0; len]),
            DType::F64 => HostData::F64(vec![0.0; len]),
            DType::I32 => HostData::I32(vec![0; len]),
            DType::U32 => HostData::U32(vec![0; len]),
            DType::Bool => HostData::Bool(vec![false; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::F64(_) => DType::F64,
            HostData::I32(_) => DType::I32,
            HostData::U32(_) => DType::U32,
            HostData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::F64(v) => v.len(),
            HostData::I32(v) => v.len(),
            HostData::U32(v) => v.len(),
            HostData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            HostData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            HostData::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            HostData::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<&[u32]> {
        match self {
            HostData::U32(v) => Some(v),
            _ => None,
        }
    }

    /// Raw little-endian bytes as laid out in a device buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            HostData::F32(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::F64(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::I32(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::U32(v) => bytemuck::cast_slice(v).to_vec(),
            HostData::Bool(v) => {
                let words: Vec<u32> = v.iter().map(|&b| b as u32).collect();
                bytemuck::cast_slice(&words).to_vec()
            }
        }
    }

    pub fn from_bytes(dtype: DType, bytes: &[u8], len: usize) -> Self {
        let used = &bytes[..(len * dtype.size_in_bytes()).min(bytes.len())];
        match dtype {
            DType::F32 => HostData::F32(bytemuck::pod_collect_to_vec(used)),
            DType::F64 => HostData::F64(bytemuck::pod_collect_to_vec(used)),
            DType::I32 => HostData::I32(bytemuck::pod_collect_to_vec(used)),
            DType::U32 => HostData::U32(bytemuck::pod_collect_to_vec(used)),
            DType::Bool => {
                let words: Vec<u32> = bytemuck::pod_collect_to_vec(used);
                HostData::Bool(words.into_iter().map(|w| w != 0).collect())
            }
        }
    }
}

/// Numeric element types that kernels operate on.
pub trait Element:
    Copy + PartialOrd + PartialEq + Default + Send + Sync + fmt::Debug + bytemuck::Pod + 'static
{
    const DTYPE: DType;

    fn zero() -> Self;
    /// Smallest value of the type; `-inf` for floats.
    fn lowest() -> Self;
    /// Largest value of the type; `+inf` for floats.
    fn highest() -> Self;
    /// Addition with the device's semantics (integers wrap).
    fn add(self, rhs: Self) -> Self;
    fn is_nan(self) -> bool;
    fn from_f64(value: f64) -> Self;
    fn to_scalar(self) -> Scalar;
    fn slice(data: &HostData) -> Option<&[Self]>;
    fn slice_mut(data: &mut HostData) -> Option<&mut Vec<Self>>;
    fn wrap(values: Vec<Self>) -> HostData;
}

/// Floating-point elements, needed by softmax.
pub trait FloatElement: Element {
    fn exp(self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;
}

macro_rules! float_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn zero() -> Self {
                0.0
            }
            fn lowest() -> Self {
                <$ty>::NEG_INFINITY
            }
            fn highest() -> Self {
                <$ty>::INFINITY
            }
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn is_nan(self) -> bool {
                <$ty>::is_nan(self)
            }
            fn from_f64(value: f64) -> Self {
                value as $ty
            }
            fn to_scalar(self) -> Scalar {
                Scalar::$variant(self)
            }
            fn slice(data: &HostData) -> Option<&[Self]> {
                match data {
                    HostData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn slice_mut(data: &mut HostData) -> Option<&mut Vec<Self>> {
                match data {
                    HostData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn wrap(values: Vec<Self>) -> HostData {
                HostData::$variant(values)
            }
        }

        impl FloatElement for $ty {
            fn exp(self) -> Self {
                <$ty>::exp(self)
            }
            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn div(self, rhs: Self) -> Self {
                self / rhs
            }
        }
    };
}

macro_rules! int_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn zero() -> Self {
                0
            }
            fn lowest() -> Self {
                <$ty>::MIN
            }
            fn highest() -> Self {
                <$ty>::MAX
            }
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn is_nan(self) -> bool {
                false
            }
            fn from_f64(value: f64) -> Self {
                value as $ty
            }
            fn to_scalar(self) -> Scalar {
                Scalar::$variant(self)
            }
            fn slice(data: &HostData) -> Option<&[Self]> {
                match data {
                    HostData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn slice_mut(data: &mut HostData) -> Option<&mut Vec<Self>> {
                match data {
                    HostData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn wrap(values: Vec<Self>) -> HostData {
                HostData::$variant(values)
            }
        }
    };
}

float_element!(f32, F32);
float_element!(f64, F64);
int_element!(i32, I32);
int_element!(u32, U32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_preserves_values() {
        let data = HostData::F32(vec![1.5, -2.0, f32::INFINITY]);
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(HostData::from_bytes(DType::F32, &bytes, 3), data);
    }

    #[test]
    fn bool_buffers_are_word_sized() {
        let data = HostData::Bool(vec![true, false, true]);
        assert_eq!(data.to_bytes().len(), 12);
        assert_eq!(HostData::from_bytes(DType::Bool, &data.to_bytes(), 3), data);
    }

    #[test]
    fn integer_add_wraps() {
        assert_eq!(Element::add(i32::MAX, 1), i32::MIN);
        assert_eq!(Element::add(u32::MAX, 2), 1);
    }
}
