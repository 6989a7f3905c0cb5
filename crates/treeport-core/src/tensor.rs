use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::{Error, Result};

/// Device kinds, numbered as in DLPack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    CudaHost,
    OpenCl,
    Vulkan,
    Metal,
    Rocm,
}

impl DeviceKind {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(DeviceKind::Cpu),
            2 => Ok(DeviceKind::Cuda),
            3 => Ok(DeviceKind::CudaHost),
            4 => Ok(DeviceKind::OpenCl),
            7 => Ok(DeviceKind::Vulkan),
            8 => Ok(DeviceKind::Metal),
            10 => Ok(DeviceKind::Rocm),
            other => Err(Error::load(format!("unknown device type code {other}"))),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            DeviceKind::Cpu => 1,
            DeviceKind::Cuda => 2,
            DeviceKind::CudaHost => 3,
            DeviceKind::OpenCl => 4,
            DeviceKind::Vulkan => 7,
            DeviceKind::Metal => 8,
            DeviceKind::Rocm => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::CudaHost => "cuda_host",
            DeviceKind::OpenCl => "opencl",
            DeviceKind::Vulkan => "vulkan",
            DeviceKind::Metal => "metal",
            DeviceKind::Rocm => "rocm",
        }
    }
}

/// Compute context a model is loaded into: device kind plus device index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Context {
    pub kind: DeviceKind,
    pub device_id: u32,
}

impl Context {
    pub fn new(kind: DeviceKind, device_id: u32) -> Self {
        Self { kind, device_id }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceKind::Cpu, 0)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.device_id)
    }
}

impl FromStr for Context {
    type Err = Error;

    /// Accepts `cpu`, `cpu:0`, `cuda:1` and so on.
    fn from_str(raw: &str) -> Result<Self> {
        let (kind, id) = match raw.split_once(':') {
            Some((kind, id)) => (kind, Some(id)),
            None => (raw, None),
        };

        let kind = match kind.to_ascii_lowercase().as_str() {
            "cpu" => DeviceKind::Cpu,
            "cuda" | "gpu" => DeviceKind::Cuda,
            "cuda_host" => DeviceKind::CudaHost,
            "opencl" => DeviceKind::OpenCl,
            "vulkan" => DeviceKind::Vulkan,
            "metal" => DeviceKind::Metal,
            "rocm" => DeviceKind::Rocm,
            _ => return Err(Error::load(format!("unsupported device: {raw}"))),
        };

        let device_id = match id {
            Some(id) => id
                .parse()
                .map_err(|_| Error::load(format!("invalid device index in `{raw}`")))?,
            None => 0,
        };

        Ok(Context::new(kind, device_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
}

impl DType {
    /// Type name as reported through `input_type` / `output_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::I64 => "int64",
            DType::I32 => "int32",
            DType::U8 => "uint8",
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host element types that can be bound to or read from a tensor.
/// Values are stored little-endian.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(f32, DType::F32);
impl_element!(i64, DType::I64);
impl_element!(i32, DType::I32);
impl_element!(u8, DType::U8);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Element count, or `None` if it does not fit in `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Leading (batch) dimension, if the shape has one.
    pub fn batch(&self) -> Option<usize> {
        self.0.first().copied()
    }

    /// Elements in one batch row.
    pub fn row_numel(&self) -> usize {
        self.0.iter().skip(1).product::<usize>()
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.0.iter().map(|d| *d as i64).collect()
    }
}

/// A host tensor. Storage is a cheaply clonable byte buffer.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Shape,
    pub data: Bytes,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, data: Bytes) -> Self {
        Self { dtype, shape, data }
    }

    pub fn from_slice<T: Element>(shape: Shape, values: &[T]) -> Self {
        let mut buf = Vec::with_capacity(std::mem::size_of_val(values));
        for v in values {
            v.write_le(&mut buf);
        }
        Self::from_cpu_bytes(T::DTYPE, shape, Bytes::from(buf))
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        Ok(self
            .data
            .chunks_exact(self.dtype.byte_size())
            .map(T::read_le)
            .collect())
    }

    /// Copy all elements into `out`, which must hold at least `numel()` values.
    pub fn copy_to<T: Element>(&self, out: &mut [T]) -> Result<()> {
        self.check_dtype::<T>()?;
        let n = self
            .shape
            .checked_numel()
            .ok_or_else(|| Error::shape_mismatch("tensor element count overflows usize"))?;
        if out.len() < n {
            return Err(Error::shape_mismatch(format!(
                "destination holds {} elements, tensor has {n}",
                out.len()
            )));
        }
        for (dst, chunk) in out
            .iter_mut()
            .zip(self.data.chunks_exact(self.dtype.byte_size()))
        {
            *dst = T::read_le(chunk);
        }
        Ok(())
    }

    /// Zero-copy view of `len` rows starting at row `start`.
    pub fn slice_rows(&self, start: usize, len: usize) -> Result<Tensor> {
        let rows = self
            .shape
            .batch()
            .ok_or_else(|| Error::shape_mismatch("cannot slice rows of a scalar tensor"))?;
        let end = start.checked_add(len).filter(|&end| end <= rows).ok_or_else(|| {
            Error::shape_mismatch(format!(
                "rows {start}..+{len} out of range for batch of {rows}"
            ))
        })?;

        let row_bytes = self.shape.row_numel() * self.dtype.byte_size();
        let mut shape = self.shape.clone();
        shape.0[0] = len;
        Ok(Tensor {
            dtype: self.dtype,
            shape,
            data: self.data.slice(start * row_bytes..end * row_bytes),
        })
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if self.dtype != T::DTYPE {
            return Err(Error::TypeMismatch {
                name: "tensor".to_string(),
                expected: self.dtype,
                got: T::DTYPE,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_parses_kind_and_index() {
        assert_eq!("cpu".parse::<Context>().unwrap(), Context::cpu());
        assert_eq!(
            "cuda:1".parse::<Context>().unwrap(),
            Context::new(DeviceKind::Cuda, 1)
        );
        assert!("tpu:0".parse::<Context>().is_err());
        assert!("cpu:x".parse::<Context>().is_err());
        assert_eq!(Context::new(DeviceKind::Cuda, 2).to_string(), "cuda:2");
    }

    #[test]
    fn device_codes_follow_dlpack() {
        assert_eq!(DeviceKind::from_code(1).unwrap(), DeviceKind::Cpu);
        assert_eq!(DeviceKind::from_code(2).unwrap(), DeviceKind::Cuda);
        assert_eq!(DeviceKind::Rocm.code(), 10);
        assert!(DeviceKind::from_code(5).is_err());
    }

    #[test]
    fn tensor_copies_values_back() {
        let data = [1.5f32, -2.0, 3.25, 0.0];
        let t = Tensor::from_slice(Shape::from_slice(&[2, 2]), &data);
        assert_eq!(t.byte_len(), 16);

        let mut out = [0f32; 4];
        t.copy_to(&mut out).unwrap();
        assert_eq!(out, data);

        let mut short = [0f32; 3];
        assert!(matches!(t.copy_to(&mut short), Err(Error::ShapeMismatch(_))));

        let mut wrong = [0i64; 4];
        assert!(matches!(t.copy_to(&mut wrong), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn slice_rows_shares_storage() {
        let data: Vec<i32> = (0..12).collect();
        let t = Tensor::from_slice(Shape::from_slice(&[4, 3]), &data);

        let mid = t.slice_rows(1, 2).unwrap();
        assert_eq!(mid.shape, Shape::from_slice(&[2, 3]));
        assert_eq!(mid.to_vec::<i32>().unwrap(), vec![3, 4, 5, 6, 7, 8]);
        assert!(t.slice_rows(3, 2).is_err());
        assert!(t.slice_rows(1, usize::MAX).is_err());
    }

    #[test]
    fn checked_numel_reports_overflow() {
        assert_eq!(Shape::from_slice(&[3, 4]).checked_numel(), Some(12));
        assert_eq!(Shape::from_slice(&[]).checked_numel(), Some(1));
        assert_eq!(
            Shape::from_slice(&[8_822_355_861_339_350_773, 69]).checked_numel(),
            None
        );

        let t = Tensor::from_cpu_bytes(
            DType::F32,
            Shape::from_slice(&[usize::MAX, 2]),
            Bytes::from_static(&[0u8; 8]),
        );
        let mut out = [0f32; 2];
        assert!(matches!(t.copy_to(&mut out), Err(Error::ShapeMismatch(_))));
    }
}
