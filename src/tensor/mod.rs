//! Minimal dense / coordinate-sparse tensor handles.
//!
//! A [`Tensor`] is a cheaply clonable handle to shared storage. Work items
//! capture handles so the underlying storage stays alive until `wait()`
//! returns, and in-place collective results are visible through every
//! handle to the same storage.

mod sparse;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{CohortError, Result};
use crate::types::{DeviceKind, Layout, ScalarType};

/// Rust scalar types that map onto a [`ScalarType`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: ScalarType;
    fn write_le(self, out: &mut [u8]);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: ScalarType = $dtype;
                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().expect("element width"))
                }
            }
        )*
    };
}

impl_element!(
    f32 => ScalarType::F32,
    f64 => ScalarType::F64,
    i8 => ScalarType::I8,
    u8 => ScalarType::U8,
    i32 => ScalarType::I32,
    i64 => ScalarType::I64,
);

pub(crate) enum Repr {
    Dense {
        shape: Vec<usize>,
        data: Vec<u8>,
    },
    Sparse {
        shape: Vec<usize>,
        sparse_dim: usize,
        /// Coordinates, dimension-major: `indices[d * nnz + j]` is the
        /// `d`-th coordinate of the `j`-th entry.
        indices: Vec<i64>,
        /// Value blocks, entry-major: `nnz * dense_numel` elements.
        values: Vec<u8>,
        coalesced: bool,
    },
}

pub(crate) struct TensorData {
    pub dtype: ScalarType,
    pub device: DeviceKind,
    pub repr: Repr,
    /// Accelerator-resident storage, when this tensor lives on a device.
    #[cfg(feature = "cuda")]
    pub device_buf: Option<std::sync::Arc<crate::cuda::DeviceBuffer>>,
}

impl TensorData {
    pub(crate) fn new(dtype: ScalarType, device: DeviceKind, repr: Repr) -> Self {
        Self {
            dtype,
            device,
            repr,
            #[cfg(feature = "cuda")]
            device_buf: None,
        }
    }
}

/// A handle to shared tensor storage.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<RwLock<TensorData>>,
}

fn numel_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Tensor {
    fn from_data(data: TensorData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, TensorData>> {
        self.inner
            .read()
            .map_err(|_| CohortError::LockPoisoned("tensor"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, TensorData>> {
        self.inner
            .write()
            .map_err(|_| CohortError::LockPoisoned("tensor"))
    }

    /// Dense tensor of zeros.
    pub fn zeros(shape: &[usize], dtype: ScalarType, device: DeviceKind) -> Tensor {
        let data = vec![0u8; numel_of(shape) * dtype.size_in_bytes()];
        Tensor::from_data(TensorData::new(
            dtype,
            device,
            Repr::Dense {
                shape: shape.to_vec(),
                data,
            },
        ))
    }

    /// Dense tensor from a slice of typed values.
    pub fn from_slice<T: Element>(
        values: &[T],
        shape: &[usize],
        device: DeviceKind,
    ) -> Result<Tensor> {
        if values.len() != numel_of(shape) {
            return Err(CohortError::invalid_argument(
                "tensor",
                format!(
                    "shape {:?} needs {} elements, got {}",
                    shape,
                    numel_of(shape),
                    values.len()
                ),
            ));
        }
        let elem = T::DTYPE.size_in_bytes();
        let mut data = vec![0u8; values.len() * elem];
        for (i, v) in values.iter().enumerate() {
            v.write_le(&mut data[i * elem..(i + 1) * elem]);
        }
        Ok(Tensor::from_data(TensorData::new(
            T::DTYPE,
            device,
            Repr::Dense {
                shape: shape.to_vec(),
                data,
            },
        )))
    }

    /// Dense tensor filled with one value.
    pub fn full<T: Element>(shape: &[usize], value: T, device: DeviceKind) -> Tensor {
        let n = numel_of(shape);
        let elem = T::DTYPE.size_in_bytes();
        let mut data = vec![0u8; n * elem];
        for i in 0..n {
            value.write_le(&mut data[i * elem..(i + 1) * elem]);
        }
        Tensor::from_data(TensorData::new(
            T::DTYPE,
            device,
            Repr::Dense {
                shape: shape.to_vec(),
                data,
            },
        ))
    }

    /// Coordinate-sparse tensor.
    ///
    /// `indices` is dimension-major (`sparse_dim` rows of `nnz`
    /// coordinates); `values` holds one dense block per entry.
    pub fn sparse_coo<T: Element>(
        indices: &[i64],
        values: &[T],
        shape: &[usize],
        sparse_dim: usize,
        device: DeviceKind,
    ) -> Result<Tensor> {
        if sparse_dim == 0 || sparse_dim > shape.len() {
            return Err(CohortError::invalid_argument(
                "sparse_coo",
                format!("sparse_dim {} out of range for shape {:?}", sparse_dim, shape),
            ));
        }
        if indices.len() % sparse_dim != 0 {
            return Err(CohortError::invalid_argument(
                "sparse_coo",
                "indices length is not a multiple of sparse_dim",
            ));
        }
        let nnz = indices.len() / sparse_dim;
        let dense_numel = numel_of(&shape[sparse_dim..]);
        if values.len() != nnz * dense_numel {
            return Err(CohortError::invalid_argument(
                "sparse_coo",
                format!(
                    "expected {} values for nnz {} with dense block {}, got {}",
                    nnz * dense_numel,
                    nnz,
                    dense_numel,
                    values.len()
                ),
            ));
        }
        let elem = T::DTYPE.size_in_bytes();
        let mut bytes = vec![0u8; values.len() * elem];
        for (i, v) in values.iter().enumerate() {
            v.write_le(&mut bytes[i * elem..(i + 1) * elem]);
        }
        Ok(Tensor::from_data(TensorData::new(
            T::DTYPE,
            device,
            Repr::Sparse {
                shape: shape.to_vec(),
                sparse_dim,
                indices: indices.to_vec(),
                values: bytes,
                coalesced: nnz <= 1,
            },
        )))
    }

    /// Sparse tensor from already-encoded parts. Used when reassembling
    /// peers' contributions out of gathered buffers.
    pub(crate) fn sparse_from_parts(
        indices: Vec<i64>,
        values: Vec<u8>,
        shape: Vec<usize>,
        sparse_dim: usize,
        dtype: ScalarType,
        device: DeviceKind,
        coalesced: bool,
    ) -> Tensor {
        Tensor::from_data(TensorData::new(
            dtype,
            device,
            Repr::Sparse {
                shape,
                sparse_dim,
                indices,
                values,
                coalesced,
            },
        ))
    }

    pub fn dtype(&self) -> ScalarType {
        self.read().map(|d| d.dtype).unwrap_or(ScalarType::U8)
    }

    pub fn device(&self) -> DeviceKind {
        self.read().map(|d| d.device).unwrap_or(DeviceKind::Cpu)
    }

    pub fn layout(&self) -> Layout {
        match self.read() {
            Ok(d) => match d.repr {
                Repr::Dense { .. } => Layout::Strided,
                Repr::Sparse { .. } => Layout::SparseCoo,
            },
            Err(_) => Layout::Strided,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.layout() == Layout::SparseCoo
    }

    /// Dense tensors are always stored row-major contiguous; sparse tensors
    /// are never contiguous.
    pub fn is_contiguous(&self) -> bool {
        !self.is_sparse()
    }

    pub fn shape(&self) -> Vec<usize> {
        match self.read() {
            Ok(d) => match &d.repr {
                Repr::Dense { shape, .. } => shape.clone(),
                Repr::Sparse { shape, .. } => shape.clone(),
            },
            Err(_) => Vec::new(),
        }
    }

    /// Logical element count (product of the shape).
    pub fn numel(&self) -> usize {
        numel_of(&self.shape())
    }

    pub fn element_size(&self) -> usize {
        self.dtype().size_in_bytes()
    }

    /// Byte length of the dense storage.
    pub(crate) fn dense_byte_len(&self) -> Result<usize> {
        let d = self.read()?;
        match &d.repr {
            Repr::Dense { data, .. } => Ok(data.len()),
            Repr::Sparse { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "dense storage requested from a sparse tensor",
            )),
        }
    }

    /// Copy of the dense byte image.
    pub(crate) fn dense_bytes(&self) -> Result<Vec<u8>> {
        let d = self.read()?;
        match &d.repr {
            Repr::Dense { data, .. } => Ok(data.clone()),
            Repr::Sparse { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "dense storage requested from a sparse tensor",
            )),
        }
    }

    /// Overwrite the dense storage from a byte image of the same length.
    pub(crate) fn copy_from_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut d = self.write()?;
        match &mut d.repr {
            Repr::Dense { data, .. } => {
                if data.len() != bytes.len() {
                    return Err(CohortError::BufferSizeMismatch {
                        expected: data.len(),
                        actual: bytes.len(),
                    });
                }
                data.copy_from_slice(bytes);
                Ok(())
            }
            Repr::Sparse { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "cannot write a dense image into a sparse tensor",
            )),
        }
    }

    /// Copy another dense tensor's contents into this one.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        self.copy_from_bytes(&src.dense_bytes()?)
    }

    /// Replace this tensor's contents with an independent copy of `src`,
    /// preserving handle identity for every clone of `self`.
    pub fn assign(&self, src: &Tensor) -> Result<()> {
        let new_data = {
            let s = src.read()?;
            TensorData::new(
                s.dtype,
                s.device,
                match &s.repr {
                    Repr::Dense { shape, data } => Repr::Dense {
                        shape: shape.clone(),
                        data: data.clone(),
                    },
                    Repr::Sparse {
                        shape,
                        sparse_dim,
                        indices,
                        values,
                        coalesced,
                    } => Repr::Sparse {
                        shape: shape.clone(),
                        sparse_dim: *sparse_dim,
                        indices: indices.clone(),
                        values: values.clone(),
                        coalesced: *coalesced,
                    },
                },
            )
        };
        let mut d = self.write()?;
        *d = new_data;
        Ok(())
    }

    /// Independent copy with fresh storage.
    pub fn deep_clone(&self) -> Tensor {
        let t = Tensor::from_data(TensorData::new(
            self.dtype(),
            self.device(),
            Repr::Dense {
                shape: vec![],
                data: vec![],
            },
        ));
        // assign only fails on lock poisoning, which from_data cannot produce
        let _ = t.assign(self);
        t
    }

    /// Dense contents as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let d = self.read()?;
        if d.dtype != T::DTYPE {
            return Err(CohortError::invalid_argument(
                "tensor",
                format!("requested {} from a {} tensor", T::DTYPE, d.dtype),
            ));
        }
        match &d.repr {
            Repr::Dense { data, .. } => {
                let elem = d.dtype.size_in_bytes();
                Ok(data
                    .chunks_exact(elem)
                    .map(|c| T::read_le(c))
                    .collect())
            }
            Repr::Sparse { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "to_vec requires a dense tensor",
            )),
        }
    }

    // ── Sparse accessors ────────────────────────────────────────────

    pub fn sparse_dim(&self) -> Result<usize> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse { sparse_dim, .. } => Ok(*sparse_dim),
            Repr::Dense { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "sparse_dim on a dense tensor",
            )),
        }
    }

    pub fn dense_dim(&self) -> Result<usize> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse {
                shape, sparse_dim, ..
            } => Ok(shape.len() - sparse_dim),
            Repr::Dense { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "dense_dim on a dense tensor",
            )),
        }
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> Result<usize> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse {
                indices,
                sparse_dim,
                ..
            } => Ok(indices.len() / sparse_dim),
            Repr::Dense { .. } => {
                Err(CohortError::invalid_argument("tensor", "nnz on a dense tensor"))
            }
        }
    }

    /// Copy of the dimension-major coordinate array.
    pub fn indices(&self) -> Result<Vec<i64>> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse { indices, .. } => Ok(indices.clone()),
            Repr::Dense { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "indices on a dense tensor",
            )),
        }
    }

    /// Copy of the value blocks' byte image.
    pub(crate) fn values_bytes(&self) -> Result<Vec<u8>> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse { values, .. } => Ok(values.clone()),
            Repr::Dense { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "values on a dense tensor",
            )),
        }
    }

    pub fn is_coalesced(&self) -> Result<bool> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse { coalesced, .. } => Ok(*coalesced),
            Repr::Dense { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "is_coalesced on a dense tensor",
            )),
        }
    }

    /// Canonical form: unique coordinates in ascending row-major order,
    /// duplicate entries summed.
    pub fn coalesce(&self) -> Result<Tensor> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse {
                shape,
                sparse_dim,
                indices,
                values,
                coalesced,
            } => {
                if *coalesced {
                    drop(d);
                    return Ok(self.deep_clone());
                }
                let (out_indices, out_values) =
                    sparse::coalesce(shape, *sparse_dim, indices, values, d.dtype)?;
                Ok(Tensor::sparse_from_parts(
                    out_indices,
                    out_values,
                    shape.clone(),
                    *sparse_dim,
                    d.dtype,
                    d.device,
                    true,
                ))
            }
            Repr::Dense { .. } => Err(CohortError::invalid_argument(
                "tensor",
                "coalesce on a dense tensor",
            )),
        }
    }

    /// Materialize a sparse tensor as dense.
    pub fn to_dense(&self) -> Result<Tensor> {
        let d = self.read()?;
        match &d.repr {
            Repr::Sparse {
                shape,
                sparse_dim,
                indices,
                values,
                ..
            } => {
                let data = sparse::scatter_to_dense(shape, *sparse_dim, indices, values, d.dtype)?;
                Ok(Tensor::from_data(TensorData::new(
                    d.dtype,
                    d.device,
                    Repr::Dense {
                        shape: shape.clone(),
                        data,
                    },
                )))
            }
            Repr::Dense { .. } => {
                drop(d);
                Ok(self.deep_clone())
            }
        }
    }

    // ── Accelerator storage (cuda feature) ──────────────────────────

    /// Device-resident storage backing this tensor, if any.
    #[cfg(feature = "cuda")]
    pub(crate) fn device_buf(&self) -> Result<Option<Arc<crate::cuda::DeviceBuffer>>> {
        Ok(self.read()?.device_buf.clone())
    }

    /// Attach (or clear) the device-resident storage for this tensor.
    #[cfg(feature = "cuda")]
    pub(crate) fn set_device_buf(&self, buf: Option<Arc<crate::cuda::DeviceBuffer>>) -> Result<()> {
        self.write()?.device_buf = buf;
        Ok(())
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn set_device(&self, device: DeviceKind) -> Result<()> {
        self.write()?.device = device;
        Ok(())
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype())
            .field("device", &self.device())
            .field("layout", &self.layout())
            .field("shape", &self.shape())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_roundtrip() {
        let t = Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3], DeviceKind::Cpu).unwrap();
        assert_eq!(t.shape(), vec![3]);
        assert_eq!(t.numel(), 3);
        assert_eq!(t.dtype(), ScalarType::F32);
        assert_eq!(t.layout(), Layout::Strided);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_from_slice_shape_mismatch() {
        assert!(Tensor::from_slice(&[1.0f32], &[3], DeviceKind::Cpu).is_err());
    }

    #[test]
    fn test_handles_share_storage() {
        let t = Tensor::zeros(&[2], ScalarType::I32, DeviceKind::Cpu);
        let alias = t.clone();
        let src = Tensor::from_slice(&[7i32, 9], &[2], DeviceKind::Cpu).unwrap();
        t.copy_from(&src).unwrap();
        assert_eq!(alias.to_vec::<i32>().unwrap(), vec![7, 9]);
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let t = Tensor::from_slice(&[1i64, 2], &[2], DeviceKind::Cpu).unwrap();
        let c = t.deep_clone();
        let src = Tensor::from_slice(&[5i64, 6], &[2], DeviceKind::Cpu).unwrap();
        t.copy_from(&src).unwrap();
        assert_eq!(c.to_vec::<i64>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_assign_preserves_identity() {
        let t = Tensor::zeros(&[2], ScalarType::F32, DeviceKind::Cpu);
        let alias = t.clone();
        let sparse = Tensor::sparse_coo(&[0], &[3.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
        t.assign(&sparse).unwrap();
        assert!(alias.is_sparse());
        assert_eq!(alias.nnz().unwrap(), 1);
    }

    #[test]
    fn test_full() {
        let t = Tensor::full(&[2, 3], 4.5f64, DeviceKind::Cpu);
        assert_eq!(t.to_vec::<f64>().unwrap(), vec![4.5; 6]);
    }

    #[test]
    fn test_type_mismatch_to_vec() {
        let t = Tensor::zeros(&[1], ScalarType::F32, DeviceKind::Cpu);
        assert!(t.to_vec::<i32>().is_err());
    }
}
