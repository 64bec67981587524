//! Shared argument validation for the dispatch layer.
//!
//! Every check fails synchronously with `InvalidArgument` before a tag is
//! allocated, keeping the tag counter in step across ranks.

use crate::error::{CohortError, Result};
use crate::tensor::Tensor;
use crate::types::{DeviceKind, Layout, Rank, ScalarType};

pub(crate) fn assert_non_empty(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    if tensors.is_empty() {
        return Err(CohortError::invalid_argument(
            op,
            "requires non-empty tensor list",
        ));
    }
    Ok(())
}

pub(crate) fn assert_single_element(
    op: &'static str,
    tensors: &[Tensor],
    what: &str,
) -> Result<()> {
    if tensors.len() != 1 {
        return Err(CohortError::invalid_argument(
            op,
            format!("requires a single-element {what} (got {})", tensors.len()),
        ));
    }
    Ok(())
}

pub(crate) fn assert_root_rank(op: &'static str, root: Rank, size: usize) -> Result<()> {
    if root >= size {
        return Err(CohortError::invalid_argument(
            op,
            format!("invalid root rank {root} for group of size {size}"),
        ));
    }
    Ok(())
}

pub(crate) fn assert_root_tensor(op: &'static str, root_tensor: usize, len: usize) -> Result<()> {
    if root_tensor >= len {
        return Err(CohortError::invalid_argument(
            op,
            format!("invalid root tensor index {root_tensor} for list of length {len}"),
        ));
    }
    Ok(())
}

pub(crate) fn assert_dense(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    for t in tensors {
        if t.layout() != Layout::Strided {
            return Err(CohortError::invalid_argument(
                op,
                "only dense tensors are supported",
            ));
        }
    }
    Ok(())
}

pub(crate) fn assert_contiguous(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    for t in tensors {
        if !t.is_contiguous() {
            return Err(CohortError::invalid_argument(
                op,
                "tensor has to be contiguous",
            ));
        }
    }
    Ok(())
}

pub(crate) fn assert_layout_match(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    let first = tensors[0].layout();
    for t in &tensors[1..] {
        if t.layout() != first {
            return Err(CohortError::invalid_argument(
                op,
                "tensors must all have the same layout",
            ));
        }
    }
    Ok(())
}

/// All tensors must match the first one's dtype and shape.
pub(crate) fn assert_type_and_sizes_match(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    assert_non_empty(op, tensors)?;
    assert_type_and_shape(op, tensors, tensors[0].dtype(), &tensors[0].shape())
}

/// All tensors must match the given dtype and shape.
pub(crate) fn assert_type_and_shape(
    op: &'static str,
    tensors: &[Tensor],
    dtype: ScalarType,
    shape: &[usize],
) -> Result<()> {
    for t in tensors {
        if t.dtype() != dtype {
            return Err(CohortError::invalid_argument(
                op,
                format!("expected dtype {}, got {}", dtype, t.dtype()),
            ));
        }
        if t.shape() != shape {
            return Err(CohortError::invalid_argument(
                op,
                format!("expected shape {:?}, got {:?}", shape, t.shape()),
            ));
        }
    }
    Ok(())
}

/// All tensors must live on one device of a supported kind; returns it.
pub(crate) fn device_of(op: &'static str, tensors: &[Tensor]) -> Result<DeviceKind> {
    assert_non_empty(op, tensors)?;
    let device = tensors[0].device();
    for t in &tensors[1..] {
        if t.device() != device {
            return Err(CohortError::invalid_argument(
                op,
                "tensors must all be on the same device",
            ));
        }
    }
    match device {
        DeviceKind::Cpu => Ok(device),
        #[cfg(feature = "cuda")]
        DeviceKind::Cuda(_) => Ok(device),
    }
}

/// The sparse engine's metadata record caps both dimension groups at 4.
pub(crate) fn assert_sparse_dims(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    for t in tensors {
        if t.sparse_dim()? > 4 || t.dense_dim()? > 4 {
            return Err(CohortError::invalid_argument(
                op,
                "sparse tensors support at most 4 sparse and 4 dense dimensions",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, ScalarType::F32, DeviceKind::Cpu)
    }

    #[test]
    fn test_non_empty() {
        assert!(assert_non_empty("op", &[]).is_err());
        assert!(assert_non_empty("op", &[dense(&[1])]).is_ok());
    }

    #[test]
    fn test_root_rank_bounds() {
        assert!(assert_root_rank("op", 3, 4).is_ok());
        assert!(assert_root_rank("op", 4, 4).is_err());
    }

    #[test]
    fn test_type_and_sizes_match() {
        let a = dense(&[2, 3]);
        let b = dense(&[2, 3]);
        assert!(assert_type_and_sizes_match("op", &[a.clone(), b]).is_ok());
        let c = dense(&[3, 2]);
        assert!(assert_type_and_sizes_match("op", &[a.clone(), c]).is_err());
        let d = Tensor::zeros(&[2, 3], ScalarType::I32, DeviceKind::Cpu);
        assert!(assert_type_and_sizes_match("op", &[a, d]).is_err());
    }

    #[test]
    fn test_dense_rejects_sparse() {
        let s = Tensor::sparse_coo(&[0], &[1.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
        assert!(assert_dense("op", &[s.clone()]).is_err());
        assert!(assert_contiguous("op", &[s]).is_err());
    }

    #[test]
    fn test_layout_match() {
        let d = dense(&[4]);
        let s = Tensor::sparse_coo(&[0], &[1.0f32], &[4], 1, DeviceKind::Cpu).unwrap();
        assert!(assert_layout_match("op", &[d.clone(), s]).is_err());
        assert!(assert_layout_match("op", &[d.clone(), d]).is_ok());
    }
}
