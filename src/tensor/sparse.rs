//! Coordinate-sparse canonicalization and densification.

use crate::error::{CohortError, Result};
use crate::reduce::reduce_slice;
use crate::types::{ReduceOp, ScalarType};

/// Row-major flattened key over the sparse dimensions for every entry.
///
/// Also bounds-checks each coordinate against the shape.
fn flat_keys(shape: &[usize], sparse_dim: usize, indices: &[i64]) -> Result<Vec<i64>> {
    let nnz = if sparse_dim == 0 {
        0
    } else {
        indices.len() / sparse_dim
    };
    let mut strides = vec![1i64; sparse_dim];
    for d in (0..sparse_dim.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1] as i64;
    }
    let mut keys = Vec::with_capacity(nnz);
    for j in 0..nnz {
        let mut key = 0i64;
        for d in 0..sparse_dim {
            let idx = indices[d * nnz + j];
            if idx < 0 || idx >= shape[d] as i64 {
                return Err(CohortError::runtime(format!(
                    "sparse index {} out of bounds for dimension {} of size {}",
                    idx, d, shape[d]
                )));
            }
            key += idx * strides[d];
        }
        keys.push(key);
    }
    Ok(keys)
}

/// Sort entries by flattened key and sum value blocks with equal keys.
///
/// Returns dimension-major indices and entry-major value bytes in ascending
/// key order.
pub(super) fn coalesce(
    shape: &[usize],
    sparse_dim: usize,
    indices: &[i64],
    values: &[u8],
    dtype: ScalarType,
) -> Result<(Vec<i64>, Vec<u8>)> {
    let nnz = indices.len() / sparse_dim;
    let dense_numel: usize = shape[sparse_dim..].iter().product();
    let block = dense_numel * dtype.size_in_bytes();
    let keys = flat_keys(shape, sparse_dim, indices)?;

    let mut order: Vec<usize> = (0..nnz).collect();
    order.sort_by_key(|&j| keys[j]);

    let mut out_keys: Vec<i64> = Vec::with_capacity(nnz);
    let mut out_entries: Vec<usize> = Vec::with_capacity(nnz);
    let mut out_values: Vec<u8> = Vec::with_capacity(nnz * block);
    for &j in &order {
        let val = &values[j * block..(j + 1) * block];
        if out_keys.last() == Some(&keys[j]) {
            let len = out_values.len();
            reduce_slice(
                &mut out_values[len - block..],
                val,
                dense_numel,
                dtype,
                ReduceOp::Sum,
            )?;
        } else {
            out_keys.push(keys[j]);
            out_entries.push(j);
            out_values.extend_from_slice(val);
        }
    }

    let out_nnz = out_entries.len();
    let mut out_indices = vec![0i64; sparse_dim * out_nnz];
    for (slot, &j) in out_entries.iter().enumerate() {
        for d in 0..sparse_dim {
            out_indices[d * out_nnz + slot] = indices[d * nnz + j];
        }
    }
    Ok((out_indices, out_values))
}

/// Scatter-add every entry's value block into a dense byte image.
pub(super) fn scatter_to_dense(
    shape: &[usize],
    sparse_dim: usize,
    indices: &[i64],
    values: &[u8],
    dtype: ScalarType,
) -> Result<Vec<u8>> {
    let dense_numel: usize = shape[sparse_dim..].iter().product();
    let block = dense_numel * dtype.size_in_bytes();
    let total: usize = shape.iter().product();
    let mut out = vec![0u8; total * dtype.size_in_bytes()];
    let keys = flat_keys(shape, sparse_dim, indices)?;
    for (j, &key) in keys.iter().enumerate() {
        let off = key as usize * block;
        reduce_slice(
            &mut out[off..off + block],
            &values[j * block..(j + 1) * block],
            dense_numel,
            dtype,
            ReduceOp::Sum,
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::tensor::Tensor;
    use crate::types::DeviceKind;

    #[test]
    fn test_coalesce_sorts_and_sums() {
        // Entries at coordinates 3, 1, 3 with values 1, 2, 10.
        let t = Tensor::sparse_coo(
            &[3, 1, 3],
            &[1.0f32, 2.0, 10.0],
            &[4],
            1,
            DeviceKind::Cpu,
        )
        .unwrap();
        assert!(!t.is_coalesced().unwrap());
        let c = t.coalesce().unwrap();
        assert!(c.is_coalesced().unwrap());
        assert_eq!(c.nnz().unwrap(), 2);
        assert_eq!(c.indices().unwrap(), vec![1, 3]);
        assert_eq!(
            c.to_dense().unwrap().to_vec::<f32>().unwrap(),
            vec![0.0, 2.0, 0.0, 11.0]
        );
    }

    #[test]
    fn test_coalesce_two_sparse_dims() {
        // 2x2 matrix entries: (1,1)=4, (0,0)=1, (1,1)=6.
        let t = Tensor::sparse_coo(
            &[1, 0, 1, 1, 0, 1],
            &[4.0f64, 1.0, 6.0],
            &[2, 2],
            2,
            DeviceKind::Cpu,
        )
        .unwrap();
        let c = t.coalesce().unwrap();
        assert_eq!(c.nnz().unwrap(), 2);
        assert_eq!(c.indices().unwrap(), vec![0, 1, 0, 1]);
        assert_eq!(
            c.to_dense().unwrap().to_vec::<f64>().unwrap(),
            vec![1.0, 0.0, 0.0, 10.0]
        );
    }

    #[test]
    fn test_dense_value_blocks() {
        // Shape [3, 2], sparse_dim 1: each entry carries a length-2 block.
        let t = Tensor::sparse_coo(
            &[2, 0],
            &[1.0f32, 2.0, 3.0, 4.0],
            &[3, 2],
            1,
            DeviceKind::Cpu,
        )
        .unwrap();
        let dense = t.to_dense().unwrap();
        assert_eq!(
            dense.to_vec::<f32>().unwrap(),
            vec![3.0, 4.0, 0.0, 0.0, 1.0, 2.0]
        );
    }

    #[test]
    fn test_empty_sparse() {
        let t =
            Tensor::sparse_coo::<f32>(&[], &[], &[4], 1, DeviceKind::Cpu).unwrap();
        assert_eq!(t.nnz().unwrap(), 0);
        let c = t.coalesce().unwrap();
        assert_eq!(c.nnz().unwrap(), 0);
        assert_eq!(
            c.to_dense().unwrap().to_vec::<f32>().unwrap(),
            vec![0.0; 4]
        );
    }

    #[test]
    fn test_out_of_bounds_index() {
        let t = Tensor::sparse_coo(&[5, 1], &[1.0f32, 2.0], &[4], 1, DeviceKind::Cpu).unwrap();
        assert!(t.coalesce().is_err());
        assert!(t.to_dense().is_err());
    }
}
