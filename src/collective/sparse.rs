//! Sparse allreduce: allgather of metadata, indices, and values, followed
//! by a local summation.
//!
//! The nnz may differ across ranks and the transport has no variable-length
//! allgather, so indices and values are padded to the largest nnz before
//! gathering and sliced back afterwards.

use std::sync::Arc;

use crate::error::{CohortError, Result};
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::work::CollectiveWork;

/// Fixed per-rank dimensionality record, laid out contiguously so the whole
/// table can be gathered as a single buffer:
///
///   - `[0..4]`: sparse dims (zero-padded)
///   - `[4..8]`: dense dims (zero-padded)
///   - `[8]`:    nnz
pub(crate) struct SparseMetadata {
    data: [i64; Self::DIM],
}

impl SparseMetadata {
    pub(crate) const DIM: usize = 9;

    fn populate(tensor: &Tensor) -> Result<Self> {
        let sparse_dim = tensor.sparse_dim()?;
        let dense_dim = tensor.dense_dim()?;
        if sparse_dim > 4 || dense_dim > 4 {
            return Err(CohortError::runtime(
                "sparse tensors support at most 4 sparse and 4 dense dimensions",
            ));
        }
        let shape = tensor.shape();
        let mut data = [0i64; Self::DIM];
        for i in 0..sparse_dim {
            data[i] = shape[i] as i64;
        }
        for i in 0..dense_dim {
            data[i + 4] = shape[sparse_dim + i] as i64;
        }
        data[8] = tensor.nnz()? as i64;
        Ok(Self { data })
    }

    fn from_row(row: &[i64]) -> Self {
        let mut data = [0i64; Self::DIM];
        data.copy_from_slice(row);
        Self { data }
    }

    /// Reconstruct the full shape: sparse sizes then dense sizes, each
    /// group read up to its zero terminator.
    fn sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::new();
        for i in 0..4 {
            if self.data[i] <= 0 {
                break;
            }
            sizes.push(self.data[i] as usize);
        }
        for i in 4..8 {
            if self.data[i] <= 0 {
                break;
            }
            sizes.push(self.data[i] as usize);
        }
        sizes
    }

    fn nnz(&self) -> usize {
        self.data[8] as usize
    }
}

fn i64s_to_le(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn le_to_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().expect("8-byte chunk")))
        .collect()
}

/// Sum a list of same-shape sparse tensors: concatenate entries, then
/// coalesce.
fn sparse_sum(tensors: &[Tensor]) -> Result<Tensor> {
    if tensors.len() == 1 {
        return tensors[0].coalesce();
    }
    let shape = tensors[0].shape();
    let sparse_dim = tensors[0].sparse_dim()?;
    let total_nnz: usize = {
        let mut n = 0;
        for t in tensors {
            n += t.nnz()?;
        }
        n
    };
    let mut indices = vec![0i64; sparse_dim * total_nnz];
    let mut values = Vec::new();
    let mut offset = 0;
    for t in tensors {
        let nnz = t.nnz()?;
        let t_indices = t.indices()?;
        for d in 0..sparse_dim {
            indices[d * total_nnz + offset..d * total_nnz + offset + nnz]
                .copy_from_slice(&t_indices[d * nnz..(d + 1) * nnz]);
        }
        values.extend_from_slice(&t.values_bytes()?);
        offset += nnz;
    }
    Tensor::sparse_from_parts(
        indices,
        values,
        shape,
        sparse_dim,
        tensors[0].dtype(),
        tensors[0].device(),
        false,
    )
    .coalesce()
}

pub(crate) struct SparseAllreduceWork {
    context: Arc<dyn Context>,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    tag: u32,
}

impl SparseAllreduceWork {
    pub(crate) fn new(context: Arc<dyn Context>, inputs: Vec<Tensor>, tag: u32) -> Self {
        Self {
            context,
            inputs,
            outputs: Vec::new(),
            tag,
        }
    }

    fn allgather_metadata(&self, input: &Tensor) -> Result<Vec<SparseMetadata>> {
        let row = SparseMetadata::populate(input)?;
        let row_bytes = i64s_to_le(&row.data);
        let mut out = vec![0u8; row_bytes.len() * self.context.size()];
        self.context.allgather(&row_bytes, &mut out, self.tag)?;
        let all = le_to_i64s(&out);
        Ok(all
            .chunks_exact(SparseMetadata::DIM)
            .map(SparseMetadata::from_row)
            .collect())
    }

    /// Gather every rank's coordinates, padded to the largest nnz, and
    /// slice each rank's block back to its own nnz.
    fn allgather_indices(
        &self,
        input: &Tensor,
        metadata: &[SparseMetadata],
    ) -> Result<Vec<Vec<i64>>> {
        let max_nnz = metadata.iter().map(|m| m.nnz()).max().unwrap_or(0);
        let sparse_dim = input.sparse_dim()?;
        let nnz = input.nnz()?;
        let my = input.indices()?;

        let mut block = vec![0i64; sparse_dim * max_nnz];
        for d in 0..sparse_dim {
            block[d * max_nnz..d * max_nnz + nnz].copy_from_slice(&my[d * nnz..(d + 1) * nnz]);
        }
        let in_bytes = i64s_to_le(&block);
        let mut out = vec![0u8; in_bytes.len() * self.context.size()];
        self.context.allgather(&in_bytes, &mut out, self.tag)?;

        let block_len = sparse_dim * max_nnz;
        let all = le_to_i64s(&out);
        let mut per_rank = Vec::with_capacity(metadata.len());
        for (r, m) in metadata.iter().enumerate() {
            let rank_block = &all[r * block_len..(r + 1) * block_len];
            let n = m.nnz();
            let mut idx = vec![0i64; sparse_dim * n];
            for d in 0..sparse_dim {
                idx[d * n..(d + 1) * n].copy_from_slice(&rank_block[d * max_nnz..d * max_nnz + n]);
            }
            per_rank.push(idx);
        }
        Ok(per_rank)
    }

    /// Gather every rank's value blocks with the same max-nnz padding.
    fn allgather_values(
        &self,
        input: &Tensor,
        metadata: &[SparseMetadata],
    ) -> Result<Vec<Vec<u8>>> {
        let max_nnz = metadata.iter().map(|m| m.nnz()).max().unwrap_or(0);
        let sparse_dim = input.sparse_dim()?;
        let shape = input.shape();
        let dense_numel: usize = shape[sparse_dim..].iter().product();
        let entry_bytes = dense_numel * input.element_size();

        let my_values = input.values_bytes()?;
        let mut block = vec![0u8; max_nnz * entry_bytes];
        block[..my_values.len()].copy_from_slice(&my_values);
        let mut out = vec![0u8; block.len() * self.context.size()];
        self.context.allgather(&block, &mut out, self.tag)?;

        let block_len = max_nnz * entry_bytes;
        let mut per_rank = Vec::with_capacity(metadata.len());
        for (r, m) in metadata.iter().enumerate() {
            let rank_block = &out[r * block_len..(r + 1) * block_len];
            per_rank.push(rank_block[..m.nnz() * entry_bytes].to_vec());
        }
        Ok(per_rank)
    }

    pub(crate) fn allreduce(&self) -> Result<Tensor> {
        // Local reduction across this rank's input list, coalesced so
        // indices are unique and sorted before they are shared.
        let input = sparse_sum(&self.inputs)?;

        let metadata = self.allgather_metadata(&input)?;

        // Sanity check dimensionality across ranks.
        let expected = metadata[self.context.rank()].sizes();
        for (i, m) in metadata.iter().enumerate() {
            if i != self.context.rank() && m.sizes() != expected {
                return Err(CohortError::runtime("sparse dimensions do not match"));
            }
        }

        let indices = self.allgather_indices(&input, &metadata)?;
        let values = self.allgather_values(&input, &metadata)?;

        let shape = input.shape();
        let sparse_dim = input.sparse_dim()?;
        let per_rank: Vec<Tensor> = indices
            .into_iter()
            .zip(values)
            .map(|(idx, val)| {
                Tensor::sparse_from_parts(
                    idx,
                    val,
                    shape.clone(),
                    sparse_dim,
                    input.dtype(),
                    input.device(),
                    true,
                )
            })
            .collect();

        sparse_sum(&per_rank)
    }
}

impl CollectiveWork for SparseAllreduceWork {
    fn run(&mut self) -> Result<()> {
        let output = self.allreduce()?;

        // Every input is overwritten with an independent clone of the
        // result, so callers observe it through the tensors they passed in.
        for t in &self.inputs {
            t.assign(&output)?;
        }
        self.outputs = self.inputs.clone();
        Ok(())
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.outputs.clone()
    }
}
