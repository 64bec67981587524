//! Flatten/unflatten utilities shared by the list-shaped collectives.

use crate::error::Result;
use crate::tensor::Tensor;

/// Concatenate the byte images of a list of dense tensors.
pub(crate) fn flatten_dense(tensors: &[Tensor]) -> Result<Vec<u8>> {
    let mut flat = Vec::new();
    for t in tensors {
        flat.extend_from_slice(&t.dense_bytes()?);
    }
    Ok(flat)
}

/// Copy successive slices of `flat` back into each tensor.
pub(crate) fn unflatten_dense(flat: &[u8], tensors: &[Tensor]) -> Result<()> {
    let mut offset = 0;
    for t in tensors {
        let len = t.dense_byte_len()?;
        t.copy_from_bytes(&flat[offset..offset + len])?;
        offset += len;
    }
    Ok(())
}
