use std::sync::Arc;

use crate::collective::checks;
use crate::collective::helpers::flatten_dense;
use crate::error::{CohortError, Result};
use crate::group::ProcessGroup;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::DeviceKind;
use crate::work::{AsyncWork, CollectiveWork, Work};

const OP: &str = "allgather";

pub(crate) struct AllgatherWork {
    pub(crate) context: Arc<dyn Context>,
    pub(crate) outputs: Vec<Vec<Tensor>>,
    pub(crate) inputs: Vec<Tensor>,
    pub(crate) tag: u32,
}

/// Gather every rank's flattened inputs to every rank.
///
/// The returned buffer is rank-major: chunk `k * len(inputs) + m` is rank
/// `k`'s input `m`.
pub(crate) fn allgather_bytes(
    context: &dyn Context,
    inputs: &[Tensor],
    tag: u32,
) -> Result<Vec<u8>> {
    let flat_in = flatten_dense(inputs)?;
    let mut flat_out = vec![0u8; flat_in.len() * context.size()];
    context.allgather(&flat_in, &mut flat_out, tag)?;
    Ok(flat_out)
}

impl CollectiveWork for AllgatherWork {
    fn run(&mut self) -> Result<()> {
        let flat = allgather_bytes(self.context.as_ref(), &self.inputs, self.tag)?;
        let chunk = self.inputs[0].dense_byte_len()?;
        for out_list in &self.outputs {
            for (j, t) in out_list.iter().enumerate() {
                t.copy_from_bytes(&flat[j * chunk..(j + 1) * chunk])?;
            }
        }
        Ok(())
    }
}

impl ProcessGroup {
    /// Gather each rank's `inputs` into every rank's `outputs`. Each
    /// `outputs[i]` must hold `len(inputs) * size` tensors; entry
    /// `k * len(inputs) + m` receives rank `k`'s input `m`.
    pub fn allgather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
    ) -> Result<Arc<dyn Work>> {
        checks::assert_non_empty(OP, inputs)?;
        if inputs.len() != outputs.len() {
            return Err(CohortError::invalid_argument(
                OP,
                "requires input/output tensor lists to have the same length",
            ));
        }
        let expected = inputs.len() * self.size();
        for (i, out_list) in outputs.iter().enumerate() {
            if out_list.len() != expected {
                return Err(CohortError::invalid_argument(
                    OP,
                    format!(
                        "invalid output tensor list at index {i} (expected length {expected}, got {})",
                        out_list.len()
                    ),
                ));
            }
        }
        checks::assert_dense(OP, inputs)?;
        let dtype = inputs[0].dtype();
        let shape = inputs[0].shape();
        checks::assert_type_and_shape(OP, inputs, dtype, &shape)?;
        for out_list in outputs {
            checks::assert_type_and_shape(OP, out_list, dtype, &shape)?;
        }
        let device = checks::device_of(OP, inputs)?;

        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = match device {
            DeviceKind::Cpu => AsyncWork::new(Box::new(AllgatherWork {
                context,
                outputs: outputs.to_vec(),
                inputs: inputs.to_vec(),
                tag,
            })),
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda(_) => AsyncWork::new(Box::new(crate::cuda::CudaAllgatherWork::new(
                self.cuda_runtime(),
                context,
                outputs.to_vec(),
                inputs.to_vec(),
                tag,
            )?)),
        };
        self.enqueue(Arc::clone(&work))?;
        Ok(work)
    }
}
