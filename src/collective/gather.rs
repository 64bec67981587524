use std::sync::Arc;

use crate::collective::checks;
use crate::error::{CohortError, Result};
use crate::group::ProcessGroup;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{DeviceKind, Rank};
use crate::work::{AsyncWork, CollectiveWork, Work};

const OP: &str = "gather";

pub(crate) struct GatherWork {
    pub(crate) context: Arc<dyn Context>,
    pub(crate) outputs: Vec<Vec<Tensor>>,
    pub(crate) inputs: Vec<Tensor>,
    pub(crate) root: Rank,
    pub(crate) tag: u32,
}

impl CollectiveWork for GatherWork {
    fn run(&mut self) -> Result<()> {
        let input = self.inputs[0].dense_bytes()?;
        if self.context.rank() == self.root {
            // Gather into one flat buffer, then unflatten into the
            // separate output tensors.
            let mut flat = vec![0u8; input.len() * self.context.size()];
            self.context
                .gather(&input, Some(&mut flat), self.root, self.tag)?;
            let chunk = input.len();
            for (i, t) in self.outputs[0].iter().enumerate() {
                t.copy_from_bytes(&flat[i * chunk..(i + 1) * chunk])?;
            }
        } else {
            self.context.gather(&input, None, self.root, self.tag)?;
        }
        Ok(())
    }
}

impl ProcessGroup {
    /// Gather each rank's single input tensor to the root. On the root,
    /// `outputs` must be one list of `size` tensors; elsewhere it must be
    /// empty.
    pub fn gather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        root_rank: Rank,
    ) -> Result<Arc<dyn Work>> {
        checks::assert_root_rank(OP, root_rank, self.size())?;
        checks::assert_single_element(OP, inputs, "input tensor list")?;
        checks::assert_dense(OP, inputs)?;

        if self.rank() == root_rank {
            if outputs.len() != 1 || outputs[0].len() != self.size() {
                return Err(CohortError::invalid_argument(
                    OP,
                    "requires a single-element output list containing a list with <size> tensors",
                ));
            }
            checks::assert_type_and_shape(
                OP,
                &outputs[0],
                inputs[0].dtype(),
                &inputs[0].shape(),
            )?;
        } else if !outputs.is_empty() {
            return Err(CohortError::invalid_argument(
                OP,
                "requires empty output on non-root",
            ));
        }
        let device = checks::device_of(OP, inputs)?;

        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = match device {
            DeviceKind::Cpu => AsyncWork::new(Box::new(GatherWork {
                context,
                outputs: outputs.to_vec(),
                inputs: inputs.to_vec(),
                root: root_rank,
                tag,
            })),
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda(_) => AsyncWork::new(Box::new(crate::cuda::CudaGatherWork::new(
                self.cuda_runtime(),
                context,
                outputs.to_vec(),
                inputs.to_vec(),
                root_rank,
                tag,
            )?)),
        };
        self.enqueue(Arc::clone(&work))?;
        Ok(work)
    }
}
