use std::sync::Arc;

use crate::collective::checks;
use crate::error::Result;
use crate::group::ProcessGroup;
use crate::reduce::reduce_function;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{DeviceKind, Rank, ReduceOp, ScalarType};
use crate::work::{AsyncWork, CollectiveWork, Work};

const OP: &str = "reduce";

pub(crate) struct ReduceWork {
    pub(crate) context: Arc<dyn Context>,
    pub(crate) inputs: Vec<Tensor>,
    pub(crate) root_rank: Rank,
    pub(crate) op: ReduceOp,
    pub(crate) tag: u32,
}

/// Reduce every rank's buffer into the root's buffer. The result is only
/// meaningful on the root; non-root buffers come back unchanged.
pub(crate) fn reduce_bytes(
    context: &dyn Context,
    data: &mut [u8],
    root: Rank,
    dtype: ScalarType,
    op: ReduceOp,
    tag: u32,
) -> Result<()> {
    let f = reduce_function(dtype, op)?;
    context.reduce(data, root, &f, tag)
}

impl CollectiveWork for ReduceWork {
    fn run(&mut self) -> Result<()> {
        let mut buf = self.inputs[0].dense_bytes()?;
        reduce_bytes(
            self.context.as_ref(),
            &mut buf,
            self.root_rank,
            self.inputs[0].dtype(),
            self.op,
            self.tag,
        )?;
        if self.context.rank() == self.root_rank {
            self.inputs[0].copy_from_bytes(&buf)?;
        }
        Ok(())
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

impl ProcessGroup {
    /// Reduce `inputs[0]` across all ranks into the root's tensor.
    pub fn reduce(
        &self,
        inputs: &[Tensor],
        root_rank: Rank,
        root_tensor: usize,
        op: ReduceOp,
    ) -> Result<Arc<dyn Work>> {
        checks::assert_root_rank(OP, root_rank, self.size())?;
        checks::assert_single_element(OP, inputs, "input tensor list")?;
        checks::assert_root_tensor(OP, root_tensor, inputs.len())?;
        checks::assert_dense(OP, inputs)?;
        let device = checks::device_of(OP, inputs)?;

        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = match device {
            DeviceKind::Cpu => AsyncWork::new(Box::new(ReduceWork {
                context,
                inputs: inputs.to_vec(),
                root_rank,
                op,
                tag,
            })),
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda(_) => AsyncWork::new(Box::new(crate::cuda::CudaReduceWork::new(
                self.cuda_runtime(),
                context,
                inputs.to_vec(),
                root_rank,
                op,
                tag,
            )?)),
        };
        self.enqueue(Arc::clone(&work))?;
        Ok(work)
    }
}
