use std::sync::Arc;

use crate::collective::checks;
use crate::error::Result;
use crate::group::ProcessGroup;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{DeviceKind, Rank};
use crate::work::{AsyncWork, CollectiveWork, Work};

const OP: &str = "broadcast";

pub(crate) struct BroadcastWork {
    pub(crate) context: Arc<dyn Context>,
    pub(crate) inputs: Vec<Tensor>,
    pub(crate) root_rank: Rank,
    pub(crate) root_tensor: usize,
    pub(crate) tag: u32,
}

/// Broadcast the root's byte image; every rank's buffer holds it on return.
pub(crate) fn broadcast_bytes(
    context: &dyn Context,
    data: &mut [u8],
    root: Rank,
    tag: u32,
) -> Result<()> {
    context.broadcast(data, root, tag)
}

impl CollectiveWork for BroadcastWork {
    fn run(&mut self) -> Result<()> {
        let mut buf = self.inputs[self.root_tensor].dense_bytes()?;
        broadcast_bytes(self.context.as_ref(), &mut buf, self.root_rank, self.tag)?;
        // Copy the result into every input, root tensor included; on the
        // root that write-back is the identity.
        for t in &self.inputs {
            t.copy_from_bytes(&buf)?;
        }
        Ok(())
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

impl ProcessGroup {
    /// Broadcast `inputs[root_tensor]` from `root_rank` to every rank; all
    /// tensors in the list hold the result after `wait()`.
    pub fn broadcast(
        &self,
        inputs: &[Tensor],
        root_rank: Rank,
        root_tensor: usize,
    ) -> Result<Arc<dyn Work>> {
        checks::assert_root_rank(OP, root_rank, self.size())?;
        checks::assert_root_tensor(OP, root_tensor, inputs.len())?;
        checks::assert_dense(OP, inputs)?;
        checks::assert_type_and_sizes_match(OP, inputs)?;
        let device = checks::device_of(OP, inputs)?;

        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = match device {
            DeviceKind::Cpu => AsyncWork::new(Box::new(BroadcastWork {
                context,
                inputs: inputs.to_vec(),
                root_rank,
                root_tensor,
                tag,
            })),
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda(_) => AsyncWork::new(Box::new(
                crate::cuda::CudaBroadcastWork::new(
                    self.cuda_runtime(),
                    context,
                    inputs.to_vec(),
                    root_rank,
                    root_tensor,
                    tag,
                )?,
            )),
        };
        self.enqueue(Arc::clone(&work))?;
        Ok(work)
    }
}
