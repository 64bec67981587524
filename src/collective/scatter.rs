use std::sync::Arc;

use crate::collective::checks;
use crate::collective::helpers::flatten_dense;
use crate::error::{CohortError, Result};
use crate::group::ProcessGroup;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{DeviceKind, Rank};
use crate::work::{AsyncWork, CollectiveWork, Work};

const OP: &str = "scatter";

pub(crate) struct ScatterWork {
    pub(crate) context: Arc<dyn Context>,
    pub(crate) outputs: Vec<Tensor>,
    pub(crate) inputs: Vec<Vec<Tensor>>,
    pub(crate) root: Rank,
    pub(crate) tag: u32,
}

impl CollectiveWork for ScatterWork {
    fn run(&mut self) -> Result<()> {
        let mut out = vec![0u8; self.outputs[0].dense_byte_len()?];
        if self.context.rank() == self.root {
            let flat = flatten_dense(&self.inputs[0])?;
            self.context
                .scatter(Some(&flat), &mut out, self.root, self.tag)?;
        } else {
            self.context.scatter(None, &mut out, self.root, self.tag)?;
        }
        self.outputs[0].copy_from_bytes(&out)?;
        Ok(())
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.outputs.clone()
    }
}

impl ProcessGroup {
    /// Scatter the root's list of `size` tensors; each rank receives its
    /// slice into its single output tensor. On non-root ranks `inputs`
    /// must be empty.
    pub fn scatter(
        &self,
        outputs: &[Tensor],
        inputs: &[Vec<Tensor>],
        root_rank: Rank,
    ) -> Result<Arc<dyn Work>> {
        checks::assert_root_rank(OP, root_rank, self.size())?;
        checks::assert_single_element(OP, outputs, "output tensor list")?;
        checks::assert_dense(OP, outputs)?;

        if self.rank() == root_rank {
            if inputs.len() != 1 || inputs[0].len() != self.size() {
                return Err(CohortError::invalid_argument(
                    OP,
                    "requires a single-element input list containing a list with <size> tensors",
                ));
            }
            checks::assert_type_and_shape(
                OP,
                &inputs[0],
                outputs[0].dtype(),
                &outputs[0].shape(),
            )?;
        } else if !inputs.is_empty() {
            return Err(CohortError::invalid_argument(
                OP,
                "requires empty input on non-root",
            ));
        }
        let device = checks::device_of(OP, outputs)?;

        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = match device {
            DeviceKind::Cpu => AsyncWork::new(Box::new(ScatterWork {
                context,
                outputs: outputs.to_vec(),
                inputs: inputs.to_vec(),
                root: root_rank,
                tag,
            })),
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda(_) => AsyncWork::new(Box::new(crate::cuda::CudaScatterWork::new(
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

    /// Not implemented by this backend.
    pub fn reduce_scatter(
        &self,
        _outputs: &[Tensor],
        _inputs: &[Vec<Tensor>],
        _op: crate::types::ReduceOp,
    ) -> Result<Arc<dyn Work>> {
        Err(CohortError::unsupported(
            "reduce_scatter",
            "this backend does not support reduce_scatter",
        ))
    }
}
