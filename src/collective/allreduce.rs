use std::sync::Arc;

use crate::collective::checks;
use crate::collective::helpers::{flatten_dense, unflatten_dense};
use crate::collective::sparse::SparseAllreduceWork;
use crate::error::{CohortError, Result};
use crate::group::ProcessGroup;
use crate::reduce::reduce_function;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{DeviceKind, Layout, ReduceOp};
use crate::work::{AsyncWork, CollectiveWork, Work};

const OP: &str = "allreduce";
const OP_COALESCED: &str = "allreduce_coalesced";

pub(crate) struct AllreduceWork {
    pub(crate) context: Arc<dyn Context>,
    pub(crate) inputs: Vec<Tensor>,
    pub(crate) op: ReduceOp,
    pub(crate) tag: u32,
}

/// Allreduce over a list of equally-sized byte buffers.
///
/// Local buffers are pre-reduced into `bufs[0]`, which then carries the
/// cross-rank reduction. Only `bufs[0]` is authoritative on return; the
/// transport leaves the remaining entries untouched.
pub(crate) fn allreduce_bytes(
    context: &dyn Context,
    bufs: &mut [Vec<u8>],
    dtype: crate::types::ScalarType,
    op: ReduceOp,
    tag: u32,
) -> Result<()> {
    let f = reduce_function(dtype, op)?;
    let (first, rest) = bufs
        .split_first_mut()
        .ok_or_else(|| CohortError::invalid_argument(OP, "empty buffer list"))?;
    for b in rest {
        f.apply(first, b)?;
    }
    context.allreduce(first, &f, tag)
}

impl CollectiveWork for AllreduceWork {
    fn run(&mut self) -> Result<()> {
        let mut bufs: Vec<Vec<u8>> = self
            .inputs
            .iter()
            .map(|t| t.dense_bytes())
            .collect::<Result<_>>()?;
        allreduce_bytes(
            self.context.as_ref(),
            &mut bufs,
            self.inputs[0].dtype(),
            self.op,
            self.tag,
        )?;
        self.inputs[0].copy_from_bytes(&bufs[0])?;
        // Only the first output is authoritative; mirror it into the rest
        // of the list.
        for t in &self.inputs[1..] {
            t.copy_from(&self.inputs[0])?;
        }
        Ok(())
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

pub(crate) struct AllreduceCoalescedWork {
    context: Arc<dyn Context>,
    tensors: Vec<Tensor>,
    op: ReduceOp,
    tag: u32,
}

impl CollectiveWork for AllreduceCoalescedWork {
    fn run(&mut self) -> Result<()> {
        // Reduce the flattened concatenation in one transport call, then
        // split it back and reshape into the original tensors.
        let f = reduce_function(self.tensors[0].dtype(), self.op)?;
        let mut flat = flatten_dense(&self.tensors)?;
        self.context.allreduce(&mut flat, &f, self.tag)?;
        unflatten_dense(&flat, &self.tensors)
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.tensors.clone()
    }
}

impl ProcessGroup {
    /// Allreduce over dense tensors, or sparse-coo tensors with
    /// [`ReduceOp::Sum`].
    pub fn allreduce(&self, inputs: &[Tensor], op: ReduceOp) -> Result<Arc<dyn Work>> {
        checks::assert_non_empty(OP, inputs)?;
        checks::assert_layout_match(OP, inputs)?;
        checks::assert_type_and_sizes_match(OP, inputs)?;
        let device = checks::device_of(OP, inputs)?;

        let layout = inputs[0].layout();
        if layout == Layout::SparseCoo {
            if op != ReduceOp::Sum {
                return Err(CohortError::unsupported(
                    OP,
                    "allreduce of sparse tensors only works with ReduceOp::Sum",
                ));
            }
            checks::assert_sparse_dims(OP, inputs)?;
        }

        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = match (device, layout) {
            (DeviceKind::Cpu, Layout::Strided) => AsyncWork::new(Box::new(AllreduceWork {
                context,
                inputs: inputs.to_vec(),
                op,
                tag,
            })),
            (DeviceKind::Cpu, Layout::SparseCoo) => AsyncWork::new(Box::new(
                SparseAllreduceWork::new(context, inputs.to_vec(), tag),
            )),
            #[cfg(feature = "cuda")]
            (DeviceKind::Cuda(_), Layout::Strided) => AsyncWork::new(Box::new(
                crate::cuda::CudaAllreduceWork::new(
                    self.cuda_runtime(),
                    context,
                    inputs.to_vec(),
                    op,
                    tag,
                )?,
            )),
            #[cfg(feature = "cuda")]
            (DeviceKind::Cuda(_), Layout::SparseCoo) => AsyncWork::new(Box::new(
                crate::cuda::CudaSparseAllreduceWork::new(
                    self.cuda_runtime(),
                    context,
                    inputs.to_vec(),
                    tag,
                )?,
            )),
        };
        self.enqueue(Arc::clone(&work))?;
        Ok(work)
    }

    /// Allreduce a list of same-dtype tensors of arbitrary shapes as one
    /// flattened buffer. CPU-only.
    pub fn allreduce_coalesced(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Arc<dyn Work>> {
        checks::assert_non_empty(OP_COALESCED, tensors)?;
        checks::assert_layout_match(OP_COALESCED, tensors)?;
        checks::assert_dense(OP_COALESCED, tensors)?;
        let dtype = tensors[0].dtype();
        for t in &tensors[1..] {
            if t.dtype() != dtype {
                return Err(CohortError::invalid_argument(
                    OP_COALESCED,
                    "tensors must all have the same type",
                ));
            }
        }
        let device = checks::device_of(OP_COALESCED, tensors)?;
        if !device.is_cpu() {
            return Err(CohortError::invalid_argument(
                OP_COALESCED,
                "unsupported device type",
            ));
        }

        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = AsyncWork::new(Box::new(AllreduceCoalescedWork {
            context,
            tensors: tensors.to_vec(),
            op,
            tag,
        }));
        self.enqueue(Arc::clone(&work))?;
        Ok(work)
    }
}
