//! Point-to-point transfers over the transport's unbound buffers.
//!
//! These are not queued on the worker pool: the transfer is posted at
//! dispatch and `wait()` drives completion on the caller's thread. The
//! work captures the tensor handle to keep its storage alive until then.

use std::sync::{Arc, Mutex};

use crate::collective::checks;
use crate::error::{CohortError, Result};
use crate::group::ProcessGroup;
use crate::tensor::Tensor;
use crate::transport::{PendingRecv, PendingSend};
use crate::types::Rank;
use crate::work::Work;

fn check_single_tensor(op: &'static str, tensors: &[Tensor]) -> Result<Tensor> {
    checks::assert_single_element(op, tensors, "tensor list")?;
    checks::assert_dense(op, tensors)?;
    checks::assert_contiguous(op, tensors)?;
    Ok(tensors[0].clone())
}

fn check_tag(op: &'static str, tag: i32) -> Result<u32> {
    if tag < 0 {
        return Err(CohortError::invalid_argument(op, "tag must be >= 0"));
    }
    Ok(tag as u32)
}

#[derive(Debug)]
struct P2pState {
    completed: bool,
    error: Option<CohortError>,
    src_rank: Option<Rank>,
}

impl P2pState {
    fn new() -> Mutex<Self> {
        Mutex::new(Self {
            completed: false,
            error: None,
            src_rank: None,
        })
    }
}

pub struct SendWork {
    // Held so the sent storage outlives the transfer.
    _tensor: Tensor,
    pending: Box<dyn PendingSend>,
    state: Mutex<P2pState>,
}

impl std::fmt::Debug for SendWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendWork").field("state", &self.state).finish()
    }
}

impl Work for SendWork {
    fn wait(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CohortError::LockPoisoned("send state"))?;
        if !state.completed {
            state.error = self.pending.wait_send().err();
            state.completed = true;
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn is_completed(&self) -> bool {
        self.state.lock().map(|s| s.completed).unwrap_or(true)
    }
}

pub struct RecvWork {
    tensor: Tensor,
    pending: Box<dyn PendingRecv>,
    state: Mutex<P2pState>,
}

impl std::fmt::Debug for RecvWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvWork").field("state", &self.state).finish()
    }
}

impl Work for RecvWork {
    fn wait(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CohortError::LockPoisoned("recv state"))?;
        if !state.completed {
            match self.pending.wait_recv() {
                Ok((src, bytes)) => {
                    state.src_rank = Some(src);
                    state.error = self.tensor.copy_from_bytes(&bytes).err();
                }
                Err(e) => state.error = Some(e),
            }
            state.completed = true;
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn is_completed(&self) -> bool {
        self.state.lock().map(|s| s.completed).unwrap_or(true)
    }

    fn result(&self) -> Vec<Tensor> {
        vec![self.tensor.clone()]
    }

    fn source_rank(&self) -> Option<Rank> {
        self.state.lock().ok().and_then(|s| s.src_rank)
    }
}

impl ProcessGroup {
    /// Send a single contiguous dense tensor to `dst`. The context is
    /// chosen by the user-supplied tag.
    pub fn send(&self, tensors: &[Tensor], dst: Rank, tag: i32) -> Result<Arc<dyn Work>> {
        const OP: &str = "send";
        let tensor = check_single_tensor(OP, tensors)?;
        let utag = check_tag(OP, tag)?;

        let context = self.context_for_tag(utag);
        let pending = context.post_send(tensor.dense_bytes()?, dst, utag)?;
        Ok(Arc::new(SendWork {
            _tensor: tensor,
            pending,
            state: P2pState::new(),
        }))
    }

    /// Receive a single contiguous dense tensor from `src`.
    pub fn recv(&self, tensors: &[Tensor], src: Rank, tag: i32) -> Result<Arc<dyn Work>> {
        const OP: &str = "recv";
        let tensor = check_single_tensor(OP, tensors)?;
        let utag = check_tag(OP, tag)?;

        let context = self.context_for_tag(utag);
        let pending = context.post_recv(tensor.dense_byte_len()?, vec![src], utag)?;
        Ok(Arc::new(RecvWork {
            tensor,
            pending,
            state: P2pState::new(),
        }))
    }

    /// Receive from any rank in the group. After `wait()`, the handle's
    /// `source_rank()` reports the resolved sender.
    pub fn recv_anysource(&self, tensors: &[Tensor], tag: i32) -> Result<Arc<dyn Work>> {
        const OP: &str = "recv_anysource";
        let tensor = check_single_tensor(OP, tensors)?;
        let utag = check_tag(OP, tag)?;

        // Any rank in [0, size) may be the sender.
        let src_ranks: Vec<Rank> = (0..self.size()).collect();
        let context = self.context_for_tag(utag);
        let pending = context.post_recv(tensor.dense_byte_len()?, src_ranks, utag)?;
        Ok(Arc::new(RecvWork {
            tensor,
            pending,
            state: P2pState::new(),
        }))
    }
}
