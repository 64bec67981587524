use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::group::ProcessGroup;
use crate::transport::Context;
use crate::work::{AsyncWork, CollectiveWork, Work};

pub(crate) struct BarrierWork {
    context: Arc<dyn Context>,
    /// Weak snapshot of everything in flight or queued at submission time.
    /// Non-owning so the barrier never extends prior work's lifetime;
    /// anything already dropped has necessarily completed.
    prior_work: Vec<Weak<AsyncWork>>,
    tag: u32,
}

impl CollectiveWork for BarrierWork {
    fn run(&mut self) -> Result<()> {
        // Wait on prior work to complete.
        for weak in &self.prior_work {
            if let Some(work) = weak.upgrade() {
                work.wait()?;
            }
        }
        self.context.barrier(self.tag)
    }
}

impl ProcessGroup {
    /// Synchronize all ranks. Completes only after every collective
    /// submitted before this call has completed on this rank and all peers
    /// have reached their matching barrier. Work submitted afterwards is
    /// not ordered by it.
    pub fn barrier(&self) -> Result<Arc<dyn Work>> {
        let prior_work = self.snapshot_pending()?;
        let tag = self.next_tag();
        let context = self.context_for_tag(tag);
        let work = AsyncWork::new(Box::new(BarrierWork {
            context,
            prior_work,
            tag,
        }));
        self.enqueue(Arc::clone(&work))?;
        Ok(work)
    }
}
