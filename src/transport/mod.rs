//! Transport interface consumed by the process group.
//!
//! A [`TransportDevice`] turns a rendezvous store into a full-mesh
//! [`Context`]. Contexts expose byte-level collective primitives over
//! contiguous host buffers, demultiplexed by tag, plus unbound point-to-point
//! transfers. A context is read-only after construction and may be used
//! concurrently by multiple workers only for distinct tags.

pub mod local;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::reduce::ReduceFn;
use crate::store::Store;
use crate::types::Rank;

pub use local::LocalDevice;

/// Factory for transport contexts, one per configured device.
pub trait TransportDevice: Send + Sync {
    /// Establish all-pairs connectivity through `store` and return a
    /// context for this rank.
    fn connect_full_mesh(
        &self,
        store: &dyn Store,
        rank: Rank,
        size: usize,
        timeout: Duration,
    ) -> Result<Arc<dyn Context>>;
}

/// A full-mesh connection table with tag-demultiplexed collectives.
pub trait Context: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Per-operation timeout configured at connect time.
    fn timeout(&self) -> Duration;

    /// Root's buffer is sent to every rank; all buffers hold the root's
    /// bytes on return.
    fn broadcast(&self, data: &mut [u8], root: Rank, tag: u32) -> Result<()>;

    /// Element-wise reduction of every rank's buffer; the result is
    /// deposited in the root's buffer only.
    fn reduce(&self, data: &mut [u8], root: Rank, f: &ReduceFn, tag: u32) -> Result<()>;

    /// Element-wise reduction of every rank's buffer; every buffer holds
    /// the result on return.
    fn allreduce(&self, data: &mut [u8], f: &ReduceFn, tag: u32) -> Result<()>;

    /// Concatenation of every rank's `input` in rank order, written to
    /// every rank's `output` (`output.len() == size * input.len()`).
    fn allgather(&self, input: &[u8], output: &mut [u8], tag: u32) -> Result<()>;

    /// Rank-order concatenation delivered to the root only. Non-root ranks
    /// pass `None`.
    fn gather(&self, input: &[u8], output: Option<&mut [u8]>, root: Rank, tag: u32)
        -> Result<()>;

    /// Root's `input` (`size * output.len()` bytes) is split in rank order;
    /// each rank receives its slice. Non-root ranks pass `None`.
    fn scatter(&self, input: Option<&[u8]>, output: &mut [u8], root: Rank, tag: u32)
        -> Result<()>;

    /// Block until every rank has reached the matching tag.
    fn barrier(&self, tag: u32) -> Result<()>;

    /// Post an unbound point-to-point send of `bytes` to `dst`.
    fn post_send(&self, bytes: Vec<u8>, dst: Rank, tag: u32) -> Result<Box<dyn PendingSend>>;

    /// Post an unbound point-to-point receive of exactly `len` bytes from
    /// any rank in `srcs`.
    fn post_recv(&self, len: usize, srcs: Vec<Rank>, tag: u32) -> Result<Box<dyn PendingRecv>>;
}

/// Outstanding unbound send.
pub trait PendingSend: Send + Sync {
    /// Block until the peer has received the message.
    fn wait_send(&self) -> Result<()>;
}

/// Outstanding unbound receive.
pub trait PendingRecv: Send + Sync {
    /// Block until a matching message arrives. Returns the resolved source
    /// rank and the received bytes.
    fn wait_recv(&self) -> Result<(Rank, Vec<u8>)>;
}
