//! Per-collective dispatch and work-item variants.
//!
//! Each submodule carries one collective: the argument validation that runs
//! before a tag is allocated, the work item executed by the worker pool,
//! and (behind the `cuda` feature) the staged accelerator variant.

pub(crate) mod allgather;
pub(crate) mod allreduce;
pub(crate) mod barrier;
pub(crate) mod broadcast;
pub(crate) mod checks;
pub(crate) mod gather;
pub(crate) mod helpers;
pub(crate) mod reduce;
pub(crate) mod scatter;
pub(crate) mod send_recv;
pub(crate) mod sparse;

pub use send_recv::{RecvWork, SendWork};
