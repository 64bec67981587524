//! Shared harness: bootstrap an in-process multi-rank group and drive every
//! rank from its own thread.

use std::sync::Arc;

use cohort::{GroupOptions, HashStore, LocalDevice, ProcessGroup, Store};

/// Run `f` once per rank, each on its own thread, against a freshly
/// bootstrapped group. Panics in any rank propagate.
pub fn run_ranks<F>(size: usize, num_devices: usize, f: F)
where
    F: Fn(ProcessGroup) + Send + Sync,
{
    let store: Arc<dyn Store> = Arc::new(HashStore::new());
    let device = LocalDevice::new();
    std::thread::scope(|s| {
        for rank in 0..size {
            let store = Arc::clone(&store);
            let device = device.clone();
            let f = &f;
            s.spawn(move || {
                let mut opts = GroupOptions::new();
                for _ in 0..num_devices {
                    opts = opts.device(Arc::new(device.clone()));
                }
                let group = ProcessGroup::new(store, rank, size, opts).unwrap();
                f(group);
            });
        }
    });
}

/// Single-rank group for validation tests.
pub fn single_rank_group() -> ProcessGroup {
    let store: Arc<dyn Store> = Arc::new(HashStore::new());
    let opts = GroupOptions::new().device(Arc::new(LocalDevice::new()));
    ProcessGroup::new(store, 0, 1, opts).unwrap()
}
