//! In-process reference transport.
//!
//! All ranks of a group live in one process and exchange data through a
//! shared hub. Collectives rendezvous on per-(tag, call) slots; the last
//! rank to arrive combines the contributions in ascending rank order, so
//! reduction order is deterministic for a fixed (size, tag). Point-to-point
//! transfers go through per-(destination, tag) mailboxes with rendezvous
//! completion: a send finishes once the receiver has claimed it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{CohortError, Result};
use crate::reduce::ReduceFn;
use crate::store::Store;
use crate::transport::{Context, PendingRecv, PendingSend, TransportDevice};
use crate::types::Rank;

struct Slot {
    contrib: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
    done: Option<Result<Arc<Vec<u8>>>>,
}

impl Slot {
    fn new(size: usize) -> Self {
        Self {
            contrib: vec![None; size],
            arrived: 0,
            departed: 0,
            done: None,
        }
    }
}

struct Envelope {
    src: Rank,
    bytes: Arc<Vec<u8>>,
    delivered: Arc<AtomicBool>,
}

#[derive(Default)]
struct HubState {
    /// Collective slots keyed by (mesh, tag, per-tag call sequence).
    slots: HashMap<(u64, u32, u64), Slot>,
    /// Point-to-point mailboxes keyed by (mesh, destination, tag).
    mail: HashMap<(u64, Rank, u32), VecDeque<Envelope>>,
}

struct Hub {
    next_mesh: AtomicU64,
    state: Mutex<HubState>,
    cv: Condvar,
}

impl Hub {
    fn lock(&self) -> Result<MutexGuard<'_, HubState>> {
        self.state
            .lock()
            .map_err(|_| CohortError::LockPoisoned("transport hub"))
    }
}

/// In-process transport device. Clone it (or the wrapping `Arc`) and hand
/// the same instance to every rank of the group.
#[derive(Clone)]
pub struct LocalDevice {
    hub: Arc<Hub>,
}

impl LocalDevice {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                next_mesh: AtomicU64::new(0),
                state: Mutex::new(HubState::default()),
                cv: Condvar::new(),
            }),
        }
    }
}

impl Default for LocalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportDevice for LocalDevice {
    fn connect_full_mesh(
        &self,
        store: &dyn Store,
        rank: Rank,
        size: usize,
        timeout: Duration,
    ) -> Result<Arc<dyn Context>> {
        if size == 0 || rank >= size {
            return Err(CohortError::InvalidRank { rank, size });
        }

        // Rank 0 allocates the mesh id; peers read it from the store.
        let mesh = if rank == 0 {
            let id = self.hub.next_mesh.fetch_add(1, Ordering::Relaxed);
            store.set("mesh", id.to_le_bytes().to_vec())?;
            id
        } else {
            store.wait_timeout(&["mesh".to_string()], timeout)?;
            let bytes = store.get("mesh")?;
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CohortError::Store("malformed mesh id".into()))?;
            u64::from_le_bytes(arr)
        };

        // Construction completes only once every peer has checked in.
        store.set(&format!("rank/{rank}"), rank.to_le_bytes().to_vec())?;
        let keys: Vec<String> = (0..size).map(|r| format!("rank/{r}")).collect();
        store.wait_timeout(&keys, timeout)?;

        tracing::debug!(rank, size, mesh, "local transport mesh connected");
        Ok(Arc::new(LocalContext {
            hub: Arc::clone(&self.hub),
            mesh,
            rank,
            size,
            timeout,
            seqs: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct LocalContext {
    hub: Arc<Hub>,
    mesh: u64,
    rank: Rank,
    size: usize,
    timeout: Duration,
    /// Per-tag call counters. Sequential collectives may legally reuse a
    /// tag (the sparse engine gathers three buffers under one tag), so a
    /// slot is keyed by (tag, call ordinal) rather than tag alone.
    seqs: Mutex<HashMap<u32, u64>>,
}

impl LocalContext {
    fn next_seq(&self, tag: u32) -> Result<u64> {
        let mut seqs = self
            .seqs
            .lock()
            .map_err(|_| CohortError::LockPoisoned("context sequence table"))?;
        let seq = seqs.entry(tag).or_insert(0);
        let out = *seq;
        *seq += 1;
        Ok(out)
    }

    fn timeout_error(&self, what: &'static str) -> CohortError {
        CohortError::Timeout {
            what,
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Deposit this rank's contribution, wait for all ranks, and return the
    /// shared result computed by the last arriver.
    fn rendezvous<F>(&self, tag: u32, contribution: Option<Vec<u8>>, compute: F) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce(&[Option<Vec<u8>>]) -> Result<Vec<u8>>,
    {
        let seq = self.next_seq(tag)?;
        let key = (self.mesh, tag, seq);
        let deadline = Instant::now() + self.timeout;

        let mut st = self.hub.lock()?;
        {
            let slot = st.slots.entry(key).or_insert_with(|| Slot::new(self.size));
            if let Some(bytes) = contribution {
                slot.contrib[self.rank] = Some(bytes);
            }
            slot.arrived += 1;
            if slot.arrived == self.size {
                slot.done = Some(compute(&slot.contrib).map(Arc::new));
                self.hub.cv.notify_all();
            }
        }

        loop {
            let slot = st
                .slots
                .get_mut(&key)
                .ok_or_else(|| CohortError::transport("collective slot vanished"))?;
            if let Some(done) = slot.done.clone() {
                slot.departed += 1;
                if slot.departed == self.size {
                    st.slots.remove(&key);
                }
                return done;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error("collective"));
            }
            let (guard, _) = self
                .hub
                .cv
                .wait_timeout(st, deadline - now)
                .map_err(|_| CohortError::LockPoisoned("transport hub"))?;
            st = guard;
        }
    }
}

/// Fold all contributions in ascending rank order.
fn fold_contributions(contrib: &[Option<Vec<u8>>], f: &ReduceFn) -> Result<Vec<u8>> {
    let mut iter = contrib.iter();
    let mut acc = iter
        .next()
        .and_then(|c| c.clone())
        .ok_or_else(|| CohortError::transport("missing contribution from rank 0"))?;
    for (r, c) in iter.enumerate() {
        let c = c
            .as_ref()
            .ok_or_else(|| CohortError::transport(format!("missing contribution from rank {}", r + 1)))?;
        f.apply(&mut acc, c)?;
    }
    Ok(acc)
}

fn concat_contributions(contrib: &[Option<Vec<u8>>]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (r, c) in contrib.iter().enumerate() {
        let c = c
            .as_ref()
            .ok_or_else(|| CohortError::transport(format!("missing contribution from rank {r}")))?;
        out.extend_from_slice(c);
    }
    Ok(out)
}

fn copy_result(dst: &mut [u8], result: &[u8]) -> Result<()> {
    if dst.len() != result.len() {
        return Err(CohortError::BufferSizeMismatch {
            expected: dst.len(),
            actual: result.len(),
        });
    }
    dst.copy_from_slice(result);
    Ok(())
}

impl Context for LocalContext {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn broadcast(&self, data: &mut [u8], root: Rank, tag: u32) -> Result<()> {
        let contribution = if self.rank == root {
            Some(data.to_vec())
        } else {
            None
        };
        let result = self.rendezvous(tag, contribution, move |contrib| {
            contrib
                .get(root)
                .and_then(|c| c.clone())
                .ok_or_else(|| CohortError::transport("missing root contribution"))
        })?;
        copy_result(data, &result)
    }

    fn reduce(&self, data: &mut [u8], root: Rank, f: &ReduceFn, tag: u32) -> Result<()> {
        let f = *f;
        let result = self.rendezvous(tag, Some(data.to_vec()), move |contrib| {
            fold_contributions(contrib, &f)
        })?;
        if self.rank == root {
            copy_result(data, &result)?;
        }
        Ok(())
    }

    fn allreduce(&self, data: &mut [u8], f: &ReduceFn, tag: u32) -> Result<()> {
        let f = *f;
        let result = self.rendezvous(tag, Some(data.to_vec()), move |contrib| {
            fold_contributions(contrib, &f)
        })?;
        copy_result(data, &result)
    }

    fn allgather(&self, input: &[u8], output: &mut [u8], tag: u32) -> Result<()> {
        let result = self.rendezvous(tag, Some(input.to_vec()), concat_contributions)?;
        copy_result(output, &result)
    }

    fn gather(
        &self,
        input: &[u8],
        output: Option<&mut [u8]>,
        root: Rank,
        tag: u32,
    ) -> Result<()> {
        let result = self.rendezvous(tag, Some(input.to_vec()), concat_contributions)?;
        if self.rank == root {
            let output = output.ok_or_else(|| {
                CohortError::transport("gather root called without an output buffer")
            })?;
            copy_result(output, &result)?;
        }
        Ok(())
    }

    fn scatter(
        &self,
        input: Option<&[u8]>,
        output: &mut [u8],
        root: Rank,
        tag: u32,
    ) -> Result<()> {
        let contribution = if self.rank == root {
            let input = input.ok_or_else(|| {
                CohortError::transport("scatter root called without an input buffer")
            })?;
            Some(input.to_vec())
        } else {
            None
        };
        let result = self.rendezvous(tag, contribution, move |contrib| {
            contrib
                .get(root)
                .and_then(|c| c.clone())
                .ok_or_else(|| CohortError::transport("missing root contribution"))
        })?;
        let out_len = output.len();
        if result.len() != out_len * self.size {
            return Err(CohortError::BufferSizeMismatch {
                expected: out_len * self.size,
                actual: result.len(),
            });
        }
        let off = self.rank * out_len;
        output.copy_from_slice(&result[off..off + out_len]);
        Ok(())
    }

    fn barrier(&self, tag: u32) -> Result<()> {
        self.rendezvous(tag, Some(Vec::new()), |_| Ok(Vec::new()))?;
        Ok(())
    }

    fn post_send(&self, bytes: Vec<u8>, dst: Rank, tag: u32) -> Result<Box<dyn PendingSend>> {
        let delivered = Arc::new(AtomicBool::new(false));
        let env = Envelope {
            src: self.rank,
            bytes: Arc::new(bytes),
            delivered: Arc::clone(&delivered),
        };
        let mut st = self.hub.lock()?;
        st.mail
            .entry((self.mesh, dst, tag))
            .or_default()
            .push_back(env);
        drop(st);
        self.hub.cv.notify_all();
        Ok(Box::new(LocalPendingSend {
            hub: Arc::clone(&self.hub),
            delivered,
            timeout: self.timeout,
        }))
    }

    fn post_recv(&self, len: usize, srcs: Vec<Rank>, tag: u32) -> Result<Box<dyn PendingRecv>> {
        Ok(Box::new(LocalPendingRecv {
            hub: Arc::clone(&self.hub),
            key: (self.mesh, self.rank, tag),
            srcs,
            len,
            timeout: self.timeout,
        }))
    }
}

struct LocalPendingSend {
    hub: Arc<Hub>,
    delivered: Arc<AtomicBool>,
    timeout: Duration,
}

impl PendingSend for LocalPendingSend {
    fn wait_send(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut st = self.hub.lock()?;
        loop {
            if self.delivered.load(Ordering::Acquire) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CohortError::Timeout {
                    what: "send",
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .hub
                .cv
                .wait_timeout(st, deadline - now)
                .map_err(|_| CohortError::LockPoisoned("transport hub"))?;
            st = guard;
        }
    }
}

struct LocalPendingRecv {
    hub: Arc<Hub>,
    key: (u64, Rank, u32),
    srcs: Vec<Rank>,
    len: usize,
    timeout: Duration,
}

impl PendingRecv for LocalPendingRecv {
    fn wait_recv(&self) -> Result<(Rank, Vec<u8>)> {
        let deadline = Instant::now() + self.timeout;
        let mut st = self.hub.lock()?;
        loop {
            if let Some(queue) = st.mail.get_mut(&self.key) {
                let pos = queue.iter().position(|e| self.srcs.contains(&e.src));
                if let Some(pos) = pos {
                    let env = queue.remove(pos).expect("position is in bounds");
                    env.delivered.store(true, Ordering::Release);
                    drop(st);
                    self.hub.cv.notify_all();
                    if env.bytes.len() != self.len {
                        return Err(CohortError::BufferSizeMismatch {
                            expected: self.len,
                            actual: env.bytes.len(),
                        });
                    }
                    return Ok((env.src, env.bytes.as_ref().clone()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CohortError::Timeout {
                    what: "recv",
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .hub
                .cv
                .wait_timeout(st, deadline - now)
                .map_err(|_| CohortError::LockPoisoned("transport hub"))?;
            st = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::reduce_function;
    use crate::store::HashStore;
    use crate::types::{ReduceOp, ScalarType};
    use std::thread;

    fn connect_all(size: usize) -> Vec<Arc<dyn Context>> {
        let device = LocalDevice::new();
        let store: Arc<dyn Store> = Arc::new(HashStore::new());
        let mut contexts = Vec::new();
        thread::scope(|s| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let device = device.clone();
                    let store = Arc::clone(&store);
                    s.spawn(move || {
                        device
                            .connect_full_mesh(store.as_ref(), rank, size, Duration::from_secs(5))
                            .unwrap()
                    })
                })
                .collect();
            for h in handles {
                contexts.push(h.join().unwrap());
            }
        });
        contexts
    }

    #[test]
    fn test_allreduce_sum() {
        let contexts = connect_all(3);
        let f = reduce_function(ScalarType::I32, ReduceOp::Sum).unwrap();
        thread::scope(|s| {
            for ctx in &contexts {
                s.spawn(move || {
                    let rank = ctx.rank() as i32;
                    let mut buf: Vec<u8> = [rank, rank * 10]
                        .iter()
                        .flat_map(|x| x.to_le_bytes())
                        .collect();
                    ctx.allreduce(&mut buf, &f, 7).unwrap();
                    let got: Vec<i32> = buf
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    assert_eq!(got, vec![3, 30]);
                });
            }
        });
    }

    #[test]
    fn test_broadcast_and_scatter() {
        let contexts = connect_all(4);
        thread::scope(|s| {
            for ctx in &contexts {
                s.spawn(move || {
                    // broadcast from rank 2
                    let mut buf = if ctx.rank() == 2 {
                        vec![9u8, 8, 7]
                    } else {
                        vec![0u8; 3]
                    };
                    ctx.broadcast(&mut buf, 2, 1).unwrap();
                    assert_eq!(buf, vec![9, 8, 7]);

                    // scatter from rank 0: rank r receives [r, r]
                    let mut out = vec![0u8; 2];
                    if ctx.rank() == 0 {
                        let flat: Vec<u8> = vec![0, 0, 1, 1, 2, 2, 3, 3];
                        ctx.scatter(Some(&flat), &mut out, 0, 2).unwrap();
                    } else {
                        ctx.scatter(None, &mut out, 0, 2).unwrap();
                    }
                    assert_eq!(out, vec![ctx.rank() as u8; 2]);
                });
            }
        });
    }

    #[test]
    fn test_send_recv_rendezvous() {
        let contexts = connect_all(2);
        thread::scope(|s| {
            let c0 = &contexts[0];
            let c1 = &contexts[1];
            s.spawn(move || {
                let pending = c0.post_send(vec![1, 2, 3], 1, 42).unwrap();
                pending.wait_send().unwrap();
            });
            s.spawn(move || {
                let pending = c1.post_recv(3, vec![0], 42).unwrap();
                let (src, bytes) = pending.wait_recv().unwrap();
                assert_eq!(src, 0);
                assert_eq!(bytes, vec![1, 2, 3]);
            });
        });
    }

    #[test]
    fn test_tag_reuse_is_sequenced() {
        // Two back-to-back allgathers under the same tag must not collide.
        let contexts = connect_all(2);
        thread::scope(|s| {
            for ctx in &contexts {
                s.spawn(move || {
                    for round in 0u8..2 {
                        let input = vec![round * 10 + ctx.rank() as u8];
                        let mut out = vec![0u8; 2];
                        ctx.allgather(&input, &mut out, 5).unwrap();
                        assert_eq!(out, vec![round * 10, round * 10 + 1]);
                    }
                });
            }
        });
    }

    #[test]
    fn test_recv_timeout() {
        let device = LocalDevice::new();
        let store: Arc<dyn Store> = Arc::new(HashStore::new());
        let ctx = device
            .connect_full_mesh(store.as_ref(), 0, 1, Duration::from_millis(50))
            .unwrap();
        let pending = ctx.post_recv(1, vec![0], 9).unwrap();
        let err = pending.wait_recv().unwrap_err();
        assert!(matches!(err, CohortError::Timeout { .. }));
    }
}
