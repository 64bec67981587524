//! Accelerator staging through pinned host memory.
//!
//! Device-resident collectives never run on the caller's stream. At
//! construction a work item records an event on the caller's current
//! stream, makes a pool stream wait on it, and kicks off async
//! device-to-host copies into pinned buffers. The worker thread then
//! synchronizes those copies, performs the host-side collective, and
//! enqueues async host-to-device copies, recording one completion event
//! per output. `synchronize()` makes the caller's current stream wait on
//! those events, so kernels enqueued after `wait()` observe the result
//! without any host-side blocking.
//!
//! Uses cudarc's `result` layer directly (raw events and async memcpys)
//! rather than the `safe` wrappers, so streams and events can be shared
//! across the worker pool without lifetime gymnastics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_queue::ArrayQueue;
use cudarc::driver::sys;
use cudarc::driver::{result as cu, CudaDevice, CudaStream};

use crate::collective::allreduce::allreduce_bytes;
use crate::collective::broadcast::broadcast_bytes;
use crate::collective::reduce::reduce_bytes;
use crate::collective::sparse::SparseAllreduceWork;
use crate::error::{CohortError, Result};
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{DeviceKind, Rank, ReduceOp};
use crate::work::CollectiveWork;

/// Streams kept warm per device for staging copies.
const POOL_STREAMS_PER_DEVICE: usize = 32;

fn cu_err(e: cu::DriverError) -> CohortError {
    CohortError::runtime(format!("cuda driver error: {e}"))
}

fn ordinal_of(tensor: &Tensor) -> Result<usize> {
    match tensor.device() {
        DeviceKind::Cuda(i) => Ok(i),
        DeviceKind::Cpu => Err(CohortError::runtime(
            "accelerator staging requested for a host tensor",
        )),
    }
}

// ── Device memory ───────────────────────────────────────────────────

/// Raw device allocation backing an accelerator-resident tensor.
pub struct DeviceBuffer {
    ptr: sys::CUdeviceptr,
    len: usize,
    ordinal: usize,
}

// The pointer is only dereferenced by the driver.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    fn alloc(len: usize, ordinal: usize) -> Result<Self> {
        let ptr = unsafe { cu::malloc_sync(len.max(1)).map_err(cu_err)? };
        Ok(Self { ptr, len, ordinal })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = cu::free_sync(self.ptr);
        }
    }
}

/// Page-locked host buffer for async DMA.
pub(crate) struct PinnedBuffer {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for PinnedBuffer {}

impl PinnedBuffer {
    fn new(len: usize) -> Result<Self> {
        let ptr = unsafe {
            cu::malloc_host(len.max(1), sys::CU_MEMHOSTALLOC_PORTABLE).map_err(cu_err)?
        };
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// Pinned buffer sized like a dense tensor's byte image.
    fn like(tensor: &Tensor) -> Result<Self> {
        Self::new(tensor.dense_byte_len()?)
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.as_mut_slice().copy_from_slice(bytes);
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        unsafe {
            let _ = cu::free_host(self.ptr as *mut std::ffi::c_void);
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

struct Event(sys::CUevent);

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    fn new() -> Result<Self> {
        cu::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map(Event)
            .map_err(cu_err)
    }

    fn record(&self, stream: &CudaStream) -> Result<()> {
        unsafe { cu::event::record(self.0, stream.cu_stream()).map_err(cu_err) }
    }

    fn block_stream(&self, stream: &CudaStream) -> Result<()> {
        unsafe {
            cu::stream::wait_event(
                stream.cu_stream(),
                self.0,
                sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
            .map_err(cu_err)
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            let _ = cu::event::destroy(self.0);
        }
    }
}

// ── Runtime: device handles and the stream pool ─────────────────────

struct DeviceState {
    device: Arc<CudaDevice>,
    /// Stand-in for the caller's current stream on this device.
    current: Arc<CudaStream>,
    pool: ArrayQueue<CudaStream>,
}

/// Per-group CUDA state: device handles and pre-allocated pool streams.
/// Owned by the process group so nothing outlives it.
pub struct CudaRuntime {
    devices: Mutex<HashMap<usize, Arc<DeviceState>>>,
}

impl CudaRuntime {
    pub(crate) fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self, ordinal: usize) -> Result<Arc<DeviceState>> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| CohortError::LockPoisoned("cuda devices"))?;
        if let Some(state) = devices.get(&ordinal) {
            return Ok(Arc::clone(state));
        }
        let device = CudaDevice::new(ordinal).map_err(cu_err)?;
        let current = Arc::new(device.fork_default_stream().map_err(cu_err)?);
        let state = Arc::new(DeviceState {
            device,
            current,
            pool: ArrayQueue::new(POOL_STREAMS_PER_DEVICE),
        });
        devices.insert(ordinal, Arc::clone(&state));
        Ok(state)
    }

    fn pool_stream(&self, ordinal: usize) -> Result<PoolStream> {
        let state = self.state(ordinal)?;
        let stream = match state.pool.pop() {
            Some(s) => s,
            None => state.device.fork_default_stream().map_err(cu_err)?,
        };
        Ok(PoolStream {
            stream: Some(stream),
            home: state,
        })
    }
}

/// A stream checked out of the pool; returned on drop.
struct PoolStream {
    stream: Option<CudaStream>,
    home: Arc<DeviceState>,
}

impl PoolStream {
    fn get(&self) -> &CudaStream {
        self.stream.as_ref().expect("stream present until drop")
    }
}

impl Drop for PoolStream {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = self.home.pool.push(stream);
        }
    }
}

// ── Per-work staging state ──────────────────────────────────────────

struct Lane {
    state: Arc<DeviceState>,
    stream: PoolStream,
    done: Event,
}

/// One staging lane per tensor (or per nested tensor list). Construction
/// serializes each lane's pool stream behind the caller's current stream.
struct Staging {
    lanes: Vec<Lane>,
}

impl Staging {
    fn for_ordinals(runtime: &CudaRuntime, ordinals: &[usize]) -> Result<Self> {
        let mut lanes = Vec::with_capacity(ordinals.len());
        for &ordinal in ordinals {
            let state = runtime.state(ordinal)?;
            let stream = runtime.pool_stream(ordinal)?;
            // Serialize the pool stream behind everything already enqueued
            // on the caller's stream.
            let ready = Event::new()?;
            ready.record(&state.current)?;
            ready.block_stream(stream.get())?;
            lanes.push(Lane {
                state,
                stream,
                done: Event::new()?,
            });
        }
        Ok(Self { lanes })
    }

    fn for_tensors(runtime: &CudaRuntime, tensors: &[Tensor]) -> Result<Self> {
        let ordinals: Vec<usize> = tensors
            .iter()
            .map(ordinal_of)
            .collect::<Result<_>>()?;
        Self::for_ordinals(runtime, &ordinals)
    }

    /// One lane per nested list; tensors within a list share a device.
    fn for_tensor_lists(runtime: &CudaRuntime, lists: &[Vec<Tensor>]) -> Result<Self> {
        let mut ordinals = Vec::with_capacity(lists.len());
        for list in lists {
            let first = list.first().ok_or_else(|| {
                CohortError::runtime("empty tensor list in accelerator staging")
            })?;
            let ordinal = ordinal_of(first)?;
            for t in &list[1..] {
                if ordinal_of(t)? != ordinal {
                    return Err(CohortError::runtime(
                        "tensors in the nested tensor vectors need to be on the same device",
                    ));
                }
            }
            ordinals.push(ordinal);
        }
        Self::for_ordinals(runtime, &ordinals)
    }

    /// Async device-to-host copy of a tensor's storage into `pinned`.
    fn d2h(&self, lane: usize, tensor: &Tensor, pinned: &mut PinnedBuffer) -> Result<()> {
        match tensor.device_buf()? {
            Some(buf) => unsafe {
                cu::memcpy_dtoh_async(
                    pinned.as_mut_slice(),
                    buf.ptr,
                    self.lanes[lane].stream.get().cu_stream(),
                )
                .map_err(cu_err)?;
                Ok(())
            },
            // Nothing resident on the device yet: the host image is
            // authoritative.
            None => {
                pinned.write(&tensor.dense_bytes()?);
                Ok(())
            }
        }
    }

    /// Async host-to-device copy of `pinned` into the tensor's storage,
    /// allocating it if the tensor has none, and refresh the host mirror.
    fn h2d(&self, lane: usize, pinned: &PinnedBuffer, tensor: &Tensor) -> Result<()> {
        let ordinal = ordinal_of(tensor)?;
        let buf = match tensor.device_buf()? {
            Some(buf) if buf.len() == pinned.len => buf,
            _ => {
                let buf = Arc::new(DeviceBuffer::alloc(pinned.len, ordinal)?);
                tensor.set_device_buf(Some(Arc::clone(&buf)))?;
                buf
            }
        };
        unsafe {
            cu::memcpy_htod_async(
                buf.ptr,
                pinned.as_slice(),
                self.lanes[lane].stream.get().cu_stream(),
            )
            .map_err(cu_err)?;
        }
        tensor.copy_from_bytes(pinned.as_slice())
    }

    /// Block the worker until this lane's async copies complete.
    fn sync(&self, lane: usize) -> Result<()> {
        unsafe {
            cu::stream::synchronize(self.lanes[lane].stream.get().cu_stream() as _)
                .map_err(cu_err)
        }
    }

    fn sync_all(&self) -> Result<()> {
        for i in 0..self.lanes.len() {
            self.sync(i)?;
        }
        Ok(())
    }

    /// Record this lane's completion event on its pool stream.
    fn record_done(&self, lane: usize) -> Result<()> {
        self.lanes[lane].done.record(self.lanes[lane].stream.get())
    }

    /// Make every lane's current stream wait on its completion event.
    fn join_current_streams(&self) -> Result<()> {
        for lane in &self.lanes {
            lane.done.block_stream(&lane.state.current)?;
        }
        Ok(())
    }
}

// ── Work variants ───────────────────────────────────────────────────

pub(crate) struct CudaBroadcastWork {
    context: Arc<dyn Context>,
    inputs: Vec<Tensor>,
    root_rank: Rank,
    root_tensor: usize,
    tag: u32,
    staging: Staging,
    tmp: PinnedBuffer,
}

impl CudaBroadcastWork {
    pub(crate) fn new(
        runtime: Arc<CudaRuntime>,
        context: Arc<dyn Context>,
        inputs: Vec<Tensor>,
        root_rank: Rank,
        root_tensor: usize,
        tag: u32,
    ) -> Result<Self> {
        let staging = Staging::for_tensors(&runtime, &inputs)?;
        let mut tmp = PinnedBuffer::like(&inputs[root_tensor])?;
        if context.rank() == root_rank {
            staging.d2h(root_tensor, &inputs[root_tensor], &mut tmp)?;
        }
        Ok(Self {
            context,
            inputs,
            root_rank,
            root_tensor,
            tag,
            staging,
            tmp,
        })
    }
}

impl CollectiveWork for CudaBroadcastWork {
    fn run(&mut self) -> Result<()> {
        // Synchronize with the staging copy, if this rank made one.
        if self.context.rank() == self.root_rank {
            self.staging.sync(self.root_tensor)?;
        }
        broadcast_bytes(
            self.context.as_ref(),
            self.tmp.as_mut_slice(),
            self.root_rank,
            self.tag,
        )?;
        // Kick off copies back to the device tensors.
        for (i, t) in self.inputs.iter().enumerate() {
            self.staging.h2d(i, &self.tmp, t)?;
            self.staging.record_done(i)?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.staging.join_current_streams()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

pub(crate) struct CudaAllreduceWork {
    context: Arc<dyn Context>,
    inputs: Vec<Tensor>,
    op: ReduceOp,
    tag: u32,
    staging: Staging,
    tmp: Vec<PinnedBuffer>,
}

impl CudaAllreduceWork {
    pub(crate) fn new(
        runtime: Arc<CudaRuntime>,
        context: Arc<dyn Context>,
        inputs: Vec<Tensor>,
        op: ReduceOp,
        tag: u32,
    ) -> Result<Self> {
        let staging = Staging::for_tensors(&runtime, &inputs)?;
        let mut tmp = Vec::with_capacity(inputs.len());
        for (i, t) in inputs.iter().enumerate() {
            let mut pinned = PinnedBuffer::like(t)?;
            staging.d2h(i, t, &mut pinned)?;
            tmp.push(pinned);
        }
        Ok(Self {
            context,
            inputs,
            op,
            tag,
            staging,
            tmp,
        })
    }
}

impl CollectiveWork for CudaAllreduceWork {
    fn run(&mut self) -> Result<()> {
        self.staging.sync_all()?;

        let mut bufs: Vec<Vec<u8>> = self.tmp.iter().map(|p| p.as_slice().to_vec()).collect();
        allreduce_bytes(
            self.context.as_ref(),
            &mut bufs,
            self.inputs[0].dtype(),
            self.op,
            self.tag,
        )?;

        // Only the first buffer is authoritative; copy it back to every
        // device tensor.
        for (i, t) in self.inputs.iter().enumerate() {
            self.tmp[i].write(&bufs[0]);
            self.staging.h2d(i, &self.tmp[i], t)?;
            self.staging.record_done(i)?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.staging.join_current_streams()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

pub(crate) struct CudaSparseAllreduceWork {
    inputs: Vec<Tensor>,
    host: SparseAllreduceWork,
    staging: Staging,
    outputs: Vec<Tensor>,
}

impl CudaSparseAllreduceWork {
    pub(crate) fn new(
        runtime: Arc<CudaRuntime>,
        context: Arc<dyn Context>,
        inputs: Vec<Tensor>,
        tag: u32,
    ) -> Result<Self> {
        let staging = Staging::for_tensors(&runtime, &inputs)?;
        // Coalescing and the hop to host memory both happen off the
        // caller's stream.
        let mut tmp = Vec::with_capacity(inputs.len());
        for t in &inputs {
            let host = t.coalesce()?;
            host.set_device(DeviceKind::Cpu)?;
            tmp.push(host);
        }
        Ok(Self {
            inputs,
            host: SparseAllreduceWork::new(context, tmp, tag),
            staging,
            outputs: Vec::new(),
        })
    }
}

impl CollectiveWork for CudaSparseAllreduceWork {
    fn run(&mut self) -> Result<()> {
        self.staging.sync_all()?;

        let output = self.host.allreduce()?;

        for (i, t) in self.inputs.iter().enumerate() {
            t.assign(&output)?;
            t.set_device(DeviceKind::Cuda(self.staging.lanes[i].state.device.ordinal()))?;
            self.staging.record_done(i)?;
        }
        self.outputs = self.inputs.clone();
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.staging.join_current_streams()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.outputs.clone()
    }
}

pub(crate) struct CudaReduceWork {
    context: Arc<dyn Context>,
    inputs: Vec<Tensor>,
    root_rank: Rank,
    op: ReduceOp,
    tag: u32,
    staging: Staging,
    tmp: Vec<PinnedBuffer>,
}

impl CudaReduceWork {
    pub(crate) fn new(
        runtime: Arc<CudaRuntime>,
        context: Arc<dyn Context>,
        inputs: Vec<Tensor>,
        root_rank: Rank,
        op: ReduceOp,
        tag: u32,
    ) -> Result<Self> {
        let staging = Staging::for_tensors(&runtime, &inputs)?;
        let mut tmp = Vec::with_capacity(inputs.len());
        for (i, t) in inputs.iter().enumerate() {
            let mut pinned = PinnedBuffer::like(t)?;
            staging.d2h(i, t, &mut pinned)?;
            tmp.push(pinned);
        }
        Ok(Self {
            context,
            inputs,
            root_rank,
            op,
            tag,
            staging,
            tmp,
        })
    }
}

impl CollectiveWork for CudaReduceWork {
    fn run(&mut self) -> Result<()> {
        self.staging.sync_all()?;

        let mut buf = self.tmp[0].as_slice().to_vec();
        reduce_bytes(
            self.context.as_ref(),
            &mut buf,
            self.root_rank,
            self.inputs[0].dtype(),
            self.op,
            self.tag,
        )?;

        if self.context.rank() == self.root_rank {
            self.tmp[0].write(&buf);
        }
        for (i, t) in self.inputs.iter().enumerate() {
            self.staging.h2d(i, &self.tmp[i], t)?;
            self.staging.record_done(i)?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.staging.join_current_streams()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

pub(crate) struct CudaAllgatherWork {
    context: Arc<dyn Context>,
    outputs: Vec<Vec<Tensor>>,
    inputs: Vec<Tensor>,
    tag: u32,
    input_staging: Staging,
    output_staging: Staging,
    tmp_inputs: Vec<PinnedBuffer>,
    tmp_outputs: Vec<Vec<PinnedBuffer>>,
}

impl CudaAllgatherWork {
    pub(crate) fn new(
        runtime: Arc<CudaRuntime>,
        context: Arc<dyn Context>,
        outputs: Vec<Vec<Tensor>>,
        inputs: Vec<Tensor>,
        tag: u32,
    ) -> Result<Self> {
        let input_staging = Staging::for_tensors(&runtime, &inputs)?;
        let output_staging = Staging::for_tensor_lists(&runtime, &outputs)?;
        let mut tmp_inputs = Vec::with_capacity(inputs.len());
        for (i, t) in inputs.iter().enumerate() {
            let mut pinned = PinnedBuffer::like(t)?;
            input_staging.d2h(i, t, &mut pinned)?;
            tmp_inputs.push(pinned);
        }
        let mut tmp_outputs = Vec::with_capacity(outputs.len());
        for list in &outputs {
            let mut pinned_list = Vec::with_capacity(list.len());
            for t in list {
                pinned_list.push(PinnedBuffer::like(t)?);
            }
            tmp_outputs.push(pinned_list);
        }
        Ok(Self {
            context,
            outputs,
            inputs,
            tag,
            input_staging,
            output_staging,
            tmp_inputs,
            tmp_outputs,
        })
    }
}

impl CollectiveWork for CudaAllgatherWork {
    fn run(&mut self) -> Result<()> {
        self.input_staging.sync_all()?;
        self.output_staging.sync_all()?;

        let mut flat_in = Vec::new();
        for p in &self.tmp_inputs {
            flat_in.extend_from_slice(p.as_slice());
        }
        let mut flat_out = vec![0u8; flat_in.len() * self.context.size()];
        self.context.allgather(&flat_in, &mut flat_out, self.tag)?;

        let chunk = self.tmp_inputs[0].len;
        for (i, list) in self.outputs.iter().enumerate() {
            for (j, t) in list.iter().enumerate() {
                self.tmp_outputs[i][j].write(&flat_out[j * chunk..(j + 1) * chunk]);
                self.output_staging.h2d(i, &self.tmp_outputs[i][j], t)?;
            }
            self.output_staging.record_done(i)?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.output_staging.join_current_streams()
    }
}

pub(crate) struct CudaGatherWork {
    context: Arc<dyn Context>,
    outputs: Vec<Vec<Tensor>>,
    inputs: Vec<Tensor>,
    root: Rank,
    tag: u32,
    input_staging: Staging,
    output_staging: Staging,
    tmp_inputs: Vec<PinnedBuffer>,
    tmp_outputs: Vec<Vec<PinnedBuffer>>,
}

impl CudaGatherWork {
    pub(crate) fn new(
        runtime: Arc<CudaRuntime>,
        context: Arc<dyn Context>,
        outputs: Vec<Vec<Tensor>>,
        inputs: Vec<Tensor>,
        root: Rank,
        tag: u32,
    ) -> Result<Self> {
        let input_staging = Staging::for_tensors(&runtime, &inputs)?;
        let output_staging = Staging::for_tensor_lists(&runtime, &outputs)?;
        let mut tmp_inputs = Vec::with_capacity(inputs.len());
        for (i, t) in inputs.iter().enumerate() {
            let mut pinned = PinnedBuffer::like(t)?;
            input_staging.d2h(i, t, &mut pinned)?;
            tmp_inputs.push(pinned);
        }
        let mut tmp_outputs = Vec::with_capacity(outputs.len());
        for list in &outputs {
            let mut pinned_list = Vec::with_capacity(list.len());
            for t in list {
                pinned_list.push(PinnedBuffer::like(t)?);
            }
            tmp_outputs.push(pinned_list);
        }
        Ok(Self {
            context,
            outputs,
            inputs,
            root,
            tag,
            input_staging,
            output_staging,
            tmp_inputs,
            tmp_outputs,
        })
    }
}

impl CollectiveWork for CudaGatherWork {
    fn run(&mut self) -> Result<()> {
        self.input_staging.sync_all()?;
        self.output_staging.sync_all()?;

        let input = self.tmp_inputs[0].as_slice().to_vec();
        if self.context.rank() == self.root {
            let mut flat = vec![0u8; input.len() * self.context.size()];
            self.context
                .gather(&input, Some(&mut flat), self.root, self.tag)?;
            let chunk = input.len();
            for (j, t) in self.outputs[0].iter().enumerate() {
                self.tmp_outputs[0][j].write(&flat[j * chunk..(j + 1) * chunk]);
                self.output_staging.h2d(0, &self.tmp_outputs[0][j], t)?;
            }
            self.output_staging.record_done(0)?;
        } else {
            self.context.gather(&input, None, self.root, self.tag)?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.output_staging.join_current_streams()
    }
}

pub(crate) struct CudaScatterWork {
    context: Arc<dyn Context>,
    outputs: Vec<Tensor>,
    inputs: Vec<Vec<Tensor>>,
    root: Rank,
    tag: u32,
    input_staging: Staging,
    output_staging: Staging,
    tmp_inputs: Vec<Vec<PinnedBuffer>>,
    tmp_outputs: Vec<PinnedBuffer>,
}

impl CudaScatterWork {
    pub(crate) fn new(
        runtime: Arc<CudaRuntime>,
        context: Arc<dyn Context>,
        outputs: Vec<Tensor>,
        inputs: Vec<Vec<Tensor>>,
        root: Rank,
        tag: u32,
    ) -> Result<Self> {
        let input_staging = Staging::for_tensor_lists(&runtime, &inputs)?;
        let output_staging = Staging::for_tensors(&runtime, &outputs)?;
        let mut tmp_inputs = Vec::with_capacity(inputs.len());
        for (i, list) in inputs.iter().enumerate() {
            let mut pinned_list = Vec::with_capacity(list.len());
            for t in list {
                let mut pinned = PinnedBuffer::like(t)?;
                input_staging.d2h(i, t, &mut pinned)?;
                pinned_list.push(pinned);
            }
            tmp_inputs.push(pinned_list);
        }
        let mut tmp_outputs = Vec::with_capacity(outputs.len());
        for t in &outputs {
            tmp_outputs.push(PinnedBuffer::like(t)?);
        }
        Ok(Self {
            context,
            outputs,
            inputs,
            root,
            tag,
            input_staging,
            output_staging,
            tmp_inputs,
            tmp_outputs,
        })
    }
}

impl CollectiveWork for CudaScatterWork {
    fn run(&mut self) -> Result<()> {
        self.input_staging.sync_all()?;
        self.output_staging.sync_all()?;

        let mut out = vec![0u8; self.tmp_outputs[0].len];
        if self.context.rank() == self.root {
            let mut flat = Vec::new();
            for p in &self.tmp_inputs[0] {
                flat.extend_from_slice(p.as_slice());
            }
            self.context
                .scatter(Some(&flat), &mut out, self.root, self.tag)?;
        } else {
            self.context.scatter(None, &mut out, self.root, self.tag)?;
        }

        self.tmp_outputs[0].write(&out);
        self.output_staging.h2d(0, &self.tmp_outputs[0], &self.outputs[0])?;
        self.output_staging.record_done(0)?;
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.output_staging.join_current_streams()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.outputs.clone()
    }
}
