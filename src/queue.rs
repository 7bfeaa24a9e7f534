//! Command queues — the ordered command stream and its event edges.
//!
//! Enqueues append records to a pending list; wait edges accumulated via
//! [`CommandQueue::enqueue_wait_event`] attach to the next record, signal
//! edges to the most recent one. Flush cuts the list into *segments* at
//! wait edges and feeds a submission pump: a segment runs only when its
//! wait events are complete (the user-event gate), whole segments become
//! one native command buffer each, and a per-queue worker thread retires
//! them in FIFO order — deferred host reads, signal completion, wait-idle
//! wakeups.
//!
//! A queue is externally synchronized per the host API; the internal
//! mutex exists for the completion worker and cross-queue event
//! callbacks, not to make concurrent enqueues meaningful.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::cl::*;
use crate::context::Context;
use crate::event::Event;
use crate::geom::{Origin, Size};
use crate::kernel::Kernel;
use crate::memory::Memory;
use crate::object::{ClObject, HandleKind, ObjectBase, Ref};
#[cfg(target_os = "macos")]
use crate::reflect::ArgKind;
use crate::sampler::Sampler;

#[cfg(target_os = "macos")]
use crate::metal::compile::PipelineState;
#[cfg(target_os = "macos")]
use crate::metal::device_init::NativeQueue;
#[cfg(target_os = "macos")]
use crate::metal::encode;

/// Host pointer crossing into the completion worker.
pub struct HostPtr(pub *mut u8);

unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

/// One argument the dispatch encoder writes into the native encoder.
pub enum EncodedArg {
    /// POD bytes, packed at their reflected offsets, set via `setBytes`.
    Bytes { slot: u32, data: Vec<u8> },
    /// `None` encodes a null buffer binding.
    Buffer { slot: u32, memory: Option<Ref<Memory>> },
    Image { slot: u32, memory: Ref<Memory> },
    Sampler { slot: u32, sampler: Ref<Sampler> },
}

/// A fully resolved kernel dispatch.
pub struct DispatchCall {
    #[cfg(target_os = "macos")]
    pub pipeline: PipelineState,
    pub args: Vec<EncodedArg>,
    pub groups: Size,
    pub local: Size,
}

/// One enqueued command.
pub enum Command {
    ReadBuffer {
        src: Ref<Memory>,
        offset: usize,
        size: usize,
        dst: HostPtr,
    },
    WriteBuffer {
        dst: Ref<Memory>,
        offset: usize,
        data: Vec<u8>,
    },
    CopyBuffer {
        src: Ref<Memory>,
        src_offset: usize,
        dst: Ref<Memory>,
        dst_offset: usize,
        size: usize,
    },
    FillBuffer {
        dst: Ref<Memory>,
        offset: usize,
        size: usize,
        pattern: Vec<u8>,
    },
    ReadImage {
        src: Ref<Memory>,
        origin: Origin,
        region: Size,
        row_pitch: usize,
        slice_pitch: usize,
        dst: HostPtr,
    },
    WriteImage {
        dst: Ref<Memory>,
        origin: Origin,
        region: Size,
        row_pitch: usize,
        slice_pitch: usize,
        data: Vec<u8>,
    },
    CopyImage {
        src: Ref<Memory>,
        src_origin: Origin,
        dst: Ref<Memory>,
        dst_origin: Origin,
        region: Size,
    },
    CopyBufferToImage {
        src: Ref<Memory>,
        src_offset: usize,
        dst: Ref<Memory>,
        dst_origin: Origin,
        region: Size,
    },
    CopyImageToBuffer {
        src: Ref<Memory>,
        src_origin: Origin,
        region: Size,
        dst: Ref<Memory>,
        dst_offset: usize,
    },
    Dispatch(DispatchCall),
    Barrier,
}

struct PendingCommand {
    command: Command,
    waits: Vec<Ref<Event>>,
    signal: Option<Ref<Event>>,
}

/// A run of commands submitted as one native command buffer.
struct Segment {
    commands: Vec<Command>,
    waits: Vec<Ref<Event>>,
    signals: Vec<Ref<Event>>,
}

struct QueueState {
    pending: Vec<PendingCommand>,
    /// Wait edges awaiting the next data command.
    next_waits: Vec<Ref<Event>>,
    /// Flushed segments not yet submitted, in order.
    gated: VecDeque<Segment>,
    /// Submitted command buffers the worker has not retired.
    inflight: usize,
}

#[repr(C)]
pub struct CommandQueue {
    base: ObjectBase,
    context: Ref<Context>,
    properties: cl_command_queue_properties,
    state: Mutex<QueueState>,
    idle: Condvar,
    #[cfg(target_os = "macos")]
    native: NativeQueue,
    #[cfg(target_os = "macos")]
    worker: std::sync::mpsc::Sender<WorkerJob>,
}

#[cfg(target_os = "macos")]
struct WorkerJob {
    batch: encode::EncodedBatch,
    signals: Vec<Ref<Event>>,
    queue: Ref<CommandQueue>,
}

impl ClObject for CommandQueue {
    const KIND: HandleKind = HandleKind::CommandQueue;
    const INVALID_HANDLE: cl_int = CL_INVALID_COMMAND_QUEUE;

    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

/// Pick a workgroup shape dividing `global` whose volume fits
/// `max_total`; greedy per axis, widest first.
pub(crate) fn choose_local_size(global: &Size, max_total: usize) -> Size {
    fn largest_divisor(n: usize, cap: usize) -> usize {
        let cap = cap.min(n).max(1);
        (1..=cap).rev().find(|d| n % d == 0).unwrap_or(1)
    }

    let max_total = max_total.max(1);
    let w = largest_divisor(global.w.max(1), max_total);
    let h = largest_divisor(global.h.max(1), max_total / w);
    let d = largest_divisor(global.d.max(1), max_total / (w * h));
    Size::new(w, h, d)
}

/// Bytes a pitched region copy actually touches: full slices except the
/// last, full rows except the last, then one tight row.
pub(crate) fn pitched_copy_bytes(
    region: &Size,
    row_pitch: usize,
    slice_pitch: usize,
    element_size: usize,
) -> ClResult<usize> {
    let slices = region
        .d
        .saturating_sub(1)
        .checked_mul(slice_pitch)
        .ok_or(CL_INVALID_VALUE)?;
    let rows = region
        .h
        .saturating_sub(1)
        .checked_mul(row_pitch)
        .ok_or(CL_INVALID_VALUE)?;
    let tail = region.w.checked_mul(element_size).ok_or(CL_INVALID_VALUE)?;

    slices
        .checked_add(rows)
        .and_then(|n| n.checked_add(tail))
        .ok_or(CL_INVALID_VALUE)
}

impl CommandQueue {
    pub fn new(
        context: &Context,
        properties: cl_command_queue_properties,
    ) -> ClResult<Ref<CommandQueue>> {
        #[cfg(target_os = "macos")]
        {
            let native =
                NativeQueue::new(context.device().native()).ok_or(CL_OUT_OF_RESOURCES)?;
            let (sender, receiver) = std::sync::mpsc::channel::<WorkerJob>();

            // Detached on purpose: the worker can drop the queue's last
            // reference, and a join from its own thread would wedge.
            std::thread::spawn(move || {
                while let Ok(job) = receiver.recv() {
                    retire(job);
                }
            });

            Ok(Ref::new(CommandQueue {
                base: ObjectBase::new(HandleKind::CommandQueue),
                context: Ref::from_ref(context),
                properties,
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    next_waits: Vec::new(),
                    gated: VecDeque::new(),
                    inflight: 0,
                }),
                idle: Condvar::new(),
                native,
                worker: sender,
            }))
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (context, properties);
            Err(CL_DEVICE_NOT_AVAILABLE)
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn properties(&self) -> cl_command_queue_properties {
        self.properties
    }

    // -----------------------------------------------------------------
    // Event edges
    // -----------------------------------------------------------------

    /// Attach a wait edge to the next enqueued command.
    pub fn enqueue_wait_event(&self, event: &Event) {
        self.lock().next_waits.push(Ref::from_ref(event));
    }

    /// Attach a signal edge to the most recently enqueued command. With
    /// nothing pending (a bare marker), a barrier record carries it.
    pub fn enqueue_signal_event(&self, event: &Event) {
        let mut state = self.lock();
        match state.pending.last_mut() {
            Some(last) if last.signal.is_none() => last.signal = Some(Ref::from_ref(event)),
            _ => {
                let waits = std::mem::take(&mut state.next_waits);
                state.pending.push(PendingCommand {
                    command: Command::Barrier,
                    waits,
                    signal: Some(Ref::from_ref(event)),
                });
            }
        }
    }

    // -----------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------

    pub fn enqueue_read_buffer(
        &self,
        src: &Memory,
        offset: usize,
        size: usize,
        dst: *mut u8,
    ) -> ClResult<()> {
        check_buffer_range(src, offset, size)?;
        if dst.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        self.push(Command::ReadBuffer {
            src: Ref::from_ref(src),
            offset,
            size,
            dst: HostPtr(dst),
        });
        Ok(())
    }

    pub fn enqueue_write_buffer(
        &self,
        dst: &Memory,
        offset: usize,
        size: usize,
        src: *const u8,
    ) -> ClResult<()> {
        check_buffer_range(dst, offset, size)?;
        if src.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        // Snapshot now; the client pointer only has to live through the
        // call this way.
        let data = unsafe { std::slice::from_raw_parts(src, size) }.to_vec();
        self.push(Command::WriteBuffer {
            dst: Ref::from_ref(dst),
            offset,
            data,
        });
        Ok(())
    }

    pub fn enqueue_copy_buffer(
        &self,
        src: &Memory,
        src_offset: usize,
        dst: &Memory,
        dst_offset: usize,
        size: usize,
    ) -> ClResult<()> {
        check_buffer_range(src, src_offset, size)?;
        check_buffer_range(dst, dst_offset, size)?;
        self.push(Command::CopyBuffer {
            src: Ref::from_ref(src),
            src_offset,
            dst: Ref::from_ref(dst),
            dst_offset,
            size,
        });
        Ok(())
    }

    pub fn enqueue_fill_buffer(
        &self,
        dst: &Memory,
        pattern: &[u8],
        offset: usize,
        size: usize,
    ) -> ClResult<()> {
        check_buffer_range(dst, offset, size)?;
        if pattern.is_empty()
            || pattern.len() > 128
            || !pattern.len().is_power_of_two()
            || offset % pattern.len() != 0
            || size % pattern.len() != 0
        {
            return Err(CL_INVALID_VALUE);
        }
        self.push(Command::FillBuffer {
            dst: Ref::from_ref(dst),
            offset,
            size,
            pattern: pattern.to_vec(),
        });
        Ok(())
    }

    pub fn enqueue_read_image(
        &self,
        src: &Memory,
        origin: Origin,
        region: Size,
        row_pitch: usize,
        slice_pitch: usize,
        dst: *mut u8,
    ) -> ClResult<()> {
        if dst.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        let element = check_image_region(src, &origin, &region)?;
        let (row_pitch, slice_pitch) = resolve_pitches(&region, row_pitch, slice_pitch, element)?;
        self.push(Command::ReadImage {
            src: Ref::from_ref(src),
            origin,
            region,
            row_pitch,
            slice_pitch,
            dst: HostPtr(dst),
        });
        Ok(())
    }

    pub fn enqueue_write_image(
        &self,
        dst: &Memory,
        origin: Origin,
        region: Size,
        row_pitch: usize,
        slice_pitch: usize,
        src: *const u8,
    ) -> ClResult<()> {
        if src.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        let element = check_image_region(dst, &origin, &region)?;
        let (row_pitch, slice_pitch) = resolve_pitches(&region, row_pitch, slice_pitch, element)?;
        let len = pitched_copy_bytes(&region, row_pitch, slice_pitch, element)?;
        let data = unsafe { std::slice::from_raw_parts(src, len) }.to_vec();
        self.push(Command::WriteImage {
            dst: Ref::from_ref(dst),
            origin,
            region,
            row_pitch,
            slice_pitch,
            data,
        });
        Ok(())
    }

    pub fn enqueue_copy_image(
        &self,
        src: &Memory,
        src_origin: Origin,
        dst: &Memory,
        dst_origin: Origin,
        region: Size,
    ) -> ClResult<()> {
        let src_element = check_image_region(src, &src_origin, &region)?;
        let dst_element = check_image_region(dst, &dst_origin, &region)?;
        if src.image_format()? != dst.image_format()? {
            return Err(CL_IMAGE_FORMAT_MISMATCH);
        }
        debug_assert_eq!(src_element, dst_element);
        self.push(Command::CopyImage {
            src: Ref::from_ref(src),
            src_origin,
            dst: Ref::from_ref(dst),
            dst_origin,
            region,
        });
        Ok(())
    }

    pub fn enqueue_copy_buffer_to_image(
        &self,
        src: &Memory,
        src_offset: usize,
        dst: &Memory,
        dst_origin: Origin,
        region: Size,
    ) -> ClResult<()> {
        let element = check_image_region(dst, &dst_origin, &region)?;
        let bytes = region.total().checked_mul(element).ok_or(CL_INVALID_VALUE)?;
        check_buffer_range(src, src_offset, bytes)?;
        self.push(Command::CopyBufferToImage {
            src: Ref::from_ref(src),
            src_offset,
            dst: Ref::from_ref(dst),
            dst_origin,
            region,
        });
        Ok(())
    }

    pub fn enqueue_copy_image_to_buffer(
        &self,
        src: &Memory,
        src_origin: Origin,
        region: Size,
        dst: &Memory,
        dst_offset: usize,
    ) -> ClResult<()> {
        let element = check_image_region(src, &src_origin, &region)?;
        let bytes = region.total().checked_mul(element).ok_or(CL_INVALID_VALUE)?;
        check_buffer_range(dst, dst_offset, bytes)?;
        self.push(Command::CopyImageToBuffer {
            src: Ref::from_ref(src),
            src_origin,
            region,
            dst: Ref::from_ref(dst),
            dst_offset,
        });
        Ok(())
    }

    /// A barrier record: an encoder boundary that keeps ordering
    /// observable and gives bare markers something to signal.
    pub fn enqueue_barrier(&self) {
        self.push(Command::Barrier);
    }

    // -----------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------

    pub fn enqueue_dispatch(
        &self,
        kernel: &Kernel,
        work_dim: cl_uint,
        global_work_offset: Option<&[usize]>,
        global_work_size: &[usize],
        local_work_size: Option<&[usize]>,
    ) -> ClResult<()> {
        if work_dim == 0 || work_dim > 3 {
            return Err(CL_INVALID_WORK_DIMENSION);
        }
        if global_work_offset.is_some() {
            return Err(CL_INVALID_GLOBAL_OFFSET);
        }

        let global = Size::from_work_dims(work_dim, global_work_size);
        let local = local_work_size.map(|sizes| Size::from_work_dims(work_dim, sizes));

        let required = kernel.required_work_group_size();
        if let Some(local) = local {
            if required != Size::ZERO && required != local {
                return Err(CL_INVALID_WORK_GROUP_SIZE);
            }
            if local.total() == 0 {
                return Err(CL_INVALID_WORK_GROUP_SIZE);
            }
        }

        #[cfg(target_os = "macos")]
        {
            let local = match local {
                Some(local) => local,
                None if required != Size::ZERO => required,
                None => choose_local_size(&global, kernel.max_work_group_size()),
            };

            let pipeline = kernel.pipeline_state(&local)?;
            if local.total() > pipeline.max_total_threads
                || global.w % local.w != 0
                || global.h % local.h != 0
                || global.d % local.d != 0
            {
                return Err(CL_INVALID_WORK_GROUP_SIZE);
            }

            let groups = Size::new(
                global.w / local.w,
                global.h / local.h,
                global.d / local.d,
            );

            let args = encode_args(kernel)?;
            self.push(Command::Dispatch(DispatchCall {
                pipeline,
                args,
                groups,
                local,
            }));
            Ok(())
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = (kernel, global, local, required);
            Err(CL_DEVICE_NOT_AVAILABLE)
        }
    }

    /// Single-work-item dispatch: global = local = (1,1,1).
    pub fn enqueue_task(&self, kernel: &Kernel) -> ClResult<()> {
        self.enqueue_dispatch(kernel, 1, None, &[1], Some(&[1]))
    }

    // -----------------------------------------------------------------
    // Flush / wait-idle
    // -----------------------------------------------------------------

    /// Seal the pending batch and feed the submission pump.
    pub fn flush(&self) {
        {
            let mut state = self.lock();
            let pending = std::mem::take(&mut state.pending);
            let segments = cut_segments(pending);
            state.gated.extend(segments);
        }
        self.pump();
    }

    /// Block until every submitted batch has retired. Segments still
    /// gated on events are not submitted work and are not waited for.
    pub fn wait_idle(&self) {
        let mut state = self.lock();
        while state.inflight > 0 {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn finish(&self) {
        self.flush();
        self.wait_idle();
    }

    // -----------------------------------------------------------------
    // Submission pump
    // -----------------------------------------------------------------

    /// Submit ready head segments, fail ones whose waits errored, and
    /// park behind the first incomplete wait.
    fn pump(&self) {
        let mut failed: Vec<(Vec<Ref<Event>>, cl_int)> = Vec::new();
        let mut submitted: Vec<Ref<Event>> = Vec::new();
        let mut park_on: Option<Ref<Event>> = None;

        {
            let mut state = self.lock();
            while let Some(segment) = state.gated.pop_front() {
                match wait_edges_status(&segment.waits) {
                    WaitEdges::Errored(status) => failed.push((segment.signals, status)),
                    WaitEdges::Blocked(event) => {
                        // Not ready: put it back and let the event's
                        // completion call us again.
                        state.gated.push_front(segment);
                        park_on = Some(event);
                        break;
                    }
                    WaitEdges::Ready => {
                        #[cfg(target_os = "macos")]
                        match self.submit(segment) {
                            Ok(signals) => {
                                state.inflight += 1;
                                submitted.extend(signals);
                            }
                            Err((signals, status)) => failed.push((signals, status)),
                        }
                        #[cfg(not(target_os = "macos"))]
                        failed.push((segment.signals, CL_DEVICE_NOT_AVAILABLE));
                    }
                }
            }
        }

        // Status changes run client callbacks; never under the lock.
        for event in submitted {
            event.set_status(CL_SUBMITTED);
        }
        for (signals, status) in failed {
            for event in signals {
                event.set_status(status);
            }
        }
        if let Some(event) = park_on {
            let queue = Ref::from_ref(self);
            event.set_callback(CL_COMPLETE, Box::new(move |_| queue.pump()));
        }
    }

    /// Encode one segment, commit it and hand it to the worker.
    #[cfg(target_os = "macos")]
    fn submit(
        &self,
        segment: Segment,
    ) -> Result<Vec<Ref<Event>>, (Vec<Ref<Event>>, cl_int)> {
        let device = self.context.device().native();
        let batch = match encode::encode(device, &self.native, &segment.commands) {
            Ok(batch) => batch,
            Err(status) => return Err((segment.signals, status)),
        };

        log::debug!(
            "submitting segment: {} command(s), {} signal(s)",
            segment.commands.len(),
            segment.signals.len()
        );
        batch.commit();

        let job = WorkerJob {
            batch,
            signals: segment.signals.clone(),
            queue: Ref::from_ref(self),
        };
        if self.worker.send(job).is_err() {
            return Err((segment.signals, CL_OUT_OF_RESOURCES));
        }

        Ok(segment.signals)
    }

    #[cfg(target_os = "macos")]
    fn retire_one(&self) {
        let mut state = self.lock();
        state.inflight -= 1;
        if state.inflight == 0 {
            self.idle.notify_all();
        }
    }

    fn push(&self, command: Command) {
        let mut state = self.lock();
        let waits = std::mem::take(&mut state.next_waits);
        state.pending.push(PendingCommand {
            command,
            waits,
            signal: None,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Worker-side retirement of one submitted command buffer.
#[cfg(target_os = "macos")]
fn retire(job: WorkerJob) {
    for event in &job.signals {
        event.set_status(CL_RUNNING);
    }

    let failed = job.batch.wait_until_completed();

    let status = if failed {
        CL_OUT_OF_RESOURCES
    } else {
        job.batch.perform_deferred_reads();
        CL_COMPLETE
    };
    for event in &job.signals {
        event.set_status(status);
    }

    job.queue.retire_one();
}

enum WaitEdges {
    Ready,
    Blocked(Ref<Event>),
    Errored(cl_int),
}

/// Classify a segment's wait edges: the first errored event poisons it,
/// the first incomplete event blocks it, otherwise it may run.
fn wait_edges_status(waits: &[Ref<Event>]) -> WaitEdges {
    for event in waits {
        let status = event.status();
        if status < CL_COMPLETE {
            return WaitEdges::Errored(status);
        }
        if status > CL_COMPLETE {
            return WaitEdges::Blocked(event.clone());
        }
    }
    WaitEdges::Ready
}

/// Cut the pending list into segments at wait edges.
fn cut_segments(pending: Vec<PendingCommand>) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();

    for record in pending {
        let starts_new = !record.waits.is_empty() || segments.is_empty();
        if starts_new {
            segments.push(Segment {
                commands: Vec::new(),
                waits: record.waits,
                signals: Vec::new(),
            });
        }

        if let Some(segment) = segments.last_mut() {
            segment.commands.push(record.command);
            if let Some(signal) = record.signal {
                segment.signals.push(signal);
            }
        }
    }

    segments
}

// Ranges come straight off the C ABI; sums near usize::MAX must fail
// the bounds check, not wrap past it into the native encoder.
fn check_buffer_range(memory: &Memory, offset: usize, size: usize) -> ClResult<()> {
    if !memory.is_buffer() {
        return Err(CL_INVALID_MEM_OBJECT);
    }
    let end = offset.checked_add(size).ok_or(CL_INVALID_VALUE)?;
    if size == 0 || end > memory.size() {
        return Err(CL_INVALID_VALUE);
    }
    Ok(())
}

/// Validate an image region and return the element size.
fn check_image_region(memory: &Memory, origin: &Origin, region: &Size) -> ClResult<usize> {
    let extent = memory.image_extent()?;
    if memory.mem_type() == CL_MEM_OBJECT_IMAGE2D && (origin.z != 0 || region.d != 1) {
        return Err(CL_INVALID_VALUE);
    }

    let end_x = origin.x.checked_add(region.w).ok_or(CL_INVALID_VALUE)?;
    let end_y = origin.y.checked_add(region.h).ok_or(CL_INVALID_VALUE)?;
    let end_z = origin.z.checked_add(region.d).ok_or(CL_INVALID_VALUE)?;
    if end_x > extent.w || end_y > extent.h || end_z > extent.d {
        return Err(CL_INVALID_VALUE);
    }
    if region.total() == 0 {
        return Err(CL_INVALID_VALUE);
    }

    memory.image_element_size()
}

/// Resolve client pitches: zero means tightly packed, nonzero must hold
/// at least a tight row/slice.
fn resolve_pitches(
    region: &Size,
    row_pitch: usize,
    slice_pitch: usize,
    element_size: usize,
) -> ClResult<(usize, usize)> {
    let tight_row = region.w.checked_mul(element_size).ok_or(CL_INVALID_VALUE)?;
    let row_pitch = if row_pitch == 0 { tight_row } else { row_pitch };
    if row_pitch < tight_row {
        return Err(CL_INVALID_VALUE);
    }

    let tight_slice = row_pitch.checked_mul(region.h).ok_or(CL_INVALID_VALUE)?;
    let slice_pitch = if slice_pitch == 0 { tight_slice } else { slice_pitch };
    if slice_pitch < tight_slice {
        return Err(CL_INVALID_VALUE);
    }

    Ok((row_pitch, slice_pitch))
}

/// Resolve the kernel's argument table into encoder writes. POD
/// arguments cluster into one blob per slot at their reflected offsets.
#[cfg(target_os = "macos")]
fn encode_args(kernel: &Kernel) -> ClResult<Vec<EncodedArg>> {
    use std::collections::BTreeMap;

    let mut pods: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut out: Vec<EncodedArg> = Vec::new();

    for arg in kernel.args_snapshot() {
        match arg.binding.kind {
            ArgKind::Pod | ArgKind::PodUbo | ArgKind::PodPushConstant => {
                if arg.bytes.is_empty() {
                    return Err(CL_INVALID_KERNEL_ARGS);
                }
                let offset = arg.binding.offset as usize;
                let declared = arg.binding.size as usize;
                let blob = pods.entry(arg.binding.index).or_default();
                if blob.len() < offset + declared {
                    blob.resize(offset + declared, 0);
                }
                let n = arg.bytes.len().min(declared);
                blob[offset..offset + n].copy_from_slice(&arg.bytes[..n]);
            }
            ArgKind::Buffer | ArgKind::BufferUbo => {
                let memory = match handle_word(&arg)? {
                    0 => None,
                    word => Some(
                        Ref::from_handle(word as *const Memory)
                            .map_err(|_| CL_INVALID_KERNEL_ARGS)?,
                    ),
                };
                if let Some(memory) = &memory {
                    if !memory.is_buffer() {
                        return Err(CL_INVALID_KERNEL_ARGS);
                    }
                }
                out.push(EncodedArg::Buffer {
                    slot: arg.binding.index,
                    memory,
                });
            }
            ArgKind::SampledImage | ArgKind::StorageImage => {
                let word = handle_word(&arg)?;
                let memory = Ref::from_handle(word as *const Memory)
                    .map_err(|_| CL_INVALID_KERNEL_ARGS)?;
                if !memory.is_image() {
                    return Err(CL_INVALID_KERNEL_ARGS);
                }
                out.push(EncodedArg::Image {
                    slot: arg.binding.index,
                    memory,
                });
            }
            ArgKind::Sampler => {
                let word = handle_word(&arg)?;
                let sampler = Ref::from_handle(word as *const Sampler)
                    .map_err(|_| CL_INVALID_KERNEL_ARGS)?;
                out.push(EncodedArg::Sampler {
                    slot: arg.binding.index,
                    sampler,
                });
            }
            ArgKind::Local => {
                // Realized as a specialization define at pipeline lookup.
            }
        }
    }

    for (slot, data) in pods {
        out.push(EncodedArg::Bytes { slot, data });
    }

    Ok(out)
}

/// A buffer/image/sampler slot stores the raw handle word.
#[cfg(target_os = "macos")]
fn handle_word(arg: &crate::kernel::ArgSnapshot) -> ClResult<usize> {
    let bytes: [u8; std::mem::size_of::<usize>()] = arg
        .bytes
        .as_slice()
        .try_into()
        .map_err(|_| CL_INVALID_KERNEL_ARGS)?;
    Ok(usize::from_ne_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_local_divides_global() {
        let cases = [
            (Size::new(1024, 1, 1), 256),
            (Size::new(1000, 1, 1), 256),
            (Size::new(7, 13, 1), 64),
            (Size::new(256, 256, 4), 1024),
            (Size::new(1, 1, 1), 1024),
        ];
        for (global, max_total) in cases {
            let local = choose_local_size(&global, max_total);
            assert_eq!(global.w % local.w, 0, "global {:?}", global);
            assert_eq!(global.h % local.h, 0, "global {:?}", global);
            assert_eq!(global.d % local.d, 0, "global {:?}", global);
            assert!(local.total() <= max_total, "global {:?}", global);
            assert!(local.total() >= 1);
        }
    }

    #[test]
    fn test_choose_local_prefers_wide_groups() {
        let local = choose_local_size(&Size::new(1024, 1, 1), 256);
        assert_eq!(local, Size::new(256, 1, 1));
    }

    #[test]
    fn test_pitched_copy_bytes() {
        // Tight 2D region: 4x4 pixels of 4 bytes.
        let region = Size::new(4, 4, 1);
        assert_eq!(pitched_copy_bytes(&region, 16, 64, 4), Ok(64));

        // Padded rows read less than rows * pitch.
        assert_eq!(pitched_copy_bytes(&region, 32, 128, 4), Ok(3 * 32 + 16));

        // 3D: two slices.
        let region = Size::new(4, 4, 2);
        assert_eq!(pitched_copy_bytes(&region, 16, 64, 4), Ok(64 + 3 * 16 + 16));
    }

    #[test]
    fn test_pitched_copy_bytes_rejects_overflow() {
        let region = Size::new(4, 4, 2);
        assert_eq!(
            pitched_copy_bytes(&region, 16, usize::MAX, 4).err(),
            Some(CL_INVALID_VALUE)
        );
        assert_eq!(
            pitched_copy_bytes(&Size::new(usize::MAX, 1, 1), 0, 0, 4).err(),
            Some(CL_INVALID_VALUE)
        );
    }

    #[test]
    fn test_resolve_pitches() {
        let region = Size::new(8, 8, 1);
        assert_eq!(resolve_pitches(&region, 0, 0, 4), Ok((32, 256)));
        assert_eq!(resolve_pitches(&region, 64, 0, 4), Ok((64, 512)));
        assert_eq!(resolve_pitches(&region, 64, 1024, 4), Ok((64, 1024)));
    }

    #[test]
    fn test_resolve_pitches_rejects_undersized_and_overflowing() {
        let region = Size::new(8, 8, 1);
        // A nonzero pitch below one tight row or slice cannot be real.
        assert_eq!(resolve_pitches(&region, 16, 0, 4).err(), Some(CL_INVALID_VALUE));
        assert_eq!(resolve_pitches(&region, 32, 64, 4).err(), Some(CL_INVALID_VALUE));
        assert_eq!(
            resolve_pitches(&Size::new(usize::MAX, 2, 1), 0, 0, 4).err(),
            Some(CL_INVALID_VALUE)
        );
    }
}
