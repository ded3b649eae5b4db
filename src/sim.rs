//! An in-process software device.
//!
//! `SimDevice` implements [`Device`] with host memory standing in for VRAM
//! and GTT, a bump allocator for the GPU VA space, and the packet engines of
//! [`crate::engine`] executing submitted IBs. Queues are per (context, IP,
//! instance, ring); jobs retire in FIFO order and honour their fence
//! dependencies. A job that faults or hangs, or that stalls on a wait for
//! longer than the lockup timeout, triggers a reset: the reset counter
//! moves, the offending context turns guilty and its pending fences are
//! canceled.
//!
//! Every call is logged, and failures can be injected per call kind so the
//! unwinding paths of the callers can be checked.

use std::alloc::{self, Layout};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::bit::align_up;
use crate::config::{SchedPolicy, SimConfig};
use crate::device::*;
use crate::engine::{self, Cursor, EngineEnv, EngineKind, Outcome, RegisterFile};
use crate::error::{Error, Result};
use crate::family::asic_is_gfx_pipe_removed;
use crate::gcn::{GpuMemory, Isa, MemFault};
use crate::ip_block::IpType;

/// Granule of BO backing stores and VA reservations.
pub const SIM_PAGE_SIZE: u64 = 0x10000;
const VA_BASE: u64 = 1 << 32;
const VA_MAX: u64 = 1 << 47;
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_DEPENDENCY_DEPTH: u32 = 16;

/// Device entry points, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCall {
    QueryGpuInfo,
    QueryHwIpInfo,
    CtxCreate,
    CtxFree,
    QueryResetState,
    BoAlloc,
    BoFree,
    BoCpuMap,
    BoCpuUnmap,
    VaRangeAlloc,
    VaRangeFree,
    VaMap,
    VaUnmap,
    BoListCreate,
    BoListDestroy,
    CsSubmit,
    QueryFence,
    WaitFences,
}

/// Zeroed, page-aligned host memory backing one BO.
struct BoMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is plain memory with no thread affinity. Accesses
// from the engines are serialised by the device lock; CPU mappings follow
// the same rules as a real BO mapping.
unsafe impl Send for BoMemory {}
unsafe impl Sync for BoMemory {}

impl BoMemory {
    fn new(len: u64) -> Option<Self> {
        let layout = Layout::from_size_align(usize::try_from(len).ok()?, SIM_PAGE_SIZE as usize).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| BoMemory { ptr, layout })
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len());
        // SAFETY: the range is inside the allocation (checked by the caller).
        unsafe {
            let src = self.ptr.as_ptr().add(offset);
            if out.len() == 4 && offset % 4 == 0 {
                // polled dwords may be written by another thread
                let value = ptr::read_volatile(src as *const u32);
                out.copy_from_slice(&value.to_ne_bytes());
            } else {
                ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
            }
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len());
        // SAFETY: as for `read`.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len()) }
    }
}

impl Drop for BoMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heap {
    Vram,
    Gtt,
}

struct Bo {
    memory: Arc<BoMemory>,
    heap: Heap,
    flags: GemCreateFlags,
    cpu_maps: u32,
    va_maps: u32,
}

#[derive(Debug, Clone, Copy)]
struct VaRange {
    start: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct VaMapping {
    bo: BoHandle,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Context {
    /// Device reset counter at creation or at the last reset query.
    reset_counter: u32,
    guilty: bool,
    hangs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct QueueKey {
    ctx: ContextHandle,
    ip: IpType,
    instance: u32,
    ring: u32,
}

impl QueueKey {
    fn of(fence: &CsFence) -> Self {
        QueueKey {
            ctx: fence.context,
            ip: fence.ip_type,
            instance: fence.ip_instance,
            ring: fence.ring,
        }
    }
}

struct Job {
    seq: u64,
    /// CE IBs first, then the rest in submission order.
    ibs: Vec<IbInfo>,
    deps: Vec<CsFence>,
    resident: Option<HashSet<BoHandle>>,
    cursor: Cursor,
    stalled_since: Option<Instant>,
}

struct Queue {
    kind: EngineKind,
    last_seq: u64,
    /// Every sequence number up to here has retired or been canceled.
    done_upto: u64,
    canceled: BTreeSet<u64>,
    pending: VecDeque<Job>,
    regs: RegisterFile,
}

impl Queue {
    fn new(kind: EngineKind) -> Self {
        Queue {
            kind,
            last_seq: 0,
            done_upto: 0,
            canceled: BTreeSet::new(),
            pending: VecDeque::new(),
            regs: RegisterFile::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Canceled,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadResult {
    Idle,
    Retired,
    Stalled,
    Hung,
}

#[derive(Debug, Clone, Copy)]
struct Injection {
    call: SimCall,
    remaining: u32,
    errno: Errno,
}

#[derive(Default)]
struct SimState {
    next_handle: u32,
    next_va: u64,
    bos: HashMap<BoHandle, Bo>,
    va_ranges: HashMap<VaHandle, VaRange>,
    mappings: BTreeMap<u64, VaMapping>,
    lists: HashMap<BoListHandle, Vec<BoHandle>>,
    contexts: HashMap<ContextHandle, Context>,
    queues: BTreeMap<QueueKey, Queue>,
    reset_counter: u32,
    vram_used: u64,
    gtt_used: u64,
    calls: Vec<SimCall>,
    injections: Vec<Injection>,
}

impl SimState {
    /// Logs `call` and fires a pending injected failure for it.
    fn enter(&mut self, call: SimCall, op: &'static str) -> Result<()> {
        self.calls.push(call);
        if let Some(i) = self.injections.iter().position(|inj| inj.call == call) {
            self.injections[i].remaining -= 1;
            if self.injections[i].remaining == 0 {
                let errno = self.injections.remove(i).errno;
                debug!(?call, %errno, "injected failure");
                return Err(Error::kernel(op, errno));
            }
        }
        Ok(())
    }

    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn dependency_pending(&self, dep: &CsFence) -> bool {
        self.queues
            .get(&QueueKey::of(dep))
            .map_or(false, |q| dep.fence > q.done_upto)
    }
}

/// GPU virtual memory as the engines see it while a job runs.
struct GpuView<'a> {
    bos: &'a HashMap<BoHandle, Bo>,
    mappings: &'a BTreeMap<u64, VaMapping>,
    resident: Option<&'a HashSet<BoHandle>>,
}

impl GpuView<'_> {
    fn resolve(&self, addr: u64, len: usize) -> std::result::Result<(&BoMemory, usize), MemFault> {
        let fault = MemFault { addr };
        let (&start, mapping) = self.mappings.range(..=addr).next_back().ok_or(fault)?;
        let end = addr.checked_add(len as u64).ok_or(fault)?;
        if end > start + mapping.size {
            return Err(fault);
        }
        if self.resident.map_or(false, |r| !r.contains(&mapping.bo)) {
            return Err(fault);
        }
        let bo = self.bos.get(&mapping.bo).ok_or(fault)?;
        let offset = (mapping.offset + addr - start) as usize;
        if offset + len > bo.memory.len() {
            return Err(fault);
        }
        Ok((&bo.memory, offset))
    }
}

impl GpuMemory for GpuView<'_> {
    fn read(&mut self, addr: u64, out: &mut [u8]) -> std::result::Result<(), MemFault> {
        let (memory, offset) = self.resolve(addr, out.len())?;
        memory.read(offset, out);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> std::result::Result<(), MemFault> {
        let (memory, offset) = self.resolve(addr, data.len())?;
        memory.write(offset, data);
        Ok(())
    }
}

fn kernel_err<T>(op: &'static str, errno: Errno) -> Result<T> {
    Err(Error::kernel(op, errno))
}

pub struct SimDevice {
    id: DeviceId,
    config: SimConfig,
    info: GpuInfo,
    env: EngineEnv,
    state: Mutex<SimState>,
    /// Signalled whenever a job retires or a reset happens.
    progress: Condvar,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        let ident = config.chip.identity();
        let info = GpuInfo {
            asic_id: ident.asic_id,
            chip_rev: ident.chip_rev,
            chip_external_rev: ident.chip_external_rev,
            family_id: ident.family_id,
            ids_flags: ident.ids_flags,
            num_shader_engines: 4,
            cu_active_number: 64,
            virtual_address_offset: VA_BASE,
            virtual_address_max: VA_MAX,
            virtual_address_alignment: SIM_PAGE_SIZE as u32,
        };
        let env = EngineEnv {
            family_id: ident.family_id,
            isa: Isa::from_version(ident.gfx_version.0),
            instruction_budget: config.instruction_budget,
            progress: config.progress,
        };
        info!(chip = %config.chip, policy = ?config.sched_policy, "software device created");
        SimDevice {
            id: DeviceId::next(),
            config,
            info,
            env,
            state: Mutex::new(SimState {
                next_va: VA_BASE,
                ..Default::default()
            }),
            progress: Condvar::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call made so far, failed ones included.
    pub fn call_log(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn clear_call_log(&self) {
        self.lock().calls.clear();
    }

    /// Makes the `nth` (1-based, counted from now) call of kind `call` fail
    /// with `errno`.
    pub fn inject_failure(&self, call: SimCall, nth: u32, errno: Errno) {
        self.lock().injections.push(Injection {
            call,
            remaining: nth.max(1),
            errno,
        });
    }

    pub fn live_bo_count(&self) -> usize {
        self.lock().bos.len()
    }

    pub fn live_va_count(&self) -> usize {
        self.lock().va_ranges.len()
    }

    pub fn reset_count(&self) -> u32 {
        self.lock().reset_counter
    }

    /// Unfinished jobs across all queues.
    pub fn pending_jobs(&self) -> usize {
        self.lock().queues.values().map(|q| q.pending.len()).sum()
    }

    fn hw_ip(&self, ip: IpType) -> HwIpInfo {
        let ident = self.config.chip.identity();
        let ((major, minor), available_rings) = match ip {
            IpType::Gfx => {
                let removed = asic_is_gfx_pipe_removed(ident.family_id, ident.chip_external_rev, ident.chip_rev);
                (ident.gfx_version, if removed { 0 } else { 0b1 })
            }
            IpType::Compute => (ident.gfx_version, 0b1111),
            IpType::Dma => (ident.sdma_version, 0b11),
            IpType::Uvd | IpType::Vce => ((0, 0), 0),
        };
        HwIpInfo {
            hw_ip_version_major: major,
            hw_ip_version_minor: minor,
            capabilities_flags: 0,
            ib_start_alignment: 32,
            ib_size_alignment: 32,
            available_rings,
        }
    }

    fn fence_state(&self, st: &SimState, fence: &CsFence, op: &'static str) -> Result<FenceState> {
        if !st.contexts.contains_key(&fence.context) {
            return kernel_err(op, Errno::EINVAL);
        }
        let queue = match st.queues.get(&QueueKey::of(fence)) {
            Some(q) if fence.fence <= q.last_seq => q,
            _ => return kernel_err(op, Errno::EINVAL),
        };
        Ok(if fence.fence > queue.done_upto {
            FenceState::Pending
        } else if queue.canceled.contains(&fence.fence) {
            FenceState::Canceled
        } else {
            FenceState::Signaled
        })
    }

    /// Runs the head job of `key` once.
    fn run_head(&self, st: &mut SimState, key: QueueKey) -> HeadResult {
        let (outcome, seq) = {
            let SimState {
                queues, bos, mappings, ..
            } = &mut *st;
            let Some(queue) = queues.get_mut(&key) else {
                return HeadResult::Idle;
            };
            let Queue {
                kind, pending, regs, ..
            } = queue;
            let Some(job) = pending.front_mut() else {
                return HeadResult::Idle;
            };
            let mut view = GpuView {
                bos,
                mappings,
                resident: job.resident.as_ref(),
            };
            let outcome = engine::execute(*kind, &mut view, regs, &job.ibs, &mut job.cursor, &self.env);
            (outcome, job.seq)
        };

        match outcome {
            Outcome::Retired => {
                if let Some(queue) = st.queues.get_mut(&key) {
                    queue.pending.pop_front();
                    queue.done_upto = seq;
                }
                debug!(ctx = key.ctx.0, ip = ?key.ip, ring = key.ring, seq, "job retired");
                self.progress.notify_all();
                HeadResult::Retired
            }
            Outcome::Stalled => {
                if let Some(job) = st.queues.get_mut(&key).and_then(|q| q.pending.front_mut()) {
                    if job.stalled_since.is_none() {
                        debug!(ctx = key.ctx.0, ip = ?key.ip, ring = key.ring, seq, "job stalled");
                        job.stalled_since = Some(Instant::now());
                    }
                }
                HeadResult::Stalled
            }
            Outcome::Hung(hang) => {
                warn!(ctx = key.ctx.0, ip = ?key.ip, ring = key.ring, seq, cause = %hang, "job hung");
                self.reset(st, key.ctx);
                HeadResult::Hung
            }
        }
    }

    /// Runs jobs of `key` until `target` has retired or the queue cannot
    /// make progress. Dependencies on other queues are driven first.
    fn drive(&self, st: &mut SimState, key: QueueKey, target: u64, depth: u32) {
        loop {
            let deps = match st.queues.get(&key) {
                Some(q) if q.done_upto < target => match q.pending.front() {
                    Some(job) => job.deps.clone(),
                    None => return,
                },
                _ => return,
            };
            for dep in &deps {
                if st.dependency_pending(dep) && depth < MAX_DEPENDENCY_DEPTH {
                    self.drive(st, QueueKey::of(dep), dep.fence, depth + 1);
                }
                if st.dependency_pending(dep) {
                    return;
                }
            }
            match self.run_head(st, key) {
                HeadResult::Retired | HeadResult::Hung => continue,
                HeadResult::Stalled | HeadResult::Idle => return,
            }
        }
    }

    /// Background progress: retries stalled jobs (and under the immediate
    /// policy everything runnable), then resets rings stuck past the
    /// lockup timeout.
    fn pump(&self, st: &mut SimState) {
        let runnable: Vec<(QueueKey, u64)> = st
            .queues
            .iter()
            .filter_map(|(key, q)| {
                let head = q.pending.front()?;
                match self.config.sched_policy {
                    SchedPolicy::Immediate => Some((*key, u64::MAX)),
                    SchedPolicy::OnWait => head.stalled_since.map(|_| (*key, head.seq)),
                }
            })
            .collect();
        for (key, target) in runnable {
            self.drive(st, key, target, 0);
        }
        self.check_lockups(st);
    }

    fn check_lockups(&self, st: &mut SimState) {
        let now = Instant::now();
        let stuck: Vec<QueueKey> = st
            .queues
            .iter()
            .filter(|(_, q)| {
                q.pending
                    .front()
                    .and_then(|job| job.stalled_since)
                    .map_or(false, |since| now.duration_since(since) >= self.config.lockup_timeout)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stuck {
            // an earlier reset in this loop may already have drained it
            if st.queues.get(&key).map_or(true, |q| q.pending.is_empty()) {
                continue;
            }
            warn!(
                ctx = key.ctx.0,
                ip = ?key.ip,
                ring = key.ring,
                timeout_ms = self.config.lockup_timeout.as_millis() as u64,
                "ring lockup"
            );
            self.reset(st, key.ctx);
        }
    }

    fn reset(&self, st: &mut SimState, guilty: ContextHandle) {
        st.reset_counter += 1;
        if let Some(ctx) = st.contexts.get_mut(&guilty) {
            ctx.guilty = true;
            ctx.hangs += 1;
        }
        let mut canceled = 0;
        for (_, queue) in st.queues.iter_mut().filter(|(key, _)| key.ctx == guilty) {
            for job in queue.pending.drain(..) {
                queue.canceled.insert(job.seq);
                canceled += 1;
            }
            queue.done_upto = queue.last_seq;
        }
        warn!(ctx = guilty.0, resets = st.reset_counter, canceled, "gpu reset");
        self.progress.notify_all();
    }

    /// Pumps the device and re-evaluates `poll` until it yields a value or
    /// `timeout` passes. The lock is released between rounds.
    fn wait_until<T, F>(
        &self,
        mut st: MutexGuard<'_, SimState>,
        timeout: Timeout,
        mut poll: F,
    ) -> Result<Option<T>>
    where
        F: FnMut(&mut SimState) -> Result<Option<T>>,
    {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Relative(d) => Instant::now().checked_add(d),
        };
        loop {
            self.pump(&mut st);
            if let Some(value) = poll(&mut st)? {
                return Ok(Some(value));
            }
            let now = Instant::now();
            let nap = match deadline {
                Some(d) if now >= d => return Ok(None),
                Some(d) => (d - now).min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };
            st = self
                .progress
                .wait_timeout(st, nap)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn poll_fence(&self, st: &mut SimState, fence: &CsFence, op: &'static str) -> Result<FenceState> {
        self.drive(st, QueueKey::of(fence), fence.fence, 0);
        self.fence_state(st, fence, op)
    }
}

impl Device for SimDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn query_gpu_info(&self) -> Result<GpuInfo> {
        self.lock().enter(SimCall::QueryGpuInfo, "query_gpu_info")?;
        Ok(self.info)
    }

    fn query_hw_ip_info(&self, ip: IpType, instance: u32) -> Result<HwIpInfo> {
        self.lock().enter(SimCall::QueryHwIpInfo, "query_hw_ip_info")?;
        if instance != 0 {
            return kernel_err("query_hw_ip_info", Errno::EINVAL);
        }
        Ok(self.hw_ip(ip))
    }

    fn cs_ctx_create(&self) -> Result<ContextHandle> {
        let mut st = self.lock();
        st.enter(SimCall::CtxCreate, "cs_ctx_create")?;
        let ctx = ContextHandle(st.handle());
        let reset_counter = st.reset_counter;
        st.contexts.insert(
            ctx,
            Context {
                reset_counter,
                guilty: false,
                hangs: 0,
            },
        );
        Ok(ctx)
    }

    fn cs_ctx_free(&self, ctx: ContextHandle) -> Result<()> {
        let mut st = self.lock();
        st.enter(SimCall::CtxFree, "cs_ctx_free")?;
        if st.contexts.remove(&ctx).is_none() {
            return kernel_err("cs_ctx_free", Errno::EINVAL);
        }
        let before = st.queues.len();
        st.queues.retain(|key, _| key.ctx != ctx);
        debug!(ctx = ctx.0, queues = before - st.queues.len(), "context freed");
        Ok(())
    }

    fn cs_query_reset_state(&self, ctx: ContextHandle) -> Result<(ResetStatus, u32)> {
        let mut st = self.lock();
        st.enter(SimCall::QueryResetState, "cs_query_reset_state")?;
        self.pump(&mut st);
        let counter = st.reset_counter;
        let Some(context) = st.contexts.get_mut(&ctx) else {
            return kernel_err("cs_query_reset_state", Errno::EINVAL);
        };
        let status = if context.reset_counter == counter {
            ResetStatus::NoReset
        } else {
            context.reset_counter = counter;
            ResetStatus::UnknownReset
        };
        Ok((status, context.hangs))
    }

    fn bo_alloc(&self, req: &BoAllocRequest) -> Result<BoHandle> {
        const OP: &str = "bo_alloc";
        let mut st = self.lock();
        st.enter(SimCall::BoAlloc, OP)?;
        if req.alloc_size == 0 {
            return kernel_err(OP, Errno::EINVAL);
        }
        let heap = if req.preferred_heap.contains(GemDomain::VRAM) {
            Heap::Vram
        } else if req.preferred_heap.intersects(GemDomain::GTT | GemDomain::CPU) {
            Heap::Gtt
        } else {
            return kernel_err(OP, Errno::EINVAL);
        };
        if req.flags.contains(GemCreateFlags::ENCRYPTED) && !self.info.is_tmz_supported() {
            return kernel_err(OP, Errno::EINVAL);
        }
        let len = align_up(req.alloc_size, SIM_PAGE_SIZE);
        let (used, budget) = match heap {
            Heap::Vram => (st.vram_used, self.config.vram_budget),
            Heap::Gtt => (st.gtt_used, self.config.gtt_budget),
        };
        if used + len > budget {
            debug!(?heap, used, len, budget, "heap exhausted");
            return kernel_err(OP, Errno::ENOMEM);
        }
        let memory = BoMemory::new(len).ok_or(Error::kernel(OP, Errno::ENOMEM))?;
        match heap {
            Heap::Vram => st.vram_used += len,
            Heap::Gtt => st.gtt_used += len,
        }
        let bo = BoHandle(st.handle());
        st.bos.insert(
            bo,
            Bo {
                memory: Arc::new(memory),
                heap,
                flags: req.flags,
                cpu_maps: 0,
                va_maps: 0,
            },
        );
        debug!(?bo, size = req.alloc_size, ?heap, "bo allocated");
        Ok(bo)
    }

    fn bo_free(&self, bo: BoHandle) -> Result<()> {
        const OP: &str = "bo_free";
        let mut st = self.lock();
        st.enter(SimCall::BoFree, OP)?;
        let Some(entry) = st.bos.get(&bo) else {
            return kernel_err(OP, Errno::ENOENT);
        };
        if entry.cpu_maps > 0 || entry.va_maps > 0 {
            warn!(?bo, cpu_maps = entry.cpu_maps, va_maps = entry.va_maps, "bo freed while mapped");
            return kernel_err(OP, Errno::EBUSY);
        }
        if let Some(entry) = st.bos.remove(&bo) {
            let len = entry.memory.len() as u64;
            match entry.heap {
                Heap::Vram => st.vram_used -= len,
                Heap::Gtt => st.gtt_used -= len,
            }
        }
        Ok(())
    }

    fn bo_cpu_map(&self, bo: BoHandle) -> Result<CpuMapping> {
        const OP: &str = "bo_cpu_map";
        let mut st = self.lock();
        st.enter(SimCall::BoCpuMap, OP)?;
        let Some(entry) = st.bos.get_mut(&bo) else {
            return kernel_err(OP, Errno::ENOENT);
        };
        if entry.flags.contains(GemCreateFlags::NO_CPU_ACCESS) {
            return kernel_err(OP, Errno::EPERM);
        }
        entry.cpu_maps += 1;
        let memory = entry.memory.clone();
        let ptr = memory.ptr;
        let len = memory.len();
        let owner: Arc<dyn Any + Send + Sync> = memory;
        // SAFETY: the allocation is page aligned, `len` bytes long and kept
        // alive by `owner`.
        Ok(unsafe { CpuMapping::from_raw(ptr, len, Some(owner)) })
    }

    fn bo_cpu_unmap(&self, bo: BoHandle, mapping: CpuMapping) -> Result<()> {
        const OP: &str = "bo_cpu_unmap";
        let mut st = self.lock();
        st.enter(SimCall::BoCpuUnmap, OP)?;
        let Some(entry) = st.bos.get_mut(&bo) else {
            return kernel_err(OP, Errno::ENOENT);
        };
        if entry.cpu_maps == 0 || mapping.as_ptr() != entry.memory.ptr.as_ptr() {
            return kernel_err(OP, Errno::EINVAL);
        }
        entry.cpu_maps -= 1;
        drop(mapping);
        Ok(())
    }

    fn va_range_alloc(&self, size: u64, alignment: u64) -> Result<(u64, VaHandle)> {
        const OP: &str = "va_range_alloc";
        let mut st = self.lock();
        st.enter(SimCall::VaRangeAlloc, OP)?;
        if size == 0 {
            return kernel_err(OP, Errno::EINVAL);
        }
        let align = alignment.max(SIM_PAGE_SIZE).next_power_of_two();
        let start = align_up(st.next_va, align);
        let reserved = align_up(size, SIM_PAGE_SIZE);
        match start.checked_add(reserved) {
            Some(end) if end <= VA_MAX => st.next_va = end,
            _ => return kernel_err(OP, Errno::ENOMEM),
        }
        let va = VaHandle(st.handle() as u64);
        st.va_ranges.insert(va, VaRange { start, size: reserved });
        Ok((start, va))
    }

    fn va_range_free(&self, va: VaHandle) -> Result<()> {
        const OP: &str = "va_range_free";
        let mut st = self.lock();
        st.enter(SimCall::VaRangeFree, OP)?;
        let Some(range) = st.va_ranges.get(&va).copied() else {
            return kernel_err(OP, Errno::EINVAL);
        };
        if st.mappings.range(range.start..range.start + range.size).next().is_some() {
            warn!(?va, "va range freed while mapped");
            return kernel_err(OP, Errno::EBUSY);
        }
        st.va_ranges.remove(&va);
        Ok(())
    }

    fn bo_va_op_raw(&self, bo: BoHandle, offset: u64, size: u64, addr: u64, flags: VmPageFlags, op: VaOp) -> Result<()> {
        let mut st = self.lock();
        match op {
            VaOp::Map => {
                const OP: &str = "va_map";
                st.enter(SimCall::VaMap, OP)?;
                let Some(entry) = st.bos.get(&bo) else {
                    return kernel_err(OP, Errno::ENOENT);
                };
                let fits = offset.checked_add(size).map_or(false, |end| end <= entry.memory.len() as u64);
                if size == 0 || !fits || addr % 4096 != 0 {
                    return kernel_err(OP, Errno::EINVAL);
                }
                let overlaps_before = st
                    .mappings
                    .range(..=addr)
                    .next_back()
                    .map_or(false, |(&start, m)| start + m.size > addr);
                let overlaps_after = st.mappings.range(addr..addr + size).next().is_some();
                if overlaps_before || overlaps_after {
                    return kernel_err(OP, Errno::EINVAL);
                }
                st.mappings.insert(addr, VaMapping { bo, offset, size });
                if let Some(entry) = st.bos.get_mut(&bo) {
                    entry.va_maps += 1;
                }
                debug!(?bo, addr = %format_args!("{:#x}", addr), size, ?flags, "va mapped");
                Ok(())
            }
            VaOp::Unmap => {
                const OP: &str = "va_unmap";
                st.enter(SimCall::VaUnmap, OP)?;
                match st.mappings.get(&addr) {
                    Some(m) if m.bo == bo => {}
                    _ => return kernel_err(OP, Errno::ENOENT),
                }
                st.mappings.remove(&addr);
                if let Some(entry) = st.bos.get_mut(&bo) {
                    entry.va_maps -= 1;
                }
                Ok(())
            }
        }
    }

    fn bo_list_create(&self, bos: &[BoHandle]) -> Result<BoListHandle> {
        const OP: &str = "bo_list_create";
        let mut st = self.lock();
        st.enter(SimCall::BoListCreate, OP)?;
        if bos.is_empty() {
            return kernel_err(OP, Errno::EINVAL);
        }
        if bos.iter().any(|bo| !st.bos.contains_key(bo)) {
            return kernel_err(OP, Errno::ENOENT);
        }
        let list = BoListHandle(st.handle());
        st.lists.insert(list, bos.to_vec());
        Ok(list)
    }

    fn bo_list_destroy(&self, list: BoListHandle) -> Result<()> {
        let mut st = self.lock();
        st.enter(SimCall::BoListDestroy, "bo_list_destroy")?;
        match st.lists.remove(&list) {
            Some(_) => Ok(()),
            None => kernel_err("bo_list_destroy", Errno::EINVAL),
        }
    }

    fn cs_submit(&self, ctx: ContextHandle, req: &mut CsRequest) -> Result<()> {
        const OP: &str = "cs_submit";
        let mut st = self.lock();
        st.enter(SimCall::CsSubmit, OP)?;

        match st.contexts.get(&ctx) {
            None => return kernel_err(OP, Errno::EINVAL),
            Some(c) if c.guilty => return kernel_err(OP, Errno::ECANCELED),
            Some(_) => {}
        }
        let kind = match req.ip_type {
            IpType::Gfx | IpType::Compute => EngineKind::Pm4,
            IpType::Dma => EngineKind::Sdma,
            IpType::Uvd | IpType::Vce => return kernel_err(OP, Errno::EINVAL),
        };
        let rings = self.hw_ip(req.ip_type).available_rings;
        if req.ip_instance != 0 || req.ring >= 32 || rings & (1 << req.ring) == 0 {
            return kernel_err(OP, Errno::EINVAL);
        }
        if req.ibs.is_empty() || req.ibs.iter().any(|ib| ib.size == 0) {
            return kernel_err(OP, Errno::EINVAL);
        }
        if req.ibs.iter().any(|ib| ib.flags.contains(IbFlags::SECURE)) && !self.info.is_tmz_supported() {
            return kernel_err(OP, Errno::EINVAL);
        }
        let resident = match req.resources {
            Some(list) => {
                let Some(bos) = st.lists.get(&list) else {
                    return kernel_err(OP, Errno::ENOENT);
                };
                if bos.iter().any(|bo| !st.bos.contains_key(bo)) {
                    return kernel_err(OP, Errno::ENOENT);
                }
                Some(bos.iter().copied().collect::<HashSet<_>>())
            }
            None => None,
        };
        for dep in &req.dependencies {
            let known = st.contexts.contains_key(&dep.context)
                && st
                    .queues
                    .get(&QueueKey::of(dep))
                    .map_or(false, |q| dep.fence <= q.last_seq);
            if !known {
                return kernel_err(OP, Errno::EINVAL);
            }
        }

        let key = QueueKey {
            ctx,
            ip: req.ip_type,
            instance: req.ip_instance,
            ring: req.ring,
        };
        loop {
            if st.contexts.get(&ctx).map_or(true, |c| c.guilty) {
                return kernel_err(OP, Errno::ECANCELED);
            }
            let head = match st.queues.get(&key) {
                Some(q) if q.pending.len() >= self.config.max_pending_jobs => q.pending.front().map(|j| j.seq),
                _ => break,
            };
            // a full ring keeps executing even when nobody waits on it
            if let Some(seq) = head {
                self.drive(&mut st, key, seq, 0);
            }
            self.pump(&mut st);
            if st.queues.get(&key).map_or(false, |q| q.pending.len() >= self.config.max_pending_jobs) {
                st = self
                    .progress
                    .wait_timeout(st, POLL_INTERVAL)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        }

        let mut ibs: Vec<IbInfo> = req.ibs.iter().filter(|ib| ib.flags.contains(IbFlags::CE)).copied().collect();
        ibs.extend(req.ibs.iter().filter(|ib| !ib.flags.contains(IbFlags::CE)));

        let queue = st.queues.entry(key).or_insert_with(|| Queue::new(kind));
        queue.last_seq += 1;
        let seq = queue.last_seq;
        queue.pending.push_back(Job {
            seq,
            ibs,
            deps: req.dependencies.clone(),
            resident,
            cursor: Cursor::default(),
            stalled_since: None,
        });
        req.seq_no = seq;
        debug!(ctx = ctx.0, ip = ?req.ip_type, ring = req.ring, seq, "submitted");

        if self.config.sched_policy == SchedPolicy::Immediate {
            self.drive(&mut st, key, seq, 0);
        }
        Ok(())
    }

    fn cs_query_fence_status(&self, fence: &CsFence, timeout: Timeout) -> Result<bool> {
        const OP: &str = "cs_query_fence_status";
        let mut st = self.lock();
        st.enter(SimCall::QueryFence, OP)?;
        self.fence_state(&st, fence, OP)?;
        let done = self.wait_until(st, timeout, |st| match self.poll_fence(st, fence, OP)? {
            FenceState::Signaled => Ok(Some(())),
            FenceState::Canceled => kernel_err(OP, Errno::ECANCELED),
            FenceState::Pending => Ok(None),
        })?;
        Ok(done.is_some())
    }

    fn cs_wait_fences(&self, fences: &[CsFence], wait_all: bool, timeout: Timeout) -> Result<(bool, u32)> {
        const OP: &str = "cs_wait_fences";
        let mut st = self.lock();
        st.enter(SimCall::WaitFences, OP)?;
        if fences.is_empty() {
            return kernel_err(OP, Errno::EINVAL);
        }
        for fence in fences {
            self.fence_state(&st, fence, OP)?;
        }
        let first = self.wait_until(st, timeout, |st| {
            let mut first_signaled = None;
            let mut all = true;
            for (i, fence) in fences.iter().enumerate() {
                match self.poll_fence(st, fence, OP)? {
                    FenceState::Canceled => return kernel_err(OP, Errno::ECANCELED),
                    FenceState::Signaled => {
                        first_signaled.get_or_insert(i as u32);
                    }
                    FenceState::Pending => all = false,
                }
                if !wait_all && first_signaled.is_some() {
                    break;
                }
            }
            Ok(match (wait_all, first_signaled) {
                (true, first) if all => Some(first.unwrap_or(0)),
                (false, Some(i)) => Some(i),
                _ => None,
            })
        })?;
        Ok(match first {
            Some(index) => (true, index),
            None => (false, 0),
        })
    }
}
