//! The amdgpu kernel driver behind a render node.
//!
//! Only the handful of ioctls the scenarios need are bound; the structures
//! below mirror `amdgpu_drm.h` and `drm.h` field for field. Virtual address
//! space is managed in user space over the window the kernel reports, the
//! way libdrm does it.

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::time::{clock_gettime, ClockId};
use nix::{ioctl_readwrite, ioctl_write_ptr};
use tracing::{debug, info, warn};

use crate::bit::align_up;
use crate::device::*;
use crate::error::{Error, Result};
use crate::ip_block::IpType;

const DRM_IOCTL_BASE: u8 = b'd';
const DRM_COMMAND_BASE: u8 = 0x40;

const DRM_AMDGPU_GEM_CREATE: u8 = 0x00;
const DRM_AMDGPU_GEM_MMAP: u8 = 0x01;
const DRM_AMDGPU_CTX: u8 = 0x02;
const DRM_AMDGPU_BO_LIST: u8 = 0x03;
const DRM_AMDGPU_CS: u8 = 0x04;
const DRM_AMDGPU_INFO: u8 = 0x05;
const DRM_AMDGPU_GEM_VA: u8 = 0x08;
const DRM_AMDGPU_WAIT_CS: u8 = 0x09;
const DRM_AMDGPU_WAIT_FENCES: u8 = 0x12;

const AMDGPU_CTX_OP_ALLOC_CTX: u32 = 1;
const AMDGPU_CTX_OP_FREE_CTX: u32 = 2;
const AMDGPU_CTX_OP_QUERY_STATE: u32 = 3;

const AMDGPU_BO_LIST_OP_CREATE: u32 = 0;
const AMDGPU_BO_LIST_OP_DESTROY: u32 = 1;

const AMDGPU_CHUNK_ID_IB: u32 = 0x01;
const AMDGPU_CHUNK_ID_DEPENDENCIES: u32 = 0x03;

const AMDGPU_INFO_HW_IP_INFO: u32 = 0x02;
const AMDGPU_INFO_DEV_INFO: u32 = 0x16;

/// `AMDGPU_VM_PAGE_PRT`; the other page flags share their bit positions.
const AMDGPU_VM_PAGE_PRT: u32 = 1 << 4;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DrmVersion {
    version_major: i32,
    version_minor: i32,
    version_patchlevel: i32,
    name_len: libc::size_t,
    name: *mut c_char,
    date_len: libc::size_t,
    date: *mut c_char,
    desc_len: libc::size_t,
    desc: *mut c_char,
}

impl Default for DrmVersion {
    fn default() -> Self {
        DrmVersion {
            version_major: 0,
            version_minor: 0,
            version_patchlevel: 0,
            name_len: 0,
            name: std::ptr::null_mut(),
            date_len: 0,
            date: std::ptr::null_mut(),
            desc_len: 0,
            desc: std::ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct GemCreateIn {
    bo_size: u64,
    alignment: u64,
    domains: u64,
    domain_flags: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct GemCreateOut {
    handle: u32,
    _pad: u32,
}

#[repr(C)]
union GemCreate {
    in_: GemCreateIn,
    out: GemCreateOut,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct GemMmapIn {
    handle: u32,
    _pad: u32,
}

#[repr(C)]
union GemMmap {
    in_: GemMmapIn,
    addr_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CtxIn {
    op: u32,
    flags: u32,
    ctx_id: u32,
    priority: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CtxState {
    flags: u64,
    hangs: u32,
    reset_status: u32,
}

#[repr(C)]
union Ctx {
    in_: CtxIn,
    alloc_ctx_id: u32,
    state: CtxState,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BoListEntry {
    bo_handle: u32,
    bo_priority: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BoListIn {
    operation: u32,
    list_handle: u32,
    bo_number: u32,
    bo_info_size: u32,
    bo_info_ptr: u64,
}

#[repr(C)]
union BoList {
    in_: BoListIn,
    list_handle: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CsChunk {
    chunk_id: u32,
    length_dw: u32,
    chunk_data: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CsChunkIb {
    _pad: u32,
    flags: u32,
    va_start: u64,
    ib_bytes: u32,
    ip_type: u32,
    ip_instance: u32,
    ring: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CsChunkDep {
    ip_type: u32,
    ip_instance: u32,
    ring: u32,
    ctx_id: u32,
    handle: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CsIn {
    ctx_id: u32,
    bo_list_handle: u32,
    num_chunks: u32,
    flags: u32,
    chunks: u64,
}

#[repr(C)]
union Cs {
    in_: CsIn,
    handle: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Info {
    return_pointer: u64,
    return_size: u32,
    query: u32,
    /// `query_hw_ip.type` and `query_hw_ip.ip_instance` for HW_IP_INFO.
    args: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct InfoHwIp {
    hw_ip_version_major: u32,
    hw_ip_version_minor: u32,
    capabilities_flags: u64,
    ib_start_alignment: u32,
    ib_size_alignment: u32,
    available_rings: u32,
    ip_discovery_version: u32,
}

/// Leading part of `drm_amdgpu_info_device`; the kernel copies no more
/// than the size asked for.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct InfoDevice {
    device_id: u32,
    chip_rev: u32,
    external_rev: u32,
    pci_rev: u32,
    family: u32,
    num_shader_engines: u32,
    num_shader_arrays_per_engine: u32,
    gpu_counter_freq: u32,
    max_engine_clock: u64,
    max_memory_clock: u64,
    cu_active_number: u32,
    cu_ao_mask: u32,
    cu_bitmap: [[u32; 4]; 4],
    enabled_rb_pipes_mask: u32,
    num_rb_pipes: u32,
    num_hw_gfx_contexts: u32,
    pcie_gen: u32,
    ids_flags: u64,
    virtual_address_offset: u64,
    virtual_address_max: u64,
    virtual_address_alignment: u32,
    pte_fragment_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct GemVa {
    handle: u32,
    _pad: u32,
    operation: u32,
    flags: u32,
    va_address: u64,
    offset_in_bo: u64,
    map_size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct WaitCsIn {
    handle: u64,
    timeout: u64,
    ip_type: u32,
    ip_instance: u32,
    ring: u32,
    ctx_id: u32,
}

#[repr(C)]
union WaitCs {
    in_: WaitCsIn,
    status: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Fence {
    ctx_id: u32,
    ip_type: u32,
    ip_instance: u32,
    ring: u32,
    seq_no: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct WaitFencesIn {
    fences: u64,
    fence_count: u32,
    wait_all: u32,
    timeout_ns: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct WaitFencesOut {
    status: u32,
    first_signaled: u32,
}

#[repr(C)]
union WaitFences {
    in_: WaitFencesIn,
    out: WaitFencesOut,
}

ioctl_readwrite!(drm_ioctl_version, DRM_IOCTL_BASE, 0x00, DrmVersion);
ioctl_write_ptr!(drm_ioctl_gem_close, DRM_IOCTL_BASE, 0x09, DrmGemClose);
ioctl_readwrite!(
    drm_ioctl_amdgpu_gem_create,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_AMDGPU_GEM_CREATE,
    GemCreate
);
ioctl_readwrite!(
    drm_ioctl_amdgpu_gem_mmap,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_AMDGPU_GEM_MMAP,
    GemMmap
);
ioctl_readwrite!(drm_ioctl_amdgpu_ctx, DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDGPU_CTX, Ctx);
ioctl_readwrite!(
    drm_ioctl_amdgpu_bo_list,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_AMDGPU_BO_LIST,
    BoList
);
ioctl_readwrite!(drm_ioctl_amdgpu_cs, DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDGPU_CS, Cs);
ioctl_write_ptr!(drm_ioctl_amdgpu_info, DRM_IOCTL_BASE, DRM_COMMAND_BASE + DRM_AMDGPU_INFO, Info);
ioctl_write_ptr!(
    drm_ioctl_amdgpu_gem_va,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_AMDGPU_GEM_VA,
    GemVa
);
ioctl_readwrite!(
    drm_ioctl_amdgpu_wait_cs,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_AMDGPU_WAIT_CS,
    WaitCs
);
ioctl_readwrite!(
    drm_ioctl_amdgpu_wait_fences,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_AMDGPU_WAIT_FENCES,
    WaitFences
);

/// Turns a relative timeout into the absolute CLOCK_MONOTONIC deadline the
/// wait ioctls expect. Infinite stays infinite, and so does a deadline that
/// would overflow.
pub fn absolute_timeout(timeout_ns: u64, now_ns: u64) -> u64 {
    if timeout_ns == TIMEOUT_INFINITE_NS {
        return TIMEOUT_INFINITE_NS;
    }
    now_ns.checked_add(timeout_ns).unwrap_or(TIMEOUT_INFINITE_NS)
}

fn monotonic_now_ns() -> Result<u64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(|e| Error::kernel("clock_gettime", e))?;
    Ok(now.tv_sec() as u64 * 1_000_000_000 + now.tv_nsec() as u64)
}

fn deadline(timeout: Timeout) -> Result<u64> {
    match timeout {
        Timeout::Infinite => Ok(TIMEOUT_INFINITE_NS),
        t => Ok(absolute_timeout(t.as_ns(), monotonic_now_ns()?)),
    }
}

fn kernel_va_flags(flags: VmPageFlags) -> u32 {
    let mut bits = flags.bits() & !VmPageFlags::PRT.bits();
    if flags.contains(VmPageFlags::PRT) {
        bits |= AMDGPU_VM_PAGE_PRT;
    }
    bits
}

/// First-fit allocator over a GPU virtual address window.
#[derive(Debug)]
pub struct VaManager {
    /// Free holes keyed by start address.
    holes: BTreeMap<u64, u64>,
    ranges: HashMap<VaHandle, (u64, u64)>,
    min_alignment: u64,
    next_handle: u64,
}

impl VaManager {
    pub fn new(start: u64, end: u64, min_alignment: u64) -> Self {
        let mut holes = BTreeMap::new();
        if end > start {
            holes.insert(start, end - start);
        }
        VaManager {
            holes,
            ranges: HashMap::new(),
            min_alignment: min_alignment.max(1).next_power_of_two(),
            next_handle: 1,
        }
    }

    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<(u64, VaHandle)> {
        if size == 0 {
            return None;
        }
        let align = alignment.max(self.min_alignment).next_power_of_two();
        let size = align_up(size, self.min_alignment);
        let (hole, hole_size, addr) = self.holes.iter().find_map(|(&hole, &hole_size)| {
            let addr = align_up(hole, align);
            let end = addr.checked_add(size)?;
            (end <= hole + hole_size).then_some((hole, hole_size, addr))
        })?;

        self.holes.remove(&hole);
        if addr > hole {
            self.holes.insert(hole, addr - hole);
        }
        let tail = hole + hole_size - (addr + size);
        if tail > 0 {
            self.holes.insert(addr + size, tail);
        }

        let handle = VaHandle(self.next_handle);
        self.next_handle += 1;
        self.ranges.insert(handle, (addr, size));
        Some((addr, handle))
    }

    pub fn free(&mut self, handle: VaHandle) -> bool {
        let Some((mut start, mut size)) = self.ranges.remove(&handle) else {
            return false;
        };
        let before = self.holes.range(..start).next_back().map(|(&s, &l)| (s, l));
        if let Some((prev, prev_size)) = before {
            if prev + prev_size == start {
                self.holes.remove(&prev);
                start = prev;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.holes.remove(&(start + size)) {
            size += next_size;
        }
        self.holes.insert(start, size);
        true
    }

    pub fn live_ranges(&self) -> usize {
        self.ranges.len()
    }
}

/// A GEM mmap; unmapped once the last CPU view of it is gone.
struct MmapRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: a shared file mapping has no thread affinity.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap and nothing
        // references the region once the last owner drops.
        if unsafe { libc::munmap(self.ptr.as_ptr(), self.len) } != 0 {
            warn!(errno = %Errno::last(), "munmap failed");
        }
    }
}

struct BoState {
    size: u64,
    region: Option<Arc<MmapRegion>>,
    cpu_maps: u32,
}

struct DrmState {
    bos: HashMap<BoHandle, BoState>,
    va: VaManager,
}

/// A [`Device`] backed by an amdgpu render node.
pub struct DrmDevice {
    id: DeviceId,
    path: PathBuf,
    file: File,
    version: (u32, u32),
    state: Mutex<DrmState>,
}

fn kernel<T>(op: &'static str, result: nix::Result<T>) -> Result<T> {
    result.map_err(|errno| Error::kernel(op, errno))
}

impl DrmDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            Error::kernel("open", Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)))
        })?;

        let mut version = DrmVersion::default();
        // SAFETY: zero lengths make the kernel skip the string buffers.
        kernel("drm_version", unsafe { drm_ioctl_version(file.as_raw_fd(), &mut version) })?;
        let version = (version.version_major as u32, version.version_minor as u32);

        let mut device = DrmDevice {
            id: DeviceId::next(),
            path: path.to_path_buf(),
            file,
            version,
            state: Mutex::new(DrmState {
                bos: HashMap::new(),
                va: VaManager::new(0, 0, 1),
            }),
        };
        let info = device.query_gpu_info()?;
        device.state.get_mut().unwrap_or_else(PoisonError::into_inner).va = VaManager::new(
            info.virtual_address_offset,
            info.virtual_address_max,
            info.virtual_address_alignment as u64,
        );
        info!(
            path = %device.path.display(),
            drm = %format!("{}.{}", version.0, version.1),
            family = info.family_id,
            "opened render node"
        );
        Ok(device)
    }

    /// DRM interface version as (major, minor).
    pub fn version(&self) -> (u32, u32) {
        self.version
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn lock(&self) -> MutexGuard<'_, DrmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info<T: Default>(&self, op: &'static str, query: u32, args: [u32; 4]) -> Result<T> {
        let mut out = T::default();
        let request = Info {
            return_pointer: &mut out as *mut T as u64,
            return_size: std::mem::size_of::<T>() as u32,
            query,
            args,
        };
        // SAFETY: `return_pointer` addresses `return_size` writable bytes.
        kernel(op, unsafe { drm_ioctl_amdgpu_info(self.fd(), &request) })?;
        Ok(out)
    }

    fn ctx_op(&self, op: &'static str, in_: CtxIn) -> Result<Ctx> {
        let mut arg = Ctx { in_ };
        // SAFETY: `arg` is a properly initialized drm_amdgpu_ctx.
        kernel(op, unsafe { drm_ioctl_amdgpu_ctx(self.fd(), &mut arg) })?;
        Ok(arg)
    }

    fn mmap_bo(&self, bo: BoHandle, size: u64) -> Result<Arc<MmapRegion>> {
        const OP: &str = "gem_mmap";
        let mut arg = GemMmap {
            in_: GemMmapIn { handle: bo.0, _pad: 0 },
        };
        // SAFETY: valid drm_amdgpu_gem_mmap.
        kernel(OP, unsafe { drm_ioctl_amdgpu_gem_mmap(self.fd(), &mut arg) })?;
        // SAFETY: the kernel filled in the out member.
        let offset = unsafe { arg.addr_ptr };

        let len = size as usize;
        // SAFETY: a fresh shared mapping of the fake offset GEM_MMAP handed out.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::kernel("mmap", Errno::last()));
        }
        let ptr = NonNull::new(ptr).ok_or(Error::kernel("mmap", Errno::EFAULT))?;
        Ok(Arc::new(MmapRegion { ptr, len }))
    }
}

impl Device for DrmDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn query_gpu_info(&self) -> Result<GpuInfo> {
        let dev: InfoDevice = self.info("query_gpu_info", AMDGPU_INFO_DEV_INFO, [0; 4])?;
        Ok(GpuInfo {
            asic_id: dev.device_id,
            chip_rev: dev.chip_rev,
            chip_external_rev: dev.external_rev,
            family_id: dev.family,
            ids_flags: dev.ids_flags,
            num_shader_engines: dev.num_shader_engines,
            cu_active_number: dev.cu_active_number,
            virtual_address_offset: dev.virtual_address_offset,
            virtual_address_max: dev.virtual_address_max,
            virtual_address_alignment: dev.virtual_address_alignment,
        })
    }

    fn query_hw_ip_info(&self, ip: IpType, instance: u32) -> Result<HwIpInfo> {
        let hw: InfoHwIp = self.info("query_hw_ip_info", AMDGPU_INFO_HW_IP_INFO, [ip as u32, instance, 0, 0])?;
        Ok(HwIpInfo {
            hw_ip_version_major: hw.hw_ip_version_major,
            hw_ip_version_minor: hw.hw_ip_version_minor,
            capabilities_flags: hw.capabilities_flags,
            ib_start_alignment: hw.ib_start_alignment,
            ib_size_alignment: hw.ib_size_alignment,
            available_rings: hw.available_rings,
        })
    }

    fn cs_ctx_create(&self) -> Result<ContextHandle> {
        let out = self.ctx_op(
            "cs_ctx_create",
            CtxIn {
                op: AMDGPU_CTX_OP_ALLOC_CTX,
                ..Default::default()
            },
        )?;
        // SAFETY: ALLOC_CTX fills in the alloc member.
        Ok(ContextHandle(unsafe { out.alloc_ctx_id }))
    }

    fn cs_ctx_free(&self, ctx: ContextHandle) -> Result<()> {
        self.ctx_op(
            "cs_ctx_free",
            CtxIn {
                op: AMDGPU_CTX_OP_FREE_CTX,
                ctx_id: ctx.0,
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn cs_query_reset_state(&self, ctx: ContextHandle) -> Result<(ResetStatus, u32)> {
        const OP: &str = "cs_query_reset_state";
        let out = self.ctx_op(
            OP,
            CtxIn {
                op: AMDGPU_CTX_OP_QUERY_STATE,
                ctx_id: ctx.0,
                ..Default::default()
            },
        )?;
        // SAFETY: QUERY_STATE fills in the state member.
        let state = unsafe { out.state };
        let status = num::FromPrimitive::from_u32(state.reset_status).ok_or(Error::kernel(OP, Errno::EPROTO))?;
        Ok((status, state.hangs))
    }

    fn bo_alloc(&self, req: &BoAllocRequest) -> Result<BoHandle> {
        let mut arg = GemCreate {
            in_: GemCreateIn {
                bo_size: req.alloc_size,
                alignment: req.phys_alignment,
                domains: req.preferred_heap.bits() as u64,
                domain_flags: req.flags.bits(),
            },
        };
        // SAFETY: valid drm_amdgpu_gem_create.
        kernel("bo_alloc", unsafe { drm_ioctl_amdgpu_gem_create(self.fd(), &mut arg) })?;
        // SAFETY: the kernel filled in the out member.
        let bo = BoHandle(unsafe { arg.out.handle });
        self.lock().bos.insert(
            bo,
            BoState {
                size: req.alloc_size,
                region: None,
                cpu_maps: 0,
            },
        );
        debug!(?bo, size = req.alloc_size, heap = ?req.preferred_heap, "gem create");
        Ok(bo)
    }

    fn bo_free(&self, bo: BoHandle) -> Result<()> {
        if self.lock().bos.remove(&bo).is_none() {
            return Err(Error::kernel("bo_free", Errno::ENOENT));
        }
        let arg = DrmGemClose { handle: bo.0, pad: 0 };
        // SAFETY: valid drm_gem_close.
        kernel("bo_free", unsafe { drm_ioctl_gem_close(self.fd(), &arg) })?;
        Ok(())
    }

    fn bo_cpu_map(&self, bo: BoHandle) -> Result<CpuMapping> {
        const OP: &str = "bo_cpu_map";
        let mut st = self.lock();
        let entry = st.bos.get_mut(&bo).ok_or(Error::kernel(OP, Errno::ENOENT))?;
        let region = match &entry.region {
            Some(region) => region.clone(),
            None => {
                let region = self.mmap_bo(bo, entry.size)?;
                entry.region = Some(region.clone());
                region
            }
        };
        entry.cpu_maps += 1;
        let ptr = region.ptr.cast::<u8>();
        let len = region.len;
        let owner: Arc<dyn std::any::Any + Send + Sync> = region;
        // SAFETY: page aligned, `len` bytes long and kept mapped by `owner`.
        Ok(unsafe { CpuMapping::from_raw(ptr, len, Some(owner)) })
    }

    fn bo_cpu_unmap(&self, bo: BoHandle, mapping: CpuMapping) -> Result<()> {
        const OP: &str = "bo_cpu_unmap";
        let mut st = self.lock();
        let entry = st.bos.get_mut(&bo).ok_or(Error::kernel(OP, Errno::ENOENT))?;
        let ours = entry
            .region
            .as_ref()
            .map_or(false, |r| r.ptr.as_ptr() as *mut u8 == mapping.as_ptr());
        if entry.cpu_maps == 0 || !ours {
            return Err(Error::kernel(OP, Errno::EINVAL));
        }
        entry.cpu_maps -= 1;
        if entry.cpu_maps == 0 {
            entry.region = None;
        }
        drop(mapping);
        Ok(())
    }

    fn va_range_alloc(&self, size: u64, alignment: u64) -> Result<(u64, VaHandle)> {
        self.lock()
            .va
            .alloc(size, alignment)
            .ok_or(Error::kernel("va_range_alloc", Errno::ENOMEM))
    }

    fn va_range_free(&self, va: VaHandle) -> Result<()> {
        if self.lock().va.free(va) {
            Ok(())
        } else {
            Err(Error::kernel("va_range_free", Errno::EINVAL))
        }
    }

    fn bo_va_op_raw(
        &self,
        bo: BoHandle,
        offset: u64,
        size: u64,
        addr: u64,
        flags: VmPageFlags,
        op: VaOp,
    ) -> Result<()> {
        let arg = GemVa {
            handle: bo.0,
            _pad: 0,
            operation: op as u32,
            flags: kernel_va_flags(flags),
            va_address: addr,
            offset_in_bo: offset,
            map_size: size,
        };
        // SAFETY: valid drm_amdgpu_gem_va.
        kernel("bo_va_op", unsafe { drm_ioctl_amdgpu_gem_va(self.fd(), &arg) })?;
        Ok(())
    }

    fn bo_list_create(&self, bos: &[BoHandle]) -> Result<BoListHandle> {
        let entries: Vec<BoListEntry> = bos
            .iter()
            .map(|bo| BoListEntry {
                bo_handle: bo.0,
                bo_priority: 0,
            })
            .collect();
        let mut arg = BoList {
            in_: BoListIn {
                operation: AMDGPU_BO_LIST_OP_CREATE,
                list_handle: 0,
                bo_number: entries.len() as u32,
                bo_info_size: std::mem::size_of::<BoListEntry>() as u32,
                bo_info_ptr: entries.as_ptr() as u64,
            },
        };
        // SAFETY: `entries` outlives the call.
        kernel("bo_list_create", unsafe { drm_ioctl_amdgpu_bo_list(self.fd(), &mut arg) })?;
        // SAFETY: the kernel filled in the out member.
        Ok(BoListHandle(unsafe { arg.list_handle }))
    }

    fn bo_list_destroy(&self, list: BoListHandle) -> Result<()> {
        let mut arg = BoList {
            in_: BoListIn {
                operation: AMDGPU_BO_LIST_OP_DESTROY,
                list_handle: list.0,
                ..Default::default()
            },
        };
        // SAFETY: valid drm_amdgpu_bo_list.
        kernel("bo_list_destroy", unsafe { drm_ioctl_amdgpu_bo_list(self.fd(), &mut arg) })?;
        Ok(())
    }

    fn cs_submit(&self, ctx: ContextHandle, req: &mut CsRequest) -> Result<()> {
        const OP: &str = "cs_submit";
        if req.ibs.is_empty() {
            return Err(Error::kernel(OP, Errno::EINVAL));
        }
        let ibs: Vec<CsChunkIb> = req
            .ibs
            .iter()
            .map(|ib| CsChunkIb {
                _pad: 0,
                flags: ib.flags.bits(),
                va_start: ib.ib_mc_address,
                ib_bytes: ib.size * 4,
                ip_type: req.ip_type as u32,
                ip_instance: req.ip_instance,
                ring: req.ring,
            })
            .collect();
        let deps: Vec<CsChunkDep> = req
            .dependencies
            .iter()
            .map(|f| CsChunkDep {
                ip_type: f.ip_type as u32,
                ip_instance: f.ip_instance,
                ring: f.ring,
                ctx_id: f.context.0,
                handle: f.fence,
            })
            .collect();

        let mut chunks: Vec<CsChunk> = ibs
            .iter()
            .map(|ib| CsChunk {
                chunk_id: AMDGPU_CHUNK_ID_IB,
                length_dw: (std::mem::size_of::<CsChunkIb>() / 4) as u32,
                chunk_data: ib as *const CsChunkIb as u64,
            })
            .collect();
        if !deps.is_empty() {
            chunks.push(CsChunk {
                chunk_id: AMDGPU_CHUNK_ID_DEPENDENCIES,
                length_dw: (deps.len() * std::mem::size_of::<CsChunkDep>() / 4) as u32,
                chunk_data: deps.as_ptr() as u64,
            });
        }
        let chunk_ptrs: Vec<u64> = chunks.iter().map(|c| c as *const CsChunk as u64).collect();

        let mut arg = Cs {
            in_: CsIn {
                ctx_id: ctx.0,
                bo_list_handle: req.resources.map_or(0, |l| l.0),
                num_chunks: chunk_ptrs.len() as u32,
                flags: 0,
                chunks: chunk_ptrs.as_ptr() as u64,
            },
        };
        // SAFETY: every pointer in the chunk tree stays alive until the call returns.
        kernel(OP, unsafe { drm_ioctl_amdgpu_cs(self.fd(), &mut arg) })?;
        // SAFETY: the kernel filled in the out member.
        req.seq_no = unsafe { arg.handle };
        Ok(())
    }

    fn cs_query_fence_status(&self, fence: &CsFence, timeout: Timeout) -> Result<bool> {
        if fence.fence == 0 {
            return Ok(true);
        }
        let mut arg = WaitCs {
            in_: WaitCsIn {
                handle: fence.fence,
                timeout: deadline(timeout)?,
                ip_type: fence.ip_type as u32,
                ip_instance: fence.ip_instance,
                ring: fence.ring,
                ctx_id: fence.context.0,
            },
        };
        // SAFETY: valid drm_amdgpu_wait_cs.
        kernel("cs_query_fence_status", unsafe { drm_ioctl_amdgpu_wait_cs(self.fd(), &mut arg) })?;
        // SAFETY: the kernel filled in the out member; non-zero means busy.
        Ok(unsafe { arg.status } == 0)
    }

    fn cs_wait_fences(&self, fences: &[CsFence], wait_all: bool, timeout: Timeout) -> Result<(bool, u32)> {
        const OP: &str = "cs_wait_fences";
        if fences.is_empty() {
            return Err(Error::kernel(OP, Errno::EINVAL));
        }
        let raw: Vec<Fence> = fences
            .iter()
            .map(|f| Fence {
                ctx_id: f.context.0,
                ip_type: f.ip_type as u32,
                ip_instance: f.ip_instance,
                ring: f.ring,
                seq_no: f.fence,
            })
            .collect();
        let mut arg = WaitFences {
            in_: WaitFencesIn {
                fences: raw.as_ptr() as u64,
                fence_count: raw.len() as u32,
                wait_all: wait_all as u32,
                timeout_ns: deadline(timeout)?,
            },
        };
        // SAFETY: `raw` outlives the call.
        kernel(OP, unsafe { drm_ioctl_amdgpu_wait_fences(self.fd(), &mut arg) })?;
        // SAFETY: the kernel filled in the out member.
        let out = unsafe { arg.out };
        Ok((out.status != 0, out.first_signaled))
    }
}

impl Drop for DrmDevice {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !st.bos.is_empty() || st.va.live_ranges() > 0 {
            warn!(
                bos = st.bos.len(),
                va_ranges = st.va.live_ranges(),
                "render node closed with live objects"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn uapi_layouts() {
        assert_eq!(size_of::<GemCreate>(), 32);
        assert_eq!(size_of::<GemMmap>(), 8);
        assert_eq!(size_of::<Ctx>(), 16);
        assert_eq!(size_of::<BoList>(), 24);
        assert_eq!(size_of::<Cs>(), 24);
        assert_eq!(size_of::<CsChunk>(), 16);
        assert_eq!(size_of::<CsChunkIb>(), 32);
        assert_eq!(size_of::<CsChunkDep>(), 24);
        assert_eq!(size_of::<Info>(), 32);
        assert_eq!(size_of::<InfoHwIp>(), 32);
        assert_eq!(size_of::<GemVa>(), 40);
        assert_eq!(size_of::<WaitCs>(), 32);
        assert_eq!(size_of::<Fence>(), 24);
        assert_eq!(size_of::<WaitFences>(), 24);
        assert_eq!(size_of::<DrmGemClose>(), 8);
    }

    #[test]
    fn deadlines_saturate_to_infinite() {
        assert_eq!(absolute_timeout(TIMEOUT_INFINITE_NS, 5), TIMEOUT_INFINITE_NS);
        assert_eq!(absolute_timeout(1_000, 5_000), 6_000);
        assert_eq!(absolute_timeout(u64::MAX - 1, 10), TIMEOUT_INFINITE_NS);
    }

    #[test]
    fn prt_moves_to_the_kernel_bit() {
        let flags = VmPageFlags::READABLE | VmPageFlags::WRITEABLE | VmPageFlags::MTYPE_UC;
        assert_eq!(kernel_va_flags(flags), flags.bits());
        assert_eq!(kernel_va_flags(VmPageFlags::PRT), AMDGPU_VM_PAGE_PRT);
    }

    #[test]
    fn va_manager_aligns_and_coalesces() {
        let mut va = VaManager::new(0x10_0000, 0x20_0000, 0x1000);
        let (a, ha) = va.alloc(0x1800, 0).unwrap();
        assert_eq!(a, 0x10_0000);
        let (b, hb) = va.alloc(0x1000, 0x4_0000).unwrap();
        assert_eq!(b, 0x14_0000);
        let (c, hc) = va.alloc(0x1000, 0).unwrap();
        assert_eq!(c, 0x10_2000);
        assert!(va.alloc(0x10_0000, 0).is_none());
        assert!(va.alloc(0, 0).is_none());

        assert!(va.free(hb));
        assert!(!va.free(hb));
        assert!(va.free(ha));
        assert!(va.free(hc));
        assert_eq!(va.live_ranges(), 0);
        assert_eq!(va.holes.len(), 1);
        let (whole, _) = va.alloc(0x10_0000, 0).unwrap();
        assert_eq!(whole, 0x10_0000);
    }
}
