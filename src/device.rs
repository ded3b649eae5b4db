//! The kernel-facing contract every backend implements.
//!
//! Method names and semantics follow the amdgpu user-space API: handles are
//! opaque, every call reports the kernel's exact errno, and submissions
//! return sequence numbers that are only meaningful for fence queries on
//! the same context, IP and ring.

use std::any::Any;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;
use crate::ip_block::IpType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

impl DeviceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DeviceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VaHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoListHandle(pub u32);

bitflags! {
    /// Memory heaps a buffer object may be placed in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GemDomain: u32 {
        const CPU = 0x1;
        const GTT = 0x2;
        const VRAM = 0x4;
        const GDS = 0x8;
        const GWS = 0x10;
        const OA = 0x20;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GemCreateFlags: u64 {
        const CPU_ACCESS_REQUIRED = 1 << 0;
        const NO_CPU_ACCESS = 1 << 1;
        const CPU_GTT_USWC = 1 << 2;
        const VRAM_CLEARED = 1 << 3;
        const VRAM_CONTIGUOUS = 1 << 5;
        const VM_ALWAYS_VALID = 1 << 6;
        const EXPLICIT_SYNC = 1 << 7;
        const ENCRYPTED = 1 << 10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmPageFlags: u32 {
        const PRT = 1 << 0;
        const READABLE = 1 << 1;
        const WRITEABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const MTYPE_NC = 1 << 5;
        const MTYPE_WC = 2 << 5;
        const MTYPE_CC = 3 << 5;
        const MTYPE_UC = 4 << 5;
        const MTYPE_RW = 5 << 5;
        const NOALLOC = 1 << 9;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IbFlags: u32 {
        const CE = 1 << 0;
        const PREAMBLE = 1 << 1;
        const PREEMPT = 1 << 2;
        const TC_WB_NOT_INVALIDATE = 1 << 3;
        const SECURE = 1 << 5;
    }
}

impl Default for IbFlags {
    fn default() -> Self {
        IbFlags::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum VaOp {
    Map = 1,
    Unmap = 2,
}

/// Context reset classification, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ResetStatus {
    NoReset = 0,
    Guilty = 1,
    Innocent = 2,
    UnknownReset = 3,
}

/// TMZ (secure memory) support bit in `GpuInfo::ids_flags`.
pub const IDS_FLAGS_TMZ: u64 = 0x4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub asic_id: u32,
    pub chip_rev: u32,
    pub chip_external_rev: u32,
    pub family_id: u32,
    pub ids_flags: u64,
    pub num_shader_engines: u32,
    pub cu_active_number: u32,
    pub virtual_address_offset: u64,
    pub virtual_address_max: u64,
    pub virtual_address_alignment: u32,
}

impl GpuInfo {
    pub fn is_tmz_supported(&self) -> bool {
        self.ids_flags & IDS_FLAGS_TMZ != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwIpInfo {
    pub hw_ip_version_major: u32,
    pub hw_ip_version_minor: u32,
    pub capabilities_flags: u64,
    pub ib_start_alignment: u32,
    pub ib_size_alignment: u32,
    pub available_rings: u32,
}

impl HwIpInfo {
    /// Ring ids starting at zero for as long as the ring bit is set.
    pub fn rings(&self) -> impl Iterator<Item = u32> {
        let mask = self.available_rings;
        (0..32).take_while(move |r| mask & (1 << r) != 0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoAllocRequest {
    pub alloc_size: u64,
    pub phys_alignment: u64,
    pub preferred_heap: GemDomain,
    pub flags: GemCreateFlags,
}

/// One indirect buffer of a submission; `size` is in dwords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IbInfo {
    pub flags: IbFlags,
    pub ib_mc_address: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CsFence {
    pub context: ContextHandle,
    pub ip_type: IpType,
    pub ip_instance: u32,
    pub ring: u32,
    pub fence: u64,
}

#[derive(Debug, Clone)]
pub struct CsRequest {
    pub ip_type: IpType,
    pub ip_instance: u32,
    pub ring: u32,
    pub resources: Option<BoListHandle>,
    pub dependencies: Vec<CsFence>,
    pub ibs: Vec<IbInfo>,
    /// Filled in by a successful submit.
    pub seq_no: u64,
}

impl CsRequest {
    pub fn new(ip_type: IpType, ring: u32) -> Self {
        CsRequest {
            ip_type,
            ip_instance: 0,
            ring,
            resources: None,
            dependencies: Vec::new(),
            ibs: Vec::new(),
            seq_no: 0,
        }
    }

    /// The fence naming this request's last submission.
    pub fn fence(&self, context: ContextHandle) -> CsFence {
        CsFence {
            context,
            ip_type: self.ip_type,
            ip_instance: self.ip_instance,
            ring: self.ring,
            fence: self.seq_no,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    Relative(Duration),
}

pub const TIMEOUT_INFINITE_NS: u64 = u64::MAX;

impl Timeout {
    pub fn as_ns(&self) -> u64 {
        match self {
            Timeout::Infinite => TIMEOUT_INFINITE_NS,
            Timeout::Relative(d) => u64::try_from(d.as_nanos()).unwrap_or(TIMEOUT_INFINITE_NS),
        }
    }

    pub fn from_ns(ns: u64) -> Self {
        if ns == TIMEOUT_INFINITE_NS {
            Timeout::Infinite
        } else {
            Timeout::Relative(Duration::from_nanos(ns))
        }
    }
}

/// A CPU view of a buffer object, valid until handed back to `bo_cpu_unmap`.
pub struct CpuMapping {
    ptr: NonNull<u8>,
    len: usize,
    _owner: Option<Arc<dyn Any + Send + Sync>>,
}

// SAFETY: the mapping is plain memory owned by the kernel or by `_owner`;
// it carries no thread affinity.
unsafe impl Send for CpuMapping {}
unsafe impl Sync for CpuMapping {}

impl CpuMapping {
    /// # Safety
    ///
    /// `ptr` must be dword aligned and valid for reads and writes of `len`
    /// bytes until the mapping is dropped or unmapped; `owner`, when given,
    /// must keep that memory alive.
    pub unsafe fn from_raw(
        ptr: NonNull<u8>,
        len: usize,
        owner: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        CpuMapping {
            ptr,
            len,
            _owner: owner,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by `from_raw`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by `from_raw`; `&mut self` makes this the only view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn dwords(&self) -> &[u32] {
        bytemuck::cast_slice(&self.as_bytes()[..self.len & !3])
    }

    pub fn dwords_mut(&mut self) -> &mut [u32] {
        let len = self.len & !3;
        bytemuck::cast_slice_mut(&mut self.as_bytes_mut()[..len])
    }

    /// Reads a dword the GPU may be writing concurrently.
    pub fn read_volatile(&self, index: usize) -> Option<u32> {
        self.shared_dword(index).map(|d| d.read())
    }

    pub fn write_volatile(&self, index: usize, value: u32) -> Option<()> {
        self.shared_dword(index).map(|d| d.write(value))
    }

    /// A handle to one dword that can be moved to a scoped thread.
    pub fn shared_dword(&self, index: usize) -> Option<SharedDword<'_>> {
        if (index + 1) * 4 > self.len {
            return None;
        }
        // SAFETY: in bounds and dword aligned per `from_raw`.
        let ptr = unsafe { NonNull::new_unchecked((self.ptr.as_ptr() as *mut u32).add(index)) };
        Some(SharedDword {
            ptr,
            _mapping: PhantomData,
        })
    }
}

/// One dword of a CPU mapping, accessed with volatile semantics.
#[derive(Clone, Copy)]
pub struct SharedDword<'a> {
    ptr: NonNull<u32>,
    _mapping: PhantomData<&'a CpuMapping>,
}

// SAFETY: only volatile single-dword accesses go through the pointer and
// the borrow keeps the mapping alive.
unsafe impl Send for SharedDword<'_> {}
unsafe impl Sync for SharedDword<'_> {}

impl SharedDword<'_> {
    pub fn read(&self) -> u32 {
        // SAFETY: see type-level comment.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr()) }
    }

    pub fn write(&self, value: u32) {
        // SAFETY: see type-level comment.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr(), value) }
    }
}

pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;

    fn query_gpu_info(&self) -> Result<GpuInfo>;
    fn query_hw_ip_info(&self, ip: IpType, instance: u32) -> Result<HwIpInfo>;

    fn cs_ctx_create(&self) -> Result<ContextHandle>;
    fn cs_ctx_free(&self, ctx: ContextHandle) -> Result<()>;
    /// Returns the reset classification and the hang count.
    fn cs_query_reset_state(&self, ctx: ContextHandle) -> Result<(ResetStatus, u32)>;

    fn bo_alloc(&self, req: &BoAllocRequest) -> Result<BoHandle>;
    fn bo_free(&self, bo: BoHandle) -> Result<()>;
    fn bo_cpu_map(&self, bo: BoHandle) -> Result<CpuMapping>;
    fn bo_cpu_unmap(&self, bo: BoHandle, mapping: CpuMapping) -> Result<()>;

    /// Reserves `size` bytes of GPU virtual address space.
    fn va_range_alloc(&self, size: u64, alignment: u64) -> Result<(u64, VaHandle)>;
    fn va_range_free(&self, va: VaHandle) -> Result<()>;
    fn bo_va_op_raw(
        &self,
        bo: BoHandle,
        offset: u64,
        size: u64,
        addr: u64,
        flags: VmPageFlags,
        op: VaOp,
    ) -> Result<()>;

    fn bo_list_create(&self, bos: &[BoHandle]) -> Result<BoListHandle>;
    fn bo_list_destroy(&self, list: BoListHandle) -> Result<()>;

    /// Submits `req` and stores the assigned sequence number in it.
    fn cs_submit(&self, ctx: ContextHandle, req: &mut CsRequest) -> Result<()>;
    /// Returns whether the fence signalled before `timeout` ran out.
    fn cs_query_fence_status(&self, fence: &CsFence, timeout: Timeout) -> Result<bool>;
    /// Returns the expired flag and the index of the first signalled fence.
    fn cs_wait_fences(&self, fences: &[CsFence], wait_all: bool, timeout: Timeout) -> Result<(bool, u32)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_iteration_stops_at_first_gap() {
        let info = HwIpInfo {
            available_rings: 0b1011,
            ..Default::default()
        };
        assert_eq!(info.rings().collect::<Vec<_>>(), vec![0, 1]);
        let none = HwIpInfo::default();
        assert_eq!(none.rings().count(), 0);
    }

    #[test]
    fn timeout_sentinel() {
        assert_eq!(Timeout::Infinite.as_ns(), u64::MAX);
        assert_eq!(Timeout::from_ns(u64::MAX), Timeout::Infinite);
        assert_eq!(Timeout::Relative(Duration::from_millis(2)).as_ns(), 2_000_000);
    }

    #[test]
    fn mapping_views_share_memory() {
        let mut backing = vec![0u32; 4];
        let ptr = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let mut map = unsafe { CpuMapping::from_raw(ptr, 16, None) };
        map.dwords_mut()[1] = 0xdeadbeaf;
        assert_eq!(map.read_volatile(1), Some(0xdeadbeaf));
        map.write_volatile(3, 7).unwrap();
        assert_eq!(map.as_bytes()[12], 7);
        assert!(map.shared_dword(4).is_none());
        drop(map);
        assert_eq!(backing[3], 7);
    }
}
