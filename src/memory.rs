//! Buffer-object lifecycle: allocate, map into the GPU VA space, map for
//! the CPU, and tear all of it down again in reverse order.

use nix::unistd::{sysconf, SysconfVar};
use tracing::{debug, warn};

use crate::bit::align_up;
use crate::command_submission::first_error;
use crate::device::{
    BoAllocRequest, BoHandle, BoListHandle, CpuMapping, Device, GemCreateFlags, GemDomain, VaHandle, VaOp,
    VmPageFlags,
};
use crate::error::Result;

/// A buffer object with its GPU address range and CPU mapping. The four
/// parts are released together by [`GpuBuffer::unmap_and_free`].
pub struct GpuBuffer {
    pub bo: BoHandle,
    pub mc_address: u64,
    pub va_handle: VaHandle,
    /// Size requested by the caller.
    pub size: u64,
    /// Length of the GPU VA mapping; larger than `size` for raw mappings.
    map_size: u64,
    cpu: CpuMapping,
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("bo", &self.bo)
            .field("mc_address", &format_args!("{:#x}", self.mc_address))
            .field("size", &self.size)
            .finish()
    }
}

impl GpuBuffer {
    /// Allocates `size` bytes in `heap` and maps them for GPU and CPU.
    ///
    /// On failure every step already taken is undone, last step first, and
    /// the failing step's error is returned.
    pub fn alloc_and_map(
        device: &dyn Device,
        size: u64,
        alignment: u64,
        heap: GemDomain,
        flags: GemCreateFlags,
    ) -> Result<Self> {
        Self::alloc_and_map_inner(device, size, alignment, heap, flags, size, VmPageFlags::empty())
    }

    /// Like [`alloc_and_map`](Self::alloc_and_map) but maps a host-page
    /// aligned length with explicit page flags on top of read, write and
    /// execute.
    pub fn alloc_and_map_raw(
        device: &dyn Device,
        size: u64,
        alignment: u64,
        heap: GemDomain,
        alloc_flags: GemCreateFlags,
        mapping_flags: VmPageFlags,
    ) -> Result<Self> {
        let map_size = align_up(size, host_page_size());
        let flags = VmPageFlags::READABLE | VmPageFlags::WRITEABLE | VmPageFlags::EXECUTABLE | mapping_flags;
        Self::alloc_and_map_inner(device, size, alignment, heap, alloc_flags, map_size, flags)
    }

    fn alloc_and_map_inner(
        device: &dyn Device,
        size: u64,
        alignment: u64,
        heap: GemDomain,
        flags: GemCreateFlags,
        map_size: u64,
        page_flags: VmPageFlags,
    ) -> Result<Self> {
        let bo = device.bo_alloc(&BoAllocRequest {
            alloc_size: size,
            phys_alignment: alignment,
            preferred_heap: heap,
            flags,
        })?;

        let (mc_address, va_handle) = match device.va_range_alloc(size, alignment) {
            Ok(va) => va,
            Err(e) => {
                unwind(device.bo_free(bo));
                return Err(e);
            }
        };

        if let Err(e) = device.bo_va_op_raw(bo, 0, map_size, mc_address, page_flags, VaOp::Map) {
            unwind(device.va_range_free(va_handle));
            unwind(device.bo_free(bo));
            return Err(e);
        }

        let cpu = match device.bo_cpu_map(bo) {
            Ok(cpu) => cpu,
            Err(e) => {
                unwind(device.bo_va_op_raw(bo, 0, map_size, mc_address, page_flags, VaOp::Unmap));
                unwind(device.va_range_free(va_handle));
                unwind(device.bo_free(bo));
                return Err(e);
            }
        };

        debug!(?bo, mc_address = %format_args!("{:#x}", mc_address), size, ?heap, "bo mapped");
        Ok(GpuBuffer {
            bo,
            mc_address,
            va_handle,
            size,
            map_size,
            cpu,
        })
    }

    pub fn cpu(&self) -> &CpuMapping {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuMapping {
        &mut self.cpu
    }

    /// Fills the first `len` bytes (clamped to the mapping) with `value`.
    pub fn memset(&mut self, value: u8, len: usize) {
        let bytes = self.cpu.as_bytes_mut();
        let len = len.min(bytes.len());
        bytes[..len].fill(value);
    }

    /// CPU unmap, GPU VA unmap, VA range free, BO free, in that order. Every
    /// step runs even after a failure; the first error is returned.
    pub fn unmap_and_free(self, device: &dyn Device) -> Result<()> {
        let GpuBuffer {
            bo,
            mc_address,
            va_handle,
            map_size,
            cpu,
            ..
        } = self;
        let unmapped = device.bo_cpu_unmap(bo, cpu);
        let unmapped = first_error(
            unmapped,
            device.bo_va_op_raw(bo, 0, map_size, mc_address, VmPageFlags::empty(), VaOp::Unmap),
        );
        let freed = first_error(unmapped, device.va_range_free(va_handle));
        first_error(freed, device.bo_free(bo))
    }
}

pub(crate) fn unwind(r: Result<()>) {
    if let Err(e) = r {
        warn!(error = %e, "unwind step failed");
    }
}

fn host_page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => 4096,
    }
}

/// A GPU-mapped buffer without a persistent CPU mapping.
#[derive(Debug, Clone, Copy)]
pub struct GpuAllocation {
    pub bo: BoHandle,
    pub mc_address: u64,
    pub va_handle: VaHandle,
    pub size: u64,
}

/// Allocates and GPU-maps a buffer; the CPU view is left to the caller.
pub fn gpu_mem_alloc(
    device: &dyn Device,
    size: u64,
    alignment: u64,
    heap: GemDomain,
    flags: GemCreateFlags,
) -> Result<GpuAllocation> {
    let bo = device.bo_alloc(&BoAllocRequest {
        alloc_size: size,
        phys_alignment: alignment,
        preferred_heap: heap,
        flags,
    })?;
    let (mc_address, va_handle) = match device.va_range_alloc(size, alignment) {
        Ok(va) => va,
        Err(e) => {
            unwind(device.bo_free(bo));
            return Err(e);
        }
    };
    if let Err(e) = device.bo_va_op_raw(bo, 0, size, mc_address, VmPageFlags::empty(), VaOp::Map) {
        unwind(device.va_range_free(va_handle));
        unwind(device.bo_free(bo));
        return Err(e);
    }
    Ok(GpuAllocation {
        bo,
        mc_address,
        va_handle,
        size,
    })
}

pub fn gpu_mem_free(device: &dyn Device, alloc: GpuAllocation) -> Result<()> {
    device.bo_va_op_raw(
        alloc.bo,
        0,
        alloc.size,
        alloc.mc_address,
        VmPageFlags::empty(),
        VaOp::Unmap,
    )?;
    device.va_range_free(alloc.va_handle)?;
    device.bo_free(alloc.bo)
}

/// Registers one or two buffers into a kernel residency list.
pub fn get_bo_list(device: &dyn Device, bo1: BoHandle, bo2: Option<BoHandle>) -> Result<BoListHandle> {
    match bo2 {
        Some(bo2) => device.bo_list_create(&[bo1, bo2]),
        None => device.bo_list_create(&[bo1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::sim::{SimCall, SimDevice};
    use nix::errno::Errno;

    #[test]
    fn teardown_runs_in_reverse_creation_order() {
        let dev = SimDevice::new(SimConfig::default());
        let mut buf = GpuBuffer::alloc_and_map(&dev, 4096, 4096, GemDomain::GTT, GemCreateFlags::empty()).unwrap();
        buf.memset(0x5a, 16);
        assert_eq!(buf.cpu().as_bytes()[15], 0x5a);
        assert!(buf.mc_address >= 1 << 32);

        dev.clear_call_log();
        buf.unmap_and_free(&dev).unwrap();
        assert_eq!(
            dev.call_log(),
            vec![SimCall::BoCpuUnmap, SimCall::VaUnmap, SimCall::VaRangeFree, SimCall::BoFree]
        );
        assert_eq!(dev.live_bo_count(), 0);
    }

    #[test]
    fn teardown_keeps_going_after_a_failed_step() {
        let dev = SimDevice::new(SimConfig::default());
        let buf = GpuBuffer::alloc_and_map(&dev, 4096, 4096, GemDomain::GTT, GemCreateFlags::empty()).unwrap();
        dev.clear_call_log();
        dev.inject_failure(SimCall::BoCpuUnmap, 1, Errno::EIO);
        let err = buf.unmap_and_free(&dev).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EIO));
        assert_eq!(
            dev.call_log(),
            vec![SimCall::BoCpuUnmap, SimCall::VaUnmap, SimCall::VaRangeFree, SimCall::BoFree]
        );
        assert_eq!(dev.live_va_count(), 0);
    }

    #[test]
    fn failed_cpu_map_unwinds_everything() {
        let dev = SimDevice::new(SimConfig::default());
        dev.inject_failure(SimCall::BoCpuMap, 1, Errno::ENOMEM);
        let err = GpuBuffer::alloc_and_map(&dev, 4096, 4096, GemDomain::GTT, GemCreateFlags::empty()).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ENOMEM));
        assert_eq!(
            dev.call_log(),
            vec![
                SimCall::BoAlloc,
                SimCall::VaRangeAlloc,
                SimCall::VaMap,
                SimCall::BoCpuMap,
                SimCall::VaUnmap,
                SimCall::VaRangeFree,
                SimCall::BoFree,
            ]
        );
        assert_eq!(dev.live_bo_count(), 0);
        assert_eq!(dev.live_va_count(), 0);
    }

    #[test]
    fn failed_va_alloc_frees_only_the_bo() {
        let dev = SimDevice::new(SimConfig::default());
        dev.inject_failure(SimCall::VaRangeAlloc, 1, Errno::ENOSPC);
        let err = GpuBuffer::alloc_and_map(&dev, 4096, 4096, GemDomain::VRAM, GemCreateFlags::empty()).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ENOSPC));
        assert_eq!(
            dev.call_log(),
            vec![SimCall::BoAlloc, SimCall::VaRangeAlloc, SimCall::BoFree]
        );
    }

    #[test]
    fn raw_mapping_covers_whole_pages() {
        let dev = SimDevice::new(SimConfig::default());
        let buf = GpuBuffer::alloc_and_map_raw(
            &dev,
            100,
            4096,
            GemDomain::GTT,
            GemCreateFlags::empty(),
            VmPageFlags::MTYPE_UC,
        )
        .unwrap();
        assert_eq!(buf.map_size % host_page_size(), 0);
        assert!(buf.map_size >= 100);
        buf.unmap_and_free(&dev).unwrap();
    }

    #[test]
    fn bo_list_takes_one_or_two() {
        let dev = SimDevice::new(SimConfig::default());
        let a = gpu_mem_alloc(&dev, 4096, 4096, GemDomain::GTT, GemCreateFlags::empty()).unwrap();
        let b = gpu_mem_alloc(&dev, 4096, 4096, GemDomain::VRAM, GemCreateFlags::empty()).unwrap();
        let one = get_bo_list(&dev, a.bo, None).unwrap();
        let two = get_bo_list(&dev, a.bo, Some(b.bo)).unwrap();
        assert_ne!(one, two);
        dev.bo_list_destroy(one).unwrap();
        dev.bo_list_destroy(two).unwrap();
        gpu_mem_free(&dev, a).unwrap();
        gpu_mem_free(&dev, b).unwrap();
        assert_eq!(dev.live_bo_count(), 0);
    }
}
