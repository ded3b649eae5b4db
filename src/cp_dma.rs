//! CP DMA: the command processor's own copy engine, driven by a single
//! DMA_DATA packet on the GFX or compute ring.

use tracing::{debug, info};

use crate::command_submission::first_error;
use crate::device::{BoHandle, ContextHandle, Device, GemCreateFlags, GemDomain, GpuInfo, IbInfo, Timeout};
use crate::error::{Error, Result};
use crate::family::identify_chip;
use crate::ip_block::IpType;
use crate::memory::{gpu_mem_alloc, gpu_mem_free, unwind, GpuAllocation, GpuBuffer};
use crate::pm4::*;
use crate::submission::{self, wait_fence, Outcome, Tolerated};

/// Bytes copied; one past a page so the tail is exercised.
pub const DMA_SIZE: u32 = 4097;
pub const DMA_DATA_BYTE: u8 = 0xea;
/// The byte count field is 26 bits wide.
pub const DMA_SIZE_MAX: u32 = 1 << 26;
const IB_SIZE: u64 = 4096;

/// The eight-dword IB: DMA_DATA memory to memory with CP sync, then a NOP.
pub fn cp_dma_cmd(src: u64, dst: u64, size: u32) -> [u32; 8] {
    [
        packet3(PACKET3_DMA_DATA, 5),
        dma_data_engine(0) | dma_data_src_sel(0) | dma_data_dst_sel(0) | DMA_DATA_CP_SYNC,
        src as u32,
        (src >> 32) as u32,
        dst as u32,
        (dst >> 32) as u32,
        size & (DMA_SIZE_MAX - 1),
        GFX_COMPUTE_NOP,
    ]
}

/// Whether the chip runs the CP DMA copy at all. Every identified chip
/// does; unknown parts are skipped.
pub fn cp_dma_misc_is_supported(info: &GpuInfo) -> bool {
    identify_chip(info.family_id, info.chip_external_rev).is_some()
}

/// Creates, submits and destroys the bo list, then waits for the fence.
fn submit_and_sync(
    device: &dyn Device,
    ip_type: IpType,
    context: ContextHandle,
    ib: IbInfo,
    resources: &[BoHandle],
) -> Result<()> {
    let list = device.bo_list_create(resources)?;
    let fence = submission::submit(device, context, ip_type, 0, &[ib], Some(list));
    let fence = first_error(fence, device.bo_list_destroy(list))?;
    match wait_fence(device, &fence, Timeout::Infinite, Tolerated::empty())? {
        Outcome::Done(true) => Ok(()),
        _ => Err(Error::FenceNotExpired),
    }
}

fn alloc_filled(device: &dyn Device, heap: GemDomain, fill: u8) -> Result<GpuAllocation> {
    let alloc = gpu_mem_alloc(
        device,
        DMA_SIZE as u64,
        4096,
        heap,
        GemCreateFlags::CPU_ACCESS_REQUIRED,
    )?;
    let filled = device.bo_cpu_map(alloc.bo).and_then(|mut cpu| {
        cpu.as_bytes_mut()[..DMA_SIZE as usize].fill(fill);
        device.bo_cpu_unmap(alloc.bo, cpu)
    });
    match filled {
        Ok(()) => Ok(alloc),
        Err(e) => {
            unwind(gpu_mem_free(device, alloc));
            Err(e)
        }
    }
}

fn cp_dma(device: &dyn Device, ip_type: IpType, context: ContextHandle, ib: &mut GpuBuffer, src_heap: GemDomain, dst_heap: GemDomain) -> Result<()> {
    let src = alloc_filled(device, src_heap, DMA_DATA_BYTE)?;
    let dst = match alloc_filled(device, dst_heap, 0) {
        Ok(dst) => dst,
        Err(e) => {
            unwind(gpu_mem_free(device, src));
            return Err(e);
        }
    };

    let copied = (|| -> Result<()> {
        let cmd = cp_dma_cmd(src.mc_address, dst.mc_address, DMA_SIZE);
        ib.cpu_mut().dwords_mut()[..cmd.len()].copy_from_slice(&cmd);
        let info = IbInfo {
            ib_mc_address: ib.mc_address,
            size: cmd.len() as u32,
            ..Default::default()
        };
        submit_and_sync(device, ip_type, context, info, &[src.bo, dst.bo, ib.bo])?;

        let cpu = device.bo_cpu_map(dst.bo)?;
        let found = cpu.as_bytes()[..DMA_SIZE as usize].iter().position(|&b| b != DMA_DATA_BYTE);
        let byte = found.map(|i| cpu.as_bytes()[i]);
        device.bo_cpu_unmap(dst.bo, cpu)?;
        if let (Some(index), Some(byte)) = (found, byte) {
            return Err(Error::Mismatch {
                index,
                expected: DMA_DATA_BYTE as u32,
                found: byte as u32,
            });
        }
        Ok(())
    })();
    let freed = first_error(copied, gpu_mem_free(device, src));
    first_error(freed, gpu_mem_free(device, dst))
}

/// Copies [`DMA_SIZE`] bytes from a `src_heap` buffer to a `dst_heap`
/// buffer with CP DMA on ring 0 of `ip_type` and checks every byte.
pub fn cp_dma_generic(device: &dyn Device, ip_type: IpType, src_heap: GemDomain, dst_heap: GemDomain) -> Result<()> {
    let context = device.cs_ctx_create()?;
    let result = GpuBuffer::alloc_and_map(device, IB_SIZE, 4096, GemDomain::GTT, GemCreateFlags::empty())
        .and_then(|mut ib| {
            let copied = cp_dma(device, ip_type, context, &mut ib, src_heap, dst_heap);
            first_error(copied, ib.unmap_and_free(device))
        });
    debug!(ip = ?ip_type, ?src_heap, ?dst_heap, ok = result.is_ok(), "cp dma");
    first_error(result, device.cs_ctx_free(context))
}

/// Every GTT/VRAM combination on `ip_type`.
pub fn cp_dma_all_heaps(device: &dyn Device, ip_type: IpType) -> Result<()> {
    let info = device.query_gpu_info()?;
    if !cp_dma_misc_is_supported(&info) {
        info!(family = info.family_id, "cp dma not supported");
        return Ok(());
    }
    for src in [GemDomain::GTT, GemDomain::VRAM] {
        for dst in [GemDomain::GTT, GemDomain::VRAM] {
            cp_dma_generic(device, ip_type, src, dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChipPreset, SimConfig};
    use crate::sim::{SimCall, SimDevice};

    #[test]
    fn packet_matches_the_hardware_layout() {
        let cmd = cp_dma_cmd(0x1_0000_2000, 0x3_0000_4000, DMA_SIZE);
        assert_eq!(
            cmd,
            [0xc005_5000, 0x8000_0000, 0x2000, 1, 0x4000, 3, 4097, 0xffff_1000]
        );
        assert_eq!(cp_dma_cmd(0, 0, DMA_SIZE_MAX + 5)[6], 5);
    }

    #[test]
    fn copies_between_every_heap_pair() {
        for chip in [ChipPreset::Polaris11, ChipPreset::Vega10, ChipPreset::Navi10] {
            let dev = SimDevice::new(SimConfig::preset(chip));
            for ip in [IpType::Gfx, IpType::Compute] {
                cp_dma_all_heaps(&dev, ip).unwrap();
            }
            assert_eq!(dev.live_bo_count(), 0);
            assert_eq!(dev.live_va_count(), 0);
        }
    }

    #[test]
    fn failed_submit_releases_everything() {
        let dev = SimDevice::new(SimConfig::preset(ChipPreset::Vega10));
        dev.inject_failure(SimCall::CsSubmit, 1, nix::errno::Errno::ENOMEM);
        let err = cp_dma_generic(&dev, IpType::Gfx, GemDomain::GTT, GemDomain::VRAM).unwrap_err();
        assert_eq!(err.errno(), Some(nix::errno::Errno::ENOMEM));
        assert_eq!(dev.live_bo_count(), 0);
        assert_eq!(dev.live_va_count(), 0);
    }

    #[test]
    fn unknown_chips_are_not_supported() {
        let info = GpuInfo {
            family_id: 7,
            ..Default::default()
        };
        assert!(!cp_dma_misc_is_supported(&info));
    }
}
