//! Command-submission scenarios built from the IP block packet builders.
//!
//! Each helper allocates what it needs, submits, checks the GPU's write-back
//! and releases everything again, also when a step fails.

use tracing::{debug, info};

use crate::device::{
    ContextHandle, CsFence, Device, GemCreateFlags, GemDomain, IbFlags, IbInfo, Timeout,
};
use crate::error::{Error, Result};
use crate::ip_block::{IpBlockVersion, IpType};
use crate::memory::{get_bo_list, gpu_mem_alloc, gpu_mem_free, GpuBuffer};
use crate::pm4::*;
use crate::ring_context::RingContext;
use crate::submission::{self, wait_fence, wait_fences, Outcome, Tolerated};

/// Largest packet stream [`exec_cs_helper`] copies into its IB.
pub const MAX_IB_DW: usize = 1024;
const IB_SIZE: u64 = 4096;
const PM4_DW: usize = 256;

/// Result of a step followed by its cleanup; the first error wins.
pub(crate) fn first_error<T>(result: Result<T>, cleanup: Result<()>) -> Result<T> {
    let value = result?;
    cleanup?;
    Ok(value)
}

fn require_signaled(outcome: Outcome<bool>) -> Result<()> {
    match outcome {
        Outcome::Done(true) => Ok(()),
        _ => Err(Error::FenceNotExpired),
    }
}

/// Copies `ring.pm4` into a fresh GTT IB, submits it on `ring.ring_id`
/// with the ring's resources plus the IB, waits without a timeout and
/// frees the IB.
pub fn exec_cs_helper(device: &dyn Device, ip_type: IpType, ring: &mut RingContext) -> Result<()> {
    let dwords = ring.pm4_dw;
    if dwords > MAX_IB_DW {
        return Err(Error::CapacityExceeded {
            requested: dwords,
            capacity: MAX_IB_DW,
        });
    }
    let ctx = ring.context()?;
    let mut ib = GpuBuffer::alloc_and_map(device, IB_SIZE, 4096, GemDomain::GTT, GemCreateFlags::empty())?;
    let ib_handle = ib.bo;

    let mut run = || -> Result<()> {
        let src = ring.pm4.as_slice();
        let src = &src[..dwords.min(src.len())];
        ib.cpu_mut().dwords_mut()[..src.len()].copy_from_slice(src);

        ring.ib_info.ib_mc_address = ib.mc_address;
        ring.ib_info.size = dwords as u32;
        if ring.secure {
            ring.ib_info.flags |= IbFlags::SECURE;
        }

        let mut all = ring.resources().to_vec();
        all.push(ib_handle);
        let list = device.bo_list_create(&all)?;

        ring.request.ip_type = ip_type;
        ring.request.ip_instance = 0;
        ring.request.ring = ring.ring_id;
        ring.request.ibs = vec![ring.ib_info];
        ring.request.resources = Some(list);
        let submitted = device.cs_submit(ctx, &mut ring.request);
        let destroyed = device.bo_list_destroy(list);
        ring.request.resources = None;
        submitted?;
        destroyed?;

        let fence = ring.fence()?;
        require_signaled(wait_fence(device, &fence, Timeout::Infinite, Tolerated::empty())?)
    };
    let result = run();
    first_error(result, ib.unmap_and_free(device))
}

/// GTT creation flags the linear helpers alternate between.
const GTT_FLAGS: [GemCreateFlags; 2] = [GemCreateFlags::empty(), GemCreateFlags::CPU_GTT_USWC];

/// Has the engine write `deadbeaf` over 128 dwords, on every ring and with
/// both GTT flag variants.
///
/// The secure variant uses encrypted buffers and secure IBs. It re-runs the
/// compare-swap; on DMA the last run must leave the first dword unchanged.
pub fn write_linear_helper(device: &dyn Device, ip_block: &IpBlockVersion, secure: bool) -> Result<()> {
    const WRITE_LENGTH: u32 = 128;

    if secure && !device.query_gpu_info()?.is_tmz_supported() {
        return Err(Error::Unsupported {
            what: "secure submission",
        });
    }
    let funcs = ip_block.funcs.as_ref();
    let mut ring = RingContext::new(WRITE_LENGTH, PM4_DW)?;
    ring.secure = secure;
    let rings: Vec<u32> = ring.query_hw_ip_info(device, ip_block.ip_type)?.rings().collect();
    let mut gtt_flags = GTT_FLAGS;
    if secure {
        for flags in &mut gtt_flags {
            *flags |= GemCreateFlags::ENCRYPTED;
        }
    }
    ring.create(device)?;

    let size = WRITE_LENGTH as u64 * 4;
    let result = (|| -> Result<()> {
        for ring_id in rings {
            for flags in gtt_flags {
                let mut bo = GpuBuffer::alloc_and_map(device, size, 4096, GemDomain::GTT, flags)?;
                bo.memset(0, size as usize);
                ring.set_resources(&[bo.bo])?;
                ring.set_bo(bo);
                ring.ring_id = ring_id;
                funcs.write_linear(&mut ring)?;
                exec_cs_helper(device, ip_block.ip_type, &mut ring)?;

                if !secure {
                    funcs.compare(&ring, 1)?;
                } else if ip_block.ip_type == IpType::Gfx {
                    funcs.write_linear(&mut ring)?;
                    exec_cs_helper(device, ip_block.ip_type, &mut ring)?;
                } else if ip_block.ip_type == IpType::Dma {
                    ring.bo_cpu_origin = ring.bo_cpu()?.dwords()[0];
                    funcs.write_linear(&mut ring)?;
                    exec_cs_helper(device, ip_block.ip_type, &mut ring)?;

                    ring.bo_cpu_origin = ring.bo_cpu()?.dwords()[0];
                    funcs.write_linear(&mut ring)?;
                    exec_cs_helper(device, ip_block.ip_type, &mut ring)?;
                    let found = ring.bo_cpu()?.dwords()[0];
                    if found != ring.bo_cpu_origin {
                        return Err(Error::Mismatch {
                            index: 0,
                            expected: ring.bo_cpu_origin,
                            found,
                        });
                    }
                }
                ring.free_bos(device)?;
                debug!(ip = ?ip_block.ip_type, ring_id, ?flags, "write linear ok");
            }
        }
        Ok(())
    })();
    let destroyed = ring.destroy(device);
    result?;
    destroyed
}

/// Fills 1 MiB with `deadbeaf` through the IP's fill path and compares it.
pub fn const_fill_helper(device: &dyn Device, ip_block: &IpBlockVersion) -> Result<()> {
    const WRITE_LENGTH: u32 = 1024 * 1024;

    let funcs = ip_block.funcs.as_ref();
    let mut ring = RingContext::new(WRITE_LENGTH, PM4_DW)?;
    let rings: Vec<u32> = ring.query_hw_ip_info(device, ip_block.ip_type)?.rings().collect();
    ring.create(device)?;

    let result = (|| -> Result<()> {
        for ring_id in rings {
            for flags in GTT_FLAGS {
                let mut bo = GpuBuffer::alloc_and_map(device, WRITE_LENGTH as u64, 4096, GemDomain::GTT, flags)?;
                bo.memset(0, WRITE_LENGTH as usize);
                ring.set_resources(&[bo.bo])?;
                ring.set_bo(bo);
                ring.ring_id = ring_id;
                funcs.const_fill(&mut ring)?;
                exec_cs_helper(device, ip_block.ip_type, &mut ring)?;
                funcs.compare(&ring, 4)?;
                ring.free_bos(device)?;
            }
        }
        Ok(())
    })();
    let destroyed = ring.destroy(device);
    result?;
    destroyed
}

/// Copies 1 KiB of the fill pattern between two GTT buffers for every pair
/// of GTT flag variants and compares the destination.
pub fn copy_linear_helper(device: &dyn Device, ip_block: &IpBlockVersion) -> Result<()> {
    const WRITE_LENGTH: u32 = 1024;

    let funcs = ip_block.funcs.as_ref();
    let pattern = funcs.params().pattern as u8;
    let mut ring = RingContext::new(WRITE_LENGTH, PM4_DW)?;
    let rings: Vec<u32> = ring.query_hw_ip_info(device, ip_block.ip_type)?.rings().collect();
    ring.create(device)?;

    let size = WRITE_LENGTH as u64;
    let result = (|| -> Result<()> {
        for ring_id in rings {
            for src_flags in GTT_FLAGS {
                for dst_flags in GTT_FLAGS {
                    let mut src = GpuBuffer::alloc_and_map(device, size, 4096, GemDomain::GTT, src_flags)?;
                    src.memset(pattern, size as usize);
                    let mut dst = match GpuBuffer::alloc_and_map(device, size, 4096, GemDomain::GTT, dst_flags) {
                        Ok(dst) => dst,
                        Err(e) => {
                            src.unmap_and_free(device)?;
                            return Err(e);
                        }
                    };
                    dst.memset(0, size as usize);
                    ring.set_resources(&[src.bo, dst.bo])?;
                    ring.set_bo(src);
                    ring.set_bo2(dst);
                    ring.ring_id = ring_id;
                    funcs.copy_linear(&mut ring)?;
                    exec_cs_helper(device, ip_block.ip_type, &mut ring)?;
                    funcs.compare_pattern(&ring, 4)?;
                    ring.free_bos(device)?;
                }
            }
        }
        Ok(())
    })();
    let destroyed = ring.destroy(device);
    result?;
    destroyed
}

/// Allocates and frees visible VRAM, invisible VRAM, cacheable GTT and
/// USWC GTT.
pub fn memory_alloc(device: &dyn Device) -> Result<()> {
    let cases = [
        (GemDomain::VRAM, GemCreateFlags::CPU_ACCESS_REQUIRED),
        (GemDomain::VRAM, GemCreateFlags::NO_CPU_ACCESS),
        (GemDomain::GTT, GemCreateFlags::empty()),
        (GemDomain::GTT, GemCreateFlags::CPU_GTT_USWC),
    ];
    for (heap, flags) in cases {
        let alloc = gpu_mem_alloc(device, 4096, 4096, heap, flags)?;
        gpu_mem_free(device, alloc)?;
    }
    Ok(())
}

/// Submits a 16-dword NOP IB on every compute ring.
pub fn compute_nop(device: &dyn Device) -> Result<()> {
    let info = device.query_hw_ip_info(IpType::Compute, 0)?;
    let ctx = device.cs_ctx_create()?;
    let result = (|| -> Result<()> {
        for ring in info.rings() {
            let mut ib = GpuBuffer::alloc_and_map(device, IB_SIZE, 4096, GemDomain::GTT, GemCreateFlags::empty())?;
            let mut run = || -> Result<()> {
                let words = ib.cpu_mut().dwords_mut();
                words[..16].fill(0);
                words[0] = packet3(PACKET3_NOP, 14);
                let list = get_bo_list(device, ib.bo, None)?;
                let ibs = [IbInfo {
                    flags: IbFlags::empty(),
                    ib_mc_address: ib.mc_address,
                    size: 16,
                }];
                let fence = submission::submit(device, ctx, IpType::Compute, ring, &ibs, Some(list))?;
                let waited = wait_fence(device, &fence, Timeout::Infinite, Tolerated::empty());
                device.bo_list_destroy(list)?;
                require_signaled(waited?)
            };
            let result = run();
            first_error(result, ib.unmap_and_free(device))?;
        }
        Ok(())
    })();
    let freed = device.cs_ctx_free(ctx);
    result?;
    freed
}

const CE_PREAMBLE: [u32; 4] = [
    packet3(PACKET3_SET_CE_DE_COUNTERS, 0),
    0,
    packet3(PACKET3_INCREMENT_CE_COUNTER, 0),
    1,
];
const DE_WAIT: [u32; 2] = [packet3(PACKET3_WAIT_ON_CE_COUNTER, 0), 1];

/// Submits a CE IB and a DE IB from two buffers, or from one shared
/// buffer, on the GFX ring and returns the fence.
fn submit_ce_de(device: &dyn Device, ctx: ContextHandle, ce: &mut GpuBuffer, de: Option<&mut GpuBuffer>) -> Result<CsFence> {
    ce.cpu_mut().dwords_mut()[..4].copy_from_slice(&CE_PREAMBLE);
    let ce_ib = IbInfo {
        flags: IbFlags::CE,
        ib_mc_address: ce.mc_address,
        size: 4,
    };
    let (de_ib, list) = match de {
        Some(de) => {
            de.cpu_mut().dwords_mut()[..2].copy_from_slice(&DE_WAIT);
            let ib = IbInfo {
                flags: IbFlags::empty(),
                ib_mc_address: de.mc_address,
                size: 2,
            };
            (ib, get_bo_list(device, de.bo, Some(ce.bo))?)
        }
        None => {
            ce.cpu_mut().dwords_mut()[4..6].copy_from_slice(&DE_WAIT);
            let ib = IbInfo {
                flags: IbFlags::empty(),
                ib_mc_address: ce.mc_address + 16,
                size: 2,
            };
            (ib, get_bo_list(device, ce.bo, None)?)
        }
    };
    let fence = submission::submit(device, ctx, IpType::Gfx, 0, &[ce_ib, de_ib], Some(list));
    device.bo_list_destroy(list)?;
    fence
}

fn gfx_ce_de(device: &dyn Device, shared: bool) -> Result<()> {
    let ctx = device.cs_ctx_create()?;
    let result = (|| -> Result<()> {
        let mut ce = GpuBuffer::alloc_and_map(device, IB_SIZE, 4096, GemDomain::GTT, GemCreateFlags::empty())?;
        let mut de = if shared {
            None
        } else {
            match GpuBuffer::alloc_and_map(device, IB_SIZE, 4096, GemDomain::GTT, GemCreateFlags::empty()) {
                Ok(de) => Some(de),
                Err(e) => {
                    ce.unmap_and_free(device)?;
                    return Err(e);
                }
            }
        };
        let result = submit_ce_de(device, ctx, &mut ce, de.as_mut())
            .and_then(|fence| wait_fence(device, &fence, Timeout::Infinite, Tolerated::empty()))
            .and_then(require_signaled);
        let result = match de {
            Some(de) => first_error(result, de.unmap_and_free(device)),
            None => result,
        };
        first_error(result, ce.unmap_and_free(device))
    })();
    let freed = device.cs_ctx_free(ctx);
    result?;
    freed
}

/// CE and DE IBs in separate buffers.
pub fn gfx_separate_ibs(device: &dyn Device) -> Result<()> {
    gfx_ce_de(device, false)
}

/// CE and DE IBs sharing one buffer.
pub fn gfx_shared_ib(device: &dyn Device) -> Result<()> {
    gfx_ce_de(device, true)
}

/// Two CE/DE submissions waited together, for all of them or for any.
pub fn multi_fence(device: &dyn Device, wait_all: bool) -> Result<()> {
    let ctx = device.cs_ctx_create()?;
    let result = (|| -> Result<()> {
        let mut ce = GpuBuffer::alloc_and_map(device, IB_SIZE, 4096, GemDomain::GTT, GemCreateFlags::empty())?;
        let mut run = || -> Result<()> {
            let first = submit_ce_de(device, ctx, &mut ce, None)?;
            let second = submit_ce_de(device, ctx, &mut ce, None)?;
            let waited = wait_fences(device, &[first, second], wait_all, Timeout::Infinite, Tolerated::empty())?;
            match waited {
                Outcome::Done((true, first_signaled)) => {
                    debug!(wait_all, first_signaled, "multi fence wait");
                    Ok(())
                }
                _ => Err(Error::FenceNotExpired),
            }
        };
        let result = run();
        first_error(result, ce.unmap_and_free(device))
    })();
    let freed = device.cs_ctx_free(ctx);
    result?;
    freed
}

/// Value the first context writes in [`sync_dependency`].
pub const SYNC_DEPENDENCY_VALUE: u32 = 0x5a5a_0042;

/// Two contexts share a data buffer. The first writes a value with
/// WRITE_DATA; the second copies it elsewhere with DMA_DATA and declares a
/// dependency on the first submission's fence. Once the second fence
/// signals the copy must hold the value, whatever order the device would
/// otherwise have picked.
pub fn sync_dependency(device: &dyn Device) -> Result<()> {
    const SRC_DW: u64 = 256;
    const DST_DW: u64 = 512;

    let ctx = [device.cs_ctx_create()?, device.cs_ctx_create()?];
    let result = (|| -> Result<()> {
        let mut data = GpuBuffer::alloc_and_map(device, 8192, 4096, GemDomain::GTT, GemCreateFlags::empty())?;
        let mut ib = match GpuBuffer::alloc_and_map(device, IB_SIZE, 4096, GemDomain::GTT, GemCreateFlags::empty()) {
            Ok(ib) => ib,
            Err(e) => {
                data.unmap_and_free(device)?;
                return Err(e);
            }
        };
        let mut run = || -> Result<()> {
            data.memset(0, 8192);
            let src = data.mc_address + SRC_DW * 4;
            let dst = data.mc_address + DST_DW * 4;
            let writer = [
                packet3(PACKET3_WRITE_DATA, 3),
                write_data_dst_sel(WRITE_DATA_DST_SEL_MEM) | WRITE_DATA_WR_CONFIRM,
                src as u32,
                (src >> 32) as u32,
                SYNC_DEPENDENCY_VALUE,
            ];
            let copier = [
                packet3(PACKET3_DMA_DATA, 5),
                dma_data_engine(0) | dma_data_dst_sel(0) | dma_data_src_sel(0) | DMA_DATA_CP_SYNC,
                src as u32,
                (src >> 32) as u32,
                dst as u32,
                (dst >> 32) as u32,
                4,
            ];
            let words = ib.cpu_mut().dwords_mut();
            words[..5].copy_from_slice(&writer);
            words[8..15].copy_from_slice(&copier);

            let list = get_bo_list(device, ib.bo, Some(data.bo))?;
            let writer_ib = IbInfo {
                flags: IbFlags::empty(),
                ib_mc_address: ib.mc_address,
                size: writer.len() as u32,
            };
            let copier_ib = IbInfo {
                flags: IbFlags::empty(),
                ib_mc_address: ib.mc_address + 32,
                size: copier.len() as u32,
            };

            let submitted = (|| -> Result<CsFence> {
                let mut first = submission::Submission::new(ctx[0], IpType::Gfx, 0).ib(writer_ib).resources(list);
                first.submit(device)?;
                let dependency = first.fence().ok_or(Error::InvalidArgument("first submission has no fence"))?;
                let mut second = submission::Submission::new(ctx[1], IpType::Gfx, 0)
                    .ib(copier_ib)
                    .resources(list)
                    .depends_on(dependency);
                second.submit(device)?;
                second.fence().ok_or(Error::InvalidArgument("second submission has no fence"))
            })();
            let destroyed = device.bo_list_destroy(list);
            let fence = submitted?;
            destroyed?;

            require_signaled(wait_fence(device, &fence, Timeout::Infinite, Tolerated::empty())?)?;
            let found = data.cpu().read_volatile(DST_DW as usize).unwrap_or(0);
            if found != SYNC_DEPENDENCY_VALUE {
                return Err(Error::Mismatch {
                    index: DST_DW as usize,
                    expected: SYNC_DEPENDENCY_VALUE,
                    found,
                });
            }
            info!("sync dependency honored");
            Ok(())
        };
        let result = run();
        let result = first_error(result, ib.unmap_and_free(device));
        first_error(result, data.unmap_and_free(device))
    })();
    let freed = device.cs_ctx_free(ctx[0]);
    let result = first_error(result, freed);
    first_error(result, device.cs_ctx_free(ctx[1]))
}

/// Runs the GFX, compute or SDMA command-submission group for `ip_block`.
pub fn command_submission(device: &dyn Device, ip_block: &IpBlockVersion) -> Result<()> {
    write_linear_helper(device, ip_block, false)?;
    const_fill_helper(device, ip_block)?;
    copy_linear_helper(device, ip_block)?;
    match ip_block.ip_type {
        IpType::Gfx => {
            gfx_separate_ibs(device)?;
            gfx_shared_ib(device)?;
        }
        IpType::Compute => compute_nop(device)?,
        _ => {}
    }
    Ok(())
}
