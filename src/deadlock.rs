//! Scenarios that wedge a ring on purpose and check the kernel recovers:
//! a poll on memory that only the CPU will change, and writes to places
//! a user IB must not touch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, info, warn};

use crate::cmd_base::CmdBase;
use crate::command_submission::first_error;
use crate::device::{BoListHandle, ContextHandle, CsFence, Device, GemCreateFlags, GemDomain, IbInfo, Timeout, VmPageFlags};
use crate::error::{Error, Result};
use crate::ip_block::IpType;
use crate::memory::{get_bo_list, unwind, GpuBuffer};
use crate::pm4::*;
use crate::registers::MM_VM_CONTEXT0_PAGE_TABLE_BASE_ADDR;
use crate::sdma::{sdma_pkt_header_op, SDMA_OP_POLL_REGMEM};
use crate::submission::{self, wait_fence, Outcome, Tolerated};

/// Submissions the wait-memory flood stops at if the kernel never cancels.
pub const MAX_JOB_COUNT: u32 = 200;
/// Dword of the IB buffer the poll waits on.
pub const MEMORY_OFFSET: usize = 256;
const CMD_SIZE: u64 = 4096;
const IB_DW: usize = 16;

/// Address a user IB has no mapping for.
const UNMAPPED_ADDRESS: u32 = 0xdead_bee0;

/// A context plus one UC-mapped GTT buffer holding the IB, listed for
/// residency.
struct IbJob<'d> {
    device: &'d dyn Device,
    context: ContextHandle,
    ib: GpuBuffer,
    list: BoListHandle,
}

impl<'d> IbJob<'d> {
    fn new(device: &'d dyn Device, mapping_flags: VmPageFlags) -> Result<Self> {
        let context = device.cs_ctx_create()?;
        let ib = match GpuBuffer::alloc_and_map_raw(
            device,
            CMD_SIZE,
            CMD_SIZE,
            GemDomain::GTT,
            GemCreateFlags::empty(),
            mapping_flags,
        ) {
            Ok(ib) => ib,
            Err(e) => {
                unwind(device.cs_ctx_free(context));
                return Err(e);
            }
        };
        let list = match get_bo_list(device, ib.bo, None) {
            Ok(list) => list,
            Err(e) => {
                unwind(ib.unmap_and_free(device));
                unwind(device.cs_ctx_free(context));
                return Err(e);
            }
        };
        Ok(IbJob {
            device,
            context,
            ib,
            list,
        })
    }

    /// Builds the IB with `build`, then pads it with NOPs to 16 dwords.
    fn write(&mut self, build: impl FnOnce(&mut CmdBase<'_>) -> Result<()>) -> Result<IbInfo> {
        let ib_mc_address = self.ib.mc_address;
        let mut base = CmdBase::new();
        base.attach(self.ib.cpu_mut().dwords_mut())?;
        build(&mut base)?;
        let pad = IB_DW.saturating_sub(base.cdw());
        base.emit_repeat(GFX_COMPUTE_NOP, pad)?;
        Ok(IbInfo {
            ib_mc_address,
            size: base.cdw() as u32,
            ..Default::default()
        })
    }

    fn release(self) -> Result<()> {
        let destroyed = self.device.bo_list_destroy(self.list);
        let freed = first_error(destroyed, self.ib.unmap_and_free(self.device));
        first_error(freed, self.device.cs_ctx_free(self.context))
    }
}

/// Emits a poll that waits until the dword at `addr` differs from zero.
fn emit_wait_memory(base: &mut CmdBase<'_>, ip_type: IpType, addr: u64) -> Result<()> {
    if ip_type == IpType::Dma {
        // memory space, function "not equal"
        base.emit(sdma_pkt_header_op(SDMA_OP_POLL_REGMEM) | (4 << 28) | (1 << 31))?;
    } else {
        base.emit(packet3(PACKET3_WAIT_REG_MEM, 5))?;
        base.emit(
            wait_reg_mem_mem_space(1) | wait_reg_mem_function(WAIT_REG_MEM_FUNC_NOT_EQUAL) | wait_reg_mem_engine(0),
        )?;
    }
    base.emit_slice(&[
        (addr as u32) & !3,
        (addr >> 32) as u32,
        0,
        0xffff_ffff,
        4,
    ])
}

/// Keeps submitting an IB that polls memory nobody writes until the kernel
/// cancels the context or [`MAX_JOB_COUNT`] submissions went in. The last
/// fence is waited, then a helper thread writes the polled dword.
///
/// Returns how many submissions were made, including a canceled one.
pub fn wait_memory_helper(device: &dyn Device, ip_type: IpType) -> Result<u32> {
    let mut job = IbJob::new(device, VmPageFlags::MTYPE_UC)?;
    let result = flood_wait_memory(device, ip_type, &mut job);
    first_error(result, job.release())
}

fn flood_wait_memory(device: &dyn Device, ip_type: IpType, job: &mut IbJob<'_>) -> Result<u32> {
    let addr = job.ib.mc_address + MEMORY_OFFSET as u64 * 4;
    let ib = job.write(|base| emit_wait_memory(base, ip_type, addr))?;
    let (context, list) = (job.context, job.list);

    let polled = job
        .ib
        .cpu()
        .shared_dword(MEMORY_OFFSET)
        .ok_or(Error::InvalidArgument("poll dword outside the ib buffer"))?;
    polled.write(0);

    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    thread::scope(|scope| {
        let writer = scope.spawn(move || {
            if ready_tx.send(()).is_err() {
                return;
            }
            // a dropped sender releases as well
            let _ = release_rx.recv();
            polled.write(1);
        });
        // the thread is parked on the release channel from here on
        let _ = ready_rx.recv();

        let flooded = submit_until_canceled(device, context, ip_type, ib, list);
        let waited = flooded.and_then(|(count, last)| {
            if let Some(fence) = last {
                let outcome = wait_fence(device, &fence, Timeout::Infinite, Tolerated::CANCELED)?;
                debug!(canceled = outcome.is_canceled(), "last poll fence waited");
            }
            Ok(count)
        });

        let _ = release_tx.send(());
        if writer.join().is_err() {
            warn!("memory writer thread panicked");
        }
        waited
    })
}

fn submit_until_canceled(
    device: &dyn Device,
    context: ContextHandle,
    ip_type: IpType,
    ib: IbInfo,
    list: BoListHandle,
) -> Result<(u32, Option<CsFence>)> {
    let mut count = 0;
    let mut last = None;
    while count < MAX_JOB_COUNT {
        count += 1;
        let submitted = submission::submit(device, context, ip_type, 0, &[ib], Some(list));
        match Tolerated::CANCELED.check("cs_submit", submitted)? {
            Outcome::Done(fence) => last = Some(fence),
            Outcome::Canceled => {
                info!(ip = ?ip_type, count, "ring canceled the flood");
                break;
            }
        }
    }
    Ok((count, last))
}

/// Writes `0xdeadbeef` through WRITE_DATA either into a privileged VM
/// register or to an address with no mapping. Submit and wait accept the
/// context being canceled; returns whether it was.
pub fn bad_access_helper(device: &dyn Device, reg_access: bool, ip_type: IpType) -> Result<bool> {
    let mut job = IbJob::new(device, VmPageFlags::empty())?;
    let result = (|| -> Result<bool> {
        let ib = job.write(|base| {
            let (dst_sel, target) = if reg_access {
                (WRITE_DATA_DST_SEL_REG, MM_VM_CONTEXT0_PAGE_TABLE_BASE_ADDR)
            } else {
                (WRITE_DATA_DST_SEL_MEM, UNMAPPED_ADDRESS)
            };
            base.emit_slice(&[
                packet3(PACKET3_WRITE_DATA, 3),
                write_data_dst_sel(dst_sel) | WRITE_DATA_WR_CONFIRM,
                target,
                0,
                0xdead_beef,
            ])
        })?;
        let submitted = submission::submit(device, job.context, ip_type, 0, &[ib], Some(job.list));
        let fence = match Tolerated::CANCELED.check("cs_submit", submitted)? {
            Outcome::Done(fence) => fence,
            Outcome::Canceled => return Ok(true),
        };
        let outcome = wait_fence(device, &fence, Timeout::Infinite, Tolerated::CANCELED)?;
        Ok(outcome.is_canceled())
    })();
    first_error(result, job.release())
}

/// Submits a 16-dword NOP IB on GFX ring 0 for as long as `running` stays
/// set, then waits for the last submission. Failed submits are counted and
/// the loop carries on, as a device going away makes every submit fail.
///
/// Returns (successful, failed) submission counts.
pub fn nop_flood(device: &dyn Device, running: &AtomicBool) -> Result<(u64, u64)> {
    let mut job = IbJob::new(device, VmPageFlags::empty())?;
    let result = (|| -> Result<(u64, u64)> {
        let ib = job.write(|_| Ok(()))?;
        let (mut ok, mut failed) = (0u64, 0u64);
        let mut last = None;
        while running.load(Ordering::Acquire) {
            match submission::submit(device, job.context, IpType::Gfx, 0, &[ib], Some(job.list)) {
                Ok(fence) => {
                    ok += 1;
                    last = Some(fence);
                }
                Err(e) => {
                    if failed == 0 {
                        warn!(error = %e, "nop submit failed");
                    }
                    failed += 1;
                }
            }
        }
        if let Some(fence) = last {
            wait_fence(device, &fence, Timeout::Infinite, Tolerated::CANCELED)?;
        }
        debug!(ok, failed, "nop flood stopped");
        Ok((ok, failed))
    })();
    first_error(result, job.release())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{ChipPreset, SchedPolicy, SimConfig};
    use crate::sim::SimDevice;

    fn quick_lockup(policy: SchedPolicy) -> SimDevice {
        SimDevice::new(
            SimConfig::preset(ChipPreset::Vega10)
                .with_lockup_timeout(Duration::from_millis(20))
                .with_sched_policy(policy),
        )
    }

    #[test]
    fn polling_ring_is_canceled_before_the_job_cap() {
        for policy in [SchedPolicy::Immediate, SchedPolicy::OnWait] {
            for ip in [IpType::Gfx, IpType::Compute, IpType::Dma] {
                let dev = quick_lockup(policy);
                let count = wait_memory_helper(&dev, ip).unwrap();
                assert!(count > 1 && count < MAX_JOB_COUNT, "{:?} {:?}: {}", policy, ip, count);
                assert_eq!(dev.reset_count(), 1);
                assert_eq!(dev.live_bo_count(), 0);
                assert_eq!(dev.pending_jobs(), 0);
            }
        }
    }

    #[test]
    fn bad_writes_cancel_the_context() {
        let dev = quick_lockup(SchedPolicy::Immediate);
        for reg_access in [true, false] {
            for ip in [IpType::Gfx, IpType::Compute] {
                assert!(bad_access_helper(&dev, reg_access, ip).unwrap());
            }
        }
        assert_eq!(dev.reset_count(), 4);
        assert_eq!(dev.live_bo_count(), 0);
    }

    #[test]
    fn nop_flood_runs_until_cleared() {
        let dev = SimDevice::new(SimConfig::preset(ChipPreset::Vega10));
        let running = AtomicBool::new(true);
        let (ok, failed) = thread::scope(|scope| {
            let flood = scope.spawn(|| nop_flood(&dev, &running));
            thread::sleep(Duration::from_millis(20));
            running.store(false, Ordering::Release);
            flood.join().unwrap()
        })
        .unwrap();
        assert!(ok > 0);
        assert_eq!(failed, 0);
        assert_eq!(dev.pending_jobs(), 0);
        assert_eq!(dev.live_bo_count(), 0);
    }
}
