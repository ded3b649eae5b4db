use std::time::Duration;

use gpu_cmd_kit::command_submission::{command_submission, memory_alloc, multi_fence, sync_dependency};
use gpu_cmd_kit::config::{ChipPreset, SchedPolicy, SimConfig};
use gpu_cmd_kit::cp_dma::{cp_dma_all_heaps, cp_dma_cmd, DMA_SIZE};
use gpu_cmd_kit::deadlock::{bad_access_helper, wait_memory_helper, MAX_JOB_COUNT};
use gpu_cmd_kit::device::{Device, GemCreateFlags, GemDomain, IbInfo, ResetStatus, Timeout};
use gpu_cmd_kit::dispatch::{dispatch_hang_slow_helper, gfx_dispatch_test};
use gpu_cmd_kit::intel_bb::{IntelBb, IntelBuf, Platform, RecordingExecutor, Tiling};
use gpu_cmd_kit::ip_block::{IpBlockRegistry, IpType};
use gpu_cmd_kit::memory::GpuBuffer;
use gpu_cmd_kit::rendercopy_gen4::gen4_render_copyfunc;
use gpu_cmd_kit::sim::SimDevice;
use gpu_cmd_kit::submission::{self, Outcome, Tolerated};

fn open(config: SimConfig) -> (SimDevice, IpBlockRegistry) {
    let dev = SimDevice::new(config);
    let info = dev.query_gpu_info().unwrap();
    let registry = IpBlockRegistry::setup(3, 42, &info, &dev).unwrap();
    (dev, registry)
}

fn assert_clean(dev: &SimDevice) {
    assert_eq!(dev.live_bo_count(), 0);
    assert_eq!(dev.live_va_count(), 0);
    assert_eq!(dev.pending_jobs(), 0);
}

#[test]
fn submission_suite_on_every_generation() {
    for chip in [ChipPreset::Polaris11, ChipPreset::Vega10, ChipPreset::Navi10] {
        let (dev, registry) = open(SimConfig::preset(chip));
        memory_alloc(&dev).unwrap();
        for ip in [IpType::Gfx, IpType::Compute, IpType::Dma] {
            command_submission(&dev, registry.ip_block(&dev, ip).unwrap()).unwrap();
        }
        multi_fence(&dev, true).unwrap();
        multi_fence(&dev, false).unwrap();
        sync_dependency(&dev).unwrap();
        assert_clean(&dev);
        assert_eq!(dev.reset_count(), 0, "{}", chip);
    }
}

#[test]
fn lazy_scheduling_gives_the_same_results() {
    let (dev, registry) = open(SimConfig::preset(ChipPreset::Vega10).with_sched_policy(SchedPolicy::OnWait));
    command_submission(&dev, registry.ip_block(&dev, IpType::Dma).unwrap()).unwrap();
    cp_dma_all_heaps(&dev, IpType::Compute).unwrap();
    gfx_dispatch_test(&dev, IpType::Compute).unwrap();
    assert_clean(&dev);
}

#[test]
fn dispatch_and_cp_dma_on_gfx9_and_gfx10() {
    for chip in [ChipPreset::Vega10, ChipPreset::Navi10] {
        let (dev, _registry) = open(SimConfig::preset(chip));
        gfx_dispatch_test(&dev, IpType::Gfx).unwrap();
        cp_dma_all_heaps(&dev, IpType::Gfx).unwrap();
        assert_clean(&dev);
    }
}

#[test]
fn cp_dma_moves_random_bytes() {
    let dev = SimDevice::new(SimConfig::preset(ChipPreset::Polaris11));
    let alloc = |size| GpuBuffer::alloc_and_map(&dev, size, 4096, GemDomain::GTT, GemCreateFlags::empty()).unwrap();
    let mut src = alloc(8192);
    let dst = alloc(8192);
    let mut ib = alloc(4096);

    let payload: Vec<u8> = (0..DMA_SIZE).map(|_| rand::random::<u8>()).collect();
    src.cpu_mut().as_bytes_mut()[..payload.len()].copy_from_slice(&payload);
    ib.cpu_mut().dwords_mut()[..8].copy_from_slice(&cp_dma_cmd(src.mc_address, dst.mc_address, DMA_SIZE));

    let ctx = dev.cs_ctx_create().unwrap();
    let list = dev.bo_list_create(&[src.bo, dst.bo, ib.bo]).unwrap();
    let ibs = [IbInfo {
        ib_mc_address: ib.mc_address,
        size: 8,
        ..Default::default()
    }];
    let fence = submission::submit(&dev, ctx, IpType::Gfx, 0, &ibs, Some(list)).unwrap();
    let outcome = submission::wait_fence(&dev, &fence, Timeout::Infinite, Tolerated::empty()).unwrap();
    assert_eq!(outcome, Outcome::Done(true));
    assert_eq!(&dst.cpu().as_bytes()[..payload.len()], payload.as_slice());
    assert!(dst.cpu().as_bytes()[payload.len()..].iter().all(|&b| b == 0));

    dev.bo_list_destroy(list).unwrap();
    for buf in [src, dst, ib] {
        buf.unmap_and_free(&dev).unwrap();
    }
    dev.cs_ctx_free(ctx).unwrap();
    assert_clean(&dev);
}

#[test]
fn hangs_are_recovered_and_work_continues() {
    let config = SimConfig::preset(ChipPreset::Vega10)
        .with_lockup_timeout(Duration::from_millis(20))
        .with_instruction_budget(1 << 14);
    let (dev, registry) = open(config);

    let submitted = wait_memory_helper(&dev, IpType::Gfx).unwrap();
    assert!(submitted < MAX_JOB_COUNT);
    assert!(bad_access_helper(&dev, false, IpType::Compute).unwrap());
    dispatch_hang_slow_helper(&dev, IpType::Gfx, ResetStatus::UnknownReset).unwrap();

    // a fresh context still gets its work done
    command_submission(&dev, registry.ip_block(&dev, IpType::Gfx).unwrap()).unwrap();
    assert!(dev.reset_count() >= 3);
    assert_clean(&dev);
}

#[test]
fn render_copy_batches_for_every_gen4_platform() {
    let exec = RecordingExecutor::default();
    let src = IntelBuf::create(&exec, 256, 128, 32, Tiling::None).unwrap();
    let dst = IntelBuf::create(&exec, 256, 128, 32, Tiling::Y).unwrap();
    for platform in [Platform::Gen4, Platform::G4x, Platform::Gen5] {
        let mut ibb = IntelBb::new(&exec, platform, 4096).unwrap();
        gen4_render_copyfunc(&mut ibb, &src, 0, 0, 64, 64, &dst, 128, 64).unwrap();
        ibb.destroy().unwrap();
    }
    let execs = exec.execs();
    assert_eq!(execs.len(), 3);
    for batch in &execs {
        assert_eq!(batch.batch_len % 8, 0);
        assert_eq!(batch.objects.len(), 3);
    }
    let mut live = exec.live_handles();
    live.sort_unstable();
    assert_eq!(live, vec![src.handle, dst.handle]);
}
