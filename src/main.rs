use std::env;
use std::process::ExitCode;
use std::time::Instant;

use tracing::{error, info, warn};

use gpu_cmd_kit::command_submission::{command_submission, memory_alloc, multi_fence, sync_dependency, write_linear_helper};
use gpu_cmd_kit::config::{DeviceSelect, RunnerConfig};
use gpu_cmd_kit::cp_dma::cp_dma_all_heaps;
use gpu_cmd_kit::deadlock::{bad_access_helper, wait_memory_helper};
use gpu_cmd_kit::device::{Device, ResetStatus};
use gpu_cmd_kit::dispatch::{dispatch_hang_helper, dispatch_hang_slow_helper, gfx_dispatch_test};
use gpu_cmd_kit::intel_bb::{BatchExecutor, IntelBb, IntelBuf, Platform, RecordingExecutor, Tiling};
use gpu_cmd_kit::ip_block::{IpBlockRegistry, IpType};
use gpu_cmd_kit::rendercopy_gen4::gen4_render_copyfunc;
use gpu_cmd_kit::sim::SimDevice;
use gpu_cmd_kit::{logging, Error, Result};

/// DRM interface version the software device claims.
const SIM_DRM_VERSION: (u32, u32) = (3, 42);

type Scenario = fn(&dyn Device, &IpBlockRegistry) -> Result<()>;

const SCENARIOS: &[(&str, Scenario)] = &[
    ("memory-alloc", run_memory_alloc),
    ("cs-gfx", run_cs_gfx),
    ("cs-compute", run_cs_compute),
    ("cs-sdma", run_cs_sdma),
    ("cs-multi-fence", run_multi_fence),
    ("cs-sync-dependency", run_sync_dependency),
    ("cs-secure-write-linear", run_secure_write_linear),
    ("dispatch", run_dispatch),
    ("dispatch-hang", run_dispatch_hang),
    ("dispatch-hang-slow", run_dispatch_hang_slow),
    ("cp-dma", run_cp_dma),
    ("deadlock-wait-memory", run_wait_memory),
    ("deadlock-bad-access", run_bad_access),
    ("rendercopy-gen4-dry-run", run_rendercopy_dry_run),
];

fn run_memory_alloc(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    memory_alloc(device)
}

fn run_cs_gfx(device: &dyn Device, registry: &IpBlockRegistry) -> Result<()> {
    command_submission(device, registry.ip_block(device, IpType::Gfx)?)
}

fn run_cs_compute(device: &dyn Device, registry: &IpBlockRegistry) -> Result<()> {
    command_submission(device, registry.ip_block(device, IpType::Compute)?)
}

fn run_cs_sdma(device: &dyn Device, registry: &IpBlockRegistry) -> Result<()> {
    command_submission(device, registry.ip_block(device, IpType::Dma)?)
}

fn run_multi_fence(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    multi_fence(device, true)?;
    multi_fence(device, false)
}

fn run_sync_dependency(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    sync_dependency(device)
}

fn run_secure_write_linear(device: &dyn Device, registry: &IpBlockRegistry) -> Result<()> {
    for ip in [IpType::Gfx, IpType::Dma] {
        write_linear_helper(device, registry.ip_block(device, ip)?, true)?;
    }
    Ok(())
}

fn run_dispatch(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    gfx_dispatch_test(device, IpType::Gfx)?;
    gfx_dispatch_test(device, IpType::Compute)
}

fn run_dispatch_hang(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    dispatch_hang_helper(device, IpType::Gfx)?;
    dispatch_hang_helper(device, IpType::Compute)
}

fn run_dispatch_hang_slow(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    dispatch_hang_slow_helper(device, IpType::Gfx, ResetStatus::UnknownReset)?;
    dispatch_hang_slow_helper(device, IpType::Compute, ResetStatus::UnknownReset)
}

fn run_cp_dma(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    cp_dma_all_heaps(device, IpType::Gfx)?;
    cp_dma_all_heaps(device, IpType::Compute)
}

fn run_wait_memory(device: &dyn Device, registry: &IpBlockRegistry) -> Result<()> {
    for ip in [IpType::Gfx, IpType::Compute, IpType::Dma] {
        if registry.get_ip_block(device, ip).is_none() {
            continue;
        }
        let submitted = wait_memory_helper(device, ip)?;
        info!(ip = ?ip, submitted, "ring recovered from the memory poll");
    }
    Ok(())
}

fn run_bad_access(device: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    for reg_access in [true, false] {
        for ip in [IpType::Gfx, IpType::Compute] {
            let canceled = bad_access_helper(device, reg_access, ip)?;
            info!(ip = ?ip, reg_access, canceled, "bad access submitted");
        }
    }
    Ok(())
}

/// Builds GEN4, G4X and GEN5 copy batches against a recording executor;
/// the AMD device is not involved.
fn run_rendercopy_dry_run(_: &dyn Device, _: &IpBlockRegistry) -> Result<()> {
    let exec = RecordingExecutor::default();
    for platform in [Platform::Gen4, Platform::G4x, Platform::Gen5] {
        let src = IntelBuf::create(&exec, 256, 128, 32, Tiling::None)?;
        let dst = IntelBuf::create(&exec, 256, 128, 32, Tiling::X)?;
        let mut ibb = IntelBb::new(&exec, platform, 4096)?;
        gen4_render_copyfunc(&mut ibb, &src, 0, 0, 128, 64, &dst, 64, 32)?;
        ibb.destroy()?;
        exec.gem_close(src.handle)?;
        exec.gem_close(dst.handle)?;
    }
    for batch in exec.execs() {
        info!(
            len = batch.batch_len,
            objects = batch.objects.len(),
            relocs = batch.relocs.len(),
            "recorded render copy batch"
        );
    }
    if !exec.live_handles().is_empty() {
        return Err(Error::InvalidArgument("render copy leaked gem objects"));
    }
    Ok(())
}

fn open_device(config: &RunnerConfig) -> Result<(Box<dyn Device>, (u32, u32))> {
    match &config.device {
        DeviceSelect::Sim => {
            let sim = config.sim_config()?;
            info!(chip = %sim.chip, "using the software device");
            let device: Box<dyn Device> = Box::new(SimDevice::new(sim));
            Ok((device, SIM_DRM_VERSION))
        }
        #[cfg(target_os = "linux")]
        DeviceSelect::Render(path) => {
            let drm = gpu_cmd_kit::drm::DrmDevice::open(path)?;
            let version = drm.version();
            let device: Box<dyn Device> = Box::new(drm);
            Ok((device, version))
        }
        #[cfg(not(target_os = "linux"))]
        DeviceSelect::Render(_) => Err(Error::Config("render nodes are only supported on linux".into())),
    }
}

fn selected<'a>(config: &'a RunnerConfig) -> impl Iterator<Item = &'static (&'static str, Scenario)> + 'a {
    SCENARIOS
        .iter()
        .filter(move |(name, _)| config.run.is_empty() || config.run.iter().any(|p| name.contains(p.as_str())))
}

/// Runs the selected scenarios and returns how many failed.
fn run(config: &RunnerConfig) -> Result<usize> {
    let (device, (major, minor)) = open_device(config)?;
    let device = device.as_ref();
    let info = device.query_gpu_info()?;
    let registry = IpBlockRegistry::setup(major, minor, &info, device)?;

    let mut failed = 0;
    for (name, scenario) in selected(config) {
        let start = Instant::now();
        match scenario(device, &registry) {
            Ok(()) => info!(scenario = name, elapsed_ms = start.elapsed().as_millis() as u64, "pass"),
            Err(Error::Unsupported { what }) => warn!(scenario = name, what, "skip"),
            Err(Error::IpBlockNotFound(ip)) => warn!(scenario = name, ip = ?ip, "skip"),
            Err(e) => {
                error!(scenario = name, error = %e, "fail");
                failed += 1;
            }
        }
    }
    Ok(failed)
}

fn main() -> ExitCode {
    logging::init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("gpu-cmd-kit");
    let config = match RunnerConfig::parse(args.get(1..).unwrap_or(&[])) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}\n\n{}", e, RunnerConfig::usage(program));
            return ExitCode::FAILURE;
        }
    };
    if config.help {
        println!("{}", RunnerConfig::usage(program));
        return ExitCode::SUCCESS;
    }
    if config.list {
        for (name, _) in selected(&config) {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    match run(&config) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            error!(failed, "scenarios failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "runner aborted");
            ExitCode::FAILURE
        }
    }
}
