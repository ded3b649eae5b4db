//! Compute dispatch through PM4 on the GFX and compute rings.
//!
//! The packet builders program the compute pipe for the bundled GFX9 and
//! GFX10 shaders; the scenarios below clear, copy or deliberately hang a
//! buffer with them.

use tracing::{debug, info, warn};

use crate::cmd_base::CmdBase;
use crate::command_submission::first_error;
use crate::device::{ContextHandle, CsFence, Device, GemCreateFlags, GemDomain, IbInfo, ResetStatus, Timeout};
use crate::error::{Error, Result};
use crate::ip_block::IpType;
use crate::memory::{unwind, GpuBuffer};
use crate::pm4::*;
use crate::registers::{gfx_v8_0_get_reg_offset as sh_offset, GeneralReg, CP_COHER_START_DELAY};
use crate::shaders::{hang_slow_shader_size, load_cs_shader, load_cs_shader_hang_slow, ShaderKind};
use crate::submission::{self, expect_reset_state, wait_fence, Tolerated};

const CMD_SIZE: u64 = 4096;
const SHADER_SIZE: u64 = 4096;
const BUFFER_SIZE: u64 = 16384;

const HANG_SLOW_BUFFER_SIZE: u64 = 0x400_0000;
const HANG_SLOW_SHADER_SIZE: u64 = 0x40_0000;
const HANG_SLOW_GROUPS: u32 = 0x10000;
const HANG_SLOW_RANGE: u32 = 0x40_0000;

/// Fill byte of the memset dispatch.
pub const MEMSET_BYTE: u8 = 0x22;
/// Source byte of the memcpy dispatches.
pub const MEMCPY_BYTE: u8 = 0x55;

/// Shader register values the bundled clear and copy shaders expect.
const SHADER_REGS: [(GeneralReg, u32); 5] = [
    (GeneralReg::ComputePgmRsrc1, 0x000c_0041),
    (GeneralReg::ComputePgmRsrc2, 0x0000_0090),
    (GeneralReg::ComputeNumThreadX, 0x40),
    (GeneralReg::ComputeNumThreadY, 1),
    (GeneralReg::ComputeNumThreadZ, 1),
];

fn check_version(version: u32) -> Result<()> {
    match version {
        9 | 10 => Ok(()),
        _ => Err(Error::Unsupported {
            what: "compute dispatch before gfx9",
        }),
    }
}

/// Last dword of a buffer descriptor: format and swizzle for `version`.
fn descriptor_word3(version: u32) -> Result<u32> {
    match version {
        9 => Ok(0x0007_4fac),
        10 => Ok(0x1104_bfac),
        _ => Err(Error::Unsupported {
            what: "buffer descriptor before gfx9",
        }),
    }
}

/// Emits the default compute state. GFX submissions also get a
/// CONTEXT_CONTROL. Returns the dwords emitted.
pub fn dispatch_init(ip_type: IpType, base: &mut CmdBase<'_>, version: u32) -> Result<usize> {
    let start = base.cdw();
    if ip_type == IpType::Gfx {
        base.emit_slice(&[packet3(PACKET3_CONTEXT_CONTROL, 1), 0x8000_0000, 0x8000_0000])?;
    }

    // COMPUTE_START_X..Z
    base.emit_slice(&[
        packet3_compute(PACKET3_SET_SH_REG, 3),
        sh_offset(GeneralReg::ComputeStartX),
        0,
        0,
        0,
    ])?;
    base.emit_slice(&[
        packet3_compute(PACKET3_SET_SH_REG, 1),
        sh_offset(GeneralReg::ComputeTmpringSize),
        0,
    ])?;

    if version == 10 {
        base.emit_slice(&[
            packet3_compute(PACKET3_SET_SH_REG, 1),
            sh_offset(GeneralReg::ComputeShaderChksum),
            0,
        ])?;
        let req_ctrl = sh_offset(GeneralReg::ComputeReqCtrl);
        base.emit(packet3_compute(PACKET3_SET_SH_REG, 6))?;
        base.emit_repeat(req_ctrl, 7)?;
        base.emit_slice(&[packet3(PACKET3_SET_UCONFIG_REG, 1), CP_COHER_START_DELAY, 0x20])?;
    }
    Ok(base.cdw() - start)
}

/// Enables every CU on every shader engine for the next dispatch.
pub fn dispatch_write_cumask(base: &mut CmdBase<'_>, version: u32) -> Result<usize> {
    let start = base.cdw();
    let se0 = sh_offset(GeneralReg::ComputeStaticThreadMgmtSe0);
    let se2 = sh_offset(GeneralReg::ComputeStaticThreadMgmtSe2);
    match version {
        9 => base.emit_slice(&[packet3_compute(PACKET3_SET_SH_REG, 2), se0, 0xffff_ffff, 0xffff_ffff])?,
        10 => {
            // index 3 in the top bits selects the per-SE broadcast
            base.emit_slice(&[
                packet3_compute(PACKET3_SET_SH_REG_INDEX, 2),
                0x3000_0000 | se0,
                0xffff_ffff,
                0xffff_ffff,
            ])?;
            base.emit_slice(&[
                packet3_compute(PACKET3_SET_SH_REG_INDEX, 2),
                0x3000_0000 | se2,
                0xffff_ffff,
                0xffff_ffff,
            ])?;
        }
        _ => {}
    }
    base.emit_slice(&[packet3_compute(PACKET3_SET_SH_REG, 2), se2, 0xffff_ffff, 0xffff_ffff])?;
    Ok(base.cdw() - start)
}

/// Points the compute pipe at the shader at `shader_addr` and loads its
/// resource registers.
pub fn dispatch_write2hw(base: &mut CmdBase<'_>, shader_addr: u64, version: u32) -> Result<usize> {
    let start = base.cdw();
    base.emit_slice(&[
        packet3_compute(PACKET3_SET_SH_REG, 2),
        sh_offset(GeneralReg::ComputePgmLo),
        (shader_addr >> 8) as u32,
        (shader_addr >> 40) as u32,
    ])?;
    for (reg, value) in SHADER_REGS {
        base.emit_slice(&[packet3_compute(PACKET3_SET_SH_REG, 1), sh_offset(reg), value])?;
    }
    if version == 10 {
        base.emit_slice(&[
            packet3_compute(PACKET3_SET_SH_REG, 1),
            sh_offset(GeneralReg::ComputePgmRsrc3),
            0,
        ])?;
    }
    Ok(base.cdw() - start)
}

/// Writes a four-dword buffer descriptor into user data starting at `reg`.
fn emit_buffer_descriptor(base: &mut CmdBase<'_>, reg: GeneralReg, addr: u64, range: u32, version: u32) -> Result<()> {
    base.emit_slice(&[
        packet3_compute(PACKET3_SET_SH_REG, 4),
        sh_offset(reg),
        addr as u32,
        (addr >> 32) as u32 | 0x10_0000,
        range,
        descriptor_word3(version)?,
    ])
}

fn emit_dispatch(base: &mut CmdBase<'_>, groups: u32) -> Result<()> {
    base.emit_slice(&[
        packet3_compute(PACKET3_SET_SH_REG, 1),
        sh_offset(GeneralReg::ComputeResourceLimits),
        0,
    ])?;
    base.emit_slice(&[packet3_compute(PACKET3_DISPATCH_DIRECT, 3), groups, 1, 1, 1])?;
    base.emit_aligned(7, GFX_COMPUTE_NOP)
}

/// Frees every buffer; the first error is returned once all were tried.
fn release_all(device: &dyn Device, bufs: impl IntoIterator<Item = GpuBuffer>) -> Result<()> {
    bufs.into_iter()
        .map(|b| b.unmap_and_free(device))
        .fold(Ok(()), |acc, r| acc.and(r))
}

/// What a dispatch scenario runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Program {
    Clear,
    Copy,
    Hang,
    HangSlow(u32),
}

/// A context plus the command, shader, source and destination buffers of
/// one dispatch.
struct DispatchJob<'d> {
    device: &'d dyn Device,
    context: ContextHandle,
    cmd: GpuBuffer,
    shader: GpuBuffer,
    src: Option<GpuBuffer>,
    dst: GpuBuffer,
    cdw: u32,
}

impl<'d> DispatchJob<'d> {
    fn new(device: &'d dyn Device, program: Program, version: u32) -> Result<Self> {
        let context = device.cs_ctx_create()?;
        let mut held = Vec::with_capacity(4);
        if let Err(e) = Self::alloc_buffers(device, program, version, &mut held) {
            unwind(release_all(device, held));
            unwind(device.cs_ctx_free(context));
            return Err(e);
        }
        let mut bufs = held.into_iter();
        match (bufs.next(), bufs.next(), bufs.next(), bufs.next()) {
            (Some(cmd), Some(shader), Some(dst), src) => Ok(DispatchJob {
                device,
                context,
                cmd,
                shader,
                src,
                dst,
                cdw: 0,
            }),
            _ => Err(Error::InvalidArgument("dispatch buffers missing")),
        }
    }

    /// Pushes the command, shader, destination and (for copies) source
    /// buffers onto `held` in that order.
    fn alloc_buffers(device: &dyn Device, program: Program, version: u32, held: &mut Vec<GpuBuffer>) -> Result<()> {
        let (shader_size, buffer_size) = match program {
            Program::HangSlow(_) => (HANG_SLOW_SHADER_SIZE, HANG_SLOW_BUFFER_SIZE),
            _ => (SHADER_SIZE, BUFFER_SIZE),
        };
        let none = GemCreateFlags::empty();

        let mut cmd = GpuBuffer::alloc_and_map(device, CMD_SIZE, 4096, GemDomain::GTT, none)?;
        cmd.memset(0, CMD_SIZE as usize);
        held.push(cmd);

        let mut shader = GpuBuffer::alloc_and_map(device, shader_size, 4096, GemDomain::VRAM, none)?;
        shader.memset(0, shader_size as usize);
        let code = shader.cpu_mut().as_bytes_mut();
        let loaded = match program {
            Program::Clear => load_cs_shader(code, ShaderKind::BufferClear, version),
            Program::Copy => load_cs_shader(code, ShaderKind::BufferCopy, version),
            Program::Hang => load_cs_shader(code, ShaderKind::Hang, version),
            Program::HangSlow(family_id) => load_cs_shader_hang_slow(code, family_id),
        };
        held.push(shader);
        loaded?;

        held.push(GpuBuffer::alloc_and_map(device, buffer_size, 4096, GemDomain::VRAM, none)?);
        if program != Program::Clear {
            let mut src = GpuBuffer::alloc_and_map(device, buffer_size, 4096, GemDomain::VRAM, none)?;
            src.memset(MEMCPY_BYTE, buffer_size as usize);
            held.push(src);
        }
        Ok(())
    }

    /// Builds the whole command stream into the command buffer.
    fn build(&mut self, ip_type: IpType, version: u32, range: u32, groups: u32) -> Result<()> {
        let shader_addr = self.shader.mc_address;
        let dst_addr = self.dst.mc_address;
        let src_addr = self.src.as_ref().map(|s| s.mc_address);

        let mut base = CmdBase::new();
        base.attach(self.cmd.cpu_mut().dwords_mut())?;
        dispatch_init(ip_type, &mut base, version)?;
        dispatch_write_cumask(&mut base, version)?;
        dispatch_write2hw(&mut base, shader_addr, version)?;
        match src_addr {
            Some(src) => {
                emit_buffer_descriptor(&mut base, GeneralReg::ComputeUserData0, src, range, version)?;
                emit_buffer_descriptor(&mut base, GeneralReg::ComputeUserData4, dst_addr, range, version)?;
            }
            None => {
                emit_buffer_descriptor(&mut base, GeneralReg::ComputeUserData0, dst_addr, range, version)?;
                // fill value, replicated over the four channels
                let fill = u32::from_ne_bytes([MEMSET_BYTE; 4]);
                base.emit(packet3_compute(PACKET3_SET_SH_REG, 4))?;
                base.emit(sh_offset(GeneralReg::ComputeUserData4))?;
                base.emit_repeat(fill, 4)?;
            }
        }
        emit_dispatch(&mut base, groups)?;
        self.cdw = base.cdw() as u32;
        debug!(dw = self.cdw, groups, "dispatch stream built");
        Ok(())
    }

    fn submit(&self, ip_type: IpType, ring: u32) -> Result<CsFence> {
        let mut bos = vec![self.shader.bo];
        bos.extend(self.src.as_ref().map(|s| s.bo));
        bos.push(self.dst.bo);
        bos.push(self.cmd.bo);
        let list = self.device.bo_list_create(&bos)?;
        let ib = IbInfo {
            ib_mc_address: self.cmd.mc_address,
            size: self.cdw,
            ..Default::default()
        };
        let fence = submission::submit(self.device, self.context, ip_type, ring, &[ib], Some(list));
        first_error(fence, self.device.bo_list_destroy(list))
    }

    fn release(self) -> Result<()> {
        let DispatchJob {
            device,
            context,
            cmd,
            shader,
            src,
            dst,
            ..
        } = self;
        let freed = release_all(device, src.into_iter().chain([dst, cmd, shader]));
        first_error(freed, device.cs_ctx_free(context))
    }
}

/// Runs `body` on a freshly built job and releases it afterwards.
/// A hung dispatch must not come back as a normal completion: the wait
/// either fails, is canceled, or reports the fence unsignaled.
fn expect_hung(waited: Result<submission::Outcome<bool>>) -> Result<()> {
    match waited {
        Ok(submission::Outcome::Done(true)) => Err(Error::HangNotDetected),
        other => {
            debug!(?other, "hung dispatch waited");
            Ok(())
        }
    }
}

fn with_job(
    device: &dyn Device,
    program: Program,
    version: u32,
    body: impl FnOnce(&mut DispatchJob<'_>) -> Result<()>,
) -> Result<()> {
    let mut job = DispatchJob::new(device, program, version)?;
    let result = body(&mut job);
    first_error(result, job.release())
}

/// Clears a 16 KiB VRAM buffer to [`MEMSET_BYTE`] with the buffer-clear
/// shader.
pub fn memset_dispatch_test(device: &dyn Device, ip_type: IpType, ring: u32, version: u32) -> Result<()> {
    check_version(version)?;
    with_job(device, Program::Clear, version, |job| {
        job.build(ip_type, version, 0x400, 0x10)?;
        let fence = job.submit(ip_type, ring)?;
        match wait_fence(device, &fence, Timeout::Infinite, Tolerated::empty())? {
            submission::Outcome::Done(true) => {}
            _ => return Err(Error::FenceNotExpired),
        }
        let dst = &job.dst.cpu().as_bytes()[..BUFFER_SIZE as usize];
        if let Some(index) = dst.iter().position(|&b| b != MEMSET_BYTE) {
            return Err(Error::Mismatch {
                index,
                expected: MEMSET_BYTE as u32,
                found: dst[index] as u32,
            });
        }
        Ok(())
    })
}

/// Copies a 16 KiB VRAM buffer with the buffer-copy shader. With `hang`
/// the hang shader runs instead and the context must report a reset.
pub fn memcpy_dispatch_test(device: &dyn Device, ip_type: IpType, ring: u32, version: u32, hang: bool) -> Result<()> {
    check_version(version)?;
    let program = if hang { Program::Hang } else { Program::Copy };
    with_job(device, program, version, |job| {
        job.build(ip_type, version, 0x400, 0x10)?;
        let fence = job.submit(ip_type, ring)?;
        if hang {
            expect_hung(wait_fence(device, &fence, Timeout::Infinite, Tolerated::CANCELED))?;
            expect_reset_state(device, job.context, ResetStatus::UnknownReset)?;
            return Ok(());
        }
        match wait_fence(device, &fence, Timeout::Infinite, Tolerated::empty())? {
            submission::Outcome::Done(true) => {}
            _ => return Err(Error::FenceNotExpired),
        }
        let src = job.src.as_ref().ok_or(Error::InvalidArgument("copy without a source"))?;
        let len = BUFFER_SIZE as usize;
        let (src, dst) = (&src.cpu().as_bytes()[..len], &job.dst.cpu().as_bytes()[..len]);
        if let Some(index) = src.iter().zip(dst).position(|(s, d)| s != d) {
            return Err(Error::Mismatch {
                index,
                expected: src[index] as u32,
                found: dst[index] as u32,
            });
        }
        Ok(())
    })
}

/// Runs the long hang-slow copy over 64 MiB and requires the context's
/// reset state to equal `expected` afterwards.
pub fn memcpy_dispatch_hang_slow_test(
    device: &dyn Device,
    ip_type: IpType,
    ring: u32,
    version: u32,
    expected: ResetStatus,
) -> Result<()> {
    check_version(version)?;
    let family_id = device.query_gpu_info()?.family_id;
    let needed = hang_slow_shader_size(family_id)? as u64;
    if needed > HANG_SLOW_SHADER_SIZE {
        return Err(Error::DestinationTooSmall {
            needed: needed as usize,
            available: HANG_SLOW_SHADER_SIZE as usize,
        });
    }
    with_job(device, Program::HangSlow(family_id), version, |job| {
        job.build(ip_type, version, HANG_SLOW_RANGE, HANG_SLOW_GROUPS)?;
        let fence = job.submit(ip_type, ring)?;
        let waited = wait_fence(device, &fence, Timeout::Infinite, Tolerated::CANCELED);
        if expected == ResetStatus::NoReset {
            debug!(?waited, "hang-slow dispatch waited");
        } else {
            expect_hung(waited)?;
        }
        let hangs = expect_reset_state(device, job.context, expected)?;
        info!(?expected, hangs, "hang-slow reset state");
        Ok(())
    })
}

fn gfx_version(device: &dyn Device, ip_type: IpType) -> Result<Option<(u32, Vec<u32>)>> {
    let info = device.query_hw_ip_info(ip_type, 0)?;
    if info.available_rings == 0 {
        warn!(ip = ?ip_type, "no ring available");
    }
    let version = info.hw_ip_version_major;
    if version != 9 && version != 10 {
        warn!(version, "skipping dispatch on unsupported gfx version");
        return Ok(None);
    }
    Ok(Some((version, info.rings().collect())))
}

/// memcpy, hang-slow, memcpy on every ring of `ip_type`. The memcpy after
/// the hang shows the ring recovered.
pub fn dispatch_hang_slow_helper(device: &dyn Device, ip_type: IpType, expected: ResetStatus) -> Result<()> {
    let Some((version, rings)) = gfx_version(device, ip_type)? else {
        return Ok(());
    };
    for ring in rings {
        memcpy_dispatch_test(device, ip_type, ring, version, false)?;
        memcpy_dispatch_hang_slow_test(device, ip_type, ring, version, expected)?;
        memcpy_dispatch_test(device, ip_type, ring, version, false)?;
    }
    Ok(())
}

/// memset then memcpy on every ring of `ip_type`. The version comes from
/// the GFX block, also for compute.
pub fn gfx_dispatch_test(device: &dyn Device, ip_type: IpType) -> Result<()> {
    let Some((version, _)) = gfx_version(device, IpType::Gfx)? else {
        return Ok(());
    };
    let rings: Vec<u32> = device.query_hw_ip_info(ip_type, 0)?.rings().collect();
    for ring in rings {
        memset_dispatch_test(device, ip_type, ring, version)?;
        memcpy_dispatch_test(device, ip_type, ring, version, false)?;
    }
    Ok(())
}

/// The hang shader on every ring of `ip_type`, each followed by a good
/// copy.
pub fn dispatch_hang_helper(device: &dyn Device, ip_type: IpType) -> Result<()> {
    let Some((version, rings)) = gfx_version(device, ip_type)? else {
        return Ok(());
    };
    for ring in rings {
        memcpy_dispatch_test(device, ip_type, ring, version, false)?;
        memcpy_dispatch_test(device, ip_type, ring, version, true)?;
        memcpy_dispatch_test(device, ip_type, ring, version, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChipPreset, SimConfig};
    use crate::sim::SimDevice;
    use pretty_assertions::assert_eq;

    const SH1: u32 = 0xc001_7602;
    const SH2: u32 = 0xc002_7602;
    const ONES: u32 = 0xffff_ffff;

    #[test]
    fn init_stream_per_ip_and_version() {
        let mut base = CmdBase::with_capacity(64).unwrap();
        assert_eq!(dispatch_init(IpType::Compute, &mut base, 9).unwrap(), 8);
        assert_eq!(base.as_slice(), &[0xc003_7602, 0x204, 0, 0, 0, SH1, 0x218, 0]);

        base.reset();
        assert_eq!(dispatch_init(IpType::Gfx, &mut base, 10).unwrap(), 25);
        let words = base.as_slice();
        assert_eq!(&words[..3], &[0xc001_2800, 0x8000_0000, 0x8000_0000]);
        assert_eq!(&words[11..14], &[SH1, 0x22a, 0]);
        assert_eq!(words[14], 0xc006_7602);
        assert!(words[15..22].iter().all(|&w| w == 0x222));
        assert_eq!(&words[22..], &[0xc001_7900, 0x7b, 0x20]);
    }

    #[test]
    fn cumask_stream() {
        let mut base = CmdBase::with_capacity(64).unwrap();
        assert_eq!(dispatch_write_cumask(&mut base, 9).unwrap(), 8);
        assert_eq!(base.as_slice(), &[SH2, 0x216, ONES, ONES, SH2, 0x219, ONES, ONES]);

        base.reset();
        assert_eq!(dispatch_write_cumask(&mut base, 10).unwrap(), 12);
        assert_eq!(
            &base.as_slice()[..8],
            &[0xc002_9b02, 0x3000_0216, ONES, ONES, 0xc002_9b02, 0x3000_0219, ONES, ONES]
        );
    }

    #[test]
    fn shader_registers_stream() {
        let mut base = CmdBase::with_capacity(64).unwrap();
        assert_eq!(dispatch_write2hw(&mut base, 0x1_2345_6700, 9).unwrap(), 19);
        let words = base.as_slice();
        assert_eq!(&words[..4], &[SH2, 0x20c, 0x0123_4567, 0]);
        assert_eq!(&words[4..7], &[SH1, 0x212, 0x000c_0041]);
        assert_eq!(&words[16..], &[SH1, 0x209, 1]);

        base.reset();
        assert_eq!(dispatch_write2hw(&mut base, 0, 10).unwrap(), 22);
        assert_eq!(&base.as_slice()[19..], &[SH1, 0x228, 0]);
    }

    #[test]
    fn old_versions_are_refused() {
        let dev = SimDevice::new(SimConfig::preset(ChipPreset::Polaris11));
        assert!(matches!(
            memset_dispatch_test(&dev, IpType::Gfx, 0, 8),
            Err(Error::Unsupported { .. })
        ));
        // the helpers skip instead
        gfx_dispatch_test(&dev, IpType::Compute).unwrap();
        assert_eq!(dev.live_bo_count(), 0);
    }

    #[test]
    fn clear_and_copy_on_every_ring() {
        for chip in [ChipPreset::Vega10, ChipPreset::Navi10] {
            let dev = SimDevice::new(SimConfig::preset(chip));
            gfx_dispatch_test(&dev, IpType::Gfx).unwrap();
            gfx_dispatch_test(&dev, IpType::Compute).unwrap();
            assert_eq!(dev.live_bo_count(), 0);
            assert_eq!(dev.reset_count(), 0);
        }
    }

    #[test]
    fn hang_shader_resets_only_its_context() {
        let dev = SimDevice::new(SimConfig::preset(ChipPreset::Vega10));
        dispatch_hang_helper(&dev, IpType::Compute).unwrap();
        let rings = dev.query_hw_ip_info(IpType::Compute, 0).unwrap().rings().count();
        assert_eq!(dev.reset_count() as usize, rings);
        assert_eq!(dev.live_bo_count(), 0);

        memcpy_dispatch_test(&dev, IpType::Gfx, 0, 9, true).unwrap();
        assert_eq!(dev.reset_count() as usize, rings + 1);

        assert!(matches!(
            expect_hung(Ok(submission::Outcome::Done(true))),
            Err(Error::HangNotDetected)
        ));
        expect_hung(Ok(submission::Outcome::Canceled)).unwrap();
        expect_hung(Ok(submission::Outcome::Done(false))).unwrap();
        expect_hung(Err(Error::kernel("cs_query_fence_status", nix::errno::Errno::ECANCELED))).unwrap();
    }

    #[test]
    fn clear_check_covers_only_the_written_range() {
        // the software device rounds BOs up, so the mapping outgrows the buffer
        let dev = SimDevice::new(SimConfig::preset(ChipPreset::Vega10));
        memset_dispatch_test(&dev, IpType::Compute, 0, 9).unwrap();
        memcpy_dispatch_test(&dev, IpType::Compute, 0, 9, false).unwrap();
        assert_eq!(dev.live_bo_count(), 0);
    }

    #[test]
    fn hang_slow_reports_the_expected_state() {
        let config = SimConfig::preset(ChipPreset::Vega10).with_instruction_budget(1 << 14);
        let dev = SimDevice::new(config);
        dispatch_hang_slow_helper(&dev, IpType::Gfx, ResetStatus::UnknownReset).unwrap();

        assert!(matches!(
            memcpy_dispatch_hang_slow_test(&dev, IpType::Gfx, 0, 9, ResetStatus::NoReset),
            Err(Error::UnexpectedResetState { expected: 0, found: 3 })
        ));
        assert_eq!(dev.live_bo_count(), 0);
        assert_eq!(dev.live_va_count(), 0);
    }
}
