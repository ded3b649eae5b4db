//! Per-IP packet builders and the registry that selects them for a device.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::bit::{lower_32_bits, upper_32_bits};
use crate::device::{Device, DeviceId, GpuInfo};
use crate::error::{Error, Result};
use crate::family::{identify_chip, ChipClass, ChipInfo, FAMILY_AI, FAMILY_SI};
use crate::pm4::*;
use crate::registers::{gfx_v8_0_get_reg_offset, GeneralReg};
use crate::ring_context::RingContext;
use crate::sdma::*;

/// Hardware IP types, numbered as the kernel numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive)]
pub enum IpType {
    Gfx = 0,
    Compute = 1,
    Dma = 2,
    Uvd = 3,
    Vce = 4,
}

pub const AMD_IP_MAX: usize = 5;

/// Constants shared by one IP's packet builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpParams {
    pub family_id: u32,
    pub align_mask: u32,
    pub nop: u32,
    pub deadbeaf: u32,
    pub pattern: u32,
}

impl IpParams {
    pub fn v8(family_id: u32) -> Self {
        IpParams {
            family_id,
            align_mask: 0xff,
            nop: 0x80000000,
            deadbeaf: 0xdeadbeaf,
            pattern: 0xaaaaaaaa,
        }
    }
}

/// Packet builders for one IP.
///
/// The emitting methods rebuild `ring.pm4` from scratch using the ring's
/// buffers and `write_length`, record the dword count in `ring.pm4_dw` and
/// return it.
pub trait IpFuncs: Send + Sync + fmt::Debug {
    fn params(&self) -> &IpParams;

    /// Makes the engine write `deadbeaf` over `write_length` dwords of `bo`.
    fn write_linear(&self, ring: &mut RingContext) -> Result<usize>;

    /// Fills `write_length` bytes of `bo` with `deadbeaf` through the fill path.
    fn const_fill(&self, ring: &mut RingContext) -> Result<usize>;

    /// Copies `write_length` bytes from `bo` to `bo2`.
    fn copy_linear(&self, ring: &mut RingContext) -> Result<usize>;

    /// Checks the first `write_length / div` dwords of `bo` against `deadbeaf`.
    fn compare(&self, ring: &RingContext, div: u32) -> Result<()> {
        let expected = self.params().deadbeaf;
        compare_dwords(ring.bo_cpu()?.dwords(), ring.write_length / div, expected)
    }

    /// Checks the first `write_length / div` dwords of the copy destination
    /// against `pattern`.
    fn compare_pattern(&self, ring: &RingContext, div: u32) -> Result<()> {
        let expected = self.params().pattern;
        compare_dwords(ring.bo2_cpu()?.dwords(), ring.write_length / div, expected)
    }

    fn get_reg_offset(&self, reg: GeneralReg) -> u32 {
        gfx_v8_0_get_reg_offset(reg)
    }
}

fn compare_dwords(data: &[u32], count: u32, expected: u32) -> Result<()> {
    let count = count as usize;
    if data.len() < count {
        return Err(Error::DestinationTooSmall {
            needed: count * 4,
            available: data.len() * 4,
        });
    }
    match data[..count].iter().position(|&v| v != expected) {
        Some(index) => Err(Error::Mismatch {
            index,
            expected,
            found: data[index],
        }),
        None => Ok(()),
    }
}

/// The ring's write length; packets cannot describe an empty transfer.
fn write_length(ring: &RingContext) -> Result<u32> {
    match ring.write_length {
        0 => Err(Error::InvalidArgument("zero write length")),
        len => Ok(len),
    }
}

/// AI and later encode SDMA byte counts minus one.
fn sized_count(family_id: u32, write_length: u32) -> u32 {
    if family_id >= FAMILY_AI {
        write_length - 1
    } else {
        write_length
    }
}

/// PM4 builders for the GFX and COMPUTE rings.
#[derive(Debug)]
pub struct GfxIpFuncs {
    params: IpParams,
}

impl GfxIpFuncs {
    pub fn new(family_id: u32) -> Self {
        GfxIpFuncs {
            params: IpParams::v8(family_id),
        }
    }
}

impl IpFuncs for GfxIpFuncs {
    fn params(&self) -> &IpParams {
        &self.params
    }

    fn write_linear(&self, ring: &mut RingContext) -> Result<usize> {
        let bo_mc = ring.bo_mc;
        let len = write_length(ring)?;
        let pm4 = &mut ring.pm4;
        if !ring.secure {
            pm4.reset();
            pm4.emit(packet3(PACKET3_WRITE_DATA, 2 + len))?;
            pm4.emit(write_data_dst_sel(WRITE_DATA_DST_SEL_MEM) | WRITE_DATA_WR_CONFIRM)?;
            pm4.emit(lower_32_bits(bo_mc) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(bo_mc))?;
            pm4.emit_repeat(self.params.deadbeaf, len as usize)?;
        } else {
            pm4.clear();
            pm4.emit(packet3(PACKET3_ATOMIC_MEM, 7))?;
            // compare-swap, loop until the compare is satisfied, on the ME
            pm4.emit(
                TC_OP_ATOMIC_CMPSWAP_RTN_32
                    | atomic_mem_command(1)
                    | atomic_mem_cache_policy(0)
                    | atomic_mem_engine_sel(0),
            )?;
            pm4.emit(lower_32_bits(bo_mc) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(bo_mc))?;
            pm4.emit_slice(&[0x12345678, 0x0, 0xdeadbeaf, 0x0, 0x100])?;
        }
        ring.pm4_dw = ring.pm4.cdw();
        Ok(ring.pm4_dw)
    }

    fn const_fill(&self, ring: &mut RingContext) -> Result<usize> {
        let bo_mc = ring.bo_mc;
        let len = write_length(ring)?;
        let pm4 = &mut ring.pm4;
        pm4.reset();
        if self.params.family_id == FAMILY_SI {
            pm4.emit(packet3(PACKET3_DMA_DATA_SI, 4))?;
            pm4.emit(self.params.deadbeaf)?;
            pm4.emit(
                dma_data_si_engine(0)
                    | dma_data_si_dst_sel(0)
                    | dma_data_si_src_sel(DMA_DATA_SRC_SEL_DATA)
                    | DMA_DATA_SI_CP_SYNC,
            )?;
            pm4.emit(lower_32_bits(bo_mc))?;
            pm4.emit(upper_32_bits(bo_mc))?;
            pm4.emit(len)?;
        } else {
            pm4.emit(packet3(PACKET3_DMA_DATA, 5))?;
            pm4.emit(
                dma_data_engine(0)
                    | dma_data_dst_sel(0)
                    | dma_data_src_sel(DMA_DATA_SRC_SEL_DATA)
                    | DMA_DATA_CP_SYNC,
            )?;
            pm4.emit(self.params.deadbeaf)?;
            pm4.emit(0)?;
            pm4.emit(lower_32_bits(bo_mc) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(bo_mc))?;
            pm4.emit(len)?;
        }
        ring.pm4_dw = ring.pm4.cdw();
        Ok(ring.pm4_dw)
    }

    fn copy_linear(&self, ring: &mut RingContext) -> Result<usize> {
        let src = ring.bo_mc;
        let dst = ring.bo_mc2;
        let len = write_length(ring)?;
        let pm4 = &mut ring.pm4;
        pm4.reset();
        if self.params.family_id == FAMILY_SI {
            pm4.emit(packet3(PACKET3_DMA_DATA_SI, 4))?;
            pm4.emit(lower_32_bits(src) & 0xfffffffc)?;
            pm4.emit(
                dma_data_si_engine(0)
                    | dma_data_si_dst_sel(0)
                    | dma_data_si_src_sel(0)
                    | DMA_DATA_SI_CP_SYNC
                    | ((src & 0xffff00000000) >> 32) as u32,
            )?;
            pm4.emit(lower_32_bits(dst) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(dst))?;
            pm4.emit(len)?;
        } else {
            pm4.emit(packet3(PACKET3_DMA_DATA, 5))?;
            pm4.emit(dma_data_engine(0) | dma_data_dst_sel(0) | dma_data_src_sel(0) | DMA_DATA_CP_SYNC)?;
            pm4.emit(lower_32_bits(src) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(src))?;
            pm4.emit(lower_32_bits(dst) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(dst))?;
            pm4.emit(len)?;
        }
        ring.pm4_dw = ring.pm4.cdw();
        Ok(ring.pm4_dw)
    }
}

/// Builders for the SDMA engine.
#[derive(Debug)]
pub struct SdmaIpFuncs {
    params: IpParams,
}

impl SdmaIpFuncs {
    pub fn new(family_id: u32) -> Self {
        SdmaIpFuncs {
            params: IpParams::v8(family_id),
        }
    }
}

impl IpFuncs for SdmaIpFuncs {
    fn params(&self) -> &IpParams {
        &self.params
    }

    fn write_linear(&self, ring: &mut RingContext) -> Result<usize> {
        let bo_mc = ring.bo_mc;
        let len = write_length(ring)?;
        let family_id = self.params.family_id;
        let pm4 = &mut ring.pm4;
        if !ring.secure {
            pm4.reset();
            if family_id == FAMILY_SI {
                pm4.emit(sdma_packet_si(SDMA_OPCODE_WRITE, 0, 0, 0, len))?;
            } else {
                pm4.emit(sdma_packet(SDMA_OPCODE_WRITE, SDMA_WRITE_SUB_OPCODE_LINEAR, 0))?;
            }
            pm4.emit(lower_32_bits(bo_mc) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(bo_mc))?;
            // SI carries the count in the header
            if family_id != FAMILY_SI {
                pm4.emit(sized_count(family_id, len))?;
            }
            pm4.emit_repeat(self.params.deadbeaf, len as usize)?;
        } else {
            pm4.clear();
            pm4.emit(sdma_packet(
                SDMA_OPCODE_ATOMIC,
                0,
                sdma_atomic_loop(1) | sdma_atomic_tmz(1) | sdma_atomic_opcode(TC_OP_ATOMIC_CMPSWAP_RTN_32),
            ))?;
            pm4.emit(lower_32_bits(bo_mc) & 0xfffffffc)?;
            pm4.emit(upper_32_bits(bo_mc))?;
            pm4.emit_slice(&[0x12345678, 0x0, self.params.deadbeaf, 0x0, 0x100])?;
        }
        ring.pm4_dw = ring.pm4.cdw();
        Ok(ring.pm4_dw)
    }

    fn const_fill(&self, ring: &mut RingContext) -> Result<usize> {
        let bo_mc = ring.bo_mc;
        let len = write_length(ring)?;
        let family_id = self.params.family_id;
        let pm4 = &mut ring.pm4;
        pm4.reset();
        if family_id == FAMILY_SI {
            pm4.emit(sdma_packet_si(SDMA_OPCODE_CONSTANT_FILL_SI, 0, 0, 0, len / 4))?;
            pm4.emit(lower_32_bits(bo_mc) & 0xfffffffc)?;
            pm4.emit(self.params.deadbeaf)?;
            pm4.emit(((bo_mc & 0xffffffff00000000) >> 16) as u32)?;
        } else {
            pm4.emit(sdma_packet(SDMA_OPCODE_CONSTANT_FILL, 0, sdma_constant_fill_extra_size(2)))?;
            pm4.emit(lower_32_bits(bo_mc))?;
            pm4.emit(upper_32_bits(bo_mc))?;
            pm4.emit(self.params.deadbeaf)?;
            pm4.emit(sized_count(family_id, len))?;
        }
        ring.pm4_dw = ring.pm4.cdw();
        Ok(ring.pm4_dw)
    }

    fn copy_linear(&self, ring: &mut RingContext) -> Result<usize> {
        let src = ring.bo_mc;
        let dst = ring.bo_mc2;
        let len = write_length(ring)?;
        let family_id = self.params.family_id;
        let pm4 = &mut ring.pm4;
        pm4.reset();
        if family_id == FAMILY_SI {
            pm4.emit(sdma_packet_si(SDMA_OPCODE_COPY_SI, 0, 0, 0, len))?;
            pm4.emit(lower_32_bits(dst))?;
            pm4.emit(lower_32_bits(src))?;
            pm4.emit(upper_32_bits(dst))?;
            pm4.emit(upper_32_bits(src))?;
        } else {
            pm4.emit(sdma_packet(SDMA_OPCODE_COPY, SDMA_COPY_SUB_OPCODE_LINEAR, 0))?;
            pm4.emit(sized_count(family_id, len))?;
            pm4.emit(0)?;
            pm4.emit(lower_32_bits(src))?;
            pm4.emit(upper_32_bits(src))?;
            pm4.emit(lower_32_bits(dst))?;
            pm4.emit(upper_32_bits(dst))?;
        }
        ring.pm4_dw = ring.pm4.cdw();
        Ok(ring.pm4_dw)
    }
}

#[derive(Debug, Clone)]
pub struct IpBlockVersion {
    pub ip_type: IpType,
    pub major: u32,
    pub minor: u32,
    pub rev: u32,
    pub funcs: Arc<dyn IpFuncs>,
}

/// The IP blocks selected for one device. Built once by [`setup`] and
/// read-only afterwards, so it can be shared across threads by reference.
///
/// [`setup`]: IpBlockRegistry::setup
#[derive(Debug)]
pub struct IpBlockRegistry {
    device: DeviceId,
    chip: ChipInfo,
    blocks: Vec<IpBlockVersion>,
}

impl IpBlockRegistry {
    /// Identifies the chip behind `info` and registers the matching blocks.
    ///
    /// `major`/`minor` are the DRM interface version and are only logged.
    pub fn setup(major: u32, minor: u32, info: &GpuInfo, device: &dyn Device) -> Result<Self> {
        let chip = identify_chip(info.family_id, info.chip_external_rev).ok_or(Error::UnsupportedAsic {
            family_id: info.family_id,
            chip_external_rev: info.chip_external_rev,
        })?;
        info!(
            chip = chip.name,
            class = ?chip.class,
            drm = %format!("{}.{}", major, minor),
            "identified asic"
        );

        let mut registry = IpBlockRegistry {
            device: device.id(),
            chip,
            blocks: Vec::new(),
        };
        match chip.class {
            ChipClass::Gfx6 | ChipClass::Gfx7 | ChipClass::Gfx8 | ChipClass::Gfx9 | ChipClass::Gfx10 => {
                let gfx: Arc<dyn IpFuncs> = Arc::new(GfxIpFuncs::new(info.family_id));
                let sdma: Arc<dyn IpFuncs> = Arc::new(SdmaIpFuncs::new(info.family_id));
                registry.add(IpType::Gfx, 8, gfx.clone())?;
                registry.add(IpType::Compute, 8, gfx)?;
                registry.add(IpType::Dma, 3, sdma)?;
            }
            ChipClass::Gfx10_3 => {
                debug!(chip = chip.name, "no ip blocks for this chip class");
            }
        }
        Ok(registry)
    }

    fn add(&mut self, ip_type: IpType, major: u32, funcs: Arc<dyn IpFuncs>) -> Result<()> {
        if self.blocks.len() >= AMD_IP_MAX || self.blocks.iter().any(|b| b.ip_type == ip_type) {
            return Err(Error::InvalidArgument("ip block already registered"));
        }
        self.blocks.push(IpBlockVersion {
            ip_type,
            major,
            minor: 0,
            rev: 0,
            funcs,
        });
        Ok(())
    }

    /// The block for `ip_type`, or `None` for a foreign device or an IP
    /// this chip has no block for.
    pub fn get_ip_block(&self, device: &dyn Device, ip_type: IpType) -> Option<&IpBlockVersion> {
        if device.id() != self.device {
            return None;
        }
        self.blocks.iter().find(|b| b.ip_type == ip_type)
    }

    pub fn ip_block(&self, device: &dyn Device, ip_type: IpType) -> Result<&IpBlockVersion> {
        self.get_ip_block(device, ip_type)
            .ok_or(Error::IpBlockNotFound(ip_type))
    }

    pub fn chip(&self) -> &ChipInfo {
        &self.chip
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn blocks(&self) -> &[IpBlockVersion] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChipPreset, SimConfig};
    use crate::family::{FAMILY_NV, FAMILY_VI};
    use crate::sim::SimDevice;
    use pretty_assertions::assert_eq;

    fn ring_with(write_length: u32, bo_mc: u64, bo_mc2: Option<u64>) -> RingContext {
        let mut ring = RingContext::new(write_length, 256).unwrap();
        ring.bo_mc = bo_mc;
        ring.bo_mc2 = bo_mc2.unwrap_or(0);
        ring
    }

    #[test]
    fn gfx_write_linear_layout() {
        let funcs = GfxIpFuncs::new(FAMILY_VI);
        let mut ring = ring_with(2, 0x1_2345_6789, None);
        assert_eq!(funcs.write_linear(&mut ring).unwrap(), 6);
        assert_eq!(
            ring.pm4.as_slice(),
            &[0xc0043700, 0x00100500, 0x23456788, 0x1, 0xdeadbeaf, 0xdeadbeaf]
        );
    }

    #[test]
    fn gfx_secure_write_uses_atomic_cmpswap() {
        let funcs = GfxIpFuncs::new(FAMILY_VI);
        let mut ring = ring_with(2, 0x1000, None);
        ring.secure = true;
        funcs.write_linear(&mut ring).unwrap();
        assert_eq!(
            ring.pm4.as_slice(),
            &[0xc0071e00, 0x108, 0x1000, 0, 0x12345678, 0, 0xdeadbeaf, 0, 0x100]
        );
    }

    #[test]
    fn gfx_fill_and_copy_layouts() {
        let funcs = GfxIpFuncs::new(FAMILY_VI);
        let mut ring = ring_with(1024, 0x2_0000_1000, Some(0x3_0000_2000));
        funcs.const_fill(&mut ring).unwrap();
        assert_eq!(
            ring.pm4.as_slice(),
            &[0xc0055000, 0xc0000000, 0xdeadbeaf, 0, 0x1000, 2, 1024]
        );
        funcs.copy_linear(&mut ring).unwrap();
        assert_eq!(
            ring.pm4.as_slice(),
            &[0xc0055000, 0x80000000, 0x1000, 2, 0x2000, 3, 1024]
        );
    }

    #[test]
    fn gfx_si_variants() {
        let funcs = GfxIpFuncs::new(FAMILY_SI);
        let mut ring = ring_with(64, 0x2_0000_1000, Some(0x3_0000_2000));
        funcs.const_fill(&mut ring).unwrap();
        assert_eq!(
            ring.pm4.as_slice(),
            &[0xc0044100, 0xdeadbeaf, 0xc0000000, 0x1000, 2, 64]
        );
        funcs.copy_linear(&mut ring).unwrap();
        assert_eq!(
            ring.pm4.as_slice(),
            &[0xc0044100, 0x1000, 0x80000002, 0x2000, 3, 64]
        );
    }

    #[test]
    fn sdma_counts_follow_family() {
        let vi = SdmaIpFuncs::new(FAMILY_VI);
        let ai = SdmaIpFuncs::new(FAMILY_AI);
        let mut ring = ring_with(4, 0x1_0000_0010, Some(0x1_0000_1000));
        vi.write_linear(&mut ring).unwrap();
        assert_eq!(&ring.pm4.as_slice()[..4], &[0x2, 0x10, 1, 4]);
        ai.write_linear(&mut ring).unwrap();
        assert_eq!(ring.pm4.as_slice()[3], 3);
        assert_eq!(ring.pm4_dw, 8);

        ai.const_fill(&mut ring).unwrap();
        assert_eq!(ring.pm4.as_slice(), &[0x8000000b, 0x10, 1, 0xdeadbeaf, 3]);
        ai.copy_linear(&mut ring).unwrap();
        assert_eq!(ring.pm4.as_slice(), &[0x1, 3, 0, 0x10, 1, 0x1000, 1]);
    }

    #[test]
    fn zero_length_is_refused() {
        let mut ring = ring_with(0, 0x1_0000_0010, Some(0x1_0000_1000));
        let sdma = SdmaIpFuncs::new(FAMILY_AI);
        let gfx = GfxIpFuncs::new(FAMILY_NV);
        for funcs in [&sdma as &dyn IpFuncs, &gfx] {
            assert!(matches!(funcs.write_linear(&mut ring), Err(Error::InvalidArgument(_))));
            assert!(matches!(funcs.const_fill(&mut ring), Err(Error::InvalidArgument(_))));
            assert!(matches!(funcs.copy_linear(&mut ring), Err(Error::InvalidArgument(_))));
        }
        assert_eq!(ring.pm4.cdw(), 0);
    }

    #[test]
    fn sdma_si_variants() {
        let si = SdmaIpFuncs::new(FAMILY_SI);
        let mut ring = ring_with(8, 0x1_0000_0010, Some(0x2_0000_1000));
        si.write_linear(&mut ring).unwrap();
        assert_eq!(&ring.pm4.as_slice()[..3], &[0x2000_0008, 0x10, 1]);
        assert_eq!(ring.pm4_dw, 11);
        si.const_fill(&mut ring).unwrap();
        assert_eq!(ring.pm4.as_slice(), &[0xd000_0002, 0x10, 0xdeadbeaf, 0x10000]);
        si.copy_linear(&mut ring).unwrap();
        assert_eq!(ring.pm4.as_slice(), &[0x3000_0008, 0x1000, 0x10, 2, 1]);
    }

    #[test]
    fn compare_reports_first_mismatch() {
        let mut data = vec![0xdeadbeafu32; 8];
        data[5] = 0;
        assert!(compare_dwords(&data, 5, 0xdeadbeaf).is_ok());
        assert!(matches!(
            compare_dwords(&data, 8, 0xdeadbeaf),
            Err(Error::Mismatch {
                index: 5,
                found: 0,
                ..
            })
        ));
    }

    #[test]
    fn registry_selects_blocks_per_class() {
        let dev = SimDevice::new(SimConfig::preset(ChipPreset::Vega10));
        let info = dev.query_gpu_info().unwrap();
        let reg = IpBlockRegistry::setup(3, 42, &info, &dev).unwrap();
        let gfx = reg.get_ip_block(&dev, IpType::Gfx).unwrap();
        assert_eq!((gfx.major, gfx.funcs.params().family_id), (8, FAMILY_AI));
        assert_eq!(reg.ip_block(&dev, IpType::Dma).unwrap().major, 3);
        assert!(reg.get_ip_block(&dev, IpType::Uvd).is_none());

        let other = SimDevice::new(SimConfig::preset(ChipPreset::Vega10));
        assert!(reg.get_ip_block(&other, IpType::Gfx).is_none());
    }

    #[test]
    fn registry_rejects_unknown_and_empty_classes() {
        let dev = SimDevice::new(SimConfig::default());
        let unknown = GpuInfo {
            family_id: 7,
            chip_external_rev: 1,
            ..Default::default()
        };
        assert!(matches!(
            IpBlockRegistry::setup(3, 0, &unknown, &dev),
            Err(Error::UnsupportedAsic { family_id: 7, .. })
        ));
        let sienna = GpuInfo {
            family_id: FAMILY_NV,
            chip_external_rev: 0x28,
            ..Default::default()
        };
        let reg = IpBlockRegistry::setup(3, 0, &sienna, &dev).unwrap();
        assert!(matches!(
            reg.ip_block(&dev, IpType::Gfx),
            Err(Error::IpBlockNotFound(IpType::Gfx))
        ));
    }
}
