//! Everything one submission needs: its packet stream, the buffers the
//! packets address, the submission context and the request that carries
//! the fence back.

use tracing::debug;

use crate::cmd_base::CmdBase;
use crate::device::{BoHandle, ContextHandle, CpuMapping, CsFence, CsRequest, Device, HwIpInfo, IbInfo};
use crate::error::{Error, Result};
use crate::ip_block::IpType;
use crate::memory::GpuBuffer;

/// Buffers a single submission may list besides its IB.
pub const MAX_RESOURCES: usize = 4;

pub struct RingContext {
    pub ring_id: u32,
    /// Payload length; dwords or bytes depending on the packet builder.
    pub write_length: u32,
    pub pm4: CmdBase<'static>,
    /// Dwords of `pm4` the last builder produced.
    pub pm4_dw: usize,
    pub secure: bool,

    pub bo_mc: u64,
    pub bo_mc2: u64,
    pub bo: Option<GpuBuffer>,
    pub bo2: Option<GpuBuffer>,
    /// First dword of `bo` saved before a secure re-run.
    pub bo_cpu_origin: u32,

    context: Option<ContextHandle>,
    pub hw_ip_info: HwIpInfo,
    resources: Vec<BoHandle>,

    pub ib_info: IbInfo,
    pub request: CsRequest,
}

impl RingContext {
    /// A ring context with a `pm4_size` dword packet stream and no
    /// buffers or submission context yet.
    pub fn new(write_length: u32, pm4_size: usize) -> Result<Self> {
        Ok(RingContext {
            ring_id: 0,
            write_length,
            pm4: CmdBase::with_capacity(pm4_size)?,
            pm4_dw: 0,
            secure: false,
            bo_mc: 0,
            bo_mc2: 0,
            bo: None,
            bo2: None,
            bo_cpu_origin: 0,
            context: None,
            hw_ip_info: HwIpInfo::default(),
            resources: Vec::with_capacity(MAX_RESOURCES),
            ib_info: IbInfo::default(),
            request: CsRequest::new(IpType::Gfx, 0),
        })
    }

    /// Opens the submission context every later submit and fence query on
    /// this ring context is scoped to.
    pub fn create(&mut self, device: &dyn Device) -> Result<ContextHandle> {
        if self.context.is_some() {
            return Err(Error::InvalidArgument("ring context already has a submission context"));
        }
        let ctx = device.cs_ctx_create()?;
        debug!(?ctx, "ring context created");
        self.context = Some(ctx);
        Ok(ctx)
    }

    pub fn context(&self) -> Result<ContextHandle> {
        self.context
            .ok_or(Error::InvalidArgument("ring context has no submission context"))
    }

    pub fn query_hw_ip_info(&mut self, device: &dyn Device, ip_type: IpType) -> Result<&HwIpInfo> {
        self.hw_ip_info = device.query_hw_ip_info(ip_type, 0)?;
        Ok(&self.hw_ip_info)
    }

    /// Installs the primary buffer and records its address for the packet
    /// builders. A buffer already installed is handed back.
    pub fn set_bo(&mut self, buf: GpuBuffer) -> Option<GpuBuffer> {
        self.bo_mc = buf.mc_address;
        self.bo.replace(buf)
    }

    pub fn set_bo2(&mut self, buf: GpuBuffer) -> Option<GpuBuffer> {
        self.bo_mc2 = buf.mc_address;
        self.bo2.replace(buf)
    }

    pub fn bo_cpu(&self) -> Result<&CpuMapping> {
        self.bo
            .as_ref()
            .map(GpuBuffer::cpu)
            .ok_or(Error::InvalidArgument("ring context has no bo"))
    }

    pub fn bo2_cpu(&self) -> Result<&CpuMapping> {
        self.bo2
            .as_ref()
            .map(GpuBuffer::cpu)
            .ok_or(Error::InvalidArgument("ring context has no bo2"))
    }

    pub fn set_resources(&mut self, bos: &[BoHandle]) -> Result<()> {
        if bos.len() > MAX_RESOURCES {
            return Err(Error::CapacityExceeded {
                requested: bos.len(),
                capacity: MAX_RESOURCES,
            });
        }
        self.resources.clear();
        self.resources.extend_from_slice(bos);
        Ok(())
    }

    pub fn resources(&self) -> &[BoHandle] {
        &self.resources
    }

    pub fn res_cnt(&self) -> usize {
        self.resources.len()
    }

    /// The fence of the last submission made through `request`.
    pub fn fence(&self) -> Result<CsFence> {
        Ok(self.request.fence(self.context()?))
    }

    /// Releases both buffers if present.
    pub fn free_bos(&mut self, device: &dyn Device) -> Result<()> {
        if let Some(bo2) = self.bo2.take() {
            bo2.unmap_and_free(device)?;
        }
        if let Some(bo) = self.bo.take() {
            bo.unmap_and_free(device)?;
        }
        self.resources.clear();
        Ok(())
    }

    /// Frees buffers first, then the submission context.
    pub fn destroy(mut self, device: &dyn Device) -> Result<()> {
        self.free_bos(device)?;
        if let Some(ctx) = self.context.take() {
            device.cs_ctx_free(ctx)?;
        }
        self.pm4.free();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::device::{GemCreateFlags, GemDomain};
    use crate::sim::{SimCall, SimDevice};

    #[test]
    fn resources_are_bounded() {
        let mut ring = RingContext::new(16, 64).unwrap();
        let bos = [BoHandle(1), BoHandle(2), BoHandle(3), BoHandle(4), BoHandle(5)];
        assert!(ring.set_resources(&bos[..4]).is_ok());
        assert_eq!(ring.res_cnt(), 4);
        assert!(matches!(
            ring.set_resources(&bos),
            Err(Error::CapacityExceeded { requested: 5, .. })
        ));
        assert!(ring.fence().is_err());
    }

    #[test]
    fn destroy_releases_buffers_before_context() {
        let dev = SimDevice::new(SimConfig::default());
        let mut ring = RingContext::new(16, 64).unwrap();
        ring.create(&dev).unwrap();
        assert!(ring.create(&dev).is_err());
        let buf = GpuBuffer::alloc_and_map(&dev, 4096, 4096, GemDomain::GTT, GemCreateFlags::empty()).unwrap();
        let mc = buf.mc_address;
        assert!(ring.set_bo(buf).is_none());
        assert_eq!(ring.bo_mc, mc);
        assert!(ring.bo_cpu().is_ok());
        assert!(ring.bo2_cpu().is_err());

        dev.clear_call_log();
        ring.destroy(&dev).unwrap();
        let log = dev.call_log();
        assert_eq!(log.first(), Some(&SimCall::BoCpuUnmap));
        assert_eq!(log.last(), Some(&SimCall::CtxFree));
        assert_eq!(dev.live_bo_count(), 0);
    }
}
