//! Submitting IBs and observing how they ended.
//!
//! A [`Submission`] walks `Built -> Submitted -> Completed | TimedOut |
//! Canceled | Hung`. Failures surface as [`Error`]s with the kernel code
//! intact, except the outcomes a caller explicitly tolerates: a canceled
//! submit or wait, and an unknown reset after an intentional hang.

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::device::{BoListHandle, ContextHandle, CsFence, CsRequest, Device, IbInfo, ResetStatus, Timeout};
use crate::error::{Error, Result};
use crate::ip_block::IpType;

bitflags! {
    /// Exceptional outcomes a scenario accepts instead of failing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Tolerated: u32 {
        /// `ECANCELED` from submit or fence wait, after a reset or unplug.
        const CANCELED = 1 << 0;
        /// `UNKNOWN_RESET` from the reset query, after an intentional hang.
        const UNKNOWN_RESET = 1 << 1;
    }
}

impl Default for Tolerated {
    fn default() -> Self {
        Tolerated::empty()
    }
}

/// A result that is either a value or a tolerated cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(v) => Some(v),
            Outcome::Canceled => None,
        }
    }
}

impl Tolerated {
    /// Passes `result` through, turning a tolerated `ECANCELED` into
    /// [`Outcome::Canceled`].
    pub fn check<T>(self, op: &'static str, result: Result<T>) -> Result<Outcome<T>> {
        match result {
            Ok(v) => Ok(Outcome::Done(v)),
            Err(e) if e.is_canceled() && self.contains(Tolerated::CANCELED) => {
                warn!(op, "canceled, tolerated");
                Ok(Outcome::Canceled)
            }
            Err(e) => Err(e),
        }
    }

    /// Accepts `NoReset`, and `UnknownReset` only when tolerated.
    pub fn check_reset(self, status: ResetStatus) -> Result<ResetStatus> {
        match status {
            ResetStatus::NoReset => Ok(status),
            ResetStatus::UnknownReset if self.contains(Tolerated::UNKNOWN_RESET) => {
                warn!("unknown reset, tolerated");
                Ok(status)
            }
            found => Err(Error::UnexpectedResetState {
                expected: ResetStatus::NoReset as u32,
                found: found as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Built,
    Submitted(CsFence),
    Completed(CsFence),
    /// The wait ran out before the fence signaled; may be waited again.
    TimedOut(CsFence),
    Canceled,
    Hung(ResetStatus),
}

/// One command submission from packet stream to fence.
#[derive(Debug, Clone)]
pub struct Submission {
    context: ContextHandle,
    request: CsRequest,
    state: SubmissionState,
    tolerated: Tolerated,
}

impl Submission {
    pub fn new(context: ContextHandle, ip_type: IpType, ring: u32) -> Self {
        Submission {
            context,
            request: CsRequest::new(ip_type, ring),
            state: SubmissionState::Built,
            tolerated: Tolerated::empty(),
        }
    }

    pub fn tolerate(mut self, tolerated: Tolerated) -> Self {
        self.tolerated = tolerated;
        self
    }

    pub fn ib(mut self, ib: IbInfo) -> Self {
        self.request.ibs.push(ib);
        self
    }

    pub fn resources(mut self, list: BoListHandle) -> Self {
        self.request.resources = Some(list);
        self
    }

    pub fn depends_on(mut self, fence: CsFence) -> Self {
        self.request.dependencies.push(fence);
        self
    }

    pub fn state(&self) -> SubmissionState {
        self.state
    }

    pub fn request(&self) -> &CsRequest {
        &self.request
    }

    /// The fence once submitted.
    pub fn fence(&self) -> Option<CsFence> {
        match self.state {
            SubmissionState::Submitted(f) | SubmissionState::Completed(f) | SubmissionState::TimedOut(f) => Some(f),
            _ => None,
        }
    }

    /// Hands the request to the device. A failed submit leaves the
    /// submission `Built` unless the failure is a tolerated cancel.
    pub fn submit(&mut self, device: &dyn Device) -> Result<SubmissionState> {
        if self.state != SubmissionState::Built {
            return Err(Error::InvalidArgument("submission already submitted"));
        }
        let result = device.cs_submit(self.context, &mut self.request);
        self.state = match self.tolerated.check("cs_submit", result)? {
            Outcome::Done(()) => {
                let fence = self.request.fence(self.context);
                debug!(ip = ?fence.ip_type, ring = fence.ring, seq = fence.fence, "submitted");
                SubmissionState::Submitted(fence)
            }
            Outcome::Canceled => SubmissionState::Canceled,
        };
        Ok(self.state)
    }

    /// Waits for the fence. An infinite wait that returns without the
    /// fence signaled is an error.
    pub fn wait(&mut self, device: &dyn Device, timeout: Timeout) -> Result<SubmissionState> {
        let fence = match self.state {
            SubmissionState::Submitted(f) | SubmissionState::TimedOut(f) => f,
            SubmissionState::Built => return Err(Error::InvalidArgument("submission not submitted")),
            done => return Ok(done),
        };
        self.state = match wait_fence(device, &fence, timeout, self.tolerated)? {
            Outcome::Done(true) => SubmissionState::Completed(fence),
            Outcome::Done(false) => SubmissionState::TimedOut(fence),
            Outcome::Canceled => SubmissionState::Canceled,
        };
        Ok(self.state)
    }

    /// Queries the context's reset state after the submission ran; an
    /// unknown reset turns a finished submission into `Hung`.
    pub fn check_hang(&mut self, device: &dyn Device) -> Result<ResetStatus> {
        let (status, _) = query_hang_state(device, self.context, self.tolerated)?;
        if status != ResetStatus::NoReset {
            self.state = SubmissionState::Hung(status);
        }
        Ok(status)
    }
}

/// Submits `ibs` on `ring` and returns the fence.
pub fn submit(
    device: &dyn Device,
    context: ContextHandle,
    ip_type: IpType,
    ring: u32,
    ibs: &[IbInfo],
    resources: Option<BoListHandle>,
) -> Result<CsFence> {
    let mut request = CsRequest::new(ip_type, ring);
    request.ibs.extend_from_slice(ibs);
    request.resources = resources;
    device.cs_submit(context, &mut request)?;
    Ok(request.fence(context))
}

/// Waits on one fence; `Done(true)` means it signaled, `Done(false)` that
/// the timeout passed first.
pub fn wait_fence(device: &dyn Device, fence: &CsFence, timeout: Timeout, tolerated: Tolerated) -> Result<Outcome<bool>> {
    let outcome = tolerated.check("cs_query_fence_status", device.cs_query_fence_status(fence, timeout))?;
    if outcome == Outcome::Done(false) && timeout == Timeout::Infinite {
        return Err(Error::FenceNotExpired);
    }
    Ok(outcome)
}

/// Waits on several fences at once. Returns whether the wait was satisfied
/// and, for wait-any, the index of the first signaled fence.
pub fn wait_fences(
    device: &dyn Device,
    fences: &[CsFence],
    wait_all: bool,
    timeout: Timeout,
    tolerated: Tolerated,
) -> Result<Outcome<(bool, u32)>> {
    tolerated.check("cs_wait_fences", device.cs_wait_fences(fences, wait_all, timeout))
}

/// Reset classification of `context` and its hang count, checked against
/// `tolerated`.
pub fn query_hang_state(device: &dyn Device, context: ContextHandle, tolerated: Tolerated) -> Result<(ResetStatus, u32)> {
    let (status, hangs) = device.cs_query_reset_state(context)?;
    Ok((tolerated.check_reset(status)?, hangs))
}

/// Requires the reset classification of `context` to be exactly `expected`.
pub fn expect_reset_state(device: &dyn Device, context: ContextHandle, expected: ResetStatus) -> Result<u32> {
    let (status, hangs) = device.cs_query_reset_state(context)?;
    if status != expected {
        return Err(Error::UnexpectedResetState {
            expected: expected as u32,
            found: status as u32,
        });
    }
    Ok(hangs)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::errno::Errno;

    use super::*;
    use crate::config::SimConfig;
    use crate::device::{GemCreateFlags, GemDomain, IbFlags};
    use crate::memory::{get_bo_list, GpuBuffer};
    use crate::pm4::*;
    use crate::sim::SimDevice;

    fn ib_with(dev: &SimDevice, words: &[u32]) -> (GpuBuffer, IbInfo) {
        let mut buf = GpuBuffer::alloc_and_map(dev, 4096, 4096, GemDomain::GTT, GemCreateFlags::empty()).unwrap();
        buf.cpu_mut().dwords_mut()[..words.len()].copy_from_slice(words);
        let ib = IbInfo {
            flags: IbFlags::empty(),
            ib_mc_address: buf.mc_address,
            size: words.len() as u32,
        };
        (buf, ib)
    }

    #[test]
    fn tolerance_is_opt_in() {
        let canceled: Result<()> = Err(Error::kernel("cs_submit", Errno::ECANCELED));
        assert!(Tolerated::empty().check("cs_submit", canceled).is_err());
        let canceled: Result<()> = Err(Error::kernel("cs_submit", Errno::ECANCELED));
        assert_eq!(Tolerated::CANCELED.check("cs_submit", canceled).unwrap(), Outcome::Canceled);
        let other: Result<()> = Err(Error::kernel("cs_submit", Errno::EINVAL));
        assert!(Tolerated::all().check("cs_submit", other).is_err());

        assert!(Tolerated::empty().check_reset(ResetStatus::UnknownReset).is_err());
        assert!(Tolerated::UNKNOWN_RESET.check_reset(ResetStatus::UnknownReset).is_ok());
        assert!(matches!(
            Tolerated::all().check_reset(ResetStatus::Guilty),
            Err(Error::UnexpectedResetState { expected: 0, found: 1 })
        ));
    }

    #[test]
    fn nop_submission_completes() {
        let dev = SimDevice::new(SimConfig::default());
        let ctx = dev.cs_ctx_create().unwrap();
        let (buf, ib) = ib_with(&dev, &[packet3(PACKET3_NOP, 2), 0, 0, GFX_COMPUTE_NOP]);
        let list = get_bo_list(&dev, buf.bo, None).unwrap();

        let mut sub = Submission::new(ctx, IpType::Compute, 1).ib(ib).resources(list);
        assert!(matches!(sub.submit(&dev).unwrap(), SubmissionState::Submitted(_)));
        assert!(sub.submit(&dev).is_err());
        assert!(matches!(sub.wait(&dev, Timeout::Infinite).unwrap(), SubmissionState::Completed(_)));
        assert_eq!(sub.check_hang(&dev).unwrap(), ResetStatus::NoReset);
        assert_eq!(sub.fence().unwrap().ring, 1);

        dev.bo_list_destroy(list).unwrap();
        buf.unmap_and_free(&dev).unwrap();
    }

    #[test]
    fn a_fault_is_canceled_and_hung() {
        let dev = SimDevice::new(SimConfig::default());
        let ctx = dev.cs_ctx_create().unwrap();
        let (buf, ib) = ib_with(
            &dev,
            &[
                packet3(PACKET3_WRITE_DATA, 3),
                write_data_dst_sel(WRITE_DATA_DST_SEL_MEM),
                0xdeadbee0,
                0,
                0xdeadbeef,
            ],
        );
        let tolerated = Tolerated::CANCELED | Tolerated::UNKNOWN_RESET;
        let mut sub = Submission::new(ctx, IpType::Gfx, 0).ib(ib).tolerate(tolerated);
        sub.submit(&dev).unwrap();
        assert_eq!(sub.wait(&dev, Timeout::Infinite).unwrap(), SubmissionState::Canceled);
        sub.check_hang(&dev).unwrap();
        assert_eq!(sub.state(), SubmissionState::Hung(ResetStatus::UnknownReset));

        let mut again = Submission::new(ctx, IpType::Gfx, 0).ib(ib);
        assert!(again.submit(&dev).unwrap_err().is_canceled());
        assert_eq!(again.state(), SubmissionState::Built);
        buf.unmap_and_free(&dev).unwrap();
    }

    #[test]
    fn timed_out_waits_can_be_resumed() {
        let dev = SimDevice::new(SimConfig::default());
        let ctx = dev.cs_ctx_create().unwrap();
        let (buf, _) = ib_with(&dev, &[]);
        let flag = buf.mc_address + 1024;
        let (ib_buf, ib) = ib_with(
            &dev,
            &[
                packet3(PACKET3_WAIT_REG_MEM, 5),
                wait_reg_mem_mem_space(1) | wait_reg_mem_function(WAIT_REG_MEM_FUNC_NOT_EQUAL),
                flag as u32,
                (flag >> 32) as u32,
                0,
                0xffffffff,
                4,
            ],
        );
        let mut sub = Submission::new(ctx, IpType::Gfx, 0).ib(ib);
        sub.submit(&dev).unwrap();
        let state = sub.wait(&dev, Timeout::Relative(Duration::from_millis(2))).unwrap();
        assert!(matches!(state, SubmissionState::TimedOut(_)));
        buf.cpu().write_volatile(256, 7).unwrap();
        assert!(matches!(sub.wait(&dev, Timeout::Infinite).unwrap(), SubmissionState::Completed(_)));
        assert_eq!(expect_reset_state(&dev, ctx, ResetStatus::NoReset).unwrap(), 0);

        ib_buf.unmap_and_free(&dev).unwrap();
        buf.unmap_and_free(&dev).unwrap();
    }
}
