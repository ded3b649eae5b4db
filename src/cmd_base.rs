//! Dword command stream builder.
//!
//! A [`CmdBase`] writes 32-bit words through a cursor (`cdw`) into either
//! storage it owns or a caller-provided slice such as the CPU mapping of an
//! IB. Every emit is bounds checked and fails with
//! [`Error::CapacityExceeded`] instead of writing past the end; a failed
//! emit leaves the stream untouched.

use tracing::debug;

use crate::error::{Error, Result};

enum Storage<'a> {
    Owned(Vec<u32>),
    Attached(&'a mut [u32]),
}

pub struct CmdBase<'a> {
    cdw: usize,
    storage: Storage<'a>,
}

impl Default for CmdBase<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> CmdBase<'a> {
    /// An empty, self-owned stream with no capacity yet.
    pub fn new() -> Self {
        CmdBase {
            cdw: 0,
            storage: Storage::Owned(Vec::new()),
        }
    }

    pub fn with_capacity(size_dw: usize) -> Result<Self> {
        let mut base = Self::new();
        base.allocate(size_dw)?;
        Ok(base)
    }

    /// Reserves `size_dw` dwords of owned storage and rewinds the cursor.
    /// Storage only grows; a smaller request keeps the current buffer.
    pub fn allocate(&mut self, size_dw: usize) -> Result<()> {
        match &mut self.storage {
            Storage::Attached(_) => return Err(Error::AlreadyAttached),
            Storage::Owned(buf) => {
                if size_dw > buf.len() {
                    let mut grown = Vec::new();
                    grown
                        .try_reserve_exact(size_dw)
                        .map_err(|_| Error::kernel("cmd_base allocate", nix::errno::Errno::ENOMEM))?;
                    grown.resize(size_dw, 0);
                    *buf = grown;
                }
            }
        }
        self.cdw = 0;
        Ok(())
    }

    /// Binds the stream to external dword storage without taking ownership.
    pub fn attach(&mut self, buf: &'a mut [u32]) -> Result<()> {
        if self.is_attached() {
            return Err(Error::AlreadyAttached);
        }
        self.storage = Storage::Attached(buf);
        self.cdw = 0;
        Ok(())
    }

    /// Byte-sized variant of [`attach`](Self::attach); the region must be
    /// dword aligned in both address and length.
    pub fn attach_bytes(&mut self, buf: &'a mut [u8]) -> Result<()> {
        let addr = buf.as_ptr() as u64;
        let len = buf.len() as u64;
        let dwords: &'a mut [u32] = bytemuck::try_cast_slice_mut(buf).map_err(|_| Error::Misaligned {
            what: "attached buffer",
            value: if addr % 4 != 0 { addr } else { len },
            alignment: 4,
        })?;
        self.attach(dwords)
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.storage, Storage::Attached(_))
    }

    pub fn cdw(&self) -> usize {
        self.cdw
    }

    pub fn max_dw(&self) -> usize {
        self.buf().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cdw == 0
    }

    /// Rewinds the cursor; the previous contents stay in storage.
    pub fn reset(&mut self) {
        self.cdw = 0;
    }

    /// Rewinds the cursor and zeroes the whole region.
    pub fn clear(&mut self) {
        self.buf_mut().fill(0);
        self.cdw = 0;
    }

    /// The dwords emitted so far.
    pub fn as_slice(&self) -> &[u32] {
        &self.buf()[..self.cdw]
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.as_slice())
    }

    fn buf(&self) -> &[u32] {
        match &self.storage {
            Storage::Owned(v) => v.as_slice(),
            Storage::Attached(s) => s,
        }
    }

    fn buf_mut(&mut self) -> &mut [u32] {
        match &mut self.storage {
            Storage::Owned(v) => v.as_mut_slice(),
            Storage::Attached(s) => s,
        }
    }

    fn reserve(&self, count: usize) -> Result<()> {
        let requested = self.cdw + count;
        if requested > self.max_dw() {
            return Err(Error::CapacityExceeded {
                requested,
                capacity: self.max_dw(),
            });
        }
        Ok(())
    }

    pub fn emit(&mut self, value: u32) -> Result<()> {
        self.reserve(1)?;
        let cdw = self.cdw;
        self.buf_mut()[cdw] = value;
        self.cdw += 1;
        Ok(())
    }

    pub fn emit_slice(&mut self, values: &[u32]) -> Result<()> {
        self.reserve(values.len())?;
        let cdw = self.cdw;
        self.buf_mut()[cdw..cdw + values.len()].copy_from_slice(values);
        self.cdw += values.len();
        Ok(())
    }

    pub fn emit_repeat(&mut self, value: u32, count: usize) -> Result<()> {
        self.reserve(count)?;
        let cdw = self.cdw;
        self.buf_mut()[cdw..cdw + count].fill(value);
        self.cdw += count;
        Ok(())
    }

    /// Pads with `value` until `cdw & mask == 0`.
    pub fn emit_aligned(&mut self, mask: u32, value: u32) -> Result<()> {
        let mask = mask as usize;
        let pad = (mask + 1 - (self.cdw & mask)) & mask;
        self.emit_repeat(value, pad)
    }

    /// Overwrites the already emitted dword at absolute index `offset_dw`.
    pub fn emit_at_offset(&mut self, value: u32, offset_dw: usize) -> Result<()> {
        if offset_dw >= self.cdw {
            return Err(Error::CapacityExceeded {
                requested: offset_dw + 1,
                capacity: self.cdw,
            });
        }
        self.buf_mut()[offset_dw] = value;
        Ok(())
    }

    /// Copies `size` bytes of `src` to byte `offset` past the cursor, then
    /// moves the cursor over the offset gap and the copied bytes.
    pub fn emit_buf(&mut self, src: &[u8], offset: usize, size: usize) -> Result<()> {
        if size % 4 != 0 || offset % 4 != 0 {
            return Err(Error::Misaligned {
                what: "emit_buf size/offset",
                value: (if size % 4 != 0 { size } else { offset }) as u64,
                alignment: 4,
            });
        }
        if src.len() < size {
            return Err(Error::DestinationTooSmall {
                needed: size,
                available: src.len(),
            });
        }
        let total_dw = (offset + size) >> 2;
        self.reserve(total_dw)?;
        let start = self.cdw * 4 + offset;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.buf_mut());
        bytes[start..start + size].copy_from_slice(&src[..size]);
        self.cdw += total_dw;
        debug!(offset, size, cdw = self.cdw, "emit_buf");
        Ok(())
    }

    /// Drops owned storage; attached storage is simply forgotten.
    pub fn free(&mut self) {
        self.storage = Storage::Owned(Vec::new());
        self.cdw = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn emits_in_order() {
        let mut base = CmdBase::with_capacity(16).unwrap();
        base.emit(1).unwrap();
        base.emit_repeat(0xffff1000, 3).unwrap();
        base.emit_slice(&[7, 8]).unwrap();
        assert_eq!(base.as_slice(), &[1, 0xffff1000, 0xffff1000, 0xffff1000, 7, 8]);
    }

    #[test]
    fn overflow_is_reported_and_harmless() {
        let mut base = CmdBase::with_capacity(2).unwrap();
        base.emit(1).unwrap();
        let err = base.emit_repeat(0, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                requested: 3,
                capacity: 2
            }
        ));
        assert_eq!(base.cdw(), 1);
        base.emit(2).unwrap();
        assert!(base.emit(3).is_err());
    }

    #[test]
    fn aligned_is_idempotent() {
        let mut base = CmdBase::with_capacity(32).unwrap();
        base.emit_aligned(7, 0xffff1000).unwrap();
        assert_eq!(base.cdw(), 0);
        base.emit(5).unwrap();
        base.emit_aligned(7, 0xffff1000).unwrap();
        assert_eq!(base.cdw(), 8);
        assert!(base.as_slice()[1..].iter().all(|&v| v == 0xffff1000));
    }

    #[test]
    fn back_patches_emitted_dwords_only() {
        let mut base = CmdBase::with_capacity(4).unwrap();
        base.emit_slice(&[1, 2, 3]).unwrap();
        base.emit_at_offset(9, 1).unwrap();
        assert_eq!(base.as_slice(), &[1, 9, 3]);
        assert!(base.emit_at_offset(9, 3).is_err());
    }

    #[test]
    fn emit_buf_moves_cursor_past_gap() {
        let mut base = CmdBase::with_capacity(8).unwrap();
        base.emit(0xaa).unwrap();
        base.emit_buf(&[1, 0, 0, 0, 2, 0, 0, 0], 4, 8).unwrap();
        assert_eq!(base.cdw(), 4);
        assert_eq!(base.as_slice(), &[0xaa, 0, 1, 2]);
        assert!(matches!(
            base.emit_buf(&[0; 3], 0, 3),
            Err(Error::Misaligned { .. })
        ));
    }

    #[test]
    fn attach_bytes_needs_dword_granularity() {
        let mut backing = vec![0u32; 4];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing);
        assert!(matches!(CmdBase::new().attach_bytes(&mut bytes[1..9]), Err(Error::Misaligned { .. })));
        assert!(matches!(CmdBase::new().attach_bytes(&mut bytes[..6]), Err(Error::Misaligned { .. })));
        let mut base = CmdBase::new();
        base.attach_bytes(bytes).unwrap();
        base.emit(0x01020304).unwrap();
        base.free();
        assert_eq!(backing[0], 0x01020304);
    }

    #[test]
    fn attach_borrows_external_storage() {
        let mut backing = [0u32; 4];
        {
            let mut base = CmdBase::new();
            base.attach(&mut backing).unwrap();
            assert!(base.is_attached());
            assert!(matches!(base.allocate(8), Err(Error::AlreadyAttached)));
            base.emit_slice(&[3, 4]).unwrap();
            let mut other = [0u32; 2];
            assert!(matches!(base.attach(&mut other), Err(Error::AlreadyAttached)));
            base.free();
            assert_eq!(base.max_dw(), 0);
        }
        assert_eq!(backing, [3, 4, 0, 0]);
    }

    #[test]
    fn allocate_only_grows() {
        let mut base = CmdBase::with_capacity(8).unwrap();
        base.emit(1).unwrap();
        base.allocate(4).unwrap();
        assert_eq!((base.cdw(), base.max_dw()), (0, 8));
        base.allocate(32).unwrap();
        assert_eq!(base.max_dw(), 32);
    }

    proptest! {
        #[test]
        fn cursor_tracks_emitted_words(words in proptest::collection::vec(any::<u32>(), 0..64), mask in 0u32..16) {
            let mut base = CmdBase::with_capacity(128).unwrap();
            for w in &words {
                base.emit(*w).unwrap();
            }
            prop_assert_eq!(base.cdw(), words.len());
            prop_assert_eq!(base.as_slice(), words.as_slice());

            let mask = mask.next_power_of_two().saturating_sub(1);
            base.emit_aligned(mask, 0x80000000).unwrap();
            prop_assert_eq!(base.cdw() as u32 & mask, 0);
            prop_assert!(base.as_slice()[words.len()..].iter().all(|&v| v == 0x80000000));
        }
    }
}
