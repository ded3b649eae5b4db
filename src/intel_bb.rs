//! Intel batch buffer builder.
//!
//! An [`IntelBb`] is a CPU-side image of one batch object addressed by a
//! byte cursor. Commands are appended with [`IntelBb::out`]; indirect state
//! is laid out anywhere in the same object by moving the cursor. Buffers the
//! batch points at are tracked as exec objects, each given a presumed GPU
//! address so the kernel can skip relocation when the guess holds.
//!
//! Submission goes through a [`BatchExecutor`], which owns the kernel side
//! (object creation, execbuf, fences).

use std::collections::BTreeMap;
use std::sync::Mutex;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gen4_render::MI_BATCH_BUFFER_END;

pub const I915_EXEC_DEFAULT: u64 = 0;
pub const I915_EXEC_RENDER: u64 = 1;
pub const I915_EXEC_BSD: u64 = 2;
pub const I915_EXEC_BLT: u64 = 3;
pub const I915_EXEC_NO_RELOC: u64 = 1 << 11;
pub const I915_EXEC_FENCE_OUT: u64 = 1 << 17;
pub const I915_EXEC_BATCH_FIRST: u64 = 1 << 18;

/// Presumed offset meaning "not placed yet".
pub const INVALID_ADDRESS: u64 = u64::MAX;

/// The low 256 KiB stay clear so negative relocation deltas never wrap.
const ALLOC_START: u64 = 256 << 10;
const OBJECT_ALIGN: u64 = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExecObjectFlags: u64 {
        const NEEDS_FENCE = 1 << 0;
        const WRITE = 1 << 2;
        const SUPPORTS_48B_ADDRESS = 1 << 3;
    }
}

/// One relocation, laid out as the kernel's execbuf relocation record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct RelocationEntry {
    pub target_handle: u32,
    pub delta: u32,
    /// Byte offset inside the batch that holds the address.
    pub offset: u64,
    pub presumed_offset: u64,
    pub read_domains: u32,
    pub write_domain: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecObject {
    pub handle: u32,
    pub offset: u64,
    pub flags: ExecObjectFlags,
    pub relocation_count: u32,
}

/// Everything one execbuf call needs. The batch object is `objects[0]` and
/// carries every relocation.
#[derive(Debug, Clone, Copy)]
pub struct ExecBuffer<'a> {
    pub batch: &'a [u8],
    pub objects: &'a [ExecObject],
    pub relocs: &'a [RelocationEntry],
    pub batch_len: u32,
    pub ctx: u32,
    pub flags: u64,
}

/// Kernel side of batch submission.
pub trait BatchExecutor {
    fn gem_create(&self, size: u32) -> Result<u32>;
    fn gem_close(&self, handle: u32) -> Result<()>;
    /// Size of the GPU address space the presumed offsets are drawn from.
    fn aperture_size(&self) -> u64;
    fn uses_full_ppgtt(&self) -> bool;
    /// Uploads `exec.batch` into the batch object and submits it. Returns
    /// the out-fence.
    fn execbuf(&self, exec: &ExecBuffer<'_>) -> Result<u64>;
    fn wait_fence(&self, fence: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Gen4,
    G4x,
    Gen5,
    /// Any later generation, by number.
    Gen(u32),
}

impl Platform {
    pub fn gen(self) -> u32 {
        match self {
            Platform::Gen4 | Platform::G4x => 4,
            Platform::Gen5 => 5,
            Platform::Gen(gen) => gen,
        }
    }

    pub fn is_g4x(self) -> bool {
        self == Platform::G4x
    }

    pub fn is_gen5(self) -> bool {
        self == Platform::Gen5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tiling {
    None,
    X,
    Y,
}

/// A 2D surface the batch reads or renders to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntelBuf {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub bpp: u32,
    pub tiling: Tiling,
    pub size: u64,
    /// Address used by the last batch, or [`INVALID_ADDRESS`].
    pub offset: u64,
}

impl IntelBuf {
    /// Creates the backing object; the stride is padded to the tile width.
    pub fn create(executor: &dyn BatchExecutor, width: u32, height: u32, bpp: u32, tiling: Tiling) -> Result<Self> {
        if bpp == 0 || bpp % 8 != 0 || width == 0 || height == 0 {
            return Err(Error::InvalidArgument("surface needs a byte-sized bpp and non-zero extent"));
        }
        let tile_width = match tiling {
            Tiling::None => 4,
            Tiling::X => 512,
            Tiling::Y => 128,
        };
        let stride = (width * bpp / 8).next_multiple_of(tile_width);
        let size = (stride as u64 * height as u64).next_multiple_of(OBJECT_ALIGN);
        let handle = executor.gem_create(size as u32)?;
        Ok(IntelBuf {
            handle,
            width,
            height,
            stride,
            bpp,
            tiling,
            size,
            offset: INVALID_ADDRESS,
        })
    }
}

/// Hands out presumed GPU addresses for objects that have none yet.
#[derive(Debug)]
struct SimpleAllocator {
    next: u64,
    end: u64,
}

impl SimpleAllocator {
    fn new(gtt_size: u64) -> Self {
        SimpleAllocator {
            next: ALLOC_START,
            end: gtt_size,
        }
    }

    fn alloc(&mut self, size: u64) -> Result<u64> {
        let offset = self.next.next_multiple_of(OBJECT_ALIGN);
        let end = offset
            .checked_add(size.max(1).next_multiple_of(OBJECT_ALIGN))
            .filter(|&end| end <= self.end)
            .ok_or(Error::InvalidArgument("presumed address space exhausted"))?;
        self.next = end;
        Ok(offset)
    }
}

pub struct IntelBb<'e> {
    executor: &'e dyn BatchExecutor,
    platform: Platform,
    handle: u32,
    size: u32,
    batch: Vec<u32>,
    /// Byte cursor, always dword aligned.
    ptr: u32,
    ctx: u32,
    enforce_relocs: bool,
    supports_48b_address: bool,
    gtt_size: u64,
    allocator: SimpleAllocator,
    objects: Vec<ExecObject>,
    index: BTreeMap<u32, usize>,
    relocs: Vec<RelocationEntry>,
    fences: Vec<u64>,
}

impl<'e> IntelBb<'e> {
    /// A batch whose objects get presumed addresses and run without
    /// relocation when those hold.
    pub fn new(executor: &'e dyn BatchExecutor, platform: Platform, size: u32) -> Result<Self> {
        Self::create(executor, platform, size, false)
    }

    /// A batch that always relocates: presumed addresses are left unknown.
    pub fn with_relocs(executor: &'e dyn BatchExecutor, platform: Platform, size: u32) -> Result<Self> {
        Self::create(executor, platform, size, true)
    }

    fn create(executor: &'e dyn BatchExecutor, platform: Platform, size: u32, enforce_relocs: bool) -> Result<Self> {
        if size == 0 || size % 4 != 0 {
            return Err(Error::Misaligned {
                what: "batch size",
                value: size as u64,
                alignment: 4,
            });
        }
        let mut gtt_size = executor.aperture_size();
        if !executor.uses_full_ppgtt() {
            gtt_size /= 2;
        }
        let handle = executor.gem_create(size)?;
        let mut ibb = IntelBb {
            executor,
            platform,
            handle,
            size,
            batch: vec![0; (size / 4) as usize],
            ptr: 0,
            ctx: 0,
            enforce_relocs,
            supports_48b_address: (gtt_size.saturating_sub(1) >> 32) != 0,
            gtt_size,
            allocator: SimpleAllocator::new(gtt_size),
            objects: Vec::new(),
            index: BTreeMap::new(),
            relocs: Vec::new(),
            fences: Vec::new(),
        };
        if let Err(e) = ibb.add_object(handle, size as u64, INVALID_ADDRESS, false) {
            if let Err(close) = executor.gem_close(handle) {
                warn!(error = %close, handle, "batch object leaked");
            }
            return Err(e);
        }
        Ok(ibb)
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Presumed address of the batch object itself.
    pub fn batch_offset(&self) -> u64 {
        self.objects.first().map_or(0, |o| o.offset)
    }

    pub fn offset(&self) -> u32 {
        self.ptr
    }

    pub fn batch(&self) -> &[u32] {
        &self.batch
    }

    pub fn objects(&self) -> &[ExecObject] {
        &self.objects
    }

    pub fn relocs(&self) -> &[RelocationEntry] {
        &self.relocs
    }

    fn check_range(&self, offset: u32, len: u32) -> Result<()> {
        if offset as u64 + len as u64 > self.size as u64 {
            return Err(Error::BatchOverflow {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    pub fn ptr_set(&mut self, offset: u32) -> Result<()> {
        if offset % 4 != 0 {
            return Err(Error::Misaligned {
                what: "batch cursor",
                value: offset as u64,
                alignment: 4,
            });
        }
        self.check_range(offset, 0)?;
        self.ptr = offset;
        Ok(())
    }

    /// Rounds the cursor up to `align` bytes and returns it.
    pub fn ptr_align(&mut self, align: u32) -> Result<u32> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment must be a power of two"));
        }
        let offset = self.ptr.next_multiple_of(align.max(4));
        self.ptr_set(offset)?;
        Ok(offset)
    }

    pub fn ptr_add(&mut self, bytes: u32) -> Result<()> {
        self.check_range(self.ptr, bytes)?;
        self.ptr_set(self.ptr + bytes)
    }

    /// Moves the cursor past `bytes` and returns where it was.
    pub fn ptr_add_return_prev_offset(&mut self, bytes: u32) -> Result<u32> {
        let prev = self.ptr;
        self.ptr_add(bytes)?;
        Ok(prev)
    }

    pub fn out(&mut self, dword: u32) -> Result<()> {
        self.check_range(self.ptr, 4)?;
        self.batch[(self.ptr / 4) as usize] = dword;
        self.ptr += 4;
        Ok(())
    }

    /// Overwrites the dword at byte `offset` without moving the cursor.
    pub fn patch(&mut self, offset: u32, dword: u32) -> Result<()> {
        self.state_mut(offset, 1)?[0] = dword;
        Ok(())
    }

    /// `dwords` of the batch starting at byte `offset`, for filling a state
    /// object in place.
    pub fn state_mut(&mut self, offset: u32, dwords: usize) -> Result<&mut [u32]> {
        if offset % 4 != 0 {
            return Err(Error::Misaligned {
                what: "state offset",
                value: offset as u64,
                alignment: 4,
            });
        }
        self.check_range(offset, (dwords * 4) as u32)?;
        let start = (offset / 4) as usize;
        Ok(&mut self.batch[start..start + dwords])
    }

    /// Copies `data` to the next `align` boundary, advances past it and
    /// returns its offset. The data must end strictly before the batch end.
    pub fn copy_data(&mut self, data: &[u8], align: u32) -> Result<u32> {
        if data.len() % 4 != 0 {
            return Err(Error::Misaligned {
                what: "copied data length",
                value: data.len() as u64,
                alignment: 4,
            });
        }
        let len = data.len() as u32;
        let offset = self.ptr_align(align)?;
        if offset as u64 + len as u64 >= self.size as u64 {
            return Err(Error::BatchOverflow {
                offset,
                len,
                size: self.size,
            });
        }
        let start = (offset / 4) as usize;
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut self.batch[start..start + data.len() / 4]);
        dst.copy_from_slice(data);
        self.ptr_add(len)?;
        Ok(offset)
    }

    /// Adds `handle` to the exec objects, or updates it when already there.
    /// An unknown presumed offset gets one from the allocator. Returns the
    /// object's presumed offset.
    pub fn add_object(&mut self, handle: u32, size: u64, offset: u64, write: bool) -> Result<u64> {
        let index = match self.index.get(&handle) {
            Some(&index) => index,
            None => {
                self.objects.push(ExecObject {
                    handle,
                    offset,
                    flags: ExecObjectFlags::empty(),
                    relocation_count: 0,
                });
                self.index.insert(handle, self.objects.len() - 1);
                self.objects.len() - 1
            }
        };
        if self.objects[index].offset == INVALID_ADDRESS {
            self.objects[index].offset = if self.enforce_relocs {
                0
            } else {
                self.allocator.alloc(size)?
            };
        }
        let object = &mut self.objects[index];
        if write {
            object.flags |= ExecObjectFlags::WRITE;
        }
        if self.supports_48b_address {
            object.flags |= ExecObjectFlags::SUPPORTS_48B_ADDRESS;
        }
        Ok(object.offset)
    }

    pub fn add_intel_buf(&mut self, buf: &IntelBuf, write: bool) -> Result<u64> {
        self.add_object(buf.handle, buf.size, buf.offset, write)
    }

    /// Marks an already added object as needing a fence register.
    pub fn set_fence(&mut self, handle: u32) -> bool {
        match self.index.get(&handle) {
            Some(&index) => {
                self.objects[index].flags |= ExecObjectFlags::NEEDS_FENCE;
                true
            }
            None => {
                warn!(handle, "fence requested for an object not in the batch");
                false
            }
        }
    }

    fn add_reloc(
        &mut self,
        handle: u32,
        read_domains: u32,
        write_domain: u32,
        delta: u32,
        offset: u32,
        presumed_offset: u64,
    ) -> Result<u64> {
        let size = if handle == self.handle { self.size as u64 } else { OBJECT_ALIGN };
        let address = self.add_object(handle, size, presumed_offset, false)?;
        let reloc = RelocationEntry {
            target_handle: handle,
            delta,
            offset: offset as u64,
            presumed_offset: if self.enforce_relocs { INVALID_ADDRESS } else { address },
            read_domains,
            write_domain,
        };
        debug!(
            handle,
            read_domains,
            write_domain,
            delta,
            offset,
            presumed = reloc.presumed_offset,
            "add reloc"
        );
        self.relocs.push(reloc);
        Ok(address)
    }

    /// Records a relocation at the cursor and emits the presumed address
    /// plus `delta`; the high dword follows on gen8+.
    pub fn emit_reloc(
        &mut self,
        handle: u32,
        read_domains: u32,
        write_domain: u32,
        delta: u32,
        presumed_offset: u64,
    ) -> Result<u64> {
        let address = self.add_reloc(handle, read_domains, write_domain, delta, self.ptr, presumed_offset)?;
        self.out((address as u32).wrapping_add(delta))?;
        if self.platform.gen() >= 8 {
            self.out((address >> 32) as u32)?;
        }
        Ok(address)
    }

    pub fn emit_reloc_fenced(
        &mut self,
        handle: u32,
        read_domains: u32,
        write_domain: u32,
        delta: u32,
        presumed_offset: u64,
    ) -> Result<u64> {
        let address = self.emit_reloc(handle, read_domains, write_domain, delta, presumed_offset)?;
        self.set_fence(handle);
        Ok(address)
    }

    /// Records a relocation for an address field at byte `offset` that the
    /// caller writes itself, as state objects do.
    pub fn offset_reloc(
        &mut self,
        handle: u32,
        read_domains: u32,
        write_domain: u32,
        offset: u32,
        presumed_offset: u64,
    ) -> Result<u64> {
        self.add_reloc(handle, read_domains, write_domain, 0, offset, presumed_offset)
    }

    pub fn offset_reloc_with_delta(
        &mut self,
        handle: u32,
        read_domains: u32,
        write_domain: u32,
        delta: u32,
        offset: u32,
        presumed_offset: u64,
    ) -> Result<u64> {
        self.add_reloc(handle, read_domains, write_domain, delta, offset, presumed_offset)
    }

    /// MI_BATCH_BUFFER_END, then pads to 8 bytes. Returns the batch length.
    pub fn emit_bbe(&mut self) -> Result<u32> {
        self.out(MI_BATCH_BUFFER_END)?;
        self.ptr_align(8)
    }

    pub fn exec(&mut self, end_offset: u32, flags: u64, sync: bool) -> Result<()> {
        self.exec_with_context(end_offset, self.ctx, flags, sync)
    }

    /// Submits the first `end_offset` bytes on context `ctx`.
    pub fn exec_with_context(&mut self, end_offset: u32, ctx: u32, flags: u64, sync: bool) -> Result<()> {
        self.check_range(0, end_offset)?;
        if let Some(batch) = self.objects.first_mut() {
            batch.handle = self.handle;
            batch.relocation_count = self.relocs.len() as u32;
        }
        let mut flags = flags | I915_EXEC_BATCH_FIRST | I915_EXEC_FENCE_OUT;
        if self.enforce_relocs {
            flags &= !I915_EXEC_NO_RELOC;
        }
        self.ctx = ctx;
        let exec = ExecBuffer {
            batch: bytemuck::cast_slice(&self.batch),
            objects: &self.objects,
            relocs: &self.relocs,
            batch_len: end_offset,
            ctx,
            flags,
        };
        let fence = self.executor.execbuf(&exec).map_err(|e| {
            warn!(error = %e, objects = self.objects.len(), relocs = self.relocs.len(), "execbuf failed");
            e
        })?;
        self.fences.push(fence);
        debug!(end_offset, ctx, flags, fence, "batch submitted");
        if sync {
            self.sync()?;
        }
        Ok(())
    }

    /// Waits for every batch submitted since the last sync.
    pub fn sync(&mut self) -> Result<()> {
        while let Some(&fence) = self.fences.first() {
            self.executor.wait_fence(fence)?;
            self.fences.remove(0);
        }
        Ok(())
    }

    /// Starts over with a fresh batch object. With `purge_objects_cache`
    /// the object list is dropped too; otherwise objects keep their
    /// presumed offsets for the next batch.
    pub fn reset(&mut self, purge_objects_cache: bool) -> Result<()> {
        self.relocs.clear();
        for object in &mut self.objects {
            object.relocation_count = 0;
        }
        let old = self.handle;
        self.objects.retain(|o| o.handle != old);
        if purge_objects_cache {
            self.objects.clear();
        }
        self.executor.gem_close(old)?;

        self.handle = self.executor.gem_create(self.size)?;
        let offset = if self.enforce_relocs {
            0
        } else {
            self.allocator.alloc(self.size as u64)?
        };
        let mut flags = ExecObjectFlags::empty();
        if self.supports_48b_address {
            flags |= ExecObjectFlags::SUPPORTS_48B_ADDRESS;
        }
        // the batch stays objects[0]
        self.objects.insert(
            0,
            ExecObject {
                handle: self.handle,
                offset,
                flags,
                relocation_count: 0,
            },
        );
        self.index = self.objects.iter().enumerate().map(|(i, o)| (o.handle, i)).collect();

        self.ptr = 0;
        self.batch.fill(0);
        Ok(())
    }

    fn flush_with_context_ring(&mut self, ring: u64) -> Result<()> {
        if self.ptr == 0 {
            return Ok(());
        }
        self.exec_with_context(self.ptr, self.ctx, ring | I915_EXEC_NO_RELOC, false)?;
        self.reset(false)
    }

    /// Submits whatever has been emitted on the render ring and starts a
    /// new batch. An empty batch is left alone.
    pub fn flush_render(&mut self) -> Result<()> {
        self.flush_with_context_ring(I915_EXEC_RENDER)
    }

    pub fn flush_blit(&mut self) -> Result<()> {
        let ring = if self.platform.gen() >= 6 { I915_EXEC_BLT } else { I915_EXEC_DEFAULT };
        self.flush_with_context_ring(ring)
    }

    /// Presumed offset `handle` was given, masked to the address space, or
    /// [`INVALID_ADDRESS`] when it is not in the batch.
    pub fn get_object_offset(&self, handle: u32) -> u64 {
        match self.index.get(&handle) {
            Some(&index) if self.objects[index].offset != INVALID_ADDRESS => {
                self.objects[index].offset & self.gtt_size.wrapping_sub(1)
            }
            Some(_) | None => INVALID_ADDRESS,
        }
    }

    /// Carries the address used by this batch over to `buf`, so a later
    /// batch can presume it. Returns false when `buf` is not in the batch.
    pub fn object_offset_to_buf(&self, buf: &mut IntelBuf) -> bool {
        match self.index.get(&buf.handle) {
            Some(&index) => {
                buf.offset = self.objects[index].offset & self.gtt_size.wrapping_sub(1);
                true
            }
            None => {
                buf.offset = 0;
                false
            }
        }
    }

    /// Waits for outstanding batches and closes the batch object.
    pub fn destroy(mut self) -> Result<()> {
        let synced = self.sync();
        let closed = self.executor.gem_close(self.handle);
        synced.and(closed)
    }
}

/// A submitted batch as the [`RecordingExecutor`] saw it. `batch` is the
/// whole object, including data past `batch_len`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExec {
    pub batch: Vec<u32>,
    pub objects: Vec<ExecObject>,
    pub relocs: Vec<RelocationEntry>,
    pub batch_len: u32,
    pub ctx: u32,
    pub flags: u64,
}

#[derive(Debug, Default)]
struct Recording {
    next_handle: u32,
    live: Vec<u32>,
    execs: Vec<RecordedExec>,
    waited: Vec<u64>,
}

/// Executor that keeps every submission instead of running it, for dry
/// runs and for inspecting emitted batches.
#[derive(Debug)]
pub struct RecordingExecutor {
    aperture: u64,
    full_ppgtt: bool,
    state: Mutex<Recording>,
}

impl RecordingExecutor {
    pub fn new(aperture: u64, full_ppgtt: bool) -> Self {
        RecordingExecutor {
            aperture,
            full_ppgtt,
            state: Mutex::new(Recording::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn execs(&self) -> Vec<RecordedExec> {
        self.lock().execs.clone()
    }

    pub fn live_handles(&self) -> Vec<u32> {
        self.lock().live.clone()
    }

    pub fn waited(&self) -> Vec<u64> {
        self.lock().waited.clone()
    }
}

impl Default for RecordingExecutor {
    /// A 4 GiB full-PPGTT address space.
    fn default() -> Self {
        RecordingExecutor::new(1 << 32, true)
    }
}

impl BatchExecutor for RecordingExecutor {
    fn gem_create(&self, size: u32) -> Result<u32> {
        if size == 0 {
            return Err(Error::kernel("gem_create", nix::errno::Errno::EINVAL));
        }
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.live.push(handle);
        Ok(handle)
    }

    fn gem_close(&self, handle: u32) -> Result<()> {
        let mut state = self.lock();
        let pos = state
            .live
            .iter()
            .position(|&h| h == handle)
            .ok_or(Error::kernel("gem_close", nix::errno::Errno::ENOENT))?;
        state.live.remove(pos);
        Ok(())
    }

    fn aperture_size(&self) -> u64 {
        self.aperture
    }

    fn uses_full_ppgtt(&self) -> bool {
        self.full_ppgtt
    }

    fn execbuf(&self, exec: &ExecBuffer<'_>) -> Result<u64> {
        let mut state = self.lock();
        if let Some(missing) = exec.objects.iter().find(|o| !state.live.contains(&o.handle)) {
            debug!(handle = missing.handle, "execbuf names a closed object");
            return Err(Error::kernel("execbuf", nix::errno::Errno::ENOENT));
        }
        if exec.batch_len == 0 || exec.batch_len % 8 != 0 {
            return Err(Error::kernel("execbuf", nix::errno::Errno::EINVAL));
        }
        state.execs.push(RecordedExec {
            batch: exec
                .batch
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            objects: exec.objects.to_vec(),
            relocs: exec.relocs.to_vec(),
            batch_len: exec.batch_len,
            ctx: exec.ctx,
            flags: exec.flags,
        });
        Ok(state.execs.len() as u64)
    }

    fn wait_fence(&self, fence: u64) -> Result<()> {
        let mut state = self.lock();
        if fence == 0 || fence > state.execs.len() as u64 {
            return Err(Error::kernel("sync_fence_wait", nix::errno::Errno::EINVAL));
        }
        state.waited.push(fence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cursor_moves_in_bytes() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen4, 4096).unwrap();
        ibb.out(1).unwrap();
        assert_eq!(ibb.offset(), 4);
        assert_eq!(ibb.ptr_align(32).unwrap(), 32);
        assert_eq!(ibb.ptr_add_return_prev_offset(24).unwrap(), 32);
        assert_eq!(ibb.offset(), 56);
        ibb.ptr_set(0).unwrap();
        ibb.out(2).unwrap();
        assert_eq!(&ibb.batch()[..2], &[2, 0]);
        assert!(matches!(ibb.ptr_set(4098), Err(Error::Misaligned { .. })));
        assert!(matches!(ibb.ptr_set(4100), Err(Error::BatchOverflow { .. })));
    }

    #[test]
    fn out_refuses_to_run_off_the_end() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen4, 8).unwrap();
        ibb.out(1).unwrap();
        ibb.out(2).unwrap();
        let err = ibb.out(3).unwrap_err();
        assert!(matches!(err, Error::BatchOverflow { offset: 8, len: 4, size: 8 }));
        assert_eq!(ibb.offset(), 8);
    }

    #[test]
    fn copy_data_aligns_and_checks_length() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen5, 256).unwrap();
        ibb.out(0xaa).unwrap();
        let data: Vec<u8> = (0u8..16).collect();
        assert_eq!(ibb.copy_data(&data, 64).unwrap(), 64);
        assert_eq!(ibb.offset(), 80);
        assert_eq!(ibb.batch()[16], u32::from_le_bytes([0, 1, 2, 3]));
        assert!(matches!(ibb.copy_data(&[0; 3], 4), Err(Error::Misaligned { .. })));
        // ends exactly at the batch end
        ibb.ptr_set(0).unwrap();
        assert!(matches!(ibb.copy_data(&[0; 256], 4), Err(Error::BatchOverflow { .. })));
    }

    #[test]
    fn objects_are_deduplicated_and_flagged() {
        let exec = RecordingExecutor::new(1 << 40, true);
        let mut ibb = IntelBb::new(&exec, Platform::Gen(9), 4096).unwrap();
        let first = ibb.add_object(100, 8192, INVALID_ADDRESS, false).unwrap();
        let again = ibb.add_object(100, 8192, INVALID_ADDRESS, true).unwrap();
        assert_eq!(first, again);
        assert_eq!(ibb.objects().len(), 2);
        let obj = ibb.objects()[1];
        assert!(obj.flags.contains(ExecObjectFlags::WRITE | ExecObjectFlags::SUPPORTS_48B_ADDRESS));
        assert!(first >= ALLOC_START && first % OBJECT_ALIGN == 0);
        assert_ne!(first, ibb.batch_offset());

        assert!(ibb.set_fence(100));
        assert!(!ibb.set_fence(7));
        assert!(ibb.objects()[1].flags.contains(ExecObjectFlags::NEEDS_FENCE));
    }

    #[test]
    fn relocations_carry_presumed_offsets() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen4, 4096).unwrap();
        ibb.out(0).unwrap();
        let addr = ibb.emit_reloc(55, 0x20, 0, 16, 0x10_0000).unwrap();
        assert_eq!(addr, 0x10_0000);
        assert_eq!(ibb.batch()[1], 0x10_0010);
        assert_eq!(ibb.offset(), 8);
        assert_eq!(
            ibb.relocs(),
            &[RelocationEntry {
                target_handle: 55,
                delta: 16,
                offset: 4,
                presumed_offset: 0x10_0000,
                read_domains: 0x20,
                write_domain: 0,
            }]
        );

        let mut gen9 = IntelBb::new(&exec, Platform::Gen(9), 4096).unwrap();
        gen9.emit_reloc(56, 0x20, 0, 0, 0x1_0000_2000).unwrap();
        assert_eq!(&gen9.batch()[..2], &[0x2000, 1]);
    }

    #[test]
    fn fenced_and_offset_relocations() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen4, 4096).unwrap();
        let addr = ibb.emit_reloc_fenced(70, 0x2, 0x2, 0, 0x20_0000).unwrap();
        assert_eq!(ibb.batch()[0], 0x20_0000);
        assert!(ibb.objects()[1].flags.contains(ExecObjectFlags::NEEDS_FENCE));

        // recorded only, nothing emitted
        let again = ibb.offset_reloc_with_delta(70, 0x2, 0, 8, 64, addr).unwrap();
        assert_eq!(again, addr);
        assert_eq!(ibb.offset(), 4);
        assert_eq!(ibb.relocs()[1].offset, 64);
        assert_eq!(ibb.relocs()[1].delta, 8);
    }

    #[test]
    fn blit_flush_uses_the_default_ring_before_gen6() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen5, 4096).unwrap();
        ibb.emit_bbe().unwrap();
        ibb.flush_blit().unwrap();
        let execs = exec.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].flags & 0x3f, I915_EXEC_DEFAULT);
        ibb.destroy().unwrap();
    }

    #[test]
    fn forced_relocations_hide_addresses() {
        let exec = RecordingExecutor::default();
        let target = exec.gem_create(4096).unwrap();
        let mut ibb = IntelBb::with_relocs(&exec, Platform::Gen4, 4096).unwrap();
        assert_eq!(ibb.batch_offset(), 0);
        ibb.emit_reloc(target, 0x2, 0x2, 0, INVALID_ADDRESS).unwrap();
        assert_eq!(ibb.relocs()[0].presumed_offset, INVALID_ADDRESS);
        ibb.emit_bbe().unwrap();
        ibb.exec(ibb.offset(), I915_EXEC_RENDER | I915_EXEC_NO_RELOC, true).unwrap();
        let rec = &exec.execs()[0];
        assert_eq!(rec.flags & I915_EXEC_NO_RELOC, 0);
        assert_eq!(rec.objects[0].relocation_count, 1);
    }

    #[test]
    fn bbe_pads_to_a_qword() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen4, 4096).unwrap();
        assert_eq!(ibb.emit_bbe().unwrap(), 8);
        assert_eq!(&ibb.batch()[..2], &[MI_BATCH_BUFFER_END, 0]);
        ibb.out(0).unwrap();
        assert_eq!(ibb.emit_bbe().unwrap(), 16);
    }

    #[test]
    fn flush_submits_and_starts_a_new_batch() {
        let exec = RecordingExecutor::default();
        let mut ibb = IntelBb::new(&exec, Platform::Gen4, 4096).unwrap();
        ibb.flush_render().unwrap();
        assert!(exec.execs().is_empty());

        let old = ibb.handle();
        let target = exec.gem_create(4096).unwrap();
        ibb.add_object(target, 4096, INVALID_ADDRESS, true).unwrap();
        ibb.out(0).unwrap();
        ibb.emit_bbe().unwrap();
        ibb.flush_render().unwrap();

        let execs = exec.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(
            execs[0].flags,
            I915_EXEC_RENDER | I915_EXEC_NO_RELOC | I915_EXEC_BATCH_FIRST | I915_EXEC_FENCE_OUT
        );
        assert_eq!(execs[0].objects[0].handle, old);
        assert_eq!(&execs[0].batch[..3], &[0, MI_BATCH_BUFFER_END, 0]);
        assert_eq!(execs[0].batch_len, 8);

        assert_ne!(ibb.handle(), old);
        assert_eq!(ibb.offset(), 0);
        assert_eq!(ibb.objects()[0].handle, ibb.handle());
        assert!(ibb.get_object_offset(target) != INVALID_ADDRESS);
        assert_eq!(exec.live_handles(), vec![target, ibb.handle()]);

        ibb.destroy().unwrap();
        assert_eq!(exec.waited(), vec![1]);
        assert_eq!(exec.live_handles(), vec![target]);
        exec.gem_close(target).unwrap();
    }

    #[test]
    fn offsets_carry_over_to_buffers() {
        let exec = RecordingExecutor::default();
        let mut buf = IntelBuf::create(&exec, 64, 16, 32, Tiling::X).unwrap();
        assert_eq!(buf.stride, 512);
        assert_eq!(buf.size, 8192);
        let mut ibb = IntelBb::new(&exec, Platform::G4x, 4096).unwrap();
        let mut other = buf.clone();
        other.handle = 999;
        assert!(!ibb.object_offset_to_buf(&mut other));
        assert_eq!(other.offset, 0);

        let presumed = ibb.add_intel_buf(&buf, false).unwrap();
        assert!(ibb.object_offset_to_buf(&mut buf));
        assert_eq!(buf.offset, presumed);
        assert_eq!(ibb.get_object_offset(buf.handle), presumed);
    }
}
