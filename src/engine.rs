//! Packet engines of the software device: the PM4 command processor that
//! serves the GFX and COMPUTE rings, and the SDMA engine.
//!
//! An engine walks the IBs of one job packet by packet. Execution can stop
//! in the middle of a job when a wait packet finds its condition unmet; the
//! [`Cursor`] remembers where, so the job resumes at that packet later.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::bit::u64_from_u32_u32;
use crate::device::IbInfo;
use crate::family::{FAMILY_AI, FAMILY_SI};
use crate::gcn::{run_dispatch, DispatchError, DispatchState, GpuMemory, Isa, MemFault};
use crate::pm4::*;
use crate::registers::{gfx_v8_0_get_reg_offset, GeneralReg};
use crate::sdma::*;

/// Registers below this offset belong to the kernel; writing them from an IB
/// is a fault.
pub const PRIVILEGED_REG_LIMIT: u32 = 0x2000;

const COPY_CHUNK: u64 = 64 * 1024;

/// Why an engine gave up on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hang {
    IllegalPacket { addr: u64, header: u32 },
    /// The header promises more dwords than the IB holds.
    Truncated { addr: u64, header: u32 },
    Fault(MemFault),
    PrivilegedRegister(u32),
    Dispatch(DispatchError),
}

impl From<MemFault> for Hang {
    fn from(fault: MemFault) -> Self {
        Hang::Fault(fault)
    }
}

impl fmt::Display for Hang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hang::IllegalPacket { addr, header } => write!(f, "illegal packet {:#010x} at {:#x}", header, addr),
            Hang::Truncated { addr, header } => write!(f, "truncated packet {:#010x} at {:#x}", header, addr),
            Hang::Fault(fault) => write!(f, "vm fault at {:#x}", fault.addr),
            Hang::PrivilegedRegister(reg) => write!(f, "write to privileged register {:#x}", reg),
            Hang::Dispatch(DispatchError::IllegalInstruction { pc, word }) => {
                write!(f, "shader illegal instruction {:#010x} at {:#x}", word, pc)
            }
            Hang::Dispatch(DispatchError::BudgetExhausted { executed }) => {
                write!(f, "shader still running after {} instructions", executed)
            }
            Hang::Dispatch(DispatchError::Fault(fault)) => write!(f, "shader vm fault at {:#x}", fault.addr),
        }
    }
}

/// How far a job got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Retired,
    Stalled,
    Hung(Hang),
}

/// Resume point of a partially executed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub ib: usize,
    pub dw: usize,
    /// Constant-engine counter.
    pub ce: u32,
    /// Draw-engine counter.
    pub de: u32,
}

/// Register state of one ring, keyed by absolute dword offset.
#[derive(Debug, Default)]
pub struct RegisterFile {
    regs: HashMap<u32, u32>,
}

impl RegisterFile {
    pub fn get(&self, reg: u32) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    pub fn set(&mut self, reg: u32, value: u32) {
        self.regs.insert(reg, value);
    }

    fn sh(&self, reg: GeneralReg) -> u32 {
        self.get(PACKET3_SET_SH_REG_START + gfx_v8_0_get_reg_offset(reg))
    }
}

/// Engine-independent execution parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineEnv {
    pub family_id: u32,
    pub isa: Isa,
    pub instruction_budget: u64,
    pub progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Pm4,
    Sdma,
}

enum Step {
    Advance(usize),
    Stall,
}

/// A packet engine; one `step` consumes one packet.
trait PacketEngine {
    fn mem(&mut self) -> &mut dyn GpuMemory;
    fn step(&mut self, ib: &[u32], pos: usize, addr: u64, cursor: &mut Cursor) -> Result<Step, Hang>;
}

/// Runs `ibs` from `cursor` until the job retires, stalls or hangs.
pub fn execute(
    kind: EngineKind,
    mem: &mut dyn GpuMemory,
    regs: &mut RegisterFile,
    ibs: &[IbInfo],
    cursor: &mut Cursor,
    env: &EngineEnv,
) -> Outcome {
    match kind {
        EngineKind::Pm4 => run_ibs(&mut Pm4Engine { mem, regs, env }, ibs, cursor),
        EngineKind::Sdma => run_ibs(&mut SdmaEngine { mem, regs, env }, ibs, cursor),
    }
}

fn run_ibs<E: PacketEngine>(engine: &mut E, ibs: &[IbInfo], cursor: &mut Cursor) -> Outcome {
    while let Some(ib) = ibs.get(cursor.ib) {
        let mut words = vec![0u32; ib.size as usize];
        if let Err(fault) = engine.mem().read(ib.ib_mc_address, bytemuck::cast_slice_mut(&mut words)) {
            return Outcome::Hung(Hang::Fault(fault));
        }
        while cursor.dw < words.len() {
            let pos = cursor.dw;
            match engine.step(&words, pos, ib.ib_mc_address + 4 * pos as u64, cursor) {
                Ok(Step::Advance(n)) => cursor.dw += n,
                Ok(Step::Stall) => return Outcome::Stalled,
                Err(hang) => return Outcome::Hung(hang),
            }
        }
        cursor.ib += 1;
        cursor.dw = 0;
    }
    Outcome::Retired
}

fn read_u32(mem: &mut dyn GpuMemory, addr: u64) -> Result<u32, MemFault> {
    let mut bytes = [0u8; 4];
    mem.read(addr, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn write_dwords(mem: &mut dyn GpuMemory, addr: u64, data: &[u32]) -> Result<(), MemFault> {
    mem.write(addr, bytemuck::cast_slice(data))
}

/// Repeats the little-endian `pattern` over `bytes` bytes.
fn fill(mem: &mut dyn GpuMemory, addr: u64, pattern: u32, bytes: u64) -> Result<(), MemFault> {
    let chunk: Vec<u8> = pattern
        .to_le_bytes()
        .iter()
        .copied()
        .cycle()
        .take(bytes.min(COPY_CHUNK) as usize)
        .collect();
    let mut done = 0;
    while done < bytes {
        let n = (bytes - done).min(COPY_CHUNK) as usize;
        mem.write(addr + done, &chunk[..n])?;
        done += n as u64;
    }
    Ok(())
}

fn copy(mem: &mut dyn GpuMemory, src: u64, dst: u64, bytes: u64) -> Result<(), MemFault> {
    let mut chunk = vec![0u8; bytes.min(COPY_CHUNK) as usize];
    let mut done = 0;
    while done < bytes {
        let n = (bytes - done).min(COPY_CHUNK) as usize;
        mem.read(src + done, &mut chunk[..n])?;
        mem.write(dst + done, &chunk[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// WAIT_REG_MEM / POLL_REGMEM compare functions.
fn wait_condition(function: u32, value: u32, reference: u32) -> Option<bool> {
    Some(match function {
        0 => true,
        1 => value < reference,
        2 => value <= reference,
        3 => value == reference,
        4 => value != reference,
        5 => value >= reference,
        6 => value > reference,
        _ => return None,
    })
}

/// Single compare-swap attempt; the loop-until-satisfied mode is not modelled.
fn atomic_cmpswap(mem: &mut dyn GpuMemory, addr: u64, src: u32, cmp: u32) -> Result<(), MemFault> {
    let current = read_u32(mem, addr)?;
    trace!(addr = %format_args!("{:#x}", addr), current, cmp, "atomic cmpswap");
    if current == cmp {
        write_dwords(mem, addr, &[src])?;
    }
    Ok(())
}

struct Pm4Engine<'a> {
    mem: &'a mut dyn GpuMemory,
    regs: &'a mut RegisterFile,
    env: &'a EngineEnv,
}

impl Pm4Engine<'_> {
    fn set_regs(&mut self, base: u32, offset: u32, values: &[u32]) {
        for (i, &v) in values.iter().enumerate() {
            self.regs.set(base + offset + i as u32, v);
        }
    }

    fn dispatch(&mut self, dim: [u32; 3]) -> Result<(), Hang> {
        let regs = &*self.regs;
        let pgm_lo = regs.sh(GeneralReg::ComputePgmLo) as u64;
        let pgm_hi = regs.sh(GeneralReg::ComputePgmHi) as u64;
        let user_base = PACKET3_SET_SH_REG_START + gfx_v8_0_get_reg_offset(GeneralReg::ComputeUserData0);
        let mut state = DispatchState {
            pgm_addr: (pgm_lo << 8) | (pgm_hi << 40),
            pgm_rsrc2: regs.sh(GeneralReg::ComputePgmRsrc2),
            num_thread: [
                regs.sh(GeneralReg::ComputeNumThreadX),
                regs.sh(GeneralReg::ComputeNumThreadY),
                regs.sh(GeneralReg::ComputeNumThreadZ),
            ],
            start: [
                regs.sh(GeneralReg::ComputeStartX),
                regs.sh(GeneralReg::ComputeStartY),
                regs.sh(GeneralReg::ComputeStartZ),
            ],
            dim,
            ..Default::default()
        };
        for (i, slot) in state.user_data.iter_mut().enumerate() {
            *slot = regs.get(user_base + i as u32);
        }
        debug!(
            pgm = %format_args!("{:#x}", state.pgm_addr),
            groups = state.workgroups(),
            "dispatch"
        );
        let executed = run_dispatch(
            &mut *self.mem,
            &state,
            self.env.isa,
            self.env.instruction_budget,
            self.env.progress,
        )
        .map_err(Hang::Dispatch)?;
        debug!(executed, "dispatch retired");
        Ok(())
    }
}

impl PacketEngine for Pm4Engine<'_> {
    fn mem(&mut self) -> &mut dyn GpuMemory {
        &mut *self.mem
    }

    fn step(&mut self, ib: &[u32], pos: usize, addr: u64, cursor: &mut Cursor) -> Result<Step, Hang> {
        let header = ib[pos];
        let (opcode, len) = match Pm4Header::decode(header) {
            Pm4Header::Filler | Pm4Header::ShortNop => return Ok(Step::Advance(1)),
            Pm4Header::Other(_) => return Err(Hang::IllegalPacket { addr, header }),
            Pm4Header::Type3 { opcode, count, .. } => (opcode, count as usize + 2),
        };
        let body = ib
            .get(pos + 1..pos + len)
            .ok_or(Hang::Truncated { addr, header })?;
        let need = |n: usize| {
            if body.len() < n {
                Err(Hang::IllegalPacket { addr, header })
            } else {
                Ok(())
            }
        };
        trace!(opcode = %format_args!("{:#x}", opcode), len, "pm4 packet");

        match opcode {
            PACKET3_NOP | PACKET3_CONTEXT_CONTROL => {}
            PACKET3_SET_SH_REG => self.set_regs(PACKET3_SET_SH_REG_START, body[0], &body[1..]),
            PACKET3_SET_SH_REG_INDEX => self.set_regs(PACKET3_SET_SH_REG_START, body[0] & 0xffff, &body[1..]),
            PACKET3_SET_UCONFIG_REG => self.set_regs(PACKET3_SET_UCONFIG_REG_START, body[0], &body[1..]),
            PACKET3_WRITE_DATA => {
                need(3)?;
                let dst_sel = (body[0] >> 8) & 0xf;
                let data = &body[3..];
                match dst_sel {
                    WRITE_DATA_DST_SEL_MEM => {
                        let dst = u64_from_u32_u32(body[1] & !3, body[2]);
                        write_dwords(self.mem, dst, data)?;
                    }
                    WRITE_DATA_DST_SEL_REG => {
                        let reg = body[1];
                        if reg < PRIVILEGED_REG_LIMIT {
                            return Err(Hang::PrivilegedRegister(reg));
                        }
                        self.set_regs(0, reg, data);
                    }
                    _ => return Err(Hang::IllegalPacket { addr, header }),
                }
            }
            PACKET3_DMA_DATA => {
                need(6)?;
                let src_sel = (body[0] >> 29) & 3;
                let dst_sel = (body[0] >> 20) & 3;
                let dst = u64_from_u32_u32(body[3], body[4]);
                let bytes = (body[5] & ((1 << 26) - 1)) as u64;
                self.dma_data(src_sel, dst_sel, body[1], u64_from_u32_u32(body[1], body[2]), dst, bytes)
                    .ok_or(Hang::IllegalPacket { addr, header })??;
            }
            PACKET3_DMA_DATA_SI => {
                need(5)?;
                let src_sel = (body[1] >> 29) & 3;
                let dst_sel = (body[1] >> 20) & 3;
                let src = u64_from_u32_u32(body[0], body[1] & 0xffff);
                let dst = u64_from_u32_u32(body[2], body[3] & 0xffff);
                let bytes = (body[4] & ((1 << 21) - 1)) as u64;
                self.dma_data(src_sel, dst_sel, body[0], src, dst, bytes)
                    .ok_or(Hang::IllegalPacket { addr, header })??;
            }
            PACKET3_WAIT_REG_MEM => {
                need(5)?;
                let function = body[0] & 7;
                let mem_space = (body[0] >> 4) & 1;
                let value = if mem_space == 1 {
                    read_u32(self.mem, u64_from_u32_u32(body[1] & !3, body[2]))?
                } else {
                    self.regs.get(body[1])
                };
                let met = wait_condition(function, value & body[4], body[3])
                    .ok_or(Hang::IllegalPacket { addr, header })?;
                if !met {
                    return Ok(Step::Stall);
                }
            }
            PACKET3_ATOMIC_MEM => {
                need(7)?;
                if body[0] & 0x7f != TC_OP_ATOMIC_CMPSWAP_RTN_32 {
                    return Err(Hang::IllegalPacket { addr, header });
                }
                atomic_cmpswap(self.mem, u64_from_u32_u32(body[1] & !3, body[2]), body[3], body[5])?;
            }
            PACKET3_DISPATCH_DIRECT => {
                need(3)?;
                self.dispatch([body[0], body[1], body[2]])?;
            }
            PACKET3_SET_CE_DE_COUNTERS => {
                cursor.ce = 0;
                cursor.de = 0;
            }
            PACKET3_INCREMENT_CE_COUNTER => cursor.ce += 1,
            PACKET3_WAIT_ON_CE_COUNTER => {
                if cursor.ce <= cursor.de {
                    return Ok(Step::Stall);
                }
                cursor.de += 1;
            }
            _ => return Err(Hang::IllegalPacket { addr, header }),
        }
        Ok(Step::Advance(len))
    }
}

impl Pm4Engine<'_> {
    /// Shared body of both DMA_DATA forms. `None` for selector combinations
    /// the engine does not implement.
    fn dma_data(
        &mut self,
        src_sel: u32,
        dst_sel: u32,
        data: u32,
        src: u64,
        dst: u64,
        bytes: u64,
    ) -> Option<Result<(), MemFault>> {
        if dst_sel != 0 {
            return None;
        }
        match src_sel {
            0 => Some(copy(self.mem, src, dst, bytes)),
            DMA_DATA_SRC_SEL_DATA => Some(fill(self.mem, dst, data, bytes)),
            _ => None,
        }
    }
}

struct SdmaEngine<'a> {
    mem: &'a mut dyn GpuMemory,
    regs: &'a mut RegisterFile,
    env: &'a EngineEnv,
}

impl SdmaEngine<'_> {
    /// Count fields are biased by one from AI on.
    fn sized(&self, count: u32) -> u64 {
        if self.env.family_id >= FAMILY_AI {
            count as u64 + 1
        } else {
            count as u64
        }
    }

    fn step_si(&mut self, ib: &[u32], pos: usize, addr: u64) -> Result<Step, Hang> {
        let header = ib[pos];
        let h = SdmaHeaderSi::decode(header);
        let packet = |n: usize| ib.get(pos..pos + n).ok_or(Hang::Truncated { addr, header });
        trace!(op = h.op, count = h.count, "si dma packet");
        match h.op {
            SDMA_NOP_SI => Ok(Step::Advance(1)),
            SDMA_OPCODE_WRITE => {
                let len = 3 + h.count as usize;
                let p = packet(len)?;
                write_dwords(self.mem, u64_from_u32_u32(p[1] & !3, p[2] & 0xff), &p[3..])?;
                Ok(Step::Advance(len))
            }
            SDMA_OPCODE_COPY_SI => {
                let p = packet(5)?;
                let dst = u64_from_u32_u32(p[1], p[3] & 0xff);
                let src = u64_from_u32_u32(p[2], p[4] & 0xff);
                copy(self.mem, src, dst, h.count as u64)?;
                Ok(Step::Advance(5))
            }
            SDMA_OPCODE_CONSTANT_FILL_SI => {
                let p = packet(4)?;
                let dst = u64_from_u32_u32(p[1] & !3, p[3] >> 16);
                fill(self.mem, dst, p[2], h.count as u64 * 4)?;
                Ok(Step::Advance(4))
            }
            _ => Err(Hang::IllegalPacket { addr, header }),
        }
    }
}

impl PacketEngine for SdmaEngine<'_> {
    fn mem(&mut self) -> &mut dyn GpuMemory {
        &mut *self.mem
    }

    fn step(&mut self, ib: &[u32], pos: usize, addr: u64, _cursor: &mut Cursor) -> Result<Step, Hang> {
        if self.env.family_id == FAMILY_SI {
            return self.step_si(ib, pos, addr);
        }
        let header = ib[pos];
        let h = SdmaHeader::decode(header);
        let packet = |n: usize| ib.get(pos..pos + n).ok_or(Hang::Truncated { addr, header });
        trace!(op = h.op, sub_op = h.sub_op, "sdma packet");
        match h.op {
            // the count field is ignored so one-dword pads of any shape work
            SDMA_NOP => Ok(Step::Advance(1)),
            SDMA_OPCODE_WRITE => {
                let p = packet(4)?;
                let len = 4 + self.sized(p[3]) as usize;
                let p = packet(len)?;
                write_dwords(self.mem, u64_from_u32_u32(p[1] & !3, p[2]), &p[4..])?;
                Ok(Step::Advance(len))
            }
            SDMA_OPCODE_COPY if h.sub_op == SDMA_COPY_SUB_OPCODE_LINEAR => {
                let p = packet(7)?;
                let bytes = self.sized(p[1]);
                copy(self.mem, u64_from_u32_u32(p[3], p[4]), u64_from_u32_u32(p[5], p[6]), bytes)?;
                Ok(Step::Advance(7))
            }
            SDMA_OPCODE_CONSTANT_FILL => {
                let p = packet(5)?;
                let bytes = self.sized(p[4]);
                fill(self.mem, u64_from_u32_u32(p[1], p[2]), p[3], bytes)?;
                Ok(Step::Advance(5))
            }
            SDMA_OP_POLL_REGMEM => {
                let p = packet(6)?;
                let mem_poll = header >> 31 != 0;
                let function = (header >> 28) & 7;
                let value = if mem_poll {
                    read_u32(self.mem, u64_from_u32_u32(p[1] & !3, p[2]))?
                } else {
                    self.regs.get(p[1])
                };
                match wait_condition(function, value & p[4], p[3]) {
                    Some(true) => Ok(Step::Advance(6)),
                    Some(false) => Ok(Step::Stall),
                    None => Err(Hang::IllegalPacket { addr, header }),
                }
            }
            SDMA_OPCODE_ATOMIC => {
                let p = packet(8)?;
                if (h.extra >> 9) & 0x7f != TC_OP_ATOMIC_CMPSWAP_RTN_32 {
                    return Err(Hang::IllegalPacket { addr, header });
                }
                atomic_cmpswap(self.mem, u64_from_u32_u32(p[1] & !3, p[2]), p[3], p[5])?;
                Ok(Step::Advance(8))
            }
            _ => Err(Hang::IllegalPacket { addr, header }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FAMILY_VI;

    /// Flat memory at 0x1_0000_0000 holding the IB at offset 0 and data
    /// after it.
    struct Flat {
        base: u64,
        bytes: Vec<u8>,
    }

    impl GpuMemory for Flat {
        fn read(&mut self, addr: u64, out: &mut [u8]) -> Result<(), MemFault> {
            let off = addr.checked_sub(self.base).ok_or(MemFault { addr })? as usize;
            let src = self.bytes.get(off..off + out.len()).ok_or(MemFault { addr })?;
            out.copy_from_slice(src);
            Ok(())
        }

        fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemFault> {
            let off = addr.checked_sub(self.base).ok_or(MemFault { addr })? as usize;
            let dst = self.bytes.get_mut(off..off + data.len()).ok_or(MemFault { addr })?;
            dst.copy_from_slice(data);
            Ok(())
        }
    }

    const BASE: u64 = 0x1_0000_0000;
    const DATA: u64 = BASE + 0x1000;

    fn flat(ib: &[u32]) -> (Flat, Vec<IbInfo>) {
        let mut bytes = vec![0u8; 0x4000];
        bytes[..ib.len() * 4].copy_from_slice(bytemuck::cast_slice(ib));
        let info = IbInfo {
            ib_mc_address: BASE,
            size: ib.len() as u32,
            ..Default::default()
        };
        (Flat { base: BASE, bytes }, vec![info])
    }

    fn env(family_id: u32) -> EngineEnv {
        EngineEnv {
            family_id,
            isa: Isa::Gfx9,
            instruction_budget: 1 << 16,
            progress: false,
        }
    }

    fn dword(mem: &Flat, addr: u64) -> u32 {
        let off = (addr - mem.base) as usize;
        u32::from_le_bytes([mem.bytes[off], mem.bytes[off + 1], mem.bytes[off + 2], mem.bytes[off + 3]])
    }

    fn run(kind: EngineKind, family_id: u32, mem: &mut Flat, ibs: &[IbInfo], regs: &mut RegisterFile) -> Outcome {
        let mut cursor = Cursor::default();
        execute(kind, mem, regs, ibs, &mut cursor, &env(family_id))
    }

    #[test]
    fn write_data_and_fill_reach_memory() {
        let ib = [
            packet3(PACKET3_WRITE_DATA, 4),
            write_data_dst_sel(WRITE_DATA_DST_SEL_MEM),
            DATA as u32,
            (DATA >> 32) as u32,
            0x11,
            0x22,
            packet3(PACKET3_DMA_DATA, 5),
            dma_data_src_sel(DMA_DATA_SRC_SEL_DATA),
            0xabcd0123,
            0,
            (DATA + 8) as u32,
            (DATA >> 32) as u32,
            10,
            GFX_COMPUTE_NOP,
        ];
        let (mut mem, ibs) = flat(&ib);
        let mut regs = RegisterFile::default();
        assert_eq!(run(EngineKind::Pm4, FAMILY_VI, &mut mem, &ibs, &mut regs), Outcome::Retired);
        assert_eq!(dword(&mem, DATA), 0x11);
        assert_eq!(dword(&mem, DATA + 4), 0x22);
        assert_eq!(dword(&mem, DATA + 8), 0xabcd0123);
        assert_eq!(dword(&mem, DATA + 12), 0xabcd0123);
        assert_eq!(mem.bytes[0x1000 + 8 + 9], 0x01);
        assert_eq!(mem.bytes[0x1000 + 8 + 10], 0);
    }

    #[test]
    fn register_writes_respect_privilege() {
        let ib = [
            packet3_compute(PACKET3_SET_SH_REG, 1),
            0x20c,
            0x1234,
            packet3(PACKET3_WRITE_DATA, 3),
            write_data_dst_sel(WRITE_DATA_DST_SEL_REG),
            0x54f,
            0,
            0xdeadbeef,
        ];
        let (mut mem, ibs) = flat(&ib);
        let mut regs = RegisterFile::default();
        assert_eq!(
            run(EngineKind::Pm4, FAMILY_VI, &mut mem, &ibs, &mut regs),
            Outcome::Hung(Hang::PrivilegedRegister(0x54f))
        );
        assert_eq!(regs.sh(GeneralReg::ComputePgmLo), 0x1234);
    }

    #[test]
    fn wait_reg_mem_stalls_then_resumes() {
        let ib = [
            packet3(PACKET3_WAIT_REG_MEM, 5),
            wait_reg_mem_mem_space(1) | wait_reg_mem_function(WAIT_REG_MEM_FUNC_NOT_EQUAL),
            DATA as u32,
            (DATA >> 32) as u32,
            0,
            0xffffffff,
            4,
            packet3(PACKET3_WRITE_DATA, 3),
            write_data_dst_sel(WRITE_DATA_DST_SEL_MEM),
            (DATA + 4) as u32,
            (DATA >> 32) as u32,
            7,
        ];
        let (mut mem, ibs) = flat(&ib);
        let mut regs = RegisterFile::default();
        let mut cursor = Cursor::default();
        let e = env(FAMILY_VI);
        assert_eq!(execute(EngineKind::Pm4, &mut mem, &mut regs, &ibs, &mut cursor, &e), Outcome::Stalled);
        assert_eq!(cursor.dw, 0);
        mem.bytes[0x1000] = 1;
        assert_eq!(execute(EngineKind::Pm4, &mut mem, &mut regs, &ibs, &mut cursor, &e), Outcome::Retired);
        assert_eq!(dword(&mem, DATA + 4), 7);
    }

    #[test]
    fn wait_on_ce_needs_a_ce_increment() {
        let ce = [packet3(PACKET3_SET_CE_DE_COUNTERS, 0), 0, packet3(PACKET3_INCREMENT_CE_COUNTER, 0), 1];
        let de = [packet3(PACKET3_WAIT_ON_CE_COUNTER, 0), 1];
        let (mut mem, _) = flat(&[ce.as_slice(), de.as_slice()].concat());
        let ce_ib = IbInfo {
            ib_mc_address: BASE,
            size: 4,
            ..Default::default()
        };
        let de_ib = IbInfo {
            ib_mc_address: BASE + 16,
            size: 2,
            ..Default::default()
        };
        let mut regs = RegisterFile::default();
        assert_eq!(run(EngineKind::Pm4, FAMILY_VI, &mut mem, &[ce_ib, de_ib], &mut regs), Outcome::Retired);
        assert_eq!(run(EngineKind::Pm4, FAMILY_VI, &mut mem, &[de_ib], &mut regs), Outcome::Stalled);
    }

    #[test]
    fn unknown_packets_and_faults_hang() {
        let (mut mem, ibs) = flat(&[packet3(0x7f, 0), 0]);
        let mut regs = RegisterFile::default();
        assert!(matches!(
            run(EngineKind::Pm4, FAMILY_VI, &mut mem, &ibs, &mut regs),
            Outcome::Hung(Hang::IllegalPacket { addr: BASE, .. })
        ));

        let (mut mem, ibs) = flat(&[
            packet3(PACKET3_WRITE_DATA, 3),
            write_data_dst_sel(WRITE_DATA_DST_SEL_MEM),
            0xdeadbee0,
            0,
            0xdeadbeef,
        ]);
        assert_eq!(
            run(EngineKind::Pm4, FAMILY_VI, &mut mem, &ibs, &mut regs),
            Outcome::Hung(Hang::Fault(MemFault { addr: 0xdeadbee0 }))
        );

        let (mut mem, ibs) = flat(&[packet3(PACKET3_WRITE_DATA, 8), 0]);
        assert!(matches!(
            run(EngineKind::Pm4, FAMILY_VI, &mut mem, &ibs, &mut regs),
            Outcome::Hung(Hang::Truncated { .. })
        ));
    }

    #[test]
    fn sdma_counts_are_biased_from_ai() {
        // AI: write count 1 means two dwords, fill and copy counts are bytes minus one
        let ib = [
            sdma_packet(SDMA_OPCODE_WRITE, 0, 0),
            DATA as u32,
            (DATA >> 32) as u32,
            1,
            0xa,
            0xb,
            sdma_packet(SDMA_OPCODE_CONSTANT_FILL, 0, sdma_constant_fill_extra_size(2)),
            (DATA + 16) as u32,
            (DATA >> 32) as u32,
            0x5555_5555,
            7,
            sdma_packet(SDMA_OPCODE_COPY, 0, 0),
            7,
            0,
            DATA as u32,
            (DATA >> 32) as u32,
            (DATA + 32) as u32,
            (DATA >> 32) as u32,
        ];
        let (mut mem, ibs) = flat(&ib);
        let mut regs = RegisterFile::default();
        assert_eq!(run(EngineKind::Sdma, FAMILY_AI, &mut mem, &ibs, &mut regs), Outcome::Retired);
        assert_eq!((dword(&mem, DATA), dword(&mem, DATA + 4)), (0xa, 0xb));
        assert_eq!((dword(&mem, DATA + 16), dword(&mem, DATA + 20)), (0x5555_5555, 0x5555_5555));
        assert_eq!(dword(&mem, DATA + 24), 0);
        assert_eq!((dword(&mem, DATA + 32), dword(&mem, DATA + 36)), (0xa, 0xb));
    }

    #[test]
    fn si_dma_layouts() {
        let ib = [
            sdma_packet_si(SDMA_OPCODE_WRITE, 0, 0, 0, 1),
            DATA as u32,
            (DATA >> 32) as u32,
            0x77,
            sdma_packet_si(SDMA_OPCODE_CONSTANT_FILL_SI, 0, 0, 0, 2),
            (DATA + 8) as u32,
            0x99,
            ((DATA >> 32) << 16) as u32,
            sdma_packet_si(SDMA_OPCODE_COPY_SI, 0, 0, 0, 8),
            (DATA + 32) as u32,
            (DATA + 8) as u32,
            (DATA >> 32) as u32,
            (DATA >> 32) as u32,
            SDMA_NOP_SI << 28,
        ];
        let (mut mem, ibs) = flat(&ib);
        let mut regs = RegisterFile::default();
        assert_eq!(run(EngineKind::Sdma, FAMILY_SI, &mut mem, &ibs, &mut regs), Outcome::Retired);
        assert_eq!(dword(&mem, DATA), 0x77);
        assert_eq!((dword(&mem, DATA + 8), dword(&mem, DATA + 12)), (0x99, 0x99));
        assert_eq!((dword(&mem, DATA + 32), dword(&mem, DATA + 36)), (0x99, 0x99));
    }

    #[test]
    fn sdma_poll_and_single_shot_cmpswap() {
        let ib = [
            sdma_packet(SDMA_OPCODE_ATOMIC, 0, sdma_atomic_loop(1) | sdma_atomic_opcode(TC_OP_ATOMIC_CMPSWAP_RTN_32)),
            DATA as u32,
            (DATA >> 32) as u32,
            0x12345678,
            0,
            0xdeadbeaf,
            0,
            0x100,
            sdma_pkt_header_op(SDMA_OP_POLL_REGMEM) | (WAIT_REG_MEM_FUNC_NOT_EQUAL << 28) | (1 << 31),
            (DATA + 4) as u32,
            (DATA >> 32) as u32,
            0,
            0xffffffff,
            4,
        ];
        let (mut mem, ibs) = flat(&ib);
        let mut regs = RegisterFile::default();
        assert_eq!(run(EngineKind::Sdma, FAMILY_AI, &mut mem, &ibs, &mut regs), Outcome::Stalled);
        assert_eq!(dword(&mem, DATA), 0);

        mem.bytes[0x1000..0x1004].copy_from_slice(&0xdeadbeafu32.to_le_bytes());
        mem.bytes[0x1004] = 1;
        assert_eq!(run(EngineKind::Sdma, FAMILY_AI, &mut mem, &ibs, &mut regs), Outcome::Retired);
        assert_eq!(dword(&mem, DATA), 0x12345678);
    }
}
