//! A small GCN/RDNA compute interpreter covering the instructions used by
//! the dispatch shaders, so compute submissions on the software device do
//! real work and the hang shader really hangs.

use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use crate::bit::{get_bits, u64_from_u32_u32};

pub const WAVE_SIZE: usize = 64;
const NUM_SGPRS: usize = 104;
const NUM_VGPRS: usize = 256;

/// Instruction encoding generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isa {
    Gfx9,
    Gfx10,
}

impl Isa {
    /// Gfx versions below 10 use the GFX9 encodings.
    pub fn from_version(version: u32) -> Self {
        if version >= 10 {
            Isa::Gfx10
        } else {
            Isa::Gfx9
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Sgpr(u8),
    Vgpr(u8),
    Const(u32),
    Literal(u32),
    Vcc,
    Exec,
    M0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mubuf {
    pub offset: u16,
    pub offen: bool,
    pub idxen: bool,
    pub vaddr: u8,
    pub vdata: u8,
    /// First SGPR of the 128-bit buffer descriptor.
    pub srsrc: u8,
    pub soffset: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    VMovB32 { vdst: u8, src0: Operand },
    VAndB32 { vdst: u8, src0: Operand, vsrc1: u8 },
    VAddCoU32 { vdst: u8, src0: Operand, vsrc1: u8 },
    VLshlAddU32 { vdst: u8, src0: Operand, src1: Operand, src2: Operand },
    SLshlB32 { sdst: u8, ssrc0: Operand, ssrc1: Operand },
    BufferLoadFormatXyzw(Mubuf),
    BufferStoreFormatXyzw(Mubuf),
    SWaitcnt,
    SNop,
    SEndpgm,
}

const VOP1_ENCODE: u64 = 0b0111111;
const VOP3_ENCODE_GFX9: u64 = 0b110100;
const VOP3_ENCODE_GFX10: u64 = 0b110101;
const MUBUF_ENCODE: u64 = 0b111000;
const SOPP_ENCODE: u64 = 0b101111111;
const SOP2_ENCODE: u64 = 0b10;

fn decode_src(addr: u64, literal: u32) -> Result<(Operand, bool), ()> {
    let addr = addr as u32;
    let op = match addr {
        0..=101 => Operand::Sgpr(addr as u8),
        106 => Operand::Vcc,
        124 => Operand::M0,
        126 => Operand::Exec,
        128 => Operand::Const(0),
        129..=192 => Operand::Const(addr - 128),
        193..=208 => Operand::Const((-((addr - 192) as i32)) as u32),
        240 => Operand::Const(0x3f000000), // 0.5
        241 => Operand::Const(0xbf000000), // -0.5
        242 => Operand::Const(0x3f800000), // 1.0
        243 => Operand::Const(0xbf800000), // -1.0
        244 => Operand::Const(0x40000000), // 2.0
        245 => Operand::Const(0xc0000000), // -2.0
        246 => Operand::Const(0x40800000), // 4.0
        247 => Operand::Const(0xc0800000), // -4.0
        248 => Operand::Const(0x3e22f983), // 1/(2*PI)
        255 => return Ok((Operand::Literal(literal), true)),
        256..=511 => Operand::Vgpr((addr - 256) as u8),
        _ => return Err(()),
    };
    Ok((op, false))
}

/// Decodes the instruction in the low dword of `inst`; the high dword is
/// the following word, used for 64-bit encodings and literals. Returns the
/// instruction and its size in bytes.
pub fn decode(inst: u64, isa: Isa) -> Result<(Inst, usize), ()> {
    let lo = inst & 0xffffffff;
    let hi = inst >> 32;

    if get_bits(lo, 31, 23) == SOPP_ENCODE {
        return match get_bits(lo, 22, 16) {
            0 => Ok((Inst::SNop, 4)),
            1 => Ok((Inst::SEndpgm, 4)),
            12 => Ok((Inst::SWaitcnt, 4)),
            _ => Err(()),
        };
    }
    if get_bits(lo, 31, 25) == VOP1_ENCODE {
        let (src0, lit) = decode_src(get_bits(lo, 8, 0), hi as u32)?;
        let vdst = get_bits(lo, 24, 17) as u8;
        return match get_bits(lo, 16, 9) {
            1 => Ok((Inst::VMovB32 { vdst, src0 }, if lit { 8 } else { 4 })),
            _ => Err(()),
        };
    }
    if get_bits(lo, 31, 31) == 0 {
        // VOP2
        let (src0, lit) = decode_src(get_bits(lo, 8, 0), hi as u32)?;
        let vsrc1 = get_bits(lo, 16, 9) as u8;
        let vdst = get_bits(lo, 24, 17) as u8;
        let size = if lit { 8 } else { 4 };
        let add_co = match isa {
            Isa::Gfx9 => 25,
            Isa::Gfx10 => 37,
        };
        return match get_bits(lo, 30, 25) {
            op if op == 19 && isa == Isa::Gfx9 => Ok((Inst::VAndB32 { vdst, src0, vsrc1 }, size)),
            op if op == 27 && isa == Isa::Gfx10 => Ok((Inst::VAndB32 { vdst, src0, vsrc1 }, size)),
            op if op == add_co => Ok((Inst::VAddCoU32 { vdst, src0, vsrc1 }, size)),
            _ => Err(()),
        };
    }
    if get_bits(lo, 31, 30) == SOP2_ENCODE && get_bits(lo, 31, 23) != SOPP_ENCODE {
        let (ssrc0, lit0) = decode_src(get_bits(lo, 7, 0), hi as u32)?;
        let (ssrc1, lit1) = decode_src(get_bits(lo, 15, 8), hi as u32)?;
        let sdst = get_bits(lo, 22, 16) as u8;
        let size = if lit0 || lit1 { 8 } else { 4 };
        return match get_bits(lo, 29, 23) {
            28 => Ok((Inst::SLshlB32 { sdst, ssrc0, ssrc1 }, size)),
            _ => Err(()),
        };
    }

    let vop3 = match isa {
        Isa::Gfx9 => VOP3_ENCODE_GFX9,
        Isa::Gfx10 => VOP3_ENCODE_GFX10,
    };
    if get_bits(lo, 31, 26) == vop3 {
        let lshl_add = match isa {
            Isa::Gfx9 => 0x1fd,
            Isa::Gfx10 => 0x346,
        };
        if get_bits(lo, 25, 16) != lshl_add {
            return Err(());
        }
        let (src0, _) = decode_src(get_bits(hi, 8, 0), 0)?;
        let (src1, _) = decode_src(get_bits(hi, 17, 9), 0)?;
        let (src2, _) = decode_src(get_bits(hi, 26, 18), 0)?;
        let vdst = get_bits(lo, 7, 0) as u8;
        return Ok((
            Inst::VLshlAddU32 {
                vdst,
                src0,
                src1,
                src2,
            },
            8,
        ));
    }
    if get_bits(lo, 31, 26) == MUBUF_ENCODE {
        let (soffset, _) = decode_src(get_bits(hi, 31, 24), 0)?;
        let mubuf = Mubuf {
            offset: get_bits(lo, 11, 0) as u16,
            offen: get_bits(lo, 12, 12) != 0,
            idxen: get_bits(lo, 13, 13) != 0,
            vaddr: get_bits(hi, 7, 0) as u8,
            vdata: get_bits(hi, 15, 8) as u8,
            srsrc: (get_bits(hi, 20, 16) * 4) as u8,
            soffset,
        };
        return match get_bits(lo, 24, 18) {
            3 => Ok((Inst::BufferLoadFormatXyzw(mubuf), 8)),
            7 => Ok((Inst::BufferStoreFormatXyzw(mubuf), 8)),
            _ => Err(()),
        };
    }
    Err(())
}

/// GPU virtual memory as seen by the shader.
pub trait GpuMemory {
    fn read(&mut self, addr: u64, out: &mut [u8]) -> Result<(), MemFault>;
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub addr: u64,
}

/// Why a dispatch did not retire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Undecodable instruction at `pc`.
    IllegalInstruction { pc: u64, word: u32 },
    /// The instruction budget ran out before the program ended.
    BudgetExhausted { executed: u64 },
    Fault(MemFault),
}

pub enum Signals {
    None,
    EndOfProgram,
    Unknown,
}

pub trait Processor {
    fn step(&mut self, mem: &mut dyn GpuMemory) -> Result<Signals, MemFault>;
}

/// Register state handed to a dispatch by the command processor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchState {
    pub pgm_addr: u64,
    pub pgm_rsrc2: u32,
    pub user_data: [u32; 16],
    pub num_thread: [u32; 3],
    pub start: [u32; 3],
    pub dim: [u32; 3],
}

impl DispatchState {
    fn user_sgpr_count(&self) -> usize {
        get_bits(self.pgm_rsrc2 as u64, 5, 1) as usize
    }

    fn tgid_enabled(&self, axis: usize) -> bool {
        get_bits(self.pgm_rsrc2 as u64, 7 + axis, 7 + axis) != 0
    }

    fn tg_size_enabled(&self) -> bool {
        get_bits(self.pgm_rsrc2 as u64, 10, 10) != 0
    }

    fn tidig_comp_cnt(&self) -> usize {
        get_bits(self.pgm_rsrc2 as u64, 12, 11) as usize
    }

    fn threads_per_group(&self) -> u64 {
        self.num_thread.iter().map(|&n| n.max(1) as u64).product()
    }

    pub fn workgroups(&self) -> u64 {
        self.dim.iter().map(|&n| n as u64).product()
    }
}

struct Wave {
    pc: u64,
    isa: Isa,
    exec: u64,
    vcc: u64,
    m0: u32,
    sgprs: Vec<u32>,
    vgprs: Vec<[u32; WAVE_SIZE]>,
}

impl Wave {
    fn new(pc: u64, isa: Isa) -> Self {
        Wave {
            pc,
            isa,
            exec: 0,
            vcc: 0,
            m0: 0,
            sgprs: vec![0; NUM_SGPRS],
            vgprs: vec![[0; WAVE_SIZE]; NUM_VGPRS],
        }
    }

    fn read_sop_src(&self, op: Operand) -> u32 {
        match op {
            Operand::Sgpr(s) => self.sgprs[s as usize],
            Operand::Const(v) | Operand::Literal(v) => v,
            Operand::Vcc => self.vcc as u32,
            Operand::Exec => self.exec as u32,
            Operand::M0 => self.m0,
            // VGPRs are not legal scalar sources; the decoder never yields one here.
            Operand::Vgpr(_) => 0,
        }
    }

    fn read_vop_src(&self, elem: usize, op: Operand) -> u32 {
        match op {
            Operand::Vgpr(v) => self.vgprs[v as usize][elem],
            other => self.read_sop_src(other),
        }
    }

    fn write_sgpr(&mut self, idx: u8, value: u32) {
        if let Some(s) = self.sgprs.get_mut(idx as usize) {
            *s = value;
        }
    }

    fn lanes(&self) -> impl Iterator<Item = usize> {
        let exec = self.exec;
        (0..WAVE_SIZE).filter(move |l| exec & (1 << l) != 0)
    }

    fn fetch_inst(&self, mem: &mut dyn GpuMemory) -> Result<u64, MemFault> {
        let mut lo = [0u8; 4];
        mem.read(self.pc, &mut lo)?;
        let mut hi = [0u8; 4];
        // the last instruction of a mapping has no successor word
        let _ = mem.read(self.pc + 4, &mut hi);
        Ok(u64_from_u32_u32(u32::from_le_bytes(lo), u32::from_le_bytes(hi)))
    }

    fn buffer_address(&self, lane: usize, m: &Mubuf) -> Option<u64> {
        let s = &self.sgprs[m.srsrc as usize..m.srsrc as usize + 4];
        let base = u64_from_u32_u32(s[0], s[1] & 0xffff);
        let stride = get_bits(s[1] as u64, 29, 16);
        let num_records = s[2] as u64;

        let index = if m.idxen {
            self.vgprs[m.vaddr as usize][lane] as u64
        } else {
            0
        };
        let voffset = if m.offen {
            self.vgprs[m.vaddr as usize + m.idxen as usize][lane] as u64
        } else {
            0
        };
        let offset = voffset + m.offset as u64 + self.read_sop_src(m.soffset) as u64;
        let in_range = if stride == 0 {
            offset < num_records
        } else {
            index < num_records
        };
        if in_range {
            Some(base + index * stride + offset)
        } else {
            None
        }
    }

    fn execute_inst(&mut self, inst: Inst, mem: &mut dyn GpuMemory) -> Result<Signals, MemFault> {
        match inst {
            Inst::VMovB32 { vdst, src0 } => {
                for l in self.lanes().collect::<Vec<_>>() {
                    self.vgprs[vdst as usize][l] = self.read_vop_src(l, src0);
                }
            }
            Inst::VAndB32 { vdst, src0, vsrc1 } => {
                for l in self.lanes().collect::<Vec<_>>() {
                    let v = self.read_vop_src(l, src0) & self.vgprs[vsrc1 as usize][l];
                    self.vgprs[vdst as usize][l] = v;
                }
            }
            Inst::VAddCoU32 { vdst, src0, vsrc1 } => {
                let mut carry = 0u64;
                for l in self.lanes().collect::<Vec<_>>() {
                    let (v, c) = self.read_vop_src(l, src0).overflowing_add(self.vgprs[vsrc1 as usize][l]);
                    self.vgprs[vdst as usize][l] = v;
                    carry |= (c as u64) << l;
                }
                self.vcc = carry;
            }
            Inst::VLshlAddU32 {
                vdst,
                src0,
                src1,
                src2,
            } => {
                for l in self.lanes().collect::<Vec<_>>() {
                    let shift = self.read_vop_src(l, src1) & 0x1f;
                    let v = (self.read_vop_src(l, src0) << shift).wrapping_add(self.read_vop_src(l, src2));
                    self.vgprs[vdst as usize][l] = v;
                }
            }
            Inst::SLshlB32 { sdst, ssrc0, ssrc1 } => {
                let v = self.read_sop_src(ssrc0) << (self.read_sop_src(ssrc1) & 0x1f);
                self.write_sgpr(sdst, v);
            }
            Inst::BufferLoadFormatXyzw(m) => {
                for l in self.lanes().collect::<Vec<_>>() {
                    let mut data = [0u8; 16];
                    if let Some(addr) = self.buffer_address(l, &m) {
                        mem.read(addr, &mut data)?;
                    }
                    for (i, chunk) in data.chunks_exact(4).enumerate() {
                        let reg = m.vdata as usize + i;
                        if reg < NUM_VGPRS {
                            self.vgprs[reg][l] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        }
                    }
                }
            }
            Inst::BufferStoreFormatXyzw(m) => {
                for l in self.lanes().collect::<Vec<_>>() {
                    if let Some(addr) = self.buffer_address(l, &m) {
                        let mut data = [0u8; 16];
                        for i in 0..4 {
                            let v = self.vgprs.get(m.vdata as usize + i).map_or(0, |r| r[l]);
                            data[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
                        }
                        mem.write(addr, &data)?;
                    }
                }
            }
            Inst::SWaitcnt | Inst::SNop => {}
            Inst::SEndpgm => return Ok(Signals::EndOfProgram),
        }
        Ok(Signals::None)
    }
}

impl Processor for Wave {
    fn step(&mut self, mem: &mut dyn GpuMemory) -> Result<Signals, MemFault> {
        let word = self.fetch_inst(mem)?;
        if let Ok((inst, size)) = decode(word, self.isa) {
            self.pc += size as u64;
            self.execute_inst(inst, mem)
        } else {
            debug!(pc = %format_args!("{:#x}", self.pc), word = %format_args!("{:#010x}", word as u32), "unknown instruction");
            Ok(Signals::Unknown)
        }
    }
}

/// Runs every workgroup of a dispatch to completion.
///
/// Returns the number of instructions executed; `budget` bounds that
/// number across the whole dispatch.
pub fn run_dispatch(
    mem: &mut dyn GpuMemory,
    state: &DispatchState,
    isa: Isa,
    budget: u64,
    show_progress: bool,
) -> Result<u64, DispatchError> {
    let threads = state.threads_per_group();
    let waves_per_group = (threads + WAVE_SIZE as u64 - 1) / WAVE_SIZE as u64;
    let groups = state.workgroups();

    let progress = if show_progress {
        let bar = ProgressBar::new(groups);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta_precise}) \n {msg}")
                .progress_chars("#>-"),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let nx = state.num_thread[0].max(1) as u64;
    let ny = state.num_thread[1].max(1) as u64;
    let mut executed = 0u64;

    for group in 0..groups {
        let gx = group % state.dim[0] as u64;
        let gy = (group / state.dim[0] as u64) % state.dim[1].max(1) as u64;
        let gz = group / (state.dim[0] as u64 * state.dim[1].max(1) as u64);
        let tgid = [
            state.start[0] + gx as u32,
            state.start[1] + gy as u32,
            state.start[2] + gz as u32,
        ];

        for w in 0..waves_per_group {
            let mut wave = Wave::new(state.pgm_addr, isa);
            let first = w * WAVE_SIZE as u64;
            let active = (threads - first).min(WAVE_SIZE as u64);
            wave.exec = if active == 64 { u64::MAX } else { (1u64 << active) - 1 };

            let user = state.user_sgpr_count().min(16);
            wave.sgprs[..user].copy_from_slice(&state.user_data[..user]);
            let mut next = user;
            for (axis, id) in tgid.iter().enumerate() {
                if state.tgid_enabled(axis) {
                    wave.sgprs[next] = *id;
                    next += 1;
                }
            }
            if state.tg_size_enabled() {
                wave.sgprs[next] = threads as u32;
            }

            for lane in 0..active as usize {
                let t = first + lane as u64;
                wave.vgprs[0][lane] = (t % nx) as u32;
                if state.tidig_comp_cnt() >= 1 {
                    wave.vgprs[1][lane] = ((t / nx) % ny) as u32;
                }
                if state.tidig_comp_cnt() >= 2 {
                    wave.vgprs[2][lane] = (t / (nx * ny)) as u32;
                }
            }

            loop {
                if executed >= budget {
                    progress.abandon_with_message("instruction budget exhausted");
                    return Err(DispatchError::BudgetExhausted { executed });
                }
                let pc = wave.pc;
                executed += 1;
                match wave.step(mem).map_err(DispatchError::Fault)? {
                    Signals::None => {}
                    Signals::EndOfProgram => break,
                    Signals::Unknown => {
                        let mut word = [0u8; 4];
                        let _ = mem.read(pc, &mut word);
                        progress.abandon_with_message("illegal instruction");
                        return Err(DispatchError::IllegalInstruction {
                            pc,
                            word: u32::from_le_bytes(word),
                        });
                    }
                }
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();
    Ok(executed)
}
