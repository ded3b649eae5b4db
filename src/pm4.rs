//! PM4 packet encoding for the graphics/compute command processor.

use crate::bit::get_bits32;

pub const PACKET_TYPE2: u32 = 2;
pub const PACKET_TYPE3: u32 = 3;

pub const PACKET3_NOP: u32 = 0x10;
pub const PACKET3_ATOMIC_MEM: u32 = 0x1E;
pub const PACKET3_DISPATCH_DIRECT: u32 = 0x15;
pub const PACKET3_CONTEXT_CONTROL: u32 = 0x28;
pub const PACKET3_WRITE_DATA: u32 = 0x37;
pub const PACKET3_WAIT_REG_MEM: u32 = 0x3C;
pub const PACKET3_DMA_DATA_SI: u32 = 0x41;
pub const PACKET3_DMA_DATA: u32 = 0x50;
pub const PACKET3_SET_SH_REG: u32 = 0x76;
pub const PACKET3_SET_UCONFIG_REG: u32 = 0x79;
pub const PACKET3_INCREMENT_CE_COUNTER: u32 = 0x84;
pub const PACKET3_WAIT_ON_CE_COUNTER: u32 = 0x86;
pub const PACKET3_SET_CE_DE_COUNTERS: u32 = 0x89;
pub const PACKET3_SET_SH_REG_INDEX: u32 = 0x9B;

pub const PACKET3_SET_SH_REG_START: u32 = 0x2c00;
pub const PACKET3_SET_UCONFIG_REG_START: u32 = 0xc000;

/// One-dword type-3 NOP used to pad compute and gfx IBs on CI and later.
pub const GFX_COMPUTE_NOP: u32 = 0xffff1000;
/// Type-2 filler understood by SI command processors.
pub const GFX_COMPUTE_NOP_SI: u32 = 0x80000000;

// WRITE_DATA
pub const WRITE_DATA_DST_SEL_REG: u32 = 0;
pub const WRITE_DATA_DST_SEL_MEM: u32 = 5;
pub const WRITE_DATA_WR_CONFIRM: u32 = 1 << 20;

pub const fn write_data_dst_sel(x: u32) -> u32 {
    x << 8
}

// DMA_DATA, CI and later
pub const fn dma_data_engine(x: u32) -> u32 {
    x
}
pub const fn dma_data_dst_sel(x: u32) -> u32 {
    x << 20
}
pub const fn dma_data_src_sel(x: u32) -> u32 {
    x << 29
}
pub const DMA_DATA_CP_SYNC: u32 = 1 << 31;
pub const DMA_DATA_SRC_SEL_DATA: u32 = 2;

// DMA_DATA, SI
pub const fn dma_data_si_engine(x: u32) -> u32 {
    x << 27
}
pub const fn dma_data_si_dst_sel(x: u32) -> u32 {
    x << 20
}
pub const fn dma_data_si_src_sel(x: u32) -> u32 {
    x << 29
}
pub const DMA_DATA_SI_CP_SYNC: u32 = 1 << 31;

// WAIT_REG_MEM
pub const fn wait_reg_mem_function(x: u32) -> u32 {
    x
}
pub const fn wait_reg_mem_mem_space(x: u32) -> u32 {
    x << 4
}
pub const fn wait_reg_mem_engine(x: u32) -> u32 {
    x << 8
}
pub const WAIT_REG_MEM_FUNC_NOT_EQUAL: u32 = 4;

// ATOMIC_MEM
pub const TC_OP_ATOMIC_CMPSWAP_RTN_32: u32 = 0x00000008;
pub const fn atomic_mem_command(x: u32) -> u32 {
    x << 8
}
pub const fn atomic_mem_cache_policy(x: u32) -> u32 {
    x << 25
}
pub const fn atomic_mem_engine_sel(x: u32) -> u32 {
    x << 30
}

pub const fn packet3(op: u32, n: u32) -> u32 {
    (PACKET_TYPE3 << 30) | ((n & 0x3fff) << 16) | ((op & 0xff) << 8)
}

/// Type-3 header with the shader-type bit set, routing SET_SH_REG and
/// DISPATCH packets to the compute pipe.
pub const fn packet3_compute(op: u32, n: u32) -> u32 {
    packet3(op, n) | (1 << 1)
}

/// A decoded PM4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pm4Header {
    /// Type-2 filler, one dword.
    Filler,
    /// Type-3 packet spanning `count + 2` dwords.
    Type3 { opcode: u32, count: u32, compute: bool },
    /// The single-dword NOP form.
    ShortNop,
    Other(u32),
}

impl Pm4Header {
    pub fn decode(header: u32) -> Self {
        if header == GFX_COMPUTE_NOP {
            return Pm4Header::ShortNop;
        }
        match get_bits32(header, 31, 30) {
            PACKET_TYPE2 => Pm4Header::Filler,
            PACKET_TYPE3 => Pm4Header::Type3 {
                opcode: get_bits32(header, 15, 8),
                count: get_bits32(header, 29, 16),
                compute: get_bits32(header, 1, 1) != 0,
            },
            _ => Pm4Header::Other(header),
        }
    }

    /// Total packet length in dwords, header included.
    pub fn len_dw(&self) -> usize {
        match self {
            Pm4Header::Filler | Pm4Header::ShortNop | Pm4Header::Other(_) => 1,
            Pm4Header::Type3 { count, .. } => *count as usize + 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bits() {
        assert_eq!(packet3(PACKET3_NOP, 14), 0xc00e1000);
        assert_eq!(packet3(PACKET3_DMA_DATA, 5), 0xc0055000);
        assert_eq!(packet3_compute(PACKET3_SET_SH_REG, 3), 0xc0037602);
        assert_eq!(packet3(PACKET3_SET_CE_DE_COUNTERS, 0), 0xc0008900);
        assert_eq!(packet3(PACKET3_INCREMENT_CE_COUNTER, 0), 0xc0008400);
        assert_eq!(packet3(PACKET3_WAIT_ON_CE_COUNTER, 0), 0xc0008600);
    }

    #[test]
    fn decodes_headers() {
        assert_eq!(Pm4Header::decode(GFX_COMPUTE_NOP), Pm4Header::ShortNop);
        assert_eq!(Pm4Header::decode(GFX_COMPUTE_NOP_SI), Pm4Header::Filler);
        let h = Pm4Header::decode(packet3_compute(PACKET3_DISPATCH_DIRECT, 3));
        assert_eq!(
            h,
            Pm4Header::Type3 {
                opcode: PACKET3_DISPATCH_DIRECT,
                count: 3,
                compute: true
            }
        );
        assert_eq!(h.len_dw(), 5);
    }
}
