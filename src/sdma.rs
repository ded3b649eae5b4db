//! SDMA packet encoding, in both the SI and the CI-and-later header layouts.

use crate::bit::get_bits32;

pub const SDMA_OPCODE_COPY: u32 = 1;
pub const SDMA_OPCODE_WRITE: u32 = 2;
pub const SDMA_OPCODE_COPY_SI: u32 = 3;
pub const SDMA_OP_POLL_REGMEM: u32 = 8;
pub const SDMA_OPCODE_ATOMIC: u32 = 10;
pub const SDMA_OPCODE_CONSTANT_FILL: u32 = 11;
pub const SDMA_OPCODE_CONSTANT_FILL_SI: u32 = 13;

pub const SDMA_COPY_SUB_OPCODE_LINEAR: u32 = 0;
pub const SDMA_WRITE_SUB_OPCODE_LINEAR: u32 = 0;

pub const SDMA_NOP: u32 = 0x0;
pub const SDMA_NOP_SI: u32 = 0xf;

/// Fill size field of CONSTANT_FILL: 0 for bytes, 2 for dwords.
pub const fn sdma_constant_fill_extra_size(x: u32) -> u32 {
    x << 14
}

pub const fn sdma_atomic_loop(x: u32) -> u32 {
    x
}
pub const fn sdma_atomic_tmz(x: u32) -> u32 {
    x << 2
}
pub const fn sdma_atomic_opcode(x: u32) -> u32 {
    x << 9
}

pub const fn sdma_pkt_header_op(x: u32) -> u32 {
    x & 0xff
}

pub const fn sdma_packet(op: u32, sub_op: u32, e: u32) -> u32 {
    ((e & 0xffff) << 16) | ((sub_op & 0xff) << 8) | (op & 0xff)
}

pub const fn sdma_packet_si(op: u32, b: u32, t: u32, s: u32, cnt: u32) -> u32 {
    ((op & 0xf) << 28) | ((b & 0x1) << 26) | ((t & 0x1) << 23) | ((s & 0x1) << 22) | (cnt & 0xfffff)
}

/// Fields of a CI-and-later SDMA header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmaHeader {
    pub op: u32,
    pub sub_op: u32,
    pub extra: u32,
}

impl SdmaHeader {
    pub fn decode(header: u32) -> Self {
        SdmaHeader {
            op: get_bits32(header, 7, 0),
            sub_op: get_bits32(header, 15, 8),
            extra: get_bits32(header, 31, 16),
        }
    }
}

/// Fields of an SI DMA header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmaHeaderSi {
    pub op: u32,
    pub count: u32,
}

impl SdmaHeaderSi {
    pub fn decode(header: u32) -> Self {
        SdmaHeaderSi {
            op: get_bits32(header, 31, 28),
            count: get_bits32(header, 19, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layouts() {
        assert_eq!(
            sdma_packet(SDMA_OPCODE_CONSTANT_FILL, 0, sdma_constant_fill_extra_size(2)),
            0x8000_000b
        );
        assert_eq!(sdma_packet_si(SDMA_OPCODE_COPY_SI, 0, 0, 0, 1024), 0x3000_0400);
        let atomic = sdma_packet(
            SDMA_OPCODE_ATOMIC,
            0,
            sdma_atomic_loop(1) | sdma_atomic_tmz(1) | sdma_atomic_opcode(8),
        );
        let h = SdmaHeader::decode(atomic);
        assert_eq!((h.op, h.extra & 1, (h.extra >> 2) & 1, h.extra >> 9), (10, 1, 1, 8));
        assert_eq!(SdmaHeaderSi::decode(0x3000_0400), SdmaHeaderSi { op: 3, count: 1024 });
    }
}
