pub fn get_bits(value: u64, to: usize, from: usize) -> u64 {
    let num = to + 1 - from;
    (value >> from) & mask(num)
}

pub fn get_bits32(value: u32, to: usize, from: usize) -> u32 {
    get_bits(value as u64, to, from) as u32
}

pub fn mask(num: usize) -> u64 {
    if num >= 64 {
        u64::MAX
    } else {
        (1u64 << num) - 1
    }
}

pub fn lower_32_bits(value: u64) -> u32 {
    (value & 0xFFFFFFFF) as u32
}

pub fn upper_32_bits(value: u64) -> u32 {
    (value >> 32) as u32
}

pub fn u64_from_u32_u32(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | (lo as u64)
}

pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fields() {
        assert_eq!(get_bits(0xc0055000, 15, 8), 0x50);
        assert_eq!(get_bits(0xc0055000, 29, 16), 5);
        assert_eq!(get_bits(u64::MAX, 63, 0), u64::MAX);
    }

    #[test]
    fn rounds_to_alignment() {
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(13, 0), 13);
    }
}
