//! Precompiled shader and kernel binaries.
//!
//! AMD compute shaders are selected by purpose and GFX version and copied
//! verbatim into GPU-visible memory. The Intel SF/PS kernels used by the
//! GEN4/5 render copy live here as well.

use tracing::debug;

use crate::error::{Error, Result};
use crate::family::{FAMILY_AI, FAMILY_NV, FAMILY_RV};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    BufferClear,
    BufferCopy,
    /// Malformed program that never retires.
    Hang,
}

impl ShaderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ShaderKind::BufferClear => "bufferclear",
            ShaderKind::BufferCopy => "buffercopy",
            ShaderKind::Hang => "hang",
        }
    }
}

static BUFFERCLEAR_CS_SHADER_GFX9: [u32; 13] = [
    0x260000ff, 0x000003ff, 0xd1fd0000, 0x04010c08, 0x7e020280, 0x7e040204, 0x7e060205, 0x7e080206,
    0x7e0a0207, 0xe01c2000, 0x80000200, 0xbf8c0000, 0xbf810000,
];

static BUFFERCOPY_CS_SHADER_GFX9: [u32; 11] = [
    0x260000ff, 0x000003ff, 0xd1fd0000, 0x04010c08, 0x7e020280, 0xe00c2000, 0x80000200, 0xbf8c0f70,
    0xe01c2000, 0x80010200, 0xbf810000,
];

static BUFFERCLEAR_CS_SHADER_GFX10: [u32; 9] = [
    0xD7460004, 0x04010C08, 0x7E000204, 0x7E020205, 0x7E040206, 0x7E060207, 0xE01C2000, 0x80000004,
    0xBF810000,
];

static BUFFERCOPY_CS_SHADER_GFX10: [u32; 8] = [
    0xD7460001, 0x04010C08, 0xE00C2000, 0x80000201, 0xBF8C3F70, 0xE01C2000, 0x80010201, 0xBF810000,
];

/// The same bytes serve every GFX version; the first dword cannot be
/// decoded.
static MEMCPY_PS_HANG: [u32; 19] = [
    0xFFFFFFFF, 0xBEFE0A7E, 0xBEFC0304, 0xC0C20100, 0xC0800300, 0xC8080000, 0xC80C0100, 0xC8090001,
    0xC80D0101, 0xBF8C007F, 0xF0800F00, 0x00010002, 0xBEFE040C, 0xBF8C0F70, 0xBF800000, 0xBF800000,
    0xF800180F, 0x03020100, 0xBF810000,
];

/// A shader split into a prologue, a body that is replicated, and an
/// epilogue.
struct ShaderCode {
    code: &'static [u32],
    header_length: usize,
    body_length: usize,
    foot_length: usize,
}

/// How often the hang-slow body is repeated.
pub const HANG_SLOW_LOOP: usize = 0x10000;

static MEMCPY_CS_HANG_SLOW_AI_CODES: [u32; 8] = [
    0xd1fd0000, 0x04010c08, 0xe00c2000, 0x80000100, 0xbf8c0f70, 0xe01c2000, 0x80010100, 0xbf810000,
];

static MEMCPY_CS_HANG_SLOW_RV_CODES: [u32; 8] = [
    0x8e00860c, 0x32000000, 0xe00c2000, 0x80010100, 0xbf8c0f70, 0xe01c2000, 0x80020100, 0xbf810000,
];

static MEMCPY_CS_HANG_SLOW_NV_CODES: [u32; 8] = [
    0xd7460000, 0x04010c08, 0xe00c2000, 0x80000100, 0xbf8c0f70, 0xe01c2000, 0x80010100, 0xbf810000,
];

static MEMCPY_CS_HANG_SLOW_AI: ShaderCode = ShaderCode {
    code: &MEMCPY_CS_HANG_SLOW_AI_CODES,
    header_length: 4,
    body_length: 3,
    foot_length: 1,
};

static MEMCPY_CS_HANG_SLOW_RV: ShaderCode = ShaderCode {
    code: &MEMCPY_CS_HANG_SLOW_RV_CODES,
    header_length: 4,
    body_length: 3,
    foot_length: 1,
};

static MEMCPY_CS_HANG_SLOW_NV: ShaderCode = ShaderCode {
    code: &MEMCPY_CS_HANG_SLOW_NV_CODES,
    header_length: 4,
    body_length: 3,
    foot_length: 1,
};

fn cs_shader(kind: ShaderKind, version: u32) -> Option<&'static [u32]> {
    match (kind, version) {
        (ShaderKind::BufferClear, 9) => Some(&BUFFERCLEAR_CS_SHADER_GFX9),
        (ShaderKind::BufferClear, 10) => Some(&BUFFERCLEAR_CS_SHADER_GFX10),
        (ShaderKind::BufferCopy, 9) => Some(&BUFFERCOPY_CS_SHADER_GFX9),
        (ShaderKind::BufferCopy, 10) => Some(&BUFFERCOPY_CS_SHADER_GFX10),
        (ShaderKind::Hang, _) => Some(&MEMCPY_PS_HANG),
        _ => None,
    }
}

fn copy_dwords(dst: &mut [u8], offset: usize, code: &[u32]) {
    for (i, dw) in code.iter().enumerate() {
        let at = offset + i * 4;
        dst[at..at + 4].copy_from_slice(&dw.to_le_bytes());
    }
}

/// Copies the `kind` compute shader for GFX `version` into `dst` and
/// returns its size in bytes.
pub fn load_cs_shader(dst: &mut [u8], kind: ShaderKind, version: u32) -> Result<usize> {
    let code = cs_shader(kind, version).ok_or(Error::UnsupportedShader {
        kind: kind.name(),
        version,
    })?;
    let size = code.len() * 4;
    if dst.len() < size {
        return Err(Error::DestinationTooSmall {
            needed: size,
            available: dst.len(),
        });
    }
    copy_dwords(dst, 0, code);
    debug!(kind = kind.name(), version, size, "loaded cs shader");
    Ok(size)
}

/// Size in bytes of the hang-slow shader once expanded.
pub fn hang_slow_shader_size(family_id: u32) -> Result<usize> {
    let shader = hang_slow_code(family_id)?;
    Ok((shader.header_length + shader.body_length * HANG_SLOW_LOOP + shader.foot_length) * 4)
}

fn hang_slow_code(family_id: u32) -> Result<&'static ShaderCode> {
    match family_id {
        FAMILY_AI => Ok(&MEMCPY_CS_HANG_SLOW_AI),
        FAMILY_RV => Ok(&MEMCPY_CS_HANG_SLOW_RV),
        FAMILY_NV => Ok(&MEMCPY_CS_HANG_SLOW_NV),
        _ => Err(Error::UnsupportedShader {
            kind: "hang-slow",
            version: family_id,
        }),
    }
}

/// Writes the hang-slow copy shader: the header once, the body
/// [`HANG_SLOW_LOOP`] times, then the footer. Returns the byte size.
pub fn load_cs_shader_hang_slow(dst: &mut [u8], family_id: u32) -> Result<usize> {
    let shader = hang_slow_code(family_id)?;
    let size = hang_slow_shader_size(family_id)?;
    if dst.len() < size {
        return Err(Error::DestinationTooSmall {
            needed: size,
            available: dst.len(),
        });
    }

    let header = &shader.code[..shader.header_length];
    let body = &shader.code[shader.header_length..shader.header_length + shader.body_length];
    let foot = &shader.code[shader.header_length + shader.body_length..][..shader.foot_length];

    copy_dwords(dst, 0, header);
    let mut offset = header.len() * 4;
    for _ in 0..HANG_SLOW_LOOP {
        copy_dwords(dst, offset, body);
        offset += body.len() * 4;
    }
    copy_dwords(dst, offset, foot);
    debug!(family_id, size, "loaded hang-slow cs shader");
    Ok(size)
}

// GEN4/5 strips-and-fans and pixel-shader kernels for the render copy.

pub static GEN4_SF_KERNEL_NOMASK: [[u32; 4]; 7] = [
    [0x00400031, 0x20c01fbd, 0x0069002c, 0x01110001],
    [0x00600001, 0x206003be, 0x00690060, 0x00000000],
    [0x00600040, 0x20e077bd, 0x00690080, 0x006940a0],
    [0x00600041, 0x202077be, 0x008d00e0, 0x000000c0],
    [0x00600040, 0x20e077bd, 0x006900a0, 0x00694060],
    [0x00600041, 0x204077be, 0x008d00e0, 0x000000c8],
    [0x00600031, 0x20001fbc, 0x008d0000, 0x8640c800],
];

pub static GEN5_SF_KERNEL_NOMASK: [[u32; 4]; 7] = [
    [0x00400031, 0x20c01fbd, 0x1069002c, 0x02100001],
    [0x00600001, 0x206003be, 0x00690060, 0x00000000],
    [0x00600040, 0x20e077bd, 0x00690080, 0x006940a0],
    [0x00600041, 0x202077be, 0x008d00e0, 0x000000c0],
    [0x00600040, 0x20e077bd, 0x006900a0, 0x00694060],
    [0x00600041, 0x204077be, 0x008d00e0, 0x000000c8],
    [0x00600031, 0x20001fbc, 0x648d0000, 0x8808c800],
];

pub static GEN4_PS_KERNEL_NOMASK_AFFINE: [[u32; 4]; 21] = [
    [0x00800040, 0x23c06d29, 0x00480028, 0x10101010],
    [0x00800040, 0x23806d29, 0x0048002a, 0x11001100],
    [0x00802040, 0x2100753d, 0x008d03c0, 0x00004020],
    [0x00802040, 0x2140753d, 0x008d0380, 0x00004024],
    [0x00802059, 0x200077bc, 0x00000060, 0x008d0100],
    [0x00802048, 0x204077be, 0x00000064, 0x008d0140],
    [0x00802059, 0x200077bc, 0x00000070, 0x008d0100],
    [0x00802048, 0x208077be, 0x00000074, 0x008d0140],
    [0x00600201, 0x20200022, 0x008d0000, 0x00000000],
    [0x00000201, 0x20280062, 0x00000000, 0x00000000],
    [0x01800031, 0x21801d09, 0x008d0000, 0x02580001],
    [0x00600001, 0x204003be, 0x008d0180, 0x00000000],
    [0x00601001, 0x20c003be, 0x008d01a0, 0x00000000],
    [0x00600001, 0x206003be, 0x008d01c0, 0x00000000],
    [0x00601001, 0x20e003be, 0x008d01e0, 0x00000000],
    [0x00600001, 0x208003be, 0x008d0200, 0x00000000],
    [0x00601001, 0x210003be, 0x008d0220, 0x00000000],
    [0x00600001, 0x20a003be, 0x008d0240, 0x00000000],
    [0x00601001, 0x212003be, 0x008d0260, 0x00000000],
    [0x00600201, 0x202003be, 0x008d0020, 0x00000000],
    [0x00800031, 0x20001d28, 0x008d0000, 0x85a04800],
];

pub static GEN5_PS_KERNEL_NOMASK_AFFINE: [[u32; 4]; 15] = [
    [0x00800040, 0x23c06d29, 0x00480028, 0x10101010],
    [0x00800040, 0x23806d29, 0x0048002a, 0x11001100],
    [0x00802040, 0x2100753d, 0x008d03c0, 0x00004020],
    [0x00802040, 0x2140753d, 0x008d0380, 0x00004024],
    [0x00802059, 0x200077bc, 0x00000060, 0x008d0100],
    [0x00802048, 0x204077be, 0x00000064, 0x008d0140],
    [0x00802059, 0x200077bc, 0x00000070, 0x008d0100],
    [0x00802048, 0x208077be, 0x00000074, 0x008d0140],
    [0x01800031, 0x21801fa9, 0x208d0000, 0x0a8a0001],
    [0x00802001, 0x304003be, 0x008d0180, 0x00000000],
    [0x00802001, 0x306003be, 0x008d01c0, 0x00000000],
    [0x00802001, 0x308003be, 0x008d0200, 0x00000000],
    [0x00802001, 0x30a003be, 0x008d0240, 0x00000000],
    [0x00600201, 0x202003be, 0x008d0020, 0x00000000],
    [0x00800031, 0x20001d28, 0x548d0000, 0x94084800],
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit::u64_from_u32_u32;
    use crate::gcn::{decode, Inst, Isa};

    fn get_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn copies_shader_verbatim() {
        let mut dst = vec![0u8; 256];
        let size = load_cs_shader(&mut dst, ShaderKind::BufferClear, 9).unwrap();
        assert_eq!(size, 13 * 4);
        assert_eq!(get_u32(&dst, 0), 0x260000ff);
        assert_eq!(get_u32(&dst, size - 4), 0xbf810000);
        assert_eq!(load_cs_shader(&mut dst, ShaderKind::BufferCopy, 10).unwrap(), 32);
    }

    #[test]
    fn unsupported_and_short_destinations_fail() {
        let mut dst = vec![0u8; 16];
        assert!(matches!(
            load_cs_shader(&mut dst, ShaderKind::BufferClear, 8),
            Err(Error::UnsupportedShader { version: 8, .. })
        ));
        assert!(matches!(
            load_cs_shader(&mut dst, ShaderKind::BufferCopy, 9),
            Err(Error::DestinationTooSmall { needed: 44, available: 16 })
        ));
    }

    #[test]
    fn hang_shader_starts_with_an_undecodable_word() {
        let mut dst = vec![0u8; 128];
        for version in [9, 10, 11] {
            load_cs_shader(&mut dst, ShaderKind::Hang, version).unwrap();
            let word = u64_from_u32_u32(get_u32(&dst, 0), get_u32(&dst, 4));
            assert!(decode(word, Isa::from_version(version)).is_err());
        }
    }

    #[test]
    fn hang_slow_replicates_the_body() {
        let size = hang_slow_shader_size(FAMILY_AI).unwrap();
        assert_eq!(size, (4 + 3 * HANG_SLOW_LOOP + 1) * 4);
        let mut dst = vec![0u8; size];
        assert_eq!(load_cs_shader_hang_slow(&mut dst, FAMILY_AI).unwrap(), size);
        assert_eq!(get_u32(&dst, 16), 0xbf8c0f70);
        assert_eq!(get_u32(&dst, 16 + 12 * 1000), 0xbf8c0f70);
        assert_eq!(get_u32(&dst, size - 4), 0xbf810000);

        let (inst, _) = decode(u64_from_u32_u32(get_u32(&dst, size - 4), 0), Isa::Gfx9).unwrap();
        assert_eq!(inst, Inst::SEndpgm);
    }

    #[test]
    fn hang_slow_needs_a_known_family() {
        let mut dst = vec![0u8; 8];
        assert!(matches!(
            load_cs_shader_hang_slow(&mut dst, 120),
            Err(Error::UnsupportedShader { kind: "hang-slow", .. })
        ));
        assert!(matches!(
            load_cs_shader_hang_slow(&mut dst, FAMILY_NV),
            Err(Error::DestinationTooSmall { .. })
        ));
    }
}
