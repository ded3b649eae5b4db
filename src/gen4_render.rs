//! GEN4/G4X/GEN5 3D pipeline commands and the layout of the indirect state
//! objects they point at.
//!
//! State objects are built as plain dword arrays. Every bit field is
//! described by a [`Field`] (dword index, shift and width) so a value that
//! does not fit is reported instead of silently spilling into its
//! neighbour.

use crate::error::{Error, Result};

const fn gen4_3d(pipeline: u32, opcode: u32, subopcode: u32) -> u32 {
    (3 << 29) | (pipeline << 27) | (opcode << 24) | (subopcode << 16)
}

pub const MI_NOOP: u32 = 0;
pub const MI_FLUSH: u32 = 0x04 << 23;
pub const MI_INHIBIT_RENDER_CACHE_FLUSH: u32 = 1 << 2;
pub const MI_BATCH_BUFFER_END: u32 = 0x0a << 23;

pub const GEN4_URB_FENCE: u32 = gen4_3d(0, 0, 0);
pub const GEN4_CS_URB_STATE: u32 = gen4_3d(0, 0, 1);
pub const GEN4_STATE_BASE_ADDRESS: u32 = gen4_3d(0, 1, 1);
pub const GEN4_STATE_SIP: u32 = gen4_3d(0, 1, 2);
pub const GEN4_PIPELINE_SELECT: u32 = gen4_3d(0, 1, 4);
pub const G4X_PIPELINE_SELECT: u32 = gen4_3d(1, 1, 4);
pub const GEN4_3DSTATE_PIPELINED_POINTERS: u32 = gen4_3d(3, 0, 0);
pub const GEN4_3DSTATE_BINDING_TABLE_POINTERS: u32 = gen4_3d(3, 0, 1);
pub const GEN4_3DSTATE_VERTEX_BUFFERS: u32 = gen4_3d(3, 0, 8);
pub const GEN4_3DSTATE_VERTEX_ELEMENTS: u32 = gen4_3d(3, 0, 9);
pub const GEN4_3DSTATE_DRAWING_RECTANGLE: u32 = gen4_3d(3, 1, 0);
pub const GEN4_3DSTATE_DEPTH_BUFFER: u32 = gen4_3d(3, 1, 5);
pub const GEN4_3DSTATE_CLEAR_PARAMS: u32 = gen4_3d(3, 1, 0x10);
pub const GEN4_3DPRIMITIVE: u32 = gen4_3d(3, 3, 0);

pub const PIPELINE_SELECT_3D: u32 = 0;
pub const PIPELINE_SELECT_MEDIA: u32 = 1;

pub const BASE_ADDRESS_MODIFY: u32 = 1;
pub const GEN4_GS_DISABLE: u32 = 0;
pub const GEN4_CLIP_DISABLE: u32 = 0;

pub const UF0_CS_REALLOC: u32 = 1 << 13;
pub const UF0_VFE_REALLOC: u32 = 1 << 12;
pub const UF0_SF_REALLOC: u32 = 1 << 11;
pub const UF0_CLIP_REALLOC: u32 = 1 << 10;
pub const UF0_GS_REALLOC: u32 = 1 << 9;
pub const UF0_VS_REALLOC: u32 = 1 << 8;
pub const UF1_CLIP_FENCE_SHIFT: u32 = 20;
pub const UF1_GS_FENCE_SHIFT: u32 = 10;
pub const UF1_VS_FENCE_SHIFT: u32 = 0;
pub const UF2_CS_FENCE_SHIFT: u32 = 20;
pub const UF2_VFE_FENCE_SHIFT: u32 = 10;
pub const UF2_SF_FENCE_SHIFT: u32 = 0;

pub const GEN4_3DSTATE_DEPTH_BUFFER_TYPE_SHIFT: u32 = 29;
pub const GEN4_3DSTATE_DEPTH_BUFFER_FORMAT_SHIFT: u32 = 18;
pub const GEN4_DEPTHFORMAT_D32_FLOAT: u32 = 1;

pub const SURFACE_1D: u32 = 0;
pub const SURFACE_2D: u32 = 1;
pub const SURFACE_NULL: u32 = 7;

pub const GEN4_VE0_VERTEX_BUFFER_INDEX_SHIFT: u32 = 27;
pub const GEN4_VE0_VALID: u32 = 1 << 26;
pub const VE0_FORMAT_SHIFT: u32 = 16;
pub const VE0_OFFSET_SHIFT: u32 = 0;
pub const VE1_VFCOMPONENT_0_SHIFT: u32 = 28;
pub const VE1_VFCOMPONENT_1_SHIFT: u32 = 24;
pub const VE1_VFCOMPONENT_2_SHIFT: u32 = 20;
pub const VE1_VFCOMPONENT_3_SHIFT: u32 = 16;
pub const VE1_DESTINATION_ELEMENT_OFFSET_SHIFT: u32 = 0;

pub const GEN4_VFCOMPONENT_NOSTORE: u32 = 0;
pub const GEN4_VFCOMPONENT_STORE_SRC: u32 = 1;
pub const GEN4_VFCOMPONENT_STORE_0: u32 = 2;
pub const GEN4_VFCOMPONENT_STORE_1_FLT: u32 = 3;

pub const GEN4_VB0_BUFFER_INDEX_SHIFT: u32 = 27;
pub const GEN4_VB0_VERTEXDATA: u32 = 0;
pub const VB0_BUFFER_PITCH_SHIFT: u32 = 0;

pub const GEN4_3DPRIMITIVE_VERTEX_SEQUENTIAL: u32 = 0;
pub const GEN4_3DPRIMITIVE_TOPOLOGY_SHIFT: u32 = 10;
pub const _3DPRIM_RECTLIST: u32 = 0x0f;

pub const SURFACEFORMAT_R32G32B32A32_FLOAT: u32 = 0x000;
pub const SURFACEFORMAT_R16G16B16A16_FLOAT: u32 = 0x084;
pub const SURFACEFORMAT_R32G32_FLOAT: u32 = 0x085;
pub const SURFACEFORMAT_B8G8R8A8_UNORM: u32 = 0x0c0;
pub const SURFACEFORMAT_R16G16_SSCALED: u32 = 0x0f6;
pub const SURFACEFORMAT_R8G8_UNORM: u32 = 0x106;
pub const SURFACEFORMAT_R8_UNORM: u32 = 0x140;
pub const SURFACERETURNFORMAT_FLOAT32: u32 = 0;

pub const GEN4_LOD_PRECLAMP_OGL: u32 = 1;
pub const GEN4_BORDER_COLOR_MODE_LEGACY: u32 = 1;
pub const GEN4_MAPFILTER_NEAREST: u32 = 0;
pub const GEN4_MAPFILTER_LINEAR: u32 = 1;
pub const GEN4_TEXCOORDMODE_WRAP: u32 = 0;
pub const GEN4_TEXCOORDMODE_MIRROR: u32 = 1;
pub const GEN4_TEXCOORDMODE_CLAMP: u32 = 2;
pub const GEN4_TEXCOORDMODE_CLAMP_BORDER: u32 = 4;
pub const GEN4_CULLMODE_NONE: u32 = 1;

/// GEM read/write domains carried by relocations.
pub const I915_GEM_DOMAIN_RENDER: u32 = 0x02;
pub const I915_GEM_DOMAIN_SAMPLER: u32 = 0x04;
pub const I915_GEM_DOMAIN_INSTRUCTION: u32 = 0x10;
pub const I915_GEM_DOMAIN_VERTEX: u32 = 0x20;

/// Register blocks of 16 GRFs, minus one, as the thread state encodes them.
pub const fn grf_blocks(nreg: u32) -> u32 {
    (nreg + 15) / 16 - 1
}

/// One bit field of a state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub dword: usize,
    pub shift: u32,
    pub width: u32,
}

impl Field {
    pub const fn new(name: &'static str, dword: usize, shift: u32, width: u32) -> Self {
        Field {
            name,
            dword,
            shift,
            width,
        }
    }

    fn max(&self) -> u32 {
        if self.width == 32 {
            u32::MAX
        } else {
            (1 << self.width) - 1
        }
    }

    /// Stores `value` into the field, leaving the other bits of the dword
    /// alone.
    pub fn set(&self, state: &mut [u32], value: u32) -> Result<()> {
        if value > self.max() {
            return Err(Error::FieldOverflow {
                field: self.name,
                value,
                width: self.width,
            });
        }
        let slot = state.get_mut(self.dword).ok_or(Error::InvalidArgument("field outside its state object"))?;
        let mask = self.max() << self.shift;
        *slot = (*slot & !mask) | (value << self.shift);
        Ok(())
    }

    pub fn get(&self, state: &[u32]) -> u32 {
        state.get(self.dword).map_or(0, |dw| (dw >> self.shift) & self.max())
    }
}

/// An indirect state object: its size and the alignment the hardware
/// pointer to it requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub name: &'static str,
    pub dwords: usize,
    pub align: u32,
}

impl StateLayout {
    pub const fn bytes(&self) -> u32 {
        (self.dwords * 4) as u32
    }
}

/// Thread control dwords shared by the VS, SF and WM units.
pub mod thread {
    use super::Field;

    pub const GRF_REG_COUNT: Field = Field::new("thread0.grf_reg_count", 0, 1, 3);
    pub const KERNEL_START_POINTER: Field = Field::new("thread0.kernel_start_pointer", 0, 6, 26);
    pub const BINDING_TABLE_ENTRY_COUNT: Field = Field::new("thread1.binding_table_entry_count", 1, 18, 8);
    pub const DISPATCH_GRF_START_REG: Field = Field::new("thread3.dispatch_grf_start_reg", 3, 0, 4);
    pub const URB_ENTRY_READ_OFFSET: Field = Field::new("thread3.urb_entry_read_offset", 3, 4, 6);
    pub const URB_ENTRY_READ_LENGTH: Field = Field::new("thread3.urb_entry_read_length", 3, 11, 6);
}

pub mod surface_state {
    use super::{Field, StateLayout};

    pub const LAYOUT: StateLayout = StateLayout {
        name: "surface_state",
        dwords: 6,
        align: 32,
    };
    pub const COLOR_BLEND: Field = Field::new("ss0.color_blend", 0, 13, 1);
    pub const SURFACE_FORMAT: Field = Field::new("ss0.surface_format", 0, 18, 9);
    pub const DATA_RETURN_FORMAT: Field = Field::new("ss0.data_return_format", 0, 27, 1);
    pub const SURFACE_TYPE: Field = Field::new("ss0.surface_type", 0, 29, 3);
    pub const BASE_ADDR: Field = Field::new("ss1.base_addr", 1, 0, 32);
    pub const WIDTH: Field = Field::new("ss2.width", 2, 6, 13);
    pub const HEIGHT: Field = Field::new("ss2.height", 2, 19, 13);
    pub const TILE_WALK: Field = Field::new("ss3.tile_walk", 3, 0, 1);
    pub const TILED_SURFACE: Field = Field::new("ss3.tiled_surface", 3, 1, 1);
    pub const PITCH: Field = Field::new("ss3.pitch", 3, 3, 18);
}

pub mod vs_state {
    use super::{Field, StateLayout};

    pub const LAYOUT: StateLayout = StateLayout {
        name: "vs_state",
        dwords: 7,
        align: 32,
    };
    pub const NR_URB_ENTRIES: Field = Field::new("vs4.nr_urb_entries", 4, 11, 8);
    pub const URB_ENTRY_ALLOCATION_SIZE: Field = Field::new("vs4.urb_entry_allocation_size", 4, 19, 5);
    pub const VS_ENABLE: Field = Field::new("vs6.vs_enable", 6, 0, 1);
    pub const VERT_CACHE_DISABLE: Field = Field::new("vs6.vert_cache_disable", 6, 1, 1);
}

pub mod sf_state {
    use super::{Field, StateLayout};

    pub const LAYOUT: StateLayout = StateLayout {
        name: "sf_state",
        dwords: 8,
        align: 32,
    };
    /// Eight bits: GEN5 runs 128 SF entries.
    pub const NR_URB_ENTRIES: Field = Field::new("sf4.nr_urb_entries", 4, 11, 8);
    pub const URB_ENTRY_ALLOCATION_SIZE: Field = Field::new("sf4.urb_entry_allocation_size", 4, 19, 5);
    pub const MAX_THREADS: Field = Field::new("sf4.max_threads", 4, 25, 6);
    pub const DEST_ORG_VBIAS: Field = Field::new("sf6.dest_org_vbias", 6, 9, 4);
    pub const DEST_ORG_HBIAS: Field = Field::new("sf6.dest_org_hbias", 6, 13, 4);
    pub const CULL_MODE: Field = Field::new("sf6.cull_mode", 6, 29, 2);
}

pub mod wm_state {
    use super::{Field, StateLayout};

    /// GEN5 appends three dwords of extra kernel pointers.
    pub const LAYOUT: StateLayout = StateLayout {
        name: "wm_state",
        dwords: 11,
        align: 32,
    };
    pub const SAMPLER_COUNT: Field = Field::new("wm4.sampler_count", 4, 2, 3);
    pub const SAMPLER_STATE_POINTER: Field = Field::new("wm4.sampler_state_pointer", 4, 5, 27);
    pub const ENABLE_16_PIX: Field = Field::new("wm5.enable_16_pix", 5, 1, 1);
    pub const EARLY_DEPTH_TEST: Field = Field::new("wm5.early_depth_test", 5, 18, 1);
    pub const THREAD_DISPATCH_ENABLE: Field = Field::new("wm5.thread_dispatch_enable", 5, 19, 1);
    pub const MAX_THREADS: Field = Field::new("wm5.max_threads", 5, 25, 7);
}

pub mod sampler_state {
    use super::{Field, StateLayout};

    pub const LAYOUT: StateLayout = StateLayout {
        name: "sampler_state",
        dwords: 4,
        align: 32,
    };
    pub const MIN_FILTER: Field = Field::new("ss0.min_filter", 0, 14, 3);
    pub const MAG_FILTER: Field = Field::new("ss0.mag_filter", 0, 17, 3);
    pub const LOD_PRECLAMP: Field = Field::new("ss0.lod_preclamp", 0, 28, 1);
    pub const BORDER_COLOR_MODE: Field = Field::new("ss0.border_color_mode", 0, 29, 1);
    pub const R_WRAP_MODE: Field = Field::new("ss1.r_wrap_mode", 1, 0, 3);
    pub const T_WRAP_MODE: Field = Field::new("ss1.t_wrap_mode", 1, 3, 3);
    pub const S_WRAP_MODE: Field = Field::new("ss1.s_wrap_mode", 1, 6, 3);
}

pub mod cc_viewport {
    use super::StateLayout;

    /// Two floats: min and max depth.
    pub const LAYOUT: StateLayout = StateLayout {
        name: "cc_viewport",
        dwords: 2,
        align: 32,
    };
    pub const MIN_DEPTH: usize = 0;
    pub const MAX_DEPTH: usize = 1;
}

pub mod cc_state {
    use super::{Field, StateLayout};

    pub const LAYOUT: StateLayout = StateLayout {
        name: "color_calc_state",
        dwords: 8,
        align: 64,
    };
    /// Holds the viewport offset in 32-byte units.
    pub const CC_VIEWPORT_STATE_OFFSET: Field = Field::new("cc4.cc_viewport_state_offset", 4, 5, 27);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerFilter {
    Nearest,
    Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerExtend {
    None,
    Repeat,
    Pad,
    Reflect,
}

impl SamplerFilter {
    pub fn map_filter(self) -> u32 {
        match self {
            SamplerFilter::Nearest => GEN4_MAPFILTER_NEAREST,
            SamplerFilter::Bilinear => GEN4_MAPFILTER_LINEAR,
        }
    }
}

impl SamplerExtend {
    pub fn wrap_mode(self) -> u32 {
        match self {
            SamplerExtend::None => GEN4_TEXCOORDMODE_CLAMP_BORDER,
            SamplerExtend::Repeat => GEN4_TEXCOORDMODE_WRAP,
            SamplerExtend::Pad => GEN4_TEXCOORDMODE_CLAMP,
            SamplerExtend::Reflect => GEN4_TEXCOORDMODE_MIRROR,
        }
    }
}

/// Surface format for a given bits-per-pixel.
pub fn surface_format_for_bpp(bpp: u32) -> Option<u32> {
    match bpp {
        8 => Some(SURFACEFORMAT_R8_UNORM),
        16 => Some(SURFACEFORMAT_R8G8_UNORM),
        32 => Some(SURFACEFORMAT_B8G8R8A8_UNORM),
        64 => Some(SURFACEFORMAT_R16G16B16A16_FLOAT),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_opcodes() {
        assert_eq!(GEN4_URB_FENCE, 0x6000_0000);
        assert_eq!(GEN4_STATE_BASE_ADDRESS, 0x6101_0000);
        assert_eq!(G4X_PIPELINE_SELECT, 0x6904_0000);
        assert_eq!(GEN4_3DSTATE_PIPELINED_POINTERS, 0x7800_0000);
        assert_eq!(GEN4_3DSTATE_CLEAR_PARAMS, 0x7910_0000);
        assert_eq!(GEN4_3DPRIMITIVE, 0x7b00_0000);
        assert_eq!(MI_BATCH_BUFFER_END, 0x0500_0000);
    }

    #[test]
    fn fields_pack_without_touching_neighbours() {
        let mut ss = [0u32; surface_state::LAYOUT.dwords];
        surface_state::SURFACE_TYPE.set(&mut ss, SURFACE_2D).unwrap();
        surface_state::SURFACE_FORMAT.set(&mut ss, SURFACEFORMAT_B8G8R8A8_UNORM).unwrap();
        surface_state::COLOR_BLEND.set(&mut ss, 1).unwrap();
        assert_eq!(ss[0], (1 << 29) | (0xc0 << 18) | (1 << 13));

        surface_state::SURFACE_FORMAT.set(&mut ss, SURFACEFORMAT_R8_UNORM).unwrap();
        assert_eq!(surface_state::SURFACE_TYPE.get(&ss), SURFACE_2D);
        assert_eq!(surface_state::SURFACE_FORMAT.get(&ss), SURFACEFORMAT_R8_UNORM);
        surface_state::BASE_ADDR.set(&mut ss, 0xffff_f000).unwrap();
        assert_eq!(ss[1], 0xffff_f000);
    }

    #[test]
    fn oversized_values_are_rejected() {
        let mut ss = [0u32; surface_state::LAYOUT.dwords];
        let err = surface_state::WIDTH.set(&mut ss, 1 << 13).unwrap_err();
        assert!(matches!(
            err,
            Error::FieldOverflow {
                field: "ss2.width",
                width: 13,
                ..
            }
        ));
        assert_eq!(ss, [0; 6]);
    }

    #[test]
    fn grf_block_encoding() {
        assert_eq!(grf_blocks(16), 0);
        assert_eq!(grf_blocks(32), 1);
        assert_eq!(grf_blocks(17), 1);
    }
}
