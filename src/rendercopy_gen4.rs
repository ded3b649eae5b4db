//! Render-engine copy for GEN4, G4X and GEN5: a textured RECTLIST that
//! samples `src` and writes `dst`.
//!
//! Indirect state goes at 1088 bytes and up in the batch; commands start at
//! zero. The three vertices follow the batch end, below the state, and
//! their start index is patched into 3DPRIMITIVE once the end is known.

use tracing::debug;

use crate::error::{Error, Result};
use crate::gen4_render::*;
use crate::intel_bb::{IntelBb, IntelBuf, Tiling, I915_EXEC_DEFAULT, I915_EXEC_NO_RELOC};

const VERTEX_SIZE: u32 = 3 * 4;
const STATE_START: u32 = 1024 + 64;

const URB_VS_ENTRY_SIZE: u32 = 1;
const URB_GS_ENTRY_SIZE: u32 = 0;
const URB_CL_ENTRY_SIZE: u32 = 0;
const URB_SF_ENTRY_SIZE: u32 = 2;
const URB_CS_ENTRY_SIZE: u32 = 1;

const SF_KERNEL_NUM_GRF: u32 = 16;
const PS_KERNEL_NUM_GRF: u32 = 32;

const MAX_SURFACE_DIM: u32 = 8192;
const MAX_SURFACE_STRIDE: u32 = 128 * 1024;

static GEN4_SF_KERNEL_NOMASK: [[u32; 4]; 7] = [
    [0x00400031, 0x20c01fbd, 0x0069002c, 0x01110001],
    [0x00600001, 0x206003be, 0x00690060, 0x00000000],
    [0x00600040, 0x20e077bd, 0x00690080, 0x006940a0],
    [0x00600041, 0x202077be, 0x008d00e0, 0x000000c0],
    [0x00600040, 0x20e077bd, 0x006900a0, 0x00694060],
    [0x00600041, 0x204077be, 0x008d00e0, 0x000000c8],
    [0x00600031, 0x20001fbc, 0x008d0000, 0x8640c800],
];

static GEN5_SF_KERNEL_NOMASK: [[u32; 4]; 7] = [
    [0x00400031, 0x20c01fbd, 0x1069002c, 0x02100001],
    [0x00600001, 0x206003be, 0x00690060, 0x00000000],
    [0x00600040, 0x20e077bd, 0x00690080, 0x006940a0],
    [0x00600041, 0x202077be, 0x008d00e0, 0x000000c0],
    [0x00600040, 0x20e077bd, 0x006900a0, 0x00694060],
    [0x00600041, 0x204077be, 0x008d00e0, 0x000000c8],
    [0x00600031, 0x20001fbc, 0x648d0000, 0x8808c800],
];

static GEN4_PS_KERNEL_NOMASK_AFFINE: [[u32; 4]; 21] = [
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

static GEN5_PS_KERNEL_NOMASK_AFFINE: [[u32; 4]; 15] = [
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

fn max_vs_nr_urb_entries(ibb: &IntelBb<'_>) -> u32 {
    if ibb.platform().is_gen5() {
        256
    } else {
        32
    }
}

fn max_sf_nr_urb_entries(ibb: &IntelBb<'_>) -> u32 {
    if ibb.platform().is_gen5() {
        128
    } else {
        64
    }
}

fn urb_size(ibb: &IntelBb<'_>) -> u32 {
    let platform = ibb.platform();
    if platform.is_gen5() {
        1024
    } else if platform.is_g4x() {
        384
    } else {
        256
    }
}

fn max_sf_threads(ibb: &IntelBb<'_>) -> u32 {
    if ibb.platform().is_gen5() {
        48
    } else {
        24
    }
}

fn max_wm_threads(ibb: &IntelBb<'_>) -> u32 {
    let platform = ibb.platform();
    if platform.is_gen5() {
        72
    } else if platform.is_g4x() {
        50
    } else {
        32
    }
}

/// Reserves a zeroed, aligned state object, lets `fill` set its fields and
/// returns its offset.
fn emit_state(
    ibb: &mut IntelBb<'_>,
    layout: StateLayout,
    fill: impl FnOnce(&mut [u32]) -> Result<()>,
) -> Result<u32> {
    let offset = ibb.ptr_align(layout.align)?;
    let state = ibb.state_mut(offset, layout.dwords)?;
    state.fill(0);
    fill(state)?;
    ibb.ptr_add_return_prev_offset(layout.bytes())
}

fn bind_buf(ibb: &mut IntelBb<'_>, buf: &IntelBuf, is_dst: bool) -> Result<u32> {
    if buf.stride > MAX_SURFACE_STRIDE || buf.width > MAX_SURFACE_DIM || buf.height > MAX_SURFACE_DIM {
        return Err(Error::InvalidArgument("surface exceeds the sampler limits"));
    }
    let format = surface_format_for_bpp(buf.bpp).ok_or(Error::InvalidArgument("unsupported surface bpp"))?;
    let (read_domain, write_domain) = if is_dst {
        (I915_GEM_DOMAIN_RENDER, I915_GEM_DOMAIN_RENDER)
    } else {
        (I915_GEM_DOMAIN_SAMPLER, 0)
    };

    let offset = ibb.ptr_align(surface_state::LAYOUT.align)?;
    let address = ibb.offset_reloc(buf.handle, read_domain, write_domain, offset + 4, buf.offset)?;
    emit_state(ibb, surface_state::LAYOUT, |ss| {
        surface_state::SURFACE_TYPE.set(ss, SURFACE_2D)?;
        surface_state::SURFACE_FORMAT.set(ss, format)?;
        surface_state::DATA_RETURN_FORMAT.set(ss, SURFACERETURNFORMAT_FLOAT32)?;
        surface_state::COLOR_BLEND.set(ss, 1)?;
        surface_state::BASE_ADDR.set(ss, address as u32)?;
        surface_state::HEIGHT.set(ss, buf.height - 1)?;
        surface_state::WIDTH.set(ss, buf.width - 1)?;
        surface_state::PITCH.set(ss, buf.stride - 1)?;
        surface_state::TILED_SURFACE.set(ss, (buf.tiling != Tiling::None) as u32)?;
        surface_state::TILE_WALK.set(ss, (buf.tiling == Tiling::Y) as u32)
    })
}

/// Binding table with the destination at index 0 and the source at 1.
fn bind_surfaces(ibb: &mut IntelBb<'_>, src: &IntelBuf, dst: &IntelBuf) -> Result<u32> {
    let table = ibb.ptr_align(32)?;
    ibb.state_mut(table, 8)?.fill(0);
    ibb.ptr_add_return_prev_offset(32)?;

    let dst_state = bind_buf(ibb, dst, true)?;
    let src_state = bind_buf(ibb, src, false)?;
    ibb.patch(table, dst_state)?;
    ibb.patch(table + 4, src_state)?;
    Ok(table)
}

fn emit_sip(ibb: &mut IntelBb<'_>) -> Result<()> {
    ibb.out(GEN4_STATE_SIP | (2 - 2))?;
    ibb.out(0)
}

fn emit_base_address_reloc(ibb: &mut IntelBb<'_>) -> Result<()> {
    let (handle, batch_offset) = (ibb.handle(), ibb.batch_offset());
    ibb.emit_reloc(handle, I915_GEM_DOMAIN_INSTRUCTION, 0, BASE_ADDRESS_MODIFY, batch_offset)?;
    Ok(())
}

fn emit_state_base_address(ibb: &mut IntelBb<'_>) -> Result<()> {
    if ibb.platform().is_gen5() {
        ibb.out(GEN4_STATE_BASE_ADDRESS | (8 - 2))?;
        emit_base_address_reloc(ibb)?; // general
        emit_base_address_reloc(ibb)?; // surface
        ibb.out(0)?; // media
        emit_base_address_reloc(ibb)?; // instruction

        // upper bounds, disabled
        ibb.out(BASE_ADDRESS_MODIFY)?;
        ibb.out(0)?;
        ibb.out(BASE_ADDRESS_MODIFY)
    } else {
        ibb.out(GEN4_STATE_BASE_ADDRESS | (6 - 2))?;
        emit_base_address_reloc(ibb)?; // general
        emit_base_address_reloc(ibb)?; // surface
        ibb.out(0)?; // media

        ibb.out(BASE_ADDRESS_MODIFY)?;
        ibb.out(0)
    }
}

fn emit_pipelined_pointers(ibb: &mut IntelBb<'_>, vs: u32, sf: u32, wm: u32, cc: u32) -> Result<()> {
    for dw in [
        GEN4_3DSTATE_PIPELINED_POINTERS | (7 - 2),
        vs,
        GEN4_GS_DISABLE,
        GEN4_CLIP_DISABLE,
        sf,
        wm,
        cc,
    ] {
        ibb.out(dw)?;
    }
    Ok(())
}

fn emit_urb(ibb: &mut IntelBb<'_>) -> Result<()> {
    let vs_entries = max_vs_nr_urb_entries(ibb);
    let gs_entries = 0;
    let cl_entries = 0;
    let sf_entries = max_sf_nr_urb_entries(ibb);
    let cs_entries = 0;

    let urb_vs_end = vs_entries * URB_VS_ENTRY_SIZE;
    let urb_gs_end = urb_vs_end + gs_entries * URB_GS_ENTRY_SIZE;
    let urb_cl_end = urb_gs_end + cl_entries * URB_CL_ENTRY_SIZE;
    let urb_sf_end = urb_cl_end + sf_entries * URB_SF_ENTRY_SIZE;
    let urb_cs_end = urb_sf_end + cs_entries * URB_CS_ENTRY_SIZE;
    assert!(urb_cs_end <= urb_size(ibb), "URB partition {} overflows", urb_cs_end);

    ibb.ptr_align(16)?;
    ibb.out(
        GEN4_URB_FENCE
            | UF0_CS_REALLOC
            | UF0_SF_REALLOC
            | UF0_CLIP_REALLOC
            | UF0_GS_REALLOC
            | UF0_VS_REALLOC
            | (3 - 2),
    )?;
    ibb.out(urb_cl_end << UF1_CLIP_FENCE_SHIFT | urb_gs_end << UF1_GS_FENCE_SHIFT | urb_vs_end << UF1_VS_FENCE_SHIFT)?;
    ibb.out(urb_cs_end << UF2_CS_FENCE_SHIFT | urb_sf_end << UF2_SF_FENCE_SHIFT)?;

    ibb.out(GEN4_CS_URB_STATE | (2 - 2))?;
    ibb.out((URB_CS_ENTRY_SIZE - 1) << 4 | cs_entries)
}

fn emit_null_depth_buffer(ibb: &mut IntelBb<'_>) -> Result<()> {
    let platform = ibb.platform();
    let len = if platform.is_g4x() || platform.is_gen5() { 6 } else { 5 };
    ibb.out(GEN4_3DSTATE_DEPTH_BUFFER | (len - 2))?;
    ibb.out(
        SURFACE_NULL << GEN4_3DSTATE_DEPTH_BUFFER_TYPE_SHIFT
            | GEN4_DEPTHFORMAT_D32_FLOAT << GEN4_3DSTATE_DEPTH_BUFFER_FORMAT_SHIFT,
    )?;
    for _ in 2..len {
        ibb.out(0)?;
    }

    if platform.is_gen5() {
        ibb.out(GEN4_3DSTATE_CLEAR_PARAMS | (2 - 2))?;
        ibb.out(0)?;
    }
    Ok(())
}

fn emit_invariant(ibb: &mut IntelBb<'_>) -> Result<()> {
    ibb.out(MI_FLUSH | MI_INHIBIT_RENDER_CACHE_FLUSH)?;
    let platform = ibb.platform();
    if platform.is_gen5() || platform.is_g4x() {
        ibb.out(G4X_PIPELINE_SELECT | PIPELINE_SELECT_3D)
    } else {
        ibb.out(GEN4_PIPELINE_SELECT | PIPELINE_SELECT_3D)
    }
}

/// Passthrough VS: the unit is disabled, only its URB share is set.
fn create_vs_state(ibb: &mut IntelBb<'_>) -> Result<u32> {
    let mut nr_urb_entries = max_vs_nr_urb_entries(ibb);
    if ibb.platform().is_gen5() {
        nr_urb_entries >>= 2;
    }
    emit_state(ibb, vs_state::LAYOUT, |vs| {
        vs_state::NR_URB_ENTRIES.set(vs, nr_urb_entries)?;
        vs_state::URB_ENTRY_ALLOCATION_SIZE.set(vs, URB_VS_ENTRY_SIZE - 1)?;
        vs_state::VS_ENABLE.set(vs, 0)?;
        vs_state::VERT_CACHE_DISABLE.set(vs, 1)
    })
}

fn create_sf_state(ibb: &mut IntelBb<'_>, kernel: u32) -> Result<u32> {
    let max_threads = max_sf_threads(ibb);
    let nr_urb_entries = max_sf_nr_urb_entries(ibb);
    emit_state(ibb, sf_state::LAYOUT, |sf| {
        thread::GRF_REG_COUNT.set(sf, grf_blocks(SF_KERNEL_NUM_GRF))?;
        thread::KERNEL_START_POINTER.set(sf, kernel >> 6)?;

        thread::URB_ENTRY_READ_LENGTH.set(sf, 1)?;
        // skip the vertex header, read from dw8
        thread::URB_ENTRY_READ_OFFSET.set(sf, 1)?;
        thread::DISPATCH_GRF_START_REG.set(sf, 3)?;

        sf_state::MAX_THREADS.set(sf, max_threads - 1)?;
        sf_state::URB_ENTRY_ALLOCATION_SIZE.set(sf, URB_SF_ENTRY_SIZE - 1)?;
        sf_state::NR_URB_ENTRIES.set(sf, nr_urb_entries)?;

        sf_state::CULL_MODE.set(sf, GEN4_CULLMODE_NONE)?;
        sf_state::DEST_ORG_VBIAS.set(sf, 0x8)?;
        sf_state::DEST_ORG_HBIAS.set(sf, 0x8)
    })
}

fn create_wm_state(ibb: &mut IntelBb<'_>, kernel: u32, sampler: u32) -> Result<u32> {
    if kernel & 63 != 0 {
        return Err(Error::Misaligned {
            what: "wm kernel",
            value: kernel as u64,
            alignment: 64,
        });
    }
    if sampler & 31 != 0 {
        return Err(Error::Misaligned {
            what: "sampler state",
            value: sampler as u64,
            alignment: 32,
        });
    }
    let max_threads = max_wm_threads(ibb);
    let binding_table_entries = if ibb.platform().is_gen5() { 0 } else { 2 };
    emit_state(ibb, wm_state::LAYOUT, |wm| {
        thread::KERNEL_START_POINTER.set(wm, kernel >> 6)?;
        thread::GRF_REG_COUNT.set(wm, grf_blocks(PS_KERNEL_NUM_GRF))?;

        thread::URB_ENTRY_READ_OFFSET.set(wm, 0)?;
        thread::DISPATCH_GRF_START_REG.set(wm, 3)?;

        wm_state::SAMPLER_STATE_POINTER.set(wm, sampler >> 5)?;
        wm_state::SAMPLER_COUNT.set(wm, 1)?;

        wm_state::MAX_THREADS.set(wm, max_threads)?;
        wm_state::THREAD_DISPATCH_ENABLE.set(wm, 1)?;
        wm_state::ENABLE_16_PIX.set(wm, 1)?;
        wm_state::EARLY_DEPTH_TEST.set(wm, 1)?;

        thread::BINDING_TABLE_ENTRY_COUNT.set(wm, binding_table_entries)?;
        thread::URB_ENTRY_READ_LENGTH.set(wm, 2)
    })
}

fn emit_binding_table(ibb: &mut IntelBb<'_>, wm_table: u32) -> Result<()> {
    ibb.out(GEN4_3DSTATE_BINDING_TABLE_POINTERS | (6 - 2))?;
    ibb.out(0)?; // vs
    ibb.out(0)?; // gs
    ibb.out(0)?; // clip
    ibb.out(0)?; // sf
    ibb.out(wm_table) // ps
}

fn emit_drawing_rectangle(ibb: &mut IntelBb<'_>, dst: &IntelBuf) -> Result<()> {
    ibb.out(GEN4_3DSTATE_DRAWING_RECTANGLE | (4 - 2))?;
    ibb.out(0)?;
    ibb.out((dst.height - 1) << 16 | (dst.width - 1))?;
    ibb.out(0)
}

fn vertex_element(format: u32, offset: u32, components: [u32; 4], dest_offset: u32) -> [u32; 2] {
    [
        GEN4_VE0_VALID | format << VE0_FORMAT_SHIFT | offset << VE0_OFFSET_SHIFT,
        components[0] << VE1_VFCOMPONENT_0_SHIFT
            | components[1] << VE1_VFCOMPONENT_1_SHIFT
            | components[2] << VE1_VFCOMPONENT_2_SHIFT
            | components[3] << VE1_VFCOMPONENT_3_SHIFT
            | dest_offset << VE1_DESTINATION_ELEMENT_OFFSET_SHIFT,
    ]
}

/// GEN5 VUE: pad, position (x, y, 1.0, 1.0), texcoord (u, v, 0, 0).
/// Earlier parts drop the pad and place elements by destination offset.
fn emit_vertex_elements(ibb: &mut IntelBb<'_>) -> Result<()> {
    const SRC: u32 = GEN4_VFCOMPONENT_STORE_SRC;
    const ZERO: u32 = GEN4_VFCOMPONENT_STORE_0;
    const ONE: u32 = GEN4_VFCOMPONENT_STORE_1_FLT;

    let elements: Vec<[u32; 2]> = if ibb.platform().is_gen5() {
        vec![
            vertex_element(SURFACEFORMAT_R32G32B32A32_FLOAT, 0, [ZERO; 4], 0),
            vertex_element(SURFACEFORMAT_R16G16_SSCALED, 0, [SRC, SRC, ONE, ONE], 0),
            vertex_element(SURFACEFORMAT_R32G32_FLOAT, 4, [SRC, SRC, ZERO, ZERO], 0),
        ]
    } else {
        vec![
            vertex_element(SURFACEFORMAT_R16G16_SSCALED, 0, [SRC, SRC, ONE, ONE], 4),
            vertex_element(SURFACEFORMAT_R32G32_FLOAT, 4, [SRC, SRC, ZERO, ZERO], 8),
        ]
    };
    ibb.out(GEN4_3DSTATE_VERTEX_ELEMENTS | (elements.len() as u32 * 2 + 1 - 2))?;
    for element in elements {
        ibb.out(element[0])?;
        ibb.out(element[1])?;
    }
    Ok(())
}

fn create_cc_viewport(ibb: &mut IntelBb<'_>) -> Result<u32> {
    emit_state(ibb, cc_viewport::LAYOUT, |vp| {
        vp[cc_viewport::MIN_DEPTH] = (-1.0e35f32).to_bits();
        vp[cc_viewport::MAX_DEPTH] = 1.0e35f32.to_bits();
        Ok(())
    })
}

fn create_cc_state(ibb: &mut IntelBb<'_>, cc_vp: u32) -> Result<u32> {
    emit_state(ibb, cc_state::LAYOUT, |cc| cc_state::CC_VIEWPORT_STATE_OFFSET.set(cc, cc_vp >> 5))
}

fn create_sf_kernel(ibb: &mut IntelBb<'_>) -> Result<u32> {
    let kernel: &[[u32; 4]] = if ibb.platform().is_gen5() {
        &GEN5_SF_KERNEL_NOMASK
    } else {
        &GEN4_SF_KERNEL_NOMASK
    };
    ibb.copy_data(bytemuck::cast_slice(kernel), 64)
}

fn create_ps_kernel(ibb: &mut IntelBb<'_>) -> Result<u32> {
    let kernel: &[[u32; 4]] = if ibb.platform().is_gen5() {
        &GEN5_PS_KERNEL_NOMASK_AFFINE
    } else {
        &GEN4_PS_KERNEL_NOMASK_AFFINE
    };
    ibb.copy_data(bytemuck::cast_slice(kernel), 64)
}

fn create_sampler(ibb: &mut IntelBb<'_>, filter: SamplerFilter, extend: SamplerExtend) -> Result<u32> {
    emit_state(ibb, sampler_state::LAYOUT, |ss| {
        sampler_state::LOD_PRECLAMP.set(ss, GEN4_LOD_PRECLAMP_OGL)?;
        // legacy border colour mode gives the Render extension semantics
        sampler_state::BORDER_COLOR_MODE.set(ss, GEN4_BORDER_COLOR_MODE_LEGACY)?;

        sampler_state::MIN_FILTER.set(ss, filter.map_filter())?;
        sampler_state::MAG_FILTER.set(ss, filter.map_filter())?;

        let wrap = extend.wrap_mode();
        sampler_state::R_WRAP_MODE.set(ss, wrap)?;
        sampler_state::S_WRAP_MODE.set(ss, wrap)?;
        sampler_state::T_WRAP_MODE.set(ss, wrap)
    })
}

fn emit_vertex_buffer(ibb: &mut IntelBb<'_>) -> Result<()> {
    let (handle, batch_offset, size) = (ibb.handle(), ibb.batch_offset(), ibb.size());
    ibb.out(GEN4_3DSTATE_VERTEX_BUFFERS | (5 - 2))?;
    ibb.out(GEN4_VB0_VERTEXDATA | VERTEX_SIZE << VB0_BUFFER_PITCH_SHIFT)?;
    ibb.emit_reloc(handle, I915_GEM_DOMAIN_VERTEX, 0, 0, batch_offset)?;
    if ibb.platform().is_gen5() {
        ibb.emit_reloc(handle, I915_GEM_DOMAIN_VERTEX, 0, size - 1, batch_offset)?;
    } else {
        ibb.out(size / VERTEX_SIZE - 1)?;
    }
    ibb.out(0)
}

/// Returns the offset of the start-vertex dword, patched later.
fn emit_primitive(ibb: &mut IntelBb<'_>) -> Result<u32> {
    ibb.out(
        GEN4_3DPRIMITIVE
            | GEN4_3DPRIMITIVE_VERTEX_SEQUENTIAL
            | _3DPRIM_RECTLIST << GEN4_3DPRIMITIVE_TOPOLOGY_SHIFT
            | (6 - 2),
    )?;
    ibb.out(3)?; // vertex count
    let offset = ibb.offset();
    ibb.out(0)?; // start vertex
    ibb.out(1)?; // single instance
    ibb.out(0)?; // start instance
    ibb.out(0)?; // index buffer offset, ignored
    Ok(offset)
}

fn emit_vertex_2s(ibb: &mut IntelBb<'_>, x: u32, y: u32) -> Result<()> {
    ibb.out((y as u16 as u32) << 16 | (x as u16 as u32))
}

fn emit_vertex_normalized(ibb: &mut IntelBb<'_>, f: u32, total: u32) -> Result<()> {
    ibb.out((f as f32 / total as f32).to_bits())
}

fn check_rect(buf: &IntelBuf, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
    let fits = x.checked_add(width).map_or(false, |r| r <= buf.width)
        && y.checked_add(height).map_or(false, |b| b <= buf.height);
    if !fits {
        return Err(Error::InvalidArgument("copy rectangle leaves the surface"));
    }
    Ok(())
}

/// Copies the `width` x `height` rectangle at (`src_x`, `src_y`) of `src`
/// to (`dst_x`, `dst_y`) of `dst`, submits it on the default ring and
/// resets the batch for reuse. Both surfaces must share a bpp.
#[allow(clippy::too_many_arguments)]
pub fn gen4_render_copyfunc(
    ibb: &mut IntelBb<'_>,
    src: &IntelBuf,
    src_x: u32,
    src_y: u32,
    width: u32,
    height: u32,
    dst: &IntelBuf,
    dst_x: u32,
    dst_y: u32,
) -> Result<()> {
    if ibb.platform().gen() > 5 {
        return Err(Error::InvalidArgument("render copy covers GEN4, G4X and GEN5 only"));
    }
    if src.bpp != dst.bpp {
        return Err(Error::InvalidArgument("render copy needs matching bpp"));
    }
    check_rect(src, src_x, src_y, width, height)?;
    check_rect(dst, dst_x, dst_y, width, height)?;

    ibb.flush_render()?;

    ibb.add_intel_buf(dst, true)?;
    ibb.add_intel_buf(src, false)?;

    ibb.ptr_set(STATE_START)?;

    let vs = create_vs_state(ibb)?;

    let sf_kernel = create_sf_kernel(ibb)?;
    let sf = create_sf_state(ibb, sf_kernel)?;

    let wm_table = bind_surfaces(ibb, src, dst)?;
    let wm_kernel = create_ps_kernel(ibb)?;
    let wm_sampler = create_sampler(ibb, SamplerFilter::Nearest, SamplerExtend::None)?;
    let wm = create_wm_state(ibb, wm_kernel, wm_sampler)?;

    let cc_vp = create_cc_viewport(ibb)?;
    let cc = create_cc_state(ibb, cc_vp)?;

    ibb.ptr_set(0)?;

    emit_invariant(ibb)?;
    emit_state_base_address(ibb)?;
    emit_sip(ibb)?;
    emit_null_depth_buffer(ibb)?;

    emit_drawing_rectangle(ibb, dst)?;
    emit_binding_table(ibb, wm_table)?;
    emit_vertex_elements(ibb)?;
    emit_pipelined_pointers(ibb, vs, sf, wm, cc)?;
    emit_urb(ibb)?;

    emit_vertex_buffer(ibb)?;
    let start_vertex = emit_primitive(ibb)?;

    let batch_end = ibb.emit_bbe()?;

    // the vertices sit between the batch end and the indirect state
    let vertices = batch_end.next_multiple_of(VERTEX_SIZE);
    if vertices + 3 * VERTEX_SIZE > STATE_START {
        return Err(Error::BatchOverflow {
            offset: vertices,
            len: 3 * VERTEX_SIZE,
            size: STATE_START,
        });
    }
    ibb.ptr_set(vertices)?;
    ibb.patch(start_vertex, vertices / VERTEX_SIZE)?;

    emit_vertex_2s(ibb, dst_x + width, dst_y + height)?;
    emit_vertex_normalized(ibb, src_x + width, src.width)?;
    emit_vertex_normalized(ibb, src_y + height, src.height)?;

    emit_vertex_2s(ibb, dst_x, dst_y + height)?;
    emit_vertex_normalized(ibb, src_x, src.width)?;
    emit_vertex_normalized(ibb, src_y + height, src.height)?;

    emit_vertex_2s(ibb, dst_x, dst_y)?;
    emit_vertex_normalized(ibb, src_x, src.width)?;
    emit_vertex_normalized(ibb, src_y, src.height)?;

    // leave the cursor at a valid end so the batch can be reused
    ibb.ptr_set(batch_end)?;

    debug!(
        platform = ?ibb.platform(),
        batch_end,
        relocs = ibb.relocs().len(),
        "render copy emitted"
    );
    ibb.exec(batch_end, I915_EXEC_DEFAULT | I915_EXEC_NO_RELOC, false)?;
    ibb.reset(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel_bb::{Platform, RecordedExec, RecordingExecutor};
    use pretty_assertions::assert_eq;

    const BATCH_SIZE: u32 = 4096;

    fn copy_on(platform: Platform) -> (RecordedExec, IntelBuf, IntelBuf) {
        let exec = RecordingExecutor::default();
        let src = IntelBuf::create(&exec, 64, 32, 32, Tiling::None).unwrap();
        let dst = IntelBuf::create(&exec, 128, 64, 32, Tiling::X).unwrap();
        let mut ibb = IntelBb::new(&exec, platform, BATCH_SIZE).unwrap();
        gen4_render_copyfunc(&mut ibb, &src, 8, 4, 16, 16, &dst, 32, 40).unwrap();
        assert_eq!(ibb.offset(), 0);
        let execs = exec.execs();
        assert_eq!(execs.len(), 1);
        (execs[0].clone(), src, dst)
    }

    fn find(batch: &[u32], header: u32) -> usize {
        batch
            .iter()
            .position(|&dw| dw == header)
            .unwrap_or_else(|| panic!("no {:#x} in batch", header))
    }

    #[test]
    fn batch_opens_with_flush_and_pipeline_select() {
        let (gen4, ..) = copy_on(Platform::Gen4);
        assert_eq!(&gen4.batch[..2], &[MI_FLUSH | MI_INHIBIT_RENDER_CACHE_FLUSH, GEN4_PIPELINE_SELECT]);
        assert_eq!(gen4.batch[2], GEN4_STATE_BASE_ADDRESS | 4);

        let (gen5, ..) = copy_on(Platform::Gen5);
        assert_eq!(gen5.batch[1], G4X_PIPELINE_SELECT);
        assert_eq!(gen5.batch[2], GEN4_STATE_BASE_ADDRESS | 6);
        find(&gen5.batch, GEN4_3DSTATE_CLEAR_PARAMS);

        let (g4x, ..) = copy_on(Platform::G4x);
        assert_eq!(g4x.batch[1], G4X_PIPELINE_SELECT);
        let depth = find(&g4x.batch, GEN4_3DSTATE_DEPTH_BUFFER | 4);
        assert_eq!(g4x.batch[depth + 1], SURFACE_NULL << 29 | GEN4_DEPTHFORMAT_D32_FLOAT << 18);
    }

    #[test]
    fn relocations_cover_base_address_surfaces_and_vertices() {
        let (gen4, src, dst) = copy_on(Platform::Gen4);
        assert_eq!(gen4.relocs.len(), 5);
        let (gen5, ..) = copy_on(Platform::Gen5);
        assert_eq!(gen5.relocs.len(), 7);

        let batch_handle = gen4.objects[0].handle;
        let targets: Vec<u32> = gen4.relocs.iter().map(|r| r.target_handle).collect();
        assert_eq!(targets, vec![dst.handle, src.handle, batch_handle, batch_handle, batch_handle]);
        assert_eq!(gen4.objects.len(), 3);
        assert_eq!(gen4.objects[0].relocation_count, 5);

        // the dst surface reloc patches ss1 of its surface state
        let dst_reloc = gen4.relocs[0];
        assert_eq!(dst_reloc.write_domain, I915_GEM_DOMAIN_RENDER);
        let ss = (dst_reloc.offset as usize - 4) / 4;
        assert_eq!(gen4.batch[ss + 1] as u64, dst_reloc.presumed_offset);
        assert_eq!(surface_state::WIDTH.get(&gen4.batch[ss..]), 127);
        assert_eq!(surface_state::HEIGHT.get(&gen4.batch[ss..]), 63);
        assert_eq!(surface_state::PITCH.get(&gen4.batch[ss..]), 511);
        assert_eq!(surface_state::TILED_SURFACE.get(&gen4.batch[ss..]), 1);
        assert_eq!(surface_state::SURFACE_FORMAT.get(&gen4.batch[ss..]), SURFACEFORMAT_B8G8R8A8_UNORM);
        assert_eq!(
            gen4.flags,
            I915_EXEC_NO_RELOC | crate::intel_bb::I915_EXEC_BATCH_FIRST | crate::intel_bb::I915_EXEC_FENCE_OUT
        );
    }

    #[test]
    fn urb_fence_partitions_per_platform() {
        let header = GEN4_URB_FENCE
            | UF0_CS_REALLOC
            | UF0_SF_REALLOC
            | UF0_CLIP_REALLOC
            | UF0_GS_REALLOC
            | UF0_VS_REALLOC
            | 1;
        let (gen4, ..) = copy_on(Platform::Gen4);
        let at = find(&gen4.batch, header);
        assert_eq!(at % 4, 0, "URB_FENCE must sit on a 16-byte boundary");
        assert_eq!(gen4.batch[at + 1], 32 << 20 | 32 << 10 | 32);
        assert_eq!(gen4.batch[at + 2], 160 << 20 | 160);
        assert_eq!(&gen4.batch[at + 3..at + 5], &[GEN4_CS_URB_STATE, 0]);

        let (gen5, ..) = copy_on(Platform::Gen5);
        let at = find(&gen5.batch, header);
        assert_eq!(gen5.batch[at + 2], 512 << 20 | 512);
    }

    #[test]
    fn start_vertex_is_patched_past_the_batch_end() {
        let (gen4, src, _) = copy_on(Platform::Gen4);
        let prim = find(&gen4.batch, GEN4_3DPRIMITIVE | _3DPRIM_RECTLIST << 10 | 4);
        assert_eq!(gen4.batch[prim + 1], 3);
        let start = gen4.batch[prim + 2];
        let vertices = start * VERTEX_SIZE;
        assert!(vertices >= gen4.batch_len && vertices + 3 * VERTEX_SIZE <= STATE_START);
        let end = (gen4.batch_len / 4) as usize;
        assert!(gen4.batch[end - 2..end].contains(&MI_BATCH_BUFFER_END));

        let v = (vertices / 4) as usize;
        assert_eq!(gen4.batch[v], (40 + 16) << 16 | (32 + 16));
        assert_eq!(f32::from_bits(gen4.batch[v + 1]), 24.0 / src.width as f32);
        assert_eq!(f32::from_bits(gen4.batch[v + 2]), 20.0 / src.height as f32);
        assert_eq!(gen4.batch[v + 6], 40 << 16 | 32);
        assert_eq!(f32::from_bits(gen4.batch[v + 7]), 8.0 / 64.0);
        assert_eq!(f32::from_bits(gen4.batch[v + 8]), 4.0 / 32.0);
    }

    #[test]
    fn pipelined_pointers_reference_aligned_state() {
        let (gen4, ..) = copy_on(Platform::Gen4);
        let at = find(&gen4.batch, GEN4_3DSTATE_PIPELINED_POINTERS | 5);
        let (vs, sf, wm, cc) = (gen4.batch[at + 1], gen4.batch[at + 4], gen4.batch[at + 5], gen4.batch[at + 6]);
        for ptr in [vs, sf, wm] {
            assert!(ptr >= STATE_START && ptr % 32 == 0);
        }
        assert_eq!(cc % 64, 0);

        let wm_state = &gen4.batch[(wm / 4) as usize..];
        assert_eq!(wm_state::MAX_THREADS.get(wm_state), 32);
        assert_eq!(thread::BINDING_TABLE_ENTRY_COUNT.get(wm_state), 2);
        let sampler = wm_state::SAMPLER_STATE_POINTER.get(wm_state) << 5;
        let ss = &gen4.batch[(sampler / 4) as usize..];
        assert_eq!(sampler_state::S_WRAP_MODE.get(ss), GEN4_TEXCOORDMODE_CLAMP_BORDER);

        let cc_state = &gen4.batch[(cc / 4) as usize..];
        let vp = cc_state::CC_VIEWPORT_STATE_OFFSET.get(cc_state) << 5;
        assert_eq!(f32::from_bits(gen4.batch[(vp / 4) as usize + 1]), 1.0e35);

        let sf_state = &gen4.batch[(sf / 4) as usize..];
        let kernel = thread::KERNEL_START_POINTER.get(sf_state) << 6;
        assert_eq!(&gen4.batch[(kernel / 4) as usize..(kernel / 4) as usize + 4], &GEN4_SF_KERNEL_NOMASK[0]);
    }

    #[test]
    fn mismatched_or_oversized_copies_are_refused() {
        let exec = RecordingExecutor::default();
        let src = IntelBuf::create(&exec, 64, 32, 16, Tiling::None).unwrap();
        let dst = IntelBuf::create(&exec, 64, 32, 32, Tiling::None).unwrap();
        let mut ibb = IntelBb::new(&exec, Platform::Gen4, BATCH_SIZE).unwrap();
        assert!(gen4_render_copyfunc(&mut ibb, &src, 0, 0, 8, 8, &dst, 0, 0).is_err());

        let src = IntelBuf::create(&exec, 64, 32, 32, Tiling::None).unwrap();
        assert!(gen4_render_copyfunc(&mut ibb, &src, 60, 0, 8, 8, &dst, 0, 0).is_err());
        assert!(exec.execs().is_empty());

        let mut gen9 = IntelBb::new(&exec, Platform::Gen(9), BATCH_SIZE).unwrap();
        assert!(gen4_render_copyfunc(&mut gen9, &src, 0, 0, 8, 8, &dst, 0, 0).is_err());
    }

    #[test]
    fn batch_is_reusable_after_a_copy() {
        let exec = RecordingExecutor::default();
        let src = IntelBuf::create(&exec, 32, 32, 8, Tiling::Y).unwrap();
        let dst = IntelBuf::create(&exec, 32, 32, 8, Tiling::None).unwrap();
        let mut ibb = IntelBb::new(&exec, Platform::Gen5, BATCH_SIZE).unwrap();
        gen4_render_copyfunc(&mut ibb, &src, 0, 0, 32, 32, &dst, 0, 0).unwrap();
        gen4_render_copyfunc(&mut ibb, &src, 0, 0, 16, 16, &dst, 16, 16).unwrap();
        let execs = exec.execs();
        assert_eq!(execs.len(), 2);
        assert_ne!(execs[0].objects[0].handle, execs[1].objects[0].handle);
        // the surfaces kept their presumed addresses across batches
        assert_eq!(execs[0].objects[1..], execs[1].objects[1..]);
        ibb.destroy().unwrap();
        assert_eq!(exec.live_handles(), vec![src.handle, dst.handle]);
    }
}
