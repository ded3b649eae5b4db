//! Compute register table shared by the GFX8+ IP blocks.
//!
//! Offsets are absolute MMIO dword offsets. SET_SH_REG packets carry them
//! relative to [`PACKET3_SET_SH_REG_START`].

use num_traits::FromPrimitive;

use crate::pm4::{PACKET3_SET_SH_REG_START, PACKET3_SET_UCONFIG_REG_START};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum GeneralReg {
    ComputeDispatchInitiator = 0,
    ComputeDimX,
    ComputeDimY,
    ComputeDimZ,
    ComputeStartX,
    ComputeStartY,
    ComputeStartZ,
    ComputeNumThreadX,
    ComputeNumThreadY,
    ComputeNumThreadZ,
    ComputePgmLo,
    ComputePgmHi,
    ComputePgmRsrc1,
    ComputePgmRsrc2,
    ComputeResourceLimits,
    ComputeStaticThreadMgmtSe0,
    ComputeStaticThreadMgmtSe1,
    ComputeTmpringSize,
    ComputeStaticThreadMgmtSe2,
    ComputeStaticThreadMgmtSe3,
    ComputeReqCtrl,
    ComputePgmRsrc3,
    ComputeShaderChksum,
    ComputeUserData0,
    ComputeUserData1,
    ComputeUserData2,
    ComputeUserData3,
    ComputeUserData4,
    ComputeUserData5,
    ComputeUserData6,
    ComputeUserData7,
    ComputeUserData8,
    ComputeUserData9,
    ComputeUserData10,
    ComputeUserData11,
    ComputeUserData12,
    ComputeUserData13,
    ComputeUserData14,
    ComputeUserData15,
}

#[derive(Debug, Clone, Copy)]
pub struct RegEntry {
    pub reg: GeneralReg,
    pub name: &'static str,
    pub offset: u32,
}

const fn entry(reg: GeneralReg, name: &'static str, offset: u32) -> RegEntry {
    RegEntry { reg, name, offset }
}

pub static GFX_V8_0_REG_TABLE: [RegEntry; 39] = [
    entry(GeneralReg::ComputeDispatchInitiator, "COMPUTE_DISPATCH_INITIATOR", 0x2e00),
    entry(GeneralReg::ComputeDimX, "COMPUTE_DIM_X", 0x2e01),
    entry(GeneralReg::ComputeDimY, "COMPUTE_DIM_Y", 0x2e02),
    entry(GeneralReg::ComputeDimZ, "COMPUTE_DIM_Z", 0x2e03),
    entry(GeneralReg::ComputeStartX, "COMPUTE_START_X", 0x2e04),
    entry(GeneralReg::ComputeStartY, "COMPUTE_START_Y", 0x2e05),
    entry(GeneralReg::ComputeStartZ, "COMPUTE_START_Z", 0x2e06),
    entry(GeneralReg::ComputeNumThreadX, "COMPUTE_NUM_THREAD_X", 0x2e07),
    entry(GeneralReg::ComputeNumThreadY, "COMPUTE_NUM_THREAD_Y", 0x2e08),
    entry(GeneralReg::ComputeNumThreadZ, "COMPUTE_NUM_THREAD_Z", 0x2e09),
    entry(GeneralReg::ComputePgmLo, "COMPUTE_PGM_LO", 0x2e0c),
    entry(GeneralReg::ComputePgmHi, "COMPUTE_PGM_HI", 0x2e0d),
    entry(GeneralReg::ComputePgmRsrc1, "COMPUTE_PGM_RSRC1", 0x2e12),
    entry(GeneralReg::ComputePgmRsrc2, "COMPUTE_PGM_RSRC2", 0x2e13),
    entry(GeneralReg::ComputeResourceLimits, "COMPUTE_RESOURCE_LIMITS", 0x2e15),
    entry(GeneralReg::ComputeStaticThreadMgmtSe0, "COMPUTE_STATIC_THREAD_MGMT_SE0", 0x2e16),
    entry(GeneralReg::ComputeStaticThreadMgmtSe1, "COMPUTE_STATIC_THREAD_MGMT_SE1", 0x2e17),
    entry(GeneralReg::ComputeTmpringSize, "COMPUTE_TMPRING_SIZE", 0x2e18),
    entry(GeneralReg::ComputeStaticThreadMgmtSe2, "COMPUTE_STATIC_THREAD_MGMT_SE2", 0x2e19),
    entry(GeneralReg::ComputeStaticThreadMgmtSe3, "COMPUTE_STATIC_THREAD_MGMT_SE3", 0x2e1a),
    entry(GeneralReg::ComputeReqCtrl, "COMPUTE_REQ_CTRL", 0x2e22),
    entry(GeneralReg::ComputePgmRsrc3, "COMPUTE_PGM_RSRC3", 0x2e28),
    entry(GeneralReg::ComputeShaderChksum, "COMPUTE_SHADER_CHKSUM", 0x2e2a),
    entry(GeneralReg::ComputeUserData0, "COMPUTE_USER_DATA_0", 0x2e40),
    entry(GeneralReg::ComputeUserData1, "COMPUTE_USER_DATA_1", 0x2e41),
    entry(GeneralReg::ComputeUserData2, "COMPUTE_USER_DATA_2", 0x2e42),
    entry(GeneralReg::ComputeUserData3, "COMPUTE_USER_DATA_3", 0x2e43),
    entry(GeneralReg::ComputeUserData4, "COMPUTE_USER_DATA_4", 0x2e44),
    entry(GeneralReg::ComputeUserData5, "COMPUTE_USER_DATA_5", 0x2e45),
    entry(GeneralReg::ComputeUserData6, "COMPUTE_USER_DATA_6", 0x2e46),
    entry(GeneralReg::ComputeUserData7, "COMPUTE_USER_DATA_7", 0x2e47),
    entry(GeneralReg::ComputeUserData8, "COMPUTE_USER_DATA_8", 0x2e48),
    entry(GeneralReg::ComputeUserData9, "COMPUTE_USER_DATA_9", 0x2e49),
    entry(GeneralReg::ComputeUserData10, "COMPUTE_USER_DATA_10", 0x2e4a),
    entry(GeneralReg::ComputeUserData11, "COMPUTE_USER_DATA_11", 0x2e4b),
    entry(GeneralReg::ComputeUserData12, "COMPUTE_USER_DATA_12", 0x2e4c),
    entry(GeneralReg::ComputeUserData13, "COMPUTE_USER_DATA_13", 0x2e4d),
    entry(GeneralReg::ComputeUserData14, "COMPUTE_USER_DATA_14", 0x2e4e),
    entry(GeneralReg::ComputeUserData15, "COMPUTE_USER_DATA_15", 0x2e4f),
];

/// mmCP_COHER_START_DELAY, relative to the uconfig base.
pub const CP_COHER_START_DELAY: u32 = 0xc07b - PACKET3_SET_UCONFIG_REG_START;

/// Privileged VM register, used to provoke an illegal register access.
pub const MM_VM_CONTEXT0_PAGE_TABLE_BASE_ADDR: u32 = 0x54f;

/// Looks `reg` up in `table` and returns its SET_SH_REG-relative offset.
///
/// # Panics
///
/// Panics if the entry at the enum's index describes another register,
/// which means the table and the enum drifted apart.
pub fn lookup_sh_offset(table: &[RegEntry], reg: GeneralReg) -> u32 {
    let entry = &table[reg as usize];
    assert_eq!(
        entry.reg, reg,
        "register table out of sync at {}: holds {}",
        reg as usize, entry.name
    );
    entry.offset - PACKET3_SET_SH_REG_START
}

pub fn gfx_v8_0_get_reg_offset(reg: GeneralReg) -> u32 {
    lookup_sh_offset(&GFX_V8_0_REG_TABLE, reg)
}

/// Reverse lookup used when decoding SET_SH_REG payloads.
pub fn reg_from_sh_offset(offset: u32) -> Option<GeneralReg> {
    GFX_V8_0_REG_TABLE
        .iter()
        .find(|e| e.offset - PACKET3_SET_SH_REG_START == offset)
        .map(|e| e.reg)
}

pub fn user_data_reg(index: u32) -> Option<GeneralReg> {
    if index >= 16 {
        return None;
    }
    GeneralReg::from_u32(GeneralReg::ComputeUserData0 as u32 + index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entry_sits_at_its_enum_index() {
        for (i, e) in GFX_V8_0_REG_TABLE.iter().enumerate() {
            assert_eq!(e.reg as usize, i, "{}", e.name);
            assert_eq!(GeneralReg::from_usize(i), Some(e.reg));
            assert_eq!(gfx_v8_0_get_reg_offset(e.reg), e.offset - 0x2c00);
        }
    }

    #[test]
    fn offsets_used_by_dispatch() {
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeStartX), 0x204);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputePgmLo), 0x20c);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeResourceLimits), 0x215);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeStaticThreadMgmtSe0), 0x216);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeTmpringSize), 0x218);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeStaticThreadMgmtSe2), 0x219);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeReqCtrl), 0x222);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputePgmRsrc3), 0x228);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeShaderChksum), 0x22a);
        assert_eq!(gfx_v8_0_get_reg_offset(GeneralReg::ComputeUserData0), 0x240);
        assert_eq!(CP_COHER_START_DELAY, 0x7b);
        assert_eq!(reg_from_sh_offset(0x213), Some(GeneralReg::ComputePgmRsrc2));
        assert_eq!(user_data_reg(4), Some(GeneralReg::ComputeUserData4));
        assert_eq!(user_data_reg(16), None);
    }

    #[test]
    #[should_panic(expected = "register table out of sync")]
    fn drifted_table_is_fatal() {
        let mut table = GFX_V8_0_REG_TABLE;
        table.swap(3, 4);
        lookup_sh_offset(&table, GeneralReg::ComputeStartX);
    }
}
