//! AMD chip identification from the (family, external revision) pair the
//! kernel reports.

pub const FAMILY_SI: u32 = 110;
pub const FAMILY_CI: u32 = 120;
pub const FAMILY_KV: u32 = 125;
pub const FAMILY_VI: u32 = 130;
pub const FAMILY_CZ: u32 = 135;
pub const FAMILY_AI: u32 = 141;
pub const FAMILY_RV: u32 = 142;
pub const FAMILY_NV: u32 = 143;
pub const FAMILY_VGH: u32 = 144;
pub const FAMILY_YC: u32 = 146;

/// Chips in release order; chip class thresholds compare against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Chip {
    Tahiti,
    Pitcairn,
    Verde,
    Oland,
    Hainan,
    Bonaire,
    Kaveri,
    Kabini,
    Hawaii,
    Tonga,
    Iceland,
    Carrizo,
    Fiji,
    Stoney,
    Polaris10,
    Polaris11,
    Polaris12,
    VegaM,
    Vega10,
    Raven,
    Vega12,
    Vega20,
    Raven2,
    Renoir,
    Arcturus,
    Aldebaran,
    Navi10,
    Navi12,
    Navi14,
    SiennaCichlid,
    NavyFlounder,
    VanGogh,
    DimgreyCavefish,
    BeigeGoby,
    YellowCarp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChipClass {
    Gfx6,
    Gfx7,
    Gfx8,
    Gfx9,
    Gfx10,
    Gfx10_3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub name: &'static str,
    pub chip: Chip,
    pub class: ChipClass,
    pub family_id: u32,
}

struct RevRange {
    chip: Chip,
    name: &'static str,
    start: u32,
    end: u32,
}

const fn rev(chip: Chip, name: &'static str, start: u32, end: u32) -> RevRange {
    RevRange {
        chip,
        name,
        start,
        end,
    }
}

// External revision windows, [start, end).
static SI_REVS: &[RevRange] = &[
    rev(Chip::Tahiti, "TAHITI", 0x05, 0x15),
    rev(Chip::Pitcairn, "PITCAIRN", 0x15, 0x29),
    rev(Chip::Verde, "VERDE", 0x29, 0x3c),
    rev(Chip::Oland, "OLAND", 0x3c, 0x46),
    rev(Chip::Hainan, "HAINAN", 0x46, 0xff),
];
static CI_REVS: &[RevRange] = &[
    rev(Chip::Bonaire, "BONAIRE", 0x14, 0x28),
    rev(Chip::Hawaii, "HAWAII", 0x28, 0xff),
];
static KV_REVS: &[RevRange] = &[
    rev(Chip::Kaveri, "KAVERI", 0x01, 0x81),
    rev(Chip::Kabini, "KABINI", 0x81, 0xff),
];
static VI_REVS: &[RevRange] = &[
    rev(Chip::Iceland, "ICELAND", 0x01, 0x14),
    rev(Chip::Tonga, "TONGA", 0x14, 0x3c),
    rev(Chip::Fiji, "FIJI", 0x3c, 0x50),
    rev(Chip::Polaris10, "POLARIS10", 0x50, 0x5a),
    rev(Chip::Polaris11, "POLARIS11", 0x5a, 0x64),
    rev(Chip::Polaris12, "POLARIS12", 0x64, 0x6e),
    rev(Chip::VegaM, "VEGAM", 0x6e, 0xff),
];
static CZ_REVS: &[RevRange] = &[
    rev(Chip::Carrizo, "CARRIZO", 0x01, 0x61),
    rev(Chip::Stoney, "STONEY", 0x61, 0xff),
];
static AI_REVS: &[RevRange] = &[
    rev(Chip::Vega10, "VEGA10", 0x01, 0x14),
    rev(Chip::Vega12, "VEGA12", 0x14, 0x28),
    rev(Chip::Vega20, "VEGA20", 0x28, 0x32),
    rev(Chip::Arcturus, "ARCTURUS", 0x32, 0x3c),
    rev(Chip::Aldebaran, "ALDEBARAN", 0x3c, 0xff),
];
static RV_REVS: &[RevRange] = &[
    rev(Chip::Raven, "RAVEN", 0x01, 0x81),
    rev(Chip::Raven2, "RAVEN2", 0x81, 0x91),
    rev(Chip::Renoir, "RENOIR", 0x91, 0xff),
];
static NV_REVS: &[RevRange] = &[
    rev(Chip::Navi10, "NAVI10", 0x01, 0x0a),
    rev(Chip::Navi12, "NAVI12", 0x0a, 0x14),
    rev(Chip::Navi14, "NAVI14", 0x14, 0x28),
    rev(Chip::SiennaCichlid, "SIENNA_CICHLID", 0x28, 0x32),
    rev(Chip::NavyFlounder, "NAVY_FLOUNDER", 0x32, 0x3c),
    rev(Chip::DimgreyCavefish, "DIMGREY_CAVEFISH", 0x3c, 0x46),
    rev(Chip::BeigeGoby, "BEIGE_GOBY", 0x46, 0xff),
];
static VGH_REVS: &[RevRange] = &[rev(Chip::VanGogh, "VANGOGH", 0x01, 0xff)];
static YC_REVS: &[RevRange] = &[rev(Chip::YellowCarp, "YELLOW_CARP", 0x01, 0xff)];

fn revisions(family_id: u32) -> &'static [RevRange] {
    match family_id {
        FAMILY_SI => SI_REVS,
        FAMILY_CI => CI_REVS,
        FAMILY_KV => KV_REVS,
        FAMILY_VI => VI_REVS,
        FAMILY_CZ => CZ_REVS,
        FAMILY_AI => AI_REVS,
        FAMILY_RV => RV_REVS,
        FAMILY_NV => NV_REVS,
        FAMILY_VGH => VGH_REVS,
        FAMILY_YC => YC_REVS,
        _ => &[],
    }
}

pub fn chip_class(chip: Chip) -> ChipClass {
    if chip >= Chip::SiennaCichlid {
        ChipClass::Gfx10_3
    } else if chip >= Chip::Navi10 {
        ChipClass::Gfx10
    } else if chip >= Chip::Vega10 {
        ChipClass::Gfx9
    } else if chip >= Chip::Tonga {
        ChipClass::Gfx8
    } else if chip >= Chip::Bonaire {
        ChipClass::Gfx7
    } else {
        ChipClass::Gfx6
    }
}

pub fn identify_chip(family_id: u32, chip_external_rev: u32) -> Option<ChipInfo> {
    revisions(family_id)
        .iter()
        .find(|r| chip_external_rev >= r.start && chip_external_rev < r.end)
        .map(|r| ChipInfo {
            name: r.name,
            chip: r.chip,
            class: chip_class(r.chip),
            family_id,
        })
}

/// Arcturus and Aldebaran ship without a graphics pipe.
pub fn asic_is_gfx_pipe_removed(family_id: u32, chip_external_rev: u32, chip_rev: u32) -> bool {
    if family_id != FAMILY_AI {
        return false;
    }
    matches!(chip_external_rev.wrapping_sub(chip_rev), 0x32 | 0x3c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_known_parts() {
        let p11 = identify_chip(FAMILY_VI, 0x5a).unwrap();
        assert_eq!((p11.name, p11.class), ("POLARIS11", ChipClass::Gfx8));
        let iceland = identify_chip(FAMILY_VI, 0x01).unwrap();
        assert_eq!(iceland.class, ChipClass::Gfx8);
        assert_eq!(identify_chip(FAMILY_CI, 0x14).unwrap().class, ChipClass::Gfx7);
        assert_eq!(identify_chip(FAMILY_KV, 0x81).unwrap().chip, Chip::Kabini);
        assert_eq!(identify_chip(FAMILY_AI, 0x01).unwrap().class, ChipClass::Gfx9);
        assert_eq!(identify_chip(FAMILY_NV, 0x01).unwrap().class, ChipClass::Gfx10);
        assert_eq!(identify_chip(FAMILY_NV, 0x28).unwrap().class, ChipClass::Gfx10_3);
        assert_eq!(identify_chip(FAMILY_VGH, 0x01).unwrap().class, ChipClass::Gfx10_3);
        assert_eq!(identify_chip(FAMILY_SI, 0x05).unwrap().class, ChipClass::Gfx6);
    }

    #[test]
    fn rejects_unknown_pairs() {
        assert!(identify_chip(FAMILY_SI, 0x01).is_none());
        assert!(identify_chip(99, 0x10).is_none());
    }

    #[test]
    fn gfx_pipe_removed_only_on_compute_parts() {
        assert!(asic_is_gfx_pipe_removed(FAMILY_AI, 0x32, 0));
        assert!(asic_is_gfx_pipe_removed(FAMILY_AI, 0x3d, 1));
        assert!(!asic_is_gfx_pipe_removed(FAMILY_AI, 0x01, 0));
        assert!(!asic_is_gfx_pipe_removed(FAMILY_NV, 0x32, 0));
    }
}
