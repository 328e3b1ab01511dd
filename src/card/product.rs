//! Product classification data: product types, startup info, the
//! session-buffer capacity table and the per-product errata patches.

use getset::CopyGetters;
use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// The Calypso product families the terminal can drive.
#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "shouty_snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Unknown,
    PrimeRev1,
    PrimeRev2,
    PrimeRev3,
    Light,
    Basic,
}

impl ProductType {
    /// Whether the session modifications buffer is counted in bytes
    /// (otherwise in commands).
    pub fn buffer_counted_in_bytes(self) -> bool {
        matches!(self, ProductType::PrimeRev3 | ProductType::Light)
    }
}

/// ISO class byte of the card's command set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum CardClass {
    Iso,
    Legacy,
}

impl CardClass {
    pub fn value(self) -> u8 {
        match self {
            CardClass::Iso => 0x00,
            CardClass::Legacy => 0x94,
        }
    }
}

/// The 7 startup-info bytes:
/// `bufferSizeIndicator platform applicationType applicationSubtype
/// softwareIssuer softwareVersion softwareRevision`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StartupInfo(pub [u8; 7]);

impl StartupInfo {
    pub fn buffer_size_indicator(&self) -> u8 {
        self.0[0]
    }

    pub fn platform(&self) -> u8 {
        self.0[1]
    }

    pub fn application_type(&self) -> u8 {
        self.0[2]
    }

    pub fn application_subtype(&self) -> u8 {
        self.0[3]
    }

    pub fn software_issuer(&self) -> u8 {
        self.0[4]
    }

    pub fn software_version(&self) -> u8 {
        self.0[5]
    }

    pub fn software_revision(&self) -> u8 {
        self.0[6]
    }

    /// The 7 bytes as a 56-bit big-endian integer, the form the patch
    /// tables match against.
    pub fn as_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }
}

/// Session-buffer capacity in bytes by buffer-size indicator.
/// Entries below the valid range (6..=55) are zero.
pub const BUFFER_SIZES: [u32; 56] = [
    0, 0, 0, 0, 0, 0, 215, 256, 304, 362, 430, 512, 608, 724, 861, 1024, 1217, 1448, 1722, 2048,
    2435, 2896, 3444, 4096, 4870, 5792, 6888, 8192, 9741, 11585, 13777, 16384, 19483, 23170,
    27554, 32768, 38967, 46340, 55108, 65536, 77935, 92681, 110217, 131072, 155871, 185363,
    220435, 262144, 311743, 370727, 440871, 524288, 623487, 741455, 881743, 1048576,
];

/// Per-card overrides applied when an errata patch matches.
#[derive(Clone, Copy, Debug, Default, CopyGetters, Serialize)]
pub struct PatchEffects {
    /// Maximum APDU payload override, when the product reports more
    /// than it can actually take.
    #[get_copy = "pub"]
    pub payload_capacity: Option<usize>,
    /// The card answers Increase/Decrease with SW 6200h and postpones
    /// the new counter value to the session close.
    #[get_copy = "pub"]
    pub counter_value_postponed: bool,
    /// The card rejects ISO case-1 APDUs carrying an Le byte; case-1
    /// commands must be sent as bare 4-byte headers.
    #[get_copy = "pub"]
    pub legacy_case1: bool,
}

/// An errata entry matched against the startup info.
#[derive(Clone, Copy, Debug)]
pub struct Patch {
    pub pattern: u64,
    pub mask: u64,
    pub effects: PatchEffects,
}

impl Patch {
    pub fn matches(&self, startup_info: &StartupInfo) -> bool {
        startup_info.as_u64() & self.mask == self.pattern
    }
}

/// Errata for PRIME revision 1 and 2 products.
pub static REV_1_2_PATCHES: [Patch; 2] = [
    // Early applets postponing the counter response to session close.
    Patch {
        pattern: 0x06_0A_01_02_00_00_00,
        mask: 0xFF_FF_FF_FF_00_00_00,
        effects: PatchEffects {
            payload_capacity: None,
            counter_value_postponed: true,
            legacy_case1: false,
        },
    },
    // First-generation masks rejecting case-1 APDUs with an Le byte.
    Patch {
        pattern: 0x03_01_01_01_00_00_00,
        mask: 0xFF_FF_FF_00_00_00_00,
        effects: PatchEffects {
            payload_capacity: Some(128),
            counter_value_postponed: false,
            legacy_case1: true,
        },
    },
];

/// Errata for PRIME revision 3 products.
pub static REV_3_PATCHES: [Patch; 2] = [
    // A platform revision limited to half the standard payload.
    Patch {
        pattern: 0x0A_2E_20_01_00_00_00,
        mask: 0xFF_FF_F8_FF_00_00_00,
        effects: PatchEffects {
            payload_capacity: Some(128),
            counter_value_postponed: false,
            legacy_case1: false,
        },
    },
    // A rev 3 mask still postponing counter responses.
    Patch {
        pattern: 0x07_1C_20_05_00_00_00,
        mask: 0xFF_FF_F8_FF_00_00_00,
        effects: PatchEffects {
            payload_capacity: None,
            counter_value_postponed: true,
            legacy_case1: false,
        },
    },
];

/// Find the first matching patch for the product family; at most one
/// patch ever applies.
pub fn find_patch(product_type: ProductType, startup_info: &StartupInfo) -> Option<&'static Patch> {
    let table: &[Patch] = match product_type {
        ProductType::PrimeRev3 => &REV_3_PATCHES,
        ProductType::PrimeRev1 | ProductType::PrimeRev2 => &REV_1_2_PATCHES,
        _ => return None,
    };
    table.iter().find(|p| p.matches(startup_info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_table_bounds() {
        assert_eq!(BUFFER_SIZES.len(), 56);
        assert_eq!(BUFFER_SIZES[6], 215);
        assert_eq!(BUFFER_SIZES[10], 430);
        assert_eq!(BUFFER_SIZES[55], 1_048_576);
        assert_eq!(BUFFER_SIZES[5], 0);
    }

    #[test]
    fn postponed_counter_patch_matches() {
        let info = StartupInfo([0x06, 0x0A, 0x01, 0x02, 0x12, 0x34, 0x56]);
        let patch = find_patch(ProductType::PrimeRev2, &info).unwrap();
        assert!(patch.effects.counter_value_postponed);
        // same bytes on a rev 3 product hit a different table
        assert!(find_patch(ProductType::PrimeRev3, &info).is_none());
    }

    #[test]
    fn first_match_wins_and_tables_are_static() {
        let info = StartupInfo([0x06, 0x0A, 0x01, 0x02, 0x00, 0x00, 0x00]);
        let first = find_patch(ProductType::PrimeRev1, &info).unwrap();
        let second = find_patch(ProductType::PrimeRev1, &info).unwrap();
        assert_eq!(first.pattern, second.pattern);
        assert_eq!(first.mask, 0xFF_FF_FF_FF_00_00_00);
    }

    #[test]
    fn no_patch_for_unknown_product() {
        let info = StartupInfo([0x06, 0x0A, 0x01, 0x02, 0x00, 0x00, 0x00]);
        assert!(find_patch(ProductType::Unknown, &info).is_none());
        assert!(find_patch(ProductType::Light, &info).is_none());
    }
}
