//! SAM identification: power-on data parsing and product
//! classification for the secure modules the terminal can pair with.

use crate::error::{Error, Result};
use crate::util::to_hex;
use getset::{CopyGetters, Getters};
use serde::Serialize;
use strum::{AsRefStr, Display};

/// The SAM product families.
#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "shouty_snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamProductType {
    SamC1,
    HsmC1,
    SamS1dx,
    SamS1e1,
    Unknown,
}

/// Static identification data of a SAM, decoded from its power-on data.
///
/// The accepted frame is `3B (.{6}|.{10}) 805A (.{20}) 829000` on the
/// hex form, i.e. a 3- or 5-byte interface block between the `3B`
/// prefix and the `80 5A` marker, then ten data bytes and the `82 90 00`
/// trailer.
#[derive(Clone, Debug, Getters, CopyGetters, Serialize)]
pub struct LegacySam {
    #[get_copy = "pub"]
    product_type: SamProductType,
    #[get_copy = "pub"]
    platform: u8,
    #[get_copy = "pub"]
    application_type: u8,
    #[get_copy = "pub"]
    application_subtype: u8,
    #[get_copy = "pub"]
    software_issuer: u8,
    #[get_copy = "pub"]
    software_version: u8,
    #[get_copy = "pub"]
    software_revision: u8,
    #[get = "pub"]
    serial_number: [u8; 4],
}

/// Software issuer byte marking the HSM variant of the C1.
const SOFTWARE_ISSUER_HSM: u8 = 0x08;

impl LegacySam {
    /// Parse and classify SAM power-on data.
    pub fn from_power_on_data(power_on_data: &[u8]) -> Result<Self> {
        let interface_len = match power_on_data.len() {
            19 => 3,
            21 => 5,
            _ => {
                return Err(Error::InconsistentData(format!(
                    "unrecognized SAM power-on data: {}",
                    to_hex(power_on_data)
                )))
            }
        };
        let marker = 1 + interface_len;
        if power_on_data[0] != 0x3B
            || power_on_data[marker..marker + 2] != [0x80, 0x5A]
            || power_on_data[marker + 12..] != [0x82, 0x90, 0x00]
        {
            return Err(Error::InconsistentData(format!(
                "unrecognized SAM power-on data: {}",
                to_hex(power_on_data)
            )));
        }
        let fields = &power_on_data[marker + 2..marker + 12];
        let application_subtype = fields[2];
        let software_issuer = fields[3];
        let product_type = match application_subtype {
            0xC1 if software_issuer == SOFTWARE_ISSUER_HSM => SamProductType::HsmC1,
            0xC1 => SamProductType::SamC1,
            0xD0 | 0xD1 | 0xD2 | 0xD7 => SamProductType::SamS1dx,
            0xE1 => SamProductType::SamS1e1,
            _ => SamProductType::Unknown,
        };
        let mut serial_number = [0u8; 4];
        serial_number.copy_from_slice(&fields[6..10]);
        Ok(Self {
            product_type,
            platform: fields[0],
            application_type: fields[1],
            application_subtype,
            software_issuer,
            software_version: fields[4],
            software_revision: fields[5],
            serial_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power_on_data(interface: &[u8], fields: [u8; 10]) -> Vec<u8> {
        let mut data = vec![0x3B];
        data.extend_from_slice(interface);
        data.extend_from_slice(&[0x80, 0x5A]);
        data.extend_from_slice(&fields);
        data.extend_from_slice(&[0x82, 0x90, 0x00]);
        data
    }

    #[test]
    fn c1_with_short_interface_block() {
        let data = power_on_data(
            &[0x3F, 0x96, 0x00],
            [0x00, 0x80, 0xC1, 0x20, 0x14, 0x05, 0xAA, 0xBB, 0xCC, 0xDD],
        );
        let sam = LegacySam::from_power_on_data(&data).unwrap();
        assert_eq!(sam.product_type(), SamProductType::SamC1);
        assert_eq!(sam.platform(), 0x00);
        assert_eq!(sam.application_type(), 0x80);
        assert_eq!(sam.software_version(), 0x14);
        assert_eq!(sam.serial_number(), &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn hsm_c1_by_software_issuer() {
        let data = power_on_data(
            &[0x3F, 0x96, 0x00],
            [0x00, 0x80, 0xC1, 0x08, 0x14, 0x05, 0, 0, 0, 1],
        );
        assert_eq!(
            LegacySam::from_power_on_data(&data).unwrap().product_type(),
            SamProductType::HsmC1
        );
    }

    #[test]
    fn s1dx_family_with_long_interface_block() {
        for subtype in [0xD0u8, 0xD1, 0xD2, 0xD7].iter() {
            let data = power_on_data(
                &[0x3F, 0x96, 0x00, 0x80, 0x65],
                [0x00, 0x80, *subtype, 0x20, 0x14, 0x05, 0, 0, 0, 1],
            );
            assert_eq!(
                LegacySam::from_power_on_data(&data).unwrap().product_type(),
                SamProductType::SamS1dx
            );
        }
    }

    #[test]
    fn s1e1_and_unknown() {
        let data = power_on_data(
            &[0x3F, 0x96, 0x00],
            [0x00, 0x80, 0xE1, 0x20, 0x14, 0x05, 0, 0, 0, 1],
        );
        assert_eq!(
            LegacySam::from_power_on_data(&data).unwrap().product_type(),
            SamProductType::SamS1e1
        );
        let data = power_on_data(
            &[0x3F, 0x96, 0x00],
            [0x00, 0x80, 0x42, 0x20, 0x14, 0x05, 0, 0, 0, 1],
        );
        assert_eq!(
            LegacySam::from_power_on_data(&data).unwrap().product_type(),
            SamProductType::Unknown
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(LegacySam::from_power_on_data(&[0x3B, 0x80]).is_err());
        // wrong marker
        let mut data = power_on_data(
            &[0x3F, 0x96, 0x00],
            [0x00, 0x80, 0xC1, 0x20, 0x14, 0x05, 0, 0, 0, 1],
        );
        data[4] = 0x81;
        assert!(LegacySam::from_power_on_data(&data).is_err());
        // wrong trailer
        let mut data = power_on_data(
            &[0x3F, 0x96, 0x00],
            [0x00, 0x80, 0xC1, 0x20, 0x14, 0x05, 0, 0, 0, 1],
        );
        let n = data.len();
        data[n - 1] = 0x01;
        assert!(LegacySam::from_power_on_data(&data).is_err());
    }
}
