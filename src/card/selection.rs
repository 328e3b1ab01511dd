//! Card selection: parsing of power-on data and FCI, classification of
//! the application into a product type, and errata patch application.

use crate::apdu::ApduResponse;
use crate::card::file::FileHeader;
use crate::card::product::{find_patch, CardClass, ProductType, StartupInfo, BUFFER_SIZES};
use crate::card::{CalypsoCard, CardFeatures};
use crate::error::{Error, Result};
use crate::util::{tlv_find, to_hex};
use log::debug;

const TAG_FCI_TEMPLATE: u32 = 0x6F;
const TAG_DF_NAME: u32 = 0x84;
const TAG_FCI_PROPRIETARY_TEMPLATE: u32 = 0xA5;
const TAG_FCI_ISSUER_DISCRETIONARY: u32 = 0xBF0C;
const TAG_APPLICATION_SERIAL_NUMBER: u32 = 0xC7;
const TAG_DISCRETIONARY_DATA: u32 = 0x53;

/// Select File / SELECT AID status word for an invalidated DF.
const SW_DF_INVALIDATED: u16 = 0x6283;

/// Application-type bit flags (PRIME revision 2 and 3).
const APP_TYPE_PIN: u8 = 0x01;
const APP_TYPE_SV: u8 = 0x02;
const APP_TYPE_RATIFICATION_COMMAND_REQUIRED: u8 = 0x04;
const APP_TYPE_EXTENDED_MODE: u8 = 0x08;
const APP_TYPE_PKI: u8 = 0x10;

/// Default modifications counter for products counting in commands.
const DEFAULT_COMMAND_MODE_MODIFICATIONS: u32 = 3;

/// Build a card image from the selection outcome: the power-on data
/// when the application was reached by its ATR alone, and/or the
/// SELECT response carrying the FCI.
///
/// With no discriminator at all the image stays `UNKNOWN`.
pub fn card_from_selection(
    power_on_data: Option<&[u8]>,
    select_application_response: Option<&ApduResponse>,
) -> Result<CalypsoCard> {
    let mut card = CalypsoCard::blank();
    if let Some(response) = select_application_response {
        match response.status_word() {
            0x9000 => {}
            SW_DF_INVALIDATED => card.set_df_invalidated(true),
            sw => {
                return Err(Error::UnknownStatus {
                    sw,
                    command: "SELECT APPLICATION",
                })
            }
        }
        apply_fci(&mut card, response.data_out())?;
    } else if let Some(atr) = power_on_data {
        apply_power_on_data(&mut card, atr)?;
    }
    Ok(card)
}

/// Classify from power-on data alone: always a PRIME revision 1 card
/// with the LEGACY command class.
pub(crate) fn apply_power_on_data(card: &mut CalypsoCard, atr: &[u8]) -> Result<()> {
    if atr.len() != 20 {
        return Err(Error::InconsistentData(format!(
            "power-on data must be 20 bytes, got {} ({})",
            atr.len(),
            to_hex(atr)
        )));
    }
    let mut serial = [0u8; 8];
    serial[4..8].copy_from_slice(&atr[12..16]);
    card.set_serial_number(serial);

    let mut info = [0u8; 7];
    info[0] = DEFAULT_COMMAND_MODE_MODIFICATIONS as u8;
    info[1..7].copy_from_slice(&atr[6..12]);
    let startup_info = StartupInfo(info);

    card.set_product(ProductType::PrimeRev1, CardClass::Legacy, startup_info);
    card.set_modifications_counter_max(DEFAULT_COMMAND_MODE_MODIFICATIONS);
    card.set_payload_capacity(128);
    if let Some(patch) = find_patch(ProductType::PrimeRev1, &startup_info) {
        debug!(
            "selection: patch {:014X}h/{:014X}h applied",
            patch.pattern, patch.mask
        );
        card.set_patch_effects(patch.effects);
    }
    debug!("selection: {} from power-on data", card.product_type());
    Ok(())
}

/// Parse an FCI payload and classify the application.
///
/// Grammar: `6F { 84 dfName, A5 { BF0C { C7 serial, 53 discretionary } } }`
/// with the startup info carried by the discretionary data.
pub(crate) fn apply_fci(card: &mut CalypsoCard, fci: &[u8]) -> Result<()> {
    let template = tlv_find(fci, TAG_FCI_TEMPLATE)
        .ok_or_else(|| Error::InconsistentData("FCI template (6F) not found".to_string()))?;
    let df_name = tlv_find(template, TAG_DF_NAME)
        .ok_or_else(|| Error::InconsistentData("DF name (84) not found in FCI".to_string()))?;
    if df_name.is_empty() || df_name.len() > 16 {
        return Err(Error::InconsistentData(format!(
            "DF name length out of range: {}",
            df_name.len()
        )));
    }
    let proprietary = tlv_find(template, TAG_FCI_PROPRIETARY_TEMPLATE).ok_or_else(|| {
        Error::InconsistentData("proprietary template (A5) not found in FCI".to_string())
    })?;
    let discretionary_template = tlv_find(proprietary, TAG_FCI_ISSUER_DISCRETIONARY)
        .ok_or_else(|| Error::InconsistentData("BF0C template not found in FCI".to_string()))?;
    let serial = tlv_find(discretionary_template, TAG_APPLICATION_SERIAL_NUMBER)
        .ok_or_else(|| Error::InconsistentData("serial number (C7) not found".to_string()))?;
    if serial.len() != 8 {
        return Err(Error::InconsistentData(format!(
            "serial number must be 8 bytes, got {}",
            serial.len()
        )));
    }
    let discretionary = tlv_find(discretionary_template, TAG_DISCRETIONARY_DATA)
        .ok_or_else(|| Error::InconsistentData("discretionary data (53) not found".to_string()))?;
    if discretionary.len() < 7 {
        return Err(Error::InconsistentData(format!(
            "discretionary data must carry 7 startup bytes, got {}",
            discretionary.len()
        )));
    }

    card.set_df_name(df_name.to_vec());
    let mut serial_bytes = [0u8; 8];
    serial_bytes.copy_from_slice(serial);
    card.set_serial_number(serial_bytes);

    let mut info = [0u8; 7];
    info.copy_from_slice(&discretionary[..7]);
    let startup_info = StartupInfo(info);

    let application_type = startup_info.application_type();
    if application_type == 0x00 {
        return Err(Error::InconsistentData(
            "application type 00h is not a valid Calypso application".to_string(),
        ));
    }
    if application_type == 0xFF {
        debug!("selection: application type FFh, product stays UNKNOWN");
        card.set_product(ProductType::Unknown, CardClass::Iso, startup_info);
        return Ok(());
    }
    let application_subtype = startup_info.application_subtype();
    if application_subtype == 0x00 || application_subtype == 0xFF {
        return Err(Error::InconsistentData(format!(
            "invalid application subtype {:02X}h",
            application_subtype
        )));
    }

    let product_type = match application_type {
        t if t <= 0x1F => ProductType::PrimeRev2,
        t if (0x90..=0x97).contains(&t) => ProductType::Light,
        t if (0x98..=0x9F).contains(&t) => ProductType::Basic,
        _ => ProductType::PrimeRev3,
    };
    let card_class = match product_type {
        ProductType::PrimeRev2 => CardClass::Legacy,
        _ => CardClass::Iso,
    };
    card.set_product(product_type, card_class, startup_info);
    card.set_payload_capacity(match card_class {
        CardClass::Iso => 255,
        CardClass::Legacy => 128,
    });

    let mut features = CardFeatures::empty();
    match product_type {
        ProductType::PrimeRev3 => {
            if application_type & APP_TYPE_PIN != 0 {
                features |= CardFeatures::PIN;
            }
            if application_type & APP_TYPE_SV != 0 {
                features |= CardFeatures::SV;
            }
            if application_type & APP_TYPE_EXTENDED_MODE != 0 {
                features |= CardFeatures::EXTENDED_MODE;
            }
            if application_type & APP_TYPE_PKI != 0 {
                features |= CardFeatures::PKI;
            }
            if application_type & APP_TYPE_RATIFICATION_COMMAND_REQUIRED == 0 {
                features |= CardFeatures::RATIFICATION_ON_DESELECT;
            }
        }
        ProductType::PrimeRev2 => {
            if application_type & APP_TYPE_PIN != 0 {
                features |= CardFeatures::PIN;
            }
            if application_type & APP_TYPE_SV != 0 {
                features |= CardFeatures::SV;
            }
        }
        ProductType::Light | ProductType::Basic => {
            features |= CardFeatures::RATIFICATION_ON_DESELECT;
        }
        _ => {}
    }
    if serial_bytes[3] & 0x80 != 0 {
        features |= CardFeatures::HCE;
    }
    card.set_features(features);

    let indicator = startup_info.buffer_size_indicator();
    match product_type {
        ProductType::PrimeRev3 | ProductType::Light => {
            if !(0x06..=0x37).contains(&indicator) {
                return Err(Error::InconsistentData(format!(
                    "session buffer indicator {:02X}h out of range",
                    indicator
                )));
            }
            card.set_modifications_counter_max(BUFFER_SIZES[usize::from(indicator)]);
        }
        ProductType::Basic => {
            if !(0x04..=0x37).contains(&indicator) {
                return Err(Error::InconsistentData(format!(
                    "session buffer indicator {:02X}h out of range",
                    indicator
                )));
            }
            card.set_modifications_counter_max(DEFAULT_COMMAND_MODE_MODIFICATIONS);
        }
        _ => card.set_modifications_counter_max(DEFAULT_COMMAND_MODE_MODIFICATIONS),
    }

    if let Some(patch) = find_patch(product_type, &startup_info) {
        debug!(
            "selection: patch {:014X}h/{:014X}h applied",
            patch.pattern, patch.mask
        );
        card.set_patch_effects(patch.effects);
    }
    debug!(
        "selection: {} (class {:02X}h), buffer max {} {}",
        card.product_type(),
        card.card_class().value(),
        card.modifications_counter_max(),
        if card.is_modifications_counter_in_bytes() {
            "bytes"
        } else {
            "commands"
        }
    );
    Ok(())
}

/// Decode one 8-byte EF descriptor of a Get Data (EF list) response:
/// `E3 06 lid(2) sfi(1) type(1) recSize(1) nRec(1)` already unwrapped
/// from its `E3` envelope.
pub(crate) fn file_header_from_descriptor(descriptor: &[u8]) -> Result<(u8, FileHeader)> {
    use crate::card::file::EfType;
    if descriptor.len() != 6 {
        return Err(Error::InconsistentData(format!(
            "EF descriptor must be 6 bytes, got {}",
            descriptor.len()
        )));
    }
    let lid = (u16::from(descriptor[0]) << 8) | u16::from(descriptor[1]);
    let sfi = descriptor[2];
    let ef_type = EfType::from_descriptor_byte(descriptor[3]).ok_or_else(|| {
        Error::InconsistentData(format!("unknown EF type {:02X}h", descriptor[3]))
    })?;
    let header = FileHeader::new()
        .with_lid(lid)
        .with_ef_type(ef_type)
        .with_record_size(descriptor[4])
        .with_records_number(descriptor[5]);
    Ok((sfi, header))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a well-formed FCI for the given startup info and serial.
    pub(crate) fn build_fci(serial: [u8; 8], startup_info: [u8; 7]) -> Vec<u8> {
        let aid: &[u8] = &[
            0x32, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53, 0x2E, 0x44, 0x44, 0x46, 0x30, 0x31,
        ];
        let mut bf0c = vec![0xC7, 0x08];
        bf0c.extend_from_slice(&serial);
        bf0c.push(0x53);
        bf0c.push(0x07);
        bf0c.extend_from_slice(&startup_info);
        let mut a5 = vec![0xBF, 0x0C, bf0c.len() as u8];
        a5.extend_from_slice(&bf0c);
        let mut template = vec![0x84, aid.len() as u8];
        template.extend_from_slice(aid);
        template.extend_from_slice(&[0xA5, a5.len() as u8]);
        template.extend_from_slice(&a5);
        let mut fci = vec![0x6F, template.len() as u8];
        fci.extend_from_slice(&template);
        fci
    }

    fn selected(startup_info: [u8; 7]) -> CalypsoCard {
        let fci = build_fci([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88], startup_info);
        let response = ApduResponse::from_parts(&fci, 0x9000);
        card_from_selection(None, Some(&response)).unwrap()
    }

    #[test]
    fn prime_rev3_with_buffer_430() {
        let card = selected([0x0A, 0x3C, 0x20, 0x05, 0x01, 0x02, 0x03]);
        assert_eq!(card.product_type(), ProductType::PrimeRev3);
        assert_eq!(card.modifications_counter_max(), 430);
        assert!(card.is_modifications_counter_in_bytes());
        assert!(card.has_feature(CardFeatures::SV));
        assert!(!card.has_feature(CardFeatures::PIN));
        assert!(!card.is_extended_mode_supported());
        assert!(card.is_ratification_on_deselect_supported());
    }

    #[test]
    fn extended_mode_and_pki_bits() {
        let card = selected([0x06, 0x3C, 0x38, 0x05, 0x01, 0x02, 0x03]);
        assert!(card.is_extended_mode_supported());
        assert!(card.has_feature(CardFeatures::PKI));
        // 0x04 set: ratification command required
        assert!(!card.is_ratification_on_deselect_supported());
    }

    #[test]
    fn product_type_boundaries() {
        assert_eq!(
            selected([0x06, 0, 0x1F, 0x05, 0, 0, 0]).product_type(),
            ProductType::PrimeRev2
        );
        assert_eq!(
            selected([0x06, 0, 0x20, 0x05, 0, 0, 0]).product_type(),
            ProductType::PrimeRev3
        );
        assert_eq!(
            selected([0x06, 0, 0x90, 0x05, 0, 0, 0]).product_type(),
            ProductType::Light
        );
        assert_eq!(
            selected([0x06, 0, 0x97, 0x05, 0, 0, 0]).product_type(),
            ProductType::Light
        );
        assert_eq!(
            selected([0x06, 0, 0x98, 0x05, 0, 0, 0]).product_type(),
            ProductType::Basic
        );
    }

    #[test]
    fn application_type_ff_stays_unknown() {
        let card = selected([0x06, 0, 0xFF, 0x05, 0, 0, 0]);
        assert_eq!(card.product_type(), ProductType::Unknown);
    }

    #[test]
    fn application_type_zero_is_an_error() {
        let fci = build_fci([0; 8], [0x06, 0, 0x00, 0x05, 0, 0, 0]);
        let response = ApduResponse::from_parts(&fci, 0x9000);
        assert!(matches!(
            card_from_selection(None, Some(&response)),
            Err(Error::InconsistentData(_))
        ));
    }

    #[test]
    fn invalid_subtype_is_an_error() {
        for subtype in [0x00, 0xFF].iter() {
            let fci = build_fci([0; 8], [0x06, 0, 0x20, *subtype, 0, 0, 0]);
            let response = ApduResponse::from_parts(&fci, 0x9000);
            assert!(card_from_selection(None, Some(&response)).is_err());
        }
    }

    #[test]
    fn buffer_indicator_out_of_range() {
        let fci = build_fci([0; 8], [0x05, 0, 0x20, 0x05, 0, 0, 0]);
        let response = ApduResponse::from_parts(&fci, 0x9000);
        assert!(card_from_selection(None, Some(&response)).is_err());
    }

    #[test]
    fn hce_flag_from_serial_high_bit() {
        let fci = build_fci(
            [0x11, 0x22, 0x33, 0xC4, 0x55, 0x66, 0x77, 0x88],
            [0x0A, 0x3C, 0x20, 0x05, 0, 0, 0],
        );
        let response = ApduResponse::from_parts(&fci, 0x9000);
        let card = card_from_selection(None, Some(&response)).unwrap();
        assert!(card.has_feature(CardFeatures::HCE));
    }

    #[test]
    fn invalidated_df_from_select_status() {
        let fci = build_fci([0; 8], [0x0A, 0x3C, 0x20, 0x05, 0, 0, 0]);
        let response = ApduResponse::from_parts(&fci, 0x6283);
        let card = card_from_selection(None, Some(&response)).unwrap();
        assert!(card.df_invalidated());
    }

    #[test]
    fn power_on_data_path() {
        let mut atr = [0u8; 20];
        atr[6..12].copy_from_slice(&[0x0A, 0x01, 0x02, 0x03, 0x04, 0x05]);
        atr[12..16].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let card = card_from_selection(Some(&atr), None).unwrap();
        assert_eq!(card.product_type(), ProductType::PrimeRev1);
        assert_eq!(card.card_class(), CardClass::Legacy);
        assert_eq!(
            card.serial_number(),
            &[0, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF]
        );
        assert_eq!(card.startup_info().0, [3, 0x0A, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(card.modifications_counter_max(), 3);
        assert!(!card.is_modifications_counter_in_bytes());
    }

    #[test]
    fn no_discriminator_stays_unknown() {
        let card = card_from_selection(None, None).unwrap();
        assert_eq!(card.product_type(), ProductType::Unknown);
    }

    #[test]
    fn ef_descriptor_decodes() {
        let (sfi, header) =
            file_header_from_descriptor(&[0x20, 0x10, 0x07, 0x02, 0x1D, 0x04]).unwrap();
        assert_eq!(sfi, 0x07);
        assert_eq!(header.lid(), Some(0x2010));
        assert_eq!(header.record_size(), Some(0x1D));
        assert_eq!(header.records_number(), Some(4));
    }
}
