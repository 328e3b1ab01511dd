//! Administrative commands: Get Data, Select File, Invalidate,
//! Rehabilitate and Change Key.

use crate::apdu::{ApduRequest, ApduResponse};
use crate::card::file::{EfType, FileHeader};
use crate::card::product::CardClass;
use crate::card::selection::file_header_from_descriptor;
use crate::card::{selection, CalypsoCard, DirectoryHeader};
use crate::command::pin::case1_request;
use crate::error::{Error, Result};
use crate::spi::SymmetricCryptoSpi;
use crate::util::{tlv_children, tlv_find, to_hex};
use log::trace;

const INS_GET_DATA: u8 = 0xCA;
const INS_SELECT_FILE: u8 = 0xA4;
const INS_INVALIDATE: u8 = 0x04;
const INS_REHABILITATE: u8 = 0x44;
const INS_CHANGE_KEY: u8 = 0xD8;

const TAG_FCP: u32 = 0x62;
const TAG_PROPRIETARY_INFORMATION: u32 = 0x85;
const TAG_EF_LIST: u32 = 0xC0;
const TAG_EF_DESCRIPTOR: u32 = 0xE3;

const PROPRIETARY_INFORMATION_LENGTH: usize = 23;
const FILE_TYPE_MF: u8 = 1;
const FILE_TYPE_DF: u8 = 2;
const FILE_TYPE_EF: u8 = 4;

const CIPHERED_KEY_LENGTH: usize = 24;

/// The data objects Get Data can fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetDataTag {
    FcpForCurrentFile,
    FciForCurrentDf,
    EfList,
    TraceabilityInformation,
}

impl GetDataTag {
    pub fn value(self) -> u16 {
        match self {
            GetDataTag::FcpForCurrentFile => 0x0062,
            GetDataTag::FciForCurrentDf => 0x006F,
            GetDataTag::EfList => 0x00C0,
            GetDataTag::TraceabilityInformation => 0x0185,
        }
    }
}

/// Get Data. Always uses the ISO class byte.
#[derive(Debug)]
pub struct CmdGetData {
    tag: GetDataTag,
    request: ApduRequest,
}

impl CmdGetData {
    pub fn new(tag: GetDataTag) -> Self {
        let value = tag.value();
        Self {
            tag,
            request: ApduRequest::build(
                0x00,
                INS_GET_DATA,
                (value >> 8) as u8,
                value as u8,
                None,
                Some(0x00),
            ),
        }
    }

    pub fn tag(&self) -> GetDataTag {
        self.tag
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let data = response.data_out();
        match self.tag {
            GetDataTag::FciForCurrentDf => selection::apply_fci(card, data),
            GetDataTag::FcpForCurrentFile => {
                let fcp = tlv_find(data, TAG_FCP).ok_or_else(|| {
                    Error::InconsistentData("FCP template (62) not found".to_string())
                })?;
                apply_proprietary_information(card, fcp)
            }
            GetDataTag::EfList => {
                let list = tlv_find(data, TAG_EF_LIST).ok_or_else(|| {
                    Error::InconsistentData("EF list (C0) not found".to_string())
                })?;
                for descriptor in tlv_children(list) {
                    if descriptor.tag != TAG_EF_DESCRIPTOR {
                        continue;
                    }
                    let (sfi, header) = file_header_from_descriptor(descriptor.value)?;
                    card.set_file_header(sfi, header)?;
                }
                Ok(())
            }
            GetDataTag::TraceabilityInformation => {
                card.set_traceability_information(data.to_vec());
                Ok(())
            }
        }
    }
}

/// Selection mode of Select File.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectFileMode {
    ByLid(u16),
    First,
    Next,
    Current,
}

/// Select File.
#[derive(Debug)]
pub struct CmdSelectFile {
    mode: SelectFileMode,
    request: ApduRequest,
}

impl CmdSelectFile {
    pub fn new(card_class: CardClass, mode: SelectFileMode) -> Self {
        let (p1, p2, data) = match mode {
            SelectFileMode::ByLid(lid) => (0x09, 0x00, lid.to_be_bytes()),
            SelectFileMode::First => (0x02, 0x00, [0x00, 0x00]),
            SelectFileMode::Next => (0x02, 0x02, [0x00, 0x00]),
            SelectFileMode::Current => (0x09, 0x00, [0x00, 0x00]),
        };
        Self {
            mode,
            request: ApduRequest::build(
                card_class.value(),
                INS_SELECT_FILE,
                p1,
                p2,
                Some(&data),
                Some(0x00),
            ),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let data = response.data_out();
        let fcp = tlv_find(data, TAG_FCP).ok_or_else(|| {
            Error::InconsistentData(format!("FCP template (62) not found in {}", to_hex(data)))
        })?;
        apply_proprietary_information(card, fcp)
    }
}

/// Decode the 23-byte proprietary information block of a Select File or
/// Get Data (FCP) response and store it in the image:
/// `sfi(1) fileType(1) efType(1) recSize(1) nRec(1) ac(4) keyIndexes(4)
/// dfStatus(1) [DF: kvcs(3) kifs(3) rfu(1) | EF: sharedRef(2) rfu(5)]
/// lid(2)`.
fn apply_proprietary_information(card: &mut CalypsoCard, fcp: &[u8]) -> Result<()> {
    let info = tlv_find(fcp, TAG_PROPRIETARY_INFORMATION).ok_or_else(|| {
        Error::InconsistentData("proprietary information (85) not found".to_string())
    })?;
    if info.len() < PROPRIETARY_INFORMATION_LENGTH {
        return Err(Error::UnexpectedResponseLength(format!(
            "proprietary information must be {} bytes, got {}",
            PROPRIETARY_INFORMATION_LENGTH,
            info.len()
        )));
    }
    let lid = (u16::from(info[21]) << 8) | u16::from(info[22]);
    let mut access_conditions = [0u8; 4];
    access_conditions.copy_from_slice(&info[5..9]);
    let mut key_indexes = [0u8; 4];
    key_indexes.copy_from_slice(&info[9..13]);
    match info[1] {
        FILE_TYPE_MF | FILE_TYPE_DF => {
            let mut kvcs = [0u8; 3];
            kvcs.copy_from_slice(&info[14..17]);
            let mut kifs = [0u8; 3];
            kifs.copy_from_slice(&info[17..20]);
            trace!("image: DF header for LID {:04X}h", lid);
            card.set_df_header(DirectoryHeader::new(
                lid,
                info[13],
                kvcs,
                kifs,
                access_conditions,
                key_indexes,
            ));
            Ok(())
        }
        FILE_TYPE_EF => {
            let ef_type = EfType::from_descriptor_byte(info[2]).ok_or_else(|| {
                Error::InconsistentData(format!("unknown EF type {:02X}h", info[2]))
            })?;
            let mut header = FileHeader::new()
                .with_lid(lid)
                .with_ef_type(ef_type)
                .with_record_size(info[3])
                .with_records_number(info[4])
                .with_access_conditions(access_conditions)
                .with_key_indexes(key_indexes)
                .with_df_status(info[13]);
            let shared_reference = (u16::from(info[14]) << 8) | u16::from(info[15]);
            if shared_reference != 0 {
                header = header.with_shared_reference(shared_reference);
            }
            card.set_file_header(info[0], header)
        }
        other => Err(Error::InconsistentData(format!(
            "unknown file type {:02X}h",
            other
        ))),
    }
}

/// Invalidate or Rehabilitate the selected DF. Both stage their effect
/// in the session buffer when run inside a session.
#[derive(Debug)]
pub struct CmdStatusChange {
    rehabilitate: bool,
    request: ApduRequest,
}

impl CmdStatusChange {
    pub fn new(card_class: CardClass, rehabilitate: bool, legacy_case1: bool) -> Self {
        let ins = if rehabilitate {
            INS_REHABILITATE
        } else {
            INS_INVALIDATE
        };
        Self {
            rehabilitate,
            request: case1_request(card_class, ins, 0x00, 0x00, legacy_case1),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn is_rehabilitate(&self) -> bool {
        self.rehabilitate
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, _response: &ApduResponse) -> Result<()> {
        card.set_df_invalidated(!self.rehabilitate);
        Ok(())
    }
}

/// Change Key: replaces a card session key with a new one ciphered by
/// the SAM under the issuer key. Requires a fresh card challenge and
/// must run outside any secure session.
#[derive(Debug)]
pub struct CmdChangeKey {
    key_index: u8,
    new_kif: u8,
    new_kvc: u8,
    issuer_kif: u8,
    issuer_kvc: u8,
    request: ApduRequest,
}

impl CmdChangeKey {
    pub fn new(
        card_class: CardClass,
        key_index: u8,
        new_kif: u8,
        new_kvc: u8,
        issuer_kif: u8,
        issuer_kvc: u8,
    ) -> Result<Self> {
        if !(1..=3).contains(&key_index) {
            return Err(Error::IllegalArgument(format!(
                "key index {} out of range [1, 3]",
                key_index
            )));
        }
        let request = ApduRequest::build(
            card_class.value(),
            INS_CHANGE_KEY,
            0x00,
            key_index,
            Some(&[0u8; CIPHERED_KEY_LENGTH]),
            None,
        );
        Ok(Self {
            key_index,
            new_kif,
            new_kvc,
            issuer_kif,
            issuer_kvc,
            request,
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn finalize(
        &mut self,
        card: &CalypsoCard,
        crypto: &mut dyn SymmetricCryptoSpi,
    ) -> Result<()> {
        let challenge = card.challenge().as_deref().ok_or_else(|| {
            Error::IllegalState("no card challenge available: run Get Challenge first".to_string())
        })?;
        let block = crypto
            .cipher_card_key(
                challenge,
                self.issuer_kif,
                self.issuer_kvc,
                self.new_kif,
                self.new_kvc,
            )
            .map_err(Error::SamIo)?;
        if block.len() != CIPHERED_KEY_LENGTH {
            return Err(Error::InconsistentData(format!(
                "ciphered key block must be {} bytes, got {}",
                CIPHERED_KEY_LENGTH,
                block.len()
            )));
        }
        self.request.patch_data(5, &block);
        Ok(())
    }

    pub fn parse(&mut self, _card: &mut CalypsoCard, _response: &ApduResponse) -> Result<()> {
        trace!(
            "key {} changed to KIF {:02X}h / KVC {:02X}h",
            self.key_index,
            self.new_kif,
            self.new_kvc
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proprietary_ef(sfi: u8, lid: u16, ef_type: u8) -> Vec<u8> {
        let mut info = vec![0u8; PROPRIETARY_INFORMATION_LENGTH];
        info[0] = sfi;
        info[1] = FILE_TYPE_EF;
        info[2] = ef_type;
        info[3] = 29;
        info[4] = 3;
        info[21] = (lid >> 8) as u8;
        info[22] = lid as u8;
        info
    }

    fn fcp(info: &[u8]) -> Vec<u8> {
        let mut out = vec![0x62, (info.len() + 2) as u8, 0x85, info.len() as u8];
        out.extend_from_slice(info);
        out
    }

    #[test]
    fn get_data_tags_encode_p1p2() {
        assert_eq!(
            CmdGetData::new(GetDataTag::EfList).request().apdu(),
            &[0x00, 0xCA, 0x00, 0xC0, 0x00]
        );
        assert_eq!(
            CmdGetData::new(GetDataTag::TraceabilityInformation).request().apdu(),
            &[0x00, 0xCA, 0x01, 0x85, 0x00]
        );
    }

    #[test]
    fn select_file_modes() {
        let by_lid = CmdSelectFile::new(CardClass::Iso, SelectFileMode::ByLid(0x2010));
        assert_eq!(
            by_lid.request().apdu(),
            &[0x00, 0xA4, 0x09, 0x00, 0x02, 0x20, 0x10, 0x00]
        );
        let next = CmdSelectFile::new(CardClass::Iso, SelectFileMode::Next);
        assert_eq!(&next.request().apdu()[2..4], &[0x02, 0x02]);
    }

    #[test]
    fn select_file_parse_ef_header() {
        let mut cmd = CmdSelectFile::new(CardClass::Iso, SelectFileMode::ByLid(0x2010));
        let mut card = CalypsoCard::blank();
        let response =
            ApduResponse::from_parts(&fcp(&proprietary_ef(0x07, 0x2010, 0x02)), 0x9000);
        cmd.parse(&mut card, &response).unwrap();
        let file = card.get_file_by_lid(0x2010).unwrap();
        assert_eq!(file.sfi(), 0x07);
        let header = file.header().clone().unwrap();
        assert_eq!(header.ef_type(), Some(EfType::Linear));
        assert_eq!(header.record_size(), Some(29));
        // the parsed file becomes current
        assert_eq!(card.current_file().unwrap().sfi(), 0x07);
    }

    #[test]
    fn select_file_parse_df_header() {
        let mut info = vec![0u8; PROPRIETARY_INFORMATION_LENGTH];
        info[1] = FILE_TYPE_DF;
        info[13] = 0x01;
        info[14..17].copy_from_slice(&[0x11, 0x22, 0x33]);
        info[17..20].copy_from_slice(&[0x21, 0x27, 0x30]);
        info[21..23].copy_from_slice(&[0x3F, 0x00]);
        let mut cmd = CmdSelectFile::new(CardClass::Iso, SelectFileMode::Current);
        let mut card = CalypsoCard::blank();
        cmd.parse(&mut card, &ApduResponse::from_parts(&fcp(&info), 0x9000))
            .unwrap();
        let header = card.df_header().clone().unwrap();
        assert_eq!(header.lid(), 0x3F00);
        assert_eq!(header.kifs(), &[0x21, 0x27, 0x30]);
        assert_eq!(header.df_status(), 0x01);
    }

    #[test]
    fn ef_list_seeds_headers() {
        let mut cmd = CmdGetData::new(GetDataTag::EfList);
        let mut card = CalypsoCard::blank();
        let list = [
            0xC0, 0x10, //
            0xE3, 0x06, 0x20, 0x01, 0x07, 0x02, 0x1D, 0x04, //
            0xE3, 0x06, 0x20, 0x0A, 0x09, 0x04, 0x1D, 0x03,
        ];
        cmd.parse(&mut card, &ApduResponse::from_parts(&list, 0x9000))
            .unwrap();
        assert_eq!(card.files().len(), 2);
        assert_eq!(
            card.get_file_by_sfi(0x09)
                .unwrap()
                .header()
                .clone()
                .unwrap()
                .ef_type(),
            Some(EfType::Cyclic)
        );
        assert_eq!(card.get_file_by_lid(0x2001).unwrap().sfi(), 0x07);
    }

    #[test]
    fn traceability_information_is_stored() {
        let mut cmd = CmdGetData::new(GetDataTag::TraceabilityInformation);
        let mut card = CalypsoCard::blank();
        cmd.parse(&mut card, &ApduResponse::from_parts(&[1, 2, 3], 0x9000))
            .unwrap();
        assert_eq!(card.traceability_information().as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn invalidate_rehabilitate_flip_the_flag() {
        let mut card = CalypsoCard::blank();
        let mut invalidate = CmdStatusChange::new(CardClass::Iso, false, false);
        assert_eq!(invalidate.request().apdu(), &[0x00, 0x04, 0x00, 0x00, 0x00]);
        invalidate
            .parse(&mut card, &ApduResponse::from_parts(&[], 0x9000))
            .unwrap();
        assert!(card.df_invalidated());
        let mut rehabilitate = CmdStatusChange::new(CardClass::Iso, true, false);
        rehabilitate
            .parse(&mut card, &ApduResponse::from_parts(&[], 0x9000))
            .unwrap();
        assert!(!card.df_invalidated());
    }

    #[test]
    fn change_key_needs_index_in_range() {
        assert!(CmdChangeKey::new(CardClass::Iso, 0, 0x21, 0x79, 0x21, 0x0A).is_err());
        assert!(CmdChangeKey::new(CardClass::Iso, 4, 0x21, 0x79, 0x21, 0x0A).is_err());
        let cmd = CmdChangeKey::new(CardClass::Iso, 2, 0x21, 0x79, 0x21, 0x0A).unwrap();
        assert_eq!(&cmd.request().apdu()[..5], &[0x00, 0xD8, 0x00, 0x02, 0x18]);
    }
}
