//! Read-side commands: Read Records, Read Record Multiple, Read
//! Binary and Search Record Multiple.

use crate::apdu::{ApduRequest, ApduResponse};
use crate::card::product::CardClass;
use crate::card::CalypsoCard;
use crate::error::{Error, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};

const INS_READ_RECORDS: u8 = 0xB2;
const INS_READ_RECORD_MULTIPLE: u8 = 0xB3;
const INS_READ_BINARY: u8 = 0xB0;
const INS_SEARCH_RECORD_MULTIPLE: u8 = 0xA2;

/// P2 low bits selecting the read mode.
const MODE_ONE_RECORD: u8 = 0x04;
const MODE_MULTIPLE_RECORDS: u8 = 0x05;
const MODE_SEARCH: u8 = 0x07;

/// Read Records, one record or a run of consecutive records.
#[derive(Debug)]
pub struct CmdReadRecords {
    sfi: u8,
    first_record: u8,
    /// Size of one record, used to split a multiple-records payload.
    record_size: u8,
    multiple: bool,
    request: ApduRequest,
}

impl CmdReadRecords {
    pub fn new(
        card_class: CardClass,
        sfi: u8,
        first_record: u8,
        record_size: u8,
        multiple: bool,
        expected_length: u8,
    ) -> Result<Self> {
        check_sfi(sfi)?;
        check_record_number(first_record)?;
        let mode = if multiple {
            MODE_MULTIPLE_RECORDS
        } else {
            MODE_ONE_RECORD
        };
        let request = ApduRequest::build(
            card_class.value(),
            INS_READ_RECORDS,
            first_record,
            sfi * 8 + mode,
            None,
            Some(expected_length),
        );
        Ok(Self {
            sfi,
            first_record,
            record_size,
            multiple,
            request,
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let data = response.data_out();
        if !self.multiple {
            return card.set_content(self.sfi, self.first_record, data);
        }
        let size = usize::from(self.record_size);
        if size == 0 || data.len() % size != 0 {
            return Err(Error::UnexpectedResponseLength(format!(
                "multiple-records payload of {} bytes does not split into {}-byte records",
                data.len(),
                size
            )));
        }
        for (i, chunk) in data.chunks(size).enumerate() {
            card.set_content(self.sfi, self.first_record + i as u8, chunk)?;
        }
        Ok(())
    }
}

/// Read Record Multiple: the same slice of several consecutive records.
#[derive(Debug)]
pub struct CmdReadRecordMultiple {
    sfi: u8,
    first_record: u8,
    offset: u8,
    length: u8,
    request: ApduRequest,
}

impl CmdReadRecordMultiple {
    pub fn new(
        card_class: CardClass,
        sfi: u8,
        first_record: u8,
        offset: u8,
        length: u8,
    ) -> Result<Self> {
        check_sfi(sfi)?;
        check_record_number(first_record)?;
        if length == 0 {
            return Err(Error::IllegalArgument("length must not be 0".to_string()));
        }
        // offset data object: tag 54h, 2-byte offset
        let data = [0x54, 0x02, 0x00, offset];
        let request = ApduRequest::build(
            card_class.value(),
            INS_READ_RECORD_MULTIPLE,
            first_record,
            sfi * 8 + MODE_MULTIPLE_RECORDS,
            Some(&data),
            Some(0x00),
        );
        Ok(Self {
            sfi,
            first_record,
            offset,
            length,
            request,
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let data = response.data_out();
        let size = usize::from(self.length);
        if data.len() % size != 0 {
            return Err(Error::UnexpectedResponseLength(format!(
                "partial-records payload of {} bytes does not split into {}-byte slices",
                data.len(),
                size
            )));
        }
        for (i, chunk) in data.chunks(size).enumerate() {
            card.set_content_at(
                self.sfi,
                self.first_record + i as u8,
                chunk,
                usize::from(self.offset),
            )?;
        }
        Ok(())
    }
}

/// Read Binary with the ISO short-SFI addressing rule.
#[derive(Debug)]
pub struct CmdReadBinary {
    sfi: u8,
    offset: u16,
    request: ApduRequest,
}

impl CmdReadBinary {
    pub fn new(card_class: CardClass, sfi: u8, offset: u16, length: u8) -> Result<Self> {
        check_sfi(sfi)?;
        check_binary_offset(sfi, offset)?;
        let (p1, p2) = binary_address(sfi, offset);
        let request = ApduRequest::build(
            card_class.value(),
            INS_READ_BINARY,
            p1,
            p2,
            None,
            Some(length),
        );
        Ok(Self { sfi, offset, request })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        card.set_content_at(self.sfi, 1, response.data_out(), usize::from(self.offset))
    }
}

/// Parameters of a Search Record Multiple command.
#[derive(Builder, Clone, Debug, Getters, CopyGetters)]
#[builder(pattern = "owned", setter(into), build_fn(error = "crate::error::Error"))]
pub struct SearchCommandData {
    #[get_copy = "pub"]
    sfi: u8,
    #[get_copy = "pub"]
    #[builder(default = "1")]
    first_record: u8,
    #[get_copy = "pub"]
    #[builder(default = "0")]
    offset: u8,
    /// The pattern searched in each record at `offset`.
    #[get = "pub"]
    search_data: Vec<u8>,
    /// Bit mask applied to the record bytes before comparison; empty
    /// means an exact match.
    #[get = "pub"]
    #[builder(default)]
    mask: Vec<u8>,
    /// Also fetch the content of the first matching record.
    #[get_copy = "pub"]
    #[builder(default = "false")]
    fetch_first_result: bool,
}

/// Search Record Multiple.
#[derive(Debug)]
pub struct CmdSearchRecordMultiple {
    data: SearchCommandData,
    request: ApduRequest,
    matching_records: Vec<u8>,
}

impl CmdSearchRecordMultiple {
    pub fn new(card_class: CardClass, data: SearchCommandData) -> Result<Self> {
        check_sfi(data.sfi())?;
        check_record_number(data.first_record())?;
        if data.search_data().is_empty() || data.search_data().len() > 250 {
            return Err(Error::IllegalArgument(
                "search data must hold 1 to 250 bytes".to_string(),
            ));
        }
        if !data.mask().is_empty() && data.mask().len() != data.search_data().len() {
            return Err(Error::IllegalArgument(
                "mask and search data lengths differ".to_string(),
            ));
        }
        let mut data_in = Vec::with_capacity(4 + 2 * data.search_data().len());
        data_in.push(data.offset());
        data_in.push(if data.fetch_first_result() { 0x01 } else { 0x00 });
        data_in.push(data.search_data().len() as u8);
        data_in.extend_from_slice(data.search_data());
        data_in.push(data.mask().len() as u8);
        data_in.extend_from_slice(data.mask());
        let request = ApduRequest::build(
            card_class.value(),
            INS_SEARCH_RECORD_MULTIPLE,
            data.first_record(),
            data.sfi() * 8 + MODE_SEARCH,
            Some(&data_in),
            Some(0x00),
        );
        Ok(Self {
            data,
            request,
            matching_records: Vec::new(),
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    /// Record numbers that matched the search, in card order.
    pub fn matching_records(&self) -> &[u8] {
        &self.matching_records
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let payload = response.data_out();
        if payload.is_empty() {
            return Err(Error::UnexpectedResponseLength(
                "empty search response".to_string(),
            ));
        }
        let count = usize::from(payload[0]);
        if payload.len() < 1 + count {
            return Err(Error::UnexpectedResponseLength(format!(
                "search response announces {} match(es) in {} bytes",
                count,
                payload.len()
            )));
        }
        self.matching_records = payload[1..1 + count].to_vec();
        if self.data.fetch_first_result() && count > 0 {
            let first = self.matching_records[0];
            card.set_content(self.data.sfi(), first, &payload[1 + count..])?;
        }
        Ok(())
    }
}

pub(crate) fn check_sfi(sfi: u8) -> Result<()> {
    if sfi > 0x1E {
        return Err(Error::IllegalArgument(format!("SFI {:02X}h out of range", sfi)));
    }
    Ok(())
}

pub(crate) fn check_record_number(record_number: u8) -> Result<()> {
    if record_number == 0 {
        return Err(Error::IllegalArgument(
            "record numbers start at 1".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn check_binary_offset(sfi: u8, offset: u16) -> Result<()> {
    if sfi != 0 && offset > 255 {
        return Err(Error::IllegalArgument(format!(
            "offset {} needs the current-EF addressing form (SFI must be 0)",
            offset
        )));
    }
    if offset > 0x7FFF {
        return Err(Error::IllegalArgument(format!("offset {} out of range", offset)));
    }
    Ok(())
}

/// P1/P2 of a binary command: SFI in P1 with its marker bit when the
/// offset fits a byte, otherwise a 15-bit offset.
pub(crate) fn binary_address(sfi: u8, offset: u16) -> (u8, u8) {
    if sfi != 0 {
        (0x80 | sfi, offset as u8)
    } else {
        ((offset >> 8) as u8, offset as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_one_record_encoding() {
        let cmd = CmdReadRecords::new(CardClass::Iso, 0x07, 1, 0, false, 0x00).unwrap();
        assert_eq!(cmd.request().apdu(), &[0x00, 0xB2, 0x01, 0x3C, 0x00]);
    }

    #[test]
    fn read_multiple_records_encoding_and_split() {
        let mut cmd = CmdReadRecords::new(CardClass::Iso, 0x08, 2, 3, true, 0x00).unwrap();
        assert_eq!(cmd.request().apdu(), &[0x00, 0xB2, 0x02, 0x45, 0x00]);
        let mut card = CalypsoCard::blank();
        let response = ApduResponse::from_parts(&[1, 1, 1, 2, 2, 2], 0x9000);
        cmd.parse(&mut card, &response).unwrap();
        let file = card.get_file_by_sfi(0x08).unwrap();
        assert_eq!(file.data().record(2).unwrap(), &[1, 1, 1]);
        assert_eq!(file.data().record(3).unwrap(), &[2, 2, 2]);
    }

    #[test]
    fn read_records_populates_image() {
        let mut cmd = CmdReadRecords::new(CardClass::Iso, 0x07, 1, 0, false, 0x1D).unwrap();
        let mut card = CalypsoCard::blank();
        let payload: Vec<u8> = (1..=29).collect();
        cmd.parse(&mut card, &ApduResponse::from_parts(&payload, 0x9000))
            .unwrap();
        assert_eq!(
            card.get_file_by_sfi(0x07).unwrap().data().record(1).unwrap(),
            payload.as_slice()
        );
    }

    #[test]
    fn read_record_multiple_writes_at_offset() {
        let mut cmd = CmdReadRecordMultiple::new(CardClass::Iso, 0x07, 1, 4, 2).unwrap();
        assert_eq!(
            cmd.request().apdu(),
            &[0x00, 0xB3, 0x01, 0x3D, 0x04, 0x54, 0x02, 0x00, 0x04, 0x00]
        );
        let mut card = CalypsoCard::blank();
        cmd.parse(&mut card, &ApduResponse::from_parts(&[0xAA, 0xBB, 0xCC, 0xDD], 0x9000))
            .unwrap();
        let file = card.get_file_by_sfi(0x07).unwrap();
        assert_eq!(file.data().record(1).unwrap(), &[0, 0, 0, 0, 0xAA, 0xBB]);
        assert_eq!(file.data().record(2).unwrap(), &[0, 0, 0, 0, 0xCC, 0xDD]);
    }

    #[test]
    fn read_binary_addressing() {
        let cmd = CmdReadBinary::new(CardClass::Iso, 0x0A, 0x10, 0x20).unwrap();
        assert_eq!(cmd.request().apdu(), &[0x00, 0xB0, 0x8A, 0x10, 0x20]);
        let cmd = CmdReadBinary::new(CardClass::Iso, 0, 0x1234, 0x08).unwrap();
        assert_eq!(cmd.request().apdu(), &[0x00, 0xB0, 0x12, 0x34, 0x08]);
        assert!(CmdReadBinary::new(CardClass::Iso, 0x0A, 0x100, 1).is_err());
    }

    #[test]
    fn search_record_multiple_roundtrip() {
        let data = SearchCommandDataBuilder::default()
            .sfi(0x0Au8)
            .search_data(vec![0x12, 0x34])
            .fetch_first_result(true)
            .build()
            .unwrap();
        let mut cmd = CmdSearchRecordMultiple::new(CardClass::Iso, data).unwrap();
        assert_eq!(
            cmd.request().apdu(),
            &[0x00, 0xA2, 0x01, 0x57, 0x06, 0x00, 0x01, 0x02, 0x12, 0x34, 0x00, 0x00]
        );
        let mut card = CalypsoCard::blank();
        let response = ApduResponse::from_parts(&[0x02, 0x02, 0x05, 0x12, 0x34, 0x56], 0x9000);
        cmd.parse(&mut card, &response).unwrap();
        assert_eq!(cmd.matching_records(), &[2, 5]);
        assert_eq!(
            card.get_file_by_sfi(0x0A).unwrap().data().record(2).unwrap(),
            &[0x12, 0x34, 0x56]
        );
    }

    #[test]
    fn search_mask_length_checked() {
        let data = SearchCommandDataBuilder::default()
            .sfi(0x0Au8)
            .search_data(vec![0x12, 0x34])
            .mask(vec![0xFF])
            .build()
            .unwrap();
        assert!(CmdSearchRecordMultiple::new(CardClass::Iso, data).is_err());
    }
}
