//! Modifying commands on records and binary files: Update, Write and
//! Append Record, Update and Write Binary. All of them stage data in
//! the card's session buffer when sent inside a secure session.

use crate::apdu::{ApduRequest, ApduResponse};
use crate::card::product::CardClass;
use crate::card::CalypsoCard;
use crate::command::read::{binary_address, check_binary_offset, check_record_number, check_sfi};
use crate::error::{Error, Result};

const INS_UPDATE_RECORD: u8 = 0xDC;
const INS_WRITE_RECORD: u8 = 0xD2;
const INS_APPEND_RECORD: u8 = 0xE2;
const INS_UPDATE_BINARY: u8 = 0xD6;
const INS_WRITE_BINARY: u8 = 0xD0;

/// How the record data lands in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWriteMode {
    /// Replace the whole record.
    Update,
    /// Bitwise OR into the record (the card write semantics).
    Write,
    /// Prepend to a cyclic file.
    Append,
}

/// Update Record, Write Record or Append Record.
#[derive(Debug)]
pub struct CmdModifyRecord {
    mode: RecordWriteMode,
    sfi: u8,
    record_number: u8,
    data: Vec<u8>,
    request: ApduRequest,
}

impl CmdModifyRecord {
    pub fn new(
        card_class: CardClass,
        mode: RecordWriteMode,
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
        payload_capacity: usize,
    ) -> Result<Self> {
        check_sfi(sfi)?;
        if mode != RecordWriteMode::Append {
            check_record_number(record_number)?;
        }
        if data.is_empty() || data.len() > payload_capacity {
            return Err(Error::IllegalArgument(format!(
                "record data must hold 1 to {} bytes, got {}",
                payload_capacity,
                data.len()
            )));
        }
        let (ins, p1, p2) = match mode {
            RecordWriteMode::Update => (INS_UPDATE_RECORD, record_number, sfi * 8 + 4),
            RecordWriteMode::Write => (INS_WRITE_RECORD, record_number, sfi * 8 + 4),
            RecordWriteMode::Append => (INS_APPEND_RECORD, 0x00, sfi * 8),
        };
        let request = ApduRequest::build(card_class.value(), ins, p1, p2, Some(&data), None);
        Ok(Self {
            mode,
            sfi,
            record_number,
            data,
            request,
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn mode(&self) -> RecordWriteMode {
        self.mode
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, _response: &ApduResponse) -> Result<()> {
        match self.mode {
            RecordWriteMode::Update => card.set_content(self.sfi, self.record_number, &self.data),
            RecordWriteMode::Write => card.fill_content(self.sfi, self.record_number, &self.data, 0),
            RecordWriteMode::Append => card.add_cyclic_content(self.sfi, &self.data),
        }
    }
}

/// Update Binary or Write Binary.
#[derive(Debug)]
pub struct CmdModifyBinary {
    update: bool,
    sfi: u8,
    offset: u16,
    data: Vec<u8>,
    request: ApduRequest,
}

impl CmdModifyBinary {
    pub fn new(
        card_class: CardClass,
        update: bool,
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
        payload_capacity: usize,
    ) -> Result<Self> {
        check_sfi(sfi)?;
        check_binary_offset(sfi, offset)?;
        if data.is_empty() || data.len() > payload_capacity {
            return Err(Error::IllegalArgument(format!(
                "binary data must hold 1 to {} bytes, got {}",
                payload_capacity,
                data.len()
            )));
        }
        let ins = if update { INS_UPDATE_BINARY } else { INS_WRITE_BINARY };
        let (p1, p2) = binary_address(sfi, offset);
        let request = ApduRequest::build(card_class.value(), ins, p1, p2, Some(&data), None);
        Ok(Self {
            update,
            sfi,
            offset,
            data,
            request,
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn is_update(&self) -> bool {
        self.update
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, _response: &ApduResponse) -> Result<()> {
        let offset = usize::from(self.offset);
        if self.update {
            card.set_content_at(self.sfi, 1, &self.data, offset)
        } else {
            card.fill_content(self.sfi, 1, &self.data, offset)
        }
    }
}
