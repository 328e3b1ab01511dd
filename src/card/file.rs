//! Elementary files of the card image: headers, record data, counters.

use crate::error::{Error, Result};
use crate::util::{counter_bytes, counter_value};
use getset::{CopyGetters, Getters};
use serde::Serialize;
use std::collections::BTreeMap;
use strum::{AsRefStr, Display};

/// Structural type of an elementary file.
#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "shouty_snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EfType {
    Binary,
    Linear,
    Cyclic,
    SimulatedCounters,
    Counters,
}

impl EfType {
    /// Decode the EF type byte of a file descriptor.
    pub fn from_descriptor_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(EfType::Binary),
            0x02 => Some(EfType::Linear),
            0x04 => Some(EfType::Cyclic),
            0x08 => Some(EfType::SimulatedCounters),
            0x09 => Some(EfType::Counters),
            _ => None,
        }
    }
}

/// Static description of an elementary file, as carried by Select File
/// and Get Data responses. Fields discovered later only fill gaps,
/// known values are never overwritten.
#[derive(Clone, Debug, Default, Getters, CopyGetters, Serialize)]
pub struct FileHeader {
    /// Logical identifier, when known.
    #[get_copy = "pub"]
    lid: Option<u16>,
    #[get_copy = "pub"]
    ef_type: Option<EfType>,
    #[get_copy = "pub"]
    record_size: Option<u8>,
    #[get_copy = "pub"]
    records_number: Option<u8>,
    #[get_copy = "pub"]
    access_conditions: Option<[u8; 4]>,
    #[get_copy = "pub"]
    key_indexes: Option<[u8; 4]>,
    #[get_copy = "pub"]
    df_status: Option<u8>,
    /// Reference of the EF sharing its data with this one.
    #[get_copy = "pub"]
    shared_reference: Option<u16>,
}

impl FileHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lid(mut self, lid: u16) -> Self {
        self.lid = Some(lid);
        self
    }

    pub fn with_ef_type(mut self, ef_type: EfType) -> Self {
        self.ef_type = Some(ef_type);
        self
    }

    pub fn with_record_size(mut self, record_size: u8) -> Self {
        self.record_size = Some(record_size);
        self
    }

    pub fn with_records_number(mut self, records_number: u8) -> Self {
        self.records_number = Some(records_number);
        self
    }

    pub fn with_access_conditions(mut self, ac: [u8; 4]) -> Self {
        self.access_conditions = Some(ac);
        self
    }

    pub fn with_key_indexes(mut self, ki: [u8; 4]) -> Self {
        self.key_indexes = Some(ki);
        self
    }

    pub fn with_df_status(mut self, df_status: u8) -> Self {
        self.df_status = Some(df_status);
        self
    }

    pub fn with_shared_reference(mut self, shared_reference: u16) -> Self {
        self.shared_reference = Some(shared_reference);
        self
    }

    /// Fill the gaps of `self` from `other`, keeping every known value.
    pub fn merge(&mut self, other: &FileHeader) {
        self.lid = self.lid.or(other.lid);
        self.ef_type = self.ef_type.or(other.ef_type);
        self.record_size = self.record_size.or(other.record_size);
        self.records_number = self.records_number.or(other.records_number);
        self.access_conditions = self.access_conditions.or(other.access_conditions);
        self.key_indexes = self.key_indexes.or(other.key_indexes);
        self.df_status = self.df_status.or(other.df_status);
        self.shared_reference = self.shared_reference.or(other.shared_reference);
    }
}

/// Record contents of an elementary file.
///
/// Record files map record number to bytes. Counter files keep the
/// whole counter block as logical record 1, sliced into 3-byte
/// big-endian counters indexed from 1. Cyclic files keep record 1 as
/// the newest record.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileData {
    records: BTreeMap<u8, Vec<u8>>,
}

impl FileData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record_number: u8) -> Option<&[u8]> {
        self.records.get(&record_number).map(Vec::as_slice)
    }

    pub fn records(&self) -> &BTreeMap<u8, Vec<u8>> {
        &self.records
    }

    /// Write `content` at `offset` inside a record, zero-padding any
    /// gap and growing the record as needed.
    pub fn set_content(&mut self, record_number: u8, content: &[u8], offset: usize) {
        let record = self.records.entry(record_number).or_insert_with(Vec::new);
        if record.len() < offset + content.len() {
            record.resize(offset + content.len(), 0);
        }
        record[offset..offset + content.len()].copy_from_slice(content);
    }

    /// Byte-wise OR `content` into a record at `offset`, growing the
    /// record as needed.
    pub fn fill_content(&mut self, record_number: u8, content: &[u8], offset: usize) {
        let record = self.records.entry(record_number).or_insert_with(Vec::new);
        if record.len() < offset + content.len() {
            record.resize(offset + content.len(), 0);
        }
        for (i, b) in content.iter().enumerate() {
            record[offset + i] |= b;
        }
    }

    /// Value of counter `counter_number` (1-based) in the counter
    /// block, when present in full.
    pub fn counter(&self, counter_number: u8) -> Option<u32> {
        debug_assert!(counter_number >= 1);
        let record = self.records.get(&1)?;
        let offset = 3 * (usize::from(counter_number) - 1);
        record.get(offset..offset + 3).map(counter_value)
    }

    /// Write counter `counter_number` (1-based) into the counter block.
    pub fn set_counter(&mut self, counter_number: u8, value: u32) {
        debug_assert!(counter_number >= 1);
        let offset = 3 * (usize::from(counter_number) - 1);
        self.set_content(1, &counter_bytes(value), offset);
    }

    /// Prepend a record to a cyclic file: every record shifts one slot
    /// down and `content` becomes record 1. When the file declares a
    /// record count, records shifted past it fall off.
    pub fn add_cyclic_content(&mut self, content: &[u8], records_number: Option<u8>) {
        let shifted: BTreeMap<u8, Vec<u8>> = std::mem::take(&mut self.records)
            .into_iter()
            .filter_map(|(n, data)| {
                let n = n.checked_add(1)?;
                match records_number {
                    Some(max) if n > max => None,
                    _ => Some((n, data)),
                }
            })
            .collect();
        self.records = shifted;
        self.records.insert(1, content.to_vec());
    }
}

/// One elementary file of the card image: its SFI, its header when
/// known, and its data.
#[derive(Clone, Debug, Getters, CopyGetters, Serialize)]
pub struct ElementaryFile {
    /// Short file identifier; 0 for a LID-only file.
    #[get_copy = "pub"]
    sfi: u8,
    #[get = "pub"]
    header: Option<FileHeader>,
    #[get = "pub"]
    data: FileData,
}

impl ElementaryFile {
    pub fn new(sfi: u8) -> Self {
        Self {
            sfi,
            header: None,
            data: FileData::new(),
        }
    }

    pub fn data_mut(&mut self) -> &mut FileData {
        &mut self.data
    }

    /// Attach or merge a header; known values win over new ones.
    pub fn merge_header(&mut self, header: &FileHeader) {
        match &mut self.header {
            Some(existing) => existing.merge(header),
            None => self.header = Some(header.clone()),
        }
    }

    /// The declared record size, when the header carries one.
    pub fn record_size(&self) -> Option<u8> {
        self.header.as_ref().and_then(FileHeader::record_size)
    }

    /// Record lookup returning a typed error for missing data.
    pub fn record_checked(&self, record_number: u8) -> Result<&[u8]> {
        self.data.record(record_number).ok_or_else(|| {
            Error::DataAccess(format!(
                "record {} of file with SFI {:02X}h is not in the image",
                record_number, self.sfi
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_content_pads_gaps() {
        let mut data = FileData::new();
        data.set_content(1, &[0xAA, 0xBB], 3);
        assert_eq!(data.record(1).unwrap(), &[0x00, 0x00, 0x00, 0xAA, 0xBB]);
        data.set_content(1, &[0x11], 0);
        assert_eq!(data.record(1).unwrap(), &[0x11, 0x00, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn fill_content_ors_bytes() {
        let mut data = FileData::new();
        data.set_content(2, &[0xF0, 0x0F], 0);
        data.fill_content(2, &[0x0F, 0x0F, 0xFF], 0);
        assert_eq!(data.record(2).unwrap(), &[0xFF, 0x0F, 0xFF]);
    }

    #[test]
    fn counters_are_three_byte_slices_of_record_one() {
        let mut data = FileData::new();
        data.set_counter(2, 1000);
        assert_eq!(data.record(1).unwrap(), &[0, 0, 0, 0x00, 0x03, 0xE8]);
        assert_eq!(data.counter(2), Some(1000));
        assert_eq!(data.counter(1), Some(0));
        assert_eq!(data.counter(3), None);
    }

    #[test]
    fn cyclic_prepend_shifts_and_drops() {
        let mut data = FileData::new();
        data.set_content(1, &[1], 0);
        data.set_content(2, &[2], 0);
        data.add_cyclic_content(&[9], Some(2));
        assert_eq!(data.record(1).unwrap(), &[9]);
        assert_eq!(data.record(2).unwrap(), &[1]);
        assert_eq!(data.record(3), None);
    }

    #[test]
    fn header_merge_keeps_known_fields() {
        let mut a = FileHeader::new().with_lid(0x2010).with_record_size(29);
        let b = FileHeader::new()
            .with_lid(0xFFFF)
            .with_records_number(3)
            .with_ef_type(EfType::Linear);
        a.merge(&b);
        assert_eq!(a.lid(), Some(0x2010));
        assert_eq!(a.record_size(), Some(29));
        assert_eq!(a.records_number(), Some(3));
        assert_eq!(a.ef_type(), Some(EfType::Linear));
    }
}
