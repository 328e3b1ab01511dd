//! The in-memory mirror of the selected Calypso application.
//!
//! The image is owned by the transaction engine for the duration of a
//! transaction and is kept in lock-step with the card: command parsers
//! write into it, and a deep snapshot taken at session open restores it
//! atomically if the session aborts.

pub mod file;
pub mod product;
pub mod selection;

use crate::error::{Error, Result};
use crate::transaction::WriteAccessLevel;
use crate::util::{signed_int3, to_hex};
use bitflags::bitflags;
use file::{ElementaryFile, FileHeader};
use getset::{CopyGetters, Getters};
use log::trace;
use product::{CardClass, PatchEffects, ProductType, StartupInfo};
use serde::{Serialize, Serializer};
use std::collections::HashMap;

bitflags! {
    /// Optional capabilities advertised by the application.
    pub struct CardFeatures: u8 {
        const EXTENDED_MODE = 0x01;
        const RATIFICATION_ON_DESELECT = 0x02;
        const SV = 0x04;
        const PIN = 0x08;
        const PKI = 0x10;
        const HCE = 0x20;
    }
}

fn serialize_features<S: Serializer>(f: &CardFeatures, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u8(f.bits())
}

/// Header of the selected DF.
#[derive(Clone, Debug, Default, Getters, CopyGetters, Serialize)]
pub struct DirectoryHeader {
    #[get_copy = "pub"]
    lid: u16,
    #[get_copy = "pub"]
    df_status: u8,
    #[get = "pub"]
    kvcs: [u8; 3],
    #[get = "pub"]
    kifs: [u8; 3],
    #[get = "pub"]
    access_conditions: [u8; 4],
    #[get = "pub"]
    key_indexes: [u8; 4],
}

impl DirectoryHeader {
    pub fn new(
        lid: u16,
        df_status: u8,
        kvcs: [u8; 3],
        kifs: [u8; 3],
        access_conditions: [u8; 4],
        key_indexes: [u8; 4],
    ) -> Self {
        Self {
            lid,
            df_status,
            kvcs,
            kifs,
            access_conditions,
            key_indexes,
        }
    }
}

/// One entry of the SV load log.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters, Serialize)]
pub struct SvLoadLogRecord {
    #[get = "pub"]
    date: [u8; 2],
    #[get_copy = "pub"]
    kvc: u8,
    #[get = "pub"]
    free: [u8; 2],
    #[get_copy = "pub"]
    balance: i32,
    #[get_copy = "pub"]
    amount: i32,
    #[get = "pub"]
    time: [u8; 2],
    #[get = "pub"]
    sam_id: [u8; 4],
    #[get_copy = "pub"]
    sam_tnum: u32,
    #[get_copy = "pub"]
    sv_tnum: u16,
}

impl SvLoadLogRecord {
    /// Decode the 22-byte load log layout:
    /// `date(2) free1(1) kvc(1) free2(1) balance(3) amount(3) time(2)
    /// samId(4) samTNum(3) svTNum(2)`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 22 {
            return Err(Error::UnexpectedResponseLength(format!(
                "SV load log needs 22 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            date: [bytes[0], bytes[1]],
            free: [bytes[2], bytes[4]],
            kvc: bytes[3],
            balance: signed_int3(&bytes[5..8]),
            amount: signed_int3(&bytes[8..11]),
            time: [bytes[11], bytes[12]],
            sam_id: [bytes[13], bytes[14], bytes[15], bytes[16]],
            sam_tnum: crate::util::be_uint(&bytes[17..20]) as u32,
            sv_tnum: crate::util::be_uint(&bytes[20..22]) as u16,
        })
    }
}

/// One entry of the SV debit log.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters, Serialize)]
pub struct SvDebitLogRecord {
    #[get_copy = "pub"]
    amount: i32,
    #[get = "pub"]
    date: [u8; 2],
    #[get = "pub"]
    time: [u8; 2],
    #[get_copy = "pub"]
    kvc: u8,
    #[get = "pub"]
    sam_id: [u8; 4],
    #[get_copy = "pub"]
    sam_tnum: u32,
    #[get_copy = "pub"]
    balance: i32,
    #[get_copy = "pub"]
    sv_tnum: u16,
}

impl SvDebitLogRecord {
    /// Decode the 19-byte debit log layout:
    /// `amount(2) date(2) time(2) kvc(1) samId(4) samTNum(3) balance(3)
    /// svTNum(2)`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 19 {
            return Err(Error::UnexpectedResponseLength(format!(
                "SV debit log needs 19 bytes, got {}",
                bytes.len()
            )));
        }
        let amount = i32::from(i16::from_be_bytes([bytes[0], bytes[1]]));
        Ok(Self {
            amount,
            date: [bytes[2], bytes[3]],
            time: [bytes[4], bytes[5]],
            kvc: bytes[6],
            sam_id: [bytes[7], bytes[8], bytes[9], bytes[10]],
            sam_tnum: crate::util::be_uint(&bytes[11..14]) as u32,
            balance: signed_int3(&bytes[14..17]),
            sv_tnum: crate::util::be_uint(&bytes[17..19]) as u16,
        })
    }
}

/// Deep copy of everything a session abort must roll back.
#[derive(Clone, Debug)]
struct CardSnapshot {
    files: Vec<ElementaryFile>,
    sfi_index: HashMap<u8, usize>,
    lid_index: HashMap<u16, usize>,
    current_ef: Option<usize>,
    df_header: Option<DirectoryHeader>,
    sv_balance: Option<i32>,
    sv_last_tnum: Option<u16>,
}

/// The Calypso card image.
#[derive(Debug, Getters, CopyGetters, Serialize)]
pub struct CalypsoCard {
    #[get_copy = "pub"]
    product_type: ProductType,
    #[get_copy = "pub"]
    card_class: CardClass,
    /// 8-byte application serial number.
    #[get = "pub"]
    serial_number: [u8; 8],
    /// DF name (AID), 1 to 16 bytes.
    #[get = "pub"]
    df_name: Vec<u8>,
    #[get_copy = "pub"]
    startup_info: StartupInfo,
    #[serde(serialize_with = "serialize_features")]
    features: CardFeatures,
    #[get_copy = "pub"]
    df_invalidated: bool,
    /// Remaining-session-buffer base: the full capacity granted at each
    /// session open, in bytes or commands depending on the product.
    #[get_copy = "pub"]
    modifications_counter_max: u32,
    /// Maximum number of data bytes one APDU may carry to this card.
    #[get_copy = "pub"]
    payload_capacity: usize,
    #[get = "pub"]
    df_header: Option<DirectoryHeader>,
    files: Vec<ElementaryFile>,
    #[serde(skip)]
    sfi_index: HashMap<u8, usize>,
    #[serde(skip)]
    lid_index: HashMap<u16, usize>,
    #[serde(skip)]
    current_ef: Option<usize>,
    #[serde(skip)]
    snapshot: Option<CardSnapshot>,
    /// Patch-driven quirks resolved at product detection.
    #[serde(skip)]
    #[get_copy = "pub"]
    patch_effects: PatchEffects,
    /// Whether the previous secure session was ratified, once known.
    #[get_copy = "pub"]
    df_ratified: Option<bool>,
    #[get_copy = "pub"]
    pin_attempt_counter: Option<u8>,
    #[get_copy = "pub"]
    sv_balance: Option<i32>,
    #[get_copy = "pub"]
    sv_last_tnum: Option<u16>,
    #[get_copy = "pub"]
    sv_kvc: Option<u8>,
    #[get_copy = "pub"]
    sv_get_header: Option<[u8; 8]>,
    #[get = "pub"]
    sv_get_data: Option<Vec<u8>>,
    #[get = "pub"]
    sv_load_log: Option<SvLoadLogRecord>,
    #[get = "pub"]
    sv_debit_log: Option<SvDebitLogRecord>,
    /// Card challenge returned by Get Challenge.
    #[get = "pub"]
    challenge: Option<Vec<u8>>,
    #[get = "pub"]
    traceability_information: Option<Vec<u8>>,
    #[serde(skip)]
    #[get_copy = "pub"]
    pre_open_write_access_level: Option<WriteAccessLevel>,
    #[serde(skip)]
    #[get = "pub"]
    pre_open_data_out: Option<Vec<u8>>,
}

impl CalypsoCard {
    pub(crate) fn blank() -> Self {
        Self {
            product_type: ProductType::Unknown,
            card_class: CardClass::Iso,
            serial_number: [0; 8],
            df_name: Vec::new(),
            startup_info: StartupInfo::default(),
            features: CardFeatures::empty(),
            df_invalidated: false,
            modifications_counter_max: 0,
            payload_capacity: 255,
            df_header: None,
            files: Vec::new(),
            sfi_index: HashMap::new(),
            lid_index: HashMap::new(),
            current_ef: None,
            snapshot: None,
            patch_effects: PatchEffects::default(),
            df_ratified: None,
            pin_attempt_counter: None,
            sv_balance: None,
            sv_last_tnum: None,
            sv_kvc: None,
            sv_get_header: None,
            sv_get_data: None,
            sv_load_log: None,
            sv_debit_log: None,
            challenge: None,
            traceability_information: None,
            pre_open_write_access_level: None,
            pre_open_data_out: None,
        }
    }

    /// Whether the card supports the given feature.
    pub fn has_feature(&self, feature: CardFeatures) -> bool {
        self.features.contains(feature)
    }

    pub fn is_extended_mode_supported(&self) -> bool {
        self.has_feature(CardFeatures::EXTENDED_MODE)
    }

    pub fn is_ratification_on_deselect_supported(&self) -> bool {
        self.has_feature(CardFeatures::RATIFICATION_ON_DESELECT)
    }

    /// Whether the session buffer is counted in bytes (otherwise in
    /// commands).
    pub fn is_modifications_counter_in_bytes(&self) -> bool {
        self.product_type.buffer_counted_in_bytes()
    }

    // ---- file set --------------------------------------------------

    pub fn get_file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
        self.sfi_index.get(&sfi).map(|&i| &self.files[i])
    }

    pub fn get_file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
        self.lid_index.get(&lid).map(|&i| &self.files[i])
    }

    /// The file currently selected, when any.
    pub fn current_file(&self) -> Option<&ElementaryFile> {
        self.current_ef.map(|i| &self.files[i])
    }

    /// All files of the image, in discovery order.
    pub fn files(&self) -> &[ElementaryFile] {
        &self.files
    }

    /// Resolve or create the addressed file and make it current.
    ///
    /// With both keys zero the current file is returned. A non-zero SFI
    /// takes precedence over a non-zero LID; an absent file is created
    /// under the given SFI (the LID only lands in the index once a
    /// header carries it).
    pub fn get_or_create_file(&mut self, sfi: u8, lid: u16) -> Result<&mut ElementaryFile> {
        let index = if sfi == 0 && lid == 0 {
            self.current_ef.ok_or_else(|| {
                Error::IllegalState("no current EF: select a file first".to_string())
            })?
        } else if sfi != 0 {
            match self.sfi_index.get(&sfi) {
                Some(&i) => i,
                None => self.insert_file(sfi, lid),
            }
        } else {
            match self.lid_index.get(&lid) {
                Some(&i) => i,
                None => self.insert_file(0, lid),
            }
        };
        self.current_ef = Some(index);
        Ok(&mut self.files[index])
    }

    fn insert_file(&mut self, sfi: u8, lid: u16) -> usize {
        trace!("image: creating EF with SFI {:02X}h, LID {:04X}h", sfi, lid);
        let mut ef = ElementaryFile::new(sfi);
        if lid != 0 {
            ef.merge_header(&FileHeader::new().with_lid(lid));
        }
        let index = self.files.len();
        self.files.push(ef);
        if sfi != 0 {
            self.sfi_index.insert(sfi, index);
        }
        if lid != 0 {
            self.lid_index.insert(lid, index);
        }
        index
    }

    /// Attach or merge a file header; already-known fields win.
    pub fn set_file_header(&mut self, sfi: u8, header: FileHeader) -> Result<()> {
        let lid = header.lid().unwrap_or(0);
        let ef = self.get_or_create_file(sfi, lid)?;
        ef.merge_header(&header);
        let final_lid = ef.header().as_ref().and_then(FileHeader::lid);
        // a header may reveal the LID of a file created by SFI alone
        if let (Some(lid), Some(index)) = (final_lid, self.current_ef) {
            self.lid_index.entry(lid).or_insert(index);
        }
        Ok(())
    }

    pub fn set_content(&mut self, sfi: u8, record_number: u8, content: &[u8]) -> Result<()> {
        self.set_content_at(sfi, record_number, content, 0)
    }

    pub fn set_content_at(
        &mut self,
        sfi: u8,
        record_number: u8,
        content: &[u8],
        offset: usize,
    ) -> Result<()> {
        let ef = self.get_or_create_file(sfi, 0)?;
        ef.data_mut().set_content(record_number, content, offset);
        Ok(())
    }

    pub fn fill_content(
        &mut self,
        sfi: u8,
        record_number: u8,
        content: &[u8],
        offset: usize,
    ) -> Result<()> {
        let ef = self.get_or_create_file(sfi, 0)?;
        ef.data_mut().fill_content(record_number, content, offset);
        Ok(())
    }

    pub fn set_counter(&mut self, sfi: u8, counter_number: u8, value: u32) -> Result<()> {
        let ef = self.get_or_create_file(sfi, 0)?;
        ef.data_mut().set_counter(counter_number, value);
        Ok(())
    }

    pub fn add_cyclic_content(&mut self, sfi: u8, content: &[u8]) -> Result<()> {
        let ef = self.get_or_create_file(sfi, 0)?;
        let records_number = ef.header().as_ref().and_then(FileHeader::records_number);
        ef.data_mut().add_cyclic_content(content, records_number);
        Ok(())
    }

    // ---- snapshot --------------------------------------------------

    /// Deep-copy the file set, DF header and SV state into the shadow
    /// snapshot. Called at session open.
    pub fn backup_files(&mut self) {
        trace!("image: snapshot of {} file(s)", self.files.len());
        self.snapshot = Some(CardSnapshot {
            files: self.files.clone(),
            sfi_index: self.sfi_index.clone(),
            lid_index: self.lid_index.clone(),
            current_ef: self.current_ef,
            df_header: self.df_header.clone(),
            sv_balance: self.sv_balance,
            sv_last_tnum: self.sv_last_tnum,
        });
    }

    /// Restore the shadow snapshot, atomically: every EF, the DF
    /// header, the current-EF selector and the SV fields revert
    /// together. A missing snapshot is a no-op.
    pub fn restore_files(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            trace!("image: restoring snapshot of {} file(s)", snapshot.files.len());
            self.files = snapshot.files;
            self.sfi_index = snapshot.sfi_index;
            self.lid_index = snapshot.lid_index;
            self.current_ef = snapshot.current_ef;
            self.df_header = snapshot.df_header;
            self.sv_balance = snapshot.sv_balance;
            self.sv_last_tnum = snapshot.sv_last_tnum;
        }
    }

    /// Drop the shadow snapshot after a successful close.
    pub fn discard_snapshot(&mut self) {
        self.snapshot = None;
    }

    // ---- dynamic state fed by command parsers ----------------------

    pub(crate) fn set_df_header(&mut self, header: DirectoryHeader) {
        self.df_header = Some(header);
    }

    pub(crate) fn set_df_invalidated(&mut self, invalidated: bool) {
        self.df_invalidated = invalidated;
    }

    pub(crate) fn set_df_ratified(&mut self, ratified: bool) {
        self.df_ratified = Some(ratified);
    }

    pub(crate) fn set_pin_attempt_counter(&mut self, attempts: u8) {
        self.pin_attempt_counter = Some(attempts);
    }

    pub(crate) fn set_challenge(&mut self, challenge: Vec<u8>) {
        self.challenge = Some(challenge);
    }

    pub(crate) fn set_traceability_information(&mut self, info: Vec<u8>) {
        self.traceability_information = Some(info);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_sv_data(
        &mut self,
        kvc: u8,
        header: [u8; 8],
        data: Vec<u8>,
        balance: i32,
        last_tnum: u16,
        load_log: Option<SvLoadLogRecord>,
        debit_log: Option<SvDebitLogRecord>,
    ) {
        trace!("image: SV balance {}, TNum {}", balance, last_tnum);
        self.sv_kvc = Some(kvc);
        self.sv_get_header = Some(header);
        self.sv_get_data = Some(data);
        self.sv_balance = Some(balance);
        self.sv_last_tnum = Some(last_tnum);
        // the read is a fact about the card, not a staged modification:
        // a session rollback must keep it
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.sv_balance = Some(balance);
            snapshot.sv_last_tnum = Some(last_tnum);
        }
        if load_log.is_some() {
            self.sv_load_log = load_log;
        }
        if debit_log.is_some() {
            self.sv_debit_log = debit_log;
        }
    }

    /// Apply the balance delta of a successful SV operation and bump
    /// the transaction number.
    pub(crate) fn apply_sv_operation(&mut self, delta: i32) {
        self.sv_balance = self.sv_balance.map(|b| b + delta);
        self.sv_last_tnum = self.sv_last_tnum.map(|t| t.wrapping_add(1));
    }

    /// Stash the data of an Open Secure Session executed during the
    /// selection step (pre-open mode). A later session open at the same
    /// write access level will synchronize its MAC chain from it.
    pub fn set_pre_open_session(&mut self, level: WriteAccessLevel, data_out: Vec<u8>) {
        trace!(
            "image: pre-open data for {} session: {}",
            level,
            to_hex(&data_out)
        );
        self.pre_open_write_access_level = Some(level);
        self.pre_open_data_out = Some(data_out);
    }

    pub(crate) fn discard_pre_open_session(&mut self) {
        self.pre_open_write_access_level = None;
        self.pre_open_data_out = None;
    }

    // ---- selection-time setters ------------------------------------

    pub(crate) fn set_product(
        &mut self,
        product_type: ProductType,
        card_class: CardClass,
        startup_info: StartupInfo,
    ) {
        self.product_type = product_type;
        self.card_class = card_class;
        self.startup_info = startup_info;
    }

    pub(crate) fn set_serial_number(&mut self, serial: [u8; 8]) {
        self.serial_number = serial;
    }

    pub(crate) fn set_df_name(&mut self, df_name: Vec<u8>) {
        self.df_name = df_name;
    }

    pub(crate) fn set_features(&mut self, features: CardFeatures) {
        self.features = features;
    }

    pub(crate) fn set_modifications_counter_max(&mut self, max: u32) {
        self.modifications_counter_max = max;
    }

    pub(crate) fn set_payload_capacity(&mut self, capacity: usize) {
        self.payload_capacity = capacity;
    }

    pub(crate) fn set_patch_effects(&mut self, effects: PatchEffects) {
        self.patch_effects = effects;
        if let Some(capacity) = effects.payload_capacity {
            self.payload_capacity = capacity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> CalypsoCard {
        CalypsoCard::blank()
    }

    #[test]
    fn get_or_create_by_sfi_sets_current() {
        let mut card = card();
        assert!(card.current_file().is_none());
        card.get_or_create_file(0x07, 0).unwrap();
        assert_eq!(card.current_file().unwrap().sfi(), 0x07);
        assert!(card.get_file_by_sfi(0x07).is_some());
        assert!(card.get_file_by_sfi(0x08).is_none());
    }

    #[test]
    fn get_or_create_without_keys_needs_current() {
        let mut card = card();
        assert!(matches!(
            card.get_or_create_file(0, 0),
            Err(Error::IllegalState(_))
        ));
        card.get_or_create_file(0x07, 0).unwrap();
        assert_eq!(card.get_or_create_file(0, 0).unwrap().sfi(), 0x07);
    }

    #[test]
    fn lid_only_files_do_not_collide() {
        let mut card = card();
        card.get_or_create_file(0, 0x2001).unwrap();
        card.get_or_create_file(0, 0x2010).unwrap();
        assert_eq!(card.files().len(), 2);
        assert!(card.get_file_by_lid(0x2001).is_some());
        assert!(card.get_file_by_lid(0x2010).is_some());
    }

    #[test]
    fn header_reveals_lid_of_sfi_file() {
        let mut card = card();
        card.get_or_create_file(0x08, 0).unwrap();
        assert!(card.get_file_by_lid(0x2010).is_none());
        card.set_file_header(0x08, FileHeader::new().with_lid(0x2010))
            .unwrap();
        assert_eq!(card.get_file_by_lid(0x2010).unwrap().sfi(), 0x08);
    }

    #[test]
    fn header_merge_never_overwrites(){
        let mut card = card();
        card.set_file_header(0x08, FileHeader::new().with_record_size(29))
            .unwrap();
        card.set_file_header(0x08, FileHeader::new().with_record_size(10).with_records_number(4))
            .unwrap();
        let header = card.get_file_by_sfi(0x08).unwrap().header().clone().unwrap();
        assert_eq!(header.record_size(), Some(29));
        assert_eq!(header.records_number(), Some(4));
    }

    #[test]
    fn snapshot_roundtrip_restores_everything() {
        let mut card = card();
        card.set_content(0x07, 1, &[0x01, 0x02]).unwrap();
        card.set_sv_data(0x42, [0; 8], vec![], 1000, 42, None, None);
        card.backup_files();
        card.set_content(0x07, 1, &[0xFF, 0xFF]).unwrap();
        card.set_content(0x09, 1, &[0xAA]).unwrap();
        card.apply_sv_operation(-150);
        assert_eq!(card.sv_balance(), Some(850));
        card.restore_files();
        assert_eq!(
            card.get_file_by_sfi(0x07).unwrap().data().record(1).unwrap(),
            &[0x01, 0x02]
        );
        assert!(card.get_file_by_sfi(0x09).is_none());
        assert_eq!(card.sv_balance(), Some(1000));
        assert_eq!(card.sv_last_tnum(), Some(42));
        assert_eq!(card.current_file().unwrap().sfi(), 0x07);
    }

    #[test]
    fn restore_without_snapshot_is_noop() {
        let mut card = card();
        card.set_content(0x07, 1, &[0x01]).unwrap();
        card.restore_files();
        assert!(card.get_file_by_sfi(0x07).is_some());
    }

    #[test]
    fn sv_log_layouts() {
        let mut load = vec![0u8; 22];
        load[0..2].copy_from_slice(&[0x12, 0x34]); // date
        load[3] = 0x42; // kvc
        load[5..8].copy_from_slice(&[0x00, 0x03, 0xE8]); // balance 1000
        load[8..11].copy_from_slice(&[0x00, 0x00, 0x96]); // amount 150
        load[20..22].copy_from_slice(&[0x00, 0x2A]); // svTNum 42
        let rec = SvLoadLogRecord::parse(&load).unwrap();
        assert_eq!(rec.balance(), 1000);
        assert_eq!(rec.amount(), 150);
        assert_eq!(rec.kvc(), 0x42);
        assert_eq!(rec.sv_tnum(), 42);

        let mut debit = vec![0u8; 19];
        debit[0..2].copy_from_slice(&[0xFF, 0x6A]); // amount -150
        debit[14..17].copy_from_slice(&[0x00, 0x03, 0x52]); // balance 850
        let rec = SvDebitLogRecord::parse(&debit).unwrap();
        assert_eq!(rec.amount(), -150);
        assert_eq!(rec.balance(), 850);
    }
}
