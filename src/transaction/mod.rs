//! The card transaction engine: prepared commands accumulate in a
//! pipeline, `process_commands` drives them through the reader while
//! chaining the session MAC in the SAM, and the secure session state
//! machine guarantees atomic rollback of the card image on abort.

pub mod buffer;
pub mod settings;

pub use crate::command::misc::{GetDataTag, SelectFileMode};
pub use crate::command::read::{SearchCommandData, SearchCommandDataBuilder};
pub use crate::command::sv::SvOperation;
pub use settings::{SecuritySetting, SecuritySettingBuilder, WriteAccessLevel};

use crate::apdu::{ApduResponse, CardRequest, ChannelControl};
use crate::card::product::ProductType;
use crate::card::CalypsoCard;
use crate::card::CardFeatures;
use crate::command::counter::CmdIncreaseDecrease;
use crate::command::misc::{CmdChangeKey, CmdGetData, CmdSelectFile, CmdStatusChange};
use crate::command::pin::{ChangePinMode, CmdChangePin, CmdGetChallenge, CmdVerifyPin, VerifyPinMode};
use crate::command::read::{
    CmdReadBinary, CmdReadRecordMultiple, CmdReadRecords, CmdSearchRecordMultiple,
};
use crate::command::session::{
    CmdCloseSecureSession, CmdOpenSecureSession, CmdRatification, OpenSessionVariant,
    ParsedOpenSession,
};
use crate::command::sv::{CmdSvDebitOrUndebit, CmdSvGet, CmdSvReload};
use crate::command::write::{CmdModifyBinary, CmdModifyRecord, RecordWriteMode};
use crate::command::CardCommand;
use crate::error::{Error, Result};
use crate::spi::CardReader;
use crate::util::to_hex;
use buffer::SessionBuffer;
use log::{debug, trace, warn};

/// State of the secure session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    Open,
    Closing,
    Aborted,
}

/// Live data of an open secure session.
#[derive(Debug)]
struct SessionState {
    write_access_level: WriteAccessLevel,
    extended_mode: bool,
    buffer: SessionBuffer,
    postponed_count: u8,
    sv_postponed_index: Option<u8>,
    sv_in_session: bool,
    encryption_active: bool,
}

/// A pipeline entry: the command plus its execution context.
#[derive(Debug)]
struct PreparedCommand {
    command: CardCommand,
    /// The command's APDUs take part in the session MAC chain.
    in_session: bool,
    /// The command's APDUs are enciphered on the wire.
    encryption_active: bool,
    /// The MAC chain already covers this command.
    synchronized: bool,
}

/// The transaction manager owning the card image, the pipeline and the
/// reader for the duration of a transaction.
///
/// All `prepare_*` methods are pure in-memory operations;
/// [`Self::process_commands`] is the only point where I/O happens.
pub struct CardTransactionManager {
    reader: Box<dyn CardReader>,
    card: CalypsoCard,
    security: Option<SecuritySetting>,
    pipeline: Vec<PreparedCommand>,
    phase: SessionPhase,
    session: Option<SessionState>,
    /// The regular close of the current session reached the card.
    close_engaged: bool,
    /// Matching record numbers of the processed search commands, in
    /// pipeline order.
    search_results: Vec<Vec<u8>>,
    /// Operation of the last prepared command when it was an SV Get;
    /// the anchor of the SV binding rule.
    last_sv_get: Option<SvOperation>,
}

impl std::fmt::Debug for CardTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardTransactionManager")
            .field("reader", &"Box<dyn CardReader>")
            .field("card", &self.card)
            .field("security", &self.security)
            .field("pipeline", &self.pipeline)
            .field("phase", &self.phase)
            .field("session", &self.session)
            .field("close_engaged", &self.close_engaged)
            .field("search_results", &self.search_results)
            .field("last_sv_get", &self.last_sv_get)
            .finish()
    }
}

impl CardTransactionManager {
    /// Build a manager for a selected card. Secured operations need a
    /// [`SecuritySetting`]; a manager without one can still run plain
    /// read/write flows outside any session.
    pub fn new(
        reader: Box<dyn CardReader>,
        card: CalypsoCard,
        security: Option<SecuritySetting>,
    ) -> Self {
        Self {
            reader,
            card,
            security,
            pipeline: Vec::new(),
            phase: SessionPhase::Idle,
            session: None,
            close_engaged: false,
            search_results: Vec::new(),
            last_sv_get: None,
        }
    }

    /// The card image, kept in lock-step with the card.
    pub fn card(&self) -> &CalypsoCard {
        &self.card
    }

    /// Release the card image at the end of the transaction.
    pub fn into_card(self) -> CalypsoCard {
        self.card
    }

    /// Matching record numbers collected by the search commands of the
    /// last `process_commands` call, in pipeline order.
    pub fn search_results(&self) -> &[Vec<u8>] {
        &self.search_results
    }

    /// Remaining session-buffer units of the open session, if any.
    pub fn session_buffer_remaining(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.buffer.remaining())
    }

    // ---- session lifecycle -----------------------------------------

    /// Open a secure session at the given write access level.
    ///
    /// When the card carries pre-open data for the same level, the MAC
    /// chain is synchronized from it and the replayed card response is
    /// checked against it; pre-open data for another level is
    /// discarded.
    pub fn prepare_open_secure_session(&mut self, level: WriteAccessLevel) -> Result<&mut Self> {
        if self.phase == SessionPhase::Open || self.phase == SessionPhase::Closing {
            return Err(Error::IllegalState(
                "a secure session is already open".to_string(),
            ));
        }
        let pre_open = match self.card.pre_open_write_access_level() {
            Some(l) if l == level && self.card.pre_open_data_out().is_some() => true,
            Some(_) => {
                debug!("pre-open data for another access level, discarding");
                self.card.discard_pre_open_session();
                false
            }
            None => false,
        };
        let security = self
            .security
            .as_mut()
            .ok_or_else(|| Error::IllegalState("no security setting available".to_string()))?;
        let extended_mode = self.card.is_extended_mode_supported()
            && security.crypto_ref().is_extended_mode_supported();
        let terminal_challenge = security
            .crypto()
            .init_terminal_session_context()
            .map_err(Error::SamIo)?;
        let command = CmdOpenSecureSession::new(
            self.card.card_class(),
            open_session_variant(self.card.product_type()),
            extended_mode,
            pre_open,
            level,
            0,
            0,
            &terminal_challenge,
        )?;
        let card_max = self.card.modifications_counter_max();
        let max = match self.card.product_type() {
            ProductType::Basic => security.basic_modifications_counter().unwrap_or(card_max),
            _ => card_max,
        };
        let buffer = SessionBuffer::new(max, self.card.is_modifications_counter_in_bytes());
        self.card.backup_files();
        self.enqueue(CardCommand::OpenSecureSession(command))?;
        self.session = Some(SessionState {
            write_access_level: level,
            extended_mode,
            buffer,
            postponed_count: 0,
            sv_postponed_index: None,
            sv_in_session: false,
            encryption_active: false,
        });
        self.phase = SessionPhase::Open;
        self.close_engaged = false;
        debug!(
            "secure session prepared ({}, extended={}, pre_open={})",
            level, extended_mode, pre_open
        );
        Ok(self)
    }

    /// Close the secure session. With the ratification mechanism
    /// enabled the close defers ratification and a benign ratification
    /// APDU follows it; both are transmitted regardless of the close's
    /// outcome.
    pub fn prepare_close_secure_session(&mut self) -> Result<&mut Self> {
        if self.phase != SessionPhase::Open {
            return Err(Error::IllegalState("no secure session open".to_string()));
        }
        let (extended_mode, sv_postponed_index) = {
            let session = self.session.as_ref().expect("open session state");
            (session.extended_mode, session.sv_postponed_index)
        };
        let ratification_deferred = self
            .security
            .as_ref()
            .map_or(false, SecuritySetting::ratification_mechanism_enabled);
        let close = CmdCloseSecureSession::new(
            self.card.card_class(),
            extended_mode,
            ratification_deferred,
            sv_postponed_index,
        );
        self.enqueue(CardCommand::CloseSecureSession(close))?;
        if ratification_deferred {
            let ratification = CmdRatification::new(self.card.card_class());
            self.enqueue(CardCommand::Ratification(ratification))?;
        }
        self.phase = SessionPhase::Closing;
        Ok(self)
    }

    /// Cancel the secure session: the card discards the staged
    /// modifications and the image rolls back to its pre-open state.
    pub fn prepare_cancel_secure_session(&mut self) -> Result<&mut Self> {
        if self.phase != SessionPhase::Open {
            return Err(Error::IllegalState("no secure session open".to_string()));
        }
        let cancel = CmdCloseSecureSession::new_cancellation(self.card.card_class());
        self.enqueue(CardCommand::CloseSecureSession(cancel))?;
        self.phase = SessionPhase::Closing;
        Ok(self)
    }

    // ---- read commands ---------------------------------------------

    /// Read one record.
    pub fn prepare_read_record(&mut self, sfi: u8, record_number: u8) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command =
            CmdReadRecords::new(self.card.card_class(), sfi, record_number, 0, false, 0x00)?;
        self.enqueue(CardCommand::ReadRecords(command))?;
        Ok(self)
    }

    /// Read consecutive records of `record_size` bytes each, starting
    /// at `first_record`.
    pub fn prepare_read_records(
        &mut self,
        sfi: u8,
        first_record: u8,
        record_size: u8,
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command =
            CmdReadRecords::new(self.card.card_class(), sfi, first_record, record_size, true, 0x00)?;
        self.enqueue(CardCommand::ReadRecords(command))?;
        Ok(self)
    }

    /// Read the first `count` counters of a counter file.
    pub fn prepare_read_counters(&mut self, sfi: u8, count: u8) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command = CmdReadRecords::new(
            self.card.card_class(),
            sfi,
            1,
            0,
            false,
            count.saturating_mul(3),
        )?;
        self.enqueue(CardCommand::ReadRecords(command))?;
        Ok(self)
    }

    /// Read the same `length`-byte slice at `offset` of several
    /// consecutive records.
    pub fn prepare_read_records_partially(
        &mut self,
        sfi: u8,
        first_record: u8,
        offset: u8,
        length: u8,
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command =
            CmdReadRecordMultiple::new(self.card.card_class(), sfi, first_record, offset, length)?;
        self.enqueue(CardCommand::ReadRecordMultiple(command))?;
        Ok(self)
    }

    /// Read `length` bytes of a binary file at `offset`.
    pub fn prepare_read_binary(&mut self, sfi: u8, offset: u16, length: u8) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command = CmdReadBinary::new(self.card.card_class(), sfi, offset, length)?;
        self.enqueue(CardCommand::ReadBinary(command))?;
        Ok(self)
    }

    /// Search records matching a pattern; see [`SearchCommandData`].
    pub fn prepare_search_records(&mut self, data: SearchCommandData) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command = CmdSearchRecordMultiple::new(self.card.card_class(), data)?;
        self.enqueue(CardCommand::SearchRecordMultiple(command))?;
        Ok(self)
    }

    // ---- modifying commands ----------------------------------------

    /// Replace the content of a record.
    pub fn prepare_update_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    ) -> Result<&mut Self> {
        self.prepare_modify_record(RecordWriteMode::Update, sfi, record_number, data)
    }

    /// OR data into a record.
    pub fn prepare_write_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    ) -> Result<&mut Self> {
        self.prepare_modify_record(RecordWriteMode::Write, sfi, record_number, data)
    }

    /// Prepend a record to a cyclic file.
    pub fn prepare_append_record(&mut self, sfi: u8, data: Vec<u8>) -> Result<&mut Self> {
        self.prepare_modify_record(RecordWriteMode::Append, sfi, 0, data)
    }

    fn prepare_modify_record(
        &mut self,
        mode: RecordWriteMode,
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command = CmdModifyRecord::new(
            self.card.card_class(),
            mode,
            sfi,
            record_number,
            data,
            self.card.payload_capacity(),
        )?;
        self.enqueue(CardCommand::ModifyRecord(command))?;
        Ok(self)
    }

    /// Replace `data.len()` bytes of a binary file at `offset`.
    pub fn prepare_update_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    ) -> Result<&mut Self> {
        self.prepare_modify_binary(true, sfi, offset, data)
    }

    /// OR data into a binary file at `offset`.
    pub fn prepare_write_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    ) -> Result<&mut Self> {
        self.prepare_modify_binary(false, sfi, offset, data)
    }

    fn prepare_modify_binary(
        &mut self,
        update: bool,
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command = CmdModifyBinary::new(
            self.card.card_class(),
            update,
            sfi,
            offset,
            data,
            self.card.payload_capacity(),
        )?;
        self.enqueue(CardCommand::ModifyBinary(command))?;
        Ok(self)
    }

    /// Increase a counter by `delta`.
    pub fn prepare_increase_counter(
        &mut self,
        sfi: u8,
        counter_number: u8,
        delta: u32,
    ) -> Result<&mut Self> {
        self.prepare_increase_decrease(false, sfi, counter_number, delta)
    }

    /// Decrease a counter by `delta`.
    pub fn prepare_decrease_counter(
        &mut self,
        sfi: u8,
        counter_number: u8,
        delta: u32,
    ) -> Result<&mut Self> {
        self.prepare_increase_decrease(true, sfi, counter_number, delta)
    }

    fn prepare_increase_decrease(
        &mut self,
        decrease: bool,
        sfi: u8,
        counter_number: u8,
        delta: u32,
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        let previous = self
            .card
            .get_file_by_sfi(sfi)
            .and_then(|f| f.data().counter(counter_number));
        let command = CmdIncreaseDecrease::new(
            self.card.card_class(),
            decrease,
            sfi,
            counter_number,
            delta,
            previous,
            self.card.patch_effects().counter_value_postponed,
        )?;
        self.enqueue(CardCommand::IncreaseDecrease(command))?;
        Ok(self)
    }

    /// Invalidate the selected DF.
    pub fn prepare_invalidate(&mut self) -> Result<&mut Self> {
        self.check_not_closing()?;
        if self.card.df_invalidated() {
            return Err(Error::IllegalState("DF already invalidated".to_string()));
        }
        let command = CmdStatusChange::new(
            self.card.card_class(),
            false,
            self.card.patch_effects().legacy_case1,
        );
        self.enqueue(CardCommand::StatusChange(command))?;
        Ok(self)
    }

    /// Rehabilitate the selected DF.
    pub fn prepare_rehabilitate(&mut self) -> Result<&mut Self> {
        self.check_not_closing()?;
        if !self.card.df_invalidated() {
            return Err(Error::IllegalState("DF not invalidated".to_string()));
        }
        let command = CmdStatusChange::new(
            self.card.card_class(),
            true,
            self.card.patch_effects().legacy_case1,
        );
        self.enqueue(CardCommand::StatusChange(command))?;
        Ok(self)
    }

    // ---- stored value ----------------------------------------------

    /// Read the SV status and one of the logs. On non-extended cards
    /// with the both-logs setting, an extra SV Get of the opposite
    /// operation fetches the other log first.
    pub fn prepare_sv_get(&mut self, operation: SvOperation) -> Result<&mut Self> {
        self.check_not_closing()?;
        self.check_feature(CardFeatures::SV, "stored value")?;
        let extended_mode = self.sv_extended_mode()?;
        let both_logs = self
            .security
            .as_ref()
            .map_or(false, SecuritySetting::sv_load_and_debit_log_enabled);
        if both_logs && !extended_mode {
            let opposite = match operation {
                SvOperation::Reload => SvOperation::Debit,
                SvOperation::Debit => SvOperation::Reload,
            };
            let command = CmdSvGet::new(self.card.card_class(), opposite, false);
            self.enqueue(CardCommand::SvGet(command))?;
        }
        let command = CmdSvGet::new(self.card.card_class(), operation, extended_mode);
        self.enqueue(CardCommand::SvGet(command))?;
        Ok(self)
    }

    /// Load `amount` units onto the purse.
    pub fn prepare_sv_reload(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        self.check_sv_binding(SvOperation::Reload)?;
        let extended_mode = self.sv_extended_mode()?;
        let in_session = self.phase == SessionPhase::Open;
        let command = CmdSvReload::new(
            self.card.card_class(),
            amount,
            date,
            time,
            free,
            in_session,
            extended_mode,
        )?;
        self.enqueue(CardCommand::SvReload(command))?;
        Ok(self)
    }

    /// Debit `amount` units from the purse.
    pub fn prepare_sv_debit(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    ) -> Result<&mut Self> {
        self.prepare_sv_debit_or_undebit(false, amount, date, time)
    }

    /// Cancel a previous debit of `amount` units.
    pub fn prepare_sv_undebit(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    ) -> Result<&mut Self> {
        self.prepare_sv_debit_or_undebit(true, amount, date, time)
    }

    fn prepare_sv_debit_or_undebit(
        &mut self,
        undebit: bool,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        self.check_sv_binding(SvOperation::Debit)?;
        if !undebit {
            let authorized = self
                .security
                .as_ref()
                .map_or(false, SecuritySetting::sv_negative_balance_authorized);
            if !authorized {
                if let Some(balance) = self.card.sv_balance() {
                    if balance - amount < 0 {
                        return Err(Error::IllegalState(format!(
                            "SV balance {} cannot cover a debit of {}",
                            balance, amount
                        )));
                    }
                }
            }
        }
        let extended_mode = self.sv_extended_mode()?;
        let in_session = self.phase == SessionPhase::Open;
        let command = CmdSvDebitOrUndebit::new(
            self.card.card_class(),
            undebit,
            amount,
            date,
            time,
            in_session,
            extended_mode,
        )?;
        self.enqueue(CardCommand::SvDebitOrUndebit(command))?;
        Ok(self)
    }

    /// The SV modifying command must directly follow its matching
    /// SV Get, and a session holds at most one SV operation.
    fn check_sv_binding(&self, required: SvOperation) -> Result<()> {
        self.check_feature(CardFeatures::SV, "stored value")?;
        let matching = self.last_sv_get == Some(required);
        if !matching {
            return Err(Error::IllegalState(format!(
                "an SV operation must immediately follow an SV Get for {}",
                required
            )));
        }
        if let Some(session) = &self.session {
            if self.phase == SessionPhase::Open && session.sv_in_session {
                return Err(Error::IllegalState(
                    "only one SV operation is allowed per secure session".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn sv_extended_mode(&self) -> Result<bool> {
        let security = self
            .security
            .as_ref()
            .ok_or_else(|| Error::IllegalState("SV operations need a security setting".to_string()))?;
        Ok(self.card.is_extended_mode_supported()
            && security.crypto_ref().is_extended_mode_supported())
    }

    // ---- PIN and key management ------------------------------------

    /// Present the PIN. Enciphered transmission (the default) fetches a
    /// card challenge first and ciphers the block in the SAM.
    pub fn prepare_verify_pin(&mut self, pin: [u8; 4]) -> Result<&mut Self> {
        self.check_not_closing()?;
        self.check_feature(CardFeatures::PIN, "PIN")?;
        let plain = self
            .security
            .as_ref()
            .map_or(true, SecuritySetting::pin_plain_transmission_enabled);
        let mode = if plain {
            VerifyPinMode::Plain(pin)
        } else {
            let (kif, kvc) = self.pin_key(SecuritySetting::pin_verification_key, "verification")?;
            self.enqueue_get_challenge()?;
            VerifyPinMode::Enciphered { pin, kif, kvc }
        };
        let command = CmdVerifyPin::new(
            self.card.card_class(),
            mode,
            self.card.patch_effects().legacy_case1,
        );
        self.enqueue(CardCommand::VerifyPin(command))?;
        Ok(self)
    }

    /// Probe the PIN attempt counter without presenting a PIN.
    pub fn prepare_check_pin_status(&mut self) -> Result<&mut Self> {
        self.check_not_closing()?;
        self.check_feature(CardFeatures::PIN, "PIN")?;
        let command = CmdVerifyPin::new(
            self.card.card_class(),
            VerifyPinMode::Status,
            self.card.patch_effects().legacy_case1,
        );
        self.enqueue(CardCommand::VerifyPin(command))?;
        Ok(self)
    }

    /// Replace the PIN.
    pub fn prepare_change_pin(&mut self, current_pin: [u8; 4], new_pin: [u8; 4]) -> Result<&mut Self> {
        self.check_not_closing()?;
        self.check_feature(CardFeatures::PIN, "PIN")?;
        if self.phase == SessionPhase::Open {
            return Err(Error::IllegalState(
                "Change PIN is forbidden inside a secure session".to_string(),
            ));
        }
        let plain = self
            .security
            .as_ref()
            .map_or(true, SecuritySetting::pin_plain_transmission_enabled);
        let mode = if plain {
            ChangePinMode::Plain(new_pin)
        } else {
            let (kif, kvc) = self.pin_key(SecuritySetting::pin_modification_key, "modification")?;
            self.enqueue_get_challenge()?;
            ChangePinMode::Enciphered {
                current_pin,
                new_pin,
                kif,
                kvc,
            }
        };
        let command = CmdChangePin::new(self.card.card_class(), mode);
        self.enqueue(CardCommand::ChangePin(command))?;
        Ok(self)
    }

    /// Replace a card session key, ciphered under the issuer key.
    pub fn prepare_change_key(
        &mut self,
        key_index: u8,
        new_kif: u8,
        new_kvc: u8,
        issuer_kif: u8,
        issuer_kvc: u8,
    ) -> Result<&mut Self> {
        self.check_not_closing()?;
        if self.phase == SessionPhase::Open {
            return Err(Error::IllegalState(
                "Change Key is forbidden inside a secure session".to_string(),
            ));
        }
        if self.security.is_none() {
            return Err(Error::IllegalState(
                "Change Key needs a security setting".to_string(),
            ));
        }
        self.enqueue_get_challenge()?;
        let command = CmdChangeKey::new(
            self.card.card_class(),
            key_index,
            new_kif,
            new_kvc,
            issuer_kif,
            issuer_kvc,
        )?;
        self.enqueue(CardCommand::ChangeKey(command))?;
        Ok(self)
    }

    fn pin_key(
        &self,
        select: fn(&SecuritySetting) -> Option<(u8, u8)>,
        what: &str,
    ) -> Result<(u8, u8)> {
        let security = self.security.as_ref().ok_or_else(|| {
            Error::IllegalState("enciphered PIN transmission needs a security setting".to_string())
        })?;
        select(security).ok_or_else(|| {
            Error::IllegalState(format!("no PIN {} key configured", what))
        })
    }

    fn enqueue_get_challenge(&mut self) -> Result<()> {
        let command = CmdGetChallenge::new(self.card.card_class());
        self.enqueue(CardCommand::GetChallenge(command))
    }

    // ---- administrative commands -----------------------------------

    /// Fetch a data object; see [`GetDataTag`].
    pub fn prepare_get_data(&mut self, tag: GetDataTag) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command = CmdGetData::new(tag);
        self.enqueue(CardCommand::GetData(command))?;
        Ok(self)
    }

    /// Select a file; its header lands in the image.
    pub fn prepare_select_file(&mut self, mode: SelectFileMode) -> Result<&mut Self> {
        self.check_not_closing()?;
        let command = CmdSelectFile::new(self.card.card_class(), mode);
        self.enqueue(CardCommand::SelectFile(command))?;
        Ok(self)
    }

    // ---- processing ------------------------------------------------

    /// Finalize and transmit every pending command, parse the
    /// responses into the card image and keep the MAC chain in the SAM
    /// up to date. The pipeline is always drained, whatever the
    /// outcome; any failure between session open and close runs the
    /// abort subroutine and is rethrown unchanged.
    pub fn process_commands(&mut self, channel_control: ChannelControl) -> Result<&mut Self> {
        let mut pipeline = std::mem::take(&mut self.pipeline);
        self.search_results.clear();
        match self.process_pipeline(&mut pipeline, channel_control) {
            Ok(()) => Ok(self),
            Err(error) => {
                self.handle_processing_error();
                Err(error)
            }
        }
    }

    fn process_pipeline(
        &mut self,
        pipeline: &mut [PreparedCommand],
        channel_control: ChannelControl,
    ) -> Result<()> {
        let mut batch: Vec<usize> = Vec::new();
        for i in 0..pipeline.len() {
            if pipeline[i].command.is_crypto_required_to_finalize() {
                let must_flush = batch.iter().any(|&j| {
                    !pipeline[j].synchronized
                        && !pipeline[j].command.can_anticipate_response(&self.card)
                });
                if must_flush {
                    trace!("partial batch flushed to synchronize the crypto service");
                    self.transmit_and_parse(pipeline, &batch, ChannelControl::KeepOpen)?;
                    batch.clear();
                } else {
                    self.synchronize_ahead(pipeline, &batch)?;
                }
            }
            if pipeline[i].command.is_crypto_required_to_finalize() && self.security.is_none() {
                return Err(Error::IllegalState(format!(
                    "{} needs a security setting",
                    pipeline[i].command.command_ref()
                )));
            }
            if let Some(security) = self.security.as_mut() {
                pipeline[i].command.finalize(&self.card, security.crypto())?;
            }
            batch.push(i);
        }
        self.transmit_and_parse(pipeline, &batch, channel_control)?;
        Ok(())
    }

    /// Feed the MAC chain with the anticipated exchanges of every
    /// pending command, in pipeline order.
    fn synchronize_ahead(
        &mut self,
        pipeline: &mut [PreparedCommand],
        batch: &[usize],
    ) -> Result<()> {
        for &j in batch {
            if pipeline[j].synchronized {
                continue;
            }
            if let CardCommand::OpenSecureSession(cmd) = &pipeline[j].command {
                if cmd.is_pre_open() {
                    let data = self
                        .card
                        .pre_open_data_out()
                        .clone()
                        .expect("pre-open data checked at prepare time");
                    let parsed = cmd.parse_payload(&data)?;
                    trace!("MAC chain synchronized from pre-open data");
                    self.init_session_mac(&parsed, &data)?;
                    pipeline[j].synchronized = true;
                }
                continue;
            }
            if !pipeline[j].in_session {
                continue;
            }
            let response = pipeline[j].command.anticipated_response(&self.card)?;
            let security = self.security.as_mut().expect("crypto checked by caller");
            security
                .crypto()
                .update_terminal_session_mac(pipeline[j].command.request().digest_input())
                .map_err(Error::SamIo)?;
            security
                .crypto()
                .update_terminal_session_mac(response.bytes())
                .map_err(Error::SamIo)?;
            pipeline[j].synchronized = true;
        }
        Ok(())
    }

    fn transmit_and_parse(
        &mut self,
        pipeline: &mut [PreparedCommand],
        batch: &[usize],
        channel_control: ChannelControl,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut apdu_requests = Vec::with_capacity(batch.len());
        let mut contains_ratification = false;
        for &j in batch {
            let mut request = pipeline[j].command.request().clone();
            if pipeline[j].encryption_active {
                let security = self
                    .security
                    .as_mut()
                    .ok_or_else(|| Error::IllegalState("encryption needs a security setting".to_string()))?;
                let enciphered = security
                    .crypto()
                    .encipher_apdu(request.apdu())
                    .map_err(Error::SamIo)?;
                request.replace_apdu(enciphered);
            }
            if let CardCommand::Ratification(_) = pipeline[j].command {
                contains_ratification = true;
            }
            debug!(
                "card request: {} ({})",
                pipeline[j].command.command_ref(),
                to_hex(request.apdu())
            );
            apdu_requests.push(request);
        }
        let request = CardRequest::new(apdu_requests, !contains_ratification);
        let response = self
            .reader
            .transmit_card_request(&request, channel_control)
            .map_err(Error::ReaderIo)?;
        let responses = response.apdu_responses().clone();

        for (k, &j) in batch.iter().enumerate() {
            let raw = match responses.get(k) {
                Some(r) => r.clone(),
                None => {
                    if let CardCommand::Ratification(_) = pipeline[j].command {
                        // the card may leave the field before answering;
                        // the ratification APDU did its job by being sent
                        trace!("no ratification response, ignored");
                        continue;
                    }
                    return Err(Error::InconsistentData(format!(
                        "{} response(s) for {} request(s)",
                        responses.len(),
                        batch.len()
                    )));
                }
            };
            let response = if pipeline[j].encryption_active {
                let security = self.security.as_mut().expect("checked above");
                let plain = security
                    .crypto()
                    .decipher_apdu(raw.bytes())
                    .map_err(Error::SamIo)?;
                ApduResponse::new(plain)?
            } else {
                raw
            };
            debug!(
                "card response: {} ({})",
                pipeline[j].command.command_ref(),
                to_hex(response.bytes())
            );
            if pipeline[j].in_session && !pipeline[j].synchronized {
                let security = self
                    .security
                    .as_mut()
                    .ok_or_else(|| Error::IllegalState("session without security setting".to_string()))?;
                security
                    .crypto()
                    .update_terminal_session_mac(pipeline[j].command.request().digest_input())
                    .map_err(Error::SamIo)?;
                security
                    .crypto()
                    .update_terminal_session_mac(response.bytes())
                    .map_err(Error::SamIo)?;
                pipeline[j].synchronized = true;
            }
            if let CardCommand::CloseSecureSession(cmd) = &pipeline[j].command {
                if !cmd.is_cancellation() && !cmd.is_intermediate() {
                    self.close_engaged = true;
                }
            }
            pipeline[j].command.check_status(&mut self.card, &response)?;
            pipeline[j].command.parse(&mut self.card, &response)?;
            self.after_parse(&mut pipeline[j])?;
        }
        Ok(())
    }

    /// Engine-level effects of a parsed command: MAC chain
    /// initialization, MAC verifications, state transitions.
    fn after_parse(&mut self, prepared: &mut PreparedCommand) -> Result<()> {
        if let CardCommand::OpenSecureSession(cmd) = &prepared.command {
            // a pre-opened session already synchronized the chain
            if !prepared.synchronized {
                let parsed = cmd
                    .parsed()
                    .cloned()
                    .ok_or_else(|| Error::IllegalState("open session not parsed".to_string()))?;
                let data_out = cmd
                    .parsed_data_out()
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| Error::IllegalState("open session not parsed".to_string()))?;
                self.init_session_mac(&parsed, &data_out)?;
                prepared.synchronized = true;
            }
            // the stashed pre-open data is consumed by this open
            self.card.discard_pre_open_session();
            return Ok(());
        }
        match &prepared.command {
            CardCommand::CloseSecureSession(cmd) => {
                if cmd.is_cancellation() {
                    debug!("secure session cancelled, image restored");
                    self.card.restore_files();
                    self.session = None;
                    self.phase = SessionPhase::Idle;
                    self.close_engaged = false;
                } else {
                    self.verify_session_close(cmd)?;
                }
            }
            CardCommand::SvReload(cmd) if !cmd.is_in_session() => {
                self.verify_sv_mac(cmd.sv_mac().to_vec())?;
            }
            CardCommand::SvDebitOrUndebit(cmd) if !cmd.is_in_session() => {
                self.verify_sv_mac(cmd.sv_mac().to_vec())?;
            }
            CardCommand::SearchRecordMultiple(cmd) => {
                self.search_results.push(cmd.matching_records().to_vec());
            }
            _ => {}
        }
        Ok(())
    }

    /// Resolve the session key, enforce the allow-list and start the
    /// MAC chain.
    fn init_session_mac(&mut self, parsed: &ParsedOpenSession, data_out: &[u8]) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::IllegalState("no session state".to_string()))?;
        let security = self
            .security
            .as_mut()
            .ok_or_else(|| Error::IllegalState("no security setting".to_string()))?;
        let kvc = parsed
            .kvc
            .or_else(|| security.default_kvc())
            .ok_or_else(|| Error::IllegalState("session KVC not available".to_string()))?;
        let kif = match parsed.kif {
            Some(kif) if kif != 0xFF => kif,
            _ => security
                .default_kif(session.write_access_level)
                .ok_or_else(|| Error::IllegalState("session KIF not available".to_string()))?,
        };
        if !security.is_session_key_authorized(kif, kvc) {
            return Err(Error::UnauthorizedKey { kif, kvc });
        }
        security
            .crypto()
            .init_terminal_session_mac(data_out, kif, kvc)
            .map_err(Error::SamIo)?;
        session.encryption_active = security.session_encryption_enabled()
            && session.extended_mode
            && parsed.manage_session_allowed;
        trace!(
            "session MAC chain started (KIF {:02X}h, KVC {:02X}h)",
            kif,
            kvc
        );
        Ok(())
    }

    /// Verify the card MACs carried by the close response and commit.
    fn verify_session_close(&mut self, cmd: &CmdCloseSecureSession) -> Result<()> {
        let sv_postponed_index = cmd.sv_postponed_index();
        let security = self
            .security
            .as_mut()
            .ok_or_else(|| Error::IllegalState("no security setting".to_string()))?;
        if let Some(index) = sv_postponed_index {
            let entry = cmd
                .postponed_data()
                .get(usize::from(index))
                .ok_or_else(|| {
                    Error::InconsistentData(format!(
                        "no postponed data at index {} for the SV MAC",
                        index
                    ))
                })?;
            let valid = security
                .crypto()
                .verify_card_sv_mac(entry)
                .map_err(Error::SamIo)?;
            if !valid {
                return Err(Error::InvalidSvCardSignature);
            }
        }
        let valid = security
            .crypto()
            .verify_card_session_mac(cmd.card_mac())
            .map_err(Error::SamIo)?;
        if !valid {
            return Err(Error::InvalidCardSignature);
        }
        if cmd.is_intermediate() {
            // intermediate close of a multi-session transaction: the
            // committed state becomes the new rollback point
            debug!("intermediate session closed, new snapshot taken");
            self.card.discard_snapshot();
            self.card.backup_files();
        } else {
            debug!("secure session closed and verified");
            self.card.discard_snapshot();
            self.session = None;
            self.phase = SessionPhase::Idle;
            self.close_engaged = false;
        }
        Ok(())
    }

    fn verify_sv_mac(&mut self, mac: Vec<u8>) -> Result<()> {
        let security = self
            .security
            .as_mut()
            .ok_or_else(|| Error::IllegalState("SV verification needs a security setting".to_string()))?;
        let valid = security
            .crypto()
            .verify_card_sv_mac(&mac)
            .map_err(Error::SamIo)?;
        if !valid {
            return Err(Error::InvalidSvCardSignature);
        }
        Ok(())
    }

    /// The abort subroutine: best-effort session cancellation on the
    /// card, then unconditional rollback of the image.
    fn handle_processing_error(&mut self) {
        match self.phase {
            SessionPhase::Open => {
                warn!("aborting secure session");
                let cancel = CmdCloseSecureSession::new_cancellation(self.card.card_class());
                let request = CardRequest::new(vec![cancel.request().clone()], false);
                if let Err(error) = self
                    .reader
                    .transmit_card_request(&request, ChannelControl::KeepOpen)
                {
                    warn!("session cancellation not transmitted: {:#}", error);
                }
                self.card.restore_files();
                self.session = None;
                self.phase = SessionPhase::Idle;
            }
            SessionPhase::Closing => {
                if self.close_engaged {
                    // the close itself failed: no second cancellation
                    warn!("secure session close failed");
                    self.card.restore_files();
                    self.session = None;
                    self.phase = SessionPhase::Aborted;
                    self.close_engaged = false;
                } else {
                    warn!("aborting secure session before close");
                    let cancel = CmdCloseSecureSession::new_cancellation(self.card.card_class());
                    let request = CardRequest::new(vec![cancel.request().clone()], false);
                    if let Err(error) = self
                        .reader
                        .transmit_card_request(&request, ChannelControl::KeepOpen)
                    {
                        warn!("session cancellation not transmitted: {:#}", error);
                    }
                    self.card.restore_files();
                    self.session = None;
                    self.phase = SessionPhase::Idle;
                }
            }
            _ => {}
        }
    }

    // ---- pipeline internals ----------------------------------------

    fn enqueue(&mut self, command: CardCommand) -> Result<()> {
        if self.phase == SessionPhase::Open && command.is_session_buffer_used() {
            let apdu_len = command.request().apdu().len();
            let (cost, fits) = {
                let session = self.session.as_ref().expect("open session state");
                let cost = session.buffer.cost_of_apdu(apdu_len);
                (cost, session.buffer.has_room_for(cost))
            };
            if !fits {
                let multi = self
                    .security
                    .as_ref()
                    .map_or(false, SecuritySetting::multiple_session_enabled);
                if !multi {
                    let remaining = self.session.as_ref().expect("open session state").buffer.remaining();
                    return Err(Error::SessionBufferOverflow(format!(
                        "needed {} unit(s), {} remaining and multi-session disabled",
                        cost, remaining
                    )));
                }
                self.insert_session_rollover()?;
            }
            self.session
                .as_mut()
                .expect("open session state")
                .buffer
                .consume(cost);
        }
        if self.phase == SessionPhase::Open {
            let session = self.session.as_mut().expect("open session state");
            match &command {
                CardCommand::IncreaseDecrease(cmd) if cmd.is_postponed() => {
                    session.postponed_count += 1;
                }
                CardCommand::SvReload(_) | CardCommand::SvDebitOrUndebit(_) => {
                    session.sv_postponed_index = Some(session.postponed_count);
                    session.postponed_count += 1;
                    session.sv_in_session = true;
                }
                _ => {}
            }
        }
        let in_session = self.phase == SessionPhase::Open
            && !matches!(
                command,
                CardCommand::OpenSecureSession(_)
                    | CardCommand::CloseSecureSession(_)
                    | CardCommand::Ratification(_)
            );
        let encryption_active = in_session
            && self
                .session
                .as_ref()
                .map_or(false, |s| s.encryption_active);
        self.last_sv_get = match &command {
            CardCommand::SvGet(get) => Some(get.operation()),
            _ => None,
        };
        self.pipeline.push(PreparedCommand {
            command,
            in_session,
            encryption_active,
            synchronized: false,
        });
        Ok(())
    }

    /// Insert a Close + Open pair to split the transaction over a new
    /// session, preserving access level and extended mode.
    fn insert_session_rollover(&mut self) -> Result<()> {
        let (level, extended_mode, sv_postponed_index) = {
            let session = self.session.as_ref().expect("open session state");
            (
                session.write_access_level,
                session.extended_mode,
                session.sv_postponed_index,
            )
        };
        debug!("session buffer exhausted, inserting a session rollover");
        let close = CmdCloseSecureSession::new(
            self.card.card_class(),
            extended_mode,
            false,
            sv_postponed_index,
        )
        .into_intermediate();
        self.pipeline.push(PreparedCommand {
            command: CardCommand::CloseSecureSession(close),
            in_session: false,
            encryption_active: false,
            synchronized: false,
        });
        let security = self
            .security
            .as_mut()
            .ok_or_else(|| Error::IllegalState("no security setting".to_string()))?;
        let terminal_challenge = security
            .crypto()
            .init_terminal_session_context()
            .map_err(Error::SamIo)?;
        let open = CmdOpenSecureSession::new(
            self.card.card_class(),
            open_session_variant(self.card.product_type()),
            extended_mode,
            false,
            level,
            0,
            0,
            &terminal_challenge,
        )?;
        self.pipeline.push(PreparedCommand {
            command: CardCommand::OpenSecureSession(open),
            in_session: false,
            encryption_active: false,
            synchronized: false,
        });
        let session = self.session.as_mut().expect("open session state");
        session.buffer.reset();
        session.postponed_count = 0;
        session.sv_postponed_index = None;
        session.sv_in_session = false;
        Ok(())
    }

    fn check_not_closing(&self) -> Result<()> {
        if self.phase == SessionPhase::Closing {
            return Err(Error::IllegalState(
                "the secure session close is pending, process the pipeline first".to_string(),
            ));
        }
        Ok(())
    }

    fn check_feature(&self, feature: CardFeatures, what: &str) -> Result<()> {
        if !self.card.has_feature(feature) {
            return Err(Error::IllegalState(format!(
                "the card does not support {}",
                what
            )));
        }
        Ok(())
    }
}

fn open_session_variant(product_type: ProductType) -> OpenSessionVariant {
    match product_type {
        ProductType::PrimeRev1 => OpenSessionVariant::Rev1,
        ProductType::PrimeRev2 => OpenSessionVariant::Rev24,
        _ => OpenSessionVariant::Rev3,
    }
}
