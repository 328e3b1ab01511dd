//! The Calypso card command set: one encoder/parser per command kind,
//! an exhaustive [`CardCommand`] dispatch, and the immutable per-command
//! status-word tables.

pub mod counter;
pub mod misc;
pub mod pin;
pub mod read;
pub mod session;
pub mod sv;
pub mod write;

use crate::apdu::{ApduRequest, ApduResponse, SW_OK};
use crate::card::CalypsoCard;
use crate::error::{Error, Result};
use crate::spi::SymmetricCryptoSpi;
use crate::util::counter_bytes;
use counter::CmdIncreaseDecrease;
use lazy_static::lazy_static;
use misc::{CmdChangeKey, CmdGetData, CmdSelectFile, CmdStatusChange};
use pin::{CmdChangePin, CmdGetChallenge, CmdVerifyPin};
use read::{CmdReadBinary, CmdReadRecordMultiple, CmdReadRecords, CmdSearchRecordMultiple};
use session::{CmdCloseSecureSession, CmdOpenSecureSession, CmdRatification};
use std::collections::HashMap;
use strum::{Display, IntoStaticStr};
use sv::{CmdSvDebitOrUndebit, CmdSvGet, CmdSvReload};
use write::{CmdModifyBinary, CmdModifyRecord, RecordWriteMode};

/// Names of every supported card command.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "shouty_snake_case")]
pub enum CardCommandRef {
    OpenSecureSession,
    CloseSecureSession,
    Ratification,
    ReadRecords,
    ReadRecordMultiple,
    ReadBinary,
    SearchRecordMultiple,
    UpdateRecord,
    WriteRecord,
    AppendRecord,
    UpdateBinary,
    WriteBinary,
    Increase,
    Decrease,
    SvGet,
    SvReload,
    SvDebit,
    SvUndebit,
    GetChallenge,
    VerifyPin,
    ChangePin,
    GetData,
    SelectFile,
    Invalidate,
    Rehabilitate,
    ChangeKey,
}

/// How a status word maps to an engine error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusErrorKind {
    IllegalParameter,
    DataAccess,
    AccessForbidden,
    SecurityContext,
    SecurityData,
    SessionBufferOverflow,
    Terminated,
}

/// One entry of a command's status table.
#[derive(Clone, Copy, Debug)]
struct StatusProperties {
    message: &'static str,
    error: Option<StatusErrorKind>,
}

impl StatusProperties {
    const fn success(message: &'static str) -> Self {
        Self {
            message,
            error: None,
        }
    }

    const fn error(message: &'static str, kind: StatusErrorKind) -> Self {
        Self {
            message,
            error: Some(kind),
        }
    }
}

type StatusTable = HashMap<u16, StatusProperties>;

fn table(entries: &[(u16, StatusProperties)]) -> StatusTable {
    entries.iter().cloned().collect()
}

fn extend(base: &StatusTable, entries: &[(u16, StatusProperties)]) -> StatusTable {
    let mut out = base.clone();
    out.extend(entries.iter().cloned());
    out
}

use StatusErrorKind::*;

lazy_static! {
    /// Status words every Calypso command may return.
    static ref BASE_TABLE: StatusTable = table(&[
        (0x6700, StatusProperties::error("Lc value not supported", IllegalParameter)),
        (0x6B00, StatusProperties::error("P1 or P2 value not supported", IllegalParameter)),
        (0x6D00, StatusProperties::error("instruction not supported", IllegalParameter)),
        (0x6E00, StatusProperties::error("class not supported", IllegalParameter)),
    ]);

    static ref OPEN_SESSION_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6900, StatusProperties::error("transaction counter at its maximum", Terminated)),
        (0x6981, StatusProperties::error("wrong EF type", DataAccess)),
        (0x6982, StatusProperties::error("security conditions not fulfilled", SecurityContext)),
        (0x6985, StatusProperties::error("access forbidden (never access mode or session already open)", AccessForbidden)),
        (0x6A82, StatusProperties::error("file not found", DataAccess)),
        (0x6A83, StatusProperties::error("record not found", DataAccess)),
    ]);

    static ref CLOSE_SESSION_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6400, StatusProperties::error("too many modifications in session", SessionBufferOverflow)),
        (0x6985, StatusProperties::error("no session open", AccessForbidden)),
        (0x6988, StatusProperties::error("incorrect terminal signature", SecurityData)),
    ]);

    static ref READ_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6981, StatusProperties::error("wrong EF type", DataAccess)),
        (0x6982, StatusProperties::error("security conditions not fulfilled", SecurityContext)),
        (0x6985, StatusProperties::error("access forbidden (never access mode or DF invalidated)", AccessForbidden)),
        (0x6986, StatusProperties::error("no current EF", DataAccess)),
        (0x6A82, StatusProperties::error("file not found", DataAccess)),
        (0x6A83, StatusProperties::error("record not found", DataAccess)),
    ]);

    static ref READ_BINARY_TABLE: StatusTable = extend(&READ_TABLE, &[
        (0x6282, StatusProperties::success("end of file reached before reading expected length")),
    ]);

    static ref MODIFY_TABLE: StatusTable = extend(&READ_TABLE, &[
        (0x6400, StatusProperties::error("too many modifications in session", SessionBufferOverflow)),
    ]);

    static ref COUNTER_TABLE: StatusTable = extend(&MODIFY_TABLE, &[
        (0x6A80, StatusProperties::error("counter overflow or underflow", DataAccess)),
        (0x6200, StatusProperties::success("new counter value postponed to session close")),
    ]);

    static ref SV_GET_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6981, StatusProperties::error("wrong EF type", DataAccess)),
        (0x6982, StatusProperties::error("security conditions not fulfilled", SecurityContext)),
        (0x6985, StatusProperties::error("SV access forbidden", AccessForbidden)),
        (0x6A81, StatusProperties::error("incorrect SV operation", IllegalParameter)),
    ]);

    static ref SV_OPERATION_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6400, StatusProperties::error("too many modifications in session", SessionBufferOverflow)),
        (0x6900, StatusProperties::error("SV transaction counter exhausted", Terminated)),
        (0x6985, StatusProperties::error("SV access forbidden", AccessForbidden)),
        (0x6988, StatusProperties::error("incorrect SV signature", SecurityData)),
    ]);

    static ref PIN_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6982, StatusProperties::error("encrypted PIN transmission required", SecurityContext)),
        (0x6985, StatusProperties::error("PIN function not available", AccessForbidden)),
    ]);

    static ref CHANGE_PIN_TABLE: StatusTable = extend(&PIN_TABLE, &[
        (0x6988, StatusProperties::error("incorrect PIN cryptogram", SecurityData)),
        (0x6A80, StatusProperties::error("incorrect PIN block", IllegalParameter)),
    ]);

    static ref GET_CHALLENGE_TABLE: StatusTable = table(&[
        (0x6700, StatusProperties::error("Le value not supported", IllegalParameter)),
        (0x6D00, StatusProperties::error("instruction not supported", IllegalParameter)),
        (0x6E00, StatusProperties::error("class not supported", IllegalParameter)),
    ]);

    static ref GET_DATA_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6A86, StatusProperties::error("incorrect P1 or P2", IllegalParameter)),
        (0x6A88, StatusProperties::error("data object not found", DataAccess)),
    ]);

    static ref SELECT_FILE_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6A82, StatusProperties::error("file not found", DataAccess)),
        (0x6119, StatusProperties::success("more data available")),
    ]);

    static ref STATUS_CHANGE_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6400, StatusProperties::error("too many modifications in session", SessionBufferOverflow)),
        (0x6982, StatusProperties::error("security conditions not fulfilled", SecurityContext)),
        (0x6985, StatusProperties::error("DF status already set", AccessForbidden)),
    ]);

    static ref CHANGE_KEY_TABLE: StatusTable = extend(&BASE_TABLE, &[
        (0x6982, StatusProperties::error("security conditions not fulfilled", SecurityContext)),
        (0x6985, StatusProperties::error("change key forbidden", AccessForbidden)),
        (0x6988, StatusProperties::error("incorrect key cryptogram", SecurityData)),
        (0x6A80, StatusProperties::error("incorrect key block", IllegalParameter)),
        (0x6A87, StatusProperties::error("Lc inconsistent with P1P2", IllegalParameter)),
    ]);
}

fn status_table(reference: CardCommandRef) -> &'static StatusTable {
    use CardCommandRef::*;
    match reference {
        OpenSecureSession => &OPEN_SESSION_TABLE,
        CloseSecureSession => &CLOSE_SESSION_TABLE,
        Ratification => &BASE_TABLE,
        ReadRecords | ReadRecordMultiple | SearchRecordMultiple => &READ_TABLE,
        ReadBinary => &READ_BINARY_TABLE,
        UpdateRecord | WriteRecord | AppendRecord | UpdateBinary | WriteBinary => &MODIFY_TABLE,
        Increase | Decrease => &COUNTER_TABLE,
        SvGet => &SV_GET_TABLE,
        SvReload | SvDebit | SvUndebit => &SV_OPERATION_TABLE,
        GetChallenge => &GET_CHALLENGE_TABLE,
        VerifyPin => &PIN_TABLE,
        ChangePin => &CHANGE_PIN_TABLE,
        GetData => &GET_DATA_TABLE,
        SelectFile => &SELECT_FILE_TABLE,
        Invalidate | Rehabilitate => &STATUS_CHANGE_TABLE,
        ChangeKey => &CHANGE_KEY_TABLE,
    }
}

/// Check a response against the command's status table. `0x9000` is
/// the implicit success; a status word absent from the table is an
/// [`Error::UnknownStatus`].
pub(crate) fn check_status(reference: CardCommandRef, response: &ApduResponse) -> Result<()> {
    let sw = response.status_word();
    if sw == SW_OK {
        return Ok(());
    }
    let properties = status_table(reference).get(&sw).ok_or(Error::UnknownStatus {
        sw,
        command: reference.into(),
    })?;
    match properties.error {
        None => Ok(()),
        Some(kind) => {
            let message = format!("{} ({}, {:04X}h)", properties.message, reference, sw);
            Err(match kind {
                IllegalParameter => Error::IllegalParameter(message),
                DataAccess => Error::DataAccess(message),
                AccessForbidden => Error::AccessForbidden(message),
                SecurityContext => Error::SecurityContext(message),
                SecurityData => Error::SecurityData(message),
                SessionBufferOverflow => Error::SessionBufferOverflow(message),
                Terminated => Error::Terminated(message),
            })
        }
    }
}

/// A prepared card command: the tagged variant carrying its encoded
/// APDU, parse state and finalization hooks.
#[derive(Debug)]
pub enum CardCommand {
    OpenSecureSession(CmdOpenSecureSession),
    CloseSecureSession(CmdCloseSecureSession),
    Ratification(CmdRatification),
    ReadRecords(CmdReadRecords),
    ReadRecordMultiple(CmdReadRecordMultiple),
    ReadBinary(CmdReadBinary),
    SearchRecordMultiple(CmdSearchRecordMultiple),
    ModifyRecord(CmdModifyRecord),
    ModifyBinary(CmdModifyBinary),
    IncreaseDecrease(CmdIncreaseDecrease),
    SvGet(CmdSvGet),
    SvReload(CmdSvReload),
    SvDebitOrUndebit(CmdSvDebitOrUndebit),
    GetChallenge(CmdGetChallenge),
    VerifyPin(CmdVerifyPin),
    ChangePin(CmdChangePin),
    GetData(CmdGetData),
    SelectFile(CmdSelectFile),
    StatusChange(CmdStatusChange),
    ChangeKey(CmdChangeKey),
}

impl CardCommand {
    pub fn command_ref(&self) -> CardCommandRef {
        use CardCommand::*;
        match self {
            OpenSecureSession(_) => CardCommandRef::OpenSecureSession,
            CloseSecureSession(_) => CardCommandRef::CloseSecureSession,
            Ratification(_) => CardCommandRef::Ratification,
            ReadRecords(_) => CardCommandRef::ReadRecords,
            ReadRecordMultiple(_) => CardCommandRef::ReadRecordMultiple,
            ReadBinary(_) => CardCommandRef::ReadBinary,
            SearchRecordMultiple(_) => CardCommandRef::SearchRecordMultiple,
            ModifyRecord(cmd) => match cmd.mode() {
                RecordWriteMode::Update => CardCommandRef::UpdateRecord,
                RecordWriteMode::Write => CardCommandRef::WriteRecord,
                RecordWriteMode::Append => CardCommandRef::AppendRecord,
            },
            ModifyBinary(cmd) => {
                if cmd.is_update() {
                    CardCommandRef::UpdateBinary
                } else {
                    CardCommandRef::WriteBinary
                }
            }
            IncreaseDecrease(cmd) => {
                if cmd.is_decrease() {
                    CardCommandRef::Decrease
                } else {
                    CardCommandRef::Increase
                }
            }
            SvGet(_) => CardCommandRef::SvGet,
            SvReload(_) => CardCommandRef::SvReload,
            SvDebitOrUndebit(cmd) => {
                if cmd.is_undebit() {
                    CardCommandRef::SvUndebit
                } else {
                    CardCommandRef::SvDebit
                }
            }
            GetChallenge(_) => CardCommandRef::GetChallenge,
            VerifyPin(_) => CardCommandRef::VerifyPin,
            ChangePin(_) => CardCommandRef::ChangePin,
            GetData(_) => CardCommandRef::GetData,
            SelectFile(_) => CardCommandRef::SelectFile,
            StatusChange(cmd) => {
                if cmd.is_rehabilitate() {
                    CardCommandRef::Rehabilitate
                } else {
                    CardCommandRef::Invalidate
                }
            }
            ChangeKey(_) => CardCommandRef::ChangeKey,
        }
    }

    pub fn request(&self) -> &ApduRequest {
        use CardCommand::*;
        match self {
            OpenSecureSession(cmd) => cmd.request(),
            CloseSecureSession(cmd) => cmd.request(),
            Ratification(cmd) => cmd.request(),
            ReadRecords(cmd) => cmd.request(),
            ReadRecordMultiple(cmd) => cmd.request(),
            ReadBinary(cmd) => cmd.request(),
            SearchRecordMultiple(cmd) => cmd.request(),
            ModifyRecord(cmd) => cmd.request(),
            ModifyBinary(cmd) => cmd.request(),
            IncreaseDecrease(cmd) => cmd.request(),
            SvGet(cmd) => cmd.request(),
            SvReload(cmd) => cmd.request(),
            SvDebitOrUndebit(cmd) => cmd.request(),
            GetChallenge(cmd) => cmd.request(),
            VerifyPin(cmd) => cmd.request(),
            ChangePin(cmd) => cmd.request(),
            GetData(cmd) => cmd.request(),
            SelectFile(cmd) => cmd.request(),
            StatusChange(cmd) => cmd.request(),
            ChangeKey(cmd) => cmd.request(),
        }
    }

    /// Whether this command stages data in the card's session buffer
    /// when run inside a secure session.
    pub fn is_session_buffer_used(&self) -> bool {
        matches!(
            self,
            CardCommand::ModifyRecord(_)
                | CardCommand::ModifyBinary(_)
                | CardCommand::IncreaseDecrease(_)
                | CardCommand::SvReload(_)
                | CardCommand::SvDebitOrUndebit(_)
                | CardCommand::StatusChange(_)
        )
    }

    /// Whether finalizing the APDU needs the crypto service (and, for
    /// some commands, card data produced by earlier exchanges).
    pub fn is_crypto_required_to_finalize(&self) -> bool {
        match self {
            CardCommand::CloseSecureSession(cmd) => !cmd.is_cancellation(),
            CardCommand::SvReload(_) | CardCommand::SvDebitOrUndebit(_) => true,
            CardCommand::VerifyPin(cmd) => cmd.is_enciphered(),
            CardCommand::ChangePin(cmd) => cmd.is_enciphered(),
            CardCommand::ChangeKey(_) => true,
            _ => false,
        }
    }

    /// Whether the command knows its own response and can synchronize
    /// the MAC chain before the card answers.
    pub fn can_anticipate_response(&self, card: &CalypsoCard) -> bool {
        match self {
            CardCommand::ModifyRecord(_)
            | CardCommand::ModifyBinary(_)
            | CardCommand::StatusChange(_) => true,
            CardCommand::IncreaseDecrease(cmd) => cmd.anticipated_value().is_some(),
            CardCommand::SvReload(cmd) => cmd.is_in_session(),
            CardCommand::SvDebitOrUndebit(cmd) => cmd.is_in_session(),
            CardCommand::OpenSecureSession(cmd) => {
                cmd.is_pre_open() && card.pre_open_data_out().is_some()
            }
            _ => false,
        }
    }

    /// The response this command expects, used to feed the MAC chain
    /// ahead of transmission.
    pub fn anticipated_response(&self, card: &CalypsoCard) -> Result<ApduResponse> {
        match self {
            CardCommand::ModifyRecord(_)
            | CardCommand::ModifyBinary(_)
            | CardCommand::StatusChange(_) => Ok(ApduResponse::from_parts(&[], SW_OK)),
            CardCommand::SvReload(_) | CardCommand::SvDebitOrUndebit(_) => {
                Ok(ApduResponse::from_parts(&[], SW_OK))
            }
            CardCommand::IncreaseDecrease(cmd) => {
                let value = cmd.anticipated_value().ok_or_else(|| {
                    Error::IllegalState("counter value unknown, response cannot be anticipated".to_string())
                })?;
                if cmd.is_postponed() {
                    Ok(ApduResponse::from_parts(&[], counter::SW_POSTPONED))
                } else {
                    Ok(ApduResponse::from_parts(&counter_bytes(value), SW_OK))
                }
            }
            CardCommand::OpenSecureSession(_) => {
                let data = card.pre_open_data_out().as_deref().ok_or_else(|| {
                    Error::IllegalState("no pre-open data to anticipate".to_string())
                })?;
                Ok(ApduResponse::from_parts(data, SW_OK))
            }
            _ => Err(Error::IllegalState(format!(
                "{} cannot anticipate its response",
                self.command_ref()
            ))),
        }
    }

    /// Run the finalization hook, patching cryptograms into the APDU.
    pub fn finalize(
        &mut self,
        card: &CalypsoCard,
        crypto: &mut dyn SymmetricCryptoSpi,
    ) -> Result<()> {
        match self {
            CardCommand::CloseSecureSession(cmd) if !cmd.is_cancellation() => {
                let mac = crypto.finalize_terminal_session_mac().map_err(Error::SamIo)?;
                cmd.set_terminal_mac(&mac)
            }
            CardCommand::SvReload(cmd) => cmd.finalize(card, crypto),
            CardCommand::SvDebitOrUndebit(cmd) => cmd.finalize(card, crypto),
            CardCommand::VerifyPin(cmd) => cmd.finalize(card, crypto),
            CardCommand::ChangePin(cmd) => cmd.finalize(card, crypto),
            CardCommand::ChangeKey(cmd) => cmd.finalize(card, crypto),
            _ => Ok(()),
        }
    }

    /// Classify the status word, honoring per-instance successful
    /// status words and command-specific interpretations.
    pub fn check_status(&self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        if let CardCommand::Ratification(_) = self {
            // any outcome ratifies
            return Ok(());
        }
        if let CardCommand::VerifyPin(cmd) = self {
            return cmd.check_status(card, response);
        }
        if self
            .request()
            .successful_status_words()
            .contains(&response.status_word())
        {
            return Ok(());
        }
        check_status(self.command_ref(), response)
    }

    /// Parse the response into the card image.
    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        use CardCommand::*;
        match self {
            OpenSecureSession(cmd) => cmd.parse(card, response),
            CloseSecureSession(cmd) => cmd.parse(card, response),
            Ratification(_) => Ok(()),
            ReadRecords(cmd) => cmd.parse(card, response),
            ReadRecordMultiple(cmd) => cmd.parse(card, response),
            ReadBinary(cmd) => cmd.parse(card, response),
            SearchRecordMultiple(cmd) => cmd.parse(card, response),
            ModifyRecord(cmd) => cmd.parse(card, response),
            ModifyBinary(cmd) => cmd.parse(card, response),
            IncreaseDecrease(cmd) => cmd.parse(card, response),
            SvGet(cmd) => cmd.parse(card, response),
            SvReload(cmd) => cmd.parse(card, response),
            SvDebitOrUndebit(cmd) => cmd.parse(card, response),
            GetChallenge(cmd) => cmd.parse(card, response),
            VerifyPin(cmd) => cmd.parse(card, response),
            ChangePin(cmd) => cmd.parse(card, response),
            GetData(cmd) => cmd.parse(card, response),
            SelectFile(cmd) => cmd.parse(card, response),
            StatusChange(cmd) => cmd.parse(card, response),
            ChangeKey(cmd) => cmd.parse(card, response),
        }
    }
}
