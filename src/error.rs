//! Error taxonomy of the transaction engine.
//!
//! Every failure mode the engine can surface is one variant of [`Error`];
//! callers match on the kind, the embedded message carries the detail.
//! Transport failures on either reader keep their original error as
//! source so nothing is lost across the SPI boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request rejected by the card.
    #[error("illegal parameter: {0}")]
    IllegalParameter(String),

    /// File not found, wrong EF type, record or offset overflow.
    #[error("data access: {0}")]
    DataAccess(String),

    /// Never-access mode or invalidated DF.
    #[error("access forbidden: {0}")]
    AccessForbidden(String),

    /// Security preconditions not met (no session, wrong key, encryption
    /// required, pre-open mismatch).
    #[error("security context: {0}")]
    SecurityContext(String),

    /// Bad cryptogram or bad padding reported by the card.
    #[error("security data: {0}")]
    SecurityData(String),

    /// Modifications buffer exhausted while multi-session is disabled,
    /// or reported exhausted by the card itself.
    #[error("session buffer overflow: {0}")]
    SessionBufferOverflow(String),

    /// Card transaction counter exhausted.
    #[error("card terminated: {0}")]
    Terminated(String),

    /// Response length does not match the variant grammar.
    #[error("unexpected response length: {0}")]
    UnexpectedResponseLength(String),

    /// Status word absent from the command's status table.
    #[error("unknown status word {sw:04X}h for command {command}")]
    UnknownStatus { sw: u16, command: &'static str },

    /// Transport failure on the SAM side.
    #[error("SAM I/O failure")]
    SamIo(#[source] anyhow::Error),

    /// Transport failure on the card reader side.
    #[error("reader I/O failure")]
    ReaderIo(#[source] anyhow::Error),

    /// The card session MAC failed verification.
    #[error("invalid card session MAC")]
    InvalidCardSignature,

    /// A SAM signature failed verification.
    #[error("invalid signature")]
    InvalidSignature,

    /// The card SV MAC failed verification.
    #[error("invalid SV card MAC")]
    InvalidSvCardSignature,

    /// Request/response count mismatch or self-contradicting card data.
    #[error("inconsistent data: {0}")]
    InconsistentData(String),

    /// Session key not present in the caller-provided allow-list.
    #[error("unauthorized key: KIF {kif:02X}h, KVC {kvc:02X}h")]
    UnauthorizedKey { kif: u8, kvc: u8 },

    /// Engine state does not allow the requested operation.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Caller-provided argument out of range.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("uninitialized field")]
    Builder(#[from] derive_builder::UninitializedFieldError),
}
