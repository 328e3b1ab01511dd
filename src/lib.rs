//! Terminal-side Calypso card transaction library.
//!
//! The crate drives Calypso contactless cards and their SAMs from the
//! terminal: it encodes and decodes the Calypso command set, mirrors
//! the selected application in an in-memory [`card::CalypsoCard`]
//! image, and runs cryptographically authenticated secure sessions
//! through the [`transaction::CardTransactionManager`].
//!
//! The physical transports stay outside: callers plug a reader and a
//! SAM-backed crypto service through the [`spi`] traits.

pub mod apdu;
pub mod card;
pub mod command;
pub mod error;
pub mod sam;
pub mod spi;
pub mod transaction;
pub mod util;

pub use apdu::{ApduRequest, ApduResponse, CardRequest, CardResponse, ChannelControl};
pub use card::selection::card_from_selection;
pub use card::CalypsoCard;
pub use error::{Error, Result};
pub use sam::{LegacySam, SamProductType};
pub use transaction::{
    CardTransactionManager, GetDataTag, SearchCommandData, SearchCommandDataBuilder,
    SecuritySetting, SecuritySettingBuilder, SelectFileMode, SvOperation, WriteAccessLevel,
};
