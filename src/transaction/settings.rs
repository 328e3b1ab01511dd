//! Security parameters of a secured transaction: the crypto services,
//! the session policy switches and the key references.

use crate::spi::{AsymmetricCryptoSpi, SymmetricCryptoSpi};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::Serialize;
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumString};

/// The three session write access levels, ordered by decreasing
/// privilege.
#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[strum(serialize_all = "shouty_snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteAccessLevel {
    Perso,
    Load,
    Debit,
}

impl WriteAccessLevel {
    /// The session key index carried in the Open Secure Session P1.
    pub fn key_index(self) -> u8 {
        match self {
            WriteAccessLevel::Perso => 1,
            WriteAccessLevel::Load => 2,
            WriteAccessLevel::Debit => 3,
        }
    }
}

/// Everything the engine needs to run secured operations: the SAM-side
/// crypto service, the session policy switches and the key references.
#[derive(Builder, Getters, CopyGetters)]
#[builder(pattern = "owned", setter(into), build_fn(error = "crate::error::Error"))]
pub struct SecuritySetting {
    /// The symmetric crypto service backed by the SAM.
    crypto: Box<dyn SymmetricCryptoSpi>,

    /// The optional PKI crypto service for PKI-capable cards.
    #[builder(default, setter(strip_option))]
    asymmetric_crypto: Option<Box<dyn AsymmetricCryptoSpi>>,

    /// Split the transaction over several sessions when the card's
    /// modifications buffer would overflow.
    #[get_copy = "pub"]
    #[builder(default = "false")]
    multiple_session_enabled: bool,

    /// Defer the session ratification to a dedicated APDU sent after
    /// the close (contactless flows).
    #[get_copy = "pub"]
    #[builder(default = "false")]
    ratification_mechanism_enabled: bool,

    /// On non-extended cards, fetch both SV logs by running an extra
    /// SV Get of the opposite operation.
    #[get_copy = "pub"]
    #[builder(default = "false")]
    sv_load_and_debit_log_enabled: bool,

    /// Allow the SV balance to go negative.
    #[get_copy = "pub"]
    #[builder(default = "false")]
    sv_negative_balance_authorized: bool,

    /// Encipher in-session APDUs (extended sessions only).
    #[get_copy = "pub"]
    #[builder(default = "false")]
    session_encryption_enabled: bool,

    /// Transmit PIN blocks in plain instead of enciphering them.
    #[get_copy = "pub"]
    #[builder(default = "false")]
    pin_plain_transmission_enabled: bool,

    /// KIF/KVC pairs accepted as session keys; empty accepts any key.
    #[get = "pub"]
    #[builder(default)]
    authorized_session_keys: Vec<(u8, u8)>,

    /// Fallback KIF per write access level for cards whose Open Secure
    /// Session response carries none (rev 1.0 and 2.4).
    #[get = "pub"]
    #[builder(default)]
    default_kifs: HashMap<WriteAccessLevel, u8>,

    /// Fallback KVC for cards whose response carries none (rev 1.0).
    #[get_copy = "pub"]
    #[builder(default, setter(strip_option))]
    default_kvc: Option<u8>,

    /// Key ciphering the PIN for presentation.
    #[get_copy = "pub"]
    #[builder(default, setter(strip_option))]
    pin_verification_key: Option<(u8, u8)>,

    /// Key ciphering the PIN for modification.
    #[get_copy = "pub"]
    #[builder(default, setter(strip_option))]
    pin_modification_key: Option<(u8, u8)>,

    /// Override of the BASIC product's modifications counter (counted
    /// in commands).
    #[get_copy = "pub"]
    #[builder(default, setter(strip_option))]
    basic_modifications_counter: Option<u32>,
}

impl SecuritySetting {
    pub fn crypto(&mut self) -> &mut dyn SymmetricCryptoSpi {
        self.crypto.as_mut()
    }

    pub fn crypto_ref(&self) -> &dyn SymmetricCryptoSpi {
        self.crypto.as_ref()
    }

    pub fn asymmetric_crypto(&mut self) -> Option<&mut (dyn AsymmetricCryptoSpi + 'static)> {
        match self.asymmetric_crypto.as_mut() {
            Some(spi) => Some(spi.as_mut()),
            None => None,
        }
    }

    /// Whether the given session key is acceptable to the caller.
    pub fn is_session_key_authorized(&self, kif: u8, kvc: u8) -> bool {
        self.authorized_session_keys.is_empty()
            || self.authorized_session_keys.contains(&(kif, kvc))
    }

    pub fn default_kif(&self, level: WriteAccessLevel) -> Option<u8> {
        self.default_kifs.get(&level).copied()
    }
}

impl std::fmt::Debug for SecuritySetting {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SecuritySetting")
            .field("multiple_session_enabled", &self.multiple_session_enabled)
            .field(
                "ratification_mechanism_enabled",
                &self.ratification_mechanism_enabled,
            )
            .field(
                "sv_load_and_debit_log_enabled",
                &self.sv_load_and_debit_log_enabled,
            )
            .field(
                "sv_negative_balance_authorized",
                &self.sv_negative_balance_authorized,
            )
            .field("session_encryption_enabled", &self.session_encryption_enabled)
            .field(
                "pin_plain_transmission_enabled",
                &self.pin_plain_transmission_enabled,
            )
            .field("authorized_session_keys", &self.authorized_session_keys)
            .finish()
    }
}
