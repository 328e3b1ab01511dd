//! PIN management: Get Challenge, Verify PIN (presentation and status
//! probe) and Change PIN, in plain and enciphered transmission modes.

use crate::apdu::{ApduRequest, ApduResponse};
use crate::card::product::CardClass;
use crate::card::CalypsoCard;
use crate::error::{Error, Result};
use crate::spi::SymmetricCryptoSpi;
use log::trace;

const INS_GET_CHALLENGE: u8 = 0x84;
const INS_VERIFY_PIN: u8 = 0x20;
const INS_CHANGE_PIN: u8 = 0xD8;

const CHALLENGE_LENGTH: usize = 8;
const ENCIPHERED_PIN_LENGTH: usize = 16;

/// Remaining attempts granted after a successful presentation.
const PIN_ATTEMPTS_MAX: u8 = 3;

/// SW family `63CX`: wrong PIN, X attempts remaining.
const SW_WRONG_PIN_BASE: u16 = 0x63C0;
/// PIN blocked.
const SW_PIN_BLOCKED: u16 = 0x6983;

/// Get Challenge, the card nonce feeding the enciphered PIN and key
/// ciphering flows.
#[derive(Debug)]
pub struct CmdGetChallenge {
    request: ApduRequest,
}

impl CmdGetChallenge {
    pub fn new(card_class: CardClass) -> Self {
        Self {
            request: ApduRequest::build(
                card_class.value(),
                INS_GET_CHALLENGE,
                0x00,
                0x00,
                None,
                Some(CHALLENGE_LENGTH as u8),
            ),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let data = response.data_out();
        if data.len() != CHALLENGE_LENGTH {
            return Err(Error::UnexpectedResponseLength(format!(
                "card challenge must be {} bytes, got {}",
                CHALLENGE_LENGTH,
                data.len()
            )));
        }
        card.set_challenge(data.to_vec());
        Ok(())
    }
}

/// Transmission mode of a PIN presentation.
#[derive(Debug)]
pub enum VerifyPinMode {
    /// Plain 4-byte PIN.
    Plain([u8; 4]),
    /// PIN enciphered by the SAM under the given key; needs a fresh
    /// card challenge.
    Enciphered { pin: [u8; 4], kif: u8, kvc: u8 },
    /// No PIN at all: probes the attempt counter.
    Status,
}

/// Verify PIN.
#[derive(Debug)]
pub struct CmdVerifyPin {
    mode: VerifyPinMode,
    request: ApduRequest,
}

impl CmdVerifyPin {
    pub fn new(card_class: CardClass, mode: VerifyPinMode, legacy_case1: bool) -> Self {
        let request = match &mode {
            VerifyPinMode::Plain(pin) => ApduRequest::build(
                card_class.value(),
                INS_VERIFY_PIN,
                0x00,
                0x00,
                Some(pin),
                None,
            ),
            VerifyPinMode::Enciphered { .. } => ApduRequest::build(
                card_class.value(),
                INS_VERIFY_PIN,
                0x00,
                0x00,
                Some(&[0u8; ENCIPHERED_PIN_LENGTH]),
                None,
            ),
            VerifyPinMode::Status => case1_request(
                card_class,
                INS_VERIFY_PIN,
                0x00,
                0x00,
                legacy_case1,
            ),
        };
        Self { mode, request }
    }

    pub fn is_status_probe(&self) -> bool {
        matches!(self.mode, VerifyPinMode::Status)
    }

    pub fn is_enciphered(&self) -> bool {
        matches!(self.mode, VerifyPinMode::Enciphered { .. })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn finalize(
        &mut self,
        card: &CalypsoCard,
        crypto: &mut dyn SymmetricCryptoSpi,
    ) -> Result<()> {
        if let VerifyPinMode::Enciphered { pin, kif, kvc } = &self.mode {
            let challenge = card_challenge(card)?;
            let block = crypto
                .cipher_pin_for_presentation(challenge, pin, *kif, *kvc)
                .map_err(Error::SamIo)?;
            check_enciphered_length(&block)?;
            self.request.patch_data(5, &block);
        }
        Ok(())
    }

    /// Interpret the PIN status words before the generic table check:
    /// `63CX` and `6983` carry the attempt counter.
    pub fn check_status(&self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let sw = response.status_word();
        if sw & 0xFFF0 == SW_WRONG_PIN_BASE {
            let remaining = (sw & 0x000F) as u8;
            card.set_pin_attempt_counter(remaining);
            return if self.is_status_probe() {
                Ok(())
            } else {
                Err(Error::SecurityData(format!(
                    "invalid PIN, {} attempt(s) remaining",
                    remaining
                )))
            };
        }
        if sw == SW_PIN_BLOCKED {
            card.set_pin_attempt_counter(0);
            return if self.is_status_probe() {
                Ok(())
            } else {
                Err(Error::AccessForbidden("PIN blocked".to_string()))
            };
        }
        super::check_status(super::CardCommandRef::VerifyPin, response)
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        if response.status_word() == 0x9000 {
            trace!("PIN presentation accepted");
            card.set_pin_attempt_counter(PIN_ATTEMPTS_MAX);
        }
        Ok(())
    }
}

/// Transmission mode of a PIN change.
#[derive(Debug)]
pub enum ChangePinMode {
    /// Plain 4-byte replacement PIN.
    Plain([u8; 4]),
    /// Current and new PIN enciphered together by the SAM.
    Enciphered {
        current_pin: [u8; 4],
        new_pin: [u8; 4],
        kif: u8,
        kvc: u8,
    },
}

/// Change PIN.
#[derive(Debug)]
pub struct CmdChangePin {
    mode: ChangePinMode,
    request: ApduRequest,
}

impl CmdChangePin {
    pub fn new(card_class: CardClass, mode: ChangePinMode) -> Self {
        let data_len = match &mode {
            ChangePinMode::Plain(_) => 4,
            ChangePinMode::Enciphered { .. } => ENCIPHERED_PIN_LENGTH,
        };
        let mut data = vec![0u8; data_len];
        if let ChangePinMode::Plain(pin) = &mode {
            data.copy_from_slice(pin);
        }
        let request = ApduRequest::build(
            card_class.value(),
            INS_CHANGE_PIN,
            0x00,
            0xFF,
            Some(&data),
            None,
        );
        Self { mode, request }
    }

    pub fn is_enciphered(&self) -> bool {
        matches!(self.mode, ChangePinMode::Enciphered { .. })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn finalize(
        &mut self,
        card: &CalypsoCard,
        crypto: &mut dyn SymmetricCryptoSpi,
    ) -> Result<()> {
        if let ChangePinMode::Enciphered {
            current_pin,
            new_pin,
            kif,
            kvc,
        } = &self.mode
        {
            let challenge = card_challenge(card)?;
            let block = crypto
                .cipher_pin_for_modification(challenge, current_pin, new_pin, *kif, *kvc)
                .map_err(Error::SamIo)?;
            check_enciphered_length(&block)?;
            self.request.patch_data(5, &block);
        }
        Ok(())
    }

    pub fn parse(&mut self, _card: &mut CalypsoCard, _response: &ApduResponse) -> Result<()> {
        Ok(())
    }
}

/// Case-1 encoding: a bare 4-byte header on cards with the legacy
/// quirk, a trailing Le of 0 otherwise.
pub(crate) fn case1_request(
    card_class: CardClass,
    ins: u8,
    p1: u8,
    p2: u8,
    legacy_case1: bool,
) -> ApduRequest {
    let le = if legacy_case1 { None } else { Some(0x00) };
    ApduRequest::build(card_class.value(), ins, p1, p2, None, le)
}

fn card_challenge(card: &CalypsoCard) -> Result<&[u8]> {
    card.challenge().as_deref().ok_or_else(|| {
        Error::IllegalState("no card challenge available: run Get Challenge first".to_string())
    })
}

fn check_enciphered_length(block: &[u8]) -> Result<()> {
    if block.len() != ENCIPHERED_PIN_LENGTH {
        return Err(Error::InconsistentData(format!(
            "enciphered PIN block must be {} bytes, got {}",
            ENCIPHERED_PIN_LENGTH,
            block.len()
        )));
    }
    Ok(())
}
