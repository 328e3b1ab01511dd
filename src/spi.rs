//! The contracts the engine consumes from its external collaborators:
//! the card reader moving raw APDUs, and the SAM-side crypto services.
//!
//! Implementations live outside this crate (PC/SC readers, embedded
//! readers, SAM drivers, HSM bridges). They report failures through
//! `anyhow::Error`; the engine wraps those into [`crate::Error::ReaderIo`]
//! and [`crate::Error::SamIo`] so the transaction outcome stays typed.

use crate::apdu::{CardRequest, CardResponse, ChannelControl};
use anyhow::Result;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{CopyGetters, Getters};

/// Low-level transport to the physical card.
pub trait CardReader {
    /// Transmit a batch of APDUs and collect the responses in order.
    /// The response list may be shorter than the request list when the
    /// request asked to stop on the first unsuccessful status word.
    fn transmit_card_request(
        &mut self,
        request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse>;
}

/// Input block for the SAM SV signature computation: everything the SAM
/// needs to bind an SV modifying command to the preceding SV Get.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct SvCommandSecurityData {
    /// The 8-byte SV Get request header captured in the card image.
    #[get = "pub"]
    sv_get_header: [u8; 8],
    /// The full SV Get response payload.
    #[get = "pub"]
    sv_get_data: Vec<u8>,
    /// The head of the SV modifying command's data-in (amount, date,
    /// time, free bytes, KVC) that the SAM signs over.
    #[get = "pub"]
    sv_command_data: Vec<u8>,
    /// Whether the session runs in extended mode (10-byte signature).
    #[get_copy = "pub"]
    extended_mode: bool,
}

impl SvCommandSecurityData {
    pub fn new(
        sv_get_header: [u8; 8],
        sv_get_data: Vec<u8>,
        sv_command_data: Vec<u8>,
        extended_mode: bool,
    ) -> Self {
        Self {
            sv_get_header,
            sv_get_data,
            sv_command_data,
            extended_mode,
        }
    }
}

/// The symmetric-key crypto service backed by the SAM.
///
/// One instance serves exactly one transaction at a time; the engine
/// drives it in strict APDU order (C-APDU first, then its R-APDU).
/// Implementations are clonable handles to the underlying SAM channel.
pub trait SymmetricCryptoSpi: DynClone {
    /// Whether the underlying SAM supports the extended (rev 3.2+)
    /// session mode with 8-byte MACs.
    fn is_extended_mode_supported(&self) -> bool;

    /// Produce the 8-byte terminal challenge opening a session context.
    fn init_terminal_session_context(&mut self) -> Result<[u8; 8]>;

    /// Initialize the session MAC chain from the card's Open Secure
    /// Session response payload and the selected session key.
    fn init_terminal_session_mac(&mut self, open_session_data: &[u8], kif: u8, kvc: u8)
        -> Result<()>;

    /// Chain one card APDU (command or response) into the session MAC.
    fn update_terminal_session_mac(&mut self, apdu: &[u8]) -> Result<()>;

    /// Close the terminal half of the MAC chain, producing the 4-byte
    /// (compat) or 8-byte (extended) terminal signature.
    fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>>;

    /// Verify the MAC returned by the card on session close.
    fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<bool>;

    /// Cipher a PIN block for presentation (Verify PIN).
    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>>;

    /// Cipher the current and new PIN blocks for modification
    /// (Change PIN).
    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        current_pin: &[u8; 4],
        new_pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>>;

    /// Sign the SV operation: returns the SAM security block
    /// (SAM id, SAM transaction number, signature) appended to the SV
    /// modifying command's data-in.
    fn generate_sv_command_security_data(
        &mut self,
        data: &SvCommandSecurityData,
    ) -> Result<Vec<u8>>;

    /// Verify the SV MAC returned by the card after an SV operation.
    fn verify_card_sv_mac(&mut self, card_mac: &[u8]) -> Result<bool>;

    /// Cipher a card key block for Change Key under the issuer key.
    fn cipher_card_key(
        &mut self,
        card_challenge: &[u8],
        issuer_kif: u8,
        issuer_kvc: u8,
        new_kif: u8,
        new_kvc: u8,
    ) -> Result<Vec<u8>>;

    /// Encipher an outgoing C-APDU payload (session encryption mode).
    /// The session MAC keeps covering the plaintext form.
    fn encipher_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>>;

    /// Decipher an incoming R-APDU payload (session encryption mode).
    fn decipher_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>>;
}

clone_trait_object!(SymmetricCryptoSpi);

/// The asymmetric (PKI) crypto service, the parallel contract selected
/// at open-session time for PKI-capable cards. The engine hands it
/// opaque certificate and signature material.
pub trait AsymmetricCryptoSpi: DynClone {
    /// Start a PKI session context from the card's Open Secure Session
    /// (PKI variant) response payload.
    fn init_terminal_pki_session(&mut self, open_session_data: &[u8]) -> Result<()>;

    /// Chain one card APDU into the PKI session digest.
    fn update_terminal_pki_session(&mut self, apdu: &[u8]) -> Result<()>;

    /// Verify the card's session signature on close.
    fn verify_card_pki_signature(&mut self, signature: &[u8]) -> Result<bool>;
}

clone_trait_object!(AsymmetricCryptoSpi);
