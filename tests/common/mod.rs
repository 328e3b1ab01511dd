//! Shared fixtures: a simulated card behind the reader SPI and a
//! recording crypto service behind the SAM SPI.

#![allow(dead_code)]

use anyhow::{bail, Result};
use calypsors::apdu::{ApduResponse, CardRequest, CardResponse, ChannelControl};
use calypsors::card::CalypsoCard;
use calypsors::spi::{CardReader, SvCommandSecurityData, SymmetricCryptoSpi};
use calypsors::{card_from_selection, SecuritySetting, SecuritySettingBuilder};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub const AID: [u8; 14] = [
    0x32, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53, 0x2E, 0x44, 0x44, 0x46, 0x30, 0x31,
];

/// Assemble a well-formed FCI for the given serial and startup info.
pub fn build_fci(serial: [u8; 8], startup_info: [u8; 7]) -> Vec<u8> {
    let mut bf0c = vec![0xC7, 0x08];
    bf0c.extend_from_slice(&serial);
    bf0c.push(0x53);
    bf0c.push(0x07);
    bf0c.extend_from_slice(&startup_info);
    let mut a5 = vec![0xBF, 0x0C, bf0c.len() as u8];
    a5.extend_from_slice(&bf0c);
    let mut template = vec![0x84, AID.len() as u8];
    template.extend_from_slice(&AID);
    template.extend_from_slice(&[0xA5, a5.len() as u8]);
    template.extend_from_slice(&a5);
    let mut fci = vec![0x6F, template.len() as u8];
    fci.extend_from_slice(&template);
    fci
}

/// A PRIME revision 3 card with a 430-byte session buffer.
pub fn rev3_card() -> CalypsoCard {
    card_with_startup_info([0x0A, 0x3C, 0x20, 0x05, 0x01, 0x02, 0x03])
}

/// Same product with the smallest buffer (indicator 6 → 215 bytes).
pub fn rev3_card_small_buffer() -> CalypsoCard {
    card_with_startup_info([0x06, 0x3C, 0x20, 0x05, 0x01, 0x02, 0x03])
}

/// A PRIME revision 2 card matching the postponed-counter patch.
pub fn rev2_postponed_card() -> CalypsoCard {
    card_with_startup_info([0x06, 0x0A, 0x01, 0x02, 0x00, 0x00, 0x00])
}

pub fn card_with_startup_info(startup_info: [u8; 7]) -> CalypsoCard {
    let fci = build_fci([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88], startup_info);
    let response = ApduResponse::from_parts(&fci, 0x9000);
    card_from_selection(None, Some(&response)).expect("well-formed FCI")
}

/// Simulated card state, shared with the test through an `Rc`.
#[derive(Default)]
pub struct CardState {
    pub records: HashMap<(u8, u8), Vec<u8>>,
    pub counters: HashMap<(u8, u8), u32>,
    /// Counter commands answer 6200h and postpone the value.
    pub counter_postponed: bool,
    pub sv_balance: i32,
    pub sv_tnum: u16,
    pub sv_kvc: u8,
    /// Pending postponed-data entries for the next close.
    pub postponed: Vec<Vec<u8>>,
    /// Raise an I/O error when this instruction byte is seen.
    pub fail_on_ins: Option<u8>,
    /// Answer this status word when this instruction byte is seen.
    pub sw_override: Option<(u8, u16)>,
    /// Every APDU received, in order.
    pub transmitted: Vec<Vec<u8>>,
    /// Number of APDUs per transmit call.
    pub batches: Vec<usize>,
    pub session_open: bool,
}

impl CardState {
    fn respond(&mut self, apdu: &[u8]) -> Vec<u8> {
        let ins = apdu[1];
        if let Some((fail_ins, sw)) = self.sw_override {
            if fail_ins == ins {
                return sw.to_be_bytes().to_vec();
            }
        }
        match ins {
            0x8A => {
                self.session_open = true;
                let extended = apdu[3] & 0x07 == 0x02;
                let mut out = if extended {
                    // challenge(3) counter(4) flags(1) kif kvc len
                    vec![0xC1, 0xC2, 0xC3, 0, 0, 0, 1, 0x02, 0x30, 0x79, 0x00]
                } else {
                    // challenge(3) ratified kif kvc len
                    vec![0xC1, 0xC2, 0xC3, 0x00, 0x30, 0x79, 0x00]
                };
                out.extend_from_slice(&[0x90, 0x00]);
                out
            }
            0x8E => {
                self.session_open = false;
                if apdu.len() == 5 || apdu.len() == 4 {
                    // cancellation
                    self.postponed.clear();
                    vec![0x90, 0x00]
                } else {
                    let mut out = Vec::new();
                    for entry in self.postponed.drain(..) {
                        out.push(entry.len() as u8);
                        out.extend_from_slice(&entry);
                    }
                    out.extend_from_slice(&[0xE1, 0xE2, 0xE3, 0xE4]);
                    out.extend_from_slice(&[0x90, 0x00]);
                    out
                }
            }
            0xB2 if apdu.len() == 5 => {
                // read records, one record
                let sfi = apdu[3] >> 3;
                let record = apdu[2];
                match self.records.get(&(sfi, record)) {
                    Some(content) => {
                        let mut out = content.clone();
                        out.extend_from_slice(&[0x90, 0x00]);
                        out
                    }
                    None => vec![0x6A, 0x83],
                }
            }
            0xB2 => vec![0x90, 0x00],
            0xDC | 0xD2 => {
                let sfi = apdu[3] >> 3;
                let record = apdu[2];
                let data = apdu[5..5 + usize::from(apdu[4])].to_vec();
                self.records.insert((sfi, record), data);
                vec![0x90, 0x00]
            }
            0xE2 => vec![0x90, 0x00],
            0x32 | 0x30 => {
                let sfi = apdu[3] >> 3;
                let counter = apdu[2];
                let delta = u32::from(apdu[5]) << 16 | u32::from(apdu[6]) << 8 | u32::from(apdu[7]);
                let previous = self.counters.get(&(sfi, counter)).copied().unwrap_or(0);
                let value = if ins == 0x32 {
                    previous.wrapping_add(delta) & 0xFF_FFFF
                } else {
                    previous.wrapping_sub(delta) & 0xFF_FFFF
                };
                self.counters.insert((sfi, counter), value);
                if self.counter_postponed {
                    let bytes = [(value >> 16) as u8, (value >> 8) as u8, value as u8];
                    self.postponed.push(bytes.to_vec());
                    vec![0x62, 0x00]
                } else {
                    vec![
                        (value >> 16) as u8,
                        (value >> 8) as u8,
                        value as u8,
                        0x90,
                        0x00,
                    ]
                }
            }
            0x7C => {
                // SV Get, compat layouts
                let reload = apdu[3] == 0xB8;
                let balance = self.sv_balance;
                let balance_bytes = [
                    (balance >> 16) as u8,
                    (balance >> 8) as u8,
                    balance as u8,
                ];
                let mut out = vec![self.sv_kvc];
                out.extend_from_slice(&self.sv_tnum.to_be_bytes());
                out.extend_from_slice(&[0; 5]); // signature lo + challenge out
                out.extend_from_slice(&balance_bytes);
                if reload {
                    out.extend_from_slice(&[0; 22]);
                } else {
                    out.extend_from_slice(&[0; 19]);
                }
                out.extend_from_slice(&[0x90, 0x00]);
                out
            }
            0xB8 | 0xBA | 0xBC => {
                let amount = i32::from(i16::from_be_bytes(if ins == 0xB8 {
                    [apdu[10], apdu[11]]
                } else {
                    [apdu[5], apdu[6]]
                }));
                // the reload amount is 3 bytes; close enough for the mock:
                // reload uses its own field below
                let delta = if ins == 0xB8 {
                    let d = &apdu[5..];
                    // date(2) free1 kvc free2 amount(3)
                    i32::from(d[5]) << 16 | i32::from(d[6]) << 8 | i32::from(d[7])
                } else {
                    amount
                };
                self.sv_balance += delta;
                self.sv_tnum = self.sv_tnum.wrapping_add(1);
                if self.session_open {
                    self.postponed.push(vec![0xA5, 0xA6, 0xA7]);
                    vec![0x90, 0x00]
                } else {
                    vec![0x5A, 0x5B, 0x5C, 0x90, 0x00]
                }
            }
            0x84 => {
                let mut out = vec![0x11; 8];
                out.extend_from_slice(&[0x90, 0x00]);
                out
            }
            _ => vec![0x90, 0x00],
        }
    }
}

pub struct MockReader(pub Rc<RefCell<CardState>>);

impl CardReader for MockReader {
    fn transmit_card_request(
        &mut self,
        request: &CardRequest,
        _channel_control: ChannelControl,
    ) -> Result<CardResponse> {
        let mut state = self.0.borrow_mut();
        state.batches.push(request.apdu_requests().len());
        let mut responses = Vec::new();
        for apdu_request in request.apdu_requests() {
            let apdu = apdu_request.apdu().to_vec();
            if state.fail_on_ins == Some(apdu[1]) {
                bail!("reader I/O error on INS {:02X}h", apdu[1]);
            }
            state.transmitted.push(apdu.clone());
            let bytes = state.respond(&apdu);
            responses.push(ApduResponse::new(bytes).expect("mock response"));
        }
        Ok(CardResponse::new(responses))
    }
}

/// What the recording crypto service saw, shared through an `Rc`.
#[derive(Default)]
pub struct CryptoState {
    pub challenge_count: u32,
    pub mac_init: Option<(Vec<u8>, u8, u8)>,
    pub mac_updates: Vec<Vec<u8>>,
    pub finalized: u32,
    pub verified_session_macs: Vec<Vec<u8>>,
    pub verified_sv_macs: Vec<Vec<u8>>,
    pub session_mac_valid: bool,
    pub sv_mac_valid: bool,
    pub extended: bool,
}

impl CryptoState {
    pub fn valid() -> Self {
        Self {
            session_mac_valid: true,
            sv_mac_valid: true,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct MockCrypto(pub Rc<RefCell<CryptoState>>);

impl SymmetricCryptoSpi for MockCrypto {
    fn is_extended_mode_supported(&self) -> bool {
        self.0.borrow().extended
    }

    fn init_terminal_session_context(&mut self) -> Result<[u8; 8]> {
        let mut state = self.0.borrow_mut();
        state.challenge_count += 1;
        Ok([0xA0; 8])
    }

    fn init_terminal_session_mac(&mut self, open_session_data: &[u8], kif: u8, kvc: u8) -> Result<()> {
        self.0.borrow_mut().mac_init = Some((open_session_data.to_vec(), kif, kvc));
        Ok(())
    }

    fn update_terminal_session_mac(&mut self, apdu: &[u8]) -> Result<()> {
        self.0.borrow_mut().mac_updates.push(apdu.to_vec());
        Ok(())
    }

    fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>> {
        let mut state = self.0.borrow_mut();
        state.finalized += 1;
        Ok(if state.extended {
            vec![0x54; 8]
        } else {
            vec![0x4D, 0x41, 0x43, 0x21]
        })
    }

    fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<bool> {
        let mut state = self.0.borrow_mut();
        state.verified_session_macs.push(card_mac.to_vec());
        Ok(state.session_mac_valid)
    }

    fn cipher_pin_for_presentation(
        &mut self,
        _card_challenge: &[u8],
        _pin: &[u8; 4],
        _kif: u8,
        _kvc: u8,
    ) -> Result<Vec<u8>> {
        Ok(vec![0xEE; 16])
    }

    fn cipher_pin_for_modification(
        &mut self,
        _card_challenge: &[u8],
        _current_pin: &[u8; 4],
        _new_pin: &[u8; 4],
        _kif: u8,
        _kvc: u8,
    ) -> Result<Vec<u8>> {
        Ok(vec![0xEE; 16])
    }

    fn generate_sv_command_security_data(
        &mut self,
        data: &SvCommandSecurityData,
    ) -> Result<Vec<u8>> {
        Ok(vec![0x53; if data.extended_mode() { 17 } else { 12 }])
    }

    fn verify_card_sv_mac(&mut self, card_mac: &[u8]) -> Result<bool> {
        let mut state = self.0.borrow_mut();
        state.verified_sv_macs.push(card_mac.to_vec());
        Ok(state.sv_mac_valid)
    }

    fn cipher_card_key(
        &mut self,
        _card_challenge: &[u8],
        _issuer_kif: u8,
        _issuer_kvc: u8,
        _new_kif: u8,
        _new_kvc: u8,
    ) -> Result<Vec<u8>> {
        Ok(vec![0xCC; 24])
    }

    fn encipher_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        Ok(apdu.to_vec())
    }

    fn decipher_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        Ok(apdu.to_vec())
    }
}

/// Standard security setting around the recording crypto.
pub fn security_setting(crypto_state: &Rc<RefCell<CryptoState>>) -> SecuritySetting {
    security_setting_with(crypto_state, |builder| builder)
}

pub fn security_setting_with(
    crypto_state: &Rc<RefCell<CryptoState>>,
    configure: impl FnOnce(SecuritySettingBuilder) -> SecuritySettingBuilder,
) -> SecuritySetting {
    let crypto = Box::new(MockCrypto(Rc::clone(crypto_state))) as Box<dyn SymmetricCryptoSpi>;
    configure(SecuritySettingBuilder::default().crypto(crypto))
        .build()
        .expect("security setting")
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
