//! Secure session commands: Open Secure Session in its four wire
//! variants, Close Secure Session (including the cancellation form),
//! and the benign ratification APDU.

use crate::apdu::{ApduRequest, ApduResponse};
use crate::card::product::CardClass;
use crate::card::CalypsoCard;
use crate::error::{Error, Result};
use crate::transaction::WriteAccessLevel;
use crate::util::to_hex;
use log::trace;

const INS_OPEN_SESSION: u8 = 0x8A;
const INS_CLOSE_SESSION: u8 = 0x8E;
const INS_RATIFICATION: u8 = 0xB2;

/// Wire variant of the Open Secure Session command, fixed by the
/// product revision (or by the PKI session mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenSessionVariant {
    Rev1,
    Rev24,
    Rev3,
    Pki,
}

/// Decoded payload of an Open Secure Session response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOpenSession {
    pub card_challenge: Vec<u8>,
    pub previous_session_ratified: bool,
    pub manage_session_allowed: bool,
    pub kif: Option<u8>,
    pub kvc: Option<u8>,
    pub record_data: Vec<u8>,
}

/// Open Secure Session.
#[derive(Debug)]
pub struct CmdOpenSecureSession {
    variant: OpenSessionVariant,
    extended_mode: bool,
    /// Set when the session was pre-opened during selection; the
    /// response must then replay the stashed data exactly.
    pre_open: bool,
    write_access_level: WriteAccessLevel,
    sfi: u8,
    record_number: u8,
    request: ApduRequest,
    parsed: Option<ParsedOpenSession>,
    data_out: Option<Vec<u8>>,
}

impl CmdOpenSecureSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        card_class: CardClass,
        variant: OpenSessionVariant,
        extended_mode: bool,
        pre_open: bool,
        write_access_level: WriteAccessLevel,
        sfi: u8,
        record_number: u8,
        terminal_challenge: &[u8; 8],
    ) -> Result<Self> {
        if sfi > 0x1E {
            return Err(Error::IllegalArgument(format!("SFI {:02X}h out of range", sfi)));
        }
        let key_index = write_access_level.key_index();
        let (p1, p2, data): (u8, u8, Vec<u8>) = match variant {
            OpenSessionVariant::Rev1 => (
                record_number * 8 + key_index,
                sfi * 8,
                terminal_challenge.to_vec(),
            ),
            OpenSessionVariant::Rev24 => (
                0x80 + record_number * 8 + key_index,
                sfi * 8,
                terminal_challenge.to_vec(),
            ),
            OpenSessionVariant::Rev3 => {
                let p2 = sfi * 8 + if extended_mode { 2 } else { 1 };
                let data = if extended_mode {
                    let mut d = vec![terminal_challenge.len() as u8];
                    d.extend_from_slice(terminal_challenge);
                    d
                } else {
                    terminal_challenge.to_vec()
                };
                (record_number * 8 + key_index, p2, data)
            }
            OpenSessionVariant::Pki => (
                record_number * 8 + key_index,
                sfi * 8 + 3,
                terminal_challenge.to_vec(),
            ),
        };
        let request = ApduRequest::build(
            card_class.value(),
            INS_OPEN_SESSION,
            p1,
            p2,
            Some(&data),
            Some(0x00),
        );
        Ok(Self {
            variant,
            extended_mode,
            pre_open,
            write_access_level,
            sfi,
            record_number,
            request,
            parsed: None,
            data_out: None,
        })
    }

    pub fn variant(&self) -> OpenSessionVariant {
        self.variant
    }

    pub fn write_access_level(&self) -> WriteAccessLevel {
        self.write_access_level
    }

    pub fn is_pre_open(&self) -> bool {
        self.pre_open
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parsed(&self) -> Option<&ParsedOpenSession> {
        self.parsed.as_ref()
    }

    /// The raw response payload, the MAC chain's starting point.
    pub fn parsed_data_out(&self) -> Option<&[u8]> {
        self.data_out.as_deref()
    }

    /// Decode an Open Secure Session payload without touching the card
    /// image; also used to synchronize the MAC chain from pre-open data.
    pub fn parse_payload(&self, data: &[u8]) -> Result<ParsedOpenSession> {
        match self.variant {
            OpenSessionVariant::Rev3 if self.extended_mode => {
                if data.len() < 11 || data.len() != 11 + usize::from(data[10]) {
                    return Err(bad_length("rev 3 extended open session", data));
                }
                Ok(ParsedOpenSession {
                    card_challenge: data[0..3].to_vec(),
                    previous_session_ratified: data[7] & 0x01 == 0,
                    manage_session_allowed: data[7] & 0x02 != 0,
                    kif: Some(data[8]),
                    kvc: Some(data[9]),
                    record_data: data[11..].to_vec(),
                })
            }
            OpenSessionVariant::Rev3 => {
                if data.len() < 7 || data.len() != 7 + usize::from(data[6]) {
                    return Err(bad_length("rev 3 open session", data));
                }
                Ok(ParsedOpenSession {
                    card_challenge: data[0..3].to_vec(),
                    previous_session_ratified: data[3] == 0,
                    manage_session_allowed: false,
                    kif: Some(data[4]),
                    kvc: Some(data[5]),
                    record_data: data[7..].to_vec(),
                })
            }
            OpenSessionVariant::Rev24 => {
                let (ratified, data_offset) = match data.len() {
                    5 => (true, None),
                    34 => (true, Some(5)),
                    7 => (false, None),
                    36 => (false, Some(7)),
                    _ => return Err(bad_length("rev 2.4 open session", data)),
                };
                Ok(ParsedOpenSession {
                    card_challenge: data[1..5].to_vec(),
                    previous_session_ratified: ratified,
                    manage_session_allowed: false,
                    kif: None,
                    kvc: Some(data[0]),
                    record_data: data_offset.map_or_else(Vec::new, |o| data[o..o + 29].to_vec()),
                })
            }
            OpenSessionVariant::Rev1 => {
                let (ratified, data_offset) = match data.len() {
                    4 => (true, None),
                    33 => (true, Some(4)),
                    6 => (false, None),
                    35 => (false, Some(6)),
                    _ => return Err(bad_length("rev 1.0 open session", data)),
                };
                Ok(ParsedOpenSession {
                    card_challenge: data[0..4].to_vec(),
                    previous_session_ratified: ratified,
                    manage_session_allowed: false,
                    kif: None,
                    kvc: None,
                    record_data: data_offset.map_or_else(Vec::new, |o| data[o..o + 29].to_vec()),
                })
            }
            OpenSessionVariant::Pki => {
                // opaque certificate material handed to the asymmetric
                // crypto service; no symmetric key reference
                Ok(ParsedOpenSession {
                    card_challenge: Vec::new(),
                    previous_session_ratified: true,
                    manage_session_allowed: false,
                    kif: None,
                    kvc: None,
                    record_data: Vec::new(),
                })
            }
        }
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let data = response.data_out();
        if self.pre_open {
            match card.pre_open_data_out() {
                Some(expected) if expected.as_slice() == data => {}
                _ => {
                    return Err(Error::SecurityContext(format!(
                        "pre-opened session replayed different data: {}",
                        to_hex(data)
                    )))
                }
            }
        }
        let parsed = self.parse_payload(data)?;
        trace!(
            "open session: ratified={}, KIF={:?}, KVC={:?}",
            parsed.previous_session_ratified,
            parsed.kif,
            parsed.kvc
        );
        card.set_df_ratified(parsed.previous_session_ratified);
        if !parsed.record_data.is_empty() && self.record_number != 0 {
            card.set_content(self.sfi, self.record_number, &parsed.record_data)?;
        }
        self.parsed = Some(parsed);
        self.data_out = Some(data.to_vec());
        Ok(())
    }
}

/// Close Secure Session, in its regular and cancellation forms.
#[derive(Debug)]
pub struct CmdCloseSecureSession {
    cancellation: bool,
    /// An intermediate close of a multi-session transaction, followed
    /// by a fresh open in the same pipeline.
    intermediate: bool,
    extended_mode: bool,
    sv_postponed_index: Option<u8>,
    request: ApduRequest,
    postponed_data: Vec<Vec<u8>>,
    card_mac: Vec<u8>,
}

impl CmdCloseSecureSession {
    /// Regular close. The terminal MAC is patched in at finalization;
    /// `sv_postponed_index` addresses the SV entry of the postponed
    /// data when an SV operation ran inside the session.
    pub fn new(
        card_class: CardClass,
        extended_mode: bool,
        ratification_deferred: bool,
        sv_postponed_index: Option<u8>,
    ) -> Self {
        let mac_len = if extended_mode { 8 } else { 4 };
        let mut data = Vec::with_capacity(1 + mac_len);
        if let Some(index) = sv_postponed_index {
            data.push(index);
        }
        data.extend(std::iter::repeat(0u8).take(mac_len));
        let p1 = if ratification_deferred { 0x80 } else { 0x00 };
        let request = ApduRequest::build(
            card_class.value(),
            INS_CLOSE_SESSION,
            p1,
            0x00,
            Some(&data),
            Some(0x00),
        );
        Self {
            cancellation: false,
            intermediate: false,
            extended_mode,
            sv_postponed_index,
            request,
            postponed_data: Vec::new(),
            card_mac: Vec::new(),
        }
    }

    /// Mark this close as an intermediate one (multi-session split).
    pub fn into_intermediate(mut self) -> Self {
        self.intermediate = true;
        self
    }

    /// Session cancellation: a close with no terminal MAC. The card
    /// discards the staged modifications.
    pub fn new_cancellation(card_class: CardClass) -> Self {
        let request = ApduRequest::build(
            card_class.value(),
            INS_CLOSE_SESSION,
            0x00,
            0x00,
            None,
            Some(0x00),
        );
        Self {
            cancellation: true,
            intermediate: false,
            extended_mode: false,
            sv_postponed_index: None,
            request,
            postponed_data: Vec::new(),
            card_mac: Vec::new(),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn is_cancellation(&self) -> bool {
        self.cancellation
    }

    pub fn is_intermediate(&self) -> bool {
        self.intermediate
    }

    /// Index of the SV MAC inside the postponed data, when an SV
    /// operation ran in the closed session.
    pub fn sv_postponed_index(&self) -> Option<u8> {
        self.sv_postponed_index
    }

    /// Patch the terminal session MAC into the encoded APDU.
    pub fn set_terminal_mac(&mut self, mac: &[u8]) -> Result<()> {
        let mac_len = if self.extended_mode { 8 } else { 4 };
        if mac.len() != mac_len {
            return Err(Error::InconsistentData(format!(
                "terminal MAC must be {} bytes, got {}",
                mac_len,
                mac.len()
            )));
        }
        let apdu_len = self.request.apdu().len();
        // data sits between the header and the trailing Le
        self.request.patch_data(apdu_len - 1 - mac_len, mac);
        Ok(())
    }

    /// Postponed-data entries returned by the card, in order.
    pub fn postponed_data(&self) -> &[Vec<u8>] {
        &self.postponed_data
    }

    /// The session MAC returned by the card.
    pub fn card_mac(&self) -> &[u8] {
        &self.card_mac
    }

    pub fn parse(&mut self, _card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        if self.cancellation {
            return Ok(());
        }
        let data = response.data_out();
        let mac_len = if self.extended_mode { 8 } else { 4 };
        if data.len() < mac_len {
            return Err(bad_length("close session", data));
        }
        let boundary = data.len() - mac_len;
        let mac = &data[boundary..];
        let mut entries = Vec::new();
        let mut i = 0;
        while i < boundary {
            let len = usize::from(data[i]);
            i += 1;
            if i + len > boundary {
                return Err(bad_length("close session postponed data", data));
            }
            entries.push(data[i..i + len].to_vec());
            i += len;
        }
        trace!(
            "close session: {} postponed entr{}, MAC {}",
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" },
            to_hex(mac)
        );
        self.postponed_data = entries;
        self.card_mac = mac.to_vec();
        Ok(())
    }
}

/// The benign APDU sent after a deferred close to ratify the session
/// on contactless readers. Any status word is acceptable.
#[derive(Debug)]
pub struct CmdRatification {
    request: ApduRequest,
}

impl CmdRatification {
    pub fn new(card_class: CardClass) -> Self {
        Self {
            request: ApduRequest::build(
                card_class.value(),
                INS_RATIFICATION,
                0x00,
                0x00,
                None,
                Some(0x00),
            ),
        }
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }
}

fn bad_length(what: &str, data: &[u8]) -> Error {
    Error::UnexpectedResponseLength(format!(
        "{}: unexpected {}-byte payload ({})",
        what,
        data.len(),
        to_hex(data)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(
        variant: OpenSessionVariant,
        extended: bool,
        level: WriteAccessLevel,
        sfi: u8,
        rec: u8,
    ) -> CmdOpenSecureSession {
        CmdOpenSecureSession::new(
            if variant == OpenSessionVariant::Rev3 || variant == OpenSessionVariant::Pki {
                CardClass::Iso
            } else {
                CardClass::Legacy
            },
            variant,
            extended,
            false,
            level,
            sfi,
            rec,
            &[0x11; 8],
        )
        .unwrap()
    }

    #[test]
    fn rev3_encoding() {
        let cmd = open(OpenSessionVariant::Rev3, false, WriteAccessLevel::Debit, 0x07, 1);
        let apdu = cmd.request().apdu();
        // P1 = rec*8 + key index (DEBIT = 3), P2 = sfi*8 + 1
        assert_eq!(&apdu[..5], &[0x00, 0x8A, 0x0B, 0x39, 0x08]);
        assert_eq!(apdu.len(), 5 + 8 + 1);
    }

    #[test]
    fn rev3_extended_encoding() {
        let cmd = open(OpenSessionVariant::Rev3, true, WriteAccessLevel::Load, 0, 0);
        let apdu = cmd.request().apdu();
        // P2 low bits = 2, data prefixed by its length
        assert_eq!(&apdu[..6], &[0x00, 0x8A, 0x02, 0x02, 0x09, 0x08]);
    }

    #[test]
    fn rev24_encoding() {
        let cmd = open(OpenSessionVariant::Rev24, false, WriteAccessLevel::Perso, 0x08, 2);
        let apdu = cmd.request().apdu();
        assert_eq!(apdu[0], 0x94);
        assert_eq!(apdu[2], 0x80 + 2 * 8 + 1);
        assert_eq!(apdu[3], 0x08 * 8);
    }

    #[test]
    fn rev3_parse() {
        let cmd = open(OpenSessionVariant::Rev3, false, WriteAccessLevel::Debit, 0x07, 1);
        // challenge 3, not ratified, KIF 30, KVC 79, 4 bytes of data
        let payload = [0xA1, 0xA2, 0xA3, 0x01, 0x30, 0x79, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        let parsed = cmd.parse_payload(&payload).unwrap();
        assert_eq!(parsed.card_challenge, vec![0xA1, 0xA2, 0xA3]);
        assert!(!parsed.previous_session_ratified);
        assert_eq!(parsed.kif, Some(0x30));
        assert_eq!(parsed.kvc, Some(0x79));
        assert_eq!(parsed.record_data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn rev3_extended_parse_flags() {
        let cmd = open(OpenSessionVariant::Rev3, true, WriteAccessLevel::Debit, 0, 0);
        let mut payload = vec![0xA1, 0xA2, 0xA3, 0, 0, 0, 0x2A, 0x02, 0x30, 0x79, 0x00];
        let parsed = cmd.parse_payload(&payload).unwrap();
        assert!(parsed.previous_session_ratified);
        assert!(parsed.manage_session_allowed);
        payload[7] = 0x01;
        let parsed = cmd.parse_payload(&payload).unwrap();
        assert!(!parsed.previous_session_ratified);
        assert!(!parsed.manage_session_allowed);
    }

    #[test]
    fn rev24_legal_lengths() {
        let cmd = open(OpenSessionVariant::Rev24, false, WriteAccessLevel::Debit, 0, 0);
        assert!(cmd.parse_payload(&[0x79, 1, 2, 3, 4]).unwrap().previous_session_ratified);
        let parsed = cmd.parse_payload(&vec![0x79; 34]).unwrap();
        assert!(parsed.previous_session_ratified);
        assert_eq!(parsed.record_data.len(), 29);
        assert!(!cmd.parse_payload(&[0x79; 7]).unwrap().previous_session_ratified);
        let parsed = cmd.parse_payload(&vec![0x79; 36]).unwrap();
        assert!(!parsed.previous_session_ratified);
        assert_eq!(parsed.record_data.len(), 29);
        assert!(cmd.parse_payload(&[0x79; 8]).is_err());
        assert!(cmd.parse_payload(&[0x79; 35]).is_err());
    }

    #[test]
    fn rev1_legal_lengths() {
        let cmd = open(OpenSessionVariant::Rev1, false, WriteAccessLevel::Debit, 0, 0);
        assert!(cmd.parse_payload(&[1, 2, 3, 4]).unwrap().previous_session_ratified);
        assert!(!cmd.parse_payload(&[1, 2, 3, 4, 5, 6]).unwrap().previous_session_ratified);
        assert_eq!(cmd.parse_payload(&[0x55; 33]).unwrap().record_data.len(), 29);
        assert_eq!(cmd.parse_payload(&[0x55; 35]).unwrap().record_data.len(), 29);
        assert!(cmd.parse_payload(&[0x55; 5]).is_err());
        assert_eq!(cmd.parse_payload(&[1, 2, 3, 4]).unwrap().kvc, None);
    }

    #[test]
    fn close_mac_patching() {
        let mut cmd = CmdCloseSecureSession::new(CardClass::Iso, false, true, Some(0));
        assert_eq!(cmd.request().apdu(), &[0x00, 0x8E, 0x80, 0x00, 0x05, 0x00, 0, 0, 0, 0, 0x00]);
        cmd.set_terminal_mac(&[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        assert_eq!(
            cmd.request().apdu(),
            &[0x00, 0x8E, 0x80, 0x00, 0x05, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x00]
        );
        assert!(cmd.set_terminal_mac(&[0x00; 8]).is_err());
    }

    #[test]
    fn close_parse_postponed_entries() {
        let mut cmd = CmdCloseSecureSession::new(CardClass::Iso, false, false, Some(1));
        let mut card = CalypsoCard::blank();
        // two postponed entries then a 4-byte MAC
        let response = ApduResponse::from_parts(
            &[0x03, 0x01, 0x02, 0x03, 0x03, 0x0A, 0x0B, 0x0C, 0xE1, 0xE2, 0xE3, 0xE4],
            0x9000,
        );
        cmd.parse(&mut card, &response).unwrap();
        assert_eq!(cmd.postponed_data().len(), 2);
        assert_eq!(cmd.postponed_data()[1], vec![0x0A, 0x0B, 0x0C]);
        assert_eq!(cmd.card_mac(), &[0xE1, 0xE2, 0xE3, 0xE4]);
    }

    #[test]
    fn cancellation_has_no_data() {
        let cmd = CmdCloseSecureSession::new_cancellation(CardClass::Legacy);
        assert_eq!(cmd.request().apdu(), &[0x94, 0x8E, 0x00, 0x00, 0x00]);
        assert!(cmd.is_cancellation());
    }
}
