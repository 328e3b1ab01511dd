//! Stored Value commands: SV Get and the three modifying operations
//! (Reload, Debit, Undebit). The modifying commands carry a SAM
//! security block patched in at finalization.

use crate::apdu::{ApduRequest, ApduResponse};
use crate::card::product::CardClass;
use crate::card::{CalypsoCard, SvDebitLogRecord, SvLoadLogRecord};
use crate::error::{Error, Result};
use crate::spi::{SvCommandSecurityData, SymmetricCryptoSpi};
use crate::util::{be_uint, signed_int3, signed_int3_bytes, to_hex};
use log::trace;
use strum::{AsRefStr, Display};

const INS_SV_GET: u8 = 0x7C;
const INS_SV_RELOAD: u8 = 0xB8;
const INS_SV_DEBIT: u8 = 0xBA;
const INS_SV_UNDEBIT: u8 = 0xBC;

/// P2 of SV Get selecting which log the card returns.
const SV_GET_P2_RELOAD: u8 = 0xB8;
const SV_GET_P2_DEBIT: u8 = 0xBA;

/// The two SV operation families. Undebit belongs to the debit family:
/// it binds to an SV Get performed for [`SvOperation::Debit`].
#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "shouty_snake_case")]
pub enum SvOperation {
    Reload,
    Debit,
}

/// SV Get.
#[derive(Debug)]
pub struct CmdSvGet {
    operation: SvOperation,
    extended_mode: bool,
    header: [u8; 8],
    request: ApduRequest,
}

impl CmdSvGet {
    pub fn new(card_class: CardClass, operation: SvOperation, extended_mode: bool) -> Self {
        let p1 = if extended_mode { 0x01 } else { 0x00 };
        let p2 = match operation {
            SvOperation::Reload => SV_GET_P2_RELOAD,
            SvOperation::Debit => SV_GET_P2_DEBIT,
        };
        let cla = card_class.value();
        let request = ApduRequest::build(cla, INS_SV_GET, p1, p2, None, Some(0x00));
        // the request header signed by the SAM, zero-padded to 8 bytes
        let header = [cla, INS_SV_GET, p1, p2, 0x00, 0x00, 0x00, 0x00];
        Self {
            operation,
            extended_mode,
            header,
            request,
        }
    }

    pub fn operation(&self) -> SvOperation {
        self.operation
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        let data = response.data_out();
        let (kvc, tnum, balance, load_log, debit_log) = if self.extended_mode {
            if data.len() != 63 {
                return Err(bad_length("extended SV Get", data));
            }
            (
                data[8],
                be_uint(&data[9..11]) as u16,
                signed_int3(&data[19..22]),
                Some(SvLoadLogRecord::parse(&data[22..44])?),
                Some(SvDebitLogRecord::parse(&data[44..63])?),
            )
        } else {
            match (self.operation, data.len()) {
                (SvOperation::Reload, 33) => (
                    data[0],
                    be_uint(&data[1..3]) as u16,
                    signed_int3(&data[8..11]),
                    Some(SvLoadLogRecord::parse(&data[11..33])?),
                    None,
                ),
                (SvOperation::Debit, 30) => (
                    data[0],
                    be_uint(&data[1..3]) as u16,
                    signed_int3(&data[8..11]),
                    None,
                    Some(SvDebitLogRecord::parse(&data[11..30])?),
                ),
                _ => return Err(bad_length("SV Get", data)),
            }
        };
        trace!(
            "SV Get ({}): balance {}, TNum {}, KVC {:02X}h",
            self.operation,
            balance,
            tnum,
            kvc
        );
        card.set_sv_data(
            kvc,
            self.header,
            data.to_vec(),
            balance,
            tnum,
            load_log,
            debit_log,
        );
        Ok(())
    }
}

/// SV Reload.
#[derive(Debug)]
pub struct CmdSvReload {
    amount: i32,
    in_session: bool,
    extended_mode: bool,
    request: ApduRequest,
    sv_mac: Vec<u8>,
}

impl CmdSvReload {
    pub fn new(
        card_class: CardClass,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
        in_session: bool,
        extended_mode: bool,
    ) -> Result<Self> {
        if !(-8_388_608..=8_388_607).contains(&amount) {
            return Err(Error::IllegalArgument(format!(
                "SV reload amount {} exceeds 24 bits",
                amount
            )));
        }
        let sam_block_len = if extended_mode { 17 } else { 12 };
        let mut data = Vec::with_capacity(10 + sam_block_len);
        data.extend_from_slice(&date);
        data.push(free[0]);
        data.push(0x00); // KVC patched at finalization
        data.push(free[1]);
        data.extend_from_slice(&signed_int3_bytes(amount));
        data.extend_from_slice(&time);
        data.extend(std::iter::repeat(0u8).take(sam_block_len));
        let request = ApduRequest::build(
            card_class.value(),
            INS_SV_RELOAD,
            0x00,
            0x00,
            Some(&data),
            Some(0x00),
        );
        Ok(Self {
            amount,
            in_session,
            extended_mode,
            request,
            sv_mac: Vec::new(),
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    /// The SV MAC returned by the card, empty inside a session.
    pub fn sv_mac(&self) -> &[u8] {
        &self.sv_mac
    }

    pub fn is_in_session(&self) -> bool {
        self.in_session
    }

    pub fn finalize(
        &mut self,
        card: &CalypsoCard,
        crypto: &mut dyn SymmetricCryptoSpi,
    ) -> Result<()> {
        let sam_block_len = if self.extended_mode { 17 } else { 12 };
        let data_len = 10 + sam_block_len;
        let kvc = sv_context_kvc(card)?;
        self.request.patch_data(5 + 3, &[kvc]);
        let signed_head = self.request.apdu()[5..5 + 10].to_vec();
        let block = crypto
            .generate_sv_command_security_data(&SvCommandSecurityData::new(
                card.sv_get_header().unwrap(),
                card.sv_get_data().clone().unwrap_or_default(),
                signed_head,
                self.extended_mode,
            ))
            .map_err(Error::SamIo)?;
        if block.len() != sam_block_len {
            return Err(Error::InconsistentData(format!(
                "SAM SV block must be {} bytes, got {}",
                sam_block_len,
                block.len()
            )));
        }
        self.request.patch_data(5 + data_len - sam_block_len, &block);
        Ok(())
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        self.sv_mac = check_sv_response(self.in_session, self.extended_mode, response)?;
        card.apply_sv_operation(self.amount);
        Ok(())
    }
}

/// SV Debit or SV Undebit.
#[derive(Debug)]
pub struct CmdSvDebitOrUndebit {
    undebit: bool,
    amount: i32,
    in_session: bool,
    extended_mode: bool,
    request: ApduRequest,
    sv_mac: Vec<u8>,
}

impl CmdSvDebitOrUndebit {
    pub fn new(
        card_class: CardClass,
        undebit: bool,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        in_session: bool,
        extended_mode: bool,
    ) -> Result<Self> {
        if !(0..=32_767).contains(&amount) {
            return Err(Error::IllegalArgument(format!(
                "SV debit amount {} out of range [0, 32767]",
                amount
            )));
        }
        // the debit command carries the amount negated
        let wire_amount = if undebit { amount as i16 } else { -(amount as i16) };
        let sam_block_len = if extended_mode { 17 } else { 12 };
        let mut data = Vec::with_capacity(7 + sam_block_len);
        data.extend_from_slice(&wire_amount.to_be_bytes());
        data.extend_from_slice(&date);
        data.extend_from_slice(&time);
        data.push(0x00); // KVC patched at finalization
        data.extend(std::iter::repeat(0u8).take(sam_block_len));
        let ins = if undebit { INS_SV_UNDEBIT } else { INS_SV_DEBIT };
        let request = ApduRequest::build(
            card_class.value(),
            ins,
            0x00,
            0x00,
            Some(&data),
            Some(0x00),
        );
        Ok(Self {
            undebit,
            amount,
            in_session,
            extended_mode,
            request,
            sv_mac: Vec::new(),
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    pub fn sv_mac(&self) -> &[u8] {
        &self.sv_mac
    }

    pub fn is_in_session(&self) -> bool {
        self.in_session
    }

    pub fn is_undebit(&self) -> bool {
        self.undebit
    }

    /// The balance change this command applies once accepted.
    pub fn balance_delta(&self) -> i32 {
        if self.undebit {
            self.amount
        } else {
            -self.amount
        }
    }

    pub fn finalize(
        &mut self,
        card: &CalypsoCard,
        crypto: &mut dyn SymmetricCryptoSpi,
    ) -> Result<()> {
        let sam_block_len = if self.extended_mode { 17 } else { 12 };
        let data_len = 7 + sam_block_len;
        let kvc = sv_context_kvc(card)?;
        self.request.patch_data(5 + 6, &[kvc]);
        let signed_head = self.request.apdu()[5..5 + 7].to_vec();
        let block = crypto
            .generate_sv_command_security_data(&SvCommandSecurityData::new(
                card.sv_get_header().unwrap(),
                card.sv_get_data().clone().unwrap_or_default(),
                signed_head,
                self.extended_mode,
            ))
            .map_err(Error::SamIo)?;
        if block.len() != sam_block_len {
            return Err(Error::InconsistentData(format!(
                "SAM SV block must be {} bytes, got {}",
                sam_block_len,
                block.len()
            )));
        }
        self.request.patch_data(5 + data_len - sam_block_len, &block);
        Ok(())
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        self.sv_mac = check_sv_response(self.in_session, self.extended_mode, response)?;
        card.apply_sv_operation(self.balance_delta());
        Ok(())
    }
}

fn sv_context_kvc(card: &CalypsoCard) -> Result<u8> {
    match (card.sv_kvc(), card.sv_get_header()) {
        (Some(kvc), Some(_)) => Ok(kvc),
        _ => Err(Error::IllegalState(
            "no SV Get context available for the SV operation".to_string(),
        )),
    }
}

/// Outside a session the card returns its SV MAC immediately; inside a
/// session the MAC is postponed to the close and the response is empty.
fn check_sv_response(
    in_session: bool,
    extended_mode: bool,
    response: &ApduResponse,
) -> Result<Vec<u8>> {
    let data = response.data_out();
    let expected = if in_session {
        0
    } else if extended_mode {
        6
    } else {
        3
    };
    if data.len() != expected {
        return Err(bad_length("SV operation", data));
    }
    Ok(data.to_vec())
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

    fn sv_get_debit_payload(balance: i32, tnum: u16, kvc: u8) -> Vec<u8> {
        let mut data = vec![0u8; 30];
        data[0] = kvc;
        data[1..3].copy_from_slice(&tnum.to_be_bytes());
        data[8..11].copy_from_slice(&signed_int3_bytes(balance));
        let mut debit_log = vec![0u8; 19];
        debit_log[14..17].copy_from_slice(&signed_int3_bytes(balance));
        data[11..30].copy_from_slice(&debit_log);
        data
    }

    #[test]
    fn sv_get_encoding() {
        let cmd = CmdSvGet::new(CardClass::Iso, SvOperation::Debit, false);
        assert_eq!(cmd.request().apdu(), &[0x00, 0x7C, 0x00, 0xBA, 0x00]);
        let cmd = CmdSvGet::new(CardClass::Iso, SvOperation::Reload, true);
        assert_eq!(cmd.request().apdu(), &[0x00, 0x7C, 0x01, 0xB8, 0x00]);
    }

    #[test]
    fn sv_get_parse_fills_image() {
        let mut cmd = CmdSvGet::new(CardClass::Iso, SvOperation::Debit, false);
        let mut card = CalypsoCard::blank();
        let response = ApduResponse::from_parts(&sv_get_debit_payload(1000, 42, 0x79), 0x9000);
        cmd.parse(&mut card, &response).unwrap();
        assert_eq!(card.sv_balance(), Some(1000));
        assert_eq!(card.sv_last_tnum(), Some(42));
        assert_eq!(card.sv_kvc(), Some(0x79));
        assert_eq!(
            card.sv_get_header(),
            Some([0x00, 0x7C, 0x00, 0xBA, 0x00, 0x00, 0x00, 0x00])
        );
        assert!(card.sv_debit_log().is_some());
        assert!(card.sv_load_log().is_none());
    }

    #[test]
    fn sv_get_rejects_wrong_length_for_operation() {
        let mut cmd = CmdSvGet::new(CardClass::Iso, SvOperation::Reload, false);
        let mut card = CalypsoCard::blank();
        let response = ApduResponse::from_parts(&sv_get_debit_payload(0, 0, 0), 0x9000);
        assert!(matches!(
            cmd.parse(&mut card, &response),
            Err(Error::UnexpectedResponseLength(_))
        ));
    }

    #[test]
    fn sv_debit_wire_amount_is_negative() {
        let cmd = CmdSvDebitOrUndebit::new(
            CardClass::Iso,
            false,
            150,
            [0, 0],
            [0, 0],
            true,
            false,
        )
        .unwrap();
        let apdu = cmd.request().apdu();
        assert_eq!(apdu[1], 0xBA);
        // -150 big-endian
        assert_eq!(&apdu[5..7], &[0xFF, 0x6A]);
        assert_eq!(cmd.balance_delta(), -150);
    }

    #[test]
    fn sv_undebit_keeps_amount_positive() {
        let cmd = CmdSvDebitOrUndebit::new(
            CardClass::Iso,
            true,
            150,
            [0, 0],
            [0, 0],
            true,
            false,
        )
        .unwrap();
        assert_eq!(cmd.request().apdu()[1], 0xBC);
        assert_eq!(&cmd.request().apdu()[5..7], &[0x00, 0x96]);
        assert_eq!(cmd.balance_delta(), 150);
    }

    #[test]
    fn sv_modifying_response_lengths() {
        let mut card = CalypsoCard::blank();
        card.set_sv_data(0x79, [0; 8], vec![], 1000, 42, None, None);
        let mut in_session = CmdSvDebitOrUndebit::new(
            CardClass::Iso,
            false,
            150,
            [0, 0],
            [0, 0],
            true,
            false,
        )
        .unwrap();
        in_session
            .parse(&mut card, &ApduResponse::from_parts(&[], 0x9000))
            .unwrap();
        assert_eq!(card.sv_balance(), Some(850));
        assert_eq!(card.sv_last_tnum(), Some(43));

        let mut outside = CmdSvReload::new(
            CardClass::Iso,
            500,
            [0, 0],
            [0, 0],
            [0, 0],
            false,
            false,
        )
        .unwrap();
        assert!(outside
            .parse(&mut card, &ApduResponse::from_parts(&[], 0x9000))
            .is_err());
        outside
            .parse(&mut card, &ApduResponse::from_parts(&[0xA1, 0xA2, 0xA3], 0x9000))
            .unwrap();
        assert_eq!(outside.sv_mac(), &[0xA1, 0xA2, 0xA3]);
        assert_eq!(card.sv_balance(), Some(1350));
    }

    #[test]
    fn reload_amount_range() {
        assert!(CmdSvReload::new(
            CardClass::Iso,
            8_388_608,
            [0, 0],
            [0, 0],
            [0, 0],
            false,
            false
        )
        .is_err());
        assert!(
            CmdSvDebitOrUndebit::new(CardClass::Iso, false, -1, [0, 0], [0, 0], false, false)
                .is_err()
        );
    }
}
