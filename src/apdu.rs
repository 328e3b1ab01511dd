//! APDU primitives: single requests and responses, batched card
//! requests, and the channel control passed down to the reader.

use crate::error::{Error, Result};
use crate::util::to_hex;
use getset::{CopyGetters, Getters};
use serde::Serialize;
use strum::Display;

/// The implicit success status word.
pub const SW_OK: u16 = 0x9000;

/// Bytes of an ISO-7816 command header (CLA, INS, P1, P2, Lc).
pub const APDU_HEADER_LEN: usize = 5;

/// What the reader should do with the physical channel once the batch
/// completed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChannelControl {
    /// Keep the channel open for a subsequent exchange.
    KeepOpen,
    /// Release the channel after the last response.
    CloseAfter,
}

/// One encoded card command APDU.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct ApduRequest {
    /// The raw APDU bytes as transmitted.
    #[get = "pub"]
    apdu: Vec<u8>,
    /// Whether the APDU carries both command data and an Le byte
    /// (ISO case 4). The trailing Le is stripped before the bytes are
    /// fed to the session digest.
    #[get_copy = "pub"]
    case4: bool,
    /// Status words accepted as successful besides `0x9000`.
    #[get = "pub"]
    successful_status_words: Vec<u16>,
}

impl ApduRequest {
    /// Assemble `CLA | INS | P1 | P2 | [Lc | data] | [Le]`.
    pub fn build(cla: u8, ins: u8, p1: u8, p2: u8, data: Option<&[u8]>, le: Option<u8>) -> Self {
        let mut apdu = Vec::with_capacity(APDU_HEADER_LEN + data.map_or(0, <[u8]>::len) + 1);
        apdu.push(cla);
        apdu.push(ins);
        apdu.push(p1);
        apdu.push(p2);
        if let Some(data) = data {
            debug_assert!(!data.is_empty() && data.len() <= 255);
            apdu.push(data.len() as u8);
            apdu.extend_from_slice(data);
        }
        if let Some(le) = le {
            apdu.push(le);
        }
        Self {
            case4: data.is_some() && le.is_some(),
            apdu,
            successful_status_words: Vec::new(),
        }
    }

    /// Accept an additional status word as successful.
    pub fn with_successful_status_word(mut self, sw: u16) -> Self {
        self.successful_status_words.push(sw);
        self
    }

    /// The bytes covered by the session MAC: the full APDU for cases
    /// 1 to 3, the APDU without its trailing Le for case 4.
    pub fn digest_input(&self) -> &[u8] {
        if self.case4 {
            &self.apdu[..self.apdu.len() - 1]
        } else {
            &self.apdu
        }
    }

    /// Patch `len` bytes at `offset` in the encoded APDU. Used by
    /// commands whose cryptogram is only available at finalization.
    pub fn patch_data(&mut self, offset: usize, bytes: &[u8]) {
        self.apdu[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Replace the whole encoded APDU, keeping the case flag.
    pub fn replace_apdu(&mut self, apdu: Vec<u8>) {
        self.apdu = apdu;
    }
}

/// One card response APDU: data-out followed by SW1SW2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApduResponse {
    bytes: Vec<u8>,
}

impl ApduResponse {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::UnexpectedResponseLength(format!(
                "response shorter than a status word: {}",
                to_hex(&bytes)
            )));
        }
        Ok(Self { bytes })
    }

    /// Build a response from data-out and status word, used for
    /// anticipated responses.
    pub fn from_parts(data_out: &[u8], sw: u16) -> Self {
        let mut bytes = Vec::with_capacity(data_out.len() + 2);
        bytes.extend_from_slice(data_out);
        bytes.push((sw >> 8) as u8);
        bytes.push(sw as u8);
        Self { bytes }
    }

    /// The complete R-APDU, as fed to the session digest.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The response payload without the status word.
    pub fn data_out(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 2]
    }

    /// SW1SW2 as a 16-bit big-endian word.
    pub fn status_word(&self) -> u16 {
        let n = self.bytes.len();
        (u16::from(self.bytes[n - 2]) << 8) | u16::from(self.bytes[n - 1])
    }
}

/// An ordered batch of APDUs for one reader exchange.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct CardRequest {
    #[get = "pub"]
    apdu_requests: Vec<ApduRequest>,
    /// When set, the reader stops transmitting at the first APDU whose
    /// status word is not in the request's successful set.
    #[get_copy = "pub"]
    stop_on_unsuccessful: bool,
}

impl CardRequest {
    pub fn new(apdu_requests: Vec<ApduRequest>, stop_on_unsuccessful: bool) -> Self {
        Self {
            apdu_requests,
            stop_on_unsuccessful,
        }
    }
}

/// The reader's answer to a [`CardRequest`]; may be shorter than the
/// request when transmission stopped on an error.
#[derive(Debug, Clone, Getters)]
pub struct CardResponse {
    #[get = "pub"]
    apdu_responses: Vec<ApduResponse>,
}

impl CardResponse {
    pub fn new(apdu_responses: Vec<ApduResponse>) -> Self {
        Self { apdu_responses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_case2() {
        let req = ApduRequest::build(0x00, 0xB2, 0x01, 0x3C, None, Some(0x00));
        assert_eq!(req.apdu(), &[0x00, 0xB2, 0x01, 0x3C, 0x00]);
        assert!(!req.case4());
        assert_eq!(req.digest_input(), req.apdu().as_slice());
    }

    #[test]
    fn build_case3() {
        let req = ApduRequest::build(0x00, 0xDC, 0x01, 0x44, Some(&[0xAA, 0xBB]), None);
        assert_eq!(req.apdu(), &[0x00, 0xDC, 0x01, 0x44, 0x02, 0xAA, 0xBB]);
        assert_eq!(req.digest_input(), req.apdu().as_slice());
    }

    #[test]
    fn case4_le_stripped_from_digest_input() {
        let req = ApduRequest::build(0x00, 0x8A, 0x19, 0x39, Some(&[0x01; 8]), Some(0x00));
        assert!(req.case4());
        assert_eq!(req.apdu().len(), 14);
        assert_eq!(req.digest_input().len(), 13);
    }

    #[test]
    fn response_split() {
        let resp = ApduResponse::new(vec![0x11, 0x22, 0x90, 0x00]).unwrap();
        assert_eq!(resp.data_out(), &[0x11, 0x22]);
        assert_eq!(resp.status_word(), 0x9000);
        assert!(ApduResponse::new(vec![0x90]).is_err());
    }

    #[test]
    fn response_from_parts() {
        let resp = ApduResponse::from_parts(&[0x01, 0x02], 0x6200);
        assert_eq!(resp.bytes(), &[0x01, 0x02, 0x62, 0x00]);
        assert_eq!(resp.status_word(), 0x6200);
    }
}
