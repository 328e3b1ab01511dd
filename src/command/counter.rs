//! Increase and Decrease on counter files, including the postponed
//! mode of products whose patch defers the new counter value to the
//! session close.

use crate::apdu::{ApduRequest, ApduResponse};
use crate::card::product::CardClass;
use crate::card::CalypsoCard;
use crate::command::read::{check_record_number, check_sfi};
use crate::error::{Error, Result};
use crate::util::{counter_bytes, counter_value};
use log::trace;

const INS_INCREASE: u8 = 0x32;
const INS_DECREASE: u8 = 0x30;

/// Status word signalling "response postponed to session close".
pub const SW_POSTPONED: u16 = 0x6200;

/// Increase or Decrease one counter.
#[derive(Debug)]
pub struct CmdIncreaseDecrease {
    decrease: bool,
    sfi: u8,
    counter_number: u8,
    delta: u32,
    /// Counter value known before the command, required in postponed
    /// mode to maintain the image without a card response.
    previous: Option<u32>,
    postponed: bool,
    request: ApduRequest,
}

impl CmdIncreaseDecrease {
    pub fn new(
        card_class: CardClass,
        decrease: bool,
        sfi: u8,
        counter_number: u8,
        delta: u32,
        previous: Option<u32>,
        postponed: bool,
    ) -> Result<Self> {
        check_sfi(sfi)?;
        check_record_number(counter_number)?;
        if delta > 0xFF_FFFF {
            return Err(Error::IllegalArgument(format!(
                "counter delta {} exceeds 24 bits",
                delta
            )));
        }
        if postponed && previous.is_none() {
            return Err(Error::IllegalState(format!(
                "counter {} of file {:02X}h must be read before a postponed-mode {}",
                counter_number,
                sfi,
                if decrease { "decrease" } else { "increase" },
            )));
        }
        let ins = if decrease { INS_DECREASE } else { INS_INCREASE };
        let data = counter_bytes(delta);
        // postponed mode re-encodes the command as case 3: the card
        // answers 6200h with no data
        let le = if postponed { None } else { Some(0x00) };
        let mut request = ApduRequest::build(
            card_class.value(),
            ins,
            counter_number,
            sfi * 8,
            Some(&data),
            le,
        );
        if postponed {
            request = request.with_successful_status_word(SW_POSTPONED);
        }
        Ok(Self {
            decrease,
            sfi,
            counter_number,
            delta,
            previous,
            postponed,
            request,
        })
    }

    pub fn request(&self) -> &ApduRequest {
        &self.request
    }

    /// The value the counter will hold once the command succeeds, when
    /// the previous value is known.
    pub fn anticipated_value(&self) -> Option<u32> {
        self.previous.map(|prev| {
            if self.decrease {
                prev.wrapping_sub(self.delta) & 0xFF_FFFF
            } else {
                prev.wrapping_add(self.delta) & 0xFF_FFFF
            }
        })
    }

    pub fn is_postponed(&self) -> bool {
        self.postponed
    }

    pub fn is_decrease(&self) -> bool {
        self.decrease
    }

    pub fn parse(&mut self, card: &mut CalypsoCard, response: &ApduResponse) -> Result<()> {
        if response.status_word() == SW_POSTPONED {
            // the card deferred the value; maintain the image from the
            // previously read counter
            let value = self.anticipated_value().ok_or_else(|| {
                Error::IllegalState("postponed counter without a previous value".to_string())
            })?;
            trace!(
                "counter {} of file {:02X}h postponed, image set to {}",
                self.counter_number,
                self.sfi,
                value
            );
            return card.set_counter(self.sfi, self.counter_number, value);
        }
        let data = response.data_out();
        if data.len() != 3 {
            return Err(Error::UnexpectedResponseLength(format!(
                "counter response must be 3 bytes, got {}",
                data.len()
            )));
        }
        card.set_counter(self.sfi, self.counter_number, counter_value(data))
    }
}
