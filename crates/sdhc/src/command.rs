//! Command descriptions, response decoding and card-status checks.

use std::time::Duration;

use bitflags::bitflags;
use sdhc_hw::card::{app_opcode, io_arg, opcode, r1, r5};
use sdhc_hw::mmio::sdhc::command as cmdreg;

use crate::data::Direction;
use crate::error::{Error, Result};

/// Response format expected from the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    None,
    R1,
    /// R1 followed by busy signalling on DAT0
    R1b,
    /// 136-bit CID/CSD
    R2,
    /// OCR, no CRC
    R3,
    /// SDIO OCR, no CRC
    R4,
    /// SDIO direct I/O; busy guarded like R1b
    R5,
    /// Published RCA
    R6,
    /// Interface condition echo
    R7,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseFlags: u8 {
        const PRESENT = 1 << 0;
        const LONG = 1 << 1;
        const CRC = 1 << 2;
        const BUSY = 1 << 3;
        const OPCODE = 1 << 4;
    }
}

impl ResponseType {
    pub fn flags(self) -> ResponseFlags {
        use ResponseFlags as F;
        match self {
            ResponseType::None => F::empty(),
            ResponseType::R1 | ResponseType::R6 | ResponseType::R7 => F::PRESENT | F::CRC | F::OPCODE,
            ResponseType::R1b | ResponseType::R5 => F::PRESENT | F::CRC | F::OPCODE | F::BUSY,
            ResponseType::R2 => F::PRESENT | F::LONG | F::CRC,
            ResponseType::R3 | ResponseType::R4 => F::PRESENT,
        }
    }

    pub fn busy(self) -> bool {
        self.flags().contains(ResponseFlags::BUSY)
    }

    /// Response type, CRC check and index check bits of the command register
    fn register_bits(self) -> u16 {
        let flags = self.flags();
        let mut bits = if !flags.contains(ResponseFlags::PRESENT) {
            cmdreg::RESP_NONE
        } else if flags.contains(ResponseFlags::LONG) {
            cmdreg::RESP_LONG
        } else if flags.contains(ResponseFlags::BUSY) {
            cmdreg::RESP_SHORT_BUSY
        } else {
            cmdreg::RESP_SHORT
        };
        if flags.contains(ResponseFlags::CRC) {
            bits |= cmdreg::CRC_CHECK;
        }
        if flags.contains(ResponseFlags::OPCODE) {
            bits |= cmdreg::INDEX_CHECK;
        }
        bits
    }
}

bitflags! {
    /// R1 card status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CardStatus: u32 {
        const OUT_OF_RANGE = r1::OUT_OF_RANGE;
        const ADDRESS_ERROR = r1::ADDRESS_ERROR;
        const BLOCK_LEN_ERROR = r1::BLOCK_LEN_ERROR;
        const ERASE_SEQ_ERROR = r1::ERASE_SEQ_ERROR;
        const ERASE_PARAM = r1::ERASE_PARAM;
        const WP_VIOLATION = r1::WP_VIOLATION;
        const CARD_IS_LOCKED = r1::CARD_IS_LOCKED;
        const LOCK_UNLOCK_FAILED = r1::LOCK_UNLOCK_FAILED;
        const COM_CRC_ERROR = r1::COM_CRC_ERROR;
        const ILLEGAL_COMMAND = r1::ILLEGAL_COMMAND;
        const CARD_ECC_FAILED = r1::CARD_ECC_FAILED;
        const CC_ERROR = r1::CC_ERROR;
        const ERROR = r1::ERROR;
        const CID_CSD_OVERWRITE = r1::CID_CSD_OVERWRITE;
        const WP_ERASE_SKIP = r1::WP_ERASE_SKIP;
        const CARD_ECC_DISABLED = r1::CARD_ECC_DISABLED;
        const ERASE_RESET = r1::ERASE_RESET;
        const READY_FOR_DATA = r1::READY_FOR_DATA;
        const SWITCH_ERROR = r1::SWITCH_ERROR;
        const EXCEPTION_EVENT = r1::EXCEPTION_EVENT;
        const APP_CMD = r1::APP_CMD;
        const _ = !0;
    }
}

impl CardStatus {
    pub const ERRORS: Self = Self::from_bits_retain(r1::ERROR_MASK);

    pub fn current_state(self) -> u8 {
        ((self.bits() & r1::CURRENT_STATE_MASK) >> r1::CURRENT_STATE_SHIFT) as u8
    }

    pub fn errors(self) -> Self {
        self & Self::ERRORS
    }

    /// Maps error bits to the driver error they imply, if any
    pub fn check(self) -> Result<()> {
        let errors = self.errors();
        if errors.is_empty() {
            Ok(())
        } else if errors.intersects(Self::WP_VIOLATION | Self::WP_ERASE_SKIP) {
            Err(Error::WriteProtected)
        } else {
            Err(Error::CardStatus(errors))
        }
    }
}

bitflags! {
    /// R5 response flags (bits 15:8 of the SDIO response)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct R5Flags: u32 {
        const COM_CRC_ERROR = r5::COM_CRC_ERROR;
        const ILLEGAL_COMMAND = r5::ILLEGAL_COMMAND;
        const ERROR = r5::ERROR;
        const FUNCTION_NUMBER = r5::FUNCTION_NUMBER;
        const OUT_OF_RANGE = r5::OUT_OF_RANGE;
        const _ = !0;
    }
}

impl R5Flags {
    pub const ERRORS: Self = Self::from_bits_retain(r5::ERROR_MASK);
}

/// One command to put on the CMD line
#[derive(Debug, Clone)]
pub struct Command {
    pub opcode: u8,
    pub argument: u32,
    pub response: ResponseType,
    /// Issue with the abort command type (CMD12, CMD52 I/O abort)
    pub abort: bool,
    /// Overrides the configured retry count
    pub retries: Option<u32>,
    /// Overrides the configured response/busy timeout
    pub timeout: Option<Duration>,
    /// Skip R1/R5 error checks; the caller inspects the status itself
    pub raw_status: bool,
}

impl Command {
    pub fn new(opcode: u8, argument: u32, response: ResponseType) -> Self {
        Self {
            opcode,
            argument,
            response,
            abort: false,
            retries: None,
            timeout: None,
            raw_status: false,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn abort(mut self) -> Self {
        self.abort = true;
        self
    }

    pub fn raw_status(mut self) -> Self {
        self.raw_status = true;
        self
    }

    pub fn stop_transmission() -> Self {
        Self::new(opcode::STOP_TRANSMISSION, 0, ResponseType::R1b).abort()
    }

    /// Value for the command register
    pub fn register_word(&self, data_present: bool) -> u16 {
        let mut word = ((self.opcode as u16 & cmdreg::INDEX_MASK) << cmdreg::INDEX_SHIFT)
            | self.response.register_bits();
        if data_present {
            word |= cmdreg::DATA_PRESENT;
        }
        if self.abort {
            word |= cmdreg::TYPE_ABORT;
        }
        word
    }

    /// Direction of the data phase this command carries, for opcodes whose
    /// direction is fixed. CMD53 takes it from the R/W flag in the argument.
    pub fn data_direction(&self) -> Option<Direction> {
        match self.opcode {
            opcode::READ_SINGLE_BLOCK
            | opcode::READ_MULTIPLE_BLOCK
            | opcode::SEND_TUNING_BLOCK_HS200
            | opcode::SEND_WRITE_PROT
            | opcode::SEND_WRITE_PROT_TYPE
            | opcode::QUERY_PARTITION
            | app_opcode::SD_STATUS
            | app_opcode::SEND_NUM_WR_BLOCKS
            | app_opcode::SEND_SCR => Some(Direction::Read),
            opcode::WRITE_BLOCK
            | opcode::WRITE_MULTIPLE_BLOCK
            | opcode::PROGRAM_CSD
            | opcode::LOCK_UNLOCK
            | opcode::SET_TIME => Some(Direction::Write),
            opcode::IO_RW_EXTENDED if self.argument & io_arg::WRITE != 0 => Some(Direction::Write),
            opcode::IO_RW_EXTENDED => Some(Direction::Read),
            _ => None,
        }
    }

    /// Rejects a data phase that runs against the command's direction
    pub(crate) fn check_direction(&self, data: Option<Direction>) -> Result<()> {
        match (self.data_direction(), data) {
            (Some(expected), Some(actual)) if expected != actual => {
                Err(Error::InvalidRequest("data direction does not match the command"))
            }
            _ => Ok(()),
        }
    }
}

/// Decoded response registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub kind: ResponseType,
    /// For R2, the 128 register bits with bit 127 at the top of word 0
    /// (CRC stripped). Otherwise word 0 holds the 32-bit response.
    pub words: [u32; 4],
}

impl Response {
    pub fn empty() -> Self {
        Self {
            kind: ResponseType::None,
            words: [0; 4],
        }
    }

    /// Decodes raw response registers. The controller stores R2 bits 127:8 in
    /// RESP0..RESP3 with the CRC byte dropped, so each word is shifted up a
    /// byte and borrows the top byte of the word below it.
    pub fn decode(kind: ResponseType, regs: [u32; 4]) -> Self {
        let words = match kind {
            ResponseType::R2 => [
                (regs[3] << 8) | (regs[2] >> 24),
                (regs[2] << 8) | (regs[1] >> 24),
                (regs[1] << 8) | (regs[0] >> 24),
                regs[0] << 8,
            ],
            ResponseType::None => [0; 4],
            _ => [regs[0], 0, 0, 0],
        };
        Self { kind, words }
    }

    pub fn word(&self) -> u32 {
        self.words[0]
    }

    /// R3/R4 operating conditions
    pub fn ocr(&self) -> u32 {
        self.words[0]
    }

    /// R2 payload as one 128-bit value
    pub fn bits128(&self) -> u128 {
        self.words.iter().fold(0u128, |acc, w| (acc << 32) | *w as u128)
    }

    pub fn card_status(&self) -> CardStatus {
        CardStatus::from_bits_retain(self.words[0])
    }

    /// R6: published RCA
    pub fn rca(&self) -> u16 {
        (self.words[0] >> 16) as u16
    }

    /// R6 carries a compressed status in bits 15:0
    pub fn r6_status(&self) -> CardStatus {
        let w = self.words[0];
        let bits = ((w & 0x8000) << 8) | ((w & 0x4000) << 8) | ((w & 0x2000) << 6) | (w & 0x1FFF);
        CardStatus::from_bits_retain(bits)
    }

    pub fn r5_flags(&self) -> R5Flags {
        R5Flags::from_bits_retain(self.words[0] & 0xFF00)
    }

    pub fn r5_data(&self) -> u8 {
        (self.words[0] & r5::DATA_MASK) as u8
    }

    /// Applies the card-status checks that decide whether the command failed
    pub fn check(&self, opcode: u8) -> Result<()> {
        match self.kind {
            ResponseType::R1 | ResponseType::R1b => {
                if opcode == opcode::STOP_TRANSMISSION || opcode == opcode::SEND_STATUS {
                    return Ok(());
                }
                self.card_status().check()
            }
            ResponseType::R6 => self.r6_status().check(),
            ResponseType::R5 => {
                let errors = self.r5_flags() & R5Flags::ERRORS;
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(Error::SdioResponse(errors))
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdhc_hw::mmio::sdhc::command as c;

    #[test]
    fn register_word_encodes_response_and_flags() {
        let cmd = Command::new(opcode::READ_MULTIPLE_BLOCK, 0, ResponseType::R1);
        let word = cmd.register_word(true);
        assert_eq!(word >> 8, 18);
        assert_eq!(word & c::RESP_MASK, c::RESP_SHORT);
        assert_ne!(word & c::DATA_PRESENT, 0);
        assert_ne!(word & c::INDEX_CHECK, 0);

        let stop = Command::stop_transmission().register_word(false);
        assert_eq!(stop & c::RESP_MASK, c::RESP_SHORT_BUSY);
        assert_eq!(stop & c::TYPE_MASK, c::TYPE_ABORT);

        let cid = Command::new(opcode::ALL_SEND_CID, 0, ResponseType::R2).register_word(false);
        assert_eq!(cid & c::RESP_MASK, c::RESP_LONG);
        assert_eq!(cid & c::INDEX_CHECK, 0);

        let ocr = Command::new(opcode::SEND_OP_COND, 0, ResponseType::R3).register_word(false);
        assert_eq!(ocr & (c::CRC_CHECK | c::INDEX_CHECK), 0);
    }

    #[test]
    fn r5_is_busy_guarded() {
        assert!(ResponseType::R5.busy());
        assert!(ResponseType::R1b.busy());
        assert!(!ResponseType::R1.busy());
    }

    #[test]
    fn long_response_is_realigned() {
        let full: u128 = 0x0123_4567_89AB_CDEF_FEDC_BA98_7654_3200;
        let stored = full >> 8;
        let regs = [
            stored as u32,
            (stored >> 32) as u32,
            (stored >> 64) as u32,
            (stored >> 96) as u32,
        ];
        let resp = Response::decode(ResponseType::R2, regs);
        assert_eq!(resp.words, [0x0123_4567, 0x89AB_CDEF, 0xFEDC_BA98, 0x7654_3200]);
        assert_eq!(resp.bits128(), full);
    }

    #[test]
    fn r1_errors_map_to_driver_errors() {
        let ok = Response::decode(ResponseType::R1, [0x900, 0, 0, 0]);
        assert_eq!(ok.check(opcode::READ_SINGLE_BLOCK), Ok(()));
        assert_eq!(ok.card_status().current_state(), 4);

        let wp = Response::decode(ResponseType::R1, [r1::WP_VIOLATION, 0, 0, 0]);
        assert_eq!(wp.check(opcode::WRITE_BLOCK), Err(Error::WriteProtected));

        let range = Response::decode(ResponseType::R1, [r1::OUT_OF_RANGE, 0, 0, 0]);
        assert_eq!(range.check(opcode::STOP_TRANSMISSION), Ok(()));
        assert!(matches!(
            range.check(opcode::READ_MULTIPLE_BLOCK),
            Err(Error::CardStatus(s)) if s.contains(CardStatus::OUT_OF_RANGE)
        ));
    }

    #[test]
    fn r6_status_expands_to_r1_positions() {
        let resp = Response::decode(ResponseType::R6, [0xABCD_4500, 0, 0, 0]);
        assert_eq!(resp.rca(), 0xABCD);
        assert!(resp.r6_status().contains(CardStatus::ILLEGAL_COMMAND));
        assert_eq!(resp.check(opcode::SET_RELATIVE_ADDR), Err(Error::CardStatus(CardStatus::ILLEGAL_COMMAND)));
    }

    #[test]
    fn r5_errors_are_reported() {
        let resp = Response::decode(ResponseType::R5, [r5::OUT_OF_RANGE | 0x5A, 0, 0, 0]);
        assert_eq!(resp.r5_data(), 0x5A);
        assert_eq!(
            resp.check(opcode::IO_RW_DIRECT),
            Err(Error::SdioResponse(R5Flags::OUT_OF_RANGE))
        );
    }

    #[test]
    fn data_direction_follows_the_opcode() {
        let read = Command::new(opcode::READ_SINGLE_BLOCK, 0, ResponseType::R1);
        assert_eq!(read.data_direction(), Some(Direction::Read));
        assert_eq!(read.check_direction(Some(Direction::Read)), Ok(()));
        assert!(matches!(
            read.check_direction(Some(Direction::Write)),
            Err(Error::InvalidRequest(_))
        ));

        let write = Command::new(opcode::WRITE_MULTIPLE_BLOCK, 0, ResponseType::R1);
        assert!(write.check_direction(Some(Direction::Read)).is_err());
        assert_eq!(write.check_direction(None), Ok(()));

        let io_write = Command::new(opcode::IO_RW_EXTENDED, io_arg::WRITE, ResponseType::R5);
        assert_eq!(io_write.data_direction(), Some(Direction::Write));
        let io_read = Command::new(opcode::IO_RW_EXTENDED, 0, ResponseType::R5);
        assert_eq!(io_read.data_direction(), Some(Direction::Read));

        // CMD8 carries EXT_CSD on eMMC and nothing on SD
        let shared = Command::new(opcode::SEND_EXT_CSD, 0, ResponseType::R1);
        assert_eq!(shared.data_direction(), None);
    }
}
