//! Driver error taxonomy.
//!
//! Errors fall into three groups that drive recovery: command-line errors,
//! data-line errors and conditions that leave the card unusable until it is
//! re-initialized.

use std::fmt;

use crate::command::{CardStatus, R5Flags};
use crate::dma::DmaError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No response within the command timeout
    CommandTimeout,
    CommandCrc,
    CommandEndBit,
    CommandIndex,
    /// Data phase or busy signal did not finish in time
    DataTimeout,
    DataCrc,
    DataEndBit,
    CurrentLimit,
    /// Auto-issued CMD12/CMD23 reported an error (raw auto CMD status)
    AutoCmd12Failure { status: u16 },
    /// ADMA engine stopped on a bad descriptor
    AdmaDescriptorError { state: u8, length_mismatch: bool },
    /// DAT line or card stayed busy past its deadline
    CardBusy,
    /// Card was removed while a request was in flight
    CardInvalid,
    CardNotPresent,
    TuningFailure,
    InvalidAddressAlignment { address: u32 },
    UnsupportedMode(&'static str),
    /// A packed command entry failed; `index` is the failing entry
    PackedCommandPartialFailure { index: u8, status: u8 },
    WriteProtected,
    /// R1 error bits other than write protection
    CardStatus(CardStatus),
    /// R5 error bits from an SDIO direct/extended command
    SdioResponse(R5Flags),
    /// SD SWITCH_FUNC did not select the requested function in `group`
    SwitchFailed { group: u8 },
    /// Signal voltage switch sequence did not complete
    VoltageSwitch,
    InvalidRequest(&'static str),
    NoSuchHost { controller: usize, slot: usize },
    ListenerRegistered,
    /// RPMB operation result code other than OK
    Rpmb { result: u16 },
    Dma(DmaError),
    /// Controller did not complete an internal operation (reset, clock)
    Controller(&'static str),
}

impl Error {
    /// Errors worth retrying: the card may well answer the same command again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::CommandTimeout | Error::CommandCrc | Error::DataTimeout | Error::DataCrc
        )
    }

    /// Errors that leave the CMD line state machine in need of a reset.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            Error::CommandTimeout | Error::CommandCrc | Error::CommandEndBit | Error::CommandIndex
        )
    }

    /// Errors that leave the DAT line state machine in need of a reset.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Error::DataTimeout
                | Error::DataCrc
                | Error::DataEndBit
                | Error::CurrentLimit
                | Error::AutoCmd12Failure { .. }
                | Error::AdmaDescriptorError { .. }
                | Error::TuningFailure
                | Error::CardBusy
        )
    }

    /// Errors after which the card must be re-initialized.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CardInvalid | Error::CardNotPresent)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CommandTimeout => write!(f, "command response timeout"),
            Error::CommandCrc => write!(f, "command response CRC error"),
            Error::CommandEndBit => write!(f, "command end bit error"),
            Error::CommandIndex => write!(f, "command index mismatch"),
            Error::DataTimeout => write!(f, "data timeout"),
            Error::DataCrc => write!(f, "data CRC error"),
            Error::DataEndBit => write!(f, "data end bit error"),
            Error::CurrentLimit => write!(f, "bus power current limit exceeded"),
            Error::AutoCmd12Failure { status } => {
                write!(f, "auto command failed (status 0x{:04X})", status)
            }
            Error::AdmaDescriptorError {
                state,
                length_mismatch,
            } => write!(
                f,
                "ADMA descriptor error (state {}, length mismatch: {})",
                state, length_mismatch
            ),
            Error::CardBusy => write!(f, "card busy"),
            Error::CardInvalid => write!(f, "card removed during request"),
            Error::CardNotPresent => write!(f, "no card present"),
            Error::TuningFailure => write!(f, "sampling clock tuning failed"),
            Error::InvalidAddressAlignment { address } => {
                write!(f, "DMA address 0x{:08X} is not 4-byte aligned", address)
            }
            Error::UnsupportedMode(what) => write!(f, "unsupported mode: {}", what),
            Error::PackedCommandPartialFailure { index, status } => write!(
                f,
                "packed command failed at entry {} (status 0x{:02X})",
                index, status
            ),
            Error::WriteProtected => write!(f, "write protected"),
            Error::CardStatus(status) => write!(f, "card status error: {:?}", status),
            Error::SdioResponse(flags) => write!(f, "SDIO response error: {:?}", flags),
            Error::SwitchFailed { group } => {
                write!(f, "switch function failed for group {}", group)
            }
            Error::VoltageSwitch => write!(f, "signal voltage switch failed"),
            Error::InvalidRequest(what) => write!(f, "invalid request: {}", what),
            Error::NoSuchHost { controller, slot } => {
                write!(f, "no host registered for controller {} slot {}", controller, slot)
            }
            Error::ListenerRegistered => write!(f, "event listener already registered"),
            Error::Rpmb { result } => write!(f, "RPMB operation failed (result 0x{:04X})", result),
            Error::Dma(e) => write!(f, "DMA mapping failed: {}", e),
            Error::Controller(what) => write!(f, "controller error: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<DmaError> for Error {
    fn from(e: DmaError) -> Self {
        Error::Dma(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_crc_are_transient() {
        assert!(Error::CommandTimeout.is_transient());
        assert!(Error::DataCrc.is_transient());
        assert!(!Error::CommandEndBit.is_transient());
        assert!(!Error::CardInvalid.is_transient());
        assert!(!Error::AutoCmd12Failure { status: 2 }.is_transient());
    }

    #[test]
    fn groups_do_not_overlap() {
        let all = [
            Error::CommandTimeout,
            Error::CommandIndex,
            Error::DataEndBit,
            Error::CurrentLimit,
            Error::TuningFailure,
            Error::CardInvalid,
        ];
        for e in &all {
            let groups = [e.is_command_error(), e.is_data_error(), e.is_fatal()];
            assert!(groups.iter().filter(|g| **g).count() <= 1, "{:?}", e);
        }
    }
}
