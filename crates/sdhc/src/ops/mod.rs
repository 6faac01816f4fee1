//! Card and protocol operations built from short request sequences.

use std::thread;
use std::time::{Duration, Instant};

use sdhc_hw::card::{opcode, state, switch};
use tracing::{debug, warn};

use crate::card::CardType;
use crate::command::{CardStatus, Command, ResponseType};
use crate::error::{Error, Result};
use crate::host::{Host, HostState};

pub mod erase;
pub mod esd;
pub mod ext_csd;
pub mod lock;
pub mod packed;
pub mod power;
pub mod protect;
pub mod rpmb;
pub mod sdio;

pub use erase::EraseKind;
pub use esd::PartitionQuery;
pub use ext_csd::{BootPartition, Partition, PowerOffNotice};
pub use lock::LockOp;
pub use packed::{encode_header as encode_packed_header, PackedEntry, PackedStatus};
pub use power::{HpiCommand, RtcTime};
pub use protect::WriteProtectType;
pub use rpmb::RpmbFrame;

impl Host {
    /// CMD13 for the selected card
    pub fn card_status(&self) -> Result<CardStatus> {
        let mut st = self.lock();
        self.send_status(&mut st)
    }

    /// Polls CMD13 until the card is ready for data and out of the
    /// programming state. `timeout` bounds the whole wait.
    pub fn wait_ready(&self, timeout: Duration) -> Result<CardStatus> {
        let mut st = self.lock();
        self.wait_ready_locked(&mut st, timeout)
    }

    pub(crate) fn send_status(&self, st: &mut HostState) -> Result<CardStatus> {
        let rca = self.card(st)?.rca_arg();
        let r = self.do_request(
            st,
            &Command::new(opcode::SEND_STATUS, rca, ResponseType::R1).raw_status(),
            None,
        )?;
        Ok(r.card_status())
    }

    pub(crate) fn wait_ready_locked(&self, st: &mut HostState, timeout: Duration) -> Result<CardStatus> {
        let deadline = Instant::now() + timeout;
        for _ in 0..self.config.status_poll_limit {
            let status = self.send_status(st)?;
            status.check()?;
            let s = status.current_state();
            if status.contains(CardStatus::READY_FOR_DATA) && s != state::PROGRAM && s != state::RECEIVE {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.config.status_poll_interval);
        }
        warn!("card stayed busy");
        Err(Error::CardBusy)
    }

    /// CMD6 write-byte to one EXT_CSD field, then CMD13 until the card
    /// finishes the switch. The cached EXT_CSD is updated on success.
    pub(crate) fn mmc_switch(&self, st: &mut HostState, index: usize, value: u8) -> Result<()> {
        self.mmc_switch_access(st, switch::ACCESS_WRITE_BYTE, index, value)
    }

    pub(crate) fn mmc_switch_access(&self, st: &mut HostState, access: u8, index: usize, value: u8) -> Result<()> {
        let card = self.card(st)?;
        if !card.card_type.is_mmc() {
            return Err(Error::UnsupportedMode("EXT_CSD switch needs an MMC"));
        }
        if index >= sdhc_hw::card::ext_csd::SIZE {
            return Err(Error::InvalidRequest("EXT_CSD index out of range"));
        }
        let switch_time = card
            .ext_csd
            .as_ref()
            .map(|e| e.switch_time_ms())
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));
        let busy = switch_time.map_or(self.config.busy_timeout, |t| t.max(self.config.command_timeout));

        let arg = ((access as u32) << switch::ACCESS_SHIFT)
            | ((index as u32) << switch::INDEX_SHIFT)
            | ((value as u32) << switch::VALUE_SHIFT);
        debug!(index, value, access, "EXT_CSD switch");
        self.do_request(
            st,
            &Command::new(opcode::SWITCH, arg, ResponseType::R1b).with_timeout(busy),
            None,
        )?;
        let status = self.wait_ready_locked(st, self.config.busy_timeout)?;
        if status.contains(CardStatus::SWITCH_ERROR) {
            return Err(Error::CardStatus(CardStatus::SWITCH_ERROR));
        }

        if let Some(ext) = self.card(st)?.ext_csd.as_mut() {
            let old = ext.byte(index);
            let new = match access {
                switch::ACCESS_SET_BITS => old | value,
                switch::ACCESS_CLEAR_BITS => old & !value,
                _ => value,
            };
            ext.set_byte(index, new);
        }
        Ok(())
    }

    pub(crate) fn require_mmc(&self, st: &mut HostState) -> Result<CardType> {
        let t = self.card(st)?.card_type;
        if t.is_mmc() {
            Ok(t)
        } else {
            Err(Error::UnsupportedMode("operation needs an MMC or eMMC"))
        }
    }

    pub(crate) fn require_memory(&self, st: &mut HostState) -> Result<CardType> {
        let t = self.card(st)?.card_type;
        if t.has_memory() && t != CardType::SdioCombo {
            Ok(t)
        } else {
            Err(Error::UnsupportedMode("operation needs a memory card"))
        }
    }

    pub(crate) fn require_sdio(&self, st: &mut HostState) -> Result<()> {
        if self.card(st)?.card_type.is_sdio() {
            Ok(())
        } else {
            Err(Error::UnsupportedMode("operation needs an SDIO card"))
        }
    }
}
