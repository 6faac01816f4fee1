//! Card power states: sleep/awake, high priority interrupt, real-time clock
//! updates, software reset and supply voltage.

use std::time::Duration;

use sdhc_hw::card::{ext_csd, go_idle_arg, opcode, rtc, sleep_arg, HPI_FLAG};
use tracing::{debug, info, warn};

use crate::card::CardType;
use crate::command::{CardStatus, Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};

/// Command the card expects for a high priority interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpiCommand {
    StopTransmission,
    SendStatus,
}

/// Time reported to the card with SET_TIME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcTime {
    /// Seconds since 0 AD
    Absolute { seconds: u64 },
    /// Seconds since the last reset-relative update
    Relative { seconds: u64 },
    /// Restarts the relative time base
    ResetRelative,
}

impl RtcTime {
    /// The 512-byte RTC information block
    pub fn encode(&self) -> [u8; 512] {
        let mut block = [0u8; 512];
        let (kind, seconds) = match *self {
            RtcTime::Absolute { seconds } => (rtc::TYPE_ABSOLUTE, seconds),
            RtcTime::Relative { seconds } => (rtc::TYPE_RELATIVE, seconds),
            RtcTime::ResetRelative => (rtc::TYPE_RESET_RELATIVE, 0),
        };
        block[rtc::VERSION_OFFSET] = rtc::VERSION;
        block[rtc::TYPE_OFFSET] = kind;
        block[rtc::SECONDS_OFFSET..rtc::SECONDS_OFFSET + 8].copy_from_slice(&seconds.to_le_bytes());
        block
    }
}

/// Sleep/awake transition time: S_A_TIMEOUT is 100 ns * 2^value
fn sleep_awake_timeout(value: u8, floor: Duration) -> Duration {
    if value == 0 || value > 0x17 {
        return floor;
    }
    floor.max(Duration::from_nanos(100u64 << value))
}

impl Host {
    /// Deselects the card and puts it into sleep with CMD5
    pub fn sleep(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let card = self.card(st)?;
        if card.sleeping {
            return Ok(());
        }
        let rca = card.rca_arg();
        let timeout = self.sleep_timeout(st)?;
        self.select_card(st, 0)?;
        self.do_request(
            st,
            &Command::new(opcode::SLEEP_AWAKE, rca | sleep_arg::SLEEP, ResponseType::R1b).with_timeout(timeout),
            None,
        )?;
        self.card(st)?.sleeping = true;
        info!("card asleep");
        Ok(())
    }

    /// Wakes the card with CMD5 and selects it again
    pub fn awake(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let card = self.card(st)?;
        if !card.sleeping {
            return Ok(());
        }
        let rca = card.rca_arg();
        let timeout = self.sleep_timeout(st)?;
        self.do_request(
            st,
            &Command::new(opcode::SLEEP_AWAKE, rca, ResponseType::R1b).with_timeout(timeout),
            None,
        )?;
        self.card(st)?.sleeping = false;
        self.select_card(st, rca)?;
        info!("card awake");
        Ok(())
    }

    fn sleep_timeout(&self, st: &mut HostState) -> Result<Duration> {
        let value = self.card(st)?.ext_csd.as_ref().map_or(0, |e| e.byte(ext_csd::S_A_TIMEOUT));
        Ok(sleep_awake_timeout(value, self.config.command_timeout))
    }

    pub fn hpi_command(&self) -> Result<HpiCommand> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let features = self.card(st)?.ext_csd.as_ref().map_or(0, |e| e.hpi_features());
        if features & ext_csd::HPI_SUPPORTED == 0 {
            return Err(Error::UnsupportedMode("card does not support HPI"));
        }
        Ok(if features & ext_csd::HPI_USES_CMD12 != 0 {
            HpiCommand::StopTransmission
        } else {
            HpiCommand::SendStatus
        })
    }

    /// Interrupts an ongoing program or erase. HPI must be enabled first.
    pub fn send_hpi(&self) -> Result<CardStatus> {
        let command = self.hpi_command()?;
        let mut st = self.lock();
        let st = &mut *st;
        let card = self.card(st)?;
        let enabled = card.ext_csd.as_ref().is_some_and(|e| e.byte(ext_csd::HPI_MGMT) & ext_csd::HPI_EN != 0);
        if !enabled {
            return Err(Error::InvalidRequest("HPI is not enabled"));
        }
        let arg = card.rca_arg() | HPI_FLAG;
        let cmd = match command {
            HpiCommand::StopTransmission => Command::new(opcode::STOP_TRANSMISSION, arg, ResponseType::R1b),
            HpiCommand::SendStatus => Command::new(opcode::SEND_STATUS, arg, ResponseType::R1),
        };
        let r = self.do_request(st, &cmd.raw_status().with_retries(0), None)?;
        debug!(?command, "HPI sent");
        Ok(r.card_status())
    }

    /// Reports real time to the card (CMD49)
    pub fn set_time(&self, time: RtcTime) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let block = time.encode();
        let mut desc = DataDescriptor::write(&block, block.len());
        self.do_request(st, &Command::new(opcode::SET_TIME, 0, ResponseType::R1), Some(&mut desc))?;
        debug!(?time, "RTC updated");
        Ok(())
    }

    /// Sends CMD0 (optionally preceded by the eMMC pre-idle argument) and
    /// enumerates the card again
    pub fn reset_card(&self, pre_idle: bool) -> Result<CardType> {
        let mut st = self.lock();
        let st = &mut *st;
        let is_mmc = self.card(st).map(|c| c.card_type.is_mmc()).unwrap_or(false);
        if pre_idle && is_mmc {
            self.do_request(
                st,
                &Command::new(opcode::GO_IDLE_STATE, go_idle_arg::PRE_IDLE, ResponseType::None).with_retries(0),
                None,
            )?;
        }
        if st.card.is_some() {
            self.do_request(
                st,
                &Command::new(opcode::GO_IDLE_STATE, go_idle_arg::IDLE, ResponseType::None).with_retries(0),
                None,
            )?;
        }
        st.card = None;
        warn!(pre_idle, "card reset, enumerating again");
        self.init_card_locked(st)
    }

    /// Switches the supply voltage: 0 powers the slot off, otherwise one of
    /// 1800, 3000 or 3300 mV. Any change drops the card record.
    pub fn set_voltage(&self, mv: u32) -> Result<()> {
        let mut st = self.lock();
        self.set_voltage_locked(&mut st, mv)
    }

    pub(crate) fn set_voltage_locked(&self, st: &mut HostState, mv: u32) -> Result<()> {
        if st.bus.voltage_mv == mv && (mv != 0) == st.bus.powered {
            return Ok(());
        }
        if mv == 0 {
            self.power_off(st);
        } else {
            self.set_supply_voltage(st, mv)?;
        }
        st.card = None;
        info!(mv, "supply voltage changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_block_layout() {
        let block = RtcTime::Absolute { seconds: 0x0102_0304_0506_0708 }.encode();
        assert_eq!(block[0], rtc::VERSION);
        assert_eq!(block[1], rtc::TYPE_ABSOLUTE);
        assert_eq!(&block[2..10], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert!(block[10..].iter().all(|b| *b == 0));
        assert_eq!(RtcTime::ResetRelative.encode()[1], rtc::TYPE_RESET_RELATIVE);
    }

    #[test]
    fn sleep_timeout_from_ext_csd() {
        let floor = Duration::from_millis(10);
        assert_eq!(sleep_awake_timeout(0, floor), floor);
        // 100 ns << 20 is about 105 ms
        assert_eq!(sleep_awake_timeout(20, floor), Duration::from_nanos(100 << 20));
        assert_eq!(sleep_awake_timeout(0x18, floor), floor);
    }
}
