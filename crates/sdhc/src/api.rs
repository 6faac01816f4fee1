//! Caller-facing surface: bus information, card register getters, raw
//! register access, and the registry facade addressed by (controller, slot).

use std::sync::mpsc::Receiver;

use sdhc_hw::card::{app_opcode, cccr};
use sdhc_hw::mmio::sdhc::WINDOW_SIZE;
use sdhc_hw::specs::clock as hz;
use tracing::{info, trace};

use crate::card::{Card, CardType, Cid, Csd, ExtCsd, SpeedMode};
use crate::command::{Command, Response, ResponseType};
use crate::config::{AutoCmd, BusWidth, TransferMode};
use crate::error::{Error, Result};
use crate::host::{Host, HostState};
use crate::irq::HostEvent;
use crate::ops::PartitionQuery;
use crate::registry::HostRegistry;
use crate::regs::RegisterBlock;

/// Bus-level settings read and written as a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusInfo {
    /// Requested card clock
    pub clock_hz: u32,
    /// Supply voltage, 0 when the slot is unpowered
    pub voltage_mv: u32,
    pub width: BusWidth,
    pub transfer_mode: TransferMode,
    pub auto_cmd: AutoCmd,
}

/// Highest clock the given timing allows
fn mode_max_hz(mode: SpeedMode, mmc: bool) -> u32 {
    match mode {
        SpeedMode::Legacy if mmc => hz::MMC_LEGACY_HZ,
        SpeedMode::Legacy | SpeedMode::Sdr12 => hz::SD_DEFAULT_HZ,
        SpeedMode::HighSpeed if mmc => hz::MMC_HIGH_SPEED_HZ,
        SpeedMode::HighSpeed | SpeedMode::Sdr25 => hz::SD_HIGH_SPEED_HZ,
        SpeedMode::Ddr50 => hz::DDR50_HZ,
        SpeedMode::Sdr50 => hz::SDR50_HZ,
        SpeedMode::Sdr104 => hz::SDR104_HZ,
        SpeedMode::Hs200 => hz::HS200_HZ,
    }
}

fn check_register_offset(offset: u32, size: u32) -> Result<()> {
    if offset % size != 0 || offset.checked_add(size).is_none_or(|end| end > WINDOW_SIZE) {
        return Err(Error::InvalidRequest("register offset outside the window or misaligned"));
    }
    Ok(())
}

impl Host {
    /// Copy of the card record, if a card has been enumerated
    pub fn card_info(&self) -> Option<Card> {
        let mut st = self.lock();
        self.card(&mut st).ok().map(|c| c.clone())
    }

    pub fn is_card_initialized(&self) -> bool {
        let mut st = self.lock();
        self.card(&mut st).is_ok()
    }

    pub fn card_type(&self) -> Result<CardType> {
        let mut st = self.lock();
        Ok(self.card(&mut st)?.card_type)
    }

    pub fn cid(&self) -> Result<Cid> {
        let mut st = self.lock();
        self.card(&mut st)?.cid.clone().ok_or(Error::UnsupportedMode("card has no CID"))
    }

    pub fn csd(&self) -> Result<Csd> {
        let mut st = self.lock();
        self.card(&mut st)?.csd.clone().ok_or(Error::UnsupportedMode("card has no CSD"))
    }

    /// Reads CSD again and replaces the cached copy. An SD card raises
    /// TRAN_SPEED once a faster access mode is selected, so the copy taken
    /// at enumeration goes stale. The card is deselected for CMD9 and
    /// selected again afterwards.
    pub fn refresh_csd(&self) -> Result<Csd> {
        let mut st = self.lock();
        let st = &mut *st;
        let card = self.card(st)?;
        if card.csd.is_none() {
            return Err(Error::UnsupportedMode("card has no CSD"));
        }
        let (rca_arg, mmc) = (card.rca_arg(), card.card_type.is_mmc());

        self.select_card(st, 0)?;
        let raw = self.read_csd(st, rca_arg);
        self.select_card(st, rca_arg)?;
        let raw = raw?;
        let csd = if mmc { Csd::parse_mmc(raw) } else { Csd::parse_sd(raw) };
        trace!(max_transfer_hz = csd.max_transfer_hz, "CSD refreshed");
        self.card(st)?.csd = Some(csd.clone());
        Ok(csd)
    }

    /// EXT_CSD as cached at enumeration or after the last refresh
    pub fn ext_csd(&self) -> Result<ExtCsd> {
        let mut st = self.lock();
        self.card(&mut st)?
            .ext_csd
            .clone()
            .ok_or(Error::UnsupportedMode("card has no EXT_CSD"))
    }

    /// Raw CIS tuples of an SDIO card
    pub fn cis(&self) -> Result<Vec<u8>> {
        let mut st = self.lock();
        self.card(&mut st)?
            .sdio
            .as_ref()
            .map(|s| s.cis.clone())
            .ok_or(Error::UnsupportedMode("card has no CIS"))
    }

    pub fn bus_info(&self) -> BusInfo {
        let st = self.lock();
        BusInfo {
            clock_hz: st.bus.clock_hz,
            voltage_mv: st.bus.voltage_mv,
            width: st.bus.width,
            transfer_mode: st.bus.transfer_mode,
            auto_cmd: st.bus.auto_cmd,
        }
    }

    /// Applies the fields of `info` that differ from the current settings.
    /// Writing back an unchanged [`BusInfo`] does nothing.
    pub fn set_bus_info(&self, info: &BusInfo) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        if info.voltage_mv != st.bus.voltage_mv {
            self.set_voltage_locked(st, info.voltage_mv)?;
        }
        if info.transfer_mode != st.bus.transfer_mode {
            self.set_transfer_mode(st, info.transfer_mode)?;
        }
        if info.auto_cmd != st.bus.auto_cmd {
            st.bus.auto_cmd = info.auto_cmd;
        }
        if info.width != st.bus.width {
            self.change_bus_width(st, info.width)?;
        }
        if info.clock_hz != st.bus.clock_hz {
            let mmc = st.card.as_ref().is_some_and(|c| c.card_type.is_mmc());
            let capped = info.clock_hz.min(mode_max_hz(st.bus.timing, mmc));
            self.set_clock(st, capped)?;
        }
        Ok(())
    }

    /// Moves card and controller to `width`. Without a card only the
    /// controller side changes.
    fn change_bus_width(&self, st: &mut HostState, width: BusWidth) -> Result<()> {
        if width == BusWidth::Eight && !self.caps.bus_8bit() {
            return Err(Error::UnsupportedMode("controller lacks an 8-bit bus"));
        }
        if width.lines() > self.config.max_bus_width.lines() {
            return Err(Error::UnsupportedMode("bus width above the configured maximum"));
        }
        let card_type = match st.card.as_ref() {
            Some(c) => c.card_type,
            None => {
                self.set_host_bus_width(st, width);
                return Ok(());
            }
        };

        if card_type.is_mmc() {
            self.mmc_set_bus_width(st, width)?;
        } else if card_type.is_sdio() {
            let value = match width {
                BusWidth::One => cccr::BUS_WIDTH_1,
                BusWidth::Four => cccr::BUS_WIDTH_4,
                BusWidth::Eight => return Err(Error::UnsupportedMode("SDIO cards have no 8-bit bus")),
            };
            let bus = self.io_rw_direct_locked(st, false, 0, cccr::BUS_INTERFACE, 0)?;
            self.io_rw_direct_locked(st, true, 0, cccr::BUS_INTERFACE, (bus & !cccr::BUS_WIDTH_MASK) | value)?;
            self.set_host_bus_width(st, width);
        } else {
            let arg = match width {
                BusWidth::One => 0,
                BusWidth::Four => 2,
                BusWidth::Eight => return Err(Error::UnsupportedMode("SD cards have no 8-bit bus")),
            };
            self.app_request(st, &Command::new(app_opcode::SET_BUS_WIDTH, arg, ResponseType::R1), None)?;
            self.set_host_bus_width(st, width);
        }
        info!(lines = width.lines(), "bus width changed");
        Ok(())
    }

    /// Selects which stop command accompanies multi-block transfers
    pub fn set_auto_cmd(&self, auto_cmd: AutoCmd) {
        self.lock().bus.auto_cmd = auto_cmd;
    }

    /// Switches the data transfer mode. Fails when the controller lacks it.
    pub fn select_transfer_mode(&self, mode: TransferMode) -> Result<()> {
        let mut st = self.lock();
        self.set_transfer_mode(&mut st, mode)
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.lock().bus.transfer_mode
    }

    pub fn read_register16(&self, offset: u32) -> Result<u16> {
        check_register_offset(offset, 2)?;
        let _st = self.lock();
        Ok(self.regs().raw().read16(offset))
    }

    pub fn read_register32(&self, offset: u32) -> Result<u32> {
        check_register_offset(offset, 4)?;
        let _st = self.lock();
        Ok(self.regs().raw().read32(offset))
    }

    /// Writes a controller register directly. The driver's view of the
    /// bus is not updated.
    pub fn write_register16(&self, offset: u32, value: u16) -> Result<()> {
        check_register_offset(offset, 2)?;
        let _st = self.lock();
        trace!(offset, value, "raw register write");
        self.regs().raw().write16(offset, value);
        Ok(())
    }

    pub fn write_register32(&self, offset: u32, value: u32) -> Result<()> {
        check_register_offset(offset, 4)?;
        let _st = self.lock();
        trace!(offset, value, "raw register write");
        self.regs().raw().write32(offset, value);
        Ok(())
    }
}

impl HostRegistry {
    /// Writes `buf` starting at `block`; returns the bytes written
    pub fn send_data(&self, controller: usize, slot: usize, block: u32, buf: &[u8]) -> Result<usize> {
        self.host(controller, slot)?.send_data(block, buf)
    }

    /// Reads into `buf` starting at `block`; returns the bytes read
    pub fn get_data(&self, controller: usize, slot: usize, block: u32, buf: &mut [u8]) -> Result<usize> {
        self.host(controller, slot)?.get_data(block, buf)
    }

    pub fn send_command(&self, controller: usize, slot: usize, cmd: &Command) -> Result<Response> {
        self.host(controller, slot)?.send_command(cmd)
    }

    /// Registers the slot's event listener. Only one listener per slot.
    pub fn register_listener(&self, controller: usize, slot: usize, depth: usize) -> Result<Receiver<HostEvent>> {
        self.host(controller, slot)?.subscribe(depth)
    }

    pub fn is_card_initialized(&self, controller: usize, slot: usize) -> bool {
        self.host(controller, slot).is_ok_and(|h| h.is_card_initialized())
    }

    pub fn card_type(&self, controller: usize, slot: usize) -> Result<CardType> {
        self.host(controller, slot)?.card_type()
    }

    pub fn cid(&self, controller: usize, slot: usize) -> Result<Cid> {
        self.host(controller, slot)?.cid()
    }

    pub fn csd(&self, controller: usize, slot: usize) -> Result<Csd> {
        self.host(controller, slot)?.csd()
    }

    pub fn refresh_csd(&self, controller: usize, slot: usize) -> Result<Csd> {
        self.host(controller, slot)?.refresh_csd()
    }

    pub fn query_partition(&self, controller: usize, slot: usize, query: PartitionQuery) -> Result<Vec<u8>> {
        self.host(controller, slot)?.query_partition(query)
    }

    pub fn ext_csd(&self, controller: usize, slot: usize) -> Result<ExtCsd> {
        self.host(controller, slot)?.ext_csd()
    }

    pub fn cis(&self, controller: usize, slot: usize) -> Result<Vec<u8>> {
        self.host(controller, slot)?.cis()
    }

    pub fn get_bus_info(&self, controller: usize, slot: usize) -> Result<BusInfo> {
        Ok(self.host(controller, slot)?.bus_info())
    }

    pub fn set_bus_info(&self, controller: usize, slot: usize, info: &BusInfo) -> Result<()> {
        self.host(controller, slot)?.set_bus_info(info)
    }

    pub fn set_auto_cmd(&self, controller: usize, slot: usize, auto_cmd: AutoCmd) -> Result<()> {
        self.host(controller, slot)?.set_auto_cmd(auto_cmd);
        Ok(())
    }

    pub fn set_transfer_mode(&self, controller: usize, slot: usize, mode: TransferMode) -> Result<()> {
        self.host(controller, slot)?.select_transfer_mode(mode)
    }

    pub fn stop_at_block(&self, controller: usize, slot: usize, blocks: Option<u32>) -> Result<()> {
        self.host(controller, slot)?.set_stop_at_block(blocks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_caps_follow_timing() {
        assert_eq!(mode_max_hz(SpeedMode::Legacy, false), 25_000_000);
        assert_eq!(mode_max_hz(SpeedMode::Legacy, true), 26_000_000);
        assert_eq!(mode_max_hz(SpeedMode::HighSpeed, true), 52_000_000);
        assert_eq!(mode_max_hz(SpeedMode::Sdr104, false), 208_000_000);
    }

    #[test]
    fn register_offsets_are_checked() {
        assert!(check_register_offset(0x24, 4).is_ok());
        assert!(check_register_offset(0x2E, 2).is_ok());
        assert!(check_register_offset(0x2E, 4).is_err());
        assert!(check_register_offset(WINDOW_SIZE, 2).is_err());
        assert!(check_register_offset(0xFFFF_FFFE, 2).is_err());
        assert!(check_register_offset(0xFFFF_FFFC, 4).is_err());
    }
}
