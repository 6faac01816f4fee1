//! Card identification: power-up, probing for SD, SDIO and MMC, reading the
//! identity registers and moving the card to its fastest usable bus setup.

use std::thread;
use std::time::Duration;

use sdhc_hw::card::{app_opcode, cccr, ext_csd, if_cond, ocr, opcode, sd_switch};
use sdhc_hw::specs::clock as hz;
use tracing::{debug, info, warn};

use crate::card::{Card, CardType, Cid, Csd, Scr, SdioInfo, SpeedMode};
use crate::command::{Command, ResponseType};
use crate::config::BusWidth;
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState, RetuneState};

/// SDXC starts above 32 GiB
const SDXC_MIN_BLOCKS: u64 = 32 * 1024 * 1024 * 2;

fn identify_cmd(op: u8, arg: u32, resp: ResponseType) -> Command {
    Command::new(op, arg, resp).with_retries(0)
}

impl Host {
    /// Power-cycles the slot and runs the identification sequence, leaving the
    /// card selected in the transfer state at its best supported speed.
    pub fn init_card(&self) -> Result<CardType> {
        let mut st = self.lock();
        self.init_card_locked(&mut st)
    }

    pub(crate) fn init_card_locked(&self, st: &mut HostState) -> Result<CardType> {
        st.card = None;
        if !self.bridge.card_present() {
            return Err(Error::CardNotPresent);
        }
        let generation = self.bridge.generation();

        self.power_off(st);
        self.power_on(st)?;
        self.set_host_bus_width(st, BusWidth::One);
        self.set_host_timing(st, SpeedMode::Legacy);
        st.retune = RetuneState {
            period: self.caps.retune_period(),
            ..RetuneState::default()
        };
        self.set_clock(st, hz::IDENTIFICATION_HZ)?;
        // 74 clocks before the first command
        thread::sleep(Duration::from_millis(1));

        self.do_request(st, &identify_cmd(opcode::GO_IDLE_STATE, 0, ResponseType::None), None)?;

        let sd_v2 = match self.do_request(
            st,
            &identify_cmd(opcode::SEND_IF_COND, if_cond::ARGUMENT, ResponseType::R7),
            None,
        ) {
            Ok(r) if r.word() & 0xFFF == if_cond::ARGUMENT => true,
            Ok(r) => {
                warn!(echo = r.word(), "interface condition echo mismatch");
                return Err(Error::UnsupportedMode("card rejected the interface condition"));
            }
            Err(e) if e.is_command_error() => false,
            Err(e) => return Err(e),
        };

        match self.do_request(st, &identify_cmd(opcode::IO_SEND_OP_COND, 0, ResponseType::R4), None) {
            Ok(r) => {
                let info = SdioInfo::from_ocr(r.word());
                if info.functions > 0 {
                    return self.init_sdio(st, r.word(), generation);
                }
            }
            Err(e) if e.is_command_error() => {}
            Err(e) => return Err(e),
        }

        match self.sd_op_cond(st, sd_v2) {
            Ok(ocr) => return self.init_sd(st, ocr, generation),
            Err(e) if e.is_command_error() => debug!("no answer to ACMD41, trying MMC"),
            Err(e) => return Err(e),
        }

        let ocr = self.mmc_op_cond(st)?;
        self.init_mmc(st, ocr, generation)
    }

    fn sd_op_cond(&self, st: &mut HostState, v2: bool) -> Result<u32> {
        let mut arg = ocr::VDD_WINDOW;
        if v2 {
            arg |= ocr::HCS | ocr::XPC;
            if self.uhs_possible() {
                arg |= ocr::S18;
            }
        }
        let cmd = identify_cmd(app_opcode::SD_SEND_OP_COND, arg, ResponseType::R3);
        for _ in 0..self.config.op_cond_polls {
            let r = self.app_request(st, &cmd, None)?;
            if r.word() & ocr::BUSY != 0 {
                return Ok(r.word());
            }
            thread::sleep(self.config.op_cond_interval);
        }
        Err(Error::CardBusy)
    }

    fn mmc_op_cond(&self, st: &mut HostState) -> Result<u32> {
        let cmd = identify_cmd(
            opcode::SEND_OP_COND,
            ocr::MMC_ACCESS_SECTOR | ocr::VDD_WINDOW | ocr::VDD_LOW,
            ResponseType::R3,
        );
        for _ in 0..self.config.op_cond_polls {
            let r = self.do_request(st, &cmd, None)?;
            if r.word() & ocr::BUSY != 0 {
                return Ok(r.word());
            }
            thread::sleep(self.config.op_cond_interval);
        }
        Err(Error::CardBusy)
    }

    /// Host can run UHS-I at all: 1.8 V signalling plus one UHS mode
    pub(crate) fn uhs_possible(&self) -> bool {
        self.config.enable_uhs
            && self.caps.voltage_1v8()
            && (self.caps.sdr50() || self.caps.sdr104() || self.caps.ddr50())
    }

    fn identify(&self, st: &mut HostState) -> Result<[u32; 4]> {
        let r = self.do_request(st, &Command::new(opcode::ALL_SEND_CID, 0, ResponseType::R2), None)?;
        Ok(r.words)
    }

    pub(crate) fn read_csd(&self, st: &mut HostState, rca_arg: u32) -> Result<[u32; 4]> {
        let r = self.do_request(st, &Command::new(opcode::SEND_CSD, rca_arg, ResponseType::R2), None)?;
        Ok(r.words)
    }

    pub(crate) fn select_card(&self, st: &mut HostState, rca_arg: u32) -> Result<()> {
        let resp = if rca_arg == 0 {
            ResponseType::None
        } else {
            ResponseType::R1b
        };
        self.do_request(st, &Command::new(opcode::SELECT_CARD, rca_arg, resp), None)?;
        Ok(())
    }

    fn init_sd(&self, st: &mut HostState, ocr_value: u32, generation: u64) -> Result<CardType> {
        let mut card = Card::new(CardType::Sd, generation);
        card.ocr = ocr_value;
        card.s18a = ocr_value & ocr::S18 != 0 && self.uhs_possible();
        st.card = Some(card);

        if self.card(st)?.s18a {
            self.voltage_switch(st)?;
        }

        let cid = Cid::parse_sd(self.identify(st)?);
        let r = self.do_request(
            st,
            &Command::new(opcode::SET_RELATIVE_ADDR, 0, ResponseType::R6),
            None,
        )?;
        let rca = r.rca();
        let csd = Csd::parse_sd(self.read_csd(st, (rca as u32) << 16)?);
        let card_type = if ocr_value & ocr::CCS == 0 {
            CardType::Sd
        } else if csd.capacity_blocks > SDXC_MIN_BLOCKS {
            CardType::Sdxc
        } else {
            CardType::Sdhc
        };
        {
            let card = self.card(st)?;
            card.card_type = card_type;
            card.rca = rca;
            card.cid = Some(cid);
            card.csd = Some(csd.clone());
        }
        self.select_card(st, (rca as u32) << 16)?;

        let mut raw = [0u8; 8];
        {
            let mut desc = DataDescriptor::read(&mut raw, 8);
            self.app_request(
                st,
                &Command::new(app_opcode::SEND_SCR, 0, ResponseType::R1),
                Some(&mut desc),
            )?;
        }
        let scr = Scr::parse(raw);
        self.card(st)?.scr = Some(scr);

        if scr.bus_widths & sdhc_hw::card::scr::BUS_WIDTH_4 != 0 && self.config.max_bus_width != BusWidth::One {
            self.app_request(
                st,
                &Command::new(app_opcode::SET_BUS_WIDTH, 2, ResponseType::R1),
                None,
            )?;
            self.set_host_bus_width(st, BusWidth::Four);
        }

        if !card_type.block_addressed() {
            self.do_request(st, &Command::new(opcode::SET_BLOCKLEN, 512, ResponseType::R1), None)?;
        }

        let s18a = self.card(st)?.s18a;
        if s18a {
            self.sd_select_best_uhs(st)?;
        } else if scr.spec >= sdhc_hw::card::scr::SPEC_1_10 && self.caps.high_speed() {
            match self.sd_switch(st, true, sd_switch::GROUP_ACCESS_MODE, sd_switch::ACCESS_SDR25) {
                Ok(()) => {
                    self.set_host_timing(st, SpeedMode::HighSpeed);
                    self.set_clock(st, hz::SD_HIGH_SPEED_HZ)?;
                }
                Err(Error::SwitchFailed { .. }) => {
                    self.set_clock(st, csd.max_transfer_hz.min(hz::SD_DEFAULT_HZ))?;
                }
                Err(e) => return Err(e),
            }
        } else {
            self.set_clock(st, csd.max_transfer_hz.min(hz::SD_DEFAULT_HZ))?;
        }

        let speed = st.bus.timing;
        let card = self.card(st)?;
        card.speed = speed;
        info!(
            card = ?card_type,
            rca,
            blocks = card.capacity_blocks(),
            ?speed,
            "SD card initialized"
        );
        Ok(card_type)
    }

    fn init_mmc(&self, st: &mut HostState, ocr_value: u32, generation: u64) -> Result<CardType> {
        let cid = Cid::parse_mmc(self.identify(st)?);
        let sector_mode = ocr_value & ocr::MMC_ACCESS_MASK == ocr::MMC_ACCESS_SECTOR;
        let card_type = match (cid.device_type == 1, sector_mode) {
            (true, true) => CardType::EmmcHc,
            (true, false) => CardType::Emmc,
            (false, true) => CardType::MmcHc,
            (false, false) => CardType::Mmc,
        };
        let mut card = Card::new(card_type, generation);
        card.ocr = ocr_value;
        card.rca = 1;
        card.cid = Some(cid);
        st.card = Some(card);

        self.do_request(
            st,
            &Command::new(opcode::SET_RELATIVE_ADDR, 1 << 16, ResponseType::R1),
            None,
        )?;
        let csd = Csd::parse_mmc(self.read_csd(st, 1 << 16)?);
        self.card(st)?.csd = Some(csd.clone());
        self.select_card(st, 1 << 16)?;

        if csd.spec_version >= 4 {
            let ext = self.read_ext_csd_locked(st)?;
            self.card(st)?.ext_csd = Some(ext);
        }
        if !card_type.block_addressed() {
            self.do_request(st, &Command::new(opcode::SET_BLOCKLEN, 512, ResponseType::R1), None)?;
        }

        let has_ext = self.card(st)?.ext_csd.is_some();
        if has_ext {
            let width = if self.caps.bus_8bit() && self.config.max_bus_width == BusWidth::Eight {
                BusWidth::Eight
            } else if self.config.max_bus_width != BusWidth::One {
                BusWidth::Four
            } else {
                BusWidth::One
            };
            self.mmc_set_bus_width(st, width)?;

            let (hs200, hs52) = {
                let ext = self.card(st)?.ext_csd.as_ref().map(|e| (e.supports_hs200(), e.supports_hs52()));
                ext.unwrap_or((false, false))
            };
            let host_hs200 = self.config.enable_uhs && self.caps.sdr104() && self.caps.voltage_1v8();
            if hs200 && host_hs200 && width != BusWidth::One {
                if let Err(e) = self.hs200_locked(st, hz::HS200_HZ, 0, width) {
                    warn!(error = %e, "HS200 failed, falling back to high speed");
                    self.mmc_high_speed(st)?;
                }
            } else if hs52 && self.caps.high_speed() {
                self.mmc_high_speed(st)?;
            } else {
                self.set_clock(st, csd.max_transfer_hz.min(hz::MMC_LEGACY_HZ))?;
            }
        } else {
            self.set_clock(st, csd.max_transfer_hz.min(hz::MMC_LEGACY_HZ))?;
        }

        let speed = st.bus.timing;
        let card = self.card(st)?;
        card.speed = speed;
        info!(
            card = ?card_type,
            blocks = card.capacity_blocks(),
            ?speed,
            "MMC initialized"
        );
        Ok(card_type)
    }

    pub(crate) fn mmc_set_bus_width(&self, st: &mut HostState, width: BusWidth) -> Result<()> {
        let value = match width {
            BusWidth::One => ext_csd::BUS_WIDTH_1,
            BusWidth::Four => ext_csd::BUS_WIDTH_4,
            BusWidth::Eight => ext_csd::BUS_WIDTH_8,
        };
        self.mmc_switch(st, ext_csd::BUS_WIDTH, value)?;
        self.set_host_bus_width(st, width);
        Ok(())
    }

    pub(crate) fn mmc_high_speed(&self, st: &mut HostState) -> Result<()> {
        self.mmc_switch(st, ext_csd::HS_TIMING, ext_csd::TIMING_HS)?;
        self.set_host_timing(st, SpeedMode::HighSpeed);
        self.set_clock(st, hz::MMC_HIGH_SPEED_HZ)?;
        st.retune.active = false;
        Ok(())
    }

    fn init_sdio(&self, st: &mut HostState, r4: u32, generation: u64) -> Result<CardType> {
        let info = SdioInfo::from_ocr(r4);
        let card_type = if info.memory_present {
            CardType::SdioCombo
        } else {
            CardType::Sdio
        };
        let mut arg = r4 & ocr::SDIO_OCR_MASK & ocr::VDD_WINDOW;
        if self.uhs_possible() {
            arg |= ocr::S18;
        }
        let mut ready_ocr = None;
        for _ in 0..self.config.op_cond_polls {
            let r = self.do_request(st, &identify_cmd(opcode::IO_SEND_OP_COND, arg, ResponseType::R4), None)?;
            if r.word() & ocr::BUSY != 0 {
                ready_ocr = Some(r.word());
                break;
            }
            thread::sleep(self.config.op_cond_interval);
        }
        let ocr_value = ready_ocr.ok_or(Error::CardBusy)?;

        let mut card = Card::new(card_type, generation);
        card.ocr = ocr_value;
        card.sdio = Some(info);
        card.s18a = ocr_value & ocr::S18 != 0 && self.uhs_possible();
        let s18a = card.s18a;
        st.card = Some(card);
        if s18a {
            self.voltage_switch(st)?;
        }

        let r = self.do_request(
            st,
            &Command::new(opcode::SET_RELATIVE_ADDR, 0, ResponseType::R6),
            None,
        )?;
        let rca = r.rca();
        self.card(st)?.rca = rca;
        self.select_card(st, (rca as u32) << 16)?;

        let mut regs = [0u8; 0x16];
        for (addr, byte) in regs.iter_mut().enumerate() {
            *byte = self.io_rw_direct_locked(st, false, 0, addr as u32, 0)?;
        }
        let mut info = SdioInfo::from_ocr(ocr_value);
        info.apply_cccr(&regs);
        let tuples = self.read_cis_locked(st, info.cis_pointer)?;
        info.apply_cis(&tuples);
        let (capability, high_speed) = (info.capability, info.supports_high_speed());
        self.card(st)?.sdio = Some(info);

        let four_bit = capability & cccr::CAP_LSC == 0 || capability & cccr::CAP_4BLS != 0;
        if four_bit && self.config.max_bus_width != BusWidth::One {
            let bus = self.io_rw_direct_locked(st, false, 0, cccr::BUS_INTERFACE, 0)?;
            let value = (bus & !cccr::BUS_WIDTH_MASK) | cccr::BUS_WIDTH_4;
            self.io_rw_direct_locked(st, true, 0, cccr::BUS_INTERFACE, value)?;
            self.set_host_bus_width(st, BusWidth::Four);
        }

        if high_speed && self.caps.high_speed() {
            self.sdio_set_bus_speed(st, cccr::SPEED_SDR25)?;
            self.set_host_timing(st, SpeedMode::HighSpeed);
            self.set_clock(st, hz::SD_HIGH_SPEED_HZ)?;
        } else {
            self.set_clock(st, hz::SD_DEFAULT_HZ)?;
        }

        let speed = st.bus.timing;
        let card = self.card(st)?;
        card.speed = speed;
        info!(card = ?card_type, rca, ?speed, "SDIO card initialized");
        Ok(card_type)
    }

    /// Reads CIS tuples starting at `pointer` up to and including the end tuple
    pub(crate) fn read_cis_locked(&self, st: &mut HostState, pointer: u32) -> Result<Vec<u8>> {
        const CIS_LIMIT: u32 = 256;
        let mut out = Vec::new();
        let mut addr = pointer;
        while addr < pointer + CIS_LIMIT {
            let code = self.io_rw_direct_locked(st, false, 0, addr, 0)?;
            out.push(code);
            addr += 1;
            if code == sdhc_hw::card::cis::TPL_END {
                break;
            }
            if code == sdhc_hw::card::cis::TPL_NULL {
                continue;
            }
            let len = self.io_rw_direct_locked(st, false, 0, addr, 0)?;
            out.push(len);
            addr += 1;
            for _ in 0..len {
                out.push(self.io_rw_direct_locked(st, false, 0, addr, 0)?);
                addr += 1;
            }
        }
        Ok(out)
    }
}
