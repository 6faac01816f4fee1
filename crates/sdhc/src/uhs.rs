//! Bus speed management: high speed, the UHS-I voltage switch and CMD6
//! function groups, SDIO bus speed select, eMMC HS200, and sampling-point
//! tuning with periodic re-tuning and demotion.

use std::thread;
use std::time::{Duration, Instant};

use sdhc_hw::card::{cccr, ext_csd, opcode, sd_switch};
use sdhc_hw::mmio::sdhc::host_control2;
use sdhc_hw::specs::{clock as hz, TUNING_BLOCK_4BIT, TUNING_BLOCK_8BIT};
use tracing::{debug, info, warn};

use crate::card::SpeedMode;
use crate::command::{Command, ResponseType};
use crate::config::BusWidth;
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};
use crate::regs::{PresentState, ResetFlags};

/// SD SWITCH_FUNC status block (512 bits, most significant byte first)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchStatus(pub [u8; sd_switch::STATUS_SIZE]);

impl SwitchStatus {
    /// Maximum current for the selected functions, in mA
    pub fn max_current(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    /// Distance of `group` from group 6, which the block stores first
    fn slot(group: u8) -> Option<usize> {
        (1..=6).contains(&group).then(|| 6 - group as usize)
    }

    /// Functions the card supports in `group` (1..=6), bit n = function n
    pub fn support(&self, group: u8) -> Option<u16> {
        let off = 2 + 2 * Self::slot(group)?;
        Some(u16::from_be_bytes([self.0[off], self.0[off + 1]]))
    }

    /// Function selected (or selectable, in check mode) in `group`; 0xF means
    /// the request could not be honoured
    pub fn result(&self, group: u8) -> Option<u8> {
        let rel = Self::slot(group)?;
        let byte = self.0[14 + rel / 2];
        Some(if rel % 2 == 0 { byte >> 4 } else { byte & 0xF })
    }

    pub fn version(&self) -> u8 {
        self.0[17]
    }

    /// Busy status for the functions of `group` (version 1 blocks only)
    pub fn busy(&self, group: u8) -> Option<u16> {
        let off = 18 + 2 * Self::slot(group)?;
        Some(u16::from_be_bytes([self.0[off], self.0[off + 1]]))
    }
}

/// CMD6 argument: `functions[g - 1]` is the value for group `g`
pub fn switch_argument(set: bool, functions: [u8; 6]) -> u32 {
    let mut arg = if set {
        sd_switch::MODE_SWITCH
    } else {
        sd_switch::MODE_CHECK
    };
    for (i, f) in functions.iter().enumerate() {
        arg |= ((*f & 0xF) as u32) << (i * 4);
    }
    arg
}

fn access_mode_speed(access: u8) -> Option<(SpeedMode, u32)> {
    match access {
        sd_switch::ACCESS_SDR12 => Some((SpeedMode::Sdr12, hz::SD_DEFAULT_HZ)),
        sd_switch::ACCESS_SDR25 => Some((SpeedMode::Sdr25, hz::SD_HIGH_SPEED_HZ)),
        sd_switch::ACCESS_SDR50 => Some((SpeedMode::Sdr50, hz::SDR50_HZ)),
        sd_switch::ACCESS_SDR104 => Some((SpeedMode::Sdr104, hz::SDR104_HZ)),
        sd_switch::ACCESS_DDR50 => Some((SpeedMode::Ddr50, hz::DDR50_HZ)),
        _ => None,
    }
}

fn speed_access_mode(mode: SpeedMode) -> Option<u8> {
    match mode {
        SpeedMode::Sdr12 => Some(sd_switch::ACCESS_SDR12),
        SpeedMode::Sdr25 => Some(sd_switch::ACCESS_SDR25),
        SpeedMode::Sdr50 => Some(sd_switch::ACCESS_SDR50),
        SpeedMode::Sdr104 => Some(sd_switch::ACCESS_SDR104),
        SpeedMode::Ddr50 => Some(sd_switch::ACCESS_DDR50),
        _ => None,
    }
}

fn sdio_speed_select(mode: SpeedMode) -> Option<(u8, u8, u32)> {
    // (speed select code, required UHS_SUPPORT bit, clock)
    match mode {
        SpeedMode::Sdr12 => Some((cccr::SPEED_SDR12, 0, hz::SD_DEFAULT_HZ)),
        SpeedMode::Sdr25 => Some((cccr::SPEED_SDR25, 0, hz::SD_HIGH_SPEED_HZ)),
        SpeedMode::Sdr50 => Some((cccr::SPEED_SDR50, cccr::UHS_SDR50, hz::SDR50_HZ)),
        SpeedMode::Sdr104 => Some((cccr::SPEED_SDR104, cccr::UHS_SDR104, hz::SDR104_HZ)),
        SpeedMode::Ddr50 => Some((cccr::SPEED_DDR50, cccr::UHS_DDR50, hz::DDR50_HZ)),
        _ => None,
    }
}

/// Current limit code for group 4 that fits within `max_ma`
fn current_limit_for(max_ma: u32, supported: u16) -> u8 {
    let options = [
        (sd_switch::CURRENT_800MA, 800),
        (sd_switch::CURRENT_600MA, 600),
        (sd_switch::CURRENT_400MA, 400),
    ];
    options
        .into_iter()
        .find(|(code, ma)| max_ma >= *ma && supported & (1 << code) != 0)
        .map_or(sd_switch::CURRENT_200MA, |(code, _)| code)
}

impl Host {
    fn needs_tuning(&self, mode: SpeedMode) -> bool {
        match mode {
            SpeedMode::Sdr104 | SpeedMode::Hs200 => true,
            SpeedMode::Sdr50 => self.caps.sdr50_needs_tuning(),
            _ => false,
        }
    }

    /// Re-tunes before a request when the controller or its timer asks for it
    pub(crate) fn maybe_retune(&self, st: &mut HostState) -> Result<()> {
        let requested = self.bridge.take_retune_request();
        if !st.retune.active {
            return Ok(());
        }
        let expired = match (st.retune.period, st.retune.last) {
            (Some(period), Some(last)) => last.elapsed() >= period,
            _ => false,
        };
        let flagged = self.regs().present_state().contains(PresentState::RETUNING_REQUEST);
        if !(requested || expired || flagged) {
            return Ok(());
        }
        debug!(requested, expired, flagged, "re-tuning");
        self.retune(st)
    }

    fn retune(&self, st: &mut HostState) -> Result<()> {
        for attempt in 1..=self.config.retune_attempts.max(1) {
            match self.tune(st) {
                Ok(()) => return Ok(()),
                Err(Error::TuningFailure) => warn!(attempt, "re-tuning failed"),
                Err(e) => return Err(e),
            }
        }
        self.demote(st)
    }

    /// Drops to the next slower mode after tuning kept failing
    fn demote(&self, st: &mut HostState) -> Result<()> {
        let from = st.bus.timing;
        let to = match from {
            SpeedMode::Sdr104 => SpeedMode::Sdr50,
            SpeedMode::Sdr50 | SpeedMode::Ddr50 => SpeedMode::Sdr25,
            SpeedMode::Hs200 => SpeedMode::HighSpeed,
            _ => return Err(Error::TuningFailure),
        };
        warn!(?from, ?to, "tuning failed, demoting bus speed");
        st.retune.active = false;
        st.retune.in_progress = true;
        let result = self.change_speed(st, to);
        st.retune.in_progress = false;
        result.map_err(|e| {
            warn!(error = %e, "demotion failed");
            Error::TuningFailure
        })?;
        if self.needs_tuning(to) {
            self.tune(st)?;
            st.retune.active = true;
        }
        Ok(())
    }

    /// Moves an already-running card to a slower mode
    fn change_speed(&self, st: &mut HostState, to: SpeedMode) -> Result<()> {
        let card_type = self.card(st)?.card_type;
        if to == SpeedMode::HighSpeed && card_type.is_mmc() {
            self.set_host_timing(st, SpeedMode::HighSpeed);
            self.set_clock(st, hz::MMC_HIGH_SPEED_HZ)?;
            self.mmc_switch(st, ext_csd::HS_TIMING, ext_csd::TIMING_HS)?;
        } else if card_type.is_sdio() {
            let (code, _, clock) = sdio_speed_select(to).ok_or(Error::UnsupportedMode("no such SDIO mode"))?;
            self.sdio_set_bus_speed(st, code)?;
            self.set_host_timing(st, to);
            self.set_clock(st, clock)?;
        } else {
            let access = speed_access_mode(to).ok_or(Error::UnsupportedMode("no such SD access mode"))?;
            let (_, clock) = access_mode_speed(access).ok_or(Error::UnsupportedMode("no such SD access mode"))?;
            self.sd_switch(st, true, sd_switch::GROUP_ACCESS_MODE, access)?;
            self.set_host_timing(st, to);
            self.set_clock(st, clock)?;
        }
        self.card(st)?.speed = to;
        Ok(())
    }

    /// One tuning run: CMD19 (SD/SDIO) or CMD21 (eMMC) until the controller
    /// settles on a sampling point or the attempt budget runs out.
    pub(crate) fn tune(&self, st: &mut HostState) -> Result<()> {
        st.retune.in_progress = true;
        let result = self.tune_inner(st);
        st.retune.in_progress = false;
        result
    }

    fn tune_inner(&self, st: &mut HostState) -> Result<()> {
        let mmc = self.card(st)?.card_type.is_mmc();
        let op = if mmc {
            opcode::SEND_TUNING_BLOCK_HS200
        } else {
            opcode::SEND_TUNING_BLOCK
        };
        let pattern: &[u8] = if st.bus.width == BusWidth::Eight {
            &TUNING_BLOCK_8BIT
        } else {
            &TUNING_BLOCK_4BIT
        };

        let regs = self.regs();
        let ctrl2 = regs.host_control2() & !host_control2::SAMPLING_CLOCK_SELECT;
        regs.set_host_control2(ctrl2 | host_control2::EXECUTE_TUNING);

        let mut buf = vec![0u8; pattern.len()];
        for loop_no in 0..self.config.tuning_attempts {
            let mut desc = DataDescriptor::read(&mut buf, pattern.len()).tuning();
            match self.do_request(st, &Command::new(op, 0, ResponseType::R1).with_retries(0), Some(&mut desc)) {
                Ok(_) => {}
                Err(e @ (Error::CardInvalid | Error::CardNotPresent)) => return Err(e),
                Err(e) => debug!(loop_no, error = %e, "tuning block"),
            }
            let ctrl2 = regs.host_control2();
            if ctrl2 & host_control2::EXECUTE_TUNING == 0 {
                if ctrl2 & host_control2::SAMPLING_CLOCK_SELECT != 0 {
                    if buf != pattern {
                        debug!("last tuning block differed from the reference pattern");
                    }
                    st.retune.last = Some(Instant::now());
                    st.retune.runs += 1;
                    debug!(loops = loop_no + 1, "tuning complete");
                    return Ok(());
                }
                break;
            }
        }

        regs.set_host_control2(
            regs.host_control2() & !(host_control2::EXECUTE_TUNING | host_control2::SAMPLING_CLOCK_SELECT),
        );
        self.reset_lines(ResetFlags::CMD_LINE | ResetFlags::DATA_LINE)?;
        warn!("tuning did not converge");
        Err(Error::TuningFailure)
    }

    /// Runs a tuning pass in the current mode and turns on re-tuning
    pub fn enable_tuning(&self) -> Result<()> {
        let mut st = self.lock();
        let mode = st.bus.timing;
        if !matches!(mode, SpeedMode::Sdr50 | SpeedMode::Sdr104 | SpeedMode::Hs200) {
            return Err(Error::UnsupportedMode("tuning only applies to SDR50, SDR104 and HS200"));
        }
        self.tune(&mut st)?;
        st.retune.active = true;
        Ok(())
    }

    /// CMD11 and the 1.8 V signalling handshake: the card holds DAT[3:0] low
    /// until the host has stopped the clock, switched and restarted it.
    pub(crate) fn voltage_switch(&self, st: &mut HostState) -> Result<()> {
        if !self.caps.voltage_1v8() {
            return Err(Error::UnsupportedMode("controller has no 1.8 V signalling"));
        }
        self.do_request(st, &Command::new(opcode::VOLTAGE_SWITCH, 0, ResponseType::R1), None)?;

        let regs = self.regs();
        self.gate_clock(false);
        if regs.present_state().dat_levels() != 0 {
            return self.voltage_switch_failed(st);
        }
        regs.set_host_control2(regs.host_control2() | host_control2::SIGNALING_1V8);
        thread::sleep(self.config.voltage_switch_settle);
        if regs.host_control2() & host_control2::SIGNALING_1V8 == 0 {
            return self.voltage_switch_failed(st);
        }
        self.gate_clock(true);
        thread::sleep(Duration::from_millis(1));
        if regs.present_state().dat_levels() != 0xF {
            return self.voltage_switch_failed(st);
        }
        st.bus.signal_1v8 = true;
        info!("switched to 1.8 V signalling");
        Ok(())
    }

    fn voltage_switch_failed(&self, st: &mut HostState) -> Result<()> {
        warn!("voltage switch handshake failed, powering the card off");
        self.power_off(st);
        st.card = None;
        Err(Error::VoltageSwitch)
    }

    /// Switches an SD card to 1.8 V signalling
    pub fn switch_voltage(&self) -> Result<()> {
        let mut st = self.lock();
        if !self.card(&mut st)?.card_type.is_sd() {
            return Err(Error::UnsupportedMode("voltage switch needs an SD card"));
        }
        if st.bus.signal_1v8 {
            return Ok(());
        }
        self.voltage_switch(&mut st)
    }

    /// Reads the 64-byte switch status for a CMD6 check or switch
    pub(crate) fn sd_switch_status(&self, st: &mut HostState, set: bool, functions: [u8; 6]) -> Result<SwitchStatus> {
        let mut raw = [0u8; sd_switch::STATUS_SIZE];
        {
            let mut desc = DataDescriptor::read(&mut raw, sd_switch::STATUS_SIZE);
            self.do_request(
                st,
                &Command::new(opcode::SWITCH, switch_argument(set, functions), ResponseType::R1),
                Some(&mut desc),
            )?;
        }
        Ok(SwitchStatus(raw))
    }

    /// Checks that `value` is available in `group`, then selects it when `set`
    pub(crate) fn sd_switch(&self, st: &mut HostState, set: bool, group: u8, value: u8) -> Result<()> {
        if !(1..=6).contains(&group) || value >= sd_switch::KEEP {
            return Err(Error::InvalidRequest("SD function group or value out of range"));
        }
        let mut functions = [sd_switch::KEEP; 6];
        functions[group as usize - 1] = value;
        let check = self.sd_switch_status(st, false, functions)?;
        let support = check.support(group).unwrap_or(0);
        if support & (1 << value) == 0 || check.result(group) != Some(value) {
            debug!(group, value, support, "function not available");
            return Err(Error::SwitchFailed { group });
        }
        if set {
            let status = self.sd_switch_status(st, true, functions)?;
            if status.result(group) != Some(value) {
                return Err(Error::SwitchFailed { group });
            }
        }
        Ok(())
    }

    /// Applies the four UHS-I function groups in the order current limit,
    /// driver strength, command system, access mode, then moves the host to
    /// the new timing and tunes when the mode needs it.
    pub fn sd_uhs_setting(&self, current_limit: u8, drive_strength: u8, command_system: u8, access_mode: u8) -> Result<SpeedMode> {
        let mut st = self.lock();
        self.sd_uhs_setting_locked(&mut st, current_limit, drive_strength, command_system, access_mode)
    }

    pub(crate) fn sd_uhs_setting_locked(
        &self,
        st: &mut HostState,
        current_limit: u8,
        drive_strength: u8,
        command_system: u8,
        access_mode: u8,
    ) -> Result<SpeedMode> {
        if !self.card(st)?.card_type.is_sd() {
            return Err(Error::UnsupportedMode("UHS-I setting needs an SD card"));
        }
        if !st.bus.signal_1v8 {
            return Err(Error::UnsupportedMode("UHS-I needs 1.8 V signalling"));
        }
        let (mode, clock) = access_mode_speed(access_mode).ok_or(Error::InvalidRequest("unknown access mode"))?;
        let host_ok = match mode {
            SpeedMode::Sdr50 => self.caps.sdr50(),
            SpeedMode::Sdr104 => self.caps.sdr104(),
            SpeedMode::Ddr50 => self.caps.ddr50(),
            _ => true,
        };
        if !host_ok {
            return Err(Error::UnsupportedMode("controller lacks the requested UHS mode"));
        }
        if drive_strength > sd_switch::DRIVER_TYPE_D || self.caps.driver_types() & (1 << drive_strength) == 0 {
            return Err(Error::UnsupportedMode("controller lacks the requested driver type"));
        }

        self.sd_switch(st, true, sd_switch::GROUP_CURRENT_LIMIT, current_limit)?;
        st.bus.current_limit_ma = match current_limit {
            sd_switch::CURRENT_800MA => 800,
            sd_switch::CURRENT_600MA => 600,
            sd_switch::CURRENT_400MA => 400,
            _ => 200,
        };
        self.sd_switch(st, true, sd_switch::GROUP_DRIVER_STRENGTH, drive_strength)?;
        self.regs().set_driver_type(drive_strength);
        st.bus.driver_type = drive_strength;
        self.sd_switch(st, true, sd_switch::GROUP_COMMAND_SYSTEM, command_system)?;
        self.sd_switch(st, true, sd_switch::GROUP_ACCESS_MODE, access_mode)?;

        self.set_host_timing(st, mode);
        self.set_clock(st, clock)?;
        st.retune.active = false;
        if self.needs_tuning(mode) {
            self.tune(st)?;
            st.retune.active = true;
        }
        self.card(st)?.speed = mode;
        info!(?mode, clock, "UHS-I mode selected");
        Ok(mode)
    }

    /// Picks the fastest access mode both sides support after the voltage switch
    pub(crate) fn sd_select_best_uhs(&self, st: &mut HostState) -> Result<()> {
        if st.bus.width != BusWidth::Four {
            debug!("UHS-I needs a 4-bit bus, staying at SDR12");
            self.set_host_timing(st, SpeedMode::Sdr12);
            self.set_clock(st, hz::SD_DEFAULT_HZ)?;
            return Ok(());
        }
        let status = self.sd_switch_status(st, false, [sd_switch::KEEP; 6])?;
        let access = status.support(sd_switch::GROUP_ACCESS_MODE).unwrap_or(0);
        let candidates = [
            (sd_switch::ACCESS_SDR104, self.caps.sdr104()),
            (sd_switch::ACCESS_SDR50, self.caps.sdr50()),
            (sd_switch::ACCESS_DDR50, self.caps.ddr50()),
            (sd_switch::ACCESS_SDR25, true),
        ];
        let Some((mode, _)) = candidates
            .into_iter()
            .find(|(code, host)| *host && access & (1 << code) != 0)
        else {
            self.set_host_timing(st, SpeedMode::Sdr12);
            self.set_clock(st, hz::SD_DEFAULT_HZ)?;
            return Ok(());
        };
        let current = current_limit_for(
            self.caps.max_current_ma(st.bus.voltage_mv),
            status.support(sd_switch::GROUP_CURRENT_LIMIT).unwrap_or(0),
        );
        match self.sd_uhs_setting_locked(st, current, sd_switch::DRIVER_TYPE_B, 0, mode) {
            Ok(_) => Ok(()),
            Err(Error::TuningFailure) if mode == sd_switch::ACCESS_SDR104 => {
                warn!("SDR104 tuning failed, trying SDR50");
                self.sd_uhs_setting_locked(st, current, sd_switch::DRIVER_TYPE_B, 0, sd_switch::ACCESS_SDR50)
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes the CCCR bus speed select field
    pub(crate) fn sdio_set_bus_speed(&self, st: &mut HostState, select: u8) -> Result<()> {
        let current = self.io_rw_direct_locked(st, false, 0, cccr::BUS_SPEED, 0)?;
        if select == cccr::SPEED_SDR25 && current & cccr::SUPPORT_HIGH_SPEED == 0 {
            return Err(Error::UnsupportedMode("SDIO card lacks high speed"));
        }
        let value = (current & !cccr::SPEED_SELECT_MASK) | ((select << cccr::SPEED_SELECT_SHIFT) & cccr::SPEED_SELECT_MASK);
        self.io_rw_direct_locked(st, true, 0, cccr::BUS_SPEED, value)?;
        Ok(())
    }

    /// Selects an SDIO UHS-I mode and driver strength through the CCCR
    pub fn sdio_select_uhs(&self, drive_strength: u8, mode: SpeedMode) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        let (code, needs, clock) = sdio_speed_select(mode).ok_or(Error::InvalidRequest("not an SDIO UHS mode"))?;
        if drive_strength > sd_switch::DRIVER_TYPE_D {
            return Err(Error::InvalidRequest("driver strength out of range"));
        }
        if !st.bus.signal_1v8 {
            return Err(Error::UnsupportedMode("UHS-I needs 1.8 V signalling"));
        }
        let uhs_support = self.card(st)?.sdio.as_ref().map_or(0, |i| i.uhs_support);
        if needs != 0 && uhs_support & needs == 0 {
            return Err(Error::UnsupportedMode("SDIO card lacks the requested UHS mode"));
        }
        if drive_strength != 0 {
            let strength = self.io_rw_direct_locked(st, false, 0, cccr::DRIVER_STRENGTH, 0)?;
            if strength & (1 << (drive_strength - 1)) == 0 || self.caps.driver_types() & (1 << drive_strength) == 0 {
                return Err(Error::UnsupportedMode("driver strength not supported"));
            }
            let value = (strength & 0x0F) | (drive_strength << cccr::DRIVER_SELECT_SHIFT);
            self.io_rw_direct_locked(st, true, 0, cccr::DRIVER_STRENGTH, value)?;
        }
        self.regs().set_driver_type(drive_strength);
        st.bus.driver_type = drive_strength;

        self.sdio_set_bus_speed(st, code)?;
        self.set_host_timing(st, mode);
        self.set_clock(st, clock)?;
        st.retune.active = false;
        if self.needs_tuning(mode) {
            self.tune(st)?;
            st.retune.active = true;
        }
        self.card(st)?.speed = mode;
        info!(?mode, "SDIO UHS mode selected");
        Ok(())
    }

    /// High speed for whichever card is in the slot: HS_TIMING on MMC,
    /// CMD6 group 1 on SD, CCCR bus speed on SDIO
    pub fn set_high_speed(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        let card_type = self.card(st)?.card_type;
        if !self.caps.high_speed() {
            return Err(Error::UnsupportedMode("controller lacks high speed"));
        }
        if card_type.is_mmc() {
            self.mmc_high_speed(st)?;
        } else {
            let mode = if st.bus.signal_1v8 {
                SpeedMode::Sdr25
            } else {
                SpeedMode::HighSpeed
            };
            if card_type.is_sdio() {
                self.sdio_set_bus_speed(st, cccr::SPEED_SDR25)?;
            } else {
                self.sd_switch(st, true, sd_switch::GROUP_ACCESS_MODE, sd_switch::ACCESS_SDR25)?;
            }
            self.set_host_timing(st, mode);
            self.set_clock(st, hz::SD_HIGH_SPEED_HZ)?;
            st.retune.active = false;
        }
        let timing = st.bus.timing;
        self.card(st)?.speed = timing;
        info!(?timing, "high speed enabled");
        Ok(())
    }

    /// Back to default speed (legacy timing, 25/26 MHz)
    pub fn set_full_speed(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        let card = self.card(st)?;
        let card_type = card.card_type;
        let csd_max = card.csd.as_ref().map_or(hz::SD_DEFAULT_HZ, |c| c.max_transfer_hz);
        let mode = if st.bus.signal_1v8 {
            SpeedMode::Sdr12
        } else {
            SpeedMode::Legacy
        };
        if card_type.is_mmc() {
            self.set_host_timing(st, SpeedMode::Legacy);
            self.set_clock(st, csd_max.min(hz::MMC_LEGACY_HZ))?;
            self.mmc_switch(st, ext_csd::HS_TIMING, ext_csd::TIMING_LEGACY)?;
        } else {
            if card_type.is_sdio() {
                self.sdio_set_bus_speed(st, cccr::SPEED_SDR12)?;
            } else {
                self.sd_switch(st, true, sd_switch::GROUP_ACCESS_MODE, sd_switch::ACCESS_SDR12)?;
            }
            self.set_host_timing(st, mode);
            self.set_clock(st, csd_max.min(hz::SD_DEFAULT_HZ))?;
        }
        st.retune.active = false;
        let timing = st.bus.timing;
        self.card(st)?.speed = timing;
        info!(?timing, "default speed");
        Ok(())
    }

    /// Moves an eMMC to HS200 at `clock_hz` with the given driver strength
    /// and bus width, tuning before the mode is declared active.
    pub fn set_hs200(&self, clock_hz: u32, driver: u8, width: BusWidth) -> Result<()> {
        let mut st = self.lock();
        self.hs200_locked(&mut st, clock_hz, driver, width)
    }

    pub(crate) fn hs200_locked(&self, st: &mut HostState, clock_hz: u32, driver: u8, width: BusWidth) -> Result<()> {
        self.require_mmc(st)?;
        let strengths = match self.card(st)?.ext_csd.as_ref() {
            Some(ext) if ext.supports_hs200() => ext.driver_strengths(),
            _ => return Err(Error::UnsupportedMode("card does not support HS200")),
        };
        if !self.caps.sdr104() || !self.caps.voltage_1v8() {
            return Err(Error::UnsupportedMode("controller cannot run HS200"));
        }
        if width == BusWidth::One {
            return Err(Error::InvalidRequest("HS200 needs a 4- or 8-bit bus"));
        }
        if width == BusWidth::Eight && (!self.caps.bus_8bit() || self.config.max_bus_width != BusWidth::Eight) {
            return Err(Error::UnsupportedMode("8-bit bus not available"));
        }
        if clock_hz == 0 || clock_hz > hz::HS200_HZ {
            return Err(Error::InvalidRequest("HS200 clock must be at most 200 MHz"));
        }
        if driver > 4 || strengths & (1 << driver) == 0 {
            return Err(Error::UnsupportedMode("card lacks the requested driver strength"));
        }

        if !st.bus.signal_1v8 {
            let regs = self.regs();
            regs.set_host_control2(regs.host_control2() | host_control2::SIGNALING_1V8);
            thread::sleep(self.config.voltage_switch_settle);
            st.bus.signal_1v8 = true;
        }
        self.mmc_set_bus_width(st, width)?;
        self.mmc_switch(st, ext_csd::HS_TIMING, ext_csd::TIMING_HS200 | (driver << 4))?;
        self.regs().set_driver_type(driver);
        st.bus.driver_type = driver;
        self.set_host_timing(st, SpeedMode::Hs200);
        self.set_clock(st, clock_hz)?;

        match self.tune(st) {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "HS200 tuning failed, dropping to high speed");
                st.retune.in_progress = true;
                let fallback = self.change_speed(st, SpeedMode::HighSpeed);
                st.retune.in_progress = false;
                fallback?;
                return Err(e);
            }
        }
        st.retune.active = true;
        self.card(st)?.speed = SpeedMode::Hs200;
        info!(clock_hz, ?width, driver, "HS200 enabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_speed_switch_argument() {
        let mut fns = [sd_switch::KEEP; 6];
        fns[0] = sd_switch::ACCESS_SDR25;
        assert_eq!(switch_argument(true, fns), 0x80FF_FFF1);
        assert_eq!(switch_argument(false, [sd_switch::KEEP; 6]), 0x00FF_FFFF);
    }

    #[test]
    fn switch_status_layout() {
        let mut raw = [0u8; 64];
        raw[0..2].copy_from_slice(&200u16.to_be_bytes());
        // group 1 support: SDR12, SDR25, SDR50
        raw[12..14].copy_from_slice(&0x0007u16.to_be_bytes());
        // group 4 support: 200 and 400 mA
        raw[6..8].copy_from_slice(&0x0003u16.to_be_bytes());
        // group 2 result in the high nibble of byte 16, group 1 in the low
        raw[16] = 0x02;
        raw[15] = 0x10;
        let status = SwitchStatus(raw);
        assert_eq!(status.max_current(), 200);
        assert_eq!(status.support(1), Some(0x7));
        assert_eq!(status.support(4), Some(0x3));
        assert_eq!(status.result(1), Some(2));
        assert_eq!(status.result(2), Some(0));
        assert_eq!(status.result(4), Some(1));
        assert_eq!(status.result(3), Some(0));
    }

    #[test]
    fn switch_status_rejects_unknown_groups() {
        let status = SwitchStatus([0u8; 64]);
        assert_eq!(status.support(0), None);
        assert_eq!(status.support(7), None);
        assert_eq!(status.result(0), None);
        assert_eq!(status.busy(9), None);
        assert_eq!(status.busy(6), Some(0));
    }

    #[test]
    fn current_limit_respects_host_budget() {
        assert_eq!(current_limit_for(800, 0x000F), sd_switch::CURRENT_800MA);
        assert_eq!(current_limit_for(500, 0x000F), sd_switch::CURRENT_400MA);
        assert_eq!(current_limit_for(800, 0x0001), sd_switch::CURRENT_200MA);
    }

    #[test]
    fn access_modes_round_trip_through_speed() {
        for code in 0..=4 {
            let (mode, _) = access_mode_speed(code).unwrap();
            assert_eq!(speed_access_mode(mode), Some(code));
        }
        assert_eq!(access_mode_speed(5), None);
    }
}
