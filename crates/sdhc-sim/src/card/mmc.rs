//! eMMC extensions: EXT_CSD, hardware partitions, packed commands, RPMB,
//! sleep and the real-time clock block.

use sdhc_hw::card::{block_count_arg, ext_csd, opcode, packed, r1, rpmb, sleep_arg, state, switch};
use sdhc_hw::specs::{TUNING_BLOCK_4BIT, TUNING_BLOCK_8BIT};
use tracing::{debug, info, warn};

use super::{Outcome, SimCard, Source, WP_PERMANENT, WP_POWER_ON, WP_TEMPORARY};
use crate::config::CardConfig;
use crate::storage::Storage;

const BLOCK: u64 = 512;
/// BOOT_SIZE_MULT and RPMB_SIZE_MULT unit
const SIZE_UNIT: u64 = 128 * 1024;
/// GP partition unit before the HC group multipliers: 512 KiB
const GP_UNIT_BLOCKS: u64 = 1024;

/// Memory area selected by PARTITION_CONFIG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    User,
    /// Boot area partition 1 or 2
    Boot(u8),
    Rpmb,
    /// General-purpose partition 1 to 4
    General(u8),
}

impl Area {
    pub fn from_access(code: u8) -> Option<Area> {
        match code {
            0 => Some(Area::User),
            1 | 2 => Some(Area::Boot(code)),
            3 => Some(Area::Rpmb),
            4..=7 => Some(Area::General(code - 3)),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum RpmbPending {
    Nothing,
    Frame(Vec<u8>),
    Data { address: u16, nonce: [u8; rpmb::NONCE_SIZE] },
}

#[derive(Debug)]
struct Rpmb {
    key: Option<[u8; rpmb::MAC_SIZE]>,
    counter: u32,
    data: Vec<u8>,
    last_result: Option<Vec<u8>>,
    pending: RpmbPending,
}

fn be16(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

fn be32(frame: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
}

fn response_frame(response: u16, result: u16) -> Vec<u8> {
    let mut frame = vec![0u8; rpmb::FRAME_SIZE];
    frame[rpmb::RESULT_OFFSET..rpmb::RESULT_OFFSET + 2].copy_from_slice(&result.to_be_bytes());
    frame[rpmb::REQUEST_OFFSET..rpmb::REQUEST_OFFSET + 2].copy_from_slice(&response.to_be_bytes());
    frame
}

impl Rpmb {
    fn new(len: u64) -> Self {
        Self {
            key: None,
            counter: 0,
            data: vec![0; len as usize],
            last_result: None,
            pending: RpmbPending::Nothing,
        }
    }

    fn blocks(&self) -> u32 {
        (self.data.len() / rpmb::DATA_SIZE) as u32
    }

    /// Frames the host wrote; results surface through the next read
    fn request(&mut self, frames: &[u8], reliable: bool) {
        let Some(first) = frames.get(..rpmb::FRAME_SIZE) else {
            warn!("RPMB request shorter than one frame");
            return;
        };
        let request = be16(first, rpmb::REQUEST_OFFSET);
        match request {
            rpmb::REQ_PROGRAM_KEY => {
                let result = if !reliable || self.key.is_some() {
                    rpmb::RESULT_GENERAL_FAILURE
                } else {
                    let mut key = [0u8; rpmb::MAC_SIZE];
                    key.copy_from_slice(&first[rpmb::MAC_OFFSET..rpmb::MAC_OFFSET + rpmb::MAC_SIZE]);
                    self.key = Some(key);
                    info!("RPMB authentication key programmed");
                    rpmb::RESULT_OK
                };
                self.last_result = Some(response_frame(rpmb::RESP_PROGRAM_KEY, result));
            }
            rpmb::REQ_READ_COUNTER => {
                let result = if self.key.is_some() { rpmb::RESULT_OK } else { rpmb::RESULT_KEY_NOT_PROGRAMMED };
                let mut frame = response_frame(rpmb::RESP_READ_COUNTER, result);
                let nonce = rpmb::NONCE_OFFSET..rpmb::NONCE_OFFSET + rpmb::NONCE_SIZE;
                frame[nonce.clone()].copy_from_slice(&first[nonce]);
                frame[rpmb::WRITE_COUNTER_OFFSET..rpmb::WRITE_COUNTER_OFFSET + 4]
                    .copy_from_slice(&self.counter.to_be_bytes());
                self.pending = RpmbPending::Frame(frame);
            }
            rpmb::REQ_WRITE_DATA => {
                let count = (frames.len() / rpmb::FRAME_SIZE) as u32;
                let address = be16(first, rpmb::ADDRESS_OFFSET);
                let counter = be32(first, rpmb::WRITE_COUNTER_OFFSET);
                let result = if self.key.is_none() {
                    rpmb::RESULT_KEY_NOT_PROGRAMMED
                } else if !reliable {
                    rpmb::RESULT_GENERAL_FAILURE
                } else if counter != self.counter {
                    rpmb::RESULT_COUNTER_FAILURE
                } else if address as u32 + count > self.blocks() {
                    rpmb::RESULT_ADDRESS_FAILURE
                } else {
                    for (i, frame) in frames.chunks_exact(rpmb::FRAME_SIZE).enumerate() {
                        let at = (address as usize + i) * rpmb::DATA_SIZE;
                        self.data[at..at + rpmb::DATA_SIZE]
                            .copy_from_slice(&frame[rpmb::DATA_OFFSET..rpmb::DATA_OFFSET + rpmb::DATA_SIZE]);
                    }
                    self.counter += 1;
                    debug!("RPMB wrote {} blocks at {}, counter now {}", count, address, self.counter);
                    rpmb::RESULT_OK
                };
                let mut frame = response_frame(rpmb::RESP_WRITE_DATA, result);
                frame[rpmb::WRITE_COUNTER_OFFSET..rpmb::WRITE_COUNTER_OFFSET + 4]
                    .copy_from_slice(&self.counter.to_be_bytes());
                frame[rpmb::ADDRESS_OFFSET..rpmb::ADDRESS_OFFSET + 2].copy_from_slice(&address.to_be_bytes());
                self.last_result = Some(frame);
            }
            rpmb::REQ_READ_RESULT => {
                let frame = self
                    .last_result
                    .clone()
                    .unwrap_or_else(|| response_frame(0, rpmb::RESULT_GENERAL_FAILURE));
                self.pending = RpmbPending::Frame(frame);
            }
            rpmb::REQ_READ_DATA => {
                let mut nonce = [0u8; rpmb::NONCE_SIZE];
                nonce.copy_from_slice(&first[rpmb::NONCE_OFFSET..rpmb::NONCE_OFFSET + rpmb::NONCE_SIZE]);
                self.pending = RpmbPending::Data {
                    address: be16(first, rpmb::ADDRESS_OFFSET),
                    nonce,
                };
            }
            other => {
                warn!("Unknown RPMB request {:#06X}", other);
                self.last_result = Some(response_frame(0, rpmb::RESULT_GENERAL_FAILURE));
            }
        }
    }

    /// Frames returned to a read of `blocks` frames
    fn response(&mut self, blocks: u32) -> Vec<u8> {
        match std::mem::replace(&mut self.pending, RpmbPending::Nothing) {
            RpmbPending::Frame(frame) => frame,
            RpmbPending::Data { address, nonce } => {
                let blocks = blocks.max(1);
                let result = if self.key.is_none() {
                    rpmb::RESULT_KEY_NOT_PROGRAMMED
                } else if address as u32 + blocks > self.blocks() {
                    rpmb::RESULT_ADDRESS_FAILURE
                } else {
                    rpmb::RESULT_OK
                };
                let mut out = Vec::with_capacity(blocks as usize * rpmb::FRAME_SIZE);
                for i in 0..blocks {
                    let mut frame = response_frame(rpmb::RESP_READ_DATA, result);
                    if result == rpmb::RESULT_OK {
                        let at = (address as usize + i as usize) * rpmb::DATA_SIZE;
                        frame[rpmb::DATA_OFFSET..rpmb::DATA_OFFSET + rpmb::DATA_SIZE]
                            .copy_from_slice(&self.data[at..at + rpmb::DATA_SIZE]);
                    }
                    frame[rpmb::NONCE_OFFSET..rpmb::NONCE_OFFSET + rpmb::NONCE_SIZE].copy_from_slice(&nonce);
                    frame[rpmb::ADDRESS_OFFSET..rpmb::ADDRESS_OFFSET + 2].copy_from_slice(&address.to_be_bytes());
                    frame[rpmb::BLOCK_COUNT_OFFSET..rpmb::BLOCK_COUNT_OFFSET + 2]
                        .copy_from_slice(&(blocks as u16).to_be_bytes());
                    out.extend_from_slice(&frame);
                }
                out
            }
            RpmbPending::Nothing => response_frame(0, rpmb::RESULT_GENERAL_FAILURE),
        }
    }
}

#[derive(Debug)]
pub(super) struct MmcState {
    pub(super) ext: Vec<u8>,
    boot: [Storage; 2],
    general: [Option<Storage>; 4],
    rpmb: Rpmb,
    /// Entries of the last packed read header
    packed_reads: Option<Vec<(u32, u32)>>,
    trim_marks: Vec<(Area, u64, u64)>,
    rtc: Option<Vec<u8>>,
}

impl MmcState {
    pub(super) fn new(config: &CardConfig, user_blocks: u64) -> Self {
        let mut ext = vec![0u8; ext_csd::SIZE];
        ext[ext_csd::EXT_CSD_REV] = 8;
        // CSD_STRUCTURE
        ext[194] = 2;
        ext[ext_csd::CARD_TYPE] = ext_csd::CARD_TYPE_HS26 | ext_csd::CARD_TYPE_HS52;
        if config.uhs {
            ext[ext_csd::CARD_TYPE] |= ext_csd::CARD_TYPE_HS200_1V8;
        }
        ext[ext_csd::DRIVER_STRENGTH] = 0x1F;
        ext[ext_csd::SEC_COUNT..ext_csd::SEC_COUNT + 4].copy_from_slice(&(user_blocks as u32).to_le_bytes());
        ext[ext_csd::S_A_TIMEOUT] = 0x11;
        ext[ext_csd::HC_WP_GRP_SIZE] = 1;
        ext[ext_csd::ERASE_TIMEOUT_MULT] = 1;
        ext[ext_csd::HC_ERASE_GRP_SIZE] = 1;
        ext[ext_csd::BOOT_SIZE_MULT] = 1;
        ext[ext_csd::RPMB_SIZE_MULT] = 1;
        ext[ext_csd::BOOT_INFO] = 0x07;
        ext[ext_csd::SEC_FEATURE_SUPPORT] =
            ext_csd::SEC_ER_EN | ext_csd::SEC_GB_CL_EN | ext_csd::SEC_SANITIZE;
        ext[ext_csd::GENERIC_CMD6_TIME] = 10;
        ext[ext_csd::CACHE_SIZE..ext_csd::CACHE_SIZE + 4].copy_from_slice(&256u32.to_le_bytes());
        ext[ext_csd::PARTITION_SUPPORT] = 0x07;
        ext[ext_csd::MAX_ENH_SIZE_MULT] = 0x10;
        ext[ext_csd::CONTEXT_CAPABILITIES] = 0x05;
        ext[ext_csd::MAX_PACKED_WRITES] = 63;
        ext[ext_csd::MAX_PACKED_READS] = 63;
        ext[ext_csd::BKOPS_SUPPORT] = 1;
        ext[ext_csd::HPI_FEATURES] = ext_csd::HPI_SUPPORTED;
        ext[ext_csd::S_CMD_SET] = 1;

        let boot_len = ext[ext_csd::BOOT_SIZE_MULT] as u64 * SIZE_UNIT;
        let rpmb_len = ext[ext_csd::RPMB_SIZE_MULT] as u64 * SIZE_UNIT;
        Self {
            ext,
            boot: [Storage::ram(boot_len, 0), Storage::ram(boot_len, 0)],
            general: [None, None, None, None],
            rpmb: Rpmb::new(rpmb_len),
            packed_reads: None,
            trim_marks: Vec::new(),
            rtc: None,
        }
    }

    /// Volatile EXT_CSD fields lose their values at power-up
    pub(super) fn power_cycle(&mut self) {
        for index in [
            ext_csd::HS_TIMING,
            ext_csd::BUS_WIDTH,
            ext_csd::POWER_OFF_NOTIFICATION,
            ext_csd::FLUSH_CACHE,
            ext_csd::CACHE_CTRL,
            ext_csd::BKOPS_START,
            ext_csd::SANITIZE_START,
            ext_csd::HPI_MGMT,
            ext_csd::EXCEPTION_EVENTS_CTRL,
            ext_csd::EXCEPTION_EVENTS_STATUS,
            ext_csd::ERASE_GROUP_DEF,
            ext_csd::PACKED_FAILURE_INDEX,
            ext_csd::PACKED_COMMAND_STATUS,
        ] {
            self.ext[index] = 0;
        }
        self.ext[ext_csd::CONTEXT_CONF..ext_csd::CONTEXT_CONF + 15].fill(0);
        self.ext[ext_csd::PARTITION_CONFIG] &= !ext_csd::PART_ACCESS_MASK;
        self.ext[ext_csd::USER_WP] &= !ext_csd::US_PWR_WP_EN;
        self.ext[ext_csd::BOOT_WP] &= !ext_csd::B_PWR_WP_EN;
        self.packed_reads = None;
        self.trim_marks.clear();
        self.rpmb.pending = RpmbPending::Nothing;
    }

    /// CMD0 drops the bus configuration and the partition selection
    pub(super) fn soft_reset(&mut self) {
        self.ext[ext_csd::HS_TIMING] = 0;
        self.ext[ext_csd::BUS_WIDTH] = 0;
        self.ext[ext_csd::PARTITION_CONFIG] &= !ext_csd::PART_ACCESS_MASK;
    }

    pub(super) fn exception_pending(&self) -> bool {
        self.ext[ext_csd::EXCEPTION_EVENTS_STATUS] & self.ext[ext_csd::EXCEPTION_EVENTS_CTRL] != 0
    }

    pub(super) fn hpi_enabled(&self) -> bool {
        self.ext[ext_csd::HPI_MGMT] & ext_csd::HPI_EN != 0
    }

    pub(super) fn secure_erase_supported(&self) -> bool {
        self.ext[ext_csd::SEC_FEATURE_SUPPORT] & ext_csd::SEC_ER_EN != 0
    }

    pub(super) fn boot_protected(&self) -> bool {
        self.ext[ext_csd::BOOT_WP] & (ext_csd::B_PWR_WP_EN | ext_csd::B_PERM_WP_EN) != 0
    }

    /// Protection type CMD28 applies under the current USER_WP
    pub(super) fn user_wp_kind(&self) -> u8 {
        let user_wp = self.ext[ext_csd::USER_WP];
        if user_wp & ext_csd::US_PERM_WP_EN != 0 {
            WP_PERMANENT
        } else if user_wp & ext_csd::US_PWR_WP_EN != 0 {
            WP_POWER_ON
        } else {
            WP_TEMPORARY
        }
    }

    pub(super) fn current_area(&self) -> Area {
        Area::from_access(self.ext[ext_csd::PARTITION_CONFIG] & ext_csd::PART_ACCESS_MASK).unwrap_or(Area::User)
    }

    fn area_exists(&self, area: Area) -> bool {
        match area {
            Area::User => true,
            Area::Boot(_) => self.ext[ext_csd::BOOT_SIZE_MULT] != 0,
            Area::Rpmb => self.ext[ext_csd::RPMB_SIZE_MULT] != 0,
            Area::General(n) => self.general.get(n as usize - 1).is_some_and(Option::is_some),
        }
    }

    pub(super) fn area_len(&self, area: Area) -> u64 {
        match area {
            Area::User => 0,
            Area::Boot(n) => self.boot.get(n as usize - 1).map_or(0, Storage::len),
            Area::Rpmb => self.rpmb.data.len() as u64,
            Area::General(n) => self
                .general
                .get(n as usize - 1)
                .and_then(Option::as_ref)
                .map_or(0, Storage::len),
        }
    }

    pub(super) fn storage(&mut self, area: Area) -> Option<&mut Storage> {
        match area {
            Area::Boot(n) => self.boot.get_mut((n as usize).checked_sub(1)?),
            Area::General(n) => self.general.get_mut((n as usize).checked_sub(1)?)?.as_mut(),
            Area::User | Area::Rpmb => None,
        }
    }

    pub(super) fn clear_packed_status(&mut self) {
        self.ext[ext_csd::PACKED_COMMAND_STATUS] = 0;
        self.ext[ext_csd::PACKED_FAILURE_INDEX] = 0;
        self.ext[ext_csd::EXCEPTION_EVENTS_STATUS] &= !ext_csd::PACKED_FAILURE;
    }

    fn packed_failed(&mut self, index: usize) {
        warn!("Packed command failed at entry {}", index);
        self.ext[ext_csd::PACKED_COMMAND_STATUS] = if index > 0 {
            packed::STATUS_ERROR | packed::STATUS_INDEXED_ERROR
        } else {
            packed::STATUS_ERROR
        };
        self.ext[ext_csd::PACKED_FAILURE_INDEX] = index as u8;
        self.ext[ext_csd::EXCEPTION_EVENTS_STATUS] |= ext_csd::PACKED_FAILURE;
    }

    pub(super) fn mark_trim(&mut self, area: Area, first: u64, last: u64) {
        debug!("Secure trim marked blocks {}..{}", first, last);
        self.trim_marks.push((area, first, last));
    }

    pub(super) fn take_trim_marks(&mut self, area: Area) -> Vec<(u64, u64)> {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.trim_marks).into_iter().partition(|m| m.0 == area);
        self.trim_marks = kept;
        taken.into_iter().map(|(_, first, last)| (first, last)).collect()
    }

    pub(super) fn rpmb_request(&mut self, frames: &[u8], reliable: bool) {
        self.rpmb.request(frames, reliable);
    }

    pub(super) fn store_rtc(&mut self, block: Vec<u8>) {
        debug!("RTC information block received ({} bytes)", block.len());
        self.rtc = Some(block);
    }

    fn create_general_partitions(&mut self) {
        let unit = GP_UNIT_BLOCKS
            * self.ext[ext_csd::HC_WP_GRP_SIZE].max(1) as u64
            * self.ext[ext_csd::HC_ERASE_GRP_SIZE].max(1) as u64;
        for n in 0..4 {
            let at = ext_csd::GP_SIZE_MULT + 3 * n;
            let mult = u32::from_le_bytes([self.ext[at], self.ext[at + 1], self.ext[at + 2], 0]) as u64;
            if mult > 0 {
                info!("General purpose partition {}: {} blocks", n + 1, mult * unit);
                self.general[n] = Some(Storage::ram(mult * unit * BLOCK, 0));
            }
        }
    }

    /// Applies one CMD6 SWITCH argument
    pub(super) fn switch(&mut self, arg: u32) -> Result<(), String> {
        let access = ((arg >> switch::ACCESS_SHIFT) & 0x3) as u8;
        let index = ((arg >> switch::INDEX_SHIFT) & 0xFF) as usize;
        let value = ((arg >> switch::VALUE_SHIFT) & 0xFF) as u8;
        let old = self.ext[index];
        let new = match access {
            switch::ACCESS_COMMAND_SET => return Ok(()),
            switch::ACCESS_SET_BITS => old | value,
            switch::ACCESS_CLEAR_BITS => old & !value,
            _ => value,
        };
        let partitioning = ext_csd::ENH_START_ADDR..ext_csd::PARTITION_SETTING_COMPLETED;
        let contexts = ext_csd::CONTEXT_CONF..ext_csd::CONTEXT_CONF + 15;

        match index {
            ext_csd::FLUSH_CACHE => {
                if new & 1 != 0 {
                    if self.ext[ext_csd::CACHE_CTRL] & ext_csd::CACHE_EN == 0 {
                        return Err("cache flush with the cache off".into());
                    }
                    debug!("Cache flushed");
                }
                self.ext[index] = 0;
                return Ok(());
            }
            ext_csd::CACHE_CTRL => {
                if self.ext[ext_csd::CACHE_SIZE..ext_csd::CACHE_SIZE + 4].iter().all(|b| *b == 0) {
                    return Err("card has no cache".into());
                }
            }
            ext_csd::POWER_OFF_NOTIFICATION if new > ext_csd::POWER_OFF_LONG + 1 => {
                return Err(format!("power-off notification value {}", new));
            }
            ext_csd::POWER_OFF_NOTIFICATION | ext_csd::EXCEPTION_EVENTS_CTRL => {}
            i if contexts.contains(&i) => {}
            i if partitioning.contains(&i) || i == ext_csd::PARTITIONS_ATTRIBUTE => {
                if self.ext[ext_csd::PARTITION_SETTING_COMPLETED] & 1 != 0 {
                    return Err("partitioning already completed".into());
                }
                if self.ext[ext_csd::PARTITION_SUPPORT] & 1 == 0 {
                    return Err("partitioning not supported".into());
                }
            }
            ext_csd::PARTITION_SETTING_COMPLETED => {
                if old & 1 != 0 {
                    return Err("partitioning already completed".into());
                }
                if new & 1 != 0 {
                    self.ext[index] = new;
                    self.create_general_partitions();
                    return Ok(());
                }
            }
            ext_csd::HPI_MGMT => {
                if self.ext[ext_csd::HPI_FEATURES] & ext_csd::HPI_SUPPORTED == 0 {
                    return Err("HPI not supported".into());
                }
            }
            ext_csd::RST_N_FUNCTION => {
                if old != 0 {
                    return Err("RST_n function is one-time programmable".into());
                }
            }
            ext_csd::BKOPS_EN => {
                if self.ext[ext_csd::BKOPS_SUPPORT] == 0 {
                    return Err("background operations not supported".into());
                }
            }
            ext_csd::BKOPS_START => {
                if self.ext[ext_csd::BKOPS_EN] & ext_csd::BKOPS_MANUAL_EN == 0 {
                    return Err("manual background operations not enabled".into());
                }
                debug!("Background operations started");
                self.ext[index] = 0;
                return Ok(());
            }
            ext_csd::SANITIZE_START => {
                if self.ext[ext_csd::SEC_FEATURE_SUPPORT] & ext_csd::SEC_SANITIZE == 0 {
                    return Err("sanitize not supported".into());
                }
                info!("Sanitize started");
                self.ext[index] = 0;
                return Ok(());
            }
            ext_csd::USER_WP
            | ext_csd::BOOT_WP
            | ext_csd::ERASE_GROUP_DEF
            | ext_csd::BOOT_BUS_CONDITIONS
            | ext_csd::BOOT_CONFIG_PROT => {}
            ext_csd::PARTITION_CONFIG => {
                let code = new & ext_csd::PART_ACCESS_MASK;
                if !Area::from_access(code).is_some_and(|a| self.area_exists(a)) {
                    return Err(format!("partition access {} not available", code));
                }
            }
            ext_csd::BUS_WIDTH => {
                if !matches!(
                    new,
                    ext_csd::BUS_WIDTH_1
                        | ext_csd::BUS_WIDTH_4
                        | ext_csd::BUS_WIDTH_8
                        | ext_csd::BUS_WIDTH_4_DDR
                        | ext_csd::BUS_WIDTH_8_DDR
                ) {
                    return Err(format!("bus width value {}", new));
                }
            }
            ext_csd::HS_TIMING => {
                let timing = new & 0xF;
                let driver = (new >> 4) as u32;
                if timing > ext_csd::TIMING_HS200 {
                    return Err(format!("timing interface {}", timing));
                }
                if timing == ext_csd::TIMING_HS200 && self.ext[ext_csd::CARD_TYPE] & ext_csd::CARD_TYPE_HS200_1V8 == 0 {
                    return Err("HS200 not supported".into());
                }
                if (self.ext[ext_csd::DRIVER_STRENGTH] as u32 | 1) & (1 << driver) == 0 {
                    return Err(format!("driver strength {}", driver));
                }
            }
            _ => return Err(format!("EXT_CSD[{}] is not writable", index)),
        }
        self.ext[index] = new;
        debug!("EXT_CSD[{}] = {:#04X}", index, new);
        Ok(())
    }
}

impl SimCard {
    /// RPMB write counter, for inspection
    pub fn rpmb_counter(&self) -> Option<u32> {
        self.mmc.as_ref().map(|m| m.rpmb.counter)
    }

    /// Last RTC block the host sent with CMD49
    pub fn last_rtc(&self) -> Option<&[u8]> {
        self.mmc.as_ref()?.rtc.as_deref()
    }

    /// Reads one EXT_CSD byte, for inspection
    pub fn ext_csd(&self, index: usize) -> Option<u8> {
        self.mmc.as_ref()?.ext.get(index).copied()
    }

    /// CMD5: SLEEP_AWAKE - Enter or leave the eMMC sleep state
    pub(super) fn cmd5_sleep_awake(&mut self, arg: u32) -> Outcome {
        if self.mmc.is_none() || !self.addressed(arg) {
            return self.illegal(opcode::SLEEP_AWAKE);
        }
        if arg & sleep_arg::SLEEP != 0 {
            if self.state != state::STANDBY {
                return self.illegal(opcode::SLEEP_AWAKE);
            }
            let status = self.r1(0);
            self.state = state::SLEEP;
            info!("Card asleep");
            Outcome::short(status)
        } else {
            if self.state != state::SLEEP {
                return self.illegal(opcode::SLEEP_AWAKE);
            }
            let status = self.r1(0);
            self.state = state::STANDBY;
            info!("Card awake");
            Outcome::short(status)
        }
    }

    /// CMD6: SWITCH - Modify one EXT_CSD byte
    pub(super) fn cmd6_mmc_switch(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER || self.mmc.is_none() {
            return self.illegal(opcode::SWITCH);
        }
        let status = self.r1(0);
        if let Some(mmc) = self.mmc.as_mut() {
            if let Err(why) = mmc.switch(arg) {
                warn!("EXT_CSD switch {:#010X} rejected: {}", arg, why);
                self.deferred |= r1::SWITCH_ERROR;
            }
        }
        self.busy_polls = self.config.program_polls;
        Outcome::short(status)
    }

    /// CMD8: SEND_EXT_CSD
    pub(super) fn cmd8_send_ext_csd(&mut self) -> Outcome {
        if self.state != state::TRANSFER || self.mmc.is_none() {
            return self.illegal(opcode::SEND_EXT_CSD);
        }
        let status = self.r1(0);
        let Some(mmc) = self.mmc.as_mut() else {
            return Outcome::timeout();
        };
        let image = mmc.ext.clone();
        // Reading EXT_CSD acknowledges a packed failure event
        mmc.ext[ext_csd::EXCEPTION_EVENTS_STATUS] &= !ext_csd::PACKED_FAILURE;
        self.start_sending();
        Outcome::read(status, Source::Bytes(image))
    }

    /// CMD21: SEND_TUNING_BLOCK_HS200
    pub(super) fn cmd21_send_tuning_block(&mut self) -> Outcome {
        let Some(mmc) = self.mmc.as_ref() else {
            return self.illegal(opcode::SEND_TUNING_BLOCK_HS200);
        };
        if self.state != state::TRANSFER || mmc.ext[ext_csd::HS_TIMING] & 0xF != ext_csd::TIMING_HS200 {
            return self.illegal(opcode::SEND_TUNING_BLOCK_HS200);
        }
        let pattern = if mmc.ext[ext_csd::BUS_WIDTH] == ext_csd::BUS_WIDTH_8 {
            TUNING_BLOCK_8BIT.to_vec()
        } else {
            TUNING_BLOCK_4BIT.to_vec()
        };
        let status = self.r1(0);
        self.start_sending();
        Outcome::read(status, Source::Bytes(pattern))
    }

    /// CMD49: SET_TIME - RTC information block follows
    pub(super) fn cmd49_set_time(&mut self) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::SET_TIME);
        }
        let status = self.r1(0);
        self.start_receiving(super::Sink::Rtc);
        Outcome::write(status, super::Sink::Rtc)
    }

    /// CMD53/CMD54: PROTOCOL_RD / PROTOCOL_WR - RPMB through the security
    /// protocol commands
    pub(super) fn cmd53_protocol(&mut self, index: u8, arg: u32) -> Outcome {
        if self.state != state::TRANSFER || arg != rpmb::PROTOCOL_ARG {
            return self.illegal(index);
        }
        let count = self.block_count.take();
        if index == opcode::PROTOCOL_WR {
            let reliable = count.is_some_and(|c| c & block_count_arg::RELIABLE_WRITE != 0);
            let status = self.r1(0);
            let sink = super::Sink::Rpmb { reliable };
            self.start_receiving(sink);
            Outcome::write(status, sink)
        } else {
            self.rpmb_read(count)
        }
    }

    pub(super) fn rpmb_read(&mut self, count: Option<u32>) -> Outcome {
        let blocks = count.map_or(1, |c| c & block_count_arg::BLOCKS_MASK);
        let status = self.r1(0);
        let Some(mmc) = self.mmc.as_mut() else {
            return Outcome::timeout();
        };
        let frames = mmc.rpmb.response(blocks);
        self.start_sending();
        Outcome::read(status, Source::Bytes(frames))
    }

    /// Packed read: data for every entry of the header stored by the
    /// preceding packed write
    pub(super) fn packed_read(&mut self, _count: u32) -> Outcome {
        let Some(entries) = self.mmc.as_mut().and_then(|m| m.packed_reads.take()) else {
            warn!("Packed read without a header");
            return Outcome::refused(self.r1(r1::ERROR));
        };
        let area = self.current_area();
        let mut out = Vec::new();
        for (i, (count, addr)) in entries.iter().enumerate() {
            let blocks = (count & block_count_arg::BLOCKS_MASK) as u64;
            let offset = self.byte_address(*addr);
            let mut buf = vec![0u8; (blocks * BLOCK) as usize];
            let result = match self.storage_mut(area) {
                Some(store) => store.read(offset, &mut buf),
                None => Err(std::io::Error::other("no such area")),
            };
            if result.is_err() {
                if let Some(mmc) = self.mmc.as_mut() {
                    mmc.packed_failed(i + 1);
                }
                buf.fill(0);
            }
            out.extend_from_slice(&buf);
        }
        let status = self.r1(0);
        self.start_sending();
        debug!("Packed read of {} entries", entries.len());
        Outcome::read(status, Source::Bytes(out))
    }

    /// A packed command header (and write payload) arrived on CMD25
    pub(super) fn finish_packed(&mut self, payload: &[u8]) {
        let header = match payload.get(..BLOCK as usize) {
            Some(h) if h[0] == packed::VERSION => h,
            _ => {
                if let Some(mmc) = self.mmc.as_mut() {
                    mmc.packed_failed(0);
                }
                return;
            }
        };
        let kind = header[1];
        let count = header[2] as usize;
        let entries: Vec<(u32, u32)> = (1..=count)
            .filter_map(|i| {
                let at = i * packed::ENTRY_SIZE;
                let entry = header.get(at..at + packed::ENTRY_SIZE)?;
                Some((
                    u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]),
                    u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]),
                ))
            })
            .collect();

        match kind {
            packed::READ => {
                debug!("Packed read header with {} entries", entries.len());
                if let Some(mmc) = self.mmc.as_mut() {
                    mmc.packed_reads = Some(entries);
                }
            }
            packed::WRITE => {
                let area = self.current_area();
                let mut at = BLOCK as usize;
                for (i, (count, addr)) in entries.iter().enumerate() {
                    let blocks = (count & block_count_arg::BLOCKS_MASK) as u64;
                    let offset = self.byte_address(*addr);
                    let len = (blocks * BLOCK) as usize;
                    let data = payload.get(at..at + len);
                    let blocked = self.check_range(area, offset, BLOCK, blocks) != 0
                        || (0..blocks).any(|b| self.block_protected(area, offset / BLOCK + b));
                    let written = match data {
                        Some(data) if !blocked => self
                            .storage_mut(area)
                            .is_some_and(|store| store.write(offset, data).is_ok()),
                        _ => false,
                    };
                    if !written {
                        if let Some(mmc) = self.mmc.as_mut() {
                            mmc.packed_failed(i + 1);
                        }
                        return;
                    }
                    at += len;
                }
                debug!("Packed write of {} entries", entries.len());
            }
            other => {
                warn!("Unknown packed command type {}", other);
                if let Some(mmc) = self.mmc.as_mut() {
                    mmc.packed_failed(0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardKind;

    fn switch_arg(access: u8, index: usize, value: u8) -> u32 {
        (access as u32) << 24 | (index as u32) << 16 | (value as u32) << 8
    }

    fn emmc() -> MmcState {
        MmcState::new(&CardConfig::new(CardKind::Emmc), 64 * 2048)
    }

    #[test]
    fn read_only_fields_reject_switch() {
        let mut m = emmc();
        assert!(m.switch(switch_arg(switch::ACCESS_WRITE_BYTE, ext_csd::SEC_COUNT, 1)).is_err());
        assert!(m.switch(switch_arg(switch::ACCESS_WRITE_BYTE, ext_csd::BUS_WIDTH, 2)).is_ok());
        assert_eq!(m.ext[ext_csd::BUS_WIDTH], 2);
        assert!(m.switch(switch_arg(switch::ACCESS_WRITE_BYTE, ext_csd::BUS_WIDTH, 3)).is_err());
    }

    #[test]
    fn partitioning_is_one_shot() {
        let mut m = emmc();
        m.switch(switch_arg(switch::ACCESS_WRITE_BYTE, ext_csd::GP_SIZE_MULT, 2)).unwrap();
        m.switch(switch_arg(switch::ACCESS_WRITE_BYTE, ext_csd::PARTITION_SETTING_COMPLETED, 1))
            .unwrap();
        assert_eq!(m.area_len(Area::General(1)), 2 * 1024 * BLOCK);
        assert!(m.switch(switch_arg(switch::ACCESS_WRITE_BYTE, ext_csd::GP_SIZE_MULT, 4)).is_err());
        assert!(m.switch(switch_arg(switch::ACCESS_WRITE_BYTE, ext_csd::PARTITION_CONFIG, 4)).is_ok());
        assert_eq!(m.current_area(), Area::General(1));
    }

    #[test]
    fn rpmb_write_needs_matching_counter() {
        let mut rpmb = Rpmb::new(SIZE_UNIT);
        let mut key = response_frame(rpmb::REQ_PROGRAM_KEY, 0);
        key[rpmb::MAC_OFFSET] = 0x42;
        rpmb.request(&key, true);
        assert!(rpmb.key.is_some());

        let mut write = response_frame(rpmb::REQ_WRITE_DATA, 0);
        write[rpmb::WRITE_COUNTER_OFFSET + 3] = 5;
        rpmb.request(&write, true);
        let result = rpmb.last_result.clone().unwrap();
        assert_eq!(be16(&result, rpmb::RESULT_OFFSET), rpmb::RESULT_COUNTER_FAILURE);

        write[rpmb::WRITE_COUNTER_OFFSET + 3] = 0;
        write[rpmb::DATA_OFFSET] = 0xAB;
        rpmb.request(&write, true);
        assert_eq!(rpmb.counter, 1);

        rpmb.request(&response_frame(rpmb::REQ_READ_DATA, 0), false);
        let frames = rpmb.response(1);
        assert_eq!(frames[rpmb::DATA_OFFSET], 0xAB);
        assert_eq!(be16(&frames, rpmb::REQUEST_OFFSET), rpmb::RESP_READ_DATA);
    }

    #[test]
    fn power_cycle_clears_volatile_fields() {
        let mut m = emmc();
        m.ext[ext_csd::HS_TIMING] = 1;
        m.ext[ext_csd::PARTITION_CONFIG] = 0x09;
        m.ext[ext_csd::USER_WP] = ext_csd::US_PWR_WP_EN | ext_csd::US_PERM_WP_EN;
        m.power_cycle();
        assert_eq!(m.ext[ext_csd::HS_TIMING], 0);
        assert_eq!(m.ext[ext_csd::PARTITION_CONFIG], 0x08);
        assert_eq!(m.ext[ext_csd::USER_WP], ext_csd::US_PERM_WP_EN);
    }
}
