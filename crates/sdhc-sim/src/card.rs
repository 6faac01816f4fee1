//! Behavioural model of the card in a simulated slot.
//!
//! The controller model hands every command to [`SimCard::command`] and
//! streams data through [`SimCard::read_data`] and [`SimCard::write_data`].
//! Bus timing is not modelled. A busy card is one that answers CMD13 in the
//! programming state for a configured number of polls.
//!
//! # References
//! - SD Physical Layer Simplified Specification, version 3.01
//! - SDIO Simplified Specification, version 3.00
//! - JEDEC JESD84-B51 (eMMC 5.1)

mod identity;
mod mmc;
mod sdio;

use std::collections::BTreeMap;
use std::io;

use sdhc_hw::card::{
    app_opcode, block_count_arg, erase_arg, esd, ext_csd, go_idle_arg, if_cond, lock, ocr, opcode, r1, sd_switch, state,
    HPI_FLAG,
};
use sdhc_hw::specs::TUNING_BLOCK_4BIT;
use tracing::{debug, info, trace, warn};

use crate::config::{CardConfig, CardKind};
use crate::storage::{FileStore, Storage};

pub use mmc::Area;
use mmc::MmcState;
use sdio::SdioState;

const BLOCK: u64 = 512;

/// Write-protect group types as SEND_WRITE_PROT_TYPE reports them
const WP_TEMPORARY: u8 = 1;
const WP_POWER_ON: u8 = 2;
const WP_PERMANENT: u8 = 3;

/// What goes back on the CMD line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Accepted without a response token (CMD0, CMD4, CMD7 deselect)
    None,
    /// The card stayed silent
    Timeout,
    Short(u32),
    /// R2 image with the CRC byte in bits 7:0
    Long(u128),
}

/// Where read data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Memory { area: Area, offset: u64 },
    Bytes(Vec<u8>),
    Sdio { func: u8, addr: u32, increment: bool },
}

/// Where written data goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Memory { area: Area, offset: u64 },
    Lock,
    Packed,
    Rpmb { reliable: bool },
    Rtc,
    Sdio { func: u8, addr: u32, increment: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPhase {
    None,
    /// The card answered with an error and will not move data
    Refused,
    Read(Source),
    Write(Sink),
}

/// Result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reply: Reply,
    pub data: DataPhase,
}

impl Outcome {
    fn timeout() -> Self {
        Self { reply: Reply::Timeout, data: DataPhase::None }
    }

    fn none() -> Self {
        Self { reply: Reply::None, data: DataPhase::None }
    }

    fn short(value: u32) -> Self {
        Self { reply: Reply::Short(value), data: DataPhase::None }
    }

    fn long(value: u128) -> Self {
        Self { reply: Reply::Long(value), data: DataPhase::None }
    }

    fn refused(value: u32) -> Self {
        Self { reply: Reply::Short(value), data: DataPhase::Refused }
    }

    fn read(value: u32, source: Source) -> Self {
        Self { reply: Reply::Short(value), data: DataPhase::Read(source) }
    }

    fn write(value: u32, sink: Sink) -> Self {
        Self { reply: Reply::Short(value), data: DataPhase::Write(sink) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Sending,
    Receiving(Sink),
}

/// R6: RCA plus the compressed status bits 23, 22, 19 and 12:0
fn r6(rca: u16, status: u32) -> u32 {
    ((rca as u32) << 16) | ((status >> 8) & 0xC000) | ((status >> 6) & 0x2000) | (status & 0x1FFF)
}

fn known_command(index: u8) -> bool {
    matches!(index, 0..=13 | 15..=33 | 35 | 36 | 38 | 42 | 45 | 49 | 52..=56)
}

#[derive(Debug)]
pub struct SimCard {
    config: CardConfig,
    user: Storage,
    user_blocks: u64,
    cid: u128,
    csd: u128,
    scr: [u8; 8],

    // ========================================================================
    // BUS STATE - Reset by power cycles and CMD0
    // ========================================================================
    powered: bool,
    state: u8,
    inactive: bool,
    rca: u16,
    ready_countdown: u32,
    app_cmd: bool,
    in_acmd: bool,
    s18_accepted: bool,
    signal_1v8: bool,
    /// DAT[3:0] held low between CMD11 and the clock restart
    switch_pending: bool,
    bus_width: u8,
    sd_functions: [u8; 6],

    // ========================================================================
    // TRANSFER STATE
    // ========================================================================
    /// Errors reported in the next response, then cleared
    deferred: u32,
    /// CMD13 polls still answered in the programming state
    busy_polls: u32,
    block_len: u32,
    block_count: Option<u32>,
    erase_start: Option<u64>,
    erase_end: Option<u64>,
    written_blocks: u32,
    phase: Phase,
    incoming: Vec<u8>,

    // ========================================================================
    // NON-VOLATILE STATE
    // ========================================================================
    password: Vec<u8>,
    locked: bool,
    /// Write-protect group index to protection type
    wp_groups: BTreeMap<u64, u8>,
    mmc: Option<MmcState>,
    sdio: Option<SdioState>,
}

impl SimCard {
    pub fn new(config: CardConfig) -> io::Result<Self> {
        let kind = config.kind;
        let erased = if kind.is_mmc() { 0x00 } else { 0xFF };
        let (user, user_blocks) = match (&config.image, kind) {
            (_, CardKind::Sdio) => (Storage::ram(0, 0), 0),
            (Some(path), _) => {
                let store = Storage::File(FileStore::open(path, !config.read_only_image)?);
                let blocks = identity::visible_blocks(kind, store.len() / BLOCK);
                if blocks * BLOCK > store.len() {
                    warn!(
                        "Image {} is smaller than the {} blocks the card reports",
                        path.display(),
                        blocks
                    );
                }
                (store, blocks)
            }
            (None, _) => {
                let blocks = identity::visible_blocks(kind, config.capacity_blocks);
                (Storage::ram(blocks * BLOCK, erased), blocks)
            }
        };
        let (cid, csd) = if kind.is_mmc() {
            (identity::mmc_cid(&config), identity::mmc_csd(kind, user_blocks))
        } else if kind.is_sd() {
            (identity::sd_cid(&config), identity::sd_csd(kind, user_blocks))
        } else {
            (0, 0)
        };
        let mmc = (kind == CardKind::Emmc).then(|| MmcState::new(&config, user_blocks));
        let sdio = kind.is_sdio().then(|| SdioState::new(&config));
        info!("Card model: {:?} with {} user blocks", kind, user_blocks);

        Ok(Self {
            scr: identity::scr(&config),
            ready_countdown: config.ready_polls,
            config,
            user,
            user_blocks,
            cid,
            csd,
            powered: false,
            state: state::IDLE,
            inactive: false,
            rca: 0,
            app_cmd: false,
            in_acmd: false,
            s18_accepted: false,
            signal_1v8: false,
            switch_pending: false,
            bus_width: 1,
            sd_functions: [0; 6],
            deferred: 0,
            busy_polls: 0,
            block_len: 512,
            block_count: None,
            erase_start: None,
            erase_end: None,
            written_blocks: 0,
            phase: Phase::Idle,
            incoming: Vec::new(),
            password: Vec::new(),
            locked: false,
            wp_groups: BTreeMap::new(),
            mmc,
            sdio,
        })
    }

    pub fn kind(&self) -> CardKind {
        self.config.kind
    }

    pub fn user_blocks(&self) -> u64 {
        self.user_blocks
    }

    /// Current state as R1 would report it
    pub fn state(&self) -> u8 {
        self.reported_state()
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn signal_1v8(&self) -> bool {
        self.signal_1v8
    }

    /// The card holds DAT[3:0] low during the voltage switch
    pub fn dat_low(&self) -> bool {
        self.switch_pending
    }

    /// Copies bytes out of a memory area without going through the bus
    pub fn peek(&mut self, area: Area, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.storage_mut(area)
            .ok_or_else(|| io::Error::other("no such area"))?
            .read(offset, buf)
    }

    /// Stores bytes into a memory area without going through the bus
    pub fn poke(&mut self, area: Area, offset: u64, data: &[u8]) -> io::Result<()> {
        self.storage_mut(area)
            .ok_or_else(|| io::Error::other("no such area"))?
            .write(offset, data)
    }

    pub fn power_on(&mut self) {
        if self.powered {
            return;
        }
        self.powered = true;
        self.inactive = false;
        self.signal_1v8 = false;
        self.switch_pending = false;
        self.reset_to_idle();
        self.locked = !self.password.is_empty();
        self.wp_groups.retain(|_, kind| *kind != WP_POWER_ON);
        if let Some(mmc) = self.mmc.as_mut() {
            mmc.power_cycle();
        }
        if let Some(sdio) = self.sdio.as_mut() {
            sdio.reset();
        }
        debug!("Card powered on (locked: {})", self.locked);
    }

    pub fn power_off(&mut self) {
        if !self.powered {
            return;
        }
        self.powered = false;
        if let Err(e) = self.user.flush() {
            warn!("Failed to flush card image: {}", e);
        }
        debug!("Card powered off");
    }

    /// Ends the voltage switch once the host restarts the clock at 1.8 V
    pub fn complete_voltage_switch(&mut self) {
        if self.switch_pending {
            self.switch_pending = false;
            self.signal_1v8 = true;
            info!("Card signalling at 1.8 V");
        }
    }

    fn reset_to_idle(&mut self) {
        self.state = state::IDLE;
        self.rca = 0;
        self.ready_countdown = self.config.ready_polls;
        self.app_cmd = false;
        self.s18_accepted = false;
        self.bus_width = 1;
        self.sd_functions = [0; 6];
        self.deferred = 0;
        self.busy_polls = 0;
        self.block_len = 512;
        self.block_count = None;
        self.erase_start = None;
        self.erase_end = None;
        self.phase = Phase::Idle;
        self.incoming.clear();
        if let Some(mmc) = self.mmc.as_mut() {
            mmc.soft_reset();
        }
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    fn reported_state(&self) -> u8 {
        if self.busy_polls > 0 { state::PROGRAM } else { self.state }
    }

    fn status_bits(&self, errors: u32) -> u32 {
        let mut status = errors | self.deferred;
        status |= (self.reported_state() as u32) << r1::CURRENT_STATE_SHIFT;
        if self.busy_polls == 0 {
            status |= r1::READY_FOR_DATA;
        }
        if self.app_cmd || self.in_acmd {
            status |= r1::APP_CMD;
        }
        if self.locked {
            status |= r1::CARD_IS_LOCKED;
        }
        if self.mmc.as_ref().is_some_and(|m| m.exception_pending()) {
            status |= r1::EXCEPTION_EVENT;
        }
        status
    }

    /// R1 for the current command; clears the deferred errors it reports
    fn r1(&mut self, errors: u32) -> u32 {
        let status = self.status_bits(errors);
        self.deferred = 0;
        status
    }

    fn addressed(&self, arg: u32) -> bool {
        self.rca != 0 && (arg >> 16) as u16 == self.rca
    }

    fn illegal(&self, index: u8) -> Outcome {
        debug!("CMD{} illegal in state {}", index, self.state);
        Outcome::timeout()
    }

    fn locked_out(&mut self, index: u8) -> Outcome {
        debug!("CMD{} rejected: card is locked", index);
        Outcome::refused(self.r1(r1::ILLEGAL_COMMAND))
    }

    fn unsupported(&self, index: u8, arg: u32) -> Outcome {
        if known_command(index) {
            debug!("CMD{} not supported by {:?} card", index, self.config.kind);
        } else {
            warn!("Unknown command: CMD{} (arg {:#010X})", index, arg);
        }
        Outcome::timeout()
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Handles one command token and returns what the card sends back
    pub fn command(&mut self, index: u8, arg: u32) -> Outcome {
        if !self.powered || self.inactive {
            return Outcome::timeout();
        }
        if self.state == state::SLEEP && index != opcode::GO_IDLE_STATE && index != opcode::SLEEP_AWAKE {
            debug!("Card asleep, ignoring CMD{}", index);
            return Outcome::timeout();
        }
        if index != opcode::SEND_STATUS && self.busy_polls > 0 {
            trace!("CMD{} ends the busy period", index);
            self.busy_polls = 0;
        }
        trace!("CMD{} arg={:#010X} state={}", index, arg, self.state);

        if std::mem::take(&mut self.app_cmd) {
            self.in_acmd = true;
            let outcome = self.execute_acmd(index, arg);
            self.in_acmd = false;
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
        self.execute_cmd(index, arg)
    }

    fn execute_cmd(&mut self, index: u8, arg: u32) -> Outcome {
        let kind = self.config.kind;
        let memory = !kind.is_sdio();
        match index {
            opcode::GO_IDLE_STATE => self.cmd0_go_idle_state(arg),
            opcode::SEND_OP_COND if kind.is_mmc() => self.cmd1_send_op_cond(arg),
            opcode::ALL_SEND_CID if memory => self.cmd2_all_send_cid(),
            opcode::SET_RELATIVE_ADDR => self.cmd3_set_relative_addr(arg),
            opcode::SET_DSR if self.state == state::STANDBY => Outcome::none(),
            opcode::IO_SEND_OP_COND if kind.is_sdio() => self.cmd5_io_send_op_cond(arg),
            opcode::SLEEP_AWAKE if kind.is_mmc() => self.cmd5_sleep_awake(arg),
            opcode::SWITCH if kind.is_sd() => self.cmd6_switch_func(arg),
            opcode::SWITCH if kind.is_mmc() => self.cmd6_mmc_switch(arg),
            opcode::SELECT_CARD => self.cmd7_select_card(arg),
            opcode::SEND_IF_COND if !kind.is_mmc() => self.cmd8_send_if_cond(arg),
            opcode::SEND_EXT_CSD if kind.is_mmc() => self.cmd8_send_ext_csd(),
            opcode::SEND_CSD if memory => self.cmd9_send_csd(arg),
            opcode::SEND_CID if memory => self.cmd10_send_cid(arg),
            opcode::VOLTAGE_SWITCH if !kind.is_mmc() => self.cmd11_voltage_switch(),
            opcode::STOP_TRANSMISSION => self.cmd12_stop_transmission(arg),
            opcode::SEND_STATUS => self.cmd13_send_status(arg),
            opcode::GO_INACTIVE_STATE => self.cmd15_go_inactive_state(arg),
            opcode::SET_BLOCKLEN if memory => self.cmd16_set_blocklen(arg),
            opcode::READ_SINGLE_BLOCK | opcode::READ_MULTIPLE_BLOCK if memory => {
                self.cmd17_read_block(index, arg)
            }
            opcode::SEND_TUNING_BLOCK if !kind.is_mmc() => self.cmd19_send_tuning_block(),
            opcode::SEND_TUNING_BLOCK_HS200 if kind.is_mmc() => self.cmd21_send_tuning_block(),
            opcode::SET_BLOCK_COUNT if memory => self.cmd23_set_block_count(arg),
            opcode::WRITE_BLOCK | opcode::WRITE_MULTIPLE_BLOCK if memory => self.cmd24_write_block(index, arg),
            opcode::SET_WRITE_PROT | opcode::CLR_WRITE_PROT if memory => {
                self.cmd28_write_prot(index, arg)
            }
            opcode::SEND_WRITE_PROT if memory => self.cmd30_send_write_prot(arg),
            opcode::SEND_WRITE_PROT_TYPE if kind.is_mmc() => self.cmd31_send_write_prot_type(arg),
            opcode::ERASE_WR_BLK_START | opcode::ERASE_WR_BLK_END if kind.is_sd() => {
                self.cmd32_erase_bound(index, arg)
            }
            opcode::ERASE_GROUP_START | opcode::ERASE_GROUP_END if kind.is_mmc() => {
                self.cmd32_erase_bound(index, arg)
            }
            opcode::ERASE if memory => self.cmd38_erase(arg),
            opcode::LOCK_UNLOCK if memory => self.cmd42_lock_unlock(),
            opcode::QUERY_PARTITION if kind.is_sd() && self.config.esd => self.cmd45_query_partition(arg),
            opcode::SET_TIME if self.mmc.is_some() => self.cmd49_set_time(),
            opcode::IO_RW_DIRECT if kind.is_sdio() => self.cmd52_io_rw_direct(arg),
            opcode::IO_RW_EXTENDED if kind.is_sdio() => self.cmd53_io_rw_extended(arg),
            opcode::PROTOCOL_RD | opcode::PROTOCOL_WR if self.mmc.is_some() => self.cmd53_protocol(index, arg),
            opcode::APP_CMD if kind.is_sd() => self.cmd55_app_cmd(arg),
            _ => self.unsupported(index, arg),
        }
    }

    /// Application commands; `None` falls through to the regular command
    /// with the same index
    fn execute_acmd(&mut self, index: u8, arg: u32) -> Option<Outcome> {
        let outcome = match index {
            app_opcode::SET_BUS_WIDTH => self.acmd6_set_bus_width(arg),
            app_opcode::SD_STATUS => self.acmd13_sd_status(),
            app_opcode::SEND_NUM_WR_BLOCKS => self.acmd22_send_num_wr_blocks(),
            app_opcode::SET_WR_BLK_ERASE_COUNT | app_opcode::SET_CLR_CARD_DETECT => self.acmd_acknowledge(index),
            app_opcode::SD_SEND_OP_COND => self.acmd41_sd_send_op_cond(arg),
            app_opcode::SEND_SCR => self.acmd51_send_scr(),
            _ => return None,
        };
        Some(outcome)
    }

    // ========================================================================
    // IDENTIFICATION
    // ========================================================================

    /// CMD0: GO_IDLE_STATE - Reset card to idle state
    fn cmd0_go_idle_state(&mut self, arg: u32) -> Outcome {
        if arg == go_idle_arg::BOOT_INITIATION {
            debug!("Boot initiation ignored");
            return Outcome::none();
        }
        debug!("Card reset to idle (arg {:#X})", arg);
        self.reset_to_idle();
        Outcome::none()
    }

    /// CMD1: SEND_OP_COND - MMC power-up handshake
    fn cmd1_send_op_cond(&mut self, arg: u32) -> Outcome {
        if self.state != state::IDLE {
            return self.illegal(opcode::SEND_OP_COND);
        }
        let mut value = ocr::VDD_WINDOW | ocr::VDD_LOW;
        if self.config.kind.high_capacity() {
            value |= ocr::MMC_ACCESS_SECTOR;
        }
        if arg & (ocr::VDD_WINDOW | ocr::VDD_LOW) == 0 {
            return Outcome::short(value);
        }
        if self.ready_countdown > 0 {
            self.ready_countdown -= 1;
            return Outcome::short(value);
        }
        self.state = state::READY;
        Outcome::short(value | ocr::BUSY)
    }

    /// ACMD41: SD_SEND_OP_COND - SD power-up handshake
    fn acmd41_sd_send_op_cond(&mut self, arg: u32) -> Outcome {
        if self.state != state::IDLE {
            return self.illegal(app_opcode::SD_SEND_OP_COND);
        }
        let mut value = ocr::VDD_WINDOW;
        if arg & ocr::VDD_WINDOW == 0 {
            return Outcome::short(value);
        }
        if self.ready_countdown > 0 {
            self.ready_countdown -= 1;
            return Outcome::short(value);
        }
        let high = self.config.kind.high_capacity();
        if high && arg & ocr::HCS == 0 {
            debug!("High-capacity card stays busy for a host without HCS");
            return Outcome::short(value);
        }
        self.state = state::READY;
        value |= ocr::BUSY;
        if high {
            value |= ocr::CCS;
        }
        if self.config.uhs && arg & ocr::S18 != 0 && !self.signal_1v8 {
            value |= ocr::S18;
            self.s18_accepted = true;
        }
        Outcome::short(value)
    }

    /// CMD2: ALL_SEND_CID
    fn cmd2_all_send_cid(&mut self) -> Outcome {
        if self.state != state::READY {
            return self.illegal(opcode::ALL_SEND_CID);
        }
        self.state = state::IDENT;
        Outcome::long(self.cid)
    }

    /// CMD3: SEND_RELATIVE_ADDR (SD, SDIO) or SET_RELATIVE_ADDR (MMC)
    fn cmd3_set_relative_addr(&mut self, arg: u32) -> Outcome {
        let kind = self.config.kind;
        if kind.is_mmc() {
            if self.state != state::IDENT {
                return self.illegal(opcode::SET_RELATIVE_ADDR);
            }
            let status = self.r1(0);
            self.rca = (arg >> 16) as u16;
            self.state = state::STANDBY;
            debug!("MMC RCA set: {:#06X}", self.rca);
            return Outcome::short(status);
        }
        let allowed = if kind.is_sdio() {
            matches!(self.state, state::READY | state::STANDBY)
        } else {
            matches!(self.state, state::IDENT | state::STANDBY)
        };
        if !allowed {
            return self.illegal(opcode::SET_RELATIVE_ADDR);
        }
        let status = self.r1(0);
        self.rca = ((self.config.serial >> 16) as u16) | 1;
        self.state = state::STANDBY;
        debug!("Published RCA {:#06X}", self.rca);
        Outcome::short(r6(self.rca, status))
    }

    /// CMD7: SELECT/DESELECT_CARD
    fn cmd7_select_card(&mut self, arg: u32) -> Outcome {
        if self.addressed(arg) {
            return match self.state {
                state::STANDBY => {
                    let status = self.r1(0);
                    self.state = state::TRANSFER;
                    debug!("Card selected");
                    Outcome::short(status)
                }
                state::TRANSFER => Outcome::short(self.r1(0)),
                _ => self.illegal(opcode::SELECT_CARD),
            };
        }
        if matches!(self.state, state::TRANSFER | state::DATA | state::RECEIVE) {
            self.finish_data();
            self.state = state::STANDBY;
            debug!("Card deselected");
        }
        Outcome::none()
    }

    /// CMD8: SEND_IF_COND - Check supply voltage and echo the pattern
    fn cmd8_send_if_cond(&mut self, arg: u32) -> Outcome {
        if self.state != state::IDLE {
            return self.illegal(opcode::SEND_IF_COND);
        }
        if arg & if_cond::VOLTAGE_MASK != 0x100 {
            debug!("Unsupported supply voltage in CMD8: {:#X}", arg);
            return Outcome::timeout();
        }
        Outcome::short(arg & 0xFFF)
    }

    /// CMD9: SEND_CSD
    fn cmd9_send_csd(&mut self, arg: u32) -> Outcome {
        if self.state != state::STANDBY || !self.addressed(arg) {
            return self.illegal(opcode::SEND_CSD);
        }
        if self.config.kind.is_sd() {
            return Outcome::long(identity::sd_csd_at(self.csd, self.sd_functions[0]));
        }
        Outcome::long(self.csd)
    }

    /// CMD10: SEND_CID
    fn cmd10_send_cid(&mut self, arg: u32) -> Outcome {
        if self.state != state::STANDBY || !self.addressed(arg) {
            return self.illegal(opcode::SEND_CID);
        }
        Outcome::long(self.cid)
    }

    /// CMD11: VOLTAGE_SWITCH - Start the 1.8 V signalling handshake
    fn cmd11_voltage_switch(&mut self) -> Outcome {
        if !self.s18_accepted || self.state != state::READY {
            return self.illegal(opcode::VOLTAGE_SWITCH);
        }
        let status = self.r1(0);
        self.s18_accepted = false;
        self.switch_pending = true;
        debug!("Voltage switch started, holding DAT[3:0] low");
        Outcome::short(status)
    }

    /// CMD15: GO_INACTIVE_STATE
    fn cmd15_go_inactive_state(&mut self, arg: u32) -> Outcome {
        if self.addressed(arg) {
            info!("Card parked in the inactive state");
            self.inactive = true;
        }
        Outcome::none()
    }

    // ========================================================================
    // STATUS AND CONTROL
    // ========================================================================

    /// CMD12: STOP_TRANSMISSION - End an open-ended transfer
    fn cmd12_stop_transmission(&mut self, arg: u32) -> Outcome {
        if arg & HPI_FLAG != 0 {
            debug!("HPI through CMD12");
        }
        // Errors found during the data phase stay for the next CMD13
        let status = self.status_bits(0);
        self.finish_data();
        Outcome::short(status)
    }

    /// CMD13: SEND_STATUS - Report card status; with the HPI flag it also
    /// interrupts a busy card
    fn cmd13_send_status(&mut self, arg: u32) -> Outcome {
        if !self.addressed(arg) || self.state < state::STANDBY {
            return self.illegal(opcode::SEND_STATUS);
        }
        if arg & HPI_FLAG != 0 && self.busy_polls > 0 && self.mmc.as_ref().is_some_and(|m| m.hpi_enabled()) {
            info!("HPI interrupted the busy period");
            self.busy_polls = 0;
        }
        let status = self.r1(0);
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
        }
        Outcome::short(status)
    }

    /// CMD16: SET_BLOCKLEN - Length for byte-addressed transfers and CMD42
    fn cmd16_set_blocklen(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::SET_BLOCKLEN);
        }
        if arg == 0 || arg > 2048 {
            return Outcome::short(self.r1(r1::BLOCK_LEN_ERROR));
        }
        let status = self.r1(0);
        self.block_len = arg;
        debug!("Block length set: {}", arg);
        Outcome::short(status)
    }

    /// CMD23: SET_BLOCK_COUNT - Count for the next CMD18/CMD25, plus the
    /// eMMC reliable-write and packed flags
    fn cmd23_set_block_count(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::SET_BLOCK_COUNT);
        }
        if self.config.kind.is_sd() && !self.config.cmd23 {
            return self.unsupported(opcode::SET_BLOCK_COUNT, arg);
        }
        let status = self.r1(0);
        if arg & block_count_arg::PACKED != 0 {
            if let Some(mmc) = self.mmc.as_mut() {
                mmc.clear_packed_status();
            }
        }
        self.block_count = Some(arg);
        Outcome::short(status)
    }

    /// CMD55: APP_CMD - The next command is application specific
    fn cmd55_app_cmd(&mut self, arg: u32) -> Outcome {
        if self.state != state::IDLE && self.state != state::READY && !self.addressed(arg) {
            return self.illegal(opcode::APP_CMD);
        }
        self.app_cmd = true;
        Outcome::short(self.r1(0))
    }

    /// ACMD6: SET_BUS_WIDTH
    fn acmd6_set_bus_width(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(app_opcode::SET_BUS_WIDTH);
        }
        let width = match arg & 0x3 {
            0 => 1,
            2 => 4,
            _ => return Outcome::short(self.r1(r1::ERROR)),
        };
        let status = self.r1(0);
        self.bus_width = width;
        debug!("SD bus width set: {}", width);
        Outcome::short(status)
    }

    /// ACMD13: SD_STATUS - 64-byte status block
    fn acmd13_sd_status(&mut self) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(app_opcode::SD_STATUS);
        }
        let mut raw = vec![0u8; 64];
        raw[0] = if self.bus_width == 4 { 0x80 } else { 0x00 };
        // Speed class 10, 4 MiB allocation unit, one AU per erase
        raw[8] = 4;
        raw[10] = 0x90;
        raw[11..13].copy_from_slice(&1u16.to_be_bytes());
        raw[13] = (5 << 2) | 1;
        if self.signal_1v8 {
            raw[14] = 0x19;
        }
        let status = self.r1(0);
        self.start_sending();
        Outcome::read(status, Source::Bytes(raw))
    }

    /// ACMD22: SEND_NUM_WR_BLOCKS - Blocks written by the last write
    fn acmd22_send_num_wr_blocks(&mut self) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(app_opcode::SEND_NUM_WR_BLOCKS);
        }
        let status = self.r1(0);
        let count = self.written_blocks;
        self.start_sending();
        Outcome::read(status, Source::Bytes(count.to_be_bytes().to_vec()))
    }

    fn acmd_acknowledge(&mut self, index: u8) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(index);
        }
        Outcome::short(self.r1(0))
    }

    /// ACMD51: SEND_SCR
    fn acmd51_send_scr(&mut self) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(app_opcode::SEND_SCR);
        }
        let status = self.r1(0);
        self.start_sending();
        Outcome::read(status, Source::Bytes(self.scr.to_vec()))
    }

    /// CMD6: SWITCH_FUNC - Query or select SD bus functions
    fn cmd6_switch_func(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::SWITCH);
        }
        let set = arg & sd_switch::MODE_SWITCH != 0;
        let mut results = [0u8; 6];
        let mut accepted = true;
        for group in 1..=6u8 {
            let slot = group as usize - 1;
            let request = ((arg >> (slot * 4)) & 0xF) as u8;
            results[slot] = if request == sd_switch::KEEP {
                self.sd_functions[slot]
            } else if identity::switch_support(group, self.signal_1v8) & (1 << request) != 0 {
                request
            } else {
                accepted = false;
                0xF
            };
        }
        let status = self.r1(0);
        if set && accepted {
            self.sd_functions = results;
            debug!("SD functions selected: {:?}", results);
        }
        self.start_sending();
        Outcome::read(status, Source::Bytes(identity::switch_status(&results, self.signal_1v8)))
    }

    /// CMD19: SEND_TUNING_BLOCK - SD tuning pattern, 1.8 V signalling only
    fn cmd19_send_tuning_block(&mut self) -> Outcome {
        if self.state != state::TRANSFER || !self.signal_1v8 {
            return self.illegal(opcode::SEND_TUNING_BLOCK);
        }
        let status = self.r1(0);
        self.start_sending();
        Outcome::read(status, Source::Bytes(TUNING_BLOCK_4BIT.to_vec()))
    }

    // ========================================================================
    // MEMORY ACCESS
    // ========================================================================

    fn current_area(&self) -> Area {
        self.mmc.as_ref().map_or(Area::User, |m| m.current_area())
    }

    fn area_len(&self, area: Area) -> u64 {
        match area {
            Area::User => self.user_blocks * BLOCK,
            _ => self.mmc.as_ref().map_or(0, |m| m.area_len(area)),
        }
    }

    fn storage_mut(&mut self, area: Area) -> Option<&mut Storage> {
        match area {
            Area::User => Some(&mut self.user),
            _ => self.mmc.as_mut()?.storage(area),
        }
    }

    /// Byte offset of a data command argument
    fn byte_address(&self, arg: u32) -> u64 {
        if self.config.kind.high_capacity() {
            arg as u64 * BLOCK
        } else {
            arg as u64
        }
    }

    /// Bytes per block of a CMD17/CMD24 transfer
    fn transfer_len(&self) -> u64 {
        if self.config.kind.high_capacity() {
            BLOCK
        } else {
            self.block_len as u64
        }
    }

    fn erased_byte(&self) -> u8 {
        if self.config.kind.is_mmc() { 0x00 } else { 0xFF }
    }

    /// Error bits for a transfer of `blocks` blocks of `len` bytes at `offset`
    fn check_range(&self, area: Area, offset: u64, len: u64, blocks: u64) -> u32 {
        let end = self.area_len(area);
        if offset >= end || offset + len * blocks.max(1) > end {
            return r1::OUT_OF_RANGE;
        }
        if self.config.kind.high_capacity() {
            return 0;
        }
        if len > BLOCK || (len < BLOCK && self.config.kind != CardKind::Sdsc) {
            return r1::BLOCK_LEN_ERROR;
        }
        if offset % BLOCK + len > BLOCK {
            return r1::ADDRESS_ERROR;
        }
        0
    }

    fn block_protected(&self, area: Area, block: u64) -> bool {
        match area {
            Area::User => self.wp_groups.contains_key(&(block / self.wp_group_blocks())),
            Area::Boot(_) => self.mmc.as_ref().is_some_and(|m| m.boot_protected()),
            _ => false,
        }
    }

    fn erase_group_blocks(&self) -> u64 {
        match &self.mmc {
            Some(m) if m.ext[ext_csd::ERASE_GROUP_DEF] & 1 != 0 => {
                m.ext[ext_csd::HC_ERASE_GRP_SIZE].max(1) as u64 * 1024
            }
            _ if self.config.kind.is_mmc() => 32 * 32,
            _ => 128,
        }
    }

    fn wp_group_blocks(&self) -> u64 {
        match &self.mmc {
            Some(m) if m.ext[ext_csd::ERASE_GROUP_DEF] & 1 != 0 => {
                self.erase_group_blocks() * m.ext[ext_csd::HC_WP_GRP_SIZE].max(1) as u64
            }
            // WP_GRP_SIZE is zero in every CSD the model builds
            _ => self.erase_group_blocks(),
        }
    }

    fn group_protection_supported(&self) -> bool {
        self.config.kind == CardKind::Sdsc || self.config.kind.is_mmc()
    }

    fn start_sending(&mut self) {
        self.state = state::DATA;
        self.phase = Phase::Sending;
    }

    fn start_receiving(&mut self, sink: Sink) {
        self.state = state::RECEIVE;
        self.phase = Phase::Receiving(sink);
        self.incoming.clear();
    }

    /// CMD17/CMD18: READ_SINGLE_BLOCK / READ_MULTIPLE_BLOCK
    fn cmd17_read_block(&mut self, index: u8, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(index);
        }
        if self.locked {
            return self.locked_out(index);
        }
        let count = self.block_count.take();
        let area = self.current_area();
        if area == Area::Rpmb {
            return self.rpmb_read(count);
        }
        if let Some(c) = count.filter(|c| c & block_count_arg::PACKED != 0) {
            return self.packed_read(c);
        }
        let offset = self.byte_address(arg);
        let len = self.transfer_len();
        let blocks = match (index, count) {
            (opcode::READ_MULTIPLE_BLOCK, Some(c)) => (c & block_count_arg::BLOCKS_MASK) as u64,
            _ => 1,
        };
        let errors = self.check_range(area, offset, len, blocks);
        if errors != 0 {
            debug!("Read at {:#X} rejected: {:#010X}", offset, errors);
            return Outcome::refused(self.r1(errors));
        }
        let status = self.r1(0);
        self.start_sending();
        trace!("Read from {:?} at {:#X}", area, offset);
        Outcome::read(status, Source::Memory { area, offset })
    }

    /// CMD24/CMD25: WRITE_BLOCK / WRITE_MULTIPLE_BLOCK
    fn cmd24_write_block(&mut self, index: u8, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(index);
        }
        if self.locked {
            return self.locked_out(index);
        }
        let count = self.block_count.take();
        let area = self.current_area();
        if area == Area::Rpmb {
            let reliable = count.is_some_and(|c| c & block_count_arg::RELIABLE_WRITE != 0);
            let status = self.r1(0);
            self.start_receiving(Sink::Rpmb { reliable });
            return Outcome::write(status, Sink::Rpmb { reliable });
        }
        if count.is_some_and(|c| c & block_count_arg::PACKED != 0) && self.mmc.is_some() {
            let status = self.r1(0);
            self.start_receiving(Sink::Packed);
            return Outcome::write(status, Sink::Packed);
        }
        let offset = self.byte_address(arg);
        let len = self.transfer_len();
        let blocks = match (index, count) {
            (opcode::WRITE_MULTIPLE_BLOCK, Some(c)) => (c & block_count_arg::BLOCKS_MASK) as u64,
            _ => 1,
        };
        let mut errors = self.check_range(area, offset, len, blocks);
        if errors == 0 && self.block_protected(area, offset / BLOCK) {
            errors = r1::WP_VIOLATION;
        }
        if errors != 0 {
            debug!("Write at {:#X} rejected: {:#010X}", offset, errors);
            return Outcome::refused(self.r1(errors));
        }
        let status = self.r1(0);
        let sink = Sink::Memory { area, offset };
        self.written_blocks = 0;
        self.start_receiving(sink);
        trace!("Write to {:?} at {:#X}", area, offset);
        Outcome::write(status, sink)
    }

    /// Fills `buf` with data the card sends, `offset` bytes into the
    /// current data phase
    pub fn read_data(&mut self, source: &Source, offset: u64, buf: &mut [u8]) {
        match source {
            Source::Memory { area, offset: base } => {
                let at = base + offset;
                let result = match self.storage_mut(*area) {
                    Some(store) => store.read(at, buf),
                    None => Err(io::Error::other("no such area")),
                };
                if let Err(e) = result {
                    warn!("Failed to read card memory at {:#X}: {}", at, e);
                    buf.fill(0);
                    self.deferred |= r1::OUT_OF_RANGE;
                }
            }
            Source::Bytes(bytes) => {
                buf.fill(0);
                let start = (offset as usize).min(bytes.len());
                let n = (bytes.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&bytes[start..start + n]);
            }
            Source::Sdio { func, addr, increment } => self.sdio_read(*func, *addr, *increment, offset, buf),
        }
    }

    /// Accepts data the host sends, `offset` bytes into the current data
    /// phase
    pub fn write_data(&mut self, sink: &Sink, offset: u64, data: &[u8]) {
        match *sink {
            Sink::Memory { area, offset: base } => self.write_memory(area, base + offset, data),
            Sink::Sdio { func, addr, increment } => self.sdio_write(func, addr, increment, offset, data),
            _ => self.incoming.extend_from_slice(data),
        }
    }

    fn write_memory(&mut self, area: Area, at: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let pos = at + done as u64;
            let n = ((BLOCK - pos % BLOCK) as usize).min(data.len() - done);
            if self.block_protected(area, pos / BLOCK) {
                debug!("Write to protected block {} dropped", pos / BLOCK);
                self.deferred |= r1::WP_VIOLATION;
            } else {
                let chunk = &data[done..done + n];
                let result = match self.storage_mut(area) {
                    Some(store) => store.write(pos, chunk),
                    None => Err(io::Error::other("no such area")),
                };
                match result {
                    Ok(()) if (pos + n as u64) % BLOCK == 0 => self.written_blocks += 1,
                    Ok(()) => {}
                    Err(e) => {
                        warn!("Failed to write card memory at {:#X}: {}", pos, e);
                        self.deferred |= r1::OUT_OF_RANGE;
                    }
                }
            }
            done += n;
        }
    }

    /// The controller moved every block of the current data phase
    pub fn end_data(&mut self) {
        self.finish_data();
    }

    fn finish_data(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Sending => {
                if self.state == state::DATA {
                    self.state = state::TRANSFER;
                }
            }
            Phase::Receiving(sink) => {
                let data = std::mem::take(&mut self.incoming);
                match sink {
                    Sink::Lock => self.apply_lock(&data),
                    Sink::Packed => self.finish_packed(&data),
                    Sink::Rpmb { reliable } => {
                        if let Some(mmc) = self.mmc.as_mut() {
                            mmc.rpmb_request(&data, reliable);
                        }
                    }
                    Sink::Rtc => {
                        if let Some(mmc) = self.mmc.as_mut() {
                            mmc.store_rtc(data);
                        }
                    }
                    Sink::Memory { .. } | Sink::Sdio { .. } => {}
                }
                if self.state == state::RECEIVE {
                    self.state = state::TRANSFER;
                }
                if !matches!(sink, Sink::Sdio { .. }) {
                    self.busy_polls = self.config.program_polls;
                }
            }
        }
    }

    // ========================================================================
    // ERASE AND WRITE PROTECTION
    // ========================================================================

    /// CMD32/CMD33 (SD) and CMD35/CMD36 (MMC): erase range bounds
    fn cmd32_erase_bound(&mut self, index: u8, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(index);
        }
        if self.locked {
            return self.locked_out(index);
        }
        let start = matches!(index, opcode::ERASE_WR_BLK_START | opcode::ERASE_GROUP_START);
        let area = self.current_area();
        if area == Area::Rpmb {
            return self.illegal(index);
        }
        let block = self.byte_address(arg) / BLOCK;
        if block >= self.area_len(area) / BLOCK {
            self.erase_start = None;
            self.erase_end = None;
            return Outcome::refused(self.r1(r1::OUT_OF_RANGE));
        }
        if !start && self.erase_start.is_none() {
            return Outcome::refused(self.r1(r1::ERASE_SEQ_ERROR));
        }
        let status = self.r1(0);
        if start {
            self.erase_start = Some(block);
            self.erase_end = None;
        } else {
            self.erase_end = Some(block);
        }
        Outcome::short(status)
    }

    /// CMD38: ERASE - Erase, trim or discard the latched range
    fn cmd38_erase(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::ERASE);
        }
        if self.locked {
            return self.locked_out(opcode::ERASE);
        }
        let (Some(start), Some(end)) = (self.erase_start.take(), self.erase_end.take()) else {
            return Outcome::refused(self.r1(r1::ERASE_SEQ_ERROR));
        };
        if end < start {
            return Outcome::refused(self.r1(r1::ERASE_PARAM));
        }
        let area = self.current_area();
        let limit = self.area_len(area) / BLOCK;
        let group = self.erase_group_blocks();
        let widen = |s: u64, e: u64| (s / group * group, ((e / group + 1) * group).min(limit));
        let mut ranges = Vec::new();
        if self.config.kind.is_sd() {
            ranges.push((start, end + 1));
        } else {
            let secure_ok = self.mmc.as_ref().is_some_and(|m| m.secure_erase_supported());
            match arg {
                erase_arg::ERASE => ranges.push(widen(start, end)),
                erase_arg::TRIM | erase_arg::DISCARD => ranges.push((start, end + 1)),
                erase_arg::SECURE_ERASE if secure_ok => ranges.push(widen(start, end)),
                erase_arg::SECURE_TRIM1 if secure_ok => {
                    if let Some(mmc) = self.mmc.as_mut() {
                        mmc.mark_trim(area, start, end + 1);
                    }
                }
                erase_arg::SECURE_TRIM2 if secure_ok => {
                    if let Some(mmc) = self.mmc.as_mut() {
                        ranges.extend(mmc.take_trim_marks(area));
                    }
                }
                _ => {
                    warn!("Unsupported erase argument {:#010X}", arg);
                    return Outcome::refused(self.r1(r1::ERASE_PARAM));
                }
            }
        }
        let status = self.r1(0);
        for (first, last) in ranges {
            self.erase_blocks(area, first, last);
        }
        self.busy_polls = self.config.program_polls;
        Outcome::short(status)
    }

    fn erase_blocks(&mut self, area: Area, first: u64, last: u64) {
        let fill = self.erased_byte();
        let group = self.wp_group_blocks();
        let mut at = first;
        while at < last {
            let next = ((at / group + 1) * group).min(last);
            if self.block_protected(area, at) {
                debug!("Erase skipped protected blocks {}..{}", at, next);
                self.deferred |= r1::WP_ERASE_SKIP;
            } else if let Some(store) = self.storage_mut(area) {
                if let Err(e) = store.fill(at * BLOCK, (next - at) * BLOCK, fill) {
                    warn!("Failed to erase blocks {}..{}: {}", at, next, e);
                }
            }
            at = next;
        }
        debug!("Erased blocks {}..{} in {:?}", first, last, area);
    }

    /// CMD28/CMD29: SET_WRITE_PROT / CLR_WRITE_PROT
    fn cmd28_write_prot(&mut self, index: u8, arg: u32) -> Outcome {
        if self.state != state::TRANSFER || !self.group_protection_supported() {
            return self.illegal(index);
        }
        if self.locked {
            return self.locked_out(index);
        }
        let block = self.byte_address(arg) / BLOCK;
        if block >= self.user_blocks {
            return Outcome::refused(self.r1(r1::OUT_OF_RANGE));
        }
        let group = block / self.wp_group_blocks();
        if index == opcode::SET_WRITE_PROT {
            let kind = self.mmc.as_ref().map_or(WP_TEMPORARY, |m| m.user_wp_kind());
            let status = self.r1(0);
            let entry = self.wp_groups.entry(group).or_insert(kind);
            *entry = (*entry).max(kind);
            debug!("Write-protect group {} set (type {})", group, kind);
            self.busy_polls = self.config.program_polls;
            Outcome::short(status)
        } else {
            if self.wp_groups.get(&group).is_some_and(|k| *k != WP_TEMPORARY) {
                return Outcome::refused(self.r1(r1::WP_VIOLATION));
            }
            let status = self.r1(0);
            self.wp_groups.remove(&group);
            debug!("Write-protect group {} cleared", group);
            self.busy_polls = self.config.program_polls;
            Outcome::short(status)
        }
    }

    /// CMD30: SEND_WRITE_PROT - One bit per group, 32 groups
    fn cmd30_send_write_prot(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER || !self.group_protection_supported() {
            return self.illegal(opcode::SEND_WRITE_PROT);
        }
        let first = self.byte_address(arg) / BLOCK / self.wp_group_blocks();
        let bits = (0..32u64)
            .filter(|g| self.wp_groups.contains_key(&(first + g)))
            .fold(0u32, |acc, g| acc | 1 << g);
        let status = self.r1(0);
        self.start_sending();
        Outcome::read(status, Source::Bytes(bits.to_be_bytes().to_vec()))
    }

    /// CMD31: SEND_WRITE_PROT_TYPE - Two bits per group, 32 groups
    fn cmd31_send_write_prot_type(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::SEND_WRITE_PROT_TYPE);
        }
        let first = self.byte_address(arg) / BLOCK / self.wp_group_blocks();
        let bits = (0..32u64).fold(0u64, |acc, g| {
            let kind = self.wp_groups.get(&(first + g)).copied().unwrap_or(0) as u64;
            acc | kind << (2 * g)
        });
        let status = self.r1(0);
        self.start_sending();
        Outcome::read(status, Source::Bytes(bits.to_be_bytes().to_vec()))
    }

    /// CMD45: QUERY_PARTITION - Embedded SD attribute blocks. The device
    /// holds a single partition, the user area.
    fn cmd45_query_partition(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::QUERY_PARTITION);
        }
        let subcommand = (arg >> esd::SUBCOMMAND_SHIFT) as u8;
        let partition = (arg >> esd::PARTITION_SHIFT) as u8;
        let mut block = vec![0u8; esd::RESPONSE_SIZE];
        match subcommand {
            esd::QUERY_DEVICE_ATTRIBUTES => {
                block[esd::DEVICE_VERSION] = 1;
                block[esd::DEVICE_PARTITIONS] = 1;
            }
            esd::QUERY_PARTITION_ATTRIBUTES if partition == 0 => {
                block[esd::PARTITION_TYPE] = 1;
                let blocks = self.user_blocks() as u32;
                block[esd::PARTITION_BLOCKS..esd::PARTITION_BLOCKS + 4].copy_from_slice(&blocks.to_le_bytes());
            }
            esd::QUERY_PARTITION_ATTRIBUTES => {
                debug!("Query of missing partition {}", partition);
                return Outcome::refused(self.r1(r1::OUT_OF_RANGE));
            }
            other => {
                debug!("Unknown partition query {:#X}", other);
                return self.illegal(opcode::QUERY_PARTITION);
            }
        }
        let status = self.r1(0);
        self.start_sending();
        Outcome::read(status, Source::Bytes(block))
    }

    // ========================================================================
    // PASSWORD LOCK
    // ========================================================================

    /// CMD42: LOCK_UNLOCK - Password management; the data block follows
    fn cmd42_lock_unlock(&mut self) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::LOCK_UNLOCK);
        }
        let status = self.r1(0);
        self.start_receiving(Sink::Lock);
        Outcome::write(status, Sink::Lock)
    }

    fn lock_failed(&mut self, why: &str) {
        warn!("Lock/unlock rejected: {}", why);
        self.deferred |= r1::LOCK_UNLOCK_FAILED;
    }

    fn apply_lock(&mut self, block: &[u8]) {
        let block = &block[..block.len().min(self.block_len as usize)];
        let Some(&flags) = block.first() else {
            return self.lock_failed("empty data block");
        };
        if flags & lock::ERASE != 0 {
            if flags != lock::ERASE || !self.locked {
                return self.lock_failed("forced erase needs a locked card");
            }
            info!("Forced erase: wiping the card and removing the password");
            let fill = self.erased_byte();
            let len = self.user.len();
            if let Err(e) = self.user.fill(0, len, fill) {
                warn!("Forced erase failed: {}", e);
            }
            self.password.clear();
            self.locked = false;
            self.wp_groups.retain(|_, kind| *kind == WP_PERMANENT);
            return;
        }

        let len = block.get(1).copied().unwrap_or(0) as usize;
        let Some(pwd) = block.get(2..2 + len) else {
            return self.lock_failed("password length past the data block");
        };
        match flags & (lock::SET_PWD | lock::CLR_PWD | lock::LOCK_UNLOCK) {
            f if f & lock::SET_PWD != 0 && f & lock::CLR_PWD == 0 => {
                let Some(new) = pwd.strip_prefix(self.password.as_slice()) else {
                    return self.lock_failed("old password mismatch");
                };
                if new.is_empty() || new.len() > lock::MAX_PASSWORD {
                    return self.lock_failed("new password length");
                }
                self.password = new.to_vec();
                if f & lock::LOCK_UNLOCK != 0 {
                    self.locked = true;
                }
                debug!("Password set (locked: {})", self.locked);
            }
            lock::CLR_PWD => {
                if self.password.is_empty() || pwd != self.password.as_slice() {
                    return self.lock_failed("password mismatch on clear");
                }
                self.password.clear();
                self.locked = false;
                debug!("Password cleared");
            }
            lock::LOCK_UNLOCK => {
                if self.password.is_empty() || pwd != self.password.as_slice() {
                    return self.lock_failed("password mismatch on lock");
                }
                self.locked = true;
                debug!("Card locked");
            }
            0 => {
                if self.password.is_empty() || pwd != self.password.as_slice() {
                    return self.lock_failed("password mismatch on unlock");
                }
                self.locked = false;
                debug!("Card unlocked");
            }
            _ => self.lock_failed("conflicting flags"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_sd(kind: CardKind) -> SimCard {
        let mut config = CardConfig::new(kind).capacity_blocks(64 * 1024);
        config.ready_polls = 0;
        let mut card = SimCard::new(config).unwrap();
        card.power_on();
        assert_eq!(card.command(8, 0x1AA).reply, Reply::Short(0x1AA));
        card.command(55, 0);
        let r = card.command(41, ocr::VDD_WINDOW | ocr::HCS);
        assert!(matches!(r.reply, Reply::Short(v) if v & ocr::BUSY != 0));
        assert!(matches!(card.command(2, 0).reply, Reply::Long(_)));
        let Reply::Short(r6) = card.command(3, 0).reply else { panic!("no R6") };
        let rca = r6 >> 16;
        card.command(7, rca << 16);
        assert_eq!(card.state, state::TRANSFER);
        card
    }

    fn rca_arg(card: &SimCard) -> u32 {
        (card.rca as u32) << 16
    }

    #[test]
    fn identification_reaches_transfer_state() {
        let card = ready_sd(CardKind::Sdhc);
        assert_ne!(card.rca, 0);
        assert!(!card.signal_1v8);
    }

    #[test]
    fn write_then_read_back() {
        let mut card = ready_sd(CardKind::Sdhc);
        let out = card.command(24, 5);
        let DataPhase::Write(sink) = out.data else { panic!("no write phase") };
        card.write_data(&sink, 0, &[0xA5; 512]);
        card.end_data();
        assert_eq!(card.state(), state::PROGRAM);

        let status = card.command(13, rca_arg(&card));
        assert!(matches!(status.reply, Reply::Short(s) if (s & r1::CURRENT_STATE_MASK) >> 9 == state::PROGRAM as u32));
        let status = card.command(13, rca_arg(&card));
        assert!(matches!(status.reply, Reply::Short(s) if s & r1::READY_FOR_DATA != 0));

        let out = card.command(17, 5);
        let DataPhase::Read(source) = out.data else { panic!("no read phase") };
        let mut buf = [0u8; 512];
        card.read_data(&source, 0, &mut buf);
        card.end_data();
        assert_eq!(buf, [0xA5; 512]);
    }

    #[test]
    fn read_past_end_reports_out_of_range() {
        let mut card = ready_sd(CardKind::Sdhc);
        let blocks = card.user_blocks() as u32;
        let out = card.command(17, blocks);
        assert_eq!(out.data, DataPhase::Refused);
        assert!(matches!(out.reply, Reply::Short(s) if s & r1::OUT_OF_RANGE != 0));
    }

    #[test]
    fn unlock_with_wrong_password_fails_on_next_status() {
        let mut card = ready_sd(CardKind::Sdhc);
        card.command(16, 6);
        let DataPhase::Write(sink) = card.command(42, 0).data else { panic!() };
        card.write_data(&sink, 0, &[lock::SET_PWD | lock::LOCK_UNLOCK, 4, b'a', b'b', b'c', b'd']);
        card.end_data();
        assert!(card.locked());

        let DataPhase::Write(sink) = card.command(42, 0).data else { panic!() };
        card.write_data(&sink, 0, &[0, 4, b'x', b'x', b'x', b'x']);
        card.end_data();
        let Reply::Short(s) = card.command(13, rca_arg(&card)).reply else { panic!() };
        assert_ne!(s & r1::LOCK_UNLOCK_FAILED, 0);
        assert_ne!(s & r1::CARD_IS_LOCKED, 0);
        assert_eq!(card.command(17, 0).data, DataPhase::Refused);
    }

    #[test]
    fn protected_group_skips_erase() {
        let mut card = ready_sd(CardKind::Sdsc);
        card.poke(Area::User, 0, &[1; 512]).unwrap();
        card.poke(Area::User, 130 * 512, &[1; 512]).unwrap();
        card.command(28, 0);
        card.command(32, 0);
        card.command(33, 200 * 512);
        card.command(38, 0);
        let Reply::Short(s) = card.command(13, rca_arg(&card)).reply else { panic!() };
        assert_ne!(s & r1::WP_ERASE_SKIP, 0);
        let mut buf = [0u8; 512];
        card.peek(Area::User, 0, &mut buf).unwrap();
        assert_eq!(buf, [1; 512]);
        card.peek(Area::User, 130 * 512, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 512]);
    }

    #[test]
    fn app_cmd_flag_shows_in_response() {
        let mut card = ready_sd(CardKind::Sdhc);
        let Reply::Short(s) = card.command(55, rca_arg(&card)).reply else { panic!() };
        assert_ne!(s & r1::APP_CMD, 0);
        let out = card.command(51, 0);
        assert!(matches!(out.data, DataPhase::Read(Source::Bytes(ref b)) if b.len() == 8));
    }
}
