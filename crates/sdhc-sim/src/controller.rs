//! SDHC 3.0 register file for one simulated slot.
//!
//! The driver sees this through [`sdhc::RegisterBlock`]. Writing the upper
//! byte of the command register runs the command against the card right
//! away; data then moves through the buffer port (PIO) or straight between
//! the card and mapped memory (SDMA, ADMA2). Status bits latch into the
//! interrupt status register and, when signal-enabled, the IRQ line closure
//! installed with [`SimController::connect_irq`] is called after the
//! register lock has been released.
//!
//! # References
//! - SD Host Controller Simplified Specification, version 3.00

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sdhc::dma::{AdmaAction, AdmaDescriptor};
use sdhc::RegisterBlock;
use sdhc_hw::card::opcode;
use sdhc_hw::mmio::sdhc::{
    adma2, adma_error, auto_cmd_status, clock, command, host_control, host_control2, int_status, power,
    present_state, registers as reg, reset, transfer_mode,
};
use tracing::{debug, info, trace, warn};

use crate::card::{DataPhase, Reply, SimCard, Sink, Source};
use crate::config::{CardConfig, ControllerCaps, SimConfig};
use crate::dma::SimDma;
use crate::faults::{Fault, FaultKind, FaultPlan, Stage};

/// Handler rounds per delivery before a stuck line is given up on
const IRQ_DISPATCH_LIMIT: usize = 8;
/// Descriptors one ADMA2 run may fetch; guards against link loops
const ADMA_DESCRIPTOR_LIMIT: usize = 4096;
const COMMAND_LOG_DEPTH: usize = 4096;

/// ADMA error states as reported in ADMA_ERROR bits 1:0
const ADMA_ST_FDS: u8 = 1;
const ADMA_ST_TFR: u8 = 3;

type IrqLine = Arc<dyn Fn() + Send + Sync>;

/// Plain register contents; computed registers live in [`Inner`]
#[derive(Debug, Default)]
struct Registers {
    dma_address: u32,      // 0x00
    block_size: u16,       // 0x04
    block_count: u16,      // 0x06
    argument: u32,         // 0x08
    transfer_mode: u16,    // 0x0C
    command: u16,          // 0x0E
    response: [u32; 4],    // 0x10-0x1C
    host_control: u8,      // 0x28
    power_control: u8,     // 0x29
    block_gap: u8,         // 0x2A
    wakeup: u8,            // 0x2B
    clock_control: u16,    // 0x2C
    timeout_control: u8,   // 0x2E
    int_status: u32,       // 0x30 (normal) / 0x32 (error)
    int_enable: u32,       // 0x34 / 0x36
    signal_enable: u32,    // 0x38 / 0x3A
    auto_cmd_status: u16,  // 0x3C
    host_control2: u16,    // 0x3E
    adma_error: u8,        // 0x54
    adma_address: u32,     // 0x58
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    Pio,
    Sdma,
    Adma2,
}

#[derive(Debug)]
enum Flow {
    Read(Source),
    Write(Sink),
}

/// The data phase in progress
#[derive(Debug)]
struct Transfer {
    opcode: u8,
    flow: Flow,
    engine: Engine,
    block_size: usize,
    /// Blocks before the phase ends; `None` runs until CMD12
    target: Option<u32>,
    multi: bool,
    auto_cmd12: bool,
    tuning: bool,
    blocks_done: u32,
    /// Bytes moved so far
    moved: u64,
    /// PIO block buffer
    fifo: Vec<u8>,
    fifo_pos: usize,
    /// A read block sits in the buffer
    fifo_full: bool,
    sdma_address: u32,
    sdma_paused: bool,
}

impl Transfer {
    fn finished(&self) -> bool {
        self.target.is_some_and(|t| self.blocks_done >= t)
    }

    fn expected_bytes(&self) -> Option<u64> {
        self.target.map(|t| t as u64 * self.block_size as u64)
    }
}

struct Inner {
    regs: Registers,
    caps: ControllerCaps,
    card: Option<SimCard>,
    dma: Arc<SimDma>,
    transfer: Option<Transfer>,
    faults: FaultPlan,
    /// A swallowed command keeps the CMD line busy until a CMD reset
    cmd_inhibit: bool,
    write_protect_switch: bool,
    retune_pending: bool,
    tuning_blocks: u32,
    tuning_seen: u32,
    tuning_runs: u32,
    card_irq_level: bool,
    /// Commands written while the lines they need were still busy
    collisions: u32,
    log: VecDeque<(u8, u32)>,
}

impl Inner {
    // ========================================================================
    // INTERRUPTS
    // ========================================================================

    fn raise(&mut self, bits: u32) {
        let latched = bits & self.regs.int_enable;
        if latched != bits {
            trace!("Masked interrupt bits {:#X}", bits & !latched);
        }
        self.regs.int_status |= latched;
    }

    /// Status as read, with the error summary bit
    fn status_view(&self) -> u32 {
        let mut status = self.regs.int_status;
        if status & 0xFFFF_0000 != 0 {
            status |= int_status::ERROR;
        }
        status
    }

    fn line_asserted(&self) -> bool {
        self.regs.int_status & self.regs.signal_enable != 0
    }

    /// Latches CARD_INTERRUPT on a rising DAT1 interrupt from an SDIO card
    fn poll_card_interrupt(&mut self) {
        let level = self.card.as_ref().is_some_and(SimCard::sdio_interrupt_asserted);
        if level && !self.card_irq_level {
            trace!("SDIO card interrupt asserted");
            self.raise(int_status::CARD_INTERRUPT);
        }
        self.card_irq_level = level;
    }

    // ========================================================================
    // REGISTER ACCESS
    // ========================================================================

    fn present_state(&self) -> u32 {
        let mut present = present_state::CMD_LEVEL | present_state::CARD_STABLE;
        if self.cmd_inhibit {
            present |= present_state::CMD_INHIBIT;
        }
        if let Some(x) = &self.transfer {
            present |= present_state::DATA_INHIBIT | present_state::DATA_ACTIVE;
            match x.flow {
                Flow::Read(_) => {
                    present |= present_state::READ_ACTIVE;
                    if x.engine == Engine::Pio && x.fifo_full {
                        present |= present_state::BUFFER_READ_ENABLE;
                    }
                }
                Flow::Write(_) => {
                    present |= present_state::WRITE_ACTIVE;
                    if x.engine == Engine::Pio {
                        present |= present_state::BUFFER_WRITE_ENABLE;
                    }
                }
            }
        }
        if self.retune_pending {
            present |= present_state::RETUNING_REQUEST;
        }
        if let Some(card) = &self.card {
            present |= present_state::CARD_INSERTED | present_state::CARD_DETECT_LEVEL;
            if !card.dat_low() {
                present |= present_state::DAT_LEVEL_MASK;
            }
        } else {
            present |= present_state::DAT_LEVEL_MASK;
        }
        if !self.write_protect_switch {
            present |= present_state::WRITE_PROTECT_LEVEL;
        }
        present
    }

    fn read(&mut self, offset: u32, size: usize) -> u32 {
        let value = match offset {
            reg::DMA_ADDRESS => self.regs.dma_address,
            reg::BLOCK_SIZE => self.regs.block_size as u32 | (self.regs.block_count as u32) << 16,
            reg::BLOCK_COUNT => self.regs.block_count as u32,
            reg::ARGUMENT => self.regs.argument,
            reg::TRANSFER_MODE => self.regs.transfer_mode as u32 | (self.regs.command as u32) << 16,
            reg::COMMAND => self.regs.command as u32,
            reg::RESPONSE0 => self.regs.response[0],
            reg::RESPONSE1 => self.regs.response[1],
            reg::RESPONSE2 => self.regs.response[2],
            reg::RESPONSE3 => self.regs.response[3],
            reg::BUFFER => self.read_buffer(),
            reg::PRESENT_STATE => self.present_state(),
            reg::HOST_CONTROL => u32::from_le_bytes([
                self.regs.host_control,
                self.regs.power_control,
                self.regs.block_gap,
                self.regs.wakeup,
            ]),
            reg::POWER_CONTROL => self.regs.power_control as u32,
            reg::BLOCK_GAP_CONTROL => self.regs.block_gap as u32,
            reg::WAKEUP_CONTROL => self.regs.wakeup as u32,
            reg::CLOCK_CONTROL => {
                let mut clk = self.regs.clock_control;
                if clk & clock::INTERNAL_ENABLE != 0 {
                    clk |= clock::INTERNAL_STABLE;
                }
                clk as u32 | (self.regs.timeout_control as u32) << 16
            }
            reg::TIMEOUT_CONTROL => self.regs.timeout_control as u32,
            // Resets complete immediately
            reg::SOFTWARE_RESET => 0,
            reg::INT_STATUS => self.status_view(),
            reg::ERR_STATUS => self.regs.int_status >> 16,
            reg::INT_ENABLE => self.regs.int_enable,
            reg::ERR_ENABLE => self.regs.int_enable >> 16,
            reg::SIGNAL_ENABLE => self.regs.signal_enable,
            reg::ERR_SIGNAL_ENABLE => self.regs.signal_enable >> 16,
            reg::AUTO_CMD_STATUS => self.regs.auto_cmd_status as u32 | (self.regs.host_control2 as u32) << 16,
            reg::HOST_CONTROL2 => self.regs.host_control2 as u32,
            reg::CAPABILITIES => self.caps.capabilities(),
            reg::CAPABILITIES_1 => self.caps.capabilities_1(),
            reg::MAX_CURRENT => self.caps.max_current(),
            reg::ADMA_ERROR => self.regs.adma_error as u32,
            reg::ADMA_ADDRESS => self.regs.adma_address,
            reg::SLOT_INT_STATUS => {
                let slot = self.line_asserted() as u32;
                slot | (self.caps.host_version() as u32) << 16
            }
            reg::HOST_VERSION => self.caps.host_version() as u32,
            _ => {
                warn!("Unknown SDHC register read: offset={:#X}", offset);
                0
            }
        };
        let value = match size {
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            _ => value,
        };
        trace!("SDHC register read: offset={:#X}, size={}, value={:#X}", offset, size, value);
        value
    }

    fn write(&mut self, offset: u32, size: usize, value: u32) {
        trace!("SDHC register write: offset={:#X}, size={}, value={:#X}", offset, size, value);
        match offset {
            reg::DMA_ADDRESS => {
                self.regs.dma_address = value;
                self.resume_sdma(value);
            }
            reg::BLOCK_SIZE => {
                self.regs.block_size = value as u16;
                if size == 4 {
                    self.regs.block_count = (value >> 16) as u16;
                }
            }
            reg::BLOCK_COUNT => self.regs.block_count = value as u16,
            reg::ARGUMENT => self.regs.argument = value,
            reg::TRANSFER_MODE => {
                self.regs.transfer_mode = value as u16;
                if size == 4 {
                    self.regs.command = (value >> 16) as u16;
                    self.issue_command();
                }
            }
            reg::COMMAND => {
                self.regs.command = value as u16;
                self.issue_command();
            }
            reg::BUFFER => self.write_buffer(value),
            reg::HOST_CONTROL => {
                self.set_host_control(value as u8);
                if size >= 2 {
                    self.set_power_control((value >> 8) as u8);
                }
            }
            reg::POWER_CONTROL => self.set_power_control(value as u8),
            reg::BLOCK_GAP_CONTROL => self.regs.block_gap = value as u8,
            reg::WAKEUP_CONTROL => self.regs.wakeup = value as u8,
            reg::CLOCK_CONTROL => {
                self.set_clock_control(value as u16);
                if size == 4 {
                    self.regs.timeout_control = (value >> 16) as u8;
                    self.software_reset((value >> 24) as u8);
                }
            }
            reg::TIMEOUT_CONTROL => self.regs.timeout_control = value as u8,
            reg::SOFTWARE_RESET => self.software_reset(value as u8),
            reg::INT_STATUS => {
                let mask = if size == 4 { value } else { value & 0xFFFF };
                self.regs.int_status &= !mask;
            }
            reg::ERR_STATUS => self.regs.int_status &= !((value & 0xFFFF) << 16),
            reg::INT_ENABLE => {
                let enable = if size == 4 {
                    value
                } else {
                    (self.regs.int_enable & 0xFFFF_0000) | (value & 0xFFFF)
                };
                self.set_int_enable(enable);
            }
            reg::ERR_ENABLE => {
                let enable = (self.regs.int_enable & 0xFFFF) | (value & 0xFFFF) << 16;
                self.set_int_enable(enable);
            }
            reg::SIGNAL_ENABLE => {
                self.regs.signal_enable = if size == 4 {
                    value
                } else {
                    (self.regs.signal_enable & 0xFFFF_0000) | (value & 0xFFFF)
                };
            }
            reg::ERR_SIGNAL_ENABLE => {
                self.regs.signal_enable = (self.regs.signal_enable & 0xFFFF) | (value & 0xFFFF) << 16;
            }
            reg::HOST_CONTROL2 => self.set_host_control2(value as u16),
            reg::ADMA_ADDRESS => self.regs.adma_address = value,
            reg::AUTO_CMD_STATUS | reg::CAPABILITIES | reg::CAPABILITIES_1 | reg::MAX_CURRENT | reg::ADMA_ERROR
            | reg::PRESENT_STATE | reg::HOST_VERSION | reg::SLOT_INT_STATUS => {
                debug!("Write to read-only SDHC register {:#X} ignored", offset);
            }
            _ => {
                warn!("Unknown SDHC register write: offset={:#X}, value={:#X}", offset, value);
            }
        }
    }

    fn set_int_enable(&mut self, enable: u32) {
        let newly = enable & !self.regs.int_enable;
        self.regs.int_enable = enable;
        // Status bits only latch while enabled
        self.regs.int_status &= enable;
        if newly & int_status::CARD_INTERRUPT != 0 && self.card_irq_level {
            self.regs.int_status |= int_status::CARD_INTERRUPT;
        }
    }

    fn set_host_control(&mut self, value: u8) {
        if value & host_control::DMA_MASK != self.regs.host_control & host_control::DMA_MASK {
            debug!("DMA select: {:#X}", value & host_control::DMA_MASK);
        }
        self.regs.host_control = value;
    }

    fn set_power_control(&mut self, value: u8) {
        let was_on = self.regs.power_control & power::BUS_POWER_ON != 0;
        let on = value & power::BUS_POWER_ON != 0;
        self.regs.power_control = value;
        if on == was_on {
            return;
        }
        if on {
            info!("Bus power on (select {:#X})", value & power::VOLTAGE_MASK);
            if let Some(card) = self.card.as_mut() {
                card.power_on();
            }
        } else {
            info!("Bus power off");
            self.power_down();
        }
    }

    fn power_down(&mut self) {
        self.transfer = None;
        self.card_irq_level = false;
        if let Some(card) = self.card.as_mut() {
            card.power_off();
        }
    }

    fn set_clock_control(&mut self, value: u16) {
        self.regs.clock_control = value & !clock::INTERNAL_STABLE;
        let running = value & clock::SD_CLOCK_ENABLE != 0;
        let at_1v8 = self.regs.host_control2 & host_control2::SIGNALING_1V8 != 0;
        if !(running && at_1v8) || !self.card.as_ref().is_some_and(SimCard::dat_low) {
            return;
        }
        if self.faults.take(Stage::VoltageSwitch, opcode::VOLTAGE_SWITCH).is_some() {
            warn!("Card keeps DAT[3:0] low after the clock restarted at 1.8 V");
            return;
        }
        if let Some(card) = self.card.as_mut() {
            card.complete_voltage_switch();
        }
    }

    fn set_host_control2(&mut self, mut value: u16) {
        if value & host_control2::SIGNALING_1V8 != 0 && !self.caps.voltage_1v8 {
            debug!("1.8 V signalling requested on a 3.3 V-only controller");
            value &= !host_control2::SIGNALING_1V8;
        }
        let old = self.regs.host_control2;
        if value & host_control2::EXECUTE_TUNING != 0 && old & host_control2::EXECUTE_TUNING == 0 {
            debug!("Tuning started");
            self.tuning_seen = 0;
        }
        if (value ^ old) & host_control2::UHS_MASK != 0 {
            debug!("UHS mode select: {}", value & host_control2::UHS_MASK);
        }
        self.regs.host_control2 = value;
    }

    fn software_reset(&mut self, flags: u8) {
        if flags == 0 {
            return;
        }
        if flags & reset::ALL != 0 {
            debug!("Software reset: all");
            let powered = self.regs.power_control & power::BUS_POWER_ON != 0;
            self.regs = Registers::default();
            self.cmd_inhibit = false;
            self.retune_pending = false;
            self.tuning_seen = 0;
            if powered {
                self.power_down();
            }
            return;
        }
        if flags & reset::CMD_LINE != 0 {
            debug!("Software reset: CMD line");
            self.cmd_inhibit = false;
        }
        if flags & reset::DATA_LINE != 0 {
            debug!("Software reset: DAT line");
            self.abandon_transfer();
        }
    }

    // ========================================================================
    // COMMAND PATH
    // ========================================================================

    fn log_command(&mut self, index: u8, arg: u32) {
        if self.log.len() == COMMAND_LOG_DEPTH {
            self.log.pop_front();
        }
        self.log.push_back((index, arg));
    }

    fn issue_command(&mut self) {
        let word = self.regs.command;
        let index = ((word >> command::INDEX_SHIFT) & command::INDEX_MASK) as u8;
        let arg = self.regs.argument;
        let data = word & command::DATA_PRESENT != 0;
        let abort = word & command::TYPE_MASK == command::TYPE_ABORT;
        let busy = word & command::RESP_MASK == command::RESP_SHORT_BUSY;
        debug!("SDHC command: CMD{} arg={:#010X} data={} abort={}", index, arg, data, abort);

        if self.cmd_inhibit {
            warn!("CMD{} written while the CMD line is busy; dropped", index);
            self.collisions += 1;
            return;
        }
        if data && !abort && self.transfer.is_some() {
            warn!("CMD{} written while the DAT lines are busy; dropped", index);
            self.collisions += 1;
            return;
        }
        if self.card.is_none() {
            self.raise(int_status::COMMAND_TIMEOUT);
            return;
        }
        if let Some(kind) = self.faults.take(Stage::Command, index) {
            let bit = match kind {
                FaultKind::Stall => {
                    self.cmd_inhibit = true;
                    return;
                }
                FaultKind::CommandCrc => int_status::COMMAND_CRC,
                FaultKind::CommandEndBit => int_status::COMMAND_END_BIT,
                FaultKind::CommandIndex => int_status::COMMAND_INDEX,
                _ => int_status::COMMAND_TIMEOUT,
            };
            self.raise(bit);
            return;
        }
        if data && self.regs.transfer_mode & transfer_mode::AUTO_CMD23 != 0 && !self.auto_cmd23() {
            return;
        }

        self.log_command(index, arg);
        let Some(card) = self.card.as_mut() else {
            return;
        };
        let outcome = card.command(index, arg);
        self.poll_card_interrupt();
        match outcome.reply {
            Reply::Timeout => {
                trace!("CMD{}: no response", index);
                self.raise(int_status::COMMAND_TIMEOUT);
                return;
            }
            Reply::None => {}
            Reply::Short(value) => self.regs.response[0] = value,
            Reply::Long(value) => {
                // The CRC byte is not stored
                let stored = value >> 8;
                for (i, word) in self.regs.response.iter_mut().enumerate() {
                    *word = (stored >> (32 * i)) as u32;
                }
            }
        }
        if (abort || index == opcode::STOP_TRANSMISSION) && self.transfer.take().is_some() {
            debug!("Data phase stopped by CMD{}", index);
        }
        self.raise(int_status::COMMAND_COMPLETE);

        if data {
            self.start_data(index, outcome.data);
            return;
        }
        if matches!(outcome.data, DataPhase::Read(_) | DataPhase::Write(_)) {
            warn!("CMD{} opened a data phase without DATA_PRESENT; discarded", index);
            if let Some(card) = self.card.as_mut() {
                card.end_data();
            }
        }
        if busy {
            self.raise(int_status::TRANSFER_COMPLETE);
        }
    }

    /// CMD23 ahead of the data command; false when it failed
    fn auto_cmd23(&mut self) -> bool {
        let count = self.regs.dma_address;
        if self.faults.take(Stage::AutoCmd, opcode::SET_BLOCK_COUNT).is_some() {
            self.regs.auto_cmd_status = auto_cmd_status::TIMEOUT;
            self.raise(int_status::AUTO_CMD);
            return false;
        }
        self.log_command(opcode::SET_BLOCK_COUNT, count);
        let reply = self
            .card
            .as_mut()
            .map_or(Reply::Timeout, |c| c.command(opcode::SET_BLOCK_COUNT, count).reply);
        if reply == Reply::Timeout {
            debug!("Auto CMD23 ({:#X}) got no response", count);
            self.regs.auto_cmd_status = auto_cmd_status::TIMEOUT;
            self.raise(int_status::AUTO_CMD);
            return false;
        }
        self.regs.auto_cmd_status = 0;
        true
    }

    /// Auto CMD12 after the last block; its response lands in RESPONSE3
    fn auto_cmd12(&mut self) -> bool {
        if self.faults.take(Stage::AutoCmd, opcode::STOP_TRANSMISSION).is_some() {
            self.regs.auto_cmd_status = auto_cmd_status::TIMEOUT;
            self.raise(int_status::AUTO_CMD);
            return false;
        }
        self.log_command(opcode::STOP_TRANSMISSION, 0);
        let reply = self
            .card
            .as_mut()
            .map_or(Reply::Timeout, |c| c.command(opcode::STOP_TRANSMISSION, 0).reply);
        match reply {
            Reply::Short(value) => {
                self.regs.response[3] = value;
                self.regs.auto_cmd_status = 0;
                true
            }
            _ => {
                self.regs.auto_cmd_status = auto_cmd_status::TIMEOUT;
                self.raise(int_status::AUTO_CMD);
                false
            }
        }
    }

    // ========================================================================
    // DATA PATH
    // ========================================================================

    fn start_data(&mut self, index: u8, phase: DataPhase) {
        let flow = match phase {
            DataPhase::Refused => {
                debug!("CMD{}: card refused the data phase", index);
                return;
            }
            DataPhase::None => {
                debug!("CMD{}: card sent no data", index);
                self.raise(int_status::DATA_TIMEOUT);
                return;
            }
            DataPhase::Read(source) => Flow::Read(source),
            DataPhase::Write(sink) => Flow::Write(sink),
        };
        let mode = self.regs.transfer_mode;
        let multi = mode & transfer_mode::MULTI_BLOCK != 0;
        let count_enabled = mode & transfer_mode::BLOCK_COUNT_ENABLE != 0;
        let block_size = (self.regs.block_size & 0x0FFF) as usize;
        let tuning = self.regs.host_control2 & host_control2::EXECUTE_TUNING != 0
            && (index == opcode::SEND_TUNING_BLOCK || index == opcode::SEND_TUNING_BLOCK_HS200);

        if let Some(kind) = self.faults.take(Stage::Data, index) {
            let bit = match kind {
                FaultKind::DataCrc => int_status::DATA_CRC,
                FaultKind::DataEndBit => int_status::DATA_END_BIT,
                FaultKind::Adma => {
                    self.regs.adma_error = ADMA_ST_FDS;
                    int_status::ADMA
                }
                _ => int_status::DATA_TIMEOUT,
            };
            self.raise(bit);
            if !multi {
                if let Some(card) = self.card.as_mut() {
                    card.end_data();
                }
            }
            return;
        }

        let mut engine = if mode & transfer_mode::DMA_ENABLE == 0 {
            Engine::Pio
        } else {
            match self.regs.host_control & host_control::DMA_MASK {
                host_control::DMA_SDMA => Engine::Sdma,
                host_control::DMA_ADMA2_32 => Engine::Adma2,
                other => {
                    warn!("Unsupported DMA select {:#X}, falling back to PIO", other);
                    Engine::Pio
                }
            }
        };
        let target = match (multi, count_enabled) {
            (false, _) => Some(1),
            (true, true) => Some(self.regs.block_count as u32),
            (true, false) if engine != Engine::Pio => {
                warn!("DMA without a block count; treating it as a counted transfer");
                Some((self.regs.block_count as u32).max(1))
            }
            (true, false) => None,
        };
        if block_size == 0 || target == Some(0) {
            warn!("CMD{}: empty data phase (block size {}, count {:?})", index, block_size, target);
            engine = Engine::Pio;
        }

        trace!(
            "Data phase: CMD{} engine={:?} block={} target={:?}",
            index, engine, block_size, target
        );
        self.transfer = Some(Transfer {
            opcode: index,
            flow,
            engine,
            block_size,
            target,
            multi,
            auto_cmd12: multi && count_enabled && mode & transfer_mode::AUTO_CMD12 != 0,
            tuning,
            blocks_done: 0,
            moved: 0,
            fifo: Vec::with_capacity(block_size),
            fifo_pos: 0,
            fifo_full: false,
            sdma_address: self.regs.dma_address,
            sdma_paused: false,
        });
        if block_size == 0 || target == Some(0) {
            self.complete_transfer();
            return;
        }
        match engine {
            Engine::Pio => self.pio_next_block(),
            Engine::Sdma => self.run_sdma(),
            Engine::Adma2 => self.run_adma(),
        }
    }

    /// Readies the buffer port for the next block
    fn pio_next_block(&mut self) {
        let Some(x) = self.transfer.as_mut() else {
            return;
        };
        match &x.flow {
            Flow::Read(source) => {
                x.fifo.clear();
                x.fifo.resize(x.block_size, 0);
                if let Some(card) = self.card.as_mut() {
                    card.read_data(source, x.moved, &mut x.fifo);
                }
                x.fifo_pos = 0;
                x.fifo_full = true;
                self.raise(int_status::BUFFER_READ_READY);
            }
            Flow::Write(_) => {
                x.fifo.clear();
                self.raise(int_status::BUFFER_WRITE_READY);
            }
        }
    }

    fn read_buffer(&mut self) -> u32 {
        let Some(x) = self.transfer.as_mut() else {
            warn!("Buffer read with no data phase");
            return 0;
        };
        if x.engine != Engine::Pio || !x.fifo_full {
            warn!("Buffer read while the buffer is not ready");
            return 0;
        }
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            if let Some(b) = x.fifo.get(x.fifo_pos + i) {
                *byte = *b;
            }
        }
        x.fifo_pos += 4;
        if x.fifo_pos >= x.block_size {
            x.fifo_full = false;
            x.blocks_done += 1;
            x.moved += x.block_size as u64;
            if x.finished() {
                self.complete_transfer();
            } else {
                self.pio_next_block();
            }
        }
        u32::from_le_bytes(word)
    }

    fn write_buffer(&mut self, value: u32) {
        let Some(x) = self.transfer.as_mut() else {
            warn!("Buffer write with no data phase");
            return;
        };
        let Flow::Write(sink) = x.flow else {
            warn!("Buffer write during a read");
            return;
        };
        if x.engine != Engine::Pio {
            warn!("Buffer write during a DMA transfer");
            return;
        }
        let room = x.block_size - x.fifo.len();
        x.fifo.extend_from_slice(&value.to_le_bytes()[..room.min(4)]);
        if x.fifo.len() < x.block_size {
            return;
        }
        if let Some(card) = self.card.as_mut() {
            card.write_data(&sink, x.moved, &x.fifo);
        }
        x.blocks_done += 1;
        x.moved += x.block_size as u64;
        if x.finished() {
            self.complete_transfer();
        } else {
            self.pio_next_block();
        }
    }

    /// Moves `len` bytes between the card and bus address `bus`
    fn dma_move(&mut self, bus: u32, len: usize) -> bool {
        let Some(x) = self.transfer.as_mut() else {
            return false;
        };
        let Some(card) = self.card.as_mut() else {
            return false;
        };
        let mut chunk = vec![0u8; len];
        let result = match &x.flow {
            Flow::Read(source) => {
                card.read_data(source, x.moved, &mut chunk);
                self.dma.write(bus, &chunk)
            }
            Flow::Write(sink) => self.dma.read(bus, &mut chunk).map(|()| card.write_data(sink, x.moved, &chunk)),
        };
        if let Err(fault) = result {
            warn!("DMA bus fault at {:#X} (+{})", fault.address, fault.len);
            return false;
        }
        x.moved += len as u64;
        x.blocks_done = (x.moved / x.block_size as u64) as u32;
        true
    }

    fn sdma_boundary(&self) -> u32 {
        4096 << ((self.regs.block_size >> 12) & 0x7)
    }

    fn run_sdma(&mut self) {
        let boundary = self.sdma_boundary();
        loop {
            let Some(x) = self.transfer.as_ref() else {
                return;
            };
            if x.finished() {
                self.complete_transfer();
                return;
            }
            let bus = x.sdma_address;
            let expected = x.expected_bytes().unwrap_or(x.block_size as u64);
            let to_boundary = (boundary - bus % boundary) as u64;
            let len = (expected - x.moved).min(to_boundary) as usize;
            if !self.dma_move(bus, len) {
                self.fail_data(int_status::DATA_TIMEOUT);
                return;
            }
            let Some(x) = self.transfer.as_mut() else {
                return;
            };
            x.sdma_address = bus.wrapping_add(len as u32);
            if !x.finished() && x.sdma_address % boundary == 0 {
                trace!("SDMA paused at boundary {:#X}", x.sdma_address);
                x.sdma_paused = true;
                self.raise(int_status::DMA_INTERRUPT);
                return;
            }
        }
    }

    fn resume_sdma(&mut self, address: u32) {
        let Some(x) = self.transfer.as_mut() else {
            return;
        };
        if x.engine != Engine::Sdma || !x.sdma_paused {
            return;
        }
        x.sdma_paused = false;
        x.sdma_address = address;
        self.run_sdma();
    }

    fn run_adma(&mut self) {
        let mut address = self.regs.adma_address;
        for _ in 0..ADMA_DESCRIPTOR_LIMIT {
            let mut raw = [0u8; adma2::DESCRIPTOR_SIZE];
            if self.dma.read(address, &mut raw).is_err() {
                warn!("ADMA descriptor fetch fault at {:#X}", address);
                self.fail_adma(ADMA_ST_FDS, false);
                return;
            }
            self.regs.adma_address = address;
            let desc = AdmaDescriptor::from_le_bytes(raw);
            trace!("ADMA descriptor at {:#X}: {:?}", address, desc);
            if !desc.is_valid() {
                self.fail_adma(ADMA_ST_FDS, false);
                return;
            }
            address = address.wrapping_add(adma2::DESCRIPTOR_SIZE as u32);
            match desc.action() {
                AdmaAction::Nop | AdmaAction::Reserved => {}
                AdmaAction::Link => address = desc.address(),
                AdmaAction::Transfer => {
                    let Some(x) = self.transfer.as_ref() else {
                        return;
                    };
                    let expected = x.expected_bytes().unwrap_or(0);
                    if x.moved + desc.length() as u64 > expected {
                        self.fail_adma(ADMA_ST_TFR, true);
                        return;
                    }
                    if !self.dma_move(desc.address(), desc.length()) {
                        self.fail_adma(ADMA_ST_TFR, false);
                        return;
                    }
                }
            }
            if desc.raises_interrupt() {
                self.raise(int_status::DMA_INTERRUPT);
            }
            if desc.is_end() {
                let done = self.transfer.as_ref().is_some_and(Transfer::finished);
                if done {
                    self.complete_transfer();
                } else {
                    self.fail_adma(ADMA_ST_TFR, true);
                }
                return;
            }
        }
        warn!("ADMA chain longer than {} descriptors", ADMA_DESCRIPTOR_LIMIT);
        self.fail_adma(ADMA_ST_FDS, false);
    }

    fn fail_adma(&mut self, state: u8, length_mismatch: bool) {
        let mut status = state & adma_error::STATE_MASK;
        if length_mismatch {
            status |= adma_error::LENGTH_MISMATCH;
        }
        self.regs.adma_error = status;
        self.fail_data(int_status::ADMA);
    }

    fn fail_data(&mut self, bit: u32) {
        self.raise(bit);
        self.abandon_transfer();
    }

    /// Drops the data phase; a single-block phase also ends on the card
    fn abandon_transfer(&mut self) {
        let Some(x) = self.transfer.take() else {
            return;
        };
        debug!("Data phase of CMD{} abandoned after {} bytes", x.opcode, x.moved);
        if !x.multi {
            if let Some(card) = self.card.as_mut() {
                card.end_data();
            }
        }
    }

    fn complete_transfer(&mut self) {
        let Some(x) = self.transfer.take() else {
            return;
        };
        trace!("Data phase of CMD{} done: {} blocks", x.opcode, x.blocks_done);
        if x.tuning {
            if let Some(card) = self.card.as_mut() {
                card.end_data();
            }
            self.tuning_block_done(x.opcode);
            return;
        }
        if x.auto_cmd12 {
            if !self.auto_cmd12() {
                return;
            }
        } else if let Some(card) = self.card.as_mut() {
            card.end_data();
        }
        self.raise(int_status::TRANSFER_COMPLETE);
    }

    fn tuning_block_done(&mut self, index: u8) {
        self.tuning_seen += 1;
        if self.regs.host_control2 & host_control2::EXECUTE_TUNING == 0 || self.tuning_seen < self.tuning_blocks {
            return;
        }
        let mut ctrl2 = self.regs.host_control2 & !host_control2::EXECUTE_TUNING;
        if self.faults.take(Stage::Tuning, index).is_some() {
            warn!("Tuning found no sampling point");
            ctrl2 &= !host_control2::SAMPLING_CLOCK_SELECT;
        } else {
            ctrl2 |= host_control2::SAMPLING_CLOCK_SELECT;
            self.retune_pending = false;
            self.tuning_runs += 1;
            debug!("Tuning settled after {} blocks", self.tuning_seen);
        }
        self.regs.host_control2 = ctrl2;
    }
}

/// The simulated controller behind one slot
pub struct SimController {
    inner: Mutex<Inner>,
    dma: Arc<SimDma>,
    irq: Mutex<Option<IrqLine>>,
    dispatching: AtomicBool,
}

impl SimController {
    pub fn new(config: &SimConfig, dma: Arc<SimDma>) -> io::Result<Self> {
        let card = config.card.clone().map(SimCard::new).transpose()?;
        let inner = Inner {
            regs: Registers::default(),
            caps: config.caps.clone(),
            card,
            dma: Arc::clone(&dma),
            transfer: None,
            faults: FaultPlan::default(),
            cmd_inhibit: false,
            write_protect_switch: config.write_protect_switch,
            retune_pending: false,
            tuning_blocks: config.tuning_blocks.max(1),
            tuning_seen: 0,
            tuning_runs: 0,
            card_irq_level: false,
            collisions: 0,
            log: VecDeque::new(),
        };
        Ok(Self {
            inner: Mutex::new(inner),
            dma,
            irq: Mutex::new(None),
            dispatching: AtomicBool::new(false),
        })
    }

    /// Installs the interrupt line; called whenever a signal-enabled status
    /// bit is pending
    pub fn connect_irq(&self, line: impl Fn() + Send + Sync + 'static) {
        *self.irq.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(line));
    }

    pub fn dma(&self) -> &Arc<SimDma> {
        &self.dma
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` under the register lock, then services the IRQ line
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let result = {
            let mut inner = self.lock();
            f(&mut inner)
        };
        self.deliver();
        result
    }

    /// Calls the IRQ line while it stays asserted. Nested calls from inside
    /// the handler return at once; the outer loop picks up their status.
    fn deliver(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            let line = self.irq.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let mut rounds = 0;
            if let Some(line) = &line {
                while rounds < IRQ_DISPATCH_LIMIT && self.lock().line_asserted() {
                    line();
                    rounds += 1;
                }
            }
            self.dispatching.store(false, Ordering::Release);
            if line.is_none() || rounds == IRQ_DISPATCH_LIMIT || !self.lock().line_asserted() {
                if rounds == IRQ_DISPATCH_LIMIT {
                    warn!("IRQ line still asserted after {} handler runs", IRQ_DISPATCH_LIMIT);
                }
                return;
            }
        }
    }

    pub fn card_present(&self) -> bool {
        self.lock().card.is_some()
    }

    /// Inserts a new card built from `config`
    pub fn insert_card(&self, config: CardConfig) -> io::Result<()> {
        let card = SimCard::new(config)?;
        self.insert(card);
        Ok(())
    }

    /// Puts `card` into the slot, replacing any card already there
    pub fn insert(&self, mut card: SimCard) {
        self.with_inner(|inner| {
            if inner.regs.power_control & power::BUS_POWER_ON != 0 {
                card.power_on();
            }
            info!("Card inserted: {:?}", card.kind());
            inner.card = Some(card);
            inner.card_irq_level = false;
            inner.raise(int_status::CARD_INSERTION);
        });
    }

    /// Pulls the card out of the slot
    pub fn remove_card(&self) -> Option<SimCard> {
        self.with_inner(|inner| {
            let mut card = inner.card.take()?;
            inner.transfer = None;
            inner.cmd_inhibit = false;
            inner.card_irq_level = false;
            card.power_off();
            info!("Card removed: {:?}", card.kind());
            inner.raise(int_status::CARD_REMOVAL);
            Some(card)
        })
    }

    /// Runs `f` on the card in the slot
    pub fn with_card<R>(&self, f: impl FnOnce(&mut SimCard) -> R) -> Option<R> {
        self.with_inner(|inner| {
            let result = inner.card.as_mut().map(f);
            inner.poll_card_interrupt();
            result
        })
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Faults that have triggered so far
    pub fn faults_fired(&self) -> u32 {
        self.lock().faults.fired()
    }

    /// Raises the re-tuning event, as the controller does when its sampling
    /// point drifts
    pub fn request_retune(&self) {
        self.with_inner(|inner| {
            debug!("Re-tuning requested");
            inner.retune_pending = true;
            inner.raise(int_status::RETUNING_EVENT);
        });
    }

    /// Completed tuning runs
    pub fn tuning_runs(&self) -> u32 {
        self.lock().tuning_runs
    }

    /// Raises an SDIO function interrupt; true when the card drives DAT1
    pub fn raise_function_interrupt(&self, func: u8) -> bool {
        self.with_inner(|inner| {
            let asserted = inner.card.as_mut().is_some_and(|c| c.raise_sdio_interrupt(func));
            inner.poll_card_interrupt();
            asserted
        })
    }

    pub fn clear_function_interrupt(&self, func: u8) {
        self.with_inner(|inner| {
            if let Some(card) = inner.card.as_mut() {
                card.clear_sdio_interrupt(func);
            }
            inner.poll_card_interrupt();
        });
    }

    pub fn set_write_protect_switch(&self, on: bool) {
        self.lock().write_protect_switch = on;
    }

    /// Commands that reached the card, auto commands included, oldest first
    pub fn commands(&self) -> Vec<(u8, u32)> {
        self.lock().log.iter().copied().collect()
    }

    /// Commands written while CMD or DAT was still busy with an earlier one
    pub fn collisions(&self) -> u32 {
        self.lock().collisions
    }

    pub fn clear_command_log(&self) {
        self.lock().log.clear();
    }

    pub fn host_control2(&self) -> u16 {
        self.lock().regs.host_control2
    }

    pub fn bus_powered(&self) -> bool {
        self.lock().regs.power_control & power::BUS_POWER_ON != 0
    }
}

impl RegisterBlock for SimController {
    fn read8(&self, offset: u32) -> u8 {
        self.with_inner(|inner| inner.read(offset, 1) as u8)
    }

    fn read16(&self, offset: u32) -> u16 {
        self.with_inner(|inner| inner.read(offset, 2) as u16)
    }

    fn read32(&self, offset: u32) -> u32 {
        self.with_inner(|inner| inner.read(offset, 4))
    }

    fn write8(&self, offset: u32, value: u8) {
        self.with_inner(|inner| inner.write(offset, 1, value as u32));
    }

    fn write16(&self, offset: u32, value: u16) {
        self.with_inner(|inner| inner.write(offset, 2, value as u32));
    }

    fn write32(&self, offset: u32, value: u32) {
        self.with_inner(|inner| inner.write(offset, 4, value));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use sdhc_hw::card::if_cond;

    use super::*;
    use crate::config::CardKind;

    fn controller(config: SimConfig) -> SimController {
        SimController::new(&config, Arc::new(SimDma::new())).unwrap()
    }

    fn send(c: &SimController, index: u8, arg: u32, resp: u16) -> u32 {
        c.write32(reg::ARGUMENT, arg);
        c.write16(reg::COMMAND, (index as u16) << command::INDEX_SHIFT | resp);
        c.read32(reg::INT_STATUS)
    }

    fn powered(kind: CardKind) -> SimController {
        let c = controller(SimConfig::with_card(kind));
        c.write32(reg::INT_ENABLE, int_status::DEFAULT_ENABLE);
        c.write8(reg::POWER_CONTROL, power::VOLTAGE_3V3 | power::BUS_POWER_ON);
        c.write16(reg::CLOCK_CONTROL, clock::INTERNAL_ENABLE | clock::SD_CLOCK_ENABLE);
        c
    }

    #[test]
    fn reset_all_clears_status_and_power() {
        let c = powered(CardKind::Sdhc);
        send(&c, 0, 0, command::RESP_NONE);
        assert_ne!(c.read32(reg::INT_STATUS) & int_status::COMMAND_COMPLETE, 0);
        c.write8(reg::SOFTWARE_RESET, reset::ALL);
        assert_eq!(c.read8(reg::SOFTWARE_RESET), 0);
        assert_eq!(c.read32(reg::INT_STATUS), 0);
        assert!(!c.bus_powered());
    }

    #[test]
    fn clock_reports_stable_once_enabled() {
        let c = controller(SimConfig::empty_slot());
        assert_eq!(c.read16(reg::CLOCK_CONTROL) & clock::INTERNAL_STABLE, 0);
        c.write16(reg::CLOCK_CONTROL, clock::INTERNAL_ENABLE);
        assert_ne!(c.read16(reg::CLOCK_CONTROL) & clock::INTERNAL_STABLE, 0);
    }

    #[test]
    fn empty_slot_times_out() {
        let c = controller(SimConfig::empty_slot());
        c.write32(reg::INT_ENABLE, int_status::DEFAULT_ENABLE);
        let status = send(&c, 0, 0, command::RESP_NONE);
        assert_ne!(status & int_status::COMMAND_TIMEOUT, 0);
        assert_ne!(status & int_status::ERROR, 0);
        assert_eq!(c.read32(reg::PRESENT_STATE) & present_state::CARD_INSERTED, 0);
    }

    #[test]
    fn interface_condition_echo_lands_in_response0() {
        let c = powered(CardKind::Sdhc);
        send(&c, 0, 0, command::RESP_NONE);
        c.write32(reg::INT_STATUS, !0);
        let arg = if_cond::ARGUMENT;
        let status = send(&c, 8, arg, command::RESP_SHORT);
        assert_eq!(status & int_status::COMMAND_COMPLETE, int_status::COMMAND_COMPLETE);
        assert_eq!(c.read32(reg::RESPONSE0), arg);
        assert_eq!(c.commands(), vec![(0, 0), (8, arg)]);
    }

    #[test]
    fn status_is_write_one_to_clear() {
        let c = powered(CardKind::Sdhc);
        send(&c, 0, 0, command::RESP_NONE);
        c.write16(reg::ERR_STATUS, 0xFFFF);
        assert_ne!(c.read32(reg::INT_STATUS) & int_status::COMMAND_COMPLETE, 0);
        c.write32(reg::INT_STATUS, int_status::COMMAND_COMPLETE);
        assert_eq!(c.read32(reg::INT_STATUS), 0);
    }

    #[test]
    fn command_fault_never_reaches_card() {
        let c = powered(CardKind::Sdhc);
        c.inject_fault(Fault::once(FaultKind::CommandCrc).on(13));
        let status = send(&c, 13, 0, command::RESP_SHORT);
        assert_ne!(status & int_status::COMMAND_CRC, 0);
        assert!(c.commands().is_empty());
        assert_eq!(c.faults_fired(), 1);
    }

    #[test]
    fn stall_holds_cmd_inhibit_until_cmd_reset() {
        let c = powered(CardKind::Sdhc);
        c.inject_fault(Fault::once(FaultKind::Stall));
        assert_eq!(send(&c, 0, 0, command::RESP_NONE), 0);
        assert_ne!(c.read32(reg::PRESENT_STATE) & present_state::CMD_INHIBIT, 0);
        c.write8(reg::SOFTWARE_RESET, reset::CMD_LINE);
        assert_eq!(c.read32(reg::PRESENT_STATE) & present_state::CMD_INHIBIT, 0);
    }

    #[test]
    fn command_over_a_busy_line_is_counted_and_dropped() {
        let c = powered(CardKind::Sdhc);
        c.inject_fault(Fault::once(FaultKind::Stall));
        send(&c, 0, 0, command::RESP_NONE);
        assert_eq!(c.collisions(), 0);

        send(&c, 0, 0, command::RESP_NONE);
        assert_eq!(c.collisions(), 1);
        assert!(c.commands().is_empty());
    }

    #[test]
    fn irq_line_runs_until_status_is_acknowledged() {
        let c = Arc::new(powered(CardKind::Sdhc));
        c.write32(reg::SIGNAL_ENABLE, int_status::DEFAULT_ENABLE);
        let calls = Arc::new(AtomicU32::new(0));
        let weak = Arc::downgrade(&c);
        let counter = Arc::clone(&calls);
        c.connect_irq(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(c) = weak.upgrade() {
                let status = c.read32(reg::INT_STATUS);
                c.write32(reg::INT_STATUS, status);
            }
        });
        send(&c, 0, 0, command::RESP_NONE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.read32(reg::INT_STATUS), 0);
    }

    #[test]
    fn removal_latches_and_clears_present() {
        let c = powered(CardKind::Sdhc);
        let card = c.remove_card().unwrap();
        assert_eq!(card.kind(), CardKind::Sdhc);
        assert_ne!(c.read32(reg::INT_STATUS) & int_status::CARD_REMOVAL, 0);
        assert!(!c.card_present());
        c.insert(card);
        assert_ne!(c.read32(reg::INT_STATUS) & int_status::CARD_INSERTION, 0);
        assert_ne!(c.read32(reg::PRESENT_STATE) & present_state::CARD_INSERTED, 0);
    }

    #[test]
    fn write_protect_switch_drives_level() {
        let c = powered(CardKind::Sdsc);
        assert_ne!(c.read32(reg::PRESENT_STATE) & present_state::WRITE_PROTECT_LEVEL, 0);
        c.set_write_protect_switch(true);
        assert_eq!(c.read32(reg::PRESENT_STATE) & present_state::WRITE_PROTECT_LEVEL, 0);
    }
}
