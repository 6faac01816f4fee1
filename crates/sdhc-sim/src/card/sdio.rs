//! SDIO function 0 (CCCR, FBR, CIS) and a single memory-like I/O function.

use sdhc_hw::card::{cccr, cis, fbr, io_arg, ocr, opcode, r5, state};
use tracing::{debug, info, trace};

use super::{Outcome, SimCard, Sink, Source};
use crate::config::CardConfig;

const COMMON_CIS: u32 = 0x1000;
const FN1_CIS: u32 = 0x2000;
/// Function 1 exposes its whole 17-bit address space as RAM
const FN1_MEMORY: usize = 0x2_0000;

#[derive(Debug)]
pub(super) struct SdioState {
    functions: u8,
    uhs: bool,
    io_enable: u8,
    int_enable: u8,
    int_pending: u8,
    bus_interface: u8,
    bus_speed_select: u8,
    driver_select: u8,
    block_sizes: [u16; 8],
    /// Function whose transfer was released by BUS_SUSPEND
    suspended: Option<u8>,
    selected: u8,
    resume_data: bool,
    last_function: u8,
    common_cis: Vec<u8>,
    fn1_cis: Vec<u8>,
    memory: Vec<u8>,
}

fn build_common_cis() -> Vec<u8> {
    vec![
        cis::TPL_MANFID, 4, 0x96, 0x02, 0x01, 0x00,
        cis::TPL_FUNCID, 2, 0x0C, 0x00,
        // Function 0 extension: 512-byte maximum block, 50 MHz
        cis::TPL_FUNCE, 4, 0x00, 0x00, 0x02, 0x32,
        cis::TPL_END,
    ]
}

fn build_fn1_cis() -> Vec<u8> {
    let mut funce = vec![0u8; 0x2A];
    funce[0] = 0x01;
    funce[12..14].copy_from_slice(&512u16.to_le_bytes());
    let mut tuples = vec![cis::TPL_FUNCID, 2, 0x0C, 0x00, cis::TPL_FUNCE, funce.len() as u8];
    tuples.extend_from_slice(&funce);
    tuples.push(cis::TPL_END);
    tuples
}

impl SdioState {
    pub(super) fn new(config: &CardConfig) -> Self {
        Self {
            functions: 1,
            uhs: config.uhs,
            io_enable: 0,
            int_enable: 0,
            int_pending: 0,
            bus_interface: 0,
            bus_speed_select: 0,
            driver_select: 0,
            block_sizes: [0; 8],
            suspended: None,
            selected: 0,
            resume_data: false,
            last_function: 0,
            common_cis: build_common_cis(),
            fn1_cis: build_fn1_cis(),
            memory: vec![0; FN1_MEMORY],
        }
    }

    /// Function registers back to their reset values; function memory stays
    pub(super) fn reset(&mut self) {
        self.io_enable = 0;
        self.int_enable = 0;
        self.int_pending = 0;
        self.bus_interface = 0;
        self.bus_speed_select = 0;
        self.driver_select = 0;
        self.block_sizes = [0; 8];
        self.suspended = None;
        self.selected = 0;
        self.resume_data = false;
    }

    pub(super) fn functions(&self) -> u8 {
        self.functions
    }

    fn function_mask(&self) -> u8 {
        ((1u16 << (self.functions + 1)) - 2) as u8
    }

    fn interrupt_asserted(&self) -> bool {
        self.int_enable & cccr::INT_MASTER != 0 && self.int_enable & self.int_pending & !1 != 0
    }

    fn read_cccr(&self, addr: u32) -> u8 {
        match addr {
            cccr::REVISION => 0x43,
            cccr::SD_REVISION => 0x03,
            cccr::IO_ENABLE => self.io_enable,
            cccr::IO_READY => self.io_enable,
            cccr::INT_ENABLE => self.int_enable,
            cccr::INT_PENDING => self.int_pending,
            cccr::BUS_INTERFACE => self.bus_interface,
            cccr::CARD_CAPABILITY => cccr::CAP_SMB | cccr::CAP_SBS,
            a if (cccr::CIS_POINTER..cccr::CIS_POINTER + 3).contains(&a) => {
                COMMON_CIS.to_le_bytes()[(a - cccr::CIS_POINTER) as usize]
            }
            cccr::FUNCTION_SELECT => {
                let flag = if self.resume_data { cccr::RESUME_DATA_FLAG } else { 0 };
                flag | self.selected
            }
            cccr::FN0_BLOCK_SIZE => self.block_sizes[0].to_le_bytes()[0],
            a if a == cccr::FN0_BLOCK_SIZE + 1 => self.block_sizes[0].to_le_bytes()[1],
            cccr::POWER_CONTROL => 0x01,
            cccr::BUS_SPEED => cccr::SUPPORT_HIGH_SPEED | (self.bus_speed_select << cccr::SPEED_SELECT_SHIFT),
            cccr::UHS_SUPPORT if self.uhs => cccr::UHS_SDR50 | cccr::UHS_SDR104 | cccr::UHS_DDR50,
            cccr::DRIVER_STRENGTH => {
                cccr::DRIVER_SUPPORT_A
                    | cccr::DRIVER_SUPPORT_C
                    | cccr::DRIVER_SUPPORT_D
                    | (self.driver_select << cccr::DRIVER_SELECT_SHIFT)
            }
            _ => 0,
        }
    }

    fn read_fbr(&self, func: u8, offset: u32) -> u8 {
        if func > self.functions {
            return 0;
        }
        match offset {
            0x00 => 0x07,
            o if (fbr::CIS_POINTER..fbr::CIS_POINTER + 3).contains(&o) => {
                FN1_CIS.to_le_bytes()[(o - fbr::CIS_POINTER) as usize]
            }
            fbr::BLOCK_SIZE => self.block_sizes[func as usize].to_le_bytes()[0],
            o if o == fbr::BLOCK_SIZE + 1 => self.block_sizes[func as usize].to_le_bytes()[1],
            _ => 0,
        }
    }

    /// One register read; `Err` carries R5 error flags
    pub(super) fn read(&self, func: u8, addr: u32) -> Result<u8, u32> {
        if func > self.functions {
            return Err(r5::FUNCTION_NUMBER);
        }
        if func != 0 {
            return self.memory.get(addr as usize).copied().ok_or(r5::OUT_OF_RANGE);
        }
        let common = COMMON_CIS..COMMON_CIS + self.common_cis.len() as u32;
        let fn1 = FN1_CIS..FN1_CIS + self.fn1_cis.len() as u32;
        match addr {
            0x000..=0x0FF => Ok(self.read_cccr(addr)),
            0x100..=0x7FF => Ok(self.read_fbr((addr / fbr::STRIDE) as u8, addr % fbr::STRIDE)),
            a if common.contains(&a) => Ok(self.common_cis[(a - COMMON_CIS) as usize]),
            a if fn1.contains(&a) => Ok(self.fn1_cis[(a - FN1_CIS) as usize]),
            _ => Err(r5::OUT_OF_RANGE),
        }
    }

    /// One register write; `Err` carries R5 error flags
    pub(super) fn write(&mut self, func: u8, addr: u32, value: u8) -> Result<(), u32> {
        if func > self.functions {
            return Err(r5::FUNCTION_NUMBER);
        }
        if func != 0 {
            let byte = self.memory.get_mut(addr as usize).ok_or(r5::OUT_OF_RANGE)?;
            *byte = value;
            return Ok(());
        }
        match addr {
            cccr::IO_ENABLE => {
                self.io_enable = value & self.function_mask();
                debug!("SDIO functions enabled: {:#04X}", self.io_enable);
            }
            cccr::INT_ENABLE => self.int_enable = value & (self.function_mask() | cccr::INT_MASTER),
            cccr::IO_ABORT => {
                if value & 0x08 != 0 {
                    info!("SDIO I/O reset");
                    self.reset();
                } else {
                    debug!("SDIO abort of function {}", value & 0x7);
                }
            }
            cccr::BUS_INTERFACE => self.bus_interface = value,
            cccr::BUS_SUSPEND => {
                if value & cccr::BUS_RELEASE != 0 && self.last_function != 0 {
                    debug!("SDIO function {} suspended", self.last_function);
                    self.suspended = Some(self.last_function);
                }
            }
            cccr::FUNCTION_SELECT => {
                let func = value & 0xF;
                self.resume_data = self.suspended == Some(func);
                if self.resume_data {
                    self.suspended = None;
                    debug!("SDIO function {} resumed", func);
                }
                self.selected = func;
            }
            cccr::FN0_BLOCK_SIZE => self.set_block_size_byte(0, 0, value),
            a if a == cccr::FN0_BLOCK_SIZE + 1 => self.set_block_size_byte(0, 1, value),
            cccr::BUS_SPEED => {
                self.bus_speed_select = (value & cccr::SPEED_SELECT_MASK) >> cccr::SPEED_SELECT_SHIFT;
                debug!("SDIO bus speed select: {}", self.bus_speed_select);
            }
            cccr::DRIVER_STRENGTH => self.driver_select = (value >> cccr::DRIVER_SELECT_SHIFT) & 0x3,
            0x100..=0x7FF => {
                let f = (addr / fbr::STRIDE) as u8;
                let offset = addr % fbr::STRIDE;
                if f <= self.functions && offset == fbr::BLOCK_SIZE {
                    self.set_block_size_byte(f, 0, value);
                } else if f <= self.functions && offset == fbr::BLOCK_SIZE + 1 {
                    self.set_block_size_byte(f, 1, value);
                }
            }
            _ => trace!("Write to read-only SDIO register {:#X} ignored", addr),
        }
        Ok(())
    }

    fn set_block_size_byte(&mut self, func: u8, byte: usize, value: u8) {
        let mut bytes = self.block_sizes[func as usize].to_le_bytes();
        bytes[byte] = value;
        self.block_sizes[func as usize] = u16::from_le_bytes(bytes);
    }
}

impl SimCard {
    /// Raises the interrupt of `func`; true when the card asserts DAT1
    pub fn raise_sdio_interrupt(&mut self, func: u8) -> bool {
        let Some(sdio) = self.sdio.as_mut() else {
            return false;
        };
        if func == 0 || func > sdio.functions {
            return false;
        }
        sdio.int_pending |= 1 << func;
        sdio.interrupt_asserted()
    }

    /// Function-side acknowledge of a pending interrupt
    pub fn clear_sdio_interrupt(&mut self, func: u8) {
        if let Some(sdio) = self.sdio.as_mut() {
            sdio.int_pending &= !(1 << func);
        }
    }

    pub fn sdio_interrupt_asserted(&self) -> bool {
        self.sdio.as_ref().is_some_and(SdioState::interrupt_asserted)
    }

    /// Function 1 memory, for inspection
    pub fn sdio_memory(&self) -> Option<&[u8]> {
        self.sdio.as_ref().map(|s| s.memory.as_slice())
    }

    fn r5_state(&self) -> u32 {
        let bits = match self.state {
            state::TRANSFER => 1,
            state::DATA | state::RECEIVE => 2,
            _ => 0,
        };
        bits << r5::STATE_SHIFT
    }

    /// CMD5: IO_SEND_OP_COND - SDIO power-up handshake
    pub(super) fn cmd5_io_send_op_cond(&mut self, arg: u32) -> Outcome {
        let Some(functions) = self.sdio.as_ref().map(SdioState::functions) else {
            return self.illegal(opcode::IO_SEND_OP_COND);
        };
        if !matches!(self.state, state::IDLE | state::READY) {
            return self.illegal(opcode::IO_SEND_OP_COND);
        }
        let mut value = ((functions as u32) << ocr::SDIO_FUNCTIONS_SHIFT) | ocr::VDD_WINDOW;
        if arg & ocr::SDIO_OCR_MASK == 0 {
            return Outcome::short(value);
        }
        if self.ready_countdown > 0 {
            self.ready_countdown -= 1;
            return Outcome::short(value);
        }
        self.state = state::READY;
        value |= ocr::BUSY;
        if self.config.uhs && arg & ocr::S18 != 0 && !self.signal_1v8 {
            value |= ocr::S18;
            self.s18_accepted = true;
        }
        Outcome::short(value)
    }

    /// CMD52: IO_RW_DIRECT - Single register read or write
    pub(super) fn cmd52_io_rw_direct(&mut self, arg: u32) -> Outcome {
        if !matches!(self.state, state::TRANSFER | state::DATA | state::RECEIVE) {
            return self.illegal(opcode::IO_RW_DIRECT);
        }
        let write = arg & io_arg::WRITE != 0;
        let func = ((arg >> io_arg::FUNCTION_SHIFT) & 0x7) as u8;
        let addr = (arg >> io_arg::ADDRESS_SHIFT) & io_arg::ADDRESS_MASK;
        let data = (arg & 0xFF) as u8;
        let state_bits = self.r5_state();
        let Some(sdio) = self.sdio.as_mut() else {
            return self.illegal(opcode::IO_RW_DIRECT);
        };
        let result = if write {
            sdio.write(func, addr, data).and_then(|()| {
                if arg & io_arg::RAW != 0 { sdio.read(func, addr) } else { Ok(data) }
            })
        } else {
            sdio.read(func, addr)
        };
        trace!("CMD52 {} fn{} {:#X}: {:?}", if write { "write" } else { "read" }, func, addr, result);
        if write && func == 0 && addr == cccr::IO_ABORT {
            self.finish_data();
        }
        match result {
            Ok(value) => Outcome::short(state_bits | value as u32),
            Err(flags) => Outcome::short(state_bits | flags),
        }
    }

    /// CMD53: IO_RW_EXTENDED - Byte or block stream to a function
    pub(super) fn cmd53_io_rw_extended(&mut self, arg: u32) -> Outcome {
        if self.state != state::TRANSFER {
            return self.illegal(opcode::IO_RW_EXTENDED);
        }
        let write = arg & io_arg::WRITE != 0;
        let func = ((arg >> io_arg::FUNCTION_SHIFT) & 0x7) as u8;
        let addr = (arg >> io_arg::ADDRESS_SHIFT) & io_arg::ADDRESS_MASK;
        let increment = arg & io_arg::INCREMENT != 0;
        let block_mode = arg & io_arg::BLOCK_MODE != 0;
        let state_bits = self.r5_state();
        let Some(sdio) = self.sdio.as_mut() else {
            return self.illegal(opcode::IO_RW_EXTENDED);
        };
        if func > sdio.functions {
            return Outcome::refused(state_bits | r5::FUNCTION_NUMBER);
        }
        if block_mode && (arg & io_arg::COUNT_MASK == 0 || sdio.block_sizes[func as usize] == 0) {
            return Outcome::refused(state_bits | r5::ERROR);
        }
        sdio.last_function = func;
        trace!(
            "CMD53 {} fn{} at {:#X}, {} mode",
            if write { "write" } else { "read" },
            func,
            addr,
            if block_mode { "block" } else { "byte" }
        );
        if write {
            let sink = Sink::Sdio { func, addr, increment };
            self.start_receiving(sink);
            Outcome::write(state_bits, sink)
        } else {
            self.start_sending();
            Outcome::read(state_bits, Source::Sdio { func, addr, increment })
        }
    }

    pub(super) fn sdio_read(&mut self, func: u8, addr: u32, increment: bool, offset: u64, buf: &mut [u8]) {
        let Some(sdio) = self.sdio.as_ref() else {
            buf.fill(0);
            return;
        };
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = if increment { addr + offset as u32 + i as u32 } else { addr };
            *byte = sdio.read(func, at & io_arg::ADDRESS_MASK).unwrap_or(0);
        }
    }

    pub(super) fn sdio_write(&mut self, func: u8, addr: u32, increment: bool, offset: u64, data: &[u8]) {
        let Some(sdio) = self.sdio.as_mut() else {
            return;
        };
        for (i, byte) in data.iter().enumerate() {
            let at = if increment { addr + offset as u32 + i as u32 } else { addr };
            let _ = sdio.write(func, at & io_arg::ADDRESS_MASK, *byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardKind;

    fn state() -> SdioState {
        SdioState::new(&CardConfig::new(CardKind::Sdio))
    }

    #[test]
    fn cis_pointer_leads_to_manfid() {
        let s = state();
        let ptr = (0..3).fold(0u32, |acc, i| acc | (s.read(0, cccr::CIS_POINTER + i).unwrap() as u32) << (8 * i));
        assert_eq!(s.read(0, ptr).unwrap(), cis::TPL_MANFID);
        assert_eq!(s.read(0, ptr + 2).unwrap(), 0x96);
    }

    #[test]
    fn block_size_written_through_fbr() {
        let mut s = state();
        s.write(0, fbr::STRIDE + fbr::BLOCK_SIZE, 0x00).unwrap();
        s.write(0, fbr::STRIDE + fbr::BLOCK_SIZE + 1, 0x02).unwrap();
        assert_eq!(s.block_sizes[1], 512);
        assert_eq!(s.read(0, fbr::STRIDE + fbr::BLOCK_SIZE + 1).unwrap(), 0x02);
    }

    #[test]
    fn interrupt_needs_master_enable() {
        let mut s = state();
        s.int_pending = 1 << 1;
        s.write(0, cccr::INT_ENABLE, 1 << 1).unwrap();
        assert!(!s.interrupt_asserted());
        s.write(0, cccr::INT_ENABLE, (1 << 1) | cccr::INT_MASTER).unwrap();
        assert!(s.interrupt_asserted());
    }

    #[test]
    fn missing_function_reports_function_number() {
        let s = state();
        assert_eq!(s.read(3, 0), Err(r5::FUNCTION_NUMBER));
    }
}
