//! SDIO register and data access: CMD52, CMD53, function enables,
//! interrupts and suspend/resume.

use std::thread;
use std::time::{Duration, Instant};

use sdhc_hw::card::{cccr, fbr, io_arg, opcode};
use tracing::{debug, info};

use crate::command::{Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};
use crate::regs::IrqStatus;

/// Largest byte-mode CMD53 transfer; a count field of zero means 512
const BYTE_MODE_MAX: usize = 512;
const FUNCTION_READY_TIMEOUT: Duration = Duration::from_millis(1000);
const SUSPEND_POLLS: u32 = 100;

fn direct_arg(write: bool, func: u8, addr: u32, data: u8) -> u32 {
    let mut arg = ((func as u32 & 0x7) << io_arg::FUNCTION_SHIFT)
        | ((addr & io_arg::ADDRESS_MASK) << io_arg::ADDRESS_SHIFT)
        | data as u32;
    if write {
        arg |= io_arg::WRITE | io_arg::RAW;
    }
    arg
}

fn extended_arg(write: bool, func: u8, addr: u32, increment: bool, block_mode: bool, count: u32) -> u32 {
    let mut arg = ((func as u32 & 0x7) << io_arg::FUNCTION_SHIFT)
        | ((addr & io_arg::ADDRESS_MASK) << io_arg::ADDRESS_SHIFT)
        | (count & io_arg::COUNT_MASK);
    if write {
        arg |= io_arg::WRITE;
    }
    if block_mode {
        arg |= io_arg::BLOCK_MODE;
    }
    if increment {
        arg |= io_arg::INCREMENT;
    }
    arg
}

/// The CMD53 address field holds 17 bits; an incrementing transfer must end
/// inside it, a fixed-address one only needs its single address there
fn check_extended_range(addr: u32, len: usize, increment: bool) -> Result<()> {
    let span = if increment { len } else { len.min(1) };
    let end = u32::try_from(span).ok().and_then(|span| addr.checked_add(span));
    match end {
        Some(end) if end <= io_arg::ADDRESS_MASK + 1 => Ok(()),
        _ => Err(Error::InvalidRequest("SDIO transfer runs past the 17-bit address space")),
    }
}

impl Host {
    /// CMD52. Writes use read-after-write, so the returned byte is what the
    /// register holds afterwards.
    pub(crate) fn io_rw_direct_locked(
        &self,
        st: &mut HostState,
        write: bool,
        func: u8,
        addr: u32,
        data: u8,
    ) -> Result<u8> {
        if func > 7 || addr > io_arg::ADDRESS_MASK {
            return Err(Error::InvalidRequest("SDIO function or register address out of range"));
        }
        let r = self.do_request(
            st,
            &Command::new(opcode::IO_RW_DIRECT, direct_arg(write, func, addr, data), ResponseType::R5),
            None,
        )?;
        Ok(r.r5_data())
    }

    pub fn read_sdio_register(&self, func: u8, addr: u32) -> Result<u8> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        self.io_rw_direct_locked(st, false, func, addr, 0)
    }

    /// Returns the register value read back after the write
    pub fn write_sdio_register(&self, func: u8, addr: u32, value: u8) -> Result<u8> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        self.io_rw_direct_locked(st, true, func, addr, value)
    }

    /// CMD53 read from `func` starting at `addr`. With `increment` the card
    /// address advances per byte; otherwise every byte comes from a FIFO.
    pub fn read_sdio(&self, func: u8, addr: u32, increment: bool, buf: &mut [u8]) -> Result<()> {
        check_extended_range(addr, buf.len(), increment)?;
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        let block = self.function_block_size(st, func)?;
        let mut done = 0;
        while done < buf.len() {
            let (len, block_mode) = chunk_len(buf.len() - done, block);
            let at = if increment { addr + done as u32 } else { addr };
            let count = if block_mode { (len / block) as u32 } else { (len % BYTE_MODE_MAX) as u32 };
            let arg = extended_arg(false, func, at, increment, block_mode, count);
            let size = if block_mode { block } else { len };
            let mut desc = DataDescriptor::read(&mut buf[done..done + len], size);
            self.do_request(st, &Command::new(opcode::IO_RW_EXTENDED, arg, ResponseType::R5), Some(&mut desc))?;
            done += len;
        }
        debug!(func, addr, len = buf.len(), "SDIO read");
        Ok(())
    }

    pub fn write_sdio(&self, func: u8, addr: u32, increment: bool, buf: &[u8]) -> Result<()> {
        check_extended_range(addr, buf.len(), increment)?;
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        let block = self.function_block_size(st, func)?;
        let mut done = 0;
        while done < buf.len() {
            let (len, block_mode) = chunk_len(buf.len() - done, block);
            let at = if increment { addr + done as u32 } else { addr };
            let count = if block_mode { (len / block) as u32 } else { (len % BYTE_MODE_MAX) as u32 };
            let arg = extended_arg(true, func, at, increment, block_mode, count);
            let size = if block_mode { block } else { len };
            let mut desc = DataDescriptor::write(&buf[done..done + len], size);
            self.do_request(st, &Command::new(opcode::IO_RW_EXTENDED, arg, ResponseType::R5), Some(&mut desc))?;
            done += len;
        }
        debug!(func, addr, len = buf.len(), "SDIO write");
        Ok(())
    }

    /// Block size used for block-mode CMD53, or zero when the card has no
    /// block mode
    fn function_block_size(&self, st: &mut HostState, func: u8) -> Result<usize> {
        if func > 7 {
            return Err(Error::InvalidRequest("SDIO function out of range"));
        }
        let info = self.card(st)?.sdio.as_ref().ok_or(Error::UnsupportedMode("card has no SDIO portion"))?;
        if func > info.functions {
            return Err(Error::InvalidRequest("SDIO function not present on card"));
        }
        if info.capability & cccr::CAP_SMB == 0 {
            return Ok(0);
        }
        Ok(info.block_sizes[func as usize] as usize)
    }

    /// Programs the block size register of `func` (CCCR for function 0)
    pub fn set_sdio_block_size(&self, func: u8, size: u16) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        if func > 7 || size == 0 || size as usize > BYTE_MODE_MAX * 4 {
            return Err(Error::InvalidRequest("bad SDIO block size"));
        }
        let base = func as u32 * fbr::STRIDE + fbr::BLOCK_SIZE;
        let [lo, hi] = size.to_le_bytes();
        self.io_rw_direct_locked(st, true, 0, base, lo)?;
        self.io_rw_direct_locked(st, true, 0, base + 1, hi)?;
        if let Some(info) = self.card(st)?.sdio.as_mut() {
            info.block_sizes[func as usize] = size;
        }
        debug!(func, size, "SDIO block size set");
        Ok(())
    }

    /// Sets IO_ENABLE for `func` and waits for IO_READY
    pub fn enable_sdio_function(&self, func: u8, enable: bool) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        if func == 0 || func > 7 {
            return Err(Error::InvalidRequest("I/O function must be 1 to 7"));
        }
        let bit = 1u8 << func;
        let current = self.io_rw_direct_locked(st, false, 0, cccr::IO_ENABLE, 0)?;
        let value = if enable { current | bit } else { current & !bit };
        self.io_rw_direct_locked(st, true, 0, cccr::IO_ENABLE, value)?;

        if enable {
            let deadline = Instant::now() + FUNCTION_READY_TIMEOUT;
            while self.io_rw_direct_locked(st, false, 0, cccr::IO_READY, 0)? & bit == 0 {
                if Instant::now() >= deadline {
                    return Err(Error::CardBusy);
                }
                thread::sleep(self.config.status_poll_interval);
            }
        }
        if let Some(info) = self.card(st)?.sdio.as_mut() {
            info.enabled = value;
        }
        info!(func, enable, "SDIO function");
        Ok(())
    }

    /// Enables or disables the card interrupt of `func`. The master enable
    /// and the controller's card interrupt follow whether any function is
    /// still enabled.
    pub fn enable_sdio_interrupt(&self, func: u8, enable: bool) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        if func == 0 || func > 7 {
            return Err(Error::InvalidRequest("I/O function must be 1 to 7"));
        }
        let bit = 1u8 << func;
        let current = self.io_rw_direct_locked(st, false, 0, cccr::INT_ENABLE, 0)?;
        let mut value = if enable { current | bit } else { current & !bit };
        if value & !cccr::INT_MASTER != 0 {
            value |= cccr::INT_MASTER;
        } else {
            value = 0;
        }
        self.io_rw_direct_locked(st, true, 0, cccr::INT_ENABLE, value)?;

        let regs = self.regs();
        let (mut int_en, mut sig_en) = (regs.int_enable(), regs.signal_enable());
        int_en.set(IrqStatus::CARD_INTERRUPT, value != 0);
        sig_en.set(IrqStatus::CARD_INTERRUPT, value != 0);
        regs.set_int_enable(int_en);
        regs.set_signal_enable(sig_en);
        debug!(func, enable, cccr = value, "SDIO interrupt enable");
        Ok(())
    }

    /// Functions with an interrupt pending (bit n = function n)
    pub fn sdio_pending_interrupts(&self) -> Result<u8> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        Ok(self.io_rw_direct_locked(st, false, 0, cccr::INT_PENDING, 0)? & !1)
    }

    /// Aborts an in-flight CMD53 to `func`
    pub fn abort_sdio(&self, func: u8) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        self.io_rw_direct_locked(st, true, 0, cccr::IO_ABORT, func & 0x7)?;
        Ok(())
    }

    /// Requests a bus release and waits for the card to suspend the function
    /// that holds the bus
    pub fn suspend_sdio(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        self.require_suspend_support(st)?;
        self.io_rw_direct_locked(st, true, 0, cccr::BUS_SUSPEND, cccr::BUS_RELEASE)?;
        for _ in 0..SUSPEND_POLLS {
            let status = self.io_rw_direct_locked(st, false, 0, cccr::BUS_SUSPEND, 0)?;
            if status & (cccr::BUS_STATUS | cccr::BUS_RELEASE) == 0 {
                info!("SDIO function suspended");
                return Ok(());
            }
            thread::sleep(self.config.status_poll_interval);
        }
        Err(Error::CardBusy)
    }

    /// Resumes `func`; returns true when the card has data ready for it
    pub fn resume_sdio(&self, func: u8) -> Result<bool> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        self.require_suspend_support(st)?;
        let flags = self.io_rw_direct_locked(st, true, 0, cccr::FUNCTION_SELECT, func & 0xF)?;
        info!(func, "SDIO function resumed");
        Ok(flags & cccr::RESUME_DATA_FLAG != 0)
    }

    /// Selects the function addressed by the bus info interface
    pub fn select_sdio_function(&self, func: u8) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_sdio(st)?;
        let functions = self.card(st)?.sdio.as_ref().map_or(0, |i| i.functions);
        if func > functions {
            return Err(Error::InvalidRequest("SDIO function not present on card"));
        }
        st.function = func;
        Ok(())
    }

    fn require_suspend_support(&self, st: &mut HostState) -> Result<()> {
        let cap = self.card(st)?.sdio.as_ref().map_or(0, |i| i.capability);
        if cap & cccr::CAP_SBS == 0 {
            return Err(Error::UnsupportedMode("card does not support suspend/resume"));
        }
        Ok(())
    }
}

/// Splits off the next CMD53 piece: whole blocks in block mode when the
/// card has a block size, otherwise up to 512 bytes in byte mode
fn chunk_len(remaining: usize, block: usize) -> (usize, bool) {
    if block > 0 && remaining >= block && remaining > BYTE_MODE_MAX {
        let blocks = (remaining / block).min(io_arg::COUNT_MASK as usize);
        (blocks * block, true)
    } else {
        (remaining.min(BYTE_MODE_MAX), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_argument_layout() {
        assert_eq!(direct_arg(false, 0, 0x13, 0), 0x13 << 9);
        let w = direct_arg(true, 1, 0x1FFFF, 0xA5);
        assert_eq!(w >> 31, 1);
        assert_eq!((w >> 28) & 7, 1);
        assert_ne!(w & io_arg::RAW, 0);
        assert_eq!((w >> 9) & 0x1FFFF, 0x1FFFF);
        assert_eq!(w & 0xFF, 0xA5);
    }

    #[test]
    fn extended_argument_layout() {
        let a = extended_arg(false, 2, 0x100, true, true, 8);
        assert_eq!((a >> 28) & 7, 2);
        assert_ne!(a & io_arg::BLOCK_MODE, 0);
        assert_ne!(a & io_arg::INCREMENT, 0);
        assert_eq!(a & io_arg::COUNT_MASK, 8);
        // 512 bytes encode as count zero
        let b = extended_arg(true, 1, 0, false, false, (512 % BYTE_MODE_MAX) as u32);
        assert_eq!(b & io_arg::COUNT_MASK, 0);
    }

    #[test]
    fn chunking_prefers_block_mode_for_large_buffers() {
        assert_eq!(chunk_len(100, 64), (100, false));
        assert_eq!(chunk_len(2048, 512), (2048, true));
        assert_eq!(chunk_len(2100, 512), (2048, true));
        assert_eq!(chunk_len(2048, 0), (512, false));
    }

    #[test]
    fn extended_range_stays_in_17_bits() {
        assert!(check_extended_range(0x1_FFF0, 16, true).is_ok());
        assert!(check_extended_range(0x1_FFF0, 17, true).is_err());
        assert!(check_extended_range(0x2_0010, 4, true).is_err());
        assert!(check_extended_range(u32::MAX, 4, true).is_err());
        // A FIFO address only has to exist itself
        assert!(check_extended_range(0x1_FFFF, 4096, false).is_ok());
        assert!(check_extended_range(0x2_0000, 1, false).is_err());
    }
}
