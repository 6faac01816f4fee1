//! Typed access to one SDHC slot's register window.
//!
//! All register traffic goes through [`RegisterBlock`] so that the same driver
//! runs against real memory-mapped hardware ([`Mmio`]) or a simulated
//! controller. Accessors here are thin: no waiting, no retries.

use std::time::Duration;

use bitflags::bitflags;
use sdhc_hw::mmio::sdhc::{
    caps, caps1, clock, host_control, host_control2, int_status, max_current, present_state,
    registers as reg, reset, transfer_mode,
};

use crate::config::BusWidth;

/// Width-specific register access. Implementations must tolerate calls from
/// interrupt context and from request threads concurrently.
pub trait RegisterBlock: Send + Sync {
    fn read8(&self, offset: u32) -> u8;
    fn read16(&self, offset: u32) -> u16;
    fn read32(&self, offset: u32) -> u32;
    fn write8(&self, offset: u32, value: u8);
    fn write16(&self, offset: u32, value: u16);
    fn write32(&self, offset: u32, value: u32);
}

/// Volatile access to a memory-mapped register window
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must be the address of a mapped SDHC register window of at
    /// least [`sdhc_hw::mmio::sdhc::WINDOW_SIZE`] bytes that stays mapped for
    /// the lifetime of the returned value.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn addr(&self, offset: u32) -> usize {
        self.base + offset as usize
    }
}

impl RegisterBlock for Mmio {
    fn read8(&self, offset: u32) -> u8 {
        // SAFETY: `new` requires the window to be mapped.
        unsafe { std::ptr::read_volatile(self.addr(offset) as *const u8) }
    }

    fn read16(&self, offset: u32) -> u16 {
        // SAFETY: as above; offsets used by the driver are naturally aligned.
        unsafe { std::ptr::read_volatile(self.addr(offset) as *const u16) }
    }

    fn read32(&self, offset: u32) -> u32 {
        // SAFETY: as above.
        unsafe { std::ptr::read_volatile(self.addr(offset) as *const u32) }
    }

    fn write8(&self, offset: u32, value: u8) {
        // SAFETY: as above.
        unsafe { std::ptr::write_volatile(self.addr(offset) as *mut u8, value) }
    }

    fn write16(&self, offset: u32, value: u16) {
        // SAFETY: as above.
        unsafe { std::ptr::write_volatile(self.addr(offset) as *mut u16, value) }
    }

    fn write32(&self, offset: u32, value: u32) {
        // SAFETY: as above.
        unsafe { std::ptr::write_volatile(self.addr(offset) as *mut u32, value) }
    }
}

bitflags! {
    /// Normal (low half) and error (high half) interrupt status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqStatus: u32 {
        const COMMAND_COMPLETE = int_status::COMMAND_COMPLETE;
        const TRANSFER_COMPLETE = int_status::TRANSFER_COMPLETE;
        const BLOCK_GAP = int_status::BLOCK_GAP;
        const DMA_INTERRUPT = int_status::DMA_INTERRUPT;
        const BUFFER_WRITE_READY = int_status::BUFFER_WRITE_READY;
        const BUFFER_READ_READY = int_status::BUFFER_READ_READY;
        const CARD_INSERTION = int_status::CARD_INSERTION;
        const CARD_REMOVAL = int_status::CARD_REMOVAL;
        const CARD_INTERRUPT = int_status::CARD_INTERRUPT;
        const RETUNING_EVENT = int_status::RETUNING_EVENT;
        const ERROR = int_status::ERROR;
        const COMMAND_TIMEOUT = int_status::COMMAND_TIMEOUT;
        const COMMAND_CRC = int_status::COMMAND_CRC;
        const COMMAND_END_BIT = int_status::COMMAND_END_BIT;
        const COMMAND_INDEX = int_status::COMMAND_INDEX;
        const DATA_TIMEOUT = int_status::DATA_TIMEOUT;
        const DATA_CRC = int_status::DATA_CRC;
        const DATA_END_BIT = int_status::DATA_END_BIT;
        const CURRENT_LIMIT = int_status::CURRENT_LIMIT;
        const AUTO_CMD = int_status::AUTO_CMD;
        const ADMA = int_status::ADMA;
        const TUNING = int_status::TUNING;
    }
}

impl IrqStatus {
    pub const COMMAND_ERRORS: Self = Self::from_bits_retain(int_status::COMMAND_ERRORS);
    pub const DATA_ERRORS: Self = Self::from_bits_retain(int_status::DATA_ERRORS);

    pub const BUFFER: Self = Self::BUFFER_READ_READY.union(Self::BUFFER_WRITE_READY);

    /// Bits that belong to the request currently on the bus
    pub const REQUEST: Self = Self::COMMAND_COMPLETE
        .union(Self::TRANSFER_COMPLETE)
        .union(Self::DMA_INTERRUPT)
        .union(Self::BUFFER_WRITE_READY)
        .union(Self::BUFFER_READ_READY)
        .union(Self::COMMAND_ERRORS)
        .union(Self::DATA_ERRORS);

    pub fn has_error(self) -> bool {
        self.intersects(Self::COMMAND_ERRORS | Self::DATA_ERRORS)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PresentState: u32 {
        const CMD_INHIBIT = present_state::CMD_INHIBIT;
        const DATA_INHIBIT = present_state::DATA_INHIBIT;
        const DATA_ACTIVE = present_state::DATA_ACTIVE;
        const RETUNING_REQUEST = present_state::RETUNING_REQUEST;
        const WRITE_ACTIVE = present_state::WRITE_ACTIVE;
        const READ_ACTIVE = present_state::READ_ACTIVE;
        const BUFFER_WRITE_ENABLE = present_state::BUFFER_WRITE_ENABLE;
        const BUFFER_READ_ENABLE = present_state::BUFFER_READ_ENABLE;
        const CARD_INSERTED = present_state::CARD_INSERTED;
        const CARD_STABLE = present_state::CARD_STABLE;
        const CARD_DETECT_LEVEL = present_state::CARD_DETECT_LEVEL;
        const WRITE_PROTECT_LEVEL = present_state::WRITE_PROTECT_LEVEL;
        const CMD_LEVEL = present_state::CMD_LEVEL;
        const _ = !0;
    }
}

impl PresentState {
    /// DAT[3:0] line levels
    pub fn dat_levels(self) -> u8 {
        ((self.bits() & present_state::DAT_LEVEL_MASK) >> present_state::DAT_LEVEL_SHIFT) as u8
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransferModeFlags: u16 {
        const DMA_ENABLE = transfer_mode::DMA_ENABLE;
        const BLOCK_COUNT_ENABLE = transfer_mode::BLOCK_COUNT_ENABLE;
        const AUTO_CMD12 = transfer_mode::AUTO_CMD12;
        const AUTO_CMD23 = transfer_mode::AUTO_CMD23;
        const READ = transfer_mode::READ;
        const MULTI_BLOCK = transfer_mode::MULTI_BLOCK;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResetFlags: u8 {
        const ALL = reset::ALL;
        const CMD_LINE = reset::CMD_LINE;
        const DATA_LINE = reset::DATA_LINE;
    }
}

/// Decoded capabilities registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub raw: u32,
    pub raw1: u32,
    pub max_current: u32,
}

impl Capabilities {
    pub fn base_clock_hz(&self) -> u32 {
        ((self.raw & caps::BASE_CLOCK_MASK) >> caps::BASE_CLOCK_SHIFT) * 1_000_000
    }

    pub fn max_block_len(&self) -> usize {
        match (self.raw & caps::MAX_BLOCK_MASK) >> caps::MAX_BLOCK_SHIFT {
            0 => 512,
            1 => 1024,
            _ => 2048,
        }
    }

    pub fn sdma(&self) -> bool {
        self.raw & caps::SDMA != 0
    }

    pub fn adma2(&self) -> bool {
        self.raw & caps::ADMA2 != 0
    }

    pub fn high_speed(&self) -> bool {
        self.raw & caps::HIGH_SPEED != 0
    }

    pub fn bus_8bit(&self) -> bool {
        self.raw & caps::BUS_8BIT != 0
    }

    pub fn voltage_3v3(&self) -> bool {
        self.raw & caps::VOLTAGE_3V3 != 0
    }

    pub fn voltage_3v0(&self) -> bool {
        self.raw & caps::VOLTAGE_3V0 != 0
    }

    pub fn voltage_1v8(&self) -> bool {
        self.raw & caps::VOLTAGE_1V8 != 0
    }

    pub fn sdr50(&self) -> bool {
        self.raw1 & caps1::SDR50 != 0
    }

    pub fn sdr104(&self) -> bool {
        self.raw1 & caps1::SDR104 != 0
    }

    pub fn ddr50(&self) -> bool {
        self.raw1 & caps1::DDR50 != 0
    }

    /// Whether SDR50 needs a tuning pass like SDR104 does
    pub fn sdr50_needs_tuning(&self) -> bool {
        self.raw1 & caps1::SDR50_TUNING != 0
    }

    /// Driver types supported besides the default type B, as a bitmask of
    /// SD switch group 3 values (A = bit 1, C = bit 2, D = bit 3)
    pub fn driver_types(&self) -> u8 {
        let mut types = 1;
        if self.raw1 & caps1::DRIVER_TYPE_A != 0 {
            types |= 1 << 1;
        }
        if self.raw1 & caps1::DRIVER_TYPE_C != 0 {
            types |= 1 << 2;
        }
        if self.raw1 & caps1::DRIVER_TYPE_D != 0 {
            types |= 1 << 3;
        }
        types
    }

    /// Period of the controller's re-tuning timer, if it has one
    pub fn retune_period(&self) -> Option<Duration> {
        let count = (self.raw1 & caps1::RETUNE_TIMER_MASK) >> caps1::RETUNE_TIMER_SHIFT;
        match count {
            0 | 0xF => None,
            n => Some(Duration::from_secs(1 << (n - 1))),
        }
    }

    /// Maximum current in milliamps at the given signalling voltage
    pub fn max_current_ma(&self, voltage_mv: u32) -> u32 {
        let shift = match voltage_mv {
            3300 => max_current::V3_3_SHIFT,
            3000 => max_current::V3_0_SHIFT,
            _ => max_current::V1_8_SHIFT,
        };
        ((self.max_current >> shift) & 0xFF) * max_current::MA_PER_UNIT
    }
}

/// Divider for the 10-bit divided clock mode: `f = base / (2N)`, with `N = 0`
/// passing the base clock through. Returns the divider and the resulting
/// frequency, which never exceeds `target_hz`.
pub fn clock_divider(base_hz: u32, target_hz: u32) -> (u16, u32) {
    if target_hz == 0 || base_hz == 0 {
        return (clock::DIVIDER_MAX, base_hz / (2 * clock::DIVIDER_MAX as u32).max(1));
    }
    if target_hz >= base_hz {
        return (0, base_hz);
    }
    let n = base_hz.div_ceil(2 * target_hz).min(clock::DIVIDER_MAX as u32);
    (n as u16, base_hz / (2 * n))
}

/// Borrowed view of a register window with typed accessors
#[derive(Clone, Copy)]
pub struct Regs<'a> {
    block: &'a dyn RegisterBlock,
}

impl<'a> Regs<'a> {
    pub fn new(block: &'a dyn RegisterBlock) -> Self {
        Self { block }
    }

    pub fn raw(&self) -> &'a dyn RegisterBlock {
        self.block
    }

    pub fn set_dma_address(&self, addr: u32) {
        self.block.write32(reg::DMA_ADDRESS, addr);
    }

    pub fn set_argument2(&self, arg: u32) {
        self.block.write32(reg::ARGUMENT2, arg);
    }

    /// Programs block size and SDMA boundary; `boundary` is in bytes (4 KiB to 512 KiB)
    pub fn set_block_size(&self, size: usize, boundary: usize) {
        let code = (boundary / 4096).max(1).trailing_zeros() as u16;
        self.block
            .write16(reg::BLOCK_SIZE, ((code & 0x7) << 12) | (size as u16 & 0x0FFF));
    }

    pub fn set_block_count(&self, count: u16) {
        self.block.write16(reg::BLOCK_COUNT, count);
    }

    pub fn set_argument(&self, arg: u32) {
        self.block.write32(reg::ARGUMENT, arg);
    }

    pub fn set_transfer_mode(&self, mode: TransferModeFlags) {
        self.block.write16(reg::TRANSFER_MODE, mode.bits());
    }

    /// Writing the command register starts the command on the bus
    pub fn set_command(&self, word: u16) {
        self.block.write16(reg::COMMAND, word);
    }

    pub fn response(&self) -> [u32; 4] {
        [
            self.block.read32(reg::RESPONSE0),
            self.block.read32(reg::RESPONSE1),
            self.block.read32(reg::RESPONSE2),
            self.block.read32(reg::RESPONSE3),
        ]
    }

    pub fn read_buffer(&self) -> u32 {
        self.block.read32(reg::BUFFER)
    }

    pub fn write_buffer(&self, word: u32) {
        self.block.write32(reg::BUFFER, word);
    }

    pub fn present_state(&self) -> PresentState {
        PresentState::from_bits_retain(self.block.read32(reg::PRESENT_STATE))
    }

    pub fn host_control(&self) -> u8 {
        self.block.read8(reg::HOST_CONTROL)
    }

    pub fn set_host_control(&self, value: u8) {
        self.block.write8(reg::HOST_CONTROL, value);
    }

    pub fn set_bus_width(&self, width: BusWidth) {
        let mut ctrl = self.host_control() & !(host_control::BUS_WIDTH_4 | host_control::BUS_WIDTH_8);
        match width {
            BusWidth::One => {}
            BusWidth::Four => ctrl |= host_control::BUS_WIDTH_4,
            BusWidth::Eight => ctrl |= host_control::BUS_WIDTH_8,
        }
        self.set_host_control(ctrl);
    }

    pub fn set_high_speed(&self, enable: bool) {
        let ctrl = self.host_control() & !host_control::HIGH_SPEED;
        self.set_host_control(if enable { ctrl | host_control::HIGH_SPEED } else { ctrl });
    }

    pub fn set_dma_select(&self, select: u8) {
        let ctrl = self.host_control() & !host_control::DMA_MASK;
        self.set_host_control(ctrl | (select & host_control::DMA_MASK));
    }

    pub fn power_control(&self) -> u8 {
        self.block.read8(reg::POWER_CONTROL)
    }

    pub fn set_power_control(&self, value: u8) {
        self.block.write8(reg::POWER_CONTROL, value);
    }

    pub fn clock_control(&self) -> u16 {
        self.block.read16(reg::CLOCK_CONTROL)
    }

    pub fn set_clock_control(&self, value: u16) {
        self.block.write16(reg::CLOCK_CONTROL, value);
    }

    pub fn set_timeout_control(&self, value: u8) {
        self.block.write8(reg::TIMEOUT_CONTROL, value);
    }

    pub fn software_reset(&self) -> ResetFlags {
        ResetFlags::from_bits_truncate(self.block.read8(reg::SOFTWARE_RESET))
    }

    pub fn set_software_reset(&self, flags: ResetFlags) {
        self.block.write8(reg::SOFTWARE_RESET, flags.bits());
    }

    pub fn int_status(&self) -> IrqStatus {
        IrqStatus::from_bits_retain(self.block.read32(reg::INT_STATUS))
    }

    /// Write-one-to-clear
    pub fn clear_int_status(&self, status: IrqStatus) {
        self.block.write32(reg::INT_STATUS, status.bits());
    }

    pub fn int_enable(&self) -> IrqStatus {
        IrqStatus::from_bits_retain(self.block.read32(reg::INT_ENABLE))
    }

    pub fn signal_enable(&self) -> IrqStatus {
        IrqStatus::from_bits_retain(self.block.read32(reg::SIGNAL_ENABLE))
    }

    pub fn set_int_enable(&self, status: IrqStatus) {
        self.block.write32(reg::INT_ENABLE, status.bits());
    }

    pub fn set_signal_enable(&self, status: IrqStatus) {
        self.block.write32(reg::SIGNAL_ENABLE, status.bits());
    }

    pub fn auto_cmd_status(&self) -> u16 {
        self.block.read16(reg::AUTO_CMD_STATUS)
    }

    pub fn host_control2(&self) -> u16 {
        self.block.read16(reg::HOST_CONTROL2)
    }

    pub fn set_host_control2(&self, value: u16) {
        self.block.write16(reg::HOST_CONTROL2, value);
    }

    pub fn set_uhs_mode(&self, mode: u16) {
        let ctrl = self.host_control2() & !host_control2::UHS_MASK;
        self.set_host_control2(ctrl | (mode & host_control2::UHS_MASK));
    }

    pub fn set_driver_type(&self, driver: u8) {
        let ctrl = self.host_control2() & !host_control2::DRIVER_MASK;
        self.set_host_control2(
            ctrl | ((driver as u16) << host_control2::DRIVER_SHIFT & host_control2::DRIVER_MASK),
        );
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            raw: self.block.read32(reg::CAPABILITIES),
            raw1: self.block.read32(reg::CAPABILITIES_1),
            max_current: self.block.read32(reg::MAX_CURRENT),
        }
    }

    pub fn adma_error(&self) -> u8 {
        self.block.read8(reg::ADMA_ERROR)
    }

    pub fn set_adma_address(&self, addr: u32) {
        self.block.write32(reg::ADMA_ADDRESS, addr);
    }

    pub fn host_version(&self) -> u16 {
        self.block.read16(reg::HOST_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divider_never_overshoots() {
        let base = 200_000_000;
        for target in [400_000, 25_000_000, 26_000_000, 50_000_000, 52_000_000, 100_000_000] {
            let (n, actual) = clock_divider(base, target);
            assert!(actual <= target, "{} -> {}", target, actual);
            assert!(n > 0);
        }
        assert_eq!(clock_divider(base, 208_000_000), (0, base));
        assert_eq!(clock_divider(base, 400_000), (250, 400_000));
    }

    #[test]
    fn divider_saturates_for_tiny_clocks() {
        let (n, _) = clock_divider(200_000_000, 1);
        assert_eq!(n, clock::DIVIDER_MAX);
    }

    #[test]
    fn capabilities_decode() {
        let caps = Capabilities {
            raw: (200 << caps::BASE_CLOCK_SHIFT) | (2 << caps::MAX_BLOCK_SHIFT) | caps::ADMA2,
            raw1: caps1::SDR104 | (3 << caps1::RETUNE_TIMER_SHIFT),
            max_current: 0x0032_00C8,
        };
        assert_eq!(caps.base_clock_hz(), 200_000_000);
        assert_eq!(caps.max_block_len(), 2048);
        assert!(caps.adma2() && !caps.sdma());
        assert!(caps.sdr104() && !caps.sdr50());
        assert_eq!(caps.retune_period(), Some(Duration::from_secs(4)));
        assert_eq!(caps.max_current_ma(3300), 800);
        assert_eq!(caps.max_current_ma(1800), 200);
    }
}
