//! Simulator configuration: what the controller advertises and which card
//! sits in the slot.

use std::path::PathBuf;

use clap::ValueEnum;
use sdhc_hw::mmio::sdhc::{caps, caps1, max_current, version};

/// Card families the model can impersonate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum CardKind {
    /// Standard-capacity SD, byte addressed, CSD version 1
    Sdsc,
    /// High-capacity SD
    Sdhc,
    /// Extended-capacity SD (over 32 GiB)
    Sdxc,
    /// Removable MMC, byte addressed
    Mmc,
    /// Embedded MMC in sector mode with boot and RPMB partitions
    Emmc,
    /// I/O-only SDIO card with one function
    Sdio,
}

impl CardKind {
    pub fn is_sd(self) -> bool {
        matches!(self, CardKind::Sdsc | CardKind::Sdhc | CardKind::Sdxc)
    }

    pub fn is_mmc(self) -> bool {
        matches!(self, CardKind::Mmc | CardKind::Emmc)
    }

    pub fn is_sdio(self) -> bool {
        self == CardKind::Sdio
    }

    pub fn high_capacity(self) -> bool {
        matches!(self, CardKind::Sdhc | CardKind::Sdxc | CardKind::Emmc)
    }

    fn default_blocks(self) -> u64 {
        match self {
            CardKind::Sdsc => 256 * 2048,
            CardKind::Sdhc => 4 * 1024 * 2048,
            CardKind::Sdxc => 64 * 1024 * 2048,
            CardKind::Mmc => 128 * 2048,
            CardKind::Emmc => 64 * 2048,
            CardKind::Sdio => 0,
        }
    }
}

/// Identity and behaviour of the simulated card
#[derive(Debug, Clone)]
pub struct CardConfig {
    pub kind: CardKind,
    /// User-area capacity in 512-byte blocks; ignored with an image file
    pub capacity_blocks: u64,
    /// Back the user area with this file instead of RAM
    pub image: Option<PathBuf>,
    /// Open the image read-only
    pub read_only_image: bool,
    /// Advertise 1.8 V signalling (SD S18A, SDIO S18A) or HS200 (eMMC)
    pub uhs: bool,
    /// SD cards: accept CMD23
    pub cmd23: bool,
    /// Operation-condition polls answered busy before the card is ready
    pub ready_polls: u32,
    /// CMD13 polls answered in the programming state after a write, erase
    /// or switch
    pub program_polls: u32,
    pub serial: u32,
    /// SD cards: embedded SD with one queryable partition (CMD45)
    pub esd: bool,
}

impl CardConfig {
    pub fn new(kind: CardKind) -> Self {
        Self {
            kind,
            capacity_blocks: kind.default_blocks(),
            image: None,
            read_only_image: false,
            uhs: true,
            cmd23: kind != CardKind::Sdsc,
            ready_polls: 2,
            program_polls: 1,
            serial: 0x1234_5678,
            esd: false,
        }
    }

    pub fn capacity_blocks(mut self, blocks: u64) -> Self {
        self.capacity_blocks = blocks;
        self
    }

    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(path.into());
        self
    }

    pub fn uhs(mut self, uhs: bool) -> Self {
        self.uhs = uhs;
        self
    }

    pub fn esd(mut self, esd: bool) -> Self {
        self.esd = esd;
        self
    }
}

/// What the controller reports in CAPABILITIES, MAX_CURRENT and HOST_VERSION
#[derive(Debug, Clone)]
pub struct ControllerCaps {
    pub base_clock_mhz: u8,
    /// 512, 1024 or 2048
    pub max_block_len: u16,
    pub bus_8bit: bool,
    pub sdma: bool,
    pub adma2: bool,
    pub high_speed: bool,
    pub suspend_resume: bool,
    pub voltage_3v3: bool,
    pub voltage_3v0: bool,
    pub voltage_1v8: bool,
    pub sdr50: bool,
    pub sdr104: bool,
    pub ddr50: bool,
    pub sdr50_tuning: bool,
    /// Re-tuning timer count field; 0 disables the timer
    pub retune_timer: u8,
    /// Per-rail current limit
    pub max_current_ma: u32,
}

impl Default for ControllerCaps {
    fn default() -> Self {
        Self {
            base_clock_mhz: 200,
            max_block_len: 2048,
            bus_8bit: true,
            sdma: true,
            adma2: true,
            high_speed: true,
            suspend_resume: true,
            voltage_3v3: true,
            voltage_3v0: false,
            voltage_1v8: true,
            sdr50: true,
            sdr104: true,
            ddr50: true,
            sdr50_tuning: false,
            retune_timer: 0,
            max_current_ma: 800,
        }
    }
}

impl ControllerCaps {
    /// Legacy controller: 3.3 V only, no UHS, no 8-bit bus
    pub fn legacy() -> Self {
        Self {
            bus_8bit: false,
            voltage_1v8: false,
            sdr50: false,
            sdr104: false,
            ddr50: false,
            ..Self::default()
        }
    }

    pub fn capabilities(&self) -> u32 {
        let mut raw = 50 | caps::TIMEOUT_CLOCK_MHZ;
        raw |= (self.base_clock_mhz as u32) << caps::BASE_CLOCK_SHIFT;
        let code = match self.max_block_len {
            0..=512 => 0,
            513..=1024 => 1,
            _ => 2,
        };
        raw |= code << caps::MAX_BLOCK_SHIFT;
        let flags = [
            (self.bus_8bit, caps::BUS_8BIT),
            (self.adma2, caps::ADMA2),
            (self.high_speed, caps::HIGH_SPEED),
            (self.sdma, caps::SDMA),
            (self.suspend_resume, caps::SUSPEND_RESUME),
            (self.voltage_3v3, caps::VOLTAGE_3V3),
            (self.voltage_3v0, caps::VOLTAGE_3V0),
            (self.voltage_1v8, caps::VOLTAGE_1V8),
        ];
        for (on, bit) in flags {
            if on {
                raw |= bit;
            }
        }
        raw
    }

    pub fn capabilities_1(&self) -> u32 {
        let mut raw = ((self.retune_timer as u32) << caps1::RETUNE_TIMER_SHIFT) & caps1::RETUNE_TIMER_MASK;
        let flags = [
            (self.sdr50, caps1::SDR50),
            (self.sdr104, caps1::SDR104),
            (self.ddr50, caps1::DDR50),
            (self.sdr50_tuning, caps1::SDR50_TUNING),
        ];
        for (on, bit) in flags {
            if on {
                raw |= bit;
            }
        }
        if self.voltage_1v8 {
            raw |= caps1::DRIVER_TYPE_A | caps1::DRIVER_TYPE_C | caps1::DRIVER_TYPE_D;
        }
        raw
    }

    pub fn max_current(&self) -> u32 {
        let units = (self.max_current_ma / max_current::MA_PER_UNIT).min(0xFF);
        (units << max_current::V3_3_SHIFT) | (units << max_current::V3_0_SHIFT) | (units << max_current::V1_8_SHIFT)
    }

    pub fn host_version(&self) -> u16 {
        version::SPEC_3_00 | (0x10 << version::VENDOR_SHIFT)
    }
}

/// One simulated slot
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub caps: ControllerCaps,
    /// Card inserted at power-up
    pub card: Option<CardConfig>,
    /// Tuning blocks the card must see before the sampling point settles
    pub tuning_blocks: u32,
    /// Mechanical write-protect switch on the socket
    pub write_protect_switch: bool,
}

impl SimConfig {
    pub fn with_card(kind: CardKind) -> Self {
        Self {
            caps: ControllerCaps::default(),
            card: Some(CardConfig::new(kind)),
            tuning_blocks: 4,
            write_protect_switch: false,
        }
    }

    pub fn empty_slot() -> Self {
        Self {
            card: None,
            ..Self::with_card(CardKind::Sdhc)
        }
    }

    pub fn card(mut self, card: CardConfig) -> Self {
        self.card = Some(card);
        self
    }

    pub fn caps(mut self, caps: ControllerCaps) -> Self {
        self.caps = caps;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_caps_encode_base_clock_and_uhs() {
        let c = ControllerCaps::default();
        let raw = c.capabilities();
        assert_eq!((raw & caps::BASE_CLOCK_MASK) >> caps::BASE_CLOCK_SHIFT, 200);
        assert_eq!((raw & caps::MAX_BLOCK_MASK) >> caps::MAX_BLOCK_SHIFT, 2);
        assert_ne!(raw & caps::VOLTAGE_1V8, 0);
        assert_eq!(c.capabilities_1() & 7, 7);
        assert_eq!(c.max_current() & 0xFF, 200);
    }

    #[test]
    fn legacy_caps_drop_uhs() {
        let c = ControllerCaps::legacy();
        assert_eq!(c.capabilities() & caps::VOLTAGE_1V8, 0);
        assert_eq!(c.capabilities_1() & 7, 0);
    }
}
