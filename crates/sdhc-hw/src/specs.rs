/// Bus clock frequencies
pub mod clock {
    /// Card identification clock (400 kHz)
    pub const IDENTIFICATION_HZ: u32 = 400_000;

    /// SD default speed (25 MHz)
    pub const SD_DEFAULT_HZ: u32 = 25_000_000;

    /// SD high speed / SDR25 (50 MHz)
    pub const SD_HIGH_SPEED_HZ: u32 = 50_000_000;

    /// UHS-I SDR50 (100 MHz)
    pub const SDR50_HZ: u32 = 100_000_000;

    /// UHS-I SDR104 (208 MHz)
    pub const SDR104_HZ: u32 = 208_000_000;

    /// UHS-I DDR50 (50 MHz, both edges)
    pub const DDR50_HZ: u32 = 50_000_000;

    /// MMC legacy (26 MHz)
    pub const MMC_LEGACY_HZ: u32 = 26_000_000;

    /// MMC high speed (52 MHz)
    pub const MMC_HIGH_SPEED_HZ: u32 = 52_000_000;

    /// eMMC HS200 (200 MHz)
    pub const HS200_HZ: u32 = 200_000_000;
}

/// Block geometry
pub mod block {
    /// Standard sector size
    pub const SIZE: usize = 512;

    /// Largest block size the block-size register can describe
    pub const MAX_SIZE: usize = 2048;

    /// Largest value of the 16-bit block count register
    pub const MAX_COUNT: u32 = 0xFFFF;

    /// Default SDMA buffer boundary (4 KiB, encoded as 0)
    pub const SDMA_BOUNDARY: usize = 4096;
}

/// Signal voltages in millivolts
pub mod voltage {
    pub const V3_3_MV: u32 = 3300;
    pub const V3_0_MV: u32 = 3000;
    pub const V1_8_MV: u32 = 1800;
}

/// Standard tuning block for a 4-bit bus (CMD19 and CMD21 on a 4-bit bus)
pub const TUNING_BLOCK_4BIT: [u8; 64] = [
    0xFF, 0x0F, 0xFF, 0x00, 0xFF, 0xCC, 0xC3, 0xCC, 0xC3, 0x3C, 0xCC, 0xFF, 0xFE, 0xFF, 0xFE, 0xEF,
    0xFF, 0xDF, 0xFF, 0xDD, 0xFF, 0xFB, 0xFF, 0xFB, 0xBF, 0xFF, 0x7F, 0xFF, 0x77, 0xF7, 0xBD, 0xEF,
    0xFF, 0xF0, 0xFF, 0xF0, 0x0F, 0xFC, 0xCC, 0x3C, 0xCC, 0x33, 0xCC, 0xCF, 0xFF, 0xEF, 0xFF, 0xEE,
    0xFF, 0xFD, 0xFF, 0xFD, 0xDF, 0xFF, 0xBF, 0xFF, 0xBB, 0xFF, 0xF7, 0xFF, 0xF7, 0x7F, 0x7B, 0xDE,
];

/// Standard tuning block for an 8-bit bus (CMD21)
pub const TUNING_BLOCK_8BIT: [u8; 128] = [
    0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xCC, 0xCC, 0xCC, 0x33, 0xCC, 0xCC,
    0xCC, 0x33, 0x33, 0xCC, 0xCC, 0xCC, 0xFF, 0xFF, 0xFF, 0xEE, 0xFF, 0xFF, 0xFF, 0xEE, 0xEE, 0xFF,
    0xFF, 0xFF, 0xDD, 0xFF, 0xFF, 0xFF, 0xDD, 0xDD, 0xFF, 0xFF, 0xFF, 0xBB, 0xFF, 0xFF, 0xFF, 0xBB,
    0xBB, 0xFF, 0xFF, 0xFF, 0x77, 0xFF, 0xFF, 0xFF, 0x77, 0x77, 0xFF, 0x77, 0xBB, 0xDD, 0xEE, 0xFF,
    0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xCC, 0xCC, 0xCC, 0x33, 0xCC,
    0xCC, 0xCC, 0x33, 0x33, 0xCC, 0xCC, 0xCC, 0xFF, 0xFF, 0xFF, 0xEE, 0xFF, 0xFF, 0xFF, 0xEE, 0xEE,
    0xFF, 0xFF, 0xFF, 0xDD, 0xFF, 0xFF, 0xFF, 0xDD, 0xDD, 0xFF, 0xFF, 0xFF, 0xBB, 0xFF, 0xFF, 0xFF,
    0xBB, 0xBB, 0xFF, 0xFF, 0xFF, 0x77, 0xFF, 0xFF, 0xFF, 0x77, 0x77, 0xFF, 0x77, 0xBB, 0xDD, 0xEE,
];
