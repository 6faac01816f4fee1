//! SD host controller register block (SDHC 3.0 layout).
//!
//! # References
//! - SD Host Controller Simplified Specification, version 3.00
//! - Linux `drivers/mmc/host/sdhci.h`

/// Size of one slot's register window
pub const WINDOW_SIZE: u32 = 0x100;

/// Register offsets (relative to the slot base)
pub mod registers {
    /// SDMA system address; doubles as argument 2 for auto-CMD23
    pub const DMA_ADDRESS: u32 = 0x00;
    /// Argument 2 (alias of `DMA_ADDRESS`)
    pub const ARGUMENT2: u32 = 0x00;

    /// Block size: transfer block size in bits 11:0, SDMA buffer boundary in bits 14:12
    pub const BLOCK_SIZE: u32 = 0x04;

    /// Block count for the current transfer
    pub const BLOCK_COUNT: u32 = 0x06;

    /// Command argument
    pub const ARGUMENT: u32 = 0x08;

    /// Transfer mode
    pub const TRANSFER_MODE: u32 = 0x0C;

    /// Command register; writing the upper byte issues the command
    pub const COMMAND: u32 = 0x0E;

    /// Response registers (4 × 32 bits)
    pub const RESPONSE0: u32 = 0x10;
    pub const RESPONSE1: u32 = 0x14;
    pub const RESPONSE2: u32 = 0x18;
    pub const RESPONSE3: u32 = 0x1C;

    /// Buffer data port
    pub const BUFFER: u32 = 0x20;

    /// Present state
    pub const PRESENT_STATE: u32 = 0x24;

    /// Host control 1
    pub const HOST_CONTROL: u32 = 0x28;

    /// Power control
    pub const POWER_CONTROL: u32 = 0x29;

    /// Block gap control
    pub const BLOCK_GAP_CONTROL: u32 = 0x2A;

    /// Wakeup control
    pub const WAKEUP_CONTROL: u32 = 0x2B;

    /// Clock control
    pub const CLOCK_CONTROL: u32 = 0x2C;

    /// Data timeout control
    pub const TIMEOUT_CONTROL: u32 = 0x2E;

    /// Software reset
    pub const SOFTWARE_RESET: u32 = 0x2F;

    /// Normal interrupt status (write 1 to clear)
    pub const INT_STATUS: u32 = 0x30;

    /// Error interrupt status (write 1 to clear)
    pub const ERR_STATUS: u32 = 0x32;

    /// Normal interrupt status enable
    pub const INT_ENABLE: u32 = 0x34;

    /// Error interrupt status enable
    pub const ERR_ENABLE: u32 = 0x36;

    /// Normal interrupt signal enable
    pub const SIGNAL_ENABLE: u32 = 0x38;

    /// Error interrupt signal enable
    pub const ERR_SIGNAL_ENABLE: u32 = 0x3A;

    /// Auto CMD error status
    pub const AUTO_CMD_STATUS: u32 = 0x3C;

    /// Host control 2
    pub const HOST_CONTROL2: u32 = 0x3E;

    /// Capabilities (low word)
    pub const CAPABILITIES: u32 = 0x40;

    /// Capabilities (high word, SD 3.0 fields)
    pub const CAPABILITIES_1: u32 = 0x44;

    /// Maximum current capabilities
    pub const MAX_CURRENT: u32 = 0x48;

    /// ADMA error status
    pub const ADMA_ERROR: u32 = 0x54;

    /// ADMA system address
    pub const ADMA_ADDRESS: u32 = 0x58;

    /// Boot data timeout counter
    pub const BOOT_TIMEOUT: u32 = 0x70;

    /// Shared bus control
    pub const SHARED_BUS: u32 = 0xE0;

    /// Slot interrupt status
    pub const SLOT_INT_STATUS: u32 = 0xFC;

    /// Host controller version
    pub const HOST_VERSION: u32 = 0xFE;
}

/// Transfer mode register bits
pub mod transfer_mode {
    pub const DMA_ENABLE: u16 = 1 << 0;
    pub const BLOCK_COUNT_ENABLE: u16 = 1 << 1;
    pub const AUTO_CMD12: u16 = 1 << 2;
    pub const AUTO_CMD23: u16 = 1 << 3;
    /// Data direction: set for card-to-host
    pub const READ: u16 = 1 << 4;
    pub const MULTI_BLOCK: u16 = 1 << 5;
}

/// Command register layout
pub mod command {
    /// Response type field (bits 1:0)
    pub const RESP_MASK: u16 = 0x0003;
    pub const RESP_NONE: u16 = 0x0000;
    pub const RESP_LONG: u16 = 0x0001;
    pub const RESP_SHORT: u16 = 0x0002;
    pub const RESP_SHORT_BUSY: u16 = 0x0003;

    pub const CRC_CHECK: u16 = 1 << 3;
    pub const INDEX_CHECK: u16 = 1 << 4;
    pub const DATA_PRESENT: u16 = 1 << 5;

    /// Command type field (bits 7:6)
    pub const TYPE_MASK: u16 = 0x00C0;
    pub const TYPE_NORMAL: u16 = 0x0000;
    pub const TYPE_SUSPEND: u16 = 0x0040;
    pub const TYPE_RESUME: u16 = 0x0080;
    pub const TYPE_ABORT: u16 = 0x00C0;

    /// Command index occupies bits 13:8
    pub const INDEX_SHIFT: u16 = 8;
    pub const INDEX_MASK: u16 = 0x3F;
}

/// Present state register bits
pub mod present_state {
    pub const CMD_INHIBIT: u32 = 1 << 0;
    pub const DATA_INHIBIT: u32 = 1 << 1;
    pub const DATA_ACTIVE: u32 = 1 << 2;
    pub const RETUNING_REQUEST: u32 = 1 << 3;
    pub const WRITE_ACTIVE: u32 = 1 << 8;
    pub const READ_ACTIVE: u32 = 1 << 9;
    pub const BUFFER_WRITE_ENABLE: u32 = 1 << 10;
    pub const BUFFER_READ_ENABLE: u32 = 1 << 11;
    pub const CARD_INSERTED: u32 = 1 << 16;
    pub const CARD_STABLE: u32 = 1 << 17;
    pub const CARD_DETECT_LEVEL: u32 = 1 << 18;
    /// Write protect switch level (set = writes allowed)
    pub const WRITE_PROTECT_LEVEL: u32 = 1 << 19;
    /// DAT[3:0] line levels (bits 23:20)
    pub const DAT_LEVEL_SHIFT: u32 = 20;
    pub const DAT_LEVEL_MASK: u32 = 0xF << 20;
    pub const CMD_LEVEL: u32 = 1 << 24;
}

/// Host control 1 register bits
pub mod host_control {
    pub const LED: u8 = 1 << 0;
    pub const BUS_WIDTH_4: u8 = 1 << 1;
    pub const HIGH_SPEED: u8 = 1 << 2;
    /// DMA select field (bits 4:3)
    pub const DMA_MASK: u8 = 0x18;
    pub const DMA_SDMA: u8 = 0x00;
    pub const DMA_ADMA1: u8 = 0x08;
    pub const DMA_ADMA2_32: u8 = 0x10;
    pub const DMA_ADMA2_64: u8 = 0x18;
    pub const BUS_WIDTH_8: u8 = 1 << 5;
    pub const CARD_DETECT_TEST: u8 = 1 << 6;
    pub const CARD_DETECT_SIGNAL: u8 = 1 << 7;
}

/// Power control register bits
pub mod power {
    pub const BUS_POWER_ON: u8 = 1 << 0;
    /// Voltage select field (bits 3:1)
    pub const VOLTAGE_MASK: u8 = 0x0E;
    pub const VOLTAGE_1V8: u8 = 0x0A;
    pub const VOLTAGE_3V0: u8 = 0x0C;
    pub const VOLTAGE_3V3: u8 = 0x0E;
}

/// Clock control register bits
pub mod clock {
    pub const INTERNAL_ENABLE: u16 = 1 << 0;
    pub const INTERNAL_STABLE: u16 = 1 << 1;
    pub const SD_CLOCK_ENABLE: u16 = 1 << 2;
    pub const PROGRAMMABLE_MODE: u16 = 1 << 5;
    /// Upper two bits of the 10-bit divider live in bits 7:6
    pub const DIVIDER_HI_SHIFT: u16 = 6;
    pub const DIVIDER_HI_MASK: u16 = 0x00C0;
    /// Lower eight bits of the 10-bit divider live in bits 15:8
    pub const DIVIDER_LO_SHIFT: u16 = 8;
    pub const DIVIDER_MAX: u16 = 0x3FF;
}

/// Software reset register bits
pub mod reset {
    pub const ALL: u8 = 1 << 0;
    pub const CMD_LINE: u8 = 1 << 1;
    pub const DATA_LINE: u8 = 1 << 2;
}

/// Interrupt status bits, as seen through a 32-bit read of `INT_STATUS`
/// (normal interrupts in the low half, error interrupts in the high half)
pub mod int_status {
    pub const COMMAND_COMPLETE: u32 = 1 << 0;
    pub const TRANSFER_COMPLETE: u32 = 1 << 1;
    pub const BLOCK_GAP: u32 = 1 << 2;
    pub const DMA_INTERRUPT: u32 = 1 << 3;
    pub const BUFFER_WRITE_READY: u32 = 1 << 4;
    pub const BUFFER_READ_READY: u32 = 1 << 5;
    pub const CARD_INSERTION: u32 = 1 << 6;
    pub const CARD_REMOVAL: u32 = 1 << 7;
    pub const CARD_INTERRUPT: u32 = 1 << 8;
    pub const RETUNING_EVENT: u32 = 1 << 12;
    pub const BOOT_ACK: u32 = 1 << 13;
    pub const BOOT_TERMINATE: u32 = 1 << 14;
    /// Summary bit: any error interrupt is pending
    pub const ERROR: u32 = 1 << 15;

    pub const COMMAND_TIMEOUT: u32 = 1 << 16;
    pub const COMMAND_CRC: u32 = 1 << 17;
    pub const COMMAND_END_BIT: u32 = 1 << 18;
    pub const COMMAND_INDEX: u32 = 1 << 19;
    pub const DATA_TIMEOUT: u32 = 1 << 20;
    pub const DATA_CRC: u32 = 1 << 21;
    pub const DATA_END_BIT: u32 = 1 << 22;
    pub const CURRENT_LIMIT: u32 = 1 << 23;
    pub const AUTO_CMD: u32 = 1 << 24;
    pub const ADMA: u32 = 1 << 25;
    pub const TUNING: u32 = 1 << 26;

    /// Command-group error bits
    pub const COMMAND_ERRORS: u32 = COMMAND_TIMEOUT | COMMAND_CRC | COMMAND_END_BIT | COMMAND_INDEX;

    /// Data-group error bits
    pub const DATA_ERRORS: u32 =
        DATA_TIMEOUT | DATA_CRC | DATA_END_BIT | CURRENT_LIMIT | AUTO_CMD | ADMA | TUNING;

    /// Everything the driver enables by default
    pub const DEFAULT_ENABLE: u32 = COMMAND_COMPLETE
        | TRANSFER_COMPLETE
        | DMA_INTERRUPT
        | BUFFER_WRITE_READY
        | BUFFER_READ_READY
        | CARD_INSERTION
        | CARD_REMOVAL
        | RETUNING_EVENT
        | COMMAND_ERRORS
        | DATA_ERRORS;
}

/// Auto CMD error status bits
pub mod auto_cmd_status {
    pub const NOT_EXECUTED: u16 = 1 << 0;
    pub const TIMEOUT: u16 = 1 << 1;
    pub const CRC: u16 = 1 << 2;
    pub const END_BIT: u16 = 1 << 3;
    pub const INDEX: u16 = 1 << 4;
    pub const NOT_ISSUED: u16 = 1 << 7;
}

/// Host control 2 register bits
pub mod host_control2 {
    /// UHS mode select field (bits 2:0)
    pub const UHS_MASK: u16 = 0x0007;
    pub const UHS_SDR12: u16 = 0;
    pub const UHS_SDR25: u16 = 1;
    pub const UHS_SDR50: u16 = 2;
    pub const UHS_SDR104: u16 = 3;
    pub const UHS_DDR50: u16 = 4;
    pub const SIGNALING_1V8: u16 = 1 << 3;
    /// Driver strength select field (bits 5:4)
    pub const DRIVER_MASK: u16 = 0x0030;
    pub const DRIVER_SHIFT: u16 = 4;
    pub const EXECUTE_TUNING: u16 = 1 << 6;
    pub const SAMPLING_CLOCK_SELECT: u16 = 1 << 7;
    pub const ASYNC_INTERRUPT: u16 = 1 << 14;
    pub const PRESET_VALUE: u16 = 1 << 15;
}

/// Capabilities register bits (low word)
pub mod caps {
    pub const TIMEOUT_CLOCK_MASK: u32 = 0x3F;
    pub const TIMEOUT_CLOCK_MHZ: u32 = 1 << 7;
    /// Base clock in MHz (bits 15:8)
    pub const BASE_CLOCK_SHIFT: u32 = 8;
    pub const BASE_CLOCK_MASK: u32 = 0xFF << 8;
    /// Max block length code (bits 17:16): 0 = 512, 1 = 1024, 2 = 2048
    pub const MAX_BLOCK_SHIFT: u32 = 16;
    pub const MAX_BLOCK_MASK: u32 = 0x3 << 16;
    pub const BUS_8BIT: u32 = 1 << 18;
    pub const ADMA2: u32 = 1 << 19;
    pub const HIGH_SPEED: u32 = 1 << 21;
    pub const SDMA: u32 = 1 << 22;
    pub const SUSPEND_RESUME: u32 = 1 << 23;
    pub const VOLTAGE_3V3: u32 = 1 << 24;
    pub const VOLTAGE_3V0: u32 = 1 << 25;
    pub const VOLTAGE_1V8: u32 = 1 << 26;
    pub const BUS_64BIT: u32 = 1 << 28;
}

/// Capabilities register bits (high word)
pub mod caps1 {
    pub const SDR50: u32 = 1 << 0;
    pub const SDR104: u32 = 1 << 1;
    pub const DDR50: u32 = 1 << 2;
    pub const DRIVER_TYPE_A: u32 = 1 << 4;
    pub const DRIVER_TYPE_C: u32 = 1 << 5;
    pub const DRIVER_TYPE_D: u32 = 1 << 6;
    /// Re-tuning timer count (bits 11:8); 0 disables the timer
    pub const RETUNE_TIMER_SHIFT: u32 = 8;
    pub const RETUNE_TIMER_MASK: u32 = 0xF << 8;
    pub const SDR50_TUNING: u32 = 1 << 13;
    /// Re-tuning modes (bits 15:14)
    pub const RETUNE_MODE_SHIFT: u32 = 14;
    pub const RETUNE_MODE_MASK: u32 = 0x3 << 14;
}

/// Maximum current register fields, 4 mA units
pub mod max_current {
    pub const MA_PER_UNIT: u32 = 4;
    pub const V3_3_SHIFT: u32 = 0;
    pub const V3_0_SHIFT: u32 = 8;
    pub const V1_8_SHIFT: u32 = 16;
}

/// ADMA error status fields
pub mod adma_error {
    pub const STATE_MASK: u8 = 0x03;
    pub const LENGTH_MISMATCH: u8 = 1 << 2;
}

/// ADMA2 descriptor attribute bits
pub mod adma2 {
    /// Size of one 32-bit-address descriptor in bytes
    pub const DESCRIPTOR_SIZE: usize = 8;
    /// Largest length a single descriptor can carry (encoded as 0)
    pub const MAX_SEGMENT: usize = 65536;

    pub const VALID: u16 = 1 << 0;
    pub const END: u16 = 1 << 1;
    pub const INT: u16 = 1 << 2;
    /// Action field (bits 5:4)
    pub const ACT_MASK: u16 = 0x3 << 4;
    pub const ACT_NOP: u16 = 0 << 4;
    pub const ACT_RSV: u16 = 1 << 4;
    pub const ACT_TRAN: u16 = 2 << 4;
    pub const ACT_LINK: u16 = 3 << 4;
}

/// Host version register fields
pub mod version {
    pub const SPEC_MASK: u16 = 0x00FF;
    pub const SPEC_1_00: u16 = 0;
    pub const SPEC_2_00: u16 = 1;
    pub const SPEC_3_00: u16 = 2;
    pub const VENDOR_SHIFT: u16 = 8;
}
