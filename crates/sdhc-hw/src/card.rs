//! Card-side protocol constants: command indices, response fields and card registers.
//!
//! # References
//! - SD Physical Layer Simplified Specification, version 3.01
//! - SDIO Simplified Specification, version 3.00
//! - JEDEC JESD84-B51 (eMMC 5.1)

/// Command indices
pub mod opcode {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const SEND_OP_COND: u8 = 1;
    pub const ALL_SEND_CID: u8 = 2;
    /// SD: SEND_RELATIVE_ADDR (R6); MMC: SET_RELATIVE_ADDR (R1)
    pub const SET_RELATIVE_ADDR: u8 = 3;
    pub const SET_DSR: u8 = 4;
    /// SDIO: IO_SEND_OP_COND (R4); MMC: SLEEP_AWAKE (R1b)
    pub const IO_SEND_OP_COND: u8 = 5;
    pub const SLEEP_AWAKE: u8 = 5;
    /// SD: SWITCH_FUNC (adtc, R1); MMC: SWITCH (R1b)
    pub const SWITCH: u8 = 6;
    pub const SELECT_CARD: u8 = 7;
    /// SD: SEND_IF_COND (R7); MMC: SEND_EXT_CSD (adtc, R1)
    pub const SEND_IF_COND: u8 = 8;
    pub const SEND_EXT_CSD: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const SEND_CID: u8 = 10;
    pub const VOLTAGE_SWITCH: u8 = 11;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SEND_STATUS: u8 = 13;
    pub const GO_INACTIVE_STATE: u8 = 15;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const SEND_TUNING_BLOCK: u8 = 19;
    pub const SEND_TUNING_BLOCK_HS200: u8 = 21;
    pub const SET_BLOCK_COUNT: u8 = 23;
    pub const WRITE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const PROGRAM_CSD: u8 = 27;
    pub const SET_WRITE_PROT: u8 = 28;
    pub const CLR_WRITE_PROT: u8 = 29;
    pub const SEND_WRITE_PROT: u8 = 30;
    pub const SEND_WRITE_PROT_TYPE: u8 = 31;
    pub const ERASE_WR_BLK_START: u8 = 32;
    pub const ERASE_WR_BLK_END: u8 = 33;
    pub const ERASE_GROUP_START: u8 = 35;
    pub const ERASE_GROUP_END: u8 = 36;
    pub const ERASE: u8 = 38;
    pub const LOCK_UNLOCK: u8 = 42;
    /// Embedded SD: read partition or device attributes
    pub const QUERY_PARTITION: u8 = 45;
    pub const SET_TIME: u8 = 49;
    pub const IO_RW_DIRECT: u8 = 52;
    /// SDIO: IO_RW_EXTENDED; eMMC: PROTOCOL_RD
    pub const IO_RW_EXTENDED: u8 = 53;
    pub const PROTOCOL_RD: u8 = 53;
    pub const PROTOCOL_WR: u8 = 54;
    pub const APP_CMD: u8 = 55;
    pub const GEN_CMD: u8 = 56;
}

/// Application command indices (sent after CMD55)
pub mod app_opcode {
    pub const SET_BUS_WIDTH: u8 = 6;
    pub const SD_STATUS: u8 = 13;
    pub const SEND_NUM_WR_BLOCKS: u8 = 22;
    pub const SET_WR_BLK_ERASE_COUNT: u8 = 23;
    pub const SD_SEND_OP_COND: u8 = 41;
    pub const SET_CLR_CARD_DETECT: u8 = 42;
    pub const SEND_SCR: u8 = 51;
}

/// R1 card status bits
pub mod r1 {
    pub const OUT_OF_RANGE: u32 = 1 << 31;
    pub const ADDRESS_ERROR: u32 = 1 << 30;
    pub const BLOCK_LEN_ERROR: u32 = 1 << 29;
    pub const ERASE_SEQ_ERROR: u32 = 1 << 28;
    pub const ERASE_PARAM: u32 = 1 << 27;
    pub const WP_VIOLATION: u32 = 1 << 26;
    pub const CARD_IS_LOCKED: u32 = 1 << 25;
    pub const LOCK_UNLOCK_FAILED: u32 = 1 << 24;
    pub const COM_CRC_ERROR: u32 = 1 << 23;
    pub const ILLEGAL_COMMAND: u32 = 1 << 22;
    pub const CARD_ECC_FAILED: u32 = 1 << 21;
    pub const CC_ERROR: u32 = 1 << 20;
    pub const ERROR: u32 = 1 << 19;
    pub const CID_CSD_OVERWRITE: u32 = 1 << 16;
    pub const WP_ERASE_SKIP: u32 = 1 << 15;
    pub const CARD_ECC_DISABLED: u32 = 1 << 14;
    pub const ERASE_RESET: u32 = 1 << 13;
    /// Current state field (bits 12:9)
    pub const CURRENT_STATE_SHIFT: u32 = 9;
    pub const CURRENT_STATE_MASK: u32 = 0xF << 9;
    pub const READY_FOR_DATA: u32 = 1 << 8;
    pub const SWITCH_ERROR: u32 = 1 << 7;
    pub const EXCEPTION_EVENT: u32 = 1 << 6;
    pub const APP_CMD: u32 = 1 << 5;

    /// Bits that make the command that returned them fail
    pub const ERROR_MASK: u32 = OUT_OF_RANGE
        | ADDRESS_ERROR
        | BLOCK_LEN_ERROR
        | ERASE_SEQ_ERROR
        | ERASE_PARAM
        | WP_VIOLATION
        | LOCK_UNLOCK_FAILED
        | ILLEGAL_COMMAND
        | CARD_ECC_FAILED
        | CC_ERROR
        | ERROR
        | CID_CSD_OVERWRITE
        | WP_ERASE_SKIP
        | SWITCH_ERROR;
}

/// Card state machine values reported in R1 bits 12:9
pub mod state {
    pub const IDLE: u8 = 0;
    pub const READY: u8 = 1;
    pub const IDENT: u8 = 2;
    pub const STANDBY: u8 = 3;
    pub const TRANSFER: u8 = 4;
    pub const DATA: u8 = 5;
    pub const RECEIVE: u8 = 6;
    pub const PROGRAM: u8 = 7;
    pub const DISCONNECT: u8 = 8;
    pub const BUS_TEST: u8 = 9;
    pub const SLEEP: u8 = 10;
}

/// R5 (SDIO IO_RW_DIRECT) response flags, bits 15:8 of the response
pub mod r5 {
    pub const COM_CRC_ERROR: u32 = 1 << 15;
    pub const ILLEGAL_COMMAND: u32 = 1 << 14;
    /// IO current state (bits 13:12)
    pub const STATE_SHIFT: u32 = 12;
    pub const STATE_MASK: u32 = 0x3 << 12;
    pub const ERROR: u32 = 1 << 11;
    pub const FUNCTION_NUMBER: u32 = 1 << 9;
    pub const OUT_OF_RANGE: u32 = 1 << 8;
    /// Read or written data byte (bits 7:0)
    pub const DATA_MASK: u32 = 0xFF;

    pub const ERROR_MASK: u32 = COM_CRC_ERROR | ILLEGAL_COMMAND | ERROR | FUNCTION_NUMBER | OUT_OF_RANGE;
}

/// OCR register bits (R3/R4)
pub mod ocr {
    /// 2.7-3.6 V window
    pub const VDD_WINDOW: u32 = 0x00FF_8000;
    pub const VDD_LOW: u32 = 1 << 7;
    /// SD: switching to 1.8 V request/accepted
    pub const S18: u32 = 1 << 24;
    /// SD: card capacity status / host capacity support
    pub const CCS: u32 = 1 << 30;
    pub const HCS: u32 = 1 << 30;
    /// SD: XPC (SDXC power control)
    pub const XPC: u32 = 1 << 28;
    /// MMC: access mode field (bits 30:29); 0b10 is sector mode
    pub const MMC_ACCESS_MASK: u32 = 0x3 << 29;
    pub const MMC_ACCESS_SECTOR: u32 = 0x2 << 29;
    /// Power-up finished
    pub const BUSY: u32 = 1 << 31;

    /// SDIO R4: number of I/O functions (bits 30:28)
    pub const SDIO_FUNCTIONS_SHIFT: u32 = 28;
    pub const SDIO_FUNCTIONS_MASK: u32 = 0x7 << 28;
    /// SDIO R4: memory present
    pub const SDIO_MEMORY_PRESENT: u32 = 1 << 27;
    /// SDIO R4: I/O OCR (bits 23:0)
    pub const SDIO_OCR_MASK: u32 = 0x00FF_FFFF;
}

/// CMD8 (SEND_IF_COND) argument fields
pub mod if_cond {
    /// 2.7-3.6 V supply, echo pattern 0xAA
    pub const ARGUMENT: u32 = 0x1AA;
    pub const CHECK_PATTERN: u32 = 0xAA;
    pub const VOLTAGE_MASK: u32 = 0xF00;
}

/// CMD6 (MMC SWITCH) argument layout
pub mod switch {
    pub const ACCESS_COMMAND_SET: u8 = 0;
    pub const ACCESS_SET_BITS: u8 = 1;
    pub const ACCESS_CLEAR_BITS: u8 = 2;
    pub const ACCESS_WRITE_BYTE: u8 = 3;
    pub const ACCESS_SHIFT: u32 = 24;
    pub const INDEX_SHIFT: u32 = 16;
    pub const VALUE_SHIFT: u32 = 8;
}

/// CMD38 erase arguments
pub mod erase_arg {
    pub const ERASE: u32 = 0x0000_0000;
    pub const TRIM: u32 = 0x0000_0001;
    pub const DISCARD: u32 = 0x0000_0003;
    pub const SECURE_ERASE: u32 = 0x8000_0000;
    pub const SECURE_TRIM1: u32 = 0x8000_0001;
    pub const SECURE_TRIM2: u32 = 0x8000_8000;
}

/// CMD23 (SET_BLOCK_COUNT) argument fields
pub mod block_count_arg {
    pub const RELIABLE_WRITE: u32 = 1 << 31;
    pub const PACKED: u32 = 1 << 30;
    pub const TAG_REQUEST: u32 = 1 << 29;
    /// Context id (bits 28:25)
    pub const CONTEXT_SHIFT: u32 = 25;
    pub const CONTEXT_MASK: u32 = 0xF << 25;
    pub const FORCED_PROGRAMMING: u32 = 1 << 24;
    pub const BLOCKS_MASK: u32 = 0xFFFF;
}

/// Packed command header layout
pub mod packed {
    pub const VERSION: u8 = 0x01;
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    /// Bytes per header entry: CMD23 argument followed by CMD18/25 argument
    pub const ENTRY_SIZE: usize = 8;
    /// PACKED_COMMAND_STATUS bits
    pub const STATUS_ERROR: u8 = 1 << 0;
    pub const STATUS_INDEXED_ERROR: u8 = 1 << 1;
}

/// CMD42 lock/unlock data block flags (byte 0)
pub mod lock {
    pub const SET_PWD: u8 = 1 << 0;
    pub const CLR_PWD: u8 = 1 << 1;
    pub const LOCK_UNLOCK: u8 = 1 << 2;
    pub const ERASE: u8 = 1 << 3;
    pub const MAX_PASSWORD: usize = 16;
}

/// EXT_CSD byte offsets (eMMC)
pub mod ext_csd {
    pub const SIZE: usize = 512;

    pub const FLUSH_CACHE: usize = 32;
    pub const CACHE_CTRL: usize = 33;
    pub const POWER_OFF_NOTIFICATION: usize = 34;
    pub const PACKED_FAILURE_INDEX: usize = 35;
    pub const PACKED_COMMAND_STATUS: usize = 36;
    pub const CONTEXT_CONF: usize = 37;
    pub const EXCEPTION_EVENTS_STATUS: usize = 54;
    pub const EXCEPTION_EVENTS_CTRL: usize = 56;
    pub const DATA_SECTOR_SIZE: usize = 61;
    pub const ENH_START_ADDR: usize = 136;
    pub const ENH_SIZE_MULT: usize = 140;
    pub const GP_SIZE_MULT: usize = 143;
    pub const PARTITION_SETTING_COMPLETED: usize = 155;
    pub const PARTITIONS_ATTRIBUTE: usize = 156;
    pub const BKOPS_EN: usize = 163;
    pub const BKOPS_START: usize = 164;
    pub const SANITIZE_START: usize = 165;
    pub const HPI_MGMT: usize = 161;
    pub const USER_WP: usize = 171;
    pub const BOOT_WP: usize = 173;
    pub const ERASE_GROUP_DEF: usize = 175;
    pub const BOOT_BUS_CONDITIONS: usize = 177;
    pub const BOOT_CONFIG_PROT: usize = 178;
    pub const PARTITION_CONFIG: usize = 179;
    pub const ERASED_MEM_CONT: usize = 181;
    pub const BUS_WIDTH: usize = 183;
    pub const HS_TIMING: usize = 185;
    pub const EXT_CSD_REV: usize = 192;
    pub const CARD_TYPE: usize = 196;
    pub const DRIVER_STRENGTH: usize = 197;
    pub const SEC_COUNT: usize = 212;
    pub const S_A_TIMEOUT: usize = 217;
    pub const HC_WP_GRP_SIZE: usize = 221;
    pub const ERASE_TIMEOUT_MULT: usize = 223;
    pub const HC_ERASE_GRP_SIZE: usize = 224;
    pub const BOOT_SIZE_MULT: usize = 226;
    pub const SEC_FEATURE_SUPPORT: usize = 231;
    pub const GENERIC_CMD6_TIME: usize = 248;
    pub const CACHE_SIZE: usize = 249;
    pub const MAX_PACKED_WRITES: usize = 500;
    pub const MAX_PACKED_READS: usize = 501;
    pub const BKOPS_SUPPORT: usize = 502;
    pub const HPI_FEATURES: usize = 503;
    pub const S_CMD_SET: usize = 504;

    /// CARD_TYPE bits
    pub const CARD_TYPE_HS26: u8 = 1 << 0;
    pub const CARD_TYPE_HS52: u8 = 1 << 1;
    pub const CARD_TYPE_DDR_1V8: u8 = 1 << 2;
    pub const CARD_TYPE_DDR_1V2: u8 = 1 << 3;
    pub const CARD_TYPE_HS200_1V8: u8 = 1 << 4;
    pub const CARD_TYPE_HS200_1V2: u8 = 1 << 5;

    /// BUS_WIDTH values
    pub const BUS_WIDTH_1: u8 = 0;
    pub const BUS_WIDTH_4: u8 = 1;
    pub const BUS_WIDTH_8: u8 = 2;
    pub const BUS_WIDTH_4_DDR: u8 = 5;
    pub const BUS_WIDTH_8_DDR: u8 = 6;

    /// HS_TIMING values (driver strength in bits 7:4)
    pub const TIMING_LEGACY: u8 = 0;
    pub const TIMING_HS: u8 = 1;
    pub const TIMING_HS200: u8 = 2;

    /// PARTITION_CONFIG fields
    pub const PART_ACCESS_MASK: u8 = 0x07;
    pub const PART_ACCESS_USER: u8 = 0;
    pub const PART_ACCESS_BOOT1: u8 = 1;
    pub const PART_ACCESS_BOOT2: u8 = 2;
    pub const PART_ACCESS_RPMB: u8 = 3;
    pub const PART_ENABLE_SHIFT: u8 = 3;
    pub const BOOT_ACK: u8 = 1 << 6;

    /// EXCEPTION_EVENTS_CTRL bits
    pub const PACKED_EVENT_EN: u8 = 1 << 3;
    /// EXCEPTION_EVENTS_STATUS bits
    pub const PACKED_FAILURE: u8 = 1 << 3;

    /// HPI_FEATURES bits
    pub const HPI_SUPPORTED: u8 = 1 << 0;
    /// Set when HPI is issued with CMD12, clear for CMD13
    pub const HPI_USES_CMD12: u8 = 1 << 1;

    /// SEC_FEATURE_SUPPORT bits
    pub const SEC_ER_EN: u8 = 1 << 0;
    pub const SEC_GB_CL_EN: u8 = 1 << 4;
    pub const SEC_SANITIZE: u8 = 1 << 6;

    /// POWER_OFF_NOTIFICATION values
    pub const POWER_ON: u8 = 1;
    pub const POWER_OFF_SHORT: u8 = 2;
    pub const POWER_OFF_LONG: u8 = 3;

    /// USER_WP bits
    pub const US_PWR_WP_EN: u8 = 1 << 0;
    pub const US_PERM_WP_EN: u8 = 1 << 2;
    pub const US_PWR_WP_DIS: u8 = 1 << 3;
    pub const US_PERM_WP_DIS: u8 = 1 << 4;
    pub const CD_PERM_WP_DIS: u8 = 1 << 6;
    pub const PERM_PSWD_DIS: u8 = 1 << 7;

    /// BOOT_WP bits
    pub const B_PWR_WP_EN: u8 = 1 << 0;
    pub const B_PERM_WP_EN: u8 = 1 << 2;
    pub const B_PERM_WP_DIS: u8 = 1 << 4;
    pub const B_PWR_WP_DIS: u8 = 1 << 6;

    /// BKOPS_EN bits
    pub const BKOPS_MANUAL_EN: u8 = 1 << 0;

    /// CACHE_CTRL bits
    pub const CACHE_EN: u8 = 1 << 0;

    /// HPI_MGMT bits
    pub const HPI_EN: u8 = 1 << 0;

    pub const RPMB_SIZE_MULT: usize = 168;
    pub const PARTITION_SUPPORT: usize = 160;
    pub const MAX_ENH_SIZE_MULT: usize = 157;
    pub const RST_N_FUNCTION: usize = 162;
    pub const BOOT_INFO: usize = 228;
    pub const CONTEXT_CAPABILITIES: usize = 57;
}

/// SD SWITCH_FUNC (CMD6) argument and status layout
pub mod sd_switch {
    pub const MODE_CHECK: u32 = 0;
    pub const MODE_SWITCH: u32 = 1 << 31;
    /// Function groups; group N occupies argument bits 4N-1:4N-4
    pub const GROUP_ACCESS_MODE: u8 = 1;
    pub const GROUP_COMMAND_SYSTEM: u8 = 2;
    pub const GROUP_DRIVER_STRENGTH: u8 = 3;
    pub const GROUP_CURRENT_LIMIT: u8 = 4;
    /// Function value that leaves a group unchanged
    pub const KEEP: u8 = 0xF;
    /// Size of the switch status block in bytes
    pub const STATUS_SIZE: usize = 64;

    /// Group 1 (access mode / bus speed)
    pub const ACCESS_SDR12: u8 = 0;
    pub const ACCESS_SDR25: u8 = 1;
    pub const ACCESS_SDR50: u8 = 2;
    pub const ACCESS_SDR104: u8 = 3;
    pub const ACCESS_DDR50: u8 = 4;

    /// Group 3 (driver strength)
    pub const DRIVER_TYPE_B: u8 = 0;
    pub const DRIVER_TYPE_A: u8 = 1;
    pub const DRIVER_TYPE_C: u8 = 2;
    pub const DRIVER_TYPE_D: u8 = 3;

    /// Group 4 (current limit)
    pub const CURRENT_200MA: u8 = 0;
    pub const CURRENT_400MA: u8 = 1;
    pub const CURRENT_600MA: u8 = 2;
    pub const CURRENT_800MA: u8 = 3;
}

/// SCR fields
pub mod scr {
    pub const SIZE: usize = 8;
    pub const BUS_WIDTH_1: u8 = 1 << 0;
    pub const BUS_WIDTH_4: u8 = 1 << 2;
    pub const SPEC_1_10: u8 = 1;
    pub const SPEC_2_00: u8 = 2;
}

/// Embedded SD partition queries (CMD45)
pub mod esd {
    pub const SUBCOMMAND_SHIFT: u32 = 24;
    pub const PARTITION_SHIFT: u32 = 16;
    pub const QUERY_DEVICE_ATTRIBUTES: u8 = 0xA1;
    pub const QUERY_PARTITION_ATTRIBUTES: u8 = 0xB1;
    /// Every query answers with one 512-byte block
    pub const RESPONSE_SIZE: usize = 512;
    /// Device attribute block: structure version
    pub const DEVICE_VERSION: usize = 0;
    /// Device attribute block: partitions the device holds
    pub const DEVICE_PARTITIONS: usize = 4;
    /// Partition attribute block: partition type byte
    pub const PARTITION_TYPE: usize = 0;
    /// Partition attribute block: size in 512-byte blocks, little endian
    pub const PARTITION_BLOCKS: usize = 8;
}

/// CSD TRAN_SPEED codes an SD card reports for its current access mode
pub mod tran_speed {
    pub const SD_25MHZ: u8 = 0x32;
    pub const SD_50MHZ: u8 = 0x5A;
    pub const SD_100MHZ: u8 = 0x0B;
    pub const SD_200MHZ: u8 = 0x2B;
}

/// SDIO common control register (CCCR) offsets and bits, function 0
pub mod cccr {
    pub const REVISION: u32 = 0x00;
    pub const SD_REVISION: u32 = 0x01;
    pub const IO_ENABLE: u32 = 0x02;
    pub const IO_READY: u32 = 0x03;
    pub const INT_ENABLE: u32 = 0x04;
    pub const INT_PENDING: u32 = 0x05;
    pub const IO_ABORT: u32 = 0x06;
    pub const BUS_INTERFACE: u32 = 0x07;
    pub const CARD_CAPABILITY: u32 = 0x08;
    pub const CIS_POINTER: u32 = 0x09;
    pub const BUS_SUSPEND: u32 = 0x0C;
    pub const FUNCTION_SELECT: u32 = 0x0D;
    pub const EXEC_FLAGS: u32 = 0x0E;
    pub const READY_FLAGS: u32 = 0x0F;
    pub const FN0_BLOCK_SIZE: u32 = 0x10;
    pub const POWER_CONTROL: u32 = 0x12;
    pub const BUS_SPEED: u32 = 0x13;
    pub const UHS_SUPPORT: u32 = 0x14;
    pub const DRIVER_STRENGTH: u32 = 0x15;

    /// BUS_INTERFACE width field
    pub const BUS_WIDTH_MASK: u8 = 0x03;
    pub const BUS_WIDTH_1: u8 = 0x00;
    pub const BUS_WIDTH_4: u8 = 0x02;
    pub const BUS_WIDTH_8: u8 = 0x03;

    /// CARD_CAPABILITY bits
    pub const CAP_SMB: u8 = 1 << 1;
    pub const CAP_SBS: u8 = 1 << 3;
    pub const CAP_LSC: u8 = 1 << 6;
    pub const CAP_4BLS: u8 = 1 << 7;

    /// INT_ENABLE master enable
    pub const INT_MASTER: u8 = 1 << 0;

    /// BUS_SUSPEND bits
    pub const BUS_STATUS: u8 = 1 << 0;
    pub const BUS_RELEASE: u8 = 1 << 1;

    /// FUNCTION_SELECT: resume data flag
    pub const RESUME_DATA_FLAG: u8 = 1 << 7;

    /// BUS_SPEED bits
    pub const SUPPORT_HIGH_SPEED: u8 = 1 << 0;
    /// Bus speed select (bits 3:1)
    pub const SPEED_SELECT_SHIFT: u8 = 1;
    pub const SPEED_SELECT_MASK: u8 = 0x7 << 1;
    pub const SPEED_SDR12: u8 = 0;
    pub const SPEED_SDR25: u8 = 1;
    pub const SPEED_SDR50: u8 = 2;
    pub const SPEED_SDR104: u8 = 3;
    pub const SPEED_DDR50: u8 = 4;

    /// UHS_SUPPORT bits
    pub const UHS_SDR50: u8 = 1 << 0;
    pub const UHS_SDR104: u8 = 1 << 1;
    pub const UHS_DDR50: u8 = 1 << 2;

    /// DRIVER_STRENGTH bits: supported types in bits 2:0, selected type in bits 5:4
    pub const DRIVER_SUPPORT_A: u8 = 1 << 0;
    pub const DRIVER_SUPPORT_C: u8 = 1 << 1;
    pub const DRIVER_SUPPORT_D: u8 = 1 << 2;
    pub const DRIVER_SELECT_SHIFT: u8 = 4;
}

/// SDIO function basic registers; function n occupies n * 0x100
pub mod fbr {
    pub const STRIDE: u32 = 0x100;
    pub const CIS_POINTER: u32 = 0x09;
    /// Little-endian u16
    pub const BLOCK_SIZE: u32 = 0x10;
}

/// eMMC SLEEP_AWAKE (CMD5) argument
pub mod sleep_arg {
    pub const SLEEP: u32 = 1 << 15;
}

/// Bit set in the CMD12/CMD13 argument to make it a high priority interrupt
pub const HPI_FLAG: u32 = 1 << 0;

/// SDIO CMD52/CMD53 argument fields
pub mod io_arg {
    pub const WRITE: u32 = 1 << 31;
    /// Function number (bits 30:28)
    pub const FUNCTION_SHIFT: u32 = 28;
    /// CMD52: read after write; CMD53: block mode
    pub const RAW: u32 = 1 << 27;
    pub const BLOCK_MODE: u32 = 1 << 27;
    /// CMD53: incrementing address
    pub const INCREMENT: u32 = 1 << 26;
    /// Register address (bits 25:9)
    pub const ADDRESS_SHIFT: u32 = 9;
    pub const ADDRESS_MASK: u32 = 0x1FFFF;
    /// CMD53 byte/block count (bits 8:0)
    pub const COUNT_MASK: u32 = 0x1FF;
}

/// CIS tuple codes
pub mod cis {
    pub const TPL_NULL: u8 = 0x00;
    pub const TPL_MANFID: u8 = 0x20;
    pub const TPL_FUNCID: u8 = 0x21;
    pub const TPL_FUNCE: u8 = 0x22;
    pub const TPL_END: u8 = 0xFF;
}

/// RPMB data frame layout (all multi-byte fields big endian)
pub mod rpmb {
    pub const FRAME_SIZE: usize = 512;
    pub const STUFF_SIZE: usize = 196;
    pub const MAC_SIZE: usize = 32;
    pub const DATA_SIZE: usize = 256;
    pub const NONCE_SIZE: usize = 16;

    pub const STUFF_OFFSET: usize = 0;
    pub const MAC_OFFSET: usize = 196;
    pub const DATA_OFFSET: usize = 228;
    pub const NONCE_OFFSET: usize = 484;
    pub const WRITE_COUNTER_OFFSET: usize = 500;
    pub const ADDRESS_OFFSET: usize = 504;
    pub const BLOCK_COUNT_OFFSET: usize = 506;
    pub const RESULT_OFFSET: usize = 508;
    pub const REQUEST_OFFSET: usize = 510;

    pub const REQ_PROGRAM_KEY: u16 = 0x0001;
    pub const REQ_READ_COUNTER: u16 = 0x0002;
    pub const REQ_WRITE_DATA: u16 = 0x0003;
    pub const REQ_READ_DATA: u16 = 0x0004;
    pub const REQ_READ_RESULT: u16 = 0x0005;

    pub const RESP_PROGRAM_KEY: u16 = 0x0100;
    pub const RESP_READ_COUNTER: u16 = 0x0200;
    pub const RESP_WRITE_DATA: u16 = 0x0300;
    pub const RESP_READ_DATA: u16 = 0x0400;

    pub const RESULT_OK: u16 = 0x0000;
    pub const RESULT_GENERAL_FAILURE: u16 = 0x0001;
    pub const RESULT_AUTH_FAILURE: u16 = 0x0002;
    pub const RESULT_COUNTER_FAILURE: u16 = 0x0003;
    pub const RESULT_ADDRESS_FAILURE: u16 = 0x0004;
    pub const RESULT_WRITE_FAILURE: u16 = 0x0005;
    pub const RESULT_READ_FAILURE: u16 = 0x0006;
    pub const RESULT_KEY_NOT_PROGRAMMED: u16 = 0x0007;
    /// Low seven bits carry the result; bit 7 flags an expired write counter
    pub const RESULT_MASK: u16 = 0x007F;
    pub const RESULT_COUNTER_EXPIRED: u16 = 0x0080;

    /// PROTOCOL_RD/WR argument: JEDEC security protocol, RPMB specific field
    pub const SECURITY_PROTOCOL: u32 = 0xEC;
    pub const PROTOCOL_SPECIFIC: u32 = 0x0001;
    pub const PROTOCOL_ARG: u32 = (PROTOCOL_SPECIFIC << 16) | (SECURITY_PROTOCOL << 8);
}

/// SET_TIME (CMD49) RTC information block
pub mod rtc {
    pub const VERSION: u8 = 0x01;
    pub const TYPE_ABSOLUTE: u8 = 0x01;
    pub const TYPE_RELATIVE: u8 = 0x02;
    pub const TYPE_RESET_RELATIVE: u8 = 0x03;
    pub const VERSION_OFFSET: usize = 0;
    pub const TYPE_OFFSET: usize = 1;
    /// Little-endian u64 seconds
    pub const SECONDS_OFFSET: usize = 2;
    pub const RESOLUTION_OFFSET: usize = 10;
}

/// CMD0 arguments
pub mod go_idle_arg {
    pub const IDLE: u32 = 0x0000_0000;
    pub const PRE_IDLE: u32 = 0xF0F0_F0F0;
    pub const BOOT_INITIATION: u32 = 0xFFFF_FFFA;
}
