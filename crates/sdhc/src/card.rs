//! Card identity and capability registers: CID, CSD, EXT_CSD, SCR and the
//! SDIO CCCR/CIS, plus the per-slot record of the enumerated card.

use sdhc_hw::card::{cccr, cis, ext_csd, ocr};

/// Kind of card found during enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CardType {
    Mmc = 0,
    Sd = 1,
    Sdio = 2,
    Sdhc = 3,
    MmcHc = 4,
    Emmc = 5,
    EmmcHc = 6,
    Sdxc = 9,
    /// SDIO card with a memory portion
    SdioCombo = 10,
}

impl CardType {
    pub fn is_sd(self) -> bool {
        matches!(self, CardType::Sd | CardType::Sdhc | CardType::Sdxc)
    }

    pub fn is_mmc(self) -> bool {
        matches!(
            self,
            CardType::Mmc | CardType::MmcHc | CardType::Emmc | CardType::EmmcHc
        )
    }

    pub fn is_emmc(self) -> bool {
        matches!(self, CardType::Emmc | CardType::EmmcHc)
    }

    pub fn is_sdio(self) -> bool {
        matches!(self, CardType::Sdio | CardType::SdioCombo)
    }

    /// Has a memory array addressed with CMD17/18/24/25
    pub fn has_memory(self) -> bool {
        self != CardType::Sdio
    }

    /// Data commands take block numbers instead of byte offsets
    pub fn block_addressed(self) -> bool {
        matches!(
            self,
            CardType::Sdhc | CardType::Sdxc | CardType::MmcHc | CardType::EmmcHc
        )
    }
}

/// Bus timing currently in effect. SDIO cards use the same set; their
/// UHS modes are reached through CCCR rather than CMD6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpeedMode {
    Legacy,
    HighSpeed,
    Sdr12,
    Sdr25,
    Ddr50,
    Sdr50,
    Sdr104,
    Hs200,
}

impl SpeedMode {
    pub fn is_uhs(self) -> bool {
        matches!(
            self,
            SpeedMode::Sdr12 | SpeedMode::Sdr25 | SpeedMode::Sdr50 | SpeedMode::Sdr104 | SpeedMode::Ddr50
        )
    }
}

/// Extracts `size` bits starting at bit `start` from a 128-bit register held
/// as four words, bit 127 at the top of word 0.
pub fn bits(raw: &[u32; 4], start: u32, size: u32) -> u32 {
    let mask = if size >= 32 { u32::MAX } else { (1 << size) - 1 };
    let off = 3 - (start / 32) as usize;
    let shift = start % 32;
    let mut value = raw[off] >> shift;
    if size + shift > 32 && off > 0 {
        value |= raw[off - 1] << (32 - shift);
    }
    value & mask
}

/// Card identification register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    pub raw: [u32; 4],
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: String,
    pub revision: u8,
    pub serial: u32,
    pub year: u16,
    pub month: u8,
    /// MMC only: CBX device type (0 removable, 1 BGA, 2 POP)
    pub device_type: u8,
}

fn name_from(raw: &[u32; 4], top_bit: u32, chars: u32) -> String {
    (0..chars)
        .map(|i| bits(raw, top_bit - 7 - i * 8, 8) as u8)
        .filter(|c| *c != 0)
        .map(|c| if c.is_ascii_graphic() || c == b' ' { c as char } else { '?' })
        .collect::<String>()
        .trim_end()
        .to_string()
}

impl Cid {
    pub fn parse_sd(raw: [u32; 4]) -> Self {
        let mdt = bits(&raw, 8, 12);
        Self {
            manufacturer_id: bits(&raw, 120, 8) as u8,
            oem_id: bits(&raw, 104, 16) as u16,
            product_name: name_from(&raw, 103, 5),
            revision: bits(&raw, 56, 8) as u8,
            serial: bits(&raw, 24, 32),
            year: 2000 + (mdt >> 4) as u16,
            month: (mdt & 0xF) as u8,
            device_type: 0,
            raw,
        }
    }

    pub fn parse_mmc(raw: [u32; 4]) -> Self {
        let mdt = bits(&raw, 8, 8);
        Self {
            manufacturer_id: bits(&raw, 120, 8) as u8,
            device_type: bits(&raw, 112, 2) as u8,
            oem_id: bits(&raw, 104, 8) as u16,
            product_name: name_from(&raw, 103, 6),
            revision: bits(&raw, 48, 8) as u8,
            serial: bits(&raw, 16, 32),
            month: (mdt >> 4) as u8,
            year: 1997 + (mdt & 0xF) as u16,
            raw,
        }
    }
}

/// Erase and write-protect geometry fields of the CSD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseGeometry {
    /// SD: SECTOR_SIZE field (erase unit in write blocks, minus one)
    pub sector_size: u8,
    /// MMC: ERASE_GRP_SIZE
    pub erase_grp_size: u8,
    /// MMC: ERASE_GRP_MULT
    pub erase_grp_mult: u8,
    pub wp_grp_size: u8,
    pub wp_grp_enable: bool,
}

/// Card specific data register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csd {
    pub raw: [u32; 4],
    pub structure: u8,
    /// MMC SPEC_VERS; zero for SD
    pub spec_version: u8,
    pub max_transfer_hz: u32,
    pub command_classes: u16,
    pub read_bl_len: u8,
    pub read_bl_partial: bool,
    pub write_bl_len: u8,
    pub write_bl_partial: bool,
    /// Capacity in 512-byte blocks (MMC over 2 GiB reports this through EXT_CSD)
    pub capacity_blocks: u64,
    pub erase: EraseGeometry,
    pub perm_write_protect: bool,
    pub tmp_write_protect: bool,
}

const TRAN_UNIT: [u32; 4] = [10_000, 100_000, 1_000_000, 10_000_000];
const SD_TRAN_MULT: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];
const MMC_TRAN_MULT: [u32; 16] = [0, 10, 12, 13, 15, 20, 26, 30, 35, 40, 45, 52, 55, 60, 70, 80];

fn tran_speed(code: u32, table: &[u32; 16]) -> u32 {
    let unit = TRAN_UNIT[(code & 0x7).min(3) as usize];
    unit * table[((code >> 3) & 0xF) as usize]
}

fn legacy_capacity(raw: &[u32; 4], read_bl_len: u8) -> u64 {
    let c_size = bits(raw, 62, 12) as u64;
    let mult = bits(raw, 47, 3) as u64;
    ((c_size + 1) << (mult + 2)) * (1u64 << read_bl_len) / 512
}

impl Csd {
    pub fn parse_sd(raw: [u32; 4]) -> Self {
        let structure = bits(&raw, 126, 2) as u8;
        let read_bl_len = bits(&raw, 80, 4) as u8;
        let capacity_blocks = if structure == 0 {
            legacy_capacity(&raw, read_bl_len)
        } else {
            (bits(&raw, 48, 22) as u64 + 1) * 1024
        };
        Self {
            structure,
            spec_version: 0,
            max_transfer_hz: tran_speed(bits(&raw, 96, 8), &SD_TRAN_MULT),
            command_classes: bits(&raw, 84, 12) as u16,
            read_bl_len,
            read_bl_partial: bits(&raw, 79, 1) != 0,
            write_bl_len: bits(&raw, 22, 4) as u8,
            write_bl_partial: bits(&raw, 21, 1) != 0,
            capacity_blocks,
            erase: EraseGeometry {
                sector_size: bits(&raw, 39, 7) as u8,
                wp_grp_size: bits(&raw, 32, 7) as u8,
                wp_grp_enable: bits(&raw, 31, 1) != 0,
                ..EraseGeometry::default()
            },
            perm_write_protect: bits(&raw, 13, 1) != 0,
            tmp_write_protect: bits(&raw, 12, 1) != 0,
            raw,
        }
    }

    pub fn parse_mmc(raw: [u32; 4]) -> Self {
        let read_bl_len = bits(&raw, 80, 4) as u8;
        Self {
            structure: bits(&raw, 126, 2) as u8,
            spec_version: bits(&raw, 122, 4) as u8,
            max_transfer_hz: tran_speed(bits(&raw, 96, 8), &MMC_TRAN_MULT),
            command_classes: bits(&raw, 84, 12) as u16,
            read_bl_len,
            read_bl_partial: bits(&raw, 79, 1) != 0,
            write_bl_len: bits(&raw, 22, 4) as u8,
            write_bl_partial: bits(&raw, 21, 1) != 0,
            capacity_blocks: legacy_capacity(&raw, read_bl_len),
            erase: EraseGeometry {
                erase_grp_size: bits(&raw, 42, 5) as u8,
                erase_grp_mult: bits(&raw, 37, 5) as u8,
                wp_grp_size: bits(&raw, 32, 5) as u8,
                wp_grp_enable: bits(&raw, 31, 1) != 0,
                ..EraseGeometry::default()
            },
            perm_write_protect: bits(&raw, 13, 1) != 0,
            tmp_write_protect: bits(&raw, 12, 1) != 0,
            raw,
        }
    }
}

/// eMMC extended CSD, kept raw with accessors for the fields the driver uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtCsd {
    raw: Vec<u8>,
}

impl ExtCsd {
    pub fn new(mut raw: Vec<u8>) -> Self {
        raw.resize(ext_csd::SIZE, 0);
        Self { raw }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn byte(&self, index: usize) -> u8 {
        self.raw.get(index).copied().unwrap_or(0)
    }

    pub(crate) fn set_byte(&mut self, index: usize, value: u8) {
        if let Some(b) = self.raw.get_mut(index) {
            *b = value;
        }
    }

    fn le32(&self, index: usize) -> u32 {
        u32::from_le_bytes([
            self.byte(index),
            self.byte(index + 1),
            self.byte(index + 2),
            self.byte(index + 3),
        ])
    }

    pub fn revision(&self) -> u8 {
        self.byte(ext_csd::EXT_CSD_REV)
    }

    pub fn card_type(&self) -> u8 {
        self.byte(ext_csd::CARD_TYPE)
    }

    pub fn supports_hs200(&self) -> bool {
        self.card_type() & (ext_csd::CARD_TYPE_HS200_1V8 | ext_csd::CARD_TYPE_HS200_1V2) != 0
    }

    pub fn supports_hs52(&self) -> bool {
        self.card_type() & ext_csd::CARD_TYPE_HS52 != 0
    }

    /// Bitmask of supported driver strengths (bit n = type n)
    pub fn driver_strengths(&self) -> u8 {
        self.byte(ext_csd::DRIVER_STRENGTH) | 1
    }

    pub fn sector_count(&self) -> u32 {
        self.le32(ext_csd::SEC_COUNT)
    }

    pub fn erase_group_def(&self) -> bool {
        self.byte(ext_csd::ERASE_GROUP_DEF) & 1 != 0
    }

    pub fn hc_erase_grp_size(&self) -> u8 {
        self.byte(ext_csd::HC_ERASE_GRP_SIZE)
    }

    pub fn hc_wp_grp_size(&self) -> u8 {
        self.byte(ext_csd::HC_WP_GRP_SIZE)
    }

    pub fn partition_config(&self) -> u8 {
        self.byte(ext_csd::PARTITION_CONFIG)
    }

    pub fn bus_width(&self) -> u8 {
        self.byte(ext_csd::BUS_WIDTH)
    }

    pub fn hs_timing(&self) -> u8 {
        self.byte(ext_csd::HS_TIMING)
    }

    pub fn erased_byte(&self) -> u8 {
        if self.byte(ext_csd::ERASED_MEM_CONT) != 0 { 0xFF } else { 0x00 }
    }

    pub fn sec_features(&self) -> u8 {
        self.byte(ext_csd::SEC_FEATURE_SUPPORT)
    }

    /// Cache size in kilobytes
    pub fn cache_size_kb(&self) -> u32 {
        self.le32(ext_csd::CACHE_SIZE)
    }

    pub fn hpi_features(&self) -> u8 {
        self.byte(ext_csd::HPI_FEATURES)
    }

    pub fn max_packed_writes(&self) -> u8 {
        self.byte(ext_csd::MAX_PACKED_WRITES)
    }

    pub fn max_packed_reads(&self) -> u8 {
        self.byte(ext_csd::MAX_PACKED_READS)
    }

    /// Boot partition size in 512-byte blocks
    pub fn boot_partition_blocks(&self) -> u32 {
        self.byte(ext_csd::BOOT_SIZE_MULT) as u32 * 256
    }

    /// Switch busy time in milliseconds (GENERIC_CMD6_TIME is in 10 ms units)
    pub fn switch_time_ms(&self) -> u32 {
        self.byte(ext_csd::GENERIC_CMD6_TIME) as u32 * 10
    }
}

/// SD configuration register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scr {
    pub raw: [u8; 8],
    pub structure: u8,
    pub spec: u8,
    pub spec3: bool,
    pub data_stat_after_erase: bool,
    pub security: u8,
    /// Bit 0: 1-bit, bit 2: 4-bit
    pub bus_widths: u8,
    /// Bit 0: CMD20, bit 1: CMD23
    pub cmd_support: u8,
}

impl Scr {
    pub fn parse(raw: [u8; 8]) -> Self {
        Self {
            structure: raw[0] >> 4,
            spec: raw[0] & 0xF,
            data_stat_after_erase: raw[1] & 0x80 != 0,
            security: (raw[1] >> 4) & 0x7,
            bus_widths: raw[1] & 0xF,
            spec3: raw[2] & 0x80 != 0,
            cmd_support: raw[3] & 0x3,
            raw,
        }
    }

    pub fn supports_cmd23(&self) -> bool {
        self.cmd_support & 0x2 != 0
    }

    /// SD physical layer version as major*100 + minor*10
    pub fn version(&self) -> u16 {
        match (self.spec, self.spec3) {
            (0, _) => 101,
            (1, _) => 110,
            (2, false) => 200,
            (2, true) => 300,
            _ => 0,
        }
    }
}

/// SDIO common registers and function 0 CIS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdioInfo {
    pub functions: u8,
    pub memory_present: bool,
    pub cccr_revision: u8,
    pub sdio_revision: u8,
    pub sd_revision: u8,
    pub capability: u8,
    pub bus_speed: u8,
    pub uhs_support: u8,
    pub driver_strength: u8,
    pub cis_pointer: u32,
    pub manufacturer: u16,
    pub card_id: u16,
    pub fn0_max_block: u16,
    pub max_tran_speed: u8,
    /// Block size programmed for each function, zero until set
    pub block_sizes: [u16; 8],
    /// Functions enabled through IO_ENABLE
    pub enabled: u8,
    /// Raw tuples read from the CIS, for callers that want more than the above
    pub cis: Vec<u8>,
}

impl SdioInfo {
    pub fn from_ocr(r4: u32) -> Self {
        Self {
            functions: ((r4 & ocr::SDIO_FUNCTIONS_MASK) >> ocr::SDIO_FUNCTIONS_SHIFT) as u8,
            memory_present: r4 & ocr::SDIO_MEMORY_PRESENT != 0,
            ..Self::default()
        }
    }

    /// Fills in CCCR fields from the first 0x16 bytes of function 0
    pub fn apply_cccr(&mut self, regs: &[u8]) {
        let get = |off: u32| regs.get(off as usize).copied().unwrap_or(0);
        let rev = get(cccr::REVISION);
        self.cccr_revision = rev & 0xF;
        self.sdio_revision = rev >> 4;
        self.sd_revision = get(cccr::SD_REVISION) & 0xF;
        self.capability = get(cccr::CARD_CAPABILITY);
        self.bus_speed = get(cccr::BUS_SPEED);
        self.uhs_support = get(cccr::UHS_SUPPORT);
        self.driver_strength = get(cccr::DRIVER_STRENGTH);
        self.cis_pointer = get(cccr::CIS_POINTER) as u32
            | (get(cccr::CIS_POINTER + 1) as u32) << 8
            | (get(cccr::CIS_POINTER + 2) as u32) << 16;
    }

    /// Walks CIS tuples, picking out MANFID and the function 0 FUNCE
    pub fn apply_cis(&mut self, tuples: &[u8]) {
        let mut pos = 0;
        while pos < tuples.len() {
            let code = tuples[pos];
            if code == cis::TPL_END {
                pos += 1;
                break;
            }
            if code == cis::TPL_NULL {
                pos += 1;
                continue;
            }
            let Some(&len) = tuples.get(pos + 1) else {
                break;
            };
            let body_start = pos + 2;
            let body_end = (body_start + len as usize).min(tuples.len());
            let body = &tuples[body_start..body_end];
            match code {
                cis::TPL_MANFID if body.len() >= 4 => {
                    self.manufacturer = u16::from_le_bytes([body[0], body[1]]);
                    self.card_id = u16::from_le_bytes([body[2], body[3]]);
                }
                cis::TPL_FUNCE if body.len() >= 4 && body[0] == 0 => {
                    self.fn0_max_block = u16::from_le_bytes([body[1], body[2]]);
                    self.max_tran_speed = body[3];
                }
                _ => {}
            }
            pos = body_end;
        }
        self.cis = tuples[..pos.min(tuples.len())].to_vec();
    }

    pub fn supports_high_speed(&self) -> bool {
        self.bus_speed & cccr::SUPPORT_HIGH_SPEED != 0
    }
}

/// Everything learned about the card in a slot
#[derive(Debug, Clone)]
pub struct Card {
    pub card_type: CardType,
    pub rca: u16,
    pub ocr: u32,
    pub cid: Option<Cid>,
    pub csd: Option<Csd>,
    pub ext_csd: Option<ExtCsd>,
    pub scr: Option<Scr>,
    pub sdio: Option<SdioInfo>,
    pub speed: SpeedMode,
    /// Card accepted the 1.8 V signalling request during power-up
    pub s18a: bool,
    /// Card detect generation the card was enumerated under
    pub generation: u64,
    /// Block length set with CMD16 (byte-addressed cards)
    pub block_len: u32,
    pub locked: bool,
    pub sleeping: bool,
}

impl Card {
    pub fn new(card_type: CardType, generation: u64) -> Self {
        Self {
            card_type,
            rca: 0,
            ocr: 0,
            cid: None,
            csd: None,
            ext_csd: None,
            scr: None,
            sdio: None,
            speed: SpeedMode::Legacy,
            s18a: false,
            generation,
            block_len: 512,
            locked: false,
            sleeping: false,
        }
    }

    /// Argument for a data command addressing `block`
    pub fn data_arg(&self, block: u32) -> Option<u32> {
        if self.card_type.block_addressed() {
            Some(block)
        } else {
            block.checked_mul(512)
        }
    }

    pub fn rca_arg(&self) -> u32 {
        (self.rca as u32) << 16
    }

    pub fn capacity_blocks(&self) -> u64 {
        match (&self.ext_csd, &self.csd) {
            (Some(ext), _) if ext.sector_count() != 0 && self.card_type.block_addressed() => {
                ext.sector_count() as u64
            }
            (_, Some(csd)) => csd.capacity_blocks,
            _ => 0,
        }
    }

    /// Erase group size in 512-byte blocks
    pub fn erase_group_blocks(&self) -> u32 {
        if let Some(ext) = &self.ext_csd {
            if ext.erase_group_def() {
                return ext.hc_erase_grp_size().max(1) as u32 * 1024;
            }
        }
        match &self.csd {
            Some(csd) if self.card_type.is_mmc() => {
                (csd.erase.erase_grp_size as u32 + 1) * (csd.erase.erase_grp_mult as u32 + 1)
            }
            Some(csd) => csd.erase.sector_size as u32 + 1,
            None => 1,
        }
    }

    /// Write-protect group size in 512-byte blocks
    pub fn wp_group_blocks(&self) -> u32 {
        if let Some(ext) = &self.ext_csd {
            if ext.erase_group_def() {
                return ext.hc_erase_grp_size().max(1) as u32
                    * ext.hc_wp_grp_size().max(1) as u32
                    * 1024;
            }
        }
        let wp = self.csd.as_ref().map_or(0, |c| c.erase.wp_grp_size as u32);
        self.erase_group_blocks() * (wp + 1)
    }

    /// Pattern erased blocks read back as
    pub fn erased_byte(&self) -> u8 {
        match (&self.ext_csd, &self.scr) {
            (Some(ext), _) => ext.erased_byte(),
            (_, Some(scr)) if scr.data_stat_after_erase => 0xFF,
            _ => 0x00,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(value: u128) -> [u32; 4] {
        [
            (value >> 96) as u32,
            (value >> 64) as u32,
            (value >> 32) as u32,
            value as u32,
        ]
    }

    #[test]
    fn bit_extraction_spans_words() {
        let raw = pack(0xFFFF_0000_0000_0000_0000_0003_C000_0000u128);
        assert_eq!(bits(&raw, 30, 4), 0xF);
        assert_eq!(bits(&raw, 112, 16), 0xFFFF);
        assert_eq!(bits(&raw, 0, 8), 0);
    }

    #[test]
    fn sd_v2_csd_capacity() {
        // CSD_STRUCTURE=1, TRAN_SPEED=0x32, READ_BL_LEN=9, C_SIZE=0x3B37
        let mut v: u128 = 1 << 126;
        v |= 0x32 << 96;
        v |= 0x5B5 << 84;
        v |= 9 << 80;
        v |= 0x3B37 << 48;
        v |= 0x7F << 39;
        let csd = Csd::parse_sd(pack(v));
        assert_eq!(csd.structure, 1);
        assert_eq!(csd.max_transfer_hz, 25_000_000);
        assert_eq!(csd.capacity_blocks, (0x3B37 + 1) * 1024);
        assert_eq!(csd.command_classes, 0x5B5);
        assert_eq!(csd.erase.sector_size, 0x7F);
    }

    #[test]
    fn mmc_csd_erase_geometry() {
        let mut v: u128 = 3 << 126;
        v |= 4 << 122;
        v |= 0x32 << 96;
        v |= 9 << 80;
        v |= 31 << 42;
        v |= 31 << 37;
        v |= 1 << 31;
        let csd = Csd::parse_mmc(pack(v));
        assert_eq!(csd.spec_version, 4);
        assert_eq!(csd.max_transfer_hz, 26_000_000);
        assert_eq!(csd.erase.erase_grp_size, 31);
        assert_eq!(csd.erase.erase_grp_mult, 31);
        assert!(csd.erase.wp_grp_enable);

        let mut card = Card::new(CardType::EmmcHc, 0);
        card.csd = Some(csd);
        assert_eq!(card.erase_group_blocks(), 1024);
        assert_eq!(card.wp_group_blocks(), 1024);

        let mut ext = vec![0u8; 512];
        ext[ext_csd::ERASE_GROUP_DEF] = 1;
        ext[ext_csd::HC_ERASE_GRP_SIZE] = 2;
        ext[ext_csd::HC_WP_GRP_SIZE] = 3;
        card.ext_csd = Some(ExtCsd::new(ext));
        assert_eq!(card.erase_group_blocks(), 2048);
        assert_eq!(card.wp_group_blocks(), 6 * 1024);
    }

    #[test]
    fn mmc_cid_fields() {
        let mut v: u128 = 0x15 << 120;
        v |= 1 << 112;
        v |= 0x01 << 104;
        for (i, c) in b"SIMMC1".iter().enumerate() {
            v |= (*c as u128) << (96 - i * 8);
        }
        v |= 0x10 << 48;
        v |= 0x1234_5678 << 16;
        v |= 0x3C << 8;
        let cid = Cid::parse_mmc(pack(v));
        assert_eq!(cid.manufacturer_id, 0x15);
        assert_eq!(cid.device_type, 1);
        assert_eq!(cid.product_name, "SIMMC1");
        assert_eq!(cid.serial, 0x1234_5678);
        assert_eq!(cid.month, 3);
        assert_eq!(cid.year, 2009);
    }

    #[test]
    fn scr_and_cis() {
        let scr = Scr::parse([0x02, 0x85, 0x80, 0x02, 0, 0, 0, 0]);
        assert_eq!(scr.version(), 300);
        assert!(scr.data_stat_after_erase);
        assert_eq!(scr.bus_widths, 0x5);
        assert!(scr.supports_cmd23());

        let mut info = SdioInfo::default();
        info.apply_cis(&[
            0x21, 0x02, 0x0C, 0x00, 0x20, 0x04, 0x96, 0x02, 0x01, 0x00, 0x22, 0x04, 0x00, 0x00,
            0x02, 0x32, 0xFF, 0xAA,
        ]);
        assert_eq!(info.manufacturer, 0x0296);
        assert_eq!(info.card_id, 0x0001);
        assert_eq!(info.fn0_max_block, 512);
        assert_eq!(info.max_tran_speed, 0x32);
        assert_eq!(info.cis.len(), 17);
    }

    #[test]
    fn byte_addressing_for_standard_capacity() {
        let card = Card::new(CardType::Sd, 0);
        assert_eq!(card.data_arg(3), Some(1536));
        assert_eq!(card.data_arg(u32::MAX), None);
        let hc = Card::new(CardType::Sdhc, 0);
        assert_eq!(hc.data_arg(3), Some(3));
    }
}
