//! Register images the card hands out: CID, CSD, SCR and the SD switch
//! status block.
//!
//! Long registers are built as a `u128` with bit 127 first on the wire. The
//! controller strips the CRC byte when it stores an R2 response.

use sdhc_hw::card::{sd_switch, tran_speed};

use crate::config::{CardConfig, CardKind};

/// Stores `value` in `width` bits starting at bit `start`
fn put(reg: &mut u128, start: u32, width: u32, value: u64) {
    let mask = if width >= 64 { u64::MAX as u128 } else { (1u128 << width) - 1 };
    *reg &= !(mask << start);
    *reg |= (value as u128 & mask) << start;
}

/// CRC7 (x^7 + x^3 + 1) over `bytes`
pub(crate) fn crc7(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in bytes {
        for bit in (0..8).rev() {
            let input = (byte >> bit) & 1;
            let top = (crc >> 6) & 1;
            crc = (crc << 1) & 0x7F;
            if input ^ top != 0 {
                crc ^= 0x09;
            }
        }
    }
    crc
}

/// Fills in the CRC7 and end bit in bits 7:0
fn seal(mut reg: u128) -> u128 {
    let bytes = reg.to_be_bytes();
    let crc = crc7(&bytes[..15]);
    put(&mut reg, 0, 8, ((crc as u64) << 1) | 1);
    reg
}

fn put_name(reg: &mut u128, top_bit: u32, name: &[u8]) {
    for (i, c) in name.iter().enumerate() {
        put(reg, top_bit - 7 - i as u32 * 8, 8, *c as u64);
    }
}

pub(crate) fn sd_cid(config: &CardConfig) -> u128 {
    let mut cid = 0u128;
    put(&mut cid, 120, 8, 0x03);
    put(&mut cid, 104, 16, u16::from_be_bytes(*b"SM") as u64);
    put_name(&mut cid, 103, b"SIMSD");
    put(&mut cid, 56, 8, 0x10);
    put(&mut cid, 24, 32, config.serial as u64);
    // June 2024
    put(&mut cid, 8, 12, (24 << 4) | 6);
    seal(cid)
}

pub(crate) fn mmc_cid(config: &CardConfig) -> u128 {
    let mut cid = 0u128;
    put(&mut cid, 120, 8, 0x15);
    put(&mut cid, 112, 2, (config.kind == CardKind::Emmc) as u64);
    put(&mut cid, 104, 8, 0x01);
    put_name(&mut cid, 103, b"SIMMMC");
    put(&mut cid, 48, 8, 0x10);
    put(&mut cid, 16, 32, config.serial as u64);
    // June 2007
    put(&mut cid, 8, 8, (6 << 4) | 10);
    seal(cid)
}

/// Largest user area the CSD can express for `kind`, rounded to its
/// capacity granularity
pub(crate) fn visible_blocks(kind: CardKind, blocks: u64) -> u64 {
    match kind {
        CardKind::Sdsc | CardKind::Mmc => (blocks / 512).clamp(1, 4096) * 512,
        CardKind::Sdhc | CardKind::Sdxc => (blocks / 1024).clamp(1, 1 << 22) * 1024,
        CardKind::Emmc => blocks.min(u32::MAX as u64),
        CardKind::Sdio => 0,
    }
}

pub(crate) fn sd_csd(kind: CardKind, blocks: u64) -> u128 {
    let mut csd = 0u128;
    put(&mut csd, 112, 8, 0x0E);
    put(&mut csd, 96, 8, tran_speed::SD_25MHZ as u64);
    put(&mut csd, 80, 4, 9);
    put(&mut csd, 46, 1, 1);
    put(&mut csd, 39, 7, 0x7F);
    put(&mut csd, 26, 3, 2);
    put(&mut csd, 22, 4, 9);
    if kind == CardKind::Sdsc {
        put(&mut csd, 84, 12, 0x5F5);
        put(&mut csd, 79, 1, 1);
        put(&mut csd, 62, 12, blocks / 512 - 1);
        put(&mut csd, 59, 3, 7);
        put(&mut csd, 56, 3, 6);
        put(&mut csd, 53, 3, 7);
        put(&mut csd, 50, 3, 6);
        put(&mut csd, 47, 3, 7);
        put(&mut csd, 31, 1, 1);
        put(&mut csd, 21, 1, 1);
    } else {
        put(&mut csd, 126, 2, 1);
        put(&mut csd, 84, 12, 0x5B5);
        put(&mut csd, 48, 22, blocks / 1024 - 1);
    }
    seal(csd)
}

/// SD CSD with TRAN_SPEED raised to what `access_mode` runs at
pub(crate) fn sd_csd_at(csd: u128, access_mode: u8) -> u128 {
    let code = match access_mode {
        sd_switch::ACCESS_SDR25 => tran_speed::SD_50MHZ,
        sd_switch::ACCESS_SDR50 | sd_switch::ACCESS_DDR50 => tran_speed::SD_100MHZ,
        sd_switch::ACCESS_SDR104 => tran_speed::SD_200MHZ,
        _ => tran_speed::SD_25MHZ,
    };
    let mut csd = csd;
    put(&mut csd, 96, 8, code as u64);
    seal(csd)
}

pub(crate) fn mmc_csd(kind: CardKind, blocks: u64) -> u128 {
    let mut csd = 0u128;
    put(&mut csd, 126, 2, 2);
    put(&mut csd, 122, 4, if kind == CardKind::Emmc { 4 } else { 3 });
    put(&mut csd, 112, 8, 0x27);
    put(&mut csd, 104, 8, 0x01);
    put(&mut csd, 96, 8, 0x32);
    put(&mut csd, 84, 12, 0x8F5);
    put(&mut csd, 80, 4, 9);
    let c_size = if kind == CardKind::Emmc { 0xFFF } else { blocks / 512 - 1 };
    put(&mut csd, 62, 12, c_size);
    put(&mut csd, 47, 3, 7);
    put(&mut csd, 42, 5, 31);
    put(&mut csd, 37, 5, 31);
    put(&mut csd, 31, 1, 1);
    put(&mut csd, 26, 3, 2);
    put(&mut csd, 22, 4, 9);
    seal(csd)
}

pub(crate) fn scr(config: &CardConfig) -> [u8; 8] {
    let security = match config.kind {
        CardKind::Sdsc => 2,
        CardKind::Sdxc => 4,
        _ => 3,
    };
    let cmd_support = if config.cmd23 { 0x02 } else { 0x00 };
    [0x02, 0x80 | (security << 4) | 0x05, 0x80, cmd_support, 0, 0, 0, 0]
}

/// Functions the card offers in each SD switch group, bit n = function n
pub(crate) fn switch_support(group: u8, signal_1v8: bool) -> u16 {
    match (group, signal_1v8) {
        (1, false) => 1 << sd_switch::ACCESS_SDR12 | 1 << sd_switch::ACCESS_SDR25,
        (1, true) => 0x1F,
        (3 | 4, true) => 0xF,
        _ => 0x1,
    }
}

/// Builds the 64-byte CMD6 status: support in bytes 2..14, results in
/// bytes 14..17, version 1
pub(crate) fn switch_status(results: &[u8; 6], signal_1v8: bool) -> Vec<u8> {
    let mut raw = vec![0u8; sd_switch::STATUS_SIZE];
    raw[0..2].copy_from_slice(&200u16.to_be_bytes());
    for group in 1..=6u8 {
        let rel = 6 - group as usize;
        let at = 2 + 2 * rel;
        raw[at..at + 2].copy_from_slice(&switch_support(group, signal_1v8).to_be_bytes());
        let value = results[group as usize - 1] & 0xF;
        let byte = &mut raw[14 + rel / 2];
        if rel % 2 == 0 {
            *byte |= value << 4;
        } else {
            *byte |= value;
        }
    }
    raw[17] = 1;
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(reg: u128, start: u32, width: u32) -> u64 {
        ((reg >> start) & ((1u128 << width) - 1)) as u64
    }

    #[test]
    fn crc7_of_cmd0() {
        // CMD0 with argument 0 is sent as 0x40 00 00 00 00 0x95
        assert_eq!((crc7(&[0x40, 0, 0, 0, 0]) << 1) | 1, 0x95);
    }

    #[test]
    fn sdhc_csd_capacity_field() {
        let csd = sd_csd(CardKind::Sdhc, 8 * 1024 * 2048);
        assert_eq!(word(csd, 126, 2), 1);
        assert_eq!(word(csd, 48, 22), 8 * 2048 - 1);
        assert_eq!(word(csd, 0, 1), 1);
    }

    #[test]
    fn sdsc_csd_capacity_round_trips() {
        let blocks = visible_blocks(CardKind::Sdsc, 256 * 2048);
        let csd = sd_csd(CardKind::Sdsc, blocks);
        let c_size = word(csd, 62, 12);
        let mult = word(csd, 47, 3);
        assert_eq!((c_size + 1) << (mult + 2), blocks);
    }

    #[test]
    fn switch_status_places_results() {
        let mut results = [0u8; 6];
        results[0] = 3;
        results[3] = 1;
        let raw = switch_status(&results, true);
        assert_eq!(raw[16] & 0xF, 3);
        assert_eq!(raw[15] >> 4, 1);
        assert_eq!(u16::from_be_bytes([raw[12], raw[13]]), 0x1F);
    }
}
