//! Write protection at write-protect group granularity, plus the eMMC
//! user and boot area protection bytes.

use sdhc_hw::card::{ext_csd, opcode};
use tracing::info;

use crate::command::{Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};

/// Per-group protection reported by SEND_WRITE_PROT_TYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProtectType {
    None,
    Temporary,
    PowerOn,
    Permanent,
}

impl WriteProtectType {
    fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => WriteProtectType::None,
            1 => WriteProtectType::Temporary,
            2 => WriteProtectType::PowerOn,
            _ => WriteProtectType::Permanent,
        }
    }
}

impl Host {
    /// Write-protect group size in blocks
    pub fn wp_group_blocks(&self) -> Result<u32> {
        let mut st = self.lock();
        Ok(self.card(&mut st)?.wp_group_blocks())
    }

    /// Protects every group overlapping `start..start + blocks`
    pub fn set_write_protect(&self, start: u32, blocks: u32) -> Result<()> {
        let mut st = self.lock();
        self.write_protect_range(&mut st, opcode::SET_WRITE_PROT, start, blocks)
    }

    pub fn clear_write_protect(&self, start: u32, blocks: u32) -> Result<()> {
        let mut st = self.lock();
        self.write_protect_range(&mut st, opcode::CLR_WRITE_PROT, start, blocks)
    }

    fn write_protect_range(&self, st: &mut HostState, op: u8, start: u32, blocks: u32) -> Result<()> {
        self.require_memory(st)?;
        let card = self.card(st)?;
        let group = card.wp_group_blocks().max(1);
        let end = start
            .checked_add(blocks)
            .filter(|e| *e as u64 <= card.capacity_blocks())
            .ok_or(Error::InvalidRequest("write-protect range runs past the end of the card"))?;
        if card.csd.as_ref().is_some_and(|c| !c.erase.wp_grp_enable) {
            return Err(Error::UnsupportedMode("card has no group write protection"));
        }

        let mut at = start - start % group;
        while at < end {
            let arg = self.card(st)?.data_arg(at).ok_or(Error::InvalidRequest("block address overflow"))?;
            self.do_request(
                st,
                &Command::new(op, arg, ResponseType::R1b).with_timeout(self.config.busy_timeout),
                None,
            )?;
            self.wait_ready_locked(st, self.config.busy_timeout)?;
            at = match at.checked_add(group) {
                Some(next) => next,
                None => break,
            };
        }
        info!(start, blocks, set = op == opcode::SET_WRITE_PROT, "write protection changed");
        Ok(())
    }

    /// Protection bits of the 32 groups starting at the group holding
    /// `block`; bit 0 is that group
    pub fn write_protect_status(&self, block: u32) -> Result<u32> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_memory(st)?;
        let mut raw = [0u8; 4];
        self.wp_query(st, opcode::SEND_WRITE_PROT, block, &mut raw)?;
        Ok(u32::from_be_bytes(raw))
    }

    /// Protection types of the 32 groups starting at the group holding
    /// `block` (eMMC only)
    pub fn write_protect_types(&self, block: u32) -> Result<Vec<WriteProtectType>> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let mut raw = [0u8; 8];
        self.wp_query(st, opcode::SEND_WRITE_PROT_TYPE, block, &mut raw)?;
        let bits = u64::from_be_bytes(raw);
        Ok((0..32).map(|g| WriteProtectType::from_bits(bits >> (2 * g))).collect())
    }

    fn wp_query(&self, st: &mut HostState, op: u8, block: u32, out: &mut [u8]) -> Result<()> {
        let card = self.card(st)?;
        let group = card.wp_group_blocks().max(1);
        let arg = card
            .data_arg(block - block % group)
            .ok_or(Error::InvalidRequest("block address overflow"))?;
        let len = out.len();
        let mut desc = DataDescriptor::read(out, len).pio();
        self.do_request(st, &Command::new(op, arg, ResponseType::R1), Some(&mut desc))?;
        Ok(())
    }

    /// Writes USER_WP (eMMC user area protection mode)
    pub fn set_user_wp(&self, value: u8) -> Result<()> {
        let mut st = self.lock();
        self.mmc_switch(&mut st, ext_csd::USER_WP, value)
    }

    /// Writes BOOT_WP (boot area power-on/permanent protection)
    pub fn set_boot_wp(&self, value: u8) -> Result<()> {
        let mut st = self.lock();
        self.mmc_switch(&mut st, ext_csd::BOOT_WP, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_type_uses_low_two_bits() {
        assert_eq!(WriteProtectType::from_bits(0b00), WriteProtectType::None);
        assert_eq!(WriteProtectType::from_bits(0b01), WriteProtectType::Temporary);
        assert_eq!(WriteProtectType::from_bits(0b110), WriteProtectType::PowerOn);
        assert_eq!(WriteProtectType::from_bits(0b11), WriteProtectType::Permanent);
    }
}
