//! EXT_CSD access and the eMMC features configured through it: boot and
//! partition setup, cache, background operations, HPI and power-off
//! notification.

use sdhc_hw::card::{ext_csd, opcode, switch};
use tracing::{debug, info};

use crate::card::ExtCsd;
use crate::command::{Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};

/// Partition a boot attempt loads from (PARTITION_CONFIG bits 5:3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPartition {
    Disabled,
    Boot1,
    Boot2,
    User,
}

impl BootPartition {
    fn code(self) -> u8 {
        match self {
            BootPartition::Disabled => 0,
            BootPartition::Boot1 => 1,
            BootPartition::Boot2 => 2,
            BootPartition::User => 7,
        }
    }
}

/// Partition that data commands address (PARTITION_CONFIG bits 2:0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    User,
    Boot1,
    Boot2,
    Rpmb,
    /// General purpose partition 1 to 4
    General(u8),
}

impl Partition {
    pub fn access_code(self) -> Result<u8> {
        Ok(match self {
            Partition::User => ext_csd::PART_ACCESS_USER,
            Partition::Boot1 => ext_csd::PART_ACCESS_BOOT1,
            Partition::Boot2 => ext_csd::PART_ACCESS_BOOT2,
            Partition::Rpmb => ext_csd::PART_ACCESS_RPMB,
            Partition::General(n @ 1..=4) => 3 + n,
            Partition::General(_) => {
                return Err(Error::InvalidRequest("general purpose partition must be 1 to 4"));
            }
        })
    }
}

/// Value written to POWER_OFF_NOTIFICATION
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOffNotice {
    PoweredOn,
    Short,
    Long,
}

/// Writes a little-endian multi-byte field one switch at a time
fn le_field(value: u32, width: usize) -> impl Iterator<Item = (usize, u8)> {
    value.to_le_bytes().into_iter().take(width).enumerate()
}

impl Host {
    /// CMD8 on an MMC: one 512-byte block of EXT_CSD
    pub(crate) fn read_ext_csd_locked(&self, st: &mut HostState) -> Result<ExtCsd> {
        let mut raw = vec![0u8; ext_csd::SIZE];
        let mut desc = DataDescriptor::read(&mut raw, ext_csd::SIZE);
        self.do_request(
            st,
            &Command::new(opcode::SEND_EXT_CSD, 0, ResponseType::R1),
            Some(&mut desc),
        )?;
        Ok(ExtCsd::new(raw))
    }

    /// Re-reads EXT_CSD from the card and refreshes the cached copy
    pub fn read_ext_csd(&self) -> Result<ExtCsd> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let ext = self.read_ext_csd_locked(st)?;
        self.card(st)?.ext_csd = Some(ext.clone());
        Ok(ext)
    }

    /// Writes one EXT_CSD byte with CMD6
    pub fn write_ext_csd(&self, index: usize, value: u8) -> Result<()> {
        let mut st = self.lock();
        self.mmc_switch(&mut st, index, value)
    }

    /// Sets or clears bits of one EXT_CSD byte
    pub fn modify_ext_csd(&self, index: usize, bits: u8, set: bool) -> Result<()> {
        let mut st = self.lock();
        let access = if set { switch::ACCESS_SET_BITS } else { switch::ACCESS_CLEAR_BITS };
        self.mmc_switch_access(&mut st, access, index, bits)
    }

    fn ext_byte(&self, st: &mut HostState, index: usize) -> Result<u8> {
        self.card(st)?
            .ext_csd
            .as_ref()
            .map(|e| e.byte(index))
            .ok_or(Error::UnsupportedMode("card has no EXT_CSD"))
    }

    /// Selects the boot partition and boot acknowledge
    pub fn set_boot_partition(&self, boot: BootPartition, ack: bool) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        let current = self.ext_byte(st, ext_csd::PARTITION_CONFIG)?;
        let mut value = (current & ext_csd::PART_ACCESS_MASK) | (boot.code() << ext_csd::PART_ENABLE_SHIFT);
        if ack {
            value |= ext_csd::BOOT_ACK;
        }
        self.mmc_switch(st, ext_csd::PARTITION_CONFIG, value)?;
        info!(?boot, ack, "boot partition configured");
        Ok(())
    }

    /// Points data commands at `partition`
    pub fn select_partition(&self, partition: Partition) -> Result<()> {
        let mut st = self.lock();
        self.select_partition_locked(&mut st, partition)
    }

    pub(crate) fn select_partition_locked(&self, st: &mut HostState, partition: Partition) -> Result<()> {
        self.require_mmc(st)?;
        let code = partition.access_code()?;
        let current = self.ext_byte(st, ext_csd::PARTITION_CONFIG)?;
        if current & ext_csd::PART_ACCESS_MASK == code {
            return Ok(());
        }
        let value = (current & !ext_csd::PART_ACCESS_MASK) | code;
        self.mmc_switch(st, ext_csd::PARTITION_CONFIG, value)?;
        debug!(?partition, "partition selected");
        Ok(())
    }

    pub fn set_boot_bus_conditions(&self, value: u8) -> Result<()> {
        let mut st = self.lock();
        self.mmc_switch(&mut st, ext_csd::BOOT_BUS_CONDITIONS, value)
    }

    pub fn set_boot_config_protection(&self, value: u8) -> Result<()> {
        let mut st = self.lock();
        self.mmc_switch(&mut st, ext_csd::BOOT_CONFIG_PROT, value)
    }

    /// Programs the enhanced user data area. `start` is in the card's data
    /// address units, `size_mult` in high-capacity write-protect groups.
    /// Takes effect after [`Host::complete_partitioning`] and a power cycle.
    pub fn set_enhanced_area(&self, start: u32, size_mult: u32) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_partitioning_open(st)?;
        if size_mult > 0x00FF_FFFF {
            return Err(Error::InvalidRequest("enhanced size multiplier is 24 bits"));
        }
        for (i, b) in le_field(start, 4) {
            self.mmc_switch(st, ext_csd::ENH_START_ADDR + i, b)?;
        }
        for (i, b) in le_field(size_mult, 3) {
            self.mmc_switch(st, ext_csd::ENH_SIZE_MULT + i, b)?;
        }
        self.mmc_switch_access(st, switch::ACCESS_SET_BITS, ext_csd::PARTITIONS_ATTRIBUTE, 1)?;
        info!(start, size_mult, "enhanced user area set");
        Ok(())
    }

    /// Sizes general purpose partition `index` (1 to 4)
    pub fn set_gp_partition_size(&self, index: u8, size_mult: u32) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_partitioning_open(st)?;
        if !(1..=4).contains(&index) || size_mult > 0x00FF_FFFF {
            return Err(Error::InvalidRequest("bad general purpose partition"));
        }
        let base = ext_csd::GP_SIZE_MULT + 3 * (index as usize - 1);
        for (i, b) in le_field(size_mult, 3) {
            self.mmc_switch(st, base + i, b)?;
        }
        info!(index, size_mult, "general purpose partition sized");
        Ok(())
    }

    /// Sets PARTITION_SETTING_COMPLETED; the layout is fixed after this
    pub fn complete_partitioning(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_partitioning_open(st)?;
        self.mmc_switch(st, ext_csd::PARTITION_SETTING_COMPLETED, 1)?;
        info!("partition setting completed");
        Ok(())
    }

    fn require_partitioning_open(&self, st: &mut HostState) -> Result<()> {
        self.require_mmc(st)?;
        if self.ext_byte(st, ext_csd::PARTITION_SUPPORT)? & 1 == 0 {
            return Err(Error::UnsupportedMode("card does not support partitioning"));
        }
        if self.ext_byte(st, ext_csd::PARTITION_SETTING_COMPLETED)? & 1 != 0 {
            return Err(Error::InvalidRequest("partitioning already completed"));
        }
        Ok(())
    }

    /// Configures context `id` (1 to 15)
    pub fn configure_context(&self, id: u8, value: u8) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        if !(1..=15).contains(&id) {
            return Err(Error::InvalidRequest("context id must be 1 to 15"));
        }
        self.mmc_switch(st, ext_csd::CONTEXT_CONF + id as usize - 1, value)
    }

    pub fn set_cache(&self, enable: bool) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        if self.card(st)?.ext_csd.as_ref().map_or(0, |e| e.cache_size_kb()) == 0 {
            return Err(Error::UnsupportedMode("card has no cache"));
        }
        self.mmc_switch(st, ext_csd::CACHE_CTRL, if enable { ext_csd::CACHE_EN } else { 0 })?;
        info!(enable, "cache");
        Ok(())
    }

    /// Writes back the card cache. A no-op when the cache is off.
    pub fn flush_cache(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        if self.ext_byte(st, ext_csd::CACHE_CTRL)? & ext_csd::CACHE_EN == 0 {
            return Ok(());
        }
        self.mmc_switch(st, ext_csd::FLUSH_CACHE, 1)?;
        debug!("cache flushed");
        Ok(())
    }

    /// Enables manual background operations (write-once on most parts)
    pub fn enable_bkops(&self) -> Result<()> {
        let mut st = self.lock();
        self.modify_bits(&mut st, ext_csd::BKOPS_EN, ext_csd::BKOPS_MANUAL_EN)
    }

    /// Starts a manual background operation and waits for it to finish
    pub fn start_bkops(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        if self.ext_byte(st, ext_csd::BKOPS_EN)? & ext_csd::BKOPS_MANUAL_EN == 0 {
            return Err(Error::UnsupportedMode("background operations not enabled"));
        }
        self.mmc_switch(st, ext_csd::BKOPS_START, 1)
    }

    pub fn enable_hpi(&self) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.require_mmc(st)?;
        if self.ext_byte(st, ext_csd::HPI_FEATURES)? & ext_csd::HPI_SUPPORTED == 0 {
            return Err(Error::UnsupportedMode("card does not support HPI"));
        }
        self.modify_bits(st, ext_csd::HPI_MGMT, ext_csd::HPI_EN)
    }

    pub fn notify_power_off(&self, notice: PowerOffNotice) -> Result<()> {
        let value = match notice {
            PowerOffNotice::PoweredOn => ext_csd::POWER_ON,
            PowerOffNotice::Short => ext_csd::POWER_OFF_SHORT,
            PowerOffNotice::Long => ext_csd::POWER_OFF_LONG,
        };
        let mut st = self.lock();
        self.mmc_switch(&mut st, ext_csd::POWER_OFF_NOTIFICATION, value)
    }

    /// Switches erase and write-protect geometry to the high-capacity
    /// definitions in EXT_CSD
    pub fn set_erase_group_def(&self, enable: bool) -> Result<()> {
        let mut st = self.lock();
        self.mmc_switch(&mut st, ext_csd::ERASE_GROUP_DEF, enable as u8)
    }

    /// Turns on exception reporting for packed command failures
    pub(crate) fn enable_packed_events(&self, st: &mut HostState) -> Result<()> {
        if self.ext_byte(st, ext_csd::EXCEPTION_EVENTS_CTRL)? & ext_csd::PACKED_EVENT_EN != 0 {
            return Ok(());
        }
        self.modify_bits(st, ext_csd::EXCEPTION_EVENTS_CTRL, ext_csd::PACKED_EVENT_EN)
    }

    fn modify_bits(&self, st: &mut HostState, index: usize, bits: u8) -> Result<()> {
        self.mmc_switch_access(st, switch::ACCESS_SET_BITS, index, bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_access_codes() {
        assert_eq!(Partition::User.access_code(), Ok(0));
        assert_eq!(Partition::Rpmb.access_code(), Ok(3));
        assert_eq!(Partition::General(1).access_code(), Ok(4));
        assert_eq!(Partition::General(4).access_code(), Ok(7));
        assert!(Partition::General(5).access_code().is_err());
    }

    #[test]
    fn multi_byte_fields_are_little_endian() {
        let bytes: Vec<_> = le_field(0x0012_3456, 3).collect();
        assert_eq!(bytes, vec![(0, 0x56), (1, 0x34), (2, 0x12)]);
    }
}
