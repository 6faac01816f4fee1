//! Embedded SD partition queries (CMD45).

use sdhc_hw::card::{esd, opcode};
use tracing::debug;

use crate::command::{Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::Host;

/// What a CMD45 query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionQuery {
    Device,
    Partition(u8),
}

impl PartitionQuery {
    fn argument(self) -> u32 {
        let (subcommand, id) = match self {
            PartitionQuery::Device => (esd::QUERY_DEVICE_ATTRIBUTES, 0),
            PartitionQuery::Partition(id) => (esd::QUERY_PARTITION_ATTRIBUTES, id),
        };
        ((subcommand as u32) << esd::SUBCOMMAND_SHIFT) | ((id as u32) << esd::PARTITION_SHIFT)
    }
}

impl Host {
    /// Reads one attribute block from an embedded SD device. Cards without
    /// partition support reject the command.
    pub fn query_partition(&self, query: PartitionQuery) -> Result<Vec<u8>> {
        let mut st = self.lock();
        let st = &mut *st;
        if !self.card(st)?.card_type.is_sd() {
            return Err(Error::UnsupportedMode("partition queries need an SD card"));
        }
        let mut block = vec![0u8; esd::RESPONSE_SIZE];
        let mut desc = DataDescriptor::read(&mut block, esd::RESPONSE_SIZE).pio();
        self.do_request(
            st,
            &Command::new(opcode::QUERY_PARTITION, query.argument(), ResponseType::R1),
            Some(&mut desc),
        )?;
        debug!(?query, "partition attributes read");
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_argument_layout() {
        assert_eq!(PartitionQuery::Device.argument(), 0xA100_0000);
        assert_eq!(PartitionQuery::Partition(2).argument(), 0xB102_0000);
    }
}
