//! eMMC packed commands: several reads or writes announced in one header
//! block and moved as a single multi-block transfer.

use sdhc_hw::card::{ext_csd, opcode, packed};
use sdhc_hw::specs::block::{MAX_COUNT, SIZE as BLOCK};
use tracing::{debug, warn};

use crate::command::{CardStatus, Command, ResponseType};
use crate::data::DataDescriptor;
use crate::error::{Error, Result};
use crate::host::{Host, HostState};
use crate::io::{block_count_argument, BlockCountFlags};

/// One read or write carried by a packed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedEntry {
    pub block: u32,
    pub blocks: u16,
    /// Reliable write for this entry (writes only)
    pub reliable: bool,
}

/// PACKED_COMMAND_STATUS and PACKED_FAILURE_INDEX after a packed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedStatus {
    pub status: u8,
    /// One-based index of the entry that failed
    pub failure_index: u8,
}

impl PackedStatus {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Builds the header block. `data_arg` maps a block number to the card's
/// data address.
pub fn encode_header(
    kind: u8,
    entries: &[PackedEntry],
    data_arg: impl Fn(u32) -> Option<u32>,
) -> Result<[u8; BLOCK]> {
    if entries.is_empty() || (entries.len() + 1) * packed::ENTRY_SIZE > BLOCK {
        return Err(Error::InvalidRequest("packed command needs 1 to 63 entries"));
    }
    let mut header = [0u8; BLOCK];
    header[0] = packed::VERSION;
    header[1] = kind;
    header[2] = entries.len() as u8;
    for (i, e) in entries.iter().enumerate() {
        let flags = if e.reliable && kind == packed::WRITE {
            BlockCountFlags::RELIABLE_WRITE
        } else {
            BlockCountFlags::empty()
        };
        let count = block_count_argument(e.blocks, flags, 0);
        let addr = data_arg(e.block).ok_or(Error::InvalidRequest("block address overflow"))?;
        let at = (i + 1) * packed::ENTRY_SIZE;
        header[at..at + 4].copy_from_slice(&count.to_le_bytes());
        header[at + 4..at + 8].copy_from_slice(&addr.to_le_bytes());
    }
    Ok(header)
}

impl Host {
    /// Writes every `(block, data)` pair in one packed command. Each data
    /// slice must be a whole number of blocks.
    pub fn packed_write(&self, writes: &[(u32, &[u8])], reliable: bool) -> Result<PackedStatus> {
        let mut st = self.lock();
        let st = &mut *st;
        let entries = self.packed_entries(st, writes.iter().map(|(b, d)| (*b, d.len())), reliable, true)?;
        let header = {
            let card = self.card(st)?;
            encode_header(packed::WRITE, &entries, |b| card.data_arg(b))?
        };
        let total = 1 + entries.iter().map(|e| e.blocks as usize).sum::<usize>();
        let mut payload = Vec::with_capacity(total * BLOCK);
        payload.extend_from_slice(&header);
        for (_, data) in writes {
            payload.extend_from_slice(data);
        }

        let mut flags = BlockCountFlags::PACKED;
        if reliable {
            flags |= BlockCountFlags::RELIABLE_WRITE;
        }
        let first = entries[0].block;
        let result = self.packed_transfer_write(st, first, &payload, flags);
        let status = self.packed_outcome(st, result)?;
        debug!(entries = entries.len(), blocks = total - 1, "packed write");
        Ok(status)
    }

    /// Reads every `(block, buffer)` pair in one packed command
    pub fn packed_read(&self, reads: &mut [(u32, &mut [u8])]) -> Result<PackedStatus> {
        let mut st = self.lock();
        let st = &mut *st;
        let entries = self.packed_entries(st, reads.iter().map(|(b, d)| (*b, d.len())), false, false)?;
        let header = {
            let card = self.card(st)?;
            encode_header(packed::READ, &entries, |b| card.data_arg(b))?
        };
        let blocks: usize = entries.iter().map(|e| e.blocks as usize).sum();
        let first = entries[0].block;

        let header_sent = self.packed_transfer_write(st, first, &header, BlockCountFlags::PACKED);
        if header_sent.is_err() {
            return self.packed_outcome(st, header_sent);
        }
        let mut data = vec![0u8; blocks * BLOCK];
        let result = self.packed_transfer_read(st, first, &mut data, blocks as u16);
        let status = self.packed_outcome(st, result)?;

        let mut at = 0;
        for (_, buf) in reads.iter_mut() {
            buf.copy_from_slice(&data[at..at + buf.len()]);
            at += buf.len();
        }
        debug!(entries = entries.len(), blocks, "packed read");
        Ok(status)
    }

    fn packed_entries(
        &self,
        st: &mut HostState,
        items: impl Iterator<Item = (u32, usize)>,
        reliable: bool,
        write: bool,
    ) -> Result<Vec<PackedEntry>> {
        self.require_mmc(st)?;
        let card = self.card(st)?;
        let (limit, capacity) = match &card.ext_csd {
            Some(e) if write => (e.max_packed_writes(), card.capacity_blocks()),
            Some(e) => (e.max_packed_reads(), card.capacity_blocks()),
            None => (0, 0),
        };
        if limit == 0 {
            return Err(Error::UnsupportedMode("card does not support packed commands"));
        }
        if card.locked {
            return Err(Error::CardStatus(CardStatus::CARD_IS_LOCKED));
        }

        let mut entries = Vec::new();
        let mut total = 1usize;
        for (block, len) in items {
            if len == 0 || len % BLOCK != 0 {
                return Err(Error::InvalidRequest("packed entries must be whole blocks"));
            }
            let blocks = len / BLOCK;
            if block as u64 + blocks as u64 > capacity {
                return Err(Error::InvalidRequest("packed entry runs past the end of the card"));
            }
            total += blocks;
            entries.push(PackedEntry {
                block,
                blocks: blocks as u16,
                reliable,
            });
        }
        if entries.is_empty() || entries.len() > limit as usize {
            return Err(Error::InvalidRequest("too many packed entries for this card"));
        }
        if total > MAX_COUNT as usize {
            return Err(Error::InvalidRequest("packed command longer than one transfer"));
        }
        self.enable_packed_events(st)?;
        Ok(entries)
    }

    /// CMD23 with the packed flag, then CMD25 carrying `payload`
    fn packed_transfer_write(&self, st: &mut HostState, first: u32, payload: &[u8], flags: BlockCountFlags) -> Result<()> {
        let blocks = (payload.len() / BLOCK) as u16;
        let arg = self.card(st)?.data_arg(first).ok_or(Error::InvalidRequest("block address overflow"))?;
        self.do_request(
            st,
            &Command::new(opcode::SET_BLOCK_COUNT, block_count_argument(blocks, flags, 0), ResponseType::R1),
            None,
        )?;
        let mut desc = DataDescriptor::write(payload, BLOCK);
        self.do_request(
            st,
            &Command::new(opcode::WRITE_MULTIPLE_BLOCK, arg, ResponseType::R1).with_retries(0),
            Some(&mut desc),
        )?;
        self.wait_ready_locked(st, self.config.busy_timeout)?;
        Ok(())
    }

    fn packed_transfer_read(&self, st: &mut HostState, first: u32, data: &mut [u8], blocks: u16) -> Result<()> {
        let arg = self.card(st)?.data_arg(first).ok_or(Error::InvalidRequest("block address overflow"))?;
        self.do_request(
            st,
            &Command::new(
                opcode::SET_BLOCK_COUNT,
                block_count_argument(blocks, BlockCountFlags::PACKED, 0),
                ResponseType::R1,
            ),
            None,
        )?;
        let mut desc = DataDescriptor::read(data, BLOCK);
        self.do_request(
            st,
            &Command::new(opcode::READ_MULTIPLE_BLOCK, arg, ResponseType::R1).with_retries(0),
            Some(&mut desc),
        )?;
        Ok(())
    }

    /// Turns the transfer result plus the card's exception state into the
    /// packed outcome, reading EXT_CSD when the card flagged a failure
    fn packed_outcome(&self, st: &mut HostState, result: Result<()>) -> Result<PackedStatus> {
        let status = self.send_status(st)?;
        if result.is_ok() && !status.contains(CardStatus::EXCEPTION_EVENT) {
            return Ok(PackedStatus::default());
        }
        let ext = self.read_ext_csd_locked(st)?;
        let packed_status = PackedStatus {
            status: ext.byte(ext_csd::PACKED_COMMAND_STATUS),
            failure_index: ext.byte(ext_csd::PACKED_FAILURE_INDEX),
        };
        self.card(st)?.ext_csd = Some(ext);
        if !packed_status.is_ok() {
            warn!(
                index = packed_status.failure_index,
                status = packed_status.status,
                "packed command failed"
            );
            return Err(Error::PackedCommandPartialFailure {
                index: packed_status.failure_index,
                status: packed_status.status,
            });
        }
        result.map(|()| packed_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdhc_hw::card::block_count_arg;

    #[test]
    fn header_layout() {
        let entries = [
            PackedEntry { block: 0x100, blocks: 4, reliable: true },
            PackedEntry { block: 0x200, blocks: 2, reliable: false },
        ];
        let h = encode_header(packed::WRITE, &entries, Some).unwrap();
        assert_eq!(&h[..4], &[packed::VERSION, packed::WRITE, 2, 0]);
        assert_eq!(&h[4..8], &[0; 4]);
        let c1 = u32::from_le_bytes(h[8..12].try_into().unwrap());
        assert_eq!(c1, 4 | block_count_arg::RELIABLE_WRITE);
        assert_eq!(u32::from_le_bytes(h[12..16].try_into().unwrap()), 0x100);
        assert_eq!(u32::from_le_bytes(h[16..20].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(h[20..24].try_into().unwrap()), 0x200);
        assert!(h[24..].iter().all(|b| *b == 0));
    }

    #[test]
    fn read_headers_never_carry_reliable_write() {
        let entries = [PackedEntry { block: 1, blocks: 1, reliable: true }];
        let h = encode_header(packed::READ, &entries, |b| b.checked_mul(512)).unwrap();
        assert_eq!(u32::from_le_bytes(h[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(h[12..16].try_into().unwrap()), 512);
    }

    #[test]
    fn header_entry_limit() {
        let many = vec![PackedEntry { block: 0, blocks: 1, reliable: false }; 64];
        assert!(encode_header(packed::WRITE, &many, Some).is_err());
        assert!(encode_header(packed::WRITE, &many[..63], Some).is_ok());
        assert!(encode_header(packed::WRITE, &[], Some).is_err());
    }
}
