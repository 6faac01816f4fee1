//! Block reads and writes against the memory array.
//!
//! Addresses are 512-byte block numbers regardless of card capacity; the
//! byte-offset argument of standard-capacity cards is derived here. Lengths
//! need not be block multiples: a trailing partial block goes through a
//! bounce buffer, read-modify-write on the way out. Transfers longer than the
//! 16-bit block count register are split.

use bitflags::bitflags;
use sdhc_hw::card::{block_count_arg, opcode};
use sdhc_hw::specs::block;
use tracing::debug;

use crate::command::{Command, ResponseType};
use crate::data::{DataBuffer, DataDescriptor};
use crate::error::{Error, Result};
use crate::host::{Host, HostState};
use crate::regs::PresentState;

const BLOCK: usize = block::SIZE;

bitflags! {
    /// CMD23 argument flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockCountFlags: u32 {
        const RELIABLE_WRITE = block_count_arg::RELIABLE_WRITE;
        const PACKED = block_count_arg::PACKED;
        const TAG_REQUEST = block_count_arg::TAG_REQUEST;
        const FORCED_PROGRAMMING = block_count_arg::FORCED_PROGRAMMING;
    }
}

/// CMD23 argument for `blocks` blocks with the given flags and context id
pub fn block_count_argument(blocks: u16, flags: BlockCountFlags, context: u8) -> u32 {
    flags.bits()
        | (((context as u32) << block_count_arg::CONTEXT_SHIFT) & block_count_arg::CONTEXT_MASK)
        | (blocks as u32 & block_count_arg::BLOCKS_MASK)
}

impl Host {
    /// Reads `buf.len()` bytes starting at block `block`. Returns the number
    /// of bytes read, which is short when a stop block was set with
    /// [`Host::set_stop_at_block`].
    pub fn get_data(&self, block: u32, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.lock();
        let st = &mut *st;
        self.check_range(st, block, buf.len())?;

        let full = buf.len() / BLOCK;
        if let Some(stop) = st.stop_at_block.take() {
            return self.read_open_ended(st, block, &mut buf[..full * BLOCK], stop);
        }

        let (whole, tail) = buf.split_at_mut(full * BLOCK);
        self.read_chunked(st, block, whole)?;
        if !tail.is_empty() {
            let mut bounce = [0u8; BLOCK];
            self.read_blocks(st, block + full as u32, &mut bounce)?;
            let n = tail.len();
            tail.copy_from_slice(&bounce[..n]);
        }
        Ok(buf.len())
    }

    /// Writes `buf` starting at block `block`. A trailing partial block keeps
    /// the bytes the card already held past the end of `buf`.
    pub fn send_data(&self, block: u32, buf: &[u8]) -> Result<usize> {
        let mut st = self.lock();
        let st = &mut *st;
        self.check_range(st, block, buf.len())?;
        self.check_writable(st)?;

        let full = buf.len() / BLOCK;
        if let Some(stop) = st.stop_at_block.take() {
            return self.write_open_ended(st, block, &buf[..full * BLOCK], stop);
        }

        let (whole, tail) = buf.split_at(full * BLOCK);
        self.write_chunked(st, block, whole)?;
        if !tail.is_empty() {
            let tail_block = block + full as u32;
            let mut bounce = [0u8; BLOCK];
            self.read_blocks(st, tail_block, &mut bounce)?;
            bounce[..tail.len()].copy_from_slice(tail);
            self.write_blocks(st, tail_block, &bounce)?;
        }
        Ok(buf.len())
    }

    /// Scatter read into whole-block segments; needs ADMA2
    pub fn get_data_vectored(&self, block: u32, segments: Vec<&mut [u8]>) -> Result<usize> {
        let mut st = self.lock();
        let st = &mut *st;
        let buffer = DataBuffer::ScatterRead(segments);
        let len = buffer.len();
        self.check_vectored(st, block, len)?;
        let op = if len == BLOCK {
            opcode::READ_SINGLE_BLOCK
        } else {
            opcode::READ_MULTIPLE_BLOCK
        };
        self.vectored(st, op, block, DataDescriptor::new(buffer, BLOCK))?;
        Ok(len)
    }

    /// Gather write from whole-block segments; needs ADMA2
    pub fn send_data_vectored(&self, block: u32, segments: Vec<&[u8]>) -> Result<usize> {
        let mut st = self.lock();
        let st = &mut *st;
        let buffer = DataBuffer::ScatterWrite(segments);
        let len = buffer.len();
        self.check_vectored(st, block, len)?;
        self.check_writable(st)?;
        let op = if len == BLOCK {
            opcode::WRITE_BLOCK
        } else {
            opcode::WRITE_MULTIPLE_BLOCK
        };
        self.vectored(st, op, block, DataDescriptor::new(buffer, BLOCK))?;
        Ok(len)
    }

    fn vectored(&self, st: &mut HostState, op: u8, block: u32, desc: DataDescriptor<'_>) -> Result<()> {
        let arg = self.card(st)?.data_arg(block).ok_or(Error::InvalidRequest("block address overflow"))?;
        let mut desc = if desc.blocks > 1 { desc.auto_stop() } else { desc };
        self.do_request(st, &Command::new(op, arg, ResponseType::R1), Some(&mut desc))?;
        Ok(())
    }

    fn check_vectored(&self, st: &mut HostState, block: u32, len: usize) -> Result<()> {
        self.check_range(st, block, len)?;
        if len % BLOCK != 0 {
            return Err(Error::InvalidRequest("scatter lists must cover whole blocks"));
        }
        if len / BLOCK > block::MAX_COUNT as usize {
            return Err(Error::InvalidRequest("scatter list longer than one transfer"));
        }
        Ok(())
    }

    fn check_range(&self, st: &mut HostState, block: u32, len: usize) -> Result<()> {
        self.require_memory(st)?;
        if len == 0 {
            return Err(Error::InvalidRequest("empty transfer"));
        }
        let card = self.card(st)?;
        let blocks = len.div_ceil(BLOCK) as u64;
        let capacity = card.capacity_blocks();
        if capacity != 0 && block as u64 + blocks > capacity {
            return Err(Error::InvalidRequest("transfer runs past the end of the card"));
        }
        if card.locked {
            return Err(Error::CardStatus(crate::command::CardStatus::CARD_IS_LOCKED));
        }
        Ok(())
    }

    /// Mechanical write-protect switch and the CSD protection bits
    fn check_writable(&self, st: &mut HostState) -> Result<()> {
        let card = self.card(st)?;
        if card.card_type.is_sd() && !self.regs().present_state().contains(PresentState::WRITE_PROTECT_LEVEL) {
            return Err(Error::WriteProtected);
        }
        if card.csd.as_ref().is_some_and(|c| c.perm_write_protect || c.tmp_write_protect) {
            return Err(Error::WriteProtected);
        }
        Ok(())
    }

    fn read_chunked(&self, st: &mut HostState, block: u32, buf: &mut [u8]) -> Result<()> {
        let chunk = block::MAX_COUNT as usize * BLOCK;
        for (i, part) in buf.chunks_mut(chunk).enumerate() {
            self.read_blocks(st, block + (i * block::MAX_COUNT as usize) as u32, part)?;
        }
        Ok(())
    }

    fn write_chunked(&self, st: &mut HostState, block: u32, buf: &[u8]) -> Result<()> {
        let chunk = block::MAX_COUNT as usize * BLOCK;
        for (i, part) in buf.chunks(chunk).enumerate() {
            self.write_blocks(st, block + (i * block::MAX_COUNT as usize) as u32, part)?;
        }
        Ok(())
    }

    /// CMD17/CMD18 over whole blocks, at most one block-count register's worth
    pub(crate) fn read_blocks(&self, st: &mut HostState, block: u32, buf: &mut [u8]) -> Result<()> {
        let arg = self.card(st)?.data_arg(block).ok_or(Error::InvalidRequest("block address overflow"))?;
        let count = buf.len() / BLOCK;
        let (op, desc) = if count <= 1 {
            (opcode::READ_SINGLE_BLOCK, DataDescriptor::read(buf, BLOCK))
        } else {
            (opcode::READ_MULTIPLE_BLOCK, DataDescriptor::read(buf, BLOCK).auto_stop())
        };
        let mut desc = desc;
        self.do_request(st, &Command::new(op, arg, ResponseType::R1), Some(&mut desc))?;
        Ok(())
    }

    pub(crate) fn write_blocks(&self, st: &mut HostState, block: u32, buf: &[u8]) -> Result<()> {
        let arg = self.card(st)?.data_arg(block).ok_or(Error::InvalidRequest("block address overflow"))?;
        let count = buf.len() / BLOCK;
        let (op, desc) = if count <= 1 {
            (opcode::WRITE_BLOCK, DataDescriptor::write(buf, BLOCK))
        } else {
            (opcode::WRITE_MULTIPLE_BLOCK, DataDescriptor::write(buf, BLOCK).auto_stop())
        };
        let mut desc = desc;
        self.do_request(st, &Command::new(op, arg, ResponseType::R1), Some(&mut desc))?;
        Ok(())
    }

    fn read_open_ended(&self, st: &mut HostState, block: u32, buf: &mut [u8], stop: u32) -> Result<usize> {
        let blocks = (buf.len() / BLOCK) as u32;
        let stop = stop.min(blocks);
        if stop == 0 {
            return Err(Error::InvalidRequest("stop block outside the transfer"));
        }
        let arg = self.card(st)?.data_arg(block).ok_or(Error::InvalidRequest("block address overflow"))?;
        debug!(block, stop, "open-ended read");
        let mut desc = DataDescriptor::read(buf, BLOCK).open_ended(stop);
        self.do_request(
            st,
            &Command::new(opcode::READ_MULTIPLE_BLOCK, arg, ResponseType::R1),
            Some(&mut desc),
        )?;
        Ok(stop as usize * BLOCK)
    }

    fn write_open_ended(&self, st: &mut HostState, block: u32, buf: &[u8], stop: u32) -> Result<usize> {
        let blocks = (buf.len() / BLOCK) as u32;
        let stop = stop.min(blocks);
        if stop == 0 {
            return Err(Error::InvalidRequest("stop block outside the transfer"));
        }
        let arg = self.card(st)?.data_arg(block).ok_or(Error::InvalidRequest("block address overflow"))?;
        debug!(block, stop, "open-ended write");
        let mut desc = DataDescriptor::write(buf, BLOCK).open_ended(stop);
        self.do_request(
            st,
            &Command::new(opcode::WRITE_MULTIPLE_BLOCK, arg, ResponseType::R1),
            Some(&mut desc),
        )?;
        Ok(stop as usize * BLOCK)
    }

    /// CMD16
    pub fn set_block_length(&self, len: u32) -> Result<()> {
        let mut st = self.lock();
        self.set_block_length_locked(&mut st, len)
    }

    pub(crate) fn set_block_length_locked(&self, st: &mut HostState, len: u32) -> Result<()> {
        if len == 0 || len as usize > block::MAX_SIZE {
            return Err(Error::InvalidRequest("block length out of range"));
        }
        self.do_request(st, &Command::new(opcode::SET_BLOCKLEN, len, ResponseType::R1), None)?;
        self.card(st)?.block_len = len;
        Ok(())
    }

    /// CMD23 ahead of a caller-driven CMD18/CMD25
    pub fn set_block_count(&self, blocks: u16, flags: BlockCountFlags, context: u8) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        if !self.card_supports_cmd23(st) {
            return Err(Error::UnsupportedMode("card does not support CMD23"));
        }
        if context > 15 {
            return Err(Error::InvalidRequest("context id out of range"));
        }
        let arg = block_count_argument(blocks, flags, context);
        self.do_request(st, &Command::new(opcode::SET_BLOCK_COUNT, arg, ResponseType::R1), None)?;
        Ok(())
    }

    fn partial_access(&self, st: &mut HostState, addr: u32, len: usize, write: bool) -> Result<()> {
        let card = self.card(st)?;
        if card.card_type.block_addressed() {
            return Err(Error::UnsupportedMode("high-capacity cards have a fixed 512-byte block"));
        }
        let allowed = card
            .csd
            .as_ref()
            .is_some_and(|c| if write { c.write_bl_partial } else { c.read_bl_partial });
        if !allowed {
            return Err(Error::UnsupportedMode("card does not allow partial block access"));
        }
        if len == 0 || (addr as usize % BLOCK) + len > BLOCK {
            return Err(Error::InvalidAddressAlignment { address: addr });
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at byte address `addr` with a temporary block
    /// length; the range may not cross a 512-byte boundary.
    pub fn read_partial_block(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.partial_access(st, addr, buf.len(), false)?;
        let len = buf.len();
        self.set_block_length_locked(st, len as u32)?;
        let mut desc = DataDescriptor::read(buf, len).pio();
        let result = self.do_request(
            st,
            &Command::new(opcode::READ_SINGLE_BLOCK, addr, ResponseType::R1),
            Some(&mut desc),
        );
        self.set_block_length_locked(st, BLOCK as u32)?;
        result.map(|_| ())
    }

    pub fn write_partial_block(&self, addr: u32, buf: &[u8]) -> Result<()> {
        let mut st = self.lock();
        let st = &mut *st;
        self.partial_access(st, addr, buf.len(), true)?;
        self.check_writable(st)?;
        let len = buf.len();
        self.set_block_length_locked(st, len as u32)?;
        let mut desc = DataDescriptor::write(buf, len).pio();
        let result = self.do_request(
            st,
            &Command::new(opcode::WRITE_BLOCK, addr, ResponseType::R1),
            Some(&mut desc),
        );
        self.set_block_length_locked(st, BLOCK as u32)?;
        result?;
        debug!(addr, len, "partial block written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_argument_fields() {
        assert_eq!(block_count_argument(8, BlockCountFlags::empty(), 0), 8);
        assert_eq!(
            block_count_argument(2, BlockCountFlags::RELIABLE_WRITE, 0),
            0x8000_0002
        );
        assert_eq!(
            block_count_argument(0xFFFF, BlockCountFlags::PACKED | BlockCountFlags::TAG_REQUEST, 3),
            0x6000_0000 | (3 << 25) | 0xFFFF
        );
    }
}
