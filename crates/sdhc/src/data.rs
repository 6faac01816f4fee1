//! Data phase: buffer descriptions and the per-request transfer engine that
//! programs PIO, SDMA or ADMA2 and services the controller while data moves.

use std::sync::Arc;

use sdhc_hw::mmio::sdhc::host_control;
use sdhc_hw::specs::block;

use crate::config::TransferMode;
use crate::dma::{AdmaChain, DmaMap, DmaMapping};
use crate::error::{Error, Result};
use crate::regs::{Capabilities, PresentState, Regs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Card to host
    Read,
    /// Host to card
    Write,
}

/// Caller memory for a data phase
pub enum DataBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    /// Scatter list; only moved by ADMA2
    ScatterRead(Vec<&'a mut [u8]>),
    ScatterWrite(Vec<&'a [u8]>),
}

impl DataBuffer<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            DataBuffer::Read(_) | DataBuffer::ScatterRead(_) => Direction::Read,
            DataBuffer::Write(_) | DataBuffer::ScatterWrite(_) => Direction::Write,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataBuffer::Read(b) => b.len(),
            DataBuffer::Write(b) => b.len(),
            DataBuffer::ScatterRead(v) => v.iter().map(|s| s.len()).sum(),
            DataBuffer::ScatterWrite(v) => v.iter().map(|s| s.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_vectored(&self) -> bool {
        matches!(self, DataBuffer::ScatterRead(_) | DataBuffer::ScatterWrite(_))
    }

    /// `(pointer, length)` for each segment, in transfer order
    fn segments(&mut self) -> Vec<(*mut u8, usize)> {
        match self {
            DataBuffer::Read(b) => vec![(b.as_mut_ptr(), b.len())],
            DataBuffer::Write(b) => vec![(b.as_ptr() as *mut u8, b.len())],
            DataBuffer::ScatterRead(v) => v.iter_mut().map(|s| (s.as_mut_ptr(), s.len())).collect(),
            DataBuffer::ScatterWrite(v) => v.iter().map(|s| (s.as_ptr() as *mut u8, s.len())).collect(),
        }
    }
}

/// How a multi-block transfer is ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The block count register ends it (single block, CMD23-predefined, SDIO, tuning)
    BlockCount,
    /// Multi-block read/write that needs a stop: auto CMD12/CMD23 or a
    /// driver-issued CMD12, depending on configuration
    AutoStop,
    /// No block count; the driver sends CMD12 after `stop_after` blocks
    OpenEnded { stop_after: u32 },
}

/// A data phase attached to a command
pub struct DataDescriptor<'a> {
    pub buffer: DataBuffer<'a>,
    pub block_size: usize,
    /// `ceil(len / block_size)`
    pub blocks: u32,
    pub termination: Termination,
    /// Tuning block read: completes on buffer-read-ready, no transfer complete
    pub tuning: bool,
    pub force_pio: bool,
}

impl<'a> DataDescriptor<'a> {
    pub fn new(buffer: DataBuffer<'a>, block_size: usize) -> Self {
        let blocks = if block_size == 0 {
            0
        } else {
            buffer.len().div_ceil(block_size) as u32
        };
        Self {
            buffer,
            block_size,
            blocks,
            termination: Termination::BlockCount,
            tuning: false,
            force_pio: false,
        }
    }

    pub fn read(buf: &'a mut [u8], block_size: usize) -> Self {
        Self::new(DataBuffer::Read(buf), block_size)
    }

    pub fn write(buf: &'a [u8], block_size: usize) -> Self {
        Self::new(DataBuffer::Write(buf), block_size)
    }

    pub fn auto_stop(mut self) -> Self {
        self.termination = Termination::AutoStop;
        self
    }

    pub fn open_ended(mut self, stop_after: u32) -> Self {
        self.termination = Termination::OpenEnded { stop_after };
        self
    }

    pub fn tuning(mut self) -> Self {
        self.tuning = true;
        self.force_pio = true;
        self
    }

    pub fn pio(mut self) -> Self {
        self.force_pio = true;
        self
    }

    pub fn direction(&self) -> Direction {
        self.buffer.direction()
    }

    pub fn is_multi_block(&self) -> bool {
        self.blocks > 1 || matches!(self.termination, Termination::OpenEnded { .. })
    }
}

/// SDMA boundary and ADMA2 segment length in effect for a transfer
#[derive(Debug, Clone, Copy)]
pub(crate) struct DmaLimits {
    pub(crate) sdma_boundary: usize,
    pub(crate) adma_max_segment: usize,
}

/// Controller-side state of one data phase. Dropping it releases DMA mappings.
pub(crate) struct Transfer {
    pub(crate) mode: TransferMode,
    direction: Direction,
    block_size: usize,
    /// Blocks the controller will move before the phase ends
    target: u32,
    open_ended: bool,
    tuning: bool,
    pub(crate) blocks_done: u32,
    pos: usize,
    boundary: u32,
    sdma_next: u32,
    _mappings: Vec<DmaMapping>,
    _chain: Option<AdmaChain>,
}

impl Transfer {
    /// Validates the descriptor and programs block size/count and the DMA engine
    pub(crate) fn prepare(
        regs: &Regs<'_>,
        dma: &Arc<dyn DmaMap>,
        caps: &Capabilities,
        desc: &mut DataDescriptor<'_>,
        preferred: TransferMode,
        limits: DmaLimits,
    ) -> Result<Self> {
        let len = desc.buffer.len();
        if desc.block_size == 0 || desc.block_size > caps.max_block_len() {
            return Err(Error::InvalidRequest("block size outside controller limits"));
        }
        if desc.blocks == 0 {
            return Err(Error::InvalidRequest("empty data phase"));
        }
        let (open_ended, target) = match desc.termination {
            Termination::OpenEnded { stop_after } => {
                if stop_after == 0 || stop_after > desc.blocks {
                    return Err(Error::InvalidRequest("stop block outside the transfer"));
                }
                (true, stop_after)
            }
            _ => {
                if desc.blocks > block::MAX_COUNT {
                    return Err(Error::InvalidRequest("block count exceeds 16-bit register"));
                }
                (false, desc.blocks)
            }
        };

        let whole_blocks = len == desc.blocks as usize * desc.block_size;
        let mode = if desc.buffer.is_vectored() {
            if !whole_blocks || open_ended || desc.force_pio {
                return Err(Error::InvalidRequest("scatter lists must be whole blocks under ADMA2"));
            }
            if !caps.adma2() {
                return Err(Error::UnsupportedMode("scatter lists need ADMA2"));
            }
            TransferMode::Adma2
        } else if desc.force_pio || open_ended || !whole_blocks {
            TransferMode::Pio
        } else {
            preferred
        };

        regs.set_block_size(desc.block_size, limits.sdma_boundary);
        regs.set_block_count(if open_ended { 0 } else { target as u16 });

        let boundary = limits.sdma_boundary as u32;
        let mut mappings = Vec::new();
        let mut chain = None;
        let mut sdma_next = 0;
        match mode {
            TransferMode::Pio => {}
            TransferMode::Sdma => {
                let (ptr, len) = desc.buffer.segments()[0];
                let mapping = DmaMapping::new(dma, ptr, len)?;
                let bus = mapping.bus();
                regs.set_dma_select(host_control::DMA_SDMA);
                regs.set_dma_address(bus);
                sdma_next = (bus & !(boundary - 1)).wrapping_add(boundary);
                mappings.push(mapping);
            }
            TransferMode::Adma2 => {
                let mut segments = Vec::new();
                for (ptr, len) in desc.buffer.segments() {
                    if len == 0 {
                        continue;
                    }
                    let mapping = DmaMapping::new(dma, ptr, len)?;
                    segments.push((mapping.bus(), len));
                    mappings.push(mapping);
                }
                let mut table = AdmaChain::build(&segments, limits.adma_max_segment)?;
                let table_map = DmaMapping::new(dma, table.as_mut_ptr(), table.byte_len())?;
                regs.set_dma_select(host_control::DMA_ADMA2_32);
                regs.set_adma_address(table_map.bus());
                mappings.push(table_map);
                chain = Some(table);
            }
        }

        Ok(Self {
            mode,
            direction: desc.direction(),
            block_size: desc.block_size,
            target,
            open_ended,
            tuning: desc.tuning,
            blocks_done: 0,
            pos: 0,
            boundary,
            sdma_next,
            _mappings: mappings,
            _chain: chain,
        })
    }

    pub(crate) fn is_tuning(&self) -> bool {
        self.tuning
    }

    /// Block after which the driver must stop an open-ended transfer
    pub(crate) fn open_ended_stop(&self) -> Option<u32> {
        self.open_ended.then_some(self.target)
    }

    pub(crate) fn pio_complete(&self) -> bool {
        self.blocks_done >= self.target
    }

    /// Moves every block the buffer port currently has room or data for
    pub(crate) fn service_pio(&mut self, regs: &Regs<'_>, desc: &mut DataDescriptor<'_>) {
        if self.mode != TransferMode::Pio {
            return;
        }
        let ready = match self.direction {
            Direction::Read => PresentState::BUFFER_READ_ENABLE,
            Direction::Write => PresentState::BUFFER_WRITE_ENABLE,
        };
        while self.blocks_done < self.target && regs.present_state().contains(ready) {
            match &mut desc.buffer {
                DataBuffer::Read(buf) => read_block(regs, buf, self.pos, self.block_size),
                DataBuffer::Write(buf) => write_block(regs, buf, self.pos, self.block_size),
                _ => return,
            }
            self.pos += self.block_size;
            self.blocks_done += 1;
        }
    }

    /// SDMA paused at a buffer boundary; hand it the next address
    pub(crate) fn sdma_continue(&mut self, regs: &Regs<'_>) {
        if self.mode == TransferMode::Sdma {
            regs.set_dma_address(self.sdma_next);
            self.sdma_next = self.sdma_next.wrapping_add(self.boundary);
        }
    }

    pub(crate) fn bytes_moved(&self, buffer_len: usize) -> usize {
        match self.mode {
            TransferMode::Pio => (self.blocks_done as usize * self.block_size).min(buffer_len),
            _ => buffer_len,
        }
    }
}

fn read_block(regs: &Regs<'_>, buf: &mut [u8], pos: usize, block_size: usize) {
    let end = (pos + block_size).min(buf.len());
    for word_start in (pos..pos + block_size).step_by(4) {
        let word = regs.read_buffer().to_le_bytes();
        for (i, byte) in word.iter().enumerate() {
            let idx = word_start + i;
            if idx < end {
                buf[idx] = *byte;
            }
        }
    }
}

fn write_block(regs: &Regs<'_>, buf: &[u8], pos: usize, block_size: usize) {
    for word_start in (pos..pos + block_size).step_by(4) {
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            if let Some(b) = buf.get(word_start + i) {
                *byte = *b;
            }
        }
        regs.write_buffer(u32::from_le_bytes(word));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_rounds_up() {
        let mut buf = [0u8; 1000];
        let desc = DataDescriptor::read(&mut buf, 512);
        assert_eq!(desc.blocks, 2);
        assert!(desc.is_multi_block());
        assert_eq!(desc.direction(), Direction::Read);

        let small = [0u8; 8];
        let desc = DataDescriptor::write(&small, 8);
        assert_eq!(desc.blocks, 1);
        assert!(!desc.is_multi_block());
    }

    #[test]
    fn vectored_length_sums_segments() {
        let mut a = [0u8; 512];
        let mut b = [0u8; 1024];
        let buf = DataBuffer::ScatterRead(vec![&mut a[..], &mut b[..]]);
        assert_eq!(buf.len(), 1536);
        assert!(buf.is_vectored());
    }
}
