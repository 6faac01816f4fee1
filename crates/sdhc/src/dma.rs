//! DMA address mapping and ADMA2 descriptor tables.

use std::fmt;
use std::sync::Arc;

use sdhc_hw::mmio::sdhc::adma2;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Buffer lies outside what a 32-bit DMA engine can address
    AddressOutOfRange,
    /// The mapping window has no room left
    WindowExhausted,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaError::AddressOutOfRange => write!(f, "buffer outside 32-bit DMA range"),
            DmaError::WindowExhausted => write!(f, "DMA window exhausted"),
        }
    }
}

/// Translates CPU buffers into addresses the controller can master.
///
/// A mapping stays valid until `unmap` is called with the returned address;
/// the buffer must not move or be freed in between.
pub trait DmaMap: Send + Sync {
    fn map(&self, ptr: *mut u8, len: usize) -> std::result::Result<u32, DmaError>;
    fn unmap(&self, bus: u32);
}

/// Bus address equals CPU address; for platforms with a flat 32-bit memory map
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDma;

impl DmaMap for IdentityDma {
    fn map(&self, ptr: *mut u8, len: usize) -> std::result::Result<u32, DmaError> {
        let start = ptr as usize;
        let end = start.checked_add(len).ok_or(DmaError::AddressOutOfRange)?;
        if end > u32::MAX as usize + 1 {
            return Err(DmaError::AddressOutOfRange);
        }
        Ok(start as u32)
    }

    fn unmap(&self, _bus: u32) {}
}

/// A live mapping, released on drop
pub(crate) struct DmaMapping {
    dma: Arc<dyn DmaMap>,
    bus: u32,
}

impl DmaMapping {
    pub(crate) fn new(dma: &Arc<dyn DmaMap>, ptr: *mut u8, len: usize) -> Result<Self> {
        let bus = dma.map(ptr, len)?;
        Ok(Self {
            dma: Arc::clone(dma),
            bus,
        })
    }

    pub(crate) fn bus(&self) -> u32 {
        self.bus
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        self.dma.unmap(self.bus);
    }
}

/// Kind of work a descriptor asks the ADMA2 engine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmaAction {
    Nop,
    Reserved,
    Transfer,
    Link,
}

/// One 8-byte ADMA2 descriptor, stored in memory (little endian) order:
/// attributes in bits 15:0, length in bits 31:16, address in bits 63:32.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AdmaDescriptor(u64);

impl AdmaDescriptor {
    /// A transfer descriptor. `len` of 65536 is encoded as 0.
    pub fn transfer(addr: u32, len: usize, last: bool) -> Self {
        let mut attr = adma2::VALID | adma2::ACT_TRAN;
        if last {
            attr |= adma2::END | adma2::INT;
        }
        let len_field = if len >= adma2::MAX_SEGMENT { 0 } else { len as u64 };
        Self::from_value(attr as u64 | (len_field << 16) | ((addr as u64) << 32))
    }

    pub fn from_value(value: u64) -> Self {
        Self(value.to_le())
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self::from_value(u64::from_le_bytes(bytes))
    }

    pub fn value(&self) -> u64 {
        u64::from_le(self.0)
    }

    pub fn attributes(&self) -> u16 {
        self.value() as u16
    }

    pub fn length(&self) -> usize {
        match (self.value() >> 16) as u16 {
            0 => adma2::MAX_SEGMENT,
            n => n as usize,
        }
    }

    pub fn address(&self) -> u32 {
        (self.value() >> 32) as u32
    }

    pub fn is_valid(&self) -> bool {
        self.attributes() & adma2::VALID != 0
    }

    pub fn is_end(&self) -> bool {
        self.attributes() & adma2::END != 0
    }

    pub fn raises_interrupt(&self) -> bool {
        self.attributes() & adma2::INT != 0
    }

    pub fn action(&self) -> AdmaAction {
        match self.attributes() & adma2::ACT_MASK {
            adma2::ACT_NOP => AdmaAction::Nop,
            adma2::ACT_RSV => AdmaAction::Reserved,
            adma2::ACT_TRAN => AdmaAction::Transfer,
            _ => AdmaAction::Link,
        }
    }
}

impl fmt::Debug for AdmaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmaDescriptor")
            .field("attr", &format_args!("0x{:02X}", self.attributes()))
            .field("len", &self.length())
            .field("addr", &format_args!("0x{:08X}", self.address()))
            .finish()
    }
}

/// Descriptor table covering a list of bus segments
#[derive(Debug, Clone, Default)]
pub struct AdmaChain {
    entries: Vec<AdmaDescriptor>,
    total: usize,
}

impl AdmaChain {
    /// Builds a chain over `(bus address, length)` segments, splitting any
    /// segment longer than `max_segment`, rounded down to a multiple of 4.
    /// Empty segments are skipped.
    pub fn build(segments: &[(u32, usize)], max_segment: usize) -> Result<Self> {
        let max_segment = max_segment.clamp(4, adma2::MAX_SEGMENT) & !3;
        let mut pieces = Vec::new();
        for &(addr, len) in segments {
            if len == 0 {
                continue;
            }
            if addr % 4 != 0 {
                return Err(Error::InvalidAddressAlignment { address: addr });
            }
            let mut offset = 0;
            while offset < len {
                let chunk = (len - offset).min(max_segment);
                pieces.push((addr.wrapping_add(offset as u32), chunk));
                offset += chunk;
            }
        }
        if pieces.is_empty() {
            return Err(Error::InvalidRequest("empty scatter list"));
        }

        let last = pieces.len() - 1;
        let entries = pieces
            .iter()
            .enumerate()
            .map(|(i, &(addr, len))| AdmaDescriptor::transfer(addr, len, i == last))
            .collect::<Vec<_>>();
        let total = pieces.iter().map(|(_, len)| len).sum();
        Ok(Self { entries, total })
    }

    pub fn entries(&self) -> &[AdmaDescriptor] {
        &self.entries
    }

    pub fn total_len(&self) -> usize {
        self.total
    }

    /// Table bytes as the controller reads them
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.entries.as_mut_ptr() as *mut u8
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.entries.len() * adma2::DESCRIPTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_covers_total_length_with_single_end() {
        let chain = AdmaChain::build(&[(0x1000, 200_000), (0x8_0000, 512)], 65536).unwrap();
        let entries = chain.entries();
        assert_eq!(entries.len(), 5);
        assert_eq!(chain.total_len(), 200_512);
        assert_eq!(entries.iter().map(|d| d.length()).sum::<usize>(), 200_512);
        assert_eq!(entries.iter().filter(|d| d.is_end()).count(), 1);
        assert!(entries.last().unwrap().is_end());
        assert!(entries.last().unwrap().raises_interrupt());
        for d in entries {
            assert!(d.is_valid());
            assert_eq!(d.action(), AdmaAction::Transfer);
        }
        assert_eq!(entries[1].address(), 0x1000 + 65536);
    }

    #[test]
    fn full_segment_is_encoded_as_zero_length() {
        let d = AdmaDescriptor::transfer(0x2000, 65536, true);
        assert_eq!((d.value() >> 16) as u16, 0);
        assert_eq!(d.length(), 65536);
        assert_eq!(d.attributes(), 0x23 | adma2::INT);
    }

    #[test]
    fn descriptor_bytes_are_little_endian() {
        let d = AdmaDescriptor::transfer(0x1234_5678, 512, false);
        let bytes = d.value().to_le_bytes();
        assert_eq!(bytes[0], 0x21);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 512);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 0x1234_5678);
        assert_eq!(AdmaDescriptor::from_le_bytes(bytes), d);
    }

    #[test]
    fn odd_segment_limit_keeps_pieces_word_aligned() {
        let chain = AdmaChain::build(&[(0x1000, 1000)], 301).unwrap();
        let lengths: Vec<_> = chain.entries().iter().map(|d| d.length()).collect();
        assert_eq!(lengths, vec![300, 300, 300, 100]);
        assert!(chain.entries().iter().all(|d| d.address() % 4 == 0));

        let tiny = AdmaChain::build(&[(0x1000, 8)], 1).unwrap();
        assert_eq!(tiny.entries().len(), 2);
    }

    #[test]
    fn unaligned_segment_is_rejected() {
        let err = AdmaChain::build(&[(0x1002, 512)], 65536).unwrap_err();
        assert_eq!(err, Error::InvalidAddressAlignment { address: 0x1002 });
    }

    #[test]
    fn identity_mapping_rejects_high_addresses() {
        let dma = IdentityDma;
        assert_eq!(dma.map(0x1000 as *mut u8, 16), Ok(0x1000));
        if usize::BITS > 32 {
            let high = (1usize << 33) as *mut u8;
            assert_eq!(dma.map(high, 16), Err(DmaError::AddressOutOfRange));
        }
    }
}
