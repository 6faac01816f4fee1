//! Bus-address translation for the simulated DMA engine.
//!
//! The driver maps its buffers through [`DmaMap`]; the controller model
//! then masters those bus addresses through [`SimDma::read`] and
//! [`SimDma::write`]. Windows start page-aligned so SDMA boundary handling
//! sees the same low address bits as the CPU buffer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use sdhc::{DmaError, DmaMap};
use tracing::{trace, warn};

const WINDOW_BASE: u32 = 0x1000_0000;
const WINDOW_END: u32 = 0xFFFF_F000;
const PAGE: u32 = 0x1000;

#[derive(Debug, Clone, Copy)]
struct Window {
    ptr: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct Windows {
    cursor: u32,
    live: BTreeMap<u32, Window>,
    mapped_total: u64,
}

/// Access to a bus address no live window covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    pub address: u32,
    pub len: usize,
}

#[derive(Debug, Default)]
pub struct SimDma {
    windows: Mutex<Windows>,
}

impl SimDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Windows currently mapped
    pub fn live_mappings(&self) -> usize {
        self.lock().live.len()
    }

    /// Mappings created since construction
    pub fn mapped_total(&self) -> u64 {
        self.lock().mapped_total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves `[bus, bus + len)` to a CPU address inside one window
    fn resolve(&self, bus: u32, len: usize) -> Result<usize, BusFault> {
        let fault = BusFault { address: bus, len };
        let w = self.lock();
        let (&start, win) = w.live.range(..=bus).next_back().ok_or(fault)?;
        let offset = (bus - start) as usize;
        if offset.checked_add(len).is_none_or(|end| end > win.len) {
            return Err(fault);
        }
        Ok(win.ptr + offset)
    }

    /// Copies device-bound bytes out of mapped memory
    pub fn read(&self, bus: u32, buf: &mut [u8]) -> Result<(), BusFault> {
        if buf.is_empty() {
            return Ok(());
        }
        let src = self.resolve(bus, buf.len())?;
        // SAFETY: the driver keeps every mapped buffer alive and unmoved
        // until it unmaps it, and resolve() checked the range lies inside
        // the mapping.
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len()) };
        trace!("DMA read: bus={:#X}, len={}", bus, buf.len());
        Ok(())
    }

    /// Copies card data into mapped memory
    pub fn write(&self, bus: u32, data: &[u8]) -> Result<(), BusFault> {
        if data.is_empty() {
            return Ok(());
        }
        let dst = self.resolve(bus, data.len())?;
        // SAFETY: as for read(); the driver does not touch the buffer while
        // the controller owns it.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len()) };
        trace!("DMA write: bus={:#X}, len={}", bus, data.len());
        Ok(())
    }
}

impl DmaMap for SimDma {
    fn map(&self, ptr: *mut u8, len: usize) -> Result<u32, DmaError> {
        let mut w = self.lock();
        if w.live.is_empty() || w.cursor == 0 {
            w.cursor = WINDOW_BASE;
        }
        let page_offset = (ptr as usize as u32) & (PAGE - 1);
        let span = u32::try_from(len)
            .ok()
            .and_then(|l| l.checked_add(page_offset))
            .and_then(|l| l.checked_next_multiple_of(PAGE))
            .ok_or(DmaError::AddressOutOfRange)?;
        let base = w.cursor;
        // One guard page between windows
        let next = base
            .checked_add(span)
            .and_then(|n| n.checked_add(PAGE))
            .filter(|n| *n <= WINDOW_END)
            .ok_or_else(|| {
                warn!("DMA window exhausted with {} live mappings", w.live.len());
                DmaError::WindowExhausted
            })?;
        let bus = base + page_offset;
        w.live.insert(bus, Window { ptr: ptr as usize, len });
        w.cursor = next;
        w.mapped_total += 1;
        trace!("DMA map: ptr={:p}, len={}, bus={:#X}", ptr, len, bus);
        Ok(bus)
    }

    fn unmap(&self, bus: u32) {
        if self.lock().live.remove(&bus).is_none() {
            warn!("DMA unmap of unknown bus address {:#X}", bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_buffer_is_reachable_by_bus_address() {
        let dma = SimDma::new();
        let mut buf = vec![0u8; 1024];
        let bus = dma.map(buf.as_mut_ptr(), buf.len()).unwrap();
        assert_eq!(bus & 0xFFF, buf.as_ptr() as usize as u32 & 0xFFF);

        dma.write(bus + 10, &[1, 2, 3]).unwrap();
        let mut back = [0u8; 3];
        dma.read(bus + 10, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3]);
        dma.unmap(bus);
        assert_eq!(buf[10..13], [1, 2, 3]);
    }

    #[test]
    fn access_outside_window_faults() {
        let dma = SimDma::new();
        let mut buf = vec![0u8; 64];
        let bus = dma.map(buf.as_mut_ptr(), buf.len()).unwrap();
        assert!(dma.write(bus + 60, &[0; 8]).is_err());
        assert!(dma.read(bus - 1, &mut [0; 1]).is_err());
        dma.unmap(bus);
        assert!(dma.read(bus, &mut [0; 1]).is_err());
    }

    #[test]
    fn windows_do_not_overlap() {
        let dma = SimDma::new();
        let mut a = vec![0u8; 5000];
        let mut b = vec![0u8; 10];
        let ba = dma.map(a.as_mut_ptr(), a.len()).unwrap();
        let bb = dma.map(b.as_mut_ptr(), b.len()).unwrap();
        assert!(bb >= ba + 5000);
        assert_eq!(dma.live_mappings(), 2);
    }
}
