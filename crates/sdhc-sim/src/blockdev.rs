//! Byte stream over a card's user area, so `fatfs` can mount a volume
//! through the driver.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use sdhc::Host;

const BLOCK: u64 = 512;

fn io_error(e: sdhc::Error) -> io::Error {
    io::Error::other(e)
}

/// Seekable reader/writer on top of [`Host::get_data`] and
/// [`Host::send_data`]. Unaligned edges go through a one-block bounce
/// buffer; wrap it in `fscommon::BufStream` for FAT workloads.
pub struct HostStream {
    host: Arc<Host>,
    pos: u64,
    len: u64,
}

impl HostStream {
    /// Opens the user area of the card the host has enumerated
    pub fn new(host: Arc<Host>) -> io::Result<Self> {
        let card = host
            .card_info()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no card enumerated"))?;
        let len = card.capacity_blocks() * BLOCK;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "card has no memory area"));
        }
        Ok(Self { host, pos: 0, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn block_and_offset(&self) -> (u32, usize) {
        ((self.pos / BLOCK) as u32, (self.pos % BLOCK) as usize)
    }
}

impl Read for HostStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let (block, offset) = self.block_and_offset();

        let n = if offset == 0 && want >= BLOCK as usize {
            let whole = want - want % BLOCK as usize;
            self.host.get_data(block, &mut buf[..whole]).map_err(io_error)?
        } else {
            let mut bounce = [0u8; BLOCK as usize];
            self.host.get_data(block, &mut bounce).map_err(io_error)?;
            let n = want.min(BLOCK as usize - offset);
            buf[..n].copy_from_slice(&bounce[offset..offset + n]);
            n
        };
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for HostStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if buf.is_empty() {
            return Ok(0);
        }
        if remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write past the end of the card"));
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let (block, offset) = self.block_and_offset();

        let n = if offset == 0 && want >= BLOCK as usize {
            let whole = want - want % BLOCK as usize;
            self.host.send_data(block, &buf[..whole]).map_err(io_error)?
        } else {
            let mut bounce = [0u8; BLOCK as usize];
            self.host.get_data(block, &mut bounce).map_err(io_error)?;
            let n = want.min(BLOCK as usize - offset);
            bounce[offset..offset + n].copy_from_slice(&buf[..n]);
            self.host.send_data(block, &bounce).map_err(io_error)?;
            n
        };
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for HostStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of the card")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::SimBench;
    use crate::config::CardKind;

    fn stream(bench: &SimBench) -> HostStream {
        let host = bench.host(0, 0).unwrap();
        host.init_card().unwrap();
        HostStream::new(Arc::clone(host)).unwrap()
    }

    #[test]
    fn unaligned_write_keeps_neighbouring_bytes() {
        let bench = SimBench::with_card(CardKind::Sdhc).unwrap();
        let mut s = stream(&bench);
        s.write_all(&[0xAA; 1024]).unwrap();
        s.seek(SeekFrom::Start(500)).unwrap();
        s.write_all(&[0x55; 20]).unwrap();

        let mut back = [0u8; 1024];
        s.seek(SeekFrom::Start(0)).unwrap();
        s.read_exact(&mut back).unwrap();
        assert!(back[..500].iter().all(|&b| b == 0xAA));
        assert!(back[500..520].iter().all(|&b| b == 0x55));
        assert!(back[520..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn reads_stop_at_the_end() {
        let bench = SimBench::with_card(CardKind::Sdhc).unwrap();
        let mut s = stream(&bench);
        let end = s.seek(SeekFrom::End(-4)).unwrap();
        assert_eq!(end, s.len() - 4);
        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).unwrap(), 4);
        assert_eq!(s.read(&mut buf).unwrap(), 0);
        assert!(s.seek(SeekFrom::Current(-(s.len() as i64) - 1)).is_err());
    }
}
