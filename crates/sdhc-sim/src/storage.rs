//! Backing stores for simulated card memory: a sparse in-memory array or an
//! image file on the host.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

const CHUNK: u64 = 512;

/// Sparse byte array. Chunks never written read back as `fill`.
#[derive(Debug, Clone)]
pub struct RamStore {
    len: u64,
    fill: u8,
    chunks: BTreeMap<u64, Box<[u8; CHUNK as usize]>>,
}

impl RamStore {
    pub fn new(len: u64, fill: u8) -> Self {
        Self {
            len,
            fill,
            chunks: BTreeMap::new(),
        }
    }

    /// Chunks materialized so far
    pub fn resident_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done as u64;
            let index = at / CHUNK;
            let within = (at % CHUNK) as usize;
            let n = (CHUNK as usize - within).min(buf.len() - done);
            match self.chunks.get(&index) {
                Some(chunk) => buf[done..done + n].copy_from_slice(&chunk[within..within + n]),
                None => buf[done..done + n].fill(self.fill),
            }
            done += n;
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let at = offset + done as u64;
            let index = at / CHUNK;
            let within = (at % CHUNK) as usize;
            let n = (CHUNK as usize - within).min(data.len() - done);
            let fill = self.fill;
            let chunk = self
                .chunks
                .entry(index)
                .or_insert_with(|| Box::new([fill; CHUNK as usize]));
            chunk[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }

    fn fill_range(&mut self, offset: u64, len: u64, byte: u8) {
        if byte == self.fill && offset % CHUNK == 0 && len % CHUNK == 0 {
            let first = offset / CHUNK;
            let last = first + len / CHUNK;
            let doomed: Vec<u64> = self.chunks.range(first..last).map(|(k, _)| *k).collect();
            for k in doomed {
                self.chunks.remove(&k);
            }
            return;
        }
        let block = [byte; CHUNK as usize];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK);
            self.write(offset + done, &block[..n as usize]);
            done += n;
        }
    }
}

/// Image file. The card sees the file length rounded down to whole blocks.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    len: u64,
}

impl FileStore {
    pub fn open(path: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len() / CHUNK * CHUNK;
        debug!("Opened card image {}: {} bytes", path.display(), len);
        Ok(Self { file, len })
    }
}

#[derive(Debug)]
pub enum Storage {
    Ram(RamStore),
    File(FileStore),
}

impl Storage {
    pub fn ram(len: u64, fill: u8) -> Self {
        Storage::Ram(RamStore::new(len, fill))
    }

    pub fn len(&self) -> u64 {
        match self {
            Storage::Ram(r) => r.len,
            Storage::File(f) => f.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, offset: u64, len: usize) -> io::Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("access at {offset:#X}+{len} past end of store"),
            )),
        }
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check(offset, buf.len())?;
        match self {
            Storage::Ram(r) => {
                r.read(offset, buf);
                Ok(())
            }
            Storage::File(f) => {
                f.file.seek(SeekFrom::Start(offset))?;
                f.file.read_exact(buf)
            }
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check(offset, data.len())?;
        match self {
            Storage::Ram(r) => {
                r.write(offset, data);
                Ok(())
            }
            Storage::File(f) => {
                f.file.seek(SeekFrom::Start(offset))?;
                f.file.write_all(data)
            }
        }
    }

    /// Sets `len` bytes from `offset` to `byte`
    pub fn fill(&mut self, offset: u64, len: u64, byte: u8) -> io::Result<()> {
        let size = usize::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "fill too large"))?;
        self.check(offset, size)?;
        match self {
            Storage::Ram(r) => {
                r.fill_range(offset, len, byte);
                Ok(())
            }
            Storage::File(f) => {
                let block = [byte; CHUNK as usize];
                f.file.seek(SeekFrom::Start(offset))?;
                let mut done = 0;
                while done < len {
                    let n = (len - done).min(CHUNK) as usize;
                    f.file.write_all(&block[..n])?;
                    done += n as u64;
                }
                Ok(())
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            Storage::Ram(_) => Ok(()),
            Storage::File(f) => f.file.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_ram_reads_fill() {
        let mut s = Storage::ram(4096, 0xFF);
        let mut buf = [0u8; 16];
        s.read(100, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn ram_write_spans_chunks() {
        let mut s = Storage::ram(4096, 0);
        let data: Vec<u8> = (0..600).map(|i| i as u8).collect();
        s.write(500, &data).unwrap();
        let mut back = vec![0u8; 600];
        s.read(500, &mut back).unwrap();
        assert_eq!(back, data);
        if let Storage::Ram(r) = &s {
            assert_eq!(r.resident_chunks(), 3);
        }
    }

    #[test]
    fn fill_with_default_drops_chunks() {
        let mut s = Storage::ram(8192, 0);
        s.write(0, &[7u8; 2048]).unwrap();
        s.fill(512, 1024, 0).unwrap();
        let mut buf = [1u8; 2048];
        s.read(0, &mut buf).unwrap();
        assert_eq!(buf[..512], [7u8; 512]);
        assert_eq!(buf[512..1536], [0u8; 1024]);
        assert_eq!(buf[1536..], [7u8; 512]);
        if let Storage::Ram(r) = &s {
            assert_eq!(r.resident_chunks(), 2);
        }
    }

    #[test]
    fn access_past_end_fails() {
        let mut s = Storage::ram(1024, 0);
        let mut buf = [0u8; 8];
        assert!(s.read(1020, &mut buf).is_err());
        assert!(s.write(1024, &[0]).is_err());
    }
}
