//! Positioned read/write of fixed-size blocks against a host file.

use crate::config::{BLOCK_SIZE, MAX_BLOCKS};
use crate::error::{FsError, FsResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// One block's worth of bytes.
pub type Block = [u8; BLOCK_SIZE];

/// A block-addressable view of a disk image file.
pub struct BlockDevice {
    file: File,
}

impl BlockDevice {
    /// Opens an existing image file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> FsResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        log::debug!("opened disk image");
        Ok(Self { file })
    }

    /// Creates a new image file, truncating it if it already exists.
    pub fn create(path: impl AsRef<Path>) -> FsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        log::debug!("created disk image");
        Ok(Self { file })
    }

    fn check_range(n: u32) -> FsResult<()> {
        if n >= MAX_BLOCKS {
            return Err(FsError::OutOfRange);
        }
        Ok(())
    }

    /// Reads block number `n` in full.
    pub fn read_block(&mut self, n: u32) -> FsResult<Block> {
        Self::check_range(n)?;
        let mut buf = [0u8; BLOCK_SIZE];
        self.file.seek(SeekFrom::Start(n as u64 * BLOCK_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        log::trace!("read block {n}");
        Ok(buf)
    }

    /// Writes block number `n` in full.
    pub fn write_block(&mut self, n: u32, buf: &Block) -> FsResult<()> {
        Self::check_range(n)?;
        self.file.seek(SeekFrom::Start(n as u64 * BLOCK_SIZE as u64))?;
        self.file.write_all(buf)?;
        log::trace!("wrote block {n}");
        Ok(())
    }

    /// Zero-fills every block in `0..MAX_BLOCKS`, growing the file as needed.
    pub fn zero_fill(&mut self) -> FsResult<()> {
        let zero = [0u8; BLOCK_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        for _ in 0..MAX_BLOCKS {
            self.file.write_all(&zero)?;
        }
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;
    use std::process;

    fn temp_path(name: &str) -> std::path::PathBuf {
        env::temp_dir().join(format!("ext2sim-block-{}-{}", process::id(), name))
    }

    #[test]
    fn round_trip() {
        let path = temp_path("round-trip");
        let mut dev = BlockDevice::create(&path).unwrap();
        dev.zero_fill().unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0] = 0xaa;
        buf[BLOCK_SIZE - 1] = 0x55;
        dev.write_block(5, &buf).unwrap();
        let read_back = dev.read_block(5).unwrap();
        assert_eq!(read_back, buf);
        let untouched = dev.read_block(6).unwrap();
        assert_eq!(untouched, [0u8; BLOCK_SIZE]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn out_of_range() {
        let path = temp_path("out-of-range");
        let mut dev = BlockDevice::create(&path).unwrap();
        dev.zero_fill().unwrap();
        let buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            dev.write_block(MAX_BLOCKS, &buf),
            Err(FsError::OutOfRange)
        ));
        std::fs::remove_file(&path).ok();
    }
}
