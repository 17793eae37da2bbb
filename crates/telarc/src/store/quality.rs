//! Quality bitmap file format.
//!
//! Each value column has a parallel 1-bit quality array (`true` = bad
//! sample) stored packed, LSB-first within each byte, with the `.qual`
//! extension:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (20 bytes)                                      │
//! │  - Magic: "TQUA" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! │  - Bit count: u64 (8 bytes)                                  │
//! │  - Header CRC32: u32 (4 bytes)                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Packed bits (⌈N/8⌉ bytes)                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The bit count lives in the header because the file length alone cannot
//! distinguish N from the next multiple of 8. Appends that do not land on a
//! byte boundary read-modify-write the final partial byte.

use crate::error::{ArchiveError, Result};
use bitvec::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::column::OpenMode;

/// Magic bytes for quality file header: "TQUA"
pub const QUALITY_MAGIC: [u8; 4] = *b"TQUA";

/// Current quality file format version.
pub const QUALITY_VERSION: u16 = 1;

/// Header size in bytes.
pub const QUALITY_HEADER_SIZE: u64 = 20;

fn header_bytes(n_bits: u64) -> [u8; QUALITY_HEADER_SIZE as usize] {
    let mut buf = [0u8; QUALITY_HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(&QUALITY_MAGIC);
    buf[4..6].copy_from_slice(&QUALITY_VERSION.to_le_bytes());
    // Bytes 6..8 reserved.
    buf[8..16].copy_from_slice(&n_bits.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..16]);
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Handle to one on-disk quality bitmap.
#[derive(Debug)]
pub struct QualityFile {
    file: File,
    n_bits: u64,
}

impl QualityFile {
    /// Creates a new empty quality bitmap.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&header_bytes(0))?;
        file.sync_all()?;
        Ok(Self { file, n_bits: 0 })
    }

    /// Opens an existing quality bitmap, validating the header.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!matches!(mode, OpenMode::Read))
            .open(path)?;
        let mut buf = [0u8; QUALITY_HEADER_SIZE as usize];
        file.read_exact(&mut buf)?;

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != QUALITY_MAGIC {
            return Err(ArchiveError::InvalidMagic { expected: QUALITY_MAGIC, actual: magic });
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version > QUALITY_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        let expected = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let actual = crc32fast::hash(&buf[0..16]);
        if expected != actual {
            return Err(ArchiveError::ChecksumMismatch { expected, actual });
        }
        let n_bits = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok(Self { file, n_bits })
    }

    /// Opens the bitmap, creating it if it does not exist.
    pub fn open_or_create(path: &Path, mode: OpenMode) -> Result<Self> {
        if path.exists() {
            Self::open(path, mode)
        } else {
            Self::create(path)
        }
    }

    /// Number of quality bits stored.
    pub fn len(&self) -> u64 {
        self.n_bits
    }

    /// Returns true if no bits are stored.
    pub fn is_empty(&self) -> bool {
        self.n_bits == 0
    }

    fn write_header(&mut self) -> Result<()> {
        let buf = header_bytes(self.n_bits);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Appends quality flags to the end of the bitmap.
    pub fn append(&mut self, bads: &[bool]) -> Result<()> {
        if bads.is_empty() {
            return Ok(());
        }
        let tail_bits = (self.n_bits % 8) as usize;
        let tail_byte_offset = QUALITY_HEADER_SIZE + self.n_bits / 8;

        let mut bits: BitVec<u8, Lsb0> = BitVec::with_capacity(tail_bits + bads.len());
        if tail_bits > 0 {
            let mut tail = [0u8; 1];
            self.file.seek(SeekFrom::Start(tail_byte_offset))?;
            self.file.read_exact(&mut tail)?;
            let existing = BitVec::<u8, Lsb0>::from_slice(&tail);
            bits.extend(existing.iter().by_vals().take(tail_bits));
        }
        bits.extend(bads.iter().copied());

        self.file.seek(SeekFrom::Start(tail_byte_offset))?;
        self.file.write_all(bits.as_raw_slice())?;
        self.n_bits += bads.len() as u64;
        self.write_header()?;
        Ok(())
    }

    /// Reads the half-open bit range `[row_lo, row_hi)`.
    pub fn read_range(&mut self, row_lo: u64, row_hi: u64) -> Result<Vec<bool>> {
        if row_lo > row_hi || row_hi > self.n_bits {
            return Err(ArchiveError::OutOfRange { row_lo, row_hi, rows: self.n_bits });
        }
        if row_lo == row_hi {
            return Ok(Vec::new());
        }
        let byte_lo = row_lo / 8;
        let byte_hi = row_hi.div_ceil(8);
        self.file
            .seek(SeekFrom::Start(QUALITY_HEADER_SIZE + byte_lo))?;
        let mut buf = vec![0u8; (byte_hi - byte_lo) as usize];
        self.file.read_exact(&mut buf)?;

        let bits = BitVec::<u8, Lsb0>::from_vec(buf);
        let skip = (row_lo - byte_lo * 8) as usize;
        let n = (row_hi - row_lo) as usize;
        Ok(bits.iter().by_vals().skip(skip).take(n).collect())
    }

    /// Shrinks the bitmap to `row_keep` bits. Durable before returning.
    pub fn truncate(&mut self, row_keep: u64) -> Result<()> {
        if row_keep >= self.n_bits {
            return Ok(());
        }
        let keep_bytes = row_keep.div_ceil(8);
        let tail_bits = (row_keep % 8) as usize;
        if tail_bits > 0 {
            // Zero the bits past the new length in the final byte so a later
            // append extends cleanly.
            let offset = QUALITY_HEADER_SIZE + keep_bytes - 1;
            let mut tail = [0u8; 1];
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut tail)?;
            tail[0] &= (1u8 << tail_bits) - 1;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&tail)?;
        }
        self.file.set_len(QUALITY_HEADER_SIZE + keep_bytes)?;
        self.n_bits = row_keep;
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes all buffered writes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
