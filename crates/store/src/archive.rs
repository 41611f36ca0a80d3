// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sparse checkpoint archive codec.
//!
//! Checkpoint images are mostly zeros (disk images sized for the
//! sandbox, not its live data). The archive splits the payload into
//! fixed 4 KiB blocks and emits only non-zero blocks with their byte
//! offsets, wrapped in a zstd stream:
//!
//! ```text
//! magic "SBXCKPT1" | logical_size u64 | (offset u64, len u32, bytes)*
//! ```
//!
//! Restore truncates the destination to the logical size (a sparse
//! hole) and writes each block at its offset, so wake latency scales
//! with live data rather than disk capacity.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"SBXCKPT1";
const BLOCK_SIZE: usize = 4096;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt archive: {0}")]
    Corrupt(String),
}

/// What `pack` wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackSummary {
    /// Byte length of the original payload.
    pub logical_size: u64,
    /// Non-zero blocks emitted.
    pub blocks: u64,
    /// Compressed artifact size on disk.
    pub packed_size: u64,
}

/// Pack the file at `src` into a sparse zstd archive at `dest`.
pub fn pack(src: &Path, dest: &Path) -> Result<PackSummary, ArchiveError> {
    let mut input = File::open(src)?;
    let logical_size = input.metadata()?.len();

    let out = File::create(dest)?;
    let mut encoder = zstd::stream::write::Encoder::new(out, ZSTD_LEVEL)?;
    encoder.write_all(MAGIC)?;
    encoder.write_all(&logical_size.to_le_bytes())?;

    let mut blocks = 0u64;
    let mut offset = 0u64;
    let mut block = [0u8; BLOCK_SIZE];
    loop {
        let n = read_block(&mut input, &mut block)?;
        if n == 0 {
            break;
        }
        if block[..n].iter().any(|b| *b != 0) {
            encoder.write_all(&offset.to_le_bytes())?;
            encoder.write_all(&(n as u32).to_le_bytes())?;
            encoder.write_all(&block[..n])?;
            blocks += 1;
        }
        offset += n as u64;
    }

    let out = encoder.finish()?;
    out.sync_all()?;
    let packed_size = out.metadata()?.len();
    Ok(PackSummary { logical_size, blocks, packed_size })
}

/// Unpack the archive at `src` into a sparse file at `dest`.
/// Returns the logical payload size.
pub fn unpack(src: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let input = File::open(src)?;
    let mut decoder = zstd::stream::read::Decoder::new(input)?;

    let mut magic = [0u8; 8];
    decoder.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ArchiveError::Corrupt("bad magic".to_string()));
    }
    let mut size_buf = [0u8; 8];
    decoder.read_exact(&mut size_buf)?;
    let logical_size = u64::from_le_bytes(size_buf);

    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)?;
    // Truncating to the logical size up front leaves zero regions as
    // filesystem holes.
    out.set_len(logical_size)?;

    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let mut offset_buf = [0u8; 8];
        match read_fully_or_eof(&mut decoder, &mut offset_buf)? {
            0 => break,
            8 => {}
            n => return Err(ArchiveError::Corrupt(format!("truncated record header ({n} bytes)"))),
        }
        let offset = u64::from_le_bytes(offset_buf);

        let mut len_buf = [0u8; 4];
        decoder.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > BLOCK_SIZE {
            return Err(ArchiveError::Corrupt(format!("block length {len}")));
        }
        if offset + len as u64 > logical_size {
            return Err(ArchiveError::Corrupt(format!(
                "block at {offset}+{len} exceeds logical size {logical_size}"
            )));
        }

        decoder.read_exact(&mut buf[..len])?;
        out.seek(SeekFrom::Start(offset))?;
        out.write_all(&buf[..len])?;
    }
    out.sync_all()?;
    Ok(logical_size)
}

/// Fill `block` as far as the reader allows; returns bytes read (0 at EOF).
fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match reader.read(&mut block[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Read exactly `buf.len()` bytes, or nothing at a clean EOF.
fn read_fully_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
#[path = "archive_tests.rs"]
mod tests;
