//! Positioned, bounded reads from devices and image files.
//!
//! Every read names its own offset (`pread`), so nothing here depends on a
//! shared file cursor and the same path can be read concurrently from
//! several threads.

use crate::core::error::DeviceIoError;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_READ_CHUNK: usize = 1024 * 1024;

/// Reads `length` bytes starting at `offset`.
///
/// Fails with [`DeviceIoError::RangeExhausted`] when the source ends before
/// `length` bytes were read; the bytes that were available travel in the
/// error's `partial` field.
pub fn read_range(
    source: impl AsRef<Path>,
    offset: u64,
    length: u64,
    chunk_size: usize,
) -> Result<Vec<u8>, DeviceIoError> {
    let source = source.as_ref();
    check_range(offset, length, chunk_size)?;
    let capacity = usize::try_from(length)
        .map_err(|_| DeviceIoError::invalid(format!("length {length} does not fit in memory")))?;

    let file = open_source(source)?;
    // Grows with the bytes actually read; `length` may exceed the source.
    let mut out = Vec::with_capacity(chunk_size.min(capacity));
    let mut chunk = vec![0u8; chunk_size.min(capacity)];

    while out.len() < capacity {
        let pos = offset + out.len() as u64;
        let want = chunk.len().min(capacity - out.len());
        let n = read_full_at(&file, &mut chunk[..want], pos)
            .map_err(|e| DeviceIoError::from_io(source, e))?;
        out.extend_from_slice(&chunk[..n]);
        if n < want {
            return Err(DeviceIoError::RangeExhausted {
                path: source.to_path_buf(),
                offset,
                requested: length,
                available: out.len() as u64,
                partial: out,
            });
        }
    }

    Ok(out)
}

/// Streams `length` bytes starting at `offset` into `output`, replacing any
/// existing file. Returns the number of bytes written.
///
/// On [`DeviceIoError::RangeExhausted`] the output file keeps the bytes that
/// were copied before the source ran out.
pub fn extract_range(
    source: impl AsRef<Path>,
    offset: u64,
    length: u64,
    output: impl AsRef<Path>,
    chunk_size: usize,
) -> Result<u64, DeviceIoError> {
    let source = source.as_ref();
    let output = output.as_ref();
    check_range(offset, length, chunk_size)?;

    let file = open_source(source)?;
    let mut out = File::create(output).map_err(|e| DeviceIoError::from_io(output, e))?;
    let mut chunk = vec![0u8; chunk_size.min(usize::try_from(length).unwrap_or(usize::MAX))];
    let mut written: u64 = 0;

    while written < length {
        let want = chunk.len().min(usize::try_from(length - written).unwrap_or(usize::MAX));
        let n = read_full_at(&file, &mut chunk[..want], offset + written)
            .map_err(|e| DeviceIoError::from_io(source, e))?;
        out.write_all(&chunk[..n])
            .map_err(|e| DeviceIoError::from_io(output, e))?;
        written += n as u64;

        if n < want {
            out.sync_all().map_err(|e| DeviceIoError::from_io(output, e))?;
            return Err(DeviceIoError::RangeExhausted {
                path: source.to_path_buf(),
                offset,
                requested: length,
                available: written,
                partial: Vec::new(),
            });
        }
    }

    out.sync_all().map_err(|e| DeviceIoError::from_io(output, e))?;
    debug!(
        source = %source.display(),
        output = %output.display(),
        offset,
        bytes = written,
        "extracted range"
    );
    Ok(written)
}

/// Reads block `block_index` of size `block_size`.
pub fn read_block(
    source: impl AsRef<Path>,
    block_size: u64,
    block_index: u64,
) -> Result<Vec<u8>, DeviceIoError> {
    if block_size == 0 {
        return Err(DeviceIoError::invalid("block_size must be positive"));
    }
    let offset = block_index
        .checked_mul(block_size)
        .ok_or_else(|| DeviceIoError::invalid(format!("block {block_index} is out of range")))?;
    let chunk = usize::try_from(block_size)
        .unwrap_or(DEFAULT_READ_CHUNK)
        .min(DEFAULT_READ_CHUNK);
    read_range(source, offset, block_size, chunk)
}

/// Like [`read_block`], but a block cut short by the end of the source
/// yields whatever bytes exist (possibly none).
pub fn read_block_available(
    source: impl AsRef<Path>,
    block_size: u64,
    block_index: u64,
) -> Result<Vec<u8>, DeviceIoError> {
    match read_block(source, block_size, block_index) {
        Ok(data) => Ok(data),
        Err(e) if e.is_range_exhausted() => Ok(e.into_partial()),
        Err(e) => Err(e),
    }
}

fn check_range(offset: u64, length: u64, chunk_size: usize) -> Result<(), DeviceIoError> {
    if length == 0 {
        return Err(DeviceIoError::invalid("length must be positive"));
    }
    if chunk_size == 0 {
        return Err(DeviceIoError::invalid("chunk_size must be positive"));
    }
    if offset.checked_add(length).is_none() {
        return Err(DeviceIoError::invalid(format!(
            "offset {offset} + length {length} overflows"
        )));
    }
    Ok(())
}

fn open_source(path: &Path) -> Result<File, DeviceIoError> {
    OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| DeviceIoError::from_io(path, e))
}

/// Fills `buf` from `pos` until it is full or the source ends.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], pos + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Renders `data` as `OFFSET | HEX BYTES | ASCII`, 16 bytes per line.
pub fn format_hex_dump(data: &[u8], base_offset: u64) -> String {
    let mut out = String::new();
    out.push_str("Offset           | 00 01 02 03 04 05 06 07  08 09 0A 0B 0C 0D 0E 0F | ASCII\n");
    out.push_str(&"-".repeat(85));
    out.push('\n');

    for (i, line) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:016x} | ", base_offset + (i * 16) as u64));
        for j in 0..16 {
            match line.get(j) {
                Some(byte) => out.push_str(&format!("{byte:02x} ")),
                None => out.push_str("   "),
            }
            if j == 7 {
                out.push(' ');
            }
        }
        out.push_str("| ");
        for &byte in line {
            out.push(if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
