//! Buffer - fixed-capacity byte region with a cursor
//!
//! Backed by an owned allocation while building, or by a read-only memory
//! mapping while decomposing. Writing past capacity is an error, never a resize.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Write of {len} byte(s) at {offset} exceeds capacity {capacity}")]
    Overflow {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Read of {len} byte(s) at {offset} exceeds buffer length {available}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },

    #[error("Cannot seek backwards from {cursor} to {target}")]
    SeekBackwards { cursor: usize, target: usize },

    #[error("Buffer is read-only")]
    ReadOnly,
}

enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

pub struct Buffer {
    backing: Backing,
    read_only: bool,
    /// Byte unwritten regions hold.
    fill: u8,
    cursor: usize,
    high_water: usize,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("read_only", &self.read_only)
            .field("cursor", &self.cursor)
            .field("high_water", &self.high_water)
            .finish()
    }
}

impl Buffer {
    /// Writable buffer of `capacity` bytes pre-filled with `fill`.
    pub fn with_capacity(capacity: usize, fill: u8) -> Self {
        Self {
            backing: Backing::Owned(vec![fill; capacity]),
            read_only: false,
            fill,
            cursor: 0,
            high_water: 0,
        }
    }

    /// Read-only view over existing bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            backing: Backing::Owned(bytes),
            read_only: true,
            fill: 0,
            cursor: 0,
            high_water: len,
        }
    }

    /// Read-only memory mapping of a file.
    pub fn map_file(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is only ever read; concurrent truncation of the
        // source file is detected by the caller through its mtime.
        let mmap = unsafe { Mmap::map(&file)? };
        let len = mmap.len();
        Ok(Self {
            backing: Backing::Mapped(mmap),
            read_only: true,
            fill: 0,
            cursor: 0,
            high_water: len,
        })
    }

    pub fn capacity(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Highest offset written (or the full length for read-only buffers).
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(v) => v,
            Backing::Mapped(m) => m,
        }
    }

    fn as_mut_slice(&mut self) -> Result<&mut [u8], BufferError> {
        if self.read_only {
            return Err(BufferError::ReadOnly);
        }
        match &mut self.backing {
            Backing::Owned(v) => Ok(v.as_mut_slice()),
            Backing::Mapped(_) => Err(BufferError::ReadOnly),
        }
    }

    /// Start another layout pass. A writable buffer also forgets everything
    /// written so far, so bytes of nodes that a later pass drops or moves
    /// never reach the image.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        if self.read_only {
            return;
        }
        let (fill, written) = (self.fill, self.high_water);
        if let Backing::Owned(v) = &mut self.backing {
            v[..written].fill(fill);
        }
        self.high_water = 0;
    }

    /// Move forward to `target`, filling the gap with `pad` when writable.
    pub fn seek(&mut self, target: usize, pad: u8) -> Result<(), BufferError> {
        if target < self.cursor {
            return Err(BufferError::SeekBackwards {
                cursor: self.cursor,
                target,
            });
        }
        let gap = target - self.cursor;
        self.skip(gap, pad)
    }

    /// Advance by `len` bytes of `pad` (reads merely advance).
    pub fn skip(&mut self, len: usize, pad: u8) -> Result<(), BufferError> {
        if self.read_only {
            let available = self.capacity();
            if self.cursor + len > available {
                return Err(BufferError::OutOfBounds {
                    offset: self.cursor,
                    len,
                    available,
                });
            }
            self.cursor += len;
            return Ok(());
        }
        let fill = vec![pad; len];
        self.write(&fill)
    }

    /// Write at the cursor and advance it.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let offset = self.cursor;
        self.write_at(offset, bytes)?;
        self.cursor = offset + bytes.len();
        Ok(())
    }

    /// Write at an absolute offset without moving the cursor.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), BufferError> {
        let capacity = self.capacity();
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= capacity)
            .ok_or(BufferError::Overflow {
                offset,
                len: bytes.len(),
                capacity,
            })?;
        self.as_mut_slice()?[offset..end].copy_from_slice(bytes);
        self.high_water = self.high_water.max(end);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], BufferError> {
        let data = self.as_slice();
        let available = if self.read_only { data.len() } else { self.capacity() };
        offset
            .checked_add(len)
            .filter(|end| *end <= available)
            .map(|end| &data[offset..end])
            .ok_or(BufferError::OutOfBounds {
                offset,
                len,
                available,
            })
    }

    /// The written image, trimmed to the highest written offset.
    pub fn image(&self) -> Vec<u8> {
        self.as_slice()[..self.high_water].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_write_beyond_capacity_is_an_error() {
        let mut buf = Buffer::with_capacity(4, 0);
        buf.write(&[1, 2, 3]).unwrap();
        assert!(matches!(buf.write(&[4, 5]), Err(BufferError::Overflow { .. })));
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_seek_pads_and_refuses_backwards() {
        let mut buf = Buffer::with_capacity(8, 0);
        buf.write(&[1]).unwrap();
        buf.seek(4, 0xFF).unwrap();
        buf.write(&[2]).unwrap();
        assert_eq!(buf.image(), vec![1, 0xFF, 0xFF, 0xFF, 2]);
        assert!(matches!(buf.seek(2, 0), Err(BufferError::SeekBackwards { .. })));
    }

    #[test]
    fn test_image_is_trimmed_to_high_water() {
        let mut buf = Buffer::with_capacity(64, 0);
        buf.write_at(10, &[7]).unwrap();
        assert_eq!(buf.image().len(), 11);
    }

    #[test]
    fn test_rewind_discards_previous_pass() {
        let mut buf = Buffer::with_capacity(16, 0xEE);
        buf.write(&[1, 2, 3, 4, 5]).unwrap();
        buf.rewind();
        buf.write(&[9]).unwrap();
        assert_eq!(buf.image(), vec![9]);
        assert_eq!(buf.read(1, 4).unwrap(), &[0xEE; 4]);
    }

    #[test]
    fn test_mapped_file_is_read_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[9, 8, 7, 6]).unwrap();
        file.flush().unwrap();
        let mut buf = Buffer::map_file(file.path()).unwrap();
        assert_eq!(buf.read(1, 2).unwrap(), &[8, 7]);
        assert_eq!(buf.write_at(0, &[1]), Err(BufferError::ReadOnly));
        buf.skip(4, 0).unwrap();
        assert!(buf.skip(1, 0).is_err());
    }
}
