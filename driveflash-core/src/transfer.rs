//! Bounded, sector-aligned block transfer shared by every platform adapter.
//!
//! Data moves in buffers of at most [`FlashConfig::buffer_size`] bytes. The cancel token is
//! polled before each buffer and the progress callback runs after each one is handed to the
//! destination, so both are observed at buffer granularity only.
use crate::cancel::CancelToken;
use crate::config::{FlashConfig, SECTOR_SIZE};
use crate::error::Error;
use std::io::{self, Read, Write};

const CANCELLED_MSG: &str = "operation cancelled by user";

/// A heap buffer whose usable region starts on a sector boundary, as `O_DIRECT` requires.
pub(crate) struct AlignedBuffer {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    pub(crate) fn new(len: usize) -> Self {
        let buf = vec![0u8; len + SECTOR_SIZE];
        let offset = buf.as_ptr().align_offset(SECTOR_SIZE);
        Self { buf, offset, len }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + self.len]
    }
}

/// How a transfer is chunked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transfer {
    pub buffer_size: usize,
    /// Pad the final short buffer with zeros up to a whole sector. Required for unbuffered
    /// device handles, which reject writes that are not sector multiples.
    pub pad_to_sector: bool,
}

impl Transfer {
    pub(crate) fn new(config: &FlashConfig, pad_to_sector: bool) -> Self {
        Self {
            buffer_size: config.buffer_size,
            pad_to_sector,
        }
    }

    /// Copies exactly `total` bytes from `source` to `dest`.
    ///
    /// Returns the number of source bytes written (padding excluded). A source shorter than
    /// `total` fails with `UnexpectedEof`. Cancellation surfaces as an `Interrupted` error;
    /// use [`into_error`] to classify the result.
    pub(crate) fn run<R, W, P>(
        &self,
        source: &mut R,
        dest: &mut W,
        total: u64,
        progress: &mut P,
        cancel: &CancelToken,
    ) -> io::Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
        P: FnMut(u64, u64) + ?Sized,
    {
        let mut aligned = AlignedBuffer::new(self.buffer_size);
        let buffer = aligned.as_mut_slice();

        let mut written: u64 = 0;
        while written < total {
            if cancel.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, CANCELLED_MSG));
            }

            let to_read = std::cmp::min(self.buffer_size as u64, total - written) as usize;
            source.read_exact(&mut buffer[..to_read])?;

            let padded_size = if self.pad_to_sector && to_read % SECTOR_SIZE != 0 {
                let pad = to_read.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
                buffer[to_read..pad].fill(0);
                pad
            } else {
                to_read
            };

            dest.write_all(&buffer[..padded_size])?;
            written += to_read as u64;
            progress(written, total);
        }

        dest.flush()?;
        Ok(written)
    }

    /// Writes `len` zero bytes to `dest`.
    pub(crate) fn zero_fill<W>(&self, dest: &mut W, len: u64, cancel: &CancelToken) -> io::Result<u64>
    where
        W: Write + ?Sized,
    {
        let mut zeros = io::repeat(0).take(len);
        self.run(&mut zeros, dest, len, &mut |_, _| {}, cancel)
    }
}

/// Maps a transfer failure to the crate error, keeping cancellation distinct from I/O failure.
pub(crate) fn into_error(err: io::Error, wrap: fn(io::Error) -> Error) -> Error {
    if err.kind() == io::ErrorKind::Interrupted {
        Error::Cancelled
    } else {
        wrap(err)
    }
}
