// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Positioned, sequential byte-stream abstraction the decoder reads from.
//!
//! [`Stream`] is implemented for in-memory buffers by [`Bytes`] and, behind
//! the `std` feature, for any `std::io::Read + Seek` type.

#[cfg(feature = "std")]
mod std;

use core::fmt;

/// A positioned source of bytes. Position is monotone; there is no seeking.
pub trait Stream {
    /// Error type for source-specific failures.
    type Error: fmt::Debug;

    /// Whether the given error means the stream ran out of bytes, as opposed
    /// to failing outright. The decoder folds such errors into its
    /// end-of-input error kind.
    fn is_eof(err: &Self::Error) -> bool;

    /// The current byte offset, used for diagnostics and for verifying
    /// declared section sizes.
    fn position(&mut self) -> usize;

    /// Returns the next byte without consuming it, or `None` at the end of
    /// the stream.
    fn peek(&mut self) -> Result<Option<u8>, Self::Error>;

    /// Consumes and returns the next byte.
    fn read_byte(&mut self) -> Result<u8, Self::Error>;

    /// Fills `buf` exactly, erroring if the stream ends first.
    ///
    /// Implementors should override for better performance.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        for slot in buf {
            *slot = self.read_byte()?;
        }
        Ok(())
    }

    /// Discards the next `count` bytes.
    ///
    /// Implementors should override for better performance.
    fn skip(&mut self, count: usize) -> Result<(), Self::Error> {
        for _ in 0..count {
            self.read_byte()?;
        }
        Ok(())
    }
}

/// Reading past the end of an in-memory buffer.
#[derive(Debug)]
pub struct EndOfInput;

/// [`Stream`] over anything that dereferences to a byte slice.
pub struct Bytes<B: AsRef<[u8]>> {
    bytes: B,
    pos: usize,
}

impl<B: AsRef<[u8]>> Bytes<B> {
    pub fn new(bytes: B) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl<B: AsRef<[u8]>> Stream for Bytes<B> {
    type Error = EndOfInput;

    fn is_eof(_: &Self::Error) -> bool {
        true
    }

    fn position(&mut self) -> usize {
        self.pos
    }

    fn peek(&mut self) -> Result<Option<u8>, Self::Error> {
        Ok(self.bytes.as_ref().get(self.pos).copied())
    }

    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        let byte = *self.bytes.as_ref().get(self.pos).ok_or(EndOfInput)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        let bytes = self.bytes.as_ref();
        let end = self.pos.checked_add(buf.len()).ok_or(EndOfInput)?;
        if end > bytes.len() {
            return Err(EndOfInput);
        }
        buf.copy_from_slice(&bytes[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    fn skip(&mut self, count: usize) -> Result<(), Self::Error> {
        let end = self.pos.checked_add(count).ok_or(EndOfInput)?;
        if end > self.bytes.as_ref().len() {
            return Err(EndOfInput);
        }
        self.pos = end;
        Ok(())
    }
}
