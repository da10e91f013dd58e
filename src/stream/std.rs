// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

use std::io;

use super::Stream;

/// [`Stream`] for `std::io` types. Seekability is required so that `peek`
/// can rewind and unwanted custom sections can be skipped cheaply.
impl<R: io::Read + io::Seek> Stream for R {
    type Error = io::Error;

    fn is_eof(err: &Self::Error) -> bool {
        err.kind() == io::ErrorKind::UnexpectedEof
    }

    fn position(&mut self) -> usize {
        self.stream_position().unwrap().try_into().unwrap()
    }

    fn peek(&mut self) -> Result<Option<u8>, Self::Error> {
        let mut buf = [0u8; 1];
        match io::Read::read_exact(self, &mut buf) {
            Ok(()) => {
                self.seek_relative(-1)?;
                Ok(Some(buf[0]))
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        let mut buf = [0u8; 1];
        io::Read::read_exact(self, &mut buf)?;
        Ok(buf[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        io::Read::read_exact(self, buf)
    }

    fn skip(&mut self, count: usize) -> Result<(), Self::Error> {
        self.seek_relative(count.try_into().unwrap())
    }
}
