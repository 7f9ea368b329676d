// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::error::ParseError;

use std::io::{self, Read};
use zerocopy::{little_endian as le, FromBytes, Immutable, KnownLayout, Unaligned};

/// A forward-only reader over a binary policy stream.
///
/// Every read either yields exactly the requested number of bytes or fails with
/// [`ParseError::Truncated`]. The most recent failure is retained and may be inspected through
/// [`ByteCursor::last_error`] by callers that prefer checking explicitly over short-circuiting.
#[derive(Debug)]
pub struct ByteCursor<R> {
    reader: R,
    buffer: Vec<u8>,
    position: u64,
    last_error: Option<ParseError>,
}

impl<R: Read> ByteCursor<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, buffer: Vec::new(), position: 0, last_error: None }
    }

    /// Returns the number of bytes consumed from the underlying stream.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the error produced by the most recent failed read, if any.
    pub fn last_error(&self) -> Option<&ParseError> {
        self.last_error.as_ref()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads exactly `count` bytes, returning a view of the cursor's internal buffer that is valid
    /// until the next read.
    pub fn read_bytes(
        &mut self,
        count: usize,
        type_name: &'static str,
    ) -> Result<&[u8], ParseError> {
        let result = self.fill(count, type_name);
        self.record(result)?;
        Ok(&self.buffer[..count])
    }

    /// Reads `count` bytes and interprets them as a (lossily decoded) UTF-8 symbol name.
    pub fn read_string(
        &mut self,
        count: u32,
        type_name: &'static str,
    ) -> Result<String, ParseError> {
        let bytes = self.read_bytes(count as usize, type_name)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Parses a fixed-size wire record.
    pub fn parse<T: FromBytes + Immutable + KnownLayout + Unaligned>(
        &mut self,
    ) -> Result<T, ParseError> {
        let type_name = std::any::type_name::<T>();
        let type_size = std::mem::size_of::<T>();
        let bytes = self.read_bytes(type_size, type_name)?;
        let result = T::read_from_bytes(bytes).map_err(|_| ParseError::Truncated {
            type_name,
            type_size,
            num_bytes: bytes.len(),
        });
        self.record(result)
    }

    pub fn parse_u32(&mut self) -> Result<u32, ParseError> {
        Ok(self.parse::<le::U32>()?.get())
    }

    /// Parses `count` consecutive little-endian 32-bit values.
    pub fn parse_u32_array(&mut self, count: usize) -> Result<Vec<u32>, ParseError> {
        let type_size = count * std::mem::size_of::<le::U32>();
        let bytes = self.read_bytes(type_size, "[u32]")?;
        let result = <[le::U32]>::ref_from_bytes(bytes)
            .map(|values| values.iter().map(|value| value.get()).collect())
            .map_err(|_| ParseError::Truncated {
                type_name: "[u32]",
                type_size,
                num_bytes: bytes.len(),
            });
        self.record(result)
    }

    /// Consumes exactly `count` bytes without retaining them.
    pub fn skip(&mut self, count: u64, type_name: &'static str) -> Result<(), ParseError> {
        let result = match io::copy(&mut self.reader.by_ref().take(count), &mut io::sink()) {
            Ok(copied) => {
                self.position += copied;
                if copied == count {
                    Ok(())
                } else {
                    Err(ParseError::Truncated {
                        type_name,
                        type_size: count as usize,
                        num_bytes: copied as usize,
                    })
                }
            }
            Err(error) => Err(ParseError::Io { kind: error.kind() }),
        };
        self.record(result)
    }

    /// Fills the internal buffer with exactly `count` bytes. The buffer grows with the data that
    /// is actually present, so a corrupt length does not trigger a large up-front allocation.
    fn fill(&mut self, count: usize, type_name: &'static str) -> Result<(), ParseError> {
        self.buffer.clear();
        let num_bytes = self
            .reader
            .by_ref()
            .take(count as u64)
            .read_to_end(&mut self.buffer)
            .map_err(|error| ParseError::Io { kind: error.kind() })?;
        self.position += num_bytes as u64;
        if num_bytes < count {
            return Err(ParseError::Truncated { type_name, type_size: count, num_bytes });
        }
        Ok(())
    }

    fn record<T>(&mut self, result: Result<T, ParseError>) -> Result<T, ParseError> {
        if let Err(error) = &result {
            self.last_error = Some(error.clone());
        }
        result
    }
}
