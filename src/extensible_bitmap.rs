// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{error::ParseError, parser::ByteCursor, Parse, Validate};

use std::{io::Read, mem};
use zerocopy::{little_endian as le, FromBytes, Immutable, KnownLayout, Unaligned};

/// Fixed expectation for number of bits per [`MapItem`] in every [`ExtensibleBitmap`].
pub(crate) const MAP_NODE_BITS: u32 = 8 * mem::size_of::<u64>() as u32;

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct Metadata {
    /// How many bits on each `MapItem`.
    map_item_size_bits: le::U32,
    /// Position of the next bit after the last bit in the bitmap; zero for an empty bitmap.
    high_bit: le::U32,
    /// How many `MapItem` entries follow.
    count: le::U32,
}

impl Validate for Metadata {
    type Error = ParseError;

    /// Validates that [`ExtensibleBitmap`] metadata is internally consistent with data
    /// representation assumptions.
    fn validate(&self) -> Result<(), Self::Error> {
        // Only one size for `MapItem` instances is supported.
        let found_size = self.map_item_size_bits.get();
        if found_size != MAP_NODE_BITS {
            return Err(ParseError::CorruptValue { field: "ebitmap map size", value: found_size });
        }

        // High bit must be `MapItem` size-aligned.
        let found_high_bit = self.high_bit.get();
        if found_high_bit % found_size != 0 {
            return Err(ParseError::CorruptValue {
                field: "ebitmap high bit",
                value: found_high_bit,
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct MapItem {
    /// The first bit that this [`MapItem`] stores, relative to its [`ExtensibleBitmap`] range.
    start_bit: le::U32,
    /// The bitmap data for this [`MapItem`].
    map: le::U64,
}

/// A sparse set of bit positions, decoded from the extended-bitmap wire encoding.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ExtensibleBitmap {
    high_bit: u32,
    items: Vec<(u32, u64)>,
}

impl ExtensibleBitmap {
    /// Returns the number of bits described by this [`ExtensibleBitmap`].
    #[cfg(test)]
    pub fn num_elements(&self) -> u32 {
        self.high_bit
    }

    /// Returns the number of 1-bits in this [`ExtensibleBitmap`].
    #[cfg(test)]
    pub fn num_one_bits(&self) -> usize {
        self.items.iter().map(|(_, map)| map.count_ones() as usize).sum()
    }

    /// Returns whether the `index`'th bit in this bitmap is a 1-bit.
    #[cfg(test)]
    pub fn is_set(&self, index: u32) -> bool {
        use std::cmp::Ordering;

        if index >= self.high_bit {
            return false;
        }

        let found = self.items.binary_search_by(|(start_bit, _)| {
            if *start_bit > index {
                Ordering::Greater
            } else if start_bit + MAP_NODE_BITS <= index {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        });
        match found {
            Ok(i) => {
                let (start_bit, map) = self.items[i];
                map & (1 << (index - start_bit)) != 0
            }
            Err(_) => false,
        }
    }

    /// Returns the positions of all 1-bits, in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.items.iter().flat_map(|&(start_bit, map)| {
            (0..MAP_NODE_BITS).filter(move |i| map & (1 << i) != 0).map(move |i| start_bit + i)
        })
    }

    /// Consumes an extended bitmap without retaining its contents. The runs are still read and
    /// validated so that a corrupt bitmap is reported regardless of materialization.
    pub fn skip<R: Read>(cursor: &mut ByteCursor<R>) -> Result<(), ParseError> {
        Self::parse(cursor).map(|_| ())
    }
}

impl Parse for ExtensibleBitmap {
    fn parse<R: Read>(cursor: &mut ByteCursor<R>) -> Result<Self, ParseError> {
        let metadata = cursor.parse::<Metadata>()?;
        metadata.validate()?;

        let high_bit = metadata.high_bit.get();
        if high_bit == 0 {
            return Ok(Self::default());
        }

        let count = metadata.count.get();
        let mut items: Vec<(u32, u64)> = Vec::new();
        for _ in 0..count {
            let item = cursor.parse::<MapItem>()?;
            let start_bit = item.start_bit.get();
            let map = item.map.get();

            if start_bit % MAP_NODE_BITS != 0 || start_bit > high_bit - MAP_NODE_BITS {
                return Err(ParseError::CorruptValue {
                    field: "ebitmap start bit",
                    value: start_bit,
                });
            }
            if let Some(&(previous_start_bit, _)) = items.last() {
                if start_bit <= previous_start_bit {
                    return Err(ParseError::CorruptValue {
                        field: "ebitmap start bit",
                        value: start_bit,
                    });
                }
            }
            if map == 0 {
                return Err(ParseError::CorruptValue { field: "ebitmap map", value: start_bit });
            }

            items.push((start_bit, map));
        }

        Ok(Self { high_bit, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::PolicyWriter;

    fn parse_bytes(bytes: &[u8]) -> (Result<ExtensibleBitmap, ParseError>, u64) {
        let mut cursor = ByteCursor::new(bytes);
        let result = ExtensibleBitmap::parse(&mut cursor);
        (result, cursor.position())
    }

    #[test]
    fn extensible_bitmap_simple() {
        let bytes = [
            MAP_NODE_BITS.to_le_bytes().as_slice(), // bits per node
            MAP_NODE_BITS.to_le_bytes().as_slice(), // high bit for 1-item bitmap
            (1 as u32).to_le_bytes().as_slice(),    // count of `MapItem` entries in 1-item bitmap
            (0 as u32).to_le_bytes().as_slice(),    // start bit for `MapItem` 0
            (1 as u64).to_le_bytes().as_slice(),    // bit values for `MapItem` 0
        ]
        .concat();

        let (result, consumed) = parse_bytes(&bytes);
        let extensible_bitmap = result.expect("parse");
        assert_eq!(bytes.len() as u64, consumed);
        assert_eq!(MAP_NODE_BITS, extensible_bitmap.num_elements());
        assert_eq!(1, extensible_bitmap.num_one_bits());
        assert!(extensible_bitmap.is_set(0));
        for i in 1..MAP_NODE_BITS {
            assert!(!extensible_bitmap.is_set(i));
        }
        assert_eq!(vec![0], extensible_bitmap.ones().collect::<Vec<_>>());
    }

    #[test]
    fn extensible_bitmap_sparse_two_item() {
        let bytes = [
            MAP_NODE_BITS.to_le_bytes().as_slice(), // bits per node
            ((MAP_NODE_BITS * 10) as u32).to_le_bytes().as_slice(), // high bit for 2-item bitmap
            (2 as u32).to_le_bytes().as_slice(), // count of `MapItem` entries in 2-item bitmap
            ((MAP_NODE_BITS * 2) as u32).to_le_bytes().as_slice(), // start bit for `MapItem` 0
            ((1 << 2) as u64).to_le_bytes().as_slice(), // bit values for `MapItem` 0
            ((MAP_NODE_BITS * 7) as u32).to_le_bytes().as_slice(), // start bit for `MapItem` 1
            ((1 << 7) as u64).to_le_bytes().as_slice(), // bit values for `MapItem` 1
        ]
        .concat();

        let (result, _) = parse_bytes(&bytes);
        let extensible_bitmap = result.expect("parse");
        for i in 0..(MAP_NODE_BITS * 10) {
            let expected = i == ((MAP_NODE_BITS * 2) + 2) || i == ((MAP_NODE_BITS * 7) + 7);
            assert_eq!(expected, extensible_bitmap.is_set(i));
        }
        assert_eq!(
            vec![(MAP_NODE_BITS * 2) + 2, (MAP_NODE_BITS * 7) + 7],
            extensible_bitmap.ones().collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_bitmap_consumes_no_items() {
        let bytes = [
            MAP_NODE_BITS.to_le_bytes().as_slice(), // bits per node
            (0 as u32).to_le_bytes().as_slice(),    // high bit of empty bitmap
            (0 as u32).to_le_bytes().as_slice(),    // count of `MapItem` entries
            (9 as u32).to_le_bytes().as_slice(),    // next field, not part of the bitmap
        ]
        .concat();

        let (result, consumed) = parse_bytes(&bytes);
        let extensible_bitmap = result.expect("parse");
        assert_eq!(12, consumed);
        assert_eq!(0, extensible_bitmap.num_one_bits());
        assert_eq!(None, extensible_bitmap.ones().next());
    }

    #[test]
    fn extensible_bitmap_malformed() {
        let bytes = [
            (MAP_NODE_BITS - 1).to_le_bytes().as_slice(), // invalid bits per node
            MAP_NODE_BITS.to_le_bytes().as_slice(),       // high bit
            (0 as u32).to_le_bytes().as_slice(),          // count
        ]
        .concat();
        assert_eq!(
            Err(ParseError::CorruptValue { field: "ebitmap map size", value: MAP_NODE_BITS - 1 }),
            parse_bytes(&bytes).0
        );

        let bytes = [
            MAP_NODE_BITS.to_le_bytes().as_slice(), // bits per node
            ((MAP_NODE_BITS * 10) + 1).to_le_bytes().as_slice(), // misaligned high bit
            (0 as u32).to_le_bytes().as_slice(),    // count
        ]
        .concat();
        assert_eq!(
            Err(ParseError::CorruptValue {
                field: "ebitmap high bit",
                value: (MAP_NODE_BITS * 10) + 1
            }),
            parse_bytes(&bytes).0
        );

        let bytes = [
            MAP_NODE_BITS.to_le_bytes().as_slice(), // bits per node
            ((MAP_NODE_BITS * 10) as u32).to_le_bytes().as_slice(), // high bit
            (2 as u32).to_le_bytes().as_slice(),    // count
            ((MAP_NODE_BITS * 7) as u32).to_le_bytes().as_slice(), // start bit for `MapItem` 0
            ((1 << 7) as u64).to_le_bytes().as_slice(), // bit values for `MapItem` 0
            ((MAP_NODE_BITS * 2) as u32).to_le_bytes().as_slice(), // out-of-order start bit
            ((1 << 2) as u64).to_le_bytes().as_slice(), // bit values for `MapItem` 1
        ]
        .concat();
        assert_eq!(
            Err(ParseError::CorruptValue { field: "ebitmap start bit", value: MAP_NODE_BITS * 2 }),
            parse_bytes(&bytes).0
        );

        let bytes = [
            MAP_NODE_BITS.to_le_bytes().as_slice(), // bits per node
            MAP_NODE_BITS.to_le_bytes().as_slice(), // high bit
            (1 as u32).to_le_bytes().as_slice(),    // count
            (0 as u32).to_le_bytes().as_slice(),    // start bit for `MapItem` 0
            (0 as u64).to_le_bytes().as_slice(),    // empty bit values
        ]
        .concat();
        assert_eq!(
            Err(ParseError::CorruptValue { field: "ebitmap map", value: 0 }),
            parse_bytes(&bytes).0
        );
    }

    #[test]
    fn truncated_item_is_truncated() {
        let bytes = [
            MAP_NODE_BITS.to_le_bytes().as_slice(), // bits per node
            MAP_NODE_BITS.to_le_bytes().as_slice(), // high bit
            (1 as u32).to_le_bytes().as_slice(),    // count
            (0 as u32).to_le_bytes().as_slice(),    // start bit for `MapItem` 0, missing map
        ]
        .concat();
        assert!(matches!(parse_bytes(&bytes).0, Err(ParseError::Truncated { .. })));
    }

    #[test]
    fn writer_encoding_round_trips_bit_positions() {
        let bits = [0, 5, 63, 64, 200];
        let bytes = PolicyWriter::new().ebitmap(&bits).into_bytes();

        let mut cursor = ByteCursor::new(bytes.as_slice());
        let extensible_bitmap = ExtensibleBitmap::parse(&mut cursor).expect("parse");
        assert_eq!(bits.to_vec(), extensible_bitmap.ones().collect::<Vec<_>>());

        let mut cursor = ByteCursor::new(bytes.as_slice());
        ExtensibleBitmap::skip(&mut cursor).expect("skip");
        assert_eq!(bytes.len() as u64, cursor.position());
    }
}
