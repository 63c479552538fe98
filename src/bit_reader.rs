// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-granular reader over an RBSP, plus the Exp-Golomb decoders of
//! clause 9.1. Emulation-prevention bytes are removed by the framing layer
//! before an RBSP reaches this reader, so reads here are over clean payload
//! bytes.

use crate::ParseError;
use crate::Result;

/// A big-endian bit cursor over a byte slice.
///
/// Syntax elements in H.264 are packed MSB first at arbitrary bit offsets.
/// The reader keeps a byte cursor and a bit cursor within the current byte,
/// and supports peeking and bounded rewinding on top of plain reads.
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Index of the next byte with unread bits.
    byte_pos: usize,
    /// Offset of the next unread bit within `data[byte_pos]`, counted from
    /// the MSB. Always in 0..8.
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// Number of bits consumed so far.
    pub fn position(&self) -> usize {
        self.byte_pos * 8 + usize::from(self.bit_pos)
    }

    /// Number of bits still obtainable.
    pub fn num_bits_left(&self) -> usize {
        self.data.len() * 8 - self.position()
    }

    /// Whether any bits remain.
    pub fn has_more_data(&self) -> bool {
        self.num_bits_left() > 0
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bit_pos == 0
    }

    fn set_position(&mut self, bits: usize) {
        self.byte_pos = bits / 8;
        self.bit_pos = (bits % 8) as u8;
    }

    /// Read the next `num_bits` bits (at most 64), MSB first. Reading zero
    /// bits returns 0 without advancing.
    pub fn read_bits<U: TryFrom<u64>>(&mut self, num_bits: usize) -> Result<U> {
        if num_bits > 64 {
            return Err(ParseError::InternalInvariant(
                "bit reads are limited to 64 bits",
            ));
        }
        if self.num_bits_left() < num_bits {
            return Err(ParseError::UnexpectedEof);
        }

        let mut out = 0u64;
        let mut wanted = num_bits;
        while wanted > 0 {
            let avail = 8 - usize::from(self.bit_pos);
            let take = std::cmp::min(avail, wanted);
            let chunk = self.data[self.byte_pos] >> (avail - take);
            out = (out << take) | u64::from(chunk) & ((1 << take) - 1);

            self.bit_pos += take as u8;
            if self.bit_pos == 8 {
                self.bit_pos = 0;
                self.byte_pos += 1;
            }
            wanted -= take;
        }

        U::try_from(out)
            .map_err(|_| ParseError::InternalInvariant("bit value out of range for target type"))
    }

    /// Same value as `read_bits`, with the cursor left untouched.
    pub fn peek_bits<U: TryFrom<u64>>(&mut self, num_bits: usize) -> Result<U> {
        let saved = self.position();
        let result = self.read_bits(num_bits);
        self.set_position(saved);
        result
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        self.read_bits::<u64>(1).map(|b| b == 1)
    }

    /// Advance over `num_bits` bits without interpreting them.
    pub fn skip_bits(&mut self, num_bits: usize) -> Result<()> {
        if self.num_bits_left() < num_bits {
            return Err(ParseError::UnexpectedEof);
        }

        let pos = self.position() + num_bits;
        self.set_position(pos);
        Ok(())
    }

    /// Move the cursor back by `num_bits` bits. Bounded by the bits already
    /// consumed; consumers rely on a mid-byte rewind restoring the identical
    /// bit cursor.
    pub fn rewind_bits(&mut self, num_bits: usize) -> Result<()> {
        let pos = self.position();
        if num_bits > pos {
            return Err(ParseError::InternalInvariant(
                "rewind beyond the buffered window",
            ));
        }

        self.set_position(pos - num_bits);
        Ok(())
    }

    /// Implements `more_rbsp_data()` of clause 7.2: whether syntax data
    /// remains before the `rbsp_stop_one_bit`. True iff a set bit exists
    /// strictly after the next unread bit.
    pub fn more_rbsp_data(&self) -> bool {
        if self.byte_pos >= self.data.len() {
            return false;
        }

        // Set bits in the current byte below the next unread position.
        let tail = self.data[self.byte_pos] & ((1 << (7 - self.bit_pos)) - 1);
        if tail != 0 {
            return true;
        }

        self.data[self.byte_pos + 1..].iter().any(|&b| b != 0)
    }

    /// Read a ue(v) element per clause 9.1: a run of `leadingZeroBits`
    /// zeroes, a one, then `leadingZeroBits` suffix bits. Code numbers are
    /// limited to 32 bits.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 32 {
                return Err(ParseError::SyntaxViolation {
                    field: "ue(v) leading zeros",
                    got: leading_zeros,
                    constraint: "at most 32",
                });
            }
        }

        let suffix = self.read_bits::<u64>(leading_zeros as usize)?;
        let value = (1u64 << leading_zeros) - 1 + suffix;
        let value = u32::try_from(value).map_err(|_| ParseError::SyntaxViolation {
            field: "ue(v) code number",
            got: value as i64,
            constraint: "representable in 32 bits",
        })?;

        U::try_from(value)
            .map_err(|_| ParseError::InternalInvariant("exp-golomb value out of target range"))
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(
        &mut self,
        field: &'static str,
        min: u32,
        max: u32,
    ) -> Result<U> {
        let ue: u32 = self.read_ue()?;
        if ue < min || ue > max {
            return Err(ParseError::SyntaxViolation {
                field,
                got: i64::from(ue),
                constraint: "within the range assigned by the specification",
            });
        }

        U::try_from(ue)
            .map_err(|_| ParseError::InternalInvariant("exp-golomb value out of target range"))
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, field: &'static str, max: u32) -> Result<U> {
        self.read_ue_bounded(field, 0, max)
    }

    /// Read a se(v) element: the ue(v) code number mapped to a signed value
    /// per table 9-3.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U> {
        let ue: u32 = self.read_ue()?;
        let signed = if ue % 2 == 0 {
            -(i64::from(ue) / 2)
        } else {
            i64::from(ue) / 2 + 1
        };
        let signed = i32::try_from(signed).map_err(|_| ParseError::SyntaxViolation {
            field: "se(v) value",
            got: signed,
            constraint: "representable in 32 bits",
        })?;

        U::try_from(signed)
            .map_err(|_| ParseError::InternalInvariant("exp-golomb value out of target range"))
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(
        &mut self,
        field: &'static str,
        min: i32,
        max: i32,
    ) -> Result<U> {
        let se: i32 = self.read_se()?;
        if se < min || se > max {
            return Err(ParseError::SyntaxViolation {
                field,
                got: i64::from(se),
                constraint: "within the range assigned by the specification",
            });
        }

        U::try_from(se)
            .map_err(|_| ParseError::InternalInvariant("exp-golomb value out of target range"))
    }

    /// Read a te(v) element per clause 9.1.1: a single inverted bit when the
    /// range of the element is 0..=1, ue(v) otherwise.
    pub fn read_te(&mut self, field: &'static str, max: u32) -> Result<u32> {
        if max == 1 {
            Ok(u32::from(!self.read_bit()?))
        } else {
            self.read_ue_max(field, max)
        }
    }
}
