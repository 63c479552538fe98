// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex B NAL unit framing: start-code scanning, emulation-prevention
//! removal and RBSP assembly over an incremental byte source.

use std::io::Cursor;
use std::io::Read;

use bytes::Buf;
use log::debug;

use crate::ParseError;
use crate::Result;

/// NAL unit type codes of table 7-1.
#[derive(enumn::N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether NAL units of this type carry slice data for the primary coded
    /// picture.
    pub fn is_slice(&self) -> bool {
        matches!(self, NaluType::Slice | NaluType::SliceIdr)
    }

    pub fn is_end(&self) -> bool {
        matches!(self, NaluType::SeqEnd | NaluType::StreamEnd)
    }
}

/// The one-byte header at the start of every NAL unit. See 7.3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    /// Importance of this NAL unit for reference picture handling, 0..=3.
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    pub fn parse(byte: u8) -> Result<Self> {
        if byte & 0x80 != 0 {
            return Err(ParseError::SyntaxViolation {
                field: "forbidden_zero_bit",
                got: 1,
                constraint: "zero",
            });
        }

        let type_code = byte & 0x1f;
        if type_code == 0 {
            return Err(ParseError::SyntaxViolation {
                field: "nal_unit_type",
                got: 0,
                constraint: "1..=31",
            });
        }

        // Reserved and unspecified type codes are carried as Unknown so the
        // dispatcher can drop them with a diagnostic instead of aborting.
        let type_ = NaluType::n(type_code).unwrap_or(NaluType::Unknown);

        Ok(NaluHeader {
            ref_idc: (byte & 0x60) >> 5,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }
}

/// A framed NAL unit with its emulation-prevention bytes removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nalu {
    pub header: NaluHeader,
    rbsp: Vec<u8>,
    size: usize,
    num_epb: usize,
}

impl Nalu {
    /// The RBSP body: everything after the NAL header byte, with
    /// emulation-prevention bytes removed and trailing bits intact.
    pub fn rbsp(&self) -> &[u8] {
        &self.rbsp
    }

    /// Size of the NAL unit payload in the stream (header byte included,
    /// emulation-prevention bytes still counted).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of emulation-prevention bytes removed from the payload.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }
}

/// Remove `emulation_prevention_three_byte`s: a 0x03 is dropped only when
/// preceded by exactly two zero bytes, and the zero run restarts after each
/// removal. Returns the clean RBSP and the number of bytes dropped.
fn strip_emulation_prevention(payload: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(payload.len());
    let mut zero_run = 0;
    let mut dropped = 0;

    for &byte in payload {
        if zero_run >= 2 && byte == 0x03 {
            dropped += 1;
            zero_run = 0;
            continue;
        }

        zero_run = if byte == 0x00 { zero_run + 1 } else { 0 };
        out.push(byte);
    }

    (out, dropped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    /// Looking for the next start code.
    Scanning,
    /// A start-code prefix has been matched but not consumed yet.
    InStartCode,
    /// Consuming payload bytes until the next start code or end of stream.
    InPayload,
}

/// Lazily splits an Annex B byte source into NAL units.
///
/// The source is pulled in chunks; partial reads are tolerated and a start
/// code straddling two reads is found once enough bytes arrive. Both the
/// three-byte start code and its `zero_byte`-prefixed four-byte form are
/// recognized. Framing errors are recoverable: the iterator yields the error
/// and resumes scanning at the following start code.
pub struct AnnexBReader<R: Read> {
    source: R,
    window: Cursor<Vec<u8>>,
    eof: bool,
    state: FramerState,
}

const READ_CHUNK_SIZE: usize = 4096;

impl<R: Read> AnnexBReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            window: Cursor::new(Vec::new()),
            eof: false,
            state: FramerState::Scanning,
        }
    }

    /// Pull one more chunk from the source into the window. Returns whether
    /// any bytes arrived.
    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.source.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.window.get_mut().extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
                Err(e) => {
                    // A failing source will not recover; stop pulling.
                    self.eof = true;
                    return Err(ParseError::Other(e.into()));
                }
            }
        }
    }

    /// Drop the consumed prefix of the window.
    fn compact(&mut self) {
        let consumed = self.window.position() as usize;
        if consumed > 0 {
            self.window.get_mut().drain(..consumed);
            self.window.set_position(0);
        }
    }

    /// Offset of the next three-byte start code relative to the window
    /// position, if one is currently buffered.
    fn find_start_code(&self) -> Option<usize> {
        self.window
            .chunk()
            .windows(3)
            .position(|w| w == [0x00, 0x00, 0x01])
    }

    /// Scan forward to the byte following the next start code.
    ///
    /// Returns false at a clean end of stream (nothing left but zero
    /// padding). Non-zero bytes with no start code behind them are a framing
    /// error; when a start code does follow, the bytes before it are skipped
    /// with a log note.
    fn seek_start_code(&mut self) -> Result<bool> {
        let mut saw_garbage = false;

        loop {
            if let Some(offset) = self.find_start_code() {
                self.state = FramerState::InStartCode;
                if offset > 0 {
                    debug!("skipped {} bytes before start code", offset);
                }
                self.window.advance(offset + 3);
                self.compact();
                self.state = FramerState::InPayload;
                return Ok(true);
            }

            // No start code buffered. Everything but a two-byte tail (a
            // potential start-code prefix) can be discarded; zero runs are
            // padding, anything else means the framing is broken.
            let chunk = self.window.chunk();
            let discard = chunk.len().saturating_sub(2);
            saw_garbage |= chunk[..discard].iter().any(|&b| b != 0x00);
            self.window.advance(discard);
            self.compact();

            if !self.fill()? {
                saw_garbage |= self.window.chunk().iter().any(|&b| b != 0x00);
                let len = self.window.chunk().len();
                self.window.advance(len);
                self.compact();

                if saw_garbage {
                    return Err(ParseError::MalformedFraming(
                        "no start code before end of stream",
                    ));
                }
                return Ok(false);
            }
        }
    }

    /// Collect the payload of the current NAL unit: everything up to the
    /// next start code (with its `zero_byte` and preceding trailing zeros
    /// excluded) or to the end of the stream.
    fn take_payload(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(offset) = self.find_start_code() {
                let mut end = offset;
                // Un-read the zero run belonging to the next start code.
                while end > 0 && self.window.chunk()[end - 1] == 0x00 {
                    end -= 1;
                }

                let payload = self.window.chunk()[..end].to_vec();
                self.window.advance(offset);
                self.compact();
                self.state = FramerState::Scanning;
                return Ok(payload);
            }

            if !self.fill()? {
                let mut end = self.window.chunk().len();
                while end > 0 && self.window.chunk()[end - 1] == 0x00 {
                    end -= 1;
                }

                let payload = self.window.chunk()[..end].to_vec();
                let len = self.window.chunk().len();
                self.window.advance(len);
                self.compact();
                self.state = FramerState::Scanning;
                return Ok(payload);
            }
        }
    }

    /// Frame the next NAL unit, or return `None` at a clean end of stream.
    pub fn next_nalu(&mut self) -> Result<Option<Nalu>> {
        if self.state == FramerState::Scanning && !self.seek_start_code()? {
            return Ok(None);
        }

        let payload = self.take_payload()?;
        if payload.is_empty() {
            return Err(ParseError::MalformedFraming("start code with no payload"));
        }

        let header = NaluHeader::parse(payload[0])?;
        let (rbsp, num_epb) = strip_emulation_prevention(&payload[1..]);

        Ok(Some(Nalu {
            header,
            rbsp,
            size: payload.len(),
            num_epb,
        }))
    }
}

impl<R: Read> Iterator for AnnexBReader<R> {
    type Item = Result<Nalu>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_nalu() {
            Ok(Some(nalu)) => Some(Ok(nalu)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reader that hands out one byte at a time, so start codes straddle
    /// read boundaries.
    struct TrickleReader<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> Read for TrickleReader<'a> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.data.len() || buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    fn collect(data: &[u8]) -> Vec<Result<Nalu>> {
        AnnexBReader::new(data).collect()
    }

    #[test]
    fn splits_at_both_start_code_forms() {
        let stream = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x0a, // SPS, 4-byte code
            0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x38, 0x80, // PPS, 4-byte code
        ];

        let nalus: Vec<_> = collect(&stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(nalus.len(), 2);

        assert_eq!(nalus[0].header.type_, NaluType::Sps);
        assert_eq!(nalus[0].rbsp(), &[0x42, 0x00, 0x0a]);
        assert_eq!(nalus[0].size(), 4);

        assert_eq!(nalus[1].header.type_, NaluType::Pps);
        assert_eq!(nalus[1].rbsp(), &[0xce, 0x38, 0x80]);
        assert_eq!(nalus[1].size(), 4);
    }

    #[test]
    fn three_byte_start_code_and_ref_idc() {
        let stream = [0x00, 0x00, 0x01, 0x41, 0xaa, 0x00, 0x00, 0x01, 0x65, 0xbb];

        let nalus: Vec<_> = collect(&stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].header.type_, NaluType::Slice);
        assert_eq!(nalus[0].header.ref_idc, 2);
        assert!(!nalus[0].header.idr_pic_flag);
        assert_eq!(nalus[1].header.type_, NaluType::SliceIdr);
        assert_eq!(nalus[1].header.ref_idc, 3);
        assert!(nalus[1].header.idr_pic_flag);
    }

    #[test]
    fn start_code_straddles_read_boundary() {
        let stream = [
            0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x38,
            0x80,
        ];
        let reader = AnnexBReader::new(TrickleReader {
            data: &stream,
            pos: 0,
        });

        let nalus: Vec<_> = reader.map(Result::unwrap).collect();
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].rbsp(), &[0x42, 0x00, 0x0a]);
        assert_eq!(nalus[1].rbsp(), &[0xce, 0x38, 0x80]);
    }

    #[test]
    fn emulation_prevention_is_stripped() {
        // One NAL per pattern of interest.
        let check = |payload: &[u8], expected_rbsp: &[u8], expected_epb: usize| {
            let mut stream = vec![0x00, 0x00, 0x01, 0x06];
            stream.extend_from_slice(payload);

            let nalus: Vec<_> = collect(&stream).into_iter().map(Result::unwrap).collect();
            assert_eq!(nalus.len(), 1);
            assert_eq!(nalus[0].rbsp(), expected_rbsp);
            assert_eq!(nalus[0].num_epb(), expected_epb);
        };

        check(&[0x00, 0x00, 0x03, 0x01], &[0x00, 0x00, 0x01], 1);
        check(&[0x00, 0x00, 0x03, 0x03], &[0x00, 0x00, 0x03], 1);
        check(&[0x00, 0x00, 0x02], &[0x00, 0x00, 0x02], 0);
        check(&[0x01, 0x00, 0x03, 0x02], &[0x01, 0x00, 0x03, 0x02], 0);
        check(
            &[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01],
            &[0x00, 0x00, 0x00, 0x00, 0x01],
            2,
        );
    }

    #[test]
    fn trailing_zeros_are_not_payload() {
        let stream = [
            0x00, 0x00, 0x01, 0x06, 0xaa, 0x80, 0x00, 0x00, // trailing zeros
            0x00, 0x00, 0x01, 0x0a, // end of sequence
        ];

        let nalus: Vec<_> = collect(&stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].rbsp(), &[0xaa, 0x80]);
        assert_eq!(nalus[1].header.type_, NaluType::SeqEnd);
        assert!(nalus[1].header.type_.is_end());
    }

    #[test]
    fn stream_without_start_code_is_malformed() {
        let results = collect(&[0x67, 0x42, 0x00, 0x0a]);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(ParseError::MalformedFraming(_))
        ));
    }

    #[test]
    fn empty_stream_yields_nothing() {
        assert!(collect(&[]).is_empty());
        // A pure zero run is discardable padding, not an error.
        assert!(collect(&[0x00, 0x00]).is_empty());
    }

    #[test]
    fn forbidden_zero_bit_rejected_then_recovers() {
        let stream = [
            0x00, 0x00, 0x01, 0xe7, 0x42, // forbidden_zero_bit set
            0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x0a,
        ];

        let results = collect(&stream);
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(ParseError::SyntaxViolation {
                field: "forbidden_zero_bit",
                ..
            })
        ));
        assert_eq!(results[1].as_ref().unwrap().header.type_, NaluType::Sps);
    }

    #[test]
    fn unknown_nal_type_is_carried() {
        let stream = [0x00, 0x00, 0x01, 0x17, 0x42]; // type 23, reserved
        let nalus: Vec<_> = collect(&stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(nalus[0].header.type_, NaluType::Unknown);
    }
}
