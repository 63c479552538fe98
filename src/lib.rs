// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Syntactic parser for H.264/AVC (ITU-T Rec. H.264, ISO/IEC 14496-10)
//! Annex B elementary streams.
//!
//! The crate recovers the syntax layer of a bitstream: NAL unit framing with
//! emulation-prevention removal, Exp-Golomb and fixed-width syntax elements,
//! sequence and picture parameter sets, slice headers, and the macroblock
//! layer up to (but not including) residual coefficient decoding. No sample
//! reconstruction is performed.
//!
//! The entry point for whole streams is [`stream::StreamParser`], which frames
//! an Annex B byte source with [`nalu::AnnexBReader`] and accumulates parsed
//! parameter sets and slices in a [`parser::VideoStream`]. The lower layers
//! ([`bit_reader::BitReader`] and the parsing functions on `VideoStream`) can
//! also be driven directly.

pub mod bit_reader;
pub mod cabac;
pub mod nalu;
pub mod parser;
pub mod slice_data;
pub mod stream;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ParseError>;

/// Which kind of parameter set an unresolved reference points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterSetKind {
    Sps,
    Pps,
}

impl std::fmt::Display for ParameterSetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ParameterSetKind::Sps => write!(f, "SPS"),
            ParameterSetKind::Pps => write!(f, "PPS"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// The byte source ran out in the middle of a syntax element.
    #[error("bitstream ended in the middle of a syntax element")]
    UnexpectedEof,

    /// Annex B framing could not be established. Recoverable: the framer
    /// resumes its start-code scan on the next pull.
    #[error("malformed Annex B framing: {0}")]
    MalformedFraming(&'static str),

    /// A decoded value falls outside the range the specification assigns to
    /// its syntax element.
    #[error("{field} is {got}, must be {constraint}")]
    SyntaxViolation {
        field: &'static str,
        got: i64,
        constraint: &'static str,
    },

    /// A PPS referenced an unknown SPS, or a slice referenced an unknown PPS.
    #[error("{kind} with id {id} referenced before being parsed")]
    UnresolvedReference { kind: ParameterSetKind, id: u32 },

    /// The stream uses a profile or syntax combination this parser does not
    /// implement.
    #[error("unsupported stream feature: {0}")]
    Unsupported(&'static str),

    /// A guard failed. Indicates a parser bug, never expected on conforming
    /// input; the owning stream parser faults until reset.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParseError {
    /// Whether this error ends only the current NAL unit rather than the
    /// whole parsing session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ParseError::InternalInvariant(_))
    }
}

pub use bit_reader::BitReader;
pub use nalu::{AnnexBReader, Nalu, NaluHeader, NaluType};
pub use parser::{Pps, Slice, SliceHeader, Sps, VideoStream};
pub use stream::{EventSink, ParserEvent, ParserState, StreamParser};
