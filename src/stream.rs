// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Whole-stream parsing: NAL-type dispatch over a framed Annex B source,
//! with structured diagnostic events in place of a global logger.

use std::io::Read;

use log::debug;
use log::warn;

use crate::nalu::AnnexBReader;
use crate::nalu::Nalu;
use crate::nalu::NaluType;
use crate::parser::VideoStream;
use crate::ParseError;
use crate::Result;

/// Diagnostic events emitted while a stream is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// A NAL unit was framed and handled (parsed, or deliberately ignored).
    NalAccepted { nalu_type: NaluType, size: usize },
    /// A NAL unit was discarded without affecting the stream state.
    Dropped { reason: String },
    /// The parser hit an internal inconsistency and needs a reset.
    Fault { location: String, reason: String },
}

/// Receiver for [`ParserEvent`]s, injected into the parser so callers (and
/// tests) can observe the diagnostic stream.
pub trait EventSink {
    fn event(&mut self, event: ParserEvent);
}

/// Forwards events to the `log` crate.
#[derive(Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&mut self, event: ParserEvent) {
        match &event {
            ParserEvent::NalAccepted { nalu_type, size } => {
                debug!("accepted NAL unit {:?} of {} bytes", nalu_type, size)
            }
            ParserEvent::Dropped { reason } => debug!("dropped NAL unit: {}", reason),
            ParserEvent::Fault { location, reason } => {
                warn!("parser fault in {}: {}", location, reason)
            }
        }
    }
}

impl EventSink for Vec<ParserEvent> {
    fn event(&mut self, event: ParserEvent) {
        self.push(event);
    }
}

/// Dispatch state of a [`StreamParser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// No SPS seen yet; slices and PPSes cannot resolve and are dropped.
    AwaitSps,
    /// At least one SPS is active.
    Ready,
    /// An internal invariant failed; only `reset` leaves this state.
    Fault,
}

/// Parses an Annex B elementary stream into a [`VideoStream`].
///
/// NAL units are dispatched on their type: SPS and PPS NAL units update the
/// active parameter sets, slice NAL units are parsed against them and
/// appended. Recoverable errors drop the offending NAL unit and emit a
/// [`ParserEvent::Dropped`]; an [`ParseError::InternalInvariant`] faults the
/// parser until [`StreamParser::reset`].
pub struct StreamParser<S: EventSink = LogSink> {
    state: ParserState,
    stream: Option<VideoStream>,
    sink: S,
}

impl Default for StreamParser<LogSink> {
    fn default() -> Self {
        Self::new(LogSink)
    }
}

impl<S: EventSink> StreamParser<S> {
    pub fn new(sink: S) -> Self {
        Self {
            state: ParserState::AwaitSps,
            stream: None,
            sink,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// The stream parsed so far. `None` until the first SPS arrives.
    pub fn video_stream(&self) -> Option<&VideoStream> {
        self.stream.as_ref()
    }

    pub fn into_video_stream(self) -> Option<VideoStream> {
        self.stream
    }

    pub fn event_sink(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Drop all stream state and return to `AwaitSps`.
    pub fn reset(&mut self) {
        self.state = ParserState::AwaitSps;
        self.stream = None;
    }

    /// Frame `source` and feed every NAL unit through the parser.
    ///
    /// Framing errors are themselves recoverable, so this only returns an
    /// error once the parser faults.
    pub fn parse_stream<R: Read>(&mut self, source: R) -> Result<()> {
        for nalu in AnnexBReader::new(source) {
            match nalu {
                Ok(nalu) => self.push_nalu(&nalu)?,
                Err(e) => self.drop_nalu(e)?,
            }
        }

        Ok(())
    }

    /// Dispatch a single framed NAL unit.
    pub fn push_nalu(&mut self, nalu: &Nalu) -> Result<()> {
        if self.state == ParserState::Fault {
            return Err(ParseError::InternalInvariant(
                "parser is faulted and must be reset",
            ));
        }

        let accepted = ParserEvent::NalAccepted {
            nalu_type: nalu.header.type_,
            size: nalu.size(),
        };

        match nalu.header.type_ {
            NaluType::Sps => {
                let stream = self.stream.get_or_insert_with(VideoStream::new);
                let result = stream.parse_sps(nalu).map(|_| ());
                match result {
                    Ok(()) => {
                        self.state = ParserState::Ready;
                        self.sink.event(accepted);
                        Ok(())
                    }
                    Err(e) => self.handle_error("SPS", e),
                }
            }
            NaluType::Pps => {
                if self.state == ParserState::AwaitSps {
                    return self.drop_with_reason("PPS before the first SPS".to_string());
                }

                let stream = match self.stream.as_mut() {
                    Some(stream) => stream,
                    None => return Err(ParseError::InternalInvariant("ready without a stream")),
                };

                let result = stream.parse_pps(nalu).map(|_| ());
                match result {
                    Ok(()) => {
                        self.sink.event(accepted);
                        Ok(())
                    }
                    Err(e) => self.handle_error("PPS", e),
                }
            }
            t if t.is_slice() => {
                if self.state == ParserState::AwaitSps {
                    return self.drop_with_reason("slice before the first SPS".to_string());
                }

                let stream = match self.stream.as_mut() {
                    Some(stream) => stream,
                    None => return Err(ParseError::InternalInvariant("ready without a stream")),
                };

                let result = stream.parse_slice(nalu).map(|_| ());
                match result {
                    Ok(()) => {
                        self.sink.event(accepted);
                        Ok(())
                    }
                    Err(e) => self.handle_error("slice", e),
                }
            }
            // Non-VCL units that carry no state for this parser: framed,
            // surfaced, and otherwise ignored.
            NaluType::Sei
            | NaluType::AuDelimiter
            | NaluType::SeqEnd
            | NaluType::StreamEnd
            | NaluType::FillerData => {
                self.sink.event(accepted);
                Ok(())
            }
            other => self.drop_with_reason(match other {
                NaluType::Unknown => "reserved or unspecified NAL unit type".to_string(),
                _ => format!("NAL unit type {:?} outside the supported profiles", other),
            }),
        }
    }

    /// Route a recoverable error to the event stream, or fault the parser.
    fn handle_error(&mut self, location: &str, error: ParseError) -> Result<()> {
        if error.is_recoverable() {
            self.sink.event(ParserEvent::Dropped {
                reason: format!("{}: {}", location, error),
            });
            return Ok(());
        }

        self.state = ParserState::Fault;
        self.sink.event(ParserEvent::Fault {
            location: location.to_string(),
            reason: error.to_string(),
        });
        Err(error)
    }

    fn drop_nalu(&mut self, error: ParseError) -> Result<()> {
        if !error.is_recoverable() {
            return Err(ParseError::InternalInvariant(
                "unrecoverable error routed to drop",
            ));
        }

        self.drop_with_reason(error.to_string())
    }

    fn drop_with_reason(&mut self, reason: String) -> Result<()> {
        self.sink.event(ParserEvent::Dropped { reason });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS_STREAM: [u8; 12] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x0a, 0xf8, 0x2c, 0x25, 0x10,
    ];
    const PPS_STREAM: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x38, 0x80];
    const IDR_STREAM: [u8; 11] = [
        0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x0f, 0xff, 0xfe, 0x48,
    ];

    fn events(parser: &StreamParser<Vec<ParserEvent>>) -> &[ParserEvent] {
        &parser.sink
    }

    #[test]
    fn dispatches_parameter_sets_then_slice() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&SPS_STREAM);
        stream.extend_from_slice(&PPS_STREAM);
        stream.extend_from_slice(&IDR_STREAM);

        let mut parser = StreamParser::new(Vec::new());
        assert_eq!(parser.state(), ParserState::AwaitSps);

        parser.parse_stream(stream.as_slice()).unwrap();
        assert_eq!(parser.state(), ParserState::Ready);

        let video = parser.video_stream().unwrap();
        assert!(video.sps(0).is_some());
        assert!(video.pps(0).is_some());
        assert_eq!(video.slices().len(), 1);

        assert_eq!(
            events(&parser),
            &[
                ParserEvent::NalAccepted {
                    nalu_type: NaluType::Sps,
                    size: 8,
                },
                ParserEvent::NalAccepted {
                    nalu_type: NaluType::Pps,
                    size: 4,
                },
                ParserEvent::NalAccepted {
                    nalu_type: NaluType::SliceIdr,
                    size: 7,
                },
            ]
        );
    }

    #[test]
    fn drops_slices_and_ppses_before_the_first_sps() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&PPS_STREAM);
        stream.extend_from_slice(&IDR_STREAM);

        let mut parser = StreamParser::new(Vec::new());
        parser.parse_stream(stream.as_slice()).unwrap();

        assert_eq!(parser.state(), ParserState::AwaitSps);
        assert!(parser.video_stream().is_none());
        assert_eq!(events(&parser).len(), 2);
        assert!(events(&parser)
            .iter()
            .all(|e| matches!(e, ParserEvent::Dropped { .. })));
    }

    #[test]
    fn unresolved_pps_reference_keeps_parser_ready() {
        // A PPS naming seq_parameter_set_id 5, which is never sent.
        let bad_pps = [0x00, 0x00, 0x00, 0x01, 0x68, 0x9a, 0x00];

        let mut stream = Vec::new();
        stream.extend_from_slice(&SPS_STREAM);
        stream.extend_from_slice(&bad_pps);

        let mut parser = StreamParser::new(Vec::new());
        parser.parse_stream(stream.as_slice()).unwrap();

        assert_eq!(parser.state(), ParserState::Ready);
        assert!(parser.video_stream().unwrap().pps(0).is_none());

        match &events(&parser)[1] {
            ParserEvent::Dropped { reason } => assert!(reason.contains("SPS with id 5")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn garbage_before_the_first_start_code_is_skipped() {
        let mut stream: Vec<u8> = vec![0x42, 0x42];
        stream.extend_from_slice(&SPS_STREAM);

        let mut parser = StreamParser::new(Vec::new());
        parser.parse_stream(stream.as_slice()).unwrap();

        assert_eq!(parser.state(), ParserState::Ready);
        assert!(parser.video_stream().unwrap().sps(0).is_some());
    }

    #[test]
    fn ignored_nal_types_are_surfaced() {
        // An SEI and an access unit delimiter.
        let stream = [
            0x00, 0x00, 0x00, 0x01, 0x06, 0xaa, 0x80, // SEI
            0x00, 0x00, 0x00, 0x01, 0x09, 0x10, // AU delimiter
        ];

        let mut parser = StreamParser::new(Vec::new());
        parser.parse_stream(&stream[..]).unwrap();

        assert_eq!(parser.state(), ParserState::AwaitSps);
        assert_eq!(
            events(&parser),
            &[
                ParserEvent::NalAccepted {
                    nalu_type: NaluType::Sei,
                    size: 3,
                },
                ParserEvent::NalAccepted {
                    nalu_type: NaluType::AuDelimiter,
                    size: 2,
                },
            ]
        );
    }

    #[test]
    fn reset_leaves_fault_state() {
        let mut reader = AnnexBReader::new(&SPS_STREAM[..]);
        let nalu = reader.next_nalu().unwrap().unwrap();

        let mut parser = StreamParser::new(Vec::new());
        parser.state = ParserState::Fault;
        assert!(parser.push_nalu(&nalu).is_err());

        parser.reset();
        assert_eq!(parser.state(), ParserState::AwaitSps);
        parser.push_nalu(&nalu).unwrap();
        assert_eq!(parser.state(), ParserState::Ready);
    }
}
