// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Slice-data and macroblock-layer syntax traversal (7.3.4, 7.3.5).
//!
//! Residual coefficients are never entropy-decoded here: a CAVLC slice is
//! walked macroblock by macroblock until the first macroblock that carries
//! residual data, and a CABAC slice ends at the arithmetic-engine
//! initialization. Everything before those points is recovered.

use log::debug;

use crate::bit_reader::BitReader;
use crate::cabac::CabacInit;
use crate::cabac::COD_I_RANGE_INIT;
use crate::nalu::NaluHeader;
use crate::parser::Pps;
use crate::parser::SliceHeader;
use crate::parser::SliceType;
use crate::ParseError;
use crate::Result;

/// Mapped Exp-Golomb `coded_block_pattern` tables of table 9-4, indexed by
/// code number. The first pair applies when ChromaArrayType is 1 or 2, the
/// second when it is 0 or 3.
const CODED_BLOCK_PATTERN_INTRA: [u8; 48] = [
    47, 31, 15, 0, 23, 27, 29, 30, 7, 11, 13, 14, 39, 43, 45, 46, 16, 3, 5, 10, 12, 19, 21, 26,
    28, 35, 37, 42, 44, 1, 2, 4, 8, 17, 18, 20, 24, 6, 9, 22, 25, 32, 33, 34, 36, 40, 38, 41,
];

const CODED_BLOCK_PATTERN_INTER: [u8; 48] = [
    0, 16, 1, 2, 4, 8, 32, 3, 5, 10, 12, 15, 47, 7, 11, 13, 14, 6, 9, 31, 35, 37, 42, 44, 33, 34,
    36, 40, 39, 43, 45, 46, 17, 18, 20, 24, 19, 21, 26, 28, 23, 27, 29, 30, 22, 25, 38, 41,
];

const CODED_BLOCK_PATTERN_INTRA_MONO: [u8; 16] =
    [15, 0, 7, 11, 13, 14, 3, 5, 8, 9, 10, 12, 1, 2, 4, 6];

const CODED_BLOCK_PATTERN_INTER_MONO: [u8; 16] =
    [0, 1, 2, 4, 8, 3, 5, 10, 12, 15, 7, 11, 13, 14, 6, 9];

/// Decode a me(v) element: ue(v) mapped through table 9-4 according to the
/// chroma format and prediction class of the macroblock.
pub fn read_me(r: &mut BitReader, chroma_array_type: u8, intra: bool) -> Result<u8> {
    let code_num: u32 = r.read_ue()?;

    let table: &[u8] = match (chroma_array_type, intra) {
        (1 | 2, true) => &CODED_BLOCK_PATTERN_INTRA,
        (1 | 2, false) => &CODED_BLOCK_PATTERN_INTER,
        (_, true) => &CODED_BLOCK_PATTERN_INTRA_MONO,
        (_, false) => &CODED_BLOCK_PATTERN_INTER_MONO,
    };

    table
        .get(code_num as usize)
        .copied()
        .ok_or(ParseError::SyntaxViolation {
            field: "coded_block_pattern",
            got: i64::from(code_num),
            constraint: "a code number of table 9-4",
        })
}

/// Prediction applied to one macroblock or sub-macroblock partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PartPred {
    Na,
    L0,
    L1,
    Bi,
    Direct,
}

impl PartPred {
    fn uses_l0(&self) -> bool {
        matches!(self, PartPred::L0 | PartPred::Bi)
    }

    fn uses_l1(&self) -> bool {
        matches!(self, PartPred::L1 | PartPred::Bi)
    }
}

use PartPred::*;

/// (NumMbPart, per-partition prediction) for the P macroblock types of
/// table 7-13. Indices 3 and 4 are the sub-partitioned types.
const P_MB_PARTS: [(u8, [PartPred; 2]); 5] =
    [(1, [L0, Na]), (2, [L0, L0]), (2, [L0, L0]), (4, [Na, Na]), (4, [Na, Na])];

/// Same for the B macroblock types of table 7-14. Index 0 is
/// B_Direct_16x16, index 22 is B_8x8.
const B_MB_PARTS: [(u8, [PartPred; 2]); 23] = [
    (1, [Direct, Na]),
    (1, [L0, Na]),
    (1, [L1, Na]),
    (1, [Bi, Na]),
    (2, [L0, L0]),
    (2, [L0, L0]),
    (2, [L1, L1]),
    (2, [L1, L1]),
    (2, [L0, L1]),
    (2, [L0, L1]),
    (2, [L1, L0]),
    (2, [L1, L0]),
    (2, [L0, Bi]),
    (2, [L0, Bi]),
    (2, [L1, Bi]),
    (2, [L1, Bi]),
    (2, [Bi, L0]),
    (2, [Bi, L0]),
    (2, [Bi, L1]),
    (2, [Bi, L1]),
    (2, [Bi, Bi]),
    (2, [Bi, Bi]),
    (4, [Na, Na]),
];

/// NumSubMbPart for the P sub-macroblock types of table 7-17; the
/// prediction is always list 0.
const P_SUB_PARTS: [u8; 4] = [1, 2, 2, 4];

/// (NumSubMbPart, SubMbPredMode) for the B sub-macroblock types of
/// table 7-18. Index 0 is B_Direct_8x8.
const B_SUB_PARTS: [(u8, PartPred); 13] = [
    (4, Direct),
    (1, L0),
    (1, L1),
    (1, Bi),
    (2, L0),
    (2, L0),
    (2, L1),
    (2, L1),
    (2, Bi),
    (2, Bi),
    (4, L0),
    (4, L1),
    (4, Bi),
];

/// Macroblock types of tables 7-11 through 7-14, classified per slice type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbType {
    PSkip,
    BSkip,
    /// I_NxN: Intra_4x4 or, with `transform_size_8x8_flag`, Intra_8x8.
    INxN,
    /// I_16x16 with its packed prediction mode and coded block pattern;
    /// the payload is `mb_type - 1`, in 0..=23.
    I16x16(u8),
    IPcm,
    /// The SI macroblock of table 7-12.
    Si,
    /// P macroblock types of table 7-13, by index.
    P(u8),
    /// B macroblock types of table 7-14, by index.
    B(u8),
}

impl MbType {
    pub fn is_intra(&self) -> bool {
        matches!(self, MbType::INxN | MbType::I16x16(_) | MbType::IPcm | MbType::Si)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, MbType::PSkip | MbType::BSkip)
    }

    /// Whether this is a sub-partitioned inter type (P_8x8, P_8x8ref0 or
    /// B_8x8).
    fn is_sub_partitioned(&self) -> bool {
        matches!(self, MbType::P(3) | MbType::P(4) | MbType::B(22))
    }

    /// Intra16x16PredMode for I_16x16 types, per table 7-11.
    pub fn i16x16_intra_pred_mode(&self) -> Option<u8> {
        match self {
            MbType::I16x16(k) => Some(k % 4),
            _ => None,
        }
    }

    /// The coded block pattern implied by an I_16x16 type: chroma in the
    /// high nibble, luma (0 or 15) in the low one.
    pub fn i16x16_coded_block_pattern(&self) -> Option<u8> {
        match self {
            MbType::I16x16(k) => {
                let luma = if *k >= 12 { 15 } else { 0 };
                let chroma = (k / 4) % 3;
                Some((chroma << 4) | luma)
            }
            _ => None,
        }
    }
}

fn intra_mb_type(value: u32) -> Result<MbType> {
    match value {
        0 => Ok(MbType::INxN),
        1..=24 => Ok(MbType::I16x16((value - 1) as u8)),
        25 => Ok(MbType::IPcm),
        _ => Err(ParseError::SyntaxViolation {
            field: "mb_type",
            got: i64::from(value),
            constraint: "a macroblock type of table 7-11",
        }),
    }
}

/// Tables 7-11 through 7-14: the coded `mb_type` is biased per slice type,
/// with the intra types reachable from every slice type at an offset.
fn mb_type_from_raw(slice_type: SliceType, raw: u32) -> Result<MbType> {
    match slice_type {
        SliceType::I => intra_mb_type(raw),
        SliceType::Si => {
            if raw == 0 {
                Ok(MbType::Si)
            } else {
                intra_mb_type(raw - 1)
            }
        }
        SliceType::P | SliceType::Sp => {
            if raw < 5 {
                Ok(MbType::P(raw as u8))
            } else {
                intra_mb_type(raw - 5)
            }
        }
        SliceType::B => {
            if raw < 23 {
                Ok(MbType::B(raw as u8))
            } else {
                intra_mb_type(raw - 23)
            }
        }
    }
}

/// The raw PCM payload of an I_PCM macroblock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PcmSamples {
    /// 256 luma samples at BitDepthY bits each.
    pub luma: Vec<u16>,
    /// 2 * MbWidthC * MbHeightC chroma samples at BitDepthC bits each.
    pub chroma: Vec<u16>,
}

/// Intra prediction syntax of `mb_pred()` for I_NxN macroblocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntraNxNPred {
    /// One entry per 4x4 block (16) or 8x8 block (4): `None` when
    /// `prev_intraNxN_pred_mode_flag` selects the predicted mode, otherwise
    /// the `rem_intraNxN_pred_mode` value.
    pub modes: Vec<Option<u8>>,
    /// Present when ChromaArrayType is 1 or 2.
    pub intra_chroma_pred_mode: u8,
}

/// Inter prediction syntax of `mb_pred()` for non-sub-partitioned
/// macroblocks, at most two partitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterPred {
    pub ref_idx_l0: [u32; 2],
    pub ref_idx_l1: [u32; 2],
    pub mvd_l0: [[i32; 2]; 2],
    pub mvd_l1: [[i32; 2]; 2],
}

/// `sub_mb_pred()` syntax: four sub-macroblocks, each split into up to four
/// sub-partitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubMbPred {
    pub sub_mb_type: [u8; 4],
    pub ref_idx_l0: [u32; 4],
    pub ref_idx_l1: [u32; 4],
    pub mvd_l0: [[[i32; 2]; 4]; 4],
    pub mvd_l1: [[[i32; 2]; 4]; 4],
}

/// Prediction syntax attached to a macroblock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MbPred {
    /// Skipped, PCM and direct-predicted macroblocks carry no prediction
    /// syntax.
    #[default]
    None,
    IntraNxN(IntraNxNPred),
    Intra16x16 {
        intra_chroma_pred_mode: u8,
    },
    Inter(InterPred),
    SubMb(SubMbPred),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Macroblock {
    /// Macroblock address in the picture.
    pub addr: u32,
    pub mb_type: MbType,
    /// Present for macroblock pairs whose field flag is coded (MBAFF).
    pub mb_field_decoding_flag: Option<bool>,
    pub transform_size_8x8_flag: bool,
    pub pred: MbPred,
    /// CodedBlockPatternChroma in the high nibble, CodedBlockPatternLuma in
    /// the low one.
    pub coded_block_pattern: u8,
    pub mb_qp_delta: i32,
    pub pcm: Option<PcmSamples>,
}

impl Macroblock {
    fn skipped(addr: u32, slice_type: SliceType) -> Self {
        Macroblock {
            addr,
            mb_type: if slice_type.is_b() {
                MbType::BSkip
            } else {
                MbType::PSkip
            },
            mb_field_decoding_flag: None,
            transform_size_8x8_flag: false,
            pred: MbPred::None,
            coded_block_pattern: 0,
            mb_qp_delta: 0,
            pcm: None,
        }
    }
}

/// The traversed part of one slice's data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceData {
    /// Macroblocks in traversal order, skipped ones included.
    pub macroblocks: Vec<Macroblock>,
    /// Arithmetic-engine initialization, captured for CABAC slices.
    pub cabac_init: Option<CabacInit>,
    /// Whether traversal reached the end of the slice. Unset when it
    /// stopped at residual data (or, for CABAC, after engine init).
    pub fully_parsed: bool,
    /// RBSP bits consumed once traversal ended, header included.
    pub bits_consumed: usize,
}

/// Walk `slice_data()` of 7.3.4 as far as the entropy coding allows.
pub fn parse_slice_data(
    r: &mut BitReader,
    header: &SliceHeader,
    pps: &Pps,
    _nalu_header: &NaluHeader,
) -> Result<SliceData> {
    let sps = &pps.sps;
    let mut data = SliceData::default();

    if pps.entropy_coding_mode_flag {
        while !r.is_byte_aligned() {
            if !r.read_bit()? {
                return Err(ParseError::SyntaxViolation {
                    field: "cabac_alignment_one_bit",
                    got: 0,
                    constraint: "one",
                });
            }
        }

        data.cabac_init = Some(CabacInit {
            cabac_init_idc: header.cabac_init_idc,
            slice_qp_y: header.slice_qp_y(pps),
            cod_i_range: COD_I_RANGE_INIT,
            cod_i_offset: r.read_bits(9)?,
        });

        // Macroblock syntax beyond this point is arithmetic-coded.
        debug!("CABAC slice: traversal ends after engine initialization");
        data.bits_consumed = r.position();
        return Ok(data);
    }

    if pps.slice_groups.is_some() {
        // NextMbAddress with several slice groups needs the group map walk,
        // which belongs to reconstruction.
        debug!("slice uses multiple slice groups, skipping data traversal");
        data.bits_consumed = r.position();
        return Ok(data);
    }

    let mbaff = sps.mb_adaptive_frame_field_flag && !header.field_pic_flag;
    let pic_height_in_mbs = sps.frame_height_in_mbs() / (1 + u32::from(header.field_pic_flag));
    let pic_size_in_mbs = sps.pic_width_in_mbs() * pic_height_in_mbs;

    let mut curr_addr = header.first_mb_in_slice * (1 + u32::from(mbaff));
    if curr_addr >= pic_size_in_mbs {
        return Err(ParseError::SyntaxViolation {
            field: "first_mb_in_slice",
            got: i64::from(header.first_mb_in_slice),
            constraint: "within the picture",
        });
    }

    let mut prev_skipped = false;
    loop {
        if header.slice_type.is_inter() {
            let skip_run: u32 = r.read_ue()?;
            prev_skipped = skip_run > 0;

            for _ in 0..skip_run {
                if curr_addr >= pic_size_in_mbs {
                    return Err(ParseError::SyntaxViolation {
                        field: "mb_skip_run",
                        got: i64::from(skip_run),
                        constraint: "within the picture",
                    });
                }

                data.macroblocks.push(Macroblock::skipped(curr_addr, header.slice_type));
                curr_addr += 1;
            }

            if skip_run > 0 && !r.more_rbsp_data() {
                data.fully_parsed = true;
                break;
            }
        }

        if curr_addr >= pic_size_in_mbs {
            return Err(ParseError::SyntaxViolation {
                field: "slice_data",
                got: i64::from(curr_addr),
                constraint: "within the picture",
            });
        }

        let mb_field = if mbaff && (curr_addr % 2 == 0 || prev_skipped) {
            Some(r.read_bit()?)
        } else {
            None
        };

        let (mb, reached_residual) = parse_macroblock_layer(r, header, pps, curr_addr, mb_field)?;
        data.macroblocks.push(mb);
        curr_addr += 1;

        if reached_residual {
            debug!(
                "stopping slice traversal at residual data of macroblock {}",
                curr_addr - 1
            );
            break;
        }

        if !r.more_rbsp_data() {
            data.fully_parsed = true;
            break;
        }
    }

    data.bits_consumed = r.position();
    Ok(data)
}

/// `macroblock_layer()` of 7.3.5, up to the start of `residual()`. Returns
/// the macroblock and whether residual data (not traversable without
/// entropy decoding) follows.
fn parse_macroblock_layer(
    r: &mut BitReader,
    header: &SliceHeader,
    pps: &Pps,
    addr: u32,
    mb_field: Option<bool>,
) -> Result<(Macroblock, bool)> {
    let sps = &pps.sps;
    let chroma_array_type = sps.chroma_array_type();

    let raw_mb_type: u32 = r.read_ue()?;
    let mb_type = mb_type_from_raw(header.slice_type, raw_mb_type)?;

    let mut mb = Macroblock {
        addr,
        mb_type,
        mb_field_decoding_flag: mb_field,
        transform_size_8x8_flag: false,
        pred: MbPred::None,
        coded_block_pattern: 0,
        mb_qp_delta: 0,
        pcm: None,
    };

    if mb_type == MbType::IPcm {
        while !r.is_byte_aligned() {
            if r.read_bit()? {
                return Err(ParseError::SyntaxViolation {
                    field: "pcm_alignment_zero_bit",
                    got: 1,
                    constraint: "zero",
                });
            }
        }

        let mut pcm = PcmSamples::default();
        for _ in 0..256 {
            pcm.luma.push(r.read_bits(usize::from(sps.bit_depth_luma()))?);
        }

        let (mb_width_c, mb_height_c) = sps.mb_width_height_c();
        for _ in 0..2 * mb_width_c * mb_height_c {
            pcm.chroma.push(r.read_bits(usize::from(sps.bit_depth_chroma()))?);
        }

        mb.pcm = Some(pcm);
        // An I_PCM macroblock is complete as-is; no residual section.
        return Ok((mb, false));
    }

    let mut no_sub_part_below_8x8 = true;

    match mb_type {
        MbType::INxN | MbType::Si => {
            if mb_type == MbType::INxN && pps.transform_8x8_mode_flag {
                mb.transform_size_8x8_flag = r.read_bit()?;
            }

            let num_blocks = if mb.transform_size_8x8_flag { 4 } else { 16 };
            let mut pred = IntraNxNPred::default();
            for _ in 0..num_blocks {
                let prev_pred_mode_flag = r.read_bit()?;
                pred.modes.push(if prev_pred_mode_flag {
                    None
                } else {
                    Some(r.read_bits(3)?)
                });
            }

            if matches!(chroma_array_type, 1 | 2) {
                pred.intra_chroma_pred_mode = r.read_ue_max("intra_chroma_pred_mode", 3)?;
            }

            mb.pred = MbPred::IntraNxN(pred);
        }
        MbType::I16x16(_) => {
            let intra_chroma_pred_mode = if matches!(chroma_array_type, 1 | 2) {
                r.read_ue_max("intra_chroma_pred_mode", 3)?
            } else {
                0
            };

            mb.pred = MbPred::Intra16x16 {
                intra_chroma_pred_mode,
            };
        }
        MbType::B(0) => (), // B_Direct_16x16 carries no prediction syntax.
        MbType::P(_) | MbType::B(_) if mb_type.is_sub_partitioned() => {
            mb.pred = MbPred::SubMb(parse_sub_mb_pred(
                r,
                header,
                mb_type,
                mb_field,
                sps.direct_8x8_inference_flag,
                &mut no_sub_part_below_8x8,
            )?);
        }
        MbType::P(_) | MbType::B(_) => {
            mb.pred = MbPred::Inter(parse_inter_mb_pred(r, header, mb_type, mb_field)?);
        }
        _ => {
            return Err(ParseError::InternalInvariant(
                "skip type reached macroblock_layer",
            ))
        }
    }

    let is_i16x16 = matches!(mb_type, MbType::I16x16(_));
    if let Some(cbp) = mb_type.i16x16_coded_block_pattern() {
        mb.coded_block_pattern = cbp;
    } else {
        mb.coded_block_pattern = read_me(r, chroma_array_type, mb_type.is_intra())?;

        let cbp_luma = mb.coded_block_pattern & 0xf;
        if cbp_luma > 0
            && pps.transform_8x8_mode_flag
            && !mb_type.is_intra()
            && no_sub_part_below_8x8
            && (mb_type != MbType::B(0) || sps.direct_8x8_inference_flag)
        {
            mb.transform_size_8x8_flag = r.read_bit()?;
        }
    }

    if mb.coded_block_pattern != 0 || is_i16x16 {
        let qp_bd_offset_y = sps.qp_bd_offset_y();
        mb.mb_qp_delta = r.read_se_bounded(
            "mb_qp_delta",
            -(26 + qp_bd_offset_y / 2),
            25 + qp_bd_offset_y / 2,
        )?;

        // residual() follows and is not traversable.
        return Ok((mb, true));
    }

    Ok((mb, false))
}

/// Whether a `ref_idx_lX` element is present, and its te(v) range, per
/// 7.4.5.1.
fn ref_idx_present_and_max(
    num_ref_idx_active_minus1: u8,
    mb_field: Option<bool>,
    field_pic_flag: bool,
) -> (bool, u32) {
    let field_mb = mb_field.unwrap_or(field_pic_flag);
    let present = num_ref_idx_active_minus1 > 0 || field_mb != field_pic_flag;
    // Field macroblocks address both fields of each reference frame, so
    // their index range doubles whether the slice is field-coded or the
    // macroblock pair is.
    let max = if field_mb {
        2 * u32::from(num_ref_idx_active_minus1) + 1
    } else {
        u32::from(num_ref_idx_active_minus1)
    };

    (present, max)
}

fn mb_part_preds(mb_type: MbType) -> Result<(usize, [PartPred; 2])> {
    let (num, preds) = match mb_type {
        MbType::P(idx) => P_MB_PARTS[usize::from(idx)],
        MbType::B(idx) => B_MB_PARTS[usize::from(idx)],
        _ => {
            return Err(ParseError::InternalInvariant(
                "intra type in inter prediction",
            ))
        }
    };

    Ok((usize::from(num), preds))
}

/// `mb_pred()` of 7.3.5.1 for inter macroblocks with one or two partitions.
fn parse_inter_mb_pred(
    r: &mut BitReader,
    header: &SliceHeader,
    mb_type: MbType,
    mb_field: Option<bool>,
) -> Result<InterPred> {
    let (num_parts, preds) = mb_part_preds(mb_type)?;
    let mut pred = InterPred::default();

    let (l0_present, l0_max) = ref_idx_present_and_max(
        header.num_ref_idx_l0_active_minus1,
        mb_field,
        header.field_pic_flag,
    );
    let (l1_present, l1_max) = ref_idx_present_and_max(
        header.num_ref_idx_l1_active_minus1,
        mb_field,
        header.field_pic_flag,
    );

    for part in 0..num_parts {
        if preds[part].uses_l0() && l0_present {
            pred.ref_idx_l0[part] = r.read_te("ref_idx_l0", l0_max)?;
        }
    }

    for part in 0..num_parts {
        if preds[part].uses_l1() && l1_present {
            pred.ref_idx_l1[part] = r.read_te("ref_idx_l1", l1_max)?;
        }
    }

    for part in 0..num_parts {
        if preds[part].uses_l0() {
            pred.mvd_l0[part] = [r.read_se()?, r.read_se()?];
        }
    }

    for part in 0..num_parts {
        if preds[part].uses_l1() {
            pred.mvd_l1[part] = [r.read_se()?, r.read_se()?];
        }
    }

    Ok(pred)
}

/// `sub_mb_pred()` of 7.3.5.2 for P_8x8, P_8x8ref0 and B_8x8 macroblocks.
fn parse_sub_mb_pred(
    r: &mut BitReader,
    header: &SliceHeader,
    mb_type: MbType,
    mb_field: Option<bool>,
    direct_8x8_inference_flag: bool,
    no_sub_part_below_8x8: &mut bool,
) -> Result<SubMbPred> {
    let is_b = matches!(mb_type, MbType::B(_));
    let mut pred = SubMbPred::default();

    for i in 0..4 {
        pred.sub_mb_type[i] = if is_b {
            r.read_ue_max("sub_mb_type", 12)?
        } else {
            r.read_ue_max("sub_mb_type", 3)?
        };
    }

    // noSubMbPartSizeLessThan8x8Flag of 7.3.5.
    for &sub_type in &pred.sub_mb_type {
        if is_b {
            if sub_type == 0 {
                if !direct_8x8_inference_flag {
                    *no_sub_part_below_8x8 = false;
                }
            } else if B_SUB_PARTS[usize::from(sub_type)].0 > 1 {
                *no_sub_part_below_8x8 = false;
            }
        } else if P_SUB_PARTS[usize::from(sub_type)] > 1 {
            *no_sub_part_below_8x8 = false;
        }
    }

    let sub_pred = |sub_type: u8| -> PartPred {
        if is_b {
            B_SUB_PARTS[usize::from(sub_type)].1
        } else {
            L0
        }
    };
    let sub_parts = |sub_type: u8| -> usize {
        if is_b {
            usize::from(B_SUB_PARTS[usize::from(sub_type)].0)
        } else {
            usize::from(P_SUB_PARTS[usize::from(sub_type)])
        }
    };
    // B_Direct_8x8 sub-macroblocks carry no further syntax.
    let is_direct = |sub_type: u8| -> bool { is_b && sub_type == 0 };

    let (l0_present, l0_max) = ref_idx_present_and_max(
        header.num_ref_idx_l0_active_minus1,
        mb_field,
        header.field_pic_flag,
    );
    let (l1_present, l1_max) = ref_idx_present_and_max(
        header.num_ref_idx_l1_active_minus1,
        mb_field,
        header.field_pic_flag,
    );

    for i in 0..4 {
        if l0_present
            && mb_type != MbType::P(4)
            && !is_direct(pred.sub_mb_type[i])
            && sub_pred(pred.sub_mb_type[i]).uses_l0()
        {
            pred.ref_idx_l0[i] = r.read_te("ref_idx_l0", l0_max)?;
        }
    }

    for i in 0..4 {
        if l1_present && !is_direct(pred.sub_mb_type[i]) && sub_pred(pred.sub_mb_type[i]).uses_l1()
        {
            pred.ref_idx_l1[i] = r.read_te("ref_idx_l1", l1_max)?;
        }
    }

    for i in 0..4 {
        if !is_direct(pred.sub_mb_type[i]) && sub_pred(pred.sub_mb_type[i]).uses_l0() {
            for j in 0..sub_parts(pred.sub_mb_type[i]) {
                pred.mvd_l0[i][j] = [r.read_se()?, r.read_se()?];
            }
        }
    }

    for i in 0..4 {
        if !is_direct(pred.sub_mb_type[i]) && sub_pred(pred.sub_mb_type[i]).uses_l1() {
            for j in 0..sub_parts(pred.sub_mb_type[i]) {
                pred.mvd_l1[i][j] = [r.read_se()?, r.read_se()?];
            }
        }
    }

    Ok(pred)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::parser::Sps;

    /// A 32x32 (2x2 macroblocks) frame-only SPS for driving the traversal
    /// directly.
    fn test_sps() -> Sps {
        Sps {
            chroma_format_idc: 1,
            pic_width_in_mbs_minus1: 1,
            pic_height_in_map_units_minus1: 1,
            frame_mbs_only_flag: true,
            ..Default::default()
        }
    }

    fn test_pps(entropy_coding_mode_flag: bool) -> Pps {
        test_pps_for(test_sps(), entropy_coding_mode_flag)
    }

    fn test_pps_for(sps: Sps, entropy_coding_mode_flag: bool) -> Pps {
        Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: 0,
            entropy_coding_mode_flag,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            slice_groups: None,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists_4x4: [[16; 16]; 6],
            scaling_lists_8x8: [[16; 64]; 6],
            second_chroma_qp_index_offset: 0,
            sps: Rc::new(sps),
        }
    }

    fn test_nalu_header() -> NaluHeader {
        NaluHeader {
            ref_idc: 3,
            type_: crate::nalu::NaluType::Slice,
            idr_pic_flag: false,
        }
    }

    #[test]
    fn p_slice_of_skip_runs_traverses_fully() {
        // mb_skip_run 4 covering the whole 2x2 picture, then the stop bit.
        let rbsp = [0b0010_1100];
        let mut r = BitReader::new(&rbsp);

        let header = SliceHeader {
            slice_type: SliceType::P,
            ..Default::default()
        };
        let pps = test_pps(false);

        let data = parse_slice_data(&mut r, &header, &pps, &test_nalu_header()).unwrap();
        assert!(data.fully_parsed);
        assert_eq!(data.macroblocks.len(), 4);
        assert!(data.macroblocks.iter().all(|mb| mb.mb_type == MbType::PSkip));
        assert_eq!(data.macroblocks[3].addr, 3);
        assert!(data.cabac_init.is_none());
    }

    #[test]
    fn field_slice_ref_idx_uses_doubled_bound() {
        // A field-coded (non-MBAFF) P slice addresses both fields of each
        // reference frame, so with num_ref_idx_l0_active_minus1 of 1 the
        // te(v) range for ref_idx_l0 is 0..=3 and the element is coded as
        // ue(v), not as a single inverted bit.
        //
        // Bits: 1 (skip run 0) | 1 (P_L0_16x16) | 011 (ref_idx_l0 2) |
        // 1 1 (zero mvd) | 1 (inter cbp 0) | stop bit.
        let rbsp = [0b1101_1111, 0b1000_0000];
        let mut r = BitReader::new(&rbsp);

        // Two macroblock columns, one field macroblock row.
        let sps = Sps {
            chroma_format_idc: 1,
            pic_width_in_mbs_minus1: 1,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: false,
            ..Default::default()
        };
        let header = SliceHeader {
            slice_type: SliceType::P,
            field_pic_flag: true,
            num_ref_idx_l0_active_minus1: 1,
            ..Default::default()
        };
        let pps = test_pps_for(sps, false);

        let data = parse_slice_data(&mut r, &header, &pps, &test_nalu_header()).unwrap();
        assert!(data.fully_parsed);
        assert_eq!(data.macroblocks.len(), 1);

        let mb = &data.macroblocks[0];
        assert_eq!(mb.mb_type, MbType::P(0));
        assert_eq!(mb.mb_field_decoding_flag, None);
        assert_eq!(mb.coded_block_pattern, 0);
        match &mb.pred {
            MbPred::Inter(pred) => {
                assert_eq!(pred.ref_idx_l0[0], 2);
                assert_eq!(pred.mvd_l0[0], [0, 0]);
            }
            other => panic!("unexpected prediction {:?}", other),
        }
    }

    #[test]
    fn i_pcm_macroblock_consumes_full_samples() {
        // mb_type 25 (I_PCM) in an I slice, alignment zeros, then 256 luma
        // and 128 chroma samples of 0x80 at 8 bits, then the stop bit.
        let mut rbsp = vec![0b0000_1101, 0b0000_0000];
        rbsp.extend(std::iter::repeat(0x80).take(384));
        rbsp.push(0x80);

        let mut r = BitReader::new(&rbsp);
        let header = SliceHeader {
            slice_type: SliceType::I,
            ..Default::default()
        };
        let pps = test_pps(false);

        let data = parse_slice_data(&mut r, &header, &pps, &test_nalu_header()).unwrap();
        assert!(data.fully_parsed);
        assert_eq!(data.macroblocks.len(), 1);

        let mb = &data.macroblocks[0];
        assert_eq!(mb.mb_type, MbType::IPcm);
        let pcm = mb.pcm.as_ref().unwrap();
        assert_eq!(pcm.luma.len(), 256);
        assert_eq!(pcm.chroma.len(), 128);
        assert!(pcm.luma.iter().all(|&s| s == 0x80));
    }

    #[test]
    fn traversal_stops_at_residual_data() {
        // I slice, I_NxN macroblock, all predicted intra modes, chroma mode
        // 0, coded_block_pattern 15 (intra code number 2): residual data
        // follows and traversal must stop before it.
        //
        // Bits: 1 | 16x1 | 1 | 011 (ue 2) | 010 (se 1, mb_qp_delta) | ...
        let rbsp = [0xff, 0xff, 0xda, 0x00];
        let mut r = BitReader::new(&rbsp);

        let header = SliceHeader {
            slice_type: SliceType::I,
            ..Default::default()
        };
        let pps = test_pps(false);

        let data = parse_slice_data(&mut r, &header, &pps, &test_nalu_header()).unwrap();
        assert!(!data.fully_parsed);
        assert_eq!(data.macroblocks.len(), 1);

        let mb = &data.macroblocks[0];
        assert_eq!(mb.mb_type, MbType::INxN);
        assert_eq!(mb.coded_block_pattern, 15);
        assert_eq!(mb.mb_qp_delta, 1);
        match &mb.pred {
            MbPred::IntraNxN(pred) => {
                assert_eq!(pred.modes.len(), 16);
                assert!(pred.modes.iter().all(Option::is_none));
                assert_eq!(pred.intra_chroma_pred_mode, 0);
            }
            other => panic!("unexpected prediction {:?}", other),
        }
    }

    #[test]
    fn cabac_slice_captures_engine_init() {
        // Three bits of slice header remainder, five alignment ones, then
        // the nine-bit initial offset.
        let rbsp = [0b1011_1111, 0xcd, 0x80];
        let mut r = BitReader::new(&rbsp);
        r.skip_bits(3).unwrap();

        let header = SliceHeader {
            slice_type: SliceType::P,
            cabac_init_idc: 1,
            slice_qp_delta: 2,
            ..Default::default()
        };
        let pps = test_pps(true);

        let data = parse_slice_data(&mut r, &header, &pps, &test_nalu_header()).unwrap();
        assert!(!data.fully_parsed);
        assert!(data.macroblocks.is_empty());

        let init = data.cabac_init.unwrap();
        assert_eq!(init.cabac_init_idc, 1);
        assert_eq!(init.slice_qp_y, 28);
        assert_eq!(init.cod_i_range, 510);
        assert_eq!(init.cod_i_offset, 0b1_1001_1011);
        assert_eq!(data.bits_consumed, 17);
    }

    #[test]
    fn cabac_misaligned_one_bit_is_rejected() {
        let rbsp = [0b1010_0000, 0x00];
        let mut r = BitReader::new(&rbsp);
        r.skip_bits(3).unwrap();

        let header = SliceHeader {
            slice_type: SliceType::P,
            ..Default::default()
        };
        let pps = test_pps(true);

        assert!(matches!(
            parse_slice_data(&mut r, &header, &pps, &test_nalu_header()),
            Err(ParseError::SyntaxViolation {
                field: "cabac_alignment_one_bit",
                ..
            })
        ));
    }

    #[test]
    fn coded_block_pattern_table_spot_checks() {
        // Code number 0: intra 47, inter 0. Code number 3: intra 0, inter 2.
        let decode = |bits: &[u8], chroma: u8, intra: bool| {
            let mut r = BitReader::new(bits);
            read_me(&mut r, chroma, intra).unwrap()
        };

        assert_eq!(decode(&[0b1000_0000], 1, true), 47);
        assert_eq!(decode(&[0b1000_0000], 1, false), 0);
        assert_eq!(decode(&[0b0010_0000], 1, true), 0);
        assert_eq!(decode(&[0b0010_0000], 1, false), 2);
        // Monochrome tables.
        assert_eq!(decode(&[0b1000_0000], 0, true), 15);
        assert_eq!(decode(&[0b0101_0000], 0, false), 1);

        // Code number 48 is outside the 4:2:0 table.
        let mut r = BitReader::new(&[0b0000_0110, 0b0010_0000]);
        assert!(matches!(
            read_me(&mut r, 1, true),
            Err(ParseError::SyntaxViolation { .. })
        ));
    }

    #[test]
    fn i16x16_derivations() {
        // mb_type 1 => k 0: pred mode 0, no coded blocks.
        assert_eq!(MbType::I16x16(0).i16x16_intra_pred_mode(), Some(0));
        assert_eq!(MbType::I16x16(0).i16x16_coded_block_pattern(), Some(0));
        // k 14: pred mode 2, chroma 0, luma 15.
        assert_eq!(MbType::I16x16(14).i16x16_intra_pred_mode(), Some(2));
        assert_eq!(MbType::I16x16(14).i16x16_coded_block_pattern(), Some(15));
        // k 7: pred mode 3, chroma 1, luma 0.
        assert_eq!(MbType::I16x16(7).i16x16_coded_block_pattern(), Some(0x10));
    }
}
