// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CABAC arithmetic-decoder inputs: the engine initialization captured from
//! the slice data (9.3.1.2) and the shared range table of 9.3.3.2.1.1.
//! Arithmetic decoding of residual coefficients itself is not performed.

use crate::ParseError;
use crate::Result;

/// `codIRange` at engine initialization. See 9.3.1.2.
pub const COD_I_RANGE_INIT: u16 = 510;

/// The initialization state of the CABAC decoding engine for one slice:
/// everything clause 9.3.1 derives its context variables from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CabacInit {
    /// Selects the context initialization table. From the slice header.
    pub cabac_init_idc: u8,
    /// SliceQPY, the initial luma quantizer of the slice (7-30).
    pub slice_qp_y: i32,
    /// Initial `codIRange`, always [`COD_I_RANGE_INIT`].
    pub cod_i_range: u16,
    /// Initial `codIOffset`: the first nine RBSP bits after alignment.
    pub cod_i_offset: u16,
}

/// rangeTabLPS of table 9-44, indexed by `pStateIdx` and `qCodIRangeIdx`.
pub const RANGE_TAB_LPS: [[u8; 4]; 64] = [
    [128, 176, 208, 240],
    [128, 167, 197, 227],
    [128, 158, 187, 216],
    [123, 150, 178, 205],
    [116, 142, 169, 195],
    [111, 135, 160, 185],
    [105, 128, 152, 175],
    [100, 122, 144, 166],
    [95, 116, 137, 158],
    [90, 110, 130, 150],
    [85, 104, 123, 142],
    [81, 99, 117, 135],
    [77, 94, 111, 128],
    [73, 89, 105, 122],
    [69, 85, 100, 116],
    [66, 80, 95, 110],
    [62, 76, 90, 104],
    [59, 72, 86, 99],
    [56, 69, 81, 94],
    [53, 65, 77, 89],
    [51, 62, 73, 85],
    [48, 59, 69, 80],
    [46, 56, 66, 76],
    [43, 53, 63, 72],
    [41, 50, 59, 69],
    [39, 48, 56, 65],
    [37, 45, 54, 62],
    [35, 43, 51, 59],
    [33, 41, 48, 56],
    [32, 39, 46, 53],
    [30, 37, 43, 50],
    [29, 35, 41, 48],
    [27, 33, 39, 45],
    [26, 31, 36, 42],
    [24, 30, 35, 41],
    [23, 28, 33, 39],
    [22, 27, 32, 37],
    [21, 26, 30, 35],
    [20, 24, 29, 33],
    [19, 23, 27, 31],
    [18, 22, 26, 30],
    [17, 21, 25, 28],
    [16, 20, 23, 27],
    [15, 19, 22, 25],
    [14, 18, 21, 24],
    [14, 17, 20, 23],
    [13, 16, 19, 22],
    [12, 15, 18, 21],
    [12, 14, 17, 20],
    [11, 14, 16, 19],
    [11, 13, 15, 18],
    [10, 12, 15, 17],
    [10, 12, 14, 16],
    [9, 11, 13, 15],
    [9, 11, 12, 14],
    [8, 10, 12, 14],
    [8, 9, 11, 13],
    [7, 9, 11, 12],
    [7, 9, 10, 12],
    [7, 8, 10, 11],
    [6, 8, 9, 11],
    [6, 7, 9, 10],
    [6, 7, 8, 9],
    [2, 2, 2, 2],
];

/// `codIRangeLPS` lookup into table 9-44.
pub fn cod_i_range_lps(p_state_idx: usize, q_cod_i_range_idx: usize) -> Result<u8> {
    let row = RANGE_TAB_LPS
        .get(p_state_idx)
        .ok_or(ParseError::SyntaxViolation {
            field: "pStateIdx",
            got: p_state_idx as i64,
            constraint: "0..=63",
        })?;

    row.get(q_cod_i_range_idx)
        .copied()
        .ok_or(ParseError::SyntaxViolation {
            field: "qCodIRangeIdx",
            got: q_cod_i_range_idx as i64,
            constraint: "0..=3",
        })
}
