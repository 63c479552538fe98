// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter-set and slice-header syntax (7.3.2, 7.3.3), and the
//! [`VideoStream`] that owns the decoded stream state.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Context;

use crate::bit_reader::BitReader;
use crate::nalu::Nalu;
use crate::nalu::NaluHeader;
use crate::nalu::NaluType;
use crate::slice_data;
use crate::slice_data::SliceData;
use crate::ParameterSetKind;
use crate::ParseError;
use crate::Result;

pub(crate) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(crate) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(crate) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(crate) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_SPS_ID: u32 = 31;
const MAX_PPS_ID: u32 = 255;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

/// Profiles defined in annex A that this parser targets.
#[derive(enumn::N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

#[derive(enumn::N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// Canonical slice coding types of table 7-6 (`slice_type % 5`).
#[derive(enumn::N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }

    /// Whether slices of this type carry inter prediction.
    pub fn is_inter(&self) -> bool {
        !self.is_i() && !self.is_si()
    }
}

/// Hypothetical reference decoder parameters, clause E.1.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,

    /// Indexed by `SchedSelIdx`.
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],

    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

/// Video usability information, annex E. Optional SPS appendix; none of it
/// affects slice parsing but all of it is recovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    /// Sample aspect ratio code of table E-1; 255 means an explicit
    /// `sar_width`/`sar_height` pair follows.
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: Default::default(),
            aspect_ratio_idc: Default::default(),
            sar_width: Default::default(),
            sar_height: Default::default(),
            overscan_info_present_flag: Default::default(),
            overscan_appropriate_flag: Default::default(),
            video_signal_type_present_flag: Default::default(),
            // Inferred values per E.2.1 when the elements are absent.
            video_format: 5,
            video_full_range_flag: Default::default(),
            colour_description_present_flag: Default::default(),
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: Default::default(),
            chroma_sample_loc_type_top_field: Default::default(),
            chroma_sample_loc_type_bottom_field: Default::default(),
            timing_info_present_flag: Default::default(),
            num_units_in_tick: Default::default(),
            time_scale: Default::default(),
            fixed_frame_rate_flag: Default::default(),
            nal_hrd_parameters_present_flag: Default::default(),
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: Default::default(),
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: Default::default(),
            pic_struct_present_flag: Default::default(),
            bitstream_restriction_flag: Default::default(),
            motion_vectors_over_pic_boundaries_flag: Default::default(),
            max_bytes_per_pic_denom: Default::default(),
            max_bits_per_mb_denom: Default::default(),
            log2_max_mv_length_horizontal: Default::default(),
            log2_max_mv_length_vertical: Default::default(),
            max_num_reorder_frames: Default::default(),
            max_dec_frame_buffering: Default::default(),
        }
    }
}

/// A sequence parameter set, 7.3.2.1. Applies to every coded video sequence
/// whose PPSes name its `seq_parameter_set_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,

    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,

    pub level_idc: Level,

    /// Chroma sampling relative to luma, clause 6.2. Inferred as 1 (4:2:0)
    /// for profiles that do not carry the field.
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,

    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    pub seq_scaling_matrix_present_flag: bool,
    /// Scaling lists as read with 7.3.2.1.1.1, default and fall-back rules
    /// applied.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],

    pub log2_max_frame_num_minus4: u8,

    /// Picture order count derivation method, clause 8.2.1.
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,
    /// ExpectedDeltaPerPicOrderCntCycle of equation 7-12, accumulated at
    /// parse time.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,

    /// Set when every coded picture of the sequence is a frame of frame
    /// macroblocks; field coding and MBAFF are possible otherwise.
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,

    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: Default::default(),
            profile_idc: Default::default(),
            constraint_set0_flag: Default::default(),
            constraint_set1_flag: Default::default(),
            constraint_set2_flag: Default::default(),
            constraint_set3_flag: Default::default(),
            constraint_set4_flag: Default::default(),
            constraint_set5_flag: Default::default(),
            level_idc: Default::default(),
            chroma_format_idc: Default::default(),
            separate_colour_plane_flag: Default::default(),
            bit_depth_luma_minus8: Default::default(),
            bit_depth_chroma_minus8: Default::default(),
            qpprime_y_zero_transform_bypass_flag: Default::default(),
            seq_scaling_matrix_present_flag: Default::default(),
            scaling_lists_4x4: [[0; 16]; 6],
            scaling_lists_8x8: [[0; 64]; 6],
            log2_max_frame_num_minus4: Default::default(),
            pic_order_cnt_type: Default::default(),
            log2_max_pic_order_cnt_lsb_minus4: Default::default(),
            delta_pic_order_always_zero_flag: Default::default(),
            offset_for_non_ref_pic: Default::default(),
            offset_for_top_to_bottom_field: Default::default(),
            num_ref_frames_in_pic_order_cnt_cycle: Default::default(),
            offset_for_ref_frame: Default::default(),
            expected_delta_per_pic_order_cnt_cycle: Default::default(),
            max_num_ref_frames: Default::default(),
            gaps_in_frame_num_value_allowed_flag: Default::default(),
            pic_width_in_mbs_minus1: Default::default(),
            pic_height_in_map_units_minus1: Default::default(),
            frame_mbs_only_flag: Default::default(),
            mb_adaptive_frame_field_flag: Default::default(),
            direct_8x8_inference_flag: Default::default(),
            frame_cropping_flag: Default::default(),
            frame_crop_left_offset: Default::default(),
            frame_crop_right_offset: Default::default(),
            frame_crop_top_offset: Default::default(),
            frame_crop_bottom_offset: Default::default(),
            vui_parameters_present_flag: Default::default(),
            vui_parameters: Default::default(),
        }
    }
}

impl Sps {
    pub fn profile(&self) -> Option<Profile> {
        Profile::n(self.profile_idc)
    }

    /// Coded luma width in samples, 7-13.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Coded luma height in samples, 7-16/7-17.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// ChromaArrayType: equal to `chroma_format_idc` unless the colour
    /// planes are coded separately.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// (SubWidthC, SubHeightC) of table 6-1.
    pub fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // Monochrome or separate planes: undefined by table 6-1.
            _ => (1, 1),
        }
    }

    /// (MbWidthC, MbHeightC): chroma macroblock dimensions, 6-2/6-3.
    pub fn mb_width_height_c(&self) -> (u32, u32) {
        if self.chroma_array_type() == 0 {
            (0, 0)
        } else {
            let (sub_width_c, sub_height_c) = self.sub_width_height_c();
            (16 / sub_width_c, 16 / sub_height_c)
        }
    }

    /// BitDepthY, 7-3.
    pub const fn bit_depth_luma(&self) -> u8 {
        8 + self.bit_depth_luma_minus8
    }

    /// BitDepthC, 7-5.
    pub const fn bit_depth_chroma(&self) -> u8 {
        8 + self.bit_depth_chroma_minus8
    }

    /// QpBdOffsetY, 7-4.
    pub const fn qp_bd_offset_y(&self) -> i32 {
        6 * self.bit_depth_luma_minus8 as i32
    }

    /// QpBdOffsetC, 7-6.
    pub const fn qp_bd_offset_c(&self) -> i32 {
        6 * self.bit_depth_chroma_minus8 as i32
    }

    /// RawMbBits, 7-7: the size of one uncompressed macroblock, which is
    /// what an I_PCM macroblock carries.
    pub fn raw_mb_bits(&self) -> u32 {
        let (mb_width_c, mb_height_c) = self.mb_width_height_c();
        256 * self.bit_depth_luma() as u32
            + 2 * mb_width_c * mb_height_c * self.bit_depth_chroma() as u32
    }

    /// MaxFrameNum, 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// MaxPicOrderCntLsb, 7-11.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub const fn pic_width_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs_minus1 as u32 + 1
    }

    pub const fn pic_height_in_map_units(&self) -> u32 {
        self.pic_height_in_map_units_minus1 as u32 + 1
    }

    /// PicSizeInMapUnits, 7-14.
    pub const fn pic_size_in_map_units(&self) -> u32 {
        self.pic_width_in_mbs() * self.pic_height_in_map_units()
    }

    /// FrameHeightInMbs, 7-18.
    pub const fn frame_height_in_mbs(&self) -> u32 {
        (2 - self.frame_mbs_only_flag as u32) * self.pic_height_in_map_units()
    }

    /// (CropUnitX, CropUnitY), 7-19 through 7-22.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }

    /// The rectangle of luma samples that survives output cropping.
    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect {
                min: Point { x: 0, y: 0 },
                max: Point {
                    x: self.width(),
                    y: self.height(),
                },
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        let crop_left = crop_unit_x * self.frame_crop_left_offset;
        let crop_right = crop_unit_x * self.frame_crop_right_offset;
        let crop_top = crop_unit_y * self.frame_crop_top_offset;
        let crop_bottom = crop_unit_y * self.frame_crop_bottom_offset;

        Rect {
            min: Point {
                x: crop_left,
                y: crop_top,
            },
            max: Point {
                x: self.width() - crop_left - crop_right,
                y: self.height() - crop_top - crop_bottom,
            },
        }
    }
}

/// Slice-group (FMO) map parameters of 7.3.2.2, present when a PPS defines
/// more than one slice group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceGroups {
    /// slice_group_map_type, 0..=6.
    pub map_type: u8,
    /* map_type 0 */
    pub run_length_minus1: Vec<u32>,
    /* map_type 2 */
    pub top_left: Vec<u32>,
    pub bottom_right: Vec<u32>,
    /* map_type 3..=5 */
    pub change_direction_flag: bool,
    pub change_rate_minus1: u32,
    /* map_type 6 */
    pub pic_size_in_map_units_minus1: u32,
    pub slice_group_id: Vec<u32>,
}

impl SliceGroups {
    /// SliceGroupChangeRate, 7-23.
    pub fn change_rate(&self) -> u32 {
        self.change_rate_minus1 + 1
    }
}

/// A picture parameter set, 7.3.2.2, with its referenced SPS resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    /// Selects CABAC (set) or CAVLC/Exp-Golomb (unset) for the slice data of
    /// pictures using this PPS.
    pub entropy_coding_mode_flag: bool,

    pub bottom_field_pic_order_in_frame_present_flag: bool,

    pub num_slice_groups_minus1: u32,
    /// Slice-group map parameters, present iff `num_slice_groups_minus1 > 0`.
    pub slice_groups: Option<SliceGroups>,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    /* the tail below is only present for the high profiles */
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],
    /// Inferred equal to `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,

    /// The SPS this PPS refers to.
    pub sps: Rc<Sps>,
}

/// One entry of the `ref_pic_list_modification()` process, 7.3.3.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* idc 0 or 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* idc 2 */
    pub long_term_pic_num: u32,
}

/// Explicit prediction weights of 7.3.3.2. Weights not present in the
/// bitstream are filled with their inferred defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i8; 32],

    /* when ChromaArrayType != 0 */
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i8; 2]; 32],

    /* list 1, B slices only */
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i8; 32],

    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i8; 2]; 32],
}

/// `MaxLongTermFrameIdx`, which is carried in the bitstream as a plus-1
/// value whose zero means "no long-term frame indices".
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    pub fn from_value_plus1(value_plus1: u32) -> Self {
        match value_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i => Self::Idx(i - 1),
        }
    }

    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

/// One memory-management-control operation of table 7-9.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    pub memory_management_control_operation: u8,
    /* mmco 1 or 3 */
    pub difference_of_pic_nums_minus1: u32,
    /* mmco 2 */
    pub long_term_pic_num: u32,
    /* mmco 3 or 6 */
    pub long_term_frame_idx: u32,
    /* mmco 4 */
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

/// `dec_ref_pic_marking()`, 7.3.3.3. IDR pictures carry the two flags;
/// other reference pictures optionally carry a list of MMCO operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<RefPicMarkingInner>,
}

/// A slice header, 7.3.3, with every SPS/PPS-dependent branch resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Address of the first macroblock in the slice (first macroblock pair
    /// when MBAFF is in use).
    pub first_mb_in_slice: u32,

    /// slice_type as coded, 0..=9. Values 5..=9 additionally promise that
    /// every other slice of the picture has the same canonical type.
    pub slice_type_raw: u8,
    /// The canonical type, `slice_type % 5`.
    pub slice_type: SliceType,

    pub pic_parameter_set_id: u8,

    /// Only present when the SPS codes colour planes separately.
    pub colour_plane_id: u8,

    pub frame_num: u16,

    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    /// Identifies the IDR picture this slice belongs to, when IDR.
    pub idr_pic_id: u16,

    /* pic_order_cnt_type == 0 */
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    /* pic_order_cnt_type == 1 */
    pub delta_pic_order_cnt: [i32; 2],

    pub redundant_pic_cnt: u8,

    pub direct_spatial_mv_pred_flag: bool,

    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    pub pred_weight_table: PredWeightTable,

    pub dec_ref_pic_marking: RefPicMarking,

    /// Context-table selector for CABAC slices.
    pub cabac_init_idc: u8,

    pub slice_qp_delta: i8,

    /* SP and SI slices */
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,

    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    /// Position within the cyclic slice-group change, present for map types
    /// 3..=5.
    pub slice_group_change_cycle: u32,

    /// MaxPicNum: MaxFrameNum for frame slices, doubled for field slices.
    pub max_pic_num: u32,

    /// Size of the slice_header() in RBSP bits.
    pub header_bit_size: usize,
}

impl SliceHeader {
    /// SliceQPY of equation 7-30.
    pub fn slice_qp_y(&self, pps: &Pps) -> i32 {
        26 + i32::from(pps.pic_init_qp_minus26) + i32::from(self.slice_qp_delta)
    }
}

/// A parsed slice: its resolved parameter-set ids, the header, and the
/// traversed part of the slice data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub sps_id: u8,
    pub pps_id: u8,
    pub nal_ref_idc: u8,
    pub nalu_type: NaluType,
    pub header: SliceHeader,
    pub data: SliceData,
}

/// The decoded state of one elementary stream: parameter sets keyed by id
/// and slices in arrival order.
///
/// Parameter sets of equal id overwrite each other (last writer wins);
/// slices resolve against the sets current at their parse time and are
/// immutable once stored.
#[derive(Debug, Default)]
pub struct VideoStream {
    spses: BTreeMap<u8, Rc<Sps>>,
    ppses: BTreeMap<u8, Rc<Pps>>,
    slices: Vec<Slice>,
}

impl VideoStream {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.spses.get(&sps_id)
    }

    pub fn pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.ppses.get(&pps_id)
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// Parse a SPS NAL unit and make it the active SPS for its id.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<&Rc<Sps>> {
        expect_nalu_type(nalu, NaluType::Sps)?;

        let mut r = BitReader::new(nalu.rbsp());
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).with_context(|| format!("unknown level_idc {}", level))?;
        sps.seq_parameter_set_id = r.read_ue_max("seq_parameter_set_id", MAX_SPS_ID)?;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.read_ue_max("chroma_format_idc", 3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
                if sps.separate_colour_plane_flag {
                    return Err(ParseError::Unsupported("separate colour planes"));
                }
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max("bit_depth_luma_minus8", 6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max("bit_depth_chroma_minus8", 6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                parse_sps_scaling_lists(&mut r, &mut sps)?;
            } else {
                fill_scaling_lists_flat(&mut sps.scaling_lists_4x4, &mut sps.scaling_lists_8x8);
            }
        } else {
            sps.chroma_format_idc = 1;
            fill_scaling_lists_flat(&mut sps.scaling_lists_4x4, &mut sps.scaling_lists_8x8);
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max("log2_max_frame_num_minus4", 12)?;
        sps.pic_order_cnt_type = r.read_ue_max("pic_order_cnt_type", 2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 =
                r.read_ue_max("log2_max_pic_order_cnt_lsb_minus4", 12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle =
                r.read_ue_max("num_ref_frames_in_pic_order_cnt_cycle", 254)?;

            let mut offset_acc = 0i32;
            for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                let offset = r.read_se()?;
                sps.offset_for_ref_frame.push(offset);
                // Equation 7-12.
                offset_acc = offset_acc.wrapping_add(offset);
            }

            sps.expected_delta_per_pic_order_cnt_cycle = offset_acc;
        }

        sps.max_num_ref_frames = r.read_ue_max("max_num_ref_frames", 16)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 =
            r.read_ue_max("pic_width_in_mbs_minus1", u32::from(u16::MAX))?;
        sps.pic_height_in_map_units_minus1 =
            r.read_ue_max("pic_height_in_map_units_minus1", u32::from(u16::MAX))?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // The crop window must fit inside the coded picture.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|w| w.checked_mul(crop_unit_x))
                .and_then(|w| sps.width().checked_sub(w))
                .ok_or(ParseError::SyntaxViolation {
                    field: "frame_crop_left_offset/frame_crop_right_offset",
                    got: sps.frame_crop_left_offset as i64,
                    constraint: "within the coded picture width",
                })?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|h| h.checked_mul(crop_unit_y))
                .and_then(|h| sps.height().checked_sub(h))
                .ok_or(ParseError::SyntaxViolation {
                    field: "frame_crop_top_offset/frame_crop_bottom_offset",
                    got: sps.frame_crop_top_offset as i64,
                    constraint: "within the coded picture height",
                })?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            parse_vui(&mut r, &mut sps)?;
        }

        let key = sps.seq_parameter_set_id;
        self.spses.insert(key, Rc::new(sps));
        self.spses
            .get(&key)
            .ok_or(ParseError::InternalInvariant("SPS not stored"))
    }

    /// Parse a PPS NAL unit against the already-parsed SPSes and make it the
    /// active PPS for its id.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<&Rc<Pps>> {
        expect_nalu_type(nalu, NaluType::Pps)?;

        let mut r = BitReader::new(nalu.rbsp());
        let pic_parameter_set_id = r.read_ue_max("pic_parameter_set_id", MAX_PPS_ID)?;
        let seq_parameter_set_id = r.read_ue_max("seq_parameter_set_id", MAX_SPS_ID)?;

        let sps = Rc::clone(self.sps(seq_parameter_set_id).ok_or(
            ParseError::UnresolvedReference {
                kind: ParameterSetKind::Sps,
                id: u32::from(seq_parameter_set_id),
            },
        )?);

        let mut pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            entropy_coding_mode_flag: r.read_bit()?,
            bottom_field_pic_order_in_frame_present_flag: r.read_bit()?,
            num_slice_groups_minus1: r.read_ue_max("num_slice_groups_minus1", 7)?,
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
            scaling_lists_4x4: [[0; 16]; 6],
            scaling_lists_8x8: [[0; 64]; 6],
            second_chroma_qp_index_offset: 0,
            sps,
        };

        if pps.num_slice_groups_minus1 > 0 {
            pps.slice_groups = Some(parse_slice_groups(&mut r, pps.num_slice_groups_minus1)?);
        }

        pps.num_ref_idx_l0_default_active_minus1 =
            r.read_ue_max("num_ref_idx_l0_default_active_minus1", 31)?;
        pps.num_ref_idx_l1_default_active_minus1 =
            r.read_ue_max("num_ref_idx_l1_default_active_minus1", 31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = pps.sps.qp_bd_offset_y();
        pps.pic_init_qp_minus26 =
            r.read_se_bounded("pic_init_qp_minus26", -(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded("pic_init_qs_minus26", -26, 25)?;
        pps.chroma_qp_index_offset = r.read_se_bounded("chroma_qp_index_offset", -12, 12)?;

        // Inferred equal to chroma_qp_index_offset unless the high-profile
        // tail overrides it below.
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.more_rbsp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                parse_pps_scaling_lists(&mut r, &mut pps)?;
            }

            pps.second_chroma_qp_index_offset =
                r.read_se_bounded("second_chroma_qp_index_offset", -12, 12)?;
        }

        if !pps.pic_scaling_matrix_present_flag {
            // Inferred equal to the sequence-level lists.
            pps.scaling_lists_4x4 = pps.sps.scaling_lists_4x4;
            pps.scaling_lists_8x8 = pps.sps.scaling_lists_8x8;
        }

        let key = pps.pic_parameter_set_id;
        self.ppses.insert(key, Rc::new(pps));
        self.ppses
            .get(&key)
            .ok_or(ParseError::InternalInvariant("PPS not stored"))
    }

    /// Parse a slice NAL unit (header and data traversal) against the
    /// already-parsed parameter sets and append it to the stream.
    pub fn parse_slice(&mut self, nalu: &Nalu) -> Result<&Slice> {
        if !nalu.header.type_.is_slice() {
            return Err(ParseError::InternalInvariant(
                "NAL unit is not a coded slice",
            ));
        }

        let mut r = BitReader::new(nalu.rbsp());
        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        header.slice_type_raw = r.read_ue_max("slice_type", 9)?;
        header.slice_type = SliceType::n(header.slice_type_raw % 5)
            .ok_or(ParseError::InternalInvariant("slice_type out of range"))?;
        header.pic_parameter_set_id = r.read_ue_max("pic_parameter_set_id", MAX_PPS_ID)?;

        let pps = Rc::clone(self.pps(header.pic_parameter_set_id).ok_or(
            ParseError::UnresolvedReference {
                kind: ParameterSetKind::Pps,
                id: u32::from(header.pic_parameter_set_id),
            },
        )?);

        parse_slice_header_tail(&mut r, &mut header, &nalu.header, &pps)?;
        let data = slice_data::parse_slice_data(&mut r, &header, &pps, &nalu.header)?;

        self.slices.push(Slice {
            sps_id: pps.seq_parameter_set_id,
            pps_id: pps.pic_parameter_set_id,
            nal_ref_idc: nalu.header.ref_idc,
            nalu_type: nalu.header.type_,
            header,
            data,
        });

        self.slices
            .last()
            .ok_or(ParseError::InternalInvariant("slice not stored"))
    }
}

fn expect_nalu_type(nalu: &Nalu, expected: NaluType) -> Result<()> {
    if nalu.header.type_ != expected {
        return Err(ParseError::InternalInvariant(
            "NAL unit dispatched to the wrong parser",
        ));
    }

    Ok(())
}

/// 7.3.2.1.1.1. `use_default` is set when the list signals the canonical
/// default matrix via a zero first `next_scale`.
fn parse_scaling_list(r: &mut BitReader, list: &mut [u8], use_default: &mut bool) -> Result<()> {
    let mut last_scale = 8u8;
    let mut next_scale = 8u8;

    for (j, entry) in list.iter_mut().enumerate() {
        if next_scale != 0 {
            let delta_scale: i32 = r.read_se_bounded("delta_scale", -128, 127)?;
            next_scale = ((i32::from(last_scale) + delta_scale + 256) % 256) as u8;

            *use_default = j == 0 && next_scale == 0;
            if *use_default {
                return Ok(());
            }
        }

        *entry = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };
        last_scale = *entry;
    }

    Ok(())
}

/// Table 7-2, default column.
fn fill_default_scaling_list_4x4(list: &mut [u8; 16], i: usize) {
    *list = if i < 3 {
        DEFAULT_4X4_INTRA
    } else {
        DEFAULT_4X4_INTER
    };
}

fn fill_default_scaling_list_8x8(list: &mut [u8; 64], i: usize) {
    *list = if i % 2 == 0 {
        DEFAULT_8X8_INTRA
    } else {
        DEFAULT_8X8_INTER
    };
}

/// Table 7-2, fall-back column: entries not present in the bitstream copy
/// either the given defaults or the previously decoded list.
fn fill_fallback_scaling_list_4x4(
    lists: &mut [[u8; 16]; 6],
    i: usize,
    default_intra: &[u8; 16],
    default_inter: &[u8; 16],
) -> Result<()> {
    lists[i] = match i {
        0 => *default_intra,
        1 => lists[0],
        2 => lists[1],
        3 => *default_inter,
        4 => lists[3],
        5 => lists[4],
        _ => return Err(ParseError::InternalInvariant("scaling list index > 5")),
    };

    Ok(())
}

fn fill_fallback_scaling_list_8x8(
    lists: &mut [[u8; 64]; 6],
    i: usize,
    default_intra: &[u8; 64],
    default_inter: &[u8; 64],
) -> Result<()> {
    lists[i] = match i {
        0 => *default_intra,
        1 => *default_inter,
        2 => lists[0],
        3 => lists[1],
        4 => lists[2],
        5 => lists[3],
        _ => return Err(ParseError::InternalInvariant("scaling list index > 5")),
    };

    Ok(())
}

/// Flat_4x4_16 and Flat_8x8_16, equations 7-8 and 7-9.
fn fill_scaling_lists_flat(lists_4x4: &mut [[u8; 16]; 6], lists_8x8: &mut [[u8; 64]; 6]) {
    for list in lists_4x4.iter_mut() {
        list.fill(16);
    }

    for list in lists_8x8.iter_mut() {
        list.fill(16);
    }
}

fn parse_sps_scaling_lists(r: &mut BitReader, sps: &mut Sps) -> Result<()> {
    for i in 0..6 {
        let seq_scaling_list_present_flag = r.read_bit()?;
        if seq_scaling_list_present_flag {
            let mut use_default = false;
            parse_scaling_list(r, &mut sps.scaling_lists_4x4[i], &mut use_default)?;

            if use_default {
                fill_default_scaling_list_4x4(&mut sps.scaling_lists_4x4[i], i);
            }
        } else {
            fill_fallback_scaling_list_4x4(
                &mut sps.scaling_lists_4x4,
                i,
                &DEFAULT_4X4_INTRA,
                &DEFAULT_4X4_INTER,
            )?;
        }
    }

    let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
    for i in 0..num_8x8 {
        let seq_scaling_list_present_flag = r.read_bit()?;
        if seq_scaling_list_present_flag {
            let mut use_default = false;
            parse_scaling_list(r, &mut sps.scaling_lists_8x8[i], &mut use_default)?;

            if use_default {
                fill_default_scaling_list_8x8(&mut sps.scaling_lists_8x8[i], i);
            }
        } else {
            fill_fallback_scaling_list_8x8(
                &mut sps.scaling_lists_8x8,
                i,
                &DEFAULT_8X8_INTRA,
                &DEFAULT_8X8_INTER,
            )?;
        }
    }

    Ok(())
}

fn parse_pps_scaling_lists(r: &mut BitReader, pps: &mut Pps) -> Result<()> {
    let seq_present = pps.sps.seq_scaling_matrix_present_flag;

    for i in 0..6 {
        let pic_scaling_list_present_flag = r.read_bit()?;
        if pic_scaling_list_present_flag {
            let mut use_default = false;
            parse_scaling_list(r, &mut pps.scaling_lists_4x4[i], &mut use_default)?;

            if use_default {
                fill_default_scaling_list_4x4(&mut pps.scaling_lists_4x4[i], i);
            }
        } else if !seq_present {
            // Table 7-2, fall-back rule A.
            fill_fallback_scaling_list_4x4(
                &mut pps.scaling_lists_4x4,
                i,
                &DEFAULT_4X4_INTRA,
                &DEFAULT_4X4_INTER,
            )?;
        } else {
            // Table 7-2, fall-back rule B.
            let (sps_intra, sps_inter) = (
                pps.sps.scaling_lists_4x4[0],
                pps.sps.scaling_lists_4x4[3],
            );
            fill_fallback_scaling_list_4x4(&mut pps.scaling_lists_4x4, i, &sps_intra, &sps_inter)?;
        }
    }

    if pps.transform_8x8_mode_flag {
        let num_8x8 = if pps.sps.chroma_format_idc != 3 { 2 } else { 6 };

        for i in 0..num_8x8 {
            let pic_scaling_list_present_flag = r.read_bit()?;
            if pic_scaling_list_present_flag {
                let mut use_default = false;
                parse_scaling_list(r, &mut pps.scaling_lists_8x8[i], &mut use_default)?;

                if use_default {
                    fill_default_scaling_list_8x8(&mut pps.scaling_lists_8x8[i], i);
                }
            } else if !seq_present {
                // Fall-back rule A.
                fill_fallback_scaling_list_8x8(
                    &mut pps.scaling_lists_8x8,
                    i,
                    &DEFAULT_8X8_INTRA,
                    &DEFAULT_8X8_INTER,
                )?;
            } else {
                // Fall-back rule B.
                let (sps_intra, sps_inter) = (
                    pps.sps.scaling_lists_8x8[0],
                    pps.sps.scaling_lists_8x8[1],
                );
                fill_fallback_scaling_list_8x8(
                    &mut pps.scaling_lists_8x8,
                    i,
                    &sps_intra,
                    &sps_inter,
                )?;
            }
        }
    }

    Ok(())
}

fn parse_slice_groups(r: &mut BitReader, num_slice_groups_minus1: u32) -> Result<SliceGroups> {
    let mut groups = SliceGroups {
        map_type: r.read_ue_max("slice_group_map_type", 6)?,
        ..Default::default()
    };

    match groups.map_type {
        0 => {
            for _ in 0..=num_slice_groups_minus1 {
                groups.run_length_minus1.push(r.read_ue()?);
            }
        }
        2 => {
            // The last slice group is the background and carries no
            // rectangle.
            for _ in 0..num_slice_groups_minus1 {
                groups.top_left.push(r.read_ue()?);
                groups.bottom_right.push(r.read_ue()?);
            }
        }
        3..=5 => {
            groups.change_direction_flag = r.read_bit()?;
            groups.change_rate_minus1 = r.read_ue()?;
        }
        6 => {
            groups.pic_size_in_map_units_minus1 = r.read_ue()?;
            let id_bits = ceil_log2(num_slice_groups_minus1 + 1);
            for _ in 0..=groups.pic_size_in_map_units_minus1 {
                groups
                    .slice_group_id
                    .push(r.read_bits::<u32>(id_bits)?);
            }
        }
        // Map types 1 (dispersed) and the rest of 0..=6 carry no extra
        // parameters.
        _ => (),
    }

    Ok(groups)
}

fn parse_hrd(r: &mut BitReader, hrd: &mut HrdParams) -> Result<()> {
    hrd.cpb_cnt_minus1 = r.read_ue_max("cpb_cnt_minus1", 31)?;
    hrd.bit_rate_scale = r.read_bits(4)?;
    hrd.cpb_size_scale = r.read_bits(4)?;

    for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
        hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
        hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
        hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
    }

    hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
    hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
    hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
    hrd.time_offset_length = r.read_bits(5)?;
    Ok(())
}

fn parse_vui(r: &mut BitReader, sps: &mut Sps) -> Result<()> {
    let vui = &mut sps.vui_parameters;

    vui.aspect_ratio_info_present_flag = r.read_bit()?;
    if vui.aspect_ratio_info_present_flag {
        vui.aspect_ratio_idc = r.read_bits(8)?;
        if vui.aspect_ratio_idc == 255 {
            vui.sar_width = r.read_bits(16)?;
            vui.sar_height = r.read_bits(16)?;
        }
    }

    vui.overscan_info_present_flag = r.read_bit()?;
    if vui.overscan_info_present_flag {
        vui.overscan_appropriate_flag = r.read_bit()?;
    }

    vui.video_signal_type_present_flag = r.read_bit()?;
    if vui.video_signal_type_present_flag {
        vui.video_format = r.read_bits(3)?;
        vui.video_full_range_flag = r.read_bit()?;
        vui.colour_description_present_flag = r.read_bit()?;
        if vui.colour_description_present_flag {
            vui.colour_primaries = r.read_bits(8)?;
            vui.transfer_characteristics = r.read_bits(8)?;
            vui.matrix_coefficients = r.read_bits(8)?;
        }
    }

    vui.chroma_loc_info_present_flag = r.read_bit()?;
    if vui.chroma_loc_info_present_flag {
        vui.chroma_sample_loc_type_top_field =
            r.read_ue_max("chroma_sample_loc_type_top_field", 5)?;
        vui.chroma_sample_loc_type_bottom_field =
            r.read_ue_max("chroma_sample_loc_type_bottom_field", 5)?;
    }

    vui.timing_info_present_flag = r.read_bit()?;
    if vui.timing_info_present_flag {
        vui.num_units_in_tick = r.read_bits(32)?;
        if vui.num_units_in_tick == 0 {
            return Err(ParseError::SyntaxViolation {
                field: "num_units_in_tick",
                got: 0,
                constraint: "greater than zero (E.2.1)",
            });
        }

        vui.time_scale = r.read_bits(32)?;
        if vui.time_scale == 0 {
            return Err(ParseError::SyntaxViolation {
                field: "time_scale",
                got: 0,
                constraint: "greater than zero (E.2.1)",
            });
        }

        vui.fixed_frame_rate_flag = r.read_bit()?;
    }

    vui.nal_hrd_parameters_present_flag = r.read_bit()?;
    if vui.nal_hrd_parameters_present_flag {
        parse_hrd(r, &mut vui.nal_hrd_parameters)?;
    }

    vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
    if vui.vcl_hrd_parameters_present_flag {
        parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
    }

    if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
        vui.low_delay_hrd_flag = r.read_bit()?;
    }

    vui.pic_struct_present_flag = r.read_bit()?;
    vui.bitstream_restriction_flag = r.read_bit()?;

    if vui.bitstream_restriction_flag {
        vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
        vui.max_bytes_per_pic_denom = r.read_ue()?;
        vui.max_bits_per_mb_denom = r.read_ue_max("max_bits_per_mb_denom", 16)?;
        vui.log2_max_mv_length_horizontal = r.read_ue_max("log2_max_mv_length_horizontal", 16)?;
        vui.log2_max_mv_length_vertical = r.read_ue_max("log2_max_mv_length_vertical", 16)?;
        vui.max_num_reorder_frames = r.read_ue()?;
        vui.max_dec_frame_buffering = r.read_ue()?;
    }

    Ok(())
}

fn parse_ref_pic_list_modification(
    r: &mut BitReader,
    modifications: &mut Vec<RefPicListModification>,
) -> Result<()> {
    loop {
        let mut modification = RefPicListModification {
            modification_of_pic_nums_idc: r.read_ue_max("modification_of_pic_nums_idc", 3)?,
            ..Default::default()
        };

        match modification.modification_of_pic_nums_idc {
            0 | 1 => modification.abs_diff_pic_num_minus1 = r.read_ue()?,
            2 => modification.long_term_pic_num = r.read_ue()?,
            3 => {
                modifications.push(modification);
                break;
            }
            _ => {
                return Err(ParseError::InternalInvariant(
                    "modification_of_pic_nums_idc out of range",
                ))
            }
        }

        modifications.push(modification);
    }

    Ok(())
}

fn parse_ref_pic_list_modifications(r: &mut BitReader, header: &mut SliceHeader) -> Result<()> {
    if header.slice_type.is_inter() {
        header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
        if header.ref_pic_list_modification_flag_l0 {
            parse_ref_pic_list_modification(r, &mut header.ref_pic_list_modification_l0)?;
        }
    }

    if header.slice_type.is_b() {
        header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
        if header.ref_pic_list_modification_flag_l1 {
            parse_ref_pic_list_modification(r, &mut header.ref_pic_list_modification_l1)?;
        }
    }

    Ok(())
}

fn parse_pred_weight_table(r: &mut BitReader, sps: &Sps, header: &mut SliceHeader) -> Result<()> {
    let table = &mut header.pred_weight_table;
    table.luma_log2_weight_denom = r.read_ue_max("luma_log2_weight_denom", 7)?;

    // Absent luma weights are inferred as 2 ^ luma_log2_weight_denom with a
    // zero offset.
    let default_luma_weight = 1 << table.luma_log2_weight_denom;
    for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
        table.luma_weight_l0[i] = default_luma_weight;
    }

    if header.slice_type.is_b() {
        for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
            table.luma_weight_l1[i] = default_luma_weight;
        }
    }

    let has_chroma = sps.chroma_array_type() != 0;
    if has_chroma {
        table.chroma_log2_weight_denom = r.read_ue_max("chroma_log2_weight_denom", 7)?;

        let default_chroma_weight = 1 << table.chroma_log2_weight_denom;
        for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
            table.chroma_weight_l0[i] = [default_chroma_weight; 2];
        }

        if header.slice_type.is_b() {
            for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                table.chroma_weight_l1[i] = [default_chroma_weight; 2];
            }
        }
    }

    for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
        let luma_weight_l0_flag = r.read_bit()?;
        if luma_weight_l0_flag {
            table.luma_weight_l0[i] = r.read_se_bounded("luma_weight_l0", -128, 127)?;
            table.luma_offset_l0[i] = r.read_se_bounded("luma_offset_l0", -128, 127)?;
        }

        if has_chroma {
            let chroma_weight_l0_flag = r.read_bit()?;
            if chroma_weight_l0_flag {
                for j in 0..2 {
                    table.chroma_weight_l0[i][j] =
                        r.read_se_bounded("chroma_weight_l0", -128, 127)?;
                    table.chroma_offset_l0[i][j] =
                        r.read_se_bounded("chroma_offset_l0", -128, 127)?;
                }
            }
        }
    }

    if header.slice_type.is_b() {
        for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
            let luma_weight_l1_flag = r.read_bit()?;
            if luma_weight_l1_flag {
                table.luma_weight_l1[i] = r.read_se_bounded("luma_weight_l1", -128, 127)?;
                table.luma_offset_l1[i] = r.read_se_bounded("luma_offset_l1", -128, 127)?;
            }

            if has_chroma {
                let chroma_weight_l1_flag = r.read_bit()?;
                if chroma_weight_l1_flag {
                    for j in 0..2 {
                        table.chroma_weight_l1[i][j] =
                            r.read_se_bounded("chroma_weight_l1", -128, 127)?;
                        table.chroma_offset_l1[i][j] =
                            r.read_se_bounded("chroma_offset_l1", -128, 127)?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn parse_dec_ref_pic_marking(
    r: &mut BitReader,
    nalu_header: &NaluHeader,
    header: &mut SliceHeader,
) -> Result<()> {
    let marking = &mut header.dec_ref_pic_marking;

    if nalu_header.idr_pic_flag {
        marking.no_output_of_prior_pics_flag = r.read_bit()?;
        marking.long_term_reference_flag = r.read_bit()?;
        return Ok(());
    }

    marking.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
    if !marking.adaptive_ref_pic_marking_mode_flag {
        return Ok(());
    }

    loop {
        let mmco = r.read_ue_max::<u8>("memory_management_control_operation", 6)?;
        if mmco == 0 {
            break;
        }

        let mut inner = RefPicMarkingInner {
            memory_management_control_operation: mmco,
            ..Default::default()
        };

        if mmco == 1 || mmco == 3 {
            inner.difference_of_pic_nums_minus1 = r.read_ue()?;
        }

        if mmco == 2 {
            inner.long_term_pic_num = r.read_ue()?;
        }

        if mmco == 3 || mmco == 6 {
            inner.long_term_frame_idx = r.read_ue()?;
        }

        if mmco == 4 {
            inner.max_long_term_frame_idx = MaxLongTermFrameIdx::from_value_plus1(r.read_ue()?);
        }

        marking.inner.push(inner);
    }

    Ok(())
}

/// Smallest number of bits that can represent values below `x`,
/// Ceil(Log2(x)).
fn ceil_log2(x: u32) -> usize {
    if x <= 1 {
        0
    } else {
        (32 - (x - 1).leading_zeros()) as usize
    }
}

/// The rest of the slice header, after `pic_parameter_set_id` has resolved
/// the governing PPS and SPS.
fn parse_slice_header_tail(
    r: &mut BitReader,
    header: &mut SliceHeader,
    nalu_header: &NaluHeader,
    pps: &Pps,
) -> Result<()> {
    let sps = &pps.sps;

    if sps.separate_colour_plane_flag {
        header.colour_plane_id = r.read_bits(2)?;
    }

    header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

    if !sps.frame_mbs_only_flag {
        header.field_pic_flag = r.read_bit()?;
        if header.field_pic_flag {
            header.bottom_field_flag = r.read_bit()?;
        }
    }

    header.max_pic_num = if header.field_pic_flag {
        2 * sps.max_frame_num()
    } else {
        sps.max_frame_num()
    };

    if nalu_header.idr_pic_flag {
        header.idr_pic_id = r.read_ue_max("idr_pic_id", 0xffff)?;
    }

    if sps.pic_order_cnt_type == 0 {
        header.pic_order_cnt_lsb =
            r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

        if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
            header.delta_pic_order_cnt_bottom = r.read_se()?;
        }
    }

    if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
        header.delta_pic_order_cnt[0] = r.read_se()?;
        if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
            header.delta_pic_order_cnt[1] = r.read_se()?;
        }
    }

    if pps.redundant_pic_cnt_present_flag {
        header.redundant_pic_cnt = r.read_ue_max("redundant_pic_cnt", 127)?;
    }

    if header.slice_type.is_b() {
        header.direct_spatial_mv_pred_flag = r.read_bit()?;
    }

    if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
        header.num_ref_idx_active_override_flag = r.read_bit()?;
        if header.num_ref_idx_active_override_flag {
            header.num_ref_idx_l0_active_minus1 = r.read_ue_max("num_ref_idx_l0_active_minus1", 31)?;
            if header.slice_type.is_b() {
                header.num_ref_idx_l1_active_minus1 =
                    r.read_ue_max("num_ref_idx_l1_active_minus1", 31)?;
            }
        } else {
            header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
            if header.slice_type.is_b() {
                header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
            }
        }
    }

    // Frame slices are limited to 16 reference indices per list, field
    // slices to 32.
    let ref_idx_limit = if header.field_pic_flag { 31 } else { 15 };
    if header.num_ref_idx_l0_active_minus1 > ref_idx_limit {
        return Err(ParseError::SyntaxViolation {
            field: "num_ref_idx_l0_active_minus1",
            got: i64::from(header.num_ref_idx_l0_active_minus1),
            constraint: "within the limit for the picture coding mode",
        });
    }
    if header.num_ref_idx_l1_active_minus1 > ref_idx_limit {
        return Err(ParseError::SyntaxViolation {
            field: "num_ref_idx_l1_active_minus1",
            got: i64::from(header.num_ref_idx_l1_active_minus1),
            constraint: "within the limit for the picture coding mode",
        });
    }

    parse_ref_pic_list_modifications(r, header)?;

    if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
        || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
    {
        parse_pred_weight_table(r, sps, header)?;
    }

    if nalu_header.ref_idc != 0 {
        parse_dec_ref_pic_marking(r, nalu_header, header)?;
    }

    if pps.entropy_coding_mode_flag && header.slice_type.is_inter() {
        header.cabac_init_idc = r.read_ue_max("cabac_init_idc", 2)?;
    }

    header.slice_qp_delta = r.read_se_bounded("slice_qp_delta", -87, 77)?;

    if header.slice_type.is_sp() || header.slice_type.is_si() {
        if header.slice_type.is_sp() {
            header.sp_for_switch_flag = r.read_bit()?;
        }

        header.slice_qs_delta = r.read_se_bounded("slice_qs_delta", -51, 51)?;
    }

    if pps.deblocking_filter_control_present_flag {
        header.disable_deblocking_filter_idc = r.read_ue_max("disable_deblocking_filter_idc", 2)?;

        if header.disable_deblocking_filter_idc != 1 {
            header.slice_alpha_c0_offset_div2 =
                r.read_se_bounded("slice_alpha_c0_offset_div2", -6, 6)?;
            header.slice_beta_offset_div2 = r.read_se_bounded("slice_beta_offset_div2", -6, 6)?;
        }
    }

    if let Some(groups) = &pps.slice_groups {
        if (3..=5).contains(&groups.map_type) {
            let cycle_values = sps.pic_size_in_map_units() / groups.change_rate() + 1;
            header.slice_group_change_cycle = r.read_bits(ceil_log2(cycle_values))?;
        }
    }

    header.header_bit_size = r.position();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nalu::AnnexBReader;

    fn single_nalu(stream: &[u8]) -> Nalu {
        let mut reader = AnnexBReader::new(stream);
        reader.next_nalu().unwrap().unwrap()
    }

    // A well-formed Baseline SPS: 352x288, frame_mbs_only, no cropping, no
    // VUI.
    const SPS_STREAM: [u8; 12] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x0a, 0xf8, 0x2c, 0x25, 0x10,
    ];

    // The PPS payload from a real conformance stream: CAVLC, one slice
    // group, all defaults.
    const PPS_STREAM: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x38, 0x80];

    #[test]
    fn parses_baseline_sps() {
        let mut stream = VideoStream::new();
        let nalu = single_nalu(&SPS_STREAM);
        let sps = stream.parse_sps(&nalu).unwrap();

        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.profile_idc, Profile::Baseline as u8);
        assert_eq!(sps.level_idc, Level::L1);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.chroma_array_type(), 1);
        assert_eq!(sps.pic_width_in_mbs_minus1, 21);
        assert_eq!(sps.pic_height_in_map_units_minus1, 17);
        assert!(sps.frame_mbs_only_flag);
        assert_eq!(sps.width(), 352);
        assert_eq!(sps.height(), 288);
        assert_eq!(sps.bit_depth_luma(), 8);
        assert_eq!(sps.bit_depth_chroma(), 8);
        assert_eq!(sps.qp_bd_offset_y(), 0);
        assert_eq!(sps.max_frame_num(), 16);
        assert_eq!(sps.mb_width_height_c(), (8, 8));
        assert_eq!(sps.raw_mb_bits(), 3072);
        assert_eq!(sps.frame_height_in_mbs(), 18);

        // No cropping: the visible rectangle is the coded picture.
        let rect = sps.visible_rectangle();
        assert_eq!((rect.max.x, rect.max.y), (352, 288));

        // Scaling lists default to flat 16s outside the high profiles.
        assert!(sps
            .scaling_lists_4x4
            .iter()
            .all(|list| list.iter().all(|&v| v == 16)));
    }

    #[test]
    fn rejects_sps_with_oversized_crop() {
        // From a fuzzed stream: crop offsets larger than the picture.
        let stream = [
            0x00, 0x00, 0x01, 0x07, 0x00, 0x00, 0x0a, 0xfb, 0xb0, 0x32, 0xc0, 0xca, 0x80,
        ];

        let mut video_stream = VideoStream::new();
        let nalu = single_nalu(&stream);
        assert!(video_stream.parse_sps(&nalu).is_err());
        assert!(video_stream.sps(0).is_none());
    }

    #[test]
    fn parses_pps_against_known_sps() {
        let mut stream = VideoStream::new();
        stream.parse_sps(&single_nalu(&SPS_STREAM)).unwrap();

        let pps = stream.parse_pps(&single_nalu(&PPS_STREAM)).unwrap();
        assert_eq!(pps.pic_parameter_set_id, 0);
        assert_eq!(pps.seq_parameter_set_id, 0);
        assert!(!pps.entropy_coding_mode_flag);
        assert!(!pps.bottom_field_pic_order_in_frame_present_flag);
        assert_eq!(pps.num_slice_groups_minus1, 0);
        assert!(pps.slice_groups.is_none());
        assert_eq!(pps.num_ref_idx_l0_default_active_minus1, 0);
        assert!(!pps.weighted_pred_flag);
        assert_eq!(pps.pic_init_qp_minus26, 0);
        assert_eq!(pps.chroma_qp_index_offset, 0);
        assert_eq!(pps.second_chroma_qp_index_offset, 0);
        assert!(!pps.transform_8x8_mode_flag);
        assert_eq!(pps.sps.width(), 352);

        // Scaling lists inherited from the SPS.
        assert!(pps
            .scaling_lists_8x8
            .iter()
            .all(|list| list.iter().all(|&v| v == 16)));
    }

    #[test]
    fn pps_with_unknown_sps_is_unresolved() {
        // pic_parameter_set_id 0, seq_parameter_set_id 5.
        let stream = [0x00, 0x00, 0x00, 0x01, 0x68, 0x9a, 0x00];

        let mut video_stream = VideoStream::new();
        let err = video_stream.parse_pps(&single_nalu(&stream)).unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnresolvedReference {
                kind: ParameterSetKind::Sps,
                id: 5,
            }
        ));
        assert!(video_stream.pps(0).is_none());
    }

    #[test]
    fn slice_with_unknown_pps_is_unresolved() {
        // first_mb_in_slice 0, slice_type 7 (I), pic_parameter_set_id 1.
        let stream = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x48];

        let mut video_stream = VideoStream::new();
        let err = video_stream.parse_slice(&single_nalu(&stream)).unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnresolvedReference {
                kind: ParameterSetKind::Pps,
                id: 1,
            }
        ));
        assert!(video_stream.slices().is_empty());
    }

    // An IDR slice against the parameter sets above: I slice, frame 0, one
    // I_NxN macroblock with coded_block_pattern 0.
    const IDR_SLICE_STREAM: [u8; 11] = [
        0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x0f, 0xff, 0xfe, 0x48,
    ];

    #[test]
    fn parses_idr_slice_header_and_data() {
        let mut stream = VideoStream::new();
        stream.parse_sps(&single_nalu(&SPS_STREAM)).unwrap();
        stream.parse_pps(&single_nalu(&PPS_STREAM)).unwrap();

        let slice = stream
            .parse_slice(&single_nalu(&IDR_SLICE_STREAM))
            .unwrap()
            .clone();
        assert_eq!(slice.sps_id, 0);
        assert_eq!(slice.pps_id, 0);
        assert_eq!(slice.nal_ref_idc, 3);
        assert_eq!(slice.nalu_type, NaluType::SliceIdr);

        let header = &slice.header;
        assert_eq!(header.first_mb_in_slice, 0);
        assert_eq!(header.slice_type_raw, 7);
        assert!(header.slice_type.is_i());
        assert_eq!(header.frame_num, 0);
        assert!(!header.field_pic_flag);
        assert_eq!(header.idr_pic_id, 0);
        assert_eq!(header.pic_order_cnt_lsb, 0);
        assert_eq!(header.slice_qp_delta, 0);
        assert_eq!(header.max_pic_num, 16);
        assert_eq!(header.header_bit_size, 21);

        // The slice data is a single I_NxN macroblock without residuals.
        assert!(slice.data.fully_parsed);
        assert_eq!(slice.data.macroblocks.len(), 1);

        // Referential integrity: the slice resolves transitively to the SPS.
        let pps = stream.pps(slice.pps_id).unwrap();
        assert!(stream.sps(pps.seq_parameter_set_id).is_some());
    }

    #[test]
    fn parameter_sets_overwrite_by_id() {
        let mut stream = VideoStream::new();
        stream.parse_sps(&single_nalu(&SPS_STREAM)).unwrap();
        let first = Rc::clone(stream.sps(0).unwrap());

        stream.parse_sps(&single_nalu(&SPS_STREAM)).unwrap();
        let second = stream.sps(0).unwrap();

        // Same id: the newer set replaced the older one.
        assert!(!Rc::ptr_eq(&first, second));
        assert_eq!(first.as_ref(), second.as_ref());
    }

    #[test]
    fn ceil_log2_boundaries() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn max_long_term_frame_idx_plus1_round_trip() {
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(0),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(25),
            MaxLongTermFrameIdx::Idx(24)
        );
        assert_eq!(MaxLongTermFrameIdx::Idx(24).to_value_plus1(), 25);
        assert_eq!(
            MaxLongTermFrameIdx::NoLongTermFrameIndices.to_value_plus1(),
            0
        );
    }
}
