// SPDX-License-Identifier: GPL-3.0-only

//! Metadata attached to virtual frame buffers for their consumer.

use crate::{
    backend::render::ColorGamut,
    utils::geometry::{empty_rect, RectI, RectIExt},
};
use bytemuck::{Pod, Zeroable};

pub const ROI_REGIONS_MAX_CNT: usize = 8;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum MetadataError {
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("no buffer to attach metadata to")]
    NoBuffer,
    #[error("metadata conversion failed")]
    ApiFailed,
    #[error("frame is not initialized")]
    NotInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    ColorSpaceInfo,
    RoiInfo,
    HdrColorSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpaceType {
    SrgbFull,
    P3Full,
    Bt2020HlgFull,
    Bt2100HlgFull,
}

/// Gamut to colour space lookup. `Native` has no fixed colour space.
pub fn color_space_type(gamut: ColorGamut) -> Option<ColorSpaceType> {
    match gamut {
        ColorGamut::Srgb => Some(ColorSpaceType::SrgbFull),
        ColorGamut::DisplayP3 => Some(ColorSpaceType::P3Full),
        ColorGamut::Bt2020 => Some(ColorSpaceType::Bt2020HlgFull),
        ColorGamut::Bt2100Hlg => Some(ColorSpaceType::Bt2100HlgFull),
        ColorGamut::Native => None,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ColorSpaceInfo {
    pub primaries: u32,
    pub transfer: u32,
    pub matrix: u32,
    pub range: u32,
}

// H.273 code points
const PRIMARIES_BT709: u32 = 1;
const PRIMARIES_BT2020: u32 = 9;
const PRIMARIES_P3_D65: u32 = 12;
const TRANSFER_SRGB: u32 = 13;
const TRANSFER_HLG: u32 = 18;
const MATRIX_BT709: u32 = 1;
const MATRIX_BT2020: u32 = 9;
const RANGE_FULL: u32 = 1;

pub fn convert_color_space_type_to_info(ty: ColorSpaceType) -> ColorSpaceInfo {
    let (primaries, transfer, matrix) = match ty {
        ColorSpaceType::SrgbFull => (PRIMARIES_BT709, TRANSFER_SRGB, MATRIX_BT709),
        ColorSpaceType::P3Full => (PRIMARIES_P3_D65, TRANSFER_SRGB, MATRIX_BT709),
        ColorSpaceType::Bt2020HlgFull | ColorSpaceType::Bt2100HlgFull => {
            (PRIMARIES_BT2020, TRANSFER_HLG, MATRIX_BT2020)
        }
    };
    ColorSpaceInfo {
        primaries,
        transfer,
        matrix,
        range: RANGE_FULL,
    }
}

pub fn convert_metadata_to_vec<T: Pod>(metadata: &T) -> Result<Vec<u8>, MetadataError> {
    let bytes = bytemuck::bytes_of(metadata);
    if bytes.is_empty() {
        return Err(MetadataError::ApiFailed);
    }
    Ok(bytes.to_vec())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RoiRegionInfo {
    pub start_x: i32,
    pub start_y: i32,
    pub width: i32,
    pub height: i32,
}

impl From<RectI> for RoiRegionInfo {
    fn from(rect: RectI) -> RoiRegionInfo {
        RoiRegionInfo {
            start_x: rect.loc.x,
            start_y: rect.loc.y,
            width: rect.size.w,
            height: rect.size.h,
        }
    }
}

/// Changed regions of a frame, as handed to the encoder.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RoiRegions {
    pub region_cnt: u32,
    pub regions: [RoiRegionInfo; ROI_REGIONS_MAX_CNT],
}

impl RoiRegions {
    /// Clips the damage to `screen`. More rectangles than the encoder takes
    /// collapse into their bounding box.
    pub fn from_damage(damage: &[RectI], screen: RectI) -> RoiRegions {
        let mut roi = RoiRegions::default();
        if damage.len() <= ROI_REGIONS_MAX_CNT {
            for rect in damage {
                roi.push(rect.intersect_rect(&screen));
            }
        } else {
            let merged = damage
                .iter()
                .fold(empty_rect(), |merged, rect| merged.join_rect(rect));
            roi.push(merged.intersect_rect(&screen));
        }
        roi
    }

    fn push(&mut self, rect: RectI) {
        let count = self.region_cnt as usize;
        if rect.is_empty_rect() || count >= ROI_REGIONS_MAX_CNT {
            return;
        }
        self.regions[count] = rect.into();
        self.region_cnt += 1;
    }

    pub fn regions(&self) -> &[RoiRegionInfo] {
        &self.regions[..self.region_cnt as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::geometry::{rect_from_ltrb, rect_from_xywh};

    #[test]
    fn roi_keeps_rects_below_cap() {
        let screen = rect_from_xywh(0, 0, 100, 100);
        let damage = [
            rect_from_ltrb(0, 0, 10, 10),
            rect_from_ltrb(90, 90, 120, 120),
            rect_from_ltrb(200, 200, 210, 210),
            rect_from_ltrb(20, 20, 30, 40),
        ];
        let roi = RoiRegions::from_damage(&damage, screen);
        assert_eq!(
            roi.regions(),
            &[
                RoiRegionInfo { start_x: 0, start_y: 0, width: 10, height: 10 },
                RoiRegionInfo { start_x: 90, start_y: 90, width: 10, height: 10 },
                RoiRegionInfo { start_x: 20, start_y: 20, width: 10, height: 20 },
            ]
        );
    }

    #[test]
    fn roi_merges_above_cap() {
        let screen = rect_from_xywh(0, 0, 100, 100);
        for count in [ROI_REGIONS_MAX_CNT, ROI_REGIONS_MAX_CNT + 1, 3 * ROI_REGIONS_MAX_CNT] {
            let damage: Vec<_> = (0..count as i32)
                .map(|i| rect_from_xywh(i * 10, i * 5, 5, 5))
                .collect();
            let roi = RoiRegions::from_damage(&damage, screen);
            if count <= ROI_REGIONS_MAX_CNT {
                assert_eq!(roi.regions().len(), count);
            } else {
                assert_eq!(roi.regions().len(), 1);
                let bounds = damage
                    .iter()
                    .fold(empty_rect(), |m, r| m.join_rect(r))
                    .intersect_rect(&screen);
                assert_eq!(roi.regions()[0], RoiRegionInfo::from(bounds));
            }
        }
        assert!(RoiRegions::from_damage(&[], screen).regions().is_empty());
    }

    #[test]
    fn metadata_encoding() {
        let info = convert_color_space_type_to_info(ColorSpaceType::P3Full);
        let bytes = convert_metadata_to_vec(&info).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytemuck::pod_read_unaligned::<ColorSpaceInfo>(&bytes), info);

        let roi = RoiRegions::from_damage(&[rect_from_xywh(1, 2, 3, 4)], rect_from_xywh(0, 0, 10, 10));
        let bytes = convert_metadata_to_vec(&roi).unwrap();
        assert_eq!(bytes.len(), std::mem::size_of::<RoiRegions>());
        assert_eq!(&bytes[..4], &1u32.to_ne_bytes());
        assert_eq!(color_space_type(ColorGamut::Native), None);
    }
}
